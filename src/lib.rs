//! Peer-to-peer shared whiteboard boards.
//!
//! ARCHITECTURE
//! ============
//! Every board has one owner, the peer whose `host:port` prefixes its id.
//! The owner is the single serializer of mutations: proposals carry the
//! version they were built on and only the current version is accepted.
//! Other peers hold read-only mirrors that adopt whatever the owner pushes.
//!
//! - `board`: identifiers, the `%` payload grammar, the version state machine
//! - `protocol`: the typed message vocabulary
//! - `session`: one framed link to one peer, single dispatch point
//! - `listeners`, `directory`: owner fan-out sets and per-board locks
//! - `replication`: owner and subscriber roles
//! - `discovery`, `index`: the directory service and its client

pub mod board;
pub mod config;
pub mod directory;
pub mod discovery;
pub mod events;
pub mod index;
pub mod listeners;
pub mod protocol;
pub mod replication;
pub mod session;

pub use board::{BoardId, BoardState, Path, PeerAddr, Proposal};
pub use config::PeerConfig;
pub use events::BoardEvent;
pub use replication::{EditOutcome, ReplicationController, ReplicationError};
