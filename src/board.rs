//! Board document — identifier grammar, snapshot payload, and the
//! optimistic-concurrency state machine.
//!
//! DESIGN
//! ======
//! A `BoardState` is the authoritative document at its owner and a
//! read-only mirror everywhere else. Every mutation is a proposal carrying
//! the version the caller built it against. The owner accepts iff that
//! base version equals the current one, so the version doubles as the
//! sole conflict detector: accepted proposals bump it by exactly one,
//! rejected proposals leave the board untouched.
//!
//! Callers serialize proposals per board (lock-per-board in the
//! directory); nothing here is internally synchronized.
//!
//! WIRE GRAMMAR
//! ============
//! - identifier: `host:port:boardid`
//! - payload:    `identifier%version%path1%path2%...`

use std::fmt;
use std::str::FromStr;

use serde::{Serialize, Serializer};

use crate::protocol::ErrorCode;

/// Separates identifier, version, and path fragments in a payload.
pub const FIELD_SEPARATOR: char = '%';

/// Separates host, port, and board name in an identifier.
pub const ID_SEPARATOR: char = ':';

// =============================================================================
// ERRORS
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BoardError {
    #[error("malformed board identifier: {0}")]
    MalformedIdentifier(String),
    #[error("malformed peer address: {0}")]
    MalformedPeer(String),
    #[error("malformed board payload: {0}")]
    MalformedPayload(String),
    #[error("invalid path fragment: {0:?}")]
    InvalidPath(String),
}

impl ErrorCode for BoardError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::MalformedIdentifier(_) => "E_MALFORMED_IDENTIFIER",
            Self::MalformedPeer(_) => "E_MALFORMED_PEER",
            Self::MalformedPayload(_) => "E_MALFORMED_PAYLOAD",
            Self::InvalidPath(_) => "E_INVALID_PATH",
        }
    }
}

// =============================================================================
// PATH
// =============================================================================

/// One drawing gesture. Opaque to replication; only `%` is forbidden
/// because it would split the payload grammar.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct Path(String);

impl Path {
    /// Wrap a raw path fragment.
    ///
    /// # Errors
    ///
    /// Returns `InvalidPath` for an empty fragment or one containing `%`.
    pub fn new(raw: impl Into<String>) -> Result<Self, BoardError> {
        let raw = raw.into();
        if raw.is_empty() || raw.contains(FIELD_SEPARATOR) {
            return Err(BoardError::InvalidPath(raw));
        }
        Ok(Self(raw))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Path {
    type Err = BoardError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

// =============================================================================
// PEER ADDRESS
// =============================================================================

/// `host:port` of a peer's listening endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerAddr {
    pub host: String,
    pub port: u16,
}

impl PeerAddr {
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self { host: host.into(), port }
    }
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{ID_SEPARATOR}{}", self.host, self.port)
    }
}

impl FromStr for PeerAddr {
    type Err = BoardError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some((host, port)) = s.rsplit_once(ID_SEPARATOR) else {
            return Err(BoardError::MalformedPeer(s.to_owned()));
        };
        if !valid_segment(host) {
            return Err(BoardError::MalformedPeer(s.to_owned()));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| BoardError::MalformedPeer(s.to_owned()))?;
        Ok(Self::new(host, port))
    }
}

impl Serialize for PeerAddr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

fn valid_segment(segment: &str) -> bool {
    !segment.is_empty() && !segment.contains(ID_SEPARATOR) && !segment.contains(FIELD_SEPARATOR)
}

// =============================================================================
// BOARD IDENTIFIER
// =============================================================================

/// `host:port:boardid`. The `host:port` prefix names the owning peer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BoardId {
    owner: PeerAddr,
    name: String,
}

impl BoardId {
    /// Build an identifier for a board owned by `owner`.
    ///
    /// # Errors
    ///
    /// Returns `MalformedIdentifier` if `name` is empty or contains `:`/`%`.
    pub fn new(owner: PeerAddr, name: impl Into<String>) -> Result<Self, BoardError> {
        let name = name.into();
        if !valid_segment(&name) || !valid_segment(&owner.host) {
            return Err(BoardError::MalformedIdentifier(format!("{owner}{ID_SEPARATOR}{name}")));
        }
        Ok(Self { owner, name })
    }

    /// The owning peer's `host:port`.
    #[must_use]
    pub fn owner(&self) -> &PeerAddr {
        &self.owner
    }

    /// The peer-local board name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for BoardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{ID_SEPARATOR}{}", self.owner, self.name)
    }
}

impl FromStr for BoardId {
    type Err = BoardError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || BoardError::MalformedIdentifier(s.to_owned());
        let mut parts = s.split(ID_SEPARATOR);
        let (Some(host), Some(port), Some(name), None) = (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(malformed());
        };
        if !valid_segment(host) || !valid_segment(name) {
            return Err(malformed());
        }
        let port = port.parse::<u16>().map_err(|_| malformed())?;
        Ok(Self { owner: PeerAddr::new(host, port), name: name.to_owned() })
    }
}

impl Serialize for BoardId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

// =============================================================================
// PAYLOAD
// =============================================================================

/// `identifier%version%paths` — the body of every snapshot, update, and
/// relayed proposal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoardPayload {
    pub id: BoardId,
    pub version: u64,
    pub paths: Vec<Path>,
}

impl BoardPayload {
    /// The most recently appended path, if any.
    #[must_use]
    pub fn last_path(&self) -> Option<&Path> {
        self.paths.last()
    }
}

impl fmt::Display for BoardPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{FIELD_SEPARATOR}{}{FIELD_SEPARATOR}", self.id, self.version)?;
        for (i, path) in self.paths.iter().enumerate() {
            if i > 0 {
                write!(f, "{FIELD_SEPARATOR}")?;
            }
            f.write_str(path.as_str())?;
        }
        Ok(())
    }
}

impl FromStr for BoardPayload {
    type Err = BoardError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || BoardError::MalformedPayload(s.to_owned());

        // Identifier is everything before the first separator.
        let Some((id, rest)) = s.split_once(FIELD_SEPARATOR) else {
            return Err(malformed());
        };
        let id = id.parse::<BoardId>()?;

        let (version, paths) = rest.split_once(FIELD_SEPARATOR).unwrap_or((rest, ""));
        let version = version.parse::<u64>().map_err(|_| malformed())?;

        let paths = paths
            .split(FIELD_SEPARATOR)
            .filter(|fragment| !fragment.is_empty())
            .map(Path::new)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { id, version, paths })
    }
}

// =============================================================================
// PROPOSAL RESULT
// =============================================================================

/// Outcome of a version-checked mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Proposal {
    /// Applied; carries the new version.
    Accepted(u64),
    /// Not applied; carries the version the proposer must resync to.
    Rejected { current: u64 },
}

impl Proposal {
    #[must_use]
    pub fn is_accepted(self) -> bool {
        matches!(self, Self::Accepted(_))
    }
}

/// A proposed change, independent of where it was proposed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    AddPath(Path),
    Undo,
    Clear,
}

impl Mutation {
    /// Short label for logs.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AddPath(_) => "path",
            Self::Undo => "undo",
            Self::Clear => "clear",
        }
    }
}

// =============================================================================
// BOARD STATE
// =============================================================================

/// One board: ordered paths plus a version counter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoardState {
    id: BoardId,
    version: u64,
    paths: Vec<Path>,
    owned: bool,
    shared: bool,
}

impl BoardState {
    /// A fresh board owned by this process, version 0, not shared.
    #[must_use]
    pub fn new_owned(id: BoardId) -> Self {
        Self { id, version: 0, paths: Vec::new(), owned: true, shared: false }
    }

    /// An empty mirror awaiting its first owner snapshot.
    #[must_use]
    pub fn new_mirror(id: BoardId) -> Self {
        Self { id, version: 0, paths: Vec::new(), owned: false, shared: false }
    }

    #[must_use]
    pub fn id(&self) -> &BoardId {
        &self.id
    }

    #[must_use]
    pub fn version(&self) -> u64 {
        self.version
    }

    #[must_use]
    pub fn paths(&self) -> &[Path] {
        &self.paths
    }

    #[must_use]
    pub fn is_owned(&self) -> bool {
        self.owned
    }

    #[must_use]
    pub fn is_shared(&self) -> bool {
        self.owned && self.shared
    }

    /// Toggle sharing. Mirrors cannot be shared; returns whether the flag
    /// actually changed.
    pub fn set_shared(&mut self, shared: bool) -> bool {
        if !self.owned || self.shared == shared {
            return false;
        }
        self.shared = shared;
        true
    }

    /// Append `path` if `base_version` is current.
    pub fn propose_add_path(&mut self, path: Path, base_version: u64) -> Proposal {
        if base_version != self.version {
            return Proposal::Rejected { current: self.version };
        }
        self.paths.push(path);
        self.bump()
    }

    /// Remove the last path if `base_version` is current. Undo on an empty
    /// board is rejected: there is no mutation to version.
    pub fn propose_undo(&mut self, base_version: u64) -> Proposal {
        if base_version != self.version || self.paths.is_empty() {
            return Proposal::Rejected { current: self.version };
        }
        self.paths.pop();
        self.bump()
    }

    /// Drop every path if `base_version` is current.
    pub fn propose_clear(&mut self, base_version: u64) -> Proposal {
        if base_version != self.version {
            return Proposal::Rejected { current: self.version };
        }
        self.paths.clear();
        self.bump()
    }

    /// Dispatch a `Mutation` to the matching `propose_*`.
    pub fn propose(&mut self, mutation: Mutation, base_version: u64) -> Proposal {
        match mutation {
            Mutation::AddPath(path) => self.propose_add_path(path, base_version),
            Mutation::Undo => self.propose_undo(base_version),
            Mutation::Clear => self.propose_clear(base_version),
        }
    }

    fn bump(&mut self) -> Proposal {
        self.version += 1;
        Proposal::Accepted(self.version)
    }

    /// Replace paths and version with an owner-pushed snapshot. Mirrors
    /// trust the owner unconditionally; returns the version replaced.
    pub fn adopt(&mut self, payload: BoardPayload) -> u64 {
        let previous = self.version;
        self.version = payload.version;
        self.paths = payload.paths;
        previous
    }

    /// Snapshot as a payload value.
    #[must_use]
    pub fn payload(&self) -> BoardPayload {
        BoardPayload { id: self.id.clone(), version: self.version, paths: self.paths.clone() }
    }

    /// `identifier%version%path1%path2...`
    #[must_use]
    pub fn serialize(&self) -> String {
        self.payload().to_string()
    }

    /// Parse a serialized board into a mirror.
    ///
    /// # Errors
    ///
    /// Returns a `BoardError` if the identifier, version, or any path
    /// fragment is malformed.
    pub fn deserialize(payload: &str) -> Result<Self, BoardError> {
        let payload = payload.parse::<BoardPayload>()?;
        let mut board = Self::new_mirror(payload.id.clone());
        board.adopt(payload);
        Ok(board)
    }
}

#[cfg(test)]
#[path = "board_test.rs"]
mod tests;
