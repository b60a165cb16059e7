//! Change notifications for whatever presents boards (console, GUI, logs).
//!
//! The replication core holds no rendering state. Every accepted local or
//! remote change is published here; observers redraw from `snapshot()`.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

use crate::board::BoardId;

const EVENT_CAPACITY: usize = 256;

/// Why a board left this peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Removal {
    /// Deleted here, or the owner announced BOARD_DELETED.
    Deleted,
    /// Owner stopped sharing it.
    Unshared,
    /// The link to the owner closed.
    Disconnected,
    /// This peer stopped mirroring it.
    Unsubscribed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BoardEvent {
    Created { id: BoardId },
    /// Board content changed; `version` is the new version.
    Updated { id: BoardId, version: u64 },
    /// A local proposal lost the race. Redraw from the board's state.
    Rejected { id: BoardId, current: u64 },
    /// A local edit on a mirror was sent to the owner.
    Forwarded { id: BoardId, base_version: u64 },
    /// A mirror received its first snapshot.
    Mirrored { id: BoardId, version: u64 },
    Shared { id: BoardId },
    Unshared { id: BoardId },
    Removed { id: BoardId, reason: Removal },
}

impl BoardEvent {
    #[must_use]
    pub fn board_id(&self) -> &BoardId {
        match self {
            Self::Created { id }
            | Self::Updated { id, .. }
            | Self::Rejected { id, .. }
            | Self::Forwarded { id, .. }
            | Self::Mirrored { id, .. }
            | Self::Shared { id }
            | Self::Unshared { id }
            | Self::Removed { id, .. } => id,
        }
    }
}

/// Fan-out of `BoardEvent`s to any number of observers. Slow observers
/// lag and lose old events; publishing never waits.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<BoardEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }
}

impl EventBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, event: BoardEvent) {
        match self.tx.send(event) {
            Ok(observers) => trace!(observers, "board event published"),
            Err(broadcast::error::SendError(event)) => trace!(?event, "board event without observers"),
        }
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<BoardEvent> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
#[path = "events_test.rs"]
mod tests;
