//! Listener registry — which sessions receive a board's updates.
//!
//! DESIGN
//! ======
//! Owner-side map of board id → subscribed sessions. Each board's set sits
//! behind its own lock; the outer map lock is held only to find, create,
//! or drop a set, never during a fan-out.
//!
//! Broadcast holds its board's read lock for the whole fan-out, so a
//! concurrent subscribe/unsubscribe on that board waits for it to finish
//! while other boards proceed. Delivery is best-effort: a session whose
//! queue is full or closed is skipped, never removed. Removal happens
//! only on UNLISTEN or when the session closes. An emptied set stays
//! until its board is removed.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::board::BoardId;
use crate::protocol::Message;
use crate::session::{SessionHandle, SessionId};

type ListenerSet = Arc<RwLock<HashMap<SessionId, SessionHandle>>>;

#[derive(Default)]
pub struct ListenerRegistry {
    boards: RwLock<HashMap<BoardId, ListenerSet>>,
}

impl ListenerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    async fn set(&self, board_id: &BoardId) -> Option<ListenerSet> {
        self.boards.read().await.get(board_id).cloned()
    }

    async fn set_or_create(&self, board_id: &BoardId) -> ListenerSet {
        if let Some(set) = self.set(board_id).await {
            return set;
        }
        Arc::clone(self.boards.write().await.entry(board_id.clone()).or_default())
    }

    /// Idempotent add. Returns true if the session was not yet listening.
    pub async fn subscribe(&self, board_id: &BoardId, session: SessionHandle) -> bool {
        let set = self.set_or_create(board_id).await;
        let added = set.write().await.insert(session.id(), session).is_none();
        if added {
            debug!(%board_id, "listener added");
        }
        added
    }

    /// Idempotent remove. Returns true if the session was listening.
    pub async fn unsubscribe(&self, board_id: &BoardId, session_id: SessionId) -> bool {
        let Some(set) = self.set(board_id).await else {
            return false;
        };
        let removed = set.write().await.remove(&session_id).is_some();
        if removed {
            debug!(%board_id, session = %session_id, "listener removed");
        }
        removed
    }

    /// Send `message` to every session listening on `board_id`. Returns
    /// how many sends were queued.
    pub async fn broadcast(&self, board_id: &BoardId, message: &Message) -> usize {
        let Some(set) = self.set(board_id).await else {
            return 0;
        };
        let listeners = set.read().await;

        let mut queued = 0;
        for session in listeners.values() {
            match session.send(message) {
                Ok(()) => queued += 1,
                Err(e) => warn!(%board_id, session = %session.id(), event = message.event(), error = %e, "broadcast skipped listener"),
            }
        }
        queued
    }

    #[must_use]
    pub async fn contains(&self, board_id: &BoardId, session_id: SessionId) -> bool {
        let Some(set) = self.set(board_id).await else {
            return false;
        };
        let listeners = set.read().await;
        listeners.contains_key(&session_id)
    }

    #[must_use]
    pub async fn count(&self, board_id: &BoardId) -> usize {
        let Some(set) = self.set(board_id).await else {
            return 0;
        };
        let listeners = set.read().await;
        listeners.len()
    }

    /// Drop `session_id` from every board. Returns the boards it left.
    pub async fn remove_session(&self, session_id: SessionId) -> Vec<BoardId> {
        let sets: Vec<(BoardId, ListenerSet)> = self
            .boards
            .read()
            .await
            .iter()
            .map(|(board_id, set)| (board_id.clone(), Arc::clone(set)))
            .collect();

        let mut left = Vec::new();
        for (board_id, set) in sets {
            if set.write().await.remove(&session_id).is_some() {
                left.push(board_id);
            }
        }
        left
    }

    /// Drop a board's whole listener set. Returns the sessions that were
    /// listening.
    pub async fn remove_board(&self, board_id: &BoardId) -> Vec<SessionHandle> {
        let Some(set) = self.boards.write().await.remove(board_id) else {
            return Vec::new();
        };
        let mut listeners = set.write().await;
        listeners.drain().map(|(_, session)| session).collect()
    }
}

#[cfg(test)]
#[path = "listeners_test.rs"]
mod tests;
