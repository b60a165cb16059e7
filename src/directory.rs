//! Peer directory — the boards this peer holds and the links it has open.
//!
//! DESIGN
//! ======
//! - `boards`: board id → entry. Each board has its own
//!   `Arc<Mutex<BoardState>>`, so proposals on unrelated boards never
//!   contend. The map lock is held only to look up, insert, or remove.
//! - `links`: owner `host:port` → outbound session. One link per owner,
//!   shared by every board mirrored from it.
//! - `pending`: mirrors waiting for their first snapshot.
//! - `joining`: mirrors whose subscribe has not finished. A mirror joins
//!   from the moment it is registered until `mark_ready` or removal.
//!
//! LOCK ORDER
//! ==========
//! board mutex → map locks here → listener registry. A board lock may be
//! held while briefly taking a map lock; a map lock is never held while
//! waiting on a board.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use tokio::sync::{Mutex, RwLock, oneshot};
use tracing::debug;

use crate::board::{BoardId, BoardState, PeerAddr};
use crate::session::{SessionHandle, SessionId};

pub type SharedBoard = Arc<Mutex<BoardState>>;

/// How this peer holds a board.
#[derive(Debug, Clone)]
pub enum Role {
    /// Authoritative copy.
    Owned,
    /// Read-only copy fed by the owner over `session`.
    Mirror { session: SessionHandle },
}

#[derive(Debug, Clone)]
pub struct BoardEntry {
    pub board: SharedBoard,
    pub role: Role,
}

impl BoardEntry {
    #[must_use]
    pub fn is_owned(&self) -> bool {
        matches!(self.role, Role::Owned)
    }

    /// The link a mirror is fed by.
    #[must_use]
    pub fn mirror_session(&self) -> Option<&SessionHandle> {
        match &self.role {
            Role::Owned => None,
            Role::Mirror { session } => Some(session),
        }
    }
}

pub struct PeerDirectory {
    local: PeerAddr,
    boards: RwLock<HashMap<BoardId, BoardEntry>>,
    links: Mutex<HashMap<PeerAddr, SessionHandle>>,
    pending: StdMutex<HashMap<BoardId, oneshot::Sender<u64>>>,
    joining: StdMutex<HashSet<BoardId>>,
}

impl PeerDirectory {
    #[must_use]
    pub fn new(local: PeerAddr) -> Self {
        Self {
            local,
            boards: RwLock::new(HashMap::new()),
            links: Mutex::new(HashMap::new()),
            pending: StdMutex::new(HashMap::new()),
            joining: StdMutex::new(HashSet::new()),
        }
    }

    #[must_use]
    pub fn local(&self) -> &PeerAddr {
        &self.local
    }

    /// True iff this peer owns boards named under `id`'s `host:port`.
    #[must_use]
    pub fn is_local(&self, id: &BoardId) -> bool {
        id.owner() == &self.local
    }

    // =========================================================================
    // BOARDS
    // =========================================================================

    /// Register a board. Returns `None` if the id is already present.
    pub async fn insert(&self, board: BoardState, role: Role) -> Option<SharedBoard> {
        let mut boards = self.boards.write().await;
        if boards.contains_key(board.id()) {
            return None;
        }
        let id = board.id().clone();
        if matches!(role, Role::Mirror { .. }) {
            self.joining_set().insert(id.clone());
        }
        let shared = Arc::new(Mutex::new(board));
        debug!(board_id = %id, owned = matches!(role, Role::Owned), "board registered");
        boards.insert(id, BoardEntry { board: Arc::clone(&shared), role });
        Some(shared)
    }

    #[must_use]
    pub async fn get(&self, id: &BoardId) -> Option<BoardEntry> {
        self.boards.read().await.get(id).cloned()
    }

    pub async fn remove(&self, id: &BoardId) -> Option<BoardEntry> {
        let removed = self.boards.write().await.remove(id);
        if removed.is_some() {
            self.joining_set().remove(id);
            self.cancel_snapshot(id);
            debug!(board_id = %id, "board unregistered");
        }
        removed
    }

    /// Every entry, sorted by id.
    #[must_use]
    pub async fn entries(&self) -> Vec<(BoardId, BoardEntry)> {
        let mut entries: Vec<_> = self
            .boards
            .read()
            .await
            .iter()
            .map(|(id, entry)| (id.clone(), entry.clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    /// Boards mirrored over `session_id`.
    #[must_use]
    pub async fn mirrors_on(&self, session_id: SessionId) -> Vec<BoardId> {
        let mut ids: Vec<_> = self
            .boards
            .read()
            .await
            .iter()
            .filter(|(_, entry)| entry.mirror_session().is_some_and(|s| s.id() == session_id))
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    // =========================================================================
    // LINKS
    // =========================================================================

    /// The open link to `peer`, dialing a new one with `dial` if there is
    /// none. Concurrent callers for the same peer share one dial.
    ///
    /// # Errors
    ///
    /// Returns whatever `dial` returns.
    pub async fn link_or_dial<F, Fut, E>(&self, peer: &PeerAddr, dial: F) -> Result<SessionHandle, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<SessionHandle, E>>,
    {
        let mut links = self.links.lock().await;
        if let Some(session) = links.get(peer) {
            if !session.is_closed() {
                return Ok(session.clone());
            }
        }
        let session = dial().await?;
        debug!(%peer, session = %session.id(), "link opened");
        links.insert(peer.clone(), session.clone());
        Ok(session)
    }

    /// Forget the link carried by `session_id`. Returns its peer.
    pub async fn remove_link(&self, session_id: SessionId) -> Option<PeerAddr> {
        let mut links = self.links.lock().await;
        let peer = links
            .iter()
            .find(|(_, session)| session.id() == session_id)
            .map(|(peer, _)| peer.clone())?;
        links.remove(&peer);
        Some(peer)
    }

    /// Drain every link (shutdown).
    pub async fn take_links(&self) -> Vec<SessionHandle> {
        self.links.lock().await.drain().map(|(_, session)| session).collect()
    }

    // =========================================================================
    // PENDING SNAPSHOTS
    // =========================================================================

    /// Register interest in the first snapshot for `id`. The receiver yields
    /// the adopted version, or errors if the mirror is torn down first.
    pub fn expect_snapshot(&self, id: &BoardId) -> oneshot::Receiver<u64> {
        let (tx, rx) = oneshot::channel();
        self.pending_map().insert(id.clone(), tx);
        rx
    }

    /// Wake the waiter for `id`, if any.
    pub fn fulfill_snapshot(&self, id: &BoardId, version: u64) -> bool {
        let Some(tx) = self.pending_map().remove(id) else {
            return false;
        };
        tx.send(version).is_ok()
    }

    /// True while the mirror `id` is registered but its subscribe has not
    /// finished.
    #[must_use]
    pub fn is_joining(&self, id: &BoardId) -> bool {
        self.joining_set().contains(id)
    }

    pub fn mark_ready(&self, id: &BoardId) {
        self.joining_set().remove(id);
    }

    pub fn cancel_snapshot(&self, id: &BoardId) {
        self.pending_map().remove(id);
    }

    fn pending_map(&self) -> std::sync::MutexGuard<'_, HashMap<BoardId, oneshot::Sender<u64>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn joining_set(&self) -> std::sync::MutexGuard<'_, HashSet<BoardId>> {
        self.joining.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
#[path = "directory_test.rs"]
mod tests;
