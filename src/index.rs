//! Directory service — tells every connected peer which boards are shared.
//!
//! DESIGN
//! ======
//! - `SHARE_BOARD(id)` records the board against the announcing session
//!   and sends `SHARING_BOARD(id)` to every connected session.
//! - `UNSHARE_BOARD(id)` forgets it and sends `UNSHARING_BOARD(id)`.
//! - A new session is first sent `SHARING_BOARD` for every shared board.
//! - A closed session's boards are announced as `UNSHARING_BOARD`.
//!
//! Locks are taken `shared` then `sessions`, never the other way.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::board::BoardId;
use crate::protocol::Message;
use crate::session::{self, SessionHandle, SessionHandler, SessionId, SessionLimits};

#[derive(Clone, Default)]
pub struct IndexServer {
    inner: Arc<IndexState>,
}

#[derive(Default)]
struct IndexState {
    shared: RwLock<BTreeMap<BoardId, SessionId>>,
    sessions: RwLock<HashMap<SessionId, SessionHandle>>,
}

impl IndexServer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept peers until the listener fails.
    ///
    /// # Errors
    ///
    /// Returns the listener's accept error.
    pub async fn serve(&self, listener: TcpListener, limits: SessionLimits) -> std::io::Result<()> {
        info!(addr = ?listener.local_addr(), "directory service listening");
        session::accept_loop(listener, limits, Arc::new(self.clone())).await
    }

    /// Currently shared boards, sorted.
    pub async fn shared_boards(&self) -> Vec<BoardId> {
        self.inner.shared.read().await.keys().cloned().collect()
    }

    async fn notify_all(&self, message: &Message) {
        for session in self.inner.sessions.read().await.values() {
            session.emit(message);
        }
    }

    async fn share(&self, session: &SessionHandle, id: BoardId) {
        let mut shared = self.inner.shared.write().await;
        if shared.insert(id.clone(), session.id()).is_none() {
            info!(board_id = %id, peer = %session.label(), "board shared");
        }
        self.notify_all(&Message::SharingBoard(id)).await;
    }

    async fn unshare(&self, session: &SessionHandle, id: BoardId) {
        let mut shared = self.inner.shared.write().await;
        if shared.remove(&id).is_none() {
            debug!(board_id = %id, peer = %session.label(), "unshare for unknown board");
            return;
        }
        info!(board_id = %id, peer = %session.label(), "board unshared");
        self.notify_all(&Message::UnsharingBoard(id)).await;
    }
}

#[async_trait]
impl SessionHandler for IndexServer {
    async fn session_started(&self, session: &SessionHandle) {
        let shared = self.inner.shared.read().await;
        for id in shared.keys() {
            session.emit(&Message::SharingBoard(id.clone()));
        }
        self.inner.sessions.write().await.insert(session.id(), session.clone());
        info!(peer = %session.label(), boards = shared.len(), "peer joined directory");
    }

    async fn handle_message(&self, session: &SessionHandle, message: Message) {
        match message {
            Message::ShareBoard(id) => self.share(session, id).await,
            Message::UnshareBoard(id) => self.unshare(session, id).await,
            other => debug!(peer = %session.label(), event = other.event(), "ignored by directory"),
        }
    }

    async fn session_stopped(&self, session: &SessionHandle) {
        let mut shared = self.inner.shared.write().await;
        let mut orphaned = Vec::new();
        shared.retain(|id, owner| {
            if *owner == session.id() {
                orphaned.push(id.clone());
                return false;
            }
            true
        });
        self.inner.sessions.write().await.remove(&session.id());
        for id in &orphaned {
            self.notify_all(&Message::UnsharingBoard(id.clone())).await;
        }
        info!(peer = %session.label(), withdrawn = orphaned.len(), "peer left directory");
    }
}

#[cfg(test)]
#[path = "index_test.rs"]
mod tests;
