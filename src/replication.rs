//! Replication controller — owner and subscriber roles over peer sessions.
//!
//! DESIGN
//! ======
//! One controller per peer process. It is the `SessionHandler` for every
//! peer link, inbound or outbound, and plays both roles at once:
//!
//! - **Owner** of boards whose id names this peer's `host:port`. All
//!   proposals, local or relayed (`*_ACCEPTED`), funnel through the same
//!   `BoardState::propose` under the board's lock. Accepted changes are
//!   broadcast as `*_UPDATE` to the board's listeners *before* the lock is
//!   released, so listeners see versions in order.
//! - **Subscriber** of boards owned elsewhere. A mirror is never edited
//!   locally: local edits are forwarded to the owner and the mirror adopts
//!   whatever snapshot the owner pushes back.
//!
//! Message handlers return an `Outcome`; `handle_message` applies it, so
//! handlers never touch the reply path directly.
//!
//! LIFECYCLE
//! =========
//! Subscribe: dial (or reuse) the owner link → `GET_BOARD_DATA` → wait for
//! `BOARD_DATA` (bounded) → `LISTEN` → confirming `GET_BOARD_DATA`.
//! A second subscribe for a board still joining waits for the first.
//! Link closed: the session leaves every listener set, and every mirror it
//! fed is dropped. A link that no longer feeds any mirror is closed.
//!
//! Anything that waited on a board's lock re-checks that the board is
//! still registered before touching it; a delete may have won the lock.

use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{OwnedMutexGuard, RwLock, broadcast};
use tracing::{debug, info, trace, warn};

use crate::board::{BoardError, BoardId, BoardPayload, BoardState, Mutation, Path, Proposal};
use crate::config::PeerConfig;
use crate::directory::{BoardEntry, PeerDirectory, Role};
use crate::events::{BoardEvent, EventBus, Removal};
use crate::listeners::ListenerRegistry;
use crate::protocol::{ErrorCode, Message};
use crate::session::{self, Dialer, SessionError, SessionHandle, SessionHandler};

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ReplicationError {
    #[error("board not found: {0}")]
    NotFound(BoardId),
    #[error("board not shared: {0}")]
    NotShared(BoardId),
    #[error("board already exists: {0}")]
    Exists(BoardId),
    #[error("board not owned here: {0}")]
    NotOwned(BoardId),
    #[error("board is owned here: {0}")]
    OwnedHere(BoardId),
    #[error("no snapshot for {0} before timeout")]
    SnapshotTimeout(BoardId),
    #[error("link to owner of {0} closed")]
    LinkClosed(BoardId),
    #[error(transparent)]
    Board(#[from] BoardError),
    #[error(transparent)]
    Session(#[from] SessionError),
}

impl ErrorCode for ReplicationError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "E_BOARD_NOT_FOUND",
            Self::NotShared(_) => "E_BOARD_NOT_SHARED",
            Self::Exists(_) => "E_BOARD_EXISTS",
            Self::NotOwned(_) => "E_BOARD_NOT_OWNED",
            Self::OwnedHere(_) => "E_BOARD_OWNED_HERE",
            Self::SnapshotTimeout(_) => "E_SNAPSHOT_TIMEOUT",
            Self::LinkClosed(_) => "E_LINK_CLOSED",
            Self::Board(e) => e.error_code(),
            Self::Session(SessionError::Unreachable { .. }) => "E_PEER_UNREACHABLE",
            Self::Session(_) => "E_SESSION",
        }
    }
}

/// Result of a local edit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum EditOutcome {
    /// Applied at this peer (the owner).
    Accepted { version: u64 },
    /// Stale base version. The caller redraws from `snapshot()`.
    Rejected { current: u64 },
    /// Sent to the remote owner; the mirror updates when it answers.
    Forwarded,
}

impl From<Proposal> for EditOutcome {
    fn from(proposal: Proposal) -> Self {
        match proposal {
            Proposal::Accepted(version) => Self::Accepted { version },
            Proposal::Rejected { current } => Self::Rejected { current },
        }
    }
}

/// One line of `boards()`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BoardSummary {
    pub id: BoardId,
    pub version: u64,
    pub paths: usize,
    pub owned: bool,
    pub shared: bool,
}

/// What the dispatch layer does after a handler runs.
enum Outcome {
    Done,
    /// Send one message back on the same session.
    Reply(Message),
    /// Close the session.
    Close,
}

// =============================================================================
// CONTROLLER
// =============================================================================

/// Cheap to clone; all state is behind one `Arc`.
#[derive(Clone)]
pub struct ReplicationController {
    inner: Arc<Inner>,
}

struct Inner {
    config: PeerConfig,
    directory: PeerDirectory,
    listeners: ListenerRegistry,
    events: EventBus,
    dialer: Arc<dyn Dialer>,
    /// Link to the directory service, used to announce share/unshare.
    announcer: RwLock<Option<SessionHandle>>,
    last_minted: StdMutex<u128>,
}

impl ReplicationController {
    #[must_use]
    pub fn new(config: PeerConfig, dialer: Arc<dyn Dialer>) -> Self {
        let directory = PeerDirectory::new(config.local_peer());
        Self {
            inner: Arc::new(Inner {
                config,
                directory,
                listeners: ListenerRegistry::new(),
                events: EventBus::new(),
                dialer,
                announcer: RwLock::new(None),
                last_minted: StdMutex::new(0),
            }),
        }
    }

    #[must_use]
    pub fn config(&self) -> &PeerConfig {
        &self.inner.config
    }

    /// Observe every board change.
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<BoardEvent> {
        self.inner.events.subscribe()
    }

    fn handler(&self) -> Arc<dyn SessionHandler> {
        Arc::new(self.clone())
    }

    // =========================================================================
    // LINKS
    // =========================================================================

    /// Run a session for an inbound peer connection.
    pub fn accept<S>(&self, stream: S, label: impl Into<String>) -> SessionHandle
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (session, _task) = session::spawn_session(stream, label, self.config().session_limits(), self.handler());
        session
    }

    /// Accept peer connections until the listener fails.
    ///
    /// # Errors
    ///
    /// Returns the listener's accept error.
    pub async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        info!(local = %self.inner.directory.local(), "accepting peers");
        session::accept_loop(listener, self.config().session_limits(), self.handler()).await
    }

    /// Use `session` to announce share/unshare to the directory service.
    pub async fn set_announcer(&self, session: Option<SessionHandle>) {
        *self.inner.announcer.write().await = session;
    }

    /// Drop the announcer if it is `session`.
    pub async fn clear_announcer(&self, session: &SessionHandle) {
        let mut announcer = self.inner.announcer.write().await;
        if announcer.as_ref() == Some(session) {
            *announcer = None;
        }
    }

    async fn announce(&self, message: Message) {
        match self.inner.announcer.read().await.as_ref() {
            Some(session) => session.emit(&message),
            None => debug!(event = message.event(), "no directory link; announcement skipped"),
        }
    }

    // =========================================================================
    // LOCAL BOARD MANAGEMENT
    // =========================================================================

    /// Create an owned, unshared board named `board<epoch-millis>`.
    ///
    /// # Errors
    ///
    /// `Board(MalformedIdentifier)` if the configured host cannot appear in
    /// a board id.
    pub async fn create_board(&self) -> Result<BoardId, ReplicationError> {
        loop {
            match self.create_named_board(&format!("board{}", self.mint_millis())).await {
                Err(ReplicationError::Exists(_)) => {}
                result => return result,
            }
        }
    }

    /// Create an owned, unshared board with a chosen name.
    ///
    /// # Errors
    ///
    /// `Board(MalformedIdentifier)` for a name that cannot appear in an id,
    /// `Exists` if the board is already held here.
    pub async fn create_named_board(&self, name: &str) -> Result<BoardId, ReplicationError> {
        let id = BoardId::new(self.inner.directory.local().clone(), name)?;
        if self.inner.directory.insert(BoardState::new_owned(id.clone()), Role::Owned).await.is_none() {
            return Err(ReplicationError::Exists(id));
        }
        info!(board_id = %id, "board created");
        self.inner.events.publish(BoardEvent::Created { id: id.clone() });
        Ok(id)
    }

    /// Epoch millis, bumped past the last value handed out.
    fn mint_millis(&self) -> u128 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |elapsed| elapsed.as_millis());
        let mut last = self.inner.last_minted.lock().unwrap_or_else(PoisonError::into_inner);
        *last = now.max(*last + 1);
        *last
    }

    /// Share or unshare an owned board. Returns whether anything changed.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown board, `NotOwned` for a mirror.
    pub async fn set_shared(&self, id: &BoardId, shared: bool) -> Result<bool, ReplicationError> {
        let entry = self.owned_entry(id).await?;
        let mut board = self.lock_live(id, &entry).await?;
        if !board.set_shared(shared) {
            return Ok(false);
        }
        if shared {
            info!(board_id = %id, "board shared");
            self.announce(Message::ShareBoard(id.clone())).await;
            self.inner.events.publish(BoardEvent::Shared { id: id.clone() });
        } else {
            let dropped = self.inner.listeners.remove_board(id).await;
            info!(board_id = %id, listeners = dropped.len(), "board unshared");
            self.announce(Message::UnshareBoard(id.clone())).await;
            self.inner.events.publish(BoardEvent::Unshared { id: id.clone() });
        }
        drop(board);
        Ok(true)
    }

    /// Delete a board. Owners notify listeners with `BOARD_DELETED`;
    /// mirrors unsubscribe.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown board.
    pub async fn delete_board(&self, id: &BoardId) -> Result<(), ReplicationError> {
        let entry = self.entry(id).await?;
        if !entry.is_owned() {
            return self.unsubscribe(id).await;
        }

        let board = self.lock_live(id, &entry).await?;
        let listeners = self.inner.listeners.remove_board(id).await;
        for session in &listeners {
            session.emit(&Message::BoardDeleted(id.clone()));
        }
        if board.is_shared() {
            self.announce(Message::UnshareBoard(id.clone())).await;
        }
        self.inner.directory.remove(id).await;
        drop(board);

        info!(board_id = %id, listeners = listeners.len(), "board deleted");
        self.inner.events.publish(BoardEvent::Removed { id: id.clone(), reason: Removal::Deleted });
        Ok(())
    }

    /// Summaries of every board held here, sorted by id.
    pub async fn boards(&self) -> Vec<BoardSummary> {
        let mut summaries = Vec::new();
        for (id, entry) in self.inner.directory.entries().await {
            let board = entry.board.lock().await;
            summaries.push(BoardSummary {
                id,
                version: board.version(),
                paths: board.paths().len(),
                owned: board.is_owned(),
                shared: board.is_shared(),
            });
        }
        summaries
    }

    /// Peers currently listening on an owned board.
    pub async fn listener_count(&self, id: &BoardId) -> usize {
        self.inner.listeners.count(id).await
    }

    /// A copy of one board's current state.
    pub async fn snapshot(&self, id: &BoardId) -> Option<BoardState> {
        let entry = self.inner.directory.get(id).await?;
        let board = entry.board.lock().await;
        Some(board.clone())
    }

    /// Unshare owned boards, unsubscribe mirrors, drop everything, and
    /// close every link.
    pub async fn shutdown(&self) {
        for (id, entry) in self.inner.directory.entries().await {
            let result = if entry.is_owned() {
                match self.set_shared(&id, false).await {
                    Ok(_) => self.delete_board(&id).await,
                    Err(e) => Err(e),
                }
            } else {
                self.unsubscribe(&id).await
            };
            if let Err(e) = result {
                warn!(board_id = %id, error = %e, "shutdown: board cleanup failed");
            }
        }
        for link in self.inner.directory.take_links().await {
            link.close();
        }
        if let Some(announcer) = self.inner.announcer.write().await.take() {
            announcer.close();
        }
        info!("peer shut down");
    }

    // =========================================================================
    // LOCAL EDITS
    // =========================================================================

    /// Propose `mutation` against `base_version`, the version the caller's
    /// view was built from.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown board; a session error if a mirror's edit
    /// cannot be forwarded.
    pub async fn propose(&self, id: &BoardId, mutation: Mutation, base_version: u64) -> Result<EditOutcome, ReplicationError> {
        let entry = self.entry(id).await?;
        let Role::Mirror { session } = &entry.role else {
            let board = self.lock_live(id, &entry).await?;
            return Ok(self.apply_owned(board, &mutation, base_version, None).await);
        };

        session.send(&Message::relay_for(id.clone(), &mutation, base_version))?;
        debug!(board_id = %id, kind = mutation.kind(), base_version, "edit forwarded to owner");
        self.inner.events.publish(BoardEvent::Forwarded { id: id.clone(), base_version });
        Ok(EditOutcome::Forwarded)
    }

    /// # Errors
    ///
    /// See [`Self::propose`].
    pub async fn propose_path(&self, id: &BoardId, path: Path, base_version: u64) -> Result<EditOutcome, ReplicationError> {
        self.propose(id, Mutation::AddPath(path), base_version).await
    }

    /// # Errors
    ///
    /// See [`Self::propose`].
    pub async fn propose_undo(&self, id: &BoardId, base_version: u64) -> Result<EditOutcome, ReplicationError> {
        self.propose(id, Mutation::Undo, base_version).await
    }

    /// # Errors
    ///
    /// See [`Self::propose`].
    pub async fn propose_clear(&self, id: &BoardId, base_version: u64) -> Result<EditOutcome, ReplicationError> {
        self.propose(id, Mutation::Clear, base_version).await
    }

    /// Run one proposal on an owned board and broadcast it if accepted.
    /// `proposer` is the relaying session, if the edit came from a peer.
    async fn apply_owned(
        &self,
        mut board: OwnedMutexGuard<BoardState>,
        mutation: &Mutation,
        base_version: u64,
        proposer: Option<&SessionHandle>,
    ) -> EditOutcome {
        let id = board.id().clone();
        let proposal = board.propose(mutation.clone(), base_version);

        let Proposal::Accepted(version) = proposal else {
            let current = board.version();
            info!(board_id = %id, kind = mutation.kind(), base_version, current, remote = proposer.is_some(), "proposal rejected");
            match proposer {
                Some(session) => session.emit(&Message::BoardData(board.payload())),
                None => self.inner.events.publish(BoardEvent::Rejected { id, current }),
            }
            return proposal.into();
        };

        let update = Message::update_for(mutation, board.payload());
        let delivered = self.inner.listeners.broadcast(&id, &update).await;
        if let Some(session) = proposer {
            if !self.inner.listeners.contains(&id, session.id()).await {
                session.emit(&update);
            }
        }
        drop(board);

        info!(board_id = %id, kind = mutation.kind(), version, delivered, "proposal accepted");
        self.inner.events.publish(BoardEvent::Updated { id, version });
        proposal.into()
    }

    // =========================================================================
    // SUBSCRIBER ROLE
    // =========================================================================

    /// Mirror a remote board. Returns the version of the first snapshot.
    /// Subscribing to a board already held here is a no-op; if another
    /// subscribe is still joining it, this one waits for that outcome.
    ///
    /// # Errors
    ///
    /// `OwnedHere` for a local id; `Session(Unreachable)` if the owner
    /// cannot be dialed; `SnapshotTimeout` if it does not answer in time;
    /// `LinkClosed` if the link drops (or the owner refuses) first.
    pub async fn subscribe(&self, id: &BoardId) -> Result<u64, ReplicationError> {
        let directory = &self.inner.directory;
        if directory.is_local(id) {
            return Err(ReplicationError::OwnedHere(id.clone()));
        }
        // Taken before any lookup so a concurrent join's outcome is never missed.
        let events = self.inner.events.subscribe();
        if directory.get(id).await.is_some() {
            return self.joined(id, events).await;
        }

        let owner = id.owner();
        let session = directory
            .link_or_dial(owner, || {
                session::connect(self.inner.dialer.as_ref(), owner, self.config().session_limits(), self.handler())
            })
            .await?;

        let role = Role::Mirror { session: session.clone() };
        if directory.insert(BoardState::new_mirror(id.clone()), role).await.is_none() {
            return self.joined(id, events).await;
        }

        let waiter = directory.expect_snapshot(id);
        if let Err(e) = session.deliver(&Message::GetBoardData(id.clone())).await {
            self.drop_mirror(id, Removal::Disconnected).await;
            return Err(e.into());
        }

        let version = match tokio::time::timeout(self.config().snapshot_timeout(), waiter).await {
            Ok(Ok(version)) => version,
            Ok(Err(_)) => {
                warn!(board_id = %id, "link closed before first snapshot");
                self.drop_mirror(id, Removal::Disconnected).await;
                return Err(ReplicationError::LinkClosed(id.clone()));
            }
            Err(_) => {
                warn!(board_id = %id, timeout_ms = self.config().snapshot_timeout_ms, "no snapshot from owner");
                self.drop_mirror(id, Removal::Disconnected).await;
                return Err(ReplicationError::SnapshotTimeout(id.clone()));
            }
        };

        self.confirm_listen(id, &session).await?;
        let held = directory.get(id).await;
        if held.is_none_or(|entry| entry.mirror_session() != Some(&session)) {
            warn!(board_id = %id, "mirror dropped while joining");
            return Err(ReplicationError::LinkClosed(id.clone()));
        }

        directory.mark_ready(id);
        info!(board_id = %id, version, owner = %owner, "mirror ready");
        self.inner.events.publish(BoardEvent::Mirrored { id: id.clone(), version });
        Ok(version)
    }

    /// Stop mirroring a remote board. The owner link closes when no other
    /// mirror uses it.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown board, `OwnedHere` for an owned one.
    pub async fn unsubscribe(&self, id: &BoardId) -> Result<(), ReplicationError> {
        let entry = self.entry(id).await?;
        let Some(session) = entry.mirror_session() else {
            return Err(ReplicationError::OwnedHere(id.clone()));
        };

        session.emit(&Message::Unlisten(id.clone()));
        self.drop_mirror(id, Removal::Unsubscribed).await;
        Ok(())
    }

    /// Second half of the join: `LISTEN`, then a confirming
    /// `GET_BOARD_DATA`. Rolls the mirror back if either cannot be queued.
    async fn confirm_listen(&self, id: &BoardId, session: &SessionHandle) -> Result<(), ReplicationError> {
        let queued = tokio::time::timeout(self.config().snapshot_timeout(), async {
            session.deliver(&Message::Listen(id.clone())).await?;
            session.deliver(&Message::GetBoardData(id.clone())).await
        })
        .await;
        let err = match queued {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(e)) => ReplicationError::from(e),
            Err(_) => ReplicationError::Session(SessionError::QueueFull(session.id())),
        };

        warn!(board_id = %id, error = %err, "listen handshake failed; dropping mirror");
        // LISTEN may already be queued. A closed link is forgotten by the
        // owner anyway.
        session.emit(&Message::Unlisten(id.clone()));
        self.drop_mirror(id, Removal::Disconnected).await;
        Err(err)
    }

    /// Result of subscribing to a board that is already registered here.
    /// While another subscribe is still joining it, wait for that one.
    async fn joined(&self, id: &BoardId, mut events: broadcast::Receiver<BoardEvent>) -> Result<u64, ReplicationError> {
        let settled = async {
            loop {
                if !self.inner.directory.is_joining(id) {
                    return self.held_version(id).await;
                }
                match events.recv().await {
                    Ok(BoardEvent::Mirrored { id: joined, version }) if &joined == id => return Ok(version),
                    Ok(BoardEvent::Removed { id: gone, .. }) if &gone == id => {
                        return Err(ReplicationError::LinkClosed(id.clone()));
                    }
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => return Err(ReplicationError::LinkClosed(id.clone())),
                }
            }
        };
        // The first subscribe may spend one timeout on the snapshot and one
        // on the handshake.
        tokio::time::timeout(self.config().snapshot_timeout() * 2, settled)
            .await
            .unwrap_or_else(|_| Err(ReplicationError::SnapshotTimeout(id.clone())))
    }

    async fn held_version(&self, id: &BoardId) -> Result<u64, ReplicationError> {
        self.snapshot(id)
            .await
            .map(|board| board.version())
            .ok_or_else(|| ReplicationError::LinkClosed(id.clone()))
    }

    async fn drop_mirror(&self, id: &BoardId, reason: Removal) {
        let Some(entry) = self.inner.directory.remove(id).await else {
            return;
        };
        info!(board_id = %id, ?reason, "mirror dropped");
        self.inner.events.publish(BoardEvent::Removed { id: id.clone(), reason });
        if let Some(session) = entry.mirror_session() {
            self.release_link(session).await;
        }
    }

    /// Close `session` once it feeds no mirror.
    async fn release_link(&self, session: &SessionHandle) {
        if !self.inner.directory.mirrors_on(session.id()).await.is_empty() {
            return;
        }
        if let Some(peer) = self.inner.directory.remove_link(session.id()).await {
            debug!(%peer, session = %session.id(), "idle owner link closed");
        }
        session.close();
    }

    /// Adopt an owner-pushed snapshot into the mirror fed by `session`.
    async fn adopt(&self, session: &SessionHandle, payload: BoardPayload) -> Outcome {
        let id = payload.id.clone();
        let Some(entry) = self.inner.directory.get(&id).await else {
            debug!(board_id = %id, "snapshot for board not held here");
            return Outcome::Done;
        };
        if entry.mirror_session() != Some(session) {
            warn!(board_id = %id, peer = %session.label(), "snapshot from a peer that does not feed this board");
            return Outcome::Done;
        }

        let version = payload.version;
        let Ok(mut board) = self.lock_live(&id, &entry).await else {
            return Outcome::Done;
        };
        let previous = board.adopt(payload);
        drop(board);
        debug!(board_id = %id, previous, version, "mirror adopted snapshot");

        if !self.inner.directory.fulfill_snapshot(&id, version) {
            self.inner.events.publish(BoardEvent::Updated { id, version });
        }
        Outcome::Done
    }

    // =========================================================================
    // DISCOVERY REACTIONS
    // =========================================================================

    /// A board was announced as shared.
    pub async fn board_shared(&self, id: &BoardId) {
        if self.inner.directory.is_local(id) {
            let Ok(entry) = self.owned_entry(id).await else {
                warn!(board_id = %id, "announced as shared but not held here");
                return;
            };
            let Ok(mut board) = self.lock_live(id, &entry).await else {
                return;
            };
            if board.set_shared(true) {
                self.inner.events.publish(BoardEvent::Shared { id: id.clone() });
            }
            return;
        }
        if let Err(e) = self.subscribe(id).await {
            warn!(board_id = %id, error = %e, code = e.error_code(), "subscribe to shared board failed");
        }
    }

    /// A board was announced as no longer shared.
    pub async fn board_unshared(&self, id: &BoardId) {
        if self.inner.directory.is_local(id) {
            let Ok(entry) = self.owned_entry(id).await else {
                return;
            };
            let Ok(mut board) = self.lock_live(id, &entry).await else {
                return;
            };
            if board.set_shared(false) {
                self.inner.listeners.remove_board(id).await;
                self.inner.events.publish(BoardEvent::Unshared { id: id.clone() });
            }
            return;
        }
        self.drop_mirror(id, Removal::Unshared).await;
    }

    // =========================================================================
    // OWNER ROLE
    // =========================================================================

    /// Lock an owned, shared board, or return the error to send a peer
    /// asking for it.
    async fn served_board(&self, id: &BoardId) -> Result<OwnedMutexGuard<BoardState>, ReplicationError> {
        let entry = self.owned_entry(id).await?;
        let board = self.lock_live(id, &entry).await?;
        if !board.is_shared() {
            return Err(ReplicationError::NotShared(id.clone()));
        }
        Ok(board)
    }

    async fn send_board_data(&self, id: &BoardId) -> Outcome {
        match self.served_board(id).await {
            Ok(board) => Outcome::Reply(Message::BoardData(board.payload())),
            Err(e) => refuse(&e),
        }
    }

    async fn listen(&self, session: &SessionHandle, id: &BoardId) -> Outcome {
        let board = match self.served_board(id).await {
            Ok(board) => board,
            Err(e) => return refuse(&e),
        };
        if self.inner.listeners.subscribe(id, session.clone()).await {
            info!(board_id = %id, peer = %session.label(), version = board.version(), "peer listening");
        }
        Outcome::Done
    }

    async fn unlisten(&self, session: &SessionHandle, id: &BoardId) -> Outcome {
        if self.inner.listeners.unsubscribe(id, session.id()).await {
            info!(board_id = %id, peer = %session.label(), "peer stopped listening");
        }
        Outcome::Done
    }

    async fn relay(&self, session: &SessionHandle, mutation: Mutation, payload: &BoardPayload) -> Outcome {
        match self.served_board(&payload.id).await {
            Ok(board) => {
                self.apply_owned(board, &mutation, payload.version, Some(session)).await;
                Outcome::Done
            }
            Err(e) => refuse(&e),
        }
    }

    async fn board_deleted(&self, session: &SessionHandle, id: &BoardId) -> Outcome {
        match self.inner.directory.get(id).await {
            Some(entry) if entry.mirror_session() == Some(session) => {
                self.drop_mirror(id, Removal::Deleted).await;
            }
            _ => debug!(board_id = %id, "deletion notice for board not mirrored from this peer"),
        }
        Outcome::Done
    }

    // =========================================================================
    // HELPERS
    // =========================================================================

    async fn entry(&self, id: &BoardId) -> Result<BoardEntry, ReplicationError> {
        self.inner.directory.get(id).await.ok_or_else(|| ReplicationError::NotFound(id.clone()))
    }

    /// Lock `entry`'s board, failing with `NotFound` if it left the
    /// directory while we waited.
    async fn lock_live(&self, id: &BoardId, entry: &BoardEntry) -> Result<OwnedMutexGuard<BoardState>, ReplicationError> {
        let board = Arc::clone(&entry.board).lock_owned().await;
        let live = self
            .inner
            .directory
            .get(id)
            .await
            .is_some_and(|current| Arc::ptr_eq(&current.board, &entry.board));
        if !live {
            debug!(board_id = %id, "board removed while waiting for its lock");
            return Err(ReplicationError::NotFound(id.clone()));
        }
        Ok(board)
    }

    async fn owned_entry(&self, id: &BoardId) -> Result<BoardEntry, ReplicationError> {
        let entry = self.entry(id).await?;
        if !entry.is_owned() {
            return Err(ReplicationError::NotOwned(id.clone()));
        }
        Ok(entry)
    }

    async fn dispatch(&self, session: &SessionHandle, message: Message) -> Outcome {
        trace!(peer = %session.label(), event = message.event(), board_id = ?message.board_id(), "peer message");
        match message {
            Message::GetBoardData(id) => self.send_board_data(&id).await,
            Message::Listen(id) => self.listen(session, &id).await,
            Message::Unlisten(id) => self.unlisten(session, &id).await,
            Message::PathAccepted(payload) => match payload.last_path().cloned() {
                Some(path) => self.relay(session, Mutation::AddPath(path), &payload).await,
                None => Outcome::Done,
            },
            Message::UndoAccepted(payload) => self.relay(session, Mutation::Undo, &payload).await,
            Message::ClearAccepted(payload) => self.relay(session, Mutation::Clear, &payload).await,
            Message::BoardData(payload)
            | Message::PathUpdate(payload)
            | Message::UndoUpdate(payload)
            | Message::ClearUpdate(payload) => self.adopt(session, payload).await,
            Message::BoardDeleted(id) => self.board_deleted(session, &id).await,
            Message::BoardError(notice) => {
                warn!(peer = %session.label(), %notice, "peer reported error; closing link");
                Outcome::Close
            }
            Message::ShareBoard(_)
            | Message::UnshareBoard(_)
            | Message::SharingBoard(_)
            | Message::UnsharingBoard(_) => {
                debug!(peer = %session.label(), event = message.event(), "directory message on peer link ignored");
                Outcome::Done
            }
        }
    }
}

fn refuse(err: &ReplicationError) -> Outcome {
    debug!(error = %err, code = err.error_code(), "request refused");
    Outcome::Reply(Message::error_from(err))
}

#[async_trait]
impl SessionHandler for ReplicationController {
    async fn session_started(&self, session: &SessionHandle) {
        debug!(session = %session.id(), peer = %session.label(), "peer link up");
    }

    async fn handle_message(&self, session: &SessionHandle, message: Message) {
        match self.dispatch(session, message).await {
            Outcome::Done => {}
            Outcome::Reply(reply) => session.emit(&reply),
            Outcome::Close => session.close(),
        }
    }

    async fn session_stopped(&self, session: &SessionHandle) {
        let left = self.inner.listeners.remove_session(session.id()).await;
        if let Some(peer) = self.inner.directory.remove_link(session.id()).await {
            debug!(%peer, "owner link forgotten");
        }
        let lost = self.inner.directory.mirrors_on(session.id()).await;
        for id in &lost {
            self.drop_mirror(id, Removal::Disconnected).await;
        }
        info!(
            session = %session.id(),
            peer = %session.label(),
            listening = left.len(),
            mirrors = lost.len(),
            "peer link down"
        );
    }
}

#[cfg(test)]
#[path = "replication_test.rs"]
mod tests;
