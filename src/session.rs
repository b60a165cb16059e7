//! Connection sessions — one live link to one remote peer.
//!
//! DESIGN
//! ======
//! A session owns exactly one byte stream. `spawn_session` splits it into
//! a reader and a writer and runs both inside one task:
//! - Inbound frames → decode → `SessionHandler::handle_message`, in order
//! - Outbound frames queued by `SessionHandle::send` → write to the stream
//!
//! Sends are fire-and-forget: they enqueue onto a bounded channel and
//! never wait for the peer. A full queue drops the frame and logs it.
//!
//! LIFECYCLE
//! =========
//! `Connecting → Connected → Closed`, monotonic. `Connected` fires when
//! the I/O task starts (before any message is dispatched); `Closed` fires
//! once, on EOF, transport error, or an explicit `close()`. A closed
//! session is never reopened; callers dial a fresh one.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::io;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::board::PeerAddr;
use crate::protocol::Message;

pub type SessionId = Uuid;

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Connecting,
    Connected,
    Closed,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("peer {peer} unreachable: {source}")]
    Unreachable {
        peer: String,
        #[source]
        source: io::Error,
    },
    #[error("session {0} is closed")]
    Closed(SessionId),
    #[error("send queue full for session {0}")]
    QueueFull(SessionId),
}

/// Per-session resource limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionLimits {
    /// Outbound frames buffered before sends start failing.
    pub send_queue: usize,
    /// Largest inbound frame accepted.
    pub max_frame_bytes: usize,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self { send_queue: 256, max_frame_bytes: frames::MAX_FRAME_BYTES }
    }
}

// =============================================================================
// HANDLE
// =============================================================================

struct Shared {
    id: SessionId,
    label: String,
    state: Mutex<SessionState>,
    shutdown: Notify,
}

/// Cheap, cloneable reference to a running session.
#[derive(Clone)]
pub struct SessionHandle {
    shared: Arc<Shared>,
    tx: mpsc::Sender<frames::Frame>,
}

impl SessionHandle {
    /// A new handle in `Connecting` plus the receiver its writer drains.
    #[must_use]
    pub fn new(label: impl Into<String>, send_queue: usize) -> (Self, mpsc::Receiver<frames::Frame>) {
        let (tx, rx) = mpsc::channel(send_queue.max(1));
        let shared = Arc::new(Shared {
            id: Uuid::new_v4(),
            label: label.into(),
            state: Mutex::new(SessionState::Connecting),
            shutdown: Notify::new(),
        });
        (Self { shared, tx }, rx)
    }

    #[must_use]
    pub fn id(&self) -> SessionId {
        self.shared.id
    }

    /// Remote peer label (`host:port` for dialed sessions, socket address
    /// for accepted ones).
    #[must_use]
    pub fn label(&self) -> &str {
        &self.shared.label
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.shared.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state() == SessionState::Closed
    }

    /// Move forward in the lifecycle. Returns false (and changes nothing)
    /// for a backwards or repeated transition.
    pub fn advance(&self, next: SessionState) -> bool {
        let mut state = self.shared.state.lock().unwrap_or_else(PoisonError::into_inner);
        if next <= *state {
            return false;
        }
        debug!(session = %self.shared.id, from = ?*state, to = ?next, "session transition");
        *state = next;
        true
    }

    /// Queue a message for delivery. Never waits on the network.
    ///
    /// # Errors
    ///
    /// Returns `Closed` if the session has ended and `QueueFull` if the
    /// outbound queue is saturated; in both cases the message is dropped.
    pub fn send(&self, message: &Message) -> Result<(), SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed(self.id()));
        }
        match self.tx.try_send(message.to_frame()) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(SessionError::QueueFull(self.id())),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(SessionError::Closed(self.id())),
        }
    }

    /// Queue a message, waiting for room if the outbound queue is full.
    ///
    /// # Errors
    ///
    /// Returns `Closed` if the session has ended or ends while waiting.
    pub async fn deliver(&self, message: &Message) -> Result<(), SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed(self.id()));
        }
        self.tx
            .send(message.to_frame())
            .await
            .map_err(|_| SessionError::Closed(self.id()))
    }

    /// Best-effort send: failures are logged, never returned.
    pub fn emit(&self, message: &Message) {
        if let Err(e) = self.send(message) {
            warn!(session = %self.id(), peer = %self.label(), event = message.event(), error = %e, "send dropped");
        }
    }

    /// Ask the I/O task to stop. Frames already queued are flushed first.
    pub fn close(&self) {
        self.shared.shutdown.notify_one();
    }
}

impl PartialEq for SessionHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for SessionHandle {}

impl Hash for SessionHandle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id().hash(state);
    }
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.id())
            .field("label", &self.label())
            .field("state", &self.state())
            .finish()
    }
}

// =============================================================================
// HANDLER
// =============================================================================

/// The single dispatch point for everything a session observes.
#[async_trait]
pub trait SessionHandler: Send + Sync + 'static {
    /// The session reached `Connected`. Runs before any message dispatch.
    async fn session_started(&self, session: &SessionHandle);

    /// One decoded inbound message. Called in arrival order; a slow
    /// handler delays later messages on the same session only.
    async fn handle_message(&self, session: &SessionHandle, message: Message);

    /// The session reached `Closed`. Called exactly once.
    async fn session_stopped(&self, session: &SessionHandle);
}

// =============================================================================
// I/O TASK
// =============================================================================

/// Start a session over `stream` and return its handle.
pub fn spawn_session<S>(
    stream: S,
    label: impl Into<String>,
    limits: SessionLimits,
    handler: Arc<dyn SessionHandler>,
) -> (SessionHandle, JoinHandle<()>)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (handle, outbound) = SessionHandle::new(label, limits.send_queue);
    let task = tokio::spawn(run_session(stream, handle.clone(), outbound, limits.max_frame_bytes, handler));
    (handle, task)
}

async fn run_session<S>(
    stream: S,
    handle: SessionHandle,
    mut outbound: mpsc::Receiver<frames::Frame>,
    max_frame_bytes: usize,
    handler: Arc<dyn SessionHandler>,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    handle.advance(SessionState::Connected);
    info!(session = %handle.id(), peer = %handle.label(), "session connected");
    handler.session_started(&handle).await;

    let (mut reader, mut writer) = tokio::io::split(stream);

    let inbound = async {
        loop {
            match frames::read_frame(&mut reader, max_frame_bytes).await {
                Ok(Some(frame)) => match Message::from_frame(&frame) {
                    Ok(message) => handler.handle_message(&handle, message).await,
                    Err(e) => {
                        warn!(session = %handle.id(), event = %frame.event, error = %e, "malformed message dropped");
                    }
                },
                Ok(None) => {
                    debug!(session = %handle.id(), "peer closed stream");
                    break;
                }
                Err(e) => {
                    warn!(session = %handle.id(), error = %e, "session read failed");
                    break;
                }
            }
        }
    };

    let outbound_loop = async {
        while let Some(frame) = outbound.recv().await {
            if let Err(e) = frames::write_frame(&mut writer, &frame).await {
                warn!(session = %handle.id(), error = %e, "session write failed");
                return false;
            }
        }
        true
    };

    let requested = tokio::select! {
        () = inbound => false,
        _ = outbound_loop => false,
        () = handle.shared.shutdown.notified() => true,
    };

    if requested {
        // Flush what was queued before the close request.
        while let Ok(frame) = outbound.try_recv() {
            if frames::write_frame(&mut writer, &frame).await.is_err() {
                break;
            }
        }
    }
    if let Err(e) = writer.shutdown().await {
        debug!(session = %handle.id(), error = %e, "stream shutdown failed");
    }

    handle.advance(SessionState::Closed);
    info!(session = %handle.id(), peer = %handle.label(), requested, "session closed");
    handler.session_stopped(&handle).await;
}

// =============================================================================
// TRANSPORT
// =============================================================================

/// Any bidirectional byte stream a session can run over.
pub trait PeerStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> PeerStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

pub type BoxedStream = Box<dyn PeerStream>;

/// Opens outbound links to peers.
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    async fn dial(&self, peer: &PeerAddr) -> io::Result<BoxedStream>;
}

/// Plain TCP dialer.
#[derive(Debug, Clone, Copy)]
pub struct TcpDialer {
    pub connect_timeout: Duration,
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, peer: &PeerAddr) -> io::Result<BoxedStream> {
        let connect = TcpStream::connect((peer.host.as_str(), peer.port));
        let stream = tokio::time::timeout(self.connect_timeout, connect)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, format!("connect to {peer} timed out")))??;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}

/// Dial `peer` and start a session on the resulting stream.
///
/// # Errors
///
/// Returns `Unreachable` if the connection cannot be established.
pub async fn connect(
    dialer: &dyn Dialer,
    peer: &PeerAddr,
    limits: SessionLimits,
    handler: Arc<dyn SessionHandler>,
) -> Result<SessionHandle, SessionError> {
    let stream = dialer
        .dial(peer)
        .await
        .map_err(|source| SessionError::Unreachable { peer: peer.to_string(), source })?;
    let (handle, _task) = spawn_session(stream, peer.to_string(), limits, handler);
    Ok(handle)
}

/// Accept inbound sessions until the listener fails.
///
/// # Errors
///
/// Returns the listener's error if `accept` fails fatally.
pub async fn accept_loop(listener: TcpListener, limits: SessionLimits, handler: Arc<dyn SessionHandler>) -> io::Result<()> {
    loop {
        let (stream, addr) = listener.accept().await?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!(%addr, error = %e, "set_nodelay failed");
        }
        info!(%addr, "inbound peer accepted");
        spawn_session(stream, addr.to_string(), limits, Arc::clone(&handler));
    }
}

#[cfg(test)]
#[path = "session_test.rs"]
mod tests;
