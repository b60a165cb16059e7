//! Discovery client — the link from a peer to the directory service.
//!
//! Announcements flow out (`SHARE_BOARD`/`UNSHARE_BOARD`, sent by the
//! controller through the announcer link) and notices flow in
//! (`SHARING_BOARD`/`UNSHARING_BOARD`, turned into subscribe/teardown).

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::board::PeerAddr;
use crate::protocol::Message;
use crate::replication::ReplicationController;
use crate::session::{self, Dialer, SessionError, SessionHandle, SessionHandler};

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("directory service at {index} unreachable: {source}")]
    Unreachable {
        index: PeerAddr,
        #[source]
        source: SessionError,
    },
}

struct DiscoveryHandler {
    controller: ReplicationController,
}

#[async_trait]
impl SessionHandler for DiscoveryHandler {
    async fn session_started(&self, session: &SessionHandle) {
        info!(index = %session.label(), "directory link up");
    }

    async fn handle_message(&self, session: &SessionHandle, message: Message) {
        match message {
            Message::SharingBoard(id) => {
                // Subscribing waits on another link; keep this one flowing.
                let controller = self.controller.clone();
                tokio::spawn(async move { controller.board_shared(&id).await });
            }
            Message::UnsharingBoard(id) => self.controller.board_unshared(&id).await,
            Message::BoardError(notice) => warn!(index = %session.label(), %notice, "directory reported error"),
            other => debug!(index = %session.label(), event = other.event(), "unexpected message from directory"),
        }
    }

    async fn session_stopped(&self, session: &SessionHandle) {
        self.controller.clear_announcer(session).await;
        warn!(index = %session.label(), "directory link lost; sharing notices stop");
    }
}

/// Connect `controller` to the directory service at `index`. Boards that
/// are already shared are announced again on the new link.
///
/// # Errors
///
/// Returns `Unreachable` if the directory service cannot be dialed.
pub async fn attach(
    controller: &ReplicationController,
    dialer: &dyn Dialer,
    index: &PeerAddr,
) -> Result<SessionHandle, DiscoveryError> {
    let handler = Arc::new(DiscoveryHandler { controller: controller.clone() });
    let session = session::connect(dialer, index, controller.config().session_limits(), handler)
        .await
        .map_err(|source| DiscoveryError::Unreachable { index: index.clone(), source })?;

    controller.set_announcer(Some(session.clone())).await;
    for summary in controller.boards().await {
        if summary.shared {
            session.emit(&Message::ShareBoard(summary.id));
        }
    }
    Ok(session)
}

#[cfg(test)]
#[path = "discovery_test.rs"]
mod tests;
