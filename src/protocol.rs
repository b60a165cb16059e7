//! Protocol messages — the typed vocabulary exchanged between peers.
//!
//! ARCHITECTURE
//! ============
//! Every frame on a peer link is one `Message`. The session layer decodes
//! frames into messages and hands each one to a single handler function,
//! which matches on the variant. There is no per-name callback
//! registration; adding a message means adding a variant.
//!
//! DESIGN
//! ======
//! - Payload grammar is parsed at the boundary: a message that exists is
//!   well-formed, so handlers never re-validate identifiers or versions.
//! - `*_UPDATE` and `BOARD_DATA` carry the owner's full post-mutation
//!   snapshot. `*_ACCEPTED` carry the proposer's base version; a path
//!   proposal carries the new path as its last fragment.

use uuid::Uuid;

use crate::board::{BoardError, BoardId, BoardPayload, Mutation, Path};

// =============================================================================
// EVENT NAMES
// =============================================================================

pub mod event {
    pub const LISTEN: &str = "LISTEN";
    pub const UNLISTEN: &str = "UNLISTEN";
    pub const GET_BOARD_DATA: &str = "GET_BOARD_DATA";
    pub const BOARD_DATA: &str = "BOARD_DATA";
    pub const PATH_UPDATE: &str = "PATH_UPDATE";
    pub const PATH_ACCEPTED: &str = "PATH_ACCEPTED";
    pub const UNDO_UPDATE: &str = "UNDO_UPDATE";
    pub const UNDO_ACCEPTED: &str = "UNDO_ACCEPTED";
    pub const CLEAR_UPDATE: &str = "CLEAR_UPDATE";
    pub const CLEAR_ACCEPTED: &str = "CLEAR_ACCEPTED";
    pub const BOARD_DELETED: &str = "BOARD_DELETED";
    pub const BOARD_ERROR: &str = "BOARD_ERROR";

    // Directory service.
    pub const SHARE_BOARD: &str = "SHARE_BOARD";
    pub const UNSHARE_BOARD: &str = "UNSHARE_BOARD";
    pub const SHARING_BOARD: &str = "SHARING_BOARD";
    pub const UNSHARING_BOARD: &str = "UNSHARING_BOARD";
}

// =============================================================================
// ERROR CODES
// =============================================================================

/// Grepable error code for errors that are reported to a peer.
pub trait ErrorCode: std::fmt::Display {
    fn error_code(&self) -> &'static str;
}

/// Render an error as the free-text `BOARD_ERROR` payload.
#[must_use]
pub fn error_notice(err: &(impl ErrorCode + ?Sized)) -> String {
    format!("{}: {err}", err.error_code())
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("unknown event: {0}")]
    UnknownEvent(String),
    #[error("bad {event} payload: {source}")]
    Payload {
        event: String,
        #[source]
        source: BoardError,
    },
    #[error("{0} carries no path")]
    MissingPath(&'static str),
}

impl ErrorCode for ProtocolError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::UnknownEvent(_) => "E_UNKNOWN_EVENT",
            Self::Payload { .. } => "E_MALFORMED_PAYLOAD",
            Self::MissingPath(_) => "E_MISSING_PATH",
        }
    }
}

// =============================================================================
// MESSAGE
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Subscriber → owner: add me to the board's listener set.
    Listen(BoardId),
    /// Subscriber → owner: remove me from the board's listener set.
    Unlisten(BoardId),
    /// Subscriber → owner: send a full snapshot.
    GetBoardData(BoardId),
    /// Owner → subscriber: full snapshot.
    BoardData(BoardPayload),
    PathUpdate(BoardPayload),
    PathAccepted(BoardPayload),
    UndoUpdate(BoardPayload),
    UndoAccepted(BoardPayload),
    ClearUpdate(BoardPayload),
    ClearAccepted(BoardPayload),
    /// Owner → subscribers: the board is gone.
    BoardDeleted(BoardId),
    /// Free-text protocol error. Fatal for the receiving session.
    BoardError(String),
    /// Peer → directory: announce a board as shared.
    ShareBoard(BoardId),
    /// Peer → directory: withdraw a shared board.
    UnshareBoard(BoardId),
    /// Directory → peers: a board is now shared.
    SharingBoard(BoardId),
    /// Directory → peers: a board is no longer shared.
    UnsharingBoard(BoardId),
}

impl Message {
    /// The wire event name.
    #[must_use]
    pub fn event(&self) -> &'static str {
        match self {
            Self::Listen(_) => event::LISTEN,
            Self::Unlisten(_) => event::UNLISTEN,
            Self::GetBoardData(_) => event::GET_BOARD_DATA,
            Self::BoardData(_) => event::BOARD_DATA,
            Self::PathUpdate(_) => event::PATH_UPDATE,
            Self::PathAccepted(_) => event::PATH_ACCEPTED,
            Self::UndoUpdate(_) => event::UNDO_UPDATE,
            Self::UndoAccepted(_) => event::UNDO_ACCEPTED,
            Self::ClearUpdate(_) => event::CLEAR_UPDATE,
            Self::ClearAccepted(_) => event::CLEAR_ACCEPTED,
            Self::BoardDeleted(_) => event::BOARD_DELETED,
            Self::BoardError(_) => event::BOARD_ERROR,
            Self::ShareBoard(_) => event::SHARE_BOARD,
            Self::UnshareBoard(_) => event::UNSHARE_BOARD,
            Self::SharingBoard(_) => event::SHARING_BOARD,
            Self::UnsharingBoard(_) => event::UNSHARING_BOARD,
        }
    }

    /// The board this message concerns, if any.
    #[must_use]
    pub fn board_id(&self) -> Option<&BoardId> {
        match self {
            Self::Listen(id)
            | Self::Unlisten(id)
            | Self::GetBoardData(id)
            | Self::BoardDeleted(id)
            | Self::ShareBoard(id)
            | Self::UnshareBoard(id)
            | Self::SharingBoard(id)
            | Self::UnsharingBoard(id) => Some(id),
            Self::BoardData(p)
            | Self::PathUpdate(p)
            | Self::PathAccepted(p)
            | Self::UndoUpdate(p)
            | Self::UndoAccepted(p)
            | Self::ClearUpdate(p)
            | Self::ClearAccepted(p) => Some(&p.id),
            Self::BoardError(_) => None,
        }
    }

    /// The wire payload string.
    #[must_use]
    pub fn payload(&self) -> String {
        match self {
            Self::Listen(id)
            | Self::Unlisten(id)
            | Self::GetBoardData(id)
            | Self::BoardDeleted(id)
            | Self::ShareBoard(id)
            | Self::UnshareBoard(id)
            | Self::SharingBoard(id)
            | Self::UnsharingBoard(id) => id.to_string(),
            Self::BoardData(p)
            | Self::PathUpdate(p)
            | Self::PathAccepted(p)
            | Self::UndoUpdate(p)
            | Self::UndoAccepted(p)
            | Self::ClearUpdate(p)
            | Self::ClearAccepted(p) => p.to_string(),
            Self::BoardError(text) => text.clone(),
        }
    }

    /// Build a `BOARD_ERROR` notice from a typed error.
    #[must_use]
    pub fn error_from(err: &(impl ErrorCode + ?Sized)) -> Self {
        Self::BoardError(error_notice(err))
    }

    /// The broadcast message announcing an accepted mutation. `snapshot`
    /// is the board after the mutation.
    #[must_use]
    pub fn update_for(mutation: &Mutation, snapshot: BoardPayload) -> Self {
        match mutation {
            Mutation::AddPath(_) => Self::PathUpdate(snapshot),
            Mutation::Undo => Self::UndoUpdate(snapshot),
            Mutation::Clear => Self::ClearUpdate(snapshot),
        }
    }

    /// The relay message asking the owner to apply `mutation` on top of
    /// `base_version`.
    #[must_use]
    pub fn relay_for(id: BoardId, mutation: &Mutation, base_version: u64) -> Self {
        let payload = |paths: Vec<Path>| BoardPayload { id: id.clone(), version: base_version, paths };
        match mutation {
            Mutation::AddPath(path) => Self::PathAccepted(payload(vec![path.clone()])),
            Mutation::Undo => Self::UndoAccepted(payload(Vec::new())),
            Mutation::Clear => Self::ClearAccepted(payload(Vec::new())),
        }
    }

    /// Encode as a wire frame with a fresh id.
    #[must_use]
    pub fn to_frame(&self) -> frames::Frame {
        frames::Frame::new(Uuid::new_v4().to_string(), self.event(), self.payload())
    }

    /// Decode a wire frame.
    ///
    /// # Errors
    ///
    /// Returns `UnknownEvent` for an unrecognised event name, `Payload` when
    /// the payload does not match the event's grammar, and `MissingPath`
    /// for a `PATH_ACCEPTED` without a path fragment.
    pub fn from_frame(frame: &frames::Frame) -> Result<Self, ProtocolError> {
        let event_name = frame.event.as_str();
        let raw = frame.payload.as_str();
        let bad = |source: BoardError| ProtocolError::Payload { event: event_name.to_owned(), source };
        let id = || raw.parse::<BoardId>().map_err(bad);
        let snapshot = || raw.parse::<BoardPayload>().map_err(bad);

        let message = match event_name {
            event::LISTEN => Self::Listen(id()?),
            event::UNLISTEN => Self::Unlisten(id()?),
            event::GET_BOARD_DATA => Self::GetBoardData(id()?),
            event::BOARD_DATA => Self::BoardData(snapshot()?),
            event::PATH_UPDATE => Self::PathUpdate(snapshot()?),
            event::PATH_ACCEPTED => {
                let payload = snapshot()?;
                if payload.last_path().is_none() {
                    return Err(ProtocolError::MissingPath(event::PATH_ACCEPTED));
                }
                Self::PathAccepted(payload)
            }
            event::UNDO_UPDATE => Self::UndoUpdate(snapshot()?),
            event::UNDO_ACCEPTED => Self::UndoAccepted(snapshot()?),
            event::CLEAR_UPDATE => Self::ClearUpdate(snapshot()?),
            event::CLEAR_ACCEPTED => Self::ClearAccepted(snapshot()?),
            event::BOARD_DELETED => Self::BoardDeleted(id()?),
            event::BOARD_ERROR => Self::BoardError(raw.to_owned()),
            event::SHARE_BOARD => Self::ShareBoard(id()?),
            event::UNSHARE_BOARD => Self::UnshareBoard(id()?),
            event::SHARING_BOARD => Self::SharingBoard(id()?),
            event::UNSHARING_BOARD => Self::UnsharingBoard(id()?),
            other => return Err(ProtocolError::UnknownEvent(other.to_owned())),
        };
        Ok(message)
    }
}

#[cfg(test)]
#[path = "protocol_test.rs"]
mod tests;
