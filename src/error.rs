//! Error taxonomy for the session/connection core.
//!
//! Kinds are grouped by severity per the error handling design: per-message
//! failures that are recoverable on the peer, session-level setup failures,
//! local resource exhaustion, and fatal transport/connection errors. Only
//! the last group should ever be considered unrecoverable by a caller.

use thiserror::Error;

/// Reason code carried on reject responses and disconnect/error events.
///
/// Mirrors the wire-level `reason:u32` field written by
/// [`crate::framer::MessageFramer::write_setup_response`] for the `REJECT`
/// action, and the `reason` field of `CONNECTION_DISCONNECTED_EVENT` /
/// `SESSION_ERROR_EVENT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Reason {
    Success,
    InvalidSession,
    SessionRefused,
    SessionRedirected,
    SessionRejected,
    SessionDisconnected,
    NoResources,
    Other(u32),
}

impl Reason {
    pub fn as_wire(&self) -> u32 {
        match self {
            Reason::Success => 0,
            Reason::InvalidSession => 1,
            Reason::SessionRefused => 2,
            Reason::SessionRedirected => 3,
            Reason::SessionRejected => 4,
            Reason::SessionDisconnected => 5,
            Reason::NoResources => 6,
            Reason::Other(v) => *v,
        }
    }

    pub fn from_wire(v: u32) -> Self {
        match v {
            0 => Reason::Success,
            1 => Reason::InvalidSession,
            2 => Reason::SessionRefused,
            3 => Reason::SessionRedirected,
            4 => Reason::SessionRejected,
            5 => Reason::SessionDisconnected,
            6 => Reason::NoResources,
            other => Reason::Other(other),
        }
    }
}

/// The unified error type returned by every fallible public operation in
/// the core. Variant names match the abstract error kinds in the design
/// document (`MSG_NOT_FOUND`, `SESSION_REFUSED`, `NO_RESOURCES`, ...).
#[derive(Debug, Error)]
pub enum CoreError {
    /// A cancel request targeted a serial number with no matching in-flight task.
    #[error("message not found (serial {serial})")]
    MsgNotFound { serial: u64 },

    /// The in-flight task was canceled by a peer CANCEL-RESPONSE.
    #[error("message canceled (serial {serial})")]
    MsgCanceled { serial: u64 },

    /// A message or setup payload exceeded the buffer it was being framed into.
    #[error("message too large: {size} bytes exceeds limit of {limit} bytes")]
    MsgSize { size: usize, limit: usize },

    /// Framing failed: truncated header, bad length prefix, or invalid discriminant.
    #[error("malformed message: {0}")]
    MsgInvalid(String),

    /// The peer's transport refused the connection during CONNECT/REDIRECTED.
    #[error("session refused: {reason:?}")]
    SessionRefused { reason: Reason },

    /// Internal marker used while following a REDIRECT response; never
    /// surfaced to a caller as a terminal error.
    #[error("session redirected")]
    SessionRedirected,

    /// The peer explicitly rejected the setup request.
    #[error("session rejected: {reason:?}")]
    SessionRejected { reason: Reason, user_context: Vec<u8> },

    /// The session's connections are all gone; no further operations are possible.
    #[error("session disconnected")]
    SessionDisconnected,

    /// The task pool (or a size class within it) is exhausted.
    #[error("no resources available")]
    NoResources,

    /// A duplicate `connect()` was attempted for an already-bound (session, context) pair.
    #[error("connection already bound for this (session, context) pair")]
    AlreadyBound,

    /// An operation was attempted in a state that does not permit it
    /// (e.g. sending on a connection past DISCONNECT).
    #[error("invalid state for requested operation: {0}")]
    InvalidState(&'static str),

    /// A connection-level failure reported by the transport (not necessarily fatal
    /// to the owning session, whose other connections may survive).
    #[error("connection error: {0}")]
    ConnError(String),

    /// A fatal transport-layer failure.
    #[error("transport error: {0}")]
    TransportError(String),
}

impl From<std::io::Error> for CoreError {
    fn from(e: std::io::Error) -> Self {
        CoreError::TransportError(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
