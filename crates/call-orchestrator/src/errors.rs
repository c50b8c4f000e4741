//! Call orchestrator error types.
//!
//! Error types map to signaling `ErrorCode` values for client responses.
//! Internal details are logged server-side but not exposed to clients.
//!
//! Match timeouts are not errors: a queue entry expiring is an expected
//! terminal outcome of matchmaking and is delivered as a
//! [`SessionEvent::MatchTimeout`](crate::actors::messages::SessionEvent) event.

use thiserror::Error;

/// Call orchestrator error type.
///
/// Maps to signaling `ErrorCode` values:
/// - `NotAMember`: `FORBIDDEN` (3)
/// - `SessionNotFound`, `NotConnected`: `NOT_FOUND` (4)
/// - `AlreadyInSession`: `CONFLICT` (5)
/// - `Internal`: `INTERNAL_ERROR` (6)
/// - `SessionFull`, `Draining`: `CAPACITY_EXCEEDED` (7)
#[derive(Debug, Error)]
pub enum CallError {
    /// User already belongs to an active call session.
    #[error("User is already in a session")]
    AlreadyInSession,

    /// Session does not exist (or has already ended).
    #[error("Session not found")]
    SessionNotFound,

    /// Session is at capacity, or no longer accepting members.
    #[error("Session is full")]
    SessionFull,

    /// User is not a member of the session.
    #[error("Not a member of this session")]
    NotAMember,

    /// User has no live connection registered with the registry.
    #[error("No live connection for user")]
    NotConnected,

    /// Registry is shutting down and not accepting new work.
    #[error("Registry is draining")]
    Draining,

    /// Internal error (actor channel failures and the like).
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CallError {
    /// Returns the signaling `ErrorCode` value for this error.
    pub fn error_code(&self) -> i32 {
        match self {
            CallError::NotAMember => 3,                              // FORBIDDEN
            CallError::SessionNotFound | CallError::NotConnected => 4, // NOT_FOUND
            CallError::AlreadyInSession => 5,                        // CONFLICT
            CallError::Internal(_) => 6,                             // INTERNAL_ERROR
            CallError::SessionFull | CallError::Draining => 7,       // CAPACITY_EXCEEDED
        }
    }

    /// Returns a client-safe error message (no internal details).
    pub fn client_message(&self) -> String {
        match self {
            CallError::Internal(_) => "An internal error occurred".to_string(),
            other => other.to_string(),
        }
    }
}

/// Client-local media errors.
///
/// These abort only the local call attempt and never affect the peer,
/// who observes a normal `PeerLeft`.
#[derive(Debug, Error)]
pub enum MediaError {
    /// Local media resource could not be acquired (e.g. no microphone).
    #[error("Media acquisition failed: {0}")]
    AcquisitionFailed(String),
}
