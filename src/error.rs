use std::io;

use thiserror::Error;

/// Why a join handshake was rejected. Both cases are recoverable for the
/// client: retry with a different name on a new connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum JoinError {
    #[error("invalid username: use 1-20 letters, digits, hyphens, or underscores")]
    InvalidName,
    #[error("username already taken")]
    NameTaken,
}

/// Failures on a single session's wire. None of these escape the connection
/// task that hit them; the worst cross-session effect is a departure notice.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("failed to write to peer: {0}")]
    SendFailed(#[source] io::Error),
    #[error("transport error: {0}")]
    Io(#[from] io::Error),
}
