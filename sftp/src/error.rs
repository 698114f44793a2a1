use crate::wire::WireError;

/// Errors that abort the connection.
///
/// Protocol-level failures (a non-OK status for some operation) are not represented here: tasks
/// handle those themselves and record them through [`crate::task::Context::record_failure`].
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("malformed data from server: {0}")]
    Wire(#[from] WireError),
    #[error("unexpected answer {answer} to request {request}")]
    UnexpectedAnswer { answer: String, request: String },
    #[error("answer for unknown request id {0}")]
    UnknownRequestId(u32),
    #[error("too many concurrent requests (out of request ids)")]
    TooManyRequests,
    #[error("server disconnected unexpectedly or ssh client process terminated")]
    Disconnected,
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("transport i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn unexpected(answer: impl std::fmt::Display, request: impl std::fmt::Display) -> Self {
        Error::UnexpectedAnswer {
            answer: answer.to_string(),
            request: request.to_string(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Error::Internal(message.into())
    }
}
