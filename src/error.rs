//! Error types for the ESL engine

use thiserror::Error;

/// Result alias used throughout the crate.
pub type EslResult<T> = Result<T, EslError>;

/// Errors surfaced by the parser, the connection endpoint and the call server.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EslError {
    /// Transport failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A `text/event-json` body that is not valid JSON.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Framing violation or desync; the connection cannot continue.
    #[error("protocol error: {message}")]
    ProtocolError { message: String },

    /// A framing header carried an unusable value.
    #[error("invalid header: {header}")]
    InvalidHeader { header: String },

    /// The stream ended while an operation was waiting on it.
    #[error("connection closed")]
    ConnectionClosed,

    /// `send` after `end()` or after the peer went away.
    #[error("not connected")]
    NotConnected,

    /// A newer command replaced this command's reply listener.
    #[error("reply listener superseded by a later command")]
    ReplySuperseded,

    /// Dial timeout (client role).
    #[error("timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// The switch rejected `auth`.
    #[error("authentication failed: {reason}")]
    AuthFailed { reason: String },

    /// Reply-Text started with `-ERR`.
    #[error("command failed: {reply_text}")]
    CommandFailed { reply_text: String },

    /// Reply-Text matched neither `+OK` nor `-ERR` where one was required.
    #[error("unexpected reply: {reply_text}")]
    UnexpectedReply { reply_text: String },

    /// One or more events were dropped because the consumer fell behind.
    #[error("event queue full, events dropped")]
    QueueFull,
}

impl EslError {
    pub(crate) fn protocol_error(message: impl Into<String>) -> Self {
        EslError::ProtocolError {
            message: message.into(),
        }
    }

    pub(crate) fn auth_failed(reason: impl Into<String>) -> Self {
        EslError::AuthFailed {
            reason: reason.into(),
        }
    }

    /// Whether the error ends the connection (as opposed to a per-event failure).
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            EslError::Io(_)
                | EslError::ProtocolError { .. }
                | EslError::InvalidHeader { .. }
                | EslError::ConnectionClosed
                | EslError::NotConnected
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_errors_are_not_fatal() {
        let err: EslError = serde_json::from_str::<serde_json::Value>("{nope")
            .unwrap_err()
            .into();
        assert!(!err.is_fatal());
        assert!(err
            .to_string()
            .starts_with("JSON error"));
    }

    #[test]
    fn protocol_errors_are_fatal() {
        assert!(EslError::protocol_error("desync").is_fatal());
        assert!(EslError::ConnectionClosed.is_fatal());
        assert!(!EslError::ReplySuperseded.is_fatal());
    }
}
