use thiserror::Error;

use crate::model::SessionState;

/// Failures while decoding an OSC packet. Always isolated to the offending
/// message or frame.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OscError {
    #[error("packet ended before {0} could be read")]
    UnexpectedEnd(&'static str),
    #[error("string is not null-terminated")]
    MissingTerminator,
    #[error("string is not valid UTF-8")]
    InvalidUtf8,
    #[error("address must start with '/', got {0:?}")]
    InvalidAddress(String),
}

/// Session-level failure taxonomy. Each variant maps onto one error state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("network error: {0}")]
    Network(String),
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("access denied by server")]
    Denied,
    #[error("parse error: {0}")]
    Parse(String),
}

impl SessionError {
    /// The state a session ends up in after this failure. Parse errors never
    /// change state.
    pub fn state(&self) -> Option<SessionState> {
        match self {
            SessionError::Network(_) => Some(SessionState::ErrorNetwork),
            SessionError::Timeout(_) => Some(SessionState::ErrorTimeout),
            SessionError::Denied => Some(SessionState::ErrorDenied),
            SessionError::Parse(_) => None,
        }
    }
}

impl From<serde_json::Error> for SessionError {
    fn from(value: serde_json::Error) -> Self {
        SessionError::Parse(value.to_string())
    }
}

impl From<std::io::Error> for SessionError {
    fn from(value: std::io::Error) -> Self {
        match value.kind() {
            std::io::ErrorKind::TimedOut => SessionError::Timeout(value.to_string()),
            _ => SessionError::Network(value.to_string()),
        }
    }
}
