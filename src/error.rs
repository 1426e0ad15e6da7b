//! Error types for Switchboard

use thiserror::Error;

/// Result type alias for Switchboard operations
pub type Result<T> = std::result::Result<T, SwitchboardError>;

/// Main error type for Switchboard
#[derive(Error, Debug)]
pub enum SwitchboardError {
    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Scope already subscribed: {0}")]
    AlreadySubscribed(String),

    #[error("Unconfirmed after {waited_ms} ms (handle {handle})")]
    UnconfirmedTimeout { handle: u64, waited_ms: u64 },

    #[error("Optimistic buffer full ({0} pending entries)")]
    BufferFull(usize),

    #[error("Unknown pending handle: {0}")]
    UnknownHandle(u64),

    #[error("Row decode error: {0}")]
    Decode(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Session closed for scope {0}")]
    SessionClosed(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SwitchboardError {
    /// Check if error is retryable by the caller.
    ///
    /// Nothing inside the crate retries; this only informs the view layer
    /// whether offering "reconnect" or "resend" makes sense.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SwitchboardError::Channel(_)
                | SwitchboardError::Store(_)
                | SwitchboardError::UnconfirmedTimeout { .. }
        )
    }

    /// Get an HTTP status code for the development server
    pub fn status_code(&self) -> u16 {
        match self {
            SwitchboardError::InvalidInput(_) | SwitchboardError::Decode(_) => 400,
            SwitchboardError::UnknownHandle(_) => 404,
            SwitchboardError::AlreadySubscribed(_) => 409,
            SwitchboardError::BufferFull(_) => 429,
            SwitchboardError::Channel(_) | SwitchboardError::Store(_) => 502,
            SwitchboardError::SessionClosed(_) => 503,
            SwitchboardError::UnconfirmedTimeout { .. } => 504,
            _ => 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors() {
        assert!(SwitchboardError::Channel("socket closed".into()).is_retryable());
        assert!(SwitchboardError::UnconfirmedTimeout {
            handle: 1,
            waited_ms: 30_000
        }
        .is_retryable());
        assert!(!SwitchboardError::BufferFull(256).is_retryable());
        assert!(!SwitchboardError::Decode("missing id".into()).is_retryable());
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(SwitchboardError::BufferFull(1).status_code(), 429);
        assert_eq!(
            SwitchboardError::AlreadySubscribed("c1".into()).status_code(),
            409
        );
        assert_eq!(SwitchboardError::Internal("x".into()).status_code(), 500);
    }
}
