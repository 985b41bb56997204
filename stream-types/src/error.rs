//! Error types for fedistream.

use thiserror::Error;

/// Errors raised while turning wire records into typed operations.
#[derive(Debug, Error)]
pub enum StreamError {
    /// JSON decoding failed
    #[error("invalid JSON payload: {0}")]
    Json(#[from] serde_json::Error),

    /// Event name has no operation mapping
    #[error("unrecognized event: {0}")]
    UnrecognizedEvent(String),

    /// Unknown entity type string
    #[error("unknown entity type: {0}")]
    UnknownEntityType(String),

    /// A required field is missing or has the wrong shape
    #[error("missing or invalid field: {0}")]
    MissingField(&'static str),

    /// Operation failed shape validation
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = StreamError::UnrecognizedEvent("filters_changed".into());
        assert_eq!(err.to_string(), "unrecognized event: filters_changed");
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<StreamError>();
    }
}
