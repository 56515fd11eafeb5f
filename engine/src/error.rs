//! Error types for the Tether engine.

use crate::{ChannelName, RecordId};
use thiserror::Error;

/// All possible errors from the Tether engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Environment errors
    #[error("no async runtime available")]
    EnvironmentUnavailable,

    #[error("sync has not been started")]
    NotStarted,

    // Document errors
    #[error("document has been destroyed")]
    DocumentDestroyed,

    #[error("invalid document update: {0}")]
    InvalidUpdate(String),

    #[error("unknown table: {0}")]
    UnknownTable(String),

    // Local store errors
    #[error("local store error on record {id}: {message}")]
    Store { id: RecordId, message: String },

    #[error("local store is closed")]
    StoreClosed,

    #[error("write cancelled by session teardown")]
    Cancelled,

    // Transport errors
    #[error("transport error: {0}")]
    Transport(String),

    #[error("password rejected for channel: {0}")]
    PasswordRejected(ChannelName),
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = Error::UnknownTable("users".into());
        assert_eq!(err.to_string(), "unknown table: users");

        let err = Error::Store {
            id: "msg-1".into(),
            message: "disk full".into(),
        };
        assert_eq!(
            err.to_string(),
            "local store error on record msg-1: disk full"
        );

        let err = Error::PasswordRejected("room-a".into());
        assert_eq!(err.to_string(), "password rejected for channel: room-a");
    }
}
