//! Record types exchanged between the local store and the replicated document.

use crate::RecordId;
use serde::{Deserialize, Serialize};

/// Origin of a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    /// Produced by a transaction on this document
    Local,
    /// Received from a peer
    Remote,
}

/// A row of a local table.
///
/// The payload is opaque to the engine. It is copied verbatim into the
/// replicated map under `id`, and back out again on remote changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    /// Identifier, unique within its table and stable across devices
    pub id: RecordId,
    /// The row data (JSON value)
    pub payload: serde_json::Value,
}

impl Record {
    /// Create a new record.
    pub fn new(id: impl Into<RecordId>, payload: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn origin_serialization() {
        assert_eq!(serde_json::to_string(&Origin::Local).unwrap(), r#""local""#);
        assert_eq!(
            serde_json::to_string(&Origin::Remote).unwrap(),
            r#""remote""#
        );
    }

    #[test]
    fn record_new() {
        let record = Record::new("msg-1", json!({"content": "hi"}));
        assert_eq!(record.id, "msg-1");
        assert_eq!(record.payload["content"], "hi");
    }
}
