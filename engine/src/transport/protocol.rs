//! Messages exchanged between loopback peers.
//!
//! All messages are JSON-ready and use snake_case type tags.

use crate::{AwarenessUpdate, ClientId, DocUpdate};
use serde::{Deserialize, Serialize};

/// Message delivered to a peer of a loopback room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PeerMessage {
    /// A peer joined; carries its full document and presence state.
    Hello {
        from: ClientId,
        state: DocUpdate,
        #[serde(default)]
        awareness: Option<AwarenessUpdate>,
    },

    /// Reply to `Hello` with the responder's full state.
    Welcome {
        from: ClientId,
        state: DocUpdate,
        #[serde(default)]
        awareness: Option<AwarenessUpdate>,
    },

    /// Incremental document update.
    Update { from: ClientId, update: DocUpdate },

    /// Presence update.
    Awareness {
        from: ClientId,
        update: AwarenessUpdate,
    },

    /// A peer left the room.
    Left { client_id: ClientId },

    /// The room lost its connection; peers must resync.
    Interrupted,
}

impl PeerMessage {
    /// Sender of the message, if it has one.
    pub fn sender(&self) -> Option<ClientId> {
        match self {
            PeerMessage::Hello { from, .. }
            | PeerMessage::Welcome { from, .. }
            | PeerMessage::Update { from, .. }
            | PeerMessage::Awareness { from, .. } => Some(*from),
            PeerMessage::Left { client_id } => Some(*client_id),
            PeerMessage::Interrupted => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn message_deserialization() {
        let json = r#"{"type": "left", "client_id": 7}"#;
        let msg: PeerMessage = serde_json::from_str(json).unwrap();
        assert_eq!(msg, PeerMessage::Left { client_id: 7 });
        assert_eq!(msg.sender(), Some(7));

        let json = r#"{"type": "interrupted"}"#;
        let msg: PeerMessage = serde_json::from_str(json).unwrap();
        assert_eq!(msg.sender(), None);
    }

    #[test]
    fn hello_without_awareness() {
        let json = r#"{"type": "hello", "from": 3, "state": []}"#;
        let msg: PeerMessage = serde_json::from_str(json).unwrap();
        match msg {
            PeerMessage::Hello {
                from,
                state,
                awareness,
            } => {
                assert_eq!(from, 3);
                assert!(state.is_empty());
                assert!(awareness.is_none());
            }
            _ => panic!("Expected Hello message"),
        }
    }

    #[test]
    fn awareness_message_serialization() {
        let msg = PeerMessage::Awareness {
            from: 1,
            update: AwarenessUpdate {
                client_id: 1,
                state: Some(json!({"user": {"id": "u1"}})),
                clock: 2,
            },
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""type":"awareness""#));
        assert!(json.contains(r#""clientId":1"#));
    }
}
