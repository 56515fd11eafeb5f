//! Presence manager - mirrors the peer set of a channel to the host.

use crate::hooks::Notifier;
use crate::{Awareness, ClientId};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Identity a device announces to its peers.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerUser {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    /// Any further host-defined fields
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl PeerUser {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_avatar(mut self, avatar: impl Into<String>) -> Self {
        self.avatar = Some(avatar.into());
        self
    }
}

/// One connected peer as reported to the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceEntry {
    pub client_id: ClientId,
    #[serde(flatten)]
    pub user: PeerUser,
    /// Whether this entry is the local device
    pub current: bool,
}

/// Publishes the local identity and re-announces the full peer list on
/// every presence change.
#[derive(Debug)]
pub struct PresenceManager {
    awareness: Arc<Awareness>,
    task: JoinHandle<()>,
}

impl PresenceManager {
    pub(crate) fn init(awareness: Arc<Awareness>, user: PeerUser, notifier: Notifier) -> Self {
        let client_id = awareness.client_id();
        let changes = awareness.subscribe();

        awareness.set_local_state(json!({ "clientId": client_id, "user": user }));
        notifier.awareness(&[PresenceEntry {
            client_id,
            user,
            current: true,
        }]);

        let task = tokio::spawn(watch_presence(Arc::clone(&awareness), changes, notifier));
        Self { awareness, task }
    }

    /// Current peer list.
    pub fn peers(&self) -> Vec<PresenceEntry> {
        peer_list(&self.awareness)
    }

    /// Leave the presence channel. Idempotent.
    pub fn destroy(&self) {
        self.task.abort();
        self.awareness.destroy();
    }
}

async fn watch_presence(
    awareness: Arc<Awareness>,
    mut changes: broadcast::Receiver<crate::AwarenessChange>,
    notifier: Notifier,
) {
    loop {
        match changes.recv().await {
            // Lagging only means several changes collapsed into one rebuild.
            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {
                notifier.awareness(&peer_list(&awareness));
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Every known peer, ordered by client id.
pub fn peer_list(awareness: &Awareness) -> Vec<PresenceEntry> {
    let local = awareness.client_id();
    let mut peers: Vec<PresenceEntry> = awareness
        .states()
        .into_values()
        .filter_map(|state| {
            let user = state.state.get("user").cloned()?;
            match serde_json::from_value::<PeerUser>(user) {
                Ok(user) => Some(PresenceEntry {
                    client_id: state.client_id,
                    user,
                    current: state.client_id == local,
                }),
                Err(e) => {
                    tracing::debug!(client_id = state.client_id, "ignoring malformed presence: {}", e);
                    None
                }
            }
        })
        .collect();
    peers.sort_by_key(|p| p.client_id);
    peers
}
