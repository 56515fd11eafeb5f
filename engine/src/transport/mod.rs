//! Peer transport seam.
//!
//! A [`Transport`] builds one [`Provider`] per session. The provider binds
//! the session's [`Document`] to a channel, owns the presence sub-channel
//! ([`Awareness`]) and reports its lifecycle through [`ProviderEvent`]s sent
//! on the sink handed to [`Transport::connect`]. Handing the sink in up front
//! means no event can fire before the engine listens.
//!
//! [`LoopbackTransport`] connects providers living in the same process
//! through a [`LoopbackHub`].

mod loopback;
mod protocol;

pub use loopback::{LoopbackHub, LoopbackTransport, PeerSender};
pub use protocol::PeerMessage;

use crate::{error::Result, Awareness, ChannelName, Document};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Signaling endpoint used when the host does not provide one.
pub const DEFAULT_SIGNALING: &str = "wss://signaling.yjs.dev";

/// Channel descriptor shared by every device of a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Channel {
    pub name: ChannelName,
    #[serde(default)]
    pub password: Option<String>,
}

impl Channel {
    pub fn new(name: impl Into<ChannelName>) -> Self {
        Self {
            name: name.into(),
            password: None,
        }
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }
}

/// Options a provider is constructed with.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProviderOptions {
    pub password: Option<String>,
    pub signaling: Vec<String>,
}

/// Lifecycle events reported by a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProviderEvent {
    /// Connection to the channel went up or down.
    Status { connected: bool },
    /// Document state agreed (or stopped agreeing) with peers.
    Synced { synced: bool },
}

/// Sink for provider events.
pub type EventSink = mpsc::UnboundedSender<ProviderEvent>;

/// Factory of providers.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Connect `document` to `channel`.
    async fn connect(
        &self,
        channel: &Channel,
        document: Arc<Document>,
        options: &ProviderOptions,
        events: EventSink,
    ) -> Result<Arc<dyn Provider>>;
}

/// A live binding of one document to one channel.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Unique identifier of this provider instance.
    fn id(&self) -> &str;

    /// Presence sub-channel.
    fn awareness(&self) -> Arc<Awareness>;

    /// Underlying room/session object, when the transport has one.
    fn room(&self) -> Option<Arc<dyn Room>>;

    async fn disconnect(&self);

    async fn destroy(&self);
}

/// Room/session object owned by a provider.
#[async_trait]
pub trait Room: Send + Sync {
    async fn disconnect(&self);

    async fn destroy(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_event_format() {
        let json = serde_json::to_string(&ProviderEvent::Synced { synced: true }).unwrap();
        assert_eq!(json, r#"{"type":"synced","synced":true}"#);
    }

    #[test]
    fn channel_password_defaults_to_none() {
        let channel: Channel = serde_json::from_str(r#"{"name": "room"}"#).unwrap();
        assert_eq!(channel, Channel::new("room"));
    }
}
