//! In-process transport.
//!
//! A [`LoopbackHub`] plays the role of the signaling server and the peer
//! mesh at once: it tracks the peers of every channel and relays
//! [`PeerMessage`]s between them. Joining a channel broadcasts the joiner's
//! full state; every peer already present answers with its own. The joiner
//! reports `synced` once every peer present at join time has answered or
//! left.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use super::{Channel, EventSink, PeerMessage, Provider, ProviderEvent, ProviderOptions, Room, Transport};
use crate::{error::Result, Awareness, ChannelName, ClientId, Document, Error};

/// Sender for messages to one peer.
pub type PeerSender = mpsc::UnboundedSender<PeerMessage>;

#[derive(Debug)]
struct RoomState {
    password: Option<String>,
    peers: HashMap<ClientId, PeerSender>,
}

/// Relay connecting loopback providers by channel name.
///
/// Thread-safe and can be shared across transports via `Arc`.
#[derive(Debug, Default)]
pub struct LoopbackHub {
    rooms: DashMap<ChannelName, RoomState>,
}

impl LoopbackHub {
    /// Create a new hub.
    pub fn new() -> Self {
        Self {
            rooms: DashMap::new(),
        }
    }

    /// Create a new hub wrapped in Arc for sharing.
    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Register a peer in a channel.
    ///
    /// The first peer sets the channel password. Returns the ids of the peers
    /// that were already present.
    pub fn join(
        &self,
        channel: &str,
        password: Option<&str>,
        client_id: ClientId,
        sender: PeerSender,
    ) -> Result<Vec<ClientId>> {
        let mut room = self
            .rooms
            .entry(channel.to_string())
            .or_insert_with(|| RoomState {
                password: password.map(str::to_string),
                peers: HashMap::new(),
            });

        if room.password.as_deref() != password {
            tracing::warn!(channel = %channel, client_id, "peer rejected: wrong password");
            return Err(Error::PasswordRejected(channel.to_string()));
        }

        let existing: Vec<ClientId> = room.peers.keys().copied().collect();
        room.peers.insert(client_id, sender);

        tracing::info!(
            channel = %channel,
            client_id,
            peers = room.peers.len(),
            "peer joined"
        );

        Ok(existing)
    }

    /// Unregister a peer and tell the others.
    pub fn leave(&self, channel: &str, client_id: ClientId) {
        let removed = match self.rooms.get_mut(channel) {
            Some(mut room) => room.peers.remove(&client_id).is_some(),
            None => false,
        };
        if !removed {
            return;
        }

        self.broadcast_except(channel, client_id, PeerMessage::Left { client_id });
        self.rooms.remove_if(channel, |_, room| room.peers.is_empty());

        tracing::info!(channel = %channel, client_id, "peer left");
    }

    /// Send a message to every peer of a channel except `sender`.
    ///
    /// Returns the number of peers that received the message.
    pub fn broadcast_except(&self, channel: &str, sender: ClientId, message: PeerMessage) -> usize {
        let Some(room) = self.rooms.get(channel) else {
            return 0;
        };

        let mut sent_count = 0;
        for (client_id, peer) in room.peers.iter() {
            if *client_id != sender && peer.send(message.clone()).is_ok() {
                sent_count += 1;
            }
        }

        tracing::trace!(
            channel = %channel,
            sender,
            recipients = sent_count,
            "relayed message"
        );

        sent_count
    }

    /// Send a message to one peer.
    pub fn send_to(&self, channel: &str, client_id: ClientId, message: PeerMessage) -> bool {
        self.rooms
            .get(channel)
            .and_then(|room| room.peers.get(&client_id).map(|p| p.send(message).is_ok()))
            .unwrap_or(false)
    }

    /// Simulate a connection loss: every peer of the channel reports
    /// `synced: false`. Returns the number of peers notified.
    pub fn interrupt(&self, channel: &str) -> usize {
        let Some(room) = self.rooms.get(channel) else {
            return 0;
        };
        let notified = room
            .peers
            .values()
            .filter(|peer| peer.send(PeerMessage::Interrupted).is_ok())
            .count();
        tracing::info!(channel = %channel, notified, "channel interrupted");
        notified
    }

    /// Number of peers in a channel.
    pub fn peer_count(&self, channel: &str) -> usize {
        self.rooms.get(channel).map(|r| r.peers.len()).unwrap_or(0)
    }

    /// Number of channels with at least one peer.
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }
}

/// [`Transport`] backed by a [`LoopbackHub`].
#[derive(Debug, Clone)]
pub struct LoopbackTransport {
    hub: Arc<LoopbackHub>,
}

impl LoopbackTransport {
    pub fn new(hub: Arc<LoopbackHub>) -> Self {
        Self { hub }
    }

    pub fn hub(&self) -> &Arc<LoopbackHub> {
        &self.hub
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn connect(
        &self,
        channel: &Channel,
        document: Arc<Document>,
        options: &ProviderOptions,
        events: EventSink,
    ) -> Result<Arc<dyn Provider>> {
        let client_id = document.client_id();
        let password = options.password.as_deref().or(channel.password.as_deref());

        // Subscribe before announcing so no local write slips between.
        let doc_updates = document.subscribe_updates()?;
        let awareness = Arc::new(Awareness::new(client_id));
        let presence_updates = awareness.subscribe_updates();

        let (tx, rx) = mpsc::unbounded_channel();
        let existing = self.hub.join(&channel.name, password, client_id, tx)?;

        let room = Arc::new(LoopbackRoom {
            hub: Arc::clone(&self.hub),
            channel: channel.name.clone(),
            client_id,
            tasks: Mutex::new(Vec::new()),
            left: AtomicBool::new(false),
        });
        let link = PeerLink {
            hub: Arc::clone(&self.hub),
            channel: channel.name.clone(),
            client_id,
        };

        let _ = events.send(ProviderEvent::Status { connected: true });
        link.broadcast(PeerMessage::Hello {
            from: client_id,
            state: document.encode_state(),
            awareness: awareness.local_update(),
        });
        if existing.is_empty() {
            let _ = events.send(ProviderEvent::Synced { synced: true });
        }

        let tasks = vec![
            tokio::spawn(run_inbound(
                link.clone(),
                rx,
                existing.into_iter().collect(),
                Arc::clone(&document),
                Arc::clone(&awareness),
                events.clone(),
            )),
            tokio::spawn(forward_document(link.clone(), doc_updates, events.clone())),
            tokio::spawn(forward_presence(link, presence_updates)),
        ];
        room.track(tasks);

        Ok(Arc::new(LoopbackProvider {
            id: uuid::Uuid::new_v4().to_string(),
            room,
            awareness,
            events,
            destroyed: AtomicBool::new(false),
        }))
    }
}

#[derive(Debug, Clone)]
struct PeerLink {
    hub: Arc<LoopbackHub>,
    channel: ChannelName,
    client_id: ClientId,
}

impl PeerLink {
    fn broadcast(&self, message: PeerMessage) -> usize {
        self.hub
            .broadcast_except(&self.channel, self.client_id, message)
    }

    fn send_to(&self, client_id: ClientId, message: PeerMessage) -> bool {
        self.hub.send_to(&self.channel, client_id, message)
    }
}

async fn run_inbound(
    link: PeerLink,
    mut rx: mpsc::UnboundedReceiver<PeerMessage>,
    mut awaiting: HashSet<ClientId>,
    document: Arc<Document>,
    awareness: Arc<Awareness>,
    events: EventSink,
) {
    let mut synced = awaiting.is_empty();
    let mut interrupted = false;

    while let Some(message) = rx.recv().await {
        if message.sender() == Some(link.client_id) {
            tracing::trace!(client_id = link.client_id, "dropping own message");
            continue;
        }
        let applied = match message {
            PeerMessage::Hello {
                from,
                state,
                awareness: presence,
            } => {
                if let Some(update) = presence {
                    awareness.apply_update(update);
                }
                let applied = document.apply_update(state);
                link.send_to(
                    from,
                    PeerMessage::Welcome {
                        from: link.client_id,
                        state: document.encode_state(),
                        awareness: awareness.local_update(),
                    },
                );
                applied
            }
            PeerMessage::Welcome {
                from,
                state,
                awareness: presence,
            } => {
                if let Some(update) = presence {
                    awareness.apply_update(update);
                }
                awaiting.remove(&from);
                document.apply_update(state)
            }
            PeerMessage::Update { update, .. } => document.apply_update(update),
            PeerMessage::Awareness { update, .. } => {
                awareness.apply_update(update);
                Ok(())
            }
            PeerMessage::Left { client_id } => {
                awaiting.remove(&client_id);
                awareness.remove_client(client_id);
                Ok(())
            }
            PeerMessage::Interrupted => {
                synced = false;
                interrupted = true;
                let _ = events.send(ProviderEvent::Synced { synced: false });
                Ok(())
            }
        };

        if let Err(e) = applied {
            tracing::debug!(client_id = link.client_id, "inbound relay stopped: {}", e);
            break;
        }

        if !synced && !interrupted && awaiting.is_empty() {
            synced = true;
            let _ = events.send(ProviderEvent::Synced { synced: true });
        }
    }
}

async fn forward_document(
    link: PeerLink,
    mut updates: broadcast::Receiver<crate::DocUpdate>,
    events: EventSink,
) {
    loop {
        match updates.recv().await {
            Ok(update) => {
                link.broadcast(PeerMessage::Update {
                    from: link.client_id,
                    update,
                });
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                // Peers missed updates; only a full resync recovers them.
                tracing::warn!(client_id = link.client_id, skipped, "document updates lagged");
                let _ = events.send(ProviderEvent::Synced { synced: false });
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn forward_presence(link: PeerLink, mut updates: broadcast::Receiver<crate::AwarenessUpdate>) {
    loop {
        match updates.recv().await {
            Ok(update) => {
                link.broadcast(PeerMessage::Awareness {
                    from: link.client_id,
                    update,
                });
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::debug!(client_id = link.client_id, skipped, "presence updates lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Membership of one provider in a hub channel.
#[derive(Debug)]
struct LoopbackRoom {
    hub: Arc<LoopbackHub>,
    channel: ChannelName,
    client_id: ClientId,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    left: AtomicBool,
}

impl LoopbackRoom {
    fn track(&self, handles: Vec<JoinHandle<()>>) {
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend(handles);
    }
}

#[async_trait]
impl Room for LoopbackRoom {
    async fn disconnect(&self) {
        if !self.left.swap(true, Ordering::SeqCst) {
            self.hub.leave(&self.channel, self.client_id);
        }
    }

    async fn destroy(&self) {
        self.disconnect().await;
        let handles: Vec<_> = self
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for handle in handles {
            handle.abort();
        }
    }
}

/// Provider handed out by [`LoopbackTransport`].
struct LoopbackProvider {
    id: String,
    room: Arc<LoopbackRoom>,
    awareness: Arc<Awareness>,
    events: EventSink,
    destroyed: AtomicBool,
}

#[async_trait]
impl Provider for LoopbackProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn awareness(&self) -> Arc<Awareness> {
        Arc::clone(&self.awareness)
    }

    fn room(&self) -> Option<Arc<dyn Room>> {
        Some(Arc::clone(&self.room) as Arc<dyn Room>)
    }

    async fn disconnect(&self) {
        if !self.room.left.load(Ordering::SeqCst) {
            self.room.disconnect().await;
            let _ = self.events.send(ProviderEvent::Status { connected: false });
        }
    }

    async fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.room.destroy().await;
        self.awareness.destroy();
        tracing::debug!(provider = %self.id, "provider destroyed");
    }
}
