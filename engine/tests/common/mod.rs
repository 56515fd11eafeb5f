//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tether_engine::{
    Awareness, Channel, Document, Error, EventSink, MemoryStore, PeerUser, Provider,
    ProviderEvent, ProviderOptions, Record, ReconnectPolicy, Result, Room, SyncConfig,
    SyncHooks, SyncParams, SyncStatus, TableId, Transport,
};

/// Transport whose providers do nothing but count themselves.
///
/// Every provider reports `connected` on creation; tests drive everything
/// else through [`MockTransport::emit`].
#[derive(Default)]
pub struct MockTransport {
    connects: AtomicUsize,
    live: Arc<AtomicUsize>,
    max_live: Arc<AtomicUsize>,
    failing: AtomicBool,
    sinks: Mutex<Vec<EventSink>>,
    ids: Mutex<Vec<String>>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Transport whose every connect fails.
    pub fn failing() -> Arc<Self> {
        let transport = Self::default();
        transport.failing.store(true, Ordering::SeqCst);
        Arc::new(transport)
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Providers created and not yet destroyed.
    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously live providers seen.
    pub fn max_live(&self) -> usize {
        self.max_live.load(Ordering::SeqCst)
    }

    pub fn provider_ids(&self) -> Vec<String> {
        self.ids.lock().unwrap().clone()
    }

    /// Send an event through the most recent provider.
    pub fn emit(&self, event: ProviderEvent) {
        if let Some(sink) = self.sinks.lock().unwrap().last() {
            let _ = sink.send(event);
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(
        &self,
        channel: &Channel,
        document: Arc<Document>,
        _options: &ProviderOptions,
        events: EventSink,
    ) -> Result<Arc<dyn Provider>> {
        let n = self.connects.fetch_add(1, Ordering::SeqCst) + 1;
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::Transport(format!("{} unreachable", channel.name)));
        }

        let live = self.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_live.fetch_max(live, Ordering::SeqCst);

        let id = format!("mock-{n}");
        self.ids.lock().unwrap().push(id.clone());
        let _ = events.send(ProviderEvent::Status { connected: true });
        self.sinks.lock().unwrap().push(events);

        Ok(Arc::new(MockProvider {
            id,
            awareness: Arc::new(Awareness::new(document.client_id())),
            live: Arc::clone(&self.live),
            destroyed: AtomicBool::new(false),
        }))
    }
}

struct MockProvider {
    id: String,
    awareness: Arc<Awareness>,
    live: Arc<AtomicUsize>,
    destroyed: AtomicBool,
}

#[async_trait]
impl Provider for MockProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn awareness(&self) -> Arc<Awareness> {
        Arc::clone(&self.awareness)
    }

    fn room(&self) -> Option<Arc<dyn Room>> {
        None
    }

    async fn disconnect(&self) {}

    async fn destroy(&self) {
        if !self.destroyed.swap(true, Ordering::SeqCst) {
            self.live.fetch_sub(1, Ordering::SeqCst);
            self.awareness.destroy();
        }
    }
}

/// Config for tests: no global guard, 1 s fixed retry.
pub fn test_config() -> SyncConfig {
    SyncConfig::default()
        .with_reinit_guard(false)
        .with_reconnect(ReconnectPolicy::fixed(Duration::from_secs(1)))
}

pub fn params(user: &str) -> SyncParams {
    SyncParams::new(Channel::new("home").with_password("hunter2"), PeerUser::new(user))
}

/// Hooks recording every status change.
pub fn status_recorder() -> (SyncHooks, Arc<Mutex<Vec<SyncStatus>>>) {
    let statuses = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&statuses);
    let hooks = SyncHooks::new().on_status_change(move |s| sink.lock().unwrap().push(s));
    (hooks, statuses)
}

/// Store holding `count` message rows.
pub fn seeded_store(count: usize) -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    store.seed(
        TableId::Messages,
        (0..count).map(|i| Record::new(format!("msg-{i:04}"), json!({"content": i}))),
    );
    store
}
