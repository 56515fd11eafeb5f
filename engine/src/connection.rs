//! Connection manager - owns the one live sync session.
//!
//! A session is a document, the bridge observing it, a provider binding it to
//! a channel, and the presence published through that provider. Sessions are
//! created by [`ConnectionManager::connect`] and replaced wholesale on every
//! reconnect: the old session is torn down completely before the next one is
//! built, under one async mutex, so at most one provider is alive at a time.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::bridge::{BridgeSettings, TableBridge};
use crate::hooks::Notifier;
use crate::presence::peer_list;
use crate::{
    error::Result, Awareness, Channel, Document, DocumentHandle, Error, LocalStore, PeerUser,
    PresenceEntry, PresenceManager, Provider, ProviderEvent, ProviderOptions, SyncConfig,
    SyncHooks, SyncStatus, TableId, Transport,
};

/// What a session connects with.
#[derive(Debug, Clone)]
pub struct SyncParams {
    pub channel: Channel,
    /// Signaling endpoints; empty means the configured defaults
    pub signaling: Vec<String>,
    pub user: PeerUser,
    pub hooks: SyncHooks,
}

impl SyncParams {
    pub fn new(channel: Channel, user: PeerUser) -> Self {
        Self {
            channel,
            signaling: Vec::new(),
            user,
            hooks: SyncHooks::default(),
        }
    }

    pub fn with_signaling(mut self, endpoints: Vec<String>) -> Self {
        self.signaling = endpoints;
        self
    }

    pub fn with_hooks(mut self, hooks: SyncHooks) -> Self {
        self.hooks = hooks;
        self
    }
}

struct Session {
    id: u64,
    handle: DocumentHandle,
    cancel: CancellationToken,
    bridge: Arc<TableBridge>,
    provider: Arc<dyn Provider>,
    presence: PresenceManager,
    events: JoinHandle<()>,
}

impl Drop for Session {
    // Best effort when the manager is dropped without a shutdown; the async
    // room and provider teardown only runs through `ConnectionManager::close`.
    fn drop(&mut self) {
        self.cancel.cancel();
        self.events.abort();
        self.bridge.stop();
        self.presence.destroy();
        self.handle.destroy();
    }
}

/// Read-side view of the live session for synchronous accessors.
struct Live {
    document: Arc<Document>,
    awareness: Arc<Awareness>,
    provider_id: String,
}

/// Builds, replaces and tears down sync sessions.
pub struct ConnectionManager {
    this: Weak<ConnectionManager>,
    transport: Arc<dyn Transport>,
    store: Arc<dyn LocalStore>,
    config: SyncConfig,
    session: tokio::sync::Mutex<Option<Session>>,
    params: Mutex<Option<SyncParams>>,
    live: RwLock<Option<Live>>,
    status: Arc<watch::Sender<Option<SyncStatus>>>,
    attempts: AtomicU32,
    retry: Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
    next_session: AtomicU64,
}

impl ConnectionManager {
    pub fn new(
        transport: Arc<dyn Transport>,
        store: Arc<dyn LocalStore>,
        config: SyncConfig,
    ) -> Arc<Self> {
        let (status, _) = watch::channel(None);
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            transport,
            store,
            config,
            session: tokio::sync::Mutex::new(None),
            params: Mutex::new(None),
            live: RwLock::new(None),
            status: Arc::new(status),
            attempts: AtomicU32::new(0),
            retry: Mutex::new(None),
            stopped: AtomicBool::new(false),
            next_session: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Replace any current session with a fresh one for `params`.
    pub async fn connect(&self, params: SyncParams) {
        self.stopped.store(false, Ordering::SeqCst);
        self.attempts.store(0, Ordering::SeqCst);
        self.cancel_retry();
        self.establish(params).await;
    }

    /// Full teardown followed by a new session. Keeps the attempt count.
    ///
    /// A pending backoff retry is dropped; this reconnect replaces it.
    pub async fn reconnect(&self, params: SyncParams) {
        self.stopped.store(false, Ordering::SeqCst);
        self.cancel_retry();
        self.establish(params).await;
    }

    /// Reconnect with the last-used parameters.
    pub async fn manual_sync(&self) -> Result<()> {
        let params = self.last_params().ok_or(Error::NotStarted)?;
        tracing::info!(channel = %params.channel.name, "manual sync requested");
        self.connect(params).await;
        Ok(())
    }

    /// Tear down the current session, if any. Idempotent.
    pub async fn clean_connection(&self) {
        let mut session = self.session.lock().await;
        if let Some(old) = session.take() {
            self.close(old).await;
        }
    }

    /// Stop for good: cancel pending retries and tear the session down.
    pub async fn shutdown(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.cancel_retry();
        self.clean_connection().await;
        *self.params.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    pub fn status(&self) -> Option<SyncStatus> {
        *self.status.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<Option<SyncStatus>> {
        self.status.subscribe()
    }

    /// The live session's document.
    pub fn document(&self) -> Option<Arc<Document>> {
        self.read_live(|live| Arc::clone(&live.document))
    }

    /// Peers of the live session, local device included.
    pub fn peers(&self) -> Vec<PresenceEntry> {
        self.read_live(|live| peer_list(&live.awareness))
            .unwrap_or_default()
    }

    /// Identifier of the live provider.
    pub fn provider_id(&self) -> Option<String> {
        self.read_live(|live| live.provider_id.clone())
    }

    /// Reconnect attempts since the last successful sync.
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    fn read_live<R>(&self, f: impl FnOnce(&Live) -> R) -> Option<R> {
        self.live
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(f)
    }

    fn last_params(&self) -> Option<SyncParams> {
        self.params
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn notifier(&self, hooks: SyncHooks) -> Notifier {
        Notifier::new(hooks, Arc::clone(&self.status))
    }

    async fn establish(&self, params: SyncParams) {
        let mut session = self.session.lock().await;
        // A retry that lost the race against shutdown must not resurrect the session.
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        if let Some(old) = session.take() {
            self.close(old).await;
        }
        *self.params.lock().unwrap_or_else(|e| e.into_inner()) = Some(params.clone());
        *session = self.open(&params).await;
    }

    async fn open(&self, params: &SyncParams) -> Option<Session> {
        let id = self.next_session.fetch_add(1, Ordering::SeqCst) + 1;
        let notifier = self.notifier(params.hooks.clone());

        let mut handle = DocumentHandle::new();
        let document = match handle.try_init() {
            Ok(document) => document,
            Err(e) => {
                tracing::warn!(session = id, "sync disabled: {}", e);
                return None;
            }
        };

        let cancel = CancellationToken::new();
        let bridge = Arc::new(TableBridge::new(
            Arc::clone(&document),
            Arc::clone(&self.store),
            BridgeSettings::from(&self.config),
            notifier.clone(),
            cancel.clone(),
        ));
        for &table in &self.config.tables {
            if let Err(e) = bridge.observe_table(table) {
                tracing::warn!(session = id, table = %table, "cannot observe table: {}", e);
            }
        }

        let options = ProviderOptions {
            password: params.channel.password.clone(),
            signaling: if params.signaling.is_empty() {
                self.config.signaling.clone()
            } else {
                params.signaling.clone()
            },
        };
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let provider = match self
            .transport
            .connect(&params.channel, Arc::clone(&document), &options, events_tx)
            .await
        {
            Ok(provider) => provider,
            Err(e) => {
                tracing::warn!(
                    session = id,
                    channel = %params.channel.name,
                    "provider construction failed: {}",
                    e
                );
                bridge.stop();
                handle.destroy();
                self.schedule_reconnect(&params.hooks);
                return None;
            }
        };

        let awareness = provider.awareness();
        let presence = PresenceManager::init(
            Arc::clone(&awareness),
            params.user.clone(),
            notifier.clone(),
        );
        let events = tokio::spawn(run_events(
            self.this.clone(),
            id,
            events_rx,
            Arc::clone(&bridge),
            notifier,
            params.hooks.clone(),
            self.config.tables.clone(),
        ));

        tracing::info!(
            session = id,
            channel = %params.channel.name,
            provider = %provider.id(),
            client_id = document.client_id(),
            "session opened"
        );
        *self.live.write().unwrap_or_else(|e| e.into_inner()) = Some(Live {
            document,
            awareness,
            provider_id: provider.id().to_string(),
        });

        Some(Session {
            id,
            handle,
            cancel,
            bridge,
            provider,
            presence,
            events,
        })
    }

    async fn close(&self, mut session: Session) {
        *self.live.write().unwrap_or_else(|e| e.into_inner()) = None;

        session.cancel.cancel();
        session.events.abort();
        session.bridge.stop();
        session.presence.destroy();
        if let Some(room) = session.provider.room() {
            room.disconnect().await;
            room.destroy().await;
        }
        session.provider.disconnect().await;
        session.provider.destroy().await;
        session.handle.destroy();

        tracing::info!(session = session.id, provider = %session.provider.id(), "session closed");
    }

    /// Arrange one delayed reconnect. Calls while one is pending coalesce.
    fn schedule_reconnect(&self, hooks: &SyncHooks) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }

        let mut retry = self.retry.lock().unwrap_or_else(|e| e.into_inner());
        if retry.as_ref().is_some_and(|task| !task.is_finished()) {
            tracing::debug!("reconnect already scheduled");
            return;
        }

        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        let Some(delay) = self.config.reconnect.delay_for(attempt) else {
            let attempts = attempt - 1;
            self.attempts.store(attempts, Ordering::SeqCst);
            tracing::warn!(attempts, "giving up reconnecting");
            self.notifier(hooks.clone()).give_up(attempts);
            return;
        };

        tracing::warn!(
            attempt,
            delay_ms = delay.as_millis() as u64,
            "sync lost, reconnect scheduled"
        );
        let this = self.this.clone();
        *retry = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(manager) = this.upgrade() else {
                return;
            };
            // Leave the slot free so a failure inside this attempt can schedule the next.
            drop(
                manager
                    .retry
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .take(),
            );
            if manager.stopped.load(Ordering::SeqCst) {
                return;
            }
            let Some(params) = manager.last_params() else {
                return;
            };
            manager.notifier(params.hooks.clone()).status(SyncStatus::Syncing);
            manager.reconnect(params).await;
        }));
    }

    fn cancel_retry(&self) {
        if let Some(task) = self.retry.lock().unwrap_or_else(|e| e.into_inner()).take() {
            task.abort();
        }
    }
}

async fn run_events(
    manager: Weak<ConnectionManager>,
    session: u64,
    mut events: mpsc::UnboundedReceiver<ProviderEvent>,
    bridge: Arc<TableBridge>,
    notifier: Notifier,
    hooks: SyncHooks,
    tables: Vec<TableId>,
) {
    while let Some(event) = events.recv().await {
        tracing::debug!(session, ?event, "provider event");
        match event {
            ProviderEvent::Status { connected: true } => notifier.status(SyncStatus::Ready),
            ProviderEvent::Status { connected: false } => {}
            ProviderEvent::Synced { synced: true } => {
                if let Some(manager) = manager.upgrade() {
                    manager.attempts.store(0, Ordering::SeqCst);
                }
                notifier.status(SyncStatus::Syncing);
                let loads = bridge.load_all_tables(&tables).await;
                let loaded: usize = loads.iter().filter_map(|l| l.result.as_ref().ok()).sum();
                tracing::info!(session, records = loaded, "bootstrap complete");
                notifier.status(SyncStatus::Synced);
            }
            ProviderEvent::Synced { synced: false } => match manager.upgrade() {
                Some(manager) => manager.schedule_reconnect(&hooks),
                None => break,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{LoopbackHub, LoopbackTransport, MemoryStore, ReconnectPolicy};
    use std::time::Duration;

    fn manager(hub: &Arc<LoopbackHub>) -> Arc<ConnectionManager> {
        ConnectionManager::new(
            Arc::new(LoopbackTransport::new(Arc::clone(hub))),
            Arc::new(MemoryStore::new()),
            SyncConfig::default()
                .with_reinit_guard(false)
                .with_reconnect(ReconnectPolicy::fixed(Duration::from_secs(1))),
        )
    }

    fn params(user: &str) -> SyncParams {
        SyncParams::new(Channel::new("room").with_password("pw"), PeerUser::new(user))
    }

    #[tokio::test(start_paused = true)]
    async fn connect_reaches_synced() {
        let hub = LoopbackHub::new_shared();
        let manager = manager(&hub);
        manager.connect(params("alice")).await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(manager.status(), Some(SyncStatus::Synced));
        assert!(manager.document().is_some());
        assert_eq!(manager.peers().len(), 1);
        assert_eq!(hub.peer_count("room"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_replaces_provider() {
        let hub = LoopbackHub::new_shared();
        let manager = manager(&hub);
        manager.connect(params("alice")).await;
        let first = manager.provider_id().unwrap();
        let first_doc = manager.document().unwrap();

        manager.reconnect(params("alice")).await;
        let second = manager.provider_id().unwrap();

        assert_ne!(first, second);
        assert!(first_doc.is_destroyed());
        assert_eq!(hub.peer_count("room"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn clean_connection_twice_is_harmless() {
        let hub = LoopbackHub::new_shared();
        let manager = manager(&hub);
        manager.connect(params("alice")).await;

        manager.clean_connection().await;
        manager.clean_connection().await;

        assert!(manager.document().is_none());
        assert!(manager.peers().is_empty());
        assert_eq!(hub.room_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn interruption_triggers_delayed_reconnect() {
        let hub = LoopbackHub::new_shared();
        let manager = manager(&hub);
        manager.connect(params("alice")).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        let first = manager.provider_id().unwrap();

        hub.interrupt("room");
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(manager.provider_id().unwrap(), first);

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_ne!(manager.provider_id().unwrap(), first);
        assert_eq!(manager.status(), Some(SyncStatus::Synced));
        assert_eq!(manager.attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn host_reconnect_drops_pending_retry() {
        let hub = LoopbackHub::new_shared();
        let manager = manager(&hub);
        manager.connect(params("alice")).await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        hub.interrupt("room");
        tokio::time::sleep(Duration::from_millis(10)).await;
        manager.reconnect(params("alice")).await;
        let fresh = manager.provider_id().unwrap();

        // The backoff retry would have fired here.
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(manager.provider_id().unwrap(), fresh);
        assert_eq!(manager.status(), Some(SyncStatus::Synced));
        assert_eq!(hub.peer_count("room"), 1);
    }

    #[tokio::test]
    async fn manual_sync_requires_previous_connect() {
        let hub = LoopbackHub::new_shared();
        let manager = manager(&hub);
        assert_eq!(manager.manual_sync().await, Err(Error::NotStarted));

        manager.connect(params("alice")).await;
        let first = manager.provider_id().unwrap();
        manager.manual_sync().await.unwrap();
        assert_ne!(manager.provider_id().unwrap(), first);

        manager.shutdown().await;
        assert_eq!(manager.manual_sync().await, Err(Error::NotStarted));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_cancels_pending_retry() {
        let hub = LoopbackHub::new_shared();
        let manager = manager(&hub);
        manager.connect(params("alice")).await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        hub.interrupt("room");
        tokio::time::sleep(Duration::from_millis(10)).await;
        manager.shutdown().await;
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert!(manager.provider_id().is_none());
        assert_eq!(hub.room_count(), 0);
    }
}
