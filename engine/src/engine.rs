//! Sync facade - the host's single entry point.

use std::sync::Arc;

use tokio::sync::watch;

use crate::{
    error::Result, guard, ConnectionManager, LocalStore, MapRef, PresenceEntry, SyncConfig,
    SyncParams, SyncStatus, TableId, Transaction, Transport,
};

/// Keeps one local store in sync with every device on a channel.
///
/// ```no_run
/// use std::sync::Arc;
/// use tether_engine::{
///     Channel, LoopbackHub, LoopbackTransport, MemoryStore, PeerUser, SyncConfig, SyncEngine,
///     SyncParams,
/// };
///
/// # async fn demo() {
/// let transport = Arc::new(LoopbackTransport::new(LoopbackHub::new_shared()));
/// let engine = SyncEngine::new(transport, Arc::new(MemoryStore::new()), SyncConfig::default());
///
/// engine
///     .start(SyncParams::new(Channel::new("notes"), PeerUser::new("alice")))
///     .await;
/// // ...
/// engine.shutdown().await;
/// # }
/// ```
pub struct SyncEngine {
    manager: Arc<ConnectionManager>,
}

impl SyncEngine {
    pub fn new(
        transport: Arc<dyn Transport>,
        store: Arc<dyn LocalStore>,
        config: SyncConfig,
    ) -> Self {
        Self {
            manager: ConnectionManager::new(transport, store, config),
        }
    }

    /// Open a session. Sync problems are reported through the hooks, never
    /// returned.
    pub async fn start(&self, params: SyncParams) {
        if self.manager.config().reinit_guard {
            if let Some(previous) = guard::claim(&self.manager) {
                tracing::warn!("tearing down session left behind by a previous engine");
                previous.shutdown().await;
            }
        }
        self.manager.connect(params).await;
    }

    /// Tear the session down and open a new one with `params`.
    pub async fn reconnect(&self, params: SyncParams) {
        self.manager.reconnect(params).await;
    }

    /// Force a reconnect with the last-used parameters.
    pub async fn manual_sync(&self) -> Result<()> {
        self.manager.manual_sync().await
    }

    pub async fn shutdown(&self) {
        self.manager.shutdown().await;
        guard::release(&self.manager);
    }

    /// The replicated map of `table` in the live session.
    pub fn map(&self, table: TableId) -> Option<MapRef> {
        self.manager
            .document()
            .map(|doc| doc.map(table.as_str()))
    }

    /// Run `f` as one local transaction on the live document.
    ///
    /// `None` when there is no live session.
    pub fn transact<R>(&self, f: impl FnOnce(&mut Transaction<'_>) -> R) -> Option<R> {
        self.manager.document().and_then(|doc| doc.transact(f).ok())
    }

    pub fn status(&self) -> Option<SyncStatus> {
        self.manager.status()
    }

    pub fn watch_status(&self) -> watch::Receiver<Option<SyncStatus>> {
        self.manager.watch_status()
    }

    pub fn peers(&self) -> Vec<PresenceEntry> {
        self.manager.peers()
    }

    pub fn provider_id(&self) -> Option<String> {
        self.manager.provider_id()
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }
}
