//! Table bridge - moves records between the local store and the document.
//!
//! Two directions:
//! - bootstrap: every local record is written into the table's replicated
//!   map, `batch_size` records per transaction;
//! - observation: remote changes to a replicated map are replayed into the
//!   local store. Local changes are never replayed (they came from here).
//!
//! While remote changes keep arriving the status stays `syncing`; it flips
//! to `synced` once a table has been quiet for the settle delay.
//!
//! An observer that falls behind the document's event buffer cannot tell
//! which changes it missed, so it reconciles the whole table against the
//! map instead.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;

use crate::hooks::Notifier;
use crate::throttle::Throttle;
use crate::{
    error::Result, Action, Document, Error, KeyChange, LocalStore, MapEvent, MapRef, Record,
    SyncConfig, SyncStatus, TableId,
};

/// Timing and sizing knobs of a bridge.
#[derive(Debug, Clone)]
pub struct BridgeSettings {
    pub batch_size: usize,
    pub settle_delay: Duration,
    pub event_throttle: Duration,
}

impl From<&SyncConfig> for BridgeSettings {
    fn from(config: &SyncConfig) -> Self {
        Self {
            batch_size: config.batch_size.max(1),
            settle_delay: config.settle_delay,
            event_throttle: config.event_throttle,
        }
    }
}

/// Outcome of bootstrapping one table.
#[derive(Debug)]
pub struct TableLoad {
    pub table: TableId,
    /// Number of records written, or why the table failed
    pub result: Result<usize>,
}

/// Bridge between the local store and one session's document.
pub struct TableBridge {
    doc: Arc<Document>,
    store: Arc<dyn LocalStore>,
    settings: BridgeSettings,
    notifier: Notifier,
    cancel: CancellationToken,
    observers: Mutex<Vec<JoinHandle<()>>>,
}

impl TableBridge {
    pub(crate) fn new(
        doc: Arc<Document>,
        store: Arc<dyn LocalStore>,
        settings: BridgeSettings,
        notifier: Notifier,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            doc,
            store,
            settings,
            notifier,
            cancel,
            observers: Mutex::new(Vec::new()),
        }
    }

    /// Bootstrap every table concurrently.
    ///
    /// A failing table does not affect the others; every outcome is returned.
    pub async fn load_all_tables(&self, tables: &[TableId]) -> Vec<TableLoad> {
        let loads = tables.iter().map(|&table| async move {
            TableLoad {
                table,
                result: self.load_table(table).await,
            }
        });
        let results = join_all(loads).await;

        for load in &results {
            if let Err(e) = &load.result {
                tracing::warn!(table = %load.table, "bootstrap load failed: {}", e);
            }
        }
        results
    }

    /// Copy one local table into its replicated map, batch by batch.
    pub async fn load_table(&self, table: TableId) -> Result<usize> {
        let records = self.store.to_array(table).await?;
        let map = self.doc.map(table.as_str());

        let mut batches = 0;
        for batch in records.chunks(self.settings.batch_size) {
            if self.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            self.doc.transact(|txn| {
                for record in batch {
                    txn.set(&map, record.id.clone(), record.payload.clone());
                }
            })?;
            batches += 1;
            tokio::task::yield_now().await;
        }

        tracing::debug!(table = %table, records = records.len(), batches, "table loaded");
        Ok(records.len())
    }

    /// Start replaying remote changes of `table` into the local store.
    pub fn observe_table(&self, table: TableId) -> Result<()> {
        let map = self.doc.map(table.as_str());
        let events = map.observe()?;
        let observer = Observer {
            table,
            map,
            store: Arc::clone(&self.store),
            notifier: self.notifier.clone(),
            cancel: self.cancel.clone(),
            settings: self.settings.clone(),
        };

        let handle = tokio::spawn(observer.run(events));
        self.observers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(handle);
        Ok(())
    }

    /// Stop all observers and cancel in-flight writes. Idempotent.
    pub fn stop(&self) {
        self.cancel.cancel();
        let handles: Vec<_> = self
            .observers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for handle in handles {
            handle.abort();
        }
    }
}

impl Drop for TableBridge {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Observer {
    table: TableId,
    map: MapRef,
    store: Arc<dyn LocalStore>,
    notifier: Notifier,
    cancel: CancellationToken,
    settings: BridgeSettings,
}

impl Observer {
    async fn run(self, mut events: broadcast::Receiver<MapEvent>) {
        let mut throttle = Throttle::new(self.settings.event_throttle);
        let settle = time::sleep(Duration::ZERO);
        tokio::pin!(settle);
        let mut settling = false;

        loop {
            let trailing = throttle.deadline();

            tokio::select! {
                received = events.recv() => {
                    match received {
                        Ok(event) if event.is_local() => continue,
                        Ok(event) => {
                            self.notifier.status(SyncStatus::Syncing);
                            self.apply(&event.changes).await;
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(table = %self.table, skipped, "observer lagged behind document events, reconciling");
                            self.notifier.status(SyncStatus::Syncing);
                            self.reconcile().await;
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }

                    if throttle.hit(Instant::now()) {
                        self.notifier.sync_event(self.table);
                    }
                    settle.as_mut().reset(Instant::now() + self.settings.settle_delay);
                    settling = true;
                }
                () = &mut settle, if settling => {
                    settling = false;
                    self.notifier.status(SyncStatus::Synced);
                }
                () = time::sleep_until(trailing.unwrap_or_else(Instant::now)), if trailing.is_some() => {
                    if throttle.flush(Instant::now()) {
                        self.notifier.sync_event(self.table);
                    }
                }
            }
        }

        tracing::debug!(table = %self.table, "observer stopped");
    }

    /// Apply changes concurrently. Failures are isolated per record.
    async fn apply(&self, changes: &[KeyChange]) {
        let writes = changes.iter().map(|change| self.apply_change(change));
        let results = join_all(writes).await;

        for (change, result) in changes.iter().zip(results) {
            match result {
                Ok(()) => {}
                Err(Error::Cancelled) => {
                    tracing::debug!(table = %self.table, id = %change.id, "write skipped after teardown");
                }
                Err(e) => {
                    tracing::warn!(table = %self.table, id = %change.id, "failed to apply remote change: {}", e);
                }
            }
        }
    }

    /// Bring the local table in line with the replicated map: upsert every
    /// entry of the map and delete local records the map does not hold.
    async fn reconcile(&self) {
        let records = self.map.records();
        let present: HashSet<&str> = records.iter().map(|r| r.id.as_str()).collect();
        let local = match self.store.to_array(self.table).await {
            Ok(local) => local,
            Err(e) => {
                tracing::warn!(table = %self.table, "cannot list local records: {}", e);
                Vec::new()
            }
        };

        let mut changes: Vec<KeyChange> = local
            .into_iter()
            .filter(|r| !present.contains(r.id.as_str()))
            .map(|r| KeyChange {
                id: r.id,
                action: Action::Delete,
                value: None,
            })
            .collect();
        let removed = changes.len();
        changes.extend(records.iter().map(|r| KeyChange {
            id: r.id.clone(),
            action: Action::Update,
            value: Some(r.payload.clone()),
        }));

        self.apply(&changes).await;
        tracing::debug!(table = %self.table, entries = records.len(), removed, "table reconciled");
    }

    async fn apply_change(&self, change: &KeyChange) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        match change.action {
            // An add for a record we already hold is an update.
            Action::Add | Action::Update => match &change.value {
                Some(value) => self.upsert(&change.id, value.clone()).await,
                None => Ok(()),
            },
            Action::Delete => self.store.delete(self.table, &change.id).await,
        }
    }

    async fn upsert(&self, id: &str, value: serde_json::Value) -> Result<()> {
        let existing = self.store.get(self.table, id).await?;
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        match existing {
            Some(record) if record.payload == value => Ok(()),
            Some(_) => self.store.update(self.table, id, value).await,
            None => self.store.add(self.table, Record::new(id, value)).await,
        }
    }
}
