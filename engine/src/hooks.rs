//! Sync status and host callbacks.

use crate::{PresenceEntry, TableId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;

/// Liveness of the current session as seen by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    /// Connected to the channel
    Ready,
    /// Exchanging or applying changes
    Syncing,
    /// Settled
    Synced,
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SyncStatus::Ready => "ready",
            SyncStatus::Syncing => "syncing",
            SyncStatus::Synced => "synced",
        })
    }
}

type TableHook = Arc<dyn Fn(TableId) + Send + Sync>;
type StatusHook = Arc<dyn Fn(SyncStatus) + Send + Sync>;
type AwarenessHook = Arc<dyn Fn(&[PresenceEntry]) + Send + Sync>;
type GiveUpHook = Arc<dyn Fn(u32) + Send + Sync>;

/// Callbacks through which the engine reports to the host.
///
/// Every hook is optional. Hooks run on engine tasks and must not block.
#[derive(Clone, Default)]
pub struct SyncHooks {
    sync_event: Option<TableHook>,
    status_change: Option<StatusHook>,
    awareness_change: Option<AwarenessHook>,
    give_up: Option<GiveUpHook>,
}

impl SyncHooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remote changes were applied to a table (throttled per table).
    pub fn on_sync_event(mut self, f: impl Fn(TableId) + Send + Sync + 'static) -> Self {
        self.sync_event = Some(Arc::new(f));
        self
    }

    /// The sync status changed.
    pub fn on_status_change(mut self, f: impl Fn(SyncStatus) + Send + Sync + 'static) -> Self {
        self.status_change = Some(Arc::new(f));
        self
    }

    /// The peer list changed; receives the complete list every time.
    pub fn on_awareness_change(
        mut self,
        f: impl Fn(&[PresenceEntry]) + Send + Sync + 'static,
    ) -> Self {
        self.awareness_change = Some(Arc::new(f));
        self
    }

    /// Automatic reconnection stopped after the given number of attempts.
    pub fn on_give_up(mut self, f: impl Fn(u32) + Send + Sync + 'static) -> Self {
        self.give_up = Some(Arc::new(f));
        self
    }
}

impl fmt::Debug for SyncHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncHooks")
            .field("sync_event", &self.sync_event.is_some())
            .field("status_change", &self.status_change.is_some())
            .field("awareness_change", &self.awareness_change.is_some())
            .field("give_up", &self.give_up.is_some())
            .finish()
    }
}

/// Fans engine signals out to the session's hooks and the status watch.
#[derive(Clone)]
pub(crate) struct Notifier {
    hooks: SyncHooks,
    status: Arc<watch::Sender<Option<SyncStatus>>>,
}

impl Notifier {
    pub(crate) fn new(hooks: SyncHooks, status: Arc<watch::Sender<Option<SyncStatus>>>) -> Self {
        Self { hooks, status }
    }

    pub(crate) fn status(&self, status: SyncStatus) {
        tracing::trace!(%status, "sync status");
        self.status.send_replace(Some(status));
        if let Some(hook) = &self.hooks.status_change {
            hook(status);
        }
    }

    pub(crate) fn sync_event(&self, table: TableId) {
        if let Some(hook) = &self.hooks.sync_event {
            hook(table);
        }
    }

    pub(crate) fn awareness(&self, peers: &[PresenceEntry]) {
        if let Some(hook) = &self.hooks.awareness_change {
            hook(peers);
        }
    }

    pub(crate) fn give_up(&self, attempts: u32) {
        if let Some(hook) = &self.hooks.give_up {
            hook(attempts);
        }
    }
}
