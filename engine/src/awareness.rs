//! Awareness - ephemeral per-peer presence state.
//!
//! Unlike the replicated document, awareness state is never persisted. Each
//! peer owns exactly one state entry, identified by its client id, and
//! replaces it wholesale. A peer leaving is an update with no state.
//!
//! Two broadcast streams hang off an [`Awareness`]:
//! - [`Awareness::subscribe`] yields an [`AwarenessChange`] whenever the set
//!   of states changes, local or remote;
//! - [`Awareness::subscribe_updates`] yields the [`AwarenessUpdate`]s a
//!   transport must forward to peers (local changes only).

use crate::ClientId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 256;

/// Awareness state for a single client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AwarenessState {
    pub client_id: ClientId,
    /// Arbitrary JSON state (user info, cursor, ...)
    pub state: serde_json::Value,
    /// Per-client clock; higher replaces lower
    pub clock: u64,
}

/// Update message for awareness state changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AwarenessUpdate {
    pub client_id: ClientId,
    /// `None` = client left
    pub state: Option<serde_json::Value>,
    pub clock: u64,
}

/// Which clients changed in one awareness transition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AwarenessChange {
    pub added: Vec<ClientId>,
    pub updated: Vec<ClientId>,
    pub removed: Vec<ClientId>,
}

impl AwarenessChange {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }
}

#[derive(Debug, Default)]
struct Inner {
    states: HashMap<ClientId, AwarenessState>,
    clock: u64,
    destroyed: bool,
}

/// Presence sub-channel of a provider.
#[derive(Debug)]
pub struct Awareness {
    client_id: ClientId,
    inner: Mutex<Inner>,
    changes: broadcast::Sender<AwarenessChange>,
    updates: broadcast::Sender<AwarenessUpdate>,
}

impl Awareness {
    /// Create awareness for the local client.
    pub fn new(client_id: ClientId) -> Self {
        let (changes, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (updates, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            client_id,
            inner: Mutex::new(Inner::default()),
            changes,
            updates,
        }
    }

    /// The local client id.
    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Snapshot of every known state, keyed by client id.
    pub fn states(&self) -> HashMap<ClientId, AwarenessState> {
        self.lock().states.clone()
    }

    /// The local client's state.
    pub fn local_state(&self) -> Option<serde_json::Value> {
        self.lock()
            .states
            .get(&self.client_id)
            .map(|s| s.state.clone())
    }

    /// The local state as an update a late joiner can apply.
    pub fn local_update(&self) -> Option<AwarenessUpdate> {
        self.lock()
            .states
            .get(&self.client_id)
            .map(|s| AwarenessUpdate {
                client_id: s.client_id,
                state: Some(s.state.clone()),
                clock: s.clock,
            })
    }

    /// Replace the local state and announce it. Ignored after destroy.
    pub fn set_local_state(&self, state: serde_json::Value) -> Option<AwarenessUpdate> {
        let (update, change) = {
            let mut inner = self.lock();
            if inner.destroyed {
                return None;
            }
            inner.clock += 1;
            let clock = inner.clock;
            let previous = inner.states.insert(
                self.client_id,
                AwarenessState {
                    client_id: self.client_id,
                    state: state.clone(),
                    clock,
                },
            );

            let mut change = AwarenessChange::default();
            if previous.is_some() {
                change.updated.push(self.client_id);
            } else {
                change.added.push(self.client_id);
            }
            (
                AwarenessUpdate {
                    client_id: self.client_id,
                    state: Some(state),
                    clock,
                },
                change,
            )
        };

        let _ = self.updates.send(update.clone());
        let _ = self.changes.send(change);
        Some(update)
    }

    /// Apply a peer's update. Stale updates are ignored.
    pub fn apply_update(&self, update: AwarenessUpdate) -> AwarenessChange {
        let change = {
            let mut inner = self.lock();
            let mut change = AwarenessChange::default();
            if inner.destroyed || update.client_id == self.client_id {
                return change;
            }

            match update.state {
                Some(state) => {
                    let current = inner.states.get(&update.client_id).map(|s| s.clock);
                    match current {
                        Some(clock) if update.clock <= clock => return change,
                        Some(_) => change.updated.push(update.client_id),
                        None => change.added.push(update.client_id),
                    }
                    inner.states.insert(
                        update.client_id,
                        AwarenessState {
                            client_id: update.client_id,
                            state,
                            clock: update.clock,
                        },
                    );
                }
                None => {
                    if inner.states.remove(&update.client_id).is_some() {
                        change.removed.push(update.client_id);
                    }
                }
            }
            change
        };

        if !change.is_empty() {
            let _ = self.changes.send(change.clone());
        }
        change
    }

    /// Drop a peer whose connection went away without a leave update.
    pub fn remove_client(&self, client_id: ClientId) -> bool {
        self.apply_update(AwarenessUpdate {
            client_id,
            state: None,
            clock: u64::MAX,
        })
        .removed
        .contains(&client_id)
    }

    /// Subscribe to state transitions.
    pub fn subscribe(&self) -> broadcast::Receiver<AwarenessChange> {
        self.changes.subscribe()
    }

    /// Subscribe to outgoing local updates.
    pub fn subscribe_updates(&self) -> broadcast::Receiver<AwarenessUpdate> {
        self.updates.subscribe()
    }

    /// Announce departure and clear all state. Idempotent.
    pub fn destroy(&self) {
        let leave = {
            let mut inner = self.lock();
            if inner.destroyed {
                return;
            }
            inner.destroyed = true;
            inner.states.clear();
            inner.clock += 1;
            AwarenessUpdate {
                client_id: self.client_id,
                state: None,
                clock: inner.clock,
            }
        };
        let _ = self.updates.send(leave);
    }

    pub fn is_destroyed(&self) -> bool {
        self.lock().destroyed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn set_local_state() {
        let awareness = Awareness::new(1);
        let mut changes = awareness.subscribe();
        let mut updates = awareness.subscribe_updates();

        let update = awareness.set_local_state(json!({"name": "Alice"})).unwrap();
        assert_eq!(update.clock, 1);
        assert_eq!(awareness.local_state(), Some(json!({"name": "Alice"})));
        assert_eq!(changes.try_recv().unwrap().added, vec![1]);
        assert_eq!(updates.try_recv().unwrap(), update);

        awareness.set_local_state(json!({"name": "Alicia"}));
        assert_eq!(changes.try_recv().unwrap().updated, vec![1]);
    }

    #[test]
    fn apply_remote_updates() {
        let awareness = Awareness::new(1);
        let mut updates = awareness.subscribe_updates();

        let change = awareness.apply_update(AwarenessUpdate {
            client_id: 2,
            state: Some(json!({"name": "Bob"})),
            clock: 3,
        });
        assert_eq!(change.added, vec![2]);

        // Older clock is ignored
        let change = awareness.apply_update(AwarenessUpdate {
            client_id: 2,
            state: Some(json!({"name": "Old Bob"})),
            clock: 2,
        });
        assert!(change.is_empty());
        assert_eq!(awareness.states()[&2].state, json!({"name": "Bob"}));

        // Remote changes are never re-announced
        assert!(updates.try_recv().is_err());
    }

    #[test]
    fn peer_leaving() {
        let awareness = Awareness::new(1);
        awareness.apply_update(AwarenessUpdate {
            client_id: 2,
            state: Some(json!({})),
            clock: 1,
        });
        assert!(awareness.remove_client(2));
        assert!(!awareness.remove_client(2));
        assert!(awareness.states().is_empty());
    }

    #[test]
    fn destroy_announces_leave() {
        let awareness = Awareness::new(1);
        awareness.set_local_state(json!({}));
        let mut updates = awareness.subscribe_updates();

        awareness.destroy();
        awareness.destroy();

        let leave = updates.try_recv().unwrap();
        assert_eq!(leave.state, None);
        assert!(updates.try_recv().is_err());
        assert!(awareness.set_local_state(json!({})).is_none());
        assert!(awareness.states().is_empty());
    }
}
