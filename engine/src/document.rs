//! Replicated document - named key/value maps shared between peers.
//!
//! A [`Document`] wraps a [`yrs::Doc`] holding one root map per table.
//! Values are stored as JSON strings; merging is entirely up to yrs.
//!
//! Mutations happen inside [`Document::transact`]. A transaction produces
//! one [`MapEvent`] per touched map, tagged [`Origin::Local`], plus one
//! [`DocUpdate`] for the transport. [`Document::apply_update`] merges a peer's
//! update and produces [`Origin::Remote`] events. The two are told apart by
//! the origin the yrs transaction was opened with.

use crate::{error::Result, ClientId, Error, Origin, Record, RecordId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::broadcast;
use yrs::types::EntryChange;
use yrs::updates::decoder::Decode;
use yrs::{
    Doc, Map, Observable, Out, ReadTxn, StateVector, Subscription, Transact, TransactionMut,
    Update, WriteTxn,
};

/// Buffer size of map event and update channels.
pub const EVENT_CAPACITY: usize = 1024;

/// yrs origin of transactions opened by [`Document::transact`].
const LOCAL_ORIGIN: &str = "tether:local";
/// yrs origin of transactions opened by [`Document::apply_update`].
const REMOTE_ORIGIN: &str = "tether:remote";

/// Kind of change applied to a single key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Add,
    Update,
    Delete,
}

/// Change of a single key within a [`MapEvent`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyChange {
    pub id: RecordId,
    pub action: Action,
    /// Value after the change (`None` for deletes)
    pub value: Option<Value>,
}

/// All changes one transaction made to one map.
#[derive(Debug, Clone, PartialEq)]
pub struct MapEvent {
    pub map: String,
    pub changes: Vec<KeyChange>,
    pub origin: Origin,
}

impl MapEvent {
    /// Whether the event came from a transaction on this document.
    pub fn is_local(&self) -> bool {
        self.origin == Origin::Local
    }
}

/// A yrs v1 update, exchanged between peers.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocUpdate(Vec<u8>);

impl DocUpdate {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<u8>> for DocUpdate {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

fn decode_value(out: &Out) -> Option<Value> {
    let json = out.clone().cast::<String>().ok()?;
    serde_json::from_str(&json).ok()
}

fn key_change(key: &str, change: &EntryChange) -> Option<KeyChange> {
    let (action, value) = match change {
        EntryChange::Inserted(value) => (Action::Add, Some(decode_value(value)?)),
        EntryChange::Updated(_, value) => (Action::Update, Some(decode_value(value)?)),
        EntryChange::Removed(_) => (Action::Delete, None),
    };
    Some(KeyChange {
        id: key.to_string(),
        action,
        value,
    })
}

struct DocState {
    /// Event channel per observed map. yrs callbacks only hold weak
    /// references, so clearing this closes every receiver.
    maps: HashMap<String, Arc<broadcast::Sender<MapEvent>>>,
    subscriptions: Vec<Subscription>,
    updates: Option<broadcast::Sender<DocUpdate>>,
    destroyed: bool,
}

/// Batch of mutations applied atomically by [`Document::transact`].
///
/// Reads through the transaction see its own writes. Do not call methods of
/// the owning [`Document`] or its [`MapRef`]s from inside the closure: the
/// document is locked for the duration of the transaction.
pub struct Transaction<'a> {
    txn: TransactionMut<'a>,
    dirty: bool,
}

impl Transaction<'_> {
    /// Set `id` to `value` in `map`.
    pub fn set(&mut self, map: &MapRef, id: impl Into<RecordId>, value: Value) {
        let target = self.txn.get_or_insert_map(map.name());
        target.insert(&mut self.txn, id.into(), value.to_string());
        self.dirty = true;
    }

    /// Remove `id` from `map`.
    pub fn remove(&mut self, map: &MapRef, id: &str) {
        if let Some(target) = self.txn.get_map(map.name()) {
            if target.remove(&mut self.txn, id).is_some() {
                self.dirty = true;
            }
        }
    }

    /// Read `id` from `map`.
    pub fn get(&self, map: &MapRef, id: &str) -> Option<Value> {
        let target = self.txn.get_map(map.name())?;
        decode_value(&target.get(&self.txn, id)?)
    }
}

/// The shared document of one sync session.
pub struct Document {
    doc: Doc,
    state: Mutex<DocState>,
}

impl fmt::Debug for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Document")
            .field("client_id", &self.client_id())
            .field("destroyed", &self.is_destroyed())
            .finish_non_exhaustive()
    }
}

impl Document {
    /// Create a document for a client.
    pub fn new(client_id: ClientId) -> Self {
        let (updates, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            doc: Doc::with_client_id(client_id),
            state: Mutex::new(DocState {
                maps: HashMap::new(),
                subscriptions: Vec::new(),
                updates: Some(updates),
                destroyed: false,
            }),
        }
    }

    /// Identifier of this document instance.
    pub fn client_id(&self) -> ClientId {
        self.doc.client_id()
    }

    /// Every yrs transaction runs under this lock, so transactions never
    /// overlap.
    fn lock(&self) -> MutexGuard<'_, DocState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Get the named map, creating it on first access.
    pub fn map(self: &Arc<Self>, name: &str) -> MapRef {
        let mut state = self.lock();
        if !state.destroyed && !state.maps.contains_key(name) {
            self.register(&mut state, name);
        }
        MapRef {
            doc: Arc::clone(self),
            name: name.to_string(),
        }
    }

    /// Create the root map and forward its yrs events to a broadcast channel.
    fn register(&self, state: &mut DocState, name: &str) {
        let map = self.doc.transact_mut().get_or_insert_map(name);
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        let events = Arc::new(tx);

        let sender = Arc::downgrade(&events);
        let map_name = name.to_string();
        let local = yrs::Origin::from(LOCAL_ORIGIN);
        let subscription = map.observe(move |txn, event| {
            let Some(events) = Weak::upgrade(&sender) else {
                return;
            };
            let mut changes: Vec<KeyChange> = event
                .keys(txn)
                .iter()
                .filter_map(|(key, change)| key_change(key, change))
                .collect();
            if changes.is_empty() {
                return;
            }
            changes.sort_by(|a, b| a.id.cmp(&b.id));

            let origin = if txn.origin() == Some(&local) {
                Origin::Local
            } else {
                Origin::Remote
            };
            // No receivers is fine: nobody observes this map yet.
            let _ = events.send(MapEvent {
                map: map_name.clone(),
                changes,
                origin,
            });
        });

        state.maps.insert(name.to_string(), events);
        state.subscriptions.push(subscription);
    }

    /// Run `f` as one atomic, locally originated transaction.
    ///
    /// Observers of each touched map receive exactly one event.
    pub fn transact<R>(&self, f: impl FnOnce(&mut Transaction<'_>) -> R) -> Result<R> {
        let state = self.lock();
        if state.destroyed {
            return Err(Error::DocumentDestroyed);
        }

        let mut txn = Transaction {
            txn: self.doc.transact_mut_with(LOCAL_ORIGIN),
            dirty: false,
        };
        let out = f(&mut txn);
        let update = txn.dirty.then(|| DocUpdate(txn.txn.encode_update_v1()));
        // Committing fires the map observers.
        drop(txn);

        if let (Some(update), Some(updates)) = (update, &state.updates) {
            let _ = updates.send(update);
        }
        Ok(out)
    }

    /// Merge a peer's update.
    pub fn apply_update(&self, update: DocUpdate) -> Result<()> {
        let state = self.lock();
        if state.destroyed {
            return Err(Error::DocumentDestroyed);
        }

        let update =
            Update::decode_v1(update.as_bytes()).map_err(|e| Error::InvalidUpdate(e.to_string()))?;
        let mut txn = self.doc.transact_mut_with(REMOTE_ORIGIN);
        txn.apply_update(update)
            .map_err(|e| Error::InvalidUpdate(e.to_string()))
    }

    /// Full state as an update, deletions included.
    pub fn encode_state(&self) -> DocUpdate {
        let _state = self.lock();
        let txn = self.doc.transact();
        DocUpdate(txn.encode_state_as_update_v1(&StateVector::default()))
    }

    /// Subscribe to updates produced by local transactions.
    pub fn subscribe_updates(&self) -> Result<broadcast::Receiver<DocUpdate>> {
        self.lock()
            .updates
            .as_ref()
            .map(|tx| tx.subscribe())
            .ok_or(Error::DocumentDestroyed)
    }

    /// Release all maps and close every subscription. Idempotent.
    pub fn destroy(&self) {
        let mut state = self.lock();
        state.destroyed = true;
        state.subscriptions.clear();
        state.maps.clear();
        state.updates = None;
    }

    pub fn is_destroyed(&self) -> bool {
        self.lock().destroyed
    }

    /// Run `f` over the named root map, if the document is live and the map
    /// exists.
    fn read<R>(&self, name: &str, f: impl FnOnce(&yrs::Transaction<'_>, yrs::MapRef) -> R) -> Option<R> {
        let state = self.lock();
        if state.destroyed {
            return None;
        }
        let txn = self.doc.transact();
        let map = txn.get_map(name)?;
        Some(f(&txn, map))
    }
}

/// Handle to one named map of a [`Document`].
#[derive(Clone)]
pub struct MapRef {
    doc: Arc<Document>,
    name: String,
}

impl fmt::Debug for MapRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MapRef")
            .field("name", &self.name)
            .field("client_id", &self.doc.client_id())
            .finish()
    }
}

impl PartialEq for MapRef {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.doc, &other.doc) && self.name == other.name
    }
}

impl MapRef {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get(&self, id: &str) -> Option<Value> {
        self.doc
            .read(&self.name, |txn, map| map.get(txn, id))
            .flatten()
            .and_then(|out| decode_value(&out))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.doc
            .read(&self.name, |txn, map| map.contains_key(txn, id))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.doc
            .read(&self.name, |txn, map| map.len(txn) as usize)
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entries as records, ordered by ID. Values that are not valid JSON are
    /// skipped.
    pub fn records(&self) -> Vec<Record> {
        let mut records = self
            .doc
            .read(&self.name, |txn, map| {
                map.iter(txn)
                    .filter_map(|(id, out)| decode_value(&out).map(|v| Record::new(id, v)))
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }

    /// Keys, sorted.
    pub fn keys(&self) -> Vec<RecordId> {
        let mut keys = self
            .doc
            .read(&self.name, |txn, map| {
                map.keys(txn).map(str::to_string).collect::<Vec<_>>()
            })
            .unwrap_or_default();
        keys.sort();
        keys
    }

    /// Set a single key in its own transaction.
    pub fn set(&self, id: impl Into<RecordId>, value: Value) -> Result<()> {
        let id = id.into();
        self.doc.transact(|txn| txn.set(self, id, value))
    }

    /// Remove a single key in its own transaction.
    pub fn remove(&self, id: &str) -> Result<()> {
        self.doc.transact(|txn| txn.remove(self, id))
    }

    /// Subscribe to change events of this map.
    pub fn observe(&self) -> Result<broadcast::Receiver<MapEvent>> {
        let mut state = self.doc.lock();
        if state.destroyed {
            return Err(Error::DocumentDestroyed);
        }
        if !state.maps.contains_key(&self.name) {
            self.doc.register(&mut state, &self.name);
        }
        state
            .maps
            .get(&self.name)
            .map(|events| events.subscribe())
            .ok_or(Error::DocumentDestroyed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(id: ClientId) -> Arc<Document> {
        Arc::new(Document::new(id))
    }

    #[test]
    fn transaction_emits_single_event() {
        let doc = doc(1);
        let map = doc.map("messages");
        let mut events = map.observe().unwrap();

        doc.transact(|txn| {
            for i in 0..10 {
                txn.set(&map, format!("m{i}"), json!({"n": i}));
            }
        })
        .unwrap();

        let event = events.try_recv().unwrap();
        assert_eq!(event.changes.len(), 10);
        assert!(event.is_local());
        assert!(events.try_recv().is_err());
        assert_eq!(map.len(), 10);
        assert_eq!(map.get("m3"), Some(json!({"n": 3})));
    }

    #[test]
    fn actions_reflect_prior_state() {
        let doc = doc(1);
        let map = doc.map("topics");
        map.set("t1", json!(1)).unwrap();

        let mut events = map.observe().unwrap();
        doc.transact(|txn| {
            txn.set(&map, "t1", json!(2));
            txn.set(&map, "t2", json!(3));
        })
        .unwrap();
        let event = events.try_recv().unwrap();
        assert_eq!(event.changes[0].action, Action::Update);
        assert_eq!(event.changes[0].value, Some(json!(2)));
        assert_eq!(event.changes[1].action, Action::Add);

        map.remove("t1").unwrap();
        let event = events.try_recv().unwrap();
        assert_eq!(event.changes[0].action, Action::Delete);
        assert_eq!(event.changes[0].value, None);
    }

    #[test]
    fn reads_inside_transaction_see_own_writes() {
        let doc = doc(1);
        let map = doc.map("topics");
        let seen = doc
            .transact(|txn| {
                txn.set(&map, "t1", json!("draft"));
                txn.get(&map, "t1")
            })
            .unwrap();
        assert_eq!(seen, Some(json!("draft")));
    }

    #[test]
    fn empty_transaction_publishes_no_update() {
        let doc = doc(1);
        let map = doc.map("topics");
        let mut updates = doc.subscribe_updates().unwrap();

        doc.transact(|txn| txn.remove(&map, "missing")).unwrap();
        assert!(updates.try_recv().is_err());

        map.set("t1", json!(1)).unwrap();
        assert!(!updates.try_recv().unwrap().is_empty());
    }

    #[test]
    fn remote_update_is_tagged_remote() {
        let a = doc(1);
        let b = doc(2);
        let mut updates = a.subscribe_updates().unwrap();
        a.map("messages").set("m1", json!("hello")).unwrap();

        let map_b = b.map("messages");
        let mut events = map_b.observe().unwrap();
        b.apply_update(updates.try_recv().unwrap()).unwrap();

        let event = events.try_recv().unwrap();
        assert_eq!(event.origin, Origin::Remote);
        assert_eq!(event.changes[0].action, Action::Add);
        assert_eq!(map_b.get("m1"), Some(json!("hello")));
    }

    #[test]
    fn remote_updates_do_not_feed_update_stream() {
        let a = doc(1);
        let b = doc(2);
        a.map("messages").set("m1", json!(1)).unwrap();

        let mut updates = b.subscribe_updates().unwrap();
        b.apply_update(a.encode_state()).unwrap();
        assert!(updates.try_recv().is_err());
    }

    #[test]
    fn garbage_update_is_rejected() {
        let a = doc(1);
        let err = a.apply_update(DocUpdate::from(vec![0xff, 0xff, 0xff])).unwrap_err();
        assert!(matches!(err, Error::InvalidUpdate(_)));
    }

    #[test]
    fn deletes_replicate() {
        let a = doc(1);
        let b = doc(2);
        let map_a = a.map("topics");
        map_a.set("t", json!(1)).unwrap();
        b.apply_update(a.encode_state()).unwrap();
        assert!(b.map("topics").contains("t"));

        map_a.remove("t").unwrap();
        b.apply_update(a.encode_state()).unwrap();
        assert!(!b.map("topics").contains("t"));
        assert_eq!(b.map("topics").keys(), Vec::<RecordId>::new());
    }

    #[test]
    fn map_identity_is_stable() {
        let doc = doc(1);
        assert_eq!(doc.map("messages"), doc.map("messages"));
        assert_ne!(doc.map("messages"), doc.map("topics"));
    }

    #[test]
    fn destroy_invalidates_maps() {
        let doc = doc(1);
        let map = doc.map("messages");
        map.set("m1", json!(1)).unwrap();
        let mut events = map.observe().unwrap();

        doc.destroy();
        doc.destroy();

        assert!(doc.is_destroyed());
        assert!(map.is_empty());
        assert_eq!(map.set("m2", json!(2)), Err(Error::DocumentDestroyed));
        assert_eq!(
            events.try_recv(),
            Err(broadcast::error::TryRecvError::Closed)
        );
        assert!(doc.subscribe_updates().is_err());
        assert!(map.observe().is_err());
    }
}
