//! # Tether Engine
//!
//! Sync orchestration for local-first applications.
//!
//! Every device keeps its data in a local store. This crate mirrors a fixed
//! set of tables into a replicated document, binds the document to a
//! password-protected channel shared by all devices of a user, and replays
//! changes made elsewhere back into the local store. Merging is left to the
//! document; the engine decides when data moves and in which direction.
//!
//! ## Core Concepts
//!
//! ### Sessions
//!
//! A session is one connection attempt. It owns exactly one [`Document`],
//! one [`Provider`] binding it to the channel, and the presence published
//! through that provider. A reconnect tears the whole session down before
//! building the next one, so at most one provider is alive per engine.
//!
//! ### Bootstrap and observation
//!
//! Documents start empty. Once the provider reports it is in sync with its
//! peers, every local table is written into the document in batches
//! ([`SyncConfig::batch_size`], 50 by default). From then on remote changes
//! are replayed into the [`LocalStore`]; changes that originated locally are
//! recognized by their [`Origin`] and never replayed.
//!
//! ### Status
//!
//! The host sees a coarse [`SyncStatus`]: `ready` once connected, `syncing`
//! while changes flow, and `synced` after a quiet period
//! ([`SyncConfig::settle_delay`], 2 s by default).
//!
//! ### Presence
//!
//! Each device announces a [`PeerUser`]. The host receives the complete,
//! ordered peer list ([`PresenceEntry`]) on every presence change.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use serde_json::json;
//! use tether_engine::{
//!     Channel, LoopbackHub, LoopbackTransport, MemoryStore, PeerUser, Record, SyncConfig,
//!     SyncEngine, SyncHooks, SyncParams, TableId,
//! };
//!
//! # async fn run() {
//! let store = Arc::new(MemoryStore::new());
//! store.seed(TableId::Topics, [Record::new("t1", json!({"title": "Hello"}))]);
//!
//! let engine = SyncEngine::new(
//!     Arc::new(LoopbackTransport::new(LoopbackHub::new_shared())),
//!     store,
//!     SyncConfig::default(),
//! );
//!
//! let hooks = SyncHooks::new().on_status_change(|status| println!("sync: {status}"));
//! let channel = Channel::new("notes").with_password("secret");
//! engine
//!     .start(SyncParams::new(channel, PeerUser::new("alice")).with_hooks(hooks))
//!     .await;
//!
//! // Local writes go through the document and reach every peer.
//! if let Some(topics) = engine.map(TableId::Topics) {
//!     engine.transact(|txn| txn.set(&topics, "t2", json!({"title": "World"})));
//! }
//!
//! engine.shutdown().await;
//! # }
//! ```
//!
//! ## Transports
//!
//! The engine talks to peers through the [`Transport`] trait.
//! [`LoopbackTransport`] connects engines living in the same process through a
//! [`LoopbackHub`]; its [`PeerMessage`]s are plain serde JSON and may be reused
//! by real transports.

mod bridge;
mod guard;
mod throttle;

pub mod awareness;
pub mod config;
pub mod connection;
pub mod document;
pub mod engine;
pub mod error;
pub mod handle;
pub mod hooks;
pub mod presence;
pub mod record;
pub mod store;
pub mod table;
pub mod transport;

// Re-export main types at crate root
pub use awareness::{Awareness, AwarenessChange, AwarenessState, AwarenessUpdate};
pub use bridge::{BridgeSettings, TableBridge, TableLoad};
pub use config::{
    ConfigError, ReconnectPolicy, SyncConfig, DEFAULT_BATCH_SIZE, DEFAULT_EVENT_THROTTLE,
    DEFAULT_SETTLE_DELAY,
};
pub use connection::{ConnectionManager, SyncParams};
pub use document::{
    Action, DocUpdate, Document, KeyChange, MapEvent, MapRef, Transaction, EVENT_CAPACITY,
};
pub use engine::SyncEngine;
pub use error::{Error, Result};
pub use handle::DocumentHandle;
pub use hooks::{SyncHooks, SyncStatus};
pub use presence::{peer_list, PeerUser, PresenceEntry, PresenceManager};
pub use record::{Origin, Record};
pub use store::{Collection, LocalStore, MemoryStore};
pub use table::TableId;
pub use transport::{
    Channel, EventSink, LoopbackHub, LoopbackTransport, PeerMessage, PeerSender, Provider,
    ProviderEvent, ProviderOptions, Room, Transport, DEFAULT_SIGNALING,
};

/// Type aliases for clarity
pub type RecordId = String;
pub type ChannelName = String;
pub type ClientId = u64;

/// Fresh random client id.
///
/// Kept within 32 bits so ids stay exact in hosts that store them as
/// double-precision numbers.
pub fn new_client_id() -> ClientId {
    u64::from(uuid::Uuid::new_v4().as_u128() as u32)
}
