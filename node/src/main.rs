//! Tether Node - runs several simulated devices of one user in a single
//! process, connected through an in-process hub.
//!
//! Useful for watching the sync engine work end to end: the first device
//! starts with a table of messages, the others start empty and catch up.

mod config;

use crate::config::Config;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tether_engine::{
    Channel, LoopbackHub, LoopbackTransport, MemoryStore, PeerUser, Record, SyncEngine, SyncHooks,
    SyncParams, SyncStatus, TableId,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Upper bound for the initial catch-up of every device.
const STARTUP_TIMEOUT: Duration = Duration::from_secs(30);

struct Device {
    index: usize,
    store: Arc<MemoryStore>,
    engine: SyncEngine,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tether_node=info,tether_engine=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;

    tracing::info!(
        channel = %config.channel,
        devices = config.devices,
        seed_records = config.seed_records,
        "Starting Tether node"
    );

    let hub = LoopbackHub::new_shared();
    let mut devices = Vec::with_capacity(config.devices);
    for index in 0..config.devices {
        let store = Arc::new(MemoryStore::new());
        if index == 0 {
            store.seed(TableId::Messages, seed_messages(config.seed_records));
        }

        let engine = SyncEngine::new(
            Arc::new(LoopbackTransport::new(Arc::clone(&hub))),
            Arc::clone(&store) as _,
            config.engine.clone(),
        );
        engine.start(session_params(&config, index)).await;
        devices.push(Device {
            index,
            store,
            engine,
        });
    }

    for device in &devices {
        let mut status = device.engine.watch_status();
        let synced = matches!(
            tokio::time::timeout(
                STARTUP_TIMEOUT,
                status.wait_for(|s| *s == Some(SyncStatus::Synced)),
            )
            .await,
            Ok(Ok(_))
        );
        if !synced {
            tracing::warn!(device = device.index, "device did not reach synced in time");
        }
    }

    // Let the last remote changes settle before writing.
    tokio::time::sleep(config.engine.settle_delay).await;

    if let Some(writer) = devices.get(1) {
        write_topic(writer);
        tokio::time::sleep(config.engine.settle_delay + Duration::from_millis(500)).await;
    }
    for device in &devices {
        log_counts(device);
    }

    match config.run_secs {
        Some(secs) => {
            tracing::info!(secs, "running for a fixed time");
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(secs)) => {}
                _ = tokio::signal::ctrl_c() => {}
            }
        }
        None => {
            tracing::info!("running until Ctrl-C");
            tokio::signal::ctrl_c().await?;
        }
    }

    tracing::info!("Shutting down");
    for device in &devices {
        device.engine.shutdown().await;
    }
    Ok(())
}

fn seed_messages(count: usize) -> Vec<Record> {
    (0..count)
        .map(|i| {
            Record::new(
                format!("msg-{i:05}"),
                json!({
                    "content": format!("seeded message {i}"),
                    "role": if i % 2 == 0 { "user" } else { "assistant" },
                    "topicId": "welcome",
                }),
            )
        })
        .collect()
}

fn session_params(config: &Config, index: usize) -> SyncParams {
    let mut channel = Channel::new(config.channel.clone());
    if let Some(password) = &config.password {
        channel = channel.with_password(password.clone());
    }
    let user = PeerUser::new(config.user.clone()).with_name(format!("device-{index}"));

    let hooks = SyncHooks::new()
        .on_status_change(move |status| {
            tracing::info!(device = index, %status, "status changed");
        })
        .on_sync_event(move |table| {
            tracing::debug!(device = index, %table, "remote changes applied");
        })
        .on_awareness_change(move |peers| {
            let names: Vec<&str> = peers
                .iter()
                .map(|p| p.user.name.as_deref().unwrap_or(p.user.id.as_str()))
                .collect();
            tracing::info!(device = index, peers = ?names, "presence changed");
        })
        .on_give_up(move |attempts| {
            tracing::warn!(device = index, attempts, "gave up reconnecting");
        });

    SyncParams::new(channel, user).with_hooks(hooks)
}

fn write_topic(device: &Device) {
    let Some(topics) = device.engine.map(TableId::Topics) else {
        tracing::warn!(device = device.index, "no live session, skipping write");
        return;
    };
    let written = device.engine.transact(|txn| {
        txn.set(
            &topics,
            "topic-from-device-1",
            json!({"title": "Written on device 1", "favorite": false}),
        );
    });
    if written.is_some() {
        tracing::info!(device = device.index, "wrote one topic");
    }
}

fn log_counts(device: &Device) {
    let counts: Vec<String> = TableId::ALL
        .iter()
        .filter(|&&table| !device.store.is_empty(table))
        .map(|&table| format!("{}={}", table, device.store.len(table)))
        .collect();
    tracing::info!(device = device.index, tables = %counts.join(" "), "local store");
}
