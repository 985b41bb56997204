//! Follow a stream and log what reaches the cache.

use anyhow::{Context, Result};
use fedistream_client::{
    Channel, FileStorage, HttpTransport, OperationsManager, StreamConfig, StreamingClient,
    StreamingStateManager, TransportEvent,
};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// How often a summary line is logged.
const SUMMARY_INTERVAL: Duration = Duration::from_secs(30);

/// File under the data directory that holds the resume position.
const STATE_FILE: &str = "stream-state.json";

/// Run the watch command.
pub async fn run(config: StreamConfig, data_dir: &Path) -> Result<()> {
    let transport = HttpTransport::new().context("Failed to create HTTP client")?;
    let storage = Arc::new(FileStorage::new(data_dir.join(STATE_FILE)));

    let client = StreamingClient::builder(config.transport.clone(), transport)
        .storage(storage)
        .build();
    let operations = OperationsManager::new(config.operations.clone());
    let cache = StreamingStateManager::new(&config.cache);

    cache.register(&operations);
    operations.setup_transport_listeners(&client);
    log_transport_events(&client);

    if let Some(id) = client.last_event_id() {
        info!(last_event_id = %id, "resuming stream");
    }
    client.connect().context("Failed to start streaming client")?;
    info!(url = %config.transport.url, "watching stream, press Ctrl-C to stop");

    let mut conflicts = cache.subscribe_conflicts();
    let mut summary = tokio::time::interval(SUMMARY_INTERVAL);
    summary.tick().await;

    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("Failed to listen for Ctrl-C")?;
                break;
            }
            _ = summary.tick() => log_summary(&client, &operations, &cache),
            changed = conflicts.changed() => {
                if changed.is_err() {
                    break;
                }
                if let Some(key) = conflicts.borrow_and_update().back() {
                    warn!(key = %key, "stale edit ignored");
                }
            }
        }
    }

    info!("shutting down");
    client.destroy();
    let drained = operations.flush().await;
    debug!(drained, "flushed pending operations");
    operations.destroy();
    log_summary(&client, &operations, &cache);

    Ok(())
}

fn log_transport_events(client: &StreamingClient<HttpTransport>) {
    client.on(Channel::Open, |event| {
        if let TransportEvent::Open { url, source } = event {
            info!(url = %url, source = ?source, "stream open");
        }
    });
    client.on(Channel::Message, |event| {
        if let TransportEvent::Message(message) = event {
            debug!(event = %message.event, id = ?message.id, "record received");
        }
    });
    client.on(Channel::Error, |event| {
        if let TransportEvent::Error { message, fatal } = event {
            warn!(fatal, "stream error: {}", message);
        }
    });
    client.on(Channel::Closed, |event| {
        if let TransportEvent::Closed { reason } = event {
            info!(reason = %reason, "stream closed");
        }
    });
    client.on(Channel::Reconnecting, |event| {
        if let TransportEvent::Reconnecting { attempt, delay } = event {
            info!(attempt, delay_ms = delay.as_millis() as u64, "reconnecting");
        }
    });
    client.on(Channel::Heartbeat, |event| match event {
        TransportEvent::Heartbeat { latency } => {
            debug!(latency_ms = latency.as_millis() as u64, "heartbeat");
        }
        TransportEvent::HeartbeatFailed { error } => {
            warn!("heartbeat failed: {}", error);
        }
        _ => {}
    });
}

fn log_summary(
    client: &StreamingClient<HttpTransport>,
    operations: &OperationsManager,
    cache: &StreamingStateManager,
) {
    let stats = operations.stats();
    let cached = cache.get_cache_stats();
    info!(
        state = ?client.state(),
        received = stats.received,
        processed = stats.processed,
        deduplicated = stats.deduplicated,
        dropped = stats.dropped,
        invalid = stats.invalid,
        statuses = cached.statuses,
        accounts = cached.accounts,
        notifications = cached.notifications,
        conflicts = cached.conflicts,
        "summary"
    );
}
