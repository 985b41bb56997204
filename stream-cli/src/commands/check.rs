//! Validate a configuration file.

use anyhow::Result;
use fedistream_client::StreamConfig;
use std::path::Path;

use crate::config::{self, Overrides};

/// Run the check-config command.
pub fn run(path: &Path) -> Result<()> {
    let config = config::load(path, Overrides::default())?;
    print!("{}", describe(&config));
    Ok(())
}

/// Human-readable summary of the effective configuration.
fn describe(config: &StreamConfig) -> String {
    let transport = &config.transport;
    let operations = &config.operations;
    let mut out = String::new();

    out.push_str("Transport:\n");
    out.push_str(&format!("  URL:        {}\n", transport.url));
    out.push_str(&format!("  Headers:    {}\n", header_names(config)));
    out.push_str(&format!(
        "  Heartbeat:  {}\n",
        match transport.heartbeat_interval() {
            Some(interval) => format!("every {}ms", interval.as_millis()),
            None => "off".to_string(),
        }
    ));
    out.push_str(&format!(
        "  Reconnect:  {}ms..{}ms, {}\n",
        transport.reconnect_base_delay_ms,
        transport.reconnect_max_delay_ms,
        match transport.max_reconnect_attempts {
            Some(max) => format!("at most {max} attempts"),
            None => "unlimited attempts".to_string(),
        }
    ));

    out.push_str("Operations:\n");
    out.push_str(&format!("  Debounce:   {}ms\n", operations.debounce_ms));
    out.push_str(&format!("  Queue size: {}\n", operations.max_queue_size));
    out.push_str(&format!(
        "  Dedup:      {}\n",
        match operations.deduplication_window() {
            Some(window) => format!("{}ms window", window.as_millis()),
            None => "off".to_string(),
        }
    ));

    out.push_str("Optimistic:\n");
    out.push_str(&format!("  Timeout:    {}ms\n", config.optimistic.timeout_ms));
    out.push_str(&format!("  Max pending: {}\n", config.optimistic.max_pending));

    out.push_str("Cache:\n");
    out.push_str(&format!(
        "  Capacity:   {}\n",
        config
            .cache
            .max_entries
            .map_or_else(|| "unbounded".to_string(), |max| max.to_string())
    ));
    out
}

/// Header names only; values may carry credentials.
fn header_names(config: &StreamConfig) -> String {
    if config.transport.headers.is_empty() {
        return "none".to_string();
    }
    config
        .transport
        .headers
        .keys()
        .cloned()
        .collect::<Vec<_>>()
        .join(", ")
}
