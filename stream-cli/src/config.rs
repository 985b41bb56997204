//! Configuration loading for the fedistream CLI.

use anyhow::{Context, Result};
use fedistream_client::StreamConfig;
use std::path::{Path, PathBuf};

/// Values given on the command line that take precedence over the file.
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    /// Replaces `transport.url`.
    pub url: Option<String>,
    /// Sent as `Authorization: Bearer <token>`.
    pub token: Option<String>,
}

/// Load `path`, apply `overrides` and validate the result.
pub fn load(path: &Path, overrides: Overrides) -> Result<StreamConfig> {
    let mut config = StreamConfig::read(path)
        .with_context(|| format!("Failed to load {}", path.display()))?;

    if let Some(url) = overrides.url {
        config.transport.url = url;
    }
    if let Some(token) = overrides.token {
        config
            .transport
            .headers
            .insert("Authorization".to_string(), format!("Bearer {token}"));
    }

    config
        .validate()
        .with_context(|| format!("Invalid configuration in {}", path.display()))?;
    Ok(config)
}

/// Get the default data directory for the last-event-id store.
pub fn default_data_dir() -> Result<PathBuf> {
    let dirs = directories::ProjectDirs::from("io", "fedistream", "fedistream")
        .context("Could not determine home directory")?;
    Ok(dirs.data_dir().to_path_buf())
}
