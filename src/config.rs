use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    str::FromStr,
    sync::LazyLock,
    time::Duration,
};

use anyhow::Context;
use relay_bus::{RelayOptions, SourceEntry, SourceId, StaticDirectory};

pub struct RelayConfig {
    listen: String,
    ffmpeg: String,
    sources_path: PathBuf,
    relay: RelayOptions,
}

impl RelayConfig {
    /// Builds the config from `lookup`, falling back to defaults for unset or
    /// unparsable variables.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = RelayOptions::default();
        let millis = |key: &str, default: Duration| {
            Duration::from_millis(parse_or(&lookup, key, default.as_millis() as u64))
        };
        let relay = RelayOptions {
            drain_grace: millis("NVR_RELAY_DRAIN_GRACE_MS", defaults.drain_grace),
            start_timeout: millis("NVR_RELAY_START_TIMEOUT_MS", defaults.start_timeout),
            stop_timeout: millis("NVR_RELAY_STOP_TIMEOUT_MS", defaults.stop_timeout),
            queue_depth: parse_or(&lookup, "NVR_RELAY_QUEUE_DEPTH", defaults.queue_depth).max(1),
            max_frame_bytes: parse_or(&lookup, "NVR_RELAY_MAX_FRAME_BYTES", defaults.max_frame_bytes),
        };

        Self {
            listen: lookup("NVR_RELAY_LISTEN").unwrap_or_else(|| "0.0.0.0:8080".to_string()),
            ffmpeg: lookup("NVR_RELAY_FFMPEG").unwrap_or_else(|| "ffmpeg".to_string()),
            sources_path: lookup("NVR_RELAY_SOURCES")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("sources.json")),
            relay,
        }
    }

    pub fn listen(&self) -> &str {
        &self.listen
    }

    pub fn ffmpeg(&self) -> &str {
        &self.ffmpeg
    }

    pub fn sources_path(&self) -> &Path {
        &self.sources_path
    }

    pub fn relay_options(&self) -> RelayOptions {
        self.relay
    }
}

fn parse_or<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    match lookup(key) {
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            log::warn!("ignoring invalid {}={:?}", key, raw);
            default
        }),
        None => default,
    }
}

pub fn config() -> &'static RelayConfig {
    static CONFIG: LazyLock<RelayConfig> =
        LazyLock::new(|| RelayConfig::from_lookup(|key| std::env::var(key).ok()));
    &CONFIG
}

/// Reads the source directory file. A missing file is an empty directory.
pub fn load_directory(path: &Path) -> anyhow::Result<StaticDirectory> {
    if !path.exists() {
        log::warn!(
            "source directory {} not found, no sources can be relayed",
            path.display()
        );
        return Ok(StaticDirectory::default());
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    parse_directory(&raw).with_context(|| format!("parsing {}", path.display()))
}

pub fn parse_directory(raw: &str) -> anyhow::Result<StaticDirectory> {
    let entries: HashMap<SourceId, SourceEntry> = serde_json::from_str(raw)?;
    Ok(StaticDirectory::new(entries))
}

#[cfg(test)]
#[path = "config_test.rs"]
mod config_test;
