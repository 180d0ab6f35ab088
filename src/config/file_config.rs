use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct FileConfig {
    // Core settings (can override CLI)
    pub role: Option<String>,
    pub account_id: Option<String>,
    pub api_url: Option<String>,
    pub ws_url: Option<String>,
    pub api_key: Option<String>,
    pub request_timeout_sec: Option<u64>,

    // Feature configs
    pub subscription: Option<SubscriptionConfig>,
    pub channel: Option<ChannelConfig>,
    pub reconcile: Option<ReconcileConfig>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct SubscriptionConfig {
    pub auto_refresh: Option<bool>,
    pub refresh_interval_ms: Option<u64>,
    pub limit: Option<usize>,
    pub real_time: Option<bool>,
    pub play_sound: Option<bool>,
    pub show_browser_notification: Option<bool>,
    pub vibrate: Option<bool>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct ChannelConfig {
    pub initial_backoff_ms: Option<u64>,
    pub max_backoff_ms: Option<u64>,
    pub backoff_multiplier: Option<f64>,
    pub jitter_ratio: Option<f64>,
    pub max_attempts: Option<u32>,
    pub connect_timeout_ms: Option<u64>,
    pub event_buffer: Option<usize>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct ReconcileConfig {
    pub pending_ttl_ms: Option<u64>,
    pub tombstone_ttl_ms: Option<u64>,
    pub mutation_timeout_ms: Option<u64>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        toml::from_str(&content).with_context(|| format!("Failed to parse config file: {:?}", path))
    }
}
