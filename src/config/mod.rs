mod file_config;

pub use file_config::{ChannelConfig, FileConfig, ReconcileConfig, SubscriptionConfig};

use crate::notifications::{SubscriberId, SubscriberRole};
use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

pub const DEFAULT_REFRESH_INTERVAL_MS: u64 = 30_000;
pub const DEFAULT_LIMIT: usize = 50;
pub const DEFAULT_REQUEST_TIMEOUT_SEC: u64 = 15;

/// CLI arguments that can be used for config resolution.
/// This struct mirrors the CLI arguments that can be overridden by TOML config.
#[derive(Debug, Clone)]
pub struct CliConfig {
    pub role: Option<String>,
    pub account_id: Option<String>,
    pub api_url: Option<String>,
    pub ws_url: Option<String>,
    pub api_key: Option<String>,
    pub request_timeout_sec: u64,
    pub refresh_interval_ms: u64,
    pub limit: usize,
    pub real_time: bool,
    pub demo: bool,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            role: None,
            account_id: None,
            api_url: None,
            ws_url: None,
            api_key: None,
            request_timeout_sec: DEFAULT_REQUEST_TIMEOUT_SEC,
            refresh_interval_ms: DEFAULT_REFRESH_INTERVAL_MS,
            limit: DEFAULT_LIMIT,
            real_time: true,
            demo: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub subscriber: SubscriberId,
    /// REST endpoint of the notification store. Absent in demo mode.
    pub api_url: Option<String>,
    pub ws_url: Option<String>,
    pub api_key: Option<String>,
    pub request_timeout_sec: u64,
    pub demo: bool,

    pub options: SubscriptionOptions,
    pub sync: SyncSettings,
}

impl AppConfig {
    /// Resolve configuration from CLI arguments and optional TOML file config.
    /// TOML values override CLI values where present.
    pub fn resolve(cli: &CliConfig, file_config: Option<FileConfig>) -> Result<Self> {
        let file = file_config.unwrap_or_default();

        let role_name = file
            .role
            .or_else(|| cli.role.clone())
            .unwrap_or_else(|| SubscriberRole::Patient.as_str().to_string());
        let role = match SubscriberRole::from_str(&role_name) {
            Some(role) => role,
            None => bail!(
                "Invalid role {:?}, expected one of: patient, doctor, clinic",
                role_name
            ),
        };

        let account_id = file
            .account_id
            .or_else(|| cli.account_id.clone())
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| {
                anyhow::anyhow!("account_id must be specified via --account-id or in config file")
            })?;

        let api_url = file.api_url.or_else(|| cli.api_url.clone());
        if api_url.is_none() && !cli.demo {
            bail!("api_url must be specified via --api-url or in config file (or use --demo)");
        }

        let ws_url = file
            .ws_url
            .or_else(|| cli.ws_url.clone())
            .or_else(|| api_url.as_deref().map(derive_ws_url));

        let api_key = file.api_key.or_else(|| cli.api_key.clone());
        let request_timeout_sec = file.request_timeout_sec.unwrap_or(cli.request_timeout_sec);

        // Subscription options - CLI first, then file overrides
        let sub_file = file.subscription.unwrap_or_default();
        let defaults = SubscriptionOptions::default();
        let options = SubscriptionOptions {
            auto_refresh: sub_file.auto_refresh.unwrap_or(defaults.auto_refresh),
            refresh_interval_ms: sub_file
                .refresh_interval_ms
                .unwrap_or(cli.refresh_interval_ms),
            limit: sub_file.limit.unwrap_or(cli.limit),
            real_time: sub_file.real_time.unwrap_or(cli.real_time),
            play_sound: sub_file.play_sound.unwrap_or(defaults.play_sound),
            show_browser_notification: sub_file
                .show_browser_notification
                .unwrap_or(defaults.show_browser_notification),
            vibrate: sub_file.vibrate.unwrap_or(defaults.vibrate),
        };
        if let Err(e) = options.validate() {
            bail!("Invalid subscription options: {}", e);
        }

        let ch_file = file.channel.unwrap_or_default();
        let ch_defaults = ChannelSettings::default();
        let channel = ChannelSettings {
            initial_backoff_ms: ch_file
                .initial_backoff_ms
                .unwrap_or(ch_defaults.initial_backoff_ms),
            max_backoff_ms: ch_file.max_backoff_ms.unwrap_or(ch_defaults.max_backoff_ms),
            backoff_multiplier: ch_file
                .backoff_multiplier
                .unwrap_or(ch_defaults.backoff_multiplier),
            jitter_ratio: ch_file.jitter_ratio.unwrap_or(ch_defaults.jitter_ratio),
            max_attempts: ch_file.max_attempts.or(ch_defaults.max_attempts),
            connect_timeout_ms: ch_file
                .connect_timeout_ms
                .unwrap_or(ch_defaults.connect_timeout_ms),
            event_buffer: ch_file.event_buffer.unwrap_or(ch_defaults.event_buffer),
        };
        if let Err(e) = channel.validate() {
            bail!("Invalid channel settings: {}", e);
        }

        let rc_file = file.reconcile.unwrap_or_default();
        let rc_defaults = ReconcileSettings::default();
        let reconcile = ReconcileSettings {
            pending_ttl_ms: rc_file.pending_ttl_ms.unwrap_or(rc_defaults.pending_ttl_ms),
            tombstone_ttl_ms: rc_file
                .tombstone_ttl_ms
                .unwrap_or(rc_defaults.tombstone_ttl_ms),
            mutation_timeout_ms: rc_file
                .mutation_timeout_ms
                .unwrap_or(rc_defaults.mutation_timeout_ms),
        };

        Ok(Self {
            subscriber: SubscriberId::new(role, account_id),
            api_url,
            ws_url,
            api_key,
            request_timeout_sec,
            demo: cli.demo,
            options,
            sync: SyncSettings { channel, reconcile },
        })
    }
}

/// `http(s)://host/base` -> `ws(s)://host/base/notifications/ws`
fn derive_ws_url(api_url: &str) -> String {
    let trimmed = api_url.trim_end_matches('/');
    let swapped = if let Some(rest) = trimmed.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = trimmed.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        trimmed.to_string()
    };
    format!("{}/notifications/ws", swapped)
}

/// Per-subscription behavior requested by the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionOptions {
    /// Poll every `refresh_interval_ms`; otherwise fetch once.
    pub auto_refresh: bool,
    pub refresh_interval_ms: u64,
    /// Page size of each poll.
    pub limit: usize,
    /// Open a push channel.
    pub real_time: bool,
    pub play_sound: bool,
    pub show_browser_notification: bool,
    pub vibrate: bool,
}

impl Default for SubscriptionOptions {
    fn default() -> Self {
        Self {
            auto_refresh: true,
            refresh_interval_ms: DEFAULT_REFRESH_INTERVAL_MS,
            limit: DEFAULT_LIMIT,
            real_time: true,
            play_sound: true,
            show_browser_notification: true,
            vibrate: false,
        }
    }
}

impl SubscriptionOptions {
    pub fn validate(&self) -> Result<(), String> {
        if self.limit == 0 {
            return Err("limit must be greater than zero".to_string());
        }
        if self.auto_refresh && self.refresh_interval_ms == 0 {
            return Err("refresh_interval_ms must be greater than zero".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChannelSettings {
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
    pub jitter_ratio: f64,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
    pub connect_timeout_ms: u64,
    /// Queue size of each event consumer.
    pub event_buffer: usize,
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 1_000,
            max_backoff_ms: 30_000,
            backoff_multiplier: 2.0,
            jitter_ratio: 0.2,
            max_attempts: None,
            connect_timeout_ms: 10_000,
            event_buffer: 64,
        }
    }
}

impl ChannelSettings {
    pub fn validate(&self) -> Result<(), String> {
        if self.backoff_multiplier < 1.0 {
            return Err("backoff_multiplier must be at least 1.0".to_string());
        }
        if !(0.0..=1.0).contains(&self.jitter_ratio) {
            return Err("jitter_ratio must be between 0 and 1".to_string());
        }
        if self.max_backoff_ms < self.initial_backoff_ms {
            return Err("max_backoff_ms must not be lower than initial_backoff_ms".to_string());
        }
        if self.connect_timeout_ms == 0 {
            return Err("connect_timeout_ms must be greater than zero".to_string());
        }
        if self.max_attempts == Some(0) {
            return Err("max_attempts must be greater than zero when set".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReconcileSettings {
    /// How long an acknowledged local mutation keeps guarding against stale
    /// server state before it is dropped.
    pub pending_ttl_ms: u64,
    /// How long a delete keeps suppressing late inserts/updates.
    pub tombstone_ttl_ms: u64,
    /// Upper bound for a single backend mutation call.
    pub mutation_timeout_ms: u64,
}

impl Default for ReconcileSettings {
    fn default() -> Self {
        Self {
            pending_ttl_ms: 60_000,
            tombstone_ttl_ms: 300_000,
            mutation_timeout_ms: 15_000,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncSettings {
    pub channel: ChannelSettings,
    pub reconcile: ReconcileSettings,
}
