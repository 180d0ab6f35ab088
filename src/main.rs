use anyhow::{Context, Result};
use clap::Parser;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use std::{fmt::Debug, path::PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{info, level_filters::LevelFilter, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use igabay_notification_sync::backend::{
    HttpBackend, InMemoryBackend, NotificationBackend, WebSocketTransport,
};
use igabay_notification_sync::channel::PushTransport;
use igabay_notification_sync::config::{self, AppConfig, CliConfig, FileConfig};
use igabay_notification_sync::metrics;
use igabay_notification_sync::notifications::{
    now_millis, NotificationKind, NotificationRecord, SubscriberId,
};
use igabay_notification_sync::subscription::{LogNotifier, LoggingListener, NotificationHub};

fn parse_path(s: &str) -> Result<PathBuf> {
    let path_buf = PathBuf::from(s);
    if path_buf.is_absolute() {
        return Ok(path_buf);
    }
    let cwd = std::env::current_dir()?;
    Ok(cwd.join(path_buf))
}

/// Follow the notifications of one account and log every change.
#[derive(Parser, Debug)]
struct CliArgs {
    /// Path to a TOML config file. Values in the file override CLI arguments.
    #[clap(long, value_parser = parse_path)]
    pub config: Option<PathBuf>,

    /// Role of the followed account (patient, doctor or clinic).
    #[clap(long)]
    pub role: Option<String>,

    /// Id of the followed account.
    #[clap(long)]
    pub account_id: Option<String>,

    /// Base URL of the notification REST API.
    #[clap(long)]
    pub api_url: Option<String>,

    /// WebSocket URL of the push endpoint. Derived from --api-url if omitted.
    #[clap(long)]
    pub ws_url: Option<String>,

    /// Bearer token sent with every request.
    #[clap(long, env = "NOTIFICATION_API_KEY")]
    pub api_key: Option<String>,

    /// Timeout in seconds for REST requests.
    #[clap(long, default_value_t = config::DEFAULT_REQUEST_TIMEOUT_SEC)]
    pub request_timeout_sec: u64,

    /// Interval in milliseconds between full refreshes.
    #[clap(long, default_value_t = config::DEFAULT_REFRESH_INTERVAL_MS)]
    pub refresh_interval_ms: u64,

    /// Number of notifications fetched per refresh.
    #[clap(long, default_value_t = config::DEFAULT_LIMIT)]
    pub limit: usize,

    /// Only poll, never open a push channel.
    #[clap(long)]
    pub no_real_time: bool,

    /// Run against an in-process backend producing sample notifications.
    #[clap(long)]
    pub demo: bool,

    /// Interval in seconds between generated notifications in demo mode.
    #[clap(long, default_value_t = 5)]
    pub demo_interval_sec: u64,
}

impl CliArgs {
    fn to_cli_config(&self) -> CliConfig {
        CliConfig {
            role: self.role.clone(),
            account_id: self.account_id.clone(),
            api_url: self.api_url.clone(),
            ws_url: self.ws_url.clone(),
            api_key: self.api_key.clone(),
            request_timeout_sec: self.request_timeout_sec,
            refresh_interval_ms: self.refresh_interval_ms,
            limit: self.limit,
            real_time: !self.no_real_time,
            demo: self.demo,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli_args = CliArgs::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .with_env_var("LOG_LEVEL")
                .from_env_lossy(),
        )
        .try_init()
        .context("Failed to initialize logging")?;

    let file_config = match &cli_args.config {
        Some(path) => {
            info!("Loading config from {:?}", path);
            Some(FileConfig::load(path)?)
        }
        None => None,
    };
    let app_config = AppConfig::resolve(&cli_args.to_cli_config(), file_config)?;

    info!(
        "notification-sync {} following {}",
        env!("CARGO_PKG_VERSION"),
        app_config.subscriber
    );
    metrics::init_metrics();

    let shutdown = CancellationToken::new();
    let (backend, transport): (Arc<dyn NotificationBackend>, Arc<dyn PushTransport>) =
        if app_config.demo {
            info!("Demo mode: using the in-process backend");
            let memory = Arc::new(InMemoryBackend::new());
            spawn_demo_generator(
                memory.clone(),
                app_config.subscriber.clone(),
                Duration::from_secs(cli_args.demo_interval_sec.max(1)),
                shutdown.clone(),
            );
            (memory.clone(), memory)
        } else {
            remote_backend(&app_config)?
        };

    let hub = NotificationHub::new(
        backend,
        transport,
        Arc::new(LogNotifier),
        app_config.sync.clone(),
    );
    let handle = hub
        .subscribe(app_config.subscriber.clone(), app_config.options.clone())
        .await
        .context("Failed to subscribe")?;
    handle.add_listener(Arc::new(LoggingListener)).await;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Shutting down...");
    shutdown.cancel();

    let view = handle.view();
    info!(
        "Final state: {} notifications, {} unread",
        view.records.len(),
        view.unread_count
    );
    handle.unsubscribe().await;

    info!("Metrics:\n{}", metrics::render());
    Ok(())
}

fn remote_backend(
    app_config: &AppConfig,
) -> Result<(Arc<dyn NotificationBackend>, Arc<dyn PushTransport>)> {
    let api_url = app_config
        .api_url
        .as_deref()
        .context("api_url is required outside demo mode")?;
    let ws_url = app_config
        .ws_url
        .clone()
        .context("ws_url could not be derived")?;

    info!("Using notification API at {} (push: {})", api_url, ws_url);
    let http = HttpBackend::new(
        api_url,
        app_config.api_key.clone(),
        app_config.request_timeout_sec,
    )
    .context("Failed to create HTTP client")?;
    let ws = WebSocketTransport::new(ws_url, app_config.api_key.clone());
    Ok((Arc::new(http), Arc::new(ws)))
}

/// Produce appointment traffic for the followed account until cancelled.
fn spawn_demo_generator(
    backend: Arc<InMemoryBackend>,
    subscriber: SubscriberId,
    interval: Duration,
    shutdown: CancellationToken,
) {
    const KINDS: [NotificationKind; 5] = [
        NotificationKind::AppointmentBooked,
        NotificationKind::AppointmentConfirmed,
        NotificationKind::AppointmentReminder,
        NotificationKind::AppointmentRescheduled,
        NotificationKind::AppointmentCancelled,
    ];

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        let mut sequence: u64 = 0;
        let mut issued: Vec<NotificationRecord> = Vec::new();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            sequence += 1;

            // Decide everything before the next await; the rng is not Send
            let (roll, kind, victim) = {
                let mut rng = rand::rng();
                let roll = rng.random_range(0..10u32);
                let kind = KINDS[rng.random_range(0..KINDS.len())];
                let victim = if issued.is_empty() {
                    None
                } else {
                    Some(rng.random_range(0..issued.len()))
                };
                (roll, kind, victim)
            };

            match (roll, victim) {
                (0, Some(index)) => {
                    let record = issued.swap_remove(index);
                    info!("Demo: server deletes {}", record.id);
                    backend.remove(&record.id).await;
                }
                (1, Some(index)) => {
                    let mut record = issued[index].clone();
                    record.payload["note"] = serde_json::json!("Updated by the clinic");
                    info!("Demo: server updates {}", record.id);
                    backend.update(record).await;
                }
                (2, _) => {
                    warn!("Demo: dropping push connections");
                    backend.drop_connections().await;
                }
                _ => {
                    let record = NotificationRecord {
                        id: format!("demo-{}", sequence),
                        subscriber_id: subscriber.account_id.clone(),
                        kind,
                        is_read: false,
                        created_at: now_millis(),
                        updated_at: None,
                        payload: serde_json::json!({
                            "title": format!("Appointment #{}", sequence),
                            "appointment_id": format!("apt-{}", sequence),
                        }),
                    };
                    issued.push(record.clone());
                    backend.insert(record).await;
                }
            }
        }
    });
}
