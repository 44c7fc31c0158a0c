mod client;
mod core;
mod http;
mod mpv;
mod preview;
mod scheduler;
mod sync;

use std::sync::Arc;

use scrobble_proto::config::Config;
use scrobble_proto::store::PersistentStore;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::scheduler::StreamKind;

/// Notifications for subscribers (the renderer, over `/api/signals`).
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Signal {
    CollectionUpdated,
    ChartsUpdated,
    /// One chunk of a fan-out hit the upstream rate limit.
    RateLimited {
        source: String,
        chunk: usize,
        entities: usize,
    },
    StreamFailed {
        stream: StreamKind,
        message: String,
    },
    Preview {
        entity_id: String,
        playing: bool,
    },
    Log {
        line: String,
    },
}

impl Signal {
    pub fn name(&self) -> &'static str {
        match self {
            Self::CollectionUpdated => "collection_updated",
            Self::ChartsUpdated => "charts_updated",
            Self::RateLimited { .. } => "rate_limited",
            Self::StreamFailed { .. } => "stream_failed",
            Self::Preview { .. } => "preview",
            Self::Log { .. } => "log",
        }
    }
}

/// A custom tracing layer that forwards WARN and ERROR lines to subscribers
struct BroadcastLayer {
    sender: broadcast::Sender<Signal>,
}

impl BroadcastLayer {
    fn new(sender: broadcast::Sender<Signal>) -> Self {
        Self { sender }
    }
}

impl<S> tracing_subscriber::Layer<S> for BroadcastLayer
where
    S: tracing::Subscriber,
{
    fn on_event(
        &self,
        event: &tracing::Event<'_>,
        _ctx: tracing_subscriber::layer::Context<'_, S>,
    ) {
        let level = event.metadata().level();
        if !matches!(*level, tracing::Level::WARN | tracing::Level::ERROR) {
            return;
        }

        let mut line = format!("{} [{}] ", chrono::Local::now().format("%H:%M:%S"), level);
        let mut visitor = MessageVisitor(&mut line);
        event.record(&mut visitor);

        // no receivers is fine
        let _ = self.sender.send(Signal::Log { line });
    }
}

struct MessageVisitor<'a>(&'a mut String);

impl<'a> tracing::field::Visit for MessageVisitor<'a> {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.0.push_str(&format!("{:?}", value));
        } else {
            self.0.push_str(&format!(" {}={:?}", field.name(), value));
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Signal channel first so the log layer can feed it
    let (signal_tx, _) = broadcast::channel::<Signal>(256);

    let data_dir = scrobble_proto::platform::data_dir();
    std::fs::create_dir_all(&data_dir)?;
    let log_path = data_dir.join("daemon.log");

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(log_file)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(BroadcastLayer::new(signal_tx.clone()))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,scrobble_daemon=debug")),
        )
        .init();

    info!("Log file: {:?}", log_path);

    let config = Config::load()?;
    info!("Config loaded from: {:?}", Config::config_path());
    if config.lastfm.username.trim().is_empty() || config.lastfm.api_keys.is_empty() {
        warn!(
            "lastfm.username or lastfm.api_keys missing in {:?}; refreshes will fail",
            Config::config_path()
        );
    }

    let store = Arc::new(PersistentStore::open(
        config.cache.store_file.clone(),
        config.cache.capacity_bytes,
    ));
    info!(
        "Store {:?}: {} of {} bytes used",
        config.cache.store_file,
        store.used_bytes(),
        store.capacity_bytes()
    );

    // Event channel: every external input funnels into SyncCore
    let (event_tx, event_rx) = tokio::sync::mpsc::channel::<core::CoreEvent>(256);

    let sync_core =
        core::SyncCore::new(config.clone(), store, signal_tx.clone(), event_tx.clone()).await?;

    if config.http.enabled {
        let _http_handle = http::start_server(
            config.http.bind_address.clone(),
            config.http.port,
            sync_core.view(),
            event_tx.clone(),
            signal_tx.clone(),
        );
    }

    let shutdown_tx = event_tx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received");
            let _ = shutdown_tx.send(core::CoreEvent::Shutdown).await;
        }
    });

    info!("Daemon initialised, running event loop");
    sync_core.run(event_rx).await?;

    Ok(())
}
