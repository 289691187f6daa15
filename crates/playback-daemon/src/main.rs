mod bridge;
mod broadcaster;
mod collection;
mod control;
mod coordinator;
mod error;
mod http;
mod remote;
mod resolver;
mod socket;
#[cfg(test)]
mod testing;
mod variants;

use playback_proto::config::Config;
use playback_proto::protocol::SyncBroadcast;
use playback_proto::state::SelectionStore;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::bridge::{BridgeClient, BridgeEvent};
use crate::broadcaster::PlaybackStateBroadcaster;
use crate::collection::HttpAlbumDirectory;
use crate::control::{ControlChannel, RetryPolicy};
use crate::coordinator::BrowseSessionCoordinator;
use crate::resolver::PlaybackResolver;
use crate::variants::VariantGenerator;

/// A custom tracing layer that forwards log messages to observers
struct BroadcastLayer {
    sender: broadcast::Sender<SyncBroadcast>,
}

impl BroadcastLayer {
    fn new(sender: broadcast::Sender<SyncBroadcast>) -> Self {
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
        // Only WARN and ERROR; observers are not log viewers
        let level = event.metadata().level();
        if !matches!(*level, tracing::Level::WARN | tracing::Level::ERROR) {
            return;
        }

        let mut message = String::new();
        let now = chrono::Local::now();
        message.push_str(&format!("{} ", now.format("%H:%M:%S")));
        message.push_str(&format!("[{}] ", level));

        let mut visitor = MessageVisitor(&mut message);
        event.record(&mut visitor);

        // No receivers is OK
        let _ = self.sender.send(SyncBroadcast::Log { message });
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
    // Config first: the broadcast channel size comes from it
    let config = Config::load()?;

    let (broadcast_tx, _) =
        broadcast::channel::<SyncBroadcast>(config.broadcast.channel_capacity.max(1));

    // File logging + broadcast layer
    let data_dir = playback_proto::platform::data_dir();
    std::fs::create_dir_all(&data_dir)?;
    let log_path = data_dir.join("daemon.log");

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(log_file)
        .with_ansi(false);

    let broadcast_layer = BroadcastLayer::new(broadcast_tx.clone());

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(broadcast_layer)
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,playback_daemon=debug")),
        )
        .init();

    info!("Log file: {:?}", log_path);
    info!("Config loaded from: {:?}", Config::config_path());

    // Bridge push events feed the poller
    let (bridge_tx, bridge_rx) = mpsc::channel::<BridgeEvent>(256);
    let bridge = Arc::new(BridgeClient::new(&config.bridge, bridge_tx));

    let selection = Arc::new(SelectionStore::new(config.daemon.state_file.clone()));
    let broadcaster = Arc::new(PlaybackStateBroadcaster::new(broadcast_tx.clone()));

    let coordinator = Arc::new(BrowseSessionCoordinator::new(bridge.clone()));
    let resolver = Arc::new(PlaybackResolver::new(
        coordinator,
        VariantGenerator::new(&config.variants),
        selection.clone(),
        &config.resolver,
    ));
    let control = Arc::new(ControlChannel::new(
        bridge.clone(),
        broadcaster.clone(),
        selection,
        RetryPolicy::from(&config.control),
    ));
    let directory = Arc::new(HttpAlbumDirectory::new(&config.collection)?);

    match control.zones().await {
        Ok(zones) => info!(
            "Bridge at {} reports {} zone(s)",
            config.bridge.address,
            zones.len()
        ),
        Err(e) => warn!("Bridge at {} not reachable yet: {}", config.bridge.address, e),
    }

    let cancel = CancellationToken::new();
    let poller = tokio::spawn(broadcaster::run_poller(
        broadcaster.clone(),
        bridge.clone(),
        bridge_rx,
        config.broadcast.poll_interval(),
        config.broadcast.heartbeat_interval(),
        cancel.clone(),
    ));

    if config.sync.enabled {
        let _sync_handle = socket::start_server(
            config.http.bind_address.clone(),
            config.sync.port,
            broadcaster.clone(),
            control.clone(),
        );
    }

    if config.http.enabled {
        let _http_handle = http::start_server(
            config.http.bind_address.clone(),
            config.http.port,
            http::HttpState {
                resolver,
                control,
                broadcaster,
                directory,
            },
        );
    }

    info!("Daemon initialised");
    tokio::signal::ctrl_c().await?;

    info!("Shutting down (bridge connected: {})", bridge.is_connected().await);
    cancel.cancel();
    let _ = poller.await;

    Ok(())
}
