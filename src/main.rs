//! BridgeBot - trading gateway execution bridge
//!
//! Bridges a persistent trading-engine subprocess (NDJSON over stdio) and an
//! optional live exchange (signed REST + user-data stream) into a single
//! replayable event stream served over HTTP/SSE.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use bridgebot_backend::{
    api::{self, AppState},
    bridge::{AccountStore, EventLog, ExecutionRouter, OrderStore, RouterConfig},
    config::{Config, ExecutionMode},
    engine::ProcessChannel,
    exchange::{UserDataStream, VenueApi, VenueRestClient},
    market_feed::{EngineFeedStatus, MarketFeedPoller},
};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    info!(mode = config.execution_mode.as_str(), "starting bridgebot");

    let log = Arc::new(EventLog::new(
        config.event_log_capacity,
        config.activity_capacity,
    ));
    let orders = Arc::new(OrderStore::new());
    let balances = Arc::new(AccountStore::new());
    let feed_status = Arc::new(EngineFeedStatus::new());
    let stream_connected = Arc::new(AtomicBool::new(false));

    // Engine subprocess. A spawn failure here is fatal to the whole bridge.
    let (channel, engine_rx) = match &config.engine_cmd {
        Some(cmd) => {
            let (channel, rx) =
                ProcessChannel::start(cmd, &config.engine_args).context("engine startup failed")?;
            (Some(channel), Some(rx))
        }
        None => (None, None),
    };

    let venue: Option<Arc<dyn VenueApi>> =
        match (&config.venue_api_key, &config.venue_api_secret) {
            (Some(key), Some(secret)) => Some(Arc::new(VenueRestClient::new(
                &config.venue_rest_base,
                key,
                secret,
            ))),
            _ => {
                if config.execution_mode == ExecutionMode::Live {
                    warn!("live mode without venue credentials; order actions will be refused");
                }
                None
            }
        };

    let router = Arc::new(ExecutionRouter::new(
        config.execution_mode,
        channel.clone(),
        venue.clone(),
        log.clone(),
        orders.clone(),
        feed_status.clone(),
        stream_connected.clone(),
        RouterConfig {
            poll_interval: Duration::from_secs(config.poll_interval_secs),
            error_throttle: Duration::from_secs(config.error_throttle_secs),
        },
    ));

    if let Some(rx) = engine_rx {
        router.spawn_engine_ingest(rx);
    }

    if config.execution_mode == ExecutionMode::Live {
        router.spawn_status_poller();
        if let Some(venue) = &venue {
            UserDataStream::new(
                venue.clone(),
                &config.venue_ws_base,
                log.clone(),
                orders.clone(),
                balances.clone(),
                stream_connected.clone(),
                Duration::from_secs(config.listen_key_keepalive_secs),
            )
            .spawn();
        }
    }

    if config.market_feed_enabled {
        MarketFeedPoller::new(
            &config.venue_rest_base,
            config.market_symbols.clone(),
            log.clone(),
            feed_status,
            Duration::from_secs(config.market_poll_interval_secs),
            config.market_staleness_ms,
        )
        .spawn();
    }

    let app = api::router(AppState {
        log,
        orders,
        balances,
        router,
        stream_connected,
    });

    let listener = TcpListener::bind(("0.0.0.0", config.port))
        .await
        .context("failed to bind listen port")?;
    info!(port = config.port, "bridgebot listening");

    axum::serve(listener, app).await.context("server failed")?;

    // Advisory shutdown; the engine may outlive us briefly.
    if let Some(channel) = channel {
        channel.stop();
    }

    Ok(())
}
