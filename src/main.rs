/// Main entry point for the rate streaming service
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use ratestream::{
    broker::FinnhubClient,
    config::load_config,
    data::{JsonlHourlyStore, RatesAggregator},
    error::{Result, StreamError},
    events::BroadcastHub,
    server::SubscriberServer,
    Config, LogFormat,
};

/// Application state
pub struct RateStreamApp {
    config: Arc<Config>,
    store: Arc<JsonlHourlyStore>,
    aggregator: Arc<RatesAggregator>,
    hub: Arc<BroadcastHub>,
    feed: Arc<FinnhubClient>,
    server: SubscriberServer,
}

impl RateStreamApp {
    pub async fn new(config: Config) -> Result<Self> {
        let config = Arc::new(config);

        let store = Arc::new(JsonlHourlyStore::open(&config.storage.path).await?);
        info!(
            "Hourly average store opened at {} ({} rows)",
            store.path().display(),
            store.len().await
        );

        let aggregator = Arc::new(RatesAggregator::new(
            store.clone(),
            config.supported_pairs(),
        ));
        match aggregator.load_initial_averages().await {
            Ok(hydrated) => info!("Hydrated {} pairs from storage", hydrated),
            Err(e) if e.is_recoverable() => {
                warn!("Starting without stored averages: {} ({})", e, e.error_code());
            }
            Err(e) => return Err(e),
        }

        let hub = Arc::new(BroadcastHub::new());
        aggregator.set_update_callback(hub.clone()).await;

        let feed = Arc::new(FinnhubClient::new(&config, Arc::clone(&aggregator))?);

        let server = SubscriberServer::bind(
            &config.server.bind_addr,
            Arc::clone(&hub),
            Arc::clone(&aggregator),
            config.server.subscriber_buffer,
        )
        .await?;

        Ok(RateStreamApp {
            config,
            store,
            aggregator,
            hub,
            feed,
            server,
        })
    }

    /// Run feed and subscriber server until Ctrl+C
    pub async fn run(self) -> Result<()> {
        let RateStreamApp {
            config,
            store,
            aggregator,
            hub,
            feed,
            server,
        } = self;

        info!(
            "Streaming {} pairs, subscribers on ws://{}",
            config.pairs.len(),
            config.server.bind_addr
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let feed_stop = feed.stop_handle();

        let feed_task = {
            let feed = Arc::clone(&feed);
            tokio::spawn(async move { feed.run().await })
        };
        let server_task = tokio::spawn(server.run(shutdown_rx));

        tokio::signal::ctrl_c()
            .await
            .map_err(|e| StreamError::InternalError(format!("Failed to listen for Ctrl+C: {}", e)))?;

        info!("Ctrl+C received - initiating graceful shutdown");

        feed_stop.stop();
        shutdown_tx.send_replace(true);

        if let Err(e) = feed_task.await {
            error!("Feed task ended abnormally: {}", e);
        }
        if let Err(e) = server_task.await {
            error!("Subscriber server task ended abnormally: {}", e);
        }

        if let Err(e) = store.compact().await {
            warn!("Failed to compact hourly store: {} ({})", e, e.error_code());
        }

        let stats = feed.stats().snapshot();
        info!(
            "Shutdown complete: {} messages, {} ticks forwarded, {} malformed, {} dropped ticks, {} persist failures, {} subscribers at exit",
            stats.messages,
            stats.ticks_forwarded,
            stats.malformed,
            aggregator.dropped_ticks(),
            aggregator.persist_failures(),
            hub.subscriber_count().await
        );

        Ok(())
    }
}

fn init_logging(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("ratestream={},info", config.log_level)));

    match config.log_format {
        LogFormat::Json => tracing_subscriber::fmt().json().with_env_filter(filter).init(),
        LogFormat::Pretty => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::var("CONFIG_PATH")
        .unwrap_or_else(|_| "config.toml".to_string());

    let config = match load_config(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load {}: {} ({})", config_path, e, e.error_code());
            return Err(e);
        }
    };

    init_logging(&config);
    info!("Starting rate streaming service...");

    let app = RateStreamApp::new(config).await?;

    app.run().await?;

    Ok(())
}
