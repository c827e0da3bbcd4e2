//! Consume consortium affiliation events and apply them to the registry.
use std::future::ready;
use std::sync::Arc;
use std::time::Duration;

use axum::{routing::get, Router};
use envconfig::Envconfig;
use tracing::level_filters::LevelFilter;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use affiliation_common::health::HealthRegistry;
use affiliation_common::ingest::AffiliationIngestionService;
use affiliation_common::metrics::{serve, setup_metrics_routes};
use affiliation_common::store::postgres::PostgresStore;

mod config;
mod consumer;
mod error;

use config::Config;
use consumer::AffiliationEventConsumer;

fn setup_tracing() {
    let log_layer = tracing_subscriber::fmt::layer().with_filter(
        EnvFilter::builder()
            .with_default_directive(LevelFilter::INFO.into())
            .from_env_lossy()
            .add_directive("rdkafka=warn".parse().unwrap()),
    );
    tracing_subscriber::registry().with(log_layer).init();
}

async fn index() -> &'static str {
    "affiliation consumer"
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    setup_tracing();
    info!("starting affiliation event consumer");

    let config = Config::init_from_env()?;

    let liveness = HealthRegistry::new("liveness");
    let consumer_liveness = liveness
        .register("consumer_loop".to_string(), time::Duration::seconds(30))
        .await;

    let store = Arc::new(PostgresStore::new(&config.database_url, config.max_pg_connections).await?);
    let service = Arc::new(AffiliationIngestionService::new(store));

    // Probe and metrics server next to the consumer loop.
    let bind = config.bind();
    let router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/_liveness", get(move || ready(liveness.get_status())));
    let router = setup_metrics_routes(router);
    tokio::task::spawn(async move {
        serve(router, &bind)
            .await
            .expect("failed to start health server");
    });

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let mut grace_rx = shutdown_rx.clone();

    tokio::spawn(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to listen for ctrl+c");
        info!("shutdown signal received");
        shutdown_tx.send(true).ok();
    });

    let consumer = AffiliationEventConsumer::new(&config, service, consumer_liveness)?;

    // Stop pulling on shutdown, let in-flight events finish within the
    // grace period; unstored offsets are simply redelivered on restart.
    let grace = Duration::from_secs(config.shutdown_grace_secs);
    tokio::select! {
        result = consumer.run(shutdown_rx) => result?,
        _ = async {
            loop {
                if grace_rx.changed().await.is_err() || *grace_rx.borrow() {
                    break;
                }
            }
            tokio::time::sleep(grace).await;
        } => {
            warn!("shutdown grace period expired, abandoning in-flight work");
        }
    }

    info!("affiliation event consumer shut down");
    Ok(())
}
