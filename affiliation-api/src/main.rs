use std::sync::Arc;

use axum::Router;
use envconfig::Envconfig;
use eyre::Result;

use affiliation_common::ingest::AffiliationIngestionService;
use affiliation_common::metrics::setup_metrics_routes;
use affiliation_common::store::postgres::PostgresStore;

use config::Config;

mod config;
mod handlers;

async fn listen(app: Router, bind: String) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;

    axum::serve(listener, app).await?;

    Ok(())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env().expect("failed to load configuration from env");

    let store = PostgresStore::new(&config.database_url, config.max_pg_connections)
        .await
        .expect("failed to connect to the affiliation store");
    let service = Arc::new(AffiliationIngestionService::new(Arc::new(store)));

    let app = handlers::add_routes(Router::new(), service);
    let app = setup_metrics_routes(app);

    match listen(app, config.bind()).await {
        Ok(_) => {}
        Err(e) => tracing::error!("failed to start affiliation-api http server, {}", e),
    }
}
