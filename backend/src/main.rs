//! # Offer-Wall Settlement Backend
//!
//! Receives offer-wall postbacks from third-party networks, verifies them,
//! converts the reported amount into the settlement currency and credits the
//! user's wallet exactly once per provider transaction id.
//!
//! ## Architecture
//!
//! 1. **Configuration**: environment variables, optional `.env`
//! 2. **Storage**: PostgreSQL with migrations
//! 3. **Exchange rates**: cached, refreshed from the rate source, loaded from storage at startup
//! 4. **Background services**:
//!    - Alert dispatcher (persists published alerts)
//!    - Provider health monitor (auto-disables failing providers)
//!    - Wallet reconciler (ledger sum vs balance)
//!    - Rate refresher (refresh and prune rate history)
//! 5. **HTTP Server**: Actix-web with CORS, logging, compression
//!
//! ## API Endpoints
//!
//! - `GET /health` - Health check
//! - `GET /metrics` - Prometheus metrics
//! - `/api/v1/postback/*` - Provider postbacks and transaction lookups
//! - `/api/v1/wallet/*` - Wallet balance and ledger
//! - `/api/v1/admin/*` - Providers, rates, alerts, on-demand jobs

use std::sync::Arc;

use actix_cors::Cors;
use actix_web::{middleware, web, App, HttpServer};
use anyhow::Context;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod alerts;
mod api;
mod cache;
mod clock;
mod config;
mod database;
mod monitoring;
mod services;
mod store;

#[cfg(test)]
mod memory_store;
#[cfg(test)]
mod test_support;

use config::Config;

use crate::{
    alerts::AlertPublisher,
    clock::SystemClock,
    database::Database,
    services::{exchange_rate, provider_monitor, wallet_reconciler, HttpRateSource, Stores},
};

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "offerwall_backend=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!(" Starting Offer-Wall Settlement Backend");
    api::health::mark_started();

    dotenv::dotenv().ok();

    let config = Config::from_env().context("Failed to load configuration")?;
    tracing::info!(" Configuration loaded");

    let database = Database::new(&config.database_url, config.max_db_connections)
        .await
        .context("Failed to connect to database")?;
    tracing::info!("  Database connected");
    database
        .run_migrations()
        .await
        .context("Failed to run migrations")?;
    tracing::info!(" Database migrations completed");
    let stores = Stores::postgres(database);

    let (alert_publisher, alert_rx) = AlertPublisher::channel(config.alert_channel_capacity);
    let rate_source = HttpRateSource::new(&config.rates.api_url, config.rates.fetch_timeout)
        .context("Failed to build exchange rate client")?;

    let state = services::AppState::new(
        config.clone(),
        stores.clone(),
        Arc::new(rate_source),
        alert_publisher,
        Arc::new(SystemClock),
    );

    match state.rates.load_from_store().await {
        Ok(count) if count > 0 => tracing::info!(" Loaded {} cached exchange rates", count),
        Ok(_) => tracing::info!(" No stored exchange rates; first conversion will fetch"),
        Err(e) => tracing::warn!("Failed to load stored exchange rates: {}", e),
    }

    // Start background services
    tokio::spawn(alerts::run_alert_dispatcher(alert_rx, stores.alerts.clone()));

    let monitor_state = state.clone();
    tokio::spawn(async move {
        provider_monitor::run_monitor(monitor_state).await;
    });

    let reconcile_state = state.clone();
    tokio::spawn(async move {
        wallet_reconciler::run_reconciler(reconcile_state).await;
    });

    tokio::spawn(exchange_rate::run_rate_refresher(state.rates.clone()));
    tracing::info!(" Background services started (alerts, health monitor, reconciler, rate refresher)");

    let app_state = web::Data::new(state);
    let bind_address = format!("{}:{}", config.host, config.port);
    tracing::info!(" Server listening on http://{}", bind_address);

    HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(app_state.clone())
            .wrap(middleware::Logger::default())
            .wrap(middleware::Compress::default())
            .wrap(tracing_actix_web::TracingLogger::default())
            .wrap(cors)
            .route("/health", web::get().to(api::health::health_check))
            .route("/metrics", web::get().to(monitoring::metrics::metrics))
            .service(
                web::scope("/api/v1")
                    .configure(api::postback::configure)
                    .configure(api::wallet::configure)
                    .configure(api::admin::configure),
            )
    })
    .workers(num_cpus::get() * 2)
    .bind(&bind_address)
    .with_context(|| format!("Failed to bind {}", bind_address))?
    .run()
    .await
    .context("HTTP server error")
}
