use actix_web::{web, HttpResponse, Responder};
use serde::Serialize;

use crate::services::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub settlement_currency: String,
    pub rates_stale: bool,
    pub storage: String,
    pub cached_providers: u64,
}

static START_TIME: std::sync::OnceLock<std::time::Instant> = std::sync::OnceLock::new();

pub fn mark_started() {
    START_TIME.get_or_init(std::time::Instant::now);
}

/// Stale rates degrade but do not fail the service; settlement still runs on
/// them. An unreachable store is a 503.
pub async fn health_check(state: web::Data<AppState>) -> impl Responder {
    let start_time = START_TIME.get_or_init(std::time::Instant::now);
    let uptime = start_time.elapsed().as_secs();
    let rates_stale = state.rates.is_stale();
    let cache = state.cache.get_stats().await;

    let storage_ok = match state.stores.ledger.ping().await {
        Ok(()) => true,
        Err(e) => {
            tracing::error!("Health check: store unreachable: {}", e);
            false
        }
    };
    let (mut response, status) = if !storage_ok {
        (HttpResponse::ServiceUnavailable(), "unhealthy")
    } else if rates_stale {
        (HttpResponse::Ok(), "degraded")
    } else {
        (HttpResponse::Ok(), "healthy")
    };

    response.json(HealthResponse {
        status: status.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: uptime,
        settlement_currency: state.rates.settlement_currency().to_string(),
        rates_stale,
        storage: if storage_ok { "ok" } else { "unreachable" }.to_string(),
        cached_providers: cache.provider_entries,
    })
}
