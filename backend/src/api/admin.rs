use actix_web::{web, HttpResponse, Responder};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use shared::{ApiResponse, ProviderStatus};

use crate::services::{provider_monitor, wallet_reconciler, AppState, RateError};
use crate::store::StoreError;

#[derive(Debug, Deserialize)]
pub struct ProviderListQuery {
    pub status: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct StatsQuery {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateStatusRequest {
    pub status: String,
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RateHistoryQuery {
    pub from: String,
    pub to: Option<String>,
    pub days: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct AlertQuery {
    pub limit: Option<i64>,
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/admin")
            .route("/providers", web::get().to(list_providers))
            .route("/providers/{provider_id}/stats", web::get().to(provider_stats))
            .route("/providers/{provider_id}/status", web::put().to(update_provider_status))
            .route("/rates", web::get().to(current_rates))
            .route("/rates/history", web::get().to(rate_history))
            .route("/rates/status", web::get().to(rate_status))
            .route("/rates/refresh", web::post().to(refresh_rates))
            .route("/health-check", web::post().to(run_health_check))
            .route("/reconciliation", web::post().to(run_reconciliation))
            .route("/alerts", web::get().to(list_alerts))
            .route("/alerts/{alert_id}/acknowledge", web::post().to(acknowledge_alert))
            .route("/alerts/{alert_id}/resolve", web::post().to(resolve_alert)),
    );
}

fn store_error(context: &str, e: StoreError) -> HttpResponse {
    match e {
        StoreError::NotFound(what) => {
            HttpResponse::NotFound().json(ApiResponse::<()>::error(format!("Not found: {}", what)))
        }
        other => {
            tracing::error!("{}: {}", context, other);
            HttpResponse::InternalServerError().json(ApiResponse::<()>::error(other.to_string()))
        }
    }
}

async fn list_providers(
    state: web::Data<AppState>,
    query: web::Query<ProviderListQuery>,
) -> impl Responder {
    let status = match query.status.as_deref().map(ProviderStatus::parse) {
        Some(None) => {
            return HttpResponse::BadRequest()
                .json(ApiResponse::<()>::error("Unknown provider status".to_string()))
        }
        Some(status) => status,
        None => None,
    };

    match state.stores.providers.list_providers(status).await {
        Ok(providers) => HttpResponse::Ok().json(ApiResponse::success(providers)),
        Err(e) => store_error("Failed to list providers", e),
    }
}

async fn provider_stats(
    state: web::Data<AppState>,
    provider_id: web::Path<String>,
    query: web::Query<StatsQuery>,
) -> impl Responder {
    match state
        .stores
        .ledger
        .provider_stats(&provider_id, query.from, query.to)
        .await
    {
        Ok(stats) => HttpResponse::Ok().json(ApiResponse::success(stats)),
        Err(e) => store_error("Failed to get provider stats", e),
    }
}

/// The only way out of `disabled` is an explicit status change here.
async fn update_provider_status(
    state: web::Data<AppState>,
    provider_id: web::Path<String>,
    req: web::Json<UpdateStatusRequest>,
) -> impl Responder {
    let Some(status) = ProviderStatus::parse(&req.status) else {
        return HttpResponse::BadRequest()
            .json(ApiResponse::<()>::error(format!("Unknown provider status: {}", req.status)));
    };
    tracing::info!("API: Set provider {} to {}", provider_id, status.as_str());

    match state
        .set_provider_status(&provider_id, status, req.reason.as_deref())
        .await
    {
        Ok(provider) => HttpResponse::Ok().json(ApiResponse::success(provider)),
        Err(e) => store_error("Failed to update provider status", e),
    }
}

async fn current_rates(state: web::Data<AppState>) -> impl Responder {
    HttpResponse::Ok().json(ApiResponse::success(state.rates.current_rates()))
}

async fn rate_history(
    state: web::Data<AppState>,
    query: web::Query<RateHistoryQuery>,
) -> impl Responder {
    let to = query
        .to
        .clone()
        .unwrap_or_else(|| state.rates.settlement_currency().to_string());
    let days = query.days.unwrap_or(7).clamp(1, 365);

    match state.rates.history(&query.from, &to, days).await {
        Ok(history) => HttpResponse::Ok().json(ApiResponse::success(history)),
        Err(RateError::Ledger(e)) => {
            HttpResponse::BadRequest().json(ApiResponse::<()>::error(e.to_string()))
        }
        Err(e) => {
            tracing::error!("Failed to get rate history: {}", e);
            HttpResponse::InternalServerError().json(ApiResponse::<()>::error(e.to_string()))
        }
    }
}

async fn rate_status(state: web::Data<AppState>) -> impl Responder {
    HttpResponse::Ok().json(ApiResponse::success(state.rates.cache_status()))
}

async fn refresh_rates(state: web::Data<AppState>) -> impl Responder {
    tracing::info!("API: Forced exchange rate refresh");
    match state.rates.refresh().await {
        Ok(_) => HttpResponse::Ok().json(ApiResponse::success(state.rates.cache_status())),
        Err(e) => {
            tracing::error!("Forced rate refresh failed: {}", e);
            HttpResponse::BadGateway().json(ApiResponse::<()>::error(e.to_string()))
        }
    }
}

async fn run_health_check(state: web::Data<AppState>) -> impl Responder {
    match provider_monitor::check_providers(&state).await {
        Ok(reports) => HttpResponse::Ok().json(ApiResponse::success(reports)),
        Err(e) => {
            tracing::error!("Health check failed: {}", e);
            HttpResponse::InternalServerError().json(ApiResponse::<()>::error(e.to_string()))
        }
    }
}

async fn run_reconciliation(state: web::Data<AppState>) -> impl Responder {
    match wallet_reconciler::reconciliation_cycle(&state).await {
        Ok(summary) => HttpResponse::Ok().json(ApiResponse::success(summary)),
        Err(e) => {
            tracing::error!("Reconciliation failed: {}", e);
            HttpResponse::InternalServerError().json(ApiResponse::<()>::error(e.to_string()))
        }
    }
}

async fn list_alerts(state: web::Data<AppState>, query: web::Query<AlertQuery>) -> impl Responder {
    let limit = query.limit.unwrap_or(50).clamp(1, 500);
    match state.stores.alerts.active_alerts(limit).await {
        Ok(alerts) => HttpResponse::Ok().json(ApiResponse::success(alerts)),
        Err(e) => store_error("Failed to list alerts", e),
    }
}

async fn acknowledge_alert(state: web::Data<AppState>, alert_id: web::Path<i64>) -> impl Responder {
    match state.stores.alerts.acknowledge_alert(*alert_id).await {
        Ok(()) => HttpResponse::Ok().json(ApiResponse::success(*alert_id)),
        Err(e) => store_error("Failed to acknowledge alert", e),
    }
}

async fn resolve_alert(state: web::Data<AppState>, alert_id: web::Path<i64>) -> impl Responder {
    match state.stores.alerts.resolve_alert(*alert_id).await {
        Ok(()) => HttpResponse::Ok().json(ApiResponse::success(*alert_id)),
        Err(e) => store_error("Failed to resolve alert", e),
    }
}
