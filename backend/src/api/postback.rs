use std::collections::HashMap;

use actix_web::{http::header, http::StatusCode, web, HttpRequest, HttpResponse, Responder};
use rust_decimal::Decimal;
use serde::Deserialize;
use shared::{ApiResponse, EarningRecord, PostbackParams};

use crate::services::postback::{self as ingestion, AckResponse, InboundPostback};
use crate::services::AppState;

const SIGNATURE_HEADER: &str = "X-Signature";
const MAX_HISTORY: i64 = 100;

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct TestPostbackRequest {
    pub provider_id: String,
    pub user_id: String,
    pub amount: Decimal,
    pub currency: Option<String>,
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/postback")
            .route("/test", web::post().to(test_postback))
            .route("/transaction/{external_id}", web::get().to(get_transaction))
            .route("/user/{user_id}/transactions", web::get().to(get_user_transactions))
            .route("/{provider_id}", web::get().to(receive_postback))
            .route("/{provider_id}", web::post().to(receive_postback)),
    );
}

/// Query string merged with a form or JSON body; body values win.
fn collect_params(req: &HttpRequest, body: &[u8]) -> PostbackParams {
    let mut params: PostbackParams =
        web::Query::<HashMap<String, String>>::from_query(req.query_string())
            .map(|q| q.into_inner().into_iter().collect())
            .unwrap_or_default();

    if body.is_empty() {
        return params;
    }

    let content_type = req
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    if content_type.starts_with("application/json") {
        if let Ok(serde_json::Value::Object(map)) = serde_json::from_slice(body) {
            for (key, value) in map {
                let value = match value {
                    serde_json::Value::String(s) => s,
                    serde_json::Value::Null => continue,
                    other => other.to_string(),
                };
                params.insert(key, value);
            }
        }
    } else if let Ok(text) = std::str::from_utf8(body) {
        if let Ok(form) = web::Query::<HashMap<String, String>>::from_query(text) {
            params.extend(form.into_inner());
        }
    }
    params
}

fn ack_response(ack: AckResponse) -> HttpResponse {
    if ack.success {
        return HttpResponse::Ok()
            .content_type("text/plain; charset=utf-8")
            .body(ack.token.clone().unwrap_or_else(|| "1".to_string()));
    }

    let status =
        StatusCode::from_u16(ack.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut response = HttpResponse::build(status);
    if let Some(secs) = ack.retry_after {
        response.insert_header((header::RETRY_AFTER, secs.to_string()));
    }
    response.json(ack)
}

async fn receive_postback(
    req: HttpRequest,
    state: web::Data<AppState>,
    provider_id: web::Path<String>,
    body: web::Bytes,
) -> impl Responder {
    let inbound = InboundPostback {
        provider_id: provider_id.into_inner().to_ascii_lowercase(),
        params: collect_params(&req, &body),
        source_ip: req.peer_addr().map(|addr| addr.ip()),
        user_agent: req
            .headers()
            .get(header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
        signature_header: req
            .headers()
            .get(SIGNATURE_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
    };

    ack_response(ingestion::handle_postback(&state, inbound).await)
}

async fn test_postback(
    state: web::Data<AppState>,
    req: web::Json<TestPostbackRequest>,
) -> impl Responder {
    if !state.config.enable_test_postbacks {
        return HttpResponse::NotFound()
            .json(ApiResponse::<()>::error("Test postbacks are disabled".to_string()));
    }

    let currency = req.currency.as_deref().unwrap_or("USD");
    let ack =
        ingestion::run_test_postback(&state, &req.provider_id, &req.user_id, req.amount, currency)
            .await;
    let status =
        StatusCode::from_u16(ack.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    HttpResponse::build(status).json(ack)
}

async fn get_transaction(
    state: web::Data<AppState>,
    external_id: web::Path<String>,
) -> impl Responder {
    match state
        .stores
        .ledger
        .find_event_by_external_id(&external_id)
        .await
    {
        Ok(Some(event)) => HttpResponse::Ok().json(ApiResponse::success(event)),
        Ok(None) => HttpResponse::NotFound()
            .json(ApiResponse::<()>::error("Transaction not found".to_string())),
        Err(e) => {
            tracing::error!("Failed to get transaction {}: {}", external_id, e);
            HttpResponse::InternalServerError().json(ApiResponse::<()>::error(e.to_string()))
        }
    }
}

async fn get_user_transactions(
    state: web::Data<AppState>,
    user_id: web::Path<String>,
    query: web::Query<HistoryQuery>,
) -> impl Responder {
    let limit = query.limit.unwrap_or(50).clamp(1, MAX_HISTORY);
    match state
        .stores
        .ledger
        .completed_events_for_user(&user_id, limit)
        .await
    {
        Ok(events) => {
            let records: Vec<EarningRecord> = events.iter().map(EarningRecord::from).collect();
            HttpResponse::Ok().json(ApiResponse::success(records))
        }
        Err(e) => {
            tracing::error!("Failed to get transactions for {}: {}", user_id, e);
            HttpResponse::InternalServerError().json(ApiResponse::<()>::error(e.to_string()))
        }
    }
}
