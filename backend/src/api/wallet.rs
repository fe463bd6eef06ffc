use actix_web::{web, HttpResponse, Responder};
use shared::{ApiResponse, PaginationParams};

use crate::services::AppState;

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/wallet")
            .route("/{user_id}", web::get().to(get_wallet))
            .route("/{user_id}/ledger", web::get().to(get_ledger)),
    );
}

async fn get_wallet(state: web::Data<AppState>, user_id: web::Path<String>) -> impl Responder {
    match state.stores.ledger.get_wallet(&user_id).await {
        Ok(Some(wallet)) => HttpResponse::Ok().json(ApiResponse::success(wallet)),
        Ok(None) => {
            HttpResponse::NotFound().json(ApiResponse::<()>::error("Wallet not found".to_string()))
        }
        Err(e) => {
            tracing::error!("Failed to get wallet {}: {}", user_id, e);
            HttpResponse::InternalServerError().json(ApiResponse::<()>::error(e.to_string()))
        }
    }
}

async fn get_ledger(
    state: web::Data<AppState>,
    user_id: web::Path<String>,
    query: web::Query<PaginationParams>,
) -> impl Responder {
    let limit = query.limit.clamp(1, 500);
    let offset = query.offset.max(0);

    match state.stores.ledger.wallet_ledger(&user_id, limit, offset).await {
        Ok(entries) => HttpResponse::Ok().json(ApiResponse::success(entries)),
        Err(e) => {
            tracing::error!("Failed to get ledger for {}: {}", user_id, e);
            HttpResponse::InternalServerError().json(ApiResponse::<()>::error(e.to_string()))
        }
    }
}
