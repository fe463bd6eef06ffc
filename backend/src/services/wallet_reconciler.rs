use std::time::Duration;

use serde::Serialize;
use shared::AlertSeverity;
use tokio::time;

use crate::services::AppState;
use crate::store::StoreError;

const PAGE_SIZE: i64 = 500;

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconciliationSummary {
    pub total_wallets: i64,
    pub mismatches: i64,
    pub errors: i64,
    pub mismatched_users: Vec<String>,
}

pub async fn run_reconciler(state: AppState) {
    let interval_secs = state.config.reconciliation_interval_seconds.max(1);
    let mut interval = time::interval(Duration::from_secs(interval_secs));

    tracing::info!("Wallet Reconciler started (interval: {}s)", interval_secs);

    loop {
        interval.tick().await;

        if let Err(e) = reconciliation_cycle(&state).await {
            tracing::error!("Reconciliation cycle error: {}", e);
        }
    }
}

/// Checks every wallet's ledger sum against `available - initial`.
pub async fn reconciliation_cycle(state: &AppState) -> Result<ReconciliationSummary, ReconcilerError> {
    tracing::info!("Starting reconciliation cycle...");
    let mut summary = ReconciliationSummary::default();
    let mut offset = 0;

    loop {
        let user_ids = state.stores.ledger.wallet_user_ids(PAGE_SIZE, offset).await?;
        if user_ids.is_empty() {
            break;
        }
        offset += user_ids.len() as i64;

        for user_id in user_ids {
            summary.total_wallets += 1;
            match state.stores.ledger.reconcile_wallet(&user_id).await {
                Ok(report) if report.is_balanced() => {}
                Ok(report) => {
                    summary.mismatches += 1;
                    summary.mismatched_users.push(user_id.clone());
                    tracing::error!(
                        "Ledger mismatch for wallet {}: expected {}, ledger {}, diff {}",
                        report.user_id,
                        report.expected_delta,
                        report.ledger_sum,
                        report.discrepancy
                    );
                    state.alerts.send_alert(
                        "wallet_reconciliation_mismatch",
                        AlertSeverity::Critical,
                        format!("Wallet Ledger Mismatch: {}", report.user_id),
                        format!(
                            "Balance movement {} does not match ledger sum {} ({} entries)",
                            report.expected_delta, report.ledger_sum, report.entries
                        ),
                        serde_json::json!(report),
                    );
                }
                Err(e) => {
                    summary.errors += 1;
                    tracing::error!("Reconciliation failed for wallet {}: {}", user_id, e);
                }
            }
        }
    }

    tracing::info!(
        "Reconciliation cycle completed: {} wallets, {} mismatches, {} errors",
        summary.total_wallets,
        summary.mismatches,
        summary.errors
    );

    if summary.mismatches > 0 {
        state.alerts.send_alert(
            "reconciliation_summary",
            AlertSeverity::Warning,
            "Wallet Reconciliation Summary",
            format!(
                "Reconciliation found {} mismatches out of {} wallets",
                summary.mismatches, summary.total_wallets
            ),
            serde_json::json!({
                "total_wallets": summary.total_wallets,
                "mismatches": summary.mismatches,
                "errors": summary.errors,
            }),
        );
    }
    Ok(summary)
}

#[derive(Debug, thiserror::Error)]
pub enum ReconcilerError {
    #[error("Database error: {0}")]
    DatabaseError(String),
}

impl From<StoreError> for ReconcilerError {
    fn from(e: StoreError) -> Self {
        ReconcilerError::DatabaseError(e.to_string())
    }
}
