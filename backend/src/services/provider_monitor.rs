use std::time::Duration;

use chrono::Duration as ChronoDuration;
use serde::Serialize;
use shared::{AlertSeverity, Provider, ProviderStatus};
use tokio::time;

use crate::monitoring::metrics;
use crate::services::AppState;
use crate::store::{ProviderActivity, ProviderHealthMetrics, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthAction {
    Healthy,
    Warned,
    Disabled,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProviderHealthReport {
    pub provider_id: String,
    pub issues: Vec<String>,
    pub recent_transaction_count: i64,
    pub success_rate: f64,
    pub action: HealthAction,
}

/// First tick fires immediately, so a check runs at startup.
pub async fn run_monitor(state: AppState) {
    let interval_secs = state.config.health.interval_seconds.max(1);
    let mut interval = time::interval(Duration::from_secs(interval_secs));
    tracing::info!("Provider Health Monitor started (interval: {}s)", interval_secs);
    loop {
        interval.tick().await;
        if let Err(e) = check_providers(&state).await {
            tracing::error!("Provider health cycle error: {}", e);
        }
    }
}

pub async fn check_providers(state: &AppState) -> Result<Vec<ProviderHealthReport>, MonitorError> {
    tracing::debug!("Running provider health cycle...");
    let providers = state
        .stores
        .providers
        .list_providers(Some(ProviderStatus::Active))
        .await?;

    let mut reports = Vec::with_capacity(providers.len());
    for provider in providers {
        match check_provider(state, &provider).await {
            Ok(report) => reports.push(report),
            Err(e) => tracing::error!(
                "Health check failed for provider {}: {}",
                provider.provider_id,
                e
            ),
        }
    }

    let disabled = reports.iter().filter(|r| r.action == HealthAction::Disabled).count();
    tracing::info!(
        "Provider health cycle completed: {} checked, {} disabled",
        reports.len(),
        disabled
    );
    Ok(reports)
}

async fn check_provider(
    state: &AppState,
    provider: &Provider,
) -> Result<ProviderHealthReport, MonitorError> {
    let cfg = &state.config.health;
    let now = state.clock.now();
    let activity = state
        .stores
        .ledger
        .provider_activity(
            &provider.provider_id,
            now - ChronoDuration::hours(24),
            now - ChronoDuration::hours(cfg.success_window_hours),
        )
        .await?;

    let issues = health_issues(state, provider, &activity);
    let success_rate = activity.success_rate();

    state
        .stores
        .providers
        .update_provider_health(
            &provider.provider_id,
            &ProviderHealthMetrics {
                recent_transaction_count: activity.recent_count,
                success_rate,
                last_transaction_at: activity.last_event_at,
            },
        )
        .await?;

    let action = if issues.len() >= cfg.disable_issue_count {
        disable(state, provider, &issues).await?;
        HealthAction::Disabled
    } else if !issues.is_empty() {
        tracing::warn!(
            "Provider {} has health issues: {}",
            provider.provider_id,
            issues.join("; ")
        );
        state.alerts.send_alert(
            "provider_health_warning",
            AlertSeverity::Warning,
            format!("Provider Health Warning: {}", provider.name),
            issues.join("; "),
            serde_json::json!({
                "provider_id": provider.provider_id,
                "issues": issues,
                "success_rate": success_rate,
            }),
        );
        HealthAction::Warned
    } else {
        HealthAction::Healthy
    };

    state.cache.invalidate_provider(&provider.provider_id).await;

    Ok(ProviderHealthReport {
        provider_id: provider.provider_id.clone(),
        issues,
        recent_transaction_count: activity.recent_count,
        success_rate,
        action,
    })
}

fn health_issues(state: &AppState, provider: &Provider, activity: &ProviderActivity) -> Vec<String> {
    let cfg = &state.config.health;
    let now = state.clock.now();
    let mut issues = Vec::new();

    if activity.recent_count == 0 && activity.total_completions > cfg.historical_volume {
        issues.push("No transactions in 24h despite historical volume".to_string());
    }

    if activity.window_total >= cfg.min_samples && activity.success_rate() < cfg.min_success_rate {
        issues.push(format!(
            "Success rate {:.1}% over {} events",
            activity.success_rate(),
            activity.window_total
        ));
    }

    if let Some(last) = activity.last_event_at {
        if now - last > ChronoDuration::hours(cfg.stale_hours) {
            issues.push(format!(
                "No transactions in {}h",
                (now - last).num_hours()
            ));
        }
    }

    if activity.total_completions == 0 && now - provider.created_at > ChronoDuration::days(1) {
        issues.push("No completed transactions since activation".to_string());
    }

    issues
}

async fn disable(state: &AppState, provider: &Provider, issues: &[String]) -> Result<(), MonitorError> {
    let reason = format!("Auto-disabled: {}", issues.join("; "));
    state
        .set_provider_status(&provider.provider_id, ProviderStatus::Disabled, Some(&reason))
        .await?;
    metrics::record_provider_disabled();

    tracing::error!("Provider {} disabled: {}", provider.provider_id, reason);
    state.alerts.send_alert(
        "provider_disabled",
        AlertSeverity::Critical,
        format!("Provider Auto-Disabled: {}", provider.name),
        reason.clone(),
        serde_json::json!({
            "provider_id": provider.provider_id,
            "issues": issues,
        }),
    );
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error("Database error: {0}")]
    DatabaseError(String),
}

impl From<StoreError> for MonitorError {
    fn from(e: StoreError) -> Self {
        MonitorError::DatabaseError(e.to_string())
    }
}
