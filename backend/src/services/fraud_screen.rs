use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::FraudConfig;
use crate::store::{LedgerStore, StoreError, UserDirectory};

pub const FLAG_DUPLICATE: &str = "duplicate";
pub const FLAG_VELOCITY: &str = "velocity";
pub const FLAG_FAN_IN: &str = "device_ip_fan_in";
pub const FLAG_TIMING: &str = "timing_regularity";
pub const FLAG_DUPLICATE_CONTACT: &str = "duplicate_contact";
pub const FLAG_MULTI_DEVICE: &str = "multi_device";
pub const FLAG_MULTI_IP: &str = "multi_ip";

const MAX_SCORE: u32 = 100;

/// Rolling view of one user's behaviour, derived on demand.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RiskProfile {
    pub user_id: String,
    pub events_last_hour: i64,
    pub events_last_day: i64,
    /// Most recent first, last 24h only.
    pub recent_event_times: Vec<DateTime<Utc>>,
    pub distinct_devices: i64,
    pub distinct_ips: i64,
    pub max_accounts_per_device: i64,
    pub max_accounts_per_ip: i64,
    pub duplicate_contact: bool,
    pub prior_fraud_rejections: i64,
}

impl RiskProfile {
    /// Population standard deviation of the gaps between consecutive events,
    /// in milliseconds.
    pub fn interval_stddev_ms(&self) -> Option<f64> {
        if self.recent_event_times.len() < 2 {
            return None;
        }
        let intervals: Vec<f64> = self
            .recent_event_times
            .windows(2)
            .map(|w| (w[0] - w[1]).num_milliseconds() as f64)
            .collect();
        let mean = intervals.iter().sum::<f64>() / intervals.len() as f64;
        let variance =
            intervals.iter().map(|i| (i - mean).powi(2)).sum::<f64>() / intervals.len() as f64;
        Some(variance.sqrt())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Verdict {
    pub allow: bool,
    pub risk_score: u32,
    pub flags: Vec<String>,
}

pub struct FraudScreen {
    config: FraudConfig,
    ledger: Arc<dyn LedgerStore>,
    directory: Arc<dyn UserDirectory>,
    clock: Arc<dyn Clock>,
}

impl FraudScreen {
    pub fn new(
        config: FraudConfig,
        ledger: Arc<dyn LedgerStore>,
        directory: Arc<dyn UserDirectory>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            ledger,
            directory,
            clock,
        }
    }

    /// The existing primary row for this transaction id, if any. Advisory:
    /// the unique index decides races at insert time.
    pub async fn duplicate_of(
        &self,
        external_transaction_id: &str,
    ) -> Result<Option<Uuid>, StoreError> {
        let existing = self
            .ledger
            .find_event_by_external_id(external_transaction_id)
            .await?;
        if let Some(existing) = &existing {
            tracing::info!(
                "Duplicate transaction {} (existing event {}, status {})",
                external_transaction_id,
                existing.id,
                existing.status
            );
        }
        Ok(existing.map(|e| e.id))
    }

    /// Risk scoring for a transaction that is not a duplicate.
    pub async fn assess(
        &self,
        user_id: &str,
        external_transaction_id: &str,
    ) -> Result<Verdict, StoreError> {
        let profile = self.profile(user_id).await?;
        let verdict = self.score(&profile);
        if !verdict.flags.is_empty() {
            tracing::warn!(
                "Risk flags for user {} on {}: score={} flags={:?}",
                user_id,
                external_transaction_id,
                verdict.risk_score,
                verdict.flags
            );
        }
        Ok(verdict)
    }

    pub async fn profile(&self, user_id: &str) -> Result<RiskProfile, StoreError> {
        let now = self.clock.now();
        let activity = self
            .ledger
            .user_activity(user_id, now, self.config.timing_sample_size)
            .await?;
        let directory = self.directory.risk_context(user_id, now).await?;
        let day_ago = now - Duration::hours(24);

        Ok(RiskProfile {
            user_id: user_id.to_string(),
            events_last_hour: activity.events_last_hour,
            events_last_day: activity.events_last_day,
            recent_event_times: activity
                .recent_event_times
                .into_iter()
                .filter(|t| *t >= day_ago)
                .collect(),
            distinct_devices: directory.distinct_devices,
            distinct_ips: directory.distinct_ips,
            max_accounts_per_device: directory.max_accounts_per_device,
            max_accounts_per_ip: directory.max_accounts_per_ip,
            duplicate_contact: directory.duplicate_contact,
            prior_fraud_rejections: activity.prior_fraud_rejections,
        })
    }

    pub fn score(&self, profile: &RiskProfile) -> Verdict {
        let cfg = &self.config;
        let mut score: u32 = 0;
        let mut flags = Vec::new();

        if profile.events_last_hour > cfg.velocity_limit {
            score += cfg.velocity_penalty;
            flags.push(FLAG_VELOCITY.to_string());
        }

        let shared = profile.max_accounts_per_device.max(profile.max_accounts_per_ip);
        if shared > cfg.fan_in_allowance {
            let excess = (shared - cfg.fan_in_allowance).min(i64::from(MAX_SCORE)) as u32;
            score += excess * cfg.fan_in_penalty;
            flags.push(FLAG_FAN_IN.to_string());
        }

        if profile.recent_event_times.len() >= cfg.timing_min_samples {
            if let Some(stddev) = profile.interval_stddev_ms() {
                if stddev < cfg.timing_min_stddev_ms {
                    score += cfg.timing_penalty;
                    flags.push(FLAG_TIMING.to_string());
                }
            }
        }

        if profile.duplicate_contact {
            score += cfg.duplicate_contact_penalty;
            flags.push(FLAG_DUPLICATE_CONTACT.to_string());
        }

        if profile.distinct_devices > cfg.multi_device_limit {
            score += cfg.multi_device_penalty;
            flags.push(FLAG_MULTI_DEVICE.to_string());
        }

        if profile.distinct_ips > cfg.multi_ip_limit {
            score += cfg.multi_ip_penalty;
            flags.push(FLAG_MULTI_IP.to_string());
        }

        let risk_score = score.min(MAX_SCORE);
        Verdict {
            allow: risk_score < cfg.reject_threshold,
            risk_score,
            flags,
        }
    }
}
