//! Storage traits for the settlement pipeline.
//!
//! PostgreSQL ([`crate::database::Database`]) is the production backend;
//! the test suite runs against an in-process store with the same semantics.
//! Every method that the pipeline relies on for atomicity documents the unit
//! it must run as.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use shared::{
    Alert, ExchangeRate, LedgerError, Provider, ProviderStats, ProviderStatus,
    ReconciliationReport, RevenueEvent, Wallet, WalletLedgerEntry, WalletMutation,
};

use crate::alerts::AlertEvent;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The external transaction id already has a non-duplicate row.
    #[error("Duplicate transaction: {0}")]
    DuplicateTransaction(String),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Database error: {0}")]
    Database(String),
}

/// Everything the settlement unit wrote, read back after commit.
#[derive(Debug, Clone, Serialize)]
pub struct CommitReceipt {
    pub event: RevenueEvent,
    pub ledger_entry: WalletLedgerEntry,
    pub wallet: Wallet,
}

/// Recent activity of one user, read for risk scoring.
#[derive(Debug, Clone, Default, Serialize)]
pub struct UserActivity {
    pub events_last_hour: i64,
    pub events_last_day: i64,
    /// Most recent first.
    pub recent_event_times: Vec<DateTime<Utc>>,
    pub prior_fraud_rejections: i64,
}

/// Provider volume figures read by the health monitor. `duplicate` audit rows
/// are never counted.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProviderActivity {
    pub recent_count: i64,
    pub window_total: i64,
    pub window_completed: i64,
    pub last_event_at: Option<DateTime<Utc>>,
    pub total_completions: i64,
}

impl ProviderActivity {
    /// Completed share of the success window, in percent.
    pub fn success_rate(&self) -> f64 {
        if self.window_total == 0 {
            0.0
        } else {
            (self.window_completed as f64 / self.window_total as f64) * 100.0
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProviderHealthMetrics {
    pub recent_transaction_count: i64,
    pub success_rate: f64,
    pub last_transaction_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NewPostbackLog {
    pub provider_id: String,
    pub external_transaction_id: Option<String>,
    pub user_id: Option<String>,
    pub request_data: serde_json::Value,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub outcome: String,
    pub http_status: i32,
    pub processing_ms: i64,
}

#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// One round trip to the backing store, for the health endpoint.
    async fn ping(&self) -> Result<(), StoreError>;

    /// The primary (non-`duplicate`) row for an external transaction id.
    async fn find_event_by_external_id(
        &self,
        external_transaction_id: &str,
    ) -> Result<Option<RevenueEvent>, StoreError>;

    async fn user_activity(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
        sample_size: i64,
    ) -> Result<UserActivity, StoreError>;

    /// Insert an event that is already terminal (`failed` or `duplicate`).
    /// A non-duplicate row that collides on the external id yields
    /// [`StoreError::DuplicateTransaction`].
    async fn record_terminal(&self, event: &RevenueEvent) -> Result<RevenueEvent, StoreError>;

    /// One atomic unit: insert `event` as pending (uniqueness is the final
    /// duplicate arbiter), apply `credit` with its ledger entry, mark the event
    /// completed at `completed_at`. Nothing is visible unless all of it is.
    async fn commit_settlement(
        &self,
        event: &RevenueEvent,
        credit: &WalletMutation,
        completed_at: DateTime<Utc>,
    ) -> Result<CommitReceipt, StoreError>;

    /// Credit or debit a wallet with its ledger entry in one unit. Debits
    /// that would go negative fail before anything changes.
    async fn apply_wallet_mutation(
        &self,
        mutation: &WalletMutation,
    ) -> Result<WalletLedgerEntry, StoreError>;

    async fn get_wallet(&self, user_id: &str) -> Result<Option<Wallet>, StoreError>;

    async fn wallet_ledger(
        &self,
        user_id: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<WalletLedgerEntry>, StoreError>;

    async fn wallet_user_ids(&self, limit: i64, offset: i64) -> Result<Vec<String>, StoreError>;

    async fn reconcile_wallet(&self, user_id: &str) -> Result<ReconciliationReport, StoreError>;

    /// Completed events only, newest first.
    async fn completed_events_for_user(
        &self,
        user_id: &str,
        limit: i64,
    ) -> Result<Vec<RevenueEvent>, StoreError>;

    async fn provider_activity(
        &self,
        provider_id: &str,
        recent_since: DateTime<Utc>,
        window_since: DateTime<Utc>,
    ) -> Result<ProviderActivity, StoreError>;

    async fn provider_stats(
        &self,
        provider_id: &str,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<ProviderStats, StoreError>;

    async fn save_rates(&self, rates: &[ExchangeRate]) -> Result<(), StoreError>;

    /// Newest observation of every pair quoted into `to_currency`.
    async fn latest_rates(&self, to_currency: &str) -> Result<Vec<ExchangeRate>, StoreError>;

    async fn rate_history(
        &self,
        from_currency: &str,
        to_currency: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<ExchangeRate>, StoreError>;

    async fn prune_rates(&self, observed_before: DateTime<Utc>) -> Result<u64, StoreError>;

    async fn record_postback_log(&self, log: &NewPostbackLog) -> Result<i64, StoreError>;
}

#[async_trait]
pub trait ProviderRegistry: Send + Sync {
    async fn get_provider(&self, provider_id: &str) -> Result<Option<Provider>, StoreError>;

    async fn list_providers(
        &self,
        status: Option<ProviderStatus>,
    ) -> Result<Vec<Provider>, StoreError>;

    async fn upsert_provider(&self, provider: &Provider) -> Result<(), StoreError>;

    async fn update_provider_health(
        &self,
        provider_id: &str,
        metrics: &ProviderHealthMetrics,
    ) -> Result<(), StoreError>;

    /// `reason` is kept only for `disabled`; any other status clears it.
    async fn set_provider_status(
        &self,
        provider_id: &str,
        status: ProviderStatus,
        reason: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<Provider, StoreError>;
}

#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn create_alert(&self, alert: &AlertEvent) -> Result<i64, StoreError>;

    async fn active_alerts(&self, limit: i64) -> Result<Vec<Alert>, StoreError>;

    async fn acknowledge_alert(&self, alert_id: i64) -> Result<(), StoreError>;

    async fn resolve_alert(&self, alert_id: i64) -> Result<(), StoreError>;
}

/// What the account directory knows about a user's devices and contacts.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DirectoryRiskContext {
    /// Distinct devices the user was seen on in the last 24h.
    pub distinct_devices: i64,
    /// Distinct IP addresses the user was seen from in the last 24h.
    pub distinct_ips: i64,
    /// Largest number of *other* accounts sharing any one of the user's devices.
    pub max_accounts_per_device: i64,
    /// Largest number of *other* accounts sharing any one of the user's IPs.
    pub max_accounts_per_ip: i64,
    /// Another account has the same phone, email or bank account.
    pub duplicate_contact: bool,
}

/// Read-only view of the user directory owned by the accounts subsystem.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn user_exists(&self, user_id: &str) -> Result<bool, StoreError>;

    async fn risk_context(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<DirectoryRiskContext, StoreError>;
}
