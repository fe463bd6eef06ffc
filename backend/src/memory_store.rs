//! In-process store with the same semantics as the PostgreSQL backend.
//!
//! All state sits behind one mutex, so every trait method is trivially one
//! atomic unit. The external transaction id index plays the role of the
//! partial unique index: one non-`duplicate` row per id.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use shared::{
    checked_add, Alert, AlertStatus, ExchangeRate, LedgerError, PostbackLog, Provider,
    ProviderStats, ProviderStatus, ReconciliationReport, RevenueEvent, RevenueStatus, Wallet,
    WalletDirection, WalletLedgerEntry, WalletMutation,
};
use uuid::Uuid;

use crate::alerts::AlertEvent;
use crate::store::{
    AlertSink, CommitReceipt, DirectoryRiskContext, LedgerStore, NewPostbackLog, ProviderActivity,
    ProviderHealthMetrics, ProviderRegistry, StoreError, UserActivity, UserDirectory,
};

#[derive(Debug, Clone, Default)]
struct DirectoryUser {
    email: Option<String>,
    phone_number: Option<String>,
    bank_account_number: Option<String>,
}

#[derive(Debug, Clone)]
struct DeviceSighting {
    user_id: String,
    device_id: Option<String>,
    ip_address: Option<String>,
    seen_at: DateTime<Utc>,
}

#[derive(Default)]
struct State {
    providers: HashMap<String, Provider>,
    events: Vec<RevenueEvent>,
    primary_by_external_id: HashMap<String, usize>,
    wallets: HashMap<String, Wallet>,
    ledger: Vec<WalletLedgerEntry>,
    rates: Vec<ExchangeRate>,
    alerts: Vec<Alert>,
    postback_logs: Vec<PostbackLog>,
    users: HashMap<String, DirectoryUser>,
    devices: Vec<DeviceSighting>,
}

impl State {
    fn is_counted(event: &RevenueEvent) -> bool {
        event.status != RevenueStatus::Duplicate.as_str()
    }

    fn insert_event(&mut self, event: RevenueEvent) -> Result<(), StoreError> {
        let is_primary = Self::is_counted(&event);
        if is_primary && self.primary_by_external_id.contains_key(&event.external_transaction_id) {
            return Err(StoreError::DuplicateTransaction(
                event.external_transaction_id.clone(),
            ));
        }
        if is_primary {
            self.primary_by_external_id
                .insert(event.external_transaction_id.clone(), self.events.len());
        }
        self.events.push(event);
        Ok(())
    }

    /// Applies a mutation to the wallet, creating it on first credit.
    fn mutate_wallet(
        &mut self,
        mutation: &WalletMutation,
        at: DateTime<Utc>,
    ) -> Result<(Wallet, WalletLedgerEntry), StoreError> {
        if mutation.amount <= 0 {
            return Err(LedgerError::InvalidAmount(format!(
                "wallet mutation amount {} must be positive",
                mutation.amount
            ))
            .into());
        }

        let mut wallet = match self.wallets.get(&mutation.user_id) {
            Some(wallet) => wallet.clone(),
            None if mutation.direction == WalletDirection::Credit => {
                Wallet::new(&mutation.user_id, 0, at)
            }
            None => return Err(LedgerError::WalletNotFound(mutation.user_id.clone()).into()),
        };

        if mutation.direction == WalletDirection::Debit && !wallet.has_available(mutation.amount) {
            return Err(LedgerError::InsufficientBalance {
                available: wallet.available_balance,
                required: mutation.amount,
            }
            .into());
        }

        wallet.available_balance = checked_add(wallet.available_balance, mutation.delta())?;
        if mutation.direction == WalletDirection::Credit {
            wallet.lifetime_earnings = checked_add(wallet.lifetime_earnings, mutation.amount)?;
        }
        wallet.updated_at = at;

        let entry = WalletLedgerEntry {
            id: Uuid::new_v4(),
            user_id: mutation.user_id.clone(),
            reference_type: mutation.reference_type.clone(),
            reference_id: mutation.reference_id.clone(),
            delta: mutation.delta(),
            balance_after: wallet.available_balance,
            reason: mutation.reason.clone(),
            created_at: at,
        };

        self.wallets.insert(wallet.user_id.clone(), wallet.clone());
        self.ledger.push(entry.clone());
        Ok((wallet, entry))
    }
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    offline: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `ping` fail, as an unreachable database would.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::Relaxed);
    }

    /// Registers a user in the directory.
    pub fn seed_user(
        &self,
        user_id: &str,
        email: Option<&str>,
        phone_number: Option<&str>,
        bank_account_number: Option<&str>,
    ) {
        self.state.lock().users.insert(
            user_id.to_string(),
            DirectoryUser {
                email: email.map(str::to_string),
                phone_number: phone_number.map(str::to_string),
                bank_account_number: bank_account_number.map(str::to_string),
            },
        );
    }

    pub fn record_device(
        &self,
        user_id: &str,
        device_id: Option<&str>,
        ip_address: Option<&str>,
        seen_at: DateTime<Utc>,
    ) {
        self.state.lock().devices.push(DeviceSighting {
            user_id: user_id.to_string(),
            device_id: device_id.map(str::to_string),
            ip_address: ip_address.map(str::to_string),
            seen_at,
        });
    }

    /// Inserts an event row as-is, bypassing settlement. Used to shape
    /// provider history.
    pub fn import_event(&self, event: RevenueEvent) -> Result<(), StoreError> {
        self.state.lock().insert_event(event)
    }

    pub fn events(&self) -> Vec<RevenueEvent> {
        self.state.lock().events.clone()
    }

    pub fn postback_logs(&self) -> Vec<PostbackLog> {
        self.state.lock().postback_logs.clone()
    }

    pub fn ledger_entries(&self, user_id: &str) -> Vec<WalletLedgerEntry> {
        self.state
            .lock()
            .ledger
            .iter()
            .filter(|e| e.user_id == user_id)
            .cloned()
            .collect()
    }

    /// Overwrites a wallet without a ledger entry, to simulate drift.
    pub fn force_wallet(&self, wallet: Wallet) {
        self.state.lock().wallets.insert(wallet.user_id.clone(), wallet);
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn ping(&self) -> Result<(), StoreError> {
        if self.offline.load(Ordering::Relaxed) {
            return Err(StoreError::Database("connection refused".to_string()));
        }
        Ok(())
    }

    async fn find_event_by_external_id(
        &self,
        external_transaction_id: &str,
    ) -> Result<Option<RevenueEvent>, StoreError> {
        let state = self.state.lock();
        Ok(state
            .primary_by_external_id
            .get(external_transaction_id)
            .and_then(|idx| state.events.get(*idx))
            .cloned())
    }

    async fn user_activity(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
        sample_size: i64,
    ) -> Result<UserActivity, StoreError> {
        let state = self.state.lock();
        let hour_ago = now - Duration::hours(1);
        let day_ago = now - Duration::hours(24);

        let mut mine: Vec<&RevenueEvent> = state
            .events
            .iter()
            .filter(|e| e.user_id == user_id && State::is_counted(e))
            .collect();
        mine.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        Ok(UserActivity {
            events_last_hour: mine.iter().filter(|e| e.created_at >= hour_ago).count() as i64,
            events_last_day: mine.iter().filter(|e| e.created_at >= day_ago).count() as i64,
            recent_event_times: mine
                .iter()
                .take(sample_size.max(0) as usize)
                .map(|e| e.created_at)
                .collect(),
            prior_fraud_rejections: mine
                .iter()
                .filter(|e| e.status == RevenueStatus::Failed.as_str() && !e.risk_flags.is_empty())
                .count() as i64,
        })
    }

    async fn record_terminal(&self, event: &RevenueEvent) -> Result<RevenueEvent, StoreError> {
        let mut state = self.state.lock();
        state.insert_event(event.clone())?;
        Ok(event.clone())
    }

    async fn commit_settlement(
        &self,
        event: &RevenueEvent,
        credit: &WalletMutation,
        completed_at: DateTime<Utc>,
    ) -> Result<CommitReceipt, StoreError> {
        let mut state = self.state.lock();

        if state
            .primary_by_external_id
            .contains_key(&event.external_transaction_id)
        {
            return Err(StoreError::DuplicateTransaction(
                event.external_transaction_id.clone(),
            ));
        }

        // Wallet first: a failed mutation must leave no event behind.
        let (wallet, ledger_entry) = state.mutate_wallet(credit, completed_at)?;

        let mut completed = event.clone();
        completed.status = RevenueStatus::Completed.as_str().to_string();
        completed.processed_at = Some(completed_at);
        state.insert_event(completed.clone())?;

        Ok(CommitReceipt {
            event: completed,
            ledger_entry,
            wallet,
        })
    }

    async fn apply_wallet_mutation(
        &self,
        mutation: &WalletMutation,
    ) -> Result<WalletLedgerEntry, StoreError> {
        let (_, entry) = self.state.lock().mutate_wallet(mutation, Utc::now())?;
        Ok(entry)
    }

    async fn get_wallet(&self, user_id: &str) -> Result<Option<Wallet>, StoreError> {
        Ok(self.state.lock().wallets.get(user_id).cloned())
    }

    async fn wallet_ledger(
        &self,
        user_id: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<WalletLedgerEntry>, StoreError> {
        let state = self.state.lock();
        let mut entries: Vec<WalletLedgerEntry> = state
            .ledger
            .iter()
            .filter(|e| e.user_id == user_id)
            .cloned()
            .collect();
        entries.reverse();
        Ok(entries
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect())
    }

    async fn wallet_user_ids(&self, limit: i64, offset: i64) -> Result<Vec<String>, StoreError> {
        let state = self.state.lock();
        let mut ids: Vec<String> = state.wallets.keys().cloned().collect();
        ids.sort();
        Ok(ids
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect())
    }

    async fn reconcile_wallet(&self, user_id: &str) -> Result<ReconciliationReport, StoreError> {
        let state = self.state.lock();
        let wallet = state
            .wallets
            .get(user_id)
            .ok_or_else(|| StoreError::NotFound(format!("wallet {}", user_id)))?;

        let (ledger_sum, entries) = state
            .ledger
            .iter()
            .filter(|e| e.user_id == user_id)
            .fold((0_i64, 0_i64), |(sum, n), e| (sum + e.delta, n + 1));
        let expected_delta = wallet.expected_ledger_sum();

        Ok(ReconciliationReport {
            user_id: user_id.to_string(),
            expected_delta,
            ledger_sum,
            discrepancy: expected_delta - ledger_sum,
            entries,
        })
    }

    async fn completed_events_for_user(
        &self,
        user_id: &str,
        limit: i64,
    ) -> Result<Vec<RevenueEvent>, StoreError> {
        let state = self.state.lock();
        let mut events: Vec<RevenueEvent> = state
            .events
            .iter()
            .filter(|e| e.user_id == user_id && e.status == RevenueStatus::Completed.as_str())
            .cloned()
            .collect();
        events.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        events.truncate(limit.max(0) as usize);
        Ok(events)
    }

    async fn provider_activity(
        &self,
        provider_id: &str,
        recent_since: DateTime<Utc>,
        window_since: DateTime<Utc>,
    ) -> Result<ProviderActivity, StoreError> {
        let state = self.state.lock();
        let mut activity = ProviderActivity::default();

        for event in state
            .events
            .iter()
            .filter(|e| e.provider_id == provider_id && State::is_counted(e))
        {
            let completed = event.status == RevenueStatus::Completed.as_str();
            if event.created_at >= recent_since {
                activity.recent_count += 1;
            }
            if event.created_at >= window_since {
                activity.window_total += 1;
                if completed {
                    activity.window_completed += 1;
                }
            }
            if completed {
                activity.total_completions += 1;
            }
            if activity.last_event_at.map_or(true, |last| event.created_at > last) {
                activity.last_event_at = Some(event.created_at);
            }
        }

        Ok(activity)
    }

    async fn provider_stats(
        &self,
        provider_id: &str,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<ProviderStats, StoreError> {
        let state = self.state.lock();
        let mut stats = ProviderStats {
            provider_id: provider_id.to_string(),
            ..Default::default()
        };

        let in_range = |e: &&RevenueEvent| {
            e.provider_id == provider_id
                && from.map_or(true, |f| e.created_at >= f)
                && to.map_or(true, |t| e.created_at <= t)
        };

        for event in state.events.iter().filter(in_range) {
            stats.total_events += 1;
            match RevenueStatus::parse(&event.status) {
                Some(RevenueStatus::Completed) => {
                    stats.completed += 1;
                    stats.total_converted += event.converted_amount;
                    stats.total_commission += event.commission_amount;
                    stats.total_user_earnings += event.user_earnings;
                }
                Some(RevenueStatus::Failed) => stats.failed += 1,
                Some(RevenueStatus::Duplicate) => stats.duplicate += 1,
                _ => {}
            }
        }

        Ok(stats)
    }

    async fn save_rates(&self, rates: &[ExchangeRate]) -> Result<(), StoreError> {
        self.state.lock().rates.extend_from_slice(rates);
        Ok(())
    }

    async fn latest_rates(&self, to_currency: &str) -> Result<Vec<ExchangeRate>, StoreError> {
        let state = self.state.lock();
        let mut latest: HashMap<&str, &ExchangeRate> = HashMap::new();
        for rate in state.rates.iter().filter(|r| r.to_currency == to_currency) {
            match latest.get(rate.from_currency.as_str()) {
                Some(current) if current.observed_at >= rate.observed_at => {}
                _ => {
                    latest.insert(rate.from_currency.as_str(), rate);
                }
            }
        }
        let mut rates: Vec<ExchangeRate> = latest.into_values().cloned().collect();
        rates.sort_by(|a, b| a.from_currency.cmp(&b.from_currency));
        Ok(rates)
    }

    async fn rate_history(
        &self,
        from_currency: &str,
        to_currency: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<ExchangeRate>, StoreError> {
        let state = self.state.lock();
        let mut rates: Vec<ExchangeRate> = state
            .rates
            .iter()
            .filter(|r| {
                r.from_currency == from_currency
                    && r.to_currency == to_currency
                    && r.observed_at >= since
            })
            .cloned()
            .collect();
        rates.sort_by(|a, b| b.observed_at.cmp(&a.observed_at));
        Ok(rates)
    }

    async fn prune_rates(&self, observed_before: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut state = self.state.lock();
        let before = state.rates.len();
        state.rates.retain(|r| r.observed_at >= observed_before);
        Ok((before - state.rates.len()) as u64)
    }

    async fn record_postback_log(&self, log: &NewPostbackLog) -> Result<i64, StoreError> {
        let mut state = self.state.lock();
        let id = state.postback_logs.len() as i64 + 1;
        state.postback_logs.push(PostbackLog {
            id,
            provider_id: log.provider_id.clone(),
            external_transaction_id: log.external_transaction_id.clone(),
            user_id: log.user_id.clone(),
            request_data: log.request_data.clone(),
            ip_address: log.ip_address.clone(),
            user_agent: log.user_agent.clone(),
            outcome: log.outcome.clone(),
            http_status: log.http_status,
            processing_ms: log.processing_ms,
            created_at: Utc::now(),
        });
        Ok(id)
    }
}

#[async_trait]
impl ProviderRegistry for MemoryStore {
    async fn get_provider(&self, provider_id: &str) -> Result<Option<Provider>, StoreError> {
        Ok(self.state.lock().providers.get(provider_id).cloned())
    }

    async fn list_providers(
        &self,
        status: Option<ProviderStatus>,
    ) -> Result<Vec<Provider>, StoreError> {
        let state = self.state.lock();
        let mut providers: Vec<Provider> = state
            .providers
            .values()
            .filter(|p| status.as_ref().map_or(true, |s| p.status == s.as_str()))
            .cloned()
            .collect();
        providers.sort_by(|a, b| a.provider_id.cmp(&b.provider_id));
        Ok(providers)
    }

    async fn upsert_provider(&self, provider: &Provider) -> Result<(), StoreError> {
        self.state
            .lock()
            .providers
            .insert(provider.provider_id.clone(), provider.clone());
        Ok(())
    }

    async fn update_provider_health(
        &self,
        provider_id: &str,
        metrics: &ProviderHealthMetrics,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        let provider = state
            .providers
            .get_mut(provider_id)
            .ok_or_else(|| StoreError::NotFound(format!("provider {}", provider_id)))?;
        provider.recent_transaction_count = metrics.recent_transaction_count;
        provider.success_rate = metrics.success_rate;
        provider.last_transaction_at = metrics.last_transaction_at;
        provider.updated_at = Utc::now();
        Ok(())
    }

    async fn set_provider_status(
        &self,
        provider_id: &str,
        status: ProviderStatus,
        reason: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<Provider, StoreError> {
        let mut state = self.state.lock();
        let provider = state
            .providers
            .get_mut(provider_id)
            .ok_or_else(|| StoreError::NotFound(format!("provider {}", provider_id)))?;

        provider.status = status.as_str().to_string();
        if status == ProviderStatus::Disabled {
            provider.disabled_reason = reason.map(str::to_string);
            provider.disabled_at = Some(at);
        } else {
            provider.disabled_reason = None;
            provider.disabled_at = None;
        }
        provider.updated_at = at;
        Ok(provider.clone())
    }
}

#[async_trait]
impl AlertSink for MemoryStore {
    async fn create_alert(&self, alert: &AlertEvent) -> Result<i64, StoreError> {
        let mut state = self.state.lock();
        let id = state.alerts.len() as i64 + 1;
        state.alerts.push(Alert {
            id,
            alert_type: alert.alert_type.clone(),
            severity: alert.severity.as_str().to_string(),
            title: alert.title.clone(),
            message: alert.message.clone(),
            details: Some(alert.metadata.clone()),
            status: AlertStatus::Active.as_str().to_string(),
            created_at: Utc::now(),
            acknowledged_at: None,
            resolved_at: None,
        });
        Ok(id)
    }

    async fn active_alerts(&self, limit: i64) -> Result<Vec<Alert>, StoreError> {
        let state = self.state.lock();
        Ok(state
            .alerts
            .iter()
            .rev()
            .filter(|a| a.status == AlertStatus::Active.as_str())
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn acknowledge_alert(&self, alert_id: i64) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        let alert = state
            .alerts
            .iter_mut()
            .find(|a| a.id == alert_id)
            .ok_or_else(|| StoreError::NotFound(format!("alert {}", alert_id)))?;
        alert.status = AlertStatus::Acknowledged.as_str().to_string();
        alert.acknowledged_at = Some(Utc::now());
        Ok(())
    }

    async fn resolve_alert(&self, alert_id: i64) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        let alert = state
            .alerts
            .iter_mut()
            .find(|a| a.id == alert_id)
            .ok_or_else(|| StoreError::NotFound(format!("alert {}", alert_id)))?;
        alert.status = AlertStatus::Resolved.as_str().to_string();
        alert.resolved_at = Some(Utc::now());
        Ok(())
    }
}

#[async_trait]
impl UserDirectory for MemoryStore {
    async fn user_exists(&self, user_id: &str) -> Result<bool, StoreError> {
        Ok(self.state.lock().users.contains_key(user_id))
    }

    async fn risk_context(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<DirectoryRiskContext, StoreError> {
        let state = self.state.lock();
        let day_ago = now - Duration::hours(24);

        let mine: Vec<&DeviceSighting> =
            state.devices.iter().filter(|d| d.user_id == user_id).collect();

        let recent_devices: HashSet<&str> = mine
            .iter()
            .filter(|d| d.seen_at >= day_ago)
            .filter_map(|d| d.device_id.as_deref())
            .collect();
        let recent_ips: HashSet<&str> = mine
            .iter()
            .filter(|d| d.seen_at >= day_ago)
            .filter_map(|d| d.ip_address.as_deref())
            .collect();

        let sharing = |matches: &dyn Fn(&DeviceSighting) -> bool| -> i64 {
            state
                .devices
                .iter()
                .filter(|d| d.user_id != user_id && matches(d))
                .map(|d| d.user_id.as_str())
                .collect::<HashSet<_>>()
                .len() as i64
        };

        let max_accounts_per_device = mine
            .iter()
            .filter_map(|d| d.device_id.as_deref())
            .map(|device| sharing(&|d: &DeviceSighting| d.device_id.as_deref() == Some(device)))
            .max()
            .unwrap_or(0);
        let max_accounts_per_ip = mine
            .iter()
            .filter_map(|d| d.ip_address.as_deref())
            .map(|ip| sharing(&|d: &DeviceSighting| d.ip_address.as_deref() == Some(ip)))
            .max()
            .unwrap_or(0);

        let duplicate_contact = match state.users.get(user_id) {
            Some(me) => state.users.iter().any(|(other_id, other)| {
                let same = |a: &Option<String>, b: &Option<String>| {
                    matches!((a, b), (Some(a), Some(b)) if !a.is_empty() && a == b)
                };
                other_id != user_id
                    && (same(&me.email, &other.email)
                        || same(&me.phone_number, &other.phone_number)
                        || same(&me.bank_account_number, &other.bank_account_number))
            }),
            None => false,
        };

        Ok(DirectoryRiskContext {
            distinct_devices: recent_devices.len() as i64,
            distinct_ips: recent_ips.len() as i64,
            max_accounts_per_device,
            max_accounts_per_ip,
            duplicate_contact,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn debit_below_zero_changes_nothing() {
        let store = MemoryStore::new();
        store
            .apply_wallet_mutation(&WalletMutation::credit("U1", 500, "seed", "test", "t1"))
            .await
            .unwrap();

        let err = store
            .apply_wallet_mutation(&WalletMutation::debit("U1", 800, "withdraw", "test", "t2"))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            StoreError::Ledger(LedgerError::InsufficientBalance { available: 500, required: 800 })
        ));
        let wallet = store.get_wallet("U1").await.unwrap().unwrap();
        assert_eq!(wallet.available_balance, 500);
        assert_eq!(store.ledger_entries("U1").len(), 1);
    }

    #[tokio::test]
    async fn debit_of_unknown_wallet_fails() {
        let store = MemoryStore::new();
        let err = store
            .apply_wallet_mutation(&WalletMutation::debit("ghost", 1, "withdraw", "test", "t"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Ledger(LedgerError::WalletNotFound(_))));
    }

    #[tokio::test]
    async fn ledger_sum_reconciles_after_mixed_mutations() {
        let store = MemoryStore::new();
        for (i, amount) in [1_000_i64, 250, 4_000].iter().enumerate() {
            store
                .apply_wallet_mutation(&WalletMutation::credit("U1", *amount, "earn", "test", &i.to_string()))
                .await
                .unwrap();
        }
        store
            .apply_wallet_mutation(&WalletMutation::debit("U1", 1_200, "withdraw", "test", "w"))
            .await
            .unwrap();

        let report = store.reconcile_wallet("U1").await.unwrap();
        assert!(report.is_balanced());
        assert_eq!(report.ledger_sum, 4_050);
        assert_eq!(report.entries, 4);
    }

    #[tokio::test]
    async fn risk_context_counts_shared_devices_and_contacts() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store.seed_user("U1", Some("a@x.io"), Some("0800"), None);
        store.seed_user("U2", Some("b@x.io"), Some("0800"), None);
        store.seed_user("U3", None, None, None);

        store.record_device("U1", Some("dev-1"), Some("10.0.0.1"), now);
        store.record_device("U2", Some("dev-1"), Some("10.0.0.2"), now);
        store.record_device("U3", Some("dev-1"), Some("10.0.0.1"), now);
        store.record_device("U1", Some("dev-old"), None, now - Duration::days(3));

        let ctx = store.risk_context("U1", now).await.unwrap();
        assert_eq!(ctx.distinct_devices, 1);
        assert_eq!(ctx.distinct_ips, 1);
        assert_eq!(ctx.max_accounts_per_device, 2);
        assert_eq!(ctx.max_accounts_per_ip, 1);
        assert!(ctx.duplicate_contact);

        let ctx = store.risk_context("U3", now).await.unwrap();
        assert!(!ctx.duplicate_contact);
    }
}
