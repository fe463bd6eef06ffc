use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use shared::{
    checked_add, Alert, ExchangeRate, LedgerError, Provider, ProviderStats, ProviderStatus,
    ReconciliationReport, RevenueEvent, RevenueStatus, Wallet, WalletDirection,
    WalletLedgerEntry, WalletMutation,
};
use sqlx::{postgres::PgPoolOptions, PgConnection, PgPool, Row};
use std::time::Duration;
use uuid::Uuid;

use crate::alerts::AlertEvent;
use crate::store::{
    AlertSink, CommitReceipt, DirectoryRiskContext, LedgerStore, NewPostbackLog, ProviderActivity,
    ProviderHealthMetrics, ProviderRegistry, StoreError, UserActivity, UserDirectory,
};

const UNIQUE_VIOLATION: &str = "23505";

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &e {
            if db.code().as_deref() == Some(UNIQUE_VIOLATION) {
                return StoreError::DuplicateTransaction(db.message().to_string());
            }
        }
        StoreError::Database(e.to_string())
    }
}

#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self, sqlx::Error> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(2)
            .acquire_timeout(Duration::from_secs(3))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await?;

        Ok(Self { pool })
    }

    pub async fn run_migrations(&self) -> Result<(), sqlx::Error> {
        sqlx::migrate!("../migrations").run(&self.pool).await?;
        Ok(())
    }
}

/// Inserts `event` unless a non-duplicate row already holds its external id.
/// Returns `false` on that conflict.
async fn insert_event(conn: &mut PgConnection, event: &RevenueEvent) -> Result<bool, sqlx::Error> {
    let inserted = sqlx::query(
        r#"
        INSERT INTO revenue_events (
            id, user_id, provider_id, provider_name, external_transaction_id,
            offer_name, offer_category, original_amount, original_currency,
            converted_amount, commission_rate, commission_amount, user_earnings,
            status, verification_status, verification_method, risk_score, risk_flags,
            postback_data, ip_address, user_agent, failure_reason, processed_at, created_at
        ) VALUES (
            $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16,
            $17, $18, $19, $20, $21, $22, $23, $24
        )
        ON CONFLICT (external_transaction_id) WHERE status <> 'duplicate'
        DO NOTHING
        RETURNING id
        "#,
    )
    .bind(event.id)
    .bind(&event.user_id)
    .bind(&event.provider_id)
    .bind(&event.provider_name)
    .bind(&event.external_transaction_id)
    .bind(&event.offer_name)
    .bind(&event.offer_category)
    .bind(event.original_amount)
    .bind(&event.original_currency)
    .bind(event.converted_amount)
    .bind(event.commission_rate)
    .bind(event.commission_amount)
    .bind(event.user_earnings)
    .bind(&event.status)
    .bind(&event.verification_status)
    .bind(&event.verification_method)
    .bind(event.risk_score)
    .bind(&event.risk_flags)
    .bind(&event.postback_data)
    .bind(&event.ip_address)
    .bind(&event.user_agent)
    .bind(&event.failure_reason)
    .bind(event.processed_at)
    .bind(event.created_at)
    .fetch_optional(&mut *conn)
    .await?;

    Ok(inserted.is_some())
}

/// Locks the wallet row, applies the mutation and appends its ledger entry.
/// Must run inside a transaction.
async fn mutate_wallet(
    conn: &mut PgConnection,
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

    if mutation.direction == WalletDirection::Credit {
        sqlx::query(
            r#"
            INSERT INTO wallets (user_id, available_balance, initial_balance, lifetime_earnings, created_at, updated_at)
            VALUES ($1, 0, 0, 0, $2, $2)
            ON CONFLICT (user_id) DO NOTHING
            "#,
        )
        .bind(&mutation.user_id)
        .bind(at)
        .execute(&mut *conn)
        .await?;
    }

    let wallet = sqlx::query_as::<_, Wallet>("SELECT * FROM wallets WHERE user_id = $1 FOR UPDATE")
        .bind(&mutation.user_id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| LedgerError::WalletNotFound(mutation.user_id.clone()))?;

    if mutation.direction == WalletDirection::Debit && !wallet.has_available(mutation.amount) {
        return Err(LedgerError::InsufficientBalance {
            available: wallet.available_balance,
            required: mutation.amount,
        }
        .into());
    }

    let new_balance = checked_add(wallet.available_balance, mutation.delta())?;
    let lifetime = match mutation.direction {
        WalletDirection::Credit => checked_add(wallet.lifetime_earnings, mutation.amount)?,
        WalletDirection::Debit => wallet.lifetime_earnings,
    };

    let wallet = sqlx::query_as::<_, Wallet>(
        r#"
        UPDATE wallets
        SET available_balance = $2, lifetime_earnings = $3, updated_at = $4
        WHERE user_id = $1
        RETURNING *
        "#,
    )
    .bind(&mutation.user_id)
    .bind(new_balance)
    .bind(lifetime)
    .bind(at)
    .fetch_one(&mut *conn)
    .await?;

    let entry = sqlx::query_as::<_, WalletLedgerEntry>(
        r#"
        INSERT INTO wallet_ledger_entries (
            id, user_id, reference_type, reference_id, delta, balance_after, reason, created_at
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        RETURNING *
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(&mutation.user_id)
    .bind(&mutation.reference_type)
    .bind(&mutation.reference_id)
    .bind(mutation.delta())
    .bind(wallet.available_balance)
    .bind(&mutation.reason)
    .bind(at)
    .fetch_one(&mut *conn)
    .await?;

    Ok((wallet, entry))
}

#[async_trait]
impl LedgerStore for Database {
    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn find_event_by_external_id(
        &self,
        external_transaction_id: &str,
    ) -> Result<Option<RevenueEvent>, StoreError> {
        let event = sqlx::query_as::<_, RevenueEvent>(
            "SELECT * FROM revenue_events WHERE external_transaction_id = $1 AND status <> 'duplicate'",
        )
        .bind(external_transaction_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(event)
    }

    async fn user_activity(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
        sample_size: i64,
    ) -> Result<UserActivity, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE created_at >= $2) AS last_hour,
                COUNT(*) FILTER (WHERE created_at >= $3) AS last_day,
                COUNT(*) FILTER (WHERE status = 'failed' AND cardinality(risk_flags) > 0) AS fraud_rejections
            FROM revenue_events
            WHERE user_id = $1 AND status <> 'duplicate'
            "#,
        )
        .bind(user_id)
        .bind(now - ChronoDuration::hours(1))
        .bind(now - ChronoDuration::hours(24))
        .fetch_one(&self.pool)
        .await?;

        let recent_event_times: Vec<DateTime<Utc>> = sqlx::query_scalar(
            r#"
            SELECT created_at FROM revenue_events
            WHERE user_id = $1 AND status <> 'duplicate'
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(user_id)
        .bind(sample_size)
        .fetch_all(&self.pool)
        .await?;

        Ok(UserActivity {
            events_last_hour: row.get("last_hour"),
            events_last_day: row.get("last_day"),
            recent_event_times,
            prior_fraud_rejections: row.get("fraud_rejections"),
        })
    }

    async fn record_terminal(&self, event: &RevenueEvent) -> Result<RevenueEvent, StoreError> {
        let mut conn = self.pool.acquire().await?;
        if !insert_event(&mut conn, event).await? {
            return Err(StoreError::DuplicateTransaction(
                event.external_transaction_id.clone(),
            ));
        }
        Ok(event.clone())
    }

    async fn commit_settlement(
        &self,
        event: &RevenueEvent,
        credit: &WalletMutation,
        completed_at: DateTime<Utc>,
    ) -> Result<CommitReceipt, StoreError> {
        let mut tx = self.pool.begin().await?;

        let mut pending = event.clone();
        pending.status = RevenueStatus::Pending.as_str().to_string();
        pending.processed_at = None;

        if !insert_event(&mut tx, &pending).await? {
            // Dropping `tx` rolls back.
            return Err(StoreError::DuplicateTransaction(
                event.external_transaction_id.clone(),
            ));
        }

        let (wallet, ledger_entry) = mutate_wallet(&mut tx, credit, completed_at).await?;

        let completed = sqlx::query_as::<_, RevenueEvent>(
            r#"
            UPDATE revenue_events
            SET status = 'completed', processed_at = $2
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(event.id)
        .bind(completed_at)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

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
        let mut tx = self.pool.begin().await?;
        let (_, entry) = mutate_wallet(&mut tx, mutation, Utc::now()).await?;
        tx.commit().await?;
        Ok(entry)
    }

    async fn get_wallet(&self, user_id: &str) -> Result<Option<Wallet>, StoreError> {
        let wallet = sqlx::query_as::<_, Wallet>("SELECT * FROM wallets WHERE user_id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(wallet)
    }

    async fn wallet_ledger(
        &self,
        user_id: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<WalletLedgerEntry>, StoreError> {
        let entries = sqlx::query_as::<_, WalletLedgerEntry>(
            r#"
            SELECT * FROM wallet_ledger_entries
            WHERE user_id = $1
            ORDER BY created_at DESC
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(user_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        Ok(entries)
    }

    async fn wallet_user_ids(&self, limit: i64, offset: i64) -> Result<Vec<String>, StoreError> {
        let ids = sqlx::query_scalar("SELECT user_id FROM wallets ORDER BY user_id LIMIT $1 OFFSET $2")
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await?;

        Ok(ids)
    }

    async fn reconcile_wallet(&self, user_id: &str) -> Result<ReconciliationReport, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT
                w.available_balance - w.initial_balance AS expected_delta,
                COALESCE(SUM(l.delta), 0)::BIGINT AS ledger_sum,
                COUNT(l.id) AS entries
            FROM wallets w
            LEFT JOIN wallet_ledger_entries l ON l.user_id = w.user_id
            WHERE w.user_id = $1
            GROUP BY w.user_id, w.available_balance, w.initial_balance
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("wallet {}", user_id)))?;

        let expected_delta: i64 = row.get("expected_delta");
        let ledger_sum: i64 = row.get("ledger_sum");

        Ok(ReconciliationReport {
            user_id: user_id.to_string(),
            expected_delta,
            ledger_sum,
            discrepancy: expected_delta - ledger_sum,
            entries: row.get("entries"),
        })
    }

    async fn completed_events_for_user(
        &self,
        user_id: &str,
        limit: i64,
    ) -> Result<Vec<RevenueEvent>, StoreError> {
        let events = sqlx::query_as::<_, RevenueEvent>(
            r#"
            SELECT * FROM revenue_events
            WHERE user_id = $1 AND status = 'completed'
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(events)
    }

    async fn provider_activity(
        &self,
        provider_id: &str,
        recent_since: DateTime<Utc>,
        window_since: DateTime<Utc>,
    ) -> Result<ProviderActivity, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE created_at >= $2) AS recent_count,
                COUNT(*) FILTER (WHERE created_at >= $3) AS window_total,
                COUNT(*) FILTER (WHERE created_at >= $3 AND status = 'completed') AS window_completed,
                COUNT(*) FILTER (WHERE status = 'completed') AS total_completions,
                MAX(created_at) AS last_event_at
            FROM revenue_events
            WHERE provider_id = $1 AND status <> 'duplicate'
            "#,
        )
        .bind(provider_id)
        .bind(recent_since)
        .bind(window_since)
        .fetch_one(&self.pool)
        .await?;

        Ok(ProviderActivity {
            recent_count: row.get("recent_count"),
            window_total: row.get("window_total"),
            window_completed: row.get("window_completed"),
            last_event_at: row.get("last_event_at"),
            total_completions: row.get("total_completions"),
        })
    }

    async fn provider_stats(
        &self,
        provider_id: &str,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<ProviderStats, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) AS total_events,
                COUNT(*) FILTER (WHERE status = 'completed') AS completed,
                COUNT(*) FILTER (WHERE status = 'failed') AS failed,
                COUNT(*) FILTER (WHERE status = 'duplicate') AS duplicate,
                COALESCE(SUM(converted_amount) FILTER (WHERE status = 'completed'), 0)::BIGINT AS total_converted,
                COALESCE(SUM(commission_amount) FILTER (WHERE status = 'completed'), 0)::BIGINT AS total_commission,
                COALESCE(SUM(user_earnings) FILTER (WHERE status = 'completed'), 0)::BIGINT AS total_user_earnings
            FROM revenue_events
            WHERE provider_id = $1
              AND ($2::timestamptz IS NULL OR created_at >= $2)
              AND ($3::timestamptz IS NULL OR created_at <= $3)
            "#,
        )
        .bind(provider_id)
        .bind(from)
        .bind(to)
        .fetch_one(&self.pool)
        .await?;

        Ok(ProviderStats {
            provider_id: provider_id.to_string(),
            total_events: row.get("total_events"),
            completed: row.get("completed"),
            failed: row.get("failed"),
            duplicate: row.get("duplicate"),
            total_converted: row.get("total_converted"),
            total_commission: row.get("total_commission"),
            total_user_earnings: row.get("total_user_earnings"),
        })
    }

    async fn save_rates(&self, rates: &[ExchangeRate]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for rate in rates {
            sqlx::query(
                r#"
                INSERT INTO exchange_rates (
                    id, from_currency, to_currency, rate, source, is_fluctuation, previous_rate, observed_at
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                "#,
            )
            .bind(rate.id)
            .bind(&rate.from_currency)
            .bind(&rate.to_currency)
            .bind(rate.rate)
            .bind(&rate.source)
            .bind(rate.is_fluctuation)
            .bind(rate.previous_rate)
            .bind(rate.observed_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn latest_rates(&self, to_currency: &str) -> Result<Vec<ExchangeRate>, StoreError> {
        let rates = sqlx::query_as::<_, ExchangeRate>(
            r#"
            SELECT DISTINCT ON (from_currency) *
            FROM exchange_rates
            WHERE to_currency = $1
            ORDER BY from_currency, observed_at DESC
            "#,
        )
        .bind(to_currency)
        .fetch_all(&self.pool)
        .await?;

        Ok(rates)
    }

    async fn rate_history(
        &self,
        from_currency: &str,
        to_currency: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<ExchangeRate>, StoreError> {
        let rates = sqlx::query_as::<_, ExchangeRate>(
            r#"
            SELECT * FROM exchange_rates
            WHERE from_currency = $1 AND to_currency = $2 AND observed_at >= $3
            ORDER BY observed_at DESC
            "#,
        )
        .bind(from_currency)
        .bind(to_currency)
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        Ok(rates)
    }

    async fn prune_rates(&self, observed_before: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM exchange_rates WHERE observed_at < $1")
            .bind(observed_before)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    async fn record_postback_log(&self, log: &NewPostbackLog) -> Result<i64, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO postback_logs (
                provider_id, external_transaction_id, user_id, request_data,
                ip_address, user_agent, outcome, http_status, processing_ms
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING id
            "#,
        )
        .bind(&log.provider_id)
        .bind(&log.external_transaction_id)
        .bind(&log.user_id)
        .bind(&log.request_data)
        .bind(&log.ip_address)
        .bind(&log.user_agent)
        .bind(&log.outcome)
        .bind(log.http_status)
        .bind(log.processing_ms)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.get("id"))
    }
}

#[async_trait]
impl ProviderRegistry for Database {
    async fn get_provider(&self, provider_id: &str) -> Result<Option<Provider>, StoreError> {
        let provider = sqlx::query_as::<_, Provider>("SELECT * FROM providers WHERE provider_id = $1")
            .bind(provider_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(provider)
    }

    async fn list_providers(
        &self,
        status: Option<ProviderStatus>,
    ) -> Result<Vec<Provider>, StoreError> {
        let providers = sqlx::query_as::<_, Provider>(
            r#"
            SELECT * FROM providers
            WHERE ($1::text IS NULL OR status = $1)
            ORDER BY provider_id
            "#,
        )
        .bind(status.map(|s| s.as_str()))
        .fetch_all(&self.pool)
        .await?;

        Ok(providers)
    }

    async fn upsert_provider(&self, provider: &Provider) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO providers (
                provider_id, name, category, api_key, api_secret, status, commission_rate,
                supported_currencies, verification_method, ip_allowlist, success_token,
                created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $12)
            ON CONFLICT (provider_id)
            DO UPDATE SET
                name = EXCLUDED.name,
                category = EXCLUDED.category,
                api_key = EXCLUDED.api_key,
                api_secret = EXCLUDED.api_secret,
                commission_rate = EXCLUDED.commission_rate,
                supported_currencies = EXCLUDED.supported_currencies,
                verification_method = EXCLUDED.verification_method,
                ip_allowlist = EXCLUDED.ip_allowlist,
                success_token = EXCLUDED.success_token,
                updated_at = NOW()
            "#,
        )
        .bind(&provider.provider_id)
        .bind(&provider.name)
        .bind(&provider.category)
        .bind(&provider.api_key)
        .bind(&provider.api_secret)
        .bind(&provider.status)
        .bind(provider.commission_rate)
        .bind(&provider.supported_currencies)
        .bind(&provider.verification_method)
        .bind(&provider.ip_allowlist)
        .bind(&provider.success_token)
        .bind(provider.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn update_provider_health(
        &self,
        provider_id: &str,
        metrics: &ProviderHealthMetrics,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE providers
            SET recent_transaction_count = $2,
                success_rate = $3,
                last_transaction_at = $4,
                updated_at = NOW()
            WHERE provider_id = $1
            "#,
        )
        .bind(provider_id)
        .bind(metrics.recent_transaction_count)
        .bind(metrics.success_rate)
        .bind(metrics.last_transaction_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn set_provider_status(
        &self,
        provider_id: &str,
        status: ProviderStatus,
        reason: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<Provider, StoreError> {
        let disabled = status == ProviderStatus::Disabled;
        let provider = sqlx::query_as::<_, Provider>(
            r#"
            UPDATE providers
            SET status = $2,
                disabled_reason = $3,
                disabled_at = $4,
                updated_at = $5
            WHERE provider_id = $1
            RETURNING *
            "#,
        )
        .bind(provider_id)
        .bind(status.as_str())
        .bind(if disabled { reason } else { None })
        .bind(if disabled { Some(at) } else { None })
        .bind(at)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("provider {}", provider_id)))?;

        Ok(provider)
    }
}

#[async_trait]
impl AlertSink for Database {
    async fn create_alert(&self, alert: &AlertEvent) -> Result<i64, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO alerts (alert_type, severity, title, message, details)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id
            "#,
        )
        .bind(&alert.alert_type)
        .bind(alert.severity.as_str())
        .bind(&alert.title)
        .bind(&alert.message)
        .bind(&alert.metadata)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.get("id"))
    }

    async fn active_alerts(&self, limit: i64) -> Result<Vec<Alert>, StoreError> {
        let alerts = sqlx::query_as::<_, Alert>(
            r#"
            SELECT * FROM alerts
            WHERE status = 'active'
            ORDER BY created_at DESC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(alerts)
    }

    async fn acknowledge_alert(&self, alert_id: i64) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE alerts
            SET status = 'acknowledged', acknowledged_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(alert_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("alert {}", alert_id)));
        }
        Ok(())
    }

    async fn resolve_alert(&self, alert_id: i64) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE alerts
            SET status = 'resolved', resolved_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(alert_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("alert {}", alert_id)));
        }
        Ok(())
    }
}

#[async_trait]
impl UserDirectory for Database {
    async fn user_exists(&self, user_id: &str) -> Result<bool, StoreError> {
        let exists: bool = sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM users WHERE id = $1)")
            .bind(user_id)
            .fetch_one(&self.pool)
            .await?;

        Ok(exists)
    }

    async fn risk_context(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<DirectoryRiskContext, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(DISTINCT device_id) AS devices,
                COUNT(DISTINCT ip_address) AS ips
            FROM user_devices
            WHERE user_id = $1 AND seen_at >= $2
            "#,
        )
        .bind(user_id)
        .bind(now - ChronoDuration::hours(24))
        .fetch_one(&self.pool)
        .await?;

        let max_accounts_per_device: i64 = sqlx::query_scalar(
            r#"
            SELECT COALESCE(MAX(shared), 0)::BIGINT FROM (
                SELECT COUNT(DISTINCT other.user_id) AS shared
                FROM user_devices mine
                JOIN user_devices other
                  ON other.device_id = mine.device_id AND other.user_id <> mine.user_id
                WHERE mine.user_id = $1 AND mine.device_id IS NOT NULL
                GROUP BY mine.device_id
            ) per_device
            "#,
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;

        let max_accounts_per_ip: i64 = sqlx::query_scalar(
            r#"
            SELECT COALESCE(MAX(shared), 0)::BIGINT FROM (
                SELECT COUNT(DISTINCT other.user_id) AS shared
                FROM user_devices mine
                JOIN user_devices other
                  ON other.ip_address = mine.ip_address AND other.user_id <> mine.user_id
                WHERE mine.user_id = $1 AND mine.ip_address IS NOT NULL
                GROUP BY mine.ip_address
            ) per_ip
            "#,
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;

        let duplicate_contact: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1
                FROM users me
                JOIN users other ON other.id <> me.id
                WHERE me.id = $1
                  AND (
                      (COALESCE(me.email, '') <> '' AND other.email = me.email)
                   OR (COALESCE(me.phone_number, '') <> '' AND other.phone_number = me.phone_number)
                   OR (COALESCE(me.bank_account_number, '') <> '' AND other.bank_account_number = me.bank_account_number)
                  )
            )
            "#,
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(DirectoryRiskContext {
            distinct_devices: row.get("devices"),
            distinct_ips: row.get("ips"),
            max_accounts_per_device,
            max_accounts_per_ip,
            duplicate_contact,
        })
    }
}
