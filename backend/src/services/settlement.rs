//! One postback, one atomic settlement unit.
//!
//! Order: duplicate lookup, validate, risk screen, convert, split, then a single store call that inserts the event, credits the wallet
//! with its ledger entry and marks the event completed. Alerts are published
//! only after that call has returned.

use std::sync::Arc;

use rust_decimal::Decimal;
use shared::{
    normalize_currency, split_commission, validate_amount, validate_commission_rate,
    AlertSeverity, NormalizedPostback, Provider, RevenueEvent, RevenueStatus, WalletMutation,
};
use sqlx::types::JsonValue;
use uuid::Uuid;

use crate::alerts::AlertPublisher;
use crate::clock::Clock;
use crate::config::SettlementConfig;
use crate::monitoring::metrics;
use crate::services::exchange_rate::{ExchangeRateCache, RateError};
use crate::services::fraud_screen::{FraudScreen, FLAG_DUPLICATE};
use crate::services::verification::VerificationOutcome;
use crate::store::{CommitReceipt, LedgerStore, StoreError, UserDirectory};

pub const REFERENCE_TYPE: &str = "revenue_event";

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum SettlementError {
    #[error("Duplicate transaction: {0}")]
    DuplicateTransaction(String),
    #[error("Rejected by fraud screen (score {score}): {}", .flags.join(", "))]
    FraudRejected { score: u32, flags: Vec<String> },
    #[error("Exchange rate unavailable: {0}")]
    RateUnavailable(String),
    #[error("Wallet credit failed: {0}")]
    WalletCreditFailed(String),
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl SettlementError {
    /// The provider should retry. Everything else is terminal for the
    /// transaction id.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SettlementError::RateUnavailable(_) | SettlementError::Internal(_))
    }
}

impl From<StoreError> for SettlementError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::DuplicateTransaction(id) => SettlementError::DuplicateTransaction(id),
            other => SettlementError::Internal(other.to_string()),
        }
    }
}

/// A verified, normalized postback ready for settlement.
#[derive(Debug, Clone)]
pub struct SettlementRequest {
    pub postback: NormalizedPostback,
    pub verification: VerificationOutcome,
    pub raw_payload: JsonValue,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

pub struct SettlementEngine {
    config: SettlementConfig,
    ledger: Arc<dyn LedgerStore>,
    directory: Arc<dyn UserDirectory>,
    screen: FraudScreen,
    rates: Arc<ExchangeRateCache>,
    alerts: AlertPublisher,
    clock: Arc<dyn Clock>,
}

impl SettlementEngine {
    pub fn new(
        config: SettlementConfig,
        ledger: Arc<dyn LedgerStore>,
        directory: Arc<dyn UserDirectory>,
        screen: FraudScreen,
        rates: Arc<ExchangeRateCache>,
        alerts: AlertPublisher,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            ledger,
            directory,
            screen,
            rates,
            alerts,
            clock,
        }
    }

    pub async fn settle(
        &self,
        provider: &Provider,
        request: &SettlementRequest,
    ) -> Result<CommitReceipt, SettlementError> {
        let mut event = self.candidate(provider, request);
        let postback = &request.postback;

        // A settled transaction id is a duplicate whatever the resubmission carries.
        if let Some(existing) = self
            .screen
            .duplicate_of(&postback.external_transaction_id)
            .await?
        {
            if postback.amount >= Decimal::ZERO {
                self.record_duplicate(&mut event, &format!("duplicate of event {}", existing))
                    .await;
            }
            return Err(SettlementError::DuplicateTransaction(
                postback.external_transaction_id.clone(),
            ));
        }

        if let Err(reason) = self.validate(provider, postback).await? {
            // Negative amounts cannot be stored; the postback log keeps them.
            if postback.amount >= Decimal::ZERO {
                self.persist_failure(&mut event, RevenueStatus::Failed, &reason).await?;
            }
            return Err(SettlementError::InvalidPayload(reason));
        }
        event.original_currency = normalize_currency(&postback.currency)
            .map_err(|e| SettlementError::InvalidPayload(e.to_string()))?;

        let verdict = self
            .screen
            .assess(&postback.user_id, &postback.external_transaction_id)
            .await?;
        event.risk_score = verdict.risk_score as i32;
        event.risk_flags = verdict.flags.clone();

        if !verdict.allow {
            self.persist_failure(&mut event, RevenueStatus::Failed, "fraud_rejected")
                .await?;
            self.alerts.send_alert(
                "fraud_rejected",
                AlertSeverity::Warning,
                format!("Postback rejected for user {}", postback.user_id),
                format!(
                    "{} transaction {} scored {} ({})",
                    provider.name,
                    postback.external_transaction_id,
                    verdict.risk_score,
                    verdict.flags.join(", ")
                ),
                serde_json::json!({
                    "event_id": event.id,
                    "user_id": postback.user_id,
                    "provider_id": provider.provider_id,
                    "risk_score": verdict.risk_score,
                    "flags": verdict.flags,
                }),
            );
            return Err(SettlementError::FraudRejected {
                score: verdict.risk_score,
                flags: verdict.flags,
            });
        }

        let conversion = match self.rates.convert(postback.amount, &event.original_currency).await {
            Ok(conversion) => conversion,
            // Retryable: nothing is persisted so the retry is not a duplicate.
            Err(RateError::Unavailable { from, to }) => {
                return Err(SettlementError::RateUnavailable(format!("{} -> {}", from, to)))
            }
            Err(RateError::Ledger(e)) => {
                let reason = e.to_string();
                self.persist_failure(&mut event, RevenueStatus::Failed, &reason).await?;
                return Err(SettlementError::InvalidPayload(reason));
            }
            Err(e) => return Err(SettlementError::Internal(e.to_string())),
        };

        let commission_rate = self.commission_rate(provider);
        let split = split_commission(conversion.converted_amount, commission_rate)
            .map_err(|e| SettlementError::Internal(e.to_string()))?;

        event.converted_amount = split.converted_amount;
        event.commission_rate = commission_rate;
        event.commission_amount = split.commission_amount;
        event.user_earnings = split.user_earnings;

        if split.user_earnings <= 0 {
            let reason = format!(
                "amount {} {} settles to zero earnings",
                postback.amount_raw, event.original_currency
            );
            self.persist_failure(&mut event, RevenueStatus::Failed, &reason).await?;
            return Err(SettlementError::InvalidPayload(reason));
        }

        let credit = WalletMutation::credit(
            &postback.user_id,
            split.user_earnings,
            &format!("Offer wall: {} ({})", postback.offer_name, provider.name),
            REFERENCE_TYPE,
            &event.id.to_string(),
        );

        match self.ledger.commit_settlement(&event, &credit, self.clock.now()).await {
            Ok(receipt) => {
                metrics::record_wallet_credit(receipt.event.user_earnings);
                tracing::info!(
                    "Settled {} for user {}: converted={} commission={} earnings={} balance={}{}",
                    receipt.event.external_transaction_id,
                    receipt.event.user_id,
                    receipt.event.converted_amount,
                    receipt.event.commission_amount,
                    receipt.event.user_earnings,
                    receipt.wallet.available_balance,
                    if conversion.stale { " (stale rate)" } else { "" }
                );
                Ok(receipt)
            }
            Err(StoreError::DuplicateTransaction(_)) => {
                // Lost the race against a concurrent copy of this postback.
                event.id = Uuid::new_v4();
                self.record_duplicate(&mut event, "late duplicate detected at insert")
                    .await;
                Err(SettlementError::DuplicateTransaction(
                    postback.external_transaction_id.clone(),
                ))
            }
            Err(StoreError::Ledger(e)) => {
                let reason = e.to_string();
                tracing::error!(
                    "Wallet credit failed for {} (user {}): {}",
                    postback.external_transaction_id,
                    postback.user_id,
                    reason
                );
                self.persist_failure(&mut event, RevenueStatus::Failed, &reason).await?;
                self.alerts.send_alert(
                    "wallet_credit_failed",
                    AlertSeverity::Critical,
                    "Wallet Credit Failed",
                    format!(
                        "Credit of {} to {} for {} failed: {}",
                        split.user_earnings, postback.user_id, postback.external_transaction_id, reason
                    ),
                    serde_json::json!({
                        "event_id": event.id,
                        "user_id": postback.user_id,
                        "amount": split.user_earnings,
                        "error": reason,
                    }),
                );
                Err(SettlementError::WalletCreditFailed(reason))
            }
            Err(e) => Err(SettlementError::Internal(e.to_string())),
        }
    }

    fn candidate(&self, provider: &Provider, request: &SettlementRequest) -> RevenueEvent {
        let postback = &request.postback;
        RevenueEvent {
            id: Uuid::new_v4(),
            user_id: postback.user_id.clone(),
            provider_id: provider.provider_id.clone(),
            provider_name: provider.name.clone(),
            external_transaction_id: postback.external_transaction_id.clone(),
            offer_name: postback.offer_name.clone(),
            offer_category: postback.offer_category.clone(),
            original_amount: postback.amount,
            original_currency: postback.currency.trim().to_ascii_uppercase(),
            converted_amount: 0,
            commission_rate: self.commission_rate(provider),
            commission_amount: 0,
            user_earnings: 0,
            status: RevenueStatus::Pending.as_str().to_string(),
            verification_status: request.verification.status.as_str().to_string(),
            verification_method: Some(request.verification.method.as_str().to_string()),
            risk_score: 0,
            risk_flags: Vec::new(),
            postback_data: request.raw_payload.clone(),
            ip_address: request.ip_address.clone(),
            user_agent: request.user_agent.clone(),
            failure_reason: None,
            processed_at: None,
            created_at: self.clock.now(),
        }
    }

    /// `Ok(Err(reason))` is a payload problem; `Err` is a store failure.
    async fn validate(
        &self,
        provider: &Provider,
        postback: &NormalizedPostback,
    ) -> Result<Result<(), String>, SettlementError> {
        if let Err(e) = validate_amount(postback.amount) {
            return Ok(Err(e.to_string()));
        }
        let currency = match normalize_currency(&postback.currency) {
            Ok(c) => c,
            Err(e) => return Ok(Err(e.to_string())),
        };
        if !provider.supports_currency(&currency) {
            return Ok(Err(format!("{} does not settle in {}", provider.name, currency)));
        }
        if !self.directory.user_exists(&postback.user_id).await? {
            return Ok(Err(format!("unknown user {}", postback.user_id)));
        }
        Ok(Ok(()))
    }

    fn commission_rate(&self, provider: &Provider) -> Decimal {
        match validate_commission_rate(provider.commission_rate) {
            Ok(rate) => rate,
            Err(e) => {
                tracing::warn!(
                    "Provider {} has invalid commission rate ({}), using default {}",
                    provider.provider_id,
                    e,
                    self.config.default_commission_rate
                );
                self.config.default_commission_rate
            }
        }
    }

    /// Persists a terminal failure. A collision with an existing primary row
    /// turns the outcome into a duplicate; other store errors are logged and
    /// the rejection still goes out.
    async fn persist_failure(
        &self,
        event: &mut RevenueEvent,
        status: RevenueStatus,
        reason: &str,
    ) -> Result<(), SettlementError> {
        event.status = status.as_str().to_string();
        event.failure_reason = Some(reason.to_string());
        event.processed_at = Some(self.clock.now());

        match self.ledger.record_terminal(event).await {
            Ok(_) => Ok(()),
            Err(StoreError::DuplicateTransaction(id)) => {
                Err(SettlementError::DuplicateTransaction(id))
            }
            Err(e) => {
                tracing::error!(
                    "Failed to record {} event for {}: {}",
                    event.status,
                    event.external_transaction_id,
                    e
                );
                Ok(())
            }
        }
    }

    /// Audit copy of a rejected resubmission.
    async fn record_duplicate(&self, event: &mut RevenueEvent, reason: &str) {
        if !event.risk_flags.iter().any(|f| f == FLAG_DUPLICATE) {
            event.risk_flags.push(FLAG_DUPLICATE.to_string());
        }
        if let Err(e) = self
            .persist_failure(event, RevenueStatus::Duplicate, reason)
            .await
        {
            tracing::debug!("Duplicate audit row not recorded: {}", e);
        }
    }
}
