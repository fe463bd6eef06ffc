//! Shared fixtures: an in-memory app with four providers, two users and a
//! USD/NGN rate of 1500.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use rust_decimal::Decimal;
use shared::{NormalizedPostback, Provider, VerificationMethod, VerificationStatus};
use tokio::sync::mpsc::Receiver;

use crate::alerts::{AlertEvent, AlertPublisher};
use crate::clock::ManualClock;
use crate::config::Config;
use crate::memory_store::MemoryStore;
use crate::services::exchange_rate::{MockRateSource, RateError, RateQuote, RateSource};
use crate::services::verification::VerificationOutcome;
use crate::services::{AppState, SettlementError, SettlementRequest, Stores};
use crate::store::{CommitReceipt, ProviderRegistry};

pub const SECRET: &str = "test-secret";

pub struct TestHarness {
    pub store: Arc<MemoryStore>,
    pub clock: Arc<ManualClock>,
    pub state: AppState,
    pub alert_rx: Receiver<AlertEvent>,
}

impl TestHarness {
    pub async fn new() -> Self {
        Self::with_config(Config::default()).await
    }

    pub async fn with_config(config: Config) -> Self {
        let mut source = MockRateSource::new();
        source.expect_fetch().returning(|| Ok(usd_quote("1500")));
        Self::build(Arc::new(source), config, true).await
    }

    /// `source` must answer the warm-up fetch made here.
    pub async fn with_rate_source(source: MockRateSource) -> Self {
        Self::build(Arc::new(source), Config::default(), true).await
    }

    pub async fn with_source_and_config(source: Arc<dyn RateSource>, config: Config) -> Self {
        Self::build(source, config, true).await
    }

    pub async fn with_failing_rate_source() -> Self {
        let mut source = MockRateSource::new();
        source
            .expect_fetch()
            .returning(|| Err(RateError::Source("rate source offline".to_string())));
        Self::build(Arc::new(source), Config::default(), false).await
    }

    async fn build(source: Arc<dyn RateSource>, config: Config, warm: bool) -> Self {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(start_time()));
        let (alerts, alert_rx) = AlertPublisher::channel(256);

        for provider in [
            provider("cpagrip", "signature"),
            provider("ogads", "hash"),
            provider("adgatemedia", "none"),
            provider("offertoro", "shared_secret"),
        ] {
            store.upsert_provider(&provider).await.unwrap();
        }
        store.seed_user("U1", Some("u1@example.com"), Some("+2348000000001"), None);
        store.seed_user("U2", Some("u2@example.com"), Some("+2348000000002"), None);

        let state = AppState::new(
            config,
            Stores::memory(store.clone()),
            source,
            alerts,
            clock.clone(),
        );
        if warm {
            state.rates.refresh().await.unwrap();
        }

        Self {
            store,
            clock,
            state,
            alert_rx,
        }
    }

    pub async fn settle(
        &self,
        postback: NormalizedPostback,
    ) -> Result<CommitReceipt, SettlementError> {
        let provider = self
            .state
            .provider(&postback.provider_id)
            .await
            .unwrap()
            .unwrap();
        let request = SettlementRequest {
            postback,
            verification: VerificationOutcome {
                method: VerificationMethod::Signature,
                status: VerificationStatus::Verified,
            },
            raw_payload: serde_json::json!({}),
            ip_address: Some("203.0.113.10".to_string()),
            user_agent: Some("test".to_string()),
        };
        self.state.settlement.settle(&provider, &request).await
    }

    /// Waits briefly for an alert of `alert_type`, skipping others.
    pub async fn wait_for_alert(&mut self, alert_type: &str) -> Option<AlertEvent> {
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(2);
        loop {
            match tokio::time::timeout_at(deadline, self.alert_rx.recv()).await {
                Ok(Some(alert)) if alert.alert_type == alert_type => return Some(alert),
                Ok(Some(_)) => continue,
                Ok(None) | Err(_) => return None,
            }
        }
    }

    pub fn drain_alerts(&mut self) -> Vec<AlertEvent> {
        let mut alerts = Vec::new();
        while let Ok(alert) = self.alert_rx.try_recv() {
            alerts.push(alert);
        }
        alerts
    }
}

/// Answers the first `good` fetches with [`usd_quote`], then never answers.
pub struct StallingRateSource {
    good: usize,
    calls: AtomicUsize,
}

impl StallingRateSource {
    pub fn new(good: usize) -> Self {
        Self {
            good,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RateSource for StallingRateSource {
    async fn fetch(&self) -> Result<RateQuote, RateError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) < self.good {
            return Ok(usd_quote("1500"));
        }
        tokio::time::sleep(std::time::Duration::from_secs(30)).await;
        Err(RateError::Timeout)
    }
}

pub fn start_time() -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
}

pub fn usd_quote(ngn: &str) -> RateQuote {
    RateQuote {
        base: "USD".to_string(),
        rates: HashMap::from([
            ("NGN".to_string(), Decimal::from_str(ngn).unwrap()),
            ("EUR".to_string(), Decimal::from_str("0.9").unwrap()),
            ("GBP".to_string(), Decimal::from_str("0.75").unwrap()),
        ]),
        source: "test".to_string(),
    }
}

pub fn provider(provider_id: &str, method: &str) -> Provider {
    let kind: shared::ProviderKind = provider_id.parse().unwrap();
    Provider {
        provider_id: provider_id.to_string(),
        name: kind.display_name().to_string(),
        category: "offer_wall".to_string(),
        api_key: None,
        api_secret: Some(SECRET.to_string()),
        status: "active".to_string(),
        commission_rate: Decimal::new(20, 2),
        supported_currencies: vec!["USD".to_string(), "EUR".to_string(), "GBP".to_string()],
        verification_method: method.to_string(),
        ip_allowlist: vec![],
        success_token: "1".to_string(),
        recent_transaction_count: 0,
        success_rate: 0.0,
        last_transaction_at: None,
        disabled_reason: None,
        disabled_at: None,
        created_at: start_time() - chrono::Duration::days(30),
        updated_at: start_time(),
    }
}

/// A cpagrip postback.
pub fn postback(user_id: &str, transaction_id: &str, amount: &str, currency: &str) -> NormalizedPostback {
    NormalizedPostback {
        provider_id: "cpagrip".to_string(),
        provider_name: "CPAGrip".to_string(),
        user_id: user_id.to_string(),
        external_transaction_id: transaction_id.to_string(),
        amount: Decimal::from_str(amount).unwrap(),
        amount_raw: amount.to_string(),
        currency: currency.to_string(),
        offer_name: "Install App".to_string(),
        offer_category: "general".to_string(),
        signature: None,
        timestamp: None,
    }
}
