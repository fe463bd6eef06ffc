//! Provider-facing ingestion: rate limit, provider lookup, payload
//! normalization, authenticity check, settlement and the provider ack.

use std::net::IpAddr;
use std::time::Instant;

use rust_decimal::Decimal;
use serde::Serialize;
use shared::{
    NormalizedPostback, PostbackParams, Provider, ProviderKind, ProviderPayload,
    VerificationMethod, VerificationStatus,
};
use uuid::Uuid;

use crate::monitoring::metrics;
use crate::services::settlement::{SettlementError, SettlementRequest};
use crate::services::verification::{self, Credentials, VerificationOutcome};
use crate::services::AppState;
use crate::store::NewPostbackLog;

/// Seconds a provider is asked to wait before retrying a rate miss.
pub const RATE_RETRY_AFTER_SECS: u64 = 60;

const REDACTED_PARAMS: &[&str] = &["secret", "key", "api_key"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PostbackOutcome {
    Ack,
    Duplicate,
    Fraud,
    InvalidSignature,
    InvalidPayload,
    ProviderInactive,
    UnknownProvider,
    RateUnavailable,
    RateLimited,
    WalletCreditFailed,
    #[serde(rename = "internal_error")]
    Internal,
    Timeout,
}

impl PostbackOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            PostbackOutcome::Ack => "ack",
            PostbackOutcome::Duplicate => "duplicate",
            PostbackOutcome::Fraud => "fraud",
            PostbackOutcome::InvalidSignature => "invalid_signature",
            PostbackOutcome::InvalidPayload => "invalid_payload",
            PostbackOutcome::ProviderInactive => "provider_inactive",
            PostbackOutcome::UnknownProvider => "unknown_provider",
            PostbackOutcome::RateUnavailable => "rate_unavailable",
            PostbackOutcome::RateLimited => "rate_limited",
            PostbackOutcome::WalletCreditFailed => "wallet_credit_failed",
            PostbackOutcome::Internal => "internal_error",
            PostbackOutcome::Timeout => "timeout",
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            PostbackOutcome::Ack => 200,
            PostbackOutcome::InvalidPayload => 400,
            PostbackOutcome::InvalidSignature => 401,
            PostbackOutcome::Fraud | PostbackOutcome::ProviderInactive => 403,
            PostbackOutcome::UnknownProvider => 404,
            PostbackOutcome::Duplicate => 409,
            PostbackOutcome::WalletCreditFailed => 422,
            PostbackOutcome::RateUnavailable | PostbackOutcome::RateLimited => 429,
            PostbackOutcome::Internal | PostbackOutcome::Timeout => 503,
        }
    }
}

impl From<&SettlementError> for PostbackOutcome {
    fn from(e: &SettlementError) -> Self {
        match e {
            SettlementError::DuplicateTransaction(_) => PostbackOutcome::Duplicate,
            SettlementError::FraudRejected { .. } => PostbackOutcome::Fraud,
            SettlementError::RateUnavailable(_) => PostbackOutcome::RateUnavailable,
            SettlementError::WalletCreditFailed(_) => PostbackOutcome::WalletCreditFailed,
            SettlementError::InvalidPayload(_) => PostbackOutcome::InvalidPayload,
            SettlementError::Internal(_) => PostbackOutcome::Internal,
        }
    }
}

/// One raw postback as it reached the HTTP layer.
#[derive(Debug, Clone)]
pub struct InboundPostback {
    pub provider_id: String,
    pub params: PostbackParams,
    pub source_ip: Option<IpAddr>,
    pub user_agent: Option<String>,
    pub signature_header: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AckResponse {
    pub success: bool,
    pub outcome: PostbackOutcome,
    pub message: String,
    /// Provider success token, sent as the body of an ack.
    #[serde(skip)]
    pub token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_earnings: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

impl AckResponse {
    fn reject(outcome: PostbackOutcome, message: impl Into<String>) -> Self {
        let retry_after = match outcome {
            PostbackOutcome::RateUnavailable | PostbackOutcome::RateLimited => {
                Some(RATE_RETRY_AFTER_SECS)
            }
            _ => None,
        };
        Self {
            success: false,
            outcome,
            message: message.into(),
            token: None,
            event_id: None,
            user_earnings: None,
            retry_after,
        }
    }

    /// Retryable settlement failures carry a Retry-After hint.
    fn settlement_failed(e: &SettlementError) -> Self {
        let mut ack = Self::reject(PostbackOutcome::from(e), e.to_string());
        if e.is_retryable() {
            ack.retry_after.get_or_insert(RATE_RETRY_AFTER_SECS);
        }
        ack
    }

    pub fn http_status(&self) -> u16 {
        self.outcome.http_status()
    }
}

pub async fn handle_postback(state: &AppState, inbound: InboundPostback) -> AckResponse {
    let started = Instant::now();
    let mut normalized = None;
    let ack = process(state, &inbound, &mut normalized).await;

    let provider_label = if ack.outcome == PostbackOutcome::UnknownProvider {
        "unknown"
    } else {
        inbound.provider_id.as_str()
    };
    metrics::record_postback(provider_label, ack.outcome.as_str());

    let (tx_id, user_id) = match normalized.as_ref() {
        Some(p) => (p.external_transaction_id.as_str(), p.user_id.as_str()),
        None => ("-", "-"),
    };
    match ack.outcome {
        PostbackOutcome::Ack | PostbackOutcome::Duplicate => tracing::info!(
            "Postback {} from {} for user {}: {}",
            tx_id,
            inbound.provider_id,
            user_id,
            ack.outcome.as_str()
        ),
        PostbackOutcome::WalletCreditFailed | PostbackOutcome::Internal => tracing::error!(
            "Postback {} from {} for user {} failed: {}",
            tx_id,
            inbound.provider_id,
            user_id,
            ack.message
        ),
        _ => tracing::warn!(
            "Postback {} from {} for user {} rejected ({}): {}",
            tx_id,
            inbound.provider_id,
            user_id,
            ack.outcome.as_str(),
            ack.message
        ),
    }

    record_log(state, &inbound, normalized.as_ref(), &ack, started).await;
    ack
}

async fn process(
    state: &AppState,
    inbound: &InboundPostback,
    normalized: &mut Option<NormalizedPostback>,
) -> AckResponse {
    if let Some(ip) = inbound.source_ip {
        if state.postback_limiter.check_key(&ip).is_err() {
            return AckResponse::reject(PostbackOutcome::RateLimited, "Too many postbacks");
        }
    }

    let provider = match state.provider(&inbound.provider_id).await {
        Ok(Some(provider)) => provider,
        Ok(None) => {
            return AckResponse::reject(
                PostbackOutcome::UnknownProvider,
                format!("Unknown provider {}", inbound.provider_id),
            )
        }
        Err(e) => return AckResponse::reject(PostbackOutcome::Internal, e.to_string()),
    };

    if !provider.is_active() {
        return AckResponse::reject(
            PostbackOutcome::ProviderInactive,
            format!("Provider {} is {}", provider.provider_id, provider.status),
        );
    }

    let kind = match provider.provider_id.parse::<ProviderKind>() {
        Ok(kind) => kind,
        Err(e) => return AckResponse::reject(PostbackOutcome::InvalidPayload, e.to_string()),
    };
    let postback = match ProviderPayload::parse(kind, &inbound.params).normalize() {
        Ok(postback) => postback,
        Err(e) => return AckResponse::reject(PostbackOutcome::InvalidPayload, e.to_string()),
    };
    *normalized = Some(postback.clone());

    let credentials = Credentials {
        signature_header: inbound.signature_header.as_deref(),
        source_ip: inbound.source_ip,
    };
    let verification =
        match verification::verify(&provider, &postback, &inbound.params, &credentials) {
            Ok(outcome) => outcome,
            Err(e) => return AckResponse::reject(PostbackOutcome::InvalidSignature, e.to_string()),
        };

    let request = SettlementRequest {
        postback,
        verification,
        raw_payload: redacted(&inbound.params),
        ip_address: inbound.source_ip.map(|ip| ip.to_string()),
        user_agent: inbound.user_agent.clone(),
    };
    settle(state, &provider, &request).await
}

/// Runs settlement under the wall-clock budget. A timeout drops the unit,
/// which rolls it back, so the provider's retry is safe.
async fn settle(state: &AppState, provider: &Provider, request: &SettlementRequest) -> AckResponse {
    let budget = state.config.settlement.timeout;
    match tokio::time::timeout(budget, state.settlement.settle(provider, request)).await {
        Ok(Ok(receipt)) => AckResponse {
            success: true,
            outcome: PostbackOutcome::Ack,
            message: format!("Credited {} to {}", receipt.event.user_earnings, receipt.event.user_id),
            token: Some(provider.success_token.clone()),
            event_id: Some(receipt.event.id),
            user_earnings: Some(receipt.event.user_earnings),
            retry_after: None,
        },
        Ok(Err(e)) => AckResponse::settlement_failed(&e),
        Err(_) => AckResponse::reject(
            PostbackOutcome::Timeout,
            format!("Settlement exceeded {}ms", budget.as_millis()),
        ),
    }
}

/// Synthesises a postback with a generated transaction id and settles it.
/// Skips authenticity checks; the event is recorded `unverified`.
pub async fn run_test_postback(
    state: &AppState,
    provider_id: &str,
    user_id: &str,
    amount: Decimal,
    currency: &str,
) -> AckResponse {
    let provider = match state.provider(provider_id).await {
        Ok(Some(provider)) => provider,
        Ok(None) => {
            return AckResponse::reject(
                PostbackOutcome::UnknownProvider,
                format!("Unknown provider {}", provider_id),
            )
        }
        Err(e) => return AckResponse::reject(PostbackOutcome::Internal, e.to_string()),
    };

    let postback = NormalizedPostback {
        provider_id: provider.provider_id.clone(),
        provider_name: provider.name.clone(),
        user_id: user_id.to_string(),
        external_transaction_id: format!("test_{}", Uuid::new_v4().simple()),
        amount,
        amount_raw: amount.to_string(),
        currency: currency.to_string(),
        offer_name: "Test Offer".to_string(),
        offer_category: "test".to_string(),
        signature: None,
        timestamp: None,
    };
    let request = SettlementRequest {
        raw_payload: serde_json::json!({ "test": true, "transaction_id": postback.external_transaction_id }),
        postback,
        verification: VerificationOutcome {
            method: provider.verification().unwrap_or(VerificationMethod::None),
            status: VerificationStatus::Unverified,
        },
        ip_address: None,
        user_agent: Some("test-postback".to_string()),
    };

    let ack = settle(state, &provider, &request).await;
    tracing::info!(
        "Test postback {} for {} via {}: {}",
        request.postback.external_transaction_id,
        user_id,
        provider_id,
        ack.outcome.as_str()
    );
    ack
}

fn redacted(params: &PostbackParams) -> serde_json::Value {
    let map: serde_json::Map<String, serde_json::Value> = params
        .iter()
        .map(|(k, v)| {
            let value = if REDACTED_PARAMS.contains(&k.to_ascii_lowercase().as_str()) {
                "[redacted]".to_string()
            } else {
                v.clone()
            };
            (k.clone(), serde_json::Value::String(value))
        })
        .collect();
    serde_json::Value::Object(map)
}

async fn record_log(
    state: &AppState,
    inbound: &InboundPostback,
    normalized: Option<&NormalizedPostback>,
    ack: &AckResponse,
    started: Instant,
) {
    let log = NewPostbackLog {
        provider_id: inbound.provider_id.clone(),
        external_transaction_id: normalized.map(|p| p.external_transaction_id.clone()),
        user_id: normalized.map(|p| p.user_id.clone()),
        request_data: redacted(&inbound.params),
        ip_address: inbound.source_ip.map(|ip| ip.to_string()),
        user_agent: inbound.user_agent.clone(),
        outcome: ack.outcome.as_str().to_string(),
        http_status: i32::from(ack.http_status()),
        processing_ms: started.elapsed().as_millis() as i64,
    };
    if let Err(e) = state.stores.ledger.record_postback_log(&log).await {
        tracing::error!("Failed to record postback log for {}: {}", inbound.provider_id, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::verification::sign;
    use crate::test_support::{postback, TestHarness, SECRET};

    fn inbound(provider_id: &str, pairs: &[(&str, &str)]) -> InboundPostback {
        InboundPostback {
            provider_id: provider_id.to_string(),
            params: pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
            source_ip: Some("198.51.100.4".parse().unwrap()),
            user_agent: Some("provider-bot".to_string()),
            signature_header: None,
        }
    }

    fn signed_cpagrip(user: &str, tx: &str, amount: &str) -> InboundPostback {
        let signature = sign(&postback(user, tx, amount, "USD"), SECRET).unwrap();
        let mut request = inbound(
            "cpagrip",
            &[("user_id", user), ("transaction_id", tx), ("amount", amount), ("currency", "USD")],
        );
        request.signature_header = Some(signature);
        request
    }

    #[tokio::test]
    async fn signed_postback_is_acked_with_provider_token() {
        let h = TestHarness::new().await;
        let ack = handle_postback(&h.state, signed_cpagrip("U1", "tx-001", "2.00")).await;
        assert_eq!(ack.outcome, PostbackOutcome::Ack);
        assert_eq!(ack.token.as_deref(), Some("1"));
        assert_eq!(ack.user_earnings, Some(240_000));

        let again = handle_postback(&h.state, signed_cpagrip("U1", "tx-001", "2.00")).await;
        assert_eq!(again.outcome, PostbackOutcome::Duplicate);
        assert_eq!(again.http_status(), 409);
    }

    #[tokio::test]
    async fn bad_signature_never_reaches_settlement() {
        let h = TestHarness::new().await;
        let mut request = signed_cpagrip("U1", "tx-002", "2.00");
        request.signature_header = Some("00ff".to_string());

        let ack = handle_postback(&h.state, request).await;
        assert_eq!(ack.outcome, PostbackOutcome::InvalidSignature);
        assert!(h.store.events().is_empty());
        assert_eq!(h.store.postback_logs()[0].http_status, 401);
    }

    #[tokio::test]
    async fn shared_secret_is_redacted_from_logs() {
        let h = TestHarness::new().await;
        let request = inbound(
            "offertoro",
            &[("oid", "U2"), ("o_id", "ot-1"), ("amount", "1.00"), ("secret", SECRET)],
        );
        let ack = handle_postback(&h.state, request).await;
        assert_eq!(ack.outcome, PostbackOutcome::Ack);

        let logs = h.store.postback_logs();
        assert_eq!(logs[0].request_data["secret"], "[redacted]");
        assert_eq!(logs[0].external_transaction_id.as_deref(), Some("ot-1"));
        let event = &h.store.events()[0];
        assert_eq!(event.postback_data["secret"], "[redacted]");
    }

    #[tokio::test]
    async fn missing_fields_are_invalid_payload() {
        let h = TestHarness::new().await;
        let ack = handle_postback(&h.state, inbound("adgatemedia", &[("subid", "U1")])).await;
        assert_eq!(ack.outcome, PostbackOutcome::InvalidPayload);
        assert_eq!(ack.http_status(), 400);
    }

    #[tokio::test]
    async fn rate_miss_asks_provider_to_retry() {
        let h = TestHarness::with_failing_rate_source().await;
        let ack = handle_postback(
            &h.state,
            inbound("adgatemedia", &[("subid", "U1"), ("id", "ag-1"), ("point_value", "1.00")]),
        )
        .await;
        assert_eq!(ack.outcome, PostbackOutcome::RateUnavailable);
        assert_eq!(ack.retry_after, Some(RATE_RETRY_AFTER_SECS));

        // Nothing persisted, so the retry settles normally once rates return.
        assert!(h.store.events().is_empty());
    }

    #[tokio::test]
    async fn test_postback_settles_unverified() {
        let h = TestHarness::new().await;
        let ack = run_test_postback(&h.state, "ogads", "U2", Decimal::ONE, "USD").await;
        assert_eq!(ack.outcome, PostbackOutcome::Ack);
        let event = &h.store.events()[0];
        assert!(event.external_transaction_id.starts_with("test_"));
        assert_eq!(event.verification_status, "unverified");
        assert_eq!(event.user_earnings, 120_000);
    }

    #[test]
    fn outcomes_map_to_documented_statuses() {
        assert_eq!(PostbackOutcome::Ack.http_status(), 200);
        assert_eq!(PostbackOutcome::Fraud.http_status(), 403);
        assert_eq!(PostbackOutcome::ProviderInactive.http_status(), 403);
        assert_eq!(PostbackOutcome::WalletCreditFailed.http_status(), 422);
        assert_eq!(PostbackOutcome::RateLimited.http_status(), 429);
        assert_eq!(PostbackOutcome::Timeout.http_status(), 503);
        assert_eq!(
            PostbackOutcome::from(&SettlementError::FraudRejected { score: 70, flags: vec![] }),
            PostbackOutcome::Fraud
        );
    }

    #[test]
    fn retryable_settlement_failures_carry_retry_after() {
        let internal = AckResponse::settlement_failed(&SettlementError::Internal("pool".into()));
        assert_eq!(internal.http_status(), 503);
        assert_eq!(internal.retry_after, Some(RATE_RETRY_AFTER_SECS));

        let duplicate =
            AckResponse::settlement_failed(&SettlementError::DuplicateTransaction("tx".into()));
        assert_eq!(duplicate.http_status(), 409);
        assert_eq!(duplicate.retry_after, None);

        let fraud = AckResponse::settlement_failed(&SettlementError::FraudRejected {
            score: 70,
            flags: vec![],
        });
        assert_eq!(fraud.retry_after, None);
    }
}
