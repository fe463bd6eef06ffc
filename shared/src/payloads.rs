//! Provider postback payload shapes.
//!
//! Every offer-wall network names its postback parameters differently. Each
//! known network gets its own payload struct and normalizer; anything else is
//! rejected rather than guessed at.

use std::collections::BTreeMap;
use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Flattened request parameters (query string merged with body).
pub type PostbackParams = BTreeMap<String, String>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PayloadError {
    #[error("Unknown provider: {0}")]
    UnknownProvider(String),
    #[error("Missing field: {0}")]
    MissingField(&'static str),
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    CpaGrip,
    OgAds,
    AdGateMedia,
    OfferToro,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::CpaGrip => "cpagrip",
            ProviderKind::OgAds => "ogads",
            ProviderKind::AdGateMedia => "adgatemedia",
            ProviderKind::OfferToro => "offertoro",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            ProviderKind::CpaGrip => "CPAGrip",
            ProviderKind::OgAds => "OGAds",
            ProviderKind::AdGateMedia => "AdGate Media",
            ProviderKind::OfferToro => "OfferToro",
        }
    }
}

impl FromStr for ProviderKind {
    type Err = PayloadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cpagrip" => Ok(ProviderKind::CpaGrip),
            "ogads" => Ok(ProviderKind::OgAds),
            "adgatemedia" => Ok(ProviderKind::AdGateMedia),
            "offertoro" => Ok(ProviderKind::OfferToro),
            other => Err(PayloadError::UnknownProvider(other.to_string())),
        }
    }
}

/// `?user_id=..&transaction_id=..&amount=1.50&currency=USD&offer_name=..&signature=..`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CpaGripPostback {
    pub user_id: Option<String>,
    pub transaction_id: Option<String>,
    pub amount: Option<String>,
    pub currency: Option<String>,
    pub offer_name: Option<String>,
    pub category: Option<String>,
    pub signature: Option<String>,
    pub timestamp: Option<String>,
}

/// `?aff_sub=..&transaction_id=..&amount=..&offer_title=..&hash=..`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OgAdsPostback {
    pub aff_sub: Option<String>,
    pub transaction_id: Option<String>,
    pub amount: Option<String>,
    pub currency: Option<String>,
    pub offer_title: Option<String>,
    pub category: Option<String>,
    pub hash: Option<String>,
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AdGateMediaPostback {
    pub subid: Option<String>,
    pub id: Option<String>,
    pub point_value: Option<String>,
    pub currency: Option<String>,
    pub offer_name: Option<String>,
    pub category: Option<String>,
    pub signature: Option<String>,
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OfferToroPostback {
    pub oid: Option<String>,
    pub o_id: Option<String>,
    pub amount: Option<String>,
    pub currency: Option<String>,
    pub offer_name: Option<String>,
    pub category: Option<String>,
    pub sig: Option<String>,
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "provider", rename_all = "lowercase")]
pub enum ProviderPayload {
    CpaGrip(CpaGripPostback),
    OgAds(OgAdsPostback),
    AdGateMedia(AdGateMediaPostback),
    OfferToro(OfferToroPostback),
}

/// Provider-independent postback fields handed to settlement.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NormalizedPostback {
    pub provider_id: String,
    pub provider_name: String,
    pub user_id: String,
    pub external_transaction_id: String,
    pub amount: Decimal,
    /// Amount exactly as the provider sent it; signatures are computed over this.
    pub amount_raw: String,
    pub currency: String,
    pub offer_name: String,
    pub offer_category: String,
    pub signature: Option<String>,
    pub timestamp: Option<String>,
}

fn first(params: &PostbackParams, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|k| params.get(*k))
        .map(|v| v.trim())
        .find(|v| !v.is_empty())
        .map(str::to_string)
}

impl ProviderPayload {
    pub fn parse(kind: ProviderKind, params: &PostbackParams) -> Self {
        match kind {
            ProviderKind::CpaGrip => ProviderPayload::CpaGrip(CpaGripPostback {
                user_id: first(params, &["user_id", "subid"]),
                transaction_id: first(params, &["transaction_id", "txn_id"]),
                amount: first(params, &["amount", "payout"]),
                currency: first(params, &["currency"]),
                offer_name: first(params, &["offer_name", "offer"]),
                category: first(params, &["category"]),
                signature: first(params, &["signature", "hash"]),
                timestamp: first(params, &["timestamp"]),
            }),
            ProviderKind::OgAds => ProviderPayload::OgAds(OgAdsPostback {
                aff_sub: first(params, &["aff_sub", "subid"]),
                transaction_id: first(params, &["transaction_id", "txid"]),
                amount: first(params, &["amount", "payout"]),
                currency: first(params, &["currency"]),
                offer_title: first(params, &["offer_title", "offer_name"]),
                category: first(params, &["category"]),
                hash: first(params, &["hash", "security_hash"]),
                timestamp: first(params, &["timestamp"]),
            }),
            ProviderKind::AdGateMedia => ProviderPayload::AdGateMedia(AdGateMediaPostback {
                subid: first(params, &["subid", "user_id"]),
                id: first(params, &["id", "transaction_id"]),
                point_value: first(params, &["point_value", "amount"]),
                currency: first(params, &["currency"]),
                offer_name: first(params, &["offer_name", "name"]),
                category: first(params, &["category"]),
                signature: first(params, &["signature"]),
                timestamp: first(params, &["timestamp"]),
            }),
            ProviderKind::OfferToro => ProviderPayload::OfferToro(OfferToroPostback {
                oid: first(params, &["oid", "user_id"]),
                o_id: first(params, &["o_id", "transaction_id"]),
                amount: first(params, &["amount", "payout"]),
                currency: first(params, &["currency"]),
                offer_name: first(params, &["offer_name", "offer_title"]),
                category: first(params, &["category"]),
                sig: first(params, &["sig", "signature"]),
                timestamp: first(params, &["timestamp"]),
            }),
        }
    }

    pub fn kind(&self) -> ProviderKind {
        match self {
            ProviderPayload::CpaGrip(_) => ProviderKind::CpaGrip,
            ProviderPayload::OgAds(_) => ProviderKind::OgAds,
            ProviderPayload::AdGateMedia(_) => ProviderKind::AdGateMedia,
            ProviderPayload::OfferToro(_) => ProviderKind::OfferToro,
        }
    }

    pub fn normalize(&self) -> Result<NormalizedPostback, PayloadError> {
        match self {
            ProviderPayload::CpaGrip(p) => build(
                self.kind(),
                p.user_id.as_ref(),
                p.transaction_id.as_ref(),
                p.amount.as_ref(),
                p.currency.as_ref(),
                p.offer_name.as_ref(),
                p.category.as_ref(),
                p.signature.as_ref(),
                p.timestamp.as_ref(),
            ),
            ProviderPayload::OgAds(p) => build(
                self.kind(),
                p.aff_sub.as_ref(),
                p.transaction_id.as_ref(),
                p.amount.as_ref(),
                p.currency.as_ref(),
                p.offer_title.as_ref(),
                p.category.as_ref(),
                p.hash.as_ref(),
                p.timestamp.as_ref(),
            ),
            ProviderPayload::AdGateMedia(p) => build(
                self.kind(),
                p.subid.as_ref(),
                p.id.as_ref(),
                p.point_value.as_ref(),
                p.currency.as_ref(),
                p.offer_name.as_ref(),
                p.category.as_ref(),
                p.signature.as_ref(),
                p.timestamp.as_ref(),
            ),
            ProviderPayload::OfferToro(p) => build(
                self.kind(),
                p.oid.as_ref(),
                p.o_id.as_ref(),
                p.amount.as_ref(),
                p.currency.as_ref(),
                p.offer_name.as_ref(),
                p.category.as_ref(),
                p.sig.as_ref(),
                p.timestamp.as_ref(),
            ),
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn build(
    kind: ProviderKind,
    user_id: Option<&String>,
    transaction_id: Option<&String>,
    amount: Option<&String>,
    currency: Option<&String>,
    offer_name: Option<&String>,
    category: Option<&String>,
    signature: Option<&String>,
    timestamp: Option<&String>,
) -> Result<NormalizedPostback, PayloadError> {
    let user_id = user_id.ok_or(PayloadError::MissingField("user_id"))?;
    let transaction_id = transaction_id.ok_or(PayloadError::MissingField("transaction_id"))?;
    let amount_raw = amount.ok_or(PayloadError::MissingField("amount"))?;
    let amount = Decimal::from_str(amount_raw)
        .map_err(|_| PayloadError::InvalidAmount(amount_raw.clone()))?;

    Ok(NormalizedPostback {
        provider_id: kind.as_str().to_string(),
        provider_name: kind.display_name().to_string(),
        user_id: user_id.clone(),
        external_transaction_id: transaction_id.clone(),
        amount,
        amount_raw: amount_raw.clone(),
        currency: currency.cloned().unwrap_or_else(|| "USD".to_string()),
        offer_name: offer_name.cloned().unwrap_or_else(|| "Unknown offer".to_string()),
        offer_category: category.cloned().unwrap_or_else(|| "general".to_string()),
        signature: signature.cloned(),
        timestamp: timestamp.cloned(),
    })
}
