use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::{prelude::FromRow, types::JsonValue};
use uuid::Uuid;

#[derive(Debug , Clone , Serialize , Deserialize, FromRow )]
pub struct Provider{
  pub provider_id: String,
  pub name : String,
  pub category : String,
  #[serde(skip_serializing)]
  pub api_key : Option<String>,
  #[serde(skip_serializing)]
  pub api_secret : Option<String>,
  pub status : String,
  pub commission_rate : Decimal,
  pub supported_currencies : Vec<String>,
  pub verification_method : String,
  pub ip_allowlist : Vec<String>,
  pub success_token : String,
  pub recent_transaction_count : i64,
  pub success_rate : f64,
  pub last_transaction_at : Option<DateTime<Utc>>,
  pub disabled_reason : Option<String>,
  pub disabled_at : Option<DateTime<Utc>>,
  pub created_at : DateTime<Utc>,
  pub updated_at : DateTime<Utc>,
}

impl Provider {
  #[inline]
  pub fn status(&self) -> Option<ProviderStatus> {
    ProviderStatus::parse(&self.status)
  }
  #[inline]
  pub fn is_active(&self) -> bool {
    self.status() == Some(ProviderStatus::Active)
  }
  #[inline]
  pub fn verification(&self) -> Option<VerificationMethod> {
    VerificationMethod::parse(&self.verification_method)
  }
  /// Secret used for signatures, hashes and shared-secret checks.
  pub fn secret(&self) -> Option<&str> {
    self.api_secret.as_deref().or(self.api_key.as_deref()).filter(|s| !s.is_empty())
  }
  pub fn supports_currency(&self, currency: &str) -> bool {
    self.supported_currencies.is_empty()
      || self.supported_currencies.iter().any(|c| c.eq_ignore_ascii_case(currency))
  }
}

#[derive(Debug , Clone , Serialize , Deserialize , PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProviderStatus {
    Active,
    Inactive,
    Disabled,
}

impl ProviderStatus {
    pub fn as_str(&self) -> &'static str {
      match self {
          ProviderStatus::Active => "active",
          ProviderStatus::Inactive => "inactive",
          ProviderStatus::Disabled => "disabled",
      }
    }

    pub fn parse(value: &str) -> Option<Self> {
      match value {
          "active" => Some(ProviderStatus::Active),
          "inactive" => Some(ProviderStatus::Inactive),
          "disabled" => Some(ProviderStatus::Disabled),
          _ => None,
      }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum VerificationMethod {
    SharedSecret,
    Signature,
    Hash,
    IpAllowlist,
    None,
}

impl VerificationMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            VerificationMethod::SharedSecret => "shared_secret",
            VerificationMethod::Signature => "signature",
            VerificationMethod::Hash => "hash",
            VerificationMethod::IpAllowlist => "ip_allowlist",
            VerificationMethod::None => "none",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "shared_secret" => Some(VerificationMethod::SharedSecret),
            "signature" => Some(VerificationMethod::Signature),
            "hash" => Some(VerificationMethod::Hash),
            "ip_allowlist" => Some(VerificationMethod::IpAllowlist),
            "none" => Some(VerificationMethod::None),
            _ => None,
        }
    }
}

#[derive(Debug , Clone , Serialize , Deserialize , FromRow)]
pub struct RevenueEvent{
  pub id : Uuid,
  pub user_id: String,
  pub provider_id: String,
  pub provider_name: String,
  pub external_transaction_id: String,
  pub offer_name: String,
  pub offer_category: String,
  pub original_amount: Decimal,
  pub original_currency: String,
  pub converted_amount: i64,
  pub commission_rate: Decimal,
  pub commission_amount: i64,
  pub user_earnings: i64,
  pub status: String,
  pub verification_status: String,
  pub verification_method: Option<String>,
  pub risk_score: i32,
  pub risk_flags: Vec<String>,
  pub postback_data: JsonValue,
  pub ip_address: Option<String>,
  pub user_agent: Option<String>,
  pub failure_reason: Option<String>,
  pub processed_at: Option<DateTime<Utc>>,
  pub created_at :  DateTime<Utc>,
}

impl RevenueEvent {
  #[inline]
  pub fn is_terminal(&self) -> bool {
    RevenueStatus::parse(&self.status).map(|s| s.is_terminal()).unwrap_or(false)
  }
  #[inline]
  pub fn verify_split(&self) -> bool {
    self.commission_amount + self.user_earnings == self.converted_amount
  }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RevenueStatus {
    Pending,
    Completed,
    Failed,
    Duplicate,
}

impl RevenueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RevenueStatus::Pending => "pending",
            RevenueStatus::Completed => "completed",
            RevenueStatus::Failed => "failed",
            RevenueStatus::Duplicate => "duplicate",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(RevenueStatus::Pending),
            "completed" => Some(RevenueStatus::Completed),
            "failed" => Some(RevenueStatus::Failed),
            "duplicate" => Some(RevenueStatus::Duplicate),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RevenueStatus::Pending)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum VerificationStatus {
    Verified,
    Unverified,
    Failed,
}

impl VerificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VerificationStatus::Verified => "verified",
            VerificationStatus::Unverified => "unverified",
            VerificationStatus::Failed => "failed",
        }
    }
}

#[derive(Debug , Clone , Serialize , Deserialize , FromRow)]
pub struct Wallet{
  pub user_id: String,
  pub available_balance : i64,
  pub initial_balance : i64,
  pub lifetime_earnings : i64,
  pub created_at : DateTime<Utc>,
  pub updated_at : DateTime<Utc>,
}

impl Wallet {
  pub fn new(user_id: &str, initial_balance: i64, now: DateTime<Utc>) -> Self {
    Self {
      user_id: user_id.to_string(),
      available_balance: initial_balance,
      initial_balance,
      lifetime_earnings: 0,
      created_at: now,
      updated_at: now,
    }
  }
  #[inline]
  pub fn has_available(&self , amount : i64) -> bool {
    self.available_balance >= amount
  }
  /// Net movement the ledger must account for.
  #[inline]
  pub fn expected_ledger_sum(&self) -> i64 {
    self.available_balance - self.initial_balance
  }
}

#[derive(Debug , Clone , Serialize , Deserialize , FromRow)]
pub struct WalletLedgerEntry{
  pub id: Uuid,
  pub user_id: String,
  pub reference_type: String,
  pub reference_id: String,
  pub delta: i64,
  pub balance_after: i64,
  pub reason: String,
  pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum WalletDirection {
    Credit,
    Debit,
}

/// One requested balance mutation. Credits and debits share the shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletMutation {
    pub user_id: String,
    pub direction: WalletDirection,
    pub amount: i64,
    pub reason: String,
    pub reference_type: String,
    pub reference_id: String,
}

impl WalletMutation {
    pub fn credit(user_id: &str, amount: i64, reason: &str, reference_type: &str, reference_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            direction: WalletDirection::Credit,
            amount,
            reason: reason.to_string(),
            reference_type: reference_type.to_string(),
            reference_id: reference_id.to_string(),
        }
    }

    pub fn debit(user_id: &str, amount: i64, reason: &str, reference_type: &str, reference_id: &str) -> Self {
        Self {
            direction: WalletDirection::Debit,
            ..Self::credit(user_id, amount, reason, reference_type, reference_id)
        }
    }

    /// Signed delta applied to the wallet.
    pub fn delta(&self) -> i64 {
        match self.direction {
            WalletDirection::Credit => self.amount,
            WalletDirection::Debit => -self.amount,
        }
    }
}

#[derive(Debug , Clone , Serialize , Deserialize , FromRow)]
pub struct ExchangeRate{
  pub id: Uuid,
  pub from_currency: String,
  pub to_currency: String,
  pub rate: Decimal,
  pub source: String,
  pub is_fluctuation: bool,
  pub previous_rate: Option<Decimal>,
  pub observed_at: DateTime<Utc>,
}

#[derive(Debug , Clone , Serialize , Deserialize , FromRow)]
pub struct PostbackLog {
    pub id: i64,
    pub provider_id: String,
    pub external_transaction_id: Option<String>,
    pub user_id: Option<String>,
    pub request_data: JsonValue,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub outcome: String,
    pub http_status: i32,
    pub processing_ms: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug , Clone , Deserialize , Serialize , FromRow)]
pub struct Alert {
    pub id: i64,
    pub alert_type: String,
    pub severity: String,
    pub title: String,
    pub message: String,
    pub details: Option<JsonValue>,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub resolved_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

impl AlertSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertSeverity::Info => "info",
            AlertSeverity::Warning => "warning",
            AlertSeverity::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AlertStatus {
    Active,
    Acknowledged,
    Resolved,
}

impl AlertStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertStatus::Active => "active",
            AlertStatus::Acknowledged => "acknowledged",
            AlertStatus::Resolved => "resolved",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ProviderStats {
    pub provider_id: String,
    pub total_events: i64,
    pub completed: i64,
    pub failed: i64,
    pub duplicate: i64,
    pub total_converted: i64,
    pub total_commission: i64,
    pub total_user_earnings: i64,
}

/// User-facing view of a completed offer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EarningRecord {
    pub id: Uuid,
    pub offer_name: String,
    pub provider_name: String,
    pub user_earnings: i64,
    pub status: String,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl From<&RevenueEvent> for EarningRecord {
    fn from(event: &RevenueEvent) -> Self {
        Self {
            id: event.id,
            offer_name: event.offer_name.clone(),
            provider_name: event.provider_name.clone(),
            user_earnings: event.user_earnings,
            status: event.status.clone(),
            completed_at: event.processed_at,
            created_at: event.created_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationReport {
    pub user_id: String,
    pub expected_delta: i64,
    pub ledger_sum: i64,
    pub discrepancy: i64,
    pub entries: i64,
}

impl ReconciliationReport {
    pub fn is_balanced(&self) -> bool {
        self.discrepancy == 0
    }
}

#[derive(Debug , Clone , Serialize ,Deserialize)]

pub struct ApiResponse<T>{
  pub success : bool ,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub data : Option<T>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub error : Option<String>,
}

impl<T> ApiResponse<T>{
    pub fn success(data: T) -> Self {
      Self { success: true, data: Some(data), error: None }
    }

    pub fn error(error : String) -> Self{
      Self { success: false, data: None, error: Some(error) }
    }
}

#[derive(Debug , Clone , Serialize , Deserialize)]
pub struct PaginationParams{
  #[serde(default = "default_limit")]
  pub limit : i64,
  #[serde(default)]
  pub offset : i64
}

fn default_limit() -> i64 {
  50
}
