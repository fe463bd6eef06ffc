use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};

use crate::{LedgerError, LedgerResult};

/// Settlement currency minor units per major unit (kobo per naira).
pub const MINOR_UNITS_PER_MAJOR: i64 = 100;

/// Commission and earnings for one converted amount, both in minor units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommissionSplit {
  pub converted_amount: i64,
  pub commission_amount: i64,
  pub user_earnings: i64,
}

impl CommissionSplit {
  #[inline]
  pub fn verify_invariant(&self) -> bool {
    self.commission_amount + self.user_earnings == self.converted_amount
  }
}

/// Round half-up to `dp` decimal places. Amounts here are never negative,
/// so "away from zero" is the same rule.
pub fn round_half_up(value: Decimal, dp: u32) -> Decimal {
  value.round_dp_with_strategy(dp, RoundingStrategy::MidpointAwayFromZero)
}

pub fn validate_amount(amount: Decimal) -> LedgerResult<Decimal> {
  if amount <= Decimal::ZERO {
    return Err(LedgerError::InvalidAmount(
       "Amount must be greater than zero".to_string()
    ));
  }

  Ok(amount)
}

pub fn validate_commission_rate(rate: Decimal) -> LedgerResult<Decimal> {
  if rate < Decimal::ZERO || rate > Decimal::ONE {
    return Err(LedgerError::InvalidCommissionRate(format!(
      "{} is outside 0..=1",
      rate
    )));
  }
  Ok(rate)
}

pub fn normalize_currency(code: &str) -> LedgerResult<String> {
  let code = code.trim().to_ascii_uppercase();
  if code.len() != 3 || !code.chars().all(|c| c.is_ascii_alphabetic()) {
    return Err(LedgerError::InvalidCurrency(code));
  }
  Ok(code)
}

/// Major units (e.g. `3000.005` NGN) to minor units, rounding half-up to the kobo.
pub fn major_to_minor(amount: Decimal) -> LedgerResult<i64> {
  let scaled = round_half_up(amount, 2)
    .checked_mul(Decimal::from(MINOR_UNITS_PER_MAJOR))
    .ok_or(LedgerError::Overflow)?;
  scaled.to_i64().ok_or(LedgerError::Overflow)
}

pub fn minor_to_major(amount: i64) -> Decimal {
  Decimal::new(amount, 2)
}

/// `amount * rate` rounded half-up to the settlement currency's 2 decimals,
/// returned in minor units.
pub fn convert_to_minor(amount: Decimal, rate: Decimal) -> LedgerResult<i64> {
  let converted = amount.checked_mul(rate).ok_or(LedgerError::Overflow)?;
  major_to_minor(converted)
}

/// Split a converted amount into platform commission and user earnings.
/// Rounding happens once, on the commission; earnings take the remainder.
pub fn split_commission(converted_amount: i64, commission_rate: Decimal) -> LedgerResult<CommissionSplit> {
  if converted_amount < 0 {
    return Err(LedgerError::InvalidAmount(format!(
      "converted amount {} is negative",
      converted_amount
    )));
  }
  let rate = validate_commission_rate(commission_rate)?;

  let raw = Decimal::from(converted_amount)
    .checked_mul(rate)
    .ok_or(LedgerError::Overflow)?;
  let commission_amount = round_half_up(raw, 0).to_i64().ok_or(LedgerError::Overflow)?;
  let user_earnings = checked_sub(converted_amount, commission_amount)?;

  let split = CommissionSplit {
    converted_amount,
    commission_amount,
    user_earnings,
  };
  if !split.verify_invariant() || user_earnings < 0 {
    return Err(LedgerError::SplitInvariantViolation {
      converted: converted_amount,
      commission: commission_amount,
      earnings: user_earnings,
    });
  }
  Ok(split)
}

pub fn checked_add(a: i64, b: i64) -> LedgerResult<i64> {
    a.checked_add(b).ok_or(LedgerError::Overflow)
}

pub fn checked_sub(a: i64, b: i64) -> LedgerResult<i64> {
    a.checked_sub(b).ok_or(LedgerError::Underflow)
}

pub fn format_ngn(amount: i64) -> String {
  format!("{:.2} NGN" , minor_to_major(amount))
}
