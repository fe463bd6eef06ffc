use thiserror::Error;


#[derive(Debug , Error, Clone, PartialEq, Eq)]
pub enum LedgerError{
  #[error("Wallet not found: {0}")]
  WalletNotFound(String),
  #[error("Insufficient Balance : available={available}, required={required}")]
  InsufficientBalance {available : i64 , required : i64},
  #[error("Invalid amount: {0}")]
  InvalidAmount(String),
  #[error("Invalid commission rate: {0}")]
  InvalidCommissionRate(String),
  #[error("Invalid currency: {0}")]
  InvalidCurrency(String),
  #[error("Arithmetic overflow")]
  Overflow,
  #[error("Arithmetic underflow")]
  Underflow,
  #[error("Split invariant violation: converted={converted}, commission={commission}, earnings={earnings}")]
  SplitInvariantViolation { converted: i64, commission: i64, earnings: i64 },
}

pub type LedgerResult<T> = Result<T , LedgerError>;
