//! Postback authenticity checks, one per provider verification method.

use std::net::IpAddr;

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use shared::{NormalizedPostback, PostbackParams, Provider, VerificationMethod, VerificationStatus};

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum VerificationError {
    #[error("Provider has no secret configured")]
    MissingSecret,
    #[error("Postback carries no signature")]
    MissingSignature,
    #[error("Signature mismatch")]
    InvalidSignature,
    #[error("Source address {0} is not allow-listed")]
    IpNotAllowed(String),
    #[error("Unsupported verification method: {0}")]
    UnsupportedMethod(String),
}

/// What the caller presented besides the payload itself.
#[derive(Debug, Clone, Default)]
pub struct Credentials<'a> {
    pub signature_header: Option<&'a str>,
    pub source_ip: Option<IpAddr>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerificationOutcome {
    pub method: VerificationMethod,
    pub status: VerificationStatus,
}

pub fn verify(
    provider: &Provider,
    postback: &NormalizedPostback,
    params: &PostbackParams,
    credentials: &Credentials<'_>,
) -> Result<VerificationOutcome, VerificationError> {
    let method = provider
        .verification()
        .ok_or_else(|| VerificationError::UnsupportedMethod(provider.verification_method.clone()))?;

    match method {
        VerificationMethod::SharedSecret => {
            let secret = provider.secret().ok_or(VerificationError::MissingSecret)?;
            let presented = params
                .get("secret")
                .or_else(|| params.get("key"))
                .map(String::as_str)
                .filter(|s| !s.is_empty())
                .ok_or(VerificationError::MissingSignature)?;
            if !constant_time_eq(presented.as_bytes(), secret.as_bytes()) {
                return Err(VerificationError::InvalidSignature);
            }
        }
        VerificationMethod::Signature => {
            let secret = provider.secret().ok_or(VerificationError::MissingSecret)?;
            let presented = credentials
                .signature_header
                .or(postback.signature.as_deref())
                .or_else(|| params.get("signature").map(String::as_str))
                .filter(|s| !s.is_empty())
                .ok_or(VerificationError::MissingSignature)?;
            let presented =
                hex::decode(presented.trim()).map_err(|_| VerificationError::InvalidSignature)?;

            let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
                .map_err(|_| VerificationError::MissingSecret)?;
            mac.update(signing_string(postback).as_bytes());
            mac.verify_slice(&presented)
                .map_err(|_| VerificationError::InvalidSignature)?;
        }
        VerificationMethod::Hash => {
            let secret = provider.secret().ok_or(VerificationError::MissingSecret)?;
            let presented = postback
                .signature
                .as_deref()
                .or_else(|| params.get("hash").map(String::as_str))
                .filter(|s| !s.is_empty())
                .ok_or(VerificationError::MissingSignature)?;
            let expected = hash_digest(postback, secret);
            if !constant_time_eq(presented.trim().to_ascii_lowercase().as_bytes(), expected.as_bytes()) {
                return Err(VerificationError::InvalidSignature);
            }
        }
        VerificationMethod::IpAllowlist => {
            let ip = credentials
                .source_ip
                .ok_or_else(|| VerificationError::IpNotAllowed("unknown".to_string()))?;
            if !provider.ip_allowlist.iter().any(|entry| ip_matches(entry, ip)) {
                return Err(VerificationError::IpNotAllowed(ip.to_string()));
            }
        }
        VerificationMethod::None => {
            return Ok(VerificationOutcome {
                method,
                status: VerificationStatus::Unverified,
            });
        }
    }

    Ok(VerificationOutcome {
        method,
        status: VerificationStatus::Verified,
    })
}

/// `userId:transactionId:amount:currency`, amount exactly as sent.
pub fn signing_string(postback: &NormalizedPostback) -> String {
    format!(
        "{}:{}:{}:{}",
        postback.user_id, postback.external_transaction_id, postback.amount_raw, postback.currency
    )
}

#[cfg(test)]
pub fn sign(postback: &NormalizedPostback, secret: &str) -> Option<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(signing_string(postback).as_bytes());
    Some(hex::encode(mac.finalize().into_bytes()))
}

pub fn hash_digest(postback: &NormalizedPostback, secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(postback.user_id.as_bytes());
    hasher.update(postback.external_transaction_id.as_bytes());
    hasher.update(postback.amount_raw.as_bytes());
    hasher.update(secret.as_bytes());
    hex::encode(hasher.finalize())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// `entry` is an exact address or a CIDR block.
pub fn ip_matches(entry: &str, ip: IpAddr) -> bool {
    let entry = entry.trim();
    let Some((network, prefix)) = entry.split_once('/') else {
        return entry.parse::<IpAddr>().map(|allowed| allowed == ip).unwrap_or(false);
    };
    let (Ok(network), Ok(prefix)) = (network.parse::<IpAddr>(), prefix.parse::<u32>()) else {
        return false;
    };

    match (network, ip) {
        (IpAddr::V4(net), IpAddr::V4(addr)) if prefix <= 32 => {
            let mask = u32::MAX.checked_shl(32 - prefix).unwrap_or(0);
            (u32::from(net) & mask) == (u32::from(addr) & mask)
        }
        (IpAddr::V6(net), IpAddr::V6(addr)) if prefix <= 128 => {
            let mask = u128::MAX.checked_shl(128 - prefix).unwrap_or(0);
            (u128::from(net) & mask) == (u128::from(addr) & mask)
        }
        _ => false,
    }
}
