//! Webhook signature verification (HMAC-SHA256).

use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying Stripe's `t=<ts>,v1=<hex>` signature.
pub const STRIPE_SIGNATURE_HEADER: &str = "stripe-signature";
pub const PAYPAL_TRANSMISSION_ID_HEADER: &str = "paypal-transmission-id";
pub const PAYPAL_TRANSMISSION_TIME_HEADER: &str = "paypal-transmission-time";
pub const PAYPAL_TRANSMISSION_SIG_HEADER: &str = "paypal-transmission-sig";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignatureError {
    #[error("missing {0} header")]
    MissingHeader(&'static str),

    #[error("malformed signature header")]
    Malformed,

    #[error("signature mismatch")]
    Mismatch,

    #[error("timestamp outside tolerance")]
    Expired,

    #[error("webhook secret is not configured")]
    NotConfigured,
}

fn mac(secret: &str) -> Result<HmacSha256, SignatureError> {
    if secret.is_empty() {
        return Err(SignatureError::NotConfigured);
    }
    HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| SignatureError::NotConfigured)
}

fn stripe_signed_payload(timestamp: &str, payload: &[u8]) -> Vec<u8> {
    let mut signed = Vec::with_capacity(timestamp.len() + 1 + payload.len());
    signed.extend_from_slice(timestamp.as_bytes());
    signed.push(b'.');
    signed.extend_from_slice(payload);
    signed
}

/// Verifies a Stripe webhook.
///
/// Any `v1` entry may match; the timestamp must be within `tolerance` of `now`.
pub fn verify_stripe(
    payload: &[u8],
    header: &str,
    secret: &str,
    tolerance: Duration,
    now: DateTime<Utc>,
) -> Result<(), SignatureError> {
    let mut timestamp = None;
    let mut signatures = Vec::new();
    for part in header.split(',').map(str::trim) {
        if let Some(t) = part.strip_prefix("t=") {
            timestamp = Some(t);
        } else if let Some(v) = part.strip_prefix("v1=") {
            signatures.push(v);
        }
    }
    let timestamp = timestamp.ok_or(SignatureError::Malformed)?;
    if signatures.is_empty() {
        return Err(SignatureError::Malformed);
    }
    let issued_at: i64 = timestamp.parse().map_err(|_| SignatureError::Malformed)?;

    let signed = stripe_signed_payload(timestamp, payload);
    let base = mac(secret)?;
    let matched = signatures.iter().any(|candidate| {
        let Ok(expected) = hex::decode(candidate) else {
            return false;
        };
        let mut mac = base.clone();
        mac.update(&signed);
        mac.verify_slice(&expected).is_ok()
    });
    if !matched {
        return Err(SignatureError::Mismatch);
    }

    if (now.timestamp() - issued_at).abs() > tolerance.num_seconds() {
        return Err(SignatureError::Expired);
    }
    Ok(())
}

/// Produces a Stripe signature header for `payload`.
pub fn sign_stripe(payload: &[u8], secret: &str, timestamp: i64) -> Result<String, SignatureError> {
    let timestamp = timestamp.to_string();
    let mut mac = mac(secret)?;
    mac.update(&stripe_signed_payload(&timestamp, payload));
    Ok(format!(
        "t={timestamp},v1={}",
        hex::encode(mac.finalize().into_bytes())
    ))
}

fn paypal_message(transmission_id: &str, transmission_time: &str, payload: &[u8]) -> String {
    let digest = hex::encode(Sha256::digest(payload));
    format!("{transmission_id}|{transmission_time}|{digest}")
}

/// Verifies a PayPal webhook signed with the shared webhook secret.
pub fn verify_paypal(
    payload: &[u8],
    transmission_id: &str,
    transmission_time: &str,
    signature: &str,
    secret: &str,
) -> Result<(), SignatureError> {
    let expected = hex::decode(signature.trim()).map_err(|_| SignatureError::Malformed)?;
    let mut mac = mac(secret)?;
    mac.update(paypal_message(transmission_id, transmission_time, payload).as_bytes());
    mac.verify_slice(&expected)
        .map_err(|_| SignatureError::Mismatch)
}

/// Produces the hex signature PayPal would send for `payload`.
pub fn sign_paypal(
    payload: &[u8],
    transmission_id: &str,
    transmission_time: &str,
    secret: &str,
) -> Result<String, SignatureError> {
    let mut mac = mac(secret)?;
    mac.update(paypal_message(transmission_id, transmission_time, payload).as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}
