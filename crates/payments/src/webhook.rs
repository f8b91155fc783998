//! Gateway webhook verification and checkout-event parsing.
//!
//! The signature header carries a unix timestamp and one or more HMAC
//! candidates: `t=1712000000,v1=hex,v1=hex`. The signed payload is
//! `"{t}.{raw body}"`; verification is constant-time and bounded by a
//! replay tolerance window.

use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Replay window applied to the header timestamp.
pub const DEFAULT_TOLERANCE_SECS: i64 = 300;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookError {
    /// Header absent or not parseable as `k=v` pairs with `t` and `v1`.
    BadHeader,
    /// No signature candidate matched the payload HMAC.
    SignatureMismatch,
    /// Timestamp outside the tolerance window.
    StaleTimestamp { age_secs: i64 },
    /// Body is not the JSON shape of a gateway event.
    BadPayload(String),
}

impl std::fmt::Display for WebhookError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WebhookError::BadHeader => write!(f, "malformed webhook signature header"),
            WebhookError::SignatureMismatch => write!(f, "webhook signature mismatch"),
            WebhookError::StaleTimestamp { age_secs } => {
                write!(f, "webhook timestamp outside tolerance ({}s old)", age_secs)
            }
            WebhookError::BadPayload(msg) => write!(f, "malformed webhook payload: {}", msg),
        }
    }
}

impl std::error::Error for WebhookError {}

/// Verify a signature header against the raw request body.
///
/// `now_unix` is passed in rather than read from the clock so callers and
/// tests share one time source.
pub fn verify_signature(
    payload: &[u8],
    signature_header: &str,
    secret: &str,
    tolerance_secs: i64,
    now_unix: i64,
) -> Result<(), WebhookError> {
    let mut timestamp: Option<i64> = None;
    let mut candidates: Vec<Vec<u8>> = Vec::new();

    for part in signature_header.split(',') {
        let (key, value) = part.trim().split_once('=').ok_or(WebhookError::BadHeader)?;
        match key {
            "t" => timestamp = Some(value.parse().map_err(|_| WebhookError::BadHeader)?),
            "v1" => candidates.push(hex::decode(value).map_err(|_| WebhookError::BadHeader)?),
            // Unknown schemes (v0, …) are ignored, per gateway docs.
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or(WebhookError::BadHeader)?;
    if candidates.is_empty() {
        return Err(WebhookError::BadHeader);
    }

    let age = now_unix - timestamp;
    if age.abs() > tolerance_secs {
        return Err(WebhookError::StaleTimestamp { age_secs: age });
    }

    // mac input is "{t}.{body}"
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| WebhookError::SignatureMismatch)?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    let expected = mac.finalize().into_bytes();

    let matched = candidates
        .iter()
        .any(|candidate| candidate.ct_eq(expected.as_slice()).unwrap_u8() == 1);
    if matched {
        Ok(())
    } else {
        Err(WebhookError::SignatureMismatch)
    }
}

/// The one event type the receiver consumes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutCompleted {
    /// Gateway event id, the idempotency key for pool accounting.
    pub event_id: String,
    pub session_id: String,
    pub amount_total_cents: u64,
    pub customer_email: Option<String>,
    pub customer: Option<String>,
}

#[derive(Deserialize)]
struct EventWire {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    data: EventData,
}

#[derive(Deserialize)]
struct EventData {
    object: SessionWire,
}

#[derive(Deserialize)]
struct SessionWire {
    id: String,
    #[serde(default)]
    amount_total: u64,
    #[serde(default)]
    customer_email: Option<String>,
    #[serde(default)]
    customer: Option<String>,
}

/// Parse a webhook body. `Ok(None)` for event types the receiver ignores.
pub fn parse_checkout_event(payload: &[u8]) -> Result<Option<CheckoutCompleted>, WebhookError> {
    let event: EventWire =
        serde_json::from_slice(payload).map_err(|e| WebhookError::BadPayload(e.to_string()))?;
    if event.event_type != "checkout.session.completed" {
        return Ok(None);
    }
    Ok(Some(CheckoutCompleted {
        event_id: event.id,
        session_id: event.data.object.id,
        amount_total_cents: event.data.object.amount_total,
        customer_email: event.data.object.customer_email,
        customer: event.data.object.customer,
    }))
}
