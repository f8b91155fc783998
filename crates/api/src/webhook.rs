//! # Gateway Webhook Receiver
//!
//! Consumes one event type, "checkout completed", and makes it safe to
//! replay: the pool contribution is keyed `stripe_checkout:{event.id}`,
//! and the prepaid balance is only credited when that contribution was
//! newly recorded. Signature verification is mandatory whenever a
//! webhook secret is configured.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use verdant_payments::webhook::{
    parse_checkout_event, verify_signature, CheckoutCompleted, DEFAULT_TOLERANCE_SECS,
};
use verdant_pool::{ContributionInput, ContributionSource, PoolStore};

use crate::balance::SqliteBalanceStore;
use crate::envelope::ApiError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookOutcome {
    pub event_id: String,
    /// Replay of an already-processed event; nothing was credited.
    pub duplicate: bool,
    pub user_id: String,
    pub credited_cents: u64,
}

pub struct WebhookProcessor {
    balance: Arc<SqliteBalanceStore>,
    pool: Arc<dyn PoolStore>,
    webhook_secret: Option<String>,
}

impl WebhookProcessor {
    pub fn new(
        balance: Arc<SqliteBalanceStore>,
        pool: Arc<dyn PoolStore>,
        webhook_secret: Option<String>,
    ) -> Self {
        Self {
            balance,
            pool,
            webhook_secret,
        }
    }

    /// Handle one webhook delivery. `Ok(None)` means the event type is
    /// not ours: acknowledged and ignored.
    pub fn process(
        &self,
        payload: &[u8],
        signature_header: Option<&str>,
    ) -> Result<Option<WebhookOutcome>, ApiError> {
        if let Some(secret) = &self.webhook_secret {
            let header = signature_header
                .ok_or_else(|| ApiError::unauthorized("missing webhook signature header"))?;
            verify_signature(
                payload,
                header,
                secret,
                DEFAULT_TOLERANCE_SECS,
                Utc::now().timestamp(),
            )
            .map_err(|err| {
                warn!(%err, "webhook signature rejected");
                ApiError::unauthorized(format!("webhook signature rejected: {}", err))
            })?;
        }

        let event = match parse_checkout_event(payload) {
            Ok(Some(event)) => event,
            Ok(None) => return Ok(None),
            Err(err) => return Err(ApiError::invalid(err.to_string())),
        };
        self.apply(event).map(Some)
    }

    fn apply(&self, event: CheckoutCompleted) -> Result<WebhookOutcome, ApiError> {
        let email = event
            .customer_email
            .as_deref()
            .map(str::trim)
            .filter(|e| !e.is_empty())
            .ok_or_else(|| ApiError::invalid("checkout session has no customer email"))?;

        let user = self
            .balance
            .find_or_create_user(email, event.customer.as_deref())
            .map_err(|e| ApiError::internal(e.to_string()))?;

        let outcome = self.pool.record_contribution(ContributionInput {
            email: Some(email.to_string()),
            amount_usd_cents: event.amount_total_cents,
            contributed_at: Utc::now().to_rfc3339(),
            source: Some(ContributionSource::OneOff),
            external_event_id: Some(format!("stripe_checkout:{}", event.event_id)),
            metadata: [(
                "checkout_session".to_string(),
                event.session_id.clone(),
            )]
            .into_iter()
            .collect(),
            ..Default::default()
        })?;

        if outcome.duplicate {
            info!(event = %event.event_id, "webhook replay ignored");
            return Ok(WebhookOutcome {
                event_id: event.event_id,
                duplicate: true,
                user_id: user.id,
                credited_cents: 0,
            });
        }

        self.balance
            .credit(
                &user.id,
                event.amount_total_cents,
                "checkout top-up",
                Some(&event.session_id),
            )
            .map_err(|e| ApiError::internal(e.to_string()))?;
        info!(event = %event.event_id, user = %user.id, cents = event.amount_total_cents, "checkout credited");

        Ok(WebhookOutcome {
            event_id: event.event_id,
            duplicate: false,
            user_id: user.id,
            credited_cents: event.amount_total_cents,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hmac::{Hmac, Mac};
    use sha2::Sha256;
    use verdant_common::ErrorKind;
    use verdant_pool::MemoryPoolStore;
    use verdant_retire::service::PrepaidBalance;

    const SECRET: &str = "whsec_test";

    fn processor(secret: Option<&str>) -> (WebhookProcessor, Arc<SqliteBalanceStore>) {
        let balance = Arc::new(SqliteBalanceStore::open_in_memory().unwrap());
        let pool = Arc::new(MemoryPoolStore::new());
        (
            WebhookProcessor::new(balance.clone(), pool, secret.map(str::to_string)),
            balance,
        )
    }

    fn checkout_payload() -> Vec<u8> {
        serde_json::json!({
            "id": "evt_1",
            "type": "checkout.session.completed",
            "data": { "object": {
                "id": "cs_1",
                "amount_total": 2500,
                "customer_email": "ada@example.org",
                "customer": "cus_9"
            }}
        })
        .to_string()
        .into_bytes()
    }

    fn sign(payload: &[u8]) -> String {
        let timestamp = Utc::now().timestamp();
        let mut mac = Hmac::<Sha256>::new_from_slice(SECRET.as_bytes()).unwrap();
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(payload);
        format!(
            "t={},v1={}",
            timestamp,
            hex::encode(mac.finalize().into_bytes())
        )
    }

    #[tokio::test]
    async fn checkout_credits_user_once() {
        let (processor, balance) = processor(Some(SECRET));
        let payload = checkout_payload();
        let header = sign(&payload);

        let outcome = processor
            .process(&payload, Some(&header))
            .unwrap()
            .unwrap();
        assert!(!outcome.duplicate);
        assert_eq!(outcome.credited_cents, 2500);
        assert_eq!(
            balance.balance_cents(&outcome.user_id).await.unwrap(),
            2500
        );

        // replay: acknowledged, nothing credited
        let replay = processor
            .process(&payload, Some(&header))
            .unwrap()
            .unwrap();
        assert!(replay.duplicate);
        assert_eq!(replay.credited_cents, 0);
        assert_eq!(
            balance.balance_cents(&outcome.user_id).await.unwrap(),
            2500
        );
    }

    #[test]
    fn bad_signature_is_unauthorized() {
        let (processor, _) = processor(Some(SECRET));
        let payload = checkout_payload();

        let err = processor
            .process(&payload, Some("t=0,v1=00"))
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Unauthorized);

        let err = processor.process(&payload, None).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Unauthorized);
    }

    #[test]
    fn signature_is_optional_without_secret() {
        let (processor, _) = processor(None);
        let outcome = processor.process(&checkout_payload(), None).unwrap();
        assert!(outcome.is_some());
    }

    #[test]
    fn foreign_event_types_are_ignored() {
        let (processor, _) = processor(None);
        let payload =
            br#"{"id":"evt_2","type":"invoice.paid","data":{"object":{"id":"in_1"}}}"#.to_vec();
        assert_eq!(processor.process(&payload, None).unwrap(), None);
    }

    #[test]
    fn missing_email_is_invalid() {
        let (processor, _) = processor(None);
        let payload = serde_json::json!({
            "id": "evt_3",
            "type": "checkout.session.completed",
            "data": { "object": { "id": "cs_2", "amount_total": 100 } }
        })
        .to_string()
        .into_bytes();
        let err = processor.process(&payload, None).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidRequest);
    }
}
