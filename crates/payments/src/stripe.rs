//! Fiat provider over manual-capture payment intents.
//!
//! ## Amount Conversion
//!
//! The gateway works in USD cents, the chain in micro-units. For a
//! USDC-equivalent denom `cents = ceil(micro / 10_000)`; the charge
//! always covers the on-chain cost. Any non-USDC denom is a failed
//! authorization: this provider cannot settle it.
//!
//! ## Metadata Round Trip
//!
//! `authorize` stamps `onchain_amount_micro` and `onchain_denom` onto the
//! intent so `capture` can rebuild the receipt from the gateway's
//! response alone.

use std::collections::HashMap;

use async_trait::async_trait;
use tracing::{debug, warn};

use verdant_common::money::cents_from_usdc_micro;

use crate::gateway::{CreateIntent, GatewayError, StripeClient};
use crate::provider::{
    Authorization, AuthorizationStatus, PaymentError, PaymentProvider, PaymentReceipt,
};

const META_AMOUNT: &str = "onchain_amount_micro";
const META_DENOM: &str = "onchain_denom";

pub struct StripeProvider {
    client: StripeClient,
    customer: String,
    payment_method: String,
    /// Denoms this provider can settle (USDC equivalents on the ledger).
    usdc_denoms: Vec<String>,
}

impl StripeProvider {
    pub fn new(
        client: StripeClient,
        customer: impl Into<String>,
        payment_method: impl Into<String>,
        usdc_denoms: Vec<String>,
    ) -> Self {
        Self {
            client,
            customer: customer.into(),
            payment_method: payment_method.into(),
            usdc_denoms,
        }
    }

    fn settles(&self, denom: &str) -> bool {
        self.usdc_denoms.iter().any(|d| d == denom)
    }
}

fn map_gateway(err: GatewayError) -> PaymentError {
    match err {
        GatewayError::Unavailable(msg) => PaymentError::Unavailable(msg),
        GatewayError::Api { message, .. } => PaymentError::Rejected(message),
        GatewayError::Decode(msg) => PaymentError::Rejected(msg),
    }
}

#[async_trait]
impl PaymentProvider for StripeProvider {
    async fn authorize(
        &self,
        amount_micro: u128,
        denom: &str,
        metadata: &HashMap<String, String>,
    ) -> Result<Authorization, PaymentError> {
        if !self.settles(denom) {
            return Ok(Authorization::failed(format!(
                "denom {} cannot be settled through the card gateway",
                denom
            )));
        }
        let cents = cents_from_usdc_micro(amount_micro)
            .map_err(|e| PaymentError::Rejected(e.to_string()))?;

        let mut intent_metadata = metadata.clone();
        intent_metadata.insert(META_AMOUNT.to_string(), amount_micro.to_string());
        intent_metadata.insert(META_DENOM.to_string(), denom.to_string());

        let intent = match self
            .client
            .create_payment_intent(&CreateIntent {
                amount_cents: cents,
                customer: self.customer.clone(),
                payment_method: self.payment_method.clone(),
                metadata: intent_metadata,
            })
            .await
        {
            Ok(intent) => intent,
            Err(err @ GatewayError::Unavailable(_)) => {
                return Err(PaymentError::Unavailable(err.to_string()))
            }
            // Card declines and validation failures come back as 4xx;
            // they are business failures, not transport errors.
            Err(GatewayError::Api { message, .. }) => {
                return Ok(Authorization::failed(message));
            }
            Err(err) => return Err(map_gateway(err)),
        };

        match intent.status.as_str() {
            "requires_capture" | "succeeded" => {
                debug!(intent = %intent.id, cents, "hold placed");
                Ok(Authorization {
                    id: intent.id,
                    status: AuthorizationStatus::Authorized,
                    message: None,
                })
            }
            other => Ok(Authorization::failed(format!(
                "payment intent in unexpected status {:?}",
                other
            ))),
        }
    }

    async fn capture(&self, authorization_id: &str) -> Result<PaymentReceipt, PaymentError> {
        let intent = self
            .client
            .capture_payment_intent(authorization_id)
            .await
            .map_err(map_gateway)?;

        let amount_micro = intent
            .metadata
            .get(META_AMOUNT)
            .and_then(|v| v.parse::<u128>().ok())
            .ok_or_else(|| {
                PaymentError::Rejected(format!(
                    "intent {} is missing on-chain amount metadata",
                    authorization_id
                ))
            })?;
        let denom = intent.metadata.get(META_DENOM).cloned().ok_or_else(|| {
            PaymentError::Rejected(format!(
                "intent {} is missing on-chain denom metadata",
                authorization_id
            ))
        })?;

        Ok(PaymentReceipt {
            authorization_id: authorization_id.to_string(),
            amount_micro,
            denom,
            gateway_reference: Some(intent.id),
        })
    }

    async fn refund(&self, authorization_id: &str) -> Result<(), PaymentError> {
        match self.client.cancel_payment_intent(authorization_id).await {
            Ok(_) => Ok(()),
            // A hold that was already released is a success for refund.
            Err(GatewayError::Api { code, message, .. })
                if code.as_deref() == Some("payment_intent_unexpected_state")
                    || message.contains("already been canceled") =>
            {
                warn!(intent = authorization_id, "hold was already released");
                Ok(())
            }
            Err(err @ GatewayError::Unavailable(_)) => Err(PaymentError::Unavailable(err.to_string())),
            Err(err) => Err(map_gateway(err)),
        }
    }

    fn preferred_denom(&self) -> Option<String> {
        self.usdc_denoms.first().cloned()
    }
}
