//! Native-token provider: pay from the wallet that signs the purchase.
//!
//! There is no hold primitive on-chain, so `authorize` only proves the
//! balance covers the amount at that instant; `capture` and `refund` are
//! bookkeeping no-ops. The purchase transaction itself moves the funds.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use verdant_ledger::{LedgerClient, LedgerError};

use crate::provider::{
    Authorization, AuthorizationStatus, PaymentError, PaymentProvider, PaymentReceipt,
};

pub struct NativeTokenProvider {
    ledger: Arc<dyn LedgerClient>,
    next_id: AtomicU64,
    /// Outstanding balance proofs, kept only so capture can reconstruct
    /// the receipt.
    holds: Mutex<HashMap<String, (u128, String)>>,
}

impl NativeTokenProvider {
    pub fn new(ledger: Arc<dyn LedgerClient>) -> Self {
        Self {
            ledger,
            next_id: AtomicU64::new(1),
            holds: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl PaymentProvider for NativeTokenProvider {
    async fn authorize(
        &self,
        amount_micro: u128,
        denom: &str,
        _metadata: &HashMap<String, String>,
    ) -> Result<Authorization, PaymentError> {
        let address = match self.ledger.wallet_address() {
            Some(address) => address,
            None => return Ok(Authorization::failed("no signing wallet configured")),
        };

        let balance = match self.ledger.bank_balance(&address, denom).await {
            Ok(balance) => balance,
            Err(err @ LedgerError::Unavailable(_)) => {
                return Err(PaymentError::Unavailable(err.to_string()))
            }
            Err(err) => return Err(PaymentError::Rejected(err.to_string())),
        };

        if balance < amount_micro {
            return Ok(Authorization::failed(format!(
                "wallet balance {} {} is below required {}",
                balance, denom, amount_micro
            )));
        }

        let id = format!("native-{}", self.next_id.fetch_add(1, Ordering::Relaxed));
        self.holds
            .lock()
            .insert(id.clone(), (amount_micro, denom.to_string()));
        debug!(%id, amount_micro, denom, "balance verified for native payment");
        Ok(Authorization {
            id,
            status: AuthorizationStatus::Authorized,
            message: None,
        })
    }

    async fn capture(&self, authorization_id: &str) -> Result<PaymentReceipt, PaymentError> {
        let (amount_micro, denom) = self
            .holds
            .lock()
            .remove(authorization_id)
            .ok_or_else(|| PaymentError::UnknownAuthorization(authorization_id.to_string()))?;
        Ok(PaymentReceipt {
            authorization_id: authorization_id.to_string(),
            amount_micro,
            denom,
            gateway_reference: None,
        })
    }

    async fn refund(&self, authorization_id: &str) -> Result<(), PaymentError> {
        // Nothing was reserved; dropping the bookkeeping entry is enough.
        // Absent ids are fine; refund must be idempotent.
        self.holds.lock().remove(authorization_id);
        Ok(())
    }
}
