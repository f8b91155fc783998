//! Scripted [`PaymentProvider`] for orchestration tests.
//!
//! Authorize outcomes are pre-loaded FIFO (default: authorized); capture
//! and refund calls are recorded so tests can assert hold discipline.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::provider::{
    Authorization, AuthorizationStatus, PaymentError, PaymentProvider, PaymentReceipt,
};

#[derive(Default)]
struct MockState {
    authorize_queue: Vec<Result<Authorization, PaymentError>>,
    capture_queue: Vec<Result<(), PaymentError>>,
    authorized: Vec<(String, u128, String)>,
    capture_calls: Vec<String>,
    refund_calls: Vec<String>,
    next_id: u64,
}

#[derive(Default)]
pub struct MockPaymentProvider {
    state: Mutex<MockState>,
    preferred: Option<String>,
}

impl MockPaymentProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_preferred_denom(mut self, denom: &str) -> Self {
        self.preferred = Some(denom.to_string());
        self
    }

    /// Queue an explicit authorize outcome (FIFO).
    pub fn push_authorize(&self, result: Result<Authorization, PaymentError>) {
        self.state.lock().authorize_queue.push(result);
    }

    /// Queue a capture failure (successes need no scripting).
    pub fn push_capture(&self, result: Result<(), PaymentError>) {
        self.state.lock().capture_queue.push(result);
    }

    pub fn capture_calls(&self) -> Vec<String> {
        self.state.lock().capture_calls.clone()
    }

    pub fn refund_calls(&self) -> Vec<String> {
        self.state.lock().refund_calls.clone()
    }
}

#[async_trait]
impl PaymentProvider for MockPaymentProvider {
    async fn authorize(
        &self,
        amount_micro: u128,
        denom: &str,
        _metadata: &HashMap<String, String>,
    ) -> Result<Authorization, PaymentError> {
        let mut state = self.state.lock();
        if !state.authorize_queue.is_empty() {
            return state.authorize_queue.remove(0);
        }
        state.next_id += 1;
        let id = format!("auth-{}", state.next_id);
        state
            .authorized
            .push((id.clone(), amount_micro, denom.to_string()));
        Ok(Authorization {
            id,
            status: AuthorizationStatus::Authorized,
            message: None,
        })
    }

    async fn capture(&self, authorization_id: &str) -> Result<PaymentReceipt, PaymentError> {
        let mut state = self.state.lock();
        state.capture_calls.push(authorization_id.to_string());
        if !state.capture_queue.is_empty() {
            state.capture_queue.remove(0)?;
        }
        let (id, amount_micro, denom) = state
            .authorized
            .iter()
            .find(|(id, _, _)| id == authorization_id)
            .cloned()
            .unwrap_or_else(|| (authorization_id.to_string(), 0, "uverd".to_string()));
        Ok(PaymentReceipt {
            authorization_id: id,
            amount_micro,
            denom,
            gateway_reference: None,
        })
    }

    async fn refund(&self, authorization_id: &str) -> Result<(), PaymentError> {
        self.state
            .lock()
            .refund_calls
            .push(authorization_id.to_string());
        Ok(())
    }

    fn preferred_denom(&self) -> Option<String> {
        self.preferred.clone()
    }
}
