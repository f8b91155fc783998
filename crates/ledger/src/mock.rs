//! In-memory [`LedgerClient`] for tests across the workspace.
//!
//! Broadcast results are pre-loaded and consumed FIFO, and every
//! broadcast's messages are recorded for assertions: the same shape the
//! production code sees, no network.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::client::{LedgerClient, LedgerError};
use crate::types::{
    AllowedDenom, BroadcastResult, CreditClass, MsgBuyDirect, Project, RetirementRecord, SellOrder,
};

#[derive(Default)]
struct MockState {
    sell_orders: Vec<SellOrder>,
    classes: Vec<CreditClass>,
    projects: Vec<Project>,
    denoms: Vec<AllowedDenom>,
    retirements: Vec<RetirementRecord>,
    balances: HashMap<(String, String), u128>,
    /// FIFO broadcast outcomes; empty queue means "unavailable".
    broadcast_queue: Vec<Result<BroadcastResult, LedgerError>>,
    recorded_broadcasts: Vec<Vec<MsgBuyDirect>>,
    wallet_address: Option<String>,
    /// Injected failure for read calls, returned once per set.
    read_failure: Option<LedgerError>,
}

/// Mock ledger with scripted responses.
#[derive(Default)]
pub struct MockLedgerClient {
    state: Mutex<MockState>,
}

impl MockLedgerClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_wallet(self, address: &str) -> Self {
        self.state.lock().wallet_address = Some(address.to_string());
        self
    }

    pub fn set_sell_orders(&self, orders: Vec<SellOrder>) {
        self.state.lock().sell_orders = orders;
    }

    pub fn set_classes(&self, classes: Vec<CreditClass>) {
        self.state.lock().classes = classes;
    }

    pub fn set_projects(&self, projects: Vec<Project>) {
        self.state.lock().projects = projects;
    }

    pub fn set_allowed_denoms(&self, denoms: Vec<AllowedDenom>) {
        self.state.lock().denoms = denoms;
    }

    pub fn set_balance(&self, address: &str, denom: &str, amount: u128) {
        self.state
            .lock()
            .balances
            .insert((address.to_string(), denom.to_string()), amount);
    }

    pub fn add_retirement(&self, record: RetirementRecord) {
        self.state.lock().retirements.push(record);
    }

    pub fn push_broadcast_result(&self, result: Result<BroadcastResult, LedgerError>) {
        self.state.lock().broadcast_queue.push(result);
    }

    /// Make the next read call fail with `err` (one-shot).
    pub fn fail_next_read(&self, err: LedgerError) {
        self.state.lock().read_failure = Some(err);
    }

    pub fn recorded_broadcasts(&self) -> Vec<Vec<MsgBuyDirect>> {
        self.state.lock().recorded_broadcasts.clone()
    }

    fn take_read_failure(&self) -> Option<LedgerError> {
        self.state.lock().read_failure.take()
    }
}

#[async_trait]
impl LedgerClient for MockLedgerClient {
    async fn list_sell_orders(&self) -> Result<Vec<SellOrder>, LedgerError> {
        if let Some(err) = self.take_read_failure() {
            return Err(err);
        }
        Ok(self.state.lock().sell_orders.clone())
    }

    async fn list_credit_classes(&self) -> Result<Vec<CreditClass>, LedgerError> {
        if let Some(err) = self.take_read_failure() {
            return Err(err);
        }
        Ok(self.state.lock().classes.clone())
    }

    async fn list_projects(&self) -> Result<Vec<Project>, LedgerError> {
        if let Some(err) = self.take_read_failure() {
            return Err(err);
        }
        Ok(self.state.lock().projects.clone())
    }

    async fn allowed_denoms(&self) -> Result<Vec<AllowedDenom>, LedgerError> {
        if let Some(err) = self.take_read_failure() {
            return Err(err);
        }
        Ok(self.state.lock().denoms.clone())
    }

    async fn retirement_by_id(
        &self,
        id_or_tx_hash: &str,
    ) -> Result<Option<RetirementRecord>, LedgerError> {
        if let Some(err) = self.take_read_failure() {
            return Err(err);
        }
        Ok(self
            .state
            .lock()
            .retirements
            .iter()
            .find(|r| r.tx_hash == id_or_tx_hash || r.node_id == id_or_tx_hash)
            .cloned())
    }

    async fn bank_balance(&self, address: &str, denom: &str) -> Result<u128, LedgerError> {
        if let Some(err) = self.take_read_failure() {
            return Err(err);
        }
        Ok(self
            .state
            .lock()
            .balances
            .get(&(address.to_string(), denom.to_string()))
            .copied()
            .unwrap_or(0))
    }

    fn wallet_address(&self) -> Option<String> {
        self.state.lock().wallet_address.clone()
    }

    async fn sign_and_broadcast(
        &self,
        messages: &[MsgBuyDirect],
    ) -> Result<BroadcastResult, LedgerError> {
        let mut state = self.state.lock();
        if state.wallet_address.is_none() {
            return Err(LedgerError::NoWallet);
        }
        state.recorded_broadcasts.push(messages.to_vec());
        if state.broadcast_queue.is_empty() {
            return Err(LedgerError::Unavailable(
                "no mock broadcast response".to_string(),
            ));
        }
        state.broadcast_queue.remove(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_order() -> SellOrder {
        SellOrder {
            id: 1,
            batch_denom: "C01-001".to_string(),
            quantity_micro: 1_000_000,
            ask_amount_micro: 1_000,
            ask_denom: "uverd".to_string(),
            disable_auto_retire: false,
            expiration: None,
        }
    }

    #[tokio::test]
    async fn broadcast_records_messages_fifo() {
        let mock = MockLedgerClient::new().with_wallet("verdant1aa");
        mock.push_broadcast_result(Ok(BroadcastResult {
            code: 0,
            tx_hash: "AB".to_string(),
            height: 1,
            raw_log: String::new(),
        }));

        let msg = MsgBuyDirect {
            buyer: "verdant1aa".to_string(),
            orders: vec![],
        };
        let result = mock.sign_and_broadcast(&[msg.clone()]).await.unwrap();
        assert_eq!(result.tx_hash, "AB");
        assert_eq!(mock.recorded_broadcasts(), vec![vec![msg]]);

        // queue drained → unavailable
        let err = mock.sign_and_broadcast(&[]).await.unwrap_err();
        assert!(matches!(err, LedgerError::Unavailable(_)));
    }

    #[tokio::test]
    async fn read_failure_is_one_shot() {
        let mock = MockLedgerClient::new();
        mock.set_sell_orders(vec![sample_order()]);
        mock.fail_next_read(LedgerError::Unavailable("down".to_string()));

        assert!(mock.list_sell_orders().await.is_err());
        assert_eq!(mock.list_sell_orders().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn retirement_lookup_matches_hash_or_node_id() {
        let mock = MockLedgerClient::new();
        mock.add_retirement(RetirementRecord {
            node_id: "node-1".to_string(),
            amount: "1.000000".to_string(),
            batch_denom: "C01-001".to_string(),
            owner: "verdant1aa".to_string(),
            jurisdiction: "US".to_string(),
            reason: "offset".to_string(),
            timestamp: "2026-03-01T00:00:00Z".to_string(),
            tx_hash: "CAFE".to_string(),
            block_height: 9,
        });

        assert!(mock.retirement_by_id("CAFE").await.unwrap().is_some());
        assert!(mock.retirement_by_id("node-1").await.unwrap().is_some());
        assert!(mock.retirement_by_id("nope").await.unwrap().is_none());
    }
}
