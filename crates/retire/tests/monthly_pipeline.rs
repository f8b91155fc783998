//! End-to-end monthly pipeline: gateway invoices → pool accounting →
//! dry run → live batch → exact attribution, all over in-memory
//! collaborators. No network, no clock dependence beyond record
//! timestamps.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use verdant_common::money::parse_quantity_micro;
use verdant_ledger::{AllowedDenom, BroadcastResult, MockLedgerClient, SellOrder};
use verdant_payments::{Customer, GatewayError, Invoice, InvoiceGateway, InvoicePage};
use verdant_pool::{MemoryPoolStore, PoolStore, SubscriptionSync, SyncConfig, SyncRequest};
use verdant_retire::{
    BatchService, BatchStatus, DriverConfig, ExecutionMode, ExecutionStore, MemoryExecutionStore,
    OrderSelector,
};
use verdant_payments::MockPaymentProvider;

const BUYER: &str = "verdant1feedface";

struct PagedGateway {
    pages: Mutex<Vec<InvoicePage>>,
}

#[async_trait]
impl InvoiceGateway for PagedGateway {
    async fn find_customer_by_email(&self, _email: &str) -> Result<Option<Customer>, GatewayError> {
        Ok(None)
    }

    async fn list_invoices(
        &self,
        _customer: Option<&str>,
        _starting_after: Option<&str>,
        _limit: u32,
    ) -> Result<InvoicePage, GatewayError> {
        let mut pages = self.pages.lock();
        if pages.is_empty() {
            return Ok(InvoicePage {
                invoices: vec![],
                has_more: false,
            });
        }
        Ok(pages.remove(0))
    }
}

fn invoice(id: &str, customer: &str, cents: u64, paid_at: &str) -> Invoice {
    Invoice {
        id: id.to_string(),
        customer: Some(customer.to_string()),
        status: "paid".to_string(),
        currency: "usd".to_string(),
        amount_paid: cents,
        paid_at: Some(
            DateTime::parse_from_rfc3339(paid_at)
                .unwrap()
                .with_timezone(&Utc),
        ),
        price_id: Some("price_forest".to_string()),
    }
}

fn march_invoices() -> InvoicePage {
    InvoicePage {
        invoices: vec![
            invoice("in_a1", "cus_alice", 600, "2026-03-05T00:00:00Z"),
            invoice("in_b1", "cus_bob", 300, "2026-03-07T00:00:00Z"),
            invoice("in_c1", "cus_carol", 100, "2026-03-09T00:00:00Z"),
        ],
        has_more: false,
    }
}

fn market_ledger() -> Arc<MockLedgerClient> {
    let ledger = MockLedgerClient::new().with_wallet(BUYER);
    ledger.set_sell_orders(vec![
        SellOrder {
            id: 1,
            batch_denom: "C01-001".to_string(),
            quantity_micro: 500_000_000,
            ask_amount_micro: 20_000, // 2¢ per credit
            ask_denom: "uusdc".to_string(),
            disable_auto_retire: false,
            expiration: None,
        },
        SellOrder {
            id: 2,
            batch_denom: "C01-002".to_string(),
            quantity_micro: 500_000_000,
            ask_amount_micro: 30_000, // 3¢ per credit
            ask_denom: "uusdc".to_string(),
            disable_auto_retire: false,
            expiration: None,
        },
    ]);
    ledger.set_allowed_denoms(vec![AllowedDenom {
        bank_denom: "uusdc".to_string(),
        display_denom: "USDC".to_string(),
        exponent: 6,
    }]);
    Arc::new(ledger)
}

#[tokio::test]
async fn invoices_to_attributed_retirement() {
    let pool = Arc::new(MemoryPoolStore::new());
    let ledger = market_ledger();
    let provider = Arc::new(MockPaymentProvider::new());
    let store = Arc::new(MemoryExecutionStore::new());

    // 1. Sync a month of paid invoices into the pool, twice. The second
    // run is a pure no-op thanks to external-event keying.
    let sync = SubscriptionSync::new(
        Arc::new(PagedGateway {
            pages: Mutex::new(vec![march_invoices()]),
        }),
        pool.clone(),
        SyncConfig::default(),
    );
    let request = SyncRequest {
        all_customers: true,
        month: Some("2026-03".to_string()),
        ..Default::default()
    };
    let first = sync.run(&request).await.unwrap();
    assert_eq!((first.synced, first.duplicates), (3, 0));

    let replay = SubscriptionSync::new(
        Arc::new(PagedGateway {
            pages: Mutex::new(vec![march_invoices()]),
        }),
        pool.clone(),
        SyncConfig::default(),
    );
    let second = replay.run(&request).await.unwrap();
    assert_eq!((second.synced, second.duplicates), (0, 3));

    let contributions = pool.contributions().unwrap();
    assert_eq!(contributions.len(), 3);

    // 2. Dry run gates the live run and plans the same budget.
    let batch = BatchService::new(
        pool.clone(),
        store.clone(),
        ledger.clone(),
        provider.clone(),
        OrderSelector::new(ledger.clone(), "uverd"),
        None,
        DriverConfig {
            fee_bps: 0,
            preferred_denom: Some("uusdc".to_string()),
            preflight_max_age_hours: 24,
            jurisdiction: "US".to_string(),
            poll_timeout: Duration::from_millis(20),
        },
    );

    let dry = batch
        .run_batch("2026-03", None, ExecutionMode::DryRun, false, false, "pool")
        .await
        .unwrap();
    assert_eq!(dry.status, BatchStatus::Success);
    assert_eq!(dry.budget_usd_cents, 1000);
    assert!(ledger.recorded_broadcasts().is_empty());

    // 3. Live run broadcasts once and attributes exactly.
    ledger.push_broadcast_result(Ok(BroadcastResult {
        code: 0,
        tx_hash: "FACade".to_string(),
        height: 42,
        raw_log: String::new(),
    }));
    let live = batch
        .run_batch("2026-03", None, ExecutionMode::Live, false, false, "pool")
        .await
        .unwrap();
    assert_eq!(live.status, BatchStatus::Success);
    assert_eq!(live.tx_hash.as_deref(), Some("FACade"));
    assert_eq!(ledger.recorded_broadcasts().len(), 1);
    assert_eq!(provider.capture_calls().len(), 1);

    // budget 1000¢ → 10_000_000 micro-USDC buys 500 credits at 2¢; the
    // cheap order supplies everything
    assert_eq!(live.retired_quantity, "500.000000");
    assert_eq!(live.spent_micro, 10_000_000);

    // invariants: Σ attributed == totals, weights follow contributions
    let attributions = &live.attributions;
    assert_eq!(attributions.len(), 3);
    assert_eq!(
        attributions
            .iter()
            .map(|a| a.attributed_budget_usd_cents)
            .sum::<u64>(),
        live.budget_usd_cents
    );
    assert_eq!(
        attributions
            .iter()
            .map(|a| a.attributed_cost_micro)
            .sum::<u128>(),
        live.spent_micro
    );
    assert_eq!(
        attributions
            .iter()
            .map(|a| parse_quantity_micro(&a.attributed_quantity).unwrap())
            .sum::<u128>(),
        parse_quantity_micro(&live.retired_quantity).unwrap()
    );

    // contributors are keyed by gateway customer id, largest share first
    assert_eq!(attributions[0].user_id, "customer:cus_alice");
    assert_eq!(attributions[0].share_ppm, 600_000);
    assert_eq!(attributions[0].attributed_quantity, "300.000000");
    assert_eq!(attributions[1].user_id, "customer:cus_bob");
    assert_eq!(attributions[2].user_id, "customer:cus_carol");

    // 4. The month now has exactly one live and one dry execution.
    let executions = store.list_executions(Some("2026-03")).unwrap();
    assert_eq!(executions.len(), 2);
    assert_eq!(executions.iter().filter(|e| e.dry_run).count(), 1);
}
