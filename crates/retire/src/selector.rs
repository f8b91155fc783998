//! # Order Selector
//!
//! Picks the cheapest eligible sell orders for either a target quantity
//! or a spending budget. Both entry points share one kernel:
//!
//! 1. **Denom choice**: the preferred denom if the marketplace allows
//!    it, else the native token, else the first allowed denom.
//! 2. **Eligibility**: drop orders with auto-retire disabled, a
//!    different ask denom, an elapsed expiration, or a mismatched credit
//!    type ("carbon" ↔ class type `C`, "biodiversity" ↔ anything else).
//! 3. **Sort**: ascending ask amount, input order on ties (stable).
//!
//! All arithmetic is `u128` micro-units. Quantity mode caps the last
//! order to land exactly on the target; budget mode floors the
//! affordable take and ceils each cost so the sum can never exceed the
//! budget.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::debug;

use verdant_common::money::{ceil_div, MICRO_PER_UNIT};
use verdant_ledger::{AllowedDenom, LedgerClient, LedgerError, SellOrder};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreditType {
    Carbon,
    Biodiversity,
}

impl CreditType {
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "carbon" => Some(CreditType::Carbon),
            "biodiversity" => Some(CreditType::Biodiversity),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CreditType::Carbon => "carbon",
            CreditType::Biodiversity => "biodiversity",
        }
    }

    /// Carbon matches class type `C`; biodiversity matches every other
    /// class type.
    fn matches_class(&self, credit_type_abbrev: &str) -> bool {
        match self {
            CreditType::Carbon => credit_type_abbrev == "C",
            CreditType::Biodiversity => credit_type_abbrev != "C",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SelectorError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error("marketplace has no allowed payment denoms")]
    NoAllowedDenom,
}

/// One selected order with the quantity taken from it and its cost.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectedOrder {
    pub order: SellOrder,
    pub quantity_micro: u128,
    pub cost_micro: u128,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuantitySelection {
    pub orders: Vec<SelectedOrder>,
    pub total_quantity_micro: u128,
    pub total_cost_micro: u128,
    pub payment_denom: String,
    pub display_denom: String,
    pub exponent: u32,
    /// All eligible supply was exhausted below the target.
    pub insufficient_supply: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BudgetSelection {
    pub orders: Vec<SelectedOrder>,
    pub total_quantity_micro: u128,
    pub total_cost_micro: u128,
    pub payment_denom: String,
    pub display_denom: String,
    pub exponent: u32,
    pub remaining_budget_micro: u128,
    /// The budget was spent to zero before supply ran out.
    pub exhausted_budget: bool,
}

pub struct OrderSelector {
    ledger: Arc<dyn LedgerClient>,
    native_denom: String,
}

impl OrderSelector {
    pub fn new(ledger: Arc<dyn LedgerClient>, native_denom: impl Into<String>) -> Self {
        Self {
            ledger,
            native_denom: native_denom.into(),
        }
    }

    /// Cheapest orders that together cover at least `target_quantity_micro`.
    pub async fn select_best_orders(
        &self,
        credit_type: Option<CreditType>,
        target_quantity_micro: u128,
        preferred_denom: Option<&str>,
    ) -> Result<QuantitySelection, SelectorError> {
        let (eligible, denom) = self.eligible_orders(credit_type, preferred_denom).await?;

        let mut selected = Vec::new();
        let mut total_quantity = 0u128;
        let mut total_cost = 0u128;

        for order in eligible {
            if total_quantity >= target_quantity_micro {
                break;
            }
            // cap the final take so the running total lands exactly on
            // the target
            let take = order
                .quantity_micro
                .min(target_quantity_micro - total_quantity);
            if take == 0 {
                continue;
            }
            let cost = ceil_div(order.ask_amount_micro * take, MICRO_PER_UNIT);
            total_quantity += take;
            total_cost += cost;
            selected.push(SelectedOrder {
                order,
                quantity_micro: take,
                cost_micro: cost,
            });
        }

        let insufficient_supply = total_quantity < target_quantity_micro;
        debug!(
            orders = selected.len(),
            total_quantity, total_cost, insufficient_supply, "quantity selection done"
        );
        Ok(QuantitySelection {
            orders: selected,
            total_quantity_micro: total_quantity,
            total_cost_micro: total_cost,
            payment_denom: denom.bank_denom,
            display_denom: denom.display_denom,
            exponent: denom.exponent,
            insufficient_supply,
        })
    }

    /// Cheapest orders whose summed cost never exceeds `budget_micro`.
    pub async fn select_orders_for_budget(
        &self,
        credit_type: Option<CreditType>,
        budget_micro: u128,
        preferred_denom: Option<&str>,
    ) -> Result<BudgetSelection, SelectorError> {
        let (eligible, denom) = self.eligible_orders(credit_type, preferred_denom).await?;

        let mut selected = Vec::new();
        let mut total_quantity = 0u128;
        let mut total_cost = 0u128;
        let mut remaining = budget_micro;

        for order in eligible {
            if remaining == 0 {
                break;
            }
            let take = if order.ask_amount_micro == 0 {
                // free credits: take everything on offer
                order.quantity_micro
            } else {
                let affordable = remaining * MICRO_PER_UNIT / order.ask_amount_micro;
                order.quantity_micro.min(affordable)
            };
            if take == 0 {
                // orders are sorted by price; nothing later is affordable
                break;
            }
            // ceil so we never understate cost, then clamp to the budget
            let cost = ceil_div(order.ask_amount_micro * take, MICRO_PER_UNIT).min(remaining);
            total_quantity += take;
            total_cost += cost;
            remaining -= cost;
            selected.push(SelectedOrder {
                order,
                quantity_micro: take,
                cost_micro: cost,
            });
        }

        debug!(
            orders = selected.len(),
            total_quantity, total_cost, remaining, "budget selection done"
        );
        Ok(BudgetSelection {
            orders: selected,
            total_quantity_micro: total_quantity,
            total_cost_micro: total_cost,
            payment_denom: denom.bank_denom,
            display_denom: denom.display_denom,
            exponent: denom.exponent,
            remaining_budget_micro: remaining,
            exhausted_budget: remaining == 0,
        })
    }

    /// Shared kernel: fetch, choose denom, filter, sort.
    async fn eligible_orders(
        &self,
        credit_type: Option<CreditType>,
        preferred_denom: Option<&str>,
    ) -> Result<(Vec<SellOrder>, AllowedDenom), SelectorError> {
        let allowed = self.ledger.allowed_denoms().await?;
        let denom = choose_denom(&allowed, &self.native_denom, preferred_denom)
            .ok_or(SelectorError::NoAllowedDenom)?;

        let class_types: HashMap<String, String> = self
            .ledger
            .list_credit_classes()
            .await?
            .into_iter()
            .map(|class| (class.id, class.credit_type_abbrev))
            .collect();

        let now = Utc::now();
        let mut orders: Vec<SellOrder> = self
            .ledger
            .list_sell_orders()
            .await?
            .into_iter()
            .filter(|order| is_eligible(order, &denom.bank_denom, credit_type, &class_types, now))
            .collect();
        // stable sort keeps input order on equal asks
        orders.sort_by(|a, b| a.ask_amount_micro.cmp(&b.ask_amount_micro));

        Ok((orders, denom))
    }
}

fn choose_denom(
    allowed: &[AllowedDenom],
    native_denom: &str,
    preferred: Option<&str>,
) -> Option<AllowedDenom> {
    if let Some(preferred) = preferred {
        if let Some(denom) = allowed.iter().find(|d| d.bank_denom == preferred) {
            return Some(denom.clone());
        }
    }
    if let Some(denom) = allowed.iter().find(|d| d.bank_denom == native_denom) {
        return Some(denom.clone());
    }
    allowed.first().cloned()
}

fn is_eligible(
    order: &SellOrder,
    payment_denom: &str,
    credit_type: Option<CreditType>,
    class_types: &HashMap<String, String>,
    now: DateTime<Utc>,
) -> bool {
    if order.disable_auto_retire || order.ask_denom != payment_denom {
        return false;
    }
    if matches!(order.expiration, Some(expiration) if expiration <= now) {
        return false;
    }
    if let Some(credit_type) = credit_type {
        let class_id = order.batch_denom.split('-').next().unwrap_or_default();
        match class_types.get(class_id) {
            Some(abbrev) => {
                if !credit_type.matches_class(abbrev) {
                    return false;
                }
            }
            // unknown class cannot prove a type match
            None => return false,
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use verdant_ledger::{CreditClass, MockLedgerClient};

    fn order(id: u64, ask: u128, quantity_micro: u128) -> SellOrder {
        SellOrder {
            id,
            batch_denom: format!("C01-{:03}", id),
            quantity_micro,
            ask_amount_micro: ask,
            ask_denom: "uverd".to_string(),
            disable_auto_retire: false,
            expiration: None,
        }
    }

    fn selector_with(orders: Vec<SellOrder>) -> OrderSelector {
        let ledger = MockLedgerClient::new();
        ledger.set_sell_orders(orders);
        ledger.set_allowed_denoms(vec![
            AllowedDenom {
                bank_denom: "uverd".to_string(),
                display_denom: "VERD".to_string(),
                exponent: 6,
            },
            AllowedDenom {
                bank_denom: "uusdc".to_string(),
                display_denom: "USDC".to_string(),
                exponent: 6,
            },
        ]);
        ledger.set_classes(vec![
            CreditClass {
                id: "C01".to_string(),
                credit_type_abbrev: "C".to_string(),
            },
            CreditClass {
                id: "BIO01".to_string(),
                credit_type_abbrev: "BIO".to_string(),
            },
        ]);
        OrderSelector::new(Arc::new(ledger), "uverd")
    }

    // ── Quantity mode ───────────────────────────────────────────────────

    #[tokio::test]
    async fn cheapest_first_fill_across_three_orders() {
        let selector = selector_with(vec![
            order(1, 2200, 2_000_000), // expensive
            order(2, 1000, 1_000_000), // cheapest
            order(3, 1500, 3_000_000), // mid
        ]);
        let selection = selector
            .select_best_orders(None, 3_500_000, None)
            .await
            .unwrap();

        let picked: Vec<(u64, u128)> = selection
            .orders
            .iter()
            .map(|s| (s.order.id, s.quantity_micro))
            .collect();
        assert_eq!(picked, vec![(2, 1_000_000), (3, 2_500_000)]);
        assert_eq!(selection.total_cost_micro, 4_750);
        assert_eq!(selection.total_quantity_micro, 3_500_000);
        assert!(!selection.insufficient_supply);
    }

    #[tokio::test]
    async fn insufficient_supply_is_flagged() {
        let selector = selector_with(vec![order(1, 1000, 1_000_000)]);
        let selection = selector
            .select_best_orders(None, 5_000_000, None)
            .await
            .unwrap();
        assert!(selection.insufficient_supply);
        assert_eq!(selection.total_quantity_micro, 1_000_000);
    }

    #[tokio::test]
    async fn cheapest_first_invariant_holds() {
        let selector = selector_with(vec![
            order(1, 900, 500_000),
            order(2, 300, 500_000),
            order(3, 700, 500_000),
            order(4, 500, 500_000),
        ]);
        let selection = selector
            .select_best_orders(None, 1_200_000, None)
            .await
            .unwrap();
        let max_selected = selection
            .orders
            .iter()
            .map(|s| s.order.ask_amount_micro)
            .max()
            .unwrap();
        // no unselected eligible order is strictly cheaper than any
        // selected one
        let selected_ids: Vec<u64> = selection.orders.iter().map(|s| s.order.id).collect();
        for unselected in [1u64, 3].iter().filter(|id| !selected_ids.contains(id)) {
            let ask = match unselected {
                1 => 900,
                3 => 700,
                _ => unreachable!(),
            };
            assert!(ask >= max_selected);
        }
    }

    #[tokio::test]
    async fn equal_asks_keep_input_order() {
        let selector = selector_with(vec![
            order(10, 1000, 1_000_000),
            order(11, 1000, 1_000_000),
        ]);
        let selection = selector
            .select_best_orders(None, 1_500_000, None)
            .await
            .unwrap();
        let ids: Vec<u64> = selection.orders.iter().map(|s| s.order.id).collect();
        assert_eq!(ids, vec![10, 11]);
    }

    // ── Budget mode ─────────────────────────────────────────────────────

    #[tokio::test]
    async fn budget_bounded_selection_never_overspends() {
        let selector = selector_with(vec![
            order(1, 1000, 1_000_000),
            order(2, 2000, 5_000_000),
        ]);
        let selection = selector
            .select_orders_for_budget(None, 3_500, None)
            .await
            .unwrap();

        let picked: Vec<(u64, u128, u128)> = selection
            .orders
            .iter()
            .map(|s| (s.order.id, s.quantity_micro, s.cost_micro))
            .collect();
        assert_eq!(picked, vec![(1, 1_000_000, 1_000), (2, 1_250_000, 2_500)]);
        assert_eq!(selection.total_cost_micro, 3_500);
        assert_eq!(selection.total_quantity_micro, 2_250_000);
        assert_eq!(selection.remaining_budget_micro, 0);
        assert!(selection.exhausted_budget);
    }

    #[tokio::test]
    async fn budget_sum_is_bounded_for_awkward_prices() {
        // price 7 forces ceil rounding on nearly every take
        let selector = selector_with(vec![
            order(1, 7, 10_000_000),
            order(2, 13, 10_000_000),
            order(3, 31, 10_000_000),
        ]);
        for budget in [1u128, 5, 49, 100, 333] {
            let selection = selector
                .select_orders_for_budget(None, budget, None)
                .await
                .unwrap();
            assert!(
                selection.total_cost_micro <= budget,
                "cost {} exceeds budget {}",
                selection.total_cost_micro,
                budget
            );
            assert_eq!(
                selection.remaining_budget_micro,
                budget - selection.total_cost_micro
            );
        }
    }

    #[tokio::test]
    async fn budget_larger_than_supply_is_not_exhausted() {
        let selector = selector_with(vec![order(1, 1000, 1_000_000)]);
        let selection = selector
            .select_orders_for_budget(None, 10_000, None)
            .await
            .unwrap();
        assert_eq!(selection.total_quantity_micro, 1_000_000);
        assert!(!selection.exhausted_budget);
        assert_eq!(selection.remaining_budget_micro, 9_000);
    }

    // ── Eligibility filters ─────────────────────────────────────────────

    #[tokio::test]
    async fn filters_disabled_foreign_denom_and_expired() {
        let mut disabled = order(1, 100, 1_000_000);
        disabled.disable_auto_retire = true;
        let mut foreign = order(2, 100, 1_000_000);
        foreign.ask_denom = "uusdc".to_string();
        let mut expired = order(3, 100, 1_000_000);
        expired.expiration = Some(Utc::now() - Duration::hours(1));
        let mut live = order(4, 100, 1_000_000);
        live.expiration = Some(Utc::now() + Duration::hours(1));

        let selector = selector_with(vec![disabled, foreign, expired, live]);
        let selection = selector
            .select_best_orders(None, 1_000_000, None)
            .await
            .unwrap();
        let ids: Vec<u64> = selection.orders.iter().map(|s| s.order.id).collect();
        assert_eq!(ids, vec![4]);
    }

    #[tokio::test]
    async fn credit_type_filter_uses_class_type() {
        let carbon = order(1, 100, 1_000_000);
        let mut bio = order(2, 50, 1_000_000);
        bio.batch_denom = "BIO01-001".to_string();

        let selector = selector_with(vec![carbon.clone(), bio.clone()]);
        let carbon_pick = selector
            .select_best_orders(Some(CreditType::Carbon), 1_000_000, None)
            .await
            .unwrap();
        assert_eq!(carbon_pick.orders[0].order.id, 1);

        let bio_pick = selector
            .select_best_orders(Some(CreditType::Biodiversity), 1_000_000, None)
            .await
            .unwrap();
        assert_eq!(bio_pick.orders[0].order.id, 2);
    }

    #[tokio::test]
    async fn preferred_denom_falls_back_to_native() {
        let selector = selector_with(vec![order(1, 100, 1_000_000)]);
        // preferred denom not in the allowed table → native token wins
        let selection = selector
            .select_best_orders(None, 1_000_000, Some("ibc/unknown"))
            .await
            .unwrap();
        assert_eq!(selection.payment_denom, "uverd");
        assert_eq!(selection.display_denom, "VERD");

        // a known preferred denom is honored (no uusdc orders though)
        let selection = selector
            .select_best_orders(None, 1_000_000, Some("uusdc"))
            .await
            .unwrap();
        assert_eq!(selection.payment_denom, "uusdc");
        assert!(selection.orders.is_empty());
        assert!(selection.insufficient_supply);
    }
}
