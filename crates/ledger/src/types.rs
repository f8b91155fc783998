//! Read models and the buy-direct message shape.
//!
//! Wire JSON from the ledger REST surface carries every numeric amount as
//! a string; conversion into `u128` micro-units happens here, at the
//! boundary, so nothing downstream ever touches a decimal string for
//! arithmetic.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use verdant_common::money::{format_quantity_micro, parse_quantity_micro, MoneyError};

/// A marketplace sell order for a credit batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SellOrder {
    pub id: u64,
    /// Batch denom, e.g. `C01-001-20240101-20241231-001`.
    pub batch_denom: String,
    /// Credits offered, in micro-credits.
    pub quantity_micro: u128,
    /// Price per whole credit, in micro-units of `ask_denom`.
    pub ask_amount_micro: u128,
    pub ask_denom: String,
    /// Seller opted out of automatic retirement on purchase.
    pub disable_auto_retire: bool,
    pub expiration: Option<DateTime<Utc>>,
}

/// A credit class, carrying the credit-type abbreviation used for
/// carbon/biodiversity matching ("C" is carbon).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditClass {
    pub id: String,
    pub credit_type_abbrev: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub class_id: String,
    pub jurisdiction: String,
}

/// A denom the marketplace accepts as payment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllowedDenom {
    /// Bank denom, e.g. `uverd` or `ibc/…USDC`.
    pub bank_denom: String,
    /// Human denom, e.g. `VERD` or `USDC`.
    pub display_denom: String,
    pub exponent: u32,
}

/// A retirement row from the indexer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetirementRecord {
    pub node_id: String,
    /// Retired quantity as a 6-decimal string.
    pub amount: String,
    pub batch_denom: String,
    pub owner: String,
    pub jurisdiction: String,
    pub reason: String,
    pub timestamp: String,
    pub tx_hash: String,
    pub block_height: u64,
}

/// Outcome of a broadcast, mirrored from the chain's tx response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastResult {
    /// 0 means accepted; anything else is a chain-side rejection.
    pub code: u32,
    pub tx_hash: String,
    pub height: u64,
    pub raw_log: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coin {
    pub denom: String,
    /// Micro-units, stringly on the wire.
    pub amount: String,
}

/// One order inside a buy-direct message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuyOrder {
    pub sell_order_id: u64,
    /// Quantity as a 6-decimal string.
    pub quantity: String,
    pub bid_price: Coin,
    pub disable_auto_retire: bool,
    pub retirement_jurisdiction: String,
    pub retirement_reason: String,
}

/// The buy-direct message broadcast for each retirement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgBuyDirect {
    pub buyer: String,
    pub orders: Vec<BuyOrder>,
}

impl BuyOrder {
    /// Build an order taking `quantity_micro` micro-credits from `order`
    /// at its ask price.
    pub fn for_sell_order(
        order: &SellOrder,
        quantity_micro: u128,
        jurisdiction: &str,
        reason: &str,
    ) -> Self {
        BuyOrder {
            sell_order_id: order.id,
            quantity: format_quantity_micro(quantity_micro),
            bid_price: Coin {
                denom: order.ask_denom.clone(),
                amount: order.ask_amount_micro.to_string(),
            },
            disable_auto_retire: false,
            retirement_jurisdiction: jurisdiction.to_string(),
            retirement_reason: reason.to_string(),
        }
    }
}

// ── Wire shapes ─────────────────────────────────────────────────────────
//
// REST list endpoints wrap rows and keep integers as strings. These
// private mirrors deserialize the raw payload; `TryFrom` converts into
// the typed models above.

#[derive(Debug, Deserialize)]
pub(crate) struct SellOrderWire {
    pub id: String,
    pub batch_denom: String,
    pub quantity: String,
    pub ask_amount: String,
    pub ask_denom: String,
    #[serde(default)]
    pub disable_auto_retire: bool,
    #[serde(default)]
    pub expiration: Option<DateTime<Utc>>,
}

impl TryFrom<SellOrderWire> for SellOrder {
    type Error = MoneyError;

    fn try_from(wire: SellOrderWire) -> Result<Self, Self::Error> {
        let id = wire
            .id
            .parse::<u64>()
            .map_err(|_| MoneyError::InvalidQuantity(wire.id.clone()))?;
        let ask_amount_micro = wire
            .ask_amount
            .parse::<u128>()
            .map_err(|_| MoneyError::InvalidQuantity(wire.ask_amount.clone()))?;
        Ok(SellOrder {
            id,
            batch_denom: wire.batch_denom,
            quantity_micro: parse_quantity_micro(&wire.quantity)?,
            ask_amount_micro,
            ask_denom: wire.ask_denom,
            disable_auto_retire: wire.disable_auto_retire,
            expiration: wire.expiration,
        })
    }
}
