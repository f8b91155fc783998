//! # Money & Quantity Arithmetic
//!
//! Integer-only conversions between the three value domains the
//! orchestrator touches:
//!
//! | Domain | Type | Unit |
//! |--------|------|------|
//! | Fiat gateway | `u64` | USD cents |
//! | Ledger prices/costs | `u128` | micro-units of the payment denom |
//! | Credit quantities | `u128` | micro-credits (1 credit = 1e6) |
//!
//! ## Rounding Rules
//!
//! - Charging fiat for an on-chain amount rounds **up**
//!   (`cents = ceil(micro / 10_000)`): the gateway must never collect less
//!   than the chain will spend.
//! - Fee reductions round the fee **down** (floored basis points), so the
//!   spendable budget is never understated by more than one cent.
//! - Quantity strings carry exactly six fractional digits.

/// Micro-units per whole credit or token.
pub const MICRO_PER_UNIT: u128 = 1_000_000;

/// Micro-units of a USDC-equivalent denom per USD cent.
pub const MICRO_PER_CENT: u128 = 10_000;

/// Basis-point denominator (10_000 = 100%).
pub const BPS_DENOM: u128 = 10_000;

/// Errors from quantity parsing and conversion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MoneyError {
    /// String is not a base-10 decimal with at most six fractional digits.
    InvalidQuantity(String),
    /// Conversion target cannot represent the value.
    Overflow,
}

impl std::fmt::Display for MoneyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MoneyError::InvalidQuantity(s) => write!(f, "invalid quantity string: {:?}", s),
            MoneyError::Overflow => write!(f, "quantity out of representable range"),
        }
    }
}

impl std::error::Error for MoneyError {}

/// Ceiling division. `denom` must be non-zero.
pub fn ceil_div(numer: u128, denom: u128) -> u128 {
    debug_assert!(denom != 0);
    numer / denom + u128::from(numer % denom != 0)
}

/// USD cents needed to cover `micro` micro-units of a USDC-equivalent
/// denom. Rounds up so the fiat charge always covers the on-chain cost.
pub fn cents_from_usdc_micro(micro: u128) -> Result<u64, MoneyError> {
    let cents = ceil_div(micro, MICRO_PER_CENT);
    u64::try_from(cents).map_err(|_| MoneyError::Overflow)
}

/// Micro-units of a USDC-equivalent denom worth `cents` USD cents.
pub fn usdc_micro_from_cents(cents: u64) -> u128 {
    u128::from(cents) * MICRO_PER_CENT
}

/// Reduce `cents` by `fee_bps` basis points. The fee itself is floored,
/// so the remaining budget is the ceiling of the post-fee fraction.
pub fn apply_fee_bps(cents: u64, fee_bps: u32) -> u64 {
    let fee = u128::from(cents) * u128::from(fee_bps.min(10_000)) / BPS_DENOM;
    // fee <= cents, cast back is safe
    cents - fee as u64
}

/// Render micro-quantity as a decimal string with exactly six fractional
/// digits, e.g. `2_500_000` → `"2.500000"`.
pub fn format_quantity_micro(micro: u128) -> String {
    format!("{}.{:06}", micro / MICRO_PER_UNIT, micro % MICRO_PER_UNIT)
}

/// Parse a decimal quantity string into micro-units.
///
/// Accepts an optional fractional part of at most six digits. Anything
/// else (sign, exponent, empty parts, seven-plus decimals) is rejected.
pub fn parse_quantity_micro(s: &str) -> Result<u128, MoneyError> {
    let reject = || MoneyError::InvalidQuantity(s.to_string());

    let (whole, frac) = match s.split_once('.') {
        Some((w, f)) => (w, f),
        None => (s, ""),
    };

    if whole.is_empty() && frac.is_empty() {
        return Err(reject());
    }
    if frac.len() > 6 {
        return Err(reject());
    }
    if !whole.chars().all(|c| c.is_ascii_digit()) || !frac.chars().all(|c| c.is_ascii_digit()) {
        return Err(reject());
    }

    let whole_part: u128 = if whole.is_empty() {
        0
    } else {
        whole.parse().map_err(|_| reject())?
    };

    let mut frac_part: u128 = if frac.is_empty() {
        0
    } else {
        frac.parse().map_err(|_| reject())?
    };
    // Scale e.g. "25" (two digits) to 250_000 micro.
    for _ in frac.len()..6 {
        frac_part *= 10;
    }

    whole_part
        .checked_mul(MICRO_PER_UNIT)
        .and_then(|w| w.checked_add(frac_part))
        .ok_or(MoneyError::Overflow)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ceil_div_rounds_up_only_on_remainder() {
        assert_eq!(ceil_div(10, 5), 2);
        assert_eq!(ceil_div(11, 5), 3);
        assert_eq!(ceil_div(0, 5), 0);
    }

    #[test]
    fn cents_cover_micro_cost() {
        // 1 cent = 10_000 micro exactly
        assert_eq!(cents_from_usdc_micro(10_000).unwrap(), 1);
        // one micro over a cent boundary charges the next cent
        assert_eq!(cents_from_usdc_micro(10_001).unwrap(), 2);
        assert_eq!(cents_from_usdc_micro(0).unwrap(), 0);
    }

    #[test]
    fn cents_micro_round_trip_never_undercharges() {
        for micro in [1u128, 9_999, 10_000, 123_456_789, 1] {
            let cents = cents_from_usdc_micro(micro).unwrap();
            assert!(usdc_micro_from_cents(cents) >= micro);
        }
    }

    #[test]
    fn fee_is_floored() {
        // 2.5% of 999 cents = 24.975 → fee 24, budget 975
        assert_eq!(apply_fee_bps(999, 250), 975);
        assert_eq!(apply_fee_bps(100, 0), 100);
        assert_eq!(apply_fee_bps(100, 10_000), 0);
        // over-100% clamps rather than underflowing
        assert_eq!(apply_fee_bps(100, 20_000), 0);
    }

    #[test]
    fn quantity_formatting_pads_to_six() {
        assert_eq!(format_quantity_micro(0), "0.000000");
        assert_eq!(format_quantity_micro(2_500_000), "2.500000");
        assert_eq!(format_quantity_micro(1), "0.000001");
        assert_eq!(format_quantity_micro(3_500_001), "3.500001");
    }

    #[test]
    fn quantity_parsing_accepts_short_fractions() {
        assert_eq!(parse_quantity_micro("3.5").unwrap(), 3_500_000);
        assert_eq!(parse_quantity_micro("3").unwrap(), 3_000_000);
        assert_eq!(parse_quantity_micro(".5").unwrap(), 500_000);
        assert_eq!(parse_quantity_micro("0.000001").unwrap(), 1);
    }

    #[test]
    fn quantity_parsing_rejects_junk() {
        for bad in ["", ".", "1.2345678", "-1", "1e3", "1.2.3", "abc", "1,5"] {
            assert!(parse_quantity_micro(bad).is_err(), "accepted {:?}", bad);
        }
    }

    #[test]
    fn format_parse_round_trip() {
        for micro in [0u128, 1, 999_999, 1_000_000, 3_500_000, 123_456_789_012] {
            assert_eq!(parse_quantity_micro(&format_quantity_micro(micro)).unwrap(), micro);
        }
    }
}
