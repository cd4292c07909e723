//! Money Conversion Module
//!
//! Unified conversion between the chain's fixed-point representation and the
//! internal exact `Decimal`. All conversions MUST go through this module.
//!
//! ## Design Principles
//! 1. Never through floating point: asset strings are parsed digit by digit
//! 2. Explicit Error Handling: no silent truncation on input
//! 3. Quantities are stored at a fixed resolution, [`QTY_SCALE`]
//!
//! ## Chain Representation
//! - Assets arrive as `"<amount> <SYMBOL>"` strings, e.g. `"1.50000000 BTC"`.
//!   The number of fractional digits IS the asset precision.
//! - Prices arrive as integers scaled by the pool's `price_precision`,
//!   e.g. `10000` with precision 2 = `100.00`.
//!
//! ## Usage
//! ```rust
//! use dex_mirror::money::{parse_asset, scaled_price};
//!
//! let qty = parse_asset("1.50000000 BTC").unwrap();
//! assert_eq!(qty.precision, 8);
//! assert_eq!(qty.value().to_string(), "1.50000000");
//!
//! let price = scaled_price(10000, 2).unwrap();
//! assert_eq!(price.to_string(), "100.00");
//! ```

use rust_decimal::prelude::*;
use thiserror::Error;

/// Resolution of stored depth quantities (1e-8), equal to the dust threshold
pub const QTY_SCALE: u32 = 8;

/// Scale used when rendering aggregates for display
pub const DISPLAY_SCALE: u32 = 8;

/// Largest magnitude of a stored quantity, in units of 1e-8 (about 9.2e10
/// tokens). Kept below `i64::MAX` so a server-side bound check in floating
/// point can never let an integer increment overflow.
pub const MAX_QTY_UNITS: i64 = 9_200_000_000_000_000_000;

/// Largest scale `Decimal` can carry
const MAX_DECIMAL_SCALE: u32 = 28;

// ============================================================================
// Error Types
// ============================================================================

/// Money conversion errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MoneyError {
    #[error("Precision overflow: provided {provided} decimals, max allowed {max}")]
    PrecisionOverflow { provided: u32, max: u32 },

    #[error("Amount too large, would overflow")]
    Overflow,

    #[error("Invalid format: {0}")]
    InvalidFormat(String),
}

// ============================================================================
// Parse: Chain → Internal
// ============================================================================

/// A parsed on-chain asset: integer amount plus precision
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetAmount {
    /// Raw integer amount (value × 10^precision)
    pub amount: i128,
    /// Number of fractional digits
    pub precision: u32,
    /// Asset symbol, empty when the string carried a bare number
    pub symbol: String,
}

impl AssetAmount {
    /// Exact decimal value
    #[inline]
    pub fn value(&self) -> Decimal {
        Decimal::from_i128_with_scale(self.amount, self.precision)
    }
}

/// Parse a fixed-point asset string like `"1.50000000 BTC"` or `"-0.5 EOS"`.
///
/// A bare number (no symbol) is accepted, fee fields are often encoded that way.
///
/// # Errors
/// * `InvalidFormat` - empty, non-digit characters, multiple dots, missing digits
/// * `PrecisionOverflow` - more fractional digits than `Decimal` can hold
/// * `Overflow` - integer amount does not fit
pub fn parse_asset(raw: &str) -> Result<AssetAmount, MoneyError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(MoneyError::InvalidFormat("empty string".into()));
    }

    let mut parts = raw.split_whitespace();
    let number = parts
        .next()
        .ok_or_else(|| MoneyError::InvalidFormat("empty string".into()))?;
    let symbol = parts.next().unwrap_or("").to_string();
    if parts.next().is_some() {
        return Err(MoneyError::InvalidFormat(format!(
            "unexpected trailing data: {}",
            raw
        )));
    }

    let (negative, digits) = match number.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, number.strip_prefix('+').unwrap_or(number)),
    };

    let (whole, frac) = match digits.split_once('.') {
        None => (digits, ""),
        Some((w, f)) => {
            if f.contains('.') {
                return Err(MoneyError::InvalidFormat("multiple decimal points".into()));
            }
            if w.is_empty() || f.is_empty() {
                return Err(MoneyError::InvalidFormat(format!(
                    "missing digits around decimal point: {}",
                    number
                )));
            }
            (w, f)
        }
    };

    if whole.is_empty() {
        return Err(MoneyError::InvalidFormat("missing whole part".into()));
    }
    if !whole.bytes().all(|b| b.is_ascii_digit()) || !frac.bytes().all(|b| b.is_ascii_digit())
    {
        return Err(MoneyError::InvalidFormat(format!(
            "invalid character in amount: {}",
            number
        )));
    }

    let precision = frac.len() as u32;
    if precision > MAX_DECIMAL_SCALE {
        return Err(MoneyError::PrecisionOverflow {
            provided: precision,
            max: MAX_DECIMAL_SCALE,
        });
    }

    let mut amount: i128 = 0;
    for b in whole.bytes().chain(frac.bytes()) {
        amount = amount
            .checked_mul(10)
            .and_then(|v| v.checked_add((b - b'0') as i128))
            .ok_or(MoneyError::Overflow)?;
    }
    // Decimal mantissa is 96 bits
    if amount > (1i128 << 96) - 1 {
        return Err(MoneyError::Overflow);
    }
    if negative {
        amount = -amount;
    }

    Ok(AssetAmount {
        amount,
        precision,
        symbol,
    })
}

/// Parse an asset string straight to its decimal value
#[inline]
pub fn parse_asset_value(raw: &str) -> Result<Decimal, MoneyError> {
    parse_asset(raw).map(|a| a.value())
}

/// Convert an on-chain scaled integer price to `Decimal`
///
/// # Example
/// `scaled_price(10000, 2)` = `100.00`
pub fn scaled_price(raw: u64, price_precision: u32) -> Result<Decimal, MoneyError> {
    if price_precision > MAX_DECIMAL_SCALE {
        return Err(MoneyError::PrecisionOverflow {
            provided: price_precision,
            max: MAX_DECIMAL_SCALE,
        });
    }
    Ok(Decimal::from_i128_with_scale(raw as i128, price_precision))
}

// ============================================================================
// Internal quantity resolution
// ============================================================================

/// Truncate a quantity to the stored resolution ([`QTY_SCALE`])
#[inline]
pub fn normalize_qty(qty: Decimal) -> Decimal {
    qty.trunc_with_scale(QTY_SCALE)
}

/// Quantity → integer units of 1e-8 (server-side integer arithmetic)
///
/// # Errors
/// `Overflow` when the magnitude exceeds [`MAX_QTY_UNITS`]
pub fn qty_to_units(qty: Decimal) -> Result<i64, MoneyError> {
    let scaled = normalize_qty(qty)
        .checked_mul(Decimal::from(10i64.pow(QTY_SCALE)))
        .ok_or(MoneyError::Overflow)?;
    let units = scaled.trunc().to_i64().ok_or(MoneyError::Overflow)?;
    if units.unsigned_abs() > MAX_QTY_UNITS as u64 {
        return Err(MoneyError::Overflow);
    }
    Ok(units)
}

/// Integer units of 1e-8 → quantity
#[inline]
pub fn units_to_qty(units: i64) -> Decimal {
    Decimal::new(units, QTY_SCALE)
}

// ============================================================================
// Format: Internal → Display
// ============================================================================

/// Render an aggregate for display: truncated to [`DISPLAY_SCALE`], without
/// trailing zeros. Zero and negatives render as `"0"`.
pub fn format_qty(qty: Decimal) -> String {
    let truncated = qty.trunc_with_scale(DISPLAY_SCALE);
    if truncated <= Decimal::ZERO {
        return "0".to_string();
    }
    truncated.normalize().to_string()
}
