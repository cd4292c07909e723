//! Precision bucketing
//!
//! Maps a raw price to its display bucket for every supported precision step.
//! Rounding is asymmetric so a coarse view never shows liquidity at a price
//! more aggressive than what actually rests in the book:
//!
//! | Side | Bucket |
//! |------|--------|
//! | Buy  | `floor(price / step) * step` |
//! | Sell | `ceil(price / step) * step`  |

use std::fmt;

use rust_decimal::{Decimal, RoundingStrategy};

use crate::models::Side;

/// Supported precision steps, finest to coarsest.
pub const SUPPORTED_PRECISIONS: &[&str] = &[
    "0.00000001",
    "0.0000001",
    "0.000001",
    "0.00001",
    "0.0001",
    "0.001",
    "0.01",
    "0.1",
    "1",
    "10",
    "100",
    "1000",
    "10000",
];

/// Step exponents matching [`SUPPORTED_PRECISIONS`] (step = 10^exp)
const STEP_EXPONENTS: [i32; 13] = [-8, -7, -6, -5, -4, -3, -2, -1, 0, 1, 2, 3, 4];

/// One precision step, stored as its index into [`SUPPORTED_PRECISIONS`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Precision(u8);

impl Precision {
    /// Finest supported step (default display precision)
    #[inline]
    pub fn finest() -> Precision {
        Precision(0)
    }

    /// All supported precisions, finest first
    pub fn all() -> impl Iterator<Item = Precision> {
        (0..SUPPORTED_PRECISIONS.len() as u8).map(Precision)
    }

    /// Parse a precision string. Accepts any decimal spelling of a supported
    /// step ("0.01", "0.010", "1.0").
    pub fn parse(raw: &str) -> Option<Precision> {
        let wanted: Decimal = raw.trim().parse().ok()?;
        Precision::all().find(|p| p.step() == wanted)
    }

    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }

    #[inline]
    pub fn as_str(self) -> &'static str {
        SUPPORTED_PRECISIONS[self.index()]
    }

    /// Step size as an exact decimal
    pub fn step(self) -> Decimal {
        let exp = STEP_EXPONENTS[self.index()];
        if exp < 0 {
            Decimal::new(1, exp.unsigned_abs())
        } else {
            Decimal::from(10i64.pow(exp as u32))
        }
    }

    /// Decimal places used to render bucket prices at this precision
    #[inline]
    pub fn display_scale(self) -> u32 {
        let exp = STEP_EXPONENTS[self.index()];
        if exp < 0 { exp.unsigned_abs() } else { 0 }
    }
}

impl fmt::Display for Precision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Compute the display bucket for `price` on `side` at `precision`.
pub fn bucket_price(price: Decimal, side: Side, precision: Precision) -> Decimal {
    let step = precision.step();
    let units = price / step;
    let rounded = match side {
        Side::Buy => units.floor(),
        Side::Sell => units.ceil(),
    };
    let mut bucket = rounded * step;
    bucket.rescale(precision.display_scale());
    bucket
}

/// Buckets for `price` at every supported precision, finest first
pub fn bucket_all(price: Decimal, side: Side) -> Vec<(Precision, Decimal)> {
    Precision::all()
        .map(|p| (p, bucket_price(price, side, p)))
        .collect()
}

/// Render a bucket price with the precision's decimal places
pub fn format_bucket(bucket: Decimal, precision: Precision) -> String {
    let scale = precision.display_scale();
    let mut rendered = bucket.round_dp_with_strategy(scale, RoundingStrategy::ToZero);
    rendered.rescale(scale);
    rendered.to_string()
}
