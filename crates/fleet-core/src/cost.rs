//! USD amounts charged for token usage.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign};

use crate::TokenCount;

const MICROS_PER_USD: f64 = 1_000_000.0;

/// A USD amount held in whole microdollars, so sums of sub-cent request
/// costs stay exact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Money(i64);

impl Money {
    pub const fn zero() -> Self {
        Self(0)
    }

    pub fn from_usd(usd: f64) -> Self {
        Self((usd * MICROS_PER_USD).round() as i64)
    }

    pub const fn from_microdollars(micros: i64) -> Self {
        Self(micros)
    }

    /// Cost of `tokens` at `price_per_thousand` USD per 1000 tokens.
    pub fn for_tokens(tokens: TokenCount, price_per_thousand: f64) -> Self {
        Self::from_usd(tokens.as_u64() as f64 * price_per_thousand / 1000.0)
    }

    pub fn as_usd(&self) -> f64 {
        self.0 as f64 / MICROS_PER_USD
    }

    pub const fn as_microdollars(&self) -> i64 {
        self.0
    }

    pub const fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub const fn is_negative(&self) -> bool {
        self.0 < 0
    }
}

impl Add for Money {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self(self.0.saturating_add(rhs.0))
    }
}

impl AddAssign for Money {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl Sum for Money {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::zero(), Add::add)
    }
}

impl<'a> Sum<&'a Money> for Money {
    fn sum<I: Iterator<Item = &'a Money>>(iter: I) -> Self {
        iter.copied().sum()
    }
}

// Serialized as plain dollars
impl Serialize for Money {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(self.as_usd())
    }
}

impl<'de> Deserialize<'de> for Money {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        f64::deserialize(deserializer).map(Self::from_usd)
    }
}

/// Four decimals below a cent so single requests stay readable, two above.
impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let usd = self.as_usd();
        if usd != 0.0 && usd.abs() < 0.01 {
            write!(f, "${usd:.4}")
        } else {
            write!(f, "${usd:.2}")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_micro_amounts_do_not_drift() {
        let total: Money = std::iter::repeat(Money::from_usd(0.000_3)).take(10_000).sum();
        assert_eq!(total.as_microdollars(), 3_000_000);
        assert_eq!(total, Money::from_usd(3.0));
    }

    #[test]
    fn test_for_tokens() {
        let cost = Money::for_tokens(TokenCount::new(1_500), 0.015);
        assert_eq!(cost.as_microdollars(), 22_500);
        assert!(Money::for_tokens(TokenCount::new(1_500), 0.0).is_zero());
    }

    #[test]
    fn test_display() {
        assert_eq!(Money::from_usd(0.0225).to_string(), "$0.0225");
        assert_eq!(Money::from_usd(1.5).to_string(), "$1.50");
        assert_eq!(Money::zero().to_string(), "$0.00");
        assert_eq!(Money::from_usd(1234.567).to_string(), "$1234.57");
    }

    #[test]
    fn test_json_is_plain_dollars() {
        let json = serde_json::to_string(&Money::from_usd(0.25)).unwrap();
        assert_eq!(json, "0.25");
        let back: Money = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Money::from_usd(0.25));
        assert!(Money::from_usd(-0.5).is_negative());
    }
}
