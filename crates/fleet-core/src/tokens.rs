//! Token counts used for usage accounting and limits.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign};

/// A number of model tokens. Arithmetic saturates.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct TokenCount(u64);

impl TokenCount {
    pub const fn new(count: u64) -> Self {
        Self(count)
    }

    pub const fn zero() -> Self {
        Self(0)
    }

    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    pub const fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub const fn saturating_sub(self, rhs: Self) -> Self {
        Self(self.0.saturating_sub(rhs.0))
    }

    /// How much of `limit` this count uses, in percent.
    ///
    /// A zero limit means "no limit" and always yields 0.
    pub fn percent_of(self, limit: Self) -> f64 {
        match limit.0 {
            0 => 0.0,
            // Multiply first so whole percentages stay exact
            limit => self.0 as f64 * 100.0 / limit as f64,
        }
    }
}

impl Add for TokenCount {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self(self.0.saturating_add(rhs.0))
    }
}

impl AddAssign for TokenCount {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl Sum for TokenCount {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::zero(), Add::add)
    }
}

impl From<u64> for TokenCount {
    fn from(count: u64) -> Self {
        Self(count)
    }
}

/// Compact form for logs and dashboards: `950`, `12.5k`, `2.00M`.
impl fmt::Display for TokenCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let n = self.0 as f64;
        match self.0 {
            0..=999 => write!(f, "{}", self.0),
            1_000..=999_999 => write!(f, "{:.1}k", n / 1e3),
            _ => write!(f, "{:.2}M", n / 1e6),
        }
    }
}
