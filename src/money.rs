//! Money handling
//!
//! All amounts are stored internally as `i64` paise (10^-2 rupees). Decimal
//! values only exist at the API boundary; arithmetic on stored amounts is
//! integer arithmetic, so order totals compare exactly.

use rust_decimal::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Scale factor: paise per rupee.
const SCALE: u32 = 2;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MoneyError {
    #[error("amount is negative")]
    Negative,
    #[error("amount out of range")]
    Overflow,
}

/// A non-negative monetary amount in paise.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize, Hash,
)]
#[serde(transparent)]
pub struct Paise(i64);

impl Paise {
    pub const ZERO: Paise = Paise(0);

    /// Construct from a raw paise count (e.g. a database column).
    pub fn from_raw(raw: i64) -> Result<Self, MoneyError> {
        if raw < 0 {
            return Err(MoneyError::Negative);
        }
        Ok(Self(raw))
    }

    /// Construct from a rupee amount (e.g. "10.50").
    pub fn from_rupees(amount: Decimal) -> Result<Self, MoneyError> {
        if amount.is_sign_negative() {
            return Err(MoneyError::Negative);
        }
        let scaled = (amount * Decimal::from(100u32)).round();
        scaled.to_i64().map(Self).ok_or(MoneyError::Overflow)
    }

    pub fn to_raw(self) -> i64 {
        self.0
    }

    pub fn to_rupees(self) -> Decimal {
        Decimal::new(self.0, SCALE)
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn checked_add(self, other: Self) -> Option<Self> {
        self.0.checked_add(other.0).map(Self)
    }

    /// Line total: unit price times quantity.
    pub fn checked_mul_qty(self, qty: u32) -> Option<Self> {
        self.0.checked_mul(i64::from(qty)).map(Self)
    }
}

impl fmt::Display for Paise {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "₹{}.{:02}", self.0 / 100, self.0 % 100)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rupee_round_trip() {
        let p = Paise::from_rupees(Decimal::new(1050, 2)).unwrap();
        assert_eq!(p.to_raw(), 1050);
        assert_eq!(p.to_rupees(), Decimal::new(1050, 2));
        assert_eq!(p.to_string(), "₹10.50");
    }

    #[test]
    fn line_total_is_exact() {
        let unit = Paise::from_raw(1000).unwrap();
        let total = unit.checked_mul_qty(2).unwrap();
        assert_eq!(total, Paise::from_raw(2000).unwrap());
    }

    #[test]
    fn negative_rejected() {
        assert_eq!(Paise::from_raw(-1), Err(MoneyError::Negative));
        assert_eq!(
            Paise::from_rupees(Decimal::new(-100, 2)),
            Err(MoneyError::Negative)
        );
    }
}
