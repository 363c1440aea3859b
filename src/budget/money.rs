//! Monetary amounts
//!
//! A thin wrapper over [`rust_decimal::Decimal`] limited to six fractional
//! digits. Negative values are legal results of
//! `allocated - spent - committed`; they are never legal stored commitments.

use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign, Neg, Sub, SubAssign};
use std::str::FromStr;
use thiserror::Error;

const MAX_SCALE: u32 = 6;

/// Monetary amount with micro-unit precision
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Money(Decimal);

/// Errors parsing a monetary amount
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MoneyParseError {
    #[error("empty amount")]
    Empty,

    #[error("invalid amount: {0}")]
    Invalid(String),

    #[error("amount {0} has more than 6 fractional digits")]
    TooPrecise(String),
}

impl Money {
    pub const ZERO: Money = Money(Decimal::ZERO);

    pub fn from_micros(micros: i64) -> Self {
        Self(Decimal::new(micros, MAX_SCALE))
    }

    pub fn from_cents(cents: i64) -> Self {
        Self(Decimal::new(cents, 2))
    }

    pub fn from_units(units: i64) -> Self {
        Self(Decimal::from(units))
    }

    /// Convert from a floating point amount, rounding to the nearest micro.
    /// Returns `None` for NaN and infinities.
    pub fn from_f64(amount: f64) -> Option<Self> {
        Decimal::from_f64(amount).map(|d| Self(d.round_dp(MAX_SCALE)))
    }

    pub fn amount(self) -> Decimal {
        self.0
    }

    pub fn as_f64(self) -> f64 {
        self.0.to_f64().unwrap_or_default()
    }

    pub fn is_negative(self) -> bool {
        self.0.is_sign_negative() && !self.0.is_zero()
    }

    pub fn is_positive(self) -> bool {
        self.0.is_sign_positive() && !self.0.is_zero()
    }

    pub fn is_zero(self) -> bool {
        self.0.is_zero()
    }

    /// Clamp to zero from below
    pub fn non_negative(self) -> Self {
        self.max(Money::ZERO)
    }

    pub fn abs(self) -> Self {
        Self(self.0.abs())
    }
}

impl TryFrom<Decimal> for Money {
    type Error = MoneyParseError;

    fn try_from(value: Decimal) -> Result<Self, Self::Error> {
        if value.scale() > MAX_SCALE && value.normalize().scale() > MAX_SCALE {
            return Err(MoneyParseError::TooPrecise(value.to_string()));
        }
        Ok(Self(value))
    }
}

impl Add for Money {
    type Output = Money;

    fn add(self, rhs: Money) -> Money {
        Money(self.0.saturating_add(rhs.0))
    }
}

impl Sub for Money {
    type Output = Money;

    fn sub(self, rhs: Money) -> Money {
        Money(self.0.saturating_sub(rhs.0))
    }
}

impl Neg for Money {
    type Output = Money;

    fn neg(self) -> Money {
        Money(-self.0)
    }
}

impl AddAssign for Money {
    fn add_assign(&mut self, rhs: Money) {
        *self = *self + rhs;
    }
}

impl SubAssign for Money {
    fn sub_assign(&mut self, rhs: Money) {
        *self = *self - rhs;
    }
}

impl Sum for Money {
    fn sum<I: Iterator<Item = Money>>(iter: I) -> Money {
        iter.fold(Money::ZERO, Add::add)
    }
}

impl fmt::Display for Money {
    /// Renders at least two fractional digits, more only when needed
    /// (`100.00`, `0.015`, `-3.50`).
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut value = self.0.normalize();
        if value.scale() < 2 {
            value.rescale(2);
        }
        write!(f, "{}", value)
    }
}

impl FromStr for Money {
    type Err = MoneyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(MoneyParseError::Empty);
        }
        let value = Decimal::from_str_exact(s.strip_prefix('+').unwrap_or(s))
            .map_err(|_| MoneyParseError::Invalid(s.to_string()))?;
        if value.scale() > MAX_SCALE {
            return Err(MoneyParseError::TooPrecise(s.to_string()));
        }
        Ok(Self(value))
    }
}

impl Serialize for Money {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Money {
    /// Accepts strings and JSON numbers alike (`"12.50"`, `12.5`, `12`)
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = <Decimal as Deserialize>::deserialize(deserializer)?;
        Money::try_from(value).map_err(de::Error::custom)
    }
}
