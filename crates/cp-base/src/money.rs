use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A USD amount represented as a fixed-point decimal, never a float.
///
/// Billing math (costs, balances, ledger entries) must not accumulate
/// floating-point rounding error across many small charges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Money(Decimal);

impl Money {
    pub const ZERO: Money = Money(Decimal::ZERO);

    pub fn from_decimal(amount: Decimal) -> Self {
        Self(amount)
    }

    pub fn as_decimal(&self) -> Decimal {
        self.0
    }

    pub fn is_negative(&self) -> bool {
        self.0.is_sign_negative() && !self.0.is_zero()
    }

    pub fn checked_sub(&self, other: Money) -> Option<Money> {
        self.0.checked_sub(other.0).map(Money)
    }

    pub fn checked_add(&self, other: Money) -> Option<Money> {
        self.0.checked_add(other.0).map(Money)
    }
}

impl std::ops::Add for Money {
    type Output = Money;

    fn add(self, rhs: Money) -> Money {
        Money(self.0 + rhs.0)
    }
}

impl std::ops::Sub for Money {
    type Output = Money;

    fn sub(self, rhs: Money) -> Money {
        Money(self.0 - rhs.0)
    }
}

impl std::fmt::Display for Money {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "${}", self.0)
    }
}

impl From<Decimal> for Money {
    fn from(d: Decimal) -> Self {
        Money(d)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn add_and_sub_are_exact() {
        let a = Money::from_decimal(dec!(0.1));
        let b = Money::from_decimal(dec!(0.2));
        assert_eq!((a + b).as_decimal(), dec!(0.3));
    }

    #[test]
    fn checked_sub_rejects_overflow() {
        let a = Money::from_decimal(Decimal::MIN);
        let b = Money::from_decimal(dec!(1));
        assert!(a.checked_sub(b).is_none());
    }
}
