use std::fmt;
use std::iter::Sum;
use std::ops::Add;
use std::str::FromStr;

use bigdecimal::{BigDecimal, FromPrimitive, Signed, ToPrimitive, Zero};

/// Number of fractional digits stored for every amount (NUMERIC(4,2)).
pub const SCALE: i64 = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MoneyError {
    Invalid,
    OutOfRange,
}

/// Non-negative currency amount below 100.00, held at scale 2.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Money(BigDecimal);

impl Money {
    // "$1,234.56" -> 1234.56 before range validation
    pub fn parse(input: &str) -> Result<Self, MoneyError> {
        let cleaned: String = input
            .trim()
            .trim_start_matches('$')
            .trim()
            .chars()
            .filter(|c| *c != ',')
            .collect();
        if cleaned.is_empty() || !cleaned.chars().all(|c| c.is_ascii_digit() || c == '.') {
            // catches signs, exponents and stray currency text
            return Err(MoneyError::Invalid);
        }
        let fraction_digits = match cleaned.split_once('.') {
            Some((int, frac)) if int.is_empty() || frac.is_empty() || frac.contains('.') => {
                return Err(MoneyError::Invalid)
            }
            Some((_, frac)) => frac.len(),
            None => 0,
        };
        if fraction_digits > SCALE as usize {
            return Err(MoneyError::Invalid);
        }
        let value = BigDecimal::from_str(&cleaned).map_err(|_| MoneyError::Invalid)?;
        Self::from_decimal(value)
    }

    pub fn from_decimal(value: BigDecimal) -> Result<Self, MoneyError> {
        if value.is_negative() || value >= BigDecimal::from(100) {
            return Err(MoneyError::OutOfRange);
        }
        Ok(Money(value.with_scale(SCALE)))
    }

    /// Re-quantise a REAL read back from sqlite.
    pub fn from_f64(value: f64) -> Result<Self, MoneyError> {
        let value = BigDecimal::from_f64(value).ok_or(MoneyError::Invalid)?;
        Self::from_decimal(value.round(SCALE))
    }

    pub fn to_f64(&self) -> f64 {
        self.0.to_f64().unwrap_or_default()
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Money {
    type Err = MoneyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Money::parse(s)
    }
}

// Sums are not range checked: a total of line items may legitimately be
// compared against a parent amount and rejected by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MoneySum(BigDecimal);

impl MoneySum {
    pub fn matches(&self, amount: &Money) -> bool {
        self.0 == amount.0
    }
}

impl fmt::Display for MoneySum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.with_scale(SCALE))
    }
}

impl Add<&Money> for MoneySum {
    type Output = MoneySum;

    fn add(self, rhs: &Money) -> MoneySum {
        MoneySum(self.0 + &rhs.0)
    }
}

impl<'a> Sum<&'a Money> for MoneySum {
    fn sum<I: Iterator<Item = &'a Money>>(iter: I) -> Self {
        iter.fold(MoneySum(BigDecimal::zero()), |acc, m| acc + m)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_amounts() {
        assert_eq!(Money::parse("$12.50").unwrap().to_string(), "12.50");
        assert_eq!(Money::parse("$1.5").unwrap().to_string(), "1.50");
        assert_eq!(Money::parse("3").unwrap().to_string(), "3.00");
        assert_eq!(Money::parse(" $ 0.75 ").unwrap().to_string(), "0.75");
        assert_eq!(Money::parse("$0.00").unwrap(), Money::parse("0").unwrap());
    }

    #[test]
    fn test_parse_rejects_out_of_range() {
        assert_eq!(Money::parse("$1234.56"), Err(MoneyError::OutOfRange));
        assert_eq!(Money::parse("$1,234.56"), Err(MoneyError::OutOfRange));
        assert_eq!(Money::parse("$100.00"), Err(MoneyError::OutOfRange));
        assert!(Money::parse("$99.99").is_ok());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        for input in ["", "$", "-$1.00", "$-1.00", "1.234", "1e2", "$1.", "$.50", "1.2.3", "USD 4"] {
            assert_eq!(Money::parse(input), Err(MoneyError::Invalid), "input: {input:?}");
        }
    }

    #[test]
    fn test_f64_boundary() {
        let amount = Money::parse("$7.35").unwrap();
        let restored = Money::from_f64(amount.to_f64()).unwrap();
        assert_eq!(restored, amount);
        assert_eq!(restored.to_string(), "7.35");
    }

    #[test]
    fn test_sum_matches() {
        let lines = [Money::parse("5.00").unwrap(), Money::parse("7.50").unwrap()];
        let total: MoneySum = lines.iter().sum();
        assert!(total.matches(&Money::parse("12.50").unwrap()));
        assert!(!total.matches(&Money::parse("12.49").unwrap()));
        assert_eq!(total.to_string(), "12.50");
    }
}
