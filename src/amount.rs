//! Native asset amounts
//!
//! Balances are carried as integer stroops (one stroop = 0.0000001 of the
//! native asset) so reserve and fee arithmetic never touches floating point.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::ops::{Add, Sub};
use std::str::FromStr;

pub const STROOPS_PER_UNIT: i64 = 10_000_000;
const DECIMALS: usize = 7;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Amount(i64);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AmountParseError {
    #[error("empty amount")]
    Empty,
    #[error("invalid amount {0:?}")]
    Invalid(String),
    #[error("amount {0:?} has more than 7 decimal places")]
    TooPrecise(String),
    #[error("amount {0:?} is out of range")]
    Overflow(String),
}

impl Amount {
    pub const ZERO: Amount = Amount(0);

    pub const fn from_stroops(stroops: i64) -> Self {
        Self(stroops)
    }

    pub const fn stroops(self) -> i64 {
        self.0
    }

    pub fn is_positive(self) -> bool {
        self.0 > 0
    }

    pub fn saturating_sub(self, other: Amount) -> Amount {
        Amount(self.0.saturating_sub(other.0))
    }

    pub fn checked_mul(self, factor: i64) -> Option<Amount> {
        self.0.checked_mul(factor).map(Amount)
    }
}

impl FromStr for Amount {
    type Err = AmountParseError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let s = raw.trim();
        if s.is_empty() {
            return Err(AmountParseError::Empty);
        }

        let (negative, digits) = match s.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, s),
        };

        let (whole, frac) = match digits.split_once('.') {
            Some((whole, frac)) => (whole, frac),
            None => (digits, ""),
        };

        let all_digits = |part: &str| part.chars().all(|c| c.is_ascii_digit());
        if (whole.is_empty() && frac.is_empty()) || !all_digits(whole) || !all_digits(frac) {
            return Err(AmountParseError::Invalid(raw.to_string()));
        }
        if frac.len() > DECIMALS {
            return Err(AmountParseError::TooPrecise(raw.to_string()));
        }

        let overflow = || AmountParseError::Overflow(raw.to_string());
        let whole_value: i64 = if whole.is_empty() {
            0
        } else {
            whole.parse().map_err(|_| overflow())?
        };
        let frac_value: i64 = if frac.is_empty() {
            0
        } else {
            format!("{:0<width$}", frac, width = DECIMALS)
                .parse()
                .map_err(|_| overflow())?
        };

        let stroops = whole_value
            .checked_mul(STROOPS_PER_UNIT)
            .and_then(|v| v.checked_add(frac_value))
            .ok_or_else(overflow)?;

        Ok(Amount(if negative { -stroops } else { stroops }))
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        let unit = STROOPS_PER_UNIT as u64;
        write!(f, "{}{}.{:07}", sign, abs / unit, abs % unit)
    }
}

impl Add for Amount {
    type Output = Amount;

    fn add(self, rhs: Amount) -> Amount {
        Amount(self.0.saturating_add(rhs.0))
    }
}

impl Sub for Amount {
    type Output = Amount;

    fn sub(self, rhs: Amount) -> Amount {
        Amount(self.0.saturating_sub(rhs.0))
    }
}

impl std::iter::Sum for Amount {
    fn sum<I: Iterator<Item = Amount>>(iter: I) -> Amount {
        iter.fold(Amount::ZERO, |acc, x| acc + x)
    }
}

impl Serialize for Amount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}
