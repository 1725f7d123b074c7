//! Resource quantities for CPU and GPU accounting
//!
//! Quantities are stored as milli-units so that `"500m"`, `"1.5"` and `"2"`
//! all share one integer representation and sum without rounding drift.

use std::fmt;
use std::iter::Sum;
use std::ops::{Add, Sub};
use std::str::FromStr;

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Errors produced when parsing a quantity string
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QuantityError {
    #[error("Quantity is empty")]
    Empty,

    #[error("Quantity '{0}' is not a valid number")]
    Malformed(String),

    #[error("Quantity '{0}' must not be negative")]
    Negative(String),

    #[error("Quantity '{0}' has more precision than milli-units allow")]
    TooPrecise(String),

    #[error("Quantity '{0}' exceeds the largest accepted amount")]
    TooLarge(String),
}

/// A non-fractional-drift resource amount, in thousandths of a unit
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Quantity {
    millis: i64,
}

impl Quantity {
    pub const ZERO: Quantity = Quantity { millis: 0 };

    /// Largest amount a parsed quantity may carry (one billion units)
    pub const MAX: Quantity = Quantity {
        millis: 1_000_000_000_000,
    };

    /// Build from whole units (e.g. 2 GPUs); saturates instead of overflowing
    pub const fn from_units(units: i64) -> Self {
        Self {
            millis: units.saturating_mul(1000),
        }
    }

    /// Build from milli-units (e.g. 500 = half a CPU)
    pub const fn from_millis(millis: i64) -> Self {
        Self { millis }
    }

    pub fn millis(&self) -> i64 {
        self.millis
    }

    /// Value in whole units, as a float for reporting
    pub fn as_f64(&self) -> f64 {
        self.millis as f64 / 1000.0
    }

    /// Value truncated to whole units
    pub fn whole_units(&self) -> i64 {
        self.millis / 1000
    }

    pub fn is_whole(&self) -> bool {
        self.millis % 1000 == 0
    }

    pub fn is_zero(&self) -> bool {
        self.millis == 0
    }

    /// Lenient parse for values read back from the platform.
    ///
    /// Unknown suffixes and malformed values count as zero: a foreign pod with
    /// an exotic quantity must not break cluster-wide accounting.
    pub fn parse_lenient(s: &str) -> Self {
        s.parse().unwrap_or_default()
    }
}

impl FromStr for Quantity {
    type Err = QuantityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.trim();
        if raw.is_empty() {
            return Err(QuantityError::Empty);
        }
        if raw.starts_with('-') {
            return Err(QuantityError::Negative(raw.to_string()));
        }

        let (number, scale) = match raw.strip_suffix('m') {
            Some(n) => (n, 1),
            None => (raw, 1000),
        };
        let number = number.strip_prefix('+').unwrap_or(number);

        let (int_part, frac_part) = match number.split_once('.') {
            Some((i, f)) => (i, f),
            None => (number, ""),
        };

        let valid_digits = |p: &str| p.chars().all(|c| c.is_ascii_digit());
        if (int_part.is_empty() && frac_part.is_empty())
            || !valid_digits(int_part)
            || !valid_digits(frac_part)
        {
            return Err(QuantityError::Malformed(raw.to_string()));
        }

        let int_value: i64 = if int_part.is_empty() {
            0
        } else {
            int_part
                .parse()
                .map_err(|_| QuantityError::TooLarge(raw.to_string()))?
        };

        let frac_millis = if frac_part.is_empty() {
            0
        } else {
            // "m" values are already milli-units, so no fractional part fits
            let digits_allowed = if scale == 1000 { 3 } else { 0 };
            let significant = frac_part.trim_end_matches('0');
            if significant.len() > digits_allowed {
                return Err(QuantityError::TooPrecise(raw.to_string()));
            }
            let mut padded = significant.to_string();
            while padded.len() < digits_allowed {
                padded.push('0');
            }
            if padded.is_empty() {
                0
            } else {
                padded
                    .parse::<i64>()
                    .map_err(|_| QuantityError::Malformed(raw.to_string()))?
            }
        };

        let millis = int_value
            .checked_mul(scale)
            .and_then(|v| v.checked_add(frac_millis))
            .ok_or_else(|| QuantityError::TooLarge(raw.to_string()))?;
        if millis > Self::MAX.millis {
            return Err(QuantityError::TooLarge(raw.to_string()));
        }

        Ok(Self { millis })
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_whole() {
            write!(f, "{}", self.millis / 1000)
        } else {
            write!(f, "{}m", self.millis)
        }
    }
}

impl Add for Quantity {
    type Output = Quantity;

    fn add(self, rhs: Quantity) -> Quantity {
        Quantity::from_millis(self.millis.saturating_add(rhs.millis))
    }
}

impl Sub for Quantity {
    type Output = Quantity;

    fn sub(self, rhs: Quantity) -> Quantity {
        Quantity::from_millis(self.millis.saturating_sub(rhs.millis))
    }
}

impl Sum for Quantity {
    fn sum<I: Iterator<Item = Quantity>>(iter: I) -> Quantity {
        iter.fold(Quantity::ZERO, |acc, q| acc + q)
    }
}

impl Serialize for Quantity {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Accepts `"2"`, `"500m"` and bare JSON numbers like `2` or `1.5`
impl<'de> Deserialize<'de> for Quantity {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct QuantityVisitor;

        impl Visitor<'_> for QuantityVisitor {
            type Value = Quantity;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a resource quantity such as \"2\", \"1.5\" or \"500m\"")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Quantity, E> {
                v.parse().map_err(E::custom)
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Quantity, E> {
                v.to_string().parse().map_err(E::custom)
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Quantity, E> {
                if v < 0 {
                    return Err(E::custom(QuantityError::Negative(v.to_string())));
                }
                self.visit_u64(v as u64)
            }

            fn visit_f64<E: de::Error>(self, v: f64) -> Result<Quantity, E> {
                v.to_string().parse().map_err(E::custom)
            }
        }

        deserializer.deserialize_any(QuantityVisitor)
    }
}
