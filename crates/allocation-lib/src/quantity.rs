//! Exact resource quantities
//!
//! Quantities use the Kubernetes suffix grammar and are stored in milli-units,
//! so `1`, `1000m` and `1.0` compare equal and a single millicore of CPU is
//! representable. Fractions finer than one milli-unit round up.

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign, Sub};
use std::str::FromStr;
use thiserror::Error;

const MILLIS_PER_UNIT: i128 = 1000;

/// Binary suffixes, largest first, used when formatting whole quantities
const BINARY_SUFFIXES: &[(&str, i64)] = &[
    ("Ei", 1 << 60),
    ("Pi", 1 << 50),
    ("Ti", 1 << 40),
    ("Gi", 1 << 30),
    ("Mi", 1 << 20),
    ("Ki", 1 << 10),
];

/// Errors produced while parsing a quantity string
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QuantityError {
    #[error("empty quantity")]
    Empty,
    #[error("invalid quantity {0:?}")]
    Invalid(String),
    #[error("unknown suffix {suffix:?} in quantity {input:?}")]
    UnknownSuffix { input: String, suffix: String },
    #[error("quantity {0:?} is out of range")]
    OutOfRange(String),
}

/// A resource amount, e.g. `500m` CPU or `1Gi` memory
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Quantity {
    millis: i64,
}

impl Quantity {
    /// Zero of any resource
    pub const ZERO: Quantity = Quantity { millis: 0 };

    /// Quantity of `value` whole units (cores, bytes, pods)
    pub fn new(value: i64) -> Self {
        Self {
            millis: value.saturating_mul(1000),
        }
    }

    /// Quantity of `millis` milli-units (millicores for CPU)
    pub fn from_millis(millis: i64) -> Self {
        Self { millis }
    }

    /// Amount in milli-units
    pub fn milli_value(&self) -> i64 {
        self.millis
    }

    /// Amount in whole units, rounded up
    pub fn value(&self) -> i64 {
        -((-self.millis).div_euclid(1000))
    }

    pub fn is_zero(&self) -> bool {
        self.millis == 0
    }
}

impl Add for Quantity {
    type Output = Quantity;

    fn add(self, rhs: Quantity) -> Quantity {
        Quantity {
            millis: self.millis.saturating_add(rhs.millis),
        }
    }
}

impl AddAssign for Quantity {
    fn add_assign(&mut self, rhs: Quantity) {
        self.millis = self.millis.saturating_add(rhs.millis);
    }
}

impl Sub for Quantity {
    type Output = Quantity;

    fn sub(self, rhs: Quantity) -> Quantity {
        Quantity {
            millis: self.millis.saturating_sub(rhs.millis),
        }
    }
}

impl Sum for Quantity {
    fn sum<I: Iterator<Item = Quantity>>(iter: I) -> Quantity {
        iter.fold(Quantity::ZERO, Add::add)
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.millis % 1000 != 0 {
            return write!(f, "{}m", self.millis);
        }

        let value = self.millis / 1000;
        if value != 0 {
            for (suffix, multiplier) in BINARY_SUFFIXES {
                if value % multiplier == 0 {
                    return write!(f, "{}{}", value / multiplier, suffix);
                }
            }
        }
        write!(f, "{}", value)
    }
}

impl FromStr for Quantity {
    type Err = QuantityError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let s = input.trim();
        if s.is_empty() {
            return Err(QuantityError::Empty);
        }

        let (negative, unsigned) = match s.as_bytes()[0] {
            b'-' => (true, &s[1..]),
            b'+' => (false, &s[1..]),
            _ => (false, s),
        };

        let number_len = unsigned
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(unsigned.len());
        let (number, suffix) = unsigned.split_at(number_len);
        if number.is_empty() || number == "." || number.matches('.').count() > 1 {
            return Err(QuantityError::Invalid(input.to_string()));
        }

        // Mantissa as an integer plus the number of decimal places it carries
        let (whole, fraction) = number.split_once('.').unwrap_or((number, ""));
        let digits = format!("{}{}", whole, fraction);
        let mantissa: i128 = digits
            .parse()
            .map_err(|_| QuantityError::OutOfRange(input.to_string()))?;
        let decimals = fraction.len() as u32;

        let (numerator, denominator) = scale_for_suffix(input, suffix)?;

        let scaled = mantissa
            .checked_mul(numerator)
            .ok_or_else(|| QuantityError::OutOfRange(input.to_string()))?;
        let divisor = 10_i128
            .checked_pow(decimals)
            .and_then(|p| p.checked_mul(denominator))
            .ok_or_else(|| QuantityError::OutOfRange(input.to_string()))?;

        // Round away from zero like the API server does for sub-milli precision
        let mut millis = scaled / divisor;
        if scaled % divisor != 0 {
            millis += 1;
        }
        if negative {
            millis = -millis;
        }

        let millis =
            i64::try_from(millis).map_err(|_| QuantityError::OutOfRange(input.to_string()))?;
        Ok(Quantity { millis })
    }
}

/// Returns the (numerator, denominator) that converts one suffixed unit into milli-units
fn scale_for_suffix(input: &str, suffix: &str) -> Result<(i128, i128), QuantityError> {
    let decimal = |exp: u32| (MILLIS_PER_UNIT * 10_i128.pow(exp), 1);
    let binary = |shift: u32| (MILLIS_PER_UNIT << shift, 1);

    let scale = match suffix {
        "" => (MILLIS_PER_UNIT, 1),
        "m" => (1, 1),
        "k" => decimal(3),
        "M" => decimal(6),
        "G" => decimal(9),
        "T" => decimal(12),
        "P" => decimal(15),
        "E" => decimal(18),
        "Ki" => binary(10),
        "Mi" => binary(20),
        "Gi" => binary(30),
        "Ti" => binary(40),
        "Pi" => binary(50),
        "Ei" => binary(60),
        _ => {
            // Scientific notation, e.g. `1e3` or `5E-1`
            let exponent = suffix
                .strip_prefix('e')
                .or_else(|| suffix.strip_prefix('E'))
                .and_then(|exp| exp.parse::<i32>().ok())
                .ok_or_else(|| QuantityError::UnknownSuffix {
                    input: input.to_string(),
                    suffix: suffix.to_string(),
                })?;
            if exponent.unsigned_abs() > 18 {
                return Err(QuantityError::OutOfRange(input.to_string()));
            }
            if exponent >= 0 {
                decimal(exponent as u32)
            } else {
                (MILLIS_PER_UNIT, 10_i128.pow(exponent.unsigned_abs()))
            }
        }
    };
    Ok(scale)
}

impl Serialize for Quantity {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Quantity {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct QuantityVisitor;

        impl de::Visitor<'_> for QuantityVisitor {
            type Value = Quantity;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a resource quantity such as \"500m\", \"1Gi\" or 2")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Quantity, E> {
                v.parse().map_err(E::custom)
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Quantity, E> {
                Ok(Quantity::new(v))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Quantity, E> {
                i64::try_from(v)
                    .map(Quantity::new)
                    .map_err(|_| E::custom(format!("quantity {} is out of range", v)))
            }
        }

        deserializer.deserialize_any(QuantityVisitor)
    }
}
