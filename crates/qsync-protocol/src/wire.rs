//! Lenient field decoding.
//!
//! The bridge serializes terminal tables as-is: numeric fields arrive as JSON
//! numbers on some terminal builds and as strings on others, and integer ids
//! sometimes arrive as floats (`12345.0`). The helpers here accept all of
//! those forms.

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Deserializer};

use qsync_schemas::{price_to_micros, PricingError};

#[derive(Deserialize)]
#[serde(untagged)]
enum NumOrStr {
    Int(i64),
    Float(f64),
    Str(String),
}

impl NumOrStr {
    fn as_f64(&self) -> Option<f64> {
        match self {
            NumOrStr::Int(i) => Some(*i as f64),
            NumOrStr::Float(f) => Some(*f),
            NumOrStr::Str(s) => s.trim().parse::<f64>().ok(),
        }
    }

    fn as_i64(&self) -> Option<i64> {
        match self {
            NumOrStr::Int(i) => Some(*i),
            NumOrStr::Float(f) if f.is_finite() && f.fract() == 0.0 => Some(*f as i64),
            NumOrStr::Float(_) => None,
            NumOrStr::Str(s) => {
                let s = s.trim();
                s.parse::<i64>()
                    .ok()
                    .or_else(|| s.parse::<f64>().ok().filter(|f| f.fract() == 0.0).map(|f| f as i64))
            }
        }
    }
}

/// `f64` from a number or numeric string; missing or null → 0.
pub fn f64_lenient<'de, D: Deserializer<'de>>(d: D) -> Result<f64, D::Error> {
    let v: Option<NumOrStr> = Option::deserialize(d)?;
    match v {
        None => Ok(0.0),
        Some(n) => n
            .as_f64()
            .ok_or_else(|| serde::de::Error::custom("expected a number")),
    }
}

/// `i64` from an integer, integral float or numeric string; missing or null → 0.
pub fn i64_lenient<'de, D: Deserializer<'de>>(d: D) -> Result<i64, D::Error> {
    let v: Option<NumOrStr> = Option::deserialize(d)?;
    match v {
        None => Ok(0),
        Some(n) => n
            .as_i64()
            .ok_or_else(|| serde::de::Error::custom("expected an integer")),
    }
}

/// `u64` via `i64`; negative values are rejected.
pub fn u64_lenient<'de, D: Deserializer<'de>>(d: D) -> Result<u64, D::Error> {
    let v = i64_lenient(d)?;
    u64::try_from(v).map_err(|_| serde::de::Error::custom("expected a non-negative integer"))
}

/// Terminal timestamp table (`{year, month, day, hour, min, sec, ms, week_day}`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
pub struct QuikDateTime {
    #[serde(deserialize_with = "i64_lenient", default)]
    pub year: i64,
    #[serde(deserialize_with = "i64_lenient", default)]
    pub month: i64,
    #[serde(deserialize_with = "i64_lenient", default)]
    pub day: i64,
    #[serde(deserialize_with = "i64_lenient", default)]
    pub hour: i64,
    #[serde(deserialize_with = "i64_lenient", default)]
    pub min: i64,
    #[serde(deserialize_with = "i64_lenient", default)]
    pub sec: i64,
    #[serde(deserialize_with = "i64_lenient", default)]
    pub ms: i64,
}

impl QuikDateTime {
    /// `None` when any component is out of range.
    pub fn to_naive(&self) -> Option<NaiveDateTime> {
        let date = NaiveDate::from_ymd_opt(
            i32::try_from(self.year).ok()?,
            u32::try_from(self.month).ok()?,
            u32::try_from(self.day).ok()?,
        )?;
        date.and_hms_milli_opt(
            u32::try_from(self.hour).ok()?,
            u32::try_from(self.min).ok()?,
            u32::try_from(self.sec).ok()?,
            u32::try_from(self.ms).ok()?,
        )
    }
}

/// Terminal float price → micros.
pub fn micros(price: f64) -> Result<i64, PricingError> {
    price_to_micros(price)
}
