//! Integer-micros price representation.
//!
//! Every price inside the engine is an `i64` count of micros
//! (1 unit = 1_000_000 micros). `f64` only exists at the wire boundary:
//!
//! | Direction               | Function               |
//! |-------------------------|------------------------|
//! | bridge JSON → internal  | [`price_to_micros`]    |
//! | cache CSV → internal    | [`parse_price_micros`] |
//! | internal → transaction  | [`format_price`]       |
//! | internal → consumer     | [`micros_to_price`]    |

use std::fmt;

/// Scale factor: 1 price unit = 1_000_000 micros (6 decimal places).
pub const MICROS_PER_UNIT: i64 = 1_000_000;

// ---------------------------------------------------------------------------
// PricingError
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PricingError {
    /// Input was `NaN` or infinite.
    NotFinite,
    /// Input would overflow `i64` after scaling.
    OutOfRange,
    /// A decimal string could not be parsed exactly.
    Unparseable(String),
}

impl fmt::Display for PricingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PricingError::NotFinite => write!(f, "price is not finite (NaN or Inf)"),
            PricingError::OutOfRange => write!(f, "price out of i64 range after scaling"),
            PricingError::Unparseable(raw) => write!(f, "price could not be parsed: '{raw}'"),
        }
    }
}

impl std::error::Error for PricingError {}

// ---------------------------------------------------------------------------
// Conversions
// ---------------------------------------------------------------------------

pub fn micros_to_price(micros: i64) -> f64 {
    micros as f64 / MICROS_PER_UNIT as f64
}

/// Convert a wire `f64` into micros, rounding to the nearest micro.
pub fn price_to_micros(price: f64) -> Result<i64, PricingError> {
    if !price.is_finite() {
        return Err(PricingError::NotFinite);
    }
    let scaled = price * MICROS_PER_UNIT as f64;
    if scaled > i64::MAX as f64 || scaled < i64::MIN as f64 {
        return Err(PricingError::OutOfRange);
    }
    Ok(scaled.round() as i64)
}

/// Exact decimal string → micros. No floating point involved; more than six
/// fractional digits is rejected rather than rounded.
pub fn parse_price_micros(s: &str) -> Result<i64, PricingError> {
    let raw = s.trim();
    let bad = || PricingError::Unparseable(raw.to_string());

    let (negative, digits) = match raw.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, raw.strip_prefix('+').unwrap_or(raw)),
    };
    let (int_part, frac_part) = digits.split_once('.').unwrap_or((digits, ""));

    let all_digits = |p: &str| p.chars().all(|c| c.is_ascii_digit());
    if (int_part.is_empty() && frac_part.is_empty())
        || !all_digits(int_part)
        || !all_digits(frac_part)
        || frac_part.len() > 6
    {
        return Err(bad());
    }

    let int_val: i64 = if int_part.is_empty() {
        0
    } else {
        int_part.parse().map_err(|_| bad())?
    };
    let mut frac_val: i64 = if frac_part.is_empty() {
        0
    } else {
        frac_part.parse().map_err(|_| bad())?
    };
    for _ in frac_part.len()..6 {
        frac_val *= 10;
    }

    let magnitude = int_val
        .checked_mul(MICROS_PER_UNIT)
        .and_then(|v| v.checked_add(frac_val))
        .ok_or(PricingError::OutOfRange)?;
    Ok(if negative { -magnitude } else { magnitude })
}

/// Render micros with exactly `scale` decimals (truncating), the way the
/// terminal expects transaction prices.
pub fn format_price(micros: i64, scale: u32) -> String {
    let scale = scale.min(6);
    let sign = if micros < 0 { "-" } else { "" };
    let abs = micros.unsigned_abs();
    let int_part = abs / MICROS_PER_UNIT as u64;
    if scale == 0 {
        return format!("{sign}{int_part}");
    }
    let frac = abs % MICROS_PER_UNIT as u64;
    let frac_scaled = frac / 10u64.pow(6 - scale);
    format!("{sign}{int_part}.{frac_scaled:0width$}", width = scale as usize)
}

/// `floor(price / step) * step`, then truncated to `scale` decimals.
pub fn round_down_to_step(price_micros: i64, step_micros: i64, scale: u32) -> i64 {
    let stepped = if step_micros > 0 {
        price_micros.div_euclid(step_micros) * step_micros
    } else {
        price_micros
    };
    let quantum = 10i64.pow(6 - scale.min(6));
    stepped.div_euclid(quantum) * quantum
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
