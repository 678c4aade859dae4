//! Candle intervals supported by the terminal and their bucket arithmetic.

use std::fmt;

use chrono::{Datelike, Duration, Months, NaiveDateTime, NaiveTime, Timelike};
use serde::{Deserialize, Serialize};

/// Terminal candle interval. The discriminant-like [`Timeframe::quik_code`]
/// is the interval length in minutes as the terminal numbers them (the month
/// code is a fixed terminal constant, not a length).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Timeframe {
    M1,
    M2,
    M3,
    M4,
    M5,
    M6,
    M10,
    M15,
    M20,
    M30,
    H1,
    H2,
    H4,
    D1,
    W1,
    MN,
}

pub const ALL_TIMEFRAMES: [Timeframe; 16] = [
    Timeframe::M1,
    Timeframe::M2,
    Timeframe::M3,
    Timeframe::M4,
    Timeframe::M5,
    Timeframe::M6,
    Timeframe::M10,
    Timeframe::M15,
    Timeframe::M20,
    Timeframe::M30,
    Timeframe::H1,
    Timeframe::H2,
    Timeframe::H4,
    Timeframe::D1,
    Timeframe::W1,
    Timeframe::MN,
];

impl Timeframe {
    pub fn as_str(&self) -> &'static str {
        match self {
            Timeframe::M1 => "M1",
            Timeframe::M2 => "M2",
            Timeframe::M3 => "M3",
            Timeframe::M4 => "M4",
            Timeframe::M5 => "M5",
            Timeframe::M6 => "M6",
            Timeframe::M10 => "M10",
            Timeframe::M15 => "M15",
            Timeframe::M20 => "M20",
            Timeframe::M30 => "M30",
            Timeframe::H1 => "H1",
            Timeframe::H2 => "H2",
            Timeframe::H4 => "H4",
            Timeframe::D1 => "D1",
            Timeframe::W1 => "W1",
            Timeframe::MN => "MN",
        }
    }

    /// Interval code sent to the bridge.
    pub fn quik_code(&self) -> u32 {
        match self {
            Timeframe::M1 => 1,
            Timeframe::M2 => 2,
            Timeframe::M3 => 3,
            Timeframe::M4 => 4,
            Timeframe::M5 => 5,
            Timeframe::M6 => 6,
            Timeframe::M10 => 10,
            Timeframe::M15 => 15,
            Timeframe::M20 => 20,
            Timeframe::M30 => 30,
            Timeframe::H1 => 60,
            Timeframe::H2 => 120,
            Timeframe::H4 => 240,
            Timeframe::D1 => 1440,
            Timeframe::W1 => 10080,
            Timeframe::MN => 23200,
        }
    }

    pub fn from_quik_code(code: u32) -> Option<Self> {
        ALL_TIMEFRAMES.iter().copied().find(|tf| tf.quik_code() == code)
    }

    /// Case-insensitive name (`m5`, `H1`, `mn`); `MN1` is accepted for months.
    pub fn parse(s: &str) -> Option<Self> {
        let upper = s.trim().to_ascii_uppercase();
        if upper == "MN1" {
            return Some(Timeframe::MN);
        }
        ALL_TIMEFRAMES.iter().copied().find(|tf| tf.as_str() == upper)
    }

    /// Nominal length in minutes. Months count as 30 days; only depth
    /// estimates use this for `MN`.
    pub fn nominal_minutes(&self) -> i64 {
        match self {
            Timeframe::MN => 30 * 1440,
            other => other.quik_code() as i64,
        }
    }

    pub fn is_intraday(&self) -> bool {
        self.quik_code() < 1440
    }

    /// Open time of the bucket containing `ts`.
    ///
    /// Intraday buckets align to multiples of the interval counted from the
    /// start of the trading day; weeks start on Monday, months on the 1st.
    pub fn bucket_start(&self, ts: NaiveDateTime) -> NaiveDateTime {
        let midnight = ts.date().and_time(NaiveTime::default());
        match self {
            Timeframe::D1 => midnight,
            Timeframe::W1 => {
                midnight - Duration::days(ts.weekday().num_days_from_monday() as i64)
            }
            Timeframe::MN => {
                let day_offset = ts.day0() as i64;
                midnight - Duration::days(day_offset)
            }
            intraday => {
                let step = intraday.quik_code() as i64;
                let minute_of_day = (ts.hour() * 60 + ts.minute()) as i64;
                midnight + Duration::minutes(minute_of_day / step * step)
            }
        }
    }

    /// Open time of the bucket after the one opened at `open_time`, which is
    /// also the close time of that bucket.
    pub fn next_open(&self, open_time: NaiveDateTime) -> NaiveDateTime {
        match self {
            Timeframe::D1 => open_time + Duration::days(1),
            Timeframe::W1 => open_time + Duration::weeks(1),
            Timeframe::MN => open_time
                .checked_add_months(Months::new(1))
                .unwrap_or(open_time + Duration::days(31)),
            intraday => open_time + Duration::minutes(intraday.quik_code() as i64),
        }
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
