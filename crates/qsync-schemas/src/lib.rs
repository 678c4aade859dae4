//! qsync-schemas
//!
//! Domain types shared by every qsync crate: instruments, timeframes, bars,
//! trade ticks and the integer-micros price helpers.
//!
//! Timestamps are terminal-local exchange time (`NaiveDateTime`). The bridge
//! reports every time in the terminal's zone and the bar cache stores them the
//! same way, so no zone conversion happens inside the engine.

pub mod prices;
pub mod timeframe;

use std::fmt;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

pub use prices::{micros_to_price, parse_price_micros, price_to_micros, PricingError, MICROS_PER_UNIT};
pub use timeframe::Timeframe;

// ---------------------------------------------------------------------------
// Side
// ---------------------------------------------------------------------------

/// BUY or SELL.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// +1 for buys, -1 for sells.
    pub fn sign(&self) -> i64 {
        match self {
            Side::Buy => 1,
            Side::Sell => -1,
        }
    }

    /// Transaction `OPERATION` code.
    pub fn operation_code(&self) -> &'static str {
        match self {
            Side::Buy => "B",
            Side::Sell => "S",
        }
    }
}

// ---------------------------------------------------------------------------
// InstrumentId
// ---------------------------------------------------------------------------

/// Class/ticker pair identifying an instrument on the terminal (`TQBR.SBER`).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstrumentId {
    pub class_code: String,
    pub sec_code: String,
}

impl InstrumentId {
    pub fn new(class_code: impl Into<String>, sec_code: impl Into<String>) -> Self {
        Self {
            class_code: class_code.into(),
            sec_code: sec_code.into(),
        }
    }

    /// Parse `CLASS.SEC`. The split happens at the first dot so tickers that
    /// themselves contain dots survive. Returns `None` for a bare ticker;
    /// callers resolve the class code through the terminal.
    pub fn parse(name: &str) -> Option<Self> {
        let (class_code, sec_code) = name.trim().split_once('.')?;
        if class_code.is_empty() || sec_code.is_empty() {
            return None;
        }
        Some(Self::new(class_code, sec_code))
    }

    /// `CLASS|SEC` argument form used by bridge commands.
    pub fn wire_args(&self) -> String {
        format!("{}|{}", self.class_code, self.sec_code)
    }
}

impl fmt::Display for InstrumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.class_code, self.sec_code)
    }
}

// ---------------------------------------------------------------------------
// Instrument
// ---------------------------------------------------------------------------

/// Resolved instrument reference data. Immutable once resolved.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instrument {
    pub id: InstrumentId,
    /// Units per lot (always >= 1).
    pub lot_size: i64,
    /// Minimum price step in micros (always >= 1).
    pub tick_size_micros: i64,
    /// Number of decimal places the terminal accepts in a price.
    pub scale: u32,
    /// Bond nominal in micros; bond quotes are percent of it. 0 when unknown.
    #[serde(default)]
    pub face_value_micros: i64,
    /// Currency value of one price step for one lot (`STEPPRICE`), in
    /// micros. Set for futures only; 0 when unknown.
    #[serde(default)]
    pub step_price_micros: i64,
}

/// Classes quoted in percent of the bond nominal.
pub const BOND_CLASSES: &[&str] = &["TQOB", "TQCB", "TQRD", "TQIR"];

impl Instrument {
    /// Reference data without bond or futures valuation fields.
    pub fn new(id: InstrumentId, lot_size: i64, tick_size_micros: i64, scale: u32) -> Self {
        Self {
            id,
            lot_size,
            tick_size_micros,
            scale,
            face_value_micros: 0,
            step_price_micros: 0,
        }
    }

    pub fn is_bond(&self) -> bool {
        BOND_CLASSES.contains(&self.id.class_code.as_str())
    }

    /// Futures and options trade on the derivatives class.
    pub fn is_derivative(&self, futures_class: &str) -> bool {
        self.id.class_code == futures_class
    }

    /// Units → whole lots (floor). Non-lot mode passes sizes through.
    pub fn size_to_lots(&self, size: i64) -> i64 {
        if self.lot_size > 1 {
            size / self.lot_size
        } else {
            size
        }
    }

    /// Lots → units.
    pub fn lots_to_size(&self, lots: i64) -> i64 {
        if self.lot_size > 1 {
            lots.saturating_mul(self.lot_size)
        } else {
            lots
        }
    }

    /// Round a price down onto the tick grid and the terminal's decimal scale.
    pub fn valid_price(&self, price_micros: i64) -> i64 {
        prices::round_down_to_step(price_micros, self.tick_size_micros, self.scale)
    }

    /// Terminal quote → currency per unit.
    ///
    /// Bonds: `quote / 100 * face_value`. Futures with a known step price:
    /// whole steps times the step price, spread over the lot. Anything else
    /// (and missing reference data) passes through unchanged.
    pub fn quote_to_currency(&self, quote_micros: i64) -> i64 {
        if self.is_bond() && self.face_value_micros > 0 {
            let v = quote_micros as i128 * self.face_value_micros as i128
                / (100 * MICROS_PER_UNIT as i128);
            return clamp_micros(v);
        }
        if self.step_price_micros > 0 && self.tick_size_micros > 0 {
            let steps = quote_micros.div_euclid(self.tick_size_micros) as i128;
            let lot_value = steps * self.step_price_micros as i128;
            return clamp_micros(lot_value / self.lot_size.max(1) as i128);
        }
        quote_micros
    }
}

fn clamp_micros(v: i128) -> i64 {
    v.clamp(i64::MIN as i128, i64::MAX as i128) as i64
}

// ---------------------------------------------------------------------------
// SeriesKey
// ---------------------------------------------------------------------------

/// One (instrument, timeframe) series.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SeriesKey {
    pub instrument: InstrumentId,
    pub timeframe: Timeframe,
}

impl SeriesKey {
    pub fn new(instrument: InstrumentId, timeframe: Timeframe) -> Self {
        Self {
            instrument,
            timeframe,
        }
    }

    /// `CLASS.SEC.INTERVAL`, also the bar cache file stem.
    pub fn data_id(&self) -> String {
        format!("{}.{}", self.instrument, self.timeframe.as_str())
    }
}

impl fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.data_id())
    }
}

// ---------------------------------------------------------------------------
// Bar
// ---------------------------------------------------------------------------

/// OHLCV bar keyed by its open time. Prices in micros.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bar {
    pub open_time: NaiveDateTime,
    pub open: i64,
    pub high: i64,
    pub low: i64,
    pub close: i64,
    pub volume: i64,
}

impl Bar {
    /// A fresh bar seeded by its first trade.
    pub fn opened(open_time: NaiveDateTime, price: i64, volume: i64) -> Self {
        Self {
            open_time,
            open: price,
            high: price,
            low: price,
            close: price,
            volume,
        }
    }

    /// Fold one more trade into the bar.
    pub fn update(&mut self, price: i64, volume: i64) {
        self.high = self.high.max(price);
        self.low = self.low.min(price);
        self.close = price;
        self.volume = self.volume.saturating_add(volume);
    }

    /// Four-price doji: no intrabar range. `high == low` pins open and close.
    pub fn is_price_doji(&self) -> bool {
        self.high == self.low
    }

    /// `low <= open, close <= high` and a non-negative volume.
    pub fn is_consistent(&self) -> bool {
        self.low <= self.high
            && (self.low..=self.high).contains(&self.open)
            && (self.low..=self.high).contains(&self.close)
            && self.volume >= 0
    }
}

// ---------------------------------------------------------------------------
// Tick
// ---------------------------------------------------------------------------

/// One anonymous market trade. Consumed by the live aggregator only.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Tick {
    pub instrument: InstrumentId,
    pub price: i64,
    pub volume: i64,
    pub ts: NaiveDateTime,
    /// Terminal trade number.
    pub seq: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn t(h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 1)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    #[test]
    fn parse_splits_at_first_dot() {
        let id = InstrumentId::parse("TQBR.SBER").unwrap();
        assert_eq!(id, InstrumentId::new("TQBR", "SBER"));
        assert_eq!(id.to_string(), "TQBR.SBER");

        let dotted = InstrumentId::parse("SPBFUT.Si.Z4").unwrap();
        assert_eq!(dotted.sec_code, "Si.Z4");

        assert!(InstrumentId::parse("SBER").is_none());
        assert!(InstrumentId::parse(".SBER").is_none());
    }

    #[test]
    fn data_id_matches_cache_naming() {
        let key = SeriesKey::new(InstrumentId::new("TQBR", "SBER"), Timeframe::M5);
        assert_eq!(key.data_id(), "TQBR.SBER.M5");
    }

    #[test]
    fn bar_update_tracks_range() {
        let mut b = Bar::opened(t(10, 0), 100, 1);
        b.update(102, 2);
        b.update(99, 1);
        assert_eq!((b.open, b.high, b.low, b.close, b.volume), (100, 102, 99, 99, 4));
        assert!(!b.is_price_doji());
        assert!(b.is_consistent());
    }

    #[test]
    fn single_price_bar_is_doji() {
        let mut b = Bar::opened(t(10, 0), 100, 1);
        b.update(100, 5);
        assert!(b.is_price_doji());
    }

    #[test]
    fn lot_conversion_floors() {
        let inst = Instrument::new(InstrumentId::new("TQBR", "SBER"), 10, 10_000, 2);
        assert_eq!(inst.size_to_lots(25), 2);
        assert_eq!(inst.lots_to_size(2), 20);
    }

    #[test]
    fn bond_quotes_are_percent_of_nominal() {
        let bond = Instrument {
            face_value_micros: 1_000 * MICROS_PER_UNIT,
            ..Instrument::new(InstrumentId::new("TQOB", "SU26238RMFS4"), 1, 1_000, 3)
        };
        assert_eq!(bond.quote_to_currency(98_500_000), 985 * MICROS_PER_UNIT);

        let no_nominal = Instrument::new(InstrumentId::new("TQCB", "RU000A0JX0J2"), 1, 1_000, 3);
        assert_eq!(no_nominal.quote_to_currency(98_500_000), 98_500_000);
    }

    #[test]
    fn futures_quotes_go_through_step_price() {
        // RTS index future: step 10 points worth 14.5 per contract.
        let ri = Instrument {
            step_price_micros: 14_500_000,
            ..Instrument::new(InstrumentId::new("SPBFUT", "RIZ4"), 1, 10 * MICROS_PER_UNIT, 0)
        };
        assert_eq!(ri.quote_to_currency(100_000 * MICROS_PER_UNIT), 145_000 * MICROS_PER_UNIT);

        // Lot of 1000 units: value per unit.
        let si = Instrument {
            step_price_micros: MICROS_PER_UNIT,
            ..Instrument::new(InstrumentId::new("SPBFUT", "SiZ4"), 1_000, MICROS_PER_UNIT, 0)
        };
        assert_eq!(si.quote_to_currency(92_000 * MICROS_PER_UNIT), 92 * MICROS_PER_UNIT);

        let shares = Instrument::new(InstrumentId::new("TQBR", "SBER"), 10, 10_000, 2);
        assert_eq!(shares.quote_to_currency(250 * MICROS_PER_UNIT), 250 * MICROS_PER_UNIT);
    }
}
