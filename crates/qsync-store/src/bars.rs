//! Per-series bar cache: `data_dir/CLASS.SEC.INTERVAL.csv`.
//!
//! ```text
//! datetime;open;high;low;close;volume
//! 2024-03-01 10:00:00;250.1;250.5;249.9;250.3;1200
//! ```
//!
//! Rows must be strictly increasing by datetime. A file that fails to parse
//! or breaks ordering is discarded whole; the loader then cold-starts.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;
use tracing::{debug, warn};

use qsync_schemas::prices::format_price;
use qsync_schemas::{parse_price_micros, Bar, SeriesKey};

use crate::{write_atomic, StoreError};

pub const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
const HEADER: [&str; 6] = ["datetime", "open", "high", "low", "close", "volume"];

/// Shortest decimal rendering of a micros price (`250.1`, `100`).
fn decimal(micros: i64) -> String {
    let s = format_price(micros, 6);
    let s = s.trim_end_matches('0');
    s.trim_end_matches('.').to_string()
}

/// Write `bars` as cache CSV.
pub fn write_csv<W: Write>(out: W, bars: &[Bar]) -> Result<(), StoreError> {
    let mut w = csv::WriterBuilder::new().delimiter(b';').from_writer(out);
    w.write_record(HEADER).map_err(StoreError::csv)?;
    for b in bars {
        w.write_record([
            b.open_time.format(DATETIME_FORMAT).to_string(),
            decimal(b.open),
            decimal(b.high),
            decimal(b.low),
            decimal(b.close),
            b.volume.to_string(),
        ])
        .map_err(StoreError::csv)?;
    }
    w.flush().map_err(|e| StoreError::Io(e.to_string()))?;
    Ok(())
}

/// Parse cache CSV. Any bad row, unexpected header or ordering violation
/// fails the whole read.
pub fn read_csv<R: Read>(input: R) -> Result<Vec<Bar>, StoreError> {
    let mut r = csv::ReaderBuilder::new()
        .delimiter(b';')
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_reader(input);

    let headers = r.headers().map_err(StoreError::csv)?;
    if headers.iter().map(str::to_ascii_lowercase).ne(HEADER.iter().map(|s| s.to_string())) {
        return Err(StoreError::corrupt(format!("unexpected header {headers:?}")));
    }

    let mut bars: Vec<Bar> = Vec::new();
    for (i, rec) in r.records().enumerate() {
        let rec = rec.map_err(StoreError::csv)?;
        let row = i + 2;
        let field = |idx: usize| rec.get(idx).unwrap_or_default();
        let price = |idx: usize| {
            parse_price_micros(field(idx))
                .map_err(|e| StoreError::corrupt(format!("row {row}: {} {e}", HEADER[idx])))
        };

        let open_time = NaiveDateTime::parse_from_str(field(0), DATETIME_FORMAT)
            .map_err(|e| StoreError::corrupt(format!("row {row}: datetime {e}")))?;
        let bar = Bar {
            open_time,
            open: price(1)?,
            high: price(2)?,
            low: price(3)?,
            close: price(4)?,
            volume: field(5)
                .parse::<i64>()
                .map_err(|e| StoreError::corrupt(format!("row {row}: volume {e}")))?,
        };
        if !bar.is_consistent() {
            return Err(StoreError::corrupt(format!("row {row}: inconsistent OHLCV")));
        }
        if let Some(prev) = bars.last() {
            if bar.open_time <= prev.open_time {
                return Err(StoreError::corrupt(format!(
                    "row {row}: datetime {} not after {}",
                    bar.open_time, prev.open_time
                )));
            }
        }
        bars.push(bar);
    }
    Ok(bars)
}

// ---------------------------------------------------------------------------
// BarCache
// ---------------------------------------------------------------------------

/// Bar files under one data directory, trimmed to `depth` bars on write.
#[derive(Debug, Clone)]
pub struct BarCache {
    dir: PathBuf,
    depth: usize,
}

impl BarCache {
    pub fn new(dir: impl Into<PathBuf>, depth: usize) -> Self {
        Self {
            dir: dir.into(),
            depth: depth.max(1),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, series: &SeriesKey) -> PathBuf {
        self.dir.join(format!("{}.csv", series.data_id()))
    }

    /// Cached bars, oldest first. `None` when absent or unusable.
    pub fn load(&self, series: &SeriesKey) -> Option<Vec<Bar>> {
        let path = self.path(series);
        let file = match std::fs::File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(series = %series, "no bar cache");
                return None;
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "bar cache unreadable, cold start");
                return None;
            }
        };
        match read_csv(file) {
            Ok(bars) => {
                debug!(series = %series, bars = bars.len(), "bar cache loaded");
                Some(bars)
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "corrupt bar cache discarded, cold start");
                None
            }
        }
    }

    /// Replace the cache with the most recent `depth` bars.
    pub fn save(&self, series: &SeriesKey, bars: &[Bar]) -> Result<(), StoreError> {
        let tail = &bars[bars.len().saturating_sub(self.depth)..];
        let mut buf = Vec::new();
        write_csv(&mut buf, tail)?;
        let path = self.path(series);
        write_atomic(&path, &buf)?;
        debug!(series = %series, bars = tail.len(), "bar cache written");
        Ok(())
    }
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

    fn bar(h: u32, m: u32, close: i64) -> Bar {
        Bar {
            open_time: t(h, m),
            open: 250_100_000,
            high: 250_500_000.max(close),
            low: 249_900_000.min(close),
            close,
            volume: 1200,
        }
    }

    #[test]
    fn writes_the_documented_layout() {
        let mut buf = Vec::new();
        write_csv(&mut buf, &[bar(10, 0, 250_300_000)]).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert_eq!(
            text,
            "datetime;open;high;low;close;volume\n2024-03-01 10:00:00;250.1;250.5;249.9;250.3;1200\n"
        );
    }

    #[test]
    fn reads_back_what_it_wrote() {
        let bars = vec![bar(10, 0, 250_300_000), bar(10, 1, 100_000_000)];
        let mut buf = Vec::new();
        write_csv(&mut buf, &bars).unwrap();
        assert_eq!(read_csv(buf.as_slice()).unwrap(), bars);
    }

    #[test]
    fn out_of_order_rows_are_corrupt() {
        let text = "datetime;open;high;low;close;volume\n\
                    2024-03-01 10:01:00;1;1;1;1;1\n\
                    2024-03-01 10:00:00;1;1;1;1;1\n";
        assert!(matches!(read_csv(text.as_bytes()), Err(StoreError::Corrupt { .. })));
    }

    #[test]
    fn garbage_is_corrupt() {
        for text in [
            "date;o;h;l;c;v\n",
            "datetime;open;high;low;close;volume\n2024-03-01 10:00:00;x;1;1;1;1\n",
            "datetime;open;high;low;close;volume\n2024-03-01 10:00:00;1;1;1\n",
            "datetime;open;high;low;close;volume\n2024-03-01 10:00:00;5;1;1;1;1\n",
        ] {
            assert!(read_csv(text.as_bytes()).is_err(), "{text:?}");
        }
    }

    #[test]
    fn decimal_rendering() {
        assert_eq!(decimal(100_000_000), "100");
        assert_eq!(decimal(250_120_000), "250.12");
        assert_eq!(decimal(1), "0.000001");
        assert_eq!(decimal(-1_500_000), "-1.5");
    }
}
