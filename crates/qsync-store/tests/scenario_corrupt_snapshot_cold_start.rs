//! Scenario: snapshots on disk
//!
//! GREEN when:
//! - a save keeps only the most recent `depth` bars, under `CLASS.SEC.INTERVAL.csv`
//! - a truncated or reordered cache file loads as `None` instead of failing
//! - writes leave no temp file behind and a later good save recovers

use chrono::{NaiveDate, NaiveDateTime};

use qsync_schemas::{Bar, InstrumentId, SeriesKey, Timeframe};
use qsync_store::BarCache;

fn t(m: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 3, 1)
        .unwrap()
        .and_hms_opt(10, m, 0)
        .unwrap()
}

fn bars(n: u32) -> Vec<Bar> {
    (0..n)
        .map(|m| Bar::opened(t(m), 100_000_000 + m as i64 * 10_000, 5))
        .collect()
}

fn series() -> SeriesKey {
    SeriesKey::new(InstrumentId::new("TQBR", "SBER"), Timeframe::M1)
}

#[test]
fn save_trims_to_depth_and_loads_back() {
    let dir = tempfile::tempdir().unwrap();
    let cache = BarCache::new(dir.path().join("DataQuik"), 3);

    cache.save(&series(), &bars(5)).unwrap();
    let path = cache.path(&series());
    assert_eq!(path.file_name().unwrap(), "TQBR.SBER.M1.csv");
    assert!(!dir.path().join("DataQuik/TQBR.SBER.M1.csv.tmp").exists());

    let loaded = cache.load(&series()).expect("cache must load");
    assert_eq!(loaded.len(), 3, "only the last depth bars are kept");
    assert_eq!(loaded[0].open_time, t(2));
    assert_eq!(loaded, bars(5)[2..].to_vec());
}

#[test]
fn corrupt_cache_is_a_cold_start() {
    let dir = tempfile::tempdir().unwrap();
    let cache = BarCache::new(dir.path(), 100);
    assert!(cache.load(&series()).is_none(), "missing file");

    cache.save(&series(), &bars(3)).unwrap();
    let path = cache.path(&series());
    let text = std::fs::read_to_string(&path).unwrap();

    // Truncated mid-row.
    std::fs::write(&path, &text[..text.len() - 6]).unwrap();
    assert!(cache.load(&series()).is_none());

    // Reordered.
    let mut lines: Vec<&str> = text.lines().collect();
    lines.swap(1, 2);
    std::fs::write(&path, lines.join("\n")).unwrap();
    assert!(cache.load(&series()).is_none());

    // A later good save recovers.
    cache.save(&series(), &bars(2)).unwrap();
    assert_eq!(cache.load(&series()).unwrap().len(), 2);
}
