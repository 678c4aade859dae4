//! Scenario: `qsync history --csv` against a scripted bridge
//!
//! GREEN when:
//! - the binary connects with the layered config and fetches the series
//! - the CSV holds the closed bars only, oldest first, in cache format

use std::fs;

use serde_json::json;

use qsync_schemas::{Bar, InstrumentId, SeriesKey, Timeframe};
use qsync_testkit::{at, CandleBook, MockBridge, MockReply};

const PX: i64 = 1_000_000;

#[allow(deprecated)]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn history_writes_closed_bars_as_csv() {
    let bridge = MockBridge::start().await.unwrap();
    let series = SeriesKey::new(InstrumentId::new("TQBR", "SBER"), Timeframe::M1);

    // 10:00..10:02 closed, 10:03 still forming at 10:03:10.
    let bars: Vec<Bar> = (0..4)
        .map(|m| Bar::opened(at(10, m, 0), (250 + m as i64) * PX, 7))
        .collect();
    bridge.serve_candles(CandleBook::new(series, bars));
    bridge.on("getInfoParam", |d| match d.as_str() {
        Some("TRADEDATE") => MockReply::Data(json!("01.03.2024")),
        Some("SERVERTIME") => MockReply::Data(json!("10:03:10")),
        _ => MockReply::Data(json!("")),
    });

    let dir = tempfile::tempdir().unwrap();
    let cfg_path = dir.path().join("bridge.yaml");
    let cfg = bridge.adapter_config(&dir.path().join("data"));
    fs::write(&cfg_path, serde_yaml::to_string(&cfg).unwrap()).unwrap();
    let csv_path = dir.path().join("sber.csv");

    let mut cmd = assert_cmd::Command::cargo_bin("qsync").unwrap();
    cmd.current_dir(dir.path()).args([
        "history",
        "--config",
        &cfg_path.display().to_string(),
        "--ticker",
        "TQBR.SBER",
        "--tf",
        "M1",
        "--count",
        "10",
        "--csv",
        &csv_path.display().to_string(),
    ]);
    let out = tokio::task::spawn_blocking(move || cmd.output().unwrap())
        .await
        .unwrap();
    assert!(
        out.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&out.stderr)
    );
    assert!(String::from_utf8_lossy(&out.stdout).contains("history_ok=true series=TQBR.SBER.M1 bars=3"));

    let text = fs::read_to_string(&csv_path).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines[0], "datetime;open;high;low;close;volume");
    assert_eq!(lines[1], "2024-03-01 10:00:00;250;250;250;250;7");
    assert_eq!(lines.len(), 4, "forming 10:03 bar is left out");
    assert!(lines[3].starts_with("2024-03-01 10:02:00;252"));
}
