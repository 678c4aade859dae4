//! Scenario: slow consumers and dropped market events
//!
//! GREEN when:
//! - a consumer queue that fills up during backfill suspends the feed and the
//!   rest of the history arrives through refetches, once, in order
//! - a consumer queue that fills up with live bars does the same for the live
//!   gap
//! - market events dropped by a full session queue schedule a refetch that
//!   delivers the bars the live builder could not
//! - in every case open times strictly increase and no minute is missing

use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDateTime;
use serde_json::json;

use qsync_adapter::{Feed, FeedItem, FeedOptions, FeedStatus, QuikAdapter};
use qsync_schemas::{Bar, InstrumentId, SeriesKey, Timeframe};
use qsync_testkit::payloads::all_trade;
use qsync_testkit::{at, CandleBook, MockBridge, MockReply};

const PX: i64 = 1_000_000;

fn bar(m: u32) -> Bar {
    let mut b = Bar::opened(at(10, m, 0), 100 * PX, 1);
    b.update(101 * PX, 1);
    b
}

fn terminal_time(bridge: &MockBridge, time: &'static str) {
    bridge.on("getInfoParam", move |d| match d.as_str() {
        Some("TRADEDATE") => MockReply::Data(json!("01.03.2024")),
        Some("SERVERTIME") => MockReply::Data(json!(time)),
        _ => MockReply::Data(json!("")),
    });
}

async fn next(feed: &mut Feed) -> Option<FeedItem> {
    tokio::time::timeout(Duration::from_secs(5), feed.next())
        .await
        .expect("feed item in time")
}

/// Bars up to and including `last`, statuses skipped.
async fn bars_until(feed: &mut Feed, last: NaiveDateTime) -> Vec<NaiveDateTime> {
    let mut out = Vec::new();
    loop {
        match next(feed).await {
            Some(FeedItem::Bar(b)) => {
                let t = b.open_time;
                out.push(t);
                if t >= last {
                    return out;
                }
            }
            Some(FeedItem::Status(_)) => {}
            None => panic!("feed closed after {out:?}"),
        }
    }
}

fn minutes(from: u32, to: u32) -> Vec<NaiveDateTime> {
    (from..=to).map(|m| at(10, m, 0)).collect()
}

#[tokio::test]
async fn full_queue_during_backfill_is_refetched() {
    let bridge = MockBridge::start().await.unwrap();
    terminal_time(&bridge, "10:30:00");
    let series = SeriesKey::new(InstrumentId::new("TQBR", "SBER"), Timeframe::M1);
    bridge.serve_candles(CandleBook::new(series.clone(), (0..10).map(bar).collect()));

    let dir = tempfile::tempdir().unwrap();
    let mut cfg = bridge.adapter_config(dir.path());
    cfg.feed_queue_capacity = 3;
    let adapter = QuikAdapter::start(cfg.clone()).unwrap();
    adapter.wait_ready().await.unwrap();

    let opts = FeedOptions {
        live_bars: false,
        ..FeedOptions::from_config(&cfg)
    };
    let mut feed = adapter.subscribe(series, opts).await.unwrap();
    // Let the first backfill run into the full queue.
    tokio::time::sleep(Duration::from_millis(300)).await;

    let mut delivered = Vec::new();
    while let Some(item) = next(&mut feed).await {
        if let FeedItem::Bar(b) = item {
            delivered.push(b.open_time);
        }
    }
    assert_eq!(delivered, minutes(0, 9), "every bar once, in order");
}

#[tokio::test]
async fn full_queue_with_live_bars_is_refetched() {
    let bridge = MockBridge::start().await.unwrap();
    terminal_time(&bridge, "10:09:00");
    let sber = InstrumentId::new("TQBR", "SBER");
    let series = SeriesKey::new(sber.clone(), Timeframe::M1);
    let book = CandleBook::new(series.clone(), vec![bar(0)]);
    bridge.serve_candles(Arc::clone(&book));

    let dir = tempfile::tempdir().unwrap();
    let mut cfg = bridge.adapter_config(dir.path());
    cfg.feed_queue_capacity = 4;
    let adapter = QuikAdapter::start(cfg.clone()).unwrap();
    adapter.wait_ready().await.unwrap();
    assert!(bridge.wait_event_clients(1, Duration::from_secs(2)).await);

    let opts = FeedOptions {
        live_bars: true,
        ..FeedOptions::from_config(&cfg)
    };
    let mut feed = adapter.subscribe(series, opts).await.unwrap();
    assert_eq!(next(&mut feed).await, Some(FeedItem::Status(FeedStatus::Delayed)));
    let mut delivered = bars_until(&mut feed, at(10, 0, 0)).await;
    assert_eq!(next(&mut feed).await, Some(FeedItem::Status(FeedStatus::Connected)));

    // The terminal closes 10:01..10:06; one tick per minute builds them live
    // while nobody reads the feed.
    for m in 1..=6 {
        book.push(bar(m));
    }
    for m in 1..=7u32 {
        bridge.push_event("OnAllTrade", all_trade(&sber, m as u64, 100.0, 1, at(10, m, 0)));
    }
    tokio::time::sleep(Duration::from_millis(1_200)).await;

    delivered.extend(bars_until(&mut feed, at(10, 6, 0)).await);
    assert_eq!(delivered, minutes(0, 6), "no gap and no duplicate: {delivered:?}");
    adapter.shutdown().await.unwrap();
}

#[tokio::test]
async fn dropped_market_events_trigger_a_refetch() {
    let bridge = MockBridge::start().await.unwrap();
    terminal_time(&bridge, "10:09:00");
    let sber = InstrumentId::new("TQBR", "SBER");
    let series = SeriesKey::new(sber.clone(), Timeframe::M1);
    let book = CandleBook::new(series.clone(), (0..5).map(bar).collect());
    bridge.serve_candles(Arc::clone(&book));

    let dir = tempfile::tempdir().unwrap();
    let mut cfg = bridge.adapter_config(dir.path());
    cfg.event_queue_capacity = 1;
    let adapter = QuikAdapter::start(cfg.clone()).unwrap();
    adapter.wait_ready().await.unwrap();
    assert!(bridge.wait_event_clients(1, Duration::from_secs(2)).await);

    let opts = FeedOptions {
        live_bars: true,
        ..FeedOptions::from_config(&cfg)
    };
    let mut feed = adapter.subscribe(series, opts).await.unwrap();
    let mut delivered = bars_until(&mut feed, at(10, 4, 0)).await;
    assert_eq!(next(&mut feed).await, Some(FeedItem::Status(FeedStatus::Connected)));

    // A burst far beyond the one-slot market queue. No tick reaches 10:08,
    // so the 10:07 bar can only come from the refetch.
    for m in 5..=7 {
        book.push(bar(m));
    }
    for n in 0..300u32 {
        let ts = at(10, 5 + n / 100, (n % 100) * 59 / 99);
        bridge.push_event("OnAllTrade", all_trade(&sber, 1_000 + n as u64, 100.0, 1, ts));
    }

    delivered.extend(bars_until(&mut feed, at(10, 7, 0)).await);
    assert_eq!(delivered, minutes(0, 7), "no gap and no duplicate: {delivered:?}");
    adapter.shutdown().await.unwrap();
}
