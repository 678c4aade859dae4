//! Scenario: replaying a fill changes nothing
//!
//! GREEN when:
//! - the same trade number delivered twice is applied once
//! - the dedupe set survives a snapshot/restore cycle through JSON
//! - the same trade number on another instrument is a different fill

use chrono::Utc;

use qsync_protocol::events::OwnTrade;
use qsync_protocol::wire::QuikDateTime;
use qsync_protocol::BridgeEvent;
use qsync_reconcile::{
    CommissionModel, Expiry, OrderRequest, OrderType, Reconciler, ReconcilerSnapshot,
};
use qsync_schemas::{InstrumentId, Side};

fn trade(class: &str, sec: &str, trade_num: u64, trans_id: i64) -> BridgeEvent {
    BridgeEvent::OwnTrade(OwnTrade {
        trade_num,
        order_num: 9,
        trans_id,
        price: 100.0,
        qty: 1,
        flags: 0,
        class_code: class.into(),
        sec_code: sec.into(),
        datetime: QuikDateTime::default(),
        exchange_comission: 0.0,
        broker_comission: 0.0,
        clearing_comission: 0.0,
        tech_center_comission: 0.0,
    })
}

fn market_buy(id: InstrumentId, size: i64) -> OrderRequest {
    OrderRequest {
        instrument: id,
        side: Side::Buy,
        size,
        order_type: OrderType::Market,
        price: None,
        stop_price: None,
        expiry: Expiry::Gtc,
        oco: None,
        parent: None,
        transmit: true,
    }
}

#[test]
fn replayed_fill_is_applied_once() {
    let now = Utc::now();
    let mut r = Reconciler::new(false, CommissionModel::default());
    let o = r.create_order(market_buy(InstrumentId::new("TQBR", "SBER"), 5), 1, now);
    r.mark_submitted(o, false, now).unwrap();

    assert!(r.apply_event(&trade("TQBR", "SBER", 42, 1), now));
    let before = r.snapshot();

    for _ in 0..3 {
        assert!(
            !r.apply_event(&trade("TQBR", "SBER", 42, 1), now),
            "duplicate must be ignored"
        );
    }
    assert_eq!(r.snapshot(), before, "replay must not change any state");
    assert_eq!(r.order(o).unwrap().filled, 1);
}

#[test]
fn dedupe_survives_restart() {
    let now = Utc::now();
    let mut r = Reconciler::new(false, CommissionModel::default());
    let o = r.create_order(market_buy(InstrumentId::new("TQBR", "SBER"), 5), 1, now);
    r.mark_submitted(o, false, now).unwrap();
    r.apply_event(&trade("TQBR", "SBER", 42, 1), now);

    let json = serde_json::to_string(&r.snapshot()).unwrap();
    let snap: ReconcilerSnapshot = serde_json::from_str(&json).unwrap();
    let mut back = Reconciler::restore(snap, false, CommissionModel::default());

    assert!(!back.apply_event(&trade("TQBR", "SBER", 42, 1), now));
    assert_eq!(back.fills().len(), 1);
    assert_eq!(back.position(&InstrumentId::new("TQBR", "SBER")).unwrap().size, 1);

    // Trade numbers are per instrument.
    let g = back.create_order(market_buy(InstrumentId::new("TQBR", "GAZP"), 1), 2, now);
    back.mark_submitted(g, false, now).unwrap();
    assert!(back.apply_event(&trade("TQBR", "GAZP", 42, 2), now));
    assert_eq!(back.fills().len(), 2);
}
