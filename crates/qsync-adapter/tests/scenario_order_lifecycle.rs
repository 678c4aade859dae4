//! Scenario: order lifecycle through the bridge
//!
//! GREEN when:
//! - after connect the trade account is resolved and cash comes from the
//!   matching money limit
//! - Buy 10 @ 50.00 limit goes out as one `NEW_ORDER` transaction and the
//!   returned order is `Submitted`
//! - reply status 3 then one fill 10 @ 50.00 leave the order `Filled`, the
//!   position +10 @ 50.00 and cash down by 500.00 plus commission
//! - order updates arrive as Submitted, Accepted, Filled
//! - cancelling a filled order is refused; an unknown instrument is a local
//!   rejection, never sent
//! - a transaction whose connection drops before the answer stays
//!   `Submitted` with its ack pending, survives the reconnect resync and
//!   is filled by the events that follow

use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::broadcast;

use qsync_adapter::{Expiry, Order, OrderRequest, OrderStatus, OrderType, QuikAdapter};
use qsync_schemas::{InstrumentId, Side};
use qsync_testkit::payloads::{own_trade, trans_reply};
use qsync_testkit::{at, eventually, MockBridge, MockReply};

const M: i64 = 1_000_000;

fn script_account(bridge: &MockBridge) {
    bridge.on_data(
        "getTradeAccounts",
        json!([{ "class_codes": "|TQBR|", "firmid": "MC0002500000", "trdaccid": "L01-00000F00" }]),
    );
    bridge.on_data(
        "getMoneyLimits",
        json!([{
            "currcode": "SUR",
            "firmid": "MC0002500000",
            "client_code": "12345",
            "currentbal": 100000.0,
            "limit_kind": 2
        }]),
    );
    bridge.on_data("get_depo_limits", json!([]));
    bridge.on_data("get_orders", json!([]));
    bridge.on_data("get_stop_orders", json!([]));
    bridge.on("getSecurityInfo", |args| match args.as_str() {
        Some("TQBR|SBER") => MockReply::Data(json!({
            "lot_size": 1,
            "min_price_step": 0.01,
            "scale": 2,
            "face_value": 3.0
        })),
        _ => MockReply::Data(Value::Null),
    });
    bridge.on_data("sendTransaction", json!(true));
}

async fn update(rx: &mut broadcast::Receiver<Order>) -> Order {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("order update in time")
        .expect("update channel open")
}

fn buy_10_at_50() -> OrderRequest {
    OrderRequest {
        instrument: InstrumentId::new("TQBR", "SBER"),
        side: Side::Buy,
        size: 10,
        order_type: OrderType::Limit,
        price: Some(50 * M),
        stop_price: None,
        expiry: Expiry::Gtc,
        oco: None,
        parent: None,
        transmit: true,
    }
}

#[tokio::test]
async fn buy_ack_fill_updates_position_and_cash() {
    let bridge = MockBridge::start().await.unwrap();
    script_account(&bridge);

    let dir = tempfile::tempdir().unwrap();
    let mut cfg = bridge.adapter_config(dir.path());
    cfg.limit_kind = 2;
    cfg.commission_per_lot = 1.0;
    let adapter = QuikAdapter::start(cfg).unwrap();
    adapter.wait_ready().await.unwrap();
    assert!(bridge.wait_event_clients(1, Duration::from_secs(2)).await);

    let routing = adapter.routing().expect("account resolved");
    assert_eq!(routing.trade_account_id, "L01-00000F00");
    assert_eq!(routing.client_code, "12345");
    assert_eq!(adapter.cash(), 100_000 * M);

    let mut updates = adapter.order_updates();
    let order = adapter.submit(buy_10_at_50()).await.unwrap();
    assert_eq!(order.status, OrderStatus::Submitted);
    assert!(!order.ack_pending);

    let sent = bridge.received("sendTransaction");
    assert_eq!(sent.len(), 1);
    let tx = &sent[0];
    assert_eq!(tx["ACTION"], "NEW_ORDER");
    assert_eq!(tx["TYPE"], "L");
    assert_eq!(tx["OPERATION"], "B");
    assert_eq!(tx["QUANTITY"], "10");
    assert_eq!(tx["PRICE"], "50.00");
    assert_eq!(tx["CLASSCODE"], "TQBR");
    assert_eq!(tx["SECCODE"], "SBER");
    assert_eq!(tx["ACCOUNT"], "L01-00000F00");
    assert_eq!(tx["CLIENT_CODE"], "12345");
    assert_eq!(tx["TRANS_ID"], order.trans_id.to_string());

    assert_eq!(update(&mut updates).await.status, OrderStatus::Submitted);

    bridge.push_event("OnTransReply", trans_reply(order.trans_id, 3, 555, "accepted"));
    assert_eq!(update(&mut updates).await.status, OrderStatus::Accepted);

    let sber = InstrumentId::new("TQBR", "SBER");
    let fill = own_trade(&sber, 9001, 555, order.trans_id, Side::Buy, 50.0, 10, at(10, 0, 5));
    bridge.push_event("OnTrade", fill.clone());
    let filled = update(&mut updates).await;
    assert_eq!(filled.status, OrderStatus::Filled);
    assert_eq!(filled.filled, 10);
    assert_eq!(filled.avg_fill_price, 50 * M);

    let a = &adapter;
    assert!(eventually(Duration::from_secs(2), || a.view().fills == 1).await);
    let pos = adapter.position(&sber).expect("position opened");
    assert_eq!(pos.size, 10);
    assert_eq!(pos.avg_price, 50 * M);
    assert_eq!(adapter.cash(), 100_000 * M - 500 * M - 10 * M, "notional plus 1.00 per lot");

    // The same trade number again changes nothing.
    bridge.push_event("OnTrade", fill);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(adapter.view().fills, 1);
    assert_eq!(adapter.position(&sber).unwrap().size, 10);

    let err = adapter.cancel(order.order_ref).await.unwrap_err();
    assert!(format!("{err:#}").contains("not live"), "got: {err:#}");
    assert_eq!(bridge.received("sendTransaction").len(), 1, "no kill sent");
}

#[tokio::test]
async fn local_failures_reject_without_sending() {
    let bridge = MockBridge::start().await.unwrap();
    script_account(&bridge);

    let dir = tempfile::tempdir().unwrap();
    let mut cfg = bridge.adapter_config(dir.path());
    cfg.limit_kind = 2;
    let adapter = QuikAdapter::start(cfg).unwrap();
    adapter.wait_ready().await.unwrap();

    let unknown = OrderRequest {
        instrument: InstrumentId::new("TQBR", "NOPE"),
        ..buy_10_at_50()
    };
    let order = adapter.submit(unknown).await.unwrap();
    assert_eq!(order.status, OrderStatus::Rejected);
    assert!(order.reject_reason.unwrap_or_default().contains("invalid instrument"));

    let no_price = OrderRequest {
        price: None,
        ..buy_10_at_50()
    };
    let order = adapter.submit(no_price).await.unwrap();
    assert_eq!(order.status, OrderStatus::Rejected);
    assert_eq!(order.order_ref, 2, "refs are never reused");

    assert!(bridge.received("sendTransaction").is_empty());
    assert!(adapter.cancel(99).await.is_err(), "unknown ref refused");
}

#[tokio::test]
async fn timed_out_submit_stays_submitted_until_the_reply() {
    let bridge = MockBridge::start().await.unwrap();
    script_account(&bridge);
    bridge.on("sendTransaction", |_| MockReply::NoReply);

    let dir = tempfile::tempdir().unwrap();
    let mut cfg = bridge.adapter_config(dir.path());
    cfg.limit_kind = 2;
    cfg.command_timeout_ms = 200;
    let adapter = QuikAdapter::start(cfg).unwrap();
    adapter.wait_ready().await.unwrap();
    assert!(bridge.wait_event_clients(1, Duration::from_secs(2)).await);

    let order = adapter.submit(buy_10_at_50()).await.unwrap();
    assert_eq!(order.status, OrderStatus::Submitted);
    assert!(order.ack_pending, "no acknowledgment within the command timeout");

    bridge.push_event("OnTransReply", trans_reply(order.trans_id, 3, 556, ""));
    let a = &adapter;
    let r = order.order_ref;
    assert!(
        eventually(Duration::from_secs(2), || {
            a.order(r).is_some_and(|o| o.status == OrderStatus::Accepted && !o.ack_pending)
        })
        .await,
        "late reply still resolves the order"
    );
}

#[tokio::test]
async fn transaction_lost_with_the_connection_waits_for_the_terminal() {
    let bridge = MockBridge::start().await.unwrap();
    script_account(&bridge);

    let dir = tempfile::tempdir().unwrap();
    let mut cfg = bridge.adapter_config(dir.path());
    cfg.limit_kind = 2;
    let adapter = QuikAdapter::start(cfg).unwrap();
    adapter.wait_ready().await.unwrap();
    assert!(bridge.wait_event_clients(1, Duration::from_secs(2)).await);
    let resyncs = bridge.received("get_stop_orders").len();

    bridge.on("sendTransaction", |_| MockReply::Disconnect);
    let order = adapter.submit(buy_10_at_50()).await.unwrap();
    assert_eq!(order.status, OrderStatus::Submitted, "written, so not rejected");
    assert!(order.ack_pending);
    assert_eq!(bridge.received("sendTransaction").len(), 1);
    bridge.on_data("sendTransaction", json!(true));

    // Reconnect and the resync that follows it; the empty tables must not
    // expire an order the terminal never confirmed.
    assert!(bridge.wait_event_clients(1, Duration::from_secs(5)).await);
    assert!(
        eventually(Duration::from_secs(5), || bridge.received("get_stop_orders").len() > resyncs).await
    );
    tokio::time::sleep(Duration::from_millis(200)).await;
    let pending = adapter.order(order.order_ref).unwrap();
    assert_eq!(pending.status, OrderStatus::Submitted);
    assert!(pending.ack_pending);

    bridge.push_event("OnTransReply", trans_reply(order.trans_id, 3, 556, "accepted"));
    let sber = InstrumentId::new("TQBR", "SBER");
    bridge.push_event(
        "OnTrade",
        own_trade(&sber, 9002, 556, order.trans_id, Side::Buy, 50.0, 10, at(10, 1, 0)),
    );

    let a = &adapter;
    assert!(
        eventually(Duration::from_secs(2), || {
            a.order(order.order_ref).is_some_and(|o| o.status == OrderStatus::Filled)
        })
        .await
    );
    assert!(!adapter.order(order.order_ref).unwrap().ack_pending);
    assert_eq!(adapter.position(&sber).unwrap().size, 10);
}
