//! Order state machine.
//!
//! ```text
//! New -> Submitted -> Accepted -> PartiallyFilled* -> Filled
//!          |   |          |              |
//!          |   +----------+--------------+--> Cancelled | Rejected | Expired
//!          +--> Rejected
//! ```
//!
//! Transitions are driven by terminal confirmations only. A terminal status
//! is final: replaying the event that produced it is a no-op, anything else
//! is a [`TransitionError`] and leaves the order untouched.

use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use qsync_schemas::{InstrumentId, Side};

// ---------------------------------------------------------------------------
// Status / type
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderStatus {
    New,
    Submitted,
    Accepted,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
    Expired,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Filled | Self::Cancelled | Self::Rejected | Self::Expired
        )
    }

    /// Sent to the terminal and not yet final.
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Submitted | Self::Accepted | Self::PartiallyFilled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Market,
    Limit,
    Stop,
    StopLimit,
}

impl OrderType {
    pub fn is_stop(&self) -> bool {
        matches!(self, Self::Stop | Self::StopLimit)
    }
}

/// Stop-order lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Expiry {
    #[default]
    Gtc,
    Today,
    Date(NaiveDate),
}

impl Expiry {
    /// `EXPIRY_DATE` transaction value.
    pub fn wire(&self) -> String {
        match self {
            Expiry::Gtc => "GTC".to_string(),
            Expiry::Today => "TODAY".to_string(),
            Expiry::Date(d) => d.format("%Y%m%d").to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum OrderEvent {
    /// The bridge took the transaction.
    Submitted,
    /// The terminal accepted the order.
    Accepted,
    /// A fill of `qty` units at `price` micros.
    Fill { qty: i64, price: i64 },
    /// The terminal reports the order completed.
    Completed,
    Cancelled,
    Rejected { reason: String },
    Expired,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionError {
    pub order_ref: u64,
    pub from: OrderStatus,
    pub event: String,
}

impl fmt::Display for TransitionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "illegal order transition: ref={} {:?} + {}",
            self.order_ref, self.from, self.event
        )
    }
}

impl std::error::Error for TransitionError {}

// ---------------------------------------------------------------------------
// Order
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    /// Local id; monotonically assigned, never reused.
    pub order_ref: u64,
    pub trans_id: i64,
    /// Terminal order number, assigned asynchronously.
    pub order_num: Option<u64>,
    /// Limit order spawned by a triggered stop.
    pub linked_order_num: Option<u64>,
    pub instrument: InstrumentId,
    pub side: Side,
    /// Units (not lots).
    pub size: i64,
    pub order_type: OrderType,
    pub price: Option<i64>,
    pub stop_price: Option<i64>,
    pub expiry: Expiry,
    pub status: OrderStatus,
    /// No acknowledgment within the command timeout; a late event still
    /// resolves the order.
    pub ack_pending: bool,
    /// Transaction id of an in-flight cancel.
    pub cancel_trans_id: Option<i64>,
    pub filled: i64,
    pub avg_fill_price: i64,
    pub reject_reason: Option<String>,
    /// One-cancels-other peer.
    #[serde(default)]
    pub oco: Option<u64>,
    /// Bracket parent; the order is held until the parent fills.
    #[serde(default)]
    pub parent: Option<u64>,
    /// `false`: held locally until the last order of its bracket arrives.
    #[serde(default = "transmit_default")]
    pub transmit: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn transmit_default() -> bool {
    true
}

impl Order {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        order_ref: u64,
        trans_id: i64,
        instrument: InstrumentId,
        side: Side,
        size: i64,
        order_type: OrderType,
        price: Option<i64>,
        stop_price: Option<i64>,
        expiry: Expiry,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            order_ref,
            trans_id,
            order_num: None,
            linked_order_num: None,
            instrument,
            side,
            size,
            order_type,
            price,
            stop_price,
            expiry,
            status: OrderStatus::New,
            ack_pending: false,
            cancel_trans_id: None,
            filled: 0,
            avg_fill_price: 0,
            reject_reason: None,
            oco: None,
            parent: None,
            transmit: true,
            created_at: now,
            updated_at: now,
        }
    }

    /// Opens a bracket: held, with children to follow.
    pub fn is_bracket_parent(&self) -> bool {
        self.parent.is_none() && !self.transmit
    }

    pub fn remaining(&self) -> i64 {
        (self.size - self.filled).max(0)
    }

    /// Apply one confirmed event. Returns whether the status changed.
    pub fn apply(&mut self, event: &OrderEvent, now: DateTime<Utc>) -> Result<bool, TransitionError> {
        use OrderEvent as E;
        use OrderStatus::*;

        let before = self.status;
        match (self.status, event) {
            (New, E::Submitted) => self.status = Submitted,
            (Submitted | Accepted | PartiallyFilled, E::Submitted) => {}

            (Submitted, E::Accepted) => {
                self.status = Accepted;
                self.ack_pending = false;
            }
            (Accepted | PartiallyFilled, E::Accepted) => {}

            (Submitted | Accepted | PartiallyFilled, E::Fill { qty, price }) => {
                self.ack_pending = false;
                self.add_fill(*qty, *price);
                self.status = if self.filled >= self.size {
                    Filled
                } else {
                    PartiallyFilled
                };
            }

            (Submitted | Accepted | PartiallyFilled, E::Completed) => {
                self.ack_pending = false;
                self.status = Filled;
            }
            (Submitted | Accepted | PartiallyFilled, E::Cancelled) => self.status = Cancelled,
            (New | Submitted | Accepted | PartiallyFilled, E::Rejected { reason }) => {
                self.reject_reason = Some(reason.clone());
                self.status = Rejected;
            }
            (Submitted | Accepted | PartiallyFilled, E::Expired) => self.status = Expired,

            // Replays of the event that made the order final.
            (Filled, E::Completed | E::Accepted | E::Submitted)
            | (Cancelled, E::Cancelled | E::Accepted | E::Submitted)
            | (Rejected, E::Rejected { .. })
            | (Expired, E::Expired) => {}

            (from, ev) => {
                return Err(TransitionError {
                    order_ref: self.order_ref,
                    from,
                    event: format!("{ev:?}"),
                });
            }
        }

        if self.status != before {
            self.updated_at = now;
        }
        Ok(self.status != before)
    }

    /// A fill confirmed after the order went final (fill raced a cancel, or
    /// `Completed` arrived before the trade). Quantities move, status does not.
    pub fn record_late_fill(&mut self, qty: i64, price: i64, now: DateTime<Utc>) {
        self.add_fill(qty, price);
        self.updated_at = now;
    }

    fn add_fill(&mut self, qty: i64, price: i64) {
        let prev = self.filled as i128 * self.avg_fill_price as i128;
        let total = self.filled.saturating_add(qty);
        if total > 0 {
            let avg = (prev + qty as i128 * price as i128) / total as i128;
            self.avg_fill_price = avg.clamp(i64::MIN as i128, i64::MAX as i128) as i64;
        }
        self.filled = total;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order(size: i64) -> Order {
        Order::new(
            1,
            100,
            InstrumentId::new("TQBR", "SBER"),
            Side::Buy,
            size,
            OrderType::Limit,
            Some(50_000_000),
            None,
            Expiry::Gtc,
            Utc::now(),
        )
    }

    fn apply(o: &mut Order, ev: OrderEvent) -> Result<bool, TransitionError> {
        o.apply(&ev, Utc::now())
    }

    #[test]
    fn happy_path_to_filled() {
        let mut o = order(10);
        assert!(apply(&mut o, OrderEvent::Submitted).unwrap());
        assert!(apply(&mut o, OrderEvent::Accepted).unwrap());
        apply(&mut o, OrderEvent::Fill { qty: 4, price: 50_000_000 }).unwrap();
        assert_eq!(o.status, OrderStatus::PartiallyFilled);
        apply(&mut o, OrderEvent::Fill { qty: 6, price: 51_000_000 }).unwrap();
        assert_eq!(o.status, OrderStatus::Filled);
        assert_eq!(o.filled, 10);
        assert_eq!(o.avg_fill_price, 50_600_000);
    }

    #[test]
    fn late_ack_resolves_pending() {
        let mut o = order(1);
        apply(&mut o, OrderEvent::Submitted).unwrap();
        o.ack_pending = true;
        apply(&mut o, OrderEvent::Accepted).unwrap();
        assert!(!o.ack_pending);
        assert_eq!(o.status, OrderStatus::Accepted);
    }

    #[test]
    fn terminal_states_never_regress() {
        for (final_event, status) in [
            (OrderEvent::Completed, OrderStatus::Filled),
            (OrderEvent::Cancelled, OrderStatus::Cancelled),
            (OrderEvent::Rejected { reason: "x".into() }, OrderStatus::Rejected),
            (OrderEvent::Expired, OrderStatus::Expired),
        ] {
            let mut o = order(1);
            apply(&mut o, OrderEvent::Submitted).unwrap();
            apply(&mut o, final_event.clone()).unwrap();
            assert_eq!(o.status, status);

            assert!(!apply(&mut o, final_event).unwrap(), "replay is a no-op");
            let _ = apply(&mut o, OrderEvent::Fill { qty: 1, price: 1 });
            let _ = apply(&mut o, OrderEvent::Expired);
            let _ = apply(&mut o, OrderEvent::Rejected { reason: "y".into() });
            assert_eq!(o.status, status, "{status:?} must stay final");
        }
    }

    #[test]
    fn fill_on_new_order_is_illegal() {
        let mut o = order(1);
        let err = apply(&mut o, OrderEvent::Fill { qty: 1, price: 1 }).unwrap_err();
        assert_eq!(err.from, OrderStatus::New);
        assert_eq!(o.filled, 0);
    }

    #[test]
    fn late_fill_moves_quantity_only() {
        let mut o = order(2);
        apply(&mut o, OrderEvent::Submitted).unwrap();
        apply(&mut o, OrderEvent::Cancelled).unwrap();
        o.record_late_fill(1, 10_000_000, Utc::now());
        assert_eq!(o.status, OrderStatus::Cancelled);
        assert_eq!(o.filled, 1);
    }

    #[test]
    fn expiry_wire_values() {
        assert_eq!(Expiry::Gtc.wire(), "GTC");
        assert_eq!(Expiry::Today.wire(), "TODAY");
        let d = NaiveDate::from_ymd_opt(2024, 12, 20).unwrap();
        assert_eq!(Expiry::Date(d).wire(), "20241220");
    }
}
