//! Transaction id / terminal order number → local order ref.
//!
//! Every transaction the adapter sends (new order or cancel) gets a
//! `trans_id`; the terminal answers with the same id and later assigns an
//! `order_num`. Both keys resolve to the local `order_ref`. A missing entry
//! means the event belongs to an order this adapter did not place, and the
//! caller must ignore it rather than guess.

use std::collections::HashMap;

/// What a transaction id was issued for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransKind {
    New,
    Cancel,
}

#[derive(Clone, Debug, Default)]
pub struct OrderIdMap {
    by_trans: HashMap<i64, (u64, TransKind)>,
    by_order_num: HashMap<u64, u64>,
}

impl OrderIdMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_trans(&mut self, trans_id: i64, order_ref: u64, kind: TransKind) {
        self.by_trans.insert(trans_id, (order_ref, kind));
    }

    /// Terminal order numbers are stable; re-registering overwrites.
    pub fn register_order_num(&mut self, order_num: u64, order_ref: u64) {
        if order_num != 0 {
            self.by_order_num.insert(order_num, order_ref);
        }
    }

    pub fn by_trans(&self, trans_id: i64) -> Option<(u64, TransKind)> {
        self.by_trans.get(&trans_id).copied()
    }

    pub fn by_order_num(&self, order_num: u64) -> Option<u64> {
        self.by_order_num.get(&order_num).copied()
    }

    pub fn contains_trans(&self, trans_id: i64) -> bool {
        self.by_trans.contains_key(&trans_id)
    }

    pub fn len(&self) -> usize {
        self.by_trans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_trans.is_empty()
    }
}
