//! qsync-reconcile
//!
//! Authoritative local view of orders, fills, positions and cash. Pure logic,
//! no IO: the adapter feeds terminal events in and reads copies out.

pub mod account;
pub mod engine;
pub mod id_map;
pub mod order;
pub mod position;
pub mod restore;
pub mod transaction;

pub use account::{resolve_routing, AccountError, AccountRouting, CashMode, CommissionModel};
pub use engine::{Fill, FillIds, FollowUp, OrderRequest, ReconcileError, Reconciler, ReconcilerSnapshot, ReconcilerView};
pub use id_map::{OrderIdMap, TransKind};
pub use order::{Expiry, Order, OrderEvent, OrderStatus, OrderType, TransitionError};
pub use position::Position;
pub use restore::{resync_orders, RestoreReport};
pub use transaction::{build_cancel, build_new_order, quantity, BuildError, TransactionContext};
