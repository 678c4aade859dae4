//! Linked-order task: carries out the [`FollowUp`]s the reconciler queues
//! when an OCO peer or a bracket order finishes.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use qsync_reconcile::FollowUp;

use crate::adapter::Shared;
use crate::broker;

pub(crate) async fn run(shared: Arc<Shared>, mut rx: mpsc::UnboundedReceiver<FollowUp>) {
    while let Some(follow_up) = rx.recv().await {
        match follow_up {
            FollowUp::Place(order_ref) => match broker::place(&shared, order_ref).await {
                Ok(order) => info!(order_ref, status = ?order.status, "bracket child placed"),
                Err(e) => warn!(order_ref, error = %format!("{e:#}"), "bracket child not placed"),
            },
            FollowUp::Cancel(order_ref) => match broker::cancel(&shared, order_ref).await {
                Ok(_) => info!(order_ref, "linked order cancel sent"),
                // Already final or a cancel is in flight.
                Err(e) => warn!(order_ref, error = %format!("{e:#}"), "linked order cancel not sent"),
            },
        }
    }
    debug!("linked order task finished");
}
