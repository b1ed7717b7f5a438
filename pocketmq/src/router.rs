//! Fan-out of published messages to subscribers.

use parking_lot::RwLock;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{trace, warn};

use crate::directory::SubscriptionDirectory;
use crate::registry::ClientRegistry;
use crate::types::Message;

/// Outcome of routing one message.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    /// Queued on a registered subscriber's outbox.
    pub delivered: usize,
    /// Directory entries with no registered session.
    pub skipped: usize,
    /// Subscribers whose outbox was full or closed.
    pub failed: usize,
}

impl Delivery {
    /// Number of directory entries considered.
    pub fn matched(&self) -> usize {
        self.delivered + self.skipped + self.failed
    }
}

/// Route `msg` to every subscriber of its topic.
///
/// Takes the registry lock before the directory lock, the same order used by
/// disconnect cleanup. Both are released before any outbox is touched, and
/// enqueueing never waits, so a slow subscriber cannot hold up the others.
pub(crate) fn route(
    registry: &RwLock<ClientRegistry>,
    directory: &RwLock<SubscriptionDirectory>,
    msg: &Message,
) -> Delivery {
    let targets: Vec<_> = {
        let registry = registry.read();
        let directory = directory.read();
        directory
            .subscribers(&msg.topic)
            .iter()
            .map(|id| (id.clone(), registry.outbox(id).cloned()))
            .collect()
    };

    let mut delivery = Delivery::default();
    for (id, outbox) in targets {
        let Some(outbox) = outbox else {
            trace!("Skipping {} for {}: not connected", id, msg.topic);
            delivery.skipped += 1;
            continue;
        };

        match outbox.try_send(msg.clone()) {
            Ok(()) => delivery.delivered += 1,
            Err(TrySendError::Full(_)) => {
                warn!("Failed to forward to {}: outbound queue full", id);
                delivery.failed += 1;
            }
            Err(TrySendError::Closed(_)) => {
                warn!("Failed to forward to {}: session closed", id);
                delivery.failed += 1;
            }
        }
    }

    delivery
}
