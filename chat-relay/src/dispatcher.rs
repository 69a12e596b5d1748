//! Fan-out of chat messages to every registered session.
//!
//! A broadcast copies the registry membership under its lock and then
//! delivers without holding it, in registration order. A session that joins
//! while a broadcast is in flight may or may not receive that message.
//! Deliveries are bounded by each session's send timeout, so one stalled
//! client delays a broadcast by at most that long.

use std::sync::Arc;

use tracing::{trace, warn};

use crate::{
    message::{ChatMessage, ServerToClient},
    registry::Registry,
};

/// Outcome of a single broadcast.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub failed: usize,
}

#[derive(Debug, Clone)]
pub struct Dispatcher {
    registry: Arc<Registry>,
}

impl Dispatcher {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    /// Delivers `message` to every registered session, the sender included.
    ///
    /// Per-recipient failures are logged and counted, never returned.
    pub async fn broadcast(&self, message: ChatMessage) -> BroadcastReport {
        let recipients = self.registry.snapshot();
        let frame = Arc::new(ServerToClient::Chat(message));
        let mut report = BroadcastReport::default();

        for session in &recipients {
            match session.deliver(Arc::clone(&frame)).await {
                Ok(()) => report.delivered += 1,
                Err(error) => {
                    warn!(
                        session = %session.id(),
                        peer = ?session.peer(),
                        %error,
                        "failed to deliver message to a client"
                    );
                    report.failed += 1;
                }
            }
        }

        trace!(
            delivered = report.delivered,
            failed = report.failed,
            "broadcast finished"
        );
        report
    }
}
