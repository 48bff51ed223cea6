use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::events::{EventBus, EventKind};
use crate::models::{LocalIdentity, OperationOutcome, Peer};
use crate::pool::ConnectionPool;
use crate::services::checkout;

/// C-ECHO verification
#[derive(Debug, Clone)]
pub struct EchoService {
    pool: Arc<ConnectionPool>,
    events: Arc<EventBus>,
}

impl EchoService {
    pub fn new(pool: Arc<ConnectionPool>, events: Arc<EventBus>) -> Self {
        Self { pool, events }
    }

    /// One verification round trip; never retried
    pub fn perform_echo(
        &self,
        peer: &Peer,
        local: &LocalIdentity,
        timeout: Duration,
    ) -> OperationOutcome {
        info!(peer = %peer.key(), "C-ECHO");
        self.events
            .emit_kind(EventKind::EchoStarted, format!("C-ECHO to {}", peer.key()));

        let mut handle = match checkout(&self.pool, &self.events, peer, local) {
            Ok(handle) => handle,
            Err(outcome) => return outcome,
        };
        let outcome = handle.send_echo(timeout);
        self.pool.release(handle);

        if outcome.is_success() {
            self.events.progress(
                EventKind::EchoCompleted,
                format!("C-ECHO to {} succeeded", peer.key()),
                1.0,
            );
        } else {
            self.events.error(format!(
                "C-ECHO to {} failed: {}",
                peer.key(),
                outcome.last_error
            ));
        }
        outcome
    }
}
