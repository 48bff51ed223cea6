//! Client-side DIMSE operations
//!
//! Each service borrows an association from the [`ConnectionPool`], drives a
//! single exchange on it and hands it back. Failures never escape as errors:
//! every call returns an [`OperationOutcome`].

pub mod echo;
pub mod query;
pub mod retrieve;
pub mod status;
pub mod store;

pub use echo::EchoService;
pub use query::QueryService;
pub use retrieve::RetrieveService;
pub use store::{StoreReport, StoreService};

use crate::association::AssociationHandle;
use crate::events::{EventBus, EventKind};
use crate::models::{LocalIdentity, OperationOutcome, Peer};
use crate::pool::ConnectionPool;

/// Check out an association, reporting the attempt on the event bus
pub(crate) fn checkout(
    pool: &ConnectionPool,
    events: &EventBus,
    peer: &Peer,
    local: &LocalIdentity,
) -> Result<AssociationHandle, OperationOutcome> {
    events.emit_kind(
        EventKind::ConnectionStarted,
        format!("Connecting to {}", peer.key()),
    );
    match pool.acquire(peer, local) {
        Ok(handle) => {
            events.emit_kind(
                EventKind::ConnectionCompleted,
                format!("Connected to {}", peer.key()),
            );
            Ok(handle)
        }
        Err(outcome) => {
            events.error(format!(
                "Connection to {} failed ({}): {}",
                peer.key(),
                outcome.status,
                outcome.last_error
            ));
            Err(outcome)
        }
    }
}
