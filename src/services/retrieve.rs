//! C-MOVE SCU. C-GET is not supported and says so.

use std::sync::Arc;

use dicom_object::InMemDicomObject;
use dimse::{command, uids, DimseCommand, DimseMessage, DimseStatus, Incoming, Priority};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::association::AssociationHandle;
use crate::events::{EventBus, EventKind};
use crate::models::query::move_identifier;
use crate::models::{validate_ae_title, LocalIdentity, OperationOutcome, OperationStatus, Peer};
use crate::pool::ConnectionPool;
use crate::services::{checkout, status};
use crate::tasks::{CancelSlot, Cancellable};

#[derive(Debug)]
pub struct RetrieveService {
    pool: Arc<ConnectionPool>,
    events: Arc<EventBus>,
    cancel: CancelSlot,
}

impl RetrieveService {
    pub fn new(pool: Arc<ConnectionPool>, events: Arc<EventBus>) -> Self {
        Self {
            pool,
            events,
            cancel: CancelSlot::new(),
        }
    }

    pub fn cancel_retrieve(&self) {
        self.cancel.cancel();
    }

    /// Move a whole study to our storage listener (or the peer's configured destination)
    pub fn retrieve_study(
        &self,
        peer: &Peer,
        local: &LocalIdentity,
        study_instance_uid: &str,
        progress: Option<&mut dyn FnMut(f32)>,
    ) -> OperationOutcome {
        self.retrieve_study_move(peer, local, study_instance_uid, progress)
    }

    pub fn retrieve_study_move(
        &self,
        peer: &Peer,
        local: &LocalIdentity,
        study_instance_uid: &str,
        progress: Option<&mut dyn FnMut(f32)>,
    ) -> OperationOutcome {
        if study_instance_uid.is_empty() {
            return OperationOutcome::invalid_parameters("a Study Instance UID is required");
        }
        self.run_move(peer, local, move_identifier(study_instance_uid, None), progress)
    }

    pub fn retrieve_series(
        &self,
        peer: &Peer,
        local: &LocalIdentity,
        study_instance_uid: &str,
        series_instance_uid: &str,
        progress: Option<&mut dyn FnMut(f32)>,
    ) -> OperationOutcome {
        if study_instance_uid.is_empty() || series_instance_uid.is_empty() {
            return OperationOutcome::invalid_parameters(
                "both a Study and a Series Instance UID are required",
            );
        }
        self.run_move(
            peer,
            local,
            move_identifier(study_instance_uid, Some(series_instance_uid)),
            progress,
        )
    }

    /// C-GET retrieval is not implemented
    pub fn retrieve_study_get(
        &self,
        peer: &Peer,
        _local: &LocalIdentity,
        study_instance_uid: &str,
    ) -> OperationOutcome {
        warn!(
            peer = %peer.key(),
            study = study_instance_uid,
            "C-GET requested but not implemented"
        );
        OperationOutcome::new(
            OperationStatus::NotImplemented,
            "C-GET retrieval is not implemented; use C-MOVE",
        )
    }

    fn run_move(
        &self,
        peer: &Peer,
        local: &LocalIdentity,
        identifier: InMemDicomObject,
        progress: Option<&mut dyn FnMut(f32)>,
    ) -> OperationOutcome {
        // sub-operations land on our listener, which must be running
        if !local.storage_enabled {
            return OperationOutcome::invalid_parameters(
                "local storage is disabled; a C-MOVE has nowhere to deliver",
            );
        }
        let destination = move_destination(peer, local);
        if let Err(e) = validate_ae_title(&destination) {
            return OperationOutcome::invalid_parameters(format!("move destination: {}", e));
        }

        let token = self.cancel.begin();
        info!(peer = %peer.key(), destination = %destination, "C-MOVE");
        self.events.emit_kind(
            EventKind::RetrieveStarted,
            format!("C-MOVE from {} to {}", peer.key(), destination),
        );

        let mut handle = match checkout(&self.pool, &self.events, peer, local) {
            Ok(handle) => handle,
            Err(outcome) => return outcome,
        };
        let mut exchange = MoveExchange {
            events: &self.events,
            token: &token,
            progress,
        };
        let outcome = exchange.run(&mut handle, &destination, identifier);
        self.pool.release(handle);

        match outcome.status {
            OperationStatus::Success => {
                exchange.report(1.0);
                self.events.progress(
                    EventKind::RetrieveCompleted,
                    format!("C-MOVE from {} completed", peer.key()),
                    1.0,
                );
            }
            OperationStatus::Cancelled => self.events.emit_kind(
                EventKind::RetrieveCompleted,
                format!("C-MOVE from {} cancelled", peer.key()),
            ),
            _ => self
                .events
                .error(format!("C-MOVE from {} failed: {}", peer.key(), outcome.last_error)),
        }
        outcome
    }
}

impl Cancellable for RetrieveService {
    fn cancel_slot(&self) -> &CancelSlot {
        &self.cancel
    }
}

/// The peer's configured destination, else our own AE title
fn move_destination(peer: &Peer, local: &LocalIdentity) -> String {
    peer.move_destination_ae
        .as_deref()
        .map(str::trim)
        .filter(|ae| !ae.is_empty())
        .unwrap_or(local.ae_title.as_str())
        .to_string()
}

struct MoveExchange<'a, 'cb> {
    events: &'a EventBus,
    token: &'a CancellationToken,
    progress: Option<&'cb mut (dyn FnMut(f32) + 'cb)>,
}

impl MoveExchange<'_, '_> {
    fn report(&mut self, fraction: f32) {
        if let Some(callback) = self.progress.as_deref_mut() {
            callback(fraction);
        }
        self.events.progress(
            EventKind::RetrieveProgress,
            format!("{:.0}% of sub-operations done", fraction * 100.0),
            fraction,
        );
    }

    fn run(
        &mut self,
        handle: &mut AssociationHandle,
        destination: &str,
        identifier: InMemDicomObject,
    ) -> OperationOutcome {
        let context = match handle.require_context(uids::STUDY_ROOT_QR_MOVE) {
            Ok(context) => context,
            Err(outcome) => return outcome,
        };
        let message_id = handle.next_message_id();
        let request = DimseMessage::new(
            context.id,
            command::move_rq(
                message_id,
                uids::STUDY_ROOT_QR_MOVE,
                Priority::Medium,
                destination,
            ),
        )
        .with_dataset(identifier);
        if let Err(e) = handle.send(request) {
            return OperationOutcome::from(&e);
        }

        let timeout = handle.peer().timeout();
        let mut cancel_sent = false;
        loop {
            let reply = match handle.receive(timeout) {
                Ok(Incoming::Message(reply)) => reply,
                Ok(_) => {
                    return OperationOutcome::new(
                        OperationStatus::NetworkError,
                        "association closed by peer during C-MOVE",
                    )
                }
                Err(e) => return OperationOutcome::from(&e),
            };
            if command::message_id_responded_to(&reply.command) != Some(message_id) {
                debug!("Ignoring reply to another message");
                continue;
            }

            let status = command::response_status(&reply.command);
            let counters = command::sub_operations(&reply.command);
            debug!(?status, ?counters, "C-MOVE response");

            if status != DimseStatus::Pending {
                if let Some(comment) = command::error_comment(&reply.command) {
                    warn!("C-MOVE error comment: {}", comment);
                }
                return status::final_outcome(DimseCommand::Move, status, self.token.is_cancelled());
            }

            if let Some(fraction) = counters.progress() {
                self.report(fraction);
            }

            if self.token.is_cancelled() && !cancel_sent {
                cancel_sent = true;
                info!("Cancelling C-MOVE (message {})", message_id);
                let cancel = DimseMessage::new(context.id, command::cancel_rq(message_id));
                if let Err(e) = handle.send(cancel) {
                    warn!("Could not send C-CANCEL: {}", e);
                    return OperationOutcome::cancelled();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_move_destination_prefers_peer_setting() {
        let local = LocalIdentity::new("LOCAL");
        let peer = Peer::new("pacs", "PACS", "127.0.0.1", 104);
        assert_eq!(move_destination(&peer, &local), "LOCAL");

        let peer = peer.with_move_destination("ARCHIVE");
        assert_eq!(move_destination(&peer, &local), "ARCHIVE");

        let peer = Peer::new("pacs", "PACS", "127.0.0.1", 104).with_move_destination("  ");
        assert_eq!(move_destination(&peer, &local), "LOCAL");
    }
}
