//! C-FIND SCU at study and series level

use std::sync::Arc;

use dicom_object::InMemDicomObject;
use dimse::{command, uids, DimseCommand, DimseMessage, DimseStatus, Incoming, Priority};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::association::AssociationHandle;
use crate::events::{EventBus, EventKind};
use crate::models::query::series_identifier;
use crate::models::{
    LocalIdentity, OperationOutcome, OperationStatus, Peer, QueryFilter, RemoteSeriesInfo,
    RemoteStudyInfo,
};
use crate::pool::ConnectionPool;
use crate::services::{checkout, status};
use crate::tasks::{CancelSlot, Cancellable};

#[derive(Debug)]
pub struct QueryService {
    pool: Arc<ConnectionPool>,
    events: Arc<EventBus>,
    cancel: CancelSlot,
    series_limit: usize,
}

impl QueryService {
    pub fn new(pool: Arc<ConnectionPool>, events: Arc<EventBus>) -> Self {
        Self {
            pool,
            events,
            cancel: CancelSlot::new(),
            series_limit: 0,
        }
    }

    /// Keep at most `limit` series per query (0 keeps all)
    pub fn with_series_limit(mut self, limit: usize) -> Self {
        self.series_limit = limit;
        self
    }

    /// Stop the running query at its next reply
    pub fn cancel_query(&self) {
        self.cancel.cancel();
    }

    /// Study level C-FIND.
    ///
    /// Matches beyond `filter.max_results` are dropped without cancelling
    /// the exchange upstream.
    pub fn query_studies(
        &self,
        peer: &Peer,
        local: &LocalIdentity,
        filter: &QueryFilter,
        callback: Option<&mut dyn FnMut(&RemoteStudyInfo)>,
    ) -> (OperationOutcome, Vec<RemoteStudyInfo>) {
        info!(peer = %peer.key(), "C-FIND studies");
        self.run_find(
            peer,
            local,
            filter.to_study_identifier(),
            filter.max_results,
            RemoteStudyInfo::from_identifier,
            callback,
        )
    }

    /// Series level C-FIND for one study
    pub fn query_series(
        &self,
        peer: &Peer,
        local: &LocalIdentity,
        study_instance_uid: &str,
        callback: Option<&mut dyn FnMut(&RemoteSeriesInfo)>,
    ) -> (OperationOutcome, Vec<RemoteSeriesInfo>) {
        if study_instance_uid.is_empty() {
            return (
                OperationOutcome::invalid_parameters("a Study Instance UID is required"),
                Vec::new(),
            );
        }
        info!(peer = %peer.key(), study = study_instance_uid, "C-FIND series");
        self.run_find(
            peer,
            local,
            series_identifier(study_instance_uid),
            self.series_limit,
            RemoteSeriesInfo::from_identifier,
            callback,
        )
    }

    fn run_find<T>(
        &self,
        peer: &Peer,
        local: &LocalIdentity,
        identifier: InMemDicomObject,
        limit: usize,
        parse: fn(&InMemDicomObject) -> T,
        callback: Option<&mut dyn FnMut(&T)>,
    ) -> (OperationOutcome, Vec<T>) {
        let token = self.cancel.begin();
        self.events
            .emit_kind(EventKind::QueryStarted, format!("C-FIND on {}", peer.key()));

        let mut handle = match checkout(&self.pool, &self.events, peer, local) {
            Ok(handle) => handle,
            Err(outcome) => return (outcome, Vec::new()),
        };
        let mut exchange = FindExchange {
            events: &self.events,
            token: &token,
            limit,
            parse,
            callback,
            results: Vec::new(),
        };
        let outcome = exchange.run(&mut handle, identifier);
        let results = exchange.results;
        self.pool.release(handle);

        match outcome.status {
            OperationStatus::Success => self.events.progress(
                EventKind::QueryCompleted,
                format!("C-FIND on {} returned {} matches", peer.key(), results.len()),
                1.0,
            ),
            OperationStatus::Cancelled => self.events.emit_kind(
                EventKind::QueryCompleted,
                format!("C-FIND on {} cancelled after {} matches", peer.key(), results.len()),
            ),
            _ => self
                .events
                .error(format!("C-FIND on {} failed: {}", peer.key(), outcome.last_error)),
        }
        (outcome, results)
    }
}

impl Cancellable for QueryService {
    fn cancel_slot(&self) -> &CancelSlot {
        &self.cancel
    }
}

/// State of one C-FIND exchange
struct FindExchange<'a, 'cb, T> {
    events: &'a EventBus,
    token: &'a CancellationToken,
    limit: usize,
    parse: fn(&InMemDicomObject) -> T,
    callback: Option<&'cb mut (dyn FnMut(&T) + 'cb)>,
    results: Vec<T>,
}

impl<T> FindExchange<'_, '_, T> {
    fn run(
        &mut self,
        handle: &mut AssociationHandle,
        identifier: InMemDicomObject,
    ) -> OperationOutcome {
        let context = match handle.require_context(uids::STUDY_ROOT_QR_FIND) {
            Ok(context) => context,
            Err(outcome) => return outcome,
        };
        let message_id = handle.next_message_id();
        let request = DimseMessage::new(
            context.id,
            command::find_rq(message_id, uids::STUDY_ROOT_QR_FIND, Priority::Medium),
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
                        "association closed by peer during C-FIND",
                    )
                }
                Err(e) => return OperationOutcome::from(&e),
            };
            if command::message_id_responded_to(&reply.command) != Some(message_id) {
                debug!("Ignoring reply to another message");
                continue;
            }

            let status = command::response_status(&reply.command);
            if status != DimseStatus::Pending {
                return status::final_outcome(DimseCommand::Find, status, self.token.is_cancelled());
            }

            if self.token.is_cancelled() {
                if !cancel_sent {
                    cancel_sent = true;
                    info!("Cancelling C-FIND (message {})", message_id);
                    let cancel = DimseMessage::new(context.id, command::cancel_rq(message_id));
                    if let Err(e) = handle.send(cancel) {
                        warn!("Could not send C-CANCEL: {}", e);
                        return OperationOutcome::cancelled();
                    }
                }
                continue;
            }
            self.on_match(reply.dataset);
        }
    }

    fn on_match(&mut self, dataset: Option<InMemDicomObject>) {
        if self.limit > 0 && self.results.len() >= self.limit {
            debug!("Dropping match beyond the {} result limit", self.limit);
            return;
        }
        let Some(dataset) = dataset else {
            warn!("Pending C-FIND response without an identifier");
            return;
        };

        let item = (self.parse)(&dataset);
        if let Some(callback) = self.callback.as_deref_mut() {
            callback(&item);
        }
        self.results.push(item);

        let progress = if self.limit > 0 {
            (self.results.len() as f32 / self.limit as f32).min(1.0)
        } else {
            0.0
        };
        self.events.progress(
            EventKind::QueryProgress,
            format!("{} matches", self.results.len()),
            progress,
        );
    }
}
