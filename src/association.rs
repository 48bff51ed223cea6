//! One association with one peer
//!
//! An [`AssociationHandle`] walks `Disconnected -> Initializing ->
//! ParametersBuilt -> Requesting -> Connected` on [`connect`], and falls back
//! to `Disconnected` on any failure or on [`disconnect`]. Methods take
//! `&mut self`: whoever owns the handle is the only one driving it.
//!
//! [`connect`]: AssociationHandle::connect
//! [`disconnect`]: AssociationHandle::disconnect

use std::sync::Arc;
use std::time::{Duration, Instant};

use dimse::{
    command, uids, AssociationRequest, DimseCommand, DimseConnection, DimseEngine, DimseError,
    DimseMessage, DimseStatus, Incoming, NegotiatedContext,
};
use tracing::{debug, info, warn};

use crate::models::{LocalIdentity, OperationOutcome, OperationStatus, Peer};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Initializing,
    ParametersBuilt,
    Requesting,
    Connected,
}

pub struct AssociationHandle {
    engine: Arc<dyn DimseEngine>,
    peer: Peer,
    local: LocalIdentity,
    state: ConnectionState,
    connection: Option<Box<dyn DimseConnection>>,
    connected_at: Option<Instant>,
    last_error: String,
    next_message_id: u16,
}

impl AssociationHandle {
    pub fn new(engine: Arc<dyn DimseEngine>, peer: Peer, local: LocalIdentity) -> Self {
        Self {
            engine,
            peer,
            local,
            state: ConnectionState::Disconnected,
            connection: None,
            connected_at: None,
            last_error: String::new(),
            next_message_id: 1,
        }
    }

    /// Open the association, proposing `syntaxes` or the peer's defaults.
    ///
    /// A live association is released first.
    pub fn connect(&mut self, syntaxes: Option<&[String]>) -> OperationOutcome {
        if self.connection.is_some() {
            self.disconnect();
        }

        self.state = ConnectionState::Initializing;
        if let Err(outcome) = self.initialize_network() {
            return self.fail(outcome);
        }

        let request = self.build_parameters(syntaxes);
        self.state = ConnectionState::ParametersBuilt;

        match self.request_association(&request) {
            Ok(()) => OperationOutcome::success(),
            Err(outcome) => self.fail(outcome),
        }
    }

    fn initialize_network(&self) -> Result<(), OperationOutcome> {
        self.local
            .validate()
            .and_then(|_| self.peer.validate())
            .map_err(|e| OperationOutcome::invalid_parameters(e.to_string()))
    }

    fn build_parameters(&self, syntaxes: Option<&[String]>) -> AssociationRequest {
        let request = self.peer.association_request(&self.local, syntaxes);
        debug!(
            peer = %self.peer.key(),
            contexts = request.presentation_contexts.len(),
            "Association parameters built"
        );
        request
    }

    fn request_association(
        &mut self,
        request: &AssociationRequest,
    ) -> Result<(), OperationOutcome> {
        self.state = ConnectionState::Requesting;
        let connection = self
            .engine
            .open_association(request)
            .map_err(|e| OperationOutcome::from(&e))?;

        if connection.presentation_contexts().is_empty() {
            let mut connection = connection;
            connection.abort();
            return Err(OperationOutcome::new(
                OperationStatus::AssociationRejected,
                format!("{} accepted no presentation contexts", self.peer.ae_title),
            ));
        }

        info!(
            peer = %self.peer.key(),
            contexts = connection.presentation_contexts().len(),
            "Association established"
        );
        self.connection = Some(connection);
        self.connected_at = Some(Instant::now());
        self.last_error.clear();
        self.state = ConnectionState::Connected;
        Ok(())
    }

    fn fail(&mut self, outcome: OperationOutcome) -> OperationOutcome {
        warn!(
            peer = %self.peer.key(),
            status = %outcome.status,
            "Connect failed: {}",
            outcome.last_error
        );
        self.state = ConnectionState::Disconnected;
        self.connected_at = None;
        self.last_error = outcome.last_error.clone();
        outcome
    }

    /// Release the association if there is one. Safe to call repeatedly.
    pub fn disconnect(&mut self) {
        if let Some(mut connection) = self.connection.take() {
            if let Err(e) = connection.release() {
                debug!(peer = %self.peer.key(), "Release failed, aborting: {}", e);
                connection.abort();
            } else {
                debug!(peer = %self.peer.key(), "Association released");
            }
        }
        self.state = ConnectionState::Disconnected;
        self.connected_at = None;
    }

    /// Drop the association without the release handshake
    pub fn abort(&mut self) {
        if let Some(mut connection) = self.connection.take() {
            connection.abort();
        }
        self.state = ConnectionState::Disconnected;
        self.connected_at = None;
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected && self.connection.is_some()
    }

    /// True when disconnected or connected for longer than `threshold`
    pub fn has_timed_out(&self, threshold: Duration) -> bool {
        match (self.is_connected(), self.connected_at) {
            (true, Some(at)) => at.elapsed() > threshold,
            _ => true,
        }
    }

    /// C-ECHO round trip
    pub fn send_echo(&mut self, timeout: Duration) -> OperationOutcome {
        let context = match self.require_context(uids::VERIFICATION) {
            Ok(context) => context,
            Err(outcome) => return outcome,
        };

        let message_id = self.next_message_id();
        let request = DimseMessage::new(context.id, command::echo_rq(message_id));
        if let Err(e) = self.send(request) {
            return self.record(OperationOutcome::from(&e));
        }

        loop {
            match self.receive(timeout) {
                Ok(Incoming::Message(reply)) => {
                    if command::message_id_responded_to(&reply.command) != Some(message_id) {
                        debug!("Ignoring reply to another message");
                        continue;
                    }
                    if command::command_field(&reply.command)
                        != Some(DimseCommand::Echo.response_field())
                    {
                        return self.record(OperationOutcome::failure(
                            "unexpected reply to C-ECHO-RQ",
                        ));
                    }
                    return match command::response_status(&reply.command) {
                        DimseStatus::Success => OperationOutcome::success(),
                        other => self.record(OperationOutcome::failure(format!(
                            "C-ECHO failed with status 0x{:04X}",
                            other.code()
                        ))),
                    };
                }
                Ok(Incoming::ReleaseRequested) | Ok(Incoming::Aborted) => {
                    return self.record(OperationOutcome::new(
                        OperationStatus::NetworkError,
                        "association closed by peer during C-ECHO",
                    ));
                }
                Err(e) => return self.record(OperationOutcome::from(&e)),
            }
        }
    }

    /// Accepted context for `abstract_syntax`, or a failure outcome
    pub fn require_context(
        &mut self,
        abstract_syntax: &str,
    ) -> Result<NegotiatedContext, OperationOutcome> {
        if !self.is_connected() {
            return Err(self.record(OperationOutcome::failure("association is not connected")));
        }
        match self.context_for(abstract_syntax) {
            Some(context) => Ok(context),
            None => {
                let message = format!(
                    "{} did not accept a presentation context for {}",
                    self.peer.ae_title, abstract_syntax
                );
                Err(self.record(OperationOutcome::failure(message)))
            }
        }
    }

    pub fn context_for(&self, abstract_syntax: &str) -> Option<NegotiatedContext> {
        self.connection
            .as_ref()
            .and_then(|c| c.context_for(abstract_syntax).cloned())
    }

    pub fn next_message_id(&mut self) -> u16 {
        let id = self.next_message_id;
        self.next_message_id = self.next_message_id.checked_add(1).unwrap_or(1);
        id
    }

    /// Send one message. A transport failure leaves the handle disconnected.
    pub fn send(&mut self, message: DimseMessage) -> Result<(), DimseError> {
        let connection = self.connection_mut()?;
        let result = connection.send_command(message);
        if let Err(e) = &result {
            self.on_transport_error(e);
        }
        result
    }

    /// Wait for the next message. Timeouts leave the association usable.
    pub fn receive(&mut self, timeout: Duration) -> Result<Incoming, DimseError> {
        let connection = self.connection_mut()?;
        let result = connection.receive_command(timeout);
        match &result {
            Ok(Incoming::Aborted) => {
                self.connection = None;
                self.state = ConnectionState::Disconnected;
                self.connected_at = None;
            }
            Err(e) => self.on_transport_error(e),
            _ => {}
        }
        result
    }

    fn connection_mut(&mut self) -> Result<&mut Box<dyn DimseConnection>, DimseError> {
        if self.state != ConnectionState::Connected {
            return Err(DimseError::operation_failed("association is not connected"));
        }
        self.connection
            .as_mut()
            .ok_or_else(|| DimseError::operation_failed("association is not connected"))
    }

    fn on_transport_error(&mut self, err: &DimseError) {
        self.last_error = err.to_string();
        if err.is_timeout() {
            return;
        }
        warn!(peer = %self.peer.key(), "Association unusable: {}", err);
        self.abort();
    }

    fn record(&mut self, outcome: OperationOutcome) -> OperationOutcome {
        self.last_error = outcome.last_error.clone();
        outcome
    }

    pub fn peer(&self) -> &Peer {
        &self.peer
    }

    pub fn local_identity(&self) -> &LocalIdentity {
        &self.local
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn connected_at(&self) -> Option<Instant> {
        self.connected_at
    }

    pub fn last_error(&self) -> &str {
        &self.last_error
    }
}

impl Drop for AssociationHandle {
    fn drop(&mut self) {
        self.disconnect();
    }
}

impl std::fmt::Debug for AssociationHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AssociationHandle")
            .field("peer", &self.peer.key())
            .field("state", &self.state)
            .field("connected_at", &self.connected_at)
            .field("last_error", &self.last_error)
            .finish()
    }
}
