//! Service Class User side: outbound associations over dicom-ul

use std::collections::VecDeque;
use std::net::TcpStream;
use std::time::Duration;

use dicom_ul::association::client::ClientAssociation;
use dicom_ul::association::ClientAssociationOptions;
use dicom_ul::pdu::{Pdu, PresentationContextResultReason};
use tracing::{debug, info, warn};

use crate::config::{AssociationRequest, ListenerOptions};
use crate::engine::{DimseAcceptor, DimseConnection, DimseEngine};
use crate::error::{find_io_error, is_timeout_kind};
use crate::pdata::{encode_message, MessageAssembler};
use crate::scp::UlAcceptor;
use crate::types::{DimseMessage, Incoming, NegotiatedContext};
use crate::uids::trim_uid;
use crate::{DimseError, Result};

/// Engine backed by the dicom-ul upper layer implementation
#[derive(Debug, Clone, Default)]
pub struct UlEngine;

impl UlEngine {
    pub fn new() -> Self {
        Self
    }
}

impl DimseEngine for UlEngine {
    fn open_association(&self, request: &AssociationRequest) -> Result<Box<dyn DimseConnection>> {
        request.validate()?;
        info!(
            "Requesting association {} -> {}@{}",
            request.calling_ae_title,
            request.called_ae_title,
            request.address()
        );

        let mut options = ClientAssociationOptions::new()
            .calling_ae_title(request.calling_ae_title.clone())
            .called_ae_title(request.called_ae_title.clone())
            .max_pdu_length(request.max_pdu_length)
            .connection_timeout(request.timeout)
            .read_timeout(request.timeout)
            .write_timeout(request.timeout);

        for pc in &request.presentation_contexts {
            options = options.with_presentation_context(
                pc.abstract_syntax.clone(),
                pc.transfer_syntaxes.clone(),
            );
        }

        let association = options
            .establish(request.address())
            .map_err(map_establish_error)?;

        let contexts: Vec<NegotiatedContext> = association
            .presentation_contexts()
            .iter()
            .filter(|pc| matches!(pc.reason, PresentationContextResultReason::Acceptance))
            .map(|pc| NegotiatedContext {
                id: pc.id,
                abstract_syntax: Some(trim_uid(&pc.abstract_syntax).to_string()),
                transfer_syntax: pc.transfer_syntax.to_string(),
            })
            .collect();

        if contexts.is_empty() {
            let _ = association.abort();
            return Err(DimseError::AssociationRejected(format!(
                "{} accepted no presentation contexts",
                request.called_ae_title
            )));
        }

        debug!("Accepted presentation contexts: {:?}", contexts);

        Ok(Box::new(UlClientConnection {
            association: Some(association),
            contexts,
            peer_ae_title: request.called_ae_title.clone(),
            max_pdu_length: request.max_pdu_length,
            assembler: MessageAssembler::new(),
            ready: VecDeque::new(),
        }))
    }

    fn listen(&self, options: &ListenerOptions) -> Result<Box<dyn DimseAcceptor>> {
        Ok(Box::new(UlAcceptor::bind(options.clone())?))
    }
}

/// Sort a failed association request into the error taxonomy.
///
/// dicom-ul reports rejection and transport failures through one error type,
/// so the I/O cause is looked up first and the message second.
fn map_establish_error(err: dicom_ul::association::Error) -> DimseError {
    if let Some(io) = find_io_error(&err) {
        if is_timeout_kind(io.kind()) {
            return DimseError::timeout(format!("association request timed out: {}", io));
        }
        return DimseError::ConnectionFailed(io.to_string());
    }

    let message = err.to_string();
    let lower = message.to_lowercase();
    if lower.contains("reject") || lower.contains("no presentation context") {
        DimseError::AssociationRejected(message)
    } else if lower.contains("connect") {
        DimseError::ConnectionFailed(message)
    } else {
        DimseError::DicomUl(message)
    }
}

/// An association this process requested
pub struct UlClientConnection {
    association: Option<ClientAssociation<TcpStream>>,
    contexts: Vec<NegotiatedContext>,
    peer_ae_title: String,
    max_pdu_length: u32,
    assembler: MessageAssembler,
    ready: VecDeque<DimseMessage>,
}

impl UlClientConnection {
    fn association(&mut self) -> Result<&mut ClientAssociation<TcpStream>> {
        self.association
            .as_mut()
            .ok_or_else(|| DimseError::operation_failed("association already closed"))
    }

    fn transfer_syntax_of(&self, pc_id: u8) -> Option<String> {
        self.contexts
            .iter()
            .find(|pc| pc.id == pc_id)
            .map(|pc| pc.transfer_syntax.clone())
    }
}

impl DimseConnection for UlClientConnection {
    fn presentation_contexts(&self) -> &[NegotiatedContext] {
        &self.contexts
    }

    fn peer_ae_title(&self) -> &str {
        &self.peer_ae_title
    }

    fn send_command(&mut self, message: DimseMessage) -> Result<()> {
        let ts = self
            .transfer_syntax_of(message.presentation_context_id)
            .ok_or_else(|| {
                DimseError::operation_failed(format!(
                    "presentation context {} was not accepted",
                    message.presentation_context_id
                ))
            })?;
        let pdus = encode_message(&message, &ts, self.max_pdu_length)?;
        let association = self.association()?;
        for pdu in &pdus {
            association
                .send(pdu)
                .map_err(|e| DimseError::DicomUl(format!("failed to send P-DATA: {}", e)))?;
        }
        Ok(())
    }

    fn receive_command(&mut self, timeout: Duration) -> Result<Incoming> {
        if let Some(message) = self.ready.pop_front() {
            return Ok(Incoming::Message(message));
        }

        loop {
            let association = self.association()?;
            association.inner_stream().set_read_timeout(Some(timeout))?;

            let pdu = match association.receive() {
                Ok(pdu) => pdu,
                Err(e) => {
                    if let Some(io) = find_io_error(&e) {
                        if is_timeout_kind(io.kind()) {
                            return Err(DimseError::timeout(format!(
                                "no response within {:?}",
                                timeout
                            )));
                        }
                    }
                    self.assembler.reset();
                    return Err(DimseError::DicomUl(format!("failed to receive: {}", e)));
                }
            };

            match pdu {
                Pdu::PData { data } => {
                    for pdv in data {
                        let contexts = &self.contexts;
                        let lookup = |id: u8| {
                            contexts
                                .iter()
                                .find(|pc| pc.id == id)
                                .map(|pc| pc.transfer_syntax.clone())
                        };
                        if let Some(message) = self.assembler.push(pdv, lookup)? {
                            self.ready.push_back(message);
                        }
                    }
                    if let Some(message) = self.ready.pop_front() {
                        return Ok(Incoming::Message(message));
                    }
                }
                Pdu::ReleaseRQ => return Ok(Incoming::ReleaseRequested),
                Pdu::AbortRQ { source } => {
                    warn!("{} aborted the association: {:?}", self.peer_ae_title, source);
                    self.association = None;
                    return Ok(Incoming::Aborted);
                }
                other => debug!("Ignoring unexpected PDU: {:?}", other),
            }
        }
    }

    fn release(&mut self) -> Result<()> {
        if let Some(association) = self.association.take() {
            association
                .release()
                .map_err(|e| DimseError::DicomUl(format!("release failed: {}", e)))?;
            debug!("Released association with {}", self.peer_ae_title);
        }
        Ok(())
    }

    fn abort(&mut self) {
        if let Some(association) = self.association.take() {
            if let Err(e) = association.abort() {
                debug!("Abort of association with {} failed: {}", self.peer_ae_title, e);
            }
        }
    }
}

impl Drop for UlClientConnection {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            debug!("Implicit release on drop failed: {}", e);
        }
    }
}
