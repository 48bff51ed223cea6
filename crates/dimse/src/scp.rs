//! Service Class Provider side: inbound associations over dicom-ul

use std::collections::VecDeque;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dicom_ul::association::server::ServerAssociation;
use dicom_ul::association::{Association, ServerAssociationOptions};
use dicom_ul::pdu::{Pdu, PresentationContextResultReason};
use tracing::{debug, info, warn};

use crate::config::ListenerOptions;
use crate::engine::{DimseAcceptor, DimseConnection};
use crate::error::{find_io_error, is_timeout_kind};
use crate::pdata::{encode_message, MessageAssembler};
use crate::types::{DimseMessage, Incoming, NegotiatedContext};
use crate::uids::trim_uid;
use crate::{DimseError, Result};

/// How often the non-blocking listener is polled while waiting
const ACCEPT_POLL_STEP: Duration = Duration::from_millis(20);

/// Bound on every socket read and write while negotiating
const NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Sockets allowed to negotiate at the same time
const MAX_PENDING_NEGOTIATIONS: usize = 16;

type Negotiated = Result<UlServerConnection>;

/// Listener accepting associations on a TCP port.
///
/// Each accepted socket negotiates on its own thread, so a peer that
/// connects and stays silent never holds up [`DimseAcceptor::accept`].
pub struct UlAcceptor {
    listener: TcpListener,
    options: Arc<ListenerOptions>,
    negotiated_tx: Sender<Negotiated>,
    negotiated_rx: Receiver<Negotiated>,
    pending: Arc<AtomicUsize>,
}

impl UlAcceptor {
    /// Bind the listening socket described by `options`
    pub fn bind(options: ListenerOptions) -> Result<Self> {
        options.validate()?;

        let addr = SocketAddr::new(options.bind_addr, options.port);
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;

        info!(
            "DIMSE listener bound on {} (AET: {})",
            listener.local_addr()?,
            options.ae_title
        );

        let (negotiated_tx, negotiated_rx) = mpsc::channel();
        Ok(Self {
            listener,
            options: Arc::new(options),
            negotiated_tx,
            negotiated_rx,
            pending: Arc::new(AtomicUsize::new(0)),
        })
    }

    fn spawn_negotiation(&self, stream: TcpStream, peer_addr: SocketAddr) {
        if self.pending.load(Ordering::SeqCst) >= MAX_PENDING_NEGOTIATIONS {
            warn!(
                "Dropping connection from {}: {} negotiations already pending",
                peer_addr, MAX_PENDING_NEGOTIATIONS
            );
            return;
        }

        let options = self.options.clone();
        let done = self.negotiated_tx.clone();
        let pending = self.pending.clone();
        pending.fetch_add(1, Ordering::SeqCst);
        let spawned = std::thread::Builder::new()
            .name("dimse-negotiation".into())
            .spawn(move || {
                let result = negotiate(&options, stream, peer_addr);
                pending.fetch_sub(1, Ordering::SeqCst);
                // the acceptor may be gone already; the socket closes on drop
                let _ = done.send(result);
            });
        if let Err(e) = spawned {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            warn!("Cannot negotiate with {}: {}", peer_addr, e);
        }
    }
}

fn negotiate(
    options: &ListenerOptions,
    stream: TcpStream,
    peer_addr: SocketAddr,
) -> Result<UlServerConnection> {
    stream.set_nonblocking(false)?;

    let mut server = ServerAssociationOptions::new()
        .ae_title(options.ae_title.clone())
        .max_pdu_length(options.max_pdu_length)
        .promiscuous(options.accept_any_storage)
        .read_timeout(NEGOTIATION_TIMEOUT)
        .write_timeout(NEGOTIATION_TIMEOUT);

    for uid in &options.abstract_syntaxes {
        server = server.with_abstract_syntax(uid.clone());
    }
    for ts in &options.transfer_syntaxes {
        server = server.with_transfer_syntax(ts.clone());
    }

    let association = server.establish(stream).map_err(|e| {
        DimseError::AssociationRejected(format!("negotiation with {} failed: {}", peer_addr, e))
    })?;

    // promiscuous negotiation accepts anything; keep what we serve
    let contexts: Vec<NegotiatedContext> = association
        .presentation_contexts()
        .iter()
        .filter(|pc| matches!(pc.reason, PresentationContextResultReason::Acceptance))
        .filter(|pc| options.accepts(&pc.abstract_syntax))
        .map(|pc| NegotiatedContext {
            id: pc.id,
            abstract_syntax: Some(trim_uid(&pc.abstract_syntax).to_string()),
            transfer_syntax: pc.transfer_syntax.to_string(),
        })
        .collect();

    let peer_ae_title = association.peer_ae_title().to_string();
    if contexts.is_empty() {
        let _ = association.abort();
        return Err(DimseError::AssociationRejected(format!(
            "{} ({}) proposed no abstract syntax we serve",
            peer_ae_title, peer_addr
        )));
    }

    info!("New association from {} ({})", peer_ae_title, peer_addr);
    debug!("> Presentation contexts: {:?}", contexts);

    Ok(UlServerConnection {
        association: Some(association),
        contexts,
        peer_ae_title,
        max_pdu_length: options.max_pdu_length,
        assembler: MessageAssembler::new(),
        ready: VecDeque::new(),
        release_requested: false,
    })
}

impl DimseAcceptor for UlAcceptor {
    fn accept(&mut self, timeout: Duration) -> Result<Option<Box<dyn DimseConnection>>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Ok(result) = self.negotiated_rx.try_recv() {
                let connection = result?;
                return Ok(Some(Box::new(connection)));
            }

            match self.listener.accept() {
                Ok((stream, peer_addr)) => {
                    debug!("Accepted connection from {}", peer_addr);
                    self.spawn_negotiation(stream, peer_addr);
                    continue;
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(DimseError::Network(e)),
            }

            if Instant::now() >= deadline {
                return Ok(None);
            }
            std::thread::sleep(ACCEPT_POLL_STEP);
        }
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr().ok()
    }
}

/// An association a remote requestor opened with us
pub struct UlServerConnection {
    association: Option<ServerAssociation<TcpStream>>,
    contexts: Vec<NegotiatedContext>,
    peer_ae_title: String,
    max_pdu_length: u32,
    assembler: MessageAssembler,
    ready: VecDeque<DimseMessage>,
    release_requested: bool,
}

impl UlServerConnection {
    fn association(&mut self) -> Result<&mut ServerAssociation<TcpStream>> {
        self.association
            .as_mut()
            .ok_or_else(|| DimseError::operation_failed("association already closed"))
    }
}

impl DimseConnection for UlServerConnection {
    fn presentation_contexts(&self) -> &[NegotiatedContext] {
        &self.contexts
    }

    fn peer_ae_title(&self) -> &str {
        &self.peer_ae_title
    }

    fn send_command(&mut self, message: DimseMessage) -> Result<()> {
        let ts = self
            .contexts
            .iter()
            .find(|pc| pc.id == message.presentation_context_id)
            .map(|pc| pc.transfer_syntax.clone())
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
                .map_err(|e| DimseError::DicomUl(format!("failed to send response: {}", e)))?;
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
                            return Err(DimseError::timeout("no data"));
                        }
                    }
                    self.assembler.reset();
                    return Err(DimseError::DicomUl(format!("failed to receive: {}", e)));
                }
            };

            match pdu {
                Pdu::PData { data } => {
                    if data.is_empty() {
                        debug!("Ignoring empty PData PDU");
                        continue;
                    }
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
                Pdu::ReleaseRQ => {
                    self.release_requested = true;
                    return Ok(Incoming::ReleaseRequested);
                }
                Pdu::AbortRQ { source } => {
                    warn!("Aborted connection from {}: {:?}", self.peer_ae_title, source);
                    self.association = None;
                    return Ok(Incoming::Aborted);
                }
                other => debug!("Ignoring unexpected PDU: {:?}", other),
            }
        }
    }

    fn release(&mut self) -> Result<()> {
        let Some(mut association) = self.association.take() else {
            return Ok(());
        };

        if self.release_requested {
            association
                .send(&Pdu::ReleaseRP)
                .map_err(|e| DimseError::DicomUl(format!("failed to acknowledge release: {}", e)))?;
            info!("Released association with {}", self.peer_ae_title);
            return Ok(());
        }

        // we are the ones closing: ask, then wait briefly for the answer
        association
            .send(&Pdu::ReleaseRQ)
            .map_err(|e| DimseError::DicomUl(format!("failed to request release: {}", e)))?;
        association
            .inner_stream()
            .set_read_timeout(Some(Duration::from_secs(5)))?;
        for _ in 0..8 {
            match association.receive() {
                Ok(Pdu::ReleaseRP) => break,
                Ok(Pdu::ReleaseRQ) => {
                    // release collision: answer and finish
                    let _ = association.send(&Pdu::ReleaseRP);
                    break;
                }
                Ok(other) => debug!("Discarding {:?} while releasing", other),
                Err(_) => break,
            }
        }
        info!("Released association with {}", self.peer_ae_title);
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AssociationRequest;
    use crate::engine::DimseEngine;
    use crate::scu::UlEngine;
    use crate::types::PresentationContextProposal;
    use crate::uids;
    use std::net::{IpAddr, Ipv4Addr};

    const DOSE_SR: &str = "1.2.840.10008.5.1.4.1.1.88.67";

    fn loopback_acceptor() -> UlAcceptor {
        UlAcceptor::bind(ListenerOptions {
            ae_title: "STORE_SCP".into(),
            bind_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 0,
            ..ListenerOptions::default()
        })
        .unwrap()
    }

    fn request_for(port: u16, abstract_syntax: &str) -> AssociationRequest {
        AssociationRequest::new("TEST_SCU", "STORE_SCP", "127.0.0.1", port)
            .with_timeout(Duration::from_secs(5))
            .with_presentation_contexts(vec![PresentationContextProposal::new(
                abstract_syntax,
                uids::TRANSFER_SYNTAX_PREFERENCE,
            )])
    }

    /// Poll until something other than a timeout comes back
    fn accept_next(acceptor: &mut UlAcceptor) -> Result<Option<Box<dyn DimseConnection>>> {
        for _ in 0..50 {
            match acceptor.accept(Duration::from_millis(100)) {
                Ok(None) => continue,
                other => return other,
            }
        }
        Ok(None)
    }

    #[test]
    fn test_silent_socket_does_not_block_accept() {
        let mut acceptor = loopback_acceptor();
        let addr = acceptor.local_addr().unwrap();
        let _silent = TcpStream::connect(addr).unwrap();

        let started = Instant::now();
        for _ in 0..3 {
            assert!(acceptor.accept(Duration::from_millis(200)).unwrap().is_none());
        }
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_any_storage_class_is_accepted() {
        let mut acceptor = loopback_acceptor();
        let port = acceptor.local_addr().unwrap().port();
        let client = std::thread::spawn(move || {
            let mut connection = UlEngine::new()
                .open_association(&request_for(port, DOSE_SR))
                .unwrap();
            let accepted = connection.presentation_contexts().to_vec();
            connection.abort();
            accepted
        });

        let connection = accept_next(&mut acceptor).unwrap().expect("association");
        assert_eq!(connection.peer_ae_title(), "TEST_SCU");
        assert_eq!(
            connection.presentation_contexts()[0].abstract_syntax.as_deref(),
            Some(DOSE_SR)
        );
        let accepted = client.join().unwrap();
        assert_eq!(accepted[0].abstract_syntax.as_deref(), Some(DOSE_SR));
    }

    #[test]
    fn test_unserved_abstract_syntax_is_rejected() {
        let mut acceptor = loopback_acceptor();
        let port = acceptor.local_addr().unwrap().port();
        let client = std::thread::spawn(move || {
            // the outcome on the requesting side depends on abort timing
            let _ = UlEngine::new().open_association(&request_for(port, uids::STUDY_ROOT_QR_FIND));
        });

        let result = accept_next(&mut acceptor);
        assert!(
            matches!(result, Err(DimseError::AssociationRejected(_))),
            "unexpected result: {:?}",
            result.map(|c| c.is_some())
        );
        client.join().unwrap();
    }
}
