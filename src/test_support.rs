//! In-process engine for unit tests

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dimse::types::status;
use dimse::{
    command, AssociationRequest, DimseAcceptor, DimseCommand, DimseConnection, DimseEngine,
    DimseError, DimseMessage, Incoming, ListenerOptions, NegotiatedContext, Result,
};

#[derive(Default)]
struct Counters {
    opened: AtomicUsize,
    released: AtomicUsize,
    sent: Mutex<Vec<u16>>,
}

/// Accepts every proposed context and answers C-ECHO
pub struct FakeEngine {
    counters: Arc<Counters>,
    refuse: bool,
    echo_status: u16,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self {
            counters: Arc::new(Counters::default()),
            refuse: false,
            echo_status: status::SUCCESS,
        }
    }

    pub fn refusing(mut self) -> Self {
        self.refuse = true;
        self
    }

    pub fn with_echo_status(mut self, code: u16) -> Self {
        self.echo_status = code;
        self
    }

    pub fn opened(&self) -> usize {
        self.counters.opened.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.counters.released.load(Ordering::SeqCst)
    }

    pub fn sent_commands(&self) -> Vec<u16> {
        self.counters.sent.lock().unwrap().clone()
    }
}

impl DimseEngine for FakeEngine {
    fn open_association(&self, request: &AssociationRequest) -> Result<Box<dyn DimseConnection>> {
        if self.refuse {
            return Err(DimseError::ConnectionFailed("connection refused".into()));
        }
        self.counters.opened.fetch_add(1, Ordering::SeqCst);
        let contexts = request
            .presentation_contexts
            .iter()
            .enumerate()
            .map(|(i, pc)| NegotiatedContext {
                id: AssociationRequest::context_id(i),
                abstract_syntax: Some(pc.abstract_syntax.clone()),
                transfer_syntax: pc.transfer_syntaxes[0].clone(),
            })
            .collect();
        Ok(Box::new(FakeConnection {
            counters: self.counters.clone(),
            contexts,
            echo_status: self.echo_status,
            inbox: VecDeque::new(),
            open: true,
        }))
    }

    fn listen(&self, _options: &ListenerOptions) -> Result<Box<dyn DimseAcceptor>> {
        Err(DimseError::NotSupported("listening".into()))
    }
}

struct FakeConnection {
    counters: Arc<Counters>,
    contexts: Vec<NegotiatedContext>,
    echo_status: u16,
    inbox: VecDeque<DimseMessage>,
    open: bool,
}

impl DimseConnection for FakeConnection {
    fn presentation_contexts(&self) -> &[NegotiatedContext] {
        &self.contexts
    }

    fn peer_ae_title(&self) -> &str {
        "FAKE"
    }

    fn send_command(&mut self, message: DimseMessage) -> Result<()> {
        let field = command::command_field(&message.command).unwrap_or_default();
        self.counters.sent.lock().unwrap().push(field);
        if field == DimseCommand::Echo.request_field() {
            let id = command::message_id(&message.command).unwrap_or_default();
            self.inbox.push_back(DimseMessage::new(
                message.presentation_context_id,
                command::echo_rsp(id, self.echo_status),
            ));
        }
        Ok(())
    }

    fn receive_command(&mut self, _timeout: Duration) -> Result<Incoming> {
        self.inbox
            .pop_front()
            .map(Incoming::Message)
            .ok_or_else(|| DimseError::timeout("nothing queued"))
    }

    fn release(&mut self) -> Result<()> {
        if self.open {
            self.open = false;
            self.counters.released.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn abort(&mut self) {
        self.open = false;
    }
}
