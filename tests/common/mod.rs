//! Scripted DIMSE peer shared by the integration tests
#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dicom_core::{dicom_value, DataElement, VR};
use dicom_dictionary_std::tags;
use dicom_object::meta::FileMetaTableBuilder;
use dicom_object::InMemDicomObject;
use dicomnet::{ConnectionPool, EventBus, EventKind, LocalIdentity, NetworkEvent, Peer, PoolConfig};
use dimse::{
    command, uids, AssociationRequest, DimseAcceptor, DimseConnection, DimseEngine, DimseError,
    DimseMessage, Incoming, ListenerOptions, NegotiatedContext, Result,
};

type Responder = dyn Fn(&DimseMessage) -> Vec<DimseMessage> + Send + Sync;

struct Shared {
    responder: Box<Responder>,
    accepted: Option<Vec<String>>,
    refuse: bool,
    hollow: bool,
    opened: AtomicUsize,
    sent: Mutex<Vec<DimseMessage>>,
}

/// Engine whose peer answers every request through a closure
#[derive(Clone)]
pub struct ScriptedEngine {
    shared: Arc<Shared>,
}

pub struct ScriptedEngineBuilder {
    responder: Box<Responder>,
    accepted: Option<Vec<String>>,
    refuse: bool,
    hollow: bool,
}

impl ScriptedEngine {
    /// `responder` gets each request and returns the replies to queue
    pub fn builder<F>(responder: F) -> ScriptedEngineBuilder
    where
        F: Fn(&DimseMessage) -> Vec<DimseMessage> + Send + Sync + 'static,
    {
        ScriptedEngineBuilder {
            responder: Box::new(responder),
            accepted: None,
            refuse: false,
            hollow: false,
        }
    }

    pub fn new<F>(responder: F) -> Self
    where
        F: Fn(&DimseMessage) -> Vec<DimseMessage> + Send + Sync + 'static,
    {
        Self::builder(responder).build()
    }

    pub fn opened(&self) -> usize {
        self.shared.opened.load(Ordering::SeqCst)
    }

    /// CommandField of every message sent to the peer, in order
    pub fn sent_fields(&self) -> Vec<u16> {
        self.shared
            .sent
            .lock()
            .unwrap()
            .iter()
            .filter_map(|m| command::command_field(&m.command))
            .collect()
    }

    pub fn sent_count(&self, field: u16) -> usize {
        self.sent_fields().iter().filter(|f| **f == field).count()
    }

    /// Affected SOP Instance UIDs of the C-STORE requests received
    pub fn stored_instances(&self) -> Vec<String> {
        self.shared
            .sent
            .lock()
            .unwrap()
            .iter()
            .filter(|m| command::command_field(&m.command) == Some(0x0001))
            .filter_map(|m| command::affected_sop_instance_uid(&m.command))
            .collect()
    }

    pub fn last_sent(&self) -> Option<DimseMessage> {
        self.shared.sent.lock().unwrap().last().cloned()
    }
}

impl ScriptedEngineBuilder {
    /// Accept only these abstract syntaxes
    pub fn accepting(mut self, abstract_syntaxes: &[&str]) -> Self {
        self.accepted = Some(abstract_syntaxes.iter().map(|s| s.to_string()).collect());
        self
    }

    /// Complete the association while accepting none of the proposed contexts
    pub fn accepting_nothing(mut self) -> Self {
        self.accepted = Some(Vec::new());
        self.hollow = true;
        self
    }

    /// Refuse every connection attempt
    pub fn refusing(mut self) -> Self {
        self.refuse = true;
        self
    }

    pub fn build(self) -> ScriptedEngine {
        ScriptedEngine {
            shared: Arc::new(Shared {
                responder: self.responder,
                accepted: self.accepted,
                refuse: self.refuse,
                hollow: self.hollow,
                opened: AtomicUsize::new(0),
                sent: Mutex::new(Vec::new()),
            }),
        }
    }
}

impl DimseEngine for ScriptedEngine {
    fn open_association(&self, request: &AssociationRequest) -> Result<Box<dyn DimseConnection>> {
        if self.shared.refuse {
            return Err(DimseError::ConnectionFailed(format!(
                "connection to {} refused",
                request.address()
            )));
        }
        let contexts: Vec<NegotiatedContext> = request
            .presentation_contexts
            .iter()
            .enumerate()
            .filter(|(_, pc)| match &self.shared.accepted {
                Some(list) => list.contains(&pc.abstract_syntax),
                None => true,
            })
            .map(|(i, pc)| NegotiatedContext {
                id: AssociationRequest::context_id(i),
                abstract_syntax: Some(pc.abstract_syntax.clone()),
                transfer_syntax: uids::IMPLICIT_VR_LITTLE_ENDIAN.to_string(),
            })
            .collect();
        if contexts.is_empty() && !self.shared.hollow {
            return Err(DimseError::AssociationRejected(
                "no presentation context accepted".into(),
            ));
        }
        self.shared.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedConnection {
            shared: self.shared.clone(),
            contexts,
            inbox: VecDeque::new(),
        }))
    }

    fn listen(&self, _options: &ListenerOptions) -> Result<Box<dyn DimseAcceptor>> {
        Err(DimseError::NotSupported("scripted engine does not listen".into()))
    }
}

struct ScriptedConnection {
    shared: Arc<Shared>,
    contexts: Vec<NegotiatedContext>,
    inbox: VecDeque<DimseMessage>,
}

impl DimseConnection for ScriptedConnection {
    fn presentation_contexts(&self) -> &[NegotiatedContext] {
        &self.contexts
    }

    fn peer_ae_title(&self) -> &str {
        "SCRIPTED"
    }

    fn send_command(&mut self, message: DimseMessage) -> Result<()> {
        let replies = (self.shared.responder)(&message);
        self.inbox.extend(replies);
        self.shared.sent.lock().unwrap().push(message);
        Ok(())
    }

    fn receive_command(&mut self, _timeout: Duration) -> Result<Incoming> {
        match self.inbox.pop_front() {
            Some(message) => Ok(Incoming::Message(message)),
            None => Err(DimseError::timeout("scripted peer has nothing to say")),
        }
    }

    fn release(&mut self) -> Result<()> {
        Ok(())
    }

    fn abort(&mut self) {}
}

pub fn peer() -> Peer {
    Peer::new("pacs", "PACS_1", "127.0.0.1", 104).with_timeout(2)
}

pub fn local(storage: &Path) -> LocalIdentity {
    LocalIdentity::new("LOCAL_SCU").with_storage(11113, storage)
}

pub fn pool(engine: &ScriptedEngine) -> Arc<ConnectionPool> {
    Arc::new(ConnectionPool::new(
        Arc::new(engine.clone()),
        PoolConfig::default(),
    ))
}

/// Event bus plus everything it has emitted
pub fn recording_bus() -> (Arc<EventBus>, Arc<Mutex<Vec<NetworkEvent>>>) {
    let bus = Arc::new(EventBus::new());
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    bus.subscribe(Arc::new(move |event: &NetworkEvent| {
        sink.lock().unwrap().push(event.clone());
    }));
    (bus, seen)
}

pub fn kinds(events: &Mutex<Vec<NetworkEvent>>) -> Vec<EventKind> {
    events.lock().unwrap().iter().map(|e| e.kind).collect()
}

fn text(tag: dicom_core::Tag, vr: VR, value: &str) -> DataElement<InMemDicomObject> {
    DataElement::new(tag, vr, dicom_value!(Str, value))
}

pub fn study_match(study_uid: &str, patient: &str) -> InMemDicomObject {
    InMemDicomObject::from_element_iter([
        text(tags::STUDY_INSTANCE_UID, VR::UI, study_uid),
        text(tags::PATIENT_NAME, VR::PN, patient),
        text(tags::PATIENT_ID, VR::LO, "PID-1"),
        text(tags::STUDY_DATE, VR::DA, "20240102"),
        text(tags::MODALITIES_IN_STUDY, VR::CS, "CT"),
    ])
}

pub fn series_match(study_uid: &str, series_uid: &str, number: &str) -> InMemDicomObject {
    InMemDicomObject::from_element_iter([
        text(tags::STUDY_INSTANCE_UID, VR::UI, study_uid),
        text(tags::SERIES_INSTANCE_UID, VR::UI, series_uid),
        text(tags::SERIES_NUMBER, VR::IS, number),
        text(tags::MODALITY, VR::CS, "CT"),
    ])
}

/// Write a minimal Part 10 instance and return its path
pub fn write_instance(dir: &Path, name: &str, sop_class: &str, sop_instance: &str) -> PathBuf {
    let dataset = InMemDicomObject::from_element_iter([
        text(tags::SOP_CLASS_UID, VR::UI, sop_class),
        text(tags::SOP_INSTANCE_UID, VR::UI, sop_instance),
        text(tags::PATIENT_NAME, VR::PN, "DOE^JANE"),
        text(tags::PATIENT_ID, VR::LO, "PID-1"),
    ]);
    write_part10(dir, name, sop_class, sop_instance, dataset)
}

/// A readable file whose data set lacks the SOP Class UID; only the file meta has it
pub fn write_instance_without_class(dir: &Path, name: &str, sop_instance: &str) -> PathBuf {
    let dataset = InMemDicomObject::from_element_iter([
        text(tags::SOP_INSTANCE_UID, VR::UI, sop_instance),
        text(tags::PATIENT_NAME, VR::PN, "DOE^JANE"),
    ]);
    write_part10(dir, name, uids::CT_IMAGE_STORAGE, sop_instance, dataset)
}

fn write_part10(
    dir: &Path,
    name: &str,
    sop_class: &str,
    sop_instance: &str,
    dataset: InMemDicomObject,
) -> PathBuf {
    let meta = FileMetaTableBuilder::new()
        .media_storage_sop_class_uid(sop_class)
        .media_storage_sop_instance_uid(sop_instance)
        .transfer_syntax(uids::EXPLICIT_VR_LITTLE_ENDIAN)
        .build()
        .expect("file meta");
    let path = dir.join(name);
    dataset
        .with_exact_meta(meta)
        .write_to_file(&path)
        .expect("write instance");
    path
}
