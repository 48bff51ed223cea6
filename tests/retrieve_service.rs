mod common;

use std::sync::{Arc, Mutex};

use common::{kinds, local, peer, pool, recording_bus, ScriptedEngine};
use dicom_dictionary_std::tags;
use dicomnet::{EventKind, LocalIdentity, OperationStatus, RetrieveService};
use dimse::command::SubOperations;
use dimse::types::status;
use dimse::{command, uids, DimseCommand, DimseMessage};

fn move_reply(request: &DimseMessage, code: u16, progress: SubOperations) -> DimseMessage {
    let id = command::message_id(&request.command).unwrap_or_default();
    DimseMessage::new(
        request.presentation_context_id,
        command::move_rsp(id, uids::STUDY_ROOT_QR_MOVE, code, progress),
    )
}

fn counters(remaining: u16, completed: u16) -> SubOperations {
    SubOperations {
        remaining,
        completed,
        ..SubOperations::default()
    }
}

/// Two pending updates, then the final status
fn move_responder(final_code: u16) -> impl Fn(&DimseMessage) -> Vec<DimseMessage> + Send + Sync {
    move |request| {
        if command::command_field(&request.command) != Some(DimseCommand::Move.request_field()) {
            return Vec::new();
        }
        vec![
            move_reply(request, status::PENDING, counters(3, 1)),
            move_reply(request, status::PENDING, counters(1, 3)),
            move_reply(request, final_code, counters(0, 4)),
        ]
    }
}

#[test]
fn test_retrieve_refused_when_storage_disabled() {
    let dir = tempfile::tempdir().unwrap();
    let engine = ScriptedEngine::new(move_responder(status::SUCCESS));
    let (events, _) = recording_bus();
    let service = RetrieveService::new(pool(&engine), events);
    let local = local(dir.path()).with_storage_enabled(false);

    let outcome = service.retrieve_study(&peer(), &local, "1.2.3", None);

    assert_eq!(outcome.status, OperationStatus::InvalidParameters);
    assert_eq!(engine.opened(), 0);
}

#[test]
fn test_retrieve_reports_progress_to_completion() {
    let dir = tempfile::tempdir().unwrap();
    let engine = ScriptedEngine::new(move_responder(status::SUCCESS));
    let (events, seen) = recording_bus();
    let service = RetrieveService::new(pool(&engine), events);

    let mut fractions = Vec::new();
    let mut progress = |f: f32| fractions.push(f);
    let outcome = service.retrieve_study(&peer(), &local(dir.path()), "1.2.3", Some(&mut progress));

    assert!(outcome.is_success(), "{:?}", outcome);
    assert_eq!(fractions, vec![0.25, 0.75, 1.0]);
    assert!(kinds(&seen).contains(&EventKind::RetrieveProgress));
    assert_eq!(kinds(&seen).last(), Some(&EventKind::RetrieveCompleted));
}

#[test]
fn test_move_destination_defaults_to_local_ae() {
    let dir = tempfile::tempdir().unwrap();
    let destinations = Arc::new(Mutex::new(Vec::new()));
    let capture = destinations.clone();
    let responder = move_responder(status::SUCCESS);
    let engine = ScriptedEngine::new(move |request: &DimseMessage| {
        if let Ok(e) = request.command.element(tags::MOVE_DESTINATION) {
            capture
                .lock()
                .unwrap()
                .push(e.to_str().unwrap().trim().to_string());
        }
        responder(request)
    });
    let (events, _) = recording_bus();
    let service = RetrieveService::new(pool(&engine), events);

    let local = local(dir.path());
    assert!(service.retrieve_study(&peer(), &local, "1.2.3", None).is_success());
    let routed = peer().with_move_destination("ARCHIVE");
    assert!(service
        .retrieve_series(&routed, &local, "1.2.3", "1.2.3.4", None)
        .is_success());

    assert_eq!(*destinations.lock().unwrap(), vec!["LOCAL_SCU", "ARCHIVE"]);
}

#[test]
fn test_failed_move_reports_status_code() {
    let dir = tempfile::tempdir().unwrap();
    let engine = ScriptedEngine::new(move_responder(0xA801));
    let (events, _) = recording_bus();
    let service = RetrieveService::new(pool(&engine), events);

    let outcome = service.retrieve_study(&peer(), &local(dir.path()), "1.2.3", None);

    assert_eq!(outcome.status, OperationStatus::Failure);
    assert!(outcome.last_error.contains("0xA801"), "{}", outcome.last_error);
    assert!(outcome.last_error.contains("Move destination unknown"));
}

#[test]
fn test_warning_is_not_success() {
    let dir = tempfile::tempdir().unwrap();
    let engine = ScriptedEngine::new(move_responder(0xB000));
    let (events, _) = recording_bus();
    let service = RetrieveService::new(pool(&engine), events);

    let outcome = service.retrieve_study(&peer(), &local(dir.path()), "1.2.3", None);
    assert_eq!(outcome.status, OperationStatus::Failure);
}

#[test]
fn test_cancel_sends_one_cancel_request() {
    let dir = tempfile::tempdir().unwrap();
    let engine = ScriptedEngine::new(move_responder(status::CANCEL));
    let (events, _) = recording_bus();
    let service = Arc::new(RetrieveService::new(pool(&engine), events));

    let canceller = service.clone();
    let mut progress = |_: f32| canceller.cancel_retrieve();
    let outcome = service.retrieve_study(&peer(), &local(dir.path()), "1.2.3", Some(&mut progress));

    assert_eq!(outcome.status, OperationStatus::Cancelled);
    assert_eq!(engine.sent_count(DimseCommand::Cancel.request_field()), 1);
}

#[test]
fn test_invalid_destination_is_rejected_before_connecting() {
    let dir = tempfile::tempdir().unwrap();
    let engine = ScriptedEngine::new(move_responder(status::SUCCESS));
    let (events, _) = recording_bus();
    let service = RetrieveService::new(pool(&engine), events);
    let peer = peer().with_move_destination("NOT A VALID AE");

    let outcome = service.retrieve_study(&peer, &local(dir.path()), "1.2.3", None);

    assert_eq!(outcome.status, OperationStatus::InvalidParameters);
    assert_eq!(engine.opened(), 0);
}

#[test]
fn test_get_is_not_implemented() {
    let engine = ScriptedEngine::new(move_responder(status::SUCCESS));
    let (events, _) = recording_bus();
    let service = RetrieveService::new(pool(&engine), events);

    let outcome = service.retrieve_study_get(&peer(), &LocalIdentity::default(), "1.2.3");

    assert_eq!(outcome.status, OperationStatus::NotImplemented);
    assert!(!outcome.last_error.is_empty());
    assert_eq!(engine.opened(), 0);
}
