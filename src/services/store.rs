//! C-STORE SCU: one association per batch, per-file accounting

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dicom_dictionary_std::tags;
use dicom_object::{open_file, InMemDicomObject};
use dimse::{command, uids, DimseMessage, Incoming, Priority};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::association::AssociationHandle;
use crate::events::{EventBus, EventKind};
use crate::models::{LocalIdentity, OperationOutcome, OperationStatus, Peer};
use crate::pool::ConnectionPool;
use crate::services::{checkout, status};
use crate::tasks::{CancelSlot, Cancellable};

/// Extensions picked up by [`StoreService::store_directory`]
const DICOM_EXTENSIONS: &[&str] = &["dcm", "dicom", "ima"];

/// Result of a store batch
#[derive(Debug, Clone, Serialize)]
pub struct StoreReport {
    pub outcome: OperationOutcome,
    pub stored_count: usize,
    pub failed_count: usize,
    /// Per-file failure reasons
    pub failures: Vec<(PathBuf, String)>,
}

impl StoreReport {
    fn rejected(outcome: OperationOutcome) -> Self {
        Self {
            outcome,
            stored_count: 0,
            failed_count: 0,
            failures: Vec::new(),
        }
    }
}

#[derive(Debug)]
pub struct StoreService {
    pool: Arc<ConnectionPool>,
    events: Arc<EventBus>,
    cancel: CancelSlot,
}

impl StoreService {
    pub fn new(pool: Arc<ConnectionPool>, events: Arc<EventBus>) -> Self {
        Self {
            pool,
            events,
            cancel: CancelSlot::new(),
        }
    }

    /// Stop the batch before its next file
    pub fn cancel_store(&self) {
        self.cancel.cancel();
    }

    pub fn store_file(&self, peer: &Peer, local: &LocalIdentity, path: &Path) -> StoreReport {
        self.store_files(peer, local, &[path.to_path_buf()], None)
    }

    /// Send every DICOM file directly inside `dir` (not recursive)
    pub fn store_directory(
        &self,
        peer: &Peer,
        local: &LocalIdentity,
        dir: &Path,
        progress: Option<&mut dyn FnMut(f32)>,
    ) -> StoreReport {
        let paths = match dicom_files_in(dir) {
            Ok(paths) => paths,
            Err(e) => {
                return StoreReport::rejected(OperationOutcome::invalid_parameters(format!(
                    "cannot list {}: {}",
                    dir.display(),
                    e
                )))
            }
        };
        if paths.is_empty() {
            return StoreReport::rejected(OperationOutcome::invalid_parameters(format!(
                "no DICOM files in {}",
                dir.display()
            )));
        }
        self.store_files(peer, local, &paths, progress)
    }

    /// Store a mix of files and directories in one batch.
    ///
    /// Each directory is replaced in place by its DICOM files, so argument
    /// order is kept.
    pub fn store_paths(
        &self,
        peer: &Peer,
        local: &LocalIdentity,
        paths: &[PathBuf],
        progress: Option<&mut dyn FnMut(f32)>,
    ) -> StoreReport {
        let mut files = Vec::with_capacity(paths.len());
        for path in paths {
            if !path.is_dir() {
                files.push(path.clone());
                continue;
            }
            match dicom_files_in(path) {
                Ok(found) => {
                    debug!(dir = %path.display(), files = found.len(), "Expanded directory");
                    files.extend(found);
                }
                Err(e) => {
                    return StoreReport::rejected(OperationOutcome::invalid_parameters(format!(
                        "cannot list {}: {}",
                        path.display(),
                        e
                    )))
                }
            }
        }
        self.store_files(peer, local, &files, progress)
    }

    /// Send `paths` over a single association.
    ///
    /// A file that cannot be read or sent is counted and the batch goes on.
    /// Cancellation takes effect between files.
    pub fn store_files(
        &self,
        peer: &Peer,
        local: &LocalIdentity,
        paths: &[PathBuf],
        mut progress: Option<&mut dyn FnMut(f32)>,
    ) -> StoreReport {
        if paths.is_empty() {
            return StoreReport::rejected(OperationOutcome::invalid_parameters(
                "no files to store",
            ));
        }

        let token = self.cancel.begin();
        info!(peer = %peer.key(), files = paths.len(), "C-STORE batch");
        self.events.emit_kind(
            EventKind::StoreStarted,
            format!("Storing {} files to {}", paths.len(), peer.key()),
        );

        let mut handle = match checkout(&self.pool, &self.events, peer, local) {
            Ok(handle) => handle,
            Err(outcome) => return StoreReport::rejected(outcome),
        };

        let mut report = StoreReport::rejected(OperationOutcome::success());
        let mut cancelled = false;
        for (index, path) in paths.iter().enumerate() {
            if token.is_cancelled() {
                info!("C-STORE batch cancelled after {} files", index);
                cancelled = true;
                break;
            }

            match store_one(&mut handle, path) {
                Ok(()) => {
                    debug!(file = %path.display(), "Stored");
                    report.stored_count += 1;
                }
                Err(reason) => {
                    warn!(file = %path.display(), "C-STORE failed: {}", reason);
                    report.failed_count += 1;
                    report.failures.push((path.clone(), reason));
                }
            }

            let fraction = (index + 1) as f32 / paths.len() as f32;
            if let Some(callback) = progress.as_deref_mut() {
                callback(fraction);
            }
            self.events.progress(
                EventKind::StoreProgress,
                format!("{} of {} files sent", index + 1, paths.len()),
                fraction,
            );
        }
        self.pool.release(handle);

        report.outcome = if cancelled {
            OperationOutcome::cancelled()
        } else if report.failed_count > 0 {
            OperationOutcome::failure(format!(
                "{} of {} files failed; first: {}",
                report.failed_count,
                paths.len(),
                report
                    .failures
                    .first()
                    .map(|(_, reason)| reason.as_str())
                    .unwrap_or_default()
            ))
        } else {
            OperationOutcome::success()
        };

        match report.outcome.status {
            OperationStatus::Success | OperationStatus::Cancelled => self.events.emit_kind(
                EventKind::StoreCompleted,
                format!(
                    "C-STORE to {}: {} stored, {} failed",
                    peer.key(),
                    report.stored_count,
                    report.failed_count
                ),
            ),
            _ => self.events.error(format!(
                "C-STORE to {}: {}",
                peer.key(),
                report.outcome.last_error
            )),
        }
        report
    }
}

impl Cancellable for StoreService {
    fn cancel_slot(&self) -> &CancelSlot {
        &self.cancel
    }
}

fn uid_of(dataset: &InMemDicomObject, tag: dicom_core::Tag) -> Option<String> {
    dataset
        .element(tag)
        .ok()
        .and_then(|e| e.to_str().ok())
        .map(|s| uids::trim_uid(&s).to_string())
        .filter(|s| !s.is_empty())
}

/// Send one file and wait for its response
fn store_one(handle: &mut AssociationHandle, path: &Path) -> Result<(), String> {
    let file = open_file(path).map_err(|e| format!("cannot read {}: {}", path.display(), e))?;
    let dataset = file.into_inner();

    let sop_class = uid_of(&dataset, tags::SOP_CLASS_UID)
        .ok_or_else(|| format!("{} has no SOP Class UID", path.display()))?;
    let sop_instance = uid_of(&dataset, tags::SOP_INSTANCE_UID)
        .ok_or_else(|| format!("{} has no SOP Instance UID", path.display()))?;
    let context = handle.context_for(&sop_class).ok_or_else(|| {
        format!(
            "{} did not accept a presentation context for {}",
            handle.peer().ae_title,
            sop_class
        )
    })?;

    let message_id = handle.next_message_id();
    let request = DimseMessage::new(
        context.id,
        command::store_rq(message_id, &sop_class, &sop_instance, Priority::Medium),
    )
    .with_dataset(dataset);
    handle.send(request).map_err(|e| e.to_string())?;

    let timeout = handle.peer().timeout();
    loop {
        match handle.receive(timeout).map_err(|e| e.to_string())? {
            Incoming::Message(reply) => {
                if command::message_id_responded_to(&reply.command) != Some(message_id) {
                    continue;
                }
                let status = command::response_status(&reply.command);
                if status.is_successful() {
                    return Ok(());
                }
                if status::is_retriable_status(&status) {
                    debug!("Peer is out of resources; {} may succeed later", sop_instance);
                }
                return Err(format!(
                    "C-STORE of {} failed with status 0x{:04X} ({})",
                    sop_instance,
                    status.code(),
                    status::describe(status.code())
                ));
            }
            Incoming::ReleaseRequested | Incoming::Aborted => {
                return Err("association closed by peer during C-STORE".to_string())
            }
        }
    }
}

/// Files in `dir` with a DICOM extension that also parse as DICOM
fn dicom_files_in(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut paths = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        let has_extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| DICOM_EXTENSIONS.iter().any(|x| e.eq_ignore_ascii_case(x)))
            .unwrap_or(false);
        if !has_extension {
            continue;
        }
        match open_file(&path) {
            Ok(_) => paths.push(path),
            Err(e) => debug!(file = %path.display(), "Skipping unreadable file: {}", e),
        }
    }
    paths.sort();
    Ok(paths)
}
