use std::path::{Path, PathBuf};

use dicom_object::InMemDicomObject;
use thiserror::Error;

pub mod filesystem;

pub use filesystem::FilesystemStorage;

/// Error type for storage operations
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Path error: {0}")]
    Path(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("DICOM encoding error: {0}")]
    Encoding(String),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Where received instances are persisted
pub trait StorageBackend: Send + Sync + std::fmt::Debug {
    /// Get the base path for this storage backend
    fn base_path(&self) -> &Path;

    /// Path an instance is stored under: `<root>/<SOPInstanceUID>.dcm`
    fn instance_path(&self, sop_instance_uid: &str) -> StorageResult<PathBuf> {
        let uid = dimse::uids::trim_uid(sop_instance_uid);
        if uid.is_empty() || !uid.chars().all(|c| c.is_ascii_digit() || c == '.') {
            return Err(StorageError::Path(format!(
                "'{}' is not a usable SOP Instance UID",
                sop_instance_uid
            )));
        }
        Ok(self.base_path().join(format!("{}.dcm", uid)))
    }

    /// Write one received instance as a DICOM file and return its path
    fn store_instance(
        &self,
        sop_class_uid: &str,
        sop_instance_uid: &str,
        dataset: InMemDicomObject,
    ) -> StorageResult<PathBuf>;
}
