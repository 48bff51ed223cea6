use std::path::{Path, PathBuf};

use dicom_object::meta::FileMetaTableBuilder;
use dicom_object::InMemDicomObject;
use dimse::uids;
use tracing::debug;

use crate::storage::{StorageBackend, StorageError, StorageResult};

/// Filesystem-based storage backend
///
/// Instances are written as Part 10 files in Explicit VR Little Endian,
/// whatever transfer syntax they arrived in.
#[derive(Debug, Clone)]
pub struct FilesystemStorage {
    root_path: PathBuf,
}

impl FilesystemStorage {
    /// Create a new filesystem storage backend with the given root path
    pub fn new<P: AsRef<Path>>(root_path: P) -> StorageResult<Self> {
        let root_path = root_path.as_ref().to_path_buf();

        if !root_path.exists() {
            std::fs::create_dir_all(&root_path).map_err(|e| {
                StorageError::Config(format!(
                    "Failed to create storage root directory '{}': {}",
                    root_path.display(),
                    e
                ))
            })?;
        }

        // keep the path as given; canonicalizing resolves symlinks such as /var on macOS
        Ok(Self { root_path })
    }
}

impl StorageBackend for FilesystemStorage {
    fn base_path(&self) -> &Path {
        &self.root_path
    }

    fn store_instance(
        &self,
        sop_class_uid: &str,
        sop_instance_uid: &str,
        dataset: InMemDicomObject,
    ) -> StorageResult<PathBuf> {
        let path = self.instance_path(sop_instance_uid)?;
        let meta = FileMetaTableBuilder::new()
            .media_storage_sop_class_uid(uids::trim_uid(sop_class_uid))
            .media_storage_sop_instance_uid(uids::trim_uid(sop_instance_uid))
            .transfer_syntax(uids::EXPLICIT_VR_LITTLE_ENDIAN)
            .build()
            .map_err(|e| StorageError::Encoding(e.to_string()))?;

        dataset
            .with_exact_meta(meta)
            .write_to_file(&path)
            .map_err(|e| StorageError::Encoding(e.to_string()))?;
        debug!("Wrote {}", path.display());
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dicom_core::{dicom_value, DataElement, VR};
    use dicom_dictionary_std::tags;
    use tempfile::TempDir;

    #[test]
    fn test_filesystem_storage_creation() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let root = temp_dir.path().join("incoming/nested");
        let storage = FilesystemStorage::new(&root).expect("Failed to create storage");

        assert_eq!(storage.base_path(), root.as_path());
        assert!(root.is_dir());
    }

    #[test]
    fn test_instance_path_naming() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let storage = FilesystemStorage::new(temp_dir.path()).expect("Failed to create storage");

        let path = storage.instance_path("1.2.840.10008.99\0").unwrap();
        assert_eq!(path, temp_dir.path().join("1.2.840.10008.99.dcm"));

        assert!(storage.instance_path("../../etc/passwd").is_err());
        assert!(storage.instance_path("").is_err());
    }

    #[test]
    fn test_store_instance_writes_part10_file() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let storage = FilesystemStorage::new(temp_dir.path()).expect("Failed to create storage");

        let mut dataset = InMemDicomObject::new_empty();
        dataset.put(DataElement::new(
            tags::SOP_CLASS_UID,
            VR::UI,
            dicom_value!(Str, uids::CT_IMAGE_STORAGE),
        ));
        dataset.put(DataElement::new(
            tags::SOP_INSTANCE_UID,
            VR::UI,
            dicom_value!(Str, "1.2.3.4"),
        ));
        dataset.put(DataElement::new(
            tags::PATIENT_NAME,
            VR::PN,
            dicom_value!(Str, "DOE^JOHN"),
        ));

        let path = storage
            .store_instance(uids::CT_IMAGE_STORAGE, "1.2.3.4", dataset)
            .unwrap();
        assert!(path.ends_with("1.2.3.4.dcm"));

        let file = dicom_object::open_file(&path).unwrap();
        assert_eq!(
            file.meta().transfer_syntax(),
            uids::EXPLICIT_VR_LITTLE_ENDIAN
        );
        assert_eq!(
            file.element(tags::PATIENT_NAME).unwrap().to_str().unwrap(),
            "DOE^JOHN"
        );
    }
}
