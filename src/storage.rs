//! On-disk image store for uploads and rasterised pages.
//!
//! Layout under the storage root:
//! - `originals/{session_id}.pdf` — uploaded source documents
//! - `thumbnails/{session_id}_thumb_{idx}.jpg` — low-res review images
//! - `high_res/{session_id}_highres_{idx}.jpg` — annotation-quality pages
//!
//! Thumbnails are returned inline as base64 in API payloads; high-res
//! pages are served by URL from `/storage/high_res/`.

use std::path::PathBuf;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;

use crate::errors::WorkflowError;

#[derive(Clone)]
pub struct ImageStore {
    root: PathBuf,
}

impl ImageStore {
    /// Open the store at `root`, creating the directory tree if needed.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, WorkflowError> {
        let root = root.into();
        let store = Self { root };
        for dir in [
            store.root.clone(),
            store.originals_dir(),
            store.thumbnails_dir(),
            store.high_res_dir(),
        ] {
            std::fs::create_dir_all(&dir)
                .map_err(|source| WorkflowError::StorageWrite { path: dir, source })?;
        }
        Ok(store)
    }

    pub fn originals_dir(&self) -> PathBuf {
        self.root.join("originals")
    }

    pub fn thumbnails_dir(&self) -> PathBuf {
        self.root.join("thumbnails")
    }

    pub fn high_res_dir(&self) -> PathBuf {
        self.root.join("high_res")
    }

    pub fn original_path(&self, session_id: &str) -> PathBuf {
        self.originals_dir().join(format!("{}.pdf", session_id))
    }

    pub fn thumbnail_name(session_id: &str, idx: usize) -> String {
        format!("{}_thumb_{}.jpg", session_id, idx)
    }

    pub fn high_res_name(session_id: &str, idx: usize) -> String {
        format!("{}_highres_{}.jpg", session_id, idx)
    }

    pub fn save_original(&self, session_id: &str, bytes: &[u8]) -> Result<PathBuf, WorkflowError> {
        let path = self.original_path(session_id);
        std::fs::write(&path, bytes)
            .map_err(|source| WorkflowError::StorageWrite { path: path.clone(), source })?;
        Ok(path)
    }

    pub fn read_original(&self, session_id: &str) -> Result<Vec<u8>, WorkflowError> {
        let path = self.original_path(session_id);
        std::fs::read(&path).map_err(|source| WorkflowError::StorageRead { path, source })
    }

    /// Remove the uploaded source PDF after a completed review pass.
    pub fn discard_original(&self, session_id: &str) -> Result<(), WorkflowError> {
        let path = self.original_path(session_id);
        std::fs::remove_file(&path).map_err(|source| WorkflowError::StorageRead { path, source })
    }

    pub fn save_thumbnail(&self, name: &str, bytes: &[u8]) -> Result<(), WorkflowError> {
        let path = self.thumbnails_dir().join(name);
        std::fs::write(&path, bytes).map_err(|source| WorkflowError::StorageWrite { path, source })
    }

    pub fn save_high_res(&self, name: &str, bytes: &[u8]) -> Result<(), WorkflowError> {
        let path = self.high_res_dir().join(name);
        std::fs::write(&path, bytes).map_err(|source| WorkflowError::StorageWrite { path, source })
    }

    /// Load a stored thumbnail as base64 for inline API payloads.
    pub fn thumbnail_base64(&self, name: &str) -> Result<String, WorkflowError> {
        let path = self.thumbnails_dir().join(name);
        let bytes =
            std::fs::read(&path).map_err(|source| WorkflowError::StorageRead { path, source })?;
        Ok(BASE64.encode(bytes))
    }

    /// Load a stored high-res page as base64 (used by export payloads).
    pub fn high_res_base64(&self, name: &str) -> Result<String, WorkflowError> {
        let path = self.high_res_dir().join(name);
        let bytes =
            std::fs::read(&path).map_err(|source| WorkflowError::StorageRead { path, source })?;
        Ok(BASE64.encode(bytes))
    }
}

/// Encode raw JPEG bytes once for an inline payload.
pub fn to_base64(bytes: &[u8]) -> String {
    BASE64.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creates_directory_tree() {
        let dir = tempfile::tempdir().unwrap();
        let store = ImageStore::new(dir.path().join("storage")).unwrap();
        assert!(store.originals_dir().is_dir());
        assert!(store.thumbnails_dir().is_dir());
        assert!(store.high_res_dir().is_dir());
    }

    #[test]
    fn original_roundtrip_and_discard() {
        let dir = tempfile::tempdir().unwrap();
        let store = ImageStore::new(dir.path()).unwrap();
        store.save_original("sess", b"%PDF-1.4 fake").unwrap();
        assert_eq!(store.read_original("sess").unwrap(), b"%PDF-1.4 fake");
        store.discard_original("sess").unwrap();
        assert!(store.read_original("sess").is_err());
    }

    #[test]
    fn thumbnail_base64_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = ImageStore::new(dir.path()).unwrap();
        let name = ImageStore::thumbnail_name("sess", 0);
        store.save_thumbnail(&name, &[0xFF, 0xD8, 0xFF]).unwrap();
        let encoded = store.thumbnail_base64(&name).unwrap();
        assert_eq!(encoded, to_base64(&[0xFF, 0xD8, 0xFF]));
    }

    #[test]
    fn missing_thumbnail_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let store = ImageStore::new(dir.path()).unwrap();
        let err = store.thumbnail_base64("nope.jpg").unwrap_err();
        assert!(err.to_string().contains("nope.jpg"));
    }
}
