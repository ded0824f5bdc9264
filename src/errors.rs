//! Typed error hierarchy for the beoflow service.
//!
//! Two top-level enums cover the two subsystems:
//! - `ReviewError` — review session state machine failures
//! - `WorkflowError` — upload, rasterisation, and storage failures

use thiserror::Error;

/// Errors from the review session state machine.
///
/// `NoPagesKept` and `CreateRecord` are recoverable: the session stays
/// interactive and the caller may retry. The remaining variants are
/// caller errors (an operation invoked in a state that does not accept it).
#[derive(Debug, Error)]
pub enum ReviewError {
    #[error("review session has no pages")]
    EmptyDocument,

    #[error("all pages have been decided; finalize or go back")]
    AllPagesDecided,

    #[error("already at the first page")]
    AtFirstPage,

    #[error("not all pages have been decided yet")]
    ReviewIncomplete,

    #[error("review session already completed")]
    SessionCompleted,

    #[error("no pages were kept")]
    NoPagesKept,

    #[error("failed to create record {label}: {source}")]
    CreateRecord {
        label: String,
        #[source]
        source: anyhow::Error,
    },
}

/// Errors from the upload and storage pipeline.
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("file must be a PDF")]
    NotAPdf,

    #[error("session {session_id} not found")]
    SessionNotFound { session_id: String },

    #[error("failed to rasterise PDF: {detail}")]
    RenderFailed { detail: String },

    #[error("failed to write {path}: {source}")]
    StorageWrite {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read {path}: {source}")]
    StorageRead {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn review_error_create_record_carries_label() {
        let err = ReviewError::CreateRecord {
            label: "Record 3".to_string(),
            source: anyhow::anyhow!("backend unavailable"),
        };
        match &err {
            ReviewError::CreateRecord { label, .. } => assert_eq!(label, "Record 3"),
            _ => panic!("Expected CreateRecord variant"),
        }
        assert!(err.to_string().contains("Record 3"));
    }

    #[test]
    fn review_error_no_pages_kept_message() {
        let err = ReviewError::NoPagesKept;
        assert_eq!(err.to_string(), "no pages were kept");
    }

    #[test]
    fn workflow_error_session_not_found_carries_id() {
        let err = WorkflowError::SessionNotFound {
            session_id: "abc-123".to_string(),
        };
        assert!(err.to_string().contains("abc-123"));
    }

    #[test]
    fn workflow_error_storage_write_carries_path() {
        use std::path::PathBuf;
        let path = PathBuf::from("/storage/originals/x.pdf");
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err = WorkflowError::StorageWrite {
            path: path.clone(),
            source: io_err,
        };
        match &err {
            WorkflowError::StorageWrite { path: p, source: s } => {
                assert_eq!(p, &path);
                assert_eq!(s.kind(), std::io::ErrorKind::PermissionDenied);
            }
            _ => panic!("Expected StorageWrite"),
        }
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&ReviewError::NoPagesKept);
        assert_std_error(&WorkflowError::NotAPdf);
    }
}
