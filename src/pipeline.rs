//! Upload and record-creation pipeline.
//!
//! Ties the stages together: persist the uploaded PDF, rasterise review
//! thumbnails, carve kept pages out into new high-res BEOs, and discard
//! the source packet once a review pass completes. The review state
//! machine reaches this module only through [`BeoRecordSink`].

use std::sync::LazyLock;

use async_trait::async_trait;
use chrono::{Datelike, NaiveDate};
use regex::Regex;
use uuid::Uuid;

use crate::db::{DbHandle, NewBeo};
use crate::errors::WorkflowError;
use crate::models::{Beo, BeoStatus, FileType, SessionResponse};
use crate::render::{self, RenderQuality};
use crate::review::RecordSink;
use crate::storage::{self, ImageStore};

/// Matches packet filenames like `1028 Tuesday.pdf`.
static FILENAME_DATE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^(\d{2})(\d{2})\s+\w+\.pdf$").unwrap());

/// Board label for uploads promoted whole, without a review pass. The
/// user renames these from the metadata editor afterwards.
pub const PROMOTED_BEO_NUMBER: &str = "BEO 1";

/// Detect an event date from a `MMDD DayName.pdf` filename.
///
/// The year is assumed to be the current one; a date more than 180 days
/// in the past is taken to mean the packet is for next year.
pub fn parse_filename_date(filename: &str, today: NaiveDate) -> Option<NaiveDate> {
    let caps = FILENAME_DATE_RE.captures(filename)?;
    let month: u32 = caps[1].parse().ok()?;
    let day: u32 = caps[2].parse().ok()?;

    let date = NaiveDate::from_ymd_opt(today.year(), month, day)?;
    if (today - date).num_days() > 180 {
        NaiveDate::from_ymd_opt(today.year() + 1, month, day)
    } else {
        Some(date)
    }
}

/// Ingest one uploaded PDF: store the original, rasterise thumbnails,
/// and record the upload session with one page row per scanned page.
pub async fn ingest_upload(
    db: &DbHandle,
    store: &ImageStore,
    filename: &str,
    pdf_bytes: Vec<u8>,
    file_type: FileType,
    event_date: Option<NaiveDate>,
) -> Result<SessionResponse, WorkflowError> {
    if !filename.to_lowercase().ends_with(".pdf") {
        return Err(WorkflowError::NotAPdf);
    }

    let session_id = Uuid::new_v4().to_string();
    store.save_original(&session_id, &pdf_bytes)?;

    // No DB row references the original yet; do not strand it if the
    // document cannot be rendered.
    let thumbnails = match render::render_pages(pdf_bytes, None, RenderQuality::Thumbnail).await {
        Ok(pages) => pages,
        Err(e) => {
            discard_orphaned_original(store, &session_id);
            return Err(e);
        }
    };
    let total_pages = thumbnails.len() as i64;

    let event_date =
        event_date.or_else(|| parse_filename_date(filename, chrono::Local::now().date_naive()));

    let mut base64_pages = Vec::with_capacity(thumbnails.len());
    let mut page_rows = Vec::with_capacity(thumbnails.len());
    for page in &thumbnails {
        let name = ImageStore::thumbnail_name(&session_id, page.index);
        store.save_thumbnail(&name, &page.jpeg)?;
        base64_pages.push(storage::to_base64(&page.jpeg));
        page_rows.push((page.index as i64, name));
    }

    let new = NewBeo {
        session_id: session_id.clone(),
        filename: filename.to_string(),
        beo_number: None,
        event_date,
        order_position: 0,
        status: BeoStatus::New,
        file_type: file_type.clone(),
        total_pages,
    };
    db.call(move |db| {
        let beo = db.create_beo(&new)?;
        for (idx, thumb) in &page_rows {
            db.create_page(beo.id, *idx, *idx, Some(thumb), None)?;
        }
        Ok(())
    })
    .await?;

    tracing::info!(%session_id, filename, total_pages, "upload ingested");

    Ok(SessionResponse {
        session_id,
        filename: filename.to_string(),
        total_pages,
        pages: base64_pages,
        event_date,
        file_type,
    })
}

/// Create a new BEO from specific pages of an uploaded packet.
///
/// Renders the selected pages at both tiers, stores them under a fresh
/// session id, and inherits event date and file type from the parent
/// upload. Out-of-range indices are skipped.
pub async fn create_beo_from_pages(
    db: &DbHandle,
    store: &ImageStore,
    parent_session_id: &str,
    beo_number: Option<String>,
    page_indices: &[usize],
    order_position: i64,
) -> Result<Beo, WorkflowError> {
    let parent_id = parent_session_id.to_string();
    let parent = db
        .call(move |db| db.get_beo(&parent_id))
        .await?
        .ok_or_else(|| WorkflowError::SessionNotFound {
            session_id: parent_session_id.to_string(),
        })?;

    let pdf_bytes = store.read_original(parent_session_id)?;
    let high_res = render::render_pages(
        pdf_bytes.clone(),
        Some(page_indices.to_vec()),
        RenderQuality::HighRes,
    )
    .await?;
    let thumbs = render::render_pages(
        pdf_bytes,
        Some(page_indices.to_vec()),
        RenderQuality::Thumbnail,
    )
    .await?;

    let new_session_id = Uuid::new_v4().to_string();
    let mut page_rows = Vec::with_capacity(high_res.len());
    for (new_idx, (hr, thumb)) in high_res.iter().zip(thumbs.iter()).enumerate() {
        let hr_name = ImageStore::high_res_name(&new_session_id, new_idx);
        store.save_high_res(&hr_name, &hr.jpeg)?;
        let thumb_name = ImageStore::thumbnail_name(&new_session_id, new_idx);
        store.save_thumbnail(&thumb_name, &thumb.jpeg)?;
        page_rows.push((new_idx as i64, hr.index as i64, thumb_name, hr_name));
    }

    let new = NewBeo {
        session_id: new_session_id.clone(),
        filename: parent.filename.clone(),
        beo_number,
        event_date: parent.event_date,
        order_position,
        status: BeoStatus::ReadyForAnnotation,
        file_type: parent.file_type.clone(),
        total_pages: page_rows.len() as i64,
    };
    let beo = db
        .call(move |db| {
            let beo = db.create_beo(&new)?;
            for (new_idx, original_idx, thumb, hr) in &page_rows {
                db.create_page(beo.id, *new_idx, *original_idx, Some(thumb), Some(hr))?;
            }
            Ok(beo)
        })
        .await?;

    tracing::info!(
        parent = parent_session_id,
        session_id = %beo.session_id,
        pages = beo.total_pages,
        "created BEO from pages"
    );
    Ok(beo)
}

/// Rasterise the selected pages of an existing upload at high resolution
/// in place, for annotation. Returns `(page_index, base64 jpeg)` pairs.
pub async fn process_selected_pages(
    db: &DbHandle,
    store: &ImageStore,
    session_id: &str,
    selected: &[usize],
) -> Result<Vec<(usize, String)>, WorkflowError> {
    let sid = session_id.to_string();
    let beo = db
        .call(move |db| db.get_beo(&sid))
        .await?
        .ok_or_else(|| WorkflowError::SessionNotFound {
            session_id: session_id.to_string(),
        })?;

    let pdf_bytes = store.read_original(session_id)?;
    let rendered = render::render_pages(
        pdf_bytes,
        Some(selected.to_vec()),
        RenderQuality::HighRes,
    )
    .await?;

    let mut results = Vec::with_capacity(rendered.len());
    let mut updates = Vec::with_capacity(rendered.len());
    for page in &rendered {
        let name = ImageStore::high_res_name(session_id, page.index);
        store.save_high_res(&name, &page.jpeg)?;
        results.push((page.index, storage::to_base64(&page.jpeg)));
        updates.push((page.index as i64, name));
    }

    let beo_id = beo.id;
    let sid = session_id.to_string();
    db.call(move |db| {
        for (idx, name) in &updates {
            db.set_high_res_path(beo_id, *idx, name)?;
        }
        db.set_status(&sid, &BeoStatus::ReadyForAnnotation)?;
        Ok(())
    })
    .await?;

    Ok(results)
}

/// Promote whole uploads straight to high-res BEOs, skipping review.
/// Unknown sessions and missing originals are skipped, not errors —
/// batch uploads keep going.
pub async fn promote_all_pages(
    db: &DbHandle,
    store: &ImageStore,
    session_ids: &[String],
) -> Result<Vec<Beo>, WorkflowError> {
    let mut promoted = Vec::new();
    for session_id in session_ids {
        let sid = session_id.clone();
        let Some(parent) = db.call(move |db| db.get_beo(&sid)).await? else {
            tracing::warn!(session_id, "skipping unknown session in batch promote");
            continue;
        };
        if store.read_original(session_id).is_err() {
            tracing::warn!(session_id, "skipping session with missing original");
            continue;
        }
        let all_pages: Vec<usize> = (0..parent.total_pages as usize).collect();
        let beo = create_beo_from_pages(
            db,
            store,
            session_id,
            Some(PROMOTED_BEO_NUMBER.to_string()),
            &all_pages,
            0,
        )
        .await?;
        promoted.push(beo);
    }
    Ok(promoted)
}

/// Remove an upload that never became a BEO row. Best-effort, like
/// `discard_source` on finalize.
fn discard_orphaned_original(store: &ImageStore, session_id: &str) {
    if let Err(e) = store.discard_original(session_id) {
        tracing::warn!(%session_id, error = %e, "failed to remove orphaned original");
    }
}

/// Finalize seam: persists review drafts as BEOs and cleans up the
/// source upload.
pub struct BeoRecordSink {
    db: DbHandle,
    store: ImageStore,
    parent_session_id: String,
}

impl BeoRecordSink {
    pub fn new(db: DbHandle, store: ImageStore, parent_session_id: String) -> Self {
        Self {
            db,
            store,
            parent_session_id,
        }
    }
}

#[async_trait]
impl RecordSink for BeoRecordSink {
    async fn create_record(
        &self,
        label: &str,
        pages: &[usize],
        order_position: usize,
    ) -> anyhow::Result<String> {
        let beo = create_beo_from_pages(
            &self.db,
            &self.store,
            &self.parent_session_id,
            Some(label.to_string()),
            pages,
            order_position as i64,
        )
        .await?;
        Ok(beo.session_id)
    }

    async fn discard_source(&self) -> anyhow::Result<()> {
        let sid = self.parent_session_id.clone();
        self.db.call(move |db| db.delete_beo(&sid)).await?;
        self.store.discard_original(&self.parent_session_id)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn parses_mmdd_dayname_filenames() {
        let today = date(2025, 10, 1);
        assert_eq!(
            parse_filename_date("1028 Tuesday.pdf", today),
            Some(date(2025, 10, 28))
        );
        assert_eq!(
            parse_filename_date("1027 monday.PDF", today),
            Some(date(2025, 10, 27))
        );
    }

    #[test]
    fn rolls_far_past_dates_to_next_year() {
        let today = date(2025, 12, 1);
        // January is more than 180 days behind December.
        assert_eq!(
            parse_filename_date("0115 Wednesday.pdf", today),
            Some(date(2026, 1, 15))
        );
        // Last week stays in the current year.
        assert_eq!(
            parse_filename_date("1125 Tuesday.pdf", today),
            Some(date(2025, 11, 25))
        );
    }

    #[test]
    fn rejects_unrelated_filenames() {
        let today = date(2025, 10, 1);
        assert_eq!(parse_filename_date("menu.pdf", today), None);
        assert_eq!(parse_filename_date("1028 Tuesday.docx", today), None);
        assert_eq!(parse_filename_date("9941 Nowhere.pdf", today), None);
    }

    #[tokio::test]
    async fn ingest_rejects_non_pdf_uploads() {
        let dir = tempfile::tempdir().unwrap();
        let store = ImageStore::new(dir.path()).unwrap();
        let db = DbHandle::new(crate::db::WorkflowDb::new_in_memory().unwrap());
        let err = ingest_upload(&db, &store, "notes.txt", vec![1, 2, 3], FileType::Daily, None)
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::NotAPdf));
    }

    #[test]
    fn orphaned_original_cleanup_is_best_effort() {
        let dir = tempfile::tempdir().unwrap();
        let store = ImageStore::new(dir.path()).unwrap();
        store.save_original("sess", b"%PDF-1.4 fake").unwrap();

        discard_orphaned_original(&store, "sess");
        assert!(store.read_original("sess").is_err());

        // A missing file is swallowed, not an error.
        discard_orphaned_original(&store, "sess");
    }

    #[tokio::test]
    async fn create_from_pages_requires_known_parent() {
        let dir = tempfile::tempdir().unwrap();
        let store = ImageStore::new(dir.path()).unwrap();
        let db = DbHandle::new(crate::db::WorkflowDb::new_in_memory().unwrap());
        let err = create_beo_from_pages(&db, &store, "ghost", None, &[0], 0)
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::SessionNotFound { .. }));
    }
}
