use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use axum::{
    Json, Router,
    extract::{Multipart, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, patch, post},
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::db::DbHandle;
use crate::errors::{ReviewError, WorkflowError};
use crate::models::*;
use crate::pipeline::{self, BeoRecordSink};
use crate::review::ReviewSession;
use crate::storage::ImageStore;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub db: DbHandle,
    pub store: ImageStore,
    /// In-flight review passes, keyed by upload session id. Sessions are
    /// ephemeral; a restart discards them, the uploads stay.
    pub reviews: Mutex<HashMap<String, ReviewSession>>,
}

pub type SharedState = Arc<AppState>;

// ── Request/response payload types ────────────────────────────────────

#[derive(Deserialize)]
pub struct PageSelection {
    pub session_id: String,
    pub selected_pages: Vec<usize>,
}

#[derive(Deserialize)]
pub struct ProcessAllPagesRequest {
    pub session_ids: Vec<String>,
}

#[derive(Deserialize)]
pub struct AnnotationRequest {
    pub session_id: String,
    pub page_index: i64,
    pub annotation_data: serde_json::Value,
}

#[derive(Deserialize)]
pub struct BeoMetadataRequest {
    pub session_id: String,
    pub beo_number: Option<String>,
    pub event_date: Option<NaiveDate>,
    pub order_position: Option<i64>,
}

#[derive(Deserialize)]
pub struct BeoReorderRequest {
    pub session_id: String,
    pub event_date: NaiveDate,
    pub order_position: i64,
}

#[derive(Deserialize)]
pub struct CreateFromPagesRequest {
    pub parent_session_id: String,
    pub beo_number: String,
    pub page_indices: Vec<usize>,
    /// Defaults to the next free slot on the parent's day.
    pub order_position: Option<i64>,
}

/// Per-file metadata accompanying a batched upload.
#[derive(Deserialize)]
pub struct FileUploadItem {
    pub filename: String,
    pub event_date: Option<NaiveDate>,
    #[serde(default)]
    pub file_type: Option<FileType>,
}

#[derive(Serialize)]
pub struct ReviewStateResponse {
    pub session_id: String,
    pub total_pages: usize,
    pub current_page: usize,
    pub ready_to_finalize: bool,
    pub records: Vec<crate::review::RecordDraft>,
}

// ── Error handling ────────────────────────────────────────────────────

pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<WorkflowError> for ApiError {
    fn from(e: WorkflowError) -> Self {
        match e {
            WorkflowError::SessionNotFound { .. } => ApiError::NotFound(e.to_string()),
            WorkflowError::NotAPdf => ApiError::BadRequest(e.to_string()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<ReviewError> for ApiError {
    fn from(e: ReviewError) -> Self {
        match e {
            ReviewError::CreateRecord { .. } => ApiError::Internal(e.to_string()),
            other => ApiError::BadRequest(other.to_string()),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        ApiError::Internal(e.to_string())
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/upload-pdf", post(upload_pdf))
        .route("/api/upload-multiple-pdfs", post(upload_multiple_pdfs))
        .route("/api/process-all-pages", post(process_all_pages))
        .route("/api/select-pages", post(select_pages))
        .route("/api/process-selected-pages", post(process_selected_pages))
        .route("/api/review/{session_id}/start", post(review_start))
        .route("/api/review/{session_id}/keep", post(review_keep))
        .route("/api/review/{session_id}/discard", post(review_discard))
        .route("/api/review/{session_id}/back", post(review_back))
        .route("/api/review/{session_id}/finalize", post(review_finalize))
        .route("/api/beos/create-from-pages", post(create_from_pages))
        .route("/api/save-annotation", post(save_annotation))
        .route("/api/session/{session_id}", get(get_session))
        .route("/api/beos", get(list_beos))
        .route("/api/beos/metadata", patch(update_metadata))
        .route("/api/beos/reorder", post(reorder_beo))
        .route("/api/beos/week/{year}/{week}", get(get_week))
        .route("/api/beos/day/{date}", get(get_day))
        .route("/api/beos/{session_id}/pages", get(get_beo_pages))
        .route("/api/beos/{session_id}", delete(delete_beo))
        .route("/api/export/{session_id}", get(export_session))
        .route("/health", get(health_check))
}

// ── Helpers ───────────────────────────────────────────────────────────

async fn require_beo(state: &SharedState, session_id: &str) -> Result<Beo, ApiError> {
    let sid = session_id.to_string();
    state
        .db
        .call(move |db| db.get_beo(&sid))
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("session {} not found", session_id)))
}

/// Build the card summary for one BEO: first-page thumbnail inline,
/// annotation count, and the beo-number fallback.
async fn summarize(state: &SharedState, beo: Beo) -> Result<BeoSummary, ApiError> {
    let beo_id = beo.id;
    let (annotation_count, first_thumb) = state
        .db
        .call(move |db| {
            let count = db.annotation_count(beo_id)?;
            let thumb = db
                .pages_for_beo(beo_id)?
                .into_iter()
                .find(|p| p.page_index == 0)
                .and_then(|p| p.thumbnail_path);
            Ok((count, thumb))
        })
        .await?;

    let thumbnail = match first_thumb {
        Some(name) => state.store.thumbnail_base64(&name).ok(),
        None => None,
    };

    let beo_number = beo
        .beo_number
        .clone()
        .unwrap_or_else(|| beo.session_id.chars().take(7).collect());

    Ok(BeoSummary {
        session_id: beo.session_id,
        filename: beo.filename,
        beo_number,
        event_date: beo.event_date,
        order_position: beo.order_position,
        status: beo.status,
        total_pages: beo.total_pages,
        annotation_count,
        thumbnail,
        created_at: beo.created_at,
    })
}

fn review_state_response(session_id: &str, session: &ReviewSession) -> ReviewStateResponse {
    ReviewStateResponse {
        session_id: session_id.to_string(),
        total_pages: session.total_pages(),
        current_page: session.current_page(),
        ready_to_finalize: session.ready_to_finalize(),
        records: session.records().to_vec(),
    }
}

/// Apply one decision to a registered review session.
fn with_review_session<T>(
    state: &SharedState,
    session_id: &str,
    f: impl FnOnce(&mut ReviewSession) -> Result<T, ReviewError>,
) -> Result<ReviewStateResponse, ApiError> {
    let mut reviews = state
        .reviews
        .lock()
        .map_err(|_| ApiError::Internal("review registry lock poisoned".into()))?;
    let session = reviews
        .get_mut(session_id)
        .ok_or_else(|| ApiError::NotFound(format!("no review in progress for {}", session_id)))?;
    f(session)?;
    Ok(review_state_response(session_id, session))
}

// ── Upload handlers ───────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn upload_pdf(
    State(state): State<SharedState>,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, ApiError> {
    let mut file: Option<(String, Vec<u8>)> = None;
    let mut file_type = FileType::Daily;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(format!("invalid multipart body: {}", e)))?
    {
        let name = field.name().map(str::to_owned);
        match name.as_deref() {
            Some("file") => {
                let filename = field.file_name().unwrap_or("upload.pdf").to_string();
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::BadRequest(format!("failed to read upload: {}", e)))?;
                file = Some((filename, bytes.to_vec()));
            }
            Some("file_type") => {
                let value = field
                    .text()
                    .await
                    .map_err(|e| ApiError::BadRequest(format!("invalid file_type: {}", e)))?;
                file_type = value
                    .parse()
                    .map_err(|e: String| ApiError::BadRequest(e))?;
            }
            _ => {}
        }
    }

    let (filename, bytes) =
        file.ok_or_else(|| ApiError::BadRequest("missing 'file' field".into()))?;
    let response =
        pipeline::ingest_upload(&state.db, &state.store, &filename, bytes, file_type, None).await?;
    Ok(Json(response))
}

async fn upload_multiple_pdfs(
    State(state): State<SharedState>,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, ApiError> {
    let mut files: Vec<(String, Vec<u8>)> = Vec::new();
    let mut file_info: Vec<FileUploadItem> = Vec::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(format!("invalid multipart body: {}", e)))?
    {
        let name = field.name().map(str::to_owned);
        match name.as_deref() {
            Some("files") => {
                let filename = field.file_name().unwrap_or("upload.pdf").to_string();
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::BadRequest(format!("failed to read upload: {}", e)))?;
                files.push((filename, bytes.to_vec()));
            }
            Some("file_data") => {
                let raw = field
                    .text()
                    .await
                    .map_err(|e| ApiError::BadRequest(format!("invalid file_data: {}", e)))?;
                file_info = serde_json::from_str(&raw)
                    .map_err(|e| ApiError::BadRequest(format!("invalid file_data JSON: {}", e)))?;
            }
            _ => {}
        }
    }

    let mut results = Vec::new();
    for (filename, bytes) in files {
        // Non-PDF entries in a batch are skipped, not fatal.
        if !filename.to_lowercase().ends_with(".pdf") {
            continue;
        }
        let info = file_info.iter().find(|i| i.filename == filename);
        let file_type = info
            .and_then(|i| i.file_type.clone())
            .unwrap_or(FileType::Daily);
        let event_date = info.and_then(|i| i.event_date);
        let response = pipeline::ingest_upload(
            &state.db,
            &state.store,
            &filename,
            bytes,
            file_type,
            event_date,
        )
        .await?;
        results.push(response);
    }

    let count = results.len();
    Ok(Json(serde_json::json!({"results": results, "count": count})))
}

async fn process_all_pages(
    State(state): State<SharedState>,
    Json(req): Json<ProcessAllPagesRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let promoted = pipeline::promote_all_pages(&state.db, &state.store, &req.session_ids).await?;
    Ok(Json(serde_json::json!({
        "status": "success",
        "processed_count": promoted.len(),
        "beos": promoted,
    })))
}

async fn select_pages(
    State(state): State<SharedState>,
    Json(selection): Json<PageSelection>,
) -> Result<impl IntoResponse, ApiError> {
    require_beo(&state, &selection.session_id).await?;
    let sid = selection.session_id.clone();
    state
        .db
        .call(move |db| db.set_status(&sid, &BeoStatus::Selected))
        .await?;
    Ok(Json(serde_json::json!({
        "status": "success",
        "selected_count": selection.selected_pages.len(),
        "message": "Ready for high-res processing",
    })))
}

async fn process_selected_pages(
    State(state): State<SharedState>,
    Json(selection): Json<PageSelection>,
) -> Result<impl IntoResponse, ApiError> {
    let pages = pipeline::process_selected_pages(
        &state.db,
        &state.store,
        &selection.session_id,
        &selection.selected_pages,
    )
    .await?;
    let high_res: serde_json::Map<String, serde_json::Value> = pages
        .iter()
        .map(|(idx, b64)| (idx.to_string(), serde_json::Value::String(b64.clone())))
        .collect();
    Ok(Json(serde_json::json!({
        "status": "success",
        "processed_pages": pages.len(),
        "high_res_pages": high_res,
    })))
}

// ── Review session handlers ───────────────────────────────────────────

async fn review_start(
    State(state): State<SharedState>,
    Path(session_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let beo = require_beo(&state, &session_id).await?;
    let session = ReviewSession::new(beo.total_pages as usize)?;
    let response = review_state_response(&session_id, &session);
    state
        .reviews
        .lock()
        .map_err(|_| ApiError::Internal("review registry lock poisoned".into()))?
        .insert(session_id, session);
    Ok((StatusCode::CREATED, Json(response)))
}

async fn review_keep(
    State(state): State<SharedState>,
    Path(session_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let response = with_review_session(&state, &session_id, |s| s.keep())?;
    Ok(Json(response))
}

async fn review_discard(
    State(state): State<SharedState>,
    Path(session_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let response = with_review_session(&state, &session_id, |s| s.discard())?;
    Ok(Json(response))
}

async fn review_back(
    State(state): State<SharedState>,
    Path(session_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let response = with_review_session(&state, &session_id, |s| s.back())?;
    Ok(Json(response))
}

/// Persist the drafts of a finished pass. The session is taken out of
/// the registry for the duration of the (awaited, sequential) create
/// calls and put back only if finalize did not complete, so a retry
/// starts from exactly the pre-finalize state.
async fn review_finalize(
    State(state): State<SharedState>,
    Path(session_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let mut session = state
        .reviews
        .lock()
        .map_err(|_| ApiError::Internal("review registry lock poisoned".into()))?
        .remove(&session_id)
        .ok_or_else(|| ApiError::NotFound(format!("no review in progress for {}", session_id)))?;

    let sink = BeoRecordSink::new(state.db.clone(), state.store.clone(), session_id.clone());
    let result = session.finalize(&sink).await;

    if !session.is_completed() {
        state
            .reviews
            .lock()
            .map_err(|_| ApiError::Internal("review registry lock poisoned".into()))?
            .insert(session_id, session);
        return Err(match result {
            Err(e) => e.into(),
            Ok(_) => ApiError::Internal("finalize left session incomplete".into()),
        });
    }

    let created = result.map_err(ApiError::from)?;
    Ok(Json(serde_json::json!({
        "status": "success",
        "created": created,
    })))
}

// ── BEO handlers ──────────────────────────────────────────────────────

async fn create_from_pages(
    State(state): State<SharedState>,
    Json(req): Json<CreateFromPagesRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let parent = require_beo(&state, &req.parent_session_id).await?;
    let order_position = match (req.order_position, parent.event_date) {
        (Some(pos), _) => pos,
        (None, Some(date)) => {
            state
                .db
                .call(move |db| db.next_position_for_day(date))
                .await?
        }
        (None, None) => 0,
    };
    let beo = pipeline::create_beo_from_pages(
        &state.db,
        &state.store,
        &req.parent_session_id,
        Some(req.beo_number),
        &req.page_indices,
        order_position,
    )
    .await?;
    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({
            "status": "success",
            "session_id": beo.session_id,
            "beo_number": beo.beo_number,
        })),
    ))
}

async fn save_annotation(
    State(state): State<SharedState>,
    Json(req): Json<AnnotationRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let beo = require_beo(&state, &req.session_id).await?;
    let beo_id = beo.id;
    let sid = req.session_id.clone();
    state
        .db
        .call(move |db| {
            db.upsert_annotation(beo_id, req.page_index, &req.annotation_data)?;
            db.set_status(&sid, &BeoStatus::Annotated)
        })
        .await?;
    Ok(Json(serde_json::json!({"status": "success"})))
}

async fn get_session(
    State(state): State<SharedState>,
    Path(session_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let beo = require_beo(&state, &session_id).await?;
    let beo_id = beo.id;
    let annotations = state
        .db
        .call(move |db| db.annotations_for_beo(beo_id))
        .await?;

    let annotations_map: serde_json::Map<String, serde_json::Value> = annotations
        .into_iter()
        .map(|a| (a.page_index.to_string(), a.canvas_data))
        .collect();

    Ok(Json(serde_json::json!({
        "session_id": beo.session_id,
        "filename": beo.filename,
        "total_pages": beo.total_pages,
        "status": beo.status,
        "annotations": annotations_map,
        "created_at": beo.created_at,
        "updated_at": beo.updated_at,
    })))
}

async fn get_beo_pages(
    State(state): State<SharedState>,
    Path(session_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let beo = require_beo(&state, &session_id).await?;
    let beo_id = beo.id;
    let pages = state.db.call(move |db| db.pages_for_beo(beo_id)).await?;

    // High-res pages go out as URLs, not inline payloads.
    let high_res: serde_json::Map<String, serde_json::Value> = pages
        .into_iter()
        .filter_map(|p| {
            p.high_res_path.map(|name| {
                (
                    p.page_index.to_string(),
                    serde_json::Value::String(format!("/storage/high_res/{}", name)),
                )
            })
        })
        .collect();

    Ok(Json(serde_json::json!({
        "session_id": beo.session_id,
        "beo_number": beo.beo_number,
        "filename": beo.filename,
        "total_pages": beo.total_pages,
        "high_res_pages": high_res,
    })))
}

async fn export_session(
    State(state): State<SharedState>,
    Path(session_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let beo = require_beo(&state, &session_id).await?;
    let beo_id = beo.id;
    let (pages, annotations) = state
        .db
        .call(move |db| Ok((db.pages_for_beo(beo_id)?, db.annotations_for_beo(beo_id)?)))
        .await?;

    let annotations_map: HashMap<i64, serde_json::Value> = annotations
        .into_iter()
        .map(|a| (a.page_index, a.canvas_data))
        .collect();

    let mut export_pages = Vec::with_capacity(pages.len());
    for page in pages {
        let image = match (&page.high_res_path, &page.thumbnail_path) {
            (Some(name), _) => state.store.high_res_base64(name)?,
            (None, Some(name)) => state.store.thumbnail_base64(name)?,
            (None, None) => continue,
        };
        export_pages.push(serde_json::json!({
            "page_number": page.page_index + 1,
            "image": image,
            "annotations": annotations_map
                .get(&page.page_index)
                .cloned()
                .unwrap_or_else(|| serde_json::json!({})),
        }));
    }

    Ok(Json(serde_json::json!({
        "filename": beo.filename,
        "pages": export_pages,
    })))
}

async fn list_beos(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    let beos = state.db.call(move |db| db.list_beos()).await?;
    let summaries: Vec<serde_json::Value> = beos
        .iter()
        .map(|b| {
            serde_json::json!({
                "session_id": b.session_id,
                "filename": b.filename,
                "total_pages": b.total_pages,
                "status": b.status,
                "created_at": b.created_at,
            })
        })
        .collect();
    Ok(Json(
        serde_json::json!({"count": summaries.len(), "beos": summaries}),
    ))
}

async fn get_week(
    State(state): State<SharedState>,
    Path((year, week)): Path<(i32, u32)>,
) -> Result<impl IntoResponse, ApiError> {
    let week_start = NaiveDate::from_isoywd_opt(year, week, chrono::Weekday::Mon)
        .ok_or_else(|| ApiError::BadRequest(format!("invalid week {}/{}", year, week)))?;
    let week_end = week_start + chrono::Days::new(6);

    let beos = state
        .db
        .call(move |db| db.beos_in_date_range(week_start, week_end))
        .await?;

    let mut days: Vec<DayColumn> = (0..7)
        .map(|offset| {
            let date = week_start + chrono::Days::new(offset);
            DayColumn {
                day: date.format("%A").to_string(),
                date,
                beos: Vec::new(),
            }
        })
        .collect();

    for beo in beos {
        let Some(date) = beo.event_date else { continue };
        let summary = summarize(&state, beo).await?;
        if let Some(column) = days.iter_mut().find(|d| d.date == date) {
            column.beos.push(summary);
        }
    }

    Ok(Json(WeekView {
        year,
        week_number: week,
        week_start,
        week_end,
        days,
    }))
}

async fn get_day(
    State(state): State<SharedState>,
    Path(date): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let date: NaiveDate = date
        .parse()
        .map_err(|_| ApiError::BadRequest("Invalid date format. Use YYYY-MM-DD".into()))?;

    let beos = state.db.call(move |db| db.beos_for_day(date)).await?;
    let mut summaries = Vec::with_capacity(beos.len());
    for beo in beos {
        summaries.push(summarize(&state, beo).await?);
    }

    Ok(Json(DayView {
        date,
        beos: summaries,
    }))
}

async fn update_metadata(
    State(state): State<SharedState>,
    Json(req): Json<BeoMetadataRequest>,
) -> Result<impl IntoResponse, ApiError> {
    require_beo(&state, &req.session_id).await?;
    let beo = state
        .db
        .call(move |db| {
            db.update_metadata(
                &req.session_id,
                req.beo_number.as_deref(),
                req.event_date,
                req.order_position,
            )
        })
        .await?;
    Ok(Json(serde_json::json!({
        "status": "success",
        "message": "BEO metadata updated",
        "beo": beo,
    })))
}

async fn reorder_beo(
    State(state): State<SharedState>,
    Json(req): Json<BeoReorderRequest>,
) -> Result<impl IntoResponse, ApiError> {
    require_beo(&state, &req.session_id).await?;
    state
        .db
        .call(move |db| db.reorder_beo(&req.session_id, req.event_date, req.order_position))
        .await?;
    Ok(Json(serde_json::json!({
        "status": "success",
        "message": "BEO reordered successfully",
    })))
}

async fn delete_beo(
    State(state): State<SharedState>,
    Path(session_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let sid = session_id.clone();
    let removed = state.db.call(move |db| db.delete_beo(&sid)).await?;
    if !removed {
        return Err(ApiError::NotFound(format!(
            "session {} not found",
            session_id
        )));
    }
    // The original PDF may already be gone (discarded by finalize).
    if let Err(e) = state.store.discard_original(&session_id) {
        tracing::debug!(session_id, error = %e, "no original to remove");
    }
    Ok(Json(serde_json::json!({
        "status": "success",
        "message": "BEO deleted successfully",
    })))
}
