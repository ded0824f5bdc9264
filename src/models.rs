use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// One digitized BEO (banquet event order). Rows in the `beos` table.
///
/// An upload session and a finished BEO share this type: an upload starts
/// life as a `Beo` in `New` status holding every scanned page, and the
/// review pass carves it into per-event BEOs in `ReadyForAnnotation`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Beo {
    pub id: i64,
    pub session_id: String,
    pub filename: String,
    /// Short identifier assigned by the user (last 3-4 digits or the full
    /// 7-digit BEO number). None until set.
    pub beo_number: Option<String>,
    pub event_date: Option<chrono::NaiveDate>,
    pub day_of_week: Option<String>,
    pub week_number: Option<u32>,
    pub year: Option<i32>,
    /// Position within the day on the calendar board.
    pub order_position: i64,
    pub status: BeoStatus,
    pub file_type: FileType,
    pub is_active: bool,
    pub total_pages: i64,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum BeoStatus {
    New,
    Selected,
    ReadyForAnnotation,
    Annotated,
    Approved,
    Archived,
}

impl BeoStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Selected => "selected",
            Self::ReadyForAnnotation => "ready_for_annotation",
            Self::Annotated => "annotated",
            Self::Approved => "approved",
            Self::Archived => "archived",
        }
    }
}

impl std::fmt::Display for BeoStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BeoStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(Self::New),
            "selected" => Ok(Self::Selected),
            "ready_for_annotation" => Ok(Self::ReadyForAnnotation),
            "annotated" => Ok(Self::Annotated),
            "approved" => Ok(Self::Approved),
            "archived" => Ok(Self::Archived),
            _ => Err(format!("Invalid BEO status: {}", s)),
        }
    }
}

/// Whether an upload is the main daily packet or a late addition to it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum FileType {
    Daily,
    Addition,
}

impl FileType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Daily => "daily",
            Self::Addition => "addition",
        }
    }
}

impl std::fmt::Display for FileType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FileType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "daily" => Ok(Self::Daily),
            "addition" => Ok(Self::Addition),
            _ => Err(format!("Invalid file type: {}", s)),
        }
    }
}

/// One page of a BEO. `page_index` orders pages within the BEO;
/// `original_order` remembers where the page sat in the source PDF.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BeoPage {
    pub id: i64,
    pub beo_id: i64,
    pub page_index: i64,
    pub original_order: i64,
    pub thumbnail_path: Option<String>,
    pub high_res_path: Option<String>,
    pub created_at: String,
}

/// Canvas annotation state for one page, stored as opaque JSON from the
/// drawing library.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Annotation {
    pub id: i64,
    pub beo_id: i64,
    pub page_index: i64,
    pub canvas_data: serde_json::Value,
    pub created_at: String,
    pub updated_at: String,
}

// API view types

/// Card-sized BEO summary for the calendar board.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BeoSummary {
    pub session_id: String,
    pub filename: String,
    /// Falls back to the first 7 characters of the session id when no
    /// BEO number has been assigned yet.
    pub beo_number: String,
    pub event_date: Option<chrono::NaiveDate>,
    pub order_position: i64,
    pub status: BeoStatus,
    pub total_pages: i64,
    pub annotation_count: i64,
    /// Inline base64 JPEG of the first page, when available.
    pub thumbnail: Option<String>,
    pub created_at: String,
}

/// All BEOs of one ISO week, as one column per day, Monday through Sunday.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeekView {
    pub year: i32,
    pub week_number: u32,
    pub week_start: chrono::NaiveDate,
    pub week_end: chrono::NaiveDate,
    pub days: Vec<DayColumn>,
}

/// One day column of the weekly board.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DayColumn {
    pub day: String,
    pub date: chrono::NaiveDate,
    pub beos: Vec<BeoSummary>,
}

/// All BEOs of a single day, ordered by board position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DayView {
    pub date: chrono::NaiveDate,
    pub beos: Vec<BeoSummary>,
}

/// Upload response: session handle plus inline thumbnails for page review.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionResponse {
    pub session_id: String,
    pub filename: String,
    pub total_pages: i64,
    /// Base64-encoded JPEG thumbnails, one per page in original order.
    pub pages: Vec<String>,
    pub event_date: Option<chrono::NaiveDate>,
    pub file_type: FileType,
}
