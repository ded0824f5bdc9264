use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{Datelike, NaiveDate};
use rusqlite::{Connection, params};

use crate::models::*;

/// Async-safe handle to the workflow database.
///
/// Wraps `WorkflowDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, preventing synchronous
/// SQLite I/O from tying up async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<WorkflowDb>>,
}

impl DbHandle {
    pub fn new(db: WorkflowDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&WorkflowDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }
}

/// Fields needed to insert a BEO row. Calendar fields (day of week, week
/// number, year) are derived from `event_date` at insert time.
pub struct NewBeo {
    pub session_id: String,
    pub filename: String,
    pub beo_number: Option<String>,
    pub event_date: Option<NaiveDate>,
    pub order_position: i64,
    pub status: BeoStatus,
    pub file_type: FileType,
    pub total_pages: i64,
}

pub struct WorkflowDb {
    conn: Connection,
}

impl WorkflowDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS beos (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    session_id TEXT NOT NULL UNIQUE,
                    filename TEXT NOT NULL,
                    event_date TEXT,
                    day_of_week TEXT,
                    week_number INTEGER,
                    year INTEGER,
                    order_position INTEGER NOT NULL DEFAULT 0,
                    status TEXT NOT NULL DEFAULT 'new',
                    is_active INTEGER NOT NULL DEFAULT 1,
                    total_pages INTEGER NOT NULL,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS beo_pages (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    beo_id INTEGER NOT NULL REFERENCES beos(id) ON DELETE CASCADE,
                    page_index INTEGER NOT NULL,
                    original_order INTEGER NOT NULL,
                    thumbnail_path TEXT,
                    high_res_path TEXT,
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS annotations (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    beo_id INTEGER NOT NULL REFERENCES beos(id) ON DELETE CASCADE,
                    page_index INTEGER NOT NULL,
                    canvas_data TEXT NOT NULL,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    updated_at TEXT NOT NULL DEFAULT (datetime('now')),
                    UNIQUE(beo_id, page_index)
                );

                CREATE INDEX IF NOT EXISTS idx_beos_session ON beos(session_id);
                CREATE INDEX IF NOT EXISTS idx_beos_event_date ON beos(event_date);
                CREATE INDEX IF NOT EXISTS idx_beo_pages_beo ON beo_pages(beo_id);
                CREATE INDEX IF NOT EXISTS idx_annotations_beo ON annotations(beo_id);
                ",
            )
            .context("Failed to create tables")?;

        // Additive migrations (columns are nullable or defaulted, safe to
        // re-run). Only "duplicate column" errors are ignored.
        match self
            .conn
            .execute("ALTER TABLE beos ADD COLUMN beo_number TEXT", [])
        {
            Ok(_) => {}
            Err(e) if e.to_string().contains("duplicate column") => {}
            Err(e) => return Err(anyhow::anyhow!("Failed to add beo_number column: {}", e)),
        }
        self.conn
            .execute_batch("CREATE INDEX IF NOT EXISTS idx_beos_beo_number ON beos(beo_number);")
            .context("Failed to create beo_number index")?;

        match self.conn.execute(
            "ALTER TABLE beos ADD COLUMN file_type TEXT NOT NULL DEFAULT 'daily'",
            [],
        ) {
            Ok(_) => {}
            Err(e) if e.to_string().contains("duplicate column") => {}
            Err(e) => return Err(anyhow::anyhow!("Failed to add file_type column: {}", e)),
        }

        Ok(())
    }

    // ── BEO CRUD ──────────────────────────────────────────────────────

    pub fn create_beo(&self, new: &NewBeo) -> Result<Beo> {
        let (day_of_week, week_number, year) = calendar_parts(new.event_date);
        self.conn
            .execute(
                "INSERT INTO beos (session_id, filename, beo_number, event_date, day_of_week,
                                   week_number, year, order_position, status, file_type, total_pages)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    new.session_id,
                    new.filename,
                    new.beo_number,
                    new.event_date.map(|d| d.to_string()),
                    day_of_week,
                    week_number,
                    year,
                    new.order_position,
                    new.status.as_str(),
                    new.file_type.as_str(),
                    new.total_pages,
                ],
            )
            .context("Failed to insert BEO")?;
        self.get_beo(&new.session_id)?
            .context("BEO not found after insert")
    }

    pub fn get_beo(&self, session_id: &str) -> Result<Option<Beo>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {BEO_COLUMNS} FROM beos WHERE session_id = ?1"
            ))
            .context("Failed to prepare get_beo")?;
        let mut rows = stmt
            .query_map(params![session_id], beo_row)
            .context("Failed to query BEO")?;
        match rows.next() {
            Some(row) => Ok(Some(row.context("Failed to read BEO row")?.into_beo()?)),
            None => Ok(None),
        }
    }

    pub fn list_beos(&self) -> Result<Vec<Beo>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {BEO_COLUMNS} FROM beos ORDER BY created_at DESC, id DESC"
            ))
            .context("Failed to prepare list_beos")?;
        let rows = stmt
            .query_map([], beo_row)
            .context("Failed to query BEOs")?;
        collect_beos(rows)
    }

    /// Active BEOs whose event date falls in the given inclusive range,
    /// ordered by date then board position.
    pub fn beos_in_date_range(&self, start: NaiveDate, end: NaiveDate) -> Result<Vec<Beo>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {BEO_COLUMNS} FROM beos
                 WHERE event_date >= ?1 AND event_date <= ?2 AND is_active = 1
                 ORDER BY event_date, order_position"
            ))
            .context("Failed to prepare beos_in_date_range")?;
        let rows = stmt
            .query_map(params![start.to_string(), end.to_string()], beo_row)
            .context("Failed to query BEOs by date range")?;
        collect_beos(rows)
    }

    pub fn beos_for_day(&self, date: NaiveDate) -> Result<Vec<Beo>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {BEO_COLUMNS} FROM beos
                 WHERE event_date = ?1 AND is_active = 1
                 ORDER BY order_position"
            ))
            .context("Failed to prepare beos_for_day")?;
        let rows = stmt
            .query_map(params![date.to_string()], beo_row)
            .context("Failed to query BEOs by day")?;
        collect_beos(rows)
    }

    /// Update the user-editable metadata of a BEO. `None` fields are left
    /// untouched. Setting the event date re-derives the calendar fields.
    pub fn update_metadata(
        &self,
        session_id: &str,
        beo_number: Option<&str>,
        event_date: Option<NaiveDate>,
        order_position: Option<i64>,
    ) -> Result<Beo> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;

        if let Some(n) = beo_number {
            tx.execute(
                "UPDATE beos SET beo_number = ?1, updated_at = datetime('now') WHERE session_id = ?2",
                params![n, session_id],
            )
            .context("Failed to update beo_number")?;
        }
        if let Some(date) = event_date {
            let (day_of_week, week_number, year) = calendar_parts(Some(date));
            tx.execute(
                "UPDATE beos SET event_date = ?1, day_of_week = ?2, week_number = ?3, year = ?4,
                                 updated_at = datetime('now')
                 WHERE session_id = ?5",
                params![date.to_string(), day_of_week, week_number, year, session_id],
            )
            .context("Failed to update event_date")?;
        }
        if let Some(pos) = order_position {
            tx.execute(
                "UPDATE beos SET order_position = ?1, updated_at = datetime('now') WHERE session_id = ?2",
                params![pos, session_id],
            )
            .context("Failed to update order_position")?;
        }

        tx.commit().context("Failed to commit metadata update")?;
        self.get_beo(session_id)?
            .context("BEO not found after metadata update")
    }

    /// Move a BEO to a (possibly different) day at the given board
    /// position, shifting the other BEOs of that day to make room.
    pub fn reorder_beo(
        &self,
        session_id: &str,
        event_date: NaiveDate,
        order_position: i64,
    ) -> Result<Beo> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;

        let (day_of_week, week_number, year) = calendar_parts(Some(event_date));
        let updated = tx
            .execute(
                "UPDATE beos SET event_date = ?1, day_of_week = ?2, week_number = ?3, year = ?4,
                                 order_position = ?5, updated_at = datetime('now')
                 WHERE session_id = ?6",
                params![
                    event_date.to_string(),
                    day_of_week,
                    week_number,
                    year,
                    order_position,
                    session_id
                ],
            )
            .context("Failed to move BEO")?;
        if updated == 0 {
            anyhow::bail!("BEO {} not found", session_id);
        }

        // Re-pack the rest of the day around the moved BEO.
        let mut stmt = tx
            .prepare(
                "SELECT session_id FROM beos
                 WHERE event_date = ?1 AND session_id != ?2 AND is_active = 1
                 ORDER BY order_position",
            )
            .context("Failed to prepare same-day query")?;
        let others: Vec<String> = stmt
            .query_map(params![event_date.to_string(), session_id], |row| {
                row.get(0)
            })
            .context("Failed to query same-day BEOs")?
            .collect::<rusqlite::Result<_>>()
            .context("Failed to read same-day rows")?;
        drop(stmt);

        for (idx, other) in others.iter().enumerate() {
            let pos = if idx as i64 >= order_position {
                idx as i64 + 1
            } else {
                idx as i64
            };
            tx.execute(
                "UPDATE beos SET order_position = ?1 WHERE session_id = ?2",
                params![pos, other],
            )
            .context("Failed to shift same-day BEO")?;
        }

        tx.commit().context("Failed to commit reorder")?;
        self.get_beo(session_id)?
            .context("BEO not found after reorder")
    }

    /// Next free board position for a day (0 when the day is empty).
    pub fn next_position_for_day(&self, date: NaiveDate) -> Result<i64> {
        let max_pos: i64 = self
            .conn
            .query_row(
                "SELECT COALESCE(MAX(order_position), -1) FROM beos
                 WHERE event_date = ?1 AND is_active = 1",
                params![date.to_string()],
                |row| row.get(0),
            )
            .context("Failed to get max position")?;
        Ok(max_pos + 1)
    }

    pub fn set_status(&self, session_id: &str, status: &BeoStatus) -> Result<()> {
        let updated = self
            .conn
            .execute(
                "UPDATE beos SET status = ?1, updated_at = datetime('now') WHERE session_id = ?2",
                params![status.as_str(), session_id],
            )
            .context("Failed to update status")?;
        if updated == 0 {
            anyhow::bail!("BEO {} not found", session_id);
        }
        Ok(())
    }

    /// Delete a BEO and all its pages and annotations. Returns whether a
    /// row was actually removed.
    pub fn delete_beo(&self, session_id: &str) -> Result<bool> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        let id: Option<i64> = tx
            .query_row(
                "SELECT id FROM beos WHERE session_id = ?1",
                params![session_id],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })
            .context("Failed to look up BEO for delete")?;

        let Some(id) = id else {
            return Ok(false);
        };

        // Cascades cover these, but explicit deletes keep the intent clear
        // even on databases opened without foreign_keys.
        tx.execute("DELETE FROM annotations WHERE beo_id = ?1", params![id])
            .context("Failed to delete annotations")?;
        tx.execute("DELETE FROM beo_pages WHERE beo_id = ?1", params![id])
            .context("Failed to delete pages")?;
        tx.execute("DELETE FROM beos WHERE id = ?1", params![id])
            .context("Failed to delete BEO")?;
        tx.commit().context("Failed to commit delete")?;
        Ok(true)
    }

    // ── Pages ─────────────────────────────────────────────────────────

    pub fn create_page(
        &self,
        beo_id: i64,
        page_index: i64,
        original_order: i64,
        thumbnail_path: Option<&str>,
        high_res_path: Option<&str>,
    ) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO beo_pages (beo_id, page_index, original_order, thumbnail_path, high_res_path)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![beo_id, page_index, original_order, thumbnail_path, high_res_path],
            )
            .context("Failed to insert page")?;
        Ok(())
    }

    pub fn pages_for_beo(&self, beo_id: i64) -> Result<Vec<BeoPage>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, beo_id, page_index, original_order, thumbnail_path, high_res_path, created_at
                 FROM beo_pages WHERE beo_id = ?1 ORDER BY page_index",
            )
            .context("Failed to prepare pages_for_beo")?;
        let rows = stmt
            .query_map(params![beo_id], |row| {
                Ok(BeoPage {
                    id: row.get(0)?,
                    beo_id: row.get(1)?,
                    page_index: row.get(2)?,
                    original_order: row.get(3)?,
                    thumbnail_path: row.get(4)?,
                    high_res_path: row.get(5)?,
                    created_at: row.get(6)?,
                })
            })
            .context("Failed to query pages")?;
        let mut pages = Vec::new();
        for row in rows {
            pages.push(row.context("Failed to read page row")?);
        }
        Ok(pages)
    }

    pub fn set_high_res_path(&self, beo_id: i64, page_index: i64, path: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE beo_pages SET high_res_path = ?1 WHERE beo_id = ?2 AND page_index = ?3",
                params![path, beo_id, page_index],
            )
            .context("Failed to set high-res path")?;
        Ok(())
    }

    // ── Annotations ───────────────────────────────────────────────────

    /// Insert or replace the canvas state for one page.
    pub fn upsert_annotation(
        &self,
        beo_id: i64,
        page_index: i64,
        canvas_data: &serde_json::Value,
    ) -> Result<()> {
        let data = serde_json::to_string(canvas_data).context("Failed to encode canvas data")?;
        self.conn
            .execute(
                "INSERT INTO annotations (beo_id, page_index, canvas_data) VALUES (?1, ?2, ?3)
                 ON CONFLICT(beo_id, page_index)
                 DO UPDATE SET canvas_data = excluded.canvas_data, updated_at = datetime('now')",
                params![beo_id, page_index, data],
            )
            .context("Failed to upsert annotation")?;
        Ok(())
    }

    pub fn annotations_for_beo(&self, beo_id: i64) -> Result<Vec<Annotation>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, beo_id, page_index, canvas_data, created_at, updated_at
                 FROM annotations WHERE beo_id = ?1 ORDER BY page_index",
            )
            .context("Failed to prepare annotations_for_beo")?;
        let rows = stmt
            .query_map(params![beo_id], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })
            .context("Failed to query annotations")?;
        let mut annotations = Vec::new();
        for row in rows {
            let (id, beo_id, page_index, data, created_at, updated_at) =
                row.context("Failed to read annotation row")?;
            annotations.push(Annotation {
                id,
                beo_id,
                page_index,
                canvas_data: serde_json::from_str(&data)
                    .with_context(|| format!("corrupt canvas JSON for annotation {}", id))?,
                created_at,
                updated_at,
            });
        }
        Ok(annotations)
    }

    pub fn annotation_count(&self, beo_id: i64) -> Result<i64> {
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM annotations WHERE beo_id = ?1",
                params![beo_id],
                |row| row.get(0),
            )
            .context("Failed to count annotations")
    }
}

const BEO_COLUMNS: &str = "id, session_id, filename, beo_number, event_date, day_of_week, \
                           week_number, year, order_position, status, file_type, is_active, \
                           total_pages, created_at, updated_at";

/// Raw row before enum/date parsing.
struct BeoRow {
    id: i64,
    session_id: String,
    filename: String,
    beo_number: Option<String>,
    event_date: Option<String>,
    day_of_week: Option<String>,
    week_number: Option<u32>,
    year: Option<i32>,
    order_position: i64,
    status: String,
    file_type: String,
    is_active: i64,
    total_pages: i64,
    created_at: String,
    updated_at: String,
}

impl BeoRow {
    fn into_beo(self) -> Result<Beo> {
        let event_date = match self.event_date {
            Some(s) => Some(
                NaiveDate::from_str(&s)
                    .map_err(|_| anyhow::anyhow!("invalid event_date in database: '{}'", s))?,
            ),
            None => None,
        };
        Ok(Beo {
            id: self.id,
            session_id: self.session_id,
            filename: self.filename,
            beo_number: self.beo_number,
            event_date,
            day_of_week: self.day_of_week,
            week_number: self.week_number,
            year: self.year,
            order_position: self.order_position,
            status: self
                .status
                .parse()
                .map_err(|_| anyhow::anyhow!("invalid status in database: '{}'", self.status))?,
            file_type: self.file_type.parse().map_err(|_| {
                anyhow::anyhow!("invalid file_type in database: '{}'", self.file_type)
            })?,
            is_active: self.is_active != 0,
            total_pages: self.total_pages,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

fn beo_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<BeoRow> {
    Ok(BeoRow {
        id: row.get(0)?,
        session_id: row.get(1)?,
        filename: row.get(2)?,
        beo_number: row.get(3)?,
        event_date: row.get(4)?,
        day_of_week: row.get(5)?,
        week_number: row.get(6)?,
        year: row.get(7)?,
        order_position: row.get(8)?,
        status: row.get(9)?,
        file_type: row.get(10)?,
        is_active: row.get(11)?,
        total_pages: row.get(12)?,
        created_at: row.get(13)?,
        updated_at: row.get(14)?,
    })
}

fn collect_beos(
    rows: impl Iterator<Item = rusqlite::Result<BeoRow>>,
) -> Result<Vec<Beo>> {
    let mut beos = Vec::new();
    for row in rows {
        beos.push(row.context("Failed to read BEO row")?.into_beo()?);
    }
    Ok(beos)
}

/// Derive (day of week, ISO week number, year) from an event date.
pub fn calendar_parts(date: Option<NaiveDate>) -> (Option<String>, Option<u32>, Option<i32>) {
    match date {
        Some(d) => (
            Some(d.format("%A").to_string()),
            Some(d.iso_week().week()),
            Some(d.year()),
        ),
        None => (None, None, None),
    }
}
