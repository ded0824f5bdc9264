//! Review session state machine.
//!
//! A review session walks a user through every page of an uploaded packet
//! exactly once, front to back. At each page the user either keeps it
//! (splitting it out as a new record draft) or discards it, with a
//! one-step undo via `back()`. Once every page is decided the session is
//! finalized: each draft is handed to a [`RecordSink`] in creation order
//! and the source upload is discarded best-effort.
//!
//! The session owns no I/O of its own; persistence is behind the
//! `RecordSink` seam so the walk is unit-testable without a database or
//! an HTTP harness.

use async_trait::async_trait;

use crate::errors::ReviewError;

/// One record draft accumulated during a review pass.
///
/// Drafts are ephemeral: they exist only for the lifetime of the pass and
/// are converted into persisted records on finalize.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct RecordDraft {
    /// Display label, auto-generated as `"Record {n}"` (1-based).
    pub label: String,
    /// Page indices of the source document assigned to this draft.
    pub pages: Vec<usize>,
    /// Zero-based position among all drafts of this pass.
    pub order_position: usize,
}

/// Persistence seam for finalize.
///
/// Real implementation: the BEO store (database + image storage). Test
/// double: `MockSink` below. `create_record` is not exactly-once across a
/// finalize retry — a failed attempt leaves already-created records in
/// place and the caller retries the whole batch.
#[async_trait]
pub trait RecordSink: Send + Sync {
    /// Persist one record; returns the identifier of the created record.
    async fn create_record(
        &self,
        label: &str,
        pages: &[usize],
        order_position: usize,
    ) -> anyhow::Result<String>;

    /// Remove the source upload. Best-effort; failures do not undo a
    /// successful finalize.
    async fn discard_source(&self) -> anyhow::Result<()>;
}

/// Outcome of a `keep()` or `discard()` decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// The cursor moved to the next page.
    Advanced,
    /// The last page has been decided; the session is ready to finalize.
    ReadyToFinalize,
}

/// Linear walk over the pages of one uploaded document.
///
/// Internally the cursor ranges over `[0, total_pages]`, where
/// `total_pages` means "every page decided, awaiting finalize". The
/// user-facing page is [`ReviewSession::current_page`], which stays at
/// the last page in that state so a failed finalize leaves the user
/// where they were.
#[derive(Debug)]
pub struct ReviewSession {
    total_pages: usize,
    cursor: usize,
    records: Vec<RecordDraft>,
    completed: bool,
}

impl ReviewSession {
    /// Start a review pass over a document with `total_pages` pages.
    pub fn new(total_pages: usize) -> Result<Self, ReviewError> {
        if total_pages == 0 {
            return Err(ReviewError::EmptyDocument);
        }
        Ok(Self {
            total_pages,
            cursor: 0,
            records: Vec::new(),
            completed: false,
        })
    }

    pub fn total_pages(&self) -> usize {
        self.total_pages
    }

    /// The page currently being decided (or re-shown after a failed
    /// finalize, in which case it is the last page).
    pub fn current_page(&self) -> usize {
        self.cursor.min(self.total_pages - 1)
    }

    /// True once every page has a decision and finalize may be attempted.
    pub fn ready_to_finalize(&self) -> bool {
        !self.completed && self.cursor == self.total_pages
    }

    /// True after a successful finalize; the session accepts no further
    /// operations and its owner should drop it.
    pub fn is_completed(&self) -> bool {
        self.completed
    }

    pub fn records(&self) -> &[RecordDraft] {
        &self.records
    }

    fn check_deciding(&self) -> Result<(), ReviewError> {
        if self.completed {
            return Err(ReviewError::SessionCompleted);
        }
        if self.cursor >= self.total_pages {
            return Err(ReviewError::AllPagesDecided);
        }
        Ok(())
    }

    /// Keep the current page: split it out as a new single-page draft,
    /// then advance.
    pub fn keep(&mut self) -> Result<StepOutcome, ReviewError> {
        self.check_deciding()?;
        let order_position = self.records.len();
        self.records.push(RecordDraft {
            label: format!("Record {}", order_position + 1),
            pages: vec![self.cursor],
            order_position,
        });
        self.cursor += 1;
        Ok(self.step_outcome())
    }

    /// Discard the current page and advance. No draft is created.
    pub fn discard(&mut self) -> Result<StepOutcome, ReviewError> {
        self.check_deciding()?;
        self.cursor += 1;
        Ok(self.step_outcome())
    }

    fn step_outcome(&self) -> StepOutcome {
        if self.cursor == self.total_pages {
            StepOutcome::ReadyToFinalize
        } else {
            StepOutcome::Advanced
        }
    }

    /// Step back one page, reversing the most recent decision's effect on
    /// the draft set.
    ///
    /// Only a `keep()` leaves something to reverse: if the page we return
    /// to sits in the most recent draft, it is pulled out (and the draft
    /// dropped once empty). After a `discard()` this just moves the
    /// cursor. Checking only the last draft is sufficient under the
    /// strictly linear walk — each keep matches the cursor at creation
    /// time and the cursor only ever steps back past the newest draft.
    pub fn back(&mut self) -> Result<(), ReviewError> {
        if self.completed {
            return Err(ReviewError::SessionCompleted);
        }
        if self.cursor == 0 {
            return Err(ReviewError::AtFirstPage);
        }
        self.cursor -= 1;
        if let Some(last) = self.records.last_mut() {
            if let Some(pos) = last.pages.iter().position(|&p| p == self.cursor) {
                last.pages.remove(pos);
                if last.pages.is_empty() {
                    self.records.pop();
                }
            }
        }
        Ok(())
    }

    /// Persist every draft through `sink` in creation order, then discard
    /// the source upload.
    ///
    /// Not atomic: on the first `create_record` failure no further calls
    /// are issued, already-created records stay persisted, and the
    /// session returns to reviewing at the last page so the caller may
    /// retry without re-deciding pages. A `discard_source` failure is
    /// logged and swallowed — the finalize still counts as successful.
    pub async fn finalize(&mut self, sink: &dyn RecordSink) -> Result<Vec<String>, ReviewError> {
        if self.completed {
            return Err(ReviewError::SessionCompleted);
        }
        if self.cursor < self.total_pages {
            return Err(ReviewError::ReviewIncomplete);
        }
        if self.records.is_empty() {
            return Err(ReviewError::NoPagesKept);
        }

        let mut created = Vec::with_capacity(self.records.len());
        for draft in &self.records {
            match sink
                .create_record(&draft.label, &draft.pages, draft.order_position)
                .await
            {
                Ok(id) => created.push(id),
                Err(source) => {
                    tracing::warn!(
                        label = %draft.label,
                        created = created.len(),
                        "record creation failed, aborting finalize"
                    );
                    return Err(ReviewError::CreateRecord {
                        label: draft.label.clone(),
                        source,
                    });
                }
            }
        }

        if let Err(e) = sink.discard_source().await {
            tracing::warn!(error = %e, "failed to discard source document, leaving it in place");
        }

        self.completed = true;
        Ok(created)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Records every sink call; optionally fails the n-th create (1-based).
    struct MockSink {
        creates: Mutex<Vec<(String, Vec<usize>, usize)>>,
        discards: Mutex<usize>,
        fail_create_at: Option<usize>,
    }

    impl MockSink {
        fn new() -> Self {
            Self {
                creates: Mutex::new(Vec::new()),
                discards: Mutex::new(0),
                fail_create_at: None,
            }
        }

        fn failing_at(n: usize) -> Self {
            Self {
                fail_create_at: Some(n),
                ..Self::new()
            }
        }

        fn create_calls(&self) -> Vec<(String, Vec<usize>, usize)> {
            self.creates.lock().unwrap().clone()
        }

        fn discard_calls(&self) -> usize {
            *self.discards.lock().unwrap()
        }
    }

    #[async_trait]
    impl RecordSink for MockSink {
        async fn create_record(
            &self,
            label: &str,
            pages: &[usize],
            order_position: usize,
        ) -> anyhow::Result<String> {
            let mut calls = self.creates.lock().unwrap();
            if self.fail_create_at == Some(calls.len() + 1) {
                anyhow::bail!("injected create failure");
            }
            calls.push((label.to_string(), pages.to_vec(), order_position));
            Ok(format!("rec-{}", calls.len()))
        }

        async fn discard_source(&self) -> anyhow::Result<()> {
            *self.discards.lock().unwrap() += 1;
            Ok(())
        }
    }

    /// Discard-source always fails; creates succeed.
    struct BrokenDiscardSink(MockSink);

    #[async_trait]
    impl RecordSink for BrokenDiscardSink {
        async fn create_record(
            &self,
            label: &str,
            pages: &[usize],
            order_position: usize,
        ) -> anyhow::Result<String> {
            self.0.create_record(label, pages, order_position).await
        }

        async fn discard_source(&self) -> anyhow::Result<()> {
            anyhow::bail!("source store unavailable")
        }
    }

    #[test]
    fn zero_pages_is_rejected() {
        assert!(matches!(
            ReviewSession::new(0),
            Err(ReviewError::EmptyDocument)
        ));
    }

    #[test]
    fn keep_every_page_creates_one_record_per_page() {
        for total in 1..=5 {
            let mut session = ReviewSession::new(total).unwrap();
            for i in 0..total {
                let outcome = session.keep().unwrap();
                if i == total - 1 {
                    assert_eq!(outcome, StepOutcome::ReadyToFinalize);
                } else {
                    assert_eq!(outcome, StepOutcome::Advanced);
                }
            }
            assert_eq!(session.records().len(), total);
            for (i, draft) in session.records().iter().enumerate() {
                assert_eq!(draft.label, format!("Record {}", i + 1));
                assert_eq!(draft.pages, vec![i]);
                assert_eq!(draft.order_position, i);
            }
        }
    }

    #[test]
    fn discard_everything_leaves_no_records() {
        let mut session = ReviewSession::new(4).unwrap();
        for _ in 0..4 {
            session.discard().unwrap();
        }
        assert!(session.records().is_empty());
        assert!(session.ready_to_finalize());
        assert_eq!(session.current_page(), 3);
    }

    #[test]
    fn back_after_keep_restores_previous_state() {
        let mut session = ReviewSession::new(5).unwrap();
        session.keep().unwrap();
        session.discard().unwrap();

        let records_before = session.records().to_vec();
        let page_before = session.current_page();
        session.keep().unwrap();
        session.back().unwrap();

        assert_eq!(session.records(), records_before.as_slice());
        assert_eq!(session.current_page(), page_before);
    }

    #[test]
    fn back_after_discard_only_moves_cursor() {
        let mut session = ReviewSession::new(3).unwrap();
        session.keep().unwrap();
        session.discard().unwrap();
        let records_before = session.records().to_vec();

        session.back().unwrap();

        assert_eq!(session.current_page(), 1);
        assert_eq!(session.records(), records_before.as_slice());
    }

    #[test]
    fn back_at_first_page_is_rejected() {
        let mut session = ReviewSession::new(2).unwrap();
        assert!(matches!(session.back(), Err(ReviewError::AtFirstPage)));
    }

    #[test]
    fn back_from_ready_to_finalize_undoes_last_keep() {
        let mut session = ReviewSession::new(2).unwrap();
        session.keep().unwrap();
        session.keep().unwrap();
        assert!(session.ready_to_finalize());

        session.back().unwrap();

        assert!(!session.ready_to_finalize());
        assert_eq!(session.current_page(), 1);
        assert_eq!(session.records().len(), 1);
        assert_eq!(session.records()[0].pages, vec![0]);
    }

    #[test]
    fn decisions_after_last_page_are_rejected() {
        let mut session = ReviewSession::new(1).unwrap();
        session.keep().unwrap();
        assert!(matches!(session.keep(), Err(ReviewError::AllPagesDecided)));
        assert!(matches!(
            session.discard(),
            Err(ReviewError::AllPagesDecided)
        ));
    }

    #[tokio::test]
    async fn finalize_before_last_decision_is_rejected() {
        let mut session = ReviewSession::new(3).unwrap();
        session.keep().unwrap();
        let sink = MockSink::new();
        assert!(matches!(
            session.finalize(&sink).await,
            Err(ReviewError::ReviewIncomplete)
        ));
        assert!(sink.create_calls().is_empty());
    }

    #[tokio::test]
    async fn finalize_with_no_records_fails_validation() {
        let mut session = ReviewSession::new(1).unwrap();
        session.discard().unwrap();

        let sink = MockSink::new();
        assert!(matches!(
            session.finalize(&sink).await,
            Err(ReviewError::NoPagesKept)
        ));
        assert!(sink.create_calls().is_empty());
        assert_eq!(sink.discard_calls(), 0);
        assert!(!session.is_completed());
        assert_eq!(session.current_page(), 0);
        // The session stays interactive: back() is still accepted.
        session.back().unwrap();
        assert_eq!(session.current_page(), 0);
    }

    #[tokio::test]
    async fn keep_discard_keep_finalizes_two_records_in_order() {
        let mut session = ReviewSession::new(3).unwrap();
        session.keep().unwrap();
        session.discard().unwrap();
        assert_eq!(session.keep().unwrap(), StepOutcome::ReadyToFinalize);

        let sink = MockSink::new();
        let ids = session.finalize(&sink).await.unwrap();

        assert_eq!(ids, vec!["rec-1".to_string(), "rec-2".to_string()]);
        assert_eq!(
            sink.create_calls(),
            vec![
                ("Record 1".to_string(), vec![0], 0),
                ("Record 2".to_string(), vec![2], 1),
            ]
        );
        assert_eq!(sink.discard_calls(), 1);
        assert!(session.is_completed());
    }

    #[tokio::test]
    async fn finalize_aborts_on_first_create_failure() {
        let mut session = ReviewSession::new(3).unwrap();
        session.keep().unwrap();
        session.keep().unwrap();
        session.keep().unwrap();

        // Fail the second of three creates: exactly one call got through.
        let sink = MockSink::failing_at(2);
        let err = session.finalize(&sink).await.unwrap_err();
        match err {
            ReviewError::CreateRecord { label, .. } => assert_eq!(label, "Record 2"),
            other => panic!("Expected CreateRecord, got {other:?}"),
        }
        assert_eq!(sink.create_calls().len(), 1);
        assert_eq!(sink.discard_calls(), 0);

        // Drafts are untouched and the session may retry as-is.
        assert!(!session.is_completed());
        assert_eq!(session.records().len(), 3);
        assert_eq!(session.current_page(), 2);
        assert!(session.ready_to_finalize());
    }

    #[tokio::test]
    async fn failed_finalize_can_be_retried() {
        let mut session = ReviewSession::new(2).unwrap();
        session.keep().unwrap();
        session.keep().unwrap();

        let broken = MockSink::failing_at(1);
        assert!(session.finalize(&broken).await.is_err());
        assert_eq!(session.current_page(), 1);

        let sink = MockSink::new();
        let ids = session.finalize(&sink).await.unwrap();
        assert_eq!(ids.len(), 2);
        assert!(session.is_completed());
    }

    #[tokio::test]
    async fn discard_source_failure_does_not_fail_finalize() {
        let mut session = ReviewSession::new(1).unwrap();
        session.keep().unwrap();

        let sink = BrokenDiscardSink(MockSink::new());
        let ids = session.finalize(&sink).await.unwrap();
        assert_eq!(ids.len(), 1);
        assert!(session.is_completed());
    }

    #[tokio::test]
    async fn completed_session_rejects_everything() {
        let mut session = ReviewSession::new(1).unwrap();
        session.keep().unwrap();
        session.finalize(&MockSink::new()).await.unwrap();

        assert!(matches!(session.keep(), Err(ReviewError::SessionCompleted)));
        assert!(matches!(session.back(), Err(ReviewError::SessionCompleted)));
        assert!(matches!(
            session.finalize(&MockSink::new()).await,
            Err(ReviewError::SessionCompleted)
        ));
    }

    #[test]
    fn page_indices_across_drafts_are_disjoint() {
        let mut session = ReviewSession::new(6).unwrap();
        session.keep().unwrap();
        session.discard().unwrap();
        session.keep().unwrap();
        session.back().unwrap();
        session.keep().unwrap();
        session.keep().unwrap();

        let mut seen = std::collections::HashSet::new();
        for draft in session.records() {
            assert!(!draft.pages.is_empty());
            for &p in &draft.pages {
                assert!(seen.insert(p), "page {p} assigned twice");
            }
        }
        // Order positions form a gapless ascending sequence.
        for (i, draft) in session.records().iter().enumerate() {
            assert_eq!(draft.order_position, i);
        }
    }
}
