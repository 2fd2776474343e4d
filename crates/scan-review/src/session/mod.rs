use std::panic::AssertUnwindSafe;

use chrono::{DateTime, Duration, Utc};
use futures::{future::BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::{
    error::{Error, Result},
    models::{SessionRecord, SeverityCounts},
    review::{BulkOutcome, Reviewer, Transition},
    store::{self, Store},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeChoice {
    Resume,
    Restart,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionCounters {
    /// Opened and left without marking complete.
    pub reviewed: u32,
    pub completed: u32,
    pub skipped: u32,
    /// Completions undone during the session.
    pub reverted: u32,
}

impl SessionCounters {
    pub fn processed(&self) -> u32 {
        self.reviewed + self.completed + self.skipped
    }

    fn from_record(record: &SessionRecord) -> Self {
        let clamp = |v: i64| u32::try_from(v).unwrap_or(0);
        Self {
            reviewed: clamp(record.reviewed_count),
            completed: clamp(record.completed_count),
            skipped: clamp(record.skipped_count),
            reverted: clamp(record.reverted_count),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub scan_id: i64,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_secs: i64,
    pub counters: SessionCounters,
    pub completed_by_severity: SeverityCounts,
}

pub struct ReviewSession {
    scan_id: i64,
    session_id: i64,
    started_at: DateTime<Utc>,
    resumed: bool,
    pub counters: SessionCounters,
    reviewer: Reviewer,
}

impl ReviewSession {
    pub fn scan_id(&self) -> i64 {
        self.scan_id
    }

    pub fn session_id(&self) -> i64 {
        self.session_id
    }

    /// Start of the session as first opened, also after a resume.
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn is_resumed(&self) -> bool {
        self.resumed
    }

    pub fn elapsed_at(&self, now: DateTime<Utc>) -> Duration {
        (now - self.started_at).max(Duration::zero())
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed_at(Utc::now())
    }

    pub fn record_reviewed(&mut self) {
        self.counters.reviewed += 1;
    }

    pub fn record_skipped(&mut self) {
        self.counters.skipped += 1;
    }

    pub async fn mark_complete(&mut self, finding_id: i64) -> Result<Transition> {
        let transition = self.reviewer.mark_complete(finding_id).await?;
        if transition.is_applied() {
            self.counters.completed += 1;
        }
        Ok(transition)
    }

    pub async fn undo_complete(&mut self, finding_id: i64) -> Result<Transition> {
        let transition = self.reviewer.undo_complete(finding_id).await?;
        if transition.is_applied() {
            self.counters.completed = self.counters.completed.saturating_sub(1);
            self.counters.reverted += 1;
        }
        Ok(transition)
    }

    pub async fn bulk_mark_complete<C>(&mut self, finding_ids: &[i64], confirm: C) -> BulkOutcome
    where
        C: FnOnce(usize) -> bool,
    {
        let outcome = self.reviewer.bulk_mark_complete(finding_ids, confirm).await;
        if let BulkOutcome::Applied(summary) = &outcome {
            self.counters.completed += summary.marked as u32;
        }
        outcome
    }
}

#[derive(Clone)]
pub struct SessionManager {
    store: Store,
    reviewer: Reviewer,
}

impl SessionManager {
    pub fn new(store: Store) -> Self {
        let reviewer = Reviewer::new(store.clone());
        Self { store, reviewer }
    }

    /// `decide` is only asked when a session is already open.
    pub async fn start_or_resume_session<D>(&self, scan_id: i64, decide: D) -> Result<ReviewSession>
    where
        D: FnOnce(&SessionRecord) -> ResumeChoice,
    {
        self.start_or_resume_at(scan_id, Utc::now(), decide).await
    }

    pub async fn start_or_resume_at<D>(
        &self,
        scan_id: i64,
        now: DateTime<Utc>,
        decide: D,
    ) -> Result<ReviewSession>
    where
        D: FnOnce(&SessionRecord) -> ResumeChoice,
    {
        let mut tx = self.store.pool().begin().await?;
        if store::fetch_scan(&mut *tx, scan_id).await?.is_none() {
            return Err(Error::ScanNotFound { scan_id });
        }

        let (record, resumed) = match store::fetch_session(&mut *tx, scan_id).await? {
            Some(open) => match decide(&open) {
                ResumeChoice::Resume => (open, true),
                ResumeChoice::Restart => {
                    store::delete_session(&mut *tx, scan_id).await?;
                    (store::insert_session(&mut *tx, scan_id, now).await?, false)
                }
            },
            None => (store::insert_session(&mut *tx, scan_id, now).await?, false),
        };
        tx.commit().await?;

        info!(
            scan_id,
            session_id = record.session_id,
            started_at = %record.session_start,
            resumed,
            "review session opened"
        );
        Ok(ReviewSession {
            scan_id,
            session_id: record.session_id,
            started_at: record.session_start,
            resumed,
            counters: if resumed {
                SessionCounters::from_record(&record)
            } else {
                SessionCounters::default()
            },
            reviewer: self.reviewer.clone(),
        })
    }

    pub async fn checkpoint(&self, session: &ReviewSession) -> Result<()> {
        let c = session.counters;
        sqlx::query(
            "UPDATE sessions SET reviewed_count = ?, completed_count = ?, skipped_count = ?, reverted_count = ? \
             WHERE scan_id = ? AND session_id = ?",
        )
        .bind(i64::from(c.reviewed))
        .bind(i64::from(c.completed))
        .bind(i64::from(c.skipped))
        .bind(i64::from(c.reverted))
        .bind(session.scan_id)
        .bind(session.session_id)
        .execute(self.store.pool())
        .await?;
        Ok(())
    }

    /// `None` when no session was open; last-reviewed is updated either way.
    pub async fn end_session(
        &self,
        scan_id: i64,
        counters: SessionCounters,
    ) -> Result<Option<SessionSummary>> {
        self.end_session_at(scan_id, counters, Utc::now()).await
    }

    pub async fn end_session_at(
        &self,
        scan_id: i64,
        counters: SessionCounters,
        now: DateTime<Utc>,
    ) -> Result<Option<SessionSummary>> {
        let mut tx = self.store.pool().begin().await?;

        let touched = sqlx::query("UPDATE scans SET last_reviewed_at = ? WHERE scan_id = ?")
            .bind(now)
            .bind(scan_id)
            .execute(&mut *tx)
            .await?;
        if touched.rows_affected() == 0 {
            return Err(Error::ScanNotFound { scan_id });
        }

        let Some(open) = store::fetch_session(&mut *tx, scan_id).await? else {
            tx.commit().await?;
            info!(scan_id, "no open session to finalize");
            return Ok(None);
        };

        sqlx::query(
            "INSERT INTO review_history(scan_id, session_start, session_end, reviewed_count, completed_count, \
                                        skipped_count, reverted_count) \
             VALUES(?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(scan_id)
        .bind(open.session_start)
        .bind(now)
        .bind(i64::from(counters.reviewed))
        .bind(i64::from(counters.completed))
        .bind(i64::from(counters.skipped))
        .bind(i64::from(counters.reverted))
        .execute(&mut *tx)
        .await?;
        store::delete_session(&mut *tx, scan_id).await?;
        tx.commit().await?;

        let completed_by_severity = self.store.completed_by_severity(scan_id).await?;
        let summary = SessionSummary {
            scan_id,
            started_at: open.session_start,
            ended_at: now,
            duration_secs: (now - open.session_start).num_seconds().max(0),
            counters,
            completed_by_severity,
        };
        info!(
            scan_id,
            duration_secs = summary.duration_secs,
            reviewed = counters.reviewed,
            completed = counters.completed,
            skipped = counters.skipped,
            "review session finalized"
        );
        Ok(Some(summary))
    }

    /// A panic in `body` is resumed after the session is finalized.
    pub async fn run_review<D, F, T>(
        &self,
        scan_id: i64,
        decide: D,
        body: F,
    ) -> Result<(T, Option<SessionSummary>)>
    where
        D: FnOnce(&SessionRecord) -> ResumeChoice,
        F: for<'s> FnOnce(&'s mut ReviewSession) -> BoxFuture<'s, T>,
    {
        let mut session = self.start_or_resume_session(scan_id, decide).await?;
        let outcome = AssertUnwindSafe(body(&mut session)).catch_unwind().await;
        let finalized = self.end_session(scan_id, session.counters).await;

        match outcome {
            Ok(value) => Ok((value, finalized?)),
            Err(panic) => {
                match &finalized {
                    Ok(_) => warn!(scan_id, "review loop interrupted; session finalized"),
                    Err(e) => error!(scan_id, error = %e, "review loop interrupted; finalize failed"),
                }
                std::panic::resume_unwind(panic)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        models::{ReviewState, Severity},
        store::fixtures::{day, finding_id, seed_scan},
    };

    async fn setup() -> (Store, SessionManager, i64) {
        let store = Store::in_memory().await.unwrap();
        let scan_id = seed_scan(
            &store,
            "dmz-weekly",
            day(1),
            &[
                (700, "P700", Severity::Critical, &["10.9.0.1"]),
                (701, "P701", Severity::Low, &["10.9.0.2"]),
            ],
        )
        .await;
        (store.clone(), SessionManager::new(store), scan_id)
    }

    fn never_asked(_: &SessionRecord) -> ResumeChoice {
        panic!("no session should exist yet")
    }

    #[tokio::test]
    async fn resume_keeps_original_start() {
        let (store, manager, scan_id) = setup().await;
        let start = day(3);

        let mut first = manager.start_or_resume_at(scan_id, start, never_asked).await.unwrap();
        first.record_reviewed();
        first.record_skipped();
        manager.checkpoint(&first).await.unwrap();
        drop(first);

        // process restart: a fresh manager over the same store
        let manager = SessionManager::new(store);
        let resumed_at = start + Duration::hours(2);
        let resumed = manager
            .start_or_resume_at(scan_id, resumed_at, |record| {
                assert_eq!(record.session_start, start);
                ResumeChoice::Resume
            })
            .await
            .unwrap();

        assert!(resumed.is_resumed());
        assert_eq!(resumed.started_at(), start);
        assert_eq!(resumed.counters.reviewed, 1);
        assert_eq!(resumed.counters.skipped, 1);
        let later = resumed_at + Duration::minutes(30);
        assert_eq!(resumed.elapsed_at(later), Duration::minutes(150));
    }

    #[tokio::test]
    async fn restart_replaces_the_open_session() {
        let (store, manager, scan_id) = setup().await;
        let old = manager.start_or_resume_at(scan_id, day(3), never_asked).await.unwrap();

        let fresh = manager
            .start_or_resume_at(scan_id, day(4), |_| ResumeChoice::Restart)
            .await
            .unwrap();
        assert!(!fresh.is_resumed());
        assert_ne!(fresh.session_id(), old.session_id());
        assert_eq!(fresh.started_at(), day(4));
        assert_eq!(fresh.counters, SessionCounters::default());

        let open = store.get_session(scan_id).await.unwrap().unwrap();
        assert_eq!(open.session_id, fresh.session_id());
    }

    #[tokio::test]
    async fn end_session_records_history_and_closes() {
        let (store, manager, scan_id) = setup().await;
        let mut session = manager.start_or_resume_at(scan_id, day(5), never_asked).await.unwrap();
        session.mark_complete(finding_id(&store, scan_id, 700).await).await.unwrap();
        session.record_reviewed();

        let ended = day(5) + Duration::minutes(90);
        let summary = manager
            .end_session_at(scan_id, session.counters, ended)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(summary.duration_secs, 5400);
        assert_eq!(summary.counters.completed, 1);
        assert_eq!(summary.completed_by_severity.critical, 1);
        assert!(store.get_session(scan_id).await.unwrap().is_none());

        let scan = store.get_scan(scan_id).await.unwrap().unwrap();
        assert_eq!(scan.last_reviewed_at, Some(ended));

        let history = store.review_history(scan_id).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].session_start, day(5));
        assert_eq!(history[0].completed_count, 1);
        assert_eq!(history[0].reviewed_count, 1);
    }

    #[tokio::test]
    async fn end_without_open_session_still_touches_scan() {
        let (store, manager, scan_id) = setup().await;
        let result = manager
            .end_session_at(scan_id, SessionCounters::default(), day(9))
            .await
            .unwrap();
        assert!(result.is_none());
        let scan = store.get_scan(scan_id).await.unwrap().unwrap();
        assert_eq!(scan.last_reviewed_at, Some(day(9)));
    }

    #[tokio::test]
    async fn unknown_scan_cannot_open_a_session() {
        let (_, manager, _) = setup().await;
        let err = manager.start_or_resume_session(77, never_asked).await.err().unwrap();
        assert!(matches!(err, Error::ScanNotFound { scan_id: 77 }));
    }

    #[tokio::test]
    async fn mark_then_undo_leaves_net_zero_completions() {
        let (store, manager, scan_id) = setup().await;
        let id = finding_id(&store, scan_id, 701).await;
        let mut session = manager.start_or_resume_session(scan_id, never_asked).await.unwrap();

        assert!(session.mark_complete(id).await.unwrap().is_applied());
        assert!(session.undo_complete(id).await.unwrap().is_applied());

        assert_eq!(session.counters.completed, 0);
        assert_eq!(session.counters.reverted, 1);
        let finding = store.get_finding(id).await.unwrap().unwrap();
        assert_eq!(finding.review_state, ReviewState::Pending);
    }

    #[tokio::test]
    async fn run_review_finalizes_after_normal_exit() {
        let (store, manager, scan_id) = setup().await;
        let id = finding_id(&store, scan_id, 700).await;

        let (marked, summary) = manager
            .run_review(scan_id, never_asked, move |session| {
                async move {
                    session.record_reviewed();
                    session.mark_complete(id).await.map(|t| t.is_applied())
                }
                .boxed()
            })
            .await
            .unwrap();

        assert!(marked.unwrap());
        let summary = summary.unwrap();
        assert_eq!(summary.counters.completed, 1);
        assert_eq!(summary.counters.reviewed, 1);
        assert!(store.get_session(scan_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn run_review_finalizes_after_panic() {
        let (store, manager, scan_id) = setup().await;

        let result = AssertUnwindSafe(manager.run_review(scan_id, never_asked, |session| {
            async move {
                session.record_skipped();
                if session.counters.skipped > 0 {
                    panic!("terminal went away");
                }
            }
            .boxed()
        }))
        .catch_unwind()
        .await;

        assert!(result.is_err());
        assert!(store.get_session(scan_id).await.unwrap().is_none());
        let history = store.review_history(scan_id).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].skipped_count, 1);
        assert!(store.get_scan(scan_id).await.unwrap().unwrap().last_reviewed_at.is_some());
    }
}
