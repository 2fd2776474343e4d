use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{
    error::{Error, Result},
    models::ReviewState,
    store::{self, Store},
};

pub const ALREADY_COMPLETE: &str = "already marked as review complete";
pub const NOT_COMPLETE: &str = "not marked as review complete";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "lowercase")]
pub enum Transition {
    Applied {
        finding_id: i64,
        plugin_id: i64,
        from: ReviewState,
        to: ReviewState,
    },
    Rejected {
        finding_id: i64,
        plugin_id: i64,
        state: ReviewState,
        reason: String,
    },
}

impl Transition {
    pub fn is_applied(&self) -> bool {
        matches!(self, Transition::Applied { .. })
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Transition::Applied { .. } => None,
            Transition::Rejected { reason, .. } => Some(reason),
        }
    }

    pub fn finding_id(&self) -> i64 {
        match self {
            Transition::Applied { finding_id, .. } | Transition::Rejected { finding_id, .. } => {
                *finding_id
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkFailure {
    pub finding_id: i64,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkSummary {
    pub requested: usize,
    pub marked: usize,
    pub already_complete: usize,
    pub failed: Vec<BulkFailure>,
}

impl BulkSummary {
    /// Already complete; store failures are in `failed`.
    pub fn skipped(&self) -> usize {
        self.requested - self.marked - self.failed.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BulkOutcome {
    /// Confirmation was declined or interrupted; nothing was written.
    Cancelled { requested: usize },
    Applied(BulkSummary),
}

/// Owns every write to `findings.review_state`.
#[derive(Clone)]
pub struct Reviewer {
    store: Store,
}

impl Reviewer {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub async fn mark_complete(&self, finding_id: i64) -> Result<Transition> {
        self.transition(
            finding_id,
            ReviewState::Pending,
            ReviewState::Completed,
            ALREADY_COMPLETE,
        )
        .await
    }

    pub async fn undo_complete(&self, finding_id: i64) -> Result<Transition> {
        self.transition(
            finding_id,
            ReviewState::Completed,
            ReviewState::Pending,
            NOT_COMPLETE,
        )
        .await
    }

    /// `confirm` is asked once, before any write, whenever more than one finding is
    /// targeted. After that every finding is marked in its own transaction and a failing
    /// item does not stop the rest.
    pub async fn bulk_mark_complete<C>(&self, finding_ids: &[i64], confirm: C) -> BulkOutcome
    where
        C: FnOnce(usize) -> bool,
    {
        let requested = finding_ids.len();
        if requested > 1 && !confirm(requested) {
            info!(requested, "bulk mark cancelled before any change");
            return BulkOutcome::Cancelled { requested };
        }

        let mut summary = BulkSummary {
            requested,
            ..BulkSummary::default()
        };
        for &finding_id in finding_ids {
            match self.mark_complete(finding_id).await {
                Ok(t) if t.is_applied() => summary.marked += 1,
                Ok(_) => summary.already_complete += 1,
                Err(e) => {
                    warn!(finding_id, error = %e, "bulk mark item failed");
                    summary.failed.push(BulkFailure {
                        finding_id,
                        error: e.to_string(),
                    });
                }
            }
        }

        info!(
            requested,
            marked = summary.marked,
            already_complete = summary.already_complete,
            failed = summary.failed.len(),
            "bulk mark finished"
        );
        BulkOutcome::Applied(summary)
    }

    async fn transition(
        &self,
        finding_id: i64,
        from: ReviewState,
        to: ReviewState,
        rejection: &str,
    ) -> Result<Transition> {
        let mut tx = self.store.pool().begin().await?;

        let finding = store::fetch_finding(&mut *tx, finding_id)
            .await?
            .ok_or(Error::FindingNotFound { finding_id })?;

        if finding.review_state != from
            || !store::transition_review_state(&mut *tx, finding_id, from, to, Utc::now()).await?
        {
            warn!(
                finding_id,
                plugin_id = finding.plugin_id,
                state = %finding.review_state,
                reason = rejection,
                "review transition rejected"
            );
            return Ok(Transition::Rejected {
                finding_id,
                plugin_id: finding.plugin_id,
                state: finding.review_state,
                reason: rejection.to_string(),
            });
        }

        tx.commit().await?;
        info!(finding_id, plugin_id = finding.plugin_id, %from, %to, "review state changed");
        Ok(Transition::Applied {
            finding_id,
            plugin_id: finding.plugin_id,
            from,
            to,
        })
    }
}
