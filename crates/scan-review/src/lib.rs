pub mod compare;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod review;
pub mod session;
pub mod store;
pub mod workflows;

use std::sync::Arc;

use tracing::info;

pub use crate::{
    compare::{Comparator, HostHistory, ScanComparison, ScanSnapshot},
    config::AppConfig,
    error::{Error, Result},
    models::{ReviewState, Severity, SeverityCounts},
    review::{BulkOutcome, BulkSummary, Reviewer, Transition},
    session::{ResumeChoice, ReviewSession, SessionCounters, SessionManager, SessionSummary},
    store::{FindingFilter, Store},
    workflows::{LoadReport, Workflow, WorkflowError, WorkflowMapper, WorkflowSource},
};

#[derive(Clone)]
pub struct ReviewContext {
    pub store: Store,
    pub workflows: Arc<WorkflowMapper>,
    pub config: Arc<AppConfig>,
}

impl ReviewContext {
    pub async fn open(config: AppConfig) -> Result<(Self, LoadReport)> {
        let pool = db::create_pool(&config.database_url, config.db_max_connections).await?;
        db::run_migrations(&pool).await?;
        let (mapper, report) = WorkflowMapper::load(&config.workflow_source())?;
        info!(database = %config.database_url, workflows = report.total, "review context ready");

        Ok((
            Self {
                store: Store::new(pool),
                workflows: Arc::new(mapper),
                config: Arc::new(config),
            },
            report,
        ))
    }

    pub fn reviewer(&self) -> Reviewer {
        Reviewer::new(self.store.clone())
    }

    pub fn sessions(&self) -> SessionManager {
        SessionManager::new(self.store.clone())
    }

    pub fn comparator(&self) -> Comparator {
        Comparator::new(self.store.clone())
    }
}
