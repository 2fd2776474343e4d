use std::{env, fs, path::PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::workflows::WorkflowSource;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database_url: String,
    pub db_max_connections: u32,
    /// Custom workflow document, merged over the bundled defaults.
    pub custom_workflows_path: Option<PathBuf>,
    /// Use only the custom document and ignore the bundled defaults.
    pub custom_workflows_only: bool,
}

impl AppConfig {
    pub fn load() -> anyhow::Result<Self> {
        Self::load_with(|key| env::var(key).ok())
    }

    /// Same as [`AppConfig::load`] with the environment supplied by `var`.
    pub fn load_with(var: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let path = var("SCAN_REVIEW_CONFIG").unwrap_or_else(|| "scan-review.json".to_string());
        let file_cfg: Option<AppConfig> = fs::read_to_string(&path)
            .ok()
            .map(|raw| serde_json::from_str(&raw))
            .transpose()
            .with_context(|| format!("failed to parse {path}"))?;

        let mut cfg = file_cfg.unwrap_or_default();

        if let Some(v) = var("SR_DATABASE_URL") {
            cfg.database_url = v;
        }
        if let Some(v) = var("SR_DB_MAX_CONNECTIONS") {
            cfg.db_max_connections = v.parse().unwrap_or(cfg.db_max_connections);
        }
        if let Some(v) = var("SR_CUSTOM_WORKFLOWS") {
            let v = v.trim();
            cfg.custom_workflows_path = (!v.is_empty()).then(|| PathBuf::from(v));
        }
        if let Some(v) = var("SR_CUSTOM_WORKFLOWS_ONLY") {
            cfg.custom_workflows_only = matches!(v.trim(), "1" | "true" | "yes");
        }

        Ok(cfg)
    }

    /// Exclusive mode needs a custom document; without one the defaults are used.
    pub fn workflow_source(&self) -> WorkflowSource {
        match (&self.custom_workflows_path, self.custom_workflows_only) {
            (None, _) => WorkflowSource::Defaults,
            (Some(path), false) => WorkflowSource::Supplement(path.clone()),
            (Some(path), true) => WorkflowSource::Exclusive(path.clone()),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://scan-review.db".to_string(),
            db_max_connections: 4,
            custom_workflows_path: None,
            custom_workflows_only: false,
        }
    }
}
