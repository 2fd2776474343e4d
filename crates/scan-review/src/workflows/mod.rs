use std::{
    collections::{BTreeMap, HashMap, HashSet},
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::models::FindingWithPlugin;

const BUNDLED_DEFAULTS: &str = include_str!("../../workflows/default_workflows.yaml");
const BUNDLED_ORIGIN: &str = "<bundled defaults>";

#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("failed to read workflow document '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse workflow document '{path}': {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid workflow entry #{index} in '{path}': {reason}")]
    Invalid {
        path: String,
        index: usize,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub title: String,
    #[serde(default)]
    pub commands: Vec<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workflow {
    pub workflow_name: String,
    pub description: String,
    pub steps: Vec<WorkflowStep>,
    pub references: Vec<String>,
    /// Ids as declared by the entry, in declaration order.
    pub plugin_ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct WorkflowDocument {
    workflows: Vec<WorkflowEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PluginIdField {
    Text(String),
    Number(u64),
}

#[derive(Debug, Deserialize)]
struct WorkflowEntry {
    plugin_id: PluginIdField,
    workflow_name: String,
    description: String,
    steps: Vec<WorkflowStep>,
    #[serde(default)]
    references: Vec<String>,
}

/// Where workflows come from for one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkflowSource {
    Defaults,
    /// Defaults first, then the custom document overriding on conflict.
    Supplement(PathBuf),
    /// Only the custom document; defaults are discarded.
    Exclusive(PathBuf),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeReport {
    /// Custom workflows that claimed no previously registered plugin id.
    pub added: usize,
    /// Custom workflows that took over at least one registered plugin id.
    pub overridden: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadReport {
    pub defaults: usize,
    pub custom: Option<MergeReport>,
    /// Why a supplementing document was skipped.
    pub custom_error: Option<String>,
    pub total: usize,
}

#[derive(Debug, Clone, Default)]
pub struct WorkflowMapper {
    slots: Vec<Option<Arc<Workflow>>>,
    owners: Vec<usize>,
    index: HashMap<String, usize>,
}

impl WorkflowMapper {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_defaults() -> Result<Self, WorkflowError> {
        Self::from_yaml_str(BUNDLED_DEFAULTS, BUNDLED_ORIGIN)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, WorkflowError> {
        let mut mapper = Self::empty();
        mapper.merge(read_document(path.as_ref())?);
        Ok(mapper)
    }

    pub fn from_yaml_str(src: &str, origin: &str) -> Result<Self, WorkflowError> {
        let mut mapper = Self::empty();
        mapper.merge(parse_document(src, origin)?);
        Ok(mapper)
    }

    pub fn load(source: &WorkflowSource) -> Result<(Self, LoadReport), WorkflowError> {
        let (mapper, report) = match source {
            WorkflowSource::Defaults => {
                let mapper = Self::with_defaults()?;
                let defaults = mapper.count();
                (mapper, LoadReport { defaults, total: defaults, ..LoadReport::default() })
            }
            WorkflowSource::Supplement(path) => {
                let mut mapper = Self::with_defaults()?;
                let defaults = mapper.count();
                let (merge, custom_error) = match mapper.load_additional(path) {
                    Ok(merge) => (merge, None),
                    Err(e) => {
                        warn!(error = %e, "custom workflows not loaded; keeping defaults");
                        (MergeReport::default(), Some(e.to_string()))
                    }
                };
                let total = mapper.count();
                (mapper, LoadReport { defaults, custom: Some(merge), custom_error, total })
            }
            WorkflowSource::Exclusive(path) => {
                let mapper = Self::from_path(path)?;
                let total = mapper.count();
                let custom = MergeReport { added: total, overridden: 0 };
                (mapper, LoadReport { custom: Some(custom), total, ..LoadReport::default() })
            }
        };
        info!(
            defaults = report.defaults,
            total = report.total,
            added = report.custom.map(|c| c.added),
            overridden = report.custom.map(|c| c.overridden),
            "workflows loaded"
        );
        Ok((mapper, report))
    }

    /// The document is parsed and validated in full before anything is registered.
    pub fn load_additional(&mut self, path: impl AsRef<Path>) -> Result<MergeReport, WorkflowError> {
        let workflows = read_document(path.as_ref())?;
        Ok(self.merge(workflows))
    }

    pub fn get_workflow(&self, plugin_id: &str) -> Option<Arc<Workflow>> {
        self.index
            .get(plugin_id.trim())
            .and_then(|&slot| self.slots[slot].clone())
    }

    pub fn has_workflow(&self, plugin_id: &str) -> bool {
        self.index.contains_key(plugin_id.trim())
    }

    /// Distinct workflows, not registered ids.
    pub fn count(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    pub fn get_all_workflows(&self) -> Vec<Arc<Workflow>> {
        self.slots.iter().flatten().cloned().collect()
    }

    pub fn get_all_plugin_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.index.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Records without a workflow are left out.
    pub fn group_findings<'a>(
        &self,
        records: &'a [FindingWithPlugin],
    ) -> BTreeMap<String, Vec<&'a FindingWithPlugin>> {
        let mut groups: BTreeMap<String, Vec<&FindingWithPlugin>> = BTreeMap::new();
        for record in records {
            if let Some(workflow) = self.get_workflow(&record.plugin.plugin_id.to_string()) {
                groups
                    .entry(workflow.workflow_name.clone())
                    .or_default()
                    .push(record);
            }
        }
        groups
    }

    fn merge(&mut self, workflows: Vec<Workflow>) -> MergeReport {
        let mut report = MergeReport::default();
        // slots below this index were registered before the document
        let existing = self.slots.len();
        for workflow in workflows {
            let slot = self.slots.len();
            let mut took_over = false;
            for id in &workflow.plugin_ids {
                if let Some(previous) = self.index.insert(id.clone(), slot) {
                    took_over |= previous < existing;
                    self.release(previous);
                }
            }
            if took_over {
                report.overridden += 1;
            } else {
                report.added += 1;
            }
            debug!(workflow = %workflow.workflow_name, ids = ?workflow.plugin_ids, "workflow registered");
            self.owners.push(workflow.plugin_ids.len());
            self.slots.push(Some(Arc::new(workflow)));
        }
        report
    }

    fn release(&mut self, slot: usize) {
        self.owners[slot] -= 1;
        if self.owners[slot] == 0 {
            self.slots[slot] = None;
        }
    }
}

fn read_document(path: &Path) -> Result<Vec<Workflow>, WorkflowError> {
    let src = fs::read_to_string(path).map_err(|e| WorkflowError::Io {
        path: path.display().to_string(),
        source: e,
    })?;
    parse_document(&src, &path.display().to_string())
}

fn parse_document(src: &str, origin: &str) -> Result<Vec<Workflow>, WorkflowError> {
    let doc: WorkflowDocument = serde_yaml::from_str(src).map_err(|e| WorkflowError::Parse {
        path: origin.to_string(),
        source: e,
    })?;

    let invalid = |index: usize, reason: &str| WorkflowError::Invalid {
        path: origin.to_string(),
        index,
        reason: reason.to_string(),
    };

    doc.workflows
        .into_iter()
        .enumerate()
        .map(|(index, entry)| {
            let plugin_ids = split_plugin_ids(&entry.plugin_id);
            if plugin_ids.is_empty() {
                return Err(invalid(index, "plugin_id lists no ids"));
            }
            if entry.workflow_name.trim().is_empty() {
                return Err(invalid(index, "workflow_name is empty"));
            }
            Ok(Workflow {
                workflow_name: entry.workflow_name,
                description: entry.description,
                steps: entry.steps,
                references: entry.references,
                plugin_ids,
            })
        })
        .collect()
}

fn split_plugin_ids(field: &PluginIdField) -> Vec<String> {
    let raw = match field {
        PluginIdField::Text(s) => s.clone(),
        PluginIdField::Number(n) => n.to_string(),
    };
    let mut seen = HashSet::new();
    raw.split(',')
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .filter(|id| seen.insert(id.to_string()))
        .map(str::to_string)
        .collect()
}
