use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{
    error::Result,
    models::{Host, Scan, Severity, SeverityCounts},
    store::{HostSummary, PluginSummary, Store},
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanRef {
    pub scan_id: i64,
    pub scan_name: String,
    pub created_at: DateTime<Utc>,
}

impl From<Scan> for ScanRef {
    fn from(scan: Scan) -> Self {
        Self {
            scan_id: scan.scan_id,
            scan_name: scan.scan_name,
            created_at: scan.created_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanComparison {
    pub base: ScanRef,
    pub candidate: ScanRef,
    pub min_severity: Severity,

    pub new_findings: Vec<PluginSummary>,
    pub resolved_findings: Vec<PluginSummary>,
    /// Rows come from the candidate scan.
    pub persistent_findings: Vec<PluginSummary>,

    pub new_hosts: Vec<HostSummary>,
    pub removed_hosts: Vec<HostSummary>,
    pub persistent_hosts: Vec<HostSummary>,

    pub new_by_severity: SeverityCounts,
    pub resolved_by_severity: SeverityCounts,
    pub persistent_by_severity: SeverityCounts,
}

impl ScanComparison {
    pub fn total_new(&self) -> usize {
        self.new_findings.len()
    }

    pub fn total_resolved(&self) -> usize {
        self.resolved_findings.len()
    }

    pub fn total_persistent(&self) -> usize {
        self.persistent_findings.len()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanSnapshot {
    pub scan_id: i64,
    pub scan_name: String,
    pub scan_date: DateTime<Utc>,
    pub finding_count: usize,
    pub max_severity: Severity,
    pub by_severity: SeverityCounts,
    pub plugin_ids: Vec<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostHistory {
    pub host: Host,
    pub scans: Vec<ScanSnapshot>,
}

impl HostHistory {
    pub fn scan_count(&self) -> usize {
        self.scans.len()
    }
}

#[derive(Clone)]
pub struct Comparator {
    store: Store,
}

impl Comparator {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub async fn compare_scans(
        &self,
        base: i64,
        candidate: i64,
        min_severity: Option<Severity>,
    ) -> Result<Option<ScanComparison>> {
        let (Some(base_scan), Some(candidate_scan)) =
            (self.store.get_scan(base).await?, self.store.get_scan(candidate).await?)
        else {
            debug!(base, candidate, "comparison skipped, scan missing");
            return Ok(None);
        };
        let min_severity = min_severity.unwrap_or(Severity::Info);

        let base_plugins = self.store.plugin_summaries(base, min_severity).await?;
        let candidate_plugins = self.store.plugin_summaries(candidate, min_severity).await?;
        let base_ids: HashSet<i64> = base_plugins.iter().map(|p| p.plugin_id).collect();
        let candidate_ids: HashSet<i64> = candidate_plugins.iter().map(|p| p.plugin_id).collect();

        let (new_findings, new_by_severity) =
            partition(&candidate_plugins, |p| !base_ids.contains(&p.plugin_id));
        let (resolved_findings, resolved_by_severity) =
            partition(&base_plugins, |p| !candidate_ids.contains(&p.plugin_id));
        let (persistent_findings, persistent_by_severity) =
            partition(&candidate_plugins, |p| base_ids.contains(&p.plugin_id));

        let base_hosts = self.store.hosts_for_scan(base).await?;
        let candidate_hosts = self.store.hosts_for_scan(candidate).await?;
        let base_host_ids: HashSet<i64> = base_hosts.iter().map(|h| h.host_id).collect();
        let candidate_host_ids: HashSet<i64> = candidate_hosts.iter().map(|h| h.host_id).collect();

        let pick = |hosts: &[HostSummary], keep: &dyn Fn(&HostSummary) -> bool| {
            hosts.iter().filter(|h| keep(h)).cloned().collect::<Vec<_>>()
        };
        let new_hosts = pick(&candidate_hosts, &|h| !base_host_ids.contains(&h.host_id));
        let removed_hosts = pick(&base_hosts, &|h| !candidate_host_ids.contains(&h.host_id));
        let persistent_hosts = pick(&candidate_hosts, &|h| base_host_ids.contains(&h.host_id));

        let comparison = ScanComparison {
            base: base_scan.into(),
            candidate: candidate_scan.into(),
            min_severity,
            new_findings,
            resolved_findings,
            persistent_findings,
            new_hosts,
            removed_hosts,
            persistent_hosts,
            new_by_severity,
            resolved_by_severity,
            persistent_by_severity,
        };
        info!(
            base,
            candidate,
            min_severity = %min_severity,
            new = comparison.total_new(),
            resolved = comparison.total_resolved(),
            persistent = comparison.total_persistent(),
            "scans compared"
        );
        Ok(Some(comparison))
    }

    pub async fn get_host_vulnerability_history(
        &self,
        ip_address: &str,
    ) -> Result<Option<HostHistory>> {
        let Some(host) = self.store.get_host_by_address(ip_address).await? else {
            return Ok(None);
        };

        let mut scans: Vec<ScanSnapshot> = Vec::new();
        for row in self.store.host_scan_rows(ip_address).await? {
            if scans.last().map(|s| s.scan_id) != Some(row.scan_id) {
                scans.push(ScanSnapshot {
                    scan_id: row.scan_id,
                    scan_name: row.scan_name,
                    scan_date: row.scan_date,
                    finding_count: 0,
                    max_severity: Severity::Info,
                    by_severity: SeverityCounts::default(),
                    plugin_ids: Vec::new(),
                });
            }
            let Some(snapshot) = scans.last_mut() else {
                continue;
            };
            snapshot.finding_count += 1;
            snapshot.by_severity.increment(row.severity);
            snapshot.max_severity = snapshot.max_severity.max(row.severity);
            snapshot.plugin_ids.push(row.plugin_id);
        }

        debug!(ip_address, scans = scans.len(), "host history built");
        Ok(Some(HostHistory { host, scans }))
    }
}

fn partition<F>(rows: &[PluginSummary], keep: F) -> (Vec<PluginSummary>, SeverityCounts)
where
    F: Fn(&PluginSummary) -> bool,
{
    let mut counts = SeverityCounts::default();
    let kept = rows
        .iter()
        .filter(|row| keep(row))
        .inspect(|row| counts.increment(row.severity))
        .cloned()
        .collect();
    (kept, counts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::fixtures::{day, seed_scan};

    fn plugin_ids(rows: &[PluginSummary]) -> Vec<i64> {
        let mut ids: Vec<i64> = rows.iter().map(|r| r.plugin_id).collect();
        ids.sort();
        ids
    }

    fn addresses(rows: &[HostSummary]) -> Vec<&str> {
        rows.iter().map(|h| h.ip_address.as_str()).collect()
    }

    async fn two_scans(store: &Store) -> (i64, i64) {
        let a = seed_scan(
            store,
            "scan-a",
            day(1),
            &[
                (100, "Plugin A", Severity::High, &["192.168.1.1"]),
                (101, "Plugin B", Severity::Medium, &["192.168.1.1"]),
            ],
        )
        .await;
        let b = seed_scan(
            store,
            "scan-b",
            day(8),
            &[
                (100, "Plugin A", Severity::High, &["192.168.1.1"]),
                (101, "Plugin B", Severity::Medium, &["192.168.1.1"]),
                (102, "Plugin C", Severity::Critical, &["192.168.1.1"]),
            ],
        )
        .await;
        (a, b)
    }

    #[tokio::test]
    async fn scan_compared_with_itself_is_all_persistent() {
        let store = Store::in_memory().await.unwrap();
        let (a, _) = two_scans(&store).await;
        let cmp = Comparator::new(store);

        let result = cmp.compare_scans(a, a, None).await.unwrap().unwrap();
        assert_eq!(result.total_new(), 0);
        assert_eq!(result.total_resolved(), 0);
        assert_eq!(result.total_persistent(), 2);
        assert!(result.new_hosts.is_empty());
        assert!(result.removed_hosts.is_empty());
    }

    #[tokio::test]
    async fn comparison_is_asymmetric_under_swap() {
        let store = Store::in_memory().await.unwrap();
        let (a, b) = two_scans(&store).await;
        let cmp = Comparator::new(store);

        let forward = cmp.compare_scans(a, b, None).await.unwrap().unwrap();
        assert_eq!(plugin_ids(&forward.new_findings), vec![102]);
        assert!(forward.resolved_findings.is_empty());
        assert_eq!(plugin_ids(&forward.persistent_findings), vec![100, 101]);
        assert_eq!(forward.new_by_severity.critical, 1);
        assert_eq!(forward.persistent_by_severity.total(), 2);

        let backward = cmp.compare_scans(b, a, None).await.unwrap().unwrap();
        assert!(backward.new_findings.is_empty());
        assert_eq!(plugin_ids(&backward.resolved_findings), vec![102]);
        assert_eq!(plugin_ids(&backward.persistent_findings), vec![100, 101]);
        assert_eq!(backward.resolved_by_severity.critical, 1);
        assert_eq!(backward.base.scan_name, "scan-b");
    }

    #[tokio::test]
    async fn severity_filter_applies_to_every_bucket() {
        let store = Store::in_memory().await.unwrap();
        let plugins = [
            (200, "Low One", Severity::Low, &["10.1.1.1"][..]),
            (201, "Medium One", Severity::Medium, &["10.1.1.1"][..]),
            (202, "High One", Severity::High, &["10.1.1.1"][..]),
        ];
        let a = seed_scan(&store, "filter-a", day(1), &plugins).await;
        let b = seed_scan(&store, "filter-b", day(2), &plugins).await;
        let cmp = Comparator::new(store);

        let result = cmp.compare_scans(a, b, Some(Severity::High)).await.unwrap().unwrap();
        assert_eq!(result.total_persistent(), 1);
        assert_eq!(result.total_new(), 0);
        assert_eq!(result.total_resolved(), 0);
        assert_eq!(result.persistent_findings[0].plugin_id, 202);
        assert_eq!(result.persistent_by_severity.low, 0);
        assert_eq!(result.persistent_by_severity.medium, 0);
    }

    #[tokio::test]
    async fn host_sets_are_classified() {
        let store = Store::in_memory().await.unwrap();
        let a = seed_scan(&store, "hosts-a", day(1), &[(300, "P", Severity::Low, &["10.0.0.1", "10.0.0.2"])]).await;
        let b = seed_scan(&store, "hosts-b", day(2), &[(300, "P", Severity::Low, &["10.0.0.1", "10.0.0.3"])]).await;
        let cmp = Comparator::new(store);

        let result = cmp.compare_scans(a, b, None).await.unwrap().unwrap();
        assert_eq!(addresses(&result.new_hosts), ["10.0.0.3"]);
        assert_eq!(addresses(&result.removed_hosts), ["10.0.0.2"]);
        assert_eq!(addresses(&result.persistent_hosts), ["10.0.0.1"]);
    }

    #[tokio::test]
    async fn persistent_rows_come_from_candidate() {
        let store = Store::in_memory().await.unwrap();
        let a = seed_scan(&store, "meta-a", day(1), &[(400, "Old name", Severity::Low, &["10.2.0.1"])]).await;
        let b = seed_scan(&store, "meta-b", day(2), &[(400, "New name", Severity::Low, &["10.2.0.1", "10.2.0.2"])]).await;
        let cmp = Comparator::new(store);

        let result = cmp.compare_scans(a, b, None).await.unwrap().unwrap();
        assert_eq!(result.persistent_findings[0].affected_hosts, 2);
        assert_eq!(result.persistent_findings[0].plugin_name, "New name");
    }

    #[tokio::test]
    async fn missing_scan_is_none_on_either_side() {
        let store = Store::in_memory().await.unwrap();
        let (a, _) = two_scans(&store).await;
        let cmp = Comparator::new(store);

        assert!(cmp.compare_scans(a, 999, None).await.unwrap().is_none());
        assert!(cmp.compare_scans(999, a, None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn host_history_orders_snapshots_by_scan_date() {
        let store = Store::in_memory().await.unwrap();
        // inserted newest first; the timeline must still come out oldest first
        seed_scan(
            &store,
            "march",
            day(20),
            &[
                (500, "P500", Severity::Critical, &["172.16.0.5"]),
                (501, "P501", Severity::Low, &["172.16.0.5"]),
            ],
        )
        .await;
        seed_scan(&store, "early-march", day(2), &[(501, "P501", Severity::Low, &["172.16.0.5"])]).await;
        seed_scan(&store, "unrelated", day(10), &[(502, "P502", Severity::High, &["172.16.0.9"])]).await;
        let cmp = Comparator::new(store);

        let history = cmp
            .get_host_vulnerability_history("172.16.0.5")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(history.scan_count(), 2);
        assert_eq!(history.scans[0].scan_name, "early-march");
        assert_eq!(history.scans[0].plugin_ids, vec![501]);
        assert_eq!(history.scans[0].max_severity, Severity::Low);

        let latest = &history.scans[1];
        assert_eq!(latest.finding_count, 2);
        assert_eq!(latest.max_severity, Severity::Critical);
        assert_eq!(latest.by_severity.critical, 1);
        assert_eq!(latest.by_severity.low, 1);
        assert_eq!(latest.plugin_ids, vec![500, 501]);
        assert_eq!(history.host.first_seen, day(2));
        assert_eq!(history.host.last_seen, day(20));
    }

    #[tokio::test]
    async fn unknown_host_has_no_history() {
        let store = Store::in_memory().await.unwrap();
        let cmp = Comparator::new(store);
        assert!(cmp.get_host_vulnerability_history("203.0.113.7").await.unwrap().is_none());
    }
}
