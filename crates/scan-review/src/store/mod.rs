use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{types::Json, QueryBuilder, Sqlite, SqliteConnection, SqlitePool};
use tracing::debug;

use crate::{
    db,
    error::Result,
    models::{
        Finding, FindingWithPlugin, Host, NewHost, NewPlugin, NewScan, Plugin, ReviewHistoryEntry,
        ReviewState, Scan, SessionRecord, Severity, SeverityCounts,
    },
};

#[cfg(test)]
pub(crate) mod fixtures;

const FINDING_COLUMNS: &str = "SELECT f.finding_id, f.scan_id, f.plugin_id, f.review_state, f.completed_at, \
     p.plugin_name, p.severity_int, p.cves, p.metasploit_names, p.has_metasploit \
     FROM findings f JOIN plugins p ON p.plugin_id = f.plugin_id";

/// Restricts `Store::findings_for_scan`. `Some(vec![])` for a set filter matches nothing.
#[derive(Debug, Clone, Default)]
pub struct FindingFilter {
    pub severities: Option<Vec<Severity>>,
    pub metasploit_only: bool,
    pub plugin_ids: Option<Vec<i64>>,
    pub review_state: Option<ReviewState>,
}

impl FindingFilter {
    pub fn severities(severities: impl IntoIterator<Item = Severity>) -> Self {
        Self {
            severities: Some(severities.into_iter().collect()),
            ..Self::default()
        }
    }

    pub fn plugin_ids(ids: impl IntoIterator<Item = i64>) -> Self {
        Self {
            plugin_ids: Some(ids.into_iter().collect()),
            ..Self::default()
        }
    }

    fn matches_nothing(&self) -> bool {
        self.severities.as_ref().is_some_and(Vec::is_empty)
            || self.plugin_ids.as_ref().is_some_and(Vec::is_empty)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct SeverityBucket {
    #[sqlx(rename = "severity_int", try_from = "i64")]
    pub severity: Severity,
    pub findings: i64,
    pub completed: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewProgress {
    pub total: i64,
    pub pending: i64,
    pub completed: i64,
}

/// One plugin as it appears in a scan, with the number of distinct hosts it affects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct PluginSummary {
    pub plugin_id: i64,
    pub plugin_name: String,
    #[sqlx(rename = "severity_int", try_from = "i64")]
    pub severity: Severity,
    pub has_metasploit: bool,
    pub affected_hosts: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct HostSummary {
    pub host_id: i64,
    pub ip_address: String,
    pub hostname: Option<String>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct HostScanRow {
    pub scan_id: i64,
    pub scan_name: String,
    pub scan_date: DateTime<Utc>,
    pub plugin_id: i64,
    #[sqlx(rename = "severity_int", try_from = "i64")]
    pub severity: Severity,
}

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn in_memory() -> Result<Self> {
        Ok(Self::new(db::open_in_memory().await?))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn insert_scan(&self, scan: &NewScan) -> Result<i64> {
        let id = sqlx::query_scalar::<_, i64>(
            "INSERT INTO scans(scan_name, created_at) VALUES(?, ?) RETURNING scan_id",
        )
        .bind(&scan.scan_name)
        .bind(scan.created_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    pub async fn get_scan(&self, scan_id: i64) -> Result<Option<Scan>> {
        let mut conn = self.pool.acquire().await?;
        fetch_scan(&mut conn, scan_id).await
    }

    pub async fn get_scan_by_name(&self, scan_name: &str) -> Result<Option<Scan>> {
        let scan = sqlx::query_as::<_, Scan>(
            "SELECT scan_id, scan_name, created_at, last_reviewed_at FROM scans WHERE scan_name = ?",
        )
        .bind(scan_name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(scan)
    }

    pub async fn list_scans(&self) -> Result<Vec<Scan>> {
        let scans = sqlx::query_as::<_, Scan>(
            "SELECT scan_id, scan_name, created_at, last_reviewed_at FROM scans ORDER BY created_at DESC, scan_id DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(scans)
    }

    /// Removes the scan with its findings, host links, sessions and review history.
    pub async fn delete_scan(&self, scan_id: i64) -> Result<bool> {
        let res = sqlx::query("DELETE FROM scans WHERE scan_id = ?")
            .bind(scan_id)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected() > 0)
    }

    pub async fn upsert_plugin(&self, plugin: &NewPlugin) -> Result<()> {
        sqlx::query(
            "INSERT INTO plugins(plugin_id, plugin_name, severity_int, cves, metasploit_names, has_metasploit) \
             VALUES(?, ?, ?, ?, ?, ?) \
             ON CONFLICT(plugin_id) DO UPDATE SET \
               plugin_name = excluded.plugin_name, \
               severity_int = excluded.severity_int, \
               cves = excluded.cves, \
               metasploit_names = excluded.metasploit_names, \
               has_metasploit = excluded.has_metasploit",
        )
        .bind(plugin.plugin_id)
        .bind(&plugin.plugin_name)
        .bind(plugin.severity.ordinal())
        .bind(Json(&plugin.cves))
        .bind(Json(&plugin.metasploit_names))
        .bind(!plugin.metasploit_names.is_empty())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_plugin(&self, plugin_id: i64) -> Result<Option<Plugin>> {
        let plugin = sqlx::query_as::<_, Plugin>(
            "SELECT plugin_id, plugin_name, severity_int, cves, metasploit_names, has_metasploit \
             FROM plugins WHERE plugin_id = ?",
        )
        .bind(plugin_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(plugin)
    }

    /// New findings always start out `pending`.
    pub async fn insert_finding(&self, scan_id: i64, plugin_id: i64) -> Result<i64> {
        let id = sqlx::query_scalar::<_, i64>(
            "INSERT INTO findings(scan_id, plugin_id, review_state) VALUES(?, ?, ?) RETURNING finding_id",
        )
        .bind(scan_id)
        .bind(plugin_id)
        .bind(ReviewState::Pending)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    pub async fn get_finding(&self, finding_id: i64) -> Result<Option<Finding>> {
        let mut conn = self.pool.acquire().await?;
        fetch_finding(&mut conn, finding_id).await
    }

    pub async fn findings_for_scan(
        &self,
        scan_id: i64,
        filter: &FindingFilter,
    ) -> Result<Vec<FindingWithPlugin>> {
        if filter.matches_nothing() {
            return Ok(Vec::new());
        }

        let mut qb = QueryBuilder::<Sqlite>::new(FINDING_COLUMNS);
        qb.push(" WHERE f.scan_id = ").push_bind(scan_id);

        if let Some(severities) = &filter.severities {
            qb.push(" AND p.severity_int IN (");
            let mut list = qb.separated(", ");
            for sev in severities {
                list.push_bind(sev.ordinal());
            }
            list.push_unseparated(")");
        }
        if let Some(ids) = &filter.plugin_ids {
            qb.push(" AND f.plugin_id IN (");
            let mut list = qb.separated(", ");
            for id in ids {
                list.push_bind(*id);
            }
            list.push_unseparated(")");
        }
        if filter.metasploit_only {
            qb.push(" AND p.has_metasploit = 1");
        }
        if let Some(state) = filter.review_state {
            qb.push(" AND f.review_state = ").push_bind(state);
        }
        qb.push(" ORDER BY p.severity_int DESC, f.plugin_id ASC");

        let rows = qb
            .build_query_as::<FindingWithPlugin>()
            .fetch_all(&self.pool)
            .await?;
        debug!(scan_id, rows = rows.len(), "fetched findings");
        Ok(rows)
    }

    /// Severity levels present in a scan, highest first.
    pub async fn severity_buckets(&self, scan_id: i64) -> Result<Vec<SeverityBucket>> {
        let rows = sqlx::query_as::<_, SeverityBucket>(
            "SELECT p.severity_int AS severity_int, COUNT(*) AS findings, \
                    SUM(CASE WHEN f.review_state = 'completed' THEN 1 ELSE 0 END) AS completed \
             FROM findings f JOIN plugins p ON p.plugin_id = f.plugin_id \
             WHERE f.scan_id = ? \
             GROUP BY p.severity_int \
             ORDER BY p.severity_int DESC",
        )
        .bind(scan_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn completed_by_severity(&self, scan_id: i64) -> Result<SeverityCounts> {
        let mut counts = SeverityCounts::default();
        for bucket in self.severity_buckets(scan_id).await? {
            counts.add(bucket.severity, bucket.completed as usize);
        }
        Ok(counts)
    }

    pub async fn review_progress(&self, scan_id: i64) -> Result<ReviewProgress> {
        let (total, completed) = sqlx::query_as::<_, (i64, i64)>(
            "SELECT COUNT(*), COALESCE(SUM(CASE WHEN review_state = 'completed' THEN 1 ELSE 0 END), 0) \
             FROM findings WHERE scan_id = ?",
        )
        .bind(scan_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(ReviewProgress {
            total,
            pending: total - completed,
            completed,
        })
    }

    /// Hosts are deduplicated by address; a re-sighting widens the first/last seen window.
    pub async fn upsert_host(&self, host: &NewHost) -> Result<i64> {
        let id = sqlx::query_scalar::<_, i64>(
            "INSERT INTO hosts(ip_address, hostname, scan_target_type, first_seen, last_seen) \
             VALUES(?, ?, ?, ?, ?) \
             ON CONFLICT(ip_address) DO UPDATE SET \
               hostname = COALESCE(excluded.hostname, hosts.hostname), \
               scan_target_type = COALESCE(excluded.scan_target_type, hosts.scan_target_type), \
               first_seen = MIN(hosts.first_seen, excluded.first_seen), \
               last_seen = MAX(hosts.last_seen, excluded.last_seen) \
             RETURNING host_id",
        )
        .bind(&host.ip_address)
        .bind(&host.hostname)
        .bind(&host.scan_target_type)
        .bind(host.seen_at)
        .bind(host.seen_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    pub async fn get_host_by_address(&self, ip_address: &str) -> Result<Option<Host>> {
        let host = sqlx::query_as::<_, Host>(
            "SELECT host_id, ip_address, hostname, scan_target_type, first_seen, last_seen \
             FROM hosts WHERE ip_address = ?",
        )
        .bind(ip_address)
        .fetch_optional(&self.pool)
        .await?;
        Ok(host)
    }

    /// Idempotent per (finding, host, port); a missing port is stored as 0.
    pub async fn link_host(&self, finding_id: i64, host_id: i64, port: Option<u16>) -> Result<()> {
        sqlx::query(
            "INSERT OR IGNORE INTO finding_affected_hosts(finding_id, host_id, port_number) VALUES(?, ?, ?)",
        )
        .bind(finding_id)
        .bind(host_id)
        .bind(port.map_or(0, i64::from))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_session(&self, scan_id: i64) -> Result<Option<SessionRecord>> {
        let mut conn = self.pool.acquire().await?;
        fetch_session(&mut conn, scan_id).await
    }

    pub async fn review_history(&self, scan_id: i64) -> Result<Vec<ReviewHistoryEntry>> {
        let rows = sqlx::query_as::<_, ReviewHistoryEntry>(
            "SELECT history_id, scan_id, session_start, session_end, reviewed_count, completed_count, \
                    skipped_count, reverted_count \
             FROM review_history WHERE scan_id = ? ORDER BY session_end ASC, history_id ASC",
        )
        .bind(scan_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Plugins of a scan at or above `min_severity`, ordered by severity then name.
    pub async fn plugin_summaries(
        &self,
        scan_id: i64,
        min_severity: Severity,
    ) -> Result<Vec<PluginSummary>> {
        let rows = sqlx::query_as::<_, PluginSummary>(
            "SELECT p.plugin_id, p.plugin_name, p.severity_int, p.has_metasploit, \
                    COUNT(DISTINCT fah.host_id) AS affected_hosts \
             FROM findings f \
             JOIN plugins p ON p.plugin_id = f.plugin_id \
             LEFT JOIN finding_affected_hosts fah ON fah.finding_id = f.finding_id \
             WHERE f.scan_id = ? AND p.severity_int >= ? \
             GROUP BY p.plugin_id, p.plugin_name, p.severity_int, p.has_metasploit \
             ORDER BY p.severity_int DESC, p.plugin_name ASC, p.plugin_id ASC",
        )
        .bind(scan_id)
        .bind(min_severity.ordinal())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn hosts_for_scan(&self, scan_id: i64) -> Result<Vec<HostSummary>> {
        let rows = sqlx::query_as::<_, HostSummary>(
            "SELECT DISTINCT h.host_id, h.ip_address, h.hostname \
             FROM hosts h \
             JOIN finding_affected_hosts fah ON fah.host_id = h.host_id \
             JOIN findings f ON f.finding_id = fah.finding_id \
             WHERE f.scan_id = ? \
             ORDER BY h.ip_address ASC",
        )
        .bind(scan_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub(crate) async fn host_scan_rows(&self, ip_address: &str) -> Result<Vec<HostScanRow>> {
        let rows = sqlx::query_as::<_, HostScanRow>(
            "SELECT DISTINCT s.scan_id, s.scan_name, s.created_at AS scan_date, \
                    f.plugin_id, p.severity_int \
             FROM hosts h \
             JOIN finding_affected_hosts fah ON fah.host_id = h.host_id \
             JOIN findings f ON f.finding_id = fah.finding_id \
             JOIN scans s ON s.scan_id = f.scan_id \
             JOIN plugins p ON p.plugin_id = f.plugin_id \
             WHERE h.ip_address = ? \
             ORDER BY s.created_at ASC, s.scan_id ASC, f.plugin_id ASC",
        )
        .bind(ip_address)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

// Connection-level helpers, composed into transactions by the review and session modules.

pub(crate) async fn fetch_scan(conn: &mut SqliteConnection, scan_id: i64) -> Result<Option<Scan>> {
    let scan = sqlx::query_as::<_, Scan>(
        "SELECT scan_id, scan_name, created_at, last_reviewed_at FROM scans WHERE scan_id = ?",
    )
    .bind(scan_id)
    .fetch_optional(conn)
    .await?;
    Ok(scan)
}

pub(crate) async fn fetch_finding(
    conn: &mut SqliteConnection,
    finding_id: i64,
) -> Result<Option<Finding>> {
    let finding = sqlx::query_as::<_, Finding>(
        "SELECT finding_id, scan_id, plugin_id, review_state, completed_at FROM findings WHERE finding_id = ?",
    )
    .bind(finding_id)
    .fetch_optional(conn)
    .await?;
    Ok(finding)
}

/// Moves a finding to `to` only if it is currently in `from`. Returns whether a row changed.
pub(crate) async fn transition_review_state(
    conn: &mut SqliteConnection,
    finding_id: i64,
    from: ReviewState,
    to: ReviewState,
    at: DateTime<Utc>,
) -> Result<bool> {
    let completed_at = (to == ReviewState::Completed).then_some(at);
    let res = sqlx::query(
        "UPDATE findings SET review_state = ?, completed_at = ? WHERE finding_id = ? AND review_state = ?",
    )
    .bind(to)
    .bind(completed_at)
    .bind(finding_id)
    .bind(from)
    .execute(conn)
    .await?;
    Ok(res.rows_affected() == 1)
}

pub(crate) async fn fetch_session(
    conn: &mut SqliteConnection,
    scan_id: i64,
) -> Result<Option<SessionRecord>> {
    let session = sqlx::query_as::<_, SessionRecord>(
        "SELECT session_id, scan_id, session_start, reviewed_count, completed_count, skipped_count, reverted_count \
         FROM sessions WHERE scan_id = ?",
    )
    .bind(scan_id)
    .fetch_optional(conn)
    .await?;
    Ok(session)
}

pub(crate) async fn insert_session(
    conn: &mut SqliteConnection,
    scan_id: i64,
    started_at: DateTime<Utc>,
) -> Result<SessionRecord> {
    let session = sqlx::query_as::<_, SessionRecord>(
        "INSERT INTO sessions(scan_id, session_start) VALUES(?, ?) \
         RETURNING session_id, scan_id, session_start, reviewed_count, completed_count, skipped_count, reverted_count",
    )
    .bind(scan_id)
    .bind(started_at)
    .fetch_one(conn)
    .await?;
    Ok(session)
}

pub(crate) async fn delete_session(conn: &mut SqliteConnection, scan_id: i64) -> Result<bool> {
    let res = sqlx::query("DELETE FROM sessions WHERE scan_id = ?")
        .bind(scan_id)
        .execute(conn)
        .await?;
    Ok(res.rows_affected() > 0)
}
