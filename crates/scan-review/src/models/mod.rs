use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info = 0,
    Low = 1,
    Medium = 2,
    High = 3,
    Critical = 4,
}

impl Severity {
    pub const ALL: [Severity; 5] = [
        Severity::Info,
        Severity::Low,
        Severity::Medium,
        Severity::High,
        Severity::Critical,
    ];

    pub fn ordinal(self) -> i64 {
        self as i64
    }

    pub fn label(self) -> &'static str {
        match self {
            Severity::Info => "Info",
            Severity::Low => "Low",
            Severity::Medium => "Medium",
            Severity::High => "High",
            Severity::Critical => "Critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Accepts a label in any case (`high`, `High`) or an ordinal (`3`).
impl FromStr for Severity {
    type Err = InvalidSeverityName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Ok(n) = s.parse::<i64>() {
            return Severity::try_from(n).map_err(|_| InvalidSeverityName(s.to_string()));
        }
        Severity::ALL
            .into_iter()
            .find(|sev| sev.label().eq_ignore_ascii_case(s))
            .ok_or_else(|| InvalidSeverityName(s.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown severity {0:?}; expected info, low, medium, high, critical or 0-4")]
pub struct InvalidSeverityName(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("severity ordinal {0} is outside 0-4")]
pub struct InvalidSeverity(pub i64);

impl TryFrom<i64> for Severity {
    type Error = InvalidSeverity;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        Severity::ALL
            .into_iter()
            .find(|s| s.ordinal() == value)
            .ok_or(InvalidSeverity(value))
    }
}

/// Per-severity tally, keyed by ordinal 0-4.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeverityCounts {
    pub info: usize,
    pub low: usize,
    pub medium: usize,
    pub high: usize,
    pub critical: usize,
}

impl SeverityCounts {
    pub fn increment(&mut self, severity: Severity) {
        *self.slot(severity) += 1;
    }

    pub fn add(&mut self, severity: Severity, n: usize) {
        *self.slot(severity) += n;
    }

    pub fn get(&self, severity: Severity) -> usize {
        match severity {
            Severity::Info => self.info,
            Severity::Low => self.low,
            Severity::Medium => self.medium,
            Severity::High => self.high,
            Severity::Critical => self.critical,
        }
    }

    pub fn total(&self) -> usize {
        self.info + self.low + self.medium + self.high + self.critical
    }

    /// Highest severity with a non-zero count.
    pub fn max(&self) -> Option<Severity> {
        Severity::ALL.into_iter().rev().find(|s| self.get(*s) > 0)
    }

    fn slot(&mut self, severity: Severity) -> &mut usize {
        match severity {
            Severity::Info => &mut self.info,
            Severity::Low => &mut self.low,
            Severity::Medium => &mut self.medium,
            Severity::High => &mut self.high,
            Severity::Critical => &mut self.critical,
        }
    }
}

/// Persisted review lifecycle tag. "Reviewed" (looked at, not marked) lives only in
/// session counters and has no stored representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ReviewState {
    Pending,
    Completed,
}

impl ReviewState {
    pub fn as_str(self) -> &'static str {
        match self {
            ReviewState::Pending => "pending",
            ReviewState::Completed => "completed",
        }
    }
}

impl fmt::Display for ReviewState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Scan {
    pub scan_id: i64,
    pub scan_name: String,
    pub created_at: DateTime<Utc>,
    pub last_reviewed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Plugin {
    pub plugin_id: i64,
    pub plugin_name: String,
    #[sqlx(rename = "severity_int", try_from = "i64")]
    pub severity: Severity,
    #[sqlx(json)]
    pub cves: Vec<String>,
    #[sqlx(json)]
    pub metasploit_names: Vec<String>,
    pub has_metasploit: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Finding {
    pub finding_id: i64,
    pub scan_id: i64,
    pub plugin_id: i64,
    pub review_state: ReviewState,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct FindingWithPlugin {
    #[sqlx(flatten)]
    pub finding: Finding,
    #[sqlx(flatten)]
    pub plugin: Plugin,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Host {
    pub host_id: i64,
    pub ip_address: String,
    pub hostname: Option<String>,
    pub scan_target_type: Option<String>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct SessionRecord {
    pub session_id: i64,
    pub scan_id: i64,
    pub session_start: DateTime<Utc>,
    pub reviewed_count: i64,
    pub completed_count: i64,
    pub skipped_count: i64,
    pub reverted_count: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct ReviewHistoryEntry {
    pub history_id: i64,
    pub scan_id: i64,
    pub session_start: DateTime<Utc>,
    pub session_end: DateTime<Utc>,
    pub reviewed_count: i64,
    pub completed_count: i64,
    pub skipped_count: i64,
    pub reverted_count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewScan {
    pub scan_name: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewPlugin {
    pub plugin_id: i64,
    pub plugin_name: String,
    pub severity: Severity,
    #[serde(default)]
    pub cves: Vec<String>,
    #[serde(default)]
    pub metasploit_names: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewHost {
    pub ip_address: String,
    pub hostname: Option<String>,
    pub scan_target_type: Option<String>,
    pub seen_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_ordinals_round_trip_through_i64() {
        for sev in Severity::ALL {
            assert_eq!(Severity::try_from(sev.ordinal()), Ok(sev));
        }
        assert_eq!(Severity::try_from(5), Err(InvalidSeverity(5)));
        assert_eq!(Severity::try_from(-1), Err(InvalidSeverity(-1)));
    }

    #[test]
    fn severity_counts_track_max() {
        let mut counts = SeverityCounts::default();
        assert_eq!(counts.max(), None);
        counts.increment(Severity::Low);
        counts.increment(Severity::High);
        counts.increment(Severity::Low);
        assert_eq!(counts.max(), Some(Severity::High));
        assert_eq!(counts.get(Severity::Low), 2);
        assert_eq!(counts.total(), 3);
    }

    #[test]
    fn severity_parses_labels_and_ordinals() {
        assert_eq!("HIGH".parse::<Severity>(), Ok(Severity::High));
        assert_eq!(" critical ".parse::<Severity>(), Ok(Severity::Critical));
        assert_eq!("2".parse::<Severity>(), Ok(Severity::Medium));
        assert!("7".parse::<Severity>().is_err());
        assert!("severe".parse::<Severity>().is_err());
    }
}
