//! Data models for consistency validation runs.

use crate::index_client::Scope;
use crate::index_queue::ObjectType;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of drift between the store and the index for one object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Issue {
    /// In the store, absent from the index
    MissingFromIndex,
    /// In both, with differing content
    Mismatch,
    /// In the index, absent from the store
    OrphanedInIndex,
}

impl Issue {
    pub fn as_str(&self) -> &'static str {
        match self {
            Issue::MissingFromIndex => "missing_from_index",
            Issue::Mismatch => "mismatch",
            Issue::OrphanedInIndex => "orphaned_in_index",
        }
    }

    /// Whether re-indexing the object fixes this issue.
    pub fn is_healable(&self) -> bool {
        matches!(self, Issue::MissingFromIndex | Issue::Mismatch)
    }
}

impl fmt::Display for Issue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a scope was not walked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    IndexNotFound,
    EmptyIndex,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::IndexNotFound => "index_not_found",
            SkipReason::EmptyIndex => "empty_index",
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of the diff report: either a per-object issue or a skipped scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffEntry {
    pub object_type: ObjectType,
    /// Absent on skipped-scope entries
    pub object_id: Option<i64>,
    pub index_version: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub site_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub issue: Option<Issue>,
    #[serde(default)]
    pub skipped: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<SkipReason>,
}

impl DiffEntry {
    pub fn issue(scope: &Scope, object_id: i64, issue: Issue) -> Self {
        Self {
            object_type: scope.object_type.clone(),
            object_id: Some(object_id),
            index_version: scope.index_version,
            site_id: scope.site_id,
            issue: Some(issue),
            skipped: false,
            reason: None,
        }
    }

    pub fn skipped(scope: &Scope, reason: SkipReason) -> Self {
        Self {
            object_type: scope.object_type.clone(),
            object_id: None,
            index_version: scope.index_version,
            site_id: scope.site_id,
            issue: None,
            skipped: true,
            reason: Some(reason),
        }
    }
}

/// Which issue kinds a run reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationMode {
    /// Every issue kind, orphans included
    #[default]
    All,
    Missing,
    Mismatch,
}

impl ValidationMode {
    pub fn reports(&self, issue: Issue) -> bool {
        match self {
            ValidationMode::All => true,
            ValidationMode::Missing => issue == Issue::MissingFromIndex,
            ValidationMode::Mismatch => issue == Issue::Mismatch,
        }
    }
}

/// Parameters of a content validation run.
#[derive(Debug, Clone)]
pub struct ValidationOptions {
    /// First object id to check
    pub start_id: i64,
    /// Last object id to check; defaults to the highest id in the store
    pub last_id: Option<i64>,
    pub batch_size: i64,
    /// Cap on reported diff entries
    pub max_diff_size: usize,
    /// Report drift without re-enqueuing the affected objects
    pub do_not_heal: bool,
    /// Run even if another validation holds the lock
    pub force_parallel: bool,
    pub mode: ValidationMode,
    /// Object types to check; defaults to every registered type
    pub object_types: Option<Vec<ObjectType>>,
    /// Index versions to check; defaults to every version the index reports
    pub versions: Option<Vec<u32>>,
    /// Sites to check; a single `None` entry means a single-site install
    pub sites: Vec<Option<i64>>,
}

impl Default for ValidationOptions {
    fn default() -> Self {
        Self {
            start_id: 1,
            last_id: None,
            batch_size: 500,
            max_diff_size: 1000,
            do_not_heal: false,
            force_parallel: false,
            mode: ValidationMode::All,
            object_types: None,
            versions: None,
            sites: vec![None],
        }
    }
}

/// Terminal state of a validation run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Aborted,
    /// At least one scope could not be validated
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Completed => "completed",
            RunStatus::Aborted => "aborted",
            RunStatus::Failed => "failed",
        }
    }
}

/// How a single scope ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum ScopeOutcome {
    /// Every batch up to the upper bound was compared
    Checked,
    /// The walk stopped early, on abort or once the diff cap was reached
    Partial,
    /// Not reached because the run stopped in an earlier scope
    NotChecked,
    Skipped { reason: SkipReason },
    Error { message: String },
}

/// Per-scope bookkeeping of a validation run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScopeSummary {
    pub scope: Scope,
    pub outcome: ScopeOutcome,
    pub db_total: u64,
    pub index_total: u64,
    /// Last id of the final fully compared batch; resume from the next one
    pub last_completed_id: Option<i64>,
    /// Objects re-enqueued to fix drift in this scope
    pub healed: usize,
}

impl ScopeSummary {
    pub fn new(scope: Scope) -> Self {
        Self {
            scope,
            outcome: ScopeOutcome::Checked,
            db_total: 0,
            index_total: 0,
            last_completed_id: None,
            healed: 0,
        }
    }

    pub fn not_checked(scope: Scope) -> Self {
        Self {
            outcome: ScopeOutcome::NotChecked,
            ..Self::new(scope)
        }
    }
}

/// Notice that the diff was cut at `max_diff_size`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TruncationNotice {
    pub reported: usize,
    pub total: usize,
    pub max_diff_size: usize,
}

impl fmt::Display for TruncationNotice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Truncated diff processing at {} out of {} since max_diff_size is {}",
            self.reported, self.total, self.max_diff_size
        )
    }
}

/// Result of a content validation run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    pub status: RunStatus,
    pub entries: Vec<DiffEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub truncation: Option<TruncationNotice>,
    pub scopes: Vec<ScopeSummary>,
}

impl ValidationReport {
    /// Build a report, cutting `entries` down to `max_diff_size`.
    pub fn new(
        status: RunStatus,
        mut entries: Vec<DiffEntry>,
        scopes: Vec<ScopeSummary>,
        max_diff_size: usize,
    ) -> Self {
        let truncation = if entries.len() > max_diff_size {
            let notice = TruncationNotice {
                reported: max_diff_size,
                total: entries.len(),
                max_diff_size,
            };
            entries.truncate(max_diff_size);
            Some(notice)
        } else {
            None
        };
        Self {
            status,
            entries,
            truncation,
            scopes,
        }
    }

    pub fn is_clean(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries that report an issue, leaving out skipped scopes.
    pub fn issues(&self) -> impl Iterator<Item = &DiffEntry> {
        self.entries.iter().filter(|entry| entry.issue.is_some())
    }
}

/// Store and index totals for one scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CountResult {
    pub db_total: u64,
    pub index_total: u64,
    /// `db_total - index_total`; positive when the index is behind
    pub diff: i64,
}

impl CountResult {
    pub fn new(db_total: u64, index_total: u64) -> Self {
        Self {
            db_total,
            index_total,
            diff: db_total as i64 - index_total as i64,
        }
    }

    pub fn is_consistent(&self) -> bool {
        self.diff == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum CountOutcome {
    Counted(CountResult),
    Skipped { reason: SkipReason },
    Error { message: String },
}

/// Count validation result for one scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CountReport {
    pub scope: Scope,
    pub outcome: CountOutcome,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scope() -> Scope {
        Scope::new(ObjectType::from("post"), 1)
    }

    #[test]
    fn test_mode_filters_issue_kinds() {
        assert!(ValidationMode::All.reports(Issue::OrphanedInIndex));
        assert!(ValidationMode::Missing.reports(Issue::MissingFromIndex));
        assert!(!ValidationMode::Missing.reports(Issue::Mismatch));
        assert!(ValidationMode::Mismatch.reports(Issue::Mismatch));
        assert!(!ValidationMode::Mismatch.reports(Issue::OrphanedInIndex));
    }

    #[test]
    fn test_report_truncates_with_notice() {
        let entries: Vec<DiffEntry> = (1..=10)
            .map(|id| DiffEntry::issue(&scope(), id, Issue::MissingFromIndex))
            .collect();
        let report = ValidationReport::new(RunStatus::Completed, entries, Vec::new(), 5);

        assert_eq!(report.entries.len(), 5);
        let notice = report.truncation.unwrap();
        assert_eq!(notice.reported, 5);
        assert_eq!(notice.total, 10);
        assert_eq!(
            notice.to_string(),
            "Truncated diff processing at 5 out of 10 since max_diff_size is 5"
        );
    }

    #[test]
    fn test_report_under_cap_has_no_notice() {
        let entries = vec![DiffEntry::skipped(&scope(), SkipReason::EmptyIndex)];
        let report = ValidationReport::new(RunStatus::Completed, entries, Vec::new(), 5);
        assert!(report.truncation.is_none());
        assert_eq!(report.issues().count(), 0);
    }

    #[test]
    fn test_diff_entry_serializes_flat() {
        let entry = DiffEntry::issue(&scope(), 3, Issue::Mismatch);
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["object_type"], "post");
        assert_eq!(json["object_id"], 3);
        assert_eq!(json["issue"], "mismatch");
        assert_eq!(json["skipped"], false);
        assert!(json.get("reason").is_none());
    }

    #[test]
    fn test_count_result_diff_sign() {
        assert_eq!(CountResult::new(10, 7).diff, 3);
        assert_eq!(CountResult::new(7, 10).diff, -3);
        assert!(CountResult::new(4, 4).is_consistent());
    }
}
