//! Store-vs-index consistency validation.
//!
//! A content run walks each scope (object type, index version, site) in id
//! ranges of `batch_size`, compares the stored objects against the indexed
//! documents of the same range and classifies every difference. Drift that a
//! re-index fixes is healed by re-enqueuing the object. Only one run may hold
//! the lock at a time; an abort request is honored at batch boundaries.

use super::error::ValidationError;
use super::lock::{ValidationLock, ValidationLockGuard};
use super::models::{
    CountOutcome, CountReport, CountResult, DiffEntry, Issue, RunStatus, ScopeOutcome,
    ScopeSummary, SkipReason, ValidationOptions, ValidationReport,
};
use super::registry::{ObjectSource, ValidatorRegistry};
use crate::index_client::{Document, IdRange, IndexClient, Scope, DEFAULT_INDEX_VERSION};
use crate::index_queue::{IndexQueue, ObjectType};
use crate::metrics;
use anyhow::Result;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// How the walk over a scope ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WalkEnd {
    Finished,
    Aborted,
    DiffCapReached,
}

pub struct ConsistencyValidator {
    registry: ValidatorRegistry,
    index_client: Arc<dyn IndexClient>,
    queue: Arc<IndexQueue>,
    lock: Arc<ValidationLock>,
}

impl ConsistencyValidator {
    pub fn new(
        registry: ValidatorRegistry,
        index_client: Arc<dyn IndexClient>,
        queue: Arc<IndexQueue>,
        lock: Arc<ValidationLock>,
    ) -> Self {
        Self {
            registry,
            index_client,
            queue,
            lock,
        }
    }

    pub fn lock(&self) -> &Arc<ValidationLock> {
        &self.lock
    }

    /// Compare store and index contents and heal the drift found.
    ///
    /// Backend failures on a scope are recorded in that scope's summary and
    /// the run moves on; the report status is then `Failed`. An abort
    /// request ends the run with `ValidationError::Aborted`, which carries
    /// the entries found so far.
    pub fn validate_contents(
        &self,
        options: &ValidationOptions,
    ) -> Result<ValidationReport, ValidationError> {
        let object_types = self.check_options(options)?;
        if options.batch_size <= 0 {
            return Err(ValidationError::InvalidOptions(
                "batch_size must be positive".to_string(),
            ));
        }
        if matches!(options.last_id, Some(last_id) if last_id < options.start_id) {
            return Err(ValidationError::InvalidOptions(
                "last_id must not be lower than start_id".to_string(),
            ));
        }

        let mut guard = self.lock.acquire(options.force_parallel)?;
        info!(
            "Starting content validation of {} object types (batch_size={}, heal={})",
            object_types.len(),
            options.batch_size,
            !options.do_not_heal
        );

        let mut entries = Vec::new();
        let mut scopes = Vec::new();
        let mut end = WalkEnd::Finished;

        // Once the run stops, the remaining scopes are still listed so the
        // report shows what was left unchecked
        for object_type in &object_types {
            let Some(source) = self.registry.get(object_type) else {
                continue;
            };
            for &site_id in &options.sites {
                let versions = match self.versions_for(object_type, options) {
                    Ok(versions) => versions,
                    Err(e) => {
                        let scope = Scope::new(object_type.clone(), DEFAULT_INDEX_VERSION)
                            .for_site(site_id);
                        warn!("Failed to list index versions for {}: {}", scope, e);
                        let summary = if end == WalkEnd::Finished {
                            let mut summary = ScopeSummary::new(scope);
                            summary.outcome = ScopeOutcome::Error {
                                message: format!("{:#}", e),
                            };
                            summary
                        } else {
                            ScopeSummary::not_checked(scope)
                        };
                        scopes.push(summary);
                        continue;
                    }
                };

                for index_version in versions {
                    let scope = Scope::new(object_type.clone(), index_version).for_site(site_id);
                    if end == WalkEnd::Finished && self.lock.is_abort_requested() {
                        end = WalkEnd::Aborted;
                    }
                    if end != WalkEnd::Finished {
                        scopes.push(ScopeSummary::not_checked(scope));
                        continue;
                    }
                    let (summary, scope_end) =
                        self.validate_scope(source.as_ref(), scope, options, &mut guard, &mut entries);
                    scopes.push(summary);
                    end = scope_end;
                }
            }
        }
        drop(guard);

        let not_checked = scopes
            .iter()
            .filter(|s| s.outcome == ScopeOutcome::NotChecked)
            .count();
        if not_checked > 0 {
            warn!(
                "Content validation stopped early, {} of {} scopes were not checked",
                not_checked,
                scopes.len()
            );
        }

        let status = if end == WalkEnd::Aborted {
            RunStatus::Aborted
        } else if scopes
            .iter()
            .any(|s| matches!(s.outcome, ScopeOutcome::Error { .. }))
        {
            RunStatus::Failed
        } else {
            RunStatus::Completed
        };
        if end == WalkEnd::DiffCapReached {
            info!(
                "Stopped content validation after {} diff entries (max_diff_size={})",
                entries.len(),
                options.max_diff_size
            );
        }

        metrics::record_validation_run(status.as_str());
        let report = ValidationReport::new(status, entries, scopes, options.max_diff_size);
        info!(
            "Content validation {} with {} diff entries",
            status.as_str(),
            report.entries.len()
        );

        if status == RunStatus::Aborted {
            return Err(ValidationError::Aborted {
                report: Box::new(report),
            });
        }
        Ok(report)
    }

    /// Compare store and index totals for every scope.
    pub fn validate_counts(
        &self,
        options: &ValidationOptions,
    ) -> Result<Vec<CountReport>, ValidationError> {
        let object_types = self.check_options(options)?;
        let mut reports = Vec::new();

        for object_type in &object_types {
            let Some(source) = self.registry.get(object_type) else {
                continue;
            };
            for &site_id in &options.sites {
                let versions = match self.versions_for(object_type, options) {
                    Ok(versions) => versions,
                    Err(e) => {
                        reports.push(CountReport {
                            scope: Scope::new(object_type.clone(), DEFAULT_INDEX_VERSION)
                                .for_site(site_id),
                            outcome: CountOutcome::Error {
                                message: format!("{:#}", e),
                            },
                        });
                        continue;
                    }
                };
                for index_version in versions {
                    let scope = Scope::new(object_type.clone(), index_version).for_site(site_id);
                    let outcome = match self.count_scope(source.as_ref(), &scope) {
                        Ok(outcome) => outcome,
                        Err(e) => {
                            warn!("Count validation of {} failed: {}", scope, e);
                            CountOutcome::Error {
                                message: format!("{:#}", e),
                            }
                        }
                    };
                    reports.push(CountReport { scope, outcome });
                }
            }
        }
        Ok(reports)
    }

    fn count_scope(&self, source: &dyn ObjectSource, scope: &Scope) -> Result<CountOutcome> {
        if !self.index_client.index_exists(scope)? {
            return Ok(CountOutcome::Skipped {
                reason: SkipReason::IndexNotFound,
            });
        }
        let db_total = source.count(scope.site_id)?;
        let index_total = self.index_client.count(scope)?;
        if index_total == 0 && db_total > 0 {
            return Ok(CountOutcome::Skipped {
                reason: SkipReason::EmptyIndex,
            });
        }
        let result = CountResult::new(db_total, index_total);
        if !result.is_consistent() {
            warn!(
                "Count mismatch for {} (DB: {}, index: {}, diff: {})",
                scope, db_total, index_total, result.diff
            );
        }
        Ok(CountOutcome::Counted(result))
    }

    /// Validate the options shared by content and count runs, returning the
    /// object types to check.
    fn check_options(&self, options: &ValidationOptions) -> Result<Vec<ObjectType>, ValidationError> {
        if options.sites.is_empty() {
            return Err(ValidationError::InvalidOptions(
                "at least one site is required".to_string(),
            ));
        }
        // Sites may run differing index versions
        if options.versions.is_some() && options.sites.len() > 1 {
            return Err(ValidationError::InvalidOptions(
                "explicit versions cannot be combined with more than one site".to_string(),
            ));
        }

        let object_types = match &options.object_types {
            Some(types) => types.clone(),
            None => self.registry.object_types(),
        };
        if let Some(unknown) = object_types
            .iter()
            .find(|object_type| self.registry.get(object_type).is_none())
        {
            return Err(ValidationError::InvalidOptions(format!(
                "no object source registered for '{}'",
                unknown
            )));
        }
        Ok(object_types)
    }

    fn versions_for(&self, object_type: &ObjectType, options: &ValidationOptions) -> Result<Vec<u32>> {
        match &options.versions {
            Some(versions) => Ok(versions.clone()),
            None => self.index_client.index_versions(object_type),
        }
    }

    fn validate_scope(
        &self,
        source: &dyn ObjectSource,
        scope: Scope,
        options: &ValidationOptions,
        guard: &mut ValidationLockGuard<'_>,
        entries: &mut Vec<DiffEntry>,
    ) -> (ScopeSummary, WalkEnd) {
        let mut summary = ScopeSummary::new(scope);
        match self.walk_scope(source, options, guard, entries, &mut summary) {
            Ok(end) => {
                if end != WalkEnd::Finished {
                    summary.outcome = ScopeOutcome::Partial;
                }
                (summary, end)
            }
            Err(e) => {
                warn!("Content validation of {} failed: {:#}", summary.scope, e);
                summary.outcome = ScopeOutcome::Error {
                    message: format!("{:#}", e),
                };
                (summary, WalkEnd::Finished)
            }
        }
    }

    fn walk_scope(
        &self,
        source: &dyn ObjectSource,
        options: &ValidationOptions,
        guard: &mut ValidationLockGuard<'_>,
        entries: &mut Vec<DiffEntry>,
        summary: &mut ScopeSummary,
    ) -> Result<WalkEnd> {
        let scope = summary.scope.clone();

        if !self.index_client.index_exists(&scope)? {
            info!("Skipping {}: index not found", scope);
            self.skip_scope(summary, entries, SkipReason::IndexNotFound);
            return Ok(WalkEnd::Finished);
        }

        summary.db_total = source.count(scope.site_id)?;
        summary.index_total = self.index_client.count(&scope)?;
        if summary.index_total == 0 && summary.db_total > 0 {
            info!("Skipping {}: index is empty", scope);
            self.skip_scope(summary, entries, SkipReason::EmptyIndex);
            return Ok(WalkEnd::Finished);
        }

        let last_id = match options.last_id {
            Some(last_id) => last_id,
            None => match source.max_id(scope.site_id)? {
                Some(max_id) => max_id,
                None => {
                    if summary.index_total > 0 {
                        warn!(
                            "{} has no stored objects but {} indexed documents",
                            scope, summary.index_total
                        );
                    }
                    return Ok(WalkEnd::Finished);
                }
            },
        };

        info!(
            "Validating {} ids {}..={} (DB: {}, index: {})",
            scope, options.start_id, last_id, summary.db_total, summary.index_total
        );

        let mut batch_start = options.start_id;
        while batch_start <= last_id {
            let batch_end = batch_start
                .saturating_add(options.batch_size - 1)
                .min(last_id);
            let range = IdRange::new(batch_start, batch_end);

            let stored = source.fetch_batch(scope.site_id, range)?;
            let indexed = self.index_client.fetch_batch(&scope, range)?;
            let batch_entries =
                self.compare_batch(source, &scope, range, &stored, &indexed, options);
            debug!(
                "{} ids {}..={}: {} stored, {} indexed, {} diff entries",
                scope,
                range.start,
                range.end,
                stored.len(),
                indexed.len(),
                batch_entries.len()
            );

            if !options.do_not_heal {
                summary.healed += self.heal(&scope.object_type, &batch_entries);
            }
            for entry in &batch_entries {
                if let Some(issue) = entry.issue {
                    metrics::record_diff_entry(issue.as_str());
                }
            }
            entries.extend(batch_entries);
            summary.last_completed_id = Some(range.end);
            guard.refresh();

            if entries.len() > options.max_diff_size {
                return Ok(WalkEnd::DiffCapReached);
            }
            if self.lock.is_abort_requested() {
                info!("Abort requested, stopping content validation after {}", range.end);
                return Ok(WalkEnd::Aborted);
            }

            batch_start = match range.end.checked_add(1) {
                Some(next) => next,
                None => break,
            };
        }
        Ok(WalkEnd::Finished)
    }

    fn skip_scope(&self, summary: &mut ScopeSummary, entries: &mut Vec<DiffEntry>, reason: SkipReason) {
        entries.push(DiffEntry::skipped(&summary.scope, reason));
        summary.outcome = ScopeOutcome::Skipped { reason };
    }

    /// Classify the differences of one id range. Missing objects come first,
    /// then mismatches, then orphans, each in id order.
    ///
    /// Documents outside `range` are ignored; they belong to another batch.
    fn compare_batch(
        &self,
        source: &dyn ObjectSource,
        scope: &Scope,
        range: IdRange,
        stored: &[Document],
        indexed: &[Document],
        options: &ValidationOptions,
    ) -> Vec<DiffEntry> {
        let stored: Vec<&Document> = stored.iter().filter(|d| range.contains(d.id)).collect();
        let indexed: Vec<&Document> = indexed.iter().filter(|d| range.contains(d.id)).collect();

        let indexed_by_id: HashMap<i64, &Document> = indexed.iter().map(|d| (d.id, *d)).collect();
        let stored_ids: HashSet<i64> = stored.iter().map(|d| d.id).collect();

        let mut stored_sorted = stored;
        stored_sorted.sort_by_key(|d| d.id);

        let mut missing = Vec::new();
        let mut mismatched = Vec::new();
        for doc in stored_sorted {
            match indexed_by_id.get(&doc.id) {
                None => missing.push(doc.id),
                Some(indexed_doc) if !source.matches(doc, indexed_doc) => mismatched.push(doc.id),
                Some(_) => {}
            }
        }

        let mut orphaned: Vec<i64> = indexed
            .iter()
            .map(|d| d.id)
            .filter(|id| !stored_ids.contains(id))
            .collect();
        orphaned.sort_unstable();

        [
            (Issue::MissingFromIndex, missing),
            (Issue::Mismatch, mismatched),
            (Issue::OrphanedInIndex, orphaned),
        ]
        .into_iter()
        .filter(|(issue, _)| options.mode.reports(*issue))
        .flat_map(|(issue, ids)| {
            ids.into_iter()
                .map(move |id| DiffEntry::issue(scope, id, issue))
        })
        .collect()
    }

    /// Re-enqueue every object whose drift a re-index fixes. Returns how many
    /// objects were handed to the queue.
    fn heal(&self, object_type: &ObjectType, batch_entries: &[DiffEntry]) -> usize {
        let mut healed = 0;
        for entry in batch_entries {
            let (Some(object_id), Some(issue)) = (entry.object_id, entry.issue) else {
                continue;
            };
            if !issue.is_healable() {
                continue;
            }
            match self.queue.enqueue(object_id, object_type) {
                Ok(_) => healed += 1,
                Err(e) => warn!("Failed to enqueue {} {} for healing: {}", object_type, object_id, e),
            }
        }
        healed
    }
}
