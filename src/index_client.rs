//! Boundary to the search backend.
//!
//! The queue only needs bulk upserts; the validator needs existence, counts
//! and ranged document fetches. Transport is the implementor's business.

use crate::index_queue::ObjectType;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Index version assumed when a backend does not version its indexes.
pub const DEFAULT_INDEX_VERSION: u32 = 1;

/// What a validation pass is bounded to: one object type, one index version
/// and, on multi-site installs, one site.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Scope {
    pub object_type: ObjectType,
    pub index_version: u32,
    pub site_id: Option<i64>,
}

impl Scope {
    pub fn new(object_type: ObjectType, index_version: u32) -> Self {
        Self {
            object_type,
            index_version,
            site_id: None,
        }
    }

    pub fn for_site(mut self, site_id: Option<i64>) -> Self {
        self.site_id = site_id;
        self
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} v{}", self.object_type, self.index_version)?;
        if let Some(site_id) = self.site_id {
            write!(f, " (site {})", site_id)?;
        }
        Ok(())
    }
}

/// Inclusive range of object identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdRange {
    pub start: i64,
    pub end: i64,
}

impl IdRange {
    pub fn new(start: i64, end: i64) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, id: i64) -> bool {
        id >= self.start && id <= self.end
    }
}

/// The comparable projection of an object, on either side of the sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub id: i64,
    pub content_hash: String,
}

impl Document {
    pub fn new(id: i64, content_hash: impl Into<String>) -> Self {
        Self {
            id,
            content_hash: content_hash.into(),
        }
    }
}

/// Per-document result of a bulk upsert, as far as the backend reports it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkIndexOutcome {
    /// Ids the backend explicitly reported as not indexed.
    pub failed_ids: Vec<i64>,
}

impl BulkIndexOutcome {
    pub fn all_succeeded() -> Self {
        Self::default()
    }

    pub fn with_failures(failed_ids: Vec<i64>) -> Self {
        Self { failed_ids }
    }
}

#[cfg_attr(test, mockall::automock)]
pub trait IndexClient: Send + Sync {
    /// Upsert the given objects into the active index for `object_type`.
    /// Must tolerate ids that are already indexed.
    fn bulk_index(&self, object_type: &ObjectType, object_ids: &[i64]) -> Result<BulkIndexOutcome>;

    fn index_exists(&self, scope: &Scope) -> Result<bool>;

    fn count(&self, scope: &Scope) -> Result<u64>;

    fn fetch_batch(&self, scope: &Scope, range: IdRange) -> Result<Vec<Document>>;

    /// Versions that exist for `object_type`. Unversioned backends keep the
    /// default single version.
    fn index_versions(&self, _object_type: &ObjectType) -> Result<Vec<u32>> {
        Ok(vec![DEFAULT_INDEX_VERSION])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_display() {
        let scope = Scope::new(ObjectType::from("post"), 2);
        assert_eq!(scope.to_string(), "post v2");
        assert_eq!(scope.for_site(Some(3)).to_string(), "post v2 (site 3)");
    }

    #[test]
    fn test_range_is_inclusive() {
        let range = IdRange::new(1, 500);
        assert!(range.contains(1));
        assert!(range.contains(500));
        assert!(!range.contains(501));
    }
}
