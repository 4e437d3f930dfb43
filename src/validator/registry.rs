//! Store-side capabilities of each validated object type.
//!
//! Adding an object type to validation means registering an [`ObjectSource`]
//! for it.

use crate::index_client::{Document, IdRange};
use crate::index_queue::ObjectType;
use anyhow::Result;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Read access to the system of record for one object type.
pub trait ObjectSource: Send + Sync {
    fn object_type(&self) -> ObjectType;

    /// Number of indexable objects.
    fn count(&self, site_id: Option<i64>) -> Result<u64>;

    /// Highest object id, `None` if there are no objects.
    fn max_id(&self, site_id: Option<i64>) -> Result<Option<i64>>;

    /// Indexable objects with ids in `range`.
    fn fetch_batch(&self, site_id: Option<i64>, range: IdRange) -> Result<Vec<Document>>;

    /// Whether the indexed copy is up to date with the stored object.
    fn matches(&self, stored: &Document, indexed: &Document) -> bool {
        stored.content_hash == indexed.content_hash
    }
}

#[derive(Default, Clone)]
pub struct ValidatorRegistry {
    sources: BTreeMap<ObjectType, Arc<dyn ObjectSource>>,
}

impl ValidatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a source, replacing any earlier one for the same type.
    pub fn register(&mut self, source: Arc<dyn ObjectSource>) {
        self.sources.insert(source.object_type(), source);
    }

    pub fn get(&self, object_type: &ObjectType) -> Option<&Arc<dyn ObjectSource>> {
        self.sources.get(object_type)
    }

    /// Registered types, in name order.
    pub fn object_types(&self) -> Vec<ObjectType> {
        self.sources.keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}
