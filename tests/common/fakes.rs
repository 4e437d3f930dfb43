//! In-memory stand-ins for the system of record and the search backend.

use anyhow::{bail, Result};
use reindex_queue::index_client::{
    BulkIndexOutcome, Document, IdRange, IndexClient, Scope, DEFAULT_INDEX_VERSION,
};
use reindex_queue::index_queue::ObjectType;
use reindex_queue::validator::{ObjectSource, ValidationLock};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};

type Docs = BTreeMap<i64, String>;

fn range_docs(docs: Option<&Docs>, range: IdRange) -> Vec<Document> {
    docs.map(|docs| {
        docs.range(range.start..=range.end)
            .map(|(id, hash)| Document::new(*id, hash.clone()))
            .collect()
    })
    .unwrap_or_default()
}

/// The system of record: content hashes keyed by type and id.
#[derive(Default)]
pub struct FakeCatalog {
    docs: Mutex<HashMap<String, Docs>>,
}

impl FakeCatalog {
    pub fn put(&self, object_type: &str, id: i64, hash: &str) {
        self.docs
            .lock()
            .unwrap()
            .entry(object_type.to_string())
            .or_default()
            .insert(id, hash.to_string());
    }

    pub fn get(&self, object_type: &str, id: i64) -> Option<String> {
        self.docs
            .lock()
            .unwrap()
            .get(object_type)
            .and_then(|docs| docs.get(&id).cloned())
    }

    pub fn source(self: &Arc<Self>, object_type: &str) -> Arc<dyn ObjectSource> {
        Arc::new(CatalogSource {
            object_type: ObjectType::from(object_type),
            catalog: self.clone(),
        })
    }
}

struct CatalogSource {
    object_type: ObjectType,
    catalog: Arc<FakeCatalog>,
}

impl ObjectSource for CatalogSource {
    fn object_type(&self) -> ObjectType {
        self.object_type.clone()
    }

    fn count(&self, _site_id: Option<i64>) -> Result<u64> {
        let docs = self.catalog.docs.lock().unwrap();
        Ok(docs.get(self.object_type.as_str()).map_or(0, |d| d.len() as u64))
    }

    fn max_id(&self, _site_id: Option<i64>) -> Result<Option<i64>> {
        let docs = self.catalog.docs.lock().unwrap();
        Ok(docs
            .get(self.object_type.as_str())
            .and_then(|d| d.keys().next_back().copied()))
    }

    fn fetch_batch(&self, _site_id: Option<i64>, range: IdRange) -> Result<Vec<Document>> {
        let docs = self.catalog.docs.lock().unwrap();
        Ok(range_docs(docs.get(self.object_type.as_str()), range))
    }
}

/// Search backend with a single index version per type. Bulk upserts copy
/// the current catalog content, so a dispatched job really fixes drift.
pub struct FakeIndex {
    catalog: Arc<FakeCatalog>,
    docs: Mutex<HashMap<String, Docs>>,
    rejected_ids: Mutex<HashSet<i64>>,
    failing: Mutex<bool>,
    bulk_calls: Mutex<Vec<(ObjectType, Vec<i64>)>>,
    fetches: Mutex<usize>,
    abort_after_fetches: Mutex<Option<(usize, Arc<ValidationLock>)>>,
}

impl FakeIndex {
    pub fn new(catalog: Arc<FakeCatalog>) -> Self {
        Self {
            catalog,
            docs: Mutex::new(HashMap::new()),
            rejected_ids: Mutex::new(HashSet::new()),
            failing: Mutex::new(false),
            bulk_calls: Mutex::new(Vec::new()),
            fetches: Mutex::new(0),
            abort_after_fetches: Mutex::new(None),
        }
    }

    pub fn create_index(&self, object_type: &str) {
        self.docs
            .lock()
            .unwrap()
            .entry(object_type.to_string())
            .or_default();
    }

    pub fn put(&self, object_type: &str, id: i64, hash: &str) {
        self.docs
            .lock()
            .unwrap()
            .entry(object_type.to_string())
            .or_default()
            .insert(id, hash.to_string());
    }

    pub fn remove(&self, object_type: &str, id: i64) {
        if let Some(docs) = self.docs.lock().unwrap().get_mut(object_type) {
            docs.remove(&id);
        }
    }

    pub fn get(&self, object_type: &str, id: i64) -> Option<String> {
        self.docs
            .lock()
            .unwrap()
            .get(object_type)
            .and_then(|docs| docs.get(&id).cloned())
    }

    /// Report these ids as failed in every bulk response, without indexing
    /// them.
    pub fn reject(&self, ids: &[i64]) {
        self.rejected_ids.lock().unwrap().extend(ids.iter().copied());
    }

    pub fn accept_all(&self) {
        self.rejected_ids.lock().unwrap().clear();
    }

    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock().unwrap() = failing;
    }

    pub fn bulk_calls(&self) -> Vec<(ObjectType, Vec<i64>)> {
        self.bulk_calls.lock().unwrap().clone()
    }

    /// Request an abort through `lock` once `fetches` index batches were read.
    pub fn abort_after_fetches(&self, fetches: usize, lock: Arc<ValidationLock>) {
        *self.abort_after_fetches.lock().unwrap() = Some((fetches, lock));
    }
}

impl IndexClient for FakeIndex {
    fn bulk_index(&self, object_type: &ObjectType, object_ids: &[i64]) -> Result<BulkIndexOutcome> {
        self.bulk_calls
            .lock()
            .unwrap()
            .push((object_type.clone(), object_ids.to_vec()));
        if *self.failing.lock().unwrap() {
            bail!("connection refused");
        }

        let rejected = self.rejected_ids.lock().unwrap().clone();
        let mut failed_ids = Vec::new();
        let mut docs = self.docs.lock().unwrap();
        let index = docs.entry(object_type.to_string()).or_default();
        for &id in object_ids {
            if rejected.contains(&id) {
                failed_ids.push(id);
                continue;
            }
            match self.catalog.get(object_type.as_str(), id) {
                Some(hash) => {
                    index.insert(id, hash);
                }
                None => {
                    index.remove(&id);
                }
            }
        }
        Ok(BulkIndexOutcome::with_failures(failed_ids))
    }

    fn index_exists(&self, scope: &Scope) -> Result<bool> {
        Ok(scope.index_version == DEFAULT_INDEX_VERSION
            && self
                .docs
                .lock()
                .unwrap()
                .contains_key(scope.object_type.as_str()))
    }

    fn count(&self, scope: &Scope) -> Result<u64> {
        let docs = self.docs.lock().unwrap();
        Ok(docs
            .get(scope.object_type.as_str())
            .map_or(0, |d| d.len() as u64))
    }

    fn fetch_batch(&self, scope: &Scope, range: IdRange) -> Result<Vec<Document>> {
        let batch = {
            let docs = self.docs.lock().unwrap();
            range_docs(docs.get(scope.object_type.as_str()), range)
        };

        let mut fetches = self.fetches.lock().unwrap();
        *fetches += 1;
        if let Some((after, lock)) = self.abort_after_fetches.lock().unwrap().as_ref() {
            if *fetches == *after {
                lock.request_abort().unwrap();
            }
        }
        Ok(batch)
    }
}
