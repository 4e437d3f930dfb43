//! Re-index queue library
//!
//! Asynchronous re-indexing of store objects into a search index with
//! per-object rate limiting and batch dispatch, plus a consistency validator
//! that finds and heals drift between the store and the index.

pub mod cache;
pub mod clock;
pub mod config;
pub mod index_client;
pub mod index_queue;
pub mod metrics;
pub mod sqlite_persistence;
pub mod validator;

// Re-export commonly used types for convenience
pub use cache::{InMemoryCache, ObjectCache, SqliteObjectCache};
pub use clock::{Clock, ManualClock, SystemClock};
pub use index_client::{BulkIndexOutcome, Document, IdRange, IndexClient, Scope};
pub use index_queue::{IndexQueue, ObjectType, QueueWorker, RateLimiter, SqliteJobStore};
pub use validator::{ConsistencyValidator, ValidationError, ValidationOptions, ValidationReport};
