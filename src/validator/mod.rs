//! Consistency validation between the system of record and the search index.

mod error;
mod lock;
mod models;
mod registry;
#[allow(clippy::module_inception)]
mod validator;

pub use error::ValidationError;
pub use lock::{ValidationLock, ValidationLockGuard, DEFAULT_LOCK_TTL_SECS, VALIDATION_CACHE_GROUP};
pub use models::{
    CountOutcome, CountReport, CountResult, DiffEntry, Issue, RunStatus, ScopeOutcome,
    ScopeSummary, SkipReason, TruncationNotice, ValidationMode, ValidationOptions,
    ValidationReport,
};
pub use registry::{ObjectSource, ValidatorRegistry};
pub use validator::ConsistencyValidator;
