//! Common test infrastructure
//!
//! Every test gets an isolated harness with its own on-disk queue and cache
//! databases, a manual clock, an in-memory object store and a fake search
//! index. Tests should only import from this module.

mod fakes;
mod harness;

pub use fakes::{FakeCatalog, FakeIndex};
pub use harness::TestHarness;

pub const POST: &str = "post";
pub const USER: &str = "user";

/// Start of the manual clock in every harness
pub const START_TIME: i64 = 1_700_000_000;
