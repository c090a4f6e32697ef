//! SQLite-backed stores for the tideway pipeline
//!
//! A single database file holds every piece of shared state, so several
//! consumer processes can compete for partitions through it:
//! - Change feed: per-partition append-only records with monotonic tokens
//! - Leases and continuation tokens with version-checked updates
//! - Materialized views guarded by version tags
//! - Dead letters for batches that exhausted their attempts
//!
//! WAL mode and a busy timeout are enabled by default; lock contention that
//! outlasts the timeout surfaces as a transient error.

pub mod continuation;
pub mod dead_letter;
pub mod feed;
pub mod lease;
pub mod schema;
pub mod store;
pub mod view;

pub use dead_letter::StoredDeadLetter;
pub use store::SqliteStore;
