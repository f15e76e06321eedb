//! File-backed job record store for cloak.
//!
//! Every job lives in its own directory under `<root>/jobs/<id>/`:
//! - `job.json` - the record, always replaced atomically
//! - `logs.txt` - append-only log lines
//! - `.lock` - lease marker, present while a worker holds the job

mod atomic;
pub mod error;
mod lease;
mod logs;
mod store;

pub use error::{StoreError, StoreResult};
pub use store::JobStore;
