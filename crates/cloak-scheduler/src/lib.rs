//! Job dispatching for cloak.
//!
//! The dispatcher drives a job's selected techniques and aggregates their
//! results; the worker polls the store for deferred jobs and hands them to
//! the dispatcher under a lease.

pub mod dispatcher;
pub mod error;
pub mod worker;

pub use dispatcher::{PipelineDispatcher, PipelineEvent, StoreLogSink};
pub use error::{DispatchError, DispatchResult};
pub use worker::Worker;
