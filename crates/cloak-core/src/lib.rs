//! Core domain types and traits for the cloak obfuscation job runner.
//!
//! This crate contains:
//! - Job identifiers and the persisted job record
//! - Job status, run mode and partial-update types
//! - Technique kinds, selection and tuning knobs
//! - The `Technique` trait consumed by the pipeline dispatcher

pub mod error;
pub mod id;
pub mod job;
pub mod technique;

pub use error::{Error, Result};
pub use id::JobId;
pub use job::{Job, JobOutcome, JobStatus, JobUpdate, NewJob, RunMode};
pub use technique::{
    LogSink, ObfuscationLevel, Technique, TechniqueContext, TechniqueKind, TechniqueRegistry,
    TechniqueResult, TechniqueSelection, Tuning, UpxLevel,
};
