//! Append-only per-job log.

use crate::{JobStore, StoreError, StoreResult};
use chrono::Local;
use cloak_core::JobId;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};

impl JobStore {
    /// Append one `[HH:MM:SS] message` line and return it.
    pub fn append_log(&self, id: &JobId, message: &str) -> StoreResult<String> {
        if !self.job_dir(id).is_dir() {
            return Err(StoreError::NotFound(*id));
        }

        let entry = format!("[{}] {}", Local::now().format("%H:%M:%S"), message);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_path(id))?;
        // One write per line so concurrent appenders never interleave mid-line
        file.write_all(format!("{entry}\n").as_bytes())?;
        Ok(entry)
    }

    /// Log lines in write order. Empty if nothing has been logged.
    pub fn logs(&self, id: &JobId) -> StoreResult<Vec<String>> {
        match fs::read_to_string(self.log_path(id)) {
            Ok(text) => Ok(text.lines().map(str::to_string).collect()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }
}
