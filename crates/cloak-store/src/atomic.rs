use crate::{StoreError, StoreResult};
use serde::Serialize;
use std::io::Write;
use std::path::Path;

/// Serialize `value` as pretty JSON and replace `path` with it atomically.
///
/// The temp file is created next to `path` so the final rename never
/// crosses a filesystem. If anything fails before the rename, dropping the
/// `NamedTempFile` removes it.
pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> StoreResult<()> {
    let dir = path.parent().ok_or_else(|| {
        StoreError::InvalidInput(format!("{} has no parent directory", path.display()))
    })?;

    let mut tmp = tempfile::Builder::new()
        .prefix(".tmp")
        .suffix(".json")
        .tempfile_in(dir)?;

    serde_json::to_writer_pretty(&mut tmp, value)?;
    tmp.write_all(b"\n")?;
    tmp.flush()?;
    tmp.as_file().sync_all()?;

    tmp.persist(path).map_err(|e| StoreError::Io(e.error))?;
    Ok(())
}
