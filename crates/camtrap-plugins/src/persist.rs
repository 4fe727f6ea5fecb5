//! JSON documents replaced atomically on disk.

use camtrap_core::PersistenceError;
use serde::Serialize;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// Directory holding `path`, `.` for a bare file name
pub(crate) fn parent_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

/// Writes `value` as pretty JSON to a temp file next to `path`, then renames
/// it over `path`. Readers see either the old or the new document.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), PersistenceError> {
    let shown = path.display().to_string();
    let dir = parent_dir(path);
    fs::create_dir_all(&dir).map_err(|e| PersistenceError::write_failed(&shown, e.to_string()))?;

    let mut tmp =
        NamedTempFile::new_in(&dir).map_err(|e| PersistenceError::write_failed(&shown, e.to_string()))?;
    serde_json::to_writer_pretty(&mut tmp, value)
        .map_err(|e| PersistenceError::write_failed(&shown, e.to_string()))?;
    tmp.write_all(b"\n")
        .and_then(|_| tmp.as_file().sync_all())
        .map_err(|e| PersistenceError::write_failed(&shown, e.to_string()))?;
    tmp.persist(path)
        .map_err(|e| PersistenceError::write_failed(&shown, e.error.to_string()))?;
    Ok(())
}
