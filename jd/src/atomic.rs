//! Atomic file replacement
//!
//! Job files are edited while humans may have them open. Writes go to a
//! temporary sibling first and are renamed over the target so a reader never
//! sees a half-written document.

use std::fs;
use std::io::Write;
use std::path::Path;

use tracing::debug;

use crate::error::{DocError, DocResult};

/// Read a document as UTF-8 text
pub fn read_document(path: &Path) -> DocResult<String> {
    debug!(?path, "read_document: called");
    fs::read_to_string(path).map_err(|e| DocError::io(path, e))
}

/// Replace `path` with `contents`, keeping the existing file's permissions
pub fn write_atomic(path: &Path, contents: &str) -> DocResult<()> {
    debug!(?path, len = contents.len(), "write_atomic: called");
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("document");

    let mut tmp = tempfile::Builder::new()
        .prefix(&format!(".{}.tmp-", name))
        .tempfile_in(dir)
        .map_err(|e| DocError::io(dir, e))?;

    tmp.write_all(contents.as_bytes()).map_err(|e| DocError::io(tmp.path(), e))?;
    tmp.as_file().sync_all().map_err(|e| DocError::io(tmp.path(), e))?;

    if let Ok(meta) = fs::metadata(path) {
        debug!("write_atomic: preserving permissions of existing file");
        fs::set_permissions(tmp.path(), meta.permissions()).map_err(|e| DocError::io(tmp.path(), e))?;
    }

    tmp.persist(path).map_err(|e| DocError::io(path, e.error))?;
    Ok(())
}
