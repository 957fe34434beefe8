//! Slash-delimited store paths.

use crate::StoreError;

/// Validate `path` and split it into segments.
///
/// A valid path starts with `/`, has no empty segments and no trailing
/// slash. The root `/` is valid and has zero segments. Glob
/// metacharacters are not allowed in stored paths.
pub fn segments(path: &str) -> Result<Vec<&str>, StoreError> {
    let rest = path
        .strip_prefix('/')
        .ok_or_else(|| StoreError::Malformed(format!("path must start with '/': {path:?}")))?;
    if rest.is_empty() {
        return Ok(Vec::new());
    }
    let segs: Vec<&str> = rest.split('/').collect();
    for seg in &segs {
        if seg.is_empty() {
            return Err(StoreError::Malformed(format!(
                "empty path segment in {path:?}"
            )));
        }
        if seg.contains(['*', '?']) {
            return Err(StoreError::Malformed(format!(
                "glob character in path {path:?}"
            )));
        }
    }
    Ok(segs)
}

/// Join a parent path and a child segment.
pub fn join(parent: &str, child: &str) -> String {
    if parent == "/" {
        format!("/{child}")
    } else {
        format!("{parent}/{child}")
    }
}
