//! Deterministic, idempotent path normalization and module-path derivation.
//!
//! Collapse repeated separators, collapse `./` components, collapse a
//! `name/../` pair against its preceding real component (never against
//! another `..`), strip a leading `./`, and use `/` as the canonical
//! separator. The instruction stream is never persisted to disk, so there
//! is no cross-platform wire format to preserve -- `/` is used
//! unconditionally.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PathError {
    #[error("module path component contains a '.': {0:?}")]
    DotInComponent(String),
}

/// Normalize a slash-separated path: remove redundant `.`/`..`/empty
/// components where possible.
pub fn normalize(path: &str) -> String {
    let is_absolute = path.starts_with('/');
    let mut out: Vec<&str> = Vec::new();
    for comp in path.split(['/', '\\']) {
        match comp {
            "" | "." => continue,
            ".." => {
                match out.last() {
                    Some(&last) if last != ".." => {
                        out.pop();
                    }
                    _ if is_absolute => {
                        // can't go above root; drop it
                    }
                    _ => out.push(".."),
                }
            }
            other => out.push(other),
        }
    }
    let joined = out.join("/");
    if is_absolute {
        format!("/{}", joined)
    } else if joined.is_empty() {
        ".".to_string()
    } else {
        joined
    }
}

/// Derive a dotted module path from a file path relative to its
/// sub-project directory: strip the `.ember` source extension, normalize,
/// reject any remaining `.` inside a component, then join components with
/// `.`.
pub fn derive_module_path(relative_path: &str) -> Result<String, PathError> {
    let stripped = relative_path.strip_suffix(".ember").unwrap_or(relative_path);
    let normalized = normalize(stripped);
    let components: Vec<&str> = normalized.split('/').filter(|c| !c.is_empty()).collect();
    for comp in &components {
        if comp.contains('.') {
            return Err(PathError::DotInComponent((*comp).to_string()));
        }
    }
    Ok(components.join("."))
}

/// Compute `file_path` relative to `project_dir`:
/// strip the project directory prefix, then normalize what remains.
pub fn relative_to(file_path: &str, project_dir: &str) -> String {
    let normalized_file = normalize(file_path);
    let normalized_dir = normalize(project_dir);
    let stripped = normalized_file.strip_prefix(&normalized_dir).unwrap_or(&normalized_file);
    normalize(stripped.trim_start_matches('/'))
}

/// Normalize a file URI for use as a dedup key in the fileuri table.
/// Deterministic and idempotent: `normalize_uri(normalize_uri(x)) ==
/// normalize_uri(x)`.
pub fn normalize_uri(uri: &str) -> String {
    if let Some(rest) = uri.strip_prefix("file://") {
        format!("file://{}", normalize(rest))
    } else {
        normalize(uri)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collapses_double_slashes_and_trailing_dotdot() {
        assert_eq!(normalize("u//abc/def/..u/../.."), "u/abc");
    }

    #[test]
    fn preserves_leading_dotdot_it_cannot_resolve() {
        assert_eq!(normalize("../abc/def/..u/../.."), "../abc");
    }

    #[test]
    fn module_path_round_trip() {
        assert_eq!(derive_module_path("foo/bar.ember").unwrap(), "foo.bar");
    }

    #[test]
    fn module_path_rejects_dot_in_component() {
        assert!(derive_module_path("foo/bar.baz/qux.ember").is_err());
    }

    #[test]
    fn relative_to_strips_project_dir() {
        assert_eq!(relative_to("proj/foo/bar.ember", "proj"), "foo/bar.ember");
    }

    #[test]
    fn normalize_is_idempotent() {
        let once = normalize("u//abc/def/..u/../..");
        assert_eq!(normalize(&once), once);
    }
}
