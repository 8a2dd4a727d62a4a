//! Validation of agent-supplied sandbox paths.

use std::path::{Component, Path};

/// Check that `path` stays inside the sandbox working root.
///
/// Accepts non-empty relative paths made of normal components (`.` is
/// tolerated). Rejects absolute paths, `..`, and Windows prefixes.
pub fn validate_relative_path(path: &str) -> Result<(), String> {
    if path.trim().is_empty() {
        return Err("path must not be empty".to_string());
    }
    let mut normal = 0usize;
    for component in Path::new(path).components() {
        match component {
            Component::Normal(_) => normal += 1,
            Component::CurDir => {}
            Component::ParentDir => {
                return Err(format!("path '{path}' must not contain '..'"));
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(format!("path '{path}' must be relative to the sandbox root"));
            }
        }
    }
    if normal == 0 {
        return Err(format!("path '{path}' does not name a file"));
    }
    Ok(())
}
