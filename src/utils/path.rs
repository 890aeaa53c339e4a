//! Path normalization utilities.

use std::path::{Path, PathBuf};

/// Normalize a path for sandbox use.
/// Expands ~ to the home directory and resolves symlinks when possible.
pub fn normalize_path_for_sandbox(path: &str) -> String {
    let expanded = expand_home(path);

    match std::fs::canonicalize(&expanded) {
        Ok(canonical) => canonical.display().to_string(),
        Err(_) => expanded,
    }
}

/// Expand ~ to the home directory.
pub fn expand_home(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest).display().to_string();
        }
    } else if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home.display().to_string();
        }
    }
    path.to_string()
}

/// Check if a path contains glob characters.
pub fn contains_glob_chars(path: &str) -> bool {
    path.contains('*') || path.contains('?') || path.contains('[') || path.contains('!')
}

/// Check if a resolved symlink target escapes the original path boundary.
pub fn is_symlink_outside_boundary(original: &Path, resolved: &Path) -> bool {
    if resolved == Path::new("/") {
        return true;
    }

    if original.starts_with(resolved) && original != resolved {
        return true;
    }

    false
}

/// Canonicalize a path, following symlinks once. Returns None for paths that
/// do not exist or that resolve outside the filesystem root.
pub fn canonicalize_existing(path: &Path) -> Option<PathBuf> {
    let resolved = std::fs::canonicalize(path).ok()?;
    if !resolved.is_absolute() {
        return None;
    }
    Some(resolved)
}
