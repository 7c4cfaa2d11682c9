//! Remote path canonicalization and naming helpers shared by every component.
use std::path::Path;

/// Normalize a remote path:
/// - converts backslashes to forward slashes
/// - collapses repeated slashes
/// - resolves `.` and `..` (never climbing above root)
/// - always absolute, no trailing slash except for root itself
pub fn normalize_remote(p: &str) -> String {
    let s = p.replace('\\', "/");
    let mut parts: Vec<&str> = Vec::new();
    for seg in s.split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    if parts.is_empty() { "/".to_string() } else { format!("/{}", parts.join("/")) }
}

/// Compose `parent/child` and normalize. A `child` that is itself absolute
/// still nests under `parent`.
pub fn join_remote(parent: &str, child: &str) -> String {
    normalize_remote(&format!("{}/{}", parent, child))
}

/// Parent directory of a remote path; `None` for root.
pub fn parent_remote(p: &str) -> Option<String> {
    let n = normalize_remote(p);
    if n == "/" {
        return None;
    }
    match n.rfind('/') {
        Some(0) => Some("/".to_string()),
        Some(idx) => Some(n[..idx].to_string()),
        None => None,
    }
}

/// Last segment of a remote path; empty for root.
pub fn file_name_remote(p: &str) -> String {
    let n = normalize_remote(p);
    n.rsplit('/').next().unwrap_or("").to_string()
}

/// `child` relative to `root` using `/` separators, or `None` when `child`
/// is not under `root`.
pub fn relative_to_remote(root: &str, child: &str) -> Option<String> {
    let root = normalize_remote(root);
    let child = normalize_remote(child);
    if root == child {
        return Some(String::new());
    }
    let prefix = if root == "/" { "/".to_string() } else { format!("{}/", root) };
    child.strip_prefix(&prefix).map(|s| s.to_string())
}

/// Number of segments below root; used to order directories shallow-to-deep.
pub fn remote_depth(p: &str) -> usize {
    normalize_remote(p).split('/').filter(|s| !s.is_empty()).count()
}

/// Comparison key for local paths following the host filesystem's case
/// semantics: case-insensitive on Windows and macOS, case-sensitive elsewhere.
pub fn local_path_key(p: &Path) -> String {
    let s = p.to_string_lossy().replace('\\', "/");
    if cfg!(any(windows, target_os = "macos")) { s.to_lowercase() } else { s }
}

/// `foo.txt` -> `foo (n).txt`, `dir` -> `dir (n)`, `.bashrc` -> `.bashrc (n)`.
pub fn duplicate_name(name: &str, n: u32) -> String {
    match name.rfind('.') {
        Some(idx) if idx > 0 => format!("{} ({}){}", &name[..idx], n, &name[idx..]),
        _ => format!("{} ({})", name, n),
    }
}

/// Single-quote a string for a POSIX shell.
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

// Lightweight path display wrapper that renders with forward slashes.
pub(crate) struct DisplayPath<'a>(pub(crate) &'a Path);

impl std::fmt::Display for DisplayPath<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0.to_string_lossy().replace('\\', "/"))
    }
}

pub(crate) fn display_path(p: &Path) -> DisplayPath<'_> {
    DisplayPath(p)
}
