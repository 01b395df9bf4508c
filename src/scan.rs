use crate::registry::is_archive_path;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Recursive, depth-bounded listing of mod archives under `root`. The
/// designated ignored subdirectory and OS junk directories are skipped.
pub fn scan_folder(root: &Path, max_depth: usize, ignored_dir: &str) -> Vec<PathBuf> {
    let mut out = Vec::new();
    for entry in WalkDir::new(root).max_depth(max_depth) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(_) => continue,
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        if is_ignored_path(root, path, ignored_dir) {
            continue;
        }
        if is_archive_path(path) {
            out.push(path.to_path_buf());
        }
    }
    out.sort();
    out
}

fn is_ignored_path(root: &Path, path: &Path, ignored_dir: &str) -> bool {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative.components().any(|component| {
        let part = component.as_os_str().to_string_lossy();
        part.eq_ignore_ascii_case(ignored_dir)
            || part.eq_ignore_ascii_case("__MACOSX")
            || part == ".git"
            || part == ".svn"
    })
}
