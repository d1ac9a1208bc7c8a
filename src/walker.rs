//! Filesystem walker.
//!
//! Produces the filtered, deterministically ordered file list that the
//! Merkle tree and the indexer operate on. Include/exclude patterns are
//! globs relative to the walk root; VCS and dependency directories are
//! excluded by default.

use std::path::{Path, PathBuf};

use globset::{Glob, GlobSet, GlobSetBuilder};
use walkdir::WalkDir;

use crate::error::{Error, Result};
use crate::pathsafe::is_path_safe;

/// Directories and files excluded from every walk regardless of
/// configuration.
pub const DEFAULT_EXCLUDES: &[&str] = &[
    "**/.git/**",
    "**/.hg/**",
    "**/.svn/**",
    "**/node_modules/**",
    "**/target/**",
    "**/vendor/**",
    "**/__pycache__/**",
    "**/.idea/**",
    "**/.vscode/**",
    "**/*.lock",
];

/// Options controlling a walk.
#[derive(Debug, Clone)]
pub struct WalkOptions {
    /// Glob patterns a file must match at least one of. Empty means
    /// everything is included.
    pub include: Vec<String>,
    /// Glob patterns that reject a file, applied after the defaults.
    pub exclude: Vec<String>,
    /// Maximum file size in bytes; 0 means unbounded.
    pub max_file_size: u64,
}

impl Default for WalkOptions {
    fn default() -> Self {
        Self {
            include: Vec::new(),
            exclude: Vec::new(),
            max_file_size: 1024 * 1024,
        }
    }
}

/// A single regular file found by [`walk`].
#[derive(Debug, Clone)]
pub struct WalkedFile {
    /// Path relative to the walk root, with `/` separators.
    pub relative_path: String,
    /// Absolute path on disk.
    pub absolute_path: PathBuf,
    /// File size in bytes.
    pub size: u64,
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern).map_err(|e| {
            Error::invalid_params(format!("invalid glob pattern '{pattern}': {e}"))
        })?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|e| Error::invalid_params(format!("invalid glob set: {e}")))
}

/// Returns `true` when any path component starts with a dot.
fn is_hidden(relative: &str) -> bool {
    relative
        .split('/')
        .any(|part| part.starts_with('.') && part != "." && part != "..")
}

/// Walk `root` and return every regular file that passes the filters,
/// sorted lexicographically by relative path.
///
/// Per-entry filesystem errors are logged and skipped; a missing or
/// unreadable root is fatal. Symlinks are never followed.
pub fn walk(root: &Path, opts: &WalkOptions) -> Result<Vec<WalkedFile>> {
    if !root.is_dir() {
        return Err(Error::not_found(format!(
            "walk root is not a directory: {}",
            root.display()
        )));
    }

    let include_set = if opts.include.is_empty() {
        None
    } else {
        Some(build_globset(&opts.include)?)
    };

    let mut excludes: Vec<String> = DEFAULT_EXCLUDES.iter().map(|s| (*s).to_string()).collect();
    excludes.extend(opts.exclude.iter().cloned());
    let exclude_set = build_globset(&excludes)?;

    let mut files = Vec::new();

    for entry in WalkDir::new(root).follow_links(false) {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                tracing::warn!(error = %e, "skipping unreadable entry");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let relative = match path.strip_prefix(root) {
            Ok(r) => r,
            Err(_) => continue,
        };
        let rel_str = relative
            .to_string_lossy()
            .replace(std::path::MAIN_SEPARATOR, "/");

        if !is_path_safe(&rel_str) {
            tracing::warn!(path = %rel_str, "skipping unsafe path");
            continue;
        }
        if is_hidden(&rel_str) {
            continue;
        }
        if exclude_set.is_match(&rel_str) {
            continue;
        }
        if let Some(ref includes) = include_set {
            if !includes.is_match(&rel_str) {
                continue;
            }
        }

        let metadata = match entry.metadata() {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(path = %rel_str, error = %e, "skipping entry without metadata");
                continue;
            }
        };
        if opts.max_file_size > 0 && metadata.len() > opts.max_file_size {
            continue;
        }

        files.push(WalkedFile {
            relative_path: rel_str,
            absolute_path: path.to_path_buf(),
            size: metadata.len(),
        });
    }

    files.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn fixture() -> tempfile::TempDir {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        fs::create_dir_all(root.join("src")).unwrap();
        fs::create_dir_all(root.join(".git")).unwrap();
        fs::create_dir_all(root.join("node_modules/pkg")).unwrap();
        fs::write(root.join("src/main.go"), "package main\n").unwrap();
        fs::write(root.join("src/util.go"), "package main\n").unwrap();
        fs::write(root.join("README.md"), "# readme\n").unwrap();
        fs::write(root.join(".git/config"), "[core]\n").unwrap();
        fs::write(root.join("node_modules/pkg/index.js"), "x\n").unwrap();
        tmp
    }

    #[test]
    fn excludes_vcs_and_dependency_dirs() {
        let tmp = fixture();
        let files = walk(tmp.path(), &WalkOptions::default()).unwrap();
        let paths: Vec<&str> = files.iter().map(|f| f.relative_path.as_str()).collect();
        assert_eq!(paths, vec!["README.md", "src/main.go", "src/util.go"]);
    }

    #[test]
    fn deterministic_order() {
        let tmp = fixture();
        let a = walk(tmp.path(), &WalkOptions::default()).unwrap();
        let b = walk(tmp.path(), &WalkOptions::default()).unwrap();
        let pa: Vec<_> = a.iter().map(|f| &f.relative_path).collect();
        let pb: Vec<_> = b.iter().map(|f| &f.relative_path).collect();
        assert_eq!(pa, pb);
    }

    #[test]
    fn include_patterns_filter() {
        let tmp = fixture();
        let opts = WalkOptions {
            include: vec!["**/*.go".to_string()],
            ..Default::default()
        };
        let files = walk(tmp.path(), &opts).unwrap();
        assert_eq!(files.len(), 2);
        assert!(files.iter().all(|f| f.relative_path.ends_with(".go")));
    }

    #[test]
    fn size_cap_applies() {
        let tmp = fixture();
        fs::write(tmp.path().join("big.txt"), vec![b'x'; 4096]).unwrap();
        let opts = WalkOptions {
            max_file_size: 1024,
            ..Default::default()
        };
        let files = walk(tmp.path(), &opts).unwrap();
        assert!(files.iter().all(|f| f.relative_path != "big.txt"));
    }

    #[test]
    fn zero_size_cap_is_unbounded() {
        let tmp = fixture();
        fs::write(tmp.path().join("big.txt"), vec![b'x'; 4096]).unwrap();
        let opts = WalkOptions {
            max_file_size: 0,
            ..Default::default()
        };
        let files = walk(tmp.path(), &opts).unwrap();
        assert!(files.iter().any(|f| f.relative_path == "big.txt"));
    }

    #[test]
    fn missing_root_is_fatal() {
        let err = walk(Path::new("/nonexistent/walk/root"), &WalkOptions::default()).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::NotFound);
    }

    #[test]
    fn hidden_files_skipped() {
        let tmp = fixture();
        fs::write(tmp.path().join(".env"), "SECRET=1\n").unwrap();
        let files = walk(tmp.path(), &WalkOptions::default()).unwrap();
        assert!(files.iter().all(|f| f.relative_path != ".env"));
    }
}
