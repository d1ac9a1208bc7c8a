//! Path safety checks.
//!
//! Every externally supplied path — tool arguments, resource URIs,
//! connector config paths, indexer roots — routes through these
//! predicates before any filesystem access. The checks are lexical by
//! default; symlink resolution is opt-in via
//! [`validate_within_base_resolved`].

use std::path::{Component, Path, PathBuf};

use crate::error::{Error, Result};

/// Returns `false` for paths that must never reach the filesystem:
/// empty strings, embedded NUL bytes, or any `..` component after
/// lexical cleaning. Performs no I/O.
pub fn is_path_safe(p: &str) -> bool {
    if p.is_empty() || p.contains('\0') {
        return false;
    }
    for component in Path::new(p).components() {
        if matches!(component, Component::ParentDir) {
            return false;
        }
    }
    true
}

/// Lexically normalize a path: drop `.` components, resolve `..`
/// against preceding components. Returns `None` when `..` would climb
/// past the start of a relative path.
fn clean(p: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in p.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    return None;
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    Some(out)
}

/// Resolve `p` against `base` and verify the result stays lexically
/// within `base`. `p` may be relative (joined onto `base`) or absolute
/// (must already be under `base`). No symlinks are followed.
///
/// Returns the cleaned absolute path on success.
pub fn validate_within_base(p: &Path, base: &Path) -> Result<PathBuf> {
    let p_str = p.to_string_lossy();
    if p_str.is_empty() || p_str.contains('\0') {
        return Err(Error::invalid_path(format!(
            "invalid path: {:?}",
            p.display()
        )));
    }

    let joined = if p.is_absolute() {
        p.to_path_buf()
    } else {
        base.join(p)
    };

    let cleaned = clean(&joined)
        .ok_or_else(|| Error::invalid_path(format!("path escapes base: {}", p.display())))?;
    let base_clean = clean(base)
        .ok_or_else(|| Error::invalid_path(format!("invalid base: {}", base.display())))?;

    if !cleaned.starts_with(&base_clean) {
        return Err(Error::invalid_path(format!(
            "path escapes base: {}",
            p.display()
        )));
    }

    Ok(cleaned)
}

/// Like [`validate_within_base`], but additionally canonicalizes the
/// result (following symlinks) and re-checks containment against the
/// canonicalized base. Use for paths that will actually be opened when
/// the caller has opted into symlink resolution.
pub fn validate_within_base_resolved(p: &Path, base: &Path) -> Result<PathBuf> {
    let lexical = validate_within_base(p, base)?;

    let canon_base = base
        .canonicalize()
        .map_err(|e| Error::with_source(crate::error::ErrorKind::InvalidPath, format!("cannot resolve base {}", base.display()), e))?;
    let canon = lexical
        .canonicalize()
        .map_err(|e| Error::with_source(crate::error::ErrorKind::InvalidPath, format!("cannot resolve {}", lexical.display()), e))?;

    if !canon.starts_with(&canon_base) {
        return Err(Error::invalid_path(format!(
            "path escapes base after resolution: {}",
            p.display()
        )));
    }

    Ok(canon)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_and_nul() {
        assert!(!is_path_safe(""));
        assert!(!is_path_safe("a\0b"));
    }

    #[test]
    fn rejects_parent_components() {
        assert!(!is_path_safe(".."));
        assert!(!is_path_safe("../etc/passwd"));
        assert!(!is_path_safe("src/../../escape"));
    }

    #[test]
    fn accepts_ordinary_relative_paths() {
        assert!(is_path_safe("src/main.rs"));
        assert!(is_path_safe("./docs/guide.md"));
        assert!(is_path_safe("a/b/c.txt"));
    }

    #[test]
    fn validate_joins_relative_onto_base() {
        let out = validate_within_base(Path::new("src/lib.rs"), Path::new("/repo")).unwrap();
        assert_eq!(out, PathBuf::from("/repo/src/lib.rs"));
    }

    #[test]
    fn validate_rejects_escape() {
        let err = validate_within_base(Path::new("../outside"), Path::new("/repo")).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidPath);
    }

    #[test]
    fn validate_rejects_sneaky_escape() {
        let err =
            validate_within_base(Path::new("src/../../outside"), Path::new("/repo")).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidPath);
    }

    #[test]
    fn validate_accepts_dotdot_that_stays_inside() {
        let out =
            validate_within_base(Path::new("src/../docs/a.md"), Path::new("/repo")).unwrap();
        assert_eq!(out, PathBuf::from("/repo/docs/a.md"));
    }

    #[test]
    fn validate_rejects_foreign_absolute() {
        let err = validate_within_base(Path::new("/etc/passwd"), Path::new("/repo")).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidPath);
    }

    #[test]
    fn resolved_rejects_symlink_escape() {
        let tmp = tempfile::tempdir().unwrap();
        let base = tmp.path().join("base");
        let outside = tmp.path().join("outside");
        std::fs::create_dir_all(&base).unwrap();
        std::fs::create_dir_all(&outside).unwrap();
        std::fs::write(outside.join("secret.txt"), "x").unwrap();

        #[cfg(unix)]
        {
            std::os::unix::fs::symlink(&outside, base.join("link")).unwrap();
            let err =
                validate_within_base_resolved(Path::new("link/secret.txt"), &base).unwrap_err();
            assert_eq!(err.kind(), crate::error::ErrorKind::InvalidPath);
        }
    }
}
