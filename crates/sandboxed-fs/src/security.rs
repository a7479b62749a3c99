//! Path validation and lexical cleaning for sandbox confinement.

use crate::error::{Result, SandboxError};
use std::path::{Component, Path, PathBuf};

/// Lexically cleans a relative path: collapses `.` components and resolves
/// `..` against earlier components without touching the filesystem.
///
/// Rejects absolute paths, prefix components, NUL bytes, and any `..`
/// sequence that would climb past the start of the path.
pub fn clean_relative(input: &str) -> Result<PathBuf> {
    if input.is_empty() {
        return Err(SandboxError::PathValidation {
            path: PathBuf::from(input),
            reason: "Path cannot be empty".to_string(),
        });
    }

    if input.contains('\0') {
        return Err(SandboxError::PathValidation {
            path: PathBuf::from(input),
            reason: "Path contains null bytes".to_string(),
        });
    }

    let path = Path::new(input);
    if path.is_absolute() {
        return Err(SandboxError::PathValidation {
            path: path.to_path_buf(),
            reason: "Absolute paths not allowed - use relative paths within sandbox".to_string(),
        });
    }

    let mut cleaned = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => cleaned.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                if !cleaned.pop() {
                    return Err(SandboxError::PathValidation {
                        path: path.to_path_buf(),
                        reason: "Path escapes sandbox via '..'".to_string(),
                    });
                }
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(SandboxError::PathValidation {
                    path: path.to_path_buf(),
                    reason: "Rooted path components not allowed".to_string(),
                });
            }
        }
    }

    if cleaned.as_os_str().is_empty() {
        return Err(SandboxError::PathValidation {
            path: path.to_path_buf(),
            reason: "Path resolves to the sandbox base itself".to_string(),
        });
    }

    Ok(cleaned)
}

/// Verifies a resolved absolute path is the sandbox base or strictly below it.
pub fn verify_within_base(resolved: &Path, base: &Path) -> Result<()> {
    if resolved == base || resolved.starts_with(base) {
        return Ok(());
    }
    Err(SandboxError::PathValidation {
        path: resolved.to_path_buf(),
        reason: format!(
            "Path escapes sandbox: resolves to '{}' (outside '{}')",
            resolved.display(),
            base.display()
        ),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_simple_and_nested_paths() {
        assert_eq!(clean_relative("file.txt").unwrap(), PathBuf::from("file.txt"));
        assert_eq!(
            clean_relative("a/b/c.json").unwrap(),
            PathBuf::from("a/b/c.json")
        );
    }

    #[test]
    fn collapses_cur_dir_and_internal_parent_dir() {
        assert_eq!(
            clean_relative("./a/./b.txt").unwrap(),
            PathBuf::from("a/b.txt")
        );
        assert_eq!(
            clean_relative("a/../b/file.txt").unwrap(),
            PathBuf::from("b/file.txt")
        );
    }

    #[test]
    fn rejects_escape_vectors() {
        assert!(clean_relative("../etc/passwd").is_err());
        assert!(clean_relative("a/../../escape").is_err());
        assert!(clean_relative("/etc/passwd").is_err());
        assert!(clean_relative("file\0.txt").is_err());
        assert!(clean_relative("").is_err());
    }

    #[test]
    fn rejects_paths_resolving_to_base() {
        assert!(clean_relative(".").is_err());
        assert!(clean_relative("a/..").is_err());
    }
}
