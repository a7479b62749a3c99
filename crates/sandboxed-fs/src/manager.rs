//! Core sandbox implementation.

use crate::{
    error::{Result, SandboxError},
    security::{clean_relative, verify_within_base},
};

use rand::Rng;
use rand::distr::Alphanumeric;
use std::path::{Path, PathBuf};
use tokio::fs;

/// Mode applied to every directory the sandbox creates (Unix only).
const DIR_MODE: u32 = 0o750;
/// Mode applied to every file the sandbox creates (Unix only).
const FILE_MODE: u32 = 0o640;

/// A filesystem gateway confined to a single base directory.
///
/// All operations take base-relative paths which are lexically cleaned and
/// verified before touching the filesystem; absolute inputs and `..` escapes
/// are rejected. Writes are atomic (hidden same-directory temp file + rename)
/// and `publish` extends the same protocol across filesystem boundaries.
#[derive(Clone, Debug)]
pub struct Sandbox {
    base_dir: PathBuf,
}

impl Sandbox {
    /// Create a sandbox rooted at `base`, creating the directory (mode 0750)
    /// if it does not exist. The base must be an absolute path.
    pub async fn create<P: Into<PathBuf>>(base: P) -> Result<Self> {
        let base: PathBuf = base.into();
        if !base.is_absolute() {
            return Err(SandboxError::PathValidation {
                path: base,
                reason: "Sandbox base directory must be absolute".to_string(),
            });
        }

        if !base.exists() {
            fs::create_dir_all(&base)
                .await
                .map_err(|e| SandboxError::DirectoryCreation {
                    path: base.clone(),
                    source: e,
                })?;
        }
        set_dir_permissions(&base).await?;

        // Canonicalize so prefix checks survive symlinked temp roots.
        let base_dir = base.canonicalize().map_err(|e| SandboxError::PathValidation {
            path: base.clone(),
            reason: format!("Failed to canonicalize base directory: {e}"),
        })?;

        Ok(Self { base_dir })
    }

    /// The absolute base directory of this sandbox.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Resolve a base-relative path to an absolute path, rejecting absolute
    /// inputs and any lexical escape from the base directory.
    pub fn resolve_path(&self, rel: &str) -> Result<PathBuf> {
        let cleaned = clean_relative(rel)?;
        let resolved = self.base_dir.join(cleaned);
        verify_within_base(&resolved, &self.base_dir)?;
        tracing::trace!(
            "Path validated: '{}' -> '{}' (within '{}')",
            rel,
            resolved.display(),
            self.base_dir.display()
        );
        Ok(resolved)
    }

    /// Whether a file or directory exists at the given relative path.
    pub async fn exists(&self, rel: &str) -> Result<bool> {
        let path = self.resolve_path(rel)?;
        Ok(fs::try_exists(&path).await?)
    }

    /// Read the entire file into a byte vector.
    pub async fn read(&self, rel: &str) -> Result<Vec<u8>> {
        let path = self.resolve_path(rel)?;
        Ok(fs::read(&path).await?)
    }

    /// Read the entire file into a UTF-8 string.
    pub async fn read_to_string(&self, rel: &str) -> Result<String> {
        let path = self.resolve_path(rel)?;
        Ok(fs::read_to_string(&path).await?)
    }

    /// Metadata for a file within the sandbox.
    pub async fn metadata(&self, rel: &str) -> Result<std::fs::Metadata> {
        let path = self.resolve_path(rel)?;
        Ok(fs::metadata(&path).await?)
    }

    /// Atomically write `contents` to the target path.
    ///
    /// The data is materialized into a randomly-named hidden temp file in the
    /// same directory as the target, then renamed into place, so readers never
    /// observe a partially-written file.
    pub async fn write<C: AsRef<[u8]>>(&self, rel: &str, contents: C) -> Result<()> {
        let target = self.resolve_path(rel)?;
        let parent = target
            .parent()
            .ok_or_else(|| SandboxError::PathValidation {
                path: target.clone(),
                reason: "Path has no parent directory".to_string(),
            })?
            .to_path_buf();

        self.ensure_dir(&parent).await?;

        let temp_path = temp_sibling(&target);
        fs::write(&temp_path, contents.as_ref()).await?;
        set_file_permissions(&temp_path).await?;

        if let Err(e) = fs::rename(&temp_path, &target).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(e.into());
        }
        Ok(())
    }

    /// Atomically publish a sandboxed file to an absolute target path that may
    /// live on a different filesystem.
    ///
    /// A direct rename is attempted first; when that fails (typically EXDEV),
    /// the contents are copied to a hidden temp file in the target's directory
    /// and renamed, preserving atomicity of the final step.
    pub async fn publish(&self, rel_src: &str, target: &Path) -> Result<()> {
        let source = self.resolve_path(rel_src)?;
        if !target.is_absolute() {
            return Err(SandboxError::PathValidation {
                path: target.to_path_buf(),
                reason: "Publish target must be absolute".to_string(),
            });
        }

        let target_parent = target
            .parent()
            .ok_or_else(|| SandboxError::Publish {
                source_path: source.clone(),
                target: target.to_path_buf(),
                reason: "Target has no parent directory".to_string(),
            })?
            .to_path_buf();
        self.ensure_dir(&target_parent).await?;

        match fs::rename(&source, target).await {
            Ok(()) => Ok(()),
            Err(rename_err) => {
                tracing::debug!(
                    "Direct rename failed ({rename_err}), falling back to copy+rename for {}",
                    target.display()
                );
                let temp_path = temp_sibling(target);
                fs::copy(&source, &temp_path)
                    .await
                    .map_err(|e| SandboxError::Publish {
                        source_path: source.clone(),
                        target: target.to_path_buf(),
                        reason: format!("copy failed: {e}"),
                    })?;
                set_file_permissions(&temp_path).await?;
                fs::rename(&temp_path, target)
                    .await
                    .map_err(|e| SandboxError::Publish {
                        source_path: source.clone(),
                        target: target.to_path_buf(),
                        reason: format!("rename failed: {e}"),
                    })?;
                let _ = fs::remove_file(&source).await;
                Ok(())
            }
        }
    }

    /// Remove a single file.
    pub async fn remove_file(&self, rel: &str) -> Result<()> {
        let path = self.resolve_path(rel)?;
        fs::remove_file(&path).await?;
        Ok(())
    }

    /// Create a directory (and any missing parents) within the sandbox.
    pub async fn create_dir_all(&self, rel: &str) -> Result<()> {
        let path = self.resolve_path(rel)?;
        self.ensure_dir(&path).await
    }

    /// Recursively remove a directory or file within the sandbox. Removing the
    /// base directory itself is refused.
    pub async fn remove_all(&self, rel: &str) -> Result<()> {
        let trimmed = rel.trim().trim_end_matches('/');
        if trimmed.is_empty() || trimmed == "." {
            return Err(SandboxError::BaseRemovalRefused {
                path: self.base_dir.clone(),
            });
        }
        let path = match self.resolve_path(trimmed) {
            Ok(p) => p,
            Err(SandboxError::PathValidation { reason, .. })
                if reason.contains("sandbox base itself") =>
            {
                return Err(SandboxError::BaseRemovalRefused {
                    path: self.base_dir.clone(),
                });
            }
            Err(e) => return Err(e),
        };

        let meta = fs::metadata(&path).await?;
        if meta.is_dir() {
            fs::remove_dir_all(&path).await?;
        } else {
            fs::remove_file(&path).await?;
        }
        Ok(())
    }

    /// List the plain-file entry names of a directory, sorted. A missing
    /// directory yields an empty listing.
    pub async fn list_files(&self, rel_dir: &str) -> Result<Vec<String>> {
        let dir = self.resolve_path(rel_dir)?;
        if !fs::try_exists(&dir).await? {
            return Ok(Vec::new());
        }

        let mut names = Vec::new();
        let mut entries = fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                if let Ok(name) = entry.file_name().into_string() {
                    names.push(name);
                }
            }
        }
        names.sort();
        Ok(names)
    }

    /// Walk the sandbox and delete empty descendant directories bottom-up.
    /// The base directory itself is never removed. Returns the removal count.
    pub async fn cleanup_empty_dirs(&self) -> Result<usize> {
        let base = self.base_dir.clone();
        let removed = tokio::task::spawn_blocking(move || {
            let mut removed = 0usize;
            // Errors on individual entries abort the sweep; partial cleanup is fine.
            let _ = sweep_empty_dirs(&base, &mut removed);
            removed
        })
        .await
        .map_err(|e| SandboxError::PathValidation {
            path: self.base_dir.clone(),
            reason: format!("cleanup task failed: {e}"),
        })?;

        if removed > 0 {
            tracing::debug!("Removed {} empty directories under {}", removed, self.base_dir.display());
        }
        Ok(removed)
    }

    async fn ensure_dir(&self, dir: &Path) -> Result<()> {
        if fs::try_exists(dir).await? {
            return Ok(());
        }
        fs::create_dir_all(dir)
            .await
            .map_err(|e| SandboxError::DirectoryCreation {
                path: dir.to_path_buf(),
                source: e,
            })?;
        set_dir_permissions(dir).await?;
        Ok(())
    }
}

/// Returns whether `dir` ended up empty; removes empty subdirectories on the way.
fn sweep_empty_dirs(dir: &Path, removed: &mut usize) -> std::io::Result<bool> {
    let mut is_empty = true;
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            if sweep_empty_dirs(&path, removed)? {
                std::fs::remove_dir(&path)?;
                *removed += 1;
            } else {
                is_empty = false;
            }
        } else {
            is_empty = false;
        }
    }
    Ok(is_empty)
}

/// Builds a hidden randomly-suffixed temp path in the same directory as `target`.
fn temp_sibling(target: &Path) -> PathBuf {
    let suffix: String = rand::rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(char::from)
        .collect();
    let file_name = target
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "file".to_string());
    target.with_file_name(format!(".{file_name}.{suffix}.tmp"))
}

async fn set_dir_permissions(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, std::fs::Permissions::from_mode(DIR_MODE)).await?;
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
    Ok(())
}

async fn set_file_permissions(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, std::fs::Permissions::from_mode(FILE_MODE)).await?;
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn sandbox() -> (tempfile::TempDir, Sandbox) {
        let dir = tempfile::tempdir().unwrap();
        let sb = Sandbox::create(dir.path().join("base")).await.unwrap();
        (dir, sb)
    }

    #[tokio::test]
    async fn write_then_read_round_trip() {
        let (_guard, sb) = sandbox().await;
        sb.write("docs/hello.txt", "Hello World").await.unwrap();
        assert_eq!(sb.read_to_string("docs/hello.txt").await.unwrap(), "Hello World");
    }

    #[tokio::test]
    async fn write_leaves_no_temp_files_behind() {
        let (_guard, sb) = sandbox().await;
        sb.write("a/b/file.bin", b"data").await.unwrap();
        let names = sb.list_files("a/b").await.unwrap();
        assert_eq!(names, vec!["file.bin".to_string()]);
    }

    #[tokio::test]
    async fn resolve_path_confinement() {
        let (_guard, sb) = sandbox().await;
        let ok = sb.resolve_path("sub/dir/file.txt").unwrap();
        assert!(ok.starts_with(sb.base_dir()));

        assert!(sb.resolve_path("../outside").is_err());
        assert!(sb.resolve_path("/etc/passwd").is_err());
        assert!(sb.resolve_path("a/../../b").is_err());
    }

    #[tokio::test]
    async fn remove_all_refuses_base() {
        let (_guard, sb) = sandbox().await;
        assert!(matches!(
            sb.remove_all(".").await,
            Err(SandboxError::BaseRemovalRefused { .. })
        ));
        assert!(matches!(
            sb.remove_all("").await,
            Err(SandboxError::BaseRemovalRefused { .. })
        ));
    }

    #[tokio::test]
    async fn remove_all_removes_tree() {
        let (_guard, sb) = sandbox().await;
        sb.write("tree/x/file.txt", "x").await.unwrap();
        sb.remove_all("tree").await.unwrap();
        assert!(!sb.exists("tree").await.unwrap());
    }

    #[tokio::test]
    async fn publish_renames_into_place() {
        let (_guard, sb) = sandbox().await;
        sb.write("staging/out.m3u", "#EXTM3U\n").await.unwrap();

        let out_dir = tempfile::tempdir().unwrap();
        let target = out_dir.path().join("proxy.m3u");
        sb.publish("staging/out.m3u", &target).await.unwrap();

        assert_eq!(std::fs::read_to_string(&target).unwrap(), "#EXTM3U\n");
        assert!(!sb.exists("staging/out.m3u").await.unwrap());
    }

    #[tokio::test]
    async fn cleanup_empty_dirs_sweeps_bottom_up() {
        let (_guard, sb) = sandbox().await;
        sb.create_dir_all("empty/deeper/leaf").await.unwrap();
        sb.write("kept/file.txt", "x").await.unwrap();

        let removed = sb.cleanup_empty_dirs().await.unwrap();
        assert_eq!(removed, 3);
        assert!(!sb.exists("empty").await.unwrap());
        assert!(sb.exists("kept/file.txt").await.unwrap());
    }

    #[tokio::test]
    async fn base_survives_cleanup() {
        let (_guard, sb) = sandbox().await;
        sb.cleanup_empty_dirs().await.unwrap();
        assert!(sb.base_dir().exists());
    }
}
