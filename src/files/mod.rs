//! Project-scoped filesystem access.
//!
//! Every operation resolves its path and refuses anything that lands
//! outside the session's project root after symlink resolution. Reads and
//! writes are capped at 1 MiB.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;

/// Per-file size cap for reads and writes.
pub const MAX_FILE_BYTES: u64 = 1024 * 1024;

/// Errors from project-scoped file operations.
#[derive(Debug, Error)]
pub enum FileError {
    #[error("outside project")]
    OutsideProject,
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("file too large (limit {MAX_FILE_BYTES} bytes)")]
    TooLarge,
    #[error("refusing to touch the project root")]
    ProjectRoot,
    #[error("not a regular file: {0}")]
    NotAFile(String),
    #[error("invalid name: {0}")]
    InvalidName(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type FileResult<T> = Result<T, FileError>;

/// One entry in a directory listing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FileEntry {
    pub name: String,
    pub is_directory: bool,
    pub size: u64,
}

/// Filesystem access confined to one project root.
#[derive(Debug, Clone)]
pub struct ProjectFiles {
    root: PathBuf,
}

impl ProjectFiles {
    /// Bind to a project root. The root must exist.
    pub fn new(root: impl AsRef<Path>) -> FileResult<Self> {
        let root = root.as_ref().canonicalize()?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a request path that must already exist. Symlinks are chased
    /// before the confinement check.
    fn resolve_existing(&self, rel: &str) -> FileResult<PathBuf> {
        let joined = self.root.join(rel.trim_start_matches('/'));
        let resolved = joined
            .canonicalize()
            .map_err(|_| FileError::NotFound(rel.to_string()))?;
        self.confine(&resolved)?;
        Ok(resolved)
    }

    /// Resolve a request path that may not exist yet: the parent directory
    /// must exist and resolve inside the root.
    fn resolve_new(&self, rel: &str) -> FileResult<PathBuf> {
        let joined = self.root.join(rel.trim_start_matches('/'));
        let name = joined
            .file_name()
            .ok_or_else(|| FileError::InvalidName(rel.to_string()))?
            .to_os_string();
        let parent = joined.parent().ok_or(FileError::OutsideProject)?;
        let parent = parent
            .canonicalize()
            .map_err(|_| FileError::NotFound(rel.to_string()))?;
        self.confine(&parent)?;
        Ok(parent.join(name))
    }

    /// A resolved path is in bounds when it is the root itself or sits
    /// under `root/`.
    fn confine(&self, resolved: &Path) -> FileResult<()> {
        if resolved == self.root || resolved.starts_with(&self.root) {
            Ok(())
        } else {
            Err(FileError::OutsideProject)
        }
    }

    /// List a directory (default: the root), directories first.
    pub async fn list(&self, rel: Option<&str>) -> FileResult<(String, Vec<FileEntry>)> {
        let dir = match rel {
            Some(rel) if !rel.is_empty() => self.resolve_existing(rel)?,
            _ => self.root.clone(),
        };
        if !dir.is_dir() {
            return Err(FileError::NotFound(dir.display().to_string()));
        }

        let mut entries = Vec::new();
        let mut read_dir = fs::read_dir(&dir).await?;
        while let Some(entry) = read_dir.next_entry().await? {
            let meta = match entry.metadata().await {
                Ok(m) => m,
                Err(_) => continue,
            };
            entries.push(FileEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                is_directory: meta.is_dir(),
                size: if meta.is_dir() { 0 } else { meta.len() },
            });
        }
        entries.sort_by(|a, b| {
            b.is_directory
                .cmp(&a.is_directory)
                .then_with(|| a.name.to_lowercase().cmp(&b.name.to_lowercase()))
        });

        let shown = dir
            .strip_prefix(&self.root)
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        Ok((shown, entries))
    }

    /// Read a file as UTF-8 (lossy), capped at 1 MiB.
    pub async fn read(&self, rel: &str) -> FileResult<String> {
        let path = self.resolve_existing(rel)?;
        let meta = fs::metadata(&path).await?;
        if !meta.is_file() {
            return Err(FileError::NotAFile(rel.to_string()));
        }
        if meta.len() > MAX_FILE_BYTES {
            return Err(FileError::TooLarge);
        }
        let bytes = fs::read(&path).await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Write (create or overwrite) a file, capped at 1 MiB.
    pub async fn write(&self, rel: &str, content: &str) -> FileResult<()> {
        if content.len() as u64 > MAX_FILE_BYTES {
            return Err(FileError::TooLarge);
        }
        let path = self.resolve_new(rel)?;
        if path == self.root {
            return Err(FileError::ProjectRoot);
        }
        if path.is_dir() {
            return Err(FileError::NotAFile(rel.to_string()));
        }
        fs::write(&path, content).await?;
        Ok(())
    }

    /// Create an empty file; refuses to overwrite.
    pub async fn create_file(&self, rel: &str) -> FileResult<()> {
        let path = self.resolve_new(rel)?;
        if path.exists() {
            return Err(FileError::AlreadyExists(rel.to_string()));
        }
        fs::write(&path, b"").await?;
        Ok(())
    }

    /// Create a directory; refuses to overwrite.
    pub async fn create_directory(&self, rel: &str) -> FileResult<()> {
        let path = self.resolve_new(rel)?;
        if path.exists() {
            return Err(FileError::AlreadyExists(rel.to_string()));
        }
        fs::create_dir(&path).await?;
        Ok(())
    }

    /// Rename an entry in place; the new name must be a bare file name and
    /// must not collide.
    pub async fn rename(&self, rel: &str, new_name: &str) -> FileResult<()> {
        if new_name.is_empty() || new_name.contains(['/', '\\']) || new_name == ".." {
            return Err(FileError::InvalidName(new_name.to_string()));
        }
        let path = self.resolve_existing(rel)?;
        if path == self.root {
            return Err(FileError::ProjectRoot);
        }
        let target = path
            .parent()
            .ok_or(FileError::OutsideProject)?
            .join(new_name);
        self.confine(&target)?;
        if target.exists() {
            return Err(FileError::AlreadyExists(new_name.to_string()));
        }
        fs::rename(&path, &target).await?;
        Ok(())
    }

    /// Delete a file or directory tree. The root itself is off limits.
    pub async fn delete(&self, rel: &str) -> FileResult<()> {
        let path = self.resolve_existing(rel)?;
        if path == self.root {
            return Err(FileError::ProjectRoot);
        }
        if path.is_dir() {
            fs::remove_dir_all(&path).await?;
        } else {
            fs::remove_file(&path).await?;
        }
        Ok(())
    }

    /// Resolve a path for streaming out of the daemon: must exist, be a
    /// regular file, and be in bounds.
    pub fn resolve_download(&self, rel: &str) -> FileResult<PathBuf> {
        let path = self.resolve_existing(rel)?;
        if !path.is_file() {
            return Err(FileError::NotAFile(rel.to_string()));
        }
        Ok(path)
    }
}

/// Immediate child directories of a path, for the session-creation picker.
/// Hidden entries are excluded; the listing sorts case-insensitively.
pub async fn browse_directories(raw: &str) -> FileResult<(String, Vec<String>)> {
    let expanded = expand_tilde(raw);
    let path = PathBuf::from(&expanded);
    let resolved = path
        .canonicalize()
        .map_err(|_| FileError::NotFound(raw.to_string()))?;
    if !resolved.is_dir() {
        return Err(FileError::NotFound(raw.to_string()));
    }

    let mut dirs = Vec::new();
    let mut read_dir = fs::read_dir(&resolved).await?;
    while let Some(entry) = read_dir.next_entry().await? {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') {
            continue;
        }
        if entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
            dirs.push(name);
        }
    }
    dirs.sort_by_key(|n| n.to_lowercase());
    Ok((resolved.display().to_string(), dirs))
}

/// Expand a leading `~` to the user's home directory.
pub fn expand_tilde(raw: &str) -> String {
    if raw == "~" {
        return dirs::home_dir()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| raw.to_string());
    }
    if let Some(rest) = raw.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest).display().to_string();
        }
    }
    raw.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn project() -> (tempfile::TempDir, ProjectFiles) {
        let dir = tempdir().unwrap();
        std::fs::create_dir(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src/lib.rs"), "pub fn x() {}\n").unwrap();
        std::fs::write(dir.path().join("README.md"), "# hi\n").unwrap();
        let files = ProjectFiles::new(dir.path()).unwrap();
        (dir, files)
    }

    #[tokio::test]
    async fn traversal_is_refused_and_fs_untouched() {
        let (_dir, files) = project().await;
        let err = files.write("../../etc/passwd", "x").await.unwrap_err();
        assert!(matches!(
            err,
            FileError::OutsideProject | FileError::NotFound(_)
        ));
        // Reads escape the same way.
        assert!(files.read("../../../etc/passwd").await.is_err());
    }

    #[tokio::test]
    async fn symlink_escape_is_refused() {
        let (dir, files) = project().await;
        let outside = tempdir().unwrap();
        std::os::unix::fs::symlink(outside.path(), dir.path().join("escape")).unwrap();
        let err = files.read("escape/anything").await.unwrap_err();
        assert!(matches!(
            err,
            FileError::OutsideProject | FileError::NotFound(_)
        ));
        let err = files.write("escape/file.txt", "x").await.unwrap_err();
        assert!(matches!(err, FileError::OutsideProject));
    }

    #[tokio::test]
    async fn read_write_round_trip() {
        let (_dir, files) = project().await;
        files.write("src/new.rs", "fn main() {}\n").await.unwrap();
        assert_eq!(files.read("src/new.rs").await.unwrap(), "fn main() {}\n");
    }

    #[tokio::test]
    async fn oversized_writes_are_refused() {
        let (_dir, files) = project().await;
        let big = "x".repeat((MAX_FILE_BYTES + 1) as usize);
        assert!(matches!(
            files.write("big.txt", &big).await.unwrap_err(),
            FileError::TooLarge
        ));
    }

    #[tokio::test]
    async fn create_refuses_overwrite() {
        let (_dir, files) = project().await;
        assert!(matches!(
            files.create_file("README.md").await.unwrap_err(),
            FileError::AlreadyExists(_)
        ));
        assert!(matches!(
            files.create_directory("src").await.unwrap_err(),
            FileError::AlreadyExists(_)
        ));
    }

    #[tokio::test]
    async fn rename_refuses_collision_and_root() {
        let (_dir, files) = project().await;
        files.create_file("other.md").await.unwrap();
        assert!(matches!(
            files.rename("other.md", "README.md").await.unwrap_err(),
            FileError::AlreadyExists(_)
        ));
        assert!(matches!(
            files.rename("other.md", "sub/name").await.unwrap_err(),
            FileError::InvalidName(_)
        ));
        assert!(matches!(
            files.delete(".").await.unwrap_err(),
            FileError::ProjectRoot
        ));
    }

    #[tokio::test]
    async fn listing_sorts_directories_first() {
        let (_dir, files) = project().await;
        let (_, entries) = files.list(None).await.unwrap();
        assert_eq!(entries[0].name, "src");
        assert!(entries[0].is_directory);
        assert_eq!(entries[1].name, "README.md");
    }

    #[tokio::test]
    async fn browse_excludes_hidden_directories() {
        let dir = tempdir().unwrap();
        std::fs::create_dir(dir.path().join("Alpha")).unwrap();
        std::fs::create_dir(dir.path().join("beta")).unwrap();
        std::fs::create_dir(dir.path().join(".git")).unwrap();
        std::fs::write(dir.path().join("file.txt"), "").unwrap();

        let (_, dirs) = browse_directories(&dir.path().display().to_string())
            .await
            .unwrap();
        assert_eq!(dirs, vec!["Alpha", "beta"]);
    }
}
