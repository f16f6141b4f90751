//! Disk storage for Cubby.
//!
//! Every user owns one directory below the storage root and files keep the
//! name the client gave them:
//! ```text
//! {root}/
//! ├── alice/
//! │   ├── a.txt
//! │   └── notes.md
//! └── bob/
//!     └── photo.jpg
//! ```
//! Names are validated before they reach this module, so they are always a
//! single path component.

use std::io;
use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::debug;

use crate::{CubbyError, Result};

/// Disk store for per-user file bytes.
#[derive(Debug, Clone)]
pub struct DiskStore {
    root: PathBuf,
}

impl DiskStore {
    /// Create a store rooted at `root`, creating the directory if needed.
    pub async fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).await?;

        Ok(Self { root })
    }

    /// Get the root directory of this store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding a user's files.
    pub fn user_dir(&self, username: &str) -> PathBuf {
        self.root.join(username)
    }

    /// Full path of a user's file.
    pub fn file_path(&self, username: &str, filename: &str) -> PathBuf {
        self.user_dir(username).join(filename)
    }

    /// Create the user's directory. Succeeds if it already exists.
    pub async fn create_user_dir(&self, username: &str) -> Result<()> {
        fs::create_dir_all(self.user_dir(username)).await?;
        Ok(())
    }

    /// Write a file, replacing any previous content.
    pub async fn save(&self, username: &str, filename: &str, content: &[u8]) -> Result<()> {
        let path = self.file_path(username, filename);
        self.create_user_dir(username).await?;
        fs::write(&path, content).await?;

        debug!("Disk: saved {} ({} bytes)", path.display(), content.len());
        Ok(())
    }

    /// Read a whole file.
    pub async fn load(&self, username: &str, filename: &str) -> Result<Vec<u8>> {
        let path = self.file_path(username, filename);

        match fs::read(&path).await {
            Ok(content) => {
                debug!("Disk: loaded {} ({} bytes)", path.display(), content.len());
                Ok(content)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(CubbyError::NotFound(format!("File: {filename}")))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Delete a file.
    ///
    /// Returns `true` if the file was deleted, `false` if it didn't exist.
    pub async fn delete(&self, username: &str, filename: &str) -> Result<bool> {
        let path = self.file_path(username, filename);

        match fs::remove_file(&path).await {
            Ok(()) => {
                debug!("Disk: removed {}", path.display());
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// List the regular files in a user's directory as `(name, size)` pairs,
    /// sorted by name. A missing directory is created and listed as empty.
    ///
    /// The server answers `LIST` from the metadata store; this is the disk
    /// side of the same view, for tools that inspect a storage root.
    pub async fn list_user_dir(&self, username: &str) -> Result<Vec<(String, u64)>> {
        let dir = self.user_dir(username);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                self.create_user_dir(username).await?;
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        };

        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let metadata = entry.metadata().await?;
            if metadata.is_file() {
                files.push((entry.file_name().to_string_lossy().into_owned(), metadata.len()));
            }
        }
        files.sort();

        Ok(files)
    }
}
