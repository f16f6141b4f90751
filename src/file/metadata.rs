//! In-memory metadata store: users, their files, quotas and per-file locks.
//!
//! Locking is two-level. The store-wide lock only guards the user table;
//! each user's file list, quota counters and lock table sit behind that
//! user's own mutex, held for short synchronous sections only. Each file
//! name maps to a reference-counted async mutex that callers hold across
//! disk I/O through a [`FileHandle`].
//!
//! A user mutex is never held while waiting on a file lock, so a task that
//! owns a file lock may still update the user's bookkeeping. Acquiring a
//! file lock clones it under the user mutex, waits with the mutex released,
//! then re-checks that the name still maps to the same lock.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, info};

use crate::config::StorageConfig;
use crate::error::ResourceError;
use crate::{CubbyError, Result};

/// Reply line used when a user has no files.
pub const NO_FILES: &str = "No files";

type FileLock = Arc<AsyncMutex<()>>;

/// Table limits of a metadata store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetadataLimits {
    /// Maximum number of users.
    pub max_users: usize,
    /// Maximum number of files per user.
    pub max_files_per_user: usize,
    /// Quota given to each new user, in bytes.
    pub quota_bytes: u64,
}

impl Default for MetadataLimits {
    fn default() -> Self {
        Self::from(&StorageConfig::default())
    }
}

impl From<&StorageConfig> for MetadataLimits {
    fn from(config: &StorageConfig) -> Self {
        Self {
            max_users: config.max_users,
            max_files_per_user: config.max_files_per_user,
            quota_bytes: config.quota_bytes,
        }
    }
}

/// A registered file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// File name as given by the client.
    pub filename: String,
    /// Size in bytes.
    pub size: u64,
}

/// Snapshot of a user's quota counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaUsage {
    /// Bytes used by registered files.
    pub used: u64,
    /// Quota in bytes.
    pub max: u64,
    /// Number of registered files.
    pub files: usize,
}

#[derive(Debug)]
struct UserState {
    files: Vec<FileEntry>,
    quota_used: u64,
    quota_max: u64,
    locks: HashMap<String, FileLock>,
}

impl UserState {
    fn position(&self, filename: &str) -> Option<usize> {
        self.files.iter().position(|f| f.filename == filename)
    }

    fn has_file(&self, filename: &str) -> bool {
        self.position(filename).is_some()
    }

    fn owns_lock(&self, filename: &str, lock: &FileLock) -> bool {
        self.locks
            .get(filename)
            .is_some_and(|current| Arc::ptr_eq(current, lock))
    }

    /// Drop the lock entry of an unregistered name once the caller is its
    /// last user. `holders` counts the caller's own references.
    fn prune_lock(&mut self, filename: &str, lock: &FileLock, holders: usize) {
        if !self.has_file(filename)
            && self.owns_lock(filename, lock)
            && Arc::strong_count(lock) <= holders + 1
        {
            self.locks.remove(filename);
        }
    }
}

#[derive(Debug)]
struct UserRecord {
    username: String,
    password: String,
    state: Mutex<UserState>,
}

impl UserRecord {
    fn state(&self) -> MutexGuard<'_, UserState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Exclusive access to one file of one user.
///
/// The lock is released when the handle is dropped.
#[derive(Debug)]
pub struct FileHandle {
    user: Arc<UserRecord>,
    filename: String,
    lock: FileLock,
    _guard: OwnedMutexGuard<()>,
}

impl FileHandle {
    /// Owner of the locked file.
    pub fn username(&self) -> &str {
        &self.user.username
    }

    /// Name of the locked file.
    pub fn filename(&self) -> &str {
        &self.filename
    }
}

impl Drop for FileHandle {
    fn drop(&mut self) {
        // Handle, guard and table: three references when nobody else waits.
        self.user.state().prune_lock(&self.filename, &self.lock, 2);
    }
}

/// In-memory directory of users and their files.
#[derive(Debug)]
pub struct MetadataStore {
    users: RwLock<Vec<Arc<UserRecord>>>,
    limits: MetadataLimits,
}

impl MetadataStore {
    /// Create an empty store with the given limits.
    pub fn new(limits: MetadataLimits) -> Self {
        Self {
            users: RwLock::new(Vec::new()),
            limits,
        }
    }

    /// Get the limits of this store.
    pub fn limits(&self) -> MetadataLimits {
        self.limits
    }

    /// Number of registered users.
    pub fn user_count(&self) -> usize {
        self.users
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Register a user with an empty file list and the default quota.
    pub fn add_user(&self, username: &str, password: &str) -> Result<()> {
        let mut users = self.users.write().unwrap_or_else(PoisonError::into_inner);

        if users.iter().any(|u| u.username == username) {
            return Err(CubbyError::AlreadyExists(format!("User {username}")));
        }
        if users.len() >= self.limits.max_users {
            return Err(ResourceError::UserLimitReached.into());
        }

        users.push(Arc::new(UserRecord {
            username: username.to_string(),
            password: password.to_string(),
            state: Mutex::new(UserState {
                files: Vec::new(),
                quota_used: 0,
                quota_max: self.limits.quota_bytes,
                locks: HashMap::new(),
            }),
        }));
        info!("Registered user {} (total: {})", username, users.len());
        Ok(())
    }

    /// Check a username/password pair.
    pub fn authenticate(&self, username: &str, password: &str) -> bool {
        self.user(username)
            .map(|u| u.password == password)
            .unwrap_or(false)
    }

    fn user(&self, username: &str) -> Result<Arc<UserRecord>> {
        self.users
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|u| u.username == username)
            .cloned()
            .ok_or_else(|| CubbyError::NotFound(format!("User {username}")))
    }

    /// Whether `add_size` more bytes fit in the user's quota.
    /// Unknown users have no room.
    pub fn check_quota(&self, username: &str, add_size: u64) -> bool {
        self.user(username)
            .map(|u| {
                let state = u.state();
                state
                    .quota_used
                    .checked_add(add_size)
                    .is_some_and(|total| total <= state.quota_max)
            })
            .unwrap_or(false)
    }

    /// Register a file or update the size of an existing one.
    ///
    /// An update adjusts `quota_used` by the size difference. Nothing changes
    /// when an error is returned. Callers that also touch the file's bytes
    /// hold its [`FileHandle`] across both steps.
    pub fn add_file(&self, username: &str, filename: &str, size: u64) -> Result<()> {
        let user = self.user(username)?;
        let mut state = user.state();

        match state.position(filename) {
            Some(index) => {
                let old_size = state.files[index].size;
                let used = state.quota_used - old_size + size;
                if used > state.quota_max {
                    return Err(ResourceError::QuotaExceeded.into());
                }
                state.files[index].size = size;
                state.quota_used = used;
                debug!(
                    "Updated {}/{} ({} -> {} bytes, quota {}/{})",
                    username, filename, old_size, size, used, state.quota_max
                );
            }
            None => {
                if state.files.len() >= self.limits.max_files_per_user {
                    return Err(ResourceError::FileLimitReached.into());
                }
                let used = state.quota_used + size;
                if used > state.quota_max {
                    return Err(ResourceError::QuotaExceeded.into());
                }
                state.files.push(FileEntry {
                    filename: filename.to_string(),
                    size,
                });
                state.quota_used = used;
                state
                    .locks
                    .entry(filename.to_string())
                    .or_insert_with(|| Arc::new(AsyncMutex::new(())));
                debug!(
                    "Added {}/{} ({} bytes, quota {}/{})",
                    username, filename, size, used, state.quota_max
                );
            }
        }
        Ok(())
    }

    /// Unregister a file, releasing its quota and destroying its lock entry.
    ///
    /// Anyone still holding the old lock keeps it until they drop it; later
    /// lockers of the same name find the file gone. The order of the
    /// remaining files is not preserved.
    pub fn remove_file(&self, username: &str, filename: &str) -> Result<()> {
        let user = self.user(username)?;
        let mut state = user.state();

        let index = state
            .position(filename)
            .ok_or_else(|| CubbyError::NotFound(format!("File {filename}")))?;
        let entry = state.files.swap_remove(index);
        state.quota_used -= entry.size;
        state.locks.remove(filename);
        debug!(
            "Removed {}/{} ({} bytes, quota {}/{})",
            username, filename, entry.size, state.quota_used, state.quota_max
        );
        Ok(())
    }

    /// Lock a registered file.
    ///
    /// Waits for any other holder. Fails with `NotFound` if the file is not
    /// registered, or was removed while waiting.
    pub async fn get_and_lock_file(&self, username: &str, filename: &str) -> Result<FileHandle> {
        self.acquire(username, filename, false).await
    }

    /// Lock a file name whether or not it is registered yet.
    ///
    /// Uploads use this so that writing the bytes and registering the file
    /// happen under one lock.
    pub async fn lock_file(&self, username: &str, filename: &str) -> Result<FileHandle> {
        self.acquire(username, filename, true).await
    }

    /// Release a file lock.
    pub fn unlock_file(&self, handle: FileHandle) {
        drop(handle);
    }

    async fn acquire(&self, username: &str, filename: &str, create: bool) -> Result<FileHandle> {
        let user = self.user(username)?;

        loop {
            let lock = {
                let mut state = user.state();
                if !create && !state.has_file(filename) {
                    return Err(CubbyError::NotFound(format!("File {filename}")));
                }
                Arc::clone(
                    state
                        .locks
                        .entry(filename.to_string())
                        .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
                )
            };

            let guard = Arc::clone(&lock).lock_owned().await;

            let mut state = user.state();
            if !state.owns_lock(filename, &lock) {
                // Removed (and possibly re-created) while we waited.
                if !create && !state.has_file(filename) {
                    return Err(CubbyError::NotFound(format!("File {filename}")));
                }
                continue;
            }
            if !create && !state.has_file(filename) {
                state.prune_lock(filename, &lock, 2);
                return Err(CubbyError::NotFound(format!("File {filename}")));
            }
            drop(state);

            return Ok(FileHandle {
                user: Arc::clone(&user),
                filename: filename.to_string(),
                lock,
                _guard: guard,
            });
        }
    }

    /// Size of a registered file, or `None` if it is not registered.
    pub fn file_size(&self, username: &str, filename: &str) -> Result<Option<u64>> {
        let user = self.user(username)?;
        let state = user.state();
        Ok(state.position(filename).map(|i| state.files[i].size))
    }

    /// Snapshot of a user's files.
    pub fn files(&self, username: &str) -> Result<Vec<FileEntry>> {
        Ok(self.user(username)?.state().files.clone())
    }

    /// Snapshot of a user's quota counters.
    pub fn usage(&self, username: &str) -> Result<QuotaUsage> {
        let user = self.user(username)?;
        let state = user.state();
        Ok(QuotaUsage {
            used: state.quota_used,
            max: state.quota_max,
            files: state.files.len(),
        })
    }

    /// Newline-terminated `name size` lines, or `No files`.
    pub fn list_files(&self, username: &str) -> Result<String> {
        let files = self.files(username)?;
        if files.is_empty() {
            return Ok(format!("{NO_FILES}\n"));
        }

        let mut output = String::new();
        for file in &files {
            let _ = writeln!(output, "{} {}", file.filename, file.size);
        }
        Ok(output)
    }

    #[cfg(test)]
    fn lock_entries(&self, username: &str) -> usize {
        self.user(username).unwrap().state().locks.len()
    }
}
