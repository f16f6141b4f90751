//! File storage for Cubby.
//!
//! - [`DiskStore`] keeps file bytes in one directory per user.
//! - [`MetadataStore`] keeps users, file records, quotas and per-file locks
//!   in memory.

mod metadata;
mod storage;

pub use metadata::{FileEntry, FileHandle, MetadataLimits, MetadataStore, QuotaUsage, NO_FILES};
pub use storage::DiskStore;
