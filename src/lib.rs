//! Cubby - a multi-user networked file storage service.
//!
//! Clients connect over TCP, sign up or log in, then upload, download,
//! delete and list files within a per-user quota.

pub mod auth;
pub mod codec;
pub mod config;
pub mod error;
pub mod file;
pub mod logging;
pub mod pipeline;
pub mod server;

pub use auth::{validate_filename, validate_password, validate_username, ValidationError};
pub use config::Config;
pub use error::{CubbyError, ResourceError, Result};
pub use file::{DiskStore, FileHandle, MetadataLimits, MetadataStore};
pub use pipeline::{Shutdown, Task, TaskQueue, WorkerPool};
pub use server::Server;
