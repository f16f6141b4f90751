//! Worker pool executing file tasks.
//!
//! Each worker takes one task at a time from the task queue, runs it
//! against the metadata and disk stores, writes the reply into the task's
//! writer and fires the completion. Errors become error replies; nothing is
//! retried and no task error stops a worker.

use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::task::{Command, Job, TaskQueue};
use crate::codec;
use crate::error::ResourceError;
use crate::file::{DiskStore, MetadataStore};
use crate::server::protocol;
use crate::{CubbyError, Result};

/// A single worker bound to the shared stores.
#[derive(Debug, Clone)]
pub struct Worker {
    id: usize,
    tasks: Arc<TaskQueue>,
    metadata: Arc<MetadataStore>,
    disk: DiskStore,
}

impl Worker {
    pub fn new(
        id: usize,
        tasks: Arc<TaskQueue>,
        metadata: Arc<MetadataStore>,
        disk: DiskStore,
    ) -> Self {
        Self {
            id,
            tasks,
            metadata,
            disk,
        }
    }

    /// Process tasks until the queue is closed and drained.
    pub async fn run(self) {
        debug!("Worker {} started", self.id);
        while let Some(job) = self.tasks.next().await {
            self.process(job).await;
        }
        debug!("Worker {} stopped", self.id);
    }

    /// Run one job, write its reply and complete it.
    pub async fn process(&self, job: Job) {
        let Job { mut task, completion } = job;

        let executed = self
            .execute(&task.command, &task.username, &task.filename, task.declared_size)
            .await;
        let (result, reply) = match executed {
            Ok(reply) => {
                info!(
                    "Worker {}: {} {}/{} done",
                    self.id,
                    task.command.name(),
                    task.username,
                    task.filename
                );
                (Ok(()), reply)
            }
            Err(e) => {
                warn!(
                    "Worker {}: {} {}/{} failed: {}",
                    self.id,
                    task.command.name(),
                    task.username,
                    task.filename,
                    e
                );
                let reply = failure_reply(&task.command, &e);
                (Err(e), reply)
            }
        };

        let sink = task.sink_mut();
        let written = match sink.write_all(reply.as_bytes()).await {
            Ok(()) => sink.flush().await,
            Err(e) => Err(e),
        };
        let result = match (result, written) {
            (Ok(()), Err(e)) => {
                warn!("Worker {}: failed to send reply for task {}: {}", self.id, task.id, e);
                Err(CubbyError::Io(e))
            }
            (result, _) => result,
        };

        completion.complete(result, task.into_sink());
    }

    /// Run one file operation and return its success reply.
    pub async fn execute(
        &self,
        command: &Command,
        username: &str,
        filename: &str,
        declared_size: Option<u64>,
    ) -> Result<String> {
        match command {
            Command::Upload { payload } => {
                self.upload(username, filename, payload, declared_size).await
            }
            Command::Download => self.download(username, filename).await,
            Command::Delete => self.delete(username, filename).await,
            Command::List => self.metadata.list_files(username),
        }
    }

    async fn upload(
        &self,
        user: &str,
        name: &str,
        payload: &str,
        declared_size: Option<u64>,
    ) -> Result<String> {
        let content = codec::decode(payload)?;
        let size = content.len() as u64;
        if let Some(declared) = declared_size {
            if declared != size {
                return Err(CubbyError::Decode(format!(
                    "declared {declared} bytes, decoded {size}"
                )));
            }
        }

        // Held across the disk write and the metadata update.
        let handle = self.metadata.lock_file(user, name).await?;

        let previous = self.metadata.file_size(user, name)?;
        let growth = size.saturating_sub(previous.unwrap_or(0));
        if !self.metadata.check_quota(user, growth) {
            return Err(ResourceError::QuotaExceeded.into());
        }
        if previous.is_none()
            && self.metadata.usage(user)?.files >= self.metadata.limits().max_files_per_user
        {
            return Err(ResourceError::FileLimitReached.into());
        }

        let backup = match previous {
            Some(_) => match self.disk.load(user, name).await {
                Ok(bytes) => Some(bytes),
                Err(CubbyError::NotFound(_)) => None,
                Err(e) => return Err(e),
            },
            None => None,
        };

        let stored = match self.disk.save(user, name, &content).await {
            Ok(()) => self.metadata.add_file(user, name, size),
            Err(e) => Err(e),
        };
        if let Err(e) = stored {
            self.rollback(user, name, backup.as_deref()).await;
            return Err(e);
        }

        self.metadata.unlock_file(handle);
        Ok(protocol::UPLOAD_OK.to_string())
    }

    /// Put the disk back the way it was before a failed upload.
    async fn rollback(&self, user: &str, name: &str, backup: Option<&[u8]>) {
        let restored = match backup {
            Some(bytes) => self.disk.save(user, name, bytes).await,
            None => self.disk.delete(user, name).await.map(|_| ()),
        };
        match restored {
            Ok(()) => debug!("Rolled back upload of {}/{}", user, name),
            Err(e) => error!("Rollback of {}/{} failed: {}", user, name, e),
        }
    }

    async fn download(&self, user: &str, name: &str) -> Result<String> {
        let handle = self.metadata.get_and_lock_file(user, name).await?;
        let content = self.disk.load(user, name).await;
        self.metadata.unlock_file(handle);

        let mut reply = codec::encode(&content?);
        reply.push('\n');
        Ok(reply)
    }

    async fn delete(&self, user: &str, name: &str) -> Result<String> {
        let handle = self.metadata.get_and_lock_file(user, name).await?;

        if !self.disk.delete(user, name).await? {
            warn!("{}/{} was registered but missing on disk", user, name);
        }
        self.metadata.remove_file(user, name)?;
        self.metadata.unlock_file(handle);

        Ok(protocol::DELETE_OK.to_string())
    }
}

/// Reply text for a failed task.
fn failure_reply(command: &Command, error: &CubbyError) -> String {
    match error {
        CubbyError::Io(_) | CubbyError::Storage(_) => protocol::storage_failure(match command {
            Command::Upload { .. } => "save",
            Command::Download => "read",
            Command::Delete => "delete",
            Command::List => "list",
        }),
        _ => protocol::error_reply(error),
    }
}

/// Fixed set of workers sharing one task queue.
#[derive(Debug)]
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Start `count` workers.
    pub fn spawn(
        count: usize,
        tasks: Arc<TaskQueue>,
        metadata: Arc<MetadataStore>,
        disk: DiskStore,
    ) -> Self {
        let handles = (0..count)
            .map(|id| {
                let worker = Worker::new(id, Arc::clone(&tasks), Arc::clone(&metadata), disk.clone());
                tokio::spawn(worker.run())
            })
            .collect();
        info!("Started {} workers", count);
        Self { handles }
    }

    /// Number of workers.
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// Whether the pool has no workers.
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Wait for every worker to exit. Close the task queue first.
    pub async fn join(self) {
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!("Worker task failed: {}", e);
            }
        }
        info!("All workers stopped");
    }
}
