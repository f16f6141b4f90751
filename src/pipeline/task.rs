//! File tasks and their completion promise.
//!
//! A connection handler builds a [`Task`], hands it to the [`TaskQueue`] and
//! keeps only the [`TaskHandle`]. The task owns the client's write half
//! while it is in flight; the worker writes the reply into it and returns it
//! through the handle together with the result. Every dequeued task is
//! completed exactly once, and a completion that is dropped without being
//! sent surfaces as [`CubbyError::TaskAbandoned`] instead of a hang.

use std::fmt;
use std::time::Duration;

use tokio::io::AsyncWrite;
use tokio::sync::oneshot;
use tracing::debug;
use uuid::Uuid;

use super::queue::{EnqueueError, QueueOrder, WorkQueue};
use crate::{CubbyError, Result};

/// Write half of a client connection.
pub type ReplySink = Box<dyn AsyncWrite + Send + Unpin>;

/// File operation carried by a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Store a file. The payload is the Base64 text sent by the client.
    Upload {
        /// Encoded file content.
        payload: String,
    },
    /// Send a file back to the client.
    Download,
    /// Remove a file.
    Delete,
    /// List the user's files.
    List,
}

impl Command {
    /// Protocol name of the command.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Upload { .. } => "UPLOAD",
            Command::Download => "DOWNLOAD",
            Command::Delete => "DELETE",
            Command::List => "LIST",
        }
    }
}

/// A unit of file work for the worker pool.
pub struct Task {
    /// Unique task identifier.
    pub id: Uuid,
    /// Operation to run.
    pub command: Command,
    /// Owner of the file.
    pub username: String,
    /// Target file (empty for `LIST`).
    pub filename: String,
    /// Size the client announced for an upload, if any.
    pub declared_size: Option<u64>,
    /// Scheduling priority, only honored by a priority-ordered queue.
    pub priority: i32,
    sink: ReplySink,
}

impl Task {
    /// Create a task that replies through `sink`.
    pub fn new(
        command: Command,
        username: impl Into<String>,
        filename: impl Into<String>,
        sink: ReplySink,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            command,
            username: username.into(),
            filename: filename.into(),
            declared_size: None,
            priority: 0,
            sink,
        }
    }

    /// Set the size the decoded upload must have.
    pub fn with_declared_size(mut self, size: Option<u64>) -> Self {
        self.declared_size = size;
        self
    }

    /// Set the scheduling priority.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Writer for the reply.
    pub fn sink_mut(&mut self) -> &mut ReplySink {
        &mut self.sink
    }

    /// Give the writer back.
    pub fn into_sink(self) -> ReplySink {
        self.sink
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("command", &self.command.name())
            .field("username", &self.username)
            .field("filename", &self.filename)
            .field("declared_size", &self.declared_size)
            .field("priority", &self.priority)
            .finish_non_exhaustive()
    }
}

/// Result of a finished task.
pub struct TaskOutcome {
    /// Identifier of the finished task.
    pub task_id: Uuid,
    /// `Ok` if the operation succeeded. The reply has been written either way.
    pub result: Result<()>,
    /// The client's writer, returned to the handler.
    pub sink: ReplySink,
}

impl TaskOutcome {
    /// Numeric result code: 0 on success, -1 on failure.
    pub fn code(&self) -> i32 {
        if self.result.is_ok() {
            0
        } else {
            -1
        }
    }
}

impl fmt::Debug for TaskOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskOutcome")
            .field("task_id", &self.task_id)
            .field("result", &self.result)
            .finish_non_exhaustive()
    }
}

/// Sending side of a task's completion signal. Owned by the worker.
#[derive(Debug)]
pub struct Completion {
    task_id: Uuid,
    tx: oneshot::Sender<TaskOutcome>,
}

impl Completion {
    /// Mark the task done and wake its handler.
    pub fn complete(self, result: Result<()>, sink: ReplySink) {
        let outcome = TaskOutcome {
            task_id: self.task_id,
            result,
            sink,
        };
        if self.tx.send(outcome).is_err() {
            debug!("Task {} finished after its handler stopped waiting", self.task_id);
        }
    }
}

/// Receiving side of a task's completion signal. Owned by the handler.
#[derive(Debug)]
pub struct TaskHandle {
    task_id: Uuid,
    rx: oneshot::Receiver<TaskOutcome>,
}

impl TaskHandle {
    /// Identifier of the awaited task.
    pub fn task_id(&self) -> Uuid {
        self.task_id
    }

    /// Wait for the task to finish.
    pub async fn wait(self) -> Result<TaskOutcome> {
        let task_id = self.task_id;
        self.rx.await.map_err(|_| CubbyError::TaskAbandoned(task_id))
    }

    /// Wait for the task, giving up after `limit` if one is set.
    pub async fn wait_timeout(self, limit: Option<Duration>) -> Result<TaskOutcome> {
        let Some(limit) = limit else {
            return self.wait().await;
        };
        let task_id = self.task_id;
        tokio::time::timeout(limit, self.wait())
            .await
            .map_err(|_| CubbyError::TaskTimeout(task_id))?
    }
}

/// A queued task together with its completion signal.
#[derive(Debug)]
pub struct Job {
    /// The work.
    pub task: Task,
    /// Fired when the work is done.
    pub completion: Completion,
}

/// Queue bridging connection handlers and workers.
#[derive(Debug)]
pub struct TaskQueue {
    queue: WorkQueue<Job>,
}

impl TaskQueue {
    /// Create a task queue. A `capacity` of 0 means unbounded.
    pub fn new(order: QueueOrder, capacity: usize) -> Self {
        Self {
            queue: WorkQueue::new("task", order, capacity),
        }
    }

    /// Queue a task and return the handle its creator waits on.
    ///
    /// A rejected task is handed back so its writer can still be used.
    pub fn submit(&self, task: Task) -> std::result::Result<TaskHandle, EnqueueError<Task>> {
        let (tx, rx) = oneshot::channel();
        let task_id = task.id;
        let priority = task.priority;
        let job = Job {
            task,
            completion: Completion { task_id, tx },
        };

        self.queue
            .enqueue_with_priority(job, priority)
            .map_err(|e| match e {
                EnqueueError::Full(name, job) => EnqueueError::Full(name, job.task),
                EnqueueError::Closed(name, job) => EnqueueError::Closed(name, job.task),
            })?;
        debug!("Queued task {} (pending: {})", task_id, self.queue.len());
        Ok(TaskHandle { task_id, rx })
    }

    /// Next job for a worker; `None` once the queue is closed and drained.
    pub async fn next(&self) -> Option<Job> {
        self.queue.dequeue().await
    }

    /// Stop accepting tasks and wake idle workers.
    pub fn close(&self) {
        self.queue.close();
    }

    /// Number of queued tasks.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Whether no tasks are queued.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    fn sink() -> ReplySink {
        Box::new(tokio::io::sink())
    }

    #[test]
    fn test_command_names() {
        assert_eq!(
            Command::Upload {
                payload: String::new()
            }
            .name(),
            "UPLOAD"
        );
        assert_eq!(Command::Download.name(), "DOWNLOAD");
        assert_eq!(Command::Delete.name(), "DELETE");
        assert_eq!(Command::List.name(), "LIST");
    }

    #[test]
    fn test_task_builders() {
        let task = Task::new(Command::List, "alice", "", sink())
            .with_priority(3)
            .with_declared_size(Some(13));

        assert_eq!(task.username, "alice");
        assert_eq!(task.priority, 3);
        assert_eq!(task.declared_size, Some(13));
        assert!(format!("{task:?}").contains("LIST"));
    }

    #[tokio::test]
    async fn test_submit_and_complete() {
        let queue = TaskQueue::new(QueueOrder::Fifo, 0);
        let task = Task::new(Command::Delete, "alice", "a.txt", sink());
        let task_id = task.id;

        let handle = queue.submit(task).unwrap();
        assert_eq!(handle.task_id(), task_id);
        assert_eq!(queue.len(), 1);

        let job = queue.next().await.unwrap();
        assert_eq!(job.task.filename, "a.txt");
        let mut sink = job.task.into_sink();
        sink.write_all(b"DELETE_SUCCESS\n").await.unwrap();
        job.completion.complete(Ok(()), sink);

        let outcome = handle.wait().await.unwrap();
        assert_eq!(outcome.task_id, task_id);
        assert_eq!(outcome.code(), 0);
    }

    #[tokio::test]
    async fn test_failed_outcome_code() {
        let queue = TaskQueue::new(QueueOrder::Fifo, 0);
        let handle = queue
            .submit(Task::new(Command::Download, "alice", "x", sink()))
            .unwrap();

        let job = queue.next().await.unwrap();
        job.completion.complete(
            Err(CubbyError::NotFound("File x".to_string())),
            job.task.into_sink(),
        );

        let outcome = handle.wait().await.unwrap();
        assert_eq!(outcome.code(), -1);
    }

    #[tokio::test]
    async fn test_dropped_job_reports_abandoned() {
        let queue = TaskQueue::new(QueueOrder::Fifo, 0);
        let handle = queue
            .submit(Task::new(Command::List, "alice", "", sink()))
            .unwrap();

        drop(queue.next().await.unwrap());

        let result = handle.wait().await;
        assert!(matches!(result, Err(CubbyError::TaskAbandoned(_))));
    }

    #[tokio::test]
    async fn test_wait_timeout() {
        let queue = TaskQueue::new(QueueOrder::Fifo, 0);
        let handle = queue
            .submit(Task::new(Command::List, "alice", "", sink()))
            .unwrap();
        let task_id = handle.task_id();

        let result = handle
            .wait_timeout(Some(Duration::from_millis(20)))
            .await;

        assert!(matches!(result, Err(CubbyError::TaskTimeout(id)) if id == task_id));
    }

    #[tokio::test]
    async fn test_submit_to_full_queue() {
        let queue = TaskQueue::new(QueueOrder::Fifo, 1);
        let _first = queue
            .submit(Task::new(Command::List, "alice", "", sink()))
            .unwrap();

        let err = queue
            .submit(Task::new(Command::List, "bob", "", sink()))
            .unwrap_err();

        assert!(matches!(err, EnqueueError::Full("task", _)));
        assert_eq!(err.into_inner().username, "bob");
    }

    #[tokio::test]
    async fn test_priority_queue_serves_high_priority_first() {
        let queue = TaskQueue::new(QueueOrder::Priority, 0);
        let _low = queue
            .submit(Task::new(Command::List, "low", "", sink()))
            .unwrap();
        let _high = queue
            .submit(Task::new(Command::List, "high", "", sink()).with_priority(9))
            .unwrap();

        assert_eq!(queue.next().await.unwrap().task.username, "high");
        assert_eq!(queue.next().await.unwrap().task.username, "low");
    }
}
