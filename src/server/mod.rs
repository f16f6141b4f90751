//! Cubby TCP server.
//!
//! The server is a fixed pipeline: one acceptor, a pool of connection
//! handlers behind the connection queue, and a pool of workers behind the
//! task queue. All of them share one metadata store and one disk store.

mod handler;
mod listener;
pub mod protocol;
mod session;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::config::Config;
use crate::file::{DiskStore, MetadataLimits, MetadataStore};
use crate::pipeline::{QueueOrder, Shutdown, TaskQueue, WorkerPool};
use crate::Result;

pub use handler::{serve_connection, Connection, ConnectionQueue, HandlerContext, HandlerPool};
pub use listener::Listener;
pub use protocol::{parse_request, ParseError, Request};
pub use session::{Session, SessionState};

/// A bound, not yet running server.
#[derive(Debug)]
pub struct Server {
    config: Config,
    listener: Listener,
    metadata: Arc<MetadataStore>,
    disk: DiskStore,
    shutdown: Arc<Shutdown>,
}

impl Server {
    /// Validate the configuration, open the storage root and bind the
    /// listening socket.
    pub async fn bind(config: Config) -> Result<Self> {
        config.validate()?;

        let disk = DiskStore::new(&config.storage.root).await?;
        let metadata = Arc::new(MetadataStore::new(MetadataLimits::from(&config.storage)));
        let listener = Listener::bind(&config.server).await?;

        Ok(Self {
            config,
            listener,
            metadata,
            disk,
            shutdown: Arc::new(Shutdown::new()),
        })
    }

    /// Get the local address the server is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Flag that stops the server when triggered.
    pub fn shutdown_handle(&self) -> Arc<Shutdown> {
        Arc::clone(&self.shutdown)
    }

    /// The server's metadata store.
    pub fn metadata(&self) -> Arc<MetadataStore> {
        Arc::clone(&self.metadata)
    }

    /// Run until shutdown is triggered, then drain.
    ///
    /// Draining stops the acceptor, lets every handler finish the command it
    /// is serving, then lets the workers empty the task queue. Returns once
    /// every pool has exited.
    pub async fn run(self) -> Result<()> {
        let Server {
            config,
            listener,
            metadata,
            disk,
            shutdown,
        } = self;

        let order = if config.workers.priority_queue {
            QueueOrder::Priority
        } else {
            QueueOrder::Fifo
        };
        let tasks = Arc::new(TaskQueue::new(order, config.workers.task_queue_capacity));
        let connections = Arc::new(ConnectionQueue::new(
            "connection",
            QueueOrder::Fifo,
            config.server.connection_queue_capacity,
        ));

        let workers = WorkerPool::spawn(
            config.workers.count,
            Arc::clone(&tasks),
            Arc::clone(&metadata),
            disk.clone(),
        );
        let task_timeout = match config.workers.task_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };
        let handlers = HandlerPool::spawn(
            config.server.handler_threads,
            Arc::clone(&connections),
            HandlerContext {
                metadata,
                disk,
                tasks: Arc::clone(&tasks),
                shutdown: Arc::clone(&shutdown),
                max_line_bytes: config.server.max_line_bytes,
                max_payload_bytes: config.max_payload_line_bytes(),
                task_timeout,
            },
        );

        listener.run(&connections, &shutdown).await;

        info!("Draining: waiting for connection handlers");
        connections.close();
        handlers.join().await;

        info!("Draining: waiting for {} queued tasks", tasks.len());
        tasks.close();
        workers.join().await;

        info!("Server stopped");
        Ok(())
    }
}
