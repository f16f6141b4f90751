//! Connection handlers.
//!
//! A fixed pool of handlers takes accepted connections from the connection
//! queue and serves each one for its whole lifetime, one command at a time.
//! Auth commands are answered here; file commands become tasks for the
//! worker pool, which writes the reply straight to the client.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::protocol::{self, Request};
use super::session::Session;
use crate::auth::{validate_filename, validate_password, validate_username};
use crate::file::{DiskStore, MetadataStore};
use crate::pipeline::{Command, EnqueueError, ReplySink, Shutdown, Task, TaskQueue, WorkQueue};
use crate::{CubbyError, Result};

/// An accepted client connection waiting for a handler.
#[derive(Debug)]
pub struct Connection {
    pub stream: TcpStream,
    pub peer_addr: SocketAddr,
}

/// Bounded queue between the acceptor and the handler pool.
pub type ConnectionQueue = WorkQueue<Connection>;

/// Everything a handler needs to serve a connection.
#[derive(Debug, Clone)]
pub struct HandlerContext {
    pub metadata: Arc<MetadataStore>,
    pub disk: DiskStore,
    pub tasks: Arc<TaskQueue>,
    pub shutdown: Arc<Shutdown>,
    /// Longest accepted command line, newline included.
    pub max_line_bytes: usize,
    /// Longest accepted upload payload line, newline included.
    pub max_payload_bytes: usize,
    /// How long to wait for a task before giving up on the connection.
    pub task_timeout: Option<Duration>,
}

/// Read one line of at most `limit` bytes.
///
/// Returns `None` at end of input. A line that does not fit is a protocol
/// error.
async fn read_line_limited<R>(reader: &mut R, limit: usize) -> Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    let n = (&mut *reader)
        .take(limit as u64)
        .read_until(b'\n', &mut buf)
        .await?;

    if n == 0 {
        return Ok(None);
    }
    if buf.last() != Some(&b'\n') && n >= limit {
        return Err(CubbyError::Protocol(format!("line exceeds {limit} bytes")));
    }
    Ok(Some(String::from_utf8_lossy(&buf).into_owned()))
}

/// Skip input up to and including the next newline.
///
/// Returns `false` if the input ended first.
async fn discard_line<R>(reader: &mut R) -> Result<bool>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        let buf = reader.fill_buf().await?;
        if buf.is_empty() {
            return Ok(false);
        }
        match buf.iter().position(|&b| b == b'\n') {
            Some(i) => {
                reader.consume(i + 1);
                return Ok(true);
            }
            None => {
                let n = buf.len();
                reader.consume(n);
            }
        }
    }
}

async fn send(sink: &mut ReplySink, reply: &str) -> Result<()> {
    sink.write_all(reply.as_bytes()).await?;
    sink.flush().await?;
    Ok(())
}

/// Serve one client until it disconnects, misbehaves or shutdown starts.
pub async fn serve_connection<R, W>(ctx: &HandlerContext, reader: R, writer: W, peer_addr: SocketAddr)
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut session = Session::new(peer_addr);
    let mut reader = BufReader::new(reader);
    let mut sink: ReplySink = Box::new(writer);

    info!("Session {} started for {}", session.id(), peer_addr);

    loop {
        let line = tokio::select! {
            line = read_line_limited(&mut reader, ctx.max_line_bytes) => line,
            _ = ctx.shutdown.cancelled() => {
                debug!("Session {} closing for shutdown", session.id());
                break;
            }
        };

        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(CubbyError::Protocol(e)) => {
                debug!("Session {}: {}", session.id(), e);
                let resynced = tokio::select! {
                    resynced = discard_line(&mut reader) => resynced,
                    _ = ctx.shutdown.cancelled() => Ok(false),
                };
                if !matches!(resynced, Ok(true)) || send(&mut sink, protocol::LINE_TOO_LONG).await.is_err() {
                    break;
                }
                continue;
            }
            Err(e) => {
                warn!("Session {}: {}", session.id(), e);
                break;
            }
        };

        match handle_line(ctx, &mut session, &mut reader, sink, &line).await {
            Ok(returned) => sink = returned,
            Err(e) => {
                warn!("Session {} dropped: {}", session.id(), e);
                break;
            }
        }
    }

    session.close();
    info!("Session {} ended for {}", session.id(), peer_addr);
}

/// Handle one request line. The writer is handed back unless the
/// connection has to be closed.
async fn handle_line<R>(
    ctx: &HandlerContext,
    session: &mut Session,
    reader: &mut BufReader<R>,
    mut sink: ReplySink,
    line: &str,
) -> Result<ReplySink>
where
    R: AsyncRead + Unpin + Send,
{
    let request = match protocol::parse_request(line) {
        Ok(request) => request,
        Err(e) => {
            debug!("Session {}: {}", session.id(), e);
            if let Some(reply) = e.reply() {
                send(&mut sink, &reply).await?;
            }
            return Ok(sink);
        }
    };

    if request.is_file_command() && !session.is_authenticated() {
        send(&mut sink, protocol::LOGIN_FIRST).await?;
        return Ok(sink);
    }

    let reply = match request {
        Request::Signup { username, password } => signup(ctx, session, &username, &password).await,
        Request::Login { username, password } => login(ctx, session, &username, &password),
        Request::Logout => match session.logout() {
            Some(_) => protocol::LOGOUT_OK.to_string(),
            None => protocol::NOT_LOGGED_IN.to_string(),
        },
        Request::Upload { filename, size } => {
            if let Err(e) = validate_filename(&filename) {
                send(&mut sink, &protocol::error_reply(&e.into())).await?;
                return Ok(sink);
            }
            send(&mut sink, protocol::READY_TO_RECEIVE).await?;

            let payload = tokio::select! {
                payload = read_line_limited(reader, ctx.max_payload_bytes) => payload?,
                _ = ctx.shutdown.cancelled() => None,
            };
            let Some(payload) = payload else {
                return Err(CubbyError::Protocol("connection closed before upload data".to_string()));
            };

            let task = file_task(session, Command::Upload { payload }, filename, sink)
                .with_declared_size(size);
            return run_task(ctx, task).await;
        }
        Request::Download { filename } | Request::Delete { filename }
            if validate_filename(&filename).is_err() =>
        {
            protocol::error_reply(&CubbyError::NotFound(format!("File {filename}")))
        }
        Request::Download { filename } => {
            return run_task(ctx, file_task(session, Command::Download, filename, sink)).await;
        }
        Request::Delete { filename } => {
            return run_task(ctx, file_task(session, Command::Delete, filename, sink)).await;
        }
        Request::List => {
            return run_task(ctx, file_task(session, Command::List, String::new(), sink)).await;
        }
    };

    send(&mut sink, &reply).await?;
    Ok(sink)
}

fn file_task(session: &Session, command: Command, filename: String, sink: ReplySink) -> Task {
    Task::new(command, session.username().unwrap_or_default(), filename, sink)
}

/// Hand a task to the workers and wait for it. The worker writes the reply.
async fn run_task(ctx: &HandlerContext, task: Task) -> Result<ReplySink> {
    let handle = match ctx.tasks.submit(task) {
        Ok(handle) => handle,
        Err(e) => {
            let (error, task) = match e {
                EnqueueError::Full(name, task) => (CubbyError::QueueFull(name), task),
                EnqueueError::Closed(name, task) => (CubbyError::QueueClosed(name), task),
            };
            let mut sink = task.into_sink();
            let _ = send(&mut sink, protocol::SERVER_BUSY).await;
            return Err(error);
        }
    };

    let outcome = handle.wait_timeout(ctx.task_timeout).await?;
    Ok(outcome.sink)
}

async fn signup(ctx: &HandlerContext, session: &mut Session, username: &str, password: &str) -> String {
    if let Some(current) = session.username() {
        return protocol::already_logged_in(current);
    }
    if let Err(e) = validate_username(username).and_then(|()| validate_password(password)) {
        return protocol::error_reply(&e.into());
    }
    if let Err(e) = ctx.metadata.add_user(username, password) {
        return protocol::error_reply(&e);
    }
    if let Err(e) = ctx.disk.create_user_dir(username).await {
        warn!("Could not create storage directory for {}: {}", username, e);
    }

    session.login(username);
    protocol::SIGNUP_OK.to_string()
}

fn login(ctx: &HandlerContext, session: &mut Session, username: &str, password: &str) -> String {
    if let Some(current) = session.username() {
        return protocol::already_logged_in(current);
    }
    if !ctx.metadata.authenticate(username, password) {
        info!("Session {}: failed login for {}", session.id(), username);
        return protocol::INVALID_CREDENTIALS.to_string();
    }

    session.login(username);
    protocol::LOGIN_OK.to_string()
}

/// Fixed set of connection handlers sharing one connection queue.
#[derive(Debug)]
pub struct HandlerPool {
    handles: Vec<JoinHandle<()>>,
}

impl HandlerPool {
    /// Start `count` handlers.
    pub fn spawn(count: usize, connections: Arc<ConnectionQueue>, ctx: HandlerContext) -> Self {
        let handles = (0..count)
            .map(|id| {
                let connections = Arc::clone(&connections);
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    debug!("Handler {} started", id);
                    while let Some(connection) = connections.dequeue().await {
                        if ctx.shutdown.is_triggered() {
                            debug!("Handler {}: dropping {} during shutdown", id, connection.peer_addr);
                            continue;
                        }
                        let Connection { stream, peer_addr } = connection;
                        let (reader, writer) = stream.into_split();
                        serve_connection(&ctx, reader, writer, peer_addr).await;
                    }
                    debug!("Handler {} stopped", id);
                })
            })
            .collect();
        info!("Started {} connection handlers", count);
        Self { handles }
    }

    /// Number of handlers.
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// Whether the pool has no handlers.
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Wait for every handler to exit. Close the connection queue first.
    pub async fn join(self) {
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!("Connection handler failed: {}", e);
            }
        }
        info!("All connection handlers stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec;
    use crate::file::MetadataLimits;
    use crate::pipeline::{QueueOrder, WorkerPool};
    use tempfile::TempDir;
    use tokio::io::{DuplexStream, ReadHalf, WriteHalf};

    struct Fixture {
        _temp_dir: TempDir,
        ctx: HandlerContext,
        _workers: WorkerPool,
    }

    async fn fixture() -> Fixture {
        let temp_dir = TempDir::new().unwrap();
        let disk = DiskStore::new(temp_dir.path()).await.unwrap();
        let metadata = Arc::new(MetadataStore::new(MetadataLimits {
            max_users: 10,
            max_files_per_user: 10,
            quota_bytes: 64,
        }));
        let tasks = Arc::new(TaskQueue::new(QueueOrder::Fifo, 0));
        let workers = WorkerPool::spawn(2, Arc::clone(&tasks), Arc::clone(&metadata), disk.clone());
        let ctx = HandlerContext {
            metadata,
            disk,
            tasks,
            shutdown: Arc::new(Shutdown::new()),
            max_line_bytes: 128,
            max_payload_bytes: 256,
            task_timeout: Some(Duration::from_secs(5)),
        };
        Fixture {
            _temp_dir: temp_dir,
            ctx,
            _workers: workers,
        }
    }

    struct Client {
        reader: BufReader<ReadHalf<DuplexStream>>,
        writer: WriteHalf<DuplexStream>,
    }

    impl Client {
        async fn send(&mut self, line: &str) {
            self.writer.write_all(line.as_bytes()).await.unwrap();
            self.writer.write_all(b"\n").await.unwrap();
        }

        async fn recv(&mut self) -> String {
            let mut line = String::new();
            self.reader.read_line(&mut line).await.unwrap();
            line
        }

        async fn request(&mut self, line: &str) -> String {
            self.send(line).await;
            self.recv().await
        }
    }

    fn connect(f: &Fixture) -> (Client, JoinHandle<()>) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (server_reader, server_writer) = tokio::io::split(server);
        let ctx = f.ctx.clone();
        let peer: SocketAddr = "127.0.0.1:50000".parse().unwrap();
        let task = tokio::spawn(async move {
            serve_connection(&ctx, server_reader, server_writer, peer).await;
        });

        let (reader, writer) = tokio::io::split(client);
        (
            Client {
                reader: BufReader::new(reader),
                writer,
            },
            task,
        )
    }

    #[tokio::test]
    async fn test_read_line_limited() {
        let mut input: &[u8] = b"short\nthis line is too long\n";
        let mut reader = BufReader::new(&mut input);

        assert_eq!(
            read_line_limited(&mut reader, 10).await.unwrap(),
            Some("short\n".to_string())
        );
        assert!(matches!(
            read_line_limited(&mut reader, 10).await,
            Err(CubbyError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_read_line_limited_eof() {
        let mut input: &[u8] = b"tail";
        let mut reader = BufReader::new(&mut input);

        assert_eq!(
            read_line_limited(&mut reader, 10).await.unwrap(),
            Some("tail".to_string())
        );
        assert_eq!(read_line_limited(&mut reader, 10).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_file_commands_require_login() {
        let f = fixture().await;
        let (mut client, _task) = connect(&f);

        assert_eq!(client.request("LIST").await, protocol::LOGIN_FIRST);
        assert_eq!(client.request("UPLOAD a.txt").await, protocol::LOGIN_FIRST);
        assert_eq!(client.request("logout").await, protocol::NOT_LOGGED_IN);
        assert_eq!(client.request("bogus").await, protocol::UNKNOWN_COMMAND);
        assert!(f.ctx.tasks.is_empty());
    }

    #[tokio::test]
    async fn test_signup_upload_list_download() {
        let f = fixture().await;
        let (mut client, _task) = connect(&f);

        assert_eq!(client.request("signup alice p1").await, protocol::SIGNUP_OK);
        assert_eq!(
            client.request("login alice p1").await,
            "*** Error: Already logged in as 'alice'\n"
        );

        assert_eq!(client.request("UPLOAD a.txt 13").await, protocol::READY_TO_RECEIVE);
        assert_eq!(
            client.request(&codec::encode(b"Hello, World!")).await,
            protocol::UPLOAD_OK
        );
        assert_eq!(client.request("LIST").await, "a.txt 13\n");

        let encoded = client.request("DOWNLOAD a.txt").await;
        assert_eq!(codec::decode(&encoded).unwrap(), b"Hello, World!");

        assert_eq!(client.request("logout").await, protocol::LOGOUT_OK);
        assert_eq!(client.request("login alice wrong").await, protocol::INVALID_CREDENTIALS);
        assert_eq!(client.request("login alice p1").await, protocol::LOGIN_OK);
    }

    #[tokio::test]
    async fn test_upload_rejects_path_names() {
        let f = fixture().await;
        let (mut client, _task) = connect(&f);
        client.request("signup alice p1").await;

        let reply = client.request("UPLOAD ..").await;

        assert!(reply.starts_with("*** Error: Invalid input"));
        assert_eq!(client.request("LIST").await, "No files\n");
    }

    #[tokio::test]
    async fn test_overlong_line_keeps_connection() {
        let f = fixture().await;
        let (mut client, _task) = connect(&f);

        let reply = client.request(&format!("signup {} pw", "a".repeat(500))).await;

        assert_eq!(reply, protocol::LINE_TOO_LONG);
        assert_eq!(client.request("signup alice p1").await, protocol::SIGNUP_OK);
        assert_eq!(client.request("LIST").await, "No files\n");
    }

    #[tokio::test]
    async fn test_overlong_payload_closes_connection() {
        let f = fixture().await;
        let (mut client, task) = connect(&f);
        client.request("signup alice p1").await;

        assert_eq!(client.request("UPLOAD big.bin").await, protocol::READY_TO_RECEIVE);
        client.send(&"A".repeat(1000)).await;

        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(client.recv().await, "");
        assert_eq!(f.ctx.metadata.file_size("alice", "big.bin").unwrap(), None);
    }

    #[tokio::test]
    async fn test_discard_line() {
        let mut input: &[u8] = b"rest of a long line\nnext\nunterminated";
        let mut reader = BufReader::new(&mut input);

        assert!(discard_line(&mut reader).await.unwrap());
        assert_eq!(
            read_line_limited(&mut reader, 10).await.unwrap(),
            Some("next\n".to_string())
        );
        assert!(!discard_line(&mut reader).await.unwrap());
    }

    #[tokio::test]
    async fn test_shutdown_closes_idle_connection() {
        let f = fixture().await;
        let (mut client, task) = connect(&f);
        assert_eq!(client.request("signup bob pw").await, protocol::SIGNUP_OK);

        f.ctx.shutdown.trigger();

        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(client.recv().await, "");
    }

    #[tokio::test]
    async fn test_task_timeout_closes_connection() {
        let mut f = fixture().await;
        // Nobody serves this queue.
        f.ctx.tasks = Arc::new(TaskQueue::new(QueueOrder::Fifo, 0));
        f.ctx.task_timeout = Some(Duration::from_millis(50));
        let (mut client, task) = connect(&f);
        client.request("signup alice p1").await;

        client.send("LIST").await;

        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        // The stranded task still owns the writer.
        assert_eq!(f.ctx.tasks.len(), 1);
        drop(f.ctx.tasks.next().await.unwrap());
        assert_eq!(client.recv().await, "");
    }

    #[tokio::test]
    async fn test_full_task_queue_replies_busy_and_closes() {
        let mut f = fixture().await;
        f.ctx.tasks = Arc::new(TaskQueue::new(QueueOrder::Fifo, 1));
        f.ctx
            .tasks
            .submit(Task::new(Command::List, "x", "", Box::new(tokio::io::sink())))
            .unwrap();
        let (mut client, task) = connect(&f);
        client.request("signup alice p1").await;

        assert_eq!(client.request("LIST").await, protocol::SERVER_BUSY);

        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}
