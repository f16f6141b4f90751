//! Test helpers for E2E tests.
//!
//! Provides TestServer, TestClient, and helper functions for E2E testing.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use cubby::config::Config;
use cubby::{codec, MetadataStore, Server, Shutdown};

/// Default timeout for test operations.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// How long to wait for more lines of a multi-line reply.
pub const QUIET_PERIOD: Duration = Duration::from_millis(200);

/// Test client speaking the line protocol.
pub struct TestClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl TestClient {
    /// Connect to the server at the given address.
    pub async fn connect(addr: SocketAddr) -> Result<Self, std::io::Error> {
        let stream = TcpStream::connect(addr).await?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(reader),
            writer,
        })
    }

    /// Send a line (with LF) to the server.
    pub async fn send_line(&mut self, line: &str) -> Result<(), std::io::Error> {
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await
    }

    /// Receive one line. Returns an empty string at EOF.
    pub async fn recv_line(&mut self) -> Result<String, std::io::Error> {
        self.recv_line_timeout(DEFAULT_TIMEOUT).await
    }

    /// Receive one line with custom timeout.
    pub async fn recv_line_timeout(&mut self, duration: Duration) -> Result<String, std::io::Error> {
        let mut line = String::new();
        match timeout(duration, self.reader.read_line(&mut line)).await {
            Ok(Ok(_)) => Ok(line),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "Timeout waiting for a reply line",
            )),
        }
    }

    /// Receive lines until the server goes quiet.
    pub async fn recv_lines(&mut self) -> Result<Vec<String>, std::io::Error> {
        let mut lines = vec![self.recv_line().await?];
        loop {
            match self.recv_line_timeout(QUIET_PERIOD).await {
                Ok(line) if line.is_empty() => break,
                Ok(line) => lines.push(line),
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => break,
                Err(e) => return Err(e),
            }
        }
        Ok(lines)
    }

    /// Send a command and receive its one-line reply.
    pub async fn request(&mut self, line: &str) -> Result<String, std::io::Error> {
        self.send_line(line).await?;
        self.recv_line().await
    }

    /// Sign up and expect success.
    pub async fn signup(&mut self, username: &str, password: &str) -> Result<bool, std::io::Error> {
        let reply = self.request(&format!("signup {username} {password}")).await?;
        Ok(reply.starts_with("Signup successful"))
    }

    /// Log in and report whether it worked.
    pub async fn login(&mut self, username: &str, password: &str) -> Result<bool, std::io::Error> {
        let reply = self.request(&format!("login {username} {password}")).await?;
        Ok(reply == "Login successful\n")
    }

    /// Upload `content` as `filename` and return the final reply.
    pub async fn upload(&mut self, filename: &str, content: &[u8]) -> Result<String, std::io::Error> {
        let ready = self
            .request(&format!("UPLOAD {filename} {}", content.len()))
            .await?;
        if ready != "READY_TO_RECEIVE\n" {
            return Ok(ready);
        }
        self.request(&codec::encode(content)).await
    }

    /// Download a file. Returns the error reply if the server refused.
    pub async fn download(&mut self, filename: &str) -> Result<Result<Vec<u8>, String>, std::io::Error> {
        let reply = self.request(&format!("DOWNLOAD {filename}")).await?;
        if reply.starts_with("***") {
            return Ok(Err(reply));
        }
        Ok(codec::decode(&reply).map_err(|e| e.to_string()))
    }

    /// List files as the reply lines without terminators.
    pub async fn list(&mut self) -> Result<Vec<String>, std::io::Error> {
        self.send_line("LIST").await?;
        let lines = self.recv_lines().await?;
        Ok(lines.iter().map(|l| l.trim_end().to_string()).collect())
    }
}

/// Server running on an ephemeral port with a temporary storage root.
pub struct TestServer {
    addr: SocketAddr,
    storage: TempDir,
    metadata: Arc<MetadataStore>,
    shutdown: Arc<Shutdown>,
    handle: Option<JoinHandle<cubby::Result<()>>>,
}

impl TestServer {
    /// Start a server with the test configuration.
    pub async fn new() -> Result<Self, Box<dyn std::error::Error>> {
        Self::with_config(test_config()).await
    }

    /// Start a server with custom configuration. The storage root and the
    /// listen address are always replaced.
    pub async fn with_config(mut config: Config) -> Result<Self, Box<dyn std::error::Error>> {
        let storage = TempDir::new()?;
        config.server.host = "127.0.0.1".to_string();
        config.server.port = 0;
        config.storage.root = storage.path().to_string_lossy().into_owned();

        let server = Server::bind(config).await?;
        let addr = server.local_addr()?;
        let metadata = server.metadata();
        let shutdown = server.shutdown_handle();
        let handle = tokio::spawn(server.run());

        Ok(Self {
            addr,
            storage,
            metadata,
            shutdown,
            handle: Some(handle),
        })
    }

    /// Get the server address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Get the metadata store.
    pub fn metadata(&self) -> &MetadataStore {
        &self.metadata
    }

    /// Path of a stored file.
    pub fn file_path(&self, username: &str, filename: &str) -> std::path::PathBuf {
        self.storage.path().join(username).join(filename)
    }

    /// Get the shutdown flag.
    pub fn shutdown(&self) -> Arc<Shutdown> {
        Arc::clone(&self.shutdown)
    }

    /// Trigger shutdown and wait for the server to drain.
    pub async fn stop(&mut self) -> cubby::Result<()> {
        self.shutdown.trigger();
        match self.handle.take() {
            Some(handle) => timeout(DEFAULT_TIMEOUT, handle)
                .await
                .expect("server did not stop in time")
                .expect("server task panicked"),
            None => Ok(()),
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.trigger();
    }
}

/// Configuration used by the E2E tests: small pools and a 1 KiB quota.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.server.handler_threads = 4;
    config.workers.count = 2;
    config.workers.task_timeout_secs = 10;
    config.storage.quota_bytes = 1024;
    config.storage.max_users = 10;
    config.storage.max_files_per_user = 8;
    config
}

/// Start a server, connect a client and sign it up.
pub async fn signed_up_client(
    server: &TestServer,
    username: &str,
    password: &str,
) -> TestClient {
    let mut client = TestClient::connect(server.addr()).await.unwrap();
    assert!(client.signup(username, password).await.unwrap());
    client
}
