//! Worker side of the rendezvous protocol.
//!
//! Flow:
//! 1. Bind a Unix listener at a fresh address, mint a token
//! 2. Write the handshake on the control channel
//! 3. Run the root context on the control channel
//! 4. Concurrently accept clone connections: read the token, compare,
//!    spawn one context per accepted connection
//! 5. When the root context returns, remove the socket and return; the
//!    process exiting ends every clone context

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rendezvous::protocol::{HANDSHAKE_LEN, TOKEN_LEN};
use rendezvous::{Rendezvous, RendezvousAddress, Token};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};

use crate::stdio;

pub type BoxReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

pub const SOCKET_DIR_ENV: &str = "RENDEZVOUS_SOCKET_DIR";

const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Identifies an execution context inside the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContextId {
    /// Runs on the worker's stdin/stdout.
    Root,
    /// Runs on the n-th accepted clone connection.
    Clone(u64),
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Root => f.write_str("root"),
            Self::Clone(n) => write!(f, "clone-{}", n),
        }
    }
}

/// What each execution context does with its byte stream.
#[async_trait::async_trait]
pub trait ContextHandler: Send + Sync + 'static {
    /// Serve one context until its stream ends.
    async fn run(
        &self,
        context: ContextId,
        reader: BoxReader,
        writer: BoxWriter,
    ) -> io::Result<()>;
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Directory for the rendezvous socket. The full path must fit the
    /// 31-byte address field, so keep it short.
    pub socket_dir: PathBuf,
    /// How long a new connection has to present its token.
    pub auth_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            socket_dir: PathBuf::from("/tmp"),
            auth_timeout: Duration::from_secs(10),
        }
    }
}

impl WorkerConfig {
    /// Defaults, with `RENDEZVOUS_SOCKET_DIR` overriding the socket directory.
    pub fn from_env() -> Self {
        let config = Self::default();
        match std::env::var_os(SOCKET_DIR_ENV) {
            Some(dir) if !dir.is_empty() => config.with_socket_dir(dir),
            _ => config,
        }
    }

    pub fn with_socket_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.socket_dir = dir.into();
        self
    }

    pub fn with_auth_timeout(mut self, timeout: Duration) -> Self {
        self.auth_timeout = timeout;
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("failed to isolate control channel: {0}")]
    Isolate(#[source] io::Error),
    #[error("socket path {path} does not fit in {max} bytes")]
    AddressTooLong { path: String, max: usize },
    #[error("failed to bind rendezvous socket: {0}")]
    Bind(#[source] io::Error),
    #[error("failed to publish handshake: {0}")]
    Handshake(#[source] io::Error),
    #[error("root context failed: {0}")]
    Root(#[source] io::Error),
}

/// Removes the socket file when the worker stops listening.
struct SocketFile {
    path: PathBuf,
}

impl Drop for SocketFile {
    fn drop(&mut self) {
        tracing::debug!(path = %self.path.display(), "Removing rendezvous socket");
        if let Err(e) = std::fs::remove_file(&self.path)
            && e.kind() != io::ErrorKind::NotFound
        {
            tracing::warn!(error = %e, "Failed to remove rendezvous socket");
        }
    }
}

/// A bound, not yet running worker.
pub struct Worker {
    rendezvous: Rendezvous,
    listener: UnixListener,
    socket: SocketFile,
    auth_timeout: Duration,
}

impl Worker {
    /// Mint an address and token and start listening. Must be called inside
    /// a tokio runtime.
    pub fn bind(config: &WorkerConfig) -> Result<Self, WorkerError> {
        let address = fresh_address(&config.socket_dir)?;
        let path = address.path().to_path_buf();

        if path.exists() {
            std::fs::remove_file(&path).map_err(WorkerError::Bind)?;
        }
        let listener = UnixListener::bind(&path).map_err(WorkerError::Bind)?;
        tracing::debug!(path = %path.display(), "Bound rendezvous socket");

        Ok(Self {
            rendezvous: Rendezvous::new(address, fresh_token()),
            listener,
            socket: SocketFile { path },
            auth_timeout: config.auth_timeout,
        })
    }

    pub fn rendezvous(&self) -> &Rendezvous {
        &self.rendezvous
    }

    pub fn handshake(&self) -> [u8; HANDSHAKE_LEN] {
        self.rendezvous.handshake_bytes()
    }

    /// Publish the handshake on `writer`, then serve the root context on
    /// (`reader`, `writer`) while accepting clones. Returns the root
    /// context's result once it ends.
    pub async fn run<H: ContextHandler>(
        self,
        reader: BoxReader,
        mut writer: BoxWriter,
        handler: Arc<H>,
    ) -> Result<(), WorkerError> {
        writer
            .write_all(&self.handshake())
            .await
            .map_err(WorkerError::Handshake)?;
        writer.flush().await.map_err(WorkerError::Handshake)?;
        tracing::info!(address = %self.rendezvous.address, "Handshake published");

        let Self {
            rendezvous,
            listener,
            socket,
            auth_timeout,
        } = self;
        let token = rendezvous.token;

        let mut root = handler.run(ContextId::Root, reader, writer);
        let mut accepted = 0u64;

        let result = loop {
            tokio::select! {
                result = &mut root => {
                    match &result {
                        Ok(()) => tracing::info!("Root context finished"),
                        Err(e) => tracing::warn!(error = %e, "Root context failed"),
                    }
                    break result;
                }

                conn = listener.accept() => match conn {
                    Ok((stream, _)) => {
                        accepted += 1;
                        let context = ContextId::Clone(accepted);
                        let handler = Arc::clone(&handler);
                        tokio::spawn(admit(context, stream, token, auth_timeout, handler));
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Accept failed");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
            }
        };

        drop(listener);
        drop(socket);
        result.map_err(WorkerError::Root)
    }
}

/// Check the token on a fresh connection and, if it matches, run a context
/// on it.
async fn admit<H: ContextHandler>(
    context: ContextId,
    mut stream: UnixStream,
    token: Token,
    auth_timeout: Duration,
    handler: Arc<H>,
) {
    let mut presented = [0u8; TOKEN_LEN];
    match tokio::time::timeout(auth_timeout, stream.read_exact(&mut presented)).await {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => {
            tracing::warn!(%context, error = %e, "Connection closed before presenting token");
            return;
        }
        Err(_) => {
            tracing::warn!(%context, "Timed out waiting for token");
            return;
        }
    }

    if !token.matches(&presented) {
        tracing::warn!(%context, "Token mismatch from new client");
        return;
    }

    tracing::debug!(%context, "Clone context started");
    let (read_half, write_half) = stream.into_split();
    match handler
        .run(context, Box::new(read_half), Box::new(write_half))
        .await
    {
        Ok(()) => tracing::debug!(%context, "Clone context finished"),
        Err(e) => tracing::warn!(%context, error = %e, "Clone context failed"),
    }
}

fn fresh_address(dir: &Path) -> Result<RendezvousAddress, WorkerError> {
    let name = format!(
        "rv-{}",
        URL_SAFE_NO_PAD.encode(uuid::Uuid::new_v4().as_bytes())
    );
    let path = dir.join(name);
    RendezvousAddress::from_path(&path).ok_or_else(|| WorkerError::AddressTooLong {
        path: path.display().to_string(),
        max: RendezvousAddress::MAX_PATH_LEN,
    })
}

/// 32 lowercase hex characters of fresh randomness.
fn fresh_token() -> Token {
    let mut bytes = [0u8; TOKEN_LEN];
    uuid::Uuid::new_v4().simple().encode_lower(&mut bytes);
    Token::from_bytes(bytes)
}

/// Run a worker on this process's stdin/stdout.
///
/// Isolates the control channel first so nothing else in the process can
/// write into it, then binds, publishes the handshake and serves until the
/// controller closes the top-level channel.
pub async fn serve<H: ContextHandler>(
    config: WorkerConfig,
    handler: Arc<H>,
) -> Result<(), WorkerError> {
    let fds = stdio::isolate().map_err(WorkerError::Isolate)?;
    let worker = Worker::bind(&config)?;
    let reader = stdio::async_reader(fds.stdin_fd).map_err(WorkerError::Isolate)?;
    let writer = stdio::async_writer(fds.stdout_fd).map_err(WorkerError::Isolate)?;
    worker.run(reader, writer, handler).await
}
