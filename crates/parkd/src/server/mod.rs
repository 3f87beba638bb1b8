//! Socket front end of the daemon.
//!
//! Every accepted connection gets a [`ConnectionHandler`]. Unary requests
//! are answered on the connection itself; a streaming request moves the
//! socket into a [`ConnectionTransport`] owned by a reactor session.
//!
//! ```text
//!  UnixListener ──accept──▶ ConnectionHandler ──unary──▶ Coordinator
//!                                  │
//!                                  └──stream──▶ ConnectionTransport ──▶ reactor
//! ```
//!
//! On shutdown the accept loop stops, open handlers get a grace period to
//! observe the cancellation, and the socket file is removed.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Accept failures are logged and the loop keeps serving

mod connection;
mod stream;

pub use connection::{ConnectionError, ConnectionHandler};
pub use stream::ConnectionTransport;

use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::coordinator::Coordinator;
use crate::reactor::ReactorHandle;

/// Socket used when neither the config nor the CLI names one
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/parkd.sock";

/// How long open handlers get to wind down at shutdown
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Accept loop for client connections.
pub struct ParkingServer {
    socket_path: PathBuf,
    coordinator: Arc<Coordinator>,
    reactor: ReactorHandle,
    cancel_token: CancellationToken,
    accepted: AtomicU64,
}

impl ParkingServer {
    pub fn new(
        socket_path: impl Into<PathBuf>,
        coordinator: Arc<Coordinator>,
        reactor: ReactorHandle,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            socket_path: socket_path.into(),
            coordinator,
            reactor,
            cancel_token,
            accepted: AtomicU64::new(0),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Binds the listening socket.
    ///
    /// A socket left behind by a previous run is replaced. Any other kind
    /// of file at the path is left alone and reported.
    ///
    /// # Errors
    ///
    /// `ServerError::SocketSetup` if the path is taken or binding fails.
    pub fn bind(&self) -> Result<UnixListener, ServerError> {
        let setup_error = |error: String| ServerError::SocketSetup {
            path: self.socket_path.clone(),
            error,
        };

        match std::fs::symlink_metadata(&self.socket_path) {
            Ok(meta) if meta.file_type().is_socket() => {
                debug!(socket = %self.socket_path.display(), "Removing stale socket");
                std::fs::remove_file(&self.socket_path).map_err(|e| setup_error(e.to_string()))?;
            }
            Ok(_) => return Err(setup_error("path exists and is not a socket".to_string())),
            Err(_) => {}
        }

        if let Some(parent) = self.socket_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| setup_error(e.to_string()))?;
        }

        UnixListener::bind(&self.socket_path).map_err(|e| setup_error(e.to_string()))
    }

    /// Binds and serves until the cancellation token fires.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = self.bind()?;
        self.serve(listener).await;
        Ok(())
    }

    /// Accepts connections on a bound listener until shutdown.
    pub async fn serve(&self, listener: UnixListener) {
        info!(socket = %self.socket_path.display(), "Accepting clients");
        let mut handlers = JoinSet::new();

        loop {
            tokio::select! {
                _ = self.cancel_token.cancelled() => break,

                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => self.spawn_handler(&mut handlers, stream),
                    Err(e) => error!(error = %e, "Accept failed"),
                },

                // Reap finished handlers so the set stays small
                Some(_) = handlers.join_next(), if !handlers.is_empty() => {}
            }
        }

        drop(listener);
        self.drain(handlers).await;
        self.remove_socket();
    }

    fn spawn_handler(&self, handlers: &mut JoinSet<()>, stream: UnixStream) {
        let number = self.accepted.fetch_add(1, Ordering::Relaxed);
        let (reader, writer) = stream.into_split();
        let handler = ConnectionHandler::new(
            reader,
            writer,
            Arc::clone(&self.coordinator),
            self.reactor.clone(),
            self.cancel_token.clone(),
            number,
        );

        handlers.spawn(async move {
            let client_id = handler.run().await;
            debug!(connection = number, client_id = ?client_id, "Handler finished");
        });
    }

    async fn drain(&self, mut handlers: JoinSet<()>) {
        let open = handlers.len();
        if open == 0 {
            return;
        }

        info!(open, "Waiting for client handlers");
        let drained = timeout(DRAIN_TIMEOUT, async {
            while handlers.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            warn!(remaining = handlers.len(), "Aborting client handlers");
            handlers.abort_all();
        }
    }

    /// Number of connections accepted so far.
    pub fn connections_accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    fn remove_socket(&self) {
        match std::fs::remove_file(&self.socket_path) {
            Ok(()) => info!(socket = %self.socket_path.display(), "Socket removed"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(
                socket = %self.socket_path.display(),
                error = %e,
                "Failed to remove socket"
            ),
        }
    }
}

/// Errors that can occur in server operations.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Failed to setup socket at {path}: {error}")]
    SocketSetup { path: PathBuf, error: String },

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),
}
