//! Socket-backed transport for streaming calls.
//!
//! Once a connection turns into a stream, a single driver task owns both
//! socket halves. Sessions submit operations through [`ConnectionTransport`];
//! the driver executes them in submission order and posts one completion
//! per operation to the reactor.
//!
//! # Panic-Free Guarantees
//!
//! - Operations submitted after the driver exits are completed with `ok = false`
//! - I/O and parse failures become failed completions, never panics

use std::sync::{Arc, Mutex, PoisonError};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use park_protocol::{ClientMessage, PlateReaderMessage, RequestType, ServerMessage};

use super::connection::{ConnectionError, MAX_MESSAGE_SIZE, WRITE_TIMEOUT};
use crate::reactor::ReactorHandle;
use crate::session::{StreamSink, StreamSource, Tag};

/// Operations a session can start on a connection.
#[derive(Debug)]
enum StreamOp {
    Write(Tag, ServerMessage),
    Read(Tag),
    Finish(Tag),
}

impl StreamOp {
    fn tag(&self) -> Tag {
        match self {
            Self::Write(tag, _) | Self::Read(tag) | Self::Finish(tag) => *tag,
        }
    }
}

/// State shared between the transport and its driver task.
struct Shared {
    /// Frame delivered by the last successful read
    inbox: Mutex<Option<PlateReaderMessage>>,
    cancel: CancellationToken,
}

/// Stream transport over one client connection.
///
/// Implements [`StreamSink`] for any message convertible into a
/// [`ServerMessage`], and [`StreamSource`] for plate-reader frames.
pub struct ConnectionTransport {
    ops: mpsc::UnboundedSender<StreamOp>,
    shared: Arc<Shared>,
    reactor: ReactorHandle,
    connection: u64,
}

impl ConnectionTransport {
    /// Starts a server-to-client stream.
    ///
    /// The read half is only watched: the transport is cancelled when the
    /// client hangs up or sends `disconnect`.
    pub fn write_only(
        reader: BufReader<OwnedReadHalf>,
        writer: BufWriter<OwnedWriteHalf>,
        reactor: ReactorHandle,
        cancel: CancellationToken,
        connection: u64,
    ) -> Arc<Self> {
        let (transport, ops) = Self::new(reactor, cancel, connection);

        tokio::spawn(watch_for_hangup(reader, transport.shared.cancel.clone(), connection));
        tokio::spawn(drive(
            ops,
            None,
            writer,
            Arc::clone(&transport.shared),
            transport.reactor.clone(),
            connection,
        ));

        transport
    }

    /// Starts a bidirectional stream whose reads yield plate-reader frames.
    pub fn duplex(
        reader: BufReader<OwnedReadHalf>,
        writer: BufWriter<OwnedWriteHalf>,
        reactor: ReactorHandle,
        cancel: CancellationToken,
        connection: u64,
    ) -> Arc<Self> {
        let (transport, ops) = Self::new(reactor, cancel, connection);

        tokio::spawn(drive(
            ops,
            Some(reader),
            writer,
            Arc::clone(&transport.shared),
            transport.reactor.clone(),
            connection,
        ));

        transport
    }

    fn new(
        reactor: ReactorHandle,
        cancel: CancellationToken,
        connection: u64,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<StreamOp>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            ops: tx,
            shared: Arc::new(Shared {
                inbox: Mutex::new(None),
                cancel,
            }),
            reactor,
            connection,
        });
        (transport, rx)
    }

    /// Tears the stream down from the server side.
    pub fn cancel(&self) {
        self.shared.cancel.cancel();
    }

    fn submit(&self, op: StreamOp) {
        if let Err(mpsc::error::SendError(op)) = self.ops.send(op) {
            debug!(connection = self.connection, tag = %op.tag(), "Stream driver gone");
            self.reactor.complete(op.tag(), false);
        }
    }
}

impl<T> StreamSink<T> for ConnectionTransport
where
    T: Into<ServerMessage> + Send + 'static,
{
    fn start_write(&self, tag: Tag, message: T) {
        self.submit(StreamOp::Write(tag, message.into()));
    }

    fn start_finish(&self, tag: Tag) {
        self.submit(StreamOp::Finish(tag));
    }

    fn is_cancelled(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }

    fn notify_when_done(&self, tag: Tag) {
        let cancel = self.shared.cancel.clone();
        let reactor = self.reactor.clone();
        tokio::spawn(async move {
            cancel.cancelled().await;
            reactor.done(tag);
        });
    }
}

impl StreamSource<PlateReaderMessage> for ConnectionTransport {
    fn start_read(&self, tag: Tag) {
        self.submit(StreamOp::Read(tag));
    }

    fn take_read(&self) -> Option<PlateReaderMessage> {
        self.shared
            .inbox
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

impl Drop for ConnectionTransport {
    fn drop(&mut self) {
        // The session is gone; nothing will finish the stream
        self.shared.cancel.cancel();
    }
}

// ============================================================================
// Driver
// ============================================================================

async fn drive(
    mut ops: mpsc::UnboundedReceiver<StreamOp>,
    mut reader: Option<BufReader<OwnedReadHalf>>,
    mut writer: BufWriter<OwnedWriteHalf>,
    shared: Arc<Shared>,
    reactor: ReactorHandle,
    connection: u64,
) {
    while let Some(op) = ops.recv().await {
        let tag = op.tag();

        if shared.cancel.is_cancelled() {
            reactor.complete(tag, false);
            continue;
        }

        let ok = match op {
            StreamOp::Write(_, message) => match write_frame(&mut writer, &message).await {
                Ok(()) => true,
                Err(e) => {
                    debug!(connection, tag = %tag, error = %e, "Stream write failed");
                    shared.cancel.cancel();
                    false
                }
            },
            StreamOp::Finish(_) => {
                let ended = write_frame(&mut writer, &ServerMessage::StreamEnd).await;
                let _ = writer.shutdown().await;
                shared.cancel.cancel();
                ended.is_ok()
            }
            StreamOp::Read(_) => match reader.as_mut() {
                Some(reader) => read_frame(reader, &shared, connection).await,
                None => {
                    warn!(connection, tag = %tag, "Read started on write-only stream");
                    false
                }
            },
        };

        reactor.complete(tag, ok);
    }

    debug!(connection, "Stream driver stopped");
}

/// Reads until one plate-reader frame arrives.
///
/// Returns false on hang-up, `disconnect`, I/O errors and cancellation.
async fn read_frame(
    reader: &mut BufReader<OwnedReadHalf>,
    shared: &Shared,
    connection: u64,
) -> bool {
    loop {
        let message = tokio::select! {
            _ = shared.cancel.cancelled() => return false,
            result = read_client_message(reader) => result,
        };

        match message {
            Ok(msg) => match msg.message {
                RequestType::PlateReader(frame) => {
                    *shared.inbox.lock().unwrap_or_else(PoisonError::into_inner) = Some(frame);
                    return true;
                }
                RequestType::Disconnect => {
                    debug!(connection, "Plate reader disconnected");
                    return false;
                }
                other => {
                    debug!(connection, request = ?other, "Ignoring non-reader frame on stream");
                }
            },
            Err(ConnectionError::ParseError(e)) => {
                warn!(connection, error = %e, "Malformed plate reader frame");
            }
            Err(e) => {
                debug!(connection, error = %e, "Plate reader stream closed");
                return false;
            }
        }
    }
}

/// Cancels `cancel` once the client hangs up or asks to disconnect.
async fn watch_for_hangup(
    mut reader: BufReader<OwnedReadHalf>,
    cancel: CancellationToken,
    connection: u64,
) {
    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => return,
            result = read_client_message(&mut reader) => result,
        };

        match message {
            Ok(msg) if matches!(msg.message, RequestType::Disconnect) => break,
            Ok(_) | Err(ConnectionError::ParseError(_)) => {
                debug!(connection, "Ignoring client frame on server stream");
            }
            Err(_) => break,
        }
    }

    debug!(connection, "Client left stream");
    cancel.cancel();
}

pub(super) async fn read_client_message(
    reader: &mut BufReader<OwnedReadHalf>,
) -> Result<ClientMessage, ConnectionError> {
    let mut line = String::new();

    let bytes_read = reader
        .read_line(&mut line)
        .await
        .map_err(|e| ConnectionError::Io(e.to_string()))?;

    if bytes_read == 0 {
        return Err(ConnectionError::Eof);
    }

    if line.len() > MAX_MESSAGE_SIZE {
        return Err(ConnectionError::MessageTooLarge {
            size: line.len(),
            max: MAX_MESSAGE_SIZE,
        });
    }

    serde_json::from_str(&line).map_err(|e| ConnectionError::ParseError(e.to_string()))
}

pub(super) async fn write_frame(
    writer: &mut BufWriter<OwnedWriteHalf>,
    message: &ServerMessage,
) -> Result<(), ConnectionError> {
    let json =
        serde_json::to_string(message).map_err(|e| ConnectionError::ParseError(e.to_string()))?;

    let write = async {
        writer.write_all(json.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
        Ok::<(), std::io::Error>(())
    };

    match timeout(WRITE_TIMEOUT, write).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(ConnectionError::Io(e.to_string())),
        Err(_) => Err(ConnectionError::WriteTimeout),
    }
}
