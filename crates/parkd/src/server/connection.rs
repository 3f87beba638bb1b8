//! Connection handler for individual client connections.
//!
//! Each client connection gets its own `ConnectionHandler` that:
//! - Performs protocol version negotiation
//! - Answers unary requests (reserve, cancel, check, sensor readings)
//! - Hands the socket to the reactor when the client opens a stream
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Coordinator errors go back to the client as `error` frames
//! - Connection errors are logged and result in graceful disconnect

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{BufReader, BufWriter};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use park_protocol::{ProtocolVersion, RequestType, ServerMessage};

use super::stream::{read_client_message, write_frame, ConnectionTransport};
use crate::coordinator::{Coordinator, CoordinatorError, SensorReceiver};
use crate::reactor::{IncomingCall, ReactorHandle};

/// Maximum message size (1 MB)
pub(super) const MAX_MESSAGE_SIZE: usize = 1_048_576;

/// Read timeout for idle unary connections (5 minutes)
const READ_TIMEOUT: Duration = Duration::from_secs(300);

/// Write timeout (10 seconds)
pub(super) const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// What ended the request loop.
enum Outcome {
    Closed,
    /// The client opened a stream; the socket goes to the reactor
    Stream(RequestType),
}

/// Connection handler for a single client.
pub struct ConnectionHandler {
    reader: BufReader<OwnedReadHalf>,
    writer: BufWriter<OwnedWriteHalf>,

    coordinator: Arc<Coordinator>,
    reactor: ReactorHandle,

    /// Server shutdown; streams get a child token
    cancel: CancellationToken,

    /// Assigned after handshake
    client_id: Option<String>,

    connection_number: u64,
}

impl ConnectionHandler {
    pub fn new(
        reader: OwnedReadHalf,
        writer: OwnedWriteHalf,
        coordinator: Arc<Coordinator>,
        reactor: ReactorHandle,
        cancel: CancellationToken,
        connection_number: u64,
    ) -> Self {
        Self {
            reader: BufReader::new(reader),
            writer: BufWriter::new(writer),
            coordinator,
            reactor,
            cancel,
            client_id: None,
            connection_number,
        }
    }

    /// Runs the connection handler.
    ///
    /// Performs the handshake, then serves requests until the client leaves
    /// or opens a stream.
    pub async fn run(mut self) -> Option<String> {
        debug!(connection = self.connection_number, "New client connected");

        if let Err(e) = self.handle_handshake().await {
            warn!(
                connection = self.connection_number,
                error = %e,
                "Handshake failed"
            );
            return None;
        }

        info!(client_id = ?self.client_id, "Client handshake completed");
        let client_id = self.client_id.clone();

        match self.process_messages().await {
            Ok(Outcome::Stream(request)) => {
                if let Err(e) = self.open_stream(request).await {
                    warn!(client_id = ?client_id, error = %e, "Failed to open stream");
                }
            }
            Ok(Outcome::Closed) => {
                info!(client_id = ?self.client_id, "Client disconnected");
            }
            Err(e) => {
                debug!(client_id = ?self.client_id, error = %e, "Connection closed");
            }
        }

        client_id
    }

    /// Expects `connect`, checks the protocol version and answers
    /// `connected` or `rejected`.
    async fn handle_handshake(&mut self) -> Result<(), ConnectionError> {
        let msg = timeout(READ_TIMEOUT, read_client_message(&mut self.reader))
            .await
            .map_err(|_| ConnectionError::Timeout)??;

        let client_version = msg.protocol_version;
        if !client_version.is_compatible_with(&ProtocolVersion::CURRENT) {
            warn!(
                client_version = %client_version,
                server_version = %ProtocolVersion::CURRENT,
                "Protocol version mismatch"
            );

            self.send_message(ServerMessage::rejected(&format!(
                "Protocol version {} not compatible with server version {}",
                client_version,
                ProtocolVersion::CURRENT
            )))
            .await?;

            return Err(ConnectionError::VersionMismatch {
                client: client_version,
                server: ProtocolVersion::CURRENT,
            });
        }

        match msg.message {
            RequestType::Connect { client_id } => {
                let assigned_id =
                    client_id.unwrap_or_else(|| format!("client-{}", self.connection_number));
                self.client_id = Some(assigned_id.clone());
                self.send_message(ServerMessage::connected(assigned_id)).await
            }
            other => {
                self.send_message(ServerMessage::error(
                    "Expected Connect message for handshake",
                ))
                .await?;
                Err(ConnectionError::UnexpectedMessage(format!("{other:?}")))
            }
        }
    }

    /// Serves unary requests until the client leaves or opens a stream.
    async fn process_messages(&mut self) -> Result<Outcome, ConnectionError> {
        loop {
            let result = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(Outcome::Closed),
                result = timeout(READ_TIMEOUT, read_client_message(&mut self.reader)) => result,
            };

            let msg = match result {
                Ok(Ok(msg)) => msg,
                Ok(Err(ConnectionError::Eof)) => {
                    debug!(client_id = ?self.client_id, "Client sent EOF");
                    return Ok(Outcome::Closed);
                }
                Ok(Err(ConnectionError::ParseError(e))) => {
                    // Keep serving after a malformed frame
                    self.send_message(ServerMessage::error_with_code(
                        &format!("Parse error: {e}"),
                        "parse_error",
                    ))
                    .await?;
                    continue;
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    debug!(client_id = ?self.client_id, "Connection timed out");
                    return Err(ConnectionError::Timeout);
                }
            };

            if msg.message.is_streaming() {
                return Ok(Outcome::Stream(msg.message));
            }

            if matches!(msg.message, RequestType::Disconnect) {
                debug!(client_id = ?self.client_id, "Client requested disconnect");
                return Ok(Outcome::Closed);
            }

            self.handle_request(msg.message).await?;
        }
    }

    /// Answers one unary request.
    async fn handle_request(&mut self, request: RequestType) -> Result<(), ConnectionError> {
        let reply = match request {
            RequestType::Connect { .. } => Some(ServerMessage::error("Already connected")),

            RequestType::AttemptToReserveSpace {
                space_id,
                license_plate,
            } => Some(
                self.call(move |c| c.attempt_to_reserve_space(space_id, &license_plate))
                    .await?
                    .map(ServerMessage::from),
            ),

            RequestType::CancelSpaceReservation { license_plate } => Some(
                self.call(move |c| c.cancel_space_reservation(&license_plate))
                    .await?
                    .map(ServerMessage::from),
            ),

            RequestType::CheckReserveStatus { license_plate } => Some(
                self.call(move |c| c.check_reserve_status(&license_plate))
                    .await?
                    .map(ServerMessage::from),
            ),

            RequestType::SensorUpdate { space_id, occupied } => {
                match self
                    .call(move |c| c.receive_space_update(space_id, occupied))
                    .await?
                {
                    Reply::Ok(()) => None,
                    Reply::Failed(message) => Some(message),
                }
            }

            RequestType::TemperatureUpdate {
                space_id,
                temperature,
            } => {
                self.coordinator
                    .receive_temperature_update(space_id, temperature);
                None
            }

            RequestType::PlateReader(frame) => {
                debug!(client_id = ?self.client_id, space_id = %frame.space_id, "Plate frame outside stream");
                Some(ServerMessage::error_with_code(
                    "Plate reader frames require register_plate_reader",
                    "no_stream",
                ))
            }

            RequestType::Ping { seq } => Some(ServerMessage::pong(seq)),

            // Routed by process_messages
            RequestType::Disconnect
            | RequestType::FetchAllParkingStates
            | RequestType::SubscribeToParkingStates
            | RequestType::SubscribeToReservationState { .. }
            | RequestType::RegisterPlateReader => None,
        };

        match reply {
            Some(message) => self.send_message(message).await,
            None => Ok(()),
        }
    }

    /// Runs a coordinator call on the blocking pool.
    ///
    /// Coordinator errors become an `error` frame for the client.
    async fn call<R, F>(&self, f: F) -> Result<Reply<R>, ConnectionError>
    where
        R: Send + 'static,
        F: FnOnce(&Coordinator) -> Result<R, CoordinatorError> + Send + 'static,
    {
        let coordinator = Arc::clone(&self.coordinator);
        let result = tokio::task::spawn_blocking(move || f(&coordinator))
            .await
            .map_err(|e| ConnectionError::Internal(e.to_string()))?;

        Ok(match result {
            Ok(value) => Reply::Ok(value),
            Err(e) => {
                warn!(client_id = ?self.client_id, error = %e, "Request failed");
                Reply::Failed(ServerMessage::error_with_code(&e.to_string(), e.code()))
            }
        })
    }

    /// Turns this connection into the requested stream.
    async fn open_stream(mut self, request: RequestType) -> Result<(), ConnectionError> {
        if self.reactor.is_closed() {
            self.send_message(ServerMessage::error_with_code(
                "Server is shutting down",
                "unavailable",
            ))
            .await?;
            return Err(ConnectionError::ReactorStopped);
        }

        let cancel = self.cancel.child_token();
        let reactor = self.reactor.clone();
        let number = self.connection_number;

        let call = match request {
            RequestType::RegisterPlateReader => IncomingCall::RegisterPlateReader(
                ConnectionTransport::duplex(self.reader, self.writer, reactor.clone(), cancel, number),
            ),
            RequestType::SubscribeToReservationState { space_id } => {
                IncomingCall::SubscribeToReservationState {
                    space_id,
                    sink: ConnectionTransport::write_only(
                        self.reader,
                        self.writer,
                        reactor.clone(),
                        cancel,
                        number,
                    ),
                }
            }
            RequestType::SubscribeToParkingStates => IncomingCall::SubscribeToParkingStates(
                ConnectionTransport::write_only(self.reader, self.writer, reactor.clone(), cancel, number),
            ),
            RequestType::FetchAllParkingStates => IncomingCall::FetchAllParkingStates(
                ConnectionTransport::write_only(self.reader, self.writer, reactor.clone(), cancel, number),
            ),
            other => {
                return Err(ConnectionError::UnexpectedMessage(format!("{other:?}")));
            }
        };

        debug!(client_id = ?self.client_id, call = ?call, "Stream opened");
        reactor
            .incoming(call)
            .map_err(|_| ConnectionError::ReactorStopped)
    }

    async fn send_message(&mut self, msg: ServerMessage) -> Result<(), ConnectionError> {
        write_frame(&mut self.writer, &msg).await
    }

    /// Returns the client ID (if connected).
    pub fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }
}

/// Result of a coordinator call as seen by the client.
enum Reply<R> {
    Ok(R),
    Failed(ServerMessage),
}

impl<R> Reply<R> {
    fn map(self, f: impl FnOnce(R) -> ServerMessage) -> ServerMessage {
        match self {
            Self::Ok(value) => f(value),
            Self::Failed(message) => message,
        }
    }
}

/// Errors that can occur during connection handling.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("Protocol version mismatch: client {client}, server {server}")]
    VersionMismatch {
        client: ProtocolVersion,
        server: ProtocolVersion,
    },

    #[error("Unexpected message: {0}")]
    UnexpectedMessage(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Connection closed")]
    Eof,

    #[error("Read timeout")]
    Timeout,

    #[error("Write timeout")]
    WriteTimeout,

    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("Reactor stopped")]
    ReactorStopped,

    #[error("Internal error: {0}")]
    Internal(String),
}
