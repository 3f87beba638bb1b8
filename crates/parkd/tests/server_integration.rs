//! Integration tests for the Unix socket server.
//!
//! These tests run the full daemon (coordinator, reactor and server) on a
//! socket inside a temp directory and talk to it the way clients do:
//! unary reservation calls, snapshot and subscription streams, and the
//! plate-reader duplex stream.
//!
//! Tests CAN use `.unwrap()` and `.expect()`; the panic-free behaviour of
//! production code is checked through assertions.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use park_core::{
    CancelState, LicensePlate, PlateReadRequest, ReservationState, ReserveResult, ReserveStatus,
    SpaceId, SpaceState, SpaceStatus,
};
use park_protocol::{ClientMessage, PlateReaderMessage, ProtocolVersion, RequestType, ServerMessage};
use parkd::actuator::TracingActuator;
use parkd::coordinator::{Coordinator, CoordinatorSettings};
use parkd::reactor::{spawn_reactor, CoordinatorEndpoints};
use parkd::server::ParkingServer;
use parkd::storage::{Database, MemoryDatabase, SqliteDatabase};
use parkd::subscribers::Subscribers;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

// ============================================================================
// Constants
// ============================================================================

/// Maximum time to wait for server socket to appear
const SOCKET_WAIT_TIMEOUT: Duration = Duration::from_millis(500);

/// Interval between condition checks
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Maximum time to wait for a frame or a condition
const RECV_TIMEOUT: Duration = Duration::from_secs(2);

/// Grace period for server shutdown
const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_millis(100);

// ============================================================================
// Test Helpers
// ============================================================================

/// Test server context that manages server lifecycle and cleanup.
struct TestServer {
    socket_path: PathBuf,
    coordinator: Arc<Coordinator>,
    cancel_token: CancellationToken,
    _temp_dir: TempDir,
}

impl TestServer {
    /// Spawns a daemon over spaces 1 to 4 in section "A".
    async fn spawn() -> Self {
        Self::spawn_with(Arc::new(MemoryDatabase::with_spaces(
            (1..=4).map(|id| (SpaceId::new(id), "A")),
        )))
        .await
    }

    async fn spawn_with(db: Arc<dyn Database>) -> Self {
        let temp_dir = tempfile::tempdir().expect("create temp dir");
        let socket_path = temp_dir.path().join("parkd.sock");

        let coordinator = Arc::new(Coordinator::new(
            db,
            Arc::new(TracingActuator),
            Arc::new(Subscribers::new()),
            CoordinatorSettings::default(),
        ));

        let cancel_token = CancellationToken::new();
        let reactor = spawn_reactor(CoordinatorEndpoints::new(&coordinator), cancel_token.clone());
        let server = ParkingServer::new(
            socket_path.clone(),
            Arc::clone(&coordinator),
            reactor,
            cancel_token.clone(),
        );

        tokio::spawn(async move {
            let _ = server.run().await;
        });

        let start = tokio::time::Instant::now();
        while start.elapsed() < SOCKET_WAIT_TIMEOUT {
            if socket_path.exists() {
                break;
            }
            sleep(POLL_INTERVAL).await;
        }

        assert!(
            socket_path.exists(),
            "Server socket did not appear within {SOCKET_WAIT_TIMEOUT:?}"
        );

        Self {
            socket_path,
            coordinator,
            cancel_token,
            _temp_dir: temp_dir,
        }
    }

    async fn connect(&self) -> TestClient {
        let stream = UnixStream::connect(&self.socket_path)
            .await
            .expect("connect to server");
        TestClient::new(stream)
    }

    /// Connects and completes the handshake.
    async fn client(&self) -> TestClient {
        let mut client = self.connect().await;
        client.handshake().await;
        client
    }

    async fn shutdown(self) {
        self.cancel_token.cancel();
        sleep(SHUTDOWN_GRACE_PERIOD).await;
    }
}

/// Test client connection with protocol helpers.
struct TestClient {
    reader: BufReader<tokio::net::unix::OwnedReadHalf>,
    writer: tokio::net::unix::OwnedWriteHalf,
}

impl TestClient {
    fn new(stream: UnixStream) -> Self {
        let (reader, writer) = stream.into_split();
        Self {
            reader: BufReader::new(reader),
            writer,
        }
    }

    async fn send(&mut self, msg: ClientMessage) {
        let json = serde_json::to_string(&msg).unwrap();
        self.writer.write_all(json.as_bytes()).await.unwrap();
        self.writer.write_all(b"\n").await.unwrap();
        self.writer.flush().await.unwrap();
    }

    async fn recv(&mut self) -> ServerMessage {
        let mut line = String::new();
        let read = timeout(RECV_TIMEOUT, self.reader.read_line(&mut line))
            .await
            .expect("frame within timeout")
            .unwrap();
        assert!(read > 0, "server closed the connection");
        serde_json::from_str(&line).unwrap()
    }

    /// Returns true once the server has closed the connection.
    async fn closed(&mut self) -> bool {
        let mut line = String::new();
        matches!(
            timeout(RECV_TIMEOUT, self.reader.read_line(&mut line)).await,
            Ok(Ok(0)) | Ok(Err(_))
        )
    }

    async fn handshake(&mut self) -> String {
        self.send(ClientMessage::connect(None)).await;
        match self.recv().await {
            ServerMessage::Connected { client_id, .. } => client_id,
            other => panic!("Expected Connected, got {other:?}"),
        }
    }

    async fn request(&mut self, msg: ClientMessage) -> ServerMessage {
        self.send(msg).await;
        self.recv().await
    }

    /// Sends a fire-and-forget request and waits until it was processed.
    async fn post(&mut self, msg: ClientMessage) {
        self.send(msg).await;
        match self.request(ClientMessage::ping(1)).await {
            ServerMessage::Pong { seq: 1 } => {}
            other => panic!("Expected Pong, got {other:?}"),
        }
    }
}

/// Polls `condition` until it holds or the timeout expires.
async fn eventually(mut condition: impl FnMut() -> bool) {
    let start = tokio::time::Instant::now();
    while start.elapsed() < RECV_TIMEOUT {
        if condition() {
            return;
        }
        sleep(POLL_INTERVAL).await;
    }
    panic!("condition not reached within {RECV_TIMEOUT:?}");
}

fn reserve_status(space: i64, state: ReservationState) -> ServerMessage {
    ServerMessage::ReserveStatus(ReserveStatus::new(SpaceId::new(space), state))
}

// ============================================================================
// Handshake
// ============================================================================

#[tokio::test]
async fn test_handshake_assigns_client_id() {
    let server = TestServer::spawn().await;
    let mut client = server.connect().await;

    client
        .send(ClientMessage::connect(Some("kiosk-1".to_string())))
        .await;
    match client.recv().await {
        ServerMessage::Connected {
            protocol_version,
            client_id,
        } => {
            assert_eq!(protocol_version, ProtocolVersion::CURRENT);
            assert_eq!(client_id, "kiosk-1");
        }
        other => panic!("Expected Connected, got {other:?}"),
    }

    server.shutdown().await;
}

#[tokio::test]
async fn test_handshake_version_mismatch() {
    let server = TestServer::spawn().await;
    let mut client = server.connect().await;

    let response = client
        .request(ClientMessage {
            protocol_version: ProtocolVersion::new(99, 0),
            message: RequestType::Connect { client_id: None },
        })
        .await;

    match response {
        ServerMessage::Rejected { reason, .. } => assert!(reason.contains("not compatible")),
        other => panic!("Expected Rejected, got {other:?}"),
    }

    server.shutdown().await;
}

#[tokio::test]
async fn test_malformed_frame_keeps_connection() {
    let server = TestServer::spawn().await;
    let mut client = server.client().await;

    client.writer.write_all(b"{not json}\n").await.unwrap();
    match client.recv().await {
        ServerMessage::Error { code, .. } => assert_eq!(code.as_deref(), Some("parse_error")),
        other => panic!("Expected Error, got {other:?}"),
    }

    assert_eq!(
        client.request(ClientMessage::ping(42)).await,
        ServerMessage::pong(42)
    );

    server.shutdown().await;
}

// ============================================================================
// Reservations
// ============================================================================

#[tokio::test]
async fn test_reservation_guards() {
    let server = TestServer::spawn().await;
    let mut client = server.client().await;

    let ok = client
        .request(ClientMessage::reserve(SpaceId::new(1), "AB-12-CD"))
        .await;
    match ok {
        ServerMessage::ReservationResponse(response) => {
            assert_eq!(response.space_id, SpaceId::new(1));
            assert_eq!(response.result, ReserveResult::Successful);
        }
        other => panic!("Expected ReservationResponse, got {other:?}"),
    }

    // Same space, other plate
    match client
        .request(ClientMessage::reserve(SpaceId::new(1), "XY-99-ZZ"))
        .await
    {
        ServerMessage::ReservationResponse(response) => {
            assert_eq!(response.result, ReserveResult::FailedSpaceReserved)
        }
        other => panic!("Expected ReservationResponse, got {other:?}"),
    }

    // Same plate, other space
    match client
        .request(ClientMessage::reserve(SpaceId::new(2), "AB-12-CD"))
        .await
    {
        ServerMessage::ReservationResponse(response) => {
            assert_eq!(response.result, ReserveResult::FailedPlateAlreadyReserved)
        }
        other => panic!("Expected ReservationResponse, got {other:?}"),
    }

    // Occupied space
    client
        .post(ClientMessage::sensor_update(SpaceId::new(2), true))
        .await;
    match client
        .request(ClientMessage::reserve(SpaceId::new(2), "XY-99-ZZ"))
        .await
    {
        ServerMessage::ReservationResponse(response) => {
            assert_eq!(response.result, ReserveResult::FailedSpaceOccupied)
        }
        other => panic!("Expected ReservationResponse, got {other:?}"),
    }

    server.shutdown().await;
}

#[tokio::test]
async fn test_reserve_unknown_space_is_an_error() {
    let server = TestServer::spawn().await;
    let mut client = server.client().await;

    match client
        .request(ClientMessage::reserve(SpaceId::new(99), "AB-12-CD"))
        .await
    {
        ServerMessage::Error { code, .. } => assert_eq!(code.as_deref(), Some("unknown_space")),
        other => panic!("Expected Error, got {other:?}"),
    }

    match client.request(ClientMessage::reserve(SpaceId::new(1), "  ")).await {
        ServerMessage::Error { code, .. } => assert_eq!(code.as_deref(), Some("invalid_plate")),
        other => panic!("Expected Error, got {other:?}"),
    }

    server.shutdown().await;
}

#[tokio::test]
async fn test_check_and_cancel_reservation() {
    let server = TestServer::spawn().await;
    let mut client = server.client().await;

    assert_eq!(
        client.request(ClientMessage::check_reserve_status("AB-12-CD")).await,
        ServerMessage::SpaceStatus(SpaceStatus::none())
    );

    client
        .request(ClientMessage::reserve(SpaceId::new(3), "AB-12-CD"))
        .await;
    assert_eq!(
        client.request(ClientMessage::check_reserve_status("AB-12-CD")).await,
        ServerMessage::SpaceStatus(SpaceStatus::new(SpaceId::new(3), "A", SpaceState::Reserved))
    );

    match client
        .request(ClientMessage::cancel_reservation("AB-12-CD"))
        .await
    {
        ServerMessage::ReservationCancelResponse(response) => {
            assert_eq!(response.space_id, SpaceId::new(3));
            assert_eq!(response.cancel_state, CancelState::Cancelled);
        }
        other => panic!("Expected ReservationCancelResponse, got {other:?}"),
    }

    match client
        .request(ClientMessage::cancel_reservation("AB-12-CD"))
        .await
    {
        ServerMessage::ReservationCancelResponse(response) => {
            assert_eq!(response.space_id, SpaceId::NONE);
            assert_eq!(response.cancel_state, CancelState::NoReservationForPlate);
        }
        other => panic!("Expected ReservationCancelResponse, got {other:?}"),
    }

    server.shutdown().await;
}

// ============================================================================
// Streams
// ============================================================================

#[tokio::test]
async fn test_fetch_all_parking_states_snapshot() {
    let server = TestServer::spawn().await;
    let mut client = server.client().await;

    client.send(ClientMessage::fetch_all_parking_states()).await;

    for id in 1..=4 {
        assert_eq!(
            client.recv().await,
            ServerMessage::SpaceStatus(SpaceStatus::new(SpaceId::new(id), "A", SpaceState::Free))
        );
    }
    assert_eq!(client.recv().await, ServerMessage::StreamEnd);
    assert!(client.closed().await);

    server.shutdown().await;
}

#[tokio::test]
async fn test_subscriber_receives_space_updates() {
    let server = TestServer::spawn().await;
    let mut watcher = server.client().await;
    let mut sensors = server.client().await;

    watcher.send(ClientMessage::subscribe_to_parking_states()).await;
    let sample = SpaceStatus::new(SpaceId::new(2), "A", SpaceState::Occupied);
    let registry = Arc::clone(&server.coordinator.subscribers().space_status);
    eventually(|| registry.interested(&sample) == 1).await;

    sensors
        .post(ClientMessage::sensor_update(SpaceId::new(2), true))
        .await;
    sensors
        .post(ClientMessage::sensor_update(SpaceId::new(2), false))
        .await;

    assert_eq!(watcher.recv().await, ServerMessage::SpaceStatus(sample));
    assert_eq!(
        watcher.recv().await,
        ServerMessage::SpaceStatus(SpaceStatus::new(SpaceId::new(2), "A", SpaceState::Free))
    );

    server.shutdown().await;
}

#[tokio::test]
async fn test_subscriber_disconnect_is_cleaned_up() {
    let server = TestServer::spawn().await;
    let mut watcher = server.client().await;

    watcher.send(ClientMessage::subscribe_to_parking_states()).await;
    let sample = SpaceStatus::new(SpaceId::new(1), "A", SpaceState::Free);
    let registry = Arc::clone(&server.coordinator.subscribers().space_status);
    eventually(|| registry.interested(&sample) == 1).await;

    drop(watcher);
    eventually(|| registry.interested(&sample) == 0).await;

    // Publishing after the hang-up prunes the stream
    server.coordinator.publish_space_status(sample);
    assert!(registry.is_empty());

    server.shutdown().await;
}

#[tokio::test]
async fn test_reservation_stream_ends_on_cancel() {
    let server = TestServer::spawn().await;
    let mut app = server.client().await;
    let mut watcher = server.client().await;

    app.request(ClientMessage::reserve(SpaceId::new(1), "AB-12-CD"))
        .await;

    watcher
        .send(ClientMessage::subscribe_to_reservation_state(SpaceId::new(1)))
        .await;
    let sample = ReserveStatus::new(SpaceId::new(1), ReservationState::ReserveCancelled);
    let registry = Arc::clone(&server.coordinator.subscribers().reservations);
    eventually(|| registry.interested(&sample) == 1).await;

    app.request(ClientMessage::cancel_reservation("AB-12-CD"))
        .await;

    assert_eq!(
        watcher.recv().await,
        reserve_status(1, ReservationState::ReserveCancelled)
    );
    assert_eq!(watcher.recv().await, ServerMessage::StreamEnd);
    assert!(watcher.closed().await);

    server.shutdown().await;
}

#[tokio::test]
async fn test_expired_reservation_is_published_and_ends_stream() {
    let server = TestServer::spawn().await;
    let mut app = server.client().await;
    let mut watcher = server.client().await;
    let mut spaces = server.client().await;

    app.request(ClientMessage::reserve(SpaceId::new(1), "AB-12-CD"))
        .await;

    watcher
        .send(ClientMessage::subscribe_to_reservation_state(SpaceId::new(1)))
        .await;
    spaces.send(ClientMessage::subscribe_to_parking_states()).await;

    let expired = ReserveStatus::new(SpaceId::new(1), ReservationState::ReserveCancelledExpired);
    let freed = SpaceStatus::new(SpaceId::new(1), "A", SpaceState::Free);
    let subscribers = server.coordinator.subscribers();
    eventually(|| {
        subscribers.reservations.interested(&expired) == 1
            && subscribers.space_status.interested(&freed) == 1
    })
    .await;

    let swept = server
        .coordinator
        .sweep_expired_at(Utc::now() + chrono::Duration::seconds(120))
        .unwrap();
    assert_eq!(swept, 1);

    assert_eq!(spaces.recv().await, ServerMessage::SpaceStatus(freed.clone()));
    assert_eq!(
        watcher.recv().await,
        reserve_status(1, ReservationState::ReserveCancelledExpired)
    );
    assert_eq!(watcher.recv().await, ServerMessage::StreamEnd);
    assert!(watcher.closed().await);
    assert!(subscribers.reservations.is_empty());

    // Subscription streams stay open
    assert_eq!(subscribers.space_status.interested(&freed), 1);

    assert_eq!(
        app.request(ClientMessage::check_reserve_status("AB-12-CD")).await,
        ServerMessage::SpaceStatus(SpaceStatus::none())
    );

    server.shutdown().await;
}

// ============================================================================
// Plate verification
// ============================================================================

/// Opens a plate-reader stream registered for `space`.
async fn register_reader(server: &TestServer, space: i64) -> TestClient {
    let mut reader = server.client().await;
    reader.send(ClientMessage::register_plate_reader()).await;
    reader
        .send(ClientMessage::plate_reader(PlateReaderMessage::registration(
            SpaceId::new(space),
        )))
        .await;

    let sample = PlateReadRequest {
        space_id: SpaceId::new(space),
    };
    let registry = Arc::clone(&server.coordinator.subscribers().plate_readers);
    eventually(|| registry.interested(&sample) == 1).await;
    reader
}

#[tokio::test]
async fn test_plate_reader_concludes_reservation() {
    let server = TestServer::spawn().await;
    let mut reader = register_reader(&server, 3).await;
    let mut app = server.client().await;
    let mut watcher = server.client().await;

    app.request(ClientMessage::reserve(SpaceId::new(3), "AB-12-CD"))
        .await;
    watcher
        .send(ClientMessage::subscribe_to_reservation_state(SpaceId::new(3)))
        .await;
    let registry = Arc::clone(&server.coordinator.subscribers().reservations);
    let sample = ReserveStatus::new(SpaceId::new(3), ReservationState::ReserveConcluded);
    eventually(|| registry.interested(&sample) == 1).await;

    app.post(ClientMessage::sensor_update(SpaceId::new(3), true))
        .await;

    assert_eq!(
        reader.recv().await,
        ServerMessage::PlateReadRequest(PlateReadRequest {
            space_id: SpaceId::new(3)
        })
    );
    reader
        .send(ClientMessage::plate_reader(PlateReaderMessage::plate(
            SpaceId::new(3),
            "AB-12-CD",
        )))
        .await;

    assert_eq!(
        watcher.recv().await,
        reserve_status(3, ReservationState::ReserveOccupied)
    );
    assert_eq!(
        watcher.recv().await,
        reserve_status(3, ReservationState::ReserveConcluded)
    );
    assert_eq!(watcher.recv().await, ServerMessage::StreamEnd);

    assert_eq!(
        app.request(ClientMessage::check_reserve_status("AB-12-CD")).await,
        ServerMessage::SpaceStatus(SpaceStatus::new(SpaceId::new(3), "A", SpaceState::Occupied))
    );

    server.shutdown().await;
}

#[tokio::test]
async fn test_wrong_plate_cancels_reservation() {
    let server = TestServer::spawn().await;
    let mut reader = register_reader(&server, 3).await;
    let mut app = server.client().await;
    let mut watcher = server.client().await;

    app.request(ClientMessage::reserve(SpaceId::new(3), "AB-12-CD"))
        .await;
    watcher
        .send(ClientMessage::subscribe_to_reservation_state(SpaceId::new(3)))
        .await;
    let registry = Arc::clone(&server.coordinator.subscribers().reservations);
    let sample = ReserveStatus::new(SpaceId::new(3), ReservationState::ReserveCancelled);
    eventually(|| registry.interested(&sample) == 1).await;

    app.post(ClientMessage::sensor_update(SpaceId::new(3), true))
        .await;
    assert!(matches!(
        reader.recv().await,
        ServerMessage::PlateReadRequest(_)
    ));
    reader
        .send(ClientMessage::plate_reader(PlateReaderMessage::plate(
            SpaceId::new(3),
            "XY-99-ZZ",
        )))
        .await;

    assert_eq!(
        watcher.recv().await,
        reserve_status(3, ReservationState::ReserveOccupied)
    );
    assert_eq!(
        watcher.recv().await,
        reserve_status(3, ReservationState::ReserveCancelledSpaceOccupied)
    );
    assert_eq!(watcher.recv().await, ServerMessage::StreamEnd);

    let occupant = server
        .coordinator
        .check_reserve_status(&LicensePlate::new("XY-99-ZZ"))
        .unwrap();
    assert_eq!(occupant.space_id, SpaceId::new(3));
    assert_eq!(occupant.state, SpaceState::Occupied);

    server.shutdown().await;
}

#[tokio::test]
async fn test_lost_reader_resolves_verification() {
    let server = TestServer::spawn().await;
    let mut reader = register_reader(&server, 3).await;
    let mut app = server.client().await;

    app.request(ClientMessage::reserve(SpaceId::new(3), "AB-12-CD"))
        .await;
    app.post(ClientMessage::sensor_update(SpaceId::new(3), true))
        .await;
    assert!(matches!(
        reader.recv().await,
        ServerMessage::PlateReadRequest(_)
    ));
    assert!(server
        .coordinator
        .pending_verification(SpaceId::new(3))
        .is_some());

    drop(reader);
    eventually(|| {
        server
            .coordinator
            .pending_verification(SpaceId::new(3))
            .is_none()
    })
    .await;

    server.shutdown().await;
}

#[tokio::test]
async fn test_parking_elsewhere_moves_reservation() {
    let server = TestServer::spawn().await;
    let mut reader = register_reader(&server, 2).await;
    let mut app = server.client().await;
    let mut watcher = server.client().await;

    app.request(ClientMessage::reserve(SpaceId::new(1), "AB-12-CD"))
        .await;
    watcher
        .send(ClientMessage::subscribe_to_reservation_state(SpaceId::new(1)))
        .await;
    let registry = Arc::clone(&server.coordinator.subscribers().reservations);
    let sample = ReserveStatus::new(
        SpaceId::new(1),
        ReservationState::ReserveCancelledParkedSomewhereElse,
    );
    eventually(|| registry.interested(&sample) == 1).await;

    app.post(ClientMessage::sensor_update(SpaceId::new(2), true))
        .await;
    assert!(matches!(
        reader.recv().await,
        ServerMessage::PlateReadRequest(_)
    ));
    reader
        .send(ClientMessage::plate_reader(PlateReaderMessage::plate(
            SpaceId::new(2),
            "AB-12-CD",
        )))
        .await;

    assert_eq!(
        watcher.recv().await,
        reserve_status(1, ReservationState::ReserveCancelledParkedSomewhereElse)
    );
    assert_eq!(watcher.recv().await, ServerMessage::StreamEnd);

    assert_eq!(
        app.request(ClientMessage::check_reserve_status("AB-12-CD")).await,
        ServerMessage::SpaceStatus(SpaceStatus::new(SpaceId::new(2), "A", SpaceState::Occupied))
    );

    server.shutdown().await;
}

#[tokio::test]
async fn test_next_car_gets_fresh_plate_read() {
    let server = TestServer::spawn().await;
    let mut reader = register_reader(&server, 3).await;
    let mut sensors = server.client().await;
    let request = ServerMessage::PlateReadRequest(PlateReadRequest {
        space_id: SpaceId::new(3),
    });

    sensors
        .post(ClientMessage::sensor_update(SpaceId::new(3), true))
        .await;
    assert_eq!(reader.recv().await, request);

    // First car leaves before the reader answers
    sensors
        .post(ClientMessage::sensor_update(SpaceId::new(3), false))
        .await;
    assert!(server
        .coordinator
        .pending_verification(SpaceId::new(3))
        .is_none());

    sensors
        .post(ClientMessage::sensor_update(SpaceId::new(3), true))
        .await;
    assert_eq!(reader.recv().await, request);
    assert!(server
        .coordinator
        .pending_verification(SpaceId::new(3))
        .is_some());

    reader
        .send(ClientMessage::plate_reader(PlateReaderMessage::plate(
            SpaceId::new(3),
            "XY-99-ZZ",
        )))
        .await;
    eventually(|| {
        server
            .coordinator
            .check_reserve_status(&LicensePlate::new("XY-99-ZZ"))
            .is_ok_and(|status| status.space_id == SpaceId::new(3))
    })
    .await;

    server.shutdown().await;
}

#[tokio::test]
async fn test_late_plate_after_departure_on_sqlite() {
    let db = SqliteDatabase::in_memory().unwrap();
    for id in 1..=4 {
        db.insert_space(SpaceId::new(id), "A").unwrap();
    }
    let server = TestServer::spawn_with(Arc::new(db)).await;
    let mut reader = register_reader(&server, 3).await;
    let mut app = server.client().await;

    app.post(ClientMessage::sensor_update(SpaceId::new(3), true))
        .await;
    assert!(matches!(
        reader.recv().await,
        ServerMessage::PlateReadRequest(_)
    ));
    app.post(ClientMessage::sensor_update(SpaceId::new(3), false))
        .await;

    reader
        .send(ClientMessage::plate_reader(PlateReaderMessage::plate(
            SpaceId::new(3),
            "XY-99-ZZ",
        )))
        .await;
    sleep(POLL_INTERVAL * 5).await;

    assert_eq!(
        app.request(ClientMessage::check_reserve_status("XY-99-ZZ")).await,
        ServerMessage::SpaceStatus(SpaceStatus::none())
    );
    match app
        .request(ClientMessage::reserve(SpaceId::new(1), "XY-99-ZZ"))
        .await
    {
        ServerMessage::ReservationResponse(response) => {
            assert_eq!(response.result, ReserveResult::Successful)
        }
        other => panic!("Expected ReservationResponse, got {other:?}"),
    }

    server.shutdown().await;
}
