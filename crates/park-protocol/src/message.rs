//! Protocol message types for daemon communication.
//!
//! Frames are single JSON objects, one per line, tagged by `type`.

use crate::version::ProtocolVersion;
use park_core::{
    LicensePlate, PlateReadRequest, ReservationCancelResponse, ReservationResponse, ReserveStatus,
    SpaceId, SpaceStatus,
};
use serde::{Deserialize, Serialize};

/// Frame sent by a plate reader on its duplex stream.
///
/// The first frame binds the stream to a space (`registration = true`);
/// later frames carry the plate read for that space.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlateReaderMessage {
    pub space_id: SpaceId,
    #[serde(default)]
    pub registration: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plate: Option<LicensePlate>,
}

impl PlateReaderMessage {
    pub fn registration(space_id: SpaceId) -> Self {
        Self {
            space_id,
            registration: true,
            plate: None,
        }
    }

    pub fn plate(space_id: SpaceId, plate: impl Into<LicensePlate>) -> Self {
        Self {
            space_id,
            registration: false,
            plate: Some(plate.into()),
        }
    }
}

/// Requests a client can send to the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RequestType {
    /// Client handshake
    Connect {
        #[serde(skip_serializing_if = "Option::is_none")]
        client_id: Option<String>,
    },

    /// Stream a snapshot of every known space, then end
    FetchAllParkingStates,

    /// Stream every space-status change until the client leaves
    SubscribeToParkingStates,

    AttemptToReserveSpace {
        space_id: SpaceId,
        license_plate: LicensePlate,
    },

    CancelSpaceReservation { license_plate: LicensePlate },

    CheckReserveStatus { license_plate: LicensePlate },

    /// Stream reservation events for one space until a terminal outcome
    SubscribeToReservationState { space_id: SpaceId },

    /// Open the plate-reader duplex stream
    RegisterPlateReader,

    /// Inbound frame on an open plate-reader stream
    PlateReader(PlateReaderMessage),

    /// Occupancy reading pushed by sensor ingestion
    SensorUpdate { space_id: SpaceId, occupied: bool },

    /// Temperature reading pushed by sensor ingestion
    TemperatureUpdate { space_id: SpaceId, temperature: i32 },

    Ping { seq: u64 },

    Disconnect,
}

impl RequestType {
    /// Returns true for requests that turn the connection into a stream.
    pub fn is_streaming(&self) -> bool {
        matches!(
            self,
            Self::FetchAllParkingStates
                | Self::SubscribeToParkingStates
                | Self::SubscribeToReservationState { .. }
                | Self::RegisterPlateReader
        )
    }
}

/// Messages sent from client to daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientMessage {
    pub protocol_version: ProtocolVersion,

    #[serde(flatten)]
    pub message: RequestType,
}

impl ClientMessage {
    /// Creates a new client message with current protocol version.
    pub fn new(message: RequestType) -> Self {
        Self {
            protocol_version: ProtocolVersion::CURRENT,
            message,
        }
    }

    pub fn connect(client_id: Option<String>) -> Self {
        Self::new(RequestType::Connect { client_id })
    }

    pub fn fetch_all_parking_states() -> Self {
        Self::new(RequestType::FetchAllParkingStates)
    }

    pub fn subscribe_to_parking_states() -> Self {
        Self::new(RequestType::SubscribeToParkingStates)
    }

    pub fn reserve(space_id: SpaceId, license_plate: impl Into<LicensePlate>) -> Self {
        Self::new(RequestType::AttemptToReserveSpace {
            space_id,
            license_plate: license_plate.into(),
        })
    }

    pub fn cancel_reservation(license_plate: impl Into<LicensePlate>) -> Self {
        Self::new(RequestType::CancelSpaceReservation {
            license_plate: license_plate.into(),
        })
    }

    pub fn check_reserve_status(license_plate: impl Into<LicensePlate>) -> Self {
        Self::new(RequestType::CheckReserveStatus {
            license_plate: license_plate.into(),
        })
    }

    pub fn subscribe_to_reservation_state(space_id: SpaceId) -> Self {
        Self::new(RequestType::SubscribeToReservationState { space_id })
    }

    pub fn register_plate_reader() -> Self {
        Self::new(RequestType::RegisterPlateReader)
    }

    pub fn plate_reader(message: PlateReaderMessage) -> Self {
        Self::new(RequestType::PlateReader(message))
    }

    pub fn sensor_update(space_id: SpaceId, occupied: bool) -> Self {
        Self::new(RequestType::SensorUpdate { space_id, occupied })
    }

    pub fn temperature_update(space_id: SpaceId, temperature: i32) -> Self {
        Self::new(RequestType::TemperatureUpdate {
            space_id,
            temperature,
        })
    }

    pub fn ping(seq: u64) -> Self {
        Self::new(RequestType::Ping { seq })
    }

    pub fn disconnect() -> Self {
        Self::new(RequestType::Disconnect)
    }
}

/// Messages sent from daemon to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Connection accepted
    Connected {
        protocol_version: ProtocolVersion,
        client_id: String,
    },

    /// Connection rejected (version mismatch)
    Rejected {
        reason: String,
        protocol_version: ProtocolVersion,
    },

    SpaceStatus(SpaceStatus),

    ReservationResponse(ReservationResponse),

    ReservationCancelResponse(ReservationCancelResponse),

    ReserveStatus(ReserveStatus),

    PlateReadRequest(PlateReadRequest),

    /// The server finished the stream; no more frames follow
    StreamEnd,

    Pong { seq: u64 },

    Error {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },
}

impl ServerMessage {
    pub fn connected(client_id: String) -> Self {
        Self::Connected {
            protocol_version: ProtocolVersion::CURRENT,
            client_id,
        }
    }

    pub fn rejected(reason: &str) -> Self {
        Self::Rejected {
            reason: reason.to_string(),
            protocol_version: ProtocolVersion::CURRENT,
        }
    }

    pub fn pong(seq: u64) -> Self {
        Self::Pong { seq }
    }

    pub fn error(message: &str) -> Self {
        Self::Error {
            message: message.to_string(),
            code: None,
        }
    }

    pub fn error_with_code(message: &str, code: &str) -> Self {
        Self::Error {
            message: message.to_string(),
            code: Some(code.to_string()),
        }
    }
}

impl From<SpaceStatus> for ServerMessage {
    fn from(status: SpaceStatus) -> Self {
        Self::SpaceStatus(status)
    }
}

impl From<ReserveStatus> for ServerMessage {
    fn from(status: ReserveStatus) -> Self {
        Self::ReserveStatus(status)
    }
}

impl From<PlateReadRequest> for ServerMessage {
    fn from(request: PlateReadRequest) -> Self {
        Self::PlateReadRequest(request)
    }
}

impl From<ReservationResponse> for ServerMessage {
    fn from(response: ReservationResponse) -> Self {
        Self::ReservationResponse(response)
    }
}

impl From<ReservationCancelResponse> for ServerMessage {
    fn from(response: ReservationCancelResponse) -> Self {
        Self::ReservationCancelResponse(response)
    }
}
