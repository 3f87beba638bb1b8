//! Reservation outcomes and the messages that carry them.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::space::{Scoped, SpaceId};

/// Result of `attemptToReserveSpace`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReserveResult {
    Successful,
    FailedSpaceOccupied,
    FailedSpaceReserved,
    FailedPlateAlreadyReserved,
}

impl ReserveResult {
    pub fn is_success(self) -> bool {
        self == Self::Successful
    }
}

/// Result of `cancelSpaceReservation`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CancelState {
    Cancelled,
    NoReservationForPlate,
}

/// Lifecycle events published on a reservation stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReservationState {
    /// The reserved space became occupied; plate verification is pending.
    ReserveOccupied,
    /// The verified plate matches the reservation.
    ReserveConcluded,
    /// The holder cancelled.
    ReserveCancelled,
    /// The reservation outlived the expiry window.
    ReserveCancelledExpired,
    /// The holder's car was read in a different space.
    ReserveCancelledParkedSomewhereElse,
    /// Another (or an unreadable) car took the space.
    ReserveCancelledSpaceOccupied,
}

impl ReservationState {
    /// Terminal outcomes close the reservation stream.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::ReserveOccupied)
    }
}

impl fmt::Display for ReservationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::ReserveOccupied => "occupied",
            Self::ReserveConcluded => "concluded",
            Self::ReserveCancelled => "cancelled",
            Self::ReserveCancelledExpired => "cancelled (expired)",
            Self::ReserveCancelledParkedSomewhereElse => "cancelled (parked somewhere else)",
            Self::ReserveCancelledSpaceOccupied => "cancelled (space occupied)",
        };
        f.write_str(label)
    }
}

/// One event on a reservation stream: `ReserveStatus{spaceId, state}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReserveStatus {
    pub space_id: SpaceId,
    pub state: ReservationState,
}

impl ReserveStatus {
    pub fn new(space_id: SpaceId, state: ReservationState) -> Self {
        Self { space_id, state }
    }
}

impl Scoped for ReserveStatus {
    fn space_id(&self) -> SpaceId {
        self.space_id
    }
}

/// Response to `attemptToReserveSpace`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationResponse {
    pub space_id: SpaceId,
    pub result: ReserveResult,
}

/// Response to `cancelSpaceReservation`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationCancelResponse {
    pub space_id: SpaceId,
    pub cancel_state: CancelState,
}

/// Server -> plate reader: read the plate of the car now in `space_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlateReadRequest {
    pub space_id: SpaceId,
}

impl Scoped for PlateReadRequest {
    fn space_id(&self) -> SpaceId {
        self.space_id
    }
}
