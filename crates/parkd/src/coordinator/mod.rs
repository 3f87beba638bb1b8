//! Reservation coordinator - owns the space state machine.
//!
//! The coordinator is the only component that changes space state. It
//! combines storage, the actuator and the subscriber registries:
//!
//! ```text
//!  sensors ──▶ receive_space_update ──┐
//!  clients ──▶ reserve / cancel ──────┼──▶ Database ──▶ publish ──▶ SubscriberRegistry
//!  readers ──▶ receive_license_plate ─┤                    │
//!  sweep   ──▶ sweep_expired ─────────┘                    └──▶ ArduinoConnection
//! ```
//!
//! All methods are synchronous and callable from any thread. Publishing
//! only enqueues on sessions; it never waits on the network.

mod expiry;
mod sensors;
mod verification;

pub use expiry::spawn_expiry_task;
pub use sensors::SensorReceiver;
pub use verification::PendingPlateVerification;

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use park_core::{
    CancelState, LicensePlate, ReservationCancelResponse, ReservationResponse, ReservationState,
    ReserveResult, ReserveStatus, SpaceId, SpaceState, SpaceStatus,
};

use crate::actuator::ArduinoConnection;
use crate::session::StatusSession;
use crate::storage::{Database, StorageError};
use crate::subscribers::Subscribers;
use verification::PendingVerifications;

/// Default age after which an unclaimed reservation is released.
pub const DEFAULT_EXPIRY_WINDOW: Duration = Duration::from_secs(60);

/// Section given to spaces first seen through a sensor event.
pub const DEFAULT_SECTION: &str = "A";

/// Tunables for the coordinator.
#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    /// Reservations older than this are released by the sweep
    pub expiry_window: Duration,
    /// Section for auto-registered spaces
    pub default_section: String,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            expiry_window: DEFAULT_EXPIRY_WINDOW,
            default_section: DEFAULT_SECTION.to_string(),
        }
    }
}

/// Errors surfaced to callers of the coordinator.
///
/// Guard failures (space taken, plate already holding a reservation) are
/// not errors; they come back as typed response codes.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("unknown space: {0}")]
    UnknownSpace(SpaceId),

    #[error("license plate must not be empty")]
    EmptyPlate,
}

impl CoordinatorError {
    /// Stable code sent to clients in `error` frames.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Storage(_) => "storage_error",
            Self::UnknownSpace(_) => "unknown_space",
            Self::EmptyPlate => "invalid_plate",
        }
    }
}

pub type CoordinatorResult<T> = Result<T, CoordinatorError>;

/// Owner of the space state machine and plate verification.
pub struct Coordinator {
    db: Arc<dyn Database>,
    actuator: Arc<dyn ArduinoConnection>,
    subscribers: Arc<Subscribers>,
    pending: PendingVerifications,
    settings: CoordinatorSettings,
}

impl Coordinator {
    pub fn new(
        db: Arc<dyn Database>,
        actuator: Arc<dyn ArduinoConnection>,
        subscribers: Arc<Subscribers>,
        settings: CoordinatorSettings,
    ) -> Self {
        Self {
            db,
            actuator,
            subscribers,
            pending: PendingVerifications::default(),
            settings,
        }
    }

    pub fn subscribers(&self) -> &Arc<Subscribers> {
        &self.subscribers
    }

    pub fn settings(&self) -> &CoordinatorSettings {
        &self.settings
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Current status of every known space, ordered by id.
    pub fn fetch_all_parking_states(&self) -> CoordinatorResult<Vec<SpaceStatus>> {
        Ok(self
            .db
            .fetch_all_space_states()?
            .iter()
            .map(|record| record.status())
            .collect())
    }

    /// Writes the snapshot onto a `fetchAllParkingStates` stream and ends it.
    pub fn stream_snapshot(&self, session: &StatusSession) {
        match self.fetch_all_parking_states() {
            Ok(states) => {
                debug!(tag = %session.tag(), spaces = states.len(), "Streaming snapshot");
                for status in states {
                    session.write(status);
                }
            }
            Err(e) => warn!(error = %e, "Failed to load snapshot"),
        }
        session.end();
    }

    /// The plate's reservation, else the space it occupies, else
    /// `{-1, FREE}`.
    pub fn check_reserve_status(&self, plate: &LicensePlate) -> CoordinatorResult<SpaceStatus> {
        if let Some(record) = self.db.get_reservation_for_license_plate(plate)? {
            return Ok(record.status());
        }
        if let Some(record) = self.db.get_space_occupied_by_license_plate(plate)? {
            return Ok(record.status());
        }
        Ok(SpaceStatus::none())
    }

    // ========================================================================
    // Reservations
    // ========================================================================

    /// `FREE -> RESERVED` for `plate`, guarded atomically by storage.
    ///
    /// # Errors
    ///
    /// - `CoordinatorError::EmptyPlate` for a blank plate
    /// - `CoordinatorError::UnknownSpace` if the space was never registered
    pub fn attempt_to_reserve_space(
        &self,
        space_id: SpaceId,
        plate: &LicensePlate,
    ) -> CoordinatorResult<ReservationResponse> {
        if plate.is_empty() {
            return Err(CoordinatorError::EmptyPlate);
        }

        if self.db.attempt_to_reserve_spot(space_id, plate)? {
            let section = self
                .db
                .get_state_for_space(space_id)?
                .map(|record| record.section)
                .unwrap_or_else(|| self.settings.default_section.clone());

            self.publish_space_status(SpaceStatus::new(space_id, section, SpaceState::Reserved));
            self.actuator.notify_arduino(space_id, true);

            info!(space_id = %space_id, plate = %plate, "Space reserved");
            return Ok(ReservationResponse {
                space_id,
                result: ReserveResult::Successful,
            });
        }

        let result = match self.db.get_state_for_space(space_id)? {
            None => return Err(CoordinatorError::UnknownSpace(space_id)),
            Some(record) => match record.state {
                SpaceState::Occupied => ReserveResult::FailedSpaceOccupied,
                SpaceState::Reserved => ReserveResult::FailedSpaceReserved,
                SpaceState::Free => ReserveResult::FailedPlateAlreadyReserved,
            },
        };

        debug!(space_id = %space_id, plate = %plate, ?result, "Reservation refused");
        Ok(ReservationResponse { space_id, result })
    }

    /// `RESERVED -> FREE` for the plate's reservation.
    pub fn cancel_space_reservation(
        &self,
        plate: &LicensePlate,
    ) -> CoordinatorResult<ReservationCancelResponse> {
        let not_found = ReservationCancelResponse {
            space_id: SpaceId::NONE,
            cancel_state: CancelState::NoReservationForPlate,
        };

        let Some(record) = self.db.get_reservation_for_license_plate(plate)? else {
            return Ok(not_found);
        };

        if !self.db.cancel_reservations_for(plate)? {
            // Concluded or expired in between
            return Ok(not_found);
        }

        self.publish_space_status(SpaceStatus::new(
            record.space_id,
            record.section.clone(),
            SpaceState::Free,
        ));
        self.publish_reserve_status(ReserveStatus::new(
            record.space_id,
            ReservationState::ReserveCancelled,
        ));
        self.actuator.notify_arduino(record.space_id, false);

        info!(space_id = %record.space_id, plate = %plate, "Reservation cancelled");
        Ok(ReservationCancelResponse {
            space_id: record.space_id,
            cancel_state: CancelState::Cancelled,
        })
    }

    // ========================================================================
    // Publishing
    // ========================================================================

    /// Fans a space status out to live `subscribeToParkingStates` streams.
    pub fn publish_space_status(&self, status: SpaceStatus) {
        let recipients = self.subscribers.space_status.fan_out(&status).len();
        debug!(
            space_id = %status.space_id,
            state = %status.state,
            recipients,
            "Published space status"
        );
    }

    /// Fans a reservation event out to streams bound to its space.
    ///
    /// Terminal outcomes also end those streams.
    pub fn publish_reserve_status(&self, status: ReserveStatus) {
        let registry = &self.subscribers.reservations;
        let recipients = registry.fan_out(&status).len();

        let ended = if status.state.is_terminal() {
            registry.end_streams_for(&status)
        } else {
            0
        };

        debug!(
            space_id = %status.space_id,
            state = %status.state,
            recipients,
            ended,
            "Published reservation status"
        );
    }
}
