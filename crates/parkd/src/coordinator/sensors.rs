//! Sensor ingestion entry points.

use tracing::{debug, info, warn};

use park_core::{LicensePlate, ReservationState, ReserveStatus, SpaceId, SpaceState, SpaceStatus};

use super::{Coordinator, CoordinatorError, CoordinatorResult};

/// Receiver of raw sensor readings.
pub trait SensorReceiver: Send + Sync {
    /// An occupancy reading for one space.
    fn receive_space_update(&self, space_id: SpaceId, occupied: bool) -> CoordinatorResult<()>;

    /// A temperature reading for one space.
    fn receive_temperature_update(&self, space_id: SpaceId, temperature: i32);
}

impl SensorReceiver for Coordinator {
    /// Applies a reading: `any -> OCCUPIED` or `any -> FREE`.
    ///
    /// Unknown spaces are registered under the default section and the
    /// transition is retried once. Becoming occupied starts a plate
    /// verification; a reserved space additionally reports
    /// `RESERVE_OCCUPIED` and has its indicator released. Becoming free
    /// settles a verification still pending as unverified, so the next car
    /// gets a fresh read.
    fn receive_space_update(&self, space_id: SpaceId, occupied: bool) -> CoordinatorResult<()> {
        let target = if occupied {
            SpaceState::Occupied
        } else {
            SpaceState::Free
        };

        let mut inserted = false;
        let previous = loop {
            match self.db.update_space_state(space_id, target, None)? {
                Some(previous) => break previous,
                None if !inserted => {
                    self.db
                        .insert_space(space_id, &self.settings.default_section)?;
                    inserted = true;
                    info!(
                        space_id = %space_id,
                        section = %self.settings.default_section,
                        "Registered space from sensor event"
                    );
                }
                None => {
                    warn!(space_id = %space_id, "Space missing after registration");
                    return Err(CoordinatorError::UnknownSpace(space_id));
                }
            }
        };

        debug!(space_id = %space_id, from = %previous.state, to = %target, "Sensor update");

        self.publish_space_status(SpaceStatus::new(space_id, previous.section.clone(), target));

        if !occupied {
            if self.pending_verification(space_id).is_some() {
                debug!(space_id = %space_id, "Car left before plate read");
                return self.receive_license_plate(space_id, LicensePlate::empty());
            }
            return Ok(());
        }

        if previous.state == SpaceState::Reserved {
            self.publish_reserve_status(ReserveStatus::new(
                space_id,
                ReservationState::ReserveOccupied,
            ));
            self.actuator.notify_arduino(space_id, false);
        }

        self.request_plate_read(space_id, previous.occupant)
    }

    fn receive_temperature_update(&self, space_id: SpaceId, temperature: i32) {
        debug!(space_id = %space_id, temperature, "Temperature update");
    }
}
