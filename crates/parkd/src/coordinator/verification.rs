//! Plate verification after a space becomes occupied.
//!
//! When a sensor reports a car, the coordinator records what plate it
//! expects (the occupant on record before the transition), asks the plate
//! readers bound to that space for a read, and settles the reservation when
//! the result comes back. At most one verification is outstanding per space.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use park_core::{
    LicensePlate, PlateReadRequest, ReservationState, ReserveStatus, SpaceId, SpaceState,
    SpaceStatus,
};
use park_protocol::PlateReaderMessage;

use super::{Coordinator, CoordinatorResult};
use crate::session::{PlateReaderSession, Scope};

/// An outstanding plate read for one space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingPlateVerification {
    pub space_id: SpaceId,
    /// Occupant on record before the space became occupied
    pub expected: Option<LicensePlate>,
    pub requested_at: DateTime<Utc>,
}

/// Outstanding verifications keyed by space.
#[derive(Debug, Default)]
pub(super) struct PendingVerifications {
    inner: Mutex<HashMap<SpaceId, PendingPlateVerification>>,
}

impl PendingVerifications {
    /// Records a verification. Returns false if one is already pending.
    pub(super) fn begin(&self, space_id: SpaceId, expected: Option<LicensePlate>) -> bool {
        let mut pending = self.lock();
        if pending.contains_key(&space_id) {
            return false;
        }
        pending.insert(
            space_id,
            PendingPlateVerification {
                space_id,
                expected,
                requested_at: Utc::now(),
            },
        );
        true
    }

    pub(super) fn resolve(&self, space_id: SpaceId) -> Option<PendingPlateVerification> {
        self.lock().remove(&space_id)
    }

    pub(super) fn get(&self, space_id: SpaceId) -> Option<PendingPlateVerification> {
        self.lock().get(&space_id).cloned()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<SpaceId, PendingPlateVerification>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Coordinator {
    /// The verification outstanding for a space, if any.
    pub fn pending_verification(&self, space_id: SpaceId) -> Option<PendingPlateVerification> {
        self.pending.get(space_id)
    }

    /// Starts a verification for a newly occupied space.
    ///
    /// Readers bound to the space get a `PlateReadRequest` and have a read
    /// armed. With no reader bound the verification resolves at once with
    /// an empty plate.
    pub(super) fn request_plate_read(
        &self,
        space_id: SpaceId,
        expected: Option<LicensePlate>,
    ) -> CoordinatorResult<()> {
        if !self.pending.begin(space_id, expected) {
            debug!(space_id = %space_id, "Verification already pending");
            return Ok(());
        }

        let recipients = self
            .subscribers
            .plate_readers
            .fan_out(&PlateReadRequest { space_id });

        if recipients.is_empty() {
            debug!(space_id = %space_id, "No plate reader bound, resolving unverified");
            return self.receive_license_plate(space_id, LicensePlate::empty());
        }

        for reader in &recipients {
            reader.read_message();
        }

        debug!(space_id = %space_id, readers = recipients.len(), "Plate read requested");
        Ok(())
    }

    /// Settles the verification for `space_id` with the plate that was read.
    ///
    /// - plate matches the expected occupant: reservation concluded
    /// - plate holds a reservation elsewhere: that reservation is cancelled
    ///   ("parked somewhere else") and the plate is moved here
    /// - otherwise: this space's reservation is cancelled ("space occupied")
    ///
    /// The plate is only recorded while the space is still OCCUPIED. Results
    /// with no verification pending are ignored.
    pub fn receive_license_plate(
        &self,
        space_id: SpaceId,
        plate: LicensePlate,
    ) -> CoordinatorResult<()> {
        let Some(pending) = self.pending.resolve(space_id) else {
            debug!(space_id = %space_id, plate = %plate, "No verification pending, ignoring plate");
            return Ok(());
        };

        let elapsed_ms = (Utc::now() - pending.requested_at).num_milliseconds();
        let verified = !plate.is_empty() && pending.expected.as_ref() == Some(&plate);

        if !plate.is_empty() {
            self.record_occupant(space_id, &plate, verified)?;
        }

        let outcome = if verified {
            info!(space_id = %space_id, plate = %plate, elapsed_ms, "Reservation concluded");
            ReservationState::ReserveConcluded
        } else {
            info!(
                space_id = %space_id,
                plate = %plate,
                expected = ?pending.expected,
                elapsed_ms,
                "Space taken by unverified plate"
            );
            ReservationState::ReserveCancelledSpaceOccupied
        };

        self.publish_reserve_status(ReserveStatus::new(space_id, outcome));
        Ok(())
    }

    /// Attaches a read plate to the space it was read on.
    ///
    /// Only applies while the space is still OCCUPIED; a car that left
    /// before its read came back leaves no occupant behind.
    fn record_occupant(
        &self,
        space_id: SpaceId,
        plate: &LicensePlate,
        verified: bool,
    ) -> CoordinatorResult<()> {
        let occupied = self
            .db
            .get_state_for_space(space_id)?
            .is_some_and(|record| record.state == SpaceState::Occupied);
        if !occupied {
            debug!(space_id = %space_id, plate = %plate, "Space no longer occupied, plate not recorded");
            return Ok(());
        }

        if !verified {
            self.release_reservation_elsewhere(space_id, plate)?;
        }
        if !self.db.update_space_plate(space_id, plate)? {
            warn!(space_id = %space_id, plate = %plate, "Could not record occupant plate");
        }
        Ok(())
    }

    /// Cancels the reservation `plate` holds on a space other than `here`.
    fn release_reservation_elsewhere(
        &self,
        here: SpaceId,
        plate: &LicensePlate,
    ) -> CoordinatorResult<()> {
        let Some(other) = self.db.get_reservation_for_license_plate(plate)? else {
            return Ok(());
        };
        if other.space_id == here {
            return Ok(());
        }

        if !self.db.cancel_reservation_for_spot(other.space_id)? {
            debug!(space_id = %other.space_id, "Reservation already released");
            return Ok(());
        }

        self.actuator.notify_arduino(other.space_id, false);
        self.publish_space_status(SpaceStatus::new(
            other.space_id,
            other.section.clone(),
            SpaceState::Free,
        ));
        self.publish_reserve_status(ReserveStatus::new(
            other.space_id,
            ReservationState::ReserveCancelledParkedSomewhereElse,
        ));

        info!(
            plate = %plate,
            reserved = %other.space_id,
            parked = %here,
            "Car parked somewhere else, reservation moved"
        );
        Ok(())
    }

    /// Handles one inbound frame on a plate-reader stream.
    pub fn handle_plate_reader_frame(&self, session: &Arc<PlateReaderSession>, frame: PlateReaderMessage) {
        if frame.registration {
            session.bind_scope(Scope::Space(frame.space_id));
            info!(tag = %session.tag(), space_id = %frame.space_id, "Plate reader registered");
            return;
        }

        match session.scope() {
            Scope::Space(bound) if bound != frame.space_id => {
                warn!(
                    tag = %session.tag(),
                    bound = %bound,
                    space_id = %frame.space_id,
                    "Plate reader answered for another space"
                );
            }
            Scope::Unbound => {
                warn!(tag = %session.tag(), "Plate result from unregistered reader, ignoring");
                return;
            }
            _ => {}
        }

        let plate = frame.plate.unwrap_or_default();
        if let Err(e) = self.receive_license_plate(frame.space_id, plate) {
            warn!(space_id = %frame.space_id, error = %e, "Failed to apply plate read");
        }
    }

    /// Resolves the verification a lost reader was serving as unverified.
    pub fn plate_reader_lost(&self, session: &Arc<PlateReaderSession>) {
        let Scope::Space(space_id) = session.scope() else {
            return;
        };
        if self.pending.get(space_id).is_none() {
            return;
        }

        debug!(tag = %session.tag(), space_id = %space_id, "Plate reader lost during verification");
        if let Err(e) = self.receive_license_plate(space_id, LicensePlate::empty()) {
            warn!(space_id = %space_id, error = %e, "Failed to resolve verification");
        }
    }
}
