//! In-process storage engine.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use tracing::debug;

use park_core::{LicensePlate, SpaceId, SpaceRecord, SpaceState};

use super::{Database, StorageError, StorageResult};

/// Space records kept in a `BTreeMap` behind one mutex.
///
/// Every operation runs under the lock, which makes the guarded reserve
/// atomic with respect to concurrent callers.
#[derive(Debug, Default)]
pub struct MemoryDatabase {
    spaces: Mutex<BTreeMap<SpaceId, SpaceRecord>>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a database pre-populated with free spaces.
    pub fn with_spaces<'a>(spaces: impl IntoIterator<Item = (SpaceId, &'a str)>) -> Self {
        let db = Self::new();
        {
            let mut map = db.lock();
            for (space_id, section) in spaces {
                map.insert(space_id, SpaceRecord::new(space_id, section));
            }
        }
        db
    }

    /// Overwrites the transition time of a space.
    ///
    /// Returns false if the space is unknown.
    pub fn set_last_change(&self, space_id: SpaceId, at: DateTime<Utc>) -> bool {
        match self.lock().get_mut(&space_id) {
            Some(record) => {
                record.last_change = at;
                true
            }
            None => false,
        }
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<SpaceId, SpaceRecord>> {
        self.spaces.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Returns true if `plate` is attached to a held space other than `except`.
fn plate_held_elsewhere(
    spaces: &BTreeMap<SpaceId, SpaceRecord>,
    plate: &LicensePlate,
    except: SpaceId,
) -> bool {
    spaces.values().any(|record| {
        record.space_id != except && record.state != SpaceState::Free && record.is_held_by(plate)
    })
}

fn find_by_plate(
    spaces: &BTreeMap<SpaceId, SpaceRecord>,
    plate: &LicensePlate,
    state: SpaceState,
) -> Option<SpaceRecord> {
    spaces
        .values()
        .find(|record| record.state == state && record.is_held_by(plate))
        .cloned()
}

fn release(record: &mut SpaceRecord) {
    record.state = SpaceState::Free;
    record.occupant = None;
    record.last_change = Utc::now();
}

impl Database for MemoryDatabase {
    fn insert_space(&self, space_id: SpaceId, section: &str) -> StorageResult<()> {
        self.lock()
            .entry(space_id)
            .or_insert_with(|| SpaceRecord::new(space_id, section));
        Ok(())
    }

    fn fetch_all_space_states(&self) -> StorageResult<Vec<SpaceRecord>> {
        Ok(self.lock().values().cloned().collect())
    }

    fn get_state_for_space(&self, space_id: SpaceId) -> StorageResult<Option<SpaceRecord>> {
        Ok(self.lock().get(&space_id).cloned())
    }

    fn get_expired_reserve_states(&self, cutoff: DateTime<Utc>) -> StorageResult<Vec<SpaceRecord>> {
        Ok(self
            .lock()
            .values()
            .filter(|record| record.state == SpaceState::Reserved && record.last_change < cutoff)
            .cloned()
            .collect())
    }

    fn update_space_state(
        &self,
        space_id: SpaceId,
        state: SpaceState,
        plate: Option<&LicensePlate>,
    ) -> StorageResult<Option<SpaceRecord>> {
        let mut spaces = self.lock();

        if let Some(plate) = plate {
            if plate_held_elsewhere(&spaces, plate, space_id) {
                return Err(StorageError::PlateInUse(plate.clone()));
            }
        }

        let Some(record) = spaces.get_mut(&space_id) else {
            return Ok(None);
        };

        let previous = record.clone();
        record.state = state;
        record.occupant = plate.cloned();
        record.last_change = Utc::now();

        debug!(
            space_id = %space_id,
            from = %previous.state,
            to = %state,
            "Space state updated"
        );

        Ok(Some(previous))
    }

    fn update_space_plate(&self, space_id: SpaceId, plate: &LicensePlate) -> StorageResult<bool> {
        let mut spaces = self.lock();

        if plate_held_elsewhere(&spaces, plate, space_id) {
            return Ok(false);
        }

        match spaces.get_mut(&space_id) {
            Some(record) if record.state == SpaceState::Occupied => {
                record.occupant = Some(plate.clone());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn get_reservation_for_license_plate(
        &self,
        plate: &LicensePlate,
    ) -> StorageResult<Option<SpaceRecord>> {
        Ok(find_by_plate(&self.lock(), plate, SpaceState::Reserved))
    }

    fn get_space_occupied_by_license_plate(
        &self,
        plate: &LicensePlate,
    ) -> StorageResult<Option<SpaceRecord>> {
        Ok(find_by_plate(&self.lock(), plate, SpaceState::Occupied))
    }

    fn attempt_to_reserve_spot(&self, space_id: SpaceId, plate: &LicensePlate) -> StorageResult<bool> {
        let mut spaces = self.lock();

        if plate_held_elsewhere(&spaces, plate, space_id) {
            return Ok(false);
        }

        match spaces.get_mut(&space_id) {
            Some(record) if record.state == SpaceState::Free => {
                record.state = SpaceState::Reserved;
                record.occupant = Some(plate.clone());
                record.last_change = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn cancel_reservations_for(&self, plate: &LicensePlate) -> StorageResult<bool> {
        let mut cancelled = false;

        for record in self.lock().values_mut() {
            if record.state == SpaceState::Reserved && record.is_held_by(plate) {
                release(record);
                cancelled = true;
            }
        }

        Ok(cancelled)
    }

    fn cancel_reservation_for_spot(&self, space_id: SpaceId) -> StorageResult<bool> {
        match self.lock().get_mut(&space_id) {
            Some(record) if record.state == SpaceState::Reserved => {
                release(record);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
