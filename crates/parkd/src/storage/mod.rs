//! Persistence of space records.
//!
//! The coordinator talks to storage only through the [`Database`] trait.
//! Two engines are provided:
//! - [`MemoryDatabase`] - a mutex-guarded map, used for tests and `--memory`
//! - [`SqliteDatabase`] - a single-table SQLite store
//!
//! Both enforce the occupant invariant: a plate is attached to at most one
//! RESERVED or OCCUPIED space at a time. Guarded operations report a lost
//! race as `Ok(false)`; `Err` is reserved for engine failures.

mod memory;
mod sqlite;

pub use memory::MemoryDatabase;
pub use sqlite::SqliteDatabase;

use chrono::{DateTime, Utc};
use thiserror::Error;

use park_core::{LicensePlate, SpaceId, SpaceRecord, SpaceState};

/// Storage operations consumed by the coordinator.
///
/// Calls are synchronous and short; implementations serialize access
/// internally so the trait object can be shared across tasks.
pub trait Database: Send + Sync {
    /// Registers a space in the FREE state. Existing spaces are left as is.
    fn insert_space(&self, space_id: SpaceId, section: &str) -> StorageResult<()>;

    /// All known spaces, ordered by id.
    fn fetch_all_space_states(&self) -> StorageResult<Vec<SpaceRecord>>;

    fn get_state_for_space(&self, space_id: SpaceId) -> StorageResult<Option<SpaceRecord>>;

    /// RESERVED spaces whose last transition happened before `cutoff`.
    fn get_expired_reserve_states(&self, cutoff: DateTime<Utc>) -> StorageResult<Vec<SpaceRecord>>;

    /// Moves a space to `state` with the given occupant.
    ///
    /// Returns the record as it was before the update, or `None` if the
    /// space is unknown.
    fn update_space_state(
        &self,
        space_id: SpaceId,
        state: SpaceState,
        plate: Option<&LicensePlate>,
    ) -> StorageResult<Option<SpaceRecord>>;

    /// Sets the occupant of an OCCUPIED space without a state transition.
    ///
    /// Fails (`Ok(false)`) if the space is unknown or not OCCUPIED, or the
    /// plate is attached to another space.
    fn update_space_plate(&self, space_id: SpaceId, plate: &LicensePlate) -> StorageResult<bool>;

    fn get_reservation_for_license_plate(
        &self,
        plate: &LicensePlate,
    ) -> StorageResult<Option<SpaceRecord>>;

    fn get_space_occupied_by_license_plate(
        &self,
        plate: &LicensePlate,
    ) -> StorageResult<Option<SpaceRecord>>;

    /// Atomically reserves a FREE space for a plate that holds no other
    /// RESERVED or OCCUPIED space. Returns false if either guard fails.
    fn attempt_to_reserve_spot(&self, space_id: SpaceId, plate: &LicensePlate) -> StorageResult<bool>;

    /// Releases every reservation held by `plate`.
    fn cancel_reservations_for(&self, plate: &LicensePlate) -> StorageResult<bool>;

    /// Releases the reservation on one space, if it is still RESERVED.
    fn cancel_reservation_for_spot(&self, space_id: SpaceId) -> StorageResult<bool>;
}

/// Errors raised by a storage engine.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Failed to prepare database at {path}: {error}")]
    Setup { path: String, error: String },

    #[error("Corrupt record for space {space_id}: {reason}")]
    Corrupt { space_id: SpaceId, reason: String },

    #[error("License plate {0} is already attached to another space")]
    PlateInUse(LicensePlate),
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;
