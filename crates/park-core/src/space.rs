//! Parking space entities and value objects.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::DomainError;

// ============================================================================
// Type-Safe Identifiers
// ============================================================================

/// Identity of a monitored parking space.
///
/// Real spaces are non-negative. [`SpaceId::NONE`] (`-1`) is the wire value
/// used when a lookup found no space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SpaceId(i64);

impl SpaceId {
    /// Sentinel reported when no space matches a query.
    pub const NONE: SpaceId = SpaceId(-1);

    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    pub const fn get(self) -> i64 {
        self.0
    }

    /// Returns true for ids that can name a real space.
    #[must_use]
    pub const fn is_assigned(self) -> bool {
        self.0 >= 0
    }
}

impl fmt::Display for SpaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for SpaceId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

/// A license plate as read by a plate reader or given by a client.
///
/// An empty plate means "nothing was read".
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LicensePlate(String);

impl LicensePlate {
    pub fn new(plate: impl Into<String>) -> Self {
        Self(plate.into())
    }

    /// The plate used when no reading is available.
    pub fn empty() -> Self {
        Self(String::new())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for LicensePlate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for LicensePlate {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for LicensePlate {
    fn from(s: String) -> Self {
        Self(s)
    }
}

// ============================================================================
// Space State
// ============================================================================

/// Occupancy state of a space.
///
/// Legal transitions: `FREE -> RESERVED`, `FREE -> OCCUPIED`,
/// `RESERVED -> OCCUPIED`, `RESERVED -> FREE`, `OCCUPIED -> FREE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SpaceState {
    #[default]
    Free,
    Reserved,
    Occupied,
}

impl SpaceState {
    /// Storage encoding (`STATE` column).
    pub const fn as_i64(self) -> i64 {
        match self {
            Self::Free => 0,
            Self::Reserved => 1,
            Self::Occupied => 2,
        }
    }

    /// Returns true if `self -> next` is an edge of the space state machine.
    ///
    /// Self-transitions are allowed: sensors may repeat a reading.
    #[must_use]
    pub fn can_transition_to(self, next: SpaceState) -> bool {
        !matches!((self, next), (Self::Occupied, Self::Reserved))
    }

    pub const fn label(self) -> &'static str {
        match self {
            Self::Free => "FREE",
            Self::Reserved => "RESERVED",
            Self::Occupied => "OCCUPIED",
        }
    }
}

impl TryFrom<i64> for SpaceState {
    type Error = DomainError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Free),
            1 => Ok(Self::Reserved),
            2 => Ok(Self::Occupied),
            other => Err(DomainError::InvalidFieldValue {
                field: "state".to_string(),
                value: other.to_string(),
                expected: "0, 1 or 2".to_string(),
            }),
        }
    }
}

impl fmt::Display for SpaceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

// ============================================================================
// Space Record
// ============================================================================

/// Persisted state of one space.
///
/// A plate is the occupant of at most one RESERVED or OCCUPIED space at a
/// time; storage enforces this.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpaceRecord {
    pub space_id: SpaceId,
    pub state: SpaceState,
    pub section: String,
    pub occupant: Option<LicensePlate>,
    /// Time of the last state transition, drives reservation expiry.
    pub last_change: DateTime<Utc>,
}

impl SpaceRecord {
    /// A freshly registered, free space.
    pub fn new(space_id: SpaceId, section: impl Into<String>) -> Self {
        Self {
            space_id,
            state: SpaceState::Free,
            section: section.into(),
            occupant: None,
            last_change: Utc::now(),
        }
    }

    /// Returns true if `plate` is this space's occupant.
    pub fn is_held_by(&self, plate: &LicensePlate) -> bool {
        self.occupant.as_ref() == Some(plate)
    }

    pub fn status(&self) -> SpaceStatus {
        SpaceStatus {
            space_id: self.space_id,
            section: self.section.clone(),
            state: self.state,
        }
    }
}

/// Published view of a space: `SpaceStatus{spaceId, section, state}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpaceStatus {
    pub space_id: SpaceId,
    pub section: String,
    pub state: SpaceState,
}

impl SpaceStatus {
    pub fn new(space_id: SpaceId, section: impl Into<String>, state: SpaceState) -> Self {
        Self {
            space_id,
            section: section.into(),
            state,
        }
    }

    /// Answer for a plate with neither a reservation nor a parked car.
    pub fn none() -> Self {
        Self::new(SpaceId::NONE, String::new(), SpaceState::Free)
    }
}

/// Messages that concern a single space.
///
/// Sessions bound to a space use this to decide what they receive.
pub trait Scoped {
    fn space_id(&self) -> SpaceId;
}

impl Scoped for SpaceStatus {
    fn space_id(&self) -> SpaceId {
        self.space_id
    }
}
