//! Park Core - Shared types for parking-space monitoring
//!
//! This crate provides the domain types shared between the daemon
//! (`parkd`) and its wire protocol (`park-protocol`).
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()` or `todo!()` outside tests.

pub mod error;
pub mod reservation;
pub mod space;

// Re-exports for convenience
pub use error::{DomainError, DomainResult};
pub use reservation::{
    CancelState, PlateReadRequest, ReservationCancelResponse, ReservationResponse,
    ReservationState, ReserveResult, ReserveStatus,
};
pub use space::{LicensePlate, Scoped, SpaceId, SpaceRecord, SpaceState, SpaceStatus};
