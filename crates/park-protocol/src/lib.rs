//! Park Protocol - Wire protocol for daemon communication
//!
//! This crate provides the newline-delimited JSON frames exchanged between
//! the parking daemon and its clients: reservation apps, plate readers and
//! sensor ingestion.

pub mod message;
pub mod version;

pub use message::{ClientMessage, PlateReaderMessage, RequestType, ServerMessage};
pub use version::{ProtocolVersion, VersionError};
