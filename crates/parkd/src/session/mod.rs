//! Streaming session state machines.
//!
//! Every open stream is a session object driven by completion events from
//! the reactor. A session issues at most one transport operation at a time
//! and advances its state when that operation completes.
//!
//! - [`WriteSession`] - server-to-client stream (`CREATE -> LISTENING ->
//!   FINISH -> FINISHED`)
//! - [`DuplexSession`] - alternating read/write stream (`CREATE -> WAITING
//!   -> READ | WRITE -> FINISHED`)
//!
//! Producers on other tasks call `write` / `end` / `read_message`; those
//! calls only enqueue and, if the transport is idle, issue the next
//! operation. They never block on the network.

mod duplex;
mod transport;
mod write;

pub use duplex::{DuplexHooks, DuplexSession, DuplexState};
pub use transport::{DuplexTransport, StreamSink, StreamSource};
pub use write::{WriteHooks, WriteSession, WriteState};

use std::fmt;

use park_core::{PlateReadRequest, ReserveStatus, SpaceId, SpaceStatus};
use park_protocol::PlateReaderMessage;

/// Space-status stream (snapshot and live subscription).
pub type StatusSession = WriteSession<SpaceStatus>;

/// Reservation-event stream for one space.
pub type ReservationSession = WriteSession<ReserveStatus>;

/// Plate-reader duplex stream.
pub type PlateReaderSession = DuplexSession<PlateReaderMessage, PlateReadRequest>;

/// Reactor-unique identity of a session, carried by every completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Tag(u64);

impl Tag {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What the reactor should do with a session after a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Keep,
    Dispose,
}

/// The streaming endpoints served by the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    /// `fetchAllParkingStates`: one snapshot, then end
    Snapshot,
    /// `subscribeToParkingStates`
    SpaceStatus,
    /// `subscribeToReservationState`
    Reservation,
    /// `registerPlateReader`
    PlateReader,
}

impl StreamKind {
    pub const ALL: [StreamKind; 4] = [
        Self::Snapshot,
        Self::SpaceStatus,
        Self::Reservation,
        Self::PlateReader,
    ];
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Snapshot => "fetch_all_parking_states",
            Self::SpaceStatus => "subscribe_to_parking_states",
            Self::Reservation => "subscribe_to_reservation_state",
            Self::PlateReader => "register_plate_reader",
        };
        f.write_str(name)
    }
}

/// Which published messages a session accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// Every message
    All,
    /// Messages about one space
    Space(SpaceId),
    /// Nothing yet; the stream has not said which space it serves
    Unbound,
}

impl Scope {
    pub fn admits(self, space_id: SpaceId) -> bool {
        match self {
            Self::All => true,
            Self::Space(bound) => bound == space_id,
            Self::Unbound => false,
        }
    }
}
