//! Reactor commands, incoming calls and errors.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use park_core::{PlateReadRequest, ReserveStatus, SpaceId, SpaceStatus};
use park_protocol::PlateReaderMessage;

use crate::session::{DuplexTransport, StreamKind, StreamSink, Tag};

// ============================================================================
// Transports handed over with a call
// ============================================================================

pub type StatusSink = Arc<dyn StreamSink<SpaceStatus>>;
pub type ReservationSink = Arc<dyn StreamSink<ReserveStatus>>;
pub type PlateReaderTransport = Arc<dyn DuplexTransport<PlateReaderMessage, PlateReadRequest>>;

/// A streaming call opened by a client, waiting for a session.
pub enum IncomingCall {
    FetchAllParkingStates(StatusSink),
    SubscribeToParkingStates(StatusSink),
    SubscribeToReservationState {
        space_id: SpaceId,
        sink: ReservationSink,
    },
    RegisterPlateReader(PlateReaderTransport),
}

impl IncomingCall {
    /// The endpoint whose acceptor serves this call.
    pub fn kind(&self) -> StreamKind {
        match self {
            Self::FetchAllParkingStates(_) => StreamKind::Snapshot,
            Self::SubscribeToParkingStates(_) => StreamKind::SpaceStatus,
            Self::SubscribeToReservationState { .. } => StreamKind::Reservation,
            Self::RegisterPlateReader(_) => StreamKind::PlateReader,
        }
    }
}

impl fmt::Debug for IncomingCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SubscribeToReservationState { space_id, .. } => f
                .debug_struct("SubscribeToReservationState")
                .field("space_id", space_id)
                .finish_non_exhaustive(),
            other => write!(f, "IncomingCall({})", other.kind()),
        }
    }
}

// ============================================================================
// Reactor Commands
// ============================================================================

/// Events processed by the reactor task, in arrival order.
#[derive(Debug)]
pub enum ReactorCommand {
    /// A transport operation started by session `tag` finished.
    Completion { tag: Tag, ok: bool },

    /// The transport of session `tag` was torn down.
    Done { tag: Tag },

    /// Session `tag` is ready for the next call of `kind`.
    AwaitCall { kind: StreamKind, tag: Tag },

    /// Create a fresh acceptor session for `kind`.
    SpawnAcceptor(StreamKind),

    /// A client opened a streaming call.
    Incoming(IncomingCall),
}

// ============================================================================
// Reactor Errors
// ============================================================================

#[derive(Debug, Clone, Error)]
pub enum ReactorError {
    /// The reactor task is gone; typically during shutdown.
    #[error("reactor stopped")]
    Stopped,
}
