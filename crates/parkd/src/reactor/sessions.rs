//! Arena entries and the factory that creates them.

use std::sync::Arc;

use tracing::warn;

use super::commands::IncomingCall;
use super::handle::ReactorHandle;
use crate::session::{
    Disposition, PlateReaderSession, ReservationSession, Scope, StatusSession, StreamKind, Tag,
};

/// A session owned by the reactor arena.
#[derive(Clone)]
pub enum SessionHandle {
    Snapshot(Arc<StatusSession>),
    SpaceStatus(Arc<StatusSession>),
    Reservation(Arc<ReservationSession>),
    PlateReader(Arc<PlateReaderSession>),
}

impl SessionHandle {
    pub fn kind(&self) -> StreamKind {
        match self {
            Self::Snapshot(_) => StreamKind::Snapshot,
            Self::SpaceStatus(_) => StreamKind::SpaceStatus,
            Self::Reservation(_) => StreamKind::Reservation,
            Self::PlateReader(_) => StreamKind::PlateReader,
        }
    }

    pub fn tag(&self) -> Tag {
        match self {
            Self::Snapshot(s) | Self::SpaceStatus(s) => s.tag(),
            Self::Reservation(s) => s.tag(),
            Self::PlateReader(s) => s.tag(),
        }
    }

    pub fn activate(&self) {
        match self {
            Self::Snapshot(s) | Self::SpaceStatus(s) => s.activate(),
            Self::Reservation(s) => s.activate(),
            Self::PlateReader(s) => s.activate(),
        }
    }

    /// Binds an arrived call to this session.
    ///
    /// Hands the call back if it belongs to another endpoint.
    pub fn bind(&self, call: IncomingCall) -> Result<(), IncomingCall> {
        let bound = match (self, call) {
            (Self::Snapshot(s), IncomingCall::FetchAllParkingStates(sink))
            | (Self::SpaceStatus(s), IncomingCall::SubscribeToParkingStates(sink)) => {
                s.bind(sink, Scope::All)
            }
            (Self::Reservation(s), IncomingCall::SubscribeToReservationState { space_id, sink }) => {
                s.bind(sink, Scope::Space(space_id))
            }
            (Self::PlateReader(s), IncomingCall::RegisterPlateReader(transport)) => {
                s.bind(transport, Scope::Unbound)
            }
            (_, call) => return Err(call),
        };

        if !bound {
            warn!(tag = %self.tag(), kind = %self.kind(), "Session already bound, dropping call");
        }
        Ok(())
    }

    pub fn on_completion(&self, ok: bool) -> Disposition {
        match self {
            Self::Snapshot(s) | Self::SpaceStatus(s) => s.on_completion(ok),
            Self::Reservation(s) => s.on_completion(ok),
            Self::PlateReader(s) => s.on_completion(ok),
        }
    }

    pub fn on_done(&self) -> Disposition {
        match self {
            Self::Snapshot(s) | Self::SpaceStatus(s) => s.on_done(),
            Self::Reservation(s) => s.on_done(),
            Self::PlateReader(s) => s.on_done(),
        }
    }
}

/// Builds the acceptor session for an endpoint.
pub trait SessionFactory: Send {
    fn create(&self, kind: StreamKind, tag: Tag, reactor: ReactorHandle) -> SessionHandle;
}
