//! Session factory for the parking endpoints.

use std::sync::{Arc, Weak};

use tracing::debug;

use park_core::{PlateReadRequest, SpaceStatus};
use park_protocol::PlateReaderMessage;

use super::handle::ReactorHandle;
use super::sessions::{SessionFactory, SessionHandle};
use crate::coordinator::Coordinator;
use crate::session::{DuplexHooks, DuplexSession, StreamKind, Tag, WriteHooks, WriteSession};

/// Creates sessions wired to a [`Coordinator`].
///
/// Session hooks hold the coordinator weakly: sessions live inside the
/// coordinator's registries.
pub struct CoordinatorEndpoints {
    coordinator: Weak<Coordinator>,
}

impl CoordinatorEndpoints {
    pub fn new(coordinator: &Arc<Coordinator>) -> Self {
        Self {
            coordinator: Arc::downgrade(coordinator),
        }
    }
}

impl SessionFactory for CoordinatorEndpoints {
    fn create(&self, kind: StreamKind, tag: Tag, reactor: ReactorHandle) -> SessionHandle {
        let subscribers = self
            .coordinator
            .upgrade()
            .map(|coordinator| Arc::clone(coordinator.subscribers()));

        match kind {
            StreamKind::Snapshot => {
                let coordinator = self.coordinator.clone();
                let hooks = WriteHooks::<SpaceStatus>::new().on_ready(move |session| match coordinator.upgrade() {
                    Some(coordinator) => coordinator.stream_snapshot(session),
                    None => session.end(),
                });
                SessionHandle::Snapshot(WriteSession::new(tag, kind, reactor, hooks))
            }
            StreamKind::SpaceStatus => {
                let mut hooks = WriteHooks::new();
                if let Some(subscribers) = &subscribers {
                    hooks = hooks.registry(Arc::clone(&subscribers.space_status));
                }
                SessionHandle::SpaceStatus(WriteSession::new(tag, kind, reactor, hooks))
            }
            StreamKind::Reservation => {
                let mut hooks = WriteHooks::new();
                if let Some(subscribers) = &subscribers {
                    hooks = hooks.registry(Arc::clone(&subscribers.reservations));
                }
                SessionHandle::Reservation(WriteSession::new(tag, kind, reactor, hooks))
            }
            StreamKind::PlateReader => {
                let on_frame = self.coordinator.clone();
                let on_lost = self.coordinator.clone();

                let mut hooks = DuplexHooks::<PlateReaderMessage, PlateReadRequest>::new(move |session, frame| match on_frame.upgrade() {
                    Some(coordinator) => coordinator.handle_plate_reader_frame(session, frame),
                    None => debug!(tag = %session.tag(), "Coordinator gone, dropping frame"),
                })
                // The first frame is the registration
                .on_ready(|session| session.read_message())
                .on_abandoned(move |session| {
                    if let Some(coordinator) = on_lost.upgrade() {
                        coordinator.plate_reader_lost(session);
                    }
                });

                if let Some(subscribers) = &subscribers {
                    hooks = hooks.registry(Arc::clone(&subscribers.plate_readers));
                }
                SessionHandle::PlateReader(DuplexSession::new(tag, kind, reactor, hooks))
            }
        }
    }
}
