//! Client interface for posting events to the reactor.

use tokio::sync::mpsc;
use tracing::debug;

use super::commands::{IncomingCall, ReactorCommand, ReactorError};
use crate::session::{StreamKind, Tag};

/// Cheap-to-clone handle to the reactor task.
///
/// Every method is non-blocking: commands go over an unbounded channel so
/// sessions and transports can post from any thread without waiting.
#[derive(Clone)]
pub struct ReactorHandle {
    sender: mpsc::UnboundedSender<ReactorCommand>,
}

impl ReactorHandle {
    pub fn new(sender: mpsc::UnboundedSender<ReactorCommand>) -> Self {
        Self { sender }
    }

    /// Posts the completion of a transport operation.
    pub fn complete(&self, tag: Tag, ok: bool) {
        self.post(ReactorCommand::Completion { tag, ok });
    }

    /// Posts the torn-down notice for a session's transport.
    pub fn done(&self, tag: Tag) {
        self.post(ReactorCommand::Done { tag });
    }

    pub fn await_call(&self, kind: StreamKind, tag: Tag) {
        self.post(ReactorCommand::AwaitCall { kind, tag });
    }

    pub fn spawn_acceptor(&self, kind: StreamKind) {
        self.post(ReactorCommand::SpawnAcceptor(kind));
    }

    /// Hands a client's streaming call to the reactor.
    ///
    /// # Errors
    ///
    /// `ReactorError::Stopped` if the reactor has shut down.
    pub fn incoming(&self, call: IncomingCall) -> Result<(), ReactorError> {
        self.sender
            .send(ReactorCommand::Incoming(call))
            .map_err(|_| ReactorError::Stopped)
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    fn post(&self, command: ReactorCommand) {
        if self.sender.send(command).is_err() {
            debug!("Reactor stopped, dropping event");
        }
    }
}
