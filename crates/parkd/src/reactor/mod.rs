//! Completion-driven reactor for streaming sessions.
//!
//! Transports never call into sessions directly. They post completion
//! events to the reactor, which looks the session up by tag and runs its
//! tick handler on the reactor task.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐  Incoming(call)   ┌──────────────────┐
//! │ ConnectionHandler│──────────────────▶│   ReactorActor   │
//! └──────────────────┘                   │  HashMap<Tag,    │
//! ┌──────────────────┐  Completion/Done  │   SessionHandle> │
//! │  stream driver   │──────────────────▶│                  │
//! └──────────────────┘                   └────────┬─────────┘
//!          ▲              start_write/read/finish │ tick
//!          └──────────────────────────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! - Completions for unknown tags are logged and dropped
//! - Posting to a stopped reactor is a no-op

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

mod actor;
mod commands;
mod endpoints;
mod handle;
mod sessions;

pub use actor::ReactorActor;
pub use commands::{
    IncomingCall, PlateReaderTransport, ReactorCommand, ReactorError, ReservationSink, StatusSink,
};
pub use endpoints::CoordinatorEndpoints;
pub use handle::ReactorHandle;
pub use sessions::{SessionFactory, SessionHandle};

/// Spawns the reactor task and returns a handle to it.
///
/// One acceptor per endpoint is created before the first command is
/// processed. The reactor stops when `cancel` fires.
pub fn spawn_reactor(factory: impl SessionFactory + 'static, cancel: CancellationToken) -> ReactorHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = ReactorHandle::new(tx);

    let actor = ReactorActor::new(rx, handle.clone(), Box::new(factory));
    tokio::spawn(actor.run(cancel));

    handle
}
