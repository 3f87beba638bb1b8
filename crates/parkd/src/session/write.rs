//! Server-to-client streaming session.
//!
//! # States
//!
//! ```text
//! CREATE ──activate──▶ LISTENING ──end()──▶ FINISH ──last write──▶ FINISHED
//!                          │                                          │
//!                          └──── transport failure ───────────────────┘
//! ```
//!
//! # Send slot
//!
//! `ready` is true while the transport has no write in flight. Whoever
//! flips it from true to false owns the transport until the matching
//! completion arrives. [`WriteSession::pump`] re-checks the queue after
//! releasing the slot so a message enqueued concurrently is never stranded.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use park_core::Scoped;
use tracing::{debug, warn};

use super::transport::StreamSink;
use super::{Disposition, Scope, StreamKind, Tag};
use crate::reactor::ReactorHandle;
use crate::subscribers::{Subscriber, SubscriberRegistry};

/// Lifecycle of a [`WriteSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteState {
    Create,
    Listening,
    Finish,
    Finished,
}

type ReadyHook<T> = Box<dyn Fn(&Arc<WriteSession<T>>) + Send + Sync>;

/// Endpoint-specific behavior plugged into a [`WriteSession`].
pub struct WriteHooks<T> {
    registry: Option<Arc<SubscriberRegistry<T, WriteSession<T>>>>,
    on_ready: Option<ReadyHook<T>>,
}

impl<T> WriteHooks<T> {
    pub fn new() -> Self {
        Self {
            registry: None,
            on_ready: None,
        }
    }

    /// Registry the session joins once its call arrives.
    pub fn registry(mut self, registry: Arc<SubscriberRegistry<T, WriteSession<T>>>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Runs once, right after the call arrives and the stream is writable.
    pub fn on_ready(mut self, hook: impl Fn(&Arc<WriteSession<T>>) + Send + Sync + 'static) -> Self {
        self.on_ready = Some(Box::new(hook));
        self
    }
}

impl<T> Default for WriteHooks<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// One server-to-client stream.
///
/// Owned by the reactor arena; producers hold `Arc`s through subscriber
/// registries and call [`write`](Self::write) / [`end`](Self::end) from any
/// thread.
pub struct WriteSession<T> {
    tag: Tag,
    kind: StreamKind,
    reactor: ReactorHandle,
    state: Mutex<WriteState>,
    /// Set by the first completion after the call arrived
    started: AtomicBool,
    /// Send slot; true when no write is in flight
    ready: AtomicBool,
    ending: AtomicBool,
    queue: Mutex<VecDeque<T>>,
    sink: OnceLock<Arc<dyn StreamSink<T>>>,
    scope: Mutex<Scope>,
    hooks: WriteHooks<T>,
}

impl<T> WriteSession<T>
where
    T: Scoped + Clone + Send + 'static,
{
    pub fn new(tag: Tag, kind: StreamKind, reactor: ReactorHandle, hooks: WriteHooks<T>) -> Arc<Self> {
        Arc::new(Self {
            tag,
            kind,
            reactor,
            state: Mutex::new(WriteState::Create),
            started: AtomicBool::new(false),
            ready: AtomicBool::new(false),
            ending: AtomicBool::new(false),
            queue: Mutex::new(VecDeque::new()),
            sink: OnceLock::new(),
            scope: Mutex::new(Scope::Unbound),
            hooks,
        })
    }

    pub fn tag(&self) -> Tag {
        self.tag
    }

    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    pub fn state(&self) -> WriteState {
        *lock(&self.state)
    }

    pub fn scope(&self) -> Scope {
        *lock(&self.scope)
    }

    /// Number of messages waiting for the send slot.
    pub fn queued(&self) -> usize {
        lock(&self.queue).len()
    }

    /// CREATE tick: asks the reactor for the next incoming call of this kind.
    pub fn activate(&self) {
        {
            let mut state = lock(&self.state);
            if *state != WriteState::Create {
                return;
            }
            *state = WriteState::Listening;
        }
        self.reactor.await_call(self.kind, self.tag);
    }

    /// Attaches the transport of an arrived call.
    ///
    /// Returns false if the session was already bound.
    pub fn bind(&self, sink: Arc<dyn StreamSink<T>>, scope: Scope) -> bool {
        if self.sink.set(Arc::clone(&sink)).is_err() {
            return false;
        }
        *lock(&self.scope) = scope;
        sink.notify_when_done(self.tag);
        true
    }

    /// Handles one completion event for this session.
    pub fn on_completion(self: &Arc<Self>, ok: bool) -> Disposition {
        match self.state() {
            WriteState::Create => {
                warn!(tag = %self.tag, kind = %self.kind, "Completion before activation");
                Disposition::Keep
            }
            WriteState::Finished => {
                debug!(tag = %self.tag, kind = %self.kind, "Stream finished");
                Disposition::Dispose
            }
            WriteState::Listening | WriteState::Finish => {
                let first = !self.started.swap(true, Ordering::AcqRel);
                if first {
                    // Keep the endpoint accepting whatever happens to this call
                    self.reactor.spawn_acceptor(self.kind);
                }

                if !ok || self.transport_cancelled() {
                    self.set_state(WriteState::Finished);
                    debug!(tag = %self.tag, kind = %self.kind, ok, "Stream closed by transport");
                    return Disposition::Dispose;
                }

                if first {
                    self.start_streaming();
                } else {
                    self.ready.store(true, Ordering::Release);
                }

                self.pump();
                Disposition::Keep
            }
        }
    }

    /// Handles the transport's torn-down notice.
    ///
    /// An idle session is disposed now; a busy one is disposed by the
    /// completion of its in-flight operation.
    pub fn on_done(&self) -> Disposition {
        if self.state() == WriteState::Finished {
            return Disposition::Dispose;
        }
        if self.started.load(Ordering::Acquire) && self.ready.load(Ordering::Acquire) {
            self.set_state(WriteState::Finished);
            debug!(tag = %self.tag, kind = %self.kind, "Idle stream cancelled");
            return Disposition::Dispose;
        }
        Disposition::Keep
    }

    /// Enqueues a message; sends it right away if the slot is free.
    ///
    /// Messages written after [`end`](Self::end) are dropped.
    pub fn write(&self, message: T) {
        if self.ending.load(Ordering::Acquire) {
            debug!(tag = %self.tag, kind = %self.kind, "Dropping write after end");
            return;
        }
        lock(&self.queue).push_back(message);
        self.pump();
    }

    /// Finishes the stream after every queued message is sent.
    pub fn end(&self) {
        {
            let mut state = lock(&self.state);
            if *state == WriteState::Listening {
                *state = WriteState::Finish;
            }
        }
        if !self.ending.swap(true, Ordering::AcqRel) {
            self.pump();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.state() == WriteState::Finished || self.transport_cancelled()
    }

    fn transport_cancelled(&self) -> bool {
        self.sink.get().is_some_and(|sink| sink.is_cancelled())
    }

    fn start_streaming(self: &Arc<Self>) {
        debug!(tag = %self.tag, kind = %self.kind, scope = ?self.scope(), "Stream started");

        if let Some(registry) = &self.hooks.registry {
            registry.register(Arc::clone(self));
        }

        self.ready.store(true, Ordering::Release);

        if let Some(hook) = &self.hooks.on_ready {
            hook(self);
        }
    }

    /// Issues the next write or the finish if the send slot is free.
    fn pump(&self) {
        loop {
            if self
                .ready
                .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return;
            }

            let next = lock(&self.queue).pop_front();
            if let Some(message) = next {
                self.start_write(message);
                return;
            }

            if self.ending.load(Ordering::Acquire) {
                self.start_finish();
                return;
            }

            self.ready.store(true, Ordering::Release);

            if lock(&self.queue).is_empty() && !self.ending.load(Ordering::Acquire) {
                return;
            }
        }
    }

    fn start_write(&self, message: T) {
        match self.sink.get() {
            Some(sink) => sink.start_write(self.tag, message),
            None => {
                // Not bound yet: put it back and leave the slot closed
                lock(&self.queue).push_front(message);
            }
        }
    }

    fn start_finish(&self) {
        self.set_state(WriteState::Finished);
        if let Some(sink) = self.sink.get() {
            sink.start_finish(self.tag);
        }
    }

    fn set_state(&self, state: WriteState) {
        *lock(&self.state) = state;
    }
}

impl<T> Subscriber<T> for WriteSession<T>
where
    T: Scoped + Clone + Send + 'static,
{
    fn is_cancelled(&self) -> bool {
        WriteSession::is_cancelled(self)
    }

    fn should_receive(&self, message: &T) -> bool {
        self.scope().admits(message.space_id())
    }

    fn write(&self, message: T) {
        WriteSession::write(self, message)
    }

    fn end(&self) {
        WriteSession::end(self)
    }
}

pub(super) fn lock<V>(mutex: &Mutex<V>) -> MutexGuard<'_, V> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
