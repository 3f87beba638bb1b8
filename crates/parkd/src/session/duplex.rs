//! Bidirectional streaming session with strictly alternating operations.
//!
//! # States
//!
//! ```text
//! CREATE ──activate──▶ WAITING ◀──────────────┐
//!                        │   │                │
//!                   read │   │ write          │ drained
//!                        ▼   ▼                │
//!                      READ  WRITE ───────────┘
//!                        │
//!          end + drained └──────▶ FINISHED
//! ```
//!
//! The transport never has a read and a write in flight at once. A single
//! `idle` slot guards it; after an operation completes the session prefers
//! to continue in the same direction (more reads after a read, queued
//! writes after a write) before switching.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use park_core::Scoped;
use tracing::{debug, warn};

use super::transport::DuplexTransport;
use super::write::lock;
use super::{Disposition, Scope, StreamKind, Tag};
use crate::reactor::ReactorHandle;
use crate::subscribers::{Subscriber, SubscriberRegistry};

/// Lifecycle of a [`DuplexSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplexState {
    Create,
    Waiting,
    Read,
    Write,
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Read,
    Write,
}

enum NextOp<Out> {
    Read,
    Write(Out),
    Finish,
}

type FrameHook<In, Out> = Box<dyn Fn(&Arc<DuplexSession<In, Out>>, In) + Send + Sync>;
type SessionHook<In, Out> = Box<dyn Fn(&Arc<DuplexSession<In, Out>>) + Send + Sync>;

/// Endpoint-specific behavior plugged into a [`DuplexSession`].
pub struct DuplexHooks<In, Out> {
    on_message: FrameHook<In, Out>,
    registry: Option<Arc<SubscriberRegistry<Out, DuplexSession<In, Out>>>>,
    on_ready: Option<SessionHook<In, Out>>,
    on_abandoned: Option<SessionHook<In, Out>>,
}

impl<In, Out> DuplexHooks<In, Out> {
    /// `on_message` receives every frame read from the client, before the
    /// next read is issued.
    pub fn new(on_message: impl Fn(&Arc<DuplexSession<In, Out>>, In) + Send + Sync + 'static) -> Self {
        Self {
            on_message: Box::new(on_message),
            registry: None,
            on_ready: None,
            on_abandoned: None,
        }
    }

    pub fn registry(mut self, registry: Arc<SubscriberRegistry<Out, DuplexSession<In, Out>>>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Runs once when the call arrives.
    pub fn on_ready(mut self, hook: impl Fn(&Arc<DuplexSession<In, Out>>) + Send + Sync + 'static) -> Self {
        self.on_ready = Some(Box::new(hook));
        self
    }

    /// Runs when requested reads can no longer be served.
    pub fn on_abandoned(
        mut self,
        hook: impl Fn(&Arc<DuplexSession<In, Out>>) + Send + Sync + 'static,
    ) -> Self {
        self.on_abandoned = Some(Box::new(hook));
        self
    }
}

/// One bidirectional stream.
pub struct DuplexSession<In, Out> {
    tag: Tag,
    kind: StreamKind,
    reactor: ReactorHandle,
    state: Mutex<DuplexState>,
    started: AtomicBool,
    /// Transport slot; true when no operation is in flight
    idle: AtomicBool,
    /// Requested reads, including the one in flight
    pending_reads: AtomicUsize,
    ending: AtomicBool,
    outbound: Mutex<VecDeque<Out>>,
    transport: OnceLock<Arc<dyn DuplexTransport<In, Out>>>,
    scope: Mutex<Scope>,
    hooks: DuplexHooks<In, Out>,
}

impl<In, Out> DuplexSession<In, Out>
where
    In: Send + 'static,
    Out: Scoped + Clone + Send + 'static,
{
    pub fn new(
        tag: Tag,
        kind: StreamKind,
        reactor: ReactorHandle,
        hooks: DuplexHooks<In, Out>,
    ) -> Arc<Self> {
        Arc::new(Self {
            tag,
            kind,
            reactor,
            state: Mutex::new(DuplexState::Create),
            started: AtomicBool::new(false),
            idle: AtomicBool::new(false),
            pending_reads: AtomicUsize::new(0),
            ending: AtomicBool::new(false),
            outbound: Mutex::new(VecDeque::new()),
            transport: OnceLock::new(),
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

    pub fn state(&self) -> DuplexState {
        *lock(&self.state)
    }

    pub fn scope(&self) -> Scope {
        *lock(&self.scope)
    }

    /// Narrows which published messages this session receives.
    pub fn bind_scope(&self, scope: Scope) {
        *lock(&self.scope) = scope;
    }

    pub fn pending_reads(&self) -> usize {
        self.pending_reads.load(Ordering::Acquire)
    }

    pub fn queued(&self) -> usize {
        lock(&self.outbound).len()
    }

    /// CREATE tick: asks the reactor for the next incoming call of this kind.
    pub fn activate(&self) {
        {
            let mut state = lock(&self.state);
            if *state != DuplexState::Create {
                return;
            }
            *state = DuplexState::Waiting;
        }
        self.reactor.await_call(self.kind, self.tag);
    }

    /// Attaches the transport of an arrived call.
    pub fn bind(&self, transport: Arc<dyn DuplexTransport<In, Out>>, scope: Scope) -> bool {
        if self.transport.set(Arc::clone(&transport)).is_err() {
            return false;
        }
        self.bind_scope(scope);
        transport.notify_when_done(self.tag);
        true
    }

    /// Handles one completion event for this session.
    pub fn on_completion(self: &Arc<Self>, ok: bool) -> Disposition {
        match self.state() {
            DuplexState::Create => {
                warn!(tag = %self.tag, kind = %self.kind, "Completion before activation");
                Disposition::Keep
            }
            DuplexState::Finished => {
                debug!(tag = %self.tag, kind = %self.kind, "Stream finished");
                Disposition::Dispose
            }
            DuplexState::Waiting => self.on_call_arrived(ok),
            DuplexState::Read => self.on_read_done(ok),
            DuplexState::Write => self.on_write_done(ok),
        }
    }

    /// Handles the transport's torn-down notice.
    pub fn on_done(self: &Arc<Self>) -> Disposition {
        if self.state() == DuplexState::Finished {
            return Disposition::Dispose;
        }
        if self.started.load(Ordering::Acquire) && self.idle.load(Ordering::Acquire) {
            self.set_state(DuplexState::Finished);
            debug!(tag = %self.tag, kind = %self.kind, "Idle stream cancelled");
            return Disposition::Dispose;
        }
        Disposition::Keep
    }

    /// Requests one more inbound frame.
    pub fn read_message(&self) {
        if self.ending.load(Ordering::Acquire) {
            debug!(tag = %self.tag, "Ignoring read request on ending stream");
            return;
        }
        self.pending_reads.fetch_add(1, Ordering::AcqRel);
        self.pump(Direction::Read);
    }

    /// Enqueues an outbound frame.
    pub fn write(&self, message: Out) {
        if self.ending.load(Ordering::Acquire) {
            debug!(tag = %self.tag, kind = %self.kind, "Dropping write after end");
            return;
        }
        lock(&self.outbound).push_back(message);
        self.pump(Direction::Write);
    }

    /// Finishes the stream once pending reads and writes have drained.
    pub fn end(&self) {
        if !self.ending.swap(true, Ordering::AcqRel) {
            self.pump(Direction::Write);
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.state() == DuplexState::Finished
            || self.transport.get().is_some_and(|t| t.is_cancelled())
    }

    fn on_call_arrived(self: &Arc<Self>, ok: bool) -> Disposition {
        if self.started.swap(true, Ordering::AcqRel) {
            warn!(tag = %self.tag, "Unexpected completion while waiting");
            return Disposition::Keep;
        }

        self.reactor.spawn_acceptor(self.kind);

        if !ok || self.transport.get().is_some_and(|t| t.is_cancelled()) {
            self.set_state(DuplexState::Finished);
            return Disposition::Dispose;
        }

        debug!(tag = %self.tag, kind = %self.kind, "Stream started");

        if let Some(registry) = &self.hooks.registry {
            registry.register(Arc::clone(self));
        }

        self.idle.store(true, Ordering::Release);

        if let Some(hook) = &self.hooks.on_ready {
            hook(self);
        }

        self.pump(Direction::Read);
        Disposition::Keep
    }

    fn on_read_done(self: &Arc<Self>, ok: bool) -> Disposition {
        if !ok {
            debug!(tag = %self.tag, kind = %self.kind, "Client closed its side");
            self.pending_reads.store(0, Ordering::Release);
            self.ending.store(true, Ordering::Release);
            self.abandon();
            self.idle.store(true, Ordering::Release);
            self.pump(Direction::Write);
            return Disposition::Keep;
        }

        let frame = self.transport.get().and_then(|t| t.take_read());
        let _ = self
            .pending_reads
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));

        if let Some(frame) = frame {
            (self.hooks.on_message)(self, frame);
        }

        self.idle.store(true, Ordering::Release);
        self.pump(Direction::Read);
        Disposition::Keep
    }

    fn on_write_done(self: &Arc<Self>, ok: bool) -> Disposition {
        if !ok || self.transport.get().is_some_and(|t| t.is_cancelled()) {
            self.set_state(DuplexState::Finished);
            debug!(tag = %self.tag, kind = %self.kind, ok, "Stream closed by transport");
            if self.pending_reads.swap(0, Ordering::AcqRel) > 0 {
                self.abandon();
            }
            return Disposition::Dispose;
        }

        self.idle.store(true, Ordering::Release);
        self.pump(Direction::Write);
        Disposition::Keep
    }

    fn abandon(self: &Arc<Self>) {
        if let Some(hook) = &self.hooks.on_abandoned {
            hook(self);
        }
    }

    /// Issues the next operation if the transport is idle.
    fn pump(&self, prefer: Direction) {
        let Some(transport) = self.transport.get() else {
            return;
        };

        loop {
            if self
                .idle
                .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return;
            }

            match self.next_op(prefer) {
                Some(NextOp::Read) => {
                    self.set_state(DuplexState::Read);
                    transport.start_read(self.tag);
                    return;
                }
                Some(NextOp::Write(message)) => {
                    self.set_state(DuplexState::Write);
                    transport.start_write(self.tag, message);
                    return;
                }
                Some(NextOp::Finish) => {
                    self.set_state(DuplexState::Finished);
                    transport.start_finish(self.tag);
                    return;
                }
                None => {
                    self.set_state(DuplexState::Waiting);
                    self.idle.store(true, Ordering::Release);
                    if !self.has_work() {
                        return;
                    }
                }
            }
        }
    }

    fn next_op(&self, prefer: Direction) -> Option<NextOp<Out>> {
        let wants_read = self.pending_reads.load(Ordering::Acquire) > 0;

        let op = match prefer {
            Direction::Read if wants_read => NextOp::Read,
            Direction::Read => match lock(&self.outbound).pop_front() {
                Some(message) => NextOp::Write(message),
                None if self.ending.load(Ordering::Acquire) => NextOp::Finish,
                None => return None,
            },
            Direction::Write => match lock(&self.outbound).pop_front() {
                Some(message) => NextOp::Write(message),
                None if wants_read => NextOp::Read,
                None if self.ending.load(Ordering::Acquire) => NextOp::Finish,
                None => return None,
            },
        };
        Some(op)
    }

    fn has_work(&self) -> bool {
        self.pending_reads.load(Ordering::Acquire) > 0
            || !lock(&self.outbound).is_empty()
            || self.ending.load(Ordering::Acquire)
    }

    fn set_state(&self, state: DuplexState) {
        *lock(&self.state) = state;
    }
}

impl<In, Out> Subscriber<Out> for DuplexSession<In, Out>
where
    In: Send + 'static,
    Out: Scoped + Clone + Send + 'static,
{
    fn is_cancelled(&self) -> bool {
        DuplexSession::is_cancelled(self)
    }

    fn should_receive(&self, message: &Out) -> bool {
        self.scope().admits(message.space_id())
    }

    fn write(&self, message: Out) {
        DuplexSession::write(self, message)
    }

    fn end(&self) {
        DuplexSession::end(self)
    }
}
