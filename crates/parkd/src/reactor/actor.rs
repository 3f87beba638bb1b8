//! Reactor actor - owns the session arena and dispatches completions.
//!
//! The reactor is the single owner of every streaming session. It runs on
//! one task and processes [`ReactorCommand`]s sequentially, so session tick
//! logic never runs concurrently with itself.
//!
//! # Accepting calls
//!
//! Each endpoint keeps exactly one acceptor session waiting for a call.
//! When a call arrives it is bound to the waiting acceptor, whose first tick
//! asks for a replacement. Calls that arrive while the replacement is being
//! created wait in a per-endpoint backlog.

use std::collections::{HashMap, VecDeque};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::commands::{IncomingCall, ReactorCommand};
use super::handle::ReactorHandle;
use super::sessions::{SessionFactory, SessionHandle};
use crate::session::{Disposition, StreamKind, Tag};

/// The reactor actor.
pub struct ReactorActor {
    receiver: mpsc::UnboundedReceiver<ReactorCommand>,

    /// Passed to every session it creates
    handle: ReactorHandle,

    factory: Box<dyn SessionFactory>,

    /// Arena: every live session by tag
    sessions: HashMap<Tag, SessionHandle>,

    /// Acceptor waiting for the next call, per endpoint
    waiting: HashMap<StreamKind, Tag>,

    /// Calls that arrived while no acceptor was waiting
    backlog: HashMap<StreamKind, VecDeque<IncomingCall>>,

    next_tag: u64,
}

impl ReactorActor {
    pub fn new(
        receiver: mpsc::UnboundedReceiver<ReactorCommand>,
        handle: ReactorHandle,
        factory: Box<dyn SessionFactory>,
    ) -> Self {
        Self {
            receiver,
            handle,
            factory,
            sessions: HashMap::new(),
            waiting: HashMap::new(),
            backlog: HashMap::new(),
            next_tag: 1,
        }
    }

    /// Runs the event loop until `cancel` fires.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!("Reactor starting");
        self.start();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Reactor received shutdown signal");
                    break;
                }
                command = self.receiver.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
            }
        }

        info!(sessions = self.sessions.len(), "Reactor stopped");
    }

    /// Creates one acceptor per endpoint.
    fn start(&mut self) {
        for kind in StreamKind::ALL {
            self.spawn_session(kind);
        }
    }

    fn handle_command(&mut self, command: ReactorCommand) {
        match command {
            ReactorCommand::Completion { tag, ok } => self.tick(tag, ok),
            ReactorCommand::Done { tag } => self.handle_done(tag),
            ReactorCommand::AwaitCall { kind, tag } => self.handle_await_call(kind, tag),
            ReactorCommand::SpawnAcceptor(kind) => self.spawn_session(kind),
            ReactorCommand::Incoming(call) => self.handle_incoming(call),
        }
    }

    // ========================================================================
    // Command Handlers
    // ========================================================================

    /// Dispatches a completion to its session.
    fn tick(&mut self, tag: Tag, ok: bool) {
        let Some(session) = self.sessions.get(&tag).cloned() else {
            debug!(tag = %tag, ok, "Completion for retired session");
            return;
        };

        if session.on_completion(ok) == Disposition::Dispose {
            self.retire(tag);
        }
    }

    fn handle_done(&mut self, tag: Tag) {
        let Some(session) = self.sessions.get(&tag).cloned() else {
            return;
        };

        if session.on_done() == Disposition::Dispose {
            self.retire(tag);
        }
    }

    fn handle_await_call(&mut self, kind: StreamKind, tag: Tag) {
        let queued = self.backlog.get_mut(&kind).and_then(VecDeque::pop_front);

        match queued {
            Some(call) => self.bind(tag, call),
            None => {
                if let Some(previous) = self.waiting.insert(kind, tag) {
                    warn!(kind = %kind, previous = %previous, tag = %tag, "Replacing waiting acceptor");
                }
            }
        }
    }

    fn handle_incoming(&mut self, call: IncomingCall) {
        let kind = call.kind();

        match self.waiting.remove(&kind) {
            Some(tag) => self.bind(tag, call),
            None => {
                let backlog = self.backlog.entry(kind).or_default();
                backlog.push_back(call);
                debug!(kind = %kind, queued = backlog.len(), "No acceptor waiting, call queued");
            }
        }
    }

    // ========================================================================
    // Arena
    // ========================================================================

    fn spawn_session(&mut self, kind: StreamKind) {
        let tag = Tag::new(self.next_tag);
        self.next_tag += 1;

        let session = self.factory.create(kind, tag, self.handle.clone());
        session.activate();
        self.sessions.insert(tag, session);

        debug!(tag = %tag, kind = %kind, active = self.sessions.len(), "Acceptor created");
    }

    /// Binds a call to the acceptor `tag` and delivers the call-arrived tick.
    fn bind(&mut self, tag: Tag, call: IncomingCall) {
        let kind = call.kind();

        let Some(session) = self.sessions.get(&tag).cloned() else {
            warn!(tag = %tag, kind = %kind, "Acceptor vanished, requeueing call");
            self.backlog.entry(kind).or_default().push_front(call);
            return;
        };

        match session.bind(call) {
            Ok(()) => {
                debug!(tag = %tag, kind = %kind, "Call bound");
                self.tick(tag, true);
            }
            Err(call) => {
                warn!(tag = %tag, expected = %session.kind(), got = %kind, "Call routed to wrong acceptor");
                self.backlog.entry(kind).or_default().push_front(call);
            }
        }
    }

    fn retire(&mut self, tag: Tag) {
        if let Some(session) = self.sessions.remove(&tag) {
            debug!(
                tag = %tag,
                kind = %session.kind(),
                active = self.sessions.len(),
                "Session disposed"
            );
        }
    }

    /// Number of live sessions, acceptors included.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};

    use park_core::{PlateReadRequest, SpaceId, SpaceState, SpaceStatus};
    use park_protocol::PlateReaderMessage;

    use crate::session::{DuplexHooks, DuplexSession, StatusSession, StreamSink, WriteHooks, WriteSession};
    use crate::subscribers::SubscriberRegistry;

    #[derive(Default)]
    struct TestFactory {
        statuses: Arc<SubscriberRegistry<SpaceStatus, StatusSession>>,
    }

    impl SessionFactory for TestFactory {
        fn create(&self, kind: StreamKind, tag: Tag, reactor: ReactorHandle) -> SessionHandle {
            match kind {
                StreamKind::Snapshot => {
                    SessionHandle::Snapshot(WriteSession::new(tag, kind, reactor, WriteHooks::new()))
                }
                StreamKind::SpaceStatus => SessionHandle::SpaceStatus(WriteSession::new(
                    tag,
                    kind,
                    reactor,
                    WriteHooks::new().registry(Arc::clone(&self.statuses)),
                )),
                StreamKind::Reservation => {
                    SessionHandle::Reservation(WriteSession::new(tag, kind, reactor, WriteHooks::new()))
                }
                StreamKind::PlateReader => SessionHandle::PlateReader(DuplexSession::new(
                    tag,
                    kind,
                    reactor,
                    DuplexHooks::<PlateReaderMessage, PlateReadRequest>::new(|_, _| {}),
                )),
            }
        }
    }

    /// Sink that completes every operation immediately.
    struct AutoSink {
        reactor: ReactorHandle,
        written: Mutex<Vec<SpaceId>>,
        finished: AtomicBool,
        cancelled: AtomicBool,
        tag: Mutex<Option<Tag>>,
    }

    impl AutoSink {
        fn new(reactor: ReactorHandle) -> Arc<Self> {
            Arc::new(Self {
                reactor,
                written: Mutex::new(Vec::new()),
                finished: AtomicBool::new(false),
                cancelled: AtomicBool::new(false),
                tag: Mutex::new(None),
            })
        }
    }

    impl StreamSink<SpaceStatus> for AutoSink {
        fn start_write(&self, tag: Tag, message: SpaceStatus) {
            self.written.lock().unwrap().push(message.space_id);
            self.reactor.complete(tag, true);
        }

        fn start_finish(&self, tag: Tag) {
            self.finished.store(true, Ordering::SeqCst);
            self.reactor.complete(tag, true);
        }

        fn is_cancelled(&self) -> bool {
            self.cancelled.load(Ordering::SeqCst)
        }

        fn notify_when_done(&self, tag: Tag) {
            *self.tag.lock().unwrap() = Some(tag);
        }
    }

    fn actor() -> (ReactorActor, Arc<SubscriberRegistry<SpaceStatus, StatusSession>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let factory = TestFactory::default();
        let statuses = Arc::clone(&factory.statuses);
        let actor = ReactorActor::new(rx, ReactorHandle::new(tx), Box::new(factory));
        (actor, statuses)
    }

    /// Processes queued commands until the channel is empty.
    fn settle(actor: &mut ReactorActor) {
        while let Ok(command) = actor.receiver.try_recv() {
            actor.handle_command(command);
        }
    }

    fn status(id: i64) -> SpaceStatus {
        SpaceStatus::new(SpaceId::new(id), "A", SpaceState::Free)
    }

    #[test]
    fn test_start_creates_one_waiting_acceptor_per_endpoint() {
        let (mut actor, _) = actor();
        actor.start();
        settle(&mut actor);

        assert_eq!(actor.session_count(), StreamKind::ALL.len());
        for kind in StreamKind::ALL {
            assert!(actor.waiting.contains_key(&kind), "no acceptor for {kind}");
        }
    }

    #[test]
    fn test_call_binds_and_replaces_acceptor() {
        let (mut actor, statuses) = actor();
        actor.start();
        settle(&mut actor);

        let sink = AutoSink::new(actor.handle.clone());
        actor.handle_command(ReactorCommand::Incoming(IncomingCall::SubscribeToParkingStates(
            sink.clone(),
        )));
        settle(&mut actor);

        assert_eq!(statuses.len(), 1);
        assert_eq!(actor.session_count(), StreamKind::ALL.len() + 1);
        assert!(actor.waiting.contains_key(&StreamKind::SpaceStatus));

        statuses.fan_out(&status(1));
        statuses.fan_out(&status(2));
        settle(&mut actor);
        assert_eq!(
            *sink.written.lock().unwrap(),
            vec![SpaceId::new(1), SpaceId::new(2)]
        );
    }

    #[test]
    fn test_calls_before_acceptors_are_backlogged() {
        let (mut actor, statuses) = actor();

        let first = AutoSink::new(actor.handle.clone());
        let second = AutoSink::new(actor.handle.clone());
        actor.handle_command(ReactorCommand::Incoming(IncomingCall::SubscribeToParkingStates(first)));
        actor.handle_command(ReactorCommand::Incoming(IncomingCall::SubscribeToParkingStates(second)));
        assert_eq!(actor.backlog[&StreamKind::SpaceStatus].len(), 2);

        actor.start();
        settle(&mut actor);

        assert_eq!(statuses.len(), 2);
        assert!(actor.backlog[&StreamKind::SpaceStatus].is_empty());
    }

    #[test]
    fn test_finished_stream_is_disposed() {
        let (mut actor, statuses) = actor();
        actor.start();
        settle(&mut actor);

        let sink = AutoSink::new(actor.handle.clone());
        actor.handle_command(ReactorCommand::Incoming(IncomingCall::SubscribeToParkingStates(
            sink.clone(),
        )));
        settle(&mut actor);
        let live = actor.session_count();

        assert_eq!(statuses.end_streams_for(&status(1)), 1);
        settle(&mut actor);

        assert!(sink.finished.load(Ordering::SeqCst));
        assert_eq!(actor.session_count(), live - 1);
    }

    #[test]
    fn test_done_notice_disposes_idle_cancelled_stream() {
        let (mut actor, _) = actor();
        actor.start();
        settle(&mut actor);

        let sink = AutoSink::new(actor.handle.clone());
        actor.handle_command(ReactorCommand::Incoming(IncomingCall::SubscribeToParkingStates(
            sink.clone(),
        )));
        settle(&mut actor);
        let live = actor.session_count();

        sink.cancelled.store(true, Ordering::SeqCst);
        let tag = sink.tag.lock().unwrap().unwrap();
        actor.handle_command(ReactorCommand::Done { tag });

        assert_eq!(actor.session_count(), live - 1);
    }

    #[test]
    fn test_completion_for_unknown_tag_is_ignored() {
        let (mut actor, _) = actor();
        actor.start();
        settle(&mut actor);

        actor.handle_command(ReactorCommand::Completion {
            tag: Tag::new(999),
            ok: true,
        });
        actor.handle_command(ReactorCommand::Done { tag: Tag::new(999) });
        assert_eq!(actor.session_count(), StreamKind::ALL.len());
    }
}
