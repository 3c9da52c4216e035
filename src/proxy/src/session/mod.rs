pub mod pipeline;
pub mod registry;
pub mod retention;
pub mod variables;

use crate::buffer::Buffer;
use crate::protocol::mysql::error_codes::ErrorKind;
use crate::protocol::mysql::hint::HintScanner;
use crate::protocol::mysql::packet::writers;
use crate::protocol::mysql::scanner::{is_pure_proxy_set, scan_set_variables};
use crate::router::trx::TrxState;
use crate::session::pipeline::{
    Filter, FilterAction, FilterSession, Reply, ReplyAction, Router, RouterSession,
    RoutingCapabilities, SessionCtx,
};
use crate::session::registry::SessionRegistry;
use crate::session::retention::{DumpStatements, StatementRetention};
use crate::session::variables::SessionVariables;
use crate::worker::{CallAction, Callable, Worker, WorkerId};

use mysql_common::constants::{CapabilityFlags, StatusFlags};
use parking_lot::RwLock;
use std::cell::RefCell;
use std::os::fd::RawFd;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicI32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use strum_macros::AsRefStr;
use tracing::{debug, warn};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

pub fn next_session_id() -> u64 {
    NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, AsRefStr)]
#[repr(u8)]
pub enum SessionState {
    /// created but not started
    Created = 0,
    /// fully functional
    Started = 1,
    /// session and router are being closed
    Stopping = 2,
    /// creation failed
    Failed = 3,
    /// freed, only for completeness sake
    Free = 4,
}

impl SessionState {
    fn from_u8(v: u8) -> SessionState {
        match v {
            1 => SessionState::Started,
            2 => SessionState::Stopping,
            3 => SessionState::Failed,
            4 => SessionState::Free,
            _ => SessionState::Created,
        }
    }
}

/// Specific reasons why a session was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum CloseReason {
    #[default]
    None = 0,
    Timeout = 1,
    HandleErrorFailed = 2,
    RoutingFailed = 3,
    Killed = 4,
    TooManyConnections = 5,
}

impl CloseReason {
    fn from_u8(v: u8) -> CloseReason {
        match v {
            1 => CloseReason::Timeout,
            2 => CloseReason::HandleErrorFailed,
            3 => CloseReason::RoutingFailed,
            4 => CloseReason::Killed,
            5 => CloseReason::TooManyConnections,
            _ => CloseReason::None,
        }
    }

    pub fn phrase(&self) -> &'static str {
        match self {
            CloseReason::None => "",
            CloseReason::Timeout => "Timed out by the proxy",
            CloseReason::HandleErrorFailed => "Router could not recover from connection errors",
            CloseReason::RoutingFailed => "Routing the query failed",
            CloseReason::Killed => "Killed by another connection",
            CloseReason::TooManyConnections => "Too many connections",
        }
    }
}

/// The cross-thread summary of one session. This is what the global
/// registry indexes and what admin surfaces read; the rich session object
/// never leaves its worker thread.
pub struct SessionShared {
    id: u64,
    user: RwLock<String>,
    host: String,
    service: String,
    worker: AtomicI32,
    state: AtomicU8,
    refs: AtomicI32,
    close_reason: AtomicU8,
    trx_state: AtomicU8,
}

impl SessionShared {
    pub fn new(id: u64, user: &str, host: &str, service: &str) -> Self {
        SessionShared {
            id,
            user: RwLock::new(user.to_string()),
            host: host.to_string(),
            service: service.to_string(),
            worker: AtomicI32::new(-1),
            state: AtomicU8::new(SessionState::Created as u8),
            refs: AtomicI32::new(1),
            close_reason: AtomicU8::new(CloseReason::None as u8),
            trx_state: AtomicU8::new(0),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn user(&self) -> String {
        self.user.read().clone()
    }

    pub fn set_user(&self, user: &str) {
        *self.user.write() = user.to_string();
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn worker(&self) -> WorkerId {
        self.worker.load(Ordering::Relaxed)
    }

    pub fn set_worker(&self, worker: WorkerId) {
        self.worker.store(worker, Ordering::Relaxed);
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: SessionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// The first caller wins; concurrent close requests are idempotent.
    pub fn transition_to_stopping(&self) -> bool {
        loop {
            let current = self.state.load(Ordering::Acquire);
            if current == SessionState::Stopping as u8 || current == SessionState::Free as u8 {
                return false;
            }
            if self
                .state
                .compare_exchange(
                    current,
                    SessionState::Stopping as u8,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                return true;
            }
        }
    }

    /// Take a reference. Refuses once the session is stopping or freed.
    pub fn get_ref(&self) -> bool {
        self.refs.fetch_add(1, Ordering::AcqRel);
        let state = self.state();
        if state == SessionState::Stopping || state == SessionState::Free {
            self.refs.fetch_sub(1, Ordering::AcqRel);
            return false;
        }
        true
    }

    /// Drop a reference; returns the remaining count.
    pub fn put_ref(&self) -> i32 {
        let remaining = self.refs.fetch_sub(1, Ordering::AcqRel) - 1;
        debug_assert!(remaining >= 0);
        remaining
    }

    pub fn refs(&self) -> i32 {
        self.refs.load(Ordering::Acquire)
    }

    pub fn close_reason(&self) -> CloseReason {
        CloseReason::from_u8(self.close_reason.load(Ordering::Relaxed))
    }

    pub fn set_close_reason(&self, reason: CloseReason) {
        self.close_reason.store(reason as u8, Ordering::Relaxed);
    }

    pub fn publish_trx_state(&self, trx: TrxState) {
        self.trx_state.store(trx.bits(), Ordering::Relaxed);
    }

    pub fn trx_state(&self) -> TrxState {
        TrxState::from_bits_truncate(self.trx_state.load(Ordering::Relaxed))
    }
}

/// Protocol-owned per-session data: what the client negotiated and where
/// it currently points.
#[derive(Debug, Clone)]
pub struct ProtocolData {
    pub current_db: String,
    pub capabilities: CapabilityFlags,
    pub autocommit: bool,
    pub user: String,
    pub scramble: [u8; 20],
    /// the auth token the client produced, reused toward backends
    pub auth_token: Vec<u8>,
    pub server_status: StatusFlags,
}

impl Default for ProtocolData {
    fn default() -> Self {
        ProtocolData {
            current_db: String::new(),
            capabilities: CapabilityFlags::empty(),
            autocommit: true,
            user: String::new(),
            scramble: [0; 20],
            auth_token: Vec::new(),
            server_status: StatusFlags::SERVER_STATUS_AUTOCOMMIT,
        }
    }
}

thread_local! {
    // worker-local id → session index, for kill-by-id and admin tasks
    // posted to the owning worker
    static LOCAL_SESSIONS: RefCell<hashbrown::HashMap<u64, Weak<RefCell<Session>>>> =
        RefCell::new(hashbrown::HashMap::new());
}

/// Find a session owned by the current worker thread.
pub fn local_session(id: u64) -> Option<Rc<RefCell<Session>>> {
    LOCAL_SESSIONS.with(|map| map.borrow().get(&id).and_then(Weak::upgrade))
}

/// Terminate a session from anywhere: the actual kill is posted to the
/// owning worker, which looks the session up in its local index. Returns
/// false when the session is unknown, already stopping, or its worker is
/// gone.
pub fn kill_session_by_id(
    workers: &crate::worker::WorkerRegistry,
    sessions: &SessionRegistry,
    id: u64,
) -> bool {
    let Some(shared) = sessions.get_by_id(id) else {
        return false;
    };
    let Some(handle) = workers.get(shared.worker()) else {
        shared.put_ref();
        return false;
    };
    let posted = handle.execute(
        move |worker| {
            if let Some(session) = local_session(id) {
                let payload = writers::err_packet(
                    crate::protocol::mysql::error_codes::ErrorKind::ErrConnectionKilled,
                    CloseReason::Killed.phrase().as_bytes(),
                );
                session
                    .borrow_mut()
                    .kill(worker, Some(payload), CloseReason::Killed);
                flush_session_to_client(worker, &session);
            }
        },
        None,
        crate::worker::ExecuteMode::Queued,
    );
    shared.put_ref();
    posted
}

/// Deliver a session's queued client frames through its client DCB. Used
/// from timer and cross-thread contexts, where no DCB handler is on the
/// stack to pick the backlog up.
pub fn flush_session_to_client(worker: &mut Worker, session: &Rc<RefCell<Session>>) {
    let (backlog, sink) = {
        let mut session = session.borrow_mut();
        (session.take_client_backlog(), session.client_sink())
    };
    if backlog.is_empty() {
        return;
    }
    if let Some(client) = sink.and_then(|weak| weak.upgrade()) {
        client.borrow_mut().send_frames(worker, backlog);
    }
}

/// One client connection: its lifecycle state, its protocol data and the
/// filter→router chain every request and reply traverses.
pub struct Session {
    shared: Arc<SessionShared>,
    registry: Arc<SessionRegistry>,
    protocol: ProtocolData,
    filters: Vec<Box<dyn FilterSession>>,
    router_session: Option<Box<dyn RouterSession>>,
    capabilities: RoutingCapabilities,
    variables: SessionVariables,
    retention: StatementRetention,
    dump_statements: DumpStatements,
    hint_scanner: HintScanner,
    callable: Callable,
    weak_self: Weak<RefCell<Session>>,
    client_sink: Option<Weak<RefCell<crate::server::dcb::ClientDcb>>>,
    client_backlog: Vec<Vec<u8>>,
    delayed_retry_active: bool,
    errored: bool,
}

impl Session {
    pub fn create(
        registry: Arc<SessionRegistry>,
        shared: Arc<SessionShared>,
        protocol: ProtocolData,
        retain_last_statements: usize,
        dump_statements: DumpStatements,
    ) -> Rc<RefCell<Session>> {
        let session = Rc::new(RefCell::new(Session {
            shared: Arc::clone(&shared),
            registry: Arc::clone(&registry),
            protocol,
            filters: Vec::new(),
            router_session: None,
            capabilities: RoutingCapabilities::empty(),
            variables: SessionVariables::new(),
            retention: StatementRetention::new(retain_last_statements, retain_last_statements * 4),
            dump_statements,
            hint_scanner: HintScanner::new(),
            callable: Callable::new(),
            weak_self: Weak::new(),
            client_sink: None,
            client_backlog: Vec::new(),
            delayed_retry_active: false,
            errored: false,
        }));
        session.borrow_mut().weak_self = Rc::downgrade(&session);
        registry.register(shared);
        LOCAL_SESSIONS.with(|map| {
            map.borrow_mut()
                .insert(session.borrow().id(), Rc::downgrade(&session))
        });
        session
    }

    pub fn id(&self) -> u64 {
        self.shared.id()
    }

    pub fn shared(&self) -> &Arc<SessionShared> {
        &self.shared
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    pub fn protocol(&self) -> &ProtocolData {
        &self.protocol
    }

    pub fn protocol_mut(&mut self) -> &mut ProtocolData {
        &mut self.protocol
    }

    pub fn variables_mut(&mut self) -> &mut SessionVariables {
        &mut self.variables
    }

    pub fn callable(&self) -> Callable {
        self.callable
    }

    pub fn capabilities(&self) -> RoutingCapabilities {
        self.capabilities
    }

    pub fn set_client_sink(&mut self, sink: Weak<RefCell<crate::server::dcb::ClientDcb>>) {
        self.client_sink = Some(sink);
    }

    pub fn client_sink(&self) -> Option<Weak<RefCell<crate::server::dcb::ClientDcb>>> {
        self.client_sink.clone()
    }

    /// Wire the filter→router chain and move to STARTED. The chain cannot
    /// be reconfigured afterwards. Returns false if any component refuses,
    /// leaving the partially built chain for the caller to tear down.
    pub fn start(
        &mut self,
        worker: &mut Worker,
        filters: &[Arc<dyn Filter>],
        router: &Arc<dyn Router>,
    ) -> bool {
        debug_assert_eq!(self.state(), SessionState::Created);

        let mut capabilities = router.capabilities();
        for filter in filters {
            capabilities |= filter.capabilities();
            match filter.new_session() {
                Some(session) => self.filters.push(session),
                None => {
                    warn!(
                        "Filter {} refused session {}",
                        filter.name(),
                        self.shared.id()
                    );
                    self.shared.set_state(SessionState::Failed);
                    return false;
                }
            }
        }
        self.capabilities = capabilities;

        let router_session = {
            let mut ctx = SessionCtx {
                worker,
                shared: &self.shared,
                protocol: &mut self.protocol,
                client_backlog: &mut self.client_backlog,
                session_ref: &self.weak_self,
                trx_tracking: capabilities.contains(RoutingCapabilities::TRANSACTION_TRACKING),
            };
            router.new_session(&mut ctx)
        };
        match router_session {
            Some(session) => {
                self.router_session = Some(session);
                self.shared.set_state(SessionState::Started);
                self.shared.set_worker(worker.id());
                true
            }
            None => {
                warn!(
                    "Router {} refused session {}",
                    router.name(),
                    self.shared.id()
                );
                self.shared.set_state(SessionState::Failed);
                false
            }
        }
    }

    /// Frames queued for the client; the caller owns delivering them.
    pub fn take_client_backlog(&mut self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.client_backlog)
    }

    pub fn has_client_backlog(&self) -> bool {
        !self.client_backlog.is_empty()
    }

    /// Route one complete request packet through the chain. Returns false
    /// when a stage failed (the stage has arranged any client response).
    pub fn route_query(&mut self, worker: &mut Worker, buffer: Buffer) -> bool {
        self.delayed_retry_active = false;
        self.route_query_inner(worker, buffer)
    }

    fn route_query_inner(&mut self, worker: &mut Worker, mut buffer: Buffer) -> bool {
        if self.state() != SessionState::Started {
            return false;
        }

        // Protocol-side interception: hints and proxy variables live in
        // the SQL text and never reach a backend on their own.
        if let Some(sql) = buffer.sql().map(|s| s.into_owned()) {
            self.retention.record_statement(&sql);
            let hints = self.hint_scanner.scan(&sql);
            if !hints.is_empty() {
                buffer.set_hints(hints);
            }

            let assignments = scan_set_variables(&sql);
            if !assignments.is_empty() {
                let mut failure: Option<String> = None;
                for assignment in &assignments {
                    if let Err(e) = self.variables.set(&assignment.name, &assignment.value) {
                        failure.get_or_insert(e);
                    }
                }
                if is_pure_proxy_set(&sql, assignments.len()) {
                    let seq = buffer.wire()[3].wrapping_add(1);
                    let payload = match failure {
                        None => writers::ok_packet(self.protocol.server_status),
                        Some(msg) => writers::err_packet(ErrorKind::ErrSyntax, msg.as_bytes()),
                    };
                    self.push_client_payload(seq, &payload);
                    return true;
                }
            }
        } else if buffer.command().is_some() {
            self.retention.record_event(format!(
                "cmd 0x{:02x}",
                buffer.command().unwrap_or(0xff)
            ));
        }

        let Session {
            filters,
            router_session,
            protocol,
            client_backlog,
            shared,
            capabilities,
            errored,
            weak_self,
            ..
        } = self;
        let mut ctx = SessionCtx {
            worker,
            shared,
            protocol,
            client_backlog,
            session_ref: weak_self,
            trx_tracking: capabilities.contains(RoutingCapabilities::TRANSACTION_TRACKING),
        };

        let mut respond: Option<(usize, Reply)> = None;
        let mut current = buffer;
        for (i, filter) in filters.iter_mut().enumerate() {
            match filter.route_query(&mut ctx, current.clone()) {
                FilterAction::Forward(buf) => current = buf,
                FilterAction::Respond(reply) => {
                    respond = Some((i, reply));
                    break;
                }
                FilterAction::Consume => return true,
                FilterAction::Fail => {
                    *errored = true;
                    return false;
                }
            }
        }

        match respond {
            Some((from, reply)) => {
                // deliver the synthesized reply up from the filter that
                // produced it
                let mut reply = reply;
                for filter in filters[..from].iter_mut().rev() {
                    match filter.route_reply(&mut ctx, reply) {
                        ReplyAction::Forward(r) => reply = r,
                        ReplyAction::Discard => return true,
                        ReplyAction::Fail => {
                            *errored = true;
                            return false;
                        }
                    }
                }
                ctx.send_reply_to_client(&reply);
                true
            }
            None => match router_session.as_mut() {
                Some(router) => {
                    let ok = router.route_query(&mut ctx, current);
                    if !ok {
                        *errored = true;
                    }
                    ok
                }
                None => false,
            },
        }
    }

    /// Feed frames read from one of the router's backends through the
    /// upstream half of the chain.
    pub fn backend_data(
        &mut self,
        worker: &mut Worker,
        backend_fd: RawFd,
        frames: Vec<Vec<u8>>,
    ) -> bool {
        let Session {
            filters,
            router_session,
            protocol,
            client_backlog,
            shared,
            capabilities,
            errored,
            weak_self,
            ..
        } = self;
        let mut ctx = SessionCtx {
            worker,
            shared,
            protocol,
            client_backlog,
            session_ref: weak_self,
            trx_tracking: capabilities.contains(RoutingCapabilities::TRANSACTION_TRACKING),
        };

        let Some(router) = router_session.as_mut() else {
            return false;
        };
        let Some(mut reply) = router.handle_backend_data(&mut ctx, backend_fd, frames) else {
            return true;
        };

        for filter in filters.iter_mut().rev() {
            match filter.route_reply(&mut ctx, reply) {
                ReplyAction::Forward(r) => reply = r,
                ReplyAction::Discard => return true,
                ReplyAction::Fail => {
                    *errored = true;
                    return false;
                }
            }
        }
        ctx.send_reply_to_client(&reply);
        true
    }

    /// Let the router deal with a backend error; translate its verdict
    /// into a session close when it cannot recover.
    pub fn backend_error(
        &mut self,
        worker: &mut Worker,
        backend_fd: RawFd,
        error: &std::io::Error,
    ) -> pipeline::ErrorAction {
        let Session {
            filters: _,
            router_session,
            protocol,
            client_backlog,
            shared,
            capabilities,
            weak_self,
            ..
        } = self;
        let mut ctx = SessionCtx {
            worker,
            shared,
            protocol,
            client_backlog,
            session_ref: weak_self,
            trx_tracking: capabilities.contains(RoutingCapabilities::TRANSACTION_TRACKING),
        };
        match router_session.as_mut() {
            Some(router) => router.handle_backend_error(&mut ctx, backend_fd, error),
            None => pipeline::ErrorAction::CloseSession,
        }
    }

    /// Re-enqueue `buffer` through a worker timer, at most once per
    /// statement. Used by routers to retry transient backend failures.
    pub fn delay_routing(&mut self, worker: &mut Worker, buffer: Buffer, delay: Duration) -> bool {
        if self.delayed_retry_active {
            return false;
        }
        self.delayed_retry_active = true;

        let weak = self.weak_self.clone();
        let mut slot = Some(buffer);
        worker.delayed_call(self.callable, delay, move |action, worker| {
            if action == CallAction::Execute {
                if let (Some(buffer), Some(session)) = (slot.take(), weak.upgrade()) {
                    session.borrow_mut().route_query_inner(worker, buffer);
                    flush_session_to_client(worker, &session);
                }
            }
            false
        });
        true
    }

    fn push_client_payload(&mut self, seq: u8, payload: &[u8]) {
        let mut queue = crate::protocol::mysql::packet::write_queue::WriteQueue::new();
        queue.set_seq(seq);
        queue.push_payload(payload);
        let mut sink = Vec::new();
        let _ = queue.drain(&mut sink);
        self.client_backlog.push(sink);
    }

    /// Abrupt termination: optionally queue an error for the client, then
    /// transition to STOPPING and release what the session holds. The
    /// first caller wins; later calls are no-ops.
    pub fn kill(&mut self, worker: &mut Worker, error_payload: Option<Vec<u8>>, reason: CloseReason) {
        if !self.shared.transition_to_stopping() {
            return;
        }
        debug!("Session {} stopping: {:?}", self.id(), reason);
        self.shared.set_close_reason(reason);

        if let Some(payload) = error_payload {
            self.push_client_payload(0, &payload);
        }

        if StatementRetention::should_dump(
            self.dump_statements,
            self.errored || reason != CloseReason::None,
        ) {
            self.retention.dump(self.id());
        }

        let Session {
            filters: _,
            router_session,
            protocol,
            client_backlog,
            shared,
            capabilities,
            weak_self,
            ..
        } = self;
        if let Some(router) = router_session.as_mut() {
            let mut ctx = SessionCtx {
                worker,
                shared,
                protocol,
                client_backlog,
                session_ref: weak_self,
                trx_tracking: capabilities.contains(RoutingCapabilities::TRANSACTION_TRACKING),
            };
            router.close(&mut ctx);
        }
        self.router_session = None;

        // Destructor-time cleanup must not call back into this session.
        worker.cancel_dcalls(self.callable, false);

        LOCAL_SESSIONS.with(|map| {
            map.borrow_mut().remove(&self.id());
        });
        self.registry.deregister(self.id());
        self.shared.put_ref();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::pipeline::{ErrorAction, FilterAction, ReplyAction};
    use crate::worker::DEFAULT_MAX_EVENTS;
    use std::sync::Mutex;

    struct TagFilter {
        tag: &'static str,
        log: Arc<Mutex<Vec<String>>>,
        respond: bool,
    }

    impl Filter for TagFilter {
        fn name(&self) -> &str {
            self.tag
        }
        fn capabilities(&self) -> RoutingCapabilities {
            RoutingCapabilities::empty()
        }
        fn new_session(&self) -> Option<Box<dyn FilterSession>> {
            Some(Box::new(TagFilterSession {
                tag: self.tag,
                log: Arc::clone(&self.log),
                respond: self.respond,
            }))
        }
    }

    struct TagFilterSession {
        tag: &'static str,
        log: Arc<Mutex<Vec<String>>>,
        respond: bool,
    }

    impl FilterSession for TagFilterSession {
        fn route_query(&mut self, _ctx: &mut SessionCtx<'_>, buffer: Buffer) -> FilterAction {
            self.log.lock().unwrap().push(format!("{}:down", self.tag));
            if self.respond {
                FilterAction::Respond(Reply {
                    frames: vec![vec![7, 0, 0, 1, 0, 0, 0, 2, 0, 0, 0]],
                    is_complete: true,
                    ..Default::default()
                })
            } else {
                FilterAction::Forward(buffer)
            }
        }

        fn route_reply(&mut self, _ctx: &mut SessionCtx<'_>, reply: Reply) -> ReplyAction {
            self.log.lock().unwrap().push(format!("{}:up", self.tag));
            ReplyAction::Forward(reply)
        }
    }

    struct RecordingRouter {
        log: Arc<Mutex<Vec<String>>>,
    }

    impl Router for RecordingRouter {
        fn name(&self) -> &str {
            "recording"
        }
        fn capabilities(&self) -> RoutingCapabilities {
            RoutingCapabilities::TRANSACTION_TRACKING
        }
        fn new_session(&self, _ctx: &mut SessionCtx<'_>) -> Option<Box<dyn RouterSession>> {
            Some(Box::new(RecordingRouterSession {
                log: Arc::clone(&self.log),
            }))
        }
    }

    struct RecordingRouterSession {
        log: Arc<Mutex<Vec<String>>>,
    }

    impl RouterSession for RecordingRouterSession {
        fn route_query(&mut self, _ctx: &mut SessionCtx<'_>, buffer: Buffer) -> bool {
            let hints = buffer.hints().len();
            self.log
                .lock()
                .unwrap()
                .push(format!("router:{} hints={hints}", buffer.sql().unwrap_or_default()));
            true
        }

        fn handle_backend_data(
            &mut self,
            _ctx: &mut SessionCtx<'_>,
            _backend_fd: RawFd,
            frames: Vec<Vec<u8>>,
        ) -> Option<Reply> {
            Some(Reply {
                frames,
                is_complete: true,
                ..Default::default()
            })
        }

        fn handle_backend_error(
            &mut self,
            _ctx: &mut SessionCtx<'_>,
            _backend_fd: RawFd,
            _error: &std::io::Error,
        ) -> ErrorAction {
            ErrorAction::CloseSession
        }

        fn close(&mut self, _ctx: &mut SessionCtx<'_>) {}
    }

    fn test_session(
        filters: Vec<Arc<dyn Filter>>,
        log: Arc<Mutex<Vec<String>>>,
    ) -> (Worker, Rc<RefCell<Session>>) {
        let mut worker = Worker::new(DEFAULT_MAX_EVENTS).unwrap();
        let registry = Arc::new(SessionRegistry::new());
        let shared = Arc::new(SessionShared::new(
            next_session_id(),
            "app",
            "localhost",
            "test",
        ));
        let session = Session::create(
            registry,
            shared,
            ProtocolData::default(),
            4,
            DumpStatements::Never,
        );
        let router: Arc<dyn Router> = Arc::new(RecordingRouter { log });
        assert!(session.borrow_mut().start(&mut worker, &filters, &router));
        (worker, session)
    }

    #[test]
    fn chain_runs_filters_then_router() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let filters: Vec<Arc<dyn Filter>> = vec![
            Arc::new(TagFilter {
                tag: "f1",
                log: Arc::clone(&log),
                respond: false,
            }),
            Arc::new(TagFilter {
                tag: "f2",
                log: Arc::clone(&log),
                respond: false,
            }),
        ];
        let (mut worker, session) = test_session(filters, Arc::clone(&log));

        assert!(session
            .borrow_mut()
            .route_query(&mut worker, Buffer::com_query("SELECT 1")));
        let seen = log.lock().unwrap().clone();
        assert_eq!(
            seen,
            vec![
                "f1:down".to_string(),
                "f2:down".to_string(),
                "router:SELECT 1 hints=0".to_string()
            ]
        );
    }

    #[test]
    fn respond_short_circuits_and_travels_back_up() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let filters: Vec<Arc<dyn Filter>> = vec![
            Arc::new(TagFilter {
                tag: "f1",
                log: Arc::clone(&log),
                respond: false,
            }),
            Arc::new(TagFilter {
                tag: "f2",
                log: Arc::clone(&log),
                respond: true,
            }),
        ];
        let (mut worker, session) = test_session(filters, Arc::clone(&log));

        assert!(session
            .borrow_mut()
            .route_query(&mut worker, Buffer::com_query("SELECT 1")));
        let seen = log.lock().unwrap().clone();
        // the router never runs; the reply passes f1 on the way up
        assert_eq!(
            seen,
            vec![
                "f1:down".to_string(),
                "f2:down".to_string(),
                "f1:up".to_string()
            ]
        );
        assert!(session.borrow().has_client_backlog());
    }

    #[test]
    fn hints_reach_the_router() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let (mut worker, session) = test_session(Vec::new(), Arc::clone(&log));

        session.borrow_mut().route_query(
            &mut worker,
            Buffer::com_query("SELECT 1 -- maxscale route to master"),
        );
        let seen = log.lock().unwrap().clone();
        assert_eq!(seen.len(), 1);
        assert!(seen[0].ends_with("hints=1"), "got {seen:?}");
    }

    #[test]
    fn pure_proxy_set_is_answered_locally() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let (mut worker, session) = test_session(Vec::new(), Arc::clone(&log));

        session
            .borrow_mut()
            .variables_mut()
            .add("@maxscale.trace", std::rc::Rc::new(|_, _| Ok(())));

        assert!(session.borrow_mut().route_query(
            &mut worker,
            Buffer::com_query("SET @maxscale.trace = 'on'")
        ));
        // answered by the proxy, never routed
        assert!(log.lock().unwrap().is_empty());
        let frames = session.borrow_mut().take_client_backlog();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0][4], 0x00, "expected an OK packet");
    }

    #[test]
    fn failed_proxy_set_returns_error_packet() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let (mut worker, session) = test_session(Vec::new(), Arc::clone(&log));

        assert!(session.borrow_mut().route_query(
            &mut worker,
            Buffer::com_query("SET @maxscale.unknown = 1")
        ));
        let frames = session.borrow_mut().take_client_backlog();
        assert_eq!(frames[0][4], 0xff, "expected an ERR packet");
    }

    #[test]
    fn backend_data_flows_up_through_filters() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let filters: Vec<Arc<dyn Filter>> = vec![Arc::new(TagFilter {
            tag: "f1",
            log: Arc::clone(&log),
            respond: false,
        })];
        let (mut worker, session) = test_session(filters, Arc::clone(&log));

        let ok_frame = vec![7, 0, 0, 1, 0, 0, 0, 2, 0, 0, 0];
        assert!(session
            .borrow_mut()
            .backend_data(&mut worker, 42, vec![ok_frame.clone()]));
        let seen = log.lock().unwrap().clone();
        assert_eq!(seen, vec!["f1:up".to_string()]);
        let frames = session.borrow_mut().take_client_backlog();
        assert_eq!(frames, vec![ok_frame]);
    }

    #[test]
    fn kill_is_idempotent_and_dumps_nothing_by_default() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let (mut worker, session) = test_session(Vec::new(), Arc::clone(&log));

        session
            .borrow_mut()
            .kill(&mut worker, None, CloseReason::Killed);
        assert_eq!(session.borrow().state(), SessionState::Stopping);
        assert_eq!(session.borrow().shared().close_reason(), CloseReason::Killed);

        // a second kill must not run teardown twice
        session
            .borrow_mut()
            .kill(&mut worker, None, CloseReason::Timeout);
        assert_eq!(session.borrow().shared().close_reason(), CloseReason::Killed);

        // a stopped session routes nothing
        assert!(!session
            .borrow_mut()
            .route_query(&mut worker, Buffer::com_query("SELECT 1")));
    }

    #[test]
    fn shared_refcounting_respects_stopping() {
        let shared = SessionShared::new(77, "app", "h", "svc");
        shared.set_state(SessionState::Started);
        assert!(shared.get_ref());
        assert_eq!(shared.refs(), 2);

        assert!(shared.transition_to_stopping());
        assert!(!shared.transition_to_stopping());
        assert!(!shared.get_ref());
        assert_eq!(shared.put_ref(), 1);
    }

    #[test]
    fn close_reason_phrases() {
        assert_eq!(
            CloseReason::TooManyConnections.phrase(),
            "Too many connections"
        );
        assert_eq!(CloseReason::None.phrase(), "");
    }

    #[test]
    fn state_round_trip() {
        let shared = SessionShared::new(1, "u", "h", "s");
        assert_eq!(shared.state(), SessionState::Created);
        shared.set_state(SessionState::Started);
        assert_eq!(shared.state(), SessionState::Started);
    }
}
