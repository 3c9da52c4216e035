//! Descriptor control blocks: the pollable wrappers around the client and
//! backend sockets. A DCB owns exactly one fd, an inbound frame
//! accumulator and an outbound write queue; everything protocol-shaped
//! beyond framing lives in the session and the router.

use crate::buffer::Buffer;
use crate::backend::Backend;
use crate::protocol::mysql::basic::{client_handshake_response, server_handshake};
use crate::protocol::mysql::constants::{AuthPluginName, CommandCode, SCRAMBLE_SIZE};
use crate::protocol::mysql::error_codes::ErrorKind;
use crate::protocol::mysql::packet::accumulator::{PacketAccumulator, ReadOutcome};
use crate::protocol::mysql::packet::write_queue::WriteQueue;
use crate::protocol::mysql::packet::writers;
use crate::server::auth::native::native_password_token;
use crate::server::auth::{AuthResult, Exchange};
use crate::server::service::Service;
use crate::server::{default_capabilities, DEFAULT_SERVER_VERSION};
use crate::session::{CloseReason, Session, SessionState};
use crate::worker::{
    PollActions, PollContext, PollEvents, Pollable, PollableKind, Worker, WorkerId,
};

use common::metrics::metric_def::PROXY_CURR_CONN;
use common::metrics::{common_labels, gauge_dec, gauge_inc};
use mysql_common::constants::CapabilityFlags;
use std::cell::RefCell;
use std::io::Write;
use std::os::fd::{AsRawFd, RawFd};
use std::rc::{Rc, Weak};
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DcbRole {
    Client,
    Backend,
    Listener,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClientPhase {
    AwaitHandshakeResponse,
    AuthSwitchSent,
    Command,
    Closed,
}

/// The client side of one session.
pub struct ClientDcb {
    stream: mio::net::TcpStream,
    fd: RawFd,
    accumulator: PacketAccumulator,
    write_queue: WriteQueue,
    polling_worker: Option<WorkerId>,
    session: Rc<RefCell<Session>>,
    service: Arc<Service>,
    phase: ClientPhase,
    scramble: [u8; SCRAMBLE_SIZE],
    want_out: bool,
}

impl ClientDcb {
    /// Wrap an accepted socket: queues the initial handshake and waits for
    /// the client's response.
    pub fn new(
        stream: mio::net::TcpStream,
        session: Rc<RefCell<Session>>,
        service: Arc<Service>,
        scramble: [u8; SCRAMBLE_SIZE],
    ) -> Rc<RefCell<ClientDcb>> {
        let fd = stream.as_raw_fd();
        let conn_id = session.borrow().id() as u32;
        let mut dcb = ClientDcb {
            stream,
            fd,
            accumulator: PacketAccumulator::new(),
            write_queue: WriteQueue::new(),
            polling_worker: None,
            session,
            service,
            phase: ClientPhase::AwaitHandshakeResponse,
            scramble,
            want_out: false,
        };
        let handshake = writers::initial_handshake(
            conn_id,
            DEFAULT_SERVER_VERSION,
            &scramble,
            default_capabilities(),
            &AuthPluginName::AuthNativePassword,
        );
        dcb.write_queue.set_seq(0);
        dcb.write_queue.push_payload(&handshake);
        gauge_inc(PROXY_CURR_CONN, 1_f64, Some(common_labels()));
        let dcb = Rc::new(RefCell::new(dcb));
        let weak = Rc::downgrade(&dcb);
        dcb.borrow().session.borrow_mut().set_client_sink(weak);
        dcb
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn role(&self) -> DcbRole {
        DcbRole::Client
    }

    pub fn session(&self) -> &Rc<RefCell<Session>> {
        &self.session
    }

    /// Queue wire frames toward the client and drain opportunistically.
    pub fn send_frames(&mut self, worker: &mut Worker, frames: Vec<Vec<u8>>) {
        if self.phase == ClientPhase::Closed {
            return;
        }
        for frame in frames {
            self.write_queue.push_wire(frame);
        }
        self.drain_out(worker);
    }

    fn drain_out(&mut self, worker: &mut Worker) {
        match self.write_queue.drain(&mut self.stream) {
            Ok(drained) => self.update_interest(worker, !drained),
            Err(e) => {
                debug!("Client fd {} write error: {e}", self.fd);
                self.mark_closed(worker, CloseReason::None, None);
            }
        }
    }

    fn update_interest(&mut self, worker: &mut Worker, want_out: bool) {
        if want_out == self.want_out || self.phase == ClientPhase::Closed {
            return;
        }
        self.want_out = want_out;
        let events = if want_out {
            PollEvents::IN | PollEvents::OUT
        } else {
            PollEvents::IN
        };
        if let Some(pollable) = worker.pollable(self.fd) {
            worker.modify_pollable(events, &pollable);
        }
    }

    /// Flush what can be flushed and kill the session. The caller returns
    /// HUP/ERROR from the poll handler so the worker deregisters the fd.
    fn mark_closed(
        &mut self,
        worker: &mut Worker,
        reason: CloseReason,
        error_payload: Option<Vec<u8>>,
    ) {
        if self.phase == ClientPhase::Closed {
            return;
        }
        self.phase = ClientPhase::Closed;
        self.session.borrow_mut().kill(worker, error_payload, reason);
        let frames = self.session.borrow_mut().take_client_backlog();
        for frame in frames {
            self.write_queue.push_wire(frame);
        }
        let _ = self.write_queue.drain(&mut self.stream);
        let _ = self.stream.flush();
        self.service.connection_closed();
        gauge_dec(PROXY_CURR_CONN, 1_f64, Some(common_labels()));
    }

    fn flush_session_backlog(&mut self, worker: &mut Worker) {
        let frames = self.session.borrow_mut().take_client_backlog();
        if !frames.is_empty() {
            self.send_frames(worker, frames);
        }
    }

    fn handle_auth_frame(&mut self, worker: &mut Worker, wire: Vec<u8>) {
        let seq = wire[3];
        let payload = &wire[4..];

        if self.phase == ClientPhase::AwaitHandshakeResponse {
            let Ok((_, response)) = client_handshake_response(payload) else {
                warn!("Client fd {}: malformed handshake response", self.fd);
                let err = writers::err_packet(ErrorKind::ErrAccessDenied, b"Malformed handshake");
                self.write_queue.set_seq(seq.wrapping_add(1));
                self.write_queue.push_payload(&err);
                self.mark_closed(worker, CloseReason::None, None);
                return;
            };

            {
                let mut session = self.session.borrow_mut();
                let user = response.user_string();
                session.shared().set_user(&user);
                let protocol = session.protocol_mut();
                protocol.user = user;
                protocol.capabilities = response.client_flag;
                protocol.scramble = self.scramble;
                protocol.auth_token = response.auth_response.clone();
                if let Some(db) = response.database_string() {
                    protocol.current_db = db;
                }
            }

            match self.service.authenticator().exchange(
                &response.auth_plugin,
                &response.auth_response,
                &self.scramble,
            ) {
                Exchange::Ready => {
                    self.finish_authentication(worker, seq, &response.auth_response);
                }
                Exchange::SendToClient(packet) => {
                    self.write_queue.set_seq(seq.wrapping_add(1));
                    self.write_queue.push_payload(&packet);
                    self.phase = ClientPhase::AuthSwitchSent;
                }
                Exchange::Error(msg) => {
                    self.reject(worker, seq, &msg);
                }
            }
        } else {
            // AuthSwitchSent: the raw token is the whole payload
            let token = payload.to_vec();
            self.session.borrow_mut().protocol_mut().auth_token = token.clone();
            self.finish_authentication(worker, seq, &token);
        }
    }

    fn finish_authentication(&mut self, worker: &mut Worker, seq: u8, token: &[u8]) {
        let user = self.session.borrow().protocol().user.clone();
        match self
            .service
            .authenticator()
            .authenticate(&user, token, &self.scramble)
        {
            AuthResult::Ok => {
                let started = {
                    let mut session = self.session.borrow_mut();
                    session.start(worker, self.service.filters(), self.service.router())
                };
                if started {
                    let status = self.session.borrow().protocol().server_status;
                    self.write_queue.set_seq(seq.wrapping_add(1));
                    self.write_queue.push_payload(&writers::ok_packet(status));
                    self.phase = ClientPhase::Command;
                    debug!("Client fd {} authenticated as {user}", self.fd);
                } else {
                    let err =
                        writers::err_packet(ErrorKind::ErrNoMasterAvailable, b"Service unavailable");
                    self.write_queue.set_seq(seq.wrapping_add(1));
                    self.write_queue.push_payload(&err);
                    self.mark_closed(worker, CloseReason::RoutingFailed, None);
                }
            }
            AuthResult::Failed(msg) => {
                self.reject(worker, seq, &msg);
            }
        }
    }

    fn reject(&mut self, worker: &mut Worker, seq: u8, msg: &str) {
        warn!("Client fd {} authentication failed: {msg}", self.fd);
        let err = writers::err_packet(ErrorKind::ErrAccessDenied, msg.as_bytes());
        self.write_queue.set_seq(seq.wrapping_add(1));
        self.write_queue.push_payload(&err);
        self.mark_closed(worker, CloseReason::None, None);
    }

    fn handle_command_frame(&mut self, worker: &mut Worker, wire: Vec<u8>) {
        let buffer = Buffer::from_wire(wire);

        if buffer.command() == Some(CommandCode::ComQuit as u8) {
            self.mark_closed(worker, CloseReason::None, None);
            return;
        }

        let routed = self.session.borrow_mut().route_query(worker, buffer);
        if !routed && self.session.borrow().state() != SessionState::Started {
            self.mark_closed(worker, CloseReason::RoutingFailed, None);
        }
    }

    fn process_frames(&mut self, worker: &mut Worker) {
        while let Some(wire) = self.accumulator.next_frame() {
            match self.phase {
                ClientPhase::AwaitHandshakeResponse | ClientPhase::AuthSwitchSent => {
                    self.handle_auth_frame(worker, wire)
                }
                ClientPhase::Command => self.handle_command_frame(worker, wire),
                ClientPhase::Closed => return,
            }
            if self.phase == ClientPhase::Closed {
                return;
            }
        }
        self.flush_session_backlog(worker);
        self.drain_out(worker);
    }
}

impl Pollable for ClientDcb {
    fn poll_fd(&self) -> RawFd {
        self.fd
    }

    fn kind(&self) -> PollableKind {
        PollableKind::Unique
    }

    fn polling_worker(&self) -> Option<WorkerId> {
        self.polling_worker
    }

    fn set_polling_worker(&mut self, worker: Option<WorkerId>) {
        self.polling_worker = worker;
    }

    fn handle_poll_events(
        &mut self,
        worker: &mut Worker,
        events: PollEvents,
        _context: PollContext,
    ) -> PollActions {
        let mut actions = PollActions::empty();

        if events.intersects(PollEvents::HUP | PollEvents::ERR) {
            self.mark_closed(worker, CloseReason::None, None);
            return PollActions::HUP;
        }

        if events.contains(PollEvents::OUT) {
            self.drain_out(worker);
            actions |= PollActions::WRITE;
            if self.phase == ClientPhase::Closed {
                return actions | PollActions::HUP;
            }
        }

        if events.contains(PollEvents::IN) {
            match self.accumulator.read_from(&mut self.stream) {
                Ok(ReadOutcome::Eof) => {
                    self.mark_closed(worker, CloseReason::None, None);
                    return actions | PollActions::HUP;
                }
                Ok(outcome) => {
                    actions |= PollActions::READ;
                    if matches!(outcome, ReadOutcome::MoreAvailable(_)) {
                        actions |= PollActions::INCOMPLETE_READ;
                    }
                    self.process_frames(worker);
                    if self.phase == ClientPhase::Closed {
                        return actions | PollActions::HUP;
                    }
                }
                Err(e) => {
                    debug!("Client fd {} read error: {e}", self.fd);
                    self.mark_closed(worker, CloseReason::None, None);
                    return actions | PollActions::ERROR;
                }
            }
        }

        actions
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BackendPhase {
    Connecting,
    AwaitHandshake,
    AuthSent,
    Command,
    Closed,
}

/// Credentials the proxy presents to backends. Decoupled from client
/// credentials: the proxy authenticates clients itself and holds its own
/// backend account.
#[derive(Debug, Clone)]
pub struct BackendCredentials {
    pub user: String,
    pub password: String,
}

/// The proxy's connection to one backend server, on behalf of one
/// session. Authentication toward the backend uses the proxy's own
/// service credentials.
pub struct BackendDcb {
    stream: mio::net::TcpStream,
    fd: RawFd,
    accumulator: PacketAccumulator,
    write_queue: WriteQueue,
    polling_worker: Option<WorkerId>,
    session: Weak<RefCell<Session>>,
    backend: Arc<Backend>,
    credentials: BackendCredentials,
    phase: BackendPhase,
    /// frames queued before the backend finished authenticating
    pending: Vec<Vec<u8>>,
    want_out: bool,
}

impl BackendDcb {
    pub fn connect(
        worker: &mut Worker,
        backend: Arc<Backend>,
        session: Weak<RefCell<Session>>,
        credentials: BackendCredentials,
    ) -> crate::error::Result<Rc<RefCell<BackendDcb>>> {
        use std::net::ToSocketAddrs;
        let addr = backend.endpoint().to_socket_addrs()?.next().ok_or_else(|| {
            crate::error::ProxyError::from(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("cannot resolve {}", backend.endpoint()),
            ))
        })?;
        let stream = mio::net::TcpStream::connect(addr)?;
        let fd = stream.as_raw_fd();
        let dcb = Rc::new(RefCell::new(BackendDcb {
            stream,
            fd,
            accumulator: PacketAccumulator::new(),
            write_queue: WriteQueue::new(),
            polling_worker: None,
            session,
            backend,
            credentials,
            phase: BackendPhase::Connecting,
            pending: Vec::new(),
            want_out: true,
        }));
        if !worker.add_pollable(PollEvents::IN | PollEvents::OUT, dcb.clone()) {
            return Err(crate::error::ProxyError::ResourceExhaustion(
                "could not register backend connection".to_string(),
            ));
        }
        Ok(dcb)
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn role(&self) -> DcbRole {
        DcbRole::Backend
    }

    pub fn backend(&self) -> &Arc<Backend> {
        &self.backend
    }

    pub fn is_ready(&self) -> bool {
        self.phase == BackendPhase::Command
    }

    /// Queue one wire frame toward the backend. Held back until the
    /// backend handshake finished.
    pub fn send_frame(&mut self, worker: &mut Worker, frame: Vec<u8>) {
        match self.phase {
            BackendPhase::Command => {
                self.write_queue.push_wire(frame);
                self.drain_out(worker);
            }
            BackendPhase::Closed => {}
            _ => self.pending.push(frame),
        }
    }

    fn drain_out(&mut self, worker: &mut Worker) {
        match self.write_queue.drain(&mut self.stream) {
            Ok(drained) => self.update_interest(worker, !drained),
            Err(e) => {
                warn!(
                    "Backend {} fd {} write error: {e}",
                    self.backend.name(),
                    self.fd
                );
                self.phase = BackendPhase::Closed;
            }
        }
    }

    fn update_interest(&mut self, worker: &mut Worker, want_out: bool) {
        if want_out == self.want_out || self.phase == BackendPhase::Closed {
            return;
        }
        self.want_out = want_out;
        let events = if want_out {
            PollEvents::IN | PollEvents::OUT
        } else {
            PollEvents::IN
        };
        if let Some(pollable) = worker.pollable(self.fd) {
            worker.modify_pollable(events, &pollable);
        }
    }

    fn handle_handshake_frame(&mut self, worker: &mut Worker, wire: Vec<u8>) {
        let seq = wire[3];
        let payload = &wire[4..];

        if payload.first() == Some(&0xff) {
            warn!(
                "Backend {} rejected the connection before handshake",
                self.backend.name()
            );
            self.fail_session(worker, "backend refused connection");
            return;
        }

        let Ok((_, handshake)) = server_handshake(payload) else {
            self.fail_session(worker, "malformed backend handshake");
            return;
        };

        let mut scramble = [0u8; SCRAMBLE_SIZE];
        let n = handshake.scramble.len().min(SCRAMBLE_SIZE);
        scramble[..n].copy_from_slice(&handshake.scramble[..n]);

        let token = native_password_token(self.credentials.password.as_bytes(), &scramble);

        // selecting the database during the handshake keeps the reply
        // tracker out of connection setup entirely
        let database = self
            .session
            .upgrade()
            .map(|s| s.borrow().protocol().current_db.clone())
            .unwrap_or_default();

        let mut response = Vec::with_capacity(128);
        let mut caps = CapabilityFlags::CLIENT_PROTOCOL_41
            | CapabilityFlags::CLIENT_SECURE_CONNECTION
            | CapabilityFlags::CLIENT_PLUGIN_AUTH
            | CapabilityFlags::CLIENT_LOCAL_FILES
            | CapabilityFlags::CLIENT_MULTI_STATEMENTS
            | CapabilityFlags::CLIENT_MULTI_RESULTS
            | CapabilityFlags::CLIENT_PS_MULTI_RESULTS
            | CapabilityFlags::CLIENT_TRANSACTIONS;
        if !database.is_empty() {
            caps |= CapabilityFlags::CLIENT_CONNECT_WITH_DB;
        }
        response.extend((caps.bits()).to_le_bytes());
        response.extend(16777216u32.to_le_bytes());
        response.push(0x21); // utf8_general_ci
        response.extend([0u8; 23]);
        response.extend(self.credentials.user.as_bytes());
        response.push(0);
        response.push(token.len() as u8);
        response.extend(&token);
        if !database.is_empty() {
            response.extend(database.as_bytes());
            response.push(0);
        }
        response.extend(b"mysql_native_password\0");

        self.write_queue.set_seq(seq.wrapping_add(1));
        self.write_queue.push_payload(&response);
        self.phase = BackendPhase::AuthSent;
        self.drain_out(worker);
    }

    fn handle_auth_result_frame(&mut self, worker: &mut Worker, wire: Vec<u8>) {
        let seq = wire[3];
        let payload = &wire[4..];
        match payload.first() {
            Some(0x00) => {
                debug!(
                    "Backend {} fd {} authenticated",
                    self.backend.name(),
                    self.fd
                );
                self.phase = BackendPhase::Command;
                let pending = std::mem::take(&mut self.pending);
                for frame in pending {
                    self.write_queue.push_wire(frame);
                }
                self.drain_out(worker);
            }
            Some(0xfe) => {
                // AuthSwitchRequest: plugin name NUL + fresh scramble
                let body = &payload[1..];
                let split = body.iter().position(|b| *b == 0).unwrap_or(body.len());
                let mut scramble = [0u8; SCRAMBLE_SIZE];
                let tail = &body[(split + 1).min(body.len())..];
                let n = tail.len().min(SCRAMBLE_SIZE);
                scramble[..n].copy_from_slice(&tail[..n]);
                let token =
                    native_password_token(self.credentials.password.as_bytes(), &scramble);
                self.write_queue.set_seq(seq.wrapping_add(1));
                self.write_queue.push_payload(&token);
                self.drain_out(worker);
            }
            _ => {
                warn!(
                    "Backend {} authentication failed for proxy user",
                    self.backend.name()
                );
                self.fail_session(worker, "backend authentication failed");
            }
        }
    }

    /// Deliver command-phase frames to the session and flush whatever the
    /// pipeline produced for the client.
    fn handle_command_frames(&mut self, worker: &mut Worker, frames: Vec<Vec<u8>>) {
        let Some(session) = self.session.upgrade() else {
            self.phase = BackendPhase::Closed;
            return;
        };
        session.borrow_mut().backend_data(worker, self.fd, frames);

        let backlog = session.borrow_mut().take_client_backlog();
        if !backlog.is_empty() {
            let sink = session.borrow().client_sink();
            if let Some(client) = sink.and_then(|weak| weak.upgrade()) {
                client.borrow_mut().send_frames(worker, backlog);
            }
        }
    }

    fn fail_session(&mut self, worker: &mut Worker, what: &str) {
        self.phase = BackendPhase::Closed;
        let error = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, what);
        if let Some(session) = self.session.upgrade() {
            let verdict = session.borrow_mut().backend_error(worker, self.fd, &error);
            self.apply_error_verdict(worker, verdict, session);
        }
    }

    fn apply_error_verdict(
        &mut self,
        worker: &mut Worker,
        verdict: crate::session::pipeline::ErrorAction,
        session: Rc<RefCell<Session>>,
    ) {
        use crate::session::pipeline::ErrorAction;
        match verdict {
            ErrorAction::Retry | ErrorAction::CloseBackend => {
                self.phase = BackendPhase::Closed;
            }
            ErrorAction::CloseSession => {
                self.phase = BackendPhase::Closed;
                let err = writers::err_packet(
                    ErrorKind::ErrLockDeadlock,
                    CloseReason::HandleErrorFailed.phrase().as_bytes(),
                );
                session
                    .borrow_mut()
                    .kill(worker, Some(err), CloseReason::HandleErrorFailed);
                let backlog = session.borrow_mut().take_client_backlog();
                let sink = session.borrow().client_sink();
                if let Some(client) = sink.and_then(|weak| weak.upgrade()) {
                    client.borrow_mut().send_frames(worker, backlog);
                }
            }
        }
    }
}

impl Pollable for BackendDcb {
    fn poll_fd(&self) -> RawFd {
        self.fd
    }

    fn kind(&self) -> PollableKind {
        PollableKind::Unique
    }

    fn polling_worker(&self) -> Option<WorkerId> {
        self.polling_worker
    }

    fn set_polling_worker(&mut self, worker: Option<WorkerId>) {
        self.polling_worker = worker;
    }

    fn handle_poll_events(
        &mut self,
        worker: &mut Worker,
        events: PollEvents,
        _context: PollContext,
    ) -> PollActions {
        let mut actions = PollActions::empty();

        if events.intersects(PollEvents::HUP | PollEvents::ERR) {
            let error = std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "backend connection lost",
            );
            self.phase = BackendPhase::Closed;
            if let Some(session) = self.session.upgrade() {
                let verdict = session.borrow_mut().backend_error(worker, self.fd, &error);
                self.apply_error_verdict(worker, verdict, session);
            }
            return PollActions::HUP;
        }

        if events.contains(PollEvents::OUT) {
            if self.phase == BackendPhase::Connecting {
                self.phase = BackendPhase::AwaitHandshake;
            }
            self.drain_out(worker);
            actions |= PollActions::WRITE;
            if self.phase == BackendPhase::Closed {
                return actions | PollActions::ERROR;
            }
        }

        if events.contains(PollEvents::IN) {
            if self.phase == BackendPhase::Connecting {
                self.phase = BackendPhase::AwaitHandshake;
            }
            match self.accumulator.read_from(&mut self.stream) {
                Ok(ReadOutcome::Eof) => {
                    let error = std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "backend closed the connection",
                    );
                    self.phase = BackendPhase::Closed;
                    if let Some(session) = self.session.upgrade() {
                        let verdict =
                            session.borrow_mut().backend_error(worker, self.fd, &error);
                        self.apply_error_verdict(worker, verdict, session);
                    }
                    return actions | PollActions::HUP;
                }
                Ok(outcome) => {
                    actions |= PollActions::READ;
                    if matches!(outcome, ReadOutcome::MoreAvailable(_)) {
                        actions |= PollActions::INCOMPLETE_READ;
                    }
                    let mut command_frames = Vec::new();
                    while let Some(wire) = self.accumulator.next_frame() {
                        match self.phase {
                            BackendPhase::AwaitHandshake => {
                                self.handle_handshake_frame(worker, wire)
                            }
                            BackendPhase::AuthSent => {
                                self.handle_auth_result_frame(worker, wire)
                            }
                            BackendPhase::Command => command_frames.push(wire),
                            BackendPhase::Connecting | BackendPhase::Closed => break,
                        }
                    }
                    if !command_frames.is_empty() {
                        self.handle_command_frames(worker, command_frames);
                    }
                    if self.phase == BackendPhase::Closed {
                        return actions | PollActions::HUP;
                    }
                }
                Err(e) => {
                    self.phase = BackendPhase::Closed;
                    if let Some(session) = self.session.upgrade() {
                        let verdict = session.borrow_mut().backend_error(worker, self.fd, &e);
                        self.apply_error_verdict(worker, verdict, session);
                    }
                    return actions | PollActions::ERROR;
                }
            }
        }

        actions
    }
}
