//! The read/write-splitting router: the pipeline terminal that drives the
//! routing state machine, owns the session's backend connections and
//! relays replies, translating prepared-statement ids between the
//! client-visible internal ids and each backend's own ids.

use crate::backend::{Backend, BackendInventory};
use crate::buffer::{Buffer, Hint, HintKind};
use crate::classifier::cache::CachingParser;
use crate::classifier::inspector::InspectParser;
use crate::classifier::TypeMask;
use crate::protocol::mysql::basic::extract_ps_id;
use crate::protocol::mysql::constants::{CommandCode, PS_ID_OFFSET};
use crate::protocol::mysql::error_codes::ErrorKind;
use crate::protocol::mysql::packet::writers;
use crate::protocol::mysql::reply::ReplyTracker;
use crate::router::ps::PsLogVerbosity;
use crate::router::{
    CurrentTarget, Handler, QueryClassifier, ReplyUpdate, RouteTarget, UseSqlVariablesIn,
};
use crate::server::dcb::{BackendCredentials, BackendDcb};
use crate::session::pipeline::{
    ErrorAction, Reply, Router, RouterSession, RoutingCapabilities, SessionCtx,
};
use crate::session::Session;
use crate::worker::CallAction;

use common::metrics::counter_inc;
use common::metrics::metric_def::{PROXY_ROUTE_ALL, PROXY_ROUTE_MASTER, PROXY_ROUTE_SLAVE};
use hashbrown::HashMap;
use mysql_common::constants::CapabilityFlags;
use rand::Rng;
use std::cell::RefCell;
use std::os::fd::RawFd;
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct RwsConfig {
    pub use_sql_variables_in: UseSqlVariablesIn,
    pub ps_log_verbosity: PsLogVerbosity,
    pub delayed_retry_timeout: Duration,
    pub verbose: bool,
}

impl Default for RwsConfig {
    fn default() -> Self {
        RwsConfig {
            use_sql_variables_in: UseSqlVariablesIn::Master,
            ps_log_verbosity: PsLogVerbosity::Warn,
            delayed_retry_timeout: Duration::from_millis(1000),
            verbose: false,
        }
    }
}

/// Router factory, one per service.
pub struct ReadWriteSplit {
    inventory: Arc<BackendInventory>,
    credentials: BackendCredentials,
    config: RwsConfig,
}

impl ReadWriteSplit {
    pub fn new(
        inventory: Arc<BackendInventory>,
        credentials: BackendCredentials,
        config: RwsConfig,
    ) -> Arc<ReadWriteSplit> {
        Arc::new(ReadWriteSplit {
            inventory,
            credentials,
            config,
        })
    }
}

impl Router for ReadWriteSplit {
    fn name(&self) -> &str {
        "readwritesplit"
    }

    fn capabilities(&self) -> RoutingCapabilities {
        RoutingCapabilities::TRANSACTION_TRACKING | RoutingCapabilities::STATEMENT_INPUT
    }

    fn new_session(&self, ctx: &mut SessionCtx<'_>) -> Option<Box<dyn RouterSession>> {
        let multi_statements_allowed = ctx
            .protocol
            .capabilities
            .contains(CapabilityFlags::CLIENT_MULTI_STATEMENTS);

        let parser = Rc::new(CachingParser::new(Box::new(InspectParser::new())));
        let mut qc = QueryClassifier::new(
            parser,
            self.config.use_sql_variables_in,
            multi_statements_allowed,
            self.config.ps_log_verbosity,
        );
        qc.set_verbose(self.config.verbose);
        qc.set_current_db(&ctx.protocol.current_db);

        let mut rws = RwsSession {
            qc,
            inventory: Arc::clone(&self.inventory),
            credentials: self.credentials.clone(),
            session: ctx.session_ref.clone(),
            conns: HashMap::new(),
            master_fd: None,
            slave_fd: None,
            last_used: None,
            replying_fd: None,
            locked_to_master: false,
            pending_prepare_internal: None,
            current_stmt: None,
            retry_used: false,
            delayed_retry_timeout: self.config.delayed_retry_timeout,
        };

        // A session needs its master connection up front; a slave is
        // attached opportunistically.
        let master = self.inventory.master().cloned()?;
        let master_fd = rws.connect_backend(ctx, &master)?;
        rws.master_fd = Some(master_fd);
        rws.last_used = Some(master_fd);

        let slaves = self.inventory.slaves();
        if !slaves.is_empty() {
            let pick = ctx.worker.random_engine().gen_range(0..slaves.len());
            let slave = Arc::clone(slaves[pick]);
            if let Some(fd) = rws.connect_backend(ctx, &slave) {
                rws.slave_fd = Some(fd);
            }
        }

        info!(
            "Session {} connected to {} backend(s)",
            ctx.shared.id(),
            rws.conns.len()
        );
        Some(Box::new(rws))
    }
}

struct BackendConn {
    dcb: Rc<RefCell<BackendDcb>>,
    backend: Arc<Backend>,
    tracker: ReplyTracker,
    /// internal (client visible) id → this backend's statement id
    ps_ids: HashMap<u32, u32>,
}

struct LockHandler<'a> {
    locked: &'a mut bool,
    has_master: bool,
}

impl Handler for LockHandler<'_> {
    fn lock_to_master(&mut self) -> bool {
        if self.has_master {
            *self.locked = true;
        }
        self.has_master
    }

    fn is_locked_to_master(&self) -> bool {
        *self.locked
    }

    fn supports_hint(&self, _hint: HintKind) -> bool {
        true
    }
}

pub struct RwsSession {
    qc: QueryClassifier,
    inventory: Arc<BackendInventory>,
    credentials: BackendCredentials,
    session: Weak<RefCell<Session>>,
    conns: HashMap<RawFd, BackendConn>,
    master_fd: Option<RawFd>,
    slave_fd: Option<RawFd>,
    last_used: Option<RawFd>,
    /// the connection whose reply is forwarded to the client
    replying_fd: Option<RawFd>,
    locked_to_master: bool,
    /// internal id of a prepare in flight, for mapping the response
    pending_prepare_internal: Option<u32>,
    /// the statement being routed, kept for one retry
    current_stmt: Option<Buffer>,
    retry_used: bool,
    delayed_retry_timeout: Duration,
}

fn rewrite_ps_id(frame: &mut [u8], id: u32) {
    if frame.len() >= PS_ID_OFFSET + 4 {
        frame[PS_ID_OFFSET..PS_ID_OFFSET + 4].copy_from_slice(&id.to_le_bytes());
    }
}

impl RwsSession {
    fn connect_backend(
        &mut self,
        ctx: &mut SessionCtx<'_>,
        backend: &Arc<Backend>,
    ) -> Option<RawFd> {
        match BackendDcb::connect(
            ctx.worker,
            Arc::clone(backend),
            self.session.clone(),
            self.credentials.clone(),
        ) {
            Ok(dcb) => {
                let fd = dcb.borrow().fd();
                self.conns.insert(
                    fd,
                    BackendConn {
                        dcb,
                        backend: Arc::clone(backend),
                        tracker: ReplyTracker::new(),
                        ps_ids: HashMap::new(),
                    },
                );
                debug!("Connected to backend {} as fd {fd}", backend.name());
                Some(fd)
            }
            Err(e) => {
                warn!("Could not connect to backend {}: {e}", backend.name());
                None
            }
        }
    }

    fn conn_for_named(&mut self, ctx: &mut SessionCtx<'_>, hints: &[Hint]) -> Option<RawFd> {
        let name = hints.iter().find_map(|h| match h {
            Hint::RouteToNamedServer(name) => Some(name.clone()),
            _ => None,
        })?;
        if let Some((fd, _)) = self
            .conns
            .iter()
            .find(|(_, conn)| conn.backend.name() == name)
        {
            return Some(*fd);
        }
        let backend = self.inventory.by_name(&name)?;
        if !backend.is_usable() {
            return None;
        }
        let backend = Arc::clone(backend);
        self.connect_backend(ctx, &backend)
    }

    /// Translate the abstract target into concrete connections.
    fn resolve_targets(
        &mut self,
        ctx: &mut SessionCtx<'_>,
        target: RouteTarget,
        hints: &[Hint],
    ) -> (Vec<RawFd>, Option<RawFd>) {
        if target.contains(RouteTarget::ALL) {
            let fds: Vec<RawFd> = self.conns.keys().copied().collect();
            let owner = self.master_fd.or_else(|| fds.first().copied());
            counter_inc(PROXY_ROUTE_ALL, 1, None);
            return (fds, owner);
        }

        let fd = if target.contains(RouteTarget::NAMED_SERVER) {
            self.conn_for_named(ctx, hints)
                .or(if target.contains(RouteTarget::MASTER) {
                    self.master_fd
                } else {
                    self.slave_fd.or(self.master_fd)
                })
        } else if target.contains(RouteTarget::MASTER) {
            counter_inc(PROXY_ROUTE_MASTER, 1, None);
            self.master_fd
        } else if target.contains(RouteTarget::LAST_USED) {
            self.last_used.or(self.master_fd)
        } else if target.contains(RouteTarget::SLAVE) {
            counter_inc(PROXY_ROUTE_SLAVE, 1, None);
            // a slave within the lag bound when lag data exists; the TCP
            // monitor publishes none, so RLAG_MAX degrades to plain slave
            self.slave_fd
                .filter(|fd| self.conns.contains_key(fd))
                .or(self.master_fd)
        } else {
            self.master_fd
        };

        (fd.into_iter().collect(), fd)
    }

    fn send_error_to_client(&self, ctx: &mut SessionCtx<'_>, buffer: &Buffer, msg: &str) {
        let seq = buffer.wire()[3].wrapping_add(1);
        let payload = writers::err_packet(ErrorKind::ErrNoMasterAvailable, msg.as_bytes());
        ctx.send_to_client(seq, &payload);
    }

    /// Send one frame to a connection, translating statement ids.
    fn dispatch(&mut self, ctx: &mut SessionCtx<'_>, fd: RawFd, buffer: &Buffer) {
        let command = self.qc.route_info().command();
        let stmt_id = self.qc.route_info().stmt_id();
        let load_active = self.qc.route_info().load_data_active();
        let passthrough = load_active || self.qc.route_info().multi_part_packet();
        let Some(conn) = self.conns.get_mut(&fd) else {
            return;
        };

        let mut frame = buffer.wire().to_vec();
        if !passthrough && stmt_id != 0 && CommandCode::is_ps_command(command) {
            if let Some(server_id) = conn.ps_ids.get(&stmt_id) {
                rewrite_ps_id(&mut frame, *server_id);
            }
            // without a mapping the id passes through untouched and the
            // server reports ER_UNKNOWN_STMT_HANDLER itself
        }

        if passthrough {
            if load_active && buffer.payload_len() == 0 {
                conn.tracker.local_infile_done();
            }
        } else {
            // every recipient tracks its own reply; only the owner's is
            // forwarded upstream
            conn.tracker.start_command(command);
        }

        conn.dcb.borrow_mut().send_frame(ctx.worker, frame);
    }

    fn schedule_retry(&mut self, ctx: &mut SessionCtx<'_>) -> bool {
        if self.retry_used {
            return false;
        }
        let Some(stmt) = self.current_stmt.clone() else {
            return false;
        };
        self.retry_used = true;
        self.qc.revert_update();

        let weak = self.session.clone();
        let mut slot = Some(stmt);
        let callable = match weak.upgrade() {
            Some(session) => session.borrow().callable(),
            None => return false,
        };
        info!("Retrying statement in {:?}", self.delayed_retry_timeout);
        ctx.worker
            .delayed_call(callable, self.delayed_retry_timeout, move |action, worker| {
                if action == CallAction::Execute {
                    if let (Some(buffer), Some(session)) = (slot.take(), weak.upgrade()) {
                        session.borrow_mut().route_query(worker, buffer);
                        crate::session::flush_session_to_client(worker, &session);
                    }
                }
                false
            });
        true
    }

    fn forget_conn(&mut self, fd: RawFd) {
        self.conns.remove(&fd);
        if self.master_fd == Some(fd) {
            self.master_fd = None;
        }
        if self.slave_fd == Some(fd) {
            self.slave_fd = None;
        }
        if self.last_used == Some(fd) {
            self.last_used = self.master_fd;
        }
        if self.replying_fd == Some(fd) {
            self.replying_fd = None;
        }
    }
}

impl RouterSession for RwsSession {
    fn route_query(&mut self, ctx: &mut SessionCtx<'_>, buffer: Buffer) -> bool {
        self.qc.set_current_db(&ctx.protocol.current_db);

        let current_target = if self.locked_to_master {
            CurrentTarget::Master
        } else {
            CurrentTarget::Undefined
        };

        let info = {
            let has_master = self.master_fd.is_some() || self.inventory.master().is_some();
            let RwsSession {
                qc, locked_to_master, ..
            } = self;
            let mut handler = LockHandler {
                locked: locked_to_master,
                has_master,
            };
            qc.update_route_info(current_target, &buffer, &mut handler)
                .clone()
        };
        ctx.shared.publish_trx_state(self.qc.trx().state());

        // Without transaction tracking somewhere in the chain the trx
        // predicates are not trustworthy and reads may not leave the
        // master.
        let info = if !ctx.trx_tracking && info.target() == RouteTarget::SLAVE {
            let mut pinned = info;
            pinned.set_target(RouteTarget::MASTER);
            pinned
        } else {
            info
        };

        // COM_INIT_DB moves the session's default database
        if info.command() == CommandCode::ComInitDB as u8 {
            if let Ok(db) = std::str::from_utf8(&buffer.payload()[1..]) {
                ctx.protocol.current_db = db.to_string();
                self.qc.set_current_db(db);
            }
        }

        let (fds, owner) = self.resolve_targets(ctx, info.target(), buffer.hints());
        if fds.is_empty() {
            warn!(
                "Session {}: no target for statement, target mask {:?}",
                ctx.shared.id(),
                info.target()
            );
            if self.schedule_retry(ctx) {
                return true;
            }
            self.send_error_to_client(ctx, &buffer, "No server available to route to");
            return false;
        }

        if !info.multi_part_packet() && !info.load_data_active() {
            self.current_stmt = Some(buffer.clone());
            self.retry_used = false;
        }

        if info
            .type_mask()
            .intersects(TypeMask::PREPARE_STMT | TypeMask::PREPARE_NAMED_STMT)
        {
            self.pending_prepare_internal = Some(buffer.id() as u32);
        }

        self.replying_fd = owner;
        for fd in &fds {
            self.dispatch(ctx, *fd, &buffer);
        }
        self.last_used = owner.or(self.last_used);

        // closing a binary statement has no response; drop our own record
        // and the per-backend id mappings right away
        if info.command() == CommandCode::ComStmtClose as u8 {
            self.qc.ps_erase(&buffer);
            let stmt_id = info.stmt_id();
            for conn in self.conns.values_mut() {
                conn.ps_ids.remove(&stmt_id);
            }
        }

        self.qc.commit_route_info_update(&buffer);
        true
    }

    fn handle_backend_data(
        &mut self,
        ctx: &mut SessionCtx<'_>,
        backend_fd: RawFd,
        frames: Vec<Vec<u8>>,
    ) -> Option<Reply> {
        let pending_internal = self.pending_prepare_internal;
        let is_owner = self.replying_fd == Some(backend_fd);
        let conn = self.conns.get_mut(&backend_fd)?;

        let mut reply = Reply::default();
        for mut frame in frames {
            let event = conn.tracker.consume(&frame);

            if let Some(param_count) = event.ps_param_count {
                // map this backend's statement id to the client-visible one
                let server_id = extract_ps_id(&frame);
                if let Some(internal) = pending_internal {
                    conn.ps_ids.insert(internal, server_id);
                    rewrite_ps_id(&mut frame, internal);
                }
                reply.ps_param_count = Some(param_count);
            }

            if event.load_data_requested {
                reply.load_data_requested = true;
            }
            if let Some(status) = event.server_status {
                reply.server_status = Some(status);
            }
            if event.errored {
                reply.error = Some("backend returned an error".to_string());
            }
            if event.complete {
                reply.is_complete = true;
            }
            if is_owner {
                reply.frames.push(frame);
            }
        }

        if !is_owner {
            // a secondary recipient of a broadcast; its reply is swallowed
            return None;
        }

        if reply.is_complete || reply.load_data_requested {
            self.qc.update_from_reply(&ReplyUpdate {
                load_data_active: reply.load_data_requested,
                is_complete: reply.is_complete,
                server_status: reply.server_status,
                ps_param_count: reply.ps_param_count,
            });
            ctx.shared.publish_trx_state(self.qc.trx().state());
        }
        if reply.is_complete {
            self.current_stmt = None;
            self.pending_prepare_internal = None;
        }

        Some(reply)
    }

    fn handle_backend_error(
        &mut self,
        ctx: &mut SessionCtx<'_>,
        backend_fd: RawFd,
        error: &std::io::Error,
    ) -> ErrorAction {
        let name = self
            .conns
            .get(&backend_fd)
            .map(|c| c.backend.name().to_string())
            .unwrap_or_else(|| "<unknown>".to_string());
        warn!("Backend {name} failed: {error}");

        let was_replying = self.replying_fd == Some(backend_fd);
        let was_master = self.master_fd == Some(backend_fd);
        self.forget_conn(backend_fd);

        if was_replying && self.schedule_retry(ctx) {
            return ErrorAction::Retry;
        }

        if was_master {
            // without a master mid-statement the session cannot continue
            if was_replying || self.locked_to_master || self.qc.trx().is_trx_active() {
                return ErrorAction::CloseSession;
            }
        }
        ErrorAction::CloseBackend
    }

    fn close(&mut self, ctx: &mut SessionCtx<'_>) {
        for (fd, conn) in self.conns.drain() {
            if let Some(pollable) = ctx.worker.pollable(fd) {
                ctx.worker.remove_pollable(&pollable);
            }
            drop(conn);
        }
        self.master_fd = None;
        self.slave_fd = None;
        self.last_used = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ps_id_rewrite_targets_the_id_field() {
        let mut frame = vec![
            0x0a, 0x00, 0x00, 0x00, 0x17, 0x07, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00,
        ];
        rewrite_ps_id(&mut frame, 0x0102_0304);
        assert_eq!(&frame[5..9], &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(frame[4], 0x17);
    }

    #[test]
    fn short_frame_is_left_alone() {
        let mut frame = vec![0x01, 0x00, 0x00, 0x00, 0x17];
        rewrite_ps_id(&mut frame, 42);
        assert_eq!(frame, vec![0x01, 0x00, 0x00, 0x00, 0x17]);
    }
}
