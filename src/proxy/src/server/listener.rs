use crate::protocol::mysql::error_codes::ErrorKind;
use crate::protocol::mysql::packet::write_queue::WriteQueue;
use crate::protocol::mysql::packet::writers;
use crate::server::auth::gen_user_salt;
use crate::server::dcb::ClientDcb;
use crate::server::service::Service;
use crate::session::registry::SessionRegistry;
use crate::session::{next_session_id, CloseReason, ProtocolData, Session, SessionShared};
use crate::worker::{
    ExecuteMode, PollActions, PollContext, PollEvents, Pollable, PollableKind, Worker,
    WorkerId, WorkerRegistry,
};

use std::cell::RefCell;
use std::io::Write;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, RawFd};
use std::rc::Rc;
use std::sync::Arc;
use tracing::{info, warn};

/// The accepting socket. Registered on one worker; accepted connections
/// are spread over all workers round-robin, each session staying on the
/// worker that builds it for the rest of its life.
pub struct Listener {
    listener: mio::net::TcpListener,
    fd: RawFd,
    workers: Arc<WorkerRegistry>,
    sessions: Arc<SessionRegistry>,
    service: Arc<Service>,
    polling_worker: Option<WorkerId>,
    next_worker: usize,
}

impl Listener {
    pub fn bind(
        addr: SocketAddr,
        workers: Arc<WorkerRegistry>,
        sessions: Arc<SessionRegistry>,
        service: Arc<Service>,
    ) -> std::io::Result<Rc<RefCell<Listener>>> {
        let listener = mio::net::TcpListener::bind(addr)?;
        let fd = listener.as_raw_fd();
        info!("Service {} listening on {addr}", service.name());
        Ok(Rc::new(RefCell::new(Listener {
            listener,
            fd,
            workers,
            sessions,
            service,
            polling_worker: None,
            next_worker: 0,
        })))
    }

    fn reject(stream: &mut std::net::TcpStream, reason: CloseReason) {
        let payload = writers::err_packet(ErrorKind::ErrConCount, reason.phrase().as_bytes());
        let mut queue = WriteQueue::new();
        queue.push_payload(&payload);
        let mut wire = Vec::new();
        let _ = queue.drain(&mut wire);
        let _ = stream.write_all(&wire);
    }

    fn accept_one(&mut self) -> Option<()> {
        match self.listener.accept() {
            Ok((stream, peer)) => {
                if !self.service.admit_connection() {
                    warn!("Rejecting connection from {peer}: too many connections");
                    let mut std_stream =
                        unsafe { std::net::TcpStream::from_raw_fd(stream.into_raw_fd()) };
                    Self::reject(&mut std_stream, CloseReason::TooManyConnections);
                    return Some(());
                }

                let fd = stream.into_raw_fd();
                let service = Arc::clone(&self.service);
                let sessions = Arc::clone(&self.sessions);
                let seed = self.next_worker;
                self.next_worker = self.next_worker.wrapping_add(1);

                let Some(handle) = self.workers.pick(seed) else {
                    warn!("No running workers, dropping connection from {peer}");
                    let _ = unsafe { std::net::TcpStream::from_raw_fd(fd) };
                    self.service.connection_closed();
                    return Some(());
                };

                let posted = handle.execute(
                    move |worker| {
                        adopt_client(worker, fd, peer, service, sessions);
                    },
                    None,
                    ExecuteMode::Queued,
                );
                if !posted {
                    let _ = unsafe { std::net::TcpStream::from_raw_fd(fd) };
                    self.service.connection_closed();
                }
                Some(())
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => None,
            Err(e) => {
                warn!("Service {} accept error: {e}", self.service.name());
                None
            }
        }
    }
}

/// Build the session and client DCB for an accepted socket on its owning
/// worker.
fn adopt_client(
    worker: &mut Worker,
    fd: RawFd,
    peer: SocketAddr,
    service: Arc<Service>,
    sessions: Arc<SessionRegistry>,
) {
    let std_stream = unsafe { std::net::TcpStream::from_raw_fd(fd) };
    if let Err(e) = std_stream.set_nonblocking(true) {
        warn!("Could not make accepted socket non-blocking: {e}");
        service.connection_closed();
        return;
    }
    let stream = mio::net::TcpStream::from_std(std_stream);

    let scramble = gen_user_salt(worker);
    let id = next_session_id();
    let shared = Arc::new(SessionShared::new(
        id,
        "",
        &peer.to_string(),
        service.name(),
    ));
    let config = service.config().clone();
    let session = Session::create(
        sessions,
        shared,
        ProtocolData::default(),
        config.retain_last_statements,
        config.dump_statements,
    );
    let dcb = ClientDcb::new(stream, session, Arc::clone(&service), scramble);
    if !worker.add_pollable(PollEvents::IN, dcb) {
        warn!("Could not register client fd {fd} with worker {}", worker.id());
        service.connection_closed();
    }
}

impl Pollable for Listener {
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
        _worker: &mut Worker,
        events: PollEvents,
        _context: PollContext,
    ) -> PollActions {
        if !events.contains(PollEvents::IN) {
            return PollActions::empty();
        }
        while self.accept_one().is_some() {}
        PollActions::ACCEPT
    }
}
