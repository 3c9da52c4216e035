use crate::buffer::Buffer;
use crate::session::{ProtocolData, SessionShared};
use crate::worker::Worker;

use bitflags::bitflags;
use mysql_common::constants::StatusFlags;
use std::os::fd::RawFd;
use std::sync::Arc;

bitflags! {
    /// Capabilities a pipeline component declares. The union over the
    /// whole chain governs what the session may rely on; without
    /// TRANSACTION_TRACKING every statement is treated as potentially
    /// writing.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct RoutingCapabilities: u64 {
        const TRANSACTION_TRACKING = 1 << 0;
        const STATEMENT_INPUT      = 1 << 1;
    }
}

/// Backend data travelling back toward the client.
#[derive(Debug, Default, Clone)]
pub struct Reply {
    /// wire frames, headers included
    pub frames: Vec<Vec<u8>>,
    pub is_complete: bool,
    pub server_status: Option<StatusFlags>,
    /// set when the reply is an ERR packet
    pub error: Option<String>,
    /// backend requested a LOAD DATA LOCAL INFILE upload
    pub load_data_requested: bool,
    /// parameter count announced by a COM_STMT_PREPARE response
    pub ps_param_count: Option<u16>,
}

/// What a filter did with a request.
pub enum FilterAction {
    /// pass the (possibly rewritten) buffer further down
    Forward(Buffer),
    /// short-circuit: this reply travels back up from here
    Respond(Reply),
    /// swallow the buffer, no reply will be produced
    Consume,
    /// the filter failed and has arranged any client-visible response;
    /// the session stays alive
    Fail,
}

/// What a filter did with a reply.
pub enum ReplyAction {
    Forward(Reply),
    Discard,
    Fail,
}

/// Everything a pipeline stage may touch while handling one call. The
/// borrows come out of the session object, so a stage can never outlive
/// or alias the state it manipulates.
pub struct SessionCtx<'a> {
    pub worker: &'a mut Worker,
    pub shared: &'a Arc<SessionShared>,
    pub protocol: &'a mut ProtocolData,
    /// wire frames to deliver to the client once the call unwinds
    pub client_backlog: &'a mut Vec<Vec<u8>>,
    /// the session object itself, for components that need to call back
    /// into it from timer context
    pub session_ref: &'a std::rc::Weak<std::cell::RefCell<crate::session::Session>>,
    /// the chain declared TRANSACTION_TRACKING
    pub trx_tracking: bool,
}

impl SessionCtx<'_> {
    /// Queue a payload for the client, framed with the running sequence
    /// derived from the request.
    pub fn send_to_client(&mut self, seq: u8, payload: &[u8]) {
        let mut queue = crate::protocol::mysql::packet::write_queue::WriteQueue::new();
        queue.set_seq(seq);
        queue.push_payload(payload);
        let mut sink = Vec::new();
        // draining into a Vec cannot fail
        let _ = queue.drain(&mut sink);
        self.client_backlog.push(sink);
    }

    pub fn send_reply_to_client(&mut self, reply: &Reply) {
        for frame in &reply.frames {
            self.client_backlog.push(frame.clone());
        }
    }
}

/// A filter instance, shared by every session of the service it is
/// configured in.
pub trait Filter: Send + Sync {
    fn name(&self) -> &str;
    fn capabilities(&self) -> RoutingCapabilities;
    /// Returns None to refuse the session.
    fn new_session(&self) -> Option<Box<dyn FilterSession>>;
}

/// Per-session state of one filter.
pub trait FilterSession {
    fn route_query(&mut self, ctx: &mut SessionCtx<'_>, buffer: Buffer) -> FilterAction;

    fn route_reply(&mut self, _ctx: &mut SessionCtx<'_>, reply: Reply) -> ReplyAction {
        ReplyAction::Forward(reply)
    }
}

/// A router instance; the terminal of every session chain.
pub trait Router: Send + Sync {
    fn name(&self) -> &str;
    fn capabilities(&self) -> RoutingCapabilities;
    fn new_session(&self, ctx: &mut SessionCtx<'_>) -> Option<Box<dyn RouterSession>>;
}

/// What the router wants done about a failed backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// the statement was re-enqueued, keep the session
    Retry,
    /// close the failed backend connection only
    CloseBackend,
    /// the session cannot continue
    CloseSession,
}

/// Per-session state of the router.
pub trait RouterSession {
    /// Returns false when routing failed and the router has arranged the
    /// client-visible error.
    fn route_query(&mut self, ctx: &mut SessionCtx<'_>, buffer: Buffer) -> bool;

    /// Feed data that arrived from one of the router's backends. A
    /// returned reply travels up through the filters to the client.
    fn handle_backend_data(
        &mut self,
        ctx: &mut SessionCtx<'_>,
        backend_fd: RawFd,
        frames: Vec<Vec<u8>>,
    ) -> Option<Reply>;

    fn handle_backend_error(
        &mut self,
        ctx: &mut SessionCtx<'_>,
        backend_fd: RawFd,
        error: &std::io::Error,
    ) -> ErrorAction;

    /// Tear down backend connections. Called once, before the session is
    /// destroyed.
    fn close(&mut self, ctx: &mut SessionCtx<'_>);
}
