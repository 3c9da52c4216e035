use crate::classifier::info::ParseInfo;
use crate::protocol::mysql::constants::{CommandCode, MAX_PAYLOAD_LEN, PACKET_HEADER_LEN};

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_BUFFER_ID: AtomicU64 = AtomicU64::new(1);

/// A routing directive attached to a buffer, parsed out of SQL comments or
/// injected by a filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Hint {
    RouteToMaster,
    RouteToSlave,
    RouteToNamedServer(String),
    RouteToLastUsed,
    RouteToAll,
    Parameter { name: String, value: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HintKind {
    RouteToMaster,
    RouteToSlave,
    RouteToNamedServer,
    RouteToLastUsed,
    RouteToAll,
    Parameter,
}

impl Hint {
    pub fn kind(&self) -> HintKind {
        match self {
            Hint::RouteToMaster => HintKind::RouteToMaster,
            Hint::RouteToSlave => HintKind::RouteToSlave,
            Hint::RouteToNamedServer(_) => HintKind::RouteToNamedServer,
            Hint::RouteToLastUsed => HintKind::RouteToLastUsed,
            Hint::RouteToAll => HintKind::RouteToAll,
            Hint::Parameter { .. } => HintKind::Parameter,
        }
    }
}

/// One client statement travelling through the pipeline: a single wire
/// frame (header included), the hints parsed for it, and the classifier
/// info attached once the statement has been classified. The id correlates
/// a COM_STMT_PREPARE with the prepared statement it registers.
#[derive(Debug, Clone)]
pub struct Buffer {
    id: u64,
    wire: Vec<u8>,
    hints: Vec<Hint>,
    // interior-mutable so classification can attach results through the
    // shared reference the parser receives
    info: RefCell<Option<Rc<ParseInfo>>>,
}

impl Buffer {
    /// Wrap a wire frame. `wire` must include the 4-byte header.
    pub fn from_wire(wire: Vec<u8>) -> Self {
        debug_assert!(wire.len() >= PACKET_HEADER_LEN);
        Buffer {
            id: NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed),
            wire,
            hints: Vec::new(),
            info: RefCell::new(None),
        }
    }

    /// Convenience for tests and synthesized statements.
    pub fn from_payload(seq: u8, payload: &[u8]) -> Self {
        let mut wire = Vec::with_capacity(PACKET_HEADER_LEN + payload.len());
        let len = (payload.len() as u32).to_le_bytes();
        wire.extend_from_slice(&[len[0], len[1], len[2], seq]);
        wire.extend_from_slice(payload);
        Buffer::from_wire(wire)
    }

    pub fn com_query(sql: &str) -> Self {
        let mut payload = Vec::with_capacity(1 + sql.len());
        payload.push(CommandCode::ComQuery as u8);
        payload.extend_from_slice(sql.as_bytes());
        Buffer::from_payload(0, &payload)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn wire(&self) -> &[u8] {
        &self.wire
    }

    pub fn into_wire(self) -> Vec<u8> {
        self.wire
    }

    pub fn payload(&self) -> &[u8] {
        &self.wire[PACKET_HEADER_LEN..]
    }

    pub fn payload_len(&self) -> usize {
        self.wire.len() - PACKET_HEADER_LEN
    }

    /// The command byte, or `None` for an empty packet (e.g. the terminator
    /// of a LOAD DATA LOCAL INFILE exchange).
    pub fn command(&self) -> Option<u8> {
        self.wire.get(PACKET_HEADER_LEN).copied()
    }

    /// SQL text of a COM_QUERY / COM_STMT_PREPARE payload.
    pub fn sql_bytes(&self) -> Option<&[u8]> {
        match self.command() {
            Some(c)
                if c == CommandCode::ComQuery as u8
                    || c == CommandCode::ComStmtPrepare as u8 =>
            {
                Some(&self.wire[PACKET_HEADER_LEN + 1..])
            }
            _ => None,
        }
    }

    pub fn sql(&self) -> Option<std::borrow::Cow<'_, str>> {
        self.sql_bytes().map(String::from_utf8_lossy)
    }

    /// True when the payload fills a whole packet, meaning the next frame
    /// continues this statement.
    pub fn is_large(&self) -> bool {
        self.payload_len() == MAX_PAYLOAD_LEN
    }

    pub fn hints(&self) -> &[Hint] {
        &self.hints
    }

    pub fn add_hint(&mut self, hint: Hint) {
        self.hints.push(hint);
    }

    pub fn set_hints(&mut self, hints: Vec<Hint>) {
        self.hints = hints;
    }

    pub fn info(&self) -> Option<Rc<ParseInfo>> {
        self.info.borrow().clone()
    }

    pub fn has_info(&self) -> bool {
        self.info.borrow().is_some()
    }

    pub fn set_info(&self, info: Rc<ParseInfo>) {
        *self.info.borrow_mut() = Some(info);
    }

    pub fn take_info(&self) -> Option<Rc<ParseInfo>> {
        self.info.borrow_mut().take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique() {
        let a = Buffer::com_query("SELECT 1");
        let b = Buffer::com_query("SELECT 1");
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn payload_round_trip() {
        let buf = Buffer::com_query("SELECT id FROM t");
        assert_eq!(buf.command(), Some(CommandCode::ComQuery as u8));
        assert_eq!(buf.sql().unwrap(), "SELECT id FROM t");
        assert!(!buf.is_large());
    }

    #[test]
    fn empty_packet_has_no_command() {
        let buf = Buffer::from_payload(0, &[]);
        assert_eq!(buf.command(), None);
        assert_eq!(buf.payload_len(), 0);
    }

    #[test]
    fn large_packet_detection() {
        let payload = vec![3u8; MAX_PAYLOAD_LEN];
        let buf = Buffer::from_payload(0, &payload);
        assert!(buf.is_large());
    }
}
