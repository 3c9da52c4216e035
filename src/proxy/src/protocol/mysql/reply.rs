//! Tracks how far along one backend response is, so the router knows when
//! a reply is complete, whether the server opened a LOAD DATA LOCAL
//! INFILE exchange, and what status flags the server reported.

use crate::protocol::mysql::basic::{extract_ps_param_count, read_length_encoded_number};
use crate::protocol::mysql::constants::{CommandCode, PACKET_HEADER_LEN};

use mysql_common::constants::StatusFlags;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReplyState {
    /// no command outstanding
    Idle,
    /// waiting for the first response packet
    AwaitResult,
    /// COM_STMT_PREPARE response header seen, definitions still streaming
    PrepareDefs { remaining: u16, eofs_left: u8 },
    /// column definitions of a result set
    Columns { remaining: u64 },
    /// result rows until the terminating EOF
    Rows,
    /// COM_FIELD_LIST: column defs until EOF
    FieldList,
    /// client is uploading LOAD DATA LOCAL INFILE content
    LocalInfile,
}

/// What one consumed frame amounted to.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReplyEvent {
    pub complete: bool,
    pub errored: bool,
    pub server_status: Option<StatusFlags>,
    pub load_data_requested: bool,
    pub ps_param_count: Option<u16>,
}

pub struct ReplyTracker {
    state: ReplyState,
    current_command: u8,
    /// sequence of the last request, responses continue from it
    pub request_seq: u8,
}

impl Default for ReplyTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplyTracker {
    pub fn new() -> Self {
        ReplyTracker {
            state: ReplyState::Idle,
            current_command: 0xff,
            request_seq: 0,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.state == ReplyState::Idle
    }

    /// Note a dispatched command; decides what response shape to expect.
    pub fn start_command(&mut self, command: u8) {
        use CommandCode::*;
        self.current_command = command;
        self.state = match command {
            c if c == ComQuit as u8
                || c == ComStmtClose as u8
                || c == ComStmtSendLongData as u8 =>
            {
                ReplyState::Idle
            }
            c if c == ComFieldList as u8 => ReplyState::FieldList,
            _ => ReplyState::AwaitResult,
        };
    }

    /// The client finished (or aborted) a LOAD DATA upload; the server
    /// will answer with OK or ERR.
    pub fn local_infile_done(&mut self) {
        if self.state == ReplyState::LocalInfile {
            self.state = ReplyState::AwaitResult;
        }
    }

    pub fn expects_upload(&self) -> bool {
        self.state == ReplyState::LocalInfile
    }

    /// Consume one response frame (wire bytes, header included).
    pub fn consume(&mut self, wire: &[u8]) -> ReplyEvent {
        let mut event = ReplyEvent::default();
        let payload = &wire[PACKET_HEADER_LEN.min(wire.len())..];
        if payload.is_empty() {
            return event;
        }
        let header = payload[0];

        match self.state {
            ReplyState::Idle => {}
            ReplyState::AwaitResult => match header {
                0x00 if self.current_command == CommandCode::ComStmtPrepare as u8
                    && payload.len() >= 12 =>
                {
                    // COM_STMT_PREPARE OK: status, 4-byte id, column and
                    // parameter counts, then the definition packets
                    let params = extract_ps_param_count(wire);
                    let columns = u16::from_le_bytes([payload[5], payload[6]]);
                    event.ps_param_count = Some(params);
                    let mut eofs_left = 0;
                    if params > 0 {
                        eofs_left += 1;
                    }
                    if columns > 0 {
                        eofs_left += 1;
                    }
                    if eofs_left == 0 {
                        self.finish(&mut event);
                    } else {
                        self.state = ReplyState::PrepareDefs {
                            remaining: params + columns,
                            eofs_left,
                        };
                    }
                }
                0x00 => {
                    event.server_status = ok_status(payload);
                    self.finish_or_continue(&mut event);
                }
                0xff => {
                    event.errored = true;
                    self.finish(&mut event);
                }
                0xfb => {
                    event.load_data_requested = true;
                    self.state = ReplyState::LocalInfile;
                }
                _ => {
                    if let Ok((_, count)) = read_length_encoded_number(payload) {
                        self.state = ReplyState::Columns { remaining: count };
                    }
                }
            },
            ReplyState::PrepareDefs {
                remaining,
                eofs_left,
            } => {
                if is_eof(payload) {
                    let eofs_left = eofs_left - 1;
                    if eofs_left == 0 {
                        self.finish(&mut event);
                    } else {
                        self.state = ReplyState::PrepareDefs {
                            remaining,
                            eofs_left,
                        };
                    }
                } else {
                    self.state = ReplyState::PrepareDefs {
                        remaining: remaining.saturating_sub(1),
                        eofs_left,
                    };
                }
            }
            ReplyState::Columns { remaining } => {
                if is_eof(payload) || remaining <= 1 {
                    self.state = ReplyState::Rows;
                } else {
                    self.state = ReplyState::Columns {
                        remaining: remaining - 1,
                    };
                }
            }
            ReplyState::Rows => {
                if header == 0xff {
                    event.errored = true;
                    self.finish(&mut event);
                } else if is_eof(payload) {
                    event.server_status = eof_status(payload);
                    self.finish_or_continue(&mut event);
                }
            }
            ReplyState::FieldList => {
                if is_eof(payload) || header == 0xff {
                    event.errored = header == 0xff;
                    self.finish(&mut event);
                }
            }
            ReplyState::LocalInfile => {
                // server-side frames should not arrive while uploading;
                // treat an OK/ERR as the terminating response anyway
                if header == 0x00 || header == 0xff {
                    event.errored = header == 0xff;
                    event.server_status = ok_status(payload);
                    self.finish(&mut event);
                }
            }
        }

        event
    }

    fn finish(&mut self, event: &mut ReplyEvent) {
        event.complete = true;
        self.state = ReplyState::Idle;
    }

    fn finish_or_continue(&mut self, event: &mut ReplyEvent) {
        if event
            .server_status
            .map(|s| s.contains(StatusFlags::SERVER_MORE_RESULTS_EXISTS))
            .unwrap_or(false)
        {
            self.state = ReplyState::AwaitResult;
        } else {
            self.finish(event);
        }
    }
}

fn is_eof(payload: &[u8]) -> bool {
    !payload.is_empty() && payload[0] == 0xfe && payload.len() < 9
}

fn ok_status(payload: &[u8]) -> Option<StatusFlags> {
    // OK packet: header, lenenc affected rows, lenenc insert id, status
    let mut i = 1;
    for _ in 0..2 {
        let (rest, _) = read_length_encoded_number(&payload[i..]).ok()?;
        i = payload.len() - rest.len();
    }
    if payload.len() >= i + 2 {
        Some(StatusFlags::from_bits_truncate(u16::from_le_bytes([
            payload[i],
            payload[i + 1],
        ])))
    } else {
        None
    }
}

fn eof_status(payload: &[u8]) -> Option<StatusFlags> {
    if payload.len() >= 5 {
        Some(StatusFlags::from_bits_truncate(u16::from_le_bytes([
            payload[3],
            payload[4],
        ])))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(payload: &[u8]) -> Vec<u8> {
        let mut wire = vec![payload.len() as u8, 0, 0, 1];
        wire.extend_from_slice(payload);
        wire
    }

    #[test]
    fn ok_reply_completes_immediately() {
        let mut tracker = ReplyTracker::new();
        tracker.start_command(CommandCode::ComQuery as u8);
        let ok = frame(&[0x00, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00]);
        let event = tracker.consume(&ok);
        assert!(event.complete);
        assert!(!event.errored);
        assert!(event
            .server_status
            .unwrap()
            .contains(StatusFlags::SERVER_STATUS_AUTOCOMMIT));
        assert!(tracker.is_idle());
    }

    #[test]
    fn err_reply_completes_with_error() {
        let mut tracker = ReplyTracker::new();
        tracker.start_command(CommandCode::ComQuery as u8);
        let err = frame(&[0xff, 0x48, 0x04, b'#', b'4', b'2', b'S', b'0', b'2', b'n', b'o']);
        let event = tracker.consume(&err);
        assert!(event.complete);
        assert!(event.errored);
    }

    #[test]
    fn result_set_completes_at_final_eof() {
        let mut tracker = ReplyTracker::new();
        tracker.start_command(CommandCode::ComQuery as u8);

        assert!(!tracker.consume(&frame(&[0x01])).complete); // 1 column
        assert!(!tracker.consume(&frame(&[0x03, b'd', b'e', b'f'])).complete); // column def
        assert!(!tracker.consume(&frame(&[0xfe, 0x00, 0x00, 0x02, 0x00])).complete); // EOF
        assert!(!tracker.consume(&frame(&[0x01, b'1'])).complete); // row
        let done = tracker.consume(&frame(&[0xfe, 0x00, 0x00, 0x02, 0x00]));
        assert!(done.complete);
        assert!(tracker.is_idle());
    }

    #[test]
    fn multi_resultset_continues() {
        let mut tracker = ReplyTracker::new();
        tracker.start_command(CommandCode::ComQuery as u8);
        // OK with SERVER_MORE_RESULTS_EXISTS (0x0008)
        let more = frame(&[0x00, 0x00, 0x00, 0x08, 0x00, 0x00, 0x00]);
        assert!(!tracker.consume(&more).complete);
        let done = tracker.consume(&frame(&[0x00, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00]));
        assert!(done.complete);
    }

    #[test]
    fn local_infile_flow() {
        let mut tracker = ReplyTracker::new();
        tracker.start_command(CommandCode::ComQuery as u8);
        let request = frame(&[0xfb, b'x', b'.', b'c', b's', b'v']);
        let event = tracker.consume(&request);
        assert!(event.load_data_requested);
        assert!(!event.complete);
        assert!(tracker.expects_upload());

        tracker.local_infile_done();
        let done = tracker.consume(&frame(&[0x00, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00]));
        assert!(done.complete);
    }

    #[test]
    fn prepare_response_reports_param_count() {
        let mut tracker = ReplyTracker::new();
        tracker.start_command(CommandCode::ComStmtPrepare as u8);
        // status, stmt id 7, 1 column, 2 params, filler, warnings
        let header = frame(&[
            0x00, 0x07, 0x00, 0x00, 0x00, 0x01, 0x00, 0x02, 0x00, 0x00, 0x00, 0x00,
        ]);
        let event = tracker.consume(&header);
        assert_eq!(event.ps_param_count, Some(2));
        assert!(!event.complete);

        // two param defs + EOF, one column def + EOF
        tracker.consume(&frame(&[0x03, b'd', b'e', b'f']));
        tracker.consume(&frame(&[0x03, b'd', b'e', b'f']));
        assert!(!tracker.consume(&frame(&[0xfe, 0x00, 0x00, 0x02, 0x00])).complete);
        tracker.consume(&frame(&[0x03, b'd', b'e', b'f']));
        let done = tracker.consume(&frame(&[0xfe, 0x00, 0x00, 0x02, 0x00]));
        assert!(done.complete);
    }

    #[test]
    fn no_response_commands_stay_idle() {
        let mut tracker = ReplyTracker::new();
        tracker.start_command(CommandCode::ComStmtClose as u8);
        assert!(tracker.is_idle());
    }
}
