use crate::protocol::mysql::constants::PACKET_HEADER_LEN;

use std::io;
use std::io::Read;

const READ_CHUNK_SIZE: usize = 4096;
const READ_LARGE_CHUNK_SIZE: usize = 1048576;

/// Outcome of pulling bytes off a non-blocking socket.
#[derive(Debug, PartialEq, Eq)]
pub enum ReadOutcome {
    /// The kernel buffer was drained; nothing left to read right now.
    Drained(usize),
    /// The read stopped early (chunk budget); the caller should ask the
    /// worker for a repeat poll instead of waiting for a fresh event.
    MoreAvailable(usize),
    /// Peer closed the connection.
    Eof,
}

/// Accumulates raw bytes from a non-blocking socket and carves complete
/// MySQL wire frames (header included) out of them. One frame of at most
/// 2^24-1 payload bytes is returned per call; continuation frames of a
/// large packet are returned individually so routing can keep the trailing
/// parts on the target chosen for the first one.
pub struct PacketAccumulator {
    bytes: Vec<u8>,
    start: usize,
}

impl Default for PacketAccumulator {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketAccumulator {
    pub fn new() -> Self {
        PacketAccumulator {
            bytes: Vec::new(),
            start: 0,
        }
    }

    /// Bytes buffered but not yet returned as frames.
    pub fn pending(&self) -> usize {
        self.bytes.len() - self.start
    }

    /// Pull whatever the socket has, up to one large chunk. Returns
    /// `MoreAvailable` if the chunk budget filled up, which the DCB maps
    /// to an INCOMPLETE_READ poll action.
    pub fn read_from<R: Read>(&mut self, r: &mut R) -> io::Result<ReadOutcome> {
        self.compact();

        let mut total = 0usize;
        let mut chunk = READ_CHUNK_SIZE;
        loop {
            let end = self.bytes.len();
            self.bytes.resize(end + chunk, 0);
            match r.read(&mut self.bytes[end..]) {
                Ok(0) => {
                    self.bytes.truncate(end);
                    return if total == 0 {
                        Ok(ReadOutcome::Eof)
                    } else {
                        Ok(ReadOutcome::Drained(total))
                    };
                }
                Ok(n) => {
                    self.bytes.truncate(end + n);
                    total += n;
                    if n < chunk {
                        return Ok(ReadOutcome::Drained(total));
                    }
                    if total >= READ_LARGE_CHUNK_SIZE {
                        return Ok(ReadOutcome::MoreAvailable(total));
                    }
                    // the first read filled its buffer, use a larger one to
                    // reduce the number of syscalls for bulk transfers.
                    chunk = READ_LARGE_CHUNK_SIZE;
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.bytes.truncate(end);
                    return Ok(ReadOutcome::Drained(total));
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {
                    self.bytes.truncate(end);
                    continue;
                }
                Err(e) => {
                    self.bytes.truncate(end);
                    return Err(e);
                }
            }
        }
    }

    /// Feed bytes directly, used by tests and by protocol code that already
    /// owns the data.
    pub fn feed(&mut self, data: &[u8]) {
        self.compact();
        self.bytes.extend_from_slice(data);
    }

    /// Carve the next complete frame, header included. `None` until a full
    /// frame has been buffered.
    pub fn next_frame(&mut self) -> Option<Vec<u8>> {
        let avail = &self.bytes[self.start..];
        if avail.len() < PACKET_HEADER_LEN {
            return None;
        }
        let payload_len =
            u32::from_le_bytes([avail[0], avail[1], avail[2], 0]) as usize;
        let frame_len = PACKET_HEADER_LEN + payload_len;
        if avail.len() < frame_len {
            return None;
        }
        let frame = avail[..frame_len].to_vec();
        self.start += frame_len;
        Some(frame)
    }

    fn compact(&mut self) {
        if self.start > 0 {
            self.bytes.drain(0..self.start);
            self.start = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::mysql::constants::MAX_PAYLOAD_LEN;

    #[test]
    fn carves_single_frame() {
        let mut acc = PacketAccumulator::new();
        acc.feed(&[0x01, 0, 0, 0, 0x0e]);
        let frame = acc.next_frame().unwrap();
        assert_eq!(frame, vec![0x01, 0, 0, 0, 0x0e]);
        assert!(acc.next_frame().is_none());
        assert_eq!(acc.pending(), 0);
    }

    #[test]
    fn waits_for_full_frame() {
        let mut acc = PacketAccumulator::new();
        acc.feed(&[0x05, 0, 0, 0, 0x03]);
        assert!(acc.next_frame().is_none());
        acc.feed(b"SELE");
        let frame = acc.next_frame().unwrap();
        assert_eq!(&frame[4..], b"\x03SELE");
    }

    #[test]
    fn carves_continuation_frames_separately() {
        let mut acc = PacketAccumulator::new();
        let mut wire = vec![0xff, 0xff, 0xff, 0];
        wire.extend(std::iter::repeat(0u8).take(MAX_PAYLOAD_LEN));
        wire.extend(&[0x03, 0, 0, 1, b'a', b'b', b'c']);
        acc.feed(&wire);

        let first = acc.next_frame().unwrap();
        assert_eq!(first.len(), 4 + MAX_PAYLOAD_LEN);
        let second = acc.next_frame().unwrap();
        assert_eq!(&second[4..], b"abc");
        assert!(acc.next_frame().is_none());
    }

    #[test]
    fn two_pipelined_frames() {
        let mut acc = PacketAccumulator::new();
        acc.feed(&[0x01, 0, 0, 0, 0x0e, 0x01, 0, 0, 0, 0x01]);
        assert_eq!(acc.next_frame().unwrap()[4], 0x0e);
        assert_eq!(acc.next_frame().unwrap()[4], 0x01);
    }
}
