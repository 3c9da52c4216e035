use crate::protocol::mysql::constants;

use byteorder::{ByteOrder, LittleEndian};
use std::collections::VecDeque;
use std::io;
use std::io::Write;

/// Buffered outbound bytes for one socket. Payloads are framed on entry
/// (split at the 16M-1 boundary with running sequence numbers) and drained
/// opportunistically whenever the socket is writable.
pub struct WriteQueue {
    chain: VecDeque<Vec<u8>>,
    // read offset into the front segment
    front_offset: usize,
    seq: u8,
    total_queued: u64,
}

impl Default for WriteQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl WriteQueue {
    pub fn new() -> Self {
        WriteQueue {
            chain: VecDeque::new(),
            front_offset: 0,
            seq: 0,
            total_queued: 0,
        }
    }

    pub fn set_seq(&mut self, seq: u8) {
        self.seq = seq;
    }

    pub fn reset_seq(&mut self) {
        self.seq = 0;
    }

    pub fn seq(&self) -> u8 {
        self.seq
    }

    pub fn is_empty(&self) -> bool {
        self.chain.is_empty()
    }

    pub fn queued_bytes(&self) -> usize {
        let mut n: usize = self.chain.iter().map(|s| s.len()).sum();
        n -= self.front_offset;
        n
    }

    pub fn total_queued(&self) -> u64 {
        self.total_queued
    }

    /// Enqueue bytes that are already in wire format (header included).
    pub fn push_wire(&mut self, wire: Vec<u8>) {
        self.total_queued += wire.len() as u64;
        self.chain.push_back(wire);
    }

    /// Frame a payload and enqueue it, splitting at the 16M-1 boundary the
    /// same way the server would.
    pub fn push_payload(&mut self, payload: &[u8]) {
        if payload.is_empty() {
            let mut header = [0u8; constants::PACKET_HEADER_LEN];
            header[3] = self.seq;
            self.seq = self.seq.wrapping_add(1);
            self.push_wire(header.to_vec());
            return;
        }
        for chunk in payload.chunks(constants::MAX_PAYLOAD_LEN) {
            let mut wire = Vec::with_capacity(constants::PACKET_HEADER_LEN + chunk.len());
            let mut header = [0u8; constants::PACKET_HEADER_LEN];
            LittleEndian::write_u24(&mut header, chunk.len() as u32);
            header[3] = self.seq;
            self.seq = self.seq.wrapping_add(1);
            wire.extend_from_slice(&header);
            wire.extend_from_slice(chunk);
            self.push_wire(wire);
        }
    }

    /// Write as much as the socket accepts. Returns `Ok(true)` when the
    /// queue was fully drained, `Ok(false)` when the socket would block
    /// with data still pending.
    pub fn drain<W: Write>(&mut self, w: &mut W) -> io::Result<bool> {
        while let Some(front) = self.chain.front() {
            let remaining = &front[self.front_offset..];
            match w.write(remaining) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "socket accepted zero bytes",
                    ));
                }
                Ok(n) if n == remaining.len() => {
                    self.chain.pop_front();
                    self.front_offset = 0;
                }
                Ok(n) => {
                    self.front_offset += n;
                    return Ok(false);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(false);
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_small_payload() {
        let mut q = WriteQueue::new();
        q.push_payload(&[0x0e]);
        let mut out = Vec::new();
        assert!(q.drain(&mut out).unwrap());
        assert_eq!(out, vec![0x01, 0, 0, 0, 0x0e]);
    }

    #[test]
    fn sequence_numbers_advance() {
        let mut q = WriteQueue::new();
        q.set_seq(3);
        q.push_payload(b"ab");
        q.push_payload(b"cd");
        let mut out = Vec::new();
        q.drain(&mut out).unwrap();
        assert_eq!(out[3], 3);
        assert_eq!(out[9], 4);
    }

    #[test]
    fn splits_at_packet_boundary() {
        let mut q = WriteQueue::new();
        let payload = vec![0u8; constants::MAX_PAYLOAD_LEN + 10];
        q.push_payload(&payload);
        let mut out = Vec::new();
        q.drain(&mut out).unwrap();
        // first header says 16M-1, second says 10
        assert_eq!(&out[..3], &[0xff, 0xff, 0xff]);
        let second_header = &out[4 + constants::MAX_PAYLOAD_LEN..][..4];
        assert_eq!(&second_header[..3], &[10, 0, 0]);
        assert_eq!(second_header[3], 1);
    }

    #[test]
    fn empty_payload_still_framed() {
        let mut q = WriteQueue::new();
        q.set_seq(1);
        q.push_payload(&[]);
        let mut out = Vec::new();
        q.drain(&mut out).unwrap();
        assert_eq!(out, vec![0, 0, 0, 1]);
    }

    struct Throttled {
        out: Vec<u8>,
        budget: usize,
    }

    impl Write for Throttled {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.budget == 0 {
                return Err(io::Error::new(io::ErrorKind::WouldBlock, "full"));
            }
            let n = buf.len().min(self.budget);
            self.out.extend_from_slice(&buf[..n]);
            self.budget -= n;
            Ok(n)
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn partial_drain_resumes() {
        let mut q = WriteQueue::new();
        q.push_payload(b"hello world");
        let mut sink = Throttled {
            out: Vec::new(),
            budget: 7,
        };
        assert!(!q.drain(&mut sink).unwrap());
        assert!(!q.is_empty());
        sink.budget = 64;
        assert!(q.drain(&mut sink).unwrap());
        assert_eq!(&sink.out[4..], b"hello world");
    }
}
