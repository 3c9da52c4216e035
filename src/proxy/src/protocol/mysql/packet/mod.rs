pub mod accumulator;
pub mod write_queue;
pub mod writers;

use crate::protocol::mysql::constants;
use crate::protocol::mysql::constants::HeaderInfo;
use std::ops::Deref;

/// One MySQL wire packet payload together with its sequence number.
/// Payloads larger than 16M arrive split into continuation packets;
/// [`coalesced`] folds such a train back into a single payload.
/// [MySQL Packet](https://dev.mysql.com/doc/dev/mysql-server/latest/page_protocol_basic_packets.html)
#[derive(Clone, Debug)]
pub struct Packet {
    pub seq: u8,
    payload: Vec<u8>,
}

impl Packet {
    pub fn new(seq: u8, payload: Vec<u8>) -> Self {
        Packet { seq, payload }
    }

    fn extend(&mut self, bytes: &[u8]) {
        self.payload.extend(bytes);
    }

    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    /// See [MySQL EOF_Packet](https://dev.mysql.com/doc/dev/mysql-server/latest/page_protocol_basic_eof_packet.html)
    pub fn is_eof_packet(&self) -> bool {
        !self.payload.is_empty()
            && self.payload[0] == (HeaderInfo::EOFHeader as u8)
            && self.payload.len() <= 5
    }

    /// Packet header is 0xfe and the length tells it apart from a real EOF.
    /// See: [MariaDB](https://mariadb.com/kb/en/result-set-packets/)
    pub fn is_result_set_eof_packet(&self) -> bool {
        !self.payload.is_empty()
            && self.payload[0] == (HeaderInfo::EOFHeader as u8)
            && (7..0xFFFFFF).contains(&self.payload.len())
    }

    pub fn is_ok_packet(&self) -> bool {
        !self.payload.is_empty() && self.payload[0] == (HeaderInfo::OKHeader as u8)
    }

    pub fn is_err_packet(&self) -> bool {
        !self.payload.is_empty() && self.payload[0] == (HeaderInfo::ErrHeader as u8)
    }

    pub fn is_local_in_file_packet(&self) -> bool {
        !self.payload.is_empty() && self.payload[0] == (HeaderInfo::LocalInFileHeader as u8)
    }

    /// A payload of exactly 2^24-1 bytes means the next packet continues
    /// this one.
    pub fn is_max_length(&self) -> bool {
        self.payload.len() == constants::MAX_PAYLOAD_LEN
    }
}

impl AsRef<[u8]> for Packet {
    fn as_ref(&self) -> &[u8] {
        &self.payload
    }
}

impl Deref for Packet {
    type Target = [u8];
    fn deref(&self) -> &Self::Target {
        self.as_ref()
    }
}

/// A full 16M-1 payload continuation frame.
#[inline]
pub fn full_frame(i: &[u8]) -> nom::IResult<&[u8], (u8, &[u8])> {
    let (i, _) = nom::bytes::complete::tag(&[0xff, 0xff, 0xff])(i)?;
    let (i, seq) = nom::bytes::complete::take(1u8)(i)?;
    let (i, bytes) = nom::bytes::complete::take(constants::MAX_PAYLOAD_LEN)(i)?;
    Ok((i, (seq[0], bytes)))
}

/// A single frame of any length, header included in the input.
#[inline]
pub fn one_frame(i: &[u8]) -> nom::IResult<&[u8], (u8, &[u8])> {
    let (i, length) = nom::number::complete::le_u24(i)?;
    let (i, seq) = nom::bytes::complete::take(1u8)(i)?;
    let (i, bytes) = nom::bytes::complete::take(length)(i)?;
    Ok((i, (seq[0], bytes)))
}

/// Folds a train of continuation frames and the terminating short frame
/// into one logical packet.
pub fn coalesced(i: &[u8]) -> nom::IResult<&[u8], Packet> {
    nom::combinator::map(
        nom::sequence::pair(
            nom::multi::fold_many0(
                full_frame,
                || (0, None),
                |(seq, pkt): (_, Option<Packet>), (nseq, p)| {
                    let pkt = if let Some(mut pkt) = pkt {
                        assert_eq!(nseq, seq + 1);
                        pkt.extend(p);
                        Some(pkt)
                    } else {
                        Some(Packet::new(nseq, Vec::from(p)))
                    };
                    (nseq, pkt)
                },
            ),
            one_frame,
        ),
        move |(full, last)| {
            if let Some(mut pkt) = full.1 {
                assert_eq!(last.0, full.0 + 1);
                pkt.extend(last.1);
                pkt.seq = last.0;
                pkt
            } else {
                Packet::new(last.0, Vec::from(last.1))
            }
        },
    )(i)
}

#[cfg(test)]
mod tests {
    use crate::protocol::mysql::packet::*;

    #[test]
    fn test_one_ping_frame() {
        let frame = one_frame(&[0x01, 0, 0, 0, 0x10]);
        assert!(frame.is_ok());
        let (rest, (seq, payload)) = frame.unwrap();
        assert!(rest.is_empty());
        assert_eq!(seq, 0);
        assert_eq!(payload, &[0x10]);
    }

    #[test]
    fn test_coalesced_short() {
        let p = coalesced(&[0x01, 0, 0, 0, 0x10]).unwrap().1;
        assert_eq!(p.seq, 0);
        assert_eq!(&*p, &[0x10][..]);
        assert!(!p.is_max_length());
    }

    #[test]
    fn test_coalesced_exact_boundary() {
        let mut data = vec![0xff, 0xff, 0xff, 0];
        data.extend(&[0; constants::MAX_PAYLOAD_LEN][..]);
        data.push(0x00);
        data.push(0x00);
        data.push(0x00);
        data.push(1);

        let (rest, p) = coalesced(&data[..]).unwrap();
        assert!(rest.is_empty());
        assert_eq!(p.seq, 1);
        assert_eq!(p.len(), constants::MAX_PAYLOAD_LEN);
    }

    #[test]
    fn test_coalesced_with_tail() {
        let mut data = vec![0xff, 0xff, 0xff, 0];
        data.extend(&[0; constants::MAX_PAYLOAD_LEN][..]);
        data.push(0x01);
        data.push(0x00);
        data.push(0x00);
        data.push(1);
        data.push(0x10);

        let (rest, p) = coalesced(&data[..]).unwrap();
        assert!(rest.is_empty());
        assert_eq!(p.seq, 1);
        assert_eq!(p.len(), constants::MAX_PAYLOAD_LEN + 1);
        assert_eq!(&p[constants::MAX_PAYLOAD_LEN..], &[0x10]);
    }

    #[test]
    fn test_single_max_frame_flags_continuation() {
        let mut data = vec![0xff, 0xff, 0xff, 0];
        data.extend(&[0; constants::MAX_PAYLOAD_LEN][..]);
        let (rest, (seq, payload)) = one_frame(&data[..]).unwrap();
        assert!(rest.is_empty());
        assert_eq!(seq, 0);
        let pkt = Packet::new(seq, payload.to_vec());
        assert!(pkt.is_max_length());
    }
}
