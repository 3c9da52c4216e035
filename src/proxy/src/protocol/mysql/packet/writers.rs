use crate::protocol::mysql::constants::{AuthPluginName, SCRAMBLE_SIZE};
use crate::protocol::mysql::error_codes::ErrorKind;

use byteorder::{LittleEndian, WriteBytesExt};
use mysql_common::constants::{CapabilityFlags, StatusFlags};
use mysql_common::io::WriteMysqlExt;
use std::io::Write;

pub const AUTH_SWITCH_REQUEST: u8 = 0xfe;

/// ERR_Packet payload.
/// See [ERR_Packet](https://dev.mysql.com/doc/dev/mysql-server/latest/page_protocol_basic_err_packet.html)
pub fn err_packet(err: ErrorKind, msg: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(9 + msg.len());
    payload.write_u8(0xff).unwrap();
    payload.write_u16::<LittleEndian>(err as u16).unwrap();
    payload.write_u8(b'#').unwrap();
    payload.write_all(err.sqlstate()).unwrap();
    payload.write_all(msg).unwrap();
    payload
}

/// OK_Packet payload with no affected rows.
pub fn ok_packet(status: StatusFlags) -> Vec<u8> {
    let mut payload = Vec::with_capacity(11);
    payload.write_u8(0x00).unwrap();
    payload.write_lenenc_int(0).unwrap(); // affected rows
    payload.write_lenenc_int(0).unwrap(); // last insert id
    payload.write_u16::<LittleEndian>(status.bits()).unwrap();
    payload.write_all(&[0x00, 0x00]).unwrap(); // no warnings
    payload
}

pub fn eof_packet(status: StatusFlags) -> Vec<u8> {
    let mut payload = Vec::with_capacity(5);
    payload.write_all(&[0xfe, 0x00, 0x00]).unwrap();
    payload.write_u16::<LittleEndian>(status.bits()).unwrap();
    payload
}

/// AuthSwitchRequest payload: 0xfe + plugin name NUL + scramble.
pub fn auth_switch_request(plugin: &AuthPluginName, scramble: &[u8]) -> Vec<u8> {
    let name = plugin.as_ref().as_bytes();
    let mut payload = Vec::with_capacity(2 + name.len() + scramble.len());
    payload.push(AUTH_SWITCH_REQUEST);
    payload.extend_from_slice(name);
    payload.push(0);
    payload.extend_from_slice(scramble);
    payload.push(0);
    payload
}

/// Initial handshake (protocol v10) sent to a connecting client.
pub fn initial_handshake(
    conn_id: u32,
    server_version: &[u8],
    scramble: &[u8; SCRAMBLE_SIZE],
    capabilities: CapabilityFlags,
    default_auth_plugin: &AuthPluginName,
) -> Vec<u8> {
    let mut payload = Vec::with_capacity(128);
    payload.write_u8(10).unwrap(); // protocol version
    payload.write_all(server_version).unwrap();
    payload.write_u8(0).unwrap();
    payload.write_u32::<LittleEndian>(conn_id).unwrap();
    payload.write_all(&scramble[..8]).unwrap(); // auth-plugin-data-part-1
    payload.write_u8(0).unwrap(); // filler
    payload
        .write_u16::<LittleEndian>((capabilities.bits() & 0xffff) as u16)
        .unwrap();
    payload.write_u8(0x21).unwrap(); // utf8_general_ci
    payload
        .write_u16::<LittleEndian>(StatusFlags::SERVER_STATUS_AUTOCOMMIT.bits())
        .unwrap();
    payload
        .write_u16::<LittleEndian>((capabilities.bits() >> 16) as u16)
        .unwrap();
    payload.write_u8((SCRAMBLE_SIZE + 1) as u8).unwrap();
    payload.write_all(&[0u8; 10]).unwrap(); // reserved
    payload.write_all(&scramble[8..]).unwrap(); // auth-plugin-data-part-2
    payload.write_u8(0).unwrap();
    payload
        .write_all(default_auth_plugin.as_ref().as_bytes())
        .unwrap();
    payload.write_u8(0).unwrap();
    payload
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn err_packet_shape() {
        let payload = err_packet(ErrorKind::ErrSyntax, b"bad statement");
        assert_eq!(payload[0], 0xff);
        assert_eq!(u16::from_le_bytes([payload[1], payload[2]]), 1064);
        assert_eq!(payload[3], b'#');
        assert_eq!(&payload[4..9], b"42000");
        assert_eq!(&payload[9..], b"bad statement");
    }

    #[test]
    fn ok_packet_shape() {
        let payload = ok_packet(StatusFlags::SERVER_STATUS_AUTOCOMMIT);
        assert_eq!(payload[0], 0x00);
        assert_eq!(payload.len(), 7);
    }

    #[test]
    fn auth_switch_shape() {
        let scramble = [7u8; 20];
        let payload = auth_switch_request(&AuthPluginName::AuthNativePassword, &scramble);
        assert_eq!(payload[0], AUTH_SWITCH_REQUEST);
        let name_end = payload[1..].iter().position(|b| *b == 0).unwrap() + 1;
        assert_eq!(&payload[1..name_end], b"mysql_native_password");
        assert_eq!(&payload[name_end + 1..payload.len() - 1], &scramble[..]);
    }

    #[test]
    fn handshake_carries_full_scramble() {
        let scramble = [3u8; 20];
        let payload = initial_handshake(
            8,
            b"8.0.34-proxy",
            &scramble,
            CapabilityFlags::CLIENT_PROTOCOL_41,
            &AuthPluginName::AuthNativePassword,
        );
        assert_eq!(payload[0], 10);
        // part 1 follows version string + NUL + conn id
        let part1_at = 1 + b"8.0.34-proxy".len() + 1 + 4;
        assert_eq!(&payload[part1_at..part1_at + 8], &scramble[..8]);
    }
}
