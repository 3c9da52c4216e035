use crate::protocol::mysql::constants::CommandCode as ComInfo;
use crate::protocol::mysql::constants::{PACKET_HEADER_LEN, PS_ID_OFFSET, PS_PARAMS_OFFSET};

use hashbrown::HashMap;
use mysql_common::constants::{CapabilityFlags, StatusFlags};
use winnow::binary::{le_u16, le_u32, le_u8};
use winnow::combinator::{alt, preceded, rest};
use winnow::prelude::*;
use winnow::token::{literal, take, take_until};
use winnow::{Parser, Partial};

/// A decoded client command packet.
#[derive(Debug, PartialEq, Eq)]
pub enum Command<'a> {
    Query(&'a [u8]),
    ListFields(&'a [u8]),
    Close(u32),
    Prepare(&'a [u8]),
    Init(&'a [u8]),
    Execute {
        stmt: u32,
        params: &'a [u8],
    },
    SendLongData {
        stmt: u32,
        param: u16,
        data: &'a [u8],
    },
    Fetch {
        stmt: u32,
        rows: u32,
    },
    Ping,
    Quit,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OkPacket {
    /// header
    pub header: u8,
    /// affected rows in update/insert
    pub affected_rows: u64,
    /// insert_id in update/insert
    pub last_insert_id: u64,
    /// StatusFlags associated with this query
    pub status_flags: StatusFlags,
    /// Warnings
    pub warnings: u16,
    /// Extra information
    pub info: String,
    /// session state change information
    pub session_state_info: String,
}

/// `HandshakeResponse` represents the client's reply to the initial
/// handshake packet.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct HandshakeResponse {
    pub client_flag: CapabilityFlags,
    pub max_packet_len: u32,
    pub collation: u16,
    pub username: Option<Vec<u8>>,
    pub auth_response: Vec<u8>,
    pub auth_plugin: Vec<u8>,
    pub database: Option<Vec<u8>>,
    pub connect_attributes: Option<HashMap<String, String>>,
}

impl HandshakeResponse {
    pub fn user_string(&self) -> String {
        match &self.username {
            Some(username) => String::from_utf8_lossy(username).to_string(),
            None => "_NONE".to_string(),
        }
    }

    pub fn database_string(&self) -> Option<String> {
        self.database
            .as_ref()
            .map(|db| String::from_utf8_lossy(db).to_string())
    }

    pub fn multi_statements_allowed(&self) -> bool {
        self.client_flag
            .contains(CapabilityFlags::CLIENT_MULTI_STATEMENTS)
    }
}

/// Command byte of a wire frame (header included), if the payload is not
/// empty.
#[inline]
pub fn wire_command(wire: &[u8]) -> Option<u8> {
    wire.get(PACKET_HEADER_LEN).copied()
}

/// Statement id of a COM_STMT_* wire frame. All of them keep the 4-byte id
/// in the same place.
pub fn extract_ps_id(wire: &[u8]) -> u32 {
    if wire.len() >= PS_ID_OFFSET + 4 {
        u32::from_le_bytes([
            wire[PS_ID_OFFSET],
            wire[PS_ID_OFFSET + 1],
            wire[PS_ID_OFFSET + 2],
            wire[PS_ID_OFFSET + 3],
        ])
    } else {
        0
    }
}

/// Parameter count carried in a COM_STMT_PREPARE OK response frame.
pub fn extract_ps_param_count(wire: &[u8]) -> u16 {
    if wire.len() >= PS_PARAMS_OFFSET + 2 {
        u16::from_le_bytes([wire[PS_PARAMS_OFFSET], wire[PS_PARAMS_OFFSET + 1]])
    } else {
        0
    }
}

fn read_length_encoded_string(i: &[u8]) -> IResult<&[u8], &[u8]> {
    let (input, len) = read_length_encoded_number(i)?;
    take(len).parse_peek(input)
}

pub fn read_length_encoded_number(i: &[u8]) -> IResult<&[u8], u64> {
    let (i, b) = le_u8.parse_peek(i)?;
    let r_size: usize = match b {
        0xfb => return Ok((i, 0)),
        0xfc => 2,
        0xfd => 3,
        0xfe => 8,
        _ => return Ok((i, b as u64)),
    };
    let mut bytes = [0u8; 8];
    let (i, b) = take(r_size).parse_peek(i)?;
    bytes[..r_size].copy_from_slice(b);
    Ok((i, u64::from_le_bytes(bytes)))
}

pub fn ok_packet(i: &[u8], capabilities: CapabilityFlags) -> winnow::IResult<&[u8], OkPacket> {
    let (i, header) = le_u8.parse_peek(i)?;
    let (i, affected_rows) = read_length_encoded_number(i)?;
    let (i, last_insert_id) = read_length_encoded_number(i)?;
    let (i, status_flags_value) = le_u16.parse_peek(i)?;

    let status_flags = StatusFlags::from_bits_retain(status_flags_value);
    let (i, warnings) = le_u16.parse_peek(i)?;
    let (info, session_state_info) =
        if !i.is_empty() && capabilities.contains(CapabilityFlags::CLIENT_SESSION_TRACK) {
            let (i, info_size) = read_length_encoded_number(i)?;
            let (i, info) = take(info_size).parse_peek(i)?;

            let session_state_info =
                if status_flags.contains(StatusFlags::SERVER_SESSION_STATE_CHANGED) {
                    let (i, s_t_size) = read_length_encoded_number(i)?;
                    let (_i, session_state_info) = take(s_t_size).parse_peek(i)?;
                    std::str::from_utf8(session_state_info).unwrap_or("")
                } else {
                    ""
                };
            (
                std::str::from_utf8(info).unwrap_or("").to_string(),
                session_state_info.to_string(),
            )
        } else {
            ("".to_string(), "".to_string())
        };

    Ok((
        i,
        OkPacket {
            header,
            affected_rows,
            last_insert_id,
            status_flags,
            warnings,
            info,
            session_state_info,
        },
    ))
}

pub fn client_handshake_response(i: &[u8]) -> IResult<&[u8], HandshakeResponse> {
    let (i, capability_flags) = le_u16.parse_peek(i)?;
    let mut capabilities = CapabilityFlags::from_bits_truncate(capability_flags as u32);
    if capabilities.contains(CapabilityFlags::CLIENT_PROTOCOL_41) {
        // HandshakeResponse41
        let (i, cap2) = le_u16.parse_peek(i)?;
        let cap = (cap2 as u32) << 16 | capability_flags as u32;

        capabilities = CapabilityFlags::from_bits_truncate(cap);

        let (i, max_packet_len) = le_u32.parse_peek(i)?;
        let (i, collation) = take(1u8).parse_peek(i)?;

        let (i, _) = take(23u8).parse_peek(i)?;

        let (i, username) = {
            let (i, user) = take_until(1.., "\0").parse_peek(i)?;
            let (i, _) = literal(b"\0").parse_peek(i)?;
            (i, Some(user.to_owned()))
        };
        let (i, auth_response) =
            if capabilities.contains(CapabilityFlags::CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA) {
                let (i, size) = read_length_encoded_number(i)?;
                take(size).parse_peek(i)?
            } else if capabilities.contains(CapabilityFlags::CLIENT_SECURE_CONNECTION) {
                let (i, size) = le_u8.parse_peek(i)?;
                take(size).parse_peek(i)?
            } else {
                take_until(1.., "\0").parse_peek(i)?
            };

        let (i, db) =
            if capabilities.contains(CapabilityFlags::CLIENT_CONNECT_WITH_DB) && !i.is_empty() {
                let (i, db) = take_until(1.., "\0").parse_peek(i)?;
                let (i, _) = literal(b"\0").parse_peek(i)?;
                (i, Some(db))
            } else {
                (i, None)
            };

        let (i, auth_plugin) =
            if capabilities.contains(CapabilityFlags::CLIENT_PLUGIN_AUTH) && !i.is_empty() {
                let (i, auth_plugin) = take_until(1.., "\0").parse_peek(i)?;

                let (i, _) = literal("\0").parse_peek(i)?;
                (i, auth_plugin)
            } else {
                (i, &b""[..])
            };

        let (i, connect_attributes) =
            if capabilities.contains(CapabilityFlags::CLIENT_CONNECT_ATTRS) && !i.is_empty() {
                let (i, data_len) = read_length_encoded_number(i)?;
                let (i, data) = take(data_len).parse_peek(i)?;
                let mut input = data;
                let mut connect_attributes = HashMap::new();
                while !input.is_empty() {
                    let (remaining, k) = read_length_encoded_string(input)?;
                    let (remaining, v) = read_length_encoded_string(remaining)?;
                    let conn_attr_key = String::from_utf8_lossy(k).to_string();
                    let conn_attr_val = String::from_utf8_lossy(v).to_string();
                    connect_attributes.insert(conn_attr_key, conn_attr_val);
                    input = remaining;
                }
                (i, Some(connect_attributes))
            } else {
                (i, None)
            };

        Ok((
            i,
            HandshakeResponse {
                client_flag: capabilities,
                max_packet_len,
                collation: u16::from(collation[0]),
                username,
                auth_response: auth_response.to_vec(),
                auth_plugin: auth_plugin.to_vec(),
                database: db.map(|c| c.to_vec()),
                connect_attributes,
            },
        ))
    } else {
        // HandshakeResponse320
        let (i, max_packet_len_v1) = le_u16.parse_peek(i)?;
        let (i, max_packet_len_v2) = le_u8.parse_peek(i)?;
        let max_packet_len = (max_packet_len_v2 as u32) << 16 | max_packet_len_v1 as u32;
        let (i, username) = take_until(1.., "\0").parse_peek(i)?;
        let (i, _) = literal(b"\0").parse_peek(i)?;

        Ok((
            &b""[..],
            HandshakeResponse {
                client_flag: capabilities,
                max_packet_len,
                collation: 0,
                username: Some(username.to_vec()),
                auth_response: i.to_vec(),
                auth_plugin: vec![],
                database: None,
                connect_attributes: None,
            },
        ))
    }
}

/// The server's initial handshake, reduced to what a connecting proxy
/// needs: the scramble and the announced auth plugin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerHandshake {
    pub protocol_version: u8,
    pub server_version: Vec<u8>,
    pub connection_id: u32,
    pub scramble: Vec<u8>,
    pub capabilities: CapabilityFlags,
    pub auth_plugin: Vec<u8>,
}

pub fn server_handshake(i: &[u8]) -> IResult<&[u8], ServerHandshake> {
    let (i, protocol_version) = le_u8.parse_peek(i)?;
    let (i, server_version) = take_until(0.., "\0").parse_peek(i)?;
    let (i, _) = literal(b"\0").parse_peek(i)?;
    let (i, connection_id) = le_u32.parse_peek(i)?;
    let (i, auth_part_1) = take(8u8).parse_peek(i)?;
    let (i, _filler) = le_u8.parse_peek(i)?;
    let (i, caps_low) = le_u16.parse_peek(i)?;
    let (i, _charset) = le_u8.parse_peek(i)?;
    let (i, _status) = le_u16.parse_peek(i)?;
    let (i, caps_high) = le_u16.parse_peek(i)?;
    let (i, auth_len) = le_u8.parse_peek(i)?;
    let (i, _reserved) = take(10u8).parse_peek(i)?;

    let capabilities =
        CapabilityFlags::from_bits_truncate(((caps_high as u32) << 16) | caps_low as u32);

    let mut scramble = auth_part_1.to_vec();
    let mut rest = i;
    if capabilities.contains(CapabilityFlags::CLIENT_SECURE_CONNECTION) {
        // part 2 is max(13, auth_len - 8) bytes, NUL terminated
        let part2_len = std::cmp::max(13, auth_len.saturating_sub(8)) as usize;
        let (i, part2) = take(part2_len.min(rest.len())).parse_peek(rest)?;
        let end = part2.iter().position(|b| *b == 0).unwrap_or(part2.len());
        scramble.extend_from_slice(&part2[..end]);
        rest = i;
    }

    let auth_plugin = if capabilities.contains(CapabilityFlags::CLIENT_PLUGIN_AUTH) {
        let end = rest.iter().position(|b| *b == 0).unwrap_or(rest.len());
        rest[..end].to_vec()
    } else {
        Vec::new()
    };

    Ok((
        &b""[..],
        ServerHandshake {
            protocol_version,
            server_version: server_version.to_vec(),
            connection_id,
            scramble,
            capabilities,
            auth_plugin,
        },
    ))
}

fn send_long_data(i: Partial<&[u8]>) -> IResult<Partial<&[u8]>, Command<'_>> {
    let (remaining, stmt) = le_u32.parse_peek(i)?;
    let (remaining, param) = le_u16.parse_peek(remaining)?;
    let data = *remaining;
    Ok((remaining, Command::SendLongData { stmt, param, data }))
}

fn execute(i: Partial<&[u8]>) -> IResult<Partial<&[u8]>, Command<'_>> {
    let (remaining, stmt) = le_u32.parse_peek(i)?;
    let (remaining, _flags) = take(1u8).parse_peek(remaining)?;
    let (remaining, _iterations) = le_u32.parse_peek(remaining)?;
    let params = *remaining;
    Ok((remaining, Command::Execute { stmt, params }))
}

fn fetch(i: Partial<&[u8]>) -> IResult<Partial<&[u8]>, Command<'_>> {
    let (remaining, stmt) = le_u32.parse_peek(i)?;
    let (remaining, rows) = le_u32.parse_peek(remaining)?;
    Ok((remaining, Command::Fetch { stmt, rows }))
}

fn close(i: Partial<&[u8]>) -> IResult<Partial<&[u8]>, Command<'_>> {
    let (remaining, stmt) = le_u32.parse_peek(i)?;
    Ok((remaining, Command::Close(stmt)))
}

/// Decode a client command from a packet payload (no wire header).
pub fn from_packet(pkt: &[u8]) -> IResult<Partial<&[u8]>, Command<'_>> {
    alt((
        preceded(literal([ComInfo::ComQuery as u8]), rest).map(Command::Query),
        preceded(literal([ComInfo::ComFieldList as u8]), rest).map(Command::ListFields),
        preceded(literal([ComInfo::ComInitDB as u8]), rest).map(Command::Init),
        preceded(literal([ComInfo::ComStmtPrepare as u8]), rest).map(Command::Prepare),
        preceded(
            literal([ComInfo::ComStmtExecute as u8]),
            winnow::unpeek(execute),
        ),
        preceded(
            literal([ComInfo::ComStmtSendLongData as u8]),
            winnow::unpeek(send_long_data),
        ),
        preceded(
            literal([ComInfo::ComStmtFetch as u8]),
            winnow::unpeek(fetch),
        ),
        preceded(
            literal([ComInfo::ComStmtClose as u8]),
            winnow::unpeek(close),
        ),
        literal([ComInfo::ComPing as u8]).map(|_| Command::Ping),
        literal([ComInfo::ComQuit as u8]).map(|_| Command::Quit),
    ))
    .parse_peek(Partial::new(pkt))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ps_id_extraction() {
        // COM_STMT_EXECUTE, stmt id 7
        let wire = [
            0x0a, 0x00, 0x00, 0x00, 0x17, 0x07, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00,
        ];
        assert_eq!(wire_command(&wire), Some(0x17));
        assert_eq!(extract_ps_id(&wire), 7);
    }

    #[test]
    fn test_ps_param_count_extraction() {
        // COM_STMT_PREPARE response: status 0, stmt id 7, 1 column, 2 params
        let wire = [
            0x0c, 0x00, 0x00, 0x01, 0x00, 0x07, 0x00, 0x00, 0x00, 0x01, 0x00, 0x02, 0x00, 0x00,
            0x00, 0x00,
        ];
        assert_eq!(extract_ps_id(&wire), 7);
        assert_eq!(extract_ps_param_count(&wire), 2);
    }

    #[test]
    fn test_command_query() {
        let payload = b"\x03SELECT 1";
        match from_packet(payload) {
            Ok((_, Command::Query(sql))) => assert_eq!(sql, b"SELECT 1"),
            other => panic!("unexpected parse {other:?}"),
        }
    }

    #[test]
    fn test_command_execute() {
        let mut payload = vec![ComInfo::ComStmtExecute as u8];
        payload.extend(7u32.to_le_bytes());
        payload.push(0);
        payload.extend(1u32.to_le_bytes());
        match from_packet(&payload) {
            Ok((_, Command::Execute { stmt, .. })) => assert_eq!(stmt, 7),
            other => panic!("unexpected parse {other:?}"),
        }
    }

    #[test]
    fn test_ok_packet_in_trans() {
        // header 0, 0 rows, 0 insert id, SERVER_STATUS_IN_TRANS, no warnings
        let payload = [0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00];
        let (_, ok) = ok_packet(&payload, CapabilityFlags::CLIENT_PROTOCOL_41).unwrap();
        assert!(ok
            .status_flags
            .contains(StatusFlags::SERVER_STATUS_IN_TRANS));
    }

    #[test]
    fn test_server_handshake_round_trip() {
        use crate::protocol::mysql::constants::AuthPluginName;
        use crate::protocol::mysql::packet::writers;

        let mut scramble = [0u8; 20];
        for (i, b) in scramble.iter_mut().enumerate() {
            *b = 33 + i as u8;
        }
        let caps = CapabilityFlags::CLIENT_PROTOCOL_41
            | CapabilityFlags::CLIENT_SECURE_CONNECTION
            | CapabilityFlags::CLIENT_PLUGIN_AUTH;
        let payload = writers::initial_handshake(
            42,
            b"8.0.34-test",
            &scramble,
            caps,
            &AuthPluginName::AuthNativePassword,
        );
        let (_, parsed) = server_handshake(&payload).unwrap();
        assert_eq!(parsed.protocol_version, 10);
        assert_eq!(parsed.connection_id, 42);
        assert_eq!(parsed.scramble, scramble.to_vec());
        assert_eq!(parsed.auth_plugin, b"mysql_native_password".to_vec());
    }

    #[test]
    fn test_handshake_parse() {
        let mut data = Vec::new();
        let caps = CapabilityFlags::CLIENT_PROTOCOL_41
            | CapabilityFlags::CLIENT_SECURE_CONNECTION
            | CapabilityFlags::CLIENT_CONNECT_WITH_DB;
        data.extend((caps.bits() as u32).to_le_bytes());
        data.extend(16777216u32.to_le_bytes());
        data.push(0x21);
        data.extend([0u8; 23]);
        data.extend(b"app_user\0");
        data.push(20);
        data.extend([0xaa; 20]);
        data.extend(b"orders\0");
        let (_, rsp) = client_handshake_response(&data).unwrap();
        assert_eq!(rsp.user_string(), "app_user");
        assert_eq!(rsp.database_string().as_deref(), Some("orders"));
        assert_eq!(rsp.auth_response.len(), 20);
    }
}
