use num_derive::{FromPrimitive, ToPrimitive};
use std::collections::HashMap;
use strum_macros::AsRefStr;

// see: https://dev.mysql.com/doc/dev/mysql-server/latest/page_protocol_basic_packets.html
// max packet payload length.
pub const MAX_PAYLOAD_LEN: usize = 16_777_215;

pub const PACKET_HEADER_LEN: usize = 4;

/// auth-plugin-data-part-1 + auth-plugin-data-part-2, the random bytes used
/// for password scrambling during the handshake.
pub const SCRAMBLE_SIZE: usize = 20;

/// Offset of the 4-byte statement id inside any COM_STMT_* packet,
/// counted from the start of the packet including the header.
pub const PS_ID_OFFSET: usize = PACKET_HEADER_LEN + 1;

/// Offset of the 2-byte parameter count inside a COM_STMT_PREPARE OK
/// response packet.
pub const PS_PARAMS_OFFSET: usize = PACKET_HEADER_LEN + 7;

/// MariaDB lets a client execute the most recently prepared statement
/// without knowing its id by sending this sentinel instead.
pub const PS_DIRECT_EXEC_ID: u32 = 0xffff_ffff;

#[derive(Debug, PartialEq, AsRefStr)]
pub enum AuthPluginName {
    #[strum(serialize = "mysql_old_password")]
    AuthMySQlOldPassword,
    #[strum(serialize = "caching_sha2_password")]
    AuthCachingSha2Password,
    #[strum(serialize = "sha256_password")]
    AuthSha256Password,
    #[strum(serialize = "mysql_native_password")]
    AuthNativePassword,
    #[strum(serialize = "client_ed25519")]
    AuthEd25519,
    #[strum(serialize = "auth_unknown_plugin")]
    UnKnowPluginName,
}

#[derive(Debug, PartialEq, ToPrimitive, FromPrimitive)]
#[repr(u8)]
pub enum HeaderInfo {
    OKHeader = 0x00,
    ErrHeader = 0xff,
    EOFHeader = 0xfe,
    LocalInFileHeader = 0xfb,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash, FromPrimitive, ToPrimitive)]
#[repr(u8)]
pub enum CommandCode {
    ComSleep = 0,
    ComQuit,
    ComInitDB,
    ComQuery,
    ComFieldList,
    ComCreateDB,
    ComDropDB,
    ComRefresh,
    ComShutdown,
    ComStatistics,
    ComProcessInfo,
    ComConnect,
    ComProcessKill,
    ComDebug,
    ComPing,
    ComTime,
    ComDelayedInsert,
    ComChangeUser,
    ComBinlogDump,
    ComTableDump,
    ComConnectOut,
    ComRegisterSlave,
    ComStmtPrepare,
    ComStmtExecute,
    ComStmtSendLongData,
    ComStmtClose,
    ComStmtReset,
    ComSetOption,
    ComStmtFetch,
    ComDaemon,
    ComBinlogDumpGtid,
    ComResetConnection,
    ComStmtBulkExecute = 0xfa,
    ComEnd = 0xfb,
}

impl CommandCode {
    /// Commands that carry a binary prepared-statement id in their payload.
    pub fn is_ps_command(cmd: u8) -> bool {
        cmd == CommandCode::ComStmtExecute as u8
            || cmd == CommandCode::ComStmtBulkExecute as u8
            || cmd == CommandCode::ComStmtSendLongData as u8
            || cmd == CommandCode::ComStmtClose as u8
            || cmd == CommandCode::ComStmtFetch as u8
            || cmd == CommandCode::ComStmtReset as u8
    }
}

/// Command code to name map, used for per-command metric labels.
#[inline]
pub fn all_sql_com() -> &'static HashMap<u8, &'static str> {
    static SQL_COM: std::sync::OnceLock<HashMap<u8, &'static str>> = std::sync::OnceLock::new();
    SQL_COM.get_or_init(|| {
        HashMap::from([
            (0_u8, "ComSleep"),
            (1_u8, "ComQuit"),
            (2_u8, "ComInitDB"),
            (3_u8, "ComQuery"),
            (4_u8, "ComFieldList"),
            (5_u8, "ComCreateDB"),
            (6_u8, "ComDropDB"),
            (7_u8, "ComRefresh"),
            (8_u8, "ComShutdown"),
            (9_u8, "ComStatistics"),
            (10_u8, "ComProcessInfo"),
            (11_u8, "ComConnect"),
            (12_u8, "ComProcessKill"),
            (13_u8, "ComDebug"),
            (14_u8, "ComPing"),
            (15_u8, "ComTime"),
            (16_u8, "ComDelayedInsert"),
            (17_u8, "ComChangeUser"),
            (18_u8, "ComBinlogDump"),
            (19_u8, "ComTableDump"),
            (20_u8, "ComConnectOut"),
            (21_u8, "ComRegisterSlave"),
            (22_u8, "ComStmtPrepare"),
            (23_u8, "ComStmtExecute"),
            (24_u8, "ComStmtSendLongData"),
            (25_u8, "ComStmtClose"),
            (26_u8, "ComStmtReset"),
            (27_u8, "ComSetOption"),
            (28_u8, "ComStmtFetch"),
            (29_u8, "ComDaemon"),
            (30_u8, "ComBinlogDumpGtid"),
            (31_u8, "ComResetConnection"),
            (0xfa_u8, "ComStmtBulkExecute"),
            (0xfb_u8, "ComEnd"),
        ])
    })
}

pub fn com_name(cmd: u8) -> &'static str {
    all_sql_com().get(&cmd).copied().unwrap_or("ComUnknown")
}

#[cfg(test)]
mod test {
    use crate::protocol::mysql::constants::*;
    use num_traits::FromPrimitive;

    #[test]
    pub fn max_packet_size_test() {
        let max_u24_size = 16_777_215;
        assert_eq!(max_u24_size, MAX_PAYLOAD_LEN);
    }

    #[test]
    pub fn test_common_info_code() {
        let com_info = CommandCode::ComQuery as u8;
        assert_eq!(com_info, 3);
        assert_eq!(CommandCode::from_u8(22), Some(CommandCode::ComStmtPrepare));
    }

    #[test]
    pub fn test_ps_commands() {
        assert!(CommandCode::is_ps_command(CommandCode::ComStmtExecute as u8));
        assert!(CommandCode::is_ps_command(CommandCode::ComStmtFetch as u8));
        assert!(!CommandCode::is_ps_command(CommandCode::ComQuery as u8));
    }
}
