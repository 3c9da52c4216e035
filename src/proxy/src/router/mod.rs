pub mod ps;
pub mod rwsplit;
pub mod trx;

use crate::buffer::{Buffer, Hint, HintKind};
use crate::classifier::{Operation, Parser, TypeMask};
use crate::protocol::mysql::basic::extract_ps_id;
use crate::protocol::mysql::constants::{CommandCode, PACKET_HEADER_LEN, PS_DIRECT_EXEC_ID};
use crate::router::ps::{PsLogVerbosity, PsManager};
use crate::router::trx::TrxTracker;

use bitflags::bitflags;
use hashbrown::HashSet;
use mysql_common::constants::StatusFlags;
use std::rc::Rc;
use tracing::{debug, error, info, warn};

bitflags! {
    /// Destination categories a statement may be routed to. A value is a
    /// mask: SLAVE|RLAG_MAX means "a slave within the lag bound".
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct RouteTarget: u32 {
        const MASTER       = 1 << 0;
        const SLAVE        = 1 << 1;
        const NAMED_SERVER = 1 << 2;
        const ALL          = 1 << 3;
        const RLAG_MAX     = 1 << 4;
        const LAST_USED    = 1 << 5;
    }
}

impl RouteTarget {
    pub const UNDEFINED: RouteTarget = RouteTarget::empty();
}

/// Where writable user variables may be routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UseSqlVariablesIn {
    #[default]
    Master,
    All,
}

/// Whether the session's current target is already pinned to the master.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CurrentTarget {
    Undefined,
    Master,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadDataState {
    #[default]
    Inactive,
    Active,
    End,
}

/// The routing decision for one statement, plus the sticky state that
/// outlives it (load-data mode, large-packet chaining, temp tables).
#[derive(Debug, Clone, Default)]
pub struct RouteInfo {
    target: RouteTarget,
    command: u8,
    type_mask: TypeMask,
    stmt_id: u32,
    ps_continuation: bool,
    load_data_state: LoadDataState,
    load_data_sent: u64,
    large_query: bool,
    multi_part_packet: bool,
    trx_still_read_only: bool,
    tmp_tables: HashSet<String>,
}

impl RouteInfo {
    pub fn target(&self) -> RouteTarget {
        self.target
    }

    pub fn command(&self) -> u8 {
        self.command
    }

    pub fn type_mask(&self) -> TypeMask {
        self.type_mask
    }

    pub fn stmt_id(&self) -> u32 {
        self.stmt_id
    }

    pub fn is_ps_continuation(&self) -> bool {
        self.ps_continuation
    }

    pub fn load_data_state(&self) -> LoadDataState {
        self.load_data_state
    }

    pub fn load_data_active(&self) -> bool {
        self.load_data_state == LoadDataState::Active
    }

    pub fn load_data_sent(&self) -> u64 {
        self.load_data_sent
    }

    /// True when this decision covers the trailing frame of a >16MiB
    /// statement and was therefore returned unchanged.
    pub fn multi_part_packet(&self) -> bool {
        self.multi_part_packet
    }

    pub fn large_query(&self) -> bool {
        self.large_query
    }

    /// The whole transaction so far, BEGIN included, has been read-only.
    pub fn trx_still_read_only(&self) -> bool {
        self.trx_still_read_only
    }

    pub fn have_tmp_tables(&self) -> bool {
        !self.tmp_tables.is_empty()
    }

    pub fn is_tmp_table(&self, table: &str) -> bool {
        self.tmp_tables.contains(table)
    }

    pub fn add_tmp_table(&mut self, table: String) {
        self.tmp_tables.insert(table);
    }

    pub fn remove_tmp_table(&mut self, table: &str) {
        self.tmp_tables.remove(table);
    }

    pub fn set_target(&mut self, target: RouteTarget) {
        self.target = target;
    }
}

/// Router-side capabilities the state machine consults while deciding.
pub trait Handler {
    /// Pin the session to the master. Returns false when no master is
    /// available, in which case the statement classifies as a write and
    /// error handling takes over at dispatch.
    fn lock_to_master(&mut self) -> bool;
    fn is_locked_to_master(&self) -> bool;
    fn supports_hint(&self, hint: HintKind) -> bool;
}

/// Reply-side facts the router feeds back once a backend response
/// completes.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReplyUpdate {
    pub load_data_active: bool,
    pub is_complete: bool,
    pub server_status: Option<StatusFlags>,
    /// param count reported by a COM_STMT_PREPARE response
    pub ps_param_count: Option<u16>,
}

/// The read/write-splitting decision engine: combines classifier output
/// with transaction state, the prepared-statement registry, temp-table
/// tracking and client hints into a [`RouteInfo`] per statement.
pub struct QueryClassifier {
    parser: Rc<dyn Parser>,
    use_sql_variables_in: UseSqlVariablesIn,
    multi_statements_allowed: bool,
    ps_manager: PsManager,
    trx: TrxTracker,
    route_info: RouteInfo,
    prev_route_info: RouteInfo,
    prev_ps_id: u32,
    current_db: String,
    verbose: bool,
}

impl QueryClassifier {
    pub fn new(
        parser: Rc<dyn Parser>,
        use_sql_variables_in: UseSqlVariablesIn,
        multi_statements_allowed: bool,
        ps_verbosity: PsLogVerbosity,
    ) -> Self {
        QueryClassifier {
            parser,
            use_sql_variables_in,
            multi_statements_allowed,
            ps_manager: PsManager::new(ps_verbosity),
            trx: TrxTracker::new(),
            route_info: RouteInfo::default(),
            prev_route_info: RouteInfo::default(),
            prev_ps_id: 0,
            current_db: String::new(),
            verbose: true,
        }
    }

    pub fn set_verbose(&mut self, verbose: bool) {
        self.verbose = verbose;
    }

    pub fn set_current_db(&mut self, db: &str) {
        self.current_db = db.to_string();
    }

    pub fn current_db(&self) -> &str {
        &self.current_db
    }

    pub fn parser(&self) -> &dyn Parser {
        self.parser.as_ref()
    }

    pub fn trx(&self) -> &TrxTracker {
        &self.trx
    }

    pub fn trx_mut(&mut self) -> &mut TrxTracker {
        &mut self.trx
    }

    pub fn ps_manager(&self) -> &PsManager {
        &self.ps_manager
    }

    pub fn route_info(&self) -> &RouteInfo {
        &self.route_info
    }

    /// A type mask is read-only when it reads and neither writes nor is
    /// pinned to the master. User-variable reads only count as read-only
    /// when variables are replicated to all backends.
    pub fn query_type_is_read_only(&self, qtype: TypeMask) -> bool {
        if qtype.contains(TypeMask::MASTER_READ) || qtype.contains(TypeMask::WRITE) {
            return false;
        }
        if !qtype.intersects(
            TypeMask::READ
                | TypeMask::USERVAR_READ
                | TypeMask::SYSVAR_READ
                | TypeMask::GSYSVAR_READ,
        ) {
            return false;
        }
        if qtype.contains(TypeMask::USERVAR_READ) {
            return self.use_sql_variables_in == UseSqlVariablesIn::All;
        }
        true
    }

    fn process_routing_hints(
        &self,
        hints: &[Hint],
        handler: &dyn Handler,
        target: &mut RouteTarget,
    ) {
        const MAX_RLAG: &str = "max_slave_replication_lag";

        for hint in hints {
            if !handler.supports_hint(hint.kind()) {
                continue;
            }
            match hint {
                Hint::RouteToMaster => {
                    // This means override, so we bail out immediately.
                    *target = RouteTarget::MASTER;
                    debug!("Hint: route to master");
                    break;
                }
                Hint::RouteToNamedServer(name) => {
                    // The router is expected to look up the named server.
                    *target |= RouteTarget::NAMED_SERVER;
                    debug!("Hint: route to named server: {name}");
                }
                Hint::RouteToLastUsed => {
                    debug!("Hint: route to last used");
                    *target = RouteTarget::LAST_USED;
                }
                Hint::Parameter { name, value } => {
                    if name.eq_ignore_ascii_case(MAX_RLAG) {
                        *target |= RouteTarget::RLAG_MAX;
                    } else {
                        error!(
                            "Unknown hint parameter '{name}={value}' when '{MAX_RLAG}' was \
                             expected."
                        );
                    }
                }
                Hint::RouteToSlave => {
                    *target = RouteTarget::SLAVE;
                    debug!("Hint: route to slave.");
                }
                Hint::RouteToAll => {
                    *target |= RouteTarget::ALL;
                }
            }
        }
    }

    fn get_route_target(&self, command: u8, qtype: TypeMask) -> RouteTarget {
        let trx_active = self.trx.is_trx_active();
        let load_active = self.route_info.load_data_state == LoadDataState::Active;
        debug_assert!(!load_active);

        // Prepared statement preparations are sent to all servers so any
        // of them can execute later. Closing and resetting follow the
        // statement everywhere it was registered.
        if qtype.intersects(TypeMask::PREPARE_STMT | TypeMask::PREPARE_NAMED_STMT)
            || command == CommandCode::ComStmtClose as u8
            || command == CommandCode::ComStmtReset as u8
        {
            return RouteTarget::ALL;
        }

        if qtype.contains(TypeMask::SESSION_WRITE)
            || (self.use_sql_variables_in == UseSqlVariablesIn::All
                && qtype.contains(TypeMask::USERVAR_WRITE))
            || qtype.contains(TypeMask::GSYSVAR_WRITE)
            || qtype.intersects(TypeMask::ENABLE_AUTOCOMMIT | TypeMask::DISABLE_AUTOCOMMIT)
        {
            let mut target = RouteTarget::ALL;
            if qtype.contains(TypeMask::READ) {
                warn!(
                    "The query can't be routed to all backend servers because it includes \
                     SELECT and SQL variable modifications which is not supported. Set \
                     use_sql_variables_in=master or split the query in two."
                );
                target = RouteTarget::MASTER | RouteTarget::ALL;
            }
            return target;
        }

        if !trx_active && !load_active && self.query_type_is_read_only(qtype) {
            return RouteTarget::SLAVE;
        }

        if self.trx.is_trx_read_only() {
            // an entire READ ONLY transaction can be served by a slave
            return RouteTarget::SLAVE;
        }

        RouteTarget::MASTER
    }

    /// The proxy-internal prepared-statement id of a COM_STMT_* packet.
    /// The MariaDB direct-execution sentinel resolves to the most recently
    /// prepared statement.
    pub fn ps_id_internal_get(&self, buffer: &Buffer) -> u32 {
        let id = extract_ps_id(buffer.wire());
        if id == PS_DIRECT_EXEC_ID && self.prev_ps_id != 0 {
            return self.prev_ps_id;
        }
        id
    }

    pub fn ps_store(&mut self, buffer: &Buffer, id: u32) {
        self.prev_ps_id = id;
        self.ps_manager.store(self.parser.as_ref(), buffer, id);
    }

    pub fn ps_erase(&mut self, buffer: &Buffer) {
        if buffer
            .command()
            .map(CommandCode::is_ps_command)
            .unwrap_or(false)
        {
            // erase the statement stored under the internal id
            let id = self.ps_id_internal_get(buffer);
            self.ps_manager.erase(id);
        } else {
            self.ps_manager.erase_buffer(self.parser.as_ref(), buffer);
        }
    }

    fn qualified_tables(&self, buffer: &Buffer) -> Vec<String> {
        self.parser
            .get_table_names(buffer)
            .iter()
            .map(|t| t.qualified(&self.current_db))
            .collect()
    }

    fn is_read_tmp_table(&self, buffer: &Buffer, qtype: TypeMask) -> bool {
        if !qtype.intersects(
            TypeMask::READ
                | TypeMask::USERVAR_READ
                | TypeMask::SYSVAR_READ
                | TypeMask::GSYSVAR_READ,
        ) {
            return false;
        }
        self.qualified_tables(buffer)
            .iter()
            .any(|table| self.route_info.is_tmp_table(table))
    }

    /// Stored-procedure calls and multi-statements pin the session to the
    /// master; reads that touch session temp tables are forced there too.
    fn handle_multi_temp_and_load(
        &mut self,
        mut current_target: CurrentTarget,
        buffer: &Buffer,
        command: u8,
        qtype: &mut TypeMask,
    ) -> CurrentTarget {
        if current_target != CurrentTarget::Master {
            let is_query = command == CommandCode::ComQuery as u8;
            let mut is_multi =
                is_query && self.parser.get_operation(buffer) == Operation::Call;
            if !is_multi && self.multi_statements_allowed && is_query {
                is_multi = self.parser.is_multi_stmt(buffer);
            }
            if is_multi {
                current_target = CurrentTarget::Master;
            }
        }

        if self.route_info.have_tmp_tables()
            && command == CommandCode::ComQuery as u8
            && self.is_read_tmp_table(buffer, *qtype)
        {
            info!("Query targets a temporary table, forcing master read");
            *qtype |= TypeMask::MASTER_READ;
        }

        current_target
    }

    fn query_continues_ps(&self, buffer: &Buffer) -> bool {
        self.parser
            .continues_ps(buffer, self.route_info.command())
    }

    /// Decide where the statement in `buffer` goes. The returned reference
    /// stays valid until the next call; [`commit_route_info_update`] must
    /// run once the decision has actually been dispatched.
    pub fn update_route_info(
        &mut self,
        current_target: CurrentTarget,
        buffer: &Buffer,
        handler: &mut dyn Handler,
    ) -> &RouteInfo {
        // Stash the current state in case we need to roll it back.
        self.prev_route_info = self.route_info.clone();

        if self.route_info.large_query {
            // Trailing part of a multi-packet query: ride the existing
            // decision, only maintain the chain flag.
            self.route_info.large_query = buffer.is_large();
            self.route_info.multi_part_packet = true;
            return &self.route_info;
        }

        self.route_info.multi_part_packet = false;
        self.route_info.large_query = buffer.is_large();

        let mut route_target = RouteTarget::MASTER;
        let mut command = 0xffu8;
        let mut type_mask = TypeMask::UNKNOWN;
        let mut stmt_id = 0u32;

        // Reset for every classification.
        self.route_info.ps_continuation = false;

        if self.route_info.load_data_state == LoadDataState::End {
            self.route_info.load_data_state = LoadDataState::Inactive;
        }

        if self.route_info.load_data_state == LoadDataState::Active {
            self.route_info.load_data_sent += buffer.wire().len() as u64;
            if buffer.wire().len() == PACKET_HEADER_LEN {
                // empty packet ends a LOAD DATA LOCAL INFILE exchange
                self.route_info.load_data_state = LoadDataState::End;
            }
            // keep the previous target while streaming
            if self.verbose {
                self.log_transaction_status(buffer, type_mask);
            }
            return &self.route_info;
        }

        if buffer.wire().len() > PACKET_HEADER_LEN {
            command = buffer.command().unwrap_or(0xff);

            let query_info = self.parser.get_query_info(buffer);
            self.trx.track_transaction_state(self.parser.get_trx_type_mask(buffer));

            if query_info.ps_packet {
                stmt_id = self.ps_id_internal_get(buffer);
            }

            let in_read_only_trx =
                current_target != CurrentTarget::Undefined && self.trx.is_trx_read_only();

            if in_read_only_trx {
                // Inside a READ ONLY transaction the server enforces
                // correctness itself, parsing can be skipped entirely.
                type_mask = TypeMask::READ;
            } else {
                type_mask = self.determine_query_type(buffer, command, &query_info);

                let current_target =
                    self.handle_multi_temp_and_load(current_target, buffer, command, &mut type_mask);

                if current_target == CurrentTarget::Master {
                    // Without a master to force the session to, mark the
                    // statement as a write so error processing triggers.
                    if !handler.lock_to_master() {
                        type_mask |= TypeMask::WRITE;
                    }
                }
            }

            let mut route_to_last_used = false;

            if handler.is_locked_to_master() {
                // the session is locked to the master
                route_target = RouteTarget::MASTER;
            } else {
                if !in_read_only_trx
                    && command == CommandCode::ComQuery as u8
                    && self.parser.get_operation(buffer) == Operation::Execute
                {
                    if let Some(name) = self.parser.get_prepare_name(buffer) {
                        if let Some(ps) = self.ps_manager.get_text(&name) {
                            type_mask = ps.type_mask;
                            route_to_last_used = ps.route_to_last_used;
                        }
                    }
                } else if query_info.ps_packet {
                    if let Some(ps) = self.ps_manager.get(stmt_id).copied() {
                        type_mask = ps.type_mask;
                        route_to_last_used = ps.route_to_last_used;
                        self.route_info.ps_continuation = self.query_continues_ps(buffer);
                    }
                } else if command == CommandCode::ComQuery as u8
                    && query_info.relates_to_previous
                {
                    // FOUND_ROWS and friends only mean anything on the
                    // server that ran the previous statement
                    route_to_last_used = true;
                }

                route_target = self.get_route_target(command, type_mask);

                if route_target == RouteTarget::SLAVE && route_to_last_used {
                    route_target = RouteTarget::LAST_USED;
                }
            }

            self.process_routing_hints(buffer.hints(), handler, &mut route_target);

            if self.trx.is_trx_ending() || type_mask.contains(TypeMask::BEGIN_TRX) {
                // transaction is ending or starting
                self.route_info.trx_still_read_only = true;
            } else if self.trx.is_trx_active() && !self.query_type_is_read_only(type_mask) {
                // transaction is no longer read-only
                self.route_info.trx_still_read_only = false;
            }
        }

        if self.verbose {
            self.log_transaction_status(buffer, type_mask);
        }

        self.route_info.target = route_target;
        self.route_info.command = command;
        self.route_info.type_mask = type_mask;
        self.route_info.stmt_id = stmt_id;

        &self.route_info
    }

    fn determine_query_type(
        &self,
        buffer: &Buffer,
        command: u8,
        query_info: &crate::classifier::QueryInfo,
    ) -> TypeMask {
        use CommandCode::*;
        match command {
            c if c == ComQuit as u8
                || c == ComInitDB as u8
                || c == ComRefresh as u8
                || c == ComDebug as u8
                || c == ComPing as u8
                || c == ComChangeUser as u8
                || c == ComSetOption as u8
                || c == ComResetConnection as u8 =>
            {
                TypeMask::SESSION_WRITE
            }
            c if c == ComCreateDB as u8
                || c == ComDropDB as u8
                || c == ComStmtClose as u8
                || c == ComStmtSendLongData as u8
                || c == ComStmtReset as u8 =>
            {
                TypeMask::WRITE
            }
            c if c == ComFieldList as u8 => TypeMask::READ,
            c if c == ComQuery as u8 || c == ComStmtPrepare as u8 => query_info.type_mask,
            c if c == ComStmtExecute as u8 || c == ComStmtBulkExecute as u8 => {
                // parsing is not needed for this type of packet
                TypeMask::EXEC_STMT
            }
            c if c == ComStmtFetch as u8 => TypeMask::EXEC_STMT,
            _ => TypeMask::UNKNOWN,
        }
    }

    /// Apply the statement's side effects once the router has dispatched
    /// it: register/erase prepared statements, track temp tables.
    pub fn commit_route_info_update(&mut self, buffer: &Buffer) {
        let type_mask = self.route_info.type_mask;

        if type_mask.intersects(TypeMask::PREPARE_STMT | TypeMask::PREPARE_NAMED_STMT) {
            let id = buffer.id() as u32;
            self.ps_store(buffer, id);
        } else if type_mask.contains(TypeMask::DEALLOC_PREPARE) {
            self.ps_erase(buffer);
        }

        if type_mask.contains(TypeMask::CREATE_TMP_TABLE) {
            if let Some(table) = self.qualified_tables(buffer).into_iter().next() {
                info!("Added temporary table {table}");
                self.route_info.add_tmp_table(table);
            }
        }

        if self.route_info.have_tmp_tables()
            && self.parser.get_operation(buffer) == Operation::DropTable
        {
            for table in self.qualified_tables(buffer) {
                self.route_info.remove_tmp_table(&table);
            }
        }
    }

    /// Restore the pre-decision snapshot. Used when the chosen backend
    /// refused the statement before anything was written.
    pub fn revert_update(&mut self) {
        self.route_info = self.prev_route_info.clone();
    }

    /// Fold a completed (or progressing) reply back into the state.
    pub fn update_from_reply(&mut self, reply: &ReplyUpdate) {
        if reply.load_data_active {
            self.route_info.load_data_state = LoadDataState::Active;
        }

        if reply.is_complete {
            if let Some(status) = reply.server_status {
                self.trx.fix_from_server(status);
            }
            if let Some(param_count) = reply.ps_param_count {
                self.ps_store_response(self.prev_ps_id, param_count);
            }
        }
    }

    pub fn ps_store_response(&mut self, id: u32, param_count: u16) {
        if param_count != 0 {
            self.ps_manager.set_param_count(id, param_count);
        }
    }

    pub fn get_param_count(&self, id: u32) -> u16 {
        self.ps_manager.param_count(id)
    }

    const TRACE_MSG_LEN: usize = 1000;

    fn log_transaction_status(&self, buffer: &Buffer, qtype: TypeMask) {
        if self.route_info.large_query {
            info!("> Processing large request with more than 2^24 bytes of data");
        } else if self.route_info.load_data_state == LoadDataState::Inactive {
            let command = buffer.command().unwrap_or(0xff);
            let stmt = if CommandCode::is_ps_command(command) {
                format!("ID: {}", extract_ps_id(buffer.wire()))
            } else {
                let mut sql = buffer
                    .sql()
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "<non-SQL>".to_string());
                sql.truncate(Self::TRACE_MSG_LEN);
                sql
            };
            let transaction = if self.trx.is_trx_active() {
                "[open]"
            } else {
                "[not open]"
            };
            info!(
                "> Trx is {transaction}, cmd: (0x{command:02x}) {}, type: {qtype:?}, stmt: {stmt}",
                crate::protocol::mysql::constants::com_name(command),
            );
        } else if self.route_info.load_data_state == LoadDataState::End {
            info!(
                "> LOAD DATA LOCAL INFILE finished: {} bytes sent.",
                self.route_info.load_data_sent
            );
        } else {
            info!(
                "> Processing LOAD DATA LOCAL INFILE: {} bytes sent.",
                self.route_info.load_data_sent
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::inspector::InspectParser;
    use crate::protocol::mysql::constants::MAX_PAYLOAD_LEN;

    struct TestHandler {
        locked: bool,
        has_master: bool,
    }

    impl Default for TestHandler {
        fn default() -> Self {
            TestHandler {
                locked: false,
                has_master: true,
            }
        }
    }

    impl Handler for TestHandler {
        fn lock_to_master(&mut self) -> bool {
            if self.has_master {
                self.locked = true;
            }
            self.has_master
        }

        fn is_locked_to_master(&self) -> bool {
            self.locked
        }

        fn supports_hint(&self, _hint: HintKind) -> bool {
            true
        }
    }

    fn classifier() -> QueryClassifier {
        let mut qc = QueryClassifier::new(
            Rc::new(InspectParser::new()),
            UseSqlVariablesIn::Master,
            true,
            PsLogVerbosity::None,
        );
        qc.set_verbose(false);
        qc.set_current_db("testdb");
        qc
    }

    fn binary_prepare(sql: &str) -> Buffer {
        let mut payload = vec![CommandCode::ComStmtPrepare as u8];
        payload.extend_from_slice(sql.as_bytes());
        Buffer::from_payload(0, &payload)
    }

    fn binary_execute(stmt_id: u32) -> Buffer {
        let mut payload = vec![CommandCode::ComStmtExecute as u8];
        payload.extend(stmt_id.to_le_bytes());
        payload.push(0);
        payload.extend(1u32.to_le_bytes());
        Buffer::from_payload(0, &payload)
    }

    #[test]
    fn s1_simple_read_goes_to_slave() {
        let mut qc = classifier();
        let mut handler = TestHandler::default();
        let buf = Buffer::com_query("SELECT id FROM t WHERE id=42");

        let info = qc.update_route_info(CurrentTarget::Undefined, &buf, &mut handler);
        assert_eq!(info.target(), RouteTarget::SLAVE);
        assert_eq!(info.type_mask(), TypeMask::READ);

        qc.commit_route_info_update(&buf);
        assert!(qc.ps_manager().is_empty());
        assert!(!qc.route_info().have_tmp_tables());
    }

    #[test]
    fn s2_write_inside_transaction() {
        let mut qc = classifier();
        let mut handler = TestHandler::default();

        let begin = Buffer::com_query("START TRANSACTION");
        let info = qc.update_route_info(CurrentTarget::Undefined, &begin, &mut handler);
        assert_eq!(info.target(), RouteTarget::MASTER);
        assert!(info.type_mask().contains(TypeMask::BEGIN_TRX));
        assert!(info.trx_still_read_only());
        assert!(qc.trx().is_trx_active());
        qc.commit_route_info_update(&begin);

        let update = Buffer::com_query("UPDATE t SET v=1 WHERE id=42");
        let info = qc.update_route_info(CurrentTarget::Undefined, &update, &mut handler);
        assert_eq!(info.target(), RouteTarget::MASTER);
        assert!(!info.trx_still_read_only());
        qc.commit_route_info_update(&update);

        let commit = Buffer::com_query("COMMIT");
        let info = qc.update_route_info(CurrentTarget::Undefined, &commit, &mut handler);
        assert_eq!(info.target(), RouteTarget::MASTER);
        assert!(info.type_mask().contains(TypeMask::COMMIT));
        assert!(qc.trx().is_trx_ending());
        qc.commit_route_info_update(&commit);

        // trx has ended by the next statement
        let select = Buffer::com_query("SELECT 1");
        qc.update_route_info(CurrentTarget::Undefined, &select, &mut handler);
        assert!(!qc.trx().is_trx_active());
    }

    #[test]
    fn s3_binary_prepared_statement() {
        let mut qc = classifier();
        let mut handler = TestHandler::default();

        let prepare = binary_prepare("SELECT name FROM users WHERE id=?");
        let internal_id = prepare.id() as u32;
        let info = qc.update_route_info(CurrentTarget::Undefined, &prepare, &mut handler);
        assert_eq!(info.target(), RouteTarget::ALL);
        qc.commit_route_info_update(&prepare);

        // the PREPARE response reports one parameter
        qc.update_from_reply(&ReplyUpdate {
            is_complete: true,
            ps_param_count: Some(1),
            ..Default::default()
        });
        assert_eq!(qc.get_param_count(internal_id), 1);

        let execute = binary_execute(internal_id);
        let info = qc.update_route_info(CurrentTarget::Undefined, &execute, &mut handler);
        assert_eq!(info.type_mask(), TypeMask::READ);
        assert_eq!(info.target(), RouteTarget::SLAVE);
        assert_eq!(info.stmt_id(), internal_id);
    }

    #[test]
    fn s4_temp_table_read_forces_master() {
        let mut qc = classifier();
        let mut handler = TestHandler::default();

        let create = Buffer::com_query("CREATE TEMPORARY TABLE scratch (x INT)");
        let info = qc.update_route_info(CurrentTarget::Undefined, &create, &mut handler);
        assert_eq!(info.target(), RouteTarget::MASTER);
        qc.commit_route_info_update(&create);
        assert!(qc.route_info().is_tmp_table("testdb.scratch"));

        let select = Buffer::com_query("SELECT * FROM scratch");
        let info = qc.update_route_info(CurrentTarget::Undefined, &select, &mut handler);
        assert!(info.type_mask().contains(TypeMask::MASTER_READ));
        assert_eq!(info.target(), RouteTarget::MASTER);

        let drop = Buffer::com_query("DROP TABLE scratch");
        qc.update_route_info(CurrentTarget::Undefined, &drop, &mut handler);
        qc.commit_route_info_update(&drop);
        assert!(!qc.route_info().is_tmp_table("testdb.scratch"));
    }

    #[test]
    fn s6_multi_part_packet_rides_previous_target() {
        let mut qc = classifier();
        let mut handler = TestHandler::default();

        // a write query filling a whole packet
        let mut payload = vec![CommandCode::ComQuery as u8];
        payload.extend_from_slice(b"INSERT INTO t VALUES (");
        payload.resize(MAX_PAYLOAD_LEN, b'1');
        let first = Buffer::from_payload(0, &payload);
        assert!(first.is_large());

        let info = qc.update_route_info(CurrentTarget::Undefined, &first, &mut handler);
        assert_eq!(info.target(), RouteTarget::MASTER);
        assert!(!info.multi_part_packet());

        // trailing continuation frame classifies as nothing at all but
        // follows the write to the same target
        let second = Buffer::from_payload(1, &vec![b'1'; 100]);
        let info = qc.update_route_info(CurrentTarget::Undefined, &second, &mut handler);
        assert!(info.multi_part_packet());
        assert_eq!(info.target(), RouteTarget::MASTER);

        // and the statement after that classifies normally again
        let next = Buffer::com_query("SELECT 1");
        let info = qc.update_route_info(CurrentTarget::Undefined, &next, &mut handler);
        assert!(!info.multi_part_packet());
        assert_eq!(info.target(), RouteTarget::SLAVE);
    }

    #[test]
    fn hint_route_to_master_wins_regardless_of_order() {
        let mut qc = classifier();
        let mut handler = TestHandler::default();
        let mut buf = Buffer::com_query("SELECT 1");
        buf.add_hint(Hint::RouteToMaster);
        buf.add_hint(Hint::RouteToSlave);
        buf.add_hint(Hint::RouteToNamedServer("s2".into()));
        let info = qc.update_route_info(CurrentTarget::Undefined, &buf, &mut handler);
        assert_eq!(info.target(), RouteTarget::MASTER);

        // master placed last still overrides everything before it
        let mut buf = Buffer::com_query("SELECT 2");
        buf.add_hint(Hint::RouteToSlave);
        buf.add_hint(Hint::RouteToLastUsed);
        buf.add_hint(Hint::RouteToMaster);
        let info = qc.update_route_info(CurrentTarget::Undefined, &buf, &mut handler);
        assert_eq!(info.target(), RouteTarget::MASTER);
    }

    #[test]
    fn named_server_hint_extends_slave_target() {
        let mut qc = classifier();
        let mut handler = TestHandler::default();
        let mut buf = Buffer::com_query("SELECT 1");
        buf.add_hint(Hint::RouteToNamedServer("s2".into()));

        let info = qc.update_route_info(CurrentTarget::Undefined, &buf, &mut handler);
        assert!(info.target().contains(RouteTarget::NAMED_SERVER));
        assert!(info.target().contains(RouteTarget::SLAVE));
    }

    #[test]
    fn rlag_parameter_hint_sets_bound() {
        let mut qc = classifier();
        let mut handler = TestHandler::default();
        let mut buf = Buffer::com_query("SELECT 1");
        buf.add_hint(Hint::Parameter {
            name: "max_slave_replication_lag".into(),
            value: "120".into(),
        });
        let info = qc.update_route_info(CurrentTarget::Undefined, &buf, &mut handler);
        assert!(info.target().contains(RouteTarget::RLAG_MAX));
        assert!(info.target().contains(RouteTarget::SLAVE));
    }

    #[test]
    fn uservar_read_goes_to_master_by_default() {
        let mut qc = classifier();
        let mut handler = TestHandler::default();
        let buf = Buffer::com_query("SELECT @v");
        let info = qc.update_route_info(CurrentTarget::Undefined, &buf, &mut handler);
        assert_eq!(info.target(), RouteTarget::MASTER);
    }

    #[test]
    fn uservar_read_goes_to_slave_with_all() {
        let mut qc = QueryClassifier::new(
            Rc::new(InspectParser::new()),
            UseSqlVariablesIn::All,
            true,
            PsLogVerbosity::None,
        );
        qc.set_verbose(false);
        let mut handler = TestHandler::default();
        let buf = Buffer::com_query("SELECT @v");
        let info = qc.update_route_info(CurrentTarget::Undefined, &buf, &mut handler);
        assert_eq!(info.target(), RouteTarget::SLAVE);
    }

    #[test]
    fn unknown_statement_routes_to_master() {
        let mut qc = classifier();
        let mut handler = TestHandler::default();
        let buf = Buffer::com_query("FROBNICATE EVERYTHING");
        let info = qc.update_route_info(CurrentTarget::Undefined, &buf, &mut handler);
        assert_eq!(info.target(), RouteTarget::MASTER);
    }

    #[test]
    fn session_write_targets_all() {
        let mut qc = classifier();
        let mut handler = TestHandler::default();
        let buf = Buffer::com_query("SET NAMES utf8mb4");
        let info = qc.update_route_info(CurrentTarget::Undefined, &buf, &mut handler);
        assert!(info.target().contains(RouteTarget::ALL));
    }

    #[test]
    fn execute_of_unknown_ps_still_targets_master() {
        let mut qc = classifier();
        let mut handler = TestHandler::default();
        let execute = binary_execute(4242);
        let info = qc.update_route_info(CurrentTarget::Undefined, &execute, &mut handler);
        // EXEC_STMT with no registered PS is not read-only
        assert_eq!(info.target(), RouteTarget::MASTER);
    }

    #[test]
    fn stmt_fetch_is_ps_continuation() {
        let mut qc = classifier();
        let mut handler = TestHandler::default();

        let prepare = binary_prepare("SELECT a FROM big WHERE x > ?");
        let id = prepare.id() as u32;
        qc.update_route_info(CurrentTarget::Undefined, &prepare, &mut handler);
        qc.commit_route_info_update(&prepare);

        let execute = binary_execute(id);
        qc.update_route_info(CurrentTarget::Undefined, &execute, &mut handler);

        let mut payload = vec![CommandCode::ComStmtFetch as u8];
        payload.extend(id.to_le_bytes());
        payload.extend(10u32.to_le_bytes());
        let fetch = Buffer::from_payload(0, &payload);
        let info = qc.update_route_info(CurrentTarget::Undefined, &fetch, &mut handler);
        assert!(info.is_ps_continuation());
    }

    #[test]
    fn direct_exec_sentinel_resolves_to_previous_ps() {
        let mut qc = classifier();
        let mut handler = TestHandler::default();

        let prepare = binary_prepare("SELECT name FROM users WHERE id=?");
        let id = prepare.id() as u32;
        qc.update_route_info(CurrentTarget::Undefined, &prepare, &mut handler);
        qc.commit_route_info_update(&prepare);

        let execute = binary_execute(PS_DIRECT_EXEC_ID);
        let info = qc.update_route_info(CurrentTarget::Undefined, &execute, &mut handler);
        assert_eq!(info.stmt_id(), id);
        assert_eq!(info.type_mask(), TypeMask::READ);
    }

    #[test]
    fn found_rows_routes_to_last_used() {
        let mut qc = classifier();
        let mut handler = TestHandler::default();
        let buf = Buffer::com_query("SELECT FOUND_ROWS()");
        let info = qc.update_route_info(CurrentTarget::Undefined, &buf, &mut handler);
        assert_eq!(info.target(), RouteTarget::LAST_USED);
    }

    #[test]
    fn revert_restores_previous_decision() {
        let mut qc = classifier();
        let mut handler = TestHandler::default();

        let read = Buffer::com_query("SELECT 1");
        qc.update_route_info(CurrentTarget::Undefined, &read, &mut handler);
        assert_eq!(qc.route_info().target(), RouteTarget::SLAVE);

        let write = Buffer::com_query("UPDATE t SET a=1");
        qc.update_route_info(CurrentTarget::Undefined, &write, &mut handler);
        assert_eq!(qc.route_info().target(), RouteTarget::MASTER);

        qc.revert_update();
        assert_eq!(qc.route_info().target(), RouteTarget::SLAVE);
    }

    #[test]
    fn routing_is_deterministic_for_identical_inputs() {
        for _ in 0..3 {
            let mut qc = classifier();
            let mut handler = TestHandler::default();
            let buf = Buffer::com_query("SELECT id FROM t WHERE id=42");
            let info = qc.update_route_info(CurrentTarget::Undefined, &buf, &mut handler);
            assert_eq!(info.target(), RouteTarget::SLAVE);
            assert_eq!(info.type_mask(), TypeMask::READ);
        }
    }

    #[test]
    fn trx_still_read_only_is_monotonic_within_trx() {
        let mut qc = classifier();
        let mut handler = TestHandler::default();

        let begin = Buffer::com_query("START TRANSACTION");
        qc.update_route_info(CurrentTarget::Undefined, &begin, &mut handler);
        assert!(qc.route_info().trx_still_read_only());

        let select = Buffer::com_query("SELECT 1 FROM t");
        qc.update_route_info(CurrentTarget::Undefined, &select, &mut handler);
        assert!(qc.route_info().trx_still_read_only());

        let write = Buffer::com_query("UPDATE t SET a=1");
        qc.update_route_info(CurrentTarget::Undefined, &write, &mut handler);
        assert!(!qc.route_info().trx_still_read_only());

        // once false it stays false for the rest of the transaction
        let select2 = Buffer::com_query("SELECT 2 FROM t");
        qc.update_route_info(CurrentTarget::Undefined, &select2, &mut handler);
        assert!(!qc.route_info().trx_still_read_only());
    }

    #[test]
    fn load_data_streams_keep_previous_target() {
        let mut qc = classifier();
        let mut handler = TestHandler::default();

        let load = Buffer::com_query("LOAD DATA LOCAL INFILE 'x.csv' INTO TABLE t");
        let info = qc.update_route_info(CurrentTarget::Undefined, &load, &mut handler);
        assert_eq!(info.target(), RouteTarget::MASTER);

        // the backend answers with the local-infile request
        qc.update_from_reply(&ReplyUpdate {
            load_data_active: true,
            ..Default::default()
        });

        let chunk = Buffer::from_payload(1, b"1,2,3\n4,5,6\n");
        let info = qc.update_route_info(CurrentTarget::Undefined, &chunk, &mut handler);
        assert_eq!(info.target(), RouteTarget::MASTER);
        assert!(info.load_data_active());

        let terminator = Buffer::from_payload(2, &[]);
        let info = qc.update_route_info(CurrentTarget::Undefined, &terminator, &mut handler);
        assert_eq!(info.load_data_state(), LoadDataState::End);

        let select = Buffer::com_query("SELECT 1");
        let info = qc.update_route_info(CurrentTarget::Undefined, &select, &mut handler);
        assert_eq!(info.load_data_state(), LoadDataState::Inactive);
        assert_eq!(info.target(), RouteTarget::SLAVE);
    }

    #[test]
    fn set_transaction_read_only_goes_to_master() {
        let mut qc = classifier();
        let mut handler = TestHandler::default();
        let buf = Buffer::com_query("SET TRANSACTION READ ONLY");
        let info = qc.update_route_info(CurrentTarget::Undefined, &buf, &mut handler);
        assert!(info.type_mask().contains(TypeMask::NEXT_TRX));
        assert_eq!(info.target(), RouteTarget::MASTER);
    }
}
