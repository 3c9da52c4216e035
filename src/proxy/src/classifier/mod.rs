pub mod cache;
pub mod canonical;
pub mod info;
pub mod inspector;

use crate::buffer::Buffer;
use crate::classifier::info::{FieldInfo, FunctionInfo, KillInfo, ParseInfo, TableName};

use bitflags::bitflags;
use std::rc::Rc;
use strum_macros::AsRefStr;

bitflags! {
    /// Semantic categories of one statement. A statement usually carries
    /// several; the empty mask means classification failed and the router
    /// must assume the worst.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TypeMask: u32 {
        const READ                = 1 << 0;
        const WRITE               = 1 << 1;
        const SESSION_WRITE       = 1 << 2;
        const USERVAR_READ        = 1 << 3;
        const USERVAR_WRITE       = 1 << 4;
        const SYSVAR_READ         = 1 << 5;
        const GSYSVAR_READ        = 1 << 6;
        const GSYSVAR_WRITE       = 1 << 7;
        const PREPARE_STMT        = 1 << 8;
        const PREPARE_NAMED_STMT  = 1 << 9;
        const EXEC_STMT           = 1 << 10;
        const BEGIN_TRX           = 1 << 11;
        const COMMIT              = 1 << 12;
        const ROLLBACK            = 1 << 13;
        const ENABLE_AUTOCOMMIT   = 1 << 14;
        const DISABLE_AUTOCOMMIT  = 1 << 15;
        const CREATE_TMP_TABLE    = 1 << 16;
        const DEALLOC_PREPARE     = 1 << 17;
        const MASTER_READ         = 1 << 18;
        const NEXT_TRX            = 1 << 19;
    }
}

impl TypeMask {
    pub const UNKNOWN: TypeMask = TypeMask::empty();

    pub fn is_unknown(&self) -> bool {
        self.is_empty()
    }
}

impl Default for TypeMask {
    fn default() -> Self {
        TypeMask::UNKNOWN
    }
}

/// `QUERY_TYPE_READ|QUERY_TYPE_USERVAR_READ` style rendering for the admin
/// surface.
pub fn type_mask_to_string(mask: TypeMask) -> String {
    if mask.is_empty() {
        return "UNKNOWN".to_string();
    }
    mask.iter_names()
        .map(|(name, _)| name)
        .collect::<Vec<_>>()
        .join("|")
}

bitflags! {
    /// How deep a parse should go. The essentials (type mask and
    /// operation) are always collected.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CollectLevel: u32 {
        const TABLES    = 1 << 0;
        const FIELDS    = 1 << 1;
        const FUNCTIONS = 1 << 2;
    }
}

impl CollectLevel {
    pub const ESSENTIALS: CollectLevel = CollectLevel::empty();
}

impl Default for CollectLevel {
    fn default() -> Self {
        CollectLevel::ESSENTIALS
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, AsRefStr)]
pub enum ParseResult {
    Invalid,
    Tokenized,
    PartiallyParsed,
    Parsed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, AsRefStr)]
pub enum Operation {
    Undefined,
    Alter,
    Call,
    ChangeDb,
    Create,
    Delete,
    Drop,
    DropTable,
    Execute,
    Explain,
    Grant,
    Insert,
    Kill,
    Load,
    Revoke,
    Select,
    Set,
    Show,
    Truncate,
    Update,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SqlMode {
    #[default]
    Default,
    Oracle,
}

/// The routing-relevant summary of one classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StmtResult {
    pub status: ParseResult,
    pub type_mask: TypeMask,
    pub op: Operation,
    /// memory footprint estimate of the backing parse info
    pub size: usize,
}

/// Everything the router needs to know about one incoming packet.
#[derive(Debug, Clone)]
pub struct QueryInfo {
    pub command: u8,
    pub ps_id: u32,
    pub ps_direct_exec_id: bool,
    /// carries a binary prepared-statement id
    pub ps_packet: bool,
    /// is a SQL text command (COM_QUERY)
    pub query: bool,
    pub multi_part_packet: bool,
    pub multi_stmt: bool,
    pub relates_to_previous: bool,
    pub empty: bool,
    pub type_mask: TypeMask,
    pub op: Operation,
}

/// The pluggable statement parser. One instance serves a whole worker;
/// classification results are attached to buffers and memoized by the
/// thread-local cache (see [`cache`]).
pub trait Parser {
    fn parse(&self, stmt: &Buffer, collect: CollectLevel) -> ParseResult;

    /// Summary of an already-produced parse info, used when reporting
    /// cache contents.
    fn stmt_result(&self, info: &ParseInfo) -> StmtResult;

    fn get_type_mask(&self, stmt: &Buffer) -> TypeMask;
    fn get_operation(&self, stmt: &Buffer) -> Operation;
    fn get_table_names(&self, stmt: &Buffer) -> Vec<TableName>;
    fn get_field_info(&self, stmt: &Buffer) -> Vec<FieldInfo>;
    fn get_function_info(&self, stmt: &Buffer) -> Vec<FunctionInfo>;
    fn get_kill_info(&self, stmt: &Buffer) -> Option<KillInfo>;
    /// The statement being prepared by a text PREPARE or COM_STMT_PREPARE.
    fn get_preparable_stmt(&self, stmt: &Buffer) -> Option<Buffer>;
    fn get_prepare_name(&self, stmt: &Buffer) -> Option<String>;
    fn get_query_info(&self, stmt: &Buffer) -> QueryInfo;
    fn get_canonical(&self, stmt: &Buffer) -> String;

    fn is_prepare(&self, stmt: &Buffer) -> bool;
    fn is_query(&self, stmt: &Buffer) -> bool;
    fn is_ps_packet(&self, stmt: &Buffer) -> bool;
    fn is_execute_immediately_ps(&self, stmt: &Buffer) -> bool;
    fn get_ps_id(&self, stmt: &Buffer) -> u32;
    fn is_ps_direct_exec_id(&self, id: u32) -> bool;
    /// Whether `stmt` must stay on the server that handled the previous
    /// command (`COM_STMT_FETCH`, long-data continuations).
    fn continues_ps(&self, stmt: &Buffer, prev_command: u8) -> bool;
    fn relates_to_previous(&self, stmt: &Buffer) -> bool;
    fn is_multi_stmt(&self, stmt: &Buffer) -> bool;

    /// Transaction-relevant bits only, usable without a full parse.
    fn get_trx_type_mask(&self, stmt: &Buffer) -> TypeMask;

    fn get_sql_mode(&self) -> SqlMode;
    fn set_sql_mode(&self, sql_mode: SqlMode);
    fn get_options(&self) -> u32;
    fn set_options(&self, options: u32) -> bool;

    /// Attach-or-reuse entry point: parse into a fresh [`ParseInfo`]
    /// without consulting the buffer's attached info. Used by the caching
    /// layer on a miss.
    fn parse_fresh(&self, stmt: &Buffer, collect: CollectLevel) -> Rc<ParseInfo>;

    /// Deepen the collect level of `info` in place, if it was produced
    /// with a shallower one.
    fn collect_deeper(&self, stmt: &Buffer, info: &ParseInfo, collect: CollectLevel);
}
