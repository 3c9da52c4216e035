use crate::classifier::{CollectLevel, Operation, ParseResult, TypeMask};

use std::cell::{Cell, RefCell};
use std::fmt;

/// A table reference collected from a statement. `db` is present only when
/// the statement qualified the table.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableName {
    pub db: Option<String>,
    pub table: String,
}

impl TableName {
    pub fn new(db: Option<&str>, table: &str) -> Self {
        TableName {
            db: db.map(str::to_string),
            table: table.to_string(),
        }
    }

    /// Qualified name, using `current_db` when the reference was bare.
    pub fn qualified(&self, current_db: &str) -> String {
        match &self.db {
            Some(db) => format!("{}.{}", db, self.table),
            None => format!("{}.{}", current_db, self.table),
        }
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.db {
            Some(db) => write!(f, "{}.{}", db, self.table),
            None => write!(f, "{}", self.table),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldInfo {
    pub column: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionInfo {
    pub name: String,
}

/// Target of a KILL statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KillInfo {
    pub target_id: u64,
    /// KILL QUERY rather than KILL CONNECTION
    pub query_only: bool,
    pub soft: bool,
}

/// Everything a parse produced. The deep-collect fields can grow in place
/// when a later call asks for more than the original parse collected;
/// growth happens through the owning parser while the info is attached to
/// a single buffer, never after it is visible to two owners.
#[derive(Debug, Default)]
pub struct CollectedInfo {
    pub collect_level: CollectLevel,
    pub tables: Vec<TableName>,
    pub fields: Vec<FieldInfo>,
    pub functions: Vec<FunctionInfo>,
}

/// The classification of one canonical statement. Attached to buffers and
/// shared with the thread-local cache by reference count.
pub struct ParseInfo {
    canonical: String,
    status: ParseResult,
    type_mask: TypeMask,
    op: Operation,
    relates_to_previous: bool,
    multi_stmt: bool,
    is_prepare: bool,
    prepare_name: Option<String>,
    /// inner SQL of a text PREPARE .. FROM '..'
    preparable_sql: Option<String>,
    kill: Option<KillInfo>,
    cacheable: bool,
    collected: RefCell<CollectedInfo>,
    /// cached size estimate, refreshed on growth
    size: Cell<usize>,
}

impl fmt::Debug for ParseInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParseInfo")
            .field("canonical", &self.canonical)
            .field("status", &self.status)
            .field("type_mask", &self.type_mask)
            .field("op", &self.op)
            .finish()
    }
}

#[allow(clippy::too_many_arguments)]
impl ParseInfo {
    pub fn new(
        canonical: String,
        status: ParseResult,
        type_mask: TypeMask,
        op: Operation,
        relates_to_previous: bool,
        multi_stmt: bool,
        is_prepare: bool,
        prepare_name: Option<String>,
        preparable_sql: Option<String>,
        kill: Option<KillInfo>,
        cacheable: bool,
        collected: CollectedInfo,
    ) -> Self {
        let info = ParseInfo {
            canonical,
            status,
            type_mask,
            op,
            relates_to_previous,
            multi_stmt,
            is_prepare,
            prepare_name,
            preparable_sql,
            kill,
            cacheable,
            collected: RefCell::new(collected),
            size: Cell::new(0),
        };
        info.refresh_size();
        info
    }

    pub fn failed(canonical: String) -> Self {
        ParseInfo::new(
            canonical,
            ParseResult::Invalid,
            TypeMask::UNKNOWN,
            Operation::Undefined,
            false,
            false,
            false,
            None,
            None,
            None,
            true,
            CollectedInfo::default(),
        )
    }

    pub fn canonical(&self) -> &str {
        &self.canonical
    }

    pub fn status(&self) -> ParseResult {
        self.status
    }

    pub fn type_mask(&self) -> TypeMask {
        self.type_mask
    }

    pub fn op(&self) -> Operation {
        self.op
    }

    pub fn relates_to_previous(&self) -> bool {
        self.relates_to_previous
    }

    pub fn is_multi_stmt(&self) -> bool {
        self.multi_stmt
    }

    pub fn is_prepare(&self) -> bool {
        self.is_prepare
    }

    pub fn prepare_name(&self) -> Option<&str> {
        self.prepare_name.as_deref()
    }

    pub fn preparable_sql(&self) -> Option<&str> {
        self.preparable_sql.as_deref()
    }

    pub fn kill_info(&self) -> Option<KillInfo> {
        self.kill
    }

    pub fn cacheable(&self) -> bool {
        self.cacheable
    }

    pub fn collected(&self) -> std::cell::Ref<'_, CollectedInfo> {
        self.collected.borrow()
    }

    /// Grow the collected data. Only the parser calls this, and only while
    /// the info is still effectively single-owned for writing purposes.
    pub fn grow_collected(&self, f: impl FnOnce(&mut CollectedInfo)) {
        f(&mut self.collected.borrow_mut());
        self.refresh_size();
    }

    pub fn covers(&self, collect: CollectLevel) -> bool {
        self.collected.borrow().collect_level.contains(collect)
    }

    /// Memory footprint estimate used by the cache size accounting.
    pub fn size(&self) -> usize {
        self.size.get()
    }

    fn refresh_size(&self) {
        let collected = self.collected.borrow();
        let mut size = std::mem::size_of::<ParseInfo>() + self.canonical.len();
        size += self
            .prepare_name
            .as_ref()
            .map(|n| n.len())
            .unwrap_or_default();
        size += self
            .preparable_sql
            .as_ref()
            .map(|s| s.len())
            .unwrap_or_default();
        size += collected
            .tables
            .iter()
            .map(|t| t.table.len() + t.db.as_ref().map(|d| d.len()).unwrap_or_default() + 16)
            .sum::<usize>();
        size += collected
            .fields
            .iter()
            .map(|f| f.column.len() + 8)
            .sum::<usize>();
        size += collected
            .functions
            .iter()
            .map(|f| f.name.len() + 8)
            .sum::<usize>();
        self.size.set(size);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qualified_table_names() {
        let bare = TableName::new(None, "scratch");
        assert_eq!(bare.qualified("orders"), "orders.scratch");
        let qualified = TableName::new(Some("other"), "scratch");
        assert_eq!(qualified.qualified("orders"), "other.scratch");
    }

    #[test]
    fn size_grows_with_collected_data() {
        let info = ParseInfo::failed("SELECT ?".to_string());
        let before = info.size();
        info.grow_collected(|c| {
            c.collect_level |= CollectLevel::TABLES;
            c.tables.push(TableName::new(None, "a_rather_long_table_name"));
        });
        assert!(info.size() > before);
    }
}
