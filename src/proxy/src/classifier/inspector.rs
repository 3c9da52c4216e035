//! A lightweight SQL surface scanner implementing the [`Parser`] contract.
//! It does not build a syntax tree; it lexes the statement, classifies it
//! from its leading keywords and collects the identifiers routing cares
//! about (tables, user variables, functions with routing significance).

use crate::buffer::Buffer;
use crate::classifier::canonical::{get_canonical, is_multi_stmt};
use crate::classifier::info::{
    CollectedInfo, FieldInfo, FunctionInfo, KillInfo, ParseInfo, TableName,
};
use crate::classifier::{
    CollectLevel, Operation, ParseResult, Parser, QueryInfo, SqlMode, StmtResult, TypeMask,
};
use crate::protocol::mysql::basic::extract_ps_id;
use crate::protocol::mysql::constants::{CommandCode, PS_DIRECT_EXEC_ID};

use std::cell::Cell;
use std::rc::Rc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tok<'a> {
    Word(&'a str),
    Str,
    Num,
    Punct(u8),
    /// `@name`
    Var(&'a str),
    /// `@@name` or `@@scope.name`
    SysVar(&'a str),
}

struct Lexer<'a> {
    bytes: &'a [u8],
    sql: &'a str,
    i: usize,
}

impl<'a> Lexer<'a> {
    fn new(sql: &'a str) -> Self {
        Lexer {
            bytes: sql.as_bytes(),
            sql,
            i: 0,
        }
    }
}

impl<'a> Iterator for Lexer<'a> {
    type Item = Tok<'a>;

    fn next(&mut self) -> Option<Tok<'a>> {
        let bytes = self.bytes;
        loop {
            while self.i < bytes.len() && bytes[self.i].is_ascii_whitespace() {
                self.i += 1;
            }
            if self.i >= bytes.len() {
                return None;
            }
            let b = bytes[self.i];
            match b {
                b'#' => {
                    while self.i < bytes.len() && bytes[self.i] != b'\n' {
                        self.i += 1;
                    }
                }
                b'-' if bytes.get(self.i + 1) == Some(&b'-')
                    && matches!(bytes.get(self.i + 2), Some(b' ') | Some(b'\t') | None) =>
                {
                    while self.i < bytes.len() && bytes[self.i] != b'\n' {
                        self.i += 1;
                    }
                }
                b'/' if bytes.get(self.i + 1) == Some(&b'*') => {
                    // executable comment bodies are lexed, plain ones skipped
                    if bytes.get(self.i + 2) == Some(&b'!') {
                        self.i += 3;
                        continue;
                    }
                    self.i += 2;
                    while self.i + 1 < bytes.len()
                        && !(bytes[self.i] == b'*' && bytes[self.i + 1] == b'/')
                    {
                        self.i += 1;
                    }
                    self.i = (self.i + 2).min(bytes.len());
                }
                b'*' if bytes.get(self.i + 1) == Some(&b'/') => {
                    self.i += 2;
                }
                b'\'' | b'"' => {
                    self.i = skip_quoted(bytes, self.i);
                    return Some(Tok::Str);
                }
                b'`' => {
                    let start = self.i + 1;
                    self.i = skip_quoted(bytes, self.i);
                    let end = self.i.saturating_sub(1).max(start);
                    return Some(Tok::Word(&self.sql[start..end]));
                }
                b'@' => {
                    if bytes.get(self.i + 1) == Some(&b'@') {
                        let start = self.i + 2;
                        let end = ident_end(bytes, start, true);
                        self.i = end;
                        return Some(Tok::SysVar(&self.sql[start..end]));
                    }
                    let start = self.i + 1;
                    let end = ident_end(bytes, start, true);
                    self.i = end;
                    return Some(Tok::Var(&self.sql[start..end]));
                }
                b'0'..=b'9' => {
                    while self.i < bytes.len()
                        && (bytes[self.i].is_ascii_alphanumeric()
                            || bytes[self.i] == b'.'
                            || bytes[self.i] == b'x'
                            || bytes[self.i] == b'X')
                    {
                        self.i += 1;
                    }
                    return Some(Tok::Num);
                }
                c if c.is_ascii_alphabetic() || c == b'_' || c == b'$' => {
                    let start = self.i;
                    let end = ident_end(bytes, start, false);
                    self.i = end;
                    return Some(Tok::Word(&self.sql[start..end]));
                }
                c => {
                    self.i += 1;
                    return Some(Tok::Punct(c));
                }
            }
        }
    }
}

fn ident_end(bytes: &[u8], start: usize, allow_dot: bool) -> usize {
    let mut i = start;
    while i < bytes.len() {
        let b = bytes[i];
        let ident = b.is_ascii_alphanumeric() || b == b'_' || b == b'$' || (allow_dot && b == b'.');
        if !ident {
            break;
        }
        i += 1;
    }
    i
}

fn skip_quoted(bytes: &[u8], start: usize) -> usize {
    let quote = bytes[start];
    let mut i = start + 1;
    while i < bytes.len() {
        if bytes[i] == b'\\' && quote != b'`' {
            i += 2;
            continue;
        }
        if bytes[i] == quote {
            if bytes.get(i + 1) == Some(&quote) {
                i += 2;
                continue;
            }
            return i + 1;
        }
        i += 1;
    }
    i
}

fn first_string_literal(sql: &str) -> Option<String> {
    let bytes = sql.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\'' | b'"' => {
                let end = skip_quoted(bytes, i);
                let inner = &sql[i + 1..end.saturating_sub(1).max(i + 1)];
                return Some(inner.replace("''", "'").replace("\\'", "'"));
            }
            b'`' => i = skip_quoted(bytes, i),
            _ => i += 1,
        }
    }
    None
}

/// The default statement parser.
pub struct InspectParser {
    sql_mode: Cell<SqlMode>,
    options: Cell<u32>,
}

impl Default for InspectParser {
    fn default() -> Self {
        Self::new()
    }
}

impl InspectParser {
    pub fn new() -> Self {
        InspectParser {
            sql_mode: Cell::new(SqlMode::Default),
            options: Cell::new(0),
        }
    }

    fn classify_sql(&self, sql: &str, is_binary_prepare: bool, collect: CollectLevel) -> ParseInfo {
        let mut canonical = get_canonical(sql);
        if is_binary_prepare {
            // P as in prepare, appended so execute-time and prepare-time
            // results of the same text never alias in the cache.
            canonical.push_str(":P");
        }
        if canonical.is_empty() {
            return ParseInfo::failed(canonical);
        }

        let toks: Vec<Tok> = Lexer::new(sql).collect();
        let words: Vec<&str> = toks
            .iter()
            .filter_map(|t| match t {
                Tok::Word(w) => Some(*w),
                _ => None,
            })
            .collect();
        if words.is_empty() {
            return ParseInfo::failed(canonical);
        }

        let mut type_mask = TypeMask::UNKNOWN;
        let mut op = Operation::Undefined;
        let mut status = ParseResult::Parsed;
        let mut relates_to_previous = false;
        let mut prepare_name = None;
        let mut preparable_sql = None;
        let mut kill = None;
        let mut collected = CollectedInfo {
            collect_level: collect,
            ..Default::default()
        };

        let kw = words[0].to_ascii_uppercase();
        match kw.as_str() {
            "SELECT" | "WITH" => {
                op = Operation::Select;
                type_mask |= TypeMask::READ;
                self.scan_select_body(&toks, &mut type_mask, &mut relates_to_previous);
                if has_keyword_pair(&words, "FOR", "UPDATE")
                    || has_keyword_seq(&words, &["LOCK", "IN", "SHARE", "MODE"])
                {
                    type_mask |= TypeMask::WRITE;
                }
                if has_keyword_pair(&words, "INTO", "OUTFILE")
                    || has_keyword_pair(&words, "INTO", "DUMPFILE")
                {
                    type_mask |= TypeMask::WRITE;
                }
                if collect.contains(CollectLevel::TABLES) {
                    collect_tables_after(&toks, &["FROM", "JOIN"], &mut collected.tables);
                }
            }
            "INSERT" | "REPLACE" => {
                op = Operation::Insert;
                type_mask |= TypeMask::WRITE;
                if collect.contains(CollectLevel::TABLES) {
                    collect_tables_after(&toks, &["INTO"], &mut collected.tables);
                }
            }
            "UPDATE" => {
                op = Operation::Update;
                type_mask |= TypeMask::WRITE;
                if collect.contains(CollectLevel::TABLES) {
                    collect_tables_after(&toks, &["UPDATE", "JOIN"], &mut collected.tables);
                }
            }
            "DELETE" => {
                op = Operation::Delete;
                type_mask |= TypeMask::WRITE;
                if collect.contains(CollectLevel::TABLES) {
                    collect_tables_after(&toks, &["FROM"], &mut collected.tables);
                }
            }
            "TRUNCATE" => {
                op = Operation::Truncate;
                type_mask |= TypeMask::WRITE;
                collect_tables_after(&toks, &["TRUNCATE", "TABLE"], &mut collected.tables);
            }
            "CREATE" => {
                op = Operation::Create;
                type_mask |= TypeMask::WRITE;
                if words.len() > 2 && words[1].eq_ignore_ascii_case("TEMPORARY") {
                    type_mask |= TypeMask::CREATE_TMP_TABLE;
                }
                collect_tables_after(&toks, &["TABLE"], &mut collected.tables);
            }
            "DROP" => {
                op = Operation::Drop;
                type_mask |= TypeMask::WRITE;
                if words.len() > 1 && words[1].eq_ignore_ascii_case("TABLE") {
                    op = Operation::DropTable;
                    collect_tables_after(&toks, &["TABLE"], &mut collected.tables);
                } else if words.len() > 1 && words[1].eq_ignore_ascii_case("PREPARE") {
                    type_mask = TypeMask::DEALLOC_PREPARE;
                    prepare_name = words.get(2).map(|w| w.to_string());
                }
            }
            "ALTER" => {
                op = Operation::Alter;
                type_mask |= TypeMask::WRITE;
                collect_tables_after(&toks, &["TABLE"], &mut collected.tables);
            }
            "RENAME" | "GRANT" | "REVOKE" => {
                op = match kw.as_str() {
                    "GRANT" => Operation::Grant,
                    "REVOKE" => Operation::Revoke,
                    _ => Operation::Alter,
                };
                type_mask |= TypeMask::WRITE;
            }
            "LOAD" => {
                op = Operation::Load;
                type_mask |= TypeMask::WRITE;
            }
            "BEGIN" | "START" => {
                type_mask |= TypeMask::BEGIN_TRX;
                if has_keyword_pair(&words, "READ", "ONLY") {
                    type_mask |= TypeMask::READ;
                } else if has_keyword_pair(&words, "READ", "WRITE") {
                    type_mask |= TypeMask::WRITE;
                }
            }
            "COMMIT" => {
                type_mask |= TypeMask::COMMIT;
            }
            "ROLLBACK" => {
                type_mask |= TypeMask::ROLLBACK;
            }
            "SET" => {
                op = Operation::Set;
                type_mask |= self.classify_set(&words, &toks);
            }
            "USE" => {
                op = Operation::ChangeDb;
                type_mask |= TypeMask::SESSION_WRITE;
            }
            "SHOW" => {
                op = Operation::Show;
                type_mask |= TypeMask::READ;
                if words.len() > 1
                    && (words[1].eq_ignore_ascii_case("MASTER")
                        || words[1].eq_ignore_ascii_case("BINARY"))
                {
                    type_mask |= TypeMask::MASTER_READ;
                }
            }
            "DESC" | "DESCRIBE" | "EXPLAIN" => {
                op = Operation::Explain;
                type_mask |= TypeMask::READ;
            }
            "CALL" => {
                op = Operation::Call;
                type_mask |= TypeMask::WRITE;
            }
            "PREPARE" => {
                // PREPARE stmt FROM 'select ...'
                type_mask |= TypeMask::PREPARE_NAMED_STMT;
                prepare_name = words.get(1).map(|w| w.to_string());
                preparable_sql = first_string_literal(sql);
            }
            "EXECUTE" => {
                op = Operation::Execute;
                type_mask |= TypeMask::EXEC_STMT;
                prepare_name = words.get(1).map(|w| w.to_string());
            }
            "DEALLOCATE" => {
                type_mask |= TypeMask::DEALLOC_PREPARE;
                // DEALLOCATE PREPARE name
                prepare_name = words.last().map(|w| w.to_string());
            }
            "KILL" => {
                op = Operation::Kill;
                let mut query_only = false;
                let mut soft = false;
                for w in &words[1..] {
                    if w.eq_ignore_ascii_case("QUERY") {
                        query_only = true;
                    } else if w.eq_ignore_ascii_case("SOFT") {
                        soft = true;
                    }
                }
                let target_id = toks
                    .iter()
                    .rev()
                    .find_map(|t| match t {
                        Tok::Num => Some(0u64),
                        _ => None,
                    })
                    .map(|_| last_number(sql))
                    .unwrap_or(0);
                kill = Some(KillInfo {
                    target_id,
                    query_only,
                    soft,
                });
            }
            "LOCK" | "UNLOCK" => {
                type_mask |= TypeMask::WRITE;
            }
            "HANDLER" => {
                type_mask |= TypeMask::READ;
            }
            _ => {
                status = ParseResult::Tokenized;
            }
        }

        if collect.contains(CollectLevel::FUNCTIONS) || matches!(op, Operation::Select) {
            collect_functions(&toks, collect, &mut collected.functions, &mut type_mask);
            if collected
                .functions
                .iter()
                .any(|f| f.name.eq_ignore_ascii_case("FOUND_ROWS"))
            {
                relates_to_previous = true;
            }
            if !collect.contains(CollectLevel::FUNCTIONS) {
                collected.functions.clear();
            }
        }
        if collect.contains(CollectLevel::FIELDS) && matches!(op, Operation::Select) {
            collect_fields(&toks, &mut collected.fields);
        }

        let multi = is_multi_stmt(sql);
        if is_binary_prepare {
            type_mask |= TypeMask::PREPARE_STMT;
        }

        ParseInfo::new(
            canonical,
            status,
            type_mask,
            op,
            relates_to_previous,
            multi,
            is_binary_prepare || type_mask.contains(TypeMask::PREPARE_NAMED_STMT),
            prepare_name,
            preparable_sql,
            kill,
            true,
            collected,
        )
    }

    fn scan_select_body(
        &self,
        toks: &[Tok],
        type_mask: &mut TypeMask,
        _relates: &mut bool,
    ) {
        let mut i = 0;
        while i < toks.len() {
            match toks[i] {
                Tok::Var(_) => {
                    if matches!(toks.get(i + 1), Some(Tok::Punct(b':')))
                        && matches!(toks.get(i + 2), Some(Tok::Punct(b'=')))
                    {
                        *type_mask |= TypeMask::USERVAR_WRITE;
                        i += 2;
                    } else {
                        *type_mask |= TypeMask::USERVAR_READ;
                    }
                }
                Tok::SysVar(name) => {
                    if name.len() >= 7 && name[..7].eq_ignore_ascii_case("global.") {
                        *type_mask |= TypeMask::GSYSVAR_READ;
                    } else {
                        *type_mask |= TypeMask::SYSVAR_READ;
                    }
                }
                _ => {}
            }
            i += 1;
        }
    }

    fn classify_set(&self, words: &[&str], toks: &[Tok]) -> TypeMask {
        // SET TRANSACTION READ ONLY / READ WRITE applies to the next
        // transaction only.
        let mut idx = 1;
        let mut global = false;
        let mut session_scope = false;
        while let Some(w) = words.get(idx) {
            if w.eq_ignore_ascii_case("GLOBAL") {
                global = true;
                idx += 1;
            } else if w.eq_ignore_ascii_case("SESSION") || w.eq_ignore_ascii_case("LOCAL") {
                session_scope = true;
                idx += 1;
            } else {
                break;
            }
        }

        if let Some(w) = words.get(idx) {
            if w.eq_ignore_ascii_case("TRANSACTION") && !global {
                return TypeMask::NEXT_TRX;
            }
            if w.eq_ignore_ascii_case("TRANSACTION") && global {
                return TypeMask::GSYSVAR_WRITE;
            }
            if w.eq_ignore_ascii_case("AUTOCOMMIT") {
                let enabling = words
                    .iter()
                    .any(|t| t.eq_ignore_ascii_case("ON") || t.eq_ignore_ascii_case("TRUE"))
                    || set_rhs_is_one(toks);
                return if enabling {
                    TypeMask::ENABLE_AUTOCOMMIT | TypeMask::COMMIT
                } else {
                    TypeMask::DISABLE_AUTOCOMMIT | TypeMask::BEGIN_TRX
                };
            }
        }

        let mut mask = TypeMask::UNKNOWN;
        for tok in toks {
            match tok {
                Tok::Var(_) => mask |= TypeMask::USERVAR_WRITE,
                Tok::SysVar(name) => {
                    if name.len() >= 7 && name[..7].eq_ignore_ascii_case("global.") {
                        mask |= TypeMask::GSYSVAR_WRITE;
                    } else {
                        mask |= TypeMask::SESSION_WRITE;
                    }
                }
                _ => {}
            }
        }
        if global {
            mask |= TypeMask::GSYSVAR_WRITE;
        }
        if mask.is_empty() || session_scope {
            // bare `SET name = value` touches a session variable
            mask |= TypeMask::SESSION_WRITE;
        }
        mask
    }

    fn parse_buffer(&self, stmt: &Buffer, collect: CollectLevel) -> ParseInfo {
        match stmt.sql() {
            Some(sql) => {
                let binary_prepare =
                    stmt.command() == Some(CommandCode::ComStmtPrepare as u8);
                self.classify_sql(&sql, binary_prepare, collect)
            }
            None => {
                // Not a text command; nothing to parse. Large trailing
                // frames are not cacheable, their bytes are arbitrary.
                let mut info = ParseInfo::failed(String::new());
                if stmt.payload_len() > 0 {
                    info = ParseInfo::new(
                        String::new(),
                        ParseResult::Parsed,
                        TypeMask::UNKNOWN,
                        Operation::Undefined,
                        false,
                        false,
                        false,
                        None,
                        None,
                        None,
                        false,
                        CollectedInfo::default(),
                    );
                }
                info
            }
        }
    }

    fn ensure_info(&self, stmt: &Buffer, collect: CollectLevel) -> Rc<ParseInfo> {
        if let Some(info) = stmt.info() {
            if !info.covers(collect) {
                self.collect_deeper(stmt, &info, collect);
            }
            return info;
        }
        let info = self.parse_fresh(stmt, collect);
        stmt.set_info(Rc::clone(&info));
        info
    }
}

fn set_rhs_is_one(toks: &[Tok]) -> bool {
    // crude but adequate: SET autocommit = <num>; the lexer collapses the
    // number, so look at the raw token stream shape.
    let mut saw_eq = false;
    for t in toks {
        match t {
            Tok::Punct(b'=') => saw_eq = true,
            Tok::Num if saw_eq => return true,
            Tok::Word(w) if saw_eq && w.eq_ignore_ascii_case("ON") => return true,
            _ => {}
        }
    }
    false
}

fn last_number(sql: &str) -> u64 {
    let mut cur = 0u64;
    let mut last = 0u64;
    let mut in_num = false;
    for b in sql.bytes() {
        if b.is_ascii_digit() {
            cur = cur.wrapping_mul(10).wrapping_add((b - b'0') as u64);
            in_num = true;
        } else if in_num {
            last = cur;
            cur = 0;
            in_num = false;
        }
    }
    if in_num {
        last = cur;
    }
    last
}

fn has_keyword_pair(words: &[&str], a: &str, b: &str) -> bool {
    words
        .windows(2)
        .any(|w| w[0].eq_ignore_ascii_case(a) && w[1].eq_ignore_ascii_case(b))
}

fn has_keyword_seq(words: &[&str], seq: &[&str]) -> bool {
    words.windows(seq.len()).any(|w| {
        w.iter()
            .zip(seq.iter())
            .all(|(a, b)| a.eq_ignore_ascii_case(b))
    })
}

const TABLE_STOP_WORDS: &[&str] = &[
    "WHERE", "SET", "GROUP", "ORDER", "HAVING", "LIMIT", "ON", "USING", "VALUES", "SELECT", "AS",
    "LEFT", "RIGHT", "INNER", "OUTER", "CROSS", "STRAIGHT_JOIN", "JOIN", "UNION", "FOR", "INTO",
    "PARTITION", "IF", "NOT", "EXISTS", "LIKE", "IGNORE", "LOW_PRIORITY", "QUICK", "TEMPORARY",
];

fn collect_tables_after(toks: &[Tok], triggers: &[&str], out: &mut Vec<TableName>) {
    let mut i = 0;
    while i < toks.len() {
        let is_trigger = match toks[i] {
            Tok::Word(w) => triggers.iter().any(|t| w.eq_ignore_ascii_case(t)),
            _ => false,
        };
        if is_trigger {
            let mut j = i + 1;
            loop {
                // skip noise words (and chained trigger keywords) before
                // the table reference
                while let Some(Tok::Word(w)) = toks.get(j) {
                    let noise = TABLE_STOP_WORDS.iter().any(|s| w.eq_ignore_ascii_case(s))
                        || triggers.iter().any(|t| w.eq_ignore_ascii_case(t));
                    if noise {
                        j += 1;
                    } else {
                        break;
                    }
                }
                let Some(Tok::Word(first)) = toks.get(j) else {
                    break;
                };
                let mut db = None;
                let mut table = *first;
                if let (Some(Tok::Punct(b'.')), Some(Tok::Word(second))) =
                    (toks.get(j + 1), toks.get(j + 2))
                {
                    db = Some(*first);
                    table = *second;
                    j += 2;
                }
                let name = TableName::new(db, table);
                if !out.contains(&name) {
                    out.push(name);
                }
                j += 1;
                // another table follows only after a comma
                if matches!(toks.get(j), Some(Tok::Punct(b','))) {
                    j += 1;
                    continue;
                }
                break;
            }
            i = j;
        } else {
            i += 1;
        }
    }
}

const ROUTING_FUNCTIONS: &[&str] = &[
    "FOUND_ROWS",
    "LAST_INSERT_ID",
    "ROW_COUNT",
    "GET_LOCK",
    "RELEASE_LOCK",
    "IS_FREE_LOCK",
    "IS_USED_LOCK",
    "MASTER_POS_WAIT",
    "RAND",
    "UUID",
    "SLEEP",
];

fn collect_functions(
    toks: &[Tok],
    collect: CollectLevel,
    out: &mut Vec<FunctionInfo>,
    type_mask: &mut TypeMask,
) {
    for (i, t) in toks.iter().enumerate() {
        let Tok::Word(w) = t else { continue };
        if !matches!(toks.get(i + 1), Some(Tok::Punct(b'('))) {
            continue;
        }
        let upper = w.to_ascii_uppercase();
        match upper.as_str() {
            "LAST_INSERT_ID" | "ROW_COUNT" => *type_mask |= TypeMask::MASTER_READ,
            "GET_LOCK" | "RELEASE_LOCK" | "IS_FREE_LOCK" | "IS_USED_LOCK" | "MASTER_POS_WAIT" => {
                *type_mask |= TypeMask::WRITE
            }
            _ => {}
        }
        if collect.contains(CollectLevel::FUNCTIONS)
            || ROUTING_FUNCTIONS.iter().any(|f| *f == upper)
        {
            if !out.iter().any(|f| f.name.eq_ignore_ascii_case(w)) {
                out.push(FunctionInfo {
                    name: w.to_string(),
                });
            }
        }
    }
}

fn collect_fields(toks: &[Tok], out: &mut Vec<FieldInfo>) {
    // fields between SELECT and FROM, bare identifiers only
    let mut in_list = false;
    for (i, t) in toks.iter().enumerate() {
        match t {
            Tok::Word(w) if w.eq_ignore_ascii_case("SELECT") => in_list = true,
            Tok::Word(w) if w.eq_ignore_ascii_case("FROM") => break,
            Tok::Word(w) if in_list => {
                if matches!(toks.get(i + 1), Some(Tok::Punct(b'('))) {
                    continue;
                }
                if !out.iter().any(|f| f.column == *w) {
                    out.push(FieldInfo {
                        column: w.to_string(),
                    });
                }
            }
            _ => {}
        }
    }
}

impl Parser for InspectParser {
    fn parse(&self, stmt: &Buffer, collect: CollectLevel) -> ParseResult {
        self.ensure_info(stmt, collect).status()
    }

    fn stmt_result(&self, info: &ParseInfo) -> StmtResult {
        StmtResult {
            status: info.status(),
            type_mask: info.type_mask(),
            op: info.op(),
            size: info.size(),
        }
    }

    fn get_type_mask(&self, stmt: &Buffer) -> TypeMask {
        self.ensure_info(stmt, CollectLevel::ESSENTIALS).type_mask()
    }

    fn get_operation(&self, stmt: &Buffer) -> Operation {
        self.ensure_info(stmt, CollectLevel::ESSENTIALS).op()
    }

    fn get_table_names(&self, stmt: &Buffer) -> Vec<TableName> {
        self.ensure_info(stmt, CollectLevel::TABLES)
            .collected()
            .tables
            .clone()
    }

    fn get_field_info(&self, stmt: &Buffer) -> Vec<FieldInfo> {
        self.ensure_info(stmt, CollectLevel::FIELDS)
            .collected()
            .fields
            .clone()
    }

    fn get_function_info(&self, stmt: &Buffer) -> Vec<FunctionInfo> {
        self.ensure_info(stmt, CollectLevel::FUNCTIONS)
            .collected()
            .functions
            .clone()
    }

    fn get_kill_info(&self, stmt: &Buffer) -> Option<KillInfo> {
        self.ensure_info(stmt, CollectLevel::ESSENTIALS).kill_info()
    }

    fn get_preparable_stmt(&self, stmt: &Buffer) -> Option<Buffer> {
        let info = self.ensure_info(stmt, CollectLevel::ESSENTIALS);
        if stmt.command() == Some(CommandCode::ComStmtPrepare as u8) {
            return stmt.sql().map(|sql| Buffer::com_query(&sql));
        }
        info.preparable_sql().map(Buffer::com_query)
    }

    fn get_prepare_name(&self, stmt: &Buffer) -> Option<String> {
        self.ensure_info(stmt, CollectLevel::ESSENTIALS)
            .prepare_name()
            .map(str::to_string)
    }

    fn get_query_info(&self, stmt: &Buffer) -> QueryInfo {
        let command = stmt.command().unwrap_or(0xff);
        let ps_packet = CommandCode::is_ps_command(command);
        let ps_id = if ps_packet {
            extract_ps_id(stmt.wire())
        } else {
            0
        };
        let query = command == CommandCode::ComQuery as u8;
        let prepare = command == CommandCode::ComStmtPrepare as u8;

        let (type_mask, op, multi_stmt, relates) = if query || prepare {
            let info = self.ensure_info(stmt, CollectLevel::ESSENTIALS);
            (
                info.type_mask(),
                info.op(),
                info.is_multi_stmt(),
                info.relates_to_previous(),
            )
        } else {
            (TypeMask::UNKNOWN, Operation::Undefined, false, false)
        };

        QueryInfo {
            command,
            ps_id,
            ps_direct_exec_id: ps_packet && ps_id == PS_DIRECT_EXEC_ID,
            ps_packet,
            query,
            multi_part_packet: stmt.is_large(),
            multi_stmt,
            relates_to_previous: relates,
            empty: stmt.payload_len() == 0,
            type_mask,
            op,
        }
    }

    fn get_canonical(&self, stmt: &Buffer) -> String {
        self.ensure_info(stmt, CollectLevel::ESSENTIALS)
            .canonical()
            .to_string()
    }

    fn is_prepare(&self, stmt: &Buffer) -> bool {
        stmt.command() == Some(CommandCode::ComStmtPrepare as u8)
    }

    fn is_query(&self, stmt: &Buffer) -> bool {
        stmt.command() == Some(CommandCode::ComQuery as u8)
    }

    fn is_ps_packet(&self, stmt: &Buffer) -> bool {
        stmt.command()
            .map(CommandCode::is_ps_command)
            .unwrap_or(false)
    }

    fn is_execute_immediately_ps(&self, stmt: &Buffer) -> bool {
        self.is_ps_packet(stmt) && extract_ps_id(stmt.wire()) == PS_DIRECT_EXEC_ID
    }

    fn get_ps_id(&self, stmt: &Buffer) -> u32 {
        extract_ps_id(stmt.wire())
    }

    fn is_ps_direct_exec_id(&self, id: u32) -> bool {
        id == PS_DIRECT_EXEC_ID
    }

    fn continues_ps(&self, stmt: &Buffer, prev_command: u8) -> bool {
        let Some(cmd) = stmt.command() else {
            return false;
        };
        if prev_command == CommandCode::ComStmtSendLongData as u8
            && (cmd == CommandCode::ComStmtExecute as u8
                || cmd == CommandCode::ComStmtSendLongData as u8)
        {
            // execution must land where the long data was sent
            return true;
        }
        // a fetch always goes where the execute went
        cmd == CommandCode::ComStmtFetch as u8
    }

    fn relates_to_previous(&self, stmt: &Buffer) -> bool {
        self.ensure_info(stmt, CollectLevel::ESSENTIALS)
            .relates_to_previous()
    }

    fn is_multi_stmt(&self, stmt: &Buffer) -> bool {
        self.ensure_info(stmt, CollectLevel::ESSENTIALS)
            .is_multi_stmt()
    }

    fn get_trx_type_mask(&self, stmt: &Buffer) -> TypeMask {
        const TRX_BITS: TypeMask = TypeMask::BEGIN_TRX
            .union(TypeMask::COMMIT)
            .union(TypeMask::ROLLBACK)
            .union(TypeMask::ENABLE_AUTOCOMMIT)
            .union(TypeMask::DISABLE_AUTOCOMMIT)
            .union(TypeMask::READ)
            .union(TypeMask::WRITE)
            .union(TypeMask::NEXT_TRX);
        self.get_type_mask(stmt) & TRX_BITS
    }

    fn get_sql_mode(&self) -> SqlMode {
        self.sql_mode.get()
    }

    fn set_sql_mode(&self, sql_mode: SqlMode) {
        self.sql_mode.set(sql_mode);
    }

    fn get_options(&self) -> u32 {
        self.options.get()
    }

    fn set_options(&self, options: u32) -> bool {
        self.options.set(options);
        true
    }

    fn parse_fresh(&self, stmt: &Buffer, collect: CollectLevel) -> Rc<ParseInfo> {
        Rc::new(self.parse_buffer(stmt, collect))
    }

    fn collect_deeper(&self, stmt: &Buffer, info: &ParseInfo, collect: CollectLevel) {
        let Some(sql) = stmt.sql() else {
            return;
        };
        let merged = info.collected().collect_level | collect;
        let fresh = self.classify_sql(
            &sql,
            stmt.command() == Some(CommandCode::ComStmtPrepare as u8),
            merged,
        );
        info.grow_collected(|c| {
            let fresh_collected = fresh.collected();
            c.collect_level = merged;
            if collect.contains(CollectLevel::TABLES) {
                c.tables = fresh_collected.tables.clone();
            }
            if collect.contains(CollectLevel::FIELDS) {
                c.fields = fresh_collected.fields.clone();
            }
            if collect.contains(CollectLevel::FUNCTIONS) {
                c.functions = fresh_collected.functions.clone();
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parser() -> InspectParser {
        InspectParser::new()
    }

    #[test]
    fn classifies_simple_select() {
        let p = parser();
        let buf = Buffer::com_query("SELECT id FROM t WHERE id=42");
        let mask = p.get_type_mask(&buf);
        assert_eq!(mask, TypeMask::READ);
        assert_eq!(p.get_operation(&buf), Operation::Select);
    }

    #[test]
    fn classifies_update_as_write() {
        let p = parser();
        let buf = Buffer::com_query("UPDATE t SET v=1 WHERE id=42");
        assert!(p.get_type_mask(&buf).contains(TypeMask::WRITE));
        assert_eq!(p.get_operation(&buf), Operation::Update);
    }

    #[test]
    fn classifies_transaction_statements() {
        let p = parser();
        assert!(p
            .get_type_mask(&Buffer::com_query("START TRANSACTION"))
            .contains(TypeMask::BEGIN_TRX));
        assert!(p
            .get_type_mask(&Buffer::com_query("COMMIT"))
            .contains(TypeMask::COMMIT));
        assert!(p
            .get_type_mask(&Buffer::com_query("ROLLBACK"))
            .contains(TypeMask::ROLLBACK));
        let ro = p.get_type_mask(&Buffer::com_query("START TRANSACTION READ ONLY"));
        assert!(ro.contains(TypeMask::BEGIN_TRX | TypeMask::READ));
    }

    #[test]
    fn classifies_autocommit_toggles() {
        let p = parser();
        let on = p.get_type_mask(&Buffer::com_query("SET autocommit=1"));
        assert!(on.contains(TypeMask::ENABLE_AUTOCOMMIT | TypeMask::COMMIT));
        let off = p.get_type_mask(&Buffer::com_query("SET autocommit=0"));
        assert!(off.contains(TypeMask::DISABLE_AUTOCOMMIT | TypeMask::BEGIN_TRX));
    }

    #[test]
    fn classifies_set_transaction_read_only_as_next_trx() {
        let p = parser();
        let mask = p.get_type_mask(&Buffer::com_query("SET TRANSACTION READ ONLY"));
        assert!(mask.contains(TypeMask::NEXT_TRX));
    }

    #[test]
    fn classifies_variable_access() {
        let p = parser();
        assert!(p
            .get_type_mask(&Buffer::com_query("SELECT @v"))
            .contains(TypeMask::USERVAR_READ));
        assert!(p
            .get_type_mask(&Buffer::com_query("SET @v = 1"))
            .contains(TypeMask::USERVAR_WRITE));
        assert!(p
            .get_type_mask(&Buffer::com_query("SELECT @@max_connections"))
            .contains(TypeMask::SYSVAR_READ));
        assert!(p
            .get_type_mask(&Buffer::com_query("SET @@global.read_only = 1"))
            .contains(TypeMask::GSYSVAR_WRITE));
    }

    #[test]
    fn create_temporary_table() {
        let p = parser();
        let buf = Buffer::com_query("CREATE TEMPORARY TABLE scratch (x INT)");
        let mask = p.get_type_mask(&buf);
        assert!(mask.contains(TypeMask::CREATE_TMP_TABLE));
        let tables = p.get_table_names(&buf);
        assert_eq!(tables, vec![TableName::new(None, "scratch")]);
    }

    #[test]
    fn collects_tables_from_select() {
        let p = parser();
        let buf = Buffer::com_query("SELECT a.x, b.y FROM orders a JOIN db2.lines b ON a.id=b.id");
        let tables = p.get_table_names(&buf);
        assert!(tables.contains(&TableName::new(None, "orders")));
        assert!(tables.contains(&TableName::new(Some("db2"), "lines")));
    }

    #[test]
    fn drop_table_collects_names() {
        let p = parser();
        let buf = Buffer::com_query("DROP TABLE IF EXISTS scratch");
        assert_eq!(p.get_operation(&buf), Operation::DropTable);
        assert_eq!(p.get_table_names(&buf), vec![TableName::new(None, "scratch")]);
    }

    #[test]
    fn found_rows_relates_to_previous() {
        let p = parser();
        let buf = Buffer::com_query("SELECT FOUND_ROWS()");
        assert!(p.relates_to_previous(&buf));
    }

    #[test]
    fn last_insert_id_is_master_read() {
        let p = parser();
        let buf = Buffer::com_query("SELECT LAST_INSERT_ID()");
        assert!(p.get_type_mask(&buf).contains(TypeMask::MASTER_READ));
    }

    #[test]
    fn named_prepare_and_execute() {
        let p = parser();
        let prep = Buffer::com_query("PREPARE stmt1 FROM 'SELECT * FROM t WHERE id = ?'");
        let mask = p.get_type_mask(&prep);
        assert!(mask.contains(TypeMask::PREPARE_NAMED_STMT));
        assert_eq!(p.get_prepare_name(&prep).as_deref(), Some("stmt1"));
        let inner = p.get_preparable_stmt(&prep).unwrap();
        assert_eq!(inner.sql().unwrap(), "SELECT * FROM t WHERE id = ?");

        let exec = Buffer::com_query("EXECUTE stmt1");
        assert!(p.get_type_mask(&exec).contains(TypeMask::EXEC_STMT));
        assert_eq!(p.get_operation(&exec), Operation::Execute);

        let dealloc = Buffer::com_query("DEALLOCATE PREPARE stmt1");
        assert!(p.get_type_mask(&dealloc).contains(TypeMask::DEALLOC_PREPARE));
        assert_eq!(p.get_prepare_name(&dealloc).as_deref(), Some("stmt1"));
    }

    #[test]
    fn binary_prepare_gets_prepare_suffix_and_flag() {
        let p = parser();
        let mut payload = vec![CommandCode::ComStmtPrepare as u8];
        payload.extend_from_slice(b"SELECT name FROM users WHERE id=?");
        let buf = Buffer::from_payload(0, &payload);
        assert!(p.is_prepare(&buf));
        let canonical = p.get_canonical(&buf);
        assert!(canonical.ends_with(":P"), "got {canonical}");
        assert!(p.get_type_mask(&buf).contains(TypeMask::PREPARE_STMT));
    }

    #[test]
    fn kill_statement_info() {
        let p = parser();
        let buf = Buffer::com_query("KILL QUERY 4211");
        let kill = p.get_kill_info(&buf).unwrap();
        assert_eq!(kill.target_id, 4211);
        assert!(kill.query_only);
    }

    #[test]
    fn unknown_statement_is_tokenized_with_unknown_mask() {
        let p = parser();
        let buf = Buffer::com_query("FROBNICATE THE DATABASE");
        assert_eq!(p.parse(&buf, CollectLevel::ESSENTIALS), ParseResult::Tokenized);
        assert!(p.get_type_mask(&buf).is_unknown());
    }

    #[test]
    fn query_info_for_execute_packet() {
        let p = parser();
        let mut payload = vec![CommandCode::ComStmtExecute as u8];
        payload.extend(7u32.to_le_bytes());
        payload.push(0);
        payload.extend(1u32.to_le_bytes());
        let buf = Buffer::from_payload(0, &payload);
        let qi = p.get_query_info(&buf);
        assert!(qi.ps_packet);
        assert_eq!(qi.ps_id, 7);
        assert!(!qi.ps_direct_exec_id);
        assert!(!qi.query);
    }

    #[test]
    fn classifying_twice_is_deterministic() {
        let p = parser();
        let a = Buffer::com_query("SELECT id FROM t WHERE id=42");
        let b = Buffer::com_query("SELECT id FROM t WHERE id=43");
        assert_eq!(p.get_type_mask(&a), p.get_type_mask(&b));
        assert_eq!(p.get_operation(&a), p.get_operation(&b));
        assert_eq!(p.get_canonical(&a), p.get_canonical(&b));
    }

    #[test]
    fn deeper_collect_grows_existing_info() {
        let p = parser();
        let buf = Buffer::com_query("SELECT x FROM t1 JOIN t2 ON t1.a=t2.a");
        let info = p.parse_fresh(&buf, CollectLevel::ESSENTIALS);
        assert!(info.collected().tables.is_empty());
        let size_before = info.size();
        p.collect_deeper(&buf, &info, CollectLevel::TABLES);
        assert_eq!(info.collected().tables.len(), 2);
        assert!(info.size() > size_before);
    }
}
