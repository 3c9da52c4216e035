//! Thread-local memoization of classification results, keyed on the
//! canonical statement text. Each worker owns one cache; the only shared
//! state is the global size target, which stays an atomic so an admin
//! update never has to take a lock.

use crate::buffer::Buffer;
use crate::classifier::canonical::get_canonical;
use crate::classifier::info::ParseInfo;
use crate::classifier::{Parser, SqlMode, StmtResult};
use crate::worker::Worker;

use indexmap::IndexMap;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::hash::BuildHasherDefault;
use std::rc::Rc;
use std::sync::atomic::{AtomicI64, Ordering};
use tracing::{error, info, warn};
use twox_hash::XxHash64;

// Relaxed ordering on purpose: workers re-read lazily, an admin update
// only needs to become visible eventually.
static CACHE_MAX_SIZE: AtomicI64 = AtomicI64::new(i64::MAX);

/// Entries above this never enter the cache; it is the maximum MySQL
/// packet payload minus header and command byte.
const MAX_ENTRY_SIZE: i64 = 0xffffff - 5;

/// Discount for memory the size estimate cannot see.
const QUOTA_DISCOUNT: f64 = 0.65;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Properties {
    pub max_size: i64,
}

pub fn set_properties(properties: &Properties) -> bool {
    if properties.max_size >= 0 {
        if properties.max_size == 0 {
            info!("Query classifier cache disabled.");
        }
        CACHE_MAX_SIZE.store(properties.max_size, Ordering::Relaxed);
        true
    } else {
        error!(
            "Ignoring attempt to set size of query classifier cache to a negative value: {}.",
            properties.max_size
        );
        false
    }
}

pub fn get_properties() -> Properties {
    Properties {
        max_size: CACHE_MAX_SIZE.load(Ordering::Relaxed),
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub size: i64,
    pub inserts: i64,
    pub hits: i64,
    pub misses: i64,
    pub evictions: i64,
}

/// Snapshot of one entry for the admin surface.
#[derive(Debug, Clone, Copy)]
pub struct StateEntry {
    pub hits: i64,
    pub result: StmtResult,
}

struct Entry {
    info: Rc<ParseInfo>,
    sql_mode: SqlMode,
    options: u32,
    hits: i64,
}

fn entry_size(key: &str, info: &ParseInfo) -> i64 {
    let map_entry_overhead = 4 * std::mem::size_of::<usize>();
    (key.len() + std::mem::size_of::<Entry>() + map_entry_overhead + info.size()) as i64
}

/// Per-worker quota. Uses how many workers are running right now, not how
/// many are configured, so shrinking the worker count grows the quota of
/// the survivors.
pub fn thread_cache_max_size() -> i64 {
    let running = crate::worker::running_workers().max(1) as i64;
    let per_thread = CACHE_MAX_SIZE.load(Ordering::Relaxed) / running;
    (per_thread as f64 * QUOTA_DISCOUNT) as i64
}

type InfosByStmt = IndexMap<String, Entry, BuildHasherDefault<XxHash64>>;

/// The per-thread cache proper.
pub struct InfoCache {
    infos: InfosByStmt,
    stats: CacheStats,
    rng: StdRng,
    cache_max_size: i64,
}

impl InfoCache {
    fn new() -> Self {
        InfoCache {
            infos: InfosByStmt::default(),
            stats: CacheStats::default(),
            rng: StdRng::from_entropy(),
            cache_max_size: thread_cache_max_size(),
        }
    }

    pub fn cache_max_size(&self) -> i64 {
        self.cache_max_size
    }

    pub fn update_cache_max_size(&mut self) {
        self.cache_max_size = thread_cache_max_size();
    }

    pub fn peek(&self, canonical: &str) -> Option<&Rc<ParseInfo>> {
        self.infos.get(canonical).map(|e| &e.info)
    }

    pub fn get(
        &mut self,
        canonical: &str,
        sql_mode: SqlMode,
        options: u32,
    ) -> Option<Rc<ParseInfo>> {
        match self.infos.get_full_mut(canonical) {
            Some((index, _, entry)) => {
                if entry.sql_mode == sql_mode && entry.options == options {
                    entry.hits += 1;
                    self.stats.hits += 1;
                    Some(Rc::clone(&entry.info))
                } else {
                    // produced under different parser settings, useless now
                    self.erase_index(index);
                    self.stats.misses += 1;
                    None
                }
            }
            None => {
                self.stats.misses += 1;
                None
            }
        }
    }

    pub fn insert(
        &mut self,
        canonical: &str,
        info: Rc<ParseInfo>,
        sql_mode: SqlMode,
        options: u32,
    ) {
        debug_assert!(self.peek(canonical).is_none());

        let size = entry_size(canonical, &info);
        if size >= MAX_ENTRY_SIZE || size > self.cache_max_size {
            return;
        }

        let required_space = (self.stats.size + size) - self.cache_max_size;
        if required_space > 0 {
            self.make_space(required_space);
        }

        if self.stats.size + size <= self.cache_max_size {
            self.infos.insert(
                canonical.to_string(),
                Entry {
                    info,
                    sql_mode,
                    options,
                    hits: 0,
                },
            );
            self.stats.inserts += 1;
            self.stats.size += size;
        }
    }

    /// Account for an entry that grew in place after a deeper collect.
    pub fn update_total_size(&mut self, delta: i64) {
        self.stats.size += delta;
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    pub fn get_state(&self, state: &mut BTreeMap<String, StateEntry>, top: usize, parser: &dyn Parser) {
        let mut entries: Vec<(&String, &Entry)> = self.infos.iter().collect();
        let keep = top.min(entries.len());
        if keep == 0 {
            return;
        }
        entries.select_nth_unstable_by(keep - 1, |a, b| b.1.hits.cmp(&a.1.hits));
        entries.truncate(keep);

        for (stmt, entry) in entries {
            let result = parser.stmt_result(&entry.info);
            match state.get_mut(stmt) {
                None => {
                    state.insert(
                        stmt.clone(),
                        StateEntry {
                            hits: entry.hits,
                            result,
                        },
                    );
                }
                Some(existing) => {
                    existing.hits += entry.hits;
                    if result.size > existing.result.size {
                        // one worker may have collected deeper than another
                        existing.result.size = result.size;
                    }
                }
            }
        }
    }

    /// Drop entries until the cache fits its quota again.
    pub fn evict_surplus(&mut self) {
        if self.cache_max_size == 0 && self.stats.size != 0 {
            self.clear();
        } else if self.stats.size > self.cache_max_size {
            self.make_space(self.stats.size - self.cache_max_size);
        }
        debug_assert!(self.stats.size <= self.cache_max_size.max(0));
    }

    pub fn clear(&mut self) -> i64 {
        let mut size = 0;
        while !self.infos.is_empty() {
            size += self.erase_index(self.infos.len() - 1);
        }

        // A disciplined owner model makes a residue impossible; treat any
        // discrepancy as a bug instead of logging it away.
        debug_assert_eq!(self.stats.size, 0, "cache book-keeping residue after clear");
        if self.stats.size != 0 {
            error!(
                "After clearing all entries and {} bytes from the cache, the book-keeping \
                 claims {} bytes remain.",
                size, self.stats.size
            );
        }
        self.stats.size = 0;
        size
    }

    pub fn len(&self) -> usize {
        self.infos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.infos.is_empty()
    }

    fn make_space(&mut self, required_space: i64) {
        let mut freed_space = 0;
        while freed_space < required_space && !self.infos.is_empty() {
            freed_space += self.evict_one();
        }
    }

    /// Draw a random slot and evict it. The walk of the original bucket
    /// scheme degenerates to a single probe here because every slot of the
    /// index is occupied; an empty cache terminates immediately.
    fn evict_one(&mut self) -> i64 {
        if self.infos.is_empty() {
            return 0;
        }
        let start = self.rng.gen_range(0..self.infos.len());
        self.erase_index(start)
    }

    fn erase_index(&mut self, index: usize) -> i64 {
        let Some((key, entry)) = self.infos.swap_remove_index(index) else {
            return 0;
        };
        let size = entry_size(&key, &entry.info);
        self.stats.size -= size;
        self.stats.evictions += 1;
        size
    }
}

struct ThreadState {
    cache: Option<InfoCache>,
    refs: i32,
    use_cache: bool,
    size_being_adjusted: bool,
}

thread_local! {
    static THIS_THREAD: RefCell<ThreadState> = RefCell::new(ThreadState {
        cache: None,
        refs: 0,
        use_cache: true,
        size_being_adjusted: false,
    });
}

/// Workers call this from their startup hook.
pub fn thread_init() {
    THIS_THREAD.with(|state| {
        let mut state = state.borrow_mut();
        if state.cache.is_none() {
            state.cache = Some(InfoCache::new());
        }
        state.refs += 1;
    });
}

pub fn thread_finish() {
    THIS_THREAD.with(|state| {
        let mut state = state.borrow_mut();
        debug_assert!(state.refs > 0);
        state.refs -= 1;
        if state.refs == 0 {
            state.cache = None;
        }
    });
}

pub fn set_thread_cache_enabled(enabled: bool) {
    THIS_THREAD.with(|state| {
        let mut state = state.borrow_mut();
        state.use_cache = enabled;
        if !enabled {
            if let Some(cache) = state.cache.as_mut() {
                cache.clear();
            }
        }
    });
}

pub fn clear_thread_cache() -> i64 {
    THIS_THREAD.with(|state| {
        state
            .borrow_mut()
            .cache
            .as_mut()
            .map(|c| c.clear())
            .unwrap_or(0)
    })
}

pub fn get_thread_cache_stats() -> Option<CacheStats> {
    THIS_THREAD.with(|state| state.borrow().cache.as_ref().map(|c| c.stats()))
}

pub fn get_thread_cache_state(
    state_out: &mut BTreeMap<String, StateEntry>,
    top: usize,
    parser: &dyn Parser,
) {
    THIS_THREAD.with(|state| {
        if let Some(cache) = state.borrow().cache.as_ref() {
            cache.get_state(state_out, top, parser);
        }
    });
}

/// Whether classification may consult the cache right now. Also the point
/// where a stale per-thread quota is noticed: the refresh is deferred to an
/// lcall so it never runs while a scope is mid-flight.
fn use_cached_result() -> bool {
    THIS_THREAD.with(|state| {
        let mut state = state.borrow_mut();
        if !state.use_cache || state.cache.is_none() {
            return false;
        }

        let max_size = thread_cache_max_size();
        let current = state.cache.as_ref().map(|c| c.cache_max_size()).unwrap_or(0);
        if max_size != current && !state.size_being_adjusted {
            state.size_being_adjusted = true;
            // Adjusting the quota while a scope is mid-flight leads to
            // book-keeping trouble; defer to the end of the iteration.
            let scheduled = Worker::lcall_current(Box::new(|_| {
                THIS_THREAD.with(|state| {
                    let mut state = state.borrow_mut();
                    if let Some(cache) = state.cache.as_mut() {
                        cache.update_cache_max_size();
                        cache.evict_surplus();
                    }
                    state.size_being_adjusted = false;
                });
            }));
            if !scheduled {
                // not on a worker thread (tests); adjust inline
                if let Some(cache) = state.cache.as_mut() {
                    cache.update_cache_max_size();
                    cache.evict_surplus();
                }
                state.size_being_adjusted = false;
            }
        }

        max_size != 0
    })
}

const ADD_TO_CACHE: usize = usize::MAX;

/// Guard implementing the request-time protocol: attach a cached result on
/// entry, insert or account growth on exit.
pub struct CachingScope<'a> {
    parser: &'a dyn Parser,
    stmt: &'a Buffer,
    use_cached_result: bool,
    info_size_before: usize,
    canonical: Option<String>,
}

impl<'a> CachingScope<'a> {
    pub fn new(parser: &'a dyn Parser, stmt: &'a Buffer) -> Self {
        let mut scope = CachingScope {
            parser,
            stmt,
            use_cached_result: use_cached_result(),
            info_size_before: 0,
            canonical: None,
        };

        if !scope.use_cached_result {
            return scope;
        }

        if let Some(cached) = stmt.info() {
            // Not the first classification call for this buffer; remember
            // the size so growth can be accounted on drop.
            scope.info_size_before = cached.size();
            return scope;
        }

        // Canonicalize here instead of through the parser: the parser's
        // get_canonical would itself open a scope.
        let mut canonical = match stmt.sql() {
            Some(sql) => get_canonical(&sql),
            None => String::new(),
        };
        if scope.parser.is_prepare(stmt) {
            // P as in prepare, appended so the lookup key matches what the
            // parser produces without copying the text.
            canonical.push_str(":P");
        }

        let hit = THIS_THREAD.with(|state| {
            let mut state = state.borrow_mut();
            let sql_mode = scope.parser.get_sql_mode();
            let options = scope.parser.get_options();
            state
                .cache
                .as_mut()
                .and_then(|c| c.get(&canonical, sql_mode, options))
        });

        if let Some(info) = hit {
            scope.info_size_before = info.size();
            stmt.set_info(info);
        } else if !canonical.is_empty() {
            scope.info_size_before = ADD_TO_CACHE;
            scope.canonical = Some(canonical);
        }

        scope
    }
}

impl Drop for CachingScope<'_> {
    fn drop(&mut self) {
        if !self.use_cached_result {
            return;
        }
        let Some(info) = self.stmt.info() else {
            return;
        };
        if !info.cacheable() {
            return;
        }

        if self.info_size_before == ADD_TO_CACHE {
            let canonical = self.canonical.take().unwrap_or_default();
            debug_assert_eq!(canonical, info.canonical());
            let sql_mode = self.parser.get_sql_mode();
            let options = self.parser.get_options();
            THIS_THREAD.with(|state| {
                let mut state = state.borrow_mut();
                if let Some(cache) = state.cache.as_mut() {
                    if cache.peek(info.canonical()).is_none() {
                        cache.insert(info.canonical(), Rc::clone(&info), sql_mode, options);
                    }
                }
            });
        } else {
            let info_size_after = info.size();
            if self.info_size_before != info_size_after {
                debug_assert!(self.info_size_before < info_size_after);
                let delta = info_size_after as i64 - self.info_size_before as i64;
                THIS_THREAD.with(|state| {
                    let mut state = state.borrow_mut();
                    if let Some(cache) = state.cache.as_mut() {
                        cache.update_total_size(delta);
                    }
                });
            }
        }
    }
}

/// A [`Parser`] decorator that funnels every classification call through
/// the thread-local cache.
pub struct CachingParser {
    inner: Box<dyn Parser>,
}

impl CachingParser {
    pub fn new(inner: Box<dyn Parser>) -> Self {
        CachingParser { inner }
    }

    pub fn inner(&self) -> &dyn Parser {
        self.inner.as_ref()
    }
}

macro_rules! scoped {
    ($self:ident, $stmt:ident, $call:expr) => {{
        let _scope = CachingScope::new($self.inner.as_ref(), $stmt);
        $call
    }};
}

impl Parser for CachingParser {
    fn parse(
        &self,
        stmt: &Buffer,
        collect: crate::classifier::CollectLevel,
    ) -> crate::classifier::ParseResult {
        scoped!(self, stmt, self.inner.parse(stmt, collect))
    }

    fn stmt_result(&self, info: &ParseInfo) -> StmtResult {
        self.inner.stmt_result(info)
    }

    fn get_type_mask(&self, stmt: &Buffer) -> crate::classifier::TypeMask {
        scoped!(self, stmt, self.inner.get_type_mask(stmt))
    }

    fn get_operation(&self, stmt: &Buffer) -> crate::classifier::Operation {
        scoped!(self, stmt, self.inner.get_operation(stmt))
    }

    fn get_table_names(&self, stmt: &Buffer) -> Vec<crate::classifier::info::TableName> {
        scoped!(self, stmt, self.inner.get_table_names(stmt))
    }

    fn get_field_info(&self, stmt: &Buffer) -> Vec<crate::classifier::info::FieldInfo> {
        scoped!(self, stmt, self.inner.get_field_info(stmt))
    }

    fn get_function_info(&self, stmt: &Buffer) -> Vec<crate::classifier::info::FunctionInfo> {
        scoped!(self, stmt, self.inner.get_function_info(stmt))
    }

    fn get_kill_info(&self, stmt: &Buffer) -> Option<crate::classifier::info::KillInfo> {
        scoped!(self, stmt, self.inner.get_kill_info(stmt))
    }

    fn get_preparable_stmt(&self, stmt: &Buffer) -> Option<Buffer> {
        scoped!(self, stmt, self.inner.get_preparable_stmt(stmt))
    }

    fn get_prepare_name(&self, stmt: &Buffer) -> Option<String> {
        scoped!(self, stmt, self.inner.get_prepare_name(stmt))
    }

    fn get_query_info(&self, stmt: &Buffer) -> crate::classifier::QueryInfo {
        scoped!(self, stmt, self.inner.get_query_info(stmt))
    }

    fn get_canonical(&self, stmt: &Buffer) -> String {
        scoped!(self, stmt, self.inner.get_canonical(stmt))
    }

    fn is_prepare(&self, stmt: &Buffer) -> bool {
        self.inner.is_prepare(stmt)
    }

    fn is_query(&self, stmt: &Buffer) -> bool {
        self.inner.is_query(stmt)
    }

    fn is_ps_packet(&self, stmt: &Buffer) -> bool {
        self.inner.is_ps_packet(stmt)
    }

    fn is_execute_immediately_ps(&self, stmt: &Buffer) -> bool {
        self.inner.is_execute_immediately_ps(stmt)
    }

    fn get_ps_id(&self, stmt: &Buffer) -> u32 {
        self.inner.get_ps_id(stmt)
    }

    fn is_ps_direct_exec_id(&self, id: u32) -> bool {
        self.inner.is_ps_direct_exec_id(id)
    }

    fn continues_ps(&self, stmt: &Buffer, prev_command: u8) -> bool {
        self.inner.continues_ps(stmt, prev_command)
    }

    fn relates_to_previous(&self, stmt: &Buffer) -> bool {
        scoped!(self, stmt, self.inner.relates_to_previous(stmt))
    }

    fn is_multi_stmt(&self, stmt: &Buffer) -> bool {
        scoped!(self, stmt, self.inner.is_multi_stmt(stmt))
    }

    fn get_trx_type_mask(&self, stmt: &Buffer) -> crate::classifier::TypeMask {
        self.inner.get_trx_type_mask(stmt)
    }

    fn get_sql_mode(&self) -> SqlMode {
        self.inner.get_sql_mode()
    }

    fn set_sql_mode(&self, sql_mode: SqlMode) {
        self.inner.set_sql_mode(sql_mode);
    }

    fn get_options(&self) -> u32 {
        self.inner.get_options()
    }

    fn set_options(&self, options: u32) -> bool {
        self.inner.set_options(options)
    }

    fn parse_fresh(&self, stmt: &Buffer, collect: crate::classifier::CollectLevel) -> Rc<ParseInfo> {
        self.inner.parse_fresh(stmt, collect)
    }

    fn collect_deeper(
        &self,
        stmt: &Buffer,
        info: &ParseInfo,
        collect: crate::classifier::CollectLevel,
    ) {
        self.inner.collect_deeper(stmt, info, collect);
    }
}

/// Admin helper: warn once about an ignored stats request on a thread with
/// no cache (only happens if called off-worker).
pub fn get_thread_cache_stats_or_warn() -> CacheStats {
    match get_thread_cache_stats() {
        Some(stats) => stats,
        None => {
            warn!("Classifier cache stats requested on a thread without a cache.");
            CacheStats::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::inspector::InspectParser;
    use std::sync::Mutex;

    // The global size target is process-wide; tests that flip it must not
    // interleave.
    static GLOBAL_SIZE_LOCK: Mutex<()> = Mutex::new(());

    fn reset_thread() {
        set_properties(&Properties { max_size: i64::MAX });
        clear_thread_cache();
        set_thread_cache_enabled(true);
    }

    fn caching_parser() -> CachingParser {
        CachingParser::new(Box::new(InspectParser::new()))
    }

    #[test]
    fn canonical_aliases_share_one_entry() {
        let _guard = GLOBAL_SIZE_LOCK.lock().unwrap();
        thread_init();
        reset_thread();
        let parser = caching_parser();

        let a = Buffer::com_query("SELECT 1 FROM t WHERE a='x'");
        let b = Buffer::com_query("SELECT 1 FROM t WHERE a='y'");
        parser.get_type_mask(&a);
        let stats_after_first = get_thread_cache_stats().unwrap();
        parser.get_type_mask(&b);
        let stats_after_second = get_thread_cache_stats().unwrap();

        assert_eq!(stats_after_first.inserts, 1);
        assert_eq!(stats_after_second.inserts, 1);
        assert_eq!(stats_after_second.hits - stats_after_first.hits, 1);
        thread_finish();
    }

    #[test]
    fn zero_size_disables_caching() {
        let _guard = GLOBAL_SIZE_LOCK.lock().unwrap();
        thread_init();
        reset_thread();
        set_properties(&Properties { max_size: 0 });
        let parser = caching_parser();

        let a = Buffer::com_query("SELECT 2 FROM t WHERE a='x'");
        parser.get_type_mask(&a);
        let b = Buffer::com_query("SELECT 2 FROM t WHERE a='y'");
        parser.get_type_mask(&b);

        let stats = get_thread_cache_stats().unwrap();
        assert_eq!(stats.inserts, 0);
        assert_eq!(stats.hits, 0);
        assert_eq!(stats.size, 0);

        set_properties(&Properties { max_size: i64::MAX });
        thread_finish();
    }

    #[test]
    fn clear_zeroes_the_size() {
        let mut cache = InfoCache::new();
        cache.cache_max_size = 1 << 20;
        let info = Rc::new(ParseInfo::failed("SELECT ?".to_string()));
        cache.insert("SELECT ?", info, SqlMode::Default, 0);
        assert!(cache.stats().size > 0);
        cache.clear();
        assert_eq!(cache.stats().size, 0);
        assert!(cache.is_empty());
    }

    #[test]
    fn eviction_terminates_on_empty_cache() {
        let mut cache = InfoCache::new();
        cache.make_space(1 << 30);
        assert!(cache.is_empty());
    }

    #[test]
    fn eviction_frees_room_for_insert() {
        let mut cache = InfoCache::new();
        let probe = Rc::new(ParseInfo::failed("PROBE ?".to_string()));
        let one = entry_size("PROBE ?", &probe);
        // room for roughly two entries
        cache.cache_max_size = one * 2 + one / 2;

        for i in 0..10 {
            let key = format!("SELECT ? FROM t{i}");
            let info = Rc::new(ParseInfo::failed(key.clone()));
            cache.insert(&key, info, SqlMode::Default, 0);
            assert!(cache.stats().size <= cache.cache_max_size);
        }
        assert!(cache.stats().evictions > 0);
        assert!(!cache.is_empty());
    }

    #[test]
    fn sql_mode_mismatch_is_a_miss_and_evicts() {
        let mut cache = InfoCache::new();
        cache.cache_max_size = 1 << 20;
        let info = Rc::new(ParseInfo::failed("SELECT ?".to_string()));
        cache.insert("SELECT ?", info, SqlMode::Default, 0);

        assert!(cache.get("SELECT ?", SqlMode::Oracle, 0).is_none());
        assert!(cache.peek("SELECT ?").is_none());
        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.size, 0);
    }

    #[test]
    fn oversized_entry_is_not_inserted() {
        let mut cache = InfoCache::new();
        cache.cache_max_size = 16;
        let info = Rc::new(ParseInfo::failed("SELECT ? FROM somewhere".to_string()));
        cache.insert("SELECT ? FROM somewhere", info, SqlMode::Default, 0);
        assert!(cache.is_empty());
        assert_eq!(cache.stats().inserts, 0);
    }

    #[test]
    fn state_reports_top_entries_by_hits() {
        let mut cache = InfoCache::new();
        cache.cache_max_size = 1 << 20;
        for (key, hits) in [("A ?", 5), ("B ?", 1), ("C ?", 9)] {
            let info = Rc::new(ParseInfo::failed(key.to_string()));
            cache.insert(key, info, SqlMode::Default, 0);
            for _ in 0..hits {
                cache.get(key, SqlMode::Default, 0);
            }
        }
        let parser = InspectParser::new();
        let mut state = BTreeMap::new();
        cache.get_state(&mut state, 2, &parser);
        assert_eq!(state.len(), 2);
        assert!(state.contains_key("C ?"));
        assert!(state.contains_key("A ?"));
    }
}
