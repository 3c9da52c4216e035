use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use tracing::warn;

/// When the retained statements of a session are dumped to the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DumpStatements {
    #[default]
    Never,
    OnClose,
    OnError,
}

#[derive(Debug, Clone)]
pub struct RetainedStatement {
    pub at: DateTime<Utc>,
    pub text: String,
}

/// Circular per-session record of the last N statements, dumped on close
/// or error depending on configuration. A separate, larger ring records
/// compact lifecycle events for the statement trace.
pub struct StatementRetention {
    max_statements: usize,
    statements: VecDeque<RetainedStatement>,
    max_trace: usize,
    trace: VecDeque<String>,
}

impl StatementRetention {
    pub fn new(max_statements: usize, max_trace: usize) -> Self {
        StatementRetention {
            max_statements,
            statements: VecDeque::with_capacity(max_statements.min(64)),
            max_trace,
            trace: VecDeque::with_capacity(max_trace.min(64)),
        }
    }

    pub fn record_statement(&mut self, text: &str) {
        if self.max_statements == 0 {
            return;
        }
        if self.statements.len() == self.max_statements {
            self.statements.pop_front();
        }
        self.statements.push_back(RetainedStatement {
            at: Utc::now(),
            text: text.to_string(),
        });
    }

    pub fn record_event(&mut self, event: String) {
        if self.max_trace == 0 {
            return;
        }
        if self.trace.len() == self.max_trace {
            self.trace.pop_front();
        }
        self.trace.push_back(event);
    }

    pub fn statements(&self) -> impl Iterator<Item = &RetainedStatement> {
        self.statements.iter()
    }

    pub fn len(&self) -> usize {
        self.statements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }

    /// Dump the retained statements at warn level, newest last.
    pub fn dump(&self, session_id: u64) {
        if self.statements.is_empty() {
            return;
        }
        warn!("Last statements of session {session_id}:");
        for stmt in &self.statements {
            warn!("  {} {}", stmt.at.format("%Y-%m-%d %H:%M:%S%.3f"), stmt.text);
        }
        for event in &self.trace {
            warn!("  trace: {event}");
        }
    }

    pub fn should_dump(policy: DumpStatements, errored: bool) -> bool {
        match policy {
            DumpStatements::Never => false,
            DumpStatements::OnClose => true,
            DumpStatements::OnError => errored,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_keeps_last_n() {
        let mut retention = StatementRetention::new(3, 0);
        for i in 0..5 {
            retention.record_statement(&format!("SELECT {i}"));
        }
        let texts: Vec<&str> = retention.statements().map(|s| s.text.as_str()).collect();
        assert_eq!(texts, vec!["SELECT 2", "SELECT 3", "SELECT 4"]);
    }

    #[test]
    fn zero_capacity_records_nothing() {
        let mut retention = StatementRetention::new(0, 0);
        retention.record_statement("SELECT 1");
        assert!(retention.is_empty());
    }

    #[test]
    fn dump_policy() {
        assert!(!StatementRetention::should_dump(DumpStatements::Never, true));
        assert!(StatementRetention::should_dump(DumpStatements::OnClose, false));
        assert!(StatementRetention::should_dump(DumpStatements::OnError, true));
        assert!(!StatementRetention::should_dump(DumpStatements::OnError, false));
    }
}
