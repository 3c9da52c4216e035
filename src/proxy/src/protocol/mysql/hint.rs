use crate::buffer::Hint;

use tracing::debug;

/// What one comment body amounted to.
#[derive(Debug, PartialEq, Eq)]
enum HintToken {
    One(Hint),
    Begin(Option<Hint>),
    End,
}

/// Scans SQL comments for routing hints. `begin`/`end` blocks push and pop
/// a default set applied to every statement until the block closes, so the
/// scanner is stateful and lives on the session.
#[derive(Default)]
pub struct HintScanner {
    stack: Vec<Vec<Hint>>,
}

impl HintScanner {
    pub fn new() -> Self {
        HintScanner { stack: Vec::new() }
    }

    /// Collect the hints for one statement: explicit comment hints first,
    /// then whatever the innermost open block prescribes.
    pub fn scan(&mut self, sql: &str) -> Vec<Hint> {
        let mut hints = Vec::new();

        for body in comment_bodies(sql) {
            let trimmed = body.trim();
            let mut words = trimmed.split_whitespace();
            match words.next() {
                Some(w) if w.eq_ignore_ascii_case("maxscale") => {}
                _ => continue,
            }
            let rest: Vec<&str> = words.collect();
            match parse_hint_tokens(&rest) {
                Some(HintToken::One(hint)) => hints.push(hint),
                Some(HintToken::Begin(default)) => {
                    self.stack.push(default.into_iter().collect());
                }
                Some(HintToken::End) => {
                    if self.stack.pop().is_none() {
                        debug!("Hint 'end' with no open block, ignored");
                    }
                }
                // Unknown hint bodies pass through silently.
                None => {}
            }
        }

        if hints.is_empty() {
            if let Some(block) = self.stack.last() {
                hints.extend(block.iter().cloned());
            }
        }

        hints
    }

    pub fn open_blocks(&self) -> usize {
        self.stack.len()
    }
}

fn parse_hint_tokens(words: &[&str]) -> Option<HintToken> {
    match words {
        [w, rest @ ..] if w.eq_ignore_ascii_case("begin") => {
            Some(HintToken::Begin(match parse_hint_tokens(rest) {
                Some(HintToken::One(hint)) => Some(hint),
                _ => None,
            }))
        }
        [w] if w.eq_ignore_ascii_case("end") => Some(HintToken::End),
        [r, t, target, rest @ ..]
            if r.eq_ignore_ascii_case("route") && t.eq_ignore_ascii_case("to") =>
        {
            if target.eq_ignore_ascii_case("master") {
                Some(HintToken::One(Hint::RouteToMaster))
            } else if target.eq_ignore_ascii_case("slave") {
                Some(HintToken::One(Hint::RouteToSlave))
            } else if target.eq_ignore_ascii_case("last_used_server") {
                Some(HintToken::One(Hint::RouteToLastUsed))
            } else if target.eq_ignore_ascii_case("server") {
                rest.first()
                    .map(|name| HintToken::One(Hint::RouteToNamedServer(name.to_string())))
            } else {
                None
            }
        }
        [kv] if kv.contains('=') => {
            let (name, value) = kv.split_once('=').unwrap();
            Some(HintToken::One(Hint::Parameter {
                name: name.trim().to_string(),
                value: value.trim().to_string(),
            }))
        }
        [name, eq, value] if *eq == "=" => Some(HintToken::One(Hint::Parameter {
            name: name.to_string(),
            value: value.to_string(),
        })),
        _ => None,
    }
}

/// Yields the bodies of `--`, `#` and `/* */` comments, skipping string
/// literals so quoted comment markers do not confuse the scan.
fn comment_bodies(sql: &str) -> Vec<&str> {
    let bytes = sql.as_bytes();
    let mut bodies = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'\'' | b'"' | b'`' => {
                let quote = bytes[i];
                i += 1;
                while i < bytes.len() {
                    if bytes[i] == b'\\' && quote != b'`' {
                        i += 2;
                        continue;
                    }
                    if bytes[i] == quote {
                        i += 1;
                        break;
                    }
                    i += 1;
                }
            }
            b'#' => {
                let start = i + 1;
                let end = bytes[start..]
                    .iter()
                    .position(|b| *b == b'\n')
                    .map(|p| start + p)
                    .unwrap_or(bytes.len());
                bodies.push(&sql[start..end]);
                i = end;
            }
            b'-' if i + 2 < bytes.len()
                && bytes[i + 1] == b'-'
                && (bytes[i + 2] == b' ' || bytes[i + 2] == b'\t') =>
            {
                let start = i + 3;
                let end = bytes[start..]
                    .iter()
                    .position(|b| *b == b'\n')
                    .map(|p| start + p)
                    .unwrap_or(bytes.len());
                bodies.push(&sql[start..end]);
                i = end;
            }
            b'/' if i + 1 < bytes.len() && bytes[i + 1] == b'*' => {
                let start = i + 2;
                let end = sql[start..]
                    .find("*/")
                    .map(|p| start + p)
                    .unwrap_or(bytes.len());
                bodies.push(&sql[start..end]);
                i = end + 2;
            }
            _ => i += 1,
        }
    }

    bodies
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn route_to_master_hint() {
        let mut scanner = HintScanner::new();
        let hints = scanner.scan("SELECT 1 -- maxscale route to master");
        assert_eq!(hints, vec![Hint::RouteToMaster]);
    }

    #[test]
    fn route_to_named_server() {
        let mut scanner = HintScanner::new();
        let hints = scanner.scan("SELECT 1 /* maxscale route to server replica2 */");
        assert_eq!(hints, vec![Hint::RouteToNamedServer("replica2".into())]);
    }

    #[test]
    fn replication_lag_parameter() {
        let mut scanner = HintScanner::new();
        let hints = scanner.scan("SELECT 1 # maxscale max_slave_replication_lag=120");
        assert_eq!(
            hints,
            vec![Hint::Parameter {
                name: "max_slave_replication_lag".into(),
                value: "120".into()
            }]
        );
    }

    #[test]
    fn begin_end_block_applies_to_following_statements() {
        let mut scanner = HintScanner::new();
        assert!(scanner
            .scan("SELECT 1 -- maxscale begin route to master")
            .is_empty());
        assert_eq!(scanner.open_blocks(), 1);
        assert_eq!(scanner.scan("SELECT 2"), vec![Hint::RouteToMaster]);
        scanner.scan("SELECT 3 -- maxscale end");
        assert_eq!(scanner.open_blocks(), 0);
        assert!(scanner.scan("SELECT 4").is_empty());
    }

    #[test]
    fn unknown_tokens_pass_silently() {
        let mut scanner = HintScanner::new();
        assert!(scanner
            .scan("SELECT 1 -- maxscale route to the moon")
            .is_empty());
        assert!(scanner.scan("SELECT 1 -- just a comment").is_empty());
    }

    #[test]
    fn quoted_comment_markers_ignored() {
        let mut scanner = HintScanner::new();
        let hints = scanner.scan("SELECT '-- maxscale route to master' FROM t");
        assert!(hints.is_empty());
    }

    #[test]
    fn last_used_server() {
        let mut scanner = HintScanner::new();
        let hints = scanner.scan("SELECT 1 -- maxscale route to last_used_server");
        assert_eq!(hints, vec![Hint::RouteToLastUsed]);
    }
}
