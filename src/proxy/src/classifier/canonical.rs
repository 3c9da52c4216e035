//! Statement canonicalization: literal values are replaced with `?` and
//! whitespace runs collapse to single spaces, producing the key the
//! classifier cache is built on. Identifier case is preserved.

/// Canonicalize one statement.
pub fn get_canonical(sql: &str) -> String {
    let bytes = sql.as_bytes();
    let mut out = String::with_capacity(sql.len());
    let mut i = 0;

    while i < bytes.len() {
        let b = bytes[i];
        match b {
            b'\'' | b'"' => {
                i = skip_string(bytes, i);
                out.push('?');
            }
            b'`' => {
                let start = i;
                i = skip_string(bytes, i);
                // quoted identifiers stay as written
                out.push_str(&sql[start..i]);
            }
            b'#' => {
                i = skip_line_comment(bytes, i + 1);
                push_space(&mut out);
            }
            b'-' if bytes.get(i + 1) == Some(&b'-')
                && matches!(bytes.get(i + 2), Some(b' ') | Some(b'\t') | None) =>
            {
                i = skip_line_comment(bytes, i + 2);
                push_space(&mut out);
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                // executable comments keep their body, plain ones vanish
                if bytes.get(i + 2) == Some(&b'!') {
                    out.push_str("/*!");
                    i += 3;
                } else {
                    i = skip_block_comment(bytes, i + 2);
                    push_space(&mut out);
                }
            }
            b'0' if matches!(bytes.get(i + 1), Some(b'x') | Some(b'X'))
                && !prev_is_ident(&out) =>
            {
                i += 2;
                while i < bytes.len() && bytes[i].is_ascii_hexdigit() {
                    i += 1;
                }
                out.push('?');
            }
            b'x' | b'X' if bytes.get(i + 1) == Some(&b'\'') && !prev_is_ident(&out) => {
                i = skip_string(bytes, i + 1);
                out.push('?');
            }
            b'0'..=b'9' if !prev_is_ident(&out) => {
                i = skip_number(bytes, i);
                out.push('?');
            }
            b'.' if bytes
                .get(i + 1)
                .map(|c| c.is_ascii_digit())
                .unwrap_or(false)
                && !prev_is_ident(&out) =>
            {
                i = skip_number(bytes, i + 1);
                out.push('?');
            }
            b if b.is_ascii_whitespace() => {
                push_space(&mut out);
                i += 1;
            }
            _ => {
                out.push(b as char);
                i += 1;
            }
        }
    }

    while out.ends_with(' ') {
        out.pop();
    }
    out
}

/// True when the statement contains more than one statement, i.e. a `;`
/// with trailing content outside literals and comments.
pub fn is_multi_stmt(sql: &str) -> bool {
    let bytes = sql.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\'' | b'"' | b'`' => i = skip_string(bytes, i),
            b'#' => i = skip_line_comment(bytes, i + 1),
            b'-' if bytes.get(i + 1) == Some(&b'-')
                && matches!(bytes.get(i + 2), Some(b' ') | Some(b'\t') | None) =>
            {
                i = skip_line_comment(bytes, i + 2);
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => i = skip_block_comment(bytes, i + 2),
            b';' => {
                return bytes[i + 1..].iter().any(|b| !b.is_ascii_whitespace());
            }
            _ => i += 1,
        }
    }
    false
}

fn push_space(out: &mut String) {
    if !out.is_empty() && !out.ends_with(' ') {
        out.push(' ');
    }
}

fn prev_is_ident(out: &str) -> bool {
    matches!(
        out.chars().last(),
        Some(c) if c.is_ascii_alphanumeric() || c == '_' || c == '$' || c == '`'
    )
}

fn skip_string(bytes: &[u8], start: usize) -> usize {
    let quote = bytes[start];
    let mut i = start + 1;
    while i < bytes.len() {
        if bytes[i] == b'\\' && quote != b'`' {
            i += 2;
            continue;
        }
        if bytes[i] == quote {
            // doubled quote is an escaped quote inside the literal
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

fn skip_line_comment(bytes: &[u8], start: usize) -> usize {
    let mut i = start;
    while i < bytes.len() && bytes[i] != b'\n' {
        i += 1;
    }
    i
}

fn skip_block_comment(bytes: &[u8], start: usize) -> usize {
    let mut i = start;
    while i + 1 < bytes.len() {
        if bytes[i] == b'*' && bytes[i + 1] == b'/' {
            return i + 2;
        }
        i += 1;
    }
    bytes.len()
}

fn skip_number(bytes: &[u8], start: usize) -> usize {
    let mut i = start;
    while i < bytes.len() {
        match bytes[i] {
            b'0'..=b'9' | b'.' => i += 1,
            b'e' | b'E'
                if bytes
                    .get(i + 1)
                    .map(|c| c.is_ascii_digit() || *c == b'+' || *c == b'-')
                    .unwrap_or(false) =>
            {
                i += 2;
            }
            _ => break,
        }
    }
    i
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replaces_string_and_number_literals() {
        assert_eq!(
            get_canonical("SELECT 1 FROM t WHERE a='x'"),
            "SELECT ? FROM t WHERE a=?"
        );
        assert_eq!(
            get_canonical("SELECT 1 FROM t WHERE a='y'"),
            "SELECT ? FROM t WHERE a=?"
        );
    }

    #[test]
    fn preserves_identifier_case_and_digits() {
        assert_eq!(
            get_canonical("SELECT Id2 FROM Users2 WHERE id=42"),
            "SELECT Id2 FROM Users2 WHERE id=?"
        );
    }

    #[test]
    fn collapses_whitespace() {
        assert_eq!(
            get_canonical("SELECT  *\n\tFROM   t"),
            "SELECT * FROM t"
        );
    }

    #[test]
    fn hex_and_float_literals() {
        assert_eq!(get_canonical("SELECT 0xAB, 1.5e-3"), "SELECT ?, ?");
        assert_eq!(get_canonical("SELECT X'4D'"), "SELECT ?");
    }

    #[test]
    fn comments_removed_executable_kept() {
        assert_eq!(get_canonical("SELECT 1 -- trailing"), "SELECT ?");
        assert_eq!(get_canonical("SELECT /* x */ 1"), "SELECT ?");
        assert_eq!(
            get_canonical("SELECT /*! STRAIGHT_JOIN */ a FROM t"),
            "SELECT /*! STRAIGHT_JOIN */ a FROM t"
        );
    }

    #[test]
    fn escaped_quotes_inside_literals() {
        assert_eq!(get_canonical("SELECT 'it''s'"), "SELECT ?");
        assert_eq!(get_canonical(r#"SELECT 'a\'b'"#), "SELECT ?");
    }

    #[test]
    fn multi_stmt_detection() {
        assert!(is_multi_stmt("SELECT 1; SELECT 2"));
        assert!(!is_multi_stmt("SELECT 1;"));
        assert!(!is_multi_stmt("SELECT 'a;b'"));
        assert!(!is_multi_stmt("SELECT 1 -- ; SELECT 2"));
    }
}
