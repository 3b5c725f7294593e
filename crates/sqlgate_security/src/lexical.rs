//! Lexical checks on the raw query text.
//!
//! These run independently of the parser: statement separators are found on a
//! masked copy of the text (literals, quoted identifiers and comments blanked
//! out), while forbidden patterns are matched against the raw text itself.

use crate::error::ErrorKind;
use crate::policy::SecurityPolicy;
use crate::validator::Rejection;

/// Strip one trailing statement terminator and reject any other separator.
///
/// Returns the statement text to hand to the parser.
pub(crate) fn single_statement(sql: &str) -> Result<&str, Rejection> {
    let masked = mask_sql(sql);
    debug_assert_eq!(masked.len(), sql.len());

    let body_end = trailing_terminator_start(&masked).unwrap_or(sql.len());
    if masked[..body_end].contains(';') {
        return Err(Rejection::new(
            ErrorKind::MultiStatement,
            "Multiple statements are not allowed",
        )
        .with_token(";"));
    }
    Ok(&sql[..body_end])
}

/// First forbidden pattern found in the raw text, case-insensitively.
pub(crate) fn scan_forbidden(sql: &str, policy: &SecurityPolicy) -> Result<(), Rejection> {
    for pattern in policy.forbidden_patterns() {
        if let Some(hit) = pattern.find(sql) {
            return Err(Rejection::new(
                ErrorKind::DangerousPattern,
                format!("Query contains forbidden pattern: {}", hit),
            )
            .with_token(pattern.source()));
        }
    }
    Ok(())
}

/// Byte offset of a lone trailing `;` (plus whitespace), if present.
fn trailing_terminator_start(masked: &str) -> Option<usize> {
    let trimmed = masked.trim_end();
    trimmed.strip_suffix(';').map(|rest| rest.len())
}

/// Blank out string literals, quoted identifiers and comments.
///
/// Every character becomes as many spaces as it has UTF-8 bytes, so byte
/// offsets in the mask line up with the original text.
fn mask_sql(sql: &str) -> String {
    #[derive(Clone, Copy, PartialEq)]
    enum State {
        Code,
        Single,
        Double,
        LineComment,
        BlockComment,
    }

    fn blank(out: &mut String, ch: char) {
        for _ in 0..ch.len_utf8() {
            out.push(' ');
        }
    }

    let mut out = String::with_capacity(sql.len());
    let mut chars = sql.chars().peekable();
    let mut state = State::Code;

    while let Some(ch) = chars.next() {
        match state {
            State::LineComment => {
                if ch == '\n' {
                    state = State::Code;
                    out.push('\n');
                } else {
                    blank(&mut out, ch);
                }
            }
            State::BlockComment => {
                if ch == '*' && chars.peek() == Some(&'/') {
                    chars.next();
                    out.push_str("  ");
                    state = State::Code;
                } else {
                    blank(&mut out, ch);
                }
            }
            State::Single => {
                if ch == '\'' {
                    if chars.peek() == Some(&'\'') {
                        chars.next();
                        out.push_str("  ");
                        continue;
                    }
                    state = State::Code;
                }
                blank(&mut out, ch);
            }
            State::Double => {
                if ch == '"' {
                    if chars.peek() == Some(&'"') {
                        chars.next();
                        out.push_str("  ");
                        continue;
                    }
                    state = State::Code;
                }
                blank(&mut out, ch);
            }
            State::Code => match ch {
                '-' if chars.peek() == Some(&'-') => {
                    chars.next();
                    out.push_str("  ");
                    state = State::LineComment;
                }
                '/' if chars.peek() == Some(&'*') => {
                    chars.next();
                    out.push_str("  ");
                    state = State::BlockComment;
                }
                '\'' => {
                    out.push(' ');
                    state = State::Single;
                }
                '"' => {
                    out.push(' ');
                    state = State::Double;
                }
                _ => out.push(ch),
            },
        }
    }

    out
}
