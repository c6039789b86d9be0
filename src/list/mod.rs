//! Agent file-list handling
//!
//! The agent emits a compact directory traversal, one entry per line; the
//! parser turns bytes into [`parser::ListEntry`] values, the path stack keeps
//! the three parallel path forms in sync as the traversal is replayed, and
//! the writer emits a list in the same format the parser reads.

pub mod parser;
pub mod path_stack;
pub mod writer;

pub use parser::{DirectoryEvent, Extras, FileListParser, ListEntry};
pub use path_stack::{fix_for_os, PathStack};
pub use writer::FileListWriter;

/// Escape an extras key or value for the one-line list format
#[must_use]
pub(crate) fn escape_extra(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '%' | '&' | '=' | '\n' | '\r' => {
                out.push('%');
                out.push_str(&format!("{:02X}", c as u32));
            }
            _ => out.push(c),
        }
    }
    out
}

/// Undo [`escape_extra`]; invalid escapes are kept literally
#[must_use]
pub(crate) fn unescape_extra(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.char_indices();
    while let Some((idx, c)) = chars.next() {
        if c == '%' {
            if let Some(hex) = s.get(idx + 1..idx + 3) {
                if let Ok(v) = u8::from_str_radix(hex, 16) {
                    out.push(v as char);
                    chars.next();
                    chars.next();
                    continue;
                }
            }
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extra_escaping_round_trips() {
        for s in ["plain", "a&b=c", "100%", "line\nbreak", "%41 literal-ish"] {
            assert_eq!(unescape_extra(&escape_extra(s)), s);
        }
    }

    #[test]
    fn invalid_escape_kept_literally() {
        assert_eq!(unescape_extra("%zz"), "%zz");
        assert_eq!(unescape_extra("trailing%"), "trailing%");
    }
}
