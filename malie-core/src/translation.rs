use std::collections::BTreeMap;
use std::fmt::Write as _;
use thiserror::Error;

use crate::scan::{MessageRef, NAME_INDEX};
use crate::text::{escape_message, escape_string, unescape_message, unescape_string};

/// Marks the reference copy of a message, and every string entry.
pub const REFERENCE_MARK: char = '◇';
/// Marks the editable copy of a message.
pub const EDIT_MARK: char = '◆';

/// Line numbers are 0-based.
#[derive(Debug, Error)]
pub enum TranslationError {
    #[error("bad format at line {line}")]
    BadLine { line: usize },

    #[error("message index {index:08X} not contained in script, line {line}")]
    UnknownIndex { index: u32, line: usize },

    #[error("string offset {offset:08X} not contained in script, line {line}")]
    UnknownOffset { offset: u32, line: usize },
}

/// Two copies per message, reference then editable, and a blank line.
pub fn write_messages(messages: &[MessageRef]) -> String {
    let mut out = String::new();
    for m in messages {
        let text = escape_message(&m.text);
        let _ = writeln!(out, "{0}{1:08X}{0}{2}", REFERENCE_MARK, m.index, text);
        let _ = writeln!(out, "{0}{1:08X}{0}{2}", EDIT_MARK, m.index, text);
        out.push('\n');
    }
    out
}

/// One line per referenced string offset.
pub fn write_strings(strings: &BTreeMap<u32, String>) -> String {
    let mut out = String::new();
    for (offset, text) in strings {
        let _ = writeln!(out, "{0}{1:08X}{0}{2}", REFERENCE_MARK, offset, escape_string(text));
    }
    out
}

/// Split `<mark><hex><mark><text>` into its key and raw text.
fn parse_entry(line: &str, mark: char, line_no: usize) -> Result<(u32, &str), TranslationError> {
    let bad = || TranslationError::BadLine { line: line_no };
    let rest = line.strip_prefix(mark).ok_or_else(bad)?;
    let (key, text) = rest.split_once(mark).ok_or_else(bad)?;
    if key.is_empty() || !key.chars().all(|c| c.is_alphanumeric() || c == '_') {
        return Err(bad());
    }
    let key = u32::from_str_radix(key, 16).map_err(|_| bad())?;
    Ok((key, text))
}

fn entries(text: &str, mark: char) -> impl Iterator<Item = (usize, &str)> {
    text.strip_prefix('\u{FEFF}')
        .unwrap_or(text)
        .lines()
        .enumerate()
        .filter(move |(_, line)| line.starts_with(mark))
}

/// Parse the editable message lines. Character-name lines are skipped;
/// every other index must lie inside a table of `count` messages.
pub fn read_messages(text: &str, count: usize) -> Result<Vec<(u32, String)>, TranslationError> {
    let mut out = Vec::new();
    for (line_no, line) in entries(text, EDIT_MARK) {
        let (index, raw) = parse_entry(line, EDIT_MARK, line_no)?;
        if index == NAME_INDEX {
            continue;
        }
        if index as usize >= count {
            return Err(TranslationError::UnknownIndex {
                index,
                line: line_no,
            });
        }
        out.push((index, unescape_message(raw)));
    }
    Ok(out)
}

/// Parse string lines; every offset must be one of `known`.
pub fn read_strings(
    text: &str,
    known: &BTreeMap<u32, String>,
) -> Result<Vec<(u32, String)>, TranslationError> {
    let mut out = Vec::new();
    for (line_no, line) in entries(text, REFERENCE_MARK) {
        let (offset, raw) = parse_entry(line, REFERENCE_MARK, line_no)?;
        if !known.contains_key(&offset) {
            return Err(TranslationError::UnknownOffset {
                offset,
                line: line_no,
            });
        }
        out.push((offset, unescape_string(raw)));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(index: u32, text: &str) -> MessageRef {
        MessageRef {
            addr: 0,
            index,
            text: text.to_string(),
        }
    }

    #[test]
    fn writes_reference_and_editable_copies() {
        let out = write_messages(&[message(0, "H"), message(NAME_INDEX, "Ann\n")]);
        assert_eq!(
            out,
            "◇00000000◇H\n◆00000000◆H\n\n◇AAAAAAAA◇Ann[n]\n◆AAAAAAAA◆Ann[n]\n\n"
        );
    }

    #[test]
    fn reads_only_editable_lines() {
        let text = "\u{FEFF}◇00000000◇old\r\n◆00000000◆new[n]\r\n\r\n◆AAAAAAAA◆Name\r\n◆00000001◆\r\n";
        let got = read_messages(text, 2).unwrap();
        assert_eq!(got, vec![(0, "new\n".to_string()), (1, String::new())]);
    }

    #[test]
    fn reports_line_of_bad_entry() {
        let err = read_messages("\n◆00000000◆ok\n◆zz◆bad\n", 1).unwrap_err();
        assert!(matches!(err, TranslationError::BadLine { line: 2 }));

        let err = read_messages("◆00000000 missing mark\n", 1).unwrap_err();
        assert!(matches!(err, TranslationError::BadLine { line: 0 }));

        let err = read_messages("◆◆text\n", 1).unwrap_err();
        assert!(matches!(err, TranslationError::BadLine { line: 0 }));
    }

    #[test]
    fn rejects_index_outside_table() {
        let err = read_messages("◆00000000◆a\n\n◆00000005◆b\n", 3).unwrap_err();
        assert!(matches!(
            err,
            TranslationError::UnknownIndex { index: 5, line: 2 }
        ));
    }

    #[test]
    fn strings_round_trip_through_text() {
        let strings = BTreeMap::from([(0x10, "a\tb".to_string()), (0x2, String::new())]);
        let text = write_strings(&strings);
        assert_eq!(text, "◇00000002◇\n◇00000010◇a\\tb\n");
        let back: BTreeMap<u32, String> = read_strings(&text, &strings).unwrap().into_iter().collect();
        assert_eq!(back, strings);
    }

    #[test]
    fn rejects_unknown_string_offset() {
        let known = BTreeMap::from([(0, "x".to_string())]);
        let err = read_strings("◇00000004◇y\n", &known).unwrap_err();
        assert!(matches!(err, TranslationError::UnknownOffset { offset: 4, line: 0 }));
    }
}
