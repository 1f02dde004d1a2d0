//! Conversions between engine text and the bracket notation used in
//! translation files.
//!
//! Message text embeds control sequences introduced by 0x07:
//!
//! | engine bytes                     | notation          |
//! |----------------------------------|-------------------|
//! | `07 08 body 00`                  | `{body}`          |
//! | `07 01 base 0A annotation 00`    | `[base](annotation)` |
//! | `07 04` / `07 06` / `07 09`      | `[c]` / `[z]` / `[s]` |
//! | `0A` / `0D`                      | `[n]` / `[r]`     |
//!
//! Spans are matched shortest-first so adjacent spans never merge.

const VOICE: [char; 2] = ['\u{07}', '\u{08}'];
const RUBY: [char; 2] = ['\u{07}', '\u{01}'];

const MARKERS: [(&str, &str); 5] = [
    ("\u{07}\u{04}", "[c]"),
    ("\u{07}\u{06}", "[z]"),
    ("\u{07}\u{09}", "[s]"),
    ("\n", "[n]"),
    ("\r", "[r]"),
];

/// Escape a string-segment entry: tab, CR and LF become `\t`, `\r`, `\n`.
pub fn escape_string(input: &str) -> String {
    input
        .replace('\t', "\\t")
        .replace('\r', "\\r")
        .replace('\n', "\\n")
}

pub fn unescape_string(input: &str) -> String {
    input
        .replace("\\t", "\t")
        .replace("\\r", "\r")
        .replace("\\n", "\n")
}

/// Escape message text into bracket notation.
pub fn escape_message(input: &str) -> String {
    let s = replace_spans(input, match_voice);
    let mut s = replace_spans(&s, match_ruby);
    for (raw, token) in MARKERS {
        s = s.replace(raw, token);
    }
    s
}

/// Inverse of [`escape_message`].
pub fn unescape_message(input: &str) -> String {
    let s = replace_spans(input, match_braced);
    let mut s = replace_spans(&s, match_annotated);
    for (raw, token) in MARKERS {
        s = s.replace(token, raw);
    }
    s
}

/// A matched span: where it ends (exclusive) and what replaces it.
type Span = Option<(usize, String)>;

/// Scan left to right, replacing every non-overlapping span the matcher
/// accepts at the current position.
fn replace_spans<F>(input: &str, matcher: F) -> String
where
    F: Fn(&[char], usize) -> Span,
{
    let chars: Vec<char> = input.chars().collect();
    let mut out = String::with_capacity(input.len());
    let mut i = 0;
    while i < chars.len() {
        match matcher(&chars, i) {
            Some((end, replacement)) => {
                out.push_str(&replacement);
                i = end;
            }
            None => {
                out.push(chars[i]);
                i += 1;
            }
        }
    }
    out
}

/// Shortest non-empty run starting at `start` that avoids `excluded` and is
/// directly followed by `close`. Returns the index of `close`.
fn shortest_run(chars: &[char], start: usize, excluded: &[char], close: char) -> Option<usize> {
    let mut j = start;
    while j < chars.len() {
        if excluded.contains(&chars[j]) {
            return None;
        }
        j += 1;
        if chars.get(j) == Some(&close) {
            return Some(j);
        }
    }
    None
}

fn collect(chars: &[char]) -> String {
    chars.iter().collect()
}

fn match_voice(chars: &[char], i: usize) -> Span {
    if !chars[i..].starts_with(&VOICE) {
        return None;
    }
    let body = i + 2;
    let close = shortest_run(chars, body, &VOICE, '\0')?;
    Some((close + 1, format!("{{{}}}", collect(&chars[body..close]))))
}

fn match_ruby(chars: &[char], i: usize) -> Span {
    if !chars[i..].starts_with(&RUBY) {
        return None;
    }
    let base = i + 2;
    // The base may itself contain 0x0A, so each separator candidate is
    // tried in turn until an annotation closes.
    let mut j = base;
    while j < chars.len() {
        if RUBY.contains(&chars[j]) {
            return None;
        }
        j += 1;
        if chars.get(j) == Some(&'\n') {
            if let Some(close) = shortest_run(chars, j + 1, &['\n'], '\0') {
                let text = format!(
                    "[{}]({})",
                    collect(&chars[base..j]),
                    collect(&chars[j + 1..close])
                );
                return Some((close + 1, text));
            }
        }
    }
    None
}

fn match_braced(chars: &[char], i: usize) -> Span {
    if chars[i] != '{' {
        return None;
    }
    let body = i + 1;
    let close = shortest_run(chars, body, &['{', '}'], '}')?;
    Some((
        close + 1,
        format!("\u{07}\u{08}{}\0", collect(&chars[body..close])),
    ))
}

fn match_annotated(chars: &[char], i: usize) -> Span {
    if chars[i] != '[' {
        return None;
    }
    let base = i + 1;
    let base_end = shortest_run(chars, base, &['[', ']'], ']')?;
    if chars.get(base_end + 1) != Some(&'(') {
        return None;
    }
    let note = base_end + 2;
    let close = shortest_run(chars, note, &['(', ')'], ')')?;
    Some((
        close + 1,
        format!(
            "\u{07}\u{01}{}\n{}\0",
            collect(&chars[base..base_end]),
            collect(&chars[note..close])
        ),
    ))
}
