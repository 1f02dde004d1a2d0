use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use encoding_rs::SHIFT_JIS;
use std::io::{Cursor, Read, Write};
use thiserror::Error;

/// Set on a string field's length word when the payload is UTF-16LE.
const WIDE_FLAG: u32 = 0x8000_0000;

#[derive(Debug, Error)]
pub enum FormatError {
    #[error("{section} truncated at offset {offset:#X}")]
    Truncated { section: &'static str, offset: u64 },

    #[error("{section}: string field length {length:#X} at offset {offset:#X} cannot hold its terminator")]
    BadStringLength {
        section: &'static str,
        offset: u64,
        length: u32,
    },

    #[error("{count} trailing bytes after the message segment")]
    TrailingBytes { count: u64 },

    #[error("{section}: {what} {value} does not fit in 32 bits")]
    TooLarge {
        section: &'static str,
        what: &'static str,
        value: usize,
    },

    #[error("{section}: write failed: {source}")]
    Write {
        section: &'static str,
        #[source]
        source: std::io::Error,
    },
}

/// Calling convention carried by a symbol's `convention` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallConvention {
    /// Caller cleans the stack; CALL carries an extra stack-size byte.
    Cdecl,
    /// Callee cleans the stack.
    Stdcall,
    Other(i32),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbol {
    pub name: String,
    /// Dependency pairs; stored on disk as a zero-terminated list.
    pub deps: Vec<(i32, i32)>,
    pub kind: i32,
    pub unknown_8: i32,
    pub unknown_14: i32,
    pub convention: i32,
}

impl Symbol {
    pub fn call_convention(&self) -> CallConvention {
        match self.convention {
            1 => CallConvention::Cdecl,
            2 => CallConvention::Stdcall,
            other => CallConvention::Other(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Function {
    pub name: String,
    pub index: i32,
    pub unknown_4: i32,
    pub offset: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Label {
    pub name: String,
    pub offset: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MessageEntry {
    pub offset: u32,
    pub length: u32,
}

/// Fully decoded script container: three tables, the string and code
/// segments, the message table and the message segment.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Container {
    pub symbols: Vec<Symbol>,
    /// Opaque word stored after the last symbol.
    pub symbol_trailer: i32,
    pub functions: Vec<Function>,
    pub labels: Vec<Label>,
    pub strings: Vec<u8>,
    pub code: Vec<u8>,
    pub messages: Vec<MessageEntry>,
    pub message_data: Vec<u8>,
}

struct SectionReader<'a> {
    cur: Cursor<&'a [u8]>,
    section: &'static str,
}

impl<'a> SectionReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self {
            cur: Cursor::new(data),
            section: "symbol table",
        }
    }

    fn enter(&mut self, section: &'static str) {
        log::debug!("reading {} at offset {:#X}", section, self.cur.position());
        self.section = section;
    }

    fn truncated(&self) -> FormatError {
        FormatError::Truncated {
            section: self.section,
            offset: self.cur.position(),
        }
    }

    fn remaining(&self) -> u64 {
        (self.cur.get_ref().len() as u64).saturating_sub(self.cur.position())
    }

    fn u32(&mut self) -> Result<u32, FormatError> {
        self.cur
            .read_u32::<LittleEndian>()
            .map_err(|_| self.truncated())
    }

    fn i32(&mut self) -> Result<i32, FormatError> {
        self.cur
            .read_i32::<LittleEndian>()
            .map_err(|_| self.truncated())
    }

    fn bytes(&mut self, len: u32) -> Result<Vec<u8>, FormatError> {
        if u64::from(len) > self.remaining() {
            return Err(self.truncated());
        }
        let mut buf = vec![0u8; len as usize];
        self.cur.read_exact(&mut buf).map_err(|_| self.truncated())?;
        Ok(buf)
    }

    fn count(&mut self) -> Result<usize, FormatError> {
        Ok(self.u32()? as usize)
    }

    fn string(&mut self) -> Result<String, FormatError> {
        let at = self.cur.position();
        let raw = self.u32()?;
        let wide = raw & WIDE_FLAG != 0;
        let length = raw & !WIDE_FLAG;
        let terminator = if wide { 2 } else { 1 };
        if length < terminator {
            return Err(FormatError::BadStringLength {
                section: self.section,
                offset: at,
                length: raw,
            });
        }

        let buf = self.bytes(length)?;
        let content = &buf[..(length - terminator) as usize];
        Ok(if wide {
            decode_utf16le(content)
        } else {
            let (text, _, _) = SHIFT_JIS.decode(content);
            text.into_owned()
        })
    }
}

pub(crate) fn decode_utf16le(bytes: &[u8]) -> String {
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    String::from_utf16_lossy(&units)
}

pub(crate) fn encode_utf16le(text: &str) -> Vec<u8> {
    text.encode_utf16().flat_map(u16::to_le_bytes).collect()
}

fn len_u32(section: &'static str, what: &'static str, value: usize) -> Result<u32, FormatError> {
    u32::try_from(value).map_err(|_| FormatError::TooLarge {
        section,
        what,
        value,
    })
}

struct SectionWriter<'w, W: Write> {
    out: &'w mut W,
    section: &'static str,
}

impl<'w, W: Write> SectionWriter<'w, W> {
    fn fail(&self, source: std::io::Error) -> FormatError {
        FormatError::Write {
            section: self.section,
            source,
        }
    }

    fn u32(&mut self, v: u32) -> Result<(), FormatError> {
        self.out
            .write_u32::<LittleEndian>(v)
            .map_err(|e| self.fail(e))
    }

    fn i32(&mut self, v: i32) -> Result<(), FormatError> {
        self.out
            .write_i32::<LittleEndian>(v)
            .map_err(|e| self.fail(e))
    }

    fn count(&mut self, what: &'static str, n: usize) -> Result<(), FormatError> {
        let n = len_u32(self.section, what, n)?;
        self.u32(n)
    }

    fn raw(&mut self, bytes: &[u8]) -> Result<(), FormatError> {
        self.out.write_all(bytes).map_err(|e| self.fail(e))
    }

    /// Strings are always written in the wide form, terminator included.
    fn string(&mut self, text: &str) -> Result<(), FormatError> {
        let bytes = encode_utf16le(text);
        let length = len_u32(self.section, "string length", bytes.len() + 2)?;
        if length & WIDE_FLAG != 0 {
            return Err(FormatError::TooLarge {
                section: self.section,
                what: "string length",
                value: bytes.len(),
            });
        }
        self.u32(length | WIDE_FLAG)?;
        self.raw(&bytes)?;
        self.raw(&[0, 0])
    }

    fn segment(&mut self, bytes: &[u8]) -> Result<(), FormatError> {
        self.count("segment size", bytes.len())?;
        self.raw(bytes)
    }
}

impl Container {
    /// Decode a container, consuming exactly the whole input.
    pub fn parse(data: &[u8]) -> Result<Self, FormatError> {
        let mut r = SectionReader::new(data);
        let mut container = Container::default();

        r.enter("symbol table");
        let count = r.count()?;
        for _ in 0..count {
            let name = r.string()?;
            let mut deps = Vec::new();
            loop {
                let first = r.i32()?;
                if first == 0 {
                    break;
                }
                let second = r.i32()?;
                deps.push((first, second));
            }
            let kind = r.i32()?;
            let unknown_8 = r.i32()?;
            let unknown_14 = r.i32()?;
            let convention = r.i32()?;
            container.symbols.push(Symbol {
                name,
                deps,
                kind,
                unknown_8,
                unknown_14,
                convention,
            });
        }
        container.symbol_trailer = r.i32()?;

        r.enter("function table");
        let count = r.count()?;
        for _ in 0..count {
            let name = r.string()?;
            let index = r.i32()?;
            let unknown_4 = r.i32()?;
            let offset = r.i32()?;
            container.functions.push(Function {
                name,
                index,
                unknown_4,
                offset,
            });
        }

        r.enter("label table");
        let count = r.count()?;
        for _ in 0..count {
            let name = r.string()?;
            let offset = r.u32()?;
            container.labels.push(Label { name, offset });
        }

        r.enter("string segment");
        let size = r.u32()?;
        container.strings = r.bytes(size)?;

        r.enter("code segment");
        let size = r.u32()?;
        container.code = r.bytes(size)?;

        r.enter("message table");
        let count = r.count()?;
        for _ in 0..count {
            let offset = r.u32()?;
            let length = r.u32()?;
            container.messages.push(MessageEntry { offset, length });
        }

        r.enter("message segment");
        let size = r.u32()?;
        container.message_data = r.bytes(size)?;

        let trailing = r.remaining();
        if trailing != 0 {
            return Err(FormatError::TrailingBytes { count: trailing });
        }

        log::debug!(
            "container: {} symbols, {} functions, {} labels, {} string bytes, {} code bytes, {} messages",
            container.symbols.len(),
            container.functions.len(),
            container.labels.len(),
            container.strings.len(),
            container.code.len(),
            container.messages.len(),
        );

        Ok(container)
    }

    pub fn write<W: Write>(&self, out: &mut W) -> Result<(), FormatError> {
        let mut w = SectionWriter {
            out,
            section: "symbol table",
        };

        w.count("symbol count", self.symbols.len())?;
        for s in &self.symbols {
            w.string(&s.name)?;
            for &(a, b) in &s.deps {
                w.i32(a)?;
                w.i32(b)?;
            }
            w.i32(0)?;
            w.i32(s.kind)?;
            w.i32(s.unknown_8)?;
            w.i32(s.unknown_14)?;
            w.i32(s.convention)?;
        }
        w.i32(self.symbol_trailer)?;

        w.section = "function table";
        w.count("function count", self.functions.len())?;
        for f in &self.functions {
            w.string(&f.name)?;
            w.i32(f.index)?;
            w.i32(f.unknown_4)?;
            w.i32(f.offset)?;
        }

        w.section = "label table";
        w.count("label count", self.labels.len())?;
        for l in &self.labels {
            w.string(&l.name)?;
            w.u32(l.offset)?;
        }

        w.section = "string segment";
        w.segment(&self.strings)?;

        w.section = "code segment";
        w.segment(&self.code)?;

        w.section = "message table";
        w.count("message count", self.messages.len())?;
        for m in &self.messages {
            w.u32(m.offset)?;
            w.u32(m.length)?;
        }

        w.section = "message segment";
        w.segment(&self.message_data)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, FormatError> {
        let mut out = Vec::new();
        self.write(&mut out)?;
        Ok(out)
    }

    /// Read the zero-terminated UTF-16LE string starting at `offset` in the
    /// string segment. Reading stops at the end of the segment when no
    /// terminator is found.
    pub fn string_at(&self, offset: u32) -> String {
        let start = (offset as usize).min(self.strings.len());
        let tail = &self.strings[start..];
        let end = tail
            .chunks_exact(2)
            .position(|pair| pair == [0, 0])
            .map(|units| units * 2)
            .unwrap_or(tail.len() & !1);
        decode_utf16le(&tail[..end])
    }

    fn message_bytes(&self, index: u32) -> Option<&[u8]> {
        let entry = self.messages.get(index as usize)?;
        let start = entry.offset as usize;
        let end = start.checked_add(entry.length as usize)?;
        self.message_data.get(start..end)
    }

    /// Whether message `index` ends in a zero unit of its own, as opposed
    /// to the zero that closes a trailing voice or ruby span.
    pub fn message_terminated(&self, index: u32) -> bool {
        self.message_bytes(index).map_or(false, ends_with_terminator)
    }

    /// Text of message `index` without its terminator, or `None` when the
    /// index or its byte range lies outside the message table or segment.
    pub fn message_text(&self, index: u32) -> Option<String> {
        let mut bytes = self.message_bytes(index)?;
        if ends_with_terminator(bytes) {
            bytes = &bytes[..bytes.len() - 2];
        }
        Some(decode_utf16le(bytes))
    }
}

/// Zero units close a `07 08` or `07 01` span when one is open; a final zero
/// unit with no span open is the message terminator.
fn ends_with_terminator(bytes: &[u8]) -> bool {
    if bytes.len() % 2 != 0 {
        return false;
    }
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    let body = match units.split_last() {
        Some((&0, body)) => body,
        _ => return false,
    };

    let mut open = false;
    let mut i = 0;
    while i < body.len() {
        match (body[i], body.get(i + 1).copied()) {
            (0x07, Some(0x08 | 0x01)) if !open => {
                open = true;
                i += 1;
            }
            (0, _) if open => open = false,
            _ => {}
        }
        i += 1;
    }
    !open
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Builds container byte streams field by field, the way the engine lays
    /// them out, so tests can exercise narrow strings and malformed input.
    #[derive(Default)]
    pub(crate) struct StreamBuilder {
        pub(crate) out: Vec<u8>,
    }

    impl StreamBuilder {
        pub(crate) fn u32(&mut self, v: u32) -> &mut Self {
            self.out.extend_from_slice(&v.to_le_bytes());
            self
        }

        pub(crate) fn i32(&mut self, v: i32) -> &mut Self {
            self.out.extend_from_slice(&v.to_le_bytes());
            self
        }

        pub(crate) fn wide(&mut self, s: &str) -> &mut Self {
            let bytes = encode_utf16le(s);
            self.u32((bytes.len() as u32 + 2) | WIDE_FLAG);
            self.out.extend_from_slice(&bytes);
            self.out.extend_from_slice(&[0, 0]);
            self
        }

        pub(crate) fn narrow(&mut self, bytes: &[u8]) -> &mut Self {
            self.u32(bytes.len() as u32 + 1);
            self.out.extend_from_slice(bytes);
            self.out.push(0);
            self
        }

        pub(crate) fn segment(&mut self, bytes: &[u8]) -> &mut Self {
            self.u32(bytes.len() as u32);
            self.out.extend_from_slice(bytes);
            self
        }
    }

    fn sample_stream() -> Vec<u8> {
        let mut b = StreamBuilder::default();
        // one symbol with a narrow name and two dependency pairs
        b.u32(1)
            .narrow(b"_ms_message")
            .i32(3)
            .i32(-1)
            .i32(7)
            .i32(8)
            .i32(0)
            .i32(4)
            .i32(0x11)
            .i32(0x22)
            .i32(1)
            .i32(0x1234);
        b.u32(1).wide("_ms_message").i32(0).i32(5).i32(0x40);
        b.u32(1).wide("L_start").u32(0);
        b.segment(&[0x48, 0x00, 0x00, 0x00]);
        b.segment(&[0x05]);
        b.u32(1).u32(0).u32(4);
        b.segment(&[0x48, 0x00, 0x69, 0x00]);
        b.out
    }

    #[test]
    fn parses_all_sections() {
        let c = Container::parse(&sample_stream()).unwrap();
        assert_eq!(c.symbols.len(), 1);
        let s = &c.symbols[0];
        assert_eq!(s.name, "_ms_message");
        assert_eq!(s.deps, vec![(3, -1), (7, 8)]);
        assert_eq!(s.kind, 4);
        assert_eq!(s.unknown_8, 0x11);
        assert_eq!(s.unknown_14, 0x22);
        assert_eq!(s.call_convention(), CallConvention::Cdecl);
        assert_eq!(c.symbol_trailer, 0x1234);
        assert_eq!(c.functions[0].offset, 0x40);
        assert_eq!(c.labels[0].name, "L_start");
        assert_eq!(c.code, vec![0x05]);
        assert_eq!(c.messages, vec![MessageEntry { offset: 0, length: 4 }]);
        assert_eq!(c.message_text(0).as_deref(), Some("Hi"));
        assert_eq!(c.message_text(1), None);
    }

    #[test]
    fn message_text_drops_terminator() {
        let c = Container {
            messages: vec![
                MessageEntry { offset: 0, length: 4 },
                MessageEntry { offset: 4, length: 2 },
                MessageEntry { offset: 4, length: 8 },
            ],
            message_data: vec![0x48, 0x00, 0x00, 0x00, 0x41, 0x00],
            ..Container::default()
        };
        assert_eq!(c.message_text(0).as_deref(), Some("H"));
        assert!(c.message_terminated(0));
        assert_eq!(c.message_text(1).as_deref(), Some("A"));
        assert!(!c.message_terminated(1));
        assert_eq!(c.message_text(2), None);
        assert!(!c.message_terminated(2));
    }

    #[test]
    fn zero_closing_a_trailing_span_is_kept() {
        let texts = [
            ("\u{07}\u{08}v\0", false),
            ("\u{07}\u{08}v\0\0", true),
            ("a\u{07}\u{01}b\nr\0", false),
            ("\u{07}\u{08}v\0x\0", true),
        ];
        for (text, terminated) in texts {
            let bytes = encode_utf16le(text);
            let c = Container {
                messages: vec![MessageEntry {
                    offset: 0,
                    length: bytes.len() as u32,
                }],
                message_data: bytes,
                ..Container::default()
            };
            assert_eq!(c.message_terminated(0), terminated, "{:?}", text);
            let want = if terminated { &text[..text.len() - 1] } else { text };
            assert_eq!(c.message_text(0).as_deref(), Some(want), "{:?}", text);
        }
    }

    #[test]
    fn resave_normalises_strings_to_wide() {
        let original = Container::parse(&sample_stream()).unwrap();
        let saved = original.to_bytes().unwrap();

        // The narrow symbol name becomes wide on save.
        let first_len = u32::from_le_bytes([saved[4], saved[5], saved[6], saved[7]]);
        assert_ne!(first_len & WIDE_FLAG, 0);
        assert_eq!(first_len & !WIDE_FLAG, 2 * 11 + 2);

        let reloaded = Container::parse(&saved).unwrap();
        assert_eq!(reloaded, original);
        assert_eq!(reloaded.to_bytes().unwrap(), saved);
    }

    #[test]
    fn rejects_trailing_bytes() {
        let mut data = sample_stream();
        data.push(0);
        match Container::parse(&data) {
            Err(FormatError::TrailingBytes { count }) => assert_eq!(count, 1),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn rejects_truncated_stream() {
        let data = sample_stream();
        let cut = &data[..data.len() - 1];
        match Container::parse(cut) {
            Err(FormatError::Truncated { section, .. }) => assert_eq!(section, "message segment"),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn rejects_oversized_segment_length() {
        let mut b = StreamBuilder::default();
        b.u32(0).i32(0).u32(0).u32(0).u32(0xFFFF_FFF0);
        assert!(matches!(
            Container::parse(&b.out),
            Err(FormatError::Truncated { section: "string segment", .. })
        ));
    }

    #[test]
    fn rejects_wide_string_without_room_for_terminator() {
        let mut b = StreamBuilder::default();
        b.u32(1).u32(WIDE_FLAG | 1).out.push(0);
        assert!(matches!(
            Container::parse(&b.out),
            Err(FormatError::BadStringLength { .. })
        ));
    }

    #[test]
    fn string_at_stops_at_terminator_or_end() {
        let c = Container {
            strings: vec![0x48, 0x00, 0x69, 0x00, 0x00, 0x00, 0x41, 0x00],
            ..Container::default()
        };
        assert_eq!(c.string_at(0), "Hi");
        assert_eq!(c.string_at(2), "i");
        assert_eq!(c.string_at(4), "");
        assert_eq!(c.string_at(6), "A");
    }
}
