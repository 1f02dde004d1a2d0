use std::collections::{BTreeMap, BTreeSet, HashMap};
use thiserror::Error;

use crate::bytecode::Opcode;
use crate::container::{encode_utf16le, Container, MessageEntry};

#[derive(Debug, Error)]
pub enum PackingError {
    #[error("expected {expected} message texts, got {got}")]
    MessageCount { expected: usize, got: usize },

    #[error("rebuilt {segment} segment exceeds 4 GiB")]
    SegmentTooLarge { segment: &'static str },

    #[error("no replacement text for string offset {offset:#X}")]
    MissingString { offset: u32 },

    #[error("reference at {addr:#010X} is not a string load")]
    NotAStringLoad { addr: u32 },

    #[error(
        "string at {old_offset:#X} (reference at {addr:#010X}) moved to {new_offset:#X}, \
         which needs more than the {width}-byte operand of its bucket"
    )]
    OffsetOverflow {
        addr: u32,
        old_offset: u32,
        new_offset: u32,
        width: usize,
    },
}

/// Bytes needed to address `offset`: 1, 2 or 4. Also the bucket an original
/// offset belongs to.
pub fn offset_width(offset: u32) -> usize {
    if offset <= u32::from(u8::MAX) {
        1
    } else if offset <= u32::from(u16::MAX) {
        2
    } else {
        4
    }
}

/// Replace the message segment with `texts`, one per message-table entry,
/// laid out contiguously in index order. Entries that ended in a terminator
/// get one back; the rest are written exactly as given.
pub fn repack_messages(container: &mut Container, texts: &[String]) -> Result<(), PackingError> {
    if texts.len() != container.messages.len() {
        return Err(PackingError::MessageCount {
            expected: container.messages.len(),
            got: texts.len(),
        });
    }

    let too_large = || PackingError::SegmentTooLarge { segment: "message" };
    let mut data = Vec::new();
    let mut entries = Vec::with_capacity(texts.len());
    for (index, text) in texts.iter().enumerate() {
        let mut bytes = encode_utf16le(text);
        if container.message_terminated(index as u32) {
            bytes.extend_from_slice(&[0, 0]);
        }
        let offset = u32::try_from(data.len()).map_err(|_| too_large())?;
        let length = u32::try_from(bytes.len()).map_err(|_| too_large())?;
        entries.push(MessageEntry { offset, length });
        data.extend_from_slice(&bytes);
    }
    u32::try_from(data.len()).map_err(|_| too_large())?;

    log::debug!(
        "message segment repacked: {} -> {} bytes",
        container.message_data.len(),
        data.len()
    );
    container.messages = entries;
    container.message_data = data;
    Ok(())
}

/// Rebuild the string segment from `strings` (original offset to new text)
/// and patch every LOADSTRING operand in `refs` (instruction address to
/// original offset).
///
/// Offsets are grouped by the width bucket of their original value and the
/// buckets are emitted narrowest first, shortest string first within each.
/// A string whose new offset outgrows its bucket fails the whole repack; the
/// container is untouched on error.
pub fn repack_strings(
    container: &mut Container,
    refs: &BTreeMap<u32, u32>,
    strings: &BTreeMap<u32, String>,
) -> Result<(), PackingError> {
    let distinct: BTreeSet<u32> = refs.values().copied().collect();
    let mut buckets: [Vec<(u32, Vec<u8>)>; 3] = Default::default();
    for offset in distinct {
        let text = strings
            .get(&offset)
            .ok_or(PackingError::MissingString { offset })?;
        let slot = match offset_width(offset) {
            1 => 0,
            2 => 1,
            _ => 2,
        };
        buckets[slot].push((offset, encode_utf16le(text)));
    }

    let mut segment = Vec::new();
    let mut moved: HashMap<u32, u32> = HashMap::new();
    for bucket in &mut buckets {
        // Stable: equal lengths keep ascending original offset.
        bucket.sort_by_key(|(_, bytes)| bytes.len());
        for (offset, bytes) in bucket.iter() {
            let new_offset = u32::try_from(segment.len())
                .map_err(|_| PackingError::SegmentTooLarge { segment: "string" })?;
            moved.insert(*offset, new_offset);
            segment.extend_from_slice(bytes);
            segment.extend_from_slice(&[0, 0]);
        }
    }

    let mut code = container.code.clone();
    for (&addr, &old_offset) in refs {
        let new_offset = moved[&old_offset];
        let width = offset_width(old_offset);
        if offset_width(new_offset) > width {
            return Err(PackingError::OffsetOverflow {
                addr,
                old_offset,
                new_offset,
                width,
            });
        }

        let at = addr as usize;
        let operand_width = code
            .get(at)
            .and_then(|&b| Opcode::from_byte(b))
            .and_then(Opcode::string_operand_width)
            .ok_or(PackingError::NotAStringLoad { addr })?;
        let slot = code
            .get_mut(at + 1..at + 1 + operand_width)
            .ok_or(PackingError::NotAStringLoad { addr })?;
        slot.copy_from_slice(&new_offset.to_le_bytes()[..operand_width]);
    }

    log::debug!(
        "string segment repacked: {} offsets, {} -> {} bytes",
        moved.len(),
        container.strings.len(),
        segment.len()
    );
    container.strings = segment;
    container.code = code;
    Ok(())
}
