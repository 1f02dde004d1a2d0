use std::collections::BTreeMap;

use crate::bytecode::{DecodeError, Decoder, NameIndex, Opcode, Operand};
use crate::container::Container;

/// Native that shows the message whose index was pushed last.
pub const MESSAGE_NATIVE: &str = "_ms_message";
/// Native that shows the character name loaded last.
pub const NAME_NATIVE: &str = "MALIE_NAME";
/// Message-reference index marking a character name.
pub const NAME_INDEX: u32 = 0xAAAA_AAAA;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRef {
    /// Address of the CALL that emitted it.
    pub addr: u32,
    pub index: u32,
    pub text: String,
}

impl MessageRef {
    pub fn is_name(&self) -> bool {
        self.index == NAME_INDEX
    }
}

/// Side tables derived from one pass over the code segment. Stale as soon as
/// the code, string or message segments change.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanResult {
    /// LOADSTRING instruction address to string-segment offset.
    pub string_refs: BTreeMap<u32, u32>,
    /// Messages and names in code order.
    pub messages: Vec<MessageRef>,
}

impl ScanResult {
    /// Distinct referenced string offsets with their current text.
    pub fn strings(&self, container: &Container) -> BTreeMap<u32, String> {
        self.string_refs
            .values()
            .map(|&offset| (offset, container.string_at(offset)))
            .collect()
    }
}

/// Walk the code segment once and collect string and message references.
///
/// The operand stack is not simulated. The message index is the value of the
/// most recent PUSH/PUSHB/PUSHZ and the name is the most recently loaded
/// string, which holds only when the engine's code generator emits the push
/// or load right before the call.
pub fn scan(container: &Container, names: &NameIndex) -> Result<ScanResult, DecodeError> {
    let mut result = ScanResult::default();
    let mut last_push: u32 = 0;
    let mut last_string = String::new();
    let mut unexplored = 0usize;

    for insn in Decoder::new(container, names) {
        let insn = insn?;
        let op = match insn.opcode {
            Some(op) => op,
            None => {
                unexplored += 1;
                continue;
            }
        };

        match (op, &insn.operand) {
            (Opcode::Push | Opcode::PushB, Operand::Value(v)) => last_push = *v,
            (Opcode::PushZ, _) => last_push = 0,
            (_, Operand::StringOffset(offset)) => {
                result.string_refs.insert(insn.addr, *offset);
                last_string = container.string_at(*offset);
            }
            (Opcode::Call, Operand::Call { function, .. }) => {
                let name = container.functions[*function].name.as_str();
                if name == MESSAGE_NATIVE {
                    let text = container
                        .message_text(last_push)
                        .ok_or(DecodeError::MessageIndex {
                            addr: insn.addr,
                            index: last_push,
                        })?;
                    result.messages.push(MessageRef {
                        addr: insn.addr,
                        index: last_push,
                        text,
                    });
                } else if name == NAME_NATIVE {
                    result.messages.push(MessageRef {
                        addr: insn.addr,
                        index: NAME_INDEX,
                        text: last_string.clone(),
                    });
                }
            }
            _ => {}
        }
    }

    log::debug!(
        "scan: {} string references, {} message references, {} unexplored bytes",
        result.string_refs.len(),
        result.messages.len(),
        unexplored,
    );

    Ok(result)
}
