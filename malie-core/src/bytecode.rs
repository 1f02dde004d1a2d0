use std::collections::HashMap;
use std::fmt::Write as _;
use thiserror::Error;

use crate::container::{CallConvention, Container};
use crate::text::escape_string;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("{mnemonic} at {addr:#010X} runs past the end of the code segment")]
    Truncated { addr: u32, mnemonic: &'static str },

    #[error("{mnemonic} at {addr:#010X} targets {target:#010X}, outside the code segment and not labelled")]
    JumpTarget {
        addr: u32,
        mnemonic: &'static str,
        target: u32,
    },

    #[error("{mnemonic} at {addr:#010X} calls function index {index}, outside the function table")]
    FunctionIndex {
        addr: u32,
        mnemonic: &'static str,
        index: i64,
    },

    #[error("CALL at {addr:#010X}: no symbol named '{name}' to read its calling convention from")]
    UnknownSymbol { addr: u32, name: String },

    #[error("{mnemonic} at {addr:#010X} loads string offset {offset:#X}, outside the string segment")]
    StringOffset {
        addr: u32,
        mnemonic: &'static str,
        offset: u32,
    },

    #[error("CALL at {addr:#010X} emits message {index:#X}, which is not in the message table")]
    MessageIndex { addr: u32, index: u32 },

    #[error("message {index} spans {offset:#X}+{length:#X}, outside the message segment")]
    MessageRange { index: usize, offset: u32, length: u32 },
}

macro_rules! opcodes {
    ($($name:ident = $byte:literal => $mnemonic:literal,)*) => {
        /// Opcodes of the script VM. Bytes 0x0B and 0x10 are unassigned.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u8)]
        pub enum Opcode {
            $($name = $byte,)*
        }

        impl Opcode {
            pub fn from_byte(byte: u8) -> Option<Opcode> {
                match byte {
                    $($byte => Some(Opcode::$name),)*
                    _ => None,
                }
            }

            pub fn mnemonic(self) -> &'static str {
                match self {
                    $(Opcode::$name => $mnemonic,)*
                }
            }

            pub fn from_mnemonic(mnemonic: &str) -> Option<Opcode> {
                match mnemonic {
                    $($mnemonic => Some(Opcode::$name),)*
                    _ => None,
                }
            }
        }
    };
}

opcodes! {
    Jump = 0x00 => "JUMP",
    TJump = 0x01 => "TJUMP",
    FJump = 0x02 => "FJUMP",
    CallC = 0x03 => "CALL_C",
    CallCb = 0x04 => "CALL_CB",
    Stop = 0x05 => "STOP",
    Load = 0x06 => "LOAD",
    Store = 0x07 => "STORE",
    LoadConst = 0x08 => "LOADCONST",
    LoadString1 = 0x09 => "LOADSTRING1",
    LoadString2 = 0x0A => "LOADSTRING2",
    LoadString4 = 0x0C => "LOADSTRING4",
    Push = 0x0D => "PUSH",
    Pop = 0x0E => "POP",
    PushZ = 0x0F => "PUSHZ",
    PushB = 0x11 => "PUSHB",
    PushC = 0x12 => "PUSHC",
    InvSign = 0x13 => "INVSIGN",
    Add = 0x14 => "ADD",
    Sub = 0x15 => "SUB",
    Mul = 0x16 => "MUL",
    Div = 0x17 => "DIV",
    Mod = 0x18 => "MOD",
    And = 0x19 => "AND",
    Or = 0x1A => "OR",
    Xor = 0x1B => "XOR",
    Not = 0x1C => "NOT",
    Bool = 0x1D => "BOOL",
    LAnd = 0x1E => "LAND",
    LOr = 0x1F => "LOR",
    LNot = 0x20 => "LNOT",
    Lt = 0x21 => "LT",
    Le = 0x22 => "LE",
    Gt = 0x23 => "GT",
    Ge = 0x24 => "GE",
    Eq = 0x25 => "EQ",
    Ne = 0x26 => "NE",
    LShift = 0x27 => "LSHIFT",
    RShift = 0x28 => "RSHIFT",
    Inc = 0x29 => "INC",
    Dec = 0x2A => "DEC",
    Address = 0x2B => "ADDRESS",
    Dump = 0x2C => "DUMP",
    Call = 0x2D => "CALL",
    LoadFp = 0x2E => "LOAD_FP",
    StoreFp = 0x2F => "STORE_FP",
    AddressFp = 0x30 => "ADDRESS_FP",
    EnterFunc = 0x31 => "ENTER_FUNC",
    LeaveFunc = 0x32 => "LEAVE_FUNC",
    LeaveFuncStd = 0x33 => "LEAVE_FUNC_STD",
}

impl Opcode {
    /// Operand width of the string-load variants.
    pub fn string_operand_width(self) -> Option<usize> {
        match self {
            Opcode::LoadString1 => Some(1),
            Opcode::LoadString2 => Some(2),
            Opcode::LoadString4 => Some(4),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operand {
    None,
    /// Jump destination; `label` indexes the label table when one sits
    /// exactly at `target`.
    Target { target: u32, label: Option<usize> },
    /// Function-table index. For CALL_C/CALL_CB `argc` is the argument
    /// count; for a cdecl CALL it is the caller-side stack size.
    Call { function: usize, argc: Option<u8> },
    Value(u32),
    StringOffset(u32),
    FrameSize(u32),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    pub addr: u32,
    pub code: u8,
    /// `None` for bytes outside the opcode table.
    pub opcode: Option<Opcode>,
    pub operand: Operand,
}

/// Lookups built once per load: symbol name to the first symbol of that
/// name, label offset to the first label at that offset.
#[derive(Debug, Clone, Default)]
pub struct NameIndex {
    symbols: HashMap<String, usize>,
    labels: HashMap<u32, usize>,
}

impl NameIndex {
    pub fn build(container: &Container) -> Self {
        let mut index = NameIndex::default();
        for (i, s) in container.symbols.iter().enumerate() {
            index.symbols.entry(s.name.clone()).or_insert(i);
        }
        for (i, l) in container.labels.iter().enumerate() {
            index.labels.entry(l.offset).or_insert(i);
        }
        index
    }

    pub fn symbol(&self, name: &str) -> Option<usize> {
        self.symbols.get(name).copied()
    }

    pub fn label_at(&self, offset: u32) -> Option<usize> {
        self.labels.get(&offset).copied()
    }
}

/// Walks the code segment front to back, yielding one decoded instruction
/// at a time. The first error ends the stream.
pub struct Decoder<'a> {
    container: &'a Container,
    names: &'a NameIndex,
    pos: usize,
    done: bool,
}

impl<'a> Decoder<'a> {
    pub fn new(container: &'a Container, names: &'a NameIndex) -> Self {
        Self {
            container,
            names,
            pos: 0,
            done: false,
        }
    }

    fn take<const N: usize>(&mut self, addr: u32, op: Opcode) -> Result<[u8; N], DecodeError> {
        let container = self.container;
        let bytes = container
            .code
            .get(self.pos..self.pos + N)
            .ok_or(DecodeError::Truncated {
                addr,
                mnemonic: op.mnemonic(),
            })?;
        self.pos += N;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        Ok(out)
    }

    fn u8(&mut self, addr: u32, op: Opcode) -> Result<u8, DecodeError> {
        Ok(self.take::<1>(addr, op)?[0])
    }

    fn u16(&mut self, addr: u32, op: Opcode) -> Result<u16, DecodeError> {
        Ok(u16::from_le_bytes(self.take(addr, op)?))
    }

    fn u32(&mut self, addr: u32, op: Opcode) -> Result<u32, DecodeError> {
        Ok(u32::from_le_bytes(self.take(addr, op)?))
    }

    fn jump(&mut self, addr: u32, op: Opcode) -> Result<Operand, DecodeError> {
        let target = self.u32(addr, op)?;
        let label = self.names.label_at(target);
        let in_range = (target as usize) < self.container.code.len();
        if label.is_none() && !in_range {
            if op != Opcode::Jump {
                return Err(DecodeError::JumpTarget {
                    addr,
                    mnemonic: op.mnemonic(),
                    target,
                });
            }
            log::warn!(
                "JUMP at {:#010X} targets {:#010X}, past the end of the code segment",
                addr,
                target
            );
        }
        Ok(Operand::Target { target, label })
    }

    fn function(&self, addr: u32, op: Opcode, index: i64) -> Result<usize, DecodeError> {
        if index >= 0 && (index as usize) < self.container.functions.len() {
            Ok(index as usize)
        } else {
            Err(DecodeError::FunctionIndex {
                addr,
                mnemonic: op.mnemonic(),
                index,
            })
        }
    }

    fn string(&mut self, addr: u32, op: Opcode) -> Result<Operand, DecodeError> {
        let offset = match op {
            Opcode::LoadString1 => u32::from(self.u8(addr, op)?),
            Opcode::LoadString2 => u32::from(self.u16(addr, op)?),
            _ => self.u32(addr, op)?,
        };
        if (offset as usize) < self.container.strings.len() {
            Ok(Operand::StringOffset(offset))
        } else {
            Err(DecodeError::StringOffset {
                addr,
                mnemonic: op.mnemonic(),
                offset,
            })
        }
    }

    fn operand(&mut self, addr: u32, op: Opcode) -> Result<Operand, DecodeError> {
        use Opcode::*;

        let container = self.container;

        Ok(match op {
            Jump | TJump | FJump => self.jump(addr, op)?,
            CallC => {
                let index = self.u32(addr, op)? as i32;
                let argc = self.u8(addr, op)?;
                let function = self.function(addr, op, i64::from(index))?;
                Operand::Call {
                    function,
                    argc: Some(argc),
                }
            }
            CallCb => {
                let index = self.u8(addr, op)?;
                let argc = self.u8(addr, op)?;
                let function = self.function(addr, op, i64::from(index))?;
                Operand::Call {
                    function,
                    argc: Some(argc),
                }
            }
            Call => {
                let index = self.u32(addr, op)? as i32;
                let function = self.function(addr, op, i64::from(index))?;
                let name = &container.functions[function].name;
                let symbol = self
                    .names
                    .symbol(name)
                    .ok_or_else(|| DecodeError::UnknownSymbol {
                        addr,
                        name: name.clone(),
                    })?;
                let argc = match container.symbols[symbol].call_convention() {
                    CallConvention::Cdecl => Some(self.u8(addr, op)?),
                    _ => None,
                };
                Operand::Call { function, argc }
            }
            LoadConst | Push => Operand::Value(self.u32(addr, op)?),
            PushB => Operand::Value(u32::from(self.u8(addr, op)?)),
            LoadString1 | LoadString2 | LoadString4 => self.string(addr, op)?,
            EnterFunc => Operand::FrameSize(self.u32(addr, op)?),
            LeaveFuncStd => Operand::FrameSize(u32::from(self.u8(addr, op)?)),
            _ => Operand::None,
        })
    }
}

impl<'a> Iterator for Decoder<'a> {
    type Item = Result<Instruction, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.pos >= self.container.code.len() {
            return None;
        }

        let addr = self.pos as u32;
        let code = self.container.code[self.pos];
        self.pos += 1;

        let opcode = Opcode::from_byte(code);
        let operand = match opcode {
            Some(op) => match self.operand(addr, op) {
                Ok(operand) => operand,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            },
            None => {
                // Length unknown: treated as a bare byte, which may
                // desynchronise the rest of the walk.
                log::warn!("unexplored opcode {:#04X} at {:#010X}", code, addr);
                Operand::None
            }
        };

        Some(Ok(Instruction {
            addr,
            code,
            opcode,
            operand,
        }))
    }
}

impl Instruction {
    /// One listing line: `AAAAAAAA| MNEMONIC operands`.
    pub fn render(&self, container: &Container) -> String {
        let op = match self.opcode {
            Some(op) => op,
            None => return format!("{:08X}| {:02X} ; unexplored", self.addr, self.code),
        };

        let mut line = format!("{:08X}| {}", self.addr, op.mnemonic());
        match &self.operand {
            Operand::None => {}
            Operand::Target { target, label } => match label {
                Some(i) => {
                    let _ = write!(line, " {}", container.labels[*i].name);
                }
                None if (*target as usize) < container.code.len() => {
                    let _ = write!(line, " {:08X}h", target);
                }
                None => {
                    let _ = write!(line, " {:08X}h ; out of range", target);
                }
            },
            Operand::Call { function, argc } => {
                let _ = write!(line, " {}", container.functions[*function].name);
                if let Some(n) = argc {
                    let _ = write!(line, " ({})", n);
                }
            }
            Operand::Value(v) if op == Opcode::PushB => {
                let _ = write!(line, " {:02X}h ({})", v, v);
            }
            Operand::Value(v) => {
                let _ = write!(line, " {:08X}h ({})", v, v);
            }
            Operand::StringOffset(offset) => {
                let _ = write!(line, " \"{}\"", escape_string(&container.string_at(*offset)));
            }
            Operand::FrameSize(size) => {
                let _ = write!(line, " {:08X}h", size);
            }
        }
        line
    }
}

/// Render the whole code segment, one instruction per line.
pub fn listing(container: &Container, names: &NameIndex) -> Result<String, DecodeError> {
    let mut out = String::new();
    for insn in Decoder::new(container, names) {
        out.push_str(&insn?.render(container));
        out.push('\n');
    }
    Ok(out)
}
