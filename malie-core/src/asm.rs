use thiserror::Error;

use crate::bytecode::Opcode;

/// Errors that can occur while assembling a mnemonic listing.
#[derive(Debug, Error)]
pub enum AsmError {
    #[error("unknown mnemonic '{mnemonic}' on line {line}")]
    UnknownMnemonic { line: usize, mnemonic: String },

    #[error("wrong operand count for {mnemonic} on line {line}: expected {expected}, got {got}")]
    WrongArgCount {
        line: usize,
        mnemonic: String,
        expected: &'static str,
        got: usize,
    },

    #[error("failed to parse integer '{token}' on line {line}")]
    ParseInt {
        line: usize,
        token: String,
        #[source]
        source: std::num::ParseIntError,
    },

    #[error("value '{token}' on line {line} is out of range for {kind}")]
    ValueOutOfRange {
        line: usize,
        token: String,
        kind: &'static str,
    },
}

fn parse_int(line: usize, token: &str) -> Result<u32, AsmError> {
    let t = token.trim_end_matches(',');
    let res = if let Some(hex) = t.strip_prefix("0x").or_else(|| t.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16)
    } else {
        t.parse::<u32>()
    };

    res.map_err(|e| AsmError::ParseInt {
        line,
        token: t.to_string(),
        source: e,
    })
}

fn parse_u8(line: usize, token: &str, kind: &'static str) -> Result<u8, AsmError> {
    let v = parse_int(line, token)?;
    u8::try_from(v).map_err(|_| AsmError::ValueOutOfRange {
        line,
        token: token.to_string(),
        kind,
    })
}

fn parse_u16(line: usize, token: &str, kind: &'static str) -> Result<u16, AsmError> {
    let v = parse_int(line, token)?;
    u16::try_from(v).map_err(|_| AsmError::ValueOutOfRange {
        line,
        token: token.to_string(),
        kind,
    })
}

/// Assemble a listing into code-segment bytes.
///
/// One instruction per line, mnemonics as printed by the listing
/// (case-insensitive), operands in decimal or 0x-prefixed hex:
///
/// - `JUMP t`, `TJUMP t`, `FJUMP t`, `LOADCONST v`, `PUSH v`,
///   `LOADSTRING4 o`, `ENTER_FUNC n`: one 32-bit operand
/// - `LOADSTRING1 o`, `PUSHB v`, `LEAVE_FUNC_STD n`: one byte
/// - `LOADSTRING2 o`: one 16-bit operand
/// - `CALL_C f argc`: 32-bit function index, argument-count byte
/// - `CALL_CB f argc`: byte function index, argument-count byte
/// - `CALL f` or `CALL f stack`: the second form adds the cdecl stack byte
/// - `BYTE b`: a raw byte, for opcodes outside the table
///
/// Everything else takes no operands. Blank lines and lines starting with
/// `#` or `//` are ignored.
pub fn assemble(src: &str) -> Result<Vec<u8>, AsmError> {
    let mut out = Vec::new();

    for (idx, raw_line) in src.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with("//") {
            continue;
        }

        let mut parts = line.split_whitespace();
        let mnemonic = match parts.next() {
            Some(tok) => tok.to_ascii_uppercase(),
            None => continue,
        };
        let args: Vec<&str> = parts.collect();

        let arity = |expected: &'static str, ok: bool| -> Result<(), AsmError> {
            if ok {
                Ok(())
            } else {
                Err(AsmError::WrongArgCount {
                    line: line_no,
                    mnemonic: mnemonic.clone(),
                    expected,
                    got: args.len(),
                })
            }
        };

        if mnemonic == "BYTE" {
            arity("1", args.len() == 1)?;
            out.push(parse_u8(line_no, args[0], "BYTE")?);
            continue;
        }

        let op = Opcode::from_mnemonic(&mnemonic).ok_or_else(|| AsmError::UnknownMnemonic {
            line: line_no,
            mnemonic: mnemonic.clone(),
        })?;
        out.push(op as u8);

        match op {
            Opcode::Jump
            | Opcode::TJump
            | Opcode::FJump
            | Opcode::LoadConst
            | Opcode::Push
            | Opcode::LoadString4
            | Opcode::EnterFunc => {
                arity("1", args.len() == 1)?;
                out.extend_from_slice(&parse_int(line_no, args[0])?.to_le_bytes());
            }
            Opcode::LoadString1 | Opcode::PushB | Opcode::LeaveFuncStd => {
                arity("1", args.len() == 1)?;
                out.push(parse_u8(line_no, args[0], "a byte operand")?);
            }
            Opcode::LoadString2 => {
                arity("1", args.len() == 1)?;
                out.extend_from_slice(&parse_u16(line_no, args[0], "a 16-bit operand")?.to_le_bytes());
            }
            Opcode::CallC => {
                arity("2", args.len() == 2)?;
                out.extend_from_slice(&parse_int(line_no, args[0])?.to_le_bytes());
                out.push(parse_u8(line_no, args[1], "argc")?);
            }
            Opcode::CallCb => {
                arity("2", args.len() == 2)?;
                out.push(parse_u8(line_no, args[0], "a byte function index")?);
                out.push(parse_u8(line_no, args[1], "argc")?);
            }
            Opcode::Call => {
                arity("1 or 2", args.len() == 1 || args.len() == 2)?;
                out.extend_from_slice(&parse_int(line_no, args[0])?.to_le_bytes());
                if let Some(stack) = args.get(1) {
                    out.push(parse_u8(line_no, stack, "stack size")?);
                }
            }
            _ => arity("0", args.is_empty())?,
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assembles_operand_widths() {
        let bytes = assemble("LOADSTRING1 5\nloadstring2 0x1234\nLOADSTRING4 0x10000").unwrap();
        assert_eq!(
            bytes,
            vec![0x09, 0x05, 0x0A, 0x34, 0x12, 0x0C, 0x00, 0x00, 0x01, 0x00]
        );
    }

    #[test]
    fn assembles_calls() {
        let bytes = assemble("CALL 2\nCALL 1 8\nCALL_C 3 1\nCALL_CB 4 0").unwrap();
        assert_eq!(
            bytes,
            vec![
                0x2D, 2, 0, 0, 0, //
                0x2D, 1, 0, 0, 0, 8, //
                0x03, 3, 0, 0, 0, 1, //
                0x04, 4, 0,
            ]
        );
    }

    #[test]
    fn skips_comments_and_emits_raw_bytes() {
        let bytes = assemble("# header\n\n// note\nBYTE 0xEE\nSTOP").unwrap();
        assert_eq!(bytes, vec![0xEE, 0x05]);
    }

    #[test]
    fn reports_errors_with_line_numbers() {
        assert!(matches!(
            assemble("STOP\nFROB"),
            Err(AsmError::UnknownMnemonic { line: 2, .. })
        ));
        assert!(matches!(
            assemble("PUSH"),
            Err(AsmError::WrongArgCount { line: 1, got: 0, .. })
        ));
        assert!(matches!(
            assemble("ADD 1"),
            Err(AsmError::WrongArgCount { got: 1, .. })
        ));
        assert!(matches!(
            assemble("PUSHB 256"),
            Err(AsmError::ValueOutOfRange { line: 1, .. })
        ));
        assert!(matches!(
            assemble("PUSH twelve"),
            Err(AsmError::ParseInt { line: 1, .. })
        ));
    }
}
