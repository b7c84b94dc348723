use core::fmt::Write as _;

use crate::op::Op;
use crate::writer::read_i32;

/// Render one instruction at `pc`; returns the text and the next pc.
pub fn disassemble_at(code: &[u8], pc: usize) -> (String, usize) {
    let Some(op) = Op::from_u8(code[pc]) else {
        return (format!("{pc:4}: <bad opcode 0x{:02x}>", code[pc]), pc + 1);
    };
    let mut text = format!("{pc:4}: {op:?}");
    match op.length() {
        1 => {}
        2 => {
            let _ = write!(text, " {}", code[pc + 1]);
        }
        3 => {
            let _ = write!(text, " {} {}", code[pc + 1], code[pc + 2]);
        }
        5 => {
            let _ = write!(text, " {}", read_i32(code, pc + 1));
        }
        6 => match op {
            Op::ReturnWide => {
                let _ = write!(
                    text,
                    " {} {}",
                    read_i32(code, pc + 1),
                    code[pc + 5]
                );
            }
            _ => {
                let _ = write!(
                    text,
                    " {} {}",
                    code[pc + 1],
                    read_i32(code, pc + 2)
                );
            }
        },
        9 => {
            let _ = write!(
                text,
                " {} {}",
                read_i32(code, pc + 1),
                read_i32(code, pc + 5)
            );
        }
        _ => unreachable!(),
    }
    (text, pc + op.length())
}

/// Disassemble a whole function body (stops after `MethodEnd`).
pub fn disassemble(code: &[u8]) -> String {
    let mut out = String::new();
    let mut pc = 0;
    while pc < code.len() {
        let stop = code[pc] == Op::MethodEnd as u8;
        let (line, next) = disassemble_at(code, pc);
        out.push_str(&line);
        out.push('\n');
        pc = next;
        if stop {
            break;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer::BytecodeWriter;

    #[test]
    fn renders_operands_and_stops_at_method_end() {
        let mut w = BytecodeWriter::new();
        w.op(Op::LoadLiteral1);
        w.op_i32(Op::LoadLiteralWide, 1000);
        w.op_u8_u8(Op::Return, 0, 0);
        let code = w.finish();

        let text = disassemble(&code);
        assert!(text.contains("LoadLiteral1"));
        assert!(text.contains("LoadLiteralWide 1000"));
        assert!(text.contains("Return 0 0"));
        assert!(text.trim_end().ends_with("MethodEnd"));
    }
}
