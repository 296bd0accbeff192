//! Human-readable bytecode dumps, used by `izi --disassemble` and by tests
//! that want to assert on emitted instruction sequences without running
//! the VM.

use std::fmt::Write as _;

use izi_core::{Chunk, OpCode};

/// Disassemble every instruction in `chunk`, prefixed with a `== name ==`
/// header, one line per instruction.
pub fn disassemble_chunk(chunk: &Chunk, name: &str) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "== {} ==", name);
    let mut offset = 0;
    while offset < chunk.len() {
        let (line, next) = disassemble_instruction(chunk, offset);
        out.push_str(&line);
        out.push('\n');
        offset = next;
    }
    out
}

/// Disassemble one instruction at `offset`, returning its text and the
/// offset of the next instruction.
pub fn disassemble_instruction(chunk: &Chunk, offset: usize) -> (String, usize) {
    let mut line = String::new();
    let _ = write!(line, "{:04} ", offset);

    if offset > 0 && chunk.line_at(offset) == chunk.line_at(offset - 1) {
        line.push_str("   | ");
    } else {
        let _ = write!(line, "{:4} ", chunk.line_at(offset));
    }

    let byte = chunk.read_byte(offset);
    let Some(op) = OpCode::from_u8(byte) else {
        let _ = write!(line, "Unknown opcode {}", byte);
        return (line, offset + 1);
    };

    let next = match op {
        OpCode::Constant | OpCode::DefineGlobal | OpCode::GetGlobal | OpCode::SetGlobal => {
            constant_instruction(&mut line, op, chunk, offset)
        }
        OpCode::GetLocal
        | OpCode::SetLocal
        | OpCode::GetUpvalue
        | OpCode::SetUpvalue
        | OpCode::Call => byte_instruction(&mut line, op, chunk, offset),
        OpCode::GetProperty | OpCode::SetProperty | OpCode::GetSuper | OpCode::Method | OpCode::Import => {
            constant_instruction(&mut line, op, chunk, offset)
        }
        OpCode::Jump | OpCode::JumpIfFalse => jump_instruction(&mut line, op, chunk, offset, 1),
        OpCode::Loop => jump_instruction(&mut line, op, chunk, offset, -1),
        OpCode::Closure => closure_instruction(&mut line, chunk, offset),
        OpCode::Class => constant_instruction(&mut line, op, chunk, offset),
        _ => simple_instruction(&mut line, op, offset),
    };

    (line, next)
}

fn simple_instruction(line: &mut String, op: OpCode, offset: usize) -> usize {
    line.push_str(op.name());
    offset + 1
}

fn byte_instruction(line: &mut String, op: OpCode, chunk: &Chunk, offset: usize) -> usize {
    let slot = chunk.read_byte(offset + 1);
    let _ = write!(line, "{:<16} {:4}", op.name(), slot);
    offset + 2
}

fn constant_instruction(line: &mut String, op: OpCode, chunk: &Chunk, offset: usize) -> usize {
    let idx = chunk.read_byte(offset + 1) as usize;
    let value = chunk
        .constants
        .get(idx)
        .map(|v| v.to_string())
        .unwrap_or_else(|| "<out of range>".to_string());
    let _ = write!(line, "{:<16} {:4} '{}'", op.name(), idx, value);
    offset + 2
}

fn jump_instruction(line: &mut String, op: OpCode, chunk: &Chunk, offset: usize, sign: i32) -> usize {
    let jump = chunk.read_u16(offset + 1) as i32;
    let target = offset as i32 + 3 + sign * jump;
    let _ = write!(line, "{:<16} {:4} -> {}", op.name(), offset, target);
    offset + 3
}

fn closure_instruction(line: &mut String, chunk: &Chunk, offset: usize) -> usize {
    let idx = chunk.read_byte(offset + 1) as usize;
    let value = chunk
        .constants
        .get(idx)
        .map(|v| v.to_string())
        .unwrap_or_else(|| "<out of range>".to_string());
    let _ = write!(line, "{:<16} {:4} '{}'", OpCode::Closure.name(), idx, value);

    let mut next = offset + 2;
    let upvalue_count = match chunk.constants.get(idx) {
        Some(izi_core::Value::Function(f)) => f.upvalue_count,
        _ => 0,
    };
    for _ in 0..upvalue_count {
        let is_local = chunk.read_byte(next);
        let index = chunk.read_byte(next + 1);
        let _ = write!(
            line,
            "\n{:04}      |                     {} {}",
            next,
            if is_local == 1 { "local" } else { "upvalue" },
            index
        );
        next += 2;
    }
    next
}

#[cfg(test)]
mod tests {
    use super::*;
    use izi_core::Value;

    #[test]
    fn disassembles_a_constant_and_return() {
        let mut chunk = Chunk::new();
        let idx = chunk.add_constant(Value::Number(1.0)).unwrap();
        chunk.write(OpCode::Constant.as_u8(), 1);
        chunk.write(idx, 1);
        chunk.write(OpCode::Return.as_u8(), 1);

        let out = disassemble_chunk(&chunk, "test");
        assert!(out.contains("== test =="));
        assert!(out.contains("OP_CONSTANT"));
        assert!(out.contains("OP_RETURN"));
    }

    #[test]
    fn repeated_lines_are_collapsed() {
        let mut chunk = Chunk::new();
        chunk.write(OpCode::Nil.as_u8(), 5);
        chunk.write(OpCode::Pop.as_u8(), 5);
        let out = disassemble_chunk(&chunk, "lines");
        let second_line = out.lines().nth(2).unwrap();
        assert!(second_line.contains("   |"));
    }
}
