//! Bytecode disassembler, used by `--print-code` and `--trace`.

use super::heap::{GcRef, Heap};
use super::ops::Op;
use super::Chunk;

/// Disassemble a whole function, header included.
pub fn disassemble(heap: &Heap, function: GcRef) -> String {
    let func = heap.function(function);
    let name = match func.name {
        Some(name) => heap.as_str(name),
        None => "script",
    };

    let mut out = format!("== {} ==\n", name);
    let mut offset = 0;
    while offset < func.chunk.code.len() {
        let (text, next) = disassemble_instruction(heap, &func.chunk, offset);
        out.push_str(&text);
        out.push('\n');
        offset = next;
    }
    out
}

/// Disassemble the instruction at `offset`; returns the rendered line and
/// the offset of the next instruction.
pub fn disassemble_instruction(heap: &Heap, chunk: &Chunk, offset: usize) -> (String, usize) {
    let mut text = format!("{:04} ", offset);
    if offset > 0 && chunk.lines[offset] == chunk.lines[offset - 1] {
        text.push_str("   | ");
    } else {
        text.push_str(&format!("{:4} ", chunk.lines[offset]));
    }

    let byte = chunk.code[offset];
    let Some(op) = Op::decode(byte) else {
        text.push_str(&format!("unknown opcode {}", byte));
        return (text, offset + 1);
    };

    match op {
        Op::Constant
        | Op::GetGlobal
        | Op::DefineGlobal
        | Op::SetGlobal
        | Op::GetProperty
        | Op::SetProperty
        | Op::GetSuper
        | Op::Class
        | Op::Method => {
            let constant = chunk.code[offset + 1];
            text.push_str(&format!(
                "{:<16?} {:4} '{}'",
                op,
                constant,
                heap.format_value(chunk.constants[constant as usize])
            ));
            (text, offset + 2)
        }
        Op::GetLocal | Op::SetLocal | Op::GetUpvalue | Op::SetUpvalue | Op::Call => {
            let slot = chunk.code[offset + 1];
            text.push_str(&format!("{:<16?} {:4}", op, slot));
            (text, offset + 2)
        }
        Op::Jump | Op::JumpIfFalse | Op::Loop => {
            let distance =
                ((chunk.code[offset + 1] as usize) << 8) | chunk.code[offset + 2] as usize;
            let target = if op == Op::Loop {
                offset + 3 - distance
            } else {
                offset + 3 + distance
            };
            text.push_str(&format!("{:<16?} {:4} -> {}", op, offset, target));
            (text, offset + 3)
        }
        Op::Invoke | Op::SuperInvoke => {
            let constant = chunk.code[offset + 1];
            let arg_count = chunk.code[offset + 2];
            text.push_str(&format!(
                "{:<16?} ({} args) {:4} '{}'",
                op,
                arg_count,
                constant,
                heap.format_value(chunk.constants[constant as usize])
            ));
            (text, offset + 3)
        }
        Op::Closure => {
            let constant = chunk.code[offset + 1];
            let function = chunk.constants[constant as usize];
            text.push_str(&format!(
                "{:<16?} {:4} {}",
                op,
                constant,
                heap.format_value(function)
            ));

            // The upvalue pairs trail the instruction.
            let function = function.as_obj().expect("closure over non-object");
            let upvalue_count = heap.function(function).upvalue_count;
            let mut next = offset + 2;
            for _ in 0..upvalue_count {
                let is_local = chunk.code[next] != 0;
                let index = chunk.code[next + 1];
                text.push_str(&format!(
                    "\n{:04}    |                     {} {}",
                    next,
                    if is_local { "local" } else { "upvalue" },
                    index
                ));
                next += 2;
            }
            (text, next)
        }
        _ => {
            text.push_str(&format!("{:?}", op));
            (text, offset + 1)
        }
    }
}
