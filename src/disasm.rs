use std::fmt::Write;

use crate::decode::{Argument, decode};

/// Pretty-print a listing of a program image for human inspection.
///
/// Code and data share memory, so this is a linear sweep: every word that
/// decodes to an instruction whose arguments fit in the image is listed as
/// that instruction, anything else as a single `DATA` word.
pub fn disassemble(image: &[i64]) -> String {
    let mut out = String::new();
    let mut pc = 0;
    while pc < image.len() {
        let word = image[pc];
        let inst = match decode(word, pc as u64) {
            Ok(inst) if pc + inst.opcode.arity() < image.len() => inst,
            _ => {
                let _ = writeln!(out, "{pc:04}: DATA {word}");
                pc += 1;
                continue;
            }
        };

        let arity = inst.opcode.arity();
        let args: Vec<String> = (0..arity)
            .map(|k| render(Argument::new(inst.mode(k), image[pc + 1 + k])))
            .collect();
        let _ = writeln!(
            out,
            "{pc:04}: {:<4} {}",
            inst.opcode.mnemonic(),
            args.join(", ")
        );
        pc += 1 + arity;
    }
    out
}

fn render(arg: Argument) -> String {
    match arg {
        Argument::Position(addr) => format!("[{addr}]"),
        Argument::Immediate(value) => format!("#{value}"),
        Argument::Relative(offset) if offset < 0 => format!("[rb{offset}]"),
        Argument::Relative(offset) => format!("[rb+{offset}]"),
    }
}
