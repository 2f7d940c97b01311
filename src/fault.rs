use thiserror::Error;

use crate::decode::Opcode;

/// A fatal machine fault.
///
/// Faults end the run. The instruction that raised one commits no side
/// effects: memory, `pc` and `rb` are left exactly as they were when it was
/// fetched.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum Fault {
    /// The word at `pc` does not name an opcode in the instruction table.
    #[error("undecodable instruction {word} at pc {pc}")]
    Decode { pc: u64, word: i64 },

    /// An addressing-mode digit other than 0, 1 or 2.
    #[error("unknown addressing mode {mode} at pc {pc}")]
    InvalidMode { pc: u64, mode: u8 },

    /// A write-target argument was encoded in immediate mode.
    #[error("{opcode:?} at pc {pc} writes through an immediate argument")]
    InvalidWriteTarget { pc: u64, opcode: Opcode },

    /// An address was requested for an immediate argument.
    #[error("immediate argument has no address")]
    ImmediateAddress,

    /// An effective address resolved below zero.
    #[error("negative address {address}")]
    NegativeAddress { address: i64 },

    /// An arithmetic result or relative base does not fit in 64 bits.
    #[error("arithmetic overflow at pc {pc}")]
    Overflow { pc: u64 },
}
