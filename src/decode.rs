use crate::fault::Fault;
use crate::memory::Memory;

/// Operation selector, the low two decimal digits of an instruction word.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Opcode {
    Add = 1,
    Mul = 2,
    Input = 3,
    Output = 4,
    JumpIfTrue = 5,
    JumpIfFalse = 6,
    LessThan = 7,
    Equals = 8,
    AdjustBase = 9,
    Halt = 99,
}

impl Opcode {
    pub fn from_code(code: i64) -> Option<Self> {
        Some(match code {
            1 => Self::Add,
            2 => Self::Mul,
            3 => Self::Input,
            4 => Self::Output,
            5 => Self::JumpIfTrue,
            6 => Self::JumpIfFalse,
            7 => Self::LessThan,
            8 => Self::Equals,
            9 => Self::AdjustBase,
            99 => Self::Halt,
            _ => return None,
        })
    }

    /// Number of argument words following the instruction word.
    pub fn arity(self) -> usize {
        match self {
            Self::Add | Self::Mul | Self::LessThan | Self::Equals => 3,
            Self::JumpIfTrue | Self::JumpIfFalse => 2,
            Self::Input | Self::Output | Self::AdjustBase => 1,
            Self::Halt => 0,
        }
    }

    /// Index of the argument the instruction writes through, if any.
    pub fn write_slot(self) -> Option<usize> {
        match self {
            Self::Add | Self::Mul | Self::LessThan | Self::Equals => Some(2),
            Self::Input => Some(0),
            _ => None,
        }
    }

    pub fn mnemonic(self) -> &'static str {
        match self {
            Self::Add => "ADD",
            Self::Mul => "MUL",
            Self::Input => "IN",
            Self::Output => "OUT",
            Self::JumpIfTrue => "JNZ",
            Self::JumpIfFalse => "JZ",
            Self::LessThan => "LT",
            Self::Equals => "EQ",
            Self::AdjustBase => "ARB",
            Self::Halt => "HALT",
        }
    }
}

/// How an argument literal is interpreted.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Mode {
    /// The literal is an address.
    #[default]
    Position = 0,
    /// The literal is the value.
    Immediate = 1,
    /// The literal plus the relative base is an address.
    Relative = 2,
}

impl Mode {
    pub fn from_digit(digit: u8) -> Option<Self> {
        match digit {
            0 => Some(Self::Position),
            1 => Some(Self::Immediate),
            2 => Some(Self::Relative),
            _ => None,
        }
    }
}

/// The longest argument list of any opcode.
pub const MAX_ARITY: usize = 3;

/// A decoded instruction word.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Instruction {
    pub opcode: Opcode,
    /// Mode of each argument in argument order. Slots past the opcode's
    /// arity are always `Position`.
    pub modes: [Mode; MAX_ARITY],
}

impl Instruction {
    pub fn mode(&self, arg: usize) -> Mode {
        self.modes.get(arg).copied().unwrap_or_default()
    }
}

/// Split an instruction word into its opcode and per-argument modes.
///
/// Argument k (0-indexed) takes its mode from decimal digit k of
/// `word / 100`, counting from the units digit. Only the digits belonging to
/// arguments the opcode actually has are checked; anything above them is
/// ignored. `pc` is only used to label faults.
pub fn decode(word: i64, pc: u64) -> Result<Instruction, Fault> {
    if word < 0 {
        return Err(Fault::Decode { pc, word });
    }
    let opcode = Opcode::from_code(word % 100).ok_or(Fault::Decode { pc, word })?;

    let mut modes = [Mode::Position; MAX_ARITY];
    let mut digits = word / 100;
    for slot in modes.iter_mut().take(opcode.arity()) {
        let digit = (digits % 10) as u8;
        *slot = Mode::from_digit(digit).ok_or(Fault::InvalidMode { pc, mode: digit })?;
        digits /= 10;
    }

    Ok(Instruction { opcode, modes })
}

/// An instruction argument: an addressing mode paired with its literal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Argument {
    Position(i64),
    Immediate(i64),
    Relative(i64),
}

impl Argument {
    pub fn new(mode: Mode, literal: i64) -> Self {
        match mode {
            Mode::Position => Self::Position(literal),
            Mode::Immediate => Self::Immediate(literal),
            Mode::Relative => Self::Relative(literal),
        }
    }

    /// The cell this argument names. Immediate arguments have none.
    pub fn address(self, rb: i64) -> Result<u64, Fault> {
        // i128 holds the sum of any two i64 values.
        let effective = match self {
            Self::Position(literal) => literal as i128,
            Self::Relative(literal) => literal as i128 + rb as i128,
            Self::Immediate(_) => return Err(Fault::ImmediateAddress),
        };
        u64::try_from(effective).map_err(|_| Fault::NegativeAddress {
            address: i64::try_from(effective).unwrap_or(i64::MIN),
        })
    }

    /// The value this argument denotes.
    pub fn value(self, memory: &Memory, rb: i64) -> Result<i64, Fault> {
        match self {
            Self::Immediate(literal) => Ok(literal),
            _ => Ok(memory.get(self.address(rb)?)),
        }
    }
}
