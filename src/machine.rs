use tracing::{debug, trace, warn};

use crate::decode::{Argument, Instruction, MAX_ARITY, Opcode, decode};
use crate::fault::Fault;
use crate::io::{Io, QueueIo};
use crate::memory::Memory;

/// How a call to [`Machine::run`] ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunOutcome {
    /// Opcode 99 executed. Running again returns `Halted` immediately.
    Halted,
    /// An input instruction found no value. State is unchanged, and the next
    /// run retries the same instruction.
    Suspended,
    /// A bounded run used its whole budget.
    StepLimit,
    /// The run ended in a fatal fault.
    Faulted(Fault),
}

impl RunOutcome {
    pub fn fault(self) -> Option<Fault> {
        match self {
            Self::Faulted(fault) => Some(fault),
            _ => None,
        }
    }
}

/// Result of executing a single instruction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Step {
    Continue,
    Halted,
    Suspended,
    Faulted(Fault),
}

/// A single virtual machine: memory, registers, and the I/O it was built with.
///
/// State:
/// - `pc`: address of the next instruction word, starts at 0
/// - `rb`: relative base, starts at 0, moved only by opcode 9
/// - `halted`: set by opcode 99
///
/// The machine owns its memory for its whole life. Nothing is shared with
/// other machines except through the `Io` implementation.
#[derive(Debug)]
pub struct Machine<I = QueueIo> {
    memory: Memory,
    pc: u64,
    rb: i64,
    halted: bool,
    fault: Option<Fault>,
    steps: u64,
    io: I,
}

impl Machine<QueueIo> {
    /// A machine with a queue preloaded with `input`.
    pub fn with_input(image: &[i64], input: impl IntoIterator<Item = i64>) -> Self {
        Self::new(image, QueueIo::with_input(input))
    }
}

impl<I: Io> Machine<I> {
    pub fn new(image: &[i64], io: I) -> Self {
        Self::from_memory(Memory::new(image), io)
    }

    pub fn from_memory(memory: Memory, io: I) -> Self {
        Self {
            memory,
            pc: 0,
            rb: 0,
            halted: false,
            fault: None,
            steps: 0,
            io,
        }
    }

    pub fn pc(&self) -> u64 {
        self.pc
    }

    pub fn relative_base(&self) -> i64 {
        self.rb
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    /// The fault that ended the run, if any.
    pub fn fault(&self) -> Option<Fault> {
        self.fault
    }

    /// Instructions executed so far, including the halt.
    pub fn steps(&self) -> u64 {
        self.steps
    }

    pub fn memory(&self) -> &Memory {
        &self.memory
    }

    pub fn io(&self) -> &I {
        &self.io
    }

    pub fn io_mut(&mut self) -> &mut I {
        &mut self.io
    }

    pub fn into_io(self) -> I {
        self.io
    }

    pub fn peek(&self, address: u64) -> i64 {
        self.memory.get(address)
    }

    /// Overwrite a memory cell, e.g. to patch address 0 before running.
    pub fn poke(&mut self, address: u64, value: i64) {
        self.memory.set(address, value);
    }

    /// Run until the machine halts, faults or starves for input.
    pub fn run(&mut self) -> RunOutcome {
        loop {
            match self.step() {
                Step::Continue => {}
                Step::Halted => return RunOutcome::Halted,
                Step::Suspended => return RunOutcome::Suspended,
                Step::Faulted(fault) => return RunOutcome::Faulted(fault),
            }
        }
    }

    /// Like [`run`](Self::run), but give up after `step_limit` instructions.
    pub fn run_bounded(&mut self, step_limit: u64) -> RunOutcome {
        let mut executed = 0;
        loop {
            // A finished machine reports how it finished, even with no budget.
            if self.halted {
                return RunOutcome::Halted;
            }
            if let Some(fault) = self.fault {
                return RunOutcome::Faulted(fault);
            }
            if executed >= step_limit {
                return RunOutcome::StepLimit;
            }
            executed += 1;
            match self.step() {
                Step::Continue | Step::Halted | Step::Faulted(_) => {}
                Step::Suspended => return RunOutcome::Suspended,
            }
        }
    }

    /// Fetch, decode and execute one instruction.
    pub fn step(&mut self) -> Step {
        if self.halted {
            return Step::Halted;
        }
        if let Some(fault) = self.fault {
            return Step::Faulted(fault);
        }

        match self.execute() {
            Ok(Step::Suspended) => {
                debug!(pc = self.pc, "suspended waiting for input");
                Step::Suspended
            }
            Ok(step) => {
                self.steps += 1;
                if step == Step::Halted {
                    debug!(pc = self.pc, steps = self.steps, "halted");
                }
                step
            }
            Err(fault) => {
                warn!(pc = self.pc, %fault, "machine faulted");
                self.fault = Some(fault);
                Step::Faulted(fault)
            }
        }
    }

    /// Every argument is resolved before anything is committed, so an
    /// instruction that faults or starves leaves no trace.
    fn execute(&mut self) -> Result<Step, Fault> {
        let pc = self.pc;
        let inst = decode(self.memory.get(pc), pc)?;
        trace!(pc, opcode = ?inst.opcode, rb = self.rb, "execute");

        let args = self.arguments(&inst);
        let next = pc.saturating_add(1 + inst.opcode.arity() as u64);

        match inst.opcode {
            Opcode::Add => {
                let (a, b, dst) = self.operands(&inst, &args)?;
                let sum = a.checked_add(b).ok_or(Fault::Overflow { pc })?;
                self.memory.set(dst, sum);
            }
            Opcode::Mul => {
                let (a, b, dst) = self.operands(&inst, &args)?;
                let product = a.checked_mul(b).ok_or(Fault::Overflow { pc })?;
                self.memory.set(dst, product);
            }
            Opcode::LessThan => {
                let (a, b, dst) = self.operands(&inst, &args)?;
                self.memory.set(dst, (a < b) as i64);
            }
            Opcode::Equals => {
                let (a, b, dst) = self.operands(&inst, &args)?;
                self.memory.set(dst, (a == b) as i64);
            }
            Opcode::Input => {
                let dst = self.write_target(&inst, args[0])?;
                match self.io.consume_input() {
                    Some(value) => self.memory.set(dst, value),
                    None => return Ok(Step::Suspended),
                }
            }
            Opcode::Output => {
                let value = self.value(args[0])?;
                self.io.emit_output(value);
            }
            Opcode::JumpIfTrue | Opcode::JumpIfFalse => {
                let cond = self.value(args[0])?;
                let target = self.value(args[1])?;
                if (cond != 0) == (inst.opcode == Opcode::JumpIfTrue) {
                    self.pc = u64::try_from(target)
                        .map_err(|_| Fault::NegativeAddress { address: target })?;
                    return Ok(Step::Continue);
                }
            }
            Opcode::AdjustBase => {
                let delta = self.value(args[0])?;
                self.rb = self.rb.checked_add(delta).ok_or(Fault::Overflow { pc })?;
            }
            Opcode::Halt => {
                self.halted = true;
                return Ok(Step::Halted);
            }
        }

        self.pc = next;
        Ok(Step::Continue)
    }

    fn arguments(&self, inst: &Instruction) -> [Argument; MAX_ARITY] {
        let mut args = [Argument::Immediate(0); MAX_ARITY];
        for (k, arg) in args.iter_mut().enumerate().take(inst.opcode.arity()) {
            let literal = self.memory.get(self.pc.saturating_add(1 + k as u64));
            *arg = Argument::new(inst.mode(k), literal);
        }
        args
    }

    fn value(&self, arg: Argument) -> Result<i64, Fault> {
        arg.value(&self.memory, self.rb)
    }

    fn write_target(&self, inst: &Instruction, arg: Argument) -> Result<u64, Fault> {
        arg.address(self.rb).map_err(|fault| match fault {
            Fault::ImmediateAddress => Fault::InvalidWriteTarget {
                pc: self.pc,
                opcode: inst.opcode,
            },
            other => other,
        })
    }

    /// Two input values and the write address of a three-argument instruction.
    fn operands(
        &self,
        inst: &Instruction,
        args: &[Argument; MAX_ARITY],
    ) -> Result<(i64, i64, u64), Fault> {
        let a = self.value(args[0])?;
        let b = self.value(args[1])?;
        let dst = self.write_target(inst, args[2])?;
        Ok((a, b, dst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_with(image: &[i64], input: &[i64]) -> (RunOutcome, Vec<i64>) {
        let mut m = Machine::with_input(image, input.iter().copied());
        let outcome = m.run();
        (outcome, m.io_mut().take_output())
    }

    #[test]
    fn test_self_modifying_add() {
        let mut m = Machine::with_input(&[1, 0, 0, 0, 99], []);
        assert_eq!(m.run(), RunOutcome::Halted);
        assert_eq!(m.memory().snapshot(5), vec![2, 0, 0, 0, 99]);
    }

    #[test]
    fn test_multiply_into_later_cell() {
        let mut m = Machine::with_input(&[2, 4, 4, 5, 99, 0], []);
        assert_eq!(m.run(), RunOutcome::Halted);
        assert_eq!(m.memory().snapshot(6), vec![2, 4, 4, 5, 99, 9801]);
    }

    #[test]
    fn test_program_rewrites_its_own_halt() {
        // The first add turns the halt at address 4 into a multiply.
        let mut m = Machine::with_input(&[1, 1, 1, 4, 99, 5, 6, 0, 99], []);
        assert_eq!(m.run(), RunOutcome::Halted);
        assert_eq!(m.memory().snapshot(9), vec![30, 1, 1, 4, 2, 5, 6, 0, 99]);
    }

    #[test]
    fn test_mixed_mode_multiply() {
        let mut m = Machine::with_input(&[1002, 4, 3, 4, 33], []);
        assert_eq!(m.run(), RunOutcome::Halted);
        assert_eq!(m.peek(4), 99);
    }

    #[test]
    fn test_negative_immediate() {
        let mut m = Machine::with_input(&[1101, 100, -1, 4, 0], []);
        assert_eq!(m.run(), RunOutcome::Halted);
        assert_eq!(m.peek(4), 99);
    }

    #[test]
    fn test_large_multiply_is_exact() {
        let (outcome, out) = run_with(&[1102, 34463338, 34463338, 7, 4, 7, 99, 0], &[]);
        assert_eq!(outcome, RunOutcome::Halted);
        assert_eq!(out, vec![1187721666102244]);
    }

    #[test]
    fn test_large_literal_output() {
        let (_, out) = run_with(&[104, 1125899906842624, 99], &[]);
        assert_eq!(out, vec![1125899906842624]);
    }

    #[test]
    fn test_echo() {
        let (outcome, out) = run_with(&[3, 0, 4, 0, 99], &[7]);
        assert_eq!(outcome, RunOutcome::Halted);
        assert_eq!(out, vec![7]);
    }

    #[test]
    fn test_equals_position_mode() {
        let image = [3, 9, 8, 9, 10, 9, 4, 9, 99, -1, 8];
        assert_eq!(run_with(&image, &[8]).1, vec![1]);
        assert_eq!(run_with(&image, &[5]).1, vec![0]);
    }

    #[test]
    fn test_less_than_immediate_mode() {
        let image = [3, 3, 1107, -1, 8, 3, 4, 3, 99];
        assert_eq!(run_with(&image, &[7]).1, vec![1]);
        assert_eq!(run_with(&image, &[8]).1, vec![0]);
    }

    #[test]
    fn test_jumps() {
        let position = [3, 12, 6, 12, 15, 1, 13, 14, 13, 4, 13, 99, -1, 0, 1, 9];
        assert_eq!(run_with(&position, &[0]).1, vec![0]);
        assert_eq!(run_with(&position, &[5]).1, vec![1]);

        let immediate = [3, 3, 1105, -1, 9, 1101, 0, 0, 12, 4, 12, 99, 1];
        assert_eq!(run_with(&immediate, &[0]).1, vec![0]);
        assert_eq!(run_with(&immediate, &[-3]).1, vec![1]);
    }

    #[test]
    fn test_compare_to_eight() {
        let image = [
            3, 21, 1008, 21, 8, 20, 1005, 20, 22, 107, 8, 21, 20, 1006, 20, 31, 1106, 0, 36, 98,
            0, 0, 1002, 21, 125, 20, 4, 20, 1105, 1, 46, 104, 999, 1105, 1, 46, 1101, 1000, 1, 20,
            4, 20, 1105, 1, 46, 98, 99,
        ];
        assert_eq!(run_with(&image, &[7]).1, vec![999]);
        assert_eq!(run_with(&image, &[8]).1, vec![1000]);
        assert_eq!(run_with(&image, &[9]).1, vec![1001]);
    }

    #[test]
    fn test_quine() {
        let image = [
            109, 1, 204, -1, 1001, 100, 1, 100, 1008, 100, 16, 101, 1006, 101, 0, 99,
        ];
        let (outcome, out) = run_with(&image, &[]);
        assert_eq!(outcome, RunOutcome::Halted);
        assert_eq!(out, image.to_vec());
    }

    #[test]
    fn test_relative_base_round_trip() {
        let image = [
            109, 100, // rb += 100
            21101, 7, 8, 0, // [rb + 0] = 7 + 8
            109, -100, // rb -= 100
            4, 100, // output [100]
            99,
        ];
        let mut m = Machine::with_input(&image, []);
        assert_eq!(m.run(), RunOutcome::Halted);
        assert_eq!(m.relative_base(), 0);
        assert_eq!(m.peek(100), 15);
        assert_eq!(m.io_mut().take_output(), vec![15]);
    }

    #[test]
    fn test_relative_input() {
        let image = [109, 50, 203, 3, 4, 53, 99];
        let (outcome, out) = run_with(&image, &[-42]);
        assert_eq!(outcome, RunOutcome::Halted);
        assert_eq!(out, vec![-42]);
    }

    #[test]
    fn test_nothing_after_halt_executes() {
        let (outcome, out) = run_with(&[99, 4, 0, 4, 0], &[]);
        assert_eq!(outcome, RunOutcome::Halted);
        assert!(out.is_empty());
    }

    #[test]
    fn test_halted_is_sticky() {
        let mut m = Machine::with_input(&[104, 1, 99], []);
        assert_eq!(m.run(), RunOutcome::Halted);
        let steps = m.steps();
        assert_eq!(m.run(), RunOutcome::Halted);
        assert_eq!(m.steps(), steps);
        assert_eq!(m.io_mut().take_output(), vec![1]);
        assert!(m.is_halted());
    }

    #[test]
    fn test_immediate_write_target_faults_without_writing() {
        // ADD with its destination in immediate mode.
        let image = [10001, 5, 6, 0, 99, 3, 4];
        let mut m = Machine::with_input(&image, []);
        let outcome = m.run();
        assert_eq!(
            outcome,
            RunOutcome::Faulted(Fault::InvalidWriteTarget {
                pc: 0,
                opcode: Opcode::Add
            })
        );
        assert_eq!(m.memory().snapshot(7), image.to_vec());
        assert_eq!(m.pc(), 0);
        assert!(!m.is_halted());
    }

    #[test]
    fn test_immediate_input_target_faults_without_consuming() {
        let mut m = Machine::with_input(&[103, 5, 99], [1]);
        assert_eq!(
            m.run(),
            RunOutcome::Faulted(Fault::InvalidWriteTarget {
                pc: 0,
                opcode: Opcode::Input
            })
        );
        assert_eq!(m.io().pending_input(), 1);
    }

    #[test]
    fn test_unknown_opcode_faults() {
        let mut m = Machine::with_input(&[1101, 1, 1, 5, 42, 0], []);
        assert_eq!(
            m.run(),
            RunOutcome::Faulted(Fault::Decode { pc: 4, word: 42 })
        );
        assert_eq!(m.fault(), Some(Fault::Decode { pc: 4, word: 42 }));
        // Faults are terminal.
        assert_eq!(m.run().fault(), Some(Fault::Decode { pc: 4, word: 42 }));
    }

    #[test]
    fn test_falls_off_image_into_zero() {
        // After the add, pc lands on a zero word, which is not an opcode.
        let mut m = Machine::with_input(&[1101, 1, 1, 7, 0], []);
        assert_eq!(m.run(), RunOutcome::Faulted(Fault::Decode { pc: 4, word: 0 }));
    }

    #[test]
    fn test_overflow_faults_without_writing() {
        let image = [1102, i64::MAX, 2, 5, 99, 0];
        let mut m = Machine::with_input(&image, []);
        assert_eq!(m.run(), RunOutcome::Faulted(Fault::Overflow { pc: 0 }));
        assert_eq!(m.peek(5), 0);
    }

    #[test]
    fn test_negative_jump_target_faults() {
        let mut m = Machine::with_input(&[1105, 1, -4, 99], []);
        assert_eq!(
            m.run(),
            RunOutcome::Faulted(Fault::NegativeAddress { address: -4 })
        );
        assert_eq!(m.pc(), 0);
    }

    #[test]
    fn test_negative_relative_address_faults() {
        let mut m = Machine::with_input(&[204, -1, 99], []);
        assert_eq!(
            m.run(),
            RunOutcome::Faulted(Fault::NegativeAddress { address: -1 })
        );
        assert!(m.io().output().is_empty());
    }

    #[test]
    fn test_starvation_suspends_and_resumes() {
        // Read two values, output their sum.
        let image = [3, 11, 3, 12, 1, 11, 12, 13, 4, 13, 99, 0, 0, 0];
        let mut m = Machine::with_input(&image, [4]);
        assert_eq!(m.run(), RunOutcome::Suspended);
        assert_eq!(m.pc(), 2);
        assert_eq!(m.peek(11), 4);
        let steps = m.steps();

        // Starving again changes nothing.
        assert_eq!(m.run(), RunOutcome::Suspended);
        assert_eq!(m.pc(), 2);
        assert_eq!(m.steps(), steps);

        m.io_mut().push_input(5);
        assert_eq!(m.run(), RunOutcome::Halted);
        assert_eq!(m.peek(11), 4);
        assert_eq!(m.io_mut().take_output(), vec![9]);
    }

    #[test]
    fn test_poke_before_run() {
        let mut m = Machine::with_input(&[1, 0, 0, 0, 99], []);
        m.poke(1, 4);
        m.poke(2, 4);
        assert_eq!(m.run(), RunOutcome::Halted);
        assert_eq!(m.peek(0), 198);
    }

    #[test]
    fn test_run_bounded_stops_infinite_loop() {
        let mut m = Machine::with_input(&[1105, 1, 0], []);
        assert_eq!(m.run_bounded(50), RunOutcome::StepLimit);
        assert_eq!(m.steps(), 50);
        assert_eq!(m.run_bounded(0), RunOutcome::StepLimit);
    }

    #[test]
    fn test_run_bounded_reports_halt() {
        let mut m = Machine::with_input(&[104, 3, 99], []);
        assert_eq!(m.run_bounded(2), RunOutcome::Halted);
        assert_eq!(m.run_bounded(0), RunOutcome::Halted);
        assert_eq!(m.steps(), 2);
    }

    #[test]
    fn test_step_by_step() {
        let mut m = Machine::with_input(&[1101, 2, 3, 0, 99], []);
        assert_eq!(m.step(), Step::Continue);
        assert_eq!(m.pc(), 4);
        assert_eq!(m.peek(0), 5);
        assert_eq!(m.step(), Step::Halted);
        assert_eq!(m.step(), Step::Halted);
    }

    #[test]
    fn test_environment_io() {
        use crate::io::FnIo;
        use std::cell::RefCell;

        // Emit triples; the environment counts tiles of kind 2.
        let image = [104, 0, 104, 0, 104, 2, 104, 1, 104, 0, 104, 2, 104, 2, 104, 0, 104, 1, 99];
        let pending = RefCell::new(Vec::new());
        let blocks = RefCell::new(0);
        let io = FnIo::new(
            || None,
            |v| {
                let mut p = pending.borrow_mut();
                p.push(v);
                if p.len() == 3 {
                    if p[2] == 2 {
                        *blocks.borrow_mut() += 1;
                    }
                    p.clear();
                }
            },
        );
        let mut m = Machine::new(&image, io);
        assert_eq!(m.run(), RunOutcome::Halted);
        drop(m);
        assert_eq!(blocks.into_inner(), 2);
    }

    #[test]
    fn test_agent_io_reacts_to_output() {
        use crate::io::FnIo;
        use std::cell::RefCell;

        // Read n, emit n + 1, forever. The agent answers with whatever it
        // last saw and falls silent once that reaches 5.
        let image = [3, 20, 1001, 20, 1, 20, 4, 20, 1105, 1, 0];
        let last = RefCell::new(None);
        let seen = RefCell::new(Vec::new());
        let io = FnIo::new(
            || match *last.borrow() {
                None => Some(0),
                Some(v) if v < 5 => Some(v),
                Some(_) => None,
            },
            |v| {
                *last.borrow_mut() = Some(v);
                seen.borrow_mut().push(v);
            },
        );
        let mut m = Machine::new(&image, io);
        assert_eq!(m.run(), RunOutcome::Suspended);
        assert_eq!(m.pc(), 0);
        drop(m);
        assert_eq!(seen.into_inner(), vec![1, 2, 3, 4, 5]);
    }
}
