use std::collections::VecDeque;
use std::error::Error;
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand, ValueEnum};
use intcode::disasm::disassemble;
use intcode::image;
use intcode::pipeline::{PipelineConfig, Topology, best_phase_setting};
use intcode::{FnIo, Machine, Memory, RunOutcome};
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "intcode", about = "Decimal-instruction virtual machine")]
struct Cli {
    /// Raise log verbosity (-v debug, -vv per-instruction trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a program, printing each output value on its own line.
    Run {
        /// File holding the comma-separated program image.
        program: PathBuf,

        /// Input values, consumed in order.
        #[arg(long, value_delimiter = ',', allow_hyphen_values = true)]
        input: Vec<i64>,

        /// Read further input values from stdin, one per line, once
        /// `--input` is used up.
        #[arg(long)]
        interactive: bool,

        /// Overwrite a memory cell before running (e.g. `0=2`). Repeatable.
        #[arg(long = "poke", value_parser = parse_poke)]
        pokes: Vec<(u64, i64)>,

        /// Stop after this many instructions.
        #[arg(long)]
        step_limit: Option<u64>,

        /// After the run, print memory cells `0..N` as an image. N is capped at
        /// the highest address the program touched.
        #[arg(long)]
        dump: Option<u64>,
    },

    /// Print a listing of a program image.
    Disasm {
        program: PathBuf,
    },

    /// Search every ordering of phase settings for the strongest signal.
    Amplify {
        program: PathBuf,

        /// Phase settings to permute.
        #[arg(long, value_delimiter = ',', default_value = "0,1,2,3,4", allow_hyphen_values = true)]
        phases: Vec<i64>,

        /// Value fed to the first stage after its phase.
        #[arg(long, default_value_t = 0, allow_hyphen_values = true)]
        seed: i64,

        /// How the stages are wired.
        #[arg(long, value_enum, default_value_t = TopologyArg::Chain)]
        topology: TopologyArg,

        /// Max instructions per stage.
        #[arg(long, default_value_t = 1 << 24)]
        step_limit: u64,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum TopologyArg {
    Chain,
    Feedback,
    Threaded,
}

impl From<TopologyArg> for Topology {
    fn from(arg: TopologyArg) -> Self {
        match arg {
            TopologyArg::Chain => Topology::Chain,
            TopologyArg::Feedback => Topology::Feedback,
            TopologyArg::Threaded => Topology::Threaded,
        }
    }
}

/// Parse an "ADDR=VALUE" memory patch.
fn parse_poke(s: &str) -> Result<(u64, i64), String> {
    let (addr, value) = s
        .split_once('=')
        .ok_or_else(|| format!("Invalid poke '{s}', expected ADDR=VALUE (e.g. 0=2)"))?;
    let addr = addr.trim().parse::<u64>().map_err(|e| format!("Invalid poke address: {e}"))?;
    let value = value.trim().parse::<i64>().map_err(|e| format!("Invalid poke value: {e}"))?;
    Ok((addr, value))
}

fn init_logging(verbose: u8) {
    let filter = match verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        1 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let result = match cli.command {
        Command::Run {
            program,
            input,
            interactive,
            pokes,
            step_limit,
            dump,
        } => run(&program, input, interactive, &pokes, step_limit, dump),
        Command::Disasm { program } => disasm(&program),
        Command::Amplify {
            program,
            phases,
            seed,
            topology,
            step_limit,
        } => amplify(&program, &phases, seed, topology.into(), step_limit),
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e}");
            let mut source = e.source();
            while let Some(cause) = source {
                eprintln!("  caused by: {cause}");
                source = cause.source();
            }
            ExitCode::FAILURE
        }
    }
}

/// Next integer from stdin, skipping lines that do not parse. `None` at EOF.
fn read_stdin_value() -> Option<i64> {
    let stdin = std::io::stdin();
    let mut line = String::new();
    loop {
        line.clear();
        match stdin.lock().read_line(&mut line) {
            Ok(0) | Err(_) => return None,
            Ok(_) => match line.trim().parse::<i64>() {
                Ok(value) => return Some(value),
                Err(e) => warn!(line = line.trim(), %e, "ignoring non-integer input"),
            },
        }
    }
}

fn run(
    program: &Path,
    input: Vec<i64>,
    interactive: bool,
    pokes: &[(u64, i64)],
    step_limit: Option<u64>,
    dump: Option<u64>,
) -> Result<ExitCode, Box<dyn Error>> {
    let img = image::load(program)?;

    let mut queued: VecDeque<i64> = input.into();
    let io = FnIo::new(
        || {
            queued
                .pop_front()
                .or_else(|| if interactive { read_stdin_value() } else { None })
        },
        |value| println!("{value}"),
    );

    let mut machine = Machine::new(&img, io);
    for &(addr, value) in pokes {
        machine.poke(addr, value);
    }

    let outcome = match step_limit {
        Some(limit) => machine.run_bounded(limit),
        None => machine.run(),
    };

    if let Some(len) = dump {
        println!("{}", image::format(&self::dump(machine.memory(), len)));
    }

    let steps = machine.steps();
    match outcome {
        RunOutcome::Halted => {
            eprintln!("halted after {steps} steps");
            Ok(ExitCode::SUCCESS)
        }
        RunOutcome::Suspended => {
            eprintln!("suspended at pc {} waiting for input after {steps} steps", machine.pc());
            Ok(ExitCode::from(2))
        }
        RunOutcome::StepLimit => {
            eprintln!("step limit reached at pc {} after {steps} steps", machine.pc());
            Ok(ExitCode::from(3))
        }
        RunOutcome::Faulted(fault) => Err(fault.into()),
    }
}

/// Cells `0..requested`, cut short at the end of what the program touched.
fn dump(memory: &Memory, requested: u64) -> Vec<i64> {
    let extent = memory.len_hint();
    if requested > extent {
        warn!(requested, extent, "dump truncated to touched memory");
    }
    memory.snapshot(requested.min(extent))
}

fn disasm(program: &Path) -> Result<ExitCode, Box<dyn Error>> {
    let img = image::load(program)?;
    print!("{}", disassemble(&img));
    Ok(ExitCode::SUCCESS)
}

fn amplify(
    program: &Path,
    phases: &[i64],
    seed: i64,
    topology: Topology,
    step_limit: u64,
) -> Result<ExitCode, Box<dyn Error>> {
    let img = image::load(program)?;
    let config = PipelineConfig {
        step_limit,
        ..PipelineConfig::default()
    };

    let start = std::time::Instant::now();
    let (order, signal) = best_phase_setting(&img, phases, seed, topology, &config)?;
    let elapsed = start.elapsed();

    let order: Vec<String> = order.iter().map(ToString::to_string).collect();
    println!("{signal}");
    eprintln!("best phase setting: {}", order.join(","));
    eprintln!("elapsed:            {elapsed:.2?}");
    Ok(ExitCode::SUCCESS)
}
