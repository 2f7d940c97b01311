use std::collections::VecDeque;
use std::iter;
use std::sync::Arc;
use std::sync::mpsc::{Receiver, RecvTimeoutError, SyncSender, TrySendError, sync_channel};
use std::thread;
use std::time::Duration;

use rayon::prelude::*;
use thiserror::Error;
use tracing::{debug, info};

use crate::fault::Fault;
use crate::io::{ChannelIo, ChannelLedger};
use crate::machine::{Machine, RunOutcome};

/// Why a multi-machine run did not produce a result.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum PipelineError {
    #[error("no phase settings given")]
    EmptyPhases,

    #[error("stage {stage} faulted: {fault}")]
    Fault {
        stage: usize,
        #[source]
        fault: Fault,
    },

    /// A stage wanted input that its upstream will never produce.
    #[error("stage {stage} starved for input")]
    StageStarved { stage: usize },

    /// Every unfinished stage is waiting on another unfinished stage.
    #[error("deadlock: every running stage is waiting for input")]
    Deadlock,

    #[error("stage {stage} exceeded its step limit")]
    StepLimit { stage: usize },

    #[error("stage {stage} produced no output")]
    NoOutput { stage: usize },

    #[error("stage {stage} panicked")]
    Panicked { stage: usize },
}

/// Configuration shared by every topology.
#[derive(Clone, Copy, Debug)]
pub struct PipelineConfig {
    /// Maximum instructions any single stage may execute.
    pub step_limit: u64,
    /// Capacity of each bounded channel in the threaded topology. Zero gives
    /// rendezvous channels.
    pub channel_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            step_limit: 1 << 24,
            channel_capacity: 16,
        }
    }
}

/// How the stages of a phase-setting search are wired.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Topology {
    /// Feed-forward; see [`run_chain`].
    Chain,
    /// Cyclic, cooperatively scheduled; see [`run_feedback_loop`].
    Feedback,
    /// Cyclic, one thread per stage; see [`run_threaded_loop`].
    Threaded,
}

/// Map a stage's final outcome to the pipeline's view of it.
fn finished(stage: usize, outcome: RunOutcome) -> Result<(), PipelineError> {
    debug!(stage, ?outcome, "stage finished");
    match outcome {
        RunOutcome::Halted => Ok(()),
        RunOutcome::Suspended => Err(PipelineError::StageStarved { stage }),
        RunOutcome::StepLimit => Err(PipelineError::StepLimit { stage }),
        RunOutcome::Faulted(fault) => Err(PipelineError::Fault { stage, fault }),
    }
}

/// Run one machine per phase setting, each to completion before the next.
///
/// Stage `i` receives `phases[i]` followed by everything stage `i - 1`
/// emitted (stage 0 receives `seed`). Returns everything the last stage
/// emitted. Sufficient only for strictly feed-forward programs.
pub fn run_chain(
    image: &[i64],
    phases: &[i64],
    seed: i64,
    config: &PipelineConfig,
) -> Result<Vec<i64>, PipelineError> {
    if phases.is_empty() {
        return Err(PipelineError::EmptyPhases);
    }

    let mut signal = vec![seed];
    for (stage, &phase) in phases.iter().enumerate() {
        let mut machine = Machine::with_input(image, iter::once(phase).chain(signal));
        finished(stage, machine.run_bounded(config.step_limit))?;
        signal = machine.io_mut().take_output();
    }
    Ok(signal)
}

/// Run one machine per phase setting in a ring: stage `i` feeds stage
/// `(i + 1) % n`.
///
/// Each machine is a cooperative task. The scheduler visits stages in order,
/// runs each until it halts or starves, and moves its output onto the next
/// stage's FIFO queue. The loop ends when every stage has halted. A full
/// round in which no stage executes anything is a deadlock.
///
/// Returns everything the last stage emitted over the whole run.
pub fn run_feedback_loop(
    image: &[i64],
    phases: &[i64],
    seed: i64,
    config: &PipelineConfig,
) -> Result<Vec<i64>, PipelineError> {
    if phases.is_empty() {
        return Err(PipelineError::EmptyPhases);
    }

    let n = phases.len();
    let mut stages: Vec<Machine> = phases
        .iter()
        .map(|&phase| Machine::with_input(image, [phase]))
        .collect();
    stages[0].io_mut().push_input(seed);

    let mut tail = Vec::new();
    let mut rounds = 0u64;
    loop {
        rounds += 1;
        let mut progressed = false;
        let mut all_halted = true;

        for stage in 0..n {
            let before = stages[stage].steps();
            let budget = config.step_limit.saturating_sub(before);
            let outcome = stages[stage].run_bounded(budget);
            progressed |= stages[stage].steps() != before;

            let emitted = stages[stage].io_mut().take_output();
            if stage == n - 1 {
                tail.extend_from_slice(&emitted);
            }
            stages[(stage + 1) % n].io_mut().extend_input(emitted);

            match outcome {
                RunOutcome::Halted => {}
                RunOutcome::Suspended => all_halted = false,
                other => finished(stage, other)?,
            }
        }

        if all_halted {
            debug!(rounds, "feedback loop halted");
            return Ok(tail);
        }
        if !progressed {
            return Err(PipelineError::Deadlock);
        }
    }
}

/// How long the relay waits on the last stage before retrying stage 0.
const RELAY_POLL: Duration = Duration::from_millis(1);

/// The same ring as [`run_feedback_loop`], with one OS thread per stage
/// connected by bounded channels.
///
/// The calling thread sits between the last stage and the first: it records
/// each value the last stage emits and forwards it to stage 0 through an
/// unbounded backlog, so a stage that emits more than the channel capacity
/// before reading never wedges the ring. A [`ChannelLedger`] shared by every
/// stage notices when all unfinished stages wait for input with nothing in
/// flight; the run then ends with [`PipelineError::Deadlock`].
pub fn run_threaded_loop(
    image: &[i64],
    phases: &[i64],
    seed: i64,
    config: &PipelineConfig,
) -> Result<Vec<i64>, PipelineError> {
    if phases.is_empty() {
        return Err(PipelineError::EmptyPhases);
    }

    let n = phases.len();
    let step_limit = config.step_limit;
    let ledger = Arc::new(ChannelLedger::new(n));

    let (senders, inputs): (Vec<SyncSender<i64>>, Vec<Receiver<i64>>) = (0..n)
        .map(|_| sync_channel(config.channel_capacity))
        .unzip();
    let (tap_tx, tap_rx) = sync_channel(config.channel_capacity);

    // Stage i writes to stage i + 1 and the last stage to the tap. Only stage
    // 0's sender stays with the caller, so a finished stage disconnects its
    // neighbour.
    let mut senders = senders.into_iter();
    let head = senders.next().ok_or(PipelineError::EmptyPhases)?;
    let outputs: Vec<SyncSender<i64>> = senders.chain(iter::once(tap_tx)).collect();

    // The seed counts as in flight before any stage can look for it.
    ledger.sent(0);

    thread::scope(|scope| {
        let handles: Vec<_> = inputs
            .into_iter()
            .zip(outputs)
            .zip(phases)
            .enumerate()
            .map(|(stage, ((rx, tx), &phase))| {
                let io = ChannelIo::new(rx, tx)
                    .with_preload([phase])
                    .tracked(Arc::clone(&ledger), stage, (stage + 1) % n);
                let ledger = Arc::clone(&ledger);
                scope.spawn(move || {
                    let mut machine = Machine::new(image, io);
                    let outcome = machine.run_bounded(step_limit);
                    ledger.finish(stage);
                    outcome
                })
            })
            .collect();

        let tail = relay(&tap_rx, &head, seed, &ledger);
        drop(head);

        let outcomes: Vec<Result<RunOutcome, PipelineError>> = handles
            .into_iter()
            .enumerate()
            .map(|(stage, handle)| handle.join().map_err(|_| PipelineError::Panicked { stage }))
            .collect();

        // A stage that stopped early explains any stall around it, so report
        // that first.
        let mut first_error = None;
        for (stage, outcome) in outcomes.into_iter().enumerate() {
            let result = outcome.and_then(|outcome| finished(stage, outcome));
            match result {
                Err(
                    err @ (PipelineError::Fault { .. }
                    | PipelineError::StepLimit { .. }
                    | PipelineError::Panicked { .. }),
                ) => {
                    return Err(err);
                }
                Err(err) => {
                    first_error.get_or_insert(err);
                }
                Ok(()) => {}
            }
        }
        if ledger.is_stalled() {
            return Err(PipelineError::Deadlock);
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(tail),
        }
    })
}

/// Carry the last stage's output back to stage 0, starting with `seed`.
///
/// Returns everything the last stage emitted. Values stage 0 can no longer
/// take are withdrawn from the ledger.
fn relay(
    tap: &Receiver<i64>,
    head: &SyncSender<i64>,
    seed: i64,
    ledger: &ChannelLedger,
) -> Vec<i64> {
    let mut tail = Vec::new();
    let mut backlog = VecDeque::from([seed]);
    let mut tap_open = true;

    while tap_open || !backlog.is_empty() {
        while let Some(&value) = backlog.front() {
            match head.try_send(value) {
                Ok(()) => {
                    backlog.pop_front();
                }
                Err(TrySendError::Full(_)) => break,
                Err(TrySendError::Disconnected(_)) => {
                    debug!(discarded = backlog.len(), "stage 0 finished before its input");
                    for _ in backlog.drain(..) {
                        ledger.unsent(0);
                    }
                }
            }
        }

        if tap_open {
            match tap.recv_timeout(RELAY_POLL) {
                Ok(value) => {
                    tail.push(value);
                    backlog.push_back(value);
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => tap_open = false,
            }
        } else if !backlog.is_empty() {
            thread::sleep(RELAY_POLL);
        }
    }
    tail
}

/// Run `phases` through `topology` and return the last value the final
/// stage emitted.
pub fn final_signal(
    image: &[i64],
    phases: &[i64],
    seed: i64,
    topology: Topology,
    config: &PipelineConfig,
) -> Result<i64, PipelineError> {
    let output = match topology {
        Topology::Chain => run_chain(image, phases, seed, config)?,
        Topology::Feedback => run_feedback_loop(image, phases, seed, config)?,
        Topology::Threaded => run_threaded_loop(image, phases, seed, config)?,
    };
    output.last().copied().ok_or(PipelineError::NoOutput {
        stage: phases.len().saturating_sub(1),
    })
}

/// Try every ordering of `phases` and return the one whose final signal is
/// largest, together with that signal. Orderings are evaluated in parallel.
pub fn best_phase_setting(
    image: &[i64],
    phases: &[i64],
    seed: i64,
    topology: Topology,
    config: &PipelineConfig,
) -> Result<(Vec<i64>, i64), PipelineError> {
    if phases.is_empty() {
        return Err(PipelineError::EmptyPhases);
    }

    let candidates = permutations(phases);
    info!(count = candidates.len(), ?topology, "searching phase settings");

    let scored: Vec<(Vec<i64>, i64)> = candidates
        .into_par_iter()
        .map(|order| -> Result<(Vec<i64>, i64), PipelineError> {
            let signal = final_signal(image, &order, seed, topology, config)?;
            Ok((order, signal))
        })
        .collect::<Result<_, PipelineError>>()?;

    scored
        .into_iter()
        .max_by_key(|&(_, signal)| signal)
        .ok_or(PipelineError::EmptyPhases)
}

/// Every ordering of `items`, in lexicographic order of positions.
fn permutations(items: &[i64]) -> Vec<Vec<i64>> {
    if items.len() <= 1 {
        return vec![items.to_vec()];
    }
    let mut out = Vec::new();
    for i in 0..items.len() {
        let mut rest = items.to_vec();
        let head = rest.remove(i);
        for mut tail in permutations(&rest) {
            tail.insert(0, head);
            out.push(tail);
        }
    }
    out
}
