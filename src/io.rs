use std::collections::VecDeque;
use std::sync::mpsc::{Receiver, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use tracing::warn;

/// The boundary between a machine and whatever it talks to.
///
/// The engine only ever asks for the next input value and hands over output
/// values. Implementations decide where those come from and go to: a queue,
/// another machine, a simulated display, an agent deciding the next move.
pub trait Io {
    /// Take the next input value, or `None` if none is available yet.
    ///
    /// Returning `None` suspends the machine at the input instruction. The
    /// instruction is retried on the next run, so an implementation must not
    /// consume anything when it returns `None`.
    fn consume_input(&mut self) -> Option<i64>;

    /// Accept one emitted value.
    fn emit_output(&mut self, value: i64);
}

impl<T: Io + ?Sized> Io for &mut T {
    fn consume_input(&mut self) -> Option<i64> {
        (**self).consume_input()
    }

    fn emit_output(&mut self, value: i64) {
        (**self).emit_output(value)
    }
}

/// In-memory FIFO queues for both directions.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct QueueIo {
    input: VecDeque<i64>,
    output: VecDeque<i64>,
}

impl QueueIo {
    pub fn new() -> Self {
        Self::default()
    }

    /// A queue preloaded with `input`.
    pub fn with_input(input: impl IntoIterator<Item = i64>) -> Self {
        Self {
            input: input.into_iter().collect(),
            output: VecDeque::new(),
        }
    }

    pub fn push_input(&mut self, value: i64) {
        self.input.push_back(value);
    }

    pub fn extend_input(&mut self, values: impl IntoIterator<Item = i64>) {
        self.input.extend(values);
    }

    /// Input values not yet consumed.
    pub fn pending_input(&self) -> usize {
        self.input.len()
    }

    /// Output produced so far, oldest first.
    pub fn output(&self) -> &VecDeque<i64> {
        &self.output
    }

    pub fn pop_output(&mut self) -> Option<i64> {
        self.output.pop_front()
    }

    /// Drain every output value produced so far.
    pub fn take_output(&mut self) -> Vec<i64> {
        self.output.drain(..).collect()
    }
}

impl Io for QueueIo {
    fn consume_input(&mut self) -> Option<i64> {
        self.input.pop_front()
    }

    fn emit_output(&mut self, value: i64) {
        self.output.push_back(value);
    }
}

/// I/O backed by a pair of closures.
///
/// Suited to simulated environments: the output closure can buffer emitted
/// triples into a screen, the input closure can compute the next move from
/// whatever it has seen so far (shared through a `RefCell` or similar).
pub struct FnIo<F, G> {
    input: F,
    output: G,
}

impl<F, G> FnIo<F, G>
where
    F: FnMut() -> Option<i64>,
    G: FnMut(i64),
{
    pub fn new(input: F, output: G) -> Self {
        Self { input, output }
    }
}

impl<F, G> Io for FnIo<F, G>
where
    F: FnMut() -> Option<i64>,
    G: FnMut(i64),
{
    fn consume_input(&mut self) -> Option<i64> {
        (self.input)()
    }

    fn emit_output(&mut self, value: i64) {
        (self.output)(value)
    }
}

/// How often a tracked [`ChannelIo`] waiting for input rechecks its ledger.
const STALL_POLL: Duration = Duration::from_millis(1);

/// Bookkeeping shared by a group of machines wired together with
/// [`ChannelIo`], used to tell a stalled group from a busy one.
///
/// Each endpoint (one per machine) counts the values sent to it but not yet
/// received, and whether its machine is waiting for input or has finished.
/// The group is stalled once every unfinished machine waits on an endpoint
/// with nothing pending: no value is in flight and nobody is left to send one.
/// Stalled is sticky.
#[derive(Debug)]
pub struct ChannelLedger {
    state: Mutex<LedgerState>,
}

#[derive(Debug)]
struct LedgerState {
    pending: Vec<usize>,
    waiting: Vec<bool>,
    finished: Vec<bool>,
    stalled: bool,
}

impl ChannelLedger {
    pub fn new(endpoints: usize) -> Self {
        Self {
            state: Mutex::new(LedgerState {
                pending: vec![0; endpoints],
                waiting: vec![false; endpoints],
                finished: vec![false; endpoints],
                stalled: false,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, LedgerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a value on its way to endpoint `to`. Call before sending.
    pub fn sent(&self, to: usize) {
        if let Some(pending) = self.state().pending.get_mut(to) {
            *pending += 1;
        }
    }

    /// Withdraw a value recorded by [`sent`](Self::sent) that will never be
    /// received.
    pub fn unsent(&self, to: usize) {
        if let Some(pending) = self.state().pending.get_mut(to) {
            *pending = pending.saturating_sub(1);
        }
    }

    /// Mark the machine behind endpoint `at` as done for good.
    pub fn finish(&self, at: usize) {
        let mut state = self.state();
        if let Some(finished) = state.finished.get_mut(at) {
            *finished = true;
        }
        if let Some(waiting) = state.waiting.get_mut(at) {
            *waiting = false;
        }
    }

    pub fn is_stalled(&self) -> bool {
        self.state().stalled
    }

    fn set_waiting(&self, at: usize, waiting: bool) {
        if let Some(slot) = self.state().waiting.get_mut(at) {
            *slot = waiting;
        }
    }

    fn received(&self, at: usize) {
        let mut state = self.state();
        if let Some(pending) = state.pending.get_mut(at) {
            *pending = pending.saturating_sub(1);
        }
        if let Some(waiting) = state.waiting.get_mut(at) {
            *waiting = false;
        }
    }

    fn check_stalled(&self) -> bool {
        let mut state = self.state();
        if !state.stalled {
            let stalled = (0..state.pending.len())
                .all(|i| state.finished[i] || (state.waiting[i] && state.pending[i] == 0));
            state.stalled = stalled;
        }
        state.stalled
    }
}

/// A [`ChannelIo`]'s place in a [`ChannelLedger`].
#[derive(Debug)]
struct Endpoint {
    ledger: Arc<ChannelLedger>,
    at: usize,
    to: usize,
}

/// I/O over `std::sync::mpsc` channels, for running a machine on its own
/// thread.
///
/// `consume_input` first serves any preloaded values, then blocks until a
/// value arrives. Untracked, it reports starvation once every sender has hung
/// up. Tracked by a [`ChannelLedger`], it reports starvation only once the
/// whole group has stalled, so a machine whose upstream finished waits for
/// the verdict like everyone else. With a bounded `sync_channel`,
/// `emit_output` blocks while the channel is full.
#[derive(Debug)]
pub struct ChannelIo {
    input: Receiver<i64>,
    output: SyncSender<i64>,
    preload: VecDeque<i64>,
    endpoint: Option<Endpoint>,
    dropped: usize,
}

impl ChannelIo {
    pub fn new(input: Receiver<i64>, output: SyncSender<i64>) -> Self {
        Self {
            input,
            output,
            preload: VecDeque::new(),
            endpoint: None,
            dropped: 0,
        }
    }

    /// Serve `values` before anything that arrives on the channel.
    pub fn with_preload(mut self, values: impl IntoIterator<Item = i64>) -> Self {
        self.preload.extend(values);
        self
    }

    /// Report to `ledger` as endpoint `at`, whose output goes to endpoint `to`.
    pub fn tracked(mut self, ledger: Arc<ChannelLedger>, at: usize, to: usize) -> Self {
        self.endpoint = Some(Endpoint { ledger, at, to });
        self
    }

    /// Values emitted after the receiving end disconnected.
    pub fn dropped(&self) -> usize {
        self.dropped
    }
}

impl Io for ChannelIo {
    fn consume_input(&mut self) -> Option<i64> {
        if let Some(value) = self.preload.pop_front() {
            return Some(value);
        }
        let Some(endpoint) = &self.endpoint else {
            return self.input.recv().ok();
        };

        endpoint.ledger.set_waiting(endpoint.at, true);
        loop {
            match self.input.recv_timeout(STALL_POLL) {
                Ok(value) => {
                    endpoint.ledger.received(endpoint.at);
                    return Some(value);
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => thread::sleep(STALL_POLL),
            }
            if endpoint.ledger.check_stalled() {
                endpoint.ledger.set_waiting(endpoint.at, false);
                return None;
            }
        }
    }

    fn emit_output(&mut self, value: i64) {
        if let Some(endpoint) = &self.endpoint {
            endpoint.ledger.sent(endpoint.to);
        }
        if self.output.send(value).is_err() {
            if let Some(endpoint) = &self.endpoint {
                endpoint.ledger.unsent(endpoint.to);
            }
            warn!(value, "output receiver disconnected; dropping value");
            self.dropped += 1;
        }
    }
}
