//! Ordered dispatch: parallel work, in-order application.
//!
//! Some state must see results in the order work was submitted even though
//! workers finish out of order. Convergence-mode application is the case in
//! point: rules are ground in parallel, but each query's score list has to
//! be refined in descending rule quality.
//!
//! # Architecture
//!
//! - [`OrderedBarrier`]: hands out monotonically increasing sequence numbers
//!   at submission and parks completed results in a concurrent map keyed by
//!   them. A single coordinator consumes the next expected number whenever
//!   it is ready.
//! - [`run_ordered`]: a feeder thread submits work items, a pool of workers
//!   computes results, and the calling thread applies them strictly in
//!   submission order until the items run out or the applier breaks. The
//!   feeder never runs more than a fixed window ahead of the coordinator, so
//!   one slow item parks a bounded number of results.
//! - [`converge`]: the convergence-mode applier built on top of it.

pub mod converge;

use std::ops::ControlFlow;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;

use crossbeam_channel::RecvTimeoutError;
use dashmap::DashMap;
use tracing::debug;

use crate::cancel::CancelToken;
use crate::error::{GpflResult, PipelineError};

/// How long the coordinator waits for a completion before re-checking the
/// cancellation token.
const COORDINATOR_POLL: std::time::Duration = std::time::Duration::from_millis(50);

/// How long the feeder sleeps while the window is full.
const FEEDER_BACKOFF: std::time::Duration = std::time::Duration::from_millis(1);

/// Submitted but unapplied units allowed per worker.
const LEAD_PER_WORKER: u64 = 64;

// ---------------------------------------------------------------------------
// Barrier
// ---------------------------------------------------------------------------

/// Reassembles out-of-order results into submission order.
#[derive(Debug)]
pub struct OrderedBarrier<R> {
    submitted: AtomicU64,
    completed: DashMap<u64, R>,
    /// Advanced only by the coordinator.
    expected: AtomicU64,
}

impl<R> Default for OrderedBarrier<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R> OrderedBarrier<R> {
    pub fn new() -> Self {
        Self {
            submitted: AtomicU64::new(0),
            completed: DashMap::new(),
            expected: AtomicU64::new(0),
        }
    }

    /// Assign the next sequence number.
    pub fn ticket(&self) -> u64 {
        self.submitted.fetch_add(1, Ordering::SeqCst)
    }

    /// Park the result of unit `seq`.
    pub fn complete(&self, seq: u64, result: R) {
        self.completed.insert(seq, result);
    }

    /// The next result in submission order, if it has completed.
    pub fn next_ready(&self) -> Option<(u64, R)> {
        let expected = self.expected.load(Ordering::SeqCst);
        let (seq, result) = self.completed.remove(&expected)?;
        self.expected.store(expected + 1, Ordering::SeqCst);
        Some((seq, result))
    }

    /// Sequence number the coordinator waits for next.
    pub fn expected(&self) -> u64 {
        self.expected.load(Ordering::SeqCst)
    }

    pub fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::SeqCst)
    }

    /// Units submitted but not yet consumed.
    pub fn lead(&self) -> u64 {
        self.submitted().saturating_sub(self.expected())
    }

    /// Whether every submitted unit has been consumed.
    pub fn drained(&self) -> bool {
        self.expected() == self.submitted()
    }
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

/// How an ordered run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrderedRun {
    /// Results handed to the applier.
    pub applied: u64,
    /// The applier asked to stop before the items ran out.
    pub stopped_early: bool,
}

/// Compute `work` over `items` on `threads` workers and hand each result to
/// `apply` in item order. Returning `Break` from `apply` cancels `token`,
/// which stops the feeder and the workers.
pub fn run_ordered<I, R, W, A>(
    items: Vec<I>,
    threads: usize,
    token: &CancelToken,
    work: W,
    apply: A,
) -> GpflResult<OrderedRun>
where
    I: Send,
    R: Send + Sync,
    W: Fn(&I) -> R + Sync,
    A: FnMut(u64, R) -> ControlFlow<()>,
{
    let threads = threads.max(1);
    let max_lead = LEAD_PER_WORKER * threads as u64;
    run_ordered_within(items, threads, max_lead, token, work, apply)
}

/// [`run_ordered`] with at most `max_lead` units submitted ahead of the
/// next one to apply.
pub fn run_ordered_within<I, R, W, A>(
    items: Vec<I>,
    threads: usize,
    max_lead: u64,
    token: &CancelToken,
    work: W,
    mut apply: A,
) -> GpflResult<OrderedRun>
where
    I: Send,
    R: Send + Sync,
    W: Fn(&I) -> R + Sync,
    A: FnMut(u64, R) -> ControlFlow<()>,
{
    let threads = threads.max(1);
    let max_lead = max_lead.max(1);
    let barrier: OrderedBarrier<R> = OrderedBarrier::new();
    let total = items.len() as u64;
    let (job_tx, job_rx) = crossbeam_channel::bounded::<(u64, I)>(threads * 4);
    let (done_tx, done_rx) = crossbeam_channel::unbounded::<u64>();

    let mut run = OrderedRun {
        applied: 0,
        stopped_early: false,
    };

    thread::scope(|scope| -> GpflResult<()> {
        let tickets = &barrier;
        let feeder = scope.spawn(move || {
            for item in items {
                while tickets.lead() >= max_lead {
                    if token.is_cancelled() {
                        return;
                    }
                    thread::sleep(FEEDER_BACKOFF);
                }
                if token.is_cancelled() {
                    return;
                }
                let seq = tickets.ticket();
                if job_tx.send((seq, item)).is_err() {
                    return;
                }
            }
        });

        let workers: Vec<_> = (0..threads)
            .map(|_| {
                let job_rx = job_rx.clone();
                let done_tx = done_tx.clone();
                let work = &work;
                let results = &barrier;
                scope.spawn(move || {
                    for (seq, item) in job_rx {
                        if token.is_cancelled() {
                            return;
                        }
                        results.complete(seq, work(&item));
                        if done_tx.send(seq).is_err() {
                            return;
                        }
                    }
                })
            })
            .collect();
        drop(job_rx);
        drop(done_tx);

        let mut finished = 0u64;
        while finished < total && !token.is_cancelled() {
            match done_rx.recv_timeout(COORDINATOR_POLL) {
                Ok(_) => finished += 1,
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            if ready_in_order(&barrier, &mut run, &mut apply, token) {
                break;
            }
        }

        feeder.join().map_err(|_| PipelineError::WorkerPanicked {
            stage: "ordered dispatch feeder",
        })?;
        for worker in workers {
            worker.join().map_err(|_| PipelineError::WorkerPanicked {
                stage: "ordered dispatch worker",
            })?;
        }
        Ok(())
    })?;

    // Whatever completed after the last wake-up is still applied in order.
    if !run.stopped_early {
        while let Some((seq, result)) = barrier.next_ready() {
            run.applied += 1;
            if apply(seq, result).is_break() {
                run.stopped_early = true;
                token.cancel();
                break;
            }
        }
    }
    debug!(
        applied = run.applied,
        submitted = barrier.submitted(),
        stopped_early = run.stopped_early,
        "ordered dispatch finished"
    );
    Ok(run)
}

/// Apply every consecutive completed result. Returns whether to stop.
fn ready_in_order<R, A>(
    barrier: &OrderedBarrier<R>,
    run: &mut OrderedRun,
    apply: &mut A,
    token: &CancelToken,
) -> bool
where
    A: FnMut(u64, R) -> ControlFlow<()>,
{
    while let Some((seq, result)) = barrier.next_ready() {
        run.applied += 1;
        if apply(seq, result).is_break() {
            run.stopped_early = true;
            token.cancel();
            return true;
        }
    }
    false
}
