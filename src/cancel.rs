//! Cooperative cancellation.
//!
//! A [`CancelToken`] is shared by every worker of a phase and polled at each
//! unit of work, including every recursive grounding step. It trips when its
//! deadline passes or when someone calls [`CancelToken::cancel_with`] (for
//! example on reaching a count cap). The first trip fixes the reported
//! [`StopReason`]. Nothing is ever interrupted preemptively.

use std::sync::{Arc, OnceLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

#[derive(Debug)]
struct Inner {
    cancelled: AtomicBool,
    reason: OnceLock<StopReason>,
    deadline: Option<Instant>,
}

/// Shared, cloneable stop flag with an optional deadline.
#[derive(Debug, Clone)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

impl CancelToken {
    /// A token that only trips when cancelled explicitly.
    pub fn new() -> Self {
        Self::with_budget(None)
    }

    /// A token that also trips once `budget` has elapsed from now.
    pub fn with_budget(budget: Option<Duration>) -> Self {
        Self {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                reason: OnceLock::new(),
                deadline: budget.map(|b| Instant::now() + b),
            }),
        }
    }

    /// Trip the token with no more specific reason than [`StopReason::Cancelled`].
    pub fn cancel(&self) {
        self.cancel_with(StopReason::Cancelled);
    }

    /// Trip the token, recording `reason` unless it already tripped.
    pub fn cancel_with(&self, reason: StopReason) {
        let _ = self.inner.reason.set(reason);
        self.inner.cancelled.store(true, Ordering::Release);
    }

    /// Whether work should stop. Passing the deadline latches the flag.
    pub fn is_cancelled(&self) -> bool {
        if self.inner.cancelled.load(Ordering::Acquire) {
            return true;
        }
        if self.deadline_passed() {
            self.cancel_with(StopReason::TimeBudget);
            return true;
        }
        false
    }

    /// Why the token tripped, or `None` while it has not.
    pub fn reason(&self) -> Option<StopReason> {
        if !self.is_cancelled() {
            return None;
        }
        self.inner.reason.get().copied()
    }

    /// Whether the deadline (as opposed to an explicit cancel) has passed.
    pub fn deadline_passed(&self) -> bool {
        self.inner.deadline.is_some_and(|d| Instant::now() >= d)
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Why a phase stopped. Every variant is a normal termination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// All input was consumed.
    Exhausted,
    /// Generalization reached the saturation threshold.
    Saturated,
    /// A batch boundary was reached with no new templates to examine.
    EmptyBatch,
    /// The phase's time budget elapsed.
    TimeBudget,
    /// A count cap (instantiated rules, suggestions) was reached.
    CountCap,
    /// Convergence-mode application stopped improving coverage.
    Converged,
    /// Stopped on request, for example after an error elsewhere.
    Cancelled,
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            StopReason::Exhausted => "exhausted",
            StopReason::Saturated => "saturated",
            StopReason::EmptyBatch => "empty batch",
            StopReason::TimeBudget => "time budget",
            StopReason::CountCap => "count cap",
            StopReason::Converged => "converged",
            StopReason::Cancelled => "cancelled",
        };
        f.write_str(text)
    }
}
