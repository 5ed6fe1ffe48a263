use std::fmt::Display;
use std::thread;

use due_sync_core::{CancellationToken, OverageOrigin, SyncError};
use parking_lot::Mutex;
use serde::Serialize;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

/// Why a run stopped dispatching work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StopReason {
    RateLimited {
        #[serde(with = "time::serde::rfc3339")]
        retry_at: OffsetDateTime,
        origin: OverageOrigin,
    },
    Cancelled,
    Fatal {
        code: &'static str,
        message: String,
    },
}

impl StopReason {
    /// Run-level reason carried by `err`, or `None` for per-record failures.
    #[must_use]
    pub fn from_error(err: &SyncError) -> Option<Self> {
        match err {
            SyncError::RateLimitExceeded { retry_at, origin } => {
                Some(Self::RateLimited { retry_at: *retry_at, origin: *origin })
            }
            other if other.is_run_fatal() => {
                Some(Self::Fatal { code: other.code(), message: other.to_string() })
            }
            _ => None,
        }
    }

    #[must_use]
    pub fn retry_at(&self) -> Option<OffsetDateTime> {
        match self {
            Self::RateLimited { retry_at, .. } => Some(*retry_at),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal { .. })
    }
}

/// A work item that failed without stopping the run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemFailure {
    pub item: String,
    pub code: &'static str,
    pub message: String,
}

impl ItemFailure {
    #[must_use]
    pub fn new(item: &impl Display, err: &SyncError) -> Self {
        Self { item: item.to_string(), code: err.code(), message: err.to_string() }
    }
}

#[derive(Debug)]
pub struct PoolOutcome<I, T> {
    /// Consolidated results, in completion order.
    pub completed: Vec<T>,
    pub failures: Vec<ItemFailure>,
    /// Items whose work was cut short by the stop.
    pub interrupted: Vec<I>,
    pub not_started: Vec<I>,
    pub stop: Option<StopReason>,
}

impl<I, T> PoolOutcome<I, T> {
    /// Items that still need doing in a later run.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.interrupted.len() + self.not_started.len()
    }
}

struct Shared<I, T> {
    next: usize,
    completed: Vec<T>,
    failures: Vec<ItemFailure>,
    interrupted: Vec<I>,
    stop: Option<StopReason>,
}

/// Bounded set of scoped worker threads pulling items off a shared queue.
///
/// Dispatch and the stop decision share one lock, so once a stop is recorded
/// no further item is handed out. Work already running is allowed to finish.
#[derive(Debug, Clone, Copy)]
pub struct FetchWorkerPool {
    concurrency: usize,
}

impl FetchWorkerPool {
    #[must_use]
    pub fn new(concurrency: usize) -> Self {
        Self { concurrency: concurrency.max(1) }
    }

    pub fn run<I, T, F>(&self, items: &[I], cancel: &CancellationToken, work: F) -> PoolOutcome<I, T>
    where
        I: Clone + Display + Send + Sync,
        T: Send,
        F: Fn(&I) -> Result<T, SyncError> + Sync,
    {
        let shared = Mutex::new(Shared {
            next: 0,
            completed: Vec::with_capacity(items.len()),
            failures: Vec::new(),
            interrupted: Vec::new(),
            stop: None,
        });
        let workers = self.concurrency.min(items.len());
        debug!(items = items.len(), workers, "starting worker pool");

        thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| loop {
                    let Some(item) = next_item(&shared, items, cancel) else {
                        break;
                    };
                    let outcome = work(item);
                    let mut state = shared.lock();
                    match outcome {
                        Ok(value) => state.completed.push(value),
                        Err(err) => match StopReason::from_error(&err) {
                            Some(reason) => {
                                state.interrupted.push(item.clone());
                                if state.stop.is_none() {
                                    warn!(item = %item, error = %err, "stopping dispatch");
                                    state.stop = Some(reason);
                                }
                            }
                            None => {
                                warn!(item = %item, error = %err, "item failed; skipping");
                                state.failures.push(ItemFailure::new(item, &err));
                            }
                        },
                    }
                });
            }
        });

        let state = shared.into_inner();
        let not_started = items.get(state.next..).unwrap_or_default().to_vec();
        if state.stop.is_some() {
            info!(
                completed = state.completed.len(),
                interrupted = state.interrupted.len(),
                not_started = not_started.len(),
                "worker pool drained early"
            );
        }
        PoolOutcome {
            completed: state.completed,
            failures: state.failures,
            interrupted: state.interrupted,
            not_started,
            stop: state.stop,
        }
    }
}

fn next_item<'a, I, T>(
    shared: &Mutex<Shared<I, T>>,
    items: &'a [I],
    cancel: &CancellationToken,
) -> Option<&'a I> {
    let mut state = shared.lock();
    if state.stop.is_some() {
        return None;
    }
    if cancel.is_cancelled() {
        info!("cancellation requested; no further dispatch");
        state.stop = Some(StopReason::Cancelled);
        return None;
    }
    let item = items.get(state.next)?;
    state.next += 1;
    Some(item)
}
