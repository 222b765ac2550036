// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Multi-executor dependency chains.
//!
//! A chain records, per executor, a FIFO sequence of `{wait, work, signal}`
//! steps. Steps on different executors are related only through the sync
//! handles they share; the builder never inserts ordering of its own.

mod step;

pub use step::{CommandList, Kernel, StepLocation, WorkItem, WorkPayload};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::config::ChainConfig;
use crate::error::{ChainError, PoolError, StalledStep, SubmitError, SyncError, WaitError};
use crate::executor::{Executor, ExecutorTicket};
use crate::handle::SyncHandle;
use crate::pool::SyncPool;
use crate::status::{ExecutionStatus, StepState};
use step::StepCell;

/// Stand-in deadline distance for timeouts that overflow `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// Where a chain is in its life cycle.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ChainPhase {
    /// Steps may still be added.
    Recording,
    /// Lists were handed to executors.
    Submitted,
    /// Every executor reported completion.
    Completed,
    /// A step failed or an executor rejected its list.
    Failed,
    /// `synchronize_all` gave up waiting.
    TimedOut,
}

/// Observer-side record of one step.
#[derive(Debug)]
struct StepRecord {
    waits: Vec<SyncHandle>,
    signal: Option<SyncHandle>,
    state: StepCell,
}

/// Builds and drives one scenario's chain across `executor_count` executors.
///
/// The builder borrows its [`SyncPool`] mutably for its whole life, so one
/// pool serves at most one chain at a time. Handles from any other pool are
/// a logic error and panic.
#[derive(Debug)]
pub struct ChainBuilder<'p> {
    pool: &'p mut SyncPool,
    lists: Vec<CommandList>,
    records: Vec<Vec<StepRecord>>,
    references: HashMap<SyncHandle, Vec<StepLocation>>,
    tickets: Vec<ExecutorTicket>,
    unsettled: Vec<usize>,
    phase: ChainPhase,
    failure: Option<SyncError>,
    poll_interval: Duration,
}

impl<'p> ChainBuilder<'p> {
    /// Start a chain over `executor_count` executors.
    pub fn new(pool: &'p mut SyncPool, executor_count: usize) -> Result<Self, ChainError> {
        Self::with_config(pool, executor_count, &ChainConfig::default())
    }

    /// Start a chain polling executors at `config.poll_interval()`.
    pub fn with_config(
        pool: &'p mut SyncPool,
        executor_count: usize,
        config: &ChainConfig,
    ) -> Result<Self, ChainError> {
        if executor_count == 0 {
            return Err(ChainError::InvalidExecutorCount);
        }
        debug!(pool = pool.id(), executor_count, "recording chain");
        Ok(Self {
            pool,
            lists: (0..executor_count).map(CommandList::new).collect(),
            records: (0..executor_count).map(|_| Vec::new()).collect(),
            references: HashMap::new(),
            tickets: Vec::new(),
            unsettled: Vec::new(),
            phase: ChainPhase::Recording,
            failure: None,
            poll_interval: config.poll_interval(),
        })
    }

    /// Number of executors the chain spans.
    pub fn executor_count(&self) -> usize {
        self.records.len()
    }

    /// Current phase.
    pub fn phase(&self) -> ChainPhase {
        self.phase
    }

    /// The borrowed pool, for host-side signal and query operations.
    pub fn pool(&self) -> &SyncPool {
        self.pool
    }

    /// Acquire a handle from the borrowed pool.
    pub fn acquire(&mut self) -> Result<SyncHandle, ChainError> {
        Ok(self.pool.acquire()?)
    }

    /// Release a handle back to the borrowed pool.
    ///
    /// Refused while any step referencing the handle has not reached a
    /// terminal state.
    ///
    /// # Panics
    /// If `handle` was issued by a different pool.
    pub fn release(&mut self, handle: SyncHandle) -> Result<(), ChainError> {
        self.pool.assert_owned(handle);
        if let Some(location) = self.references.get(&handle).and_then(|locations| {
            locations
                .iter()
                .find(|location| !self.record(**location).state.lock().is_terminal())
        }) {
            return Err(ChainError::HandleInUse {
                handle,
                location: *location,
            });
        }
        self.pool.release(handle)?;
        self.references.remove(&handle);
        Ok(())
    }

    /// Append a step to `executor`'s sequence.
    ///
    /// Every handle in `waits` and `signal` must be live in the chain's pool.
    /// Steps on one executor run in the order they are added.
    ///
    /// # Panics
    /// If a handle was issued by a different pool.
    pub fn add_step(
        &mut self,
        executor: usize,
        waits: &[SyncHandle],
        payload: WorkPayload,
        signal: Option<SyncHandle>,
    ) -> Result<StepLocation, ChainError> {
        if self.phase != ChainPhase::Recording {
            return Err(ChainError::AlreadySubmitted);
        }
        let count = self.executor_count();
        let Some(list) = self.lists.get(executor) else {
            return Err(ChainError::InvalidExecutorIndex {
                index: executor,
                count,
            });
        };
        let location = StepLocation::new(executor, list.len());

        if let Some(signal) = signal.filter(|signal| waits.contains(signal)) {
            return Err(ChainError::SelfWait {
                handle: signal,
                location,
            });
        }

        let resolve = |handle: SyncHandle| {
            self.pool.primitive(handle).map_err(|err| match err {
                PoolError::UnknownHandle { handle } => ChainError::UnknownHandle { handle, location },
                other => ChainError::Pool(other),
            })
        };
        let wait_primitives = waits
            .iter()
            .map(|handle| resolve(*handle))
            .collect::<Result<Vec<_>, _>>()?;
        let signal_primitive = signal.map(resolve).transpose()?;

        let item = WorkItem::new(location, wait_primitives, payload, signal_primitive);
        self.records[executor].push(StepRecord {
            waits: waits.to_vec(),
            signal,
            state: item.state_cell(),
        });
        self.lists[executor].push(item);

        for handle in waits.iter().chain(signal.as_ref()) {
            let locations = self.references.entry(*handle).or_default();
            if locations.last() != Some(&location) {
                locations.push(location);
            }
        }
        debug!(%location, waits = waits.len(), signal = ?signal, "recorded step");
        Ok(location)
    }

    /// Number of steps recorded for `executor`.
    pub fn step_count(&self, executor: usize) -> Option<usize> {
        self.records.get(executor).map(Vec::len)
    }

    /// State of the step at `location`.
    pub fn step_state(&self, location: StepLocation) -> Option<StepState> {
        self.records
            .get(location.executor)?
            .get(location.step)
            .map(|record| record.state.lock().clone())
    }

    /// Close every list and hand each to its executor exactly once.
    ///
    /// `executors[i]` receives the list recorded for executor `i`. The order
    /// of submission implies nothing about the order of execution.
    ///
    /// If an executor rejects its list, the lists that were not handed over
    /// are failed and their signals poisoned, so the lists already running
    /// cannot block on them forever.
    pub fn submit<E: Executor>(&mut self, executors: &[E]) -> Result<(), SubmitError> {
        if self.phase != ChainPhase::Recording {
            return Err(SubmitError::AlreadySubmitted);
        }
        if executors.len() != self.executor_count() {
            return Err(SubmitError::ExecutorCountMismatch {
                expected: self.executor_count(),
                actual: executors.len(),
            });
        }

        let lists = std::mem::take(&mut self.lists);
        let mut tickets = Vec::with_capacity(executors.len());
        for (index, (executor, mut list)) in executors.iter().zip(lists).enumerate() {
            list.close();
            for item in list.items() {
                item.transition(StepState::Submitted);
            }

            match executor.submit(list) {
                Ok(ticket) => {
                    debug!(executor = index, %ticket, "submitted chain list");
                    tickets.push(ticket);
                }
                Err(err) => {
                    error!(executor = index, %err, "executor rejected chain list");
                    self.fail_unsubmitted(index, &err);
                    self.tickets = tickets;
                    self.phase = ChainPhase::Failed;
                    return Err(err);
                }
            }
        }

        self.unsettled = (0..tickets.len()).collect();
        self.tickets = tickets;
        self.phase = ChainPhase::Submitted;
        Ok(())
    }

    /// Wait until every executor completes, a step fails, or `timeout`
    /// elapses.
    ///
    /// On timeout the chain is left in [`ChainPhase::TimedOut`]; the error
    /// lists every step that had not finished. Handles and executors involved
    /// should be torn down, not reused.
    pub async fn synchronize_all<E: Executor>(
        &mut self,
        executors: &[E],
        timeout: Duration,
    ) -> Result<(), SyncError> {
        match self.phase {
            ChainPhase::Recording => return Err(SyncError::NotSubmitted),
            ChainPhase::Completed => return Ok(()),
            ChainPhase::Failed => {
                return Err(self.failure.clone().unwrap_or(SyncError::NotSubmitted));
            }
            ChainPhase::Submitted | ChainPhase::TimedOut => {}
        }
        if executors.len() != self.tickets.len() {
            return Err(SyncError::ExecutorCountMismatch {
                expected: self.tickets.len(),
                actual: executors.len(),
            });
        }

        // executors report a terminal status once, so settled ones are not polled again
        let started = Instant::now();
        let deadline = started
            .checked_add(timeout)
            .unwrap_or_else(|| started + FAR_FUTURE);
        loop {
            let pending = std::mem::take(&mut self.unsettled);
            let mut still_pending = Vec::with_capacity(pending.len());
            for index in pending {
                match executors[index].poll(self.tickets[index]) {
                    ExecutionStatus::Complete => {}
                    ExecutionStatus::Pending => still_pending.push(index),
                    ExecutionStatus::Failed(failure) => {
                        error!(executor = index, %failure, "chain execution failed");
                        let err = SyncError::ExecutionFailed {
                            executor: index,
                            failure,
                        };
                        self.phase = ChainPhase::Failed;
                        self.failure = Some(err.clone());
                        return Err(err);
                    }
                }
            }
            self.unsettled = still_pending;

            if self.unsettled.is_empty() {
                debug!("chain complete");
                self.phase = ChainPhase::Completed;
                return Ok(());
            }

            let now = Instant::now();
            if now >= deadline {
                let stalled = self.stalled_steps();
                warn!(
                    ?timeout,
                    stalled = stalled.len(),
                    "chain synchronization timed out"
                );
                self.phase = ChainPhase::TimedOut;
                return Err(SyncError::Timeout { timeout, stalled });
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    /// Fail every step from executor `from` onwards and poison its signal.
    fn fail_unsubmitted(&self, from: usize, err: &SubmitError) {
        let reason: Arc<str> = format!("not submitted: {err}").into();
        for (executor, records) in self.records.iter().enumerate().skip(from) {
            for (step, record) in records.iter().enumerate() {
                *record.state.lock() = StepState::Failed(Arc::clone(&reason));
                let Some(signal) = record.signal else {
                    continue;
                };
                let poisoned = self
                    .pool
                    .primitive(signal)
                    .map_err(WaitError::from)
                    .and_then(|primitive| primitive.poison(Arc::clone(&reason)));
                if let Err(err) = poisoned {
                    warn!(executor, step, %err, "could not poison signal of unsubmitted step");
                }
            }
        }
    }

    fn record(&self, location: StepLocation) -> &StepRecord {
        &self.records[location.executor][location.step]
    }

    fn stalled_steps(&self) -> Vec<StalledStep> {
        self.records
            .iter()
            .enumerate()
            .flat_map(|(executor, records)| {
                records.iter().enumerate().filter_map(move |(step, record)| {
                    let state = record.state.lock().clone();
                    (!state.is_terminal()).then(|| StalledStep {
                        location: StepLocation::new(executor, step),
                        state,
                        waits: record.waits.clone(),
                    })
                })
            })
            .collect()
    }
}
