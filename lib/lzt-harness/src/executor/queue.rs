// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! In-process command queue running on the ambient tokio runtime.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, debug, debug_span, error};

use super::{Executor, ExecutorTicket};
use crate::chain::{CommandList, WorkItem};
use crate::config::ExecutorConfig;
use crate::error::SubmitError;
use crate::status::{ExecutionFailure, ExecutionStatus, codes};

type TicketTable = Arc<DashMap<ExecutorTicket, ExecutionStatus>>;

/// A command queue that executes lists as tokio tasks.
///
/// Lists submitted to one queue run strictly one after another. Lists on
/// different queues run concurrently with no ordering between them. When a
/// step fails, its signal and the signals of every later step in the same
/// list are poisoned so that waiters on other queues fail instead of hanging.
///
/// Clones share the same queue. Dropping the last clone cancels outstanding
/// work.
#[derive(Clone, Debug)]
pub struct QueueExecutor {
    inner: Arc<QueueInner>,
}

#[derive(Debug)]
struct QueueInner {
    ordinal: usize,
    tracker: TaskTracker,
    cancel: CancellationToken,
    tickets: TicketTable,
    next_ticket: AtomicU64,
    tail: Mutex<Option<oneshot::Receiver<()>>>,
    closed: AtomicBool,
}

impl Drop for QueueInner {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl QueueExecutor {
    /// Create a queue with the given ordinal.
    pub fn new(ordinal: usize) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                ordinal,
                tracker: TaskTracker::new(),
                cancel: CancellationToken::new(),
                tickets: Arc::new(DashMap::new()),
                next_ticket: AtomicU64::new(1),
                tail: Mutex::new(None),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Create `count` queues with ordinals `0..count`.
    pub fn group(count: usize) -> Vec<Self> {
        (0..count).map(Self::new).collect()
    }

    /// Create the queue collection described by `config`.
    pub fn group_from_config(config: &ExecutorConfig) -> Vec<Self> {
        Self::group(config.count)
    }

    /// Whether [`shutdown`](Self::shutdown) has been called.
    pub fn is_shut_down(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Cancel outstanding work and wait for every task to finish.
    ///
    /// Steps still waiting or queued fail with [`codes::CANCELLED`]. Later
    /// submissions are rejected.
    pub async fn shutdown(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.cancel.cancel();
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        debug!(executor = self.inner.ordinal, "queue executor shut down");
    }

    fn rejected(&self, reason: impl Into<Arc<str>>) -> SubmitError {
        SubmitError::Rejected {
            executor: self.inner.ordinal,
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl Executor for QueueExecutor {
    fn ordinal(&self) -> usize {
        self.inner.ordinal
    }

    fn submit(&self, list: CommandList) -> Result<ExecutorTicket, SubmitError> {
        if !list.is_closed() {
            return Err(SubmitError::ListNotClosed {
                executor: list.executor(),
            });
        }
        if self.is_shut_down() || self.inner.cancel.is_cancelled() {
            return Err(self.rejected("executor is shut down"));
        }
        let runtime = Handle::try_current()
            .map_err(|err| self.rejected(format!("no tokio runtime: {err}")))?;

        let ticket = ExecutorTicket::new(self.inner.next_ticket.fetch_add(1, Ordering::Relaxed));
        self.inner.tickets.insert(ticket, ExecutionStatus::Pending);

        let (done_tx, done_rx) = oneshot::channel();
        let previous = self.inner.tail.lock().replace(done_rx);

        debug!(
            executor = self.inner.ordinal,
            %ticket,
            steps = list.len(),
            "submitted command list"
        );
        let run = ListRun {
            ordinal: self.inner.ordinal,
            ticket,
            cancel: self.inner.cancel.clone(),
            tickets: Arc::clone(&self.inner.tickets),
        };
        self.inner
            .tracker
            .spawn_on(run.execute(list, previous, done_tx), &runtime);
        Ok(ticket)
    }

    fn poll(&self, ticket: ExecutorTicket) -> ExecutionStatus {
        if let Some((_, status)) = self
            .inner
            .tickets
            .remove_if(&ticket, |_, status| *status != ExecutionStatus::Pending)
        {
            return status;
        }
        match self.inner.tickets.get(&ticket) {
            Some(_) => ExecutionStatus::Pending,
            None => ExecutionStatus::Failed(ExecutionFailure::new(
                None,
                codes::INVALID_TICKET,
                format!(
                    "{ticket} was not issued by executor {} or was already reported",
                    self.inner.ordinal
                ),
            )),
        }
    }
}

/// State moved into the task driving one submitted list.
struct ListRun {
    ordinal: usize,
    ticket: ExecutorTicket,
    cancel: CancellationToken,
    tickets: TicketTable,
}

impl ListRun {
    async fn execute(
        self,
        list: CommandList,
        previous: Option<oneshot::Receiver<()>>,
        done: oneshot::Sender<()>,
    ) {
        let status = self.drive(&list, previous).await;
        match &status {
            ExecutionStatus::Failed(failure) => {
                error!(executor = self.ordinal, ticket = %self.ticket, %failure, "command list failed")
            }
            _ => debug!(executor = self.ordinal, ticket = %self.ticket, "command list complete"),
        }
        self.tickets.insert(self.ticket, status);
        // the next list may start now; it does not care whether we were awaited
        let _ = done.send(());
    }

    async fn drive(
        &self,
        list: &CommandList,
        previous: Option<oneshot::Receiver<()>>,
    ) -> ExecutionStatus {
        if let Some(previous) = previous {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    let failure = ExecutionFailure::new(None, codes::CANCELLED, "executor shut down");
                    return self.abandon(list.items(), failure);
                }
                _ = previous => {}
            }
        }

        for (position, item) in list.items().iter().enumerate() {
            let span = debug_span!("step", executor = self.ordinal, step = position);
            let outcome = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Err(ExecutionFailure::new(
                    Some(position),
                    codes::CANCELLED,
                    "executor shut down",
                )),
                result = item.run().instrument(span) => result,
            };

            if let Err(failure) = outcome {
                item.fail(&failure);
                return self.abandon(&list.items()[position + 1..], failure);
            }
        }
        ExecutionStatus::Complete
    }

    fn abandon(&self, rest: &[WorkItem], failure: ExecutionFailure) -> ExecutionStatus {
        for item in rest {
            let abandoned = ExecutionFailure::new(
                Some(item.location().step),
                failure.code(),
                format!("abandoned: {}", failure.reason()),
            );
            item.fail(&abandoned);
        }
        ExecutionStatus::Failed(failure)
    }
}
