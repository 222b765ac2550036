// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Independently scheduled executors that run command lists.

mod queue;

pub use queue::QueueExecutor;

use std::fmt::{self, Display, Formatter};
use std::time::Duration;

use async_trait::async_trait;

use crate::chain::CommandList;
use crate::error::{SubmitError, WaitError};
use crate::pool::SyncPrimitive;
use crate::status::ExecutionStatus;

/// Receipt for one submitted command list.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExecutorTicket(u64);

impl ExecutorTicket {
    /// Wrap a raw ticket value.
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw ticket value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Display for ExecutorTicket {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "ticket#{}", self.0)
    }
}

/// An independently scheduled unit of asynchronous work submission.
///
/// Executors share no ordering with each other. The only cross-executor
/// ordering is what the wait and signal handles of the submitted items
/// express.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Ordinal of the executor within its collection.
    fn ordinal(&self) -> usize;

    /// Enqueue a closed list for asynchronous execution.
    ///
    /// Lists submitted to the same executor run in submission order.
    fn submit(&self, list: CommandList) -> Result<ExecutorTicket, SubmitError>;

    /// Non-blocking status of a submission.
    ///
    /// A terminal status is reported once; the executor may forget the
    /// ticket afterwards and answer later polls with
    /// [`codes::INVALID_TICKET`](crate::status::codes::INVALID_TICKET).
    fn poll(&self, ticket: ExecutorTicket) -> ExecutionStatus;

    /// Signal a primitive from the host on behalf of this executor.
    fn host_signal(&self, primitive: &SyncPrimitive) -> Result<(), WaitError> {
        primitive.signal()
    }

    /// Wait on a primitive from the host, bounded by `timeout`.
    async fn host_wait(
        &self,
        primitive: &SyncPrimitive,
        timeout: Duration,
    ) -> Result<(), WaitError> {
        primitive.wait_timeout(timeout).await
    }
}
