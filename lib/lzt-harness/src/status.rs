// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Status types shared by the pool, the chain builder and executors.

use std::fmt::{self, Display, Formatter};
use std::sync::Arc;

/// Result codes reported by executors when a step fails for a reason other
/// than its own payload.
pub mod codes {
    /// A handle the step waited on was poisoned.
    pub const DEPENDENCY_POISONED: i32 = 0x7000_0001;
    /// A handle the step referenced was released while the step was queued.
    pub const STALE_HANDLE: i32 = 0x7000_0002;
    /// The executor was shut down before the step finished.
    pub const CANCELLED: i32 = 0x7000_0003;
    /// The ticket was never issued by the polled executor, or its terminal
    /// status was already reported.
    pub const INVALID_TICKET: i32 = 0x7000_0004;
    /// A bounded wait elapsed.
    pub const WAIT_TIMED_OUT: i32 = 0x7000_0005;
    /// A built-in payload was given buffers it cannot operate on.
    pub const INVALID_PAYLOAD: i32 = 0x7000_0006;
    /// A payload panicked while executing.
    pub const PAYLOAD_PANICKED: i32 = 0x7000_0007;
}

/// Host-visible state of one primitive.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum SyncStatus {
    NotReady,
    Signaled,
    Poisoned,
}

/// Life cycle of one recorded step.
///
/// `Pending → Submitted → Waiting (only with waits) → Executing → Completed`,
/// with `Failed` reachable from any state after submission.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StepState {
    /// Recorded but not yet handed to an executor.
    Pending,
    /// Handed to an executor, not started.
    Submitted,
    /// Blocked on at least one wait handle.
    Waiting,
    /// Running its payload.
    Executing,
    /// Payload done and signal (if any) produced.
    Completed,
    /// Terminal failure.
    Failed(Arc<str>),
}

impl StepState {
    /// Whether the step reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed(_))
    }
}

impl Display for StepState {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => f.write_str("pending"),
            Self::Submitted => f.write_str("submitted"),
            Self::Waiting => f.write_str("waiting"),
            Self::Executing => f.write_str("executing"),
            Self::Completed => f.write_str("completed"),
            Self::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

/// Why a submission stopped.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecutionFailure {
    step: Option<usize>,
    code: i32,
    reason: Arc<str>,
}

impl ExecutionFailure {
    /// Create a failure attributed to `step` (if known).
    pub fn new(step: Option<usize>, code: i32, reason: impl Into<Arc<str>>) -> Self {
        Self {
            step,
            code,
            reason: reason.into(),
        }
    }

    /// Index of the failed step within its command list.
    pub fn step(&self) -> Option<usize> {
        self.step
    }

    /// Driver-style result code.
    pub fn code(&self) -> i32 {
        self.code
    }

    /// Human readable reason.
    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub(crate) fn reason_arc(&self) -> &Arc<str> {
        &self.reason
    }
}

impl Display for ExecutionFailure {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self.step {
            Some(step) => write!(
                f,
                "step {} failed with code {:#x}: {}",
                step, self.code, self.reason
            ),
            None => write!(f, "failed with code {:#x}: {}", self.code, self.reason),
        }
    }
}

impl std::error::Error for ExecutionFailure {}

/// Status of one submission as reported by [`Executor::poll`](crate::Executor::poll).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExecutionStatus {
    /// Still queued or running.
    Pending,
    /// Every step completed.
    Complete,
    /// A step failed; the rest of the list was abandoned.
    Failed(ExecutionFailure),
}
