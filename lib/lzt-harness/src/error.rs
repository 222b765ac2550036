// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Error taxonomy.
//!
//! Every condition here is an ordinary result: exhaustion, stale handles and
//! timeouts are exactly the boundaries the conformance scenarios probe. The
//! only abort is a handle presented to a pool that did not issue it.

use std::fmt::{self, Display, Formatter};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::chain::StepLocation;
use crate::handle::SyncHandle;
use crate::status::{ExecutionFailure, StepState, codes};

/// Errors raised by [`SyncPool`](crate::SyncPool).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// Capacity outside `1..=MAX_POOL_CAPACITY`.
    #[error("sync pool capacity must be between 1 and {max}, got {requested}")]
    InvalidCapacity {
        /// Capacity asked for.
        requested: usize,
        /// Largest supported capacity.
        max: usize,
    },

    /// Not enough free slots for the request.
    #[error(
        "sync pool {pool} exhausted: {requested} requested, {available} of {capacity} slots free"
    )]
    PoolExhausted {
        /// Pool id.
        pool: u32,
        /// Total slots.
        capacity: usize,
        /// Free slots at the time of the request.
        available: usize,
        /// Slots requested.
        requested: usize,
    },

    /// Double release, stale handle, or a handle this pool never issued.
    #[error("unknown {handle}: released, stale or never issued")]
    UnknownHandle {
        /// The rejected handle.
        handle: SyncHandle,
    },

    /// The pool was shut down and no longer hands out slots.
    #[error("sync pool {pool} is shut down")]
    Shutdown {
        /// Pool id.
        pool: u32,
    },
}

/// Errors raised while recording a chain.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChainError {
    /// A chain needs at least one executor.
    #[error("executor count must be at least 1")]
    InvalidExecutorCount,

    /// Step addressed to an executor the chain does not have.
    #[error("executor index {index} out of range: chain has {count} executor(s)")]
    InvalidExecutorIndex {
        /// Requested executor.
        index: usize,
        /// Executors in the chain.
        count: usize,
    },

    /// A wait or signal handle is not live in the chain's pool.
    #[error("{location} references unknown {handle}")]
    UnknownHandle {
        /// The rejected handle.
        handle: SyncHandle,
        /// Step being recorded.
        location: StepLocation,
    },

    /// A step that would wait on its own signal.
    #[error("{location} signals {handle}, which it also waits on")]
    SelfWait {
        /// The duplicated handle.
        handle: SyncHandle,
        /// Step being recorded.
        location: StepLocation,
    },

    /// Release of a handle that unfinished steps still reference.
    #[error("{handle} is still referenced by {location}")]
    HandleInUse {
        /// The handle.
        handle: SyncHandle,
        /// First step referencing it.
        location: StepLocation,
    },

    /// Recording after `submit`.
    #[error("chain was already submitted; no further steps can be recorded")]
    AlreadySubmitted,

    /// Pool-level failure while acquiring or releasing through the chain.
    #[error(transparent)]
    Pool(#[from] PoolError),
}

/// Errors raised while handing command lists to executors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SubmitError {
    /// The executor slice does not match the chain's executor count.
    #[error("chain records {expected} executor(s) but {actual} were supplied")]
    ExecutorCountMismatch {
        /// Executors recorded in the chain.
        expected: usize,
        /// Executors supplied.
        actual: usize,
    },

    /// `submit` may only run once per chain.
    #[error("chain was already submitted")]
    AlreadySubmitted,

    /// Command lists must be closed before submission.
    #[error("command list for executor {executor} was not closed")]
    ListNotClosed {
        /// Executor owning the list.
        executor: usize,
    },

    /// The executor refused the list.
    #[error("executor {executor} rejected submission: {reason}")]
    Rejected {
        /// Executor that refused.
        executor: usize,
        /// Why.
        reason: Arc<str>,
    },
}

/// Errors raised by [`ChainBuilder::synchronize_all`](crate::ChainBuilder::synchronize_all).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// Nothing to wait for yet.
    #[error("chain has not been submitted")]
    NotSubmitted,

    /// The executor slice does not match the chain's executor count.
    #[error("chain records {expected} executor(s) but {actual} were supplied")]
    ExecutorCountMismatch {
        /// Executors recorded in the chain.
        expected: usize,
        /// Executors supplied.
        actual: usize,
    },

    /// The shared deadline elapsed before every executor completed.
    #[error("timed out after {timeout:?}{}", describe_stalled(.stalled))]
    Timeout {
        /// The timeout that elapsed.
        timeout: Duration,
        /// Steps that had not reached a terminal state.
        stalled: Vec<StalledStep>,
    },

    /// An executor reported a failed step.
    #[error("executor {executor} {failure}")]
    ExecutionFailed {
        /// Executor index within the chain.
        executor: usize,
        /// Failure details.
        failure: ExecutionFailure,
    },
}

impl SyncError {
    /// Result code of an execution failure.
    pub fn code(&self) -> Option<i32> {
        match self {
            Self::ExecutionFailed { failure, .. } => Some(failure.code()),
            Self::Timeout { .. } => Some(codes::WAIT_TIMED_OUT),
            Self::NotSubmitted | Self::ExecutorCountMismatch { .. } => None,
        }
    }
}

/// Errors raised by host-side and executor-side waits on a primitive.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WaitError {
    /// The handle was released; its slot belongs to a newer generation.
    #[error("{handle} is stale: its slot was released")]
    Stale {
        /// The stale handle.
        handle: SyncHandle,
    },

    /// The primitive was poisoned.
    #[error("{handle} poisoned: {reason}")]
    Poisoned {
        /// The poisoned handle.
        handle: SyncHandle,
        /// Poison reason.
        reason: Arc<str>,
    },

    /// A bounded wait elapsed.
    #[error("timed out after {timeout:?} waiting on {handle}")]
    TimedOut {
        /// Handle waited on.
        handle: SyncHandle,
        /// The timeout that elapsed.
        timeout: Duration,
    },

    /// Handle lookup failed.
    #[error(transparent)]
    Pool(#[from] PoolError),
}

impl WaitError {
    /// Result code an executor reports when a step fails with this error.
    pub fn code(&self) -> i32 {
        match self {
            Self::Poisoned { .. } => codes::DEPENDENCY_POISONED,
            Self::TimedOut { .. } => codes::WAIT_TIMED_OUT,
            Self::Stale { .. } | Self::Pool(_) => codes::STALE_HANDLE,
        }
    }
}

/// A step left unfinished when a synchronization timed out.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StalledStep {
    /// Where the step lives.
    pub location: StepLocation,
    /// State at the time of the timeout.
    pub state: StepState,
    /// Handles the step waits on.
    pub waits: Vec<SyncHandle>,
}

impl Display for StalledStep {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.location, self.state)?;
        if !self.waits.is_empty() {
            f.write_str(" on [")?;
            for (idx, handle) in self.waits.iter().enumerate() {
                if idx > 0 {
                    f.write_str(", ")?;
                }
                write!(f, "{handle}")?;
            }
            f.write_str("]")?;
        }
        Ok(())
    }
}

fn describe_stalled(stalled: &[StalledStep]) -> String {
    if stalled.is_empty() {
        return String::new();
    }
    let mut message = format!("; {} stalled step(s):", stalled.len());
    for step in stalled {
        message.push_str("\n  ");
        message.push_str(&step.to_string());
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_lists_stalled_steps() {
        let waited = SyncHandle::new(1, 0, 1);
        let err = SyncError::Timeout {
            timeout: Duration::from_millis(100),
            stalled: vec![StalledStep {
                location: StepLocation::new(1, 0),
                state: StepState::Waiting,
                waits: vec![waited],
            }],
        };
        let msg = err.to_string();
        assert!(msg.contains("100ms"));
        assert!(msg.contains("executor 1 step 0 (waiting)"));
        assert!(msg.contains(&waited.to_string()));
        assert_eq!(err.code(), Some(codes::WAIT_TIMED_OUT));
    }

    #[test]
    fn unknown_handle_message_names_handle() {
        let handle = SyncHandle::new(4, 2, 9);
        let err = ChainError::UnknownHandle {
            handle,
            location: StepLocation::new(0, 3),
        };
        let msg = err.to_string();
        assert!(msg.contains("executor 0 step 3"));
        assert!(msg.contains("index=2"));
        assert!(msg.contains("generation=9"));
    }

    #[test]
    fn wait_error_codes() {
        let handle = SyncHandle::new(1, 1, 1);
        assert_eq!(
            WaitError::Poisoned {
                handle,
                reason: "x".into()
            }
            .code(),
            codes::DEPENDENCY_POISONED
        );
        assert_eq!(WaitError::Stale { handle }.code(), codes::STALE_HANDLE);
    }
}
