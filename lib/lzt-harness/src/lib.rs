// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

#![doc = include_str!("../README.md")]
#![deny(missing_docs)]

pub mod chain;
pub mod config;
pub mod error;
pub mod executor;
pub mod handle;
pub mod logging;
pub mod memory;
pub mod pool;
pub mod status;

pub use chain::{ChainBuilder, ChainPhase, CommandList, Kernel, StepLocation, WorkItem, WorkPayload};
pub use config::{ChainConfig, ConfigError, ExecutorConfig, HarnessConfig, PoolConfig};
pub use error::{ChainError, PoolError, StalledStep, SubmitError, SyncError, WaitError};
pub use executor::{Executor, ExecutorTicket, QueueExecutor};
pub use handle::{Generation, MAX_POOL_CAPACITY, SyncHandle};
pub use memory::DeviceBuffer;
pub use pool::{SyncPool, SyncPrimitive};
pub use status::{ExecutionFailure, ExecutionStatus, StepState, SyncStatus, codes};
