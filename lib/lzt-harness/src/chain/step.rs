// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Recorded steps and the per-executor command lists that carry them.

use std::any::Any;
use std::fmt::{self, Debug, Display, Formatter};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::memory::DeviceBuffer;
use crate::pool::SyncPrimitive;
use crate::status::{ExecutionFailure, StepState, codes};

/// Address of one step: executor index within the chain and position in
/// that executor's command list.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StepLocation {
    /// Executor index.
    pub executor: usize,
    /// Position in the executor's list.
    pub step: usize,
}

impl StepLocation {
    /// Create a location.
    pub fn new(executor: usize, step: usize) -> Self {
        Self { executor, step }
    }
}

impl Display for StepLocation {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "executor {} step {}", self.executor, self.step)
    }
}

type KernelFn = dyn Fn() -> Result<(), i32> + Send + Sync;

/// A named host closure standing in for a kernel dispatch.
///
/// `Err(code)` is reported as the step's result code.
#[derive(Clone)]
pub struct Kernel {
    name: Arc<str>,
    entry: Arc<KernelFn>,
}

impl Kernel {
    /// Wrap `entry` under `name`.
    pub fn new(
        name: impl Into<Arc<str>>,
        entry: impl Fn() -> Result<(), i32> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            entry: Arc::new(entry),
        }
    }

    /// Kernel name, used in logs and failures.
    pub fn name(&self) -> &str {
        &self.name
    }

    fn launch(&self) -> Result<(), i32> {
        (self.entry)()
    }
}

impl Debug for Kernel {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Kernel").field("name", &self.name).finish()
    }
}

/// The work a step performs once its waits are satisfied.
#[derive(Clone, Debug)]
pub enum WorkPayload {
    /// Set every byte of `buffer` to `value`.
    Fill {
        /// Target.
        buffer: DeviceBuffer,
        /// Byte value.
        value: u8,
    },
    /// Copy all of `src` into the front of `dst`.
    Copy {
        /// Source.
        src: DeviceBuffer,
        /// Destination, at least as large as `src`.
        dst: DeviceBuffer,
    },
    /// Add `value` to the little-endian `u32` at offset 0.
    ///
    /// The read and the write are separate accesses with a yield in between,
    /// so two accumulations that are not ordered by a handle can lose an
    /// update.
    Accumulate {
        /// Counter buffer, at least 4 bytes.
        buffer: DeviceBuffer,
        /// Increment.
        value: u32,
    },
    /// Run a host closure.
    Kernel(Kernel),
    /// No work.
    Barrier,
}

impl WorkPayload {
    /// Shorthand for [`WorkPayload::Kernel`].
    pub fn kernel(
        name: impl Into<Arc<str>>,
        entry: impl Fn() -> Result<(), i32> + Send + Sync + 'static,
    ) -> Self {
        Self::Kernel(Kernel::new(name, entry))
    }

    fn name(&self) -> &str {
        match self {
            Self::Fill { .. } => "fill",
            Self::Copy { .. } => "copy",
            Self::Accumulate { .. } => "accumulate",
            Self::Kernel(kernel) => kernel.name(),
            Self::Barrier => "barrier",
        }
    }

    async fn execute(&self, step: usize) -> Result<(), ExecutionFailure> {
        match self {
            Self::Fill { buffer, value } => buffer.fill(*value),
            Self::Copy { src, dst } => {
                if src.len() > dst.len() {
                    return Err(ExecutionFailure::new(
                        Some(step),
                        codes::INVALID_PAYLOAD,
                        format!(
                            "copy of {} bytes into a {} byte buffer",
                            src.len(),
                            dst.len()
                        ),
                    ));
                }
                dst.copy_from(src);
            }
            Self::Accumulate { buffer, value } => {
                if buffer.len() < 4 {
                    return Err(ExecutionFailure::new(
                        Some(step),
                        codes::INVALID_PAYLOAD,
                        format!("accumulate into a {} byte buffer", buffer.len()),
                    ));
                }
                let current = buffer.read_u32(0);
                tokio::task::yield_now().await;
                buffer.write_u32(0, current.wrapping_add(*value));
            }
            Self::Kernel(kernel) => kernel.launch().map_err(|code| {
                ExecutionFailure::new(
                    Some(step),
                    code,
                    format!("kernel '{}' returned {code:#x}", kernel.name()),
                )
            })?,
            Self::Barrier => {}
        }
        Ok(())
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

pub(crate) type StepCell = Arc<Mutex<StepState>>;

/// One unit of work bound to an executor.
///
/// The state cell is shared with the [`ChainBuilder`](crate::ChainBuilder)
/// that recorded the item, so progress is observable while the executor
/// runs it.
#[derive(Debug)]
pub struct WorkItem {
    location: StepLocation,
    waits: Vec<SyncPrimitive>,
    payload: WorkPayload,
    signal: Option<SyncPrimitive>,
    state: StepCell,
}

impl WorkItem {
    pub(crate) fn new(
        location: StepLocation,
        waits: Vec<SyncPrimitive>,
        payload: WorkPayload,
        signal: Option<SyncPrimitive>,
    ) -> Self {
        Self {
            location,
            waits,
            payload,
            signal,
            state: Arc::new(Mutex::new(StepState::Pending)),
        }
    }

    /// Where the item was recorded.
    pub fn location(&self) -> StepLocation {
        self.location
    }

    /// Primitives waited on before the payload runs.
    pub fn waits(&self) -> &[SyncPrimitive] {
        &self.waits
    }

    /// The payload.
    pub fn payload(&self) -> &WorkPayload {
        &self.payload
    }

    /// Primitive signaled after the payload completes.
    pub fn signal(&self) -> Option<&SyncPrimitive> {
        self.signal.as_ref()
    }

    /// Current state.
    pub fn state(&self) -> StepState {
        self.state.lock().clone()
    }

    pub(crate) fn state_cell(&self) -> StepCell {
        Arc::clone(&self.state)
    }

    /// Move the item to `next`.
    pub fn transition(&self, next: StepState) {
        let mut state = self.state.lock();
        debug!(location = %self.location, from = %*state, to = %next, "step transition");
        *state = next;
    }

    /// Wait, execute the payload, then signal.
    ///
    /// On error the item is left in its last non-terminal state; the caller
    /// decides whether to [`fail`](Self::fail) it.
    pub async fn run(&self) -> Result<(), ExecutionFailure> {
        let step = self.location.step;
        if !self.waits.is_empty() {
            self.transition(StepState::Waiting);
            for primitive in &self.waits {
                primitive.wait().await.map_err(|err| {
                    ExecutionFailure::new(Some(step), err.code(), err.to_string())
                })?;
            }
        }

        self.transition(StepState::Executing);
        debug!(location = %self.location, payload = self.payload.name(), "executing payload");
        AssertUnwindSafe(self.payload.execute(step))
            .catch_unwind()
            .await
            .map_err(|panic| {
                ExecutionFailure::new(
                    Some(step),
                    codes::PAYLOAD_PANICKED,
                    format!(
                        "payload '{}' panicked: {}",
                        self.payload.name(),
                        panic_message(&*panic)
                    ),
                )
            })??;

        if let Some(signal) = &self.signal {
            signal.signal().map_err(|err| {
                ExecutionFailure::new(Some(step), err.code(), err.to_string())
            })?;
        }
        self.transition(StepState::Completed);
        Ok(())
    }

    /// Mark the item failed and poison its signal so dependants fail too.
    pub fn fail(&self, failure: &ExecutionFailure) {
        self.transition(StepState::Failed(Arc::clone(failure.reason_arc())));
        if let Some(signal) = &self.signal {
            let reason = format!("{}: {}", self.location, failure.reason());
            if let Err(err) = signal.poison(reason) {
                warn!(location = %self.location, %err, "could not poison signal of failed step");
            }
        }
    }
}

/// The recorded step sequence of one executor.
///
/// Executors only accept closed lists.
#[derive(Debug)]
pub struct CommandList {
    executor: usize,
    items: Vec<WorkItem>,
    closed: bool,
}

impl CommandList {
    pub(crate) fn new(executor: usize) -> Self {
        Self {
            executor,
            items: Vec::new(),
            closed: false,
        }
    }

    /// Executor index the list was recorded for.
    pub fn executor(&self) -> usize {
        self.executor
    }

    /// Finalize the list; no further items may be appended.
    pub fn close(&mut self) {
        self.closed = true;
    }

    /// Whether [`close`](Self::close) was called.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Number of items.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the list holds no items.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Items in program order.
    pub fn items(&self) -> &[WorkItem] {
        &self.items
    }

    pub(crate) fn push(&mut self, item: WorkItem) {
        debug_assert!(!self.closed, "push onto a closed command list");
        self.items.push(item);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SyncPool;
    use crate::error::WaitError;
    use anyhow::Result;

    #[tokio::test]
    async fn run_signals_after_payload() -> Result<()> {
        let mut pool = SyncPool::create(2)?;
        let gate = pool.acquire()?;
        let done = pool.acquire()?;
        let buffer = DeviceBuffer::allocate(4);

        let item = WorkItem::new(
            StepLocation::new(0, 0),
            vec![pool.primitive(gate)?],
            WorkPayload::Fill {
                buffer: buffer.clone(),
                value: 9,
            },
            Some(pool.primitive(done)?),
        );
        assert_eq!(item.state(), StepState::Pending);

        pool.host_signal(gate)?;
        item.run().await?;
        assert_eq!(item.state(), StepState::Completed);
        assert_eq!(buffer.to_vec(), vec![9; 4]);
        assert_eq!(pool.query_status(done)?, crate::SyncStatus::Signaled);
        Ok(())
    }

    #[tokio::test]
    async fn kernel_error_code_is_reported() -> Result<()> {
        let item = WorkItem::new(
            StepLocation::new(1, 3),
            Vec::new(),
            WorkPayload::kernel("faulty", || Err(0x78)),
            None,
        );
        let failure = item.run().await.unwrap_err();
        assert_eq!(failure.step(), Some(3));
        assert_eq!(failure.code(), 0x78);
        assert!(failure.reason().contains("faulty"));
        assert_eq!(item.state(), StepState::Executing);
        Ok(())
    }

    #[tokio::test]
    async fn fail_poisons_signal() -> Result<()> {
        let mut pool = SyncPool::create(1)?;
        let handle = pool.acquire()?;
        let item = WorkItem::new(
            StepLocation::new(0, 0),
            Vec::new(),
            WorkPayload::Barrier,
            Some(pool.primitive(handle)?),
        );

        item.fail(&ExecutionFailure::new(Some(0), 1, "boom"));
        assert!(matches!(item.state(), StepState::Failed(reason) if &*reason == "boom"));
        match pool.host_synchronize(handle, std::time::Duration::from_millis(10)).await {
            Err(WaitError::Poisoned { reason, .. }) => {
                assert!(reason.contains("executor 0 step 0"))
            }
            other => panic!("expected poison, got {other:?}"),
        }
        Ok(())
    }

    #[tokio::test]
    async fn panicking_kernel_becomes_failure() -> Result<()> {
        let short = DeviceBuffer::allocate(2);
        let item = WorkItem::new(
            StepLocation::new(0, 2),
            Vec::new(),
            WorkPayload::kernel("overrun", move || {
                short.read_u32(0);
                Ok(())
            }),
            None,
        );
        let failure = item.run().await.unwrap_err();
        assert_eq!(failure.step(), Some(2));
        assert_eq!(failure.code(), codes::PAYLOAD_PANICKED);
        assert!(failure.reason().contains("overrun"));
        assert_eq!(item.state(), StepState::Executing);

        let boxed: Box<dyn Any + Send> = Box::new(String::from("formatted"));
        assert_eq!(panic_message(&*boxed), "formatted");
        Ok(())
    }

    #[tokio::test]
    async fn list_accessors_reflect_recording() -> Result<()> {
        let mut pool = SyncPool::create(2)?;
        let gate = pool.acquire()?;
        let done = pool.acquire()?;

        let mut list = CommandList::new(4);
        assert!(list.is_empty());
        list.push(WorkItem::new(
            StepLocation::new(4, 0),
            vec![pool.primitive(gate)?],
            WorkPayload::Barrier,
            Some(pool.primitive(done)?),
        ));
        list.close();
        assert!(!list.is_empty());
        assert!(list.is_closed());
        assert_eq!(list.executor(), 4);

        let item = &list.items()[0];
        assert_eq!(
            item.waits().iter().map(SyncPrimitive::handle).collect::<Vec<_>>(),
            vec![gate]
        );
        assert!(matches!(item.payload(), WorkPayload::Barrier));
        assert_eq!(item.signal().map(SyncPrimitive::handle), Some(done));
        Ok(())
    }

    #[tokio::test]
    async fn oversized_copy_is_rejected() {
        let item = WorkItem::new(
            StepLocation::new(0, 0),
            Vec::new(),
            WorkPayload::Copy {
                src: DeviceBuffer::allocate(8),
                dst: DeviceBuffer::allocate(4),
            },
            None,
        );
        let failure = item.run().await.unwrap_err();
        assert_eq!(failure.code(), codes::INVALID_PAYLOAD);
    }
}
