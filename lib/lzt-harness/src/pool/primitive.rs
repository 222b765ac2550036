// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Per-slot primitive shared between the pool, executors and host waiters.
//!
//! All slot state (generation, occupancy, signal and poison) lives under one
//! `parking_lot::Mutex`. Waiters register with a `tokio::sync::Notify` before
//! inspecting the state, so a signal that lands between the check and the
//! await is never lost.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex as ParkingMutex;
use tokio::sync::Notify;

use crate::error::WaitError;
use crate::handle::{Generation, SyncHandle, next_generation};
use crate::status::SyncStatus;

#[derive(Debug, Default)]
struct SlotState {
    generation: Generation,
    occupied: bool,
    signaled: bool,
    poison: Option<Arc<str>>,
}

enum Observation {
    Pending,
    Signaled,
}

/// Owner-side slot reused across generations.
#[derive(Debug)]
pub(crate) struct PrimitiveSlot {
    index: u32,
    state: ParkingMutex<SlotState>,
    notify: Notify,
}

impl PrimitiveSlot {
    pub(crate) fn new(index: u32) -> Self {
        Self {
            index,
            state: ParkingMutex::new(SlotState::default()),
            notify: Notify::new(),
        }
    }

    pub(crate) fn index(&self) -> u32 {
        self.index
    }

    /// Start a new occupancy and return its generation.
    pub(crate) fn begin_generation(&self) -> Generation {
        let mut state = self.state.lock();
        debug_assert!(!state.occupied, "slot {} already occupied", self.index);
        state.generation = next_generation(state.generation);
        state.occupied = true;
        state.signaled = false;
        state.poison = None;
        state.generation
    }

    /// End the occupancy identified by `generation`, waking its waiters.
    ///
    /// Returns `false` when that generation is not the live one.
    pub(crate) fn end_generation(&self, generation: Generation) -> bool {
        {
            let mut state = self.state.lock();
            if !state.occupied || state.generation != generation {
                return false;
            }
            state.occupied = false;
            state.signaled = false;
            state.poison = None;
        }
        self.notify.notify_waiters();
        true
    }

    fn with_live<R>(
        &self,
        handle: SyncHandle,
        f: impl FnOnce(&mut SlotState) -> R,
    ) -> Result<R, WaitError> {
        let mut state = self.state.lock();
        if !state.occupied || state.generation != handle.generation() {
            return Err(WaitError::Stale { handle });
        }
        Ok(f(&mut state))
    }

    fn observe(&self, handle: SyncHandle) -> Result<Observation, WaitError> {
        let observed = self.with_live(handle, |state| match &state.poison {
            Some(reason) => Err(reason.clone()),
            None if state.signaled => Ok(Observation::Signaled),
            None => Ok(Observation::Pending),
        })?;
        observed.map_err(|reason| WaitError::Poisoned { handle, reason })
    }
}

/// A live handle bound to its slot's primitive.
///
/// Cheap to clone and `'static`, so it can be moved into executor tasks and
/// host threads. Every operation re-checks the generation: once the handle
/// is released the primitive reports [`WaitError::Stale`].
#[derive(Clone, Debug)]
pub struct SyncPrimitive {
    handle: SyncHandle,
    slot: Arc<PrimitiveSlot>,
}

impl SyncPrimitive {
    pub(crate) fn new(handle: SyncHandle, slot: Arc<PrimitiveSlot>) -> Self {
        debug_assert_eq!(handle.index(), slot.index());
        Self { handle, slot }
    }

    /// The handle this primitive is bound to.
    pub fn handle(&self) -> SyncHandle {
        self.handle
    }

    /// Mark the primitive signaled and wake every waiter.
    pub fn signal(&self) -> Result<(), WaitError> {
        self.slot.with_live(self.handle, |state| state.signaled = true)?;
        self.slot.notify.notify_waiters();
        Ok(())
    }

    /// Return the primitive to the not-ready state.
    pub fn reset(&self) -> Result<(), WaitError> {
        self.slot.with_live(self.handle, |state| {
            state.signaled = false;
            state.poison = None;
        })
    }

    /// Poison the primitive; current and future waiters fail with `reason`.
    pub fn poison(&self, reason: impl Into<Arc<str>>) -> Result<(), WaitError> {
        let reason = reason.into();
        self.slot
            .with_live(self.handle, |state| state.poison = Some(reason))?;
        self.slot.notify.notify_waiters();
        Ok(())
    }

    /// Non-blocking status query.
    pub fn status(&self) -> Result<SyncStatus, WaitError> {
        self.slot.with_live(self.handle, |state| {
            if state.poison.is_some() {
                SyncStatus::Poisoned
            } else if state.signaled {
                SyncStatus::Signaled
            } else {
                SyncStatus::NotReady
            }
        })
    }

    /// Wait until the primitive is signaled.
    pub async fn wait(&self) -> Result<(), WaitError> {
        loop {
            let notified = self.slot.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.slot.observe(self.handle)? {
                Observation::Signaled => return Ok(()),
                Observation::Pending => notified.await,
            }
        }
    }

    /// Wait until the primitive is signaled or `timeout` elapses.
    pub async fn wait_timeout(&self, timeout: Duration) -> Result<(), WaitError> {
        match tokio::time::timeout(timeout, self.wait()).await {
            Ok(result) => result,
            Err(_) => Err(WaitError::TimedOut {
                handle: self.handle,
                timeout,
            }),
        }
    }
}
