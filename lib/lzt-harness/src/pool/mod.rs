// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Fixed-capacity pool of synchronization primitives.

mod primitive;

pub use primitive::SyncPrimitive;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::config::PoolConfig;
use crate::error::{PoolError, WaitError};
use crate::handle::{MAX_POOL_CAPACITY, MAX_POOL_ID, SyncHandle};
use crate::status::SyncStatus;
use primitive::PrimitiveSlot;

static NEXT_POOL_ID: AtomicU32 = AtomicU32::new(1);

fn allocate_pool_id() -> u32 {
    NEXT_POOL_ID
        .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |id| {
            Some(if id >= MAX_POOL_ID { 1 } else { id + 1 })
        })
        .unwrap_or_else(|id| id)
}

#[derive(Debug)]
struct Slot {
    occupant: Option<SyncHandle>,
    primitive: Arc<PrimitiveSlot>,
}

/// Fixed-capacity allocator of sync handles.
///
/// Slots are handed out lowest-index first, which keeps handle indices
/// reproducible across runs. Each slot carries a generation counter so that
/// a handle released and then reissued under the same index is told apart
/// from its successor.
///
/// Handles presented to a pool that did not issue them are a logic error and
/// panic; every other misuse is reported as a [`PoolError`].
#[derive(Debug)]
pub struct SyncPool {
    id: u32,
    slots: Vec<Slot>,
    free: BTreeSet<u32>,
    in_use: usize,
    shutdown: bool,
}

impl SyncPool {
    /// Create a pool with `capacity` slots.
    pub fn create(capacity: usize) -> Result<Self, PoolError> {
        if capacity == 0 || capacity > MAX_POOL_CAPACITY {
            return Err(PoolError::InvalidCapacity {
                requested: capacity,
                max: MAX_POOL_CAPACITY,
            });
        }

        let id = allocate_pool_id();
        let slots = (0..capacity as u32)
            .map(|index| Slot {
                occupant: None,
                primitive: Arc::new(PrimitiveSlot::new(index)),
            })
            .collect();
        debug!(pool = id, capacity, "created sync pool");

        Ok(Self {
            id,
            slots,
            free: (0..capacity as u32).collect(),
            in_use: 0,
            shutdown: false,
        })
    }

    /// Create a pool sized by [`PoolConfig::default`].
    pub fn with_default_capacity() -> Self {
        match Self::from_config(&PoolConfig::default()) {
            Ok(pool) => pool,
            Err(err) => unreachable!("default pool capacity is valid: {err}"),
        }
    }

    /// Create a pool sized by `config`.
    pub fn from_config(config: &PoolConfig) -> Result<Self, PoolError> {
        Self::create(config.default_capacity)
    }

    /// Process-unique id embedded in every handle this pool issues.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Total number of slots.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Slots currently occupied.
    pub fn in_use(&self) -> usize {
        self.in_use
    }

    /// Slots currently free.
    pub fn available(&self) -> usize {
        if self.shutdown { 0 } else { self.free.len() }
    }

    /// Whether [`shutdown`](Self::shutdown) has run.
    pub fn is_shutdown(&self) -> bool {
        self.shutdown
    }

    /// Occupy the lowest-index free slot.
    pub fn acquire(&mut self) -> Result<SyncHandle, PoolError> {
        self.ensure_open()?;
        let Some(index) = self.free.pop_first() else {
            return Err(self.exhausted(1));
        };
        Ok(self.occupy(index))
    }

    /// Occupy `count` slots at once, lowest indices first.
    ///
    /// Nothing is acquired unless all `count` slots are available.
    pub fn acquire_many(&mut self, count: usize) -> Result<Vec<SyncHandle>, PoolError> {
        self.ensure_open()?;
        if count > self.free.len() {
            return Err(self.exhausted(count));
        }
        let indices: Vec<u32> = self.free.iter().take(count).copied().collect();
        Ok(indices
            .into_iter()
            .map(|index| {
                self.free.remove(&index);
                self.occupy(index)
            })
            .collect())
    }

    /// Free the slot bound to `handle`.
    ///
    /// Waiters of the released generation wake with [`WaitError::Stale`].
    ///
    /// # Panics
    /// If `handle` was issued by a different pool.
    pub fn release(&mut self, handle: SyncHandle) -> Result<(), PoolError> {
        self.assert_owned(handle);
        let slot = self
            .slots
            .get_mut(handle.index() as usize)
            .filter(|slot| slot.occupant == Some(handle))
            .ok_or(PoolError::UnknownHandle { handle })?;

        slot.occupant = None;
        let ended = slot.primitive.end_generation(handle.generation());
        debug_assert!(ended, "pool and primitive disagree on {handle}");
        self.free.insert(handle.index());
        self.in_use -= 1;
        trace!(pool = self.id, index = handle.index(), generation = handle.generation(), "released sync handle");
        Ok(())
    }

    /// Release every handle in order, stopping at the first failure.
    pub fn release_all(
        &mut self,
        handles: impl IntoIterator<Item = SyncHandle>,
    ) -> Result<(), PoolError> {
        for handle in handles {
            self.release(handle)?;
        }
        Ok(())
    }

    /// Whether `handle` is live in this pool.
    pub fn contains(&self, handle: SyncHandle) -> bool {
        handle.pool_id() == self.id
            && self
                .slots
                .get(handle.index() as usize)
                .is_some_and(|slot| slot.occupant == Some(handle))
    }

    /// Bind `handle` to its primitive for use by executors and host threads.
    ///
    /// # Panics
    /// If `handle` was issued by a different pool.
    pub fn primitive(&self, handle: SyncHandle) -> Result<SyncPrimitive, PoolError> {
        self.assert_owned(handle);
        self.bind(handle)
    }

    /// Like [`primitive`](Self::primitive), but a foreign handle is reported
    /// as unknown. Handle equality covers the pool id.
    fn bind(&self, handle: SyncHandle) -> Result<SyncPrimitive, PoolError> {
        self.slots
            .get(handle.index() as usize)
            .filter(|slot| slot.occupant == Some(handle))
            .map(|slot| SyncPrimitive::new(handle, slot.primitive.clone()))
            .ok_or(PoolError::UnknownHandle { handle })
    }

    /// Signal `handle` from the host.
    ///
    /// The host operations report a handle from another pool as
    /// [`PoolError::UnknownHandle`] instead of panicking.
    pub fn host_signal(&self, handle: SyncHandle) -> Result<(), WaitError> {
        self.bind(handle)?.signal()
    }

    /// Reset `handle` to not-ready from the host.
    pub fn host_reset(&self, handle: SyncHandle) -> Result<(), WaitError> {
        self.bind(handle)?.reset()
    }

    /// Query the status of `handle` without blocking.
    pub fn query_status(&self, handle: SyncHandle) -> Result<SyncStatus, WaitError> {
        self.bind(handle)?.status()
    }

    /// Block the calling task until `handle` is signaled or `timeout` elapses.
    pub async fn host_synchronize(
        &self,
        handle: SyncHandle,
        timeout: Duration,
    ) -> Result<(), WaitError> {
        let primitive = self.bind(handle)?;
        primitive.wait_timeout(timeout).await
    }

    /// Tear the pool down.
    ///
    /// Every outstanding primitive is poisoned with `reason`, waking its
    /// waiters, and its slot is reclaimed. Later acquisitions fail with
    /// [`PoolError::Shutdown`]. Returns the number of handles reclaimed.
    pub fn shutdown(&mut self, reason: impl Into<Arc<str>>) -> usize {
        let reason: Arc<str> = reason.into();
        let mut reclaimed = 0;
        for slot in &mut self.slots {
            let Some(handle) = slot.occupant.take() else {
                continue;
            };
            let primitive = SyncPrimitive::new(handle, slot.primitive.clone());
            if let Err(err) = primitive.poison(Arc::clone(&reason)) {
                warn!(pool = self.id, %handle, %err, "failed to poison outstanding handle");
            }
            self.free.insert(handle.index());
            reclaimed += 1;
        }
        self.in_use = 0;
        if !self.shutdown {
            debug!(pool = self.id, reclaimed, reason = %reason, "sync pool shut down");
        }
        self.shutdown = true;
        reclaimed
    }

    fn occupy(&mut self, index: u32) -> SyncHandle {
        let slot = &mut self.slots[index as usize];
        let generation = slot.primitive.begin_generation();
        let handle = SyncHandle::new(self.id, index, generation);
        slot.occupant = Some(handle);
        self.in_use += 1;
        trace!(pool = self.id, index, generation, "acquired sync handle");
        handle
    }

    fn ensure_open(&self) -> Result<(), PoolError> {
        if self.shutdown {
            return Err(PoolError::Shutdown { pool: self.id });
        }
        Ok(())
    }

    fn exhausted(&self, requested: usize) -> PoolError {
        PoolError::PoolExhausted {
            pool: self.id,
            capacity: self.capacity(),
            available: self.free.len(),
            requested,
        }
    }

    pub(crate) fn assert_owned(&self, handle: SyncHandle) {
        assert!(
            handle.pool_id() == self.id,
            "{handle} belongs to sync pool {}, not sync pool {}",
            handle.pool_id(),
            self.id
        );
    }
}

impl Drop for SyncPool {
    fn drop(&mut self) {
        if self.in_use > 0 {
            warn!(
                pool = self.id,
                outstanding = self.in_use,
                "sync pool dropped with outstanding handles"
            );
            self.shutdown("sync pool dropped with outstanding handles");
        }
    }
}
