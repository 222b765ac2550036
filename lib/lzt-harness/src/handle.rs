// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Sync handle encoded in a single `u64` value.

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};

/// Alias for slot generation counters.
pub type Generation = u32;

const POOL_BITS: u32 = 24;
const INDEX_BITS: u32 = 16;
const GENERATION_BITS: u32 = 24;

const INDEX_SHIFT: u32 = GENERATION_BITS;
const POOL_SHIFT: u32 = INDEX_SHIFT + INDEX_BITS;

const POOL_MASK: u64 = ((1u64 << POOL_BITS) - 1) << POOL_SHIFT;
const INDEX_MASK: u64 = ((1u64 << INDEX_BITS) - 1) << INDEX_SHIFT;
const GENERATION_MASK: u64 = (1u64 << GENERATION_BITS) - 1;

/// Largest pool id representable in a handle.
pub(crate) const MAX_POOL_ID: u32 = (1 << POOL_BITS) - 1;

/// Largest generation representable in a handle. Generations wrap back to 1.
pub(crate) const MAX_GENERATION: Generation = (1 << GENERATION_BITS) - 1;

/// Number of slots addressable by a handle.
pub const MAX_POOL_CAPACITY: usize = 1 << INDEX_BITS;

/// Opaque reference to one slot of a [`SyncPool`](crate::SyncPool).
///
/// Layout (MSB to LSB): `[pool_id: 24 bits][index: 16 bits][generation: 24 bits]`
///
/// The handle carries no state. A handle is live only between the `acquire`
/// that produced it and the matching `release`; afterwards the slot's
/// generation moves on and the old value is rejected everywhere.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SyncHandle(u64);

impl SyncHandle {
    pub(crate) fn new(pool_id: u32, index: u32, generation: Generation) -> Self {
        debug_assert!(pool_id <= MAX_POOL_ID);
        debug_assert!((index as usize) < MAX_POOL_CAPACITY);
        debug_assert!(generation <= MAX_GENERATION);
        let raw = ((pool_id as u64) << POOL_SHIFT)
            | ((index as u64) << INDEX_SHIFT)
            | (generation as u64);
        Self(raw)
    }

    /// Reconstruct a handle from its raw representation.
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Return the raw representation.
    pub fn raw(&self) -> u64 {
        self.0
    }

    /// Id of the pool that issued this handle.
    pub fn pool_id(&self) -> u32 {
        ((self.0 & POOL_MASK) >> POOL_SHIFT) as u32
    }

    /// Slot index inside the issuing pool.
    pub fn index(&self) -> u32 {
        ((self.0 & INDEX_MASK) >> INDEX_SHIFT) as u32
    }

    /// Generation of the slot at the time the handle was issued.
    pub fn generation(&self) -> Generation {
        (self.0 & GENERATION_MASK) as Generation
    }
}

impl Display for SyncHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SyncHandle(pool={}, index={}, generation={})",
            self.pool_id(),
            self.index(),
            self.generation()
        )
    }
}

/// Advance a generation counter, skipping zero on wrap-around.
pub(crate) fn next_generation(current: Generation) -> Generation {
    if current >= MAX_GENERATION {
        1
    } else {
        current + 1
    }
}
