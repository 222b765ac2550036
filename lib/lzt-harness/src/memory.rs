// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Host-visible allocations shared between executors and the test driver.

use std::sync::Arc;

use parking_lot::Mutex;

/// A shared, fixed-size byte allocation.
///
/// Clones alias the same storage, the way a device pointer does. Individual
/// calls are atomic with respect to each other, but nothing orders calls
/// made from different executors: that is the job of the sync handles.
#[derive(Clone, Debug)]
pub struct DeviceBuffer {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl DeviceBuffer {
    /// Allocate `size` zeroed bytes.
    pub fn allocate(size: usize) -> Self {
        Self {
            bytes: Arc::new(Mutex::new(vec![0; size])),
        }
    }

    /// Size in bytes.
    pub fn len(&self) -> usize {
        self.bytes.lock().len()
    }

    /// Whether the allocation is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `self` and `other` alias the same storage.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.bytes, &other.bytes)
    }

    /// Set every byte to `value`.
    pub fn fill(&self, value: u8) {
        self.bytes.lock().fill(value);
    }

    /// Copy the contents out.
    pub fn to_vec(&self) -> Vec<u8> {
        self.bytes.lock().clone()
    }

    /// Copy `dst.len()` bytes starting at `offset` into `dst`.
    ///
    /// # Panics
    /// If the range is out of bounds.
    pub fn read(&self, offset: usize, dst: &mut [u8]) {
        let bytes = self.bytes.lock();
        dst.copy_from_slice(&bytes[offset..offset + dst.len()]);
    }

    /// Copy `src` into the buffer starting at `offset`.
    ///
    /// # Panics
    /// If the range is out of bounds.
    pub fn write(&self, offset: usize, src: &[u8]) {
        let mut bytes = self.bytes.lock();
        bytes[offset..offset + src.len()].copy_from_slice(src);
    }

    /// Read a little-endian `u32` at `offset`.
    pub fn read_u32(&self, offset: usize) -> u32 {
        let mut word = [0u8; 4];
        self.read(offset, &mut word);
        u32::from_le_bytes(word)
    }

    /// Write a little-endian `u32` at `offset`.
    pub fn write_u32(&self, offset: usize, value: u32) {
        self.write(offset, &value.to_le_bytes());
    }

    /// Overwrite the buffer with `pattern, pattern+1, ...` (wrapping).
    pub fn write_data_pattern(&self, pattern: u8) {
        let mut bytes = self.bytes.lock();
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = pattern.wrapping_add(i as u8);
        }
    }

    /// Check the buffer against [`write_data_pattern`](Self::write_data_pattern).
    ///
    /// Returns the offset of the first mismatching byte.
    pub fn validate_data_pattern(&self, pattern: u8) -> Result<(), usize> {
        let bytes = self.bytes.lock();
        match bytes
            .iter()
            .enumerate()
            .find(|(i, byte)| **byte != pattern.wrapping_add(*i as u8))
        {
            Some((offset, _)) => Err(offset),
            None => Ok(()),
        }
    }

    /// Copy the whole of `src` into `self`.
    ///
    /// # Panics
    /// If `src` is larger than `self`.
    pub(crate) fn copy_from(&self, src: &DeviceBuffer) {
        if self.ptr_eq(src) {
            return;
        }
        let data = src.to_vec();
        self.write(0, &data);
    }
}
