// Licensed under the Apache-2.0 license

//! Hardware key-context slot pool.
//!
//! Every slot carries a reference count. A contiguous reservation records its
//! length at the base slot as `run_length = count - 1`; every other slot of
//! the run keeps `run_length == 0`.
//!
//! In shared-hardware mode the device owns slot allocation. The pool still
//! tracks local reference counts, but fresh slots come from (and fully
//! released slots go back to) the device-side allocator through the
//! callbacks handed to [`ContextPool::request`] and [`ContextPool::release`].

use crate::error::{Error, Result};
use alloc::vec;
use alloc::vec::Vec;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct Slot {
    ref_count: u32,
    run_length: usize,
}

pub struct ContextPool {
    slots: Vec<Slot>,
    shared: bool,
}

impl ContextPool {
    #[must_use]
    pub fn new(size: usize, shared: bool) -> Self {
        Self {
            slots: vec![Slot::default(); size],
            shared,
        }
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub const fn is_shared(&self) -> bool {
        self.shared
    }

    /// Reference count of `slot`, or `None` when out of range.
    #[must_use]
    pub fn ref_count(&self, slot: usize) -> Option<u32> {
        self.slots.get(slot).map(|s| s.ref_count)
    }

    /// Recorded run length at `slot` (non-zero only at a run's base).
    #[must_use]
    pub fn run_length(&self, slot: usize) -> Option<usize> {
        self.slots.get(slot).map(|s| s.run_length)
    }

    /// Number of slots with a non-zero reference count.
    #[must_use]
    pub fn in_use(&self) -> usize {
        self.slots.iter().filter(|s| s.ref_count > 0).count()
    }

    /// Reserve `contiguous` slots.
    ///
    /// With `ctx_id == Some(base)` the existing reservation at `base` gains a
    /// reference, provided its recorded run matches `contiguous`. With `None`
    /// the lowest-indexed free run is taken, or in shared mode the slot
    /// granted by `shared_request`.
    ///
    /// # Errors
    /// - `InvalidSize` if `contiguous` is zero, larger than the pool, or above
    ///   one in shared mode
    /// - `InvalidContext` if `base` (or the run past it) is out of range
    /// - `RunLengthMismatch` if the run at `base` has a different length
    /// - `NoFreeContext` if no free run of the requested length exists
    /// - whatever `shared_request` reports
    pub fn request<F>(
        &mut self,
        ctx_id: Option<usize>,
        contiguous: usize,
        shared_request: F,
    ) -> Result<usize>
    where
        F: FnOnce() -> Result<usize>,
    {
        if contiguous == 0 || contiguous > self.slots.len() {
            return Err(Error::InvalidSize);
        }
        if self.shared && contiguous > 1 {
            return Err(Error::InvalidSize);
        }

        match ctx_id {
            Some(base) => {
                let slot = self.slots.get(base).ok_or(Error::InvalidContext)?;
                if slot.run_length != contiguous - 1 {
                    return Err(Error::RunLengthMismatch);
                }
                let run = self
                    .slots
                    .get_mut(base..base + contiguous)
                    .ok_or(Error::InvalidContext)?;
                for s in run {
                    s.ref_count += 1;
                }
                Ok(base)
            }
            None if self.shared => {
                let granted = shared_request()?;
                let slot = self.slots.get_mut(granted).ok_or_else(|| {
                    log::error!("device granted context {granted} outside the pool");
                    Error::InvalidContext
                })?;
                slot.ref_count += 1;
                slot.run_length = 0;
                Ok(granted)
            }
            None => {
                let base = self.find_free_run(contiguous).ok_or(Error::NoFreeContext)?;
                let run = self
                    .slots
                    .get_mut(base..base + contiguous)
                    .ok_or(Error::InvalidContext)?;
                for s in run.iter_mut() {
                    s.ref_count += 1;
                }
                if let Some(first) = run.first_mut() {
                    first.run_length = contiguous - 1;
                }
                Ok(base)
            }
        }
    }

    fn find_free_run(&self, contiguous: usize) -> Option<usize> {
        let mut start = 0;
        let mut len = 0;
        for (i, slot) in self.slots.iter().enumerate() {
            if slot.ref_count == 0 {
                if len == 0 {
                    start = i;
                }
                len += 1;
                if len == contiguous {
                    return Some(start);
                }
            } else {
                len = 0;
            }
        }
        None
    }

    /// Drop one reference from the run recorded at `slot`.
    ///
    /// Counts are clamped at zero. When the base reaches zero its run length
    /// is cleared. In shared mode the last reference is handed back through
    /// `shared_release` first, and the pool is left untouched if that fails.
    ///
    /// # Errors
    /// `InvalidContext` if `slot` is out of range or not held, otherwise
    /// whatever `shared_release` reports.
    pub fn release<F>(&mut self, slot: usize, shared_release: F) -> Result<()>
    where
        F: FnOnce(usize) -> Result<()>,
    {
        let base = self.slots.get(slot).copied().ok_or(Error::InvalidContext)?;
        if base.ref_count == 0 {
            return Err(Error::InvalidContext);
        }
        let end = slot
            .checked_add(base.run_length)
            .filter(|&end| end < self.slots.len())
            .ok_or(Error::InvalidContext)?;
        if self.shared && base.ref_count == 1 {
            shared_release(slot)?;
        }

        let run = self.slots.get_mut(slot..=end).ok_or(Error::InvalidContext)?;
        for s in run.iter_mut() {
            s.ref_count = s.ref_count.saturating_sub(1);
        }
        if let Some(first) = run.first_mut().filter(|first| first.ref_count == 0) {
            first.run_length = 0;
        }
        Ok(())
    }

    /// Forget every reservation.
    pub fn reset(&mut self) {
        self.slots.fill(Slot::default());
    }
}
