// Licensed under the Apache-2.0 license

//! Write-through cache over the job submission registers.
//!
//! Consecutive jobs usually share most of their length/offset fields, so
//! remembering the last value written to each submission register lets the
//! driver skip writes that would not change anything.

use crate::hal::RegisterIo;
use crate::regs::{CACHE_FIRST, CACHE_LAST};

const SLOTS: usize = ((CACHE_LAST - CACHE_FIRST) / 4 + 1) as usize;

#[derive(Debug, Clone)]
pub struct WriteCache {
    enabled: bool,
    shadow: [Option<u32>; SLOTS],
    skipped: u64,
}

impl WriteCache {
    #[must_use]
    pub const fn new(enabled: bool) -> Self {
        Self {
            enabled,
            shadow: [None; SLOTS],
            skipped: 0,
        }
    }

    fn slot(offset: u32) -> Option<usize> {
        if (CACHE_FIRST..=CACHE_LAST).contains(&offset) && offset % 4 == 0 {
            usize::try_from((offset - CACHE_FIRST) / 4).ok()
        } else {
            None
        }
    }

    /// Write `value` unless the cache proves the register already holds it.
    ///
    /// Offsets outside the submission window are always written.
    pub fn write<R: RegisterIo + ?Sized>(&mut self, regs: &R, offset: u32, value: u32) {
        if self.enabled {
            if let Some(entry) = Self::slot(offset).and_then(|i| self.shadow.get_mut(i)) {
                if *entry == Some(value) {
                    self.skipped += 1;
                    return;
                }
                *entry = Some(value);
            }
        }
        regs.write32(offset, value);
    }

    /// Forget every cached value; the next write to each register goes out.
    pub fn invalidate(&mut self) {
        self.shadow = [None; SLOTS];
    }

    /// Number of writes elided since creation.
    #[must_use]
    pub const fn skipped(&self) -> u64 {
        self.skipped
    }
}
