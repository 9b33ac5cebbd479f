// Licensed under the Apache-2.0 license

//! DMA descriptor tables: scatter/gather lists handed to the engine.
//!
//! A table is an array of little-endian `(address, length)` pairs in DMA
//! memory, terminated by an all-zero pair. Adjacent regions are never merged.

use crate::error::{Error, Result};
use crate::hal::{DmaAllocator, DmaBuffer};
use zerocopy::little_endian::U32;
use zerocopy::{Immutable, IntoBytes, KnownLayout};

/// One hardware scatter/gather entry.
#[derive(Debug, Default, Clone, Copy, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct DdtEntry {
    pub addr: U32,
    pub len: U32,
}

pub const DDT_ENTRY_SIZE: usize = core::mem::size_of::<DdtEntry>();

/// Scatter/gather table backed by device-visible memory.
pub struct Ddt<B: DmaBuffer> {
    buf: B,
    capacity: usize,
    count: usize,
    total_len: u64,
}

impl<B: DmaBuffer> Ddt<B> {
    /// Allocate a table with room for `capacity` entries plus the terminator.
    ///
    /// # Errors
    /// `InvalidSize` for a zero capacity, `NoMemory` if the allocator fails.
    pub fn new<A>(alloc: &A, capacity: usize) -> Result<Self>
    where
        A: DmaAllocator<Buffer = B> + ?Sized,
    {
        if capacity == 0 {
            return Err(Error::InvalidSize);
        }
        let bytes = capacity
            .checked_add(1)
            .and_then(|n| n.checked_mul(DDT_ENTRY_SIZE))
            .ok_or(Error::InvalidSize)?;
        let buf = alloc.alloc_dma(bytes).map_err(|_| Error::NoMemory)?;
        let mut ddt = Self {
            buf,
            capacity,
            count: 0,
            total_len: 0,
        };
        ddt.write_entry(0, DdtEntry::default())?;
        Ok(ddt)
    }

    fn write_entry(&mut self, index: usize, entry: DdtEntry) -> Result<()> {
        let offset = index.checked_mul(DDT_ENTRY_SIZE).ok_or(Error::InvalidSize)?;
        self.buf.write_at(offset, entry.as_bytes())
    }

    /// Append a region and re-terminate the list.
    ///
    /// # Errors
    /// `DdtFull` once `capacity` entries are in use (nothing is modified),
    /// `InvalidArgument` if the region does not fit 32-bit DMA addressing.
    pub fn add(&mut self, phys: u64, len: u32) -> Result<()> {
        if self.count >= self.capacity {
            return Err(Error::DdtFull);
        }
        let addr = u32::try_from(phys).map_err(|_| Error::InvalidArgument)?;
        let entry = DdtEntry {
            addr: U32::new(addr),
            len: U32::new(len),
        };
        // Terminator first, so the hardware never sees an unterminated list.
        self.write_entry(self.count + 1, DdtEntry::default())?;
        self.write_entry(self.count, entry)?;
        self.count += 1;
        self.total_len += u64::from(len);
        Ok(())
    }

    /// Forget all entries without releasing the backing storage.
    ///
    /// # Errors
    /// Propagates a failed write of the terminator.
    pub fn reset(&mut self) -> Result<()> {
        self.count = 0;
        self.total_len = 0;
        self.write_entry(0, DdtEntry::default())
    }

    /// Release the backing storage.
    pub fn free(self) {
        drop(self);
    }

    /// Bus address of the table itself (what the engine is given).
    #[must_use]
    pub fn phys(&self) -> u64 {
        self.buf.phys()
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.count
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.count == 0
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Sum of all region lengths.
    #[must_use]
    pub const fn total_len(&self) -> u64 {
        self.total_len
    }
}
