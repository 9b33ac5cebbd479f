// Licensed under the Apache-2.0 license

//! Simulated physically addressable memory.
//!
//! Buffers are carved from a flat bus address space starting at
//! [`SIM_DMA_BASE`]. Every allocation is kept in a shared map so the
//! simulated engine can follow descriptor pointers into it.

use crate::error::{Error, Result};
use crate::hal::{DmaAllocator, DmaBuffer};
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

/// First bus address handed out by [`SimMemory`].
pub const SIM_DMA_BASE: u64 = 0x1000_0000;

/// Allocations are rounded up to this many bytes.
const SIM_DMA_ALIGN: u64 = 64;

struct Region {
    bytes: Vec<u8>,
    /// Reserved regions outlive any handle; they model caller-owned memory.
    pinned: bool,
}

struct MemState {
    regions: BTreeMap<u64, Region>,
    next: u64,
    used: usize,
    limit: Option<usize>,
}

impl MemState {
    fn region(&self, phys: u64, len: usize) -> Option<(&Region, usize)> {
        let (base, region) = self.regions.range(..=phys).next_back()?;
        let off = usize::try_from(phys - base).ok()?;
        (off.checked_add(len)? <= region.bytes.len()).then_some((region, off))
    }

    fn region_mut(&mut self, phys: u64, len: usize) -> Option<(&mut Region, usize)> {
        let (base, region) = self.regions.range_mut(..=phys).next_back()?;
        let off = usize::try_from(phys - *base).ok()?;
        (off.checked_add(len)? <= region.bytes.len()).then_some((region, off))
    }
}

/// Shared simulated memory; clones refer to the same address space.
#[derive(Clone)]
pub struct SimMemory {
    inner: Arc<Mutex<MemState>>,
}

impl Default for SimMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl SimMemory {
    #[must_use]
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Memory that refuses allocations once `limit` bytes are live.
    #[must_use]
    pub fn with_limit(limit: usize) -> Self {
        Self::build(Some(limit))
    }

    fn build(limit: Option<usize>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(MemState {
                regions: BTreeMap::new(),
                next: SIM_DMA_BASE,
                used: 0,
                limit,
            })),
        }
    }

    fn carve(&self, len: usize, pinned: bool) -> Result<u64> {
        let mut m = self.inner.lock();
        if let Some(limit) = m.limit {
            if m.used.saturating_add(len) > limit {
                return Err(Error::NoMemory);
            }
        }
        let phys = m.next;
        let span = (len as u64).max(1).div_ceil(SIM_DMA_ALIGN) * SIM_DMA_ALIGN;
        m.next = phys.checked_add(span).ok_or(Error::NoMemory)?;
        m.used += len;
        m.regions.insert(
            phys,
            Region {
                bytes: alloc::vec![0; len],
                pinned,
            },
        );
        Ok(phys)
    }

    /// Reserve `len` bytes that stay mapped for the life of the memory and
    /// return their bus address. Models a caller-owned data buffer.
    ///
    /// # Panics
    /// If the memory limit is exhausted.
    #[must_use]
    pub fn reserve(&self, len: usize) -> u64 {
        match self.carve(len, true) {
            Ok(phys) => phys,
            Err(e) => panic!("simulated memory exhausted reserving {len} bytes: {e}"),
        }
    }

    /// Copy bytes at bus address `phys`.
    ///
    /// # Errors
    /// `MemoryError` if the range is not mapped.
    pub fn read(&self, phys: u64, out: &mut [u8]) -> Result<()> {
        let m = self.inner.lock();
        let (region, off) = m.region(phys, out.len()).ok_or(Error::MemoryError)?;
        let src = region
            .bytes
            .get(off..off + out.len())
            .ok_or(Error::MemoryError)?;
        out.copy_from_slice(src);
        Ok(())
    }

    /// Store bytes at bus address `phys`.
    ///
    /// # Errors
    /// `MemoryError` if the range is not mapped.
    pub fn write(&self, phys: u64, data: &[u8]) -> Result<()> {
        let mut m = self.inner.lock();
        let (region, off) = m.region_mut(phys, data.len()).ok_or(Error::MemoryError)?;
        let dst = region
            .bytes
            .get_mut(off..off + data.len())
            .ok_or(Error::MemoryError)?;
        dst.copy_from_slice(data);
        Ok(())
    }

    pub fn read_u32(&self, phys: u64) -> Result<u32> {
        let mut word = [0u8; 4];
        self.read(phys, &mut word)?;
        Ok(u32::from_le_bytes(word))
    }

    pub fn write_u32(&self, phys: u64, value: u32) -> Result<()> {
        self.write(phys, &value.to_le_bytes())
    }

    /// Decode the descriptor table at `phys` up to its terminator.
    #[must_use]
    pub fn read_ddt(&self, phys: u64) -> Vec<(u32, u32)> {
        let mut entries = Vec::new();
        let mut at = phys;
        loop {
            let (Ok(addr), Ok(len)) = (self.read_u32(at), self.read_u32(at + 4)) else {
                break;
            };
            if addr == 0 && len == 0 {
                break;
            }
            entries.push((addr, len));
            at += 8;
        }
        entries
    }

    /// Concatenate the regions a descriptor table points at.
    ///
    /// # Errors
    /// `MemoryError` if an entry points at unmapped memory.
    pub fn gather(&self, ddt: u64) -> Result<Vec<u8>> {
        let mut data = Vec::new();
        for (addr, len) in self.read_ddt(ddt) {
            let start = data.len();
            data.resize(start + len as usize, 0);
            let chunk = data.get_mut(start..).ok_or(Error::MemoryError)?;
            self.read(u64::from(addr), chunk)?;
        }
        Ok(data)
    }

    /// Spread `data` over the regions of a descriptor table, stopping when
    /// either runs out. Returns the number of bytes written.
    ///
    /// # Errors
    /// `MemoryError` if an entry points at unmapped memory.
    pub fn scatter(&self, ddt: u64, mut data: &[u8]) -> Result<usize> {
        let mut written = 0;
        for (addr, len) in self.read_ddt(ddt) {
            if data.is_empty() {
                break;
            }
            let n = data.len().min(len as usize);
            let (head, rest) = data.split_at(n);
            self.write(u64::from(addr), head)?;
            data = rest;
            written += n;
        }
        Ok(written)
    }

    /// Live allocated bytes, pinned reservations included.
    #[must_use]
    pub fn in_use(&self) -> usize {
        self.inner.lock().used
    }

    fn release(&self, phys: u64) {
        let mut m = self.inner.lock();
        let freed = match m.regions.get(&phys) {
            Some(region) if !region.pinned => region.bytes.len(),
            _ => return,
        };
        m.regions.remove(&phys);
        m.used -= freed;
    }
}

/// Handle to an allocation in [`SimMemory`]; dropping it unmaps the region.
pub struct SimBuffer {
    mem: SimMemory,
    phys: u64,
    len: usize,
}

impl DmaBuffer for SimBuffer {
    fn phys(&self) -> u64 {
        self.phys
    }

    fn len(&self) -> usize {
        self.len
    }

    fn read_at(&self, offset: usize, buf: &mut [u8]) -> Result<()> {
        if offset.checked_add(buf.len()).is_none_or(|end| end > self.len) {
            return Err(Error::InvalidSize);
        }
        self.mem.read(self.phys + offset as u64, buf)
    }

    fn write_at(&mut self, offset: usize, data: &[u8]) -> Result<()> {
        if offset.checked_add(data.len()).is_none_or(|end| end > self.len) {
            return Err(Error::InvalidSize);
        }
        self.mem.write(self.phys + offset as u64, data)
    }
}

impl Drop for SimBuffer {
    fn drop(&mut self) {
        self.mem.release(self.phys);
    }
}

impl DmaAllocator for SimMemory {
    type Buffer = SimBuffer;

    fn alloc_dma(&self, len: usize) -> Result<SimBuffer> {
        let phys = self.carve(len, false)?;
        Ok(SimBuffer {
            mem: self.clone(),
            phys,
            len,
        })
    }
}
