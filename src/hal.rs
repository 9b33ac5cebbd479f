// Licensed under the Apache-2.0 license

//! Collaborator interfaces consumed by the engine core.
//!
//! Everything below the register/descriptor layer (bus mapping, interrupt
//! wiring, physically contiguous allocation, time) is provided by the
//! platform through these traits.

use crate::error::Result;
use alloc::boxed::Box;
use fugit::TimerInstantU64;

/// Microsecond-resolution monotonic instant.
pub type Instant = TimerInstantU64<1_000_000>;

/// 32-bit memory-mapped register access.
///
/// Offsets are byte offsets from the engine's register base.
pub trait RegisterIo {
    fn read32(&self, offset: u32) -> u32;
    fn write32(&self, offset: u32, value: u32);
}

/// Physically addressable memory handed to the engine.
///
/// Accesses go through copies rather than references because the device may
/// write the memory behind the CPU's back. Releasing the memory is `Drop`.
pub trait DmaBuffer {
    /// Bus address of the first byte.
    fn phys(&self) -> u64;

    /// Size in bytes.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy `buf.len()` bytes starting at `offset` out of the buffer.
    ///
    /// # Errors
    /// Returns `Error::InvalidSize` if the range is out of bounds.
    fn read_at(&self, offset: usize, buf: &mut [u8]) -> Result<()>;

    /// Copy `data` into the buffer starting at `offset`.
    ///
    /// # Errors
    /// Returns `Error::InvalidSize` if the range is out of bounds.
    fn write_at(&mut self, offset: usize, data: &[u8]) -> Result<()>;

    fn read_u32(&self, offset: usize) -> Result<u32> {
        let mut word = [0u8; 4];
        self.read_at(offset, &mut word)?;
        Ok(u32::from_le_bytes(word))
    }

    fn write_u32(&mut self, offset: usize, value: u32) -> Result<()> {
        self.write_at(offset, &value.to_le_bytes())
    }
}

/// Allocator for physically contiguous, device-visible memory.
pub trait DmaAllocator {
    type Buffer: DmaBuffer + Send;

    /// Allocate `len` zeroed bytes.
    ///
    /// # Errors
    /// Returns `Error::NoMemory` when the platform cannot satisfy the request.
    fn alloc_dma(&self, len: usize) -> Result<Self::Buffer>;
}

/// Monotonic time source used for handshake and wait deadlines.
pub trait Clock {
    /// Current instant, or `None` when the platform has no reliable clock.
    fn now(&self) -> Option<Instant>;
}

/// Clock for platforms without a usable timer; polling falls back to an
/// iteration budget.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoClock;

impl Clock for NoClock {
    fn now(&self) -> Option<Instant> {
        None
    }
}

/// Host monotonic clock.
#[cfg(feature = "std")]
#[derive(Debug, Clone, Copy)]
pub struct StdClock {
    origin: std::time::Instant,
}

#[cfg(feature = "std")]
impl Default for StdClock {
    fn default() -> Self {
        Self {
            origin: std::time::Instant::now(),
        }
    }
}

#[cfg(feature = "std")]
impl Clock for StdClock {
    fn now(&self) -> Option<Instant> {
        let micros = u64::try_from(self.origin.elapsed().as_micros()).unwrap_or(u64::MAX);
        Some(Instant::from_ticks(micros))
    }
}

/// Interrupt handler registered with the platform.
pub type IrqHandler = Box<dyn Fn() + Send + Sync>;

/// Platform hook for wiring the engine's completion interrupt.
pub trait IrqRegistrar {
    /// # Errors
    /// Returns an error if the interrupt line cannot be claimed.
    fn register_irq(&self, handler: IrqHandler) -> Result<()>;
}
