// Licensed under the Apache-2.0 license

// Enforce Copilot coding guidelines - prevent panic-prone patterns in production code only
#![cfg_attr(not(test), deny(clippy::unwrap_used, clippy::indexing_slicing))]
#![cfg_attr(not(test), warn(clippy::expect_used))]
#![cfg_attr(not(test), no_std)]

//! Driver core for a DMA-based cryptographic offload engine.
//!
//! The crate owns everything between a caller's request and the engine's
//! register file: descriptor tables, the context pool, job bookkeeping, the
//! command and status FIFOs, and chained (MPM) batching. Register access,
//! DMA memory, interrupts and time come from the platform through the
//! traits in [`hal`].

extern crate alloc;
#[cfg(any(test, feature = "std"))]
extern crate std;

pub mod config;
pub mod ctx_pool;
pub mod ddt;
pub mod device;
pub mod error;
pub mod hal;
pub mod job;
pub mod mode;
pub mod mpm;
pub mod poll;
pub mod queue;
pub mod reg_cache;
pub mod regs;
#[cfg(any(test, feature = "sim"))]
pub mod sim;

#[cfg(test)]
mod tests;

pub use config::{DeviceConfig, DeviceConfigBuilder, HwConfig, MpmConfig};
pub use ddt::Ddt;
pub use device::{CompletionObserver, Device};
pub use error::{Error, Result};
pub use job::{Direction, IcvConfig, JobCallback, JobHandle, JobState, KeyRole, OpFlags};
pub use mode::Mode;
pub use mpm::{ChainState, MpmCompletion, MpmJob, MpmStats, PduFields};
pub use queue::{EnqueueParams, EnqueueStatus, ProcLen};
pub use regs::Priority;
