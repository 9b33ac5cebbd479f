// Licensed under the Apache-2.0 license

//! Software model of the engine and its DMA memory, for host tests and
//! bring-up without hardware.

mod engine;
mod memory;

pub use engine::{HsmBehaviour, SimClock, SimCommand, SimEngine, SimParams};
pub use memory::{SimBuffer, SimMemory, SIM_DMA_BASE};
