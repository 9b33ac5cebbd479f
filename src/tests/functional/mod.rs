// Licensed under the Apache-2.0 license

//! End-to-end scenarios against the simulated engine.
//!
//! Each suite exposes a `run_*_tests` entry point that reports progress to a
//! text sink, so the same sequences can be driven from a board console.

pub mod chain_test;
pub mod context_test;
mod property_test;
pub mod queue_flow_test;

use crate::config::DeviceConfig;
use crate::ddt::Ddt;
use crate::device::Device;
use crate::hal::NoClock;
use crate::sim::{SimBuffer, SimEngine, SimMemory, SimParams};

pub(crate) type SimDevice = Device<SimEngine, SimMemory>;

pub(crate) fn sim_device(params: SimParams, cfg: DeviceConfig) -> (SimEngine, SimDevice) {
    let sim = SimEngine::new(params);
    let dev = Device::new(sim.clone(), sim.memory(), NoClock, cfg).unwrap();
    (sim, dev)
}

/// Single-entry table over a fresh region filled with `fill`.
pub(crate) fn table(sim: &SimEngine, len: usize, fill: u8) -> Ddt<SimBuffer> {
    let mem = sim.memory();
    let phys = mem.reserve(len);
    mem.write(phys, &std::vec![fill; len]).unwrap();
    let mut ddt = Ddt::new(&mem, 1).unwrap();
    ddt.add(phys, u32::try_from(len).unwrap()).unwrap();
    ddt
}
