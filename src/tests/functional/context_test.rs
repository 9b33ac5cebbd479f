// Licensed under the Apache-2.0 license

use super::sim_device;
use crate::config::{DeviceConfig, DeviceConfigBuilder};
use crate::error::Error;
use crate::job::JobState;
use crate::mode::Mode;
use crate::sim::{HsmBehaviour, SimParams};
use core::fmt::Write;
use std::string::String;

pub fn run_context_tests<W: Write>(out: &mut W) {
    writeln!(out, "\r\n=== Context Pool Tests ===\r").unwrap();

    test_contiguous_run_reuse(out);
    test_whole_pool_round_trip(out);
    test_shared_mode_jobs(out);
    test_shared_close_survives_timeout(out);

    writeln!(out, "\r\n=== All Context Pool Tests Passed ===\r").unwrap();
}

fn test_contiguous_run_reuse<W: Write>(out: &mut W) {
    write!(out, "Testing contiguous run reuse... ").unwrap();

    let (_sim, dev) = sim_device(SimParams::default(), DeviceConfig::default());
    let first = dev.request_context(None, 3).unwrap();
    for slot in first..first + 3 {
        assert_eq!(dev.context_ref_count(slot), Some(1));
    }
    dev.release_context(first).unwrap();
    assert_eq!(dev.context_ref_count(first + 2), Some(0));

    let second = dev.request_context(None, 3).unwrap();
    assert_eq!(second, first);

    // a job opened on the run holds every slot of it
    let job = dev.open(Mode::NULL, Some(second)).unwrap();
    assert_eq!(dev.context_ref_count(second + 1), Some(2));
    dev.close(job).unwrap();
    dev.release_context(second).unwrap();
    assert_eq!(dev.context_ref_count(second), Some(0));

    writeln!(out, "PASSED\r").unwrap();
}

fn test_whole_pool_round_trip<W: Write>(out: &mut W) {
    write!(out, "Testing whole-pool reservation... ").unwrap();

    let (_sim, dev) = sim_device(SimParams::default(), DeviceConfig::default());
    let size = dev.hw_config().num_ctx;
    let base = dev.request_context(None, size).unwrap();
    assert_eq!(base, 0);
    assert_eq!(dev.request_context(None, 1), Err(Error::NoFreeContext));
    assert_eq!(dev.open(Mode::NULL, None), Err(Error::NoFreeContext));

    dev.release_context(base).unwrap();
    assert_eq!(dev.request_context(None, size), Ok(0));

    writeln!(out, "PASSED\r").unwrap();
}

fn test_shared_mode_jobs<W: Write>(out: &mut W) {
    write!(out, "Testing shared-hardware context handshake... ").unwrap();

    let (sim, dev) = sim_device(
        SimParams::default(),
        DeviceConfigBuilder::new().shared_mode(true).build(),
    );
    let a = dev.open(Mode::NULL, None).unwrap();
    let b = dev.open(Mode::NULL, None).unwrap();
    assert_eq!(sim.shared_contexts(), 2);
    assert_ne!(dev.job_context(a), dev.job_context(b));
    assert_eq!(dev.request_context(None, 2), Err(Error::InvalidSize));

    // a clone shares the slot; only the last release reaches the device
    let c = dev.clone_job(a).unwrap();
    dev.close(a).unwrap();
    assert_eq!(sim.shared_contexts(), 2);
    dev.close(c).unwrap();
    assert_eq!(sim.shared_contexts(), 1);
    dev.close(b).unwrap();
    assert_eq!(sim.shared_contexts(), 0);

    writeln!(out, "PASSED\r").unwrap();
}

fn test_shared_close_survives_timeout<W: Write>(out: &mut W) {
    write!(out, "Testing shared-mode close after a release timeout... ").unwrap();

    let (sim, dev) = sim_device(
        SimParams::default(),
        DeviceConfigBuilder::new()
            .shared_mode(true)
            .poll_iterations(64)
            .build(),
    );
    let job = dev.open(Mode::NULL, None).unwrap();
    let ctx = dev.job_context(job).unwrap();

    sim.set_hsm(HsmBehaviour::NeverReady);
    assert_eq!(dev.close(job), Err(Error::Timeout));
    assert_eq!(dev.job_state(job), Ok(JobState::Open));
    assert_eq!(dev.context_ref_count(ctx), Some(1));
    assert_eq!(sim.shared_contexts(), 1);

    sim.set_hsm(HsmBehaviour::Grant);
    dev.close(job).unwrap();
    assert_eq!(dev.job_state(job), Err(Error::InvalidHandle));
    assert_eq!(dev.context_ref_count(ctx), Some(0));
    assert_eq!(sim.shared_contexts(), 0);

    writeln!(out, "PASSED\r").unwrap();
}

#[test]
fn context_suite() {
    let mut log = String::new();
    run_context_tests(&mut log);
    assert!(log.contains("All Context Pool Tests Passed"));
}
