// Licensed under the Apache-2.0 license

use super::{sim_device, table};
use crate::config::{DeviceConfigBuilder, MpmConfig};
use crate::ddt::Ddt;
use crate::job::KeyRole;
use crate::mode::Mode;
use crate::mpm::{ChainCallback, ChainState, MpmCompletion, MpmJob, PduFields};
use crate::regs::CtrlWord;
use crate::sim::{SimBuffer, SimParams};
use alloc::sync::Arc;
use core::fmt::Write;
use hex_literal::hex;
use spin::Mutex;
use std::string::String;
use std::vec::Vec;

const CHAIN_CFG: MpmConfig = MpmConfig {
    pdus: 16,
    keys: 4,
    chains: 4,
    link_capacity: 4,
};

pub fn run_chain_tests<W: Write>(out: &mut W) {
    writeln!(out, "\r\n=== Chain Engine Tests ===\r").unwrap();

    test_fifth_insert_opens_new_chain(out);
    test_batches_complete_end_to_end(out);

    writeln!(out, "\r\n=== All Chain Engine Tests Passed ===\r").unwrap();
}

fn cbc_fields() -> PduFields {
    PduFields::new(Mode::AES_CBC.apply(CtrlWord::default().with_encrypt(1)).unwrap())
}

fn chain_job<'a>(
    pdu: usize,
    key: usize,
    src: &'a Ddt<SimBuffer>,
    dst: &'a Ddt<SimBuffer>,
    callback: ChainCallback,
) -> MpmJob<'a, SimBuffer> {
    MpmJob {
        pdu,
        key: Some(key),
        src,
        dst,
        fields: cbc_fields(),
        on_demand: false,
        callback: Some(callback),
    }
}

fn test_fifth_insert_opens_new_chain<W: Write>(out: &mut W) {
    write!(out, "Testing link capacity rollover... ").unwrap();

    let (sim, dev) = sim_device(
        SimParams::default(),
        DeviceConfigBuilder::new().mpm(CHAIN_CFG).build(),
    );
    let key = dev.mpm_alloc_key().unwrap();
    dev.mpm_write_key(key, KeyRole::Cipher, &[0x42; 16], &[0; 16])
        .unwrap();
    let src = table(&sim, 16, 0x01);
    let callback: ChainCallback = Arc::new(|_: MpmCompletion| {});

    for _ in 0..4 {
        let pdu = dev.mpm_alloc_pdu().unwrap();
        assert_eq!(dev.mpm_insert(chain_job(pdu, key, &src, &src, callback.clone())), Ok(0));
    }
    assert_eq!(dev.mpm_chain_len(0), Some(4));
    assert_eq!(dev.mpm_chain_state(0), Some(ChainState::Building));

    let pdu = dev.mpm_alloc_pdu().unwrap();
    let chain = dev.mpm_insert(chain_job(pdu, key, &src, &src, callback)).unwrap();
    assert_eq!(chain, 1);
    assert_eq!(dev.mpm_chain_len(0), Some(4));
    assert_eq!(dev.mpm_chain_len(1), Some(1));
    assert_eq!(dev.mpm_chain_state(0), Some(ChainState::Running));
    assert_eq!(dev.mpm_running_chain(), Some(0));
    assert_eq!(sim.mpm_start_count(), 1);

    writeln!(out, "PASSED\r").unwrap();
}

fn test_batches_complete_end_to_end<W: Write>(out: &mut W) {
    write!(out, "Testing chained batches through the interrupt path... ").unwrap();

    let (sim, dev) = sim_device(
        SimParams::default(),
        DeviceConfigBuilder::new().mpm(CHAIN_CFG).build(),
    );
    let key = dev.mpm_alloc_key().unwrap();
    let iv = hex!("f0f1f2f3f4f5f6f7f8f9fafbfcfdfeff");
    dev.mpm_write_key(key, KeyRole::Cipher, &hex!("2b7e151628aed2a6abf7158809cf4f3c"), &iv)
        .unwrap();

    let done: Arc<Mutex<Vec<MpmCompletion>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = done.clone();
    let callback: ChainCallback = Arc::new(move |c: MpmCompletion| sink.lock().push(c));

    let sources: Vec<_> = (0..6u8).map(|i| table(&sim, 32, i + 1)).collect();
    let dests: Vec<_> = (0..6).map(|_| table(&sim, 32, 0)).collect();
    let mut pdus = Vec::new();
    for (src, dst) in sources.iter().zip(&dests) {
        let pdu = dev.mpm_alloc_pdu().unwrap();
        dev.mpm_insert(chain_job(pdu, key, src, dst, callback.clone()))
            .unwrap();
        pdus.push(pdu);
    }
    dev.mpm_flush(None).unwrap();
    dev.mpm_release_key(key).unwrap();

    // first chain is running, second is waiting behind it
    assert_eq!(dev.mpm_chain_state(1), Some(ChainState::Built));
    while dev.mpm_running_chain().is_some() {
        sim.run_mpm();
        dev.handle_irq().unwrap();
    }

    let done = done.lock();
    let order: Vec<usize> = done.iter().map(|c| c.pdu).collect();
    assert_eq!(order, pdus);
    assert!(done.iter().all(|c| c.result.is_ok()));
    for (i, dst) in dests.iter().enumerate() {
        let data = sim.memory().gather(dst.phys()).unwrap();
        assert!(data.iter().all(|b| usize::from(*b) == i + 1));
    }

    let stats = dev.mpm_stats().unwrap();
    assert_eq!(stats.chains_started, 2);
    assert_eq!(dev.mpm_chain_state(0), Some(ChainState::Free));
    assert_eq!(dev.mpm_chain_state(1), Some(ChainState::Free));
    // the key slot came back once the last descriptor using it drained
    assert_eq!(dev.mpm_alloc_key(), Ok(key));

    writeln!(out, "PASSED\r").unwrap();
}

#[test]
fn chain_suite() {
    let mut log = String::new();
    run_chain_tests(&mut log);
    assert!(log.contains("All Chain Engine Tests Passed"));
}
