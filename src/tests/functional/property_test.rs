// Licensed under the Apache-2.0 license

//! Randomised operation sequences over the context pool and command queue.

use super::{sim_device, table};
use crate::config::DeviceConfig;
use crate::error::Error;
use crate::job::JobState;
use crate::mode::Mode;
use crate::queue::{EnqueueParams, EnqueueStatus};
use crate::sim::SimParams;
use proptest::prelude::*;
use std::vec::Vec;

#[derive(Debug, Clone, Copy)]
enum PoolOp {
    Request(usize),
    Release(usize),
}

fn pool_op() -> impl Strategy<Value = PoolOp> {
    prop_oneof![
        2 => (1usize..=4).prop_map(PoolOp::Request),
        1 => any::<usize>().prop_map(PoolOp::Release),
    ]
}

#[derive(Debug, Clone, Copy)]
enum QueueOp {
    Enqueue(usize),
    Process,
    Drain,
}

fn queue_op(jobs: usize) -> impl Strategy<Value = QueueOp> {
    prop_oneof![
        2 => (0..jobs).prop_map(QueueOp::Enqueue),
        1 => Just(QueueOp::Process),
        1 => Just(QueueOp::Drain),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn pool_counts_match_held_reservations(ops in prop::collection::vec(pool_op(), 1..200)) {
        let (_sim, dev) = sim_device(SimParams::default(), DeviceConfig::default());
        let size = dev.hw_config().num_ctx;
        let mut held: Vec<(usize, usize)> = Vec::new();

        for op in ops {
            match op {
                PoolOp::Request(len) => match dev.request_context(None, len) {
                    Ok(base) => held.push((base, len)),
                    Err(e) => prop_assert_eq!(e, Error::NoFreeContext),
                },
                PoolOp::Release(pick) => {
                    if held.is_empty() {
                        continue;
                    }
                    let (base, _) = held.swap_remove(pick % held.len());
                    prop_assert_eq!(dev.release_context(base), Ok(()));
                }
            }

            let mut expected = std::vec![0u32; size];
            for &(base, len) in &held {
                for count in &mut expected[base..base + len] {
                    *count += 1;
                }
            }
            let actual: Vec<u32> = (0..size)
                .map(|s| dev.context_ref_count(s).unwrap())
                .collect();
            prop_assert_eq!(&actual, &expected);

            // an idle slot is reusable at once, lowest first
            if let Some(idle) = expected.iter().position(|c| *c == 0) {
                prop_assert_eq!(dev.request_context(None, 1), Ok(idle));
                prop_assert_eq!(dev.release_context(idle), Ok(()));
            }
        }

        for (base, _) in held {
            prop_assert_eq!(dev.release_context(base), Ok(()));
        }
        prop_assert_eq!(dev.request_context(None, size), Ok(0));
    }

    #[test]
    fn completions_always_resolve_to_their_job(ops in prop::collection::vec(queue_op(12), 1..300)) {
        let (sim, dev) = sim_device(SimParams::default(), DeviceConfig::default());
        let src = table(&sim, 16, 0x33);
        let jobs: Vec<_> = (0..12).map(|_| dev.open(Mode::NULL, None).unwrap()).collect();
        let mut completed = 0;

        for op in ops {
            match op {
                QueueOp::Enqueue(i) => {
                    let job = jobs[i];
                    if dev.job_state(job) == Ok(JobState::Open) {
                        prop_assert!(dev.enqueue(job, &EnqueueParams::new(&src, &src)).is_ok());
                    }
                }
                QueueOp::Process => {
                    sim.process_all();
                }
                QueueOp::Drain => {
                    completed += dev.dequeue_all().unwrap();
                    for &job in &jobs {
                        if dev.job_state(job) == Ok(JobState::Completed) {
                            prop_assert_eq!(dev.dequeue(job), Ok(()));
                        }
                    }
                }
            }
            prop_assert!(dev.in_flight() <= jobs.len());
        }

        while dev.in_flight() > 0 || dev.deferred_jobs() > 0 {
            sim.process_all();
            completed += dev.dequeue_all().unwrap();
        }
        prop_assert_eq!(sim.history().len(), completed);
    }

    #[test]
    fn deferred_jobs_reach_hardware_in_arrival_order(
        ops in prop::collection::vec(queue_op(16), 1..120)
    ) {
        let (sim, dev) = sim_device(
            SimParams {
                fifo_depth: [1, 0, 0],
                ..SimParams::default()
            },
            DeviceConfig::default(),
        );
        let src = table(&sim, 16, 0x5a);
        let jobs: Vec<_> = (0..16).map(|_| dev.open(Mode::NULL, None).unwrap()).collect();
        let mut arrivals = Vec::new();

        for op in ops {
            match op {
                QueueOp::Enqueue(i) => {
                    let job = jobs[i];
                    if dev.job_state(job) != Ok(JobState::Open) {
                        continue;
                    }
                    let status = dev.enqueue(job, &EnqueueParams::new(&src, &src));
                    prop_assert!(matches!(
                        status,
                        Ok(EnqueueStatus::Submitted | EnqueueStatus::Buffered)
                    ));
                    arrivals.push(u32::try_from(dev.job_context(job).unwrap()).unwrap());
                }
                QueueOp::Process => {
                    sim.process_all();
                }
                QueueOp::Drain => {
                    dev.dequeue_all().unwrap();
                    for &job in &jobs {
                        if dev.job_state(job) == Ok(JobState::Completed) {
                            prop_assert_eq!(dev.dequeue(job), Ok(()));
                        }
                    }
                }
            }
        }

        while dev.in_flight() > 0 || dev.deferred_jobs() > 0 {
            sim.process_all();
            dev.dequeue_all().unwrap();
        }
        let order: Vec<u32> = sim.history().iter().map(|cmd| cmd.ctrl.ctx_idx()).collect();
        prop_assert_eq!(order, arrivals);
    }
}
