// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! End-to-end chain scenarios across independently scheduled queues.
//!
//! Every ordering asserted here is carried by an explicit signal/wait edge.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use parking_lot::Mutex;
use rstest::rstest;

use lzt_harness::*;

const TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn reader_observes_writer_through_handle() -> Result<()> {
    lzt_harness::logging::init();
    let executors = QueueExecutor::group(2);
    let mut pool = SyncPool::create(2)?;
    let h0 = pool.acquire()?;
    let h1 = pool.acquire()?;

    let shared = DeviceBuffer::allocate(4096);
    let readback = DeviceBuffer::allocate(4096);
    let written = shared.clone();

    let mut chain = ChainBuilder::new(&mut pool, 2)?;
    chain.add_step(
        0,
        &[],
        WorkPayload::kernel("write_pattern", move || {
            written.write_data_pattern(0x3C);
            Ok(())
        }),
        Some(h0),
    )?;
    chain.add_step(
        1,
        &[h0],
        WorkPayload::Copy {
            src: shared.clone(),
            dst: readback.clone(),
        },
        Some(h1),
    )?;
    chain.submit(&executors)?;
    chain.synchronize_all(&executors, TIMEOUT).await?;

    assert_eq!(readback.validate_data_pattern(0x3C), Ok(()));
    assert_eq!(readback.to_vec(), shared.to_vec());
    chain.release(h0)?;
    chain.release(h1)?;
    drop(chain);
    assert_eq!(pool.in_use(), 0);
    Ok(())
}

#[test]
fn single_slot_pool_exhausts_and_recovers() -> Result<()> {
    let mut pool = SyncPool::create(1)?;
    let h0 = pool.acquire()?;
    assert!(matches!(
        pool.acquire(),
        Err(PoolError::PoolExhausted { capacity: 1, .. })
    ));

    pool.release(h0)?;
    let again = pool.acquire()?;
    assert_eq!(again.index(), h0.index());
    assert_ne!(again, h0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unsignalled_wait_times_out_instead_of_hanging() -> Result<()> {
    let executors = QueueExecutor::group(2);
    let mut pool = SyncPool::create(2)?;

    let mut chain = ChainBuilder::new(&mut pool, 2)?;
    let never = chain.acquire()?;
    let done = chain.acquire()?;
    chain.add_step(0, &[never], WorkPayload::Barrier, Some(done))?;
    chain.add_step(1, &[done], WorkPayload::Barrier, None)?;
    chain.submit(&executors)?;

    let started = tokio::time::Instant::now();
    let err = chain
        .synchronize_all(&executors, Duration::from_millis(100))
        .await
        .unwrap_err();
    assert!(started.elapsed() < TIMEOUT);

    match &err {
        SyncError::Timeout { timeout, stalled } => {
            assert_eq!(*timeout, Duration::from_millis(100));
            let locations: Vec<_> = stalled.iter().map(|step| step.location).collect();
            assert_eq!(
                locations,
                vec![StepLocation::new(0, 0), StepLocation::new(1, 0)]
            );
        }
        other => panic!("expected timeout, got {other:?}"),
    }
    assert!(err.to_string().contains(&never.to_string()));
    assert_eq!(chain.phase(), ChainPhase::TimedOut);
    assert!(matches!(
        chain.release(never),
        Err(ChainError::HandleInUse { .. })
    ));

    for executor in &executors {
        executor.shutdown().await;
    }
    assert!(matches!(
        chain.step_state(StepLocation::new(1, 0)),
        Some(StepState::Failed(_))
    ));
    Ok(())
}

#[rstest]
#[case(2)]
#[case(3)]
#[case(6)]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn accumulate_chain_sums_every_contribution(#[case] executor_count: usize) -> Result<()> {
    let executors = QueueExecutor::group(executor_count);
    let mut pool = SyncPool::create(executor_count - 1)?;
    let counter = DeviceBuffer::allocate(4);

    let mut chain = ChainBuilder::new(&mut pool, executor_count)?;
    let edges = (0..executor_count - 1)
        .map(|_| chain.acquire())
        .collect::<Result<Vec<_>, _>>()?;

    for executor in 0..executor_count {
        let waits: Vec<SyncHandle> = executor
            .checked_sub(1)
            .map(|previous| edges[previous])
            .into_iter()
            .collect();
        let signal = edges.get(executor).copied();
        chain.add_step(
            executor,
            &waits,
            WorkPayload::Accumulate {
                buffer: counter.clone(),
                value: contribution(executor),
            },
            signal,
        )?;
    }

    chain.submit(&executors)?;
    chain.synchronize_all(&executors, TIMEOUT).await?;

    let expected: u32 = (0..executor_count).map(contribution).sum();
    assert_eq!(counter.read_u32(0), expected);
    for edge in edges {
        chain.release(edge)?;
    }
    Ok(())
}

fn contribution(executor: usize) -> u32 {
    (executor as u32 + 1) * 0x101
}

/// Run two executors whose steps share no handle, releasing their host
/// gates in `release_order`, and return the order the steps finished in.
async fn run_unordered_pair(release_order: [usize; 2]) -> Result<Vec<usize>> {
    let executors = QueueExecutor::group(2);
    let mut pool = SyncPool::create(4)?;
    let finished = Arc::new(Mutex::new(Vec::new()));

    let mut chain = ChainBuilder::new(&mut pool, 2)?;
    let gates = [chain.acquire()?, chain.acquire()?];
    let done = [chain.acquire()?, chain.acquire()?];
    for executor in 0..2 {
        let finished = Arc::clone(&finished);
        chain.add_step(
            executor,
            &[gates[executor]],
            WorkPayload::kernel(format!("record_{executor}"), move || {
                finished.lock().push(executor);
                Ok(())
            }),
            Some(done[executor]),
        )?;
    }
    chain.submit(&executors)?;

    for executor in release_order {
        chain.pool().host_signal(gates[executor])?;
        chain
            .pool()
            .host_synchronize(done[executor], TIMEOUT)
            .await?;
    }
    chain.synchronize_all(&executors, TIMEOUT).await?;

    let order = finished.lock().clone();
    Ok(order)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unrelated_executors_complete_in_either_order() -> Result<()> {
    let forward = run_unordered_pair([0, 1]).await?;
    let reverse = run_unordered_pair([1, 0]).await?;

    assert_eq!(forward, vec![0, 1]);
    assert_eq!(reverse, vec![1, 0]);
    // an assertion pinning either interleaving fails for one of the runs
    assert_ne!(forward, reverse);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn fan_in_observes_every_producer() -> Result<()> {
    const PRODUCERS: usize = 5;
    let executors = QueueExecutor::group(PRODUCERS + 1);
    let mut pool = SyncPool::create(PRODUCERS)?;
    let buffers: Vec<DeviceBuffer> = (0..PRODUCERS).map(|_| DeviceBuffer::allocate(256)).collect();

    let mut chain = ChainBuilder::new(&mut pool, PRODUCERS + 1)?;
    let handles = (0..PRODUCERS)
        .map(|_| chain.acquire())
        .collect::<Result<Vec<_>, _>>()?;

    for (producer, buffer) in buffers.iter().enumerate() {
        let target = buffer.clone();
        let pattern = producer as u8 * 0x20;
        chain.add_step(
            producer + 1,
            &[],
            WorkPayload::kernel(format!("produce_{producer}"), move || {
                target.write_data_pattern(pattern);
                Ok(())
            }),
            Some(handles[producer]),
        )?;
    }

    let observed = buffers.clone();
    let consumer = chain.add_step(
        0,
        &handles,
        WorkPayload::kernel("consume", move || {
            for (producer, buffer) in observed.iter().enumerate() {
                if buffer.validate_data_pattern(producer as u8 * 0x20).is_err() {
                    return Err(producer as i32 + 1);
                }
            }
            Ok(())
        }),
        None,
    )?;

    chain.submit(&executors)?;
    chain.synchronize_all(&executors, TIMEOUT).await?;
    assert_eq!(chain.step_state(consumer), Some(StepState::Completed));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn kernel_failure_poisons_dependants() -> Result<()> {
    let executors = QueueExecutor::group(2);
    let mut pool = SyncPool::create(1)?;

    let mut chain = ChainBuilder::new(&mut pool, 2)?;
    let edge = chain.acquire()?;
    let producer = chain.add_step(0, &[], WorkPayload::kernel("fault", || Err(0x42)), Some(edge))?;
    let dependant = chain.add_step(1, &[edge], WorkPayload::Barrier, None)?;
    chain.submit(&executors)?;

    match chain.synchronize_all(&executors, TIMEOUT).await {
        Err(SyncError::ExecutionFailed { executor: 0, failure }) => {
            assert_eq!(failure.code(), 0x42);
            assert_eq!(failure.step(), Some(0));
        }
        Err(SyncError::ExecutionFailed { executor: 1, failure }) => {
            assert_eq!(failure.code(), codes::DEPENDENCY_POISONED);
        }
        other => panic!("expected execution failure, got {other:?}"),
    }
    assert_eq!(chain.phase(), ChainPhase::Failed);

    match chain.step_state(producer) {
        Some(StepState::Failed(reason)) => assert!(reason.contains("fault")),
        other => panic!("producer should have failed, got {other:?}"),
    }

    let poisoned = async {
        loop {
            if let Some(StepState::Failed(reason)) = chain.step_state(dependant) {
                return reason;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    };
    let reason = tokio::time::timeout(TIMEOUT, poisoned).await?;
    assert!(reason.contains("poisoned"));
    assert_eq!(chain.pool().query_status(edge)?, SyncStatus::Poisoned);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn kernel_panic_fails_chain_and_poisons_dependants() -> Result<()> {
    let executors = QueueExecutor::group(2);
    let mut pool = SyncPool::create(1)?;
    let short = DeviceBuffer::allocate(2);

    let mut chain = ChainBuilder::new(&mut pool, 2)?;
    let edge = chain.acquire()?;
    let producer = chain.add_step(
        0,
        &[],
        WorkPayload::kernel("read_past_end", move || {
            short.read_u32(0);
            Ok(())
        }),
        Some(edge),
    )?;
    let dependant = chain.add_step(1, &[edge], WorkPayload::Barrier, None)?;
    chain.submit(&executors)?;

    match chain.synchronize_all(&executors, TIMEOUT).await {
        Err(SyncError::ExecutionFailed { executor: 0, failure }) => {
            assert_eq!(failure.code(), codes::PAYLOAD_PANICKED);
            assert_eq!(failure.step(), Some(0));
        }
        Err(SyncError::ExecutionFailed { executor: 1, failure }) => {
            assert_eq!(failure.code(), codes::DEPENDENCY_POISONED);
        }
        other => panic!("expected execution failure, got {other:?}"),
    }

    match chain.step_state(producer) {
        Some(StepState::Failed(reason)) => assert!(reason.contains("read_past_end")),
        other => panic!("producer should have failed, got {other:?}"),
    }
    assert_eq!(chain.pool().query_status(edge)?, SyncStatus::Poisoned);

    let dependant_failed = async {
        while !matches!(chain.step_state(dependant), Some(StepState::Failed(_))) {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    };
    tokio::time::timeout(TIMEOUT, dependant_failed).await?;
    Ok(())
}

#[tokio::test]
async fn harness_built_from_config() -> Result<()> {
    let config = HarnessConfig::default();
    let executors = QueueExecutor::group_from_config(&config.executor);
    let mut pool = SyncPool::from_config(&config.pool)?;
    assert_eq!(executors.len(), 2);
    assert_eq!(pool.capacity(), 32);

    let mut chain = ChainBuilder::with_config(&mut pool, executors.len(), &config.chain)?;
    let counter = DeviceBuffer::allocate(4);
    let edge = chain.acquire()?;
    chain.add_step(
        1,
        &[],
        WorkPayload::Accumulate {
            buffer: counter.clone(),
            value: 2,
        },
        Some(edge),
    )?;
    chain.add_step(0, &[edge], WorkPayload::Barrier, None)?;
    chain.add_step(
        0,
        &[],
        WorkPayload::Accumulate {
            buffer: counter.clone(),
            value: 3,
        },
        None,
    )?;
    chain.submit(&executors)?;
    chain
        .synchronize_all(&executors, config.chain.sync_timeout())
        .await?;
    assert_eq!(counter.read_u32(0), 5);
    Ok(())
}
