/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Engine-level tests driving the full prepare/submit/poll/release cycle
//! against the simulated fabric provider.

use std::sync::Arc;
use std::time::Duration;

use crate::ExecStream;
use crate::FabricProvider;
use crate::MemKind;
use crate::MemoryHandle;
use crate::SimFabric;
use crate::XferConfig;
use crate::XferEngine;
use crate::XferError;
use crate::XferOp;
use crate::XferStatus;

const PEER: &str = "remote-agent";

struct Loopback {
    engine: XferEngine,
    provider: Arc<SimFabric>,
}

/// Engine wired to a simulated fabric with a loopback connection to `PEER`.
fn loopback(ring_capacity: u32, slot_capacity: u32) -> Loopback {
    let provider = Arc::new(SimFabric::new());
    let config = XferConfig {
        ring_capacity,
        slot_capacity,
        ..Default::default()
    };
    let engine = XferEngine::new(config, provider.clone() as Arc<dyn FabricProvider>).unwrap();
    let info = engine.conn_info();
    engine.connect(PEER, &info).unwrap();
    Loopback { engine, provider }
}

fn register_buffer(engine: &XferEngine, buf: &[u8]) -> MemoryHandle {
    engine
        .register_mem(buf.as_ptr() as u64, buf.len() as u64, MemKind::Dram)
        .unwrap()
}

/// Registers `buf` locally, then round-trips its export blob through
/// `load_remote_md` so it plays the role of `PEER`'s memory.
fn import_buffer(engine: &XferEngine, buf: &[u8]) -> MemoryHandle {
    let local = register_buffer(engine, buf);
    let blob = engine.export_md(&local).unwrap();
    engine.load_remote_md(&blob, PEER).unwrap()
}

// Helper function to fill a buffer with pseudo-random values
fn generate_random_data(buffer: &mut [u8], seed: u64) {
    let mut state = seed.wrapping_mul(0x9e3779b97f4a7c15).wrapping_add(1);
    for val in buffer.iter_mut() {
        state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        *val = (state >> 56) as u8;
    }
}

fn create_test_data(size: usize) -> Box<[u8]> {
    let mut data = vec![0u8; size].into_boxed_slice();
    generate_random_data(&mut data, 7);
    data
}

#[test]
fn test_prep_claims_ceil_of_pairs_over_slot_capacity() {
    let lo = loopback(64, 4);
    let src = create_test_data(4096);
    let dst = vec![0u8; 4096].into_boxed_slice();
    let local = register_buffer(&lo.engine, &src);
    let remote = import_buffer(&lo.engine, &dst);

    for n in [1usize, 3, 4, 5, 8, 9] {
        let locals: Vec<_> = (0..n).map(|i| local.view(i as u64 * 16, 16)).collect();
        let remotes: Vec<_> = (0..n).map(|i| remote.view(i as u64 * 16, 16)).collect();
        let request = lo
            .engine
            .prep_xfer(XferOp::Write, &locals, &remotes, PEER, ExecStream(0))
            .unwrap();
        let expected_slots = (n as u64 + 3) / 4;
        assert_eq!(request.num_slots(), expected_slots, "n = {}", n);

        let total: u32 = request
            .positions()
            .map(|pos| lo.engine.ring().occupancy_of(pos).0)
            .sum();
        assert_eq!(total as usize, n, "n = {}", n);
        lo.engine.release_req(request);
    }
}

#[test]
fn test_five_pairs_with_slot_capacity_two() {
    let lo = loopback(16, 2);
    let src = create_test_data(640);
    let dst = vec![0u8; 640].into_boxed_slice();
    let local = register_buffer(&lo.engine, &src);
    let remote = import_buffer(&lo.engine, &dst);

    let locals: Vec<_> = (0..5).map(|i| local.view(i * 128, 128)).collect();
    let remotes: Vec<_> = (0..5).map(|i| remote.view(i * 128, 128)).collect();
    let request = lo
        .engine
        .prep_xfer(XferOp::Write, &locals, &remotes, PEER, ExecStream(0))
        .unwrap();
    assert_eq!(request.num_slots(), 3);
    let occupancies: Vec<u32> = request
        .positions()
        .map(|pos| lo.engine.ring().occupancy_of(pos).0)
        .collect();
    assert_eq!(occupancies, vec![2, 2, 1]);
}

#[test]
fn test_prep_rejects_mismatched_list_lengths() {
    let lo = loopback(16, 4);
    let buf = create_test_data(256);
    let local = register_buffer(&lo.engine, &buf);
    let remote = import_buffer(&lo.engine, &buf);

    let result = lo.engine.prep_xfer(
        XferOp::Write,
        &[local.view(0, 64), local.view(64, 64)],
        &[remote.view(0, 64)],
        PEER,
        ExecStream(0),
    );
    assert!(matches!(result, Err(XferError::InvalidArgument(_))));
    // Validation failures claim zero ring positions.
    assert_eq!(lo.engine.ring().head(), 0);

    let result = lo
        .engine
        .prep_xfer(XferOp::Write, &[], &[], PEER, ExecStream(0));
    assert!(matches!(result, Err(XferError::InvalidArgument(_))));
    assert_eq!(lo.engine.ring().head(), 0);
}

#[test]
fn test_prep_rejects_pair_length_mismatch() {
    let lo = loopback(16, 4);
    let buf = create_test_data(512);
    let local = register_buffer(&lo.engine, &buf);
    let remote = import_buffer(&lo.engine, &buf);

    let result = lo.engine.prep_xfer(
        XferOp::Write,
        &[local.view(0, 100)],
        &[remote.view(0, 200)],
        PEER,
        ExecStream(0),
    );
    assert!(matches!(result, Err(XferError::InvalidArgument(_))));
    assert_eq!(lo.engine.ring().head(), 0);
}

#[test]
fn test_prep_requires_connected_peer() {
    let lo = loopback(16, 4);
    let buf = create_test_data(64);
    let local = register_buffer(&lo.engine, &buf);
    let remote = import_buffer(&lo.engine, &buf);

    let result = lo.engine.prep_xfer(
        XferOp::Read,
        &[local.full_view()],
        &[remote.full_view()],
        "stranger",
        ExecStream(0),
    );
    assert!(matches!(result, Err(XferError::PeerNotConnected(_))));
}

#[test]
fn test_load_remote_md_requires_connection() {
    let provider = Arc::new(SimFabric::new());
    let engine =
        XferEngine::new(XferConfig::default(), provider as Arc<dyn FabricProvider>).unwrap();
    let buf = create_test_data(64);
    let local = register_buffer(&engine, &buf);
    let blob = engine.export_md(&local).unwrap();
    assert!(matches!(
        engine.load_remote_md(&blob, PEER),
        Err(XferError::PeerNotConnected(_))
    ));
}

#[test]
fn test_write_end_to_end() {
    let lo = loopback(16, 4);
    let src = create_test_data(4096);
    let dst = vec![0u8; 4096].into_boxed_slice();
    let local = register_buffer(&lo.engine, &src);
    let remote = import_buffer(&lo.engine, &dst);

    let mut request = lo
        .engine
        .prep_xfer(
            XferOp::Write,
            &[local.full_view()],
            &[remote.full_view()],
            PEER,
            ExecStream(1),
        )
        .unwrap();
    assert_eq!(request.num_slots(), 1);

    lo.engine.post_xfer(&mut request).unwrap();
    assert!(request.is_submitted());
    assert_eq!(lo.engine.check_xfer(&request), XferStatus::InProgress);
    // Polling has no side effects; asking again changes nothing.
    assert_eq!(lo.engine.check_xfer(&request), XferStatus::InProgress);

    assert!(lo.provider.complete_next().unwrap());
    assert_eq!(lo.engine.check_xfer(&request), XferStatus::Complete);
    assert_eq!(lo.engine.check_xfer(&request), XferStatus::Complete);

    lo.engine.release_req(request);
    assert_eq!(&src[..], &dst[..]);
}

#[test]
fn test_read_end_to_end() {
    let lo = loopback(16, 4);
    let dst = vec![0u8; 1024].into_boxed_slice();
    let src = create_test_data(1024);
    let local = register_buffer(&lo.engine, &dst);
    let remote = import_buffer(&lo.engine, &src);

    let mut request = lo
        .engine
        .prep_xfer(
            XferOp::Read,
            &[local.full_view()],
            &[remote.full_view()],
            PEER,
            ExecStream(0),
        )
        .unwrap();
    lo.engine.post_xfer(&mut request).unwrap();
    lo.provider.drain().unwrap();
    assert_eq!(lo.engine.check_xfer(&request), XferStatus::Complete);
    lo.engine.release_req(request);
    assert_eq!(&src[..], &dst[..]);
}

#[test]
fn test_multi_slot_batch_completes_slot_by_slot() {
    let lo = loopback(16, 2);
    let src = create_test_data(320);
    let dst = vec![0u8; 320].into_boxed_slice();
    let local = register_buffer(&lo.engine, &src);
    let remote = import_buffer(&lo.engine, &dst);

    let locals: Vec<_> = (0..5).map(|i| local.view(i * 64, 64)).collect();
    let remotes: Vec<_> = (0..5).map(|i| remote.view(i * 64, 64)).collect();
    let mut request = lo
        .engine
        .prep_xfer(XferOp::Write, &locals, &remotes, PEER, ExecStream(0))
        .unwrap();
    lo.engine.post_xfer(&mut request).unwrap();
    assert_eq!(lo.provider.pending_ops(), 3);

    // Two of three slots done: still in progress.
    assert!(lo.provider.complete_next().unwrap());
    assert!(lo.provider.complete_next().unwrap());
    assert_eq!(lo.engine.check_xfer(&request), XferStatus::InProgress);

    assert!(lo.provider.complete_next().unwrap());
    assert_eq!(lo.engine.check_xfer(&request), XferStatus::Complete);
    lo.engine.release_req(request);
    assert_eq!(&src[..], &dst[..]);
}

#[test]
fn test_double_post_rejected() {
    let lo = loopback(16, 4);
    let buf = create_test_data(64);
    let local = register_buffer(&lo.engine, &buf);
    let remote = import_buffer(&lo.engine, &buf);

    let mut request = lo
        .engine
        .prep_xfer(
            XferOp::Write,
            &[local.full_view()],
            &[remote.full_view()],
            PEER,
            ExecStream(0),
        )
        .unwrap();
    lo.engine.post_xfer(&mut request).unwrap();
    assert!(matches!(
        lo.engine.post_xfer(&mut request),
        Err(XferError::InvalidArgument(_))
    ));
}

#[test]
fn test_corrupted_completion_reports_failed() {
    let lo = loopback(16, 4);
    let src = create_test_data(128);
    let dst = vec![0u8; 128].into_boxed_slice();
    let local = register_buffer(&lo.engine, &src);
    let remote = import_buffer(&lo.engine, &dst);

    let mut request = lo
        .engine
        .prep_xfer(
            XferOp::Write,
            &[local.full_view()],
            &[remote.full_view()],
            PEER,
            ExecStream(0),
        )
        .unwrap();
    lo.engine.post_xfer(&mut request).unwrap();
    lo.provider.corrupt_next_completion();
    lo.provider.drain().unwrap();
    assert_eq!(lo.engine.check_xfer(&request), XferStatus::Failed);
    // Failed is terminal for the request but not for the engine.
    lo.engine.release_req(request);

    let mut retry = lo
        .engine
        .prep_xfer(
            XferOp::Write,
            &[local.full_view()],
            &[remote.full_view()],
            PEER,
            ExecStream(0),
        )
        .unwrap();
    lo.engine.post_xfer(&mut retry).unwrap();
    lo.provider.drain().unwrap();
    assert_eq!(lo.engine.check_xfer(&retry), XferStatus::Complete);
    lo.engine.release_req(retry);
}

#[test]
fn test_ring_backpressure_and_reuse_after_release() {
    let lo = loopback(4, 1);
    let src = create_test_data(256);
    let dst = vec![0u8; 256].into_boxed_slice();
    let local = register_buffer(&lo.engine, &src);
    let remote = import_buffer(&lo.engine, &dst);

    let locals: Vec<_> = (0..4).map(|i| local.view(i * 64, 64)).collect();
    let remotes: Vec<_> = (0..4).map(|i| remote.view(i * 64, 64)).collect();
    let mut request = lo
        .engine
        .prep_xfer(XferOp::Write, &locals, &remotes, PEER, ExecStream(0))
        .unwrap();
    assert_eq!(request.num_slots(), 4);

    // The ring is fully claimed by the outstanding request.
    let overflow = lo.engine.prep_xfer(
        XferOp::Write,
        &[local.view(0, 64)],
        &[remote.view(0, 64)],
        PEER,
        ExecStream(0),
    );
    assert!(matches!(
        overflow,
        Err(XferError::ResourceExhausted { .. })
    ));

    lo.engine.post_xfer(&mut request).unwrap();
    lo.provider.drain().unwrap();
    assert_eq!(lo.engine.check_xfer(&request), XferStatus::Complete);
    lo.engine.release_req(request);

    // Released positions are silently reusable.
    let request = lo
        .engine
        .prep_xfer(
            XferOp::Write,
            &[local.view(0, 64)],
            &[remote.view(0, 64)],
            PEER,
            ExecStream(0),
        )
        .unwrap();
    assert_eq!(request.positions(), 4..5);
    lo.engine.release_req(request);
}

#[test]
fn test_disconnect_unknown_peer_is_noop() {
    let lo = loopback(16, 4);
    lo.engine.disconnect("never-connected");
    assert!(!lo.engine.is_connected("never-connected"));
    assert!(lo.engine.is_connected(PEER));
}

#[test]
fn test_supported_mems() {
    let lo = loopback(16, 4);
    let mems = lo.engine.supported_mems();
    assert!(mems.contains(&MemKind::Dram));
    assert!(mems.contains(&MemKind::Vram));
}

// Verifies the caller-side polling pattern: a poll loop on one thread while
// the execution context completes the batch on another.
#[tokio::test]
async fn test_poll_loop_until_complete() {
    let lo = loopback(16, 4);
    let src = create_test_data(2048);
    let dst = vec![0u8; 2048].into_boxed_slice();
    let local = register_buffer(&lo.engine, &src);
    let remote = import_buffer(&lo.engine, &dst);

    let mut request = lo
        .engine
        .prep_xfer(
            XferOp::Write,
            &[local.full_view()],
            &[remote.full_view()],
            PEER,
            ExecStream(0),
        )
        .unwrap();
    lo.engine.post_xfer(&mut request).unwrap();

    let provider = Arc::clone(&lo.provider);
    let worker = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(10));
        provider.drain().unwrap();
    });

    let start_time = std::time::Instant::now();
    loop {
        match lo.engine.check_xfer(&request) {
            XferStatus::Complete => break,
            XferStatus::Failed => panic!("transfer failed"),
            XferStatus::InProgress => {
                assert!(
                    start_time.elapsed() < Duration::from_secs(5),
                    "transfer did not complete in time"
                );
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        }
    }
    worker.join().unwrap();
    lo.engine.release_req(request);
    assert_eq!(&src[..], &dst[..]);
}
