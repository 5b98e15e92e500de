/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Test support: an in-process fabric provider.
//!
//! `SimFabric` implements [`FabricProvider`] entirely in host memory: region
//! registration records address ranges, connection blobs are bincode
//! envelopes, and submitted batches are queued until the test drives them to
//! completion with [`SimFabric::complete_next`] or [`SimFabric::drain`],
//! which perform the actual byte movement and bump the slots' completion
//! counters the way a device-side execution context would.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;

use anyhow::anyhow;
use serde::Deserialize;
use serde::Serialize;

use crate::fabric::FabricProvider;
use crate::fabric::RegionExport;
use crate::fabric_primitives::Blob;
use crate::fabric_primitives::ExecStream;
use crate::fabric_primitives::MemKind;
use crate::fabric_primitives::XferConfig;
use crate::fabric_primitives::XferError;
use crate::fabric_primitives::XferOp;
use crate::xfer_ring::XferRing;

/// Connection-details envelope exchanged between simulated endpoints.
#[derive(Debug, Serialize, Deserialize)]
struct SimEndpoint {
    device: u64,
}

#[derive(Debug, Clone, Copy)]
struct SimRegion {
    addr: u64,
    len: u64,
    #[allow(dead_code)]
    kind: MemKind,
}

#[derive(Debug)]
struct PendingOp {
    op: XferOp,
    stream: ExecStream,
    ring: Arc<XferRing>,
    pos: u64,
}

#[derive(Debug, Default)]
struct SimState {
    next_device: u64,
    next_token: u64,
    next_conn: u64,
    regions: HashMap<u64, SimRegion>,
    pending: VecDeque<PendingOp>,
    fail_next_register: bool,
    corrupt_next_completion: bool,
}

/// An in-process [`FabricProvider`] whose "device" is the local address
/// space. Batches submitted to it sit in a queue until the test advances
/// them, so completion timing is fully deterministic.
#[derive(Debug, Default)]
pub struct SimFabric {
    state: Mutex<SimState>,
}

impl SimFabric {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of submitted batches not yet completed.
    pub fn pending_ops(&self) -> usize {
        self.state.lock().unwrap().pending.len()
    }

    /// Makes the next `register_region` call fail, as a fabric that rejects
    /// the memory kind would.
    pub fn fail_next_register(&self) {
        self.state.lock().unwrap().fail_next_register = true;
    }

    /// Makes the next completed batch overrun its slot's occupancy by one,
    /// the corruption signal polling reports as `Failed`.
    pub fn corrupt_next_completion(&self) {
        self.state.lock().unwrap().corrupt_next_completion = true;
    }

    /// Executes the oldest pending batch: moves the bytes of every
    /// descriptor pair in its slot and records the completions. Returns
    /// `false` when nothing was pending.
    pub fn complete_next(&self) -> Result<bool, XferError> {
        let mut state = self.state.lock().unwrap();
        let Some(pending) = state.pending.pop_front() else {
            return Ok(false);
        };
        let (occupancy, _) = pending.ring.occupancy_of(pending.pos);
        for index in 0..occupancy {
            let desc = pending.ring.slot(pending.pos).descriptor(index);
            let local = state
                .regions
                .get(&desc.local_token)
                .copied()
                .ok_or_else(|| XferError::NotFound(format!("region token {}", desc.local_token)))?;
            let remote = state
                .regions
                .get(&desc.remote_token)
                .copied()
                .ok_or_else(|| {
                    XferError::NotFound(format!("region token {}", desc.remote_token))
                })?;
            let (src, dst) = match pending.op {
                XferOp::Write => (local.addr + desc.local_offset, remote.addr + desc.remote_offset),
                XferOp::Read => (remote.addr + desc.remote_offset, local.addr + desc.local_offset),
            };
            // SAFETY: both ranges were registered by the test from live
            // buffers that must outlive in-flight transfers (the same
            // contract real fabric registration imposes), and registration
            // bounds-checked them against their regions.
            unsafe {
                std::ptr::copy_nonoverlapping(
                    src as *const u8,
                    dst as *mut u8,
                    desc.len as usize,
                );
            }
            pending.ring.record_completion(pending.pos)?;
        }
        if state.corrupt_next_completion {
            state.corrupt_next_completion = false;
            pending.ring.slot(pending.pos).force_completion();
        }
        tracing::debug!(
            "sim completed {:?} batch at position {} on stream {:?}",
            pending.op,
            pending.pos,
            pending.stream
        );
        Ok(true)
    }

    /// Completes every pending batch, returning how many ran.
    pub fn drain(&self) -> Result<usize, XferError> {
        let mut completed = 0;
        while self.complete_next()? {
            completed += 1;
        }
        Ok(completed)
    }

    fn submit(
        &self,
        op: XferOp,
        stream: ExecStream,
        ring: &Arc<XferRing>,
        pos: u64,
    ) -> Result<(), anyhow::Error> {
        self.state.lock().unwrap().pending.push_back(PendingOp {
            op,
            stream,
            ring: Arc::clone(ring),
            pos,
        });
        Ok(())
    }
}

impl FabricProvider for SimFabric {
    fn open_device(&self, config: &XferConfig) -> Result<u64, anyhow::Error> {
        let mut state = self.state.lock().unwrap();
        state.next_device += 1;
        tracing::debug!(
            "sim opened device '{}' (gpu '{}') as {}",
            config.device,
            config.gpu_device,
            state.next_device
        );
        Ok(state.next_device)
    }

    fn close_device(&self, _device: u64) -> Result<(), anyhow::Error> {
        Ok(())
    }

    fn register_region(
        &self,
        _device: u64,
        addr: usize,
        len: usize,
        kind: MemKind,
    ) -> Result<u64, anyhow::Error> {
        let mut state = self.state.lock().unwrap();
        if state.fail_next_register {
            state.fail_next_register = false;
            return Err(anyhow!("fabric rejected {} region of {} bytes", kind, len));
        }
        state.next_token += 1;
        let token = state.next_token;
        state.regions.insert(
            token,
            SimRegion {
                addr: addr as u64,
                len: len as u64,
                kind,
            },
        );
        Ok(token)
    }

    fn deregister_region(&self, _device: u64, token: u64) -> Result<(), anyhow::Error> {
        self.state
            .lock()
            .unwrap()
            .regions
            .remove(&token)
            .map(|_| ())
            .ok_or_else(|| anyhow!("unknown region token {}", token))
    }

    fn import_region(&self, _device: u64, export: &RegionExport) -> Result<u64, anyhow::Error> {
        let state = self.state.lock().unwrap();
        let region = state
            .regions
            .get(&export.token)
            .ok_or_else(|| anyhow!("exported region token {} not known to fabric", export.token))?;
        if region.len != export.len {
            return Err(anyhow!(
                "export length {} disagrees with registered length {}",
                export.len,
                region.len
            ));
        }
        // The simulated fabric shares one address space, so the exporter's
        // token is directly usable on the importing side.
        Ok(export.token)
    }

    fn conn_info(&self, device: u64) -> Result<Blob, anyhow::Error> {
        Ok(bincode::serialize(&SimEndpoint { device })?)
    }

    fn connect(&self, _device: u64, blob: &[u8]) -> Result<u64, anyhow::Error> {
        let endpoint: SimEndpoint = bincode::deserialize(blob)
            .map_err(|err| anyhow!("malformed connection blob: {}", err))?;
        let mut state = self.state.lock().unwrap();
        state.next_conn += 1;
        tracing::debug!(
            "sim connected to endpoint device {} as connection {}",
            endpoint.device,
            state.next_conn
        );
        Ok(state.next_conn)
    }

    fn submit_read(
        &self,
        stream: ExecStream,
        ring: &Arc<XferRing>,
        pos: u64,
    ) -> Result<(), anyhow::Error> {
        self.submit(XferOp::Read, stream, ring, pos)
    }

    fn submit_write(
        &self,
        stream: ExecStream,
        ring: &Arc<XferRing>,
        pos: u64,
    ) -> Result<(), anyhow::Error> {
        self.submit(XferOp::Write, stream, ring, pos)
    }
}
