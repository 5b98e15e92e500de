/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! # Transfer Engine
//!
//! The engine owns one transfer ring, one memory registry, and one
//! connection table, and exposes the caller-facing operation set:
//!
//! - Memory: `register_mem`, `deregister_mem`, `export_md`, `load_remote_md`
//! - Connections: `connect`, `disconnect`, `is_connected`, `conn_info`
//! - Transfers: `prep_xfer`, `post_xfer`, `check_xfer`, `release_req`
//!
//! ## Request Lifecycle
//!
//! `prep_xfer` validates the descriptor lists, reserves a contiguous range
//! of ring positions, and packs the pairs greedily in input order, filling
//! each slot to capacity before advancing. `post_xfer` enqueues every
//! position of the range on the request's execution stream and returns
//! immediately. `check_xfer` observes per-slot completion counters without
//! blocking and may be called from any thread, arbitrarily often.
//! `release_req` consumes the request and returns its positions to the free
//! pool; calling it before `check_xfer` reports a terminal state invites
//! reuse of positions whose asynchronous work has not finished, so that
//! ordering is a hard caller contract.
//!
//! The engine is an explicit instance: all ring and counter state lives in
//! it and dies with it.

use std::ops::Range;
use std::sync::Arc;

use anyhow::Context;

use crate::connection::ConnectionTable;
use crate::fabric::FabricProvider;
use crate::fabric_primitives::Blob;
use crate::fabric_primitives::ExecStream;
use crate::fabric_primitives::MemKind;
use crate::fabric_primitives::MemRegionView;
use crate::fabric_primitives::XferConfig;
use crate::fabric_primitives::XferDescriptor;
use crate::fabric_primitives::XferError;
use crate::fabric_primitives::XferOp;
use crate::fabric_primitives::XferStatus;
use crate::mem_registry::MemoryHandle;
use crate::mem_registry::MemoryRegistry;
use crate::xfer_ring::XferRing;

/// Handle to one prepared transfer request: the contiguous range of ring
/// positions it owns and the execution stream its batches run on.
///
/// Exactly one request owns any ring position at a time; the handle is not
/// cloneable and `release_req` consumes it, so a range cannot be returned to
/// the ring twice.
#[derive(Debug)]
pub struct XferRequest {
    op: XferOp,
    peer: String,
    stream: ExecStream,
    start: u64,
    end: u64,
    submitted: bool,
}

impl XferRequest {
    /// The operation applied to every descriptor pair.
    pub fn op(&self) -> XferOp {
        self.op
    }

    /// The peer the transfer targets.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// The execution stream the batches are enqueued on.
    pub fn stream(&self) -> ExecStream {
        self.stream
    }

    /// The half-open range of ring positions this request owns.
    pub fn positions(&self) -> Range<u64> {
        self.start..self.end
    }

    /// Number of ring slots claimed.
    pub fn num_slots(&self) -> u64 {
        self.end - self.start
    }

    /// Whether `post_xfer` has run for this request.
    pub fn is_submitted(&self) -> bool {
        self.submitted
    }
}

/// The transfer engine. See the module docs for the operation set.
#[derive(Debug)]
pub struct XferEngine {
    config: XferConfig,
    provider: Arc<dyn FabricProvider>,
    device: u64,
    ring: Arc<XferRing>,
    registry: MemoryRegistry,
    connections: ConnectionTable,
}

impl XferEngine {
    /// Builds an engine from a static configuration and a fabric provider.
    ///
    /// Validates the ring geometry, opens the configured device, and exports
    /// the local connection details. Any sub-resource acquired before a later
    /// step fails is unwound before the error surfaces.
    pub fn new(config: XferConfig, provider: Arc<dyn FabricProvider>) -> Result<Self, XferError> {
        let ring = Arc::new(XferRing::new(config.ring_capacity, config.slot_capacity)?);
        let device = provider
            .open_device(&config)
            .context("failed to open fabric device")
            .map_err(XferError::Other)?;
        let connections = match ConnectionTable::new(Arc::clone(&provider), device) {
            Ok(connections) => connections,
            Err(err) => {
                if let Err(close_err) = provider.close_device(device) {
                    tracing::warn!("failed to unwind device open: {}", close_err);
                }
                return Err(err);
            }
        };
        let registry = MemoryRegistry::new(Arc::clone(&provider), device);
        tracing::info!("transfer engine up: {}", config);
        Ok(Self {
            config,
            provider,
            device,
            ring,
            registry,
            connections,
        })
    }

    /// The engine's configuration.
    pub fn config(&self) -> &XferConfig {
        &self.config
    }

    /// The shared transfer ring.
    pub fn ring(&self) -> &Arc<XferRing> {
        &self.ring
    }

    /// Memory kinds this engine can register.
    pub fn supported_mems(&self) -> Vec<MemKind> {
        vec![MemKind::Dram, MemKind::Vram]
    }

    /// Registers `[addr, addr + len)` for remote access.
    pub fn register_mem(
        &self,
        addr: u64,
        len: u64,
        kind: MemKind,
    ) -> Result<MemoryHandle, XferError> {
        self.registry.register(addr, len, kind)
    }

    /// Releases the fabric resources behind `handle`. Caller contract: no
    /// transfer referencing the handle may still be in flight.
    pub fn deregister_mem(&self, handle: &MemoryHandle) -> Result<(), XferError> {
        self.registry.deregister(handle)
    }

    /// Serializes a local handle's descriptor for out-of-band transmission.
    pub fn export_md(&self, handle: &MemoryHandle) -> Result<Blob, XferError> {
        self.registry.export(handle)
    }

    /// Reconstructs a remote handle from `peer`'s exported descriptor blob.
    /// Requires an established connection to `peer`.
    pub fn load_remote_md(&self, blob: &[u8], peer: &str) -> Result<MemoryHandle, XferError> {
        if !self.connections.is_connected(peer) {
            return Err(XferError::PeerNotConnected(peer.to_string()));
        }
        self.registry.import_remote(blob, peer)
    }

    /// Local connection details to hand to peers out of band.
    pub fn conn_info(&self) -> Blob {
        self.connections.conn_info()
    }

    /// Establishes the link to `peer` from its connection blob.
    pub fn connect(&self, peer: &str, blob: &[u8]) -> Result<(), XferError> {
        self.connections.connect(peer, blob)
    }

    /// Whether a connection to `peer` exists.
    pub fn is_connected(&self, peer: &str) -> bool {
        self.connections.is_connected(peer)
    }

    /// Removes the connection entry for `peer`; a no-op when absent.
    pub fn disconnect(&self, peer: &str) {
        self.connections.disconnect(peer)
    }

    /// Builds a transfer request from parallel local/remote descriptor
    /// lists.
    ///
    /// All validation happens before the ring is touched: list lengths must
    /// match and be nonzero, every pair must have equal lengths, every view
    /// must resolve in bounds, and `peer` must be connected. A failed call
    /// therefore claims zero ring positions.
    ///
    /// Packing is greedy and deterministic: pairs are placed in input order,
    /// filling each slot to capacity before advancing, claiming exactly
    /// ceil(n / slot_capacity) positions. A final partial slot's occupancy is
    /// its actual fill, which is what completion is measured against.
    pub fn prep_xfer(
        &self,
        op: XferOp,
        local: &[MemRegionView],
        remote: &[MemRegionView],
        peer: &str,
        stream: ExecStream,
    ) -> Result<XferRequest, XferError> {
        if local.len() != remote.len() {
            return Err(XferError::InvalidArgument(format!(
                "descriptor list lengths differ: {} local vs {} remote",
                local.len(),
                remote.len()
            )));
        }
        if local.is_empty() {
            return Err(XferError::InvalidArgument(
                "empty descriptor list".to_string(),
            ));
        }
        if !self.connections.is_connected(peer) {
            return Err(XferError::PeerNotConnected(peer.to_string()));
        }

        let mut descs = Vec::with_capacity(local.len());
        for (lview, rview) in local.iter().zip(remote.iter()) {
            if lview.len != rview.len {
                return Err(XferError::InvalidArgument(format!(
                    "pair length mismatch: local {} vs remote {}",
                    lview.len, rview.len
                )));
            }
            let local_token = self.registry.resolve_local(lview)?;
            let remote_token = self.registry.resolve_remote(rview)?;
            descs.push(XferDescriptor {
                local_token,
                local_offset: lview.offset,
                remote_token,
                remote_offset: rview.offset,
                len: lview.len,
            });
        }

        let k = self.ring.slot_capacity() as usize;
        let slots = ((descs.len() + k - 1) / k) as u64;
        let range = self.ring.reserve(slots)?;
        for (i, desc) in descs.iter().enumerate() {
            let pos = range.start + (i / k) as u64;
            self.ring.write(pos, (i % k) as u32, *desc);
        }
        tracing::debug!(
            "prepared {:?} of {} pairs to '{}' in positions [{}, {})",
            op,
            descs.len(),
            peer,
            range.start,
            range.end
        );
        Ok(XferRequest {
            op,
            peer: peer.to_string(),
            stream,
            start: range.start,
            end: range.end,
            submitted: false,
        })
    }

    /// Asynchronously enqueues every position of the request's range on its
    /// execution stream. Returns as soon as the batches are enqueued; the
    /// data movement itself happens on the execution context.
    pub fn post_xfer(&self, request: &mut XferRequest) -> Result<(), XferError> {
        if request.submitted {
            return Err(XferError::InvalidArgument(
                "request was already submitted".to_string(),
            ));
        }
        for pos in request.positions() {
            match request.op {
                XferOp::Read => self.provider.submit_read(request.stream, &self.ring, pos),
                XferOp::Write => self.provider.submit_write(request.stream, &self.ring, pos),
            }
            .with_context(|| format!("enqueue of ring position {} failed", pos))
            .map_err(XferError::Other)?;
        }
        request.submitted = true;
        tracing::debug!(
            "submitted {:?} positions [{}, {}) on stream {:?}",
            request.op,
            request.start,
            request.end,
            request.stream
        );
        Ok(())
    }

    /// Non-blocking completion observation.
    ///
    /// `Complete` iff every slot in the request's range has a completion
    /// counter equal to its occupancy; `Failed` if any counter exceeds its
    /// occupancy (a corruption signal, fatal for this request only);
    /// `InProgress` otherwise. Pure and repeatable: callers poll in a loop
    /// until a terminal state, from any thread.
    pub fn check_xfer(&self, request: &XferRequest) -> XferStatus {
        let mut complete = true;
        for pos in request.positions() {
            let (occupancy, completed) = self.ring.occupancy_of(pos);
            if completed > occupancy {
                tracing::error!(
                    "completion counter {} overran occupancy {} at position {}",
                    completed,
                    occupancy,
                    pos
                );
                return XferStatus::Failed;
            }
            if completed < occupancy {
                complete = false;
            }
        }
        if complete {
            XferStatus::Complete
        } else {
            XferStatus::InProgress
        }
    }

    /// Returns the request's positions to the ring's free pool.
    ///
    /// Must only be called after `check_xfer` reports `Complete` or
    /// `Failed`; releasing earlier lets a future reservation reuse positions
    /// whose asynchronous work has not finished.
    pub fn release_req(&self, request: XferRequest) {
        tracing::debug!(
            "releasing request positions [{}, {})",
            request.start,
            request.end
        );
        self.ring.release(request.positions());
    }
}

impl Drop for XferEngine {
    fn drop(&mut self) {
        if let Err(err) = self.provider.close_device(self.device) {
            tracing::warn!("failed to close fabric device: {}", err);
        }
    }
}
