/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! This file contains primitive data structures shared across the transfer
//! engine.
//!
//! Primitives:
//! - `XferConfig`: Engine configuration, holding the fabric/GPU device names,
//!   the ring and slot geometry, and the provider queue sizes.
//! - `XferOp`: The type of transfer operation to perform (Read or Write).
//! - `XferStatus`: Observed state of a submitted transfer request.
//! - `ExecStream`: Opaque token for the execution context (e.g. a device
//!   stream) a batch runs on.
//! - `MemKind`: The kind of memory backing a registered region.
//! - `MemRegionView`: A caller-constructed window into a registered region,
//!   the unit a descriptor pair is built from.
//! - `XferDescriptor`: One resolved (local, remote) buffer pair as stored in
//!   a ring slot.
//! - `XferError`: The error taxonomy surfaced by every fallible operation.

use std::fmt;

use serde::Deserialize;
use serde::Serialize;

/// An opaque byte payload produced or consumed by a serialization helper
/// outside this crate's core: exported region descriptors and connection
/// details are carried as blobs and never interpreted by the engine itself.
pub type Blob = Vec<u8>;

/// The kind of memory backing a registered region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemKind {
    /// Host memory.
    Dram,
    /// Device memory.
    Vram,
}

impl fmt::Display for MemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemKind::Dram => write!(f, "DRAM"),
            MemKind::Vram => write!(f, "VRAM"),
        }
    }
}

/// The transfer operation applied to every descriptor pair of a request.
///
/// * `Write` - data moves from each pair's local region to its remote region.
/// * `Read` - data moves from each pair's remote region into its local region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum XferOp {
    Read,
    Write,
}

/// Observed state of a submitted transfer request.
///
/// Produced by polling the per-slot completion counters; polling is pure and
/// repeatable, so the same ring state always yields the same status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XferStatus {
    /// At least one slot has completions outstanding.
    InProgress,
    /// Every slot's completion counter has reached its occupancy.
    Complete,
    /// A completion counter overran its slot's occupancy. Fatal for the
    /// request; the engine itself stays usable.
    Failed,
}

/// Opaque token for the execution context a batch is enqueued on, e.g. a
/// device stream or queue. The engine never schedules the context; it only
/// hands the token through to the fabric provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ExecStream(pub u64);

/// Engine configuration.
///
/// Passed once at engine construction; the ring geometry is fixed for the
/// engine's lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct XferConfig {
    /// `device` - The fabric (NIC) device to open, e.g. "mlx5_0".
    pub device: String,
    /// `gpu_device` - The execution-context device, e.g. "cuda:0".
    pub gpu_device: String,
    /// `ring_capacity` - Number of slots in the transfer ring. Must be a
    /// power of two. Outstanding (unreleased) requests may never hold more
    /// than this many slots in aggregate; size it for the expected number of
    /// concurrent requests times their slot counts.
    pub ring_capacity: u32,
    /// `slot_capacity` - Maximum descriptor pairs per ring slot.
    pub slot_capacity: u32,
    /// `send_queue_size` - Provider send queue depth.
    pub send_queue_size: u32,
    /// `recv_queue_size` - Provider receive queue depth.
    pub recv_queue_size: u32,
}

impl Default for XferConfig {
    fn default() -> Self {
        Self {
            device: "mlx5_0".to_string(),
            gpu_device: "cuda:0".to_string(),
            ring_capacity: 16,
            slot_capacity: 512,
            send_queue_size: 2048,
            recv_queue_size: 2048,
        }
    }
}

impl fmt::Display for XferConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "XferConfig {{ device: {}, gpu_device: {}, ring_capacity: {}, slot_capacity: {}, send_queue_size: {}, recv_queue_size: {} }}",
            self.device,
            self.gpu_device,
            self.ring_capacity,
            self.slot_capacity,
            self.send_queue_size,
            self.recv_queue_size,
        )
    }
}

/// A window into a registered memory region, identified by the handle id the
/// registry assigned at registration or import time.
///
/// Views are transient: a caller builds one per descriptor pair and the
/// engine consumes it during request preparation. The underlying memory must
/// stay valid while transfers referencing it are in flight; the engine does
/// not enforce this (caller contract).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemRegionView {
    /// `handle` - Id of the registered or imported region.
    pub handle: u64,
    /// `offset` - Byte offset of the window within the region.
    pub offset: u64,
    /// `len` - Byte length of the window.
    pub len: u64,
}

impl MemRegionView {
    /// Creates a new view into the region identified by `handle`.
    pub fn new(handle: u64, offset: u64, len: u64) -> Self {
        Self {
            handle,
            offset,
            len,
        }
    }
}

/// One resolved (local, remote) buffer pair as stored in a ring slot.
///
/// Handle ids have already been resolved to provider region tokens by the
/// time a descriptor is written; the execution context consumes tokens and
/// offsets directly, without registry access.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct XferDescriptor {
    /// `local_token` - Provider token of the local region.
    pub local_token: u64,
    /// `local_offset` - Byte offset within the local region.
    pub local_offset: u64,
    /// `remote_token` - Provider token of the imported remote region.
    pub remote_token: u64,
    /// `remote_offset` - Byte offset within the remote region.
    pub remote_offset: u64,
    /// `len` - Byte length moved by this pair.
    pub len: u64,
}

/// The type of error that can occur on engine operations.
#[derive(thiserror::Error, Debug)]
pub enum XferError {
    /// Malformed caller input: mismatched descriptor lists, zero-length
    /// batches, out-of-bounds views.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// An unknown memory handle or peer was named.
    #[error("not found: {0}")]
    NotFound(String),

    /// The operation requires an established connection to the peer.
    #[error("peer '{0}' is not connected")]
    PeerNotConnected(String),

    /// A connection to the peer already exists.
    #[error("peer '{0}' is already connected")]
    AlreadyConnected(String),

    /// An exported-region blob could not be parsed.
    #[error("malformed region descriptor blob")]
    MalformedBlob(#[source] anyhow::Error),

    /// The fabric provider rejected a region registration or import.
    #[error("fabric region registration failed")]
    RegistrationFailed(#[source] anyhow::Error),

    /// The fabric provider could not establish the connection.
    #[error("fabric connection failed")]
    ConnectFailed(#[source] anyhow::Error),

    /// The ring cannot hold the requested positions until outstanding
    /// requests are released.
    #[error(
        "ring exhausted: {requested} slots requested, {outstanding} outstanding, capacity {capacity}"
    )]
    ResourceExhausted {
        requested: u64,
        outstanding: u64,
        capacity: u64,
    },

    /// A completion counter overran its slot's occupancy.
    #[error("completion counter overran occupancy at ring position {pos}")]
    Corruption { pos: u64 },

    /// Some other error.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = XferConfig::default();
        assert!(config.ring_capacity.is_power_of_two());
        assert!(config.slot_capacity > 0);
        assert_eq!(config.send_queue_size, config.recv_queue_size);
    }

    #[test]
    fn test_config_display() {
        let config = XferConfig::default();
        let display_output = format!("{}", config);
        assert!(display_output.contains(&config.device));
        assert!(display_output.contains("ring_capacity: 16"));
    }

    #[test]
    fn test_mem_kind_display() {
        assert_eq!(format!("{}", MemKind::Dram), "DRAM");
        assert_eq!(format!("{}", MemKind::Vram), "VRAM");
    }

    #[test]
    fn test_error_display() {
        let err = XferError::ResourceExhausted {
            requested: 4,
            outstanding: 14,
            capacity: 16,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("4 slots requested"));
        assert!(msg.contains("capacity 16"));

        let err = XferError::PeerNotConnected("worker-1".to_string());
        assert!(format!("{}", err).contains("worker-1"));
    }
}
