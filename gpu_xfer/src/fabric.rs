/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Fabric provider seam.
//!
//! Everything device-specific lives behind [`FabricProvider`]: opening the
//! device, pinning/exporting memory regions, establishing connections from
//! opaque blobs, and the two fire-and-forget data-plane enqueues. The engine
//! never touches device APIs directly, so providers are swappable (a real
//! NIC-backed provider in production, [`crate::SimFabric`] in tests).

use std::fmt::Debug;
use std::sync::Arc;

use serde::Deserialize;
use serde::Serialize;

use crate::fabric_primitives::Blob;
use crate::fabric_primitives::ExecStream;
use crate::fabric_primitives::MemKind;
use crate::xfer_ring::XferRing;

/// The wire form of an exported region descriptor.
///
/// Produced when a region is registered and parsed back when a peer imports
/// it; the engine core only ever sees the encoded bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionExport {
    /// `token` - The exporting provider's region token.
    pub token: u64,
    /// `addr` - Base address of the region in the exporter's address space.
    pub addr: u64,
    /// `len` - Byte length of the region.
    pub len: u64,
    /// `kind` - The kind of memory backing the region.
    pub kind: MemKind,
}

/// External collaborator offering device setup and asynchronous remote-memory
/// primitives.
///
/// All methods are synchronous: setup calls return once the device has
/// acted, and the submit calls are fire-and-forget enqueues whose actual
/// data movement happens on the execution context. Failures are reported as
/// `anyhow::Error` and wrapped into typed [`crate::XferError`] variants at
/// the engine boundary.
pub trait FabricProvider: Send + Sync + Debug {
    /// Opens the fabric device named by `config.device`, returning an opaque
    /// device token used by every subsequent call.
    fn open_device(&self, config: &crate::XferConfig) -> Result<u64, anyhow::Error>;

    /// Closes a device previously opened with [`FabricProvider::open_device`].
    fn close_device(&self, device: u64) -> Result<(), anyhow::Error>;

    /// Pins and registers `[addr, addr + len)` for remote access, returning
    /// the provider's region token.
    fn register_region(
        &self,
        device: u64,
        addr: usize,
        len: usize,
        kind: MemKind,
    ) -> Result<u64, anyhow::Error>;

    /// Releases a registration made with [`FabricProvider::register_region`].
    fn deregister_region(&self, device: u64, token: u64) -> Result<(), anyhow::Error>;

    /// Reconstructs a peer's exported region for local use, returning a
    /// region token valid on this device.
    fn import_region(&self, device: u64, export: &RegionExport) -> Result<u64, anyhow::Error>;

    /// Local connection details to hand to peers out of band.
    fn conn_info(&self, device: u64) -> Result<Blob, anyhow::Error>;

    /// Establishes the fabric-level link described by a peer's connection
    /// blob, returning an opaque connection token.
    fn connect(&self, device: u64, blob: &[u8]) -> Result<u64, anyhow::Error>;

    /// Enqueues the read of ring position `pos` on `stream`. Returns as soon
    /// as the batch is enqueued; completion is reported through the slot's
    /// completion counter.
    fn submit_read(
        &self,
        stream: ExecStream,
        ring: &Arc<XferRing>,
        pos: u64,
    ) -> Result<(), anyhow::Error>;

    /// Enqueues the write of ring position `pos` on `stream`. Same contract
    /// as [`FabricProvider::submit_read`].
    fn submit_write(
        &self,
        stream: ExecStream,
        ring: &Arc<XferRing>,
        pos: u64,
    ) -> Result<(), anyhow::Error>;
}
