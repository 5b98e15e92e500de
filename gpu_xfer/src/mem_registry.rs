/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! # Memory Registry
//!
//! Tracks registered local buffers and imported remote buffers as opaque
//! capability handles usable by the data plane.
//!
//! Local handles are created by registering a buffer with the fabric
//! provider, which pins the region and produces an exported descriptor blob
//! for out-of-band exchange. Remote handles are created by importing a
//! peer's blob. Handles carry no lifetime protection for the underlying
//! memory: deregistering while transfers are in flight is a caller-contract
//! violation the registry does not detect.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use serde::Deserialize;
use serde::Serialize;

use crate::fabric::FabricProvider;
use crate::fabric::RegionExport;
use crate::fabric_primitives::Blob;
use crate::fabric_primitives::MemKind;
use crate::fabric_primitives::MemRegionView;
use crate::fabric_primitives::XferError;

/// Opaque capability referencing a registered or imported memory region.
///
/// Local handles are exclusively owned by the caller that registered them;
/// remote handles belong to the registry entry created at import. The handle
/// itself is a value: cloning it does not duplicate fabric resources.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryHandle {
    id: u64,
    addr: u64,
    len: u64,
    kind: MemKind,
    /// Importing peer for remote handles; `None` for local registrations.
    peer: Option<String>,
}

impl MemoryHandle {
    /// Registry id of this handle.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Base address of the region (in the owner's address space).
    pub fn addr(&self) -> u64 {
        self.addr
    }

    /// Byte length of the region.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Whether the region is empty. Registration rejects empty regions, so
    /// this is false for any handle the registry produced.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The kind of memory backing the region.
    pub fn kind(&self) -> MemKind {
        self.kind
    }

    /// Whether this handle was imported from a peer.
    pub fn is_remote(&self) -> bool {
        self.peer.is_some()
    }

    /// A view of `len` bytes starting `offset` bytes into the region.
    pub fn view(&self, offset: u64, len: u64) -> MemRegionView {
        MemRegionView::new(self.id, offset, len)
    }

    /// A view covering the whole region.
    pub fn full_view(&self) -> MemRegionView {
        MemRegionView::new(self.id, 0, self.len)
    }
}

#[derive(Debug)]
struct LocalRegion {
    addr: u64,
    len: u64,
    kind: MemKind,
    token: u64,
    export: Blob,
}

#[derive(Debug)]
struct RemoteRegion {
    peer: String,
    len: u64,
    token: u64,
}

/// Handles registration, export, and import of memory regions.
#[derive(Debug)]
pub struct MemoryRegistry {
    provider: Arc<dyn FabricProvider>,
    device: u64,
    next_id: AtomicU64,
    local: Mutex<HashMap<u64, LocalRegion>>,
    remote: Mutex<HashMap<u64, RemoteRegion>>,
}

impl MemoryRegistry {
    pub fn new(provider: Arc<dyn FabricProvider>, device: u64) -> Self {
        Self {
            provider,
            device,
            next_id: AtomicU64::new(1),
            local: Mutex::new(HashMap::new()),
            remote: Mutex::new(HashMap::new()),
        }
    }

    /// Registers `[addr, addr + len)` with the fabric provider and stores the
    /// derived handle.
    ///
    /// Fails with `InvalidArgument` for empty regions and
    /// `RegistrationFailed` when the provider rejects the region (e.g. an
    /// unsupported memory kind) or resources are exhausted. If export-blob
    /// construction fails after the provider registration succeeded, the
    /// registration is unwound before the error surfaces.
    pub fn register(&self, addr: u64, len: u64, kind: MemKind) -> Result<MemoryHandle, XferError> {
        if len == 0 {
            return Err(XferError::InvalidArgument(
                "cannot register an empty region".to_string(),
            ));
        }
        let token = self
            .provider
            .register_region(self.device, addr as usize, len as usize, kind)
            .map_err(XferError::RegistrationFailed)?;

        let export = RegionExport {
            token,
            addr,
            len,
            kind,
        };
        let export = match bincode::serialize(&export) {
            Ok(blob) => blob,
            Err(err) => {
                if let Err(err) = self.provider.deregister_region(self.device, token) {
                    tracing::warn!("failed to unwind region registration: {}", err);
                }
                return Err(XferError::RegistrationFailed(anyhow::anyhow!(err)));
            }
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.local.lock().unwrap().insert(
            id,
            LocalRegion {
                addr,
                len,
                kind,
                token,
                export,
            },
        );
        tracing::debug!(
            "registered {} region {:#x} (+{}) as handle {}",
            kind,
            addr,
            len,
            id
        );
        Ok(MemoryHandle {
            id,
            addr,
            len,
            kind,
            peer: None,
        })
    }

    /// Releases the fabric resources behind `handle`.
    ///
    /// Safe to call only after all transfers referencing the handle have
    /// completed or been released (caller contract, not enforced here).
    pub fn deregister(&self, handle: &MemoryHandle) -> Result<(), XferError> {
        if handle.is_remote() {
            return match self.remote.lock().unwrap().remove(&handle.id) {
                Some(_) => {
                    tracing::debug!("unloaded remote handle {}", handle.id);
                    Ok(())
                }
                None => Err(XferError::NotFound(format!(
                    "remote handle {}",
                    handle.id
                ))),
            };
        }
        let region = self
            .local
            .lock()
            .unwrap()
            .remove(&handle.id)
            .ok_or_else(|| XferError::NotFound(format!("local handle {}", handle.id)))?;
        self.provider
            .deregister_region(self.device, region.token)
            .map_err(XferError::RegistrationFailed)?;
        tracing::debug!("deregistered handle {}", handle.id);
        Ok(())
    }

    /// Serializes a local handle's exported descriptor for transmission to a
    /// peer. Only valid for locally registered handles.
    pub fn export(&self, handle: &MemoryHandle) -> Result<Blob, XferError> {
        if handle.is_remote() {
            return Err(XferError::InvalidArgument(format!(
                "handle {} was imported from a peer and cannot be re-exported",
                handle.id
            )));
        }
        self.local
            .lock()
            .unwrap()
            .get(&handle.id)
            .map(|region| region.export.clone())
            .ok_or_else(|| XferError::NotFound(format!("local handle {}", handle.id)))
    }

    /// Reconstructs a remote handle from a peer's exported descriptor blob.
    ///
    /// Connection gating (`PeerNotConnected`) happens at the engine facade;
    /// the registry assumes the peer link exists.
    pub fn import_remote(&self, blob: &[u8], peer: &str) -> Result<MemoryHandle, XferError> {
        let export: RegionExport = bincode::deserialize(blob)
            .map_err(|err| XferError::MalformedBlob(anyhow::anyhow!(err)))?;
        let token = self
            .provider
            .import_region(self.device, &export)
            .map_err(XferError::RegistrationFailed)?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.remote.lock().unwrap().insert(
            id,
            RemoteRegion {
                peer: peer.to_string(),
                len: export.len,
                token,
            },
        );
        tracing::debug!(
            "imported remote {} region of peer '{}' as handle {}",
            export.kind,
            peer,
            id
        );
        Ok(MemoryHandle {
            id,
            addr: export.addr,
            len: export.len,
            kind: export.kind,
            peer: Some(peer.to_string()),
        })
    }

    /// Resolves a local view to its provider region token, bounds-checked.
    pub(crate) fn resolve_local(&self, view: &MemRegionView) -> Result<u64, XferError> {
        let local = self.local.lock().unwrap();
        let region = local
            .get(&view.handle)
            .ok_or_else(|| XferError::NotFound(format!("local handle {}", view.handle)))?;
        Self::check_bounds(view, region.len)?;
        Ok(region.token)
    }

    /// Resolves a remote view to its provider region token, bounds-checked.
    pub(crate) fn resolve_remote(&self, view: &MemRegionView) -> Result<u64, XferError> {
        let remote = self.remote.lock().unwrap();
        let region = remote
            .get(&view.handle)
            .ok_or_else(|| XferError::NotFound(format!("remote handle {}", view.handle)))?;
        Self::check_bounds(view, region.len)?;
        Ok(region.token)
    }

    /// Peer that exported the remote handle `id`, if any.
    pub fn remote_peer(&self, id: u64) -> Option<String> {
        self.remote
            .lock()
            .unwrap()
            .get(&id)
            .map(|region| region.peer.clone())
    }

    fn check_bounds(view: &MemRegionView, region_len: u64) -> Result<(), XferError> {
        if view.len == 0 || view.offset + view.len > region_len {
            return Err(XferError::InvalidArgument(format!(
                "view [{}, +{}) exceeds region of {} bytes",
                view.offset, view.len, region_len
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabric_primitives::XferConfig;
    use crate::test_utils::SimFabric;

    fn registry() -> (MemoryRegistry, Arc<SimFabric>) {
        let provider = Arc::new(SimFabric::new());
        let device = provider.open_device(&XferConfig::default()).unwrap();
        (
            MemoryRegistry::new(provider.clone() as Arc<dyn FabricProvider>, device),
            provider,
        )
    }

    #[test]
    fn test_register_and_export_round_trip() {
        let (registry, _provider) = registry();
        let buf = vec![0u8; 4096];
        let handle = registry
            .register(buf.as_ptr() as u64, buf.len() as u64, MemKind::Dram)
            .unwrap();
        assert!(!handle.is_remote());
        assert_eq!(handle.len(), 4096);

        let blob = registry.export(&handle).unwrap();
        let imported = registry.import_remote(&blob, "peer-a").unwrap();
        assert!(imported.is_remote());
        assert_eq!(imported.len(), 4096);
        assert_eq!(registry.remote_peer(imported.id()), Some("peer-a".into()));
    }

    #[test]
    fn test_register_empty_region_rejected() {
        let (registry, _provider) = registry();
        assert!(matches!(
            registry.register(0x1000, 0, MemKind::Dram),
            Err(XferError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_register_provider_rejection() {
        let (registry, provider) = registry();
        provider.fail_next_register();
        assert!(matches!(
            registry.register(0x1000, 64, MemKind::Vram),
            Err(XferError::RegistrationFailed(_))
        ));
    }

    #[test]
    fn test_deregister_unknown_handle() {
        let (registry, _provider) = registry();
        let buf = vec![0u8; 64];
        let handle = registry
            .register(buf.as_ptr() as u64, 64, MemKind::Dram)
            .unwrap();
        registry.deregister(&handle).unwrap();
        assert!(matches!(
            registry.deregister(&handle),
            Err(XferError::NotFound(_))
        ));
    }

    #[test]
    fn test_export_remote_handle_rejected() {
        let (registry, _provider) = registry();
        let buf = vec![0u8; 64];
        let handle = registry
            .register(buf.as_ptr() as u64, 64, MemKind::Dram)
            .unwrap();
        let blob = registry.export(&handle).unwrap();
        let imported = registry.import_remote(&blob, "peer-a").unwrap();
        assert!(matches!(
            registry.export(&imported),
            Err(XferError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_import_malformed_blob() {
        let (registry, _provider) = registry();
        assert!(matches!(
            registry.import_remote(b"not a region export", "peer-a"),
            Err(XferError::MalformedBlob(_))
        ));
    }

    #[test]
    fn test_view_bounds_checked() {
        let (registry, _provider) = registry();
        let buf = vec![0u8; 128];
        let handle = registry
            .register(buf.as_ptr() as u64, 128, MemKind::Dram)
            .unwrap();
        assert!(registry.resolve_local(&handle.view(64, 64)).is_ok());
        assert!(matches!(
            registry.resolve_local(&handle.view(64, 65)),
            Err(XferError::InvalidArgument(_))
        ));
        assert!(matches!(
            registry.resolve_local(&MemRegionView::new(999, 0, 1)),
            Err(XferError::NotFound(_))
        ));
    }
}
