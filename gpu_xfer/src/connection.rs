/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! # Connection Table
//!
//! Maps a peer identifier to its established fabric connection. The table is
//! a precondition gate: transfer preparation and remote-region import both
//! require an entry for the target peer.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;

use crate::fabric::FabricProvider;
use crate::fabric_primitives::Blob;
use crate::fabric_primitives::XferError;

/// An established fabric-level link to one peer.
#[derive(Debug)]
pub struct PeerConnection {
    peer: String,
    token: u64,
}

impl PeerConnection {
    /// The peer this connection reaches.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// The provider's connection token.
    pub fn token(&self) -> u64 {
        self.token
    }
}

/// Tracks established peer connections. At most one entry exists per peer
/// identifier; duplicate connect attempts fail rather than re-establish.
#[derive(Debug)]
pub struct ConnectionTable {
    provider: Arc<dyn FabricProvider>,
    device: u64,
    conn_details: Blob,
    peers: Mutex<HashMap<String, PeerConnection>>,
}

impl ConnectionTable {
    /// Creates the table and exports this engine's own connection details
    /// from the provider.
    pub fn new(provider: Arc<dyn FabricProvider>, device: u64) -> Result<Self, XferError> {
        let conn_details = provider.conn_info(device).map_err(XferError::ConnectFailed)?;
        Ok(Self {
            provider,
            device,
            conn_details,
            peers: Mutex::new(HashMap::new()),
        })
    }

    /// Local connection details to hand to peers out of band.
    pub fn conn_info(&self) -> Blob {
        self.conn_details.clone()
    }

    /// Establishes the link to `peer` from its connection blob.
    ///
    /// Fails with `AlreadyConnected` if an entry exists and `ConnectFailed`
    /// if the provider cannot establish the link. The table lock is held
    /// across the provider call so concurrent connects to the same peer can
    /// never both insert.
    pub fn connect(&self, peer: &str, blob: &[u8]) -> Result<(), XferError> {
        let mut peers = self.peers.lock().unwrap();
        if peers.contains_key(peer) {
            return Err(XferError::AlreadyConnected(peer.to_string()));
        }
        let token = self
            .provider
            .connect(self.device, blob)
            .map_err(XferError::ConnectFailed)?;
        peers.insert(
            peer.to_string(),
            PeerConnection {
                peer: peer.to_string(),
                token,
            },
        );
        tracing::info!("connected peer '{}'", peer);
        Ok(())
    }

    /// Whether a connection to `peer` exists.
    pub fn is_connected(&self, peer: &str) -> bool {
        self.peers.lock().unwrap().contains_key(peer)
    }

    /// Removes the entry for `peer`. A no-op when absent, which keeps
    /// teardown races harmless.
    pub fn disconnect(&self, peer: &str) {
        if self.peers.lock().unwrap().remove(peer).is_some() {
            tracing::info!("disconnected peer '{}'", peer);
        } else {
            tracing::debug!("disconnect of unknown peer '{}' ignored", peer);
        }
    }
}
