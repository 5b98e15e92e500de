/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! # Transfer Ring
//!
//! This module provides the fixed-capacity ring of descriptor slots shared
//! between host threads and the asynchronous execution context.
//!
//! ## Core Components
//!
//! * `XferSlot` - A batch of up to K descriptor pairs plus an occupancy count
//!   and a completion counter.
//! * `XferRing` - A power-of-two circular array of slots, partitioned at any
//!   moment into ranges owned by outstanding transfer requests.
//!
//! ## Reservation Protocol
//!
//! Positions are absolute (never wrapped) u64 values handed out by a single
//! atomic `head` counter; a position's slot index is `pos & (capacity - 1)`.
//! Reservation is a lock-free compare-and-swap loop that refuses to advance
//! `head` more than `capacity` positions past the released low-water mark
//! `tail`, so a slot is never handed to a new request while a previous
//! occupant is still outstanding. Each granted position has exactly one
//! owner, which writes descriptors without further synchronization; only the
//! external execution context increments completion counters.

use std::cell::UnsafeCell;
use std::collections::BTreeMap;
use std::ops::Range;
use std::sync::Mutex;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use crate::fabric_primitives::XferDescriptor;
use crate::fabric_primitives::XferError;

/// One batch slot: up to `slot_capacity` descriptor pairs, the number of
/// pairs written into it, and the number the execution context has completed.
///
/// Invariant (absent corruption): `0 <= completed <= occupancy <= capacity`.
pub struct XferSlot {
    descs: Box<[UnsafeCell<XferDescriptor>]>,
    occupancy: AtomicU32,
    completed: AtomicU32,
}

// SAFETY: The descriptor cells are written only by the single owner of the
// slot's current reservation (enforced by the ring's reservation protocol)
// and read by the execution context only up to the occupancy it observed
// with Acquire ordering, after those writes were published by a Release
// store. The counters are atomics. No protection is provided against a
// caller violating the single-owner contract.
unsafe impl Sync for XferSlot {}

impl XferSlot {
    fn new(slot_capacity: u32) -> Self {
        let descs = (0..slot_capacity)
            .map(|_| UnsafeCell::new(XferDescriptor::default()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            descs,
            occupancy: AtomicU32::new(0),
            completed: AtomicU32::new(0),
        }
    }

    /// Zeroes both counters. Called by the reservation owner when the slot is
    /// granted, making wraparound reuse well-defined. Stale descriptor values
    /// from the previous occupant are overwritten before they become visible
    /// through the new occupancy.
    fn reset(&self) {
        self.occupancy.store(0, Ordering::Release);
        self.completed.store(0, Ordering::Release);
    }

    /// Writes the `index`-th descriptor pair and bumps the occupancy.
    ///
    /// Only legal while the caller owns this slot's in-flight reservation,
    /// and only with `index` equal to the current occupancy (pairs are placed
    /// in input order).
    fn write(&self, index: u32, desc: XferDescriptor) {
        // SAFETY: the reservation protocol grants this slot to exactly one
        // owner, and that owner is the only writer of the descriptor cells
        // until the position is released.
        unsafe {
            *self.descs[index as usize].get() = desc;
        }
        let prev = self.occupancy.fetch_add(1, Ordering::Release);
        debug_assert_eq!(prev, index, "descriptor pairs must be written in order");
    }

    /// Returns the `index`-th descriptor pair.
    ///
    /// Only legal for `index` below an occupancy the caller has already
    /// observed via [`XferSlot::counters`].
    pub fn descriptor(&self, index: u32) -> XferDescriptor {
        debug_assert!((index as usize) < self.descs.len());
        // SAFETY: descriptors below the observed occupancy were published by
        // the Release increment in `write` before the caller's Acquire load
        // of the occupancy, and are not rewritten until the position is
        // released and re-reserved.
        unsafe { *self.descs[index as usize].get() }
    }

    /// Lock-free snapshot of `(occupancy, completed)`.
    pub fn counters(&self) -> (u32, u32) {
        (
            self.occupancy.load(Ordering::Acquire),
            self.completed.load(Ordering::Acquire),
        )
    }

    /// Records one completed descriptor pair, refusing to overrun the
    /// occupancy.
    fn record_completion(&self) -> Result<(), ()> {
        let mut done = self.completed.load(Ordering::Acquire);
        loop {
            if done >= self.occupancy.load(Ordering::Acquire) {
                return Err(());
            }
            match self.completed.compare_exchange_weak(
                done,
                done + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(actual) => done = actual,
            }
        }
    }

    /// Unconditionally bumps the completion counter, bypassing the occupancy
    /// bound. Exists so the simulated provider can inject the overrun that
    /// polling reports as `Failed`.
    pub(crate) fn force_completion(&self) {
        self.completed.fetch_add(1, Ordering::AcqRel);
    }
}

impl std::fmt::Debug for XferSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (occupancy, completed) = self.counters();
        f.debug_struct("XferSlot")
            .field("capacity", &self.descs.len())
            .field("occupancy", &occupancy)
            .field("completed", &completed)
            .finish()
    }
}

/// The fixed-capacity transfer ring.
///
/// Shared by all concurrent transfer requests on one engine instance. The
/// ring is the only cross-thread mutation point of the engine's data plane:
/// `reserve` is a lock-free CAS loop, `write` needs no synchronization
/// (exclusive grant), and counter snapshots are plain atomic loads. `release`
/// takes a short internal lock to order out-of-order releases; it never
/// waits on in-flight work.
#[derive(Debug)]
pub struct XferRing {
    slots: Box<[XferSlot]>,
    mask: u64,
    slot_capacity: u32,
    /// Next unreserved absolute position.
    head: AtomicU64,
    /// Low-water mark: every position below it has been released.
    tail: AtomicU64,
    /// Released ranges that are not yet contiguous with `tail`,
    /// keyed by range start.
    parked: Mutex<BTreeMap<u64, u64>>,
}

impl XferRing {
    /// Creates a ring of `ring_capacity` slots of `slot_capacity` descriptor
    /// pairs each. `ring_capacity` must be a nonzero power of two.
    pub fn new(ring_capacity: u32, slot_capacity: u32) -> Result<Self, XferError> {
        if ring_capacity == 0 || !ring_capacity.is_power_of_two() {
            return Err(XferError::InvalidArgument(format!(
                "ring capacity must be a nonzero power of two, got {}",
                ring_capacity
            )));
        }
        if slot_capacity == 0 {
            return Err(XferError::InvalidArgument(
                "slot capacity must be nonzero".to_string(),
            ));
        }
        let slots = (0..ring_capacity)
            .map(|_| XferSlot::new(slot_capacity))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Ok(Self {
            slots,
            mask: (ring_capacity - 1) as u64,
            slot_capacity,
            head: AtomicU64::new(0),
            tail: AtomicU64::new(0),
            parked: Mutex::new(BTreeMap::new()),
        })
    }

    /// Number of slots in the ring.
    pub fn capacity(&self) -> u64 {
        self.slots.len() as u64
    }

    /// Maximum descriptor pairs per slot.
    pub fn slot_capacity(&self) -> u32 {
        self.slot_capacity
    }

    /// Next position `reserve` would grant.
    pub fn head(&self) -> u64 {
        self.head.load(Ordering::SeqCst)
    }

    /// Released low-water mark.
    pub fn tail(&self) -> u64 {
        self.tail.load(Ordering::SeqCst)
    }

    /// The slot backing an absolute position.
    pub fn slot(&self, pos: u64) -> &XferSlot {
        &self.slots[(pos & self.mask) as usize]
    }

    /// Atomically claims `count` consecutive positions as the caller's
    /// exclusive working set.
    ///
    /// Never blocks: the CAS loop either advances `head` or fails with
    /// `ResourceExhausted` when the grant would lap a position whose previous
    /// occupant has not been released. Granted slots are reset before the
    /// range is returned.
    pub fn reserve(&self, count: u64) -> Result<Range<u64>, XferError> {
        if count == 0 {
            return Err(XferError::InvalidArgument(
                "cannot reserve zero ring positions".to_string(),
            ));
        }
        let capacity = self.capacity();
        let start = self
            .head
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |head| {
                let tail = self.tail.load(Ordering::SeqCst);
                if head + count - tail <= capacity {
                    Some(head + count)
                } else {
                    None
                }
            })
            .map_err(|head| XferError::ResourceExhausted {
                requested: count,
                outstanding: head - self.tail.load(Ordering::SeqCst),
                capacity,
            })?;
        for pos in start..start + count {
            self.slot(pos).reset();
        }
        tracing::debug!("reserved ring positions [{}, {})", start, start + count);
        Ok(start..start + count)
    }

    /// Populates position `pos`'s `index`-th descriptor pair.
    ///
    /// Only legal while `pos` is owned by the caller's in-flight reservation.
    pub fn write(&self, pos: u64, index: u32, desc: XferDescriptor) {
        debug_assert!(index < self.slot_capacity);
        self.slot(pos).write(index, desc);
    }

    /// Lock-free `(occupancy, completed)` snapshot of position `pos`.
    pub fn occupancy_of(&self, pos: u64) -> (u32, u32) {
        self.slot(pos).counters()
    }

    /// Records one completed descriptor pair at position `pos` on behalf of
    /// the execution context.
    pub fn record_completion(&self, pos: u64) -> Result<(), XferError> {
        self.slot(pos)
            .record_completion()
            .map_err(|()| XferError::Corruption { pos })
    }

    /// Returns a request's position range to the free pool.
    ///
    /// `tail` only advances across contiguously released prefixes; a range
    /// released ahead of a still-outstanding neighbor is parked until the gap
    /// closes. Must only be called once per reservation, after the request's
    /// work has reached a terminal state.
    pub fn release(&self, range: Range<u64>) {
        let mut parked = self.parked.lock().unwrap();
        parked.insert(range.start, range.end);
        let mut tail = self.tail.load(Ordering::SeqCst);
        while let Some(end) = parked.remove(&tail) {
            tail = end;
        }
        self.tail.store(tail, Ordering::SeqCst);
        tracing::debug!(
            "released ring positions [{}, {}), tail now {}",
            range.start,
            range.end,
            tail
        );
    }
}
