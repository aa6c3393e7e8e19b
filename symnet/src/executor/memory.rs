// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT
//! Byte-addressed guest memory.
//!
//! A [`MemoryObject`] is the engine-global identity of an allocation (name,
//! base address, size) shared by every state that can see it; the per-state
//! byte contents live in an [`ObjectState`] inside the state's
//! [`AddressSpace`]. This split is what lets a packet record name a
//! destination buffer once and have every receiver state resolve it in its
//! own address space.

use std::collections::BTreeMap;
use std::sync::Arc;

use symnet_shared::expr::{self, ExprRef};

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct MemId(pub u32);

#[derive(Debug)]
pub struct MemoryObject {
    pub id: MemId,
    pub name: String,
    pub addr: u64,
    pub size: usize,
}

/// Allocates [`MemoryObject`]s with unique ids and non-overlapping guest
/// addresses. One per run.
#[derive(Debug, Default)]
pub struct MemoryManager {
    objects: BTreeMap<MemId, Arc<MemoryObject>>,
    next_id: u32,
    next_addr: u64,
}

const BASE_ADDR: u64 = 0x1000;

impl MemoryManager {
    pub fn new() -> Self {
        MemoryManager {
            objects: BTreeMap::new(),
            next_id: 0,
            next_addr: BASE_ADDR,
        }
    }

    pub fn allocate(&mut self, name: impl Into<String>, size: usize) -> Arc<MemoryObject> {
        let id = MemId(self.next_id);
        self.next_id += 1;
        let addr = self.next_addr;
        // keep allocations aligned and non-adjacent so resolve() can spot
        // out-of-bounds addresses
        self.next_addr += ((size as u64 + 15) & !15) + 16;
        let mo = Arc::new(MemoryObject {
            id,
            name: name.into(),
            addr,
            size,
        });
        self.objects.insert(id, mo.clone());
        mo
    }

    pub fn get(&self, id: MemId) -> Option<&Arc<MemoryObject>> {
        self.objects.get(&id)
    }

    pub fn find_by_name(&self, name: &str) -> Option<&Arc<MemoryObject>> {
        self.objects.values().find(|mo| mo.name == name)
    }

    /// Resolve a guest address to the unique object containing it, plus the
    /// offset within it.
    pub fn resolve(&self, addr: u64) -> Option<(Arc<MemoryObject>, usize)> {
        self.objects
            .values()
            .find(|mo| addr >= mo.addr && addr < mo.addr + mo.size as u64)
            .map(|mo| (mo.clone(), (addr - mo.addr) as usize))
    }
}

/// Per-state contents of one memory object: a cell of symbolic bytes.
#[derive(Debug, Clone)]
pub struct ObjectState {
    bytes: Vec<ExprRef>,
}

impl ObjectState {
    pub fn new(size: usize) -> Self {
        ObjectState {
            bytes: (0..size).map(|_| expr::constant(0, 8)).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn read8(&self, offset: usize) -> ExprRef {
        self.bytes[offset].clone()
    }

    pub fn write8(&mut self, offset: usize, value: ExprRef) {
        self.bytes[offset] = value;
    }

    /// Fill the whole object with 8-bit reads of `array`.
    pub fn bind_array(&mut self, array: &expr::ArrayRef) {
        for (i, slot) in self.bytes.iter_mut().enumerate() {
            *slot = expr::read8(array, i);
        }
    }
}

/// A state's view of memory: writable byte stores keyed by object identity.
#[derive(Debug, Clone, Default)]
pub struct AddressSpace {
    objects: BTreeMap<MemId, ObjectState>,
}

impl AddressSpace {
    pub fn bind(&mut self, mo: &MemoryObject) -> &mut ObjectState {
        self.objects
            .entry(mo.id)
            .or_insert_with(|| ObjectState::new(mo.size))
    }

    pub fn find(&self, id: MemId) -> Option<&ObjectState> {
        self.objects.get(&id)
    }

    /// Writable view of an object's bytes. The object must be bound in this
    /// address space.
    pub fn writable(&mut self, id: MemId) -> Option<&mut ObjectState> {
        self.objects.get_mut(&id)
    }
}
