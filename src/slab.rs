// src/slab.rs
use std::sync::Arc;

use crate::conn::ConnHandle;

enum Slot {
    /// Free slot, chaining to the next free index (-1 terminates).
    Free(i32),
    Used(Arc<ConnHandle>),
}

/// Fixed-capacity connection table. The slot index doubles as the epoll
/// token for the connection, so lookups on readiness events are O(1).
pub struct ConnSlab {
    slots: Vec<Slot>,
    head_free: i32,
    active: usize,
}

impl ConnSlab {
    pub fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        for i in 0..capacity {
            let next = if i == capacity - 1 { -1 } else { (i + 1) as i32 };
            slots.push(Slot::Free(next));
        }
        Self {
            slots,
            head_free: if capacity == 0 { -1 } else { 0 },
            active: 0,
        }
    }

    /// O(1) allocation. Returns the token, or None at capacity.
    pub fn insert(&mut self, make: impl FnOnce(usize) -> Arc<ConnHandle>) -> Option<usize> {
        if self.head_free == -1 {
            return None;
        }
        let idx = self.head_free as usize;
        let Slot::Free(next) = self.slots[idx] else {
            // Free-list corruption would be a logic error; fail allocation.
            return None;
        };
        self.head_free = next;
        self.slots[idx] = Slot::Used(make(idx));
        self.active += 1;
        Some(idx)
    }

    /// O(1) deallocation. Freeing an already-free slot is a no-op.
    pub fn free(&mut self, index: usize) {
        if index >= self.slots.len() {
            return;
        }
        if matches!(self.slots[index], Slot::Free(_)) {
            return;
        }
        self.slots[index] = Slot::Free(self.head_free);
        self.head_free = index as i32;
        self.active -= 1;
    }

    pub fn get(&self, index: usize) -> Option<Arc<ConnHandle>> {
        match self.slots.get(index) {
            Some(Slot::Used(handle)) => Some(handle.clone()),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.active
    }

    pub fn is_empty(&self) -> bool {
        self.active == 0
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Every live handle, for shutdown teardown.
    pub fn drain_handles(&mut self) -> Vec<Arc<ConnHandle>> {
        let mut out = Vec::new();
        for i in 0..self.slots.len() {
            if let Slot::Used(handle) = &self.slots[i] {
                out.push(handle.clone());
                self.free(i);
            }
        }
        out
    }
}
