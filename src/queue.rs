// src/queue.rs
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

struct Ring<T> {
    slots: Box<[Option<T>]>,
    front: usize,
    size: usize,
    closed: bool,
}

/// Fixed-capacity blocking queue shared by producers and consumers. `push`
/// fails when the queue is at capacity; the caller owns the backpressure
/// decision. `pop` blocks on empty, `pop_timeout` gives up after a deadline.
/// `close` wakes every blocked consumer; a closed queue still drains.
pub struct BoundedQueue<T> {
    ring: Mutex<Ring<T>>,
    cond: Condvar,
    capacity: usize,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "queue capacity must be positive");
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self {
            ring: Mutex::new(Ring {
                slots: slots.into_boxed_slice(),
                front: 0,
                size: 0,
                closed: false,
            }),
            cond: Condvar::new(),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.ring.lock().unwrap_or_else(|e| e.into_inner()).size
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the item back to the caller when the queue is full or closed.
    pub fn push(&self, item: T) -> Result<(), T> {
        let mut ring = self.ring.lock().unwrap_or_else(|e| e.into_inner());
        if ring.closed || ring.size == self.capacity {
            return Err(item);
        }
        let back = (ring.front + ring.size) % self.capacity;
        ring.slots[back] = Some(item);
        ring.size += 1;
        self.cond.notify_one();
        Ok(())
    }

    /// Blocks until an item is available. Returns `None` once the queue is
    /// closed and drained.
    pub fn pop(&self) -> Option<T> {
        let mut ring = self.ring.lock().unwrap_or_else(|e| e.into_inner());
        while ring.size == 0 {
            if ring.closed {
                return None;
            }
            ring = self.cond.wait(ring).unwrap_or_else(|e| e.into_inner());
        }
        Some(self.take_front(&mut ring))
    }

    /// Blocks for at most `timeout`. `None` on timeout or closed-and-drained.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut ring = self.ring.lock().unwrap_or_else(|e| e.into_inner());
        while ring.size == 0 {
            if ring.closed {
                return None;
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, res) = self
                .cond
                .wait_timeout(ring, deadline - now)
                .unwrap_or_else(|e| e.into_inner());
            ring = guard;
            if res.timed_out() && ring.size == 0 {
                return None;
            }
        }
        Some(self.take_front(&mut ring))
    }

    /// Marks the queue closed and wakes all blocked consumers.
    pub fn close(&self) {
        let mut ring = self.ring.lock().unwrap_or_else(|e| e.into_inner());
        ring.closed = true;
        self.cond.notify_all();
    }

    fn take_front(&self, ring: &mut Ring<T>) -> T {
        let item = ring.slots[ring.front].take();
        ring.front = (ring.front + 1) % self.capacity;
        ring.size -= 1;
        // Slot was filled by push under the same lock.
        item.unwrap()
    }
}
