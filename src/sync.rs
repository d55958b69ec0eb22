// src/sync.rs
use std::sync::{Condvar, Mutex};

/// Counting semaphore on top of std's mutex and condvar. The standard
/// library covers the mutex and condvar primitives themselves; this is the
/// one primitive it lacks that the store pool needs.
pub struct Semaphore {
    count: Mutex<usize>,
    cond: Condvar,
}

impl Semaphore {
    pub fn new(permits: usize) -> Self {
        Self {
            count: Mutex::new(permits),
            cond: Condvar::new(),
        }
    }

    /// Blocks until a permit is available, then takes it.
    pub fn wait(&self) {
        let mut count = self.count.lock().unwrap_or_else(|e| e.into_inner());
        while *count == 0 {
            count = self.cond.wait(count).unwrap_or_else(|e| e.into_inner());
        }
        *count -= 1;
    }

    /// Returns a permit and wakes one waiter.
    pub fn post(&self) {
        let mut count = self.count.lock().unwrap_or_else(|e| e.into_inner());
        *count += 1;
        self.cond.notify_one();
    }

    /// Non-blocking acquire, used by tests and by callers that prefer
    /// failing over waiting.
    pub fn try_wait(&self) -> bool {
        let mut count = self.count.lock().unwrap_or_else(|e| e.into_inner());
        if *count == 0 {
            return false;
        }
        *count -= 1;
        true
    }
}
