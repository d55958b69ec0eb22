// src/store.rs
//! Backing credential store: a key/value lookup-and-insert capability behind
//! a fixed-size, semaphore-gated handle pool. The engine never assumes a
//! particular wire protocol; any store that can answer `lookup`/`insert`
//! plugs in here.

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::error::{PetrelError, PetrelResult};
use crate::sync::Semaphore;

pub trait CredentialStore: Send {
    /// Returns the stored password for `user`, if any.
    fn lookup(&self, user: &str) -> Option<String>;
    /// Inserts a new credential pair. `false` when the user already exists
    /// or the store rejected the write.
    fn insert(&mut self, user: &str, password: &str) -> bool;
}

/// In-process credential table, optionally preloaded from a JSON object of
/// `{"user": "password"}` pairs at startup.
#[derive(Default)]
pub struct MemoryStore {
    users: HashMap<String, String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_file(path: &Path) -> PetrelResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        let users: HashMap<String, String> = serde_json::from_str(&raw)
            .map_err(|e| PetrelError::Config(format!("credentials file {:?}: {}", path, e)))?;
        Ok(Self { users })
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

impl CredentialStore for MemoryStore {
    fn lookup(&self, user: &str) -> Option<String> {
        self.users.get(user).cloned()
    }

    fn insert(&mut self, user: &str, password: &str) -> bool {
        if self.users.contains_key(user) {
            return false;
        }
        self.users.insert(user.to_string(), password.to_string());
        true
    }
}

/// A pooled handle onto one shared credential table. Every handle sees the
/// same data, so a registration through one is visible through all.
pub struct SharedStore {
    inner: Arc<Mutex<MemoryStore>>,
}

impl SharedStore {
    pub fn new(inner: Arc<Mutex<MemoryStore>>) -> Self {
        Self { inner }
    }
}

impl CredentialStore for SharedStore {
    fn lookup(&self, user: &str) -> Option<String> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .lookup(user)
    }

    fn insert(&mut self, user: &str, password: &str) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(user, password)
    }
}

/// Fixed pool of reusable store handles. A semaphore bounds concurrent
/// checkouts; the mutex guards the free list. Invariant: outstanding + idle
/// always equals the pool capacity.
pub struct StorePool {
    idle: Mutex<Vec<Box<dyn CredentialStore>>>,
    available: Semaphore,
    capacity: usize,
}

impl StorePool {
    pub fn new<F>(capacity: usize, mut make: F) -> Self
    where
        F: FnMut() -> Box<dyn CredentialStore>,
    {
        assert!(capacity > 0, "store pool capacity must be positive");
        let handles = (0..capacity).map(|_| make()).collect();
        Self {
            idle: Mutex::new(handles),
            available: Semaphore::new(capacity),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn idle_count(&self) -> usize {
        self.idle.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Checks a handle out, blocking while the pool is exhausted. This is
    /// the deliberate backpressure point: a worker waits here rather than
    /// failing the request.
    pub fn acquire(&self) -> StoreGuard<'_> {
        self.available.wait();
        let handle = {
            let mut idle = self.idle.lock().unwrap_or_else(|e| e.into_inner());
            // The semaphore permit guarantees a free handle.
            idle.pop().unwrap()
        };
        StoreGuard {
            pool: self,
            handle: Some(handle),
        }
    }

    fn release(&self, handle: Box<dyn CredentialStore>) {
        let mut idle = self.idle.lock().unwrap_or_else(|e| e.into_inner());
        idle.push(handle);
        drop(idle);
        self.available.post();
    }
}

/// Scoped checkout: the handle goes back to the pool when the guard drops.
pub struct StoreGuard<'a> {
    pool: &'a StorePool,
    handle: Option<Box<dyn CredentialStore>>,
}

impl Deref for StoreGuard<'_> {
    type Target = dyn CredentialStore;

    fn deref(&self) -> &Self::Target {
        self.handle.as_deref().unwrap()
    }
}

impl DerefMut for StoreGuard<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.handle.as_deref_mut().unwrap()
    }
}

impl Drop for StoreGuard<'_> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.pool.release(handle);
        }
    }
}
