// src/worker.rs
//! Worker pool: pinned threads draining the shared task queue. A task is a
//! claimed connection plus the phase to run; workers drive the engine and
//! then either re-arm the descriptor or tear the connection down.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::debug;

use crate::config::DispatchMode;
use crate::conn::{ConnHandle, FlushResult, ProcessResult};
use crate::error::{PetrelError, PetrelResult};
use crate::queue::BoundedQueue;
use crate::server::ServerShared;

/// Which half of the request cycle a task covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Parse buffered bytes (and, in unified dispatch, read them first).
    Read,
    /// Flush the pending response.
    Write,
}

/// A unit of work. The submitter holds the connection's claim; the worker
/// inherits it and is responsible for releasing it or closing the
/// connection.
pub struct Task {
    pub conn: Arc<ConnHandle>,
    pub phase: Phase,
}

pub struct WorkerPool {
    queue: Arc<BoundedQueue<Task>>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn start(
        shared: Arc<ServerShared>,
        queue: Arc<BoundedQueue<Task>>,
        workers: usize,
    ) -> PetrelResult<Self> {
        let core_ids = core_affinity::get_core_ids().unwrap_or_default();
        let mut handles = Vec::with_capacity(workers);
        for i in 0..workers {
            let core_id = (!core_ids.is_empty()).then(|| core_ids[i % core_ids.len()]);
            let shared = shared.clone();
            let queue = queue.clone();
            let handle = thread::Builder::new()
                .name(format!("petrel-worker-{}", i))
                .spawn(move || {
                    if let Some(id) = core_id {
                        if core_affinity::set_for_current(id) {
                            debug!("worker {} pinned to cpu {}", i, id.id);
                        }
                    }
                    worker_loop(i, &shared, &queue);
                })
                .map_err(|e| PetrelError::Other(format!("spawning worker {}: {}", i, e)))?;
            handles.push(handle);
        }
        Ok(Self { queue, handles })
    }

    pub fn queue(&self) -> &Arc<BoundedQueue<Task>> {
        &self.queue
    }

    /// Closes the queue and waits for every worker to drain and exit.
    pub fn shutdown(self) {
        self.queue.close();
        for handle in self.handles {
            let _ = handle.join();
        }
    }
}

fn worker_loop(id: usize, shared: &ServerShared, queue: &BoundedQueue<Task>) {
    while let Some(task) = queue.pop() {
        run_task(shared, task);
    }
    debug!("worker {} exiting", id);
}

/// Executes one task. The claim taken by the submitter is resolved here:
/// `rearm_*` releases it before re-registering the descriptor, `teardown`
/// retires the connection for good. Also runs on the reactor thread when
/// the queue rejects a task.
pub(crate) fn run_task(shared: &ServerShared, task: Task) {
    let handle = task.conn;
    if handle.is_closed() {
        handle.release_claim();
        return;
    }
    match task.phase {
        Phase::Read => run_read(shared, &handle),
        Phase::Write => run_write(shared, &handle),
    }
}

fn run_read(shared: &ServerShared, handle: &Arc<ConnHandle>) {
    let mut conn = handle.lock();
    if shared.config.dispatch == DispatchMode::Unified {
        // Unified dispatch reads on the worker; split-phase connections
        // arrive already fed by the reactor.
        if !conn.feed(shared.config.conn_trigger) {
            drop(conn);
            shared.teardown(handle);
            return;
        }
    }
    let result = {
        let mut store = shared.store_pool.acquire();
        conn.process(&shared.routes, Some(&mut *store))
    };
    drop(conn);
    match result {
        ProcessResult::NeedRead => shared.rearm_read(handle),
        ProcessResult::NeedWrite => {
            shared.metrics.inc_request();
            shared.rearm_write(handle);
        }
        ProcessResult::Close => shared.teardown(handle),
    }
}

fn run_write(shared: &ServerShared, handle: &Arc<ConnHandle>) {
    let mut conn = handle.lock();
    let pending_before = conn.bytes_pending();
    let outcome = conn.flush();
    let sent = pending_before - conn.bytes_pending();
    drop(conn);
    shared.metrics.add_bytes(sent);
    match outcome {
        FlushResult::Again => shared.rearm_write(handle),
        FlushResult::KeepAlive => shared.rearm_read(handle),
        FlushResult::Close | FlushResult::Error => shared.teardown(handle),
    }
}
