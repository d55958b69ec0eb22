// src/server.rs
//! The reactor: accepts connections, waits on epoll, routes readiness into
//! worker tasks, and evicts idle connections on the periodic alarm. Signals
//! arrive through a self-pipe so the event loop stays the only place that
//! acts on them.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::{debug, info, warn};

use crate::config::{DispatchMode, ServerConfig, TriggerMode};
use crate::conn::{ConnHandle, Connection};
use crate::error::PetrelResult;
use crate::metrics::ServerMetrics;
use crate::queue::BoundedQueue;
use crate::router::RouteTable;
use crate::slab::ConnSlab;
use crate::store::{MemoryStore, SharedStore, StorePool};
use crate::syscalls::{
    self, EPOLLERR, EPOLLHUP, EPOLLIN, EPOLLOUT, EPOLLRDHUP, Epoll, epoll_event,
};
use crate::timer::TimerList;
use crate::worker::{self, Phase, Task, WorkerPool};

/// Reserved tokens; connection tokens are slab indices and stay far below.
const LISTEN_TOKEN: u64 = u64::MAX;
const SIGNAL_TOKEN: u64 = u64::MAX - 1;

const MAX_CONNECTIONS: usize = 65_536;
const EVENT_BATCH: usize = 1024;
const BUSY_REPLY: &[u8] = b"Internal server busy";

/// State shared between the reactor and the workers.
pub struct ServerShared {
    pub config: Arc<ServerConfig>,
    pub metrics: Arc<ServerMetrics>,
    pub store_pool: StorePool,
    pub routes: RouteTable,
    epoll: Epoll,
    slab: Mutex<ConnSlab>,
    timers: Mutex<TimerList>,
    shutdown: AtomicBool,
}

impl ServerShared {
    pub fn now_secs() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    fn lock_slab(&self) -> std::sync::MutexGuard<'_, ConnSlab> {
        self.slab.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_timers(&self) -> std::sync::MutexGuard<'_, TimerList> {
        self.timers.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Pushes the idle deadline out to a fresh full window.
    pub fn refresh_timer(&self, handle: &ConnHandle) {
        let deadline = Self::now_secs() + self.config.idle_timeout_secs();
        self.lock_timers().adjust(handle.token() as u64, deadline);
    }

    /// Re-registers the descriptor for read readiness and hands the claim
    /// back. The claim is released before the one-shot is re-armed: until
    /// the modify lands no new event can arrive, and an event delivered
    /// right after (EPOLLOUT usually is) must find the connection
    /// claimable or the reactor drops it and nobody re-arms.
    pub fn rearm_read(&self, handle: &Arc<ConnHandle>) {
        self.rearm(handle, EPOLLIN as u32);
    }

    pub fn rearm_write(&self, handle: &Arc<ConnHandle>) {
        self.rearm(handle, EPOLLOUT as u32);
    }

    fn rearm(&self, handle: &Arc<ConnHandle>, interest: u32) {
        if handle.is_closed() {
            return;
        }
        self.refresh_timer(handle);
        handle.release_claim();
        if let Err(e) = self.epoll.modify(
            handle.fd(),
            handle.token() as u64,
            interest,
            self.config.conn_trigger,
            true,
        ) {
            // A racing eviction may have claimed and retired the fd; the
            // teardown below is then a no-op.
            warn!("re-arming fd {}: {}", handle.fd(), e);
            self.teardown(handle);
        }
    }

    /// Retires a connection: unregister, close, free the slot, drop the
    /// timer. Idempotent; the first caller wins.
    pub fn teardown(&self, handle: &Arc<ConnHandle>) {
        if !handle.mark_closed() {
            return;
        }
        let fd = handle.fd();
        if fd >= 0 {
            self.epoll.delete(fd).ok();
            syscalls::close_fd(fd);
        }
        self.lock_slab().free(handle.token());
        self.lock_timers().remove(handle.token() as u64);
        self.metrics.dec_conn();
        debug!("connection fd {} retired", fd);
    }

    /// Fires expired idle timers. A connection that is mid-processing wins
    /// the claim race and gets one more timeslot before the next look.
    pub fn evict_expired(&self, now: u64) {
        let expired = self.lock_timers().tick(now);
        for token in expired {
            let handle = self.lock_slab().get(token as usize);
            let Some(handle) = handle else { continue };
            if handle.is_closed() {
                continue;
            }
            if handle.claim() {
                debug!("evicting idle token {}", token);
                self.teardown(&handle);
            } else {
                self.lock_timers()
                    .add(token, now + self.config.timeslot_secs);
            }
        }
    }
}

/// Programmatic stop: injects a termination byte into the signal pipe, the
/// same path a real SIGTERM takes.
#[derive(Clone, Copy)]
pub struct ShutdownHandle {
    pipe_write: i32,
}

impl ShutdownHandle {
    pub fn trigger(&self) {
        syscalls::send_signal_byte(self.pipe_write, libc::SIGTERM);
    }
}

pub struct Server {
    shared: Arc<ServerShared>,
    queue: Arc<BoundedQueue<Task>>,
    listen_fd: i32,
    pipe_read: i32,
    pipe_write: i32,
    port: u16,
}

impl Server {
    pub fn new(config: ServerConfig) -> PetrelResult<Self> {
        config.validate()?;
        let config = Arc::new(config);

        let listen_fd = syscalls::create_listen_socket(&config.host, config.port, config.linger)?;
        let port = syscalls::local_port(listen_fd)?;

        let epoll = Epoll::new()?;
        epoll.add(
            listen_fd,
            LISTEN_TOKEN,
            EPOLLIN as u32,
            config.listen_trigger,
            false,
        )?;
        let (pipe_read, pipe_write) = syscalls::create_pipe()?;
        epoll.add(
            pipe_read,
            SIGNAL_TOKEN,
            EPOLLIN as u32,
            TriggerMode::Level,
            false,
        )?;
        syscalls::install_signal_pipe(
            pipe_write,
            &[libc::SIGALRM, libc::SIGTERM, libc::SIGINT],
        )?;

        let table = match &config.credentials_file {
            Some(path) => MemoryStore::from_file(path)?,
            None => MemoryStore::new(),
        };
        info!("credential table holds {} entries", table.len());
        let table = Arc::new(Mutex::new(table));
        let store_pool = StorePool::new(config.store_capacity, move || {
            Box::new(SharedStore::new(table.clone()))
        });

        let queue = Arc::new(BoundedQueue::new(config.queue_capacity));
        let shared = Arc::new(ServerShared {
            config: config.clone(),
            metrics: Arc::new(ServerMetrics::new()),
            store_pool,
            routes: RouteTable::standard(),
            epoll,
            slab: Mutex::new(ConnSlab::new(MAX_CONNECTIONS)),
            timers: Mutex::new(TimerList::new()),
            shutdown: AtomicBool::new(false),
        });

        Ok(Self {
            shared,
            queue,
            listen_fd,
            pipe_read,
            pipe_write,
            port,
        })
    }

    /// The bound port; useful when the configuration asked for port 0.
    pub fn local_port(&self) -> u16 {
        self.port
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            pipe_write: self.pipe_write,
        }
    }

    pub fn metrics(&self) -> Arc<ServerMetrics> {
        self.shared.metrics.clone()
    }

    /// Runs the event loop until a termination signal arrives, then drains
    /// the workers and closes every live connection.
    pub fn run(self) -> PetrelResult<()> {
        let config = self.shared.config.clone();
        let pool = WorkerPool::start(self.shared.clone(), self.queue.clone(), config.workers)?;

        let reporter = self.shared.clone();
        thread::Builder::new()
            .name("petrel-metrics".to_string())
            .spawn(move || {
                while !reporter.is_shutdown() {
                    thread::sleep(Duration::from_secs(5));
                    if reporter.is_shutdown() {
                        break;
                    }
                    info!(
                        "active={} requests={} bytes={}",
                        reporter.metrics.active_conns(),
                        reporter.metrics.total_requests(),
                        reporter.metrics.bytes_sent()
                    );
                }
            })
            .ok();

        syscalls::arm_alarm(config.timeslot_secs);
        info!(
            "listening on {}:{} with {} workers ({:?} dispatch)",
            config.host, self.port, config.workers, config.dispatch
        );

        let mut events = vec![epoll_event { events: 0, u64: 0 }; EVENT_BATCH];
        let mut tick_pending = false;
        let mut stop = false;
        while !stop {
            let n = self.shared.epoll.wait(&mut events, -1)?;
            for ev in &events[..n] {
                let token = ev.u64;
                let flags = ev.events;
                if token == LISTEN_TOKEN {
                    self.accept_ready();
                } else if token == SIGNAL_TOKEN {
                    let mut sigs = Vec::new();
                    syscalls::drain_signal_pipe(self.pipe_read, &mut sigs);
                    for sig in sigs {
                        if sig == libc::SIGALRM {
                            tick_pending = true;
                        } else if sig == libc::SIGTERM || sig == libc::SIGINT {
                            stop = true;
                        }
                    }
                } else {
                    self.conn_event(token as usize, flags);
                }
            }
            // Eviction runs after the event batch so fresh activity has
            // already refreshed its deadlines.
            if tick_pending && !stop {
                self.shared.evict_expired(ServerShared::now_secs());
                syscalls::arm_alarm(config.timeslot_secs);
                tick_pending = false;
            }
        }

        info!("shutting down");
        self.shared.request_shutdown();
        pool.shutdown();
        let live = self.shared.lock_slab().drain_handles();
        for handle in live {
            if handle.mark_closed() {
                let fd = handle.fd();
                if fd >= 0 {
                    self.shared.epoll.delete(fd).ok();
                    syscalls::close_fd(fd);
                }
                self.shared.metrics.dec_conn();
            }
        }
        Ok(())
    }

    fn accept_ready(&self) {
        loop {
            match syscalls::accept_connection(self.listen_fd) {
                Ok(Some((fd, peer))) => self.register(fd, peer),
                Ok(None) => break,
                Err(e) => {
                    warn!("accept failed: {}", e);
                    break;
                }
            }
            // Level-triggered listeners take one connection per event.
            if self.shared.config.listen_trigger == TriggerMode::Level {
                break;
            }
        }
    }

    fn register(&self, fd: i32, peer: SocketAddr) {
        let token = {
            let mut slab = self.shared.lock_slab();
            slab.insert(|token| {
                Arc::new(ConnHandle::new(
                    token,
                    Connection::new(fd, peer, self.shared.config.clone()),
                ))
            })
        };
        let Some(token) = token else {
            warn!("connection table full, rejecting {}", peer);
            syscalls::writev_step(fd, &[BUSY_REPLY]).ok();
            syscalls::close_fd(fd);
            return;
        };
        let deadline = ServerShared::now_secs() + self.shared.config.idle_timeout_secs();
        self.shared.lock_timers().add(token as u64, deadline);
        if let Err(e) = self.shared.epoll.add(
            fd,
            token as u64,
            EPOLLIN as u32,
            self.shared.config.conn_trigger,
            true,
        ) {
            warn!("registering fd {}: {}", fd, e);
            self.shared.lock_timers().remove(token as u64);
            self.shared.lock_slab().free(token);
            syscalls::close_fd(fd);
            return;
        }
        self.shared.metrics.inc_conn();
        debug!("accepted {} as token {}", peer, token);
    }

    fn conn_event(&self, token: usize, flags: u32) {
        let handle = self.shared.lock_slab().get(token);
        let Some(handle) = handle else {
            // One-shot registration can leave a final event for a slot the
            // timer already reclaimed.
            return;
        };
        if handle.is_closed() {
            return;
        }
        if flags & (EPOLLRDHUP | EPOLLHUP | EPOLLERR) as u32 != 0 {
            if handle.claim() {
                self.shared.teardown(&handle);
            }
            return;
        }
        if flags & EPOLLIN as u32 != 0 {
            if !handle.claim() {
                return;
            }
            self.shared.refresh_timer(&handle);
            if self.shared.config.dispatch == DispatchMode::SplitPhase {
                let fed = handle.lock().feed(self.shared.config.conn_trigger);
                if !fed {
                    self.shared.teardown(&handle);
                    return;
                }
            }
            self.submit(&handle, Phase::Read);
        } else if flags & EPOLLOUT as u32 != 0 {
            if !handle.claim() {
                return;
            }
            self.shared.refresh_timer(&handle);
            self.submit(&handle, Phase::Write);
        }
    }

    /// Queues a task for the claimed connection. A full queue means the
    /// workers are saturated; the reactor runs the task itself. Re-arming
    /// instead would strand split-phase reads: the socket is already
    /// drained, so no readiness event would come back for the buffered
    /// bytes.
    fn submit(&self, handle: &Arc<ConnHandle>, phase: Phase) {
        let task = Task {
            conn: handle.clone(),
            phase,
        };
        if let Err(task) = self.queue.push(task) {
            warn!("task queue full, running fd {} inline", handle.fd());
            worker::run_task(&self.shared, task);
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        syscalls::close_fd(self.listen_fd);
        syscalls::close_fd(self.pipe_read);
        syscalls::close_fd(self.pipe_write);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_shared() -> Arc<ServerShared> {
        let config = Arc::new(ServerConfig::default());
        let table = Arc::new(Mutex::new(MemoryStore::new()));
        Arc::new(ServerShared {
            config: config.clone(),
            metrics: Arc::new(ServerMetrics::new()),
            store_pool: StorePool::new(1, move || Box::new(SharedStore::new(table.clone()))),
            routes: RouteTable::standard(),
            epoll: Epoll::new().unwrap(),
            slab: Mutex::new(ConnSlab::new(16)),
            timers: Mutex::new(TimerList::new()),
            shutdown: AtomicBool::new(false),
        })
    }

    fn socketpair() -> (i32, i32) {
        let mut fds = [0i32; 2];
        let rc = unsafe {
            libc::socketpair(
                libc::AF_UNIX,
                libc::SOCK_STREAM | libc::SOCK_NONBLOCK,
                0,
                fds.as_mut_ptr(),
            )
        };
        assert_eq!(rc, 0);
        (fds[0], fds[1])
    }

    fn send(fd: i32, bytes: &[u8]) {
        let n = unsafe { libc::write(fd, bytes.as_ptr() as *const libc::c_void, bytes.len()) };
        assert_eq!(n, bytes.len() as isize);
    }

    fn insert_socket(shared: &ServerShared, fd: i32) -> Arc<ConnHandle> {
        let config = shared.config.clone();
        let peer: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let token = shared
            .lock_slab()
            .insert(|token| Arc::new(ConnHandle::new(token, Connection::new(fd, peer, config))))
            .unwrap();
        let deadline = ServerShared::now_secs() + shared.config.idle_timeout_secs();
        shared.lock_timers().add(token as u64, deadline);
        shared.metrics.inc_conn();
        shared.lock_slab().get(token).unwrap()
    }

    fn insert_detached(shared: &ServerShared) -> Arc<ConnHandle> {
        let config = shared.config.clone();
        let token = shared
            .lock_slab()
            .insert(|token| Arc::new(ConnHandle::new(token, Connection::detached(config))))
            .unwrap();
        shared
            .lock_timers()
            .add(token as u64, ServerShared::now_secs() + 10);
        shared.metrics.inc_conn();
        shared.lock_slab().get(token).unwrap()
    }

    #[test]
    fn teardown_is_idempotent() {
        let shared = test_shared();
        let handle = insert_detached(&shared);
        assert_eq!(shared.metrics.active_conns(), 1);
        shared.teardown(&handle);
        shared.teardown(&handle);
        assert_eq!(shared.metrics.active_conns(), 0);
        assert!(shared.lock_slab().is_empty());
        assert!(shared.lock_timers().is_empty());
    }

    #[test]
    fn eviction_skips_claimed_connections() {
        let shared = test_shared();
        let handle = insert_detached(&shared);
        let token = handle.token() as u64;
        shared.lock_timers().add(token, 100);

        assert!(handle.claim());
        shared.evict_expired(200);
        // Still alive: the claim holder wins, and a fresh deadline exists.
        assert!(!handle.is_closed());
        assert!(shared.lock_timers().contains(token));

        handle.release_claim();
        shared.evict_expired(300 + shared.config.timeslot_secs);
        assert!(handle.is_closed());
        assert!(shared.lock_slab().is_empty());
    }

    #[test]
    fn rearmed_write_event_is_always_claimable() {
        // The one-shot hand-back must leave the connection claimable by
        // the time the event lands, or the reactor drops the event and the
        // connection stalls. EPOLLOUT readiness is immediate, so each
        // round races the re-arm against event delivery.
        const ROUNDS: usize = 100;
        let shared = test_shared();
        let (a, b) = socketpair();
        let handle = insert_socket(&shared, a);
        let token = handle.token() as u64;
        // Armed for input so nothing fires before the first re-arm.
        shared
            .epoll
            .add(a, token, EPOLLIN as u32, TriggerMode::Level, true)
            .unwrap();

        // Stands in for a worker finishing a task: it inherits the claim
        // and hands it back through the write re-arm.
        let (tx, rx) = std::sync::mpsc::channel::<()>();
        let worker_shared = shared.clone();
        let worker_handle = handle.clone();
        let worker = thread::spawn(move || {
            while rx.recv().is_ok() {
                worker_shared.rearm_write(&worker_handle);
            }
        });

        assert!(handle.claim());
        tx.send(()).unwrap();

        let mut events = vec![epoll_event { events: 0, u64: 0 }; 8];
        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        let mut rounds = 0;
        while rounds < ROUNDS {
            assert!(
                std::time::Instant::now() < deadline,
                "write readiness never came back, a one-shot event was lost"
            );
            let n = shared.epoll.wait(&mut events, 100).unwrap();
            for ev in &events[..n] {
                if ev.u64 != token {
                    continue;
                }
                // Same policy as the event loop: an unclaimable event is
                // dropped on the floor.
                assert!(handle.claim(), "event delivered while the claim was held");
                rounds += 1;
                tx.send(()).unwrap();
            }
        }
        drop(tx);
        worker.join().unwrap();
        shared.teardown(&handle);
        syscalls::close_fd(b);
    }

    #[test]
    fn full_queue_runs_the_task_inline() {
        let mut config = ServerConfig::default();
        config.host = "127.0.0.1".to_string();
        config.port = 0;
        config.queue_capacity = 1;
        config.dispatch = DispatchMode::Unified;
        let server = Server::new(config).unwrap();

        // Occupy the only queue slot so the next submission is rejected.
        let filler = insert_detached(&server.shared);
        assert!(filler.claim());
        assert!(
            server
                .queue
                .push(Task {
                    conn: filler.clone(),
                    phase: Phase::Read,
                })
                .is_ok()
        );

        let (a, b) = socketpair();
        send(b, b"GET /missing.html HTTP/1.1\r\n\r\n");
        let handle = insert_socket(&server.shared, a);
        server
            .shared
            .epoll
            .add(
                a,
                handle.token() as u64,
                EPOLLIN as u32,
                TriggerMode::Level,
                true,
            )
            .unwrap();

        assert!(handle.claim());
        server.submit(&handle, Phase::Read);

        // No worker ran, yet the buffered request was parsed and answered.
        assert_eq!(server.shared.metrics.total_requests(), 1);
        assert!(!handle.is_in_flight());
        assert!(!handle.is_closed());

        server.shared.teardown(&handle);
        syscalls::close_fd(b);
    }

    #[test]
    fn expired_idle_connection_is_retired() {
        let shared = test_shared();
        let handle = insert_detached(&shared);
        shared.lock_timers().add(handle.token() as u64, 50);
        shared.evict_expired(50);
        assert!(handle.is_closed());
        assert_eq!(shared.metrics.active_conns(), 0);
    }
}
