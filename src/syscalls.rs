// src/syscalls.rs
//! Thin libc wrappers for the reactor: sockets, epoll, the self-pipe signal
//! channel, nonblocking I/O steps, and read-only file mappings.

use std::io;
use std::mem;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::ptr;
use std::sync::atomic::{AtomicI32, Ordering};

use libc::{c_int, c_void, socklen_t};

use crate::config::TriggerMode;
use crate::error::PetrelResult;

pub use libc::{EPOLLERR, EPOLLHUP, EPOLLIN, EPOLLOUT, EPOLLRDHUP, epoll_event};

// ---- Socket operations ----

/// Create a non-blocking TCP listener bound to `host:port`. SO_REUSEADDR is
/// always set; `linger` optionally enables a graceful-close SO_LINGER of one
/// second, matching the startup knob of the original server.
pub fn create_listen_socket(host: &str, port: u16, linger: bool) -> PetrelResult<c_int> {
    let addr: SocketAddr = format!("{}:{}", host, port)
        .parse()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

    let domain = match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    };

    unsafe {
        let fd = libc::socket(domain, libc::SOCK_STREAM | libc::SOCK_NONBLOCK, 0);
        if fd < 0 {
            return Err(io::Error::last_os_error().into());
        }

        let one: c_int = 1;
        if libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const _ as *const c_void,
            mem::size_of_val(&one) as socklen_t,
        ) < 0
        {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err.into());
        }

        if linger {
            let lg = libc::linger {
                l_onoff: 1,
                l_linger: 1,
            };
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_LINGER,
                &lg as *const _ as *const c_void,
                mem::size_of_val(&lg) as socklen_t,
            );
        }

        bind_addr(fd, &addr)?;

        if libc::listen(fd, libc::SOMAXCONN) < 0 {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err.into());
        }

        Ok(fd)
    }
}

fn bind_addr(fd: c_int, addr: &SocketAddr) -> PetrelResult<()> {
    unsafe {
        match addr {
            SocketAddr::V4(a) => {
                let sin = libc::sockaddr_in {
                    sin_family: libc::AF_INET as libc::sa_family_t,
                    sin_port: a.port().to_be(),
                    sin_addr: libc::in_addr {
                        s_addr: u32::from_ne_bytes(a.ip().octets()),
                    },
                    sin_zero: [0; 8],
                };
                if libc::bind(
                    fd,
                    &sin as *const _ as *const libc::sockaddr,
                    mem::size_of_val(&sin) as socklen_t,
                ) < 0
                {
                    let err = io::Error::last_os_error();
                    libc::close(fd);
                    return Err(err.into());
                }
            }
            SocketAddr::V6(a) => {
                let sin6 = libc::sockaddr_in6 {
                    sin6_family: libc::AF_INET6 as libc::sa_family_t,
                    sin6_port: a.port().to_be(),
                    sin6_flowinfo: a.flowinfo(),
                    sin6_addr: libc::in6_addr {
                        s6_addr: a.ip().octets(),
                    },
                    sin6_scope_id: a.scope_id(),
                };
                if libc::bind(
                    fd,
                    &sin6 as *const _ as *const libc::sockaddr,
                    mem::size_of_val(&sin6) as socklen_t,
                ) < 0
                {
                    let err = io::Error::last_os_error();
                    libc::close(fd);
                    return Err(err.into());
                }
            }
        }
        Ok(())
    }
}

/// The port a bound socket actually listens on. Needed when the configured
/// port was 0 and the kernel picked one.
pub fn local_port(fd: c_int) -> PetrelResult<u16> {
    unsafe {
        let mut storage: libc::sockaddr_storage = mem::zeroed();
        let mut len = mem::size_of::<libc::sockaddr_storage>() as socklen_t;
        if libc::getsockname(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len) < 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(sockaddr_to_addr(&storage).port())
    }
}

fn sockaddr_to_addr(storage: &libc::sockaddr_storage) -> SocketAddr {
    match storage.ss_family as c_int {
        libc::AF_INET => {
            let sin = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            SocketAddr::new(
                IpAddr::V4(Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr))),
                u16::from_be(sin.sin_port),
            )
        }
        libc::AF_INET6 => {
            let sin6 = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            SocketAddr::new(
                IpAddr::V6(Ipv6Addr::from(sin6.sin6_addr.s6_addr)),
                u16::from_be(sin6.sin6_port),
            )
        }
        _ => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
    }
}

/// Accept one pending connection, non-blocking. `None` when the backlog is
/// drained.
pub fn accept_connection(listen_fd: c_int) -> PetrelResult<Option<(c_int, SocketAddr)>> {
    unsafe {
        let mut storage: libc::sockaddr_storage = mem::zeroed();
        let mut len = mem::size_of::<libc::sockaddr_storage>() as socklen_t;
        let fd = libc::accept4(
            listen_fd,
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut len,
            libc::SOCK_NONBLOCK,
        );
        if fd < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                Ok(None)
            } else {
                Err(err.into())
            }
        } else {
            Ok(Some((fd, sockaddr_to_addr(&storage))))
        }
    }
}

pub fn close_fd(fd: c_int) {
    unsafe {
        libc::close(fd);
    }
}

// ---- Nonblocking I/O steps ----

/// Outcome of one nonblocking read or write attempt. `Closed` is reported
/// only by reads (EOF from the peer).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoStep {
    Done(usize),
    WouldBlock,
    Closed,
}

pub fn read_step(fd: c_int, buf: &mut [u8]) -> io::Result<IoStep> {
    unsafe {
        let res = libc::read(fd, buf.as_mut_ptr() as *mut c_void, buf.len());
        if res < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                Ok(IoStep::WouldBlock)
            } else {
                Err(err)
            }
        } else if res == 0 {
            Ok(IoStep::Closed)
        } else {
            Ok(IoStep::Done(res as usize))
        }
    }
}

/// Scatter-write: both response segments go out through one writev call.
pub fn writev_step(fd: c_int, bufs: &[&[u8]]) -> io::Result<IoStep> {
    debug_assert!(!bufs.is_empty() && bufs.len() <= 2);
    let mut iovecs: [libc::iovec; 2] = unsafe { mem::zeroed() };
    for (i, b) in bufs.iter().enumerate() {
        iovecs[i] = libc::iovec {
            iov_base: b.as_ptr() as *mut c_void,
            iov_len: b.len(),
        };
    }
    unsafe {
        let res = libc::writev(fd, iovecs.as_ptr(), bufs.len() as c_int);
        if res < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                Ok(IoStep::WouldBlock)
            } else {
                Err(err)
            }
        } else {
            Ok(IoStep::Done(res as usize))
        }
    }
}

// ---- Epoll ----

pub struct Epoll {
    fd: c_int,
}

impl Epoll {
    pub fn new() -> PetrelResult<Self> {
        unsafe {
            let fd = libc::epoll_create1(0);
            if fd < 0 {
                return Err(io::Error::last_os_error().into());
            }
            Ok(Self { fd })
        }
    }

    fn event_bits(interests: u32, mode: TriggerMode, one_shot: bool) -> u32 {
        let mut events = interests | EPOLLRDHUP as u32;
        if mode == TriggerMode::Edge {
            events |= libc::EPOLLET as u32;
        }
        if one_shot {
            events |= libc::EPOLLONESHOT as u32;
        }
        events
    }

    pub fn add(
        &self,
        fd: c_int,
        token: u64,
        interests: u32,
        mode: TriggerMode,
        one_shot: bool,
    ) -> PetrelResult<()> {
        let mut event = epoll_event {
            events: Self::event_bits(interests, mode, one_shot),
            u64: token,
        };
        unsafe {
            if libc::epoll_ctl(self.fd, libc::EPOLL_CTL_ADD, fd, &mut event) < 0 {
                return Err(io::Error::last_os_error().into());
            }
        }
        Ok(())
    }

    /// Re-arm a one-shot registration with a new interest set.
    pub fn modify(
        &self,
        fd: c_int,
        token: u64,
        interests: u32,
        mode: TriggerMode,
        one_shot: bool,
    ) -> PetrelResult<()> {
        let mut event = epoll_event {
            events: Self::event_bits(interests, mode, one_shot),
            u64: token,
        };
        unsafe {
            if libc::epoll_ctl(self.fd, libc::EPOLL_CTL_MOD, fd, &mut event) < 0 {
                return Err(io::Error::last_os_error().into());
            }
        }
        Ok(())
    }

    pub fn delete(&self, fd: c_int) -> PetrelResult<()> {
        unsafe {
            if libc::epoll_ctl(self.fd, libc::EPOLL_CTL_DEL, fd, ptr::null_mut()) < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() != Some(libc::ENOENT) {
                    return Err(err.into());
                }
            }
        }
        Ok(())
    }

    pub fn wait(&self, events: &mut [epoll_event], timeout_ms: i32) -> PetrelResult<usize> {
        unsafe {
            let res = libc::epoll_wait(
                self.fd,
                events.as_mut_ptr(),
                events.len() as c_int,
                timeout_ms,
            );
            if res < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    return Ok(0);
                }
                return Err(err.into());
            }
            Ok(res as usize)
        }
    }
}

impl Drop for Epoll {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

// Only the reactor thread mutates the registration set, but workers re-arm
// through epoll_ctl, which the kernel serializes.
unsafe impl Send for Epoll {}
unsafe impl Sync for Epoll {}

// ---- Self-pipe signal channel ----

static SIGNAL_PIPE_WRITE: AtomicI32 = AtomicI32::new(-1);

/// Create a non-blocking Unix pipe. Returns (read_fd, write_fd).
pub fn create_pipe() -> PetrelResult<(c_int, c_int)> {
    let mut fds = [0 as c_int; 2];
    unsafe {
        if libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error().into());
        }
    }
    Ok((fds[0], fds[1]))
}

// The handler's only job is to push the signal number into the pipe; all
// real work happens on the reactor side of it.
extern "C" fn signal_to_pipe(sig: c_int) {
    let fd = SIGNAL_PIPE_WRITE.load(Ordering::Relaxed);
    if fd >= 0 {
        let byte = sig as u8;
        unsafe {
            libc::write(fd, &byte as *const u8 as *const c_void, 1);
        }
    }
}

/// Route `signals` into `pipe_write_fd` via the self-pipe handler.
pub fn install_signal_pipe(pipe_write_fd: c_int, signals: &[c_int]) -> PetrelResult<()> {
    SIGNAL_PIPE_WRITE.store(pipe_write_fd, Ordering::SeqCst);
    unsafe {
        for &sig in signals {
            let mut sa: libc::sigaction = mem::zeroed();
            sa.sa_sigaction = signal_to_pipe as usize;
            sa.sa_flags = libc::SA_RESTART;
            libc::sigfillset(&mut sa.sa_mask);
            if libc::sigaction(sig, &sa, ptr::null_mut()) < 0 {
                return Err(io::Error::last_os_error().into());
            }
        }
    }
    Ok(())
}

/// Write a signal code into the pipe directly, bypassing the kernel. Used
/// for programmatic shutdown.
pub fn send_signal_byte(pipe_write_fd: c_int, sig: c_int) {
    let byte = sig as u8;
    unsafe {
        libc::write(pipe_write_fd, &byte as *const u8 as *const c_void, 1);
    }
}

/// Drain pending signal codes from the pipe's read end.
pub fn drain_signal_pipe(pipe_read_fd: c_int, out: &mut Vec<c_int>) {
    let mut buf = [0u8; 32];
    loop {
        let n = unsafe { libc::read(pipe_read_fd, buf.as_mut_ptr() as *mut c_void, buf.len()) };
        if n <= 0 {
            break;
        }
        for &b in &buf[..n as usize] {
            out.push(b as c_int);
        }
    }
}

/// Arm the periodic alarm; one call produces one SIGALRM.
pub fn arm_alarm(secs: u64) {
    unsafe {
        libc::alarm(secs as libc::c_uint);
    }
}

// ---- File mapping ----

/// Read-only memory mapping of a served file. The mapping is released
/// exactly once, when the value drops.
pub struct MappedFile {
    addr: *mut c_void,
    len: usize,
}

impl MappedFile {
    /// Maps a non-empty file read-only. Callers must substitute a static
    /// body for zero-length files instead of mapping them.
    pub fn open(path: &Path, len: usize) -> io::Result<Self> {
        debug_assert!(len > 0);
        let file = std::fs::File::open(path)?;
        unsafe {
            let addr = libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ,
                libc::MAP_PRIVATE,
                file.as_raw_fd(),
                0,
            );
            if addr == libc::MAP_FAILED {
                return Err(io::Error::last_os_error());
            }
            Ok(Self { addr, len })
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.addr as *const u8, self.len) }
    }
}

impl Drop for MappedFile {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.addr, self.len);
        }
    }
}

// The mapping is immutable and owned by whichever thread holds the
// connection's task.
unsafe impl Send for MappedFile {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn mapped_file_round_trip() {
        let path = std::env::temp_dir().join(format!("petrel-map-{}", std::process::id()));
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(b"hello mapping").unwrap();
        drop(f);

        let map = MappedFile::open(&path, 13).unwrap();
        assert_eq!(map.as_slice(), b"hello mapping");
        drop(map);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn pipe_carries_signal_bytes() {
        let (r, w) = create_pipe().unwrap();
        send_signal_byte(w, libc::SIGTERM);
        send_signal_byte(w, libc::SIGALRM);
        let mut out = Vec::new();
        drain_signal_pipe(r, &mut out);
        assert_eq!(out, vec![libc::SIGTERM, libc::SIGALRM]);
        close_fd(r);
        close_fd(w);
    }
}
