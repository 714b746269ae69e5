// src/syscalls.rs
//
// Thin wrappers over the raw libc calls the reactor needs. Everything here
// is non-blocking; EAGAIN/EWOULDBLOCK is surfaced as a normal value, never
// as an error.

use crate::error::EmberResult;
use libc::{c_int, c_void, socklen_t};
use std::io;
use std::mem;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::ptr;

/// Ignore SIGPIPE process-wide so a write to a half-closed peer reports
/// EPIPE instead of killing the process.
pub fn ignore_sigpipe() {
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}

/// Create a bound, listening, non-blocking TCP socket with SO_REUSEADDR.
pub fn create_listen_socket(host: &str, port: u16, backlog: i32) -> EmberResult<c_int> {
    let addr_str = format!("{}:{}", host, port);
    let addr: SocketAddr = addr_str
        .parse()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

    let domain = if addr.is_ipv6() {
        libc::AF_INET6
    } else {
        libc::AF_INET
    };

    unsafe {
        let fd = libc::socket(domain, libc::SOCK_STREAM | libc::SOCK_NONBLOCK, 0);
        if fd < 0 {
            return Err(io::Error::last_os_error().into());
        }

        // Address reuse must be set before bind.
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

        if let Err(e) = bind_addr(fd, &addr) {
            libc::close(fd);
            return Err(e);
        }

        if libc::listen(fd, backlog) < 0 {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err.into());
        }

        Ok(fd)
    }
}

fn bind_addr(fd: c_int, addr: &SocketAddr) -> EmberResult<()> {
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
                    return Err(io::Error::last_os_error().into());
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
                    return Err(io::Error::last_os_error().into());
                }
            }
        }
        Ok(())
    }
}

/// The port a socket is actually bound to. Needed when binding port 0.
pub fn local_port(fd: c_int) -> EmberResult<u16> {
    unsafe {
        let mut storage: libc::sockaddr_storage = mem::zeroed();
        let mut len = mem::size_of::<libc::sockaddr_storage>() as socklen_t;
        if libc::getsockname(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len) < 0 {
            return Err(io::Error::last_os_error().into());
        }
        match storage.ss_family as c_int {
            libc::AF_INET => {
                let sin = &storage as *const _ as *const libc::sockaddr_in;
                Ok(u16::from_be((*sin).sin_port))
            }
            libc::AF_INET6 => {
                let sin6 = &storage as *const _ as *const libc::sockaddr_in6;
                Ok(u16::from_be((*sin6).sin6_port))
            }
            _ => Err(io::Error::new(io::ErrorKind::InvalidData, "unknown address family").into()),
        }
    }
}

fn sockaddr_to_addr(storage: &libc::sockaddr_storage) -> Option<SocketAddr> {
    match storage.ss_family as c_int {
        libc::AF_INET => {
            let sin = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            let ip = Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes());
            Some(SocketAddr::new(IpAddr::V4(ip), u16::from_be(sin.sin_port)))
        }
        libc::AF_INET6 => {
            let sin6 = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
            Some(SocketAddr::new(IpAddr::V6(ip), u16::from_be(sin6.sin6_port)))
        }
        _ => None,
    }
}

/// Accept one pending connection. `Ok(None)` means the accept queue is
/// drained (EAGAIN); the caller loops until then.
pub fn accept_connection(listen_fd: c_int) -> EmberResult<Option<(c_int, Option<SocketAddr>)>> {
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

// ---- Epoll ----

pub use libc::epoll_event;

pub const EPOLLIN: i32 = libc::EPOLLIN;
pub const EPOLLOUT: i32 = libc::EPOLLOUT;
pub const EPOLLET: i32 = libc::EPOLLET;
pub const EPOLLONESHOT: i32 = libc::EPOLLONESHOT;
pub const EPOLLRDHUP: i32 = libc::EPOLLRDHUP;
pub const EPOLLERR: i32 = libc::EPOLLERR;
pub const EPOLLHUP: i32 = libc::EPOLLHUP;

/// Owned epoll instance. `epoll_ctl` is thread-safe, so workers re-arm
/// connections through a shared reference while the loop thread waits.
pub struct Epoll {
    fd: c_int,
}

impl Epoll {
    pub fn new() -> EmberResult<Self> {
        unsafe {
            let fd = libc::epoll_create1(0);
            if fd < 0 {
                return Err(io::Error::last_os_error().into());
            }
            Ok(Self { fd })
        }
    }

    /// Register `fd` with the exact interest bits given. The caller picks
    /// level- vs edge-triggered and one-shot.
    pub fn add(&self, fd: c_int, token: u64, interests: i32) -> EmberResult<()> {
        let mut event = epoll_event {
            events: interests as u32,
            u64: token,
        };
        unsafe {
            if libc::epoll_ctl(self.fd, libc::EPOLL_CTL_ADD, fd, &mut event) < 0 {
                return Err(io::Error::last_os_error().into());
            }
        }
        Ok(())
    }

    /// Re-arm a one-shot registration. After a one-shot event fires the
    /// descriptor is silent until this is called.
    pub fn rearm(&self, fd: c_int, token: u64, interests: i32) -> EmberResult<()> {
        let mut event = epoll_event {
            events: interests as u32,
            u64: token,
        };
        unsafe {
            if libc::epoll_ctl(self.fd, libc::EPOLL_CTL_MOD, fd, &mut event) < 0 {
                return Err(io::Error::last_os_error().into());
            }
        }
        Ok(())
    }

    pub fn delete(&self, fd: c_int) -> EmberResult<()> {
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

    /// Wait for events. EINTR is reported as zero events, not an error; any
    /// other failure is fatal to the caller's loop.
    pub fn wait(&self, events: &mut [epoll_event], timeout_ms: i32) -> EmberResult<usize> {
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

// ---- Non-blocking I/O ----

/// Outcome of one non-blocking read.
pub enum ReadOutcome {
    /// Bytes landed in the buffer.
    Data(usize),
    /// Orderly close by the peer.
    Eof,
    /// Nothing available right now.
    WouldBlock,
}

pub fn read_nonblocking(fd: c_int, buf: &mut [u8]) -> EmberResult<ReadOutcome> {
    unsafe {
        let res = libc::read(fd, buf.as_mut_ptr() as *mut c_void, buf.len());
        if res < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                Ok(ReadOutcome::WouldBlock)
            } else {
                Err(err.into())
            }
        } else if res == 0 {
            Ok(ReadOutcome::Eof)
        } else {
            Ok(ReadOutcome::Data(res as usize))
        }
    }
}

/// Vectored write of up to 8 segments in one syscall. Returns the number of
/// bytes accepted by the kernel; 0 means would-block.
pub fn writev_nonblocking(fd: c_int, bufs: &[&[u8]]) -> EmberResult<usize> {
    if bufs.is_empty() {
        return Ok(0);
    }

    let mut iovecs: [libc::iovec; 8] = unsafe { mem::zeroed() };
    let iov_count = bufs.len().min(8);
    for (i, buf) in bufs.iter().take(iov_count).enumerate() {
        iovecs[i] = libc::iovec {
            iov_base: buf.as_ptr() as *mut c_void,
            iov_len: buf.len(),
        };
    }

    unsafe {
        let res = libc::writev(fd, iovecs.as_ptr(), iov_count as c_int);
        if res < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                Ok(0)
            } else {
                Err(err.into())
            }
        } else {
            Ok(res as usize)
        }
    }
}

// ---- Wake pipe ----
//
// A non-blocking Unix pipe registered with the event loop. Workers send
// slot indices over it to request teardown, and the shutdown handler sends
// a wake token so an idle `epoll_wait` returns promptly.

/// Token meaning "wake up and check the shutdown flag".
pub const WAKE_TOKEN: u32 = u32::MAX;

/// Create the pipe. Returns (read_fd, write_fd); the read end is
/// non-blocking.
pub fn create_pipe() -> EmberResult<(c_int, c_int)> {
    let mut fds = [0 as c_int; 2];
    unsafe {
        if libc::pipe(fds.as_mut_ptr()) < 0 {
            return Err(io::Error::last_os_error().into());
        }
        let flags = libc::fcntl(fds[0], libc::F_GETFL, 0);
        if flags < 0 || libc::fcntl(fds[0], libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            let err = io::Error::last_os_error();
            libc::close(fds[0]);
            libc::close(fds[1]);
            return Err(err.into());
        }
    }
    Ok((fds[0], fds[1]))
}

pub fn send_token(pipe_write_fd: c_int, token: u32) -> EmberResult<()> {
    let bytes = token.to_ne_bytes();
    unsafe {
        let n = libc::write(pipe_write_fd, bytes.as_ptr() as *const c_void, 4);
        if n < 0 {
            Err(io::Error::last_os_error().into())
        } else {
            Ok(())
        }
    }
}

pub fn recv_token(pipe_read_fd: c_int) -> EmberResult<Option<u32>> {
    let mut buf = [0u8; 4];
    unsafe {
        let n = libc::read(pipe_read_fd, buf.as_mut_ptr() as *mut c_void, 4);
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                Ok(None)
            } else {
                Err(err.into())
            }
        } else if n == 4 {
            Ok(Some(u32::from_ne_bytes(buf)))
        } else {
            Ok(None)
        }
    }
}
