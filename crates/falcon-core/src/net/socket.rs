//! Non-blocking TCP socket over a raw fd.
//!
//! The scheduler needs connects that return immediately (EINPROGRESS) and
//! reads/writes that surface `WouldBlock` as suspension points, so this wraps
//! the raw socket calls directly instead of `std::net::TcpStream` (whose
//! connect blocks through DNS and the handshake).

use std::io;
use std::mem;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;

/// Result of probing an idle socket without consuming data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeekStatus {
    /// No pending data, connection open.
    Idle,
    /// Unread bytes are pending (stale keep-alive response).
    Data,
    /// Peer closed the connection.
    Eof,
    /// Socket is in an error state.
    Error,
}

/// A connected (or connecting) TCP socket in non-blocking mode. Closed on drop.
#[derive(Debug)]
pub struct TcpSocket {
    fd: RawFd,
}

impl TcpSocket {
    /// Placeholder with no fd, standing in when ownership of a live socket
    /// moves elsewhere. All I/O on it fails with EBADF.
    pub(crate) fn invalid() -> TcpSocket {
        TcpSocket { fd: -1 }
    }

    /// Start a non-blocking connect to `addr`. Returns the socket and whether
    /// the connect is still in progress (suspend on WRITE, then check
    /// `take_error` on wake).
    pub fn connect(addr: &SocketAddr) -> io::Result<(TcpSocket, bool)> {
        let domain = match addr {
            SocketAddr::V4(_) => libc::AF_INET,
            SocketAddr::V6(_) => libc::AF_INET6,
        };
        #[cfg(not(target_os = "macos"))]
        let fd = unsafe {
            libc::socket(
                domain,
                libc::SOCK_STREAM | libc::SOCK_CLOEXEC | libc::SOCK_NONBLOCK,
                0,
            )
        };
        // macOS has no SOCK_NONBLOCK/SOCK_CLOEXEC; set the flags after.
        #[cfg(target_os = "macos")]
        let fd = unsafe { libc::socket(domain, libc::SOCK_STREAM, 0) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let sock = TcpSocket { fd };
        #[cfg(target_os = "macos")]
        {
            sock.set_nonblocking(true)?;
            unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) };
        }
        sock.set_nodelay();

        let (storage, len) = sockaddr_from(addr);
        let rc = unsafe {
            libc::connect(
                fd,
                &storage as *const libc::sockaddr_storage as *const libc::sockaddr,
                len,
            )
        };
        if rc == 0 {
            return Ok((sock, false));
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EINPROGRESS) {
            return Ok((sock, true));
        }
        Err(err)
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.fd
    }

    /// Pending socket error, if any (SO_ERROR). Clears the error state.
    pub fn take_error(&self) -> io::Result<Option<io::Error>> {
        let mut err: libc::c_int = 0;
        let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
        let rc = unsafe {
            libc::getsockopt(
                self.fd,
                libc::SOL_SOCKET,
                libc::SO_ERROR,
                &mut err as *mut libc::c_int as *mut libc::c_void,
                &mut len,
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        if err == 0 {
            Ok(None)
        } else {
            Ok(Some(io::Error::from_raw_os_error(err)))
        }
    }

    /// Probe the connection without consuming data (MSG_PEEK, non-blocking).
    pub fn peek_status(&self) -> PeekStatus {
        if !matches!(self.take_error(), Ok(None)) {
            return PeekStatus::Error;
        }
        let mut byte = 0u8;
        let rc = unsafe {
            libc::recv(
                self.fd,
                &mut byte as *mut u8 as *mut libc::c_void,
                1,
                libc::MSG_PEEK | libc::MSG_DONTWAIT,
            )
        };
        match rc {
            0 => PeekStatus::Eof,
            n if n > 0 => PeekStatus::Data,
            _ => {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::WouldBlock {
                    PeekStatus::Idle
                } else {
                    PeekStatus::Error
                }
            }
        }
    }

    pub fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        let flags = unsafe { libc::fcntl(self.fd, libc::F_GETFL) };
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        let flags = if nonblocking {
            flags | libc::O_NONBLOCK
        } else {
            flags & !libc::O_NONBLOCK
        };
        if unsafe { libc::fcntl(self.fd, libc::F_SETFL, flags) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn set_nodelay(&self) {
        let one: libc::c_int = 1;
        unsafe {
            libc::setsockopt(
                self.fd,
                libc::IPPROTO_TCP,
                libc::TCP_NODELAY,
                &one as *const libc::c_int as *const libc::c_void,
                mem::size_of::<libc::c_int>() as libc::socklen_t,
            );
        }
    }

    pub fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let rc = unsafe { libc::read(self.fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(rc as usize)
    }

    pub fn send(&self, buf: &[u8]) -> io::Result<usize> {
        let rc = unsafe { libc::write(self.fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(rc as usize)
    }
}

impl io::Read for TcpSocket {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.recv(buf)
    }
}

impl io::Write for TcpSocket {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.send(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for TcpSocket {
    fn drop(&mut self) {
        if self.fd >= 0 {
            unsafe { libc::close(self.fd) };
        }
    }
}

fn sockaddr_from(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    match addr {
        SocketAddr::V4(v4) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: v4.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(v4.ip().octets()),
                },
                sin_zero: [0; 8],
            };
            unsafe {
                std::ptr::copy_nonoverlapping(
                    &sin as *const libc::sockaddr_in as *const u8,
                    &mut storage as *mut libc::sockaddr_storage as *mut u8,
                    mem::size_of::<libc::sockaddr_in>(),
                );
            }
            (storage, mem::size_of::<libc::sockaddr_in>() as libc::socklen_t)
        }
        SocketAddr::V6(v6) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: v6.port().to_be(),
                sin6_flowinfo: v6.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: v6.ip().octets(),
                },
                sin6_scope_id: v6.scope_id(),
            };
            unsafe {
                std::ptr::copy_nonoverlapping(
                    &sin6 as *const libc::sockaddr_in6 as *const u8,
                    &mut storage as *mut libc::sockaddr_storage as *mut u8,
                    mem::size_of::<libc::sockaddr_in6>(),
                );
            }
            (storage, mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t)
        }
    }
}
