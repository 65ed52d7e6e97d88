//! I/O readiness layer: one API over the platform's best multiplexer.
//!
//! Backends: epoll on Linux, kqueue on macOS/BSD, `poll(2)` elsewhere.
//! Semantics are level-triggered: an fd that is ready and not drained is
//! reported again by the next `wait`. Per-fd errors surface as `ERR | HANGUP`
//! readiness on that fd, never as a global wait failure.

#[cfg(target_os = "linux")]
mod epoll;
#[cfg(any(
    target_os = "macos",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd"
))]
mod kqueue;
mod portable;

pub use portable::PollFdPoll;

use std::io;
use std::os::unix::io::RawFd;

/// Readiness interest flags, combined with bitwise or.
pub mod interest {
    pub const READ: u8 = 0b0001;
    pub const WRITE: u8 = 0b0010;
    pub const ERR: u8 = 0b0100;
    pub const HANGUP: u8 = 0b1000;
}

/// One readiness notification from `wait`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollEvent {
    pub fd: RawFd,
    /// Bitwise or of `interest` flags that fired.
    pub events: u8,
    /// Opaque value supplied at registration (the suspended command id).
    pub token: u64,
}

/// Registration record kept per fd. At most one entry per fd per instance.
#[derive(Debug, Clone, Copy)]
struct Entry {
    interest: u8,
    token: u64,
}

/// Unified readiness API. Registration maps are only touched by the
/// scheduler thread; no internal locking.
pub trait EventPoll: Send {
    /// Register `fd` with the given interest. Fails if `fd` is already
    /// registered or invalid.
    fn add(&mut self, fd: RawFd, interest: u8, token: u64) -> io::Result<()>;

    /// Replace the interest set of a registered fd.
    fn modify(&mut self, fd: RawFd, interest: u8) -> io::Result<()>;

    /// Deregister an fd. Fails if it was not registered.
    fn remove(&mut self, fd: RawFd) -> io::Result<()>;

    /// Block up to `timeout_ms` (-1 = indefinite), appending ready events to
    /// `out`. Returns the number of events appended; 0 means timeout.
    fn wait(&mut self, timeout_ms: i32, out: &mut Vec<PollEvent>) -> io::Result<usize>;

    /// Number of registered fds.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every registration.
    fn clear(&mut self);
}

/// Create the best available backend for this platform.
pub fn create_event_poll() -> io::Result<Box<dyn EventPoll>> {
    #[cfg(target_os = "linux")]
    {
        Ok(Box::new(epoll::EpollPoll::new()?))
    }
    #[cfg(any(
        target_os = "macos",
        target_os = "freebsd",
        target_os = "netbsd",
        target_os = "openbsd"
    ))]
    {
        Ok(Box::new(kqueue::KqueuePoll::new()?))
    }
    #[cfg(not(any(
        target_os = "linux",
        target_os = "macos",
        target_os = "freebsd",
        target_os = "netbsd",
        target_os = "openbsd"
    )))]
    {
        Ok(Box::new(portable::PollFdPoll::new()))
    }
}
