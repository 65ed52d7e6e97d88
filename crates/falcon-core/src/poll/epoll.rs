//! epoll backend (Linux). Level-triggered, which is epoll's default mode.

use super::{interest, Entry, EventPoll, PollEvent};
use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;

const MAX_EVENTS: usize = 256;

pub struct EpollPoll {
    epoll_fd: RawFd,
    entries: HashMap<RawFd, Entry>,
    buf: Vec<libc::epoll_event>,
}

// The raw epoll fd is only used from the owning scheduler thread.
unsafe impl Send for EpollPoll {}

impl EpollPoll {
    pub fn new() -> io::Result<Self> {
        let epoll_fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epoll_fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            epoll_fd,
            entries: HashMap::new(),
            buf: vec![unsafe { std::mem::zeroed() }; MAX_EVENTS],
        })
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, interest: u8) -> io::Result<()> {
        let mut ev = libc::epoll_event {
            events: to_epoll_events(interest),
            u64: fd as u64,
        };
        let rc = unsafe { libc::epoll_ctl(self.epoll_fd, op, fd, &mut ev) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

fn to_epoll_events(interest: u8) -> u32 {
    let mut events = 0u32;
    if interest & interest::READ != 0 {
        events |= libc::EPOLLIN as u32;
    }
    if interest & interest::WRITE != 0 {
        events |= libc::EPOLLOUT as u32;
    }
    // EPOLLERR and EPOLLHUP are always reported; no need to request them.
    events
}

fn from_epoll_events(events: u32) -> u8 {
    let mut out = 0u8;
    if events & libc::EPOLLIN as u32 != 0 {
        out |= interest::READ;
    }
    if events & libc::EPOLLOUT as u32 != 0 {
        out |= interest::WRITE;
    }
    if events & libc::EPOLLERR as u32 != 0 {
        out |= interest::ERR;
    }
    if events & (libc::EPOLLHUP as u32 | libc::EPOLLRDHUP as u32) != 0 {
        out |= interest::HANGUP;
    }
    out
}

impl EventPoll for EpollPoll {
    fn add(&mut self, fd: RawFd, interest: u8, token: u64) -> io::Result<()> {
        if self.entries.contains_key(&fd) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "fd already registered",
            ));
        }
        self.ctl(libc::EPOLL_CTL_ADD, fd, interest)?;
        self.entries.insert(fd, Entry { interest, token });
        Ok(())
    }

    fn modify(&mut self, fd: RawFd, interest: u8) -> io::Result<()> {
        if !self.entries.contains_key(&fd) {
            return Err(io::Error::new(io::ErrorKind::NotFound, "fd not registered"));
        }
        self.ctl(libc::EPOLL_CTL_MOD, fd, interest)?;
        if let Some(entry) = self.entries.get_mut(&fd) {
            entry.interest = interest;
        }
        Ok(())
    }

    fn remove(&mut self, fd: RawFd) -> io::Result<()> {
        if self.entries.remove(&fd).is_none() {
            return Err(io::Error::new(io::ErrorKind::NotFound, "fd not registered"));
        }
        // The kernel may already have dropped the fd (closed elsewhere);
        // losing the registration is the outcome we want either way.
        let _ = self.ctl(libc::EPOLL_CTL_DEL, fd, 0);
        Ok(())
    }

    fn wait(&mut self, timeout_ms: i32, out: &mut Vec<PollEvent>) -> io::Result<usize> {
        let n = loop {
            let rc = unsafe {
                libc::epoll_wait(
                    self.epoll_fd,
                    self.buf.as_mut_ptr(),
                    self.buf.len() as libc::c_int,
                    timeout_ms,
                )
            };
            if rc >= 0 {
                break rc as usize;
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        };

        let mut appended = 0;
        for ev in &self.buf[..n] {
            let fd = ev.u64 as RawFd;
            if let Some(entry) = self.entries.get(&fd) {
                out.push(PollEvent {
                    fd,
                    events: from_epoll_events(ev.events),
                    token: entry.token,
                });
                appended += 1;
            }
        }
        Ok(appended)
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn clear(&mut self) {
        let fds: Vec<RawFd> = self.entries.keys().copied().collect();
        for fd in fds {
            let _ = self.ctl(libc::EPOLL_CTL_DEL, fd, 0);
        }
        self.entries.clear();
    }
}

impl Drop for EpollPoll {
    fn drop(&mut self) {
        unsafe { libc::close(self.epoll_fd) };
    }
}
