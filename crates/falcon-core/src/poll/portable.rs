//! Portable `poll(2)` backend. Slower for large fd sets but works on any
//! Unix; also exercised by tests on every platform.

use super::{interest, Entry, EventPoll, PollEvent};
use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;

pub struct PollFdPoll {
    entries: HashMap<RawFd, Entry>,
    fds: Vec<libc::pollfd>,
    dirty: bool,
}

unsafe impl Send for PollFdPoll {}

impl PollFdPoll {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            fds: Vec::new(),
            dirty: false,
        }
    }

    fn rebuild(&mut self) {
        self.fds.clear();
        for (&fd, entry) in &self.entries {
            self.fds.push(libc::pollfd {
                fd,
                events: to_poll_events(entry.interest),
                revents: 0,
            });
        }
        self.dirty = false;
    }
}

impl Default for PollFdPoll {
    fn default() -> Self {
        Self::new()
    }
}

fn to_poll_events(interest: u8) -> libc::c_short {
    let mut events: libc::c_short = 0;
    if interest & interest::READ != 0 {
        events |= libc::POLLIN;
    }
    if interest & interest::WRITE != 0 {
        events |= libc::POLLOUT;
    }
    events
}

fn from_poll_events(revents: libc::c_short) -> u8 {
    let mut out = 0u8;
    if revents & libc::POLLIN != 0 {
        out |= interest::READ;
    }
    if revents & libc::POLLOUT != 0 {
        out |= interest::WRITE;
    }
    if revents & (libc::POLLERR | libc::POLLNVAL) != 0 {
        out |= interest::ERR;
    }
    if revents & libc::POLLHUP != 0 {
        out |= interest::HANGUP;
    }
    out
}

impl EventPoll for PollFdPoll {
    fn add(&mut self, fd: RawFd, interest: u8, token: u64) -> io::Result<()> {
        if fd < 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "invalid fd"));
        }
        if self.entries.contains_key(&fd) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "fd already registered",
            ));
        }
        self.entries.insert(fd, Entry { interest, token });
        self.dirty = true;
        Ok(())
    }

    fn modify(&mut self, fd: RawFd, interest: u8) -> io::Result<()> {
        match self.entries.get_mut(&fd) {
            Some(entry) => {
                entry.interest = interest;
                self.dirty = true;
                Ok(())
            }
            None => Err(io::Error::new(io::ErrorKind::NotFound, "fd not registered")),
        }
    }

    fn remove(&mut self, fd: RawFd) -> io::Result<()> {
        if self.entries.remove(&fd).is_none() {
            return Err(io::Error::new(io::ErrorKind::NotFound, "fd not registered"));
        }
        self.dirty = true;
        Ok(())
    }

    fn wait(&mut self, timeout_ms: i32, out: &mut Vec<PollEvent>) -> io::Result<usize> {
        if self.dirty {
            self.rebuild();
        }
        if self.fds.is_empty() {
            if timeout_ms > 0 {
                std::thread::sleep(std::time::Duration::from_millis(timeout_ms as u64));
            }
            return Ok(0);
        }

        let n = loop {
            let rc = unsafe {
                libc::poll(
                    self.fds.as_mut_ptr(),
                    self.fds.len() as libc::nfds_t,
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
        if n > 0 {
            for pfd in &self.fds {
                if pfd.revents == 0 {
                    continue;
                }
                if let Some(entry) = self.entries.get(&pfd.fd) {
                    out.push(PollEvent {
                        fd: pfd.fd,
                        events: from_poll_events(pfd.revents),
                        token: entry.token,
                    });
                    appended += 1;
                }
            }
        }
        Ok(appended)
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.fds.clear();
        self.dirty = false;
    }
}
