//! kqueue backend (macOS/BSD). Read and write interest map to separate
//! filters; EV_EOF on either filter is reported as HANGUP.

use super::{interest, Entry, EventPoll, PollEvent};
use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::ptr;

const MAX_EVENTS: usize = 256;

pub struct KqueuePoll {
    kq: RawFd,
    entries: HashMap<RawFd, Entry>,
    buf: Vec<libc::kevent>,
}

unsafe impl Send for KqueuePoll {}

impl KqueuePoll {
    pub fn new() -> io::Result<Self> {
        let kq = unsafe { libc::kqueue() };
        if kq < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            kq,
            entries: HashMap::new(),
            buf: vec![unsafe { std::mem::zeroed() }; MAX_EVENTS],
        })
    }

    fn change(&self, fd: RawFd, filter: i16, flags: u16) -> io::Result<()> {
        let ev = libc::kevent {
            ident: fd as libc::uintptr_t,
            filter,
            flags,
            fflags: 0,
            data: 0,
            udata: ptr::null_mut(),
        };
        let rc = unsafe { libc::kevent(self.kq, &ev, 1, ptr::null_mut(), 0, ptr::null()) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn apply(&self, fd: RawFd, old: u8, new: u8) -> io::Result<()> {
        if new & interest::READ != 0 {
            self.change(fd, libc::EVFILT_READ, libc::EV_ADD)?;
        } else if old & interest::READ != 0 {
            let _ = self.change(fd, libc::EVFILT_READ, libc::EV_DELETE);
        }
        if new & interest::WRITE != 0 {
            self.change(fd, libc::EVFILT_WRITE, libc::EV_ADD)?;
        } else if old & interest::WRITE != 0 {
            let _ = self.change(fd, libc::EVFILT_WRITE, libc::EV_DELETE);
        }
        Ok(())
    }
}

impl EventPoll for KqueuePoll {
    fn add(&mut self, fd: RawFd, interest_mask: u8, token: u64) -> io::Result<()> {
        if self.entries.contains_key(&fd) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "fd already registered",
            ));
        }
        self.apply(fd, 0, interest_mask)?;
        self.entries.insert(
            fd,
            Entry {
                interest: interest_mask,
                token,
            },
        );
        Ok(())
    }

    fn modify(&mut self, fd: RawFd, interest_mask: u8) -> io::Result<()> {
        let old = match self.entries.get(&fd) {
            Some(e) => e.interest,
            None => {
                return Err(io::Error::new(io::ErrorKind::NotFound, "fd not registered"))
            }
        };
        self.apply(fd, old, interest_mask)?;
        if let Some(e) = self.entries.get_mut(&fd) {
            e.interest = interest_mask;
        }
        Ok(())
    }

    fn remove(&mut self, fd: RawFd) -> io::Result<()> {
        let entry = self
            .entries
            .remove(&fd)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "fd not registered"))?;
        let _ = self.apply(fd, entry.interest, 0);
        Ok(())
    }

    fn wait(&mut self, timeout_ms: i32, out: &mut Vec<PollEvent>) -> io::Result<usize> {
        let ts;
        let ts_ptr = if timeout_ms < 0 {
            ptr::null()
        } else {
            ts = libc::timespec {
                tv_sec: (timeout_ms / 1000) as libc::time_t,
                tv_nsec: ((timeout_ms % 1000) * 1_000_000) as libc::c_long,
            };
            &ts as *const libc::timespec
        };

        let n = loop {
            let rc = unsafe {
                libc::kevent(
                    self.kq,
                    ptr::null(),
                    0,
                    self.buf.as_mut_ptr(),
                    self.buf.len() as libc::c_int,
                    ts_ptr,
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

        // Coalesce the two filters into one event per fd.
        let mut appended = 0;
        for ev in &self.buf[..n] {
            let fd = ev.ident as RawFd;
            let entry = match self.entries.get(&fd) {
                Some(e) => e,
                None => continue,
            };
            let mut events = match ev.filter {
                libc::EVFILT_READ => interest::READ,
                libc::EVFILT_WRITE => interest::WRITE,
                _ => 0,
            };
            if ev.flags & libc::EV_EOF != 0 {
                events |= interest::HANGUP;
            }
            if ev.flags & libc::EV_ERROR != 0 {
                events |= interest::ERR;
            }
            if events == 0 {
                continue;
            }
            if let Some(prev) = out
                .iter_mut()
                .rev()
                .take(appended)
                .find(|p| p.fd == fd)
            {
                prev.events |= events;
            } else {
                out.push(PollEvent {
                    fd,
                    events,
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
        let fds: Vec<(RawFd, u8)> = self
            .entries
            .iter()
            .map(|(fd, e)| (*fd, e.interest))
            .collect();
        for (fd, old) in fds {
            let _ = self.apply(fd, old, 0);
        }
        self.entries.clear();
    }
}

impl Drop for KqueuePoll {
    fn drop(&mut self) {
        unsafe { libc::close(self.kq) };
    }
}
