//! Idle-socket reuse keyed by (host, port, username, proxy).
//!
//! Commands targeting the same endpoint borrow a validated idle connection
//! instead of paying connect + TLS again. The map is guarded by a mutex with
//! short critical sections (push/pop/scan); candidates are validated after
//! popping, outside the lock.

use super::socket::{PeekStatus, TcpSocket};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Connection identity for reuse purposes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SocketKey {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub proxy: String,
}

impl SocketKey {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            username: String::new(),
            proxy: String::new(),
        }
    }
}

impl std::fmt::Display for SocketKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// A pooled connection: the socket plus its identity and idle timestamp.
#[derive(Debug)]
pub struct PooledSocket {
    pub socket: TcpSocket,
    pub key: SocketKey,
    last_used: Instant,
}

impl PooledSocket {
    pub fn new(socket: TcpSocket, key: SocketKey) -> Self {
        Self {
            socket,
            key,
            last_used: Instant::now(),
        }
    }

    pub fn idle_for(&self) -> Duration {
        self.last_used.elapsed()
    }

    /// True if the connection is still usable: no socket error, no EOF, and
    /// no stale unread bytes from a previous response.
    pub fn is_valid(&self) -> bool {
        self.socket.peek_status() == PeekStatus::Idle
    }
}

/// Keyed pool of idle connections with per-key and global caps.
pub struct SocketPool {
    idle: Mutex<HashMap<SocketKey, Vec<PooledSocket>>>,
    timeout: Duration,
    max_idle_per_key: usize,
    max_idle_total: usize,
}

impl SocketPool {
    pub fn new(timeout: Duration, max_idle_per_key: usize, max_idle_total: usize) -> Self {
        Self {
            idle: Mutex::new(HashMap::new()),
            timeout,
            max_idle_per_key,
            max_idle_total,
        }
    }

    /// Pop a validated idle connection for `key`, or None (caller connects).
    /// Stale candidates found on the way are closed and discarded.
    pub fn acquire(&self, key: &SocketKey) -> Option<PooledSocket> {
        loop {
            let candidate = {
                let mut idle = self.idle.lock().unwrap();
                match idle.get_mut(key) {
                    Some(bucket) => {
                        let c = bucket.pop();
                        if bucket.is_empty() {
                            idle.remove(key);
                        }
                        c
                    }
                    None => None,
                }
            };
            let candidate = candidate?;
            if candidate.is_valid() {
                tracing::trace!(key = %key, "reusing pooled connection");
                return Some(candidate);
            }
            // Invalid: dropped here (fd closed), try the next one.
        }
    }

    /// Return a connection to the idle list; closed instead if invalid or
    /// the pool is at capacity (evicting the least recently used on global
    /// overflow).
    pub fn release(&self, mut socket: PooledSocket) {
        if !socket.is_valid() {
            return; // dropped, closing the fd
        }
        socket.last_used = Instant::now();

        let mut idle = self.idle.lock().unwrap();
        let total: usize = idle.values().map(Vec::len).sum();
        let bucket_len = idle.get(&socket.key).map_or(0, Vec::len);
        if bucket_len >= self.max_idle_per_key {
            return;
        }
        if total >= self.max_idle_total {
            evict_lru(&mut idle);
        }
        idle.entry(socket.key.clone()).or_default().push(socket);
    }

    /// Close idle connections older than the pool timeout. Returns how many
    /// were evicted.
    pub fn cleanup_expired(&self) -> usize {
        let mut idle = self.idle.lock().unwrap();
        let mut evicted = 0;
        idle.retain(|_, bucket| {
            let before = bucket.len();
            bucket.retain(|s| s.idle_for() < self.timeout);
            evicted += before - bucket.len();
            !bucket.is_empty()
        });
        if evicted > 0 {
            tracing::debug!(evicted, "closed expired pooled connections");
        }
        evicted
    }

    /// Close everything.
    pub fn clear(&self) {
        self.idle.lock().unwrap().clear();
    }

    /// Number of idle connections currently held.
    pub fn idle_count(&self) -> usize {
        self.idle.lock().unwrap().values().map(Vec::len).sum()
    }
}

impl Default for SocketPool {
    fn default() -> Self {
        Self::new(Duration::from_secs(30), 6, 32)
    }
}

fn evict_lru(idle: &mut HashMap<SocketKey, Vec<PooledSocket>>) {
    let mut oldest: Option<(SocketKey, usize, Instant)> = None;
    for (key, bucket) in idle.iter() {
        for (i, s) in bucket.iter().enumerate() {
            if oldest.as_ref().map_or(true, |(_, _, t)| s.last_used < *t) {
                oldest = Some((key.clone(), i, s.last_used));
            }
        }
    }
    if let Some((key, i, _)) = oldest {
        if let Some(bucket) = idle.get_mut(&key) {
            bucket.remove(i);
            if bucket.is_empty() {
                idle.remove(&key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn connected_pair(listener: &TcpListener) -> (TcpSocket, std::net::TcpStream) {
        let addr = listener.local_addr().unwrap();
        let (sock, in_progress) = TcpSocket::connect(&addr).unwrap();
        let (server_side, _) = listener.accept().unwrap();
        if in_progress {
            let mut pfd = libc::pollfd {
                fd: sock.as_raw_fd(),
                events: libc::POLLOUT,
                revents: 0,
            };
            unsafe { libc::poll(&mut pfd, 1, 2000) };
        }
        (sock, server_side)
    }

    #[test]
    fn release_then_acquire_reuses() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let pool = SocketPool::default();
        let key = SocketKey::new("localhost", listener.local_addr().unwrap().port());

        let (sock, _server) = connected_pair(&listener);
        pool.release(PooledSocket::new(sock, key.clone()));
        assert_eq!(pool.idle_count(), 1);

        let reused = pool.acquire(&key);
        assert!(reused.is_some());
        assert_eq!(pool.idle_count(), 0);
        // Exactly one owner now: the caller.
        assert!(pool.acquire(&key).is_none());
    }

    #[test]
    fn acquire_skips_dead_connections() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let pool = SocketPool::default();
        let key = SocketKey::new("localhost", listener.local_addr().unwrap().port());

        let (sock, server) = connected_pair(&listener);
        pool.release(PooledSocket::new(sock, key.clone()));
        drop(server); // peer closes while the socket sits idle
        std::thread::sleep(Duration::from_millis(50));

        assert!(pool.acquire(&key).is_none());
        assert_eq!(pool.idle_count(), 0);
    }

    #[test]
    fn per_key_cap_closes_overflow() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let pool = SocketPool::new(Duration::from_secs(30), 1, 8);
        let key = SocketKey::new("localhost", listener.local_addr().unwrap().port());

        let (a, _sa) = connected_pair(&listener);
        let (b, _sb) = connected_pair(&listener);
        pool.release(PooledSocket::new(a, key.clone()));
        pool.release(PooledSocket::new(b, key.clone()));
        assert_eq!(pool.idle_count(), 1);
    }

    #[test]
    fn cleanup_expired_closes_old_sockets() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let pool = SocketPool::new(Duration::from_millis(10), 4, 8);
        let key = SocketKey::new("localhost", listener.local_addr().unwrap().port());

        let (sock, _server) = connected_pair(&listener);
        pool.release(PooledSocket::new(sock, key));
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(pool.cleanup_expired(), 1);
        assert_eq!(pool.idle_count(), 0);
    }

    #[test]
    fn distinct_keys_do_not_share() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let pool = SocketPool::default();
        let port = listener.local_addr().unwrap().port();
        let key_a = SocketKey::new("a.example", port);
        let key_b = SocketKey::new("b.example", port);

        let (sock, _server) = connected_pair(&listener);
        pool.release(PooledSocket::new(sock, key_a));
        assert!(pool.acquire(&key_b).is_none());
        assert_eq!(pool.idle_count(), 1);
    }
}
