//! Sockets, connection pooling, and TLS transport.

mod pool;
mod socket;
pub mod tls;

pub use pool::{PooledSocket, SocketKey, SocketPool};
pub use socket::{PeekStatus, TcpSocket};
