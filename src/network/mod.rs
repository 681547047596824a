//! Network module
//!
//! Outbound unicast exchanges, multicast collection, the buffer pool backing
//! multicast packets, and the CoAP server.

mod client;
mod multicast;
mod pool;
mod server;

pub use self::client::{ClientEndpoint, Response};
pub use self::multicast::{check_path, MulticastEngine};
pub use self::pool::{BufferPool, PooledBuffer};
pub use self::server::CoapServer;
