//! Discovery module
//!
//! Client side: multicast server discovery, version check, registration and
//! heartbeats. Server side: the registry answering those requests.

mod client;
mod heartbeat;
mod server;

pub use self::client::{accepts_listing, DiscoveryClient};
pub use self::heartbeat::Heartbeat;
pub use self::server::{DiscoveryRegistry, Registration};
