//! homelink: CoAP discovery, registration and pairing for small networked devices
//!
//! A device finds a discovery server by multicasting a `.well-known/core`
//! query, registers its descriptor, keeps itself alive with heartbeats, and
//! pairs with other devices over a multicast request/response handshake.
//! A lifecycle state machine sequences all of it around network events.
pub mod core;
pub mod discovery;
pub mod lifecycle;
pub mod network;
pub mod node;
pub mod pairing;
pub mod protocol;
pub mod resource;
pub mod settings;
pub mod util;

// Re-export commonly used items
pub use self::core::{Config, DeviceDescriptor, Entity, EntityType, Error, PairingRole, Result};
pub use self::lifecycle::{EventFlags, EventSignal, LifecycleState, StatusPattern};
pub use self::node::{Node, NodeHandle};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
