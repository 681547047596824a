//! Core types and constants for homelink
//!
//! This module contains the fundamental building blocks used throughout the library.

pub mod error;
pub mod types;
pub mod serde;

pub use self::error::{Error, Result};
pub use self::types::{
    Config,
    DeviceDescriptor,
    Entity,
    EntityType,
    ExchangeConfig,
    PairingRole,
    PoolConfig,
};

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

/// Default CoAP port
pub const DEFAULT_PORT: u16 = 5683;

/// IPv4 "All CoAP Nodes" multicast group
pub const MULTICAST_GROUP_V4: Ipv4Addr = Ipv4Addr::new(224, 0, 1, 187);

/// Resource listing used to validate a discovery server
pub const WELL_KNOWN_CORE_PATH: &str = ".well-known/core";

/// Discovery server endpoints
pub const DISCOVERY_VERSION_PATH: &str = "discovery/version";
pub const DISCOVERY_REGISTER_PATH: &str = "discovery/register";
pub const DISCOVERY_HEARTBEAT_PATH: &str = "discovery/heartbeat";

/// Pairing endpoint served by a coordinator
pub const PAIRING_PATH: &str = "pairing/0";

/// Maximum multicast request path length in bytes
pub const MAX_PATH_LEN: usize = 255;

/// Maximum number of path segments in a multicast request
pub const MAX_PATH_SEGMENTS: usize = 10;

/// Maximum number of entities a device can describe
pub const MAX_ENTITIES: usize = 10;

/// Default multicast destination for discovery and pairing
pub fn default_multicast_group() -> SocketAddr {
    SocketAddr::V4(SocketAddrV4::new(MULTICAST_GROUP_V4, DEFAULT_PORT))
}
