use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use serde::{Serialize, Deserialize};

use super::{Error, Result};

/// Device type tag carried by entities and pairing requests
///
/// Types are single bits so that a coordinator can filter on a mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityType(pub u32);

impl EntityType {
    pub const SWITCH: EntityType = EntityType(1);
    pub const LIGHT: EntityType = EntityType(2);

    /// Whether this type intersects a capability filter
    pub fn matches(&self, filter: u32) -> bool {
        self.0 & filter != 0
    }
}

/// One controllable function of a device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    #[serde(rename = "entity_id")]
    pub id: String,
    #[serde(rename = "type")]
    pub kind: EntityType,
    pub capabilities: u32,
}

impl Entity {
    pub fn new(id: impl Into<String>, kind: EntityType, capabilities: u32) -> Self {
        Entity {
            id: id.into(),
            kind,
            capabilities,
        }
    }
}

/// Identity and capabilities announced to the discovery server
///
/// The field names double as the registration document layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    #[serde(rename = "device_id")]
    pub id: String,
    #[serde(default)]
    pub firmware_version: String,
    #[serde(default)]
    pub hardware_version: String,
    #[serde(default)]
    pub manufacturer: String,
    /// Heartbeat period in seconds, 0 disables heartbeats
    #[serde(default)]
    pub heartbeat_interval: u32,
    #[serde(default)]
    pub entities: Vec<Entity>,
}

impl DeviceDescriptor {
    pub fn new(id: impl Into<String>) -> Self {
        DeviceDescriptor {
            id: id.into(),
            firmware_version: String::new(),
            hardware_version: String::new(),
            manufacturer: String::new(),
            heartbeat_interval: 0,
            entities: Vec::new(),
        }
    }

    pub fn with_manufacturer(mut self, manufacturer: impl Into<String>) -> Self {
        self.manufacturer = manufacturer.into();
        self
    }

    pub fn with_versions(mut self, firmware: impl Into<String>, hardware: impl Into<String>) -> Self {
        self.firmware_version = firmware.into();
        self.hardware_version = hardware.into();
        self
    }

    pub fn with_heartbeat_interval(mut self, secs: u32) -> Self {
        self.heartbeat_interval = secs;
        self
    }

    pub fn with_entity(mut self, entity: Entity) -> Self {
        self.entities.push(entity);
        self
    }

    /// Heartbeat period, if heartbeats are enabled
    pub fn heartbeat_period(&self) -> Option<Duration> {
        match self.heartbeat_interval {
            0 => None,
            secs => Some(Duration::from_secs(u64::from(secs))),
        }
    }

    /// Union of all entity types, used as the pairing device type
    pub fn device_type(&self) -> u32 {
        self.entities.iter().fold(0, |acc, e| acc | e.kind.0)
    }

    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(Error::invalid_argument("device id must not be empty"));
        }
        if self.entities.len() > super::MAX_ENTITIES {
            return Err(Error::invalid_argument(format!(
                "device {} has {} entities (max {})",
                self.id,
                self.entities.len(),
                super::MAX_ENTITIES
            )));
        }
        Ok(())
    }
}

/// Which side of the pairing handshake this device plays
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum PairingRole {
    /// Pairing disabled
    None,
    /// Broadcast our type and bind to whichever coordinator answers
    Requester {
        device_type: u32,
    },
    /// Answer matching requests with our address while the window is open
    Coordinator {
        filter: u32,
        /// Address handed to requesters
        advertise: IpAddr,
    },
}

/// Buffer pool geometry for outbound multicast packets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    pub count: usize,
    pub size: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            count: 2,
            size: 256,
        }
    }
}

/// Timing of the confirmable request/response primitive
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeConfig {
    /// Initial retransmission timeout
    #[serde(serialize_with = "super::serde::serialize_duration")]
    #[serde(deserialize_with = "super::serde::deserialize_duration")]
    pub ack_timeout: Duration,
    /// Retransmissions before giving up
    pub max_retransmit: u32,
    /// How long to wait for a separate response after an empty ACK
    #[serde(serialize_with = "super::serde::serialize_duration")]
    #[serde(deserialize_with = "super::serde::deserialize_duration")]
    pub response_timeout: Duration,
    /// Largest datagram accepted
    pub max_message_size: usize,
    /// Largest body reassembled from Block2 continuations
    #[serde(default = "default_max_body_size")]
    pub max_body_size: usize,
}

fn default_max_body_size() -> usize {
    16 * 1152
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        ExchangeConfig {
            ack_timeout: Duration::from_secs(2),
            max_retransmit: 4,
            response_timeout: Duration::from_secs(30),
            max_message_size: 1152,
            max_body_size: default_max_body_size(),
        }
    }
}

/// Configuration for a homelink node
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Devices hosted by this node, the first one is active
    pub devices: Vec<DeviceDescriptor>,
    /// Look for a discovery server after the network comes up
    pub discovery_enabled: bool,
    /// Multicast collection window for server discovery
    #[serde(serialize_with = "super::serde::serialize_duration")]
    #[serde(deserialize_with = "super::serde::deserialize_duration")]
    pub discovery_timeout: Duration,
    /// How long a requester waits for a coordinator
    #[serde(serialize_with = "super::serde::serialize_duration")]
    #[serde(deserialize_with = "super::serde::deserialize_duration")]
    pub pairing_request_timeout: Duration,
    /// How long a coordinator keeps its pairing window open
    #[serde(serialize_with = "super::serde::serialize_duration")]
    #[serde(deserialize_with = "super::serde::deserialize_duration")]
    pub pairing_window: Duration,
    pub pairing: PairingRole,
    /// Local address for the resource server
    pub server_addr: SocketAddr,
    /// Join the multicast group on the server socket
    pub server_join_multicast: bool,
    /// Destination of discovery and pairing multicasts
    pub multicast_group: SocketAddr,
    pub pool: PoolConfig,
    pub exchange: ExchangeConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            devices: Vec::new(),
            discovery_enabled: true,
            discovery_timeout: Duration::from_secs(5),
            pairing_request_timeout: Duration::from_secs(10),
            pairing_window: Duration::from_secs(30),
            pairing: PairingRole::None,
            server_addr: SocketAddr::new(IpAddr::from([0, 0, 0, 0]), super::DEFAULT_PORT),
            server_join_multicast: true,
            multicast_group: super::default_multicast_group(),
            pool: PoolConfig::default(),
            exchange: ExchangeConfig::default(),
        }
    }
}

impl Config {
    /// Parses a JSON configuration document
    pub fn from_json(text: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(text)
            .map_err(|e| Error::config(format!("Invalid configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses a JSON configuration file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("Failed to read {}: {}", path.display(), e)))?;
        Self::from_json(&text)
    }

    pub fn validate(&self) -> Result<()> {
        for device in &self.devices {
            device.validate().map_err(|e| Error::config(e.to_string()))?;
        }
        if self.pool.count == 0 || self.pool.size == 0 {
            return Err(Error::config("buffer pool must have at least one non-empty slot"));
        }
        if self.exchange.ack_timeout.is_zero() {
            return Err(Error::config("ack timeout must be non-zero"));
        }
        Ok(())
    }

    /// The device this node registers and pairs as
    pub fn active_device(&self) -> Result<&DeviceDescriptor> {
        self.devices
            .first()
            .ok_or_else(|| Error::config("no device configured"))
    }
}
