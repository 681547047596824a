use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::core::{
    DeviceDescriptor, Result, DISCOVERY_HEARTBEAT_PATH, DISCOVERY_REGISTER_PATH,
    DISCOVERY_VERSION_PATH,
};
use crate::protocol::payload::{
    self, HeartbeatRequest, HeartbeatResponse, RegisterResponse, VersionDocument,
    STATUS_HEARTBEAT_RECEIVED, STATUS_REGISTERED, STATUS_UNKNOWN_DEVICE,
};
use crate::protocol::Code;
use crate::resource::{Reply, Request, Resource, ResourceTable};

/// A device known to the registry
#[derive(Debug, Clone)]
pub struct Registration {
    pub device: DeviceDescriptor,
    pub source: SocketAddr,
    pub registered_at: Instant,
    pub last_heartbeat: Option<Instant>,
    pub heartbeats: u64,
}

/// Server side of the discovery protocol
pub struct DiscoveryRegistry {
    version: VersionDocument,
    devices: Mutex<HashMap<String, Registration>>,
}

impl DiscoveryRegistry {
    pub fn new(major: u32, minor: u32) -> Arc<Self> {
        Arc::new(DiscoveryRegistry {
            version: VersionDocument { major, minor },
            devices: Mutex::new(HashMap::new()),
        })
    }

    /// Serves the version, register and heartbeat endpoints from `table`
    pub fn register_resources(self: &Arc<Self>, table: &ResourceTable) -> Result<()> {
        table.register(DISCOVERY_VERSION_PATH, Arc::new(VersionResource(Arc::clone(self))))?;
        table.register(DISCOVERY_REGISTER_PATH, Arc::new(RegisterResource(Arc::clone(self))))?;
        table.register(DISCOVERY_HEARTBEAT_PATH, Arc::new(HeartbeatResource(Arc::clone(self))))?;
        Ok(())
    }

    pub fn device(&self, id: &str) -> Option<Registration> {
        self.devices.lock().get(id).cloned()
    }

    pub fn device_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.devices.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.devices.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.lock().is_empty()
    }

    fn register(&self, device: DeviceDescriptor, source: SocketAddr) -> RegisterResponse {
        let response = RegisterResponse {
            status: STATUS_REGISTERED.to_string(),
            device_id: Some(device.id.clone()),
            heartbeat_interval: Some(device.heartbeat_interval),
            heartbeat_endpoint: Some(DISCOVERY_HEARTBEAT_PATH.to_string()),
            note: None,
        };

        info!("Registered device {} ({} entities) from {}", device.id, device.entities.len(), source);
        self.devices.lock().insert(
            device.id.clone(),
            Registration {
                device,
                source,
                registered_at: Instant::now(),
                last_heartbeat: None,
                heartbeats: 0,
            },
        );
        response
    }

    fn heartbeat(&self, device_id: &str) -> bool {
        match self.devices.lock().get_mut(device_id) {
            Some(registration) => {
                registration.last_heartbeat = Some(Instant::now());
                registration.heartbeats += 1;
                debug!("Heartbeat from {}", device_id);
                true
            }
            None => {
                warn!("Heartbeat from unknown device {}", device_id);
                false
            }
        }
    }
}

struct VersionResource(Arc<DiscoveryRegistry>);

impl Resource for VersionResource {
    fn get(&self, _request: &Request<'_>) -> Reply {
        Reply::json(&self.0.version)
    }
}

struct RegisterResource(Arc<DiscoveryRegistry>);

impl Resource for RegisterResource {
    fn put(&self, request: &Request<'_>) -> Reply {
        let device: DeviceDescriptor = match payload::decode(request.payload) {
            Ok(device) => device,
            Err(e) => {
                warn!("Rejected registration from {}: {}", request.source, e);
                return Reply::status(Code::BAD_REQUEST);
            }
        };
        if let Err(e) = device.validate() {
            warn!("Rejected registration from {}: {}", request.source, e);
            return Reply::json(&RegisterResponse {
                status: "invalid".to_string(),
                device_id: None,
                heartbeat_interval: None,
                heartbeat_endpoint: None,
                note: Some(e.to_string()),
            });
        }
        Reply::json(&self.0.register(device, request.source))
    }
}

struct HeartbeatResource(Arc<DiscoveryRegistry>);

impl Resource for HeartbeatResource {
    fn put(&self, request: &Request<'_>) -> Reply {
        let heartbeat: HeartbeatRequest = match payload::decode(request.payload) {
            Ok(heartbeat) => heartbeat,
            Err(_) => return Reply::status(Code::BAD_REQUEST),
        };
        let status = if self.0.heartbeat(&heartbeat.device_id) {
            STATUS_HEARTBEAT_RECEIVED
        } else {
            STATUS_UNKNOWN_DEVICE
        };
        Reply::json(&HeartbeatResponse {
            status: status.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Entity, EntityType};
    use crate::protocol::Method;

    fn put<'a>(path: &'a str, payload: &'a [u8]) -> Request<'a> {
        Request {
            method: Method::Put,
            path,
            payload,
            source: "10.0.0.7:5683".parse().unwrap(),
        }
    }

    fn table() -> (ResourceTable, Arc<DiscoveryRegistry>) {
        let table = ResourceTable::new();
        let registry = DiscoveryRegistry::new(1, 0);
        registry.register_resources(&table).unwrap();
        (table, registry)
    }

    #[test]
    fn test_registration_document_round_trip() {
        let (table, registry) = table();
        let device = DeviceDescriptor::new("dev-1")
            .with_heartbeat_interval(30)
            .with_entity(Entity::new("e0", EntityType::LIGHT, 0));
        let body = payload::encode(&device).unwrap();

        let reply = table.dispatch(&put(DISCOVERY_REGISTER_PATH, &body));
        let response: RegisterResponse = payload::decode(&reply.payload).unwrap();
        assert_eq!(response.status, STATUS_REGISTERED);
        assert_eq!(response.heartbeat_interval, Some(30));

        let stored = registry.device("dev-1").unwrap();
        assert_eq!(stored.device.id, "dev-1");
        assert_eq!(stored.device.heartbeat_interval, 30);
        assert_eq!(stored.device.entities, vec![Entity::new("e0", EntityType::LIGHT, 0)]);
    }

    #[test]
    fn test_heartbeat_statuses() {
        let (table, registry) = table();
        let reply = table.dispatch(&put(DISCOVERY_HEARTBEAT_PATH, br#"{"device_id":"ghost"}"#));
        let response: HeartbeatResponse = payload::decode(&reply.payload).unwrap();
        assert_eq!(response.status, STATUS_UNKNOWN_DEVICE);

        table.dispatch(&put(DISCOVERY_REGISTER_PATH, br#"{"device_id":"dev-2"}"#));
        let reply = table.dispatch(&put(DISCOVERY_HEARTBEAT_PATH, br#"{"device_id":"dev-2"}"#));
        let response: HeartbeatResponse = payload::decode(&reply.payload).unwrap();
        assert_eq!(response.status, STATUS_HEARTBEAT_RECEIVED);
        assert_eq!(registry.device("dev-2").unwrap().heartbeats, 1);
    }

    #[test]
    fn test_rejects_bad_registrations() {
        let (table, registry) = table();
        assert_eq!(table.dispatch(&put(DISCOVERY_REGISTER_PATH, b"nope")).code, Code::BAD_REQUEST);

        let reply = table.dispatch(&put(DISCOVERY_REGISTER_PATH, br#"{"device_id":""}"#));
        let response: RegisterResponse = payload::decode(&reply.payload).unwrap();
        assert_eq!(response.status, "invalid");
        assert!(registry.is_empty());
    }
}
