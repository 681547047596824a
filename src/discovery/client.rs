use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::core::{
    DeviceDescriptor, Error, Result, DISCOVERY_HEARTBEAT_PATH, DISCOVERY_REGISTER_PATH,
    DISCOVERY_VERSION_PATH, WELL_KNOWN_CORE_PATH,
};
use crate::lifecycle::{EventFlags, EventSignal};
use crate::network::{ClientEndpoint, MulticastEngine};
use crate::protocol::payload::{
    self, HeartbeatRequest, HeartbeatResponse, RegisterResponse, VersionDocument,
    STATUS_HEARTBEAT_RECEIVED, STATUS_REGISTERED,
};
use crate::protocol::Method;
use crate::util::Wait;
use super::heartbeat::Heartbeat;

/// Whether a resource listing advertises the discovery protocol
pub fn accepts_listing(listing: &[u8]) -> bool {
    payload::links_contain(listing, DISCOVERY_REGISTER_PATH)
        && payload::links_contain(listing, DISCOVERY_VERSION_PATH)
}

#[derive(Debug, Default, Clone, Copy)]
struct DiscoveryState {
    server_discovered: bool,
    registered: bool,
    server_addr: Option<SocketAddr>,
}

/// Finds the discovery server, registers the device and keeps it alive
pub struct DiscoveryClient {
    device: Arc<DeviceDescriptor>,
    endpoint: Arc<ClientEndpoint>,
    multicast: Arc<MulticastEngine>,
    state: Mutex<DiscoveryState>,
    heartbeat: Heartbeat,
    in_progress: AtomicBool,
}

impl DiscoveryClient {
    pub fn new(
        device: Arc<DeviceDescriptor>,
        endpoint: Arc<ClientEndpoint>,
        multicast: Arc<MulticastEngine>,
    ) -> Arc<Self> {
        info!("Discovery client initialized - server discovery required");
        Arc::new(DiscoveryClient {
            device,
            endpoint,
            multicast,
            state: Mutex::new(DiscoveryState::default()),
            heartbeat: Heartbeat::new(),
            in_progress: AtomicBool::new(false),
        })
    }

    pub fn device(&self) -> &DeviceDescriptor {
        &self.device
    }

    pub fn is_server_discovered(&self) -> bool {
        self.state.lock().server_discovered
    }

    pub fn is_registered(&self) -> bool {
        self.state.lock().registered
    }

    pub fn server_addr(&self) -> Option<SocketAddr> {
        self.state.lock().server_addr
    }

    pub fn is_heartbeat_running(&self) -> bool {
        self.heartbeat.is_running()
    }

    /// Multicasts a resource listing query and binds to the first server found
    ///
    /// Later matching responders within the same window are ignored.
    pub async fn discover_server(&self, timeout: Duration) -> Result<SocketAddr> {
        info!("Starting server discovery using {} multicast", WELL_KNOWN_CORE_PATH);
        *self.state.lock() = DiscoveryState::default();

        let mut found: Option<SocketAddr> = None;
        self.multicast
            .send_and_collect(Method::Get, WELL_KNOWN_CORE_PATH, &[], Wait::from(timeout), |message, from| {
                debug!(
                    "Received {} response ({} bytes) from {}",
                    WELL_KNOWN_CORE_PATH,
                    message.payload.len(),
                    from
                );
                if !accepts_listing(&message.payload) {
                    warn!("Server {} does not support discovery protocol", from);
                    return;
                }
                match found {
                    None => {
                        info!("Discovery server found at {}", from);
                        found = Some(from);
                    }
                    Some(first) => debug!("Ignoring discovery server {}, already bound to {}", from, first),
                }
            })
            .await
            .map_err(|e| {
                error!("Failed to send multicast discovery request: {}", e);
                e
            })?;

        match found {
            Some(addr) => {
                self.endpoint.set_addr(addr);
                let mut state = self.state.lock();
                state.server_discovered = true;
                state.server_addr = Some(addr);
                info!("Server discovery completed successfully");
                Ok(addr)
            }
            None => {
                warn!("No discovery server found within timeout");
                Err(Error::timeout(format!("no discovery server answered within {:?}", timeout)))
            }
        }
    }

    /// Binds to a known server without multicasting
    pub fn set_server_address(&self, addr: SocketAddr) {
        self.endpoint.set_addr(addr);
        let mut state = self.state.lock();
        state.server_discovered = true;
        state.server_addr = Some(addr);
        info!("Discovery server address set to {}", addr);
    }

    fn require_server(&self) -> Result<()> {
        if self.is_server_discovered() {
            Ok(())
        } else {
            error!("Server not discovered yet");
            Err(Error::not_connected("discovery server not discovered"))
        }
    }

    pub async fn get_server_version(&self) -> Result<VersionDocument> {
        self.require_server()?;
        let body = self.endpoint.get(DISCOVERY_VERSION_PATH).await?.into_content()?;
        let version: VersionDocument = payload::decode(&body).map_err(|e| {
            error!("Failed to parse version response: {}", e);
            e
        })?;
        debug!("Server version: {}.{}", version.major, version.minor);
        Ok(version)
    }

    /// Sends the device descriptor to the server
    pub async fn register_device(&self) -> Result<RegisterResponse> {
        self.device.validate()?;
        self.require_server()?;

        let body = payload::encode(self.device.as_ref())?;
        let response = self
            .endpoint
            .put(DISCOVERY_REGISTER_PATH, body)
            .await?
            .into_content()?;
        let response: RegisterResponse = payload::decode(&response).map_err(|e| {
            error!("Failed to parse registration response: {}", e);
            e
        })?;

        if response.status != STATUS_REGISTERED {
            error!("Registration failed with status: {}", response.status);
            return Err(Error::protocol(format!("registration rejected: {}", response.status)));
        }

        self.state.lock().registered = true;
        info!(
            "Device successfully registered: {}",
            response.device_id.as_deref().unwrap_or(&self.device.id)
        );
        if let Some(note) = response.note.as_deref().filter(|n| !n.is_empty()) {
            info!("Server note: {}", note);
        }
        Ok(response)
    }

    pub async fn send_heartbeat(&self) -> Result<()> {
        if !self.is_registered() {
            return Err(Error::invalid_state("device is not registered"));
        }
        self.require_server()?;

        let request = HeartbeatRequest {
            device_id: self.device.id.clone(),
        };
        let body = self
            .endpoint
            .put(DISCOVERY_HEARTBEAT_PATH, payload::encode(&request)?)
            .await?
            .into_content()?;
        let response: HeartbeatResponse = payload::decode(&body)?;

        if response.status == STATUS_HEARTBEAT_RECEIVED {
            debug!("Heartbeat acknowledged by server");
        } else {
            warn!("Unexpected heartbeat response: {}", response.status);
        }
        Ok(())
    }

    /// Starts periodic heartbeats at the device's configured interval
    pub fn start_heartbeat(self: &Arc<Self>) -> Result<()> {
        if !self.is_registered() {
            return Err(Error::invalid_state("cannot start heartbeat before registration"));
        }
        let period = self
            .device
            .heartbeat_period()
            .ok_or_else(|| Error::invalid_argument("heartbeat interval is zero"))?;

        let client: Weak<Self> = Arc::downgrade(self);
        self.heartbeat.start(period, move || {
            let client = client.upgrade();
            async move {
                match client {
                    Some(client) => client.send_heartbeat().await,
                    None => Err(Error::invalid_state("discovery client dropped")),
                }
            }
        });
        info!("Heartbeat started with interval {:?}", period);
        Ok(())
    }

    pub fn stop_heartbeat(&self) -> bool {
        let stopped = self.heartbeat.stop();
        if stopped {
            info!("Heartbeat stopped");
        }
        stopped
    }

    /// Discovery, version check and registration in sequence
    ///
    /// A failed version check is logged and does not abort the attempt.
    pub async fn run(self: &Arc<Self>, timeout: Duration) -> Result<()> {
        self.stop_heartbeat();
        self.discover_server(timeout).await?;

        match self.get_server_version().await {
            Ok(version) => info!("Discovery server version {}.{}", version.major, version.minor),
            Err(e) => warn!("Failed to get server version: {}", e),
        }

        self.register_device().await?;

        if self.device.heartbeat_period().is_some() {
            self.start_heartbeat()?;
        }
        Ok(())
    }

    /// Runs one attempt in the background and reports the outcome as an event
    pub fn spawn_attempt(self: &Arc<Self>, timeout: Duration, events: Arc<EventSignal>) -> Result<()> {
        if self.in_progress.swap(true, Ordering::AcqRel) {
            return Err(Error::already_in_progress("discovery attempt already running"));
        }

        let client = Arc::clone(self);
        tokio::spawn(async move {
            let outcome = client.run(timeout).await;
            client.in_progress.store(false, Ordering::Release);
            match outcome {
                Ok(()) => events.post(EventFlags::DISCOVERY_COMPLETED),
                Err(e) => {
                    warn!("Discovery failed: {}", e);
                    events.post(EventFlags::DISCOVERY_FAILED);
                }
            }
        });
        Ok(())
    }

    pub fn is_attempt_running(&self) -> bool {
        self.in_progress.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Entity, EntityType, ExchangeConfig};
    use crate::discovery::DiscoveryRegistry;
    use crate::network::{BufferPool, CoapServer};
    use crate::resource::ResourceTable;

    fn device(heartbeat: u32) -> Arc<DeviceDescriptor> {
        Arc::new(
            DeviceDescriptor::new("dev-1")
                .with_manufacturer("acme")
                .with_heartbeat_interval(heartbeat)
                .with_entity(Entity::new("e0", EntityType::LIGHT, 0)),
        )
    }

    fn start_registry() -> (CoapServer, Arc<DiscoveryRegistry>, SocketAddr) {
        let table = Arc::new(ResourceTable::new());
        let registry = DiscoveryRegistry::new(1, 2);
        registry.register_resources(&table).unwrap();
        let server = CoapServer::new("127.0.0.1:0".parse().unwrap(), table);
        let addr = server.start().unwrap();
        (server, registry, addr)
    }

    fn client(device: Arc<DeviceDescriptor>, group: SocketAddr) -> Arc<DiscoveryClient> {
        let endpoint = Arc::new(ClientEndpoint::new(ExchangeConfig::default()));
        let multicast = Arc::new(MulticastEngine::new(BufferPool::new(2, 256), group));
        DiscoveryClient::new(device, endpoint, multicast)
    }

    #[test]
    fn test_acceptance_predicate() {
        assert!(accepts_listing(b"</discovery/register>,</discovery/version>"));
        assert!(accepts_listing(b"</a>,</discovery/version>,</discovery/register>,</discovery/heartbeat>"));
        assert!(!accepts_listing(b"</other>"));
        assert!(!accepts_listing(b"</discovery/register>"));
    }

    #[tokio::test]
    async fn test_requires_discovery_first() {
        let client = client(device(0), "127.0.0.1:9".parse().unwrap());
        assert!(matches!(client.get_server_version().await, Err(Error::NotConnected(_))));
        assert!(matches!(client.register_device().await, Err(Error::NotConnected(_))));
        assert!(matches!(client.send_heartbeat().await, Err(Error::InvalidState(_))));
        assert!(matches!(client.start_heartbeat(), Err(Error::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_discover_register_heartbeat() {
        let (server, registry, addr) = start_registry();
        let client = client(device(30), addr);

        let found = client.discover_server(Duration::from_millis(300)).await.unwrap();
        assert_eq!(found, addr);
        assert!(client.is_server_discovered());

        let version = client.get_server_version().await.unwrap();
        assert_eq!((version.major, version.minor), (1, 2));

        let response = client.register_device().await.unwrap();
        assert_eq!(response.status, STATUS_REGISTERED);
        assert!(client.is_registered());

        let stored = registry.device("dev-1").unwrap();
        assert_eq!(stored.device, *client.device());

        client.send_heartbeat().await.unwrap();
        assert_eq!(registry.device("dev-1").unwrap().heartbeats, 1);

        client.start_heartbeat().unwrap();
        assert!(client.stop_heartbeat());
        server.stop();
    }

    #[tokio::test]
    async fn test_discovery_times_out_without_server() {
        let silent = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let client = client(device(0), silent.local_addr().unwrap());

        let started = tokio::time::Instant::now();
        let err = client.discover_server(Duration::from_millis(100)).await.unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        assert!(started.elapsed() < Duration::from_millis(500));
        assert!(!client.is_server_discovered());
    }

    #[tokio::test]
    async fn test_attempt_posts_outcome() {
        let (server, _registry, addr) = start_registry();
        let client = client(device(0), addr);
        let events = Arc::new(EventSignal::new());

        client.spawn_attempt(Duration::from_millis(200), Arc::clone(&events)).unwrap();
        assert!(matches!(
            client.spawn_attempt(Duration::from_millis(200), Arc::clone(&events)),
            Err(Error::AlreadyInProgress(_))
        ));

        let outcome = events.wait_drain().await;
        assert_eq!(outcome, EventFlags::DISCOVERY_COMPLETED);
        assert!(client.is_registered());
        assert!(!client.is_heartbeat_running());
        server.stop();

        let silent = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let lonely = self::client(device(0), silent.local_addr().unwrap());
        lonely.spawn_attempt(Duration::from_millis(50), Arc::clone(&events)).unwrap();
        assert_eq!(events.wait_drain().await, EventFlags::DISCOVERY_FAILED);
    }
}
