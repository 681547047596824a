//! Node assembly
//!
//! Builds every component from a [`Config`], runs the lifecycle loop and
//! hands out a [`NodeHandle`] for the outside producers (network events and
//! the pairing button).

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::core::{Config, DeviceDescriptor, Error, PairingRole, Result};
use crate::discovery::DiscoveryClient;
use crate::lifecycle::{
    Actions, EventFlags, EventSignal, Lifecycle, LifecycleState, StatusIndicator, StatusPattern,
};
use crate::network::{BufferPool, ClientEndpoint, CoapServer, MulticastEngine};
use crate::pairing::{PairingCoordinator, PairingRequester};
use crate::resource::{self, ControlClient, LightDriver, ResourceTable, SwitchDriver};
use crate::settings::{self, SettingsStore};

enum PairingSide {
    None,
    Requester {
        requester: PairingRequester,
        device_type: u32,
        busy: AtomicBool,
    },
    Coordinator(Arc<PairingCoordinator>),
}

/// Components shared by the lifecycle actions and the handle
struct Shared {
    config: Config,
    device: Arc<DeviceDescriptor>,
    events: Arc<EventSignal>,
    endpoint: Arc<ClientEndpoint>,
    discovery: Arc<DiscoveryClient>,
    table: Arc<ResourceTable>,
    server: CoapServer,
    settings: Arc<dyn SettingsStore>,
    indicator: Arc<dyn StatusIndicator>,
    pairing: PairingSide,
}

/// A device assembled from configuration, not yet running
pub struct Node {
    shared: Arc<Shared>,
}

impl Node {
    pub fn new(
        config: Config,
        settings: Arc<dyn SettingsStore>,
        indicator: Arc<dyn StatusIndicator>,
    ) -> Result<Self> {
        config.validate()?;
        let device = Arc::new(config.active_device()?.clone());

        let events = Arc::new(EventSignal::new());
        let pool = BufferPool::new(config.pool.count, config.pool.size);
        let endpoint = Arc::new(ClientEndpoint::new(config.exchange.clone()));
        let multicast = Arc::new(MulticastEngine::new(pool, config.multicast_group));
        let discovery = DiscoveryClient::new(Arc::clone(&device), Arc::clone(&endpoint), Arc::clone(&multicast));

        let table = Arc::new(ResourceTable::new());
        let mut server = CoapServer::new(config.server_addr, Arc::clone(&table));
        if config.server_join_multicast {
            server = server.with_multicast(config.multicast_group.ip());
        }

        let pairing = match &config.pairing {
            PairingRole::None => PairingSide::None,
            PairingRole::Requester { device_type } => PairingSide::Requester {
                requester: PairingRequester::new(Arc::clone(&endpoint), Arc::clone(&multicast), Arc::clone(&events)),
                device_type: *device_type,
                busy: AtomicBool::new(false),
            },
            PairingRole::Coordinator { filter, advertise } => {
                let coordinator = PairingCoordinator::new(*filter, *advertise, Arc::clone(&events));
                coordinator.register_resource(&table)?;
                PairingSide::Coordinator(coordinator)
            }
        };

        info!("Node {} assembled with {} entities", device.id, device.entities.len());
        Ok(Node {
            shared: Arc::new(Shared {
                config,
                device,
                events,
                endpoint,
                discovery,
                table,
                server,
                settings,
                indicator,
                pairing,
            }),
        })
    }

    pub fn device(&self) -> &DeviceDescriptor {
        &self.shared.device
    }

    pub fn table(&self) -> &Arc<ResourceTable> {
        &self.shared.table
    }

    /// Serves a switch entity through `driver`
    pub fn attach_switch(&self, entity_id: &str, driver: Arc<dyn SwitchDriver>) -> Result<()> {
        self.require_entity(entity_id)?;
        resource::register_switch(&self.shared.table, entity_id, driver)
    }

    /// Serves a light entity through `driver`
    pub fn attach_light(&self, entity_id: &str, driver: Arc<dyn LightDriver>) -> Result<()> {
        self.require_entity(entity_id)?;
        resource::register_light(&self.shared.table, entity_id, driver)
    }

    fn require_entity(&self, entity_id: &str) -> Result<()> {
        if self.shared.device.entities.iter().any(|e| e.id == entity_id) {
            Ok(())
        } else {
            Err(Error::invalid_argument(format!(
                "device {} has no entity {}",
                self.shared.device.id, entity_id
            )))
        }
    }

    /// Spawns the lifecycle loop
    pub fn start(self) -> NodeHandle {
        let actions = NodeActions {
            shared: Arc::clone(&self.shared),
        };
        let lifecycle = Lifecycle::new(
            actions,
            Arc::clone(&self.shared.events),
            self.shared.config.discovery_enabled,
        );
        let state = lifecycle.subscribe();
        let task = tokio::spawn(lifecycle.run());

        NodeHandle {
            shared: self.shared,
            state,
            task: Arc::new(task),
        }
    }
}

struct NodeActions {
    shared: Arc<Shared>,
}

impl Actions for NodeActions {
    fn bring_up(&mut self) {
        info!("Bringing up node {}", self.shared.device.id);
        if let Err(e) = settings::restore_endpoint(self.shared.settings.as_ref(), &self.shared.endpoint) {
            error!("Failed to restore settings: {}", e);
        }
    }

    fn start_server(&mut self) -> Result<()> {
        self.shared.server.start().map(|_| ())
    }

    fn stop_server(&mut self) -> Result<()> {
        self.shared.server.stop();
        Ok(())
    }

    fn start_discovery(&mut self) {
        let timeout = self.shared.config.discovery_timeout;
        if let Err(e) = self
            .shared
            .discovery
            .spawn_attempt(timeout, Arc::clone(&self.shared.events))
        {
            warn!("Discovery not started: {}", e);
        }
    }

    fn persist_settings(&mut self) {
        if let Err(e) = settings::persist_endpoint(self.shared.settings.as_ref(), &self.shared.endpoint) {
            error!("Failed to save settings: {}", e);
        }
    }

    fn indicate(&mut self, pattern: StatusPattern) {
        self.shared.indicator.apply(pattern);
    }
}

/// Cloneable control surface of a running node
#[derive(Clone)]
pub struct NodeHandle {
    shared: Arc<Shared>,
    state: watch::Receiver<LifecycleState>,
    task: Arc<JoinHandle<Result<()>>>,
}

impl NodeHandle {
    pub fn state(&self) -> LifecycleState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.state.clone()
    }

    /// Waits until the lifecycle reaches `target`
    pub async fn wait_for_state(&self, target: LifecycleState, timeout: Duration) -> Result<()> {
        let mut state = self.state.clone();
        let outcome = tokio::time::timeout(timeout, state.wait_for(|s| *s == target))
            .await
            .map(|reached| reached.map(|_| ()));
        match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(Error::invalid_state("lifecycle terminated")),
            Err(_) => Err(Error::timeout(format!(
                "lifecycle did not reach {} (currently {})",
                target,
                self.state()
            ))),
        }
    }

    pub fn network_connected(&self) {
        self.shared.events.post(EventFlags::CONNECTED);
    }

    pub fn network_disconnected(&self) {
        self.shared.events.post(EventFlags::DISCONNECTED);
    }

    /// Pairing button: request a coordinator or open our own window
    pub fn press_pairing_button(&self) -> Result<()> {
        if self.state() != LifecycleState::Running {
            return Err(Error::invalid_state(format!("cannot pair while {}", self.state())));
        }

        match &self.shared.pairing {
            PairingSide::None => Err(Error::invalid_state("pairing is not configured")),
            PairingSide::Coordinator(coordinator) => {
                coordinator.start(self.shared.config.pairing_window);
                Ok(())
            }
            PairingSide::Requester { busy, .. } => {
                if busy.swap(true, Ordering::AcqRel) {
                    return Err(Error::already_in_progress("pairing request already running"));
                }
                let shared = Arc::clone(&self.shared);
                tokio::spawn(async move { run_pairing_request(shared).await });
                Ok(())
            }
        }
    }

    /// Closes the coordinator window early
    pub fn stop_pairing(&self) -> Result<()> {
        match &self.shared.pairing {
            PairingSide::Coordinator(coordinator) => {
                coordinator.stop();
                Ok(())
            }
            _ => Err(Error::invalid_state("not a pairing coordinator")),
        }
    }

    pub fn is_pairing_window_open(&self) -> bool {
        matches!(&self.shared.pairing, PairingSide::Coordinator(c) if c.is_active())
    }

    pub fn endpoint_addr(&self) -> Option<SocketAddr> {
        self.shared.endpoint.addr()
    }

    pub fn server_addr(&self) -> Option<SocketAddr> {
        self.shared.server.local_addr()
    }

    pub fn discovery(&self) -> &Arc<DiscoveryClient> {
        &self.shared.discovery
    }

    /// Client for entities behind the bound endpoint
    pub fn control(&self) -> ControlClient {
        ControlClient::new(Arc::clone(&self.shared.endpoint))
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stops the lifecycle loop and everything it started
    pub fn shutdown(&self) {
        self.task.abort();
        self.shared.discovery.stop_heartbeat();
        if let PairingSide::Coordinator(coordinator) = &self.shared.pairing {
            coordinator.stop();
        }
        self.shared.server.stop();
        self.shared.endpoint.cancel();
        info!("Node {} shut down", self.shared.device.id);
    }

    /// Address a coordinator hands out, when this node is one
    pub fn advertised_addr(&self) -> Option<IpAddr> {
        match &self.shared.pairing {
            PairingSide::Coordinator(coordinator) => Some(coordinator.advertise()),
            _ => None,
        }
    }
}

/// Requester side of a button press
///
/// The requester only reports a successful bind, so an unanswered round
/// ends the pairing state here.
async fn run_pairing_request(shared: Arc<Shared>) {
    let PairingSide::Requester { requester, device_type, busy } = &shared.pairing else {
        return;
    };

    match requester
        .request_pairing(*device_type, shared.config.pairing_request_timeout)
        .await
    {
        Ok(Some(_)) => {}
        Ok(None) => shared.events.post(EventFlags::PAIRING_ENDED),
        Err(e) => {
            warn!("Pairing request failed: {}", e);
            shared.events.post(EventFlags::PAIRING_ENDED);
        }
    }
    busy.store(false, Ordering::Release);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Entity, EntityType};
    use crate::lifecycle::RecordingIndicator;
    use crate::resource::MemorySwitch;
    use crate::settings::{MemorySettings, KEY_IPV4};

    fn config() -> Config {
        Config {
            devices: vec![DeviceDescriptor::new("dev-1").with_entity(Entity::new("sw0", EntityType::SWITCH, 0))],
            discovery_enabled: false,
            server_addr: "127.0.0.1:0".parse().unwrap(),
            server_join_multicast: false,
            multicast_group: "127.0.0.1:9".parse().unwrap(),
            ..Config::default()
        }
    }

    #[test]
    fn test_requires_device() {
        let config = Config {
            devices: Vec::new(),
            ..config()
        };
        let err = Node::new(config, Arc::new(MemorySettings::new()), Arc::new(RecordingIndicator::new())).err();
        assert!(matches!(err, Some(Error::Config(_))));
    }

    #[test]
    fn test_attach_unknown_entity() {
        let node = Node::new(config(), Arc::new(MemorySettings::new()), Arc::new(RecordingIndicator::new())).unwrap();
        node.attach_switch("sw0", Arc::new(MemorySwitch::default())).unwrap();
        assert!(node.attach_switch("sw9", Arc::new(MemorySwitch::default())).is_err());
        assert!(node.table().contains("sw0/state"));
    }

    #[tokio::test]
    async fn test_restores_and_runs_without_discovery() {
        let store = Arc::new(MemorySettings::new());
        store.save(KEY_IPV4, b"10.9.8.7\0").unwrap();
        let indicator = Arc::new(RecordingIndicator::new());

        let node = Node::new(config(), store, indicator.clone()).unwrap();
        let handle = node.start();
        handle.wait_for_state(LifecycleState::Disconnected, Duration::from_secs(1)).await.unwrap();
        assert_eq!(handle.endpoint_addr(), Some("10.9.8.7:5683".parse().unwrap()));
        assert!(handle.press_pairing_button().is_err());

        handle.network_connected();
        handle.wait_for_state(LifecycleState::Running, Duration::from_secs(1)).await.unwrap();
        assert!(handle.server_addr().is_some());
        assert_eq!(indicator.current(), Some(StatusPattern::Solid));

        handle.network_disconnected();
        handle.wait_for_state(LifecycleState::Disconnected, Duration::from_secs(1)).await.unwrap();
        assert!(handle.server_addr().is_none());
        assert_eq!(indicator.current(), Some(StatusPattern::SLOW_BLINK));

        handle.shutdown();
    }

    #[tokio::test]
    async fn test_wait_for_state_reports_timeout_and_termination() {
        let node = Node::new(config(), Arc::new(MemorySettings::new()), Arc::new(RecordingIndicator::new())).unwrap();
        let handle = node.start();
        handle.wait_for_state(LifecycleState::Disconnected, Duration::from_secs(1)).await.unwrap();

        let err = handle.wait_for_state(LifecycleState::Running, Duration::from_millis(50)).await;
        assert!(matches!(err, Err(Error::Timeout(_))));

        handle.shutdown();
        let err = handle.wait_for_state(LifecycleState::Running, Duration::from_secs(1)).await;
        assert!(matches!(err, Err(Error::InvalidState(_))));
    }
}
