//! End-to-end scenarios over loopback
//!
//! The "multicast group" of each node points at a unicast loopback server,
//! which exercises the same request/collect path without needing a
//! multicast-capable interface.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use homelink::core::PoolConfig;
use homelink::discovery::DiscoveryRegistry;
use homelink::lifecycle::{EventSignal, RecordingIndicator, StatusIndicator};
use homelink::network::CoapServer;
use homelink::pairing::PairingCoordinator;
use homelink::resource::{MemoryLight, MemorySwitch, ResourceTable, SwitchDriver};
use homelink::settings::{MemorySettings, SettingsStore, KEY_IPV4};
use homelink::{Config, DeviceDescriptor, Entity, EntityType, LifecycleState, Node, PairingRole, StatusPattern};

const STEP: Duration = Duration::from_secs(5);

fn base_config(device: DeviceDescriptor, group: SocketAddr) -> Config {
    Config {
        devices: vec![device],
        discovery_timeout: Duration::from_millis(300),
        pairing_request_timeout: Duration::from_millis(300),
        server_addr: "127.0.0.1:0".parse().unwrap(),
        server_join_multicast: false,
        multicast_group: group,
        pool: PoolConfig { count: 2, size: 256 },
        ..Config::default()
    }
}

/// A free loopback port, so a server keeps its address across restarts
fn free_port() -> u16 {
    std::net::UdpSocket::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

/// Polls `check` for up to five seconds
async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..50 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    check()
}

#[tokio::test]
async fn test_discovery_registration_and_heartbeat() {
    let table = Arc::new(ResourceTable::new());
    let registry = DiscoveryRegistry::new(1, 2);
    registry.register_resources(&table).unwrap();
    let server = CoapServer::new("127.0.0.1:0".parse().unwrap(), Arc::clone(&table));
    let server_addr = server.start().unwrap();

    let device = DeviceDescriptor::new("lamp-1")
        .with_manufacturer("acme")
        .with_heartbeat_interval(1)
        .with_entity(Entity::new("light0", EntityType::LIGHT, 0));
    let indicator = Arc::new(RecordingIndicator::new());
    let node = Node::new(
        base_config(device, server_addr),
        Arc::new(MemorySettings::new()),
        indicator.clone(),
    )
    .unwrap();
    node.attach_light("light0", Arc::new(MemoryLight::default())).unwrap();

    let handle = node.start();
    handle.wait_for_state(LifecycleState::Disconnected, STEP).await.unwrap();
    handle.network_connected();
    handle.wait_for_state(LifecycleState::Running, STEP).await.unwrap();

    assert_eq!(handle.endpoint_addr(), Some(server_addr));
    assert!(handle.discovery().is_registered());
    let registration = registry.device("lamp-1").unwrap();
    assert_eq!(registration.device.entities.len(), 1);
    assert_eq!(
        indicator.history(),
        vec![StatusPattern::SLOW_BLINK, StatusPattern::FAST_BLINK, StatusPattern::Solid]
    );

    assert!(
        eventually(|| registry.device("lamp-1").map_or(false, |r| r.heartbeats > 0)).await,
        "no heartbeat reached the registry"
    );

    handle.network_disconnected();
    handle.wait_for_state(LifecycleState::Disconnected, STEP).await.unwrap();
    assert!(handle.server_addr().is_none());

    handle.shutdown();
    server.stop();
}

#[tokio::test]
async fn test_discovery_timeout_returns_to_disconnected() {
    // bound but silent
    let silent = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let device = DeviceDescriptor::new("lamp-2");
    let node = Node::new(
        base_config(device, silent.local_addr().unwrap()),
        Arc::new(MemorySettings::new()),
        Arc::new(RecordingIndicator::new()),
    )
    .unwrap();

    let handle = node.start();
    handle.wait_for_state(LifecycleState::Disconnected, STEP).await.unwrap();
    handle.network_connected();
    handle.wait_for_state(LifecycleState::Discovering, STEP).await.unwrap();
    handle.wait_for_state(LifecycleState::Disconnected, STEP).await.unwrap();

    assert!(!handle.discovery().is_server_discovered());
    assert!(handle.endpoint_addr().is_none());
    handle.shutdown();
}

#[tokio::test]
async fn test_pairing_binds_requester_to_coordinator() {
    let coordinator_addr: SocketAddr = ([127, 0, 0, 1], free_port()).into();

    let hub = DeviceDescriptor::new("hub-1").with_entity(Entity::new("light0", EntityType::LIGHT, 0));
    let hub_config = Config {
        discovery_enabled: false,
        server_addr: coordinator_addr,
        pairing: PairingRole::Coordinator {
            filter: EntityType::SWITCH.0,
            advertise: "127.0.0.1".parse().unwrap(),
        },
        pairing_window: Duration::from_secs(30),
        ..base_config(hub, "127.0.0.1:9".parse().unwrap())
    };
    let hub = Node::new(hub_config, Arc::new(MemorySettings::new()), Arc::new(RecordingIndicator::new())).unwrap();
    let hub_light = Arc::new(MemoryLight::default());
    hub.attach_light("light0", hub_light.clone()).unwrap();
    let hub = hub.start();

    let store = Arc::new(MemorySettings::new());
    let remote = DeviceDescriptor::new("remote-1").with_entity(Entity::new("sw0", EntityType::SWITCH, 0));
    let remote_config = Config {
        discovery_enabled: false,
        pairing: PairingRole::Requester {
            device_type: EntityType::SWITCH.0,
        },
        ..base_config(remote, coordinator_addr)
    };
    let remote = Node::new(remote_config, store.clone(), Arc::new(RecordingIndicator::new())).unwrap();
    remote.attach_switch("sw0", Arc::new(MemorySwitch::default())).unwrap();
    let remote = remote.start();

    for handle in [&hub, &remote] {
        handle.wait_for_state(LifecycleState::Disconnected, STEP).await.unwrap();
        handle.network_connected();
        handle.wait_for_state(LifecycleState::Running, STEP).await.unwrap();
    }

    hub.press_pairing_button().unwrap();
    hub.wait_for_state(LifecycleState::Pairing, STEP).await.unwrap();
    assert!(hub.is_pairing_window_open());
    assert_eq!(hub.server_addr(), Some(coordinator_addr));

    remote.press_pairing_button().unwrap();
    // settings are written on the way out of pairing
    assert!(eventually(|| !store.is_empty()).await);
    remote.wait_for_state(LifecycleState::Running, STEP).await.unwrap();

    assert_eq!(remote.endpoint_addr(), Some("127.0.0.1:5683".parse().unwrap()));
    assert_eq!(store.load(KEY_IPV4).unwrap().unwrap(), b"127.0.0.1\0");

    hub.stop_pairing().unwrap();
    hub.wait_for_state(LifecycleState::Running, STEP).await.unwrap();
    assert!(!hub.is_pairing_window_open());

    hub.shutdown();
    remote.shutdown();
}

#[tokio::test]
async fn test_unanswered_pairing_returns_to_running() {
    let silent = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let remote = DeviceDescriptor::new("remote-2");
    let config = Config {
        discovery_enabled: false,
        pairing: PairingRole::Requester { device_type: 1 },
        ..base_config(remote, silent.local_addr().unwrap())
    };
    let store = Arc::new(MemorySettings::new());
    let indicator = Arc::new(RecordingIndicator::new());
    let handle = Node::new(config, store.clone(), indicator.clone())
        .unwrap()
        .start();

    handle.wait_for_state(LifecycleState::Disconnected, STEP).await.unwrap();
    handle.network_connected();
    handle.wait_for_state(LifecycleState::Running, STEP).await.unwrap();

    handle.press_pairing_button().unwrap();
    assert!(handle.press_pairing_button().is_err());
    assert!(
        eventually(|| {
            indicator.history().contains(&StatusPattern::PAIRING_BLINK)
                && indicator.current() == Some(StatusPattern::Solid)
        })
        .await
    );
    assert_eq!(handle.state(), LifecycleState::Running);

    assert!(handle.endpoint_addr().is_none());
    assert!(store.is_empty());
    handle.shutdown();
}

#[tokio::test]
async fn test_device_control_through_server() {
    let table = Arc::new(ResourceTable::new());
    let switch = Arc::new(MemorySwitch::default());
    homelink::resource::register_switch(&table, "sw0", switch.clone()).unwrap();
    let server = CoapServer::new("127.0.0.1:0".parse().unwrap(), table);
    let addr = server.start().unwrap();

    let device = DeviceDescriptor::new("panel-1");
    let config = Config {
        discovery_enabled: false,
        ..base_config(device, "127.0.0.1:9".parse().unwrap())
    };
    let handle = Node::new(config, Arc::new(MemorySettings::new()), Arc::new(RecordingIndicator::new()))
        .unwrap()
        .start();
    handle.discovery().set_server_address(addr);

    let control = handle.control();
    control.set_state("sw0", true).await.unwrap();
    assert!(control.state("sw0").await.unwrap());
    assert!(switch.state());

    handle.shutdown();
    server.stop();
}

/// Indicator that stalls the lifecycle loop while turning solid
struct SlowIndicator;

impl StatusIndicator for SlowIndicator {
    fn apply(&self, pattern: StatusPattern) {
        if pattern == StatusPattern::Solid {
            std::thread::sleep(Duration::from_millis(50));
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_fast_pairing_answer_returns_to_running() {
    let table = Arc::new(ResourceTable::new());
    let coordinator = PairingCoordinator::new(
        EntityType::SWITCH.0,
        "127.0.0.1".parse().unwrap(),
        Arc::new(EventSignal::new()),
    );
    coordinator.register_resource(&table).unwrap();
    coordinator.start(Duration::from_secs(30));
    let server = CoapServer::new("127.0.0.1:0".parse().unwrap(), table);
    let coordinator_addr = server.start().unwrap();

    let remote = DeviceDescriptor::new("remote-3");
    let config = Config {
        discovery_enabled: false,
        pairing: PairingRole::Requester {
            device_type: EntityType::SWITCH.0,
        },
        ..base_config(remote, coordinator_addr)
    };
    let store = Arc::new(MemorySettings::new());
    let handle = Node::new(config, store.clone(), Arc::new(SlowIndicator)).unwrap().start();

    handle.wait_for_state(LifecycleState::Disconnected, STEP).await.unwrap();
    handle.network_connected();
    handle.wait_for_state(LifecycleState::Running, STEP).await.unwrap();

    // the answer can land before the loop has seen the pairing request
    handle.press_pairing_button().unwrap();
    assert!(
        eventually(|| !store.is_empty() && handle.state() == LifecycleState::Running).await,
        "stuck in {} with endpoint {:?}",
        handle.state(),
        handle.endpoint_addr()
    );
    assert_eq!(handle.endpoint_addr(), Some("127.0.0.1:5683".parse().unwrap()));

    handle.shutdown();
    server.stop();
}
