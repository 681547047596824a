use std::sync::Arc;
use std::time::Duration;

use homelink::core::{Entity, EntityType};
use homelink::lifecycle::LogIndicator;
use homelink::resource::{MemoryLight, MemorySwitch};
use homelink::settings::MemorySettings;
use homelink::{Config, DeviceDescriptor, LifecycleState, Node, PairingRole};

#[tokio::main]
async fn main() -> homelink::Result<()> {
    tracing_subscriber::fmt::init();

    // Load a config file when given one, otherwise run a demo device
    let config = match std::env::args().nth(1) {
        Some(path) => Config::from_file(path)?,
        None => Config {
            devices: vec![DeviceDescriptor::new("demo-lamp")
                .with_manufacturer("homelink")
                .with_versions("0.1.0", "sim")
                .with_heartbeat_interval(30)
                .with_entity(Entity::new("light0", EntityType::LIGHT, 0))
                .with_entity(Entity::new("sw0", EntityType::SWITCH, 0))],
            pairing: PairingRole::Requester {
                device_type: EntityType::LIGHT.0,
            },
            ..Config::default()
        },
    };

    println!("Starting homelink device:");
    println!("- Device: {}", config.active_device()?.id);
    println!("- Discovery: {}", if config.discovery_enabled { "enabled" } else { "disabled" });
    println!("- Multicast group: {}", config.multicast_group);
    println!("- Server address: {}", config.server_addr);

    let node = Node::new(config, Arc::new(MemorySettings::new()), Arc::new(LogIndicator))?;
    for entity in node.device().entities.clone() {
        if entity.kind == EntityType::LIGHT {
            node.attach_light(&entity.id, Arc::new(MemoryLight::default()))?;
        } else if entity.kind == EntityType::SWITCH {
            node.attach_switch(&entity.id, Arc::new(MemorySwitch::default()))?;
        }
    }

    let handle = node.start();
    handle.wait_for_state(LifecycleState::Disconnected, Duration::from_secs(1)).await?;

    // No link monitor here, so the network is simply up
    handle.network_connected();

    let mut states = handle.subscribe();
    loop {
        tokio::select! {
            changed = states.changed() => {
                if changed.is_err() {
                    println!("Lifecycle stopped");
                    break;
                }
                println!("State: {}", *states.borrow());
            }
            _ = tokio::signal::ctrl_c() => {
                println!("\nShutting down");
                break;
            }
        }
    }

    handle.shutdown();
    Ok(())
}
