use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::core::{Result, DEFAULT_PORT, PAIRING_PATH};
use crate::lifecycle::{EventFlags, EventSignal};
use crate::network::{ClientEndpoint, MulticastEngine};
use crate::protocol::payload::{self, PairingDone, PairingRequest};
use crate::protocol::Method;
use crate::util::Wait;

/// Broadcasts our device type and binds to the coordinator that answers
pub struct PairingRequester {
    endpoint: Arc<ClientEndpoint>,
    multicast: Arc<MulticastEngine>,
    events: Arc<EventSignal>,
}

impl PairingRequester {
    pub fn new(endpoint: Arc<ClientEndpoint>, multicast: Arc<MulticastEngine>, events: Arc<EventSignal>) -> Self {
        PairingRequester {
            endpoint,
            multicast,
            events,
        }
    }

    /// Runs one pairing round
    ///
    /// Returns the coordinator address the endpoint was bound to, or `None`
    /// when nobody answered within `timeout`. Only a successful bind posts
    /// the pairing-ended event.
    pub async fn request_pairing(&self, device_type: u32, timeout: Duration) -> Result<Option<SocketAddr>> {
        info!("Requesting a pairing: {:#x}", device_type);
        let body = payload::encode(&PairingRequest { device_type })?;
        self.events.post(EventFlags::PAIRING_REQUESTED);

        let mut bound: Option<SocketAddr> = None;
        self.multicast
            .send_and_collect(Method::Put, PAIRING_PATH, &body, Wait::from(timeout), |message, from| {
                if message.payload.is_empty() {
                    debug!("Coordinator {} ignored the pairing request", from);
                    return;
                }
                if bound.is_some() {
                    debug!("Already paired, ignoring answer from {}", from);
                    return;
                }
                match coordinator_addr(&message.payload) {
                    Ok(addr) => {
                        info!("Pairing accepted: {}", addr);
                        self.endpoint.set_addr(addr);
                        self.events.post(EventFlags::PAIRING_ENDED);
                        bound = Some(addr);
                    }
                    Err(e) => warn!("Bad pairing answer from {}: {}", from, e),
                }
            })
            .await?;

        if bound.is_none() {
            warn!("No coordinator answered the pairing request");
        }
        Ok(bound)
    }
}

fn coordinator_addr(body: &[u8]) -> Result<SocketAddr> {
    let done: PairingDone = payload::decode(body)?;
    let ip: IpAddr = done
        .ip
        .parse()
        .map_err(|e| crate::core::Error::protocol(format!("invalid coordinator address {:?}: {}", done.ip, e)))?;
    Ok(SocketAddr::new(ip, DEFAULT_PORT))
}
