use std::net::IpAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::core::{EntityType, Result, PAIRING_PATH};
use crate::lifecycle::{EventFlags, EventSignal};
use crate::protocol::payload::{self, PairingDone, PairingRequest};
use crate::resource::{Reply, Request, Resource, ResourceTable};

#[derive(Default)]
struct Window {
    active: bool,
    /// Bumped on every arm so a stale timer cannot close a newer window
    generation: u64,
    timer: Option<JoinHandle<()>>,
}

/// Answers pairing requests with our address while the window is open
pub struct PairingCoordinator {
    filter: u32,
    advertise: IpAddr,
    window: Mutex<Window>,
    events: Arc<EventSignal>,
}

impl PairingCoordinator {
    pub fn new(filter: u32, advertise: IpAddr, events: Arc<EventSignal>) -> Arc<Self> {
        Arc::new(PairingCoordinator {
            filter,
            advertise,
            window: Mutex::new(Window::default()),
            events,
        })
    }

    pub fn filter(&self) -> u32 {
        self.filter
    }

    pub fn advertise(&self) -> IpAddr {
        self.advertise
    }

    pub fn is_active(&self) -> bool {
        self.window.lock().active
    }

    /// Serves `pairing/0` from `table`
    pub fn register_resource(self: &Arc<Self>, table: &ResourceTable) -> Result<()> {
        table.register(PAIRING_PATH, Arc::clone(self) as Arc<dyn Resource>)
    }

    /// Opens the window for `timeout`, re-arming it if already open
    pub fn start(self: &Arc<Self>, timeout: Duration) {
        let coordinator: Weak<Self> = Arc::downgrade(self);
        let mut window = self.window.lock();
        window.generation += 1;
        let generation = window.generation;

        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(coordinator) = coordinator.upgrade() {
                coordinator.expire(generation);
            }
        });
        if let Some(previous) = window.timer.replace(timer) {
            previous.abort();
        }
        window.active = true;
        drop(window);

        info!("Pairing window open for {:?} (filter {:#x})", timeout, self.filter);
        self.events.post(EventFlags::PAIRING_REQUESTED);
    }

    /// Closes the window immediately
    pub fn stop(&self) {
        let mut window = self.window.lock();
        if let Some(timer) = window.timer.take() {
            timer.abort();
        }
        let was_active = std::mem::replace(&mut window.active, false);
        drop(window);

        if was_active {
            info!("Pairing window closed");
            self.events.post(EventFlags::PAIRING_ENDED);
        }
    }

    fn expire(&self, generation: u64) {
        let mut window = self.window.lock();
        if window.generation != generation || !window.active {
            return;
        }
        window.active = false;
        window.timer = None;
        drop(window);

        info!("Pairing window expired");
        self.events.post(EventFlags::PAIRING_ENDED);
    }

    /// Our address for a matching request, `None` to stay silent
    pub fn handle_request(&self, request: &PairingRequest) -> Option<PairingDone> {
        if !self.is_active() {
            debug!("Ignoring pairing request, window closed");
            return None;
        }
        if !EntityType(request.device_type).matches(self.filter) {
            debug!(
                "Ignoring pairing request for type {:#x} (filter {:#x})",
                request.device_type, self.filter
            );
            return None;
        }
        info!("Pairing accepted for device type {:#x}", request.device_type);
        Some(PairingDone {
            ip: self.advertise.to_string(),
        })
    }
}

impl Resource for PairingCoordinator {
    fn get(&self, _request: &Request<'_>) -> Reply {
        Reply::empty()
    }

    fn put(&self, request: &Request<'_>) -> Reply {
        let pairing: PairingRequest = match payload::decode(request.payload) {
            Ok(pairing) => pairing,
            Err(e) => {
                debug!("Malformed pairing request from {}: {}", request.source, e);
                return Reply::empty();
            }
        };
        match self.handle_request(&pairing) {
            Some(done) => Reply::json(&done),
            None => Reply::empty(),
        }
    }
}

impl Drop for PairingCoordinator {
    fn drop(&mut self) {
        if let Some(timer) = self.window.get_mut().timer.take() {
            timer.abort();
        }
    }
}
