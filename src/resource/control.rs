//! Switch and light control endpoints
//!
//! Every entity exposes `{entity_id}/{attribute}` paths carrying one small
//! JSON document each. The hardware side sits behind the driver traits.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, error, warn};

use crate::core::{Error, Result};
use crate::network::ClientEndpoint;
use crate::protocol::payload::{
    self, BrightnessDocument, ColorDocument, StateDocument, TemperatureDocument,
};
use crate::protocol::Code;
use super::table::{Reply, Request, Resource, ResourceTable};

pub trait SwitchDriver: Send + Sync {
    fn set_state(&self, on: bool) -> Result<()>;
    fn state(&self) -> bool;
}

pub trait LightDriver: Send + Sync {
    fn set_state(&self, on: bool) -> Result<()>;
    fn state(&self) -> bool;
    fn set_brightness(&self, brightness: u8) -> Result<()>;
    fn brightness(&self) -> u8;
    fn set_temperature(&self, temperature: u8) -> Result<()>;
    fn temperature(&self) -> u8;
    /// Packed `0xRRGGBB`
    fn set_color(&self, color: u32) -> Result<()>;
    fn color(&self) -> u32;
}

/// Switch that only remembers its state
#[derive(Default)]
pub struct MemorySwitch {
    on: AtomicBool,
}

impl SwitchDriver for MemorySwitch {
    fn set_state(&self, on: bool) -> Result<()> {
        self.on.store(on, Ordering::SeqCst);
        Ok(())
    }

    fn state(&self) -> bool {
        self.on.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LightState {
    pub on: bool,
    pub brightness: u8,
    pub temperature: u8,
    pub color: u32,
}

impl Default for LightState {
    fn default() -> Self {
        LightState {
            on: false,
            brightness: 255,
            temperature: 0,
            color: 0xFFFFFF,
        }
    }
}

/// Light that only remembers its state
#[derive(Default)]
pub struct MemoryLight {
    state: Mutex<LightState>,
}

impl MemoryLight {
    pub fn snapshot(&self) -> LightState {
        *self.state.lock()
    }
}

impl LightDriver for MemoryLight {
    fn set_state(&self, on: bool) -> Result<()> {
        self.state.lock().on = on;
        Ok(())
    }

    fn state(&self) -> bool {
        self.state.lock().on
    }

    fn set_brightness(&self, brightness: u8) -> Result<()> {
        self.state.lock().brightness = brightness;
        Ok(())
    }

    fn brightness(&self) -> u8 {
        self.state.lock().brightness
    }

    fn set_temperature(&self, temperature: u8) -> Result<()> {
        self.state.lock().temperature = temperature;
        Ok(())
    }

    fn temperature(&self) -> u8 {
        self.state.lock().temperature
    }

    fn set_color(&self, color: u32) -> Result<()> {
        self.state.lock().color = color & 0xFF_FFFF;
        Ok(())
    }

    fn color(&self) -> u32 {
        self.state.lock().color
    }
}

/// Controllable attribute of a light
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LightAttribute {
    State,
    Brightness,
    Temperature,
    Color,
}

impl LightAttribute {
    pub const ALL: [LightAttribute; 4] = [
        LightAttribute::State,
        LightAttribute::Brightness,
        LightAttribute::Temperature,
        LightAttribute::Color,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            LightAttribute::State => "state",
            LightAttribute::Brightness => "brightness",
            LightAttribute::Temperature => "temperature",
            LightAttribute::Color => "color",
        }
    }
}

pub fn control_path(entity_id: &str, attribute: &str) -> String {
    format!("{}/{}", entity_id, attribute)
}

fn apply<T: DeserializeOwned>(request: &Request<'_>, set: impl FnOnce(T) -> Result<()>) -> Reply {
    let document = match payload::decode::<T>(request.payload) {
        Ok(document) => document,
        Err(e) => {
            warn!("Bad control document for {}: {}", request.path, e);
            return Reply::status(Code::BAD_REQUEST);
        }
    };
    match set(document) {
        Ok(()) => Reply::changed(),
        Err(Error::InvalidArgument(msg)) => {
            warn!("Rejected {} document: {}", request.path, msg);
            Reply::status(Code::BAD_REQUEST)
        }
        Err(e) => {
            error!("Failed to apply {}: {}", request.path, e);
            Reply::status(Code::INTERNAL_SERVER_ERROR)
        }
    }
}

struct SwitchStateResource {
    driver: Arc<dyn SwitchDriver>,
}

impl Resource for SwitchStateResource {
    fn get(&self, _request: &Request<'_>) -> Reply {
        Reply::json(&StateDocument::new(self.driver.state()))
    }

    fn put(&self, request: &Request<'_>) -> Reply {
        apply(request, |doc: StateDocument| self.driver.set_state(doc.is_on()?))
    }
}

struct LightResource {
    driver: Arc<dyn LightDriver>,
    attribute: LightAttribute,
}

impl Resource for LightResource {
    fn get(&self, _request: &Request<'_>) -> Reply {
        let driver = &self.driver;
        match self.attribute {
            LightAttribute::State => Reply::json(&StateDocument::new(driver.state())),
            LightAttribute::Brightness => Reply::json(&BrightnessDocument { brightness: driver.brightness() }),
            LightAttribute::Temperature => Reply::json(&TemperatureDocument { temperature: driver.temperature() }),
            LightAttribute::Color => Reply::json(&ColorDocument { color: driver.color() }),
        }
    }

    fn put(&self, request: &Request<'_>) -> Reply {
        let driver = &self.driver;
        match self.attribute {
            LightAttribute::State => apply(request, |doc: StateDocument| driver.set_state(doc.is_on()?)),
            LightAttribute::Brightness => apply(request, |doc: BrightnessDocument| driver.set_brightness(doc.brightness)),
            LightAttribute::Temperature => {
                apply(request, |doc: TemperatureDocument| driver.set_temperature(doc.temperature))
            }
            LightAttribute::Color => apply(request, |doc: ColorDocument| driver.set_color(doc.color)),
        }
    }
}

/// Serves `{entity_id}/state` for a switch
pub fn register_switch(table: &ResourceTable, entity_id: &str, driver: Arc<dyn SwitchDriver>) -> Result<()> {
    table.register(
        &control_path(entity_id, "state"),
        Arc::new(SwitchStateResource { driver }),
    )
}

/// Serves every light attribute under `{entity_id}/`
pub fn register_light(table: &ResourceTable, entity_id: &str, driver: Arc<dyn LightDriver>) -> Result<()> {
    for attribute in LightAttribute::ALL {
        table.register(
            &control_path(entity_id, attribute.name()),
            Arc::new(LightResource {
                driver: Arc::clone(&driver),
                attribute,
            }),
        )?;
    }
    Ok(())
}

/// Drives a remote entity over the device's bound endpoint
pub struct ControlClient {
    endpoint: Arc<ClientEndpoint>,
}

impl ControlClient {
    pub fn new(endpoint: Arc<ClientEndpoint>) -> Self {
        ControlClient { endpoint }
    }

    async fn put<T: Serialize>(&self, entity_id: &str, attribute: &str, document: &T) -> Result<()> {
        let path = control_path(entity_id, attribute);
        let body: Bytes = payload::encode(document)?;
        debug!("Setting {} to {}", path, String::from_utf8_lossy(&body));
        self.endpoint.put(&path, body).await?.into_content()?;
        Ok(())
    }

    async fn get<T: DeserializeOwned>(&self, entity_id: &str, attribute: &str) -> Result<T> {
        let path = control_path(entity_id, attribute);
        let body = self.endpoint.get(&path).await?.into_content()?;
        payload::decode(&body)
    }

    pub async fn set_state(&self, entity_id: &str, on: bool) -> Result<()> {
        self.put(entity_id, "state", &StateDocument::new(on)).await
    }

    pub async fn state(&self, entity_id: &str) -> Result<bool> {
        self.get::<StateDocument>(entity_id, "state").await?.is_on()
    }

    pub async fn set_brightness(&self, entity_id: &str, brightness: u8) -> Result<()> {
        self.put(entity_id, "brightness", &BrightnessDocument { brightness }).await
    }

    pub async fn brightness(&self, entity_id: &str) -> Result<u8> {
        Ok(self.get::<BrightnessDocument>(entity_id, "brightness").await?.brightness)
    }

    pub async fn set_temperature(&self, entity_id: &str, temperature: u8) -> Result<()> {
        self.put(entity_id, "temperature", &TemperatureDocument { temperature }).await
    }

    pub async fn set_color(&self, entity_id: &str, color: u32) -> Result<()> {
        if color > 0xFF_FFFF {
            return Err(Error::invalid_argument(format!("color {:#x} exceeds 24 bits", color)));
        }
        self.put(entity_id, "color", &ColorDocument { color }).await
    }

    pub async fn color(&self, entity_id: &str) -> Result<u32> {
        Ok(self.get::<ColorDocument>(entity_id, "color").await?.color)
    }
}
