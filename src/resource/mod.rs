//! Server-side resources
//!
//! The dispatch table maps request paths to [`Resource`] handlers. Discovery
//! registry, pairing and device-control endpoints all plug into it the same
//! way.

pub mod control;
mod table;

pub use self::control::{
    register_light, register_switch, ControlClient, LightDriver, MemoryLight, MemorySwitch,
    SwitchDriver,
};
pub use self::table::{Reply, Request, Resource, ResourceTable};
