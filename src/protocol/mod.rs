//! Protocol implementation module
//!
//! This module defines the CoAP message model, its datagram encoding, and the
//! JSON documents carried in payloads.

pub mod codec;
pub mod message;
pub mod payload;

pub use self::codec::{decode_datagram, CoapCodec};
pub use self::message::{Block2, Code, CoapOption, Message, MessageType, Method, Token};
