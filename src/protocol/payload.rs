//! JSON documents exchanged over the resource paths

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::core::{Error, Result};

/// Registration accepted
pub const STATUS_REGISTERED: &str = "registered";
/// Heartbeat accepted
pub const STATUS_HEARTBEAT_RECEIVED: &str = "heartbeat_received";
/// Heartbeat from a device the server does not know
pub const STATUS_UNKNOWN_DEVICE: &str = "unknown_device";

/// Reply of `discovery/version`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionDocument {
    pub major: u32,
    pub minor: u32,
}

/// Reply of `discovery/register`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat_interval: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat_endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub device_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub status: String,
}

/// Broadcast by a requester on `pairing/0`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairingRequest {
    pub device_type: u32,
}

/// Coordinator reply carrying its reachable address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairingDone {
    pub ip: String,
}

/// On/off document shared by switches and lights
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateDocument {
    pub state: u32,
}

impl StateDocument {
    pub fn new(on: bool) -> Self {
        StateDocument { state: u32::from(on) }
    }

    /// Only 0 and 1 are valid states
    pub fn is_on(&self) -> Result<bool> {
        match self.state {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(Error::invalid_argument(format!("unsupported state {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrightnessDocument {
    pub brightness: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemperatureDocument {
    pub temperature: u8,
}

/// Packed `0xRRGGBB` color
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColorDocument {
    #[serde(serialize_with = "crate::core::serde::serialize_rgb")]
    #[serde(deserialize_with = "crate::core::serde::deserialize_rgb")]
    pub color: u32,
}

/// Parses a document, tolerating trailing NUL terminators
pub fn decode<T: DeserializeOwned>(payload: &[u8]) -> Result<T> {
    let end = payload
        .iter()
        .rposition(|b| *b != 0)
        .map_or(0, |i| i + 1);
    Ok(serde_json::from_slice(&payload[..end])?)
}

pub fn encode<T: Serialize>(document: &T) -> Result<Bytes> {
    Ok(Bytes::from(serde_json::to_vec(document)?))
}

/// CoRE link-format entry for a path
pub fn core_link(path: &str) -> String {
    format!("</{}>", path.trim_start_matches('/'))
}

/// Whether a link-format listing advertises `path`
pub fn links_contain(listing: &[u8], path: &str) -> bool {
    let needle = core_link(path);
    listing
        .windows(needle.len())
        .any(|w| w == needle.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Error;

    #[test]
    fn test_decode_tolerates_nul() {
        let doc: PairingRequest = decode(b"{\"device_type\":1}\0").unwrap();
        assert_eq!(doc.device_type, 1);
    }

    #[test]
    fn test_decode_malformed() {
        let err = decode::<VersionDocument>(b"{\"major\":").unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
        assert!(decode::<PairingDone>(b"").is_err());
    }

    #[test]
    fn test_register_response_optional_fields() {
        let doc: RegisterResponse = decode(br#"{"status":"registered"}"#).unwrap();
        assert_eq!(doc.status, STATUS_REGISTERED);
        assert!(doc.device_id.is_none());

        let text = encode(&doc).unwrap();
        assert_eq!(&text[..], br#"{"status":"registered"}"#);
    }

    #[test]
    fn test_state_document() {
        assert!(decode::<StateDocument>(br#"{"state":1}"#).unwrap().is_on().unwrap());
        assert!(!decode::<StateDocument>(br#"{"state":0}"#).unwrap().is_on().unwrap());
        assert!(matches!(
            decode::<StateDocument>(br#"{"state":2}"#).unwrap().is_on(),
            Err(Error::InvalidArgument(_))
        ));
        assert_eq!(&encode(&StateDocument::new(false)).unwrap()[..], br#"{"state":0}"#);
    }

    #[test]
    fn test_link_listing() {
        let listing = b"</discovery/register>,</discovery/version>";
        assert!(links_contain(listing, "discovery/register"));
        assert!(links_contain(listing, "/discovery/version"));
        assert!(!links_contain(b"</other>", "discovery/register"));
        assert!(!links_contain(b"", "discovery/register"));
    }
}
