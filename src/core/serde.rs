use serde::{Serialize, Deserialize, Serializer, Deserializer};
use std::time::Duration;

/// Serializes Duration as seconds
pub fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    duration.as_secs_f64().serialize(serializer)
}

/// Deserializes Duration from seconds
pub fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let secs = f64::deserialize(deserializer)?;
    if !secs.is_finite() || secs < 0.0 {
        return Err(serde::de::Error::custom(format!("invalid duration: {}", secs)));
    }
    Ok(Duration::from_secs_f64(secs))
}

/// Serializes a 24-bit RGB value, dropping anything above the blue channel
pub fn serialize_rgb<S>(color: &u32, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    (color & 0x00FF_FFFF).serialize(serializer)
}

/// Deserializes a packed RGB value, masking it to 24 bits
pub fn deserialize_rgb<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = u64::deserialize(deserializer)?;
    Ok((raw & 0x00FF_FFFF) as u32)
}
