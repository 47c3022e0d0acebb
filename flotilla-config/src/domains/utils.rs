//! Utility functions and helpers for configuration

use serde::{Deserialize, Deserializer, Serializer};
use std::time::Duration;

#[derive(Deserialize)]
#[serde(untagged)]
enum DurationRepr {
    Seconds(u64),
    Text(String),
}

fn parse_duration<E: serde::de::Error>(repr: DurationRepr) -> Result<Duration, E> {
    match repr {
        DurationRepr::Seconds(seconds) => Ok(Duration::from_secs(seconds)),
        DurationRepr::Text(text) => humantime_serde::re::humantime::parse_duration(&text)
            .map_err(|e| E::custom(format!("invalid duration '{}': {}", text, e))),
    }
}

/// Serde helper module for Duration fields.
///
/// Accepts whole seconds (`600`) or a human readable string (`"500ms"`,
/// `"10m"`). Whole seconds are written back as numbers.
pub mod serde_duration {
    use super::*;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_nanos() == 0 {
            serializer.serialize_u64(duration.as_secs())
        } else {
            let text = humantime_serde::re::humantime::format_duration(*duration).to_string();
            serializer.serialize_str(&text)
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        parse_duration(DurationRepr::deserialize(deserializer)?)
    }
}

/// Default functions for serde
pub fn default_true() -> bool {
    true
}

pub fn default_false() -> bool {
    false
}
