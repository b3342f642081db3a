//! Serde support for humantime duration strings in configuration
//!
//! Lets config fields be written as `"5s"`, `"200ms"`, `"4h"` while the
//! structs carry `std::time::Duration`.

use serde::{Deserialize, Deserializer, Serializer};
use std::time::Duration;

pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&humantime::format_duration(*duration).to_string())
}

pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize)]
    struct Wrapper {
        #[serde(with = "super")]
        value: Duration,
    }

    #[test]
    fn parses_humantime_strings() {
        let w: Wrapper = serde_yaml::from_str("value: 200ms").unwrap();
        assert_eq!(w.value, Duration::from_millis(200));
        let w: Wrapper = serde_yaml::from_str("value: 4h").unwrap();
        assert_eq!(w.value, Duration::from_secs(4 * 3600));
    }

    #[test]
    fn rejects_garbage() {
        assert!(serde_yaml::from_str::<Wrapper>("value: soon").is_err());
    }
}
