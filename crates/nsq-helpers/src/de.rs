use std::time::Duration;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer};

/// Deserializes an optional duration from either a bare integer (seconds) or
/// a humantime string (`"90s"`, `"15m"`, ...). Used by [`ConsumerSettings`](crate)
/// style YAML configs that mirror what a human would type on the command line.
pub fn deserialize_optional_duration<'de, D>(
    deserializer: D
) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawDuration {
        Seconds(u64),
        Text(String),
    }

    let raw = Option::<RawDuration>::deserialize(deserializer)?;
    match raw {
        None => Ok(None),
        Some(RawDuration::Seconds(secs)) => Ok(Some(Duration::from_secs(secs))),
        Some(RawDuration::Text(value)) => {
            let value = value.trim();
            if value.is_empty() {
                return Ok(None);
            }

            humantime::parse_duration(value).map(Some).map_err(D::Error::custom)
        }
    }
}

/// Deserializes a required duration, defaulting to `Duration::default()`
/// (zero) when the field is absent.
pub fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawDuration {
        Seconds(u64),
        Text(String),
    }

    let raw = Option::<RawDuration>::deserialize(deserializer)?;
    match raw {
        None => Ok(Duration::default()),
        Some(RawDuration::Seconds(secs)) => Ok(Duration::from_secs(secs)),
        Some(RawDuration::Text(value)) => {
            humantime::parse_duration(value.trim()).map_err(D::Error::custom)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(serde::Deserialize)]
    struct Wrapper {
        #[serde(deserialize_with = "deserialize_optional_duration")]
        value: Option<Duration>,
    }

    #[test]
    fn parses_seconds_integer() {
        let w: Wrapper = serde_yaml::from_str("value: 90").unwrap();
        assert_eq!(w.value, Some(Duration::from_secs(90)));
    }

    #[test]
    fn parses_humantime_string() {
        let w: Wrapper = serde_yaml::from_str("value: 15m").unwrap();
        assert_eq!(w.value, Some(Duration::from_secs(900)));
    }

    #[test]
    fn empty_string_is_none() {
        let w: Wrapper = serde_yaml::from_str("value: \"\"").unwrap();
        assert_eq!(w.value, None);
    }
}
