//! Construction-time configuration.
//!
//! Options are plain `serde` structs with builder-style setters so hosts can
//! either assemble them in code or deserialize them from their own
//! configuration files. Durations are expressed in milliseconds on the wire.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Backoff between save attempts that hit a lock held by another
/// transaction.
pub const DEFAULT_RETRY_DURATIONS_MS: [u64; 5] = [5, 10, 100, 385, 500];

#[must_use]
pub fn default_retry_durations() -> Vec<Duration> {
    DEFAULT_RETRY_DURATIONS_MS
        .iter()
        .copied()
        .map(Duration::from_millis)
        .collect()
}

/// Store-wide settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Sleeps between save retries; one more attempt follows the last one.
    #[serde(with = "millis_list")]
    pub save_retry_durations: Vec<Duration>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            save_retry_durations: default_retry_durations(),
        }
    }
}

impl StoreConfig {
    #[must_use]
    pub fn with_save_retry_durations(mut self, durations: Vec<Duration>) -> Self {
        self.save_retry_durations = durations;
        self
    }
}

pub(crate) mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

pub(crate) mod millis_list {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer, ser::SerializeSeq};

    pub fn serialize<S: Serializer>(values: &[Duration], serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(values.len()))?;
        for value in values {
            seq.serialize_element(&u64::try_from(value.as_millis()).unwrap_or(u64::MAX))?;
        }
        seq.end()
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<Duration>, D::Error> {
        Vec::<u64>::deserialize(deserializer)
            .map(|values| values.into_iter().map(Duration::from_millis).collect())
    }
}
