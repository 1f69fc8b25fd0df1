//! Serde helpers.

/// (De)serialize a [`crate::Timestamp`] as an RFC3339 instant in UTC.
pub mod rfc3339 {
    use serde::{Deserialize, Deserializer, Serializer};

    use crate::Timestamp;

    pub fn serialize<S: Serializer>(time: &Timestamp, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&crate::rfc3339(*time))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Timestamp, D::Error> {
        let raw = String::deserialize(deserializer)?;
        let parsed =
            chrono::DateTime::parse_from_rfc3339(&raw).map_err(serde::de::Error::custom)?;

        Ok(Timestamp::from_millis(
            parsed.timestamp_millis().max(0) as u128
        ))
    }
}
