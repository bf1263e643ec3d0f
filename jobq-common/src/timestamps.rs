//! Serde helpers for wire-format timestamps.
//!
//! Columns are stored as `timestamptz` but every timestamp crossing the HTTP
//! boundary is an epoch-millisecond UTC integer, so responses do not depend on
//! any driver-specific datetime rendering.

/// Serialize a `DateTime<Utc>` as epoch milliseconds. Use with
/// `#[serde(with = "timestamps::epoch_ms")]`.
pub mod epoch_ms {
    use chrono::{DateTime, TimeZone, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_i64(value.timestamp_millis())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = i64::deserialize(deserializer)?;
        Utc.timestamp_millis_opt(millis)
            .single()
            .ok_or_else(|| serde::de::Error::custom("epoch milliseconds out of range"))
    }
}

/// Same as [`epoch_ms`] but for nullable columns.
pub mod epoch_ms_opt {
    use chrono::{DateTime, TimeZone, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(value) => serializer.serialize_some(&value.timestamp_millis()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Option::<i64>::deserialize(deserializer)? {
            Some(millis) => Utc
                .timestamp_millis_opt(millis)
                .single()
                .map(Some)
                .ok_or_else(|| serde::de::Error::custom("epoch milliseconds out of range")),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize)]
    struct Wire {
        #[serde(with = "super::epoch_ms")]
        at: chrono::DateTime<Utc>,
        #[serde(with = "super::epoch_ms_opt")]
        maybe_at: Option<chrono::DateTime<Utc>>,
    }

    #[test]
    fn test_round_trips_epoch_millis() {
        let wire = Wire {
            at: Utc.timestamp_millis_opt(1_700_000_000_123).unwrap(),
            maybe_at: None,
        };

        let encoded = serde_json::to_string(&wire).unwrap();
        assert_eq!(encoded, r#"{"at":1700000000123,"maybe_at":null}"#);

        let decoded: Wire = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.at, wire.at);
        assert_eq!(decoded.maybe_at, None);
    }

    #[test]
    fn test_subsecond_precision_is_millisecond() {
        let wire = Wire {
            at: Utc.timestamp_millis_opt(42).unwrap(),
            maybe_at: Some(Utc.timestamp_millis_opt(-1).unwrap()),
        };

        let encoded = serde_json::to_string(&wire).unwrap();
        assert_eq!(encoded, r#"{"at":42,"maybe_at":-1}"#);
    }
}
