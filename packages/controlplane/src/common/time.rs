//! Timestamp helpers.
//!
//! The store keeps int64 Unix milliseconds; the wire uses ISO-8601 UTC with
//! millisecond precision. Everything in between is `chrono::DateTime<Utc>`.

use chrono::{DateTime, Utc};

/// Current time truncated to millisecond precision.
pub fn now() -> DateTime<Utc> {
    from_ms(now_ms())
}

/// Current Unix time in milliseconds.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Rehydrate a store timestamp. Out-of-range values collapse to the epoch.
pub fn from_ms(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

/// Serde adapter: ISO-8601 UTC with exactly millisecond precision.
pub mod rfc3339_millis {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(dt: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&dt.to_rfc3339_opts(SecondsFormat::Millis, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(d)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}

/// Serde adapter for optional timestamps in the same format.
pub mod rfc3339_millis_opt {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(dt: &Option<DateTime<Utc>>, s: S) -> Result<S::Ok, S::Error> {
        match dt {
            Some(dt) => s.serialize_some(&dt.to_rfc3339_opts(SecondsFormat::Millis, true)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        d: D,
    ) -> Result<Option<DateTime<Utc>>, D::Error> {
        let raw = Option::<String>::deserialize(d)?;
        raw.map(|raw| {
            DateTime::parse_from_rfc3339(&raw)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(serde::de::Error::custom)
        })
        .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize)]
    struct Stamped {
        #[serde(with = "rfc3339_millis")]
        at: DateTime<Utc>,
    }

    #[test]
    fn wire_format_has_millisecond_precision() {
        let stamped = Stamped { at: from_ms(1_700_000_000_123) };
        let json = serde_json::to_string(&stamped).unwrap();
        assert_eq!(json, r#"{"at":"2023-11-14T22:13:20.123Z"}"#);
    }

    #[test]
    fn wire_format_round_trips() {
        let stamped = Stamped { at: from_ms(1_700_000_000_123) };
        let json = serde_json::to_string(&stamped).unwrap();
        let back: Stamped = serde_json::from_str(&json).unwrap();
        assert_eq!(back.at, stamped.at);
    }

    #[test]
    fn store_format_round_trips() {
        let ms = now_ms();
        assert_eq!(from_ms(ms).timestamp_millis(), ms);
    }
}
