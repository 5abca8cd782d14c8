//! Strike events and inbound payload parsing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Epoch values above this magnitude are nanoseconds, not milliseconds.
///
/// 1e13 ms is in the year 2286, so no genuine millisecond timestamp
/// reaches it.
pub const NANOSECOND_THRESHOLD: i64 = 10_000_000_000_000;

const NANOS_PER_MILLI: i64 = 1_000_000;

#[derive(Debug, Error)]
pub enum StrikeParseError {
    #[error("Invalid JSON payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(String),

    #[error("Invalid coordinate: lat={lat}, lon={lon}")]
    InvalidCoordinate { lat: f64, lon: f64 },
}

/// Wire shape of a strike message.
#[derive(Debug, Deserialize)]
struct StrikePayload {
    lat: Option<f64>,
    lon: Option<f64>,
    time: Option<serde_json::Number>,
    pol: Option<i64>,
    mcs: Option<f64>,
    stat: Option<u32>,
}

/// A single detected lightning strike.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StrikeEvent {
    pub timestamp: DateTime<Utc>,
    pub latitude: f64,
    pub longitude: f64,
    pub polarity: i32,
    pub amplitude: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub station_count: Option<u32>,
    /// Timestamp exactly as received, before normalization.
    #[serde(skip)]
    pub source_time: i64,
}

impl StrikeEvent {
    pub fn time_ms(&self) -> i64 {
        self.timestamp.timestamp_millis()
    }

    /// Deduplication key for retransmitted strikes.
    pub fn key(&self) -> StrikeKey {
        StrikeKey {
            source_time: self.source_time,
            lat_bits: self.latitude.to_bits(),
            lon_bits: self.longitude.to_bits(),
        }
    }
}

/// Composite of source timestamp and coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StrikeKey {
    source_time: i64,
    lat_bits: u64,
    lon_bits: u64,
}

/// A strike together with its distance from a query center.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NearbyStrike {
    #[serde(flatten)]
    pub strike: StrikeEvent,
    pub distance_km: f64,
}

/// Convert a raw epoch value to milliseconds.
///
/// Values whose magnitude exceeds [`NANOSECOND_THRESHOLD`] are divided down
/// from nanoseconds; anything else is already milliseconds.
pub fn normalize_timestamp_ms(raw: i64) -> i64 {
    if raw.unsigned_abs() > NANOSECOND_THRESHOLD as u64 {
        raw / NANOS_PER_MILLI
    } else {
        raw
    }
}

/// Parse and validate a JSON strike message.
pub fn parse_strike(payload: &[u8]) -> Result<StrikeEvent, StrikeParseError> {
    let raw: StrikePayload = serde_json::from_slice(payload)?;

    let lat = raw.lat.ok_or(StrikeParseError::MissingField("lat"))?;
    let lon = raw.lon.ok_or(StrikeParseError::MissingField("lon"))?;
    let time = raw.time.ok_or(StrikeParseError::MissingField("time"))?;

    if !lat.is_finite() || !lon.is_finite() || lat.abs() > 90.0 || lon.abs() > 180.0 {
        return Err(StrikeParseError::InvalidCoordinate { lat, lon });
    }

    let source_time = time
        .as_i64()
        .or_else(|| {
            time.as_f64()
                .filter(|t| t.is_finite() && t.abs() < i64::MAX as f64)
                .map(|t| t as i64)
        })
        .ok_or_else(|| StrikeParseError::InvalidTimestamp(time.to_string()))?;

    let millis = normalize_timestamp_ms(source_time);
    let timestamp = DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| StrikeParseError::InvalidTimestamp(source_time.to_string()))?;

    Ok(StrikeEvent {
        timestamp,
        latitude: lat,
        longitude: lon,
        polarity: raw.pol.unwrap_or(0).clamp(i32::MIN as i64, i32::MAX as i64) as i32,
        amplitude: raw.mcs.filter(|a| a.is_finite()).unwrap_or(0.0),
        station_count: raw.stat,
        source_time,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_nanosecond_epoch() {
        assert_eq!(normalize_timestamp_ms(1762715394083570200), 1762715394083);
    }

    #[test]
    fn keeps_millisecond_epoch() {
        assert_eq!(normalize_timestamp_ms(1731178800000), 1731178800000);
    }

    #[test]
    fn parses_full_payload() {
        let payload = br#"{"time":1762715394083570200,"lat":40.71,"lon":-74.0,"alt":0,"pol":-1,"mcs":24.5,"stat":12}"#;
        let strike = parse_strike(payload).unwrap();
        assert_eq!(strike.time_ms(), 1762715394083);
        assert_eq!(strike.source_time, 1762715394083570200);
        assert_eq!(strike.latitude, 40.71);
        assert_eq!(strike.longitude, -74.0);
        assert_eq!(strike.polarity, -1);
        assert_eq!(strike.amplitude, 24.5);
        assert_eq!(strike.station_count, Some(12));
    }

    #[test]
    fn optional_fields_default() {
        let strike = parse_strike(br#"{"time":1731178800000,"lat":1.0,"lon":2.0}"#).unwrap();
        assert_eq!(strike.polarity, 0);
        assert_eq!(strike.amplitude, 0.0);
        assert!(strike.station_count.is_none());
    }

    #[test]
    fn rejects_missing_required_fields() {
        let cases: [(&[u8], &str); 3] = [
            (br#"{"lon":2.0,"time":1731178800000}"#, "lat"),
            (br#"{"lat":1.0,"time":1731178800000}"#, "lon"),
            (br#"{"lat":1.0,"lon":2.0}"#, "time"),
        ];
        for (payload, field) in cases {
            match parse_strike(payload) {
                Err(StrikeParseError::MissingField(f)) => assert_eq!(f, field),
                other => panic!("expected missing {field}, got {other:?}"),
            }
        }
    }

    #[test]
    fn rejects_garbage_and_bad_values() {
        assert!(matches!(parse_strike(b"not json"), Err(StrikeParseError::Json(_))));
        assert!(matches!(
            parse_strike(br#"{"lat":95.0,"lon":2.0,"time":1731178800000}"#),
            Err(StrikeParseError::InvalidCoordinate { .. })
        ));
        assert!(matches!(
            parse_strike(br#"{"lat":1.0,"lon":2.0,"time":1e300}"#),
            Err(StrikeParseError::InvalidTimestamp(_))
        ));
    }

    #[test]
    fn retransmission_shares_key() {
        let payload = br#"{"time":1762715394083570200,"lat":40.71,"lon":-74.0}"#;
        let a = parse_strike(payload).unwrap();
        let b = parse_strike(payload).unwrap();
        assert_eq!(a.key(), b.key());

        let c = parse_strike(br#"{"time":1762715394083570201,"lat":40.71,"lon":-74.0}"#).unwrap();
        assert_ne!(a.key(), c.key());
    }
}
