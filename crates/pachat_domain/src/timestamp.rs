#![forbid(unsafe_code)]

//! Lenient serde for row timestamps.
//!
//! Storage responses carry RFC 3339 strings with an offset; database-change
//! events may carry them without one. Offset-less values are taken as UTC.

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serializer};

/// Parse a backend timestamp.
pub fn parse(s: &str) -> Option<DateTime<Utc>> {
	let s = s.trim();
	if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
		return Some(dt.with_timezone(&Utc));
	}
	// Postgres text output uses a space separator and may use a short `+00` offset.
	if let Ok(dt) = DateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f%#z") {
		return Some(dt.with_timezone(&Utc));
	}
	for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
		if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
			return Some(naive.and_utc());
		}
	}
	None
}

/// Format for query filters and request bodies.
pub fn format(ts: &DateTime<Utc>) -> String {
	ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn serialize<S>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
where
	S: Serializer,
{
	serializer.serialize_str(&format(ts))
}

pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
	D: Deserializer<'de>,
{
	let s = String::deserialize(deserializer)?;
	parse(&s).ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp: {s}")))
}
