//! Core domain model for PatrolX incident ingestion.
//!
//! Holds the feed incident shape, the optional weather snapshot, and the merged
//! record persisted into the shared `unified_incidents` table.

use std::collections::BTreeMap;

use chrono::{DateTime, LocalResult, NaiveDateTime, Offset, TimeDelta, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub const CRATE_NAME: &str = "patrolx-core";

/// Source tag written into `unified_incidents.source` for the regional feed.
pub const SOURCE_TAG: &str = "RWECC";
pub const EVENT_TYPE: &str = "Vehicle Crash";
pub const STATUS_ACTIVE: &str = "active";
/// Problem-text marker selecting motor-vehicle-crash incidents.
pub const MVC_MARKER: &str = "MVC";

/// Wall-clock format with a mandatory dot and exactly three fractional digits.
pub const FEED_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S.%3f";
/// Civil zone the feed producer writes its wall-clock timestamps in.
pub const FEED_TIME_ZONE: Tz = chrono_tz::America::New_York;

/// One incident object as delivered by the feed.
///
/// Missing or `null` fields default to empty/zero; fields this model does not
/// name are kept in `extra` so the persisted payload carries the feed object
/// verbatim.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Incident {
    #[serde(deserialize_with = "null_as_default")]
    pub jurisdiction: String,
    #[serde(deserialize_with = "null_as_default")]
    pub problem: String,
    #[serde(deserialize_with = "null_as_default")]
    pub address: String,
    #[serde(deserialize_with = "null_as_default")]
    pub lat: f64,
    #[serde(rename = "long", deserialize_with = "null_as_default")]
    pub lon: f64,
    #[serde(deserialize_with = "null_as_default")]
    pub timestamp: String,
    #[serde(flatten)]
    pub extra: BTreeMap<String, JsonValue>,
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Option::unwrap_or_default)
}

impl Incident {
    pub fn is_mvc(&self) -> bool {
        self.problem.contains(MVC_MARKER)
    }

    /// Source-local identifier: raw timestamp and raw address joined by a space.
    ///
    /// Deliberately not trimmed or normalized; existing rows are keyed on the
    /// exact upstream text.
    pub fn source_local_id(&self) -> String {
        format!("{} {}", self.timestamp, self.address)
    }
}

/// First hourly forecast period for an incident location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WeatherSnapshot {
    pub temperature: i32,
    pub wind_speed: String,
    pub short_forecast: String,
    pub icon: String,
}

/// Weather scalars mirrored into their own columns. Either all present or none.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WeatherColumns {
    pub temperature: i32,
    pub wind_speed: String,
    pub short_forecast: String,
}

impl From<&WeatherSnapshot> for WeatherColumns {
    fn from(snapshot: &WeatherSnapshot) -> Self {
        Self {
            temperature: snapshot.temperature,
            wind_speed: snapshot.wind_speed.clone(),
            short_forecast: snapshot.short_forecast.clone(),
        }
    }
}

/// Semi-structured payload stored in `unified_incidents.details`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncidentDetails {
    pub raw_incident: Incident,
    /// Serialized as `null` when the lookup failed.
    pub weather: Option<WeatherSnapshot>,
}

/// Row written to `unified_incidents`, keyed by `(source, source_id)`.
#[derive(Debug, Clone, PartialEq)]
pub struct UnifiedIncidentRecord {
    pub source: String,
    pub source_id: String,
    pub event_type: String,
    pub address: String,
    pub latitude: f64,
    pub longitude: f64,
    pub timestamp: DateTime<Utc>,
    pub details: IncidentDetails,
    pub jurisdiction: String,
    pub problem_detail: String,
    pub weather: Option<WeatherColumns>,
}

impl UnifiedIncidentRecord {
    /// Merge a raw incident, its normalized instant and the optional weather
    /// snapshot into the persisted shape.
    pub fn merge(
        incident: Incident,
        timestamp: DateTime<Utc>,
        weather: Option<WeatherSnapshot>,
    ) -> Self {
        Self {
            source: SOURCE_TAG.to_string(),
            source_id: incident.source_local_id(),
            event_type: EVENT_TYPE.to_string(),
            address: incident.address.clone(),
            latitude: incident.lat,
            longitude: incident.lon,
            timestamp,
            jurisdiction: incident.jurisdiction.clone(),
            problem_detail: incident.problem.clone(),
            weather: weather.as_ref().map(WeatherColumns::from),
            details: IncidentDetails {
                raw_incident: incident,
                weather,
            },
        }
    }

    /// Every write leaves the row active; there is no expiry path.
    pub fn status(&self) -> &'static str {
        STATUS_ACTIVE
    }

    pub fn details_json(&self) -> serde_json::Result<JsonValue> {
        serde_json::to_value(&self.details)
    }

    pub fn weather_temp(&self) -> Option<i32> {
        self.weather.as_ref().map(|w| w.temperature)
    }

    pub fn weather_wind_speed(&self) -> Option<&str> {
        self.weather.as_ref().map(|w| w.wind_speed.as_str())
    }

    pub fn weather_forecast(&self) -> Option<&str> {
        self.weather.as_ref().map(|w| w.short_forecast.as_str())
    }
}

#[derive(Debug, Error)]
pub enum TimestampError {
    #[error("timestamp {raw:?} is not in YYYY-MM-DD HH:MM:SS.sss form: {source}")]
    Malformed {
        raw: String,
        #[source]
        source: chrono::ParseError,
    },
}

/// Parse a feed timestamp as America/New_York wall-clock time.
///
/// Fall-back hours resolve to the earlier instant. Wall-clock times skipped by
/// a spring-forward change take the offset in force after the change, so
/// `02:30` on the transition day lands on `06:30Z` (`01:30` EST).
pub fn parse_feed_timestamp(raw: &str) -> Result<DateTime<Utc>, TimestampError> {
    let naive = NaiveDateTime::parse_from_str(raw, FEED_TIMESTAMP_FORMAT).map_err(|source| {
        TimestampError::Malformed {
            raw: raw.to_string(),
            source,
        }
    })?;

    let local = match FEED_TIME_ZONE.from_local_datetime(&naive) {
        LocalResult::Single(t) => t,
        LocalResult::Ambiguous(earliest, _) => earliest,
        LocalResult::None => return Ok(resolve_skipped_wall_clock(naive)),
    };
    Ok(local.with_timezone(&Utc))
}

fn resolve_skipped_wall_clock(naive: NaiveDateTime) -> DateTime<Utc> {
    // Reading the wall clock as UTC lands before the change; shifting by that
    // offset lands after it, where the post-change offset applies.
    let before = FEED_TIME_ZONE.offset_from_utc_datetime(&naive).fix();
    let past_change = naive - TimeDelta::seconds(i64::from(before.local_minus_utc()));
    let after = FEED_TIME_ZONE.offset_from_utc_datetime(&past_change).fix();
    Utc.from_utc_datetime(&(naive - TimeDelta::seconds(i64::from(after.local_minus_utc()))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn utc(rfc3339: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(rfc3339)
            .expect("ts")
            .with_timezone(&Utc)
    }

    fn mk_incident() -> Incident {
        Incident {
            jurisdiction: "Wake County".into(),
            problem: "MVC - Injuries".into(),
            address: "100 N Main St".into(),
            lat: 35.7796,
            lon: -78.6382,
            timestamp: "2024-03-01 14:30:00.000".into(),
            extra: BTreeMap::new(),
        }
    }

    fn mk_weather() -> WeatherSnapshot {
        WeatherSnapshot {
            temperature: 54,
            wind_speed: "5 to 10 mph".into(),
            short_forecast: "Light Rain".into(),
            icon: "https://api.weather.gov/icons/land/day/rain?size=small".into(),
        }
    }

    #[test]
    fn winter_timestamp_uses_eastern_standard_offset() {
        let parsed = parse_feed_timestamp("2024-03-01 14:30:00.000").unwrap();
        assert_eq!(parsed, utc("2024-03-01T19:30:00Z"));
    }

    #[test]
    fn summer_timestamp_uses_daylight_offset_and_keeps_millis() {
        let parsed = parse_feed_timestamp("2024-07-04 08:15:30.250").unwrap();
        assert_eq!(parsed, utc("2024-07-04T12:15:30.250Z"));
    }

    #[test]
    fn fall_back_hour_resolves_to_earlier_instant() {
        let parsed = parse_feed_timestamp("2024-11-03 01:30:00.000").unwrap();
        assert_eq!(parsed, utc("2024-11-03T05:30:00Z"));
    }

    #[test]
    fn spring_forward_gap_takes_post_change_offset() {
        let parsed = parse_feed_timestamp("2024-03-10 02:30:00.000").unwrap();
        assert_eq!(parsed, utc("2024-03-10T06:30:00Z"));
        let edge = parse_feed_timestamp("2024-03-10 02:00:00.000").unwrap();
        assert_eq!(edge, utc("2024-03-10T06:00:00Z"));
        let after = parse_feed_timestamp("2024-03-10 03:00:00.000").unwrap();
        assert_eq!(after, utc("2024-03-10T07:00:00Z"));
    }

    #[test]
    fn malformed_timestamps_are_rejected() {
        for raw in [
            "not-a-date",
            "",
            "2024-03-01 14:30:00",
            "2024-03-01 14:30:00.",
            "2024-03-01 14:30:00.5",
            "2024-03-01 14:30:00.123456",
            "2024-03-01T14:30:00.000",
            "2024-13-01 14:30:00.000",
            "2024-03-01 14:xx:00.000",
        ] {
            let err = parse_feed_timestamp(raw).unwrap_err();
            assert!(matches!(err, TimestampError::Malformed { .. }), "{raw}: {err}");
        }
    }

    #[test]
    fn source_local_id_keeps_upstream_whitespace() {
        let mut incident = mk_incident();
        incident.address = " 100 N Main St  ".into();
        assert_eq!(
            incident.source_local_id(),
            "2024-03-01 14:30:00.000  100 N Main St  "
        );
    }

    #[test]
    fn mvc_marker_is_case_sensitive_substring() {
        let mut incident = mk_incident();
        assert!(incident.is_mvc());
        incident.problem = "Unknown Problem (MVC?)".into();
        assert!(incident.is_mvc());
        incident.problem = "mvc with entrapment".into();
        assert!(!incident.is_mvc());
        incident.problem = "Structure Fire".into();
        assert!(!incident.is_mvc());
    }

    #[test]
    fn incident_decodes_long_key_defaults_and_extra_fields() {
        let incident: Incident = serde_json::from_value(json!({
            "jurisdiction": "Raleigh",
            "problem": "MVC",
            "lat": 35,
            "long": -78.5,
            "timestamp": "2024-03-01 14:30:00.000",
            "unit": "EMS12"
        }))
        .unwrap();
        assert_eq!(incident.address, "");
        assert_eq!(incident.lat, 35.0);
        assert_eq!(incident.lon, -78.5);
        assert_eq!(incident.extra.get("unit"), Some(&json!("EMS12")));

        let back = serde_json::to_value(&incident).unwrap();
        assert_eq!(back["long"], json!(-78.5));
        assert_eq!(back["unit"], json!("EMS12"));
        assert!(back.get("lon").is_none());
    }

    #[test]
    fn null_fields_decode_to_defaults_without_rejecting_the_batch() {
        let batch: Vec<Incident> = serde_json::from_str(
            r#"[
                {"jurisdiction": null, "problem": "MVC", "address": "1 A St",
                 "lat": null, "long": null, "timestamp": "2024-03-01 14:30:00.000"},
                {"jurisdiction": "Cary", "problem": null, "address": null,
                 "lat": 35.5, "long": -78.7, "timestamp": null, "unit": null}
            ]"#,
        )
        .unwrap();

        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].jurisdiction, "");
        assert_eq!(batch[0].lat, 0.0);
        assert_eq!(batch[0].lon, 0.0);
        assert_eq!(batch[0].address, "1 A St");
        assert_eq!(batch[1].problem, "");
        assert_eq!(batch[1].timestamp, "");
        assert_eq!(batch[1].lat, 35.5);
        assert_eq!(batch[1].extra.get("unit"), Some(&JsonValue::Null));
    }

    #[test]
    fn merge_without_weather_nulls_every_weather_column() {
        let ts = utc("2024-03-01T19:30:00Z");
        let record = UnifiedIncidentRecord::merge(mk_incident(), ts, None);

        assert_eq!(record.source, SOURCE_TAG);
        assert_eq!(record.source_id, "2024-03-01 14:30:00.000 100 N Main St");
        assert_eq!(record.event_type, EVENT_TYPE);
        assert_eq!(record.status(), "active");
        assert_eq!(record.timestamp, ts);
        assert_eq!(record.jurisdiction, "Wake County");
        assert_eq!(record.problem_detail, "MVC - Injuries");
        assert_eq!(record.weather_temp(), None);
        assert_eq!(record.weather_wind_speed(), None);
        assert_eq!(record.weather_forecast(), None);

        let details = record.details_json().unwrap();
        assert!(details["weather"].is_null());
        assert_eq!(details["raw_incident"]["address"], json!("100 N Main St"));
        assert_eq!(details["raw_incident"]["long"], json!(-78.6382));
    }

    #[test]
    fn merge_with_weather_populates_columns_and_payload() {
        let record = UnifiedIncidentRecord::merge(
            mk_incident(),
            utc("2024-03-01T19:30:00Z"),
            Some(mk_weather()),
        );

        assert_eq!(record.weather_temp(), Some(54));
        assert_eq!(record.weather_wind_speed(), Some("5 to 10 mph"));
        assert_eq!(record.weather_forecast(), Some("Light Rain"));

        let details = record.details_json().unwrap();
        assert_eq!(details["weather"]["temperature"], json!(54));
        assert_eq!(details["weather"]["windSpeed"], json!("5 to 10 mph"));
        assert_eq!(details["weather"]["shortForecast"], json!("Light Rain"));
        assert!(details["weather"]["icon"].is_string());
        assert_eq!(details["raw_incident"]["problem"], json!("MVC - Injuries"));
    }
}
