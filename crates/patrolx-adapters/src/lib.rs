//! Incident feed adapter and weather-authority client for PatrolX.

use anyhow::{Context, Result};
use async_trait::async_trait;
use patrolx_core::{Incident, WeatherSnapshot, SOURCE_TAG};
use patrolx_storage::{FetchError, HttpFetcher};
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "patrolx-adapters";

pub const DEFAULT_NWS_BASE_URL: &str = "https://api.weather.gov";
pub const WEATHER_APP_NAME: &str = "patrolx";

/// Identification header value the weather authority asks every client to send.
pub fn weather_user_agent(contact_email: &str) -> String {
    format!("({WEATHER_APP_NAME}, {contact_email})")
}

#[async_trait]
pub trait FeedSource: Send + Sync {
    fn source_tag(&self) -> &'static str;

    async fn fetch_incidents(&self) -> Result<Vec<Incident>>;
}

/// Regional emergency-communications feed: one JSON array of incidents per GET.
#[derive(Debug, Clone)]
pub struct RweccFeed {
    http: HttpFetcher,
    url: String,
}

impl RweccFeed {
    pub fn new(http: HttpFetcher, url: impl Into<String>) -> Self {
        Self {
            http,
            url: url.into(),
        }
    }
}

#[async_trait]
impl FeedSource for RweccFeed {
    fn source_tag(&self) -> &'static str {
        SOURCE_TAG
    }

    async fn fetch_incidents(&self) -> Result<Vec<Incident>> {
        let incidents: Vec<Incident> = self
            .http
            .fetch_json(&self.url, &[])
            .await
            .with_context(|| format!("fetching incident feed {}", self.url))?;
        debug!(count = incidents.len(), "decoded feed incidents");
        Ok(incidents)
    }
}

/// Keep only motor-vehicle-crash incidents.
pub fn select_mvc(incidents: Vec<Incident>) -> Vec<Incident> {
    incidents.into_iter().filter(Incident::is_mvc).collect()
}

#[derive(Debug, Error)]
pub enum WeatherError {
    #[error("points lookup failed: {0}")]
    Points(#[source] FetchError),
    #[error("points response did not contain a forecast URL")]
    MissingForecastUrl,
    #[error("hourly forecast fetch failed: {0}")]
    Hourly(#[source] FetchError),
    #[error("no weather periods returned")]
    NoPeriods,
}

#[async_trait]
pub trait WeatherLookup: Send + Sync {
    async fn lookup(&self, lat: f64, lon: f64) -> Result<WeatherSnapshot, WeatherError>;
}

#[derive(Debug, Default, Deserialize)]
struct PointsResponse {
    #[serde(default)]
    properties: PointsProperties,
}

#[derive(Debug, Default, Deserialize)]
struct PointsProperties {
    #[serde(rename = "forecastHourly", default)]
    forecast_hourly: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HourlyResponse {
    properties: HourlyProperties,
}

#[derive(Debug, Deserialize)]
struct HourlyProperties {
    #[serde(default)]
    periods: Vec<WeatherSnapshot>,
}

/// National Weather Service client: points lookup, then the hourly forecast it
/// links to. No caching and no retries.
#[derive(Debug, Clone)]
pub struct NwsWeatherClient {
    http: HttpFetcher,
    base_url: String,
}

impl NwsWeatherClient {
    pub fn new(http: HttpFetcher, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
        }
    }

    pub fn points_url(&self, lat: f64, lon: f64) -> String {
        format!(
            "{}/points/{lat:.4},{lon:.4}",
            self.base_url.trim_end_matches('/')
        )
    }
}

#[async_trait]
impl WeatherLookup for NwsWeatherClient {
    async fn lookup(&self, lat: f64, lon: f64) -> Result<WeatherSnapshot, WeatherError> {
        let points: PointsResponse = self
            .http
            .fetch_json(&self.points_url(lat, lon), &[])
            .await
            .map_err(WeatherError::Points)?;

        let forecast_url = points
            .properties
            .forecast_hourly
            .filter(|url| !url.is_empty())
            .ok_or(WeatherError::MissingForecastUrl)?;

        let hourly: HourlyResponse = self
            .http
            .fetch_json(&forecast_url, &[("units", "us")])
            .await
            .map_err(WeatherError::Hourly)?;

        // periods are time-ordered; the first is the current hour
        hourly
            .properties
            .periods
            .into_iter()
            .next()
            .ok_or(WeatherError::NoPeriods)
    }
}
