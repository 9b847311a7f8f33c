//! Sync pipeline orchestration: fetch the feed, keep MVC incidents, and push each
//! one through time normalization, weather enrichment, merge and upsert.

use std::fmt;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use patrolx_adapters::{
    select_mvc, weather_user_agent, FeedSource, NwsWeatherClient, RweccFeed, WeatherLookup,
    DEFAULT_NWS_BASE_URL,
};
use patrolx_core::{parse_feed_timestamp, Incident, UnifiedIncidentRecord};
use patrolx_storage::{HttpClientConfig, HttpFetcher, IncidentSink, PgIncidentStore};
use serde::Serialize;
use sqlx::postgres::{PgConnectOptions, PgSslMode};
use thiserror::Error;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "patrolx-sync";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("RWECC_URL must be set")]
    MissingFeedUrl,
    #[error("invalid value {value:?} for {var}: {reason}")]
    InvalidValue {
        var: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Clone)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub name: String,
    pub ssl_mode: PgSslMode,
}

impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("name", &self.name)
            .field("ssl_mode", &self.ssl_mode)
            .finish()
    }
}

impl DatabaseConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let port = match lookup("DATABASE_PORT") {
            Some(raw) => raw.trim().parse::<u16>().map_err(|err| ConfigError::InvalidValue {
                var: "DATABASE_PORT",
                value: raw.clone(),
                reason: format!("{err}"),
            })?,
            None => 5432,
        };
        let ssl_mode = match lookup("DATABASE_SSLMODE") {
            Some(raw) => raw.trim().parse::<PgSslMode>().map_err(|err| {
                ConfigError::InvalidValue {
                    var: "DATABASE_SSLMODE",
                    value: raw.clone(),
                    reason: err.to_string(),
                }
            })?,
            None => PgSslMode::Require,
        };

        Ok(Self {
            host: lookup("DATABASE_HOST").unwrap_or_else(|| "localhost".to_string()),
            port,
            username: lookup("DATABASE_USERNAME").unwrap_or_else(|| "postgres".to_string()),
            password: lookup("DATABASE_PASSWORD").unwrap_or_default(),
            name: lookup("DATABASE_NAME").unwrap_or_else(|| "postgres".to_string()),
            ssl_mode,
        })
    }

    pub fn connect_options(&self) -> PgConnectOptions {
        PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .username(&self.username)
            .password(&self.password)
            .database(&self.name)
            .ssl_mode(self.ssl_mode)
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database: DatabaseConfig,
    pub feed_url: String,
    pub nws_base_url: String,
    pub nws_contact_email: String,
    pub http_timeout_secs: u64,
}

impl SyncConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let feed_url = lookup("RWECC_URL")
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .ok_or(ConfigError::MissingFeedUrl)?;

        let http_timeout_secs = match lookup("PATROLX_HTTP_TIMEOUT_SECS") {
            Some(raw) => match raw.trim().parse::<u64>() {
                Ok(secs) if secs > 0 => secs,
                _ => {
                    return Err(ConfigError::InvalidValue {
                        var: "PATROLX_HTTP_TIMEOUT_SECS",
                        value: raw,
                        reason: "expected a positive number of seconds".to_string(),
                    })
                }
            },
            None => 10,
        };

        Ok(Self {
            database: DatabaseConfig::from_lookup(&lookup)?,
            feed_url,
            nws_base_url: lookup("NWS_BASE_URL")
                .unwrap_or_else(|| DEFAULT_NWS_BASE_URL.to_string()),
            nws_contact_email: lookup("NWS_CONTACT_EMAIL")
                .unwrap_or_else(|| "admin@patrolx.local".to_string()),
            http_timeout_secs,
        })
    }

    pub fn http_fetcher(&self) -> Result<HttpFetcher> {
        HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(weather_user_agent(&self.nws_contact_email)),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum IncidentOutcome {
    Saved {
        source_id: String,
        weather_attached: bool,
        timestamp_fallback: bool,
    },
    Skipped {
        source_id: String,
        address: String,
        reason: String,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub fetched: usize,
    pub candidates: usize,
    pub saved: usize,
    pub skipped: usize,
    pub weather_missing: usize,
    pub outcomes: Vec<IncidentOutcome>,
}

/// One pass over one fetched batch. Incidents are processed strictly in order,
/// each to completion before the next.
pub struct SyncPipeline {
    feed: Box<dyn FeedSource>,
    weather: Box<dyn WeatherLookup>,
    sink: Box<dyn IncidentSink>,
}

impl SyncPipeline {
    pub fn new(
        feed: Box<dyn FeedSource>,
        weather: Box<dyn WeatherLookup>,
        sink: Box<dyn IncidentSink>,
    ) -> Self {
        Self {
            feed,
            weather,
            sink,
        }
    }

    pub async fn run_once(&self) -> Result<SyncRunSummary> {
        let run_id = Uuid::new_v4();
        let span = info_span!("sync_run", %run_id, source = self.feed.source_tag());
        self.run_batch(run_id).instrument(span).await
    }

    async fn run_batch(&self, run_id: Uuid) -> Result<SyncRunSummary> {
        let started_at = Utc::now();
        info!("searching for new MVC incidents");

        let incidents = self.feed.fetch_incidents().await?;
        let fetched = incidents.len();
        let candidates = select_mvc(incidents);

        let mut summary = SyncRunSummary {
            run_id,
            started_at,
            finished_at: started_at,
            fetched,
            candidates: candidates.len(),
            saved: 0,
            skipped: 0,
            weather_missing: 0,
            outcomes: Vec::with_capacity(candidates.len()),
        };

        for incident in candidates {
            let outcome = self.process_incident(incident).await;
            match &outcome {
                IncidentOutcome::Saved {
                    weather_attached, ..
                } => {
                    summary.saved += 1;
                    if !weather_attached {
                        summary.weather_missing += 1;
                    }
                }
                IncidentOutcome::Skipped { .. } => summary.skipped += 1,
            }
            summary.outcomes.push(outcome);
        }

        summary.finished_at = Utc::now();
        info!(
            fetched = summary.fetched,
            candidates = summary.candidates,
            saved = summary.saved,
            skipped = summary.skipped,
            weather_missing = summary.weather_missing,
            "run complete"
        );
        Ok(summary)
    }

    /// Normalize, enrich, merge and upsert one incident. Never fails the run.
    pub async fn process_incident(&self, incident: Incident) -> IncidentOutcome {
        let (timestamp, timestamp_fallback) = match parse_feed_timestamp(&incident.timestamp) {
            Ok(ts) => (ts, false),
            Err(err) => {
                warn!(
                    timestamp = %incident.timestamp,
                    address = %incident.address,
                    error = %err,
                    "could not parse timestamp, using current time"
                );
                (Utc::now(), true)
            }
        };

        let weather = match self.weather.lookup(incident.lat, incident.lon).await {
            Ok(snapshot) => Some(snapshot),
            Err(err) => {
                warn!(
                    address = %incident.address,
                    lat = incident.lat,
                    lon = incident.lon,
                    error = %err,
                    "could not fetch weather for incident"
                );
                None
            }
        };

        let record = UnifiedIncidentRecord::merge(incident, timestamp, weather);
        match self.sink.upsert(&record).await {
            Ok(()) => {
                info!(
                    source_id = %record.source_id,
                    weather = record.weather.is_some(),
                    "saved incident"
                );
                IncidentOutcome::Saved {
                    source_id: record.source_id,
                    weather_attached: record.weather.is_some(),
                    timestamp_fallback,
                }
            }
            Err(err) => {
                error!(
                    address = %err.address(),
                    timestamp = %record.details.raw_incident.timestamp,
                    error = %err,
                    "error saving incident"
                );
                IncidentOutcome::Skipped {
                    source_id: record.source_id,
                    address: record.address,
                    reason: err.to_string(),
                }
            }
        }
    }
}

pub async fn run_sync_once(config: &SyncConfig) -> Result<SyncRunSummary> {
    let store = PgIncidentStore::connect(config.database.connect_options()).await?;
    info!(
        host = %config.database.host,
        database = %config.database.name,
        "connected to the database"
    );

    let http = config.http_fetcher()?;
    let feed = RweccFeed::new(http.clone(), config.feed_url.clone());
    let weather = NwsWeatherClient::new(http, config.nws_base_url.clone());
    info!(feed_url = %config.feed_url, "starting sync run");

    SyncPipeline::new(Box::new(feed), Box::new(weather), Box::new(store))
        .run_once()
        .await
}

pub async fn run_sync_once_from_env() -> Result<SyncRunSummary> {
    let config = SyncConfig::from_env().context("loading sync configuration")?;
    run_sync_once(&config).await
}

pub async fn migrate_from_env() -> Result<()> {
    let database = DatabaseConfig::from_env().context("loading database configuration")?;
    let store = PgIncidentStore::connect(database.connect_options()).await?;
    store.migrate().await?;
    info!(database = %database.name, "migrations applied");
    Ok(())
}
