//! HTTP fetch utilities and the `unified_incidents` upsert writer for PatrolX.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use patrolx_core::UnifiedIncidentRecord;
use serde::de::DeserializeOwned;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use sqlx::types::Json;
use thiserror::Error;
use tracing::{debug, info_span, Instrument};

pub const CRATE_NAME: &str = "patrolx-storage";

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            user_agent: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("undecodable response body from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

impl FetchError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, FetchError::Transport { source, .. } if source.is_timeout())
    }
}

/// Single-attempt GET client. Every request is bounded by the configured
/// timeout and carries the configured `User-Agent`.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    pub async fn fetch_bytes(
        &self,
        url: &str,
        query: &[(&str, &str)],
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", url);
        async {
            let transport = |source| FetchError::Transport {
                url: url.to_string(),
                source,
            };

            let resp = self
                .client
                .get(url)
                .query(query)
                .send()
                .await
                .map_err(transport)?;
            let status = resp.status();
            let final_url = resp.url().to_string();

            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }

            let body = resp.bytes().await.map_err(transport)?.to_vec();
            debug!(status = status.as_u16(), bytes = body.len(), "fetched");
            Ok(FetchedResponse {
                final_url,
                body,
            })
        }
        .instrument(span)
        .await
    }

    pub async fn fetch_json<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, &str)],
    ) -> Result<T, FetchError> {
        let resp = self.fetch_bytes(url, query).await?;
        serde_json::from_slice(&resp.body).map_err(|source| FetchError::Decode {
            url: resp.final_url,
            source,
        })
    }
}

/// Identity, location and event time keep their first-inserted values on
/// conflict; only the payload, status and descriptive columns refresh.
pub const UPSERT_UNIFIED_INCIDENT_SQL: &str = r#"
    INSERT INTO unified_incidents (
        source, source_id, event_type, status, address, latitude, longitude, timestamp,
        details, jurisdiction, problem_detail, weather_temp, weather_wind_speed, weather_forecast
    ) VALUES ($1, $2, $3, 'active', $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
    ON CONFLICT (source, source_id) DO UPDATE SET
        details = EXCLUDED.details,
        status = 'active',
        jurisdiction = EXCLUDED.jurisdiction,
        problem_detail = EXCLUDED.problem_detail,
        weather_temp = EXCLUDED.weather_temp,
        weather_wind_speed = EXCLUDED.weather_wind_speed,
        weather_forecast = EXCLUDED.weather_forecast
"#;

#[derive(Debug, Error)]
pub enum WriteError {
    #[error("serializing details for {source_id:?} at {address:?}: {source}")]
    Serialize {
        source_id: String,
        address: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("upserting {source_id:?} at {address:?}: {source}")]
    Database {
        source_id: String,
        address: String,
        #[source]
        source: sqlx::Error,
    },
}

impl WriteError {
    pub fn address(&self) -> &str {
        match self {
            WriteError::Serialize { address, .. } | WriteError::Database { address, .. } => address,
        }
    }

    pub fn source_id(&self) -> &str {
        match self {
            WriteError::Serialize { source_id, .. } | WriteError::Database { source_id, .. } => {
                source_id
            }
        }
    }
}

/// Destination for merged records. Each call is its own atomic unit.
#[async_trait]
pub trait IncidentSink: Send + Sync {
    async fn upsert(&self, record: &UnifiedIncidentRecord) -> Result<(), WriteError>;
}

/// Postgres-backed `unified_incidents` writer over a single reused connection.
#[derive(Debug, Clone)]
pub struct PgIncidentStore {
    pool: PgPool,
}

impl PgIncidentStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open the one connection the run reuses; fails fast when the database is
    /// unreachable or the credentials are rejected.
    pub async fn connect(options: PgConnectOptions) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await
            .context("connecting to postgres")?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .context("applying unified_incidents migrations")
    }
}

#[async_trait]
impl IncidentSink for PgIncidentStore {
    async fn upsert(&self, record: &UnifiedIncidentRecord) -> Result<(), WriteError> {
        let details = record
            .details_json()
            .map_err(|source| WriteError::Serialize {
                source_id: record.source_id.clone(),
                address: record.address.clone(),
                source,
            })?;

        sqlx::query(UPSERT_UNIFIED_INCIDENT_SQL)
            .bind(&record.source)
            .bind(&record.source_id)
            .bind(&record.event_type)
            .bind(&record.address)
            .bind(record.latitude)
            .bind(record.longitude)
            .bind(record.timestamp)
            .bind(Json(details))
            .bind(&record.jurisdiction)
            .bind(&record.problem_detail)
            .bind(record.weather_temp())
            .bind(record.weather_wind_speed())
            .bind(record.weather_forecast())
            .execute(&self.pool)
            .await
            .map_err(|source| WriteError::Database {
                source_id: record.source_id.clone(),
                address: record.address.clone(),
                source,
            })?;
        Ok(())
    }
}
