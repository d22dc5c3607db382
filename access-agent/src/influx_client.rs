//! InfluxDB 1.x HTTP sink.

use crate::output_writer::{Point, Precision, RecordSink, SinkError};
use crate::record::ParsedRecord;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;
use url::Url;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DsnError {
    #[error("expected `endpoint@username@password@database@precision`, got {0} segment(s)")]
    SegmentCount(usize),
    #[error("invalid endpoint: {0}")]
    Endpoint(#[from] url::ParseError),
    #[error("endpoint scheme must be http or https, got {0:?}")]
    Scheme(String),
    #[error("database name is empty")]
    EmptyDatabase,
    #[error("{0}")]
    Precision(String),
}

/// Connection descriptor in the `endpoint@username@password@database@precision` form.
#[derive(Clone, PartialEq, Eq)]
pub struct InfluxDsn {
    pub endpoint: Url,
    pub username: String,
    pub password: String,
    pub database: String,
    pub precision: Precision,
}

impl FromStr for InfluxDsn {
    type Err = DsnError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = raw.trim().split('@').collect();
        let [endpoint, username, password, database, precision] = parts.as_slice() else {
            return Err(DsnError::SegmentCount(parts.len()));
        };

        let endpoint = Url::parse(endpoint)?;
        if !matches!(endpoint.scheme(), "http" | "https") {
            return Err(DsnError::Scheme(endpoint.scheme().to_string()));
        }
        if database.trim().is_empty() {
            return Err(DsnError::EmptyDatabase);
        }

        Ok(Self {
            endpoint,
            username: (*username).to_string(),
            password: (*password).to_string(),
            database: database.trim().to_string(),
            precision: precision.parse().map_err(DsnError::Precision)?,
        })
    }
}

impl fmt::Debug for InfluxDsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InfluxDsn")
            .field("endpoint", &self.endpoint.as_str())
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("database", &self.database)
            .field("precision", &self.precision)
            .finish()
    }
}

impl InfluxDsn {
    /// `{endpoint}/write?db=..&precision=..`, keeping any path prefix on the endpoint.
    pub fn write_url(&self) -> Result<Url, url::ParseError> {
        let mut base = self.endpoint.clone();
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let mut url = base.join("write")?;
        url.query_pairs_mut()
            .append_pair("db", &self.database)
            .append_pair("precision", self.precision.as_str());
        Ok(url)
    }
}

pub struct InfluxSink {
    client: reqwest::Client,
    write_url: Url,
    username: String,
    password: String,
    precision: Precision,
}

impl InfluxSink {
    pub fn new(dsn: &InfluxDsn, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build influx http client")?;
        let write_url = dsn
            .write_url()
            .with_context(|| format!("failed to derive write url from {}", dsn.endpoint))?;

        Ok(Self {
            client,
            write_url,
            username: dsn.username.clone(),
            password: dsn.password.clone(),
            precision: dsn.precision,
        })
    }
}

#[async_trait]
impl RecordSink for InfluxSink {
    async fn write(&self, record: &ParsedRecord) -> Result<(), SinkError> {
        let body = Point::from_record(record, Utc::now()).to_line_protocol(self.precision);

        let mut request = self.client.post(self.write_url.clone()).body(body);
        if !self.username.is_empty() {
            request = request.basic_auth(&self.username, Some(&self.password));
        }

        let response = request
            .send()
            .await
            .map_err(|err| SinkError::Transport(err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SinkError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        debug!(path = %record.path, status = %record.status, "write success");
        Ok(())
    }
}
