use crate::metrics::SINK_WRITE_DURATION;
use crate::record::ParsedRecord;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Measurement every access-log point is written under.
pub const MEASUREMENT: &str = "logs";

const MAX_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("sink transport failed: {0}")]
    Transport(String),
    #[error("sink rejected write with status {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("sink i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("write abandoned during shutdown")]
    Cancelled,
}

/// Destination for parsed records. One call persists exactly one record.
#[async_trait]
pub trait RecordSink: Send + Sync {
    async fn write(&self, record: &ParsedRecord) -> Result<(), SinkError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Precision {
    Nanoseconds,
    Microseconds,
    Milliseconds,
    #[default]
    Seconds,
    Minutes,
    Hours,
}

impl Precision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Precision::Nanoseconds => "ns",
            Precision::Microseconds => "u",
            Precision::Milliseconds => "ms",
            Precision::Seconds => "s",
            Precision::Minutes => "m",
            Precision::Hours => "h",
        }
    }

    fn timestamp(&self, time: &DateTime<Utc>) -> i64 {
        match self {
            Precision::Nanoseconds => time.timestamp_nanos_opt().unwrap_or(i64::MAX),
            Precision::Microseconds => time.timestamp_micros(),
            Precision::Milliseconds => time.timestamp_millis(),
            Precision::Seconds => time.timestamp(),
            Precision::Minutes => time.timestamp().div_euclid(60),
            Precision::Hours => time.timestamp().div_euclid(3600),
        }
    }
}

impl FromStr for Precision {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "n" | "ns" => Ok(Precision::Nanoseconds),
            "u" | "us" => Ok(Precision::Microseconds),
            "ms" => Ok(Precision::Milliseconds),
            "s" => Ok(Precision::Seconds),
            "m" => Ok(Precision::Minutes),
            "h" => Ok(Precision::Hours),
            other => Err(format!("unsupported precision {other:?}")),
        }
    }
}

impl fmt::Display for Precision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Float(f64),
    Integer(i64),
}

/// Backend-neutral time-series point built from one record.
#[derive(Debug, Clone, PartialEq)]
pub struct Point {
    pub measurement: String,
    pub tags: BTreeMap<String, String>,
    pub fields: BTreeMap<String, FieldValue>,
    /// Ingestion time; the record's own timestamp is not used for the point.
    pub time: DateTime<Utc>,
}

impl Point {
    pub fn from_record(record: &ParsedRecord, ingested_at: DateTime<Utc>) -> Self {
        let tags = BTreeMap::from([
            ("Path".to_string(), record.path.clone()),
            ("Method".to_string(), record.method.clone()),
            ("Scheme".to_string(), record.scheme.clone()),
            ("Status".to_string(), record.status.clone()),
        ]);
        let fields = BTreeMap::from([
            (
                "UpstreamTime".to_string(),
                FieldValue::Float(record.upstream_time),
            ),
            (
                "RequestTime".to_string(),
                FieldValue::Float(record.request_time),
            ),
            (
                "BytesSent".to_string(),
                FieldValue::Integer(i64::try_from(record.bytes_sent).unwrap_or(i64::MAX)),
            ),
        ]);

        Self {
            measurement: MEASUREMENT.to_string(),
            tags,
            fields,
            time: ingested_at,
        }
    }

    /// Renders the point in InfluxDB line protocol. Tags with empty values are omitted since the
    /// protocol cannot represent them.
    pub fn to_line_protocol(&self, precision: Precision) -> String {
        let mut line = escape(&self.measurement, &[',', ' ']);
        for (key, value) in &self.tags {
            if value.is_empty() {
                continue;
            }
            line.push(',');
            line.push_str(&escape(key, &[',', '=', ' ']));
            line.push('=');
            line.push_str(&escape(value, &[',', '=', ' ']));
        }

        let fields: Vec<String> = self
            .fields
            .iter()
            .map(|(key, value)| {
                let rendered = match value {
                    FieldValue::Float(v) => format!("{v}"),
                    FieldValue::Integer(v) => format!("{v}i"),
                };
                format!("{}={}", escape(key, &[',', '=', ' ']), rendered)
            })
            .collect();
        line.push(' ');
        line.push_str(&fields.join(","));
        line.push(' ');
        line.push_str(&precision.timestamp(&self.time).to_string());
        line
    }
}

/// Line protocol has no escape for line breaks, so they are written as the two-character
/// sequences `\n` and `\r`. Backslashes are escaped first, which keeps those unambiguous.
fn escape(value: &str, special: &[char]) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '\n' => escaped.push_str("\\n"),
            '\r' => escaped.push_str("\\r"),
            _ => {
                if ch == '\\' || special.contains(&ch) {
                    escaped.push('\\');
                }
                escaped.push(ch);
            }
        }
    }
    escaped
}

/// Retry budget for a single record write.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_millis(200),
        }
    }
}

/// Writes `record`, retrying failures with exponential backoff (capped at 30s).
///
/// Returns the last sink error once `max_attempts` writes have failed.
pub async fn write_with_retry(
    sink: &dyn RecordSink,
    record: &ParsedRecord,
    policy: RetryPolicy,
    cancel: &CancellationToken,
) -> Result<(), SinkError> {
    let max_attempts = policy.max_attempts.max(1);
    let mut backoff = policy.base_backoff.max(Duration::from_millis(1));
    let mut attempt: u32 = 0;

    loop {
        attempt += 1;
        let started = Instant::now();
        let result = sink.write(record).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        SINK_WRITE_DURATION
            .with_label_values(&[status])
            .observe(started.elapsed().as_secs_f64());

        let err = match result {
            Ok(()) => return Ok(()),
            Err(err) => err,
        };
        if attempt >= max_attempts {
            return Err(err);
        }

        warn!(
            attempt,
            max_attempts,
            error = %err,
            backoff_ms = backoff.as_millis() as u64,
            "sink write failed; retrying with backoff"
        );

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(SinkError::Cancelled),
            _ = sleep(backoff) => {}
        }
        backoff = std::cmp::min(backoff.saturating_mul(2), MAX_BACKOFF);
    }
}

/// Appends points as line protocol to a local file.
#[derive(Debug)]
pub struct FileWriter {
    path: PathBuf,
    precision: Precision,
    file: Mutex<File>,
}

impl FileWriter {
    pub async fn open(path: impl AsRef<Path>, precision: Precision) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create directory {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("failed to open output file {}", path.display()))?;

        Ok(Self {
            path,
            precision,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl RecordSink for FileWriter {
    async fn write(&self, record: &ParsedRecord) -> Result<(), SinkError> {
        let point = Point::from_record(record, Utc::now());
        let mut line = point.to_line_protocol(self.precision);
        line.push('\n');

        let mut file = self.file.lock().await;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;

        debug!(
            output = %self.path.display(),
            path = %record.path,
            status = %record.status,
            "persisted point to local sink"
        );
        Ok(())
    }
}
