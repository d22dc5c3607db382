use chrono::DateTime;
use chrono_tz::Tz;

/// One newline-delimited log entry with the line terminator stripped.
pub type RawLine = Vec<u8>;

/// Structured fields extracted from a single access-log line.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedRecord {
    /// Event time, interpreted in the parser's configured zone.
    pub timestamp: DateTime<Tz>,
    pub bytes_sent: u64,
    /// Request path with the query string removed.
    pub path: String,
    pub method: String,
    pub scheme: String,
    pub status: String,
    /// Seconds spent upstream; `0.0` when the log carried `-` or garbage.
    pub upstream_time: f64,
    pub request_time: f64,
    pub defaulted: DefaultedFields,
}

/// Marks numeric fields that failed to parse and were replaced by zero.
///
/// The emitted point is identical either way; the flags only let callers tell
/// a logged `0` apart from a substituted one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DefaultedFields {
    pub bytes_sent: bool,
    pub upstream_time: bool,
    pub request_time: bool,
}

impl DefaultedFields {
    pub fn any(&self) -> bool {
        self.bytes_sent || self.upstream_time || self.request_time
    }
}

/// Notification consumed by the monitor; carries no data beyond its kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    LineHandled,
    ParseError,
    WriteFailed,
    SinkRestarted,
}
