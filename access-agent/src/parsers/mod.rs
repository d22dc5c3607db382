use crate::record::ParsedRecord;

pub mod access_log;

pub use access_log::{AccessLogParser, ParseError};

/// Stateless conversion from one raw log line to a [`ParsedRecord`].
///
/// Parser workers share a single instance behind an `Arc`, so implementations must not keep
/// per-line state. A failure only ever concerns the line that was passed in; the caller counts
/// it, logs it and moves on to the next line.
///
/// # Examples
///
/// ```
/// use access_agent::parsers::{AccessLogParser, Parser};
///
/// let parser = AccessLogParser::new(chrono_tz::Asia::Shanghai);
/// let line = br#"172.0.0.12 - - [04/Mar/2018:13:49:52 +0000] http "GET /foo?query=t HTTP/1.0" 200 2133 "-" "KeepAliveClient" "-" 1.005 1.854"#;
/// let record = parser.parse(line).unwrap();
/// assert_eq!(record.path, "/foo");
/// assert_eq!(record.status, "200");
/// ```
pub trait Parser: Send + Sync {
    fn parse(&self, line: &[u8]) -> Result<ParsedRecord, ParseError>;
}

/// Removes a trailing `\n` and the `\r` of a CRLF terminator, if present.
pub(crate) fn strip_line_terminator(line: &mut Vec<u8>) {
    if line.last() == Some(&b'\n') {
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
    }
}

/// Lossy, length-bounded rendering of a line for log output.
pub(crate) fn line_preview(line: &[u8], limit: usize) -> String {
    let text = String::from_utf8_lossy(line);
    let mut preview = String::new();
    for (idx, ch) in text.chars().enumerate() {
        if idx >= limit {
            preview.push('…');
            return preview;
        }
        preview.push(ch);
    }
    preview
}
