//! Parser for the proxy access-log format:
//!
//! ```text
//! <client-ip> <ident> <ident> [<time>] <scheme> "<method> <target> <protocol>" <status> <bytes> "<referrer>" "<user-agent>" "<forwarded-for>" <upstream-time> <request-time>
//! ```

use crate::parsers::Parser;
use crate::record::{DefaultedFields, ParsedRecord};
use chrono::{NaiveDateTime, TimeZone};
use chrono_tz::Tz;
use lazy_static::lazy_static;
use percent_encoding::percent_decode_str;
use regex::Regex;
use thiserror::Error;
use url::Url;

/// Layout of the bracketed time field. The offset is matched literally and ignored; the local
/// time is always interpreted in the parser's zone.
const TIME_LAYOUT: &str = "%d/%b/%Y:%H:%M:%S +0000";

lazy_static! {
    static ref ACCESS_LOG_LINE: Regex = Regex::new(
        r#"([\d\.]+)\s+([^ \[]+)\s+([^ \[]+)\s+\[([^\]]+)\]\s+([a-z]+)\s+"([^"]+)"\s+(\d{3})\s+(\d+)\s+"([^"]+)"\s+"(.*?)"\s+"([\d\.-]+)"\s+([\d\.-]+)\s+([\d\.-]+)"#
    )
    .expect("access log pattern is valid");
    static ref TARGET_BASE: Url = Url::parse("http://localhost/").expect("base url is valid");
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("line does not match access log grammar")]
    Grammar,
    #[error("invalid time {value:?}: {reason}")]
    Timestamp { value: String, reason: String },
    #[error("request line {0:?} is not `<method> <target> <protocol>`")]
    RequestLine(String),
    #[error("invalid request target {target:?}: {reason}")]
    Target { target: String, reason: String },
}

impl ParseError {
    /// Short label used for metrics and structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ParseError::Grammar => "grammar",
            ParseError::Timestamp { .. } => "timestamp",
            ParseError::RequestLine(_) => "request_line",
            ParseError::Target { .. } => "target",
        }
    }
}

#[derive(Debug, Clone)]
pub struct AccessLogParser {
    time_zone: Tz,
}

impl AccessLogParser {
    pub fn new(time_zone: Tz) -> Self {
        Self { time_zone }
    }

    pub fn time_zone(&self) -> Tz {
        self.time_zone
    }

    fn parse_time(&self, value: &str) -> Result<chrono::DateTime<Tz>, ParseError> {
        let naive = NaiveDateTime::parse_from_str(value, TIME_LAYOUT).map_err(|err| {
            ParseError::Timestamp {
                value: value.to_string(),
                reason: err.to_string(),
            }
        })?;
        self.time_zone
            .from_local_datetime(&naive)
            .single()
            .ok_or_else(|| ParseError::Timestamp {
                value: value.to_string(),
                reason: format!("no unique local time in {}", self.time_zone),
            })
    }
}

impl Parser for AccessLogParser {
    fn parse(&self, line: &[u8]) -> Result<ParsedRecord, ParseError> {
        let text = String::from_utf8_lossy(line);
        let caps = ACCESS_LOG_LINE.captures(&text).ok_or(ParseError::Grammar)?;
        // All groups are mandatory in the pattern, so indexing cannot miss once it matched.
        let field = |idx: usize| caps.get(idx).map(|m| m.as_str()).unwrap_or_default();

        let timestamp = self.parse_time(field(4))?;

        let request_line = field(6);
        let tokens: Vec<&str> = request_line.split_whitespace().collect();
        let [method, target, _protocol] = tokens.as_slice() else {
            return Err(ParseError::RequestLine(request_line.to_string()));
        };
        let path = request_path(target)?;

        let mut defaulted = DefaultedFields::default();
        let bytes_sent = field(8).parse::<u64>().unwrap_or_else(|_| {
            defaulted.bytes_sent = true;
            0
        });
        let upstream_time = lenient_seconds(field(12), &mut defaulted.upstream_time);
        let request_time = lenient_seconds(field(13), &mut defaulted.request_time);

        Ok(ParsedRecord {
            timestamp,
            bytes_sent,
            path,
            method: (*method).to_string(),
            scheme: field(5).to_string(),
            status: field(7).to_string(),
            upstream_time,
            request_time,
            defaulted,
        })
    }
}

fn lenient_seconds(value: &str, defaulted: &mut bool) -> f64 {
    match value.parse::<f64>() {
        Ok(seconds) if seconds.is_finite() => seconds,
        _ => {
            *defaulted = true;
            0.0
        }
    }
}

/// Returns the decoded path of the request target, exactly as sent, without query or fragment.
///
/// The target is validated as a URL reference but never normalized: dot segments, backslashes
/// and relative or `*` targets are kept as they appear in the log.
fn request_path(target: &str) -> Result<String, ParseError> {
    let invalid = |reason: String| ParseError::Target {
        target: target.to_string(),
        reason,
    };

    if let Some(pos) = target.bytes().position(|b| b.is_ascii_control()) {
        return Err(invalid(format!("control character at byte {pos}")));
    }
    Url::options()
        .base_url(Some(&*TARGET_BASE))
        .parse(target)
        .map_err(|err| invalid(err.to_string()))?;

    let encoded = raw_path(target);
    if let Some(pos) = invalid_escape(encoded) {
        return Err(invalid(format!("invalid percent escape at byte {pos}")));
    }

    percent_decode_str(encoded)
        .decode_utf8()
        .map(|path| path.into_owned())
        .map_err(|err| invalid(err.to_string()))
}

/// Path component of a URL reference, still percent-encoded.
fn raw_path(target: &str) -> &str {
    let reference = target.split(['?', '#']).next().unwrap_or(target);
    let (has_scheme, rest) = match split_scheme(reference) {
        Some(rest) => (true, rest),
        None => (false, reference),
    };

    if let Some(after_slashes) = rest.strip_prefix("//") {
        if has_scheme || !rest.starts_with("///") {
            // Skip the authority.
            return after_slashes
                .find('/')
                .map_or("", |pos| &after_slashes[pos..]);
        }
    }
    if has_scheme && !rest.starts_with('/') {
        // Opaque reference such as `mailto:x`.
        return "";
    }
    rest
}

/// Text after `scheme:` when the reference starts with a syntactically valid scheme.
fn split_scheme(reference: &str) -> Option<&str> {
    let (scheme, rest) = reference.split_once(':')?;
    let mut chars = scheme.chars();
    let first = chars.next()?;
    let valid = first.is_ascii_alphabetic()
        && chars.all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '+' | '-' | '.'));
    valid.then_some(rest)
}

/// Position of the first `%` not followed by two hex digits.
fn invalid_escape(path: &str) -> Option<usize> {
    let bytes = path.as_bytes();
    bytes.iter().enumerate().find_map(|(idx, byte)| {
        if *byte != b'%' {
            return None;
        }
        let well_formed = bytes
            .get(idx + 1..idx + 3)
            .map(|hex| hex.iter().all(u8::is_ascii_hexdigit))
            .unwrap_or(false);
        (!well_formed).then_some(idx)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono_tz::Asia::Shanghai;

    const SAMPLE: &str = r#"172.0.0.12 - - [04/Mar/2018:13:49:52 +0000] http "GET /foo?query=t HTTP/1.0" 200 2133 "-" "KeepAliveClient" "-" 1.005 1.854"#;

    fn parser() -> AccessLogParser {
        AccessLogParser::new(Shanghai)
    }

    fn with_request(request: &str) -> String {
        SAMPLE.replace("GET /foo?query=t HTTP/1.0", request)
    }

    #[test]
    fn parses_reference_line() {
        let record = parser().parse(SAMPLE.as_bytes()).unwrap();

        assert_eq!(record.method, "GET");
        assert_eq!(record.path, "/foo");
        assert_eq!(record.scheme, "http");
        assert_eq!(record.status, "200");
        assert_eq!(record.bytes_sent, 2133);
        assert_eq!(record.upstream_time, 1.005);
        assert_eq!(record.request_time, 1.854);
        assert_eq!(
            record.timestamp,
            Shanghai.with_ymd_and_hms(2018, 3, 4, 13, 49, 52).unwrap()
        );
        assert!(!record.defaulted.any());
    }

    #[test]
    fn parsing_is_deterministic() {
        let parser = parser();
        let first = parser.parse(SAMPLE.as_bytes()).unwrap();
        let second = parser.parse(SAMPLE.as_bytes()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn time_is_read_in_configured_zone() {
        let utc = AccessLogParser::new(Tz::UTC)
            .parse(SAMPLE.as_bytes())
            .unwrap();
        let shanghai = parser().parse(SAMPLE.as_bytes()).unwrap();

        assert_eq!(
            utc.timestamp.timestamp() - shanghai.timestamp.timestamp(),
            8 * 3600
        );
    }

    #[test]
    fn rejects_line_with_missing_quoted_fields() {
        let line = "172.0.0.12 - - [04/Mar/2018:13:49:52 +0000] http GET /foo 200 2133";
        assert_eq!(line.split_whitespace().count(), 10);
        assert_eq!(parser().parse(line.as_bytes()), Err(ParseError::Grammar));
    }

    #[test]
    fn rejects_unparseable_time() {
        let line = SAMPLE.replace("04/Mar/2018", "04/Foo/2018");
        let err = parser().parse(line.as_bytes()).unwrap_err();
        assert_eq!(err.kind(), "timestamp");
    }

    #[test]
    fn rejects_non_zero_literal_offset() {
        let line = SAMPLE.replace("+0000", "+0800");
        let err = parser().parse(line.as_bytes()).unwrap_err();
        assert_eq!(err.kind(), "timestamp");
    }

    #[test]
    fn rejects_request_line_without_three_tokens() {
        for request in ["GET /foo", "GET /foo HTTP/1.0 extra", "-"] {
            let line = with_request(request);
            let err = parser().parse(line.as_bytes()).unwrap_err();
            assert_eq!(
                err,
                ParseError::RequestLine(request.to_string()),
                "request {request:?}"
            );
        }
    }

    #[test]
    fn rejects_malformed_target() {
        let line = with_request("GET /foo%zz?x=1 HTTP/1.1");
        let err = parser().parse(line.as_bytes()).unwrap_err();
        assert_eq!(err.kind(), "target");

        let line = with_request("GET http://[::1/foo HTTP/1.1");
        let err = parser().parse(line.as_bytes()).unwrap_err();
        assert_eq!(err.kind(), "target");
    }

    #[test]
    fn decodes_path_and_drops_query() {
        let line = with_request("POST /api/a%20b/c?token=1&x=2 HTTP/1.1");
        let record = parser().parse(line.as_bytes()).unwrap();
        assert_eq!(record.method, "POST");
        assert_eq!(record.path, "/api/a b/c");
    }

    #[test]
    fn absolute_target_keeps_only_path() {
        let line = with_request("GET http://example.com/health?verbose=1 HTTP/1.1");
        let record = parser().parse(line.as_bytes()).unwrap();
        assert_eq!(record.path, "/health");
    }

    #[test]
    fn target_path_is_kept_as_sent() {
        let cases = [
            ("/a/../b", "/a/../b"),
            ("/a/./b//c", "/a/./b//c"),
            ("*", "*"),
            ("foo", "foo"),
            (r"/a\b", r"/a\b"),
            ("/x?y=../z#frag", "/x"),
            ("//cdn.example.com/img.png?v=2", "/img.png"),
            ("https://example.com", ""),
            ("HTTP://example.com/../up", "/../up"),
        ];
        for (target, expected) in cases {
            let line = with_request(&format!("GET {target} HTTP/1.1"));
            let record = parser().parse(line.as_bytes()).unwrap();
            assert_eq!(record.path, expected, "target {target:?}");
        }
    }

    #[test]
    fn rejects_control_characters_in_target() {
        let line = with_request("GET /a\u{7f}b HTTP/1.1");
        let err = parser().parse(line.as_bytes()).unwrap_err();
        assert_eq!(err.kind(), "target");
    }

    #[test]
    fn raw_path_splits_scheme_and_authority() {
        assert_eq!(raw_path("http://host:8080/p/q?x"), "/p/q");
        assert_eq!(raw_path("///triple/slash"), "///triple/slash");
        assert_eq!(raw_path("mailto:someone"), "");
        assert_eq!(raw_path("/a:b/c"), "/a:b/c");
        assert_eq!(split_scheme("1http://x"), None);
    }

    #[test]
    fn dash_times_default_to_zero_and_are_flagged() {
        let line = SAMPLE.replace("1.005 1.854", "- -");
        let record = parser().parse(line.as_bytes()).unwrap();

        assert_eq!(record.upstream_time, 0.0);
        assert_eq!(record.request_time, 0.0);
        assert!(record.defaulted.upstream_time);
        assert!(record.defaulted.request_time);
        assert!(!record.defaulted.bytes_sent);
    }

    #[test]
    fn malformed_time_fields_do_not_reject_record() {
        let line = SAMPLE.replace("1.005 1.854", "1.2.3 0.250");
        let record = parser().parse(line.as_bytes()).unwrap();

        assert_eq!(record.upstream_time, 0.0);
        assert!(record.defaulted.upstream_time);
        assert_eq!(record.request_time, 0.25);
        assert!(!record.defaulted.request_time);
    }

    #[test]
    fn overflowing_bytes_sent_defaults_to_zero() {
        let line = SAMPLE.replace(" 2133 ", " 99999999999999999999999 ");
        let record = parser().parse(line.as_bytes()).unwrap();
        assert_eq!(record.bytes_sent, 0);
        assert!(record.defaulted.bytes_sent);
    }

    #[test]
    fn invalid_escape_positions() {
        assert_eq!(invalid_escape("/a%20b"), None);
        assert_eq!(invalid_escape("/a%2"), Some(2));
        assert_eq!(invalid_escape("/%zz"), Some(1));
    }
}
