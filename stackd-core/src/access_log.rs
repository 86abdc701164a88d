//! Reverse-proxy access-log parsing and time-bucketed aggregation.
//!
//! Lines are expected in the common "combined" shape with the upstream
//! address appended somewhere after the user agent, which is how the proxy
//! is configured to log for us:
//!
//! ```text
//! 203.0.113.7 - - [12/Jul/2026:10:01:22 +0000] "GET /api/x HTTP/1.1" 200 512 "-" "curl/8.0" 172.28.0.5:8080
//! ```
//!
//! The parser is tolerant: a line that yields no record is either skipped
//! (stats) or forwarded raw (live filter), never an error.

use chrono::{DateTime, Duration, FixedOffset, Local};
use serde::Serialize;

const TIME_FORMAT: &str = "%d/%b/%Y:%H:%M:%S %z";

/// One parsed access-log line.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AccessLogRecord {
    pub remote: String,
    pub time: String,
    pub method: String,
    pub path: String,
    pub status: u16,
    pub size: u64,
    pub referer: String,
    pub ua: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upstream: Option<String>,
    #[serde(skip)]
    pub timestamp: Option<DateTime<FixedOffset>>,
}

impl AccessLogRecord {
    /// IPv4 portion of the upstream field, if present.
    #[must_use]
    pub fn upstream_ip(&self) -> Option<std::net::Ipv4Addr> {
        let upstream = self.upstream.as_deref()?;
        let host = upstream.split(':').next()?;
        host.parse().ok()
    }
}

fn quoted_segments(line: &str) -> Vec<(usize, usize)> {
    let bytes = line.as_bytes();
    let mut segments = Vec::new();
    let mut open: Option<usize> = None;
    for (i, &b) in bytes.iter().enumerate() {
        if b == b'"' {
            match open.take() {
                Some(start) => segments.push((start + 1, i)),
                None => open = Some(i),
            }
        }
    }
    segments
}

fn looks_like_upstream(token: &str) -> bool {
    let mut parts = token.splitn(2, ':');
    let Some(host) = parts.next() else {
        return false;
    };
    if host.parse::<std::net::Ipv4Addr>().is_err() {
        return false;
    }
    match parts.next() {
        Some(port) => port.parse::<u16>().is_ok(),
        None => true,
    }
}

/// Parse one line. Returns `None` for anything that does not carry the
/// combined-format fields.
#[must_use]
pub fn parse_line(line: &str) -> Option<AccessLogRecord> {
    let remote = line.split_whitespace().next()?.to_string();

    let time_start = line.find('[')? + 1;
    let time_end = line[time_start..].find(']')? + time_start;
    let time = line[time_start..time_end].to_string();
    let timestamp = DateTime::parse_from_str(&time, TIME_FORMAT).ok();

    let quotes = quoted_segments(line);
    if quotes.len() < 3 {
        return None;
    }
    let request = &line[quotes[0].0..quotes[0].1];
    let referer = line[quotes[1].0..quotes[1].1].to_string();
    let ua = line[quotes[2].0..quotes[2].1].to_string();

    let mut request_parts = request.split_whitespace();
    let method = request_parts.next()?.to_string();
    let path = request_parts.next()?.to_string();

    let mut after_request = line[quotes[0].1 + 1..].split_whitespace();
    let status: u16 = after_request.next()?.parse().ok()?;
    let size: u64 = match after_request.next()? {
        "-" => 0,
        s => s.parse().ok()?,
    };

    let upstream = line[quotes[2].1 + 1..]
        .split_whitespace()
        .map(|t| t.trim_matches('"'))
        .filter(|t| looks_like_upstream(t))
        .next_back()
        .map(str::to_string);

    Some(AccessLogRecord {
        remote,
        time,
        method,
        path,
        status,
        size,
        referer,
        ua,
        upstream,
        timestamp,
    })
}

/// True when `line` carries `ip` (optionally `ip:port`) as a standalone
/// upstream token, not as a prefix of a longer address.
#[must_use]
pub fn matches_upstream(line: &str, ip: &str) -> bool {
    let mut search_from = 0;
    while let Some(rel) = line[search_from..].find(ip) {
        let start = search_from + rel;
        let end = start + ip.len();
        search_from = end;

        let before_ok = start == 0
            || !matches!(line.as_bytes()[start - 1], b'0'..=b'9' | b'.');
        if !before_ok {
            continue;
        }
        match line.as_bytes().get(end) {
            None => return true,
            Some(b':') => {
                if line.as_bytes().get(end + 1).is_some_and(u8::is_ascii_digit) {
                    return true;
                }
            }
            Some(b) if !matches!(b, b'0'..=b'9' | b'.') => return true,
            Some(_) => {}
        }
    }
    false
}

/// Supported aggregation windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatsRange {
    Hour1,
    Hour6,
    Day1,
    Day3,
    Week1,
    Month1,
}

impl StatsRange {
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "1h" => Some(Self::Hour1),
            "6h" => Some(Self::Hour6),
            "1day" => Some(Self::Day1),
            "3day" => Some(Self::Day3),
            "1week" => Some(Self::Week1),
            "1month" => Some(Self::Month1),
            _ => None,
        }
    }

    #[must_use]
    pub fn window(self) -> Duration {
        match self {
            Self::Hour1 => Duration::hours(1),
            Self::Hour6 => Duration::hours(6),
            Self::Day1 => Duration::days(1),
            Self::Day3 => Duration::days(3),
            Self::Week1 => Duration::weeks(1),
            Self::Month1 => Duration::days(30),
        }
    }

    #[must_use]
    pub fn bucket(self) -> Duration {
        match self {
            Self::Hour1 => Duration::minutes(5),
            Self::Hour6 => Duration::minutes(30),
            Self::Day1 => Duration::hours(2),
            Self::Day3 => Duration::hours(6),
            Self::Week1 => Duration::days(1),
            Self::Month1 => Duration::weeks(1),
        }
    }

    #[must_use]
    pub fn bucket_count(self) -> usize {
        let window = self.window().num_seconds();
        let bucket = self.bucket().num_seconds();
        ((window + bucket - 1) / bucket) as usize
    }

    fn label_format(self) -> &'static str {
        match self {
            Self::Hour1 | Self::Hour6 => "%H:%M",
            Self::Day1 | Self::Day3 => "%m-%d %H:%M",
            Self::Week1 | Self::Month1 => "%m-%d",
        }
    }

    /// Human labels for each bucket, ending at `end`.
    #[must_use]
    pub fn labels(self, end: DateTime<Local>) -> Vec<String> {
        let start = end - self.window();
        (0..self.bucket_count())
            .map(|i| {
                let at = start + self.bucket() * i as i32;
                at.format(self.label_format()).to_string()
            })
            .collect()
    }

    /// Bucket index for `ts` within the window ending at `end`, or `None`
    /// when the timestamp falls outside it.
    #[must_use]
    pub fn bucket_index(
        self,
        end: DateTime<Local>,
        ts: DateTime<FixedOffset>,
    ) -> Option<usize> {
        let start = end - self.window();
        let offset = ts.with_timezone(&Local) - start;
        if offset < Duration::zero() {
            return None;
        }
        let index = (offset.num_seconds() / self.bucket().num_seconds()) as usize;
        if index < self.bucket_count() {
            Some(index)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LINE: &str = "203.0.113.7 - - [12/Jul/2026:10:01:22 +0000] \"GET /api/items?page=2 HTTP/1.1\" 200 512 \"https://app.example.com/\" \"Mozilla/5.0\" 172.28.0.5:8080";

    #[test]
    fn test_parse_combined_line() {
        let record = parse_line(LINE).unwrap();
        assert_eq!(record.remote, "203.0.113.7");
        assert_eq!(record.method, "GET");
        assert_eq!(record.path, "/api/items?page=2");
        assert_eq!(record.status, 200);
        assert_eq!(record.size, 512);
        assert_eq!(record.referer, "https://app.example.com/");
        assert_eq!(record.ua, "Mozilla/5.0");
        assert_eq!(record.upstream.as_deref(), Some("172.28.0.5:8080"));
        assert_eq!(record.upstream_ip(), Some("172.28.0.5".parse().unwrap()));
        assert!(record.timestamp.is_some());
    }

    #[test]
    fn test_parse_dash_size_and_no_upstream() {
        let line = "10.0.0.1 - - [12/Jul/2026:10:01:22 +0000] \"HEAD / HTTP/1.1\" 304 - \"-\" \"curl/8.0\" -";
        let record = parse_line(line).unwrap();
        assert_eq!(record.size, 0);
        assert_eq!(record.upstream, None);
    }

    #[test]
    fn test_parse_garbage_is_none() {
        assert!(parse_line("not an access log line").is_none());
        assert!(parse_line("").is_none());
    }

    #[test]
    fn test_matches_upstream_boundaries() {
        assert!(matches_upstream(LINE, "172.28.0.5"));
        // .50 must not match a filter for .5
        let other = LINE.replace("172.28.0.5:8080", "172.28.0.50:8080");
        assert!(!matches_upstream(&other, "172.28.0.5"));
        // bare ip without port
        let bare = LINE.replace("172.28.0.5:8080", "172.28.0.5");
        assert!(matches_upstream(&bare, "172.28.0.5"));
    }

    #[test]
    fn test_range_parse_and_buckets() {
        assert_eq!(StatsRange::parse("1h"), Some(StatsRange::Hour1));
        assert_eq!(StatsRange::parse("1month"), Some(StatsRange::Month1));
        assert_eq!(StatsRange::parse("2h"), None);
        assert_eq!(StatsRange::Hour1.bucket_count(), 12);
        assert_eq!(StatsRange::Day1.bucket_count(), 12);
        assert_eq!(StatsRange::Week1.bucket_count(), 7);
        assert_eq!(StatsRange::Month1.bucket_count(), 5);
    }

    #[test]
    fn test_bucket_index_window() {
        let end = Local::now();
        let range = StatsRange::Hour1;
        let inside = (end - Duration::minutes(7)).fixed_offset();
        let outside = (end - Duration::hours(2)).fixed_offset();
        assert_eq!(range.bucket_index(end, inside), Some(10));
        assert_eq!(range.bucket_index(end, outside), None);
        let labels = range.labels(end);
        assert_eq!(labels.len(), 12);
    }
}
