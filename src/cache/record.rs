//! On-disk cache record codec
//!
//! A record is a line-oriented head followed by the raw body:
//!
//! ```text
//! HTTP 200
//! X-Mirrored-From: https://example.com/style.css
//! Content-Type: text/css
//! Content-Length: 17
//! X-Expires: 1767225600000000000
//!
//! body { margin: 0 }
//! ```
//!
//! Headers under the `X-` prefix are internal to the cache and are never
//! forwarded to HTTP clients.

use chrono::{DateTime, TimeZone, Utc};
use std::io::{self, BufRead, BufReader, Read, Write};
use thiserror::Error;
use url::Url;

/// Prefix reserved for cache-internal header keys
pub const INTERNAL_PREFIX: &str = "X-";

/// Absolute URL the record was fetched from
pub const MIRRORED_FROM: &str = "X-Mirrored-From";

/// Expiry timestamp, nanoseconds since the Unix epoch
pub const EXPIRES: &str = "X-Expires";

/// Set to `1` when the body's links use the cross-host layout
pub const CROSS_HOST: &str = "X-Cross-Host";

/// Errors raised while decoding a record
#[derive(Debug, Error)]
pub enum RecordError {
    #[error("Unreadable record stream: {0}")]
    UnreadableStream(#[source] io::Error),

    #[error("Malformed status line: {0:?}")]
    MalformedStatusLine(String),

    #[error("Malformed header line: {0:?}")]
    MalformedHeaderLine(String),

    #[error("Truncated body: expected {expected} bytes, got {actual}")]
    TruncatedBody { expected: u64, actual: u64 },

    #[error("Bad Content-Length: {0:?}")]
    BadContentLength(String),

    #[error("Bad expiry timestamp: {0:?}")]
    BadExpiry(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Input to the record encoder
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub url: Url,
    pub status: u16,
    pub content_type: Option<String>,
    pub location: Option<String>,
    pub expires: Option<DateTime<Utc>>,
    pub cross_host: bool,
    pub body: Vec<u8>,
}

impl CacheEntry {
    pub fn new(url: Url, status: u16) -> Self {
        Self {
            url,
            status,
            content_type: None,
            location: None,
            expires: None,
            cross_host: false,
            body: Vec::new(),
        }
    }

    /// A 204 record marking a download in flight
    pub fn placeholder(url: Url, expires: DateTime<Utc>) -> Self {
        Self::new(url, 204).with_expires(expires)
    }

    pub fn with_body(mut self, content_type: Option<String>, body: impl Into<Vec<u8>>) -> Self {
        self.content_type = content_type;
        self.body = body.into();
        self
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    pub fn with_expires(mut self, expires: DateTime<Utc>) -> Self {
        self.expires = Some(expires);
        self
    }

    pub fn with_cross_host(mut self, cross_host: bool) -> Self {
        self.cross_host = cross_host;
        self
    }
}

/// Formats an expiry as nanoseconds since the epoch
pub fn encode_expiry(expires: DateTime<Utc>) -> String {
    expires.timestamp_nanos_opt().unwrap_or(i64::MAX).to_string()
}

/// Parses an expiry written by [`encode_expiry`]
pub fn decode_expiry(value: &str) -> Result<DateTime<Utc>, RecordError> {
    let nanos: i64 = value
        .trim()
        .parse()
        .map_err(|_| RecordError::BadExpiry(value.to_string()))?;
    Ok(Utc.timestamp_nanos(nanos))
}

/// Encodes `entry` into `writer`
///
/// Only 2xx records (other than 204) carry a body; 3xx records carry just the
/// `Location`.
pub fn write_record<W: Write + ?Sized>(writer: &mut W, entry: &CacheEntry) -> io::Result<()> {
    writeln!(writer, "HTTP {}", entry.status)?;
    writeln!(writer, "{}: {}", MIRRORED_FROM, entry.url)?;

    let mut body: &[u8] = &[];
    match entry.status {
        204 => {}
        200..=299 => {
            if let Some(content_type) = &entry.content_type {
                writeln!(writer, "Content-Type: {}", single_line(content_type))?;
            }
            writeln!(writer, "Content-Length: {}", entry.body.len())?;
            body = &entry.body;
        }
        300..=399 => {
            if let Some(location) = &entry.location {
                writeln!(writer, "Location: {}", single_line(location))?;
            }
        }
        _ => {}
    }

    if let Some(expires) = entry.expires {
        writeln!(writer, "{}: {}", EXPIRES, encode_expiry(expires))?;
    }
    if entry.cross_host {
        writeln!(writer, "{}: 1", CROSS_HOST)?;
    }

    writeln!(writer)?;
    writer.write_all(body)?;
    writer.flush()
}

/// Encodes `entry` into a byte vector
pub fn encode(entry: &CacheEntry) -> Vec<u8> {
    let mut out = Vec::with_capacity(entry.body.len() + 128);
    // Writing into a Vec cannot fail
    let _ = write_record(&mut out, entry);
    out
}

fn single_line(value: &str) -> &str {
    value.lines().next().unwrap_or_default()
}

/// Decoded status line and headers of a record, in file order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordHead {
    pub status: u16,
    pub headers: Vec<(String, String)>,
}

impl RecordHead {
    /// First value for `key`, compared case-insensitively
    pub fn get(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    /// Headers that may be sent to an HTTP client
    pub fn forwarded(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers
            .iter()
            .filter(|(k, _)| !is_internal(k))
            .map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn expires(&self) -> Result<Option<DateTime<Utc>>, RecordError> {
        self.get(EXPIRES).map(decode_expiry).transpose()
    }

    pub fn content_length(&self) -> Result<Option<u64>, RecordError> {
        self.get("Content-Length")
            .map(|v| {
                v.trim()
                    .parse::<u64>()
                    .map_err(|_| RecordError::BadContentLength(v.to_string()))
            })
            .transpose()
    }

    pub fn is_cross_host(&self) -> bool {
        self.get(CROSS_HOST).is_some_and(|v| v.trim() == "1")
    }

    pub fn mirrored_from(&self) -> Option<&str> {
        self.get(MIRRORED_FROM)
    }

    /// A 204 with no body: a download is in flight
    pub fn is_placeholder(&self) -> bool {
        self.status == 204 && matches!(self.content_length(), Ok(None) | Ok(Some(0)))
    }
}

fn is_internal(key: &str) -> bool {
    key.get(..INTERNAL_PREFIX.len())
        .is_some_and(|prefix| prefix.eq_ignore_ascii_case(INTERNAL_PREFIX))
}

/// Streaming decoder: the head is parsed on open, the body is read in chunks
pub struct RecordReader<R> {
    inner: BufReader<R>,
    head: RecordHead,
    /// Head lines as read, line endings included
    raw_head: Vec<Vec<u8>>,
    expected: Option<u64>,
    read: u64,
}

impl<R: Read> RecordReader<R> {
    /// Reads and parses the record head
    pub fn open(reader: R) -> Result<Self, RecordError> {
        let mut inner = BufReader::new(reader);

        let mut line = Vec::new();
        inner
            .read_until(b'\n', &mut line)
            .map_err(RecordError::UnreadableStream)?;
        let status = parse_status_line(&line)?;
        let mut raw_head = vec![line.clone()];

        let mut headers = Vec::new();
        loop {
            line.clear();
            if inner.read_until(b'\n', &mut line)? == 0 {
                break;
            }
            raw_head.push(line.clone());
            let text = trim_eol(&line);
            if text.is_empty() {
                break;
            }
            let text = std::str::from_utf8(text)
                .map_err(|_| RecordError::MalformedHeaderLine(lossy(text)))?;
            let (key, value) = text
                .split_once(':')
                .ok_or_else(|| RecordError::MalformedHeaderLine(text.to_string()))?;
            headers.push((key.trim().to_string(), value.trim().to_string()));
        }

        let head = RecordHead { status, headers };
        let expected = head.content_length()?;

        Ok(Self {
            inner,
            head,
            raw_head,
            expected,
            read: 0,
        })
    }

    pub fn head(&self) -> &RecordHead {
        &self.head
    }

    /// Reads the next piece of body into `buf`; `Ok(0)` means the body is done
    pub fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize, RecordError> {
        let limit = match self.expected {
            Some(expected) => {
                let remaining = expected - self.read;
                if remaining == 0 || buf.is_empty() {
                    return Ok(0);
                }
                buf.len().min(usize::try_from(remaining).unwrap_or(usize::MAX))
            }
            None => buf.len(),
        };

        let n = loop {
            match self.inner.read(&mut buf[..limit]) {
                Ok(n) => break n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        };

        if n == 0 {
            if let Some(expected) = self.expected {
                return Err(RecordError::TruncatedBody {
                    expected,
                    actual: self.read,
                });
            }
        }

        self.read += n as u64;
        Ok(n)
    }

    /// Reads the rest of the body into memory
    pub fn read_body(&mut self) -> Result<Vec<u8>, RecordError> {
        let mut body = Vec::new();
        let mut buf = [0u8; 8192];
        loop {
            let n = self.read_chunk(&mut buf)?;
            if n == 0 {
                return Ok(body);
            }
            body.extend_from_slice(&buf[..n]);
        }
    }

    /// Gives back the head bytes as read, with the value of the first `key`
    /// header replaced, and the unread remainder of the stream
    ///
    /// Every other byte of the head is kept, including key spelling, spacing
    /// and line endings. The remainder is not bounded by `Content-Length`.
    pub fn into_patched_head(self, key: &str, value: &str) -> (Vec<u8>, BufReader<R>) {
        let size = self.raw_head.iter().map(Vec::len).sum::<usize>() + value.len();
        let mut out = Vec::with_capacity(size);
        let mut patched = false;

        for (i, line) in self.raw_head.iter().enumerate() {
            match header_value_span(line, key).filter(|_| i > 0 && !patched) {
                Some((start, end)) => {
                    out.extend_from_slice(&line[..start]);
                    out.extend_from_slice(value.as_bytes());
                    out.extend_from_slice(&line[end..]);
                    patched = true;
                }
                None => out.extend_from_slice(line),
            }
        }

        (out, self.inner)
    }
}

/// Byte range of the value in a raw header line, if the line's key is `key`
fn header_value_span(line: &[u8], key: &str) -> Option<(usize, usize)> {
    let text = trim_eol(line);
    let colon = text.iter().position(|&b| b == b':')?;
    if !text[..colon].trim_ascii().eq_ignore_ascii_case(key.as_bytes()) {
        return None;
    }
    let rest = &text[colon + 1..];
    let start = colon + 1 + (rest.len() - rest.trim_ascii_start().len());
    let end = start + text[start..].trim_ascii_end().len();
    Some((start, end))
}

/// Decodes a whole record held in memory
pub fn decode(bytes: &[u8]) -> Result<(RecordHead, Vec<u8>), RecordError> {
    let mut reader = RecordReader::open(bytes)?;
    let body = reader.read_body()?;
    Ok((reader.head, body))
}

fn parse_status_line(line: &[u8]) -> Result<u16, RecordError> {
    let text = trim_eol(line);
    let malformed = || RecordError::MalformedStatusLine(lossy(text));

    let code = text.strip_prefix(b"HTTP ").ok_or_else(malformed)?;
    if code.is_empty() || !code.iter().all(u8::is_ascii_digit) {
        return Err(malformed());
    }
    std::str::from_utf8(code)
        .ok()
        .and_then(|c| c.parse().ok())
        .ok_or_else(malformed)
}

fn trim_eol(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

fn lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}
