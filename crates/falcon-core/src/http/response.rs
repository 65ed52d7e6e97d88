//! HTTP/1.1 response head parsing.

use crate::error::EngineError;

/// Byte offset just past the `\r\n\r\n` header terminator, if present.
pub fn find_header_terminator(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

/// A parsed response head: status line plus headers (names lowercased).
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub reason: String,
    headers: Vec<(String, String)>,
}

impl HttpResponse {
    /// Parse the head bytes (everything up to and including the blank line).
    pub fn parse(head: &[u8]) -> Result<HttpResponse, EngineError> {
        let text = std::str::from_utf8(head)
            .map_err(|_| EngineError::Protocol("response head is not valid UTF-8".into()))?;
        let mut lines = text.split("\r\n");
        let status_line = lines
            .next()
            .ok_or_else(|| EngineError::Protocol("empty response head".into()))?;
        let (status, reason) = parse_status_line(status_line)?;

        let mut headers = Vec::new();
        for line in lines {
            if line.is_empty() {
                break;
            }
            // Obsolete line folding and junk lines are rejected outright.
            let (name, value) = line.split_once(':').ok_or_else(|| {
                EngineError::Protocol(format!("unparseable header line {line:?}"))
            })?;
            headers.push((
                name.trim().to_ascii_lowercase(),
                value.trim().to_string(),
            ));
        }
        Ok(HttpResponse {
            status,
            reason,
            headers,
        })
    }

    /// First header with the given name (case-insensitive).
    pub fn header(&self, name: &str) -> Option<&str> {
        let lower = name.to_ascii_lowercase();
        self.headers
            .iter()
            .find(|(n, _)| *n == lower)
            .map(|(_, v)| v.as_str())
    }

    pub fn content_length(&self) -> Option<u64> {
        self.header("content-length")?.parse().ok()
    }

    pub fn accepts_ranges(&self) -> bool {
        self.header("accept-ranges")
            .map(|v| v.eq_ignore_ascii_case("bytes"))
            .unwrap_or(false)
    }

    pub fn is_chunked(&self) -> bool {
        self.header("transfer-encoding")
            .map(|v| {
                v.split(',')
                    .any(|t| t.trim().eq_ignore_ascii_case("chunked"))
            })
            .unwrap_or(false)
    }

    pub fn location(&self) -> Option<&str> {
        self.header("location")
    }

    pub fn content_type(&self) -> Option<&str> {
        self.header("content-type")
    }

    pub fn content_disposition(&self) -> Option<&str> {
        self.header("content-disposition")
    }

    pub fn etag(&self) -> Option<&str> {
        self.header("etag")
    }

    pub fn last_modified(&self) -> Option<&str> {
        self.header("last-modified")
    }

    /// `Content-Range: bytes start-end/total` → (start, end, total). Total of
    /// `*` yields None.
    pub fn content_range(&self) -> Option<(u64, u64, Option<u64>)> {
        let value = self.header("content-range")?;
        let rest = value.trim().strip_prefix("bytes")?.trim();
        let (range, total) = rest.split_once('/')?;
        let (start, end) = range.split_once('-')?;
        let start = start.trim().parse().ok()?;
        let end = end.trim().parse().ok()?;
        let total = match total.trim() {
            "*" => None,
            t => Some(t.parse().ok()?),
        };
        Some((start, end, total))
    }

    /// A 3xx that carries a Location to follow (304 is not a redirect).
    pub fn is_redirect(&self) -> bool {
        matches!(self.status, 301 | 302 | 303 | 307 | 308) && self.location().is_some()
    }

    /// True when the server will close the connection after this response.
    pub fn connection_close(&self) -> bool {
        self.header("connection")
            .map(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case("close")))
            .unwrap_or(false)
    }
}

fn parse_status_line(line: &str) -> Result<(u16, String), EngineError> {
    let mut it = line.splitn(3, ' ');
    let version = it.next().unwrap_or("");
    if !version.starts_with("HTTP/1.") {
        return Err(EngineError::Protocol(format!(
            "bad status line {line:?}"
        )));
    }
    let status = it
        .next()
        .and_then(|s| s.parse::<u16>().ok())
        .filter(|s| (100..=599).contains(s))
        .ok_or_else(|| EngineError::Protocol(format!("bad status line {line:?}")))?;
    let reason = it.next().unwrap_or("").trim().to_string();
    Ok((status, reason))
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEAD: &[u8] = b"HTTP/1.1 206 Partial Content\r\n\
Content-Length: 100\r\n\
Content-Range: bytes 100-199/1000\r\n\
Accept-Ranges: bytes\r\n\
Content-Type: application/octet-stream\r\n\
ETag: \"v1\"\r\n\
\r\n";

    #[test]
    fn terminator_offset() {
        assert_eq!(find_header_terminator(b"HTTP/1.1 200 OK\r\n\r\nbody"), Some(19));
        assert_eq!(find_header_terminator(b"HTTP/1.1 200 OK\r\nContent-"), None);
    }

    #[test]
    fn parse_full_head() {
        let r = HttpResponse::parse(HEAD).unwrap();
        assert_eq!(r.status, 206);
        assert_eq!(r.reason, "Partial Content");
        assert_eq!(r.content_length(), Some(100));
        assert_eq!(r.content_range(), Some((100, 199, Some(1000))));
        assert!(r.accepts_ranges());
        assert!(!r.is_chunked());
        assert_eq!(r.etag(), Some("\"v1\""));
        assert_eq!(r.content_type(), Some("application/octet-stream"));
    }

    #[test]
    fn header_lookup_is_case_insensitive() {
        let r = HttpResponse::parse(b"HTTP/1.1 200 OK\r\ncOnTeNt-LeNgTh: 5\r\n\r\n").unwrap();
        assert_eq!(r.header("Content-Length"), Some("5"));
        assert_eq!(r.content_length(), Some(5));
    }

    #[test]
    fn chunked_detection() {
        let r =
            HttpResponse::parse(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n").unwrap();
        assert!(r.is_chunked());
        assert_eq!(r.content_length(), None);
    }

    #[test]
    fn redirect_detection() {
        let r = HttpResponse::parse(b"HTTP/1.1 302 Found\r\nLocation: /next\r\n\r\n").unwrap();
        assert!(r.is_redirect());
        assert_eq!(r.location(), Some("/next"));
        let no_loc = HttpResponse::parse(b"HTTP/1.1 302 Found\r\n\r\n").unwrap();
        assert!(!no_loc.is_redirect());
        let not_modified =
            HttpResponse::parse(b"HTTP/1.1 304 Not Modified\r\nLocation: /x\r\n\r\n").unwrap();
        assert!(!not_modified.is_redirect());
    }

    #[test]
    fn content_range_wildcard_total() {
        let r = HttpResponse::parse(
            b"HTTP/1.1 206 Partial Content\r\nContent-Range: bytes 0-9/*\r\n\r\n",
        )
        .unwrap();
        assert_eq!(r.content_range(), Some((0, 9, None)));
    }

    #[test]
    fn connection_close_detection() {
        let r = HttpResponse::parse(b"HTTP/1.1 200 OK\r\nConnection: close\r\n\r\n").unwrap();
        assert!(r.connection_close());
        let r2 = HttpResponse::parse(b"HTTP/1.1 200 OK\r\n\r\n").unwrap();
        assert!(!r2.connection_close());
    }

    #[test]
    fn rejects_garbage() {
        assert!(HttpResponse::parse(b"ICY 200 OK\r\n\r\n").is_err());
        assert!(HttpResponse::parse(b"HTTP/1.1 junk\r\n\r\n").is_err());
        assert!(HttpResponse::parse(b"HTTP/1.1 200 OK\r\nno-colon-line\r\n\r\n").is_err());
    }
}
