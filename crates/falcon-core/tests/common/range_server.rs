//! Minimal HTTP/1.1 server for integration tests: HEAD and Range GET over a
//! static body, plus redirects, chunked bodies, failure injection, and
//! throttling for pause/resume scenarios.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[derive(Debug, Clone, Default)]
pub struct RangeServerOptions {
    /// If false, GET ignores Range and always returns 200 with the full body.
    pub no_ranges: bool,
    /// Serve the body with chunked transfer-encoding (no Content-Length).
    pub chunked: bool,
    /// Respond 302 to this absolute URL instead of serving the body.
    pub redirect_to: Option<String>,
    /// Content-Disposition header value to attach.
    pub content_disposition: Option<String>,
    /// Respond 500 to this many requests before serving normally.
    pub fail_first: usize,
    /// Sleep this long between 8 KiB body writes (throttling).
    pub throttle: Option<Duration>,
}

/// A running test server.
pub struct ServerInfo {
    pub url: String,
    /// Requests seen so far (including failed-on-purpose ones).
    pub requests: Arc<AtomicUsize>,
}

pub fn start(body: Vec<u8>) -> ServerInfo {
    start_with_options(body, RangeServerOptions::default())
}

pub fn start_with_options(body: Vec<u8>, opts: RangeServerOptions) -> ServerInfo {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().unwrap().port();
    let body = Arc::new(body);
    let requests = Arc::new(AtomicUsize::new(0));
    let opts = Arc::new(opts);
    {
        let requests = Arc::clone(&requests);
        thread::spawn(move || {
            for stream in listener.incoming().flatten() {
                let body = Arc::clone(&body);
                let opts = Arc::clone(&opts);
                let requests = Arc::clone(&requests);
                thread::spawn(move || handle(stream, &body, &opts, &requests));
            }
        });
    }
    ServerInfo {
        url: format!("http://127.0.0.1:{}/", port),
        requests,
    }
}

/// A URL nothing listens on (connect refused).
pub fn refused_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    format!("http://127.0.0.1:{}/", port)
}

fn handle(
    mut stream: TcpStream,
    body: &[u8],
    opts: &RangeServerOptions,
    requests: &AtomicUsize,
) {
    let _ = stream.set_read_timeout(Some(Duration::from_secs(5)));
    let _ = stream.set_write_timeout(Some(Duration::from_secs(5)));
    let mut buf = [0u8; 8192];
    let n = match stream.read(&mut buf) {
        Ok(0) | Err(_) => return,
        Ok(n) => n,
    };
    let request = match std::str::from_utf8(&buf[..n]) {
        Ok(s) => s,
        Err(_) => return,
    };
    let (method, range) = parse_request(request);
    let served = requests.fetch_add(1, Ordering::SeqCst);

    if served < opts.fail_first {
        let _ = stream.write_all(
            b"HTTP/1.1 500 Internal Server Error\r\nContent-Length: 0\r\n\r\n",
        );
        return;
    }
    if let Some(target) = &opts.redirect_to {
        let response = format!(
            "HTTP/1.1 302 Found\r\nLocation: {}\r\nContent-Length: 0\r\n\r\n",
            target
        );
        let _ = stream.write_all(response.as_bytes());
        return;
    }

    let total = body.len() as u64;
    let accept_ranges = if opts.no_ranges {
        ""
    } else {
        "Accept-Ranges: bytes\r\n"
    };
    let disposition = match &opts.content_disposition {
        Some(v) => format!("Content-Disposition: {}\r\n", v),
        None => String::new(),
    };

    if method.eq_ignore_ascii_case("HEAD") {
        let response = format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n{}{}\r\n",
            total, accept_ranges, disposition
        );
        let _ = stream.write_all(response.as_bytes());
        return;
    }
    if !method.eq_ignore_ascii_case("GET") {
        let _ = stream.write_all(b"HTTP/1.1 405 Method Not Allowed\r\n\r\n");
        return;
    }

    if opts.chunked {
        let head = format!(
            "HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n{}{}\r\n",
            accept_ranges, disposition
        );
        if stream.write_all(head.as_bytes()).is_err() {
            return;
        }
        for chunk in body.chunks(1024) {
            let frame = format!("{:x}\r\n", chunk.len());
            if stream.write_all(frame.as_bytes()).is_err()
                || stream.write_all(chunk).is_err()
                || stream.write_all(b"\r\n").is_err()
            {
                return;
            }
        }
        let _ = stream.write_all(b"0\r\n\r\n");
        return;
    }

    let (status, content_range, slice) = match range {
        Some((start, end_incl)) if !opts.no_ranges => {
            let start = start.min(total);
            let end_incl = end_incl.min(total.saturating_sub(1));
            if start > end_incl {
                let response = format!(
                    "HTTP/1.1 416 Range Not Satisfiable\r\nContent-Range: bytes */{}\r\nContent-Length: 0\r\n\r\n",
                    total
                );
                let _ = stream.write_all(response.as_bytes());
                return;
            }
            let slice = &body[start as usize..=(end_incl as usize)];
            (
                "206 Partial Content",
                format!("Content-Range: bytes {}-{}/{}\r\n", start, end_incl, total),
                slice,
            )
        }
        _ => ("200 OK", String::new(), body),
    };
    let response = format!(
        "HTTP/1.1 {}\r\nContent-Length: {}\r\n{}{}{}\r\n",
        status,
        slice.len(),
        content_range,
        accept_ranges,
        disposition
    );
    if stream.write_all(response.as_bytes()).is_err() {
        return;
    }
    match opts.throttle {
        Some(delay) => {
            for piece in slice.chunks(8192) {
                if stream.write_all(piece).is_err() {
                    return;
                }
                thread::sleep(delay);
            }
        }
        None => {
            let _ = stream.write_all(slice);
        }
    }
}

/// Returns (method, optional (start, end_inclusive) for `Range: bytes=X-Y`).
fn parse_request(request: &str) -> (&str, Option<(u64, u64)>) {
    let mut method = "";
    let mut range = None;
    for line in request.lines() {
        let line = line.trim();
        if line.is_empty() {
            break;
        }
        if method.is_empty() {
            method = line.split_whitespace().next().unwrap_or("");
            continue;
        }
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("range") {
                let value = value.trim();
                if let Some(part) = value.strip_prefix("bytes=") {
                    if let Some((a, b)) = part.split_once('-') {
                        let start = a.trim().parse::<u64>().unwrap_or(0);
                        let end = b.trim();
                        let end_incl = if end.is_empty() {
                            u64::MAX
                        } else {
                            end.parse::<u64>().unwrap_or(0)
                        };
                        range = Some((start, end_incl));
                    }
                }
            }
        }
    }
    (method, range)
}
