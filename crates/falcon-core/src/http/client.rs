//! Blocking HTTP client for segment workers and out-of-band fetches.
//!
//! Segment workers run on their own OS threads, so they use ordinary blocking
//! sockets with read/write timeouts instead of the scheduler's suspension
//! machinery. The wire behavior (headers, ranges, chunked framing, redirects)
//! is shared with the event-driven path through the sibling modules.

use super::chunked::ChunkedDecoder;
use super::request::{build_connect, build_get, ByteRange};
use super::response::{find_header_terminator, HttpResponse};
use super::{parse_url, resolve_redirect, UrlParts};
use crate::error::EngineError;
use crate::net::tls;
use crate::options::DownloadOptions;
use crate::speed::SpeedLimiter;
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

const MAX_REDIRECTS: usize = 10;
const MAX_HEAD: usize = 64 * 1024;
const BUF_SIZE: usize = 64 * 1024;

/// Streaming body consumer. Called with each decoded payload slice.
pub type FetchSink<'a> = &'a mut dyn FnMut(&[u8]) -> Result<(), EngineError>;

enum Stream {
    Plain(TcpStream),
    Tls(Box<rustls::StreamOwned<rustls::ClientConnection, TcpStream>>),
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Stream::Plain(s) => s.read(buf),
            Stream::Tls(s) => s.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            Stream::Plain(s) => s.write(buf),
            Stream::Tls(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Stream::Plain(s) => s.flush(),
            Stream::Tls(s) => s.flush(),
        }
    }
}

fn net_err(context: &str, e: std::io::Error) -> EngineError {
    if e.kind() == std::io::ErrorKind::TimedOut || e.kind() == std::io::ErrorKind::WouldBlock {
        EngineError::Timeout(Duration::ZERO)
    } else {
        EngineError::Network(format!("{context}: {e}"))
    }
}

fn connect_tcp(host: &str, port: u16, timeout: Duration) -> Result<TcpStream, EngineError> {
    let addrs: Vec<_> = (host, port)
        .to_socket_addrs()
        .map_err(|e| EngineError::Network(format!("resolve {host}: {e}")))?
        .collect();
    let mut last = None;
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(s) => return Ok(s),
            Err(e) => last = Some(e),
        }
    }
    Err(match last {
        Some(e) => net_err(&format!("connect {host}:{port}"), e),
        None => EngineError::Network(format!("no addresses for {host}")),
    })
}

/// Open a stream to the target, via the proxy when configured, wrapping in
/// TLS for https targets.
fn open_stream(parts: &UrlParts, options: &DownloadOptions) -> Result<Stream, EngineError> {
    let timeout = Duration::from_secs(options.timeout_seconds.max(1));
    let proxy = if options.proxy.is_empty() {
        None
    } else {
        Some(parse_url(&options.proxy)?)
    };

    let (connect_host, connect_port) = match &proxy {
        Some(p) => (p.host.clone(), p.port),
        None => (parts.host.clone(), parts.port),
    };
    let tcp = connect_tcp(&connect_host, connect_port, timeout)?;
    tcp.set_read_timeout(Some(timeout))
        .map_err(|e| net_err("set read timeout", e))?;
    tcp.set_write_timeout(Some(timeout))
        .map_err(|e| net_err("set write timeout", e))?;

    if let (Some(p), true) = (&proxy, parts.https) {
        // Tunnel TLS through the proxy before the handshake.
        let creds = proxy_credentials(p);
        let mut tcp = tcp;
        let req = build_connect(parts, options, creds).build();
        tcp.write_all(&req).map_err(|e| net_err("proxy CONNECT", e))?;
        let (head, _leftover) = read_head(&mut tcp)?;
        let response = HttpResponse::parse(&head)?;
        if response.status != 200 {
            return Err(EngineError::HttpStatus {
                status: response.status,
                reason: format!("proxy CONNECT refused: {}", response.reason),
            });
        }
        let stream = tls::blocking_stream(&parts.host, options.verify_ssl, tcp)?;
        return Ok(Stream::Tls(Box::new(stream)));
    }

    if parts.https {
        let stream = tls::blocking_stream(&parts.host, options.verify_ssl, tcp)?;
        Ok(Stream::Tls(Box::new(stream)))
    } else {
        Ok(Stream::Plain(tcp))
    }
}

fn proxy_credentials(proxy: &UrlParts) -> Option<(&str, &str)> {
    if proxy.username.is_empty() {
        None
    } else {
        Some((proxy.username.as_str(), proxy.password.as_str()))
    }
}

/// Read until the header terminator; returns (head, leftover body bytes).
fn read_head(stream: &mut impl Read) -> Result<(Vec<u8>, Vec<u8>), EngineError> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 4096];
    loop {
        if let Some(end) = find_header_terminator(&buf) {
            let leftover = buf.split_off(end);
            return Ok((buf, leftover));
        }
        if buf.len() > MAX_HEAD {
            return Err(EngineError::Protocol("response head too large".into()));
        }
        let n = stream.read(&mut chunk).map_err(|e| net_err("read headers", e))?;
        if n == 0 {
            return Err(EngineError::Network(
                "connection closed before response headers".into(),
            ));
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

/// Fetch `url`, optionally restricted to an inclusive byte range, streaming
/// the body into `sink`. Follows redirects. Returns the number of payload
/// bytes delivered.
pub fn fetch_range(
    url: &str,
    range: Option<ByteRange>,
    options: &DownloadOptions,
    cancel: &AtomicBool,
    limiters: &[Arc<SpeedLimiter>],
    sink: FetchSink,
) -> Result<u64, EngineError> {
    let mut current = url.to_string();
    for _ in 0..=MAX_REDIRECTS {
        if cancel.load(Ordering::Relaxed) {
            return Err(EngineError::Cancelled);
        }
        let parts = parse_url(&current)?;
        let mut stream = open_stream(&parts, options)?;

        let absolute_form = !options.proxy.is_empty() && !parts.https;
        let proxy_parts = if options.proxy.is_empty() {
            None
        } else {
            Some(parse_url(&options.proxy)?)
        };
        let creds = proxy_parts.as_ref().and_then(proxy_credentials);
        let request = build_get(&parts, options, range, None, absolute_form, creds).build();
        stream
            .write_all(&request)
            .map_err(|e| net_err("send request", e))?;

        let (head, leftover) = read_head(&mut stream)?;
        let response = HttpResponse::parse(&head)?;

        if response.is_redirect() {
            let location = response.location().unwrap_or_default().to_string();
            current = resolve_redirect(&current, &location)?;
            tracing::debug!(to = %current, status = response.status, "following redirect");
            continue;
        }
        if !(200..300).contains(&response.status) {
            return Err(EngineError::HttpStatus {
                status: response.status,
                reason: response.reason.clone(),
            });
        }
        if range.is_some() && response.status != 206 {
            return Err(EngineError::Protocol(format!(
                "server ignored range request (HTTP {})",
                response.status
            )));
        }

        let expected = match range {
            Some(r) => match r.end {
                Some(end) => Some(end - r.start + 1),
                None => response.content_length(),
            },
            None => response.content_length(),
        };
        let delivered = read_body(
            &mut stream,
            &response,
            leftover,
            expected,
            cancel,
            limiters,
            sink,
        )?;
        if let Some(expected) = expected {
            if delivered != expected {
                return Err(EngineError::PartialTransfer {
                    expected,
                    received: delivered,
                });
            }
        }
        return Ok(delivered);
    }
    Err(EngineError::Protocol(format!(
        "redirect limit ({MAX_REDIRECTS}) exceeded for {url}"
    )))
}

fn read_body(
    stream: &mut Stream,
    response: &HttpResponse,
    leftover: Vec<u8>,
    expected: Option<u64>,
    cancel: &AtomicBool,
    limiters: &[Arc<SpeedLimiter>],
    sink: FetchSink,
) -> Result<u64, EngineError> {
    let mut delivered = 0u64;
    let mut deliver = |data: &[u8]| -> Result<(), EngineError> {
        if data.is_empty() {
            return Ok(());
        }
        for limiter in limiters {
            limiter.throttle(data.len() as u64);
        }
        sink(data)
    };

    let mut buf = vec![0u8; BUF_SIZE];
    if response.is_chunked() {
        let mut decoder = ChunkedDecoder::new();
        let mut out = Vec::with_capacity(BUF_SIZE);
        let mut feed = leftover;
        loop {
            if cancel.load(Ordering::Relaxed) {
                return Err(EngineError::Cancelled);
            }
            if !feed.is_empty() {
                out.clear();
                decoder.decode(&feed, &mut out)?;
                deliver(&out)?;
                delivered += out.len() as u64;
                feed.clear();
            }
            if decoder.is_done() {
                return Ok(delivered);
            }
            let n = stream.read(&mut buf).map_err(|e| net_err("read body", e))?;
            if n == 0 {
                return Err(EngineError::Network(
                    "connection closed inside chunked body".into(),
                ));
            }
            feed.extend_from_slice(&buf[..n]);
        }
    }

    // Identity body: exactly `expected` bytes when known, else until EOF.
    let take = match expected {
        Some(exp) => (exp as usize).min(leftover.len()),
        None => leftover.len(),
    };
    deliver(&leftover[..take])?;
    delivered += take as u64;
    loop {
        if cancel.load(Ordering::Relaxed) {
            return Err(EngineError::Cancelled);
        }
        if let Some(expected) = expected {
            if delivered >= expected {
                return Ok(delivered);
            }
        }
        let n = stream.read(&mut buf).map_err(|e| net_err("read body", e))?;
        if n == 0 {
            return Ok(delivered);
        }
        let take = match expected {
            Some(expected) => ((expected - delivered) as usize).min(n),
            None => n,
        };
        deliver(&buf[..take])?;
        delivered += take as u64;
    }
}

/// Fetch a whole (small) resource into memory; used for out-of-band data
/// such as remote hash lists.
pub fn fetch_to_vec(url: &str, options: &DownloadOptions) -> Result<Vec<u8>, EngineError> {
    let cancel = AtomicBool::new(false);
    let mut out = Vec::new();
    let mut sink = |data: &[u8]| {
        out.extend_from_slice(data);
        Ok(())
    };
    fetch_range(url, None, options, &cancel, &[], &mut sink)?;
    Ok(out)
}
