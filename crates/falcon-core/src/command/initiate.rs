//! Connection setup: URL parse, DNS, pooled or fresh connect, proxy tunnel,
//! TLS handshake, and request write.

use super::response::ResponseCommand;
use super::{CommandKind, StepContext, StepOutcome, WakeReason};
use crate::error::EngineError;
use crate::http::{self, build_connect, build_get, ByteRange, HttpResponse, UrlParts};
use crate::net::tls::Transport;
use crate::net::{PooledSocket, SocketKey, TcpSocket};
use crate::options::DownloadOptions;
use crate::poll::interest;
use crate::storage;
use crate::types::TaskId;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::time::Duration;

enum State {
    Start,
    /// Non-blocking connect in flight; suspended on WRITE.
    Connecting { transport: Transport, parts: UrlParts },
    /// CONNECT tunnel through the proxy for an https target.
    ProxyConnect {
        transport: Transport,
        parts: UrlParts,
        request: Vec<u8>,
        sent: usize,
        buf: Vec<u8>,
    },
    TlsHandshake { transport: Transport, parts: UrlParts },
    SendRequest {
        transport: Transport,
        parts: UrlParts,
        request: Vec<u8>,
        sent: usize,
        resume_offset: u64,
    },
}

/// `HttpInitiate`: everything up to a fully written request.
pub struct InitiateCommand {
    url: String,
    state: State,
}

impl InitiateCommand {
    pub fn new(url: String) -> Self {
        Self {
            url,
            state: State::Start,
        }
    }

    pub fn step(
        &mut self,
        ctx: &mut StepContext<'_>,
        task_id: TaskId,
        wake: WakeReason,
    ) -> StepOutcome {
        if ctx.interrupted(task_id) {
            return StepOutcome::Done;
        }
        let options = match ctx.groups.find(task_id) {
            Some(g) => g.options().clone(),
            None => return StepOutcome::Done,
        };
        if wake == WakeReason::Timeout {
            let timeout = Duration::from_secs(options.timeout_seconds);
            return ctx.fail_or_retry(task_id, EngineError::Timeout(timeout));
        }

        let mut state = std::mem::replace(&mut self.state, State::Start);
        loop {
            state = match state {
                State::Start => match self.begin(ctx, task_id, &options) {
                    Ok(next) => next,
                    Err(outcome) => return outcome,
                },

                State::Connecting { transport, parts } => {
                    let error = match transport {
                        Transport::Plain(ref sock) => sock.take_error(),
                        Transport::Tls { ref sock, .. } => sock.take_error(),
                    };
                    match error {
                        Ok(None) => match self.connected(ctx, task_id, &options, transport, parts)
                        {
                            Ok(next) => next,
                            Err(outcome) => return outcome,
                        },
                        Ok(Some(e)) | Err(e) => {
                            return ctx.fail_or_retry(
                                task_id,
                                EngineError::Network(format!("connect: {e}")),
                            );
                        }
                    }
                }

                State::ProxyConnect {
                    mut transport,
                    parts,
                    request,
                    mut sent,
                    mut buf,
                } => {
                    while sent < request.len() {
                        match transport.write(&request[sent..]) {
                            Ok(n) => sent += n,
                            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                                let fd = transport.fd();
                                self.state = State::ProxyConnect {
                                    transport,
                                    parts,
                                    request,
                                    sent,
                                    buf,
                                };
                                return StepOutcome::WaitIo {
                                    fd,
                                    interest: interest::WRITE,
                                };
                            }
                            Err(e) => {
                                return ctx.fail_or_retry(
                                    task_id,
                                    EngineError::Network(format!("proxy send: {e}")),
                                );
                            }
                        }
                    }
                    // Request fully written: read the tunnel response.
                    let mut chunk = [0u8; 2048];
                    loop {
                        if let Some(end) = http::find_header_terminator(&buf) {
                            let head = &buf[..end];
                            let response = match HttpResponse::parse(head) {
                                Ok(r) => r,
                                Err(e) => return ctx.fail_or_retry(task_id, e),
                            };
                            if response.status != 200 {
                                return ctx.fail_or_retry(
                                    task_id,
                                    EngineError::HttpStatus {
                                        status: response.status,
                                        reason: format!(
                                            "proxy CONNECT refused: {}",
                                            response.reason
                                        ),
                                    },
                                );
                            }
                            let sock = match transport.into_plain_socket() {
                                Some(s) => s,
                                None => unreachable!("tunnel setup is always plain"),
                            };
                            match Transport::start_tls(sock, &parts.host, options.verify_ssl) {
                                Ok(t) => {
                                    break State::TlsHandshake {
                                        transport: t,
                                        parts,
                                    }
                                }
                                Err(e) => return ctx.fail_or_retry(task_id, e),
                            }
                        }
                        match transport.read(&mut chunk) {
                            Ok(0) => {
                                return ctx.fail_or_retry(
                                    task_id,
                                    EngineError::Network(
                                        "proxy closed during CONNECT".into(),
                                    ),
                                );
                            }
                            Ok(n) => buf.extend_from_slice(&chunk[..n]),
                            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                                let fd = transport.fd();
                                self.state = State::ProxyConnect {
                                    transport,
                                    parts,
                                    request,
                                    sent,
                                    buf,
                                };
                                return StepOutcome::WaitIo {
                                    fd,
                                    interest: interest::READ,
                                };
                            }
                            Err(e) => {
                                return ctx.fail_or_retry(
                                    task_id,
                                    EngineError::Network(format!("proxy read: {e}")),
                                );
                            }
                        }
                    }
                }

                State::TlsHandshake {
                    mut transport,
                    parts,
                } => match transport.handshake_step() {
                    Ok(true) => {
                        let (request, resume_offset) =
                            self.prepare_request(ctx, task_id, &options, &parts);
                        State::SendRequest {
                            transport,
                            parts,
                            request,
                            sent: 0,
                            resume_offset,
                        }
                    }
                    Ok(false) => {
                        let fd = transport.fd();
                        let wanted = transport.wanted_interest();
                        self.state = State::TlsHandshake { transport, parts };
                        return StepOutcome::WaitIo {
                            fd,
                            interest: wanted,
                        };
                    }
                    Err(e) => {
                        return ctx.fail_or_retry(
                            task_id,
                            EngineError::Network(format!("TLS handshake: {e}")),
                        );
                    }
                },

                State::SendRequest {
                    mut transport,
                    parts,
                    request,
                    mut sent,
                    resume_offset,
                } => {
                    while sent < request.len() {
                        match transport.write(&request[sent..]) {
                            Ok(n) => sent += n,
                            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                                let fd = transport.fd();
                                self.state = State::SendRequest {
                                    transport,
                                    parts,
                                    request,
                                    sent,
                                    resume_offset,
                                };
                                return StepOutcome::WaitIo {
                                    fd,
                                    interest: interest::WRITE,
                                };
                            }
                            Err(e) => {
                                return ctx.fail_or_retry(
                                    task_id,
                                    EngineError::Network(format!("send request: {e}")),
                                );
                            }
                        }
                    }
                    match transport.flush_write() {
                        Ok(true) => {
                            let key = pool_key(&parts, &options);
                            ctx.schedule(
                                task_id,
                                CommandKind::HttpResponse(ResponseCommand::new(
                                    transport,
                                    self.url.clone(),
                                    resume_offset,
                                    key,
                                )),
                            );
                            return StepOutcome::Done;
                        }
                        Ok(false) => {
                            let fd = transport.fd();
                            self.state = State::SendRequest {
                                transport,
                                parts,
                                request,
                                sent,
                                resume_offset,
                            };
                            return StepOutcome::WaitIo {
                                fd,
                                interest: interest::WRITE,
                            };
                        }
                        Err(e) => {
                            return ctx.fail_or_retry(
                                task_id,
                                EngineError::Network(format!("flush request: {e}")),
                            );
                        }
                    }
                }
            };
        }
    }

    /// First step: parse, resolve, and begin connecting (or reuse a pooled
    /// connection).
    fn begin(
        &mut self,
        ctx: &mut StepContext<'_>,
        task_id: TaskId,
        options: &DownloadOptions,
    ) -> Result<State, StepOutcome> {
        let parts = match http::parse_url(&self.url) {
            Ok(p) => p,
            Err(e) => return Err(ctx.fail_or_retry(task_id, e)),
        };
        let proxy = match parse_proxy(options) {
            Ok(p) => p,
            Err(e) => return Err(ctx.fail_or_retry(task_id, e)),
        };

        // Plain-HTTP targets can reuse an idle pooled connection.
        if !parts.https {
            if let Some(pooled) = ctx.pool.acquire(&pool_key(&parts, options)) {
                let transport = Transport::Plain(pooled.socket);
                let (request, resume_offset) =
                    self.prepare_request(ctx, task_id, options, &parts);
                return Ok(State::SendRequest {
                    transport,
                    parts,
                    request,
                    sent: 0,
                    resume_offset,
                });
            }
        }

        let (connect_host, connect_port) = match &proxy {
            Some(p) => (p.host.clone(), p.port),
            None => (parts.host.clone(), parts.port),
        };
        let addr = match resolve(&connect_host, connect_port) {
            Ok(a) => a,
            Err(e) => {
                // DNS gets one shot per URI; no backoff budget.
                tracing::warn!(task_id, host = %connect_host, error = %e, "resolve failed");
                return Err(ctx.advance_uri_or_fail(task_id, e));
            }
        };
        tracing::debug!(task_id, url = %self.url, addr = %addr, "connecting");
        match TcpSocket::connect(&addr) {
            Ok((sock, in_progress)) => {
                let transport = Transport::Plain(sock);
                if in_progress {
                    let fd = transport.fd();
                    self.state = State::Connecting { transport, parts };
                    Err(StepOutcome::WaitIo {
                        fd,
                        interest: interest::WRITE,
                    })
                } else {
                    self.connected(ctx, task_id, options, transport, parts)
                }
            }
            Err(e) => Err(ctx.fail_or_retry(
                task_id,
                EngineError::Network(format!("connect {connect_host}:{connect_port}: {e}")),
            )),
        }
    }

    /// TCP established: tunnel, handshake, or go straight to the request.
    fn connected(
        &mut self,
        ctx: &mut StepContext<'_>,
        task_id: TaskId,
        options: &DownloadOptions,
        transport: Transport,
        parts: UrlParts,
    ) -> Result<State, StepOutcome> {
        let proxy = match parse_proxy(options) {
            Ok(p) => p,
            Err(e) => return Err(ctx.fail_or_retry(task_id, e)),
        };
        if parts.https {
            if let Some(p) = &proxy {
                let creds = proxy_creds(p);
                let request = build_connect(&parts, options, creds).build();
                return Ok(State::ProxyConnect {
                    transport,
                    parts,
                    request,
                    sent: 0,
                    buf: Vec::new(),
                });
            }
            let sock = match transport.into_plain_socket() {
                Some(s) => s,
                None => unreachable!("fresh connections are plain"),
            };
            match Transport::start_tls(sock, &parts.host, options.verify_ssl) {
                Ok(t) => Ok(State::TlsHandshake {
                    transport: t,
                    parts,
                }),
                Err(e) => Err(ctx.fail_or_retry(task_id, e)),
            }
        } else {
            let (request, resume_offset) = self.prepare_request(ctx, task_id, options, &parts);
            Ok(State::SendRequest {
                transport,
                parts,
                request,
                sent: 0,
                resume_offset,
            })
        }
    }

    /// Build the GET, including a resume `Range` when a partial temp file
    /// from an earlier single-stream run is usable.
    fn prepare_request(
        &self,
        ctx: &StepContext<'_>,
        task_id: TaskId,
        options: &DownloadOptions,
        parts: &UrlParts,
    ) -> (Vec<u8>, u64) {
        let group = ctx.groups.find(task_id);
        let resume_offset = if options.resume_enabled {
            known_output_path(ctx, task_id, options)
                .map(|p| {
                    std::fs::metadata(storage::tmp_path(&p))
                        .map(|m| m.len())
                        .unwrap_or(0)
                })
                .unwrap_or(0)
        } else {
            0
        };
        let if_range = if resume_offset > 0 {
            group.and_then(|g| g.file_info()).and_then(|info| {
                info.etag
                    .clone()
                    .or_else(|| info.last_modified.clone())
            })
        } else {
            None
        };
        let range = if resume_offset > 0 {
            Some(ByteRange {
                start: resume_offset,
                end: None,
            })
        } else {
            None
        };
        let proxy = parse_proxy(options).ok().flatten();
        let absolute_form = proxy.is_some() && !parts.https;
        let creds = proxy.as_ref().and_then(proxy_creds).map(|(u, p)| (u.to_string(), p.to_string()));
        let creds_ref = creds.as_ref().map(|(u, p)| (u.as_str(), p.as_str()));
        let request = build_get(parts, options, range, if_range.as_deref(), absolute_form, creds_ref);
        (request.build(), resume_offset)
    }
}

fn pool_key(parts: &UrlParts, options: &DownloadOptions) -> SocketKey {
    SocketKey {
        host: parts.host.clone(),
        port: parts.port,
        username: parts.username.clone(),
        proxy: options.proxy.clone(),
    }
}

fn parse_proxy(options: &DownloadOptions) -> Result<Option<UrlParts>, EngineError> {
    if options.proxy.is_empty() {
        Ok(None)
    } else {
        http::parse_url(&options.proxy).map(Some)
    }
}

fn proxy_creds(proxy: &UrlParts) -> Option<(&str, &str)> {
    if proxy.username.is_empty() {
        None
    } else {
        Some((proxy.username.as_str(), proxy.password.as_str()))
    }
}

/// Output path when it is already known before any response (explicitly
/// named, or resolved by an earlier attempt).
fn known_output_path(
    ctx: &StepContext<'_>,
    task_id: TaskId,
    options: &DownloadOptions,
) -> Option<PathBuf> {
    if let Some(group) = ctx.groups.find(task_id) {
        if let Some(path) = group.output_path() {
            return Some(path.clone());
        }
    }
    if !options.output_filename.is_empty() {
        return Some(PathBuf::from(&options.output_directory).join(&options.output_filename));
    }
    None
}

/// Synchronous resolution; lookups are cheap relative to the transfers they
/// start, so the loop tolerates the short block.
fn resolve(host: &str, port: u16) -> Result<SocketAddr, EngineError> {
    (host, port)
        .to_socket_addrs()
        .map_err(|e| EngineError::Network(format!("resolve {host}: {e}")))?
        .next()
        .ok_or_else(|| EngineError::Network(format!("no addresses for {host}")))
}

/// Reinsert a finished connection into the pool for reuse.
pub(super) fn release_to_pool(ctx: &StepContext<'_>, transport: Transport, key: SocketKey) {
    if let Some(sock) = transport.into_plain_socket() {
        if let Ok(()) = sock.set_nonblocking(true) {
            ctx.pool.release(PooledSocket::new(sock, key));
        }
    }
}
