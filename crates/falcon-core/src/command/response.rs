//! Response-head handling: redirects, range validation, and the choice
//! between segmented and single-stream download.

use super::download::{BodyMode, DownloadCommand};
use super::initiate::{release_to_pool, InitiateCommand};
use super::{CommandKind, StepContext, StepOutcome, WakeReason, MAX_REDIRECTS};
use crate::error::EngineError;
use crate::http::{self, ChunkedDecoder, HttpResponse};
use crate::net::tls::Transport;
use crate::net::SocketKey;
use crate::poll::interest;
use crate::retry::RetryPolicy;
use crate::segment::{default_fetch, SegmentConfig, SegmentDownloader};
use crate::speed::SpeedLimiter;
use crate::storage;
use crate::types::{FileInfo, TaskId, TaskStatus};
use std::io;
use std::sync::Arc;
use std::time::Duration;

const MAX_HEAD: usize = 64 * 1024;

/// `HttpResponse`: reads and parses the response head, then decides the
/// download strategy.
pub struct ResponseCommand {
    transport: Transport,
    /// URL this request was sent to (base for relative redirects).
    url: String,
    /// Byte offset requested via `Range` (0 = full fetch).
    resume_offset: u64,
    pool_key: SocketKey,
    buf: Vec<u8>,
    finished: bool,
}

impl ResponseCommand {
    pub fn new(
        transport: Transport,
        url: String,
        resume_offset: u64,
        pool_key: SocketKey,
    ) -> Self {
        Self {
            transport,
            url,
            resume_offset,
            pool_key,
            buf: Vec::with_capacity(2048),
            finished: false,
        }
    }

    pub fn step(
        &mut self,
        ctx: &mut StepContext<'_>,
        task_id: TaskId,
        wake: WakeReason,
    ) -> StepOutcome {
        if ctx.interrupted(task_id) || self.finished {
            return StepOutcome::Done;
        }
        if wake == WakeReason::Timeout {
            let timeout = ctx
                .groups
                .find(task_id)
                .map(|g| Duration::from_secs(g.options().timeout_seconds))
                .unwrap_or(Duration::from_secs(30));
            return ctx.fail_or_retry(task_id, EngineError::Timeout(timeout));
        }

        // Accumulate until the blank-line terminator.
        let head_end = loop {
            if let Some(end) = http::find_header_terminator(&self.buf) {
                break end;
            }
            if self.buf.len() > MAX_HEAD {
                return ctx
                    .fail_or_retry(task_id, EngineError::Protocol("response head too large".into()));
            }
            let mut chunk = [0u8; 8192];
            match self.transport.read(&mut chunk) {
                Ok(0) => {
                    return ctx.fail_or_retry(
                        task_id,
                        EngineError::Network("connection closed before response headers".into()),
                    );
                }
                Ok(n) => self.buf.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    let wanted = if self.transport.is_tls() {
                        self.transport.wanted_interest()
                    } else {
                        interest::READ
                    };
                    return StepOutcome::WaitIo {
                        fd: self.transport.fd(),
                        interest: wanted,
                    };
                }
                Err(e) => {
                    return ctx.fail_or_retry(
                        task_id,
                        EngineError::Network(format!("read response: {e}")),
                    );
                }
            }
        };

        let response = match HttpResponse::parse(&self.buf[..head_end]) {
            Ok(r) => r,
            Err(e) => return ctx.fail_or_retry(task_id, e),
        };
        let leftover = self.buf[head_end..].to_vec();
        self.finished = true;
        tracing::debug!(task_id, status = response.status, url = %self.url, "response head");

        if response.is_redirect() {
            return self.handle_redirect(ctx, task_id, &response, leftover);
        }
        if response.status == 416 {
            return self.handle_already_complete(ctx, task_id);
        }
        if !(200..300).contains(&response.status) {
            return ctx.fail_or_retry(
                task_id,
                EngineError::HttpStatus {
                    status: response.status,
                    reason: response.reason.clone(),
                },
            );
        }
        self.handle_success(ctx, task_id, &response, leftover)
    }

    fn handle_redirect(
        &mut self,
        ctx: &mut StepContext<'_>,
        task_id: TaskId,
        response: &HttpResponse,
        leftover: Vec<u8>,
    ) -> StepOutcome {
        let hops = match ctx.groups.find_mut(task_id) {
            Some(g) => g.bump_redirect_count(),
            None => return StepOutcome::Done,
        };
        if hops > MAX_REDIRECTS {
            return ctx.fail_or_retry(
                task_id,
                EngineError::Protocol(format!("redirect loop (> {MAX_REDIRECTS} hops)")),
            );
        }
        let location = response.location().unwrap_or_default();
        let next_url = match http::resolve_redirect(&self.url, location) {
            Ok(u) => u,
            Err(e) => return ctx.fail_or_retry(task_id, e),
        };
        tracing::info!(task_id, from = %self.url, to = %next_url, status = response.status, "redirect");

        // A bodyless keep-alive response leaves the connection reusable.
        let transport = std::mem::replace(
            &mut self.transport,
            Transport::Plain(dead_socket()),
        );
        if response.content_length() == Some(0)
            && !response.connection_close()
            && leftover.is_empty()
        {
            release_to_pool(ctx, transport, self.pool_key.clone());
        }
        ctx.schedule(
            task_id,
            CommandKind::HttpInitiate(InitiateCommand::new(next_url)),
        );
        StepOutcome::Done
    }

    /// 416 on a resume request: the temp file already holds the whole file.
    fn handle_already_complete(
        &mut self,
        ctx: &mut StepContext<'_>,
        task_id: TaskId,
    ) -> StepOutcome {
        if self.resume_offset == 0 {
            return ctx.fail_or_retry(
                task_id,
                EngineError::Protocol("416 for a request without a range".into()),
            );
        }
        // The resume offset came from an on-disk temp file, so the output
        // path is derivable even on a fresh engine run.
        let path = match ctx.groups.find_mut(task_id) {
            Some(group) => {
                match group.output_path().cloned() {
                    Some(p) => p,
                    None => match group.resolve_output_path(None) {
                        Ok(p) => p,
                        Err(e) => return ctx.fail_or_retry(task_id, e),
                    },
                }
            }
            None => return StepOutcome::Done,
        };
        let tmp = storage::tmp_path(&path);
        if let Err(e) = std::fs::rename(&tmp, &path) {
            return ctx.fail_or_retry(task_id, EngineError::from(e));
        }
        if let Some(task) = ctx.task(task_id) {
            task.set_total_bytes(self.resume_offset);
            task.update_progress(self.resume_offset, self.resume_offset, 0);
        }
        ctx.complete_download(task_id, &path)
    }

    fn handle_success(
        &mut self,
        ctx: &mut StepContext<'_>,
        task_id: TaskId,
        response: &HttpResponse,
        leftover: Vec<u8>,
    ) -> StepOutcome {
        let options = match ctx.groups.find(task_id) {
            Some(g) => g.options().clone(),
            None => return StepOutcome::Done,
        };
        let chunked = response.is_chunked();
        let mut resume_offset = self.resume_offset;

        // Establish the total size and validate any partial response.
        let mut total_size = 0u64;
        if response.status == 206 {
            match response.content_range() {
                Some((start, _end, total)) => {
                    if start != resume_offset {
                        return ctx.fail_or_retry(
                            task_id,
                            EngineError::Protocol(format!(
                                "range mismatch: asked for offset {resume_offset}, got {start}"
                            )),
                        );
                    }
                    total_size = total
                        .or_else(|| response.content_length().map(|cl| cl + start))
                        .unwrap_or(0);
                }
                None => {
                    return ctx.fail_or_retry(
                        task_id,
                        EngineError::Protocol("206 without Content-Range".into()),
                    );
                }
            }
        } else {
            if resume_offset > 0 {
                // Server ignored the range: restart from scratch.
                tracing::info!(task_id, "server ignored resume range, restarting");
                resume_offset = 0;
            }
            total_size = response.content_length().unwrap_or(0);
        }

        let supports_resume = response.accepts_ranges() || response.status == 206;
        let resolved = match ctx.groups.find_mut(task_id) {
            Some(group) => group.resolve_output_path(response.content_disposition()),
            None => return StepOutcome::Done,
        };
        let output_path = match resolved {
            Ok(p) => p,
            Err(e) => return ctx.fail_or_retry(task_id, e),
        };

        let info = FileInfo {
            url: self.url.clone(),
            filename: output_path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            content_type: response.content_type().unwrap_or_default().to_string(),
            total_size,
            supports_resume,
            etag: response.etag().map(str::to_string),
            last_modified: response.last_modified().map(str::to_string),
        };
        if let Some(group) = ctx.groups.find_mut(task_id) {
            group.set_file_info(info.clone());
        }
        let task = match ctx.task(task_id) {
            Some(t) => t,
            None => return StepOutcome::Done,
        };
        task.set_file_info(info);
        if total_size > 0 {
            task.set_total_bytes(total_size);
        }

        // Empty file: nothing to stream.
        if !chunked && response.content_length() == Some(0) && resume_offset == 0 {
            let writer = match storage::SequentialWriter::create(
                &storage::tmp_path(&output_path),
                0,
            ) {
                Ok(w) => w,
                Err(e) => return ctx.fail_or_retry(task_id, e),
            };
            if let Err(e) = writer.finalize(&output_path) {
                return ctx.fail_or_retry(task_id, e);
            }
            task.set_status(TaskStatus::Downloading);
            return ctx.complete_download(task_id, &output_path);
        }

        let task_limiter = if options.speed_limit > 0 {
            Some(Arc::new(SpeedLimiter::new(options.speed_limit)))
        } else {
            None
        };

        // Segmented when the server supports ranges and the file is worth
        // splitting.
        let segmented = response.status == 200
            && !chunked
            && supports_resume
            && total_size >= options.min_segment_size.saturating_mul(2)
            && options.max_connections > 1;
        if segmented {
            task.set_status(TaskStatus::Downloading);
            let mut limiters = vec![Arc::clone(ctx.global_limiter)];
            if let Some(l) = &task_limiter {
                limiters.push(Arc::clone(l));
            }
            limiters.retain(|l| !l.is_unlimited());
            let downloader = SegmentDownloader::new(
                Arc::clone(&task),
                self.url.clone(),
                output_path,
                total_size,
                SegmentConfig::from_options(&options),
                RetryPolicy::from_options(&options),
                options.resume_enabled,
            );
            downloader.start(default_fetch(options, limiters));
            if let Some(group) = ctx.groups.find_mut(task_id) {
                group.set_segment_downloader(downloader);
            }
            // The probe connection is abandoned; its body would duplicate
            // what the range workers fetch.
            return StepOutcome::Done;
        }

        // Single stream over this connection.
        let tmp = storage::tmp_path(&output_path);
        let buf_cap = if ctx.config.enable_disk_cache {
            ctx.config.disk_cache_size
        } else {
            0
        };
        let writer = if resume_offset > 0 {
            storage::SequentialWriter::open_resume(&tmp, buf_cap)
        } else {
            storage::SequentialWriter::create(&tmp, buf_cap)
        };
        let writer = match writer {
            Ok(w) => w,
            Err(e) => return ctx.fail_or_retry(task_id, e),
        };

        let mode = if chunked {
            BodyMode::Chunked {
                decoder: ChunkedDecoder::new(),
            }
        } else {
            match response.content_length() {
                Some(len) => BodyMode::Length { remaining: len },
                None => BodyMode::UntilEof,
            }
        };
        let keep_alive =
            !response.connection_close() && !matches!(mode, BodyMode::UntilEof);

        task.set_status(TaskStatus::Downloading);
        if resume_offset > 0 {
            // The temp file already holds this many bytes; store the
            // absolute counter rather than accumulating across attempts.
            task.update_progress(resume_offset, total_size, 0);
        } else if self.resume_offset > 0 {
            // Asked to resume but the server ignored the range: the counter
            // rewinds along with the restart.
            task.update_progress(0, total_size, 0);
        }
        let transport = std::mem::replace(&mut self.transport, Transport::Plain(dead_socket()));
        ctx.schedule(
            task_id,
            CommandKind::HttpDownload(DownloadCommand::new(
                transport,
                writer,
                mode,
                output_path,
                total_size,
                keep_alive,
                self.pool_key.clone(),
                leftover,
                task_limiter,
            )),
        );
        StepOutcome::Done
    }
}

/// Placeholder socket left behind when the transport moves to the next
/// command.
fn dead_socket() -> crate::net::TcpSocket {
    crate::net::TcpSocket::invalid()
}
