//! Body streaming for a single-connection download.

use super::initiate::release_to_pool;
use super::{StepContext, StepOutcome, WakeReason};
use crate::error::EngineError;
use crate::http::ChunkedDecoder;
use crate::net::tls::Transport;
use crate::net::SocketKey;
use crate::poll::interest;
use crate::speed::SpeedLimiter;
use crate::storage::SequentialWriter;
use crate::task::DownloadTask;
use crate::types::TaskId;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

const READ_BUF: usize = 64 * 1024;
/// Speed sampling window for the task's rate counter.
const SPEED_WINDOW: Duration = Duration::from_millis(1000);

/// How the body ends.
pub enum BodyMode {
    /// Exactly `remaining` more bytes.
    Length { remaining: u64 },
    /// Chunk-framed until the terminating zero chunk.
    Chunked { decoder: ChunkedDecoder },
    /// Until the server closes; resumability is off.
    UntilEof,
}

/// `HttpDownload`: consumes the body, writing at the temp file's current
/// offset, and finalizes the output on completion.
pub struct DownloadCommand {
    transport: Transport,
    writer: Option<SequentialWriter>,
    mode: BodyMode,
    final_path: PathBuf,
    total_size: u64,
    keep_alive: bool,
    pool_key: SocketKey,
    /// Body bytes that arrived with the response head.
    pending: Vec<u8>,
    task_limiter: Option<Arc<SpeedLimiter>>,
    window_start: Instant,
    window_bytes: u64,
}

impl DownloadCommand {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        transport: Transport,
        writer: SequentialWriter,
        mode: BodyMode,
        final_path: PathBuf,
        total_size: u64,
        keep_alive: bool,
        pool_key: SocketKey,
        pending: Vec<u8>,
        task_limiter: Option<Arc<SpeedLimiter>>,
    ) -> Self {
        Self {
            transport,
            writer: Some(writer),
            mode,
            final_path,
            total_size,
            keep_alive,
            pool_key,
            pending,
            task_limiter,
            window_start: Instant::now(),
            window_bytes: 0,
        }
    }

    pub fn step(
        &mut self,
        ctx: &mut StepContext<'_>,
        task_id: TaskId,
        wake: WakeReason,
    ) -> StepOutcome {
        let task = match ctx.task(task_id) {
            Some(t) => t,
            None => return StepOutcome::Done,
        };
        if task.cancel_requested() || task.pause_requested() {
            // Flush so the temp file's length is an honest resume offset.
            self.flush_quietly();
            return StepOutcome::Done;
        }
        if wake == WakeReason::Timeout {
            self.flush_quietly();
            let timeout = ctx
                .groups
                .find(task_id)
                .map(|g| Duration::from_secs(g.options().timeout_seconds))
                .unwrap_or(Duration::from_secs(30));
            return ctx.fail_or_retry(task_id, EngineError::Timeout(timeout));
        }

        // Bytes handed over by the response command come first.
        if !self.pending.is_empty() {
            let pending = std::mem::take(&mut self.pending);
            match self.consume(&task, &pending) {
                Ok(true) => return self.finish(ctx, task_id),
                Ok(false) => {}
                Err(e) => {
                    self.flush_quietly();
                    return ctx.fail_or_retry(task_id, e);
                }
            }
        }

        let mut buf = vec![0u8; READ_BUF];
        loop {
            match self.transport.read(&mut buf) {
                Ok(0) => {
                    return match &self.mode {
                        BodyMode::UntilEof => {
                            self.keep_alive = false;
                            self.finish(ctx, task_id)
                        }
                        BodyMode::Length { remaining } => {
                            let missing = *remaining;
                            self.flush_quietly();
                            ctx.fail_or_retry(
                                task_id,
                                EngineError::Network(format!(
                                    "connection closed with {missing} bytes missing"
                                )),
                            )
                        }
                        BodyMode::Chunked { .. } => {
                            self.flush_quietly();
                            ctx.fail_or_retry(
                                task_id,
                                EngineError::Network(
                                    "connection closed inside chunked body".into(),
                                ),
                            )
                        }
                    };
                }
                Ok(n) => {
                    match self.consume(&task, &buf[..n]) {
                        Ok(true) => return self.finish(ctx, task_id),
                        Ok(false) => {}
                        Err(e) => {
                            self.flush_quietly();
                            return ctx.fail_or_retry(task_id, e);
                        }
                    }
                    // Rate caps: suspend on a timer instead of sleeping.
                    let mut wait = ctx.global_limiter.charge(n as u64);
                    if let Some(limiter) = &self.task_limiter {
                        wait = wait.max(limiter.charge(n as u64));
                    }
                    if !wait.is_zero() {
                        return StepOutcome::Retry {
                            deadline: ctx.now + wait,
                        };
                    }
                }
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
                    self.flush_quietly();
                    return ctx.fail_or_retry(
                        task_id,
                        EngineError::Network(format!("read body: {e}")),
                    );
                }
            }
        }
    }

    /// Decode and write one slice of raw input. Returns true when the body
    /// is complete.
    fn consume(&mut self, task: &Arc<DownloadTask>, data: &[u8]) -> Result<bool, EngineError> {
        let writer = match self.writer.as_mut() {
            Some(w) => w,
            None => return Ok(true),
        };
        let (payload_len, done) = match &mut self.mode {
            BodyMode::Length { remaining } => {
                let take = (*remaining).min(data.len() as u64) as usize;
                writer.write(&data[..take])?;
                *remaining -= take as u64;
                (take as u64, *remaining == 0)
            }
            BodyMode::Chunked { decoder } => {
                let mut out = Vec::with_capacity(data.len());
                decoder.decode(data, &mut out)?;
                writer.write(&out)?;
                (out.len() as u64, decoder.is_done())
            }
            BodyMode::UntilEof => {
                writer.write(data)?;
                (data.len() as u64, false)
            }
        };

        task.add_downloaded(payload_len);
        self.window_bytes += payload_len;
        let elapsed = self.window_start.elapsed();
        if elapsed >= SPEED_WINDOW {
            let speed = (self.window_bytes as f64 / elapsed.as_secs_f64()) as u64;
            task.set_speed(speed);
            self.window_start = Instant::now();
            self.window_bytes = 0;
        }
        Ok(done)
    }

    /// Body complete: verify the byte count, finalize the temp file, return
    /// the connection to the pool, and hand off to completion.
    fn finish(&mut self, ctx: &mut StepContext<'_>, task_id: TaskId) -> StepOutcome {
        let writer = match self.writer.take() {
            Some(w) => w,
            None => return StepOutcome::Done,
        };
        if self.total_size > 0 && writer.written() != self.total_size {
            let received = writer.written();
            drop(writer);
            return ctx.fail_or_retry(
                task_id,
                EngineError::Protocol(format!(
                    "Content-Length mismatch: expected {}, wrote {received}",
                    self.total_size
                )),
            );
        }
        if self.total_size == 0 {
            // Size was unknown until EOF; record what we got.
            if let Some(task) = ctx.task(task_id) {
                task.set_total_bytes(writer.written());
            }
        }
        if let Err(e) = writer.finalize(&self.final_path) {
            return ctx.fail_or_retry(task_id, e);
        }
        if self.keep_alive {
            let transport = std::mem::replace(
                &mut self.transport,
                Transport::Plain(crate::net::TcpSocket::invalid()),
            );
            release_to_pool(ctx, transport, self.pool_key.clone());
        }
        let path = self.final_path.clone();
        ctx.complete_download(task_id, &path)
    }

    fn flush_quietly(&mut self) {
        if let Some(w) = self.writer.as_mut() {
            let _ = w.flush();
        }
    }
}
