//! Parallel multi-connection download: segment planning, range workers,
//! progress monitoring, and the final merge.

mod downloader;
mod fetch;

pub use downloader::{SegmentDownloader, SegmentState};
pub use fetch::{default_fetch, SegmentFetch, SegmentFetchFn};

use crate::options::DownloadOptions;
use crate::types::Bytes;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

/// Tuning knobs for segmented downloads, derived from `DownloadOptions`.
#[derive(Debug, Clone)]
pub struct SegmentConfig {
    /// Requested number of parallel connections.
    pub num_connections: usize,
    /// Files are not split below this segment size.
    pub min_segment_size: u64,
    /// Upper bound on one segment's size.
    pub max_segment_size: u64,
    /// Files smaller than this are downloaded over a single connection.
    pub min_file_size: u64,
    /// Retry attempts per segment.
    pub max_retries: u32,
    /// Progress aggregation interval in milliseconds.
    pub progress_interval_ms: u64,
    /// Restart a connection slower than this (bytes/s; 0 disables).
    pub slow_speed_threshold: u64,
    /// How long a connection may stay below the threshold.
    pub slow_timeout_secs: u64,
}

impl SegmentConfig {
    pub fn from_options(options: &DownloadOptions) -> Self {
        Self {
            num_connections: options.max_connections.max(1),
            min_segment_size: options.min_segment_size.max(1),
            max_segment_size: 16 * 1024 * 1024,
            min_file_size: options.min_segment_size.saturating_mul(2),
            max_retries: options.max_retries,
            progress_interval_ms: options.progress_interval_ms.max(50),
            slow_speed_threshold: 1024,
            slow_timeout_secs: 30,
        }
    }
}

impl Default for SegmentConfig {
    fn default() -> Self {
        Self::from_options(&DownloadOptions::default())
    }
}

/// One contiguous byte range of the output file, inclusive on both ends.
/// Workers communicate progress through the atomic fields.
#[derive(Debug)]
pub struct Segment {
    pub index: usize,
    pub start: Bytes,
    pub end: Bytes,
    pub downloaded: AtomicU64,
    pub completed: AtomicBool,
    pub active: AtomicBool,
    /// Set by the slow-connection watchdog; the worker restarts the range
    /// request from its current offset without spending a retry.
    pub restart: AtomicBool,
    pub attempts: AtomicU32,
}

impl Segment {
    fn new(index: usize, start: Bytes, end: Bytes) -> Self {
        Self {
            index,
            start,
            end,
            downloaded: AtomicU64::new(0),
            completed: AtomicBool::new(false),
            active: AtomicBool::new(false),
            restart: AtomicBool::new(false),
            attempts: AtomicU32::new(0),
        }
    }

    /// Segment length in bytes (inclusive range).
    pub fn len(&self) -> Bytes {
        self.end - self.start + 1
    }

    pub fn remaining(&self) -> Bytes {
        self.len().saturating_sub(self.downloaded.load(Ordering::Relaxed))
    }
}

/// Number of connections for a file: the configured count, clamped so each
/// segment is at least `min_segment_size`; 1 for small files.
pub fn optimal_segment_count(file_size: Bytes, config: &SegmentConfig) -> usize {
    if file_size < config.min_file_size {
        return 1;
    }
    let by_min = (file_size / config.min_segment_size).max(1) as usize;
    config.num_connections.clamp(1, by_min)
}

/// Split `[0, file_size)` into disjoint inclusive ranges. All segments get
/// `file_size / n` bytes; remainder bytes go to the last segment. Segment
/// count grows beyond `n` only to honor `max_segment_size`.
pub fn plan_segments(file_size: Bytes, config: &SegmentConfig) -> Vec<Segment> {
    if file_size == 0 {
        return Vec::new();
    }
    let mut n = optimal_segment_count(file_size, config) as u64;
    // Respect the per-segment ceiling.
    let min_count = file_size.div_ceil(config.max_segment_size);
    n = n.max(min_count).min(file_size);

    let base = file_size / n;
    let mut out = Vec::with_capacity(n as usize);
    for i in 0..n {
        let start = i * base;
        let end = if i == n - 1 {
            file_size - 1
        } else {
            start + base - 1
        };
        out.push(Segment::new(i as usize, start, end));
    }
    out
}
