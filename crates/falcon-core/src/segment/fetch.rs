//! Default range fetch used by segment workers.

use super::Segment;
use crate::error::{EngineError, Result};
use crate::http::{self, ByteRange};
use crate::options::DownloadOptions;
use crate::speed::SpeedLimiter;
use crate::storage;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Everything a worker hands to the fetch procedure for one attempt.
pub struct SegmentFetch<'a> {
    pub url: &'a str,
    pub segment: &'a Segment,
    pub part_path: &'a Path,
    /// Cancel/pause signal; polled between reads.
    pub stop: &'a AtomicBool,
}

/// Fetch procedure for one segment attempt. The engine installs
/// `default_fetch`; tests may substitute their own.
pub type SegmentFetchFn = Arc<dyn Fn(&SegmentFetch<'_>) -> Result<()> + Send + Sync>;

/// Build the production fetch: blocking range GET appended to the part file,
/// resuming from whatever the part already holds.
pub fn default_fetch(
    options: DownloadOptions,
    limiters: Vec<Arc<SpeedLimiter>>,
) -> SegmentFetchFn {
    Arc::new(move |fetch: &SegmentFetch<'_>| fetch_into_part(fetch, &options, &limiters))
}

fn fetch_into_part(
    fetch: &SegmentFetch<'_>,
    options: &DownloadOptions,
    limiters: &[Arc<SpeedLimiter>],
) -> Result<()> {
    let segment = fetch.segment;
    let existing = prepare_part(fetch.part_path, segment)?;
    segment.downloaded.store(existing, Ordering::Relaxed);
    if existing == segment.len() {
        return Ok(());
    }

    let mut file = OpenOptions::new()
        .append(true)
        .create(true)
        .open(fetch.part_path)?;
    let range = ByteRange {
        start: segment.start + existing,
        end: Some(segment.end),
    };

    let restart = &segment.restart;
    let mut sink = |data: &[u8]| -> Result<()> {
        if restart.load(Ordering::Relaxed) {
            // Interrupted by the slow-connection watchdog; the worker clears
            // the flag and re-issues the range from the current offset.
            return Err(EngineError::Timeout(std::time::Duration::ZERO));
        }
        file.write_all(data)?;
        segment
            .downloaded
            .fetch_add(data.len() as u64, Ordering::Relaxed);
        Ok(())
    };
    http::fetch_range(fetch.url, Some(range), options, fetch.stop, limiters, &mut sink)?;
    file.flush()?;

    let got = segment.downloaded.load(Ordering::Relaxed);
    if got != segment.len() {
        return Err(EngineError::PartialTransfer {
            expected: segment.len(),
            received: got,
        });
    }
    Ok(())
}

/// Existing usable bytes in the part file. A part longer than the segment
/// (stale layout from an earlier run) is truncated back to the segment size.
fn prepare_part(part_path: &Path, segment: &Segment) -> Result<u64> {
    let len = match std::fs::metadata(part_path) {
        Ok(m) => m.len(),
        Err(_) => return Ok(0),
    };
    if len > segment.len() {
        let file = OpenOptions::new().write(true).open(part_path)?;
        file.set_len(segment.len())?;
        return Ok(segment.len());
    }
    Ok(len)
}

/// Seed segment progress counters from part files left by a previous run.
/// Oversized parts (stale segment layout) are cut back so the merge sees
/// exactly the planned bytes. Returns the total number of resumed bytes.
pub fn seed_from_parts(final_path: &Path, segments: &[Arc<Segment>]) -> u64 {
    let mut resumed = 0;
    for segment in segments {
        let part = storage::part_path(final_path, segment.index);
        let on_disk = storage::existing_part_len(final_path, segment.index);
        if on_disk > segment.len() {
            if let Ok(file) = OpenOptions::new().write(true).open(&part) {
                let _ = file.set_len(segment.len());
            }
        }
        let existing = on_disk.min(segment.len());
        segment.downloaded.store(existing, Ordering::Relaxed);
        if existing == segment.len() {
            segment.completed.store(true, Ordering::Relaxed);
        }
        resumed += existing;
    }
    resumed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::{plan_segments, SegmentConfig};

    #[test]
    fn prepare_part_truncates_oversized() {
        let dir = tempfile::tempdir().unwrap();
        let part = dir.path().join("f.part.0");
        std::fs::write(&part, vec![7u8; 500]).unwrap();
        let seg = {
            let mut cfg = SegmentConfig::default();
            cfg.min_file_size = 0;
            cfg.num_connections = 1;
            plan_segments(100, &cfg).remove(0)
        };
        let existing = prepare_part(&part, &seg).unwrap();
        assert_eq!(existing, 100);
        assert_eq!(std::fs::metadata(&part).unwrap().len(), 100);
    }

    #[test]
    fn seed_from_parts_marks_complete_segments() {
        let dir = tempfile::tempdir().unwrap();
        let final_path = dir.path().join("out.bin");
        let mut cfg = SegmentConfig::default();
        cfg.min_file_size = 0;
        cfg.num_connections = 2;
        cfg.min_segment_size = 1;
        let segments: Vec<Arc<Segment>> =
            plan_segments(200, &cfg).into_iter().map(Arc::new).collect();
        assert_eq!(segments.len(), 2);

        // Segment 0 fully present, segment 1 half present.
        std::fs::write(storage::part_path(&final_path, 0), vec![1u8; 100]).unwrap();
        std::fs::write(storage::part_path(&final_path, 1), vec![2u8; 50]).unwrap();

        let resumed = seed_from_parts(&final_path, &segments);
        assert_eq!(resumed, 150);
        assert!(segments[0].completed.load(Ordering::Relaxed));
        assert!(!segments[1].completed.load(Ordering::Relaxed));
        assert_eq!(segments[1].downloaded.load(Ordering::Relaxed), 50);
    }
}
