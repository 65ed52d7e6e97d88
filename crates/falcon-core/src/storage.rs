//! On-disk layout and file lifecycle for downloads.
//!
//! A segmented download writes one `<output>.part.<i>` per segment; the merge
//! concatenates them into `<output>.falcon.tmp`, fsyncs, and atomically
//! renames onto the final path. Single-stream downloads write the
//! `.falcon.tmp` file directly. Partial files are the resume state: a re-run
//! re-derives the segment map and picks up where the parts end.

use crate::error::{EngineError, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

/// Suffix of the in-progress final file.
pub const TMP_SUFFIX: &str = ".falcon.tmp";

/// In-progress path for `final_path` (`file.iso` → `file.iso.falcon.tmp`).
pub fn tmp_path(final_path: &Path) -> PathBuf {
    let mut o = final_path.as_os_str().to_owned();
    o.push(TMP_SUFFIX);
    PathBuf::from(o)
}

/// Per-segment temp path (`file.iso` → `file.iso.part.3`).
pub fn part_path(final_path: &Path, index: usize) -> PathBuf {
    let mut o = final_path.as_os_str().to_owned();
    o.push(format!(".part.{index}"));
    PathBuf::from(o)
}

/// Preallocate `size` bytes. On Unix tries `posix_fallocate` for real block
/// allocation; falls back to `set_len` on failure or non-Unix.
pub fn preallocate(file: &File, size: u64) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::io::AsRawFd;
        let fd = file.as_raw_fd();
        let r = unsafe { libc::posix_fallocate(fd, 0, size as libc::off_t) };
        if r == 0 {
            return Ok(());
        }
        tracing::debug!(errno = r, "posix_fallocate failed, falling back to set_len");
    }
    file.set_len(size)?;
    Ok(())
}

/// Buffered sequential writer for a `.falcon.tmp` file.
///
/// Used by the single-stream download path; writes land at a monotonically
/// increasing offset, buffered up to `buf_cap` bytes when the disk cache is
/// enabled (`buf_cap` 0 = unbuffered).
pub struct SequentialWriter {
    file: File,
    path: PathBuf,
    buf: Vec<u8>,
    buf_cap: usize,
    written: u64,
}

impl SequentialWriter {
    /// Create (truncating) the temp file.
    pub fn create(path: &Path, buf_cap: usize) -> Result<Self> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
            buf: Vec::with_capacity(buf_cap),
            buf_cap,
            written: 0,
        })
    }

    /// Open an existing temp file for resume, appending after its current
    /// contents.
    pub fn open_resume(path: &Path, buf_cap: usize) -> Result<Self> {
        let file = OpenOptions::new().append(true).open(path)?;
        let written = file.metadata()?.len();
        Ok(Self {
            file,
            path: path.to_path_buf(),
            buf: Vec::with_capacity(buf_cap),
            buf_cap,
            written,
        })
    }

    /// Total bytes accepted so far (including still-buffered bytes).
    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        if self.buf_cap == 0 {
            self.file.write_all(data)?;
        } else {
            self.buf.extend_from_slice(data);
            if self.buf.len() >= self.buf_cap {
                self.file.write_all(&self.buf)?;
                self.buf.clear();
            }
        }
        self.written += data.len() as u64;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        if !self.buf.is_empty() {
            self.file.write_all(&self.buf)?;
            self.buf.clear();
        }
        self.file.flush()?;
        Ok(())
    }

    /// Flush, fsync, and atomically rename onto `final_path`.
    pub fn finalize(mut self, final_path: &Path) -> Result<()> {
        self.flush()?;
        self.file.sync_all()?;
        drop(self.file);
        fs::rename(&self.path, final_path)?;
        Ok(())
    }
}

/// Size of the part file for segment `index`, or 0 when absent.
pub fn existing_part_len(final_path: &Path, index: usize) -> u64 {
    fs::metadata(part_path(final_path, index))
        .map(|m| m.len())
        .unwrap_or(0)
}

/// Concatenate `count` part files in index order into the temp file, verify
/// the byte count, fsync, rename onto `final_path`, and delete the parts.
pub fn merge_parts(final_path: &Path, count: usize, expected_total: u64) -> Result<()> {
    let tmp = tmp_path(final_path);
    let mut out = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&tmp)?;

    let mut total = 0u64;
    let mut buf = vec![0u8; 256 * 1024];
    for index in 0..count {
        let part = part_path(final_path, index);
        let mut f = File::open(&part)?;
        loop {
            let n = f.read(&mut buf)?;
            if n == 0 {
                break;
            }
            out.write_all(&buf[..n])?;
            total += n as u64;
        }
    }
    if total != expected_total {
        // Leave the parts in place; the temp file is the broken artifact.
        drop(out);
        let _ = fs::remove_file(&tmp);
        return Err(EngineError::PartialTransfer {
            expected: expected_total,
            received: total,
        });
    }

    out.sync_all()?;
    drop(out);
    fs::rename(&tmp, final_path)?;
    for index in 0..count {
        let _ = fs::remove_file(part_path(final_path, index));
    }
    tracing::debug!(path = %final_path.display(), bytes = expected_total, "merged segments");
    Ok(())
}

/// Remove every temp artifact for `final_path` (parts and tmp file).
pub fn remove_temp_files(final_path: &Path, count: usize) {
    let _ = fs::remove_file(tmp_path(final_path));
    for index in 0..count {
        let _ = fs::remove_file(part_path(final_path, index));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_helpers() {
        assert_eq!(
            tmp_path(Path::new("/tmp/file.iso")).to_string_lossy(),
            "/tmp/file.iso.falcon.tmp"
        );
        assert_eq!(
            part_path(Path::new("file.iso"), 3).to_string_lossy(),
            "file.iso.part.3"
        );
    }

    #[test]
    fn sequential_writer_create_write_finalize() {
        let dir = tempfile::tempdir().unwrap();
        let final_path = dir.path().join("out.bin");
        let tp = tmp_path(&final_path);

        let mut w = SequentialWriter::create(&tp, 8).unwrap();
        w.write(b"hello ").unwrap();
        w.write(b"world").unwrap();
        assert_eq!(w.written(), 11);
        w.finalize(&final_path).unwrap();

        assert!(!tp.exists());
        assert_eq!(fs::read(&final_path).unwrap(), b"hello world");
    }

    #[test]
    fn sequential_writer_resume_appends() {
        let dir = tempfile::tempdir().unwrap();
        let final_path = dir.path().join("out.bin");
        let tp = tmp_path(&final_path);
        fs::write(&tp, b"abc").unwrap();

        let mut w = SequentialWriter::open_resume(&tp, 0).unwrap();
        assert_eq!(w.written(), 3);
        w.write(b"def").unwrap();
        w.finalize(&final_path).unwrap();
        assert_eq!(fs::read(&final_path).unwrap(), b"abcdef");
    }

    #[test]
    fn merge_concatenates_in_order_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let final_path = dir.path().join("out.bin");
        fs::write(part_path(&final_path, 0), b"aaaa").unwrap();
        fs::write(part_path(&final_path, 1), b"bb").unwrap();
        fs::write(part_path(&final_path, 2), b"cccccc").unwrap();

        merge_parts(&final_path, 3, 12).unwrap();
        assert_eq!(fs::read(&final_path).unwrap(), b"aaaabbcccccc");
        for i in 0..3 {
            assert!(!part_path(&final_path, i).exists(), "part {i} left behind");
        }
        assert!(!tmp_path(&final_path).exists());
    }

    #[test]
    fn merge_size_mismatch_keeps_parts() {
        let dir = tempfile::tempdir().unwrap();
        let final_path = dir.path().join("out.bin");
        fs::write(part_path(&final_path, 0), b"aaaa").unwrap();
        fs::write(part_path(&final_path, 1), b"b").unwrap(); // short

        let err = merge_parts(&final_path, 2, 8).unwrap_err();
        assert!(matches!(err, EngineError::PartialTransfer { .. }));
        assert!(!final_path.exists());
        assert!(part_path(&final_path, 0).exists());
        assert!(part_path(&final_path, 1).exists());
    }

    #[test]
    fn existing_part_len_absent_is_zero() {
        let dir = tempfile::tempdir().unwrap();
        let final_path = dir.path().join("out.bin");
        assert_eq!(existing_part_len(&final_path, 0), 0);
        fs::write(part_path(&final_path, 0), b"xyz").unwrap();
        assert_eq!(existing_part_len(&final_path, 0), 3);
    }

    #[test]
    fn preallocate_sets_length() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("prealloc.bin");
        let f = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&p)
            .unwrap();
        preallocate(&f, 4096).unwrap();
        assert_eq!(f.metadata().unwrap().len(), 4096);
    }
}
