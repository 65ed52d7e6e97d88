//! Incremental transfer: fetch only the byte ranges that changed.
//!
//! The local file is cut into fixed-size chunks and hashed; the remote side
//! publishes the same list out-of-band. Comparing the two yields the ranges
//! to fetch. The hash-list wire format is line-delimited ASCII, one chunk per
//! line: `offset,size,hash`.

use crate::error::{EngineError, Result};
use crate::hash::{calculate_buffer, HashAlgorithm};
use crate::http::{self, ByteRange};
use crate::options::DownloadOptions;
use std::fs::{File, OpenOptions};
use std::io::Read;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::atomic::AtomicBool;

/// One fixed-size chunk of a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkInfo {
    pub offset: u64,
    pub size: u64,
    /// Lowercase hex digest of the chunk's bytes.
    pub hash: String,
}

/// Outcome of comparing local and remote hash lists.
#[derive(Debug, Clone)]
pub struct FileDiff {
    pub local_size: u64,
    pub remote_size: u64,
    /// Remote chunks that must be fetched.
    pub changed: Vec<ChunkInfo>,
    pub total_changed: u64,
    /// Changed fraction of the remote file in [0.0, 1.0].
    pub ratio: f64,
}

/// Hash a local file in `chunk_size` slices (last slice may be shorter).
pub fn generate_hash_list(
    path: &Path,
    chunk_size: u64,
    algorithm: HashAlgorithm,
) -> Result<Vec<ChunkInfo>> {
    if chunk_size == 0 {
        return Err(EngineError::InvalidInput("chunk size must be non-zero".into()));
    }
    let mut f = File::open(path)?;
    let mut chunks = Vec::new();
    let mut buf = vec![0u8; chunk_size as usize];
    let mut offset = 0u64;
    loop {
        let mut filled = 0;
        while filled < buf.len() {
            let n = f.read(&mut buf[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        if filled == 0 {
            break;
        }
        chunks.push(ChunkInfo {
            offset,
            size: filled as u64,
            hash: calculate_buffer(&buf[..filled], algorithm),
        });
        offset += filled as u64;
        if filled < buf.len() {
            break;
        }
    }
    Ok(chunks)
}

/// Serialize a hash list to the line format.
pub fn format_hash_list(chunks: &[ChunkInfo]) -> String {
    let mut out = String::new();
    for c in chunks {
        out.push_str(&format!("{},{},{}\n", c.offset, c.size, c.hash));
    }
    out
}

/// Parse the line format; malformed lines are protocol errors.
pub fn parse_hash_list(data: &str) -> Result<Vec<ChunkInfo>> {
    let mut chunks = Vec::new();
    for (lineno, line) in data.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut fields = line.split(',');
        let parse = |field: Option<&str>| -> Option<u64> { field?.trim().parse().ok() };
        let offset = parse(fields.next());
        let size = parse(fields.next());
        let hash = fields.next().map(|h| h.trim().to_string());
        match (offset, size, hash) {
            (Some(offset), Some(size), Some(hash)) if !hash.is_empty() && size > 0 => {
                chunks.push(ChunkInfo { offset, size, hash })
            }
            _ => {
                return Err(EngineError::Protocol(format!(
                    "bad hash list line {}: {line:?}",
                    lineno + 1
                )))
            }
        }
    }
    Ok(chunks)
}

/// Fetch and parse the remote hash list from an out-of-band endpoint.
pub fn download_remote_hash_list(url: &str, options: &DownloadOptions) -> Result<Vec<ChunkInfo>> {
    let body = http::fetch_to_vec(url, options)?;
    let text = String::from_utf8(body)
        .map_err(|_| EngineError::Protocol("hash list is not UTF-8".into()))?;
    parse_hash_list(&text)
}

/// Remote chunks whose hash differs from the local one, or which lie beyond
/// the end of the local file.
pub fn compare(local: &[ChunkInfo], remote: &[ChunkInfo]) -> FileDiff {
    let local_size: u64 = local.iter().map(|c| c.size).sum();
    let remote_size: u64 = remote.iter().map(|c| c.size).sum();

    let changed: Vec<ChunkInfo> = remote
        .iter()
        .filter(|r| {
            match local.iter().find(|l| l.offset == r.offset) {
                Some(l) => l.size != r.size || !l.hash.eq_ignore_ascii_case(&r.hash),
                None => true, // beyond local EOF (or local layout differs)
            }
        })
        .cloned()
        .collect();

    let total_changed: u64 = changed.iter().map(|c| c.size).sum();
    FileDiff {
        local_size,
        remote_size,
        changed,
        total_changed,
        ratio: if remote_size > 0 {
            total_changed as f64 / remote_size as f64
        } else {
            0.0
        },
    }
}

/// Write fetched chunk bytes at their offsets and resize the file to the
/// remote size.
pub fn apply_patch(path: &Path, fetched: &[(ChunkInfo, Vec<u8>)], diff: &FileDiff) -> Result<()> {
    let file = OpenOptions::new().read(true).write(true).create(true).open(path)?;
    for (chunk, data) in fetched {
        if data.len() as u64 != chunk.size {
            return Err(EngineError::PartialTransfer {
                expected: chunk.size,
                received: data.len() as u64,
            });
        }
        file.write_all_at(data, chunk.offset)?;
    }
    file.set_len(diff.remote_size)?;
    file.sync_all()?;
    Ok(())
}

/// Fetch every changed chunk of `diff` from `url` and patch `path` in place.
pub fn download_changed(
    url: &str,
    path: &Path,
    diff: &FileDiff,
    options: &DownloadOptions,
) -> Result<u64> {
    let cancel = AtomicBool::new(false);
    let mut fetched = Vec::with_capacity(diff.changed.len());
    for chunk in &diff.changed {
        let mut data = Vec::with_capacity(chunk.size as usize);
        let mut sink = |bytes: &[u8]| {
            data.extend_from_slice(bytes);
            Ok(())
        };
        let range = ByteRange {
            start: chunk.offset,
            end: Some(chunk.offset + chunk.size - 1),
        };
        http::fetch_range(url, Some(range), options, &cancel, &[], &mut sink)?;
        fetched.push((chunk.clone(), data));
    }
    apply_patch(path, &fetched, diff)?;
    Ok(diff.total_changed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_temp(content: &[u8]) -> tempfile::NamedTempFile {
        use std::io::Write;
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(content).unwrap();
        f.flush().unwrap();
        f
    }

    #[test]
    fn hash_list_covers_file_with_short_tail() {
        let f = write_temp(&[7u8; 2500]);
        let chunks = generate_hash_list(f.path(), 1000, HashAlgorithm::Sha256).unwrap();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].offset, 0);
        assert_eq!(chunks[1].offset, 1000);
        assert_eq!(chunks[2].offset, 2000);
        assert_eq!(chunks[2].size, 500);
        // Identical content, identical chunk hashes.
        assert_eq!(chunks[0].hash, chunks[1].hash);
        assert_ne!(chunks[0].hash, chunks[2].hash);
    }

    #[test]
    fn line_format_roundtrip() {
        let f = write_temp(b"0123456789abcdef");
        let chunks = generate_hash_list(f.path(), 8, HashAlgorithm::Sha1).unwrap();
        let text = format_hash_list(&chunks);
        let parsed = parse_hash_list(&text).unwrap();
        assert_eq!(parsed, chunks);
    }

    #[test]
    fn parse_rejects_malformed_lines() {
        assert!(parse_hash_list("1,2\n").is_err());
        assert!(parse_hash_list("a,b,c\n").is_err());
        assert!(parse_hash_list("0,0,abc\n").is_err());
        assert!(parse_hash_list("").unwrap().is_empty());
    }

    #[test]
    fn compare_flags_changed_and_appended_chunks() {
        let local = vec![
            ChunkInfo { offset: 0, size: 10, hash: "aa".into() },
            ChunkInfo { offset: 10, size: 10, hash: "bb".into() },
        ];
        let remote = vec![
            ChunkInfo { offset: 0, size: 10, hash: "aa".into() },
            ChunkInfo { offset: 10, size: 10, hash: "XX".into() },
            ChunkInfo { offset: 20, size: 5, hash: "cc".into() },
        ];
        let diff = compare(&local, &remote);
        assert_eq!(diff.changed.len(), 2);
        assert_eq!(diff.changed[0].offset, 10);
        assert_eq!(diff.changed[1].offset, 20);
        assert_eq!(diff.total_changed, 15);
        assert_eq!(diff.remote_size, 25);
        assert!((diff.ratio - 0.6).abs() < 1e-9);
    }

    #[test]
    fn compare_identical_lists_is_empty() {
        let f = write_temp(&[1u8; 100]);
        let chunks = generate_hash_list(f.path(), 25, HashAlgorithm::Sha256).unwrap();
        let diff = compare(&chunks, &chunks);
        assert!(diff.changed.is_empty());
        assert_eq!(diff.total_changed, 0);
    }

    #[test]
    fn apply_patch_writes_offsets_and_resizes() {
        let f = write_temp(b"AAAABBBBCCCC");
        let remote = vec![
            ChunkInfo {
                offset: 4,
                size: 4,
                hash: calculate_buffer(b"XXXX", HashAlgorithm::Sha256),
            },
            ChunkInfo {
                offset: 12,
                size: 4,
                hash: calculate_buffer(b"DDDD", HashAlgorithm::Sha256),
            },
        ];
        let diff = FileDiff {
            local_size: 12,
            remote_size: 16,
            changed: remote.clone(),
            total_changed: 8,
            ratio: 0.5,
        };
        let fetched = vec![
            (remote[0].clone(), b"XXXX".to_vec()),
            (remote[1].clone(), b"DDDD".to_vec()),
        ];
        apply_patch(f.path(), &fetched, &diff).unwrap();
        assert_eq!(std::fs::read(f.path()).unwrap(), b"AAAAXXXXCCCCDDDD");
    }

    #[test]
    fn patched_file_matches_remote_hashes() {
        let f = write_temp(b"hello world, this is v1!");
        let local = generate_hash_list(f.path(), 8, HashAlgorithm::Sha256).unwrap();

        // Remote differs in the middle chunk only.
        let remote_content = b"hello woRLD, THIS is v1!";
        let remote: Vec<ChunkInfo> = remote_content
            .chunks(8)
            .scan(0u64, |off, c| {
                let chunk = ChunkInfo {
                    offset: *off,
                    size: c.len() as u64,
                    hash: calculate_buffer(c, HashAlgorithm::Sha256),
                };
                *off += c.len() as u64;
                Some(chunk)
            })
            .collect();

        let diff = compare(&local, &remote);
        assert_eq!(diff.changed.len(), 1);
        let fetched: Vec<(ChunkInfo, Vec<u8>)> = diff
            .changed
            .iter()
            .map(|c| {
                let slice =
                    &remote_content[c.offset as usize..(c.offset + c.size) as usize];
                (c.clone(), slice.to_vec())
            })
            .collect();
        apply_patch(f.path(), &fetched, &diff).unwrap();
        assert_eq!(std::fs::read(f.path()).unwrap(), remote_content);
        let after = generate_hash_list(f.path(), 8, HashAlgorithm::Sha256).unwrap();
        assert_eq!(compare(&after, &remote).changed.len(), 0);
    }
}
