//! File checksum calculation and verification.
//!
//! Runs off the transfer hot path: digests are computed after completion (or
//! on demand), streaming the file in bounded chunks.

use crate::error::{EngineError, Result};
use md5::Md5;
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha512};
use std::fs::File;
use std::io::Read;
use std::path::Path;

const BUF_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    Md5,
    Sha1,
    Sha256,
    Sha512,
}

impl HashAlgorithm {
    /// Hex digest length for this algorithm.
    pub fn hex_len(self) -> usize {
        match self {
            HashAlgorithm::Md5 => 32,
            HashAlgorithm::Sha1 => 40,
            HashAlgorithm::Sha256 => 64,
            HashAlgorithm::Sha512 => 128,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            HashAlgorithm::Md5 => "md5",
            HashAlgorithm::Sha1 => "sha1",
            HashAlgorithm::Sha256 => "sha256",
            HashAlgorithm::Sha512 => "sha512",
        }
    }
}

/// Infer the algorithm from a hex digest's length (32/40/64/128 chars).
pub fn detect_algorithm(hash: &str) -> Option<HashAlgorithm> {
    match hash.trim().len() {
        32 => Some(HashAlgorithm::Md5),
        40 => Some(HashAlgorithm::Sha1),
        64 => Some(HashAlgorithm::Sha256),
        128 => Some(HashAlgorithm::Sha512),
        _ => None,
    }
}

/// Outcome of a verification: the pair of digests and whether they match.
#[derive(Debug, Clone)]
pub struct HashResult {
    pub algorithm: HashAlgorithm,
    pub expected: String,
    pub calculated: String,
    pub valid: bool,
}

enum Hasher {
    Md5(Md5),
    Sha1(Sha1),
    Sha256(Sha256),
    Sha512(Sha512),
}

impl Hasher {
    fn new(algorithm: HashAlgorithm) -> Self {
        match algorithm {
            HashAlgorithm::Md5 => Hasher::Md5(Md5::new()),
            HashAlgorithm::Sha1 => Hasher::Sha1(Sha1::new()),
            HashAlgorithm::Sha256 => Hasher::Sha256(Sha256::new()),
            HashAlgorithm::Sha512 => Hasher::Sha512(Sha512::new()),
        }
    }

    fn update(&mut self, data: &[u8]) {
        match self {
            Hasher::Md5(h) => h.update(data),
            Hasher::Sha1(h) => h.update(data),
            Hasher::Sha256(h) => h.update(data),
            Hasher::Sha512(h) => h.update(data),
        }
    }

    fn finalize_hex(self) -> String {
        match self {
            Hasher::Md5(h) => hex::encode(h.finalize()),
            Hasher::Sha1(h) => hex::encode(h.finalize()),
            Hasher::Sha256(h) => hex::encode(h.finalize()),
            Hasher::Sha512(h) => hex::encode(h.finalize()),
        }
    }
}

/// Hash an in-memory buffer; returns lowercase hex.
pub fn calculate_buffer(data: &[u8], algorithm: HashAlgorithm) -> String {
    let mut hasher = Hasher::new(algorithm);
    hasher.update(data);
    hasher.finalize_hex()
}

/// Hash a file by streaming it in chunks; returns lowercase hex.
pub fn calculate_file(path: &Path, algorithm: HashAlgorithm) -> Result<String> {
    let mut f = File::open(path)?;
    let mut hasher = Hasher::new(algorithm);
    let mut buf = [0u8; BUF_SIZE];
    loop {
        let n = f.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize_hex())
}

/// Compare a file's digest against `expected` (case-insensitive).
pub fn verify(path: &Path, expected: &str, algorithm: HashAlgorithm) -> Result<HashResult> {
    let calculated = calculate_file(path, algorithm)?;
    let valid = calculated.eq_ignore_ascii_case(expected.trim());
    Ok(HashResult {
        algorithm,
        expected: expected.trim().to_string(),
        calculated,
        valid,
    })
}

/// Verify against an expected digest whose algorithm is inferred from its
/// length. Unknown lengths are an input error.
pub fn verify_detect(path: &Path, expected: &str) -> Result<HashResult> {
    let algorithm = detect_algorithm(expected).ok_or_else(|| {
        EngineError::InvalidInput(format!(
            "cannot infer hash algorithm from {} hex chars",
            expected.trim().len()
        ))
    })?;
    verify(path, expected, algorithm)
}

/// Per-piece SHA-1 verification of a downloaded file.
pub struct PieceVerifier {
    piece_size: usize,
    piece_hashes: Vec<String>,
}

impl PieceVerifier {
    pub fn new(piece_size: usize, piece_hashes: Vec<String>) -> Self {
        Self {
            piece_size,
            piece_hashes,
        }
    }

    pub fn piece_count(&self) -> usize {
        self.piece_hashes.len()
    }

    /// Hash the file piece by piece (last piece may be short) and report
    /// which positions match their expected digest.
    pub fn verify(&self, path: &Path) -> Result<Vec<bool>> {
        let mut f = File::open(path)?;
        let mut results = Vec::with_capacity(self.piece_hashes.len());
        let mut buf = vec![0u8; self.piece_size.max(1)];
        for expected in &self.piece_hashes {
            let mut filled = 0;
            while filled < buf.len() {
                let n = f.read(&mut buf[filled..])?;
                if n == 0 {
                    break;
                }
                filled += n;
            }
            if filled == 0 {
                results.push(false);
                continue;
            }
            let digest = calculate_buffer(&buf[..filled], HashAlgorithm::Sha1);
            results.push(digest.eq_ignore_ascii_case(expected));
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn temp_with(content: &[u8]) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(content).unwrap();
        f.flush().unwrap();
        f
    }

    #[test]
    fn sha256_of_known_content() {
        let f = temp_with(b"hello\n");
        let digest = calculate_file(f.path(), HashAlgorithm::Sha256).unwrap();
        assert_eq!(
            digest,
            "5891b5b522d5df086d0ff0b110fbd9d21bb4fc7163af34d08286a2e846f6be03"
        );
    }

    #[test]
    fn empty_file_digests() {
        let f = temp_with(b"");
        assert_eq!(
            calculate_file(f.path(), HashAlgorithm::Md5).unwrap(),
            "d41d8cd98f00b204e9800998ecf8427e"
        );
        assert_eq!(
            calculate_file(f.path(), HashAlgorithm::Sha1).unwrap(),
            "da39a3ee5e6b4b0d3255bfef95601890afd80709"
        );
    }

    #[test]
    fn verify_matches_and_mismatches() {
        let f = temp_with(b"hello\n");
        let good = verify(
            f.path(),
            "5891b5b522d5df086d0ff0b110fbd9d21bb4fc7163af34d08286a2e846f6be03",
            HashAlgorithm::Sha256,
        )
        .unwrap();
        assert!(good.valid);
        assert_eq!(good.calculated, good.expected);

        let bad = verify(
            f.path(),
            "0000000000000000000000000000000000000000000000000000000000000000",
            HashAlgorithm::Sha256,
        )
        .unwrap();
        assert!(!bad.valid);
        assert_eq!(bad.calculated, good.calculated);
    }

    #[test]
    fn detect_by_length() {
        assert_eq!(detect_algorithm(&"a".repeat(32)), Some(HashAlgorithm::Md5));
        assert_eq!(detect_algorithm(&"a".repeat(40)), Some(HashAlgorithm::Sha1));
        assert_eq!(detect_algorithm(&"a".repeat(64)), Some(HashAlgorithm::Sha256));
        assert_eq!(detect_algorithm(&"a".repeat(128)), Some(HashAlgorithm::Sha512));
        assert_eq!(detect_algorithm("abc"), None);
    }

    #[test]
    fn piece_verifier_flags_bad_piece() {
        let f = temp_with(b"aaaabbbbcc");
        let pieces = vec![
            calculate_buffer(b"aaaa", HashAlgorithm::Sha1),
            calculate_buffer(b"XXXX", HashAlgorithm::Sha1),
            calculate_buffer(b"cc", HashAlgorithm::Sha1),
        ];
        let verifier = PieceVerifier::new(4, pieces);
        assert_eq!(verifier.piece_count(), 3);
        let results = verifier.verify(f.path()).unwrap();
        assert_eq!(results, vec![true, false, true]);
    }

    #[test]
    fn uppercase_expected_still_matches() {
        let f = temp_with(b"hello\n");
        let r = verify_detect(
            f.path(),
            "5891B5B522D5DF086D0FF0B110FBD9D21BB4FC7163AF34D08286A2E846F6BE03",
        )
        .unwrap();
        assert!(r.valid);
    }
}
