//! Engine error type and classification.
//!
//! Every command step and public operation returns `Result<_, EngineError>`;
//! errors never unwind through the scheduler loop. The `ErrorKind` taxonomy
//! drives the retry policy: Network and Timeout are absorbed by the retry
//! budget, Protocol and InvalidInput are not.

use crate::types::Bytes;
use std::time::Duration;
use thiserror::Error;

/// Broad error category used for retry decisions and reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed URI, unsupported scheme, bad output path.
    InvalidInput,
    /// DNS, connect, TLS, or mid-stream read/write failure.
    Network,
    /// Bad status line, unparseable headers, framing violations.
    Protocol,
    /// Temp file creation, write, or rename failure.
    FileIo,
    /// User-initiated stop.
    Cancelled,
    /// Connect/read/write deadline exceeded (retried like Network).
    Timeout,
    /// Digest mismatch after completion.
    Verification,
}

/// Error produced by the download engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("network: {0}")]
    Network(String),

    #[error("protocol: {0}")]
    Protocol(String),

    /// Non-2xx terminal HTTP status (after redirect handling).
    #[error("HTTP {status} {reason}")]
    HttpStatus { status: u16, reason: String },

    #[error("file io: {source}")]
    FileIo {
        #[from]
        source: std::io::Error,
    },

    #[error("cancelled")]
    Cancelled,

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("verification failed: expected {expected}, calculated {calculated}")]
    Verification { expected: String, calculated: String },

    /// Transfer ended short of the advertised length.
    #[error("partial transfer: expected {expected} bytes, got {received}")]
    PartialTransfer { expected: Bytes, received: Bytes },
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::InvalidInput(_) => ErrorKind::InvalidInput,
            EngineError::Network(_) => ErrorKind::Network,
            EngineError::Protocol(_) => ErrorKind::Protocol,
            EngineError::HttpStatus { status, .. } => classify_http_status(*status),
            EngineError::FileIo { .. } => ErrorKind::FileIo,
            EngineError::Cancelled => ErrorKind::Cancelled,
            EngineError::Timeout(_) => ErrorKind::Timeout,
            EngineError::Verification { .. } => ErrorKind::Verification,
            EngineError::PartialTransfer { .. } => ErrorKind::Network,
        }
    }

    /// True if the retry budget applies to this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Network | ErrorKind::Timeout)
    }
}

/// Map an HTTP status to an error kind: 5xx, 408 and 429 feed the retry
/// budget; other 4xx are terminal protocol-level failures.
pub fn classify_http_status(status: u16) -> ErrorKind {
    match status {
        408 | 429 => ErrorKind::Network,
        500..=599 => ErrorKind::Network,
        _ => ErrorKind::Protocol,
    }
}

pub type Result<T, E = EngineError> = std::result::Result<T, E>;
