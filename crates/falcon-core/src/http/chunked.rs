//! Chunked transfer-encoding decoder.
//!
//! Wire form per chunk: hex size, optional `;extension`, CRLF, payload, CRLF.
//! The stream ends with a zero-size chunk followed by optional trailers and a
//! final CRLF (`0\r\n\r\n` in the common case).

use crate::error::EngineError;

const MAX_LINE: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Reading the size line into `line`.
    Size,
    /// Copying payload; counts bytes still expected.
    Data { remaining: u64 },
    /// Reading the CRLF that closes a payload.
    DataEnd,
    /// Reading trailer lines after the zero chunk.
    Trailer,
    Done,
}

/// Incremental decoder: feed raw bytes, collect payload bytes.
#[derive(Debug)]
pub struct ChunkedDecoder {
    state: State,
    line: Vec<u8>,
}

impl ChunkedDecoder {
    pub fn new() -> Self {
        Self {
            state: State::Size,
            line: Vec::new(),
        }
    }

    /// True once the terminating chunk and trailers have been consumed.
    pub fn is_done(&self) -> bool {
        self.state == State::Done
    }

    /// Decode as much of `input` as possible, appending payload bytes to
    /// `out`. Returns the number of input bytes consumed; once the decoder is
    /// done, remaining input is left for the caller (pipelined data).
    pub fn decode(&mut self, input: &[u8], out: &mut Vec<u8>) -> Result<usize, EngineError> {
        let mut pos = 0;
        while pos < input.len() {
            match self.state {
                State::Done => break,
                State::Size => {
                    pos += self.take_line(&input[pos..])?;
                    if let Some(line) = self.finished_line()? {
                        let size = parse_chunk_size(&line)?;
                        self.state = if size == 0 {
                            State::Trailer
                        } else {
                            State::Data { remaining: size }
                        };
                    }
                }
                State::Data { remaining } => {
                    let take = (input.len() - pos).min(remaining as usize);
                    out.extend_from_slice(&input[pos..pos + take]);
                    pos += take;
                    let left = remaining - take as u64;
                    self.state = if left == 0 {
                        State::DataEnd
                    } else {
                        State::Data { remaining: left }
                    };
                }
                State::DataEnd => {
                    pos += self.take_line(&input[pos..])?;
                    if let Some(line) = self.finished_line()? {
                        if !line.is_empty() {
                            return Err(EngineError::Protocol(
                                "missing CRLF after chunk payload".into(),
                            ));
                        }
                        self.state = State::Size;
                    }
                }
                State::Trailer => {
                    pos += self.take_line(&input[pos..])?;
                    if let Some(line) = self.finished_line()? {
                        if line.is_empty() {
                            self.state = State::Done;
                        }
                        // Non-empty trailer lines are ignored.
                    }
                }
            }
        }
        Ok(pos)
    }

    /// Accumulate bytes into the line buffer up to and including `\n`.
    fn take_line(&mut self, input: &[u8]) -> Result<usize, EngineError> {
        match input.iter().position(|&b| b == b'\n') {
            Some(i) => {
                self.line.extend_from_slice(&input[..=i]);
                Ok(i + 1)
            }
            None => {
                self.line.extend_from_slice(input);
                if self.line.len() > MAX_LINE {
                    return Err(EngineError::Protocol("chunk size line too long".into()));
                }
                Ok(input.len())
            }
        }
    }

    /// When the line buffer holds a complete line, pop it (without CRLF).
    fn finished_line(&mut self) -> Result<Option<Vec<u8>>, EngineError> {
        if self.line.last() != Some(&b'\n') {
            if self.line.len() > MAX_LINE {
                return Err(EngineError::Protocol("chunk size line too long".into()));
            }
            return Ok(None);
        }
        let mut line = std::mem::take(&mut self.line);
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Ok(Some(line))
    }
}

impl Default for ChunkedDecoder {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_chunk_size(line: &[u8]) -> Result<u64, EngineError> {
    // Extensions after ';' are ignored.
    let hex = line.split(|&b| b == b';').next().unwrap_or(&[]);
    let hex = std::str::from_utf8(hex)
        .map_err(|_| EngineError::Protocol("chunk size is not ASCII".into()))?
        .trim();
    if hex.is_empty() {
        return Err(EngineError::Protocol("empty chunk size line".into()));
    }
    u64::from_str_radix(hex, 16)
        .map_err(|_| EngineError::Protocol(format!("bad chunk size {hex:?}")))
}
