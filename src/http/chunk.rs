//! Transfer-Encoding: chunked codec.

use super::{find_http_line, ParseError, CRLF};

/// Default payload size per chunk when re-encoding a body.
pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;

/// Largest chunk size accepted on the wire.
pub const MAX_CHUNK_SIZE: usize = isize::MAX as usize - 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkParserState {
    WaitingForSize,
    WaitingForData,
    ReadingTrailers,
    Complete,
}

/// Incremental decoder for a chunked body.
#[derive(Debug, Clone)]
pub struct ChunkParser {
    state: ChunkParserState,
    size: usize,
    body: Vec<u8>,
    max_body_size: Option<usize>,
}

impl Default for ChunkParser {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkParser {
    pub fn new() -> Self {
        Self {
            state: ChunkParserState::WaitingForSize,
            size: 0,
            body: Vec::new(),
            max_body_size: None,
        }
    }

    /// Decoder that fails once the decoded body would exceed `limit` bytes.
    pub fn with_limit(limit: Option<usize>) -> Self {
        Self {
            max_body_size: limit,
            ..Self::new()
        }
    }

    pub fn state(&self) -> ChunkParserState {
        self.state
    }

    pub fn is_complete(&self) -> bool {
        self.state == ChunkParserState::Complete
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn into_body(self) -> Vec<u8> {
        self.body
    }

    /// Consume as many complete chunk frames from the front of `buffer` as
    /// possible. Bytes after the terminating chunk stay in `buffer`.
    pub fn parse(&mut self, buffer: &mut Vec<u8>) -> Result<(), ParseError> {
        loop {
            match self.state {
                ChunkParserState::WaitingForSize => {
                    let Some((line, consumed)) = find_http_line(buffer) else {
                        return Ok(());
                    };
                    let size = parse_chunk_size(line)?;
                    if let Some(limit) = self.max_body_size {
                        let total = self.body.len().saturating_add(size);
                        if total > limit {
                            return Err(ParseError::BodyTooLarge(total));
                        }
                    }
                    buffer.drain(..consumed);
                    self.size = size;
                    self.state = if size == 0 {
                        ChunkParserState::ReadingTrailers
                    } else {
                        ChunkParserState::WaitingForData
                    };
                }
                ChunkParserState::WaitingForData => {
                    // size was bounded by parse_chunk_size
                    let end = self.size + CRLF.len();
                    if buffer.len() < end {
                        return Ok(());
                    }
                    if &buffer[self.size..end] != CRLF {
                        return Err(ParseError::MalformedChunk);
                    }
                    self.body.extend_from_slice(&buffer[..self.size]);
                    buffer.drain(..end);
                    self.size = 0;
                    self.state = ChunkParserState::WaitingForSize;
                }
                ChunkParserState::ReadingTrailers => {
                    let Some((line, consumed)) = find_http_line(buffer) else {
                        return Ok(());
                    };
                    let finished = line.is_empty();
                    buffer.drain(..consumed);
                    if finished {
                        self.state = ChunkParserState::Complete;
                    }
                }
                ChunkParserState::Complete => return Ok(()),
            }
        }
    }

    /// Encode `body` as a sequence of chunks followed by the zero-size chunk.
    pub fn to_chunks(body: &[u8], chunk_size: usize) -> Vec<u8> {
        let chunk_size = chunk_size.max(1);
        let mut out = Vec::with_capacity(body.len() + 16);
        for chunk in body.chunks(chunk_size) {
            out.extend_from_slice(format!("{:x}", chunk.len()).as_bytes());
            out.extend_from_slice(CRLF);
            out.extend_from_slice(chunk);
            out.extend_from_slice(CRLF);
        }
        out.extend_from_slice(b"0");
        out.extend_from_slice(CRLF);
        out.extend_from_slice(CRLF);
        out
    }
}

fn parse_chunk_size(line: &[u8]) -> Result<usize, ParseError> {
    let text = String::from_utf8_lossy(line);
    // chunk extensions follow a ';'
    let size = text.split(';').next().unwrap_or_default().trim();
    match usize::from_str_radix(size, 16) {
        Ok(size) if size <= MAX_CHUNK_SIZE => Ok(size),
        _ => Err(ParseError::MalformedChunkSize(text.to_string())),
    }
}
