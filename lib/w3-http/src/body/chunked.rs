/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

use crate::parse::ChunkSizeLine;

use super::BodyDecodeError;

const MAX_SIZE_LINE: usize = 64;

enum State {
    SizeLine,
    Data { left: u64 },
    DataEndCr,
    DataEndLf,
    Trailer { line_len: usize },
    Done,
}

/// Incremental `<hex-size>CRLF<data>CRLF` record decoder. A zero size chunk
/// switches to draining the trailer section up to a blank line, tolerating
/// `\r\n\r\n`, `\n\n` and mixed sequences. `feed` reports how many input
/// bytes belong to this body so the caller never eats into a pipelined
/// follow-up response.
pub struct ChunkedDecoder {
    state: State,
    line: Vec<u8>,
}

impl Default for ChunkedDecoder {
    fn default() -> Self {
        ChunkedDecoder::new()
    }
}

impl ChunkedDecoder {
    pub fn new() -> Self {
        ChunkedDecoder {
            state: State::SizeLine,
            line: Vec::with_capacity(16),
        }
    }

    pub fn finished(&self) -> bool {
        matches!(self.state, State::Done)
    }

    pub fn feed(&mut self, input: &[u8], out: &mut Vec<u8>) -> Result<usize, BodyDecodeError> {
        let mut pos = 0;
        while pos < input.len() {
            match self.state {
                State::SizeLine => {
                    let Some(nl) = memchr::memchr(b'\n', &input[pos..]) else {
                        self.line.extend_from_slice(&input[pos..]);
                        if self.line.len() > MAX_SIZE_LINE {
                            return Err(BodyDecodeError::ChunkLineTooLong(MAX_SIZE_LINE));
                        }
                        return Ok(input.len());
                    };
                    self.line.extend_from_slice(&input[pos..=pos + nl]);
                    if self.line.len() > MAX_SIZE_LINE {
                        return Err(BodyDecodeError::ChunkLineTooLong(MAX_SIZE_LINE));
                    }
                    pos += nl + 1;

                    if self.line == b"\n" || self.line == b"\r\n" {
                        // stray chunk-end leftover, read the next line
                        self.line.clear();
                        continue;
                    }
                    let chunk_size = ChunkSizeLine::parse(&self.line)
                        .map_err(|_| BodyDecodeError::InvalidChunkSize)?
                        .chunk_size;
                    self.line.clear();
                    self.state = if chunk_size == 0 {
                        State::Trailer { line_len: 0 }
                    } else {
                        State::Data { left: chunk_size }
                    };
                }
                State::Data { left } => {
                    let take = left.min((input.len() - pos) as u64) as usize;
                    out.extend_from_slice(&input[pos..pos + take]);
                    pos += take;
                    let left = left - take as u64;
                    self.state = if left == 0 {
                        State::DataEndCr
                    } else {
                        State::Data { left }
                    };
                }
                State::DataEndCr => {
                    match input[pos] {
                        b'\r' => self.state = State::DataEndLf,
                        b'\n' => self.state = State::SizeLine,
                        _ => return Err(BodyDecodeError::InvalidChunkEnd),
                    }
                    pos += 1;
                }
                State::DataEndLf => {
                    if input[pos] != b'\n' {
                        return Err(BodyDecodeError::InvalidChunkEnd);
                    }
                    pos += 1;
                    self.state = State::SizeLine;
                }
                State::Trailer { line_len } => {
                    match input[pos] {
                        b'\n' => {
                            if line_len == 0 {
                                self.state = State::Done;
                            } else {
                                self.state = State::Trailer { line_len: 0 };
                            }
                        }
                        b'\r' => {}
                        _ => self.state = State::Trailer { line_len: line_len + 1 },
                    }
                    pos += 1;
                }
                State::Done => return Ok(pos),
            }
        }
        Ok(pos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk_encode(data: &[u8], chunk_size: usize) -> Vec<u8> {
        let mut out = Vec::new();
        for chunk in data.chunks(chunk_size) {
            out.extend_from_slice(format!("{:x}\r\n", chunk.len()).as_bytes());
            out.extend_from_slice(chunk);
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"0\r\n\r\n");
        out
    }

    #[test]
    fn round_trip() {
        let payload: Vec<u8> = (0..2000u32).map(|v| (v % 251) as u8).collect();
        for chunk_size in [1, 7, 512, 4096] {
            let encoded = chunk_encode(&payload, chunk_size);
            let mut decoder = ChunkedDecoder::new();
            let mut out = Vec::new();
            let consumed = decoder.feed(&encoded, &mut out).unwrap();
            assert_eq!(consumed, encoded.len());
            assert!(decoder.finished());
            assert_eq!(out, payload);
        }
    }

    #[test]
    fn byte_at_a_time() {
        let encoded = chunk_encode(b"hello world", 4);
        let mut decoder = ChunkedDecoder::new();
        let mut out = Vec::new();
        for b in &encoded {
            decoder.feed(std::slice::from_ref(b), &mut out).unwrap();
        }
        assert!(decoder.finished());
        assert_eq!(out, b"hello world");
    }

    #[test]
    fn trailer_headers_drained() {
        let encoded = b"5\r\nhello\r\n0\r\nX-Check: 1\r\nX-Other: 2\r\n\r\n";
        let mut decoder = ChunkedDecoder::new();
        let mut out = Vec::new();
        let consumed = decoder.feed(encoded, &mut out).unwrap();
        assert_eq!(consumed, encoded.len());
        assert!(decoder.finished());
        assert_eq!(out, b"hello");
    }

    #[test]
    fn sloppy_trailer_line_endings() {
        let encoded = b"3\r\nabc\r\n0\r\ntrailer: v\n\n";
        let mut decoder = ChunkedDecoder::new();
        let mut out = Vec::new();
        decoder.feed(encoded, &mut out).unwrap();
        assert!(decoder.finished());
        assert_eq!(out, b"abc");
    }

    #[test]
    fn stops_at_body_end() {
        let mut encoded = chunk_encode(b"data", 4);
        encoded.extend_from_slice(b"HTTP/1.1 200 OK\r\n");
        let mut decoder = ChunkedDecoder::new();
        let mut out = Vec::new();
        let consumed = decoder.feed(&encoded, &mut out).unwrap();
        assert_eq!(consumed, encoded.len() - 17);
        assert!(decoder.finished());
    }

    #[test]
    fn bad_size_is_error() {
        let mut decoder = ChunkedDecoder::new();
        let mut out = Vec::new();
        assert!(decoder.feed(b"zz\r\n", &mut out).is_err());

        let mut decoder = ChunkedDecoder::new();
        assert!(decoder.feed(b"-1\r\n", &mut out).is_err());
    }
}
