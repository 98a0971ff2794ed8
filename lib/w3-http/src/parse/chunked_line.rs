/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

use atoi::FromRadix16;

use super::HttpLineParseError;

pub struct ChunkSizeLine<'a> {
    pub chunk_size: u64,
    pub extension: Option<&'a str>,
}

impl<'a> ChunkSizeLine<'a> {
    pub fn parse(buf: &'a [u8]) -> Result<ChunkSizeLine<'a>, HttpLineParseError> {
        let (chunk_size, offset) = u64::from_radix_16(buf);
        if offset == 0 {
            return Err(HttpLineParseError::InvalidChunkSize);
        }

        if buf.len() == offset {
            return Err(HttpLineParseError::NotLongEnough);
        }

        match buf[offset] {
            b'\r' | b'\n' => Ok(ChunkSizeLine {
                chunk_size,
                extension: None,
            }),
            b';' => {
                let extension = std::str::from_utf8(&buf[offset + 1..])
                    .map_err(HttpLineParseError::InvalidUtf8Encoding)?
                    .trim();
                Ok(ChunkSizeLine {
                    chunk_size,
                    extension: Some(extension),
                })
            }
            _ => Err(HttpLineParseError::InvalidChunkSize),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple() {
        let chunk = ChunkSizeLine::parse(b"1\r\n").unwrap();
        assert_eq!(chunk.chunk_size, 1);

        let chunk = ChunkSizeLine::parse(b"1F\r\n").unwrap();
        assert_eq!(chunk.chunk_size, 0x1f);
    }

    #[test]
    fn with_extension() {
        let chunk = ChunkSizeLine::parse(b"a; ieof\r\n").unwrap();
        assert_eq!(chunk.chunk_size, 10);
        assert_eq!(chunk.extension, Some("ieof"));
    }

    #[test]
    fn negative() {
        assert!(ChunkSizeLine::parse(b"-5\r\n").is_err());
    }

    #[test]
    fn garbage() {
        assert!(ChunkSizeLine::parse(b"xyz\r\n").is_err());
    }
}
