/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

use std::io::{BufRead, Write};

use crate::CacheEntryError;

const MAGIC: [u8; 2] = *b"w3";
const VERSION: u8 = 1;

/// binary header: magic, version, reserved compression flag, use count,
/// served/modified/expire unix seconds, payload byte count
pub const BINARY_HEADER_LEN: usize = 36;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntryHeader {
    pub use_count: u32,
    pub served_date: i64,
    pub last_modified: i64,
    pub expire_date: i64,
    pub payload_size: u32,
}

impl EntryHeader {
    pub fn encode(&self) -> [u8; BINARY_HEADER_LEN] {
        let mut buf = [0u8; BINARY_HEADER_LEN];
        buf[0..2].copy_from_slice(&MAGIC);
        buf[2] = VERSION;
        buf[3] = 0; // compression, reserved
        buf[4..8].copy_from_slice(&self.use_count.to_le_bytes());
        buf[8..16].copy_from_slice(&self.served_date.to_le_bytes());
        buf[16..24].copy_from_slice(&self.last_modified.to_le_bytes());
        buf[24..32].copy_from_slice(&self.expire_date.to_le_bytes());
        buf[32..36].copy_from_slice(&self.payload_size.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8; BINARY_HEADER_LEN]) -> Result<EntryHeader, CacheEntryError> {
        if buf[0..2] != MAGIC || buf[2] != VERSION {
            return Err(CacheEntryError::BadHeader);
        }
        Ok(EntryHeader {
            use_count: u32::from_le_bytes(buf[4..8].try_into().unwrap()),
            served_date: i64::from_le_bytes(buf[8..16].try_into().unwrap()),
            last_modified: i64::from_le_bytes(buf[16..24].try_into().unwrap()),
            expire_date: i64::from_le_bytes(buf[24..32].try_into().unwrap()),
            payload_size: u32::from_le_bytes(buf[32..36].try_into().unwrap()),
        })
    }
}

/// The variable text section between the binary header and the payload:
/// canonical url, etag, mime type, then the raw response header lines,
/// closed off by a blank line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntryText {
    pub url: String,
    pub etag: String,
    pub mime: String,
    pub headers: Vec<String>,
}

impl EntryText {
    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<(), CacheEntryError> {
        writeln!(w, "{}", self.url)?;
        writeln!(w, "{}", self.etag)?;
        writeln!(w, "{}", self.mime)?;
        for line in &self.headers {
            writeln!(w, "{line}")?;
        }
        writeln!(w)?;
        Ok(())
    }

    pub fn read_from<R: BufRead>(r: &mut R) -> Result<EntryText, CacheEntryError> {
        let mut text = EntryText::default();
        text.url = read_text_line(r)?;
        text.etag = read_text_line(r)?;
        text.mime = read_text_line(r)?;
        loop {
            let line = read_text_line(r)?;
            if line.is_empty() {
                return Ok(text);
            }
            text.headers.push(line);
        }
    }
}

fn read_text_line<R: BufRead>(r: &mut R) -> Result<String, CacheEntryError> {
    let mut line = String::new();
    let n = r.read_line(&mut line)?;
    if n == 0 {
        return Err(CacheEntryError::TruncatedHeader);
    }
    while line.ends_with('\n') || line.ends_with('\r') {
        line.pop();
    }
    Ok(line)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::BufReader;

    #[test]
    fn binary_round_trip() {
        let header = EntryHeader {
            use_count: 7,
            served_date: 1_700_000_000,
            last_modified: 1_600_000_000,
            expire_date: 1_700_000_600,
            payload_size: 12345,
        };
        let encoded = header.encode();
        assert_eq!(encoded.len(), BINARY_HEADER_LEN);
        assert_eq!(EntryHeader::decode(&encoded).unwrap(), header);
    }

    #[test]
    fn bad_magic_rejected() {
        let mut encoded = EntryHeader::default().encode();
        encoded[0] = b'x';
        assert!(matches!(
            EntryHeader::decode(&encoded),
            Err(CacheEntryError::BadHeader)
        ));
    }

    #[test]
    fn text_round_trip() {
        let text = EntryText {
            url: "http://host/path".to_string(),
            etag: "\"v1\"".to_string(),
            mime: "text/html".to_string(),
            headers: vec![
                "HTTP/1.1 200 OK".to_string(),
                "Content-Type: text/html".to_string(),
            ],
        };
        let mut buf = Vec::new();
        text.write_to(&mut buf).unwrap();
        buf.extend_from_slice(b"PAYLOAD");

        let mut reader = BufReader::new(&buf[..]);
        let read = EntryText::read_from(&mut reader).unwrap();
        assert_eq!(read, text);

        let mut rest = Vec::new();
        std::io::Read::read_to_end(&mut reader, &mut rest).unwrap();
        assert_eq!(rest, b"PAYLOAD");
    }
}
