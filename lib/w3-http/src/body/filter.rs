/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

use std::io::Write;

use base64::prelude::*;
use digest::Digest;
use flate2::write::{DeflateDecoder as RawDeflateDecoder, MultiGzDecoder, ZlibDecoder};
use log::warn;
use md5::Md5;

use super::{BodyDecodeError, ChunkedDecoder};

pub trait BodyFilter {
    fn name(&self) -> &'static str;

    /// consume `input`, append transformed bytes to `out`; returns how many
    /// input bytes were consumed (only the chunked decoder ever stops short,
    /// at the end of the final chunk)
    fn feed(&mut self, input: &[u8], out: &mut Vec<u8>) -> Result<usize, BodyDecodeError>;

    fn finish(&mut self, out: &mut Vec<u8>) -> Result<(), BodyDecodeError>;

    fn finished(&self) -> bool {
        false
    }
}

impl BodyFilter for ChunkedDecoder {
    fn name(&self) -> &'static str {
        "chunked"
    }

    fn feed(&mut self, input: &[u8], out: &mut Vec<u8>) -> Result<usize, BodyDecodeError> {
        ChunkedDecoder::feed(self, input, out)
    }

    fn finish(&mut self, _out: &mut Vec<u8>) -> Result<(), BodyDecodeError> {
        if self.finished() {
            Ok(())
        } else {
            Err(BodyDecodeError::TruncatedChunkedBody)
        }
    }

    fn finished(&self) -> bool {
        ChunkedDecoder::finished(self)
    }
}

pub struct GzipDecoder {
    inner: Option<MultiGzDecoder<Vec<u8>>>,
}

impl GzipDecoder {
    pub fn new() -> Self {
        GzipDecoder {
            inner: Some(MultiGzDecoder::new(Vec::new())),
        }
    }
}

impl Default for GzipDecoder {
    fn default() -> Self {
        GzipDecoder::new()
    }
}

impl BodyFilter for GzipDecoder {
    fn name(&self) -> &'static str {
        "gzip"
    }

    fn feed(&mut self, input: &[u8], out: &mut Vec<u8>) -> Result<usize, BodyDecodeError> {
        let Some(decoder) = self.inner.as_mut() else {
            return Ok(input.len());
        };
        decoder
            .write_all(input)
            .map_err(BodyDecodeError::DecompressFailed)?;
        out.append(decoder.get_mut());
        Ok(input.len())
    }

    fn finish(&mut self, out: &mut Vec<u8>) -> Result<(), BodyDecodeError> {
        if let Some(decoder) = self.inner.take() {
            let buf = decoder
                .finish()
                .map_err(BodyDecodeError::DecompressFailed)?;
            out.extend_from_slice(&buf);
        }
        Ok(())
    }
}

enum DeflateState {
    /// stream flavor is sniffed from the first payload byte: servers send
    /// both zlib-wrapped and raw deflate under the same label
    Undecided,
    Zlib(ZlibDecoder<Vec<u8>>),
    Raw(RawDeflateDecoder<Vec<u8>>),
    Finished,
}

pub struct DeflateDecoder {
    state: DeflateState,
}

impl DeflateDecoder {
    pub fn new() -> Self {
        DeflateDecoder {
            state: DeflateState::Undecided,
        }
    }
}

impl Default for DeflateDecoder {
    fn default() -> Self {
        DeflateDecoder::new()
    }
}

impl BodyFilter for DeflateDecoder {
    fn name(&self) -> &'static str {
        "deflate"
    }

    fn feed(&mut self, input: &[u8], out: &mut Vec<u8>) -> Result<usize, BodyDecodeError> {
        if input.is_empty() {
            return Ok(0);
        }
        if matches!(self.state, DeflateState::Undecided) {
            self.state = if input[0] == 0x78 {
                DeflateState::Zlib(ZlibDecoder::new(Vec::new()))
            } else {
                DeflateState::Raw(RawDeflateDecoder::new(Vec::new()))
            };
        }
        match &mut self.state {
            DeflateState::Zlib(decoder) => {
                decoder
                    .write_all(input)
                    .map_err(BodyDecodeError::DecompressFailed)?;
                out.append(decoder.get_mut());
            }
            DeflateState::Raw(decoder) => {
                decoder
                    .write_all(input)
                    .map_err(BodyDecodeError::DecompressFailed)?;
                out.append(decoder.get_mut());
            }
            DeflateState::Undecided | DeflateState::Finished => {}
        }
        Ok(input.len())
    }

    fn finish(&mut self, out: &mut Vec<u8>) -> Result<(), BodyDecodeError> {
        match std::mem::replace(&mut self.state, DeflateState::Finished) {
            DeflateState::Zlib(decoder) => {
                let buf = decoder
                    .finish()
                    .map_err(BodyDecodeError::DecompressFailed)?;
                out.extend_from_slice(&buf);
            }
            DeflateState::Raw(decoder) => {
                let buf = decoder
                    .finish()
                    .map_err(BodyDecodeError::DecompressFailed)?;
                out.extend_from_slice(&buf);
            }
            DeflateState::Undecided | DeflateState::Finished => {}
        }
        Ok(())
    }
}

/// passthrough filter computing the Content-MD5 digest of whatever flows by
pub struct Md5Digest {
    ctx: Md5,
    digest: Option<[u8; 16]>,
}

impl Md5Digest {
    pub fn new() -> Self {
        Md5Digest {
            ctx: Md5::new(),
            digest: None,
        }
    }

    pub fn base64_digest(&self) -> Option<String> {
        self.digest.map(|d| BASE64_STANDARD.encode(d))
    }
}

impl Default for Md5Digest {
    fn default() -> Self {
        Md5Digest::new()
    }
}

impl BodyFilter for Md5Digest {
    fn name(&self) -> &'static str {
        "md5"
    }

    fn feed(&mut self, input: &[u8], out: &mut Vec<u8>) -> Result<usize, BodyDecodeError> {
        self.ctx.update(input);
        out.extend_from_slice(input);
        Ok(input.len())
    }

    fn finish(&mut self, _out: &mut Vec<u8>) -> Result<(), BodyDecodeError> {
        let mut digest = [0u8; 16];
        digest.copy_from_slice(&self.ctx.clone().finalize());
        self.digest = Some(digest);
        Ok(())
    }
}

fn filter_for(name: &str, transfer: bool) -> Option<Box<dyn BodyFilter + Send>> {
    let lower = name.to_lowercase();
    match lower.as_str() {
        "chunked" if transfer => Some(Box::new(ChunkedDecoder::new())),
        "gzip" | "x-gzip" => Some(Box::new(GzipDecoder::new())),
        "deflate" | "x-deflate" => Some(Box::new(DeflateDecoder::new())),
        "identity" | "8bit" => None,
        _ => {
            // broken servers mislabel encodings all the time, pass through
            warn!("unsupported {} encoding '{name}', leaving body as-is",
                if transfer { "transfer" } else { "content" });
            None
        }
    }
}

/// The decode pipeline for one response body: transfer encodings undone in
/// reverse of the order the server applied them, then the Content-MD5 digest
/// (over transfer-decoded but still content-encoded bytes, per RFC 2616),
/// then content encodings, also in reverse.
pub struct DecoderChain {
    transfer: Vec<Box<dyn BodyFilter + Send>>,
    md5: Option<Md5Digest>,
    content: Vec<Box<dyn BodyFilter + Send>>,
}

impl DecoderChain {
    pub fn build(
        transfer_encodings: &[String],
        content_encodings: &[String],
        want_md5: bool,
    ) -> Self {
        let transfer = transfer_encodings
            .iter()
            .rev()
            .filter_map(|enc| filter_for(enc, true))
            .collect();
        let content = content_encodings
            .iter()
            .rev()
            .filter_map(|enc| filter_for(enc, false))
            .collect();
        DecoderChain {
            transfer,
            md5: want_md5.then(Md5Digest::new),
            content,
        }
    }

    /// whether the (chunked) transfer decoder has seen the final chunk
    pub fn transfer_finished(&self) -> bool {
        self.transfer.first().map(|f| f.finished()).unwrap_or(false)
    }

    pub fn md5_base64(&self) -> Option<String> {
        self.md5.as_ref().and_then(|m| m.base64_digest())
    }

    pub fn feed(&mut self, input: &[u8], out: &mut Vec<u8>) -> Result<usize, BodyDecodeError> {
        let mut consumed = input.len();
        let mut cur: Vec<u8>;

        match self.transfer.split_first_mut() {
            Some((first, rest)) => {
                let mut buf = Vec::new();
                consumed = first.feed(input, &mut buf)?;
                cur = buf;
                for f in rest {
                    let mut buf = Vec::new();
                    f.feed(&cur, &mut buf)?;
                    cur = buf;
                }
            }
            None => cur = input.to_vec(),
        }

        if let Some(md5) = &mut self.md5 {
            let mut buf = Vec::new();
            md5.feed(&cur, &mut buf)?;
            cur = buf;
        }

        for f in &mut self.content {
            let mut buf = Vec::new();
            f.feed(&cur, &mut buf)?;
            cur = buf;
        }

        out.append(&mut cur);
        Ok(consumed)
    }

    pub fn finish(&mut self, out: &mut Vec<u8>) -> Result<(), BodyDecodeError> {
        // flush stage by stage, pushing flushed bytes through what follows
        let nt = self.transfer.len();
        for i in 0..nt {
            let mut cur = Vec::new();
            self.transfer[i].finish(&mut cur)?;
            for f in &mut self.transfer[i + 1..] {
                let mut buf = Vec::new();
                f.feed(&cur, &mut buf)?;
                cur = buf;
            }
            if let Some(md5) = &mut self.md5 {
                let mut buf = Vec::new();
                md5.feed(&cur, &mut buf)?;
                cur = buf;
            }
            for f in &mut self.content {
                let mut buf = Vec::new();
                f.feed(&cur, &mut buf)?;
                cur = buf;
            }
            out.append(&mut cur);
        }

        if let Some(md5) = &mut self.md5 {
            let mut cur = Vec::new();
            md5.finish(&mut cur)?;
            for f in &mut self.content {
                let mut buf = Vec::new();
                f.feed(&cur, &mut buf)?;
                cur = buf;
            }
            out.append(&mut cur);
        }

        let nc = self.content.len();
        for i in 0..nc {
            let mut cur = Vec::new();
            self.content[i].finish(&mut cur)?;
            for f in &mut self.content[i + 1..] {
                let mut buf = Vec::new();
                f.feed(&cur, &mut buf)?;
                cur = buf;
            }
            out.append(&mut cur);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::{GzEncoder, ZlibEncoder};

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    fn zlib(data: &[u8]) -> Vec<u8> {
        let mut enc = ZlibEncoder::new(Vec::new(), Compression::default());
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

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

    fn strings(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn gzip_content_decoding() {
        let payload = b"some compressible payload, some compressible payload";
        let encoded = gzip(payload);

        let mut chain = DecoderChain::build(&[], &strings(&["gzip"]), false);
        let mut out = Vec::new();
        chain.feed(&encoded, &mut out).unwrap();
        chain.finish(&mut out).unwrap();
        assert_eq!(out, payload);
    }

    #[test]
    fn chunked_then_gzip_with_md5() {
        let payload: Vec<u8> = (0..4096u32).map(|v| (v % 7) as u8).collect();
        let gzipped = gzip(&payload);
        let wire = chunk_encode(&gzipped, 500);

        let mut chain = DecoderChain::build(&strings(&["chunked"]), &strings(&["gzip"]), true);
        let mut out = Vec::new();
        let consumed = chain.feed(&wire, &mut out).unwrap();
        assert_eq!(consumed, wire.len());
        assert!(chain.transfer_finished());
        chain.finish(&mut out).unwrap();
        assert_eq!(out, payload);

        // Content-MD5 covers the transfer-decoded but content-encoded bytes
        let expected = BASE64_STANDARD.encode(Md5::digest(&gzipped));
        assert_eq!(chain.md5_base64(), Some(expected));
    }

    #[test]
    fn stacked_content_encodings_reverse_order() {
        let payload = b"layered encodings test data, layered encodings test data";
        // server applied gzip first, then deflate on top
        let wire = zlib(&gzip(payload));

        let mut chain = DecoderChain::build(&[], &strings(&["gzip", "deflate"]), false);
        let mut out = Vec::new();
        chain.feed(&wire, &mut out).unwrap();
        chain.finish(&mut out).unwrap();
        assert_eq!(out, payload);
    }

    #[test]
    fn unknown_encoding_passes_through() {
        let payload = b"not really brotli";
        let mut chain = DecoderChain::build(&[], &strings(&["br"]), false);
        let mut out = Vec::new();
        chain.feed(payload, &mut out).unwrap();
        chain.finish(&mut out).unwrap();
        assert_eq!(out, payload);
    }

    #[test]
    fn identity_is_dropped() {
        let payload = b"plain";
        let mut chain = DecoderChain::build(&strings(&["identity"]), &strings(&["8bit"]), false);
        let mut out = Vec::new();
        let consumed = chain.feed(payload, &mut out).unwrap();
        chain.finish(&mut out).unwrap();
        assert_eq!(consumed, payload.len());
        assert_eq!(out, payload);
    }

    #[test]
    fn raw_deflate_sniffed() {
        let payload = b"raw deflate stream without zlib header";
        let mut enc = flate2::write::DeflateEncoder::new(Vec::new(), Compression::default());
        enc.write_all(payload).unwrap();
        let wire = enc.finish().unwrap();

        let mut chain = DecoderChain::build(&[], &strings(&["deflate"]), false);
        let mut out = Vec::new();
        chain.feed(&wire, &mut out).unwrap();
        chain.finish(&mut out).unwrap();
        assert_eq!(out, payload);
    }
}
