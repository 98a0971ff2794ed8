/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

use std::io;

use log::{debug, info};
use tokio::io::AsyncBufRead;

use w3_http::httpdate::parse_http_date;
use w3_http::{HttpRev, StatusLine, tokenize_header_block};

use crate::config::DEFAULT_CACHE_EXPIRE;
use crate::ioutil::LimitedBufReadExt;
use crate::request::HttpMethod;

#[derive(Debug)]
pub(crate) enum ResponseParseError {
    RemoteClosed,
    TooLargeHeader(usize),
    Io(io::Error),
}

impl From<io::Error> for ResponseParseError {
    fn from(e: io::Error) -> Self {
        ResponseParseError::Io(e)
    }
}

/// Everything learned from one response header block. Rebuilt per response.
#[derive(Default)]
pub struct ResponseState {
    pub code: u16,
    pub prev_code: u16,
    pub rev: Option<HttpRev>,
    /// status line + raw header lines, order preserved, for pass-through
    /// and cache storage
    pub raw_headers: Vec<String>,
    pub mime: Option<String>,
    pub charset: Option<String>,
    pub content_length: Option<u64>,
    pub chunked: bool,
    pub transfer_encodings: Vec<String>,
    pub content_encodings: Vec<String>,
    pub content_md5: Option<String>,
    pub keep_alive: bool,
    pub keep_alive_timeout: Option<u32>,
    pub location: Option<String>,
    pub www_challenges: Vec<String>,
    pub proxy_challenges: Vec<String>,
    pub upgrade_offers: Vec<String>,
    pub connection_upgrade: bool,
    pub dav_capabilities: Vec<String>,
    pub etag: Option<String>,
    pub last_modified_raw: Option<String>,
    pub last_modified: Option<i64>,
    pub date: Option<i64>,
    /// unix seconds; 1 means already expired
    pub expires: Option<i64>,
    pub max_age: Option<i64>,
    /// server said no-cache/no-store/pragma: never write this to disk
    pub no_cache: bool,
    pub accept_ranges_none: bool,
    /// bytes that turned out to be body when the peer was not speaking HTTP
    pub body_prefix: Vec<u8>,
    /// response faked up around a non-HTTP peer
    pub faked: bool,
}

impl ResponseState {
    /// Read and interpret one response header block. `prev_code` is the
    /// response code of the previous round on this request, kept for the
    /// double-auth bookkeeping.
    pub(crate) async fn parse<R>(
        reader: &mut R,
        max_header_size: usize,
        prev_code: u16,
    ) -> Result<ResponseState, ResponseParseError>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut rsp = ResponseState {
            prev_code,
            ..Default::default()
        };

        // tolerate stray blank lines servers emit before the status line
        let mut line_buf = Vec::<u8>::with_capacity(1024);
        let mut header_size = 0usize;
        loop {
            line_buf.clear();
            let (found, nr) = reader
                .limited_read_until(b'\n', max_header_size, &mut line_buf)
                .await?;
            if nr == 0 {
                return Err(ResponseParseError::RemoteClosed);
            }
            if !found && nr >= max_header_size {
                return Err(ResponseParseError::TooLargeHeader(max_header_size));
            }
            header_size += nr;
            if !is_blank_line(&line_buf) {
                break;
            }
        }

        match StatusLine::parse(&line_buf) {
            Ok(status) => {
                rsp.rev = Some(status.rev);
                rsp.code = status.code;
                rsp.keep_alive = status.rev == HttpRev::Http11;
            }
            Err(_) => {
                // Not HTTP at all. Fake a 200, assume html, drop keep-alive
                // and treat what we already read as body.
                debug!("no usable http marker in response, faking a 200");
                rsp.code = 200;
                rsp.rev = None;
                rsp.faked = true;
                rsp.keep_alive = false;
                rsp.mime = Some("text/html".to_string());
                rsp.body_prefix = line_buf;
                return Ok(rsp);
            }
        }
        rsp.push_raw_line(&line_buf);

        // the rest of the block goes through the span tokenizer in one piece
        let mut block = Vec::<u8>::with_capacity(2048);
        loop {
            if header_size >= max_header_size {
                return Err(ResponseParseError::TooLargeHeader(max_header_size));
            }
            line_buf.clear();
            let (found, nr) = reader
                .limited_read_until(b'\n', max_header_size - header_size, &mut line_buf)
                .await?;
            if nr == 0 {
                // header block cut short by eof; work with what we have
                break;
            }
            if !found && nr >= max_header_size - header_size {
                return Err(ResponseParseError::TooLargeHeader(max_header_size));
            }
            header_size += nr;
            if is_blank_line(&line_buf) {
                break;
            }
            rsp.push_raw_line(&line_buf);
            block.extend_from_slice(&line_buf);
        }
        block.extend_from_slice(b"\r\n");

        rsp.interpret_block(block);
        Ok(rsp)
    }

    /// stand-in for servers that hang up on HEAD without answering at all
    pub(crate) fn assume_head_ok() -> ResponseState {
        ResponseState {
            code: 200,
            faked: true,
            keep_alive: false,
            mime: Some("text/html".to_string()),
            ..Default::default()
        }
    }

    fn push_raw_line(&mut self, line: &[u8]) {
        let mut end = line.len();
        while end > 0 && matches!(line[end - 1], b'\r' | b'\n') {
            end -= 1;
        }
        self.raw_headers
            .push(String::from_utf8_lossy(&line[..end]).into_owned());
    }

    fn interpret_block(&mut self, mut block: Vec<u8>) {
        let map = tokenize_header_block(&mut block, 0);
        let buf = block.as_slice();

        if let Some(v) = map.first(buf, "content-length") {
            self.content_length = v.parse::<u64>().ok();
        }
        for v in map.all(buf, "transfer-encoding") {
            let v = v.to_lowercase();
            if v == "chunked" {
                self.chunked = true;
            }
            self.transfer_encodings.push(v);
        }
        for v in map.all(buf, "content-encoding") {
            self.content_encodings.push(v.to_lowercase());
        }
        if self.chunked || !self.transfer_encodings.is_empty() {
            // rfc 9112: transfer-encoding wins, a content-length next to it
            // cannot be trusted for framing
            self.content_length = None;
        }

        self.content_md5 = map.first(buf, "content-md5").map(str::to_string);

        if let Some(v) = map.first(buf, "content-type") {
            match v.parse::<mime::Mime>() {
                Ok(m) => {
                    self.mime = Some(m.essence_str().to_lowercase());
                    self.charset = m
                        .get_param(mime::CHARSET)
                        .map(|c| c.as_str().to_lowercase());
                }
                Err(_) => {
                    // sloppy servers still deserve a mime type
                    if let Some(m) = v.split(';').next() {
                        self.mime = Some(m.trim().to_lowercase());
                    }
                }
            }
        }

        for v in map
            .all(buf, "connection")
            .into_iter()
            .chain(map.all(buf, "proxy-connection"))
        {
            if v.eq_ignore_ascii_case("close") {
                self.keep_alive = false;
            } else if v.eq_ignore_ascii_case("keep-alive") {
                self.keep_alive = true;
            } else if v.eq_ignore_ascii_case("upgrade") {
                self.connection_upgrade = true;
            }
        }
        for v in map.all(buf, "keep-alive") {
            if let Some(t) = v.strip_prefix("timeout=") {
                self.keep_alive_timeout = t.trim().parse().ok();
            }
        }

        self.location = map.first(buf, "location").map(str::to_string);
        self.etag = map.first(buf, "etag").map(str::to_string);
        if let Some(v) = map.first(buf, "last-modified") {
            self.last_modified_raw = Some(v.to_string());
            self.last_modified = parse_http_date(v);
        }
        if let Some(v) = map.first(buf, "date") {
            self.date = parse_http_date(v);
        }
        if let Some(v) = map.first(buf, "expires") {
            // an unparsable expiry means expired, not unlimited
            self.expires = Some(parse_http_date(v).unwrap_or(1));
        }

        for v in map.all(buf, "cache-control") {
            let lower = v.to_lowercase();
            if lower == "no-cache" || lower == "no-store" {
                self.no_cache = true;
            } else if let Some(age) = lower.strip_prefix("max-age=") {
                self.max_age = age.trim().parse().ok();
            }
        }
        for v in map.all(buf, "pragma") {
            if v.eq_ignore_ascii_case("no-cache") {
                self.no_cache = true;
            }
        }
        if map.contains("refresh") {
            // refresh pages defeat their own purpose when cached
            self.no_cache = true;
        }
        if let Some(v) = map.first(buf, "accept-ranges") {
            if v.eq_ignore_ascii_case("none") {
                self.accept_ranges_none = true;
            }
        }

        for v in map.all(buf, "www-authenticate") {
            self.www_challenges.push(v.to_string());
        }
        for v in map.all(buf, "proxy-authenticate") {
            self.proxy_challenges.push(v.to_string());
        }
        for v in map.all(buf, "upgrade") {
            self.upgrade_offers.push(v.to_string());
        }
        for v in map.all(buf, "dav") {
            self.dav_capabilities.push(v.to_string());
        }
        if let Some(v) = map.first(buf, "warning") {
            info!("server warning: {v}");
        }

        if !self.chunked && self.content_length.is_none() {
            // no way to know where the body ends: keep-alive must go
            self.keep_alive = false;
        }
    }

    pub(crate) fn expect_no_body(&self, method: HttpMethod) -> bool {
        self.code < 200 || self.code == 204 || self.code == 304 || method == HttpMethod::Head
    }

    /// the expire date a fresh cache entry gets, with clock-drift fixup and
    /// the last-modified/10 heuristic for silent servers
    pub(crate) fn expire_date(&self, now: i64) -> i64 {
        let date = self.date.unwrap_or(now);

        let mut expire = match self.expires {
            Some(e) if e <= date => 1,
            Some(e) => e,
            None => 0,
        };

        match self.max_age {
            Some(0) => expire = 1,
            Some(n) if n > 0 => expire = now + n,
            _ => {}
        }

        if expire == 0 {
            expire = match self.last_modified {
                Some(lm) if date > lm => now + (date - lm) / 10,
                Some(_) => now + 1,
                None => now + DEFAULT_CACHE_EXPIRE,
            };
        }
        expire
    }

    /// Compressed-encoding fixups carried over from years of broken
    /// servers: some label archives with a gzip content-encoding that is
    /// really part of the file, not a wire encoding. Those encodings are
    /// folded into the mime type instead of being decoded.
    pub(crate) fn apply_mime_fixups(&mut self, path: &str, allow_compressed: bool) {
        if self.content_encodings.last().map(String::as_str) == Some("bzip2") {
            self.content_encodings.pop();
            self.mime = Some("application/x-bzip".to_string());
        }

        if matches!(
            self.content_encodings.last().map(String::as_str),
            Some("gzip") | Some("x-gzip")
        ) {
            match self.mime.as_deref() {
                Some("application/x-tar") => {
                    self.content_encodings.pop();
                    self.mime = Some("application/x-compressed-tar".to_string());
                }
                Some("application/postscript") => {
                    self.content_encodings.pop();
                    self.mime = Some("application/x-gzpostscript".to_string());
                }
                Some(m)
                    if allow_compressed
                        && m != "application/x-compressed-tar"
                        && m != "application/x-tgz"
                        && m != "application/x-targz"
                        && m != "application/x-gzip"
                        && !path.ends_with(".gz") =>
                {
                    // really a wire encoding, decode it
                }
                _ => {
                    self.content_encodings.pop();
                    self.mime = Some("application/x-gzip".to_string());
                }
            }
        }

        self.mime = self.mime.take().map(|m| normalize_mime(m, path));
    }
}

fn is_blank_line(line: &[u8]) -> bool {
    matches!(line, b"\n" | b"\r\n")
}

fn normalize_mime(mime: String, path: &str) -> String {
    let fixed = match mime.as_str() {
        "application/x-targz" => "application/x-compressed-tar",
        "image/x-png" => "image/png",
        "audio/x-mp3" | "audio/x-mpeg" | "audio/mp3" => "audio/mpeg",
        "audio/microsoft-wave" => "audio/x-wav",
        "application/pkix-cert" | "application/binary-certificate" => {
            "application/x-x509-ca-cert"
        }
        "application/x-gzip" => {
            if path.ends_with(".tar.gz") || path.ends_with(".tar") {
                "application/x-compressed-tar"
            } else if path.ends_with(".ps.gz") {
                "application/x-gzpostscript"
            } else {
                return mime;
            }
        }
        "text/plain" | "application/octet-stream" => {
            let upper = path.to_uppercase();
            if upper.ends_with(".BZ2") {
                "application/x-bzip"
            } else if upper.ends_with(".PEM") {
                "application/x-x509-ca-cert"
            } else if upper.ends_with(".SWF") {
                "application/x-shockwave-flash"
            } else {
                return mime;
            }
        }
        _ => return mime,
    };
    fixed.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    async fn parse(input: &[u8]) -> ResponseState {
        let mut reader = BufReader::new(input);
        ResponseState::parse(&mut reader, 64 * 1024, 0)
            .await
            .ok()
            .unwrap()
    }

    #[tokio::test]
    async fn plain_200() {
        let rsp = parse(
            b"HTTP/1.1 200 OK\r\n\
              Content-Type: text/plain; charset=UTF-8\r\n\
              Content-Length: 11\r\n\
              ETag: \"v1\"\r\n\
              \r\n",
        )
        .await;
        assert_eq!(rsp.code, 200);
        assert_eq!(rsp.rev, Some(HttpRev::Http11));
        assert_eq!(rsp.mime.as_deref(), Some("text/plain"));
        assert_eq!(rsp.charset.as_deref(), Some("utf-8"));
        assert_eq!(rsp.content_length, Some(11));
        assert_eq!(rsp.etag.as_deref(), Some("\"v1\""));
        assert!(rsp.keep_alive);
        assert_eq!(rsp.raw_headers.len(), 4);
    }

    #[tokio::test]
    async fn chunked_detected_and_length_dropped() {
        let rsp = parse(
            b"HTTP/1.1 200 OK\r\n\
              Transfer-Encoding: chunked\r\n\
              Content-Length: 999\r\n\
              \r\n",
        )
        .await;
        assert!(rsp.chunked);
        assert_eq!(rsp.content_length, None);
        assert!(rsp.keep_alive);
    }

    #[tokio::test]
    async fn unknown_length_kills_keep_alive() {
        let rsp = parse(
            b"HTTP/1.1 200 OK\r\n\
              Content-Type: text/html\r\n\
              \r\n",
        )
        .await;
        assert!(!rsp.keep_alive);
    }

    #[tokio::test]
    async fn non_http_fakes_200() {
        let rsp = parse(b"<html><body>surprise</body></html>").await;
        assert!(rsp.faked);
        assert_eq!(rsp.code, 200);
        assert_eq!(rsp.mime.as_deref(), Some("text/html"));
        assert!(!rsp.keep_alive);
        assert!(rsp.body_prefix.starts_with(b"<html>"));
    }

    #[tokio::test]
    async fn challenges_collected_in_order() {
        let rsp = parse(
            b"HTTP/1.1 401 Unauthorized\r\n\
              WWW-Authenticate: NTLM\r\n\
              WWW-Authenticate: Basic realm=\"top\"\r\n\
              Content-Length: 0\r\n\
              \r\n",
        )
        .await;
        assert_eq!(rsp.code, 401);
        assert_eq!(rsp.www_challenges, ["NTLM", "Basic realm=\"top\""]);
    }

    #[tokio::test]
    async fn cache_directives() {
        let rsp = parse(
            b"HTTP/1.1 200 OK\r\n\
              Cache-Control: no-cache, max-age=60\r\n\
              Content-Length: 1\r\n\
              \r\n",
        )
        .await;
        assert!(rsp.no_cache);
        assert_eq!(rsp.max_age, Some(60));
        // max-age beats a missing Expires header
        assert_eq!(rsp.expire_date(1000), 1060);
    }

    #[tokio::test]
    async fn heuristic_expiry_from_last_modified() {
        let mut rsp = parse(
            b"HTTP/1.1 200 OK\r\n\
              Content-Length: 1\r\n\
              \r\n",
        )
        .await;
        rsp.date = Some(2000);
        rsp.last_modified = Some(1000);
        assert_eq!(rsp.expire_date(5000), 5000 + 100);
    }

    #[tokio::test]
    async fn icy_accepted() {
        let rsp = parse(
            b"ICY 200 OK\r\n\
              \r\n",
        )
        .await;
        assert_eq!(rsp.rev, Some(HttpRev::Icy));
        assert_eq!(rsp.code, 200);
        assert!(!rsp.keep_alive);
    }

    #[test]
    fn tgz_fixup() {
        let mut rsp = ResponseState {
            mime: Some("application/x-tar".to_string()),
            content_encodings: vec!["gzip".to_string()],
            ..Default::default()
        };
        rsp.apply_mime_fixups("/dist/code.tar.gz", true);
        assert!(rsp.content_encodings.is_empty());
        assert_eq!(rsp.mime.as_deref(), Some("application/x-compressed-tar"));
    }

    #[test]
    fn html_gzip_still_decoded() {
        let mut rsp = ResponseState {
            mime: Some("text/html".to_string()),
            content_encodings: vec!["gzip".to_string()],
            ..Default::default()
        };
        rsp.apply_mime_fixups("/index.html", true);
        assert_eq!(rsp.content_encodings, ["gzip"]);
        assert_eq!(rsp.mime.as_deref(), Some("text/html"));
    }
}
