/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

use atoi::FromRadix10;

use super::HttpLineParseError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpRev {
    Http10,
    Http11,
    Unknown,
    /// shoutcast servers reply "ICY <code> <reason>"
    Icy,
}

impl HttpRev {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpRev::Http10 => "HTTP/1.0",
            HttpRev::Http11 => "HTTP/1.1",
            HttpRev::Unknown => "HTTP/?",
            HttpRev::Icy => "ICY",
        }
    }
}

pub struct StatusLine<'a> {
    pub rev: HttpRev,
    pub code: u16,
    pub reason: &'a str,
}

impl<'a> StatusLine<'a> {
    pub fn parse(buf: &'a [u8]) -> Result<StatusLine<'a>, HttpLineParseError> {
        const MINIMAL_LENGTH: usize = 9; // ICY XYZ\r\n

        if buf.len() < MINIMAL_LENGTH {
            return Err(HttpLineParseError::NotLongEnough);
        }

        if buf[..4].eq_ignore_ascii_case(b"ICY ") {
            return StatusLine::parse_after_version(HttpRev::Icy, &buf[4..]);
        }

        if !buf[..5].eq_ignore_ascii_case(b"HTTP/") {
            return Err(HttpLineParseError::NoHttpMarker);
        }
        let Some(p) = memchr::memchr(b' ', buf) else {
            return Err(HttpLineParseError::NoDelimiterFound(' '));
        };
        let rev = match &buf[5..p] {
            b"1.0" => HttpRev::Http10,
            b"1.1" => HttpRev::Http11,
            _ => HttpRev::Unknown,
        };
        StatusLine::parse_after_version(rev, &buf[p + 1..])
    }

    fn parse_after_version(
        rev: HttpRev,
        left: &'a [u8],
    ) -> Result<StatusLine<'a>, HttpLineParseError> {
        let (code, len) = u16::from_radix_10(left);
        if len < 3 {
            return Err(HttpLineParseError::InvalidStatusCode);
        }

        let reason = if left.len() > len + 1 {
            std::str::from_utf8(&left[len + 1..])?.trim()
        } else {
            ""
        };

        Ok(StatusLine { rev, code, reason })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normal() {
        let s = StatusLine::parse(b"HTTP/1.1 200 OK\r\n").unwrap();
        assert_eq!(s.rev, HttpRev::Http11);
        assert_eq!(s.code, 200);
        assert_eq!(s.reason, "OK");
    }

    #[test]
    fn http10() {
        let s = StatusLine::parse(b"HTTP/1.0 304 Not Modified\r\n").unwrap();
        assert_eq!(s.rev, HttpRev::Http10);
        assert_eq!(s.code, 304);
        assert_eq!(s.reason, "Not Modified");
    }

    #[test]
    fn unknown_rev() {
        let s = StatusLine::parse(b"HTTP/0.9 200 OK\r\n").unwrap();
        assert_eq!(s.rev, HttpRev::Unknown);
        assert_eq!(s.code, 200);
    }

    #[test]
    fn shoutcast() {
        let s = StatusLine::parse(b"ICY 200 OK\r\n").unwrap();
        assert_eq!(s.rev, HttpRev::Icy);
        assert_eq!(s.code, 200);
    }

    #[test]
    fn no_reason() {
        let s = StatusLine::parse(b"HTTP/1.1 200\r\n").unwrap();
        assert_eq!(s.code, 200);
        assert_eq!(s.reason, "");
    }

    #[test]
    fn not_http() {
        assert!(matches!(
            StatusLine::parse(b"<html><body>hi"),
            Err(HttpLineParseError::NoHttpMarker)
        ));
    }
}
