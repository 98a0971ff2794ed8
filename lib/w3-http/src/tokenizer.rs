/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

use ahash::AHashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// one value per physical header line, folded lines extend it
    Single,
    /// a top-level comma separated list, folded lines add list entries
    CommaList,
}

/// The response headers this engine interprets. Anything else is skipped
/// outright so a hostile server can not grow the span map without bound.
///
/// WWW-Authenticate and Proxy-Authenticate are Single on purpose: a Digest
/// challenge carries top-level commas that must stay inside one value.
static KNOWN_FIELDS: &[(&str, FieldKind)] = &[
    ("accept-ranges", FieldKind::Single),
    ("cache-control", FieldKind::CommaList),
    ("connection", FieldKind::CommaList),
    ("content-disposition", FieldKind::Single),
    ("content-encoding", FieldKind::CommaList),
    ("content-language", FieldKind::CommaList),
    ("content-length", FieldKind::Single),
    ("content-location", FieldKind::Single),
    ("content-md5", FieldKind::Single),
    ("content-type", FieldKind::Single),
    ("date", FieldKind::Single),
    ("dav", FieldKind::CommaList),
    ("etag", FieldKind::Single),
    ("expires", FieldKind::Single),
    ("keep-alive", FieldKind::CommaList),
    ("last-modified", FieldKind::Single),
    ("link", FieldKind::Single),
    ("location", FieldKind::Single),
    ("pragma", FieldKind::CommaList),
    ("proxy-authenticate", FieldKind::Single),
    ("proxy-connection", FieldKind::CommaList),
    ("refresh", FieldKind::Single),
    ("set-cookie", FieldKind::Single),
    ("transfer-encoding", FieldKind::CommaList),
    ("upgrade", FieldKind::CommaList),
    ("warning", FieldKind::Single),
    ("www-authenticate", FieldKind::Single),
];

fn lookup_field(name: &str) -> Option<(&'static str, FieldKind)> {
    KNOWN_FIELDS
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .copied()
}

pub struct HeaderFieldMap {
    spans: AHashMap<&'static str, Vec<(u32, u32)>>,
    header_end: usize,
}

impl HeaderFieldMap {
    /// byte offset just past the blank line that ended the header block
    pub fn header_end(&self) -> usize {
        self.header_end
    }

    pub fn contains(&self, name: &str) -> bool {
        self.count(name) > 0
    }

    pub fn count(&self, name: &str) -> usize {
        lookup_field(name)
            .and_then(|(k, _)| self.spans.get(k))
            .map(|v| v.len())
            .unwrap_or(0)
    }

    pub fn first<'a>(&self, buf: &'a [u8], name: &str) -> Option<&'a str> {
        let (k, _) = lookup_field(name)?;
        let (start, end) = *self.spans.get(k)?.first()?;
        std::str::from_utf8(&buf[start as usize..end as usize]).ok()
    }

    pub fn all<'a>(&self, buf: &'a [u8], name: &str) -> Vec<&'a str> {
        let Some((k, _)) = lookup_field(name) else {
            return Vec::new();
        };
        let Some(spans) = self.spans.get(k) else {
            return Vec::new();
        };
        spans
            .iter()
            .filter_map(|&(s, e)| std::str::from_utf8(&buf[s as usize..e as usize]).ok())
            .collect()
    }

    fn push(&mut self, key: &'static str, span: (u32, u32)) {
        self.spans.entry(key).or_default().push(span);
    }

    fn extend_last(&mut self, key: &'static str, end: u32) {
        if let Some(spans) = self.spans.get_mut(key) {
            if let Some(last) = spans.last_mut() {
                last.1 = end;
            }
        }
    }
}

fn trim_range(buf: &[u8], mut s: usize, mut e: usize) -> (usize, usize) {
    while s < e && matches!(buf[s], b' ' | b'\t') {
        s += 1;
    }
    while e > s && matches!(buf[e - 1], b' ' | b'\t') {
        e -= 1;
    }
    (s, e)
}

/// Tokenize one header block in `buf` starting at `from` (just past the
/// status line). Known header names map to ordered `(start, end)` spans into
/// `buf`; folded continuation lines of single-valued fields are compacted in
/// place so every span stays contiguous, with the fold collapsed to one
/// space. Lines without a colon and unrecognized names are skipped.
pub fn tokenize_header_block(buf: &mut [u8], from: usize) -> HeaderFieldMap {
    let mut map = HeaderFieldMap {
        spans: AHashMap::new(),
        header_end: buf.len(),
    };

    // the field the previous line belonged to, for continuation handling
    let mut cur: Option<(&'static str, FieldKind)> = None;
    let mut prev_value_end = from;

    let mut i = from;
    while i < buf.len() {
        let (content_end, next) = match memchr::memchr(b'\n', &buf[i..]) {
            Some(p) => (i + p, i + p + 1),
            None => (buf.len(), buf.len()),
        };
        let mut ce = content_end;
        if ce > i && buf[ce - 1] == b'\r' {
            ce -= 1;
        }

        if ce == i {
            // blank line: end of block, body starts at `next`
            map.header_end = next;
            return map;
        }

        if matches!(buf[i], b' ' | b'\t') {
            if let Some((key, kind)) = cur {
                let (cs, ce2) = trim_range(buf, i, ce);
                if cs < ce2 {
                    match kind {
                        FieldKind::Single => {
                            // fold: move the continuation up against the
                            // previous value, one space in between
                            buf[prev_value_end] = b' ';
                            buf.copy_within(cs..ce2, prev_value_end + 1);
                            let new_end = prev_value_end + 1 + (ce2 - cs);
                            for b in &mut buf[new_end..ce2] {
                                *b = b' ';
                            }
                            map.extend_last(key, new_end as u32);
                            prev_value_end = new_end;
                        }
                        FieldKind::CommaList => {
                            // a trailing comma leaves the last list slot open
                            // and the fold fills it; without one the fold
                            // starts a fresh entry. Both reduce to splitting
                            // the folded text into discrete entries.
                            push_list_values(&mut map, key, buf, cs, ce2);
                        }
                    }
                }
            }
            // continuation of a skipped header: skipped too
            i = next;
            continue;
        }

        let Some(colon) = memchr::memchr(b':', &buf[i..ce]) else {
            // no colon before line end: treat as unrecognized, keep going
            cur = None;
            i = next;
            continue;
        };
        let name = match std::str::from_utf8(&buf[i..i + colon]) {
            Ok(s) => s.trim(),
            Err(_) => {
                cur = None;
                i = next;
                continue;
            }
        };
        let Some((key, kind)) = lookup_field(name) else {
            cur = None;
            i = next;
            continue;
        };

        let vs = i + colon + 1;
        match kind {
            FieldKind::Single => {
                let (s, e) = trim_range(buf, vs, ce);
                map.push(key, (s as u32, e as u32));
                prev_value_end = e;
            }
            FieldKind::CommaList => {
                push_list_values(&mut map, key, buf, vs, ce);
            }
        }
        cur = Some((key, kind));
        i = next;
    }

    map
}

/// split `buf[s..e]` on top-level commas, push each non-empty trimmed segment
fn push_list_values(map: &mut HeaderFieldMap, key: &'static str, buf: &[u8], s: usize, e: usize) {
    let mut seg_start = s;
    let mut pos = s;
    while pos < e {
        if buf[pos] == b',' {
            let (ts, te) = trim_range(buf, seg_start, pos);
            if ts < te {
                map.push(key, (ts as u32, te as u32));
            }
            seg_start = pos + 1;
        }
        pos += 1;
    }
    let (ts, te) = trim_range(buf, seg_start, e);
    if ts < te {
        map.push(key, (ts as u32, te as u32));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(s: &str) -> Vec<u8> {
        s.as_bytes().to_vec()
    }

    #[test]
    fn simple_fields() {
        let mut buf = block(
            "Content-Type: text/html; charset=utf-8\r\n\
             Content-Length: 42\r\n\
             \r\nBODY",
        );
        let map = tokenize_header_block(&mut buf, 0);
        assert_eq!(
            map.first(&buf, "Content-Type"),
            Some("text/html; charset=utf-8")
        );
        assert_eq!(map.first(&buf, "content-length"), Some("42"));
        assert_eq!(&buf[map.header_end()..], b"BODY");
    }

    #[test]
    fn folded_single_value() {
        let mut buf = block(
            "Warning: this is a\r\n\
             \t  folded warning\r\n\
             \r\n",
        );
        let map = tokenize_header_block(&mut buf, 0);
        assert_eq!(map.first(&buf, "Warning"), Some("this is a folded warning"));
        assert_eq!(map.count("warning"), 1);
    }

    #[test]
    fn comma_list_trailing_comma_fold() {
        let mut buf = block(
            "Cache-Control: no-cache,\r\n\
             \tmax-age=0\r\n\
             \r\n",
        );
        let map = tokenize_header_block(&mut buf, 0);
        assert_eq!(map.all(&buf, "Cache-Control"), ["no-cache", "max-age=0"]);
    }

    #[test]
    fn comma_list_fold_without_comma() {
        let mut buf = block(
            "Connection: keep-alive\r\n\
             \tupgrade\r\n\
             \r\n",
        );
        let map = tokenize_header_block(&mut buf, 0);
        assert_eq!(map.all(&buf, "connection"), ["keep-alive", "upgrade"]);
    }

    #[test]
    fn repeated_lines_keep_order() {
        let mut buf = block(
            "Set-Cookie: a=1; Path=/\r\n\
             Set-Cookie: b=2\r\n\
             \r\n",
        );
        let map = tokenize_header_block(&mut buf, 0);
        assert_eq!(map.all(&buf, "set-cookie"), ["a=1; Path=/", "b=2"]);
    }

    #[test]
    fn digest_challenge_stays_whole() {
        let mut buf = block(
            "WWW-Authenticate: Digest realm=\"x\", nonce=\"y\", qop=\"auth\"\r\n\
             \r\n",
        );
        let map = tokenize_header_block(&mut buf, 0);
        assert_eq!(map.count("www-authenticate"), 1);
        assert_eq!(
            map.first(&buf, "WWW-Authenticate"),
            Some("Digest realm=\"x\", nonce=\"y\", qop=\"auth\"")
        );
    }

    #[test]
    fn unknown_and_malformed_skipped() {
        let mut buf = block(
            "X-Custom-Stuff: whatever\r\n\
             this line has no colon\r\n\
             ETag: \"abc\"\r\n\
             \r\n",
        );
        let map = tokenize_header_block(&mut buf, 0);
        assert!(!map.contains("x-custom-stuff"));
        assert_eq!(map.first(&buf, "etag"), Some("\"abc\""));
    }

    #[test]
    fn lf_only_lines() {
        let mut buf = block("Location: /new\nConnection: close\n\nrest");
        let map = tokenize_header_block(&mut buf, 0);
        assert_eq!(map.first(&buf, "location"), Some("/new"));
        assert_eq!(map.all(&buf, "connection"), ["close"]);
        assert_eq!(&buf[map.header_end()..], b"rest");
    }

    #[test]
    fn no_terminating_blank_line() {
        let mut buf = block("ETag: W/\"1\"\r\n");
        let map = tokenize_header_block(&mut buf, 0);
        assert_eq!(map.first(&buf, "etag"), Some("W/\"1\""));
        assert_eq!(map.header_end(), buf.len());
    }
}
