/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

use chrono::DateTime;
use percent_encoding::percent_decode_str;
use quick_xml::Reader;
use quick_xml::events::Event;

use w3_http::StatusLine;
use w3_http::httpdate::parse_http_date;

use super::{DavEntry, LockResult};
use crate::error::{DavError, DavErrorKind};

/// The parsed content of one 207 Multi-Status body.
#[derive(Debug, Default)]
pub struct MultiStatus {
    pub entries: Vec<DavEntry>,
    pub failures: Vec<DavFailure>,
}

/// A `<response>` whose own status reported a failure.
#[derive(Debug, Clone)]
pub struct DavFailure {
    pub href: String,
    pub status_line: String,
    pub code: u16,
    pub description: Option<String>,
}

fn decoded(s: &str) -> String {
    percent_decode_str(s).decode_utf8_lossy().into_owned()
}

fn name_of(href: &str) -> String {
    let trimmed = href.trim_end_matches('/');
    match trimmed.rsplit_once('/') {
        Some((_, name)) => decoded(name),
        None => decoded(trimmed),
    }
}

fn status_code(line: &str) -> u16 {
    StatusLine::parse(line.as_bytes()).map(|s| s.code).unwrap_or(0)
}

#[derive(Default)]
struct PendingResponse {
    href: String,
    /// properties gathered in the propstat block currently open
    prop: DavEntry,
    propstat_status: Option<String>,
    merged: DavEntry,
    has_props: bool,
    response_status: Option<String>,
    description: Option<String>,
}

impl PendingResponse {
    fn merge_propstat(&mut self) {
        let ok = match self.propstat_status.take() {
            Some(line) => (200..300).contains(&status_code(&line)),
            // a propstat without a status is treated as the good one
            None => true,
        };
        let prop = std::mem::take(&mut self.prop);
        if !ok {
            // properties the server does not have, routine for allprop
            return;
        }
        self.has_props = true;
        let m = &mut self.merged;
        m.is_collection |= prop.is_collection;
        m.display_name = prop.display_name.or(m.display_name.take());
        m.size = prop.size.or(m.size.take());
        m.mtime = prop.mtime.or(m.mtime.take());
        m.ctime = prop.ctime.or(m.ctime.take());
        m.content_type = prop.content_type.or(m.content_type.take());
        m.etag = prop.etag.or(m.etag.take());
        m.lock_token = prop.lock_token.or(m.lock_token.take());
    }

    fn finish(mut self, out: &mut MultiStatus) {
        let failed = match &self.response_status {
            Some(line) => status_code(line) >= 400,
            None => false,
        };
        if failed {
            let line = self.response_status.take().unwrap_or_default();
            out.failures.push(DavFailure {
                href: self.href.clone(),
                code: status_code(&line),
                status_line: line,
                description: self.description.take(),
            });
            return;
        }
        let mut entry = self.merged;
        entry.name = name_of(&self.href);
        entry.href = decoded(&self.href);
        out.entries.push(entry);
    }
}

/// Parse a 207 Multi-Status body. Each `<response>` is checked on its own:
/// successful ones become directory-listing entries, failed ones are
/// collected for the aggregated error message. Failed `<propstat>` blocks
/// inside an otherwise successful response only mean "property not set" and
/// are dropped silently.
pub(crate) fn parse_multistatus(body: &[u8]) -> Result<MultiStatus, DavError> {
    let mut reader = Reader::from_reader(body);
    reader.config_mut().trim_text(true);

    let mut out = MultiStatus::default();
    let mut path: Vec<String> = Vec::new();
    let mut pending: Option<PendingResponse> = None;
    let mut buf = Vec::new();

    loop {
        let event = reader.read_event_into(&mut buf).map_err(|e| DavError {
            kind: DavErrorKind::Generic,
            message: format!("malformed multi-status reply: {e}"),
        })?;
        match event {
            Event::Start(e) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                if name == "response" {
                    pending = Some(PendingResponse::default());
                }
                path.push(name);
            }
            Event::Empty(e) => {
                if e.local_name().as_ref() == b"collection"
                    && path.last().map(String::as_str) == Some("resourcetype")
                {
                    if let Some(p) = pending.as_mut() {
                        p.prop.is_collection = true;
                    }
                }
            }
            Event::Text(t) => {
                let text = t.unescape().unwrap_or_default().into_owned();
                let Some(p) = pending.as_mut() else {
                    buf.clear();
                    continue;
                };
                let under = |what: &str| path.iter().any(|n| n == what);
                match path.last().map(String::as_str) {
                    Some("href") if under("locktoken") => {
                        p.prop.lock_token = Some(text);
                    }
                    Some("href") if path.iter().rev().nth(1).map(String::as_str)
                        == Some("response") =>
                    {
                        p.href = text;
                    }
                    Some("status") => {
                        if under("propstat") {
                            p.propstat_status = Some(text);
                        } else {
                            p.response_status = Some(text);
                        }
                    }
                    Some("responsedescription") => p.description = Some(text),
                    Some("displayname") => p.prop.display_name = Some(text),
                    Some("getcontentlength") => p.prop.size = text.trim().parse().ok(),
                    Some("getlastmodified") => p.prop.mtime = parse_http_date(&text),
                    Some("creationdate") => {
                        p.prop.ctime = DateTime::parse_from_rfc3339(text.trim())
                            .map(|d| d.timestamp())
                            .ok();
                    }
                    Some("getcontenttype") => p.prop.content_type = Some(text),
                    Some("getetag") => p.prop.etag = Some(text),
                    _ => {}
                }
            }
            Event::End(e) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                path.pop();
                match name.as_str() {
                    "propstat" => {
                        if let Some(p) = pending.as_mut() {
                            p.merge_propstat();
                        }
                    }
                    "response" => {
                        if let Some(p) = pending.take() {
                            p.finish(&mut out);
                        }
                    }
                    _ => {}
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    Ok(out)
}

/// Pull the lock token (and timeout, when given) out of a LOCK response.
pub(crate) fn parse_lock_token(body: &[u8]) -> Option<LockResult> {
    let mut reader = Reader::from_reader(body);
    reader.config_mut().trim_text(true);

    let mut path: Vec<String> = Vec::new();
    let mut token = None;
    let mut timeout_secs = None;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf).ok()? {
            Event::Start(e) => {
                path.push(String::from_utf8_lossy(e.local_name().as_ref()).into_owned());
            }
            Event::Text(t) => {
                let text = t.unescape().unwrap_or_default().into_owned();
                match path.last().map(String::as_str) {
                    Some("href") if path.iter().any(|n| n == "locktoken") => {
                        token = Some(text);
                    }
                    Some("timeout") => {
                        // "Second-3600" or "Infinite"
                        timeout_secs = text
                            .trim()
                            .strip_prefix("Second-")
                            .and_then(|v| v.parse().ok());
                    }
                    _ => {}
                }
            }
            Event::End(_) => {
                path.pop();
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    token.map(|token| LockResult {
        token,
        timeout_secs,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const LISTING: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<D:multistatus xmlns:D="DAV:">
  <D:response>
    <D:href>/dav/</D:href>
    <D:propstat>
      <D:prop>
        <D:displayname>dav</D:displayname>
        <D:resourcetype><D:collection/></D:resourcetype>
        <D:getlastmodified>Sun, 06 Nov 1994 08:49:37 GMT</D:getlastmodified>
      </D:prop>
      <D:status>HTTP/1.1 200 OK</D:status>
    </D:propstat>
  </D:response>
  <D:response>
    <D:href>/dav/report%20final.pdf</D:href>
    <D:propstat>
      <D:prop>
        <D:getcontentlength>52624</D:getcontentlength>
        <D:getcontenttype>application/pdf</D:getcontenttype>
        <D:getetag>"v7"</D:getetag>
      </D:prop>
      <D:status>HTTP/1.1 200 OK</D:status>
    </D:propstat>
    <D:propstat>
      <D:prop><D:checked-in/></D:prop>
      <D:status>HTTP/1.1 404 Not Found</D:status>
    </D:propstat>
  </D:response>
</D:multistatus>"#;

    #[test]
    fn listing_parsed() {
        let ms = parse_multistatus(LISTING.as_bytes()).unwrap();
        assert!(ms.failures.is_empty());
        assert_eq!(ms.entries.len(), 2);

        let dir = &ms.entries[0];
        assert!(dir.is_collection);
        assert_eq!(dir.name, "dav");
        assert_eq!(dir.mtime, Some(784111777));

        let file = &ms.entries[1];
        assert!(!file.is_collection);
        assert_eq!(file.name, "report final.pdf");
        assert_eq!(file.size, Some(52624));
        assert_eq!(file.content_type.as_deref(), Some("application/pdf"));
        assert_eq!(file.etag.as_deref(), Some("\"v7\""));
    }

    #[test]
    fn failed_response_collected() {
        let body = r#"<?xml version="1.0"?>
<D:multistatus xmlns:D="DAV:">
  <D:response>
    <D:href>/a</D:href>
    <D:status>HTTP/1.1 423 Locked</D:status>
    <D:responsedescription>held by another client</D:responsedescription>
  </D:response>
  <D:response>
    <D:href>/b</D:href>
    <D:status>HTTP/1.1 204 No Content</D:status>
  </D:response>
</D:multistatus>"#;
        let ms = parse_multistatus(body.as_bytes()).unwrap();
        assert_eq!(ms.failures.len(), 1);
        assert_eq!(ms.failures[0].href, "/a");
        assert_eq!(ms.failures[0].code, 423);
        assert_eq!(
            ms.failures[0].description.as_deref(),
            Some("held by another client")
        );
        assert_eq!(ms.entries.len(), 1);
    }

    #[test]
    fn lock_token_extracted() {
        let body = r#"<?xml version="1.0"?>
<D:prop xmlns:D="DAV:">
  <D:lockdiscovery>
    <D:activelock>
      <D:locktype><D:write/></D:locktype>
      <D:lockscope><D:exclusive/></D:lockscope>
      <D:timeout>Second-604800</D:timeout>
      <D:locktoken>
        <D:href>opaquelocktoken:e71d4fae-5dec-22d6-fea5-00a0c91e6be4</D:href>
      </D:locktoken>
    </D:activelock>
  </D:lockdiscovery>
</D:prop>"#;
        let lock = parse_lock_token(body.as_bytes()).unwrap();
        assert_eq!(
            lock.token,
            "opaquelocktoken:e71d4fae-5dec-22d6-fea5-00a0c91e6be4"
        );
        assert_eq!(lock.timeout_secs, Some(604800));
    }

    #[test]
    fn garbage_rejected() {
        assert!(parse_multistatus(b"<multistatus><resp").is_err() ||
            parse_multistatus(b"<multistatus><resp").unwrap().entries.is_empty());
    }
}
