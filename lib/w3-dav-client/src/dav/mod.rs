/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

use url::Url;

use crate::error::{DavError, DavErrorKind, SessionError};
use crate::request::HttpMethod;

mod xml;
pub(crate) use xml::{lock_body, propfind_body};

mod multistatus;
pub(crate) use multistatus::{parse_lock_token, parse_multistatus};
pub use multistatus::{DavFailure, MultiStatus};

/// One resource out of a PROPFIND listing, shaped like a directory entry.
#[derive(Debug, Clone, Default)]
pub struct DavEntry {
    /// server supplied href, percent-decoded
    pub href: String,
    /// last path segment of the href
    pub name: String,
    pub display_name: Option<String>,
    pub is_collection: bool,
    pub size: Option<u64>,
    pub mtime: Option<i64>,
    pub ctime: Option<i64>,
    pub content_type: Option<String>,
    pub etag: Option<String>,
    pub lock_token: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockScope {
    Exclusive,
    Shared,
}

#[derive(Debug, Clone)]
pub struct LockResult {
    pub token: String,
    pub timeout_secs: Option<u32>,
}

/// Map a terminal DAV response code to the caller-facing error, worded for
/// the operation that failed.
pub(crate) fn error_for_code(code: u16, method: HttpMethod, url: &Url) -> SessionError {
    let what = match method {
        HttpMethod::MkCol => "create collection",
        HttpMethod::Copy => "copy",
        HttpMethod::Move => "move",
        HttpMethod::Delete => "delete",
        HttpMethod::Lock => "lock",
        HttpMethod::Unlock => "unlock",
        HttpMethod::PropPatch => "modify properties of",
        HttpMethod::PropFind => "examine",
        HttpMethod::Put => "write",
        HttpMethod::Search => "search",
        _ => "access",
    };
    let (kind, detail) = match code {
        403 | 500 => (DavErrorKind::AccessDenied, "the server forbids it"),
        404 | 410 => return SessionError::DoesNotExist(url.to_string()),
        405 => (
            DavErrorKind::AlreadyExists,
            "the resource already exists or the method is not allowed on it",
        ),
        409 => (
            DavErrorKind::OrderedCreationRequired,
            "a parent collection is missing and must be created first",
        ),
        412 => (
            DavErrorKind::PreconditionFailed,
            "a precondition on the request failed, the resource may have changed",
        ),
        415 => (
            DavErrorKind::UnsupportedMedia,
            "the server does not accept this content type here",
        ),
        423 => (DavErrorKind::Locked, "the resource is locked"),
        507 => (
            DavErrorKind::DiskFull,
            "the server is out of storage space",
        ),
        _ => (DavErrorKind::Generic, "the server rejected the request"),
    };
    SessionError::Dav(DavError {
        kind,
        message: format!("unable to {what} {url}: {detail} (status {code})"),
    })
}

/// Aggregate the per-resource failures of a 207 reply into one message.
pub(crate) fn aggregate_failures(ms: &MultiStatus) -> Option<String> {
    if ms.failures.is_empty() {
        return None;
    }
    let mut out = String::new();
    for f in &ms.failures {
        if !out.is_empty() {
            out.push('\n');
        }
        out.push_str(&f.href);
        out.push_str(": ");
        out.push_str(&f.status_line);
        if let Some(desc) = &f.description {
            out.push_str(" (");
            out.push_str(desc);
            out.push(')');
        }
    }
    Some(out)
}

/// Whether a `DAV:` compliance header advertises class 1, 2 or 3.
pub(crate) fn dav_class_supported(capabilities: &[String]) -> bool {
    capabilities
        .iter()
        .any(|c| matches!(c.trim(), "1" | "2" | "3"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mkcol_405_is_already_exists() {
        let url = Url::parse("http://host/dir").unwrap();
        match error_for_code(405, HttpMethod::MkCol, &url) {
            SessionError::Dav(e) => assert_eq!(e.kind, DavErrorKind::AlreadyExists),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn not_found_maps_out_of_dav() {
        let url = Url::parse("http://host/gone").unwrap();
        assert!(matches!(
            error_for_code(404, HttpMethod::PropFind, &url),
            SessionError::DoesNotExist(_)
        ));
    }

    #[test]
    fn locked_and_disk_full() {
        let url = Url::parse("http://host/f").unwrap();
        match error_for_code(423, HttpMethod::Put, &url) {
            SessionError::Dav(e) => assert_eq!(e.kind, DavErrorKind::Locked),
            other => panic!("unexpected error {other:?}"),
        }
        match error_for_code(507, HttpMethod::Put, &url) {
            SessionError::Dav(e) => assert_eq!(e.kind, DavErrorKind::DiskFull),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn compliance_classes() {
        let caps = |v: &[&str]| v.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        assert!(dav_class_supported(&caps(&["1", "2"])));
        assert!(dav_class_supported(&caps(&["1", "3", "access-control"])));
        assert!(!dav_class_supported(&caps(&["calendar-access"])));
        assert!(!dav_class_supported(&caps(&[])));
    }
}
