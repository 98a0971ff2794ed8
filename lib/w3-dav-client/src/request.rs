/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

use url::Url;

use w3_cache::{CachePolicy, CacheTag};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Put,
    Post,
    Head,
    Delete,
    Options,
    PropFind,
    PropPatch,
    MkCol,
    Copy,
    Move,
    Lock,
    Unlock,
    Search,
    Report,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Put => "PUT",
            HttpMethod::Post => "POST",
            HttpMethod::Head => "HEAD",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Options => "OPTIONS",
            HttpMethod::PropFind => "PROPFIND",
            HttpMethod::PropPatch => "PROPPATCH",
            HttpMethod::MkCol => "MKCOL",
            HttpMethod::Copy => "COPY",
            HttpMethod::Move => "MOVE",
            HttpMethod::Lock => "LOCK",
            HttpMethod::Unlock => "UNLOCK",
            HttpMethod::Search => "SEARCH",
            HttpMethod::Report => "REPORT",
        }
    }

    /// only plain GET responses ever land in the disk cache
    pub fn cacheable(&self) -> bool {
        matches!(self, HttpMethod::Get)
    }

    pub fn is_dav(&self) -> bool {
        matches!(
            self,
            HttpMethod::PropFind
                | HttpMethod::PropPatch
                | HttpMethod::MkCol
                | HttpMethod::Copy
                | HttpMethod::Move
                | HttpMethod::Lock
                | HttpMethod::Unlock
                | HttpMethod::Search
                | HttpMethod::Report
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DavDepth {
    #[default]
    Zero,
    One,
    Infinity,
}

impl DavDepth {
    pub fn as_str(&self) -> &'static str {
        match self {
            DavDepth::Zero => "0",
            DavDepth::One => "1",
            DavDepth::Infinity => "infinity",
        }
    }
}

/// method specific WebDAV request attributes
#[derive(Default)]
pub struct DavFields {
    pub depth: DavDepth,
    pub destination: Option<Url>,
    pub overwrite: bool,
    /// LOCK refresh window in seconds; 0 requests an infinite lock
    pub timeout_secs: u32,
    pub lock_token: Option<String>,
    pub body: Option<Vec<u8>>,
}

/// Mutable per-operation state. One of these lives for one logical
/// operation; redirects mutate it in place (url swap, possible method
/// downgrade), the next operation starts from a fresh value.
pub struct HttpRequest {
    pub url: Url,
    pub method: HttpMethod,
    pub offset: u64,
    pub end_offset: u64,
    pub cache_policy: CachePolicy,
    pub keep_alive: bool,
    pub referrer: Option<String>,
    pub cookie_header: Option<String>,
    pub custom_headers: Vec<String>,
    pub content_type: Option<String>,
    pub body: Option<Vec<u8>>,
    pub dav: DavFields,
    pub cache_tag: CacheTag,
    /// request-URI `*`, used by the OPTIONS capability probe
    pub options_star: bool,
    /// conditional-GET round pending against the cached entry
    pub must_revalidate: bool,
    /// serve the cached payload, the network is done
    pub from_cache: bool,
    pub range_retry_done: bool,
    pub redirects_followed: usize,
}

impl HttpRequest {
    pub fn new(url: Url, method: HttpMethod) -> Self {
        HttpRequest {
            url,
            method,
            offset: 0,
            end_offset: 0,
            cache_policy: CachePolicy::default(),
            keep_alive: true,
            referrer: None,
            cookie_header: None,
            custom_headers: Vec::new(),
            content_type: None,
            body: None,
            dav: DavFields::default(),
            cache_tag: CacheTag::default(),
            options_star: false,
            must_revalidate: false,
            from_cache: false,
            range_retry_done: false,
            redirects_followed: 0,
        }
    }

    /// start the next unrelated operation from a clean slate
    pub fn reset_for(&mut self, url: Url, method: HttpMethod) {
        *self = HttpRequest::new(url, method);
    }

    /// Accept caller supplied extra headers, minus anything that could
    /// spoof the request envelope. Full request lines, `Host:`,
    /// `Proxy-Authorization:` and `Via:` never pass through.
    pub fn set_custom_headers(&mut self, raw: &str) {
        self.custom_headers.clear();
        for line in raw.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let lower = line.to_lowercase();
            if lower.starts_with("host:")
                || lower.starts_with("proxy-authorization:")
                || lower.starts_with("via:")
            {
                continue;
            }
            // "GET / HTTP/1.1" style smuggling attempts
            if !line.contains(':') || lower.contains(" http/") {
                continue;
            }
            self.custom_headers.push(line.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn custom_header_sanitizing() {
        let url = Url::parse("http://host/").unwrap();
        let mut req = HttpRequest::new(url, HttpMethod::Get);
        req.set_custom_headers(
            "X-Requested-With: XMLHttpRequest\r\n\
             Host: evil.example\r\n\
             Proxy-Authorization: Basic xxx\r\n\
             Via: 1.1 fake\r\n\
             GET /smuggled HTTP/1.1\r\n\
             Accept-Language: de\r\n",
        );
        assert_eq!(
            req.custom_headers,
            ["X-Requested-With: XMLHttpRequest", "Accept-Language: de"]
        );
    }

    #[test]
    fn method_strings() {
        assert_eq!(HttpMethod::PropFind.as_str(), "PROPFIND");
        assert!(HttpMethod::MkCol.is_dav());
        assert!(!HttpMethod::Get.is_dav());
        assert!(HttpMethod::Get.cacheable());
        assert!(!HttpMethod::Post.cacheable());
    }
}
