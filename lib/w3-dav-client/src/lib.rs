/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

use std::collections::HashSet;
use std::io;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use url::Url;

use w3_auth::AuthScheme;

mod error;
pub use error::{ConnectError, DavError, DavErrorKind, SessionError};

mod config;
pub use config::{HttpCacheConfig, HttpClientConfig};

mod credentials;
pub use credentials::{CredentialProvider, StaticCredentials};

mod request;
pub use request::{DavDepth, DavFields, HttpMethod, HttpRequest};
pub use w3_cache::{CachePlan, CachePolicy};

mod response;
pub use response::ResponseState;

mod connect;
mod ioutil;
mod session;

pub mod dav;
pub use dav::{DavEntry, DavFailure, LockResult, LockScope, MultiStatus};

use connect::HttpConnection;
use response::ResponseParseError;
use session::{CacheRuntime, wire_target};

/// What one completed fetch delivered, beyond the body bytes themselves.
#[derive(Debug, Clone)]
pub struct FetchMeta {
    pub code: u16,
    pub mime: Option<String>,
    pub charset: Option<String>,
    /// decoded bytes actually delivered to the sink
    pub size: u64,
    pub etag: Option<String>,
    pub last_modified: Option<i64>,
    /// a 206 against our Range header: the transfer can be resumed
    pub resumable: bool,
    pub from_cache: bool,
    /// 4xx/5xx body delivered because the caller prefers error pages
    pub is_error_page: bool,
    pub raw_headers: Vec<String>,
}

impl FetchMeta {
    fn from_parts(req: &HttpRequest, rsp: &ResponseState) -> FetchMeta {
        FetchMeta {
            code: rsp.code,
            mime: rsp.mime.clone(),
            charset: rsp.charset.clone(),
            size: 0,
            etag: rsp.etag.clone(),
            last_modified: rsp.last_modified,
            resumable: rsp.code == 206 && req.offset > 0 && !rsp.accept_ranges_none,
            from_cache: req.from_cache,
            is_error_page: rsp.code >= 400,
            raw_headers: rsp.raw_headers.clone(),
        }
    }
}

fn map_http_error(req: &HttpRequest, rsp: &ResponseState) -> SessionError {
    if req.method.is_dav() || matches!(req.url.scheme(), "webdav" | "webdavs") {
        return dav::error_for_code(rsp.code, req.method, &req.url);
    }
    match rsp.code {
        404 | 410 => SessionError::DoesNotExist(req.url.to_string()),
        code if code >= 500 => SessionError::InternalServer(req.url.to_string()),
        _ => SessionError::AccessDenied(req.url.to_string()),
    }
}

fn last_segment(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    let seg = match trimmed.rsplit_once('/') {
        Some((_, name)) => name,
        None => trimmed,
    };
    percent_encoding::percent_decode_str(seg)
        .decode_utf8_lossy()
        .into_owned()
}

const STAT_PROPS: &[&str] = &[
    "creationdate",
    "getcontentlength",
    "displayname",
    "getcontenttype",
    "getlastmodified",
    "getetag",
    "lockdiscovery",
    "resourcetype",
];

const XML_CONTENT_TYPE: &str = "text/xml; charset=utf-8";

/// The protocol engine: one client drives one request at a time over one
/// (optionally reused) connection, with the disk cache and the auth
/// conversations riding along between operations.
pub struct HttpClient {
    pub(crate) config: HttpClientConfig,
    pub(crate) cache: Option<CacheRuntime>,
    pub(crate) credentials: Option<Box<dyn CredentialProvider>>,
    pub(crate) connection: Option<HttpConnection>,
    pub(crate) www_auth: Option<AuthScheme>,
    pub(crate) proxy_auth: Option<AuthScheme>,
    pub(crate) www_challenge_raw: Option<String>,
    pub(crate) proxy_challenge_raw: Option<String>,
    pub(crate) www_creds: Option<(String, String)>,
    pub(crate) proxy_creds: Option<(String, String)>,
    pub(crate) www_auth_saved: bool,
    pub(crate) proxy_auth_saved: bool,
    pub(crate) auth_origin: Option<String>,
    pub(crate) last_code: u16,
    dav_capable_hosts: HashSet<String>,
}

impl HttpClient {
    pub fn new(config: HttpClientConfig) -> io::Result<HttpClient> {
        let cache = match &config.cache {
            Some(c) => Some(CacheRuntime::open(c)?),
            None => None,
        };
        Ok(HttpClient {
            config,
            cache,
            credentials: None,
            connection: None,
            www_auth: None,
            proxy_auth: None,
            www_challenge_raw: None,
            proxy_challenge_raw: None,
            www_creds: None,
            proxy_creds: None,
            www_auth_saved: false,
            proxy_auth_saved: false,
            auth_origin: None,
            last_code: 0,
            dav_capable_hosts: HashSet::new(),
        })
    }

    pub fn set_credentials(&mut self, provider: Box<dyn CredentialProvider>) {
        self.credentials = Some(provider);
    }

    /// Run a fully prepared request and stream the decoded body into `sink`.
    /// This is the low-level entry the convenience operations build on; use
    /// it directly for ranges, custom headers or special cache policies.
    pub async fn fetch<W>(
        &mut self,
        req: &mut HttpRequest,
        sink: &mut W,
    ) -> Result<FetchMeta, SessionError>
    where
        W: AsyncWrite + Unpin,
    {
        let mut rsp = self.run_request(req).await?;
        if rsp.code >= 400 && !self.config.prefer_error_page {
            self.connection = None;
            return Err(map_http_error(req, &rsp));
        }
        let mut meta = FetchMeta::from_parts(req, &rsp);
        meta.size = self.read_body(req, &mut rsp, sink).await?;
        Ok(meta)
    }

    pub async fn get<W>(&mut self, url: Url, sink: &mut W) -> Result<FetchMeta, SessionError>
    where
        W: AsyncWrite + Unpin,
    {
        let mut req = HttpRequest::new(url, HttpMethod::Get);
        if let Some(cache) = &self.cache {
            req.cache_policy = cache.default_policy;
        }
        self.fetch(&mut req, sink).await
    }

    pub async fn post<W>(
        &mut self,
        url: Url,
        body: Vec<u8>,
        content_type: &str,
        sink: &mut W,
    ) -> Result<FetchMeta, SessionError>
    where
        W: AsyncWrite + Unpin,
    {
        let mut req = HttpRequest::new(url, HttpMethod::Post);
        req.body = Some(body);
        req.content_type = Some(content_type.to_string());
        self.fetch(&mut req, sink).await
    }

    pub async fn put(
        &mut self,
        url: Url,
        data: Vec<u8>,
        content_type: Option<&str>,
        overwrite: bool,
    ) -> Result<(), SessionError> {
        if !overwrite && matches!(url.scheme(), "webdav" | "webdavs") {
            match self.stat(&url).await {
                Ok(_) => {
                    return Err(SessionError::Dav(DavError {
                        kind: DavErrorKind::AlreadyExists,
                        message: format!("refusing to overwrite existing resource {url}"),
                    }));
                }
                Err(SessionError::DoesNotExist(_)) => {}
                Err(e) => return Err(e),
            }
        }
        let mut req = HttpRequest::new(url, HttpMethod::Put);
        req.body = Some(data);
        req.content_type = content_type.map(str::to_string);
        let (rsp, body) = self.dav_exchange(&mut req).await?;
        self.conclude_simple(&req, &rsp, &body)
    }

    pub async fn del(&mut self, url: Url) -> Result<(), SessionError> {
        let mut req = HttpRequest::new(url, HttpMethod::Delete);
        let (rsp, body) = self.dav_exchange(&mut req).await?;
        self.conclude_simple(&req, &rsp, &body)
    }

    /// Single-resource metadata: PROPFIND depth 0 on WebDAV targets, a HEAD
    /// shaped into the same record on plain http(s).
    pub async fn stat(&mut self, url: &Url) -> Result<DavEntry, SessionError> {
        if matches!(url.scheme(), "webdav" | "webdavs") {
            let mut req = HttpRequest::new(url.clone(), HttpMethod::PropFind);
            req.dav.depth = DavDepth::Zero;
            req.dav.body = Some(dav::propfind_body(Some(STAT_PROPS))?);
            req.content_type = Some(XML_CONTENT_TYPE.to_string());
            let (rsp, body) = self.dav_exchange(&mut req).await?;
            if rsp.code != 207 {
                return Err(dav::error_for_code(rsp.code, req.method, url));
            }
            let ms = dav::parse_multistatus(&body)?;
            ms.entries
                .into_iter()
                .next()
                .ok_or_else(|| SessionError::DoesNotExist(url.to_string()))
        } else {
            let mut req = HttpRequest::new(url.clone(), HttpMethod::Head);
            let mut rsp = self.run_request(&mut req).await?;
            if rsp.code >= 400 {
                self.connection = None;
                return Err(map_http_error(&req, &rsp));
            }
            let mut sink = tokio::io::sink();
            self.read_body(&mut req, &mut rsp, &mut sink).await?;
            Ok(DavEntry {
                href: url.path().to_string(),
                name: last_segment(url.path()),
                is_collection: url.path().ends_with('/'),
                size: rsp.content_length,
                mtime: rsp.last_modified,
                content_type: rsp.mime.clone(),
                etag: rsp.etag.clone(),
                ..Default::default()
            })
        }
    }

    /// PROPFIND depth 1, with the collection itself dropped from the result.
    pub async fn list_dir(&mut self, url: &Url) -> Result<Vec<DavEntry>, SessionError> {
        let mut req = HttpRequest::new(url.clone(), HttpMethod::PropFind);
        req.dav.depth = DavDepth::One;
        req.dav.body = Some(dav::propfind_body(Some(STAT_PROPS))?);
        req.content_type = Some(XML_CONTENT_TYPE.to_string());
        let (rsp, body) = self.dav_exchange(&mut req).await?;
        if rsp.code != 207 {
            return Err(dav::error_for_code(rsp.code, req.method, url));
        }
        let ms = dav::parse_multistatus(&body)?;
        if let Some(msg) = dav::aggregate_failures(&ms) {
            return Err(SessionError::MultiStatus(msg));
        }
        let base = decoded_path(url);
        let base = base.trim_end_matches('/');
        let mut entries = ms.entries;
        entries.retain(|e| href_path(&e.href).trim_end_matches('/') != base);
        Ok(entries)
    }

    pub async fn mkdir(&mut self, url: Url) -> Result<(), SessionError> {
        let mut req = HttpRequest::new(url, HttpMethod::MkCol);
        let (rsp, _body) = self.dav_exchange(&mut req).await?;
        match rsp.code {
            200 | 201 => Ok(()),
            code => Err(dav::error_for_code(code, HttpMethod::MkCol, &req.url)),
        }
    }

    pub async fn copy(
        &mut self,
        src: &Url,
        dst: &Url,
        overwrite: bool,
    ) -> Result<(), SessionError> {
        self.copy_or_move(src, dst, overwrite, HttpMethod::Copy).await
    }

    pub async fn rename(
        &mut self,
        src: &Url,
        dst: &Url,
        overwrite: bool,
    ) -> Result<(), SessionError> {
        self.copy_or_move(src, dst, overwrite, HttpMethod::Move).await
    }

    async fn copy_or_move(
        &mut self,
        src: &Url,
        dst: &Url,
        overwrite: bool,
        method: HttpMethod,
    ) -> Result<(), SessionError> {
        let mut req = HttpRequest::new(src.clone(), method);
        req.dav.destination = Some(dst.clone());
        req.dav.overwrite = overwrite;
        let (rsp, body) = self.dav_exchange(&mut req).await?;
        self.conclude_simple(&req, &rsp, &body)
    }

    pub async fn mimetype(&mut self, url: &Url) -> Result<String, SessionError> {
        let entry = self.stat(url).await?;
        Ok(entry
            .content_type
            .unwrap_or_else(|| "application/octet-stream".to_string()))
    }

    pub async fn dav_lock(
        &mut self,
        url: &Url,
        scope: LockScope,
        owner: &str,
        timeout_secs: u32,
    ) -> Result<LockResult, SessionError> {
        let mut req = HttpRequest::new(url.clone(), HttpMethod::Lock);
        req.dav.timeout_secs = timeout_secs;
        req.dav.body = Some(dav::lock_body(scope, owner)?);
        req.content_type = Some(XML_CONTENT_TYPE.to_string());
        let (rsp, body) = self.dav_exchange(&mut req).await?;
        match rsp.code {
            200 | 201 => dav::parse_lock_token(&body).ok_or_else(|| {
                SessionError::Dav(DavError {
                    kind: DavErrorKind::Generic,
                    message: format!("lock granted on {url} but no token returned"),
                })
            }),
            code => Err(dav::error_for_code(code, HttpMethod::Lock, url)),
        }
    }

    pub async fn dav_unlock(&mut self, url: &Url, token: &str) -> Result<(), SessionError> {
        let mut req = HttpRequest::new(url.clone(), HttpMethod::Unlock);
        req.dav.lock_token = Some(token.to_string());
        let (rsp, _body) = self.dav_exchange(&mut req).await?;
        match rsp.code {
            200 | 204 => Ok(()),
            code => Err(dav::error_for_code(code, HttpMethod::Unlock, url)),
        }
    }

    /// Any DAV verb with a caller supplied XML body, response delivered raw.
    pub async fn dav_generic<W>(
        &mut self,
        url: &Url,
        method: &str,
        body: Option<Vec<u8>>,
        depth: DavDepth,
        sink: &mut W,
    ) -> Result<FetchMeta, SessionError>
    where
        W: AsyncWrite + Unpin,
    {
        let method = match method {
            "PROPFIND" => HttpMethod::PropFind,
            "PROPPATCH" => HttpMethod::PropPatch,
            "SEARCH" => HttpMethod::Search,
            "REPORT" => HttpMethod::Report,
            "LOCK" => HttpMethod::Lock,
            "UNLOCK" => HttpMethod::Unlock,
            other => return Err(SessionError::UnsupportedProtocol(other.to_string())),
        };
        let mut req = HttpRequest::new(url.clone(), method);
        req.dav.depth = depth;
        if let Some(b) = body {
            req.dav.body = Some(b);
            req.content_type = Some(XML_CONTENT_TYPE.to_string());
        }
        self.ensure_dav_host(url).await?;
        self.fetch(&mut req, sink).await
    }

    /// `OPTIONS *` capability probe: the host must advertise WebDAV
    /// compliance class 1, 2 or 3 before any DAV operation is attempted.
    /// The verdict is remembered per host.
    pub async fn dav_host_ok(&mut self, url: &Url) -> Result<bool, SessionError> {
        let target = wire_target(url, self.config.proxy.as_ref())?;
        let key = format!("{}:{}", target.host, target.port);
        if self.dav_capable_hosts.contains(&key) {
            return Ok(true);
        }
        let mut req = HttpRequest::new(url.clone(), HttpMethod::Options);
        req.options_star = true;
        let mut rsp = self.run_request(&mut req).await?;
        let mut sink = tokio::io::sink();
        self.read_body(&mut req, &mut rsp, &mut sink).await?;
        let ok = dav::dav_class_supported(&rsp.dav_capabilities);
        if ok {
            self.dav_capable_hosts.insert(key);
        }
        Ok(ok)
    }

    /// Pipelined batch GET: every request head is written before the first
    /// response is read, then responses are consumed in matching order. The
    /// server has to support pipelining; one broken response fails the rest
    /// of the batch, never an earlier success.
    pub async fn multi_get(
        &mut self,
        urls: &[Url],
    ) -> Result<Vec<Result<(FetchMeta, Vec<u8>), SessionError>>, SessionError> {
        let Some(first) = urls.first() else {
            return Ok(Vec::new());
        };
        let origin = wire_target(first, self.config.proxy.as_ref())?;
        for url in &urls[1..] {
            let t = wire_target(url, self.config.proxy.as_ref())?;
            if t.host != origin.host || t.port != origin.port || t.tls != origin.tls {
                return Err(SessionError::MalformedUrl(
                    "pipelined requests must share one origin".to_string(),
                ));
            }
        }
        let mut reqs: Vec<HttpRequest> = urls
            .iter()
            .map(|u| HttpRequest::new(u.clone(), HttpMethod::Get))
            .collect();

        self.ensure_connection(&reqs[0]).await?;
        let heads = reqs
            .iter()
            .map(|r| self.build_request_head(r))
            .collect::<Result<Vec<_>, _>>()?;
        {
            let Some(conn) = self.connection.as_mut() else {
                return Err(SessionError::ConnectionBroken(first.to_string()));
            };
            let stream = conn.stream_mut();
            for head in &heads {
                stream.write_all(head.as_bytes()).await?;
            }
            stream.flush().await?;
        }

        let mut results = Vec::with_capacity(reqs.len());
        for req in &mut reqs {
            if self.connection.is_none() {
                results.push(Err(SessionError::ConnectionBroken(req.url.to_string())));
                continue;
            }
            let item = self.read_pipelined(req).await;
            if item.is_err() {
                self.connection = None;
            }
            results.push(item);
        }
        Ok(results)
    }

    async fn read_pipelined(
        &mut self,
        req: &mut HttpRequest,
    ) -> Result<(FetchMeta, Vec<u8>), SessionError> {
        let mut rsp = loop {
            let Some(conn) = self.connection.as_mut() else {
                return Err(SessionError::ConnectionBroken(req.url.to_string()));
            };
            let rsp = timeout(
                self.config.response_timeout,
                ResponseState::parse(conn.stream_mut(), self.config.max_header_size, 0),
            )
            .await
            .map_err(|_| SessionError::ServerTimeout(req.url.to_string()))?
            .map_err(|e| match e {
                ResponseParseError::Io(e) => SessionError::Io(e),
                _ => SessionError::ConnectionBroken(req.url.to_string()),
            })?;
            if rsp.code != 100 && rsp.code != 102 {
                break rsp;
            }
        };
        rsp.apply_mime_fixups(req.url.path(), self.config.allow_compressed);
        let mut body = Vec::new();
        let n = self.read_body(req, &mut rsp, &mut body).await?;
        let mut meta = FetchMeta::from_parts(req, &rsp);
        meta.size = n;
        Ok((meta, body))
    }

    async fn dav_exchange(
        &mut self,
        req: &mut HttpRequest,
    ) -> Result<(ResponseState, Vec<u8>), SessionError> {
        if req.method.is_dav() || matches!(req.url.scheme(), "webdav" | "webdavs") {
            let url = req.url.clone();
            self.ensure_dav_host(&url).await?;
        }
        let mut rsp = self.run_request(req).await?;
        let mut body = Vec::new();
        self.read_body(req, &mut rsp, &mut body).await?;
        Ok((rsp, body))
    }

    async fn ensure_dav_host(&mut self, url: &Url) -> Result<(), SessionError> {
        if self.dav_host_ok(url).await? {
            Ok(())
        } else {
            Err(SessionError::UnsupportedProtocol(format!(
                "{} does not advertise WebDAV support",
                url.host_str().unwrap_or("server")
            )))
        }
    }

    fn conclude_simple(
        &self,
        req: &HttpRequest,
        rsp: &ResponseState,
        body: &[u8],
    ) -> Result<(), SessionError> {
        match rsp.code {
            200 | 201 | 204 => Ok(()),
            207 => {
                let ms = dav::parse_multistatus(body)?;
                match dav::aggregate_failures(&ms) {
                    Some(msg) => Err(SessionError::MultiStatus(msg)),
                    None => Ok(()),
                }
            }
            code => Err(dav::error_for_code(code, req.method, &req.url)),
        }
    }
}

fn decoded_path(url: &Url) -> String {
    percent_encoding::percent_decode_str(url.path())
        .decode_utf8_lossy()
        .into_owned()
}

/// hrefs come back either absolute or as bare paths, decoded either way
fn href_path(href: &str) -> &str {
    match href.find("://") {
        Some(p) => match href[p + 3..].find('/') {
            Some(s) => &href[p + 3 + s..],
            None => "/",
        },
        None => href,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn href_path_forms() {
        assert_eq!(href_path("/dav/file"), "/dav/file");
        assert_eq!(href_path("http://host:8080/dav/file"), "/dav/file");
        assert_eq!(href_path("https://host"), "/");
    }

    #[test]
    fn segment_names() {
        assert_eq!(last_segment("/a/b/c.txt"), "c.txt");
        assert_eq!(last_segment("/a/b/"), "b");
        assert_eq!(last_segment("/spaced%20name"), "spaced name");
    }
}
