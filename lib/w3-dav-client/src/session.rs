/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

use std::io;

use chrono::Utc;
use log::{debug, warn};
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use url::Url;

use w3_auth::{AuthScheme, best_offer};
use w3_cache::{
    CLEANER_CMD_CREATED, CLEANER_CMD_USED, CacheIo, CachePlan, CachePolicy, CacheReader,
    CacheStore, CacheTag, CleanerNotifier, EntryHeader, EntryText, UNKNOWN_DATE, canonical_url,
    entry_filename,
};
use w3_http::body::DecoderChain;
use w3_http::httpdate::format_http_date;

use crate::HttpClient;
use crate::config::HttpCacheConfig;
use crate::connect::HttpConnection;
use crate::error::SessionError;
use crate::request::{HttpMethod, HttpRequest};
use crate::response::{ResponseParseError, ResponseState};

/// expire-date extension a 304 grants when the server stays silent on expiry
const REVALIDATE_GRACE: i64 = 60;

pub(crate) fn now_unix() -> i64 {
    Utc::now().timestamp()
}

/// The disk cache wired up for one client: store, cleaner feed, policy knobs.
pub(crate) struct CacheRuntime {
    pub(crate) store: CacheStore,
    pub(crate) notifier: Option<CleanerNotifier>,
    pub(crate) max_age: i64,
    pub(crate) default_policy: CachePolicy,
}

impl CacheRuntime {
    pub(crate) fn open(config: &HttpCacheConfig) -> io::Result<CacheRuntime> {
        let store = CacheStore::open(&config.dir)?;
        let notifier = config
            .cleaner_socket
            .as_ref()
            .map(|path| CleanerNotifier::new(path.clone(), config.cleaner_argv.clone()));
        Ok(CacheRuntime {
            store,
            notifier,
            max_age: config.max_age,
            default_policy: config.default_policy,
        })
    }

    fn notify(&self, header: &EntryHeader, command: u32, canonical: &str) {
        if let Some(n) = &self.notifier {
            n.notify(header, command, &entry_filename(canonical));
        }
    }
}

/// where the request goes on the wire
pub(crate) struct Target {
    pub(crate) host: String,
    pub(crate) port: u16,
    pub(crate) tls: bool,
    pub(crate) via_proxy: bool,
}

pub(crate) fn wire_target(url: &Url, proxy: Option<&Url>) -> Result<Target, SessionError> {
    let tls = match url.scheme() {
        "http" | "webdav" => false,
        "https" | "webdavs" => true,
        other => return Err(SessionError::UnsupportedProtocol(other.to_string())),
    };
    let host = url
        .host_str()
        .ok_or_else(|| SessionError::MalformedUrl(url.to_string()))?
        .to_string();
    let port = url.port().unwrap_or(if tls { 443 } else { 80 });
    // plain requests go through the proxy as-is; TLS targets connect direct
    let via_proxy = !tls && proxy.is_some();
    Ok(Target {
        host,
        port,
        tls,
        via_proxy,
    })
}

/// bracketed IPv6 hosts lose their zone id before hitting the wire
fn host_for_header(host: &str, port: u16, tls: bool) -> String {
    let bare = if let Some(rest) = host.strip_prefix('[') {
        let addr = rest.trim_end_matches(']');
        let addr = addr.split('%').next().unwrap_or(addr);
        format!("[{addr}]")
    } else {
        host.to_string()
    };
    let default_port = if tls { 443 } else { 80 };
    if port == default_port {
        bare
    } else {
        format!("{bare}:{port}")
    }
}

fn path_and_query(url: &Url) -> String {
    let mut s = if url.path().is_empty() {
        "/".to_string()
    } else {
        url.path().to_string()
    };
    if let Some(q) = url.query() {
        s.push('?');
        s.push_str(q);
    }
    s
}

enum ExchangeFail {
    /// peer closed before any usable response byte
    Closed,
    Timeout,
    TooLargeHeader(usize),
    Io(io::Error),
}

fn closed_kind(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
    )
}

impl HttpClient {
    /// The top of the state machine: repeat {send request, read response
    /// header} until a terminal response is obtained. Recoverable rounds
    /// (auth retries, redirects, keep-alive races, range retries, TLS
    /// upgrades) loop; everything else returns.
    pub(crate) async fn run_request(
        &mut self,
        req: &mut HttpRequest,
    ) -> Result<ResponseState, SessionError> {
        wire_target(&req.url, self.config.proxy.as_ref())?;
        self.prepare_proactive_auth(req);

        let mut cache_checked: Option<String> = None;
        let mut prev_code = 0u16;
        loop {
            if req.method.cacheable() && self.cache.is_some() {
                let canonical = canonical_url(&req.url);
                if cache_checked.as_deref() != Some(canonical.as_str()) {
                    cache_checked = Some(canonical.clone());
                    if let Some(rsp) = self.satisfy_from_cache(req, &canonical)? {
                        return Ok(rsp);
                    }
                }
            }

            let mut rsp = self.exchange(req, prev_code).await?;
            prev_code = rsp.code;
            rsp.apply_mime_fixups(req.url.path(), self.config.allow_compressed);
            if let (Some(conn), Some(t)) = (&mut self.connection, rsp.keep_alive_timeout) {
                conn.set_keep_alive_timeout(t);
            }

            match rsp.code {
                401 | 407 => {
                    if self.handle_auth_challenge(req, &rsp)? {
                        // throw away whatever error page came along
                        self.apply_auth_connection_flags(&mut rsp);
                        self.discard_body(req, &mut rsp).await?;
                        continue;
                    }
                    self.last_code = rsp.code;
                    if self.config.prefer_error_page {
                        return Ok(rsp);
                    }
                    self.connection = None;
                    return Err(SessionError::AuthenticationFailed(req.url.to_string()));
                }
                301 | 302 | 303 | 307 if rsp.location.is_some() => {
                    self.note_auth_success(req, &rsp);
                    self.discard_body(req, &mut rsp).await?;
                    self.follow_redirect(req, &rsp)?;
                    continue;
                }
                304 if req.must_revalidate => {
                    self.note_auth_success(req, &rsp);
                    if !rsp.keep_alive {
                        self.connection = None;
                    }
                    return self.serve_revalidated(req, &rsp);
                }
                416 if req.offset > 0 && !req.range_retry_done => {
                    // the server cannot satisfy the resume range: refetch whole
                    req.range_retry_done = true;
                    req.offset = 0;
                    req.end_offset = 0;
                    self.discard_body(req, &mut rsp).await?;
                    continue;
                }
                426 => {
                    let tls_offered = rsp
                        .upgrade_offers
                        .iter()
                        .any(|o| o.to_ascii_uppercase().starts_with("TLS/"));
                    let plain = self.connection.as_ref().is_some_and(|c| !c.is_tls());
                    if tls_offered && plain {
                        self.discard_body(req, &mut rsp).await?;
                        let target = wire_target(&req.url, self.config.proxy.as_ref())?;
                        if let Some(conn) = self.connection.take() {
                            self.connection = Some(conn.upgrade_tls(&target.host).await?);
                            continue;
                        }
                    }
                    self.connection = None;
                    return Err(SessionError::UpgradeRequired(
                        rsp.upgrade_offers.join(", "),
                    ));
                }
                _ => {
                    self.note_auth_success(req, &rsp);
                    if (200..300).contains(&rsp.code) {
                        self.maybe_open_cache_writer(req, &rsp);
                    }
                    return Ok(rsp);
                }
            }
        }
    }

    /// send once, with a single reconnect retry for the keep-alive race
    async fn exchange(
        &mut self,
        req: &HttpRequest,
        prev_code: u16,
    ) -> Result<ResponseState, SessionError> {
        let mut retried = false;
        loop {
            let reused = self.ensure_connection(req).await?;
            match self.send_and_read(req, prev_code).await {
                Ok(rsp) => return Ok(rsp),
                Err(ExchangeFail::Closed) => {
                    self.connection = None;
                    if reused && !retried {
                        // the server tore the idle connection down while our
                        // request was in flight; resend on a fresh one
                        debug!("keep-alive connection raced shut, reconnecting");
                        retried = true;
                        continue;
                    }
                    if req.method == HttpMethod::Head {
                        // some broken servers hang up on HEAD without a word
                        debug!("peer closed on HEAD without reply, assuming html");
                        return Ok(ResponseState::assume_head_ok());
                    }
                    return Err(SessionError::ConnectionBroken(req.url.to_string()));
                }
                Err(ExchangeFail::Timeout) => {
                    self.connection = None;
                    return Err(SessionError::ServerTimeout(req.url.to_string()));
                }
                Err(ExchangeFail::TooLargeHeader(n)) => {
                    self.connection = None;
                    return Err(SessionError::Io(io::Error::other(format!(
                        "response header block exceeds {n} bytes"
                    ))));
                }
                Err(ExchangeFail::Io(e)) => {
                    self.connection = None;
                    if closed_kind(e.kind()) && reused && !retried {
                        retried = true;
                        continue;
                    }
                    return Err(SessionError::Io(e));
                }
            }
        }
    }

    /// Reuse the held connection when it still points at the right place and
    /// has not idled out, otherwise build a fresh one. Returns whether the
    /// connection was reused.
    pub(crate) async fn ensure_connection(
        &mut self,
        req: &HttpRequest,
    ) -> Result<bool, SessionError> {
        let target = wire_target(&req.url, self.config.proxy.as_ref())?;
        let origin = format!("{}:{}:{}", target.host, target.port, target.tls);
        if self.auth_origin.as_deref() != Some(origin.as_str()) {
            // auth conversations never outlive their origin
            self.www_auth = None;
            self.www_challenge_raw = None;
            self.www_auth_saved = false;
            self.auth_origin = Some(origin);
        }

        let (conn_host, conn_port) = if target.via_proxy {
            let proxy = self.config.proxy.as_ref().unwrap_or(&req.url);
            let host = proxy
                .host_str()
                .ok_or_else(|| SessionError::MalformedUrl(proxy.to_string()))?;
            (host.to_string(), proxy.port_or_known_default().unwrap_or(8080))
        } else {
            (target.host.clone(), target.port)
        };

        if let Some(conn) = &self.connection {
            // a 426-upgraded socket is tls even though the url scheme is not
            let usable = conn.matches(&conn_host, conn_port, target.tls, target.via_proxy)
                || conn.matches(&conn_host, conn_port, true, target.via_proxy);
            if usable && !conn.idle_expired() {
                return Ok(true);
            }
        }
        self.connection = None;
        let tls_server = target.tls.then_some(target.host.as_str());
        let conn = HttpConnection::connect(
            &conn_host,
            conn_port,
            tls_server,
            target.via_proxy,
            self.config.connect_timeout,
        )
        .await?;
        self.connection = Some(conn);
        Ok(false)
    }

    async fn send_and_read(
        &mut self,
        req: &HttpRequest,
        prev_code: u16,
    ) -> Result<ResponseState, ExchangeFail> {
        let head = self
            .build_request_head(req)
            .map_err(|e| ExchangeFail::Io(io::Error::other(e.to_string())))?;
        debug!("sending {} {}", req.method.as_str(), req.url);

        let Some(conn) = self.connection.as_mut() else {
            return Err(ExchangeFail::Io(io::Error::other("no connection")));
        };
        let stream = conn.stream_mut();

        let io_fail = |e: io::Error| {
            if closed_kind(e.kind()) {
                ExchangeFail::Closed
            } else {
                ExchangeFail::Io(e)
            }
        };
        stream.write_all(head.as_bytes()).await.map_err(io_fail)?;
        if let Some(body) = req.body.as_ref().or(req.dav.body.as_ref()) {
            stream.write_all(body).await.map_err(io_fail)?;
        }
        stream.flush().await.map_err(io_fail)?;

        loop {
            let rsp = timeout(
                self.config.response_timeout,
                ResponseState::parse(stream, self.config.max_header_size, prev_code),
            )
            .await
            .map_err(|_| ExchangeFail::Timeout)?
            .map_err(|e| match e {
                ResponseParseError::RemoteClosed => ExchangeFail::Closed,
                ResponseParseError::TooLargeHeader(n) => ExchangeFail::TooLargeHeader(n),
                ResponseParseError::Io(e) if closed_kind(e.kind()) => ExchangeFail::Closed,
                ResponseParseError::Io(e) => ExchangeFail::Io(e),
            })?;
            if rsp.code == 100 || rsp.code == 102 {
                // informational, the real header follows on the same socket
                debug!("skipping informational {}", rsp.code);
                continue;
            }
            debug!("got response {} for {}", rsp.code, req.url);
            return Ok(rsp);
        }
    }

    /// serialize the request line and every header this round calls for
    pub(crate) fn build_request_head(&self, req: &HttpRequest) -> Result<String, SessionError> {
        let target = wire_target(&req.url, self.config.proxy.as_ref())?;
        let host_header = host_for_header(&target.host, target.port, target.tls);

        let mut head = String::with_capacity(512);
        head.push_str(req.method.as_str());
        head.push(' ');
        if req.options_star {
            head.push('*');
        } else if target.via_proxy {
            // absolute-URI form, userinfo and fragment never leave the client
            head.push_str("http://");
            head.push_str(&host_header);
            head.push_str(&path_and_query(&req.url));
        } else {
            head.push_str(&path_and_query(&req.url));
        }
        head.push_str(" HTTP/1.1\r\nHost: ");
        head.push_str(&host_header);
        head.push_str("\r\n");

        let persist = self.config.persistent_connections
            && req.keep_alive
            && (!target.via_proxy || self.config.persistent_proxy_connection);
        let connection_header = if target.via_proxy {
            "Proxy-Connection: "
        } else {
            "Connection: "
        };
        head.push_str(connection_header);
        head.push_str(if persist { "keep-alive\r\n" } else { "close\r\n" });

        if let Some(ua) = &self.config.user_agent {
            head.push_str("User-Agent: ");
            head.push_str(ua);
            head.push_str("\r\n");
        }
        if let Some(referrer) = &req.referrer {
            // never tell a plain-http site where on an https site we were
            let downgrade = referrer.starts_with("https") && !target.tls;
            if !downgrade || self.config.send_referrer_on_downgrade {
                head.push_str("Referer: ");
                head.push_str(referrer);
                head.push_str("\r\n");
            }
        }
        if req.offset > 0 || req.end_offset > 0 {
            head.push_str("Range: bytes=");
            head.push_str(&req.offset.to_string());
            head.push('-');
            if req.end_offset > req.offset {
                head.push_str(&req.end_offset.to_string());
            }
            head.push_str("\r\n");
        }

        if req.cache_policy == CachePolicy::Reload {
            head.push_str("Pragma: no-cache\r\nCache-control: no-cache\r\n");
        } else if req.must_revalidate {
            if !req.cache_tag.etag.is_empty() {
                head.push_str("If-None-Match: ");
                head.push_str(&req.cache_tag.etag);
                head.push_str("\r\n");
            }
            if req.cache_tag.last_modified != UNKNOWN_DATE {
                head.push_str("If-Modified-Since: ");
                head.push_str(&format_http_date(req.cache_tag.last_modified));
                head.push_str("\r\n");
            }
        }

        head.push_str("Accept: ");
        head.push_str(&self.config.accept);
        head.push_str("\r\n");
        if self.config.allow_compressed {
            head.push_str("Accept-Encoding: gzip, deflate\r\n");
        }
        if let Some(cs) = &self.config.accept_charsets {
            head.push_str("Accept-Charset: ");
            head.push_str(cs);
            head.push_str("\r\n");
        }
        if let Some(lang) = &self.config.accept_languages {
            head.push_str("Accept-Language: ");
            head.push_str(lang);
            head.push_str("\r\n");
        }
        if let Some(cookie) = &req.cookie_header {
            head.push_str("Cookie: ");
            head.push_str(cookie);
            head.push_str("\r\n");
        }
        for line in &req.custom_headers {
            head.push_str(line);
            head.push_str("\r\n");
        }

        if req.method.is_dav() {
            match req.method {
                HttpMethod::PropFind
                | HttpMethod::Search
                | HttpMethod::Report
                | HttpMethod::Lock => {
                    head.push_str("Depth: ");
                    head.push_str(req.dav.depth.as_str());
                    head.push_str("\r\n");
                }
                HttpMethod::Copy | HttpMethod::Move => {
                    head.push_str("Depth: infinity\r\n");
                }
                _ => {}
            }
            if let Some(dest) = &req.dav.destination {
                head.push_str("Destination: ");
                head.push_str(dest.as_str());
                head.push_str("\r\n");
            }
            if matches!(req.method, HttpMethod::Copy | HttpMethod::Move) {
                head.push_str("Overwrite: ");
                head.push_str(if req.dav.overwrite { "T\r\n" } else { "F\r\n" });
            }
            if req.method == HttpMethod::Lock {
                if req.dav.timeout_secs == 0 {
                    head.push_str("Timeout: Infinite\r\n");
                } else {
                    head.push_str("Timeout: Second-");
                    head.push_str(&req.dav.timeout_secs.to_string());
                    head.push_str("\r\n");
                }
            }
        }
        if let Some(token) = &req.dav.lock_token {
            if req.method == HttpMethod::Unlock {
                head.push_str("Lock-token: <");
                head.push_str(token);
                head.push_str(">\r\n");
            } else {
                head.push_str("If: (<");
                head.push_str(token);
                head.push_str(">)\r\n");
            }
        }

        let body = req.body.as_ref().or(req.dav.body.as_ref());
        if let Some(body) = body {
            if let Some(ct) = &req.content_type {
                head.push_str("Content-Type: ");
                head.push_str(ct);
                head.push_str("\r\n");
            }
            head.push_str("Content-Length: ");
            head.push_str(&body.len().to_string());
            head.push_str("\r\n");
        } else if matches!(req.method, HttpMethod::Put | HttpMethod::Post) {
            head.push_str("Content-Length: 0\r\n");
        }

        if let Some(auth) = &self.www_auth {
            let fragment = auth.header_fragment();
            if !fragment.is_empty() {
                head.push_str("Authorization: ");
                head.push_str(fragment);
            }
        }
        if target.via_proxy {
            if let Some(auth) = &self.proxy_auth {
                let fragment = auth.header_fragment();
                if !fragment.is_empty() {
                    head.push_str("Proxy-Authorization: ");
                    head.push_str(fragment);
                }
            }
        }

        head.push_str("\r\n");
        Ok(head)
    }

    /// Regenerate the held auth header for a new operation so the first
    /// round trip does not fail a guaranteed 401. Skipped right after an
    /// auth failure and for connection-bound NTLM conversations.
    fn prepare_proactive_auth(&mut self, req: &HttpRequest) {
        if self.last_code == 401 {
            return;
        }
        if matches!(self.www_auth, Some(AuthScheme::Ntlm(_))) {
            // NTLM authenticated the connection, not the request; a finished
            // conversation has nothing to offer the next operation
            self.www_auth = None;
            self.www_challenge_raw = None;
            return;
        }
        let (Some(auth), Some(raw), Some((user, pass))) = (
            self.www_auth.as_mut(),
            self.www_challenge_raw.as_ref(),
            self.www_creds.as_ref(),
        ) else {
            return;
        };
        let ok = auth
            .set_challenge(raw, &req.url, req.method.as_str())
            .and_then(|_| auth.generate_response(user, pass))
            .is_ok();
        if !ok {
            // out of protection domain or similar; wait for a fresh challenge
            self.www_auth = None;
            self.www_challenge_raw = None;
        }
    }

    /// Build or advance the auth conversation for a 401/407. Returns whether
    /// a response header was generated and the request should be resent.
    fn handle_auth_challenge(
        &mut self,
        req: &HttpRequest,
        rsp: &ResponseState,
    ) -> Result<bool, SessionError> {
        let proxy = rsp.code == 407;
        if rsp.code == 401 && rsp.prev_code == 407 {
            // the proxy conversation just concluded successfully
            self.save_credentials(req, true);
        }
        let challenges: Vec<String> = if proxy {
            rsp.proxy_challenges.clone()
        } else {
            rsp.www_challenges.clone()
        };
        if challenges.is_empty() {
            return Ok(false);
        }

        // continue an in-flight conversation with the same scheme
        let existing = if proxy {
            self.proxy_auth.take()
        } else {
            self.www_auth.take()
        };
        if let Some(mut auth) = existing {
            if let Some(ch) = challenges.iter().find(|c| auth.matches_challenge(c)) {
                let mid_round_trip = auth.needs_another_round_trip();
                if auth
                    .set_challenge(ch, &req.url, req.method.as_str())
                    .is_ok()
                {
                    let retry_same = mid_round_trip || auth.retry_with_same_credentials();
                    let creds = if proxy {
                        self.proxy_creds.clone()
                    } else {
                        self.www_creds.clone()
                    };
                    if retry_same {
                        if let Some((user, pass)) = creds {
                            if auth.generate_response(&user, &pass).is_ok() {
                                self.put_auth(proxy, auth, ch.clone());
                                return Ok(true);
                            }
                        }
                    }
                }
                // same scheme challenged again with no retry path: the
                // credentials were wrong, and there is nobody to re-ask
                debug!("{} credentials rejected", if proxy { "proxy" } else { "site" });
                return Ok(false);
            }
            // scheme changed, the old conversation is void
        }

        // fresh scheme selection by priority, falling back past schemes that
        // cannot produce a response
        let mut offers: Vec<&str> = challenges.iter().map(String::as_str).collect();
        while let Some(idx) = best_offer(&offers) {
            let challenge = offers.remove(idx);
            let Ok(mut auth) = AuthScheme::from_challenge(challenge) else {
                continue;
            };
            if auth
                .set_challenge(challenge, &req.url, req.method.as_str())
                .is_err()
            {
                continue;
            }
            let Some((user, pass)) = self.credentials_for(req, proxy, auth.realm()) else {
                continue;
            };
            if let Err(e) = auth.generate_response(&user, &pass) {
                debug!("{} auth scheme failed: {e}", auth.scheme_name());
                continue;
            }
            if auth.force_disconnect() {
                self.connection = None;
            }
            if proxy {
                self.proxy_creds = Some((user, pass));
                self.proxy_auth_saved = false;
            } else {
                self.www_creds = Some((user, pass));
                self.www_auth_saved = false;
            }
            self.put_auth(proxy, auth, challenge.to_string());
            return Ok(true);
        }
        Ok(false)
    }

    fn put_auth(&mut self, proxy: bool, auth: AuthScheme, challenge: String) {
        if proxy {
            self.proxy_auth = Some(auth);
            self.proxy_challenge_raw = Some(challenge);
        } else {
            self.www_auth = Some(auth);
            self.www_challenge_raw = Some(challenge);
        }
    }

    /// NTLM needs its next round on this very connection; a restarted
    /// conversation needs a fresh one
    fn apply_auth_connection_flags(&self, rsp: &mut ResponseState) {
        for auth in [self.www_auth.as_ref(), self.proxy_auth.as_ref()]
            .into_iter()
            .flatten()
        {
            if auth.force_keep_alive() {
                rsp.keep_alive = true;
            }
            if auth.force_disconnect() {
                rsp.keep_alive = false;
            }
        }
    }

    fn credentials_for(
        &self,
        req: &HttpRequest,
        proxy: bool,
        realm: &str,
    ) -> Option<(String, String)> {
        let url = if proxy {
            self.config.proxy.as_ref()?
        } else {
            &req.url
        };
        if !url.username().is_empty() {
            return Some((
                url.username().to_string(),
                url.password().unwrap_or("").to_string(),
            ));
        }
        self.credentials.as_ref()?.lookup(url, realm)
    }

    /// A terminal response concludes any open auth conversation: write the
    /// working credentials to the external store, once per conversation.
    fn note_auth_success(&mut self, req: &HttpRequest, rsp: &ResponseState) {
        self.last_code = rsp.code;
        if rsp.code == 401 || rsp.code == 407 {
            return;
        }
        self.save_credentials(req, false);
        self.save_credentials(req, true);
    }

    fn save_credentials(&mut self, req: &HttpRequest, proxy: bool) {
        let (auth, saved, creds) = if proxy {
            (
                self.proxy_auth.as_ref(),
                &mut self.proxy_auth_saved,
                self.proxy_creds.as_ref(),
            )
        } else {
            (
                self.www_auth.as_ref(),
                &mut self.www_auth_saved,
                self.www_creds.as_ref(),
            )
        };
        let (Some(auth), Some((user, pass))) = (auth, creds) else {
            return;
        };
        if *saved || auth.header_fragment().is_empty() {
            return;
        }
        *saved = true;
        if let Some(provider) = &self.credentials {
            let url = if proxy {
                self.config.proxy.as_ref().unwrap_or(&req.url)
            } else {
                &req.url
            };
            provider.store(url, auth.realm(), user, pass);
        }
    }

    fn follow_redirect(
        &mut self,
        req: &mut HttpRequest,
        rsp: &ResponseState,
    ) -> Result<(), SessionError> {
        let location = rsp.location.as_deref().unwrap_or_default();
        let target = req
            .url
            .join(location)
            .map_err(|_| SessionError::MalformedUrl(location.to_string()))?;
        if !matches!(target.scheme(), "http" | "https" | "webdav" | "webdavs") {
            return Err(SessionError::AccessDenied(target.to_string()));
        }
        req.redirects_followed += 1;
        if req.redirects_followed > self.config.max_redirects {
            return Err(SessionError::TooManyRedirects(req.url.to_string()));
        }

        let mut target = target;
        // carry the fragment along when the server dropped it on a same-site
        // redirect; browsers do, and pages depend on it
        if target.fragment().is_none()
            && req.url.fragment().is_some()
            && target.host_str() == req.url.host_str()
            && target.scheme() == req.url.scheme()
        {
            target.set_fragment(req.url.fragment());
        }
        // POST becomes GET on 301-303, like every browser since forever
        if req.method == HttpMethod::Post && matches!(rsp.code, 301 | 302 | 303) {
            req.method = HttpMethod::Get;
            req.body = None;
            req.content_type = None;
        }
        debug!("redirect {} -> {}", req.url, target);
        req.url = target;
        req.must_revalidate = false;
        req.cache_tag = CacheTag::default();
        Ok(())
    }

    /// Consult the disk cache before touching the network. Returns a
    /// synthesized response when the entry may be served outright.
    fn satisfy_from_cache(
        &mut self,
        req: &mut HttpRequest,
        canonical: &str,
    ) -> Result<Option<ResponseState>, SessionError> {
        let Some(cache) = &self.cache else {
            return Ok(None);
        };
        if req.cache_policy == CachePolicy::Reload {
            return Ok(None);
        }
        let Some(reader) = cache.store.open_read(canonical) else {
            if req.cache_policy == CachePolicy::CacheOnly {
                return Err(SessionError::DoesNotExist(req.url.to_string()));
            }
            return Ok(None);
        };

        let header = reader.header();
        req.cache_tag.etag = reader.text().etag.clone();
        req.cache_tag.served_date = header.served_date;
        req.cache_tag.last_modified = header.last_modified;
        req.cache_tag.expire_date = header.expire_date;
        req.cache_tag.use_count = header.use_count;

        match req
            .cache_tag
            .plan(req.cache_policy, now_unix(), cache.max_age)
        {
            CachePlan::UseCached => {
                debug!("serving {} from cache", req.url);
                cache.notify(header, CLEANER_CMD_USED, canonical);
                let rsp = cached_response(&reader);
                req.from_cache = true;
                req.cache_tag.io = CacheIo::Read(reader);
                Ok(Some(rsp))
            }
            CachePlan::ValidateCached => {
                req.must_revalidate = true;
                req.cache_tag.io = CacheIo::Read(reader);
                Ok(None)
            }
            CachePlan::IgnoreCached => Ok(None),
        }
    }

    /// A 304 against our conditional headers: the entry stays, its expiry
    /// moves forward, and the payload is served from disk.
    fn serve_revalidated(
        &mut self,
        req: &mut HttpRequest,
        rsp: &ResponseState,
    ) -> Result<ResponseState, SessionError> {
        let canonical = canonical_url(&req.url);
        let now = now_unix();
        // only trust the 304 for new expiry when it actually names one
        let expire = if rsp.expires.is_some() || rsp.max_age.is_some() {
            rsp.expire_date(now)
        } else {
            now + REVALIDATE_GRACE
        };
        if let Some(cache) = &self.cache {
            match cache
                .store
                .update_expire(&canonical, expire, rsp.date.unwrap_or(UNKNOWN_DATE))
            {
                Ok(header) => cache.notify(&header, CLEANER_CMD_USED, &canonical),
                Err(e) => debug!("revalidated entry vanished: {e}"),
            }
        }
        req.must_revalidate = false;
        req.from_cache = true;
        req.cache_tag.expire_date = expire;
        match &req.cache_tag.io {
            CacheIo::Read(reader) => Ok(cached_response(reader)),
            _ => Err(SessionError::DoesNotExist(req.url.to_string())),
        }
    }

    /// open the write side for a cacheable 200 response
    fn maybe_open_cache_writer(&mut self, req: &mut HttpRequest, rsp: &ResponseState) {
        // whatever read handle is still around goes first; never both
        let had_reader = req.cache_tag.io.is_read();
        if had_reader {
            req.cache_tag.io = CacheIo::Closed;
        }
        let Some(cache) = &self.cache else {
            return;
        };
        if !req.method.cacheable()
            || rsp.code != 200
            || rsp.no_cache
            || req.offset > 0
            || req.cache_policy == CachePolicy::Reload
        {
            return;
        }
        let canonical = canonical_url(&req.url);
        let now = now_unix();
        let header = EntryHeader {
            use_count: 1,
            served_date: rsp.date.unwrap_or(now),
            last_modified: rsp.last_modified.unwrap_or(UNKNOWN_DATE),
            expire_date: rsp.expire_date(now),
            payload_size: 0,
        };
        let text = EntryText {
            url: canonical.clone(),
            etag: rsp.etag.clone().unwrap_or_default(),
            mime: rsp.mime.clone().unwrap_or_default(),
            headers: rsp.raw_headers.clone(),
        };
        req.cache_tag.io = CacheIo::Write(cache.store.begin_write(&canonical, header, text));
    }

    /// Drain and decode the response body into `sink`, feeding the cache
    /// writer along the way. Returns the number of decoded bytes delivered.
    pub(crate) async fn read_body<W>(
        &mut self,
        req: &mut HttpRequest,
        rsp: &mut ResponseState,
        sink: &mut W,
    ) -> Result<u64, SessionError>
    where
        W: AsyncWrite + Unpin,
    {
        if req.from_cache {
            return serve_cached_body(req, sink).await;
        }
        if rsp.expect_no_body(req.method) {
            self.settle_connection(rsp);
            return Ok(0);
        }

        let mut chain = DecoderChain::build(
            &rsp.transfer_encodings,
            &rsp.content_encodings,
            rsp.content_md5.is_some(),
        );
        let chunked = rsp.chunked;
        let mut remaining = rsp.content_length;
        let mut out: Vec<u8> = Vec::new();
        let mut total = 0u64;

        if !rsp.body_prefix.is_empty() {
            // bytes the header parser took off a non-http peer
            let prefix = std::mem::take(&mut rsp.body_prefix);
            chain.feed(&prefix, &mut out)?;
            total += flush_decoded(req, &mut out, sink).await?;
        }

        loop {
            if chunked && chain.transfer_finished() {
                break;
            }
            if !chunked && remaining == Some(0) {
                break;
            }
            let Some(conn) = self.connection.as_mut() else {
                return Err(SessionError::ConnectionBroken(req.url.to_string()));
            };
            let stream = conn.stream_mut();

            let consumed = {
                let available = timeout(self.config.response_timeout, stream.fill_buf())
                    .await
                    .map_err(|_| SessionError::ServerTimeout(req.url.to_string()))??;
                if available.is_empty() {
                    if chunked || remaining.is_some() {
                        return Err(SessionError::ConnectionBroken(req.url.to_string()));
                    }
                    // no framing at all: eof is the end-of-body marker
                    break;
                }
                let take = match remaining {
                    Some(r) => available.len().min(usize::try_from(r).unwrap_or(usize::MAX)),
                    None => available.len(),
                };
                chain.feed(&available[..take], &mut out)?
            };
            stream.consume(consumed);
            if let Some(r) = &mut remaining {
                *r -= consumed as u64;
            }
            total += flush_decoded(req, &mut out, sink).await?;
        }

        chain.finish(&mut out)?;
        total += flush_decoded(req, &mut out, sink).await?;

        if let (Some(expected), Some(computed)) = (&rsp.content_md5, chain.md5_base64()) {
            if expected.trim() != computed {
                // the data is already delivered; all we can do is say so
                warn!(
                    "Content-MD5 mismatch for {}: header {expected}, computed {computed}",
                    req.url
                );
            }
        }

        if let CacheIo::Write(writer) = req.cache_tag.io.take() {
            let canonical = canonical_url(&req.url);
            match writer.commit() {
                Ok(Some(header)) => {
                    req.cache_tag.bytes_written = u64::from(header.payload_size);
                    if let Some(cache) = &self.cache {
                        cache.notify(&header, CLEANER_CMD_CREATED, &canonical);
                    }
                }
                Ok(None) => {}
                Err(e) => debug!("cache entry for {} not kept: {e}", req.url),
            }
        }

        self.settle_connection(rsp);
        Ok(total)
    }

    /// throw away a body we do not want (error pages preceding a retry)
    pub(crate) async fn discard_body(
        &mut self,
        req: &mut HttpRequest,
        rsp: &mut ResponseState,
    ) -> Result<(), SessionError> {
        let mut sink = tokio::io::sink();
        self.read_body(req, rsp, &mut sink).await.map(|_| ())
    }

    fn settle_connection(&mut self, rsp: &ResponseState) {
        if rsp.keep_alive {
            if let Some(conn) = &mut self.connection {
                conn.touch();
            }
        } else {
            self.connection = None;
        }
    }
}

async fn serve_cached_body<W>(req: &mut HttpRequest, sink: &mut W) -> Result<u64, SessionError>
where
    W: AsyncWrite + Unpin,
{
    let CacheIo::Read(mut reader) = req.cache_tag.io.take() else {
        return Ok(0);
    };
    let mut buf = [0u8; 16 * 1024];
    let mut total = 0u64;
    loop {
        let n = io::Read::read(&mut reader, &mut buf)?;
        if n == 0 {
            return Ok(total);
        }
        sink.write_all(&buf[..n]).await?;
        total += n as u64;
    }
}

async fn flush_decoded<W>(
    req: &mut HttpRequest,
    out: &mut Vec<u8>,
    sink: &mut W,
) -> Result<u64, SessionError>
where
    W: AsyncWrite + Unpin,
{
    if out.is_empty() {
        return Ok(0);
    }
    sink.write_all(out).await?;
    let failed = match &mut req.cache_tag.io {
        CacheIo::Write(writer) => writer.write_payload(out).is_err(),
        _ => false,
    };
    if failed {
        // dropping the writer deletes the temp file; caching just stops
        req.cache_tag.io = CacheIo::Closed;
    }
    let n = out.len() as u64;
    out.clear();
    Ok(n)
}

/// the response a cache hit stands in for
fn cached_response(reader: &CacheReader) -> ResponseState {
    let header = reader.header();
    let text = reader.text();
    let mut rsp = ResponseState {
        code: 200,
        content_length: Some(u64::from(header.payload_size)),
        last_modified: (header.last_modified != UNKNOWN_DATE).then_some(header.last_modified),
        raw_headers: text.headers.clone(),
        ..Default::default()
    };
    if !text.mime.is_empty() {
        rsp.mime = Some(text.mime.clone());
    }
    if !text.etag.is_empty() {
        rsp.etag = Some(text.etag.clone());
    }
    rsp
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_host_forms() {
        assert_eq!(host_for_header("example.com", 80, false), "example.com");
        assert_eq!(
            host_for_header("example.com", 8080, false),
            "example.com:8080"
        );
        assert_eq!(host_for_header("example.com", 443, true), "example.com");
        assert_eq!(host_for_header("[fe80::1%eth0]", 80, false), "[fe80::1]");
        assert_eq!(host_for_header("[::1]", 8443, true), "[::1]:8443");
    }

    #[test]
    fn wire_targets() {
        let direct = wire_target(&Url::parse("webdavs://h/x").unwrap(), None).unwrap();
        assert!(direct.tls);
        assert_eq!(direct.port, 443);
        assert!(!direct.via_proxy);

        let proxy = Url::parse("http://proxy:3128").unwrap();
        let proxied = wire_target(&Url::parse("http://h/x").unwrap(), Some(&proxy)).unwrap();
        assert!(proxied.via_proxy);
        assert!(!proxied.tls);

        let tls_direct = wire_target(&Url::parse("https://h/x").unwrap(), Some(&proxy)).unwrap();
        assert!(!tls_direct.via_proxy);

        assert!(wire_target(&Url::parse("ftp://h/x").unwrap(), None).is_err());
    }
}
