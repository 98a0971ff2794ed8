/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

use std::path::PathBuf;
use std::time::Duration;

use url::Url;

use w3_cache::CachePolicy;

const DEFAULT_ACCEPT: &str =
    "text/html, image/jpeg;q=0.9, image/png;q=0.9, text/*;q=0.9, image/*;q=0.9, */*;q=0.8";

/// fallback lifetime for responses carrying no expiry information at all
pub(crate) const DEFAULT_CACHE_EXPIRE: i64 = 3 * 60;
pub(crate) const DEFAULT_KEEP_ALIVE_TIMEOUT: u32 = 60;

#[derive(Clone, Debug)]
pub struct HttpCacheConfig {
    pub dir: PathBuf,
    /// seconds a cached entry may serve without revalidation; negative
    /// disables the limit
    pub max_age: i64,
    pub default_policy: CachePolicy,
    pub cleaner_socket: Option<PathBuf>,
    pub cleaner_argv: Option<Vec<String>>,
}

impl HttpCacheConfig {
    pub fn new(dir: PathBuf) -> Self {
        HttpCacheConfig {
            dir,
            max_age: 14 * 24 * 60 * 60,
            default_policy: CachePolicy::Verify,
            cleaner_socket: None,
            cleaner_argv: None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct HttpClientConfig {
    pub user_agent: Option<String>,
    pub accept: String,
    pub accept_charsets: Option<String>,
    pub accept_languages: Option<String>,
    /// proxy for plain http/webdav requests; TLS schemes connect direct
    pub proxy: Option<Url>,
    pub connect_timeout: Duration,
    pub response_timeout: Duration,
    pub max_header_size: usize,
    pub persistent_connections: bool,
    pub persistent_proxy_connection: bool,
    /// advertise and undo gzip/deflate compression
    pub allow_compressed: bool,
    /// deliver 4xx/5xx bodies as error pages instead of failing the call
    pub prefer_error_page: bool,
    /// keep sending Referer when an https page links to plain http
    pub send_referrer_on_downgrade: bool,
    pub max_redirects: usize,
    pub cache: Option<HttpCacheConfig>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        HttpClientConfig {
            user_agent: None,
            accept: DEFAULT_ACCEPT.to_string(),
            accept_charsets: None,
            accept_languages: None,
            proxy: None,
            connect_timeout: Duration::from_secs(20),
            response_timeout: Duration::from_secs(60),
            max_header_size: 64 * 1024,
            persistent_connections: true,
            persistent_proxy_connection: false,
            allow_compressed: true,
            prefer_error_page: false,
            send_referrer_on_downgrade: false,
            max_redirects: 10,
            cache: None,
        }
    }
}

impl HttpClientConfig {
    pub fn set_user_agent(&mut self, ua: &str) -> &mut Self {
        self.user_agent = Some(ua.to_string());
        self
    }

    pub fn set_proxy(&mut self, proxy: Url) -> &mut Self {
        self.proxy = Some(proxy);
        self
    }

    pub fn set_cache(&mut self, cache: HttpCacheConfig) -> &mut Self {
        self.cache = Some(cache);
        self
    }

    pub fn set_response_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.response_timeout = timeout;
        self
    }
}

#[cfg(feature = "yaml")]
mod yaml;
