/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

use std::io::{self, IoSlice};
use std::pin::Pin;
use std::sync::{Arc, LazyLock};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use log::debug;
use rustls::{ClientConfig, RootCertStore};
use rustls_pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite, BufStream, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;

use crate::config::DEFAULT_KEEP_ALIVE_TIMEOUT;
use crate::error::ConnectError;

static TLS_CLIENT_CONFIG: LazyLock<Arc<ClientConfig>> = LazyLock::new(|| {
    let roots = RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
    };
    Arc::new(
        ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth(),
    )
});

pub(crate) enum MaybeTlsStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for MaybeTlsStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            MaybeTlsStream::Tls(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for MaybeTlsStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            MaybeTlsStream::Tls(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_flush(cx),
            MaybeTlsStream::Tls(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            MaybeTlsStream::Tls(s) => Pin::new(s).poll_shutdown(cx),
        }
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_write_vectored(cx, bufs),
            MaybeTlsStream::Tls(s) => Pin::new(s).poll_write_vectored(cx, bufs),
        }
    }

    fn is_write_vectored(&self) -> bool {
        match self {
            MaybeTlsStream::Plain(s) => s.is_write_vectored(),
            MaybeTlsStream::Tls(s) => s.is_write_vectored(),
        }
    }
}

/// strip brackets and any zone id so the host is usable for resolution
fn bare_host(host: &str) -> &str {
    let host = host.trim_start_matches('[').trim_end_matches(']');
    match host.split_once('%') {
        Some((h, _zone)) => h,
        None => host,
    }
}

async fn tls_handshake(
    tcp: TcpStream,
    server_host: &str,
) -> Result<Box<TlsStream<TcpStream>>, ConnectError> {
    let name = ServerName::try_from(bare_host(server_host).to_string())
        .map_err(|_| ConnectError::TlsHandshakeFailed(server_host.to_string()))?;
    let connector = TlsConnector::from(TLS_CLIENT_CONFIG.clone());
    let stream = connector
        .connect(name, tcp)
        .await
        .map_err(|_| ConnectError::TlsHandshakeFailed(server_host.to_string()))?;
    Ok(Box::new(stream))
}

/// One TCP (optionally TLS) connection, exclusively owned by the session.
pub(crate) struct HttpConnection {
    stream: BufStream<MaybeTlsStream>,
    host: String,
    port: u16,
    tls: bool,
    via_proxy: bool,
    keep_alive_timeout: u32,
    last_used: Instant,
}

impl HttpConnection {
    pub(crate) async fn connect(
        host: &str,
        port: u16,
        tls_server: Option<&str>,
        via_proxy: bool,
        timeout: Duration,
    ) -> Result<HttpConnection, ConnectError> {
        let lookup = (bare_host(host).to_string(), port);
        let addrs: Vec<_> = tokio::net::lookup_host(lookup)
            .await
            .map_err(|_| ConnectError::UnresolvableHost(host.to_string()))?
            .collect();
        if addrs.is_empty() {
            return Err(ConnectError::UnresolvableHost(host.to_string()));
        }

        let tcp = tokio::time::timeout(timeout, async {
            let mut last_err = None;
            for addr in addrs {
                match TcpStream::connect(addr).await {
                    Ok(s) => return Ok(s),
                    Err(e) => last_err = Some(e),
                }
            }
            Err(last_err.unwrap_or_else(|| io::Error::other("no address to try")))
        })
        .await
        .map_err(|_| ConnectError::ConnectTimedOut(host.to_string()))?
        .map_err(|e| {
            debug!("connect to {host}:{port} failed: {e}");
            ConnectError::ConnectFailed(host.to_string())
        })?;

        let stream = match tls_server {
            Some(server) => MaybeTlsStream::Tls(tls_handshake(tcp, server).await?),
            None => MaybeTlsStream::Plain(tcp),
        };

        Ok(HttpConnection {
            stream: BufStream::new(stream),
            host: host.to_string(),
            port,
            tls: tls_server.is_some(),
            via_proxy,
            keep_alive_timeout: DEFAULT_KEEP_ALIVE_TIMEOUT,
            last_used: Instant::now(),
        })
    }

    /// the in-place handshake a `426 Upgrade Required` with `TLS/1.0` asks
    /// for; buffered plaintext is discarded, the upgrade always directly
    /// follows a fully read response header
    pub(crate) async fn upgrade_tls(self, server_host: &str) -> Result<HttpConnection, ConnectError> {
        match self.stream.into_inner() {
            MaybeTlsStream::Plain(tcp) => {
                let tls = tls_handshake(tcp, server_host).await?;
                Ok(HttpConnection {
                    stream: BufStream::new(MaybeTlsStream::Tls(tls)),
                    host: self.host,
                    port: self.port,
                    tls: true,
                    via_proxy: self.via_proxy,
                    keep_alive_timeout: self.keep_alive_timeout,
                    last_used: Instant::now(),
                })
            }
            stream @ MaybeTlsStream::Tls(_) => Ok(HttpConnection {
                stream: BufStream::new(stream),
                host: self.host,
                port: self.port,
                tls: self.tls,
                via_proxy: self.via_proxy,
                keep_alive_timeout: self.keep_alive_timeout,
                last_used: Instant::now(),
            }),
        }
    }

    pub(crate) fn stream_mut(&mut self) -> &mut BufStream<MaybeTlsStream> {
        &mut self.stream
    }

    pub(crate) fn is_tls(&self) -> bool {
        self.tls
    }

    pub(crate) fn matches(&self, host: &str, port: u16, tls: bool, via_proxy: bool) -> bool {
        self.tls == tls && self.via_proxy == via_proxy && self.port == port && self.host == host
    }

    /// the keep-alive reconnect race: an idle connection the server may
    /// have torn down already is not worth reusing
    pub(crate) fn idle_expired(&self) -> bool {
        self.last_used.elapsed() >= Duration::from_secs(u64::from(self.keep_alive_timeout))
    }

    pub(crate) fn touch(&mut self) {
        self.last_used = Instant::now();
    }

    pub(crate) fn set_keep_alive_timeout(&mut self, secs: u32) {
        // clamp the server supplied value the same way the idle timer does
        let secs = if secs == 0 {
            DEFAULT_KEEP_ALIVE_TIMEOUT
        } else {
            secs.min(2 * DEFAULT_KEEP_ALIVE_TIMEOUT)
        };
        self.keep_alive_timeout = secs;
    }
}
