/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

use std::io;

use thiserror::Error;

use w3_http::body::BodyDecodeError;

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("failed to resolve host {0}")]
    UnresolvableHost(String),
    #[error("could not connect to {0}")]
    ConnectFailed(String),
    #[error("timed out connecting to {0}")]
    ConnectTimedOut(String),
    #[error("tls handshake with {0} failed")]
    TlsHandshakeFailed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DavErrorKind {
    AccessDenied,
    AlreadyExists,
    OrderedCreationRequired,
    PreconditionFailed,
    UnsupportedMedia,
    Locked,
    DiskFull,
    Generic,
}

#[derive(Debug, Error)]
#[error("{message}")]
pub struct DavError {
    pub kind: DavErrorKind,
    pub message: String,
}

/// terminal error of one caller-facing operation
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("unsupported protocol {0}")]
    UnsupportedProtocol(String),
    #[error("malformed url {0}")]
    MalformedUrl(String),
    #[error("failed to resolve host {0}")]
    CouldNotResolveHost(String),
    #[error("could not connect to {0}")]
    CouldNotConnect(String),
    #[error("connection to {0} broken mid-transfer")]
    ConnectionBroken(String),
    #[error("no reply from {0} in time")]
    ServerTimeout(String),
    #[error("access denied to {0}")]
    AccessDenied(String),
    #[error("authentication for {0} failed")]
    AuthenticationFailed(String),
    #[error("{0} does not exist")]
    DoesNotExist(String),
    #[error("internal server error serving {0}")]
    InternalServer(String),
    #[error("server demands a protocol upgrade we cannot do: {0}")]
    UpgradeRequired(String),
    #[error("too many redirects fetching {0}")]
    TooManyRedirects(String),
    #[error(transparent)]
    Dav(#[from] DavError),
    /// aggregated per-resource failures out of a 207 reply; deliberately its
    /// own kind, not access-denied
    #[error("multiple resource operations failed:\n{0}")]
    MultiStatus(String),
    #[error("invalid response body: {0}")]
    InvalidBody(#[from] BodyDecodeError),
    #[error("io failed: {0}")]
    Io(#[from] io::Error),
}

impl From<ConnectError> for SessionError {
    fn from(e: ConnectError) -> Self {
        match e {
            ConnectError::UnresolvableHost(h) => SessionError::CouldNotResolveHost(h),
            ConnectError::ConnectFailed(h) => SessionError::CouldNotConnect(h),
            ConnectError::ConnectTimedOut(h) => SessionError::CouldNotConnect(h),
            ConnectError::TlsHandshakeFailed(h) => SessionError::CouldNotConnect(h),
        }
    }
}
