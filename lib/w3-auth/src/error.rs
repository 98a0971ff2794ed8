/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("unsupported authentication scheme")]
    UnsupportedScheme,
    #[error("malformed challenge: {0}")]
    MalformedChallenge(&'static str),
    #[error("no usable credentials")]
    MissingCredentials,
    #[error("request url outside the protection domain")]
    OutOfProtectionDomain,
    #[error("qop auth-int requires an entity body digest")]
    EntityDigestUnavailable,
}
