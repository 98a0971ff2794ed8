/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheEntryError {
    #[error("io failed: {0}")]
    Io(#[from] io::Error),
    #[error("bad magic or version in entry header")]
    BadHeader,
    #[error("stored url does not match the request url")]
    UrlMismatch,
    #[error("truncated text header")]
    TruncatedHeader,
}
