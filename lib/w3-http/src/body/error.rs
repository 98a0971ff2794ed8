/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BodyDecodeError {
    #[error("invalid chunk size line")]
    InvalidChunkSize,
    #[error("chunk size line too long (> {0})")]
    ChunkLineTooLong(usize),
    #[error("invalid chunk data end")]
    InvalidChunkEnd,
    #[error("truncated chunked body")]
    TruncatedChunkedBody,
    #[error("decompress failed: {0}")]
    DecompressFailed(io::Error),
}
