/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

mod error;
pub use error::BodyDecodeError;

mod chunked;
pub use chunked::ChunkedDecoder;

mod filter;
pub use filter::{BodyFilter, DecoderChain, DeflateDecoder, GzipDecoder, Md5Digest};
