/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

mod error;
pub use error::CacheEntryError;

mod tag;
pub use tag::{CacheIo, CachePlan, CachePolicy, CacheTag, UNKNOWN_DATE};

mod entry;
pub use entry::{BINARY_HEADER_LEN, EntryHeader, EntryText};

mod store;
pub use store::{CacheReader, CacheStore, CacheWriter, canonical_url, entry_filename};

mod cleaner;
pub use cleaner::{CLEANER_CMD_CREATED, CLEANER_CMD_USED, CleanerNotifier};
