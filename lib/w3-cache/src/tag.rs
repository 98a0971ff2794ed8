/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

use crate::store::{CacheReader, CacheWriter};

pub const UNKNOWN_DATE: i64 = -1;

/// caller-requested cache behavior for one operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CachePolicy {
    /// bypass the cache entirely and refetch
    Reload,
    /// always revalidate with the origin before using a cached entry
    Refresh,
    /// only the cache may answer, never the network
    CacheOnly,
    /// use a cached entry without freshness checks
    Cache,
    /// use a cached entry while fresh, revalidate once it is not
    #[default]
    Verify,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachePlan {
    UseCached,
    ValidateCached,
    IgnoreCached,
}

/// The read-XOR-write handle state for one cache entry. The variants own
/// the file handle, so holding both directions at once cannot be expressed.
#[derive(Default)]
pub enum CacheIo {
    #[default]
    Closed,
    Read(CacheReader),
    Write(CacheWriter),
}

impl CacheIo {
    pub fn is_read(&self) -> bool {
        matches!(self, CacheIo::Read(_))
    }

    pub fn is_write(&self) -> bool {
        matches!(self, CacheIo::Write(_))
    }

    pub fn take(&mut self) -> CacheIo {
        std::mem::take(self)
    }
}

/// Per-request cache validation metadata plus the owned entry handle.
pub struct CacheTag {
    pub etag: String,
    pub last_modified: i64,
    pub served_date: i64,
    pub expire_date: i64,
    pub use_count: u32,
    pub bytes_written: u64,
    pub io: CacheIo,
}

impl Default for CacheTag {
    fn default() -> Self {
        CacheTag {
            etag: String::new(),
            last_modified: UNKNOWN_DATE,
            served_date: UNKNOWN_DATE,
            expire_date: UNKNOWN_DATE,
            use_count: 0,
            bytes_written: 0,
            io: CacheIo::Closed,
        }
    }
}

impl CacheTag {
    /// Decide what to do with the cached entry this tag describes.
    /// `max_age` is the configured maximum age in seconds; negative means
    /// no limit.
    pub fn plan(&self, policy: CachePolicy, now: i64, max_age: i64) -> CachePlan {
        match policy {
            CachePolicy::CacheOnly | CachePolicy::Cache => CachePlan::UseCached,
            CachePolicy::Refresh => CachePlan::ValidateCached,
            CachePolicy::Reload => CachePlan::IgnoreCached,
            CachePolicy::Verify => {
                if self.served_date != UNKNOWN_DATE
                    && max_age >= 0
                    && now > self.served_date + max_age
                {
                    CachePlan::ValidateCached
                } else if self.expire_date != UNKNOWN_DATE && now > self.expire_date {
                    CachePlan::ValidateCached
                } else {
                    CachePlan::UseCached
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tag(served: i64, expire: i64) -> CacheTag {
        CacheTag {
            served_date: served,
            expire_date: expire,
            ..Default::default()
        }
    }

    #[test]
    fn default_policy_freshness() {
        let t = tag(1000, 1000 + 300);
        // fresh until the expire date passes
        assert_eq!(t.plan(CachePolicy::Verify, 1100, -1), CachePlan::UseCached);
        assert_eq!(t.plan(CachePolicy::Verify, 1300, -1), CachePlan::UseCached);
        assert_eq!(
            t.plan(CachePolicy::Verify, 1301, -1),
            CachePlan::ValidateCached
        );
    }

    #[test]
    fn max_age_overrides() {
        let t = tag(1000, 1000 + 9999);
        assert_eq!(t.plan(CachePolicy::Verify, 1050, 100), CachePlan::UseCached);
        assert_eq!(
            t.plan(CachePolicy::Verify, 1101, 100),
            CachePlan::ValidateCached
        );
    }

    #[test]
    fn explicit_policies_ignore_dates() {
        let expired = tag(0, 1);
        assert_eq!(
            expired.plan(CachePolicy::Cache, i64::MAX, 0),
            CachePlan::UseCached
        );
        assert_eq!(
            expired.plan(CachePolicy::CacheOnly, i64::MAX, 0),
            CachePlan::UseCached
        );
        let fresh = tag(1000, i64::MAX - 1);
        assert_eq!(
            fresh.plan(CachePolicy::Reload, 1000, -1),
            CachePlan::IgnoreCached
        );
        assert_eq!(
            fresh.plan(CachePolicy::Refresh, 1000, -1),
            CachePlan::ValidateCached
        );
    }
}
