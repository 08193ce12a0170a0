use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};

pub const DEFAULT_PAGE_SIZE: usize = 50;
pub const DEFAULT_PAGE_LIMIT: usize = 200;
pub const DEFAULT_SCAN_PAGE_SIZE: usize = 100;
pub const DEFAULT_LEASE_SECONDS: i64 = 60;

/// What a query path does when the backend fails mid-read.
///
/// `Propagate` surfaces the failure to the caller. `DegradeToEmpty` logs it
/// and returns an empty result set, trading correctness signaling for
/// availability; writes are never degraded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadErrorPolicy {
    #[default]
    Propagate,
    DegradeToEmpty,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Default page size when a query does not name one.
    pub page_size: usize,
    /// Hard cap on a single query page.
    pub page_limit: usize,
    /// Items fetched per round-trip by scan-and-delete maintenance loops.
    pub scan_page_size: usize,
    /// Visibility window granted to a grabbed task.
    pub lease_seconds: i64,
    pub read_error_policy: ReadErrorPolicy,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            page_limit: DEFAULT_PAGE_LIMIT,
            scan_page_size: DEFAULT_SCAN_PAGE_SIZE,
            lease_seconds: DEFAULT_LEASE_SECONDS,
            read_error_policy: ReadErrorPolicy::default(),
        }
    }
}

impl StoreConfig {
    pub fn validate(&self) -> Result<()> {
        if self.page_size == 0 || self.page_limit == 0 {
            return Err(StoreError::Config(
                "page_size and page_limit must be non-zero".into(),
            ));
        }
        if self.scan_page_size == 0 {
            return Err(StoreError::Config("scan_page_size must be non-zero".into()));
        }
        if self.lease_seconds <= 0 {
            return Err(StoreError::Config("lease_seconds must be positive".into()));
        }
        Ok(())
    }

    /// Clamps a caller-supplied page size the way every query path does:
    /// missing means the default, oversized means the cap.
    pub(crate) fn effective_take(&self, take: Option<usize>) -> usize {
        take.unwrap_or(self.page_size).min(self.page_limit)
    }
}
