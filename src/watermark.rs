//! Per-tenant append ordering.
//!
//! Every append asks the backend for an atomic increment on the tenant's
//! counter item; the returned integer is the event's watermark. Atomicity
//! lives entirely in the backend, so any number of processes can append
//! concurrently without coordinating here. Gaps (an allocated watermark whose
//! write later failed) are tolerable; duplicates never are, which is why an
//! increment failure propagates instead of falling back to local numbering.

use std::sync::Arc;

use crate::backend::Backend;
use crate::error::Result;

/// Sort key of the counter item. The leading unit separator keeps it out of
/// the id space of real records, which never start with a control character.
pub(crate) const WATERMARK_SORT_KEY: &str = "\u{1F}watermark";

/// Attribute the counter lives in. Deliberately not the event records'
/// `watermark` attribute: the counter item shares the tenant partition, and
/// carrying the index attribute would surface it in watermark queries.
pub(crate) const WATERMARK_COUNTER_ATTR: &str = "counterValue";

#[derive(Clone)]
pub struct WatermarkAllocator {
    backend: Arc<dyn Backend>,
}

impl WatermarkAllocator {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self { backend }
    }

    /// Allocates the next watermark for `tenant`. The first allocation
    /// returns 1; zero is the implicit never-appended baseline.
    pub async fn next(&self, tenant: &str) -> Result<i64> {
        self.backend
            .increment(tenant, WATERMARK_SORT_KEY, WATERMARK_COUNTER_ATTR)
            .await
    }
}
