//! Append-ordered per-tenant event log.
//!
//! Appends allocate a watermark first and write second. A write that fails
//! after allocation burns the watermark and leaves a gap in the sequence —
//! accepted, because a gap never reorders anything, while reusing a number
//! would. Queries walk the tenant's watermark index ascending and return
//! event identifiers only.

use std::collections::BTreeMap;
use std::sync::Arc;

use metrics::counter;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::backend::{
    AttrValue, Backend, BatchDeleteOutcome, IndexSpec, Item, ItemKey, ScanRequest,
    ATTR_PARTITION, ATTR_SORT, MAX_DELETE_BATCH,
};
use crate::config::{ReadErrorPolicy, StoreConfig};
use crate::cursor::{self, Cursor};
use crate::error::{Result, StoreError};
use crate::filter::{self, FilterGroup};
use crate::watermark::WatermarkAllocator;

pub(crate) const ATTR_EVENT_ID: &str = "eventId";
pub(crate) const ATTR_WATERMARK: &str = "watermark";

const WATERMARK_INDEX: IndexSpec = IndexSpec {
    name: "watermark-index",
    sort_attr: ATTR_WATERMARK,
};

/// Attribute names the store owns; caller attributes may not shadow them.
const INTERNAL_ATTRIBUTES: &[&str] = &[ATTR_PARTITION, ATTR_SORT, ATTR_EVENT_ID, ATTR_WATERMARK];

#[derive(Debug, Clone, Default)]
pub struct EventPage {
    pub event_ids: Vec<String>,
    pub cursor: Option<String>,
}

pub struct EventLogStore {
    backend: Arc<dyn Backend>,
    config: StoreConfig,
    watermarks: WatermarkAllocator,
}

impl EventLogStore {
    pub fn new(backend: Arc<dyn Backend>, config: StoreConfig) -> Self {
        let watermarks = WatermarkAllocator::new(Arc::clone(&backend));
        Self {
            backend,
            config,
            watermarks,
        }
    }

    /// Appends one event and returns its watermark. Watermark allocation and
    /// the record write both propagate failures: silently dropping either
    /// would corrupt the ordering invariant.
    pub async fn append(
        &self,
        tenant: &str,
        event_id: &str,
        attributes: BTreeMap<String, AttrValue>,
    ) -> Result<i64> {
        ensure_identifier("tenant", tenant)?;
        ensure_identifier("event_id", event_id)?;

        let watermark = self.watermarks.next(tenant).await?;

        let mut item = Item::new();
        item.insert(ATTR_PARTITION.into(), AttrValue::S(tenant.to_string()));
        item.insert(ATTR_SORT.into(), AttrValue::S(event_id.to_string()));
        item.insert(ATTR_EVENT_ID.into(), AttrValue::S(event_id.to_string()));
        item.insert(ATTR_WATERMARK.into(), AttrValue::N(watermark as f64));
        for (name, value) in attributes {
            if INTERNAL_ATTRIBUTES.contains(&name.as_str()) {
                return Err(StoreError::InvalidAttribute(format!(
                    "'{name}' is reserved for the event log itself"
                )));
            }
            item.insert(filter::remap_reserved(&name).to_string(), value);
        }

        self.backend.put_item(item).await?;
        counter!(
            "tidemark_store_operations_total",
            1,
            "store" => "event_log",
            "op" => "append"
        );
        Ok(watermark)
    }

    /// Filtered query over the tenant's events in watermark order. Returns
    /// event ids and, when more data exists, an opaque resume cursor.
    pub async fn query(
        &self,
        tenant: &str,
        filters: &[FilterGroup],
        cursor: Option<&str>,
        take: Option<usize>,
    ) -> Result<EventPage> {
        ensure_identifier("tenant", tenant)?;
        let limit = self.config.effective_take(take);
        let filter = filter::translate(filters)?;
        let cursor = cursor.map(Cursor::decode).transpose()?;

        let outcome = cursor::paginate(
            self.backend.as_ref(),
            tenant,
            WATERMARK_INDEX,
            None,
            filter,
            true,
            limit,
            limit + 1,
            cursor,
        )
        .await;

        let (items, next) = match outcome {
            Ok(page) => page,
            Err(err)
                if err.is_backend_failure()
                    && self.config.read_error_policy == ReadErrorPolicy::DegradeToEmpty =>
            {
                warn!(tenant, error = %err, "event query degraded to empty result");
                return Ok(EventPage::default());
            }
            Err(err) => return Err(err),
        };

        let event_ids = items
            .iter()
            .filter_map(|item| item.get(ATTR_EVENT_ID)?.as_str().map(str::to_string))
            .collect();
        let cursor = next.map(|cursor| cursor.encode()).transpose()?;
        Ok(EventPage { event_ids, cursor })
    }

    /// `query` with no filter: every event for the tenant, in append order.
    pub async fn get_all(&self, tenant: &str, cursor: Option<&str>) -> Result<EventPage> {
        self.query(tenant, &[], cursor, None).await
    }

    /// Deletes the named events in backend-sized batches, sequentially. A
    /// failed batch is reported in the outcome and the loop continues;
    /// earlier batches are not rolled back.
    pub async fn delete_by_ids(
        &self,
        tenant: &str,
        event_ids: &[String],
        cancel: &CancellationToken,
    ) -> Result<BatchDeleteOutcome> {
        ensure_identifier("tenant", tenant)?;
        let mut outcome = BatchDeleteOutcome::default();

        for chunk in event_ids.chunks(MAX_DELETE_BATCH) {
            if cancel.is_cancelled() {
                return Err(StoreError::Canceled);
            }
            let keys: Vec<ItemKey> = chunk
                .iter()
                .map(|id| ItemKey::new(tenant, id.clone()))
                .collect();
            match self.backend.batch_delete(keys.clone()).await {
                Ok(batch) => {
                    outcome.deleted += batch.deleted;
                    outcome.failed.extend(batch.failed);
                }
                Err(err) => {
                    warn!(tenant, error = %err, "event delete batch failed");
                    outcome.failed.extend(keys);
                }
            }
        }
        counter!(
            "tidemark_store_operations_total",
            1,
            "store" => "event_log",
            "op" => "delete_by_ids"
        );
        Ok(outcome)
    }

    /// Scan-and-delete of every record in the table, across tenants. Pages
    /// through the backend's continuation tokens until exhausted. Maintenance
    /// and test teardown only; concurrent writers get no consistency
    /// guarantee. Returns the number of records removed.
    pub async fn clear(&self, cancel: &CancellationToken) -> Result<usize> {
        clear_all(self.backend.as_ref(), self.config.scan_page_size, cancel).await
    }
}

fn ensure_identifier(label: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(StoreError::InvalidAttribute(format!(
            "{label} cannot be empty"
        )));
    }
    Ok(())
}

/// Shared scan-and-delete loop: the table-agnostic `clear` every store
/// exposes. Each scan page is deleted in bounded batches; individual batch
/// failures are logged and skipped so one bad key cannot wedge teardown.
pub(crate) async fn clear_all(
    backend: &dyn Backend,
    scan_page_size: usize,
    cancel: &CancellationToken,
) -> Result<usize> {
    let mut removed = 0usize;
    let mut start_after = None;

    loop {
        if cancel.is_cancelled() {
            return Err(StoreError::Canceled);
        }
        let page = backend
            .scan(ScanRequest {
                limit: scan_page_size,
                start_after: start_after.take(),
            })
            .await?;
        let keys: Vec<ItemKey> = page.items.iter().filter_map(ItemKey::of).collect();

        for chunk in keys.chunks(MAX_DELETE_BATCH) {
            if cancel.is_cancelled() {
                return Err(StoreError::Canceled);
            }
            match backend.batch_delete(chunk.to_vec()).await {
                Ok(outcome) => removed += outcome.deleted,
                Err(err) => warn!(error = %err, "clear batch failed, continuing"),
            }
        }

        match page.last_key {
            Some(key) => start_after = Some(key),
            None => break,
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryBackend;

    fn store() -> (Arc<MemoryBackend>, EventLogStore) {
        let backend = Arc::new(MemoryBackend::new());
        let store = EventLogStore::new(backend.clone(), StoreConfig::default());
        (backend, store)
    }

    #[tokio::test]
    async fn appends_are_ordered_per_tenant() {
        let (_, store) = store();
        store.append("a", "e1", BTreeMap::new()).await.unwrap();
        store.append("a", "e2", BTreeMap::new()).await.unwrap();
        store.append("b", "e3", BTreeMap::new()).await.unwrap();

        let page = store.get_all("a", None).await.unwrap();
        assert_eq!(page.event_ids, vec!["e1", "e2"]);
        assert!(page.cursor.is_none());

        let page = store.get_all("b", None).await.unwrap();
        assert_eq!(page.event_ids, vec!["e3"]);
    }

    #[tokio::test]
    async fn caller_attributes_cannot_shadow_internals() {
        let (_, store) = store();
        let mut attributes = BTreeMap::new();
        attributes.insert("watermark".to_string(), AttrValue::N(99.0));
        assert!(matches!(
            store.append("a", "e1", attributes).await,
            Err(StoreError::InvalidAttribute(_))
        ));
    }

    #[tokio::test]
    async fn append_failure_after_allocation_leaves_a_gap() {
        let (backend, store) = store();
        store.append("a", "e1", BTreeMap::new()).await.unwrap();
        backend.inject_failure("put_item");
        assert!(store.append("a", "e2", BTreeMap::new()).await.is_err());
        let watermark = store.append("a", "e3", BTreeMap::new()).await.unwrap();
        // Watermark 2 was consumed by the failed append.
        assert_eq!(watermark, 3);
        let page = store.get_all("a", None).await.unwrap();
        assert_eq!(page.event_ids, vec!["e1", "e3"]);
    }

    #[tokio::test]
    async fn degrade_policy_converts_read_failures() {
        let backend = Arc::new(MemoryBackend::new());
        let config = StoreConfig {
            read_error_policy: ReadErrorPolicy::DegradeToEmpty,
            ..StoreConfig::default()
        };
        let store = EventLogStore::new(backend.clone(), config);
        store.append("a", "e1", BTreeMap::new()).await.unwrap();
        backend.inject_failure("query");
        let page = store.get_all("a", None).await.unwrap();
        assert!(page.event_ids.is_empty());
    }

    #[tokio::test]
    async fn propagate_policy_surfaces_read_failures() {
        let (backend, store) = store();
        backend.inject_failure("query");
        assert!(store.get_all("a", None).await.is_err());
    }
}
