//! Lease-based resumable task queue.
//!
//! A registered task is content-hashed to a stable id and stored with its
//! lease already expired, so it is grabbable immediately. `grab` walks the
//! lease-expiry index earliest-expired-first and re-leases each candidate
//! with a single guarded write: the write only lands if the expiry is still
//! the one the query observed, so two consumers racing for the same task
//! cannot both win and no delete/reinsert window can lose it.

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use metrics::counter;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::backend::{
    AttrValue, Backend, IndexSpec, Item, QueryRequest, SortRange, ATTR_PARTITION, ATTR_SORT,
};
use crate::config::StoreConfig;
use crate::content::{ContentAddresser, Sha256Addresser};
use crate::error::{Result, StoreError};
use crate::event_log::clear_all;

/// All tasks share one partition; the queue is not tenant-scoped.
const TASK_PARTITION: &str = "task";

const ATTR_TASK_ID: &str = "taskId";
const ATTR_PAYLOAD: &str = "payload";
const ATTR_LEASE_EXPIRES: &str = "leaseExpires";
const ATTR_RETRY_COUNT: &str = "retryCount";

const LEASE_INDEX: IndexSpec = IndexSpec {
    name: "lease-index",
    sort_attr: ATTR_LEASE_EXPIRES,
};

#[derive(Debug, Clone, PartialEq)]
pub struct TaskRecord {
    pub task_id: String,
    pub payload: Value,
    pub lease_expires: DateTime<Utc>,
    /// Preserved unchanged on redelivery; see DESIGN.md for the open
    /// product question on incrementing it per grab.
    pub retry_count: u32,
}

pub struct LeaseQueue {
    backend: Arc<dyn Backend>,
    config: StoreConfig,
    addresser: Arc<dyn ContentAddresser>,
}

impl LeaseQueue {
    pub fn new(backend: Arc<dyn Backend>, config: StoreConfig) -> Self {
        Self::with_addresser(backend, config, Arc::new(Sha256Addresser))
    }

    pub fn with_addresser(
        backend: Arc<dyn Backend>,
        config: StoreConfig,
        addresser: Arc<dyn ContentAddresser>,
    ) -> Self {
        Self {
            backend,
            config,
            addresser,
        }
    }

    /// Registers a task under the content hash of its payload. Registration
    /// is idempotent: the same payload maps to the same id, and a re-register
    /// resets its lease and retry count.
    pub async fn register(&self, payload: &Value) -> Result<TaskRecord> {
        let task_id = self.addresser.content_id(payload)?;
        let now = Utc::now();
        let record = TaskRecord {
            task_id,
            payload: payload.clone(),
            lease_expires: now,
            retry_count: 0,
        };
        self.backend.put_item(task_item(&record)?).await?;
        counter!(
            "tidemark_store_operations_total",
            1,
            "store" => "lease_queue",
            "op" => "register"
        );
        Ok(record)
    }

    /// Grabs up to `count` tasks whose lease has expired, earliest expiry
    /// first, granting each a fresh visibility window. A task whose lease
    /// changed between the index read and the guarded write was taken by
    /// another consumer and is skipped.
    pub async fn grab(&self, count: usize) -> Result<Vec<TaskRecord>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let now = Utc::now();
        let now_millis = now.timestamp_millis();
        let page = self
            .backend
            .query(QueryRequest {
                partition: TASK_PARTITION.to_string(),
                index: Some(LEASE_INDEX),
                range: Some(SortRange::lte(now_millis)),
                filter: None,
                limit: count,
                start_after: None,
                ascending: true,
            })
            .await?;

        let mut grabbed = Vec::new();
        for item in page.items {
            let Some(observed) = item.get(ATTR_LEASE_EXPIRES).cloned() else {
                continue;
            };
            let mut record = task_record(&item)?;
            record.lease_expires = now + chrono::Duration::seconds(self.config.lease_seconds);

            let leased = self
                .backend
                .put_item_if(task_item(&record)?, ATTR_LEASE_EXPIRES, Some(&observed))
                .await?;
            if leased {
                grabbed.push(record);
            }
        }
        counter!(
            "tidemark_store_operations_total",
            1,
            "store" => "lease_queue",
            "op" => "grab"
        );
        Ok(grabbed)
    }

    /// Pushes the task's lease out to now + `seconds`. Silently a no-op when
    /// the task no longer exists, so extending an already-completed task
    /// needs no caller-side existence check.
    pub async fn extend(&self, task_id: &str, seconds: i64) -> Result<()> {
        let Some(item) = self.backend.get_item(TASK_PARTITION, task_id).await? else {
            return Ok(());
        };
        let mut record = task_record(&item)?;
        record.lease_expires = Utc::now() + chrono::Duration::seconds(seconds);
        self.backend.put_item(task_item(&record)?).await
    }

    /// Removes a task; consumers call this after successful completion.
    pub async fn delete(&self, task_id: &str) -> Result<()> {
        self.backend.delete_item(TASK_PARTITION, task_id).await
    }

    /// Scan-and-delete of the whole queue; test/maintenance only.
    pub async fn clear(&self, cancel: &CancellationToken) -> Result<usize> {
        clear_all(self.backend.as_ref(), self.config.scan_page_size, cancel).await
    }
}

fn task_item(record: &TaskRecord) -> Result<Item> {
    let mut item = Item::new();
    item.insert(ATTR_PARTITION.into(), AttrValue::S(TASK_PARTITION.into()));
    item.insert(ATTR_SORT.into(), AttrValue::S(record.task_id.clone()));
    item.insert(ATTR_TASK_ID.into(), AttrValue::S(record.task_id.clone()));
    item.insert(
        ATTR_PAYLOAD.into(),
        AttrValue::S(serde_json::to_string(&record.payload)?),
    );
    item.insert(
        ATTR_LEASE_EXPIRES.into(),
        AttrValue::N(record.lease_expires.timestamp_millis() as f64),
    );
    item.insert(
        ATTR_RETRY_COUNT.into(),
        AttrValue::N(record.retry_count as f64),
    );
    Ok(item)
}

fn task_record(item: &Item) -> Result<TaskRecord> {
    let task_id = item
        .get(ATTR_TASK_ID)
        .and_then(|value| value.as_str())
        .ok_or_else(|| StoreError::Storage("stored task is missing taskId".into()))?
        .to_string();
    let payload = item
        .get(ATTR_PAYLOAD)
        .and_then(|value| value.as_str())
        .ok_or_else(|| StoreError::Storage("stored task is missing its payload".into()))?;
    let payload: Value = serde_json::from_str(payload)?;
    let expires_millis = item
        .get(ATTR_LEASE_EXPIRES)
        .and_then(AttrValue::as_number)
        .ok_or_else(|| StoreError::Storage("stored task is missing leaseExpires".into()))?;
    let lease_expires = Utc
        .timestamp_millis_opt(expires_millis as i64)
        .single()
        .ok_or_else(|| StoreError::Storage("stored task has an invalid leaseExpires".into()))?;
    let retry_count = item
        .get(ATTR_RETRY_COUNT)
        .and_then(AttrValue::as_number)
        .unwrap_or(0.0) as u32;
    Ok(TaskRecord {
        task_id,
        payload,
        lease_expires,
        retry_count,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryBackend;
    use serde_json::json;

    fn queue() -> LeaseQueue {
        LeaseQueue::new(Arc::new(MemoryBackend::new()), StoreConfig::default())
    }

    #[tokio::test]
    async fn registered_task_is_grabbed_exactly_once() {
        let queue = queue();
        let registered = queue.register(&json!({"job": "reindex"})).await.unwrap();

        let grabbed = queue.grab(1).await.unwrap();
        assert_eq!(grabbed.len(), 1);
        assert_eq!(grabbed[0].task_id, registered.task_id);
        assert!(grabbed[0].lease_expires > registered.lease_expires);

        // The lease is fresh, so an immediate second grab sees nothing.
        assert!(queue.grab(1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn expired_lease_makes_the_task_grabbable_again() {
        let queue = queue();
        queue.register(&json!({"job": "sync"})).await.unwrap();
        let first = queue.grab(1).await.unwrap();
        assert_eq!(first.len(), 1);

        // Force the lease into the past instead of waiting it out.
        queue.extend(&first[0].task_id, -1).await.unwrap();
        let second = queue.grab(1).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].task_id, first[0].task_id);
    }

    #[tokio::test]
    async fn retry_count_is_preserved_on_redelivery() {
        let queue = queue();
        queue.register(&json!({"job": "retryable"})).await.unwrap();
        let first = queue.grab(1).await.unwrap();
        queue.extend(&first[0].task_id, -1).await.unwrap();
        let second = queue.grab(1).await.unwrap();
        assert_eq!(second[0].retry_count, first[0].retry_count);
    }

    #[tokio::test]
    async fn earliest_expired_tasks_are_delivered_first() {
        let queue = queue();
        let a = queue.register(&json!({"job": "a"})).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let b = queue.register(&json!({"job": "b"})).await.unwrap();

        let grabbed = queue.grab(2).await.unwrap();
        let order: Vec<_> = grabbed.iter().map(|task| task.task_id.as_str()).collect();
        assert_eq!(order, vec![a.task_id.as_str(), b.task_id.as_str()]);
    }

    #[tokio::test]
    async fn extending_a_missing_task_is_a_silent_no_op() {
        let queue = queue();
        queue.extend("absent", 30).await.unwrap();
    }

    #[tokio::test]
    async fn deleted_tasks_are_gone() {
        let queue = queue();
        let task = queue.register(&json!({"job": "done"})).await.unwrap();
        queue.delete(&task.task_id).await.unwrap();
        assert!(queue.grab(1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn same_payload_registers_the_same_id() {
        let queue = queue();
        let first = queue.register(&json!({"job": "dedupe"})).await.unwrap();
        let second = queue.register(&json!({"job": "dedupe"})).await.unwrap();
        assert_eq!(first.task_id, second.task_id);
    }
}
