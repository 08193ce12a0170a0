//! Content-addressed binary storage. No filtering or ordering: one item per
//! (tenant, record id, content id), bytes in a single binary attribute.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::backend::{AttrValue, Backend, Item, ATTR_PARTITION, ATTR_SORT};
use crate::config::StoreConfig;
use crate::error::{Result, StoreError};
use crate::event_log::clear_all;
use crate::sortkey::SORT_KEY_SEP;

const ATTR_BYTES: &str = "bytes";

pub struct BlobStore {
    backend: Arc<dyn Backend>,
    config: StoreConfig,
}

impl BlobStore {
    pub fn new(backend: Arc<dyn Backend>, config: StoreConfig) -> Self {
        Self { backend, config }
    }

    fn sort_key(record_id: &str, content_id: &str) -> String {
        format!("{record_id}{SORT_KEY_SEP}{content_id}")
    }

    pub async fn put(
        &self,
        tenant: &str,
        record_id: &str,
        content_id: &str,
        bytes: Vec<u8>,
    ) -> Result<()> {
        ensure_identifier("tenant", tenant)?;
        ensure_identifier("record_id", record_id)?;
        ensure_identifier("content_id", content_id)?;

        let mut item = Item::new();
        item.insert(ATTR_PARTITION.into(), AttrValue::S(tenant.to_string()));
        item.insert(
            ATTR_SORT.into(),
            AttrValue::S(Self::sort_key(record_id, content_id)),
        );
        item.insert(ATTR_BYTES.into(), AttrValue::B(bytes));
        self.backend.put_item(item).await
    }

    /// Missing blobs are `Ok(None)`, not errors.
    pub async fn get(
        &self,
        tenant: &str,
        record_id: &str,
        content_id: &str,
    ) -> Result<Option<Vec<u8>>> {
        ensure_identifier("tenant", tenant)?;
        let item = self
            .backend
            .get_item(tenant, &Self::sort_key(record_id, content_id))
            .await?;
        Ok(item.and_then(|mut item| match item.remove(ATTR_BYTES) {
            Some(AttrValue::B(bytes)) => Some(bytes),
            _ => None,
        }))
    }

    pub async fn delete(&self, tenant: &str, record_id: &str, content_id: &str) -> Result<()> {
        ensure_identifier("tenant", tenant)?;
        self.backend
            .delete_item(tenant, &Self::sort_key(record_id, content_id))
            .await
    }

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
