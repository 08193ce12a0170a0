//! In-process backend honoring the full [`Backend`](super::Backend)
//! contract: attribute-sorted index queries with continuation keys, a
//! post-fetch filter that reduces results but not scanned counts, atomic
//! increments, guarded writes, and the bounded batch delete. Tests and
//! embedders run against it; the stores cannot tell it from a wire backend.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{
    AttrValue, Backend, BatchDeleteOutcome, Item, ItemKey, QueryPage, QueryRequest, ResumeKey,
    ScanPage, ScanRequest, ATTR_PARTITION, ATTR_SORT, MAX_DELETE_BATCH,
};
use crate::error::{Result, StoreError};

#[derive(Default)]
pub struct MemoryBackend {
    items: Mutex<BTreeMap<(String, String), Item>>,
    failpoints: Mutex<HashSet<String>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arms a one-shot failure for the named operation (`"query"`, `"scan"`,
    /// `"put_item"`, `"increment"`, `"batch_delete"`, `"get_item"`). The next
    /// call to that operation fails with `Unavailable`.
    pub fn inject_failure(&self, op: &str) {
        self.failpoints.lock().insert(op.to_string());
    }

    pub fn item_count(&self) -> usize {
        self.items.lock().len()
    }

    fn trip(&self, op: &str) -> Result<()> {
        if self.failpoints.lock().remove(op) {
            return Err(StoreError::Unavailable(format!(
                "injected failure in {op}"
            )));
        }
        Ok(())
    }
}

fn require_key(item: &Item) -> Result<(String, String)> {
    let key = ItemKey::of(item).ok_or_else(|| {
        StoreError::Storage("item is missing its partition or sort key".into())
    })?;
    Ok((key.partition, key.sort))
}

fn position_cmp(value: &AttrValue, sort: &str, resume: &ResumeKey) -> Ordering {
    value
        .index_cmp(&resume.sort_value)
        .then_with(|| sort.cmp(resume.sort_key.as_str()))
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn put_item(&self, item: Item) -> Result<()> {
        self.trip("put_item")?;
        let key = require_key(&item)?;
        self.items.lock().insert(key, item);
        Ok(())
    }

    async fn put_item_if(
        &self,
        item: Item,
        guard: &str,
        expected: Option<&AttrValue>,
    ) -> Result<bool> {
        self.trip("put_item")?;
        let key = require_key(&item)?;
        let mut items = self.items.lock();
        let matched = match (items.get(&key), expected) {
            (None, None) => true,
            (Some(current), Some(expected)) => current.get(guard) == Some(expected),
            _ => false,
        };
        if matched {
            items.insert(key, item);
        }
        Ok(matched)
    }

    async fn get_item(&self, partition: &str, sort: &str) -> Result<Option<Item>> {
        self.trip("get_item")?;
        Ok(self
            .items
            .lock()
            .get(&(partition.to_string(), sort.to_string()))
            .cloned())
    }

    async fn delete_item(&self, partition: &str, sort: &str) -> Result<()> {
        self.trip("delete_item")?;
        self.items
            .lock()
            .remove(&(partition.to_string(), sort.to_string()));
        Ok(())
    }

    async fn query(&self, request: QueryRequest) -> Result<QueryPage> {
        self.trip("query")?;
        let sort_attr = request
            .index
            .map(|index| index.sort_attr)
            .unwrap_or(ATTR_SORT);

        let items = self.items.lock();
        let mut rows: Vec<(AttrValue, String, Item)> = items
            .iter()
            .filter(|((partition, _), _)| *partition == request.partition)
            .filter_map(|((_, sort), item)| {
                // Items without the index attribute are absent from the index.
                let value = item.get(sort_attr)?.clone();
                Some((value, sort.clone(), item.clone()))
            })
            .collect();
        drop(items);

        rows.sort_by(|a, b| a.0.index_cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
        if !request.ascending {
            rows.reverse();
        }
        if let Some(range) = &request.range {
            rows.retain(|(value, _, _)| range.contains(value));
        }

        let start = match &request.start_after {
            Some(resume) => rows
                .iter()
                .position(|(value, sort, _)| {
                    let ordering = position_cmp(value, sort, resume);
                    if request.ascending {
                        ordering == Ordering::Greater
                    } else {
                        ordering == Ordering::Less
                    }
                })
                .unwrap_or(rows.len()),
            None => 0,
        };

        let limit = request.limit.max(1);
        let scanned = &rows[start..(start + limit).min(rows.len())];
        let exhausted = start + scanned.len() >= rows.len();
        let last_key = if exhausted {
            None
        } else {
            scanned.last().map(|(value, sort, _)| ResumeKey {
                partition: request.partition.clone(),
                sort_value: value.clone(),
                sort_key: sort.clone(),
            })
        };

        let matched = scanned
            .iter()
            .filter(|(_, _, item)| {
                request
                    .filter
                    .as_ref()
                    .map(|filter| filter.matches(item))
                    .unwrap_or(true)
            })
            .map(|(_, _, item)| item.clone())
            .collect();

        Ok(QueryPage {
            items: matched,
            last_key,
        })
    }

    async fn scan(&self, request: ScanRequest) -> Result<ScanPage> {
        self.trip("scan")?;
        let items = self.items.lock();
        let start = match &request.start_after {
            Some(key) => {
                let position = (key.partition.clone(), key.sort.clone());
                items
                    .iter()
                    .position(|(k, _)| *k > position)
                    .unwrap_or(items.len())
            }
            None => 0,
        };
        let limit = request.limit.max(1);
        let page: Vec<(&(String, String), &Item)> =
            items.iter().skip(start).take(limit).collect();
        let exhausted = start + page.len() >= items.len();
        let last_key = if exhausted {
            None
        } else {
            page.last().map(|((partition, sort), _)| ItemKey {
                partition: partition.clone(),
                sort: sort.clone(),
            })
        };
        Ok(ScanPage {
            items: page.into_iter().map(|(_, item)| item.clone()).collect(),
            last_key,
        })
    }

    async fn increment(&self, partition: &str, sort: &str, attr: &str) -> Result<i64> {
        self.trip("increment")?;
        let mut items = self.items.lock();
        let key = (partition.to_string(), sort.to_string());
        let item = items.entry(key).or_insert_with(|| {
            let mut item = Item::new();
            item.insert(ATTR_PARTITION.into(), AttrValue::S(partition.to_string()));
            item.insert(ATTR_SORT.into(), AttrValue::S(sort.to_string()));
            item
        });
        let current = item.get(attr).and_then(AttrValue::as_number).unwrap_or(0.0);
        let next = current + 1.0;
        item.insert(attr.to_string(), AttrValue::N(next));
        Ok(next as i64)
    }

    async fn batch_delete(&self, keys: Vec<ItemKey>) -> Result<BatchDeleteOutcome> {
        self.trip("batch_delete")?;
        if keys.len() > MAX_DELETE_BATCH {
            return Err(StoreError::Storage(format!(
                "batch of {} exceeds the {MAX_DELETE_BATCH}-item limit",
                keys.len()
            )));
        }
        let mut items = self.items.lock();
        let mut deleted = 0;
        for key in keys {
            // Deleting an absent key is a success, as on the real backend.
            items.remove(&(key.partition, key.sort));
            deleted += 1;
        }
        Ok(BatchDeleteOutcome {
            deleted,
            failed: Vec::new(),
        })
    }
}
