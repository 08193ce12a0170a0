//! Queryable message store with three alternate sort orders.
//!
//! A message is an attribute map stored under (tenant, content id). Each of
//! the three timestamp attributes a message may carry gets a derived
//! composite sort key (value + content id), so every sort index has a strict
//! total order and equal timestamps tie-break by content id ascending.
//! Filtering goes through the translator, pagination through the over-fetch
//! cursor loop — with the raw fetch limit inflated by the number of OR
//! groups, since each branch can independently contribute matches.

use std::collections::BTreeMap;
use std::sync::Arc;

use metrics::counter;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::backend::{AttrValue, Backend, IndexSpec, Item, ATTR_PARTITION, ATTR_SORT};
use crate::config::{ReadErrorPolicy, StoreConfig};
use crate::content::{ContentAddresser, Sha256Addresser};
use crate::cursor::{self, Cursor};
use crate::error::{Result, StoreError};
use crate::event_log::clear_all;
use crate::filter::{self, FilterGroup};
use crate::sortkey::{self, SORT_KEY_SEP};

pub(crate) const ATTR_RECORD_ID: &str = "recordId";
pub(crate) const ATTR_CONTENT_ID: &str = "contentId";

/// Indexed attributes treated as denormalized, repeatable metadata. A caller
/// may supply several values for these; the store flattens them to numbered
/// attributes and merges them back on read.
const TAG_ATTRIBUTES: &[&str] = &["tag"];

const CREATED_INDEX: IndexSpec = IndexSpec {
    name: "created-index",
    sort_attr: "createdSort",
};
const PUBLISHED_INDEX: IndexSpec = IndexSpec {
    name: "published-index",
    sort_attr: "publishedSort",
};
const OBSERVED_INDEX: IndexSpec = IndexSpec {
    name: "observed-index",
    sort_attr: "observedSort",
};

/// (source attribute, derived index) for each sortable timestamp.
const SORT_SOURCES: &[(&str, IndexSpec)] = &[
    ("dateCreated", CREATED_INDEX),
    ("datePublished", PUBLISHED_INDEX),
    ("dateObserved", OBSERVED_INDEX),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortField {
    Created,
    Published,
    Observed,
}

impl SortField {
    fn index(self) -> IndexSpec {
        match self {
            SortField::Created => CREATED_INDEX,
            SortField::Published => PUBLISHED_INDEX,
            SortField::Observed => OBSERVED_INDEX,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SortSpec {
    pub field: SortField,
    pub ascending: bool,
}

impl Default for SortSpec {
    fn default() -> Self {
        Self {
            field: SortField::Observed,
            ascending: true,
        }
    }
}

/// A caller-supplied indexed value: single, or repeated for tag attributes.
#[derive(Debug, Clone, PartialEq)]
pub enum IndexValue {
    One(AttrValue),
    Many(Vec<AttrValue>),
}

pub type IndexMap = BTreeMap<String, IndexValue>;

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub record_id: String,
    pub content_id: String,
    pub attributes: IndexMap,
}

#[derive(Debug, Clone, Default)]
pub struct MessagePage {
    pub messages: Vec<Message>,
    pub cursor: Option<String>,
}

pub struct MessageIndexStore {
    backend: Arc<dyn Backend>,
    config: StoreConfig,
    addresser: Arc<dyn ContentAddresser>,
}

impl MessageIndexStore {
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

    /// Writes one message and returns its content id, deriving the id from
    /// the message content when the caller does not already know it. A
    /// repeated put with the same content id overwrites in place.
    pub async fn put(
        &self,
        tenant: &str,
        record_id: &str,
        content_id: Option<String>,
        attributes: IndexMap,
    ) -> Result<String> {
        ensure_identifier("tenant", tenant)?;
        ensure_identifier("record_id", record_id)?;

        let content_id = match content_id {
            Some(id) => id,
            None => self
                .addresser
                .content_id(&serialized_for_hashing(record_id, &attributes))?,
        };

        let mut item = Item::new();
        item.insert(ATTR_PARTITION.into(), AttrValue::S(tenant.to_string()));
        item.insert(ATTR_SORT.into(), AttrValue::S(content_id.clone()));
        item.insert(ATTR_RECORD_ID.into(), AttrValue::S(record_id.to_string()));
        item.insert(ATTR_CONTENT_ID.into(), AttrValue::S(content_id.clone()));

        for (name, value) in &attributes {
            ensure_caller_attribute(name)?;
            match value {
                IndexValue::One(value) => {
                    item.insert(filter::remap_reserved(name).to_string(), value.clone());
                }
                IndexValue::Many(values) if TAG_ATTRIBUTES.contains(&name.as_str()) => {
                    for (position, value) in values.iter().enumerate() {
                        item.insert(format!("{name}{SORT_KEY_SEP}{position}"), value.clone());
                    }
                }
                IndexValue::Many(_) => {
                    return Err(StoreError::InvalidAttribute(format!(
                        "'{name}' is not a tag attribute and cannot repeat"
                    )));
                }
            }
        }

        // A record only joins the sort indexes whose source attribute it has.
        for (source, index) in SORT_SOURCES {
            if let Some(IndexValue::One(value)) = attributes.get(*source) {
                item.insert(
                    index.sort_attr.to_string(),
                    AttrValue::S(sortkey::compose(value, &content_id)),
                );
            }
        }

        self.backend.put_item(item).await?;
        counter!(
            "tidemark_store_operations_total",
            1,
            "store" => "message_index",
            "op" => "put"
        );
        Ok(content_id)
    }

    /// Direct key lookup; an absent message is `Ok(None)`, not an error.
    pub async fn get(&self, tenant: &str, content_id: &str) -> Result<Option<Message>> {
        ensure_identifier("tenant", tenant)?;
        let item = match self.backend.get_item(tenant, content_id).await {
            Ok(item) => item,
            Err(err)
                if err.is_backend_failure()
                    && self.config.read_error_policy == ReadErrorPolicy::DegradeToEmpty =>
            {
                warn!(tenant, content_id, error = %err, "message read degraded to absent");
                return Ok(None);
            }
            Err(err) => return Err(err),
        };
        item.map(restore_message).transpose()
    }

    /// Filtered query in one of the three sort orders (default: observed,
    /// ascending). Results are strictly ordered by the chosen composite key;
    /// ties are impossible by construction.
    pub async fn query(
        &self,
        tenant: &str,
        filters: &[FilterGroup],
        sort: Option<SortSpec>,
        cursor: Option<&str>,
        take: Option<usize>,
    ) -> Result<MessagePage> {
        ensure_identifier("tenant", tenant)?;
        let limit = self.config.effective_take(take);
        let sort = sort.unwrap_or_default();
        let index = sort.field.index();
        let filter = filter::translate(filters)?;
        let cursor = cursor.map(Cursor::decode).transpose()?;

        // Each OR branch can match independently, so the scanned window must
        // widen with the branch count or a page could under-fill before
        // truncation.
        let fetch_limit = (limit + 1) * filters.len().max(1);

        let outcome = cursor::paginate(
            self.backend.as_ref(),
            tenant,
            index,
            None,
            filter,
            sort.ascending,
            limit,
            fetch_limit,
            cursor,
        )
        .await;

        let (items, next) = match outcome {
            Ok(page) => page,
            Err(err)
                if err.is_backend_failure()
                    && self.config.read_error_policy == ReadErrorPolicy::DegradeToEmpty =>
            {
                warn!(tenant, error = %err, "message query degraded to empty result");
                return Ok(MessagePage::default());
            }
            Err(err) => return Err(err),
        };

        let messages = items
            .into_iter()
            .map(restore_message)
            .collect::<Result<Vec<_>>>()?;
        let cursor = next.map(|cursor| cursor.encode()).transpose()?;
        Ok(MessagePage { messages, cursor })
    }

    pub async fn delete(&self, tenant: &str, content_id: &str) -> Result<()> {
        ensure_identifier("tenant", tenant)?;
        self.backend.delete_item(tenant, content_id).await?;
        counter!(
            "tidemark_store_operations_total",
            1,
            "store" => "message_index",
            "op" => "delete"
        );
        Ok(())
    }

    /// Scan-and-delete of all records; test/maintenance only.
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

fn ensure_caller_attribute(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(StoreError::InvalidAttribute(
            "attribute name cannot be empty".into(),
        ));
    }
    let internal = name == ATTR_PARTITION
        || name == ATTR_SORT
        || name == ATTR_RECORD_ID
        || name == ATTR_CONTENT_ID
        || SORT_SOURCES
            .iter()
            .any(|(_, index)| index.sort_attr == name);
    if internal {
        return Err(StoreError::InvalidAttribute(format!(
            "'{name}' is reserved for the message index itself"
        )));
    }
    Ok(())
}

/// Content ids must not depend on attribute iteration order, so the hashed
/// form goes through the canonical serializer as a JSON document.
fn serialized_for_hashing(record_id: &str, attributes: &IndexMap) -> Value {
    let mut map = serde_json::Map::new();
    map.insert("recordId".into(), Value::String(record_id.to_string()));
    let mut indexed = serde_json::Map::new();
    for (name, value) in attributes {
        let json = match value {
            IndexValue::One(value) => attr_to_json(value),
            IndexValue::Many(values) => Value::Array(values.iter().map(attr_to_json).collect()),
        };
        indexed.insert(name.clone(), json);
    }
    map.insert("indexes".into(), Value::Object(indexed));
    Value::Object(map)
}

fn attr_to_json(value: &AttrValue) -> Value {
    match value {
        AttrValue::S(text) => Value::String(text.clone()),
        AttrValue::N(number) => serde_json::Number::from_f64(*number)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        AttrValue::Bool(flag) => Value::Bool(*flag),
        AttrValue::B(bytes) => Value::String(hex::encode(bytes)),
    }
}

/// Rebuilds the caller-facing message from a stored item: internal and
/// derived attributes stripped, reserved names restored, flattened tags
/// merged back into their repeatable form.
fn restore_message(item: Item) -> Result<Message> {
    let record_id = item
        .get(ATTR_RECORD_ID)
        .and_then(|value| value.as_str())
        .ok_or_else(|| StoreError::Storage("stored message is missing recordId".into()))?
        .to_string();
    let content_id = item
        .get(ATTR_CONTENT_ID)
        .and_then(|value| value.as_str())
        .ok_or_else(|| StoreError::Storage("stored message is missing contentId".into()))?
        .to_string();

    let mut attributes = IndexMap::new();
    let mut tags: BTreeMap<String, Vec<(usize, AttrValue)>> = BTreeMap::new();

    for (name, value) in item {
        if name == ATTR_PARTITION
            || name == ATTR_SORT
            || name == ATTR_RECORD_ID
            || name == ATTR_CONTENT_ID
            || SORT_SOURCES
                .iter()
                .any(|(_, index)| index.sort_attr == name)
        {
            continue;
        }
        if let Some((prefix, position)) = name.split_once(SORT_KEY_SEP) {
            if TAG_ATTRIBUTES.contains(&prefix) {
                let position = position.parse::<usize>().map_err(|_| {
                    StoreError::Storage(format!("malformed tag attribute '{name}'"))
                })?;
                tags.entry(prefix.to_string())
                    .or_default()
                    .push((position, value));
                continue;
            }
        }
        attributes.insert(
            filter::restore_reserved(&name).to_string(),
            IndexValue::One(value),
        );
    }

    for (name, mut values) in tags {
        values.sort_by_key(|(position, _)| *position);
        attributes.insert(
            name,
            IndexValue::Many(values.into_iter().map(|(_, value)| value).collect()),
        );
    }

    Ok(Message {
        record_id,
        content_id,
        attributes,
    })
}
