//! Contract with the backing partitioned key-value store.
//!
//! The backend is a black box reached over the network: items addressed by
//! (partition key, sort key), range queries on one sort dimension at a time
//! (optionally through a named secondary index), an unordered scan, an atomic
//! single-item increment, a guarded conditional put, and a bounded batch
//! delete. Everything above this module compensates for those limits instead
//! of assuming a richer substrate.

pub mod memory;

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::filter::TranslatedFilter;

/// Item attribute holding the partition key.
pub const ATTR_PARTITION: &str = "pk";
/// Item attribute holding the primary sort key.
pub const ATTR_SORT: &str = "sk";

/// Largest batch the backend accepts for a multi-item delete.
pub const MAX_DELETE_BATCH: usize = 25;

/// A scalar attribute value as the backend stores it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", content = "v")]
pub enum AttrValue {
    S(String),
    N(f64),
    Bool(bool),
    B(Vec<u8>),
}

impl AttrValue {
    /// Canonical string form: what composite sort keys are built from and
    /// what booleans compare as. Integral numbers render without a fraction
    /// so "3" and 3 compose identical keys.
    pub fn canonical_string(&self) -> String {
        match self {
            AttrValue::S(value) => value.clone(),
            AttrValue::N(value) => {
                if value.fract() == 0.0 && value.is_finite() && value.abs() < 9.0e15 {
                    format!("{}", *value as i64)
                } else {
                    value.to_string()
                }
            }
            AttrValue::Bool(value) => value.to_string(),
            AttrValue::B(bytes) => hex::encode(bytes),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttrValue::S(value) => Some(value.as_str()),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            AttrValue::N(value) => Some(*value),
            _ => None,
        }
    }

    /// Total order used by the memory backend when sorting an index
    /// dimension. Numbers compare numerically, everything else by canonical
    /// string; mixed types compare by a fixed type rank so the order is
    /// still total.
    pub fn index_cmp(&self, other: &AttrValue) -> Ordering {
        fn rank(value: &AttrValue) -> u8 {
            match value {
                AttrValue::N(_) => 0,
                AttrValue::S(_) => 1,
                AttrValue::Bool(_) => 2,
                AttrValue::B(_) => 3,
            }
        }
        match (self, other) {
            (AttrValue::N(lhs), AttrValue::N(rhs)) => {
                lhs.partial_cmp(rhs).unwrap_or(Ordering::Equal)
            }
            (AttrValue::B(lhs), AttrValue::B(rhs)) => lhs.cmp(rhs),
            (lhs, rhs) if rank(lhs) == rank(rhs) => {
                lhs.canonical_string().cmp(&rhs.canonical_string())
            }
            (lhs, rhs) => rank(lhs).cmp(&rank(rhs)),
        }
    }
}

impl fmt::Display for AttrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.canonical_string())
    }
}

impl From<&str> for AttrValue {
    fn from(value: &str) -> Self {
        AttrValue::S(value.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(value: String) -> Self {
        AttrValue::S(value)
    }
}

impl From<f64> for AttrValue {
    fn from(value: f64) -> Self {
        AttrValue::N(value)
    }
}

impl From<i64> for AttrValue {
    fn from(value: i64) -> Self {
        AttrValue::N(value as f64)
    }
}

impl From<bool> for AttrValue {
    fn from(value: bool) -> Self {
        AttrValue::Bool(value)
    }
}

/// One stored item: a flat attribute map carrying its own `pk`/`sk`.
pub type Item = BTreeMap<String, AttrValue>;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ItemKey {
    pub partition: String,
    pub sort: String,
}

impl ItemKey {
    pub fn new(partition: impl Into<String>, sort: impl Into<String>) -> Self {
        Self {
            partition: partition.into(),
            sort: sort.into(),
        }
    }

    pub fn of(item: &Item) -> Option<Self> {
        let partition = item.get(ATTR_PARTITION)?.as_str()?.to_string();
        let sort = item.get(ATTR_SORT)?.as_str()?.to_string();
        Some(Self { partition, sort })
    }
}

/// A secondary index: queries order by `sort_attr` instead of the primary
/// sort key. Items missing the attribute are absent from the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexSpec {
    pub name: &'static str,
    pub sort_attr: &'static str,
}

/// Range condition on the queried sort dimension; all bounds optional.
#[derive(Debug, Clone, Default)]
pub struct SortRange {
    pub gt: Option<AttrValue>,
    pub gte: Option<AttrValue>,
    pub lt: Option<AttrValue>,
    pub lte: Option<AttrValue>,
}

impl SortRange {
    pub fn lte(value: impl Into<AttrValue>) -> Self {
        Self {
            lte: Some(value.into()),
            ..Self::default()
        }
    }

    pub(crate) fn contains(&self, value: &AttrValue) -> bool {
        if let Some(bound) = &self.gt {
            if value.index_cmp(bound) != Ordering::Greater {
                return false;
            }
        }
        if let Some(bound) = &self.gte {
            if value.index_cmp(bound) == Ordering::Less {
                return false;
            }
        }
        if let Some(bound) = &self.lt {
            if value.index_cmp(bound) != Ordering::Less {
                return false;
            }
        }
        if let Some(bound) = &self.lte {
            if value.index_cmp(bound) == Ordering::Greater {
                return false;
            }
        }
        true
    }
}

/// Resume point for a query: the sort dimension value and primary sort key
/// of the last item the backend handed back. Queries restart strictly after
/// this position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResumeKey {
    pub partition: String,
    pub sort_value: AttrValue,
    pub sort_key: String,
}

#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub partition: String,
    /// `None` queries the primary sort key.
    pub index: Option<IndexSpec>,
    pub range: Option<SortRange>,
    /// Post-fetch filter; reduces returned items but not scanned count.
    pub filter: Option<TranslatedFilter>,
    /// Cap on items *scanned* per round-trip, pre-filter.
    pub limit: usize,
    pub start_after: Option<ResumeKey>,
    pub ascending: bool,
}

impl QueryRequest {
    pub fn new(partition: impl Into<String>, limit: usize) -> Self {
        Self {
            partition: partition.into(),
            index: None,
            range: None,
            filter: None,
            limit,
            start_after: None,
            ascending: true,
        }
    }
}

/// One page of query results. `last_key` is present when the scan stopped at
/// the limit with items remaining; because of post-filtering it says nothing
/// about how many *matching* items remain.
#[derive(Debug, Clone, Default)]
pub struct QueryPage {
    pub items: Vec<Item>,
    pub last_key: Option<ResumeKey>,
}

#[derive(Debug, Clone, Default)]
pub struct ScanRequest {
    pub limit: usize,
    pub start_after: Option<ItemKey>,
}

#[derive(Debug, Clone, Default)]
pub struct ScanPage {
    pub items: Vec<Item>,
    pub last_key: Option<ItemKey>,
}

/// Per-batch report for a bounded multi-item delete. Failed keys are
/// reported, not retried; earlier batches are never rolled back.
#[derive(Debug, Clone, Default)]
pub struct BatchDeleteOutcome {
    pub deleted: usize,
    pub failed: Vec<ItemKey>,
}

#[async_trait]
pub trait Backend: Send + Sync {
    async fn put_item(&self, item: Item) -> Result<()>;

    /// Guarded write: succeeds only when the stored item's `guard` attribute
    /// equals `expected` (`None` means the item must be absent). Returns
    /// whether the write happened.
    async fn put_item_if(
        &self,
        item: Item,
        guard: &str,
        expected: Option<&AttrValue>,
    ) -> Result<bool>;

    async fn get_item(&self, partition: &str, sort: &str) -> Result<Option<Item>>;

    async fn delete_item(&self, partition: &str, sort: &str) -> Result<()>;

    async fn query(&self, request: QueryRequest) -> Result<QueryPage>;

    async fn scan(&self, request: ScanRequest) -> Result<ScanPage>;

    /// Atomically adds one to a numeric attribute, creating the item at zero
    /// first when absent, and returns the post-increment value.
    async fn increment(&self, partition: &str, sort: &str, attr: &str) -> Result<i64>;

    /// Deletes up to [`MAX_DELETE_BATCH`] keys; larger batches are refused.
    async fn batch_delete(&self, keys: Vec<ItemKey>) -> Result<BatchDeleteOutcome>;
}
