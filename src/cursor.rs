//! Opaque resumable pagination cursors.
//!
//! A cursor captures the composite key of the last item a query returned and
//! which index produced it; re-issuing the query with the cursor resumes
//! strictly after that item. Tokens are canonical JSON wrapped in URL-safe
//! unpadded base64 — opaque to callers, deterministic to us. Cursors do not
//! survive index or schema changes, and a token presented against a
//! different tenant or index is rejected outright.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::backend::{
    Backend, IndexSpec, Item, QueryRequest, ResumeKey, SortRange, ATTR_SORT,
};
use crate::error::{Result, StoreError};
use crate::filter::TranslatedFilter;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cursor {
    /// Name of the index the page was read from.
    pub index: String,
    pub resume: ResumeKey,
}

impl Cursor {
    /// Captures the resume point following `item` under `index`.
    pub fn after_item(index: &IndexSpec, item: &Item) -> Result<Self> {
        let resume = resume_key_for(index, item)?;
        Ok(Self {
            index: index.name.to_string(),
            resume,
        })
    }

    pub fn encode(&self) -> Result<String> {
        let json = serde_json::to_vec(self)?;
        Ok(URL_SAFE_NO_PAD.encode(json))
    }

    pub fn decode(token: &str) -> Result<Self> {
        let bytes = URL_SAFE_NO_PAD
            .decode(token.trim())
            .map_err(|err| StoreError::InvalidCursor(err.to_string()))?;
        serde_json::from_slice(&bytes)
            .map_err(|err| StoreError::InvalidCursor(err.to_string()))
    }

    /// A cursor only resumes the query shape that produced it.
    pub fn ensure_scope(&self, partition: &str, index: &IndexSpec) -> Result<()> {
        if self.resume.partition != partition {
            return Err(StoreError::InvalidCursor(
                "cursor belongs to a different tenant".into(),
            ));
        }
        if self.index != index.name {
            return Err(StoreError::InvalidCursor(format!(
                "cursor was issued by index '{}', not '{}'",
                self.index, index.name
            )));
        }
        Ok(())
    }
}

fn resume_key_for(index: &IndexSpec, item: &Item) -> Result<ResumeKey> {
    let partition = item
        .get(crate::backend::ATTR_PARTITION)
        .and_then(|value| value.as_str())
        .ok_or_else(|| StoreError::Storage("record is missing its partition key".into()))?;
    let sort_key = item
        .get(ATTR_SORT)
        .and_then(|value| value.as_str())
        .ok_or_else(|| StoreError::Storage("record is missing its sort key".into()))?;
    let sort_value = item.get(index.sort_attr).cloned().ok_or_else(|| {
        StoreError::Storage(format!(
            "record is missing index attribute '{}'",
            index.sort_attr
        ))
    })?;
    Ok(ResumeKey {
        partition: partition.to_string(),
        sort_value,
        sort_key: sort_key.to_string(),
    })
}

/// Runs a filtered, ordered query with over-fetch pagination.
///
/// The backend's own truncation signal is unreliable once a post-filter is
/// in play, so each round-trip asks for `fetch_limit` scanned items and the
/// loop keeps going until it has one more match than `limit` or the range is
/// exhausted. The surplus item proves more data exists; the cursor is built
/// from the last item actually returned.
pub(crate) async fn paginate(
    backend: &dyn Backend,
    partition: &str,
    index: IndexSpec,
    range: Option<SortRange>,
    filter: Option<TranslatedFilter>,
    ascending: bool,
    limit: usize,
    fetch_limit: usize,
    cursor: Option<Cursor>,
) -> Result<(Vec<Item>, Option<Cursor>)> {
    if limit == 0 {
        return Ok((Vec::new(), None));
    }
    if let Some(cursor) = &cursor {
        cursor.ensure_scope(partition, &index)?;
    }

    let mut collected: Vec<Item> = Vec::new();
    let mut resume = cursor.map(|cursor| cursor.resume);

    loop {
        let page = backend
            .query(QueryRequest {
                partition: partition.to_string(),
                index: Some(index),
                range: range.clone(),
                filter: filter.clone(),
                limit: fetch_limit,
                start_after: resume.take(),
                ascending,
            })
            .await?;
        collected.extend(page.items);
        if collected.len() > limit {
            break;
        }
        match page.last_key {
            Some(key) => resume = Some(key),
            None => break,
        }
    }

    if collected.len() > limit {
        collected.truncate(limit);
        let last = collected
            .last()
            .expect("limit is non-zero, so a truncated page has a last item");
        let cursor = Cursor::after_item(&index, last)?;
        Ok((collected, Some(cursor)))
    } else {
        Ok((collected, None))
    }
}
