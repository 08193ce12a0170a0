//! Query semantics of the message index end to end: OR-of-AND filtering,
//! alternate sort orders, pagination under a selective filter, and write
//! idempotency.

use std::sync::Arc;

use tidemark::backend::memory::MemoryBackend;
use tidemark::filter::{FilterCondition, FilterGroup, RangeFilter};
use tidemark::{AttrValue, IndexValue, MessageIndexStore, SortField, SortSpec, StoreConfig};

fn store() -> MessageIndexStore {
    MessageIndexStore::new(Arc::new(MemoryBackend::new()), StoreConfig::default())
}

fn eq_group(attr: &str, value: impl Into<AttrValue>) -> FilterGroup {
    let mut group = FilterGroup::new();
    group.insert(attr.to_string(), FilterCondition::Equals(value.into()));
    group
}

async fn put_message(
    store: &MessageIndexStore,
    content_id: &str,
    pairs: &[(&str, AttrValue)],
) -> String {
    let attributes = pairs
        .iter()
        .map(|(name, value)| (name.to_string(), IndexValue::One(value.clone())))
        .collect();
    store
        .put("t", "record", Some(content_id.to_string()), attributes)
        .await
        .unwrap()
}

#[tokio::test]
async fn or_groups_return_the_union_of_matches() {
    let store = store();
    put_message(
        &store,
        "c1",
        &[("kind", "note".into()), ("dateObserved", "2024-01-01".into())],
    )
    .await;
    put_message(
        &store,
        "c2",
        &[
            ("kind", "article".into()),
            ("dateObserved", "2024-01-02".into()),
        ],
    )
    .await;
    put_message(
        &store,
        "c3",
        &[
            ("kind", "photo".into()),
            ("dateObserved", "2024-01-03".into()),
        ],
    )
    .await;

    let filters = vec![eq_group("kind", "note"), eq_group("kind", "article")];
    let page = store.query("t", &filters, None, None, None).await.unwrap();
    let ids: Vec<_> = page
        .messages
        .iter()
        .map(|message| message.content_id.as_str())
        .collect();
    assert_eq!(ids, vec!["c1", "c2"]);
}

#[tokio::test]
async fn descending_sort_reverses_the_composite_order() {
    let store = store();
    for (id, date) in [("c1", "2024-01-01"), ("c2", "2024-01-02"), ("c3", "2024-01-03")] {
        put_message(&store, id, &[("datePublished", date.into())]).await;
    }

    let page = store
        .query(
            "t",
            &[],
            Some(SortSpec {
                field: SortField::Published,
                ascending: false,
            }),
            None,
            None,
        )
        .await
        .unwrap();
    let ids: Vec<_> = page
        .messages
        .iter()
        .map(|message| message.content_id.as_str())
        .collect();
    assert_eq!(ids, vec!["c3", "c2", "c1"]);
}

#[tokio::test]
async fn range_filters_are_half_open() {
    let store = store();
    for (i, (id, score)) in [("c1", 3.0), ("c2", 5.0), ("c3", 8.0), ("c4", 10.0)]
        .into_iter()
        .enumerate()
    {
        put_message(
            &store,
            id,
            &[
                ("score", AttrValue::N(score)),
                ("dateObserved", format!("2024-01-0{}", i + 1).into()),
            ],
        )
        .await;
    }

    let mut group = FilterGroup::new();
    group.insert(
        "score".into(),
        FilterCondition::Range(RangeFilter {
            gt: Some(AttrValue::N(3.0)),
            lte: Some(AttrValue::N(8.0)),
            ..RangeFilter::default()
        }),
    );
    let page = store.query("t", &[group], None, None, None).await.unwrap();
    let ids: Vec<_> = page
        .messages
        .iter()
        .map(|message| message.content_id.as_str())
        .collect();
    assert_eq!(ids, vec!["c2", "c3"]);
}

#[tokio::test]
async fn filtered_pagination_yields_full_pages_without_duplicates() {
    let store = store();
    // 30 messages, every other one a note; a page of 5 must skip across
    // many non-matching records per round.
    for i in 0..30 {
        let kind = if i % 2 == 0 { "note" } else { "photo" };
        put_message(
            &store,
            &format!("c{i:02}"),
            &[
                ("kind", kind.into()),
                ("dateObserved", format!("2024-01-01T00:00:{i:02}").into()),
            ],
        )
        .await;
    }

    let filters = vec![eq_group("kind", "note")];
    let mut collected = Vec::new();
    let mut cursor: Option<String> = None;
    loop {
        let page = store
            .query("t", &filters, None, cursor.as_deref(), Some(5))
            .await
            .unwrap();
        assert!(page.messages.len() <= 5);
        collected.extend(
            page.messages
                .iter()
                .map(|message| message.content_id.clone()),
        );
        match page.cursor {
            Some(next) => cursor = Some(next),
            None => break,
        }
    }

    let expected: Vec<String> = (0..30)
        .filter(|i| i % 2 == 0)
        .map(|i| format!("c{i:02}"))
        .collect();
    assert_eq!(collected, expected);
}

#[tokio::test]
async fn querying_by_a_reserved_attribute_name_works_end_to_end() {
    let store = store();
    put_message(
        &store,
        "c1",
        &[("name", "ada".into()), ("dateObserved", "2024-01-01".into())],
    )
    .await;
    put_message(
        &store,
        "c2",
        &[
            ("name", "grace".into()),
            ("dateObserved", "2024-01-02".into()),
        ],
    )
    .await;

    let page = store
        .query("t", &[eq_group("name", "ada")], None, None, None)
        .await
        .unwrap();
    assert_eq!(page.messages.len(), 1);
    assert_eq!(
        page.messages[0].attributes.get("name"),
        Some(&IndexValue::One("ada".into()))
    );
}

#[tokio::test]
async fn rewriting_the_same_content_overwrites_in_place() {
    let store = store();
    put_message(
        &store,
        "c1",
        &[("kind", "note".into()), ("dateObserved", "2024-01-01".into())],
    )
    .await;
    put_message(
        &store,
        "c1",
        &[
            ("kind", "article".into()),
            ("dateObserved", "2024-01-01".into()),
        ],
    )
    .await;

    let page = store.query("t", &[], None, None, None).await.unwrap();
    assert_eq!(page.messages.len(), 1);
    assert_eq!(
        page.messages[0].attributes.get("kind"),
        Some(&IndexValue::One("article".into()))
    );
}

#[tokio::test]
async fn tenants_never_see_each_other() {
    let store = store();
    put_message(&store, "c1", &[("dateObserved", "2024-01-01".into())]).await;

    let mut attributes = tidemark::IndexMap::new();
    attributes.insert(
        "dateObserved".into(),
        IndexValue::One("2024-01-01".into()),
    );
    store
        .put("other", "record", Some("c2".into()), attributes)
        .await
        .unwrap();

    let page = store.query("t", &[], None, None, None).await.unwrap();
    let ids: Vec<_> = page
        .messages
        .iter()
        .map(|message| message.content_id.as_str())
        .collect();
    assert_eq!(ids, vec!["c1"]);
}
