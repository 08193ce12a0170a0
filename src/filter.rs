//! Translation of structured filter predicates into the backend's
//! expression grammar.
//!
//! A filter is an ordered list of groups; conditions inside a group are
//! ANDed, groups are ORed, and an empty list matches everything. The backend
//! only understands a rendered boolean expression plus name/value binding
//! tables, applied as a post-fetch filter, so the translation produces that
//! pair — and keeps the structured clauses alongside so an in-process
//! backend can evaluate the same predicate without reparsing the string.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::backend::{AttrValue, Item};
use crate::error::{Result, StoreError};

/// Attribute names that collide with the backend's reserved vocabulary.
/// They are renamed before storage and restored on read; the mapping is
/// fixed and reversible, never content-dependent.
pub(crate) const RESERVED_ATTRIBUTES: &[(&str, &str)] = &[
    ("data", "attrData"),
    ("name", "attrName"),
    ("owner", "attrOwner"),
    ("status", "attrStatus"),
    ("timestamp", "attrTimestamp"),
    ("ttl", "attrTtl"),
    ("type", "attrType"),
];

pub(crate) fn remap_reserved(name: &str) -> &str {
    RESERVED_ATTRIBUTES
        .iter()
        .find(|(reserved, _)| *reserved == name)
        .map(|(_, safe)| *safe)
        .unwrap_or(name)
}

pub(crate) fn restore_reserved(name: &str) -> &str {
    RESERVED_ATTRIBUTES
        .iter()
        .find(|(_, safe)| *safe == name)
        .map(|(reserved, _)| *reserved)
        .unwrap_or(name)
}

/// One condition a caller places on an attribute.
#[derive(Debug, Clone)]
pub enum FilterCondition {
    Equals(AttrValue),
    Range(RangeFilter),
}

/// Range descriptor; one-sided or combined. At least one bound must be set.
#[derive(Debug, Clone, Default)]
pub struct RangeFilter {
    pub gt: Option<AttrValue>,
    pub gte: Option<AttrValue>,
    pub lt: Option<AttrValue>,
    pub lte: Option<AttrValue>,
}

impl RangeFilter {
    fn is_empty(&self) -> bool {
        self.gt.is_none() && self.gte.is_none() && self.lt.is_none() && self.lte.is_none()
    }
}

/// Conditions ANDed together; attribute name → condition.
pub type FilterGroup = BTreeMap<String, FilterCondition>;

#[derive(Debug, Clone)]
struct Clause {
    attr: String,
    test: ClauseTest,
}

#[derive(Debug, Clone)]
enum ClauseTest {
    Equals(AttrValue),
    Range(RangeFilter),
}

/// A translated filter: the rendered expression with collision-free binding
/// tables (what a wire backend consumes) plus the structured OR-of-AND
/// clauses the in-process backend evaluates. Both come from one translation
/// pass, so they cannot drift apart.
#[derive(Debug, Clone)]
pub struct TranslatedFilter {
    pub expression: String,
    /// Expression alias (`#fN`) → stored attribute name.
    pub names: BTreeMap<String, String>,
    /// Value placeholder (`:vN`) → bound value.
    pub values: BTreeMap<String, AttrValue>,
    clauses: Vec<Vec<Clause>>,
}

impl TranslatedFilter {
    /// Evaluates the predicate against one stored item. A missing attribute
    /// fails its condition rather than erroring.
    pub fn matches(&self, item: &Item) -> bool {
        self.clauses.iter().any(|group| {
            group.iter().all(|clause| {
                let Some(value) = item.get(&clause.attr) else {
                    return false;
                };
                match &clause.test {
                    ClauseTest::Equals(expected) => values_equal(value, expected),
                    ClauseTest::Range(range) => range_matches(value, range),
                }
            })
        })
    }
}

/// Builds the backend filter for an ordered list of groups. Returns
/// `Ok(None)` when no group contributes a condition: an empty filter matches
/// everything and must not become an always-false clause.
///
/// Malformed input is rejected rather than ignored: an empty attribute name,
/// a range with no recognized bound, and binary values are all errors.
pub fn translate(groups: &[FilterGroup]) -> Result<Option<TranslatedFilter>> {
    let mut names: BTreeMap<String, String> = BTreeMap::new();
    let mut aliases: BTreeMap<String, String> = BTreeMap::new();
    let mut values: BTreeMap<String, AttrValue> = BTreeMap::new();
    let mut clauses: Vec<Vec<Clause>> = Vec::new();
    let mut rendered_groups: Vec<String> = Vec::new();

    for group in groups {
        let mut group_clauses: Vec<Clause> = Vec::new();
        let mut rendered: Vec<String> = Vec::new();

        for (attr, condition) in group {
            if attr.trim().is_empty() {
                return Err(StoreError::InvalidFilter(
                    "filter attribute name cannot be empty".into(),
                ));
            }
            let stored = remap_reserved(attr).to_string();
            let alias = aliases.entry(stored.clone()).or_insert_with(|| {
                let alias = format!("#f{}", names.len());
                names.insert(alias.clone(), stored.clone());
                alias
            });

            match condition {
                FilterCondition::Equals(value) => {
                    let value = comparable(attr, value)?;
                    let placeholder = bind(&mut values, value.clone());
                    rendered.push(format!("{alias} = {placeholder}"));
                    group_clauses.push(Clause {
                        attr: stored.clone(),
                        test: ClauseTest::Equals(value),
                    });
                }
                FilterCondition::Range(range) => {
                    if range.is_empty() {
                        return Err(StoreError::InvalidFilter(format!(
                            "range filter on '{attr}' has no recognized bound"
                        )));
                    }
                    let range = comparable_range(attr, range)?;
                    for (op, bound) in [
                        (">", &range.gt),
                        (">=", &range.gte),
                        ("<", &range.lt),
                        ("<=", &range.lte),
                    ] {
                        if let Some(bound) = bound {
                            let placeholder = bind(&mut values, bound.clone());
                            rendered.push(format!("{alias} {op} {placeholder}"));
                        }
                    }
                    group_clauses.push(Clause {
                        attr: stored.clone(),
                        test: ClauseTest::Range(range),
                    });
                }
            }
        }

        // A group that contributed nothing is dropped from the OR-list.
        if group_clauses.is_empty() {
            continue;
        }
        rendered_groups.push(format!("({})", rendered.join(" AND ")));
        clauses.push(group_clauses);
    }

    if clauses.is_empty() {
        return Ok(None);
    }

    Ok(Some(TranslatedFilter {
        expression: rendered_groups.join(" OR "),
        names,
        values,
        clauses,
    }))
}

fn bind(values: &mut BTreeMap<String, AttrValue>, value: AttrValue) -> String {
    let placeholder = format!(":v{}", values.len());
    values.insert(placeholder.clone(), value);
    placeholder
}

/// Booleans compare by canonical string form, since the backend has no
/// uniform boolean comparison; binary values are not filterable.
fn comparable(attr: &str, value: &AttrValue) -> Result<AttrValue> {
    match value {
        AttrValue::B(_) => Err(StoreError::InvalidFilter(format!(
            "binary value on '{attr}' is not filterable"
        ))),
        AttrValue::Bool(flag) => Ok(AttrValue::S(flag.to_string())),
        other => Ok(other.clone()),
    }
}

fn comparable_range(attr: &str, range: &RangeFilter) -> Result<RangeFilter> {
    let convert = |bound: &Option<AttrValue>| -> Result<Option<AttrValue>> {
        bound.as_ref().map(|value| comparable(attr, value)).transpose()
    };
    Ok(RangeFilter {
        gt: convert(&range.gt)?,
        gte: convert(&range.gte)?,
        lt: convert(&range.lt)?,
        lte: convert(&range.lte)?,
    })
}

fn values_equal(stored: &AttrValue, expected: &AttrValue) -> bool {
    match (stored, expected) {
        (AttrValue::N(lhs), AttrValue::N(rhs)) => lhs == rhs,
        (lhs, rhs) => lhs.canonical_string() == rhs.canonical_string(),
    }
}

fn compare(stored: &AttrValue, bound: &AttrValue) -> Ordering {
    match (stored, bound) {
        (AttrValue::N(lhs), AttrValue::N(rhs)) => {
            lhs.partial_cmp(rhs).unwrap_or(Ordering::Equal)
        }
        (lhs, rhs) => lhs.canonical_string().cmp(&rhs.canonical_string()),
    }
}

fn range_matches(stored: &AttrValue, range: &RangeFilter) -> bool {
    if let Some(bound) = &range.gt {
        if compare(stored, bound) != Ordering::Greater {
            return false;
        }
    }
    if let Some(bound) = &range.gte {
        if compare(stored, bound) == Ordering::Less {
            return false;
        }
    }
    if let Some(bound) = &range.lt {
        if compare(stored, bound) != Ordering::Less {
            return false;
        }
    }
    if let Some(bound) = &range.lte {
        if compare(stored, bound) == Ordering::Greater {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(pairs: &[(&str, AttrValue)]) -> Item {
        pairs
            .iter()
            .map(|(name, value)| (name.to_string(), value.clone()))
            .collect()
    }

    fn eq_group(attr: &str, value: AttrValue) -> FilterGroup {
        let mut group = FilterGroup::new();
        group.insert(attr.to_string(), FilterCondition::Equals(value));
        group
    }

    #[test]
    fn empty_filter_list_matches_everything() {
        assert!(translate(&[]).unwrap().is_none());
    }

    #[test]
    fn empty_groups_are_dropped_not_false() {
        let groups = vec![FilterGroup::new(), eq_group("kind", "note".into())];
        let filter = translate(&groups).unwrap().unwrap();
        assert_eq!(filter.expression, "(#f0 = :v0)");
        assert!(filter.matches(&item(&[("kind", "note".into())])));
    }

    #[test]
    fn range_bounds_are_half_open_as_specified() {
        let mut group = FilterGroup::new();
        group.insert(
            "x".into(),
            FilterCondition::Range(RangeFilter {
                gt: Some(AttrValue::N(5.0)),
                lte: Some(AttrValue::N(10.0)),
                ..RangeFilter::default()
            }),
        );
        let filter = translate(&[group]).unwrap().unwrap();
        assert!(!filter.matches(&item(&[("x", AttrValue::N(5.0))])));
        assert!(filter.matches(&item(&[("x", AttrValue::N(6.0))])));
        assert!(filter.matches(&item(&[("x", AttrValue::N(10.0))])));
        assert!(!filter.matches(&item(&[("x", AttrValue::N(10.5))])));
    }

    #[test]
    fn groups_are_ored() {
        let groups = vec![
            eq_group("kind", "note".into()),
            eq_group("kind", "article".into()),
        ];
        let filter = translate(&groups).unwrap().unwrap();
        assert!(filter.matches(&item(&[("kind", "note".into())])));
        assert!(filter.matches(&item(&[("kind", "article".into())])));
        assert!(!filter.matches(&item(&[("kind", "photo".into())])));
    }

    #[test]
    fn conditions_within_a_group_are_anded() {
        let mut group = FilterGroup::new();
        group.insert("kind".into(), FilterCondition::Equals("note".into()));
        group.insert("author".into(), FilterCondition::Equals("ada".into()));
        let filter = translate(&[group]).unwrap().unwrap();
        assert!(filter.matches(&item(&[
            ("kind", "note".into()),
            ("author", "ada".into()),
        ])));
        assert!(!filter.matches(&item(&[("kind", "note".into())])));
    }

    #[test]
    fn reserved_names_are_aliased_and_remapped() {
        let filter = translate(&[eq_group("name", "ada".into())])
            .unwrap()
            .unwrap();
        assert_eq!(filter.names.get("#f0").map(String::as_str), Some("attrName"));
        // The stored item carries the renamed attribute.
        assert!(filter.matches(&item(&[("attrName", "ada".into())])));
    }

    #[test]
    fn booleans_compare_by_canonical_string() {
        let filter = translate(&[eq_group("read", true.into())]).unwrap().unwrap();
        assert_eq!(
            filter.values.get(":v0"),
            Some(&AttrValue::S("true".into()))
        );
        assert!(filter.matches(&item(&[("read", AttrValue::S("true".into()))])));
        assert!(filter.matches(&item(&[("read", AttrValue::Bool(true))])));
        assert!(!filter.matches(&item(&[("read", AttrValue::Bool(false))])));
    }

    #[test]
    fn rejects_range_with_no_recognized_bound() {
        let mut group = FilterGroup::new();
        group.insert("x".into(), FilterCondition::Range(RangeFilter::default()));
        assert!(matches!(
            translate(&[group]),
            Err(StoreError::InvalidFilter(_))
        ));
    }

    #[test]
    fn rejects_empty_attribute_name() {
        assert!(matches!(
            translate(&[eq_group("  ", "x".into())]),
            Err(StoreError::InvalidFilter(_))
        ));
    }

    #[test]
    fn missing_attribute_fails_the_condition() {
        let filter = translate(&[eq_group("kind", "note".into())])
            .unwrap()
            .unwrap();
        assert!(!filter.matches(&item(&[])));
    }

    #[test]
    fn placeholders_do_not_collide_across_groups() {
        let mut range = FilterGroup::new();
        range.insert(
            "x".into(),
            FilterCondition::Range(RangeFilter {
                gte: Some(AttrValue::N(1.0)),
                lt: Some(AttrValue::N(9.0)),
                ..RangeFilter::default()
            }),
        );
        let groups = vec![eq_group("kind", "note".into()), range];
        let filter = translate(&groups).unwrap().unwrap();
        assert_eq!(filter.values.len(), 3);
        assert_eq!(filter.expression, "(#f0 = :v0) OR (#f1 >= :v1 AND #f1 < :v2)");
    }

    #[test]
    fn reserved_table_round_trips() {
        for (reserved, safe) in RESERVED_ATTRIBUTES {
            assert_eq!(remap_reserved(reserved), *safe);
            assert_eq!(restore_reserved(safe), *reserved);
        }
        assert_eq!(remap_reserved("plain"), "plain");
        assert_eq!(restore_reserved("plain"), "plain");
    }
}
