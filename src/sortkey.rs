//! Composite sort keys: the canonical string form of a sort attribute joined
//! to the record's content identifier. Records sharing a sort value order by
//! content id ascending, so every index carries a strict total order and
//! cursors never straddle a tie.

use crate::backend::AttrValue;

/// Unit separator between the sort value and the content id. Content ids are
/// lowercase hex, so the separator cannot occur inside them and the
/// composite parses unambiguously.
pub const SORT_KEY_SEP: char = '\u{1F}';

/// Builds the derived composite key stored alongside the source attribute.
/// Callers skip records lacking the source attribute; absence simply leaves
/// the record out of that index.
pub fn compose(sort_value: &AttrValue, content_id: &str) -> String {
    format!("{}{SORT_KEY_SEP}{content_id}", sort_value.canonical_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_values_tie_break_by_content_id() {
        let value = AttrValue::S("2024-01-01".into());
        let a = compose(&value, "aaa");
        let b = compose(&value, "bbb");
        assert!(a < b);
    }

    #[test]
    fn different_values_order_by_value() {
        let early = compose(&AttrValue::S("2024-01-01".into()), "zzz");
        let late = compose(&AttrValue::S("2024-01-02".into()), "aaa");
        assert!(early < late);
    }

    #[test]
    fn numbers_compose_their_canonical_form() {
        assert_eq!(
            compose(&AttrValue::N(42.0), "abc"),
            format!("42{SORT_KEY_SEP}abc")
        );
    }
}
