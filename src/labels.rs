//! Canonical label-set handling.
//!
//! The canonical textual form `{k1="v1", k2="v2"}` (keys sorted
//! lexicographically) is the partition key and the cardinality-filter key.
//! It is deterministic for a given label set, which is what makes shard
//! assignment stable across processes.

use std::collections::BTreeMap;

use crate::proto::remote::Label;

/// Label name prefix reserved for internal use (`__name__` and friends).
pub const RESERVED_LABEL_PREFIX: &str = "__";

/// Builds the canonical string form of a label set.
pub fn canonical_string(labels: &BTreeMap<String, String>) -> String {
    let mut out = String::with_capacity(2 + labels.len() * 16);
    out.push('{');
    for (i, (name, value)) in labels.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        out.push_str(name);
        out.push_str("=\"");
        out.push_str(value);
        out.push('"');
    }
    out.push('}');
    out
}

/// Collapses wire labels into a map; a duplicated name keeps the last value.
pub fn label_map(labels: &[Label]) -> BTreeMap<String, String> {
    labels
        .iter()
        .map(|label| (label.name.clone(), label.value.clone()))
        .collect()
}

/// Expands a label map back into wire labels, in canonical (sorted) order.
pub fn wire_labels(labels: &BTreeMap<String, String>) -> Vec<Label> {
    labels
        .iter()
        .map(|(name, value)| Label {
            name: name.clone(),
            value: value.clone(),
        })
        .collect()
}

/// 64-bit fingerprint of a canonical label-set string.
///
/// Seahash is stable across processes and architectures, which the shard
/// mapping relies on.
pub fn fingerprint(canonical: &str) -> u64 {
    seahash::hash(canonical.as_bytes())
}

/// Checks a label name against `[a-zA-Z_][a-zA-Z0-9_]*`.
pub fn is_valid_label_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn canonical_form_is_sorted_and_stable() {
        let a = map(&[("job", "node"), ("__name__", "up"), ("zone", "a")]);
        assert_eq!(
            canonical_string(&a),
            r#"{__name__="up", job="node", zone="a"}"#
        );

        // Insertion order cannot influence a BTreeMap, but the wire form can
        // arrive in any order; the canonical string must not change.
        let shuffled = label_map(&[
            Label {
                name: "zone".into(),
                value: "a".into(),
            },
            Label {
                name: "job".into(),
                value: "node".into(),
            },
            Label {
                name: "__name__".into(),
                value: "up".into(),
            },
        ]);
        assert_eq!(canonical_string(&a), canonical_string(&shuffled));
        assert_eq!(
            fingerprint(&canonical_string(&a)),
            fingerprint(&canonical_string(&shuffled))
        );
    }

    #[test]
    fn empty_set_canonicalizes_to_braces() {
        assert_eq!(canonical_string(&BTreeMap::new()), "{}");
    }

    #[test]
    fn wire_roundtrip_sorts_labels() {
        let labels = map(&[("b", "2"), ("a", "1")]);
        let wire = wire_labels(&labels);
        assert_eq!(wire[0].name, "a");
        assert_eq!(wire[1].name, "b");
        assert_eq!(label_map(&wire), labels);
    }

    #[test]
    fn label_name_validation() {
        assert!(is_valid_label_name("job"));
        assert!(is_valid_label_name("_hidden"));
        assert!(is_valid_label_name("name_2"));
        assert!(!is_valid_label_name(""));
        assert!(!is_valid_label_name("2fast"));
        assert!(!is_valid_label_name("dotted.name"));
    }
}
