//! Line-level parser for the Prometheus text exposition format (v0.0.4).
//!
//! The push-gateway ingest path re-emits every sample line as its own time
//! series, so the unit of parsing here is a single line: `# TYPE` headers are
//! recognized (and can be used to skip or classify), other comments and blank
//! lines are discarded, and sample lines yield their name, label set, value,
//! and optional timestamp.
//!
//! The label-set sub-parser is also exposed on its own via
//! [`parse_label_set`], since the canonical `{k="v", …}` form doubles as the
//! shard and filter key elsewhere and shares the same grammar.

use std::collections::BTreeMap;

mod line;

pub use line::{Header, Line, MetricKind, ParseError, Sample};

/// The reserved label carrying the metric name.
pub const METRIC_NAME_LABEL: &str = "__name__";

/// Parses a full `{name="value", …}` label set, requiring the braces and
/// rejecting trailing input.
pub fn parse_label_set(input: &str) -> Result<BTreeMap<String, String>, ParseError> {
    line::parse_label_set(input)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_set_roundtrip() {
        let labels = parse_label_set(r#"{__name__="up", job="node", region="eu-1"}"#).unwrap();
        assert_eq!(labels.len(), 3);
        assert_eq!(labels["__name__"], "up");
        assert_eq!(labels["job"], "node");
        assert_eq!(labels["region"], "eu-1");
    }

    #[test]
    fn empty_label_set() {
        assert!(parse_label_set("{}").unwrap().is_empty());
    }

    #[test]
    fn label_set_rejects_garbage() {
        assert!(parse_label_set("up 1").is_err());
        assert!(parse_label_set(r#"{a="b"} trailing"#).is_err());
        assert!(parse_label_set(r#"{a=b}"#).is_err());
        assert!(parse_label_set("").is_err());
    }
}
