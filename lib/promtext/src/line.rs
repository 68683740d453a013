//! Parsing of a single exposition-format line.
//!
//! Only the label block needs real combinator machinery (quoted values can
//! contain escapes, separators, and arbitrary unicode); it is parsed with
//! nom and shared between sample lines and the standalone label-set entry
//! point. Everything around it — metric names, values, timestamps, `# TYPE`
//! headers — is whitespace-token based, leaning on the standard library's
//! float grammar (which already accepts `+Inf`, `-Inf`, and `NaN`).

use std::collections::BTreeMap;

use nom::{
    branch::alt,
    bytes::complete::{escaped_transform, is_not, take_while},
    character::complete::char,
    combinator::{map, opt, value},
    multi::separated_list0,
    sequence::{delimited, preceded, separated_pair, terminated},
};

type NomResult<'a, O> = nom::IResult<&'a str, O>;

#[derive(Debug, snafu::Snafu, PartialEq, Eq)]
pub enum ParseError {
    #[snafu(display("metric name must match [a-zA-Z_][a-zA-Z0-9_:]*, parsing: `{input}`"))]
    InvalidName { input: String },

    #[snafu(display("malformed label set, parsing: `{input}`"))]
    InvalidLabels { input: String },

    #[snafu(display("invalid sample value, parsing: `{input}`"))]
    InvalidValue { input: String },

    #[snafu(display("invalid timestamp, parsing: `{input}`"))]
    InvalidTimestamp { input: String },

    #[snafu(display("malformed `# TYPE` header, parsing: `{input}`"))]
    MalformedHeader { input: String },

    #[snafu(display("unknown metric kind `{kind}`"))]
    UnknownMetricKind { kind: String },

    #[snafu(display("unexpected trailing input: `{input}`"))]
    Trailing { input: String },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MetricKind {
    Counter,
    Gauge,
    Histogram,
    Summary,
    Untyped,
}

impl MetricKind {
    fn from_token(token: &str) -> Option<Self> {
        match token {
            "counter" => Some(Self::Counter),
            "gauge" => Some(Self::Gauge),
            "histogram" => Some(Self::Histogram),
            "summary" => Some(Self::Summary),
            "untyped" => Some(Self::Untyped),
            _ => None,
        }
    }
}

/// A `# TYPE <name> <kind>` header line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub metric_name: String,
    pub kind: MetricKind,
}

/// A sample line: `name[{labels}] value [timestamp]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub value: f64,
    pub timestamp: Option<i64>,
}

/// One line of the exposition format; comments and blank lines parse to
/// `None`.
#[derive(Debug, Clone, PartialEq)]
pub enum Line {
    Header(Header),
    Sample(Sample),
}

impl Line {
    pub fn parse(input: &str) -> Result<Option<Self>, ParseError> {
        let line = input.trim();
        if line.is_empty() {
            return Ok(None);
        }

        if let Some(comment) = line.strip_prefix('#') {
            // `# TYPE` is load-bearing; every other comment is noise.
            return match comment.trim_start().strip_prefix("TYPE") {
                Some(rest) => parse_header(rest).map(|header| Some(Line::Header(header))),
                None => Ok(None),
            };
        }

        parse_sample(line).map(|sample| Some(Line::Sample(sample)))
    }
}

/// Parses a complete `{name="value", …}` label set with nothing around it.
pub(crate) fn parse_label_set(input: &str) -> Result<BTreeMap<String, String>, ParseError> {
    let trimmed = input.trim();
    match label_block(trimmed) {
        Ok((rest, labels)) if rest.trim().is_empty() => Ok(labels),
        Ok((rest, _)) => Err(ParseError::Trailing {
            input: rest.to_owned(),
        }),
        Err(_) => Err(ParseError::InvalidLabels {
            input: trimmed.to_owned(),
        }),
    }
}

fn parse_sample(line: &str) -> Result<Sample, ParseError> {
    let (rest, name) = take_name(line)?;

    let rest = rest.trim_start_matches([' ', '\t']);
    let (rest, labels) = if rest.starts_with('{') {
        match label_block(rest) {
            Ok((rest, labels)) => (rest, labels),
            Err(_) => {
                return Err(ParseError::InvalidLabels {
                    input: rest.to_owned(),
                })
            }
        }
    } else {
        (rest, BTreeMap::new())
    };

    // Past the label block nothing can contain whitespace, so the remainder
    // splits into at most a value and a timestamp.
    let mut tokens = rest.split_ascii_whitespace();

    let value = match tokens.next() {
        Some(token) => token.parse::<f64>().map_err(|_| ParseError::InvalidValue {
            input: token.to_owned(),
        })?,
        None => {
            return Err(ParseError::InvalidValue {
                input: rest.trim().to_owned(),
            })
        }
    };

    let timestamp = tokens
        .next()
        .map(|token| {
            token.parse::<i64>().map_err(|_| ParseError::InvalidTimestamp {
                input: token.to_owned(),
            })
        })
        .transpose()?;

    if let Some(extra) = tokens.next() {
        return Err(ParseError::Trailing {
            input: extra.to_owned(),
        });
    }

    Ok(Sample {
        name,
        labels,
        value,
        timestamp,
    })
}

/// Parses the remainder of a `# TYPE <name> <kind>` header (everything after
/// the `TYPE` token).
fn parse_header(input: &str) -> Result<Header, ParseError> {
    let mut tokens = input.split_ascii_whitespace();

    let name_token = tokens.next().ok_or_else(|| ParseError::MalformedHeader {
        input: input.to_owned(),
    })?;
    let (rest, metric_name) = take_name(name_token)?;
    if !rest.is_empty() {
        return Err(ParseError::InvalidName {
            input: name_token.to_owned(),
        });
    }

    let kind_token = tokens.next().ok_or_else(|| ParseError::MalformedHeader {
        input: input.to_owned(),
    })?;
    let kind =
        MetricKind::from_token(kind_token).ok_or_else(|| ParseError::UnknownMetricKind {
            kind: kind_token.to_owned(),
        })?;

    if let Some(extra) = tokens.next() {
        return Err(ParseError::Trailing {
            input: extra.to_owned(),
        });
    }

    Ok(Header { metric_name, kind })
}

/// Length in bytes of the leading `[a-zA-Z_][a-zA-Z0-9_:]*` run.
fn name_len(input: &str) -> usize {
    let mut len = 0;
    for (index, c) in input.char_indices() {
        let valid = if index == 0 {
            c.is_alphabetic() || c == '_'
        } else {
            c.is_alphanumeric() || c == '_' || c == ':'
        };
        if !valid {
            break;
        }
        len = index + c.len_utf8();
    }
    len
}

fn take_name(input: &str) -> Result<(&str, String), ParseError> {
    match name_len(input) {
        0 => Err(ParseError::InvalidName {
            input: input.to_owned(),
        }),
        len => Ok((&input[len..], input[..len].to_owned())),
    }
}

/// `{name="value", …}` with optional blanks around every token and a
/// tolerated trailing comma.
fn label_block(input: &str) -> NomResult<BTreeMap<String, String>> {
    map(
        delimited(
            sp(char('{')),
            terminated(
                separated_list0(sp(char(',')), label_pair),
                opt(sp(char(','))),
            ),
            sp(char('}')),
        ),
        |pairs| pairs.into_iter().collect(),
    )(input)
}

fn label_pair(input: &str) -> NomResult<(String, String)> {
    separated_pair(sp(label_name), sp(char('=')), sp(quoted_string))(input)
}

fn label_name(input: &str) -> NomResult<String> {
    match name_len(input) {
        0 => Err(nom::Err::Error(nom::error::Error::new(
            input,
            nom::error::ErrorKind::Alpha,
        ))),
        len => Ok((&input[len..], input[..len].to_owned())),
    }
}

/// `'"' content '"'`, unescaping `\\`, `\"`, and `\n`.
fn quoted_string(input: &str) -> NomResult<String> {
    delimited(
        char('"'),
        map(
            opt(escaped_transform(
                is_not("\"\\"),
                '\\',
                alt((
                    value('\\', char('\\')),
                    value('"', char('"')),
                    value('\n', char('n')),
                )),
            )),
            |content: Option<String>| content.unwrap_or_default(),
        ),
        char('"'),
    )(input)
}

/// Skips blanks, then applies `inner`.
fn sp<'a, O, F>(inner: F) -> impl FnMut(&'a str) -> NomResult<'a, O>
where
    F: FnMut(&'a str) -> NomResult<'a, O>,
{
    preceded(take_while(|c| c == ' ' || c == '\t'), inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn parses_minimal_sample() {
        let line = Line::parse("metric_without_labels 12.47").unwrap().unwrap();
        assert_eq!(
            line,
            Line::Sample(Sample {
                name: "metric_without_labels".into(),
                labels: BTreeMap::new(),
                value: 12.47,
                timestamp: None,
            })
        );
    }

    #[test]
    fn parses_sample_with_labels_and_timestamp() {
        let line = Line::parse(
            r#"http_requests_total{method="post",code="200"} 1027 1395066363000"#,
        )
        .unwrap()
        .unwrap();
        assert_eq!(
            line,
            Line::Sample(Sample {
                name: "http_requests_total".into(),
                labels: labels(&[("method", "post"), ("code", "200")]),
                value: 1027.0,
                timestamp: Some(1395066363000),
            })
        );
    }

    #[test]
    fn names_may_contain_colons() {
        let line = Line::parse("consul_serf:events 1").unwrap().unwrap();
        let Line::Sample(sample) = line else {
            panic!("expected a sample")
        };
        assert_eq!(sample.name, "consul_serf:events");
    }

    #[test]
    fn parses_escaped_label_values() {
        let line = Line::parse(
            r#"msdos_file_access_time_seconds{path="C:\\DIR\\FILE.TXT",error="Cannot find file:\n\"FILE.TXT\""} 1.458255915e9"#,
        )
        .unwrap()
        .unwrap();
        let Line::Sample(sample) = line else {
            panic!("expected a sample")
        };
        assert_eq!(sample.labels["path"], "C:\\DIR\\FILE.TXT");
        assert_eq!(sample.labels["error"], "Cannot find file:\n\"FILE.TXT\"");
    }

    #[test]
    fn label_values_may_hold_separators_and_unicode() {
        let line = Line::parse(r#"m{ a = "}," , b = "a=b" , c = " 😂 " } 1"#)
            .unwrap()
            .unwrap();
        let Line::Sample(sample) = line else {
            panic!("expected a sample")
        };
        assert_eq!(
            sample.labels,
            labels(&[("a", "},"), ("b", "a=b"), ("c", " 😂 ")])
        );
    }

    #[test]
    fn parses_special_values() {
        for (text, check) in [
            ("+Inf", f64::is_infinite as fn(f64) -> bool),
            ("-Inf", f64::is_infinite),
            ("NaN", f64::is_nan),
        ] {
            let line = Line::parse(&format!("weird {text}")).unwrap().unwrap();
            let Line::Sample(sample) = line else {
                panic!("expected a sample")
            };
            assert!(check(sample.value));
        }
    }

    #[test]
    fn negative_timestamps_are_allowed() {
        let line = Line::parse(r#"something_weird{problem="division by zero"} +Inf -3982045"#)
            .unwrap()
            .unwrap();
        let Line::Sample(sample) = line else {
            panic!("expected a sample")
        };
        assert_eq!(sample.timestamp, Some(-3982045));
    }

    #[test]
    fn parses_type_headers() {
        let line = Line::parse("# TYPE http_requests_total counter")
            .unwrap()
            .unwrap();
        assert_eq!(
            line,
            Line::Header(Header {
                metric_name: "http_requests_total".into(),
                kind: MetricKind::Counter,
            })
        );

        let line = Line::parse("#TYPE \t latency \t histogram").unwrap().unwrap();
        assert_eq!(
            line,
            Line::Header(Header {
                metric_name: "latency".into(),
                kind: MetricKind::Histogram,
            })
        );
    }

    #[test]
    fn comments_and_blanks_are_skipped() {
        assert_eq!(Line::parse("").unwrap(), None);
        assert_eq!(Line::parse("   ").unwrap(), None);
        assert_eq!(
            Line::parse("# HELP http_requests_total Total requests.").unwrap(),
            None
        );
        assert_eq!(Line::parse("# random chatter").unwrap(), None);
    }

    #[test]
    fn broken_lines_are_errors() {
        // Missing separator between label pairs.
        assert!(matches!(
            Line::parse(r#"name{registry="default" content_type="html"} 1890"#).unwrap_err(),
            ParseError::InvalidLabels { .. }
        ));

        // Unquoted label value.
        assert!(matches!(
            Line::parse(r#"name{registry=default} 1890"#).unwrap_err(),
            ParseError::InvalidLabels { .. }
        ));

        // Unterminated label value.
        assert!(matches!(
            Line::parse(r#"name{registry="} 1890"#).unwrap_err(),
            ParseError::InvalidLabels { .. }
        ));

        // Doubled separator.
        assert!(matches!(
            Line::parse(r#"name{ a="b" ,, c="d" } 1"#).unwrap_err(),
            ParseError::InvalidLabels { .. }
        ));

        // Value is not a float.
        assert!(matches!(
            Line::parse("name abcd").unwrap_err(),
            ParseError::InvalidValue { .. }
        ));

        // Missing value.
        assert!(matches!(
            Line::parse("name").unwrap_err(),
            ParseError::InvalidValue { .. }
        ));

        // Names cannot start with a digit.
        assert!(matches!(
            Line::parse("99problems 1").unwrap_err(),
            ParseError::InvalidName { .. }
        ));

        // A TYPE header with an unknown kind.
        assert!(matches!(
            Line::parse("# TYPE a counte").unwrap_err(),
            ParseError::UnknownMetricKind { .. }
        ));

        // A TYPE header missing its kind.
        assert!(matches!(
            Line::parse("# TYPE a").unwrap_err(),
            ParseError::MalformedHeader { .. }
        ));

        // Junk after the timestamp.
        assert!(matches!(
            Line::parse("up 1 1000 huh").unwrap_err(),
            ParseError::Trailing { .. }
        ));
    }

    #[test]
    fn trailing_comma_is_tolerated() {
        let line = Line::parse(r#"m{name="value",} 1"#).unwrap().unwrap();
        let Line::Sample(sample) = line else {
            panic!("expected a sample")
        };
        assert_eq!(sample.labels, labels(&[("name", "value")]));
    }

    #[test]
    fn empty_label_values_are_kept() {
        let line = Line::parse(r#"m{name=""} 1"#).unwrap().unwrap();
        let Line::Sample(sample) = line else {
            panic!("expected a sample")
        };
        assert_eq!(sample.labels["name"], "");
    }
}
