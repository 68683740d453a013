//! Push-gateway ingest.
//!
//! `PUT|POST /metrics/job/<job>/<label-path>` accepts a metric-family body —
//! text exposition format, or delimited `io.prometheus.client.MetricFamily`
//! protobuf selected by Content-Type — augments every series with the
//! URL-derived group labels, re-encodes the batch as a remote-write request,
//! and pushes it to the queue. `DELETE` on the same paths is a documented
//! no-op.
//!
//! Label-path grammar: `/k1/v1/k2/v2/…`; an odd component count is a 400. A
//! name suffixed `@base64` marks its value as URL-safe base64 (padding
//! optional); `job@base64` in the route plays the same role for the job
//! name. Reserved (`__`-prefixed) and malformed label names are rejected.

use std::collections::BTreeMap;
use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use bytes::{Buf, Bytes};
use metrics::counter;
use percent_encoding::percent_decode_str;
use prost::Message;
use tracing::{error, warn};
use warp::http::StatusCode;
use warp::path::Tail;
use warp::{Filter, Rejection, Reply};

use super::{sized_body, with_ctx, ApiContext, ApiError};
use crate::labels::{self, RESERVED_LABEL_PREFIX};
use crate::proto::client::{self, MetricType};
use crate::proto::remote::{Sample, TimeSeries, WriteRequest};

const BASE64_SUFFIX: &str = "@base64";

const PROTOBUF_CONTENT_TYPE: &str = "application/vnd.google.protobuf";

/// A parsed sample before repackaging: labels (including `__name__`), value,
/// optional timestamp.
type ParsedSeries = (BTreeMap<String, String>, f64, Option<i64>);

/// Push and delete routes for both plain and base64-encoded job names.
pub(crate) fn routes(
    ctx: Arc<ApiContext>,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    let push = push_route(Arc::clone(&ctx), "job", false)
        .or(push_route(Arc::clone(&ctx), "job@base64", true))
        .unify();

    let delete = delete_route(Arc::clone(&ctx), "job")
        .or(delete_route(ctx, "job@base64"))
        .unify();

    push.or(delete)
}

fn push_route(
    ctx: Arc<ApiContext>,
    job_segment: &'static str,
    job_base64: bool,
) -> impl Filter<Extract = (warp::reply::WithStatus<String>,), Error = Rejection> + Clone {
    warp::path("metrics")
        .and(warp::path(job_segment))
        .and(warp::put().or(warp::post()).unify())
        .and(super::auth::required(Arc::clone(&ctx)))
        .and(warp::path::param::<String>())
        .and(warp::path::tail())
        .and(admission(Arc::clone(&ctx)))
        .and(warp::header::optional::<String>("content-type"))
        .and(sized_body(Arc::clone(&ctx)))
        .and(with_ctx(ctx))
        .and_then(move |job, tail, content_type, body, ctx| {
            serve_push(job, tail, content_type, body, ctx, job_base64)
        })
}

/// Pre-body admission: the push surface must be enabled, and a rate-limit
/// token is taken before the request body is read or size-checked.
fn admission(ctx: Arc<ApiContext>) -> impl Filter<Extract = (), Error = Rejection> + Clone {
    with_ctx(ctx)
        .and_then(|ctx: Arc<ApiContext>| async move {
            if !ctx.push_gateway_enable {
                return Err(warp::reject::custom(ApiError::Internal(
                    "pushGateway mode not enabled".to_owned(),
                )));
            }
            ctx.take().await;
            Ok(())
        })
        .untuple_one()
}

fn delete_route(
    ctx: Arc<ApiContext>,
    job_segment: &'static str,
) -> impl Filter<Extract = (warp::reply::WithStatus<String>,), Error = Rejection> + Clone {
    warp::path("metrics")
        .and(warp::path(job_segment))
        .and(warp::delete())
        .and(super::auth::required(ctx))
        .and(warp::path::param::<String>())
        .and(warp::path::tail())
        .and_then(|_job: String, _tail: Tail| async {
            // Deletion has no backing store here; acknowledged as a no-op.
            Ok::<_, Rejection>(warp::reply::with_status(String::new(), StatusCode::OK))
        })
}

async fn serve_push(
    job: String,
    tail: Tail,
    content_type: Option<String>,
    body: Bytes,
    ctx: Arc<ApiContext>,
    job_base64: bool,
) -> Result<warp::reply::WithStatus<String>, Rejection> {
    let job = percent_decode_str(&job)
        .decode_utf8()
        .map_err(|error| bad_request(format!("invalid job name encoding: {error}")))?
        .into_owned();
    let job = if job_base64 {
        decode_base64(&job)
            .map_err(|error| bad_request(format!("invalid base64 encoding in job name {job:?}: {error}")))?
    } else {
        job
    };
    if job.is_empty() {
        return Err(bad_request("job name is required".to_owned()));
    }

    let mut group_labels = split_labels(tail.as_str()).map_err(bad_request)?;
    group_labels.insert("job".to_owned(), job);

    let series = if is_delimited_protobuf(content_type.as_deref()) {
        families_to_series(&body).map_err(bad_request)?
    } else {
        // Anything else is treated as the text format, version 0.0.4.
        let text = std::str::from_utf8(&body)
            .map_err(|error| bad_request(format!("body is not valid UTF-8: {error}")))?;
        text_to_series(text).map_err(bad_request)?
    };

    let request = repackage(&group_labels, series);
    let encoded = request.encode_to_vec();
    let compressed = snap::raw::Encoder::new()
        .compress_vec(&encoded)
        .map_err(|error| {
            error!(%error, "failed to compress push payload");
            warp::reject::custom(ApiError::Internal(error.to_string()))
        })?;

    match ctx.queue.push(Bytes::from(compressed)).await {
        Ok(()) => {
            counter!("ingest_requests_total", "handler" => "push", "status" => "ok").increment(1);
            Ok(warp::reply::with_status(
                String::new(),
                StatusCode::ACCEPTED,
            ))
        }
        Err(error) => {
            counter!("ingest_requests_total", "handler" => "push", "status" => "error")
                .increment(1);
            error!(%error, "queue push failed");
            Err(warp::reject::custom(ApiError::Internal(error.to_string())))
        }
    }
}

fn bad_request(message: String) -> Rejection {
    warn!(message = %message, "rejecting push request");
    warp::reject::custom(ApiError::BadRequest(message))
}

fn is_delimited_protobuf(content_type: Option<&str>) -> bool {
    let Some(content_type) = content_type else {
        return false;
    };
    let mut parts = content_type.split(';');
    let media_type = parts.next().unwrap_or_default().trim();
    if media_type != PROTOBUF_CONTENT_TYPE {
        return false;
    }

    let mut delimited = false;
    let mut family_proto = false;
    for param in parts {
        match param.trim().split_once('=') {
            Some(("encoding", value)) => delimited = value.trim() == "delimited",
            Some(("proto", value)) => {
                family_proto = value.trim() == "io.prometheus.client.MetricFamily"
            }
            _ => {}
        }
    }
    delimited && family_proto
}

/// Decodes RFC 4648 URL-safe base64, ignoring trailing padding.
fn decode_base64(input: &str) -> Result<String, String> {
    let bytes = URL_SAFE_NO_PAD
        .decode(input.trim_end_matches('='))
        .map_err(|error| error.to_string())?;
    String::from_utf8(bytes).map_err(|error| error.to_string())
}

/// Splits a `/k1/v1/k2/v2` label path into a map, decoding `@base64` values.
fn split_labels(path: &str) -> Result<BTreeMap<String, String>, String> {
    let mut result = BTreeMap::new();
    let path = path.trim_matches('/');
    if path.is_empty() {
        return Ok(result);
    }

    let components: Vec<&str> = path.split('/').collect();
    if components.len() % 2 != 0 {
        return Err(format!("odd number of components in label string {path:?}"));
    }

    for pair in components.chunks(2) {
        let name = percent_decode_str(pair[0])
            .decode_utf8()
            .map_err(|error| format!("invalid label name encoding: {error}"))?
            .into_owned();
        let value = percent_decode_str(pair[1])
            .decode_utf8()
            .map_err(|error| format!("invalid label value encoding: {error}"))?
            .into_owned();

        let trimmed = name.strip_suffix(BASE64_SUFFIX).unwrap_or(&name);
        if !labels::is_valid_label_name(trimmed) || trimmed.starts_with(RESERVED_LABEL_PREFIX) {
            return Err(format!("improper label name {trimmed:?}"));
        }

        if name.len() == trimmed.len() {
            result.insert(name, value);
        } else {
            let decoded = decode_base64(&value).map_err(|error| {
                format!("invalid base64 encoding for label {trimmed}={value:?}: {error}")
            })?;
            result.insert(trimmed.to_owned(), decoded);
        }
    }
    Ok(result)
}

/// Parses a text-format body into one series per sample line.
fn text_to_series(body: &str) -> Result<Vec<ParsedSeries>, String> {
    let mut series = Vec::new();
    for raw in body.lines() {
        match promtext::Line::parse(raw).map_err(|error| error.to_string())? {
            None | Some(promtext::Line::Header(_)) => continue,
            Some(promtext::Line::Sample(sample)) => {
                let mut labels = sample.labels;
                labels.insert(promtext::METRIC_NAME_LABEL.to_owned(), sample.name);
                series.push((labels, sample.value, sample.timestamp));
            }
        }
    }
    Ok(series)
}

/// Decodes a stream of length-delimited `MetricFamily` messages into series,
/// expanding summaries and histograms into their component series the same
/// way the text encoding would.
fn families_to_series(body: &[u8]) -> Result<Vec<ParsedSeries>, String> {
    let mut buf = body;
    let mut series = Vec::new();

    while buf.has_remaining() {
        let family =
            client::MetricFamily::decode_length_delimited(&mut buf).map_err(|e| e.to_string())?;
        let name = family.name().to_owned();
        if name.is_empty() {
            return Err("metric family without a name".to_owned());
        }
        let kind = family.r#type();

        for metric in &family.metric {
            let mut base = BTreeMap::new();
            for pair in &metric.label {
                base.insert(pair.name().to_owned(), pair.value().to_owned());
            }
            let timestamp = metric.timestamp_ms;

            let mut push = |suffix: &str, extra: Option<(&str, String)>, value: f64| {
                let mut labels = base.clone();
                if let Some((extra_name, extra_value)) = extra {
                    labels.insert(extra_name.to_owned(), extra_value);
                }
                labels.insert(
                    promtext::METRIC_NAME_LABEL.to_owned(),
                    format!("{name}{suffix}"),
                );
                series.push((labels, value, timestamp));
            };

            match kind {
                MetricType::Counter => {
                    if let Some(counter) = &metric.counter {
                        push("", None, counter.value());
                    }
                }
                MetricType::Gauge => {
                    if let Some(gauge) = &metric.gauge {
                        push("", None, gauge.value());
                    }
                }
                MetricType::Untyped => {
                    if let Some(untyped) = &metric.untyped {
                        push("", None, untyped.value());
                    }
                }
                MetricType::Summary => {
                    if let Some(summary) = &metric.summary {
                        for quantile in &summary.quantile {
                            push(
                                "",
                                Some(("quantile", format_float_label(quantile.quantile()))),
                                quantile.value(),
                            );
                        }
                        push("_sum", None, summary.sample_sum());
                        push("_count", None, summary.sample_count() as f64);
                    }
                }
                MetricType::Histogram => {
                    if let Some(histogram) = &metric.histogram {
                        for bucket in &histogram.bucket {
                            push(
                                "_bucket",
                                Some(("le", format_float_label(bucket.upper_bound()))),
                                bucket.cumulative_count() as f64,
                            );
                        }
                        push("_sum", None, histogram.sample_sum());
                        push("_count", None, histogram.sample_count() as f64);
                    }
                }
            }
        }
    }

    Ok(series)
}

fn format_float_label(value: f64) -> String {
    if value == f64::INFINITY {
        "+Inf".to_owned()
    } else if value == f64::NEG_INFINITY {
        "-Inf".to_owned()
    } else {
        format!("{value}")
    }
}

/// Builds the remote-write request: group labels override per-sample labels,
/// samples without a timestamp are stamped with the ingestion time.
fn repackage(group_labels: &BTreeMap<String, String>, series: Vec<ParsedSeries>) -> WriteRequest {
    let now_ms = chrono::Utc::now().timestamp_millis();

    let timeseries = series
        .into_iter()
        .map(|(mut labels, value, timestamp)| {
            for (name, val) in group_labels {
                labels.insert(name.clone(), val.clone());
            }
            TimeSeries {
                labels: labels::wire_labels(&labels),
                samples: vec![Sample {
                    value,
                    timestamp: timestamp.unwrap_or(now_ms),
                }],
            }
        })
        .collect();

    WriteRequest { timeseries }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_path_grammar() {
        let parsed = split_labels("instance/10.0.0.1:9100/zone/eu-1").unwrap();
        assert_eq!(parsed["instance"], "10.0.0.1:9100");
        assert_eq!(parsed["zone"], "eu-1");

        assert!(split_labels("").unwrap().is_empty());
        assert!(split_labels("stray").is_err());
        assert!(split_labels("a/1/b").is_err());
        assert!(split_labels("__reserved/x").is_err());
        assert!(split_labels("not.a.name/x").is_err());
    }

    #[test]
    fn base64_label_values_are_decoded() {
        // "MTI3LjAuMC4xOjgw" decodes to "127.0.0.1:80"; padding is optional.
        let parsed = split_labels("instance@base64/MTI3LjAuMC4xOjgw").unwrap();
        assert_eq!(parsed["instance"], "127.0.0.1:80");

        let parsed = split_labels("instance@base64/MTI3LjAuMC4xOjgw==").unwrap();
        assert_eq!(parsed["instance"], "127.0.0.1:80");

        assert!(split_labels("instance@base64/!!!!").is_err());
    }

    #[test]
    fn content_type_detection() {
        assert!(is_delimited_protobuf(Some(
            "application/vnd.google.protobuf; proto=io.prometheus.client.MetricFamily; encoding=delimited"
        )));
        assert!(!is_delimited_protobuf(Some("text/plain; version=0.0.4")));
        assert!(!is_delimited_protobuf(Some(
            "application/vnd.google.protobuf; encoding=delimited"
        )));
        assert!(!is_delimited_protobuf(None));
    }

    #[test]
    fn text_body_becomes_series_with_group_labels() {
        let series = text_to_series("# TYPE metric_a untyped\nmetric_a 42\n").unwrap();
        assert_eq!(series.len(), 1);

        let mut group = BTreeMap::new();
        group.insert("job".to_owned(), "demo".to_owned());
        group.insert("instance".to_owned(), "127.0.0.1:80".to_owned());

        let request = repackage(&group, series);
        assert_eq!(request.timeseries.len(), 1);

        let labels = labels::label_map(&request.timeseries[0].labels);
        assert_eq!(labels["__name__"], "metric_a");
        assert_eq!(labels["job"], "demo");
        assert_eq!(labels["instance"], "127.0.0.1:80");
        assert_eq!(request.timeseries[0].samples[0].value, 42.0);
        assert!(request.timeseries[0].samples[0].timestamp > 0);
    }

    #[test]
    fn malformed_text_is_an_error() {
        assert!(text_to_series("metric_a forty-two\n").is_err());
    }

    #[test]
    fn histogram_families_expand_into_component_series() {
        let family = client::MetricFamily {
            name: Some("latency".to_owned()),
            help: None,
            r#type: Some(MetricType::Histogram as i32),
            metric: vec![client::Metric {
                label: vec![],
                gauge: None,
                counter: None,
                summary: None,
                untyped: None,
                histogram: Some(client::Histogram {
                    sample_count: Some(10),
                    sample_sum: Some(1.5),
                    bucket: vec![
                        client::Bucket {
                            cumulative_count: Some(7),
                            upper_bound: Some(0.1),
                        },
                        client::Bucket {
                            cumulative_count: Some(10),
                            upper_bound: Some(f64::INFINITY),
                        },
                    ],
                }),
                timestamp_ms: None,
            }],
        };

        let mut body = Vec::new();
        family.encode_length_delimited(&mut body).unwrap();

        let series = families_to_series(&body).unwrap();
        let names: Vec<&str> = series
            .iter()
            .map(|(labels, _, _)| labels["__name__"].as_str())
            .collect();
        assert_eq!(
            names,
            vec!["latency_bucket", "latency_bucket", "latency_sum", "latency_count"]
        );
        assert_eq!(series[0].0["le"], "0.1");
        assert_eq!(series[1].0["le"], "+Inf");
        assert_eq!(series[3].1, 10.0);
    }
}
