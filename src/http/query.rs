//! Reverse proxy for the query API.
//!
//! The proxy stores nothing it can answer queries from; `/api/v1/query`,
//! `/query_range`, `/series`, `/labels`, and `/label/<name>/values` are
//! forwarded verbatim to the configured query backend. With querying
//! disabled the routes answer 404.

use std::sync::Arc;

use bytes::Bytes;
use tracing::error;
use warp::http::StatusCode;
use warp::path::Tail;
use warp::{Rejection, Reply};

use super::{ApiContext, ApiError};

/// Paths under `/api/v1/` that are forwarded.
fn is_query_path(tail: &str) -> bool {
    matches!(tail, "query" | "query_range" | "series" | "labels")
        || (tail.strip_prefix("label/")
            .is_some_and(|rest| rest.ends_with("/values") && !rest.starts_with('/')))
}

pub(crate) async fn serve_proxy(
    method: warp::http::Method,
    tail: Tail,
    raw_query: Option<String>,
    content_type: Option<String>,
    body: Bytes,
    ctx: Arc<ApiContext>,
) -> Result<impl Reply, Rejection> {
    if !is_query_path(tail.as_str()) {
        return Err(warp::reject::not_found());
    }
    if !ctx.query_enable {
        return Ok(warp::http::Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Bytes::from_static(b"Not Found"))
            .expect("static response builds"));
    }

    let mut url = format!("http://{}/api/v1/{}", ctx.query_addr, tail.as_str());
    if let Some(query) = &raw_query {
        url.push('?');
        url.push_str(query);
    }

    let mut request = ctx.proxy_client.request(method, &url).body(body);
    if let Some(content_type) = content_type {
        request = request.header(http::header::CONTENT_TYPE, content_type);
    }

    let response = match request.send().await {
        Ok(response) => response,
        Err(error) => {
            error!(%error, url = %url, "query proxy request failed");
            return Err(warp::reject::custom(ApiError::Internal(error.to_string())));
        }
    };

    let status = response.status();
    let content_type = response
        .headers()
        .get(http::header::CONTENT_TYPE)
        .cloned();
    let body = response.bytes().await.unwrap_or_default();

    let mut reply = warp::http::Response::builder().status(status);
    if let Some(content_type) = content_type {
        reply = reply.header(http::header::CONTENT_TYPE, content_type);
    }
    Ok(reply.body(body).expect("proxied response builds"))
}
