//! The HTTP ingress surface.
//!
//! One listener carries every route: remote-write ingest, the push-gateway
//! paths, the query reverse proxy, and this process's own metrics
//! exposition. Authentication (when enabled) applies to everything except
//! `GET /metrics`, mirroring the middleware ordering of the exposition
//! endpoint being installed first.

mod auth;
mod push;
mod query;

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use metrics::counter;
use metrics_exporter_prometheus::PrometheusHandle;
use snafu::{ResultExt, Snafu};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use warp::http::StatusCode;
use warp::{Filter, Rejection, Reply};

use crate::config::{ApiConfig, AuthConfig};
use crate::queue::Queue;

#[derive(Debug, Snafu)]
pub enum ServerError {
    #[snafu(display("invalid listen address {listen:?}: {source}"))]
    Listen {
        listen: String,
        source: std::net::AddrParseError,
    },

    #[snafu(display("unable to bind {addr}: {source}"))]
    Bind { addr: SocketAddr, source: warp::Error },

    #[snafu(display("failed to build proxy HTTP client: {source}"))]
    ProxyClient { source: reqwest::Error },
}

/// State shared by every handler.
pub struct ApiContext {
    pub queue: Arc<dyn Queue>,
    pub limiter: Option<DefaultDirectRateLimiter>,
    pub body_size_limit: usize,
    pub push_gateway_enable: bool,
    pub query_enable: bool,
    pub query_addr: String,
    pub auth: AuthConfig,
    pub metrics: Option<PrometheusHandle>,
    pub proxy_client: reqwest::Client,
}

impl ApiContext {
    pub fn new(
        api: &ApiConfig,
        auth: AuthConfig,
        queue: Arc<dyn Queue>,
        metrics: Option<PrometheusHandle>,
    ) -> Result<Self, ServerError> {
        let limiter = std::num::NonZeroU32::new(api.rate_limit)
            .map(|rate| RateLimiter::direct(Quota::per_second(rate)));

        let proxy_client = reqwest::Client::builder()
            .build()
            .context(ProxyClientSnafu)?;

        Ok(Self {
            queue,
            limiter,
            body_size_limit: api.max_body_size_limit,
            push_gateway_enable: api.push_gateway_enable,
            query_enable: api.query_enable,
            query_addr: api.query_addr.clone(),
            auth,
            metrics,
            proxy_client,
        })
    }

    /// Cooperative admission control: waits until the token bucket has a
    /// token when rate limiting is configured.
    async fn take(&self) {
        if let Some(limiter) = &self.limiter {
            limiter.until_ready().await;
        }
    }
}

/// Rejection carrying a concrete status and message.
#[derive(Debug)]
pub(crate) enum ApiError {
    Unauthorized,
    TooLarge,
    BadRequest(String),
    Internal(String),
}

impl warp::reject::Reject for ApiError {}

/// Binds the listener and returns the serving future; the future completes
/// once `shutdown` fires and in-flight requests have drained.
pub fn bind(
    listen: &str,
    ctx: Arc<ApiContext>,
    shutdown: CancellationToken,
) -> Result<impl std::future::Future<Output = ()>, ServerError> {
    let addr: SocketAddr = listen.parse().context(ListenSnafu { listen })?;

    let (bound, serving) = warp::serve(routes(ctx))
        .try_bind_with_graceful_shutdown(addr, async move { shutdown.cancelled().await })
        .context(BindSnafu { addr })?;

    info!(listen = %bound, "http service started");
    Ok(serving)
}

/// Assembles the full route tree.
pub fn routes(ctx: Arc<ApiContext>) -> impl Filter<Extract = (impl Reply,), Error = Infallible> + Clone {
    let metrics = warp::path("metrics")
        .and(warp::path::end())
        .and(warp::get())
        .and(with_ctx(Arc::clone(&ctx)))
        .and_then(serve_metrics);

    let remote_write = warp::path!("api" / "v1" / "prom" / "write")
        .and(warp::post())
        .and(auth::required(Arc::clone(&ctx)))
        .and(rate_limited(Arc::clone(&ctx)))
        .and(sized_body(Arc::clone(&ctx)))
        .and(with_ctx(Arc::clone(&ctx)))
        .and_then(serve_remote_write);

    let query = warp::path("api")
        .and(warp::path("v1"))
        .and(auth::required(Arc::clone(&ctx)))
        .and(warp::get().or(warp::post()).unify())
        .and(warp::method())
        .and(warp::path::tail())
        .and(raw_query())
        .and(warp::header::optional::<String>("content-type"))
        .and(warp::body::bytes())
        .and(with_ctx(Arc::clone(&ctx)))
        .and_then(query::serve_proxy);

    let push = push::routes(Arc::clone(&ctx));

    let request_log = warp::log::custom(|info| {
        info!(
            method = %info.method(),
            path = info.path(),
            status = info.status().as_u16(),
            elapsed = ?info.elapsed(),
            remote = ?info.remote_addr(),
            "request"
        );
    });

    metrics
        .or(remote_write)
        .or(push)
        .or(query)
        .recover(handle_rejection)
        .with(request_log)
}

pub(crate) fn with_ctx(
    ctx: Arc<ApiContext>,
) -> impl Filter<Extract = (Arc<ApiContext>,), Error = Infallible> + Clone {
    warp::any().map(move || Arc::clone(&ctx))
}

/// Admission control ahead of body extraction: the rate-limit token is taken
/// before a single body byte is read or size-checked.
pub(crate) fn rate_limited(
    ctx: Arc<ApiContext>,
) -> impl Filter<Extract = (), Error = Rejection> + Clone {
    with_ctx(ctx)
        .and_then(|ctx: Arc<ApiContext>| async move {
            ctx.take().await;
            Ok::<(), Rejection>(())
        })
        .untuple_one()
}

/// Extracts the request body, enforcing the configured size ceiling: before
/// the read when the client declared a Content-Length, after it otherwise.
pub(crate) fn sized_body(
    ctx: Arc<ApiContext>,
) -> impl Filter<Extract = (Bytes,), Error = Rejection> + Clone {
    warp::header::optional::<u64>("content-length")
        .and(with_ctx(ctx))
        .and_then(|length: Option<u64>, ctx: Arc<ApiContext>| async move {
            if ctx.body_size_limit > 0 && length.is_some_and(|l| l > ctx.body_size_limit as u64) {
                return Err(warp::reject::custom(ApiError::TooLarge));
            }
            Ok(ctx)
        })
        .and(warp::body::bytes())
        .and_then(|ctx: Arc<ApiContext>, body: Bytes| async move {
            if ctx.body_size_limit > 0 && body.len() > ctx.body_size_limit {
                return Err(warp::reject::custom(ApiError::TooLarge));
            }
            Ok(body)
        })
}

/// Optional raw query string.
pub(crate) fn raw_query() -> impl Filter<Extract = (Option<String>,), Error = Infallible> + Clone {
    warp::query::raw()
        .map(Some)
        .or_else(|_| async { Ok::<(Option<String>,), Infallible>((None,)) })
}

/// `POST /api/v1/prom/write`: the body already carries the wire format and
/// is pushed to the queue unchanged.
async fn serve_remote_write(
    body: Bytes,
    ctx: Arc<ApiContext>,
) -> Result<impl Reply, Rejection> {
    match ctx.queue.push(body).await {
        Ok(()) => {
            counter!("ingest_requests_total", "handler" => "remote_write", "status" => "ok")
                .increment(1);
            Ok(StatusCode::OK)
        }
        Err(error) => {
            counter!("ingest_requests_total", "handler" => "remote_write", "status" => "error")
                .increment(1);
            error!(%error, "queue push failed");
            Err(warp::reject::custom(ApiError::Internal(error.to_string())))
        }
    }
}

/// `GET /metrics`: this process's own metrics.
async fn serve_metrics(ctx: Arc<ApiContext>) -> Result<impl Reply, Rejection> {
    let body = ctx
        .metrics
        .as_ref()
        .map(|handle| handle.render())
        .unwrap_or_default();
    Ok(warp::reply::with_header(
        body,
        warp::http::header::CONTENT_TYPE,
        "text/plain; version=0.0.4",
    ))
}

async fn handle_rejection(rejection: Rejection) -> Result<impl Reply, Infallible> {
    let (status, message) = if let Some(error) = rejection.find::<ApiError>() {
        match error {
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorized".to_owned()),
            ApiError::TooLarge => (
                StatusCode::PAYLOAD_TOO_LARGE,
                "request entity too large".to_owned(),
            ),
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message.clone()),
            ApiError::Internal(message) => (StatusCode::INTERNAL_SERVER_ERROR, message.clone()),
        }
    } else if rejection.is_not_found() {
        (StatusCode::NOT_FOUND, "not found".to_owned())
    } else if rejection
        .find::<warp::reject::MethodNotAllowed>()
        .is_some()
    {
        (
            StatusCode::METHOD_NOT_ALLOWED,
            "method not allowed".to_owned(),
        )
    } else {
        error!(?rejection, "unhandled rejection");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal error".to_owned(),
        )
    };

    Ok(warp::reply::with_status(message, status))
}
