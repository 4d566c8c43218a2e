//! Endpoint handlers

use std::{convert::Infallible, sync::Arc};
use futures_util::StreamExt;
use http_body_util::{BodyExt, StreamBody};
use hyper::{
    body::{Frame, Incoming},
    header::{HeaderValue, CACHE_CONTROL, CONTENT_TYPE},
    Request,
    Response,
    StatusCode
};
use serde::{Deserialize, Serialize};
use tokengate::{config::RateLimiterConfig, BucketPolicy};
use crate::{
    error::ApiError,
    http::{self, Body},
    state::AppState,
};
use super::router::Route;

/// Body of `POST /simulate`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulateRequest {
    /// Client to check
    pub client_id: String,
}

/// Body of `POST /start`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimiterRequest {
    /// Client to issue requests for; the configured driver client if absent
    #[serde(default)]
    pub client_id: Option<String>,

    /// Requests per second
    pub tps: u32,

    /// If given together with `refill_rate`, the client's bucket is reset first
    #[serde(default)]
    pub capacity: Option<u64>,

    /// If given together with `capacity`, the client's bucket is reset first
    #[serde(default)]
    pub refill_rate: Option<u64>,
}

/// Body of `GET /health`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    /// `UP` or `DOWN`
    pub status: String,

    /// Backend kind
    pub backend: String,

    /// Why the backend is down
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub(crate) async fn dispatch(
    route: Route,
    state: &Arc<AppState>,
    request: Request<Incoming>
) -> Result<Response<Body>, ApiError> {
    match route {
        Route::Check(client_id) => check(state, &client_id).await,
        Route::Stats(client_id) => stats(state, &client_id).await,
        Route::Simulate => simulate(state, request).await,
        Route::Reset => reset(state, request).await,
        Route::Start => start(state, request).await,
        Route::Stop => Ok(stop(state)),
        Route::Driver => http::json(&state.driver().status()),
        Route::Events => Ok(events(state)),
        Route::Health => health(state).await,
        Route::Preflight => Ok(http::status(StatusCode::NO_CONTENT)),
    }
}

async fn check(state: &AppState, client_id: &str) -> Result<Response<Body>, ApiError> {
    let decision = state.check(client_id).await?;
    http::json(&decision)
}

async fn stats(state: &AppState, client_id: &str) -> Result<Response<Body>, ApiError> {
    let decision = state
        .limiter()
        .status(client_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("unknown client {client_id}")))?;
    http::json(&state.stats().snapshot(client_id, decision))
}

async fn simulate(state: &AppState, request: Request<Incoming>) -> Result<Response<Body>, ApiError> {
    let body: SimulateRequest = http::read_json(request, state.settings().max_body_size).await?;
    if body.client_id.is_empty() {
        return Err(ApiError::bad_request("client id must not be empty"));
    }

    let decision = state.check(&body.client_id).await?;
    http::json(&state.stats().snapshot(&body.client_id, decision))
}

async fn reset(state: &AppState, request: Request<Incoming>) -> Result<Response<Body>, ApiError> {
    let config: RateLimiterConfig = http::read_json(request, state.settings().max_body_size).await?;
    let policy = config.policy()?;

    state
        .limiter()
        .reset(&config.client_id, policy.capacity, policy.refill_rate)
        .await?;
    Ok(http::status(StatusCode::NO_CONTENT))
}

async fn start(state: &Arc<AppState>, request: Request<Incoming>) -> Result<Response<Body>, ApiError> {
    let body: RateLimiterRequest = http::read_json(request, state.settings().max_body_size).await?;
    let client_id = match body.client_id {
        Some(client_id) if !client_id.is_empty() => client_id,
        _ => state.settings().driver_client_id.clone(),
    };

    match (body.capacity, body.refill_rate) {
        (Some(capacity), Some(refill_rate)) => {
            let policy = BucketPolicy::new(capacity, refill_rate)?;
            state.limiter().reset(&client_id, policy.capacity, policy.refill_rate).await?;
        }
        (None, None) => {}
        _ => return Err(ApiError::bad_request("capacity and refill rate must be given together")),
    }

    let job_state = Arc::clone(state);
    let job_client = client_id.clone();
    state.driver().start(&client_id, body.tps, move || {
        let state = job_state.clone();
        let client_id = job_client.clone();
        async move {
            if let Err(err) = state.check(&client_id).await {
                tracing::warn!(client_id = %client_id, "synthetic request failed: {err}");
            }
        }
    })?;

    Ok(http::status(StatusCode::NO_CONTENT))
}

fn stop(state: &AppState) -> Response<Body> {
    state.driver().stop();
    http::status(StatusCode::NO_CONTENT)
}

fn events(state: &AppState) -> Response<Body> {
    let shutdown = state.shutdown_token().clone().cancelled_owned();
    let frames = state
        .bus()
        .sse_stream()
        .take_until(shutdown)
        .map(|frame| Ok::<_, Infallible>(Frame::data(frame)));

    let mut response = Response::new(StreamBody::new(frames).boxed_unsync());
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/event-stream; charset=utf-8"));
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert("x-accel-buffering", HeaderValue::from_static("no"));
    response
}

async fn health(state: &AppState) -> Result<Response<Body>, ApiError> {
    let backend = state.limiter().store();
    let (status, report) = match backend.ping().await {
        Ok(()) => (StatusCode::OK, HealthReport {
            status: "UP".into(),
            backend: backend.kind().into(),
            error: None,
        }),
        Err(err) => {
            tracing::warn!("health check failed: {err}");
            (StatusCode::SERVICE_UNAVAILABLE, HealthReport {
                status: "DOWN".into(),
                backend: backend.kind().into(),
                error: Some(err.to_string()),
            })
        }
    };

    let mut response = http::json(&report)?;
    *response.status_mut() = status;
    Ok(response)
}
