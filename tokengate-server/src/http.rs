//! HTTP body and response helpers

use std::convert::Infallible;
use bytes::Bytes;
use http_body_util::{combinators::UnsyncBoxBody, BodyExt, Empty, Full, LengthLimitError, Limited};
use hyper::{
    body::Incoming,
    header::{HeaderValue, CONTENT_TYPE},
    Request,
    Response,
    StatusCode
};
use serde::{de::DeserializeOwned, Serialize};
use crate::error::ApiError;

/// Response body of every endpoint.
pub(crate) type Body = UnsyncBoxBody<Bytes, Infallible>;

const APPLICATION_JSON: &str = "application/json";

/// An empty body.
#[inline]
pub(crate) fn empty() -> Body {
    Empty::new().boxed_unsync()
}

/// A body holding `bytes`.
#[inline]
pub(crate) fn full(bytes: impl Into<Bytes>) -> Body {
    Full::new(bytes.into()).boxed_unsync()
}

/// A response with no content.
#[inline]
pub(crate) fn status(status: StatusCode) -> Response<Body> {
    let mut response = Response::new(empty());
    *response.status_mut() = status;
    response
}

/// A response with an already serialized JSON body.
pub(crate) fn json_bytes(status: StatusCode, body: impl Into<Bytes>) -> Response<Body> {
    let mut response = Response::new(full(body));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(APPLICATION_JSON));
    response
}

/// A `200 OK` response with `value` serialized as JSON.
pub(crate) fn json<T: Serialize>(value: &T) -> Result<Response<Body>, ApiError> {
    serde_json::to_vec(value)
        .map(|body| json_bytes(StatusCode::OK, body))
        .map_err(|err| ApiError::internal(format!("failed to serialize response: {err}")))
}

/// Reads and deserializes a JSON request body of at most `limit` bytes.
pub(crate) async fn read_json<T: DeserializeOwned>(request: Request<Incoming>, limit: usize) -> Result<T, ApiError> {
    let bytes = Limited::new(request.into_body(), limit)
        .collect()
        .await
        .map_err(|err| {
            if err.downcast_ref::<LengthLimitError>().is_some() {
                ApiError::new(StatusCode::PAYLOAD_TOO_LARGE, "request body is too large")
            } else {
                ApiError::bad_request(format!("failed to read request body: {err}"))
            }
        })?
        .to_bytes();

    serde_json::from_slice(&bytes)
        .map_err(|err| ApiError::bad_request(format!("invalid request body: {err}")))
}
