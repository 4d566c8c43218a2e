//! Server errors and their HTTP representation

use std::{
    error::Error as StdError,
    fmt::{Display, Formatter},
    io
};
use hyper::{Response, StatusCode};
use serde::Serialize;
use crate::http::{self, Body};

/// Errors that prevent the server from starting or keep it from running.
#[derive(Debug)]
pub enum ServerError {
    /// Binding or accepting failed.
    Io(io::Error),

    /// The HTTP layer failed.
    Http(hyper::Error),

    /// Settings could not be read or are invalid.
    Config(String),

    /// The rate limiter backend could not be initialized.
    Limiter(tokengate::Error),
}

impl Display for ServerError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerError::Io(err) => write!(f, "I/O Error: {err}"),
            ServerError::Http(err) => write!(f, "HTTP Error: {err}"),
            ServerError::Config(msg) => write!(f, "Settings Error: {msg}"),
            ServerError::Limiter(err) => write!(f, "{err}"),
        }
    }
}

impl StdError for ServerError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            ServerError::Io(err) => Some(err),
            ServerError::Http(err) => Some(err),
            ServerError::Limiter(err) => Some(err),
            ServerError::Config(_) => None,
        }
    }
}

impl From<io::Error> for ServerError {
    #[inline]
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<hyper::Error> for ServerError {
    #[inline]
    fn from(err: hyper::Error) -> Self {
        Self::Http(err)
    }
}

impl From<tokengate::Error> for ServerError {
    #[inline]
    fn from(err: tokengate::Error) -> Self {
        Self::Limiter(err)
    }
}

impl From<serde_json::Error> for ServerError {
    #[inline]
    fn from(err: serde_json::Error) -> Self {
        Self::Config(err.to_string())
    }
}

/// A failed request, rendered as `{ "error": "<message>" }`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
}

impl Display for ApiError {
    #[inline]
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.status, self.message)
    }
}

impl StdError for ApiError {}

impl ApiError {
    /// Creates an error with the given status and message.
    #[inline]
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self { status, message: message.into() }
    }

    /// `400 Bad Request`
    #[inline]
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    /// `404 Not Found`
    #[inline]
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    /// `500 Internal Server Error`
    #[inline]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    /// HTTP status of this error.
    #[inline(always)]
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Human-readable message of this error.
    #[inline(always)]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Renders the error as a JSON response.
    pub(crate) fn into_response(self) -> Response<Body> {
        let body = serde_json::to_vec(&ErrorBody { error: &self.message })
            .unwrap_or_else(|_| br#"{"error":"internal error"}"#.to_vec());
        http::json_bytes(self.status, body)
    }
}

impl From<tokengate::Error> for ApiError {
    fn from(err: tokengate::Error) -> Self {
        use tokengate::Error::*;

        let status = match &err {
            InvalidConfiguration(_) => StatusCode::BAD_REQUEST,
            StoreUnavailable(_) | Timeout(_) => StatusCode::SERVICE_UNAVAILABLE,
            ConcurrentModification { .. } => StatusCode::CONFLICT,
            CorruptedRecord { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;
    use std::time::Duration;

    #[test]
    fn it_maps_limiter_errors_to_statuses() {
        let cases = [
            (tokengate::Error::InvalidConfiguration("capacity must be positive"), 400),
            (tokengate::Error::StoreUnavailable("connection refused".into()), 503),
            (tokengate::Error::Timeout(Duration::from_millis(500)), 503),
            (tokengate::Error::ConcurrentModification { client_id: "c1".into(), attempts: 5 }, 409),
            (tokengate::Error::CorruptedRecord { key: "k".into(), value: "v".into() }, 500),
        ];

        for (err, status) in cases {
            assert_eq!(ApiError::from(err).status(), status);
        }
    }

    #[tokio::test]
    async fn it_renders_json_error_body() {
        let response = ApiError::bad_request("bad input").into_response();

        assert_eq!(response.status(), 400);
        assert_eq!(response.headers()["content-type"], "application/json");

        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], br#"{"error":"bad input"}"#);
    }

    #[test]
    fn server_error_exposes_source() {
        let err = ServerError::from(io::Error::other("boom"));

        assert!(err.source().is_some());
        assert_eq!(err.to_string(), "I/O Error: boom");
    }
}
