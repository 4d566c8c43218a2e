//! Request routing

use hyper::{Method, StatusCode};
use crate::error::ApiError;

/// Path prefix of every endpoint.
pub const API_PREFIX: &str = "/api/rate-limiter";

/// A matched endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Route {
    Check(String),
    Stats(String),
    Simulate,
    Reset,
    Start,
    Stop,
    Driver,
    Events,
    Health,
    Preflight,
}

/// Matches `method` and `path` to a [`Route`].
///
/// Fails with `404` for an unknown path and `405` for a known path
/// requested with another method. `HEAD` is only accepted on routes
/// that do not change state.
pub(crate) fn route(method: &Method, path: &str) -> Result<Route, ApiError> {
    let rest = path
        .strip_prefix(API_PREFIX)
        .filter(|rest| rest.is_empty() || rest.starts_with('/'))
        .ok_or_else(|| not_found(path))?;

    let rest = rest.trim_matches('/');
    let mut segments = rest.split('/');
    let (first, second, third) = (segments.next(), segments.next(), segments.next());

    let (expected, route) = match (first, second, third) {
        (Some("check"), Some(id), None) if !id.is_empty() => (Method::GET, Route::Check(id.to_owned())),
        (Some("stats"), Some(id), None) if !id.is_empty() => (Method::GET, Route::Stats(id.to_owned())),
        (Some("simulate"), None, _) => (Method::POST, Route::Simulate),
        (Some("reset"), None, _) => (Method::POST, Route::Reset),
        (Some("start"), None, _) => (Method::POST, Route::Start),
        (Some("stop"), None, _) => (Method::POST, Route::Stop),
        (Some("driver"), None, _) => (Method::GET, Route::Driver),
        (Some("events"), None, _) => (Method::GET, Route::Events),
        (Some("health"), None, _) => (Method::GET, Route::Health),
        _ => return Err(not_found(path)),
    };

    if *method == Method::OPTIONS {
        Ok(Route::Preflight)
    } else if *method == expected || (*method == Method::HEAD && route.is_read_only()) {
        Ok(route)
    } else {
        Err(ApiError::new(
            StatusCode::METHOD_NOT_ALLOWED,
            format!("method {method} is not allowed for {path}")
        ))
    }
}

impl Route {
    /// Returns `true` if serving the route leaves buckets, counters and the feed untouched.
    #[inline]
    fn is_read_only(&self) -> bool {
        matches!(self, Route::Stats(_) | Route::Driver | Route::Health)
    }
}

#[inline]
fn not_found(path: &str) -> ApiError {
    ApiError::not_found(format!("no route for {path}"))
}
