//! Server application and connection handling

use std::{convert::Infallible, sync::Arc};
use hyper::{
    body::Incoming,
    header::{
        HeaderValue,
        ACCESS_CONTROL_ALLOW_HEADERS,
        ACCESS_CONTROL_ALLOW_METHODS,
        ACCESS_CONTROL_ALLOW_ORIGIN
    },
    server::conn::http1,
    service::service_fn,
    Request,
    Response
};
use hyper_util::{rt::TokioIo, server::graceful::GracefulShutdown};
use tokio::{net::TcpListener, signal};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use crate::{
    backend::Backend,
    error::ServerError,
    http::Body,
    settings::ServerSettings,
    state::AppState,
};

pub use router::API_PREFIX;

pub(crate) mod handlers;
mod router;

/// The rate limiter HTTP server.
///
/// # Example
/// ```no_run
/// use tokengate_server::{App, ServerSettings};
///
/// # async fn run() -> Result<(), tokengate_server::ServerError> {
/// let app = App::build(ServerSettings::load()?).await?;
/// app.run().await
/// # }
/// ```
#[derive(Debug)]
pub struct App {
    state: Arc<AppState>,
    shutdown: CancellationToken,
}

impl App {
    /// Creates the application, connecting to the configured backend.
    pub async fn build(settings: ServerSettings) -> Result<Self, ServerError> {
        settings.validate()?;
        let backend = Backend::from_config(&settings.limiter).await?;
        tracing::info!(backend = backend.kind(), "rate limiter backend ready");
        Ok(Self::with_backend(backend, settings))
    }

    /// Creates the application over an already built `backend`.
    pub fn with_backend(backend: Backend, settings: ServerSettings) -> Self {
        let shutdown = CancellationToken::new();
        let state = Arc::new(AppState::new(backend, settings, shutdown.clone()));
        Self { state, shutdown }
    }

    /// Shared state of the request handlers.
    #[inline(always)]
    pub fn state(&self) -> &Arc<AppState> {
        &self.state
    }

    /// Token that stops the server when cancelled.
    #[inline]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Binds the configured address and serves until `Ctrl+C`.
    pub async fn run(self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(self.state.settings().addr).await?;
        self.shutdown_on_ctrl_c();
        self.run_with_listener(listener).await
    }

    /// Serves connections accepted by `listener` until the shutdown token is cancelled.
    ///
    /// On shutdown the load driver stops, live feeds end and open connections
    /// get the configured timeout to finish.
    pub async fn run_with_listener(self, listener: TcpListener) -> Result<(), ServerError> {
        let socket = listener.local_addr()?;
        tracing::info!("listening on: http://{socket}{API_PREFIX}");

        let graceful = GracefulShutdown::new();
        loop {
            let (stream, peer) = tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok(connection) => connection,
                    Err(err) => {
                        tracing::warn!("failed to accept connection: {err:#}");
                        continue;
                    }
                },
                _ = self.shutdown.cancelled() => break,
            };

            if let Err(err) = stream.set_nodelay(true) {
                tracing::warn!("failed to set TCP_NODELAY on incoming connection: {err:#}");
            }

            let state = self.state.clone();
            let service = service_fn(move |request| {
                let state = state.clone();
                async move { Ok::<_, Infallible>(handle(state, request).await) }
            });

            let connection = http1::Builder::new().serve_connection(TokioIo::new(stream), service);
            let connection = graceful.watch(connection);
            tokio::spawn(async move {
                if let Err(err) = connection.await {
                    tracing::error!(%peer, "error serving connection: {err:#}");
                }
            });
        }

        drop(listener);
        self.state.driver().stop();
        tracing::info!("shutting down");

        let timeout = self.state.settings().shutdown_timeout();
        if tokio::time::timeout(timeout, graceful.shutdown()).await.is_err() {
            tracing::warn!(?timeout, "open connections did not finish in time");
        }
        Ok(())
    }

    fn shutdown_on_ctrl_c(&self) {
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                result = signal::ctrl_c() => {
                    if let Err(err) = result {
                        tracing::error!("unable to listen for shutdown signal: {err:#}");
                        return;
                    }
                    tracing::trace!("shutdown signal received, not accepting new requests");
                    shutdown.cancel();
                }
                _ = shutdown.cancelled() => {}
            }
        });
    }
}

async fn handle(state: Arc<AppState>, request: Request<Incoming>) -> Response<Body> {
    let method = request.method().clone();
    let path = request.uri().path().to_owned();
    let span = tracing::info_span!("request", %method, path = %path);

    async move {
        let result = match router::route(&method, &path) {
            Ok(route) => handlers::dispatch(route, &state, request).await,
            Err(err) => Err(err),
        };

        let mut response = result.unwrap_or_else(|err| {
            if err.status().is_server_error() {
                tracing::error!("request failed: {err}");
            } else {
                tracing::debug!("request rejected: {err}");
            }
            err.into_response()
        });

        allow_origin(&state, &mut response);
        tracing::debug!(status = response.status().as_u16(), "request handled");
        response
    }
    .instrument(span)
    .await
}

fn allow_origin(state: &AppState, response: &mut Response<Body>) {
    let Some(origin) = state.settings().cors_origin.as_deref() else {
        return;
    };
    let Ok(origin) = HeaderValue::from_str(origin) else {
        tracing::warn!(origin, "invalid CORS origin");
        return;
    };

    let headers = response.headers_mut();
    headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, origin);
    headers.insert(ACCESS_CONTROL_ALLOW_METHODS, HeaderValue::from_static("GET, POST, OPTIONS"));
    headers.insert(ACCESS_CONTROL_ALLOW_HEADERS, HeaderValue::from_static("content-type"));
}
