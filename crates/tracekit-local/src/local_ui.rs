// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, Context};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{header, http, Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use percent_encoding::percent_decode_str;
use serde_json::json;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use url::form_urlencoded;

use crate::broadcaster::Broadcaster;
use crate::config::Config;
use crate::http_utils::{
    apply_cors_headers, create_empty_response, create_json_response,
    log_and_create_error_response, HttpRequest, HttpResponse,
};
use crate::ingest::IngestCoordinator;
use crate::live_channel;
use crate::trace_processor::{OtlpTraceProcessor, TraceProcessor};
use crate::trace_store::{TraceQuery, TraceStorage, DEFAULT_PAGE_LIMIT};

const INGEST_ENDPOINT_PATH: &str = "/v1/traces";
const HEALTH_ENDPOINT_PATH: &str = "/api/health";
const TRACES_ENDPOINT_PATH: &str = "/api/traces";
const TRACE_BY_ID_PREFIX: &str = "/api/traces/";
const STATS_ENDPOINT_PATH: &str = "/api/stats";
const LIVE_ENDPOINT_PATH: &str = "/ws";
const WEBSOCKET_VERSION: &str = "13";

/// Everything a request handler needs, shared by all connections.
pub struct AppState {
    pub config: Arc<Config>,
    pub storage: TraceStorage,
    pub broadcaster: Arc<Broadcaster>,
    pub coordinator: IngestCoordinator,
    pub trace_processor: Arc<dyn TraceProcessor + Send + Sync>,
    pub started_at: Instant,
}

impl AppState {
    /// Must be called inside a Tokio runtime, since the store starts its sweep task.
    pub fn new(config: Config) -> Self {
        let storage = TraceStorage::new(config.store_config());
        let broadcaster = Arc::new(Broadcaster::new());
        let coordinator = IngestCoordinator::new(storage.clone(), broadcaster.clone());
        let trace_processor = Arc::new(OtlpTraceProcessor {
            coordinator: coordinator.clone(),
            max_request_content_length: config.max_request_content_length,
        });
        AppState {
            config: Arc::new(config),
            storage,
            broadcaster,
            coordinator,
            trace_processor,
            started_at: Instant::now(),
        }
    }
}

/// The local HTTP and live-update server.
pub struct LocalUiServer {
    state: Arc<AppState>,
    shutdown: CancellationToken,
}

impl LocalUiServer {
    pub fn new(config: Config) -> Self {
        Self::with_state(AppState::new(config))
    }

    pub fn with_state(state: AppState) -> Self {
        LocalUiServer {
            state: Arc::new(state),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn state(&self) -> &Arc<AppState> {
        &self.state
    }

    /// Binds the configured host, walking upward from the configured port while ports are taken.
    pub async fn bind(&self) -> anyhow::Result<TcpListener> {
        bind_available_port(
            &self.state.config.host,
            self.state.config.port,
            self.state.config.port_search_limit,
        )
        .await
    }

    /// Serves connections from `listener` until [`LocalUiServer::stop`] is called.
    pub async fn serve(&self, listener: TcpListener) -> anyhow::Result<()> {
        let addr = listener.local_addr()?;
        info!("TraceKit local server listening on http://{addr}");
        debug!(
            "Time taken to start the TraceKit local server: {} ms",
            self.state.started_at.elapsed().as_millis()
        );

        let state = self.state.clone();
        let service = service_fn(move |req: Request<Incoming>| {
            // called for each http request
            let state = state.clone();
            Self::endpoint_handler(state, req.map(|body| body.boxed()))
        });

        Self::serve_tcp(listener, service, self.shutdown.clone()).await
    }

    async fn serve_tcp<S>(
        listener: TcpListener,
        service: S,
        shutdown: CancellationToken,
    ) -> anyhow::Result<()>
    where
        S: hyper::service::Service<Request<Incoming>, Response = HttpResponse>
            + Clone
            + Send
            + 'static,
        S::Future: Send,
        S::Error: std::error::Error + Send + Sync + 'static,
    {
        let server = hyper::server::conn::http1::Builder::new();
        let mut joinset = tokio::task::JoinSet::new();

        loop {
            let conn = tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("TraceKit local server shutting down, closing listener");
                    return Ok(());
                },
                con_res = listener.accept() => match con_res {
                    Err(e)
                        if matches!(
                            e.kind(),
                            io::ErrorKind::ConnectionAborted
                                | io::ErrorKind::ConnectionReset
                                | io::ErrorKind::ConnectionRefused
                        ) =>
                    {
                        continue;
                    }
                    Err(e) => {
                        error!("Server error: {e}");
                        return Err(e.into());
                    }
                    Ok((conn, _)) => conn,
                },
                finished = async {
                    match joinset.join_next().await {
                        Some(finished) => finished,
                        None => std::future::pending().await,
                    }
                } => match finished {
                    Err(e) if e.is_panic() => {
                        // Don't kill server on panic - log and continue
                        error!("Connection handler panicked: {:?}", e);
                        continue;
                    },
                    Ok(()) | Err(_) => continue,
                },
            };
            let conn = TokioIo::new(conn);
            let server = server.clone();
            let service = service.clone();
            joinset.spawn(async move {
                if let Err(e) = server.serve_connection(conn, service).with_upgrades().await {
                    debug!("Connection error: {e}");
                }
            });
        }
    }

    /// Serves until `shutdown` resolves or serving ends by itself, and stops the server in both
    /// cases.
    pub async fn run_until<F>(
        self: Arc<Self>,
        listener: TcpListener,
        shutdown: F,
    ) -> anyhow::Result<()>
    where
        F: Future<Output = ()>,
    {
        let serving = Arc::clone(&self);
        let mut serve_handle = tokio::spawn(async move { serving.serve(listener).await });

        let finished = tokio::select! {
            result = &mut serve_handle => {
                error!("TraceKit local server stopped before shutdown was requested");
                Some(result)
            }
            _ = shutdown => {
                info!("Shutting down TraceKit local server");
                None
            }
        };
        self.stop().await;

        let result = match finished {
            Some(result) => result,
            None => serve_handle.await,
        };
        result.context("TraceKit local server task failed")?
    }

    /// Stops the sweep, closes every live subscriber, then closes the listener. Each step runs
    /// whatever happened in the previous one; calling it twice is harmless.
    pub async fn stop(&self) {
        self.state.storage.stop_cleanup();
        self.state.broadcaster.close().await;
        self.shutdown.cancel();
        info!("TraceKit local server stopped");
    }

    async fn endpoint_handler(
        state: Arc<AppState>,
        req: HttpRequest,
    ) -> http::Result<HttpResponse> {
        debug!("{} {}", req.method(), req.uri().path());

        let mut response = Self::route(state, req).await?;
        apply_cors_headers(response.headers_mut());
        Ok(response)
    }

    async fn route(state: Arc<AppState>, req: HttpRequest) -> http::Result<HttpResponse> {
        let path = req.uri().path().to_string();
        match (req.method(), path.as_str()) {
            (&Method::OPTIONS, _) => create_empty_response(StatusCode::NO_CONTENT),
            (&Method::PUT | &Method::POST, INGEST_ENDPOINT_PATH) => {
                match state.trace_processor.process_traces(req).await {
                    Ok(res) => Ok(res),
                    Err(err) => {
                        error!("Error processing traces: {err}");
                        log_and_create_error_response(
                            "Failed to process traces",
                            StatusCode::INTERNAL_SERVER_ERROR,
                        )
                    }
                }
            }
            (&Method::GET, HEALTH_ENDPOINT_PATH) => {
                let stats = state.storage.stats().await;
                create_json_response(
                    &json!({
                        "status": "ok",
                        "uptime": state.started_at.elapsed().as_secs_f64(),
                        "stats": stats,
                    }),
                    StatusCode::OK,
                )
            }
            (&Method::GET, TRACES_ENDPOINT_PATH) => {
                let query = parse_trace_query(req.uri().query());
                create_json_response(&state.storage.get_all(&query).await, StatusCode::OK)
            }
            (&Method::DELETE, TRACES_ENDPOINT_PATH) => {
                state.coordinator.clear().await;
                info!("All traces cleared");
                create_json_response(
                    &json!({ "success": true, "message": "All traces cleared" }),
                    StatusCode::OK,
                )
            }
            (&Method::GET, STATS_ENDPOINT_PATH) => {
                create_json_response(&state.storage.stats().await, StatusCode::OK)
            }
            (&Method::GET, LIVE_ENDPOINT_PATH) => Self::live_channel_handler(state, req).await,
            (&Method::GET, _) => match trace_id_from_path(&path) {
                Some(id) => match state.storage.get_by_id(&id).await {
                    Some(record) => create_json_response(&record, StatusCode::OK),
                    None => {
                        log_and_create_error_response("Trace not found", StatusCode::NOT_FOUND)
                    }
                },
                None => log_and_create_error_response("Not found", StatusCode::NOT_FOUND),
            },
            _ => log_and_create_error_response("Not found", StatusCode::NOT_FOUND),
        }
    }

    /// Answers a WebSocket upgrade and hands the upgraded connection to a live session once
    /// hyper has switched protocols.
    async fn live_channel_handler(
        state: Arc<AppState>,
        mut req: HttpRequest,
    ) -> http::Result<HttpResponse> {
        let accept_key = match websocket_accept_key(&req) {
            Some(key) => key,
            None => {
                return log_and_create_error_response(
                    "Invalid WebSocket upgrade request",
                    StatusCode::BAD_REQUEST,
                )
            }
        };

        let subscription = match state.broadcaster.subscribe().await {
            Some(subscription) => subscription,
            None => {
                return log_and_create_error_response(
                    "Live updates are shutting down",
                    StatusCode::SERVICE_UNAVAILABLE,
                )
            }
        };

        let on_upgrade = hyper::upgrade::on(&mut req);
        let broadcaster = state.broadcaster.clone();
        tokio::spawn(async move {
            match on_upgrade.await {
                Ok(upgraded) => {
                    let stream = WebSocketStream::from_raw_socket(
                        TokioIo::new(upgraded),
                        Role::Server,
                        None,
                    )
                    .await;
                    live_channel::run_session(stream, subscription, broadcaster).await;
                }
                Err(err) => {
                    error!("WebSocket upgrade failed: {err}");
                    broadcaster.unsubscribe(subscription.id).await;
                }
            }
        });

        Response::builder()
            .status(StatusCode::SWITCHING_PROTOCOLS)
            .header(header::CONNECTION, "Upgrade")
            .header(header::UPGRADE, "websocket")
            .header(header::SEC_WEBSOCKET_ACCEPT, accept_key)
            .body(Full::new(Bytes::new()))
    }
}

/// Binds `host:start_port`, moving to the next port while the address is in use. Any other bind
/// error aborts the search. The returned listener is already bound, so there is no window in
/// which another process can take the port.
pub async fn bind_available_port(
    host: &str,
    start_port: u16,
    attempts: u16,
) -> anyhow::Result<TcpListener> {
    for offset in 0..attempts {
        let Some(port) = start_port.checked_add(offset) else {
            break;
        };
        match TcpListener::bind((host, port)).await {
            Ok(listener) => {
                if offset > 0 {
                    info!("Port {start_port} is in use, using port {port} instead");
                }
                return Ok(listener);
            }
            Err(err) if err.kind() == io::ErrorKind::AddrInUse => {
                debug!("Port {port} is in use");
                continue;
            }
            Err(err) => {
                return Err(err).with_context(|| format!("failed to bind {host}:{port}"));
            }
        }
    }
    Err(anyhow!(
        "no available port found in {attempts} attempts starting at {start_port}"
    ))
}

/// Reads list parameters from a query string. Unparsable numbers fall back to their defaults
/// and empty filters mean no filter.
fn parse_trace_query(query: Option<&str>) -> TraceQuery {
    let mut trace_query = TraceQuery::default();
    for (key, value) in form_urlencoded::parse(query.unwrap_or_default().as_bytes()) {
        match key.as_ref() {
            "limit" => trace_query.limit = value.trim().parse().unwrap_or(DEFAULT_PAGE_LIMIT),
            "offset" => trace_query.offset = value.trim().parse().unwrap_or(0),
            "service" if !value.is_empty() => trace_query.service = Some(value.into_owned()),
            "status" if !value.is_empty() => trace_query.status = Some(value.into_owned()),
            _ => {}
        }
    }
    trace_query
}

/// Extracts and percent-decodes the id from `/api/traces/{id}`.
fn trace_id_from_path(path: &str) -> Option<String> {
    let raw = path.strip_prefix(TRACE_BY_ID_PREFIX)?;
    if raw.is_empty() || raw.contains('/') {
        return None;
    }
    Some(percent_decode_str(raw).decode_utf8_lossy().into_owned())
}

/// Returns the `Sec-WebSocket-Accept` value for a well-formed upgrade request.
fn websocket_accept_key<B>(req: &Request<B>) -> Option<String> {
    let headers = req.headers();
    let header_has_token = |name: header::HeaderName, token: &str| {
        headers
            .get_all(name)
            .iter()
            .filter_map(|val| val.to_str().ok())
            .flat_map(|val| val.split(','))
            .any(|val| val.trim().eq_ignore_ascii_case(token))
    };

    if req.method() != Method::GET
        || !header_has_token(header::CONNECTION, "upgrade")
        || !header_has_token(header::UPGRADE, "websocket")
        || headers
            .get(header::SEC_WEBSOCKET_VERSION)
            .map_or(true, |val| val != WEBSOCKET_VERSION)
    {
        return None;
    }
    let key = headers.get(header::SEC_WEBSOCKET_KEY)?;
    Some(derive_accept_key(key.as_bytes()))
}
