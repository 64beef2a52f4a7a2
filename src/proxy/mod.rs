//! HTTP ingress
//!
//! The server accepts API traffic, authenticates it, runs the authorization
//! pipeline and forwards to the upstream cluster. Dual-write responses are
//! returned verbatim from the workflow; read responses are intercepted and
//! filtered against the per-request allowed set.

use std::collections::BTreeMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use http_body_util::{combinators::BoxBody, BodyExt, Full, Limited, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{HeaderMap, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use crate::auth::{AuthRequest, Authenticator, HeaderAuthenticator, StaticAuthenticator};
use crate::authz::{
    is_metadata_probe, Authorized, Authorizer, AuthzData, AuthzError, AuthzInput, NamespacedName,
    RequestDescriptor, UserInfo,
};
use crate::config::{AuthenticationMode, Config};
use crate::metrics;
use crate::rules::{self, RuleMatcher};
use crate::spicedb::{PermissionClient, SpicedbClient};
use crate::workflow::activities::KubeClient;
use crate::workflow::{ActivityHandler, HistoryStore, KubeResponse, WorkflowEngine};

pub mod upstream;

pub use upstream::{UpstreamClient, UpstreamError};

/// Response body type used throughout the proxy.
pub type ProxyBody = BoxBody<Bytes, Infallible>;

/// Server errors
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("failed to bind to address: {0}")]
    BindError(String),

    #[error("invalid configuration: {0}")]
    ConfigError(String),

    #[error("server error: {0}")]
    RuntimeError(String),
}

/// Everything a request handler needs, shared across connections.
pub struct ProxyState {
    authenticator: Box<dyn Authenticator>,
    authorizer: Authorizer,
    upstream: Arc<UpstreamClient>,
    body_limit: usize,
}

/// The authorizing reverse proxy.
pub struct Server {
    config: Config,
    state: Arc<ProxyState>,
    engine: WorkflowEngine,
}

impl Server {
    /// Build the full pipeline from configuration: rules, permission
    /// client, durable workflow engine, upstream transport.
    pub fn new(config: Config) -> Result<Self, ServerError> {
        config
            .validate()
            .map_err(|e| ServerError::ConfigError(e.to_string()))?;

        let compiled = rules::load(Path::new(&config.rules.path))
            .map_err(|e| ServerError::ConfigError(e.to_string()))?;
        info!(rules = compiled.len(), path = %config.rules.path, "loaded proxy rules");
        let matcher = RuleMatcher::new(compiled);

        let spicedb: Arc<SpicedbClient> = Arc::new(
            SpicedbClient::connect_lazy(&config.spicedb.endpoint, config.spicedb.token.as_deref())
                .map_err(|e| ServerError::ConfigError(e.to_string()))?,
        );
        let upstream = Arc::new(
            UpstreamClient::new(&config.upstream)
                .map_err(|e| ServerError::ConfigError(e.to_string()))?,
        );

        let store = HistoryStore::open(&config.workflow.store_path)
            .map_err(|e| ServerError::ConfigError(e.to_string()))?;
        let activities = ActivityHandler::new(
            spicedb.clone() as Arc<dyn PermissionClient>,
            upstream.clone() as Arc<dyn KubeClient>,
        );
        let engine = WorkflowEngine::new(store, activities)
            .with_timeout(Duration::from_secs(config.workflow.timeout_secs));

        let authenticator: Box<dyn Authenticator> = match config.authentication.mode {
            AuthenticationMode::Headers => Box::new(HeaderAuthenticator),
            AuthenticationMode::Anonymous => Box::new(StaticAuthenticator::new(UserInfo {
                name: config
                    .authentication
                    .anonymous_user
                    .clone()
                    .unwrap_or_else(|| "system:anonymous".to_string()),
                ..Default::default()
            })),
        };

        let authorizer = Authorizer::new(
            matcher,
            spicedb as Arc<dyn PermissionClient>,
            engine.clone(),
            config.workflow.lock_mode,
        );

        let body_limit = config.server.body_limit_bytes;
        let state = Arc::new(ProxyState {
            authenticator,
            authorizer,
            upstream,
            body_limit,
        });

        Ok(Self {
            config,
            state,
            engine,
        })
    }

    /// Serve until interrupted. Interrupted workflows from a previous
    /// process are resumed before traffic is accepted.
    pub async fn run(&self) -> Result<(), ServerError> {
        let addr: SocketAddr = self
            .config
            .server
            .address
            .parse()
            .map_err(|e| ServerError::BindError(format!("{e}")))?;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::BindError(e.to_string()))?;

        let resumed = self.engine.resume_pending().await;
        if resumed > 0 {
            info!(resumed, "resumed interrupted workflows");
        }

        info!(address = %addr, upstream = %self.config.upstream.server, "proxy listening");
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("shutting down");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    let (stream, _remote) = accepted
                        .map_err(|e| ServerError::RuntimeError(e.to_string()))?;
                    let state = self.state.clone();
                    tokio::spawn(async move {
                        let service = service_fn(move |req| {
                            let state = state.clone();
                            async move { Ok::<_, Infallible>(handle(state, req).await) }
                        });
                        if let Err(e) = http1::Builder::new()
                            .serve_connection(TokioIo::new(stream), service)
                            .await
                        {
                            debug!(error = %e, "connection closed with error");
                        }
                    });
                }
            }
        }
    }
}

/// Per-request pipeline: health endpoints, authentication, probe bypass,
/// input extraction, authorization, and response production.
async fn handle(state: Arc<ProxyState>, req: Request<Incoming>) -> Response<ProxyBody> {
    let method = req.method().as_str().to_string();
    let path = req.uri().path().to_string();
    let query = req.uri().query().map(str::to_string);

    if path == "/readyz" || path == "/livez" {
        return plain_response(StatusCode::OK, "OK");
    }

    let headers = header_map(req.headers());

    let user = match state
        .authenticator
        .authenticate(&AuthRequest {
            headers: headers.clone(),
            method: method.clone(),
            path: path.clone(),
        })
        .await
    {
        Ok(user) => user,
        Err(e) => {
            info!(error = %e, path = %path, "authentication failed");
            metrics::record_request(&method, "unauthenticated");
            return status_response(
                StatusCode::UNAUTHORIZED,
                "Unauthorized",
                "authentication required",
            );
        }
    };

    if is_metadata_probe(&method, &path) {
        metrics::record_request("get", "bypassed");
        return passthrough(&state, &method, &path, query.as_deref(), &headers).await;
    }

    let Some(descriptor) = RequestDescriptor::parse(&method, &path, query.as_deref()) else {
        info!(method = %method, path = %path, "non-resource request denied");
        metrics::record_request(&method, "denied");
        return status_response(
            StatusCode::UNAUTHORIZED,
            "Unauthorized",
            "request did not match any authorization rule",
        );
    };

    let body = if descriptor.reads_body() {
        match read_body(req.into_body(), state.body_limit).await {
            Ok(body) => body,
            Err(e) => {
                info!(error = %e, path = %path, "failed to read request body");
                metrics::record_request(&descriptor.verb, "denied");
                return status_response(StatusCode::BAD_REQUEST, "BadRequest", &e);
            }
        }
    } else {
        Vec::new()
    };

    let verb = descriptor.verb.clone();
    let input = AuthzInput::new(descriptor, user, headers, query, body);

    match state.authorizer.authorize(&input).await {
        Ok(Authorized::Write(kube_response)) => {
            metrics::record_request(&verb, "allowed");
            kube_to_response(kube_response)
        }
        Ok(Authorized::Filtered(data)) => {
            metrics::record_request(&verb, "allowed");
            filtered_proxy(&state, &input, data).await
        }
        Err(e) => {
            info!(
                error = %e,
                verb = %verb,
                path = %input.request.path,
                user = %input.user.name,
                "request denied"
            );
            metrics::record_request(&verb, "denied");
            error_response(&e)
        }
    }
}

/// Forward without filtering, streaming the response body through.
async fn passthrough(
    state: &ProxyState,
    method: &str,
    path: &str,
    query: Option<&str>,
    headers: &BTreeMap<String, Vec<String>>,
) -> Response<ProxyBody> {
    let path_and_query = compose_path(path, query);
    match state
        .upstream
        .send(method, &path_and_query, headers, Vec::new())
        .await
    {
        Ok(resp) => streamed_response(resp),
        Err(e) => {
            warn!(error = %e, path = %path, "upstream request failed");
            status_response(StatusCode::BAD_GATEWAY, "ServiceUnavailable", &e.to_string())
        }
    }
}

/// Read path: issue the upstream request in parallel with the prefilters
/// already running, then intersect the response with the allowed set.
async fn filtered_proxy(
    state: &ProxyState,
    input: &AuthzInput,
    mut data: AuthzData,
) -> Response<ProxyBody> {
    let path_and_query = compose_path(&input.request.path, input.raw_query.as_deref());
    let upstream_resp = match state
        .upstream
        .send("GET", &path_and_query, &input.headers, Vec::new())
        .await
    {
        Ok(resp) => resp,
        Err(e) => {
            warn!(error = %e, path = %input.request.path, "upstream request failed");
            return status_response(
                StatusCode::BAD_GATEWAY,
                "ServiceUnavailable",
                &e.to_string(),
            );
        }
    };

    let status = upstream_resp.status();
    match input.request.verb.as_str() {
        "get" => {
            let headers = upstream_resp.headers().clone();
            let body = match upstream_resp.bytes().await {
                Ok(body) => body,
                Err(e) => {
                    return status_response(
                        StatusCode::BAD_GATEWAY,
                        "ServiceUnavailable",
                        &e.to_string(),
                    )
                }
            };
            if !status.is_success() {
                return buffered_response(status, &headers, body);
            }
            let identity = NamespacedName {
                namespace: input.request.namespace.clone(),
                name: input.request.name.clone(),
            };
            if data.allow_single(&identity).await {
                buffered_response(status, &headers, body)
            } else {
                status_response(
                    StatusCode::FORBIDDEN,
                    "Forbidden",
                    "object is not visible to the requesting user",
                )
            }
        }
        "list" => {
            let headers = upstream_resp.headers().clone();
            let body = match upstream_resp.bytes().await {
                Ok(body) => body,
                Err(e) => {
                    return status_response(
                        StatusCode::BAD_GATEWAY,
                        "ServiceUnavailable",
                        &e.to_string(),
                    )
                }
            };
            if !status.is_success() {
                return buffered_response(status, &headers, body);
            }
            match data.filter_list(&body).await {
                Ok(filtered) => buffered_response(status, &headers, Bytes::from(filtered)),
                Err(e) => {
                    warn!(error = %e, "failed to filter collection response");
                    status_response(
                        StatusCode::BAD_GATEWAY,
                        "ServiceUnavailable",
                        &e.to_string(),
                    )
                }
            }
        }
        "watch" => {
            if !status.is_success() {
                let headers = upstream_resp.headers().clone();
                let body = upstream_resp.bytes().await.unwrap_or_default();
                return buffered_response(status, &headers, body);
            }
            let headers = upstream_resp.headers().clone();
            let (tx, rx) = mpsc::channel::<Bytes>(16);
            let byte_stream = Box::pin(upstream_resp.bytes_stream());
            tokio::spawn(async move {
                data.filter_watch(byte_stream, tx).await;
            });
            let mut response = Response::new(channel_body(rx));
            *response.status_mut() = status;
            copy_headers(&headers, &mut response);
            response
        }
        _ => streamed_response(upstream_resp),
    }
}

/// Read the request body up to `limit` bytes.
async fn read_body(body: Incoming, limit: usize) -> Result<Vec<u8>, String> {
    Limited::new(body, limit)
        .collect()
        .await
        .map(|collected| collected.to_bytes().to_vec())
        .map_err(|e| e.to_string())
}

fn compose_path(path: &str, query: Option<&str>) -> String {
    match query {
        Some(query) if !query.is_empty() => format!("{path}?{query}"),
        _ => path.to_string(),
    }
}

fn header_map(headers: &HeaderMap) -> BTreeMap<String, Vec<String>> {
    let mut map: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (name, value) in headers {
        map.entry(name.as_str().to_ascii_lowercase())
            .or_default()
            .push(String::from_utf8_lossy(value.as_bytes()).into_owned());
    }
    map
}

/// Headers recomputed or managed by the proxy rather than copied through.
fn is_managed_header(name: &str) -> bool {
    matches!(
        name.to_ascii_lowercase().as_str(),
        "content-length" | "transfer-encoding" | "connection"
    )
}

fn copy_headers(headers: &HeaderMap, response: &mut Response<ProxyBody>) {
    for (name, value) in headers {
        if is_managed_header(name.as_str()) {
            continue;
        }
        response.headers_mut().append(name.clone(), value.clone());
    }
}

fn plain_response(status: StatusCode, body: &str) -> Response<ProxyBody> {
    let mut response = Response::new(full_body(Bytes::from(body.to_string())));
    *response.status_mut() = status;
    response
}

/// A Kubernetes `Status`-shaped error response.
fn status_response(status: StatusCode, reason: &str, message: &str) -> Response<ProxyBody> {
    let body = serde_json::json!({
        "kind": "Status",
        "apiVersion": "v1",
        "metadata": {},
        "status": "Failure",
        "message": message,
        "reason": reason,
        "code": status.as_u16(),
    });
    let mut response = Response::new(full_body(Bytes::from(body.to_string())));
    *response.status_mut() = status;
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("application/json"),
    );
    response
}

fn error_response(err: &AuthzError) -> Response<ProxyBody> {
    let status = StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let reason = match status {
        StatusCode::BAD_REQUEST => "BadRequest",
        StatusCode::UNAUTHORIZED => "Unauthorized",
        StatusCode::FORBIDDEN => "Forbidden",
        StatusCode::SERVICE_UNAVAILABLE => "ServiceUnavailable",
        StatusCode::GATEWAY_TIMEOUT => "Timeout",
        _ => "InternalError",
    };
    status_response(status, reason, &err.to_string())
}

/// Translate a workflow's recorded response into an HTTP response verbatim.
fn kube_to_response(kube: KubeResponse) -> Response<ProxyBody> {
    let mut response = Response::new(full_body(Bytes::from(kube.body)));
    *response.status_mut() =
        StatusCode::from_u16(kube.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    for (name, value) in &kube.headers {
        if is_managed_header(name) {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            hyper::header::HeaderName::try_from(name.as_str()),
            hyper::header::HeaderValue::try_from(value.as_str()),
        ) {
            response.headers_mut().append(name, value);
        }
    }
    response
}

fn buffered_response(
    status: StatusCode,
    headers: &HeaderMap,
    body: Bytes,
) -> Response<ProxyBody> {
    let mut response = Response::new(full_body(body));
    *response.status_mut() = status;
    copy_headers(headers, &mut response);
    response
}

/// Stream an upstream response through unchanged. Transport errors mid-body
/// truncate the stream.
fn streamed_response(resp: reqwest::Response) -> Response<ProxyBody> {
    let status = resp.status();
    let headers = resp.headers().clone();
    let (tx, rx) = mpsc::channel::<Bytes>(16);
    tokio::spawn(async move {
        let mut stream = Box::pin(resp.bytes_stream());
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(bytes) => {
                    if tx.send(bytes).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    debug!(error = %e, "upstream stream ended with error");
                    break;
                }
            }
        }
    });
    let mut response = Response::new(channel_body(rx));
    *response.status_mut() = status;
    copy_headers(&headers, &mut response);
    response
}

fn channel_body(rx: mpsc::Receiver<Bytes>) -> ProxyBody {
    let stream = ReceiverStream::new(rx).map(|chunk| Ok::<_, Infallible>(Frame::data(chunk)));
    BoxBody::new(StreamBody::new(stream))
}

fn full_body(bytes: Bytes) -> ProxyBody {
    BoxBody::new(Full::new(bytes))
}
