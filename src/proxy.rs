//! HTTP front-end: the mirror mux that forwards to the primary upstream
//! while fanning each request out to the reflector, and the targets mux
//! that lets operators add/remove/list mirrors at runtime.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use axum::body::{to_bytes, Body};
use axum::extract::{Request as AxumRequest, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::Router;
use base64::Engine;
use subtle::ConstantTimeEq;
use tower_http::trace::TraceLayer;
use tracing::{error, instrument, warn};

use crate::config::Credentials;
use crate::mirror::MirrorState;
use crate::reflector::Reflector;
use crate::request::MirrorRequest;
use crate::tracker::RequestTracker;

/// Shared state behind every handler.
#[derive(Clone)]
pub struct AppState {
    pub reflector: Arc<Reflector>,
    pub tracker: Arc<RequestTracker>,
    pub primary_client: reqwest::Client,
    pub primary_target: String,
    pub primary_delay: Duration,
    pub credentials: Option<Arc<Credentials>>,
    pub targets_endpoint: String,
    pub max_body_bytes: Option<usize>,
}

/// Builds the mirror mux (root path, any method/path) and, when the targets
/// endpoint shares this listener, the targets mux on the same router.
pub fn mirror_router(state: AppState, include_targets: bool) -> Router {
    let mut router = Router::new().fallback(any(forward_handler));
    if include_targets {
        let path = format!("/{}", state.targets_endpoint);
        router = router.route(&path, get(targets_get).put(targets_put).delete(targets_delete));
    }
    router.layer(TraceLayer::new_for_http()).with_state(state)
}

/// Builds a standalone targets mux for `--targets-address`.
pub fn targets_router(state: AppState) -> Router {
    let path = format!("/{}", state.targets_endpoint);
    Router::new()
        .route(&path, get(targets_get).put(targets_put).delete(targets_delete))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Forwards an inbound request to the primary upstream, returning the
/// primary's response to the client, while also publishing the buffered
/// request onto the reflector's fan-out channel. Mirror delivery does not
/// depend on the primary forward succeeding.
#[instrument(skip_all, fields(method = %req.method(), uri = %req.uri()))]
async fn forward_handler(State(state): State<AppState>, req: AxumRequest) -> Response {
    let (parts, body) = req.into_parts();
    let method = parts.method.clone();
    let uri = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| parts.uri.path().to_string());
    let headers = parts.headers.clone();

    if let Some(limit) = state.max_body_bytes {
        if let Some(len) = content_length(&headers) {
            if len > limit {
                return (StatusCode::PAYLOAD_TOO_LARGE, "request body too large").into_response();
            }
        }
    }

    let limit = state.max_body_bytes.unwrap_or(usize::MAX);
    let body_bytes = match to_bytes(body, limit).await {
        Ok(bytes) => bytes,
        Err(err) => {
            warn!(error = %err, "failed to read request body, continuing with empty body");
            bytes::Bytes::new()
        }
    };

    let (epoch, snapshot) = state.tracker.new_request();

    if state.primary_delay > Duration::ZERO {
        tokio::time::sleep(state.primary_delay).await;
    }

    let primary_response = send_to_primary(
        &state.primary_client,
        &state.primary_target,
        &method,
        &uri,
        &headers,
        body_bytes.clone(),
    )
    .await;

    state.tracker.request_done(epoch);

    let mirror_request = Arc::new(MirrorRequest::new(
        method,
        uri,
        headers,
        body_bytes,
        epoch,
        snapshot,
    ));
    state.reflector.submit(mirror_request).await;

    match primary_response {
        Ok(response) => response,
        Err(err) => {
            error!(error = %err, "primary forward failed");
            (StatusCode::BAD_GATEWAY, format!("primary forward failed: {err}")).into_response()
        }
    }
}

fn content_length(headers: &HeaderMap) -> Option<usize> {
    headers
        .get(axum::http::header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}

/// Replays `method`/`uri`/`headers`/`body` onto `primary_target`, returning
/// an axum [`Response`] built from whatever the primary answered. Like
/// `httputil.ReverseProxy`, hop-by-hop headers are stripped in both
/// directions rather than forwarded verbatim, since they describe the
/// client-to-proxy or proxy-to-primary connection, not the request itself.
async fn send_to_primary(
    client: &reqwest::Client,
    primary_target: &str,
    method: &Method,
    uri: &str,
    headers: &HeaderMap,
    body: bytes::Bytes,
) -> Result<Response, reqwest::Error> {
    let hop_by_hop = hop_by_hop();
    let outbound_headers: HeaderMap = headers
        .iter()
        .filter(|(name, _)| !hop_by_hop.contains(*name))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect();

    let url = format!("{primary_target}{uri}");
    let response = client
        .request(method.clone(), &url)
        .headers(outbound_headers)
        .body(body)
        .send()
        .await?;

    let status = response.status();
    let response_headers: HeaderMap = response
        .headers()
        .iter()
        .filter(|(name, _)| !hop_by_hop.contains(*name))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect();
    let body_bytes = response.bytes().await?;

    let mut builder = Response::builder().status(status);
    if let Some(response_builder_headers) = builder.headers_mut() {
        *response_builder_headers = response_headers;
    }
    Ok(builder.body(Body::from(body_bytes)).unwrap_or_else(|_| {
        Response::builder()
            .status(status)
            .body(Body::empty())
            .expect("building a response from a valid status never fails")
    }))
}

/// Lists every mirror with its state and queue stats, one line per mirror.
async fn targets_get(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Some(resp) = check_auth(&state, &headers) {
        return resp;
    }
    let mut out = String::new();
    for status in state.reflector.list_mirrors() {
        if status.state == MirrorState::Alive {
            out.push_str(&format!(
                "{}: alive -- queued: {} -- processed: {}\n",
                status.url, status.queued, status.watermark
            ));
            continue;
        }
        let state_name = match status.state {
            MirrorState::Alive => "alive",
            MirrorState::Retrying => "retrying",
            MirrorState::Failing => "failing",
        };
        let since = status
            .failing_since
            .map(instant_to_rfc3339)
            .unwrap_or_else(|| "unknown".to_string());
        out.push_str(&format!(
            "{}: {} (since: {}) -- queued: {} -- processed: {}\n",
            status.url, state_name, since, status.queued, status.watermark
        ));
    }
    (StatusCode::OK, out).into_response()
}

/// `Instant` carries no wall-clock epoch, so the RFC3339 timestamp is
/// computed relative to process start using `chrono`'s current time minus
/// the elapsed duration since the instant was recorded.
fn instant_to_rfc3339(instant: std::time::Instant) -> String {
    let elapsed = instant.elapsed();
    let now = chrono::Utc::now();
    let then = now
        - chrono::Duration::from_std(elapsed).unwrap_or_else(|_| chrono::Duration::zero());
    then.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

async fn targets_put(State(state): State<AppState>, req: AxumRequest) -> Response {
    if let Some(resp) = check_auth(&state, req.headers()) {
        return resp;
    }
    let (urls, persistent) = match extract_targets_form(req).await {
        Ok(form) => form,
        Err(resp) => return resp,
    };
    state.reflector.add_mirrors(&urls, persistent);
    StatusCode::OK.into_response()
}

async fn targets_delete(State(state): State<AppState>, req: AxumRequest) -> Response {
    if let Some(resp) = check_auth(&state, req.headers()) {
        return resp;
    }
    let (urls, _persistent) = match extract_targets_form(req).await {
        Ok(form) => form,
        Err(resp) => return resp,
    };
    state.reflector.remove_mirrors(&urls);
    StatusCode::OK.into_response()
}

/// Pulls repeated `url` values (and an optional `persistent` flag) from the
/// query string and, if present, an urlencoded form body.
async fn extract_targets_form(req: AxumRequest) -> Result<(Vec<String>, bool), Response> {
    let query = req.uri().query().unwrap_or("").to_string();
    let (_parts, body) = req.into_parts();
    let body_bytes = to_bytes(body, usize::MAX)
        .await
        .unwrap_or_else(|_| bytes::Bytes::new());

    let mut urls = Vec::new();
    let mut persistent = false;

    for (key, value) in url::form_urlencoded::parse(query.as_bytes())
        .chain(url::form_urlencoded::parse(&body_bytes))
    {
        match key.as_ref() {
            "url" => urls.push(value.to_string()),
            "persistent" => persistent = value.eq_ignore_ascii_case("true"),
            _ => {}
        }
    }

    if urls.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "Missing required field: 'url'.").into_response());
    }

    Ok((urls, persistent))
}

/// Checks HTTP Basic auth when credentials are configured, using
/// constant-time comparison for both username and password. Returns `None`
/// when the request may proceed.
fn check_auth(state: &AppState, headers: &HeaderMap) -> Option<Response> {
    let Some(credentials) = &state.credentials else {
        return None;
    };

    let unauthorized = || -> Response {
        let mut response = (StatusCode::UNAUTHORIZED, "Unauthorized.\n").into_response();
        response.headers_mut().insert(
            axum::http::header::WWW_AUTHENTICATE,
            HeaderValue::from_static(r#"Basic realm="Please provide username and password for changing mirror targets""#),
        );
        response
    };

    let Some(header) = headers.get(axum::http::header::AUTHORIZATION) else {
        return Some(unauthorized());
    };
    let Ok(header) = header.to_str() else {
        return Some(unauthorized());
    };
    let Some(encoded) = header.strip_prefix("Basic ") else {
        return Some(unauthorized());
    };
    let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(encoded) else {
        return Some(unauthorized());
    };
    let Ok(decoded) = String::from_utf8(decoded) else {
        return Some(unauthorized());
    };
    let Some((user, pass)) = decoded.split_once(':') else {
        return Some(unauthorized());
    };

    let user_ok: bool = user.as_bytes().ct_eq(credentials.username.as_bytes()).into();
    let pass_ok: bool = pass.as_bytes().ct_eq(credentials.password.as_bytes()).into();
    if user_ok && pass_ok {
        None
    } else {
        Some(unauthorized())
    }
}

/// Header names that must never be forwarded verbatim because the HTTP
/// client and server layers manage them on our behalf.
fn hop_by_hop() -> HashSet<HeaderName> {
    [
        axum::http::header::CONNECTION,
        axum::http::header::TRANSFER_ENCODING,
        HeaderName::from_static("keep-alive"),
        HeaderName::from_static("proxy-authenticate"),
        HeaderName::from_static("proxy-authorization"),
        HeaderName::from_static("te"),
        axum::http::header::TRAILER,
        axum::http::header::UPGRADE,
    ]
    .into_iter()
    .collect()
}
