//! HTTP dispatcher: WebDriver session create/proxy/delete plus the VNC,
//! logs, status and health endpoints.

use std::collections::BTreeMap;

use axum::{
    body::{Body, Bytes},
    extract::{
        ws::{Message, WebSocket},
        Path, Request, State, WebSocketUpgrade,
    },
    http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{any, get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{info, warn};

use crate::capabilities::{generate_session_id, parse_new_session};
use crate::errors::{HubError, PlatformError};
use crate::platform::{ServiceSpec, ServiceStatus, VNC_PORT};
use crate::state::{spawn_idle_timer, AppState, SessionRegistry};

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/wd/hub/session", post(create_session))
        .route("/wd/hub/session/:id", any(proxy_session_root))
        .route("/wd/hub/session/:id/*path", any(proxy_session_path))
        .route("/vnc/:id", get(vnc_session))
        .route("/logs/:id", get(session_logs))
        .route("/status", get(hub_status))
        .route("/healthz", get(healthz))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "OK"
}

// --- session create ---

async fn create_session(State(state): State<AppState>, body: Bytes) -> Response {
    match create_session_inner(&state, body).await {
        Ok(response) => response,
        Err(err) => {
            warn!(error = %err, "session create failed");
            error_response(&err)
        }
    }
}

async fn create_session_inner(state: &AppState, body: Bytes) -> Result<Response, HubError> {
    let caps = parse_new_session(&body)?;

    // The slot is claimed before the slow create and given back on any
    // failure path via the reservation's drop.
    let reservation = state.registry.reserve()?;

    let template = state.catalog.find(&caps.browser_name, &caps.browser_version)?;
    let session_id = generate_session_id(&template.browser_name, &template.browser_version);
    info!(
        session_id = %session_id,
        browser = %template.browser_name,
        version = %template.browser_version,
        "starting session"
    );

    let service = state
        .platform
        .create(ServiceSpec {
            session_id: session_id.clone(),
            requested_capabilities: caps,
            template,
        })
        .await
        .map_err(HubError::Platform)?;

    // Forward the client's new-session request to the sidecar so the browser
    // actually opens a session, then stamp the hub's id onto the reply.
    let upstream_url = format!("{}/wd/hub/session", service.url);
    let forwarded = async {
        let response = state
            .client
            .post(&upstream_url)
            .header(header::CONTENT_TYPE, "application/json")
            .body(body.clone())
            .send()
            .await?;
        let status = response.status();
        let payload = response.bytes().await?;
        Ok::<_, reqwest::Error>((status, payload))
    }
    .await;

    let (status, payload) = match forwarded {
        Ok(result) => result,
        Err(err) => {
            state.platform.delete(&session_id).await.ok();
            return Err(HubError::Platform(PlatformError::ServiceUnreachable(
                err.to_string(),
            )));
        }
    };

    if !status.is_success() {
        warn!(session_id = %session_id, status = %status, "browser rejected the session request");
        state.platform.delete(&session_id).await.ok();
        let mut response = Response::new(Body::from(payload));
        *response.status_mut() = status;
        response
            .headers_mut()
            .insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        return Ok(response);
    }

    let payload = rewrite_session_id(&payload, &session_id);

    // Commit before replying so a follow-up request cannot miss the entry.
    let timer = spawn_idle_timer(state, session_id.clone());
    reservation.commit(service, Some(timer));
    info!(session_id = %session_id, "session started");

    Ok((
        [(header::CONTENT_TYPE, HeaderValue::from_static("application/json"))],
        payload,
    )
        .into_response())
}

/// Stamp the hub's session id onto the upstream reply, accepting both the
/// W3C (`value.sessionId`) and JSON-Wire (top-level `sessionId`) shapes.
fn rewrite_session_id(payload: &[u8], session_id: &str) -> Vec<u8> {
    let mut body: Value = match serde_json::from_slice(payload) {
        Ok(value) => value,
        Err(_) => return payload.to_vec(),
    };

    let mut top_level = false;
    if let Some(obj) = body.as_object_mut() {
        if obj.contains_key("sessionId") {
            obj.insert(
                "sessionId".to_string(),
                Value::String(session_id.to_string()),
            );
            top_level = true;
        }
        if let Some(value) = obj.get_mut("value").and_then(Value::as_object_mut) {
            if value.contains_key("sessionId") || !top_level {
                value.insert(
                    "sessionId".to_string(),
                    Value::String(session_id.to_string()),
                );
            }
        }
    }

    serde_json::to_vec(&body).unwrap_or_else(|_| payload.to_vec())
}

// --- session proxy ---

async fn proxy_session_root(
    State(state): State<AppState>,
    Path(id): Path<String>,
    req: Request,
) -> Response {
    if req.method() == Method::DELETE {
        return delete_session(state, id, req).await;
    }
    dispatch_session(state, id, req).await
}

async fn proxy_session_path(
    State(state): State<AppState>,
    Path((id, _rest)): Path<(String, String)>,
    req: Request,
) -> Response {
    dispatch_session(state, id, req).await
}

/// Session delete is idempotent: the single lookup below is the only
/// presence check, so an idle reap, a watch eviction, or a second client
/// delete racing this request makes the loser a no-op, never an error.
async fn delete_session(state: AppState, session_id: String, req: Request) -> Response {
    let Some(service) = state.registry.get(&session_id) else {
        state.terminate_session(&session_id).await;
        return Json(serde_json::json!({"value": null})).into_response();
    };

    let response = proxy_request(&state, &service.url, req).await;
    info!(session_id = %session_id, "session deleted by client");
    state.terminate_session(&session_id).await;
    response
}

async fn dispatch_session(state: AppState, session_id: String, req: Request) -> Response {
    let Some(service) = state.registry.get(&session_id) else {
        return error_response(&HubError::UnknownSession(session_id));
    };
    state.registry.touch(&session_id);
    proxy_request(&state, &service.url, req).await
}

/// Stream one request to the pod's sidecar and its response back, dropping
/// hop-by-hop headers in both directions.
async fn proxy_request(state: &AppState, base_url: &str, req: Request) -> Response {
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| req.uri().path().to_string());
    let url = format!("{base_url}{path_and_query}");
    let method = req.method().clone();

    let mut forwarded = HeaderMap::new();
    for (name, value) in req.headers() {
        if is_hop_by_hop(name) || name == header::HOST {
            continue;
        }
        forwarded.append(name.clone(), value.clone());
    }

    let body = reqwest::Body::wrap_stream(req.into_body().into_data_stream());
    let upstream = state.client.request(method, url).headers(forwarded).body(body);
    match upstream.send().await {
        Ok(response) => {
            let status = response.status();
            let mut headers = HeaderMap::new();
            for (name, value) in response.headers() {
                if !is_hop_by_hop(name) {
                    headers.append(name.clone(), value.clone());
                }
            }
            let mut out = Response::new(Body::from_stream(response.bytes_stream()));
            *out.status_mut() = status;
            *out.headers_mut() = headers;
            out
        }
        Err(err) => {
            warn!(error = %err, "proxying to session pod failed");
            error_response(&HubError::Platform(PlatformError::ServiceUnreachable(
                err.to_string(),
            )))
        }
    }
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
    )
}

// --- VNC ---

async fn vnc_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(service) = state.registry.get(&id) else {
        return error_response(&HubError::UnknownSession(id));
    };
    let Some(host) = reqwest::Url::parse(&service.url)
        .ok()
        .and_then(|url| url.host_str().map(str::to_string))
    else {
        return error_response(&HubError::Platform(PlatformError::ServiceUnreachable(
            format!("malformed service url {}", service.url),
        )));
    };
    state.registry.touch(&id);
    let registry = state.registry.clone();
    ws.on_upgrade(move |socket| bridge_vnc(socket, host, id, registry))
}

/// Pump bytes between the client websocket and the pod's VNC port. Viewer
/// input counts as session activity so a watched session does not idle out
/// under the client's cursor.
async fn bridge_vnc(socket: WebSocket, host: String, session_id: String, registry: SessionRegistry) {
    let address = format!("{host}:{VNC_PORT}");
    let tcp = match TcpStream::connect(&address).await {
        Ok(stream) => stream,
        Err(err) => {
            warn!(session_id = %session_id, address = %address, error = %err, "vnc connect failed");
            return;
        }
    };
    info!(session_id = %session_id, address = %address, "vnc session established");

    let (mut tcp_read, mut tcp_write) = tcp.into_split();
    let (mut ws_write, mut ws_read) = socket.split();

    let mut to_client = tokio::spawn(async move {
        let mut buf = vec![0u8; 8192];
        loop {
            match tcp_read.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if ws_write.send(Message::Binary(buf[..n].to_vec())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let mut to_pod = tokio::spawn({
        let session_id = session_id.clone();
        async move {
            while let Some(Ok(message)) = ws_read.next().await {
                match message {
                    Message::Binary(data) => {
                        registry.touch(&session_id);
                        if tcp_write.write_all(&data).await.is_err() {
                            break;
                        }
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
        }
    });

    tokio::select! {
        _ = (&mut to_client) => to_pod.abort(),
        _ = (&mut to_pod) => to_client.abort(),
    }
    info!(session_id = %session_id, "vnc session closed");
}

// --- logs ---

async fn session_logs(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    if !state.registry.contains(&id) {
        return error_response(&HubError::UnknownSession(id));
    }
    match state.platform.logs(&id, true).await {
        Ok(stream) => {
            let mut response = Response::new(Body::from_stream(stream));
            response
                .headers_mut()
                .insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));
            response
        }
        Err(err) => error_response(&HubError::Platform(err)),
    }
}

// --- status ---

#[derive(Serialize)]
struct HubStatus {
    total: usize,
    pending: usize,
    running: usize,
    sessions: Vec<SessionView>,
    browsers: BTreeMap<String, Vec<String>>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SessionView {
    session_id: String,
    url: String,
    status: ServiceStatus,
    started: DateTime<Utc>,
    uptime: String,
}

async fn hub_status(State(state): State<AppState>) -> Json<HubStatus> {
    let now = Utc::now();
    let mut pending = 0;
    let mut running = 0;
    let sessions = state
        .registry
        .list()
        .into_iter()
        .map(|service| {
            match service.status {
                ServiceStatus::Pending => pending += 1,
                ServiceStatus::Running => running += 1,
                ServiceStatus::Unknown => {}
            }
            SessionView {
                uptime: format_uptime(now.signed_duration_since(service.started)),
                session_id: service.session_id,
                url: service.url,
                status: service.status,
                started: service.started,
            }
        })
        .collect();

    Json(HubStatus {
        total: state.config.limit,
        pending,
        running,
        sessions,
        browsers: state.catalog.browsers(),
    })
}

fn format_uptime(elapsed: chrono::Duration) -> String {
    let total = elapsed.num_seconds().max(0);
    let (hours, minutes, seconds) = (total / 3600, (total % 3600) / 60, total % 60);
    if hours > 0 {
        format!("{hours}h{minutes}m{seconds}s")
    } else if minutes > 0 {
        format!("{minutes}m{seconds}s")
    } else {
        format!("{seconds}s")
    }
}

// --- errors ---

fn error_response(err: &HubError) -> Response {
    let status = err.http_status();
    let body = serde_json::json!({
        "value": {
            "error": err.error_code(),
            "message": err.to_string(),
        }
    });
    let mut response = (status, Json(body)).into_response();
    if status == StatusCode::TOO_MANY_REQUESTS {
        response
            .headers_mut()
            .insert(header::RETRY_AFTER, HeaderValue::from_static("10"));
    }
    response
}
