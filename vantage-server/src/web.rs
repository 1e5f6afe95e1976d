//! HTTP control plane.
//!
//! JSON endpoints to start/stop streaming and recording per camera and to
//! list, inspect and remove the recorded files. Handlers mutate per-stream
//! intent through the registry and signal the workers over their command
//! channels; the record endpoints then poll the registry with a bounded
//! deadline so the caller gets a definitive answer or a typed timeout
//! instead of a dangling accepted-but-unknown state.

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use log::debug;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tokio::{net::TcpListener, sync::broadcast};
use tokio_graceful_shutdown::SubsystemHandle;

use vantage_core::{StartDecision, StopDecision, StreamRegistry, StreamState};
use vantage_server::capture::CaptureControl;
use vantage_server::files::{FileStore, FileStoreError};
use vantage_server::recorder::RecorderMsg;

const STREAM_START_URI: &str = "/stream/start";
const STREAM_STOP_URI: &str = "/stream/stop";
const STREAM_STATUS_URI: &str = "/stream/status";
const RECORD_START_URI: &str = "/record/start";
const RECORD_STOP_URI: &str = "/record/stop";
const FILES_LIST_URI: &str = "/files/list";
const FILES_STATUS_URI: &str = "/files/status";
const FILES_REMOVE_URI: &str = "/files/remove";

/// How long `/record/start` waits for the recorder to report a file.
const START_WAIT: Duration = Duration::from_millis(2000);
const START_POLL: Duration = Duration::from_millis(50);
/// How long `/record/stop` waits for the file to become known.
const STOP_WAIT: Duration = Duration::from_millis(1000);
const STOP_POLL: Duration = Duration::from_millis(25);

#[derive(Error, Debug)]
pub enum WebError {
    #[error("Socket operation failed")]
    Io(#[from] io::Error),
}

/// Per-stream worker handles the control plane signals into.
#[derive(Clone)]
pub struct StreamHandle {
    pub capture: CaptureControl,
    pub recorder: std::sync::mpsc::Sender<RecorderMsg>,
}

pub struct AppState {
    pub registry: StreamRegistry,
    pub streams: HashMap<String, StreamHandle>,
    pub store: FileStore,
}

pub struct Web {
    state: Arc<AppState>,
    port: u16,
    shutdown_tx: broadcast::Sender<()>,
}

impl Web {
    pub fn new(state: Arc<AppState>, port: u16) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Web {
            state,
            port,
            shutdown_tx,
        }
    }

    pub async fn run(self, subsys: SubsystemHandle) -> Result<(), WebError> {
        let listener = TcpListener::bind(SocketAddr::new(
            IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)),
            self.port,
        ))
        .await
        .map_err(WebError::Io)?;

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let shutdown_tx = self.shutdown_tx.clone();

        let app = router(self.state.clone());

        log::info!("HTTP control server listening on port {}", self.port);

        tokio::select! { biased;
            _ = subsys.on_shutdown_requested() => {
                let _ = shutdown_tx.send(());
            },
            r = axum::serve(listener, app)
                    .with_graceful_shutdown(async move {
                        _ = shutdown_rx.recv().await;
                    }) => {
                return r.map_err(WebError::Io);
            }
        }
        Ok(())
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route(STREAM_START_URI, post(stream_start))
        .route(STREAM_STOP_URI, post(stream_stop))
        .route(STREAM_STATUS_URI, get(stream_status))
        .route(RECORD_START_URI, post(record_start))
        .route(RECORD_STOP_URI, post(record_stop))
        .route(FILES_LIST_URI, get(files_list))
        .route(FILES_STATUS_URI, get(files_status))
        .route(FILES_REMOVE_URI, post(files_remove))
        .fallback(not_found)
        .with_state(state)
}

async fn not_found() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, "Not Found")
}

fn reply(status: StatusCode, body: serde_json::Value) -> Response {
    (status, Json(body)).into_response()
}

fn bad_request(message: &str) -> Response {
    reply(
        StatusCode::BAD_REQUEST,
        json!({"status": "failed", "message": message}),
    )
}

/// Pull `stream_id` out of a JSON request body.
fn parse_stream_id(body: &str) -> Result<String, Response> {
    let value: serde_json::Value = serde_json::from_str(body)
        .map_err(|e| bad_request(&format!("JSON parse error: {}", e)))?;
    value
        .get("stream_id")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(String::from)
        .ok_or_else(|| bad_request("Missing or invalid 'stream_id'"))
}

fn unknown_stream() -> Response {
    reply(
        StatusCode::NOT_FOUND,
        json!({"status": "failed", "message": "Unknown 'stream_id'"}),
    )
}

fn file_string(path: &std::path::Path) -> String {
    path.display().to_string()
}

fn utc_string(t: SystemTime) -> String {
    chrono::DateTime::<chrono::Utc>::from(t).to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

// ---------- Stream control ----------

async fn stream_start(State(state): State<Arc<AppState>>, body: String) -> Response {
    let id = match parse_stream_id(&body) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    debug!("POST {} for stream {}", STREAM_START_URI, id);

    match state.streams.get(&id) {
        Some(handle) => handle.capture.enable(),
        None => debug!("{}: stream start for unconfigured id", id),
    }
    reply(StatusCode::OK, json!({"status": "ok", "stream_id": id}))
}

async fn stream_stop(State(state): State<Arc<AppState>>, body: String) -> Response {
    let id = match parse_stream_id(&body) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    debug!("POST {} for stream {}", STREAM_STOP_URI, id);

    match state.streams.get(&id) {
        Some(handle) => handle.capture.disable(),
        None => debug!("{}: stream stop for unconfigured id", id),
    }
    reply(StatusCode::OK, json!({"status": "ok", "stream_id": id}))
}

#[derive(Deserialize)]
struct StatusQuery {
    stream_id: Option<String>,
}

fn stream_json(id: &str, state: &StreamState) -> serde_json::Value {
    json!({
        "stream_id": id,
        "streaming": state.streaming,
        "recording": state.recording,
        "file": state.last_file.as_deref().map(file_string),
    })
}

async fn stream_status(
    State(state): State<Arc<AppState>>,
    Query(query): Query<StatusQuery>,
) -> Response {
    if let Some(id) = query.stream_id {
        return match state.registry.snapshot_one(&id) {
            None => reply(
                StatusCode::NOT_FOUND,
                json!({"status": "not_found", "message": "Unknown stream_id"}),
            ),
            Some(entry) => reply(
                StatusCode::OK,
                json!({"status": "ok", "stream": stream_json(&id, &entry)}),
            ),
        };
    }

    let streams: Vec<_> = state
        .registry
        .snapshot()
        .iter()
        .map(|(id, entry)| stream_json(id, entry))
        .collect();
    reply(StatusCode::OK, json!({"status": "ok", "streams": streams}))
}

// ---------- Record control ----------

async fn record_start(State(state): State<Arc<AppState>>, body: String) -> Response {
    let id = match parse_stream_id(&body) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    debug!("POST {} for stream {}", RECORD_START_URI, id);

    if !state.registry.is_known(&id) {
        return unknown_stream();
    }

    match state.registry.try_begin_start(&id) {
        StartDecision::AlreadyRecording { file } => reply(
            StatusCode::OK,
            json!({
                "status": "ok",
                "message": "already recording",
                "file": file.as_deref().map(file_string),
            }),
        ),
        StartDecision::AlreadyPending => reply(
            StatusCode::ACCEPTED,
            json!({"status": "ok", "message": "start already pending"}),
        ),
        StartDecision::Proceed => {
            if let Some(handle) = state.streams.get(&id) {
                let _ = handle.recorder.send(RecorderMsg::Start);
            }

            // Wait, bounded, for the recorder to report a concrete file.
            let deadline = Instant::now() + START_WAIT;
            loop {
                if let Some(file) = state.registry.last_file(&id) {
                    return reply(
                        StatusCode::OK,
                        json!({
                            "status": "ok",
                            "stream_id": id,
                            "file": file_string(&file),
                        }),
                    );
                }
                if Instant::now() >= deadline {
                    // Roll back the staged intent so a retry is possible.
                    state.registry.cancel_start(&id);
                    return reply(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        json!({
                            "status": "failed",
                            "message": "timeout waiting for recording file to be created/known",
                            "file": null,
                        }),
                    );
                }
                tokio::time::sleep(START_POLL).await;
            }
        }
    }
}

async fn record_stop(State(state): State<Arc<AppState>>, body: String) -> Response {
    let id = match parse_stream_id(&body) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    debug!("POST {} for stream {}", RECORD_STOP_URI, id);

    if !state.registry.is_known(&id) {
        return unknown_stream();
    }

    match state.registry.try_begin_stop(&id) {
        StopDecision::NotRecording => reply(
            StatusCode::OK,
            json!({"status": "ok", "message": "not recording"}),
        ),
        StopDecision::Proceed => {
            if let Some(handle) = state.streams.get(&id) {
                let _ = handle.recorder.send(RecorderMsg::Stop);
            }

            let deadline = Instant::now() + STOP_WAIT;
            loop {
                if let Some(file) = state.registry.last_file(&id) {
                    return reply(
                        StatusCode::OK,
                        json!({
                            "status": "ok",
                            "stream_id": id,
                            "file": file_string(&file),
                        }),
                    );
                }
                if Instant::now() >= deadline {
                    return reply(
                        StatusCode::OK,
                        json!({
                            "status": "ok",
                            "file": null,
                            "message": "stop requested; recording file not yet known",
                        }),
                    );
                }
                tokio::time::sleep(STOP_POLL).await;
            }
        }
    }
}

// ---------- File endpoints ----------

#[derive(Deserialize)]
struct ListQuery {
    ext: Option<String>,
    all: Option<String>,
}

async fn files_list(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Response {
    let all = matches!(query.all.as_deref(), Some("1" | "true" | "yes"));
    let ext_filter = if all {
        None
    } else {
        Some(query.ext.unwrap_or_else(|| "mp4".to_string()))
    };

    match state.store.list(ext_filter.as_deref()) {
        Err(FileStoreError::NoBaseFolder) => reply(
            StatusCode::INTERNAL_SERVER_ERROR,
            json!({"status": "failed", "message": "Base folder does not exist"}),
        ),
        Err(e) => reply(
            StatusCode::INTERNAL_SERVER_ERROR,
            json!({"status": "failed", "message": e.to_string()}),
        ),
        Ok(files) => {
            let entries: Vec<_> = files
                .iter()
                .map(|f| {
                    json!({
                        "name": f.name,
                        "size_bytes": f.size_bytes,
                        "last_modified_utc": f.modified.map(utc_string),
                    })
                })
                .collect();
            reply(
                StatusCode::OK,
                json!({
                    "status": "ok",
                    "folder_base": state.store.base().display().to_string(),
                    "count": entries.len(),
                    "ext_filter": ext_filter,
                    "files": entries,
                }),
            )
        }
    }
}

#[derive(Deserialize)]
struct FileQuery {
    file: Option<String>,
}

async fn files_status(
    State(state): State<Arc<AppState>>,
    Query(query): Query<FileQuery>,
) -> Response {
    let Some(name) = query.file else {
        return bad_request("Missing or invalid 'file'");
    };
    if !FileStore::is_safe_basename(&name) {
        return bad_request("Invalid file name");
    }

    match state.store.stat(&name) {
        Err(FileStoreError::NotFound) => reply(
            StatusCode::NOT_FOUND,
            json!({"status": "failed", "message": "File not found"}),
        ),
        Err(FileStoreError::InvalidName) => bad_request("Invalid file name"),
        Err(e) => reply(
            StatusCode::INTERNAL_SERVER_ERROR,
            json!({"status": "failed", "message": e.to_string()}),
        ),
        Ok(status) => {
            let created = status.birth_time.or(status.modified).map(utc_string);
            let mut body = json!({
                "status": "ok",
                "file": status.name,
                "path": status.path.display().to_string(),
                "folder_base": state.store.base().display().to_string(),
                "size_bytes": status.size_bytes,
                "suffix": status.suffix,
                "last_modified_utc": status.modified.map(utc_string),
                "created_utc": created,
                "is_readable": status.is_readable,
            });
            if let Some(birth) = status.birth_time {
                body.as_object_mut()
                    .unwrap()
                    .insert("birth_time_utc".to_string(), json!(utc_string(birth)));
            }
            reply(StatusCode::OK, body)
        }
    }
}

async fn files_remove(
    State(state): State<Arc<AppState>>,
    Query(query): Query<FileQuery>,
    body: String,
) -> Response {
    // The name may arrive as a JSON body or as a query parameter.
    let from_body = serde_json::from_str::<serde_json::Value>(&body)
        .ok()
        .and_then(|v| v.get("file").and_then(|f| f.as_str()).map(String::from));
    let Some(name) = from_body.or(query.file) else {
        return bad_request("Missing or invalid 'file'");
    };
    if !FileStore::is_safe_basename(&name) {
        return bad_request("Invalid file name");
    }

    match state.store.remove(&name) {
        Ok(()) => reply(StatusCode::OK, json!({"status": "ok", "file": name})),
        Err(FileStoreError::NotFound) => reply(
            StatusCode::NOT_FOUND,
            json!({"status": "failed", "message": "File not found"}),
        ),
        Err(FileStoreError::InvalidName) => bad_request("Invalid file name"),
        Err(e) => reply(
            StatusCode::INTERNAL_SERVER_ERROR,
            json!({"status": "failed", "message": e.to_string()}),
        ),
    }
}
