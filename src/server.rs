//! Purpose: Loopback HTTP server for rendered notes and their live-reload sockets.
//! Exports: `ServerHandle`, `spawn`.
//! Role: Runs axum on a dedicated thread with its own tokio runtime so the synchronous
//! runtime API (and C callers) never need an executor of their own.
//! Invariants: `spawn` returns only after the listener is bound, with the bound address.
//! Invariants: Shutdown is graceful and bounded by `RuntimeConfig::shutdown_timeout`.
//! Invariants: Unknown or unparsable notes ids are `NotFound`, never a panic.

use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path as AxumPath, State};
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use serde_json::json;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::oneshot;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::config::RuntimeConfig;
use crate::core::error::{Error, ErrorKind};
use crate::core::notes::{Notes, NotesId};
use crate::core::registry::NotesRegistry;
use crate::static_files;

#[derive(Clone)]
struct AppState {
    registry: Arc<NotesRegistry>,
    addr: SocketAddr,
}

pub(crate) struct ServerHandle {
    shutdown: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl ServerHandle {
    pub(crate) fn shutdown(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("server thread panicked");
            }
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

pub(crate) fn spawn(
    config: &RuntimeConfig,
    registry: Arc<NotesRegistry>,
) -> Result<(SocketAddr, ServerHandle), Error> {
    let bind = SocketAddr::new(config.bind, config.port);
    let shutdown_timeout = config.shutdown_timeout;
    let (ready_tx, ready_rx) = mpsc::channel::<Result<SocketAddr, Error>>();
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

    let thread = thread::Builder::new()
        .name("mdnotes-server".to_string())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .thread_name("mdnotes-http")
                .build()
            {
                Ok(runtime) => runtime,
                Err(err) => {
                    let _ = ready_tx.send(Err(Error::new(ErrorKind::Internal)
                        .with_message("failed to start async runtime")
                        .with_source(err)));
                    return;
                }
            };
            runtime.block_on(run(bind, registry, ready_tx, shutdown_rx, shutdown_timeout));
            info!("server stopped, shutting down runtime");
        })
        .map_err(|err| {
            Error::new(ErrorKind::Internal)
                .with_message("failed to spawn server thread")
                .with_source(err)
        })?;

    let addr = match ready_rx.recv() {
        Ok(Ok(addr)) => addr,
        Ok(Err(err)) => {
            let _ = thread.join();
            return Err(err);
        }
        Err(_) => {
            let _ = thread.join();
            return Err(Error::new(ErrorKind::Internal)
                .with_message("server thread exited before reporting its address"));
        }
    };

    Ok((
        addr,
        ServerHandle {
            shutdown: Some(shutdown_tx),
            thread: Some(thread),
        },
    ))
}

async fn run(
    bind: SocketAddr,
    registry: Arc<NotesRegistry>,
    ready: mpsc::Sender<Result<SocketAddr, Error>>,
    shutdown: oneshot::Receiver<()>,
    shutdown_timeout: Duration,
) {
    let listener = match tokio::net::TcpListener::bind(bind).await {
        Ok(listener) => listener,
        Err(err) => {
            let _ = ready.send(Err(Error::new(ErrorKind::Io)
                .with_message(format!("failed to bind server to {bind}"))
                .with_source(err)));
            return;
        }
    };
    let addr = match listener.local_addr() {
        Ok(addr) => addr,
        Err(err) => {
            let _ = ready.send(Err(Error::new(ErrorKind::Io)
                .with_message("failed to read bound address")
                .with_source(err)));
            return;
        }
    };

    let app = router(AppState { registry, addr });

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let server = axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = stop_rx.await;
        })
        .into_future();
    tokio::pin!(server);

    info!(%addr, "server started");
    if ready.send(Ok(addr)).is_err() {
        return;
    }

    tokio::select! {
        result = &mut server => {
            if let Err(err) = result {
                error!("server failed: {err}");
            }
        }
        // a dropped handle counts as a shutdown request
        _ = shutdown => {
            let _ = stop_tx.send(());
            match tokio::time::timeout(shutdown_timeout, &mut server).await {
                Ok(Ok(())) => (),
                Ok(Err(err)) => error!("server failed: {err}"),
                Err(_) => warn!("server shutdown timed out"),
            }
        }
    }
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/v0/notes", get(list_notes))
        .route("/:id/static", get(static_redirect))
        .route("/:id/static/", get(static_index))
        .route("/:id/static/*tail", get(static_file))
        .route("/:id/ws", get(live_reload))
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::new(state))
}

async fn healthz() -> Response {
    json_response(json!({ "ok": true }))
}

async fn list_notes(State(state): State<Arc<AppState>>) -> Response {
    json_response(json!({ "notes": state.registry.summaries(state.addr) }))
}

async fn static_redirect(AxumPath(raw_id): AxumPath<String>) -> Response {
    Redirect::permanent(&format!("/{raw_id}/static/")).into_response()
}

async fn static_index(
    State(state): State<Arc<AppState>>,
    AxumPath(raw_id): AxumPath<String>,
) -> Response {
    serve_notes_file(&state, &raw_id, "").await
}

async fn static_file(
    State(state): State<Arc<AppState>>,
    AxumPath((raw_id, tail)): AxumPath<(String, String)>,
) -> Response {
    serve_notes_file(&state, &raw_id, &tail).await
}

async fn serve_notes_file(state: &AppState, raw_id: &str, tail: &str) -> Response {
    let notes = match lookup_notes(state, raw_id) {
        Ok(notes) => notes,
        Err(err) => return error_response(err),
    };
    let notes_id = notes.id();
    let html_dir = notes.html_dir().to_path_buf();
    // the collection may close while the file is read
    drop(notes);

    match static_files::serve_file(&html_dir, tail).await {
        Ok(response) => response,
        Err(err) => error_response(err.with_notes_id(notes_id)),
    }
}

async fn live_reload(
    State(state): State<Arc<AppState>>,
    AxumPath(raw_id): AxumPath<String>,
    ws: WebSocketUpgrade,
) -> Response {
    let receiver = match lookup_notes(&state, &raw_id) {
        Ok(notes) => Some(notes.subscribe()),
        Err(err) => {
            debug!("live reload for unknown notes: {err}");
            None
        }
    };
    ws.on_upgrade(move |socket| forward_reloads(socket, receiver))
}

async fn forward_reloads(mut socket: WebSocket, receiver: Option<broadcast::Receiver<String>>) {
    let Some(mut receiver) = receiver else {
        let _ = socket.send(Message::Close(None)).await;
        return;
    };

    loop {
        tokio::select! {
            event = receiver.recv() => match event {
                Ok(event) => {
                    if let Err(err) = socket.send(Message::Text(event)).await {
                        debug!("live reload send failed: {err}");
                        return;
                    }
                }
                // a lagging page only needs the latest reload
                Err(RecvError::Lagged(skipped)) => debug!(skipped, "live reload receiver lagged"),
                Err(RecvError::Closed) => break,
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return,
                Some(Ok(_)) => (),
            },
        }
    }

    let _ = socket.send(Message::Close(None)).await;
}

fn lookup_notes(state: &AppState, raw_id: &str) -> Result<Arc<Notes>, Error> {
    let notes_id = parse_notes_id(raw_id)?;
    state.registry.get(notes_id).ok_or_else(|| {
        Error::new(ErrorKind::NotFound)
            .with_message("no open notes with this id")
            .with_notes_id(notes_id)
    })
}

fn parse_notes_id(raw: &str) -> Result<NotesId, Error> {
    match raw.parse::<NotesId>() {
        Ok(0) | Err(_) => Err(Error::new(ErrorKind::NotFound)
            .with_message(format!("invalid notes id: {raw:?}"))),
        Ok(notes_id) => Ok(notes_id),
    }
}

#[derive(Debug, Serialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    kind: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    notes_id: Option<NotesId>,
}

fn json_response(payload: serde_json::Value) -> Response {
    let mut response = Json(payload).into_response();
    response
        .headers_mut()
        .insert("mdnotes-version", HeaderValue::from_static("0"));
    response
}

fn error_response(err: Error) -> Response {
    let status = match err.kind() {
        ErrorKind::Usage => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Busy => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::Permission => StatusCode::FORBIDDEN,
        ErrorKind::Build | ErrorKind::Io | ErrorKind::Internal => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    // paths stay in the logs, not in responses
    let body = ErrorEnvelope {
        error: ErrorBody {
            kind: format!("{:?}", err.kind()),
            message: err.message().unwrap_or("error").to_string(),
            notes_id: err.notes_id(),
        },
    };
    let mut response = (status, Json(body)).into_response();
    response
        .headers_mut()
        .insert("mdnotes-version", HeaderValue::from_static("0"));
    response
}
