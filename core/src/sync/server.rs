//! HTTP listener for heartbeat pings and clipboard pushes
//!
//! Every request to any path is handled the same way:
//! - `POST` with `PING: PING` -> `200 PONG`, adopting the `IP:` address as
//!   peer when none is known
//! - `POST` with any other body -> clipboard write, `200 {"status":"OK"}`
//!   or `500 {"status":"<error>"}`
//! - anything else -> `400 {"error":...}`

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::clipboard::ClipboardStore;
use crate::protocol::constants::PONG_BODY;
use crate::protocol::{parse_ping, ErrorBody, StatusBody};
use crate::service::{EventSink, SyncEvent, SyncSource};
use crate::sync::tracker::PeerTracker;
use crate::{Error, Result};

/// Grace period for in-flight requests on stop
const STOP_GRACE: Duration = Duration::from_secs(1);

#[derive(Clone)]
struct PushState {
    tracker: PeerTracker,
    clipboard: Arc<dyn ClipboardStore>,
    events: EventSink,
}

/// Bound, not yet serving, push listener
pub struct PushServer {
    listener: TcpListener,
    port: u16,
}

impl PushServer {
    /// Bind to a port and create the server
    pub async fn bind(port: u16) -> Result<Self> {
        let addr: SocketAddr = ([0, 0, 0, 0], port).into();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::Network(format!("failed to bind: {}", e)))?;

        let actual_port = listener
            .local_addr()
            .map_err(|e| Error::Network(e.to_string()))?
            .port();

        tracing::info!("push server listening on port {}", actual_port);

        Ok(Self {
            listener,
            port: actual_port,
        })
    }

    /// Get the port we're listening on
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Start serving. Each connection is handled on its own task.
    pub fn start(
        self,
        tracker: PeerTracker,
        clipboard: Arc<dyn ClipboardStore>,
        events: EventSink,
    ) -> PushServerHandle {
        let app = router(PushState {
            tracker,
            clipboard,
            events,
        });
        let (shutdown, shutdown_rx) = oneshot::channel::<()>();

        let task = tokio::spawn(async move {
            let serve = axum::serve(
                self.listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            });

            if let Err(e) = serve.await {
                tracing::error!("push server error: {}", e);
            }
        });

        PushServerHandle {
            port: self.port,
            shutdown,
            task,
        }
    }
}

/// Handle to the running push server
pub struct PushServerHandle {
    port: u16,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl PushServerHandle {
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Stop accepting, give in-flight requests a short grace period, then
    /// close.
    pub async fn stop(self) -> Result<()> {
        let PushServerHandle {
            shutdown, mut task, ..
        } = self;
        let _ = shutdown.send(());

        match tokio::time::timeout(STOP_GRACE, &mut task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(Error::Network(format!("push server task failed: {}", e))),
            Err(_) => {
                tracing::debug!("push server did not drain in time, aborting");
                task.abort();
            }
        }

        tracing::info!("push server stopped");
        Ok(())
    }
}

fn router(state: PushState) -> Router {
    Router::new().fallback(handle_request).with_state(state)
}

async fn handle_request(
    State(state): State<PushState>,
    ConnectInfo(from): ConnectInfo<SocketAddr>,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if method != Method::POST {
        return (
            StatusCode::BAD_REQUEST,
            Json(ErrorBody::new("Only POST requests are allowed")),
        )
            .into_response();
    }

    if let Some(ping) = parse_ping(&headers) {
        tracing::debug!("received PING from {}", from);
        match ping.reply_to {
            Some(addr) => {
                if state.tracker.try_set(addr).await {
                    tracing::info!("adopted peer {} from PING", addr);
                }
            }
            None => tracing::debug!("PING from {} without a usable IP header", from),
        }
        return (StatusCode::OK, PONG_BODY).into_response();
    }

    let text = match String::from_utf8(body.to_vec()) {
        Ok(text) => text,
        Err(_) => {
            tracing::debug!("dropping non-UTF-8 push from {}", from);
            return (
                StatusCode::BAD_REQUEST,
                Json(StatusBody::failed("body is not valid UTF-8")),
            )
                .into_response();
        }
    };

    match state.clipboard.write(&text) {
        Ok(()) => {
            tracing::info!("pasted clipboard from {}", from);
            state.events.emit(SyncEvent::ClipboardReceived {
                source: SyncSource::Peer(from),
                text,
            });
            (StatusCode::OK, Json(StatusBody::ok())).into_response()
        }
        Err(e) => {
            tracing::warn!("error while setting clipboard data: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(StatusBody::failed(e.to_string())),
            )
                .into_response()
        }
    }
}
