//! Loopback-only local status API (§6): TCP 40557, bearer-authenticated
//! with `X-Controledu-LocalToken`. Exists for the desktop shell (an
//! external collaborator, §1) to read the agent's live state without
//! going through the hub, and to relay the one decision that genuinely
//! belongs to a human: approving or rejecting a pending remote-control
//! session (§4.9's `studentApprove`/`studentReject` transitions).

use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use controledu_core::discovery::STUDENT_LOCAL_PORT;
use controledu_core::storage::constant_time_eq;

#[derive(Debug, Clone, Serialize, Default)]
pub struct PendingRemoteControl {
    pub session_id: String,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct AgentStatusSnapshot {
    pub client_id: Option<String>,
    pub hub_connected: bool,
    pub last_heartbeat_utc: Option<i64>,
    pub last_detection_utc: Option<i64>,
    pub last_detection_positive: Option<bool>,
    pub current_fps: u32,
    pub current_jpeg_quality: u8,
    pub pending_remote_control: Option<PendingRemoteControl>,
}

/// One decision relayed from the shell back into the agent loop.
#[derive(Debug, Clone)]
pub struct RemoteControlDecision {
    pub session_id: String,
    pub approve: bool,
}

#[derive(Clone)]
struct LocalHttpState {
    local_token: String,
    status: Arc<Mutex<AgentStatusSnapshot>>,
    decisions: mpsc::UnboundedSender<RemoteControlDecision>,
}

/// Shared handle the main loop writes status into every iteration.
pub type StatusHandle = Arc<Mutex<AgentStatusSnapshot>>;

pub fn new_status_handle() -> StatusHandle {
    Arc::new(Mutex::new(AgentStatusSnapshot::default()))
}

/// Serve the local status API until the process exits. `local_token` is
/// generated once at startup (see `main.rs`) and never leaves the host.
/// Returns a receiver the main loop polls each iteration for
/// shell-relayed remote-control decisions.
pub fn spawn(local_token: String, status: StatusHandle) -> mpsc::UnboundedReceiver<RemoteControlDecision> {
    let (decisions_tx, decisions_rx) = mpsc::unbounded_channel();
    let state = LocalHttpState {
        local_token,
        status,
        decisions: decisions_tx,
    };

    tokio::spawn(async move {
        let app = Router::new()
            .route("/api/status", get(status_handler))
            .route("/api/remote-control/respond", post(respond_handler))
            .with_state(state);

        let addr = format!("127.0.0.1:{STUDENT_LOCAL_PORT}");
        match tokio::net::TcpListener::bind(&addr).await {
            Ok(listener) => {
                tracing::info!(addr = %addr, "local status API listening");
                if let Err(err) = axum::serve(listener, app).await {
                    tracing::error!(error = %err, "local status API exited");
                }
            }
            Err(err) => tracing::error!(error = %err, addr = %addr, "failed to bind local status API"),
        }
    });

    decisions_rx
}

fn authorize(state: &LocalHttpState, headers: &HeaderMap) -> bool {
    headers
        .get("X-Controledu-LocalToken")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|token| constant_time_eq(token.as_bytes(), state.local_token.as_bytes()))
}

async fn status_handler(State(state): State<LocalHttpState>, headers: HeaderMap) -> impl IntoResponse {
    if !authorize(&state, &headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    Json(state.status.lock().clone()).into_response()
}

#[derive(Debug, Deserialize)]
struct RemoteControlRespondRequest {
    session_id: String,
    approve: bool,
}

async fn respond_handler(
    State(state): State<LocalHttpState>,
    headers: HeaderMap,
    Json(request): Json<RemoteControlRespondRequest>,
) -> impl IntoResponse {
    if !authorize(&state, &headers) {
        return StatusCode::UNAUTHORIZED;
    }
    let delivered = state
        .decisions
        .send(RemoteControlDecision {
            session_id: request.session_id,
            approve: request.approve,
        })
        .is_ok();
    if delivered {
        StatusCode::ACCEPTED
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    }
}
