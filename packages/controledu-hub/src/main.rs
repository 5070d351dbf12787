//! Controledu teacher hub: pairing, bidirectional RPC, file transfer, and
//! LAN discovery, served from a single process (§6).

mod discovery_responder;
mod http;
mod state;
mod transfer;
mod ws_student;
mod ws_teacher;

use std::sync::Arc;

use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::{delete, get, post, put};
use axum::Router;
use clap::Parser;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use controledu_core::discovery::HUB_PORT;
use controledu_core::identity::ServerIdentity;

use state::{AppState, HubConfig};
use transfer::TransferManager;

#[derive(Parser, Debug)]
#[command(name = "controledu-hub", about = "Controledu teacher hub server")]
struct Args {
    /// TCP port serving the HTTP API and both hub websockets.
    #[arg(long, env = "CONTROLEDU_HUB_PORT", default_value_t = HUB_PORT)]
    port: u16,

    /// Directory holding the SQLite store, transfer chunks, and exports.
    #[arg(long, env = "CONTROLEDU_DATA_DIR", default_value = "./controledu-data")]
    data_dir: String,

    /// Human-facing name for this classroom's hub, shown to discovery
    /// probes and in pairing responses.
    #[arg(long, env = "CONTROLEDU_SERVER_NAME", default_value = "Controledu Classroom")]
    server_name: String,

    /// Disable the UDP discovery responder (useful on restricted networks).
    #[arg(long, env = "CONTROLEDU_NO_DISCOVERY")]
    no_discovery: bool,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "controledu_hub=info,tower_http=info".into()),
        )
        .init();

    let args = Args::parse();

    std::fs::create_dir_all(&args.data_dir).expect("failed to create data directory");
    let db_path = format!("{}/controledu.db", args.data_dir);
    let store = controledu_core::storage::Store::open(Some(&db_path)).expect("failed to open store");

    let identity = load_or_create_identity(&store, &args.server_name);
    tracing::info!(
        server_id = identity.server_id.as_str(),
        fingerprint = identity.fingerprint.as_str(),
        "hub identity ready"
    );

    let config = HubConfig {
        port: args.port,
        data_dir: args.data_dir.clone(),
        display_name: args.server_name.clone(),
        discovery_port: controledu_core::discovery::DISCOVERY_PORT,
    };
    let transfers = TransferManager::new(args.data_dir.clone());
    let app_state = Arc::new(AppState::new(config, store, identity.clone(), transfers));

    // Sweep expired pairing PINs periodically so the table never grows
    // unbounded across a long-running classroom session.
    let pin_sweep_state = app_state.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(30));
        loop {
            interval.tick().await;
            pin_sweep_state.pins.sweep_expired();
        }
    });

    if !args.no_discovery {
        let server_id = identity.server_id.clone();
        let server_name = identity.display_name.clone();
        let hub_port = args.port;
        tokio::spawn(async move {
            if let Err(err) = discovery_responder::run(hub_port, server_id, server_name).await {
                tracing::error!(error = %err, "discovery responder exited");
            }
        });
    } else {
        tracing::info!("discovery responder disabled");
    }

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([axum::http::Method::GET, axum::http::Method::POST, axum::http::Method::PUT, axum::http::Method::DELETE])
        .allow_headers(Any);

    let app = Router::new()
        .route("/ws/student", get(student_ws_handler))
        .route("/ws/teacher", get(teacher_ws_handler))
        .route("/api/server/health", get(http::health))
        .route("/api/server/identity", get(http::identity))
        .route("/api/pairing/pin", post(http::pairing_pin))
        .route("/api/pairing/complete", post(http::pairing_complete))
        .route("/api/audit/latest", get(http::audit_latest))
        .route("/api/detection/settings", get(http::get_detection_settings).put(http::put_detection_settings))
        .route("/api/detection/events", get(http::detection_events))
        .route("/api/files/upload/init", post(http::init_upload))
        .route("/api/files/upload/:transfer_id/chunk/:index", put(http::upload_chunk))
        .route("/api/files/:transfer_id/dispatch", post(http::dispatch_transfer))
        .route("/api/files/:transfer_id/missing", post(http::missing_chunks))
        .route("/api/files/:transfer_id/chunk/:index", get(http::download_chunk))
        .route("/api/detection/exports/upload", post(http::upload_export))
        .route("/api/detection/exports/list", get(http::list_exports))
        .route("/api/detection/exports/download/:export_id", get(http::download_export))
        .route("/api/students/:client_id", delete(http::revoke_student))
        .route("/api/students/:client_id/tts", post(http::send_tts))
        .route("/api/students/:client_id/chat", post(http::send_teacher_chat))
        .route("/api/students/:client_id/accessibility-profile", post(http::assign_accessibility_profile))
        .with_state(app_state)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    let addr = format!("0.0.0.0:{}", args.port);
    tracing::info!(addr = addr.as_str(), "controledu hub starting");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .unwrap_or_else(|err| panic!("failed to bind {addr}: {err}"));

    axum::serve(listener, app).await.expect("hub server error");
}

async fn student_ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| ws_student::handle(socket, state))
}

async fn teacher_ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| ws_teacher::handle(socket, state))
}

/// Load the persisted server identity, or mint and persist a new one on
/// first run (§4.5).
fn load_or_create_identity(store: &controledu_core::storage::Store, display_name: &str) -> ServerIdentity {
    if let Some(raw) = store.get_setting("server_identity").expect("failed to read server_identity setting") {
        if let Ok(identity) = serde_json::from_str::<ServerIdentity>(&raw) {
            return identity;
        }
    }

    let identity = ServerIdentity::generate(display_name);
    let raw = serde_json::to_string(&identity).expect("ServerIdentity always serializes");
    store.set_setting("server_identity", &raw).expect("failed to persist server_identity");
    identity
}
