//! Controledu student agent: locates a teacher hub, pairs once via PIN,
//! then runs the cooperative main loop (§4.10) that streams frames,
//! heartbeats, runs local detection, and dispatches commands.

mod agent;
mod capture;
mod detection_runner;
mod discovery_client;
mod hub_client;
mod input;
mod local_http;
mod pairing_client;
mod state;
mod transfer_client;

use clap::Parser;

use controledu_core::detection::DetectionPolicy;
use controledu_core::secret_store::platform_protector;
use controledu_core::storage::Store;

use agent::{AgentLoop, PendingPairing};
use capture::SyntheticFrameSource;
use detection_runner::{DetectionRunner, MlModelPaths};
use input::NoOpInjector;
use state::AgentConfig;

#[derive(Parser, Debug)]
#[command(name = "controledu-agent", about = "Controledu student endpoint agent")]
struct Args {
    /// Directory holding the SQLite store and downloaded files. Defaults
    /// to a platform-appropriate shared data path (§6) when omitted.
    #[arg(long, env = "CONTROLEDU_AGENT_DATA_DIR")]
    data_dir: Option<String>,

    /// Display name for this device, shown to the teacher console.
    #[arg(long, env = "CONTROLEDU_HOST_NAME")]
    host_name: Option<String>,

    /// Logged-in user name, shown to the teacher console.
    #[arg(long, env = "CONTROLEDU_USER_NAME")]
    user_name: Option<String>,

    /// One-time pairing PIN. When supplied alongside an unbound device,
    /// the agent pairs once on startup and then never asks again.
    #[arg(long, env = "CONTROLEDU_PAIR_PIN")]
    pair_pin: Option<String>,

    /// Teacher hub base URL (e.g. `http://192.168.1.5:40556`). When
    /// omitted, the agent runs a discovery probe to find one.
    #[arg(long, env = "CONTROLEDU_SERVER_URL", default_value = "")]
    server_url: String,

    /// Frame capture width in pixels.
    #[arg(long, default_value_t = 960)]
    capture_width: u32,

    /// Frame capture height in pixels.
    #[arg(long, default_value_t = 540)]
    capture_height: u32,

    #[arg(long, default_value_t = 2)]
    min_fps: u32,
    #[arg(long, default_value_t = 8)]
    max_fps: u32,
    #[arg(long, default_value_t = 35)]
    min_jpeg_quality: u8,
    #[arg(long, default_value_t = 80)]
    max_jpeg_quality: u8,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "controledu_agent=info".into()),
        )
        .init();

    let args = Args::parse();

    let data_dir = args.data_dir.clone().unwrap_or_else(default_data_dir);
    std::fs::create_dir_all(&data_dir).expect("failed to create agent data directory");

    let config = AgentConfig {
        data_dir: data_dir.into(),
        host_name: args.host_name.clone().unwrap_or_else(default_host_name),
        user_name: args.user_name.clone().unwrap_or_else(default_user_name),
        os_description: default_os_description(),
        capture_width: args.capture_width,
        capture_height: args.capture_height,
        min_fps: args.min_fps,
        max_fps: args.max_fps,
        min_jpeg_quality: args.min_jpeg_quality,
        max_jpeg_quality: args.max_jpeg_quality,
    };

    let db_path = config.db_path();
    let db_path_str = db_path.to_string_lossy().into_owned();
    let store = Store::open(Some(&db_path_str)).expect("failed to open agent store");

    let protector = platform_protector();
    if !protector.is_opaque() {
        tracing::warn!(
            name = protector.name(),
            "secret protector is not opaque on this platform; binding token is stored unencrypted"
        );
    }

    let status = local_http::new_status_handle();
    let local_token = uuid::Uuid::new_v4().to_string();
    tracing::info!("local status API token (for the desktop shell): {local_token}");
    let remote_control_decisions = local_http::spawn(local_token, status.clone());

    let pending_pairing = args.pair_pin.map(|pin| PendingPairing {
        server_base_url: args.server_url,
        pin,
    });

    let model_paths = MlModelPaths {
        binary_model_path: config.data_dir.join("models").join("binary.onnx"),
        multiclass_model_path: config.data_dir.join("models").join("multiclass.onnx"),
    };
    let detection = DetectionRunner::new(DetectionPolicy::production(), model_paths);

    let agent_loop = AgentLoop::new(
        config,
        store,
        protector,
        Box::new(SyntheticFrameSource::default()),
        Box::new(NoOpInjector::default()),
        detection,
        status,
        remote_control_decisions,
        pending_pairing,
    );

    if let Err(err) = agent_loop.run().await {
        tracing::error!(error = %err, "agent loop exited with a fatal error");
        std::process::exit(1);
    }
}

fn default_host_name() -> String {
    std::env::var("COMPUTERNAME")
        .or_else(|_| std::env::var("HOSTNAME"))
        .unwrap_or_else(|_| "unknown-host".to_string())
}

fn default_user_name() -> String {
    std::env::var("USERNAME")
        .or_else(|_| std::env::var("USER"))
        .unwrap_or_else(|_| "unknown-user".to_string())
}

fn default_os_description() -> String {
    format!("{} {}", std::env::consts::OS, std::env::consts::ARCH)
}

/// Platform-appropriate shared data path (§6), falling back to a
/// relative directory when the platform data-dir cannot be resolved
/// (e.g. a minimal container with no `$HOME`).
fn default_data_dir() -> String {
    dirs::data_dir()
        .map(|dir| dir.join("Controledu").join("Agent"))
        .map(|path| path.to_string_lossy().into_owned())
        .unwrap_or_else(|| "./controledu-agent-data".to_string())
}
