//! Non-hub HTTP surface (§6): health/identity, pairing, audit, detection
//! settings/events, file transfer, detection exports, and teacher-driven
//! per-student actions.

use std::path::{Path as FsPath, PathBuf};
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use base64::Engine as _;
use serde::Deserialize;

use controledu_core::detection::DetectionPolicy;
use controledu_core::error::Error as CoreError;
use controledu_core::pairing::{mint_client_id, mint_token};
use controledu_core::protocol::{
    AccessibilityProfileAssignment, DispatchRequest, DispatchResponse, HealthResponse,
    InitUploadRequest, InitUploadResponse, MissingChunksRequest, MissingChunksResponse,
    PairingPinResponse, PairingRequest, PairingResponse, StudentHubEvent, TeacherHubEvent,
};
use controledu_core::registry::{ChatMessage, SenderRole};
use controledu_core::storage::PairedClient;
use controledu_core::time::{now_iso8601, now_timestamp};

use crate::state::AppState;

/// Newtype so `core::Error` can satisfy axum's `IntoResponse`.
pub struct ApiError(CoreError);

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            CoreError::InvalidToken | CoreError::InvalidPairingPin => StatusCode::UNAUTHORIZED,
            CoreError::ChunkHashMismatch { .. }
            | CoreError::FileHashMismatch
            | CoreError::ChunkIndexOutOfRange { .. }
            | CoreError::ChunkCountMismatch { .. }
            | CoreError::ChunkGap { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            CoreError::MalformedPayload(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(serde_json::json!({ "error": self.0.to_string(), "code": self.0.code() }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

// ---------------------------------------------------------------------------
// Server identity / health
// ---------------------------------------------------------------------------

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".into(),
        utc: now_iso8601(),
    })
}

pub async fn identity(State(state): State<Arc<AppState>>) -> Json<controledu_core::identity::ServerIdentity> {
    Json(state.identity.clone())
}

// ---------------------------------------------------------------------------
// Pairing (§4.5)
// ---------------------------------------------------------------------------

pub async fn pairing_pin(State(state): State<Arc<AppState>>) -> Json<PairingPinResponse> {
    let pin = state.pins.generate();
    Json(PairingPinResponse {
        pin: pin.pin,
        expires_at_utc: pin.expires_at_utc,
    })
}

pub async fn pairing_complete(
    State(state): State<Arc<AppState>>,
    Json(request): Json<PairingRequest>,
) -> ApiResult<Json<PairingResponse>> {
    if !state.pins.try_consume(&request.pin) {
        return Err(CoreError::InvalidPairingPin.into());
    }

    let client_id = mint_client_id();
    let token = mint_token();
    let now = now_timestamp();
    let client = PairedClient {
        client_id: client_id.clone(),
        token: token.clone(),
        host_name: request.host_name,
        user_name: request.user_name,
        os_description: request.os_description,
        local_ip: request.local_ip,
        created_at: now,
        token_expires_at: now + 3600 * 24 * 365,
    };
    state.store.upsert_paired_client(&client)?;
    state.audit("pairing_complete", &client_id, None);

    Ok(Json(PairingResponse {
        server_id: state.identity.server_id.clone(),
        server_name: state.identity.display_name.clone(),
        base_url: format!("http://0.0.0.0:{}", state.config.port),
        fingerprint: state.identity.fingerprint.clone(),
        client_id,
        token,
        expires_at_utc: client.token_expires_at,
    }))
}

// ---------------------------------------------------------------------------
// Audit / detection settings / detection events
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct TakeQuery {
    #[serde(default = "default_take")]
    pub take: u32,
}

fn default_take() -> u32 {
    100
}

pub async fn audit_latest(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TakeQuery>,
) -> ApiResult<Json<Vec<controledu_core::storage::AuditEntry>>> {
    Ok(Json(state.store.list_audit(query.take)?))
}

pub async fn get_detection_settings(State(state): State<Arc<AppState>>) -> Json<DetectionPolicy> {
    Json(state.persisted_policy())
}

pub async fn put_detection_settings(
    State(state): State<Arc<AppState>>,
    Json(policy): Json<DetectionPolicy>,
) -> Json<DetectionPolicy> {
    state.set_persisted_policy(policy.clone());
    state.broadcast_to_teachers(TeacherHubEvent::DetectionPolicyUpdated { policy: policy.clone() });
    Json(policy)
}

pub async fn detection_events(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TakeQuery>,
) -> Json<Vec<controledu_core::registry::AlertEvent>> {
    Json(state.alerts.latest(query.take as usize))
}

// ---------------------------------------------------------------------------
// File transfer (§4.8)
// ---------------------------------------------------------------------------

pub async fn init_upload(
    State(state): State<Arc<AppState>>,
    Json(request): Json<InitUploadRequest>,
) -> ApiResult<Json<InitUploadResponse>> {
    let (transfer_id, total_chunks, created_at_utc) = state.transfers.init_upload(
        &state.store,
        &request.file_name,
        request.file_size,
        &request.sha256,
        request.chunk_size,
        &request.uploaded_by,
    )?;
    Ok(Json(InitUploadResponse {
        transfer_id,
        total_chunks,
        created_at_utc,
    }))
}

pub async fn upload_chunk(
    State(state): State<Arc<AppState>>,
    Path((transfer_id, index)): Path<(String, u32)>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> ApiResult<StatusCode> {
    let header_hash = headers
        .get("X-Chunk-Sha256")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    state.transfers.accept_chunk(&state.store, &transfer_id, index, &body, header_hash)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn dispatch_transfer(
    State(state): State<Arc<AppState>>,
    Path(transfer_id): Path<String>,
    Json(request): Json<DispatchRequest>,
) -> ApiResult<Json<DispatchResponse>> {
    let assignment = state.transfers.dispatch(&transfer_id)?;

    let mut dispatched_online = Vec::new();
    let mut skipped_offline = Vec::new();
    for client_id in request.target_client_ids {
        let delivered = state.send_to_student(
            &client_id,
            StudentHubEvent::FileTransferAssigned {
                assignment: assignment.clone(),
            },
        );
        if delivered {
            dispatched_online.push(client_id);
        } else {
            skipped_offline.push(client_id);
        }
    }

    Ok(Json(DispatchResponse {
        dispatched_online,
        skipped_offline,
    }))
}

pub async fn missing_chunks(
    State(state): State<Arc<AppState>>,
    Path(transfer_id): Path<String>,
    headers: HeaderMap,
    Json(request): Json<MissingChunksRequest>,
) -> ApiResult<Json<MissingChunksResponse>> {
    authorize_student(&state, &headers)?;
    let missing = state.transfers.missing_available(&transfer_id, &request.existing)?;
    Ok(Json(MissingChunksResponse { missing }))
}

#[derive(Deserialize)]
pub struct ClientIdQuery {
    #[serde(rename = "clientId")]
    pub client_id: Option<String>,
}

pub async fn download_chunk(
    State(state): State<Arc<AppState>>,
    Path((transfer_id, index)): Path<(String, u32)>,
    headers: HeaderMap,
    Query(_query): Query<ClientIdQuery>,
) -> ApiResult<Response> {
    authorize_student(&state, &headers)?;
    let (bytes, hash) = state.transfers.get_chunk(&transfer_id, index)?;
    Ok((
        StatusCode::OK,
        [("X-Chunk-Sha256", hash)],
        bytes,
    )
        .into_response())
}

/// `X-Controledu-ClientId` + `X-Controledu-Token` headers, validated
/// against the paired-client store (§4.8's "student" download auth).
fn authorize_student(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let client_id = headers
        .get("X-Controledu-ClientId")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let token = headers
        .get("X-Controledu-Token")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if state.store.validate_token(client_id, token)? {
        Ok(())
    } else {
        Err(CoreError::InvalidToken.into())
    }
}

// ---------------------------------------------------------------------------
// Detection exports (§6)
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct ExportUploadQuery {
    #[serde(rename = "clientId")]
    pub client_id: String,
    #[serde(default = "default_export_name")]
    pub name: String,
}

fn default_export_name() -> String {
    "export.zip".into()
}

pub async fn upload_export(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ExportUploadQuery>,
    body: axum::body::Bytes,
) -> ApiResult<Json<serde_json::Value>> {
    let dir = exports_root(&state).join(&query.client_id);
    std::fs::create_dir_all(&dir).map_err(CoreError::from)?;
    let file_name = format!("{}-{}-{}", now_timestamp(), uuid::Uuid::new_v4(), sanitize(&query.name));
    let path = dir.join(&file_name);
    std::fs::write(&path, &body).map_err(CoreError::from)?;

    let export_id = encode_export_id(&query.client_id, &file_name);
    state.audit("detection_export_uploaded", &query.client_id, Some(&file_name));
    state.broadcast_to_teachers(TeacherHubEvent::DetectionExportReady {
        client_id: query.client_id.clone(),
        export_id: export_id.clone(),
        download_path: format!("/api/detection/exports/download/{export_id}"),
    });

    Ok(Json(serde_json::json!({ "export_id": export_id })))
}

pub async fn list_exports(State(state): State<Arc<AppState>>) -> Json<Vec<serde_json::Value>> {
    let root = exports_root(&state);
    let mut out = Vec::new();
    let Ok(client_dirs) = std::fs::read_dir(&root) else {
        return Json(out);
    };
    for client_dir in client_dirs.flatten() {
        let Ok(client_id) = client_dir.file_name().into_string() else {
            continue;
        };
        let Ok(files) = std::fs::read_dir(client_dir.path()) else {
            continue;
        };
        for file in files.flatten() {
            if let Ok(name) = file.file_name().into_string() {
                out.push(serde_json::json!({
                    "client_id": client_id,
                    "file_name": name,
                    "export_id": encode_export_id(&client_id, &name),
                }));
            }
        }
    }
    Json(out)
}

pub async fn download_export(
    State(state): State<Arc<AppState>>,
    Path(export_id): Path<String>,
) -> ApiResult<Response> {
    let relative = decode_export_id(&export_id)
        .ok_or_else(|| CoreError::MalformedPayload("invalid export id".into()))?;
    let root = exports_root(&state);
    let resolved = root.join(&relative);

    // Reject any path that escapes the exports root (§6).
    let canonical_root = std::fs::canonicalize(&root).map_err(CoreError::from)?;
    let canonical_target = std::fs::canonicalize(&resolved).map_err(CoreError::from)?;
    if !canonical_target.starts_with(&canonical_root) {
        return Err(CoreError::MalformedPayload("export path escapes root".into()).into());
    }

    let bytes = std::fs::read(&canonical_target).map_err(CoreError::from)?;
    Ok((StatusCode::OK, bytes).into_response())
}

fn exports_root(state: &AppState) -> PathBuf {
    FsPath::new(&state.config.data_dir).join("exports").join("detection-exports")
}

fn encode_export_id(client_id: &str, file_name: &str) -> String {
    let relative = format!("{client_id}/{file_name}");
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(relative)
}

fn decode_export_id(export_id: &str) -> Option<String> {
    let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD.decode(export_id).ok()?;
    String::from_utf8(bytes).ok()
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

// ---------------------------------------------------------------------------
// Teacher-driven per-student actions (§6)
// ---------------------------------------------------------------------------

pub async fn revoke_student(
    State(state): State<Arc<AppState>>,
    Path(client_id): Path<String>,
) -> ApiResult<StatusCode> {
    state.store.delete_paired_client(&client_id)?;
    state.send_to_student(&client_id, StudentHubEvent::ForceUnpair { reason: "revoked by teacher".into() });
    state.students.remove(&client_id);
    state.audit("student_revoked", &client_id, None);
    state.broadcast_to_teachers(TeacherHubEvent::StudentListChanged { students: state.students.list() });
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
pub struct TtsRequest {
    pub text: String,
}

pub async fn send_tts(
    State(state): State<Arc<AppState>>,
    Path(client_id): Path<String>,
    Json(request): Json<TtsRequest>,
) -> StatusCode {
    state.send_to_student(&client_id, StudentHubEvent::TeacherTtsRequested { text: request.text });
    StatusCode::ACCEPTED
}

#[derive(Deserialize)]
pub struct TeacherChatRequest {
    pub text: String,
}

pub async fn send_teacher_chat(
    State(state): State<Arc<AppState>>,
    Path(client_id): Path<String>,
    Json(request): Json<TeacherChatRequest>,
) -> StatusCode {
    let message = ChatMessage {
        client_id: client_id.clone(),
        message_id: uuid::Uuid::new_v4().to_string(),
        timestamp_utc: now_timestamp(),
        sender_role: SenderRole::Teacher,
        sender_display_name: "Teacher".into(),
        text: request.text,
    };
    state.chats.push(message.clone());
    state.send_to_student(&client_id, StudentHubEvent::TeacherChatMessageRequested { message: message.clone() });
    state.broadcast_to_teachers(TeacherHubEvent::ChatMessageReceived { message });
    StatusCode::ACCEPTED
}

pub async fn assign_accessibility_profile(
    State(state): State<Arc<AppState>>,
    Path(client_id): Path<String>,
    Json(assignment): Json<AccessibilityProfileAssignment>,
) -> StatusCode {
    state.send_to_student(&client_id, StudentHubEvent::AccessibilityProfileAssigned { assignment });
    StatusCode::ACCEPTED
}
