//! # Transport contracts (C4)
//!
//! Wire DTOs for both hub channels, HTTP request/response bodies, and
//! the well-known method/event names. Every envelope is an internally
//! tagged `serde` enum (`{"type": "...", ...}`, snake_case), matching
//! the corpus' relay protocol shape (§9) rather than a generic
//! `{method, id, payload}` triple. Calls that need a correlated reply
//! carry the caller-supplied `request_id` back on the reply variant.

use serde::{Deserialize, Serialize};

use crate::detection::{DetectionPolicy, DetectionResult};
use crate::registry::{AlertEvent, ChatMessage, StudentSession};
use crate::remote_control::RemoteControlState;
use crate::storage::AuditEntry;

// ---------------------------------------------------------------------------
// Shared payload fragments
// ---------------------------------------------------------------------------

/// What a student sends on `Register`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationRequest {
    pub client_id: String,
    pub token: String,
    pub host_name: String,
    pub user_name: String,
    pub os_description: String,
    pub local_ip: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FramePayload {
    pub client_id: String,
    pub timestamp_utc: i64,
    /// Base64-encoded JPEG bytes.
    pub jpeg_base64: String,
    pub active_process_name: Option<String>,
    pub active_window_title: Option<String>,
    pub browser_hint_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StudentSignalPayload {
    pub client_id: String,
    pub signal_type: String,
    pub timestamp_utc: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatSendPayload {
    pub client_id: String,
    pub text: String,
    pub timestamp_utc: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileProgressPayload {
    pub client_id: String,
    pub transfer_id: String,
    pub completed_chunks: u32,
    pub total_chunks: u32,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteControlStatusPayload {
    pub client_id: String,
    pub session_id: String,
    pub state: RemoteControlState,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteControlInputKind {
    Move,
    Click,
    Key,
}

/// One remote-control input command. `x`/`y` are normalized ∈ [0,1]
/// over the rendered frame (§4.9); the student endpoint maps them to
/// absolute screen coordinates locally.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteControlInput {
    pub kind: RemoteControlInputKind,
    pub x: Option<f32>,
    pub y: Option<f32>,
    pub button: Option<String>,
    pub key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileTransferAssignment {
    pub transfer_id: String,
    pub file_name: String,
    pub file_size: u64,
    pub sha256: String,
    pub chunk_size: u64,
    pub total_chunks: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessibilityProfileAssignment {
    pub profile_name: String,
    pub settings_json: String,
}

// ---------------------------------------------------------------------------
// Student-hub (caller = agent)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StudentHubCall {
    Register {
        request_id: String,
        registration: RegistrationRequest,
    },
    Heartbeat {
        client_id: String,
        utc: i64,
    },
    SendFrame {
        frame: FramePayload,
    },
    SendAlert {
        client_id: String,
        result: DetectionResult,
        timestamp_utc: i64,
        thumbnail_base64: Option<String>,
    },
    SendStudentSignal {
        signal: StudentSignalPayload,
    },
    SendChatMessage {
        message: ChatSendPayload,
    },
    ReportFileProgress {
        progress: FileProgressPayload,
    },
    ReportRemoteControlStatus {
        status: RemoteControlStatusPayload,
    },
    GetDetectionPolicy {
        request_id: String,
        client_id: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StudentHubEvent {
    RegisterAck {
        request_id: String,
        ok: bool,
        reason: Option<String>,
    },
    DetectionPolicy {
        request_id: String,
        policy: DetectionPolicy,
    },
    FileTransferAssigned {
        assignment: FileTransferAssignment,
    },
    ForceUnpair {
        reason: String,
    },
    AccessibilityProfileAssigned {
        assignment: AccessibilityProfileAssignment,
    },
    TeacherTtsRequested {
        text: String,
    },
    TeacherChatMessageRequested {
        message: ChatMessage,
    },
    RemoteControlSessionCommand {
        session_id: String,
        state: RemoteControlState,
    },
    RemoteControlInputCommand {
        session_id: String,
        input: RemoteControlInput,
    },
}

// ---------------------------------------------------------------------------
// Teacher-hub (caller = console)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TeacherHubCall {
    GetStudents {
        request_id: String,
    },
    GeneratePairingPin {
        request_id: String,
    },
    GetLatestAudit {
        request_id: String,
        take: u32,
    },
    RequestRemoteControlSession {
        request_id: String,
        client_id: String,
    },
    StopRemoteControlSession {
        client_id: String,
        session_id: String,
    },
    SendRemoteControlInput {
        client_id: String,
        session_id: String,
        input: RemoteControlInput,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TeacherHubEvent {
    GetStudentsResult {
        request_id: String,
        students: Vec<StudentSession>,
    },
    PairingPinResult {
        request_id: String,
        pin: String,
        expires_at_utc: i64,
    },
    AuditResult {
        request_id: String,
        entries: Vec<AuditEntry>,
    },
    RemoteControlSessionResult {
        request_id: String,
        client_id: String,
        session_id: String,
        state: RemoteControlState,
    },
    StudentUpserted {
        student: StudentSession,
    },
    StudentDisconnected {
        client_id: String,
    },
    StudentListChanged {
        students: Vec<StudentSession>,
    },
    FrameReceived {
        client_id: String,
        timestamp_utc: i64,
        jpeg_base64: String,
    },
    AlertReceived {
        event: AlertEvent,
    },
    StudentSignalReceived {
        signal: StudentSignalPayload,
    },
    ChatMessageReceived {
        message: ChatMessage,
    },
    FileProgressUpdated {
        progress: FileProgressPayload,
    },
    DetectionPolicyUpdated {
        policy: DetectionPolicy,
    },
    DetectionExportReady {
        client_id: String,
        export_id: String,
        download_path: String,
    },
    RemoteControlStatusUpdated {
        status: RemoteControlStatusPayload,
    },
}

// ---------------------------------------------------------------------------
// HTTP DTOs (non-hub)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub utc: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairingPinResponse {
    pub pin: String,
    pub expires_at_utc: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairingRequest {
    pub pin: String,
    pub host_name: String,
    pub user_name: String,
    pub os_description: String,
    pub local_ip: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairingResponse {
    pub server_id: String,
    pub server_name: String,
    pub base_url: String,
    pub fingerprint: String,
    pub client_id: String,
    pub token: String,
    pub expires_at_utc: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitUploadRequest {
    pub file_name: String,
    pub file_size: u64,
    pub sha256: String,
    pub chunk_size: u64,
    pub uploaded_by: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitUploadResponse {
    pub transfer_id: String,
    pub total_chunks: u32,
    pub created_at_utc: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchRequest {
    pub target_client_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchResponse {
    pub dispatched_online: Vec<String>,
    pub skipped_offline: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MissingChunksRequest {
    pub existing: Vec<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MissingChunksResponse {
    pub missing: Vec<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_student_hub_call_register_round_trips() {
        let call = StudentHubCall::Register {
            request_id: "r1".into(),
            registration: RegistrationRequest {
                client_id: "c1".into(),
                token: "tok".into(),
                host_name: "LAPTOP".into(),
                user_name: "alice".into(),
                os_description: "Windows 11".into(),
                local_ip: Some("192.168.1.5".into()),
            },
        };
        let json = serde_json::to_string(&call).unwrap();
        assert!(json.contains("\"type\":\"register\""));
        let back: StudentHubCall = serde_json::from_str(&json).unwrap();
        match back {
            StudentHubCall::Register { request_id, .. } => assert_eq!(request_id, "r1"),
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn test_teacher_hub_event_tag_names() {
        let event = TeacherHubEvent::StudentDisconnected {
            client_id: "c1".into(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"student_disconnected\""));
    }

    #[test]
    fn test_remote_control_input_round_trip() {
        let input = RemoteControlInput {
            kind: RemoteControlInputKind::Click,
            x: Some(0.5),
            y: Some(0.25),
            button: Some("left".into()),
            key: None,
        };
        let json = serde_json::to_string(&input).unwrap();
        let back: RemoteControlInput = serde_json::from_str(&json).unwrap();
        assert_eq!(back.x, Some(0.5));
        assert_eq!(back.kind, RemoteControlInputKind::Click);
    }

    #[test]
    fn test_pairing_response_round_trip() {
        let response = PairingResponse {
            server_id: "srv-1".into(),
            server_name: "Room 204".into(),
            base_url: "http://192.168.1.5:40556".into(),
            fingerprint: "ABCDEF".into(),
            client_id: "c1".into(),
            token: "tok".into(),
            expires_at_utc: 1000,
        };
        let json = serde_json::to_string(&response).unwrap();
        let back: PairingResponse = serde_json::from_str(&json).unwrap();
        assert_eq!(back.client_id, "c1");
    }
}
