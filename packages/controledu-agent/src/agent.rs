//! Student agent main loop (C11).
//!
//! A single cooperative loop with due-time fields per sub-task (§4.10,
//! §5): no parallel mutation of agent-local state. Each iteration
//! ensures the binding and hub connection are in place, fires whichever
//! of heartbeat/capture/detection is due, drains inbound command
//! queues, then sleeps to the nearest next due-time (clamped 1-50ms).
//! Hub sends are fire-and-forget through [`HubClient::send`]; nothing
//! here ever awaits a reply inline.

use std::path::PathBuf;
use std::time::Duration;

use base64::Engine as _;
use tokio::sync::mpsc;

use controledu_core::detection::DetectionObservation;
use controledu_core::error::Result;
use controledu_core::protocol::{
    FramePayload, RegistrationRequest, RemoteControlStatusPayload, StudentHubCall, StudentHubEvent,
};
use controledu_core::remote_control::RemoteControlState;
use controledu_core::secret_store::SecretProtector;
use controledu_core::storage::{Store, StudentBinding};
use controledu_core::time::{now_timestamp, now_timestamp_millis};
use zeroize::Zeroize;

use crate::capture::FrameSource;
use crate::detection_runner::DetectionRunner;
use crate::discovery_client;
use crate::hub_client::HubClient;
use crate::input::InputInjector;
use crate::local_http::{PendingRemoteControl, RemoteControlDecision, StatusHandle};
use crate::pairing_client::PairingClient;
use crate::state::AgentConfig;
use crate::transfer_client::{self, AdvanceOutcome, TransferClient};

const HEARTBEAT_INTERVAL_MS: i64 = 10_000;
const MIN_SLEEP_MS: i64 = 1;
const MAX_SLEEP_MS: i64 = 50;

/// One in-flight file transfer the agent is resuming chunk by chunk.
struct ActiveTransfer {
    assignment: controledu_core::protocol::FileTransferAssignment,
    partial_path: PathBuf,
    completed_chunks: Vec<u32>,
}

/// One-shot pairing parameters supplied on the command line, consumed
/// the first time the loop finds no binding.
pub struct PendingPairing {
    pub server_base_url: String,
    pub pin: String,
}

pub struct AgentLoop {
    config: AgentConfig,
    store: Store,
    protector: Box<dyn SecretProtector>,
    pairing_client: PairingClient,
    pending_pairing: Option<PendingPairing>,

    client_id: Option<String>,
    token: Option<String>,
    base_url: Option<String>,

    hub: Option<HubClient>,
    registered: bool,

    frame_source: Box<dyn FrameSource>,
    input_injector: Box<dyn InputInjector>,
    detection: DetectionRunner,
    status: StatusHandle,
    remote_control_decisions: mpsc::UnboundedReceiver<RemoteControlDecision>,

    last_observation: Option<DetectionObservation>,
    active_transfer: Option<ActiveTransfer>,
    remote_control_session_id: Option<String>,

    current_fps: u32,
    current_jpeg_quality: u8,

    next_heartbeat_due_ms: i64,
    next_capture_due_ms: i64,
    next_detection_due_ms: i64,
}

impl AgentLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: AgentConfig,
        store: Store,
        protector: Box<dyn SecretProtector>,
        frame_source: Box<dyn FrameSource>,
        input_injector: Box<dyn InputInjector>,
        detection: DetectionRunner,
        status: StatusHandle,
        remote_control_decisions: mpsc::UnboundedReceiver<RemoteControlDecision>,
        pending_pairing: Option<PendingPairing>,
    ) -> Self {
        let now_ms = now_timestamp_millis();
        let current_fps = config.max_fps;
        let current_jpeg_quality = config.max_jpeg_quality;
        Self {
            config,
            store,
            protector,
            pairing_client: PairingClient::new(),
            pending_pairing,
            client_id: None,
            token: None,
            base_url: None,
            hub: None,
            registered: false,
            frame_source,
            input_injector,
            detection,
            status,
            remote_control_decisions,
            last_observation: None,
            active_transfer: None,
            remote_control_session_id: None,
            current_fps,
            current_jpeg_quality,
            next_heartbeat_due_ms: now_ms,
            next_capture_due_ms: now_ms,
            next_detection_due_ms: now_ms,
        }
    }

    /// Run forever. Only returns on an unrecoverable storage error.
    pub async fn run(mut self) -> Result<()> {
        self.load_binding()?;

        loop {
            let now_ms = now_timestamp_millis();
            let now_utc = now_timestamp();

            if self.client_id.is_none() {
                self.try_establish_binding().await;
                tokio::time::sleep(Duration::from_millis(200)).await;
                continue;
            }

            self.ensure_hub_connected(now_utc).await;

            if self.hub.as_ref().is_some_and(HubClient::is_connected) && !self.registered {
                self.send_register();
            }

            if now_ms >= self.next_heartbeat_due_ms {
                self.do_heartbeat(now_utc);
                self.next_heartbeat_due_ms = now_ms + HEARTBEAT_INTERVAL_MS;
            }

            if now_ms >= self.next_capture_due_ms {
                let elapsed_ms = self.do_capture(now_utc).await;
                self.adapt_capture_rate(elapsed_ms);
                self.next_capture_due_ms = now_ms + self.capture_interval_ms();
            }

            if now_ms >= self.next_detection_due_ms {
                self.do_detection(now_utc);
                self.next_detection_due_ms =
                    now_ms + i64::from(self.detection.policy().evaluation_interval_seconds) * 1000;
            }

            self.advance_active_transfer().await;
            self.drain_hub_events();
            self.drain_remote_control_decisions();
            self.publish_status(now_utc);

            let sleep_ms = self.next_due_in_ms(now_ms).clamp(MIN_SLEEP_MS, MAX_SLEEP_MS);
            tokio::time::sleep(Duration::from_millis(sleep_ms as u64)).await;
        }
    }

    // ------------------------------------------------------------------
    // (a) binding
    // ------------------------------------------------------------------

    fn load_binding(&mut self) -> Result<()> {
        if let Some(binding) = self.store.get_student_binding()? {
            self.apply_binding(binding);
        }
        Ok(())
    }

    fn apply_binding(&mut self, binding: StudentBinding) {
        let token = self.protector.unprotect(&binding.protected_token).ok().and_then(|mut bytes| {
            let token = String::from_utf8(bytes.clone()).ok();
            bytes.zeroize();
            token
        });
        if let Some(token) = token {
            self.client_id = Some(binding.client_id);
            self.token = Some(token);
            self.base_url = Some(binding.server_base_url);
        } else {
            tracing::warn!("stored binding could not be unsealed; clearing it");
            let _ = self.store.clear_student_binding();
        }
    }

    /// One-shot pairing driven by `--server-url`/`--pair-pin`, or by a
    /// discovery probe when no URL was supplied. Idles (returns without
    /// effect) once there is nothing left to try.
    async fn try_establish_binding(&mut self) {
        let Some(pending) = self.pending_pairing.take() else {
            return;
        };

        let base_url = if pending.server_base_url.is_empty() {
            match discovery_client::probe().await {
                Ok(candidates) if !candidates.is_empty() => {
                    format!("http://{}:{}", candidates[0].reply.host, candidates[0].reply.port)
                }
                _ => {
                    tracing::warn!("discovery probe found no servers; pairing cannot proceed");
                    return;
                }
            }
        } else {
            pending.server_base_url
        };

        match self
            .pairing_client
            .complete(
                &base_url,
                &pending.pin,
                &self.config.host_name,
                &self.config.user_name,
                &self.config.os_description,
                None,
                self.protector.as_ref(),
            )
            .await
        {
            Ok(binding) => {
                if let Err(err) = self.store.set_student_binding(&binding) {
                    tracing::error!(error = %err, "failed to persist student binding");
                    return;
                }
                tracing::info!(server = %binding.server_name, "paired successfully");
                self.apply_binding(binding);
            }
            Err(err) => {
                tracing::error!(error = %err, "pairing failed");
            }
        }
    }

    // ------------------------------------------------------------------
    // (b) hub connection
    // ------------------------------------------------------------------

    async fn ensure_hub_connected(&mut self, now_utc: i64) {
        let Some(base_url) = self.base_url.clone() else {
            return;
        };

        if self.hub.is_none() {
            let ws_url = to_ws_url(&base_url, "/ws/student");
            self.hub = Some(HubClient::new(ws_url));
        }

        let hub = self.hub.as_mut().expect("just constructed above");
        let was_connected = hub.is_connected();
        if hub.due_for_reconnect(now_utc) {
            hub.poll_connect().await;
        }
        if was_connected && !hub.is_connected() {
            self.registered = false;
        }
    }

    fn send_register(&mut self) {
        let (Some(client_id), Some(token)) = (self.client_id.clone(), self.token.clone()) else {
            return;
        };
        let Some(hub) = &self.hub else { return };
        hub.send(&StudentHubCall::Register {
            request_id: uuid::Uuid::new_v4().to_string(),
            registration: RegistrationRequest {
                client_id,
                token,
                host_name: self.config.host_name.clone(),
                user_name: self.config.user_name.clone(),
                os_description: self.config.os_description.clone(),
                local_ip: None,
            },
        });
        // The hub's RegisterAck flips this for real; optimistically mark
        // it so the next iteration doesn't resend Register while the
        // ack is in flight.
        self.registered = true;
    }

    // ------------------------------------------------------------------
    // (c) heartbeat
    // ------------------------------------------------------------------

    fn do_heartbeat(&mut self, now_utc: i64) {
        let Some(client_id) = self.client_id.clone() else { return };
        if let Some(hub) = &self.hub {
            hub.send(&StudentHubCall::Heartbeat {
                client_id,
                utc: now_utc,
            });
        }
    }

    // ------------------------------------------------------------------
    // (d) capture
    // ------------------------------------------------------------------

    /// Captures, encodes, and sends one frame; returns the elapsed time
    /// in milliseconds so the caller can adapt FPS/quality.
    async fn do_capture(&mut self, now_utc: i64) -> u64 {
        let start = tokio::time::Instant::now();

        let frame = self
            .frame_source
            .capture(self.config.capture_width, self.config.capture_height, self.current_jpeg_quality);

        self.last_observation = Some(DetectionObservation {
            timestamp_utc: now_utc,
            frame_bytes: Some(frame.jpeg_bytes.clone()),
            active_process_name: frame.active_process_name.clone(),
            active_window_title: frame.active_window_title.clone(),
            browser_hint_url: frame.browser_hint_url.clone(),
        });

        if let (Some(client_id), Some(hub)) = (self.client_id.clone(), &self.hub) {
            let jpeg_base64 = base64::engine::general_purpose::STANDARD.encode(&frame.jpeg_bytes);
            hub.send(&StudentHubCall::SendFrame {
                frame: FramePayload {
                    client_id,
                    timestamp_utc: now_utc,
                    jpeg_base64,
                    active_process_name: frame.active_process_name,
                    active_window_title: frame.active_window_title,
                    browser_hint_url: frame.browser_hint_url,
                },
            });
        }

        start.elapsed().as_millis() as u64
    }

    /// §4.10(d): buckets on measured send duration, clamped to
    /// configured bounds.
    fn adapt_capture_rate(&mut self, elapsed_ms: u64) {
        let (fps_delta, quality_delta): (i32, i32) = if elapsed_ms > 220 {
            (-2, -6)
        } else if elapsed_ms > 140 {
            (-1, -3)
        } else if elapsed_ms < 55 {
            (1, 1)
        } else {
            (0, 0)
        };

        self.current_fps = (self.current_fps as i32 + fps_delta)
            .clamp(self.config.min_fps as i32, self.config.max_fps as i32) as u32;
        self.current_jpeg_quality = (self.current_jpeg_quality as i32 + quality_delta)
            .clamp(self.config.min_jpeg_quality as i32, self.config.max_jpeg_quality as i32) as u8;
    }

    fn capture_interval_ms(&self) -> i64 {
        1000 / i64::from(self.current_fps.max(1))
    }

    // ------------------------------------------------------------------
    // (e) detection
    // ------------------------------------------------------------------

    fn do_detection(&mut self, now_utc: i64) {
        let Some(observation) = self.last_observation.clone() else { return };
        let decision = self.detection.analyze(&observation, now_utc);

        if decision.should_emit {
            if let (Some(client_id), Some(hub)) = (self.client_id.clone(), &self.hub) {
                let thumbnail_base64 = if self.detection.policy().collect_thumbnail_bytes {
                    observation
                        .frame_bytes
                        .as_deref()
                        .map(|b| base64::engine::general_purpose::STANDARD.encode(b))
                } else {
                    None
                };
                hub.send(&StudentHubCall::SendAlert {
                    client_id,
                    result: decision.result.clone(),
                    timestamp_utc: now_utc,
                    thumbnail_base64,
                });
            }
        }
    }

    // ------------------------------------------------------------------
    // (f) drain inbound command queues
    // ------------------------------------------------------------------

    fn drain_hub_events(&mut self) {
        loop {
            let event = match self.hub.as_mut() {
                Some(hub) => hub.try_recv(),
                None => return,
            };
            match event {
                Some(event) => self.handle_hub_event(event),
                None => return,
            }
        }
    }

    fn handle_hub_event(&mut self, event: StudentHubEvent) {
        match event {
            StudentHubEvent::RegisterAck { ok, reason, .. } => {
                self.registered = ok;
                if !ok {
                    tracing::warn!(reason = ?reason, "registration rejected by hub");
                }
            }
            StudentHubEvent::DetectionPolicy { policy, .. } => {
                self.detection.set_policy(policy);
            }
            StudentHubEvent::FileTransferAssigned { assignment } => {
                self.start_transfer(assignment);
            }
            StudentHubEvent::ForceUnpair { reason } => {
                tracing::warn!(reason = %reason, "force-unpaired by teacher");
                let _ = self.store.clear_student_binding();
                self.client_id = None;
                self.token = None;
                self.base_url = None;
                self.hub = None;
                self.registered = false;
            }
            StudentHubEvent::AccessibilityProfileAssigned { assignment } => {
                tracing::info!(profile = %assignment.profile_name, "accessibility profile assigned (forwarded to shell)");
            }
            StudentHubEvent::TeacherTtsRequested { text } => {
                tracing::info!(len = text.len(), "teacher TTS requested (forwarded to shell)");
            }
            StudentHubEvent::TeacherChatMessageRequested { message } => {
                tracing::info!(from = %message.sender_display_name, "teacher chat message received");
            }
            StudentHubEvent::RemoteControlSessionCommand { session_id, state } => {
                self.remote_control_session_id = Some(session_id);
                if matches!(state, RemoteControlState::Ended | RemoteControlState::Expired) {
                    self.remote_control_session_id = None;
                }
            }
            StudentHubEvent::RemoteControlInputCommand { session_id, input } => {
                if self.remote_control_session_id.as_deref() == Some(session_id.as_str()) {
                    self.input_injector.inject(&input);
                }
            }
        }
    }

    /// A human operator (via the desktop shell, which is external to
    /// this crate) approves or rejects a pending remote-control session
    /// through the local HTTP surface.
    fn drain_remote_control_decisions(&mut self) {
        while let Ok(decision) = self.remote_control_decisions.try_recv() {
            let Some(client_id) = self.client_id.clone() else { continue };
            let state = if decision.approve {
                RemoteControlState::Approved
            } else {
                RemoteControlState::Rejected
            };
            if let Some(hub) = &self.hub {
                hub.send(&StudentHubCall::ReportRemoteControlStatus {
                    status: RemoteControlStatusPayload {
                        client_id,
                        session_id: decision.session_id,
                        state,
                        detail: None,
                    },
                });
            }
        }
    }

    async fn advance_active_transfer(&mut self) {
        let Some(transfer) = self.active_transfer.as_mut() else { return };
        let (Some(client_id), Some(token), Some(base_url)) =
            (self.client_id.clone(), self.token.clone(), self.base_url.clone())
        else {
            return;
        };
        let client = TransferClient::new(base_url, client_id.clone(), token);

        let outcome = transfer_client::advance(
            &client,
            &self.store,
            &transfer.assignment,
            &transfer.partial_path,
            &mut transfer.completed_chunks,
        )
        .await;

        match outcome {
            AdvanceOutcome::Progress {
                completed_chunks,
                total_chunks,
            } => {
                if let Some(hub) = &self.hub {
                    hub.send(&StudentHubCall::ReportFileProgress {
                        progress: controledu_core::protocol::FileProgressPayload {
                            client_id,
                            transfer_id: transfer.assignment.transfer_id.clone(),
                            completed_chunks,
                            total_chunks,
                            error: None,
                        },
                    });
                }
            }
            AdvanceOutcome::Complete { final_path } => {
                tracing::info!(path = %final_path.display(), "file transfer complete");
                if let Some(hub) = &self.hub {
                    hub.send(&StudentHubCall::ReportFileProgress {
                        progress: controledu_core::protocol::FileProgressPayload {
                            client_id,
                            transfer_id: transfer.assignment.transfer_id.clone(),
                            completed_chunks: transfer.assignment.total_chunks,
                            total_chunks: transfer.assignment.total_chunks,
                            error: None,
                        },
                    });
                }
                self.active_transfer = None;
            }
            AdvanceOutcome::Error(message) => {
                tracing::warn!(error = %message, "file transfer chunk failed, will retry next iteration");
                if let Some(hub) = &self.hub {
                    hub.send(&StudentHubCall::ReportFileProgress {
                        progress: controledu_core::protocol::FileProgressPayload {
                            client_id,
                            transfer_id: transfer.assignment.transfer_id.clone(),
                            completed_chunks: transfer.completed_chunks.len() as u32,
                            total_chunks: transfer.assignment.total_chunks,
                            error: Some(message),
                        },
                    });
                }
            }
        }
    }

    fn start_transfer(&mut self, assignment: controledu_core::protocol::FileTransferAssignment) {
        match transfer_client::resume_or_start(&self.store, &assignment, &self.config.downloads_dir()) {
            Ok((partial_path, completed_chunks)) => {
                self.active_transfer = Some(ActiveTransfer {
                    assignment,
                    partial_path,
                    completed_chunks,
                });
            }
            Err(err) => tracing::error!(error = %err, "failed to initialize file transfer resume state"),
        }
    }

    // ------------------------------------------------------------------
    // (g) scheduling
    // ------------------------------------------------------------------

    fn next_due_in_ms(&self, now_ms: i64) -> i64 {
        [self.next_heartbeat_due_ms, self.next_capture_due_ms, self.next_detection_due_ms]
            .into_iter()
            .map(|due| due - now_ms)
            .min()
            .unwrap_or(MAX_SLEEP_MS)
    }

    fn publish_status(&self, now_utc: i64) {
        let mut status = self.status.lock();
        status.client_id = self.client_id.clone();
        status.hub_connected = self.hub.as_ref().is_some_and(HubClient::is_connected);
        status.last_heartbeat_utc = Some(now_utc).filter(|_| self.client_id.is_some());
        status.last_detection_utc = self.detection.last_check_utc();
        status.last_detection_positive = self.detection.last_decision().map(|d| d.result.is_ai_ui_detected);
        status.current_fps = self.current_fps;
        status.current_jpeg_quality = self.current_jpeg_quality;
        status.pending_remote_control = self.remote_control_session_id.clone().map(|session_id| PendingRemoteControl { session_id });
    }
}

fn to_ws_url(base_url: &str, path: &str) -> String {
    let trimmed = base_url.trim_end_matches('/');
    if let Some(rest) = trimmed.strip_prefix("https://") {
        format!("wss://{rest}{path}")
    } else if let Some(rest) = trimmed.strip_prefix("http://") {
        format!("ws://{rest}{path}")
    } else {
        format!("ws://{trimmed}{path}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_ws_url_http_to_ws() {
        assert_eq!(to_ws_url("http://192.168.1.5:40556", "/ws/student"), "ws://192.168.1.5:40556/ws/student");
    }

    #[test]
    fn test_to_ws_url_https_to_wss() {
        assert_eq!(to_ws_url("https://example.com", "/ws/student"), "wss://example.com/ws/student");
    }

    #[test]
    fn test_to_ws_url_trims_trailing_slash() {
        assert_eq!(to_ws_url("http://h:1/", "/ws/student"), "ws://h:1/ws/student");
    }
}
