//! student-hub websocket handler (C7).
//!
//! Implements the authorization rule from §4.6: only `Register` is
//! accepted before the session is bound; every later call must carry the
//! bound clientId and match the registry's active connection id for that
//! clientId, or it is logged and silently dropped.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use controledu_core::protocol::{
    RemoteControlStatusPayload, StudentHubCall, StudentHubEvent,
};
use controledu_core::registry::{AlertEvent, ChatMessage, SenderRole};
use controledu_core::remote_control::{RemoteControlState, Transition};

use crate::state::AppState;

pub async fn handle(socket: WebSocket, state: Arc<AppState>) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let connection_id = uuid::Uuid::new_v4().to_string();
    let (tx, mut rx) = mpsc::unbounded_channel::<StudentHubEvent>();

    // Step 1: wait for Register, rejecting anything else.
    let bound_client_id = loop {
        let Some(Ok(Message::Text(text))) = ws_receiver.next().await else {
            return;
        };
        let call = match serde_json::from_str::<StudentHubCall>(&text) {
            Ok(call) => call,
            Err(err) => {
                tracing::warn!(error = %err, "malformed student-hub payload before registration");
                continue;
            }
        };
        match call {
            StudentHubCall::Register { request_id, registration } => {
                let token_ok = state
                    .store
                    .validate_token(&registration.client_id, &registration.token)
                    .unwrap_or(false);
                if !token_ok {
                    let ack = StudentHubEvent::RegisterAck {
                        request_id,
                        ok: false,
                        reason: Some("invalid or expired token".into()),
                    };
                    let _ = send(&mut ws_sender, &ack).await;
                    return;
                }

                state.students.upsert_on_register(
                    &registration.client_id,
                    &registration.host_name,
                    &registration.user_name,
                    registration.local_ip.as_deref(),
                    &connection_id,
                );
                state.register_student_sender(&registration.client_id, tx.clone());
                state.audit("student_connect", &registration.client_id, None);

                let ack = StudentHubEvent::RegisterAck {
                    request_id,
                    ok: true,
                    reason: None,
                };
                if send(&mut ws_sender, &ack).await.is_err() {
                    return;
                }

                if let Some(session) = state.students.get(&registration.client_id) {
                    state.broadcast_to_teachers(
                        controledu_core::protocol::TeacherHubEvent::StudentUpserted { student: session },
                    );
                    state.broadcast_to_teachers(
                        controledu_core::protocol::TeacherHubEvent::StudentListChanged {
                            students: state.students.list(),
                        },
                    );
                }

                break registration.client_id;
            }
            _ => {
                tracing::warn!("student-hub call before registration dropped");
            }
        }
    };

    // Step 2: spawn the sender task forwarding queued events.
    let sender_task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if send(&mut ws_sender, &event).await.is_err() {
                break;
            }
        }
    });

    // Step 3: process authorized calls until disconnect.
    while let Some(msg) = ws_receiver.next().await {
        let text = match msg {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => continue,
        };

        let call = match serde_json::from_str::<StudentHubCall>(&text) {
            Ok(call) => call,
            Err(err) => {
                tracing::warn!(error = %err, client_id = %bound_client_id, "malformed student-hub payload");
                continue;
            }
        };

        if !authorized(&state, &bound_client_id, &connection_id, &call) {
            tracing::warn!(client_id = %bound_client_id, "student-hub call failed authorization, dropped");
            continue;
        }

        handle_call(&state, &bound_client_id, &connection_id, call);
    }

    // Step 4: cleanup.
    state.students.mark_offline(&bound_client_id, &connection_id);
    state.remove_student_sender(&bound_client_id);
    state.audit("student_disconnect", &bound_client_id, None);
    state.broadcast_to_teachers(controledu_core::protocol::TeacherHubEvent::StudentDisconnected {
        client_id: bound_client_id.clone(),
    });
    state.broadcast_to_teachers(controledu_core::protocol::TeacherHubEvent::StudentListChanged {
        students: state.students.list(),
    });
    sender_task.abort();
}

/// Every call except `Register` must carry the bound clientId AND match
/// the registry's active connection id for it (§4.6).
fn authorized(state: &AppState, bound_client_id: &str, connection_id: &str, call: &StudentHubCall) -> bool {
    let claimed = match call {
        StudentHubCall::Register { .. } => return true,
        StudentHubCall::Heartbeat { client_id, .. } => client_id,
        StudentHubCall::SendFrame { frame } => &frame.client_id,
        StudentHubCall::SendAlert { client_id, .. } => client_id,
        StudentHubCall::SendStudentSignal { signal } => &signal.client_id,
        StudentHubCall::SendChatMessage { message } => &message.client_id,
        StudentHubCall::ReportFileProgress { progress } => &progress.client_id,
        StudentHubCall::ReportRemoteControlStatus { status } => &status.client_id,
        StudentHubCall::GetDetectionPolicy { client_id, .. } => client_id,
    };

    claimed == bound_client_id && state.students.active_connection_id(bound_client_id).as_deref() == Some(connection_id)
}

fn handle_call(state: &Arc<AppState>, client_id: &str, _connection_id: &str, call: StudentHubCall) {
    use controledu_core::protocol::TeacherHubEvent;

    match call {
        StudentHubCall::Register { .. } => unreachable!("handled before the authorized loop"),

        StudentHubCall::Heartbeat { client_id, .. } => {
            state.students.heartbeat(&client_id);
        }

        StudentHubCall::SendFrame { frame } => {
            state.broadcast_to_teachers(TeacherHubEvent::FrameReceived {
                client_id: frame.client_id,
                timestamp_utc: frame.timestamp_utc,
                jpeg_base64: frame.jpeg_base64,
            });
        }

        StudentHubCall::SendAlert { client_id, result, timestamp_utc, thumbnail_base64 } => {
            state.students.record_detection(&client_id, result.clone());
            let display_name = state
                .students
                .get(&client_id)
                .map(|s| s.user_name)
                .unwrap_or_else(|| client_id.clone());
            use base64::Engine as _;
            let thumbnail = thumbnail_base64
                .as_deref()
                .and_then(|b64| base64::engine::general_purpose::STANDARD.decode(b64).ok());
            let event = AlertEvent {
                event_id: uuid::Uuid::new_v4().to_string(),
                student_id: client_id.clone(),
                student_display_name: display_name,
                timestamp_utc,
                result: result.clone(),
                thumbnail,
            };
            state.alerts.push(event.clone());
            state.audit("detection_alert", &client_id, Some(&result.reason));
            state.broadcast_to_teachers(TeacherHubEvent::AlertReceived { event });
        }

        StudentHubCall::SendStudentSignal { signal } => {
            if state.check_signal_cooldown(&signal.client_id, &signal.signal_type) {
                state.broadcast_to_teachers(TeacherHubEvent::StudentSignalReceived { signal });
            } else {
                tracing::debug!(client_id = %client_id, "student signal dropped by cooldown");
            }
        }

        StudentHubCall::SendChatMessage { message } => {
            let display_name = state
                .students
                .get(&message.client_id)
                .map(|s| s.user_name)
                .unwrap_or_else(|| message.client_id.clone());
            let chat = ChatMessage {
                client_id: message.client_id.clone(),
                message_id: uuid::Uuid::new_v4().to_string(),
                timestamp_utc: message.timestamp_utc,
                sender_role: SenderRole::Student,
                sender_display_name: display_name,
                text: message.text,
            };
            state.chats.push(chat.clone());
            state.audit("chat_message", &message.client_id, None);
            state.broadcast_to_teachers(TeacherHubEvent::ChatMessageReceived { message: chat });
        }

        StudentHubCall::ReportFileProgress { progress } => {
            state.broadcast_to_teachers(TeacherHubEvent::FileProgressUpdated { progress });
        }

        StudentHubCall::ReportRemoteControlStatus { status } => {
            handle_remote_control_status(state, status);
        }

        StudentHubCall::GetDetectionPolicy { request_id, .. } => {
            state.send_to_student(
                client_id,
                StudentHubEvent::DetectionPolicy {
                    request_id,
                    policy: state.effective_policy(),
                },
            );
        }
    }
}

fn handle_remote_control_status(state: &Arc<AppState>, status: RemoteControlStatusPayload) {
    let transition = match status.state {
        RemoteControlState::Approved => Transition::StudentApprove,
        RemoteControlState::Rejected => Transition::StudentReject,
        RemoteControlState::Ended => Transition::StudentStop,
        RemoteControlState::Error => Transition::Error,
        RemoteControlState::PendingApproval | RemoteControlState::Expired => {
            state.broadcast_to_teachers(controledu_core::protocol::TeacherHubEvent::RemoteControlStatusUpdated { status });
            return;
        }
    };

    match state.remote_control.transition(&status.client_id, &status.session_id, transition) {
        Ok(session) => {
            state.broadcast_to_teachers(controledu_core::protocol::TeacherHubEvent::RemoteControlStatusUpdated {
                status: RemoteControlStatusPayload {
                    client_id: session.client_id,
                    session_id: session.session_id,
                    state: session.state,
                    detail: status.detail,
                },
            });
        }
        Err(err) => {
            tracing::warn!(error = %err, client_id = %status.client_id, "remote-control status rejected");
        }
    }
}

async fn send(
    sender: &mut futures::stream::SplitSink<WebSocket, Message>,
    event: &StudentHubEvent,
) -> Result<(), axum::Error> {
    let json = serde_json::to_string(event).expect("StudentHubEvent always serializes");
    sender.send(Message::Text(json)).await
}
