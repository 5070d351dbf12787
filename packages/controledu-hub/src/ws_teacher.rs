//! teacher-hub websocket handler (C7).
//!
//! Unlike the student-hub, a teacher console is a trusted local
//! caller (the hub only accepts connections on the LAN-facing HTTP
//! port anyway) and needs no registration handshake: the connection id
//! is minted on accept and used only to own remote-control sessions it
//! requested.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use controledu_core::protocol::{TeacherHubCall, TeacherHubEvent};
use controledu_core::remote_control::RemoteControlState;

use crate::state::AppState;

pub async fn handle(socket: WebSocket, state: Arc<AppState>) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let connection_id = uuid::Uuid::new_v4().to_string();
    let (tx, mut rx) = mpsc::unbounded_channel::<TeacherHubEvent>();

    state.register_teacher_sender(&connection_id, tx);
    tracing::info!(connection_id = %connection_id, "teacher console connected");

    let sender_task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let json = serde_json::to_string(&event).expect("TeacherHubEvent always serializes");
            if ws_sender.send(Message::Text(json)).await.is_err() {
                break;
            }
        }
    });

    while let Some(msg) = ws_receiver.next().await {
        let text = match msg {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => continue,
        };

        let call = match serde_json::from_str::<TeacherHubCall>(&text) {
            Ok(call) => call,
            Err(err) => {
                tracing::warn!(error = %err, "malformed teacher-hub payload");
                continue;
            }
        };

        handle_call(&state, &connection_id, call);
    }

    let ended = state.remote_control.end_all_owned_by(&connection_id);
    for client_id in ended {
        if let Some(session) = state.remote_control.get(&client_id) {
            state.send_to_student(
                &client_id,
                controledu_core::protocol::StudentHubEvent::RemoteControlSessionCommand {
                    session_id: session.session_id,
                    state: RemoteControlState::Ended,
                },
            );
        }
    }
    state.remove_teacher_sender(&connection_id);
    sender_task.abort();
    tracing::info!(connection_id = %connection_id, "teacher console disconnected");
}

fn handle_call(state: &Arc<AppState>, connection_id: &str, call: TeacherHubCall) {
    use controledu_core::protocol::StudentHubEvent;

    match call {
        TeacherHubCall::GetStudents { request_id } => {
            state.send_to_teacher(
                connection_id,
                TeacherHubEvent::GetStudentsResult {
                    request_id,
                    students: state.students.list(),
                },
            );
        }

        TeacherHubCall::GeneratePairingPin { request_id } => {
            let pin = state.pins.generate();
            state.audit("pairing_pin_generated", "teacher", None);
            state.send_to_teacher(
                connection_id,
                TeacherHubEvent::PairingPinResult {
                    request_id,
                    pin: pin.pin,
                    expires_at_utc: pin.expires_at_utc,
                },
            );
        }

        TeacherHubCall::GetLatestAudit { request_id, take } => {
            let entries = state.store.list_audit(take).unwrap_or_default();
            state.send_to_teacher(connection_id, TeacherHubEvent::AuditResult { request_id, entries });
        }

        TeacherHubCall::RequestRemoteControlSession { request_id, client_id } => {
            match state.remote_control.start(&client_id, connection_id) {
                Ok(session) => {
                    state.send_to_teacher(
                        connection_id,
                        TeacherHubEvent::RemoteControlSessionResult {
                            request_id,
                            client_id: client_id.clone(),
                            session_id: session.session_id.clone(),
                            state: session.state,
                        },
                    );
                    state.send_to_student(
                        &client_id,
                        StudentHubEvent::RemoteControlSessionCommand {
                            session_id: session.session_id,
                            state: session.state,
                        },
                    );
                }
                Err(err) => {
                    tracing::warn!(error = %err, client_id = %client_id, "remote-control session request rejected");
                }
            }
        }

        TeacherHubCall::StopRemoteControlSession { client_id, session_id } => {
            match state
                .remote_control
                .transition(&client_id, &session_id, controledu_core::remote_control::Transition::TeacherStop)
            {
                Ok(session) => {
                    state.send_to_student(
                        &client_id,
                        StudentHubEvent::RemoteControlSessionCommand {
                            session_id: session.session_id.clone(),
                            state: session.state,
                        },
                    );
                    state.broadcast_to_teachers(TeacherHubEvent::RemoteControlStatusUpdated {
                        status: controledu_core::protocol::RemoteControlStatusPayload {
                            client_id,
                            session_id: session.session_id,
                            state: session.state,
                            detail: None,
                        },
                    });
                }
                Err(err) => {
                    tracing::warn!(error = %err, client_id = %client_id, "stop remote-control session rejected");
                }
            }
        }

        TeacherHubCall::SendRemoteControlInput { client_id, session_id, input } => {
            let Some(session) = state.remote_control.get(&client_id) else {
                tracing::debug!(client_id = %client_id, "remote-control input for unknown session dropped");
                return;
            };
            if !session.accepts_input(&session_id, connection_id) {
                tracing::debug!(client_id = %client_id, "remote-control input rejected: session/connection mismatch");
                return;
            }
            state.send_to_student(
                &client_id,
                StudentHubEvent::RemoteControlInputCommand { session_id, input },
            );
        }
    }
}
