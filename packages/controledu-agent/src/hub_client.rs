//! Student-hub websocket client (C11).
//!
//! Mirrors the relay's own peer-to-peer reconnection model (split
//! sender/receiver tasks, exponential backoff up to 60s, backoff reset
//! on a clean connect): the agent's single cooperative loop (§4.10)
//! calls [`HubClient::poll_connect`] once per iteration instead of
//! looping internally, so a stalled connect attempt never blocks
//! anything but the loop's own iteration.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use controledu_core::protocol::{StudentHubCall, StudentHubEvent};
use controledu_core::time::now_timestamp;

const INITIAL_BACKOFF_SECONDS: i64 = 1;
const MAX_BACKOFF_SECONDS: i64 = 60;

pub struct HubClient {
    url: String,
    connected: Arc<AtomicBool>,
    outbound_tx: Option<mpsc::UnboundedSender<WsMessage>>,
    inbound_rx: Option<mpsc::UnboundedReceiver<StudentHubEvent>>,
    next_attempt_at: i64,
    backoff_seconds: i64,
}

impl HubClient {
    pub fn new(url: String) -> Self {
        Self {
            url,
            connected: Arc::new(AtomicBool::new(false)),
            outbound_tx: None,
            inbound_rx: None,
            next_attempt_at: now_timestamp(),
            backoff_seconds: INITIAL_BACKOFF_SECONDS,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub fn due_for_reconnect(&self, now_utc: i64) -> bool {
        !self.is_connected() && now_utc >= self.next_attempt_at
    }

    /// Attempt one connection. On success, spawns the sender and
    /// receiver tasks and resets backoff; on failure, schedules the
    /// next attempt after the (doubling, capped) backoff.
    pub async fn poll_connect(&mut self) {
        match connect_async(&self.url).await {
            Ok((stream, _response)) => {
                tracing::info!(url = %self.url, "hub connected");
                let (mut ws_sender, mut ws_receiver) = stream.split();
                let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<WsMessage>();
                let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<StudentHubEvent>();

                self.connected.store(true, Ordering::Relaxed);

                tokio::spawn(async move {
                    while let Some(msg) = outbound_rx.recv().await {
                        if ws_sender.send(msg).await.is_err() {
                            break;
                        }
                    }
                });

                let connected_flag = self.connected.clone();
                let url = self.url.clone();
                tokio::spawn(async move {
                    while let Some(msg) = ws_receiver.next().await {
                        match msg {
                            Ok(WsMessage::Text(text)) => match serde_json::from_str::<StudentHubEvent>(&text) {
                                Ok(event) => {
                                    if inbound_tx.send(event).is_err() {
                                        break;
                                    }
                                }
                                Err(err) => tracing::warn!(error = %err, "malformed hub event payload"),
                            },
                            Ok(WsMessage::Close(_)) | Err(_) => break,
                            Ok(_) => continue,
                        }
                    }
                    tracing::warn!(url = %url, "hub connection lost");
                    connected_flag.store(false, Ordering::Relaxed);
                });

                self.outbound_tx = Some(outbound_tx);
                self.inbound_rx = Some(inbound_rx);
                self.backoff_seconds = INITIAL_BACKOFF_SECONDS;
            }
            Err(err) => {
                tracing::warn!(
                    error = %err,
                    url = %self.url,
                    backoff_seconds = self.backoff_seconds,
                    "hub connect failed, retrying after backoff"
                );
                self.next_attempt_at = now_timestamp() + self.backoff_seconds;
                self.backoff_seconds = (self.backoff_seconds * 2).min(MAX_BACKOFF_SECONDS);
            }
        }
    }

    /// Non-blocking background send (§5): silently dropped while
    /// disconnected, since the caller's own retry (heartbeat, next
    /// frame) will supersede it shortly.
    pub fn send(&self, call: &StudentHubCall) {
        let Some(tx) = &self.outbound_tx else {
            return;
        };
        let json = serde_json::to_string(call).expect("StudentHubCall always serializes");
        if tx.send(WsMessage::Text(json)).is_err() {
            self.connected.store(false, Ordering::Relaxed);
        }
    }

    /// Drain at most one queued inbound event; call in a loop to empty
    /// the queue each iteration.
    pub fn try_recv(&mut self) -> Option<StudentHubEvent> {
        self.inbound_rx.as_mut()?.try_recv().ok()
    }
}
