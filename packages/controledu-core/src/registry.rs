//! # Student registry + detection event store (C12)
//!
//! Process-local, in-memory presence projection and bounded event logs.
//! Not durable: on restart every student re-registers and rebuilds this
//! state from scratch (§3 "Ownership").

use std::collections::VecDeque;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::detection::DetectionResult;
use crate::time::now_timestamp;

/// Capacity of the bounded alert ring (§3 `AlertEvent`).
pub const ALERT_RING_CAPACITY: usize = 1500;
/// Capacity of each student's chat message ring (§3 `ChatMessage`).
pub const CHAT_RING_CAPACITY: usize = 300;

/// A live (or recently live) student connection's presence state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StudentSession {
    pub client_id: String,
    pub connection_id: Option<String>,
    pub host_name: String,
    pub user_name: String,
    pub local_ip: Option<String>,
    pub last_seen_utc: i64,
    pub is_online: bool,
    pub detection_enabled: bool,
    pub last_detection: Option<DetectionResult>,
    pub last_detection_at_utc: Option<i64>,
}

/// A detection positive, enriched with identity and ring-queue metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertEvent {
    pub event_id: String,
    pub student_id: String,
    pub student_display_name: String,
    pub timestamp_utc: i64,
    pub result: DetectionResult,
    pub thumbnail: Option<Vec<u8>>,
}

/// One chat message, student- or teacher-authored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SenderRole {
    Teacher,
    Student,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub client_id: String,
    pub message_id: String,
    pub timestamp_utc: i64,
    pub sender_role: SenderRole,
    pub sender_display_name: String,
    pub text: String,
}

/// Concurrent map of `clientId → StudentSession`, with per-key atomicity
/// (§5).
#[derive(Default)]
pub struct StudentRegistry {
    sessions: DashMap<String, StudentSession>,
}

impl StudentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or re-register) a student, binding it to a fresh
    /// `connection_id`.
    pub fn upsert_on_register(
        &self,
        client_id: &str,
        host_name: &str,
        user_name: &str,
        local_ip: Option<&str>,
        connection_id: &str,
    ) -> StudentSession {
        let now = now_timestamp();
        let session = self
            .sessions
            .entry(client_id.to_string())
            .and_modify(|s| {
                s.connection_id = Some(connection_id.to_string());
                s.host_name = host_name.to_string();
                s.user_name = user_name.to_string();
                s.local_ip = local_ip.map(String::from);
                s.last_seen_utc = now;
                s.is_online = true;
            })
            .or_insert_with(|| StudentSession {
                client_id: client_id.to_string(),
                connection_id: Some(connection_id.to_string()),
                host_name: host_name.to_string(),
                user_name: user_name.to_string(),
                local_ip: local_ip.map(String::from),
                last_seen_utc: now,
                is_online: true,
                detection_enabled: true,
                last_detection: None,
                last_detection_at_utc: None,
            })
            .clone();
        session
    }

    /// The connection id currently bound to `client_id`, if online.
    pub fn active_connection_id(&self, client_id: &str) -> Option<String> {
        self.sessions.get(client_id).and_then(|s| s.connection_id.clone())
    }

    /// Update `last_seen_utc` for a heartbeat. No-op if the client was
    /// never registered.
    pub fn heartbeat(&self, client_id: &str) {
        if let Some(mut s) = self.sessions.get_mut(client_id) {
            s.last_seen_utc = now_timestamp();
        }
    }

    /// Record the outcome of a detection evaluation against a student's
    /// session projection.
    pub fn record_detection(&self, client_id: &str, result: DetectionResult) {
        if let Some(mut s) = self.sessions.get_mut(client_id) {
            s.last_detection = Some(result);
            s.last_detection_at_utc = Some(now_timestamp());
        }
    }

    /// Mark a session offline on hub disconnect. The pairing row itself
    /// is untouched — only explicit revocation removes it (§3).
    pub fn mark_offline(&self, client_id: &str, connection_id: &str) -> bool {
        if let Some(mut s) = self.sessions.get_mut(client_id) {
            if s.connection_id.as_deref() == Some(connection_id) {
                s.is_online = false;
                s.connection_id = None;
                return true;
            }
        }
        false
    }

    /// Remove a session entirely (teacher-initiated revocation).
    pub fn remove(&self, client_id: &str) {
        self.sessions.remove(client_id);
    }

    pub fn get(&self, client_id: &str) -> Option<StudentSession> {
        self.sessions.get(client_id).map(|s| s.clone())
    }

    pub fn list(&self) -> Vec<StudentSession> {
        let mut out: Vec<StudentSession> = self.sessions.iter().map(|e| e.value().clone()).collect();
        out.sort_by(|a, b| a.client_id.cmp(&b.client_id));
        out
    }

    pub fn is_online(&self, client_id: &str) -> bool {
        self.sessions.get(client_id).map(|s| s.is_online).unwrap_or(false)
    }
}

/// Bounded drop-oldest ring of [`AlertEvent`]s, single-producer /
/// multiple-consumer per §5.
pub struct AlertRing {
    capacity: usize,
    events: Mutex<VecDeque<AlertEvent>>,
}

impl AlertRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            events: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn push(&self, event: AlertEvent) {
        let mut events = self.events.lock();
        if events.len() >= self.capacity {
            events.pop_front();
        }
        events.push_back(event);
    }

    /// Most recent `take` events, oldest first.
    pub fn latest(&self, take: usize) -> Vec<AlertEvent> {
        let events = self.events.lock();
        let skip = events.len().saturating_sub(take);
        events.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for AlertRing {
    fn default() -> Self {
        Self::new(ALERT_RING_CAPACITY)
    }
}

/// Per-student bounded chat history.
#[derive(Default)]
pub struct ChatStore {
    rings: DashMap<String, VecDeque<ChatMessage>>,
}

impl ChatStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, message: ChatMessage) {
        let mut ring = self.rings.entry(message.client_id.clone()).or_default();
        if ring.len() >= CHAT_RING_CAPACITY {
            ring.pop_front();
        }
        ring.push_back(message);
    }

    pub fn latest(&self, client_id: &str, take: usize) -> Vec<ChatMessage> {
        match self.rings.get(client_id) {
            Some(ring) => {
                let skip = ring.len().saturating_sub(take);
                ring.iter().skip(skip).cloned().collect()
            }
            None => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::DetectionResult;

    #[test]
    fn test_registry_register_heartbeat_disconnect_lifecycle() {
        let registry = StudentRegistry::new();
        registry.upsert_on_register("c1", "LAPTOP-1", "alice", Some("192.168.1.5"), "conn-1");
        assert!(registry.is_online("c1"));
        assert_eq!(registry.active_connection_id("c1").as_deref(), Some("conn-1"));

        registry.heartbeat("c1");
        assert!(registry.get("c1").unwrap().last_seen_utc > 0);

        assert!(registry.mark_offline("c1", "conn-1"));
        assert!(!registry.is_online("c1"));
        assert_eq!(registry.active_connection_id("c1"), None);
    }

    #[test]
    fn test_mark_offline_ignores_stale_connection_id() {
        let registry = StudentRegistry::new();
        registry.upsert_on_register("c1", "h", "u", None, "conn-1");
        registry.upsert_on_register("c1", "h", "u", None, "conn-2");
        assert!(!registry.mark_offline("c1", "conn-1"));
        assert!(registry.is_online("c1"));
    }

    #[test]
    fn test_remove_drops_session() {
        let registry = StudentRegistry::new();
        registry.upsert_on_register("c1", "h", "u", None, "conn-1");
        registry.remove("c1");
        assert!(registry.get("c1").is_none());
    }

    #[test]
    fn test_record_detection_updates_last_detection() {
        let registry = StudentRegistry::new();
        registry.upsert_on_register("c1", "h", "u", None, "conn-1");
        registry.record_detection("c1", DetectionResult::negative("x"));
        assert!(registry.get("c1").unwrap().last_detection.is_some());
    }

    #[test]
    fn test_alert_ring_drops_oldest() {
        let ring = AlertRing::new(2);
        for i in 0..3 {
            ring.push(AlertEvent {
                event_id: format!("e{i}"),
                student_id: "c1".into(),
                student_display_name: "Alice".into(),
                timestamp_utc: i,
                result: DetectionResult::negative("x"),
                thumbnail: None,
            });
        }
        assert_eq!(ring.len(), 2);
        let latest = ring.latest(10);
        assert_eq!(latest[0].event_id, "e1");
        assert_eq!(latest[1].event_id, "e2");
    }

    #[test]
    fn test_chat_store_bounded_per_student() {
        let store = ChatStore::new();
        for i in 0..3 {
            store.push(ChatMessage {
                client_id: "c1".into(),
                message_id: format!("m{i}"),
                timestamp_utc: i,
                sender_role: SenderRole::Student,
                sender_display_name: "Alice".into(),
                text: format!("msg {i}"),
            });
        }
        let latest = store.latest("c1", 2);
        assert_eq!(latest.len(), 2);
        assert_eq!(latest[0].message_id, "m1");
        assert_eq!(store.latest("c2", 10).len(), 0);
    }
}
