//! Hub-wide shared state.
//!
//! Tracks online student/teacher connections, presence, and the bounded
//! event logs. All tables are concurrent (`dashmap`) so no global lock is
//! held across a fan-out.

use std::collections::HashMap;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use controledu_core::detection::DetectionPolicy;
use controledu_core::identity::ServerIdentity;
use controledu_core::pairing::PinTable;
use controledu_core::protocol::{StudentHubEvent, TeacherHubEvent};
use controledu_core::registry::{AlertRing, ChatStore, StudentRegistry};
use controledu_core::remote_control::RemoteControlTable;
use controledu_core::storage::Store;
use controledu_core::time::now_timestamp;

use crate::transfer::TransferManager;

/// Cooldown window for a single (clientId, signalType) pair (§4.6).
const SIGNAL_COOLDOWN_SECONDS: i64 = 15;

/// Per-connection outbound channel to a registered student.
pub type StudentSender = mpsc::UnboundedSender<StudentHubEvent>;
/// Per-connection outbound channel to a connected teacher console.
pub type TeacherSender = mpsc::UnboundedSender<TeacherHubEvent>;

#[derive(Debug, Clone)]
pub struct HubConfig {
    pub port: u16,
    pub data_dir: String,
    pub display_name: String,
    pub discovery_port: u16,
}

/// Everything the hub's route and websocket handlers share.
pub struct AppState {
    pub config: HubConfig,
    pub store: Store,
    pub identity: ServerIdentity,
    pub pins: PinTable,
    pub students: StudentRegistry,
    pub remote_control: RemoteControlTable,
    pub alerts: AlertRing,
    pub chats: ChatStore,
    pub transfers: TransferManager,
    /// Settings persisted through `PUT /api/detection/settings`. Per
    /// §9's hardening decision, `effective_policy()` ignores this and
    /// always returns [`DetectionPolicy::production`] — kept only so the
    /// settings endpoints round-trip what a teacher saved.
    persisted_policy: Mutex<DetectionPolicy>,
    student_senders: DashMap<String, StudentSender>,
    teacher_senders: DashMap<String, TeacherSender>,
    signal_cooldowns: Mutex<HashMap<(String, String), i64>>,
}

impl AppState {
    pub fn new(
        config: HubConfig,
        store: Store,
        identity: ServerIdentity,
        transfers: TransferManager,
    ) -> Self {
        Self {
            config,
            store,
            identity,
            pins: PinTable::new(),
            students: StudentRegistry::new(),
            remote_control: RemoteControlTable::new(),
            alerts: AlertRing::default(),
            chats: ChatStore::new(),
            transfers,
            persisted_policy: Mutex::new(DetectionPolicy::production()),
            student_senders: DashMap::new(),
            teacher_senders: DashMap::new(),
            signal_cooldowns: Mutex::new(HashMap::new()),
        }
    }

    /// The policy every student actually runs under. Always the fixed
    /// production policy, regardless of what is persisted.
    pub fn effective_policy(&self) -> DetectionPolicy {
        DetectionPolicy::production()
    }

    pub fn persisted_policy(&self) -> DetectionPolicy {
        self.persisted_policy.lock().clone()
    }

    pub fn set_persisted_policy(&self, policy: DetectionPolicy) {
        *self.persisted_policy.lock() = policy;
    }

    pub fn register_student_sender(&self, client_id: &str, sender: StudentSender) {
        self.student_senders.insert(client_id.to_string(), sender);
    }

    pub fn remove_student_sender(&self, client_id: &str) {
        self.student_senders.remove(client_id);
    }

    pub fn send_to_student(&self, client_id: &str, event: StudentHubEvent) -> bool {
        match self.student_senders.get(client_id) {
            Some(sender) => sender.send(event).is_ok(),
            None => false,
        }
    }

    pub fn register_teacher_sender(&self, connection_id: &str, sender: TeacherSender) {
        self.teacher_senders.insert(connection_id.to_string(), sender);
    }

    pub fn remove_teacher_sender(&self, connection_id: &str) {
        self.teacher_senders.remove(connection_id);
    }

    pub fn send_to_teacher(&self, connection_id: &str, event: TeacherHubEvent) -> bool {
        match self.teacher_senders.get(connection_id) {
            Some(sender) => sender.send(event).is_ok(),
            None => false,
        }
    }

    /// Push `event` to every connected teacher console.
    pub fn broadcast_to_teachers(&self, event: TeacherHubEvent) {
        self.teacher_senders.retain(|_, sender| sender.send(event.clone()).is_ok());
    }

    pub fn online_student_count(&self) -> usize {
        self.student_senders.len()
    }

    pub fn teacher_count(&self) -> usize {
        self.teacher_senders.len()
    }

    /// Centralized anti-spam check for `SendStudentSignal` (§4.6).
    /// Returns `true` if the signal is allowed through, bumping the
    /// cooldown clock as a side effect.
    pub fn check_signal_cooldown(&self, client_id: &str, signal_type: &str) -> bool {
        let key = (client_id.to_string(), signal_type.to_string());
        let now = now_timestamp();
        let mut cooldowns = self.signal_cooldowns.lock();
        match cooldowns.get(&key) {
            Some(last) if now - last < SIGNAL_COOLDOWN_SECONDS => false,
            _ => {
                cooldowns.insert(key, now);
                true
            }
        }
    }

    pub fn audit(&self, action: &str, actor: &str, details: Option<&str>) {
        if let Err(err) = self.store.append_audit(action, actor, details) {
            tracing::warn!(error = %err, action, actor, "failed to append audit entry");
        }
    }
}
