//! # Remote-control session service (C10)
//!
//! At-most-one state machine per `clientId`. Inputs are forwarded only
//! when a session is `Approved` and the forwarding call's `{sessionId,
//! teacherConnectionId}` matches.
//!
//! ```text
//! (none) --Start--> PendingApproval --studentApprove--> Approved
//!                            |                 \
//!                            |                  studentReject --> Rejected
//!                            +--timeout--> Expired
//!                            +--teacherStop--> Ended
//! Approved --teacherStop--> Ended
//! Approved --studentStop--> Ended
//! Approved --error--> Error
//! ```

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::time::now_timestamp;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteControlState {
    PendingApproval,
    Approved,
    Rejected,
    Ended,
    Expired,
    Error,
}

impl RemoteControlState {
    /// Terminal states never transition further.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RemoteControlState::Rejected
                | RemoteControlState::Ended
                | RemoteControlState::Expired
                | RemoteControlState::Error
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteControlSession {
    pub client_id: String,
    pub session_id: String,
    pub teacher_connection_id: String,
    pub state: RemoteControlState,
    pub created_at_utc: i64,
    pub updated_at_utc: i64,
}

impl RemoteControlSession {
    /// Whether an input command with `{session_id, teacher_connection_id}`
    /// should be forwarded to the student.
    pub fn accepts_input(&self, session_id: &str, teacher_connection_id: &str) -> bool {
        self.state == RemoteControlState::Approved
            && self.session_id == session_id
            && self.teacher_connection_id == teacher_connection_id
    }
}

/// Concurrent table of remote-control sessions, keyed by `clientId`
/// (§5).
#[derive(Default)]
pub struct RemoteControlTable {
    sessions: DashMap<String, RemoteControlSession>,
}

impl RemoteControlTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new session for `client_id`. Fails if a non-terminal
    /// session already exists for that student.
    pub fn start(&self, client_id: &str, teacher_connection_id: &str) -> Result<RemoteControlSession> {
        if let Some(existing) = self.sessions.get(client_id) {
            if !existing.state.is_terminal() {
                return Err(Error::RemoteControlSessionExists);
            }
        }
        let now = now_timestamp();
        let session = RemoteControlSession {
            client_id: client_id.to_string(),
            session_id: uuid::Uuid::new_v4().to_string(),
            teacher_connection_id: teacher_connection_id.to_string(),
            state: RemoteControlState::PendingApproval,
            created_at_utc: now,
            updated_at_utc: now,
        };
        self.sessions.insert(client_id.to_string(), session.clone());
        Ok(session)
    }

    pub fn get(&self, client_id: &str) -> Option<RemoteControlSession> {
        self.sessions.get(client_id).map(|s| s.clone())
    }

    /// Transition `client_id`'s session via `transition`, validating the
    /// move is legal from the current state.
    pub fn transition(
        &self,
        client_id: &str,
        session_id: &str,
        transition: Transition,
    ) -> Result<RemoteControlSession> {
        let mut entry = self
            .sessions
            .get_mut(client_id)
            .ok_or_else(|| Error::Internal("no remote-control session for student".into()))?;

        if entry.session_id != session_id {
            return Err(Error::IllegalStateTransition {
                from: format!("{:?}", entry.state),
            });
        }

        let next = match (entry.state, transition) {
            (RemoteControlState::PendingApproval, Transition::StudentApprove) => RemoteControlState::Approved,
            (RemoteControlState::PendingApproval, Transition::StudentReject) => RemoteControlState::Rejected,
            (RemoteControlState::PendingApproval, Transition::Timeout) => RemoteControlState::Expired,
            (RemoteControlState::PendingApproval, Transition::TeacherStop) => RemoteControlState::Ended,
            (RemoteControlState::Approved, Transition::TeacherStop) => RemoteControlState::Ended,
            (RemoteControlState::Approved, Transition::StudentStop) => RemoteControlState::Ended,
            (RemoteControlState::Approved, Transition::Error) => RemoteControlState::Error,
            (from, _) => {
                return Err(Error::IllegalStateTransition {
                    from: format!("{from:?}"),
                })
            }
        };

        entry.state = next;
        entry.updated_at_utc = now_timestamp();
        Ok(entry.clone())
    }

    /// End every non-terminal session owned by `teacher_connection_id`
    /// (teacher-hub disconnect), returning the affected clientIds.
    pub fn end_all_owned_by(&self, teacher_connection_id: &str) -> Vec<String> {
        let mut ended = Vec::new();
        for mut entry in self.sessions.iter_mut() {
            if entry.teacher_connection_id == teacher_connection_id && !entry.state.is_terminal() {
                entry.state = RemoteControlState::Ended;
                entry.updated_at_utc = now_timestamp();
                ended.push(entry.client_id.clone());
            }
        }
        ended
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    StudentApprove,
    StudentReject,
    Timeout,
    TeacherStop,
    StudentStop,
    Error,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_then_approve_accepts_input() {
        let table = RemoteControlTable::new();
        let session = table.start("c1", "teacher-conn-1").unwrap();
        assert_eq!(session.state, RemoteControlState::PendingApproval);

        let approved = table
            .transition("c1", &session.session_id, Transition::StudentApprove)
            .unwrap();
        assert_eq!(approved.state, RemoteControlState::Approved);
        assert!(approved.accepts_input(&session.session_id, "teacher-conn-1"));
        assert!(!approved.accepts_input(&session.session_id, "other-teacher"));
        assert!(!approved.accepts_input("wrong-session", "teacher-conn-1"));
    }

    #[test]
    fn test_reject_is_terminal() {
        let table = RemoteControlTable::new();
        let session = table.start("c1", "t1").unwrap();
        let rejected = table
            .transition("c1", &session.session_id, Transition::StudentReject)
            .unwrap();
        assert_eq!(rejected.state, RemoteControlState::Rejected);
        assert!(table
            .transition("c1", &session.session_id, Transition::StudentApprove)
            .is_err());
    }

    #[test]
    fn test_at_most_one_non_terminal_session_per_student() {
        let table = RemoteControlTable::new();
        table.start("c1", "t1").unwrap();
        assert!(table.start("c1", "t2").is_err());
    }

    #[test]
    fn test_new_session_allowed_after_prior_terminates() {
        let table = RemoteControlTable::new();
        let session = table.start("c1", "t1").unwrap();
        table
            .transition("c1", &session.session_id, Transition::StudentReject)
            .unwrap();
        assert!(table.start("c1", "t2").is_ok());
    }

    #[test]
    fn test_end_all_owned_by_ends_only_matching_teacher() {
        let table = RemoteControlTable::new();
        let s1 = table.start("c1", "teacher-A").unwrap();
        table
            .transition("c1", &s1.session_id, Transition::StudentApprove)
            .unwrap();
        table.start("c2", "teacher-B").unwrap();

        let ended = table.end_all_owned_by("teacher-A");
        assert_eq!(ended, vec!["c1".to_string()]);
        assert_eq!(table.get("c1").unwrap().state, RemoteControlState::Ended);
        assert_eq!(table.get("c2").unwrap().state, RemoteControlState::PendingApproval);
    }

    #[test]
    fn test_illegal_transition_rejected() {
        let table = RemoteControlTable::new();
        let session = table.start("c1", "t1").unwrap();
        assert!(table
            .transition("c1", &session.session_id, Transition::StudentStop)
            .is_err());
    }

    #[test]
    fn test_stale_session_id_rejected() {
        let table = RemoteControlTable::new();
        table.start("c1", "t1").unwrap();
        assert!(table
            .transition("c1", "not-the-real-session-id", Transition::StudentApprove)
            .is_err());
    }
}
