//! Call session entity: roster, status, mute flags, lifecycle.
//!
//! Sessions are owned exclusively by the registry actor; everything here
//! is synchronous state manipulation. Status transitions only move
//! forward (`waiting -> active -> ended`), and [`CallSession::end`]
//! reports whether this call performed the transition so the caller can
//! broadcast `SessionEnded` exactly once.

use crate::errors::CallError;

use super::messages::{CallKind, PeerInfo, SessionState, SessionStatus};

use tokio::time::Instant;

/// A session member's authoritative record.
#[derive(Debug, Clone)]
pub struct SessionMember {
    pub user_id: String,
    /// The member's live connection when they entered the session.
    pub connection_id: String,
    pub muted: bool,
}

/// A paired or grouped conversation room.
#[derive(Debug)]
pub struct CallSession {
    session_id: String,
    kind: CallKind,
    topic: Option<String>,
    members: Vec<SessionMember>,
    status: SessionStatus,
    created_at: i64,
    ended_at: Option<i64>,
    /// For `waiting` group sessions: when the wait budget elapses.
    activate_deadline: Option<Instant>,
}

impl CallSession {
    /// Create a session with its initial members.
    ///
    /// Status is `active` unless this is an under-filled group, which
    /// starts `waiting` with an activation deadline.
    pub fn new(
        kind: CallKind,
        topic: Option<String>,
        members: Vec<(String, String)>,
        activate_deadline: Option<Instant>,
    ) -> Self {
        let members: Vec<SessionMember> = members
            .into_iter()
            .map(|(user_id, connection_id)| SessionMember {
                user_id,
                connection_id,
                muted: false,
            })
            .collect();

        let status = if kind.is_group() && members.len() < kind.capacity() {
            SessionStatus::Waiting
        } else {
            SessionStatus::Active
        };

        Self {
            session_id: format!("session-{}", uuid::Uuid::new_v4()),
            kind,
            topic,
            members,
            status,
            created_at: chrono::Utc::now().timestamp(),
            ended_at: None,
            activate_deadline: if status == SessionStatus::Waiting {
                activate_deadline
            } else {
                None
            },
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn kind(&self) -> CallKind {
        self.kind
    }

    pub fn topic(&self) -> Option<&str> {
        self.topic.as_deref()
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    pub fn members(&self) -> &[SessionMember] {
        &self.members
    }

    pub fn is_member(&self, user_id: &str) -> bool {
        self.members.iter().any(|m| m.user_id == user_id)
    }

    pub fn member(&self, user_id: &str) -> Option<&SessionMember> {
        self.members.iter().find(|m| m.user_id == user_id)
    }

    /// Whether a `waiting` group session has outlived its wait budget.
    pub fn is_activation_due(&self, now: Instant) -> bool {
        self.status == SessionStatus::Waiting
            && self.activate_deadline.is_some_and(|deadline| now >= deadline)
    }

    /// Add a member to a `waiting` session.
    ///
    /// Activated and ended sessions never offer another slot, so joining
    /// them fails with `SessionFull`. Reaching capacity activates the
    /// session.
    pub fn add_member(
        &mut self,
        user_id: String,
        connection_id: String,
    ) -> Result<(), CallError> {
        if self.status != SessionStatus::Waiting {
            return Err(CallError::SessionFull);
        }
        if self.is_member(&user_id) {
            return Err(CallError::AlreadyInSession);
        }
        if self.members.len() >= self.kind.capacity() {
            return Err(CallError::SessionFull);
        }

        self.members.push(SessionMember {
            user_id,
            connection_id,
            muted: false,
        });

        if self.members.len() == self.kind.capacity() {
            self.activate();
        }

        Ok(())
    }

    /// Transition `waiting -> active`. No-op in any other status.
    pub fn activate(&mut self) {
        if self.status == SessionStatus::Waiting {
            self.status = SessionStatus::Active;
            self.activate_deadline = None;
        }
    }

    /// Remove a member, returning their record if they were present.
    pub fn remove_member(&mut self, user_id: &str) -> Option<SessionMember> {
        let idx = self.members.iter().position(|m| m.user_id == user_id)?;
        Some(self.members.remove(idx))
    }

    /// Update a member's mute flag.
    pub fn set_muted(&mut self, user_id: &str, muted: bool) -> Result<(), CallError> {
        let member = self
            .members
            .iter_mut()
            .find(|m| m.user_id == user_id)
            .ok_or(CallError::NotAMember)?;
        member.muted = muted;
        Ok(())
    }

    /// Whether the session can no longer continue: empty, or a two-party
    /// kind that has dropped below two members. Groups continue down to a
    /// single member.
    pub fn should_end(&self) -> bool {
        if self.members.is_empty() {
            return true;
        }
        self.kind.capacity() == 2 && self.members.len() < 2
    }

    /// Transition to `ended`. Returns `true` only on the call that
    /// performed the transition, so teardown runs exactly once.
    pub fn end(&mut self) -> bool {
        if self.status == SessionStatus::Ended {
            return false;
        }
        self.status = SessionStatus::Ended;
        self.ended_at = Some(chrono::Utc::now().timestamp());
        self.activate_deadline = None;
        true
    }

    /// Roster snapshot for clients.
    pub fn state(&self) -> SessionState {
        SessionState {
            session_id: self.session_id.clone(),
            kind: self.kind,
            topic: self.topic.clone(),
            status: self.status,
            peers: self.peers_except(None),
            created_at: self.created_at,
        }
    }

    /// Peer list, optionally excluding one user (for `Matched` payloads).
    pub fn peers_except(&self, except_user_id: Option<&str>) -> Vec<PeerInfo> {
        self.members
            .iter()
            .filter(|m| Some(m.user_id.as_str()) != except_user_id)
            .map(|m| PeerInfo {
                user_id: m.user_id.clone(),
                muted: m.muted,
            })
            .collect()
    }
}
