//! Message types for actor communication.
//!
//! All inter-actor communication uses strongly-typed message passing via
//! `tokio::sync::mpsc`. Response patterns use `tokio::sync::oneshot` for
//! request-reply semantics. Outbound [`SessionEvent`]s are `Serialize` so
//! the surrounding application can push them to clients as JSON.

use crate::errors::CallError;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

/// Call session kind. Determines target capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallKind {
    /// Two-party conversation, paired by proficiency level.
    OneOnOne,
    /// Up to four participants, accumulated in a `waiting` session.
    Group,
    /// Two-party conversation restricted to a shared topic tag.
    Topic,
    /// Two-party conversation with no matching constraints beyond level.
    Free,
}

impl CallKind {
    /// Maximum member count for this kind.
    pub fn capacity(self) -> usize {
        match self {
            CallKind::Group => 4,
            CallKind::OneOnOne | CallKind::Topic | CallKind::Free => 2,
        }
    }

    /// Whether entries of this kind accumulate in a `waiting` session
    /// instead of the pairing queue.
    pub fn is_group(self) -> bool {
        matches!(self, CallKind::Group)
    }
}

/// Proficiency level used by the pairing policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Level {
    Beginner,
    Intermediate,
    Advanced,
}

/// Session lifecycle status. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Capacity not yet full; only possible for group sessions.
    Waiting,
    Active,
    Ended,
}

/// Roster view of a session member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerInfo {
    pub user_id: String,
    pub muted: bool,
}

/// Snapshot of a session's roster and status.
#[derive(Debug, Clone, Serialize)]
pub struct SessionState {
    pub session_id: String,
    pub kind: CallKind,
    pub topic: Option<String>,
    pub status: SessionStatus,
    pub peers: Vec<PeerInfo>,
    pub created_at: i64,
}

/// Events pushed to a specific user's live connection.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    /// The user was placed into a session. `peers` lists the other
    /// members present at that moment.
    Matched {
        session_id: String,
        peers: Vec<PeerInfo>,
        topic: Option<String>,
    },
    /// The user's queue entry expired without a match. Also fired when an
    /// under-filled group session is abandoned.
    MatchTimeout,
    /// Another member joined the user's session.
    PeerJoined { user_id: String },
    /// A member left the user's session.
    PeerLeft { user_id: String },
    /// A member's mute flag changed.
    MuteChanged { user_id: String, muted: bool },
    /// A negotiation payload relayed from another member. The payload is
    /// opaque; the relay never interprets it.
    Signal {
        from_user_id: String,
        payload: serde_json::Value,
    },
    /// The session ended.
    SessionEnded { session_id: String },
}

/// Result of registering a live connection with the registry.
#[derive(Debug)]
pub struct ClientConnection {
    /// Ephemeral connection identifier. Changes on reconnect.
    pub connection_id: String,
    /// Stream of events pushed to this connection, in delivery order.
    pub events: mpsc::Receiver<SessionEvent>,
}

/// Registry status (for health reporting).
#[derive(Debug, Clone)]
pub struct RegistryStatus {
    /// Entries currently waiting in the matchmaking queue.
    pub queued: usize,
    /// Active and waiting sessions.
    pub sessions: usize,
    /// Live connections.
    pub connections: usize,
    /// Whether the registry is shutting down.
    pub is_draining: bool,
}

/// Messages sent to the `RegistryActor`.
#[derive(Debug)]
pub enum RegistryMessage {
    /// Register a live connection for a user. Supersedes any previous
    /// connection for the same user.
    Connect {
        user_id: String,
        respond_to: oneshot::Sender<Result<ClientConnection, CallError>>,
    },

    /// A connection dropped. Treated identically to an explicit leave for
    /// that connection's memberships.
    Disconnect { connection_id: String },

    /// Place a user in the matchmaking queue (or a waiting group session).
    Enqueue {
        user_id: String,
        kind: CallKind,
        level: Level,
        topic: Option<String>,
        respond_to: oneshot::Sender<Result<(), CallError>>,
    },

    /// Remove a user's queue entry. Replies with whether the entry was
    /// still present - `false` means a match (or expiry) won the race.
    Cancel {
        user_id: String,
        respond_to: oneshot::Sender<bool>,
    },

    /// Add a user to a `waiting` group session.
    Join {
        session_id: String,
        user_id: String,
        respond_to: oneshot::Sender<Result<(), CallError>>,
    },

    /// Remove a user from a session.
    Leave {
        session_id: String,
        user_id: String,
        respond_to: oneshot::Sender<Result<(), CallError>>,
    },

    /// Update a member's mute flag and broadcast the change.
    SetMuted {
        session_id: String,
        user_id: String,
        muted: bool,
        respond_to: oneshot::Sender<Result<(), CallError>>,
    },

    /// Forward a negotiation payload between members of a session.
    /// `to_user_id: None` broadcasts to all other members.
    Relay {
        session_id: String,
        from_user_id: String,
        to_user_id: Option<String>,
        payload: serde_json::Value,
        respond_to: oneshot::Sender<Result<(), CallError>>,
    },

    /// Fetch a session's roster snapshot.
    SessionState {
        session_id: String,
        respond_to: oneshot::Sender<Result<SessionState, CallError>>,
    },

    /// Force a session to end, notifying all members.
    EndSession {
        session_id: String,
        respond_to: oneshot::Sender<Result<(), CallError>>,
    },

    /// Get current registry status (for health checks).
    Status {
        respond_to: oneshot::Sender<RegistryStatus>,
    },
}

/// Messages sent to a `ConnectionActor`.
#[derive(Debug)]
pub enum ConnectionMessage {
    /// Deliver an event to the connected client.
    Deliver { event: SessionEvent },

    /// Close the connection gracefully.
    Close { reason: String },
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_per_kind() {
        assert_eq!(CallKind::OneOnOne.capacity(), 2);
        assert_eq!(CallKind::Topic.capacity(), 2);
        assert_eq!(CallKind::Free.capacity(), 2);
        assert_eq!(CallKind::Group.capacity(), 4);
        assert!(CallKind::Group.is_group());
        assert!(!CallKind::Free.is_group());
    }

    #[test]
    fn test_kind_round_trips_as_snake_case() {
        let json = serde_json::to_string(&CallKind::OneOnOne).unwrap();
        assert_eq!(json, "\"one_on_one\"");
        let back: CallKind = serde_json::from_str(&json).unwrap();
        assert_eq!(back, CallKind::OneOnOne);

        let level: Level = serde_json::from_str("\"beginner\"").unwrap();
        assert_eq!(level, Level::Beginner);
    }

    #[test]
    fn test_event_json_shape() {
        let event = SessionEvent::Matched {
            session_id: "s-1".to_string(),
            peers: vec![PeerInfo {
                user_id: "u-2".to_string(),
                muted: false,
            }],
            topic: Some("travel".to_string()),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "matched");
        assert_eq!(value["session_id"], "s-1");
        assert_eq!(value["peers"][0]["user_id"], "u-2");
        assert_eq!(value["topic"], "travel");

        let timeout = serde_json::to_value(SessionEvent::MatchTimeout).unwrap();
        assert_eq!(timeout["type"], "match_timeout");
    }

    #[test]
    fn test_signal_payload_is_opaque() {
        let payload = serde_json::json!({"sdp": "v=0...", "kind": "offer"});
        let event = SessionEvent::Signal {
            from_user_id: "u-1".to_string(),
            payload: payload.clone(),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["payload"], payload);
    }
}
