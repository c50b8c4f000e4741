//! `RegistryActor` - process-wide owner of matchmaking and session state.
//!
//! The registry is the single serialization domain for every mutation of
//! the queue and session tables: enqueue, cancel, pairing, expiry sweeps,
//! group activation deadlines, joins, leaves, and relays all run on one
//! actor task. "Claim an entry and form a group" and "expire an entry"
//! are therefore atomic with respect to each other, and two overlapping
//! match attempts can never claim the same participant.
//!
//! Event ordering: a member's `Matched` notification is pushed into their
//! connection mailbox in the same actor turn that creates the session, so
//! it always precedes any `Signal` relayed through that session.

use crate::config::Config;
use crate::errors::CallError;

use super::connection::{ConnectionActor, ConnectionActorHandle};
use super::matchmaking::{MatchQueue, QueueEntry};
use super::messages::{
    CallKind, ClientConnection, Level, RegistryMessage, RegistryStatus, SessionEvent,
    SessionState, SessionStatus,
};
use super::session::CallSession;

use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

/// Default channel buffer size for the registry mailbox.
const REGISTRY_CHANNEL_BUFFER: usize = 1000;

/// Minimum members for a group session to activate at its wait deadline.
const GROUP_ACTIVATION_MINIMUM: usize = 2;

/// Handle to the `RegistryActor`.
///
/// This is the public interface for the orchestration core. All methods
/// are async and return results via oneshot channels.
#[derive(Clone)]
pub struct RegistryHandle {
    sender: mpsc::Sender<RegistryMessage>,
    cancel_token: tokio_util::sync::CancellationToken,
}

impl RegistryHandle {
    /// Create a new `RegistryActor` and return a handle to it.
    ///
    /// This spawns the actor task and returns immediately.
    #[must_use]
    pub fn new(config: Config) -> Self {
        let (sender, receiver) = mpsc::channel(REGISTRY_CHANNEL_BUFFER);
        let cancel_token = tokio_util::sync::CancellationToken::new();

        let actor = RegistryActor::new(config, receiver, cancel_token.clone());
        tokio::spawn(actor.run());

        Self {
            sender,
            cancel_token,
        }
    }

    /// Register a live connection for a user.
    ///
    /// Returns the connection id and the event stream for that
    /// connection. A second connect for the same user supersedes (and
    /// tears down) the previous connection.
    pub async fn connect(&self, user_id: impl Into<String>) -> Result<ClientConnection, CallError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.sender
            .send(RegistryMessage::Connect {
                user_id: user_id.into(),
                respond_to: tx,
            })
            .await
            .map_err(|e| CallError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| CallError::Internal(format!("response receive failed: {e}")))?
    }

    /// Report a dropped connection. Treated identically to an explicit
    /// leave for that connection's memberships.
    pub async fn disconnect(&self, connection_id: impl Into<String>) -> Result<(), CallError> {
        self.sender
            .send(RegistryMessage::Disconnect {
                connection_id: connection_id.into(),
            })
            .await
            .map_err(|e| CallError::Internal(format!("channel send failed: {e}")))
    }

    /// Place a user in the matchmaking queue (or a waiting group
    /// session). Re-enqueueing replaces the previous entry.
    pub async fn enqueue(
        &self,
        user_id: impl Into<String>,
        kind: CallKind,
        level: Level,
        topic: Option<String>,
    ) -> Result<(), CallError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.sender
            .send(RegistryMessage::Enqueue {
                user_id: user_id.into(),
                kind,
                level,
                topic,
                respond_to: tx,
            })
            .await
            .map_err(|e| CallError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| CallError::Internal(format!("response receive failed: {e}")))?
    }

    /// Remove a user's queue entry.
    ///
    /// Returns whether the entry was still present - `false` means a
    /// match or an expiry claimed it first, and this cancel was a no-op.
    pub async fn cancel_matchmaking(&self, user_id: impl Into<String>) -> Result<bool, CallError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.sender
            .send(RegistryMessage::Cancel {
                user_id: user_id.into(),
                respond_to: tx,
            })
            .await
            .map_err(|e| CallError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| CallError::Internal(format!("response receive failed: {e}")))
    }

    /// Add a user to a `waiting` group session.
    pub async fn join(
        &self,
        session_id: impl Into<String>,
        user_id: impl Into<String>,
    ) -> Result<(), CallError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.sender
            .send(RegistryMessage::Join {
                session_id: session_id.into(),
                user_id: user_id.into(),
                respond_to: tx,
            })
            .await
            .map_err(|e| CallError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| CallError::Internal(format!("response receive failed: {e}")))?
    }

    /// Remove a user from a session.
    pub async fn leave(
        &self,
        session_id: impl Into<String>,
        user_id: impl Into<String>,
    ) -> Result<(), CallError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.sender
            .send(RegistryMessage::Leave {
                session_id: session_id.into(),
                user_id: user_id.into(),
                respond_to: tx,
            })
            .await
            .map_err(|e| CallError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| CallError::Internal(format!("response receive failed: {e}")))?
    }

    /// Update a member's mute flag; other members receive `MuteChanged`.
    pub async fn set_muted(
        &self,
        session_id: impl Into<String>,
        user_id: impl Into<String>,
        muted: bool,
    ) -> Result<(), CallError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.sender
            .send(RegistryMessage::SetMuted {
                session_id: session_id.into(),
                user_id: user_id.into(),
                muted,
                respond_to: tx,
            })
            .await
            .map_err(|e| CallError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| CallError::Internal(format!("response receive failed: {e}")))?
    }

    /// Forward an opaque negotiation payload to one member
    /// (`to_user_id: Some`) or to all other members (`None`).
    pub async fn relay(
        &self,
        session_id: impl Into<String>,
        from_user_id: impl Into<String>,
        to_user_id: Option<String>,
        payload: serde_json::Value,
    ) -> Result<(), CallError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.sender
            .send(RegistryMessage::Relay {
                session_id: session_id.into(),
                from_user_id: from_user_id.into(),
                to_user_id,
                payload,
                respond_to: tx,
            })
            .await
            .map_err(|e| CallError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| CallError::Internal(format!("response receive failed: {e}")))?
    }

    /// Fetch a session's roster snapshot.
    pub async fn session_state(
        &self,
        session_id: impl Into<String>,
    ) -> Result<SessionState, CallError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.sender
            .send(RegistryMessage::SessionState {
                session_id: session_id.into(),
                respond_to: tx,
            })
            .await
            .map_err(|e| CallError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| CallError::Internal(format!("response receive failed: {e}")))?
    }

    /// Force a session to end, notifying all members.
    pub async fn end_session(&self, session_id: impl Into<String>) -> Result<(), CallError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.sender
            .send(RegistryMessage::EndSession {
                session_id: session_id.into(),
                respond_to: tx,
            })
            .await
            .map_err(|e| CallError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| CallError::Internal(format!("response receive failed: {e}")))?
    }

    /// Get current registry status.
    pub async fn status(&self) -> Result<RegistryStatus, CallError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.sender
            .send(RegistryMessage::Status { respond_to: tx })
            .await
            .map_err(|e| CallError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| CallError::Internal(format!("response receive failed: {e}")))
    }

    /// Cancel the registry actor (shutdown).
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    /// Check if the registry is cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

/// Managed connection state.
struct ManagedConnection {
    handle: ConnectionActorHandle,
    task_handle: JoinHandle<()>,
    user_id: String,
}

/// The `RegistryActor` implementation.
pub struct RegistryActor {
    config: Config,
    receiver: mpsc::Receiver<RegistryMessage>,
    cancel_token: tokio_util::sync::CancellationToken,
    /// Waiting participants.
    queue: MatchQueue,
    /// Active and waiting sessions by id.
    sessions: HashMap<String, CallSession>,
    /// Live connections by id.
    connections: HashMap<String, ManagedConnection>,
    /// Each user's current live connection.
    user_connections: HashMap<String, String>,
    /// Each user's current session membership.
    user_sessions: HashMap<String, String>,
    /// Whether the registry is shutting down.
    is_draining: bool,
}

impl RegistryActor {
    fn new(
        config: Config,
        receiver: mpsc::Receiver<RegistryMessage>,
        cancel_token: tokio_util::sync::CancellationToken,
    ) -> Self {
        Self {
            config,
            receiver,
            cancel_token,
            queue: MatchQueue::new(),
            sessions: HashMap::new(),
            connections: HashMap::new(),
            user_connections: HashMap::new(),
            user_sessions: HashMap::new(),
            is_draining: false,
        }
    }

    /// Run the actor message loop.
    #[instrument(skip_all, name = "call.actor.registry")]
    async fn run(mut self) {
        info!(target: "call.actor.registry", "RegistryActor started");

        let mut tick = tokio::time::interval(self.config.match_tick());
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            // Reap finished connection actors before handling new work
            self.check_connection_health().await;

            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!(
                        target: "call.actor.registry",
                        "RegistryActor received cancellation signal"
                    );
                    self.graceful_shutdown().await;
                    break;
                }

                _ = tick.tick() => {
                    self.on_tick();
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => self.handle_message(message),
                        None => {
                            info!(
                                target: "call.actor.registry",
                                "RegistryActor channel closed, exiting"
                            );
                            break;
                        }
                    }
                }
            }
        }

        info!(
            target: "call.actor.registry",
            sessions_remaining = self.sessions.len(),
            "RegistryActor stopped"
        );
    }

    /// Handle a single message. Handlers never block on event delivery,
    /// so the whole dispatch path is synchronous.
    fn handle_message(&mut self, message: RegistryMessage) {
        match message {
            RegistryMessage::Connect {
                user_id,
                respond_to,
            } => {
                let result = self.handle_connect(user_id);
                let _ = respond_to.send(result);
            }

            RegistryMessage::Disconnect { connection_id } => {
                self.handle_disconnect(&connection_id);
            }

            RegistryMessage::Enqueue {
                user_id,
                kind,
                level,
                topic,
                respond_to,
            } => {
                let result = self.handle_enqueue(user_id, kind, level, topic);
                let _ = respond_to.send(result);
            }

            RegistryMessage::Cancel {
                user_id,
                respond_to,
            } => {
                let removed = self.queue.cancel(&user_id).is_some();
                if removed {
                    debug!(
                        target: "call.actor.registry",
                        user_id = %user_id,
                        "Queue entry cancelled"
                    );
                }
                let _ = respond_to.send(removed);
            }

            RegistryMessage::Join {
                session_id,
                user_id,
                respond_to,
            } => {
                let result = self.handle_join(&session_id, &user_id);
                let _ = respond_to.send(result);
            }

            RegistryMessage::Leave {
                session_id,
                user_id,
                respond_to,
            } => {
                let result = self.leave_session(&session_id, &user_id);
                let _ = respond_to.send(result);
            }

            RegistryMessage::SetMuted {
                session_id,
                user_id,
                muted,
                respond_to,
            } => {
                let result = self.handle_set_muted(&session_id, &user_id, muted);
                let _ = respond_to.send(result);
            }

            RegistryMessage::Relay {
                session_id,
                from_user_id,
                to_user_id,
                payload,
                respond_to,
            } => {
                let result =
                    self.handle_relay(&session_id, &from_user_id, to_user_id.as_deref(), payload);
                let _ = respond_to.send(result);
            }

            RegistryMessage::SessionState {
                session_id,
                respond_to,
            } => {
                let result = self
                    .sessions
                    .get(&session_id)
                    .map(CallSession::state)
                    .ok_or(CallError::SessionNotFound);
                let _ = respond_to.send(result);
            }

            RegistryMessage::EndSession {
                session_id,
                respond_to,
            } => {
                let result = if self.sessions.contains_key(&session_id) {
                    self.end_session_internal(&session_id);
                    Ok(())
                } else {
                    Err(CallError::SessionNotFound)
                };
                let _ = respond_to.send(result);
            }

            RegistryMessage::Status { respond_to } => {
                let _ = respond_to.send(RegistryStatus {
                    queued: self.queue.len(),
                    sessions: self.sessions.len(),
                    connections: self.connections.len(),
                    is_draining: self.is_draining,
                });
            }
        }
    }

    /// Register a live connection for a user.
    fn handle_connect(&mut self, user_id: String) -> Result<ClientConnection, CallError> {
        if self.is_draining {
            return Err(CallError::Draining);
        }

        // A new connection supersedes any previous one for the same user.
        // The old connection gets full disconnect semantics first, so a
        // reconnect never inherits queue entries or session memberships.
        if let Some(old_id) = self.user_connections.get(&user_id).cloned() {
            if let Some(managed) = self.connections.remove(&old_id) {
                managed.handle.cancel();
            }
            self.drop_connection(&old_id, &user_id);
        }

        let connection_id = format!("conn-{}", uuid::Uuid::new_v4());
        let token = self.cancel_token.child_token();
        let (handle, task_handle, events) =
            ConnectionActor::spawn(connection_id.clone(), user_id.clone(), token);

        self.connections.insert(
            connection_id.clone(),
            ManagedConnection {
                handle,
                task_handle,
                user_id: user_id.clone(),
            },
        );
        self.user_connections
            .insert(user_id.clone(), connection_id.clone());

        info!(
            target: "call.actor.registry",
            user_id = %user_id,
            connection_id = %connection_id,
            total_connections = self.connections.len(),
            "Connection registered"
        );

        Ok(ClientConnection {
            connection_id,
            events,
        })
    }

    /// Handle an explicit disconnect report.
    fn handle_disconnect(&mut self, connection_id: &str) {
        if let Some(managed) = self.connections.remove(connection_id) {
            managed.handle.cancel();
            let user_id = managed.user_id.clone();
            self.drop_connection(connection_id, &user_id);
        }
    }

    /// Apply disconnect semantics for a connection that is gone: remove
    /// the user's queue entry and leave their session, exactly as an
    /// explicit cancel + leave would.
    fn drop_connection(&mut self, connection_id: &str, user_id: &str) {
        let was_current = self
            .user_connections
            .get(user_id)
            .is_some_and(|c| c == connection_id);

        if !was_current {
            return;
        }
        self.user_connections.remove(user_id);
        self.queue.cancel(user_id);

        if let Some(session_id) = self.user_sessions.get(user_id).cloned() {
            let _ = self.leave_session(&session_id, user_id);
        }

        info!(
            target: "call.actor.registry",
            user_id = %user_id,
            connection_id = %connection_id,
            "Connection dropped"
        );
    }

    /// Place a user in the queue, or a waiting group session.
    fn handle_enqueue(
        &mut self,
        user_id: String,
        kind: CallKind,
        level: Level,
        topic: Option<String>,
    ) -> Result<(), CallError> {
        if self.is_draining {
            return Err(CallError::Draining);
        }
        if self.user_sessions.contains_key(&user_id) {
            return Err(CallError::AlreadyInSession);
        }
        let connection_id = self
            .user_connections
            .get(&user_id)
            .cloned()
            .ok_or(CallError::NotConnected)?;

        if kind.is_group() {
            return self.join_or_create_group(user_id, connection_id, topic);
        }

        let now = Instant::now();
        self.queue.enqueue(QueueEntry {
            user_id: user_id.clone(),
            connection_id,
            kind,
            level,
            topic,
            queued_at: now,
            deadline: now + self.config.queue_deadline(),
        });

        debug!(
            target: "call.actor.registry",
            user_id = %user_id,
            kind = ?kind,
            queued = self.queue.len(),
            "Participant enqueued"
        );

        // Pairing runs on every enqueue, not just the periodic tick
        self.run_matching();
        Ok(())
    }

    /// Drain every matchable pair from the queue into new sessions.
    fn run_matching(&mut self) {
        let pairs = self.queue.try_match(self.config.level_scan_depth);
        self.create_pair_sessions(pairs);
    }

    /// Turn queue pairs into active sessions.
    fn create_pair_sessions(&mut self, pairs: Vec<(QueueEntry, QueueEntry)>) {
        for (first, second) in pairs {
            let kind = first.kind;
            let topic = first.topic.clone();
            self.create_session(
                kind,
                topic,
                vec![
                    (first.user_id, first.connection_id),
                    (second.user_id, second.connection_id),
                ],
                None,
            );
        }
    }

    /// Create a session and notify every initial member with `Matched`.
    fn create_session(
        &mut self,
        kind: CallKind,
        topic: Option<String>,
        members: Vec<(String, String)>,
        activate_deadline: Option<Instant>,
    ) -> String {
        let session = CallSession::new(kind, topic.clone(), members, activate_deadline);
        let session_id = session.session_id().to_string();

        let notifications: Vec<(String, SessionEvent)> = session
            .members()
            .iter()
            .map(|m| {
                (
                    m.connection_id.clone(),
                    SessionEvent::Matched {
                        session_id: session_id.clone(),
                        peers: session.peers_except(Some(&m.user_id)),
                        topic: topic.clone(),
                    },
                )
            })
            .collect();

        for member in session.members() {
            self.user_sessions
                .insert(member.user_id.clone(), session_id.clone());
        }

        info!(
            target: "call.actor.registry",
            session_id = %session_id,
            kind = ?kind,
            members = session.member_count(),
            status = ?session.status(),
            "Session created"
        );

        self.sessions.insert(session_id.clone(), session);

        // Matched lands in each member's connection mailbox before any
        // relay for this session can be processed
        for (connection_id, event) in notifications {
            self.deliver_to(&connection_id, event);
        }

        session_id
    }

    /// Group enqueue: join a waiting group session, or open a new one
    /// with this user as its first member. A topic tag requires an exact
    /// match; a topic-less enqueue takes any waiting group.
    fn join_or_create_group(
        &mut self,
        user_id: String,
        connection_id: String,
        topic: Option<String>,
    ) -> Result<(), CallError> {
        let existing = self
            .sessions
            .values()
            .find(|s| {
                s.kind().is_group()
                    && s.status() == SessionStatus::Waiting
                    && (topic.is_none() || s.topic() == topic.as_deref())
            })
            .map(|s| s.session_id().to_string());

        match existing {
            Some(session_id) => self.join_session(&session_id, &user_id, &connection_id),
            None => {
                let deadline = Instant::now() + self.config.group_wait();
                self.create_session(
                    CallKind::Group,
                    topic,
                    vec![(user_id, connection_id)],
                    Some(deadline),
                );
                Ok(())
            }
        }
    }

    /// Explicit join of a waiting group session.
    fn handle_join(&mut self, session_id: &str, user_id: &str) -> Result<(), CallError> {
        let connection_id = self
            .user_connections
            .get(user_id)
            .cloned()
            .ok_or(CallError::NotConnected)?;
        self.join_session(session_id, user_id, &connection_id)
    }

    /// Add a member to a waiting session: `Matched` to the joiner,
    /// `PeerJoined` to everyone already present.
    fn join_session(
        &mut self,
        session_id: &str,
        user_id: &str,
        connection_id: &str,
    ) -> Result<(), CallError> {
        if self.user_sessions.contains_key(user_id) {
            return Err(CallError::AlreadyInSession);
        }
        let session = self
            .sessions
            .get_mut(session_id)
            .ok_or(CallError::SessionNotFound)?;

        let present: Vec<String> = session
            .members()
            .iter()
            .map(|m| m.connection_id.clone())
            .collect();

        session.add_member(user_id.to_string(), connection_id.to_string())?;

        let peers = session.peers_except(Some(user_id));
        let topic = session.topic().map(str::to_string);

        self.user_sessions
            .insert(user_id.to_string(), session_id.to_string());

        debug!(
            target: "call.actor.registry",
            session_id = %session_id,
            user_id = %user_id,
            "Member joined session"
        );

        self.deliver_to(
            connection_id,
            SessionEvent::Matched {
                session_id: session_id.to_string(),
                peers,
                topic,
            },
        );

        for peer_connection in present {
            self.deliver_to(
                &peer_connection,
                SessionEvent::PeerJoined {
                    user_id: user_id.to_string(),
                },
            );
        }

        Ok(())
    }

    /// Remove a member from a session, ending it when it can no longer
    /// continue.
    fn leave_session(&mut self, session_id: &str, user_id: &str) -> Result<(), CallError> {
        let session = self
            .sessions
            .get_mut(session_id)
            .ok_or(CallError::SessionNotFound)?;

        session.remove_member(user_id).ok_or(CallError::NotAMember)?;
        let should_end = session.should_end();
        let remaining: Vec<String> = session
            .members()
            .iter()
            .map(|m| m.connection_id.clone())
            .collect();

        self.user_sessions.remove(user_id);

        debug!(
            target: "call.actor.registry",
            session_id = %session_id,
            user_id = %user_id,
            remaining = remaining.len(),
            "Member left session"
        );

        for peer_connection in &remaining {
            self.deliver_to(
                peer_connection,
                SessionEvent::PeerLeft {
                    user_id: user_id.to_string(),
                },
            );
        }

        if should_end {
            self.end_session_internal(session_id);
        }

        Ok(())
    }

    /// End a session: remove it, notify members, release memberships.
    /// Removal from the table makes the `ended` transition exactly-once.
    fn end_session_internal(&mut self, session_id: &str) {
        let Some(mut session) = self.sessions.remove(session_id) else {
            return;
        };
        if !session.end() {
            return;
        }

        info!(
            target: "call.actor.registry",
            session_id = %session_id,
            members = session.member_count(),
            "Session ended"
        );

        for member in session.members() {
            self.user_sessions.remove(&member.user_id);
            self.deliver_to(
                &member.connection_id,
                SessionEvent::SessionEnded {
                    session_id: session_id.to_string(),
                },
            );
        }
    }

    /// Update a member's mute flag and broadcast `MuteChanged`.
    fn handle_set_muted(
        &mut self,
        session_id: &str,
        user_id: &str,
        muted: bool,
    ) -> Result<(), CallError> {
        let session = self
            .sessions
            .get_mut(session_id)
            .ok_or(CallError::SessionNotFound)?;
        session.set_muted(user_id, muted)?;

        let others: Vec<String> = session
            .members()
            .iter()
            .filter(|m| m.user_id != user_id)
            .map(|m| m.connection_id.clone())
            .collect();

        for peer_connection in others {
            self.deliver_to(
                &peer_connection,
                SessionEvent::MuteChanged {
                    user_id: user_id.to_string(),
                    muted,
                },
            );
        }

        Ok(())
    }

    /// Forward an opaque payload between session members.
    fn handle_relay(
        &mut self,
        session_id: &str,
        from_user_id: &str,
        to_user_id: Option<&str>,
        payload: serde_json::Value,
    ) -> Result<(), CallError> {
        let session = self
            .sessions
            .get(session_id)
            .ok_or(CallError::SessionNotFound)?;
        if !session.is_member(from_user_id) {
            return Err(CallError::NotAMember);
        }

        let targets: Vec<String> = match to_user_id {
            Some(target) => session
                .member(target)
                .map(|m| m.connection_id.clone())
                .into_iter()
                .collect(),
            None => session
                .members()
                .iter()
                .filter(|m| m.user_id != from_user_id)
                .map(|m| m.connection_id.clone())
                .collect(),
        };

        if to_user_id.is_some() && targets.is_empty() {
            // Signaling races with leaves and disconnects; a vanished
            // target is logged, not surfaced to the sender.
            debug!(
                target: "call.actor.registry",
                session_id = %session_id,
                "Relay target no longer in session, dropping payload"
            );
            return Ok(());
        }

        for connection_id in targets {
            self.deliver_to(
                &connection_id,
                SessionEvent::Signal {
                    from_user_id: from_user_id.to_string(),
                    payload: payload.clone(),
                },
            );
        }

        Ok(())
    }

    /// Periodic tick: retry matching, apply the deadline fallback, sweep
    /// expired queue entries, and enforce group activation deadlines.
    /// Runs on the same task as every other mutation, so expiry can never
    /// race a concurrent claim.
    fn on_tick(&mut self) {
        self.run_matching();

        let now = Instant::now();

        // Spent wait budgets pair across levels before anything expires;
        // only entries with no partition partner at all are left to the
        // sweep below.
        let fallback = self.queue.match_expiring(now);
        if !fallback.is_empty() {
            info!(
                target: "call.actor.registry",
                pairs = fallback.len(),
                "Queue deadline reached, pairing across levels"
            );
        }
        self.create_pair_sessions(fallback);

        for entry in self.queue.expire(now) {
            info!(
                target: "call.actor.registry",
                user_id = %entry.user_id,
                "Queue entry expired without a match"
            );
            self.deliver_to(&entry.connection_id, SessionEvent::MatchTimeout);
        }

        let due: Vec<String> = self
            .sessions
            .values()
            .filter(|s| s.is_activation_due(now))
            .map(|s| s.session_id().to_string())
            .collect();

        for session_id in due {
            let activate = self
                .sessions
                .get(&session_id)
                .is_some_and(|s| s.member_count() >= GROUP_ACTIVATION_MINIMUM);

            if activate {
                if let Some(session) = self.sessions.get_mut(&session_id) {
                    session.activate();
                    info!(
                        target: "call.actor.registry",
                        session_id = %session_id,
                        members = session.member_count(),
                        "Group session activated at wait deadline"
                    );
                }
            } else {
                self.abandon_group(&session_id);
            }
        }
    }

    /// Abandon an under-filled group session: members return to idle via
    /// `MatchTimeout`, exactly like an unmatched queue entry.
    fn abandon_group(&mut self, session_id: &str) {
        let Some(mut session) = self.sessions.remove(session_id) else {
            return;
        };
        session.end();

        info!(
            target: "call.actor.registry",
            session_id = %session_id,
            members = session.member_count(),
            "Group session abandoned below minimum size"
        );

        for member in session.members() {
            self.user_sessions.remove(&member.user_id);
            self.deliver_to(&member.connection_id, SessionEvent::MatchTimeout);
        }
    }

    /// Deliver an event to a connection without ever blocking the
    /// registry on a slow client.
    ///
    /// A missing connection is a soft drop. A connection whose mailbox
    /// is full has stopped reading; it is cancelled so the health check
    /// applies disconnect semantics, and the event is dropped with it.
    fn deliver_to(&self, connection_id: &str, event: SessionEvent) {
        let Some(handle) = self
            .connections
            .get(connection_id)
            .map(|c| c.handle.clone())
        else {
            debug!(
                target: "call.actor.registry",
                connection_id = %connection_id,
                "No live connection for event, dropping"
            );
            return;
        };

        if let Err(e) = handle.try_deliver(event) {
            warn!(
                target: "call.actor.registry",
                connection_id = %connection_id,
                error = %e,
                "Event delivery failed, dropping connection"
            );
            handle.cancel();
        }
    }

    /// Reap connection actors whose tasks have finished (client dropped
    /// its receiver, or the transport closed the connection).
    async fn check_connection_health(&mut self) {
        let finished: Vec<String> = self
            .connections
            .iter()
            .filter(|(_, managed)| managed.task_handle.is_finished())
            .map(|(id, _)| id.clone())
            .collect();

        for connection_id in finished {
            if let Some(managed) = self.connections.remove(&connection_id) {
                if let Err(join_error) = managed.task_handle.await {
                    if join_error.is_panic() {
                        error!(
                            target: "call.actor.registry",
                            connection_id = %connection_id,
                            error = ?join_error,
                            "Connection actor panicked"
                        );
                    }
                }
                let user_id = managed.user_id.clone();
                self.drop_connection(&connection_id, &user_id);
            }
        }
    }

    /// Perform graceful shutdown: stop accepting work and drain every
    /// connection actor.
    async fn graceful_shutdown(&mut self) {
        info!(
            target: "call.actor.registry",
            sessions = self.sessions.len(),
            connections = self.connections.len(),
            "Performing graceful shutdown"
        );

        self.is_draining = true;

        for managed in self.connections.values() {
            managed.handle.cancel();
        }

        for (connection_id, managed) in self.connections.drain() {
            match tokio::time::timeout(Duration::from_secs(5), managed.task_handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(
                        target: "call.actor.registry",
                        connection_id = %connection_id,
                        error = ?e,
                        "Connection task panicked during shutdown"
                    );
                }
                Err(_) => {
                    warn!(
                        target: "call.actor.registry",
                        connection_id = %connection_id,
                        "Connection shutdown timed out"
                    );
                }
            }
        }

        info!(target: "call.actor.registry", "Graceful shutdown complete");
    }
}
