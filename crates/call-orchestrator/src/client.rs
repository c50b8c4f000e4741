//! Client-side call controller: the state machine a UI drives.
//!
//! [`CallClient`] owns one live connection to the registry and walks a
//! single call through `idle -> matching -> connecting -> connected ->
//! ended`. Media acquisition is abstracted behind [`MediaSource`] so the
//! controller can be driven in tests without real capture devices.
//!
//! Mute is lockstep state: [`CallClient::toggle_mute`] first records the
//! flag with the registry (so peers observe it) and then disables the
//! local track, keeping the advertised flag and the actual track enabled
//! state in agreement.

use crate::actors::messages::{CallKind, Level, SessionEvent, SessionState};
use crate::actors::registry::RegistryHandle;
use crate::config::Config;
use crate::errors::{CallError, MediaError};

use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

/// A live local media track.
///
/// Dropping the track releases the underlying capture device.
pub trait MediaTrack: Send {
    /// Enable or disable the track. A muted call keeps the track alive
    /// but disabled, mirroring how capture devices stay warm across
    /// mute toggles.
    fn set_enabled(&mut self, enabled: bool);

    /// Whether the track is currently producing media.
    fn is_enabled(&self) -> bool;
}

/// Source of local media tracks.
#[async_trait]
pub trait MediaSource: Send + Sync {
    /// Acquire a capture track. Called once per call, after a match.
    async fn acquire(&self) -> Result<Box<dyn MediaTrack>, MediaError>;
}

/// Client call lifecycle state. Transitions only move forward within a
/// call; `ended` resets to `idle` when the next call starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Idle,
    Matching,
    Connecting,
    Connected,
    Ended,
}

/// Why a call reached `ended`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    /// The local user hung up.
    Hangup,
    /// The session ended remotely.
    SessionEnded,
    /// Local media acquisition failed after a match.
    MediaFailed,
}

/// Call progress surfaced to the UI by [`CallClient::next_update`].
#[derive(Debug)]
pub enum CallUpdate {
    /// A match completed and media is live.
    Connected { session: SessionState },
    /// Another member joined the call.
    PeerJoined { user_id: String },
    /// A member left the call.
    PeerLeft { user_id: String },
    /// A member's mute flag changed.
    MuteChanged { user_id: String, muted: bool },
    /// A negotiation payload from another member.
    Signal {
        from_user_id: String,
        payload: serde_json::Value,
    },
    /// Matchmaking expired without a partner.
    TimedOut,
    /// The call ended.
    Ended { reason: EndReason },
}

/// Client-side call controller.
///
/// One `CallClient` per user connection. The owner drives it by calling
/// [`CallClient::next_update`] in a loop and reacting to the updates.
pub struct CallClient<M: MediaSource> {
    user_id: String,
    registry: RegistryHandle,
    connection_id: String,
    events: mpsc::Receiver<SessionEvent>,
    media: M,
    track: Option<Box<dyn MediaTrack>>,
    state: CallState,
    session_id: Option<String>,
    muted: bool,
    countdown: Duration,
    countdown_deadline: Option<Instant>,
}

impl<M: MediaSource> CallClient<M> {
    /// Register a live connection with the registry and return a
    /// controller bound to it.
    pub async fn connect(
        registry: RegistryHandle,
        user_id: impl Into<String>,
        media: M,
        config: &Config,
    ) -> Result<Self, CallError> {
        let user_id = user_id.into();
        let connection = registry.connect(user_id.clone()).await?;

        Ok(Self {
            user_id,
            registry,
            connection_id: connection.connection_id,
            events: connection.events,
            media,
            track: None,
            state: CallState::Idle,
            session_id: None,
            muted: false,
            countdown: config.countdown(),
            countdown_deadline: None,
        })
    }

    #[must_use]
    pub fn state(&self) -> CallState {
        self.state
    }

    #[must_use]
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    #[must_use]
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    #[must_use]
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    #[must_use]
    pub fn is_muted(&self) -> bool {
        self.muted
    }

    /// Seconds left on the matchmaking countdown, for UI display.
    #[must_use]
    pub fn remaining_secs(&self) -> Option<u64> {
        self.countdown_deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()).as_secs())
    }

    /// Enter matchmaking.
    ///
    /// Valid from `idle` or `ended` (a finished call resets implicitly).
    pub async fn start_matchmaking(
        &mut self,
        kind: CallKind,
        level: Level,
        topic: Option<String>,
    ) -> Result<(), CallError> {
        match self.state {
            CallState::Idle | CallState::Ended => {}
            CallState::Matching | CallState::Connecting | CallState::Connected => {
                return Err(CallError::AlreadyInSession);
            }
        }
        self.reset();

        self.registry
            .enqueue(self.user_id.clone(), kind, level, topic)
            .await?;

        self.state = CallState::Matching;
        self.countdown_deadline = Some(Instant::now() + self.countdown);
        Ok(())
    }

    /// Leave the queue before a match.
    ///
    /// Returns `false` when a match already claimed the entry; the
    /// `Matched` event is then in flight and the controller keeps
    /// waiting for it.
    pub async fn cancel_matchmaking(&mut self) -> Result<bool, CallError> {
        if self.state != CallState::Matching {
            return Ok(false);
        }

        let removed = self.registry.cancel_matchmaking(self.user_id.clone()).await?;
        if removed {
            self.state = CallState::Idle;
            self.countdown_deadline = None;
        } else {
            debug!(
                target: "call.client",
                user_id = %self.user_id,
                "Cancel lost the race to a match, awaiting Matched"
            );
        }
        Ok(removed)
    }

    /// Wait for the next call progress update.
    ///
    /// This is the controller's event loop body: it blocks on registry
    /// events (and the matchmaking countdown while `matching`) and
    /// translates them into [`CallUpdate`]s, advancing the state machine
    /// along the way.
    pub async fn next_update(&mut self) -> Result<CallUpdate, CallError> {
        loop {
            if self.state == CallState::Ended {
                self.reset();
            }

            let event = if self.state == CallState::Matching {
                match self.recv_or_countdown().await? {
                    Some(event) => event,
                    None => {
                        // Countdown expired. If cancel loses to a match
                        // the Matched event is already in flight, so keep
                        // waiting for it instead of timing out.
                        if self.registry.cancel_matchmaking(self.user_id.clone()).await? {
                            self.reset();
                            return Ok(CallUpdate::TimedOut);
                        }
                        self.countdown_deadline = None;
                        continue;
                    }
                }
            } else {
                match self.events.recv().await {
                    Some(event) => event,
                    None => return Err(CallError::NotConnected),
                }
            };

            if let Some(update) = self.apply_event(event).await? {
                return Ok(update);
            }
        }
    }

    /// Toggle the local mute flag.
    ///
    /// Registry first, then the local track, so peers never observe a
    /// flag that disagrees with what the track will settle to.
    pub async fn toggle_mute(&mut self) -> Result<bool, CallError> {
        if self.state != CallState::Connected {
            return Err(CallError::NotAMember);
        }
        let session_id = self
            .session_id
            .clone()
            .ok_or_else(|| CallError::Internal("connected without a session id".to_string()))?;

        let muted = !self.muted;
        self.registry
            .set_muted(session_id, self.user_id.clone(), muted)
            .await?;

        self.muted = muted;
        if let Some(track) = self.track.as_mut() {
            track.set_enabled(!muted);
        }
        Ok(muted)
    }

    /// Forward a negotiation payload to one member (`to: Some`) or all
    /// other members (`None`).
    pub async fn send_signal(
        &mut self,
        to_user_id: Option<String>,
        payload: serde_json::Value,
    ) -> Result<(), CallError> {
        if self.state != CallState::Connected {
            return Err(CallError::NotAMember);
        }
        let session_id = self
            .session_id
            .clone()
            .ok_or_else(|| CallError::Internal("connected without a session id".to_string()))?;

        self.registry
            .relay(session_id, self.user_id.clone(), to_user_id, payload)
            .await
    }

    /// Hang up. Releases media, leaves the session if in one, and lands
    /// in `ended`. Safe to call in any state.
    pub async fn end_call(&mut self) -> Result<(), CallError> {
        self.track = None;

        if self.state == CallState::Matching {
            let _ = self.registry.cancel_matchmaking(self.user_id.clone()).await;
        }

        if let Some(session_id) = self.session_id.take() {
            // The session may already be gone (peer hung up first);
            // hangup still succeeds locally.
            if let Err(e) = self
                .registry
                .leave(session_id, self.user_id.clone())
                .await
            {
                match e {
                    CallError::SessionNotFound | CallError::NotAMember => {}
                    other => {
                        warn!(
                            target: "call.client",
                            user_id = %self.user_id,
                            error = %other,
                            "Leave failed during hangup"
                        );
                    }
                }
            }
        }

        self.state = CallState::Ended;
        self.countdown_deadline = None;
        Ok(())
    }

    /// Receive an event, or `None` when the matchmaking countdown fires.
    async fn recv_or_countdown(&mut self) -> Result<Option<SessionEvent>, CallError> {
        let deadline = self
            .countdown_deadline
            .unwrap_or_else(|| Instant::now() + self.countdown);

        tokio::select! {
            event = self.events.recv() => match event {
                Some(event) => Ok(Some(event)),
                None => Err(CallError::NotConnected),
            },
            () = tokio::time::sleep_until(deadline) => Ok(None),
        }
    }

    /// Advance the state machine on one registry event. Returns the
    /// update to surface, or `None` for events absorbed internally.
    async fn apply_event(&mut self, event: SessionEvent) -> Result<Option<CallUpdate>, CallError> {
        match event {
            SessionEvent::Matched { session_id, .. } => {
                self.state = CallState::Connecting;
                self.countdown_deadline = None;
                self.session_id = Some(session_id.clone());

                match self.media.acquire().await {
                    Ok(mut track) => {
                        track.set_enabled(!self.muted);
                        self.track = Some(track);

                        let session = match self.registry.session_state(session_id).await {
                            Ok(session) => session,
                            Err(CallError::SessionNotFound) => {
                                // Collapsed between match and connect; the
                                // terminal events are already in flight.
                                self.track = None;
                                self.session_id = None;
                                self.state = CallState::Ended;
                                return Ok(Some(CallUpdate::Ended {
                                    reason: EndReason::SessionEnded,
                                }));
                            }
                            Err(other) => return Err(other),
                        };
                        self.state = CallState::Connected;
                        Ok(Some(CallUpdate::Connected { session }))
                    }
                    Err(e) => {
                        warn!(
                            target: "call.client",
                            user_id = %self.user_id,
                            error = %e,
                            "Media acquisition failed, leaving session"
                        );
                        if let Some(session_id) = self.session_id.take() {
                            let _ = self
                                .registry
                                .leave(session_id, self.user_id.clone())
                                .await;
                        }
                        self.state = CallState::Ended;
                        Ok(Some(CallUpdate::Ended {
                            reason: EndReason::MediaFailed,
                        }))
                    }
                }
            }

            SessionEvent::MatchTimeout => {
                // From the queue deadline, or from an abandoned group
                // session the controller was already connected to. A
                // failed match goes straight back to idle; a collapsed
                // call passes through ended first.
                if self.state == CallState::Matching {
                    self.reset();
                } else {
                    self.track = None;
                    self.session_id = None;
                    self.state = CallState::Ended;
                    self.countdown_deadline = None;
                }
                Ok(Some(CallUpdate::TimedOut))
            }

            SessionEvent::PeerJoined { user_id } => Ok(Some(CallUpdate::PeerJoined { user_id })),

            SessionEvent::PeerLeft { user_id } => Ok(Some(CallUpdate::PeerLeft { user_id })),

            SessionEvent::MuteChanged { user_id, muted } => {
                Ok(Some(CallUpdate::MuteChanged { user_id, muted }))
            }

            SessionEvent::Signal {
                from_user_id,
                payload,
            } => Ok(Some(CallUpdate::Signal {
                from_user_id,
                payload,
            })),

            SessionEvent::SessionEnded { .. } => {
                self.track = None;
                self.session_id = None;
                self.state = CallState::Ended;
                Ok(Some(CallUpdate::Ended {
                    reason: EndReason::SessionEnded,
                }))
            }
        }
    }

    /// Reset to `idle` for the next call.
    fn reset(&mut self) {
        self.state = CallState::Idle;
        self.session_id = None;
        self.track = None;
        self.muted = false;
        self.countdown_deadline = None;
    }
}
