//! `ConnectionActor` - per-live-connection actor.
//!
//! Each `ConnectionActor`:
//! - Handles exactly one live client connection
//! - Owns the outbound event channel to that client
//! - Forwards events in mailbox order, which is what preserves per-sender
//!   signaling order to a given recipient
//!
//! # Lifecycle
//!
//! 1. Created when the registry registers a connection for a user
//! 2. Runs until the client drops its event receiver, the connection is
//!    closed, or cancellation propagates from the registry's root token
//! 3. A finished actor task is observed by the registry's health check,
//!    which applies disconnect semantics for the user

use crate::errors::CallError;

use super::messages::{ConnectionMessage, SessionEvent};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Default channel buffer size for the connection mailbox.
const CONNECTION_CHANNEL_BUFFER: usize = 200;

/// Buffer for the outbound event channel handed to the client.
const EVENT_CHANNEL_BUFFER: usize = 64;

/// Handle to a `ConnectionActor`.
#[derive(Clone, Debug)]
pub struct ConnectionActorHandle {
    sender: mpsc::Sender<ConnectionMessage>,
    cancel_token: CancellationToken,
    connection_id: String,
    user_id: String,
}

impl ConnectionActorHandle {
    /// Get the connection ID.
    #[must_use]
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// Get the user ID.
    #[must_use]
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Deliver an event to the connected client.
    pub async fn deliver(&self, event: SessionEvent) -> Result<(), CallError> {
        self.sender
            .send(ConnectionMessage::Deliver { event })
            .await
            .map_err(|e| CallError::Internal(format!("channel send failed: {e}")))
    }

    /// Deliver an event without waiting for mailbox space.
    ///
    /// A full mailbox means the client has stopped draining events; the
    /// caller must not block on it, so the failure is surfaced
    /// immediately instead.
    pub fn try_deliver(&self, event: SessionEvent) -> Result<(), CallError> {
        self.sender
            .try_send(ConnectionMessage::Deliver { event })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => {
                    CallError::Internal("connection mailbox full".to_string())
                }
                mpsc::error::TrySendError::Closed(_) => {
                    CallError::Internal("connection mailbox closed".to_string())
                }
            })
    }

    /// Close the connection.
    pub async fn close(&self, reason: String) -> Result<(), CallError> {
        self.sender
            .send(ConnectionMessage::Close { reason })
            .await
            .map_err(|e| CallError::Internal(format!("channel send failed: {e}")))
    }

    /// Cancel the connection actor.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    /// Check if the actor is cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

/// The `ConnectionActor` implementation.
pub struct ConnectionActor {
    connection_id: String,
    user_id: String,
    receiver: mpsc::Receiver<ConnectionMessage>,
    /// Outbound event channel to the client.
    outbound: mpsc::Sender<SessionEvent>,
    /// Cancellation token (child of the registry's token).
    cancel_token: CancellationToken,
}

impl ConnectionActor {
    /// Spawn a new connection actor.
    ///
    /// Returns a handle, the task join handle, and the receiving half of
    /// the outbound event channel, which goes to the client.
    pub fn spawn(
        connection_id: String,
        user_id: String,
        cancel_token: CancellationToken,
    ) -> (
        ConnectionActorHandle,
        JoinHandle<()>,
        mpsc::Receiver<SessionEvent>,
    ) {
        let (sender, receiver) = mpsc::channel(CONNECTION_CHANNEL_BUFFER);
        let (outbound, events) = mpsc::channel(EVENT_CHANNEL_BUFFER);

        let actor = Self {
            connection_id: connection_id.clone(),
            user_id: user_id.clone(),
            receiver,
            outbound,
            cancel_token: cancel_token.clone(),
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = ConnectionActorHandle {
            sender,
            cancel_token,
            connection_id,
            user_id,
        };

        (handle, task_handle, events)
    }

    /// Run the actor message loop.
    #[instrument(
        skip_all,
        name = "call.actor.connection",
        fields(connection_id = %self.connection_id, user_id = %self.user_id)
    )]
    async fn run(mut self) {
        debug!(
            target: "call.actor.connection",
            connection_id = %self.connection_id,
            user_id = %self.user_id,
            "ConnectionActor started"
        );

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    debug!(
                        target: "call.actor.connection",
                        connection_id = %self.connection_id,
                        "ConnectionActor received cancellation signal"
                    );
                    break;
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            if self.handle_message(message).await {
                                break;
                            }
                        }
                        None => {
                            debug!(
                                target: "call.actor.connection",
                                connection_id = %self.connection_id,
                                "ConnectionActor channel closed, exiting"
                            );
                            break;
                        }
                    }
                }
            }
        }

        info!(
            target: "call.actor.connection",
            connection_id = %self.connection_id,
            user_id = %self.user_id,
            "ConnectionActor stopped"
        );
    }

    /// Handle a single message. Returns true if the actor should exit.
    async fn handle_message(&mut self, message: ConnectionMessage) -> bool {
        match message {
            ConnectionMessage::Deliver { event } => {
                // The forward can stall on a client that reads slowly, so
                // it must stay cancellable; backpressure is confined to
                // this one connection's task either way.
                let send_result = tokio::select! {
                    () = self.cancel_token.cancelled() => return true,
                    result = self.outbound.send(event) => result,
                };
                if send_result.is_err() {
                    // Client dropped its receiver: the connection is dead.
                    // Exiting lets the registry's health check apply
                    // disconnect semantics.
                    warn!(
                        target: "call.actor.connection",
                        connection_id = %self.connection_id,
                        user_id = %self.user_id,
                        "Client event channel closed, dropping connection"
                    );
                    return true;
                }
                false
            }

            ConnectionMessage::Close { reason } => {
                debug!(
                    target: "call.actor.connection",
                    connection_id = %self.connection_id,
                    reason = %reason,
                    "Closing connection"
                );
                true
            }
        }
    }
}
