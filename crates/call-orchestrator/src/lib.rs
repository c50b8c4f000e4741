//! Call Orchestrator Library
//!
//! This library provides the real-time matchmaking and call session core
//! for the Parley conversation practice platform:
//!
//! - Matchmaking queue with proficiency-level pairing and deadlines
//! - Call sessions (one-on-one, topic, free, and four-party group calls)
//! - Opaque signaling relay between session members
//! - Per-connection event delivery with per-sender ordering
//! - Client-side call state machine with pluggable media capture
//!
//! # Architecture
//!
//! The orchestrator uses an actor model:
//!
//! ```text
//! RegistryActor (singleton)
//! ├── owns the MatchQueue and the session table
//! ├── runs the matchmaking tick (pairing, expiry, group deadlines)
//! └── supervises N ConnectionActors
//!     └── ConnectionActor (one per live client connection)
//!
//! CallClient (one per user, outside the actor tree)
//! └── drives idle -> matching -> connecting -> connected -> ended
//! ```
//!
//! # Key Design Decisions
//!
//! - **Single serialization domain**: all queue and session mutations run
//!   on the registry actor, so a match claim and an expiry sweep can never
//!   race for the same participant
//! - **One connection per user**: a reconnect supersedes the previous
//!   connection with full disconnect semantics
//! - **Opaque signaling**: relay payloads are never interpreted, only
//!   forwarded in per-sender order
//!
//! # Modules
//!
//! - [`actors`] - Actor model implementation (registry, connections)
//! - [`client`] - Client-side call controller and media abstraction
//! - [`config`] - Configuration from environment
//! - [`errors`] - Error types with appropriate error codes

pub mod actors;
pub mod client;
pub mod config;
pub mod errors;

pub use actors::messages::{
    CallKind, ClientConnection, Level, PeerInfo, RegistryStatus, SessionEvent, SessionState,
    SessionStatus,
};
pub use actors::registry::RegistryHandle;
pub use client::{CallClient, CallState, CallUpdate, EndReason, MediaSource, MediaTrack};
pub use config::Config;
pub use errors::{CallError, MediaError};
