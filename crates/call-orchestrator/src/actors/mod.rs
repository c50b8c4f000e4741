//! Actor model implementation for the call orchestrator.
//!
//! ```text
//! RegistryActor (singleton)
//! ├── owns the MatchQueue and the session table
//! ├── runs the matchmaking tick (pairing, expiry, group deadlines)
//! └── supervises N ConnectionActors
//!     └── ConnectionActor (one per live client connection)
//! ```
//!
//! # Key Design Decisions
//!
//! - **Single serialization domain**: every queue and session mutation runs
//!   on the registry task, so match claims and expiry sweeps never race
//! - **CancellationToken propagation**: connection actors get child tokens
//!   of the registry's token for graceful shutdown
//! - **Message passing**: all inter-actor communication via
//!   `tokio::sync::mpsc` channels, request-reply via `tokio::sync::oneshot`
//!
//! # Modules
//!
//! - [`registry`] - `RegistryActor` singleton owning all orchestration state
//! - [`connection`] - `ConnectionActor` per live client connection
//! - [`matchmaking`] - the waiting-participant queue and pairing policy
//! - [`session`] - call session entity (roster, status, mute flags)
//! - [`messages`] - message and event types for actor communication

pub mod connection;
pub mod matchmaking;
pub mod messages;
pub mod registry;
pub mod session;

// Re-export primary types
pub use connection::{ConnectionActor, ConnectionActorHandle};
pub use matchmaking::{MatchQueue, QueueEntry};
pub use messages::*;
pub use registry::{RegistryActor, RegistryHandle};
pub use session::{CallSession, SessionMember};
