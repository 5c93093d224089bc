//! The authoritative Avalon game engine.
//!
//! Each game runs as an isolated Tokio task (actor model) owning its
//! whole state; commands flow in through a mailbox, outbound events
//! flow to clients over per-connection channels, and agent decisions
//! travel through the [`DecisionService`] seam of `avalon-agent`.
//!
//! # Key types
//!
//! - [`Directory`] — creates rooms, routes joins, answers the lobby
//! - [`RoomHandle`] — send commands to a running room actor
//! - [`GameState`] — the replicated game state and its snapshot shape
//! - [`VoteCollector`] — one-ballot-per-seat vote accumulation
//! - [`RoleDeck`] — the shuffled role/name/seat deal
//!
//! [`DecisionService`]: avalon_agent::DecisionService

mod directory;
mod error;
mod roles;
mod room;
mod state;
mod turn;
mod votes;

pub use directory::Directory;
pub use error::EngineError;
pub use roles::{DEFAULT_NAMES, DEFAULT_ROLES, RoleDeck, RoleSlot, SeatKind, SeatRequest};
pub use room::{ClientSender, RoomConfig, RoomHandle, RoomInfo, RoomPhase, spawn_room};
pub use state::{GameState, VotePhase};
pub use turn::{MAX_AGENT_ATTEMPTS, compute_options};
pub use votes::{BallotOutcome, VoteCollector};
