//! Wire types, roles, and the action vocabulary for the Avalon engine.
//!
//! This crate is the shared language of the workspace: seat and user
//! identity newtypes, the closed [`Role`]/[`Team`]/[`Belief`] enums,
//! the explicit [`Controller`] enum (human vs. agent control), chat
//! [`Message`] records, and the inbound/outbound room message enums.
//! JSON shapes are locked by serde tests because the decision service,
//! the game log, and the replay consumer all parse them.

mod actions;
mod error;
mod types;

pub use actions::{ActionKind, ClientAction, RoomOverview, ServerEvent};
pub use error::ProtocolError;
pub use types::{
    AgentId, Belief, Controller, Message, Player, Position, QuestOutcome, Role, RoleRequest,
    RoomCode, SessionId, Team, UserId, MAX_FAILED_PARTY_VOTES, NUM_PLAYERS, NUM_QUESTS, SYSTEM,
    target_party_size,
};
