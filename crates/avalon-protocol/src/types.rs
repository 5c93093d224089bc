//! Core identity and game-domain types shared by every layer.
//!
//! Everything here either travels on the wire (serde-locked JSON shapes,
//! verified by the tests at the bottom) or is a closed enum replacing a
//! stringly-typed field from the legacy protocol.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::ProtocolError;

/// Number of players in a game. The engine is fixed at six; the
/// per-quest party-size table below is only valid for this count.
pub const NUM_PLAYERS: usize = 6;

/// Number of quests in a game.
pub const NUM_QUESTS: u8 = 5;

/// Party-vote rejections required for an immediate evil win.
pub const MAX_FAILED_PARTY_VOTES: u8 = 5;

/// Returns the required party size for a quest (1..=5).
///
/// Table for the fixed six-player game: quests want 2, 3, 4, 3, 4
/// members respectively. Out-of-range quest indices return `None`.
pub fn target_party_size(quest: u8) -> Option<u8> {
    const SIZES: [u8; NUM_QUESTS as usize] = [2, 3, 4, 3, 4];
    if quest == 0 {
        return None;
    }
    SIZES.get(usize::from(quest) - 1).copied()
}

// ---------------------------------------------------------------------------
// Identity types
// ---------------------------------------------------------------------------

/// A seat at the table, 1 through 6.
///
/// Newtype over `u8` so a seat can never be confused with a quest index
/// or a vote count. Construct through [`Position::new`], which enforces
/// the 1..=6 range; deserialization routes through the same check, so
/// an out-of-range seat number from the wire is a parse error, never a
/// ghost seat.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(into = "u8", try_from = "u8")]
pub struct Position(u8);

impl Position {
    /// Creates a position, rejecting anything outside 1..=6.
    pub fn new(n: u8) -> Result<Self, ProtocolError> {
        if (1..=NUM_PLAYERS as u8).contains(&n) {
            Ok(Self(n))
        } else {
            Err(ProtocolError::InvalidPosition(n))
        }
    }

    /// Returns the raw seat number (1..=6).
    pub fn get(self) -> u8 {
        self.0
    }

    /// The next seat in turn order, wrapping 6 → 1.
    pub fn next(self) -> Self {
        Self(self.0 % NUM_PLAYERS as u8 + 1)
    }

    /// Iterates all six positions in seat order.
    pub fn all() -> impl Iterator<Item = Self> {
        (1..=NUM_PLAYERS as u8).map(Self)
    }
}

impl TryFrom<u8> for Position {
    type Error = ProtocolError;

    fn try_from(n: u8) -> Result<Self, Self::Error> {
        Self::new(n)
    }
}

impl From<Position> for u8 {
    fn from(p: Position) -> u8 {
        p.0
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A stable user identifier. For agent-controlled players this is the
/// agent id handed out by the decision service.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub String);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A transient connection identifier for a human client.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub String);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An agent handle issued by the external decision service at startup.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(pub String);

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A four-letter room code, unique among the running rooms at any
/// time.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomCode(pub String);

impl fmt::Display for RoomCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Roles and alignment
// ---------------------------------------------------------------------------

/// The ten fixed role values. Any given game uses six of them.
///
/// The legacy server compared raw role strings case-insensitively in
/// half a dozen places; this closed enum with exhaustive matches is the
/// replacement. Serde/Display keep the legacy spellings ("Servant-1")
/// so logs and the decision service see the same wire values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Merlin,
    Percival,
    Assassin,
    Morgana,
    #[serde(rename = "Servant-1")]
    Servant1,
    #[serde(rename = "Servant-2")]
    Servant2,
    #[serde(rename = "Servant-3")]
    Servant3,
    #[serde(rename = "Servant-4")]
    Servant4,
    #[serde(rename = "Minion-1")]
    Minion1,
    #[serde(rename = "Minion-2")]
    Minion2,
}

impl Role {
    /// Which side the role fights for.
    pub fn team(self) -> Team {
        match self {
            Self::Merlin
            | Self::Percival
            | Self::Servant1
            | Self::Servant2
            | Self::Servant3
            | Self::Servant4 => Team::Good,
            Self::Assassin | Self::Morgana | Self::Minion1 | Self::Minion2 => Team::Evil,
        }
    }

    /// Roles visible to Merlin, i.e. every evil role in this variant
    /// (Mordred, who hides from Merlin, is not part of the six-player set).
    pub fn seen_by_merlin(self) -> bool {
        self.team() == Team::Evil
    }

    /// The canonical wire spelling of the role.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Merlin => "Merlin",
            Self::Percival => "Percival",
            Self::Assassin => "Assassin",
            Self::Morgana => "Morgana",
            Self::Servant1 => "Servant-1",
            Self::Servant2 => "Servant-2",
            Self::Servant3 => "Servant-3",
            Self::Servant4 => "Servant-4",
            Self::Minion1 => "Minion-1",
            Self::Minion2 => "Minion-2",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = ProtocolError;

    /// Case-insensitive parse accepting both "Servant-1" and "servant_1".
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let norm = s.trim().to_ascii_lowercase().replace('_', "-");
        match norm.as_str() {
            "merlin" => Ok(Self::Merlin),
            "percival" => Ok(Self::Percival),
            "assassin" => Ok(Self::Assassin),
            "morgana" => Ok(Self::Morgana),
            "servant-1" => Ok(Self::Servant1),
            "servant-2" => Ok(Self::Servant2),
            "servant-3" => Ok(Self::Servant3),
            "servant-4" => Ok(Self::Servant4),
            "minion-1" => Ok(Self::Minion1),
            "minion-2" => Ok(Self::Minion2),
            _ => Err(ProtocolError::InvalidRole(s.to_string())),
        }
    }
}

/// A role slot in a room-creation manifest. "random" and the generic
/// "servant" placeholder are resolved at role-assignment time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum RoleRequest {
    /// Any still-available role.
    Random,
    /// The next unnumbered servant slot (auto-numbered in request order).
    Servant,
    /// A specific role.
    Fixed(Role),
}

impl TryFrom<String> for RoleRequest {
    type Error = ProtocolError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.trim().to_ascii_lowercase().as_str() {
            "random" => Ok(Self::Random),
            "servant" => Ok(Self::Servant),
            _ => Role::from_str(&s).map(Self::Fixed),
        }
    }
}

impl From<RoleRequest> for String {
    fn from(r: RoleRequest) -> String {
        match r {
            RoleRequest::Random => "random".to_string(),
            RoleRequest::Servant => "servant".to_string(),
            RoleRequest::Fixed(role) => role.as_str().to_string(),
        }
    }
}

/// Good or evil.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Team {
    Good,
    Evil,
}

impl fmt::Display for Team {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Good => write!(f, "good"),
            Self::Evil => write!(f, "evil"),
        }
    }
}

/// What a player privately believes about another seat.
///
/// Merlin sees evil seats as `Evil`; Percival sees Merlin and Morgana
/// as `Unknown` (he cannot tell which is which).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Belief {
    Evil,
    Unknown,
}

/// The outcome of one quest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuestOutcome {
    Success,
    Fail,
}

// ---------------------------------------------------------------------------
// Controller — who drives a seat
// ---------------------------------------------------------------------------

/// Who is in control of a player slot.
///
/// The legacy server marked agent seats with the sentinel
/// `sessionId == userId`, a silent footgun when a human's session could
/// collide with their own user id. This explicit two-variant enum is
/// the replacement; the serde tag keeps the "human"/"agent" wire words.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Controller {
    Human { session: SessionId },
    Agent { agent: AgentId },
}

impl Controller {
    pub fn is_agent(&self) -> bool {
        matches!(self, Self::Agent { .. })
    }

    pub fn is_human(&self) -> bool {
        matches!(self, Self::Human { .. })
    }

    /// The agent handle, if this seat is agent-controlled.
    pub fn agent_id(&self) -> Option<&AgentId> {
        match self {
            Self::Agent { agent } => Some(agent),
            Self::Human { .. } => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Player
// ---------------------------------------------------------------------------

/// One seat's full private record.
///
/// Created exactly once per game at role-assignment time and owned by
/// the game state; the role and knowledge map never change afterwards,
/// only the `active` flag does (join/rejoin/leave bookkeeping).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Player {
    /// Seat position, 1..=6. Doubles as the player id on the wire.
    pub position: Position,
    /// Display name drawn from the shuffled name deck.
    pub name: String,
    /// Stable identifier (agent id for agent seats).
    pub user_id: UserId,
    /// Human session or agent handle.
    pub controller: Controller,
    /// Assigned role; never reassigned after creation.
    pub role: Role,
    /// Whether the seat currently has a live connection.
    pub active: bool,
    /// Private belief map, fixed at role-assignment time. Visible only
    /// to this player (and the audit log).
    pub knowledge: BTreeMap<Position, Belief>,
}

impl Player {
    pub fn is_agent(&self) -> bool {
        self.controller.is_agent()
    }
}

// ---------------------------------------------------------------------------
// Chat / system messages
// ---------------------------------------------------------------------------

/// Author name used for engine-generated chat lines.
pub const SYSTEM: &str = "system";

/// An immutable chat or system record. Append-only: the engine never
/// mutates or removes one (replay navigation is a client concern).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Quest during which the message was sent.
    pub quest: u8,
    /// Turn counter within the quest.
    pub turn: u32,
    /// Room the message belongs to.
    pub room: RoomCode,
    /// Author display name, or [`SYSTEM`].
    pub player: String,
    /// Message body.
    pub msg: String,
    /// Author seat, if any (`None` for system lines).
    pub pid: Option<Position>,
    /// Monotonic message id, "msg_<n>".
    pub mid: String,
    /// Failed-party-vote counter at send time, for replay context.
    pub failed_party_votes: u8,
}
