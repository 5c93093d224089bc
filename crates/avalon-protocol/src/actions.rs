//! The action vocabulary: what clients and agents send in, what the
//! room emits back out.
//!
//! The inbound/outbound JSON tags are the legacy wire words
//! (`send_message`, `vote_result`, `private_data`, ...) so existing
//! clients and the replay consumer keep working unchanged.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{Message, Player, Position, RoomCode, UserId};

// ---------------------------------------------------------------------------
// Inbound: client/agent → room
// ---------------------------------------------------------------------------

/// An inbound room message. Every variant carries the acting user so
/// the room can gate it against seat, leadership, and phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientAction {
    /// Append a chat message and fan it out to agents.
    SendMessage { user_id: UserId, msg: String },

    /// Advance the turn, if the sender currently holds it.
    EndTurn { user_id: UserId },

    /// Set the proposed party, if the sender is the on-turn leader.
    ProposeParty {
        user_id: UserId,
        party: Vec<Position>,
    },

    /// Open the party vote (leader-gated).
    VoteParty { user_id: UserId },

    /// A ballot for whichever vote phase is currently active.
    VoteResult { user_id: UserId, vote: bool },

    /// The Assassin's single shot at Merlin.
    Assassination { user_id: UserId, target: Position },
}

impl ClientAction {
    /// The acting user, common to every variant.
    pub fn user_id(&self) -> &UserId {
        match self {
            Self::SendMessage { user_id, .. }
            | Self::EndTurn { user_id }
            | Self::ProposeParty { user_id, .. }
            | Self::VoteParty { user_id }
            | Self::VoteResult { user_id, .. }
            | Self::Assassination { user_id, .. } => user_id,
        }
    }
}

// ---------------------------------------------------------------------------
// Outbound: room → client/spectator
// ---------------------------------------------------------------------------

/// A room listing entry for lobby and game discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomOverview {
    pub room: RoomCode,
    pub players: usize,
    pub all_joined: bool,
}

/// An outbound room event.
///
/// `private_data` goes to exactly one player; `spectator_data` reveals
/// the full roster and only ever goes to spectators. State snapshots
/// travel as raw JSON so the presentation layer's sync protocol stays
/// out of the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    /// One player's role and knowledge. Never broadcast.
    PrivateData { player: Player },

    /// The full role-revealing roster, for spectators only.
    SpectatorData { players: Vec<Player> },

    /// Joinable rooms, for the lobby.
    LobbyOverview { rooms: Vec<RoomOverview> },

    /// Running games, for discovery.
    GameOverview { rooms: Vec<RoomOverview> },

    /// A new chat/system line.
    NewMessages { messages: Vec<Message> },

    /// Replay navigation rolled messages back past these ids.
    RemovedMessages { mids: Vec<String> },

    /// Structural state delta plus the full snapshot it produced.
    StateSync {
        changes: serde_json::Value,
        full: serde_json::Value,
    },

    /// The final human-readable summary, sent before teardown.
    GameOver { msg: String },
}

// ---------------------------------------------------------------------------
// ActionKind — the legal-action alphabet for agent turns
// ---------------------------------------------------------------------------

/// One legal action an agent may pick during its turn. The serde
/// spellings are the task words of the decision-service contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    EndTurn,
    Message,
    ProposeParty,
    StartPartyVote,
    VoteParty,
    VoteQuest,
    VoteAssassin,
}

impl ActionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::EndTurn => "end_turn",
            Self::Message => "message",
            Self::ProposeParty => "propose_party",
            Self::StartPartyVote => "start_party_vote",
            Self::VoteParty => "vote_party",
            Self::VoteQuest => "vote_quest",
            Self::VoteAssassin => "vote_assassin",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pos(n: u8) -> Position {
        Position::new(n).unwrap()
    }

    #[test]
    fn client_action_uses_legacy_tags() {
        let action = ClientAction::ProposeParty {
            user_id: UserId("u-1".into()),
            party: vec![pos(2), pos(5)],
        };
        let json: serde_json::Value = serde_json::to_value(&action).unwrap();
        assert_eq!(json["type"], "propose_party");
        assert_eq!(json["party"], serde_json::json!([2, 5]));
    }

    #[test]
    fn client_action_round_trips() {
        let actions = vec![
            ClientAction::SendMessage {
                user_id: UserId("u".into()),
                msg: "hello".into(),
            },
            ClientAction::EndTurn {
                user_id: UserId("u".into()),
            },
            ClientAction::VoteParty {
                user_id: UserId("u".into()),
            },
            ClientAction::VoteResult {
                user_id: UserId("u".into()),
                vote: true,
            },
            ClientAction::Assassination {
                user_id: UserId("u".into()),
                target: pos(4),
            },
        ];
        for action in actions {
            let bytes = serde_json::to_vec(&action).unwrap();
            let back: ClientAction = serde_json::from_slice(&bytes).unwrap();
            assert_eq!(action, back);
        }
    }

    #[test]
    fn vote_result_json_format() {
        let json = r#"{"type": "vote_result", "user_id": "u-3", "vote": false}"#;
        let action: ClientAction = serde_json::from_str(json).unwrap();
        assert_eq!(
            action,
            ClientAction::VoteResult {
                user_id: UserId("u-3".into()),
                vote: false,
            }
        );
    }

    #[test]
    fn action_kind_wire_words() {
        assert_eq!(
            serde_json::to_string(&ActionKind::StartPartyVote).unwrap(),
            "\"start_party_vote\""
        );
        assert_eq!(ActionKind::VoteAssassin.to_string(), "vote_assassin");
        let kind: ActionKind = serde_json::from_str("\"end_turn\"").unwrap();
        assert_eq!(kind, ActionKind::EndTurn);
    }

    #[test]
    fn server_event_game_over_tag() {
        let event = ServerEvent::GameOver {
            msg: "Good wins by succeeding three quests!".into(),
        };
        let json: serde_json::Value = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "game_over");
    }

    #[test]
    fn unknown_action_tag_is_rejected() {
        let json = r#"{"type": "fly_to_moon", "user_id": "u"}"#;
        assert!(serde_json::from_str::<ClientAction>(json).is_err());
    }
}
