//! Log record types.
//!
//! One JSON object per event, tagged by `msgtype`. The `game` entries
//! (changes + full snapshot) are the sole source of truth for replay
//! reconstruction, so their shape is locked by tests.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use avalon_protocol::{ActionKind, Belief, Position, Role};

/// Returns the current wall-clock time as an RFC 3339 string, the
/// timestamp format of every log record and state notification.
pub fn now_iso() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// A single audit-log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "msgtype", rename_all = "snake_case")]
pub enum LogRecord {
    /// A state mutation: the structural diff and the full snapshot it
    /// produced.
    Game {
        timestamp: String,
        changes: serde_json::Value,
        full: serde_json::Value,
    },

    /// One seat's private setup, written once when all players joined.
    Player {
        timestamp: String,
        name: String,
        role: Role,
        pid: Position,
        knowledge: BTreeMap<Position, Belief>,
        /// Agent flavor requested in the manifest ("unknown" for humans).
        #[serde(rename = "type")]
        agent_type: String,
        /// "agent" or "human".
        player: String,
    },

    /// The raw LLM trace behind an agent action, when the decision
    /// service returned one.
    LlmMessage {
        timestamp: String,
        action: ActionKind,
        agent: String,
        data: Vec<serde_json::Value>,
    },

    /// A fatal or degraded-mode fault.
    Error { timestamp: String, message: String },
}

impl LogRecord {
    /// Builds a `game` entry stamped with the current time.
    pub fn game(changes: serde_json::Value, full: serde_json::Value) -> Self {
        Self::Game {
            timestamp: now_iso(),
            changes,
            full,
        }
    }

    /// Builds an `error` entry stamped with the current time.
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            timestamp: now_iso(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn game_record_msgtype_tag() {
        let record = LogRecord::game(
            serde_json::json!({"quest": 2}),
            serde_json::json!({"quest": 2, "turn": 0}),
        );
        let json: serde_json::Value = serde_json::to_value(&record).unwrap();
        assert_eq!(json["msgtype"], "game");
        assert_eq!(json["changes"]["quest"], 2);
        assert_eq!(json["full"]["turn"], 0);
        assert!(json["timestamp"].is_string());
    }

    #[test]
    fn llm_message_tag_is_snake_case() {
        let record = LogRecord::LlmMessage {
            timestamp: now_iso(),
            action: ActionKind::VoteParty,
            agent: "Kira".into(),
            data: vec![serde_json::json!({"thought": "approve"})],
        };
        let json: serde_json::Value = serde_json::to_value(&record).unwrap();
        assert_eq!(json["msgtype"], "llm_message");
        assert_eq!(json["action"], "vote_party");
    }

    #[test]
    fn player_record_uses_type_key() {
        let record = LogRecord::Player {
            timestamp: now_iso(),
            name: "Mia".into(),
            role: Role::Merlin,
            pid: Position::new(4).unwrap(),
            knowledge: BTreeMap::new(),
            agent_type: "recon".into(),
            player: "agent".into(),
        };
        let json: serde_json::Value = serde_json::to_value(&record).unwrap();
        assert_eq!(json["msgtype"], "player");
        assert_eq!(json["type"], "recon");
        assert_eq!(json["role"], "Merlin");
        assert_eq!(json["pid"], 4);
    }

    #[test]
    fn error_record_round_trips() {
        let record = LogRecord::error("agent Luca exceeded maximum action attempts");
        let bytes = serde_json::to_vec(&record).unwrap();
        let back: LogRecord = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(record, back);
    }
}
