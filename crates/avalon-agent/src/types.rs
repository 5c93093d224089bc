//! Request/response payloads of the decision-service HTTP contract.
//!
//! All JSON over HTTP. Field names are part of the contract with the
//! externally hosted agent manager and must not drift.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use avalon_protocol::{ActionKind, Belief, Position, Role, RoomCode};

/// `GET /api/startup/` query parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartupRequest {
    pub game_id: RoomCode,
    pub agent_type: String,
    pub agent_role_preference: String,
    pub agent_name: String,
}

/// `GET /api/startup/` response body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartupResponse {
    pub success: bool,
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub agent_role_preference: Option<String>,
    #[serde(default)]
    pub agent_name_preference: Option<String>,
}

/// The task block of an action request: the legal action set for this
/// attempt, the current quest's party size, and the attempt counter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentTask {
    pub task: Vec<ActionKind>,
    pub target_party_size: u8,
    pub sequence: u32,
}

/// A state notification: structural changes plus the full snapshot.
///
/// Also reused as the `state` block of an action request (with empty
/// `changes`), matching the legacy wire format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateUpdate {
    pub timestamp: String,
    pub changes: serde_json::Value,
    pub full: serde_json::Value,
}

/// `POST /api/agent/{id}/action/` request body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRequest {
    pub task: AgentTask,
    pub state: StateUpdate,
}

/// The data block of an agent's chosen action. Which fields are present
/// depends on the action: `msg` for chat, `party` for proposals, `vote`
/// for ballots, `guess` for the assassination target.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ActionData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub party: Option<Vec<Position>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vote: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guess: Option<Position>,
    /// Raw LLM trace, forwarded verbatim to the game log when present.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub llm_data: Vec<serde_json::Value>,
}

/// `POST /api/agent/{id}/action/` response body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionResponse {
    pub success: bool,
    #[serde(default)]
    pub action: Option<ActionKind>,
    #[serde(default)]
    pub data: Option<ActionData>,
}

/// `POST /api/agent/{id}/private_data/` body: everything an agent needs
/// to reason about its seat. The full name→role map deliberately goes
/// only to the service, never to human clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrivateData {
    pub name: String,
    pub role: Role,
    pub pid: Position,
    pub knowledge: BTreeMap<Position, Belief>,
    /// Display names of the seats this player knows something about,
    /// keyed by their position.
    pub named_knowledge: BTreeMap<Position, String>,
    /// Display name → role for every seat.
    pub all_players: BTreeMap<String, Role>,
    /// Seat order → display name.
    pub order_to_name: BTreeMap<Position, String>,
}

/// Generic acknowledgement for the fire-and-forget push endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ack {
    pub success: bool,
    #[serde(default)]
    pub message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pos(n: u8) -> Position {
        Position::new(n).unwrap()
    }

    #[test]
    fn action_request_wire_shape() {
        let req = ActionRequest {
            task: AgentTask {
                task: vec![ActionKind::EndTurn, ActionKind::Message],
                target_party_size: 3,
                sequence: 2,
            },
            state: StateUpdate {
                timestamp: "2025-01-01T00:00:00Z".into(),
                changes: serde_json::json!({}),
                full: serde_json::json!({"quest": 2}),
            },
        };
        let json: serde_json::Value = serde_json::to_value(&req).unwrap();
        assert_eq!(json["task"]["task"], serde_json::json!(["end_turn", "message"]));
        assert_eq!(json["task"]["target_party_size"], 3);
        assert_eq!(json["task"]["sequence"], 2);
        assert_eq!(json["state"]["full"]["quest"], 2);
    }

    #[test]
    fn action_response_tolerates_missing_fields() {
        let resp: ActionResponse = serde_json::from_str(r#"{"success": false}"#).unwrap();
        assert!(!resp.success);
        assert!(resp.action.is_none());
        assert!(resp.data.is_none());
    }

    #[test]
    fn action_response_parses_vote() {
        let json = r#"{"success": true, "action": "vote_party", "data": {"vote": true}}"#;
        let resp: ActionResponse = serde_json::from_str(json).unwrap();
        assert_eq!(resp.action, Some(ActionKind::VoteParty));
        assert_eq!(resp.data.unwrap().vote, Some(true));
    }

    #[test]
    fn action_response_rejects_out_of_range_seats() {
        let party = r#"{"success": true, "action": "propose_party", "data": {"party": [9, 10]}}"#;
        assert!(serde_json::from_str::<ActionResponse>(party).is_err());
        let guess = r#"{"success": true, "action": "vote_assassin", "data": {"guess": 0}}"#;
        assert!(serde_json::from_str::<ActionResponse>(guess).is_err());
    }

    #[test]
    fn action_data_omits_absent_fields() {
        let data = ActionData {
            party: Some(vec![pos(2), pos(5)]),
            ..ActionData::default()
        };
        let json: serde_json::Value = serde_json::to_value(&data).unwrap();
        assert_eq!(json, serde_json::json!({"party": [2, 5]}));
    }

    #[test]
    fn startup_response_round_trip() {
        let json = r#"{
            "success": true,
            "agent_id": "agent-7",
            "agent_role_preference": "Merlin",
            "agent_name_preference": "Kira"
        }"#;
        let resp: StartupResponse = serde_json::from_str(json).unwrap();
        assert_eq!(resp.agent_id.as_deref(), Some("agent-7"));
        assert_eq!(resp.agent_role_preference.as_deref(), Some("Merlin"));
    }
}
