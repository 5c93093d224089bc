//! The authoritative per-room game state.
//!
//! Plain data owned by the room actor. The JSON snapshot keeps the
//! legacy key set (including the `vote_*` booleans and `currentRound`)
//! because the audit log, the replay consumer, and the decision
//! service all read it.

use serde_json::{Value, json};

use avalon_protocol::{
    Message, Player, Position, QuestOutcome, Role, RoomCode, SYSTEM, Team, UserId,
    target_party_size,
};

/// Which vote, if any, is currently open.
///
/// The legacy state tracked three independent booleans and relied on
/// every writer clearing the other two; a single enum makes "at most
/// one vote at a time" structural.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VotePhase {
    #[default]
    Idle,
    Party,
    Quest,
    Assassin,
}

/// Full state of one game. Mutated only by the owning room actor.
#[derive(Debug)]
pub struct GameState {
    pub room: RoomCode,
    /// All six seats, sorted by position once everyone has joined.
    pub players: Vec<Player>,
    pub all_joined: bool,
    pub winner: Option<Team>,
    /// Leader of the current round (proposes the party).
    pub leader_pid: Option<Position>,
    /// Seat whose turn it is to act.
    pub turn_pid: Option<Position>,
    /// Rounds since game start, across quests.
    pub current_round: u32,
    /// Current quest, 1..=5 (0 before the first round).
    pub quest: u8,
    /// Turn counter within the current quest.
    pub turn: u32,
    pub target_party_size: u8,
    pub proposed_party: Vec<Position>,
    pub phase: VotePhase,
    /// Consecutive rejected parties in the current quest.
    pub failed_party_votes: u8,
    pub quest_results: Vec<QuestOutcome>,
    /// Append-only chat history.
    pub messages: Vec<Message>,
}

impl GameState {
    pub fn new(room: RoomCode) -> Self {
        Self {
            room,
            players: Vec::new(),
            all_joined: false,
            winner: None,
            leader_pid: None,
            turn_pid: None,
            current_round: 0,
            quest: 0,
            turn: 0,
            target_party_size: 0,
            proposed_party: Vec::new(),
            phase: VotePhase::Idle,
            failed_party_votes: 0,
            quest_results: Vec::new(),
            messages: Vec::new(),
        }
    }

    // -- lookups ------------------------------------------------------------

    pub fn player_by_user(&self, user_id: &UserId) -> Option<&Player> {
        self.players.iter().find(|p| &p.user_id == user_id)
    }

    pub fn player_by_user_mut(&mut self, user_id: &UserId) -> Option<&mut Player> {
        self.players.iter_mut().find(|p| &p.user_id == user_id)
    }

    pub fn player_by_position(&self, position: Position) -> Option<&Player> {
        self.players.iter().find(|p| p.position == position)
    }

    pub fn player_by_role(&self, role: Role) -> Option<&Player> {
        self.players.iter().find(|p| p.role == role)
    }

    /// The player whose turn it is, once the game has started.
    pub fn turn_player(&self) -> Option<&Player> {
        self.turn_pid.and_then(|pid| self.player_by_position(pid))
    }

    pub fn active_players(&self) -> usize {
        self.players.iter().filter(|p| p.active).count()
    }

    pub fn has_human_players(&self) -> bool {
        self.players.iter().any(|p| p.controller.is_human())
    }

    /// Agent-controlled seats, in position order once sorted.
    pub fn agents(&self) -> impl Iterator<Item = &Player> {
        self.players.iter().filter(|p| p.is_agent())
    }

    /// Display names of the proposed party members, joined with ", ".
    pub fn party_names(&self) -> String {
        self.proposed_party
            .iter()
            .filter_map(|pid| self.player_by_position(*pid))
            .map(|p| p.name.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Good and evil quest wins so far.
    pub fn quest_tally(&self) -> (u8, u8) {
        let good = self
            .quest_results
            .iter()
            .filter(|r| **r == QuestOutcome::Success)
            .count() as u8;
        let evil = self.quest_results.len() as u8 - good;
        (good, evil)
    }

    // -- mutation -----------------------------------------------------------

    /// Appends a chat message from the given user. Unknown users (and
    /// [`SYSTEM`]) produce a system line with no seat attached. Returns
    /// a clone of the stored message for fan-out.
    pub fn add_message(&mut self, author: &UserId, msg: impl Into<String>) -> Message {
        let (player, pid) = match self.player_by_user(author) {
            Some(p) => (p.name.clone(), Some(p.position)),
            None => (SYSTEM.to_string(), None),
        };
        let message = Message {
            quest: self.quest,
            turn: self.turn,
            room: self.room.clone(),
            player,
            msg: msg.into(),
            pid,
            mid: format!("msg_{}", self.messages.len()),
            failed_party_votes: self.failed_party_votes,
        };
        self.messages.push(message.clone());
        message
    }

    /// Appends an engine-generated system line.
    pub fn add_system_message(&mut self, msg: impl Into<String>) -> Message {
        self.add_message(&UserId(SYSTEM.to_string()), msg)
    }

    /// Clears the party and rotates leadership to the next seat; called
    /// at the start of every round. `reset_turn` additionally advances
    /// to the next quest.
    pub fn advance_round(&mut self, reset_turn: bool) {
        self.proposed_party.clear();
        let next = self.next_seat();
        self.turn_pid = Some(next);
        self.leader_pid = Some(next);
        self.current_round += 1;
        self.phase = VotePhase::Idle;

        if reset_turn {
            self.quest += 1;
            self.turn = 0;
            self.failed_party_votes = 0;
            self.target_party_size = target_party_size(self.quest).unwrap_or(0);
        } else {
            self.turn += 1;
        }
    }

    /// Passes the turn to the next seat within the current round.
    pub fn advance_turn(&mut self) {
        self.turn_pid = Some(self.next_seat());
        self.turn += 1;
        self.phase = VotePhase::Idle;
    }

    fn next_seat(&self) -> Position {
        match self.turn_pid {
            Some(pid) => pid.next(),
            // Pre-game: the first round starts at seat 1.
            None => Position::all().next().unwrap_or_else(|| unreachable!()),
        }
    }

    // -- snapshot -----------------------------------------------------------

    /// The full JSON snapshot fed to the audit log, the state diff, and
    /// the decision service.
    pub fn snapshot(&self) -> Value {
        let names: Vec<&str> = self.players.iter().map(|p| p.name.as_str()).collect();
        json!({
            "players": names,
            "all_joined": self.all_joined,
            "all_players": self.players,
            "messages": self.messages,
            "winner": self.winner.map(|t| t.to_string()).unwrap_or_default(),
            "leader_pid": self.leader_pid.map(|p| p.get()).unwrap_or(0),
            "turn_pid": self.turn_pid.map(|p| p.get()).unwrap_or(0),
            "currentRound": self.current_round,
            "quest": self.quest,
            "turn": self.turn,
            "target_party_size": self.target_party_size,
            "turn_timer": 0.0,
            "proposed_party": self.proposed_party,
            "vote_party": self.phase == VotePhase::Party,
            "vote_quest": self.phase == VotePhase::Quest,
            "vote_assassin": self.phase == VotePhase::Assassin,
            "failed_party_votes": self.failed_party_votes,
            "quest_results": self.quest_results,
        })
    }
}
