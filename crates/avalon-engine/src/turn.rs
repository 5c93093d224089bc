//! Turn rules: which actions are legal when, ballot tallies, and
//! end-of-game checks.
//!
//! Pure functions over [`GameState`] so every rule is testable without
//! a running room actor. The actor in `room.rs` is the only caller.

use std::collections::{BTreeMap, HashSet};

use avalon_agent::ActionData;
use avalon_protocol::{ActionKind, NUM_PLAYERS, Role, Team, UserId};

use crate::{GameState, VotePhase};

/// Total decision attempts an agent gets per turn before the room
/// gives up on it.
pub const MAX_AGENT_ATTEMPTS: u32 = 10;

/// The legal action set for whoever currently holds the turn.
///
/// Chat and ending the turn are always on offer outside votes; the
/// on-turn leader may additionally propose a party, and open the vote
/// once the proposal is full. During a vote the set collapses to the
/// matching ballot action. An on-turn Assassin always has the
/// assassination on top.
pub fn compute_options(state: &GameState) -> Vec<ActionKind> {
    let mut options = vec![ActionKind::EndTurn, ActionKind::Message];

    let is_leader_turn =
        state.leader_pid.is_some() && state.leader_pid == state.turn_pid;

    if is_leader_turn && state.phase == VotePhase::Idle {
        options.push(ActionKind::ProposeParty);
        if state.proposed_party.len() == state.target_party_size as usize {
            options.push(ActionKind::StartPartyVote);
        }
    } else if state.phase == VotePhase::Party {
        options = vec![ActionKind::VoteParty];
    } else if state.phase == VotePhase::Quest {
        options = vec![ActionKind::VoteQuest];
    }

    if state.turn_player().is_some_and(|p| p.role == Role::Assassin) {
        options.push(ActionKind::VoteAssassin);
    }

    options
}

/// Checks an action structurally and against the current phase.
/// Returns the rejection reason, which the agent loop feeds back as a
/// retry and the human path drops silently.
pub fn validate_action(
    state: &GameState,
    actor: &UserId,
    kind: ActionKind,
    data: &ActionData,
) -> Result<(), String> {
    let Some(player) = state.player_by_user(actor) else {
        return Err("player not found".to_string());
    };

    match kind {
        ActionKind::Message => {
            if data.msg.as_deref().is_none_or(|m| m.trim().is_empty()) {
                return Err("empty message".to_string());
            }
        }
        ActionKind::ProposeParty => {
            let Some(party) = &data.party else {
                return Err("missing party data".to_string());
            };
            if party.len() != state.target_party_size as usize {
                return Err("party size mismatch".to_string());
            }
            if Some(player.position) != state.leader_pid {
                return Err("player is not the leader".to_string());
            }
            let unique: HashSet<_> = party.iter().collect();
            if unique.len() != party.len() {
                return Err("party contains duplicate players".to_string());
            }
            if party.iter().any(|p| state.player_by_position(*p).is_none()) {
                return Err("party contains an unseated player".to_string());
            }
        }
        ActionKind::StartPartyVote => {
            if Some(player.position) != state.leader_pid {
                return Err("player is not the leader".to_string());
            }
            if state.proposed_party.len() != state.target_party_size as usize {
                return Err("proposed party size incorrect".to_string());
            }
        }
        ActionKind::VoteParty => {
            if state.phase != VotePhase::Party {
                return Err("no active party vote".to_string());
            }
            if data.vote.is_none() {
                return Err("missing vote".to_string());
            }
        }
        ActionKind::VoteQuest => {
            if state.phase != VotePhase::Quest {
                return Err("no active quest vote".to_string());
            }
            if data.vote.is_none() {
                return Err("missing vote".to_string());
            }
        }
        ActionKind::EndTurn => {
            if state.phase == VotePhase::Party || state.phase == VotePhase::Quest {
                return Err("cannot end turn during a vote".to_string());
            }
        }
        ActionKind::VoteAssassin => {
            if player.role != Role::Assassin {
                return Err("player is not the Assassin".to_string());
            }
            match data.guess {
                None => return Err("missing assassination target".to_string()),
                Some(target) if state.player_by_position(target).is_none() => {
                    return Err("assassination target is not seated".to_string());
                }
                Some(_) => {}
            }
        }
    }
    Ok(())
}

/// A party is approved by a strict majority of all six seats.
pub fn party_approved(tally: &BTreeMap<UserId, bool>) -> bool {
    let yes = tally.values().filter(|v| **v).count();
    yes * 2 > NUM_PLAYERS
}

/// A quest succeeds only if every party member voted yes.
pub fn quest_succeeded(tally: &BTreeMap<UserId, bool>) -> bool {
    tally.values().all(|v| *v)
}

/// Human-readable "Name: yes, Name: no" summary in tally order.
pub fn ballot_summary(state: &GameState, tally: &BTreeMap<UserId, bool>) -> String {
    tally
        .iter()
        .filter_map(|(user_id, vote)| {
            let player = state.player_by_user(user_id)?;
            Some(format!(
                "{}: {}",
                player.name,
                if *vote { "yes" } else { "no" }
            ))
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// What the scoreboard says after a quest resolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuestProgress {
    /// Neither side has three quests yet.
    Continue,
    /// Good reached three quests, but the Assassin gets a shot first.
    GoodPendingAssassin,
    /// Good reached three quests and no Assassin is in the game.
    GoodWins,
    /// Evil reached three failed quests.
    EvilWins,
}

pub fn check_quest_progress(state: &GameState) -> QuestProgress {
    let (good, evil) = state.quest_tally();
    if good == 3 {
        if state.player_by_role(Role::Assassin).is_some() {
            QuestProgress::GoodPendingAssassin
        } else {
            QuestProgress::GoodWins
        }
    } else if evil == 3 {
        QuestProgress::EvilWins
    } else {
        QuestProgress::Continue
    }
}

/// Resolves the assassination: hitting Merlin hands evil the game,
/// anything else seals the good win.
pub fn assassination_outcome(target_role: Role) -> Team {
    if target_role == Role::Merlin {
        Team::Evil
    } else {
        Team::Good
    }
}
