//! Integration tests driving whole games through the room actor with a
//! scripted decision service.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::timeout;

use avalon_agent::{
    ActionData, ActionResponse, AgentTask, DecisionService, GatewayError, PrivateData,
    StartupRequest, StartupResponse, StateUpdate,
};
use avalon_engine::{
    DEFAULT_NAMES, DEFAULT_ROLES, Directory, RoleDeck, RoleSlot, RoomConfig, RoomHandle, SeatKind,
    SeatRequest, spawn_room,
};
use avalon_protocol::{
    ActionKind, AgentId, ClientAction, Message, Position, Role, RoleRequest, RoomCode, ServerEvent,
    SessionId, UserId,
};

// =========================================================================
// Scripted decision service: deterministic agents for full-game runs.
// =========================================================================

#[derive(Clone, Copy)]
struct Script {
    /// Every agent's party ballot.
    party_vote: bool,
    /// Every party member's quest ballot.
    quest_vote: bool,
    /// Seat the Assassin shoots at.
    assassin_target: u8,
    /// When false, proposals omit the party data and never validate.
    propose_valid: bool,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            party_vote: true,
            quest_vote: true,
            assassin_target: 3,
            propose_valid: true,
        }
    }
}

struct ScriptedService {
    script: Script,
    next_id: AtomicUsize,
    shutdowns: AtomicUsize,
    private_pushes: AtomicUsize,
}

impl ScriptedService {
    fn new(script: Script) -> Self {
        Self {
            script,
            next_id: AtomicUsize::new(0),
            shutdowns: AtomicUsize::new(0),
            private_pushes: AtomicUsize::new(0),
        }
    }
}

fn act(action: ActionKind, data: ActionData) -> ActionResponse {
    ActionResponse {
        success: true,
        action: Some(action),
        data: Some(data),
    }
}

fn seat(n: u8) -> Position {
    Position::new(n).unwrap()
}

impl DecisionService for ScriptedService {
    async fn startup(&self, req: StartupRequest) -> Result<StartupResponse, GatewayError> {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        Ok(StartupResponse {
            success: true,
            agent_id: Some(format!("agent-{n}")),
            agent_role_preference: Some(req.agent_role_preference),
            agent_name_preference: Some(req.agent_name),
        })
    }

    async fn request_action(
        &self,
        _agent: &AgentId,
        task: AgentTask,
        _state: StateUpdate,
    ) -> Result<ActionResponse, GatewayError> {
        let options = &task.task;
        let response = if options.contains(&ActionKind::StartPartyVote) {
            act(ActionKind::StartPartyVote, ActionData::default())
        } else if options.contains(&ActionKind::ProposeParty) {
            let data = if self.script.propose_valid {
                ActionData {
                    party: Some((1..=task.target_party_size).map(seat).collect()),
                    ..ActionData::default()
                }
            } else {
                ActionData::default()
            };
            act(ActionKind::ProposeParty, data)
        } else if options == &[ActionKind::VoteParty] {
            act(
                ActionKind::VoteParty,
                ActionData {
                    vote: Some(self.script.party_vote),
                    ..ActionData::default()
                },
            )
        } else if options == &[ActionKind::VoteQuest] {
            act(
                ActionKind::VoteQuest,
                ActionData {
                    vote: Some(self.script.quest_vote),
                    ..ActionData::default()
                },
            )
        } else if options == &[ActionKind::VoteAssassin] {
            act(
                ActionKind::VoteAssassin,
                ActionData {
                    guess: Some(seat(self.script.assassin_target)),
                    ..ActionData::default()
                },
            )
        } else {
            act(ActionKind::EndTurn, ActionData::default())
        };
        Ok(response)
    }

    async fn push_message(&self, _agent: &AgentId, _msg: &Message) -> Result<(), GatewayError> {
        Ok(())
    }

    async fn push_state(&self, _agent: &AgentId, _update: &StateUpdate) -> Result<(), GatewayError> {
        Ok(())
    }

    async fn push_private_data(
        &self,
        _agent: &AgentId,
        _data: &PrivateData,
    ) -> Result<(), GatewayError> {
        self.private_pushes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn shutdown(&self, _agent: &AgentId) -> Result<(), GatewayError> {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// =========================================================================
// Helpers
// =========================================================================

/// A non-shuffled deal: seat `n` holds the nth default role and name,
/// so Merlin/Kira leads quest 1 and Mia is the Assassin on seat 4.
fn fixed_deck() -> RoleDeck {
    let slots = DEFAULT_ROLES
        .iter()
        .zip(DEFAULT_NAMES)
        .zip(1u8..)
        .map(|((role, name), n)| RoleSlot {
            role: *role,
            name: name.to_string(),
            position: seat(n),
        })
        .collect();
    RoleDeck::from_slots(slots)
}

fn agent_seats() -> Vec<SeatRequest> {
    (0..6)
        .map(|_| SeatRequest {
            kind: SeatKind::Agent,
            role: RoleRequest::Random,
            agent_type: Some("scripted".to_string()),
            player_name: None,
        })
        .collect()
}

fn human_seats() -> Vec<SeatRequest> {
    (0..6)
        .map(|_| SeatRequest {
            kind: SeatKind::Human,
            role: RoleRequest::Random,
            agent_type: None,
            player_name: None,
        })
        .collect()
}

/// Production pacing collapsed so tests run a full game in milliseconds.
fn fast_config(logs_dir: &Path) -> RoomConfig {
    RoomConfig {
        logs_dir: logs_dir.to_path_buf(),
        start_delay: Duration::ZERO,
        teardown_grace: Duration::ZERO,
        idle_dispose: Duration::from_millis(50),
        ..RoomConfig::default()
    }
}

/// Opt-in room tracing for debugging runs: `RUST_LOG=debug cargo test`.
fn init_tracing() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Polls until `cond` holds; fails the test after five seconds.
async fn wait_until(mut cond: impl FnMut() -> bool) {
    timeout(Duration::from_secs(5), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition before timeout");
}

/// Waits for the room actor to stop (its mailbox closes).
async fn wait_for_room_end(handle: &RoomHandle) {
    timeout(Duration::from_secs(10), async {
        while handle.info().await.is_ok() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("room did not end in time");
}

/// Parses the room's log file into its record array.
async fn read_log(logs_dir: &Path, room: &str) -> Vec<Value> {
    let bytes = tokio::fs::read(logs_dir.join(format!("{room}.json")))
        .await
        .expect("log file exists");
    let file: Value = serde_json::from_slice(&bytes).expect("log file parses");
    file["logs"].as_array().cloned().expect("logs array")
}

/// The `full` snapshot of the last game record.
fn final_snapshot(records: &[Value]) -> Value {
    records
        .iter()
        .rev()
        .find(|r| r["msgtype"] == "game")
        .map(|r| r["full"].clone())
        .expect("at least one game record")
}

fn message_texts(snapshot: &Value) -> Vec<String> {
    snapshot["messages"]
        .as_array()
        .expect("messages array")
        .iter()
        .map(|m| m["msg"].as_str().unwrap_or_default().to_string())
        .collect()
}

async fn run_all_agent_game(script: Script) -> (Arc<ScriptedService>, Vec<Value>) {
    init_tracing();
    let dir = tempfile::tempdir().expect("tempdir");
    let service = Arc::new(ScriptedService::new(script));
    let handle = spawn_room(
        RoomCode("TEST".to_string()),
        agent_seats(),
        fixed_deck(),
        Arc::clone(&service),
        fast_config(dir.path()),
        None,
    )
    .expect("room spawns");

    wait_for_room_end(&handle).await;
    let records = read_log(dir.path(), "TEST").await;
    (service, records)
}

// =========================================================================
// All-agent games
// =========================================================================

#[tokio::test]
async fn good_wins_when_assassin_misses() {
    // Everyone approves everything; the Assassin shoots a servant.
    let (service, records) = run_all_agent_game(Script::default()).await;

    let snapshot = final_snapshot(&records);
    assert_eq!(snapshot["winner"], "good");
    assert_eq!(
        snapshot["quest_results"],
        serde_json::json!(["success", "success", "success"])
    );

    let messages = message_texts(&snapshot);
    assert!(messages.iter().any(|m| m == "The party has been approved!"));
    assert!(
        messages
            .iter()
            .any(|m| m == "Good wins, for now, by succeeding three quests...")
    );
    assert!(
        messages
            .iter()
            .any(|m| m == "Mia (Assassin) assassinated Luca (Servant-1).")
    );
    assert!(
        messages
            .iter()
            .any(|m| m == "Good wins as Evil assassinated the wrong Merlin!")
    );

    // Every agent was briefed before the game and shut down after it.
    assert_eq!(service.private_pushes.load(Ordering::SeqCst), 6);
    wait_until(|| service.shutdowns.load(Ordering::SeqCst) == 6).await;
}

#[tokio::test]
async fn evil_wins_when_assassin_finds_merlin() {
    let script = Script {
        assassin_target: 1, // Merlin's seat in the fixed deal
        ..Script::default()
    };
    let (_service, records) = run_all_agent_game(script).await;

    let snapshot = final_snapshot(&records);
    assert_eq!(snapshot["winner"], "evil");
    let messages = message_texts(&snapshot);
    assert!(
        messages
            .iter()
            .any(|m| m == "Mia (Assassin) assassinated Kira (Merlin).")
    );
    assert!(
        messages
            .iter()
            .any(|m| m == "Evil wins by assassinating Merlin!")
    );
}

#[tokio::test]
async fn evil_wins_after_five_rejected_parties() {
    let script = Script {
        party_vote: false,
        ..Script::default()
    };
    let (_service, records) = run_all_agent_game(script).await;

    let snapshot = final_snapshot(&records);
    assert_eq!(snapshot["winner"], "evil");
    assert_eq!(snapshot["failed_party_votes"], 5);

    let messages = message_texts(&snapshot);
    assert_eq!(
        messages
            .iter()
            .filter(|m| *m == "The party has been rejected!")
            .count(),
        5
    );
    assert!(
        messages
            .iter()
            .any(|m| m == "Evil wins by rejecting five parties!")
    );
}

#[tokio::test]
async fn misbehaving_agent_fails_the_room() {
    // Proposals never carry a party, so validation rejects every
    // attempt until the cap trips.
    let script = Script {
        propose_valid: false,
        ..Script::default()
    };
    let (service, records) = run_all_agent_game(script).await;

    let error = records
        .iter()
        .rev()
        .find(|r| r["msgtype"] == "error")
        .expect("error record written");
    assert!(
        error["message"]
            .as_str()
            .unwrap_or_default()
            .contains("exceeded maximum action attempts")
    );
    // The failed room still shut its agents down.
    wait_until(|| service.shutdowns.load(Ordering::SeqCst) == 6).await;
}

// =========================================================================
// Directory
// =========================================================================

#[tokio::test]
async fn directory_registers_and_forgets_rooms() {
    let dir = tempfile::tempdir().expect("tempdir");
    let directory = Directory::new();
    let service = Arc::new(ScriptedService::new(Script {
        party_vote: false,
        ..Script::default()
    }));

    let handle = directory
        .create_room(agent_seats(), service, fast_config(dir.path()))
        .await
        .expect("room created");
    let code = handle.code().clone();
    assert_eq!(code.0.len(), 4);
    assert!(code.0.chars().all(|c| c.is_ascii_uppercase()));
    assert_eq!(directory.len().await, 1);
    assert!(directory.get(&code).await.is_ok());

    // The rejection script runs the game to an evil win; the room
    // deregisters itself on teardown.
    wait_for_room_end(&handle).await;
    timeout(Duration::from_secs(5), async {
        while !directory.is_empty().await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("room deregistered");
    assert!(directory.get(&code).await.is_err());
}

#[tokio::test]
async fn lobby_overview_lists_waiting_rooms() {
    let dir = tempfile::tempdir().expect("tempdir");
    let directory = Directory::new();
    let service = Arc::new(ScriptedService::new(Script::default()));

    let handle = directory
        .create_room(human_seats(), service, fast_config(dir.path()))
        .await
        .expect("room created");

    let lobby = directory.lobby_overview().await;
    assert_eq!(lobby.len(), 1);
    assert_eq!(&lobby[0].room, handle.code());
    assert_eq!(lobby[0].players, 0);
    assert!(!lobby[0].all_joined);
    assert!(directory.game_overview().await.is_empty());

    directory.shutdown_all().await;
    wait_for_room_end(&handle).await;
    assert!(directory.lobby_overview().await.is_empty());
}

// =========================================================================
// Human-driven game
// =========================================================================

type EventRx = mpsc::UnboundedReceiver<ServerEvent>;

async fn drain_until_game_over(rx: &mut EventRx) -> String {
    loop {
        let event = timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("event before timeout")
            .expect("channel open until game over");
        if let ServerEvent::GameOver { msg } = event {
            return msg;
        }
    }
}

#[tokio::test]
async fn human_players_play_a_full_game() {
    init_tracing();
    let dir = tempfile::tempdir().expect("tempdir");
    let service = Arc::new(ScriptedService::new(Script::default()));
    let handle = spawn_room(
        RoomCode("HMNS".to_string()),
        human_seats(),
        fixed_deck(),
        service,
        fast_config(dir.path()),
        None,
    )
    .expect("room spawns");

    // Six humans join in order; with the fixed deal they take seats
    // 1 through 6.
    let users: Vec<UserId> = (1..=6).map(|n| UserId(format!("u{n}"))).collect();
    let mut receivers = Vec::new();
    for (n, user) in users.iter().enumerate() {
        let (tx, rx) = mpsc::unbounded_channel();
        handle
            .join(user.clone(), SessionId(format!("s{n}")), tx)
            .await
            .expect("join accepted");
        receivers.push(rx);
    }

    // The first event on each channel is the player's own seat.
    let first = timeout(Duration::from_secs(5), receivers[0].recv())
        .await
        .expect("private data in time")
        .expect("channel open");
    match first {
        ServerEvent::PrivateData { player } => {
            assert_eq!(player.position, seat(1));
            assert_eq!(player.role, Role::Merlin);
        }
        other => panic!("expected private data first, got {other:?}"),
    }

    // Three quests, each led by the next seat with a party of the
    // required size, unanimously approved and succeeded.
    for (leader, size) in [(1u8, 2u8), (2, 3), (3, 4)] {
        let leader_user = users[usize::from(leader) - 1].clone();
        handle
            .action(ClientAction::ProposeParty {
                user_id: leader_user.clone(),
                party: (1..=size).map(seat).collect(),
            })
            .await
            .expect("propose sent");
        handle
            .action(ClientAction::VoteParty {
                user_id: leader_user,
            })
            .await
            .expect("vote start sent");
        for user in &users {
            handle
                .action(ClientAction::VoteResult {
                    user_id: user.clone(),
                    vote: true,
                })
                .await
                .expect("party ballot sent");
        }
        for member in users.iter().take(usize::from(size)) {
            handle
                .action(ClientAction::VoteResult {
                    user_id: member.clone(),
                    vote: true,
                })
                .await
                .expect("quest ballot sent");
        }
    }

    // Seat 4 holds the Assassin in the fixed deal and knows exactly
    // where Merlin sits.
    handle
        .action(ClientAction::Assassination {
            user_id: users[3].clone(),
            target: seat(1),
        })
        .await
        .expect("assassination sent");

    let outcome = drain_until_game_over(&mut receivers[0]).await;
    assert_eq!(outcome, "Evil wins by assassinating Merlin!");
}

#[tokio::test]
async fn leaving_rejoining_and_abandonment() {
    init_tracing();
    let dir = tempfile::tempdir().expect("tempdir");
    let service = Arc::new(ScriptedService::new(Script::default()));
    let handle = spawn_room(
        RoomCode("LIFE".to_string()),
        human_seats(),
        fixed_deck(),
        service,
        fast_config(dir.path()),
        None,
    )
    .expect("room spawns");

    let users: Vec<UserId> = (1..=6).map(|n| UserId(format!("u{n}"))).collect();
    for (n, user) in users.iter().enumerate() {
        let (tx, _rx) = mpsc::unbounded_channel();
        handle
            .join(user.clone(), SessionId(format!("s{n}")), tx)
            .await
            .expect("join accepted");
    }

    // Seat 6 (Sam in the fixed deal) drops mid-game.
    handle.leave(users[5].clone()).await.expect("leave sent");
    let info = handle.info().await.expect("room alive");
    assert_eq!(info.players, 5);
    let snapshot = handle.snapshot().await.expect("snapshot");
    assert!(
        message_texts(&snapshot)
            .iter()
            .any(|m| m == "Sam left the game.")
    );

    // Rejoining restores the seat and re-sends the private data.
    let (tx, mut rx) = mpsc::unbounded_channel();
    handle
        .join(users[5].clone(), SessionId("s5-new".to_string()), tx)
        .await
        .expect("rejoin accepted");
    let first = timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("private data in time")
        .expect("channel open");
    match first {
        ServerEvent::PrivateData { player } => {
            assert_eq!(player.position, seat(6));
            assert!(player.active);
        }
        other => panic!("expected private data on rejoin, got {other:?}"),
    }
    let info = handle.info().await.expect("room alive");
    assert_eq!(info.players, 6);
    let snapshot = handle.snapshot().await.expect("snapshot");
    assert!(
        message_texts(&snapshot)
            .iter()
            .any(|m| m == "Sam re-joined.")
    );

    // Once every human is gone the room disposes of itself after the
    // idle grace period.
    for user in &users {
        handle.leave(user.clone()).await.expect("leave sent");
    }
    wait_for_room_end(&handle).await;
}
