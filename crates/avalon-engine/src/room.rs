//! Room actor: an isolated Tokio task that owns one game.
//!
//! Each room runs in its own task and talks to the outside world
//! through an mpsc channel, so all game state is mutated from exactly
//! one place. Agent decisions are requested on spawned tasks that send
//! their results back through the same mailbox, which serializes them
//! with human actions and makes every vote and turn transition
//! race-free by construction.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::{mpsc, oneshot};

use avalon_agent::{
    ActionData, ActionResponse, AgentTask, DecisionService, GatewayError, PrivateData,
    StartupRequest, StateUpdate,
};
use avalon_log::{GameLog, LogRecord, now_iso, state_changes};
use avalon_protocol::{
    ActionKind, AgentId, ClientAction, Controller, Message, NUM_PLAYERS, Player, Position, Role,
    RoleRequest, RoomCode, ServerEvent, SessionId, Team, UserId,
};

use crate::roles::{DEFAULT_ROLES, RoleDeck, RoleSlot, SeatKind, SeatRequest, prepare_manifest};
use crate::turn::{
    self, MAX_AGENT_ATTEMPTS, QuestProgress, assassination_outcome, ballot_summary,
    check_quest_progress, compute_options, party_approved, quest_succeeded,
};
use crate::votes::{BallotOutcome, VoteCollector};
use crate::{Directory, EngineError, GameState, VotePhase};

/// Channel sender for delivering outbound events to one client.
pub type ClientSender = mpsc::UnboundedSender<ServerEvent>;

/// Room lifecycle, as reported by [`RoomInfo`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomPhase {
    /// Waiting for the manifest's human seats to connect.
    Lobby,
    /// All seats filled, game running.
    InProgress,
    /// Game over, room torn down.
    Finished,
    /// Terminated by an unrecoverable fault.
    Failed,
}

/// Static knobs for a room. The delays exist so tests can run a full
/// game without waiting out the production pacing.
#[derive(Debug, Clone)]
pub struct RoomConfig {
    /// The six roles in play.
    pub roles: [Role; NUM_PLAYERS],
    /// Directory for the per-room audit log file.
    pub logs_dir: PathBuf,
    /// Pause between the last join and the first round.
    pub start_delay: Duration,
    /// Pause between the final message and the disconnect broadcast.
    pub teardown_grace: Duration,
    /// How long an abandoned room waits for a rejoin before disposing.
    pub idle_dispose: Duration,
    /// Command-channel capacity.
    pub channel_size: usize,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            roles: DEFAULT_ROLES,
            logs_dir: PathBuf::from("logs"),
            start_delay: Duration::from_secs(2),
            teardown_grace: Duration::from_secs(2),
            idle_dispose: Duration::from_secs(60),
            channel_size: 64,
        }
    }
}

/// A snapshot of room metadata (not the game state itself).
#[derive(Debug, Clone)]
pub struct RoomInfo {
    pub room: RoomCode,
    pub phase: RoomPhase,
    /// Connected humans before start; active seats afterwards.
    pub players: usize,
    pub all_joined: bool,
    pub winner: Option<Team>,
}

/// Commands sent to a room actor through its mailbox. The `Agent*`
/// variants are internal: results of decision requests the actor
/// spawned for itself.
enum RoomCommand {
    JoinHuman {
        user_id: UserId,
        session: SessionId,
        sender: ClientSender,
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    JoinSpectator {
        sender: ClientSender,
    },
    Leave {
        user_id: UserId,
    },
    Action {
        action: ClientAction,
    },
    Info {
        reply: oneshot::Sender<RoomInfo>,
    },
    Snapshot {
        reply: oneshot::Sender<Value>,
    },
    Shutdown,
    AgentTurn {
        user_id: UserId,
        attempt: u32,
        result: Result<ActionResponse, GatewayError>,
    },
    AgentBallot {
        user_id: UserId,
        result: Result<ActionResponse, GatewayError>,
    },
    DisposeIfIdle,
}

/// Handle to a running room actor. Cheap to clone.
#[derive(Clone)]
pub struct RoomHandle {
    code: RoomCode,
    tx: mpsc::Sender<RoomCommand>,
}

impl RoomHandle {
    pub fn code(&self) -> &RoomCode {
        &self.code
    }

    /// Connects a human client to their seat (first join or rejoin).
    pub async fn join(
        &self,
        user_id: UserId,
        session: SessionId,
        sender: ClientSender,
    ) -> Result<(), EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(RoomCommand::JoinHuman {
                user_id,
                session,
                sender,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::Unavailable(self.code.clone()))?;
        reply_rx
            .await
            .map_err(|_| EngineError::Unavailable(self.code.clone()))?
    }

    /// Attaches a spectator; they immediately receive the revealing
    /// roster and every broadcast from then on.
    pub async fn join_spectator(&self, sender: ClientSender) -> Result<(), EngineError> {
        self.tx
            .send(RoomCommand::JoinSpectator { sender })
            .await
            .map_err(|_| EngineError::Unavailable(self.code.clone()))
    }

    pub async fn leave(&self, user_id: UserId) -> Result<(), EngineError> {
        self.tx
            .send(RoomCommand::Leave { user_id })
            .await
            .map_err(|_| EngineError::Unavailable(self.code.clone()))
    }

    /// Delivers a client action (fire-and-forget; invalid actions are
    /// dropped by the room).
    pub async fn action(&self, action: ClientAction) -> Result<(), EngineError> {
        self.tx
            .send(RoomCommand::Action { action })
            .await
            .map_err(|_| EngineError::Unavailable(self.code.clone()))
    }

    pub async fn info(&self) -> Result<RoomInfo, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(RoomCommand::Info { reply: reply_tx })
            .await
            .map_err(|_| EngineError::Unavailable(self.code.clone()))?;
        reply_rx
            .await
            .map_err(|_| EngineError::Unavailable(self.code.clone()))
    }

    /// The current full state snapshot, as the log and agents see it.
    pub async fn snapshot(&self) -> Result<Value, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(RoomCommand::Snapshot { reply: reply_tx })
            .await
            .map_err(|_| EngineError::Unavailable(self.code.clone()))?;
        reply_rx
            .await
            .map_err(|_| EngineError::Unavailable(self.code.clone()))
    }

    pub async fn shutdown(&self) -> Result<(), EngineError> {
        self.tx
            .send(RoomCommand::Shutdown)
            .await
            .map_err(|_| EngineError::Unavailable(self.code.clone()))
    }
}

/// Spawns a room actor for the given manifest and returns its handle.
///
/// The manifest is normalized and validated here; a bad manifest never
/// produces a room. All-agent games start immediately, games with human
/// seats wait in [`RoomPhase::Lobby`] until every human has joined.
pub fn spawn_room<D: DecisionService>(
    code: RoomCode,
    seats: Vec<SeatRequest>,
    deck: RoleDeck,
    service: Arc<D>,
    config: RoomConfig,
    directory: Option<Directory>,
) -> Result<RoomHandle, EngineError> {
    let seats = prepare_manifest(seats)?;
    let (tx, rx) = mpsc::channel(config.channel_size);

    let log = GameLog::open(&config.logs_dir, &code);
    let actor = RoomActor {
        code: code.clone(),
        config,
        seats,
        deck,
        state: GameState::new(code.clone()),
        phase: RoomPhase::Lobby,
        party_votes: None,
        quest_votes: None,
        assassination_done: false,
        agent_types: HashMap::new(),
        service,
        log,
        clients: HashMap::new(),
        join_order: Vec::new(),
        spectators: Vec::new(),
        prev_snapshot: json!({}),
        self_tx: tx.clone(),
        rx,
        directory,
    };
    tokio::spawn(actor.run());

    Ok(RoomHandle { code, tx })
}

/// Whether the actor loop keeps running after a handler.
#[derive(PartialEq)]
enum Flow {
    Continue,
    Stop,
}

struct RoomActor<D: DecisionService> {
    code: RoomCode,
    config: RoomConfig,
    /// Prepared manifest: agents first, servants numbered.
    seats: Vec<SeatRequest>,
    deck: RoleDeck,
    state: GameState,
    phase: RoomPhase,
    party_votes: Option<VoteCollector>,
    quest_votes: Option<VoteCollector>,
    assassination_done: bool,
    /// Manifest agent flavor per seat, for the player log records.
    agent_types: HashMap<UserId, String>,
    service: Arc<D>,
    log: GameLog,
    /// Connected human clients.
    clients: HashMap<UserId, (SessionId, ClientSender)>,
    /// Human connection order, used to pair clients with seats.
    join_order: Vec<UserId>,
    spectators: Vec<ClientSender>,
    prev_snapshot: Value,
    self_tx: mpsc::Sender<RoomCommand>,
    rx: mpsc::Receiver<RoomCommand>,
    directory: Option<Directory>,
}

impl<D: DecisionService> RoomActor<D> {
    async fn run(mut self) {
        tracing::info!(room = %self.code, seats = self.seats.len(), "room actor started");

        if self.num_humans() == 0 && self.start_game().await == Flow::Stop {
            tracing::info!(room = %self.code, "room actor stopped");
            return;
        }

        while let Some(cmd) = self.rx.recv().await {
            if self.handle(cmd).await == Flow::Stop {
                break;
            }
        }

        tracing::info!(room = %self.code, "room actor stopped");
    }

    fn num_humans(&self) -> usize {
        self.seats
            .iter()
            .filter(|s| s.kind == SeatKind::Human)
            .count()
    }

    async fn handle(&mut self, cmd: RoomCommand) -> Flow {
        match cmd {
            RoomCommand::JoinHuman {
                user_id,
                session,
                sender,
                reply,
            } => {
                let (result, flow) = self.handle_join(user_id, session, sender).await;
                let _ = reply.send(result);
                flow
            }
            RoomCommand::JoinSpectator { sender } => {
                let _ = sender.send(ServerEvent::SpectatorData {
                    players: self.state.players.clone(),
                });
                self.spectators.push(sender);
                Flow::Continue
            }
            RoomCommand::Leave { user_id } => self.handle_leave(user_id),
            RoomCommand::Action { action } => {
                if self.phase != RoomPhase::InProgress {
                    return Flow::Continue;
                }
                self.handle_client_action(action).await
            }
            RoomCommand::AgentTurn {
                user_id,
                attempt,
                result,
            } => self.handle_agent_turn(user_id, attempt, result).await,
            RoomCommand::AgentBallot { user_id, result } => {
                self.handle_agent_ballot(user_id, result).await
            }
            RoomCommand::Info { reply } => {
                let _ = reply.send(self.info());
                Flow::Continue
            }
            RoomCommand::Snapshot { reply } => {
                let _ = reply.send(self.state.snapshot());
                Flow::Continue
            }
            RoomCommand::DisposeIfIdle => {
                if self.state.all_joined && self.state.active_players() == 0 {
                    tracing::info!(room = %self.code, "room abandoned, disposing");
                    self.teardown().await;
                    return Flow::Stop;
                }
                Flow::Continue
            }
            RoomCommand::Shutdown => {
                tracing::info!(room = %self.code, "room shutting down");
                self.teardown().await;
                Flow::Stop
            }
        }
    }

    fn info(&self) -> RoomInfo {
        let players = if self.state.all_joined {
            self.state.active_players()
        } else {
            self.clients.len()
        };
        RoomInfo {
            room: self.code.clone(),
            phase: self.phase,
            players,
            all_joined: self.state.all_joined,
            winner: self.state.winner,
        }
    }

    // -- joins and leaves ---------------------------------------------------

    async fn handle_join(
        &mut self,
        user_id: UserId,
        session: SessionId,
        sender: ClientSender,
    ) -> (Result<(), EngineError>, Flow) {
        match self.phase {
            RoomPhase::Finished | RoomPhase::Failed => {
                return (
                    Err(EngineError::JoinRejected("game is over".to_string())),
                    Flow::Continue,
                );
            }
            RoomPhase::InProgress => {
                // Rejoin: the seat must already exist.
                let Some(player) = self.state.player_by_user_mut(&user_id) else {
                    return (
                        Err(EngineError::JoinRejected(format!(
                            "no seat for user {user_id}"
                        ))),
                        Flow::Continue,
                    );
                };
                player.active = true;
                let name = player.name.clone();
                let snapshot = player.clone();
                let _ = sender.send(ServerEvent::PrivateData { player: snapshot });
                self.clients.insert(user_id, (session, sender));
                let msg = self.state.add_system_message(format!("{name} re-joined."));
                self.fan_out_message(&msg);
                self.broadcast_state();
                (Ok(()), Flow::Continue)
            }
            RoomPhase::Lobby => {
                if self.clients.len() >= self.num_humans() {
                    return (
                        Err(EngineError::JoinRejected("room is full".to_string())),
                        Flow::Continue,
                    );
                }
                if !self.clients.contains_key(&user_id) {
                    self.join_order.push(user_id.clone());
                }
                self.clients.insert(user_id, (session, sender));
                tracing::info!(
                    room = %self.code,
                    connected = self.clients.len(),
                    expected = self.num_humans(),
                    "human joined"
                );
                let flow = if self.clients.len() == self.num_humans() {
                    self.start_game().await
                } else {
                    Flow::Continue
                };
                (Ok(()), flow)
            }
        }
    }

    fn handle_leave(&mut self, user_id: UserId) -> Flow {
        self.clients.remove(&user_id);
        if !self.state.all_joined {
            self.join_order.retain(|u| u != &user_id);
            return Flow::Continue;
        }

        if let Some(player) = self.state.player_by_user_mut(&user_id) {
            player.active = false;
            let name = player.name.clone();
            let msg = self
                .state
                .add_system_message(format!("{name} left the game."));
            self.fan_out_message(&msg);
            self.broadcast_state();
        }

        if self.state.active_players() == 0 {
            let tx = self.self_tx.clone();
            let delay = self.config.idle_dispose;
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = tx.send(RoomCommand::DisposeIfIdle).await;
            });
        }
        Flow::Continue
    }

    // -- game start ---------------------------------------------------------

    /// Fills every seat (starting agents through the decision service),
    /// locks roles, delivers private data, and kicks off the first
    /// round.
    async fn start_game(&mut self) -> Flow {
        if self.state.all_joined {
            return Flow::Continue;
        }

        // Seat-filling order: agents with fixed roles claim their slots
        // first, then humans, then random-role agents take what's left.
        let fixed_agents: Vec<SeatRequest> = self
            .seats
            .iter()
            .filter(|s| s.kind == SeatKind::Agent && s.role != RoleRequest::Random)
            .cloned()
            .collect();
        let random_agents: Vec<SeatRequest> = self
            .seats
            .iter()
            .filter(|s| s.kind == SeatKind::Agent && s.role == RoleRequest::Random)
            .cloned()
            .collect();

        for seat in &fixed_agents {
            if let Flow::Stop = self.add_agent_player(seat).await {
                return Flow::Stop;
            }
        }
        if let Flow::Stop = self.add_human_players() {
            return Flow::Stop;
        }
        for seat in &random_agents {
            if let Flow::Stop = self.add_agent_player(seat).await {
                return Flow::Stop;
            }
        }

        if self.state.players.len() != NUM_PLAYERS {
            return self
                .terminate(format!(
                    "expected {NUM_PLAYERS} players, seated {}",
                    self.state.players.len()
                ))
                .await;
        }

        self.state.players.sort_by_key(|p| p.position);
        self.state.all_joined = true;
        self.phase = RoomPhase::InProgress;

        for player in &self.state.players {
            let agent_type = self
                .agent_types
                .get(&player.user_id)
                .cloned()
                .unwrap_or_else(|| "unknown".to_string());
            self.log.append(LogRecord::Player {
                timestamp: now_iso(),
                name: player.name.clone(),
                role: player.role,
                pid: player.position,
                knowledge: player.knowledge.clone(),
                agent_type,
                player: if player.is_agent() { "agent" } else { "human" }.to_string(),
            });
        }

        if let Flow::Stop = self.deliver_private_data().await {
            return Flow::Stop;
        }

        // All-agent games reveal the roster to whoever is watching.
        if !self.state.has_human_players() {
            for spectator in &self.spectators {
                let _ = spectator.send(ServerEvent::SpectatorData {
                    players: self.state.players.clone(),
                });
            }
        }

        self.broadcast_state();
        tokio::time::sleep(self.config.start_delay).await;

        let msg = self
            .state
            .add_system_message("All players have joined. The game is starting!");
        self.fan_out_message(&msg);

        self.state.advance_round(true);
        self.execute_turn();
        self.broadcast_state();
        Flow::Continue
    }

    /// Starts one agent through the decision service and seats it.
    async fn add_agent_player(&mut self, seat: &SeatRequest) -> Flow {
        let taken: Vec<Role> = self.state.players.iter().map(|p| p.role).collect();
        let Some(slot) = self.deck.pick(&taken, &seat.role, None) else {
            return self.terminate("no available roles left to assign").await;
        };
        let slot = slot.clone();

        let request = StartupRequest {
            game_id: self.code.clone(),
            agent_type: seat.agent_type().to_string(),
            agent_role_preference: slot.role.to_string(),
            agent_name: slot.name.clone(),
        };
        let response = match self.service.startup(request).await {
            Ok(resp) => resp,
            Err(e) => {
                return self
                    .terminate(format!("agent startup for {} failed: {e}", slot.role))
                    .await;
            }
        };
        let Some(agent_id) = response.agent_id else {
            return self
                .terminate(format!("agent startup for {} returned no id", slot.role))
                .await;
        };

        let user_id = UserId(agent_id.clone());
        self.agent_types
            .insert(user_id.clone(), seat.agent_type().to_string());
        self.seat_player(
            slot,
            user_id,
            Controller::Agent {
                agent: AgentId(agent_id),
            },
        );
        Flow::Continue
    }

    /// Seats every connected human in join order, pairing them with the
    /// fixed-role human seats first.
    fn add_human_players(&mut self) -> Flow {
        let mut fixed: Vec<SeatRequest> = self
            .seats
            .iter()
            .filter(|s| s.kind == SeatKind::Human && s.role != RoleRequest::Random)
            .cloned()
            .collect();
        let mut random: Vec<SeatRequest> = self
            .seats
            .iter()
            .filter(|s| s.kind == SeatKind::Human && s.role == RoleRequest::Random)
            .cloned()
            .collect();

        for user_id in self.join_order.clone() {
            let seat = if fixed.is_empty() {
                if random.is_empty() {
                    break;
                }
                random.remove(0)
            } else {
                fixed.remove(0)
            };

            let taken: Vec<Role> = self.state.players.iter().map(|p| p.role).collect();
            let Some(slot) = self
                .deck
                .pick(&taken, &seat.role, seat.player_name.as_deref())
            else {
                continue;
            };
            let slot = slot.clone();

            let Some((session, sender)) = self.clients.get(&user_id) else {
                continue;
            };
            let session = session.clone();
            let sender = sender.clone();

            self.agent_types
                .insert(user_id.clone(), seat.agent_type().to_string());
            let player = self.seat_player(slot, user_id, Controller::Human { session });
            let _ = sender.send(ServerEvent::PrivateData { player });
        }
        Flow::Continue
    }

    /// Builds the player for a dealt slot and pushes it into the state.
    fn seat_player(&mut self, slot: RoleSlot, user_id: UserId, controller: Controller) -> Player {
        let player = Player {
            position: slot.position,
            name: slot.name,
            user_id,
            controller,
            role: slot.role,
            active: true,
            knowledge: self.deck.knowledge_for(slot.role),
        };
        self.state.players.push(player.clone());
        player
    }

    /// Sends every agent its private data; all must confirm before the
    /// game may start.
    async fn deliver_private_data(&mut self) -> Flow {
        let deliveries: Vec<(AgentId, PrivateData)> = self
            .state
            .agents()
            .filter_map(|p| {
                let agent = p.controller.agent_id()?.clone();
                Some((agent, self.private_data(p)))
            })
            .collect();

        let results = futures_util::future::join_all(
            deliveries
                .iter()
                .map(|(agent, data)| self.service.push_private_data(agent, data)),
        )
        .await;

        if results.iter().any(|r| r.is_err()) {
            return self
                .terminate("Failed to send private data to agents")
                .await;
        }
        Flow::Continue
    }

    fn private_data(&self, player: &Player) -> PrivateData {
        let named_knowledge = player
            .knowledge
            .keys()
            .filter_map(|pid| {
                let known = self.state.player_by_position(*pid)?;
                Some((*pid, known.name.clone()))
            })
            .collect();
        let all_players = self
            .state
            .players
            .iter()
            .map(|p| (p.name.clone(), p.role))
            .collect();
        let order_to_name = self
            .state
            .players
            .iter()
            .map(|p| (p.position, p.name.clone()))
            .collect();
        PrivateData {
            name: player.name.clone(),
            role: player.role,
            pid: player.position,
            knowledge: player.knowledge.clone(),
            named_knowledge,
            all_players,
            order_to_name,
        }
    }

    // -- turn driving -------------------------------------------------------

    /// Opens the new turn; if its holder is an agent, starts the
    /// decision loop.
    fn execute_turn(&mut self) {
        self.state.phase = VotePhase::Idle;
        let Some(player) = self.state.turn_player() else {
            return;
        };
        if let Some(agent) = player.controller.agent_id() {
            self.request_agent_turn(player.user_id.clone(), agent.clone(), 0);
        }
    }

    /// Asks an agent for its next turn action on a spawned task; the
    /// result comes back through the mailbox.
    fn request_agent_turn(&self, user_id: UserId, agent: AgentId, attempt: u32) {
        let task = AgentTask {
            task: compute_options(&self.state),
            target_party_size: self.state.target_party_size,
            sequence: attempt,
        };
        let update = self.state_update(json!({}));
        let service = Arc::clone(&self.service);
        let tx = self.self_tx.clone();
        tokio::spawn(async move {
            let result = service.request_action(&agent, task, update).await;
            let _ = tx
                .send(RoomCommand::AgentTurn {
                    user_id,
                    attempt,
                    result,
                })
                .await;
        });
    }

    /// Asks an agent for a single ballot.
    fn request_agent_ballot(&self, user_id: UserId, agent: AgentId, kind: ActionKind) {
        let task = AgentTask {
            task: vec![kind],
            target_party_size: self.state.target_party_size,
            sequence: 0,
        };
        let update = self.state_update(json!({}));
        let service = Arc::clone(&self.service);
        let tx = self.self_tx.clone();
        tokio::spawn(async move {
            let result = service.request_action(&agent, task, update).await;
            let _ = tx.send(RoomCommand::AgentBallot { user_id, result }).await;
        });
    }

    /// One step of an agent's turn loop: log the trace, validate the
    /// chosen action, apply it, and either re-ask or move on.
    async fn handle_agent_turn(
        &mut self,
        user_id: UserId,
        attempt: u32,
        result: Result<ActionResponse, GatewayError>,
    ) -> Flow {
        if self.phase != RoomPhase::InProgress {
            return Flow::Continue;
        }
        let Some(player) = self.state.player_by_user(&user_id) else {
            return Flow::Continue;
        };
        let name = player.name.clone();
        let position = player.position;
        let agent = player.controller.agent_id().cloned();

        let response = match result {
            Ok(resp) if resp.success => resp,
            Ok(_) => {
                return self
                    .terminate(format!("Agent {name} failed to respond: decision rejected"))
                    .await;
            }
            Err(e) => {
                return self
                    .terminate(format!("Agent {name} failed to respond: {e}"))
                    .await;
            }
        };

        self.log_llm_trace(&name, response.action, response.data.as_ref());

        // Stale result: the turn moved on while the request was in
        // flight (a completed vote rotated the round).
        if self.state.turn_pid != Some(position) {
            tracing::debug!(room = %self.code, agent = %name, "stale turn decision dropped");
            return Flow::Continue;
        }

        let attempt = attempt + 1;
        let data = response.data.clone().unwrap_or_default();

        let rejected = match response.action {
            None => Some("no action chosen".to_string()),
            Some(kind) => turn::validate_action(&self.state, &user_id, kind, &data).err(),
        };
        if let Some(reason) = rejected {
            if attempt >= MAX_AGENT_ATTEMPTS {
                return self
                    .terminate(format!("Agent {name} exceeded maximum action attempts"))
                    .await;
            }
            tracing::warn!(room = %self.code, agent = %name, %reason, "invalid agent action");
            if let Some(agent) = &agent {
                self.request_agent_turn(user_id.clone(), agent.clone(), attempt);
            }
            return Flow::Continue;
        }
        // rejected is None, so the action is present and valid.
        let Some(kind) = response.action else {
            return Flow::Continue;
        };

        let (keep_running, flow) = self.apply_action(&user_id, kind, &data).await;
        self.broadcast_state();
        if flow == Flow::Stop {
            return Flow::Stop;
        }

        if keep_running {
            if attempt >= MAX_AGENT_ATTEMPTS {
                return self
                    .terminate(format!("Agent {name} exceeded maximum action attempts"))
                    .await;
            }
            if let Some(agent) = &agent {
                self.request_agent_turn(user_id.clone(), agent.clone(), attempt);
            }
        } else if kind == ActionKind::EndTurn && self.state.turn_pid == Some(position) {
            self.state.advance_turn();
            self.execute_turn();
            self.broadcast_state();
        }
        Flow::Continue
    }

    /// A ballot response from an agent (party, quest, or assassin).
    async fn handle_agent_ballot(
        &mut self,
        user_id: UserId,
        result: Result<ActionResponse, GatewayError>,
    ) -> Flow {
        if self.phase != RoomPhase::InProgress {
            return Flow::Continue;
        }
        let Some(player) = self.state.player_by_user(&user_id) else {
            return Flow::Continue;
        };
        let name = player.name.clone();

        let response = match result {
            Ok(resp) if resp.success => resp,
            Ok(_) => {
                return self
                    .terminate(format!("Agent {name} failed to vote: decision rejected"))
                    .await;
            }
            Err(e) => {
                return self
                    .terminate(format!("Agent {name} failed to vote: {e}"))
                    .await;
            }
        };

        let fallback_action = match self.state.phase {
            VotePhase::Party => ActionKind::VoteParty,
            VotePhase::Quest => ActionKind::VoteQuest,
            _ => ActionKind::VoteAssassin,
        };
        self.log_llm_trace(
            &name,
            response.action.or(Some(fallback_action)),
            response.data.as_ref(),
        );

        let data = response.data.unwrap_or_default();
        let flow = match self.state.phase {
            VotePhase::Party | VotePhase::Quest => {
                let Some(vote) = data.vote else {
                    return self
                        .terminate(format!("Agent {name} did not return a ballot"))
                        .await;
                };
                self.cast_ballot(&user_id, vote).await
            }
            VotePhase::Assassin => {
                let Some(target) = data.guess else {
                    return self
                        .terminate(format!("Agent {name} did not pick a target"))
                        .await;
                };
                self.resolve_assassination(target).await
            }
            VotePhase::Idle => Flow::Continue,
        };
        self.broadcast_state();
        flow
    }

    /// Applies a validated action. Returns whether the actor's turn
    /// loop should keep asking for more actions, and whether the room
    /// keeps running.
    async fn apply_action(
        &mut self,
        user_id: &UserId,
        kind: ActionKind,
        data: &ActionData,
    ) -> (bool, Flow) {
        match kind {
            ActionKind::Message => {
                let raw = data.msg.as_deref().unwrap_or_default();
                // Some models wrap the whole message in quotes.
                let msg = raw
                    .strip_prefix('"')
                    .and_then(|m| m.strip_suffix('"'))
                    .unwrap_or(raw)
                    .to_string();
                self.add_chat(user_id, msg);
                (true, Flow::Continue)
            }
            ActionKind::ProposeParty => {
                let party = data.party.clone().unwrap_or_default();
                self.state.proposed_party = party;
                let name = self
                    .state
                    .player_by_user(user_id)
                    .map(|p| p.name.clone())
                    .unwrap_or_default();
                let names = self.state.party_names();
                let msg = self
                    .state
                    .add_system_message(format!("{name} proposed a party: {names}"));
                self.fan_out_message(&msg);
                self.state.phase = VotePhase::Idle;
                (true, Flow::Continue)
            }
            ActionKind::StartPartyVote => {
                let name = self
                    .state
                    .player_by_user(user_id)
                    .map(|p| p.name.clone())
                    .unwrap_or_default();
                let msg = self
                    .state
                    .add_system_message(format!("{name} initiated a party vote."));
                self.fan_out_message(&msg);
                self.open_party_vote();
                (false, Flow::Continue)
            }
            ActionKind::EndTurn => (false, Flow::Continue),
            ActionKind::VoteParty | ActionKind::VoteQuest => {
                let Some(vote) = data.vote else {
                    return (false, Flow::Continue);
                };
                let flow = self.cast_ballot(user_id, vote).await;
                (false, flow)
            }
            ActionKind::VoteAssassin => {
                let Some(target) = data.guess else {
                    return (false, Flow::Continue);
                };
                let flow = self.resolve_assassination(target).await;
                (false, flow)
            }
        }
    }

    // -- votes --------------------------------------------------------------

    /// Opens the party vote: all six seats are eligible, and every
    /// agent is asked for a ballot immediately.
    fn open_party_vote(&mut self) {
        self.state.phase = VotePhase::Party;
        self.party_votes = Some(VoteCollector::new(
            self.state.players.iter().map(|p| p.user_id.clone()),
        ));
        let agents: Vec<(UserId, AgentId)> = self
            .state
            .agents()
            .filter_map(|p| Some((p.user_id.clone(), p.controller.agent_id()?.clone())))
            .collect();
        for (user_id, agent) in agents {
            self.request_agent_ballot(user_id, agent, ActionKind::VoteParty);
        }
    }

    /// Opens the quest vote: only the approved party members vote.
    fn open_quest_vote(&mut self) {
        let msg = self
            .state
            .add_system_message("Voting for the quest has started...");
        self.fan_out_message(&msg);

        self.state.phase = VotePhase::Quest;
        let members: Vec<&Player> = self
            .state
            .proposed_party
            .iter()
            .filter_map(|pid| self.state.player_by_position(*pid))
            .collect();
        self.quest_votes = Some(VoteCollector::new(
            members.iter().map(|p| p.user_id.clone()),
        ));
        let agents: Vec<(UserId, AgentId)> = members
            .iter()
            .filter_map(|p| Some((p.user_id.clone(), p.controller.agent_id()?.clone())))
            .collect();
        for (user_id, agent) in agents {
            self.request_agent_ballot(user_id, agent, ActionKind::VoteQuest);
        }
    }

    /// Routes a yes/no ballot into whichever collector is open and
    /// resolves the vote on completion.
    async fn cast_ballot(&mut self, voter: &UserId, vote: bool) -> Flow {
        match self.state.phase {
            VotePhase::Party => {
                let Some(collector) = &mut self.party_votes else {
                    return Flow::Continue;
                };
                if let BallotOutcome::Complete(tally) = collector.cast(voter, vote) {
                    self.party_votes = None;
                    self.state.phase = VotePhase::Idle;
                    return self.resolve_party_vote(tally).await;
                }
                Flow::Continue
            }
            VotePhase::Quest => {
                let Some(collector) = &mut self.quest_votes else {
                    return Flow::Continue;
                };
                if let BallotOutcome::Complete(tally) = collector.cast(voter, vote) {
                    self.quest_votes = None;
                    self.state.phase = VotePhase::Idle;
                    return self.resolve_quest_vote(tally).await;
                }
                Flow::Continue
            }
            _ => Flow::Continue,
        }
    }

    async fn resolve_party_vote(
        &mut self,
        tally: std::collections::BTreeMap<UserId, bool>,
    ) -> Flow {
        let summary = ballot_summary(&self.state, &tally);
        let msg = self
            .state
            .add_system_message(format!("Party vote summary: {summary}"));
        self.fan_out_message(&msg);

        if party_approved(&tally) {
            let msg = self
                .state
                .add_system_message("The party has been approved!");
            self.fan_out_message(&msg);
            self.open_quest_vote();
            return Flow::Continue;
        }

        let msg = self
            .state
            .add_system_message("The party has been rejected!");
        self.fan_out_message(&msg);
        self.state.failed_party_votes += 1;
        if self.state.failed_party_votes == avalon_protocol::MAX_FAILED_PARTY_VOTES {
            self.state.winner = Some(Team::Evil);
            return self.finish_game("Evil wins by rejecting five parties!").await;
        }
        self.state.advance_round(false);
        self.execute_turn();
        Flow::Continue
    }

    async fn resolve_quest_vote(
        &mut self,
        tally: std::collections::BTreeMap<UserId, bool>,
    ) -> Flow {
        if quest_succeeded(&tally) {
            self.state
                .quest_results
                .push(avalon_protocol::QuestOutcome::Success);
            let msg = self.state.add_system_message("The quest has succeeded!");
            self.fan_out_message(&msg);
        } else {
            self.state
                .quest_results
                .push(avalon_protocol::QuestOutcome::Fail);
            let msg = self.state.add_system_message("The quest has failed!");
            self.fan_out_message(&msg);
        }

        match check_quest_progress(&self.state) {
            QuestProgress::Continue => {
                self.state.advance_round(true);
                self.execute_turn();
                Flow::Continue
            }
            QuestProgress::GoodWins => {
                self.state.winner = Some(Team::Good);
                self.finish_game("Good wins by succeeding three quests!").await
            }
            QuestProgress::EvilWins => {
                self.state.winner = Some(Team::Evil);
                self.finish_game("Evil wins by failing three quests!").await
            }
            QuestProgress::GoodPendingAssassin => {
                self.state.winner = Some(Team::Good);
                self.open_assassin_vote();
                Flow::Continue
            }
        }
    }

    /// Gives the Assassin the final word on a good win.
    fn open_assassin_vote(&mut self) {
        for text in [
            "Good wins, for now, by succeeding three quests...",
            "The Assassin will now try to kill Merlin, potentially changing the outcome of the game...",
            "The Assassin is now voting to kill Merlin...",
        ] {
            let msg = self.state.add_system_message(text);
            self.fan_out_message(&msg);
        }
        self.state.phase = VotePhase::Assassin;

        let Some(assassin) = self.state.player_by_role(Role::Assassin) else {
            return;
        };
        if let Some(agent) = assassin.controller.agent_id() {
            self.request_agent_ballot(
                assassin.user_id.clone(),
                agent.clone(),
                ActionKind::VoteAssassin,
            );
        }
    }

    /// The Assassin's single shot. Exactly one attempt resolves per
    /// game; later attempts are dropped.
    async fn resolve_assassination(&mut self, target: Position) -> Flow {
        if self.assassination_done {
            return Flow::Continue;
        }
        let Some(target_player) = self.state.player_by_position(target) else {
            // A target that resolves to no seat cannot settle the game;
            // an agent Assassin is asked again, a human can just retry.
            tracing::warn!(room = %self.code, %target, "assassination target not seated");
            if let Some(assassin) = self.state.player_by_role(Role::Assassin) {
                if let Some(agent) = assassin.controller.agent_id() {
                    self.request_agent_ballot(
                        assassin.user_id.clone(),
                        agent.clone(),
                        ActionKind::VoteAssassin,
                    );
                }
            }
            return Flow::Continue;
        };
        let target_name = target_player.name.clone();
        let target_role = target_player.role;
        self.assassination_done = true;

        if let Some(assassin) = self.state.player_by_role(Role::Assassin) {
            let assassin_name = assassin.name.clone();
            let msg = self.state.add_system_message(format!(
                "{assassin_name} (Assassin) assassinated {target_name} ({target_role})."
            ));
            self.fan_out_message(&msg);
        }

        match assassination_outcome(target_role) {
            Team::Evil => {
                self.state.winner = Some(Team::Evil);
                self.finish_game("Evil wins by assassinating Merlin!").await
            }
            Team::Good => {
                self.state.winner = Some(Team::Good);
                self.finish_game("Good wins as Evil assassinated the wrong Merlin!")
                    .await
            }
        }
    }

    // -- client actions -----------------------------------------------------

    /// Gates and applies an action from a human client. Invalid actions
    /// are dropped without a reply.
    async fn handle_client_action(&mut self, action: ClientAction) -> Flow {
        let user_id = action.user_id().clone();
        let flow = match action {
            ClientAction::SendMessage { msg, .. } => {
                if self.state.player_by_user(&user_id).is_some() {
                    self.add_chat(&user_id, msg);
                }
                Flow::Continue
            }
            ClientAction::EndTurn { .. } => {
                let on_turn = self
                    .state
                    .player_by_user(&user_id)
                    .is_some_and(|p| self.state.turn_pid == Some(p.position));
                let no_vote = !matches!(self.state.phase, VotePhase::Party | VotePhase::Quest);
                if on_turn && no_vote {
                    self.state.advance_turn();
                    self.execute_turn();
                }
                Flow::Continue
            }
            ClientAction::ProposeParty { party, .. } => {
                let on_turn = self
                    .state
                    .player_by_user(&user_id)
                    .is_some_and(|p| self.state.turn_pid == Some(p.position));
                let data = ActionData {
                    party: Some(party),
                    ..ActionData::default()
                };
                if on_turn
                    && turn::validate_action(
                        &self.state,
                        &user_id,
                        ActionKind::ProposeParty,
                        &data,
                    )
                    .is_ok()
                {
                    let (_, flow) = self
                        .apply_action(&user_id, ActionKind::ProposeParty, &data)
                        .await;
                    flow
                } else {
                    Flow::Continue
                }
            }
            ClientAction::VoteParty { .. } => {
                if turn::validate_action(
                    &self.state,
                    &user_id,
                    ActionKind::StartPartyVote,
                    &ActionData::default(),
                )
                .is_ok()
                {
                    let (_, flow) = self
                        .apply_action(&user_id, ActionKind::StartPartyVote, &ActionData::default())
                        .await;
                    flow
                } else {
                    Flow::Continue
                }
            }
            ClientAction::VoteResult { vote, .. } => {
                if self.state.player_by_user(&user_id).is_some() {
                    self.cast_ballot(&user_id, vote).await
                } else {
                    Flow::Continue
                }
            }
            ClientAction::Assassination { target, .. } => {
                let is_assassin = self
                    .state
                    .player_by_user(&user_id)
                    .is_some_and(|p| p.role == Role::Assassin);
                if is_assassin {
                    self.resolve_assassination(target).await
                } else {
                    Flow::Continue
                }
            }
        };
        self.broadcast_state();
        flow
    }

    // -- fan-out ------------------------------------------------------------

    /// Appends a chat line and fans it out to clients, spectators, and
    /// agents.
    fn add_chat(&mut self, author: &UserId, msg: String) {
        let message = self.state.add_message(author, msg);
        self.fan_out_message(&message);
    }

    /// Delivers one stored message to every connected client and
    /// notifies every agent.
    fn fan_out_message(&self, message: &Message) {
        let event = ServerEvent::NewMessages {
            messages: vec![message.clone()],
        };
        for (_, sender) in self.clients.values() {
            let _ = sender.send(event.clone());
        }
        for sender in &self.spectators {
            let _ = sender.send(event.clone());
        }
        for player in self.state.agents() {
            if let Some(agent) = player.controller.agent_id() {
                let service = Arc::clone(&self.service);
                let agent = agent.clone();
                let message = message.clone();
                tokio::spawn(async move {
                    if let Err(e) = service.push_message(&agent, &message).await {
                        tracing::warn!(%agent, error = %e, "message push failed");
                    }
                });
            }
        }
    }

    /// Diffs the snapshot against the last broadcast one; if anything
    /// changed, writes the audit record and notifies clients and
    /// agents.
    fn broadcast_state(&mut self) {
        let snapshot = self.state.snapshot();
        let Some(changes) = state_changes(&self.prev_snapshot, &snapshot) else {
            return;
        };
        self.prev_snapshot = snapshot.clone();

        self.log
            .append(LogRecord::game(changes.clone(), snapshot.clone()));

        let event = ServerEvent::StateSync {
            changes: changes.clone(),
            full: snapshot.clone(),
        };
        for (_, sender) in self.clients.values() {
            let _ = sender.send(event.clone());
        }
        for sender in &self.spectators {
            let _ = sender.send(event.clone());
        }

        let update = StateUpdate {
            timestamp: now_iso(),
            changes,
            full: snapshot,
        };
        for player in self.state.agents() {
            if let Some(agent) = player.controller.agent_id() {
                let service = Arc::clone(&self.service);
                let agent = agent.clone();
                let update = update.clone();
                tokio::spawn(async move {
                    if let Err(e) = service.push_state(&agent, &update).await {
                        tracing::warn!(%agent, error = %e, "state push failed");
                    }
                });
            }
        }
    }

    fn state_update(&self, changes: Value) -> StateUpdate {
        StateUpdate {
            timestamp: now_iso(),
            changes,
            full: self.state.snapshot(),
        }
    }

    fn log_llm_trace(&self, agent_name: &str, action: Option<ActionKind>, data: Option<&ActionData>) {
        let (Some(action), Some(data)) = (action, data) else {
            return;
        };
        if data.llm_data.is_empty() {
            return;
        }
        self.log.append(LogRecord::LlmMessage {
            timestamp: now_iso(),
            action,
            agent: agent_name.to_string(),
            data: data.llm_data.clone(),
        });
    }

    // -- endings ------------------------------------------------------------

    /// Regular game end: reveal the roster, give clients a moment to
    /// render the result, then disconnect everyone and tear down.
    async fn finish_game(&mut self, outcome: &str) -> Flow {
        let msg = self.state.add_system_message(outcome);
        self.fan_out_message(&msg);

        let roster = self
            .state
            .players
            .iter()
            .map(|p| format!("{}: {}", p.name, p.role))
            .collect::<Vec<_>>()
            .join(", ");
        let msg = self
            .state
            .add_system_message(format!("These were the game's players: {roster}"));
        self.fan_out_message(&msg);
        self.broadcast_state();

        if let Err(e) = self.log.sync().await {
            tracing::warn!(room = %self.code, error = %e, "log sync failed at game end");
        }

        tokio::time::sleep(self.config.teardown_grace).await;

        let event = ServerEvent::GameOver {
            msg: outcome.to_string(),
        };
        for (_, sender) in self.clients.values() {
            let _ = sender.send(event.clone());
        }
        for sender in &self.spectators {
            let _ = sender.send(event.clone());
        }

        self.phase = RoomPhase::Finished;
        self.teardown().await;
        Flow::Stop
    }

    /// Unrecoverable fault. With humans seated the room limps on (the
    /// failing agent simply stops acting); an all-agent room is torn
    /// down.
    async fn terminate(&mut self, error_msg: impl Into<String>) -> Flow {
        let error_msg = error_msg.into();
        tracing::error!(room = %self.code, %error_msg, "room fault");
        self.log.append(LogRecord::error(error_msg.clone()));

        if self.state.has_human_players() {
            let msg = self.state.add_system_message(error_msg);
            self.fan_out_message(&msg);
            return Flow::Continue;
        }

        if let Err(e) = self.log.sync().await {
            tracing::warn!(room = %self.code, error = %e, "log sync failed during termination");
        }
        self.phase = RoomPhase::Failed;
        self.teardown().await;
        Flow::Stop
    }

    /// Shuts down every agent (best effort) and leaves the directory.
    async fn teardown(&mut self) {
        for player in self.state.agents() {
            if let Some(agent) = player.controller.agent_id() {
                let service = Arc::clone(&self.service);
                let agent = agent.clone();
                tokio::spawn(async move {
                    let _ = service.shutdown(&agent).await;
                });
            }
        }
        if let Some(directory) = &self.directory {
            directory.deregister(&self.code).await;
        }
        if self.phase != RoomPhase::Finished && self.phase != RoomPhase::Failed {
            self.phase = RoomPhase::Finished;
        }
    }
}
