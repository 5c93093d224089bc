//! The room directory: creates rooms under fresh codes and answers
//! lobby queries.
//!
//! The directory is a cheap-clone handle; every server task and every
//! room actor holds one. Rooms deregister themselves when their actor
//! stops, so a directory entry always points at a live mailbox (a
//! handle whose actor died mid-send is pruned on the next query).

use std::collections::HashMap;
use std::sync::Arc;

use rand::Rng;
use tokio::sync::Mutex;

use avalon_protocol::{RoomCode, RoomOverview};

use crate::EngineError;
use crate::roles::{RoleDeck, SeatRequest};
use crate::room::{RoomConfig, RoomHandle, spawn_room};

use avalon_agent::DecisionService;

/// Registry of running rooms.
#[derive(Clone, Default)]
pub struct Directory {
    rooms: Arc<Mutex<HashMap<RoomCode, RoomHandle>>>,
}

impl Directory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a room from a manifest under a freshly generated code
    /// and registers it.
    pub async fn create_room<D: DecisionService>(
        &self,
        seats: Vec<SeatRequest>,
        service: Arc<D>,
        config: RoomConfig,
    ) -> Result<RoomHandle, EngineError> {
        let mut rooms = self.rooms.lock().await;
        let code = loop {
            let candidate = generate_code(&mut rand::rng());
            if !rooms.contains_key(&candidate) {
                break candidate;
            }
        };

        let deck = RoleDeck::deal(&config.roles);
        let handle = spawn_room(
            code.clone(),
            seats,
            deck,
            service,
            config,
            Some(self.clone()),
        )?;
        rooms.insert(code.clone(), handle.clone());
        tracing::info!(room = %code, "room registered");
        Ok(handle)
    }

    /// Looks up a room by its code.
    pub async fn get(&self, code: &RoomCode) -> Result<RoomHandle, EngineError> {
        self.rooms
            .lock()
            .await
            .get(code)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(code.clone()))
    }

    /// Drops a room from the registry. Called by the room actor on
    /// teardown; harmless if the room is already gone.
    pub async fn deregister(&self, code: &RoomCode) {
        if self.rooms.lock().await.remove(code).is_some() {
            tracing::info!(room = %code, "room deregistered");
        }
    }

    pub async fn len(&self) -> usize {
        self.rooms.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rooms.lock().await.is_empty()
    }

    /// Rooms still waiting for humans, for the join screen.
    pub async fn lobby_overview(&self) -> Vec<RoomOverview> {
        self.overview(|all_joined| !all_joined).await
    }

    /// Rooms with a running game, for the spectate screen.
    pub async fn game_overview(&self) -> Vec<RoomOverview> {
        self.overview(|all_joined| all_joined).await
    }

    async fn overview(&self, include: impl Fn(bool) -> bool) -> Vec<RoomOverview> {
        let handles: Vec<RoomHandle> = self.rooms.lock().await.values().cloned().collect();

        let mut rooms = Vec::new();
        let mut dead = Vec::new();
        for handle in handles {
            match handle.info().await {
                Ok(info) if include(info.all_joined) => rooms.push(RoomOverview {
                    room: info.room,
                    players: info.players,
                    all_joined: info.all_joined,
                }),
                Ok(_) => {}
                Err(_) => dead.push(handle.code().clone()),
            }
        }

        if !dead.is_empty() {
            let mut registry = self.rooms.lock().await;
            for code in dead {
                registry.remove(&code);
            }
        }
        rooms.sort_by(|a, b| a.room.cmp(&b.room));
        rooms
    }

    /// Stops every room. Server shutdown path.
    pub async fn shutdown_all(&self) {
        let handles: Vec<RoomHandle> = self.rooms.lock().await.values().cloned().collect();
        for handle in handles {
            let _ = handle.shutdown().await;
        }
    }
}

/// A four-letter uppercase room code.
fn generate_code(rng: &mut impl Rng) -> RoomCode {
    let code: String = (0..4).map(|_| rng.random_range('A'..='Z')).collect();
    RoomCode(code)
}
