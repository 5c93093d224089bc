//! Role manifests, the shuffled role deck, and private knowledge.
//!
//! A room is created from a six-seat manifest. At deal time the role
//! list, the display names, and the seat positions are each shuffled
//! independently, producing slots that are handed out by preference as
//! players join. A player's knowledge map is fixed by the deal and
//! never changes afterwards.

use std::collections::{BTreeMap, HashSet};

use rand::Rng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use avalon_protocol::{Belief, NUM_PLAYERS, Position, Role, RoleRequest};

use crate::EngineError;

/// The standard six-player role set.
pub const DEFAULT_ROLES: [Role; NUM_PLAYERS] = [
    Role::Merlin,
    Role::Percival,
    Role::Servant1,
    Role::Assassin,
    Role::Morgana,
    Role::Minion1,
];

/// The fixed display-name pool. Agent prompts downstream are tuned to
/// these six names, so they are not configurable per room.
pub const DEFAULT_NAMES: [&str; NUM_PLAYERS] = ["Kira", "Jane", "Luca", "Mia", "Paul", "Sam"];

/// Who is meant to sit in a manifest seat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SeatKind {
    Human,
    Agent,
}

/// One seat of a room-creation manifest. Field names match the legacy
/// room-creation options so existing launchers keep working.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeatRequest {
    /// Whether an agent or a human fills this seat.
    #[serde(rename = "player")]
    pub kind: SeatKind,
    /// Requested role, or a placeholder.
    pub role: RoleRequest,
    /// Agent flavor forwarded to the decision service ("unknown" when
    /// absent; meaningless for human seats).
    #[serde(rename = "type", default)]
    pub agent_type: Option<String>,
    /// Optional display-name request, matched against the dealt deck.
    #[serde(rename = "playerName", default)]
    pub player_name: Option<String>,
}

impl SeatRequest {
    pub fn agent_type(&self) -> &str {
        self.agent_type.as_deref().unwrap_or("unknown")
    }
}

/// Normalizes and validates a manifest.
///
/// Agent seats are moved ahead of human seats (stable within each
/// group), generic "servant" placeholders are numbered in request
/// order, and every specific role may appear at most once. Exactly six
/// seats are required.
pub fn prepare_manifest(mut seats: Vec<SeatRequest>) -> Result<Vec<SeatRequest>, EngineError> {
    if seats.len() != NUM_PLAYERS {
        return Err(EngineError::InvalidManifest(format!(
            "expected {NUM_PLAYERS} seats, got {}",
            seats.len()
        )));
    }

    seats.sort_by_key(|seat| match seat.kind {
        SeatKind::Agent => 0,
        SeatKind::Human => 1,
    });

    let servants = [Role::Servant1, Role::Servant2, Role::Servant3, Role::Servant4];
    let mut servant_count = 0;
    for seat in &mut seats {
        if seat.role == RoleRequest::Servant {
            let Some(role) = servants.get(servant_count) else {
                return Err(EngineError::InvalidManifest(
                    "more servant seats than servant roles".to_string(),
                ));
            };
            seat.role = RoleRequest::Fixed(*role);
            servant_count += 1;
        }
    }

    let mut seen = HashSet::new();
    for seat in &seats {
        if let RoleRequest::Fixed(role) = &seat.role {
            if !seen.insert(*role) {
                return Err(EngineError::InvalidManifest(format!(
                    "role {role} requested more than once"
                )));
            }
        }
    }

    Ok(seats)
}

// ---------------------------------------------------------------------------
// The dealt deck
// ---------------------------------------------------------------------------

/// One dealt slot: a role bound to a display name and a seat position.
#[derive(Debug, Clone, PartialEq)]
pub struct RoleSlot {
    pub role: Role,
    pub name: String,
    pub position: Position,
}

/// The full deal for one game: six slots, fixed once shuffled.
#[derive(Debug, Clone)]
pub struct RoleDeck {
    slots: Vec<RoleSlot>,
}

impl RoleDeck {
    /// Shuffles roles, names, and positions independently and zips them
    /// into slots.
    pub fn deal(roles: &[Role; NUM_PLAYERS]) -> Self {
        Self::deal_with_rng(roles, &mut rand::rng())
    }

    /// [`RoleDeck::deal`] with a caller-supplied RNG, for reproducible
    /// deals.
    pub fn deal_with_rng(roles: &[Role; NUM_PLAYERS], rng: &mut impl Rng) -> Self {
        let mut roles = roles.to_vec();
        let mut names: Vec<String> = DEFAULT_NAMES.iter().map(|n| n.to_string()).collect();
        let mut positions: Vec<Position> = Position::all().collect();
        roles.shuffle(rng);
        names.shuffle(rng);
        positions.shuffle(rng);

        let slots = roles
            .into_iter()
            .zip(names)
            .zip(positions)
            .map(|((role, name), position)| RoleSlot {
                role,
                name,
                position,
            })
            .collect();
        Self { slots }
    }

    /// Builds a deck from explicit slots. Test and replay seam; normal
    /// games go through [`RoleDeck::deal`].
    pub fn from_slots(slots: Vec<RoleSlot>) -> Self {
        Self { slots }
    }

    pub fn slots(&self) -> &[RoleSlot] {
        &self.slots
    }

    pub fn slot_for_role(&self, role: Role) -> Option<&RoleSlot> {
        self.slots.iter().find(|slot| slot.role == role)
    }

    /// Picks the slot for a joining player.
    ///
    /// A display-name request wins if that slot is still free; then the
    /// fixed role preference; then the first free slot. Returns `None`
    /// only when every slot is taken.
    pub fn pick(
        &self,
        taken: &[Role],
        preference: &RoleRequest,
        name_preference: Option<&str>,
    ) -> Option<&RoleSlot> {
        let free = |slot: &&RoleSlot| !taken.contains(&slot.role);

        if let Some(name) = name_preference {
            if let Some(slot) = self.slots.iter().filter(free).find(|s| s.name == name) {
                return Some(slot);
            }
        }
        if let RoleRequest::Fixed(role) = preference {
            if let Some(slot) = self.slots.iter().filter(free).find(|s| s.role == *role) {
                return Some(slot);
            }
        }
        self.slots.iter().find(free)
    }

    /// Computes the fixed private knowledge for a role against this
    /// deal.
    ///
    /// Merlin sees every evil seat as evil. Percival sees Merlin and
    /// Morgana without being able to tell them apart. Evil seats see
    /// all evil seats (their own included) as evil. Everyone else
    /// starts blind.
    pub fn knowledge_for(&self, role: Role) -> BTreeMap<Position, Belief> {
        let mut knowledge = BTreeMap::new();
        let mark = |r: Role, belief: Belief, out: &mut BTreeMap<Position, Belief>| {
            if let Some(slot) = self.slot_for_role(r) {
                out.insert(slot.position, belief);
            }
        };

        match role {
            Role::Merlin => {
                for r in [Role::Assassin, Role::Morgana, Role::Minion1, Role::Minion2] {
                    mark(r, Belief::Evil, &mut knowledge);
                }
            }
            Role::Percival => {
                mark(Role::Merlin, Belief::Unknown, &mut knowledge);
                mark(Role::Morgana, Belief::Unknown, &mut knowledge);
            }
            Role::Assassin | Role::Morgana | Role::Minion1 | Role::Minion2 => {
                for r in [Role::Assassin, Role::Morgana, Role::Minion1, Role::Minion2] {
                    mark(r, Belief::Evil, &mut knowledge);
                }
            }
            Role::Servant1 | Role::Servant2 | Role::Servant3 | Role::Servant4 => {}
        }
        knowledge
    }
}
