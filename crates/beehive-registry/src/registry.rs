//! Replicated registry of hives, bees and cell ownership
//!
//! TigerStyle: Single owner per cell, decided by the replicated log.
//!
//! [`RegistryState`] is a deterministic state machine: every hive applies the
//! same [`RegistryCommand`]s in the same order and ends up with the same
//! ownership table. [`Registry`] is the shared read view the rest of the
//! hive consults; only [`RegistryMachine`], driven by the consensus driver,
//! writes to it.

use crate::consensus::StateMachine;
use crate::error::{RegistryError, RegistryResult};
use crate::node::{HiveInfo, MembershipChange};
use crate::placement::{AssignmentPolicy, BeeInfo, Colony, FirstCommitWins};
use beehive_core::{AppName, BeeId, CellKey, HiveId, MappedCells};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Capacity of the registry event channel
pub const REGISTRY_EVENTS_CAPACITY: usize = 1024;

// =============================================================================
// Commands, Responses, Events
// =============================================================================

/// Commands replicated through the consensus log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum RegistryCommand {
    NoOp,
    /// Reserve an id for a hive address; idempotent per address
    NewHiveId { addr: String },
    AddHive { info: HiveInfo },
    RemoveHive { id: HiveId },
    AddBee { info: BeeInfo },
    /// Conditionally assign cells to `bee`
    AssignBee { cells: MappedCells, bee: BeeId },
    /// Replace the colony of the bee currently mastered as `bee`
    ReassignColony { bee: BeeId, colony: Colony },
    DeleteBee { bee: BeeId },
}

impl RegistryCommand {
    /// Short name for logs
    pub fn name(&self) -> &'static str {
        match self {
            Self::NoOp => "no_op",
            Self::NewHiveId { .. } => "new_hive_id",
            Self::AddHive { .. } => "add_hive",
            Self::RemoveHive { .. } => "remove_hive",
            Self::AddBee { .. } => "add_bee",
            Self::AssignBee { .. } => "assign_bee",
            Self::ReassignColony { .. } => "reassign_colony",
            Self::DeleteBee { .. } => "delete_bee",
        }
    }
}

/// Result of applying a [`RegistryCommand`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum RegistryResponse {
    Ok,
    HiveId { id: HiveId },
    /// The proposed bee now owns every requested cell
    Assigned,
    /// Another bee owned some of the cells and kept them
    AlreadyOwned { winner: BeeId },
    /// The cells are owned by two or more bees
    Conflict { bees: Vec<BeeId> },
    NotFound,
}

/// Change notifications published after each applied command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    HiveAdded(HiveInfo),
    HiveRemoved(HiveId),
    BeeAdded(BeeInfo),
    BeeDeleted(BeeInfo),
    /// The master of a colony changed
    BeeMoved { from: BeeId, to: BeeInfo },
    /// The whole state was replaced from a snapshot
    Restored,
}

// =============================================================================
// RegistryState
// =============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RegistryImage {
    hives: Vec<HiveInfo>,
    bees: Vec<BeeInfo>,
    reserved: Vec<HiveInfo>,
    next_hive_id: u64,
}

/// The registry tables
#[derive(Debug, Clone)]
pub struct RegistryState {
    hives: BTreeMap<HiveId, HiveInfo>,
    /// Reserved ids by address, including ids not yet added as hives
    reserved: BTreeMap<String, HiveId>,
    /// Bees keyed by their current master id
    bees: BTreeMap<BeeId, BeeInfo>,
    /// Cell ownership per app
    cells: BTreeMap<AppName, BTreeMap<CellKey, BeeId>>,
    next_hive_id: u64,
}

impl Default for RegistryState {
    fn default() -> Self {
        Self {
            hives: BTreeMap::new(),
            reserved: BTreeMap::new(),
            bees: BTreeMap::new(),
            cells: BTreeMap::new(),
            next_hive_id: HiveId::BOOTSTRAP.0 + 1,
        }
    }
}

impl RegistryState {
    pub fn new() -> Self {
        Self::default()
    }

    // =========================================================================
    // Reads
    // =========================================================================

    pub fn hive(&self, id: HiveId) -> Option<&HiveInfo> {
        self.hives.get(&id)
    }

    pub fn hives(&self) -> Vec<HiveInfo> {
        self.hives.values().cloned().collect()
    }

    pub fn bee(&self, id: &BeeId) -> Option<&BeeInfo> {
        self.bees.get(id)
    }

    pub fn bees(&self) -> Vec<BeeInfo> {
        self.bees.values().cloned().collect()
    }

    /// Bees whose master lives on `hive`
    pub fn bees_on_hive(&self, hive: HiveId) -> Vec<BeeInfo> {
        self.bees
            .values()
            .filter(|b| b.id.hive == hive)
            .cloned()
            .collect()
    }

    /// Find a bee by app and local id, wherever it is hosted now
    pub fn resolve(&self, app: &AppName, local: u64) -> Option<&BeeInfo> {
        self.bees
            .values()
            .find(|b| &b.app == app && b.id.local == local)
    }

    /// The colony `bee` belongs to, as master or slave
    pub fn colony_of(&self, bee: &BeeId) -> Option<&BeeInfo> {
        if let Some(info) = self.bees.get(bee) {
            return Some(info);
        }
        self.bees
            .values()
            .find(|b| b.app == bee.app && b.colony.contains(bee))
    }

    /// Owner of a single cell
    pub fn owner(&self, app: &AppName, cell: &CellKey) -> Option<&BeeId> {
        self.cells.get(app).and_then(|cells| cells.get(cell))
    }

    /// Distinct owners of `cells` and the cells nobody owns
    pub fn owners(&self, app: &AppName, cells: &MappedCells) -> (Vec<BeeId>, Vec<CellKey>) {
        let mut owners: Vec<BeeId> = Vec::new();
        let mut unowned = Vec::new();
        for cell in cells.iter() {
            match self.owner(app, cell) {
                Some(owner) => {
                    if !owners.contains(owner) {
                        owners.push(owner.clone());
                    }
                }
                None => unowned.push(cell.clone()),
            }
        }
        (owners, unowned)
    }

    // =========================================================================
    // Apply
    // =========================================================================

    /// Apply one command, returning the response and the events it caused
    pub fn apply(
        &mut self,
        command: RegistryCommand,
        policy: &dyn AssignmentPolicy,
    ) -> (RegistryResponse, Vec<RegistryEvent>) {
        let mut events = Vec::new();
        let response = match command {
            RegistryCommand::NoOp => RegistryResponse::Ok,
            RegistryCommand::NewHiveId { addr } => {
                let id = self.reserve_hive_id(addr);
                RegistryResponse::HiveId { id }
            }
            RegistryCommand::AddHive { info } => {
                self.add_hive(info, &mut events);
                RegistryResponse::Ok
            }
            RegistryCommand::RemoveHive { id } => {
                if self.remove_hive(id, &mut events) {
                    RegistryResponse::Ok
                } else {
                    RegistryResponse::NotFound
                }
            }
            RegistryCommand::AddBee { info } => {
                if !self.bees.contains_key(&info.id) {
                    self.insert_bee(info.clone());
                    events.push(RegistryEvent::BeeAdded(info));
                }
                RegistryResponse::Ok
            }
            RegistryCommand::AssignBee { cells, bee } => self.assign(cells, bee, policy, &mut events),
            RegistryCommand::ReassignColony { bee, colony } => {
                self.reassign_colony(&bee, colony, &mut events)
            }
            RegistryCommand::DeleteBee { bee } => {
                if let Some(info) = self.delete_bee(&bee) {
                    events.push(RegistryEvent::BeeDeleted(info));
                }
                RegistryResponse::Ok
            }
        };
        (response, events)
    }

    /// Apply a voter change to the hive table
    pub fn apply_membership(&mut self, change: &MembershipChange) -> Vec<RegistryEvent> {
        let mut events = Vec::new();
        match change {
            MembershipChange::AddNode { hive, addr } => {
                self.add_hive(HiveInfo::new(*hive, addr.clone()), &mut events);
            }
            MembershipChange::RemoveNode { hive } => {
                self.remove_hive(*hive, &mut events);
            }
        }
        events
    }

    fn reserve_hive_id(&mut self, addr: String) -> HiveId {
        if let Some(id) = self.reserved.get(&addr) {
            return *id;
        }
        if let Some(info) = self.hives.values().find(|h| h.addr == addr) {
            return info.id;
        }
        let id = HiveId(self.next_hive_id);
        self.next_hive_id += 1;
        self.reserved.insert(addr, id);
        id
    }

    fn add_hive(&mut self, info: HiveInfo, events: &mut Vec<RegistryEvent>) {
        self.next_hive_id = self.next_hive_id.max(info.id.0 + 1);
        self.reserved.insert(info.addr.clone(), info.id);
        if self.hives.get(&info.id) == Some(&info) {
            return;
        }
        self.hives.insert(info.id, info.clone());
        events.push(RegistryEvent::HiveAdded(info));
    }

    /// Remove a hive, promoting slaves of the colonies it mastered
    fn remove_hive(&mut self, id: HiveId, events: &mut Vec<RegistryEvent>) -> bool {
        if self.hives.remove(&id).is_none() {
            return false;
        }
        events.push(RegistryEvent::HiveRemoved(id));

        let masters: Vec<BeeId> = self
            .bees
            .keys()
            .filter(|b| b.hive == id)
            .cloned()
            .collect();
        for master in masters {
            let Some(info) = self.bees.get(&master) else {
                continue;
            };
            match info.colony.promote_first_slave() {
                Some(colony) => {
                    let to = self.move_master(&master, colony);
                    if let Some(to) = to {
                        events.push(RegistryEvent::BeeMoved { from: master, to });
                    }
                }
                None => {
                    if let Some(info) = self.delete_bee(&master) {
                        events.push(RegistryEvent::BeeDeleted(info));
                    }
                }
            }
        }

        for info in self.bees.values_mut() {
            info.colony.slaves.retain(|s| s.hive != id);
        }
        true
    }

    fn insert_bee(&mut self, info: BeeInfo) {
        let index = self.cells.entry(info.app.clone()).or_default();
        for cell in info.cells.iter() {
            index.insert(cell.clone(), info.id.clone());
        }
        self.bees.insert(info.id.clone(), info);
    }

    fn delete_bee(&mut self, bee: &BeeId) -> Option<BeeInfo> {
        let info = self.bees.remove(bee)?;
        if let Some(index) = self.cells.get_mut(&info.app) {
            for cell in info.cells.iter() {
                if index.get(cell) == Some(bee) {
                    index.remove(cell);
                }
            }
        }
        Some(info)
    }

    /// Re-key a bee under a new master, carrying its cells over
    fn move_master(&mut self, from: &BeeId, colony: Colony) -> Option<BeeInfo> {
        let mut info = self.delete_bee(from)?;
        info.id = colony.master.clone();
        info.colony = colony;
        self.insert_bee(info.clone());
        Some(info)
    }

    fn assign_cells(&mut self, bee: &BeeId, cells: &[CellKey]) {
        if cells.is_empty() {
            return;
        }
        let Some(info) = self.bees.get_mut(bee) else {
            return;
        };
        let index = self.cells.entry(info.app.clone()).or_default();
        for cell in cells {
            info.cells.insert(cell.clone());
            index.insert(cell.clone(), bee.clone());
        }
    }

    fn assign(
        &mut self,
        cells: MappedCells,
        bee: BeeId,
        policy: &dyn AssignmentPolicy,
        events: &mut Vec<RegistryEvent>,
    ) -> RegistryResponse {
        if !self.bees.contains_key(&bee) {
            return RegistryResponse::NotFound;
        }

        let (owners, unowned) = self.owners(&bee.app, &cells);
        let others: Vec<BeeId> = owners.into_iter().filter(|o| *o != bee).collect();

        match others.len() {
            0 => {
                self.assign_cells(&bee, &unowned);
                RegistryResponse::Assigned
            }
            1 => {
                let owner = others[0].clone();
                let winner = match (self.bees.get(&owner), self.bees.get(&bee)) {
                    (Some(owner_info), Some(proposed_info)) => {
                        policy.choose(owner_info, proposed_info).clone()
                    }
                    _ => owner.clone(),
                };

                if winner == owner {
                    self.assign_cells(&owner, &unowned);
                    // A loser that never got any cell has no reason to exist.
                    let loser_is_empty = self
                        .bees
                        .get(&bee)
                        .map_or(false, |b| b.cells.is_empty() && !b.detached);
                    if loser_is_empty {
                        if let Some(info) = self.delete_bee(&bee) {
                            events.push(RegistryEvent::BeeDeleted(info));
                        }
                    }
                    RegistryResponse::AlreadyOwned { winner }
                } else {
                    let taken: Vec<CellKey> = cells
                        .iter()
                        .filter(|c| self.owner(&bee.app, c) == Some(&owner))
                        .cloned()
                        .collect();
                    if let Some(info) = self.bees.get_mut(&owner) {
                        for cell in &taken {
                            info.cells.remove(cell);
                        }
                    }
                    self.assign_cells(&bee, &taken);
                    self.assign_cells(&bee, &unowned);
                    RegistryResponse::Assigned
                }
            }
            _ => {
                warn!(cells = %cells, bees = ?others, "Cell assignment conflict");
                RegistryResponse::Conflict { bees: others }
            }
        }
    }

    fn reassign_colony(
        &mut self,
        bee: &BeeId,
        colony: Colony,
        events: &mut Vec<RegistryEvent>,
    ) -> RegistryResponse {
        let Some(info) = self.bees.get_mut(bee) else {
            return RegistryResponse::NotFound;
        };
        if colony.master == *bee {
            info.colony = colony;
            return RegistryResponse::Ok;
        }
        match self.move_master(bee, colony) {
            Some(to) => {
                events.push(RegistryEvent::BeeMoved {
                    from: bee.clone(),
                    to,
                });
                RegistryResponse::Ok
            }
            None => RegistryResponse::NotFound,
        }
    }

    // =========================================================================
    // Snapshot
    // =========================================================================

    /// Serialize the tables
    pub fn to_bytes(&self) -> RegistryResult<Bytes> {
        let image = RegistryImage {
            hives: self.hives(),
            bees: self.bees(),
            reserved: self
                .reserved
                .iter()
                .map(|(addr, id)| HiveInfo::new(*id, addr.clone()))
                .collect(),
            next_hive_id: self.next_hive_id,
        };
        let bytes = serde_json::to_vec(&image).map_err(RegistryError::storage)?;
        Ok(Bytes::from(bytes))
    }

    /// Rebuild the tables, including the cell index
    pub fn from_bytes(data: &[u8]) -> RegistryResult<Self> {
        let image: RegistryImage = serde_json::from_slice(data).map_err(RegistryError::corrupted)?;
        let mut state = Self {
            next_hive_id: image.next_hive_id,
            ..Self::default()
        };
        for hive in image.hives {
            state.hives.insert(hive.id, hive);
        }
        for reserved in image.reserved {
            state.reserved.insert(reserved.addr, reserved.id);
        }
        for bee in image.bees {
            state.insert_bee(bee);
        }
        Ok(state)
    }
}

// =============================================================================
// Registry (shared read view)
// =============================================================================

/// Shared handle to the registry tables
///
/// Cloning is cheap; all clones see the same state.
#[derive(Clone)]
pub struct Registry {
    state: Arc<RwLock<RegistryState>>,
    events: broadcast::Sender<RegistryEvent>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.read();
        f.debug_struct("Registry")
            .field("hives", &state.hives.len())
            .field("bees", &state.bees.len())
            .finish()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(REGISTRY_EVENTS_CAPACITY);
        Self {
            state: Arc::new(RwLock::new(RegistryState::new())),
            events,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, RegistryState> {
        self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, RegistryState> {
        self.state.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Receive change events applied from now on
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    /// Copy of the whole state
    pub fn snapshot(&self) -> RegistryState {
        self.read().clone()
    }

    pub fn hive(&self, id: HiveId) -> Option<HiveInfo> {
        self.read().hive(id).cloned()
    }

    pub fn hives(&self) -> Vec<HiveInfo> {
        self.read().hives()
    }

    pub fn bee(&self, id: &BeeId) -> Option<BeeInfo> {
        self.read().bee(id).cloned()
    }

    pub fn bees(&self) -> Vec<BeeInfo> {
        self.read().bees()
    }

    pub fn bees_on_hive(&self, hive: HiveId) -> Vec<BeeInfo> {
        self.read().bees_on_hive(hive)
    }

    pub fn resolve(&self, app: &AppName, local: u64) -> Option<BeeInfo> {
        self.read().resolve(app, local).cloned()
    }

    pub fn colony_of(&self, bee: &BeeId) -> Option<BeeInfo> {
        self.read().colony_of(bee).cloned()
    }

    pub fn owners(&self, app: &AppName, cells: &MappedCells) -> (Vec<BeeId>, Vec<CellKey>) {
        self.read().owners(app, cells)
    }

    fn publish(&self, events: Vec<RegistryEvent>) {
        for event in events {
            // No subscribers is fine.
            let _ = self.events.send(event);
        }
    }
}

// =============================================================================
// RegistryMachine
// =============================================================================

/// The registry as a consensus state machine
#[derive(Debug)]
pub struct RegistryMachine {
    registry: Registry,
    policy: Box<dyn AssignmentPolicy>,
}

impl RegistryMachine {
    /// Machine writing into `registry` with the default policy
    pub fn new(registry: Registry) -> Self {
        Self::with_policy(registry, Box::new(FirstCommitWins))
    }

    pub fn with_policy(registry: Registry, policy: Box<dyn AssignmentPolicy>) -> Self {
        Self { registry, policy }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

impl StateMachine for RegistryMachine {
    type Command = RegistryCommand;
    type Response = RegistryResponse;

    fn apply(&mut self, index: u64, command: RegistryCommand) -> RegistryResponse {
        let name = command.name();
        let (response, events) = {
            let mut state = self.registry.write();
            state.apply(command, self.policy.as_ref())
        };
        debug!(index, command = name, response = ?response, "Applied registry command");
        self.registry.publish(events);
        response
    }

    fn apply_membership(&mut self, index: u64, change: &MembershipChange) {
        let events = self.registry.write().apply_membership(change);
        debug!(index, hive = %change.hive(), "Applied membership change");
        self.registry.publish(events);
    }

    fn snapshot(&self) -> RegistryResult<Bytes> {
        self.registry.read().to_bytes()
    }

    fn restore(&mut self, data: &[u8]) -> RegistryResult<()> {
        let restored = RegistryState::from_bytes(data)?;
        {
            let mut state = self.registry.write();
            info!(hives = restored.hives.len(), bees = restored.bees.len(), "Registry restored");
            *state = restored;
        }
        self.registry.publish(vec![RegistryEvent::Restored]);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn app() -> AppName {
        AppName::new("kv").unwrap()
    }

    fn bee(hive: u64, local: u64) -> BeeId {
        BeeId::new(HiveId(hive), app(), local)
    }

    fn cells(keys: &[&str]) -> MappedCells {
        let mut cells = MappedCells::local();
        for key in keys {
            cells.add("d", key.to_string());
        }
        cells
    }

    fn apply(state: &mut RegistryState, command: RegistryCommand) -> RegistryResponse {
        state.apply(command, &FirstCommitWins).0
    }

    fn add_bee(state: &mut RegistryState, id: BeeId) {
        apply(state, RegistryCommand::AddBee { info: BeeInfo::new(id) });
    }

    #[test]
    fn test_new_hive_id_is_idempotent_per_addr() {
        let mut state = RegistryState::new();
        let a = apply(&mut state, RegistryCommand::NewHiveId { addr: "a:1".into() });
        let b = apply(&mut state, RegistryCommand::NewHiveId { addr: "b:1".into() });
        let again = apply(&mut state, RegistryCommand::NewHiveId { addr: "a:1".into() });
        assert_eq!(a, RegistryResponse::HiveId { id: HiveId(2) });
        assert_eq!(b, RegistryResponse::HiveId { id: HiveId(3) });
        assert_eq!(again, a);
    }

    #[test]
    fn test_assign_unowned_cells() {
        let mut state = RegistryState::new();
        add_bee(&mut state, bee(1, 1));
        let response = apply(
            &mut state,
            RegistryCommand::AssignBee {
                cells: cells(&["a", "b"]),
                bee: bee(1, 1),
            },
        );
        assert_eq!(response, RegistryResponse::Assigned);
        let (owners, unowned) = state.owners(&app(), &cells(&["a", "b"]));
        assert_eq!(owners, vec![bee(1, 1)]);
        assert!(unowned.is_empty());
    }

    #[test]
    fn test_first_commit_wins_and_loser_is_deleted() {
        let mut state = RegistryState::new();
        add_bee(&mut state, bee(1, 1));
        add_bee(&mut state, bee(2, 2));
        apply(
            &mut state,
            RegistryCommand::AssignBee {
                cells: cells(&["a"]),
                bee: bee(1, 1),
            },
        );

        let (response, events) = state.apply(
            RegistryCommand::AssignBee {
                cells: cells(&["a", "b"]),
                bee: bee(2, 2),
            },
            &FirstCommitWins,
        );
        assert_eq!(response, RegistryResponse::AlreadyOwned { winner: bee(1, 1) });
        assert!(state.bee(&bee(2, 2)).is_none());
        assert!(matches!(&events[..], [RegistryEvent::BeeDeleted(info)] if info.id == bee(2, 2)));

        // Unowned cells of the losing proposal join the winner.
        assert_eq!(state.owner(&app(), &CellKey::new("d", "b")), Some(&bee(1, 1)));
    }

    #[test]
    fn test_assign_conflict() {
        let mut state = RegistryState::new();
        for (hive, key) in [(1, "a"), (2, "b")] {
            add_bee(&mut state, bee(hive, hive));
            apply(
                &mut state,
                RegistryCommand::AssignBee {
                    cells: cells(&[key]),
                    bee: bee(hive, hive),
                },
            );
        }
        add_bee(&mut state, bee(3, 3));
        let response = apply(
            &mut state,
            RegistryCommand::AssignBee {
                cells: cells(&["a", "b"]),
                bee: bee(3, 3),
            },
        );
        assert!(matches!(response, RegistryResponse::Conflict { bees } if bees.len() == 2));
    }

    #[test]
    fn test_assign_missing_bee() {
        let mut state = RegistryState::new();
        let response = apply(
            &mut state,
            RegistryCommand::AssignBee {
                cells: cells(&["a"]),
                bee: bee(1, 1),
            },
        );
        assert_eq!(response, RegistryResponse::NotFound);
    }

    #[test]
    fn test_delete_bee_is_idempotent() {
        let mut state = RegistryState::new();
        add_bee(&mut state, bee(1, 1));
        apply(
            &mut state,
            RegistryCommand::AssignBee {
                cells: cells(&["a"]),
                bee: bee(1, 1),
            },
        );
        let first = state.apply(RegistryCommand::DeleteBee { bee: bee(1, 1) }, &FirstCommitWins);
        let second = state.apply(RegistryCommand::DeleteBee { bee: bee(1, 1) }, &FirstCommitWins);
        assert_eq!(first.0, RegistryResponse::Ok);
        assert_eq!(first.1.len(), 1);
        assert_eq!(second.0, RegistryResponse::Ok);
        assert!(second.1.is_empty());
        assert!(state.owner(&app(), &CellKey::new("d", "a")).is_none());
    }

    #[test]
    fn test_remove_hive_promotes_slaves() {
        let mut state = RegistryState::new();
        for id in 1..=3 {
            state.apply_membership(&MembershipChange::AddNode {
                hive: HiveId(id),
                addr: format!("h{}", id),
            });
        }
        let colony = Colony::with_slaves(bee(1, 1), vec![bee(2, 1), bee(3, 1)]);
        apply(
            &mut state,
            RegistryCommand::AddBee {
                info: BeeInfo::with_colony(colony),
            },
        );
        add_bee(&mut state, bee(1, 9));
        apply(
            &mut state,
            RegistryCommand::AssignBee {
                cells: cells(&["a"]),
                bee: bee(1, 1),
            },
        );

        let (_, events) = state.apply(RegistryCommand::RemoveHive { id: HiveId(1) }, &FirstCommitWins);

        let moved = state.bee(&bee(2, 1)).expect("promoted master");
        assert_eq!(moved.colony.slaves, vec![bee(3, 1)]);
        assert_eq!(state.owner(&app(), &CellKey::new("d", "a")), Some(&bee(2, 1)));
        assert!(state.bee(&bee(1, 9)).is_none());
        assert!(events.contains(&RegistryEvent::HiveRemoved(HiveId(1))));
        assert!(events
            .iter()
            .any(|e| matches!(e, RegistryEvent::BeeMoved { from, .. } if *from == bee(1, 1))));
        assert!(state.hive(HiveId(1)).is_none());
    }

    #[test]
    fn test_reassign_colony_moves_master() {
        let mut state = RegistryState::new();
        add_bee(&mut state, bee(1, 1));
        apply(
            &mut state,
            RegistryCommand::AssignBee {
                cells: cells(&["a"]),
                bee: bee(1, 1),
            },
        );
        let response = apply(
            &mut state,
            RegistryCommand::ReassignColony {
                bee: bee(1, 1),
                colony: Colony::new(bee(2, 1)),
            },
        );
        assert_eq!(response, RegistryResponse::Ok);
        assert!(state.bee(&bee(1, 1)).is_none());
        assert_eq!(state.resolve(&app(), 1).unwrap().id, bee(2, 1));
        assert_eq!(state.owner(&app(), &CellKey::new("d", "a")), Some(&bee(2, 1)));
    }

    #[test]
    fn test_snapshot_rebuilds_cell_index() {
        let mut state = RegistryState::new();
        state.apply_membership(&MembershipChange::AddNode {
            hive: HiveId(1),
            addr: "h1".into(),
        });
        add_bee(&mut state, bee(1, 1));
        apply(
            &mut state,
            RegistryCommand::AssignBee {
                cells: cells(&["a"]),
                bee: bee(1, 1),
            },
        );

        let restored = RegistryState::from_bytes(&state.to_bytes().unwrap()).unwrap();
        assert_eq!(restored.owner(&app(), &CellKey::new("d", "a")), Some(&bee(1, 1)));
        assert_eq!(restored.hives().len(), 1);
        assert_eq!(restored.next_hive_id, state.next_hive_id);
    }

    #[tokio::test]
    async fn test_machine_publishes_events() {
        let registry = Registry::new();
        let mut events = registry.subscribe();
        let mut machine = RegistryMachine::new(registry.clone());

        machine.apply_membership(
            1,
            &MembershipChange::AddNode {
                hive: HiveId(1),
                addr: "h1".into(),
            },
        );
        machine.apply(2, RegistryCommand::AddBee { info: BeeInfo::new(bee(1, 1)) });

        assert!(matches!(events.recv().await.unwrap(), RegistryEvent::HiveAdded(_)));
        assert!(matches!(events.recv().await.unwrap(), RegistryEvent::BeeAdded(_)));
        assert_eq!(registry.bees_on_hive(HiveId(1)).len(), 1);

        let data = machine.snapshot().unwrap();
        let mut other = RegistryMachine::new(Registry::new());
        other.restore(&data).unwrap();
        assert_eq!(other.registry().bees().len(), 1);
    }
}
