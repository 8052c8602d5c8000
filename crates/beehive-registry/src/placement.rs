//! Bee placement records and replica selection
//!
//! TigerStyle: Explicit placement with a single owner per cell.
//!
//! A bee's replica set is a [`Colony`]: one master that serves messages and
//! zero or more slaves on other hives that receive its committed writes.

use beehive_core::io::{shuffle, RngProvider};
use beehive_core::{AppName, BeeId, HiveId, MappedCells};
use serde::{Deserialize, Serialize};

// =============================================================================
// Colony
// =============================================================================

/// A master bee and its replicas
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Colony {
    pub master: BeeId,
    #[serde(default)]
    pub slaves: Vec<BeeId>,
}

impl Colony {
    /// A colony with no slaves
    pub fn new(master: BeeId) -> Self {
        Self {
            master,
            slaves: Vec::new(),
        }
    }

    /// A colony with the given slaves
    pub fn with_slaves(master: BeeId, slaves: Vec<BeeId>) -> Self {
        debug_assert!(!slaves.contains(&master));
        Self { master, slaves }
    }

    /// Whether `bee` is the master or a slave
    pub fn contains(&self, bee: &BeeId) -> bool {
        &self.master == bee || self.slaves.contains(bee)
    }

    /// Add a slave; returns false if already present
    pub fn add_slave(&mut self, bee: BeeId) -> bool {
        if self.contains(&bee) {
            return false;
        }
        self.slaves.push(bee);
        true
    }

    /// Remove a slave; returns false if absent
    pub fn remove_slave(&mut self, bee: &BeeId) -> bool {
        let before = self.slaves.len();
        self.slaves.retain(|s| s != bee);
        self.slaves.len() != before
    }

    /// Replace the master with the first slave
    ///
    /// Returns `None` when there is no slave to promote.
    pub fn promote_first_slave(&self) -> Option<Colony> {
        let (first, rest) = self.slaves.split_first()?;
        Some(Colony {
            master: first.clone(),
            slaves: rest.to_vec(),
        })
    }

    /// Replace the master, keeping the slaves
    pub fn with_master(&self, master: BeeId) -> Colony {
        let slaves = self
            .slaves
            .iter()
            .filter(|s| **s != master)
            .cloned()
            .collect();
        Colony { master, slaves }
    }

    /// Hives hosting this colony, master first
    pub fn hives(&self) -> Vec<HiveId> {
        std::iter::once(self.master.hive)
            .chain(self.slaves.iter().map(|s| s.hive))
            .collect()
    }
}

// =============================================================================
// BeeInfo
// =============================================================================

/// Registry record of a bee
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BeeInfo {
    pub id: BeeId,
    pub app: AppName,
    pub colony: Colony,
    /// Detached bees own no cells and only receive unicast messages
    #[serde(default)]
    pub detached: bool,
    #[serde(default)]
    pub cells: MappedCells,
}

impl BeeInfo {
    /// Record for a mapped bee with no slaves
    pub fn new(id: BeeId) -> Self {
        Self {
            app: id.app.clone(),
            colony: Colony::new(id.clone()),
            id,
            detached: false,
            cells: MappedCells::local(),
        }
    }

    /// Record for a mapped bee with the given colony
    pub fn with_colony(colony: Colony) -> Self {
        Self {
            id: colony.master.clone(),
            app: colony.master.app.clone(),
            colony,
            detached: false,
            cells: MappedCells::local(),
        }
    }

    /// Record for a detached bee
    pub fn detached(id: BeeId) -> Self {
        Self {
            detached: true,
            ..Self::new(id)
        }
    }

    /// Hive hosting the master
    pub fn hive(&self) -> HiveId {
        self.id.hive
    }
}

// =============================================================================
// Replica Selection
// =============================================================================

/// Pick up to `count` replica hives out of `live`
///
/// Never returns `this`, an excluded hive, or a duplicate. Candidates are
/// shuffled uniformly; when fewer than `count` are eligible, all of them are
/// returned.
pub fn select_replica_nodes(
    live: &[HiveId],
    this: HiveId,
    exclude: &[HiveId],
    count: usize,
    rng: &dyn RngProvider,
) -> Vec<HiveId> {
    if count == 0 {
        return Vec::new();
    }

    let mut candidates: Vec<HiveId> = Vec::with_capacity(live.len());
    for hive in live {
        if *hive == this || exclude.contains(hive) || candidates.contains(hive) {
            continue;
        }
        candidates.push(*hive);
    }

    shuffle(rng, &mut candidates);
    candidates.truncate(count);

    debug_assert!(candidates.len() <= count);
    debug_assert!(!candidates.contains(&this));
    candidates
}

// =============================================================================
// Assignment Policy
// =============================================================================

/// Decides who keeps contested cells when a bee asks for cells already owned
/// by exactly one other bee
///
/// Runs inside the replicated state machine, so it must be deterministic.
pub trait AssignmentPolicy: Send + Sync + std::fmt::Debug {
    /// Return the bee that ends up owning the cells: `owner` or `proposed`
    fn choose<'a>(&self, owner: &'a BeeInfo, proposed: &'a BeeInfo) -> &'a BeeId;
}

/// The bee whose assignment committed first keeps its cells
#[derive(Debug, Clone, Copy, Default)]
pub struct FirstCommitWins;

impl AssignmentPolicy for FirstCommitWins {
    fn choose<'a>(&self, owner: &'a BeeInfo, _proposed: &'a BeeInfo) -> &'a BeeId {
        &owner.id
    }
}
