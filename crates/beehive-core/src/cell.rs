//! Cells: the unit of partitioned application state

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// One key of one dictionary
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CellKey {
    pub dict: String,
    pub key: Bytes,
}

impl CellKey {
    /// Create a cell key
    pub fn new(dict: impl Into<String>, key: impl Into<Bytes>) -> Self {
        Self {
            dict: dict.into(),
            key: key.into(),
        }
    }
}

impl fmt::Display for CellKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.dict, String::from_utf8_lossy(&self.key))
    }
}

/// The set of cells a message touches
///
/// All cells in one set are served by the same bee. An empty set means the
/// message is handled by the app's local bee on the receiving hive.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MappedCells(BTreeSet<CellKey>);

impl MappedCells {
    /// The empty ("local") mapping
    pub fn local() -> Self {
        Self::default()
    }

    /// A mapping with a single cell
    pub fn single(dict: impl Into<String>, key: impl Into<Bytes>) -> Self {
        let mut cells = Self::default();
        cells.add(dict, key);
        cells
    }

    /// Add a cell; duplicates are ignored
    pub fn add(&mut self, dict: impl Into<String>, key: impl Into<Bytes>) -> &mut Self {
        self.0.insert(CellKey::new(dict, key));
        self
    }

    /// Add an existing cell key
    pub fn insert(&mut self, cell: CellKey) -> bool {
        self.0.insert(cell)
    }

    /// Remove a cell; returns false if it was absent
    pub fn remove(&mut self, cell: &CellKey) -> bool {
        self.0.remove(cell)
    }

    /// Whether this is the local mapping
    pub fn is_local(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of distinct cells
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the set is empty
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether the set holds `cell`
    pub fn contains(&self, cell: &CellKey) -> bool {
        self.0.contains(cell)
    }

    /// Iterate cells in order
    pub fn iter(&self) -> impl Iterator<Item = &CellKey> {
        self.0.iter()
    }

    /// Cells in order
    pub fn into_vec(self) -> Vec<CellKey> {
        self.0.into_iter().collect()
    }
}

impl FromIterator<CellKey> for MappedCells {
    fn from_iter<I: IntoIterator<Item = CellKey>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for MappedCells {
    type Item = CellKey;
    type IntoIter = std::collections::btree_set::IntoIter<CellKey>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a MappedCells {
    type Item = &'a CellKey;
    type IntoIter = std::collections::btree_set::Iter<'a, CellKey>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl fmt::Display for MappedCells {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, cell) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}", cell)?;
        }
        f.write_str("]")
    }
}
