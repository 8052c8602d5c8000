//! Transactions over a bee's dictionaries
//!
//! TigerStyle: Explicit transaction lifecycle, bounded operations.
//!
//! Every handler invocation runs inside one transaction. Writes are buffered
//! and become visible to the store only on commit; reads see the buffer first.

use crate::dictionary::Dictionary;
use crate::kv::{check_key, check_value, DictOp, StateStore};
use beehive_core::{BeeId, Error, Result};
use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Maximum number of distinct keys written by one transaction
pub const TRANSACTION_KEYS_COUNT_MAX: usize = 10_000;

/// Transaction state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Transaction is active
    Active,
    /// Transaction has been committed
    Committed,
    /// Transaction has been aborted
    Aborted,
}

/// A buffered, all-or-nothing batch of dictionary writes for one bee
pub struct Transaction {
    bee: BeeId,
    store: Arc<dyn StateStore>,
    state: TransactionState,
    /// (dict, key) -> Some(value) for put, None for delete
    writes: BTreeMap<(String, Bytes), Option<Bytes>>,
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("bee", &self.bee)
            .field("state", &self.state)
            .field("writes", &self.writes.len())
            .finish()
    }
}

impl Transaction {
    /// Begin a transaction for `bee`
    pub fn begin(bee: BeeId, store: Arc<dyn StateStore>) -> Self {
        Self {
            bee,
            store,
            state: TransactionState::Active,
            writes: BTreeMap::new(),
        }
    }

    /// Bee this transaction writes to
    pub fn bee(&self) -> &BeeId {
        &self.bee
    }

    /// Current state
    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// Number of buffered writes
    pub fn len(&self) -> usize {
        self.writes.len()
    }

    /// Whether nothing has been written
    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    fn ensure_active(&self) -> Result<()> {
        if self.state != TransactionState::Active {
            return Err(Error::fatal(format!(
                "transaction for {} is {:?}",
                self.bee, self.state
            )));
        }
        Ok(())
    }

    /// A view of one dictionary
    pub fn dict(&mut self, name: impl Into<String>) -> Dictionary<'_> {
        Dictionary::new(name.into(), self)
    }

    /// Read a key, seeing this transaction's own writes
    pub async fn get(&self, dict: &str, key: &[u8]) -> Result<Option<Bytes>> {
        self.ensure_active()?;
        check_key(dict, key)?;

        let slot = (dict.to_string(), Bytes::copy_from_slice(key));
        if let Some(buffered) = self.writes.get(&slot) {
            return Ok(buffered.clone());
        }
        self.store.get(&self.bee, dict, key).await
    }

    /// Buffer a write
    pub fn put(&mut self, dict: &str, key: Bytes, value: Bytes) -> Result<()> {
        self.ensure_active()?;
        check_key(dict, &key)?;
        check_value(&value)?;
        self.buffer((dict.to_string(), key), Some(value))
    }

    /// Buffer a delete
    pub fn delete(&mut self, dict: &str, key: Bytes) -> Result<()> {
        self.ensure_active()?;
        check_key(dict, &key)?;
        self.buffer((dict.to_string(), key), None)
    }

    fn buffer(&mut self, slot: (String, Bytes), value: Option<Bytes>) -> Result<()> {
        if !self.writes.contains_key(&slot) && self.writes.len() >= TRANSACTION_KEYS_COUNT_MAX {
            return Err(Error::MessageTooLarge {
                size: self.writes.len() + 1,
                limit: TRANSACTION_KEYS_COUNT_MAX,
            });
        }
        self.writes.insert(slot, value);
        Ok(())
    }

    /// All entries of a dictionary as this transaction sees them
    pub async fn scan(&self, dict: &str) -> Result<Vec<(Bytes, Bytes)>> {
        self.ensure_active()?;
        let mut merged: BTreeMap<Bytes, Bytes> =
            self.store.scan(&self.bee, dict).await?.into_iter().collect();

        for ((d, key), value) in &self.writes {
            if d != dict {
                continue;
            }
            match value {
                Some(v) => {
                    merged.insert(key.clone(), v.clone());
                }
                None => {
                    merged.remove(key);
                }
            }
        }
        Ok(merged.into_iter().collect())
    }

    /// Apply the buffered writes and return them
    ///
    /// The returned ops are what a master ships to its slaves.
    pub async fn commit(&mut self) -> Result<Vec<DictOp>> {
        self.ensure_active()?;

        let ops: Vec<DictOp> = std::mem::take(&mut self.writes)
            .into_iter()
            .map(|((dict, key), value)| match value {
                Some(value) => DictOp::Put { dict, key, value },
                None => DictOp::Delete { dict, key },
            })
            .collect();

        if !ops.is_empty() {
            if let Err(e) = self.store.commit(&self.bee, &ops).await {
                self.state = TransactionState::Aborted;
                return Err(e);
            }
        }
        self.state = TransactionState::Committed;
        Ok(ops)
    }

    /// Discard the buffered writes
    pub fn abort(&mut self) {
        debug_assert_eq!(self.state, TransactionState::Active);
        self.writes.clear();
        self.state = TransactionState::Aborted;
    }
}
