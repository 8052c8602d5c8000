//! Named dictionary view over a transaction
//!
//! Raw mode reads and writes bytes. Structured mode (`get_value`/`put_value`)
//! stores serde values as JSON.

use crate::transaction::Transaction;
use beehive_core::{Error, Result};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// One dictionary of one bee, bound to the running transaction
pub struct Dictionary<'a> {
    name: String,
    txn: &'a mut Transaction,
}

impl<'a> Dictionary<'a> {
    pub(crate) fn new(name: String, txn: &'a mut Transaction) -> Self {
        Self { name, txn }
    }

    /// Dictionary name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get a value
    ///
    /// # Errors
    /// `KeyNotFound` if the key is absent.
    pub async fn get(&self, key: impl AsRef<[u8]>) -> Result<Bytes> {
        let key = key.as_ref();
        self.try_get(key)
            .await?
            .ok_or_else(|| Error::key_not_found(&self.name, key))
    }

    /// Get a value if present
    pub async fn try_get(&self, key: impl AsRef<[u8]>) -> Result<Option<Bytes>> {
        self.txn.get(&self.name, key.as_ref()).await
    }

    /// Set a value
    pub fn put(&mut self, key: impl Into<Bytes>, value: impl Into<Bytes>) -> Result<()> {
        self.txn.put(&self.name, key.into(), value.into())
    }

    /// Remove a key; removing a missing key succeeds
    pub fn delete(&mut self, key: impl Into<Bytes>) -> Result<()> {
        self.txn.delete(&self.name, key.into())
    }

    /// Visit every entry in key order
    ///
    /// Stops at the first error returned by `f`.
    pub async fn for_each<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(&[u8], &[u8]) -> Result<()>,
    {
        for (key, value) in self.txn.scan(&self.name).await? {
            f(&key, &value)?;
        }
        Ok(())
    }

    /// Get and decode a structured value
    ///
    /// # Errors
    /// `KeyNotFound` if the key is absent, `InvalidMessage` if the stored
    /// bytes do not decode as `T`.
    pub async fn get_value<T: DeserializeOwned>(&self, key: impl AsRef<[u8]>) -> Result<T> {
        let bytes = self.get(key).await?;
        serde_json::from_slice(&bytes).map_err(Error::serialization)
    }

    /// Get and decode a structured value if present
    pub async fn try_get_value<T: DeserializeOwned>(
        &self,
        key: impl AsRef<[u8]>,
    ) -> Result<Option<T>> {
        match self.try_get(key).await? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(Error::serialization),
            None => Ok(None),
        }
    }

    /// Encode and set a structured value
    pub fn put_value<T: Serialize>(&mut self, key: impl Into<Bytes>, value: &T) -> Result<()> {
        let bytes = serde_json::to_vec(value).map_err(Error::serialization)?;
        self.put(key, bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use beehive_core::{AppName, BeeId, ErrorKind, HiveId};
    use serde::Deserialize;
    use std::sync::Arc;

    fn txn() -> Transaction {
        let bee = BeeId::new(HiveId(1), AppName::new("test").unwrap(), 1);
        Transaction::begin(bee, Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn test_missing_key_is_not_found() {
        let mut txn = txn();
        let dict = txn.dict("routes");
        let err = dict.get("nope").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(dict.try_get("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_twice() {
        let mut txn = txn();
        let mut dict = txn.dict("d");
        dict.put("k", "v").unwrap();
        dict.delete("k").unwrap();
        dict.delete("k").unwrap();
        assert!(dict.try_get("k").await.unwrap().is_none());
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Route {
        dest: String,
        priority: u32,
    }

    #[tokio::test]
    async fn test_structured_values() {
        let mut txn = txn();
        let mut dict = txn.dict("routes");
        let route = Route {
            dest: "eth0".into(),
            priority: 2,
        };
        dict.put_value("10.0.0.0/8", &route).unwrap();
        let back: Route = dict.get_value("10.0.0.0/8").await.unwrap();
        assert_eq!(back, route);

        dict.put("raw", "not json").unwrap();
        let err = dict.get_value::<Route>("raw").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[tokio::test]
    async fn test_for_each_in_key_order() {
        let mut txn = txn();
        let mut dict = txn.dict("d");
        dict.put("b", "2").unwrap();
        dict.put("a", "1").unwrap();

        let mut seen = Vec::new();
        dict.for_each(|k, v| {
            seen.push((k.to_vec(), v.to_vec()));
            Ok(())
        })
        .await
        .unwrap();
        assert_eq!(
            seen,
            vec![(b"a".to_vec(), b"1".to_vec()), (b"b".to_vec(), b"2".to_vec())]
        );
    }
}
