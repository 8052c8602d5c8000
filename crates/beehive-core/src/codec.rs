//! Registry of payload codecs keyed by message type tag
//!
//! Populated when apps are installed, since every handled type is registered
//! alongside its handler, and explicitly for types that are only emitted.

use crate::error::{Error, Result};
use crate::message::Message;
use bytes::Bytes;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

type EncodeFn = fn(&(dyn Any + Send + Sync)) -> Result<Bytes>;
type DecodeFn = fn(&[u8]) -> Result<Arc<dyn Any + Send + Sync>>;

#[derive(Clone, Copy)]
struct Codec {
    type_id: TypeId,
    encode: EncodeFn,
    decode: DecodeFn,
}

fn encode_as<T: Message>(value: &(dyn Any + Send + Sync)) -> Result<Bytes> {
    let value = value
        .downcast_ref::<T>()
        .ok_or_else(|| Error::TypeMismatch {
            expected: T::TYPE_NAME.to_string(),
            actual: "unknown".to_string(),
        })?;
    serde_json::to_vec(value)
        .map(Bytes::from)
        .map_err(Error::serialization)
}

fn decode_as<T: Message>(bytes: &[u8]) -> Result<Arc<dyn Any + Send + Sync>> {
    let value: T = serde_json::from_slice(bytes).map_err(Error::serialization)?;
    Ok(Arc::new(value))
}

/// Type tag to encode/decode functions
#[derive(Default)]
pub struct CodecRegistry {
    codecs: RwLock<HashMap<String, Codec>>,
}

impl std::fmt::Debug for CodecRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodecRegistry")
            .field("types", &self.type_names())
            .finish()
    }
}

impl CodecRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `T` under `T::TYPE_NAME`
    ///
    /// Registering the same type twice is a no-op.
    ///
    /// # Errors
    /// `InvalidMessage` if a different type already owns the tag.
    pub fn register<T: Message>(&self) -> Result<()> {
        let codec = Codec {
            type_id: TypeId::of::<T>(),
            encode: encode_as::<T>,
            decode: decode_as::<T>,
        };

        let mut codecs = self
            .codecs
            .write()
            .map_err(|_| Error::fatal("codec registry lock poisoned"))?;

        if let Some(existing) = codecs.get(T::TYPE_NAME) {
            if existing.type_id != codec.type_id {
                return Err(Error::invalid_message(format!(
                    "type tag {} is already registered to another type",
                    T::TYPE_NAME
                )));
            }
            return Ok(());
        }

        codecs.insert(T::TYPE_NAME.to_string(), codec);
        Ok(())
    }

    /// Whether a codec exists for `type_name`
    pub fn contains(&self, type_name: &str) -> bool {
        self.codecs
            .read()
            .map(|c| c.contains_key(type_name))
            .unwrap_or(false)
    }

    /// Registered tags, sorted
    pub fn type_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .codecs
            .read()
            .map(|c| c.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    fn lookup(&self, type_name: &str) -> Result<Codec> {
        self.codecs
            .read()
            .map_err(|_| Error::fatal("codec registry lock poisoned"))?
            .get(type_name)
            .copied()
            .ok_or_else(|| Error::NoCodec {
                type_name: type_name.to_string(),
            })
    }

    /// Encode a live payload
    pub fn encode(&self, type_name: &str, value: &(dyn Any + Send + Sync)) -> Result<Bytes> {
        let codec = self.lookup(type_name)?;
        (codec.encode)(value)
    }

    /// Decode an encoded payload into a live value
    pub fn decode(&self, type_name: &str, bytes: &[u8]) -> Result<Arc<dyn Any + Send + Sync>> {
        let codec = self.lookup(type_name)?;
        (codec.decode)(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Ping(u32);

    impl Message for Ping {
        const TYPE_NAME: &'static str = "test.ping";
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Impostor(String);

    impl Message for Impostor {
        const TYPE_NAME: &'static str = "test.ping";
    }

    #[test]
    fn test_register_and_roundtrip() {
        let codecs = CodecRegistry::new();
        codecs.register::<Ping>().unwrap();
        codecs.register::<Ping>().unwrap();

        let bytes = codecs.encode("test.ping", &Ping(3)).unwrap();
        let value = codecs.decode("test.ping", &bytes).unwrap();
        assert_eq!(value.downcast_ref::<Ping>(), Some(&Ping(3)));
    }

    #[test]
    fn test_tag_collision_is_rejected() {
        let codecs = CodecRegistry::new();
        codecs.register::<Ping>().unwrap();
        assert!(codecs.register::<Impostor>().is_err());
    }

    #[test]
    fn test_unknown_tag_is_no_codec() {
        let codecs = CodecRegistry::new();
        let err = codecs.decode("missing", b"{}").unwrap_err();
        assert!(matches!(err, Error::NoCodec { .. }));
        assert!(!codecs.contains("missing"));
    }
}
