//! Message envelope
//!
//! A [`Msg`] carries a type-tagged payload between bees. Payloads created on
//! this hive stay as live values until they have to cross the wire; payloads
//! received from the wire stay encoded until a handler asks for them.

use crate::codec::CodecRegistry;
use crate::error::{Error, Result};
use crate::ids::{BeeId, HiveId};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// A payload type that can travel in a [`Msg`]
///
/// `TYPE_NAME` is the tag handlers are registered under and the tag written
/// on the wire. It must be unique within a cluster.
pub trait Message: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const TYPE_NAME: &'static str;
}

/// Who sent a message, and therefore where a reply goes
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MsgSource {
    /// Emitted from outside any bee; cannot be replied to
    External,
    /// Emitted by a bee
    Bee { id: BeeId },
    /// Emitted by a synchronous caller blocked in `process`
    Waiter { hive: HiveId, waiter: u64 },
}

/// Where a message is delivered
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MsgTarget {
    /// Every app with a handler for the type, each routing by its own mapping
    Broadcast,
    /// Exactly one bee
    Bee { id: BeeId },
}

/// Message payload
#[derive(Clone)]
pub enum Payload {
    /// A live value created on this hive
    Local(Arc<dyn Any + Send + Sync>),
    /// JSON bytes received from another hive
    Encoded(Bytes),
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local(_) => f.write_str("Local(..)"),
            Self::Encoded(bytes) => write!(f, "Encoded({} bytes)", bytes.len()),
        }
    }
}

/// A message
///
/// Immutable once enqueued; clones share the payload.
#[derive(Debug, Clone)]
pub struct Msg {
    id: u64,
    type_name: Arc<str>,
    payload: Payload,
    from: MsgSource,
    to: MsgTarget,
}

impl Msg {
    /// Wrap a typed value
    pub fn new<T: Message>(id: u64, data: T, from: MsgSource, to: MsgTarget) -> Self {
        Self {
            id,
            type_name: Arc::from(T::TYPE_NAME),
            payload: Payload::Local(Arc::new(data)),
            from,
            to,
        }
    }

    /// Rebuild a message from its wire form
    pub fn from_frame(frame: MsgFrame) -> Self {
        Self {
            id: frame.id,
            type_name: Arc::from(frame.type_name),
            payload: Payload::Encoded(frame.payload),
            from: frame.from,
            to: frame.to,
        }
    }

    /// Message id
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Type tag of the payload
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// Sender
    pub fn from(&self) -> &MsgSource {
        &self.from
    }

    /// Destination
    pub fn to(&self) -> &MsgTarget {
        &self.to
    }

    /// Raw payload
    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// Whether the payload is of type `T`
    pub fn is<T: Message>(&self) -> bool {
        &*self.type_name == T::TYPE_NAME
    }

    /// Whether a reply to this message can be delivered
    pub fn no_reply(&self) -> bool {
        matches!(self.from, MsgSource::External)
    }

    /// Whether this message targets exactly one bee
    pub fn is_unicast(&self) -> bool {
        matches!(self.to, MsgTarget::Bee { .. })
    }

    /// Whether this message goes to every interested app
    pub fn is_broadcast(&self) -> bool {
        matches!(self.to, MsgTarget::Broadcast)
    }

    /// The sending bee, if any
    pub fn sender_bee(&self) -> Option<&BeeId> {
        match &self.from {
            MsgSource::Bee { id } => Some(id),
            _ => None,
        }
    }

    /// The destination bee of a unicast message
    pub fn target_bee(&self) -> Option<&BeeId> {
        match &self.to {
            MsgTarget::Bee { id } => Some(id),
            MsgTarget::Broadcast => None,
        }
    }

    /// Typed payload
    ///
    /// # Errors
    /// `TypeMismatch` if the tag differs from `T::TYPE_NAME`, or an
    /// `InvalidMessage` if an encoded payload does not decode as `T`.
    pub fn data<T: Message>(&self) -> Result<T> {
        if !self.is::<T>() {
            return Err(Error::TypeMismatch {
                expected: T::TYPE_NAME.to_string(),
                actual: self.type_name.to_string(),
            });
        }

        match &self.payload {
            Payload::Local(value) => {
                value
                    .downcast_ref::<T>()
                    .cloned()
                    .ok_or_else(|| Error::TypeMismatch {
                        expected: std::any::type_name::<T>().to_string(),
                        actual: self.type_name.to_string(),
                    })
            }
            Payload::Encoded(bytes) => serde_json::from_slice(bytes).map_err(Error::serialization),
        }
    }

    /// Same message with a different destination
    pub fn retarget(&self, to: MsgTarget) -> Self {
        Self {
            to,
            ..self.clone()
        }
    }

    /// Turn an encoded payload into a live value using the codec for its tag
    ///
    /// Messages whose tag has no codec are returned unchanged.
    pub fn decoded(self, codecs: &CodecRegistry) -> Result<Self> {
        let bytes = match &self.payload {
            Payload::Local(_) => return Ok(self),
            Payload::Encoded(bytes) => bytes.clone(),
        };
        match codecs.decode(&self.type_name, &bytes) {
            Ok(value) => Ok(Self {
                payload: Payload::Local(value),
                ..self
            }),
            Err(Error::NoCodec { .. }) => Ok(self),
            Err(e) => Err(e),
        }
    }

    /// Wire form of this message
    ///
    /// # Errors
    /// `NoCodec` if a live payload's tag has no registered codec.
    pub fn to_frame(&self, codecs: &CodecRegistry) -> Result<MsgFrame> {
        let payload = match &self.payload {
            Payload::Local(value) => codecs.encode(&self.type_name, value.as_ref())?,
            Payload::Encoded(bytes) => bytes.clone(),
        };
        Ok(MsgFrame {
            id: self.id,
            type_name: self.type_name.to_string(),
            payload,
            from: self.from.clone(),
            to: self.to.clone(),
        })
    }
}

/// Serializable form of a [`Msg`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgFrame {
    pub id: u64,
    pub type_name: String,
    pub payload: Bytes,
    pub from: MsgSource,
    pub to: MsgTarget,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::AppName;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Put {
        key: String,
        value: u32,
    }

    impl Message for Put {
        const TYPE_NAME: &'static str = "test.put";
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Get(String);

    impl Message for Get {
        const TYPE_NAME: &'static str = "test.get";
    }

    fn put() -> Put {
        Put {
            key: "a".into(),
            value: 7,
        }
    }

    #[test]
    fn test_local_payload_data() {
        let msg = Msg::new(1, put(), MsgSource::External, MsgTarget::Broadcast);
        assert_eq!(msg.type_name(), "test.put");
        assert_eq!(msg.data::<Put>().unwrap(), put());
        assert!(msg.no_reply());
    }

    #[test]
    fn test_wrong_type_is_type_mismatch() {
        let msg = Msg::new(1, put(), MsgSource::External, MsgTarget::Broadcast);
        let err = msg.data::<Get>().unwrap_err();
        assert!(matches!(err, Error::TypeMismatch { .. }));
    }

    #[test]
    fn test_frame_without_codec_fails() {
        let codecs = CodecRegistry::new();
        let msg = Msg::new(1, put(), MsgSource::External, MsgTarget::Broadcast);
        let err = msg.to_frame(&codecs).unwrap_err();
        assert!(matches!(err, Error::NoCodec { .. }));
    }

    #[test]
    fn test_frame_preserves_envelope() {
        let codecs = CodecRegistry::new();
        codecs.register::<Put>().unwrap();

        let app = AppName::new("kv").unwrap();
        let sender = BeeId::new(HiveId(1), app.clone(), 5);
        let target = BeeId::new(HiveId(2), app, 9);
        let msg = Msg::new(
            42,
            put(),
            MsgSource::Bee { id: sender.clone() },
            MsgTarget::Bee { id: target.clone() },
        );

        let frame = msg.to_frame(&codecs).unwrap();
        let json = serde_json::to_vec(&frame).unwrap();
        let back: MsgFrame = serde_json::from_slice(&json).unwrap();
        let received = Msg::from_frame(back);

        assert_eq!(received.id(), 42);
        assert_eq!(received.sender_bee(), Some(&sender));
        assert_eq!(received.target_bee(), Some(&target));
        assert!(matches!(received.payload(), Payload::Encoded(_)));
        assert_eq!(received.data::<Put>().unwrap(), put());

        let decoded = received.decoded(&codecs).unwrap();
        assert!(matches!(decoded.payload(), Payload::Local(_)));
        assert_eq!(decoded.data::<Put>().unwrap(), put());
    }

    #[test]
    fn test_waiter_source_accepts_replies() {
        let msg = Msg::new(
            1,
            Get("a".into()),
            MsgSource::Waiter {
                hive: HiveId(1),
                waiter: 3,
            },
            MsgTarget::Broadcast,
        );
        assert!(!msg.no_reply());
        assert!(msg.is_broadcast());
    }
}
