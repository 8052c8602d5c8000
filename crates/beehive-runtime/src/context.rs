//! What a bee sees while it runs
//!
//! [`BeeContext`] is the bee's handle on its hive. [`RcvContext`] wraps it for
//! the duration of one message: dictionary access goes through the message's
//! transaction, and outgoing messages are held back until that transaction
//! commits. A failed handler therefore neither writes nor sends anything.

use crate::hive::{Hive, HiveInner};
use beehive_core::{BeeId, Error, HiveId, Message, Msg, MsgSource, MsgTarget, Result, RngProvider};
use beehive_storage::{Dictionary, Transaction};
use std::fmt;
use std::sync::Arc;

/// A message waiting for its transaction to commit
#[derive(Debug)]
pub(crate) enum Outgoing {
    /// Routed through the hive like any emitted message
    Data(Msg),
    /// Answer to a synchronous caller
    Answer { hive: HiveId, waiter: u64, msg: Msg },
}

/// A bee's handle on its hive
#[derive(Clone)]
pub struct BeeContext {
    id: BeeId,
    hive: Arc<HiveInner>,
}

impl fmt::Debug for BeeContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BeeContext").field("id", &self.id).finish()
    }
}

impl BeeContext {
    pub(crate) fn new(id: BeeId, hive: Arc<HiveInner>) -> Self {
        Self { id, hive }
    }

    pub fn id(&self) -> &BeeId {
        &self.id
    }

    pub fn hive_id(&self) -> HiveId {
        self.hive.id
    }

    /// The hive this bee runs on
    pub fn hive(&self) -> Hive {
        Hive::from_inner(Arc::clone(&self.hive))
    }

    pub(crate) fn inner(&self) -> &Arc<HiveInner> {
        &self.hive
    }

    /// Broadcast `data` to every app handling its type
    pub async fn emit<T: Message>(&self, data: T) -> Result<()> {
        let msg = self.message(data, MsgTarget::Broadcast)?;
        self.hive.enqueue_data(msg).await
    }

    /// Send `data` to one bee
    pub async fn send_to_bee<T: Message>(&self, data: T, to: &BeeId) -> Result<()> {
        let msg = self.message(data, MsgTarget::Bee { id: to.clone() })?;
        self.hive.enqueue_data(msg).await
    }

    /// Answer `msg`
    ///
    /// # Errors
    /// `NoReply` when the sender accepts no replies.
    pub async fn reply_to<T: Message>(&self, msg: &Msg, data: T) -> Result<()> {
        let outgoing = self.reply(msg, data)?;
        self.hive.deliver(outgoing).await
    }

    fn message<T: Message>(&self, data: T, to: MsgTarget) -> Result<Msg> {
        self.hive.ensure_codec::<T>()?;
        Ok(Msg::new(
            self.hive.next_msg_id(),
            data,
            MsgSource::Bee {
                id: self.id.clone(),
            },
            to,
        ))
    }

    fn reply<T: Message>(&self, msg: &Msg, data: T) -> Result<Outgoing> {
        match msg.from() {
            MsgSource::External => Err(Error::NoReply { msg_id: msg.id() }),
            MsgSource::Bee { id } => {
                let reply = self.message(data, MsgTarget::Bee { id: id.clone() })?;
                Ok(Outgoing::Data(reply))
            }
            MsgSource::Waiter { hive, waiter } => {
                let reply = self.message(data, MsgTarget::Broadcast)?;
                Ok(Outgoing::Answer {
                    hive: *hive,
                    waiter: *waiter,
                    msg: reply,
                })
            }
        }
    }
}

/// Context of one `rcv` call
pub struct RcvContext {
    bee: BeeContext,
    tx: Transaction,
    outbox: Vec<Outgoing>,
}

impl fmt::Debug for RcvContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RcvContext")
            .field("bee", &self.bee.id)
            .field("writes", &self.tx.len())
            .field("outbox", &self.outbox.len())
            .finish()
    }
}

impl RcvContext {
    pub(crate) fn new(bee: BeeContext, tx: Transaction) -> Self {
        Self {
            bee,
            tx,
            outbox: Vec::new(),
        }
    }

    pub fn id(&self) -> &BeeId {
        &self.bee.id
    }

    pub fn hive_id(&self) -> HiveId {
        self.bee.hive_id()
    }

    pub fn bee(&self) -> &BeeContext {
        &self.bee
    }

    /// One of this bee's dictionaries
    pub fn dict(&mut self, name: impl Into<String>) -> Dictionary<'_> {
        self.tx.dict(name)
    }

    /// The hive's random source
    pub fn rng(&self) -> &dyn RngProvider {
        self.bee.hive.io.rng.as_ref()
    }

    /// Broadcast `data` once the transaction commits
    pub fn emit<T: Message>(&mut self, data: T) -> Result<()> {
        let msg = self.bee.message(data, MsgTarget::Broadcast)?;
        self.outbox.push(Outgoing::Data(msg));
        Ok(())
    }

    /// Send `data` to `to` once the transaction commits
    pub fn send_to_bee<T: Message>(&mut self, data: T, to: &BeeId) -> Result<()> {
        let msg = self.bee.message(data, MsgTarget::Bee { id: to.clone() })?;
        self.outbox.push(Outgoing::Data(msg));
        Ok(())
    }

    /// Answer `msg` once the transaction commits
    ///
    /// # Errors
    /// `NoReply` when the sender accepts no replies.
    pub fn reply_to<T: Message>(&mut self, msg: &Msg, data: T) -> Result<()> {
        let outgoing = self.bee.reply(msg, data)?;
        self.outbox.push(outgoing);
        Ok(())
    }

    pub(crate) fn into_parts(self) -> (Transaction, Vec<Outgoing>) {
        (self.tx, self.outbox)
    }
}
