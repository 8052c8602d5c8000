//! Applications: handlers, detached handlers and placement options
//!
//! An [`App`] is built once and handed to the hive. Its handler table maps a
//! message type tag to the handler for that type and is never modified
//! afterwards.

use crate::context::{BeeContext, RcvContext};
use crate::hive::{Hive, HiveInner};
use async_trait::async_trait;
use beehive_core::constants::{REPLICATION_FACTOR_DEFAULT, REPLICATION_FACTOR_MAX};
use beehive_core::{AppName, CodecRegistry, Error, HiveId, MappedCells, Message, Msg, Result};
use beehive_registry::Registry;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// What a handler sees while mapping a message
///
/// Mapping is read-only: it may look at the hive and its registry replica
/// but never changes either.
#[derive(Debug, Clone, Copy)]
pub struct MapContext<'a> {
    hive: &'a Arc<HiveInner>,
    app: &'a AppName,
}

impl<'a> MapContext<'a> {
    pub(crate) fn new(hive: &'a Arc<HiveInner>, app: &'a AppName) -> Self {
        Self { hive, app }
    }

    /// The hive doing the mapping
    pub fn hive_id(&self) -> HiveId {
        self.hive.id
    }

    pub fn hive(&self) -> Hive {
        Hive::from_inner(Arc::clone(self.hive))
    }

    /// This hive's replica of the cluster registry
    pub fn registry(&self) -> &'a Registry {
        &self.hive.registry
    }

    pub fn app(&self) -> &AppName {
        self.app
    }
}

/// Handler of one message type
///
/// `map` decides which cells a message touches; every message mapped to
/// overlapping cells is processed by the same bee, one at a time. `rcv` runs
/// inside a dictionary transaction that commits when it returns `Ok`.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    fn map(&self, msg: &Msg, ctx: &MapContext<'_>) -> MappedCells;

    async fn rcv(&self, msg: &Msg, ctx: &mut RcvContext) -> Result<()>;
}

/// Handler of a bee that owns no cells and lives for the whole hive
#[async_trait]
pub trait DetachedHandler: Send + Sync + 'static {
    /// Runs once, in its own task, when the bee starts
    async fn start(&self, _ctx: BeeContext) {}

    /// Called for every unicast message sent to the bee
    async fn rcv(&self, msg: &Msg, ctx: &mut RcvContext) -> Result<()>;

    /// Called once when the hive stops
    async fn stop(&self, _ctx: &BeeContext) {}
}

type CodecInstaller = fn(&CodecRegistry) -> Result<()>;

fn install<T: Message>(codecs: &CodecRegistry) -> Result<()> {
    codecs.register::<T>()
}

/// An application installed on a hive
pub struct App {
    name: AppName,
    handlers: HashMap<&'static str, Arc<dyn Handler>>,
    codecs: Vec<CodecInstaller>,
    detached: Vec<Arc<dyn DetachedHandler>>,
    replication_factor: usize,
    sticky: bool,
}

impl fmt::Debug for App {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut types: Vec<&str> = self.handlers.keys().copied().collect();
        types.sort_unstable();
        f.debug_struct("App")
            .field("name", &self.name)
            .field("types", &types)
            .field("detached", &self.detached.len())
            .field("replication_factor", &self.replication_factor)
            .field("sticky", &self.sticky)
            .finish()
    }
}

impl App {
    /// # Errors
    /// `InvalidId` when `name` is not a valid application name.
    pub fn new(name: impl Into<String>) -> Result<Self> {
        Ok(Self {
            name: AppName::new(name)?,
            handlers: HashMap::new(),
            codecs: Vec::new(),
            detached: Vec::new(),
            replication_factor: REPLICATION_FACTOR_DEFAULT,
            sticky: false,
        })
    }

    /// Handle messages of type `T`; a later handler for the same type
    /// replaces the earlier one
    pub fn handle<T: Message>(mut self, handler: impl Handler) -> Self {
        self.handlers.insert(T::TYPE_NAME, Arc::new(handler));
        self.codecs.push(install::<T>);
        self
    }

    /// Add a detached bee, started on every hive running this app
    pub fn detached(mut self, handler: impl DetachedHandler) -> Self {
        self.detached.push(Arc::new(handler));
        self
    }

    /// Keep `factor - 1` slaves of every bee on other hives
    pub fn with_replication_factor(mut self, factor: usize) -> Self {
        self.replication_factor = factor;
        self
    }

    /// Place bees on the hive that first receives their cells and never move
    /// them; sticky bees have no slaves
    pub fn sticky(mut self) -> Self {
        self.sticky = true;
        self
    }

    pub fn name(&self) -> &AppName {
        &self.name
    }

    pub fn handler(&self, type_name: &str) -> Option<&Arc<dyn Handler>> {
        self.handlers.get(type_name)
    }

    pub fn handles(&self, type_name: &str) -> bool {
        self.handlers.contains_key(type_name)
    }

    /// Type tags with a handler, sorted
    pub fn type_names(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = self.handlers.keys().copied().collect();
        names.sort_unstable();
        names
    }

    pub fn detached_handlers(&self) -> &[Arc<dyn DetachedHandler>] {
        &self.detached
    }

    pub fn replication_factor(&self) -> usize {
        self.replication_factor
    }

    pub fn is_sticky(&self) -> bool {
        self.sticky
    }

    /// Slaves a new bee of this app should get
    pub fn slave_count(&self) -> usize {
        if self.sticky {
            return 0;
        }
        self.replication_factor.saturating_sub(1)
    }

    /// Check the options and install the codecs of every handled type
    pub(crate) fn install(&self, codecs: &CodecRegistry) -> Result<()> {
        if self.replication_factor == 0 || self.replication_factor > REPLICATION_FACTOR_MAX {
            return Err(Error::InvalidConfiguration {
                field: format!("app.{}.replication_factor", self.name),
                reason: format!("must be between 1 and {}", REPLICATION_FACTOR_MAX),
            });
        }
        if self.handlers.is_empty() && self.detached.is_empty() {
            return Err(Error::InvalidConfiguration {
                field: format!("app.{}", self.name),
                reason: "application has no handlers".into(),
            });
        }
        for installer in &self.codecs {
            installer(codecs)?;
        }
        Ok(())
    }
}
