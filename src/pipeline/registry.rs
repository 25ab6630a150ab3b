//! Explicit catalogue of stage kinds available to pipeline construction.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;

use crate::session::Session;
use crate::{Error, Result};

use super::stage::StageLogic;
use super::stages;

/// Identifies a stage kind: the plugin that provides it plus its name there.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StageKey {
    pub plugin: String,
    pub kind: String,
}

impl StageKey {
    pub fn new(plugin: impl Into<String>, kind: impl Into<String>) -> Self {
        Self { plugin: plugin.into(), kind: kind.into() }
    }
}

impl fmt::Display for StageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.plugin, self.kind)
    }
}

/// Everything a factory gets to build one stage instance.
pub struct StageBuildContext<'a> {
    pub session: &'a Arc<Session>,
    /// Name of the stage in its template.
    pub name: &'a str,
    /// Stored configuration, or the descriptor's default.
    pub config: &'a JsonValue,
}

impl StageBuildContext<'_> {
    /// Deserialize the configuration into the stage's config type.
    pub fn parse_config<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.config.clone())
            .map_err(|e| Error::Configuration(format!("stage '{}': {e}", self.name)))
    }
}

pub type StageFactory = Arc<dyn Fn(&StageBuildContext<'_>) -> Result<Box<dyn StageLogic>> + Send + Sync>;

#[derive(Clone)]
pub struct StageDescriptor {
    pub key: StageKey,
    /// Human readable name, used as the default stage name in templates.
    pub display_name: String,
    pub outputs: Vec<String>,
    pub configurable: bool,
    pub default_config: JsonValue,
    pub factory: StageFactory,
}

impl fmt::Debug for StageDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageDescriptor")
            .field("key", &self.key)
            .field("display_name", &self.display_name)
            .field("outputs", &self.outputs)
            .field("configurable", &self.configurable)
            .finish()
    }
}

/// Mapping from [`StageKey`] to descriptor, passed by value into
/// [`Pipeline::build`](super::Pipeline::build).
#[derive(Debug, Clone, Default)]
pub struct StageRegistry {
    descriptors: BTreeMap<StageKey, StageDescriptor>,
}

impl StageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the stages this crate ships.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        stages::register_builtins(&mut registry);
        registry
    }

    /// Add a descriptor; returns the one it replaced.
    pub fn register(&mut self, descriptor: StageDescriptor) -> Option<StageDescriptor> {
        self.descriptors.insert(descriptor.key.clone(), descriptor)
    }

    pub fn get(&self, key: &StageKey) -> Option<&StageDescriptor> {
        self.descriptors.get(key)
    }

    pub fn lookup(&self, plugin: &str, kind: &str) -> Option<&StageDescriptor> {
        self.get(&StageKey::new(plugin, kind))
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &StageDescriptor> {
        self.descriptors.values()
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    /// Instantiate a stage. `config` of `None` falls back to the default.
    pub fn build(
        &self,
        key: &StageKey,
        name: &str,
        session: &Arc<Session>,
        config: Option<&JsonValue>,
    ) -> Result<Box<dyn StageLogic>> {
        let descriptor = self
            .get(key)
            .ok_or_else(|| Error::Template(format!("no stage kind {key} is registered")))?;
        let config = config.unwrap_or(&descriptor.default_config);
        let ctx = StageBuildContext { session, name, config };
        (descriptor.factory)(&ctx)
    }
}
