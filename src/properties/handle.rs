use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::model::{Property, Value};
use crate::Result;

use super::{ContainerId, PropertyStore};

/// A container id bound to its store.
///
/// Vertices and edges expose their properties through one of these.
#[derive(Clone)]
pub struct PropertyHandle {
    store: Arc<PropertyStore>,
    id: ContainerId,
}

impl PropertyHandle {
    pub fn new(store: Arc<PropertyStore>, id: ContainerId) -> Self {
        Self { store, id }
    }

    pub fn id(&self) -> ContainerId {
        self.id
    }

    pub fn store(&self) -> &Arc<PropertyStore> {
        &self.store
    }

    pub fn add(&self, source: &str, name: &str, properties: impl IntoIterator<Item = Property>) -> Result<()> {
        self.store.add_properties(self.id, source, name, properties)
    }

    pub fn remove(&self, source: &str, name: &str, properties: impl IntoIterator<Item = Property>) -> Result<()> {
        self.store.remove_properties(self.id, source, name, properties)
    }

    /// Replace everything `source` asserts for `name`.
    pub fn set(&self, source: &str, name: &str, properties: impl IntoIterator<Item = Property>) -> Result<()> {
        self.store.set_properties(self.id, source, name, properties)
    }

    pub fn all(&self) -> Result<BTreeMap<String, Vec<Property>>> {
        self.store.properties(self.id)
    }

    pub fn get(&self, name: &str) -> Result<Vec<Property>> {
        self.store.property(self.id, name)
    }

    pub fn best(&self, name: &str) -> Result<Option<Value>> {
        self.store.best_property_value(self.id, name)
    }

    pub fn has(&self, names: &[&str]) -> Result<bool> {
        self.store.has_properties(self.id, names)
    }

    pub fn for_source(&self, source: &str) -> Result<BTreeMap<String, Vec<Property>>> {
        self.store.properties_for_source(self.id, source)
    }
}

impl fmt::Debug for PropertyHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PropertyHandle").field(&self.id).finish()
    }
}
