//! # Property reconciliation
//!
//! Every vertex and edge owns a container in one shared arena. A container
//! holds raw per-source assertions and a derived winning set, and inherits
//! the winning sets of its ancestors as if they were extra sources.
//!
//! ```text
//!   source "pcap"  ──┐
//!   source "user"  ──┼──► provided ──┐
//!   source "geoip" ──┘               ├──► computed (winning set) ──► events
//!   ancestor containers ─────────────┘            │
//!                                                 └──► descendants
//! ```
//!
//! Two masking policies share the engine:
//!
//! - [`MaskingPolicy::ByName`]: per name, only values at the best confidence
//!   present are visible (vertices).
//! - [`MaskingPolicy::ByValue`]: per (name, value), only the best confidence
//!   of that value is visible; other values coexist at any confidence
//!   (edges).
//!
//! Lower confidence ordinal wins (see [`Confidence`]).
//!
//! ## Locking
//!
//! The arena sits behind one mutex, so a container's computed set, its
//! ancestor set and its provided map are always taken together and in the
//! same order. Ancestor to descendant propagation runs under that same
//! lock. Events are queued before the lock is released, in the order the
//! changes were applied, and delivered to
//! [`PropertyStore::on_property_changed`] after it is released. Observers
//! therefore see every container's changes in the order the arena made
//! them, whichever thread made them.

mod cache;
mod handle;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::event::{Event, ExecutionProvider, OrderedEvent};
use crate::model::{Confidence, Property, Value};
use crate::Result;

use cache::Arena;

pub use handle::PropertyHandle;

// ============================================================================
// Identifiers and messages
// ============================================================================

/// Stable handle of one container in the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContainerId(pub u64);

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "container#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MaskingPolicy {
    /// A better confidence hides every value under the same name.
    ByName,
    /// A better confidence hides only the same value.
    ByValue,
}

/// One change to a container's winning set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyEvent {
    pub container: ContainerId,
    pub name: String,
    pub property: Property,
    pub added: bool,
}

// ============================================================================
// PropertyStore
// ============================================================================

pub struct PropertyStore {
    arena: Mutex<Arena>,
    on_property_changed: OrderedEvent<PropertyEvent>,
}

impl PropertyStore {
    pub fn new(provider: Arc<dyn ExecutionProvider>) -> Self {
        Self {
            arena: Mutex::new(Arena::default()),
            on_property_changed: OrderedEvent::new(provider),
        }
    }

    pub fn on_property_changed(&self) -> &Event<PropertyEvent> {
        self.on_property_changed.event()
    }

    pub fn create(&self, policy: MaskingPolicy) -> ContainerId {
        self.arena.lock().create(policy)
    }

    pub fn len(&self) -> usize {
        self.arena.lock().containers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn policy(&self, id: ContainerId) -> Result<MaskingPolicy> {
        Ok(self.arena.lock().get(id)?.policy)
    }

    fn mutate<R>(&self, f: impl FnOnce(&mut Arena, &mut Vec<PropertyEvent>) -> Result<R>) -> Result<R> {
        let result = {
            let mut arena = self.arena.lock();
            let mut out = Vec::new();
            let result = f(&mut arena, &mut out);
            // Changes applied before a failure still happened; announce them.
            self.on_property_changed.queue_all(out);
            result
        };
        self.on_property_changed.flush();
        result
    }

    fn mutate_silently<R>(&self, f: impl FnOnce(&mut Arena, &mut Vec<PropertyEvent>) -> Result<R>) -> Result<R> {
        f(&mut self.arena.lock(), &mut Vec::new())
    }

    // ========================================================================
    // Mutations
    // ========================================================================

    /// Record assertions from `source`; new ones feed the winning set.
    pub fn add_properties(
        &self,
        id: ContainerId,
        source: &str,
        name: &str,
        properties: impl IntoIterator<Item = Property>,
    ) -> Result<()> {
        self.mutate(|arena, out| arena.add_properties(id, source, name, properties, out))
    }

    /// Retract assertions previously made by `source`.
    pub fn remove_properties(
        &self,
        id: ContainerId,
        source: &str,
        name: &str,
        properties: impl IntoIterator<Item = Property>,
    ) -> Result<()> {
        self.mutate(|arena, out| arena.remove_properties(id, source, name, properties, out))
    }

    /// Make `properties` the whole of what `source` asserts for `name`.
    ///
    /// New assertions are added before dropped ones are retracted, so a
    /// value kept across the call never leaves the winning set.
    pub fn set_properties(
        &self,
        id: ContainerId,
        source: &str,
        name: &str,
        properties: impl IntoIterator<Item = Property>,
    ) -> Result<()> {
        self.mutate(|arena, out| arena.set_properties(id, source, name, properties, out))
    }

    /// Inherit `ancestor`'s winning set. Returns false if already attached.
    pub fn add_ancestor(&self, id: ContainerId, ancestor: ContainerId) -> Result<bool> {
        self.mutate(|arena, out| arena.add_ancestor(id, ancestor, out))
    }

    /// Stop inheriting from `ancestor`. Returns false if it was not attached.
    pub fn remove_ancestor(&self, id: ContainerId, ancestor: ContainerId) -> Result<bool> {
        self.mutate(|arena, out| arena.remove_ancestor(id, ancestor, out))
    }

    /// Detach the container from the hierarchy and drop it.
    pub fn remove_container(&self, id: ContainerId) -> Result<()> {
        self.mutate(|arena, out| arena.remove_container(id, out))
    }

    /// Attach an ancestor without emitting events; pair with [`reannounce`](Self::reannounce).
    pub(crate) fn restore_ancestor(&self, id: ContainerId, ancestor: ContainerId) -> Result<bool> {
        self.mutate_silently(|arena, out| arena.add_ancestor(id, ancestor, out))
    }

    /// Record assertions without emitting events; pair with [`reannounce`](Self::reannounce).
    pub(crate) fn restore_properties(
        &self,
        id: ContainerId,
        source: &str,
        name: &str,
        properties: impl IntoIterator<Item = Property>,
    ) -> Result<()> {
        self.mutate_silently(|arena, out| arena.add_properties(id, source, name, properties, out))
    }

    /// Emit `added` for every winning property, e.g. after loading.
    pub fn reannounce(&self, id: ContainerId) -> Result<()> {
        self.mutate(|arena, out| {
            arena.get(id)?;
            out.extend(arena.computed_entries(id).into_iter().map(|(name, property)| PropertyEvent {
                container: id,
                name,
                property,
                added: true,
            }));
            Ok(())
        })
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn ancestors(&self, id: ContainerId) -> Result<Vec<ContainerId>> {
        Ok(self.arena.lock().get(id)?.ancestors.to_vec())
    }

    pub fn descendants(&self, id: ContainerId) -> Result<Vec<ContainerId>> {
        Ok(self.arena.lock().get(id)?.descendants.to_vec())
    }

    /// Winning set per name.
    pub fn properties(&self, id: ContainerId) -> Result<BTreeMap<String, Vec<Property>>> {
        let arena = self.arena.lock();
        Ok(arena
            .get(id)?
            .computed
            .iter()
            .map(|(name, line)| (name.clone(), line.values().cloned().collect()))
            .collect())
    }

    /// Winning set for one name; empty when nothing is known.
    pub fn property(&self, id: ContainerId, name: &str) -> Result<Vec<Property>> {
        let arena = self.arena.lock();
        Ok(arena
            .get(id)?
            .computed
            .get(name)
            .map(|line| line.values().cloned().collect())
            .unwrap_or_default())
    }

    /// What `source` asserted directly, regardless of masking.
    pub fn properties_for_source(
        &self,
        id: ContainerId,
        source: &str,
    ) -> Result<BTreeMap<String, Vec<Property>>> {
        let arena = self.arena.lock();
        let container = arena.get(id)?;
        Ok(container
            .provided
            .get(source)
            .map(|by_name| {
                by_name
                    .iter()
                    .map(|(name, set)| (name.clone(), sorted(set.iter().cloned())))
                    .collect()
            })
            .unwrap_or_default())
    }

    /// Every direct assertion as `source → name → properties`.
    pub fn provided(
        &self,
        id: ContainerId,
    ) -> Result<BTreeMap<String, BTreeMap<String, Vec<Property>>>> {
        let arena = self.arena.lock();
        Ok(arena
            .get(id)?
            .provided
            .iter()
            .map(|(source, by_name)| {
                let by_name = by_name
                    .iter()
                    .map(|(name, set)| (name.clone(), sorted(set.iter().cloned())))
                    .collect();
                (source.clone(), by_name)
            })
            .collect())
    }

    /// Value at the best (numerically lowest) confidence for `name`.
    ///
    /// Ties at the best confidence resolve to the smallest value.
    pub fn best_property_value(&self, id: ContainerId, name: &str) -> Result<Option<Value>> {
        let arena = self.arena.lock();
        Ok(arena.get(id)?.computed.get(name).and_then(|line| {
            line.values()
                .min_by_key(|p| p.confidence())
                .map(|p| p.value().clone())
        }))
    }

    /// True when every name has at least one winning value.
    pub fn has_properties(&self, id: ContainerId, names: &[&str]) -> Result<bool> {
        let arena = self.arena.lock();
        let container = arena.get(id)?;
        Ok(names
            .iter()
            .all(|name| container.computed.get(*name).is_some_and(|line| !line.is_empty())))
    }
}

fn sorted(properties: impl Iterator<Item = Property>) -> Vec<Property> {
    let mut out: Vec<Property> = properties.collect();
    out.sort_by(|a, b| a.confidence().cmp(&b.confidence()).then_with(|| a.value().cmp(b.value())));
    out
}

impl fmt::Debug for PropertyStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PropertyStore").field("containers", &self.len()).finish()
    }
}

/// Shorthand for building a single assertion.
pub fn prop(value: impl Into<Value>, confidence: Confidence) -> Property {
    Property::new(value, confidence)
}
