//! Winning-set maintenance over the container arena.
//!
//! Every mutation of a computed line is applied and then announced before
//! the next one is applied. Announcing pushes the event for the outer
//! listeners and replays the change into every descendant, so at any
//! moment a descendant has seen exactly the changes that its ancestors
//! have already applied. Rebuilding a descendant line mid-cascade
//! therefore reads ancestor state consistent with what it was told.

use std::collections::BTreeMap;

use hashbrown::{HashMap, HashSet};
use smallvec::SmallVec;
use tracing::trace;

use crate::model::{Confidence, Property, Value};
use crate::{Error, Result};

use super::{ContainerId, MaskingPolicy, PropertyEvent};

pub(super) type Line = BTreeMap<Value, Property>;

#[derive(Debug)]
pub(super) struct Container {
    pub(super) policy: MaskingPolicy,
    /// source → name → assertions
    pub(super) provided: HashMap<String, HashMap<String, HashSet<Property>>>,
    /// name → winning set, one entry per value
    pub(super) computed: BTreeMap<String, Line>,
    pub(super) ancestors: SmallVec<[ContainerId; 2]>,
    pub(super) descendants: SmallVec<[ContainerId; 4]>,
}

impl Container {
    fn new(policy: MaskingPolicy) -> Self {
        Self {
            policy,
            provided: HashMap::new(),
            computed: BTreeMap::new(),
            ancestors: SmallVec::new(),
            descendants: SmallVec::new(),
        }
    }
}

#[derive(Debug, Default)]
pub(super) struct Arena {
    pub(super) containers: HashMap<ContainerId, Container>,
    next_id: u64,
}

impl Arena {
    pub(super) fn create(&mut self, policy: MaskingPolicy) -> ContainerId {
        self.next_id += 1;
        let id = ContainerId(self.next_id);
        self.containers.insert(id, Container::new(policy));
        id
    }

    pub(super) fn get(&self, id: ContainerId) -> Result<&Container> {
        self.containers.get(&id).ok_or(Error::UnknownContainer(id))
    }

    fn get_mut(&mut self, id: ContainerId) -> Result<&mut Container> {
        self.containers.get_mut(&id).ok_or(Error::UnknownContainer(id))
    }

    // ========================================================================
    // Source assertions
    // ========================================================================

    pub(super) fn add_properties(
        &mut self,
        id: ContainerId,
        source: &str,
        name: &str,
        properties: impl IntoIterator<Item = Property>,
        out: &mut Vec<PropertyEvent>,
    ) -> Result<()> {
        self.get(id)?;
        for property in properties {
            let property = property.with_references(1);
            let inserted = self
                .get_mut(id)?
                .provided
                .entry(source.to_owned())
                .or_default()
                .entry(name.to_owned())
                .or_default()
                .insert(property.clone());
            if inserted {
                self.add_to_cache(id, name, property.value(), property.confidence(), out);
            }
        }
        Ok(())
    }

    pub(super) fn remove_properties(
        &mut self,
        id: ContainerId,
        source: &str,
        name: &str,
        properties: impl IntoIterator<Item = Property>,
        out: &mut Vec<PropertyEvent>,
    ) -> Result<()> {
        self.get(id)?;
        for property in properties {
            let container = self.get_mut(id)?;
            let Some(by_name) = container.provided.get_mut(source) else {
                return Ok(());
            };
            let removed = match by_name.get_mut(name) {
                Some(set) => {
                    let removed = set.remove(&property);
                    if set.is_empty() {
                        by_name.remove(name);
                    }
                    removed
                }
                None => false,
            };
            if by_name.is_empty() {
                container.provided.remove(source);
            }
            if removed {
                self.remove_from_cache(id, name, property.value(), property.confidence(), out);
            }
        }
        Ok(())
    }

    /// Replace what `source` asserts for `name`: add the new set, then
    /// retract whatever dropped out of it.
    pub(super) fn set_properties(
        &mut self,
        id: ContainerId,
        source: &str,
        name: &str,
        properties: impl IntoIterator<Item = Property>,
        out: &mut Vec<PropertyEvent>,
    ) -> Result<()> {
        let wanted: Vec<Property> = properties.into_iter().collect();
        let mut dropped: Vec<Property> = self
            .get(id)?
            .provided
            .get(source)
            .and_then(|by_name| by_name.get(name))
            .map(|set| set.iter().filter(|p| !wanted.contains(p)).cloned().collect())
            .unwrap_or_default();
        dropped.sort_by(|a, b| a.confidence().cmp(&b.confidence()).then_with(|| a.value().cmp(b.value())));

        self.add_properties(id, source, name, wanted, out)?;
        self.remove_properties(id, source, name, dropped, out)
    }

    // ========================================================================
    // Ancestry
    // ========================================================================

    pub(super) fn add_ancestor(
        &mut self,
        id: ContainerId,
        ancestor: ContainerId,
        out: &mut Vec<PropertyEvent>,
    ) -> Result<bool> {
        self.get(id)?;
        self.get(ancestor)?;
        if id == ancestor || self.is_ancestor_of(id, ancestor) {
            return Err(Error::InvalidArgument(format!(
                "attaching {ancestor} to {id} would create an ancestry cycle"
            )));
        }
        if self.get(id)?.ancestors.contains(&ancestor) {
            return Ok(false);
        }
        self.get_mut(id)?.ancestors.push(ancestor);
        self.get_mut(ancestor)?.descendants.push(id);

        for (name, property) in self.computed_entries(ancestor) {
            self.add_to_cache(id, &name, property.value(), property.confidence(), out);
        }
        Ok(true)
    }

    pub(super) fn remove_ancestor(
        &mut self,
        id: ContainerId,
        ancestor: ContainerId,
        out: &mut Vec<PropertyEvent>,
    ) -> Result<bool> {
        self.get(ancestor)?;
        let container = self.get_mut(id)?;
        let Some(pos) = container.ancestors.iter().position(|a| *a == ancestor) else {
            return Ok(false);
        };
        container.ancestors.remove(pos);
        let upstream = self.get_mut(ancestor)?;
        upstream.descendants.retain(|d| *d != id);

        for (name, property) in self.computed_entries(ancestor) {
            self.remove_from_cache(id, &name, property.value(), property.confidence(), out);
        }
        Ok(true)
    }

    /// True when `candidate` is `id` or one of its transitive ancestors.
    fn is_ancestor_of(&self, candidate: ContainerId, id: ContainerId) -> bool {
        let mut stack = vec![id];
        let mut seen = HashSet::new();
        while let Some(next) = stack.pop() {
            if next == candidate {
                return true;
            }
            if !seen.insert(next) {
                continue;
            }
            if let Some(container) = self.containers.get(&next) {
                stack.extend(container.ancestors.iter().copied());
            }
        }
        false
    }

    pub(super) fn remove_container(
        &mut self,
        id: ContainerId,
        out: &mut Vec<PropertyEvent>,
    ) -> Result<()> {
        let container = self.get(id)?;
        let descendants = container.descendants.clone();
        let ancestors = container.ancestors.clone();
        for descendant in descendants {
            self.remove_ancestor(descendant, id, out)?;
        }
        for ancestor in ancestors {
            if let Some(upstream) = self.containers.get_mut(&ancestor) {
                upstream.descendants.retain(|d| *d != id);
            }
        }
        self.containers.remove(&id);
        Ok(())
    }

    pub(super) fn computed_entries(&self, id: ContainerId) -> Vec<(String, Property)> {
        self.containers
            .get(&id)
            .map(|c| {
                c.computed
                    .iter()
                    .flat_map(|(name, line)| line.values().map(move |p| (name.clone(), p.clone())))
                    .collect()
            })
            .unwrap_or_default()
    }

    // ========================================================================
    // Winning-set maintenance
    // ========================================================================

    fn add_to_cache(
        &mut self,
        id: ContainerId,
        name: &str,
        value: &Value,
        confidence: Confidence,
        out: &mut Vec<PropertyEvent>,
    ) {
        let Some(container) = self.containers.get_mut(&id) else {
            return;
        };
        let policy = container.policy;
        let line = container.computed.entry(name.to_owned()).or_default();

        // The confidence this assertion competes against.
        let incumbent = match policy {
            MaskingPolicy::ByValue => line.get(value).map(Property::confidence),
            MaskingPolicy::ByName => line.values().map(Property::confidence).min(),
        };

        match incumbent {
            None => {
                self.insert_and_announce(id, name, Property::new(value.clone(), confidence), out);
            }
            Some(current) if confidence.outranks(current) => {
                let displaced: Vec<Value> = match policy {
                    MaskingPolicy::ByValue => vec![value.clone()],
                    MaskingPolicy::ByName => line.keys().cloned().collect(),
                };
                for old in displaced {
                    self.remove_and_announce(id, name, &old, out);
                }
                self.insert_and_announce(id, name, Property::new(value.clone(), confidence), out);
            }
            Some(current) if current == confidence => match line.get_mut(value) {
                Some(existing) => existing.add_reference(),
                None => {
                    self.insert_and_announce(id, name, Property::new(value.clone(), confidence), out);
                }
            },
            Some(_) => {
                trace!(container = %id, name, %value, %confidence, "assertion masked");
            }
        }
    }

    fn remove_from_cache(
        &mut self,
        id: ContainerId,
        name: &str,
        value: &Value,
        confidence: Confidence,
        out: &mut Vec<PropertyEvent>,
    ) {
        let Some(container) = self.containers.get_mut(&id) else {
            return;
        };
        let Some(entry) = container
            .computed
            .get_mut(name)
            .and_then(|line| line.get_mut(value))
            .filter(|entry| entry.confidence() == confidence)
        else {
            // The contribution was masked and never counted.
            trace!(container = %id, name, %value, %confidence, "removal of masked assertion ignored");
            return;
        };
        if entry.remove_reference() > 0 {
            return;
        }
        self.remove_and_announce(id, name, value, out);
        self.rebuild_line(id, name, out);
    }

    /// Recompute the winning set for `name` from scratch and apply the diff.
    fn rebuild_line(&mut self, id: ContainerId, name: &str, out: &mut Vec<PropertyEvent>) {
        let Ok(container) = self.get(id) else {
            return;
        };
        let desired = self.desired_line(container, name);
        let current: Vec<Property> = container
            .computed
            .get(name)
            .map(|line| line.values().cloned().collect())
            .unwrap_or_default();

        for existing in &current {
            let keep = desired
                .get(existing.value())
                .is_some_and(|wanted| wanted.confidence() == existing.confidence());
            if !keep {
                self.remove_and_announce(id, name, existing.value(), out);
            }
        }

        for (value, wanted) in desired {
            let Some(container) = self.containers.get_mut(&id) else {
                return;
            };
            let line = container.computed.entry(name.to_owned()).or_default();
            match line.get_mut(&value) {
                Some(existing) if existing.confidence() == wanted.confidence() => {
                    existing.set_references(wanted.references());
                }
                _ => self.insert_and_announce(id, name, wanted, out),
            }
        }

        if let Some(container) = self.containers.get_mut(&id) {
            if container.computed.get(name).is_some_and(|line| line.is_empty()) {
                container.computed.remove(name);
            }
        }
    }

    /// Winning set for `name` computed from every contribution.
    ///
    /// Each ancestor entry and each provided assertion counts once; the
    /// reference count of a winner is the number of contributions at its
    /// confidence.
    fn desired_line(&self, container: &Container, name: &str) -> Line {
        let mut best: BTreeMap<Value, (Confidence, u32)> = BTreeMap::new();
        let mut contribute = |property: &Property| {
            let slot = best
                .entry(property.value().clone())
                .or_insert((property.confidence(), 0));
            if property.confidence().outranks(slot.0) {
                *slot = (property.confidence(), 1);
            } else if property.confidence() == slot.0 {
                slot.1 += 1;
            }
        };

        for ancestor in &container.ancestors {
            if let Some(line) = self.containers.get(ancestor).and_then(|a| a.computed.get(name)) {
                line.values().for_each(&mut contribute);
            }
        }
        for by_name in container.provided.values() {
            if let Some(set) = by_name.get(name) {
                set.iter().for_each(&mut contribute);
            }
        }

        let target = match container.policy {
            MaskingPolicy::ByValue => None,
            MaskingPolicy::ByName => best.values().map(|(c, _)| *c).min(),
        };
        best.into_iter()
            .filter(|(_, (confidence, _))| target.is_none_or(|t| t == *confidence))
            .map(|(value, (confidence, count))| {
                (value.clone(), Property::new(value, confidence).with_references(count))
            })
            .collect()
    }

    fn insert_and_announce(
        &mut self,
        id: ContainerId,
        name: &str,
        property: Property,
        out: &mut Vec<PropertyEvent>,
    ) {
        if let Some(container) = self.containers.get_mut(&id) {
            container
                .computed
                .entry(name.to_owned())
                .or_default()
                .insert(property.value().clone(), property.clone());
            self.announce(id, name, property, true, out);
        }
    }

    fn remove_and_announce(
        &mut self,
        id: ContainerId,
        name: &str,
        value: &Value,
        out: &mut Vec<PropertyEvent>,
    ) {
        let Some(container) = self.containers.get_mut(&id) else {
            return;
        };
        let Some(line) = container.computed.get_mut(name) else {
            return;
        };
        let Some(removed) = line.remove(value) else {
            return;
        };
        if line.is_empty() {
            container.computed.remove(name);
        }
        self.announce(id, name, removed, false, out);
    }

    /// Record the change and replay it into every descendant.
    fn announce(
        &mut self,
        id: ContainerId,
        name: &str,
        property: Property,
        added: bool,
        out: &mut Vec<PropertyEvent>,
    ) {
        let descendants = self
            .containers
            .get(&id)
            .map(|c| c.descendants.clone())
            .unwrap_or_default();
        let (value, confidence) = (property.value().clone(), property.confidence());
        out.push(PropertyEvent { container: id, name: name.to_owned(), property, added });
        for descendant in descendants {
            if added {
                self.add_to_cache(descendant, name, &value, confidence, out);
            } else {
                self.remove_from_cache(descendant, name, &value, confidence, out);
            }
        }
    }
}
