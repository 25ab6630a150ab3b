//! Network blocks reported by sources, reduced to one consistent list.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::event::{Event, ExecutionProvider, OrderedEvent};
use crate::model::{Confidence, Network};

#[derive(Default)]
struct Networks {
    reported: BTreeMap<String, BTreeSet<Network>>,
    calculated: Vec<Network>,
}

/// Per-source reported networks and the reconciled list derived from them.
///
/// Networks are merged one confidence tier at a time, best first. A network
/// is dropped when a network from an earlier tier contains it; networks in
/// the same tier never drop each other.
pub struct NetworkList {
    state: RwLock<Networks>,
    on_network_change: OrderedEvent<Vec<Network>>,
}

impl NetworkList {
    pub fn new(provider: Arc<dyn ExecutionProvider>) -> Self {
        Self {
            state: RwLock::new(Networks::default()),
            on_network_change: OrderedEvent::new(provider),
        }
    }

    pub fn on_network_change(&self) -> &Event<Vec<Network>> {
        self.on_network_change.event()
    }

    /// Returns true when `source` had not reported `network` before.
    pub fn add_network(&self, source: &str, network: Network) -> bool {
        let inserted = {
            let mut state = self.state.write();
            let inserted = state.reported.entry(source.to_owned()).or_default().insert(network);
            if inserted {
                self.recalculate(&mut state);
            }
            inserted
        };
        self.on_network_change.flush();
        inserted
    }

    pub fn remove_network(&self, source: &str, network: &Network) -> bool {
        let removed = {
            let mut state = self.state.write();
            let removed = state.reported.get_mut(source).is_some_and(|set| set.remove(network));
            if state.reported.get(source).is_some_and(BTreeSet::is_empty) {
                state.reported.remove(source);
            }
            if removed {
                self.recalculate(&mut state);
            }
            removed
        };
        self.on_network_change.flush();
        removed
    }

    /// The reconciled list, ordered by address.
    pub fn networks(&self) -> Vec<Network> {
        self.state.read().calculated.clone()
    }

    pub fn reported(&self) -> BTreeMap<String, BTreeSet<Network>> {
        self.state.read().reported.clone()
    }

    fn recalculate(&self, state: &mut Networks) {
        let next = reduce(&state.reported);
        if state.calculated != next {
            debug!(count = next.len(), "network list changed");
            state.calculated = next.clone();
            self.on_network_change.queue(next);
        }
    }
}

fn reduce(reported: &BTreeMap<String, BTreeSet<Network>>) -> Vec<Network> {
    let mut tiers: BTreeMap<Confidence, BTreeSet<Network>> = BTreeMap::new();
    for network in reported.values().flatten() {
        tiers.entry(network.confidence).or_default().insert(*network);
    }

    let mut kept: Vec<Network> = Vec::new();
    for tier in tiers.into_values() {
        let survivors: Vec<Network> =
            tier.into_iter().filter(|n| !kept.iter().any(|k| k.contains(n))).collect();
        kept.extend(survivors);
    }
    kept.sort_by(|a, b| a.address.cmp(&b.address));
    kept
}
