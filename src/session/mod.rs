//! # Session graph store
//!
//! Owns the four identity maps of the network graph and the property arena
//! behind every vertex and edge.
//!
//! ```text
//!   HardwareVertex ──ancestor──► LogicalVertex
//!        │                            │
//!   PhysicalConnection          LogicalConnection
//! ```
//!
//! ## Locking
//!
//! Each map has its own lock. When more than one is needed they are taken
//! in this order and never the other way round:
//!
//! 1. physical connections
//! 2. logical connections
//! 3. logical vertices
//! 4. hardware vertices
//!
//! Code that needs a consistent view across maps goes through
//! [`Session::execute_with_lock`]. Creation events are emitted after every
//! map lock has been released.

pub mod import;
pub mod network;
pub mod vertex;
pub mod xml;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::{RwLock, RwLockReadGuard};
use tracing::{debug, info};

use crate::config::RuntimeConfig;
use crate::event::{Event, ExecutionProvider, ThreadQueue, in_thread};
use crate::model::{
    AddressPair, HardwareAddress, HardwareAddressPair, LogicalAddressMapping, LogicalAddressPair,
    Network,
};
use crate::pipeline::PipelineTemplate;
use crate::properties::{ContainerId, MaskingPolicy, PropertyHandle, PropertyStore};
use crate::{Error, Result};

pub use import::ImportItem;
pub use network::NetworkList;
pub use vertex::{
    Connection, Endpoint, HardwareVertex, LogicalConnection, LogicalVertex, PhysicalConnection,
    PropertyOwner,
};

type HardwareMap = HashMap<HardwareAddress, Arc<HardwareVertex>>;
type LogicalMap = HashMap<LogicalAddressMapping, Arc<LogicalVertex>>;
type PhysicalEdgeMap = HashMap<HardwareAddressPair, Arc<PhysicalConnection>>;
type LogicalEdgeMap = HashMap<LogicalAddressPair, Arc<LogicalConnection>>;

// ============================================================================
// Session
// ============================================================================

pub struct Session {
    provider: Arc<dyn ExecutionProvider>,
    store: Arc<PropertyStore>,

    physical_edges: RwLock<PhysicalEdgeMap>,
    logical_edges: RwLock<LogicalEdgeMap>,
    logical_vertices: RwLock<LogicalMap>,
    hardware_vertices: RwLock<HardwareMap>,

    owners: RwLock<HashMap<ContainerId, PropertyOwner>>,
    networks: NetworkList,
    imports: RwLock<Vec<ImportItem>>,
    template: RwLock<Option<PipelineTemplate>>,

    on_hardware_vertex_created: Event<Arc<HardwareVertex>>,
    on_logical_vertex_created: Event<Arc<LogicalVertex>>,
    on_physical_connection_created: Event<Arc<PhysicalConnection>>,
    on_logical_connection_created: Event<Arc<LogicalConnection>>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session").finish_non_exhaustive()
    }
}

impl Session {
    /// Session whose events run synchronously on the mutating thread.
    pub fn new() -> Self {
        Self::with_provider(in_thread())
    }

    /// Session whose events are serialized on one dedicated thread.
    pub fn threaded(config: &RuntimeConfig) -> Result<Self> {
        let provider = ThreadQueue::shared("session-exec", config.execution_queue_capacity)?;
        Ok(Self::with_provider(provider))
    }

    pub fn with_provider(provider: Arc<dyn ExecutionProvider>) -> Self {
        Self {
            store: Arc::new(PropertyStore::new(Arc::clone(&provider))),
            physical_edges: RwLock::new(HashMap::new()),
            logical_edges: RwLock::new(HashMap::new()),
            logical_vertices: RwLock::new(HashMap::new()),
            hardware_vertices: RwLock::new(HashMap::new()),
            owners: RwLock::new(HashMap::new()),
            networks: NetworkList::new(Arc::clone(&provider)),
            imports: RwLock::new(Vec::new()),
            template: RwLock::new(None),
            on_hardware_vertex_created: Event::new(Arc::clone(&provider)),
            on_logical_vertex_created: Event::new(Arc::clone(&provider)),
            on_physical_connection_created: Event::new(Arc::clone(&provider)),
            on_logical_connection_created: Event::new(Arc::clone(&provider)),
            provider,
        }
    }

    pub fn provider(&self) -> &Arc<dyn ExecutionProvider> {
        &self.provider
    }

    pub fn store(&self) -> &Arc<PropertyStore> {
        &self.store
    }

    /// Block until every event emitted so far has been delivered.
    pub fn wait_for_sync(&self) {
        self.provider.run_now(Box::new(|| {}));
    }

    // ========================================================================
    // Events
    // ========================================================================

    pub fn on_hardware_vertex_created(&self) -> &Event<Arc<HardwareVertex>> {
        &self.on_hardware_vertex_created
    }

    pub fn on_logical_vertex_created(&self) -> &Event<Arc<LogicalVertex>> {
        &self.on_logical_vertex_created
    }

    pub fn on_physical_connection_created(&self) -> &Event<Arc<PhysicalConnection>> {
        &self.on_physical_connection_created
    }

    pub fn on_logical_connection_created(&self) -> &Event<Arc<LogicalConnection>> {
        &self.on_logical_connection_created
    }

    pub fn on_property_changed(&self) -> &Event<crate::properties::PropertyEvent> {
        self.store.on_property_changed()
    }

    pub fn on_network_change(&self) -> &Event<Vec<Network>> {
        self.networks.on_network_change()
    }

    // ========================================================================
    // Vertices
    // ========================================================================

    /// Get or create the vertex for `address`.
    pub fn hardware_vertex_for(&self, address: &HardwareAddress) -> Arc<HardwareVertex> {
        let vertex = {
            let mut map = self.hardware_vertices.write();
            if let Some(existing) = map.get(address) {
                return Arc::clone(existing);
            }
            let vertex = Arc::new(HardwareVertex::new(address.clone(), self.new_handle(MaskingPolicy::ByName)));
            map.insert(address.clone(), Arc::clone(&vertex));
            vertex
        };
        self.register_owner(vertex.properties().id(), PropertyOwner::Hardware(address.clone()));
        debug!(%address, "hardware vertex created");
        self.on_hardware_vertex_created.emit(Arc::clone(&vertex));
        vertex
    }

    pub fn hardware_vertex(&self, address: &HardwareAddress) -> Option<Arc<HardwareVertex>> {
        self.hardware_vertices.read().get(address).cloned()
    }

    /// Get or create the vertex for `mapping`.
    ///
    /// The hardware vertex of the mapping must already exist.
    pub fn logical_vertex_for(&self, mapping: &LogicalAddressMapping) -> Result<Arc<LogicalVertex>> {
        let vertex = {
            let mut map = self.logical_vertices.write();
            if let Some(existing) = map.get(mapping) {
                return Ok(Arc::clone(existing));
            }
            let hardware = self
                .hardware_vertices
                .read()
                .get(&mapping.hardware)
                .cloned()
                .ok_or_else(|| {
                    Error::PreconditionViolated(format!("unknown hardware address {}", mapping.hardware))
                })?;
            let handle = self.new_handle(MaskingPolicy::ByName);
            let vertex = Arc::new(LogicalVertex::new(mapping.clone(), hardware, handle));
            map.insert(mapping.clone(), Arc::clone(&vertex));
            vertex
        };
        self.register_owner(vertex.properties().id(), PropertyOwner::Logical(mapping.clone()));
        debug!(%mapping, "logical vertex created");
        self.on_logical_vertex_created.emit(Arc::clone(&vertex));
        // Attached only now, so the inherited `added` events follow the
        // creation event and take their place among concurrent changes to
        // the hardware vertex.
        self.store
            .add_ancestor(vertex.properties().id(), vertex.hardware_vertex().properties().id())?;
        Ok(vertex)
    }

    pub fn logical_vertex(&self, mapping: &LogicalAddressMapping) -> Option<Arc<LogicalVertex>> {
        self.logical_vertices.read().get(mapping).cloned()
    }

    // ========================================================================
    // Connections
    // ========================================================================

    /// Get or create the physical connection between two known hardware vertices.
    pub fn create_physical_edge(
        &self,
        a: &HardwareAddress,
        b: &HardwareAddress,
    ) -> Result<Arc<PhysicalConnection>> {
        let key = AddressPair::new(a.clone(), b.clone())?;
        let connection = {
            let mut map = self.physical_edges.write();
            if let Some(existing) = map.get(&key) {
                return Ok(Arc::clone(existing));
            }
            let (source, destination) = {
                let vertices = self.hardware_vertices.read();
                (lookup(&vertices, key.source())?, lookup(&vertices, key.destination())?)
            };
            let connection = Arc::new(Connection::new(source, destination, self.new_handle(MaskingPolicy::ByValue))?);
            map.insert(key.clone(), Arc::clone(&connection));
            connection
        };
        self.register_owner(connection.properties().id(), PropertyOwner::PhysicalEdge(key));
        self.on_physical_connection_created.emit(Arc::clone(&connection));
        Ok(connection)
    }

    /// Get or create the logical connection between two known logical vertices.
    pub fn create_logical_edge(
        &self,
        a: &LogicalAddressMapping,
        b: &LogicalAddressMapping,
    ) -> Result<Arc<LogicalConnection>> {
        let key = AddressPair::new(a.clone(), b.clone())?;
        let connection = {
            let mut map = self.logical_edges.write();
            if let Some(existing) = map.get(&key) {
                return Ok(Arc::clone(existing));
            }
            let (source, destination) = {
                let vertices = self.logical_vertices.read();
                (lookup(&vertices, key.source())?, lookup(&vertices, key.destination())?)
            };
            let connection = Arc::new(Connection::new(source, destination, self.new_handle(MaskingPolicy::ByValue))?);
            map.insert(key.clone(), Arc::clone(&connection));
            connection
        };
        self.register_owner(connection.properties().id(), PropertyOwner::LogicalEdge(key));
        self.on_logical_connection_created.emit(Arc::clone(&connection));
        Ok(connection)
    }

    pub fn existing_physical_edge(
        &self,
        a: &HardwareAddress,
        b: &HardwareAddress,
    ) -> Option<Arc<PhysicalConnection>> {
        let key = AddressPair::new(a.clone(), b.clone()).ok()?;
        self.physical_edges.read().get(&key).cloned()
    }

    pub fn existing_logical_edge(
        &self,
        a: &LogicalAddressMapping,
        b: &LogicalAddressMapping,
    ) -> Option<Arc<LogicalConnection>> {
        let key = AddressPair::new(a.clone(), b.clone()).ok()?;
        self.logical_edges.read().get(&key).cloned()
    }

    // ========================================================================
    // Snapshots
    // ========================================================================

    /// Every hardware vertex, ordered by address.
    pub fn hardware_vertices(&self) -> Vec<Arc<HardwareVertex>> {
        sorted_by_key(self.hardware_vertices.read().values().cloned().collect(), |v| v.address().clone())
    }

    pub fn logical_vertices(&self) -> Vec<Arc<LogicalVertex>> {
        sorted_by_key(self.logical_vertices.read().values().cloned().collect(), |v| v.mapping().clone())
    }

    pub fn physical_edges(&self) -> Vec<Arc<PhysicalConnection>> {
        sorted_by_key(self.physical_edges.read().values().cloned().collect(), |c| c.key().clone())
    }

    pub fn logical_edges(&self) -> Vec<Arc<LogicalConnection>> {
        sorted_by_key(self.logical_edges.read().values().cloned().collect(), |c| c.key().clone())
    }

    /// The vertex or edge a property container belongs to.
    pub fn owner_of(&self, id: ContainerId) -> Option<PropertyOwner> {
        self.owners.read().get(&id).cloned()
    }

    // ========================================================================
    // Cross-map access
    // ========================================================================

    /// Run `f` with all four maps read-locked in the fixed order.
    pub fn execute_with_lock<R>(&self, f: impl FnOnce(&LockedSession<'_>) -> R) -> R {
        let physical_edges = self.physical_edges.read();
        let logical_edges = self.logical_edges.read();
        let logical_vertices = self.logical_vertices.read();
        let hardware_vertices = self.hardware_vertices.read();
        f(&LockedSession { physical_edges, logical_edges, logical_vertices, hardware_vertices })
    }

    pub fn for_each_hardware_vertex_with_lock(&self, mut f: impl FnMut(&Arc<HardwareVertex>)) {
        self.hardware_vertices.read().values().for_each(&mut f);
    }

    pub fn for_each_logical_vertex_with_lock(&self, mut f: impl FnMut(&Arc<LogicalVertex>)) {
        self.logical_vertices.read().values().for_each(&mut f);
    }

    pub fn for_each_physical_edge_with_lock(&self, mut f: impl FnMut(&Arc<PhysicalConnection>)) {
        self.physical_edges.read().values().for_each(&mut f);
    }

    pub fn for_each_logical_edge_with_lock(&self, mut f: impl FnMut(&Arc<LogicalConnection>)) {
        self.logical_edges.read().values().for_each(&mut f);
    }

    // ========================================================================
    // Networks, imports, pipeline template
    // ========================================================================

    pub fn add_network(&self, source: &str, network: Network) -> bool {
        self.networks.add_network(source, network)
    }

    pub fn remove_network(&self, source: &str, network: &Network) -> bool {
        self.networks.remove_network(source, network)
    }

    pub fn networks(&self) -> &NetworkList {
        &self.networks
    }

    pub fn add_import(&self, item: ImportItem) {
        info!(path = %item.path.display(), importer = %item.importer, "import queued");
        self.imports.write().push(item);
    }

    pub fn imports(&self) -> Vec<ImportItem> {
        self.imports.read().clone()
    }

    /// Claim `item` for processing: add it to the list if no matching item
    /// is there yet, then stamp it started. Returns false when the item, or
    /// the matching one in the list, has already started.
    pub fn begin_import(&self, item: &ImportItem) -> bool {
        if item.is_started() {
            return false;
        }
        let mut imports = self.imports.write();
        let index = match imports.iter().position(|i| i.same_source(item)) {
            Some(index) => index,
            None => {
                info!(path = %item.path.display(), importer = %item.importer, "import queued");
                imports.push(item.clone());
                imports.len() - 1
            }
        };
        let claimed = &mut imports[index];
        if claimed.is_started() {
            return false;
        }
        claimed.started = Some(Utc::now());
        true
    }

    /// Stamp the first unstarted import of `path` as started now.
    pub fn mark_import_started(&self, path: &std::path::Path) -> bool {
        let mut imports = self.imports.write();
        match imports.iter_mut().find(|i| i.path == path && !i.is_started()) {
            Some(item) => {
                item.started = Some(Utc::now());
                true
            }
            None => false,
        }
    }

    pub fn pipeline_template(&self) -> Option<PipelineTemplate> {
        self.template.read().clone()
    }

    pub fn set_pipeline_template(&self, template: PipelineTemplate) {
        *self.template.write() = Some(template);
    }

    // ========================================================================
    // Restoring a saved document
    // ========================================================================

    /// Insert a logical vertex under `hardware` without consulting the
    /// hardware map.
    pub(crate) fn restore_logical_vertex(
        &self,
        mapping: LogicalAddressMapping,
        hardware: Arc<HardwareVertex>,
    ) -> Result<Arc<LogicalVertex>> {
        let handle = self.new_handle(MaskingPolicy::ByName);
        self.store.restore_ancestor(handle.id(), hardware.properties().id())?;
        let vertex = Arc::new(LogicalVertex::new(mapping.clone(), hardware, handle));
        self.logical_vertices.write().insert(mapping.clone(), Arc::clone(&vertex));
        self.register_owner(vertex.properties().id(), PropertyOwner::Logical(mapping));
        self.on_logical_vertex_created.emit(Arc::clone(&vertex));
        Ok(vertex)
    }

    pub(crate) fn restore_physical_edge(
        &self,
        a: Arc<HardwareVertex>,
        b: Arc<HardwareVertex>,
    ) -> Result<Arc<PhysicalConnection>> {
        let connection = Arc::new(Connection::new(a, b, self.new_handle(MaskingPolicy::ByValue))?);
        let key = connection.key().clone();
        self.physical_edges.write().insert(key.clone(), Arc::clone(&connection));
        self.register_owner(connection.properties().id(), PropertyOwner::PhysicalEdge(key));
        self.on_physical_connection_created.emit(Arc::clone(&connection));
        Ok(connection)
    }

    pub(crate) fn restore_logical_edge(
        &self,
        a: Arc<LogicalVertex>,
        b: Arc<LogicalVertex>,
    ) -> Result<Arc<LogicalConnection>> {
        let connection = Arc::new(Connection::new(a, b, self.new_handle(MaskingPolicy::ByValue))?);
        let key = connection.key().clone();
        self.logical_edges.write().insert(key.clone(), Arc::clone(&connection));
        self.register_owner(connection.properties().id(), PropertyOwner::LogicalEdge(key));
        self.on_logical_connection_created.emit(Arc::clone(&connection));
        Ok(connection)
    }

    fn new_handle(&self, policy: MaskingPolicy) -> PropertyHandle {
        PropertyHandle::new(Arc::clone(&self.store), self.store.create(policy))
    }

    fn register_owner(&self, id: ContainerId, owner: PropertyOwner) {
        self.owners.write().insert(id, owner);
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

fn lookup<K, V>(map: &HashMap<K, Arc<V>>, key: &K) -> Result<Arc<V>>
where
    K: std::hash::Hash + Eq + std::fmt::Display,
{
    map.get(key)
        .cloned()
        .ok_or_else(|| Error::PreconditionViolated(format!("no vertex for {key}")))
}

fn sorted_by_key<T, K: Ord>(mut items: Vec<T>, key: impl Fn(&T) -> K) -> Vec<T> {
    items.sort_by_key(|item| key(item));
    items
}

// ============================================================================
// LockedSession
// ============================================================================

/// Read access to all four maps while their locks are held.
pub struct LockedSession<'a> {
    physical_edges: RwLockReadGuard<'a, PhysicalEdgeMap>,
    logical_edges: RwLockReadGuard<'a, LogicalEdgeMap>,
    logical_vertices: RwLockReadGuard<'a, LogicalMap>,
    hardware_vertices: RwLockReadGuard<'a, HardwareMap>,
}

impl LockedSession<'_> {
    pub fn hardware_vertices(&self) -> impl Iterator<Item = &Arc<HardwareVertex>> {
        self.hardware_vertices.values()
    }

    pub fn logical_vertices(&self) -> impl Iterator<Item = &Arc<LogicalVertex>> {
        self.logical_vertices.values()
    }

    pub fn physical_edges(&self) -> impl Iterator<Item = &Arc<PhysicalConnection>> {
        self.physical_edges.values()
    }

    pub fn logical_edges(&self) -> impl Iterator<Item = &Arc<LogicalConnection>> {
        self.logical_edges.values()
    }

    pub fn hardware_vertex(&self, address: &HardwareAddress) -> Option<&Arc<HardwareVertex>> {
        self.hardware_vertices.get(address)
    }

    pub fn logical_vertex(&self, mapping: &LogicalAddressMapping) -> Option<&Arc<LogicalVertex>> {
        self.logical_vertices.get(mapping)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Confidence, LogicalAddress, Property};
    use parking_lot::Mutex;

    fn mac(last: u8) -> HardwareAddress {
        HardwareAddress::mac([0x02, 0, 0, 0, 0, last])
    }

    fn mapping(last: u8) -> LogicalAddressMapping {
        LogicalAddressMapping::new(mac(last), LogicalAddress::ipv4(10, 0, 0, last))
    }

    #[test]
    fn test_hardware_vertex_is_deduplicated() {
        let session = Session::new();
        let created = Arc::new(Mutex::new(0));
        let c = Arc::clone(&created);
        session.on_hardware_vertex_created().subscribe(move |_| *c.lock() += 1);

        let a = session.hardware_vertex_for(&mac(1));
        let b = session.hardware_vertex_for(&mac(1));
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(*created.lock(), 1);
        assert_eq!(session.hardware_vertices().len(), 1);
    }

    #[test]
    fn test_logical_vertex_requires_hardware() {
        let session = Session::new();
        assert!(matches!(
            session.logical_vertex_for(&mapping(1)),
            Err(Error::PreconditionViolated(_))
        ));
        assert!(session.logical_vertex(&mapping(1)).is_none());
    }

    #[test]
    fn test_logical_vertex_inherits_hardware_properties() {
        let session = Session::new();
        let hw = session.hardware_vertex_for(&mac(1));
        hw.properties().add("oui", "vendor", [Property::new("Acme", Confidence::Unobserved)]).unwrap();

        let logical = session.logical_vertex_for(&mapping(1)).unwrap();
        assert_eq!(logical.properties().best("vendor").unwrap(), Some("Acme".into()));
        assert!(Arc::ptr_eq(logical.hardware_vertex(), &hw));
    }

    #[test]
    fn test_edges_require_known_vertices() {
        let session = Session::new();
        session.hardware_vertex_for(&mac(1));
        assert!(matches!(
            session.create_physical_edge(&mac(1), &mac(2)),
            Err(Error::PreconditionViolated(_))
        ));
        assert!(matches!(
            session.create_physical_edge(&mac(1), &mac(1)),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_owner_lookup() {
        let session = Session::new();
        let hw = session.hardware_vertex_for(&mac(3));
        assert_eq!(session.owner_of(hw.properties().id()), Some(PropertyOwner::Hardware(mac(3))));
        assert_eq!(session.owner_of(ContainerId(999)), None);
    }

    #[test]
    fn test_execute_with_lock_sees_all_maps() {
        let session = Session::new();
        session.hardware_vertex_for(&mac(1));
        session.hardware_vertex_for(&mac(2));
        session.logical_vertex_for(&mapping(1)).unwrap();
        session.logical_vertex_for(&mapping(2)).unwrap();
        session.create_logical_edge(&mapping(1), &mapping(2)).unwrap();

        let counts = session.execute_with_lock(|locked| {
            (
                locked.hardware_vertices().count(),
                locked.logical_vertices().count(),
                locked.logical_edges().count(),
                locked.physical_edges().count(),
            )
        });
        assert_eq!(counts, (2, 2, 1, 0));
    }

    #[test]
    fn test_import_tracking() {
        let session = Session::new();
        session.add_import(ImportItem::new("/tmp/a.pcap", "pcap", "Default"));
        assert!(session.mark_import_started(std::path::Path::new("/tmp/a.pcap")));
        assert!(!session.mark_import_started(std::path::Path::new("/tmp/a.pcap")));
        assert!(session.imports()[0].is_started());
    }
}
