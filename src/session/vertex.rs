//! Graph elements: vertices, connections and the owner tag of a container.

use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use crate::model::{
    AddressPair, HardwareAddress, HardwareAddressPair, LogicalAddressMapping, LogicalAddressPair,
};
use crate::properties::PropertyHandle;
use crate::Result;

/// Something that can sit at either end of a connection.
pub trait Endpoint: Send + Sync {
    type Key: Ord + Hash + Clone + fmt::Display + fmt::Debug + Send + Sync;

    fn key(&self) -> &Self::Key;
    fn properties(&self) -> &PropertyHandle;
}

// ============================================================================
// Vertices
// ============================================================================

/// One link-layer address and everything known about it.
pub struct HardwareVertex {
    address: HardwareAddress,
    properties: PropertyHandle,
}

impl HardwareVertex {
    pub(crate) fn new(address: HardwareAddress, properties: PropertyHandle) -> Self {
        Self { address, properties }
    }

    pub fn address(&self) -> &HardwareAddress {
        &self.address
    }

    pub fn properties(&self) -> &PropertyHandle {
        &self.properties
    }
}

impl Endpoint for HardwareVertex {
    type Key = HardwareAddress;

    fn key(&self) -> &HardwareAddress {
        &self.address
    }

    fn properties(&self) -> &PropertyHandle {
        &self.properties
    }
}

/// A logical address bound to a hardware vertex.
///
/// Inherits every property of its hardware vertex.
pub struct LogicalVertex {
    mapping: LogicalAddressMapping,
    hardware: Arc<HardwareVertex>,
    properties: PropertyHandle,
}

impl LogicalVertex {
    pub(crate) fn new(
        mapping: LogicalAddressMapping,
        hardware: Arc<HardwareVertex>,
        properties: PropertyHandle,
    ) -> Self {
        Self { mapping, hardware, properties }
    }

    pub fn mapping(&self) -> &LogicalAddressMapping {
        &self.mapping
    }

    pub fn hardware_vertex(&self) -> &Arc<HardwareVertex> {
        &self.hardware
    }

    pub fn properties(&self) -> &PropertyHandle {
        &self.properties
    }
}

impl Endpoint for LogicalVertex {
    type Key = LogicalAddressMapping;

    fn key(&self) -> &LogicalAddressMapping {
        &self.mapping
    }

    fn properties(&self) -> &PropertyHandle {
        &self.properties
    }
}

// ============================================================================
// Connections
// ============================================================================

/// Undirected connection; endpoints are stored in canonical order.
pub struct Connection<V: Endpoint> {
    key: AddressPair<V::Key>,
    source: Arc<V>,
    destination: Arc<V>,
    properties: PropertyHandle,
}

pub type PhysicalConnection = Connection<HardwareVertex>;
pub type LogicalConnection = Connection<LogicalVertex>;

impl<V: Endpoint> Connection<V> {
    /// Fails when both endpoints have the same key.
    pub(crate) fn new(a: Arc<V>, b: Arc<V>, properties: PropertyHandle) -> Result<Self> {
        let key = AddressPair::new(a.key().clone(), b.key().clone())?;
        let (source, destination) = if key.source() == a.key() { (a, b) } else { (b, a) };
        Ok(Self { key, source, destination, properties })
    }

    pub fn key(&self) -> &AddressPair<V::Key> {
        &self.key
    }

    pub fn source(&self) -> &Arc<V> {
        &self.source
    }

    pub fn destination(&self) -> &Arc<V> {
        &self.destination
    }

    pub fn properties(&self) -> &PropertyHandle {
        &self.properties
    }
}

impl<V: Endpoint> fmt::Debug for Connection<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("source", self.source.key())
            .field("destination", self.destination.key())
            .field("properties", &self.properties.id())
            .finish()
    }
}

impl fmt::Debug for HardwareVertex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HardwareVertex")
            .field("address", &self.address.to_string())
            .field("properties", &self.properties.id())
            .finish()
    }
}

impl fmt::Debug for LogicalVertex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogicalVertex")
            .field("mapping", &self.mapping.to_string())
            .field("properties", &self.properties.id())
            .finish()
    }
}

// ============================================================================
// Owner tag
// ============================================================================

/// Which graph element a property container belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PropertyOwner {
    Hardware(HardwareAddress),
    Logical(LogicalAddressMapping),
    PhysicalEdge(HardwareAddressPair),
    LogicalEdge(LogicalAddressPair),
}
