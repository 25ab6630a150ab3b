//! # netgraph: confidence-aware network property graph
//!
//! Builds a graph of hardware and logical network addresses from streams
//! of observations, and reconciles what every source claims about each
//! vertex and edge into one winning set per property.
//!
//! ## Design Principles
//!
//! 1. **Lower confidence ordinal wins**: `Asserted` (0) beats `Unobserved` (5)
//! 2. **Arena, not object graph**: property containers are addressed by
//!    [`ContainerId`]; ancestry is a pair of id sets
//! 3. **Events after unlock**: observers never run under a store or map lock
//! 4. **Explicit registry**: stage kinds are looked up in a
//!    [`StageRegistry`] value, never a global
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use netgraph::{Confidence, HardwareAddress, Property, Session};
//!
//! # fn example() -> netgraph::Result<()> {
//! let session = Session::new();
//! let vertex = session.hardware_vertex_for(&HardwareAddress::mac([2, 0, 0, 0, 0, 1]));
//!
//! vertex.properties().add("pcap", "vendor", [Property::new("Acme", Confidence::Reported)])?;
//! vertex.properties().add("user", "vendor", [Property::new("Acme", Confidence::Asserted)])?;
//!
//! assert_eq!(vertex.properties().best("vendor")?.unwrap().as_str(), Some("Acme"));
//! # Ok(())
//! # }
//! ```
//!
//! ## Layers
//!
//! | Module | Role |
//! |--------|------|
//! | [`model`] | Addresses, confidences, values, properties |
//! | [`properties`] | Reconciliation engine |
//! | [`session`] | Vertex/edge identity maps, networks, session document |
//! | [`pipeline`] | Threaded stage graph fed by fair import aggregators |
//! | [`event`] | Execution providers and observer lists |

// ============================================================================
// Modules
// ============================================================================

pub mod config;
pub mod event;
pub mod model;
pub mod pipeline;
pub mod properties;
pub mod session;
mod xml;

// ============================================================================
// Re-exports: Model
// ============================================================================

pub use model::{
    AddressPair, Confidence, HardwareAddress, HardwareAddressPair, LogicalAddress,
    LogicalAddressMapping, LogicalAddressPair, Network, Property, Value,
};

// ============================================================================
// Re-exports: Reconciliation
// ============================================================================

pub use properties::{
    ContainerId, MaskingPolicy, PropertyEvent, PropertyHandle, PropertyStore,
};

// ============================================================================
// Re-exports: Session
// ============================================================================

pub use session::{
    Connection, HardwareVertex, ImportItem, LogicalConnection, LogicalVertex, NetworkList,
    PhysicalConnection, PropertyOwner, Session,
};

// ============================================================================
// Re-exports: Pipeline
// ============================================================================

pub use config::RuntimeConfig;
pub use event::{Event, ExecutionProvider, HandlerId, InThread, ThreadQueue};
pub use pipeline::{
    BufferedAggregator, Pipeline, PipelineTemplate, Stage, StageLogic, StageRegistry, StageSpec,
};

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Precondition violated: {0}")]
    PreconditionViolated(String),

    #[error("Unknown property container: {0}")]
    UnknownContainer(ContainerId),

    #[error("Template error: {0}")]
    Template(String),

    #[error("Unknown entry point: {0}")]
    UnknownEntryPoint(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Stage error: {0}")]
    Stage(String),

    #[error("XML error: {0}")]
    Xml(#[from] quick_xml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Hex error: {0}")]
    Hex(#[from] hex::FromHexError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
