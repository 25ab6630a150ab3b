//! Stages shipped with the crate.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::trace;

use crate::model::{
    Confidence, HardwareAddress, HardwareAddressPair, LogicalAddressMapping, LogicalAddressPair, Network,
    Property,
};
use crate::properties::PropertyHandle;
use crate::session::Session;
use crate::Result;

use super::record::{Emit, Record, RecordType};
use super::registry::{StageBuildContext, StageDescriptor, StageKey, StageRegistry};
use super::stage::{DEFAULT_OUTPUT, StageContext, StageLogic, StageSpec};

pub const BUILTIN_PLUGIN: &str = "netgraph";
pub const BUILD_GRAPH: &str = "BuildGraph";
pub const APPLY_PROPERTIES: &str = "ApplyProperties";

pub const OUTPUT_HARDWARE_ADDRESSES: &str = "Hardware Addresses";
pub const OUTPUT_ADDRESS_MAPPINGS: &str = "Address Mappings";
pub const OUTPUT_ADDRESS_PAIRS: &str = "Address Pairs";

pub(crate) fn register_builtins(registry: &mut StageRegistry) {
    registry.register(StageDescriptor {
        key: StageKey::new(BUILTIN_PLUGIN, BUILD_GRAPH),
        display_name: BuildGraph::NAME.to_owned(),
        outputs: BuildGraph::spec_for().output_names(),
        configurable: false,
        default_config: serde_json::Value::Null,
        factory: Arc::new(|ctx: &StageBuildContext<'_>| -> Result<Box<dyn StageLogic>> {
            Ok(Box::new(BuildGraph::new(Arc::clone(ctx.session))))
        }),
    });
    registry.register(StageDescriptor {
        key: StageKey::new(BUILTIN_PLUGIN, APPLY_PROPERTIES),
        display_name: ApplyProperties::NAME.to_owned(),
        outputs: ApplyProperties::spec_for().output_names(),
        configurable: true,
        default_config: json!({ "minimum_confidence": null, "source_override": null }),
        factory: Arc::new(|ctx: &StageBuildContext<'_>| -> Result<Box<dyn StageLogic>> {
            let config: ApplyPropertiesConfig = ctx.parse_config()?;
            Ok(Box::new(ApplyProperties::new(Arc::clone(ctx.session), config)))
        }),
    });
}

// ============================================================================
// BuildGraph
// ============================================================================

/// Materializes vertices, edges and networks from address records.
///
/// Every record is returned unchanged. Raw addresses and mappings are kept
/// off `Default` and go to their own side outputs instead.
pub struct BuildGraph {
    session: Arc<Session>,
}

impl BuildGraph {
    pub const NAME: &'static str = "Create Basic Graph Elements";

    pub fn new(session: Arc<Session>) -> Self {
        Self { session }
    }

    fn spec_for() -> StageSpec {
        StageSpec::new()
            .accepts(RecordType::any())
            .output(OUTPUT_HARDWARE_ADDRESSES, [RecordType::of::<HardwareAddress>()])
            .output(OUTPUT_ADDRESS_MAPPINGS, [RecordType::of::<LogicalAddressMapping>()])
            .output(
                OUTPUT_ADDRESS_PAIRS,
                [RecordType::of::<HardwareAddressPair>(), RecordType::of::<LogicalAddressPair>()],
            )
            .deny(
                DEFAULT_OUTPUT,
                [
                    RecordType::of::<HardwareAddress>(),
                    RecordType::of::<LogicalAddressMapping>(),
                    RecordType::of::<HardwareAddressPair>(),
                    RecordType::of::<LogicalAddressPair>(),
                ],
            )
    }

    fn logical_vertex(&self, mapping: &LogicalAddressMapping) -> Result<()> {
        self.session.hardware_vertex_for(&mapping.hardware);
        self.session.logical_vertex_for(mapping)?;
        Ok(())
    }
}

impl StageLogic for BuildGraph {
    fn spec(&self) -> StageSpec {
        Self::spec_for()
    }

    fn process(&mut self, record: Record, _ctx: &StageContext<'_>) -> Result<Emit> {
        if let Some(address) = record.downcast_ref::<HardwareAddress>() {
            self.session.hardware_vertex_for(address);
        } else if let Some(mapping) = record.downcast_ref::<LogicalAddressMapping>() {
            self.logical_vertex(mapping)?;
        } else if let Some(pair) = record.downcast_ref::<HardwareAddressPair>() {
            self.session.hardware_vertex_for(pair.source());
            self.session.hardware_vertex_for(pair.destination());
            self.session.create_physical_edge(pair.source(), pair.destination())?;
        } else if let Some(pair) = record.downcast_ref::<LogicalAddressPair>() {
            self.logical_vertex(pair.source())?;
            self.logical_vertex(pair.destination())?;
            self.session.create_logical_edge(pair.source(), pair.destination())?;
        } else if let Some(network) = record.downcast_ref::<Network>() {
            self.session.add_network(Self::NAME, *network);
        } else {
            trace!("record passed through graph builder untouched");
        }
        Ok(Emit::Record(record))
    }
}

// ============================================================================
// ApplyProperties
// ============================================================================

/// The graph element a [`PropertyAssertion`] is about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssertionTarget {
    Hardware(HardwareAddress),
    Logical(LogicalAddressMapping),
    PhysicalEdge(HardwareAddressPair),
    LogicalEdge(LogicalAddressPair),
}

/// Properties one source asserts about one graph element.
#[derive(Debug, Clone)]
pub struct PropertyAssertion {
    pub target: AssertionTarget,
    pub source: String,
    pub name: String,
    pub properties: Vec<Property>,
}

impl PropertyAssertion {
    pub fn new(
        target: AssertionTarget,
        source: impl Into<String>,
        name: impl Into<String>,
        properties: impl IntoIterator<Item = Property>,
    ) -> Self {
        Self {
            target,
            source: source.into(),
            name: name.into(),
            properties: properties.into_iter().collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplyPropertiesConfig {
    /// Properties worse than this are dropped.
    pub minimum_confidence: Option<Confidence>,
    /// Replaces the source name of every assertion.
    pub source_override: Option<String>,
}

/// Applies [`PropertyAssertion`] records to the session, creating the
/// target vertex or edge when it does not exist yet.
pub struct ApplyProperties {
    session: Arc<Session>,
    config: ApplyPropertiesConfig,
}

impl ApplyProperties {
    pub const NAME: &'static str = "Assign Properties";

    pub fn new(session: Arc<Session>, config: ApplyPropertiesConfig) -> Self {
        Self { session, config }
    }

    fn spec_for() -> StageSpec {
        StageSpec::new().accepts_type::<PropertyAssertion>()
    }

    fn target(&self, target: &AssertionTarget) -> Result<PropertyHandle> {
        let session = &self.session;
        let handle = match target {
            AssertionTarget::Hardware(address) => session.hardware_vertex_for(address).properties().clone(),
            AssertionTarget::Logical(mapping) => {
                session.hardware_vertex_for(&mapping.hardware);
                session.logical_vertex_for(mapping)?.properties().clone()
            }
            AssertionTarget::PhysicalEdge(pair) => {
                session.hardware_vertex_for(pair.source());
                session.hardware_vertex_for(pair.destination());
                session.create_physical_edge(pair.source(), pair.destination())?.properties().clone()
            }
            AssertionTarget::LogicalEdge(pair) => {
                for mapping in [pair.source(), pair.destination()] {
                    session.hardware_vertex_for(&mapping.hardware);
                    session.logical_vertex_for(mapping)?;
                }
                session.create_logical_edge(pair.source(), pair.destination())?.properties().clone()
            }
        };
        Ok(handle)
    }
}

impl StageLogic for ApplyProperties {
    fn spec(&self) -> StageSpec {
        Self::spec_for()
    }

    fn process(&mut self, record: Record, _ctx: &StageContext<'_>) -> Result<Emit> {
        let Some(assertion) = record.downcast_ref::<PropertyAssertion>() else {
            return Ok(Emit::Record(record));
        };
        let properties: Vec<Property> = assertion
            .properties
            .iter()
            .filter(|p| {
                self.config
                    .minimum_confidence
                    .is_none_or(|minimum| p.confidence() <= minimum)
            })
            .cloned()
            .collect();
        if properties.is_empty() {
            trace!(name = %assertion.name, "every property below minimum confidence");
            return Ok(Emit::Nothing);
        }

        let source = self.config.source_override.as_deref().unwrap_or(&assertion.source);
        self.target(&assertion.target)?.add(source, &assertion.name, properties)?;
        Ok(Emit::Record(record))
    }
}
