//! Session document.
//!
//! ```text
//! <session>
//!   <Pipeline Instantiated="true"><template …/></Pipeline>
//!   <Imports><Item path="…" importer="…" entry="…" started="…"/></Imports>
//!   <Networks><Set Source="…"><Network cidr="10.0.0.0/8" confidence="1"/></Set></Networks>
//!   <HardwareVertices><HardwareVertex address="…"><Properties/></HardwareVertex></HardwareVertices>
//!   <LogicalVertices><LogicalVertex refHardwareVertex="0" address="…"><Properties/></LogicalVertex></LogicalVertices>
//!   <PhysicalEdges><PhysicalInterconnection Source="0" Destination="1"><Properties/></PhysicalInterconnection></PhysicalEdges>
//!   <LogicalEdges><LogicalEdge Source="0" Destination="1"><Properties/></LogicalEdge></LogicalEdges>
//! </session>
//! ```
//!
//! Vertices and edges refer to each other by position in the vertex lists
//! written just before them. `Properties` holds direct assertions only,
//! `Source[id]/Property[name]/Value[confidence]` with the value as JSON.
//! Inherited properties come back through the restored ancestry.

use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::info;

use crate::event::ExecutionProvider;
use crate::model::{Confidence, HardwareAddress, LogicalAddress, LogicalAddressMapping, Network, Property, Value};
use crate::pipeline::{PipelineTemplate, StageRegistry};
use crate::properties::PropertyHandle;
use crate::xml::{self, Element, XmlWriter};
use crate::{Error, Result};

use super::{ImportItem, Session};

// ============================================================================
// Writing
// ============================================================================

pub fn write_session<W: Write>(session: &Session, writer: W) -> Result<()> {
    let mut w = XmlWriter::new(writer);
    w.declaration()?;
    w.start("session", &[])?;

    match session.pipeline_template() {
        Some(template) => {
            w.start("Pipeline", &[("Instantiated", "true")])?;
            template.write_xml(&mut w)?;
            w.end("Pipeline")?;
        }
        None => w.empty("Pipeline", &[("Instantiated", "false")])?,
    }

    w.start("Imports", &[])?;
    for item in session.imports() {
        let path = item.path.display().to_string();
        let started = item.started.map(|t| t.to_rfc3339());
        let mut attributes = vec![
            ("path", path.as_str()),
            ("importer", item.importer.as_str()),
            ("entry", item.entry_point.as_str()),
        ];
        if let Some(started) = &started {
            attributes.push(("started", started.as_str()));
        }
        w.empty("Item", &attributes)?;
    }
    w.end("Imports")?;

    w.start("Networks", &[])?;
    for (source, networks) in session.networks().reported() {
        w.start("Set", &[("Source", source.as_str())])?;
        for network in networks {
            let cidr = network.address.to_string();
            let confidence = network.confidence.ordinal().to_string();
            w.empty("Network", &[("cidr", cidr.as_str()), ("confidence", confidence.as_str())])?;
        }
        w.end("Set")?;
    }
    w.end("Networks")?;

    let hardware = session.hardware_vertices();
    let hardware_index: HashMap<&HardwareAddress, usize> =
        hardware.iter().enumerate().map(|(i, v)| (v.address(), i)).collect();
    w.start("HardwareVertices", &[])?;
    for vertex in &hardware {
        let address = vertex.address().to_string();
        w.start("HardwareVertex", &[("address", address.as_str())])?;
        write_properties(&mut w, vertex.properties())?;
        w.end("HardwareVertex")?;
    }
    w.end("HardwareVertices")?;

    let logical = session.logical_vertices();
    let logical_index: HashMap<&LogicalAddressMapping, usize> =
        logical.iter().enumerate().map(|(i, v)| (v.mapping(), i)).collect();
    w.start("LogicalVertices", &[])?;
    for vertex in &logical {
        let owner = index_of(&hardware_index, &vertex.mapping().hardware)?.to_string();
        let address = vertex.mapping().logical.to_string();
        w.start("LogicalVertex", &[("refHardwareVertex", owner.as_str()), ("address", address.as_str())])?;
        write_properties(&mut w, vertex.properties())?;
        w.end("LogicalVertex")?;
    }
    w.end("LogicalVertices")?;

    w.start("PhysicalEdges", &[])?;
    for edge in session.physical_edges() {
        let source = index_of(&hardware_index, edge.source().address())?.to_string();
        let destination = index_of(&hardware_index, edge.destination().address())?.to_string();
        w.start(
            "PhysicalInterconnection",
            &[("Source", source.as_str()), ("Destination", destination.as_str())],
        )?;
        write_properties(&mut w, edge.properties())?;
        w.end("PhysicalInterconnection")?;
    }
    w.end("PhysicalEdges")?;

    w.start("LogicalEdges", &[])?;
    for edge in session.logical_edges() {
        let source = index_of(&logical_index, edge.source().mapping())?.to_string();
        let destination = index_of(&logical_index, edge.destination().mapping())?.to_string();
        w.start("LogicalEdge", &[("Source", source.as_str()), ("Destination", destination.as_str())])?;
        write_properties(&mut w, edge.properties())?;
        w.end("LogicalEdge")?;
    }
    w.end("LogicalEdges")?;

    w.end("session")?;
    w.into_inner().flush()?;
    Ok(())
}

pub fn session_to_string(session: &Session) -> Result<String> {
    let mut buffer = Vec::new();
    write_session(session, &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| Error::Serialization(e.to_string()))
}

fn index_of<K: std::hash::Hash + Eq + std::fmt::Display>(index: &HashMap<&K, usize>, key: &K) -> Result<usize> {
    index
        .get(key)
        .copied()
        .ok_or_else(|| Error::Serialization(format!("{key} changed while the session was being written")))
}

fn write_properties<W: Write>(w: &mut XmlWriter<W>, handle: &PropertyHandle) -> Result<()> {
    let provided = handle.store().provided(handle.id())?;
    if provided.is_empty() {
        return w.empty("Properties", &[]);
    }
    w.start("Properties", &[])?;
    for (source, by_name) in provided {
        w.start("Source", &[("id", source.as_str())])?;
        for (name, properties) in by_name {
            w.start("Property", &[("name", name.as_str())])?;
            for property in properties {
                let confidence = property.confidence().ordinal().to_string();
                let value = serde_json::to_string(property.value())?;
                w.text_element("Value", &[("confidence", confidence.as_str())], &value)?;
            }
            w.end("Property")?;
        }
        w.end("Source")?;
    }
    w.end("Properties")
}

// ============================================================================
// Reading
// ============================================================================

/// Load a document into a fresh session running on `provider`.
///
/// With a registry the stored pipeline template is validated against it.
pub fn read_session(
    text: &str,
    provider: Arc<dyn ExecutionProvider>,
    registry: Option<&StageRegistry>,
) -> Result<Session> {
    let session = Session::with_provider(provider);
    read_session_into(&session, text, registry)?;
    Ok(session)
}

/// Load a document into `session`, which observers may already watch.
///
/// Creation events fire as the graph is rebuilt. Containers this call
/// creates are filled silently and then announced once, as one `added` per
/// winning property. Containers that already existed take the document's
/// assertions as ordinary additions, so only real changes are announced.
pub fn read_session_into(session: &Session, text: &str, registry: Option<&StageRegistry>) -> Result<()> {
    let root = xml::parse(text)?;
    if root.name != "session" {
        return Err(Error::Serialization(format!("expected <session>, found <{}>", root.name)));
    }

    if let Some(template) = root.child("Pipeline").and_then(|p| p.child("template")) {
        let template = PipelineTemplate::from_element(template)?;
        session.set_pipeline_template(match registry {
            Some(registry) => template.validate(registry),
            None => template,
        });
    }

    for item in root.list("Imports", "Item") {
        let mut import = ImportItem::new(item.required("path")?, item.required("importer")?, item.required("entry")?);
        if let Some(started) = item.attr("started") {
            let started = DateTime::parse_from_rfc3339(started)
                .map_err(|e| Error::Serialization(format!("import start time '{started}': {e}")))?;
            import.started = Some(started.with_timezone(&Utc));
        }
        session.add_import(import);
    }

    for set in root.list("Networks", "Set") {
        let source = set.required("Source")?;
        for network in set.children_named("Network") {
            let address: LogicalAddress = network.parse_attr("cidr")?;
            let confidence: Confidence = network.parse_attr("confidence")?;
            session.add_network(source, Network::new(address, confidence));
        }
    }

    // Topology first, properties afterwards, so inherited values are not
    // announced once per restored ancestor link.
    let mut deferred: Vec<Deferred<'_>> = Vec::new();

    let mut hardware = Vec::new();
    for element in root.list("HardwareVertices", "HardwareVertex") {
        let address: HardwareAddress = element.parse_attr("address")?;
        let fresh = session.hardware_vertex(&address).is_none();
        let vertex = session.hardware_vertex_for(&address);
        defer(&mut deferred, vertex.properties(), element, fresh);
        hardware.push(vertex);
    }

    let mut logical = Vec::new();
    for element in root.list("LogicalVertices", "LogicalVertex") {
        let owner = at(&hardware, element.parse_attr("refHardwareVertex")?, "hardware vertex")?;
        let address: LogicalAddress = element.parse_attr("address")?;
        let mapping = LogicalAddressMapping::new(owner.address().clone(), address);
        let (vertex, fresh) = match session.logical_vertex(&mapping) {
            Some(existing) => (existing, false),
            None => (session.restore_logical_vertex(mapping, Arc::clone(owner))?, true),
        };
        defer(&mut deferred, vertex.properties(), element, fresh);
        logical.push(vertex);
    }

    for element in root.list("PhysicalEdges", "PhysicalInterconnection") {
        let source = at(&hardware, element.parse_attr("Source")?, "hardware vertex")?;
        let destination = at(&hardware, element.parse_attr("Destination")?, "hardware vertex")?;
        let (edge, fresh) = match session.existing_physical_edge(source.address(), destination.address()) {
            Some(existing) => (existing, false),
            None => (session.restore_physical_edge(Arc::clone(source), Arc::clone(destination))?, true),
        };
        defer(&mut deferred, edge.properties(), element, fresh);
    }

    for element in root.list("LogicalEdges", "LogicalEdge") {
        let source = at(&logical, element.parse_attr("Source")?, "logical vertex")?;
        let destination = at(&logical, element.parse_attr("Destination")?, "logical vertex")?;
        let (edge, fresh) = match session.existing_logical_edge(source.mapping(), destination.mapping()) {
            Some(existing) => (existing, false),
            None => (session.restore_logical_edge(Arc::clone(source), Arc::clone(destination))?, true),
        };
        defer(&mut deferred, edge.properties(), element, fresh);
    }

    // New containers only have descendants that are new as well, so they are
    // complete before anything is announced. Additions to existing
    // containers come last and cascade into the announced state as changes.
    let (fresh, existing): (Vec<_>, Vec<_>) = deferred.into_iter().partition(|d| d.fresh);
    for d in &fresh {
        if let Some(properties) = d.properties {
            read_properties(&d.handle, properties, false)?;
        }
    }
    for d in &fresh {
        d.handle.store().reannounce(d.handle.id())?;
    }
    for d in &existing {
        if let Some(properties) = d.properties {
            read_properties(&d.handle, properties, true)?;
        }
    }

    info!(
        hardware = hardware.len(),
        logical = logical.len(),
        imports = session.imports().len(),
        "session loaded"
    );
    Ok(())
}

struct Deferred<'a> {
    handle: PropertyHandle,
    properties: Option<&'a Element>,
    fresh: bool,
}

fn defer<'a>(deferred: &mut Vec<Deferred<'a>>, handle: &PropertyHandle, element: &'a Element, fresh: bool) {
    let properties = element.child("Properties");
    if fresh || properties.is_some() {
        deferred.push(Deferred { handle: handle.clone(), properties, fresh });
    }
}

fn at<'a, T>(items: &'a [Arc<T>], index: usize, what: &str) -> Result<&'a Arc<T>> {
    items
        .get(index)
        .ok_or_else(|| Error::Serialization(format!("reference to {what} {index}, only {} present", items.len())))
}

fn read_properties(handle: &PropertyHandle, properties: &Element, announce: bool) -> Result<()> {
    for source in properties.children_named("Source") {
        let id = source.required("id")?;
        for property in source.children_named("Property") {
            let name = property.required("name")?;
            let values = property
                .children_named("Value")
                .map(|value| {
                    let confidence: Confidence = value.parse_attr("confidence")?;
                    let parsed: Value = serde_json::from_str(&value.text)?;
                    Ok(Property::new(parsed, confidence))
                })
                .collect::<Result<Vec<Property>>>()?;
            if announce {
                handle.add(id, name, values)?;
            } else {
                handle.store().restore_properties(handle.id(), id, name, values)?;
            }
        }
    }
    Ok(())
}
