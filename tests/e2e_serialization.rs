//! End-to-end tests for the session and template documents.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use serde_json::json;

use netgraph::event::in_thread;
use netgraph::session::xml::{read_session, read_session_into, session_to_string};
use netgraph::{
    Confidence, Error, HardwareAddress, ImportItem, LogicalAddress, LogicalAddressMapping, Network,
    PipelineTemplate, Property, Session, StageRegistry, Value,
};

// ============================================================================
// Helpers
// ============================================================================

fn mac(last: u8) -> HardwareAddress {
    HardwareAddress::mac([0x02, 0, 0, 0, 0, last])
}

fn mapping(last: u8) -> LogicalAddressMapping {
    LogicalAddressMapping::new(mac(last), LogicalAddress::ipv4(10, 0, 0, last))
}

fn p(value: impl Into<Value>, confidence: Confidence) -> Property {
    Property::new(value, confidence)
}

/// Two hosts, their link, one address each, plus imports and networks.
fn populated() -> Session {
    let session = Session::new();
    let router = session.hardware_vertex_for(&mac(1));
    session.hardware_vertex_for(&mac(2));
    router.properties().add("snmp", "vendor", [p("Acme", Confidence::Reported)]).unwrap();
    router.properties().add("user", "role", [p("gateway", Confidence::Asserted)]).unwrap();

    let logical = session.logical_vertex_for(&mapping(1)).unwrap();
    logical.properties().add("dns", "hostname", [p("gw.example", Confidence::Inferred)]).unwrap();
    session.logical_vertex_for(&mapping(2)).unwrap();

    let link = session.create_physical_edge(&mac(2), &mac(1)).unwrap();
    link.properties()
        .add("lldp", "port", [p(24, Confidence::SelfReported), p(48, Confidence::Observed)])
        .unwrap();
    session.create_logical_edge(&mapping(1), &mapping(2)).unwrap();

    session.add_network("user", Network::new("10.0.0.0/8".parse().unwrap(), Confidence::Asserted));
    session.add_network("pcap", Network::new("192.168.0.0/24".parse().unwrap(), Confidence::Observed));

    session.add_import(ImportItem::new("/captures/monday.pcap", "pcap", "Default"));
    session.add_import(ImportItem::new("/captures/tuesday.pcap", "pcap", "Default"));
    session.mark_import_started(std::path::Path::new("/captures/monday.pcap"));

    let mut template = PipelineTemplate::default_template();
    template
        .set_configuration("Assign Properties", json!({ "minimum_confidence": "Inferred", "source_override": null }))
        .unwrap();
    session.set_pipeline_template(template);
    session
}

// ============================================================================
// 1. Session round trip
// ============================================================================

#[test]
fn test_session_round_trip() {
    let original = populated();
    let text = session_to_string(&original).unwrap();
    let registry = StageRegistry::with_builtins();
    let restored = read_session(&text, in_thread(), Some(&registry)).unwrap();

    let addresses = |s: &Session| -> Vec<HardwareAddress> {
        s.hardware_vertices().iter().map(|v| v.address().clone()).collect()
    };
    assert_eq!(addresses(&restored), addresses(&original));
    assert_eq!(restored.logical_vertices().len(), 2);
    assert_eq!(restored.physical_edges().len(), 1);
    assert_eq!(restored.logical_edges().len(), 1);

    let router = restored.hardware_vertex(&mac(1)).unwrap();
    assert_eq!(router.properties().all().unwrap(), original.hardware_vertex(&mac(1)).unwrap().properties().all().unwrap());

    // Inherited values come back through ancestry, not as local assertions.
    let logical = restored.logical_vertex(&mapping(1)).unwrap();
    assert_eq!(logical.properties().get("vendor").unwrap(), vec![p("Acme", Confidence::Reported)]);
    assert!(logical.properties().for_source("snmp").unwrap().is_empty());
    assert_eq!(logical.properties().get("hostname").unwrap(), vec![p("gw.example", Confidence::Inferred)]);

    let link = restored.existing_physical_edge(&mac(1), &mac(2)).unwrap();
    assert_eq!(
        link.properties().get("port").unwrap(),
        vec![p(24, Confidence::SelfReported), p(48, Confidence::Observed)]
    );

    assert_eq!(restored.networks().reported(), original.networks().reported());
    assert_eq!(restored.networks().networks(), original.networks().networks());

    let imports = restored.imports();
    assert_eq!(imports.len(), 2);
    assert_eq!(imports[0].path, std::path::PathBuf::from("/captures/monday.pcap"));
    assert!(imports[0].is_started());
    assert!(!imports[1].is_started());

    assert_eq!(restored.pipeline_template(), original.pipeline_template());
}

#[test]
fn test_written_document_is_stable() {
    let first = session_to_string(&populated()).unwrap();
    let reloaded = read_session(&first, in_thread(), None).unwrap();
    assert_eq!(session_to_string(&reloaded).unwrap(), first);
}

#[test]
fn test_empty_session() {
    let text = session_to_string(&Session::new()).unwrap();
    assert!(text.contains("Instantiated=\"false\""));
    let restored = read_session(&text, in_thread(), None).unwrap();
    assert!(restored.hardware_vertices().is_empty());
    assert!(restored.pipeline_template().is_none());
}

// ============================================================================
// 2. Events while loading
// ============================================================================

#[test]
fn test_load_announces_each_winner_once() {
    let text = session_to_string(&populated()).unwrap();
    let session = Session::new();
    let property_events = Arc::new(AtomicUsize::new(0));
    let created = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&property_events);
    session.on_property_changed().subscribe(move |e| {
        assert!(e.added);
        counter.fetch_add(1, Ordering::SeqCst);
    });
    let counter = Arc::clone(&created);
    session.on_logical_vertex_created().subscribe(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    read_session_into(&session, &text, None).unwrap();

    let mut winners = 0;
    for vertex in session.hardware_vertices() {
        winners += vertex.properties().all().unwrap().values().map(Vec::len).sum::<usize>();
    }
    for vertex in session.logical_vertices() {
        winners += vertex.properties().all().unwrap().values().map(Vec::len).sum::<usize>();
    }
    for edge in session.physical_edges() {
        winners += edge.properties().all().unwrap().values().map(Vec::len).sum::<usize>();
    }
    // router: vendor, role; first logical: vendor, role, hostname;
    // second logical: nothing; link: two ports.
    assert_eq!(winners, 7);
    assert_eq!(property_events.load(Ordering::SeqCst), winners);
    assert_eq!(created.load(Ordering::SeqCst), 2);
}

#[test]
fn test_load_into_populated_session_announces_only_changes() {
    let text = session_to_string(&populated()).unwrap();
    let session = Session::new();
    let router = session.hardware_vertex_for(&mac(1));
    router.properties().add("snmp", "vendor", [p("Acme", Confidence::Reported)]).unwrap();

    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    session.on_property_changed().subscribe(move |e| {
        assert!(e.added);
        sink.lock().push((e.container, e.name.clone(), e.property.value().clone()));
    });

    read_session_into(&session, &text, None).unwrap();

    let events = events.lock().clone();
    let mut unique = events.clone();
    unique.sort();
    unique.dedup();
    assert_eq!(unique.len(), events.len(), "duplicate announcements: {events:?}");
    // The router already held its vendor; everything else is new:
    // router role, first logical vendor, role and hostname, two ports.
    assert_eq!(events.len(), 6);
    let router_id = router.properties().id();
    assert!(!events.iter().any(|(id, name, _)| *id == router_id && name == "vendor"));
    assert!(events.contains(&(router_id, "role".to_owned(), Value::from("gateway"))));

    let logical = session.logical_vertex(&mapping(1)).unwrap();
    assert_eq!(logical.properties().get("role").unwrap(), vec![p("gateway", Confidence::Asserted)]);
}

// ============================================================================
// 3. Templates
// ============================================================================

#[test]
fn test_template_document_keeps_configuration() {
    let mut template = PipelineTemplate::default_template();
    template
        .set_configuration("Assign Properties", json!({ "minimum_confidence": "Reported" }))
        .unwrap();
    let text = template.save().unwrap();

    let loaded = PipelineTemplate::load(&text, Some(&StageRegistry::with_builtins())).unwrap();
    assert_eq!(loaded, template);
    assert_eq!(
        loaded.configuration_for("Assign Properties"),
        Some(&json!({ "minimum_confidence": "Reported" }))
    );
}

#[test]
fn test_template_load_drops_what_the_registry_lacks() {
    let text = PipelineTemplate::default_template().save().unwrap();
    let loaded = PipelineTemplate::load(&text, Some(&StageRegistry::new())).unwrap();
    assert!(loaded.stages.is_empty());
    assert!(loaded.connections.is_empty());
    assert!(loaded.entry_points.is_empty());
}

// ============================================================================
// 4. Malformed documents
// ============================================================================

#[test]
fn test_rejects_wrong_root() {
    let err = read_session("<project/>", in_thread(), None).unwrap_err();
    assert!(matches!(err, Error::Serialization(_)));
}

#[test]
fn test_rejects_unparseable_xml() {
    assert!(read_session("<session><Imports></session>", in_thread(), None).is_err());
}

#[test]
fn test_rejects_dangling_vertex_reference() {
    let text = r#"<session>
        <HardwareVertices><HardwareVertex address="02:00:00:00:00:01"/></HardwareVertices>
        <PhysicalEdges><PhysicalInterconnection Source="0" Destination="3"/></PhysicalEdges>
    </session>"#;
    let err = read_session(text, in_thread(), None).unwrap_err();
    assert!(matches!(err, Error::Serialization(_)));
}

#[test]
fn test_rejects_bad_confidence() {
    let text = r#"<session>
        <HardwareVertices>
            <HardwareVertex address="02:00:00:00:00:01">
                <Properties><Source id="x"><Property name="os">
                    <Value confidence="9">{"type":"String","value":"linux"}</Value>
                </Property></Source></Properties>
            </HardwareVertex>
        </HardwareVertices>
    </session>"#;
    let err = read_session(text, in_thread(), None).unwrap_err();
    assert!(matches!(err, Error::Serialization(_)));
}
