//! End-to-end tests for property reconciliation through the session API.
//!
//! Covers masking, reference counting, ancestor propagation, unmasking on
//! removal and the best-value rule, observed through `on_property_changed`.

use std::sync::Arc;

use parking_lot::Mutex;
use pretty_assertions::assert_eq;

use netgraph::{
    Confidence, HardwareAddress, LogicalAddress, LogicalAddressMapping, Property, PropertyEvent,
    Session, Value,
};

// ============================================================================
// Helpers
// ============================================================================

fn mac(last: u8) -> HardwareAddress {
    HardwareAddress::mac([0x02, 0, 0, 0, 0, last])
}

fn p(value: &str, confidence: Confidence) -> Property {
    Property::new(value, confidence)
}

fn recording(session: &Session) -> Arc<Mutex<Vec<PropertyEvent>>> {
    let log = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&log);
    session.on_property_changed().subscribe(move |e| sink.lock().push(e.clone()));
    log
}

fn changes(log: &Mutex<Vec<PropertyEvent>>) -> Vec<(String, Value, Confidence, bool)> {
    log.lock()
        .iter()
        .map(|e| (e.name.clone(), e.property.value().clone(), e.property.confidence(), e.added))
        .collect()
}

// ============================================================================
// 1. Worked example: pcap, geoip, user
// ============================================================================

#[test]
fn test_vendor_example() {
    let session = Session::new();
    let log = recording(&session);
    let vertex = session.hardware_vertex_for(&mac(1));
    let props = vertex.properties();

    props.add("pcap", "vendor", [p("Acme", Confidence::Reported)]).unwrap();
    props.add("geoip", "vendor", [p("Acme", Confidence::Inferred)]).unwrap();
    assert_eq!(props.get("vendor").unwrap(), vec![p("Acme", Confidence::Reported)]);

    log.lock().clear();
    props.add("user", "vendor", [p("Acme", Confidence::Asserted)]).unwrap();
    assert_eq!(
        changes(&log),
        vec![
            ("vendor".into(), Value::from("Acme"), Confidence::Reported, false),
            ("vendor".into(), Value::from("Acme"), Confidence::Asserted, true),
        ]
    );
    assert_eq!(props.best("vendor").unwrap(), Some(Value::from("Acme")));
}

// ============================================================================
// 2. Reference counting across sources
// ============================================================================

#[test]
fn test_two_sources_same_assertion() {
    let session = Session::new();
    let log = recording(&session);
    let props = session.hardware_vertex_for(&mac(2)).properties().clone();

    props.add("a", "os", [p("linux", Confidence::Observed)]).unwrap();
    props.add("b", "os", [p("linux", Confidence::Observed)]).unwrap();
    let line = props.get("os").unwrap();
    assert_eq!(line.len(), 1);
    assert_eq!(line[0].references(), 2);

    props.remove("a", "os", [p("linux", Confidence::Observed)]).unwrap();
    assert_eq!(props.get("os").unwrap().len(), 1);

    log.lock().clear();
    props.remove("b", "os", [p("linux", Confidence::Observed)]).unwrap();
    assert!(props.get("os").unwrap().is_empty());
    assert_eq!(changes(&log), vec![("os".into(), Value::from("linux"), Confidence::Observed, false)]);
}

// ============================================================================
// 3. Logical vertices inherit from their hardware vertex
// ============================================================================

#[test]
fn test_logical_vertex_inherits_and_detaches() {
    let session = Session::new();
    let hardware = session.hardware_vertex_for(&mac(3));
    hardware.properties().add("pcap", "vendor", [p("Acme", Confidence::Reported)]).unwrap();

    let mapping = LogicalAddressMapping::new(mac(3), LogicalAddress::ipv4(10, 0, 0, 3));
    let logical = session.logical_vertex_for(&mapping).unwrap();
    assert_eq!(logical.properties().get("vendor").unwrap(), vec![p("Acme", Confidence::Reported)]);
    // Nothing was asserted on the logical vertex itself.
    assert!(logical.properties().for_source("pcap").unwrap().is_empty());

    // Later hardware changes flow down too.
    hardware.properties().add("user", "role", [p("gateway", Confidence::Asserted)]).unwrap();
    assert!(logical.properties().has(&["vendor", "role"]).unwrap());

    let store = session.store();
    assert!(store.remove_ancestor(logical.properties().id(), hardware.properties().id()).unwrap());
    assert!(logical.properties().all().unwrap().values().all(Vec::is_empty));
}

#[test]
fn test_inherited_and_local_assertions_share_a_line() {
    let session = Session::new();
    let hardware = session.hardware_vertex_for(&mac(4));
    let mapping = LogicalAddressMapping::new(mac(4), LogicalAddress::ipv4(10, 0, 0, 4));
    let logical = session.logical_vertex_for(&mapping).unwrap();

    logical.properties().add("dns", "name", [p("router", Confidence::Inferred)]).unwrap();
    hardware.properties().add("user", "name", [p("core-router", Confidence::Asserted)]).unwrap();
    // Vertices mask by name: the better inherited value hides the local one.
    assert_eq!(logical.properties().get("name").unwrap(), vec![p("core-router", Confidence::Asserted)]);

    hardware.properties().remove("user", "name", [p("core-router", Confidence::Asserted)]).unwrap();
    assert_eq!(logical.properties().get("name").unwrap(), vec![p("router", Confidence::Inferred)]);
}

// ============================================================================
// 4. Unmasking after the winner is retracted
// ============================================================================

#[test]
fn test_lower_confidence_reappears() {
    let session = Session::new();
    let log = recording(&session);
    let props = session.hardware_vertex_for(&mac(5)).properties().clone();

    props.add("user", "vendor", [p("Acme", Confidence::Asserted)]).unwrap();
    props.add("pcap", "vendor", [p("Acme", Confidence::Observed)]).unwrap();
    log.lock().clear();

    props.remove("user", "vendor", [p("Acme", Confidence::Asserted)]).unwrap();
    assert_eq!(props.get("vendor").unwrap(), vec![p("Acme", Confidence::Observed)]);
    assert_eq!(
        changes(&log),
        vec![
            ("vendor".into(), Value::from("Acme"), Confidence::Asserted, false),
            ("vendor".into(), Value::from("Acme"), Confidence::Observed, true),
        ]
    );
}

#[test]
fn test_edges_keep_distinct_values() {
    let session = Session::new();
    session.hardware_vertex_for(&mac(6));
    session.hardware_vertex_for(&mac(7));
    let edge = session.create_physical_edge(&mac(6), &mac(7)).unwrap();
    let props = edge.properties();

    props.add("snmp", "vlan", [p("10", Confidence::Reported)]).unwrap();
    props.add("pcap", "vlan", [p("20", Confidence::Observed)]).unwrap();
    assert_eq!(
        props.get("vlan").unwrap(),
        vec![p("10", Confidence::Reported), p("20", Confidence::Observed)]
    );
    // Best picks the lowest ordinal, not the smallest value.
    assert_eq!(props.best("vlan").unwrap(), Some(Value::from("10")));
}

// ============================================================================
// 5. Best value direction and ties
// ============================================================================

#[test]
fn test_best_value_prefers_lowest_ordinal_then_smallest_value() {
    let session = Session::new();
    for last in 8..=13 {
        session.hardware_vertex_for(&mac(last));
    }

    let edge = session.create_physical_edge(&mac(8), &mac(9)).unwrap();
    edge.properties()
        .add("x", "speed", [p("fast", Confidence::Observed), p("slow", Confidence::SelfReported)])
        .unwrap();
    assert_eq!(edge.properties().best("speed").unwrap(), Some(Value::from("slow")));

    let tie = session.create_physical_edge(&mac(10), &mac(11)).unwrap();
    tie.properties()
        .add("x", "speed", [p("zeta", Confidence::Reported), p("alpha", Confidence::Reported)])
        .unwrap();
    assert_eq!(tie.properties().best("speed").unwrap(), Some(Value::from("alpha")));

    let empty = session.create_physical_edge(&mac(12), &mac(13)).unwrap();
    assert_eq!(empty.properties().best("speed").unwrap(), None);
}
