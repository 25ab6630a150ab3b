//! End-to-end tests for pipeline construction and record flow.
//!
//! Uses a small registry of test stages alongside the built-in ones to
//! cover fan-out, fair import scheduling, backpressure, drift tolerance
//! and the graph-building stages against a live session.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, unbounded};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use serde_json::json;

use netgraph::pipeline::{
    AssertionTarget, DEFAULT_OUTPUT, Emit, ImportStream, PropertyAssertion, Record, RecordType,
    StageBuildContext, StageContext, StageDescriptor, StageKey, StageSpec, TemplateConnection,
    TemplateStage, record,
};
use netgraph::{
    AddressPair, Confidence, Error, HardwareAddress, ImportItem, LogicalAddress, LogicalAddressMapping,
    Network, Pipeline, PipelineTemplate, Property, RuntimeConfig, Session, Stage, StageLogic,
    StageRegistry,
};

// ============================================================================
// Test stages
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Tagged {
    import: &'static str,
    seq: u32,
}

type Log = Arc<Mutex<Vec<(String, Tagged)>>>;

/// Forwards every tagged record unchanged.
struct Echo;

impl StageLogic for Echo {
    fn spec(&self) -> StageSpec {
        StageSpec::new().accepts_type::<Tagged>()
    }

    fn process(&mut self, record: Record, _ctx: &StageContext<'_>) -> netgraph::Result<Emit> {
        Ok(Emit::Record(record))
    }
}

/// Records what reached it, under its own stage name.
struct Collect {
    log: Log,
}

impl StageLogic for Collect {
    fn spec(&self) -> StageSpec {
        StageSpec::new().accepts_type::<Tagged>()
    }

    fn process(&mut self, record: Record, ctx: &StageContext<'_>) -> netgraph::Result<Emit> {
        if let Some(tagged) = record.downcast_ref::<Tagged>() {
            self.log.lock().push((ctx.stage_name().to_owned(), *tagged));
        }
        Ok(Emit::Nothing)
    }
}

/// Blocks in `process` until a token arrives on the gate.
struct Gated {
    gate: Receiver<()>,
}

impl StageLogic for Gated {
    fn spec(&self) -> StageSpec {
        StageSpec::new().accepts(RecordType::of::<u32>()).queue_capacity(1)
    }

    fn process(&mut self, _record: Record, _ctx: &StageContext<'_>) -> netgraph::Result<Emit> {
        let _ = self.gate.recv();
        Ok(Emit::Nothing)
    }
}

fn test_registry(log: &Log) -> StageRegistry {
    let mut registry = StageRegistry::new();
    registry.register(StageDescriptor {
        key: StageKey::new("test", "Echo"),
        display_name: "Echo".to_owned(),
        outputs: vec![DEFAULT_OUTPUT.to_owned()],
        configurable: false,
        default_config: serde_json::Value::Null,
        factory: Arc::new(|_ctx: &StageBuildContext<'_>| -> netgraph::Result<Box<dyn StageLogic>> {
            Ok(Box::new(Echo))
        }),
    });
    let log = Arc::clone(log);
    registry.register(StageDescriptor {
        key: StageKey::new("test", "Collect"),
        display_name: "Collect".to_owned(),
        outputs: vec![DEFAULT_OUTPUT.to_owned()],
        configurable: false,
        default_config: serde_json::Value::Null,
        factory: Arc::new(move |_ctx: &StageBuildContext<'_>| -> netgraph::Result<Box<dyn StageLogic>> {
            Ok(Box::new(Collect { log: Arc::clone(&log) }))
        }),
    });
    registry
}

fn tagged(import: &'static str, count: u32) -> ImportStream {
    Box::new((0..count).map(move |seq| Ok(record(Tagged { import, seq }))))
}

fn received(log: &Log, stage: &str) -> Vec<u32> {
    log.lock().iter().filter(|(name, _)| name == stage).map(|(_, t)| t.seq).collect()
}

fn mac(last: u8) -> HardwareAddress {
    HardwareAddress::mac([0x02, 0, 0, 0, 0, last])
}

fn nothing() -> ImportStream {
    Box::new(std::iter::empty::<netgraph::Result<Record>>())
}

const DRAIN: Duration = Duration::from_secs(10);

// ============================================================================
// 1. Fan-out through multicast
// ============================================================================

#[test]
fn test_one_output_to_three_stages() {
    let log: Log = Arc::default();
    let registry = test_registry(&log);
    let echo_kind = registry.lookup("test", "Echo").unwrap();
    let collect_kind = registry.lookup("test", "Collect").unwrap();

    let mut template = PipelineTemplate::new("fan-out");
    let echo = template.add_stage(echo_kind);
    let targets: Vec<usize> = ["A", "B", "C"]
        .into_iter()
        .map(|name| template.add_stage_named(name, collect_kind))
        .collect();
    for &target in &targets {
        assert!(template.add_connection(echo, DEFAULT_OUTPUT, target).unwrap());
    }
    template.add_entry_point(DEFAULT_OUTPUT, [echo]).unwrap();

    let session = Arc::new(Session::new());
    let pipeline = Pipeline::build(&registry, &session, &template, &RuntimeConfig::default()).unwrap();
    assert_eq!(pipeline.multicast_count(), 1);

    pipeline.start_import(DEFAULT_OUTPUT, "numbers", tagged("n", 5)).unwrap();
    assert!(pipeline.wait_until_drained(DRAIN));

    for name in ["A", "B", "C"] {
        assert_eq!(received(&log, name), vec![0, 1, 2, 3, 4], "stage {name}");
    }
    let stats = pipeline.stats();
    assert_eq!(stats["Echo"].outputs_processed, 5);
    assert_eq!(stats["Echo"].outputs_dropped, 0);
}

#[test]
fn test_entry_point_with_two_stages() {
    let log: Log = Arc::default();
    let registry = test_registry(&log);
    let collect_kind = registry.lookup("test", "Collect").unwrap();

    let mut template = PipelineTemplate::new("split entry");
    let left = template.add_stage_named("Left", collect_kind);
    let right = template.add_stage_named("Right", collect_kind);
    template.add_entry_point("Capture", [left, right]).unwrap();

    let session = Arc::new(Session::new());
    let pipeline = Pipeline::build(&registry, &session, &template, &RuntimeConfig::default()).unwrap();
    assert_eq!(pipeline.entry_points(), vec!["Capture".to_owned()]);
    assert_eq!(pipeline.multicast_count(), 1);

    pipeline.start_import("Capture", "numbers", tagged("n", 3)).unwrap();
    assert!(pipeline.wait_until_drained(DRAIN));
    assert_eq!(received(&log, "Left"), vec![0, 1, 2]);
    assert_eq!(received(&log, "Right"), vec![0, 1, 2]);
}

// ============================================================================
// 2. Import scheduling
// ============================================================================

#[test]
fn test_short_import_is_not_starved() {
    let log: Log = Arc::default();
    let registry = test_registry(&log);
    let mut template = PipelineTemplate::new("fairness");
    let only = template.add_stage(registry.lookup("test", "Collect").unwrap());
    template.add_entry_point(DEFAULT_OUTPUT, [only]).unwrap();

    let session = Arc::new(Session::new());
    let pipeline = Pipeline::build(&registry, &session, &template, &RuntimeConfig::default()).unwrap();
    pipeline.start_import(DEFAULT_OUTPUT, "long", tagged("long", 5000)).unwrap();
    pipeline.start_import(DEFAULT_OUTPUT, "short", tagged("short", 3)).unwrap();
    assert!(pipeline.wait_until_drained(DRAIN));

    let order: Vec<Tagged> = log.lock().iter().map(|(_, t)| *t).collect();
    assert_eq!(order.len(), 5003);
    let last_short = order.iter().rposition(|t| t.import == "short").unwrap();
    let last_long = order.iter().rposition(|t| t.import == "long").unwrap();
    assert!(last_short < last_long);
    assert_eq!(order.last().map(|t| t.import), Some("long"));
}

#[test]
fn test_failed_import_items_are_skipped() {
    let log: Log = Arc::default();
    let registry = test_registry(&log);
    let mut template = PipelineTemplate::new("errors");
    let only = template.add_stage(registry.lookup("test", "Collect").unwrap());
    template.add_entry_point(DEFAULT_OUTPUT, [only]).unwrap();

    let session = Arc::new(Session::new());
    let pipeline = Pipeline::build(&registry, &session, &template, &RuntimeConfig::default()).unwrap();
    let items: Vec<netgraph::Result<Record>> = vec![
        Ok(record(Tagged { import: "mixed", seq: 0 })),
        Err(Error::InvalidArgument("truncated packet".to_owned())),
        Ok(record(Tagged { import: "mixed", seq: 2 })),
    ];
    pipeline.start_import(DEFAULT_OUTPUT, "mixed", Box::new(items.into_iter())).unwrap();
    assert!(pipeline.wait_until_drained(DRAIN));
    assert_eq!(received(&log, "Collect"), vec![0, 2]);
}

// ============================================================================
// 3. Backpressure
// ============================================================================

#[test]
fn test_full_queue_blocks_the_producer() {
    let (release, gate) = unbounded();
    let stage = Arc::new(
        Stage::spawn("gated", Box::new(Gated { gate }), &RuntimeConfig::default()).unwrap(),
    );

    let producer = {
        let stage = Arc::clone(&stage);
        thread::spawn(move || {
            for i in 0..3u32 {
                stage.accept(record(i));
            }
        })
    };

    // One record held in `process`, one queued, the third waiting in accept.
    let deadline = Instant::now() + DRAIN;
    while stage.stats().inputs_accepted < 3 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(1));
    }
    thread::sleep(Duration::from_millis(20));
    let stats = stage.stats();
    assert_eq!(stats.inputs_accepted, 3);
    assert_eq!(stats.inputs_enqueued, 2);
    assert_eq!(stats.inputs_processed, 0);
    assert!(!producer.is_finished());

    for _ in 0..3 {
        release.send(()).unwrap();
    }
    producer.join().unwrap();
    let deadline = Instant::now() + DRAIN;
    while stage.stats().inputs_processed < 3 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(1));
    }
    let stats = stage.stats();
    assert_eq!(stats.inputs_enqueued, 3);
    assert_eq!(stats.inputs_processed, 3);
    assert!(stats.accept_delay_ms > 0);
}

// ============================================================================
// 4. Built-in stages against a session
// ============================================================================

#[test]
fn test_default_template_builds_the_graph() {
    let session = Arc::new(Session::new());
    let pipeline = Pipeline::build(
        &StageRegistry::with_builtins(),
        &session,
        &PipelineTemplate::default_template(),
        &RuntimeConfig::default(),
    )
    .unwrap();

    let mapping = LogicalAddressMapping::new(mac(1), LogicalAddress::ipv4(10, 0, 0, 1));
    let network = Network::new("10.0.0.0/24".parse().unwrap(), Confidence::Observed);
    let records: Vec<netgraph::Result<Record>> = vec![
        Ok(record(AddressPair::new(mac(1), mac(2)).unwrap())),
        Ok(record(mapping.clone())),
        Ok(record(PropertyAssertion::new(
            AssertionTarget::Hardware(mac(1)),
            "snmp",
            "vendor",
            [Property::new("Acme", Confidence::Reported)],
        ))),
        Ok(record(network)),
    ];
    pipeline.start_import(DEFAULT_OUTPUT, "capture", Box::new(records.into_iter())).unwrap();
    assert!(pipeline.wait_until_drained(DRAIN));

    assert_eq!(session.hardware_vertices().len(), 2);
    assert_eq!(session.physical_edges().len(), 1);
    let logical = session.logical_vertex(&mapping).unwrap();
    assert_eq!(
        logical.properties().get("vendor").unwrap(),
        vec![Property::new("Acme", Confidence::Reported)]
    );
    assert_eq!(session.networks().networks(), vec![network]);

    // Address records never leave the graph builder on its default output.
    let apply = pipeline.stats()["Assign Properties"];
    assert_eq!(apply.inputs_accepted, 2);
    assert_eq!(apply.inputs_processed, 1);
}

#[test]
fn test_stage_configuration_reaches_the_stage() {
    let mut template = PipelineTemplate::default_template();
    template
        .set_configuration("Assign Properties", json!({ "minimum_confidence": "Reported" }))
        .unwrap();

    let session = Arc::new(Session::new());
    let pipeline =
        Pipeline::build(&StageRegistry::with_builtins(), &session, &template, &RuntimeConfig::default()).unwrap();
    let records: Vec<netgraph::Result<Record>> = vec![
        Ok(record(PropertyAssertion::new(
            AssertionTarget::Hardware(mac(5)),
            "pcap",
            "ttl",
            [Property::new(64, Confidence::Observed)],
        ))),
        Ok(record(PropertyAssertion::new(
            AssertionTarget::Hardware(mac(6)),
            "user",
            "role",
            [Property::new("printer", Confidence::Asserted)],
        ))),
    ];
    pipeline.start_import(DEFAULT_OUTPUT, "mixed", Box::new(records.into_iter())).unwrap();
    assert!(pipeline.wait_until_drained(DRAIN));

    assert!(session.hardware_vertex(&mac(5)).is_none());
    let kept = session.hardware_vertex(&mac(6)).unwrap();
    assert!(kept.properties().has(&["role"]).unwrap());
}

#[test]
fn test_session_import_is_stamped() {
    let session = Arc::new(Session::new());
    let pipeline = Pipeline::build(
        &StageRegistry::with_builtins(),
        &session,
        &PipelineTemplate::default_template(),
        &RuntimeConfig::default(),
    )
    .unwrap();
    let item = ImportItem::new("/captures/office.pcap", "pcap", DEFAULT_OUTPUT);
    session.add_import(item.clone());

    let records: Vec<netgraph::Result<Record>> = vec![Ok(record(mac(3)))];
    assert!(pipeline.start_session_import(&item, Box::new(records.into_iter())).unwrap());
    assert!(pipeline.wait_until_drained(DRAIN));

    assert!(session.imports()[0].is_started());
    assert!(session.hardware_vertex(&mac(3)).is_some());

    // Starting the same item again feeds nothing.
    let again: Vec<netgraph::Result<Record>> = vec![Ok(record(mac(4)))];
    assert!(!pipeline.start_session_import(&item, Box::new(again.into_iter())).unwrap());
    assert!(!pipeline.start_session_import(&session.imports()[0], nothing()).unwrap());
    assert!(pipeline.wait_until_drained(DRAIN));
    assert!(session.hardware_vertex(&mac(4)).is_none());
    assert_eq!(session.imports().len(), 1);
}

#[test]
fn test_session_import_adds_unlisted_item() {
    let session = Arc::new(Session::new());
    let pipeline = Pipeline::build(
        &StageRegistry::with_builtins(),
        &session,
        &PipelineTemplate::default_template(),
        &RuntimeConfig::default(),
    )
    .unwrap();
    let item = ImportItem::new("/captures/lab.pcap", "pcap", DEFAULT_OUTPUT);

    let records: Vec<netgraph::Result<Record>> = vec![Ok(record(mac(8)))];
    assert!(pipeline.start_session_import(&item, Box::new(records.into_iter())).unwrap());
    assert!(pipeline.wait_until_drained(DRAIN));

    let imports = session.imports();
    assert_eq!(imports.len(), 1);
    assert!(imports[0].same_source(&item));
    assert!(imports[0].is_started());
    assert!(session.hardware_vertex(&mac(8)).is_some());

    let elsewhere = ImportItem::new("/captures/lab.pcap", "pcap", "Wireless");
    let err = pipeline.start_session_import(&elsewhere, nothing()).unwrap_err();
    assert!(matches!(err, Error::UnknownEntryPoint(_)));
    assert_eq!(session.imports().len(), 1);
}

// ============================================================================
// 5. Failure modes
// ============================================================================

#[test]
fn test_unknown_entry_point_and_closed_pipeline() {
    let session = Arc::new(Session::new());
    let pipeline = Pipeline::build(
        &StageRegistry::with_builtins(),
        &session,
        &PipelineTemplate::default_template(),
        &RuntimeConfig::default(),
    )
    .unwrap();

    let err = pipeline.start_import("Wireless", "x", nothing()).unwrap_err();
    assert!(matches!(err, Error::UnknownEntryPoint(name) if name == "Wireless"));

    pipeline.close();
    let err = pipeline.start_import(DEFAULT_OUTPUT, "x", nothing()).unwrap_err();
    assert!(matches!(err, Error::PreconditionViolated(_)));
    // Closing twice is harmless.
    pipeline.close();
}

#[test]
fn test_drifted_template_still_builds() {
    let mut template = PipelineTemplate::default_template();
    template.stages.push(TemplateStage {
        name: "Fingerprint".to_owned(),
        plugin: "retired-plugin".to_owned(),
        kind: "Fingerprint".to_owned(),
        configurable: false,
        outputs: vec![DEFAULT_OUTPUT.to_owned()],
    });
    template.connections.push(TemplateConnection {
        source: 1,
        output: DEFAULT_OUTPUT.to_owned(),
        destination: 2,
    });
    template.connections.push(TemplateConnection {
        source: 0,
        output: "Removed Output".to_owned(),
        destination: 1,
    });

    let session = Arc::new(Session::new());
    let pipeline =
        Pipeline::build(&StageRegistry::with_builtins(), &session, &template, &RuntimeConfig::default()).unwrap();
    assert!(pipeline.stage("Fingerprint").is_none());
    assert!(pipeline.stage("Create Basic Graph Elements").is_some());
    assert!(pipeline.stage("Assign Properties").is_some());
    assert_eq!(pipeline.multicast_count(), 0);

    let records: Vec<netgraph::Result<Record>> = vec![Ok(record(mac(4)))];
    pipeline.start_import(DEFAULT_OUTPUT, "capture", Box::new(records.into_iter())).unwrap();
    assert!(pipeline.wait_until_drained(DRAIN));
    assert!(session.hardware_vertex(&mac(4)).is_some());
}
