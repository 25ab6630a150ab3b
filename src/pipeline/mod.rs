//! # Processing pipeline
//!
//! A pipeline is a directed graph of [`Stage`]s built from a
//! [`PipelineTemplate`] and a [`StageRegistry`]. Imports enter through named
//! entry points, each fronted by a [`BufferedAggregator`].
//!
//! ```text
//!  import A ─┐
//!  import B ─┼─► aggregator "Default" ─► stage 0 ─┬─► stage 1
//!            │                                    └─► multicast ─┬─► stage 2
//!                                                                └─► stage 3
//! ```
//!
//! One stage output binds to exactly one sink. When a template connects an
//! output to several stages, or an entry point lists several stages, a
//! relay stage ("multicast") with one output per destination is inserted.

pub mod aggregator;
pub mod record;
pub mod registry;
pub mod stage;
pub mod stages;
pub mod template;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::config::RuntimeConfig;
use crate::session::{ImportItem, Session};
use crate::{Error, Result};

pub use aggregator::{BufferedAggregator, ImportStream, RoundOutcome};
pub use record::{Emit, Record, RecordType, record};
pub use registry::{StageBuildContext, StageDescriptor, StageFactory, StageKey, StageRegistry};
pub use stage::{
    DEFAULT_OUTPUT, FnSink, OutputSpec, Sink, Stage, StageContext, StageLogic, StageSpec, StageState,
    StageStats, sink_fn,
};
pub use stages::{
    ApplyProperties, ApplyPropertiesConfig, AssertionTarget, BuildGraph, PropertyAssertion,
};
pub use template::{PipelineTemplate, TemplateConnection, TemplateEntryPoint, TemplateStage};

/// Relay stage fanning one input out to `count` outputs named `{prefix}#{i}`.
fn multicast(name: String, prefix: &str, count: usize) -> Stage {
    Stage::relay(name, (0..count).map(|i| format!("{prefix}#{i}")))
}

struct EntryPoint {
    name: String,
    aggregator: BufferedAggregator,
}

/// A running pipeline. Closing (or dropping) it stops every worker.
pub struct Pipeline {
    name: String,
    session: Arc<Session>,
    stages: Vec<Stage>,
    multicasts: Vec<Stage>,
    entries: Vec<EntryPoint>,
    shutdown_timeout: Duration,
    closed: AtomicBool,
}

impl Pipeline {
    /// Instantiate and wire every stage of `template`.
    ///
    /// The template is validated against `registry` first, so drifted
    /// parts are logged and left out rather than failing the build.
    pub fn build(
        registry: &StageRegistry,
        session: &Arc<Session>,
        template: &PipelineTemplate,
        config: &RuntimeConfig,
    ) -> Result<Self> {
        let template = template.validate(registry);

        let mut stages = Vec::with_capacity(template.stages.len());
        for stage in &template.stages {
            let logic = registry.build(&stage.key(), &stage.name, session, template.configuration_for(&stage.name))?;
            stages.push(Stage::spawn(stage.name.clone(), logic, config)?);
        }

        let mut groups: BTreeMap<(usize, &str), Vec<usize>> = BTreeMap::new();
        for connection in &template.connections {
            groups
                .entry((connection.source, connection.output.as_str()))
                .or_default()
                .push(connection.destination);
        }

        let mut multicasts = Vec::new();
        for ((source, output), destinations) in groups {
            let from = &stages[source];
            if let [only] = destinations[..] {
                from.connect_output(output, stages[only].sink());
                continue;
            }
            let fan = multicast(format!("{} / {output} multicast", from.name()), output, destinations.len());
            for (i, &destination) in destinations.iter().enumerate() {
                fan.connect_output(&format!("{output}#{i}"), stages[destination].sink());
            }
            from.connect_output(output, fan.sink());
            debug!(stage = %from.name(), output, fanout = destinations.len(), "multicast inserted");
            multicasts.push(fan);
        }

        let mut entry_points = template.entry_points.clone();
        if entry_points.is_empty() && !stages.is_empty() {
            entry_points.push(TemplateEntryPoint { name: DEFAULT_OUTPUT.to_owned(), stages: vec![0] });
        }

        let mut entries = Vec::with_capacity(entry_points.len());
        for entry in entry_points {
            let sink = match entry.stages[..] {
                [only] => stages[only].sink(),
                _ => {
                    let fan = multicast(format!("entry {} multicast", entry.name), &entry.name, entry.stages.len());
                    for (i, &stage) in entry.stages.iter().enumerate() {
                        fan.connect_output(&format!("{}#{i}", entry.name), stages[stage].sink());
                    }
                    let sink = fan.sink();
                    multicasts.push(fan);
                    sink
                }
            };
            let aggregator = BufferedAggregator::spawn(entry.name.clone(), sink, config.aggregator_idle())?;
            entries.push(EntryPoint { name: entry.name, aggregator });
        }

        info!(
            pipeline = %template.name,
            stages = stages.len(),
            multicasts = multicasts.len(),
            entries = entries.len(),
            "pipeline built"
        );
        Ok(Self {
            name: template.name.clone(),
            session: Arc::clone(session),
            stages,
            multicasts,
            entries,
            shutdown_timeout: config.shutdown_timeout(),
            closed: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn entry_points(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.name.clone()).collect()
    }

    pub fn stage(&self, name: &str) -> Option<&Stage> {
        self.stages.iter().find(|s| s.name() == name)
    }

    /// Number of synthesized fan-out stages.
    pub fn multicast_count(&self) -> usize {
        self.multicasts.len()
    }

    /// Queue an import on `entry`.
    pub fn start_import(&self, entry: &str, import: impl Into<String>, stream: ImportStream) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::PreconditionViolated(format!("pipeline '{}' is closed", self.name)));
        }
        let Some(target) = self.entries.iter().find(|e| e.name == entry) else {
            warn!(pipeline = %self.name, entry, "import for unknown entry point");
            return Err(Error::UnknownEntryPoint(entry.to_owned()));
        };
        target.aggregator.register(import, stream);
        Ok(())
    }

    /// Queue an import described by a session import item, adding it to the
    /// session's list if needed. An item that has already started is left
    /// alone and `stream` is dropped. Returns whether the import was queued.
    pub fn start_session_import(&self, item: &ImportItem, stream: ImportStream) -> Result<bool> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::PreconditionViolated(format!("pipeline '{}' is closed", self.name)));
        }
        if !self.entries.iter().any(|e| e.name == item.entry_point) {
            warn!(pipeline = %self.name, entry = %item.entry_point, "import for unknown entry point");
            return Err(Error::UnknownEntryPoint(item.entry_point.clone()));
        }
        if !self.session.begin_import(item) {
            debug!(pipeline = %self.name, path = %item.path.display(), "import already started");
            return Ok(false);
        }
        self.start_import(&item.entry_point, item.path.display().to_string(), stream)?;
        Ok(true)
    }

    /// True while any entry point has an unfinished import.
    pub fn is_busy(&self) -> bool {
        self.entries.iter().any(|e| e.aggregator.is_busy())
    }

    pub fn stats(&self) -> BTreeMap<String, StageStats> {
        self.stages.iter().map(|s| (s.name().to_owned(), s.stats())).collect()
    }

    /// Wait until no import is active and every stage has processed what it
    /// enqueued. Returns false on timeout.
    pub fn wait_until_drained(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut previous: Option<Vec<StageStats>> = None;
        loop {
            if !self.is_busy() && self.stages.iter().all(Stage::is_idle) {
                let snapshot: Vec<StageStats> = self.stages.iter().map(Stage::stats).collect();
                // Two identical idle snapshots in a row: nothing was in flight
                // between stages.
                if previous.as_ref() == Some(&snapshot) {
                    return true;
                }
                previous = Some(snapshot);
            } else {
                previous = None;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(2));
        }
    }

    /// Stop stages, then aggregators, then unbind every output.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        for stage in &self.stages {
            stage.signal_terminate();
        }
        for stage in &self.stages {
            stage.join(self.shutdown_timeout);
        }
        for entry in &self.entries {
            entry.aggregator.close();
        }
        for stage in self.stages.iter().chain(&self.multicasts) {
            stage.disconnect_all();
        }
        info!(pipeline = %self.name, "pipeline closed");
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.close();
    }
}
