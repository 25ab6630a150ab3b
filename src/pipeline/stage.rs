//! One unit of the processing graph.
//!
//! ```text
//!             accept(record)
//!                  │
//!      accepted type? ──no──────────────────────────┐
//!                  │yes                             │
//!        bounded backlog (retry while full)         │
//!                  │                                ▼
//!        worker thread: process() ──► Emit ──► outputs (allow/deny) ──► sinks
//! ```
//!
//! States only move forward: `Running → Terminating → Terminated`. A stage
//! with neither a backlog nor accepted types never spawns a worker and
//! starts out `Terminated`; it relays everything it is given.

use std::any::Any;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError, bounded, select};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, error, trace, warn};

use crate::config::RuntimeConfig;
use crate::Result;

use super::record::{Emit, Record, RecordType};

/// Output every stage defines.
pub const DEFAULT_OUTPUT: &str = "Default";

// ============================================================================
// Contracts
// ============================================================================

/// The behaviour of a stage. Runs on the stage's own worker thread.
pub trait StageLogic: Send + 'static {
    /// Inputs, outputs and queueing of this stage.
    fn spec(&self) -> StageSpec;

    /// Handle one accepted record.
    fn process(&mut self, record: Record, ctx: &StageContext<'_>) -> Result<Emit>;
}

/// Anything a stage output can be bound to.
pub trait Sink: Send + Sync {
    fn accept(&self, record: Record);
}

/// Adapts a closure into a [`Sink`].
pub struct FnSink<F>(pub F);

impl<F: Fn(Record) + Send + Sync> Sink for FnSink<F> {
    fn accept(&self, record: Record) {
        (self.0)(record)
    }
}

pub fn sink_fn(f: impl Fn(Record) + Send + Sync + 'static) -> Arc<dyn Sink> {
    Arc::new(FnSink(f))
}

// ============================================================================
// StageSpec
// ============================================================================

#[derive(Debug, Clone)]
pub struct OutputSpec {
    pub name: String,
    /// Empty means every record is allowed.
    pub allow: Vec<RecordType>,
    /// Checked after `allow`; a match rejects.
    pub deny: Vec<RecordType>,
}

impl OutputSpec {
    pub fn admits(&self, record: &Record) -> bool {
        let allowed = self.allow.is_empty() || self.allow.iter().any(|t| t.matches(record));
        allowed && !self.deny.iter().any(|t| t.matches(record))
    }
}

/// Declared shape of a stage.
#[derive(Debug, Clone)]
pub struct StageSpec {
    pub accepts: Vec<RecordType>,
    pub outputs: Vec<OutputSpec>,
    pub passive: bool,
    /// `None` uses the runtime default capacity.
    pub queue_capacity: Option<usize>,
    /// False for stages that only relay (no backlog, no worker).
    pub queued: bool,
}

impl StageSpec {
    /// Queued stage with only the default output.
    pub fn new() -> Self {
        Self {
            accepts: Vec::new(),
            outputs: vec![OutputSpec { name: DEFAULT_OUTPUT.to_owned(), allow: Vec::new(), deny: Vec::new() }],
            passive: false,
            queue_capacity: None,
            queued: true,
        }
    }

    /// Stage without backlog or accepted types.
    pub fn relay() -> Self {
        Self { queued: false, ..Self::new() }
    }

    pub fn accepts(mut self, record_type: RecordType) -> Self {
        self.accepts.push(record_type);
        self
    }

    pub fn accepts_type<T: Any>(self) -> Self {
        self.accepts(RecordType::of::<T>())
    }

    /// Define (or redefine) a named output.
    pub fn output(mut self, name: impl Into<String>, allow: impl IntoIterator<Item = RecordType>) -> Self {
        let name = name.into();
        let allow: Vec<RecordType> = allow.into_iter().collect();
        match self.outputs.iter_mut().find(|o| o.name == name) {
            Some(existing) => existing.allow = allow,
            None => self.outputs.push(OutputSpec { name, allow, deny: Vec::new() }),
        }
        self
    }

    /// Keep these types off an output.
    pub fn deny(mut self, output: &str, types: impl IntoIterator<Item = RecordType>) -> Self {
        if let Some(existing) = self.outputs.iter_mut().find(|o| o.name == output) {
            existing.deny.extend(types);
        }
        self
    }

    pub fn passive(mut self) -> Self {
        self.passive = true;
        self
    }

    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = Some(capacity);
        self
    }

    pub fn output_names(&self) -> Vec<String> {
        self.outputs.iter().map(|o| o.name.clone()).collect()
    }
}

impl Default for StageSpec {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// State and statistics
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StageState {
    Running,
    Terminating,
    Terminated,
}

impl StageState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => StageState::Running,
            1 => StageState::Terminating,
            _ => StageState::Terminated,
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    inputs_accepted: AtomicU64,
    inputs_enqueued: AtomicU64,
    inputs_processed: AtomicU64,
    outputs_processed: AtomicU64,
    outputs_dropped: AtomicU64,
    accept_delay_ms: AtomicU64,
    faults: AtomicU64,
}

/// Point-in-time copy of a stage's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StageStats {
    pub inputs_accepted: u64,
    pub inputs_enqueued: u64,
    pub inputs_processed: u64,
    pub outputs_processed: u64,
    pub outputs_dropped: u64,
    pub accept_delay_ms: u64,
    pub faults: u64,
}

// ============================================================================
// Shared stage state
// ============================================================================

struct BoundOutput {
    spec: OutputSpec,
    target: Option<Arc<dyn Sink>>,
}

pub(crate) struct StageShared {
    name: String,
    accepts: Vec<RecordType>,
    passive: bool,
    backlog: Option<(Sender<Record>, Receiver<Record>)>,
    outputs: RwLock<Vec<BoundOutput>>,
    state: AtomicU8,
    counters: Counters,
    backoff: Duration,
}

impl StageShared {
    fn state(&self) -> StageState {
        StageState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: StageState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn accept(&self, record: Record) {
        self.counters.inputs_accepted.fetch_add(1, Ordering::Relaxed);

        let queue = match &self.backlog {
            Some((sender, _)) if self.accepts.iter().any(|t| t.matches(&record)) => sender,
            _ => {
                // Not ours: relay untouched.
                self.process_output(Emit::Record(record));
                return;
            }
        };

        let passthrough = self.passive.then(|| Arc::clone(&record));
        let mut item = record;
        loop {
            match queue.try_send(item) {
                Ok(()) => {
                    self.counters.inputs_enqueued.fetch_add(1, Ordering::Relaxed);
                    break;
                }
                Err(TrySendError::Full(back)) => {
                    if self.state() != StageState::Running {
                        debug!(stage = %self.name, "stage shutting down; record discarded");
                        return;
                    }
                    item = back;
                    self.counters
                        .accept_delay_ms
                        .fetch_add(self.backoff.as_millis().max(1) as u64, Ordering::Relaxed);
                    thread::sleep(self.backoff);
                }
                Err(TrySendError::Disconnected(_)) => {
                    debug!(stage = %self.name, "backlog closed; record discarded");
                    return;
                }
            }
        }

        if let Some(record) = passthrough {
            self.process_output(Emit::Record(record));
        }
    }

    fn process_output(&self, emit: Emit) {
        match emit {
            Emit::Nothing => {}
            Emit::Batch(items) => {
                for item in items {
                    self.process_output(item);
                }
            }
            Emit::Record(record) => {
                if let Some(batch) = record.downcast_ref::<Vec<Record>>() {
                    for item in batch {
                        self.process_output(Emit::Record(Arc::clone(item)));
                    }
                    return;
                }
                self.counters.outputs_processed.fetch_add(1, Ordering::Relaxed);

                let targets: Vec<Arc<dyn Sink>> = self
                    .outputs
                    .read()
                    .iter()
                    .filter(|o| o.spec.admits(&record))
                    .filter_map(|o| o.target.clone())
                    .collect();
                if targets.is_empty() {
                    self.counters.outputs_dropped.fetch_add(1, Ordering::Relaxed);
                    trace!(stage = %self.name, "record matched no connected output");
                    return;
                }
                for target in targets {
                    target.accept(Arc::clone(&record));
                }
            }
        }
    }

    fn run(&self, logic: &mut dyn StageLogic, backlog: Receiver<Record>, shutdown: Receiver<()>) {
        let ctx = StageContext { shared: self };
        loop {
            let record = select! {
                recv(backlog) -> msg => match msg {
                    Ok(record) => record,
                    Err(_) => break,
                },
                recv(shutdown) -> _ => break,
            };
            if self.state() != StageState::Running {
                break;
            }

            match catch_unwind(AssertUnwindSafe(|| logic.process(record, &ctx))) {
                Ok(Ok(emit)) => self.process_output(emit),
                Ok(Err(e)) => {
                    if self.state() == StageState::Running {
                        self.counters.faults.fetch_add(1, Ordering::Relaxed);
                        error!(stage = %self.name, error = %e, "process failed; continuing");
                    }
                }
                Err(_) => {
                    self.counters.faults.fetch_add(1, Ordering::Relaxed);
                    error!(stage = %self.name, "process panicked; continuing");
                }
            }
            self.counters.inputs_processed.fetch_add(1, Ordering::Relaxed);
        }
        self.set_state(StageState::Terminated);
        debug!(stage = %self.name, "worker stopped");
    }
}

impl Sink for StageShared {
    fn accept(&self, record: Record) {
        StageShared::accept(self, record)
    }
}

// ============================================================================
// StageContext
// ============================================================================

/// What `process` may do besides returning output.
pub struct StageContext<'a> {
    shared: &'a StageShared,
}

impl StageContext<'_> {
    pub fn stage_name(&self) -> &str {
        &self.shared.name
    }

    /// Send straight to one output, skipping its filters.
    ///
    /// Returns false when the output is undefined or unconnected.
    pub fn emit_to(&self, output: &str, record: Record) -> bool {
        let target = self
            .shared
            .outputs
            .read()
            .iter()
            .find(|o| o.spec.name == output)
            .and_then(|o| o.target.clone());
        match target {
            Some(target) => {
                target.accept(record);
                true
            }
            None => false,
        }
    }

    /// Long-running `process` calls should poll this and return early.
    pub fn is_terminating(&self) -> bool {
        self.shared.state() != StageState::Running
    }
}

// ============================================================================
// Stage
// ============================================================================

pub struct Stage {
    shared: Arc<StageShared>,
    shutdown: Mutex<Option<Sender<()>>>,
    done: Option<Receiver<()>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Stage {
    /// Build the stage and start its worker.
    pub fn spawn(name: impl Into<String>, logic: Box<dyn StageLogic>, config: &RuntimeConfig) -> Result<Self> {
        let name = name.into();
        let spec = logic.spec();
        let queued = spec.queued && !spec.accepts.is_empty();
        let capacity = spec.queue_capacity.unwrap_or(config.stage_queue_capacity).max(1);

        let shared = Arc::new(StageShared {
            name: name.clone(),
            accepts: spec.accepts,
            passive: spec.passive,
            backlog: queued.then(|| bounded(capacity)),
            outputs: RwLock::new(
                spec.outputs
                    .into_iter()
                    .map(|spec| BoundOutput { spec, target: None })
                    .collect(),
            ),
            state: AtomicU8::new(if queued { StageState::Running as u8 } else { StageState::Terminated as u8 }),
            counters: Counters::default(),
            backoff: config.accept_backoff(),
        });

        let Some((_, backlog)) = shared.backlog.clone() else {
            debug!(stage = %name, "relay stage; no worker");
            return Ok(Self { shared, shutdown: Mutex::new(None), done: None, worker: Mutex::new(None) });
        };

        let (shutdown_tx, shutdown_rx) = bounded::<()>(0);
        let (done_tx, done_rx) = bounded::<()>(0);
        let worker_shared = Arc::clone(&shared);
        let mut logic = logic;
        let worker = thread::Builder::new()
            .name(format!("stage: {name}"))
            .spawn(move || {
                worker_shared.run(logic.as_mut(), backlog, shutdown_rx);
                drop(done_tx);
            })?;

        Ok(Self {
            shared,
            shutdown: Mutex::new(Some(shutdown_tx)),
            done: Some(done_rx),
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Relay stage with the given outputs and no worker.
    pub fn relay(name: impl Into<String>, outputs: impl IntoIterator<Item = String>) -> Self {
        let shared = Arc::new(StageShared {
            name: name.into(),
            accepts: Vec::new(),
            passive: false,
            backlog: None,
            outputs: RwLock::new(
                outputs
                    .into_iter()
                    .map(|name| BoundOutput {
                        spec: OutputSpec { name, allow: Vec::new(), deny: Vec::new() },
                        target: None,
                    })
                    .collect(),
            ),
            state: AtomicU8::new(StageState::Terminated as u8),
            counters: Counters::default(),
            backoff: Duration::from_millis(1),
        });
        Self { shared, shutdown: Mutex::new(None), done: None, worker: Mutex::new(None) }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn state(&self) -> StageState {
        self.shared.state()
    }

    pub fn has_worker(&self) -> bool {
        self.shared.backlog.is_some()
    }

    pub fn accept(&self, record: Record) {
        self.shared.accept(record);
    }

    /// This stage as a bindable sink.
    pub fn sink(&self) -> Arc<dyn Sink> {
        Arc::clone(&self.shared) as Arc<dyn Sink>
    }

    pub fn outputs(&self) -> Vec<String> {
        self.shared.outputs.read().iter().map(|o| o.spec.name.clone()).collect()
    }

    /// Bind `output` to `target`, replacing any previous binding.
    ///
    /// Returns false (and binds nothing) when the output is undefined.
    pub fn connect_output(&self, output: &str, target: Arc<dyn Sink>) -> bool {
        let mut outputs = self.shared.outputs.write();
        match outputs.iter_mut().find(|o| o.spec.name == output) {
            Some(bound) => {
                bound.target = Some(target);
                true
            }
            None => {
                warn!(stage = %self.shared.name, output, "connect to undefined output ignored");
                false
            }
        }
    }

    pub fn target_of(&self, output: &str) -> Option<Arc<dyn Sink>> {
        self.shared
            .outputs
            .read()
            .iter()
            .find(|o| o.spec.name == output)
            .and_then(|o| o.target.clone())
    }

    pub(crate) fn disconnect_all(&self) {
        for bound in self.shared.outputs.write().iter_mut() {
            bound.target = None;
        }
    }

    pub fn stats(&self) -> StageStats {
        let c = &self.shared.counters;
        StageStats {
            inputs_accepted: c.inputs_accepted.load(Ordering::Relaxed),
            inputs_enqueued: c.inputs_enqueued.load(Ordering::Relaxed),
            inputs_processed: c.inputs_processed.load(Ordering::Relaxed),
            outputs_processed: c.outputs_processed.load(Ordering::Relaxed),
            outputs_dropped: c.outputs_dropped.load(Ordering::Relaxed),
            accept_delay_ms: c.accept_delay_ms.load(Ordering::Relaxed),
            faults: c.faults.load(Ordering::Relaxed),
        }
    }

    /// True when nothing is queued and nothing is being processed.
    pub fn is_idle(&self) -> bool {
        let stats = self.stats();
        let queued = self.shared.backlog.as_ref().map_or(0, |(_, rx)| rx.len());
        queued == 0 && stats.inputs_processed >= stats.inputs_enqueued
    }

    /// Stop the worker, discarding the backlog, and wait up to `timeout`.
    pub fn terminate(&self, timeout: Duration) {
        self.signal_terminate();
        self.join(timeout);
    }

    /// Move to `Terminating` and wake the worker without waiting for it.
    pub(crate) fn signal_terminate(&self) {
        if self.shared.state() == StageState::Running {
            self.shared.set_state(StageState::Terminating);
        }
        if let Some((_, backlog)) = &self.shared.backlog {
            let discarded = backlog.try_iter().count();
            if discarded > 0 {
                debug!(stage = %self.shared.name, discarded, "backlog cleared");
            }
        }
        self.shutdown.lock().take();
    }

    pub(crate) fn join(&self, timeout: Duration) {
        if timeout.is_zero() {
            return;
        }
        let Some(done) = &self.done else {
            return;
        };
        match done.recv_timeout(timeout) {
            Err(RecvTimeoutError::Timeout) => {
                warn!(stage = %self.shared.name, ?timeout, "worker did not stop in time");
            }
            _ => {
                if let Some(worker) = self.worker.lock().take() {
                    let _ = worker.join();
                }
            }
        }
    }

    pub fn close(&self) {
        self.terminate(Duration::ZERO);
    }
}

impl Drop for Stage {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stage")
            .field("name", &self.shared.name)
            .field("state", &self.state())
            .finish()
    }
}
