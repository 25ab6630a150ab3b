//! Round-robin draining of concurrent imports into one entry stage.
//!
//! Each registered import is a lazy, finite stream. The worker takes one
//! item from every active stream per round, so a short import started next
//! to a long one finishes in step with the rounds instead of waiting.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::Result;

use super::record::Record;
use super::stage::Sink;

/// One import: yields records until exhausted. `Err` items are logged and
/// skipped.
pub type ImportStream = Box<dyn Iterator<Item = Result<Record>> + Send>;

struct Producer {
    name: String,
    stream: Mutex<Option<ImportStream>>,
    pulled: AtomicU64,
}

impl Producer {
    /// Next item, or `None` once exhausted. Exhaustion is sticky.
    fn pull(&self) -> Option<Result<Record>> {
        let mut slot = self.stream.lock();
        let next = slot.as_mut()?.next();
        if next.is_none() {
            *slot = None;
        } else {
            self.pulled.fetch_add(1, Ordering::Relaxed);
        }
        next
    }
}

struct Shared {
    name: String,
    sink: Arc<dyn Sink>,
    active: RwLock<Arc<Vec<Arc<Producer>>>>,
    busy: AtomicBool,
    running: AtomicBool,
    idle: Duration,
}

/// Progress of one round.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoundOutcome {
    /// Items handed to the sink (errors excluded).
    pub forwarded: usize,
    /// Items pulled, errors included.
    pub pulled: usize,
    /// Streams found exhausted and purged.
    pub finished: usize,
}

impl Shared {
    fn run_round(&self) -> RoundOutcome {
        // Copy-on-write snapshot: registrations during the round land in the
        // next one.
        let snapshot = Arc::clone(&self.active.read());
        let mut outcome = RoundOutcome::default();
        let mut exhausted: Vec<Arc<Producer>> = Vec::new();

        for producer in snapshot.iter() {
            match producer.pull() {
                Some(Ok(record)) => {
                    outcome.pulled += 1;
                    outcome.forwarded += 1;
                    self.sink.accept(record);
                }
                Some(Err(e)) => {
                    outcome.pulled += 1;
                    warn!(entry = %self.name, import = %producer.name, error = %e, "import item failed; skipped");
                }
                None => exhausted.push(Arc::clone(producer)),
            }
        }

        if !exhausted.is_empty() {
            let mut active = self.active.write();
            let remaining: Vec<Arc<Producer>> = active
                .iter()
                .filter(|p| !exhausted.iter().any(|e| Arc::ptr_eq(e, *p)))
                .cloned()
                .collect();
            for done in &exhausted {
                info!(
                    entry = %self.name,
                    import = %done.name,
                    records = done.pulled.load(Ordering::Relaxed),
                    "import finished"
                );
            }
            outcome.finished = exhausted.len();
            if remaining.is_empty() {
                self.busy.store(false, Ordering::Release);
            }
            *active = Arc::new(remaining);
        }
        outcome
    }

    fn run(&self) {
        while self.running.load(Ordering::Acquire) {
            if self.active.read().is_empty() {
                thread::sleep(self.idle);
                continue;
            }
            if self.run_round().pulled == 0 {
                thread::sleep(self.idle);
            }
        }
        debug!(entry = %self.name, "aggregator stopped");
    }
}

/// Fair multi-import front of one entry point.
pub struct BufferedAggregator {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl BufferedAggregator {
    /// Aggregator with a background worker feeding `sink`.
    pub fn spawn(name: impl Into<String>, sink: Arc<dyn Sink>, idle: Duration) -> Result<Self> {
        let aggregator = Self::manual(name, sink, idle);
        let shared = Arc::clone(&aggregator.shared);
        let handle = thread::Builder::new()
            .name(format!("entry: {}", shared.name))
            .spawn(move || shared.run())?;
        *aggregator.worker.lock() = Some(handle);
        Ok(aggregator)
    }

    /// Aggregator without a worker; rounds are driven by [`run_round`](Self::run_round).
    pub fn manual(name: impl Into<String>, sink: Arc<dyn Sink>, idle: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                name: name.into(),
                sink,
                active: RwLock::new(Arc::new(Vec::new())),
                busy: AtomicBool::new(false),
                running: AtomicBool::new(true),
                idle,
            }),
            worker: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Add an import. The aggregator is busy from this point on.
    pub fn register(&self, name: impl Into<String>, stream: ImportStream) {
        let producer = Arc::new(Producer {
            name: name.into(),
            stream: Mutex::new(Some(stream)),
            pulled: AtomicU64::new(0),
        });
        let mut active = self.shared.active.write();
        let mut next: Vec<Arc<Producer>> = active.as_ref().clone();
        info!(entry = %self.shared.name, import = %producer.name, "import started");
        next.push(producer);
        *active = Arc::new(next);
        self.shared.busy.store(true, Ordering::Release);
    }

    pub fn run_round(&self) -> RoundOutcome {
        self.shared.run_round()
    }

    /// True while any registered import is unfinished.
    pub fn is_busy(&self) -> bool {
        self.shared.busy.load(Ordering::Acquire)
    }

    pub fn active_imports(&self) -> Vec<String> {
        self.shared.active.read().iter().map(|p| p.name.clone()).collect()
    }

    /// Stop the worker; unfinished imports are abandoned.
    pub fn close(&self) {
        if !self.shared.running.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
        let abandoned = self.shared.active.read().len();
        if abandoned > 0 {
            warn!(entry = %self.shared.name, abandoned, "closed with imports still active");
        }
        *self.shared.active.write() = Arc::new(Vec::new());
        self.shared.busy.store(false, Ordering::Release);
    }
}

impl Drop for BufferedAggregator {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for BufferedAggregator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferedAggregator")
            .field("name", &self.shared.name)
            .field("busy", &self.is_busy())
            .finish()
    }
}
