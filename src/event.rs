//! Change notification and the execution context it runs in.
//!
//! Every observer callback in the crate goes through an [`Event`], and every
//! `Event` hands its callbacks to an [`ExecutionProvider`]:
//!
//! ```text
//!   emit(args) ──► provider.is_execution_thread()? ──yes──► call handlers inline
//!                                │
//!                                no
//!                                ▼
//!                 provider.run_later(|| call handlers)
//! ```
//!
//! [`InThread`] runs everything on the caller. [`ThreadQueue`] owns one
//! worker thread fed by a bounded channel, so all callbacks routed through
//! it are serialized in emission order on that single thread.
//!
//! [`OrderedEvent`] adds a pending queue in front of an `Event` for state
//! that changes under a lock: values are queued while the lock is held and
//! delivered after it is released, in queue order.

use std::collections::VecDeque;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle, ThreadId};

use crossbeam_channel::{Receiver, Sender, TryRecvError, TrySendError, bounded};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, warn};

use crate::Result;

pub type Task = Box<dyn FnOnce() + Send + 'static>;

// ============================================================================
// ExecutionProvider
// ============================================================================

pub trait ExecutionProvider: Send + Sync {
    /// Run `task` and return once it has run.
    fn run_now(&self, task: Task);

    /// Schedule `task`; it may run before or after this call returns.
    fn run_later(&self, task: Task);

    /// True when the current thread is the provider's execution thread.
    fn is_execution_thread(&self) -> bool;
}

/// Runs every task synchronously on the calling thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct InThread;

impl ExecutionProvider for InThread {
    fn run_now(&self, task: Task) {
        task();
    }

    fn run_later(&self, task: Task) {
        task();
    }

    fn is_execution_thread(&self) -> bool {
        true
    }
}

pub fn in_thread() -> Arc<dyn ExecutionProvider> {
    Arc::new(InThread)
}

// ============================================================================
// ThreadQueue
// ============================================================================

/// Single worker thread draining a bounded task queue.
///
/// Other threads block while the queue is full. The worker itself cannot,
/// so tasks it schedules on a full queue spill into an unbounded overflow
/// list. While the overflow is non-empty every new task joins it, and the
/// worker only takes from it once the channel is empty, so tasks still
/// run in submission order.
pub struct ThreadQueue {
    name: String,
    sender: Mutex<Option<Sender<Task>>>,
    overflow: Arc<Mutex<VecDeque<Task>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    thread: ThreadId,
}

impl ThreadQueue {
    pub fn new(name: impl Into<String>, capacity: usize) -> Result<Self> {
        let name = name.into();
        let (sender, receiver) = bounded::<Task>(capacity.max(1));
        let overflow: Arc<Mutex<VecDeque<Task>>> = Arc::default();
        let spilled = Arc::clone(&overflow);
        let thread_name = name.clone();
        let worker = thread::Builder::new().name(name.clone()).spawn(move || {
            while let Some(task) = next_task(&receiver, &spilled) {
                if catch_unwind(AssertUnwindSafe(task)).is_err() {
                    error!(queue = %thread_name, "task panicked; continuing with next task");
                }
            }
            debug!(queue = %thread_name, "execution queue drained");
        })?;
        let thread = worker.thread().id();

        Ok(Self {
            name,
            sender: Mutex::new(Some(sender)),
            overflow,
            worker: Mutex::new(Some(worker)),
            thread,
        })
    }

    pub fn shared(name: impl Into<String>, capacity: usize) -> Result<Arc<dyn ExecutionProvider>> {
        Ok(Arc::new(Self::new(name, capacity)?))
    }

    fn sender(&self) -> Option<Sender<Task>> {
        self.sender.lock().clone()
    }

    /// Queue `task` behind everything already submitted. Returns false once
    /// the worker is gone.
    fn submit(&self, task: Task) -> bool {
        let Some(sender) = self.sender() else {
            return false;
        };
        {
            let mut overflow = self.overflow.lock();
            if !overflow.is_empty() {
                overflow.push_back(task);
                return true;
            }
            if self.is_execution_thread() {
                return match sender.try_send(task) {
                    Ok(()) => true,
                    Err(TrySendError::Full(task)) => {
                        debug!(queue = %self.name, "queue full on execution thread; spilling");
                        overflow.push_back(task);
                        true
                    }
                    Err(TrySendError::Disconnected(_)) => false,
                };
            }
        }
        sender.send(task).is_ok()
    }
}

/// Channel first, then overflow: everything in the overflow was submitted
/// after what the channel holds.
fn next_task(receiver: &Receiver<Task>, overflow: &Mutex<VecDeque<Task>>) -> Option<Task> {
    match receiver.try_recv() {
        Ok(task) => return Some(task),
        Err(TryRecvError::Empty | TryRecvError::Disconnected) => {}
    }
    let spilled = overflow.lock().pop_front();
    if spilled.is_some() {
        return spilled;
    }
    // Only the worker fills the overflow, so it stays empty while we block.
    receiver.recv().ok()
}

impl ExecutionProvider for ThreadQueue {
    fn run_now(&self, task: Task) {
        if self.is_execution_thread() {
            task();
            return;
        }
        let (done_tx, done_rx) = bounded::<()>(1);
        let wrapped: Task = Box::new(move || {
            task();
            let _ = done_tx.send(());
        });
        if !self.submit(wrapped) {
            warn!(queue = %self.name, "run_now after shutdown; task dropped");
            return;
        }
        // A panicking task drops `done_tx`, which also ends the wait.
        let _ = done_rx.recv();
    }

    fn run_later(&self, task: Task) {
        if !self.submit(task) {
            warn!(queue = %self.name, "run_later after shutdown; task dropped");
        }
    }

    fn is_execution_thread(&self) -> bool {
        thread::current().id() == self.thread
    }
}

impl Drop for ThreadQueue {
    fn drop(&mut self) {
        self.sender.lock().take();
        if let Some(worker) = self.worker.lock().take() {
            if worker.thread().id() != thread::current().id() {
                let _ = worker.join();
            }
        }
    }
}

impl fmt::Debug for ThreadQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadQueue").field("name", &self.name).finish()
    }
}

// ============================================================================
// Event
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(pub u64);

type Handler<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// A list of observers notified through an execution provider.
pub struct Event<T> {
    handlers: RwLock<Vec<(HandlerId, Handler<T>)>>,
    provider: Arc<dyn ExecutionProvider>,
    next_id: AtomicU64,
}

impl<T: Send + Sync + 'static> Event<T> {
    pub fn new(provider: Arc<dyn ExecutionProvider>) -> Self {
        Self {
            handlers: RwLock::new(Vec::new()),
            provider,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn subscribe(&self, handler: impl Fn(&T) + Send + Sync + 'static) -> HandlerId {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers.write().push((id, Arc::new(handler)));
        id
    }

    pub fn unsubscribe(&self, id: HandlerId) -> bool {
        let mut handlers = self.handlers.write();
        let before = handlers.len();
        handlers.retain(|(existing, _)| *existing != id);
        handlers.len() != before
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.read().len()
    }

    pub fn provider(&self) -> &Arc<dyn ExecutionProvider> {
        &self.provider
    }

    /// Notify every handler registered at the time of the call.
    pub fn emit(&self, args: T) {
        let handlers: Vec<Handler<T>> =
            self.handlers.read().iter().map(|(_, h)| Arc::clone(h)).collect();
        if handlers.is_empty() {
            return;
        }
        let notify = move || {
            for handler in &handlers {
                handler(&args);
            }
        };
        if self.provider.is_execution_thread() {
            notify();
        } else {
            self.provider.run_later(Box::new(notify));
        }
    }

    /// Like [`emit`](Self::emit), but always through `run_later`, so the
    /// call lands behind work already queued on the execution thread.
    pub fn emit_later(&self, args: T) {
        let handlers: Vec<Handler<T>> =
            self.handlers.read().iter().map(|(_, h)| Arc::clone(h)).collect();
        if handlers.is_empty() {
            return;
        }
        self.provider.run_later(Box::new(move || {
            for handler in &handlers {
                handler(&args);
            }
        }));
    }
}

impl<T> fmt::Debug for Event<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("handlers", &self.handlers.read().len())
            .finish()
    }
}

// ============================================================================
// OrderedEvent
// ============================================================================

/// An [`Event`] whose deliveries keep the order values were queued in.
///
/// Call [`queue`](Self::queue) while holding the lock that orders the state
/// change and [`flush`](Self::flush) after releasing it. The first thread to
/// flush delivers everything pending, including values other threads queue
/// meanwhile; the others return at once. Handlers may therefore change the
/// same state again, and their values are delivered after the current one.
pub struct OrderedEvent<T> {
    event: Event<T>,
    pending: Mutex<VecDeque<T>>,
    delivering: AtomicBool,
}

impl<T: Send + Sync + 'static> OrderedEvent<T> {
    pub fn new(provider: Arc<dyn ExecutionProvider>) -> Self {
        Self {
            event: Event::new(provider),
            pending: Mutex::new(VecDeque::new()),
            delivering: AtomicBool::new(false),
        }
    }

    pub fn event(&self) -> &Event<T> {
        &self.event
    }

    pub fn queue(&self, value: T) {
        self.pending.lock().push_back(value);
    }

    pub fn queue_all(&self, values: impl IntoIterator<Item = T>) {
        self.pending.lock().extend(values);
    }

    pub fn flush(&self) {
        loop {
            if self.delivering.swap(true, Ordering::AcqRel) {
                return;
            }
            {
                let _delivering = Delivering(&self.delivering);
                loop {
                    let next = self.pending.lock().pop_front();
                    let Some(value) = next else { break };
                    self.event.emit_later(value);
                }
            }
            // A value queued after our last pop but before the flag cleared
            // found us still delivering.
            if self.pending.lock().is_empty() {
                return;
            }
        }
    }
}

/// Clears the delivering flag even if a handler panics.
struct Delivering<'a>(&'a AtomicBool);

impl Drop for Delivering<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl<T> fmt::Debug for OrderedEvent<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrderedEvent")
            .field("event", &self.event)
            .field("pending", &self.pending.lock().len())
            .finish()
    }
}
