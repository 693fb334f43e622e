//! Delivery of inbound messages to registered handlers.
//!
//! A message event becomes a [`PendingDelivery`] carrying a snapshot of the
//! channel's handlers. Deliveries run either inline or on a single background
//! worker, so user code never stalls the connection's read loop.
//!
//! A panicking handler is caught and logged; the remaining handlers of the
//! same delivery still run.

use crate::error::Result;
use crate::types::Channel;
use crossbeam_channel::{bounded, Sender, TrySendError};
use parking_lot::{Mutex, RwLock};
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

type Callback = dyn Fn(&Channel, &[u8]) + Send + Sync;

/// A message callback registered against a channel.
///
/// Handlers are compared by identity: clones of one `Handler` are equal, two
/// handlers built from identical closures are not. Keep a clone to
/// unsubscribe a specific handler later.
#[derive(Clone)]
pub struct Handler(Arc<Callback>);

impl Handler {
    pub fn new<F>(callback: F) -> Self
    where
        F: Fn(&Channel, &[u8]) + Send + Sync + 'static,
    {
        Self(Arc::new(callback))
    }

    pub fn same_as(&self, other: &Handler) -> bool {
        Arc::as_ptr(&self.0) as *const () == Arc::as_ptr(&other.0) as *const ()
    }

    fn invoke(&self, channel: &Channel, payload: &[u8]) {
        (self.0)(channel, payload)
    }
}

impl PartialEq for Handler {
    fn eq(&self, other: &Self) -> bool {
        self.same_as(other)
    }
}

impl Eq for Handler {}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handler({:p})", Arc::as_ptr(&self.0) as *const ())
    }
}

/// Ordered, copy-on-write collection of handlers.
///
/// Cloning is a snapshot: later additions and removals do not affect it.
#[derive(Clone, Default)]
pub(crate) struct HandlerSet {
    handlers: Arc<Vec<Handler>>,
}

impl HandlerSet {
    pub fn single(handler: Handler) -> Self {
        Self {
            handlers: Arc::new(vec![handler]),
        }
    }

    pub fn add(&mut self, handler: Handler) {
        Arc::make_mut(&mut self.handlers).push(handler);
    }

    /// Remove the most recently added instance of `handler`.
    pub fn remove(&mut self, handler: &Handler) -> bool {
        match self.handlers.iter().rposition(|h| h.same_as(handler)) {
            Some(pos) => {
                Arc::make_mut(&mut self.handlers).remove(pos);
                true
            }
            None => false,
        }
    }

    pub fn clear(&mut self) {
        self.handlers = Arc::new(Vec::new());
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    fn iter(&self) -> impl Iterator<Item = &Handler> {
        self.handlers.iter()
    }
}

/// Where deliveries run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DispatchMode {
    /// On the thread that reported the message.
    Inline,
    /// On a dedicated worker thread, in arrival order.
    #[default]
    Background,
}

/// Result of running one delivery.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct DeliveryOutcome {
    pub invoked: usize,
    pub failed: usize,
}

/// A message waiting to be handed to its handlers.
pub(crate) struct PendingDelivery {
    channel: Channel,
    payload: Vec<u8>,
    handlers: HandlerSet,
}

impl PendingDelivery {
    pub fn new(channel: Channel, payload: Vec<u8>, handlers: HandlerSet) -> Self {
        Self {
            channel,
            payload,
            handlers,
        }
    }

    /// Invoke every handler, isolating panics.
    pub fn complete(self) -> DeliveryOutcome {
        let mut outcome = DeliveryOutcome::default();

        for handler in self.handlers.iter() {
            outcome.invoked += 1;
            let result = panic::catch_unwind(AssertUnwindSafe(|| {
                handler.invoke(&self.channel, &self.payload)
            }));
            if let Err(payload) = result {
                outcome.failed += 1;
                tracing::error!(
                    channel = %self.channel,
                    panic = %panic_message(&*payload),
                    "subscription handler panicked"
                );
            }
        }

        outcome
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[derive(Default)]
struct DispatchCounters {
    completed: AtomicU64,
    handler_failures: AtomicU64,
    dropped: AtomicU64,
}

impl DispatchCounters {
    fn record(&self, outcome: DeliveryOutcome) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        if outcome.failed > 0 {
            self.handler_failures
                .fetch_add(outcome.failed as u64, Ordering::Relaxed);
        }
    }
}

/// Counters reported by the dispatcher.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct DispatchStats {
    pub completed: u64,
    pub handler_failures: u64,
    pub dropped: u64,
}

/// Runs deliveries according to its [`DispatchMode`].
pub(crate) struct Dispatcher {
    mode: DispatchMode,
    sender: RwLock<Option<Sender<PendingDelivery>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    counters: Arc<DispatchCounters>,
}

impl Dispatcher {
    /// Create a dispatcher. In background mode this spawns the worker thread,
    /// fed by a queue of `capacity` deliveries.
    pub fn new(mode: DispatchMode, capacity: usize) -> Result<Self> {
        let counters = Arc::new(DispatchCounters::default());

        let (sender, worker) = match mode {
            DispatchMode::Inline => (None, None),
            DispatchMode::Background => {
                let (sender, receiver) = bounded::<PendingDelivery>(capacity.max(1));
                let worker_counters = Arc::clone(&counters);
                let worker = thread::Builder::new()
                    .name("kvsub-dispatch".to_string())
                    .spawn(move || {
                        for delivery in receiver.iter() {
                            worker_counters.record(delivery.complete());
                        }
                        tracing::debug!("dispatch worker stopped");
                    })?;
                (Some(sender), Some(worker))
            }
        };

        Ok(Self {
            mode,
            sender: RwLock::new(sender),
            worker: Mutex::new(worker),
            counters,
        })
    }

    /// Run or enqueue a delivery. Returns false if it was dropped.
    pub fn submit(&self, delivery: PendingDelivery) -> bool {
        if self.mode == DispatchMode::Inline {
            self.counters.record(delivery.complete());
            return true;
        }

        let sender = self.sender.read();
        let Some(sender) = sender.as_ref() else {
            tracing::debug!(channel = %delivery.channel, "dispatcher stopped, dropping message");
            return false;
        };

        match sender.try_send(delivery) {
            Ok(()) => true,
            Err(TrySendError::Full(delivery)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(channel = %delivery.channel, "dispatch queue full, dropping message");
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }

    /// Stop accepting deliveries, let the worker drain the queue, and join it.
    pub fn shutdown(&self) {
        self.sender.write().take();

        if let Some(worker) = self.worker.lock().take() {
            // Called from a handler: the worker exits on its own once drained.
            if worker.thread().id() == thread::current().id() {
                return;
            }
            if worker.join().is_err() {
                tracing::error!("dispatch worker panicked");
            }
        }
    }

    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            completed: self.counters.completed.load(Ordering::Relaxed),
            handler_failures: self.counters.handler_failures.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}
