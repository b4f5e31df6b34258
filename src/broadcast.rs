//! Fan-out of console lines, metrics and state changes to observers.
//!
//! Delivery iterates a snapshot of the registration table, so observers can
//! be added or removed while an event is in flight. Observers must not
//! block: a full sink drops the event for that observer only, and a closed
//! sink is deregistered.
//!
//! Published events go through an outbox. Only one thread delivers at a
//! time and it drains the outbox for everyone, so all observers see one
//! global order. No broadcaster lock is held while an observer runs.

use crate::console::{ConsoleHistory, ConsoleLine};
use crate::state::ProcessState;
use crate::telemetry::MetricSample;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, TryLockError};
use tokio::sync::{Notify, mpsc};
use tracing::debug;

/// Buffer of a channel observer created through `subscribe`.
pub const OBSERVER_BUFFER: usize = 1024;

pub type SubscriptionId = u64;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum TelemetryEvent {
    Console(ConsoleLine),
    Metrics(MetricSample),
    State(ProcessState),
}

#[derive(Debug, thiserror::Error)]
#[error("observer is unreachable")]
pub struct Unreachable;

/// Sink for live events.
///
/// `deliver` runs on whichever thread is draining the outbox and must
/// return quickly. It may query the supervisor (state, status, console
/// tail). Events it publishes itself are queued and delivered after it
/// returns.
pub trait Observer: Send + Sync {
    fn deliver(&self, event: &TelemetryEvent) -> Result<(), Unreachable>;
}

/// Observer backed by a bounded tokio channel.
pub struct ChannelObserver {
    tx: mpsc::Sender<TelemetryEvent>,
}

impl ChannelObserver {
    pub fn new(tx: mpsc::Sender<TelemetryEvent>) -> Self {
        Self { tx }
    }

    pub fn channel(buffer: usize) -> (Self, mpsc::Receiver<TelemetryEvent>) {
        let (tx, rx) = mpsc::channel(buffer);
        (Self::new(tx), rx)
    }
}

impl Observer for ChannelObserver {
    fn deliver(&self, event: &TelemetryEvent) -> Result<(), Unreachable> {
        match self.tx.try_send(event.clone()) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!("observer buffer full, dropping event");
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(Unreachable),
        }
    }
}

pub struct ConsoleBroadcaster {
    observers: RwLock<BTreeMap<SubscriptionId, Arc<dyn Observer>>>,
    next_id: AtomicU64,
    history: Mutex<ConsoleHistory>,
    outbox: Mutex<VecDeque<TelemetryEvent>>,
    /// Held by the thread currently draining `outbox`.
    delivery: Mutex<()>,
    console_dirty: AtomicBool,
    persist: Arc<Notify>,
}

impl ConsoleBroadcaster {
    /// `persist` is notified whenever the console history changes.
    pub fn new(history: ConsoleHistory, persist: Arc<Notify>) -> Self {
        Self {
            observers: RwLock::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
            history: Mutex::new(history),
            outbox: Mutex::new(VecDeque::new()),
            delivery: Mutex::new(()),
            console_dirty: AtomicBool::new(false),
            persist,
        }
    }

    pub fn register(&self, observer: Arc<dyn Observer>) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, observer);
        debug!(id, "observer registered");
        id
    }

    /// Returns false if the id was not registered.
    pub fn unregister(&self, id: SubscriptionId) -> bool {
        let removed = self
            .observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
            .is_some();
        if removed {
            debug!(id, "observer unregistered");
        }
        removed
    }

    pub fn observer_count(&self) -> usize {
        self.observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Record `event` and deliver it to every observer in registration
    /// order. Console lines enter history in the same order observers see
    /// them.
    pub fn publish(&self, event: TelemetryEvent) {
        self.enqueue(event);
        self.flush();
    }

    /// Queue `event` behind everything already published without delivering
    /// it. Callers holding their own locks enqueue under them and `flush`
    /// once those are released.
    pub fn enqueue(&self, event: TelemetryEvent) {
        let mut outbox = self.outbox.lock().unwrap_or_else(PoisonError::into_inner);
        if let TelemetryEvent::Console(line) = &event {
            self.history
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(line.clone());
            self.console_dirty.store(true, Ordering::Release);
            self.persist.notify_one();
        }
        outbox.push_back(event);
    }

    /// Deliver queued events. Returns at once if another thread (or an
    /// observer further up this stack) is already delivering; that caller
    /// picks up whatever is queued.
    pub fn flush(&self) {
        loop {
            let delivering = match self.delivery.try_lock() {
                Ok(guard) => guard,
                Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
                Err(TryLockError::WouldBlock) => return,
            };
            while let Some(event) = self.next_queued() {
                self.deliver(&event);
            }
            drop(delivering);

            // Something may have been queued after the last pop but before
            // the lock was released.
            if self.outbox_is_empty() {
                return;
            }
        }
    }

    fn next_queued(&self) -> Option<TelemetryEvent> {
        self.outbox
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }

    fn outbox_is_empty(&self) -> bool {
        self.outbox
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }

    fn deliver(&self, event: &TelemetryEvent) {
        let snapshot: Vec<(SubscriptionId, Arc<dyn Observer>)> = self
            .observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, observer)| (*id, Arc::clone(observer)))
            .collect();

        let unreachable: Vec<SubscriptionId> = snapshot
            .into_iter()
            .filter_map(|(id, observer)| observer.deliver(event).err().map(|_| id))
            .collect();

        if !unreachable.is_empty() {
            let mut observers = self
                .observers
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            for id in unreachable {
                observers.remove(&id);
                debug!(id, "dropped unreachable observer");
            }
        }
    }

    pub fn tail(&self, n: usize) -> Vec<ConsoleLine> {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .tail(n)
    }

    /// Snapshot for persistence if history changed since the last call.
    pub fn take_dirty(&self) -> Option<Vec<ConsoleLine>> {
        if !self.console_dirty.swap(false, Ordering::AcqRel) {
            return None;
        }
        Some(
            self.history
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .snapshot(),
        )
    }
}
