use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Handle returned by `add`, used to remove the listener again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Outcome of one broadcast over a registry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub failed: usize,
}

struct Entry<L: ?Sized> {
    id: ListenerId,
    listener: Arc<L>,
}

/// Ordered set of listeners for one medium.
///
/// Mutation takes a short lock on the entry list only. A broadcast holds the
/// iteration lock, copies the entry list and then calls every listener of
/// that copy with no lock on the list held, so:
/// - every listener present when the broadcast starts is called exactly once,
/// - listeners added meanwhile are first seen by the next broadcast,
/// - a listener removed meanwhile still receives the in-flight unit.
///
/// The iteration lock also guards the started flag, which records whether
/// the last lifecycle broadcast was `stream_started` or `stream_stopped`.
/// `add_catching_up` reads it under that lock, so a new listener either is
/// in the snapshot of a started broadcast or gets the catch-up, never both.
///
/// Broadcasts on one registry never overlap. A callback may call `add` or
/// `remove` on the registry it is being called from, but not
/// `add_catching_up`.
pub struct ListenerRegistry<L: ?Sized> {
    name: &'static str,
    entries: Mutex<Vec<Entry<L>>>,
    iteration: Mutex<bool>,
    next_id: AtomicU64,
}

impl<L: ?Sized + Send + Sync> ListenerRegistry<L> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            entries: Mutex::new(Vec::new()),
            iteration: Mutex::new(false),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn add(&self, listener: Arc<L>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Entry { id, listener });
        id
    }

    /// Adds the listener while no broadcast is in flight. If the stream is
    /// started, `catch_up` runs on the listener first, so it sees those
    /// callbacks before any unit broadcast after them.
    pub fn add_catching_up(&self, listener: Arc<L>, catch_up: impl FnOnce(&L)) -> ListenerId {
        let started = self.iteration.lock().unwrap_or_else(PoisonError::into_inner);
        if *started {
            catch_up(&listener);
        }
        self.add(listener)
    }

    /// Whether the last lifecycle broadcast was a start.
    pub fn is_started(&self) -> bool {
        *self.iteration.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn remove(&self, id: ListenerId) -> Option<Arc<L>> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let index = entries.iter().position(|entry| entry.id == id)?;
        Some(entries.remove(index).listener)
    }

    pub fn contains(&self, id: ListenerId) -> bool {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|entry| entry.id == id)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<Arc<L>> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|entry| entry.listener.clone())
            .collect()
    }

    /// Calls `f` once for every listener registered when the call starts.
    /// Returns how many listeners were visited.
    pub fn for_each(&self, f: impl FnMut(&L)) -> usize {
        let _iteration = self.iteration.lock().unwrap_or_else(PoisonError::into_inner);
        self.visit(f)
    }

    /// Like `for_each`, but a listener returning an error or panicking is
    /// logged and skipped; the remaining listeners are still called.
    pub fn broadcast(&self, event: &str, f: impl FnMut(&L) -> anyhow::Result<()>) -> BroadcastReport {
        let _iteration = self.iteration.lock().unwrap_or_else(PoisonError::into_inner);
        self.fan_out(event, f)
    }

    /// Broadcasts a lifecycle event and sets the started flag to `started`
    /// in the same critical section.
    pub fn broadcast_lifecycle(
        &self,
        event: &str,
        started: bool,
        f: impl FnMut(&L) -> anyhow::Result<()>,
    ) -> BroadcastReport {
        let mut flag = self.iteration.lock().unwrap_or_else(PoisonError::into_inner);
        *flag = started;
        self.fan_out(event, f)
    }

    fn visit(&self, mut f: impl FnMut(&L)) -> usize {
        let snapshot = self.snapshot();
        for listener in &snapshot {
            f(listener);
        }
        snapshot.len()
    }

    fn fan_out(&self, event: &str, mut f: impl FnMut(&L) -> anyhow::Result<()>) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        self.visit(|listener| {
            if self.deliver(event, || f(listener)) {
                report.delivered += 1;
            } else {
                report.failed += 1;
            }
        });
        report
    }

    /// Runs one listener callback, containing and logging its failure.
    /// Returns whether the callback succeeded.
    pub fn deliver(&self, event: &str, callback: impl FnOnce() -> anyhow::Result<()>) -> bool {
        match panic::catch_unwind(AssertUnwindSafe(callback)) {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                log::error!("{} listener failed on {}: {}", self.name, event, e);
                false
            }
            Err(_) => {
                log::error!("{} listener panicked on {}", self.name, event);
                false
            }
        }
    }
}
