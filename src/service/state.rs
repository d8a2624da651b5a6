//! Service state management.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;

use crate::cancel::CancelSignal;
use crate::engine::{EngineConfig, ReassemblyEngine};
use crate::store::CollectionStore;

/// Shared service state.
///
/// Holds the engine and the cancel signal of the batch currently running, if any.
pub struct ServiceState<S: CollectionStore + 'static> {
    /// The engine serving every request.
    pub engine: Arc<ReassemblyEngine<S>>,
    active_batch: Arc<Mutex<Option<CancelSignal>>>,
    started_at: DateTime<Utc>,
}

impl<S: CollectionStore + 'static> ServiceState<S> {
    /// Create service state around an engine.
    pub fn new(engine: ReassemblyEngine<S>) -> Self {
        Self {
            engine: Arc::new(engine),
            active_batch: Arc::new(Mutex::new(None)),
            started_at: Utc::now(),
        }
    }

    /// Create service state with configuration read from the environment.
    pub fn from_env(store: S) -> Self {
        Self::new(ReassemblyEngine::new(Arc::new(store), EngineConfig::from_env()))
    }

    /// When the state was created.
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Register a new batch, or `None` when one is already registered.
    ///
    /// The registration lasts as long as the returned guard.
    pub(crate) fn begin_batch(&self) -> Option<ActiveBatch> {
        let mut slot = self.active_batch.lock();
        if slot.is_some() {
            return None;
        }
        let signal = CancelSignal::new();
        *slot = Some(signal.clone());
        Some(ActiveBatch {
            slot: Arc::clone(&self.active_batch),
            signal,
        })
    }

    /// Cancel the running batch. Returns false when none is running.
    pub fn cancel_batch(&self) -> bool {
        match self.active_batch.lock().as_ref() {
            Some(signal) => {
                signal.cancel();
                true
            }
            None => false,
        }
    }
}

/// Registration of a running batch; unregisters on drop.
pub(crate) struct ActiveBatch {
    slot: Arc<Mutex<Option<CancelSignal>>>,
    signal: CancelSignal,
}

impl ActiveBatch {
    /// Signal the batch must observe.
    pub(crate) fn signal(&self) -> &CancelSignal {
        &self.signal
    }
}

impl Drop for ActiveBatch {
    fn drop(&mut self) {
        let mut slot = self.slot.lock();
        // Only clear the slot if it still holds this batch.
        if slot.as_ref().is_some_and(|s| s.same_as(&self.signal)) {
            *slot = None;
        }
    }
}

impl<S: CollectionStore + 'static> Clone for ServiceState<S> {
    fn clone(&self) -> Self {
        Self {
            engine: Arc::clone(&self.engine),
            active_batch: Arc::clone(&self.active_batch),
            started_at: self.started_at,
        }
    }
}
