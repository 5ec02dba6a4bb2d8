use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::events::{CancelReason, RunEvent, RunKind, RunStatus};
use super::handle::Handle;
use crate::exec::EventStream;

/// What to do when a run of the same kind already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Admission {
    /// Cancel the active run and start a new one.
    Supersede,
    /// Keep an active or successfully completed run; start only otherwise.
    Reuse,
}

/// Owns the latest handle per run kind.
///
/// Admission is a check-and-swap under one write lock, so concurrent callers
/// can never both start a run of the same kind.
#[derive(Debug)]
pub(crate) struct Supervisor {
    slots: RwLock<HashMap<RunKind, Arc<Handle>>>,
    capacity: usize,
}

impl Supervisor {
    /// `capacity` is the per-handle event retention cap (0 = unbounded).
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
            capacity,
        }
    }

    /// Admits a run of `kind` and returns its handle.
    ///
    /// `factory` builds the event source from the new run's cancellation
    /// token. It is only called when a new run is actually started.
    pub async fn start_run<F>(&self, kind: RunKind, admission: Admission, factory: F) -> Arc<Handle>
    where
        F: FnOnce(CancellationToken) -> EventStream<RunEvent>,
    {
        let mut slots = self.slots.write().await;

        if let Some(existing) = slots.get(&kind) {
            match admission {
                Admission::Reuse
                    if existing.is_active() || existing.status() == RunStatus::Completed =>
                {
                    info!("Reusing {} run {}", kind, existing.id());
                    return Arc::clone(existing);
                }
                Admission::Supersede if existing.is_active() => {
                    info!("Superseding {} run {}", kind, existing.id());
                    existing.retire(CancelReason::Superseded, Some(RunEvent::Superseded));
                }
                _ => {}
            }
        }

        let cancel = CancellationToken::new();
        let source = factory(cancel.clone());
        let handle = Handle::spawn(kind, source, cancel, self.capacity);
        slots.insert(kind, Arc::clone(&handle));
        handle
    }

    /// Stops the active run of `kind` at the user's request.
    ///
    /// Returns false if nothing was running.
    pub async fn stop_run(&self, kind: RunKind, notice: Option<RunEvent>) -> bool {
        let slots = self.slots.write().await;
        let Some(handle) = slots.get(&kind) else {
            return false;
        };

        let stopped = handle.retire(CancelReason::UserRequested, notice);
        if stopped {
            info!("Stopped {} run {}", kind, handle.id());
        }
        stopped
    }

    /// The active handle of `kind`, if any.
    pub async fn active(&self, kind: RunKind) -> Option<Arc<Handle>> {
        self.slots
            .read()
            .await
            .get(&kind)
            .filter(|handle| handle.is_active())
            .cloned()
    }

    /// The most recent handle of `kind`, active or not.
    #[cfg(test)]
    pub async fn latest(&self, kind: RunKind) -> Option<Arc<Handle>> {
        self.slots.read().await.get(&kind).cloned()
    }
}
