//! Stream hub for one run.
//!
//! A [`Handle`] drains an event source on its own task, keeps a buffer of
//! what it has seen and forwards every event to the attached listeners. A
//! listener attaching mid-run gets the buffer replayed and then live events.
//! Replay and registration happen under the same lock as append, so no event
//! can fall between the two.

use futures_util::stream::{self, StreamExt};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::events::{CancelReason, RunEvent, RunKind, RunStatus};
use crate::exec::EventStream;

pub(crate) struct Handle {
    id: String,
    kind: RunKind,
    cancel: CancellationToken,
    /// Max buffered events; 0 keeps everything.
    capacity: usize,
    state: Mutex<HubState>,
    status: watch::Sender<RunStatus>,
}

#[derive(Default)]
struct HubState {
    buffer: VecDeque<RunEvent>,
    listeners: HashMap<u64, mpsc::UnboundedSender<RunEvent>>,
    next_listener: u64,
    active: bool,
    /// No more events are accepted once set.
    sealed: bool,
    cancel_reason: Option<CancelReason>,
    failed: bool,
    finalized: bool,
}

impl HubState {
    fn broadcast(&mut self, event: &RunEvent) {
        self.listeners.retain(|id, tx| {
            let delivered = tx.send(event.clone()).is_ok();
            if !delivered {
                debug!("Listener {} detached", id);
            }
            delivered
        });
    }

    fn record(&mut self, event: RunEvent, capacity: usize) {
        if capacity > 0 && self.buffer.len() >= capacity {
            self.buffer.pop_front();
        }
        self.buffer.push_back(event);
    }
}

impl Handle {
    fn new(kind: RunKind, cancel: CancellationToken, capacity: usize) -> Self {
        let id = uuid::Uuid::new_v4().simple().to_string();
        Self {
            id: id[..8].to_string(),
            kind,
            cancel,
            capacity,
            state: Mutex::new(HubState {
                active: true,
                ..Default::default()
            }),
            status: watch::channel(RunStatus::Active).0,
        }
    }

    /// Creates an active handle and starts consuming `source`.
    pub fn spawn(
        kind: RunKind,
        source: EventStream<RunEvent>,
        cancel: CancellationToken,
        capacity: usize,
    ) -> Arc<Self> {
        let handle = Arc::new(Self::new(kind, cancel, capacity));
        info!("Run {} ({}) active", handle.id, kind);
        tokio::spawn(Arc::clone(&handle).consume(source));
        handle
    }

    async fn consume(self: Arc<Self>, mut source: EventStream<RunEvent>) {
        loop {
            let next = tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                next = source.next() => next,
            };
            match next {
                Some(event) => self.publish(event),
                None => break,
            }
        }

        drop(source);
        self.finalize();
    }

    fn lock(&self) -> MutexGuard<'_, HubState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, event: RunEvent) {
        let mut state = self.lock();
        if state.sealed {
            debug!("Run {} sealed; dropping event", self.id);
            return;
        }
        if event.is_error() {
            state.failed = true;
        }
        state.broadcast(&event);
        state.record(event, self.capacity);
    }

    /// Attaches a listener: buffered events first, then live ones.
    ///
    /// Returns `None` once the run is no longer active.
    pub fn subscribe(&self) -> Option<EventStream<RunEvent>> {
        let mut state = self.lock();
        if !state.active {
            return None;
        }

        let (tx, rx) = mpsc::unbounded_channel();
        for event in &state.buffer {
            let _ = tx.send(event.clone());
        }
        let id = state.next_listener;
        state.next_listener += 1;
        state.listeners.insert(id, tx);
        debug!(
            "Listener {} attached to run {} ({} replayed)",
            id,
            self.id,
            state.buffer.len()
        );

        Some(
            stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|e| (e, rx)) }).boxed(),
        )
    }

    /// Stops the run from outside.
    ///
    /// `notice` is delivered to current listeners as the final event. The
    /// handle stops accepting events and reports inactive immediately; the
    /// consumer task notices the cancellation and finalizes on its own.
    /// Returns false if the run had already ended.
    pub fn retire(&self, reason: CancelReason, notice: Option<RunEvent>) -> bool {
        {
            let mut state = self.lock();
            if !state.active || state.sealed {
                return false;
            }
            if let Some(notice) = notice {
                state.broadcast(&notice);
                state.record(notice, self.capacity);
            }
            state.sealed = true;
            state.active = false;
            state.cancel_reason = Some(reason);
        }

        info!("Run {} ({}) retired: {:?}", self.id, self.kind, reason);
        self.cancel.cancel();
        true
    }

    /// Closes every listener and settles the final status. Runs once.
    fn finalize(&self) {
        let (status, listeners) = {
            let mut state = self.lock();
            if state.finalized {
                return;
            }
            state.finalized = true;
            state.active = false;
            state.sealed = true;

            let status = match state.cancel_reason {
                Some(reason) => reason.status(),
                None if self.cancel.is_cancelled() => RunStatus::UserCancelled,
                None if state.failed => RunStatus::Failed,
                None => RunStatus::Completed,
            };
            self.status.send_replace(status);
            (status, std::mem::take(&mut state.listeners))
        };

        for (id, tx) in listeners {
            if tx.is_closed() {
                debug!("Listener {} already gone", id);
            }
            drop(tx);
        }

        info!("Run {} ({}) finished: {}", self.id, self.kind, status);
    }

    /// Waits for the run to end and returns how it ended.
    pub async fn wait(&self) -> RunStatus {
        let mut rx = self.status.subscribe();
        if let Ok(status) = rx.wait_for(|status| status.is_terminal()).await {
            return *status;
        }
        self.status()
    }

    pub fn status(&self) -> RunStatus {
        *self.status.borrow()
    }

    pub fn is_active(&self) -> bool {
        self.lock().active
    }

    pub fn kind(&self) -> RunKind {
        self.kind
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Snapshot of the retained events.
    #[cfg(test)]
    pub fn buffered(&self) -> Vec<RunEvent> {
        self.lock().buffer.iter().cloned().collect()
    }
}

impl std::fmt::Debug for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}
