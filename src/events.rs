//! Fire-and-forget status notifications
//!
//! Services publish [`NetworkEvent`]s to an [`EventBus`], which fans them out
//! to every subscribed [`EventSink`]. Sinks are invoked after the bus lock is
//! dropped, so a sink may subscribe further sinks without deadlocking.

use std::sync::{Arc, RwLock};

use serde::Serialize;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EventKind {
    ConnectionStarted,
    ConnectionCompleted,
    EchoStarted,
    EchoCompleted,
    QueryStarted,
    QueryProgress,
    QueryCompleted,
    RetrieveStarted,
    RetrieveProgress,
    RetrieveCompleted,
    StoreStarted,
    StoreProgress,
    StoreCompleted,
    StorageReceived,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NetworkEvent {
    pub kind: EventKind,
    pub message: String,
    /// 0.0 ..= 1.0
    pub progress: f32,
}

impl NetworkEvent {
    pub fn new(kind: EventKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            progress: 0.0,
        }
    }

    pub fn with_progress(mut self, progress: f32) -> Self {
        self.progress = progress.clamp(0.0, 1.0);
        self
    }
}

/// Receiver of network events
pub trait EventSink: Send + Sync {
    fn on_event(&self, event: &NetworkEvent);
}

impl<F> EventSink for F
where
    F: Fn(&NetworkEvent) + Send + Sync,
{
    fn on_event(&self, event: &NetworkEvent) {
        self(event)
    }
}

#[derive(Default)]
pub struct EventBus {
    sinks: RwLock<Vec<Arc<dyn EventSink>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, sink: Arc<dyn EventSink>) {
        self.sinks
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(sink);
    }

    pub fn emit(&self, event: NetworkEvent) {
        let sinks: Vec<Arc<dyn EventSink>> = self
            .sinks
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        for sink in sinks {
            sink.on_event(&event);
        }
    }

    pub fn emit_kind(&self, kind: EventKind, message: impl Into<String>) {
        self.emit(NetworkEvent::new(kind, message));
    }

    pub fn progress(&self, kind: EventKind, message: impl Into<String>, progress: f32) {
        self.emit(NetworkEvent::new(kind, message).with_progress(progress));
    }

    pub fn error(&self, message: impl Into<String>) {
        self.emit(NetworkEvent::new(EventKind::Error, message));
    }

    pub fn sink_count(&self) -> usize {
        self.sinks
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("sinks", &self.sink_count())
            .finish()
    }
}

/// Writes every event to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn on_event(&self, event: &NetworkEvent) {
        match event.kind {
            EventKind::Error => warn!(kind = ?event.kind, "{}", event.message),
            _ => info!(kind = ?event.kind, progress = event.progress, "{}", event.message),
        }
    }
}
