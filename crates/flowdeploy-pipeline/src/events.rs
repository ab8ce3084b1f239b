//! Worker event system for observability.
//!
//! Emits [`WorkerEvent`]s via a [`tokio::sync::broadcast`] channel so that
//! observers (loggers, tests, dashboards) can follow task processing and
//! health sweeps without coupling to the worker internals.

use serde::{Deserialize, Serialize};

/// Events emitted while processing tasks and checking deployment health.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WorkerEvent {
    TaskReceived {
        task_id: String,
        process_instance_id: String,
    },
    PipelineCreated {
        module_id: String,
        pipeline_id: String,
    },
    PipelineUpdated {
        module_id: String,
        pipeline_id: String,
        revision: i64,
    },
    TaskCompleted {
        task_id: String,
        pipeline_id: String,
    },
    TaskFailed {
        task_id: String,
        error: String,
        compensated: usize,
    },
    ResourceDeleted {
        module_id: String,
        url: String,
        not_found: bool,
    },
    CompensationFailed {
        module_id: String,
        error: String,
    },
    ModuleUnhealthy {
        module_id: String,
        message: String,
    },
    HealthSweepCompleted {
        checked: usize,
        unhealthy: usize,
        inconclusive: usize,
    },
}

/// Cloneable handle publishing [`WorkerEvent`]s to every subscriber.
#[derive(Clone)]
pub struct EventEmitter {
    sender: tokio::sync::broadcast::Sender<WorkerEvent>,
}

impl EventEmitter {
    /// Subscribers lagging more than `capacity` events behind lose the oldest ones.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = tokio::sync::broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish `event`; without subscribers it is dropped.
    pub fn emit(&self, event: WorkerEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<WorkerEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(256)
    }
}

/// Drain every event currently buffered in `rx`.
pub fn drain(rx: &mut tokio::sync::broadcast::Receiver<WorkerEvent>) -> Vec<WorkerEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
