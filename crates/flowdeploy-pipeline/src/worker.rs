//! Task loop: fetch, handle, persist, complete; compensate on failure.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use flowdeploy_remote::{ModuleRegistry, TaskSource};
use flowdeploy_types::{FlowDeployError, Result, Task, PIPELINE_ID_FIELD};

use crate::compensator::{CompensationReport, Compensator};
use crate::events::{EventEmitter, WorkerEvent};
use crate::handler::{Attempt, TaskHandler};

/// Final state of one processed task.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Completed {
        outputs: Map<String, Value>,
    },
    Failed {
        error: String,
        compensation: Option<CompensationReport>,
    },
}

impl TaskOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, TaskOutcome::Completed { .. })
    }
}

pub struct Worker {
    source: Arc<dyn TaskSource>,
    handler: Arc<dyn TaskHandler>,
    registry: Arc<dyn ModuleRegistry>,
    compensator: Compensator,
    events: EventEmitter,
    poll_interval: Duration,
}

impl Worker {
    pub fn new(
        source: Arc<dyn TaskSource>,
        handler: Arc<dyn TaskHandler>,
        registry: Arc<dyn ModuleRegistry>,
        compensator: Compensator,
        events: EventEmitter,
    ) -> Self {
        Self {
            source,
            handler,
            registry,
            compensator,
            events,
            poll_interval: Duration::from_secs(1),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn events(&self) -> &EventEmitter {
        &self.events
    }

    /// Process one task end to end. Never returns an error: failures are
    /// reported to the task source and reflected in the outcome.
    pub async fn process(&self, task: &Task) -> TaskOutcome {
        tracing::info!(
            task_id = %task.id,
            process_instance_id = %task.process_instance_id,
            handler = self.handler.module_type(),
            "Task received"
        );
        self.events.emit(WorkerEvent::TaskReceived {
            task_id: task.id.clone(),
            process_instance_id: task.process_instance_id.clone(),
        });

        let mut attempt = Attempt::default();
        match self.execute(task, &mut attempt).await {
            Ok(outputs) => {
                let pipeline_id = outputs
                    .get(PIPELINE_ID_FIELD)
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                tracing::info!(task_id = %task.id, pipeline_id = %pipeline_id, "Task completed");
                self.events.emit(WorkerEvent::TaskCompleted {
                    task_id: task.id.clone(),
                    pipeline_id,
                });
                TaskOutcome::Completed { outputs }
            }
            Err(e) => self.fail(task, &attempt, e).await,
        }
    }

    async fn execute(&self, task: &Task, attempt: &mut Attempt) -> Result<Map<String, Value>> {
        let outputs = self.handler.handle(task, attempt).await?;
        for module in attempt.modules() {
            self.registry.upsert(module).await?;
        }
        self.source.complete(task, &outputs).await?;
        Ok(outputs)
    }

    async fn fail(&self, task: &Task, attempt: &Attempt, error: FlowDeployError) -> TaskOutcome {
        let message = error.to_string();
        if error.is_input_error() {
            tracing::warn!(task_id = %task.id, error = %message, "Task rejected");
        } else if error.is_remote_error() {
            tracing::error!(
                task_id = %task.id,
                status = ?error.http_status(),
                error = %message,
                "Remote call failed"
            );
        } else {
            tracing::error!(task_id = %task.id, error = %message, "Task failed");
        }

        let compensation = if attempt.is_empty() {
            None
        } else {
            Some(self.compensator.compensate(attempt.modules(), &message).await)
        };

        if let Err(e) = self.source.fail(task, &message).await {
            tracing::error!(task_id = %task.id, error = %e, "Failed to report task failure");
        }
        self.events.emit(WorkerEvent::TaskFailed {
            task_id: task.id.clone(),
            error: message.clone(),
            compensated: compensation.as_ref().map_or(0, CompensationReport::removed),
        });
        TaskOutcome::Failed {
            error: message,
            compensation,
        }
    }

    /// Fetch one batch and process it sequentially; returns the number of tasks seen.
    pub async fn poll_once(&self) -> Result<usize> {
        let tasks = self.source.fetch().await?;
        for task in &tasks {
            self.process(task).await;
        }
        Ok(tasks.len())
    }

    /// Poll until the source returns an empty batch; returns the total processed.
    pub async fn drain(&self) -> Result<usize> {
        let mut total = 0;
        loop {
            let n = self.poll_once().await?;
            if n == 0 {
                return Ok(total);
            }
            total += n;
        }
    }

    /// Poll every interval until `shutdown` flips to `true`. A task in flight
    /// is finished before the loop exits.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            "Worker started"
        );
        loop {
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.poll_once().await {
                        tracing::error!(error = %e, "Fetching tasks failed");
                    }
                }
            }
        }
        tracing::info!("Worker stopped");
    }
}
