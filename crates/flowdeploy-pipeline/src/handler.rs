//! Task handler trait and the analytics pipeline handler.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use flowdeploy_remote::{ModuleRegistry, TokenExchange};
use flowdeploy_types::{Module, Result, Task, RESERVED_MODULE_DATA_KEYS};

use crate::events::{EventEmitter, WorkerEvent};
use crate::params::ParamExtractor;
use crate::reconciler::{ReconcileAction, Reconciler};

// ---------------------------------------------------------------------------
// Attempt
// ---------------------------------------------------------------------------

/// Modules created or retained during one task attempt.
///
/// Handlers record a module as soon as its remote call succeeded, so the
/// worker knows exactly what to compensate if a later step fails.
#[derive(Debug, Clone, Default)]
pub struct Attempt {
    modules: Vec<Module>,
}

impl Attempt {
    pub fn record(&mut self, module: Module) {
        self.modules.push(module);
    }

    pub fn modules(&self) -> &[Module] {
        &self.modules
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}

// ---------------------------------------------------------------------------
// TaskHandler trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// The module type this handler produces (e.g. "analytics").
    fn module_type(&self) -> &str;

    /// Execute one task, recording produced modules in `attempt`; returns the task outputs.
    async fn handle(&self, task: &Task, attempt: &mut Attempt) -> Result<Map<String, Value>>;
}

// ---------------------------------------------------------------------------
// AnalyticsHandler
// ---------------------------------------------------------------------------

/// Deploys or updates one analytics pipeline per task.
pub struct AnalyticsHandler {
    reconciler: Reconciler,
    registry: Arc<dyn ModuleRegistry>,
    tokens: Arc<dyn TokenExchange>,
    params: ParamExtractor,
    events: EventEmitter,
}

impl AnalyticsHandler {
    pub fn new(
        reconciler: Reconciler,
        registry: Arc<dyn ModuleRegistry>,
        tokens: Arc<dyn TokenExchange>,
        events: EventEmitter,
    ) -> Self {
        let params = reconciler.compiler().params().clone();
        Self {
            reconciler,
            registry,
            tokens,
            params,
            events,
        }
    }
}

/// Overlay user module data onto system module data; reserved keys are never overwritten.
pub fn merge_module_data(system: &mut Map<String, Value>, user: Map<String, Value>) {
    for (key, value) in user {
        if RESERVED_MODULE_DATA_KEYS.contains(&key.as_str()) {
            tracing::warn!(key = %key, "Ignoring user module data for reserved key");
            continue;
        }
        system.insert(key, value);
    }
}

#[async_trait]
impl TaskHandler for AnalyticsHandler {
    fn module_type(&self) -> &str {
        self.reconciler.module_type()
    }

    async fn handle(&self, task: &Task, attempt: &mut Attempt) -> Result<Map<String, Value>> {
        let user_id = self.registry.instance_user(&task.process_instance_id).await?;
        let token = self.tokens.exchange(&user_id).await?;
        let key = self.params.module_key(task);
        let user_data = self.params.module_data(task)?;

        let mut reconciliation = self
            .reconciler
            .reconcile(&token, task, key.as_deref())
            .await?;
        merge_module_data(&mut reconciliation.module.module_data, user_data);

        let module_id = reconciliation.module.id.clone();
        attempt.record(reconciliation.module);
        self.events.emit(match reconciliation.action {
            ReconcileAction::Created => WorkerEvent::PipelineCreated {
                module_id,
                pipeline_id: reconciliation.pipeline_id,
            },
            ReconcileAction::Updated => WorkerEvent::PipelineUpdated {
                module_id,
                pipeline_id: reconciliation.pipeline_id,
                revision: reconciliation.revision,
            },
        });
        Ok(reconciliation.outputs)
    }
}
