//! Create-or-update decision per task key, with the module revision counter.

use std::sync::Arc;

use serde_json::{json, Map, Value};

use flowdeploy_remote::{DeploymentTarget, ModuleRegistry, Token};
use flowdeploy_types::{
    FlowDeployError, Module, ModuleDeleteInfo, Pipeline, Result, Task,
    MODULE_UPDATE_VERSION_FIELD, PIPELINE_FIELD, PIPELINE_ID_FIELD,
};

use crate::compiler::NodeCompiler;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileAction {
    Created,
    Updated,
}

/// Result of one reconciliation: the module to persist and the task outputs.
#[derive(Debug, Clone)]
pub struct Reconciliation {
    pub action: ReconcileAction,
    pub module: Module,
    pub pipeline_id: String,
    pub revision: i64,
    pub outputs: Map<String, Value>,
}

/// Next value of the update revision counter.
///
/// A missing counter starts at 1. A stored counter that is not a non-negative
/// integer, or that cannot be incremented, is reset to 1.
pub fn next_revision(module: &Module) -> i64 {
    let Some(v) = module.module_data.get(MODULE_UPDATE_VERSION_FIELD) else {
        return 1;
    };
    let next = stored_revision(v).and_then(|n| n.checked_add(1));
    match next {
        Some(n) => n,
        None => {
            let corruption = FlowDeployError::RegistryCorruption {
                module_id: module.id.clone(),
                message: format!("unusable {MODULE_UPDATE_VERSION_FIELD} {v}"),
            };
            tracing::warn!(error = %corruption, "Resetting revision counter");
            1
        }
    }
}

fn stored_revision(v: &Value) -> Option<i64> {
    if let Some(n) = v.as_i64() {
        return (n >= 0).then_some(n);
    }
    let f = v.as_f64()?;
    // `as` saturates, so anything outside the i64 range is rejected up front.
    (f.is_finite() && f >= 0.0 && f < i64::MAX as f64).then(|| f.trunc() as i64)
}

#[derive(Clone)]
pub struct Reconciler {
    compiler: NodeCompiler,
    target: Arc<dyn DeploymentTarget>,
    registry: Arc<dyn ModuleRegistry>,
    module_type: String,
}

impl Reconciler {
    pub fn new(
        compiler: NodeCompiler,
        target: Arc<dyn DeploymentTarget>,
        registry: Arc<dyn ModuleRegistry>,
        module_type: impl Into<String>,
    ) -> Self {
        Self {
            compiler,
            target,
            registry,
            module_type: module_type.into(),
        }
    }

    pub fn compiler(&self) -> &NodeCompiler {
        &self.compiler
    }

    pub fn module_type(&self) -> &str {
        &self.module_type
    }

    /// Create a new pipeline, or update the one previously deployed under `key`.
    ///
    /// Without a key every execution creates.
    pub async fn reconcile(
        &self,
        token: &Token,
        task: &Task,
        key: Option<&str>,
    ) -> Result<Reconciliation> {
        let Some(key) = key else {
            return self.create(token, task, Vec::new(), task.module_id()).await;
        };

        let Some(existing) = self.find_existing(&task.process_instance_id, key).await? else {
            return self
                .create(token, task, vec![key.to_string()], task.module_id())
                .await;
        };

        match existing.stored_pipeline_id().map(str::to_string) {
            Some(pipeline_id) => self.update(token, task, existing, pipeline_id).await,
            None => {
                let corruption = FlowDeployError::RegistryCorruption {
                    module_id: existing.id.clone(),
                    message: format!("no usable {PIPELINE_ID_FIELD}"),
                };
                tracing::warn!(
                    key,
                    error = %corruption,
                    "Creating a new pipeline in place of the stored one"
                );
                let keys = if existing.keys.is_empty() {
                    vec![key.to_string()]
                } else {
                    existing.keys.clone()
                };
                self.create(token, task, keys, existing.id).await
            }
        }
    }

    async fn find_existing(&self, process_instance_id: &str, key: &str) -> Result<Option<Module>> {
        let mut found = self
            .registry
            .find(process_instance_id, key, &self.module_type)
            .await?;
        tracing::debug!(
            process_instance_id,
            key,
            module_type = %self.module_type,
            matches = found.len(),
            "Existing module lookup"
        );
        if found.len() > 1 {
            tracing::warn!(
                process_instance_id,
                key,
                matches = found.len(),
                "More than one existing module found, using the first"
            );
        }
        if found.is_empty() {
            Ok(None)
        } else {
            Ok(Some(found.swap_remove(0)))
        }
    }

    async fn create(
        &self,
        token: &Token,
        task: &Task,
        keys: Vec<String>,
        module_id: String,
    ) -> Result<Reconciliation> {
        let request = self.compiler.compile_request(token, task).await?;
        let pipeline = self.target.create(token, &request).await?;
        let pipeline_id = pipeline.id.to_string();
        tracing::info!(
            pipeline_id = %pipeline_id,
            module_id = %module_id,
            name = %request.name,
            "Pipeline created"
        );

        let mut module_data = Map::new();
        module_data.insert(PIPELINE_ID_FIELD.into(), json!(pipeline_id));
        module_data.insert(PIPELINE_FIELD.into(), pipeline_value(&pipeline)?);
        module_data.insert(MODULE_UPDATE_VERSION_FIELD.into(), json!(1));

        let module = Module {
            id: module_id,
            process_instance_id: task.process_instance_id.clone(),
            keys,
            module_type: self.module_type.clone(),
            module_data,
            delete_info: Some(ModuleDeleteInfo {
                url: self.target.resource_url(&pipeline_id),
                user_id: token.user_id.clone(),
            }),
        };
        Ok(Reconciliation {
            action: ReconcileAction::Created,
            module,
            outputs: outputs(&pipeline_id),
            pipeline_id,
            revision: 1,
        })
    }

    async fn update(
        &self,
        token: &Token,
        task: &Task,
        mut module: Module,
        pipeline_id: String,
    ) -> Result<Reconciliation> {
        let revision = next_revision(&module);
        module
            .module_data
            .insert(MODULE_UPDATE_VERSION_FIELD.into(), json!(revision));

        let mut request = self.compiler.compile_request(token, task).await?;
        request.id = Some(pipeline_id.clone());
        let pipeline = self.target.update(token, &request).await?;
        tracing::info!(
            pipeline_id = %pipeline_id,
            module_id = %module.id,
            revision,
            "Pipeline updated"
        );

        module
            .module_data
            .insert(PIPELINE_FIELD.into(), pipeline_value(&pipeline)?);
        if module.delete_info.is_none() {
            module.delete_info = Some(ModuleDeleteInfo {
                url: self.target.resource_url(&pipeline_id),
                user_id: token.user_id.clone(),
            });
        }
        module.process_instance_id = task.process_instance_id.clone();

        Ok(Reconciliation {
            action: ReconcileAction::Updated,
            module,
            outputs: outputs(&pipeline_id),
            pipeline_id,
            revision,
        })
    }
}

fn pipeline_value(pipeline: &Pipeline) -> Result<Value> {
    Ok(serde_json::to_value(pipeline)?)
}

fn outputs(pipeline_id: &str) -> Map<String, Value> {
    let mut outputs = Map::new();
    outputs.insert(PIPELINE_ID_FIELD.into(), json!(pipeline_id));
    outputs
}
