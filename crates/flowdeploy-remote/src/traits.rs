use async_trait::async_trait;

use flowdeploy_types::{
    Device, FilterCriteria, FlowInput, HealthFinding, Module, PathOptions, Pipeline,
    PipelineRequest, Result, Task,
};

use crate::Token;

// ---------------------------------------------------------------------------
// Catalog
// ---------------------------------------------------------------------------

/// Device, device-group, and import-stream metadata.
#[async_trait]
pub trait Catalog: Send + Sync {
    /// Member device ids of a device group.
    async fn device_group_members(&self, token: &Token, group_id: &str) -> Result<Vec<String>>;

    /// Devices (with their device type) for the given ids.
    async fn devices(&self, token: &Token, device_ids: &[String]) -> Result<Vec<Device>>;

    /// Eligible services and paths per device type for the given criteria.
    async fn path_options(
        &self,
        token: &Token,
        criteria: &[FilterCriteria],
        device_type_ids: &[String],
    ) -> Result<PathOptions>;

    /// Topic an import instance publishes to.
    async fn import_topic(&self, token: &Token, import_id: &str) -> Result<String>;
}

// ---------------------------------------------------------------------------
// DeploymentTarget
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    NotFound,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineStatus {
    pub running: bool,
    pub detail: Option<serde_json::Value>,
}

/// The remote pipeline execution engine.
#[async_trait]
pub trait DeploymentTarget: Send + Sync {
    async fn create(&self, token: &Token, request: &PipelineRequest) -> Result<Pipeline>;

    /// Full replacement of an existing pipeline; `request.id` must be set.
    async fn update(&self, token: &Token, request: &PipelineRequest) -> Result<Pipeline>;

    /// URL under which the resource can later be deleted.
    fn resource_url(&self, resource_id: &str) -> String;

    /// Delete whatever lives at `url`, acting as `token` when given.
    async fn delete_at(&self, url: &str, token: Option<&Token>) -> Result<DeleteOutcome>;

    async fn delete(&self, token: &Token, resource_id: &str) -> Result<DeleteOutcome> {
        self.delete_at(&self.resource_url(resource_id), Some(token))
            .await
    }

    async fn status(&self, token: &Token, resource_id: &str) -> Result<PipelineStatus>;
}

// ---------------------------------------------------------------------------
// FlowParser
// ---------------------------------------------------------------------------

/// Looks up the input nodes (ports and config names) of a flow.
#[async_trait]
pub trait FlowParser: Send + Sync {
    async fn flow_inputs(&self, token: &Token, flow_id: &str) -> Result<Vec<FlowInput>>;
}

// ---------------------------------------------------------------------------
// ModuleRegistry
// ---------------------------------------------------------------------------

/// Durable record of which task execution produced which remote resource.
#[async_trait]
pub trait ModuleRegistry: Send + Sync {
    /// The user owning a process instance.
    async fn instance_user(&self, process_instance_id: &str) -> Result<String>;

    /// Modules of a process instance carrying `key` with the given type.
    async fn find(
        &self,
        process_instance_id: &str,
        key: &str,
        module_type: &str,
    ) -> Result<Vec<Module>>;

    /// Insert or replace a module by id.
    async fn upsert(&self, module: &Module) -> Result<()>;

    /// Remove a module; returns `false` if it was not present.
    async fn remove(&self, module_id: &str) -> Result<bool>;

    async fn list_by_type(&self, module_type: &str) -> Result<Vec<Module>>;

    async fn report_health(&self, finding: &HealthFinding) -> Result<()>;
}

// ---------------------------------------------------------------------------
// TaskSource
// ---------------------------------------------------------------------------

/// Supplies tasks and receives their results.
#[async_trait]
pub trait TaskSource: Send + Sync {
    /// Fetch the next batch of tasks; an empty batch means nothing is pending.
    async fn fetch(&self) -> Result<Vec<Task>>;

    async fn complete(
        &self,
        task: &Task,
        outputs: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<()>;

    async fn fail(&self, task: &Task, message: &str) -> Result<()>;
}
