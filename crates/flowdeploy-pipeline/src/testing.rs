//! In-memory collaborators for tests and dry runs.
//!
//! Every fake records what it was asked to do so tests can assert on the
//! exact remote traffic a task produced.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use serde_json::{Map, Value};

use flowdeploy_remote::{
    Catalog, DeleteOutcome, DeploymentTarget, FlowParser, ModuleRegistry, PipelineStatus,
    TaskSource, Token, TokenExchange,
};
use flowdeploy_types::{
    Device, FilterCriteria, FlowDeployError, FlowInput, HealthFinding, Module, PathOption,
    PathOptions, Pipeline, PipelineRequest, Result, Task,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn not_found(service: &str, endpoint: String) -> FlowDeployError {
    FlowDeployError::unexpected_response(service, endpoint, 404, "not found")
}

// ---------------------------------------------------------------------------
// FakeCatalog
// ---------------------------------------------------------------------------

/// Device groups, devices, path options, and import topics held in maps.
#[derive(Debug, Default)]
pub struct FakeCatalog {
    groups: HashMap<String, Vec<String>>,
    devices: HashMap<String, Device>,
    path_options: HashMap<(String, String), Vec<PathOption>>,
    imports: HashMap<String, String>,
}

/// Criteria compare equal regardless of an omitted interaction.
fn criteria_key(criteria: &[FilterCriteria]) -> String {
    let normalized: Vec<FilterCriteria> = criteria
        .iter()
        .map(FilterCriteria::with_default_interaction)
        .collect();
    serde_json::to_string(&normalized).unwrap_or_default()
}

impl FakeCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_group(mut self, group_id: &str, members: &[&str]) -> Self {
        self.groups.insert(
            group_id.to_string(),
            members.iter().map(|m| m.to_string()).collect(),
        );
        self
    }

    pub fn with_device(mut self, device_id: &str, device_type_id: &str) -> Self {
        self.devices.insert(
            device_id.to_string(),
            Device {
                id: device_id.to_string(),
                name: device_id.to_string(),
                device_type_id: device_type_id.to_string(),
            },
        );
        self
    }

    /// Options returned for `device_type_id` when queried with `criteria`.
    pub fn with_path_options(
        mut self,
        criteria: &[FilterCriteria],
        device_type_id: &str,
        options: Vec<PathOption>,
    ) -> Self {
        self.path_options
            .insert((criteria_key(criteria), device_type_id.to_string()), options);
        self
    }

    pub fn with_import_topic(mut self, import_id: &str, topic: &str) -> Self {
        self.imports.insert(import_id.to_string(), topic.to_string());
        self
    }
}

#[async_trait]
impl Catalog for FakeCatalog {
    async fn device_group_members(&self, _token: &Token, group_id: &str) -> Result<Vec<String>> {
        self.groups
            .get(group_id)
            .cloned()
            .ok_or_else(|| not_found("device-repository", format!("device-groups/{group_id}")))
    }

    /// Known devices in request order; unknown ids are dropped.
    async fn devices(&self, _token: &Token, device_ids: &[String]) -> Result<Vec<Device>> {
        Ok(device_ids
            .iter()
            .filter_map(|id| self.devices.get(id).cloned())
            .collect())
    }

    async fn path_options(
        &self,
        _token: &Token,
        criteria: &[FilterCriteria],
        device_type_ids: &[String],
    ) -> Result<PathOptions> {
        let key = criteria_key(criteria);
        let mut options = PathOptions::new();
        for type_id in device_type_ids {
            if let Some(found) = self.path_options.get(&(key.clone(), type_id.clone())) {
                options.insert(type_id.clone(), found.clone());
            }
        }
        Ok(options)
    }

    async fn import_topic(&self, _token: &Token, import_id: &str) -> Result<String> {
        self.imports
            .get(import_id)
            .cloned()
            .ok_or_else(|| not_found("import-deploy", format!("instances/{import_id}")))
    }
}

// ---------------------------------------------------------------------------
// FakeFlowParser
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct FakeFlowParser {
    flows: HashMap<String, Vec<FlowInput>>,
    calls: Arc<AtomicUsize>,
}

impl FakeFlowParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_flow(mut self, flow_id: &str, inputs: Vec<FlowInput>) -> Self {
        self.flows.insert(flow_id.to_string(), inputs);
        self
    }

    /// Shared counter of `flow_inputs` calls; stays valid after the parser is moved.
    pub fn calls(&self) -> Arc<AtomicUsize> {
        self.calls.clone()
    }
}

#[async_trait]
impl FlowParser for FakeFlowParser {
    async fn flow_inputs(&self, _token: &Token, flow_id: &str) -> Result<Vec<FlowInput>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.flows
            .get(flow_id)
            .cloned()
            .ok_or_else(|| not_found("flow-parser", format!("flow/getinputs/{flow_id}")))
    }
}

// ---------------------------------------------------------------------------
// RecordingTarget
// ---------------------------------------------------------------------------

/// One call received by [`RecordingTarget`].
#[derive(Debug, Clone, PartialEq)]
pub enum TargetCall {
    Create(PipelineRequest),
    Update(PipelineRequest),
    Delete { url: String, user: Option<String> },
    Status(String),
}

/// Deployment target keeping live pipelines in memory.
#[derive(Debug)]
pub struct RecordingTarget {
    base_url: String,
    calls: Mutex<Vec<TargetCall>>,
    pipelines: Mutex<HashMap<String, bool>>,
    status_errors: Mutex<HashMap<String, u16>>,
    failing_deletes: Mutex<HashSet<String>>,
    fail_create: AtomicBool,
    fail_update: AtomicBool,
}

impl RecordingTarget {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            calls: Mutex::new(Vec::new()),
            pipelines: Mutex::new(HashMap::new()),
            status_errors: Mutex::new(HashMap::new()),
            failing_deletes: Mutex::new(HashSet::new()),
            fail_create: AtomicBool::new(false),
            fail_update: AtomicBool::new(false),
        }
    }

    pub fn calls(&self) -> Vec<TargetCall> {
        lock(&self.calls).clone()
    }

    /// Register a running pipeline and return its resource URL.
    pub fn seed_pipeline(&self, id: &str) -> String {
        lock(&self.pipelines).insert(id.to_string(), true);
        self.resource_url(id)
    }

    pub fn set_running(&self, id: &str, running: bool) {
        lock(&self.pipelines).insert(id.to_string(), running);
    }

    /// Status checks of `id` answer with HTTP `status`.
    pub fn fail_status(&self, id: &str, status: u16) {
        lock(&self.status_errors).insert(id.to_string(), status);
    }

    pub fn fail_delete_of(&self, url: &str) {
        lock(&self.failing_deletes).insert(url.to_string());
    }

    pub fn fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    pub fn fail_update(&self, fail: bool) {
        self.fail_update.store(fail, Ordering::SeqCst);
    }

    /// Ids of pipelines that currently exist, sorted.
    pub fn live_pipelines(&self) -> Vec<String> {
        let mut ids: Vec<String> = lock(&self.pipelines).keys().cloned().collect();
        ids.sort();
        ids
    }

    fn record(&self, call: TargetCall) {
        lock(&self.calls).push(call);
    }

    fn server_error(&self, endpoint: &str) -> FlowDeployError {
        FlowDeployError::unexpected_response("flow-engine", endpoint, 500, "internal error")
    }
}

#[async_trait]
impl DeploymentTarget for RecordingTarget {
    async fn create(&self, _token: &Token, request: &PipelineRequest) -> Result<Pipeline> {
        self.record(TargetCall::Create(request.clone()));
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(self.server_error("pipeline"));
        }
        let id = uuid::Uuid::new_v4();
        lock(&self.pipelines).insert(id.to_string(), true);
        Ok(Pipeline {
            id,
            name: request.name.clone(),
            description: request.description.clone(),
            operators: Vec::new(),
        })
    }

    async fn update(&self, _token: &Token, request: &PipelineRequest) -> Result<Pipeline> {
        self.record(TargetCall::Update(request.clone()));
        if self.fail_update.load(Ordering::SeqCst) {
            return Err(self.server_error("pipeline"));
        }
        let raw_id = request
            .id
            .as_deref()
            .ok_or_else(|| FlowDeployError::Other("update request without id".into()))?;
        if !lock(&self.pipelines).contains_key(raw_id) {
            return Err(not_found("flow-engine", format!("pipeline/{raw_id}")));
        }
        let id = uuid::Uuid::parse_str(raw_id)
            .map_err(|e| FlowDeployError::Other(format!("invalid pipeline id '{raw_id}': {e}")))?;
        Ok(Pipeline {
            id,
            name: request.name.clone(),
            description: request.description.clone(),
            operators: Vec::new(),
        })
    }

    fn resource_url(&self, resource_id: &str) -> String {
        format!("{}/pipeline/{resource_id}", self.base_url)
    }

    async fn delete_at(&self, url: &str, token: Option<&Token>) -> Result<DeleteOutcome> {
        self.record(TargetCall::Delete {
            url: url.to_string(),
            user: token.map(|t| t.user_id.clone()),
        });
        if lock(&self.failing_deletes).contains(url) {
            return Err(self.server_error(url));
        }
        let id = url.rsplit('/').next().unwrap_or_default();
        Ok(match lock(&self.pipelines).remove(id) {
            Some(_) => DeleteOutcome::Deleted,
            None => DeleteOutcome::NotFound,
        })
    }

    async fn status(&self, _token: &Token, resource_id: &str) -> Result<PipelineStatus> {
        self.record(TargetCall::Status(resource_id.to_string()));
        let endpoint = format!("pipeline/{resource_id}");
        if let Some(&status) = lock(&self.status_errors).get(resource_id) {
            return Err(FlowDeployError::unexpected_response(
                "flow-engine",
                endpoint,
                status,
                "status failed",
            ));
        }
        match lock(&self.pipelines).get(resource_id) {
            Some(&running) => Ok(PipelineStatus {
                running,
                detail: None,
            }),
            None => Err(not_found("flow-engine", endpoint)),
        }
    }
}

// ---------------------------------------------------------------------------
// MemoryRegistry
// ---------------------------------------------------------------------------

/// Module registry kept in memory; every process instance belongs to `owner`
/// unless set otherwise.
#[derive(Debug)]
pub struct MemoryRegistry {
    modules: Mutex<Vec<Module>>,
    users: Mutex<HashMap<String, String>>,
    default_user: Option<String>,
    findings: Mutex<Vec<HealthFinding>>,
    fail_upserts: AtomicBool,
}

impl Default for MemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self {
            modules: Mutex::new(Vec::new()),
            users: Mutex::new(HashMap::new()),
            default_user: Some("owner".into()),
            findings: Mutex::new(Vec::new()),
            fail_upserts: AtomicBool::new(false),
        }
    }

    /// Registry without a fallback owner.
    pub fn without_default_user(mut self) -> Self {
        self.default_user = None;
        self
    }

    pub fn set_instance_user(&self, process_instance_id: &str, user_id: &str) {
        lock(&self.users).insert(process_instance_id.to_string(), user_id.to_string());
    }

    pub fn fail_upserts(&self, fail: bool) {
        self.fail_upserts.store(fail, Ordering::SeqCst);
    }

    pub fn modules(&self) -> Vec<Module> {
        lock(&self.modules).clone()
    }

    pub fn findings(&self) -> Vec<HealthFinding> {
        lock(&self.findings).clone()
    }
}

#[async_trait]
impl ModuleRegistry for MemoryRegistry {
    async fn instance_user(&self, process_instance_id: &str) -> Result<String> {
        lock(&self.users)
            .get(process_instance_id)
            .cloned()
            .or_else(|| self.default_user.clone())
            .ok_or_else(|| {
                FlowDeployError::Other(format!(
                    "no user recorded for process instance '{process_instance_id}'"
                ))
            })
    }

    async fn find(
        &self,
        process_instance_id: &str,
        key: &str,
        module_type: &str,
    ) -> Result<Vec<Module>> {
        Ok(lock(&self.modules)
            .iter()
            .filter(|m| {
                m.process_instance_id == process_instance_id
                    && m.module_type == module_type
                    && m.has_key(key)
            })
            .cloned()
            .collect())
    }

    async fn upsert(&self, module: &Module) -> Result<()> {
        if self.fail_upserts.load(Ordering::SeqCst) {
            return Err(FlowDeployError::Other("registry unavailable".into()));
        }
        let mut modules = lock(&self.modules);
        match modules.iter_mut().find(|m| m.id == module.id) {
            Some(existing) => *existing = module.clone(),
            None => modules.push(module.clone()),
        }
        Ok(())
    }

    async fn remove(&self, module_id: &str) -> Result<bool> {
        let mut modules = lock(&self.modules);
        let before = modules.len();
        modules.retain(|m| m.id != module_id);
        Ok(modules.len() != before)
    }

    async fn list_by_type(&self, module_type: &str) -> Result<Vec<Module>> {
        Ok(lock(&self.modules)
            .iter()
            .filter(|m| m.module_type == module_type)
            .cloned()
            .collect())
    }

    async fn report_health(&self, finding: &HealthFinding) -> Result<()> {
        let mut findings = lock(&self.findings);
        match findings.iter_mut().find(|f| f.module_id == finding.module_id) {
            Some(existing) => *existing = finding.clone(),
            None => findings.push(finding.clone()),
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// StaticTokens
// ---------------------------------------------------------------------------

/// Hands out the same JWT for every user; listed users are refused.
#[derive(Debug, Default)]
pub struct StaticTokens {
    jwt: String,
    refused: Mutex<HashSet<String>>,
}

impl StaticTokens {
    pub fn new(jwt: &str) -> Self {
        Self {
            jwt: jwt.to_string(),
            refused: Mutex::new(HashSet::new()),
        }
    }

    pub fn refuse(&self, user_id: &str) {
        lock(&self.refused).insert(user_id.to_string());
    }
}

#[async_trait]
impl TokenExchange for StaticTokens {
    async fn exchange(&self, user_id: &str) -> Result<Token> {
        if lock(&self.refused).contains(user_id) {
            return Err(FlowDeployError::unexpected_response(
                "auth",
                "token",
                401,
                "unauthorized",
            ));
        }
        Ok(Token::new(self.jwt.clone(), user_id))
    }
}

// ---------------------------------------------------------------------------
// RecordingTaskSource
// ---------------------------------------------------------------------------

/// Hands out its queued tasks in one batch and records every report.
#[derive(Debug, Default)]
pub struct RecordingTaskSource {
    pending: Mutex<VecDeque<Task>>,
    completed: Mutex<Vec<(String, Map<String, Value>)>>,
    failed: Mutex<Vec<(String, String)>>,
    fail_completion: AtomicBool,
}

impl RecordingTaskSource {
    pub fn new(tasks: Vec<Task>) -> Self {
        Self {
            pending: Mutex::new(tasks.into()),
            ..Default::default()
        }
    }

    pub fn push(&self, task: Task) {
        lock(&self.pending).push_back(task);
    }

    /// Completion reports fail while set.
    pub fn fail_completion(&self, fail: bool) {
        self.fail_completion.store(fail, Ordering::SeqCst);
    }

    pub fn completed(&self) -> Vec<(String, Map<String, Value>)> {
        lock(&self.completed).clone()
    }

    pub fn failed(&self) -> Vec<(String, String)> {
        lock(&self.failed).clone()
    }
}

#[async_trait]
impl TaskSource for RecordingTaskSource {
    async fn fetch(&self) -> Result<Vec<Task>> {
        Ok(lock(&self.pending).drain(..).collect())
    }

    async fn complete(&self, task: &Task, outputs: &Map<String, Value>) -> Result<()> {
        if self.fail_completion.load(Ordering::SeqCst) {
            return Err(FlowDeployError::UpstreamUnavailable {
                service: "task-source".into(),
                endpoint: "complete".into(),
                message: "connection refused".into(),
            });
        }
        lock(&self.completed).push((task.id.clone(), outputs.clone()));
        Ok(())
    }

    async fn fail(&self, task: &Task, message: &str) -> Result<()> {
        lock(&self.failed).push((task.id.clone(), message.to_string()));
        Ok(())
    }
}
