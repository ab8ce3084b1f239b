//! Data model: selections, criteria, pipeline request records, and registry modules.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::{FlowDeployError, Result};

/// Interaction used when a criterion leaves it unset.
pub const DEFAULT_INTERACTION: &str = "event";

/// Module-data key holding the deployed pipeline's identifier.
pub const PIPELINE_ID_FIELD: &str = "pipeline_id";
/// Module-data key holding the deployed pipeline as returned by the deployment target.
pub const PIPELINE_FIELD: &str = "pipeline";
/// Module-data key holding the update revision counter.
pub const MODULE_UPDATE_VERSION_FIELD: &str = "module_update_version";

/// Module-data keys owned by the worker; user supplied module data never overrides them.
pub const RESERVED_MODULE_DATA_KEYS: [&str; 3] =
    [PIPELINE_ID_FIELD, PIPELINE_FIELD, MODULE_UPDATE_VERSION_FIELD];

// ---------------------------------------------------------------------------
// Criteria
// ---------------------------------------------------------------------------

/// Semantic filter selecting which service/path combinations of a device type qualify.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterCriteria {
    #[serde(default)]
    pub function_id: String,
    #[serde(default)]
    pub device_class_id: String,
    #[serde(default)]
    pub aspect_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interaction: Option<String>,
}

impl FilterCriteria {
    /// Copy of this criterion with `interaction` defaulted to [`DEFAULT_INTERACTION`].
    pub fn with_default_interaction(&self) -> Self {
        let mut c = self.clone();
        if c.interaction.as_deref().map_or(true, str::is_empty) {
            c.interaction = Some(DEFAULT_INTERACTION.to_string());
        }
        c
    }
}

// ---------------------------------------------------------------------------
// Selection
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSelection {
    pub device_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceGroupSelection {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportSelection {
    #[serde(default)]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// User-declared binding of one pipeline input port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    Device(DeviceSelection),
    DeviceGroup(DeviceGroupSelection),
    Import(ImportSelection),
}

/// Wire shape of a selection: three nullable members of which at most one may be set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionOption {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_selection: Option<DeviceSelection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_group_selection: Option<DeviceGroupSelection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub import_selection: Option<ImportSelection>,
}

impl SelectionOption {
    /// Convert to the closed [`Selection`] sum type.
    ///
    /// Returns `Ok(None)` for an empty option; more than one member set is an
    /// `InvalidSelection` error.
    pub fn into_selection(self) -> Result<Option<Selection>> {
        match (
            self.device_selection,
            self.device_group_selection,
            self.import_selection,
        ) {
            (None, None, None) => Ok(None),
            (Some(d), None, None) => Ok(Some(Selection::Device(d))),
            (None, Some(g), None) => Ok(Some(Selection::DeviceGroup(g))),
            (None, None, Some(i)) => Ok(Some(Selection::Import(i))),
            _ => Err(FlowDeployError::InvalidSelection(
                "expected exactly one of device_selection, device_group_selection, import_selection"
                    .into(),
            )),
        }
    }
}

// ---------------------------------------------------------------------------
// Pipeline request records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FilterType {
    #[serde(rename = "deviceId")]
    Device,
    #[serde(rename = "ImportId")]
    Import,
}

impl FilterType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterType::Device => "deviceId",
            FilterType::Import => "ImportId",
        }
    }
}

/// A named port bound to a JSON path inside a topic's payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeValue {
    pub name: String,
    pub path: String,
}

/// A topic-scoped input binding of one pipeline node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeInput {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub filter_ids: String,
    pub filter_type: FilterType,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub topic_name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<NodeValue>,
}

impl NodeInput {
    /// Key under which inputs of one node are merged: `topic_filterType_filterIds`.
    pub fn group_key(&self) -> String {
        format!(
            "{}_{}_{}",
            self.topic_name,
            self.filter_type.as_str(),
            self.filter_ids
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    pub name: String,
    #[serde(default)]
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineNode {
    pub node_id: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inputs: Vec<NodeInput>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub config: Vec<NodeConfig>,
    #[serde(default)]
    pub persist_data: bool,
}

/// The full pipeline definition sent to the deployment target.
///
/// `id` is only present on updates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub flow_id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub window_time: i64,
    #[serde(default)]
    pub merge_strategy: String,
    #[serde(default)]
    pub consume_all_messages: bool,
    #[serde(default)]
    pub nodes: Vec<PipelineNode>,
}

fn is_zero(v: &i64) -> bool {
    *v == 0
}

/// A deployed pipeline as answered by the deployment target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pipeline {
    pub id: uuid::Uuid,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub operators: Vec<serde_json::Value>,
}

// ---------------------------------------------------------------------------
// Flow inputs (node templates)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellConfig {
    pub name: String,
    #[serde(rename = "type", default)]
    pub config_type: String,
}

/// One input node of a flow: its id, declared ports, and declared config names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowInput {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub in_ports: Vec<String>,
    #[serde(default)]
    pub config: Vec<CellConfig>,
}

// ---------------------------------------------------------------------------
// Catalog records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub device_type_id: String,
}

/// The JSON paths of one service that satisfy a criteria query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathOption {
    pub service_id: String,
    #[serde(default)]
    pub json_paths: Vec<String>,
}

/// Device type id -> eligible services with their paths.
pub type PathOptions = HashMap<String, Vec<PathOption>>;

// ---------------------------------------------------------------------------
// Registry module
// ---------------------------------------------------------------------------

/// Where and as whom a module's remote resource can be deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleDeleteInfo {
    pub url: String,
    #[serde(default)]
    pub user_id: String,
}

/// Durable record linking a task execution to the resource it caused to be created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Module {
    pub id: String,
    pub process_instance_id: String,
    #[serde(default)]
    pub keys: Vec<String>,
    pub module_type: String,
    #[serde(default)]
    pub module_data: serde_json::Map<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delete_info: Option<ModuleDeleteInfo>,
}

impl Module {
    /// The `pipeline_id` field, if present and a string.
    pub fn stored_pipeline_id(&self) -> Option<&str> {
        self.module_data
            .get(PIPELINE_ID_FIELD)
            .and_then(|v| v.as_str())
    }

    /// Resource id for liveness checks: `pipeline_id`, else the nested `pipeline.id`.
    pub fn resource_id(&self) -> Option<&str> {
        self.stored_pipeline_id().or_else(|| {
            self.module_data
                .get(PIPELINE_FIELD)
                .and_then(|p| p.get("id"))
                .and_then(|v| v.as_str())
        })
    }

    pub fn has_key(&self, key: &str) -> bool {
        self.keys.iter().any(|k| k == key)
    }
}

/// An unhealthy verdict recorded against a module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthFinding {
    pub module_id: String,
    pub message: String,
    pub reported_at: chrono::DateTime<chrono::Utc>,
}

// ---------------------------------------------------------------------------
// Topic derivation
// ---------------------------------------------------------------------------

/// Map a service id to its topic name by replacing `#` and `:` with `_`.
pub fn service_id_to_topic(service_id: &str) -> String {
    service_id.replace(['#', ':'], "_")
}
