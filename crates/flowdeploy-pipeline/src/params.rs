//! Typed access to a task's parameter bag.
//!
//! Parameters arrive either as native JSON values or as strings holding
//! encoded JSON. All coercion leniency lives here; callers get either a typed
//! value, a documented default, or a [`FlowDeployError`] naming the key.

use serde::de::DeserializeOwned;
use serde_json::Value;

use flowdeploy_types::{
    FilterCriteria, FlowDeployError, Result, Selection, SelectionOption, Task, Variable,
};

pub const NAME: &str = "name";
pub const FLOW_ID: &str = "flow_id";
pub const DESCRIPTION: &str = "desc";
pub const WINDOW_TIME: &str = "window_time";
pub const MERGE_STRATEGY: &str = "merge_strategy";
pub const CONSUME_ALL_MESSAGES: &str = "consume_all_messages";
pub const KEY: &str = "key";
pub const MODULE_DATA: &str = "module_data";

pub const DEFAULT_MERGE_STRATEGY: &str = "inner";

/// Reads typed values out of a [`Task`] under a configurable key prefix.
#[derive(Debug, Clone, Default)]
pub struct ParamExtractor {
    prefix: String,
}

impl ParamExtractor {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Full parameter name for `name`.
    pub fn key(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name)
    }

    /// Full parameter name of a per-port or per-node sub-key, e.g. `selection.<node>.<port>`.
    pub fn scoped_key(&self, section: &str, node_id: &str, name: &str) -> String {
        format!("{}{}.{}.{}", self.prefix, section, node_id, name)
    }

    fn get<'t>(&self, task: &'t Task, key: &str) -> Option<&'t Variable> {
        task.param(key).filter(|v| !v.is_null())
    }

    // -- mandatory ---------------------------------------------------------

    pub fn pipeline_name(&self, task: &Task) -> Result<String> {
        self.required_string(task, &self.key(NAME))
    }

    pub fn flow_id(&self, task: &Task) -> Result<String> {
        self.required_string(task, &self.key(FLOW_ID))
    }

    fn required_string(&self, task: &Task, key: &str) -> Result<String> {
        match self.get(task, key).map(|v| &v.value) {
            None => Err(missing(key)),
            Some(Value::String(s)) if s.is_empty() => Err(missing(key)),
            Some(Value::String(s)) => Ok(s.clone()),
            Some(other) => Err(FlowDeployError::MalformedParameter {
                key: key.to_string(),
                message: format!("expected a string, found {}", type_name(other)),
            }),
        }
    }

    // -- optional scalars --------------------------------------------------

    pub fn description(&self, task: &Task) -> String {
        self.optional_string(task, &self.key(DESCRIPTION))
            .unwrap_or_default()
    }

    /// The module key; `None` (no key, or an empty one) always means "create new".
    pub fn module_key(&self, task: &Task) -> Option<String> {
        self.optional_string(task, &self.key(KEY))
            .filter(|k| !k.is_empty())
    }

    fn optional_string(&self, task: &Task, key: &str) -> Option<String> {
        match self.get(task, key).map(|v| &v.value) {
            Some(Value::String(s)) => Some(s.clone()),
            _ => None,
        }
    }

    /// Window time in whole units; accepts integers, floats, and decimal strings.
    pub fn window_time(&self, task: &Task) -> Result<i64> {
        let key = self.key(WINDOW_TIME);
        let Some(var) = self.get(task, &key) else {
            return Ok(0);
        };
        let unsupported = || FlowDeployError::UnsupportedParameterType {
            key: key.clone(),
            found: type_name(&var.value).to_string(),
        };
        match &var.value {
            Value::Number(n) => n
                .as_i64()
                .or_else(|| n.as_f64().map(|f| f.trunc() as i64))
                .ok_or_else(unsupported),
            Value::String(s) => {
                let s = s.trim();
                s.parse::<i64>()
                    .ok()
                    .or_else(|| {
                        s.parse::<f64>()
                            .ok()
                            .filter(|f| f.is_finite())
                            .map(|f| f.trunc() as i64)
                    })
                    .ok_or_else(|| FlowDeployError::UnsupportedParameterType {
                        key: key.clone(),
                        found: format!("non-numeric string '{s}'"),
                    })
            }
            _ => Err(unsupported()),
        }
    }

    /// Merge strategy, `"inner"` when missing or empty.
    pub fn merge_strategy(&self, task: &Task) -> Result<String> {
        let key = self.key(MERGE_STRATEGY);
        match self.get(task, &key).map(|v| &v.value) {
            None => Ok(DEFAULT_MERGE_STRATEGY.into()),
            Some(Value::String(s)) if s.is_empty() => Ok(DEFAULT_MERGE_STRATEGY.into()),
            Some(Value::String(s)) => Ok(s.clone()),
            Some(other) => Err(FlowDeployError::MalformedParameter {
                key,
                message: format!("expected a string, found {}", type_name(other)),
            }),
        }
    }

    pub fn consume_all_messages(&self, task: &Task) -> Result<bool> {
        self.flag(task, &self.key(CONSUME_ALL_MESSAGES))
    }

    pub fn persist_data(&self, task: &Task, node_id: &str) -> Result<bool> {
        self.flag(task, &self.key(&format!("persistData.{node_id}")))
    }

    /// Boolean parameter: native bool or a JSON-encoded bool inside a string.
    fn flag(&self, task: &Task, key: &str) -> Result<bool> {
        match self.get(task, key).map(|v| &v.value) {
            None => Ok(false),
            Some(Value::Bool(b)) => Ok(*b),
            Some(Value::String(s)) if s.trim().is_empty() => Ok(false),
            Some(Value::String(s)) => {
                serde_json::from_str::<bool>(s.trim()).map_err(|e| FlowDeployError::MalformedParameter {
                    key: key.to_string(),
                    message: format!("expected a boolean: {e}"),
                })
            }
            Some(other) => Err(FlowDeployError::MalformedParameter {
                key: key.to_string(),
                message: format!("expected a boolean, found {}", type_name(other)),
            }),
        }
    }

    // -- node level --------------------------------------------------------

    /// Per-node config value, always rendered to a string. Missing config is empty.
    pub fn node_config(&self, task: &Task, node_id: &str, name: &str) -> Result<String> {
        let key = self.scoped_key("conf", node_id, name);
        let Some(var) = self.get(task, &key) else {
            return Ok(String::new());
        };
        match &var.value {
            Value::String(s) => Ok(s.clone()),
            Value::Object(map) => Ok(serde_json::to_string(map.get("value").unwrap_or(&Value::Null))?),
            other => Ok(serde_json::to_string(other)?),
        }
    }

    /// Selection of one input port.
    ///
    /// A missing parameter is an error; a selection with no member set is `Ok(None)`.
    pub fn selection(&self, task: &Task, node_id: &str, port: &str) -> Result<Option<Selection>> {
        let key = self.scoped_key("selection", node_id, port);
        let var = task.param(&key).ok_or_else(|| missing(&key))?;
        if var.is_null() || var.value.as_str().is_some_and(|s| s.trim().is_empty()) {
            return Ok(None);
        }
        let option: SelectionOption = decode(&key, var)?;
        option.into_selection()
    }

    /// Criteria of one input port; mandatory whenever the selection resolves via criteria.
    pub fn criteria(&self, task: &Task, node_id: &str, port: &str) -> Result<Vec<FilterCriteria>> {
        let key = self.scoped_key("criteria", node_id, port);
        match self.get(task, &key) {
            None => Err(FlowDeployError::MissingCriteria { key }),
            Some(var) => decode(&key, var),
        }
    }

    /// Optional secondary filter of one input port; empty when unset.
    pub fn service_criteria(
        &self,
        task: &Task,
        node_id: &str,
        port: &str,
    ) -> Result<Vec<FilterCriteria>> {
        let key = self.scoped_key("service_criteria", node_id, port);
        match self.get(task, &key) {
            None => Ok(Vec::new()),
            Some(var) if var.value.as_str().is_some_and(|s| s.trim().is_empty()) => Ok(Vec::new()),
            Some(var) => decode(&key, var),
        }
    }

    // -- module data -------------------------------------------------------

    /// User-supplied module data: a JSON object, native or string-encoded.
    pub fn module_data(&self, task: &Task) -> Result<serde_json::Map<String, Value>> {
        let key = self.key(MODULE_DATA);
        match self.get(task, &key) {
            None => Ok(serde_json::Map::new()),
            Some(var) if var.value.as_str().is_some_and(|s| s.trim().is_empty()) => {
                Ok(serde_json::Map::new())
            }
            Some(var) => decode(&key, var),
        }
    }
}

/// Decode a parameter that may be a native value or a string holding JSON.
fn decode<T: DeserializeOwned>(key: &str, var: &Variable) -> Result<T> {
    let malformed = |e: serde_json::Error| FlowDeployError::MalformedParameter {
        key: key.to_string(),
        message: e.to_string(),
    };
    match &var.value {
        Value::String(s) => match serde_json::from_str(s) {
            Ok(decoded) => Ok(decoded),
            Err(json_err) => serde_json::from_value(var.value.clone()).map_err(|_| malformed(json_err)),
        },
        other => serde_json::from_value(other.clone()).map_err(malformed),
    }
}

fn missing(key: &str) -> FlowDeployError {
    FlowDeployError::MissingParameter {
        key: key.to_string(),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
