//! The parameter bag handed to one task execution.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// One task parameter as delivered by the task source.
///
/// `kind` mirrors the source's declared type name (`"String"`, `"Boolean"`, `"Null"`, ...);
/// the value itself may be a native JSON value or a string holding encoded JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variable {
    #[serde(default)]
    pub value: serde_json::Value,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

impl Variable {
    pub fn new(value: impl Into<serde_json::Value>) -> Self {
        Self {
            value: value.into(),
            kind: None,
        }
    }

    /// `true` when the value is JSON null or the source declared it as null-typed.
    pub fn is_null(&self) -> bool {
        self.value.is_null()
            || self
                .kind
                .as_deref()
                .is_some_and(|k| k.eq_ignore_ascii_case("null"))
    }
}

/// An immutable task execution: identifiers plus its parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub process_instance_id: String,
    #[serde(default)]
    pub variables: HashMap<String, Variable>,
}

impl Task {
    pub fn new(process_instance_id: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            process_instance_id: process_instance_id.into(),
            variables: HashMap::new(),
        }
    }

    /// Builder-style helper, mostly for tests and fixtures.
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.variables.insert(key.into(), Variable::new(value));
        self
    }

    pub fn param(&self, key: &str) -> Option<&Variable> {
        self.variables.get(key)
    }

    /// Identifier of the registry module produced by this execution.
    pub fn module_id(&self) -> String {
        format!("{}.{}", self.process_instance_id, self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_camunda_style_variables() {
        let task: Task = serde_json::from_str(
            r#"{
                "id": "t1",
                "processInstanceId": "p1",
                "variables": {
                    "name": {"value": "my pipeline", "type": "String"},
                    "conf": {"value": null, "type": "Null"}
                }
            }"#,
        )
        .unwrap();
        assert_eq!(task.id, "t1");
        assert_eq!(task.process_instance_id, "p1");
        assert_eq!(
            task.param("name").map(|v| &v.value),
            Some(&serde_json::json!("my pipeline"))
        );
        assert!(task.param("conf").unwrap().is_null());
    }

    #[test]
    fn null_kind_counts_as_null_even_with_value() {
        let var = Variable {
            value: serde_json::json!("ignored"),
            kind: Some("null".into()),
        };
        assert!(var.is_null());
        assert!(!Variable::new("x").is_null());
    }

    #[test]
    fn module_id_joins_instance_and_task() {
        let task = Task::new("proc", "task");
        assert_eq!(task.module_id(), "proc.task");
    }
}
