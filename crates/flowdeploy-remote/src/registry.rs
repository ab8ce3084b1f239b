//! JSON-file backed module registry.
//!
//! The whole registry is one JSON document: modules, the process-instance to
//! user mapping, and reported health findings. Every mutation rewrites the
//! document through a temporary file followed by a rename, so a crash never
//! leaves a half-written registry behind.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use flowdeploy_types::{FlowDeployError, HealthFinding, Module, Result};

use crate::ModuleRegistry;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RegistryDocument {
    #[serde(default)]
    modules: Vec<Module>,
    #[serde(default)]
    instance_users: HashMap<String, String>,
    #[serde(default)]
    health: Vec<HealthFinding>,
}

/// [`ModuleRegistry`] persisted to a single JSON file.
#[derive(Debug)]
pub struct FileModuleRegistry {
    path: PathBuf,
    default_user: Option<String>,
    state: Mutex<RegistryDocument>,
}

impl FileModuleRegistry {
    /// Open the registry at `path`, starting empty when the file does not exist yet.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let document = if tokio::fs::try_exists(&path).await? {
            let json = tokio::fs::read_to_string(&path).await?;
            if json.trim().is_empty() {
                RegistryDocument::default()
            } else {
                serde_json::from_str(&json)?
            }
        } else {
            RegistryDocument::default()
        };
        tracing::debug!(
            path = %path.display(),
            modules = document.modules.len(),
            "Module registry opened"
        );
        Ok(Self {
            path,
            default_user: None,
            state: Mutex::new(document),
        })
    }

    /// User returned for process instances without a recorded owner.
    pub fn with_default_user(mut self, user: impl Into<String>) -> Self {
        let user = user.into();
        self.default_user = (!user.is_empty()).then_some(user);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Latest health finding per module, in first-reported order.
    pub async fn findings(&self) -> Vec<HealthFinding> {
        self.state.lock().await.health.clone()
    }

    async fn persist(&self, document: &RegistryDocument) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let json = serde_json::to_string_pretty(document)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        tracing::debug!(path = %self.path.display(), "Module registry saved");
        Ok(())
    }

    /// Persist `next` and only then make it the in-memory state.
    async fn commit(&self, state: &mut RegistryDocument, next: RegistryDocument) -> Result<()> {
        self.persist(&next).await?;
        *state = next;
        Ok(())
    }
}

#[async_trait]
impl ModuleRegistry for FileModuleRegistry {
    async fn instance_user(&self, process_instance_id: &str) -> Result<String> {
        let state = self.state.lock().await;
        state
            .instance_users
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
        let state = self.state.lock().await;
        Ok(state
            .modules
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
        let mut state = self.state.lock().await;
        let mut next = state.clone();
        match next.modules.iter_mut().find(|m| m.id == module.id) {
            Some(existing) => *existing = module.clone(),
            None => next.modules.push(module.clone()),
        }
        self.commit(&mut state, next).await
    }

    async fn remove(&self, module_id: &str) -> Result<bool> {
        let mut state = self.state.lock().await;
        if !state.modules.iter().any(|m| m.id == module_id) {
            return Ok(false);
        }
        let mut next = state.clone();
        next.modules.retain(|m| m.id != module_id);
        self.commit(&mut state, next).await?;
        Ok(true)
    }

    async fn list_by_type(&self, module_type: &str) -> Result<Vec<Module>> {
        let state = self.state.lock().await;
        Ok(state
            .modules
            .iter()
            .filter(|m| m.module_type == module_type)
            .cloned()
            .collect())
    }

    async fn report_health(&self, finding: &HealthFinding) -> Result<()> {
        let mut state = self.state.lock().await;
        let mut next = state.clone();
        match next.health.iter_mut().find(|f| f.module_id == finding.module_id) {
            Some(existing) => *existing = finding.clone(),
            None => next.health.push(finding.clone()),
        }
        self.commit(&mut state, next).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn module(id: &str, pid: &str, keys: &[&str], module_type: &str) -> Module {
        let mut module_data = serde_json::Map::new();
        module_data.insert("pipeline_id".into(), json!(format!("res-{id}")));
        Module {
            id: id.into(),
            process_instance_id: pid.into(),
            keys: keys.iter().map(|k| k.to_string()).collect(),
            module_type: module_type.into(),
            module_data,
            delete_info: None,
        }
    }

    #[tokio::test]
    async fn upsert_then_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry").join("modules.json");

        let registry = FileModuleRegistry::open(&path).await.unwrap();
        registry
            .upsert(&module("p1.t1", "p1", &["k"], "analytics"))
            .await
            .unwrap();
        assert!(path.exists());
        assert!(!path.with_extension("json.tmp").exists());

        let reopened = FileModuleRegistry::open(&path).await.unwrap();
        let found = reopened.find("p1", "k", "analytics").await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].stored_pipeline_id(), Some("res-p1.t1"));
    }

    #[tokio::test]
    async fn upsert_replaces_by_id() {
        let dir = tempfile::tempdir().unwrap();
        let registry = FileModuleRegistry::open(dir.path().join("m.json"))
            .await
            .unwrap();
        let mut m = module("p1.t1", "p1", &["k"], "analytics");
        registry.upsert(&m).await.unwrap();
        m.module_data
            .insert("module_update_version".into(), json!(2));
        registry.upsert(&m).await.unwrap();

        let all = registry.list_by_type("analytics").await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].module_data["module_update_version"], json!(2));
    }

    #[tokio::test]
    async fn find_filters_by_instance_key_and_type() {
        let dir = tempfile::tempdir().unwrap();
        let registry = FileModuleRegistry::open(dir.path().join("m.json"))
            .await
            .unwrap();
        registry.upsert(&module("a", "p1", &["k"], "analytics")).await.unwrap();
        registry.upsert(&module("b", "p1", &["other"], "analytics")).await.unwrap();
        registry.upsert(&module("c", "p2", &["k"], "analytics")).await.unwrap();
        registry.upsert(&module("d", "p1", &["k"], "export")).await.unwrap();

        let found = registry.find("p1", "k", "analytics").await.unwrap();
        assert_eq!(found.iter().map(|m| m.id.as_str()).collect::<Vec<_>>(), vec!["a"]);
        assert_eq!(registry.list_by_type("analytics").await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn remove_reports_presence() {
        let dir = tempfile::tempdir().unwrap();
        let registry = FileModuleRegistry::open(dir.path().join("m.json"))
            .await
            .unwrap();
        registry.upsert(&module("a", "p1", &[], "analytics")).await.unwrap();
        assert!(registry.remove("a").await.unwrap());
        assert!(!registry.remove("a").await.unwrap());
        assert!(registry.list_by_type("analytics").await.unwrap().is_empty());
    }

    fn finding(module_id: &str, message: &str) -> HealthFinding {
        HealthFinding {
            module_id: module_id.into(),
            message: message.into(),
            reported_at: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn instance_user_falls_back_to_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m.json");
        tokio::fs::write(&path, r#"{"instance_users": {"p2": "owner"}}"#)
            .await
            .unwrap();
        let registry = FileModuleRegistry::open(&path).await.unwrap();
        assert!(registry.instance_user("p1").await.is_err());

        let registry = registry.with_default_user("fallback");
        assert_eq!(registry.instance_user("p1").await.unwrap(), "fallback");
        assert_eq!(registry.instance_user("p2").await.unwrap(), "owner");
    }

    #[tokio::test]
    async fn health_findings_are_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m.json");
        let registry = FileModuleRegistry::open(&path).await.unwrap();
        registry
            .report_health(&finding("a", "pipeline not running"))
            .await
            .unwrap();

        let reopened = FileModuleRegistry::open(&path).await.unwrap();
        let findings = reopened.findings().await;
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].module_id, "a");
    }

    #[tokio::test]
    async fn repeated_findings_keep_only_the_latest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m.json");
        let registry = FileModuleRegistry::open(&path).await.unwrap();
        registry.report_health(&finding("a", "first")).await.unwrap();
        registry.report_health(&finding("b", "other")).await.unwrap();
        registry.report_health(&finding("a", "second")).await.unwrap();

        let reopened = FileModuleRegistry::open(&path).await.unwrap();
        let findings = reopened.findings().await;
        assert_eq!(findings.len(), 2);
        assert_eq!(findings[0].module_id, "a");
        assert_eq!(findings[0].message, "second");
        assert_eq!(findings[1].module_id, "b");
    }

    #[tokio::test]
    async fn failed_save_leaves_state_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m.json");
        let registry = FileModuleRegistry::open(&path).await.unwrap();
        registry.upsert(&module("a", "p1", &["k"], "analytics")).await.unwrap();

        // A directory in the way of the temporary file makes every save fail.
        tokio::fs::create_dir(path.with_extension("json.tmp")).await.unwrap();

        assert!(registry.upsert(&module("b", "p1", &["k"], "analytics")).await.is_err());
        assert!(registry.remove("a").await.is_err());
        assert!(registry.report_health(&finding("a", "down")).await.is_err());

        let all = registry.list_by_type("analytics").await.unwrap();
        assert_eq!(all.iter().map(|m| m.id.as_str()).collect::<Vec<_>>(), vec!["a"]);
        assert!(registry.findings().await.is_empty());
    }

    #[tokio::test]
    async fn corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m.json");
        tokio::fs::write(&path, "{ not json").await.unwrap();
        let err = FileModuleRegistry::open(&path).await.unwrap_err();
        assert!(matches!(err, FlowDeployError::Json(_)));
    }
}
