//! Best-effort rollback of the resources a failed attempt created or retained.

use std::sync::Arc;

use flowdeploy_remote::{DeleteOutcome, DeploymentTarget, ModuleRegistry, TokenExchange};
use flowdeploy_types::{Module, ModuleDeleteInfo, Result};

use crate::events::{EventEmitter, WorkerEvent};

/// What happened to each module during one compensation run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompensationReport {
    pub deleted: Vec<String>,
    pub not_found: Vec<String>,
    pub skipped: Vec<String>,
    pub failed: Vec<(String, String)>,
}

impl CompensationReport {
    /// Modules whose remote resource is gone now.
    pub fn removed(&self) -> usize {
        self.deleted.len() + self.not_found.len()
    }

    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Issues delete calls through each module's stored delete descriptor.
#[derive(Clone)]
pub struct Compensator {
    target: Arc<dyn DeploymentTarget>,
    tokens: Arc<dyn TokenExchange>,
    registry: Arc<dyn ModuleRegistry>,
    events: EventEmitter,
}

impl Compensator {
    pub fn new(
        target: Arc<dyn DeploymentTarget>,
        tokens: Arc<dyn TokenExchange>,
        registry: Arc<dyn ModuleRegistry>,
        events: EventEmitter,
    ) -> Self {
        Self {
            target,
            tokens,
            registry,
            events,
        }
    }

    /// Delete every module's resource; a failure never stops the remaining deletes.
    pub async fn compensate(&self, modules: &[Module], reason: &str) -> CompensationReport {
        tracing::info!(modules = modules.len(), reason, "Compensating failed attempt");
        let mut report = CompensationReport::default();
        for module in modules {
            let Some(info) = &module.delete_info else {
                tracing::warn!(module_id = %module.id, "Module has no delete info, nothing to compensate");
                report.skipped.push(module.id.clone());
                continue;
            };
            match self.delete(info).await {
                Ok(outcome) => {
                    self.forget(&module.id).await;
                    self.events.emit(WorkerEvent::ResourceDeleted {
                        module_id: module.id.clone(),
                        url: info.url.clone(),
                        not_found: outcome == DeleteOutcome::NotFound,
                    });
                    match outcome {
                        DeleteOutcome::Deleted => report.deleted.push(module.id.clone()),
                        DeleteOutcome::NotFound => report.not_found.push(module.id.clone()),
                    }
                }
                Err(e) => {
                    tracing::error!(module_id = %module.id, url = %info.url, error = %e, "Compensating delete failed");
                    self.events.emit(WorkerEvent::CompensationFailed {
                        module_id: module.id.clone(),
                        error: e.to_string(),
                    });
                    report.failed.push((module.id.clone(), e.to_string()));
                }
            }
        }
        report
    }

    async fn delete(&self, info: &ModuleDeleteInfo) -> Result<DeleteOutcome> {
        let token = if info.user_id.is_empty() {
            None
        } else {
            Some(self.tokens.exchange(&info.user_id).await?)
        };
        self.target.delete_at(&info.url, token.as_ref()).await
    }

    async fn forget(&self, module_id: &str) {
        if let Err(e) = self.registry.remove(module_id).await {
            tracing::error!(module_id, error = %e, "Failed to remove compensated module from registry");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MemoryRegistry, RecordingTarget, StaticTokens, TargetCall};

    fn module(id: &str, url: Option<&str>) -> Module {
        Module {
            id: id.into(),
            process_instance_id: "p".into(),
            keys: vec![],
            module_type: "analytics".into(),
            module_data: serde_json::Map::new(),
            delete_info: url.map(|u| ModuleDeleteInfo {
                url: u.into(),
                user_id: "owner".into(),
            }),
        }
    }

    fn compensator(target: Arc<RecordingTarget>, registry: Arc<MemoryRegistry>) -> Compensator {
        Compensator::new(
            target,
            Arc::new(StaticTokens::new("jwt")),
            registry,
            EventEmitter::default(),
        )
    }

    #[tokio::test]
    async fn deletes_every_module_and_tolerates_failures() {
        let target = Arc::new(RecordingTarget::new("http://engine"));
        target.fail_delete_of("http://engine/pipeline/bad");
        let registry = Arc::new(MemoryRegistry::new());
        let modules = vec![
            module("a", Some("http://engine/pipeline/bad")),
            module("b", Some("http://engine/pipeline/missing")),
            module("c", None),
        ];
        for m in &modules {
            registry.upsert(m).await.unwrap();
        }

        let report = compensator(target.clone(), registry.clone())
            .compensate(&modules, "boom")
            .await;

        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "a");
        assert_eq!(report.not_found, vec!["b".to_string()]);
        assert_eq!(report.skipped, vec!["c".to_string()]);
        assert_eq!(report.removed(), 1);

        let deletes: Vec<_> = target
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                TargetCall::Delete { url, user } => Some((url, user)),
                _ => None,
            })
            .collect();
        assert_eq!(deletes.len(), 2);
        assert_eq!(deletes[1].1.as_deref(), Some("owner"));

        let remaining: Vec<_> = registry
            .list_by_type("analytics")
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(remaining, vec!["a".to_string(), "c".to_string()]);
    }

    #[tokio::test]
    async fn existing_resource_is_deleted() {
        let target = Arc::new(RecordingTarget::new("http://engine"));
        let url = target.seed_pipeline("p1");
        let registry = Arc::new(MemoryRegistry::new());
        let report = compensator(target.clone(), registry)
            .compensate(&[module("a", Some(&url))], "boom")
            .await;
        assert_eq!(report.deleted, vec!["a".to_string()]);
        assert!(report.is_clean());
    }
}
