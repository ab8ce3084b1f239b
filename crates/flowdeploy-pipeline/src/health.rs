//! Periodic health sweep over deployed analytics modules.
//!
//! Every module of the configured type is checked sequentially against the
//! deployment target. A pipeline that reports itself stopped, or that the
//! target rejects with a 4xx, is reported unhealthy to the registry. Server
//! errors and transport failures are inconclusive and only logged.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use flowdeploy_remote::{DeploymentTarget, ModuleRegistry, TokenExchange};
use flowdeploy_types::{HealthFinding, Module, Result};

use crate::events::{EventEmitter, WorkerEvent};

/// Outcome of checking one module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Healthy,
    Unhealthy(String),
    Inconclusive(String),
}

/// Counts for one completed sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepSummary {
    pub checked: usize,
    pub unhealthy: usize,
    pub inconclusive: usize,
    /// `true` when shutdown interrupted the sweep before every module was checked.
    pub interrupted: bool,
}

pub struct HealthMonitor {
    registry: Arc<dyn ModuleRegistry>,
    target: Arc<dyn DeploymentTarget>,
    tokens: Arc<dyn TokenExchange>,
    module_type: String,
    interval: Duration,
    events: EventEmitter,
}

impl HealthMonitor {
    pub fn new(
        registry: Arc<dyn ModuleRegistry>,
        target: Arc<dyn DeploymentTarget>,
        tokens: Arc<dyn TokenExchange>,
        module_type: impl Into<String>,
        interval: Duration,
        events: EventEmitter,
    ) -> Self {
        Self {
            registry,
            target,
            tokens,
            module_type: module_type.into(),
            interval,
            events,
        }
    }

    /// Sweep once at startup and then every interval until `shutdown` flips to `true`.
    ///
    /// Sweeps run inline, so a slow sweep delays the next tick instead of overlapping it.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(
            module_type = %self.module_type,
            interval_ms = self.interval.as_millis() as u64,
            "Health monitor started"
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
                    if let Err(e) = self.sweep(Some(&shutdown)).await {
                        tracing::error!(error = %e, "Health sweep failed");
                    }
                }
            }
        }
        tracing::info!("Health monitor stopped");
    }

    /// Check every module of the monitored type once.
    ///
    /// With a `shutdown` receiver the sweep stops between modules once shutdown is signalled.
    pub async fn sweep(&self, shutdown: Option<&watch::Receiver<bool>>) -> Result<SweepSummary> {
        let modules = self.registry.list_by_type(&self.module_type).await?;
        let mut summary = SweepSummary::default();
        for module in &modules {
            if shutdown.is_some_and(|rx| *rx.borrow()) {
                tracing::info!(
                    remaining = modules.len() - summary.checked,
                    "Shutdown requested, ending health sweep early"
                );
                summary.interrupted = true;
                break;
            }
            summary.checked += 1;
            match self.check(module).await {
                Verdict::Healthy => {}
                Verdict::Unhealthy(message) => {
                    summary.unhealthy += 1;
                    self.report(module, message).await;
                }
                Verdict::Inconclusive(reason) => {
                    summary.inconclusive += 1;
                    tracing::warn!(module_id = %module.id, reason = %reason, "Health check inconclusive");
                }
            }
        }
        tracing::info!(
            checked = summary.checked,
            unhealthy = summary.unhealthy,
            inconclusive = summary.inconclusive,
            "Health sweep completed"
        );
        self.events.emit(WorkerEvent::HealthSweepCompleted {
            checked: summary.checked,
            unhealthy: summary.unhealthy,
            inconclusive: summary.inconclusive,
        });
        Ok(summary)
    }

    /// Ask the deployment target about one module's pipeline.
    pub async fn check(&self, module: &Module) -> Verdict {
        let Some(resource_id) = module.resource_id() else {
            return Verdict::Inconclusive("module has no pipeline id".into());
        };
        let user_id = match &module.delete_info {
            Some(info) if !info.user_id.is_empty() => info.user_id.clone(),
            _ => match self.registry.instance_user(&module.process_instance_id).await {
                Ok(user) => user,
                Err(e) => return Verdict::Inconclusive(format!("owner lookup failed: {e}")),
            },
        };
        let token = match self.tokens.exchange(&user_id).await {
            Ok(token) => token,
            Err(e) => return Verdict::Inconclusive(format!("token exchange failed: {e}")),
        };
        match self.target.status(&token, resource_id).await {
            Ok(status) if status.running => Verdict::Healthy,
            Ok(_) => Verdict::Unhealthy(format!("pipeline {resource_id} is not running")),
            Err(e) if e.is_client_rejection() => {
                Verdict::Unhealthy(format!("pipeline {resource_id} rejected: {e}"))
            }
            Err(e) => Verdict::Inconclusive(e.to_string()),
        }
    }

    async fn report(&self, module: &Module, message: String) {
        tracing::warn!(module_id = %module.id, message = %message, "Module unhealthy");
        let finding = HealthFinding {
            module_id: module.id.clone(),
            message: message.clone(),
            reported_at: Utc::now(),
        };
        if let Err(e) = self.registry.report_health(&finding).await {
            tracing::error!(module_id = %module.id, error = %e, "Failed to report health finding");
        }
        self.events.emit(WorkerEvent::ModuleUnhealthy {
            module_id: module.id.clone(),
            message,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::drain;
    use crate::testing::{MemoryRegistry, RecordingTarget, StaticTokens};
    use flowdeploy_types::{ModuleDeleteInfo, PIPELINE_ID_FIELD};
    use serde_json::{json, Map};

    fn module(id: &str, pipeline_id: Option<&str>) -> Module {
        let mut module_data = Map::new();
        if let Some(pid) = pipeline_id {
            module_data.insert(PIPELINE_ID_FIELD.into(), json!(pid));
        }
        Module {
            id: id.into(),
            process_instance_id: "proc".into(),
            keys: vec![],
            module_type: "analytics".into(),
            module_data,
            delete_info: Some(ModuleDeleteInfo {
                url: String::new(),
                user_id: "owner".into(),
            }),
        }
    }

    async fn setup(modules: &[Module]) -> (HealthMonitor, Arc<RecordingTarget>, Arc<MemoryRegistry>, EventEmitter) {
        let registry = Arc::new(MemoryRegistry::new());
        for m in modules {
            registry.upsert(m).await.unwrap();
        }
        let target = Arc::new(RecordingTarget::new("http://engine"));
        let events = EventEmitter::default();
        let monitor = HealthMonitor::new(
            registry.clone(),
            target.clone(),
            Arc::new(StaticTokens::new("jwt")),
            "analytics",
            Duration::from_secs(60),
            events.clone(),
        );
        (monitor, target, registry, events)
    }

    #[tokio::test]
    async fn classifies_each_module() {
        let modules = vec![
            module("running", Some("p-run")),
            module("stopped", Some("p-stop")),
            module("gone", Some("p-gone")),
            module("flaky", Some("p-flaky")),
            module("no-id", None),
        ];
        let (monitor, target, registry, events) = setup(&modules).await;
        target.seed_pipeline("p-run");
        target.seed_pipeline("p-stop");
        target.set_running("p-stop", false);
        target.seed_pipeline("p-flaky");
        target.fail_status("p-flaky", 503);
        let mut rx = events.subscribe();

        let summary = monitor.sweep(None).await.unwrap();
        assert_eq!(
            summary,
            SweepSummary {
                checked: 5,
                unhealthy: 2,
                inconclusive: 2,
                interrupted: false,
            }
        );

        let reported: Vec<_> = registry.findings().into_iter().map(|f| f.module_id).collect();
        assert_eq!(reported, vec!["stopped".to_string(), "gone".to_string()]);

        let unhealthy = drain(&mut rx)
            .into_iter()
            .filter(|e| matches!(e, WorkerEvent::ModuleUnhealthy { .. }))
            .count();
        assert_eq!(unhealthy, 2);
    }

    #[tokio::test]
    async fn sweep_stops_when_shutdown_signalled() {
        let (monitor, _, _, _) = setup(&[module("a", Some("p1")), module("b", Some("p2"))]).await;
        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();
        let summary = monitor.sweep(Some(&rx)).await.unwrap();
        assert_eq!(summary.checked, 0);
        assert!(summary.interrupted);
    }

    #[tokio::test]
    async fn run_sweeps_at_startup_and_exits_on_shutdown() {
        let (monitor, target, _, events) = setup(&[module("a", Some("p1"))]).await;
        target.seed_pipeline("p1");
        let mut rx = events.subscribe();
        let (tx, shutdown) = watch::channel(false);

        let handle = tokio::spawn(async move { monitor.run(shutdown).await });
        let first = rx.recv().await.unwrap();
        assert_eq!(
            first,
            WorkerEvent::HealthSweepCompleted {
                checked: 1,
                unhealthy: 0,
                inconclusive: 0,
            }
        );
        tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
