//! Worker configuration, threaded explicitly into every component.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use flowdeploy_types::{FlowDeployError, Result};

/// Configuration of one worker process. Every field has a default, so an
/// empty JSON object is a valid configuration file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Prefix of every task parameter name.
    pub worker_param_prefix: String,
    /// Module type recorded in the registry and watched by the health monitor.
    pub module_type: String,

    pub flow_engine_url: String,
    pub flow_parser_url: String,
    pub import_deploy_url: String,
    pub device_repository_url: String,

    pub enable_multiple_paths: bool,
    pub device_path_prefix: String,
    pub group_path_prefix: String,
    pub import_path_prefix: String,
    pub remove_import_path_root: bool,

    #[serde(with = "crate::duration_serde")]
    pub request_timeout: Duration,
    #[serde(with = "crate::duration_serde")]
    pub health_check_interval: Duration,
    #[serde(with = "crate::duration_serde")]
    pub poll_interval: Duration,

    pub registry_path: PathBuf,
    pub auth_token: String,
    pub default_user: String,

    pub debug: bool,
    pub log_level: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_param_prefix: String::new(),
            module_type: "analytics".into(),
            flow_engine_url: "http://localhost:8000".into(),
            flow_parser_url: "http://localhost:5000".into(),
            import_deploy_url: "http://localhost:8080".into(),
            device_repository_url: "http://localhost:8081".into(),
            enable_multiple_paths: false,
            device_path_prefix: String::new(),
            group_path_prefix: String::new(),
            import_path_prefix: String::new(),
            remove_import_path_root: false,
            request_timeout: Duration::from_secs(30),
            health_check_interval: Duration::from_secs(300),
            poll_interval: Duration::from_secs(1),
            registry_path: PathBuf::from("modules.json"),
            auth_token: String::new(),
            default_user: String::new(),
            debug: false,
            log_level: "info".into(),
        }
    }
}

impl WorkerConfig {
    /// Read and validate a JSON configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let config: WorkerConfig = serde_json::from_str(&json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        for (name, url) in [
            ("flow_engine_url", &self.flow_engine_url),
            ("flow_parser_url", &self.flow_parser_url),
            ("import_deploy_url", &self.import_deploy_url),
            ("device_repository_url", &self.device_repository_url),
        ] {
            if url.trim().is_empty() {
                return Err(FlowDeployError::Other(format!("config: {name} must not be empty")));
            }
        }
        for (name, interval) in [
            ("request_timeout", self.request_timeout),
            ("health_check_interval", self.health_check_interval),
            ("poll_interval", self.poll_interval),
        ] {
            if interval.is_zero() {
                return Err(FlowDeployError::Other(format!("config: {name} must be non-zero")));
            }
        }
        if self.module_type.is_empty() {
            return Err(FlowDeployError::Other("config: module_type must not be empty".into()));
        }
        Ok(())
    }

    pub fn resolver_settings(&self) -> ResolverSettings {
        ResolverSettings {
            enable_multiple_paths: self.enable_multiple_paths,
            device_path_prefix: self.device_path_prefix.clone(),
            group_path_prefix: self.group_path_prefix.clone(),
            import_path_prefix: self.import_path_prefix.clone(),
            remove_import_path_root: self.remove_import_path_root,
        }
    }
}

/// The subset of [`WorkerConfig`] the selection resolver depends on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolverSettings {
    pub enable_multiple_paths: bool,
    pub device_path_prefix: String,
    pub group_path_prefix: String,
    pub import_path_prefix: String,
    pub remove_import_path_root: bool,
}
