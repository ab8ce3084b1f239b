//! Shared types, task parameters, and errors for the flowdeploy worker.
//!
//! This crate provides the foundational types used across all other flowdeploy crates:
//! - `FlowDeployError`: unified error taxonomy
//! - `Task`: the key/value parameter bag of one task execution
//! - `model`: pipeline request records, selections, and registry modules

pub mod model;
pub mod task;

pub use model::*;
pub use task::{Task, Variable};

/// Response bodies attached to [`FlowDeployError::UnexpectedResponse`] are cut to this many chars.
pub const MAX_ERROR_BODY_CHARS: usize = 512;

/// Unified error type for all flowdeploy subsystems.
#[derive(Debug, thiserror::Error)]
pub enum FlowDeployError {
    // === Task input errors ===
    #[error("Missing parameter '{key}'")]
    MissingParameter { key: String },

    #[error("Malformed parameter '{key}': {message}")]
    MalformedParameter { key: String, message: String },

    #[error("Unsupported type for parameter '{key}': {found}")]
    UnsupportedParameterType { key: String, found: String },

    #[error("Invalid selection: {0}")]
    InvalidSelection(String),

    #[error("Missing criteria '{key}' (mandatory when selection is a group or a device without service)")]
    MissingCriteria { key: String },

    // === Remote errors ===
    #[error("{service} unavailable at {endpoint}: {message}")]
    UpstreamUnavailable {
        service: String,
        endpoint: String,
        message: String,
    },

    #[error("{service} returned HTTP {status} for {endpoint}: {body}")]
    UnexpectedResponse {
        service: String,
        endpoint: String,
        status: u16,
        body: String,
    },

    // === Registry errors ===
    #[error("Registry data of module '{module_id}' is corrupt: {message}")]
    RegistryCorruption { module_id: String, message: String },

    // === Generic ===
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl FlowDeployError {
    /// Build an `UnexpectedResponse`, truncating the body for log-friendly output.
    pub fn unexpected_response(
        service: impl Into<String>,
        endpoint: impl Into<String>,
        status: u16,
        body: &str,
    ) -> Self {
        FlowDeployError::UnexpectedResponse {
            service: service.into(),
            endpoint: endpoint.into(),
            status,
            body: truncate_body(body),
        }
    }

    /// Returns `true` for errors caused by the task's own parameters.
    ///
    /// These abort an attempt before any remote mutation, so nothing needs compensating.
    pub fn is_input_error(&self) -> bool {
        matches!(
            self,
            FlowDeployError::MissingParameter { .. }
                | FlowDeployError::MalformedParameter { .. }
                | FlowDeployError::UnsupportedParameterType { .. }
                | FlowDeployError::InvalidSelection(_)
                | FlowDeployError::MissingCriteria { .. }
        )
    }

    /// Returns `true` if the error came out of a remote call.
    pub fn is_remote_error(&self) -> bool {
        matches!(
            self,
            FlowDeployError::UpstreamUnavailable { .. } | FlowDeployError::UnexpectedResponse { .. }
        )
    }

    /// The HTTP status of an `UnexpectedResponse`.
    pub fn http_status(&self) -> Option<u16> {
        match self {
            FlowDeployError::UnexpectedResponse { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Returns `true` if a remote service answered with a 4xx status.
    pub fn is_client_rejection(&self) -> bool {
        matches!(self.http_status(), Some(status) if (400..500).contains(&status))
    }
}

/// A convenience alias for `Result<T, FlowDeployError>`.
pub type Result<T> = std::result::Result<T, FlowDeployError>;

fn truncate_body(body: &str) -> String {
    let body = body.trim();
    if body.chars().count() <= MAX_ERROR_BODY_CHARS {
        return body.to_string();
    }
    let mut cut: String = body.chars().take(MAX_ERROR_BODY_CHARS).collect();
    cut.push_str("...");
    cut
}
