use async_trait::async_trait;

use flowdeploy_types::{FlowDeployError, Pipeline, PipelineRequest, Result};

use crate::http::{authorize, decode, join_url, map_error, send};
use crate::{DeleteOutcome, DeploymentTarget, PipelineStatus, Token};

const SERVICE: &str = "flow-engine";

/// [`DeploymentTarget`] talking to the flow engine's `/pipeline` resource.
#[derive(Debug, Clone)]
pub struct FlowEngineClient {
    client: reqwest::Client,
    base_url: String,
    debug: bool,
}

impl FlowEngineClient {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            debug: false,
        }
    }

    /// Log every request body at debug level.
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    async fn send_pipeline(
        &self,
        method: reqwest::Method,
        token: &Token,
        request: &PipelineRequest,
    ) -> Result<Pipeline> {
        let url = join_url(&self.base_url, &["pipeline"])?;
        let endpoint = format!("{method} {}", url.path());
        if self.debug {
            let body = serde_json::to_string(request)?;
            tracing::debug!(endpoint = %endpoint, body = %body, "Sending pipeline request");
        }
        let builder = self.client.request(method, url).json(request);
        let (status, body) = send(SERVICE, &endpoint, authorize(builder, token)).await?;
        decode(SERVICE, &endpoint, status, &body)
    }
}

#[async_trait]
impl DeploymentTarget for FlowEngineClient {
    async fn create(&self, token: &Token, request: &PipelineRequest) -> Result<Pipeline> {
        self.send_pipeline(reqwest::Method::POST, token, request).await
    }

    async fn update(&self, token: &Token, request: &PipelineRequest) -> Result<Pipeline> {
        if request.id.is_none() {
            return Err(FlowDeployError::Other(
                "pipeline update requires a pipeline id".into(),
            ));
        }
        self.send_pipeline(reqwest::Method::PUT, token, request).await
    }

    fn resource_url(&self, resource_id: &str) -> String {
        match join_url(&self.base_url, &["pipeline", resource_id]) {
            Ok(url) => url.to_string(),
            Err(_) => format!(
                "{}/pipeline/{}",
                self.base_url.trim_end_matches('/'),
                resource_id
            ),
        }
    }

    async fn delete_at(&self, url: &str, token: Option<&Token>) -> Result<DeleteOutcome> {
        let endpoint = format!("DELETE {url}");
        let mut builder = self.client.delete(url);
        if let Some(token) = token {
            builder = authorize(builder, token);
        }
        let (status, body) = send(SERVICE, &endpoint, builder).await?;
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(DeleteOutcome::NotFound);
        }
        if !status.is_success() {
            return Err(map_error(SERVICE, &endpoint, status, &body));
        }
        Ok(DeleteOutcome::Deleted)
    }

    async fn status(&self, token: &Token, resource_id: &str) -> Result<PipelineStatus> {
        let url = join_url(&self.base_url, &["pipeline", resource_id])?;
        let endpoint = format!("GET {}", url.path());
        let (status, body) = send(SERVICE, &endpoint, authorize(self.client.get(url), token)).await?;
        if !status.is_success() {
            return Err(map_error(SERVICE, &endpoint, status, &body));
        }
        let detail: Option<serde_json::Value> = serde_json::from_str(&body).ok();
        let running = detail
            .as_ref()
            .and_then(|d| d.get("running"))
            .and_then(|r| r.as_bool())
            .unwrap_or(true);
        Ok(PipelineStatus { running, detail })
    }
}
