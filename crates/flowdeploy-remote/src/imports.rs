use serde::Deserialize;

use flowdeploy_types::Result;

use crate::http::{authorize, decode, join_url, send};
use crate::Token;

const SERVICE: &str = "import-deploy";

#[derive(Debug, Deserialize)]
struct ImportInstance {
    #[serde(default)]
    kafka_topic: String,
}

/// Client for the import deployment service.
#[derive(Debug, Clone)]
pub struct ImportsClient {
    client: reqwest::Client,
    base_url: String,
}

impl ImportsClient {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }

    /// The topic an import instance publishes to.
    pub async fn topic(&self, token: &Token, import_id: &str) -> Result<String> {
        let url = join_url(&self.base_url, &["instances", import_id])?;
        let endpoint = format!("GET {}", url.path());
        let (status, body) = send(SERVICE, &endpoint, authorize(self.client.get(url), token)).await?;
        let instance: ImportInstance = decode(SERVICE, &endpoint, status, &body)?;
        Ok(instance.kafka_topic)
    }
}
