use async_trait::async_trait;

use flowdeploy_types::{FlowInput, Result};

use crate::http::{authorize, decode, join_url, send};
use crate::{FlowParser, Token};

const SERVICE: &str = "flow-parser";

/// [`FlowParser`] backed by the flow parser's `/flow/getinputs/{id}` endpoint.
#[derive(Debug, Clone)]
pub struct FlowParserClient {
    client: reqwest::Client,
    base_url: String,
}

impl FlowParserClient {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl FlowParser for FlowParserClient {
    async fn flow_inputs(&self, token: &Token, flow_id: &str) -> Result<Vec<FlowInput>> {
        let url = join_url(&self.base_url, &["flow", "getinputs", flow_id])?;
        let endpoint = format!("GET {}", url.path());
        let (status, body) = send(SERVICE, &endpoint, authorize(self.client.get(url), token)).await?;
        decode(SERVICE, &endpoint, status, &body)
    }
}
