//! Shared plumbing for the reqwest-based clients.

use std::time::Duration;

use serde::de::DeserializeOwned;

use flowdeploy_types::{FlowDeployError, Result};

use crate::Token;

/// Build the HTTP client shared by every remote collaborator.
///
/// Every call is bounded by `timeout`; there is no automatic retry.
pub fn build_client(timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| FlowDeployError::Other(format!("failed to build HTTP client: {e}")))
}

/// Append path segments to `base`, percent-encoding each one.
pub(crate) fn join_url(base: &str, segments: &[&str]) -> Result<reqwest::Url> {
    let mut url = reqwest::Url::parse(base)
        .map_err(|e| FlowDeployError::Other(format!("invalid base URL '{base}': {e}")))?;
    url.path_segments_mut()
        .map_err(|_| FlowDeployError::Other(format!("base URL '{base}' cannot carry a path")))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

/// Attach the acting user's credentials.
pub(crate) fn authorize(builder: reqwest::RequestBuilder, token: &Token) -> reqwest::RequestBuilder {
    builder
        .header("Authorization", token.bearer())
        .header("X-UserId", &token.user_id)
}

/// Send a request and read the whole body.
///
/// Transport failures become `UpstreamUnavailable`; the status is returned as-is.
pub(crate) async fn send(
    service: &str,
    endpoint: &str,
    builder: reqwest::RequestBuilder,
) -> Result<(reqwest::StatusCode, String)> {
    let resp = builder.send().await.map_err(|e| map_transport_error(service, endpoint, e))?;
    let status = resp.status();
    let body = resp
        .text()
        .await
        .map_err(|e| map_transport_error(service, endpoint, e))?;
    Ok((status, body))
}

/// Fail on non-2xx statuses, otherwise decode the JSON body.
pub(crate) fn decode<T: DeserializeOwned>(
    service: &str,
    endpoint: &str,
    status: reqwest::StatusCode,
    body: &str,
) -> Result<T> {
    if !status.is_success() {
        return Err(map_error(service, endpoint, status, body));
    }
    serde_json::from_str(body).map_err(|e| {
        FlowDeployError::unexpected_response(
            service,
            endpoint,
            status.as_u16(),
            &format!("undecodable body ({e}): {body}"),
        )
    })
}

pub(crate) fn map_error(
    service: &str,
    endpoint: &str,
    status: reqwest::StatusCode,
    body: &str,
) -> FlowDeployError {
    FlowDeployError::unexpected_response(service, endpoint, status.as_u16(), body)
}

fn map_transport_error(service: &str, endpoint: &str, err: reqwest::Error) -> FlowDeployError {
    let message = if err.is_timeout() {
        format!("request timed out: {err}")
    } else {
        err.to_string()
    };
    FlowDeployError::UpstreamUnavailable {
        service: service.into(),
        endpoint: endpoint.into(),
        message,
    }
}
