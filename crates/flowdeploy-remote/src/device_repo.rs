use std::collections::BTreeMap;

use serde::Deserialize;

use flowdeploy_types::{Device, FilterCriteria, PathOption, PathOptions, Result};

use crate::http::{authorize, decode, join_url, send};
use crate::Token;

const SERVICE: &str = "device-repository";

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct DeviceGroup {
    #[serde(default)]
    device_ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct DeviceTypeSelectable {
    #[serde(default)]
    device_type_id: String,
    #[serde(default)]
    service_path_options: BTreeMap<String, Vec<ServicePathOption>>,
}

#[derive(Debug, Deserialize)]
struct ServicePathOption {
    service_id: String,
    #[serde(default)]
    path: String,
}

// ---------------------------------------------------------------------------
// DeviceRepositoryClient
// ---------------------------------------------------------------------------

/// Client for the device repository: groups, devices, and device-type selectables.
#[derive(Debug, Clone)]
pub struct DeviceRepositoryClient {
    client: reqwest::Client,
    base_url: String,
}

impl DeviceRepositoryClient {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }

    pub async fn group_members(&self, token: &Token, group_id: &str) -> Result<Vec<String>> {
        let url = join_url(&self.base_url, &["device-groups", group_id])?;
        let endpoint = format!("GET {}", url.path());
        let (status, body) = send(SERVICE, &endpoint, authorize(self.client.get(url), token)).await?;
        let group: DeviceGroup = decode(SERVICE, &endpoint, status, &body)?;
        Ok(group.device_ids)
    }

    pub async fn devices(&self, token: &Token, ids: &[String]) -> Result<Vec<Device>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let url = join_url(&self.base_url, &["v3", "devices"])?;
        let endpoint = format!("GET {}", url.path());
        let request = self.client.get(url).query(&[
            ("ids", ids.join(",")),
            ("limit", ids.len().to_string()),
            ("offset", "0".to_string()),
            ("sort", "name.asc".to_string()),
        ]);
        let (status, body) = send(SERVICE, &endpoint, authorize(request, token)).await?;
        decode(SERVICE, &endpoint, status, &body)
    }

    /// Query selectables for `criteria` and fold them into per-device-type path options.
    ///
    /// Only the requested device types are kept, in request order. Options whose
    /// `service_id` disagrees with the service they are listed under are dropped.
    pub async fn path_options(
        &self,
        token: &Token,
        criteria: &[FilterCriteria],
        device_type_ids: &[String],
    ) -> Result<PathOptions> {
        let criteria: Vec<FilterCriteria> = criteria
            .iter()
            .map(FilterCriteria::with_default_interaction)
            .collect();
        let url = join_url(&self.base_url, &["v2", "query", "device-type-selectables"])?;
        let endpoint = format!("POST {}", url.path());
        let request = self
            .client
            .post(url)
            .query(&[
                ("services_must_match_all_criteria", "true"),
                ("include_id_modified", "true"),
            ])
            .json(&criteria);
        let (status, body) = send(SERVICE, &endpoint, authorize(request, token)).await?;
        let selectables: Vec<DeviceTypeSelectable> = decode(SERVICE, &endpoint, status, &body)?;
        Ok(fold_selectables(selectables, device_type_ids))
    }
}

fn fold_selectables(selectables: Vec<DeviceTypeSelectable>, device_type_ids: &[String]) -> PathOptions {
    let mut result = PathOptions::new();
    for dt_id in device_type_ids {
        for selectable in selectables.iter().filter(|s| &s.device_type_id == dt_id) {
            for (service_id, options) in &selectable.service_path_options {
                let mut json_paths = Vec::new();
                for option in options {
                    if &option.service_id == service_id {
                        json_paths.push(option.path.clone());
                    } else {
                        tracing::warn!(
                            expected = %service_id,
                            found = %option.service_id,
                            "Unexpected service id in service path options"
                        );
                    }
                }
                result.entry(dt_id.clone()).or_default().push(PathOption {
                    service_id: service_id.clone(),
                    json_paths,
                });
            }
        }
    }
    result
}
