use async_trait::async_trait;

use flowdeploy_types::{Device, FilterCriteria, PathOptions, Result};

use crate::{Catalog, DeviceRepositoryClient, ImportsClient, Token};

/// [`Catalog`] backed by the device repository and the import deployment service.
#[derive(Debug, Clone)]
pub struct HttpCatalog {
    devices: DeviceRepositoryClient,
    imports: ImportsClient,
}

impl HttpCatalog {
    pub fn new(devices: DeviceRepositoryClient, imports: ImportsClient) -> Self {
        Self { devices, imports }
    }

    pub fn from_urls(
        client: reqwest::Client,
        device_repository_url: impl Into<String>,
        import_deploy_url: impl Into<String>,
    ) -> Self {
        Self::new(
            DeviceRepositoryClient::new(client.clone(), device_repository_url),
            ImportsClient::new(client, import_deploy_url),
        )
    }
}

#[async_trait]
impl Catalog for HttpCatalog {
    async fn device_group_members(&self, token: &Token, group_id: &str) -> Result<Vec<String>> {
        self.devices.group_members(token, group_id).await
    }

    async fn devices(&self, token: &Token, device_ids: &[String]) -> Result<Vec<Device>> {
        self.devices.devices(token, device_ids).await
    }

    async fn path_options(
        &self,
        token: &Token,
        criteria: &[FilterCriteria],
        device_type_ids: &[String],
    ) -> Result<PathOptions> {
        self.devices
            .path_options(token, criteria, device_type_ids)
            .await
    }

    async fn import_topic(&self, token: &Token, import_id: &str) -> Result<String> {
        self.imports.topic(token, import_id).await
    }
}
