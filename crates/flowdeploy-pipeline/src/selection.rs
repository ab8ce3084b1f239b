//! Selection resolution: one port's selection (+ criteria) into topic-scoped inputs.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use flowdeploy_remote::{Catalog, Token};
use flowdeploy_types::{
    service_id_to_topic, Device, DeviceSelection, FilterCriteria, FilterType, FlowDeployError,
    ImportSelection, NodeInput, NodeValue, PathOptions, Result, Selection,
};

use crate::config::ResolverSettings;

/// Whether resolving `selection` goes through criteria (and therefore requires them).
pub fn requires_criteria(selection: &Selection) -> bool {
    match selection {
        Selection::Device(d) => d.service_id.is_none(),
        Selection::DeviceGroup(_) => true,
        Selection::Import(_) => false,
    }
}

// ---------------------------------------------------------------------------
// ServiceIndex
// ---------------------------------------------------------------------------

/// Services discovered for a device list, with the devices offering them and their paths.
///
/// `service_ids` is in first-seen order; device ids and paths are deduplicated
/// per service in first-seen order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceIndex {
    pub service_ids: Vec<String>,
    pub devices: HashMap<String, Vec<String>>,
    pub paths: HashMap<String, Vec<String>>,
}

impl ServiceIndex {
    pub fn build(devices: &[Device], options: &PathOptions) -> Self {
        let mut index = ServiceIndex::default();
        for device in devices {
            let Some(device_options) = options.get(&device.device_type_id) else {
                continue;
            };
            for option in device_options.iter().filter(|o| !o.json_paths.is_empty()) {
                let sid = &option.service_id;
                if !index.paths.contains_key(sid) {
                    index.service_ids.push(sid.clone());
                }
                push_unique(index.devices.entry(sid.clone()).or_default(), &device.id);
                let paths = index.paths.entry(sid.clone()).or_default();
                for path in &option.json_paths {
                    push_unique(paths, path);
                }
            }
        }
        index
    }

    /// Keep only services in `allowed`, across the id list and both maps.
    pub fn retain_services(&mut self, allowed: &HashSet<String>) {
        self.service_ids.retain(|id| allowed.contains(id));
        self.devices.retain(|id, _| allowed.contains(id));
        self.paths.retain(|id, _| allowed.contains(id));
    }
}

fn push_unique(list: &mut Vec<String>, value: &str) {
    if !list.iter().any(|v| v == value) {
        list.push(value.to_string());
    }
}

/// Device type ids of `devices`, deduplicated in first-seen order.
fn device_type_ids(devices: &[Device]) -> Vec<String> {
    let mut ids = Vec::new();
    for device in devices {
        push_unique(&mut ids, &device.device_type_id);
    }
    ids
}

// ---------------------------------------------------------------------------
// SelectionResolver
// ---------------------------------------------------------------------------

/// Turns a [`Selection`] into [`NodeInput`] bindings using the catalog.
#[derive(Clone)]
pub struct SelectionResolver {
    catalog: Arc<dyn Catalog>,
    settings: ResolverSettings,
}

impl SelectionResolver {
    pub fn new(catalog: Arc<dyn Catalog>, settings: ResolverSettings) -> Self {
        Self { catalog, settings }
    }

    pub fn settings(&self) -> &ResolverSettings {
        &self.settings
    }

    /// Resolve one port's selection.
    ///
    /// `criteria` must be present for criteria-based selections (see
    /// [`requires_criteria`]); `service_criteria` narrows the surviving services
    /// when non-empty.
    pub async fn resolve(
        &self,
        token: &Token,
        selection: &Selection,
        port: &str,
        criteria: Option<&[FilterCriteria]>,
        service_criteria: &[FilterCriteria],
    ) -> Result<Vec<NodeInput>> {
        match selection {
            Selection::Device(device) if device.service_id.is_some() => {
                self.resolve_device(device, port).map(|input| vec![input])
            }
            Selection::Device(device) => {
                let criteria = criteria.ok_or_else(|| missing_criteria(port))?;
                self.resolve_by_criteria(
                    token,
                    std::slice::from_ref(&device.device_id),
                    criteria,
                    service_criteria,
                    port,
                )
                .await
            }
            Selection::DeviceGroup(group) => {
                let criteria = criteria.ok_or_else(|| missing_criteria(port))?;
                let members = self.catalog.device_group_members(token, &group.id).await?;
                if members.is_empty() {
                    tracing::warn!(group_id = %group.id, port, "Device group has no members");
                }
                self.resolve_by_criteria(token, &members, criteria, service_criteria, port)
                    .await
            }
            Selection::Import(import) => self
                .resolve_import(token, import, port)
                .await
                .map(|input| vec![input]),
        }
    }

    fn resolve_device(&self, selection: &DeviceSelection, port: &str) -> Result<NodeInput> {
        let service_id = selection.service_id.as_deref().ok_or_else(|| {
            FlowDeployError::InvalidSelection(format!(
                "device selection of port '{port}' is missing a service id"
            ))
        })?;
        let path = selection.path.as_deref().ok_or_else(|| {
            FlowDeployError::InvalidSelection(format!(
                "device selection of port '{port}' is missing a path"
            ))
        })?;
        Ok(NodeInput {
            filter_ids: selection.device_id.clone(),
            filter_type: FilterType::Device,
            topic_name: service_id_to_topic(service_id),
            values: vec![NodeValue {
                name: port.to_string(),
                path: format!("{}{}", self.settings.device_path_prefix, path),
            }],
        })
    }

    async fn resolve_import(
        &self,
        token: &Token,
        selection: &ImportSelection,
        port: &str,
    ) -> Result<NodeInput> {
        if selection.id.is_empty() {
            return Err(FlowDeployError::InvalidSelection(format!(
                "import selection of port '{port}' is missing an id"
            )));
        }
        let path = selection.path.as_deref().ok_or_else(|| {
            FlowDeployError::InvalidSelection(format!(
                "import selection of port '{port}' is missing a path"
            ))
        })?;
        let topic = self.catalog.import_topic(token, &selection.id).await?;

        let mut path = path;
        if self.settings.remove_import_path_root {
            if let Some((_, rest)) = path.split_once('.') {
                path = rest;
            }
        }
        Ok(NodeInput {
            filter_ids: selection.id.clone(),
            filter_type: FilterType::Import,
            topic_name: topic,
            values: vec![NodeValue {
                name: port.to_string(),
                path: format!("{}{}", self.settings.import_path_prefix, path),
            }],
        })
    }

    async fn resolve_by_criteria(
        &self,
        token: &Token,
        device_ids: &[String],
        criteria: &[FilterCriteria],
        service_criteria: &[FilterCriteria],
        port: &str,
    ) -> Result<Vec<NodeInput>> {
        let devices = self.catalog.devices(token, device_ids).await?;
        let type_ids = device_type_ids(&devices);
        let options = self.catalog.path_options(token, criteria, &type_ids).await?;
        let mut index = ServiceIndex::build(&devices, &options);

        if !service_criteria.is_empty() {
            let filter_options = self
                .catalog
                .path_options(token, service_criteria, &type_ids)
                .await?;
            let allowed: HashSet<String> = ServiceIndex::build(&devices, &filter_options)
                .service_ids
                .into_iter()
                .collect();
            index.retain_services(&allowed);
        }

        Ok(self.index_to_inputs(&index, port))
    }

    fn index_to_inputs(&self, index: &ServiceIndex, port: &str) -> Vec<NodeInput> {
        let mut inputs = Vec::new();
        for service_id in &index.service_ids {
            let device_ids = index
                .devices
                .get(service_id)
                .map(|ids| ids.join(","))
                .unwrap_or_default();
            if device_ids.is_empty() {
                tracing::warn!(service_id = %service_id, port, "No devices for service, skipping");
                continue;
            }
            let paths = match index.paths.get(service_id) {
                Some(paths) if !paths.is_empty() => paths,
                _ => {
                    tracing::warn!(service_id = %service_id, port, "No paths for service, skipping");
                    continue;
                }
            };
            let selected = if self.settings.enable_multiple_paths {
                &paths[..]
            } else {
                &paths[..1]
            };
            let values = selected
                .iter()
                .map(|path| NodeValue {
                    name: port.to_string(),
                    path: format!("{}{}", self.settings.group_path_prefix, path),
                })
                .collect();
            inputs.push(NodeInput {
                filter_ids: device_ids,
                filter_type: FilterType::Device,
                topic_name: service_id_to_topic(service_id),
                values,
            });
        }
        inputs
    }
}

fn missing_criteria(port: &str) -> FlowDeployError {
    FlowDeployError::MissingCriteria {
        key: port.to_string(),
    }
}
