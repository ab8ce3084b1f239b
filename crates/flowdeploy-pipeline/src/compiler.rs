//! Node compilation: flow input templates plus task parameters into a `PipelineRequest`.

use std::collections::HashMap;
use std::sync::Arc;

use flowdeploy_remote::{FlowParser, Token};
use flowdeploy_types::{FlowInput, NodeConfig, NodeInput, PipelineNode, PipelineRequest, Result, Task};

use crate::params::ParamExtractor;
use crate::selection::{requires_criteria, SelectionResolver};

/// Merge inputs sharing `(topic, filter type, filter ids)`, concatenating their values.
///
/// Groups keep the order in which their key was first seen.
pub fn group_inputs(inputs: Vec<NodeInput>) -> Vec<NodeInput> {
    let mut grouped: Vec<NodeInput> = Vec::with_capacity(inputs.len());
    let mut index: HashMap<String, usize> = HashMap::new();
    for input in inputs {
        let key = input.group_key();
        match index.get(&key) {
            Some(&i) => grouped[i].values.extend(input.values),
            None => {
                index.insert(key, grouped.len());
                grouped.push(input);
            }
        }
    }
    grouped
}

/// Stable sort by topic name, ascending.
pub fn sort_inputs(inputs: &mut [NodeInput]) {
    inputs.sort_by(|a, b| a.topic_name.cmp(&b.topic_name));
}

/// Compiles task parameters into pipeline nodes and full pipeline requests.
#[derive(Clone)]
pub struct NodeCompiler {
    params: ParamExtractor,
    resolver: SelectionResolver,
    flow_parser: Arc<dyn FlowParser>,
}

impl NodeCompiler {
    pub fn new(
        params: ParamExtractor,
        resolver: SelectionResolver,
        flow_parser: Arc<dyn FlowParser>,
    ) -> Self {
        Self {
            params,
            resolver,
            flow_parser,
        }
    }

    pub fn params(&self) -> &ParamExtractor {
        &self.params
    }

    /// Build the full request (without `id`).
    ///
    /// Every scalar parameter is validated before the flow parser is contacted.
    pub async fn compile_request(&self, token: &Token, task: &Task) -> Result<PipelineRequest> {
        let flow_id = self.params.flow_id(task)?;
        let name = self.params.pipeline_name(task)?;
        let window_time = self.params.window_time(task)?;
        let merge_strategy = self.params.merge_strategy(task)?;
        let consume_all_messages = self.params.consume_all_messages(task)?;
        let description = self.params.description(task);

        let flow_inputs = self.flow_parser.flow_inputs(token, &flow_id).await?;
        let nodes = self.compile_nodes(token, task, &flow_inputs).await?;

        Ok(PipelineRequest {
            id: None,
            flow_id,
            name,
            description,
            window_time,
            merge_strategy,
            consume_all_messages,
            nodes,
        })
    }

    /// One [`PipelineNode`] per flow input, in flow order.
    pub async fn compile_nodes(
        &self,
        token: &Token,
        task: &Task,
        flow_inputs: &[FlowInput],
    ) -> Result<Vec<PipelineNode>> {
        let mut nodes = Vec::with_capacity(flow_inputs.len());
        for flow_input in flow_inputs {
            nodes.push(self.compile_node(token, task, flow_input).await?);
        }
        Ok(nodes)
    }

    async fn compile_node(
        &self,
        token: &Token,
        task: &Task,
        flow_input: &FlowInput,
    ) -> Result<PipelineNode> {
        let node_id = &flow_input.id;

        let mut config = Vec::with_capacity(flow_input.config.len());
        for conf in &flow_input.config {
            config.push(NodeConfig {
                name: conf.name.clone(),
                value: self.params.node_config(task, node_id, &conf.name)?,
            });
        }

        let mut inputs = Vec::new();
        for port in &flow_input.in_ports {
            let Some(selection) = self.params.selection(task, node_id, port)? else {
                tracing::debug!(node_id = %node_id, port = %port, "Empty selection, port skipped");
                continue;
            };
            let criteria = if requires_criteria(&selection) {
                Some(self.params.criteria(task, node_id, port)?)
            } else {
                None
            };
            let service_criteria = self.params.service_criteria(task, node_id, port)?;
            let resolved = self
                .resolver
                .resolve(token, &selection, port, criteria.as_deref(), &service_criteria)
                .await?;
            inputs.extend(resolved);
        }

        let mut inputs = group_inputs(inputs);
        sort_inputs(&mut inputs);

        Ok(PipelineNode {
            node_id: node_id.clone(),
            inputs,
            config,
            persist_data: self.params.persist_data(task, node_id)?,
        })
    }
}
