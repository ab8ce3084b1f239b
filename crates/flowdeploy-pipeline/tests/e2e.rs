//! End-to-end tests for the deployment worker.
//!
//! Each test drives real tasks through the full stack: parameters -> selection
//! resolution -> node compilation -> reconcile -> registry -> task report,
//! against the in-memory collaborators of `flowdeploy_pipeline::testing`.

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::{json, Value};

use flowdeploy_pipeline::testing::{
    FakeCatalog, FakeFlowParser, MemoryRegistry, RecordingTarget, RecordingTaskSource,
    StaticTokens, TargetCall,
};
use flowdeploy_pipeline::{
    group_inputs, AnalyticsHandler, Compensator, EventEmitter, NodeCompiler, ParamExtractor,
    Reconciler, ResolverSettings, SelectionResolver, TaskOutcome, Worker, WorkerEvent,
};
use flowdeploy_remote::{FileModuleRegistry, ModuleRegistry};
use flowdeploy_types::{
    service_id_to_topic, CellConfig, FilterCriteria, FilterType, FlowInput, NodeInput, NodeValue,
    PathOption, PipelineRequest, Task, MODULE_UPDATE_VERSION_FIELD, PIPELINE_ID_FIELD,
};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

const PREFIX: &str = "analytics.";

struct Stack {
    worker: Worker,
    target: Arc<RecordingTarget>,
    registry: Arc<dyn ModuleRegistry>,
    memory: Option<Arc<MemoryRegistry>>,
    source: Arc<RecordingTaskSource>,
}

fn criteria() -> Vec<FilterCriteria> {
    vec![FilterCriteria {
        function_id: "urn:function:get-temperature".into(),
        aspect_id: "urn:aspect:air".into(),
        ..Default::default()
    }]
}

fn catalog() -> FakeCatalog {
    FakeCatalog::new()
        .with_group("group-1", &["dev-b", "dev-a"])
        .with_device("dev-a", "type-1")
        .with_device("dev-b", "type-1")
        .with_path_options(
            &criteria(),
            "type-1",
            vec![PathOption {
                service_id: "urn:service:temp".into(),
                json_paths: vec!["temperature.level".into()],
            }],
        )
        .with_import_topic("import-1", "import_topic_1")
}

fn flow() -> Vec<FlowInput> {
    vec![
        FlowInput {
            id: "node1".into(),
            name: "Average".into(),
            in_ports: vec!["portA".into(), "portB".into()],
            config: vec![CellConfig {
                name: "unit".into(),
                config_type: "string".into(),
            }],
        },
        FlowInput {
            id: "node2".into(),
            name: "Sink".into(),
            in_ports: vec!["in".into()],
            config: vec![],
        },
    ]
}

fn settings() -> ResolverSettings {
    ResolverSettings {
        device_path_prefix: "value.".into(),
        group_path_prefix: "value.".into(),
        ..Default::default()
    }
}

fn build(registry: Arc<dyn ModuleRegistry>, memory: Option<Arc<MemoryRegistry>>) -> Stack {
    let target = Arc::new(RecordingTarget::new("http://engine"));
    let tokens = Arc::new(StaticTokens::new("jwt"));
    let source = Arc::new(RecordingTaskSource::new(Vec::new()));
    let events = EventEmitter::default();

    let compiler = NodeCompiler::new(
        ParamExtractor::new(PREFIX),
        SelectionResolver::new(Arc::new(catalog()), settings()),
        Arc::new(FakeFlowParser::new().with_flow("flow-1", flow())),
    );
    let reconciler = Reconciler::new(compiler, target.clone(), registry.clone(), "analytics");
    let handler = AnalyticsHandler::new(reconciler, registry.clone(), tokens.clone(), events.clone());
    let compensator = Compensator::new(target.clone(), tokens, registry.clone(), events.clone());
    let worker = Worker::new(
        source.clone(),
        Arc::new(handler),
        registry.clone(),
        compensator,
        events,
    );
    Stack {
        worker,
        target,
        registry,
        memory,
        source,
    }
}

fn stack() -> Stack {
    let memory = Arc::new(MemoryRegistry::new());
    build(memory.clone(), Some(memory))
}

fn device(id: &str, service: &str, path: &str) -> Value {
    json!({"device_selection": {"device_id": id, "service_id": service, "path": path}})
}

/// A valid task whose ports are all bound explicitly.
fn task(id: &str) -> Task {
    Task::new("proc-1", id)
        .with_param("analytics.name", "Average temperature")
        .with_param("analytics.flow_id", "flow-1")
        .with_param("analytics.conf.node1.unit", "celsius")
        .with_param("analytics.selection.node1.portA", device("dev-a", "abc:1", "val").to_string())
        .with_param("analytics.selection.node1.portB", "")
        .with_param("analytics.selection.node2.in", device("dev-a", "abc:1", "val").to_string())
}

fn requests(target: &RecordingTarget) -> Vec<PipelineRequest> {
    target
        .calls()
        .into_iter()
        .filter_map(|c| match c {
            TargetCall::Create(r) | TargetCall::Update(r) => Some(r),
            _ => None,
        })
        .collect()
}

fn assert_inputs_invariants(request: &PipelineRequest) {
    for node in &request.nodes {
        let keys: HashSet<String> = node.inputs.iter().map(NodeInput::group_key).collect();
        assert_eq!(keys.len(), node.inputs.len(), "duplicate input key in {}", node.node_id);
        assert!(
            node.inputs.windows(2).all(|w| w[0].topic_name <= w[1].topic_name),
            "inputs of {} are not sorted by topic",
            node.node_id
        );
    }
}

// ---------------------------------------------------------------------------
// Scenario A: explicit device selection
// ---------------------------------------------------------------------------

#[tokio::test]
async fn explicit_device_selection_binds_one_input() {
    let s = stack();
    let outcome = s.worker.process(&task("t1")).await;
    assert!(outcome.is_completed(), "{outcome:?}");

    let request = &requests(&s.target)[0];
    assert_eq!(request.name, "Average temperature");
    assert_eq!(request.merge_strategy, "inner");
    assert_eq!(request.nodes[0].node_id, "node1");
    assert_eq!(request.nodes[0].config[0].value, "celsius");
    assert_eq!(
        request.nodes[0].inputs,
        vec![NodeInput {
            filter_ids: "dev-a".into(),
            filter_type: FilterType::Device,
            topic_name: "abc_1".into(),
            values: vec![NodeValue {
                name: "portA".into(),
                path: "value.val".into(),
            }],
        }]
    );
    assert_inputs_invariants(request);
}

// ---------------------------------------------------------------------------
// Scenario B: device group joined per service
// ---------------------------------------------------------------------------

#[tokio::test]
async fn device_group_joins_members_in_discovery_order() {
    let s = stack();
    let t = task("t1")
        .with_param(
            "analytics.selection.node2.in",
            json!({"device_group_selection": {"id": "group-1"}}).to_string(),
        )
        .with_param("analytics.criteria.node2.in", serde_json::to_string(&criteria()).unwrap());

    assert!(s.worker.process(&t).await.is_completed());

    let request = &requests(&s.target)[0];
    assert_eq!(
        request.nodes[1].inputs,
        vec![NodeInput {
            filter_ids: "dev-b,dev-a".into(),
            filter_type: FilterType::Device,
            topic_name: "urn_service_temp".into(),
            values: vec![NodeValue {
                name: "in".into(),
                path: "value.temperature.level".into(),
            }],
        }]
    );
}

#[tokio::test]
async fn group_selection_without_criteria_fails_before_any_create() {
    let s = stack();
    let t = task("t1").with_param(
        "analytics.selection.node2.in",
        json!({"device_group_selection": {"id": "group-1"}}),
    );
    let outcome = s.worker.process(&t).await;
    let TaskOutcome::Failed { error, compensation } = outcome else {
        panic!("task should fail");
    };
    assert!(error.contains("criteria.node2.in"), "{error}");
    assert!(compensation.is_none());
    assert!(s.target.calls().is_empty());
    assert_eq!(s.source.failed().len(), 1);
}

// ---------------------------------------------------------------------------
// Scenario C: two ports merged into one input
// ---------------------------------------------------------------------------

#[tokio::test]
async fn ports_with_same_topic_are_merged() {
    let s = stack();
    let t = task("t1").with_param(
        "analytics.selection.node1.portB",
        device("dev-a", "abc:1", "other").to_string(),
    );
    assert!(s.worker.process(&t).await.is_completed());

    let request = &requests(&s.target)[0];
    let inputs = &request.nodes[0].inputs;
    assert_eq!(inputs.len(), 1);
    assert_eq!(
        inputs[0].values,
        vec![
            NodeValue {
                name: "portA".into(),
                path: "value.val".into(),
            },
            NodeValue {
                name: "portB".into(),
                path: "value.other".into(),
            },
        ]
    );
    assert_inputs_invariants(request);
}

#[tokio::test]
async fn import_and_device_inputs_are_sorted_by_topic() {
    let s = stack();
    let t = task("t1")
        .with_param(
            "analytics.selection.node1.portA",
            device("dev-a", "zzz:9", "val").to_string(),
        )
        .with_param(
            "analytics.selection.node1.portB",
            json!({"import_selection": {"id": "import-1", "path": "value.x"}}).to_string(),
        );
    assert!(s.worker.process(&t).await.is_completed());

    let request = &requests(&s.target)[0];
    let topics: Vec<_> = request.nodes[0]
        .inputs
        .iter()
        .map(|i| (i.topic_name.as_str(), i.filter_type))
        .collect();
    assert_eq!(
        topics,
        vec![("import_topic_1", FilterType::Import), ("zzz_9", FilterType::Device)]
    );
    assert_inputs_invariants(request);
}

// ---------------------------------------------------------------------------
// Scenario D: same key updates in place
// ---------------------------------------------------------------------------

#[tokio::test]
async fn repeated_key_updates_and_bumps_revision() {
    let s = stack();
    let keyed = |id: &str| task(id).with_param("analytics.key", "avg-temp");

    let first = s.worker.process(&keyed("t1")).await;
    let TaskOutcome::Completed { outputs } = first else {
        panic!("first run should complete");
    };
    let pipeline_id = outputs[PIPELINE_ID_FIELD].as_str().unwrap().to_string();

    for (n, id) in ["t2", "t3", "t4"].into_iter().enumerate() {
        assert!(s.worker.process(&keyed(id)).await.is_completed());
        let modules = s.registry.list_by_type("analytics").await.unwrap();
        assert_eq!(modules.len(), 1);
        assert_eq!(
            modules[0].module_data[MODULE_UPDATE_VERSION_FIELD],
            json!(n as i64 + 2)
        );
        assert_eq!(modules[0].stored_pipeline_id(), Some(pipeline_id.as_str()));
    }

    let calls = s.target.calls();
    let creates = calls.iter().filter(|c| matches!(c, TargetCall::Create(_))).count();
    assert_eq!(creates, 1);
    for call in &calls[1..] {
        match call {
            TargetCall::Update(r) => assert_eq!(r.id.as_deref(), Some(pipeline_id.as_str())),
            other => panic!("expected update, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn distinct_keys_create_distinct_pipelines() {
    let s = stack();
    assert!(s
        .worker
        .process(&task("t1").with_param("analytics.key", "a"))
        .await
        .is_completed());
    assert!(s
        .worker
        .process(&task("t2").with_param("analytics.key", "b"))
        .await
        .is_completed());
    assert_eq!(s.target.live_pipelines().len(), 2);
    assert_eq!(s.registry.list_by_type("analytics").await.unwrap().len(), 2);
}

// ---------------------------------------------------------------------------
// Scenario E: compensation after a downstream failure
// ---------------------------------------------------------------------------

#[tokio::test]
async fn downstream_failure_deletes_created_pipeline_once() {
    let s = stack();
    let memory = s.memory.clone().unwrap();
    memory.fail_upserts(true);
    let mut rx = s.worker.events().subscribe();

    let outcome = s.worker.process(&task("t1")).await;
    assert!(!outcome.is_completed());

    let deletes: Vec<_> = s
        .target
        .calls()
        .into_iter()
        .filter(|c| matches!(c, TargetCall::Delete { .. }))
        .collect();
    assert_eq!(deletes.len(), 1);
    assert!(s.target.live_pipelines().is_empty());
    assert!(s.source.completed().is_empty());
    assert_eq!(s.source.failed().len(), 1);

    let failed = flowdeploy_pipeline::events::drain(&mut rx)
        .into_iter()
        .find(|e| matches!(e, WorkerEvent::TaskFailed { .. }));
    assert!(matches!(
        failed,
        Some(WorkerEvent::TaskFailed { compensated: 1, .. })
    ));
}

#[tokio::test]
async fn failed_create_leaves_nothing_to_compensate() {
    let s = stack();
    s.target.fail_create(true);
    let outcome = s.worker.process(&task("t1")).await;
    let TaskOutcome::Failed { compensation, .. } = outcome else {
        panic!("task should fail");
    };
    assert!(compensation.is_none());
    assert_eq!(s.target.calls().len(), 1);
}

#[tokio::test]
async fn failed_update_keeps_existing_pipeline() {
    let s = stack();
    let keyed = |id: &str| task(id).with_param("analytics.key", "k");
    assert!(s.worker.process(&keyed("t1")).await.is_completed());

    s.target.fail_update(true);
    let outcome = s.worker.process(&keyed("t2")).await;
    assert!(!outcome.is_completed());
    assert_eq!(s.target.live_pipelines().len(), 1);
    let modules = s.registry.list_by_type("analytics").await.unwrap();
    assert_eq!(modules[0].module_data[MODULE_UPDATE_VERSION_FIELD], json!(1));
}

// ---------------------------------------------------------------------------
// Module data
// ---------------------------------------------------------------------------

#[tokio::test]
async fn user_module_data_cannot_override_bookkeeping() {
    let s = stack();
    let t = task("t1").with_param(
        "analytics.module_data",
        json!({"pipeline_id": "forged", "owner": "team-a"}).to_string(),
    );
    let TaskOutcome::Completed { outputs } = s.worker.process(&t).await else {
        panic!("task should complete");
    };
    let module = &s.registry.list_by_type("analytics").await.unwrap()[0];
    assert_eq!(module.module_data["owner"], json!("team-a"));
    assert_eq!(module.module_data[PIPELINE_ID_FIELD], outputs[PIPELINE_ID_FIELD]);
}

#[tokio::test]
async fn malformed_module_data_aborts_before_create() {
    let s = stack();
    let t = task("t1").with_param("analytics.module_data", "[1, 2");
    assert!(!s.worker.process(&t).await.is_completed());
    assert!(s.target.calls().is_empty());
}

// ---------------------------------------------------------------------------
// Pure invariants
// ---------------------------------------------------------------------------

#[test]
fn topic_conversion_is_idempotent() {
    for id in ["urn:infai:ses:service:1#a", "abc:1", "plain", "::##", ""] {
        let once = service_id_to_topic(id);
        assert_eq!(service_id_to_topic(&once), once);
        assert!(!once.contains(':') && !once.contains('#'));
    }
}

#[test]
fn grouping_an_already_grouped_set_is_a_no_op() {
    let input = |topic: &str, ids: &str, port: &str| NodeInput {
        filter_ids: ids.into(),
        filter_type: FilterType::Device,
        topic_name: topic.into(),
        values: vec![NodeValue {
            name: port.into(),
            path: port.into(),
        }],
    };
    let grouped = group_inputs(vec![
        input("a", "1", "x"),
        input("b", "1", "y"),
        input("a", "1", "z"),
        input("a", "2", "w"),
    ]);
    assert_eq!(grouped.len(), 3);
    assert_eq!(group_inputs(grouped.clone()), grouped);
}

// ---------------------------------------------------------------------------
// File-backed registry
// ---------------------------------------------------------------------------

#[tokio::test]
async fn file_registry_survives_restart_between_updates() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("registry.json");

    let registry = Arc::new(
        FileModuleRegistry::open(&path)
            .await
            .unwrap()
            .with_default_user("owner"),
    );
    let s = build(registry, None);
    let keyed = |id: &str| task(id).with_param("analytics.key", "k");
    assert!(s.worker.process(&keyed("t1")).await.is_completed());

    let reopened = Arc::new(
        FileModuleRegistry::open(&path)
            .await
            .unwrap()
            .with_default_user("owner"),
    );
    let modules = reopened.list_by_type("analytics").await.unwrap();
    assert_eq!(modules.len(), 1);
    assert_eq!(modules[0].module_data[MODULE_UPDATE_VERSION_FIELD], json!(1));
    assert_eq!(modules[0].delete_info.as_ref().unwrap().user_id, "owner");
}
