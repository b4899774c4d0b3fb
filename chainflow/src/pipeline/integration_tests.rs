//! End-to-end tests: configuration document to executed pipeline.

use crate::cancellation::CancellationToken;
use crate::components::{BuildScope, ComponentArgs, ComponentHandle, ComponentRegistry, FactoryRegistry};
use crate::config::{ConfigDocument, EngineSettings};
use crate::engine::Engine;
use crate::errors::{ChainflowError, ExecutionError};
use crate::events::CollectingEventSink;
use crate::pipeline::{JitterStrategy, PipelineBuilder};
use crate::template::Bindings;
use crate::testing::{
    recording_factory, register_prompt_factories, shared_factory, FailingComponent, FlakyComponent,
    RecordingComponent, SlowComponent,
};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

const CONFIG: &str = r#"
test01:
  excute_path: messages-OpenAiStyleModel
  converter:
    - name: messages
      type: list
      value:
        - SystemPrompt
        - HumanPrompt
  components:
    - name: HumanPrompt
      param:
        human_message: "{{query}}"
    - name: SystemPrompt
      param:
        system_prompt: You are a concise assistant.
    - name: OpenAiStyleModel
      param:
        model: qwen-turbo
        parameter:
          max_retry: 2
add_text_vector:
  excute_path: TextSplitter-ChromaUpsertStore
  converter:
    - name: embedding_func
      type: instance
      value: OpenAiStyleEmbeddings
  components:
    - name: TextSplitter
      param:
        chunk_size: 500
    - name: OpenAiStyleEmbeddings
      param:
        model: bge-m3
    - name: ChromaUpsertStore
      param:
        embedding_func:
        collection: knowledge
query_text_vector:
  excute_path: ChromaRetriever
  converter:
    - name: embed_function
      type: instance
      value: OpenAiStyleEmbeddings
    - name: embedding_model
      type: instance
      value: OpenAiStyleEmbeddings
  components:
    - name: OpenAiStyleEmbeddings
      param:
        model: bge-m3
    - name: ChromaRetriever
      param:
        embed_function:
        embedding_model:
        query: "{{query}}"
fan_in:
  excute_path: Left,Right-Merge
  components:
    - name: Left
    - name: Right
    - name: Merge
"#;

fn document() -> ConfigDocument {
    ConfigDocument::from_yaml_str(CONFIG).unwrap()
}

fn fast_settings() -> EngineSettings {
    EngineSettings::new().with_retry_delays(1, 5).with_jitter(JitterStrategy::None)
}

fn base_factories() -> FactoryRegistry {
    let factories = FactoryRegistry::new();
    register_prompt_factories(&factories);
    for name in [
        "TextSplitter",
        "OpenAiStyleEmbeddings",
        "ChromaUpsertStore",
        "ChromaRetriever",
        "Left",
        "Right",
        "Merge",
    ] {
        factories.register(name, recording_factory());
    }
    factories
}

fn engine_with_model(model: ComponentHandle) -> (Engine, Arc<CollectingEventSink>) {
    let factories = base_factories();
    factories.register("OpenAiStyleModel", move |_args: &ComponentArgs| Ok(Arc::clone(&model)));
    let sink = Arc::new(CollectingEventSink::new());
    let engine = Engine::new(document())
        .with_factories(Arc::new(factories))
        .with_settings(fast_settings())
        .with_event_sink(sink.clone());
    (engine, sink)
}

#[tokio::test]
async fn test01_model_receives_rendered_messages() {
    let model = Arc::new(RecordingComponent::new("OpenAiStyleModel").with_output(json!("X in one line")));
    let (engine, _) = engine_with_model(model.clone());

    let report = engine
        .execute("test01", &Bindings::new().with("query", json!("Summarize X")))
        .await
        .unwrap();

    assert_eq!(report.output, json!("X in one line"));
    let calls = model.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(
        calls[0].input,
        Some(json!([
            {"role": "system", "content": "You are a concise assistant."},
            {"role": "user", "content": "Summarize X"},
        ]))
    );
    assert_eq!(calls[0].params.get("model"), Some(&json!("qwen-turbo")));
}

#[tokio::test]
async fn test01_without_query_fails_at_render_time() {
    let model = Arc::new(RecordingComponent::new("OpenAiStyleModel"));
    let (engine, _) = engine_with_model(model.clone());

    let err = engine.execute("test01", &Bindings::new()).await.unwrap_err();

    assert!(!err.is_configuration_error());
    assert!(matches!(
        err,
        ChainflowError::Execution(ExecutionError::Render { ref stage, .. }) if stage == "HumanPrompt"
    ));
    assert!(model.calls().is_empty());
}

#[tokio::test]
async fn test_two_failures_then_success_takes_three_calls() {
    let model = Arc::new(FlakyComponent::new("OpenAiStyleModel", 2, json!("ok")));
    let (engine, sink) = engine_with_model(model.clone());

    let report = engine
        .execute("test01", &Bindings::new().with("query", json!("q")))
        .await
        .unwrap();

    assert_eq!(report.output, json!("ok"));
    assert_eq!(model.call_count(), 3);
    assert_eq!(report.stage("OpenAiStyleModel").unwrap().attempts, 3);
    assert_eq!(sink.events_of_type("stage.retrying").len(), 2);
}

#[tokio::test]
async fn test_always_failing_stops_after_three_attempts() {
    let model = Arc::new(FailingComponent::transient("OpenAiStyleModel", "503 from upstream"));
    let (engine, sink) = engine_with_model(model.clone());

    let err = engine
        .execute("test01", &Bindings::new().with("query", json!("q")))
        .await
        .unwrap_err();

    match err {
        ChainflowError::Execution(ExecutionError::StageFailed { stage, attempts, cause }) => {
            assert_eq!(stage, "OpenAiStyleModel");
            assert_eq!(attempts, 3);
            assert_eq!(cause.message, "503 from upstream");
        }
        other => panic!("expected stage failure, got {other:?}"),
    }
    assert_eq!(model.call_count(), 3);
    assert_eq!(
        sink.event_types(),
        vec![
            "pipeline.started",
            "stage.started",
            "stage.completed",
            "stage.started",
            "stage.retrying",
            "stage.retrying",
            "stage.failed",
            "pipeline.failed",
        ]
    );
}

#[tokio::test]
async fn test_failed_run_leaves_pipeline_reusable() {
    let model = Arc::new(FlakyComponent::new("OpenAiStyleModel", 3, json!("recovered")));
    let factories = base_factories();
    factories.register("OpenAiStyleModel", shared_factory(model.clone()));
    let registry = ComponentRegistry::new();
    let pipeline = PipelineBuilder::new(&factories, &registry)
        .with_settings(fast_settings())
        .build("test01", document().pipeline("test01").unwrap())
        .unwrap();
    let bindings = Bindings::new().with("query", json!("q"));
    let sink = CollectingEventSink::new();

    let first = crate::pipeline::run(&pipeline, &bindings, &CancellationToken::new(), &sink).await;
    assert!(first.is_err());

    let second = crate::pipeline::run(&pipeline, &bindings, &CancellationToken::new(), &sink)
        .await
        .unwrap();
    assert_eq!(second.output, json!("recovered"));
    assert_eq!(model.call_count(), 4);
}

#[test]
fn test_shared_scope_constructs_one_embeddings_client() {
    let factories = base_factories();
    let registry = ComponentRegistry::new();
    let doc = document();
    let scope = BuildScope::new();

    let add = PipelineBuilder::new(&factories, &registry)
        .with_scope(scope)
        .build("add_text_vector", doc.pipeline("add_text_vector").unwrap())
        .unwrap();
    let query = PipelineBuilder::new(&factories, &registry)
        .with_scope(scope)
        .build("query_text_vector", doc.pipeline("query_text_vector").unwrap())
        .unwrap();

    let a = add.converters().instance("embedding_func").unwrap();
    let b = query.converters().instance("embed_function").unwrap();
    let c = query.converters().instance("embedding_model").unwrap();
    assert!(Arc::ptr_eq(a, b));
    assert!(Arc::ptr_eq(b, c));
    assert_eq!(registry.constructions(), 1);
}

#[test]
fn test_separate_builds_construct_independent_clients() {
    let factories = base_factories();
    let registry = ComponentRegistry::new();
    let doc = document();

    let add = PipelineBuilder::new(&factories, &registry)
        .build("add_text_vector", doc.pipeline("add_text_vector").unwrap())
        .unwrap();
    let query = PipelineBuilder::new(&factories, &registry)
        .build("query_text_vector", doc.pipeline("query_text_vector").unwrap())
        .unwrap();

    assert_ne!(add.scope(), query.scope());
    assert!(!Arc::ptr_eq(
        add.converters().instance("embedding_func").unwrap(),
        query.converters().instance("embed_function").unwrap()
    ));
    assert_eq!(registry.constructions(), 2);
}

#[tokio::test]
async fn test_store_receives_embeddings_instance_and_chunks() {
    let store = Arc::new(RecordingComponent::new("ChromaUpsertStore").with_output(json!({"upserted": 2})));
    let splitter = Arc::new(RecordingComponent::new("TextSplitter").with_output(json!(["c1", "c2"])));
    let factories = base_factories();
    factories.register("ChromaUpsertStore", shared_factory(store.clone()));
    factories.register("TextSplitter", shared_factory(splitter.clone()));
    let engine = Engine::new(document()).with_factories(Arc::new(factories));

    let report = engine.execute("add_text_vector", &Bindings::new()).await.unwrap();

    assert_eq!(report.output, json!({"upserted": 2}));
    let call = &store.calls()[0];
    assert_eq!(call.input, Some(json!(["c1", "c2"])));
    assert_eq!(call.instances, vec!["embedding_func".to_string()]);
    assert_eq!(call.params.get("collection"), Some(&json!("knowledge")));
    assert_eq!(splitter.calls()[0].params.get("chunk_size"), Some(&json!(500)));
}

#[tokio::test]
async fn test_comma_group_runs_side_by_side_and_fans_in() {
    let merge = Arc::new(RecordingComponent::new("Merge").with_output(json!("merged")));
    let factories = base_factories();
    factories.register("Left", shared_factory(Arc::new(SlowComponent::new("Left", Duration::from_millis(20)))));
    factories.register("Right", shared_factory(Arc::new(SlowComponent::new("Right", Duration::from_millis(20)))));
    factories.register("Merge", shared_factory(merge.clone()));
    let engine = Engine::new(document()).with_factories(Arc::new(factories));

    let report = engine.execute("fan_in", &Bindings::new()).await.unwrap();

    assert_eq!(report.output, json!("merged"));
    let call = &merge.calls()[0];
    assert_eq!(call.input, None);
    assert_eq!(call.inputs.len(), 2);
    assert_eq!(call.inputs.get("Left"), Some(&json!("Left")));
    assert_eq!(call.inputs.get("Right"), Some(&json!("Right")));
    assert_eq!(report.outputs.len(), 3);
}

#[tokio::test]
async fn test_cancellation_during_retry_backoff() {
    let model = Arc::new(FailingComponent::transient("OpenAiStyleModel", "rate limited"));
    let factories = base_factories();
    factories.register("OpenAiStyleModel", shared_factory(model.clone()));
    let engine = Engine::new(document())
        .with_factories(Arc::new(factories))
        .with_settings(EngineSettings::new().with_retry_delays(10_000, 10_000).with_jitter(JitterStrategy::None));

    let cancel = Arc::new(CancellationToken::new());
    let trigger = Arc::clone(&cancel);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        trigger.cancel("client disconnected");
    });

    let err = engine
        .execute_with_cancel("test01", &Bindings::new().with("query", json!("q")), &cancel)
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        ChainflowError::Execution(ExecutionError::Cancelled { ref reason, .. }) if reason == "client disconnected"
    ));
    assert_eq!(model.call_count(), 1);
}

#[tokio::test]
async fn test_unknown_path_token_is_configuration_error() {
    let doc = ConfigDocument::from_yaml_str(
        r"
broken:
  excute_path: Reader-Missing
  components:
    - name: Reader
",
    )
    .unwrap();
    let engine = Engine::new(doc).with_factories(Arc::new(base_factories()));

    let err = engine.execute("broken", &Bindings::new()).await.unwrap_err();

    assert!(err.is_configuration_error());
    assert_eq!(err.error_info().code, "PLAN-UNRESOLVED");
}
