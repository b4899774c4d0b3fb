//! Benchmarks for execution path planning.

use chainflow::config::{ComponentSpec, ConverterRule, PipelineSpec};
use chainflow::pipeline::planner;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use serde_json::json;

fn chat_pipeline() -> PipelineSpec {
    PipelineSpec::new("messages-OpenAiStyleModel")
        .with_converter(ConverterRule::list("messages", ["SystemPrompt", "HumanPrompt"]))
        .with_component(ComponentSpec::new("SystemPrompt").with_param("system_prompt", json!("Be brief.")))
        .with_component(ComponentSpec::new("HumanPrompt").with_param("human_message", json!("{{query}}")))
        .with_component(ComponentSpec::new("OpenAiStyleModel"))
}

fn long_chain(stages: usize) -> PipelineSpec {
    let names: Vec<String> = (0..stages).map(|i| format!("Stage{i}")).collect();
    names
        .iter()
        .fold(PipelineSpec::new(names.join("-")), |spec, name| {
            spec.with_component(ComponentSpec::new(name.as_str()))
        })
}

fn planner_benchmark(c: &mut Criterion) {
    let chat = chat_pipeline();
    c.bench_function("plan_chat", |b| b.iter(|| planner::plan("test01", black_box(&chat))));

    let chain = long_chain(64);
    c.bench_function("plan_chain_64", |b| b.iter(|| planner::plan("chain", black_box(&chain))));
    c.bench_function("waves_chain_64", |b| {
        let plan = planner::plan("chain", &chain).unwrap();
        b.iter(|| black_box(&plan).waves().len());
    });
}

criterion_group!(benches, planner_benchmark);
criterion_main!(benches);
