//! Benchmarks for document parsing and graph construction.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use pipeline_orchestrator::config::PipelineSpec;
use pipeline_orchestrator::pipeline::ExecutionGraph;
use std::fmt::Write;

/// A pipeline of `layers` sections, each instance referencing the previous
/// section's instance of the same position.
fn layered_document(layers: usize, width: usize) -> String {
    let mut doc = String::from("bench:\n  core:\n    sequential_within_type: false\n");
    for layer in 0..layers {
        let _ = writeln!(doc, "  layer{layer}:");
        for i in 0..width {
            let _ = writeln!(doc, "    - name: n{i}");
            if layer > 0 {
                let _ = writeln!(doc, "      input: _group:layer{}:n{i}:out", layer - 1);
            }
        }
    }
    doc
}

fn graph_benchmark(c: &mut Criterion) {
    let doc = layered_document(20, 25);
    let spec = PipelineSpec::from_yaml_str(&doc).unwrap_or_else(|_| PipelineSpec::new("bench"));

    c.bench_function("parse_500_instances", |b| {
        b.iter(|| PipelineSpec::from_yaml_str(black_box(&doc)).is_ok());
    });

    c.bench_function("build_graph_500_instances", |b| {
        b.iter(|| ExecutionGraph::build(black_box(&spec)).map(|g| g.topological_order().len()));
    });
}

criterion_group!(benches, graph_benchmark);
criterion_main!(benches);
