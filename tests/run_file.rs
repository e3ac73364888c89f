//! A run file on disk driven through the same steps as the `hessian` command.

use cuantizar::config::{
    apply_overrides, build_dataset, build_graph, load_config, parse_args, Command,
};
use cuantizar::hessian::{HessianInfoGranularity, HessianInfoService, HessianMode};
use cuantizar::report::build_report;
use std::io::Write;
use std::sync::Arc;
use tempfile::NamedTempFile;

const RUN: &str = r#"
model:
  seed: 9
  inputs:
    - name: image
      shape: [6, 6, 3]
  layers:
    - name: conv
      op: conv2d
      filters: 4
      kernel_size: [3, 3]
      inputs: [image]
    - name: bn
      op: batch_norm
      inputs: [conv]
    - name: relu
      op: relu
      max_value: 6.0
      inputs: [bn]
    - name: depthwise
      op: depthwise_conv2d
      kernel_size: [2, 2]
      inputs: [relu]
    - name: flatten
      op: flatten
      inputs: [depthwise]
    - name: logits
      op: dense
      units: 3
      inputs: [flatten]
    - name: probs
      op: softmax
      inputs: [logits]
  outputs: [probs]

dataset:
  kind: random_normal
  batch_size: 2
  num_batches: 6

hessian:
  num_iterations: 30
  min_iterations: 5
  seed: 2
"#;

fn run_file() -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(RUN.as_bytes()).unwrap();
    file
}

#[test]
fn test_weights_report_from_run_file() {
    let file = run_file();
    let path = file.path().to_str().unwrap();
    let cli = parse_args(["cuantizar", "hessian", path, "-g", "per-output-channel", "-n", "2"])
        .unwrap();
    let Command::Hessian(args) = cli.command else {
        panic!("expected the hessian command");
    };

    let mut spec = load_config(&args.config).unwrap();
    apply_overrides(&mut spec, &args);
    let graph = Arc::new(build_graph(&spec.model).unwrap());
    let dataset = build_dataset(&spec, &graph).unwrap();
    let service = HessianInfoService::new(Arc::clone(&graph), dataset)
        .with_config(spec.hessian.clone())
        .unwrap();

    let mode = HessianMode::from(args.mode);
    let nodes = service.eligible_nodes(mode);
    let names: Vec<&str> = nodes.iter().map(|&id| graph.node(id).name.as_str()).collect();
    assert_eq!(names, ["conv", "depthwise", "logits"]);

    let report = build_report(&service, &nodes, mode, args.granularity.into(), args.num_scores)
        .unwrap();
    let shapes: Vec<&[usize]> = report.nodes.iter().map(|n| n.shape.as_slice()).collect();
    assert_eq!(shapes, [&[4][..], &[4][..], &[3][..]]);
    assert!(report.nodes.iter().all(|n| n.scores.len() == 2));
    assert!(report.nodes.iter().all(|n| n.total().is_finite() && n.total() >= 0.0));
}

#[test]
fn test_activation_scores_and_dataset_limit() {
    let file = run_file();
    let path = file.path().to_str().unwrap();
    let cli = parse_args([
        "cuantizar", "hessian", path, "--mode", "activation", "--granularity", "per_element",
        "--node", "relu", "--iterations", "12",
    ])
    .unwrap();
    let Command::Hessian(args) = cli.command else {
        panic!("expected the hessian command");
    };

    let mut spec = load_config(&args.config).unwrap();
    apply_overrides(&mut spec, &args);
    assert_eq!(spec.hessian.num_iterations, 12);

    let graph = Arc::new(build_graph(&spec.model).unwrap());
    let dataset = build_dataset(&spec, &graph).unwrap();
    let service = HessianInfoService::new(Arc::clone(&graph), dataset)
        .with_config(spec.hessian.clone())
        .unwrap();

    let relu = graph.find(&args.nodes[0]).unwrap();
    let granularity = HessianInfoGranularity::from(args.granularity);
    let report = build_report(&service, &[relu], HessianMode::Activation, granularity, 6).unwrap();
    assert_eq!(report.nodes[0].shape, vec![4, 4, 4]);

    // Six batches were configured and all of them are now spent
    let logits = graph.find("logits").unwrap();
    let more = build_report(&service, &[logits], HessianMode::Activation, granularity, 1);
    assert!(more.is_err());
}
