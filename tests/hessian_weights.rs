//! Weight-mode trace scores across kernel layer types and graph shapes.

use cuantizar::autograd::Padding;
use cuantizar::graph::{Graph, GraphBuilder, NodeId, Op, OpType};
use cuantizar::hessian::{
    HessianConfig, HessianInfoGranularity, HessianInfoService, HessianMode, RandomNormalDataset,
    TraceHessianRequest,
};
use ndarray::{ArrayD, Axis};
use std::sync::Arc;

const INPUT: [usize; 3] = [8, 8, 3];

fn conv(filters: usize, kernel: usize) -> Op {
    Op::Conv2d {
        filters,
        kernel_size: [kernel, kernel],
        strides: [1, 1],
        padding: Padding::Valid,
    }
}

/// input -> layer -> bn1 -> relu
fn basic_model(input_shape: &[usize], layer: Op) -> Graph {
    let mut b = GraphBuilder::new(0);
    let x = b.input("input", input_shape).unwrap();
    let y = b.layer("layer", layer, &[x.into()]).unwrap();
    let bn = b.layer("bn1", Op::BatchNorm { epsilon: 1e-3 }, &[y.into()]).unwrap();
    let out = b.layer("relu", Op::Relu { max_value: None }, &[bn.into()]).unwrap();
    b.output(out);
    b.build().unwrap()
}

fn service(graph: Graph, inputs: usize) -> HessianInfoService {
    let shapes = graph
        .inputs()
        .iter()
        .map(|&id| {
            let mut shape = vec![1];
            shape.extend(&graph.node(id).output_shapes[0]);
            shape
        })
        .collect::<Vec<_>>();
    assert_eq!(shapes.len(), inputs);
    let dataset = RandomNormalDataset::new(shapes, 42).unwrap();
    HessianInfoService::new(Arc::new(graph), dataset)
        .with_config(HessianConfig::default().with_seed(7))
        .unwrap()
}

fn request(node: NodeId, granularity: HessianInfoGranularity) -> TraceHessianRequest {
    TraceHessianRequest::new(HessianMode::Weights, granularity, node)
}

fn fetch_mean(
    service: &HessianInfoService,
    node: NodeId,
    granularity: HessianInfoGranularity,
    num_scores: usize,
) -> ArrayD<f32> {
    let scores = service.fetch_hessian(&request(node, granularity), num_scores).unwrap();
    assert_eq!(scores.len(), num_scores, "fetched {} scores", scores.len());
    let views: Vec<_> = scores.iter().map(|s| s.view()).collect();
    ndarray::stack(Axis(0), &views)
        .unwrap()
        .mean_axis(Axis(0))
        .unwrap()
}

fn assert_shapes(service: &HessianInfoService, node: NodeId, channels: usize, element: &[usize]) {
    let per_tensor = fetch_mean(service, node, HessianInfoGranularity::PerTensor, 1);
    assert_eq!(per_tensor.shape(), &[1]);
    let per_channel = fetch_mean(service, node, HessianInfoGranularity::PerOutputChannel, 1);
    assert_eq!(per_channel.shape(), &[channels]);
    let per_element = fetch_mean(service, node, HessianInfoGranularity::PerElement, 1);
    assert_eq!(per_element.shape(), element);

    for score in [&per_tensor, &per_channel, &per_element] {
        assert!(score.iter().all(|v| v.is_finite() && *v >= 0.0));
    }
}

fn interest_point(graph: &Graph, index: usize) -> NodeId {
    graph.topological_order()[index]
}

fn first_of(graph: &Graph, op_type: OpType) -> NodeId {
    graph
        .topo_sorted_nodes()
        .find(|(_, n)| n.op_type() == op_type)
        .map(|(id, _)| id)
        .unwrap()
}

#[test]
fn test_conv2d_granularity() {
    let graph = basic_model(&INPUT, conv(2, 3));
    let node = interest_point(&graph, 1);
    let service = service(graph, 1);
    assert_shapes(&service, node, 2, &[3, 3, 3, 2]);
}

#[test]
fn test_dense_granularity() {
    let graph = basic_model(&[8], Op::Dense { units: 2 });
    let node = interest_point(&graph, 1);
    let service = service(graph, 1);
    assert_shapes(&service, node, 2, &[8, 2]);
}

#[test]
fn test_conv2d_transpose_granularity() {
    let layer = Op::Conv2dTranspose {
        filters: 2,
        kernel_size: [3, 3],
        strides: [1, 1],
        padding: Padding::Valid,
    };
    let graph = basic_model(&INPUT, layer);
    let node = interest_point(&graph, 1);
    let service = service(graph, 1);
    assert_shapes(&service, node, 2, &[3, 3, 2, 3]);
}

#[test]
fn test_depthwise_conv2d_granularity() {
    let layer = Op::DepthwiseConv2d {
        kernel_size: [3, 3],
        strides: [1, 1],
        padding: Padding::Valid,
        depth_multiplier: 1,
    };
    let graph = basic_model(&INPUT, layer);
    let node = interest_point(&graph, 1);
    let service = service(graph, 1);
    assert_shapes(&service, node, 3, &[3, 3, 3, 1]);
}

#[test]
fn test_reused_layer_shares_scores() {
    let mut b = GraphBuilder::new(0);
    let x = b.input("input", &INPUT).unwrap();
    let same = Op::Conv2d {
        filters: 3,
        kernel_size: [2, 2],
        strides: [1, 1],
        padding: Padding::Same,
    };
    let first = b.layer("conv", same, &[x.into()]).unwrap();
    let second = b.reuse("conv_1", "conv", &[first.into()]).unwrap();
    b.output(second);
    let graph = b.build().unwrap();

    let convs: Vec<NodeId> = graph
        .topo_sorted_nodes()
        .filter(|(_, n)| n.op_type() == OpType::Conv2d)
        .map(|(id, _)| id)
        .collect();
    assert_eq!(convs, vec![first, second]);

    let service = service(graph, 1);
    let element = HessianInfoGranularity::PerElement;
    let a = fetch_mean(&service, first, element, 1);
    let b = fetch_mean(&service, second, element, 1);
    assert_eq!(a.shape(), &[2, 2, 3, 3]);
    assert_eq!(a, b);

    assert_eq!(service.count_saved_info_of_request(&request(first, element)).unwrap(), 1);
    assert_eq!(service.count_saved_info_of_request(&request(second, element)).unwrap(), 1);
    assert_eq!(service.num_cached_requests(), 1);
}

fn assert_first_conv_shapes(graph: Graph, inputs: usize) {
    let node = first_of(&graph, OpType::Conv2d);
    let service = service(graph, inputs);
    assert_shapes(&service, node, 2, &[3, 3, 3, 2]);
}

#[test]
fn test_multiple_inputs() {
    let mut b = GraphBuilder::new(0);
    let x = b.input("input", &INPUT).unwrap();
    let x2 = b.input("input_1", &INPUT).unwrap();
    let c = b.layer("conv", conv(2, 3), &[x.into()]).unwrap();
    let c2 = b.layer("conv_1", conv(2, 3), &[x2.into()]).unwrap();
    let sum = b.layer("add", Op::Add, &[c.into(), c2.into()]).unwrap();
    b.output(sum);
    assert_first_conv_shapes(b.build().unwrap(), 2);
}

#[test]
fn test_multiple_outputs() {
    let mut b = GraphBuilder::new(0);
    let x = b.input("input", &INPUT).unwrap();
    let c = b.layer("conv", conv(2, 3), &[x.into()]).unwrap();
    let bn = b.layer("bn", Op::BatchNorm { epsilon: 1e-3 }, &[c.into()]).unwrap();
    let out1 = b.layer("relu", Op::Relu { max_value: Some(6.0) }, &[bn.into()]).unwrap();
    let out2 = b.layer("conv_1", conv(2, 4), &[out1.into()]).unwrap();
    b.output(out1).output(out2);
    assert_first_conv_shapes(b.build().unwrap(), 1);
}

#[test]
fn test_multiple_outputs_to_intermediate_node() {
    let mut b = GraphBuilder::new(0);
    let x = b.input("input", &INPUT).unwrap();
    let c = b.layer("conv", conv(2, 3), &[x.into()]).unwrap();
    let bn = b.layer("bn", Op::BatchNorm { epsilon: 1e-3 }, &[c.into()]).unwrap();
    let relu = b.layer("relu", Op::Relu { max_value: Some(6.0) }, &[bn.into()]).unwrap();
    let split = b.layer("split", Op::Split { num_splits: 2 }, &[relu.into()]).unwrap();
    let sum = b.layer("add", Op::Add, &[split.out(0), split.out(1)]).unwrap();
    b.output(sum);
    assert_first_conv_shapes(b.build().unwrap(), 1);
}

#[test]
fn test_scores_average_over_several_batches() {
    let graph = basic_model(&[8], Op::Dense { units: 2 });
    let node = interest_point(&graph, 1);
    let service = service(graph, 1);

    let mean = fetch_mean(&service, node, HessianInfoGranularity::PerOutputChannel, 3);
    assert_eq!(mean.shape(), &[2]);
    assert_eq!(
        service
            .count_saved_info_of_request(&request(node, HessianInfoGranularity::PerOutputChannel))
            .unwrap(),
        3
    );
}
