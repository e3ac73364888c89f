//! Service-level behavior: caching, exhaustion, concurrency and cancellation.

use cuantizar::autograd::Padding;
use cuantizar::backend::{Backend, ForwardPass, GradTracking, TapeBackend};
use cuantizar::graph::{Graph, GraphBuilder, NodeId, Op};
use cuantizar::hessian::{
    Batch, FiniteDataset, GeneratorDataset, HessianConfig, HessianInfoGranularity,
    HessianInfoService, HessianMode, RandomNormalDataset, TraceHessianRequest,
};
use cuantizar::{Error, Result};
use ndarray::{ArrayD, IxDyn};
use proptest::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

/// Tape backend that counts forward passes
#[derive(Default)]
struct CountingBackend {
    passes: AtomicUsize,
}

impl CountingBackend {
    fn passes(&self) -> usize {
        self.passes.load(Ordering::SeqCst)
    }
}

impl Backend for CountingBackend {
    fn build_forward_pass(
        &self,
        graph: &Graph,
        inputs: &[ArrayD<f32>],
        tracking: GradTracking,
    ) -> Result<ForwardPass> {
        self.passes.fetch_add(1, Ordering::SeqCst);
        TapeBackend.build_forward_pass(graph, inputs, tracking)
    }
}

/// Tape backend whose first forward pass waits for a release signal
///
/// Tracks how many forward passes overlap.
struct GatedBackend {
    entered: Mutex<Option<Sender<()>>>,
    release: Mutex<Receiver<()>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl GatedBackend {
    fn new(entered: Sender<()>, release: Receiver<()>) -> Self {
        Self {
            entered: Mutex::new(Some(entered)),
            release: Mutex::new(release),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
        }
    }

    fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

impl Backend for GatedBackend {
    fn build_forward_pass(
        &self,
        graph: &Graph,
        inputs: &[ArrayD<f32>],
        tracking: GradTracking,
    ) -> Result<ForwardPass> {
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);

        let gate = self.entered.lock().unwrap().take();
        if let Some(entered) = gate {
            entered.send(()).unwrap();
            self.release.lock().unwrap().recv().unwrap();
        }

        let pass = TapeBackend.build_forward_pass(graph, inputs, tracking);
        self.active.fetch_sub(1, Ordering::SeqCst);
        pass
    }
}

struct Model {
    graph: Graph,
    conv: NodeId,
    conv_1: NodeId,
    relu: NodeId,
    dense: NodeId,
}

/// input[6,6,2] -> conv -> relu -> conv_1 (reuses conv) -> flatten -> dense
fn model() -> Model {
    let mut b = GraphBuilder::new(21);
    let x = b.input("input", &[6, 6, 2]).unwrap();
    let op = Op::Conv2d {
        filters: 2,
        kernel_size: [3, 3],
        strides: [1, 1],
        padding: Padding::Same,
    };
    let conv = b.layer("conv", op, &[x.into()]).unwrap();
    let relu = b.layer("relu", Op::Relu { max_value: None }, &[conv.into()]).unwrap();
    let conv_1 = b.reuse("conv_1", "conv", &[relu.into()]).unwrap();
    let flat = b.layer("flatten", Op::Flatten, &[conv_1.into()]).unwrap();
    let dense = b.layer("dense", Op::Dense { units: 3 }, &[flat.into()]).unwrap();
    b.output(dense);
    Model {
        graph: b.build().unwrap(),
        conv,
        conv_1,
        relu,
        dense,
    }
}

fn config() -> HessianConfig {
    HessianConfig::default()
        .with_num_iterations(20)
        .with_min_iterations(5)
        .with_seed(5)
}

fn random_dataset() -> RandomNormalDataset {
    RandomNormalDataset::new(vec![vec![2, 6, 6, 2]], 3).unwrap()
}

fn weights(node: NodeId, granularity: HessianInfoGranularity) -> TraceHessianRequest {
    TraceHessianRequest::new(HessianMode::Weights, granularity, node)
}

fn activation(node: NodeId, granularity: HessianInfoGranularity) -> TraceHessianRequest {
    TraceHessianRequest::new(HessianMode::Activation, granularity, node)
}

#[test]
fn test_growing_request_computes_only_the_shortfall() {
    let m = model();
    let backend = Arc::new(CountingBackend::default());
    let service = HessianInfoService::new(Arc::new(m.graph), random_dataset())
        .with_backend(backend.clone())
        .with_config(config())
        .unwrap();
    let request = weights(m.dense, HessianInfoGranularity::PerOutputChannel);

    let first = service.fetch_hessian(&request, 2).unwrap();
    assert_eq!(backend.passes(), 2);

    let grown = service.fetch_hessian(&request, 5).unwrap();
    assert_eq!(backend.passes(), 5);
    assert_eq!(grown.len(), 5);
    assert_eq!(&grown[..2], first.as_slice());

    service.fetch_hessian(&request, 4).unwrap();
    assert_eq!(backend.passes(), 5);
}

#[test]
fn test_scores_differ_between_samples() {
    let m = model();
    let service = HessianInfoService::new(Arc::new(m.graph), random_dataset())
        .with_config(config())
        .unwrap();
    let scores = service
        .fetch_hessian(&weights(m.conv, HessianInfoGranularity::PerElement), 2)
        .unwrap();
    assert_ne!(scores[0], scores[1]);
}

#[test]
fn test_exhaustion_mid_run_keeps_computed_scores() {
    let m = model();
    let mut left = 2;
    let dataset = GeneratorDataset::new(move || -> Option<Batch> {
        (left > 0).then(|| {
            left -= 1;
            vec![ArrayD::from_elem(IxDyn(&[1, 6, 6, 2]), 0.5)]
        })
    });
    let service = HessianInfoService::new(Arc::new(m.graph), dataset)
        .with_config(config())
        .unwrap();
    let request = weights(m.conv, HessianInfoGranularity::PerTensor);

    match service.fetch_hessian(&request, 4) {
        Err(Error::DataExhausted { requested, produced }) => {
            assert_eq!(requested, 4);
            assert_eq!(produced, 2);
        }
        other => panic!("expected DataExhausted, got {other:?}"),
    }
    assert_eq!(service.count_saved_info_of_request(&request).unwrap(), 2);
    assert_eq!(service.fetch_hessian(&request, 2).unwrap().len(), 2);
}

#[test]
fn test_unsupported_request_is_rejected_before_drawing_data() {
    let m = model();
    let flatten = m.graph.find("flatten").unwrap();
    let batches = vec![vec![ArrayD::zeros(IxDyn(&[1, 6, 6, 2]))]];
    let service = HessianInfoService::new(Arc::new(m.graph), FiniteDataset::new(batches))
        .with_config(config())
        .unwrap();

    for node in [m.relu, flatten] {
        let err = service
            .fetch_hessian(&weights(node, HessianInfoGranularity::PerTensor), 1)
            .unwrap_err();
        assert!(matches!(err, Error::UnsupportedOperator { .. }), "{err}");
    }
    assert_eq!(service.num_cached_requests(), 0);

    // The batch is still there for a valid request
    let ok = service.fetch_hessian(&weights(m.dense, HessianInfoGranularity::PerTensor), 1);
    assert_eq!(ok.unwrap().len(), 1);
}

#[test]
fn test_output_batch_mismatch() {
    let mut b = GraphBuilder::new(4);
    let left = b.input("left", &[3]).unwrap();
    let right = b.input("right", &[3]).unwrap();
    let dense = b.layer("dense", Op::Dense { units: 2 }, &[left.into()]).unwrap();
    let dense_1 = b.layer("dense_1", Op::Dense { units: 2 }, &[right.into()]).unwrap();
    b.output(dense).output(dense_1);
    let graph = b.build().unwrap();

    let dataset = RandomNormalDataset::new(vec![vec![2, 3], vec![3, 3]], 0).unwrap();
    let service = HessianInfoService::new(Arc::new(graph), dataset)
        .with_config(config())
        .unwrap();
    match service.fetch_hessian(&weights(dense, HessianInfoGranularity::PerTensor), 1) {
        Err(Error::OutputBatchMismatch { sizes }) => assert_eq!(sizes, vec![2, 3]),
        other => panic!("expected OutputBatchMismatch, got {other:?}"),
    }
}

#[test]
fn test_concurrent_callers_share_one_computation() {
    let m = model();
    let backend = Arc::new(CountingBackend::default());
    let service = HessianInfoService::new(Arc::new(m.graph), random_dataset())
        .with_backend(backend.clone())
        .with_config(config())
        .unwrap();
    let request = weights(m.conv, HessianInfoGranularity::PerOutputChannel);

    let results: Vec<Vec<ArrayD<f32>>> = thread::scope(|s| {
        let handles: Vec<_> = (0..4)
            .map(|_| s.spawn(|| service.fetch_hessian(&request, 3).unwrap()))
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert_eq!(backend.passes(), 3);
    assert!(results.windows(2).all(|w| w[0] == w[1]));
}

#[test]
fn test_clear_and_introspection_during_computation() {
    let m = model();
    let (entered_tx, entered_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel();
    let backend = Arc::new(GatedBackend::new(entered_tx, release_rx));
    let service = HessianInfoService::new(Arc::new(m.graph), random_dataset())
        .with_backend(backend.clone())
        .with_config(config())
        .unwrap();
    let request = weights(m.dense, HessianInfoGranularity::PerTensor);

    thread::scope(|s| {
        let first = s.spawn(|| service.fetch_hessian(&request, 2).unwrap());
        entered_rx.recv().unwrap();

        // The computation holds its slot; counting must not wait for it
        assert_eq!(service.count_saved_info_of_request(&request).unwrap(), 0);
        assert_eq!(service.num_cached_requests(), 0);

        let clear = s.spawn(|| service.clear_saved_hessian_info());
        let second = s.spawn(|| service.fetch_hessian(&request, 2).unwrap());
        // Give the clear and the second caller time to reach the slot
        thread::sleep(Duration::from_millis(50));
        release_tx.send(()).unwrap();

        assert_eq!(first.join().unwrap().len(), 2);
        clear.join().unwrap();
        assert_eq!(second.join().unwrap().len(), 2);
    });

    assert_eq!(backend.max_active(), 1);

    // Either order of the clear and the second caller leaves a usable slot
    service.fetch_hessian(&request, 2).unwrap();
    assert_eq!(service.count_saved_info_of_request(&request).unwrap(), 2);
    assert_eq!(service.num_cached_requests(), 1);

    service.clear_saved_hessian_info();
    assert_eq!(service.count_saved_info_of_request(&request).unwrap(), 0);
    assert_eq!(service.num_cached_requests(), 0);
}

#[test]
fn test_fetch_many_dedups_reused_occurrences() {
    let m = model();
    let backend = Arc::new(CountingBackend::default());
    let service = HessianInfoService::new(Arc::new(m.graph), random_dataset())
        .with_backend(backend.clone())
        .with_config(config())
        .unwrap();

    let granularity = HessianInfoGranularity::PerTensor;
    let requests = [
        weights(m.conv, granularity),
        weights(m.conv_1, granularity),
        weights(m.dense, granularity),
    ];
    let results = service.fetch_hessian_many(&requests, 2).unwrap();

    assert_eq!(results.len(), 3);
    assert_eq!(results[0], results[1]);
    assert_eq!(backend.passes(), 4);
    assert_eq!(service.num_cached_requests(), 2);
}

#[test]
fn test_activation_requests_keep_occurrences_apart() {
    let m = model();
    let service = HessianInfoService::new(Arc::new(m.graph), random_dataset())
        .with_config(config())
        .unwrap();

    let first = activation(m.conv, HessianInfoGranularity::PerElement);
    let second = activation(m.conv_1, HessianInfoGranularity::PerElement);
    assert_eq!(service.canonical_request(&first).unwrap(), first);
    assert_eq!(service.canonical_request(&second).unwrap(), second);

    let a = service.fetch_hessian(&first, 1).unwrap();
    let b = service.fetch_hessian(&second, 1).unwrap();
    assert_eq!(a[0].shape(), &[6, 6, 2]);
    assert_eq!(b[0].shape(), &[6, 6, 2]);
    assert_eq!(service.num_cached_requests(), 2);
}

#[test]
fn test_weight_requests_canonicalize_to_owner() {
    let m = model();
    let service = HessianInfoService::new(Arc::new(m.graph), random_dataset());
    let request = weights(m.conv_1, HessianInfoGranularity::PerTensor);
    let canonical = service.canonical_request(&request).unwrap();
    assert_eq!(canonical.target_node(), m.conv);
    assert_eq!(canonical.granularity(), request.granularity());
}

#[test]
fn test_eligible_nodes_per_mode() {
    let m = model();
    let service = HessianInfoService::new(Arc::new(m.graph), random_dataset());

    assert_eq!(
        service.eligible_nodes(HessianMode::Weights),
        vec![m.conv, m.conv_1, m.dense]
    );
    let activations = service.eligible_nodes(HessianMode::Activation);
    assert!(activations.contains(&m.relu));
    assert!(activations.contains(&m.conv_1));
    // flatten is a no-quantization op
    let flatten = service.graph().find("flatten").unwrap();
    assert!(!activations.contains(&flatten));
}

#[test]
fn test_cancellation_aborts_and_resets() {
    let m = model();
    let service = HessianInfoService::new(Arc::new(m.graph), random_dataset())
        .with_config(config())
        .unwrap();
    let request = weights(m.dense, HessianInfoGranularity::PerTensor);

    let token = service.cancellation_token();
    token.cancel();
    assert!(matches!(
        service.fetch_hessian(&request, 1),
        Err(Error::Cancelled)
    ));
    assert_eq!(service.count_saved_info_of_request(&request).unwrap(), 0);

    token.reset();
    assert_eq!(service.fetch_hessian(&request, 1).unwrap().len(), 1);
}

#[test]
fn test_seeded_services_agree() {
    let run = || {
        let m = model();
        let service = HessianInfoService::new(Arc::new(m.graph), random_dataset())
            .with_config(config())
            .unwrap();
        service
            .fetch_hessian(&weights(m.conv, HessianInfoGranularity::PerOutputChannel), 2)
            .unwrap()
    };
    assert_eq!(run(), run());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn prop_cache_grows_monotonically(sizes in proptest::collection::vec(0usize..5, 1..5)) {
        let mut b = GraphBuilder::new(8);
        let x = b.input("input", &[4]).unwrap();
        let dense = b.layer("dense", Op::Dense { units: 3 }, &[x.into()]).unwrap();
        b.output(dense);
        let dataset = RandomNormalDataset::new(vec![vec![2, 4]], 1).unwrap();
        let service = HessianInfoService::new(Arc::new(b.build().unwrap()), dataset)
            .with_config(config())
            .unwrap();
        let request = weights(dense, HessianInfoGranularity::PerElement);

        let mut longest: Vec<ArrayD<f32>> = Vec::new();
        for n in sizes {
            let scores = service.fetch_hessian(&request, n).unwrap();
            prop_assert_eq!(scores.len(), n);
            let shared = n.min(longest.len());
            prop_assert_eq!(&scores[..shared], &longest[..shared]);
            if n > longest.len() {
                longest = scores;
            }
            prop_assert_eq!(service.count_saved_info_of_request(&request).unwrap(), longest.len());
        }
    }
}
