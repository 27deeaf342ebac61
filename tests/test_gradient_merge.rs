// Integration tests for gradient merging at tensors with several consumers.
// A shared tensor's gradient must equal the sum of the gradients each
// consumer would produce on its own.

use approx::assert_relative_eq;
use rust_layer_engine::backend::{ConvGeometry, ResamplingAlgorithm};
use rust_layer_engine::layers::batchnorm_activation::NormalizationOptions;
use rust_layer_engine::layers::depthwise_conv::DepthwiseOptions;
use rust_layer_engine::layers::{Layer, LayerSpec};
use rust_layer_engine::utils::{Activation, SimpleRng};
use rust_layer_engine::{EngineConfig, FormatPreference, Graph, Shape};

const SHAPE: Shape = Shape {
    c: 4,
    d: 1,
    h: 4,
    w: 4,
};
const BATCH: usize = 2;

fn random_data(len: usize, seed: u64) -> Vec<f32> {
    let mut rng = SimpleRng::new(seed);
    (0..len).map(|_| rng.gen_range_f32(-1.0, 1.0)).collect()
}

fn consumers() -> Vec<(&'static str, LayerSpec)> {
    vec![
        (
            "bn",
            LayerSpec::BatchNormActivation {
                activation: Activation::Elu,
                options: NormalizationOptions::default(),
            },
        ),
        (
            "dw",
            LayerSpec::DepthwiseConvolution {
                options: DepthwiseOptions::new(ConvGeometry::square(3).with_padding(1)),
            },
        ),
        (
            "up",
            LayerSpec::Resampling {
                algorithm: ResamplingAlgorithm::Linear,
                factor_h: 2.0,
                factor_w: 2.0,
                format: FormatPreference::Any,
            },
        ),
    ]
}

/// Gradient reaching `x` when `x` feeds the consumers selected by `keep`.
fn input_gradient(config: EngineConfig, keep: &[usize]) -> Vec<f32> {
    let mut graph = Graph::with_cpu(config).unwrap();
    let x = graph.add_input("x", SHAPE).unwrap();
    let mut outputs = Vec::new();
    for (i, (name, spec)) in consumers().into_iter().enumerate() {
        if keep.contains(&i) {
            let id = graph.add_layer(name, &spec, &[x]).unwrap();
            outputs.push((i, id));
        }
    }
    // every graph draws the same weights for a layer regardless of its siblings
    for &(i, id) in &outputs {
        graph.layer_mut(id).unwrap().reset_weights(100 + i as u64);
    }
    graph.initialize(BATCH).unwrap();
    graph.set_input(x, &random_data(BATCH * SHAPE.cdhw(), 1)).unwrap();
    graph.forward(true).unwrap();
    for &(i, id) in &outputs {
        let len = BATCH * graph.layer(id).unwrap().shape().cdhw();
        graph.set_output_gradient(id, &random_data(len, 10 + i as u64)).unwrap();
    }
    graph.backward().unwrap();
    graph.gradient(x).unwrap()
}

fn check_merge(config: EngineConfig) {
    let merged = input_gradient(config, &[0, 1, 2]);
    let separate: Vec<Vec<f32>> = (0..3).map(|i| input_gradient(config, &[i])).collect();

    for (j, &m) in merged.iter().enumerate() {
        let expected: f32 = separate.iter().map(|g| g[j]).sum();
        assert_relative_eq!(m, expected, epsilon = 1e-5);
    }
}

// ============================================================================
// Fan-Out Tests
// ============================================================================

#[test]
fn test_fan_out_gradient_is_sum_of_consumers() {
    check_merge(EngineConfig::default());
}

#[test]
fn test_fan_out_with_in_place_backward_enabled() {
    // a shared input never takes the in-place path
    check_merge(EngineConfig {
        in_place_backward: true,
        ..EngineConfig::default()
    });
}

#[test]
fn test_fan_out_with_lean_gradient_buffers() {
    check_merge(EngineConfig {
        lean_gradient_buffers: true,
        ..EngineConfig::default()
    });
}

#[test]
fn test_pair_merge_is_order_independent() {
    let ab = input_gradient(EngineConfig::default(), &[0, 1]);
    let a = input_gradient(EngineConfig::default(), &[0]);
    let b = input_gradient(EngineConfig::default(), &[1]);
    for j in 0..ab.len() {
        assert_relative_eq!(ab[j], a[j] + b[j], epsilon = 1e-5);
    }
}
