// Integration tests for batch normalization fused with an activation.
// Covers running statistics, inference determinism, the two statistics modes,
// gradient correctness and the in-place and lean gradient paths.

use approx::assert_relative_eq;
use rust_layer_engine::layers::batchnorm_activation::{BatchNormActivation, NormalizationOptions};
use rust_layer_engine::layers::{Layer, LayerSpec, LayerVariant};
use rust_layer_engine::utils::{Activation, SimpleRng, StatisticsMode};
use rust_layer_engine::{EngineConfig, Graph, LayerError, LayerId, Shape};

fn random_data(len: usize, seed: u64, low: f32, high: f32) -> Vec<f32> {
    let mut rng = SimpleRng::new(seed);
    (0..len).map(|_| rng.gen_range_f32(low, high)).collect()
}

fn spec(activation: Activation) -> LayerSpec {
    LayerSpec::BatchNormActivation {
        activation,
        options: NormalizationOptions::default(),
    }
}

/// `x -> bn` graph, initialized for `batch` samples.
fn single_layer_graph(config: EngineConfig, shape: Shape, activation: Activation, batch: usize) -> (Graph, LayerId, LayerId) {
    let mut graph = Graph::with_cpu(config).unwrap();
    let x = graph.add_input("x", shape).unwrap();
    let bn = graph.add_layer("bn", &spec(activation), &[x]).unwrap();
    graph.initialize(batch).unwrap();
    (graph, x, bn)
}

fn layer(graph: &Graph, id: LayerId) -> &BatchNormActivation {
    match graph.layer(id).unwrap() {
        LayerVariant::BatchNormActivation(bn) => bn,
        other => panic!("unexpected layer {}", other.name()),
    }
}

/// Per-channel mean and unbiased variance of plain `N C DHW` data.
fn reference_statistics(data: &[f32], batch: usize, shape: Shape) -> Vec<(f32, f32)> {
    let dhw = shape.dhw();
    (0..shape.c)
        .map(|c| {
            let values: Vec<f64> = (0..batch)
                .flat_map(|n| (0..dhw).map(move |s| (n, s)))
                .map(|(n, s)| data[(n * shape.c + c) * dhw + s] as f64)
                .collect();
            let count = values.len() as f64;
            let mean = values.iter().sum::<f64>() / count;
            let centered = values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>();
            (mean as f32, (centered / (count - 1.0)) as f32)
        })
        .collect()
}

// ============================================================================
// Running Statistics Tests
// ============================================================================

#[test]
fn test_running_statistics_follow_ema() {
    let shape = Shape::image(2, 2, 2);
    let batch = 2;
    let (mut graph, x, bn) = single_layer_graph(EngineConfig::default(), shape, Activation::Relu, batch);
    let data = random_data(batch * shape.cdhw(), 11, -2.0, 3.0);
    graph.set_input(x, &data).unwrap();

    let steps = 5;
    for _ in 0..steps {
        graph.forward(true).unwrap();
    }

    let decay = 0.99f32.powi(steps);
    let layer = layer(&graph, bn);
    for (c, (mean, unbiased)) in reference_statistics(&data, batch, shape).into_iter().enumerate() {
        assert_relative_eq!(layer.running_mean()[c], mean * (1.0 - decay), epsilon = 1e-5);
        assert_relative_eq!(
            layer.running_variance()[c],
            decay + unbiased * (1.0 - decay),
            epsilon = 1e-5
        );
    }
}

#[test]
fn test_padding_lanes_keep_initial_statistics() {
    let shape = Shape::image(3, 2, 2);
    let (mut graph, x, bn) = single_layer_graph(EngineConfig::default(), shape, Activation::Linear, 2);
    graph.set_input(x, &random_data(2 * shape.cdhw(), 5, -1.0, 1.0)).unwrap();
    graph.forward(true).unwrap();

    let layer = layer(&graph, bn);
    assert_eq!(layer.running_mean().len(), 8);
    for c in 3..8 {
        assert_eq!(layer.running_mean()[c], 0.0);
        assert_eq!(layer.running_variance()[c], 1.0);
    }
}

#[test]
fn test_constant_input_has_zero_variance() {
    let shape = Shape::image(2, 3, 3);
    let (mut graph, x, bn) = single_layer_graph(EngineConfig::default(), shape, Activation::Linear, 2);
    graph.set_input(x, &vec![4.0; 2 * shape.cdhw()]).unwrap();
    graph.forward(true).unwrap();

    let layer = layer(&graph, bn);
    assert_relative_eq!(layer.mean()[0], 4.0, epsilon = 1e-6);
    assert!(layer.variance()[0] >= 0.0);
    assert!(layer.variance()[0] < 1e-6);
    for y in graph.output(bn).unwrap() {
        assert_relative_eq!(y, 0.0, epsilon = 1e-3);
    }
}

// ============================================================================
// Inference Tests
// ============================================================================

#[test]
fn test_inference_is_deterministic_and_uses_running_statistics() {
    let shape = Shape::image(3, 2, 2);
    let (mut graph, x, bn) = single_layer_graph(EngineConfig::default(), shape, Activation::Linear, 1);
    let data = random_data(shape.cdhw(), 3, -1.0, 1.0);
    graph.set_input(x, &data).unwrap();

    graph.forward(false).unwrap();
    let first = graph.output(bn).unwrap();
    graph.forward(false).unwrap();
    let second = graph.output(bn).unwrap();
    assert_eq!(first, second);

    // fresh running statistics: mean 0, variance 1
    let inv_std = 1.0 / (1.0f32 + 1e-4).sqrt();
    for (y, x) in first.iter().zip(&data) {
        assert_relative_eq!(*y, x * inv_std, epsilon = 1e-6);
    }

    let layer = layer(&graph, bn);
    assert_eq!(layer.running_mean()[0], 0.0);
    assert_eq!(layer.running_variance()[0], 1.0);
}

#[test]
fn test_training_needs_two_values_per_channel() {
    let (mut graph, x, _) = single_layer_graph(EngineConfig::default(), Shape::vector(4), Activation::Relu, 1);
    graph.set_input(x, &[1.0, 2.0, 3.0, 4.0]).unwrap();

    let err = graph.forward(true).unwrap_err();
    assert!(matches!(err, LayerError::InsufficientStatistics { count: 1, .. }));
    graph.forward(false).unwrap();
}

// ============================================================================
// Statistics Mode Tests
// ============================================================================

#[test]
fn test_single_and_two_pass_statistics_agree() {
    let shape = Shape::image(4, 5, 5);
    let batch = 3;
    let data = random_data(batch * shape.cdhw(), 21, 9.0, 11.0);

    let run = |mode: StatisticsMode| {
        let config = EngineConfig {
            statistics_mode: mode,
            ..EngineConfig::default()
        };
        let (mut graph, x, bn) = single_layer_graph(config, shape, Activation::Linear, batch);
        graph.set_input(x, &data).unwrap();
        graph.forward(true).unwrap();
        let layer = layer(&graph, bn);
        (layer.mean().to_vec(), layer.variance().to_vec())
    };

    let (mean_single, var_single) = run(StatisticsMode::SinglePass);
    let (mean_two, var_two) = run(StatisticsMode::TwoPass);
    for c in 0..shape.c {
        assert_relative_eq!(mean_single[c], mean_two[c], max_relative = 1e-4);
        assert_relative_eq!(var_single[c], var_two[c], max_relative = 1e-3);
    }
}

// ============================================================================
// Gradient Tests
// ============================================================================

#[test]
fn test_input_gradient_matches_finite_differences() {
    let shape = Shape::image(3, 2, 2);
    let batch = 2;
    let len = batch * shape.cdhw();
    let (mut graph, x, bn) = single_layer_graph(EngineConfig::default(), shape, Activation::Swish, batch);
    let data = random_data(len, 7, -2.0, 2.0);
    let dy = random_data(len, 8, -1.0, 1.0);

    graph.set_input(x, &data).unwrap();
    graph.forward(true).unwrap();
    graph.set_output_gradient(bn, &dy).unwrap();
    graph.backward().unwrap();
    let analytic = graph.gradient(x).unwrap();

    let mut loss = |values: &[f32]| -> f32 {
        graph.set_input(x, values).unwrap();
        graph.forward(true).unwrap();
        graph
            .output(bn)
            .unwrap()
            .iter()
            .zip(&dy)
            .map(|(y, g)| y * g)
            .sum()
    };

    let h = 1e-2;
    for i in [0, 5, 9, 14, 23] {
        let mut plus = data.clone();
        plus[i] += h;
        let mut minus = data.clone();
        minus[i] -= h;
        let numeric = (loss(&plus) - loss(&minus)) / (2.0 * h);
        assert_relative_eq!(analytic[i], numeric, epsilon = 1e-2);
    }
}

#[test]
fn test_shift_gradient_sums_output_gradient() {
    let shape = Shape::image(2, 2, 2);
    let batch = 2;
    let len = batch * shape.cdhw();
    let (mut graph, x, bn) = single_layer_graph(EngineConfig::default(), shape, Activation::Linear, batch);
    let dy = random_data(len, 4, -1.0, 1.0);

    graph.set_input(x, &random_data(len, 3, -1.0, 1.0)).unwrap();
    graph.forward(true).unwrap();
    graph.set_output_gradient(bn, &dy).unwrap();
    graph.backward().unwrap();

    let dhw = shape.dhw();
    let layer = layer(&graph, bn);
    for c in 0..shape.c {
        let expected: f32 = (0..batch)
            .flat_map(|n| (0..dhw).map(move |s| (n * shape.c + c) * dhw + s))
            .map(|i| dy[i])
            .sum();
        assert_relative_eq!(layer.biases_d1()[c], expected, epsilon = 1e-5);
    }

    // the normalized input is centered, so a linear layer's input gradient sums to zero per channel
    let dx = graph.gradient(x).unwrap();
    for c in 0..shape.c {
        let sum: f32 = (0..batch)
            .flat_map(|n| (0..dhw).map(move |s| (n * shape.c + c) * dhw + s))
            .map(|i| dx[i])
            .sum();
        assert_relative_eq!(sum, 0.0, epsilon = 1e-4);
    }
}

#[test]
fn test_in_place_gradient_survives_repeated_backward() {
    let shape = Shape::vector(4);
    let batch = 2;
    let len = batch * shape.cdhw();
    let config = EngineConfig {
        in_place_backward: true,
        ..EngineConfig::default()
    };
    let (mut graph, x, bn) = single_layer_graph(config, shape, Activation::Linear, batch);

    graph.set_input(x, &random_data(len, 21, -1.0, 1.0)).unwrap();
    graph.forward(true).unwrap();
    graph.set_output_gradient(bn, &random_data(len, 22, -1.0, 1.0)).unwrap();
    graph.backward().unwrap();
    let first = graph.gradient(x).unwrap();
    assert!(first.iter().any(|g| *g != 0.0));

    assert!(matches!(
        graph.backward().unwrap_err(),
        LayerError::BackwardWithoutForward { .. }
    ));
    assert_eq!(graph.gradient(x).unwrap(), first);
}

/// Runs `x -> bn1 -> bn2` forward and backward and returns the gradient at `x`.
fn chain_gradient(config: EngineConfig) -> Vec<f32> {
    let shape = Shape::image(5, 3, 3);
    let batch = 2;
    let len = batch * shape.cdhw();
    let mut graph = Graph::with_cpu(config).unwrap();
    let x = graph.add_input("x", shape).unwrap();
    let bn1 = graph.add_layer("bn1", &spec(Activation::HardSwish), &[x]).unwrap();
    let bn2 = graph.add_layer("bn2", &spec(Activation::Tanh), &[bn1]).unwrap();
    graph.initialize(batch).unwrap();

    graph.set_input(x, &random_data(len, 31, -2.0, 2.0)).unwrap();
    graph.forward(true).unwrap();
    graph.set_output_gradient(bn2, &random_data(len, 32, -1.0, 1.0)).unwrap();
    graph.backward().unwrap();
    graph.gradient(x).unwrap()
}

#[test]
fn test_in_place_backward_matches_separate_buffers() {
    let normal = chain_gradient(EngineConfig::default());
    let in_place = chain_gradient(EngineConfig {
        in_place_backward: true,
        ..EngineConfig::default()
    });
    for (a, b) in normal.iter().zip(&in_place) {
        assert_relative_eq!(*a, *b, epsilon = 1e-5);
    }
}

#[test]
fn test_lean_gradient_buffers_match_kept_buffers() {
    let normal = chain_gradient(EngineConfig::default());
    let lean = chain_gradient(EngineConfig {
        lean_gradient_buffers: true,
        ..EngineConfig::default()
    });
    for (a, b) in normal.iter().zip(&lean) {
        assert_relative_eq!(*a, *b, epsilon = 1e-5);
    }
}

#[test]
fn test_uncached_primitives_match_cached() {
    let cached = chain_gradient(EngineConfig::default());
    let uncached = chain_gradient(EngineConfig {
        cache_primitives: false,
        max_threads: 1,
        ..EngineConfig::default()
    });
    for (a, b) in cached.iter().zip(&uncached) {
        assert_relative_eq!(*a, *b, epsilon = 1e-5);
    }
}

// ============================================================================
// Construction Tests
// ============================================================================

#[test]
fn test_activation_defaults_only_replace_zero() {
    let shape = Shape::vector(4);
    let defaulted =
        BatchNormActivation::new("bn", shape, Activation::BoundedRelu, NormalizationOptions::default()).unwrap();
    assert_eq!(defaulted.activation().alpha(), 6.0);

    let explicit = BatchNormActivation::new(
        "bn",
        shape,
        Activation::BoundedRelu,
        NormalizationOptions {
            alpha: 3.0,
            ..NormalizationOptions::default()
        },
    )
    .unwrap();
    assert_eq!(explicit.activation().alpha(), 3.0);
}

#[test]
fn test_invalid_momentum_rejected() {
    let err = BatchNormActivation::new(
        "bn",
        Shape::vector(4),
        Activation::Relu,
        NormalizationOptions {
            momentum: 1.0,
            ..NormalizationOptions::default()
        },
    )
    .unwrap_err();
    assert!(err.is_configuration());
}
