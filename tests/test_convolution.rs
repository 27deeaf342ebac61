// Integration tests for the depthwise and partial depthwise convolutions.
// Checks output geometry, hand-computed results, layout independence and the
// equivalence of two partial layers with one full depthwise layer.

use approx::assert_relative_eq;
use rust_layer_engine::backend::{ConvGeometry, CpuBackend};
use rust_layer_engine::layers::depthwise_conv::DepthwiseOptions;
use rust_layer_engine::layers::{DepthwiseConvolution, Layer, LayerSpec, LayerVariant, PartialDepthwiseConvolution};
use rust_layer_engine::parallel::Dispatcher;
use rust_layer_engine::tensor::WeightsFormat;
use rust_layer_engine::utils::SimpleRng;
use rust_layer_engine::{DataFormat, EngineConfig, Graph, LayerError, LayerId, Shape};

fn random_data(len: usize, seed: u64, low: f32, high: f32) -> Vec<f32> {
    let mut rng = SimpleRng::new(seed);
    (0..len).map(|_| rng.gen_range_f32(low, high)).collect()
}

fn depthwise(options: DepthwiseOptions) -> LayerSpec {
    LayerSpec::DepthwiseConvolution { options }
}

fn partial(groups: usize, group: usize, options: DepthwiseOptions) -> LayerSpec {
    LayerSpec::PartialDepthwiseConvolution {
        groups,
        group,
        options,
    }
}

/// Channels `range` of every sample of plain data with `channels` channels.
fn channel_slice(data: &[f32], batch: usize, channels: usize, dhw: usize, range: std::ops::Range<usize>) -> Vec<f32> {
    let mut out = Vec::new();
    for n in 0..batch {
        let start = (n * channels + range.start) * dhw;
        let end = (n * channels + range.end) * dhw;
        out.extend_from_slice(&data[start..end]);
    }
    out
}

fn assert_all_close(a: &[f32], b: &[f32], epsilon: f32) {
    assert_eq!(a.len(), b.len());
    for (x, y) in a.iter().zip(b) {
        assert_relative_eq!(*x, *y, epsilon = epsilon);
    }
}

// ============================================================================
// Geometry Tests
// ============================================================================

#[test]
fn test_output_sizes() {
    let mut rng = SimpleRng::new(1);
    let input = Shape::image(4, 32, 32);
    let cases = [
        (ConvGeometry::square(3).with_padding(1), 32),
        (ConvGeometry::square(3).with_padding(1).with_stride(2), 16),
        (ConvGeometry::square(3).with_dilation(2).with_padding(2), 32),
        (ConvGeometry::square(5), 28),
        (ConvGeometry::square(1).with_stride(4), 8),
    ];
    for (geometry, expected) in cases {
        let layer = DepthwiseConvolution::new("dw", input, DepthwiseOptions::new(geometry), &mut rng).unwrap();
        assert_eq!(layer.shape(), Shape::image(4, expected, expected), "{:?}", geometry);
    }
}

#[test]
fn test_multiplier_scales_output_channels() {
    let mut rng = SimpleRng::new(1);
    let options = DepthwiseOptions::new(ConvGeometry::square(3).with_padding(1)).with_multiplier(3);
    let layer = DepthwiseConvolution::new("dw", Shape::image(5, 8, 8), options, &mut rng).unwrap();
    assert_eq!(layer.shape(), Shape::image(15, 8, 8));
    assert_eq!(layer.weights().len(), 5 * 3 * 9);
    assert_eq!(layer.biases().len(), 15);
    assert_eq!(layer.parameter_count(), 5 * 3 * 9 + 15);
}

#[test]
fn test_partial_requires_even_split() {
    let mut graph = Graph::with_cpu(EngineConfig::default()).unwrap();
    let x = graph.add_input("x", Shape::image(10, 4, 4)).unwrap();
    let options = DepthwiseOptions::new(ConvGeometry::square(3).with_padding(1));
    let err = graph.add_layer("p", &partial(4, 1, options), &[x]).unwrap_err();
    assert!(matches!(err, LayerError::NotSplittable { channels: 10, groups: 4, .. }));
    assert!(err.is_configuration());
}

// ============================================================================
// Forward Pass Tests
// ============================================================================

#[test]
fn test_box_filter_counts_covered_pixels() {
    let shape = Shape::image(2, 4, 4);
    let mut graph = Graph::with_cpu(EngineConfig::default()).unwrap();
    let x = graph.add_input("x", shape).unwrap();
    let dw = graph
        .add_layer("dw", &depthwise(DepthwiseOptions::new(ConvGeometry::square(3).with_padding(1))), &[x])
        .unwrap();
    match graph.layer_mut(dw).unwrap() {
        LayerVariant::DepthwiseConvolution(layer) => {
            layer.weights_mut().iter_mut().for_each(|w| *w = 1.0);
            layer.biases_mut()[1] = 0.5;
        }
        other => panic!("unexpected layer {}", other.name()),
    }

    graph.initialize(1).unwrap();
    graph.set_input(x, &vec![1.0; shape.cdhw()]).unwrap();
    graph.forward(false).unwrap();

    let out = graph.output(dw).unwrap();
    let covered = [
        4.0, 6.0, 6.0, 4.0,
        6.0, 9.0, 9.0, 6.0,
        6.0, 9.0, 9.0, 6.0,
        4.0, 6.0, 6.0, 4.0,
    ];
    for (i, &expected) in covered.iter().enumerate() {
        assert_relative_eq!(out[i], expected);
        assert_relative_eq!(out[16 + i], expected + 0.5);
    }
}

#[test]
fn test_bias_gradient_counts_output_positions() {
    let shape = Shape::image(3, 6, 6);
    let batch = 2;
    let options = DepthwiseOptions::new(ConvGeometry::square(3).with_padding(1).with_stride(2)).with_multiplier(2);
    let mut graph = Graph::with_cpu(EngineConfig::default()).unwrap();
    let x = graph.add_input("x", shape).unwrap();
    let dw = graph.add_layer("dw", &depthwise(options), &[x]).unwrap();
    graph.initialize(batch).unwrap();

    graph.set_input(x, &random_data(batch * shape.cdhw(), 2, -1.0, 1.0)).unwrap();
    graph.forward(true).unwrap();
    let out_shape = graph.layer(dw).unwrap().shape();
    assert_eq!(out_shape, Shape::image(6, 3, 3));
    graph.set_output_gradient(dw, &vec![1.0; batch * out_shape.cdhw()]).unwrap();
    graph.backward().unwrap();

    match graph.layer(dw).unwrap() {
        LayerVariant::DepthwiseConvolution(layer) => {
            for &g in layer.biases_d1() {
                assert_relative_eq!(g, (batch * 9) as f32);
            }
        }
        other => panic!("unexpected layer {}", other.name()),
    }
}

// ============================================================================
// Layout Independence Tests
// ============================================================================

/// Output, input gradient and parameter gradients of one depthwise training step.
fn depthwise_step(mut graph: Graph) -> [Vec<f32>; 4] {
    let shape = Shape::image(10, 6, 6);
    let batch = 2;
    let options = DepthwiseOptions::new(ConvGeometry::square(3).with_padding(1).with_stride(2)).with_multiplier(2);
    let x = graph.add_input("x", shape).unwrap();
    let dw = graph.add_layer("dw", &depthwise(options), &[x]).unwrap();
    graph.initialize(batch).unwrap();

    graph.set_input(x, &random_data(batch * shape.cdhw(), 61, -1.0, 1.0)).unwrap();
    graph.forward(true).unwrap();
    let out_len = batch * graph.layer(dw).unwrap().shape().cdhw();
    graph.set_output_gradient(dw, &random_data(out_len, 62, -1.0, 1.0)).unwrap();
    graph.backward().unwrap();

    let (dw_d1, db_d1) = match graph.layer(dw).unwrap() {
        LayerVariant::DepthwiseConvolution(layer) => (layer.weights_d1().to_vec(), layer.biases_d1().to_vec()),
        other => panic!("unexpected layer {}", other.name()),
    };
    [graph.output(dw).unwrap(), graph.gradient(x).unwrap(), dw_d1, db_d1]
}

#[test]
fn test_blocked_layouts_match_plain() {
    let plain = depthwise_step(Graph::with_cpu(EngineConfig::default()).unwrap());
    let blocked = depthwise_step(
        Graph::new(
            EngineConfig::default(),
            Box::new(
                CpuBackend::with_dispatcher(Dispatcher::with_threads(3).unwrap())
                    .with_layouts(DataFormat::Blocked, WeightsFormat::Blocked),
            ),
        )
        .unwrap(),
    );
    for (a, b) in plain.iter().zip(&blocked) {
        assert_all_close(a, b, 1e-5);
    }
}

#[test]
fn test_uncached_primitives_match_cached() {
    let cached = depthwise_step(Graph::with_cpu(EngineConfig::default()).unwrap());
    let uncached = depthwise_step(
        Graph::with_cpu(EngineConfig {
            cache_primitives: false,
            ..EngineConfig::default()
        })
        .unwrap(),
    );
    for (a, b) in cached.iter().zip(&uncached) {
        assert_all_close(a, b, 1e-6);
    }
}

// ============================================================================
// Partial Depthwise Tests
// ============================================================================

#[test]
fn test_two_partials_equal_one_full_depthwise() {
    let shape = Shape::image(16, 5, 5);
    let batch = 2;
    let dhw = shape.dhw();
    let len = batch * shape.cdhw();
    let options = DepthwiseOptions::new(ConvGeometry::square(3).with_padding(1));
    let data = random_data(len, 71, -1.0, 1.0);
    let dy = random_data(len, 72, -1.0, 1.0);

    // one full layer
    let mut full = Graph::with_cpu(EngineConfig::default()).unwrap();
    let fx = full.add_input("x", shape).unwrap();
    let fdw = full.add_layer("dw", &depthwise(options), &[fx]).unwrap();
    let biases = random_data(16, 73, -0.5, 0.5);
    let weights = match full.layer_mut(fdw).unwrap() {
        LayerVariant::DepthwiseConvolution(layer) => {
            layer.biases_mut().copy_from_slice(&biases);
            layer.weights().to_vec()
        }
        other => panic!("unexpected layer {}", other.name()),
    };
    full.initialize(batch).unwrap();
    full.set_input(fx, &data).unwrap();
    full.forward(true).unwrap();
    full.set_output_gradient(fdw, &dy).unwrap();
    full.backward().unwrap();

    // two halves sharing the input
    let mut split = Graph::with_cpu(EngineConfig::default()).unwrap();
    let sx = split.add_input("x", shape).unwrap();
    let left = split.add_layer("left", &partial(2, 1, options), &[sx]).unwrap();
    let right = split.add_layer("right", &partial(2, 2, options), &[sx]).unwrap();
    assert_eq!(split.consumers(sx).unwrap(), 2);
    for (id, half) in [(left, 0..72), (right, 72..144)] {
        let channels = half.start / 9..half.end / 9;
        match split.layer_mut(id).unwrap() {
            LayerVariant::PartialDepthwiseConvolution(layer) => {
                layer.weights_mut().copy_from_slice(&weights[half]);
                layer.biases_mut().copy_from_slice(&biases[channels]);
            }
            other => panic!("unexpected layer {}", other.name()),
        }
    }
    split.initialize(batch).unwrap();
    split.set_input(sx, &data).unwrap();
    split.forward(true).unwrap();
    split.set_output_gradient(left, &channel_slice(&dy, batch, 16, dhw, 0..8)).unwrap();
    split.set_output_gradient(right, &channel_slice(&dy, batch, 16, dhw, 8..16)).unwrap();
    split.backward().unwrap();

    let full_out = full.output(fdw).unwrap();
    assert_all_close(&split.output(left).unwrap(), &channel_slice(&full_out, batch, 16, dhw, 0..8), 1e-6);
    assert_all_close(&split.output(right).unwrap(), &channel_slice(&full_out, batch, 16, dhw, 8..16), 1e-6);
    assert_all_close(&split.gradient(sx).unwrap(), &full.gradient(fx).unwrap(), 1e-5);

    let full_wd1 = match full.layer(fdw).unwrap() {
        LayerVariant::DepthwiseConvolution(layer) => layer.weights_d1().to_vec(),
        other => panic!("unexpected layer {}", other.name()),
    };
    let partial_wd1 = |id: LayerId| match split.layer(id).unwrap() {
        LayerVariant::PartialDepthwiseConvolution(layer) => layer.weights_d1().to_vec(),
        other => panic!("unexpected layer {}", other.name()),
    };
    assert_all_close(&partial_wd1(left), &full_wd1[..72], 1e-5);
    assert_all_close(&partial_wd1(right), &full_wd1[72..], 1e-5);
}

#[test]
fn test_partial_reads_its_own_slice() {
    let shape = Shape::image(16, 2, 2);
    let mut rng = SimpleRng::new(5);
    let options = DepthwiseOptions::new(ConvGeometry::square(1)).without_bias();
    let mut layer = PartialDepthwiseConvolution::new("p", shape, 4, 3, options, &mut rng).unwrap();
    layer.weights_mut().iter_mut().for_each(|w| *w = 2.0);
    assert_eq!(layer.channel_offset(), 8);
    assert_eq!(layer.shape(), Shape::image(4, 2, 2));

    let mut graph = Graph::with_cpu(EngineConfig::default()).unwrap();
    let x = graph.add_input("x", shape).unwrap();
    let p = graph.insert(layer, &[x]).unwrap();
    graph.initialize(1).unwrap();
    let data: Vec<f32> = (0..shape.cdhw()).map(|i| i as f32).collect();
    graph.set_input(x, &data).unwrap();
    graph.forward(false).unwrap();

    let expected: Vec<f32> = data[8 * 4..12 * 4].iter().map(|v| v * 2.0).collect();
    assert_all_close(&graph.output(p).unwrap(), &expected, 1e-6);
}
