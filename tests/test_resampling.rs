// Integration tests for spatial resampling.

use approx::assert_relative_eq;
use rust_layer_engine::backend::ResamplingAlgorithm;
use rust_layer_engine::layers::{Layer, LayerSpec};
use rust_layer_engine::{EngineConfig, FormatPreference, Graph, LayerId, Shape};

fn resampling(algorithm: ResamplingAlgorithm, factor_h: f32, factor_w: f32) -> LayerSpec {
    LayerSpec::Resampling {
        algorithm,
        factor_h,
        factor_w,
        format: FormatPreference::Any,
    }
}

fn graph_with(shape: Shape, spec: &LayerSpec, batch: usize) -> (Graph, LayerId, LayerId) {
    let mut graph = Graph::with_cpu(EngineConfig::default()).unwrap();
    let x = graph.add_input("x", shape).unwrap();
    let up = graph.add_layer("up", spec, &[x]).unwrap();
    graph.initialize(batch).unwrap();
    (graph, x, up)
}

// ============================================================================
// Nearest Neighbour Tests
// ============================================================================

#[test]
fn test_nearest_upsample_repeats_pixels() {
    let (mut graph, x, up) = graph_with(Shape::image(1, 2, 2), &resampling(ResamplingAlgorithm::Nearest, 2.0, 2.0), 1);
    graph.set_input(x, &[1.0, 2.0, 3.0, 4.0]).unwrap();
    graph.forward(false).unwrap();

    let expected = [
        1.0, 1.0, 2.0, 2.0, //
        1.0, 1.0, 2.0, 2.0, //
        3.0, 3.0, 4.0, 4.0, //
        3.0, 3.0, 4.0, 4.0,
    ];
    assert_eq!(graph.output(up).unwrap(), expected.to_vec());
}

#[test]
fn test_nearest_upsample_backward_collects_copies() {
    let (mut graph, x, up) = graph_with(Shape::image(2, 2, 2), &resampling(ResamplingAlgorithm::Nearest, 2.0, 2.0), 2);
    graph.set_input(x, &[0.0; 16]).unwrap();
    graph.forward(true).unwrap();
    graph.set_output_gradient(up, &[1.0; 64]).unwrap();
    graph.backward().unwrap();

    for g in graph.gradient(x).unwrap() {
        assert_relative_eq!(g, 4.0);
    }
}

#[test]
fn test_nearest_downsample_picks_centers() {
    let (mut graph, x, down) =
        graph_with(Shape::image(1, 4, 4), &resampling(ResamplingAlgorithm::Nearest, 0.5, 0.5), 1);
    let data: Vec<f32> = (0..16).map(|i| i as f32).collect();
    graph.set_input(x, &data).unwrap();
    graph.forward(true).unwrap();
    assert_eq!(graph.output(down).unwrap(), vec![5.0, 7.0, 13.0, 15.0]);

    graph.set_output_gradient(down, &[1.0, 2.0, 3.0, 4.0]).unwrap();
    graph.backward().unwrap();
    let dx = graph.gradient(x).unwrap();
    assert_eq!(dx[5], 1.0);
    assert_eq!(dx[15], 4.0);
    assert_eq!(dx.iter().filter(|g| **g == 0.0).count(), 12);
}

// ============================================================================
// Bilinear Tests
// ============================================================================

#[test]
fn test_linear_preserves_constant_image() {
    let shape = Shape::image(3, 3, 5);
    let (mut graph, x, up) = graph_with(shape, &resampling(ResamplingAlgorithm::Linear, 1.5, 2.0), 1);
    assert_eq!(graph.layer(up).unwrap().shape(), Shape::image(3, 4, 10));

    graph.set_input(x, &vec![2.5; shape.cdhw()]).unwrap();
    graph.forward(false).unwrap();
    for y in graph.output(up).unwrap() {
        assert_relative_eq!(y, 2.5, epsilon = 1e-6);
    }
}

#[test]
fn test_linear_backward_conserves_gradient_mass() {
    let shape = Shape::image(2, 3, 3);
    let (mut graph, x, up) = graph_with(shape, &resampling(ResamplingAlgorithm::Linear, 2.0, 2.0), 2);
    graph.set_input(x, &vec![0.0; 2 * shape.cdhw()]).unwrap();
    graph.forward(true).unwrap();

    let out_len = 2 * graph.layer(up).unwrap().shape().cdhw();
    let dy: Vec<f32> = (0..out_len).map(|i| ((i % 5) as f32) * 0.5).collect();
    graph.set_output_gradient(up, &dy).unwrap();
    graph.backward().unwrap();

    let total_in: f32 = graph.gradient(x).unwrap().iter().sum();
    let total_out: f32 = dy.iter().sum();
    assert_relative_eq!(total_in, total_out, max_relative = 1e-5);
}

// ============================================================================
// Shared Input Tests
// ============================================================================

#[test]
fn test_two_resamplings_merge_into_shared_input() {
    let shape = Shape::image(1, 2, 2);
    let mut graph = Graph::with_cpu(EngineConfig::default()).unwrap();
    let x = graph.add_input("x", shape).unwrap();
    let up = graph
        .add_layer("up", &resampling(ResamplingAlgorithm::Nearest, 2.0, 2.0), &[x])
        .unwrap();
    let same = graph
        .add_layer("same", &resampling(ResamplingAlgorithm::Nearest, 1.0, 1.0), &[x])
        .unwrap();
    graph.initialize(1).unwrap();
    graph.set_input(x, &[1.0, 2.0, 3.0, 4.0]).unwrap();
    graph.forward(true).unwrap();

    graph.set_output_gradient(up, &[1.0; 16]).unwrap();
    graph.set_output_gradient(same, &[0.5, 1.0, 1.5, 2.0]).unwrap();
    graph.backward().unwrap();

    let dx = graph.gradient(x).unwrap();
    for (g, extra) in dx.iter().zip([0.5, 1.0, 1.5, 2.0]) {
        assert_relative_eq!(*g, 4.0 + extra);
    }
}
