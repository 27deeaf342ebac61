//! Graph description files
//!
//! This module provides the JSON form of a layer graph so architectures can
//! be changed without code changes. Inputs are declared with their shapes,
//! layers name their inputs and carry their [`LayerSpec`] parameters inline.
//!
//! ```json
//! {
//!   "seed": 7,
//!   "inputs": [{ "name": "image", "shape": { "c": 16, "h": 8, "w": 8 } }],
//!   "layers": [
//!     { "name": "bn", "inputs": ["image"], "type": "batch_norm_activation", "activation": "relu" },
//!     { "name": "dw", "inputs": ["bn"], "type": "depthwise_convolution",
//!       "kernel_h": 3, "kernel_w": 3, "pad_h": 1, "pad_w": 1 }
//!   ]
//! }
//! ```

use crate::backend::Backend;
use crate::config::EngineConfig;
use crate::error::{LayerError, Result};
use crate::graph::{Graph, LayerId};
use crate::layers::LayerSpec;
use crate::tensor::Shape;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;

/// A source tensor of the graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputConfig {
    pub name: String,
    pub shape: Shape,
}

/// One layer: its name, the names of its inputs and its parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerConfig {
    pub name: String,
    pub inputs: Vec<String>,
    #[serde(flatten)]
    pub spec: LayerSpec,
}

/// Whole graph description. Layers may only reference inputs or layers
/// declared before them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchitectureConfig {
    /// Seed for weight initialization.
    #[serde(default)]
    pub seed: u64,
    pub inputs: Vec<InputConfig>,
    pub layers: Vec<LayerConfig>,
}

/// Loads and validates a graph description from a JSON file.
///
/// # Examples
///
/// ```no_run
/// use rust_layer_engine::architecture::load_architecture;
///
/// let arch = load_architecture("config/architectures/mobile_block.json").unwrap();
/// assert!(!arch.layers.is_empty());
/// ```
pub fn load_architecture(path: &str) -> Result<ArchitectureConfig> {
    let contents = fs::read_to_string(path)?;
    parse_architecture(&contents)
}

/// Parses and validates a graph description from JSON text.
pub fn parse_architecture(contents: &str) -> Result<ArchitectureConfig> {
    let config: ArchitectureConfig = serde_json::from_str(contents)?;
    validate_architecture(&config)?;
    Ok(config)
}

/// Checks names and references without building any layer.
///
/// - at least one input
/// - names are unique across inputs and layers
/// - every referenced input was declared earlier
fn validate_architecture(config: &ArchitectureConfig) -> Result<()> {
    if config.inputs.is_empty() {
        return Err(LayerError::invalid("architecture", "at least one input is required"));
    }

    let mut declared: Vec<&str> = Vec::new();
    for input in &config.inputs {
        if declared.contains(&input.name.as_str()) {
            return Err(LayerError::invalid(&input.name, "name declared twice"));
        }
        declared.push(&input.name);
    }

    for layer in &config.layers {
        if declared.contains(&layer.name.as_str()) {
            return Err(LayerError::invalid(&layer.name, "name declared twice"));
        }
        if layer.inputs.is_empty() {
            return Err(LayerError::invalid(&layer.name, "layer has no inputs"));
        }
        if let Some(missing) = layer.inputs.iter().find(|i| !declared.contains(&i.as_str())) {
            return Err(LayerError::UnknownLayer(missing.clone()));
        }
        declared.push(&layer.name);
    }

    Ok(())
}

/// Builds the described graph on the CPU backend.
///
/// # Examples
///
/// ```
/// use rust_layer_engine::architecture::{build_graph, parse_architecture};
/// use rust_layer_engine::config::EngineConfig;
///
/// let arch = parse_architecture(
///     r#"{ "inputs": [{ "name": "x", "shape": { "c": 4, "h": 2, "w": 2 } }],
///          "layers": [{ "name": "up", "inputs": ["x"], "type": "resampling",
///                       "algorithm": "nearest", "factor_h": 2.0, "factor_w": 2.0 }] }"#,
/// )
/// .unwrap();
/// let graph = build_graph(&arch, EngineConfig::default()).unwrap();
/// assert_eq!(graph.len(), 2);
/// ```
pub fn build_graph(config: &ArchitectureConfig, engine: EngineConfig) -> Result<Graph> {
    populate(Graph::with_cpu(engine)?, config)
}

/// Builds the described graph on a caller-supplied backend.
pub fn build_graph_on(config: &ArchitectureConfig, engine: EngineConfig, backend: Box<dyn Backend>) -> Result<Graph> {
    populate(Graph::new(engine, backend)?, config)
}

fn populate(graph: Graph, config: &ArchitectureConfig) -> Result<Graph> {
    validate_architecture(config)?;
    let mut graph = graph.with_seed(config.seed);
    let mut ids: HashMap<&str, LayerId> = HashMap::new();

    for input in &config.inputs {
        let id = graph.add_input(&input.name, input.shape)?;
        ids.insert(&input.name, id);
    }
    for layer in &config.layers {
        let inputs = layer
            .inputs
            .iter()
            .map(|name| {
                ids.get(name.as_str())
                    .copied()
                    .ok_or_else(|| LayerError::UnknownLayer(name.clone()))
            })
            .collect::<Result<Vec<_>>>()?;
        let id = graph.add_layer(&layer.name, &layer.spec, &inputs)?;
        ids.insert(&layer.name, id);
    }

    log::debug!(
        "built graph with {} input(s) and {} layer(s)",
        config.inputs.len(),
        config.layers.len()
    );
    Ok(graph)
}
