//! Layer graph: an arena of nodes addressed by [`LayerId`] and the executor
//! that runs them
//!
//! Nodes are appended in dependency order, so the arena order is already a
//! topological order. Forward runs front to back, backward back to front.
//! Each node owns its activation and gradient arrays and counts its
//! consumers; a gradient array with more than one consumer only ever
//! receives additive merges.
//!
//! The executor also applies the [`EngineConfig`] options centrally:
//! descriptors are re-initialized whenever the batch size or the mode
//! changes, gradient arrays are allocated lazily and released early in lean
//! mode, and sole-consumer normalization layers receive their gradient
//! in place when `in_place_backward` is set.

use crate::backend::{Backend, CpuBackend};
use crate::config::EngineConfig;
use crate::error::{LayerError, Result};
use crate::layers::{
    BackwardContext, ForwardContext, InitContext, InputGradient, InputLayer, Layer, LayerSpec, LayerType,
    LayerVariant, Materialization, Mode,
};
use crate::parallel::Dispatcher;
use crate::tensor::{DataFormat, Descriptors, MemoryDesc, Shape, TensorBuffer};
use crate::utils::persist::Persist;
use crate::utils::SimpleRng;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

fn dispatcher_for(config: &EngineConfig) -> Result<Dispatcher> {
    if config.max_threads == 0 {
        Dispatcher::new()
    } else {
        Dispatcher::with_threads(config.max_threads)
    }
}

/// Handle of a node in a [`Graph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LayerId(usize);

impl LayerId {
    pub fn index(self) -> usize {
        self.0
    }
}

#[derive(Debug)]
struct Node {
    layer: LayerVariant,
    inputs: Vec<LayerId>,
    consumers: usize,
    buffers: TensorBuffer,
    descriptors: Option<Descriptors>,
    materialization: Materialization,
}

impl Node {
    fn descriptors(&self) -> Result<Descriptors> {
        self.descriptors.ok_or(LayerError::NotInitialized)
    }
}

/// Directed acyclic graph of layers plus the buffers they exchange.
///
/// # Example
///
/// ```
/// use rust_layer_engine::config::EngineConfig;
/// use rust_layer_engine::graph::Graph;
/// use rust_layer_engine::layers::LayerSpec;
/// use rust_layer_engine::tensor::{FormatPreference, Shape};
///
/// let mut graph = Graph::with_cpu(EngineConfig::default()).unwrap();
/// let a = graph.add_input("a", Shape::vector(4)).unwrap();
/// let b = graph.add_input("b", Shape::vector(4)).unwrap();
/// let avg = graph
///     .add_layer("avg", &LayerSpec::Average { format: FormatPreference::Any }, &[a, b])
///     .unwrap();
///
/// graph.initialize(1).unwrap();
/// graph.set_input(a, &[1.0, 2.0, 3.0, 4.0]).unwrap();
/// graph.set_input(b, &[5.0, 6.0, 7.0, 8.0]).unwrap();
/// graph.forward(false).unwrap();
/// assert_eq!(graph.output(avg).unwrap(), vec![3.0, 4.0, 5.0, 6.0]);
/// ```
pub struct Graph {
    config: EngineConfig,
    backend: Box<dyn Backend>,
    dispatcher: Dispatcher,
    rng: SimpleRng,
    nodes: Vec<Node>,
    batch_size: usize,
    prepared: Option<(usize, Mode)>,
    trained: bool,
}

impl std::fmt::Debug for Graph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Graph")
            .field("backend", &self.backend.name())
            .field("nodes", &self.nodes.len())
            .field("batch_size", &self.batch_size)
            .field("prepared", &self.prepared)
            .finish()
    }
}

impl Graph {
    /// Creates an empty graph executing on `backend`.
    pub fn new(config: EngineConfig, backend: Box<dyn Backend>) -> Result<Self> {
        let dispatcher = dispatcher_for(&config)?;
        Ok(Self::assemble(config, backend, dispatcher))
    }

    /// Creates an empty graph on a [`CpuBackend`] sharing the graph's thread pool.
    pub fn with_cpu(config: EngineConfig) -> Result<Self> {
        let dispatcher = dispatcher_for(&config)?;
        let backend = Box::new(CpuBackend::with_dispatcher(dispatcher.clone()));
        Ok(Self::assemble(config, backend, dispatcher))
    }

    fn assemble(config: EngineConfig, backend: Box<dyn Backend>, dispatcher: Dispatcher) -> Self {
        log::debug!(
            "graph created on backend '{}' with {} worker(s)",
            backend.name(),
            dispatcher.max_threads()
        );
        Self {
            config,
            backend,
            dispatcher,
            rng: SimpleRng::new(0),
            nodes: Vec::new(),
            batch_size: 0,
            prepared: None,
            trained: false,
        }
    }

    /// Reseeds the generator used for weights of layers added afterwards.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = SimpleRng::new(seed);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn backend(&self) -> &dyn Backend {
        self.backend.as_ref()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Mode the descriptors are currently initialized for.
    pub fn mode(&self) -> Option<Mode> {
        self.prepared.map(|(_, mode)| mode)
    }

    /// Adds a source layer.
    pub fn add_input(&mut self, name: &str, shape: Shape) -> Result<LayerId> {
        if shape.is_empty() {
            return Err(LayerError::invalid(name, "input shape is empty"));
        }
        self.check_inputs(name, &[])?;
        self.push(InputLayer::new(name, shape).into(), &[])
    }

    /// Builds a layer from `spec` and connects it to `inputs`.
    ///
    /// # Errors
    ///
    /// Unknown or repeated inputs and every constructor error of the layer.
    pub fn add_layer(&mut self, name: &str, spec: &LayerSpec, inputs: &[LayerId]) -> Result<LayerId> {
        self.check_inputs(name, inputs)?;
        let shapes: Vec<Shape> = inputs.iter().map(|id| self.nodes[id.0].layer.shape()).collect();
        let layer = spec.build(name, &shapes, &mut self.rng)?;
        self.push(layer, inputs)
    }

    /// Connects an already constructed layer to `inputs`.
    pub fn insert(&mut self, layer: impl Into<LayerVariant>, inputs: &[LayerId]) -> Result<LayerId> {
        let layer = layer.into();
        self.check_inputs(layer.name(), inputs)?;
        self.push(layer, inputs)
    }

    fn check_inputs(&self, name: &str, inputs: &[LayerId]) -> Result<()> {
        if self.find(name).is_some() {
            return Err(LayerError::invalid(name, "a layer with this name already exists"));
        }
        for (i, id) in inputs.iter().enumerate() {
            if id.0 >= self.nodes.len() {
                return Err(LayerError::UnknownLayer(format!("#{}", id.0)));
            }
            if inputs[..i].contains(id) {
                return Err(LayerError::DuplicateInput {
                    layer: name.to_string(),
                    input: self.nodes[id.0].layer.name().to_string(),
                });
            }
        }
        Ok(())
    }

    fn push(&mut self, layer: LayerVariant, inputs: &[LayerId]) -> Result<LayerId> {
        for id in inputs {
            self.nodes[id.0].consumers += 1;
        }
        let id = LayerId(self.nodes.len());
        log::debug!(
            "added {} '{}' {} <- {:?}",
            layer.layer_type(),
            layer.name(),
            layer.shape(),
            inputs.iter().map(|i| self.nodes[i.0].layer.name()).collect::<Vec<_>>()
        );
        self.nodes.push(Node {
            layer,
            inputs: inputs.to_vec(),
            consumers: 0,
            buffers: TensorBuffer::new(),
            descriptors: None,
            materialization: Materialization::Uninitialized,
        });
        self.prepared = None;
        Ok(id)
    }

    pub fn find(&self, name: &str) -> Option<LayerId> {
        self.nodes
            .iter()
            .position(|n| n.layer.name() == name)
            .map(LayerId)
    }

    fn node(&self, id: LayerId) -> Result<&Node> {
        self.nodes
            .get(id.0)
            .ok_or_else(|| LayerError::UnknownLayer(format!("#{}", id.0)))
    }

    fn node_mut(&mut self, id: LayerId) -> Result<&mut Node> {
        self.nodes
            .get_mut(id.0)
            .ok_or_else(|| LayerError::UnknownLayer(format!("#{}", id.0)))
    }

    pub fn layer(&self, id: LayerId) -> Result<&LayerVariant> {
        Ok(&self.node(id)?.layer)
    }

    /// Mutable access to a layer, e.g. to edit its parameters.
    pub fn layer_mut(&mut self, id: LayerId) -> Result<&mut LayerVariant> {
        Ok(&mut self.node_mut(id)?.layer)
    }

    pub fn inputs(&self, id: LayerId) -> Result<&[LayerId]> {
        Ok(&self.node(id)?.inputs)
    }

    /// Number of layers reading this layer's output.
    pub fn consumers(&self, id: LayerId) -> Result<usize> {
        Ok(self.node(id)?.consumers)
    }

    pub fn materialization(&self, id: LayerId) -> Result<Materialization> {
        Ok(self.node(id)?.materialization)
    }

    pub fn descriptors(&self, id: LayerId) -> Result<Descriptors> {
        self.node(id)?.descriptors()
    }

    /// Allocates activation storage for `batch_size` samples.
    ///
    /// Descriptors are (re)initialized by the next forward pass when the
    /// batch size differs from the one they were built for.
    pub fn initialize(&mut self, batch_size: usize) -> Result<()> {
        if batch_size == 0 {
            return Err(LayerError::invalid("graph", "batch size must be positive"));
        }
        if self.batch_size != batch_size {
            log::debug!("batch size {} -> {}", self.batch_size, batch_size);
        }
        self.batch_size = batch_size;
        for node in &mut self.nodes {
            let shape = node.layer.shape();
            if node.buffers.resize(batch_size, &shape, false) {
                log::trace!("{}: allocated {} values", node.layer.name(), node.buffers.len());
                node.descriptors = None;
                node.materialization = Materialization::Uninitialized;
            }
        }
        Ok(())
    }

    /// Initializes descriptors for the current batch size and `mode` unless
    /// they already are.
    pub fn prepare(&mut self, mode: Mode) -> Result<()> {
        let batch = self.batch_size;
        if batch == 0 {
            return Err(LayerError::NotInitialized);
        }
        if self.prepared == Some((batch, mode)) {
            return Ok(());
        }
        match self.prepared {
            Some((old_batch, old_mode)) if old_batch == batch => {
                log::debug!("mode {:?} -> {:?}, re-initializing descriptors", old_mode, mode)
            }
            _ => log::debug!("initializing descriptors for batch {} in {:?} mode", batch, mode),
        }
        self.prepared = None;

        let training = mode.is_training();
        let with_gradient = training && !self.config.lean_gradient_buffers;
        for i in 0..self.nodes.len() {
            let (before, rest) = self.nodes.split_at_mut(i);
            let node = &mut rest[0];
            let inputs = node
                .inputs
                .iter()
                .map(|id| before[id.0].descriptors())
                .collect::<Result<Vec<_>>>()?;
            let ctx = InitContext {
                backend: self.backend.as_ref(),
                config: &self.config,
                batch_size: batch,
                training,
                inputs: &inputs,
            };
            let descriptors = node.layer.initialize_descriptors(&ctx)?;
            descriptors.dst.check_buffer(batch * node.layer.shape().padded_cdhw())?;

            let shape = node.layer.shape();
            node.buffers.resize(batch, &shape, with_gradient);
            if with_gradient {
                node.buffers.ensure_gradient();
            } else if !training {
                node.buffers.release_gradient();
            }
            node.descriptors = Some(descriptors);
            node.materialization = Materialization::Initialized { batch_size: batch };
        }

        self.prepared = Some((batch, mode));
        self.trained = false;
        Ok(())
    }

    /// Copies plain `N C D H W` data into an input layer.
    pub fn set_input(&mut self, id: LayerId, data: &[f32]) -> Result<()> {
        let batch = self.batch_size;
        let node = self.node_mut(id)?;
        if node.layer.layer_type() != LayerType::Input {
            return Err(LayerError::invalid(node.layer.name(), "not an input layer"));
        }
        let desc = MemoryDesc::new(batch, node.layer.shape(), DataFormat::Plain);
        if data.len() != desc.required_len() {
            return Err(LayerError::BufferLength {
                expected: desc.required_len(),
                actual: data.len(),
            });
        }
        desc.check_buffer(node.buffers.neurons.len())?;
        node.buffers.neurons[..data.len()].copy_from_slice(data);
        Ok(())
    }

    /// Runs every layer's forward pass in arena order.
    ///
    /// A training pass clears every gradient array (or releases it in lean
    /// mode) so the following backward pass can accumulate into it.
    pub fn forward(&mut self, training: bool) -> Result<()> {
        self.prepare(Mode::from_training(training))?;
        let batch = self.batch_size;
        let lean = self.config.lean_gradient_buffers;

        for i in 0..self.nodes.len() {
            let (before, rest) = self.nodes.split_at_mut(i);
            let node = &mut rest[0];
            if training {
                if lean {
                    node.buffers.release_gradient();
                } else {
                    node.buffers.zero_gradient();
                }
            }
            if node.inputs.is_empty() {
                continue;
            }
            let inputs: Vec<&[f32]> = node
                .inputs
                .iter()
                .map(|id| before[id.0].buffers.neurons.as_slice())
                .collect();
            let ctx = ForwardContext {
                backend: self.backend.as_ref(),
                dispatcher: &self.dispatcher,
                config: &self.config,
                batch_size: batch,
                training,
                inputs,
                neurons: &mut node.buffers.neurons,
            };
            node.layer.forward_prop(ctx)?;
            log::trace!("{}: forward done", node.layer.name());
        }

        self.trained = training;
        Ok(())
    }

    /// Writes a plain `N C D H W` gradient into a layer's gradient array.
    pub fn set_output_gradient(&mut self, id: LayerId, data: &[f32]) -> Result<()> {
        let batch = self.batch_size;
        let backend = self.backend.as_ref();
        let node = self
            .nodes
            .get_mut(id.0)
            .ok_or_else(|| LayerError::UnknownLayer(format!("#{}", id.0)))?;
        let target = node.descriptors()?.diff_dst;
        let plain = MemoryDesc::new(batch, node.layer.shape(), DataFormat::Plain);
        if data.len() != plain.required_len() {
            return Err(LayerError::BufferLength {
                expected: plain.required_len(),
                actual: data.len(),
            });
        }
        node.buffers.ensure_gradient();
        backend.reorder(data, &plain, &mut node.buffers.neurons_d1, &target)?;
        backend.wait()
    }

    /// Runs every layer's backward pass in reverse arena order.
    ///
    /// # Errors
    ///
    /// [`LayerError::BackwardWithoutForward`] unless the last forward pass
    /// was a training pass. Each training pass allows one backward pass; the
    /// gradient arrays it leaves behind are only valid for that single run.
    pub fn backward(&mut self) -> Result<()> {
        if !self.trained {
            let layer = self
                .nodes
                .last()
                .map(|n| n.layer.name().to_string())
                .unwrap_or_default();
            return Err(LayerError::BackwardWithoutForward { layer });
        }
        self.trained = false;
        let batch = self.batch_size;
        let lean = self.config.lean_gradient_buffers;

        for i in (0..self.nodes.len()).rev() {
            let (before, rest) = self.nodes.split_at_mut(i);
            let node = &mut rest[0];
            if node.inputs.is_empty() {
                continue;
            }
            if lean && node.buffers.ensure_gradient() {
                log::trace!("{}: allocated gradient nobody wrote", node.layer.name());
            }

            let own_diff = node.descriptors()?.diff_dst;
            let in_place = self.config.in_place_backward
                && node.layer.supports_in_place_backward()
                && node.inputs.len() == 1
                && {
                    let upstream = &before[node.inputs[0].0];
                    upstream.consumers == 1 && upstream.descriptors()?.diff_dst == own_diff
                };

            if in_place {
                let upstream = &mut before[node.inputs[0].0];
                std::mem::swap(&mut upstream.buffers.neurons_d1, &mut node.buffers.neurons_d1);
                log::trace!(
                    "{}: gradient handed to '{}' for in-place backward",
                    node.layer.name(),
                    upstream.layer.name()
                );
            } else if lean {
                for id in &node.inputs {
                    let upstream = &mut before[id.0];
                    if upstream.buffers.ensure_gradient() {
                        log::trace!("{}: allocated gradient array", upstream.layer.name());
                    }
                }
            }

            let mut slots: Vec<(usize, InputGradient<'_>)> = Vec::with_capacity(node.inputs.len());
            for (j, upstream) in before.iter_mut().enumerate() {
                if let Some(position) = node.inputs.iter().position(|id| id.0 == j) {
                    let shared = upstream.consumers > 1;
                    let buffers = &mut upstream.buffers;
                    slots.push((
                        position,
                        InputGradient {
                            neurons: &buffers.neurons,
                            neurons_d1: &mut buffers.neurons_d1,
                            shared,
                        },
                    ));
                }
            }
            slots.sort_by_key(|(position, _)| *position);

            let ctx = BackwardContext {
                backend: self.backend.as_ref(),
                dispatcher: &self.dispatcher,
                config: &self.config,
                batch_size: batch,
                inputs: slots.into_iter().map(|(_, slot)| slot).collect(),
                neurons: &node.buffers.neurons,
                neurons_d1: &node.buffers.neurons_d1,
                in_place,
            };
            node.layer.backward_prop(ctx)?;

            if lean {
                node.buffers.release_gradient();
                log::trace!("{}: released gradient array", node.layer.name());
            }
        }
        Ok(())
    }

    /// Activations of a layer as plain `N C D H W`.
    pub fn output(&self, id: LayerId) -> Result<Vec<f32>> {
        let node = self.node(id)?;
        let desc = match node.descriptors {
            Some(d) => d.dst,
            None => MemoryDesc::new(self.batch_size, node.layer.shape(), DataFormat::Plain),
        };
        self.to_plain(&node.buffers.neurons, &desc)
    }

    /// Gradient of a layer as plain `N C D H W`.
    pub fn gradient(&self, id: LayerId) -> Result<Vec<f32>> {
        let node = self.node(id)?;
        let desc = node.descriptors()?.diff_dst;
        if !node.buffers.has_gradient() {
            return Ok(vec![0.0; desc.standalone(DataFormat::Plain).required_len()]);
        }
        self.to_plain(&node.buffers.neurons_d1, &desc)
    }

    fn to_plain(&self, data: &[f32], desc: &MemoryDesc) -> Result<Vec<f32>> {
        let plain = desc.standalone(DataFormat::Plain);
        let mut out = vec![0.0; plain.required_len()];
        self.backend.reorder(data, desc, &mut out, &plain)?;
        self.backend.wait()?;
        Ok(out)
    }

    /// Re-draws the parameters of every layer from `seed`.
    pub fn reset_weights(&mut self, seed: u64) {
        for (i, node) in self.nodes.iter_mut().enumerate() {
            node.layer.reset_weights(seed.wrapping_add(i as u64));
        }
    }

    /// Total bytes written by [`Graph::save_weights`].
    pub fn weights_size(&self) -> usize {
        self.nodes
            .iter()
            .filter_map(|n| n.layer.persist())
            .map(|p| p.weights_size())
            .sum()
    }

    pub fn parameter_count(&self) -> usize {
        self.nodes.iter().map(|n| n.layer.parameter_count()).sum()
    }

    /// Writes the parameters of every persistable layer in arena order.
    pub fn save_weights(&self, writer: &mut dyn Write) -> Result<()> {
        for node in &self.nodes {
            if let Some(persist) = node.layer.persist() {
                persist.save(writer)?;
            }
        }
        Ok(())
    }

    /// Reads parameters written by [`Graph::save_weights`] for the same graph.
    pub fn load_weights(&mut self, reader: &mut dyn Read) -> Result<()> {
        for node in &mut self.nodes {
            if let Some(persist) = node.layer.persist_mut() {
                persist.load(reader)?;
            }
        }
        Ok(())
    }

    pub fn save_weights_to(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut writer = BufWriter::new(File::create(path)?);
        self.save_weights(&mut writer)?;
        writer.flush()?;
        Ok(())
    }

    pub fn load_weights_from(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let mut reader = BufReader::new(File::open(path)?);
        self.load_weights(&mut reader)
    }

    /// Human-readable summary of every layer.
    pub fn describe(&self) -> String {
        let mut out = String::new();
        for node in &self.nodes {
            out.push_str(&node.layer.description());
            if !node.inputs.is_empty() {
                let names: Vec<&str> = node
                    .inputs
                    .iter()
                    .map(|id| self.nodes[id.0].layer.name())
                    .collect();
                out.push_str(&format!("\n Inputs:\t{}", names.join(", ")));
            }
            out.push_str("\n\n");
        }
        out.push_str(&format!("Parameters: {}\n", self.parameter_count()));
        out
    }
}
