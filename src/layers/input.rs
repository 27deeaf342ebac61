//! Graph source holding user-supplied activations

use super::{description_header, BackwardContext, ForwardContext, InitContext, Layer, LayerType};
use crate::error::Result;
use crate::tensor::{DataFormat, Descriptors, MemoryDesc, Shape};

/// Source layer. Its activations are written by the executor in plain layout.
#[derive(Debug, Clone)]
pub struct InputLayer {
    name: String,
    shape: Shape,
}

impl InputLayer {
    pub fn new(name: &str, shape: Shape) -> Self {
        Self {
            name: name.to_string(),
            shape,
        }
    }
}

impl Layer for InputLayer {
    fn name(&self) -> &str {
        &self.name
    }

    fn layer_type(&self) -> LayerType {
        LayerType::Input
    }

    fn shape(&self) -> Shape {
        self.shape
    }

    fn fan_in(&self) -> usize {
        1
    }

    fn fan_out(&self) -> usize {
        1
    }

    fn description(&self) -> String {
        description_header(self)
    }

    fn initialize_descriptors(&mut self, ctx: &InitContext<'_>) -> Result<Descriptors> {
        Ok(Descriptors::symmetric(MemoryDesc::new(
            ctx.batch_size,
            self.shape,
            DataFormat::Plain,
        )))
    }

    fn forward_prop(&mut self, _ctx: ForwardContext<'_>) -> Result<()> {
        Ok(())
    }

    fn backward_prop(&mut self, _ctx: BackwardContext<'_>) -> Result<()> {
        Ok(())
    }
}
