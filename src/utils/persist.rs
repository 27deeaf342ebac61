//! Raw little-endian parameter streams
//!
//! Layers persist their parameters as flat `f32` arrays with no header.
//! Normalization layers write the running mean (`C` values) and running
//! variance (`C` values) first, then the generic weight/bias block.

use crate::error::Result;
use std::io::{Read, Write};

pub const FLOAT_SIZE: usize = std::mem::size_of::<f32>();

/// Writes `values` as little-endian f32.
pub fn write_f32s(writer: &mut dyn Write, values: &[f32]) -> Result<()> {
    let mut bytes = Vec::with_capacity(values.len() * FLOAT_SIZE);
    for &value in values {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    writer.write_all(&bytes)?;
    Ok(())
}

/// Fills `values` from little-endian f32 data.
pub fn read_f32s(reader: &mut dyn Read, values: &mut [f32]) -> Result<()> {
    let mut raw = vec![0u8; values.len() * FLOAT_SIZE];
    reader.read_exact(&mut raw)?;
    for (value, chunk) in values.iter_mut().zip(raw.chunks_exact(FLOAT_SIZE)) {
        *value = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
    }
    Ok(())
}

/// Parameter persistence implemented by layers that own trainable state.
pub trait Persist {
    /// Exact number of bytes written by `save`.
    fn weights_size(&self) -> usize;

    fn save(&self, writer: &mut dyn Write) -> Result<()>;

    fn load(&mut self, reader: &mut dyn Read) -> Result<()>;
}
