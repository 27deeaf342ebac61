//! Engine-wide execution options
//!
//! Options that change how every layer manages buffers and backend primitives
//! live here rather than in each layer. Their effects are applied centrally by
//! the graph executor:
//!
//! - **cache_primitives**: backend primitive descriptors are built once while
//!   descriptors are initialized and reused by every pass. When off, each
//!   forward or backward call asks the backend for a fresh descriptor.
//! - **lean_gradient_buffers**: gradient arrays are not kept alive between
//!   passes. An upstream gradient array is allocated (zeroed) just before the
//!   first downstream backward pass writes into it, and a layer's own gradient
//!   array is released once its backward pass has consumed it.
//! - **in_place_backward**: a fused normalization layer that is the only
//!   consumer of its input computes the input gradient in place. The executor
//!   hands the layer's gradient array to the upstream tensor, and the layer
//!   overwrites it element-wise instead of accumulating into a separate one.
//!   Shared inputs and layout changes fall back to the normal path.
//! - **statistics_mode**: single-pass or two-pass batch statistics for fused
//!   normalization layers.

use crate::error::{LayerError, Result};
use crate::utils::statistics::StatisticsMode;
use serde::{Deserialize, Serialize};
use std::fs;

/// Execution options shared by all layers of a graph.
///
/// # Example
///
/// ```json
/// {
///   "cache_primitives": true,
///   "lean_gradient_buffers": false,
///   "in_place_backward": true,
///   "statistics_mode": "two_pass"
/// }
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub cache_primitives: bool,
    pub lean_gradient_buffers: bool,
    pub in_place_backward: bool,
    pub statistics_mode: StatisticsMode,
    /// Worker cap for the dispatcher; 0 means one per logical CPU.
    pub max_threads: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache_primitives: true,
            lean_gradient_buffers: false,
            in_place_backward: false,
            statistics_mode: StatisticsMode::TwoPass,
            max_threads: 0,
        }
    }
}

/// Loads an engine configuration from a JSON file.
///
/// Missing fields take their defaults.
///
/// # Examples
///
/// ```no_run
/// use rust_layer_engine::config::load_config;
///
/// let cfg = load_config("config/engine.json").unwrap();
/// assert!(cfg.cache_primitives);
/// ```
pub fn load_config(path: &str) -> Result<EngineConfig> {
    let contents = fs::read_to_string(path)?;
    parse_config(&contents)
}

/// Parses and validates an engine configuration from JSON text.
pub fn parse_config(contents: &str) -> Result<EngineConfig> {
    let config: EngineConfig = serde_json::from_str(contents)?;
    validate_config(&config)?;
    Ok(config)
}

fn validate_config(config: &EngineConfig) -> Result<()> {
    if config.max_threads > 4096 {
        return Err(LayerError::invalid(
            "engine",
            format!("max_threads {} is out of range", config.max_threads),
        ));
    }

    if config.lean_gradient_buffers && config.in_place_backward {
        log::warn!("in_place_backward with lean gradient buffers: released arrays are reallocated per pass");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_object() {
        let cfg = parse_config("{}").unwrap();
        assert_eq!(cfg, EngineConfig::default());
        assert!(cfg.cache_primitives);
        assert_eq!(cfg.statistics_mode, StatisticsMode::TwoPass);
    }

    #[test]
    fn test_parse_all_fields() {
        let cfg = parse_config(
            r#"{"cache_primitives": false, "lean_gradient_buffers": true,
                "in_place_backward": true, "statistics_mode": "single_pass", "max_threads": 2}"#,
        )
        .unwrap();
        assert!(!cfg.cache_primitives);
        assert!(cfg.lean_gradient_buffers);
        assert!(cfg.in_place_backward);
        assert_eq!(cfg.statistics_mode, StatisticsMode::SinglePass);
        assert_eq!(cfg.max_threads, 2);
    }

    #[test]
    fn test_invalid_mode_rejected() {
        assert!(parse_config(r#"{"statistics_mode": "three_pass"}"#).is_err());
        assert!(parse_config(r#"{"max_threads": 100000}"#).is_err());
    }
}
