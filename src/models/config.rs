//! Model configuration for the fine stage

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Fine-stage transformer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FineGptConfig {
    /// Number of transformer layers
    #[serde(default = "default_n_layer")]
    pub n_layer: usize,

    /// Number of attention heads
    #[serde(default = "default_n_head")]
    pub n_head: usize,

    /// Hidden dimension
    #[serde(default = "default_n_embd")]
    pub n_embd: usize,

    /// Maximum number of time steps
    #[serde(default = "default_block_size")]
    pub block_size: usize,

    /// Vocabulary size of the input token tables
    #[serde(default = "default_input_vocab_size")]
    pub input_vocab_size: usize,

    /// Vocabulary size of the output heads
    #[serde(default = "default_output_vocab_size")]
    pub output_vocab_size: usize,

    /// Total number of codebook levels per time step
    #[serde(default = "default_n_codes_total")]
    pub n_codes_total: usize,

    /// Number of coarse levels fixed before any fine head exists
    #[serde(default = "default_n_codes_given")]
    pub n_codes_given: usize,
}

// Default values matching the Bark fine checkpoint
fn default_n_layer() -> usize {
    24
}

fn default_n_head() -> usize {
    16
}

fn default_n_embd() -> usize {
    1024
}

fn default_block_size() -> usize {
    1024
}

fn default_input_vocab_size() -> usize {
    1056
}

fn default_output_vocab_size() -> usize {
    1056
}

fn default_n_codes_total() -> usize {
    8
}

fn default_n_codes_given() -> usize {
    1
}

impl Default for FineGptConfig {
    fn default() -> Self {
        Self {
            n_layer: default_n_layer(),
            n_head: default_n_head(),
            n_embd: default_n_embd(),
            block_size: default_block_size(),
            input_vocab_size: default_input_vocab_size(),
            output_vocab_size: default_output_vocab_size(),
            n_codes_total: default_n_codes_total(),
            n_codes_given: default_n_codes_given(),
        }
    }
}

impl FineGptConfig {
    /// Load configuration from a local JSON file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))?;

        Ok(config)
    }

    /// Number of output heads (one per level above the given coarse levels)
    pub fn n_fine_heads(&self) -> usize {
        self.n_codes_total - self.n_codes_given
    }

    /// Per-head dimension
    pub fn head_dim(&self) -> usize {
        self.n_embd / self.n_head
    }
}
