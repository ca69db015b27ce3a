//! Fine-stage transformer and its evaluator entry point
//!
//! The fine stage refines an already-decided token grid: given all codebook
//! levels up to and including the target level, it predicts a fresh
//! distribution for the target level at every time step. Attention is
//! non-causal across time; conditioning is causal across levels.
//!
//! Architecture (GPT-2 style):
//! - one token embedding table per codebook level, summed over the
//!   conditioning levels
//! - learned absolute position embeddings
//! - pre-norm blocks of unmasked multi-head attention and a GELU MLP
//! - one output head per fine level

use anyhow::{anyhow, bail, ensure, Context, Result};
use candle_core::{DType, Device, Module, Tensor, D};
use candle_nn::{embedding, layer_norm, linear, linear_no_bias, Embedding, LayerNorm, Linear, VarBuilder};
use rayon::prelude::*;
use std::path::Path;

use super::config::FineGptConfig;
use crate::exec::Executor;
use crate::verify::scratch::ScratchArena;
use crate::{CodebookMatrix, LogitMatrix};

/// Lowest codebook level the fine stage predicts. Levels 0 and 1 are produced
/// by the earlier semantic/coarse stages and are never evaluated here.
pub const MIN_FINE_LEVEL: usize = 2;

const LN_EPS: f64 = 1e-5;

/// Unmasked multi-head self-attention
#[derive(Debug)]
struct Attention {
    c_attn: Linear,
    c_proj: Linear,
    n_head: usize,
    head_dim: usize,
    scale: f64,
}

impl Attention {
    fn new(config: &FineGptConfig, vb: VarBuilder) -> Result<Self> {
        let n_embd = config.n_embd;
        Ok(Self {
            c_attn: linear(n_embd, 3 * n_embd, vb.pp("c_attn"))?,
            c_proj: linear(n_embd, n_embd, vb.pp("c_proj"))?,
            n_head: config.n_head,
            head_dim: config.head_dim(),
            scale: 1.0 / (config.head_dim() as f64).sqrt(),
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let (seq_len, n_embd) = x.dims2()?;

        let qkv = self.c_attn.forward(x)?;
        let q = qkv.narrow(1, 0, n_embd)?;
        let k = qkv.narrow(1, n_embd, n_embd)?;
        let v = qkv.narrow(1, 2 * n_embd, n_embd)?;

        // [seq, n_embd] -> [n_head, seq, head_dim]
        let q = q
            .reshape((seq_len, self.n_head, self.head_dim))?
            .transpose(0, 1)?
            .contiguous()?;
        let k = k
            .reshape((seq_len, self.n_head, self.head_dim))?
            .transpose(0, 1)?
            .contiguous()?;
        let v = v
            .reshape((seq_len, self.n_head, self.head_dim))?
            .transpose(0, 1)?
            .contiguous()?;

        // Every time step attends to every other; no causal mask.
        let att = (q.matmul(&k.transpose(D::Minus2, D::Minus1)?.contiguous()?)? * self.scale)?;
        let att = candle_nn::ops::softmax_last_dim(&att)?;
        let out = att.matmul(&v)?;

        let out = out
            .transpose(0, 1)?
            .contiguous()?
            .reshape((seq_len, self.n_head * self.head_dim))?;

        Ok(self.c_proj.forward(&out)?)
    }
}

/// MLP block with GELU activation
#[derive(Debug)]
struct Mlp {
    c_fc: Linear,
    c_proj: Linear,
}

impl Mlp {
    fn new(config: &FineGptConfig, vb: VarBuilder) -> Result<Self> {
        let n_embd = config.n_embd;
        Ok(Self {
            c_fc: linear(n_embd, 4 * n_embd, vb.pp("c_fc"))?,
            c_proj: linear(4 * n_embd, n_embd, vb.pp("c_proj"))?,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let x = self.c_fc.forward(x)?;
        let x = x.gelu()?;
        Ok(self.c_proj.forward(&x)?)
    }
}

/// Pre-norm transformer block
#[derive(Debug)]
struct Block {
    ln_1: LayerNorm,
    attn: Attention,
    ln_2: LayerNorm,
    mlp: Mlp,
}

impl Block {
    fn new(config: &FineGptConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            ln_1: layer_norm(config.n_embd, LN_EPS, vb.pp("ln_1"))?,
            attn: Attention::new(config, vb.pp("attn"))?,
            ln_2: layer_norm(config.n_embd, LN_EPS, vb.pp("ln_2"))?,
            mlp: Mlp::new(config, vb.pp("mlp"))?,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let x = (x + self.attn.forward(&self.ln_1.forward(x)?)?)?;
        let x = (&x + self.mlp.forward(&self.ln_2.forward(&x)?)?)?;
        Ok(x)
    }
}

/// Fine-stage model: immutable once loaded, safely shared across worker threads.
#[derive(Debug)]
pub struct FineGpt {
    /// One token embedding table per codebook level
    wtes: Vec<Embedding>,
    /// Learned absolute position embeddings
    wpe: Embedding,
    layers: Vec<Block>,
    ln_f: LayerNorm,
    /// Output heads, indexed by `level - n_codes_given`
    lm_heads: Vec<Linear>,
    config: FineGptConfig,
    device: Device,
}

impl FineGpt {
    /// Build the model from a weight source.
    pub fn new(config: FineGptConfig, vb: VarBuilder) -> Result<Self> {
        ensure!(config.n_head > 0, "n_head must be positive");
        ensure!(
            config.n_embd % config.n_head == 0,
            "n_embd {} not divisible by n_head {}",
            config.n_embd,
            config.n_head
        );
        ensure!(
            config.n_codes_given < config.n_codes_total,
            "n_codes_given {} must be below n_codes_total {}",
            config.n_codes_given,
            config.n_codes_total
        );
        // Every fine level must have a head at lm_heads[level - n_codes_given]
        ensure!(
            config.n_codes_given <= MIN_FINE_LEVEL,
            "n_codes_given {} leaves fine level {} without an output head",
            config.n_codes_given,
            MIN_FINE_LEVEL
        );

        let mut wtes = Vec::with_capacity(config.n_codes_total);
        for i in 0..config.n_codes_total {
            wtes.push(embedding(
                config.input_vocab_size,
                config.n_embd,
                vb.pp(format!("wtes.{}", i)),
            )?);
        }

        let wpe = embedding(config.block_size, config.n_embd, vb.pp("wpe"))?;

        let mut layers = Vec::with_capacity(config.n_layer);
        for i in 0..config.n_layer {
            layers.push(Block::new(&config, vb.pp(format!("layers.{}", i)))?);
        }

        let ln_f = layer_norm(config.n_embd, LN_EPS, vb.pp("ln_f"))?;

        let mut lm_heads = Vec::with_capacity(config.n_fine_heads());
        for i in 0..config.n_fine_heads() {
            lm_heads.push(linear_no_bias(
                config.n_embd,
                config.output_vocab_size,
                vb.pp(format!("lm_heads.{}", i)),
            )?);
        }

        let device = vb.device().clone();
        Ok(Self {
            wtes,
            wpe,
            layers,
            ln_f,
            lm_heads,
            config,
            device,
        })
    }

    /// Load the model from a directory containing `model.safetensors` and,
    /// optionally, `config.json`.
    pub fn load<P: AsRef<Path>>(dir: P, device: &Device) -> Result<Self> {
        let dir = dir.as_ref();

        let config_path = dir.join("config.json");
        let config = if config_path.exists() {
            FineGptConfig::from_file(&config_path)?
        } else {
            tracing::info!("no config.json in {}, using defaults", dir.display());
            FineGptConfig::default()
        };

        let weights_path = dir.join("model.safetensors");
        let tensors = candle_core::safetensors::load(&weights_path, device)
            .with_context(|| format!("Failed to load weights from {}", weights_path.display()))?;

        // Convert BF16 to F32
        let tensors = tensors
            .into_iter()
            .map(|(name, tensor)| {
                let tensor = if tensor.dtype() == DType::BF16 {
                    tensor.to_dtype(DType::F32)?
                } else {
                    tensor
                };
                Ok((name, tensor))
            })
            .collect::<Result<_>>()?;

        let vb = VarBuilder::from_tensors(tensors, DType::F32, device);
        tracing::info!("loaded fine model from {}", dir.display());
        Self::new(config, vb)
    }

    pub fn config(&self) -> &FineGptConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    fn validate_input(&self, level: usize, codes: &CodebookMatrix) -> Result<()> {
        let max_level = self.config.n_codes_total - 1;
        ensure!(
            (MIN_FINE_LEVEL..=max_level).contains(&level),
            "codebook level {} outside fine range [{}, {}]",
            level,
            MIN_FINE_LEVEL,
            max_level
        );
        ensure!(!codes.is_empty(), "codebook grid has no time steps");
        ensure!(
            codes.len() <= self.config.block_size,
            "codebook grid has {} time steps, model supports at most {}",
            codes.len(),
            self.config.block_size
        );
        for (t, row) in codes.iter().enumerate() {
            if row.len() != self.config.n_codes_total {
                bail!(
                    "codebook grid is not rectangular: row {} has {} levels, expected {}",
                    t,
                    row.len(),
                    self.config.n_codes_total
                );
            }
            for (l, &code) in row.iter().enumerate() {
                if code as usize >= self.config.input_vocab_size {
                    bail!(
                        "code {} at step {} level {} exceeds vocabulary size {}",
                        code,
                        t,
                        l,
                        self.config.input_vocab_size
                    );
                }
            }
        }
        Ok(())
    }

    /// Predict logits for `level` at every time step of `codes`.
    ///
    /// Conditioning sums the token embeddings of levels `0..=level` per time
    /// step, so lower levels (and the current contents of the target level)
    /// are all visible. The output head projection is parallel-mapped over row
    /// chunks on `executor`; chunked results match the single-threaded pass up
    /// to float-associativity drift. When `arena` is fixed, no scratch
    /// reallocation happens inside the call.
    pub fn eval(
        &self,
        level: usize,
        codes: &CodebookMatrix,
        executor: &Executor,
        arena: &mut ScratchArena,
    ) -> Result<LogitMatrix> {
        self.validate_input(level, codes)?;

        let rows = codes.len();
        let vocab = self.config.output_vocab_size;

        // Token conditioning: sum of per-level embeddings for levels 0..=level.
        let mut tok_emb: Option<Tensor> = None;
        for l in 0..=level {
            let column: Vec<u32> = codes.iter().map(|row| row[l]).collect();
            let ids = Tensor::from_vec(column, rows, &self.device)?;
            let emb = self.wtes[l].forward(&ids)?;
            tok_emb = Some(match tok_emb {
                Some(acc) => (acc + emb)?,
                None => emb,
            });
        }
        let tok_emb = tok_emb.ok_or_else(|| anyhow!("no conditioning levels"))?;

        let positions = Tensor::arange(0u32, rows as u32, &self.device)?;
        let pos_emb = self.wpe.forward(&positions)?;

        let mut hidden = (tok_emb + pos_emb)?;
        for block in &self.layers {
            hidden = block.forward(&hidden)?;
        }
        let hidden = self.ln_f.forward(&hidden)?;

        // Target-level head, split over row chunks on the worker pool.
        let head = &self.lm_heads[level - self.config.n_codes_given];
        let ranges = executor.row_ranges(rows);
        let chunks: Vec<Vec<f32>> = executor.install(|| {
            ranges
                .par_iter()
                .map(|&(start, len)| -> Result<Vec<f32>> {
                    let h = hidden.narrow(0, start, len)?;
                    let logits = head.forward(&h)?;
                    Ok(logits.flatten_all()?.to_vec1::<f32>()?)
                })
                .collect::<Result<Vec<_>>>()
        })?;

        // Stage through the arena so the fixed-budget contract is exercised.
        let staged = arena.stage(rows, vocab)?;
        let mut offset = 0;
        for chunk in &chunks {
            staged[offset..offset + chunk.len()].copy_from_slice(chunk);
            offset += chunk.len();
        }

        Ok(staged.chunks_exact(vocab).map(|row| row.to_vec()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::verify::scratch::ScratchArena;
    use candle_nn::VarMap;

    fn tiny_config() -> FineGptConfig {
        FineGptConfig {
            n_layer: 2,
            n_head: 2,
            n_embd: 16,
            block_size: 32,
            input_vocab_size: 40,
            output_vocab_size: 24,
            n_codes_total: 8,
            n_codes_given: 1,
        }
    }

    fn mock_model(config: FineGptConfig) -> FineGpt {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        FineGpt::new(config, vb).unwrap()
    }

    fn grid(rows: usize) -> CodebookMatrix {
        (0..rows)
            .map(|t| (0..8).map(|l| ((t + l) % 40) as u32).collect())
            .collect()
    }

    #[test]
    fn test_eval_output_shape() {
        let model = mock_model(tiny_config());
        let exec = Executor::new(1).unwrap();
        let mut arena = ScratchArena::probe();
        let logits = model.eval(2, &grid(5), &exec, &mut arena).unwrap();
        assert_eq!(logits.len(), 5);
        assert!(logits.iter().all(|row| row.len() == 24));
    }

    #[test]
    fn test_eval_rejects_coarse_levels() {
        let model = mock_model(tiny_config());
        let exec = Executor::new(1).unwrap();
        let mut arena = ScratchArena::probe();
        for level in [0, 1, 8, 99] {
            assert!(model.eval(level, &grid(3), &exec, &mut arena).is_err());
        }
    }

    #[test]
    fn test_eval_rejects_ragged_grid() {
        let model = mock_model(tiny_config());
        let exec = Executor::new(1).unwrap();
        let mut arena = ScratchArena::probe();
        let mut codes = grid(4);
        codes[2].pop();
        assert!(model.eval(3, &codes, &exec, &mut arena).is_err());
    }

    #[test]
    fn test_eval_rejects_out_of_vocab_code() {
        let model = mock_model(tiny_config());
        let exec = Executor::new(1).unwrap();
        let mut arena = ScratchArena::probe();
        let mut codes = grid(4);
        codes[1][3] = 40;
        assert!(model.eval(2, &codes, &exec, &mut arena).is_err());
    }

    #[test]
    fn test_eval_rejects_empty_and_oversized_grids() {
        let model = mock_model(tiny_config());
        let exec = Executor::new(1).unwrap();
        let mut arena = ScratchArena::probe();
        assert!(model.eval(2, &Vec::new(), &exec, &mut arena).is_err());
        assert!(model.eval(2, &grid(33), &exec, &mut arena).is_err());
    }

    #[test]
    fn test_new_rejects_bad_head_split() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let config = FineGptConfig {
            n_embd: 10,
            n_head: 3,
            ..tiny_config()
        };
        assert!(FineGpt::new(config, vb).is_err());
    }

    #[test]
    fn test_new_rejects_zero_heads() {
        // A config.json with n_head: 0 must fail with a diagnostic, not a
        // divide-by-zero panic.
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let config = FineGptConfig {
            n_head: 0,
            ..tiny_config()
        };
        let err = FineGpt::new(config, vb).unwrap_err();
        assert!(err.to_string().contains("n_head"));
    }

    #[test]
    fn test_new_rejects_n_codes_given_above_fine_range() {
        // With n_codes_given = 3 the head index for level 2 would underflow;
        // construction must fail instead of deferring to a panic in eval.
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let config = FineGptConfig {
            n_codes_given: 3,
            ..tiny_config()
        };
        let err = FineGpt::new(config, vb).unwrap_err();
        assert!(err.to_string().contains("n_codes_given"));
    }

    #[test]
    fn test_new_accepts_n_codes_given_at_fine_boundary() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let config = FineGptConfig {
            n_codes_given: 2,
            ..tiny_config()
        };
        let model = FineGpt::new(config, vb).unwrap();
        let exec = Executor::new(1).unwrap();
        let mut arena = ScratchArena::probe();
        // Level 2 uses head index 0; must evaluate, not underflow
        let logits = model.eval(2, &grid(3), &exec, &mut arena).unwrap();
        assert_eq!(logits.len(), 3);
    }
}
