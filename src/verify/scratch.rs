//! Scratch-memory accounting for the evaluator
//!
//! The evaluator stages its output logits through a [`ScratchArena`]. In probe
//! mode the arena grows freely and records the per-token byte cost it
//! observed; once fixed, its capacity covers the largest grid the model
//! accepts and any request beyond it fails instead of reallocating. The
//! per-token cost never decreases over the lifetime of a run.

use anyhow::{bail, ensure, Result};

use crate::exec::Executor;
use crate::models::fine_gpt::{FineGpt, MIN_FINE_LEVEL};
use crate::CodebookMatrix;

const BYTES_PER_SLOT: usize = std::mem::size_of::<f32>();

/// Whether the arena may still grow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArenaMode {
    /// Measurement pass: allocations grow the arena and are recorded.
    Probe,
    /// Real pass: capacity is settled; exceeding it is an error.
    Fixed,
}

/// Reusable scratch buffer with an explicit probe/fixed life cycle.
pub struct ScratchArena {
    buf: Vec<f32>,
    bytes_per_token: usize,
    mode: ArenaMode,
}

impl ScratchArena {
    /// Fresh arena in probe mode with nothing allocated yet.
    pub fn probe() -> Self {
        Self {
            buf: Vec::new(),
            bytes_per_token: 0,
            mode: ArenaMode::Probe,
        }
    }

    pub fn mode(&self) -> ArenaMode {
        self.mode
    }

    /// Per-token byte cost discovered so far. Zero until a probe evaluation ran.
    pub fn bytes_per_token(&self) -> usize {
        self.bytes_per_token
    }

    pub fn capacity_bytes(&self) -> usize {
        self.buf.len() * BYTES_PER_SLOT
    }

    /// Settle the arena: preallocate room for `max_rows` time steps at the
    /// probed per-token cost and stop growing. The per-token cost is kept
    /// monotonically non-decreasing, so re-fixing can only enlarge the arena.
    pub fn fix(&mut self, max_rows: usize) -> Result<()> {
        ensure!(
            self.bytes_per_token > 0,
            "cannot fix scratch arena before a probe evaluation has run"
        );
        let slots = max_rows * self.bytes_per_token.div_ceil(BYTES_PER_SLOT);
        if slots > self.buf.len() {
            self.buf.resize(slots, 0.0);
        }
        self.mode = ArenaMode::Fixed;
        Ok(())
    }

    /// Hand out a staging slice for `rows x cols` values.
    pub(crate) fn stage(&mut self, rows: usize, cols: usize) -> Result<&mut [f32]> {
        let slots = rows * cols;
        match self.mode {
            ArenaMode::Probe => {
                if slots > self.buf.len() {
                    self.buf.resize(slots, 0.0);
                }
                let per_token = (slots * BYTES_PER_SLOT).div_ceil(rows.max(1));
                self.bytes_per_token = self.bytes_per_token.max(per_token);
            }
            ArenaMode::Fixed => {
                if slots > self.buf.len() {
                    bail!(
                        "scratch arena exhausted: need {} bytes for {} time steps, capacity {}",
                        slots * BYTES_PER_SLOT,
                        rows,
                        self.capacity_bytes()
                    );
                }
            }
        }
        Ok(&mut self.buf[..slots])
    }
}

/// Synthetic conditioning grid for the probe: several time steps, all levels
/// populated with small in-vocabulary codes.
fn probe_grid(n_levels: usize, vocab: usize) -> CodebookMatrix {
    (0..8)
        .map(|t| (0..n_levels).map(|l| ((t + l) % vocab) as u32).collect())
        .collect()
}

/// Run one throwaway evaluation to size the arena, then fix it so that every
/// grid the model accepts (up to `block_size` time steps) fits without any
/// further allocation.
pub fn probe_scratch(model: &FineGpt, executor: &Executor) -> Result<ScratchArena> {
    let config = model.config();
    let mut arena = ScratchArena::probe();

    let grid = probe_grid(config.n_codes_total, config.input_vocab_size);
    model.eval(MIN_FINE_LEVEL, &grid, executor, &mut arena)?;

    arena.fix(config.block_size)?;
    tracing::info!(
        "scratch probe: {} bytes per token, arena fixed at {} bytes",
        arena.bytes_per_token(),
        arena.capacity_bytes()
    );
    Ok(arena)
}
