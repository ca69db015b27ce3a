//! # bark-fine
//!
//! Pure Rust inference for the "fine" refinement stage of a Bark-style
//! hierarchical audio token model, plus a regression harness that verifies
//! computed logits against precomputed reference fixtures.
//!
//! The fine stage takes a grid of already-decided codebook tokens and predicts
//! the distribution for one additional codebook level at every time step:
//! causal across levels, non-causal across time.
//!
//! ## Example
//!
//! ```rust,ignore
//! use bark_fine::{ConsoleReporter, FineGpt, Harness, TestCase, Tolerance};
//!
//! let model = FineGpt::load("test_data/fine_model", &candle_core::Device::Cpu)?;
//! let mut harness = Harness::new(model, 4, Tolerance::default())?;
//! let cases = vec![TestCase::new("test_data/fine_gpt_eval/test_fine_gpt_eval_1.bin", 2)];
//! harness.run(&cases, &mut ConsoleReporter);
//! ```

pub mod exec;
pub mod models;
pub mod verify;

/// Re-exports for convenience
pub use exec::Executor;
pub use models::config::FineGptConfig;
pub use models::fine_gpt::FineGpt;
pub use verify::compare::{CaseOutcome, Tolerance};
pub use verify::harness::{
    CaseReport, CaseVerdict, CollectingReporter, ConsoleReporter, Harness, Reporter, TestCase,
};

/// Discrete token grid: one row per time step, one column per codebook level.
pub type CodebookMatrix = Vec<Vec<u32>>;

/// Dense score matrix: one row per time step, one column per vocabulary entry.
pub type LogitMatrix = Vec<Vec<f32>>;
