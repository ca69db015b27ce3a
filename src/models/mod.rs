//! Neural network model for the fine stage
//!
//! This module contains:
//! - `config`: Model configuration
//! - `fine_gpt`: The fine-stage transformer and its evaluator entry point

pub mod config;
pub mod fine_gpt;

pub use config::FineGptConfig;
pub use fine_gpt::FineGpt;
