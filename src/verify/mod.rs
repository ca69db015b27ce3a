//! Regression verification
//!
//! This module contains:
//! - `scratch`: scratch-memory accounting and the probe that sizes it
//! - `fixture`: binary test-vector parsing
//! - `compare`: elementwise closeness oracle
//! - `harness`: per-case orchestration and reporting

pub mod compare;
pub mod fixture;
pub mod harness;
pub mod scratch;

pub use compare::{compare, CaseOutcome, Tolerance};
pub use fixture::{load_test_vector, TestVector};
pub use harness::{
    CaseReport, CaseVerdict, CollectingReporter, ConsoleReporter, Harness, Reporter, TestCase,
};
pub use scratch::{probe_scratch, ArenaMode, ScratchArena};
