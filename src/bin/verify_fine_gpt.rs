//! Regression driver for the fine-stage evaluator.
//!
//! Loads the model once (fatal on failure), sizes the scratch arena with one
//! probe evaluation, then checks each reference fixture in turn. Case
//! verdicts are observational: the exit status only reflects run-level
//! failures.

use anyhow::Result;
use candle_core::Device;
use clap::Parser;
use std::path::Path;

use bark_fine::{ConsoleReporter, FineGpt, Harness, TestCase, Tolerance};

/// Fixture files and the codebook level each one exercises.
const FIXTURES: [(&str, usize); 6] = [
    ("test_fine_gpt_eval_1.bin", 2),
    ("test_fine_gpt_eval_2.bin", 3),
    ("test_fine_gpt_eval_3.bin", 4),
    ("test_fine_gpt_eval_4.bin", 5),
    ("test_fine_gpt_eval_5.bin", 6),
    ("test_fine_gpt_eval_6.bin", 7),
];

#[derive(Parser, Debug)]
#[command(author, version, about = "Verify fine-stage logits against reference fixtures")]
struct Args {
    /// Directory containing model.safetensors (and optionally config.json)
    #[arg(short, long, default_value = "test_data/fine_model")]
    model_dir: String,

    /// Directory containing the fixture .bin files
    #[arg(short, long, default_value = "test_data/fine_gpt_eval")]
    fixture_dir: String,

    /// Worker threads per evaluation
    #[arg(short, long, default_value_t = 4)]
    threads: usize,

    /// Absolute tolerance
    #[arg(long, default_value_t = 1e-3)]
    atol: f32,

    /// Relative tolerance
    #[arg(long, default_value_t = 1e-2)]
    rtol: f32,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let device = Device::Cpu;
    let model = FineGpt::load(&args.model_dir, &device)?;

    let tolerance = Tolerance {
        atol: args.atol,
        rtol: args.rtol,
    };
    let mut harness = Harness::new(model, args.threads, tolerance)?;

    let fixture_dir = Path::new(&args.fixture_dir);
    let cases: Vec<TestCase> = FIXTURES
        .iter()
        .map(|&(name, level)| TestCase::new(fixture_dir.join(name), level))
        .collect();

    let reports = harness.run(&cases, &mut ConsoleReporter);

    let passed = reports.iter().filter(|r| r.passed()).count();
    println!();
    println!("{}/{} cases passed", passed, reports.len());

    Ok(())
}
