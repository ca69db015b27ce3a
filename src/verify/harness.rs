//! Per-case orchestration and reporting
//!
//! The harness owns the model, the worker pool, and the probed scratch arena.
//! Cases run strictly sequentially: the arena is sized once before the first
//! case and never mutated while an evaluation is in flight. A broken fixture
//! or a failed evaluation aborts only its own case; the run always continues
//! to the end.

use anyhow::Result;
use std::path::{Path, PathBuf};

use super::compare::{compare, CaseOutcome, Tolerance};
use super::fixture::load_test_vector;
use super::scratch::{probe_scratch, ScratchArena};
use crate::exec::Executor;
use crate::models::fine_gpt::FineGpt;

/// One fixture to verify at a given codebook level.
#[derive(Debug, Clone)]
pub struct TestCase {
    pub fixture: PathBuf,
    pub level: usize,
}

impl TestCase {
    pub fn new<P: AsRef<Path>>(fixture: P, level: usize) -> Self {
        Self {
            fixture: fixture.as_ref().to_path_buf(),
            level,
        }
    }
}

/// Verdict for one case.
#[derive(Debug, Clone, PartialEq)]
pub enum CaseVerdict {
    /// Logits matched the reference within tolerance.
    Pass,
    /// Logits were computed but did not match.
    Fail(CaseOutcome),
    /// The case could not be evaluated at all (bad fixture, eval error).
    Skipped(String),
}

/// Verdict plus the identifying context a reporter needs.
#[derive(Debug, Clone)]
pub struct CaseReport {
    /// 1-based case number
    pub case_no: usize,
    pub fixture: PathBuf,
    pub verdict: CaseVerdict,
}

impl CaseReport {
    pub fn passed(&self) -> bool {
        self.verdict == CaseVerdict::Pass
    }
}

/// Where verdicts go. Kept separate from the orchestration loop so the
/// harness can run headless inside the test suite.
pub trait Reporter {
    fn report(&mut self, report: &CaseReport);
}

/// Prints one line per case.
pub struct ConsoleReporter;

impl Reporter for ConsoleReporter {
    fn report(&mut self, report: &CaseReport) {
        let path = report.fixture.display();
        match &report.verdict {
            CaseVerdict::Pass => println!("{}: test {} passed.", path, report.case_no),
            CaseVerdict::Fail(outcome) => {
                println!("{}: test {} failed ({}).", path, report.case_no, outcome)
            }
            CaseVerdict::Skipped(reason) => {
                println!("{}: test {} skipped: {}", path, report.case_no, reason)
            }
        }
    }
}

/// Collects reports without printing; handy for headless runs.
#[derive(Default)]
pub struct CollectingReporter {
    pub reports: Vec<CaseReport>,
}

impl Reporter for CollectingReporter {
    fn report(&mut self, report: &CaseReport) {
        self.reports.push(report.clone());
    }
}

/// Runs loader -> evaluator -> comparator per case.
pub struct Harness {
    model: FineGpt,
    executor: Executor,
    arena: ScratchArena,
    tolerance: Tolerance,
}

impl Harness {
    /// Build the worker pool and establish the scratch budget with one probe
    /// evaluation. Fails if the probe itself cannot run.
    pub fn new(model: FineGpt, threads: usize, tolerance: Tolerance) -> Result<Self> {
        let executor = Executor::new(threads)?;
        let arena = probe_scratch(&model, &executor)?;
        Ok(Self {
            model,
            executor,
            arena,
            tolerance,
        })
    }

    pub fn tolerance(&self) -> Tolerance {
        self.tolerance
    }

    fn run_case(&mut self, case: &TestCase) -> CaseVerdict {
        let vector = match load_test_vector(&case.fixture) {
            Ok(vector) => vector,
            Err(err) => {
                tracing::warn!("skipping {}: {:#}", case.fixture.display(), err);
                return CaseVerdict::Skipped(format!("{err:#}"));
            }
        };

        let logits = match self
            .model
            .eval(case.level, &vector.codes, &self.executor, &mut self.arena)
        {
            Ok(logits) => logits,
            Err(err) => {
                tracing::warn!("evaluation failed for {}: {:#}", case.fixture.display(), err);
                return CaseVerdict::Skipped(format!("{err:#}"));
            }
        };

        match compare(&logits, &vector.logits, self.tolerance) {
            CaseOutcome::Pass => CaseVerdict::Pass,
            outcome => CaseVerdict::Fail(outcome),
        }
    }

    /// Run every case in order, reporting each verdict as it lands. Individual
    /// failures never abort the run; the returned reports are the full record.
    pub fn run(&mut self, cases: &[TestCase], reporter: &mut dyn Reporter) -> Vec<CaseReport> {
        let mut reports = Vec::with_capacity(cases.len());
        for (i, case) in cases.iter().enumerate() {
            let report = CaseReport {
                case_no: i + 1,
                fixture: case.fixture.clone(),
                verdict: self.run_case(case),
            };
            reporter.report(&report);
            reports.push(report);
        }
        reports
    }
}
