//! Elementwise closeness oracle
//!
//! A regression check against the last known-good reference, not an
//! independent correctness proof. Shape mismatches fail immediately and
//! ignore tolerance entirely.

use std::fmt;

use crate::LogitMatrix;

/// Absolute and relative tolerance for the elementwise test
/// `|a - b| <= atol + rtol * |b|`.
#[derive(Debug, Clone, Copy)]
pub struct Tolerance {
    pub atol: f32,
    pub rtol: f32,
}

impl Default for Tolerance {
    // Loose enough to absorb reduction-order drift across 24 accumulated
    // layers and thread-count changes, tight enough to catch real regressions.
    fn default() -> Self {
        Self {
            atol: 1e-3,
            rtol: 1e-2,
        }
    }
}

/// Typed comparison result.
#[derive(Debug, Clone, PartialEq)]
pub enum CaseOutcome {
    Pass,
    ShapeMismatch {
        expected: (usize, usize),
        actual: (usize, usize),
    },
    Mismatch {
        mismatched: usize,
        total: usize,
        max_abs_diff: f32,
        worst: (usize, usize),
    },
}

impl CaseOutcome {
    pub fn is_pass(&self) -> bool {
        matches!(self, CaseOutcome::Pass)
    }
}

impl fmt::Display for CaseOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaseOutcome::Pass => write!(f, "pass"),
            CaseOutcome::ShapeMismatch { expected, actual } => write!(
                f,
                "shape mismatch: expected {}x{}, got {}x{}",
                expected.0, expected.1, actual.0, actual.1
            ),
            CaseOutcome::Mismatch {
                mismatched,
                total,
                max_abs_diff,
                worst,
            } => write!(
                f,
                "{}/{} values out of tolerance, max |diff| {:.6} at ({}, {})",
                mismatched, total, max_abs_diff, worst.0, worst.1
            ),
        }
    }
}

/// Compare a computed logit matrix against the reference.
pub fn compare(computed: &LogitMatrix, reference: &LogitMatrix, tol: Tolerance) -> CaseOutcome {
    let expected = (reference.len(), reference.first().map_or(0, |r| r.len()));
    let actual = (computed.len(), computed.first().map_or(0, |r| r.len()));

    if expected != actual
        || computed.iter().any(|row| row.len() != actual.1)
        || reference.iter().any(|row| row.len() != expected.1)
    {
        return CaseOutcome::ShapeMismatch { expected, actual };
    }

    let mut mismatched = 0;
    let mut max_abs_diff = 0.0f32;
    let mut worst = (0, 0);
    let mut total = 0;

    for (r, (crow, rrow)) in computed.iter().zip(reference.iter()).enumerate() {
        for (c, (&a, &b)) in crow.iter().zip(rrow.iter()).enumerate() {
            total += 1;
            let diff = (a - b).abs();
            if diff.is_nan() || diff > tol.atol + tol.rtol * b.abs() {
                mismatched += 1;
                if diff > max_abs_diff || diff.is_nan() {
                    max_abs_diff = diff;
                    worst = (r, c);
                }
            }
        }
    }

    if mismatched == 0 {
        CaseOutcome::Pass
    } else {
        CaseOutcome::Mismatch {
            mismatched,
            total,
            max_abs_diff,
            worst,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matrix(rows: usize, cols: usize, base: f32) -> LogitMatrix {
        (0..rows)
            .map(|r| (0..cols).map(|c| base + r as f32 + c as f32 * 0.5).collect())
            .collect()
    }

    #[test]
    fn test_identical_matrices_pass() {
        let m = matrix(3, 4, 1.0);
        assert_eq!(compare(&m, &m, Tolerance::default()), CaseOutcome::Pass);
    }

    #[test]
    fn test_within_tolerance_passes() {
        let reference = matrix(3, 4, 1.0);
        let mut computed = reference.clone();
        computed[1][2] += 5e-4;
        assert!(compare(&computed, &reference, Tolerance::default()).is_pass());
    }

    #[test]
    fn test_beyond_tolerance_fails() {
        let reference = matrix(3, 4, 1.0);
        let mut computed = reference.clone();
        computed[1][2] += 1.0;
        match compare(&computed, &reference, Tolerance::default()) {
            CaseOutcome::Mismatch {
                mismatched,
                total,
                worst,
                ..
            } => {
                assert_eq!(mismatched, 1);
                assert_eq!(total, 12);
                assert_eq!(worst, (1, 2));
            }
            other => panic!("expected mismatch, got {other:?}"),
        }
    }

    #[test]
    fn test_shape_mismatch_ignores_tolerance() {
        let huge = Tolerance {
            atol: f32::MAX,
            rtol: f32::MAX,
        };
        let a = matrix(3, 4, 0.0);
        let b = matrix(3, 5, 0.0);
        assert!(matches!(
            compare(&a, &b, huge),
            CaseOutcome::ShapeMismatch { .. }
        ));
        let c = matrix(2, 4, 0.0);
        assert!(matches!(
            compare(&a, &c, huge),
            CaseOutcome::ShapeMismatch { .. }
        ));
    }

    #[test]
    fn test_ragged_row_is_shape_mismatch() {
        let reference = matrix(3, 4, 0.0);
        let mut computed = matrix(3, 4, 0.0);
        computed[2].pop();
        assert!(matches!(
            compare(&computed, &reference, Tolerance::default()),
            CaseOutcome::ShapeMismatch { .. }
        ));
    }

    #[test]
    fn test_nan_fails() {
        let reference = matrix(2, 2, 0.0);
        let mut computed = reference.clone();
        computed[0][0] = f32::NAN;
        assert!(!compare(&computed, &reference, Tolerance::default()).is_pass());
    }

    #[test]
    fn test_relative_tolerance_scales_with_magnitude() {
        let reference = vec![vec![1000.0f32]];
        let computed = vec![vec![1005.0f32]];
        // 0.5% off on a large value: inside rtol=1e-2, outside atol alone
        assert!(compare(&computed, &reference, Tolerance::default()).is_pass());
        let tight = Tolerance {
            atol: 1e-3,
            rtol: 1e-4,
        };
        assert!(!compare(&computed, &reference, tight).is_pass());
    }
}
