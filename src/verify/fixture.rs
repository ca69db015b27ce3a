//! Binary test-vector parsing
//!
//! Fixture layout (all fields little-endian, matching the reference fixture
//! files bit-for-bit):
//!
//! ```text
//! i32 n_rows     number of time steps
//! i32 n_levels   codebook levels per time step, always 8
//! i32 n_vocab    vocabulary size of the ground-truth logits
//! i32 codes[n_rows * n_levels]    input grid, row-major
//! f32 logits[n_rows * n_vocab]    ground-truth logits, row-major
//! ```
//!
//! The declared dimensions must account for the file length exactly; anything
//! else is treated as a corrupt fixture and aborts that case.

use anyhow::{bail, ensure, Context, Result};
use std::path::Path;

use crate::{CodebookMatrix, LogitMatrix};

/// Codebook levels every fixture carries.
pub const FIXTURE_LEVELS: usize = 8;

const HEADER_BYTES: usize = 3 * 4;

/// Parsed fixture: an input grid and the reference logits it should produce.
#[derive(Debug)]
pub struct TestVector {
    pub codes: CodebookMatrix,
    pub logits: LogitMatrix,
}

fn read_i32(bytes: &[u8], offset: usize) -> i32 {
    i32::from_le_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}

fn read_f32(bytes: &[u8], offset: usize) -> f32 {
    f32::from_le_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}

/// Load and validate one fixture file.
pub fn load_test_vector<P: AsRef<Path>>(path: P) -> Result<TestVector> {
    let path = path.as_ref();
    let bytes = std::fs::read(path)
        .with_context(|| format!("Failed to read fixture {}", path.display()))?;

    ensure!(
        bytes.len() >= HEADER_BYTES,
        "fixture {} truncated: {} bytes, header needs {}",
        path.display(),
        bytes.len(),
        HEADER_BYTES
    );

    let n_rows = read_i32(&bytes, 0);
    let n_levels = read_i32(&bytes, 4);
    let n_vocab = read_i32(&bytes, 8);

    ensure!(n_rows > 0, "fixture {} declares {} rows", path.display(), n_rows);
    ensure!(
        n_levels as usize == FIXTURE_LEVELS,
        "fixture {} declares {} levels, expected {}",
        path.display(),
        n_levels,
        FIXTURE_LEVELS
    );
    ensure!(n_vocab > 0, "fixture {} declares vocabulary {}", path.display(), n_vocab);

    let rows = n_rows as usize;
    let vocab = n_vocab as usize;
    let expected = HEADER_BYTES + rows * FIXTURE_LEVELS * 4 + rows * vocab * 4;
    ensure!(
        bytes.len() == expected,
        "fixture {} length mismatch: declared dimensions need {} bytes, file has {}",
        path.display(),
        expected,
        bytes.len()
    );

    let mut offset = HEADER_BYTES;
    let mut codes: CodebookMatrix = Vec::with_capacity(rows);
    for t in 0..rows {
        let mut row = Vec::with_capacity(FIXTURE_LEVELS);
        for _ in 0..FIXTURE_LEVELS {
            let code = read_i32(&bytes, offset);
            offset += 4;
            if code < 0 {
                bail!("fixture {} has negative code {} at step {}", path.display(), code, t);
            }
            row.push(code as u32);
        }
        codes.push(row);
    }

    let mut logits: LogitMatrix = Vec::with_capacity(rows);
    for _ in 0..rows {
        let mut row = Vec::with_capacity(vocab);
        for _ in 0..vocab {
            row.push(read_f32(&bytes, offset));
            offset += 4;
        }
        logits.push(row);
    }

    Ok(TestVector { codes, logits })
}

/// Serialize a grid and its reference logits in the fixture layout.
///
/// Used by the test suite and by fixture-regeneration tooling; the harness
/// itself only reads fixtures.
pub fn encode_test_vector(codes: &CodebookMatrix, logits: &LogitMatrix) -> Vec<u8> {
    let rows = codes.len();
    let vocab = logits.first().map_or(0, |row| row.len());

    let mut bytes = Vec::with_capacity(HEADER_BYTES + rows * (FIXTURE_LEVELS + vocab) * 4);
    bytes.extend_from_slice(&(rows as i32).to_le_bytes());
    bytes.extend_from_slice(&(FIXTURE_LEVELS as i32).to_le_bytes());
    bytes.extend_from_slice(&(vocab as i32).to_le_bytes());
    for row in codes {
        for &code in row {
            bytes.extend_from_slice(&(code as i32).to_le_bytes());
        }
    }
    for row in logits {
        for &logit in row {
            bytes.extend_from_slice(&logit.to_le_bytes());
        }
    }
    bytes
}
