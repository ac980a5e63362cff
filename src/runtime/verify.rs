//! Elementwise verification of computed fields against a reference, and
//! the binary dumps written when a dense field fails.

use std::path::{Path, PathBuf};
use std::time::Duration;

use bytemuck::{Pod, Zeroable};
use rayon::prelude::*;
use statrs::statistics::Statistics;

use crate::diagnostic::Diagnostic;

/// Combined tolerance: `|actual - reference| <= abs + rel * |reference|`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Tolerance {
    pub rel: f64,
    pub abs: f64,
}

impl Default for Tolerance {
    fn default() -> Self {
        Self {
            rel: 1e-12,
            abs: 0.0,
        }
    }
}

impl Tolerance {
    pub fn new(rel: f64, abs: f64) -> Self {
        Self { rel, abs }
    }

    /// NaN on either side never passes.
    pub fn accepts(&self, actual: f64, reference: f64) -> bool {
        (actual - reference).abs() <= self.abs + self.rel * reference.abs()
    }
}

// ─── Reports ──────────────────────────────────────────────────────

/// Outcome of comparing one field.
#[derive(Clone, Debug, PartialEq)]
pub struct FieldReport {
    pub field: String,
    pub num_values: usize,
    pub failures: usize,
    pub max_abs_error: f64,
    pub max_rel_error: f64,
    pub mean_abs_error: f64,
    pub std_dev_abs_error: f64,
}

impl FieldReport {
    /// Compare `actual` against `reference` value by value.
    pub fn compare(field: &str, actual: &[f64], reference: &[f64], tol: Tolerance) -> Self {
        let n = actual.len().min(reference.len());
        let errors: Vec<(f64, f64, bool)> = actual[..n]
            .par_iter()
            .zip(reference[..n].par_iter())
            .map(|(a, r)| {
                let abs = (a - r).abs();
                let rel = if *r != 0.0 { abs / r.abs() } else { abs };
                (abs, rel, tol.accepts(*a, *r))
            })
            .collect();

        // values present on only one side count as failures
        let failures = errors.iter().filter(|(_, _, ok)| !ok).count()
            + actual.len().abs_diff(reference.len());
        let abs_errors: Vec<f64> = errors.iter().map(|(abs, _, _)| *abs).collect();
        let max_abs_error = abs_errors.iter().copied().fold(0.0, f64::max);
        let max_rel_error = errors.iter().map(|(_, rel, _)| *rel).fold(0.0, f64::max);
        let (mean_abs_error, std_dev_abs_error) = match abs_errors.len() {
            0 => (0.0, 0.0),
            1 => (abs_errors[0], 0.0),
            _ => (abs_errors.iter().mean(), abs_errors.iter().std_dev()),
        };
        Self {
            field: field.to_string(),
            num_values: n,
            failures,
            max_abs_error,
            max_rel_error,
            mean_abs_error,
            std_dev_abs_error,
        }
    }

    pub fn passed(&self) -> bool {
        self.failures == 0
    }

    /// One-line summary for failing fields.
    pub fn summary(&self) -> String {
        format!(
            "{}: {} of {} values out of tolerance (max abs {:e}, max rel {:e}, mean abs {:e} ± {:e})",
            self.field,
            self.failures,
            self.num_values,
            self.max_abs_error,
            self.max_rel_error,
            self.mean_abs_error,
            self.std_dev_abs_error
        )
    }
}

/// Outcome of one `verify` call.
#[derive(Clone, Debug, PartialEq)]
pub struct VerifyReport {
    pub fields: Vec<FieldReport>,
    pub elapsed: Duration,
}

impl VerifyReport {
    /// Every field passed entirely.
    pub fn passed(&self) -> bool {
        self.fields.iter().all(FieldReport::passed)
    }

    pub fn field(&self, name: &str) -> Option<&FieldReport> {
        self.fields.iter().find(|f| f.field == name)
    }
}

// ─── Dumps ────────────────────────────────────────────────────────

pub const DUMP_MAGIC: [u8; 8] = *b"ICODUMP1";

/// Header of a dense field dump; the values follow as little-endian `f64`
/// in device layout.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Pod, Zeroable)]
pub struct DumpHeader {
    pub magic: [u8; 8],
    pub iteration: u32,
    pub k_size: u32,
    pub num_elements: u32,
    pub stride: u32,
}

/// `{dir}/{stencil}_{tag}_{iteration}.bin`
pub fn dump_path(dir: &Path, stencil: &str, tag: &str, iteration: u32) -> PathBuf {
    dir.join(format!("{}_{}_{}.bin", stencil, tag, iteration))
}

/// Write one dense field dump.
pub fn serialize_dense(
    dir: &Path,
    stencil: &str,
    tag: &str,
    header: DumpHeader,
    values: &[f64],
) -> Result<PathBuf, Diagnostic> {
    std::fs::create_dir_all(dir).map_err(|e| Diagnostic::write_failed(dir, &e))?;
    let path = dump_path(dir, stencil, tag, header.iteration);
    let mut bytes = Vec::with_capacity(std::mem::size_of::<DumpHeader>() + values.len() * 8);
    bytes.extend_from_slice(bytemuck::bytes_of(&header));
    for v in values {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    std::fs::write(&path, bytes).map_err(|e| Diagnostic::write_failed(&path, &e))?;
    Ok(path)
}

/// Read a dump written by [`serialize_dense`].
pub fn read_dump(path: &Path) -> Result<(DumpHeader, Vec<f64>), Diagnostic> {
    let bytes = std::fs::read(path).map_err(|e| Diagnostic::read_failed(path, &e))?;
    let head = std::mem::size_of::<DumpHeader>();
    if bytes.len() < head || (bytes.len() - head) % 8 != 0 {
        return Err(Diagnostic::error(format!(
            "'{}' is not a field dump ({} bytes)",
            path.display(),
            bytes.len()
        )));
    }
    let header: DumpHeader = bytemuck::pod_read_unaligned(&bytes[..head]);
    if header.magic != DUMP_MAGIC {
        return Err(Diagnostic::error(format!(
            "'{}' is not a field dump (bad magic)",
            path.display()
        )));
    }
    let values = bytes[head..]
        .chunks_exact(8)
        .map(|c| f64::from_le_bytes(bytemuck::pod_read_unaligned::<[u8; 8]>(c)))
        .collect();
    Ok((header, values))
}
