//! Field layout transformation between host and device.
//!
//! Host layout is element-major: `[element][level][slot]`. Device layout is
//! element-minor: `[level][slot][element]`, so neighboring threads (one per
//! element) touch neighboring addresses. Dense fields have one slot,
//! vertical-only fields one element, 2D fields one level.

use rayon::prelude::*;

use crate::diagnostic::Diagnostic;
use crate::ir::{FieldDims, Horizontal};

/// Extents of one field buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FieldShape {
    pub k_size: usize,
    pub num_elements: usize,
    pub sparse_size: usize,
}

impl FieldShape {
    pub fn vertical(k_size: usize) -> Self {
        Self {
            k_size,
            num_elements: 1,
            sparse_size: 1,
        }
    }

    pub fn dense(k_size: usize, num_elements: usize) -> Self {
        Self {
            k_size,
            num_elements,
            sparse_size: 1,
        }
    }

    pub fn sparse(k_size: usize, num_elements: usize, sparse_size: usize) -> Self {
        Self {
            k_size,
            num_elements,
            sparse_size,
        }
    }

    /// Shape of a field with the given dims. `stride` is the element stride
    /// of the field's dense kind (ignored for vertical-only fields).
    pub fn of(dims: &FieldDims, stride: usize, k_size: usize) -> Self {
        let levels = if dims.vertical { k_size } else { 1 };
        match &dims.horizontal {
            None => Self::vertical(k_size),
            Some(Horizontal::Dense(_)) => Self::dense(levels, stride),
            Some(h @ Horizontal::Sparse(_)) => Self::sparse(levels, stride, h.sparse_size()),
        }
    }

    pub fn len(&self) -> usize {
        self.k_size * self.num_elements * self.sparse_size
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn host_index(&self, elem: usize, k: usize, slot: usize) -> usize {
        elem * self.k_size * self.sparse_size + k * self.sparse_size + slot
    }

    pub fn device_index(&self, elem: usize, k: usize, slot: usize) -> usize {
        k * self.num_elements * self.sparse_size + slot * self.num_elements + elem
    }

    fn check(&self, what: &str, len: usize) -> Result<(), Diagnostic> {
        if len != self.len() {
            return Err(Diagnostic::error(format!(
                "{} buffer has {} values, shape {}x{}x{} needs {}",
                what,
                len,
                self.num_elements,
                self.k_size,
                self.sparse_size,
                self.len()
            )));
        }
        Ok(())
    }
}

/// Host layout → device layout.
pub fn reshape(input: &[f64], shape: FieldShape) -> Result<Vec<f64>, Diagnostic> {
    let mut output = vec![0.0; shape.len()];
    reshape_into(input, &mut output, shape)?;
    Ok(output)
}

pub fn reshape_into(input: &[f64], output: &mut [f64], shape: FieldShape) -> Result<(), Diagnostic> {
    shape.check("input", input.len())?;
    shape.check("output", output.len())?;
    if shape.is_empty() {
        return Ok(());
    }
    let s = shape.sparse_size;
    // one output row per (level, slot)
    output
        .par_chunks_mut(shape.num_elements)
        .enumerate()
        .for_each(|(row, out)| {
            let (k, slot) = (row / s, row % s);
            for (elem, value) in out.iter_mut().enumerate() {
                *value = input[shape.host_index(elem, k, slot)];
            }
        });
    Ok(())
}

/// Device layout → host layout. Exact inverse of [`reshape`].
pub fn reshape_back(input: &[f64], shape: FieldShape) -> Result<Vec<f64>, Diagnostic> {
    let mut output = vec![0.0; shape.len()];
    reshape_back_into(input, &mut output, shape)?;
    Ok(output)
}

pub fn reshape_back_into(
    input: &[f64],
    output: &mut [f64],
    shape: FieldShape,
) -> Result<(), Diagnostic> {
    shape.check("input", input.len())?;
    shape.check("output", output.len())?;
    if shape.is_empty() {
        return Ok(());
    }
    let s = shape.sparse_size;
    // one output chunk per element
    output
        .par_chunks_mut(shape.k_size * s)
        .enumerate()
        .for_each(|(elem, out)| {
            for k in 0..shape.k_size {
                for slot in 0..s {
                    out[k * s + slot] = input[shape.device_index(elem, k, slot)];
                }
            }
        });
    Ok(())
}
