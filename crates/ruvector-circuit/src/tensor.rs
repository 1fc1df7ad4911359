//! Tensor helpers shared by the engine and the reference model.
//!
//! Activations are laid out `[rows, seq, ...]`; per-head weights are stacked
//! along a leading head axis.

use ndarray::{
    Array, Array2, Array3, Array4, ArrayView2, ArrayView3, ArrayView4, Axis, ShapeBuilder,
};
use rand::Rng;
use rand_distr::{Distribution, Normal};

use crate::error::{CircuitError, Result};

/// Copy a `[rows, seq, a]` view into a `[rows * seq, a]` matrix.
fn flatten_positions(x: ArrayView3<'_, f32>) -> Result<Array2<f32>> {
    let (rows, seq, a) = x.dim();
    Ok(Array2::from_shape_vec((rows * seq, a), x.iter().copied().collect())?)
}

/// `[rows, seq, a] x [a, b] -> [rows, seq, b]`.
pub fn positions_matmul(x: ArrayView3<'_, f32>, w: ArrayView2<'_, f32>) -> Result<Array3<f32>> {
    let (rows, seq, a) = x.dim();
    if w.nrows() != a {
        return Err(CircuitError::shape_mismatch("matmul rhs", &[a, w.ncols()], w.shape()));
    }
    let y = flatten_positions(x)?.dot(&w);
    Ok(y.into_shape((rows, seq, w.ncols()))?)
}

/// Per-head product: `[rows, seq, H, a] x [H, a, b] -> [rows, seq, H, b]`.
pub fn heads_matmul(x: ArrayView4<'_, f32>, w: ArrayView3<'_, f32>) -> Result<Array4<f32>> {
    let (rows, seq, heads, a) = x.dim();
    let (wh, wa, b) = w.dim();
    if wh != heads || wa != a {
        return Err(CircuitError::shape_mismatch("per-head weights", &[heads, a, b], w.shape()));
    }
    let mut out = Array4::zeros((rows, seq, heads, b));
    for h in 0..heads {
        let y = positions_matmul(x.index_axis(Axis(2), h), w.index_axis(Axis(0), h))?;
        out.index_axis_mut(Axis(2), h).assign(&y);
    }
    Ok(out)
}

/// Per-head product with transposed weights:
/// `[rows, seq, H, b] x [H, a, b]^T -> [rows, seq, H, a]`.
pub fn heads_matmul_t(x: ArrayView4<'_, f32>, w: ArrayView3<'_, f32>) -> Result<Array4<f32>> {
    let (rows, seq, heads, b) = x.dim();
    let (wh, a, wb) = w.dim();
    if wh != heads || wb != b {
        return Err(CircuitError::shape_mismatch("per-head weights", &[heads, a, b], w.shape()));
    }
    let mut out = Array4::zeros((rows, seq, heads, a));
    for h in 0..heads {
        let y = positions_matmul(x.index_axis(Axis(2), h), w.index_axis(Axis(0), h).t())?;
        out.index_axis_mut(Axis(2), h).assign(&y);
    }
    Ok(out)
}

/// Xavier/Glorot normal initialization.
pub fn xavier_normal<R, Sh>(
    rng: &mut R,
    shape: Sh,
    fan_in: usize,
    fan_out: usize,
) -> Array<f32, Sh::Dim>
where
    R: Rng + ?Sized,
    Sh: ShapeBuilder,
{
    let std_dev = (2.0 / (fan_in + fan_out).max(1) as f32).sqrt();
    match Normal::new(0.0f32, std_dev) {
        Ok(normal) => Array::from_shape_simple_fn(shape, || normal.sample(rng)),
        Err(_) => Array::zeros(shape),
    }
}
