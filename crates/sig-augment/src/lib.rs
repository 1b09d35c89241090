//! sig-augment: extension trait that wraps Candle ops for graded tensor algebra.
//!
//! A grade-`k` term of a batch of truncated tensor-algebra elements is stored
//! flat as `[B, C^k]`. The three operations here are the only ways the core
//! kernels combine two such flats: the batched outer product (which raises the
//! grade) and the two contractions that undo it in the backward passes.

use anyhow::Result;
use candle_core::Tensor;

pub trait TensorAlgebraExt {
    /// Batched outer product of `self: [B, M]` and `rhs: [B, N]`, flattened to
    /// `[B, M*N]` with `self` on the slow axis: `out[b, m*N + n] = self[b, m] * rhs[b, n]`.
    fn outer(&self, rhs: &Tensor) -> Result<Tensor>;

    /// Contract `self: [B, M*N]` against `lhs: [B, M]` over the slow axis,
    /// returning `[B, N]` with `out[b, n] = sum_m lhs[b, m] * self[b, m*N + n]`.
    fn contract_left(&self, lhs: &Tensor) -> Result<Tensor>;

    /// Contract `self: [B, M*N]` against `rhs: [B, N]` over the fast axis,
    /// returning `[B, M]` with `out[b, m] = sum_n self[b, m*N + n] * rhs[b, n]`.
    fn contract_right(&self, rhs: &Tensor) -> Result<Tensor>;
}

impl TensorAlgebraExt for Tensor {
    fn outer(&self, rhs: &Tensor) -> Result<Tensor> {
        let (batch, m) = self.dims2()?;
        let (rhs_batch, n) = rhs.dims2()?;
        anyhow::ensure!(batch == rhs_batch, "outer: batch mismatch {batch} != {rhs_batch}");
        let product = self.unsqueeze(2)?.broadcast_mul(&rhs.unsqueeze(1)?)?; // [B, M, N]
        Ok(product.reshape((batch, m * n))?)
    }

    fn contract_left(&self, lhs: &Tensor) -> Result<Tensor> {
        let (batch, width) = self.dims2()?;
        let (lhs_batch, m) = lhs.dims2()?;
        anyhow::ensure!(batch == lhs_batch, "contract_left: batch mismatch {batch} != {lhs_batch}");
        anyhow::ensure!(
            m > 0 && width % m == 0,
            "contract_left: width {width} not divisible by {m}"
        );
        let grouped = self.reshape((batch, m, width / m))?;
        Ok(lhs.unsqueeze(1)?.matmul(&grouped)?.squeeze(1)?)
    }

    fn contract_right(&self, rhs: &Tensor) -> Result<Tensor> {
        let (batch, width) = self.dims2()?;
        let (rhs_batch, n) = rhs.dims2()?;
        anyhow::ensure!(batch == rhs_batch, "contract_right: batch mismatch {batch} != {rhs_batch}");
        anyhow::ensure!(
            n > 0 && width % n == 0,
            "contract_right: width {width} not divisible by {n}"
        );
        let grouped = self.reshape((batch, width / n, n))?;
        Ok(grouped.matmul(&rhs.unsqueeze(2)?)?.squeeze(2)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn t2(data: &[f64], shape: (usize, usize)) -> Result<Tensor> {
        Ok(Tensor::from_slice(data, shape, &Device::Cpu)?)
    }

    #[test]
    fn outer_flattens_slow_fast() -> Result<()> {
        let a = t2(&[1.0, 2.0], (1, 2))?;
        let b = t2(&[3.0, 4.0, 5.0], (1, 3))?;
        let out = a.outer(&b)?;
        assert_eq!(out.dims(), &[1, 6]);
        assert_eq!(out.to_vec2::<f64>()?[0], vec![3.0, 4.0, 5.0, 6.0, 8.0, 10.0]);
        Ok(())
    }

    #[test]
    fn contractions_invert_outer() -> Result<()> {
        let a = t2(&[1.0, -2.0], (1, 2))?;
        let b = t2(&[0.5, 3.0], (1, 2))?;
        let flat = a.outer(&b)?;
        // sum_m a[m] * (a[m] * b[n]) = |a|^2 * b[n]
        let left = flat.contract_left(&a)?;
        assert_eq!(left.to_vec2::<f64>()?[0], vec![2.5, 15.0]);
        // sum_n (a[m] * b[n]) * b[n] = a[m] * |b|^2
        let right = flat.contract_right(&b)?;
        assert_eq!(right.to_vec2::<f64>()?[0], vec![9.25, -18.5]);
        Ok(())
    }

    #[test]
    fn outer_batch_mismatch_errors() -> Result<()> {
        let a = t2(&[1.0, 2.0], (2, 1))?;
        let b = t2(&[1.0, 2.0, 3.0], (3, 1))?;
        let err = a.outer(&b).unwrap_err();
        assert!(format!("{err}").contains("batch mismatch"));
        Ok(())
    }
}
