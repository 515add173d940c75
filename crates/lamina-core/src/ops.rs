//! Reference operations used by pipeline stages and tests.
//!
//! Deliberately naive loops: the optimized elementwise/matmul kernels inside
//! each layer are an external collaborator of the pipeline core. What matters
//! here is determinism — recompute replay must reproduce the original
//! forward bit for bit, and these ops are pure functions of their inputs.

use crate::dtype::DType;
use crate::error::LaminaError;
use crate::tensor::Tensor;
use crate::Result;

impl Tensor {
    /// Element-wise addition: self + other.
    pub fn add(&self, other: &Tensor) -> Result<Tensor> {
        binary_op(self, other, |a, b| a + b)
    }

    /// Element-wise subtraction: self - other.
    pub fn sub(&self, other: &Tensor) -> Result<Tensor> {
        binary_op(self, other, |a, b| a - b)
    }

    /// Element-wise multiplication: self * other.
    pub fn mul(&self, other: &Tensor) -> Result<Tensor> {
        binary_op(self, other, |a, b| a * b)
    }

    /// Multiply every element by a scalar.
    pub fn scale(&self, factor: f32) -> Result<Tensor> {
        unary_op(self, |a| a * factor)
    }

    /// Element-wise hyperbolic tangent.
    pub fn tanh(&self) -> Result<Tensor> {
        unary_op(self, |a| a.tanh())
    }

    /// 2-D matrix multiply: [m, k] × [k, n] → [m, n].
    pub fn matmul2d(&self, other: &Tensor) -> Result<Tensor> {
        let a = self
            .as_f32_slice()
            .ok_or(LaminaError::UnsupportedDType(self.dtype()))?;
        let b = other
            .as_f32_slice()
            .ok_or(LaminaError::UnsupportedDType(other.dtype()))?;

        let a_dims = self.shape().dims();
        let b_dims = other.shape().dims();
        if a_dims.len() != 2 || b_dims.len() != 2 || a_dims[1] != b_dims[0] {
            return Err(LaminaError::ShapeMismatch {
                expected: vec![a_dims.first().copied().unwrap_or(0), b_dims.first().copied().unwrap_or(0)],
                got: b_dims.to_vec(),
            });
        }

        let (m, k, n) = (a_dims[0], a_dims[1], b_dims[1]);
        let mut out = vec![0.0f32; m * n];
        for i in 0..m {
            for p in 0..k {
                let av = a[i * k + p];
                for j in 0..n {
                    out[i * n + j] += av * b[p * n + j];
                }
            }
        }
        Ok(Tensor::from_f32(&out, &[m, n]))
    }

    /// RMS normalization over the last dimension, with per-feature gain.
    ///
    /// `self`: [rows, dim], `gain`: [dim].
    pub fn rms_norm(&self, gain: &Tensor, eps: f32) -> Result<Tensor> {
        let x = self
            .as_f32_slice()
            .ok_or(LaminaError::UnsupportedDType(self.dtype()))?;
        let g = gain
            .as_f32_slice()
            .ok_or(LaminaError::UnsupportedDType(gain.dtype()))?;

        let dims = self.shape().dims();
        let dim = *dims.last().ok_or_else(|| LaminaError::ShapeMismatch {
            expected: vec![g.len()],
            got: vec![],
        })?;
        if dim != g.len() {
            return Err(LaminaError::ShapeMismatch {
                expected: vec![g.len()],
                got: vec![dim],
            });
        }

        let rows = self.numel() / dim;
        let mut out = vec![0.0f32; self.numel()];
        for r in 0..rows {
            let row = &x[r * dim..(r + 1) * dim];
            let mean_sq = row.iter().map(|v| v * v).sum::<f32>() / dim as f32;
            let inv = 1.0 / (mean_sq + eps).sqrt();
            for (j, &v) in row.iter().enumerate() {
                out[r * dim + j] = v * inv * g[j];
            }
        }
        Ok(Tensor::from_f32(&out, dims))
    }

    /// Log-softmax over the last dimension of a 2-D tensor.
    pub fn log_softmax_rows(&self) -> Result<Tensor> {
        let x = self
            .as_f32_slice()
            .ok_or(LaminaError::UnsupportedDType(self.dtype()))?;
        let dims = self.shape().dims();
        if dims.len() != 2 {
            return Err(LaminaError::ShapeMismatch {
                expected: vec![0, 0],
                got: dims.to_vec(),
            });
        }
        let (rows, cols) = (dims[0], dims[1]);
        let mut out = vec![0.0f32; rows * cols];
        for r in 0..rows {
            let row = &x[r * cols..(r + 1) * cols];
            let max = row.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
            let log_sum = row.iter().map(|v| (v - max).exp()).sum::<f32>().ln();
            for (j, &v) in row.iter().enumerate() {
                out[r * cols + j] = v - max - log_sum;
            }
        }
        Ok(Tensor::from_f32(&out, dims))
    }
}

fn binary_op<F: Fn(f32, f32) -> f32>(a: &Tensor, b: &Tensor, f: F) -> Result<Tensor> {
    if a.dtype() != DType::F32 {
        return Err(LaminaError::UnsupportedDType(a.dtype()));
    }
    if a.shape() != b.shape() {
        return Err(LaminaError::ShapeMismatch {
            expected: a.shape().dims().to_vec(),
            got: b.shape().dims().to_vec(),
        });
    }
    let av = a.as_f32_slice().ok_or(LaminaError::UnsupportedDType(a.dtype()))?;
    let bv = b.as_f32_slice().ok_or(LaminaError::UnsupportedDType(b.dtype()))?;
    let out: Vec<f32> = av.iter().zip(bv).map(|(&x, &y)| f(x, y)).collect();
    Ok(Tensor::from_f32(&out, a.shape().dims()))
}

fn unary_op<F: Fn(f32) -> f32>(a: &Tensor, f: F) -> Result<Tensor> {
    let av = a
        .as_f32_slice()
        .ok_or(LaminaError::UnsupportedDType(a.dtype()))?;
    let out: Vec<f32> = av.iter().map(|&x| f(x)).collect();
    Ok(Tensor::from_f32(&out, a.shape().dims()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_mul() {
        let a = Tensor::from_f32(&[1.0, 2.0], &[2]);
        let b = Tensor::from_f32(&[3.0, 4.0], &[2]);
        assert_eq!(a.add(&b).unwrap().as_f32_slice().unwrap(), &[4.0, 6.0]);
        assert_eq!(a.mul(&b).unwrap().as_f32_slice().unwrap(), &[3.0, 8.0]);
    }

    #[test]
    fn test_shape_mismatch() {
        let a = Tensor::from_f32(&[1.0, 2.0], &[2]);
        let b = Tensor::from_f32(&[1.0], &[1]);
        assert!(a.add(&b).is_err());
    }

    #[test]
    fn test_matmul2d() {
        let a = Tensor::from_f32(&[1.0, 2.0, 3.0, 4.0], &[2, 2]);
        let b = Tensor::from_f32(&[1.0, 0.0, 0.0, 1.0], &[2, 2]);
        let c = a.matmul2d(&b).unwrap();
        assert_eq!(c.as_f32_slice().unwrap(), &[1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_rms_norm_unit_gain() {
        let x = Tensor::from_f32(&[3.0, 4.0], &[1, 2]);
        let g = Tensor::from_f32(&[1.0, 1.0], &[2]);
        let y = x.rms_norm(&g, 0.0).unwrap();
        let data = y.as_f32_slice().unwrap();
        // rms = sqrt((9+16)/2) = sqrt(12.5)
        let rms = 12.5f32.sqrt();
        assert!((data[0] - 3.0 / rms).abs() < 1e-6);
        assert!((data[1] - 4.0 / rms).abs() < 1e-6);
    }

    #[test]
    fn test_log_softmax_rows() {
        let x = Tensor::from_f32(&[0.0, 0.0], &[1, 2]);
        let y = x.log_softmax_rows().unwrap();
        let data = y.as_f32_slice().unwrap();
        assert!((data[0] - (0.5f32).ln()).abs() < 1e-6);
        assert!((data[1] - (0.5f32).ln()).abs() < 1e-6);
    }

    #[test]
    fn test_determinism() {
        let a = Tensor::from_f32(&[0.3, -0.7, 1.1, 0.2], &[2, 2]);
        let b = Tensor::from_f32(&[0.5, 0.1, -0.4, 0.9], &[2, 2]);
        let first = a.matmul2d(&b).unwrap();
        let second = a.matmul2d(&b).unwrap();
        assert!(first.value_eq(&second));
    }
}
