//! Additive attention position bias for the bias-variant model
//! configuration.
//!
//! Instead of explicit position ids, each head gets a fixed negative slope
//! applied to token distance; the first stage materializes the bias tensor
//! once and it travels down the pipeline as an envelope slot.

use lamina_core::{LaminaError, Result, Tensor};

use crate::topology::Topology;

/// Per-head slopes: a geometric sequence `2^(-8(i+1)/n)` for the nearest
/// power-of-two head count, with interpolated values appended when the
/// count is not a power of two.
pub fn head_slopes(num_heads: usize) -> Vec<f32> {
    fn pow2_slopes(n: usize) -> Vec<f32> {
        let start = (2.0f32).powf(-8.0 / n as f32);
        (0..n).map(|i| start.powi(i as i32 + 1)).collect()
    }

    if num_heads.is_power_of_two() {
        return pow2_slopes(num_heads);
    }

    let floor = num_heads.next_power_of_two() / 2;
    let mut slopes = pow2_slopes(floor);
    let extra = pow2_slopes(floor * 2);
    slopes.extend(extra.into_iter().step_by(2).take(num_heads - floor));
    slopes
}

/// Build the bias tensor from a boolean padding mask.
///
/// `padding_mask`: [batch, seq] where true marks a real token. Positions are
/// counted over unpadded tokens only, so left padding does not shift the
/// distances. Returns [batch, num_heads, 1, seq].
pub fn build_position_bias(padding_mask: &Tensor, num_heads: usize) -> Result<Tensor> {
    let mask = padding_mask
        .as_bool_slice()
        .ok_or(LaminaError::UnsupportedDType(padding_mask.dtype()))?;
    let dims = padding_mask.shape().dims();
    if dims.len() != 2 {
        return Err(LaminaError::ShapeMismatch {
            expected: vec![0, 0],
            got: dims.to_vec(),
        });
    }
    let (batch, seq) = (dims[0], dims[1]);

    let slopes = head_slopes(num_heads);
    let mut out = vec![0.0f32; batch * num_heads * seq];
    for b in 0..batch {
        let row = &mask[b * seq..(b + 1) * seq];
        let mut count = 0i64;
        for (j, &valid) in row.iter().enumerate() {
            let pos = if valid {
                count += 1;
                (count - 1) as f32
            } else {
                0.0
            };
            for (h, &slope) in slopes.iter().enumerate() {
                out[(b * num_heads + h) * seq + j] = slope * pos;
            }
        }
    }
    Tensor::from_f32(&out, &[batch * num_heads * seq])
        .reshape(&[batch as isize, num_heads as isize, 1, seq as isize])
}

/// Slice the head dimension by tensor-parallel rank and flatten to the
/// wire layout `(batch * heads_per_rank, 1, seq)`.
///
/// With no tensor parallelism the whole head dimension is flattened.
pub fn shard_heads(bias: &Tensor, topology: &Topology) -> Result<Tensor> {
    let dims = bias.shape().dims().to_vec();
    if dims.len() != 4 || dims[2] != 1 {
        return Err(LaminaError::ShapeMismatch {
            expected: vec![0, 0, 1, 0],
            got: dims,
        });
    }
    let (batch, heads, seq) = (dims[0], dims[1], dims[3]);

    let degree = topology.tensor_parallel_degree.max(1);
    if heads % degree != 0 {
        return Err(LaminaError::Config(format!(
            "bias head count ({heads}) not divisible by tensor_parallel_degree ({degree})"
        )));
    }
    let block = heads / degree;
    let rank = topology.tensor_parallel_rank;

    let data = bias
        .as_f32_slice()
        .ok_or(LaminaError::UnsupportedDType(bias.dtype()))?;
    let mut out = vec![0.0f32; batch * block * seq];
    for b in 0..batch {
        for h in 0..block {
            let src_h = rank * block + h;
            let src = &data[(b * heads + src_h) * seq..(b * heads + src_h + 1) * seq];
            out[(b * block + h) * seq..(b * block + h + 1) * seq].copy_from_slice(src);
        }
    }
    Ok(Tensor::from_f32(&out, &[batch * block, 1, seq]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slopes_power_of_two() {
        let slopes = head_slopes(4);
        assert_eq!(slopes.len(), 4);
        // ratio 2^(-8/4) = 1/4 between consecutive heads
        assert!((slopes[0] - 0.25).abs() < 1e-6);
        assert!((slopes[1] - 0.0625).abs() < 1e-6);
        // strictly decreasing
        assert!(slopes.windows(2).all(|w| w[0] > w[1]));
    }

    #[test]
    fn test_slopes_non_power_of_two() {
        let slopes = head_slopes(6);
        assert_eq!(slopes.len(), 6);
        assert!(slopes.iter().all(|&s| s > 0.0 && s < 1.0));
    }

    #[test]
    fn test_bias_shape_and_positions() {
        let mask = Tensor::from_bool(&[true, true, true], &[1, 3]);
        let bias = build_position_bias(&mask, 2).unwrap();
        assert_eq!(bias.shape().dims(), &[1, 2, 1, 3]);

        let slopes = head_slopes(2);
        let data = bias.as_f32_slice().unwrap();
        // head 0: slope * [0, 1, 2]
        assert!((data[0] - 0.0).abs() < 1e-6);
        assert!((data[1] - slopes[0]).abs() < 1e-6);
        assert!((data[2] - 2.0 * slopes[0]).abs() < 1e-6);
        // head 1 row starts at offset 3
        assert!((data[4] - slopes[1]).abs() < 1e-6);
    }

    #[test]
    fn test_bias_skips_padding() {
        let mask = Tensor::from_bool(&[false, true, true], &[1, 3]);
        let bias = build_position_bias(&mask, 1).unwrap();
        let data = bias.as_f32_slice().unwrap();
        assert_eq!(data[0], 0.0); // padding
        assert_eq!(data[1], 0.0); // first real token is position 0
        assert!(data[2] > 0.0);
    }

    #[test]
    fn test_shard_heads_full() {
        let mask = Tensor::from_bool(&[true, true], &[1, 2]);
        let bias = build_position_bias(&mask, 4).unwrap();
        let flat = shard_heads(&bias, &Topology::single()).unwrap();
        assert_eq!(flat.shape().dims(), &[4, 1, 2]);
    }

    #[test]
    fn test_shard_heads_by_rank() {
        let mask = Tensor::from_bool(&[true, true], &[1, 2]);
        let bias = build_position_bias(&mask, 4).unwrap();
        let slopes = head_slopes(4);

        let mut topo = Topology::single();
        topo.tensor_parallel_degree = 2;
        topo.tensor_parallel_rank = 1;
        let flat = shard_heads(&bias, &topo).unwrap();
        assert_eq!(flat.shape().dims(), &[2, 1, 2]);
        // rank 1 owns heads 2 and 3
        let data = flat.as_f32_slice().unwrap();
        assert!((data[1] - slopes[2]).abs() < 1e-6);
        assert!((data[3] - slopes[3]).abs() < 1e-6);
    }

    #[test]
    fn test_shard_rejects_ragged_split() {
        let mask = Tensor::from_bool(&[true], &[1, 1]);
        let bias = build_position_bias(&mask, 3).unwrap();
        let mut topo = Topology::single();
        topo.tensor_parallel_degree = 2;
        assert!(shard_heads(&bias, &topo).is_err());
    }
}
