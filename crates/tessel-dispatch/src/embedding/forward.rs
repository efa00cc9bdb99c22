//! Pooled and unpooled embedding lookups.

use half::{bf16, f16};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tessel_core::{DType, Element, Tensor};
use tracing::debug;

use super::{sample_weights, Lookup, TableGeometry};
use crate::error::{invalid, Result};
use crate::validate;

/// Reduction applied to each bag.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolingMode {
    #[default]
    Sum,
    /// Sum divided by the bag size. Not applied with per-sample weights.
    Mean,
}

/// Float weights resolved against an index batch.
fn float_lookup(
    weights: &Tensor,
    weights_offsets: &Tensor,
    d_offsets: &Tensor,
    indices: &Tensor,
    offsets: &Tensor,
) -> Result<Lookup> {
    if !matches!(weights.dtype(), DType::F32 | DType::F16 | DType::BF16) {
        return invalid!("weights must be f32, f16 or bf16, got {}", weights.dtype());
    }
    validate::contiguous("weights", weights)?;
    let geometry = TableGeometry::from_tensors(weights, weights_offsets, d_offsets)?;
    Lookup::resolve(geometry, indices, offsets)
}

/// Pooled lookup: output F32 `[B, total_D]`, where row `b` concatenates
/// every table's pooled bag `b`.
#[allow(clippy::too_many_arguments)]
pub fn split_embedding_forward(
    weights: &Tensor,
    weights_offsets: &Tensor,
    d_offsets: &Tensor,
    indices: &Tensor,
    offsets: &Tensor,
    pooling: PoolingMode,
    per_sample_weights: Option<&Tensor>,
) -> Result<Tensor> {
    let mut on_device = vec![
        ("weights", weights),
        ("weights_offsets", weights_offsets),
        ("d_offsets", d_offsets),
        ("indices", indices),
        ("offsets", offsets),
    ];
    on_device.extend(per_sample_weights.map(|t| ("per_sample_weights", t)));
    let device = validate::same_device(&on_device)?;
    let lookup = float_lookup(weights, weights_offsets, d_offsets, indices, offsets)?;
    let psw = sample_weights(per_sample_weights, lookup.indices.len())?;

    let total_d = lookup.geometry.total_dim();
    let mut out = vec![0.0f32; lookup.batch * total_d];
    match weights.dtype() {
        DType::F32 => pool(weights.as_slice::<f32>()?, &lookup, pooling, psw, &mut out),
        DType::F16 => pool(weights.as_slice::<f16>()?, &lookup, pooling, psw, &mut out),
        _ => pool(weights.as_slice::<bf16>()?, &lookup, pooling, psw, &mut out),
    }
    debug!(
        tables = lookup.geometry.tables(),
        batch = lookup.batch,
        indices = lookup.indices.len(),
        ?pooling,
        weighted = psw.is_some(),
        "embedding forward"
    );
    Ok(Tensor::from_slice(&out, &[lookup.batch, total_d])?.to_device(device))
}

fn pool<T: Element>(
    weights: &[T],
    lookup: &Lookup,
    pooling: PoolingMode,
    psw: Option<&[f32]>,
    out: &mut [f32],
) {
    let geo = &lookup.geometry;
    let total_d = geo.total_dim().max(1);
    out.par_chunks_mut(total_d).enumerate().for_each(|(b, row)| {
        for t in 0..geo.tables() {
            let bag = lookup.bag(t, b);
            let (start, end) = (bag.start, bag.end);
            let d = geo.dims[t];
            let dst = &mut row[geo.d_offsets[t]..geo.d_offsets[t] + d];
            for p in start..end {
                let Some(row_start) = lookup.row_starts[p] else {
                    continue;
                };
                let w = psw.map_or(1.0, |psw| psw[p]);
                let src = &weights[row_start..row_start + d];
                for (o, &v) in dst.iter_mut().zip(src) {
                    *o += w * T::to_f32(v);
                }
            }
            if pooling == PoolingMode::Mean && psw.is_none() && end > start {
                let inv = 1.0 / (end - start) as f32;
                dst.iter_mut().for_each(|o| *o *= inv);
            }
        }
    });
}

/// Unpooled lookup: one output row per index, F32 `[total_L, D]`. Every
/// table must share the same row width.
pub fn split_embedding_nobag_forward(
    weights: &Tensor,
    weights_offsets: &Tensor,
    d_offsets: &Tensor,
    indices: &Tensor,
    offsets: &Tensor,
) -> Result<Tensor> {
    let device = validate::same_device(&[
        ("weights", weights),
        ("weights_offsets", weights_offsets),
        ("d_offsets", d_offsets),
        ("indices", indices),
        ("offsets", offsets),
    ])?;
    let lookup = float_lookup(weights, weights_offsets, d_offsets, indices, offsets)?;
    let d = lookup.geometry.dims[0];
    if lookup.geometry.dims.iter().any(|&dt| dt != d) {
        return invalid!("unpooled lookup needs one row width, got {:?}", lookup.geometry.dims);
    }
    let total_l = lookup.total_len();

    let mut out = vec![0.0f32; total_l * d];
    match weights.dtype() {
        DType::F32 => gather(weights.as_slice::<f32>()?, &lookup, d, &mut out),
        DType::F16 => gather(weights.as_slice::<f16>()?, &lookup, d, &mut out),
        _ => gather(weights.as_slice::<bf16>()?, &lookup, d, &mut out),
    }
    Ok(Tensor::from_slice(&out, &[total_l, d])?.to_device(device))
}

fn gather<T: Element>(weights: &[T], lookup: &Lookup, d: usize, out: &mut [f32]) {
    out.par_chunks_mut(d.max(1)).enumerate().for_each(|(p, row)| {
        let Some(row_start) = lookup.row_starts[p] else {
            return;
        };
        let src = &weights[row_start..row_start + d];
        for (o, &v) in row.iter_mut().zip(src) {
            *o = T::to_f32(v);
        }
    });
}

/// Gradient of a weighted Sum lookup with respect to its per-sample
/// weights: entry `p` is the dot product of the row index `p` selects with
/// the `grad_output` slice of its bag. Output F32 `[L]`.
///
/// `feature_requires_grad` (I32 `[T]`) skips tables whose entry is zero;
/// their positions, and pruned rows, get 0.
pub fn split_embedding_grad_indice_weights(
    grad_output: &Tensor,
    weights: &Tensor,
    weights_offsets: &Tensor,
    d_offsets: &Tensor,
    indices: &Tensor,
    offsets: &Tensor,
    feature_requires_grad: Option<&Tensor>,
) -> Result<Tensor> {
    let mut on_device = vec![
        ("grad_output", grad_output),
        ("weights", weights),
        ("weights_offsets", weights_offsets),
        ("d_offsets", d_offsets),
        ("indices", indices),
        ("offsets", offsets),
    ];
    on_device.extend(feature_requires_grad.map(|t| ("feature_requires_grad", t)));
    let device = validate::same_device(&on_device)?;
    let lookup = float_lookup(weights, weights_offsets, d_offsets, indices, offsets)?;
    let geo = &lookup.geometry;

    validate::operand("grad_output", grad_output, DType::F32)?;
    if grad_output.dims() != [lookup.batch, geo.total_dim()].as_slice() {
        return invalid!(
            "grad_output must be [{}, {}], got {}",
            lookup.batch,
            geo.total_dim(),
            grad_output.shape()
        );
    }
    let requires_grad = match feature_requires_grad {
        Some(t) => {
            let flags = validate::descriptor("feature_requires_grad", t, DType::I32)?;
            if flags.len() != geo.tables() {
                return invalid!(
                    "feature_requires_grad has {} entries for {} tables",
                    flags.len(),
                    geo.tables()
                );
            }
            flags.iter().map(|&f| f != 0).collect()
        }
        None => vec![true; geo.tables()],
    };

    // (table, bag) of every index position.
    let mut owner = vec![None; lookup.indices.len()];
    for t in (0..geo.tables()).filter(|&t| requires_grad[t]) {
        for b in 0..lookup.batch {
            for p in lookup.bag(t, b) {
                owner[p] = Some((t, b));
            }
        }
    }

    let grad = grad_output.as_slice::<f32>()?;
    let total_d = geo.total_dim();
    let mut out = vec![0.0f32; lookup.indices.len()];
    let dot = |p: usize| -> Result<f32> {
        let (Some((t, b)), Some(row_start)) = (owner[p], lookup.row_starts[p]) else {
            return Ok(0.0);
        };
        let g = &grad[b * total_d + geo.d_offsets[t]..][..geo.dims[t]];
        Ok(match weights.dtype() {
            DType::F32 => row_dot(&weights.as_slice::<f32>()?[row_start..], g),
            DType::F16 => row_dot(&weights.as_slice::<f16>()?[row_start..], g),
            _ => row_dot(&weights.as_slice::<bf16>()?[row_start..], g),
        })
    };
    out.par_iter_mut()
        .enumerate()
        .try_for_each(|(p, o)| -> Result<()> {
            *o = dot(p)?;
            Ok(())
        })?;
    Ok(Tensor::from_slice(&out, &[out.len()])?.to_device(device))
}

fn row_dot<T: Element>(row: &[T], grad: &[f32]) -> f32 {
    row.iter().zip(grad).map(|(&w, &g)| w.to_f32() * g).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Table 0: 3 rows of width 2, table 1: 2 rows of width 3.
    fn tables() -> (Tensor, Tensor, Tensor) {
        let weights: Vec<f32> = (0..12).map(|v| v as f32).collect();
        (
            Tensor::from_slice(&weights, &[12]).unwrap(),
            Tensor::from_slice(&[0i64, 6], &[2]).unwrap(),
            Tensor::from_slice(&[0i32, 2, 5], &[3]).unwrap(),
        )
    }

    fn idx(values: &[i64]) -> Tensor {
        Tensor::from_slice(values, &[values.len()]).unwrap()
    }

    #[test]
    fn test_sum_and_mean() {
        let (w, wo, dof) = tables();
        // B = 2: table 0 bags {0, 2}, {1}; table 1 bags {}, {0, 1}.
        let indices = idx(&[0, 2, 1, 0, 1]);
        let offsets = idx(&[0, 2, 3, 3, 5]);
        let sum = split_embedding_forward(&w, &wo, &dof, &indices, &offsets, PoolingMode::Sum, None)
            .unwrap();
        assert_eq!(sum.dims(), &[2, 5]);
        assert_eq!(
            sum.to_f32_vec().unwrap(),
            vec![4.0, 6.0, 0.0, 0.0, 0.0, 2.0, 3.0, 15.0, 17.0, 19.0]
        );
        let mean = split_embedding_forward(&w, &wo, &dof, &indices, &offsets, PoolingMode::Mean, None)
            .unwrap();
        assert_eq!(
            mean.to_f32_vec().unwrap(),
            vec![2.0, 3.0, 0.0, 0.0, 0.0, 2.0, 3.0, 7.5, 8.5, 9.5]
        );
    }

    #[test]
    fn test_weighted_mean_is_not_divided() {
        let (w, wo, dof) = tables();
        let indices = idx(&[0, 2, 0]);
        let offsets = idx(&[0, 2, 3]);
        let psw = Tensor::from_slice(&[1.0f32, 0.5, 2.0], &[3]).unwrap();
        let out = split_embedding_forward(
            &w,
            &wo,
            &dof,
            &indices,
            &offsets,
            PoolingMode::Mean,
            Some(&psw),
        )
        .unwrap();
        // 1*[0,1] + 0.5*[4,5] and 2*[6,7,8]
        assert_eq!(out.to_f32_vec().unwrap(), vec![2.0, 3.5, 12.0, 14.0, 16.0]);
    }

    #[test]
    fn test_empty_batch() {
        let (w, wo, dof) = tables();
        let out = split_embedding_forward(&w, &wo, &dof, &idx(&[]), &idx(&[0]), PoolingMode::Sum, None)
            .unwrap();
        assert_eq!(out.dims(), &[0, 5]);
    }

    #[test]
    fn test_out_of_range_row() {
        let (w, wo, dof) = tables();
        let err = split_embedding_forward(&w, &wo, &dof, &idx(&[3]), &idx(&[0, 1, 1]), PoolingMode::Sum, None)
            .unwrap_err();
        assert!(matches!(err, crate::error::DispatchError::InvalidArgument(_)));
    }

    #[test]
    fn test_bf16_weights() {
        let w = Tensor::from_f32_as(&[1.0, 2.0, 3.0, 4.0], &[4], DType::BF16).unwrap();
        let wo = Tensor::from_slice(&[0i64], &[1]).unwrap();
        let dof = Tensor::from_slice(&[0i32, 2], &[2]).unwrap();
        let ind = Tensor::from_slice(&[1i32, 0], &[2]).unwrap();
        let off = Tensor::from_slice(&[0i32, 2], &[2]).unwrap();
        let out = split_embedding_forward(&w, &wo, &dof, &ind, &off, PoolingMode::Sum, None).unwrap();
        assert_eq!(out.to_f32_vec().unwrap(), vec![4.0, 6.0]);
    }

    #[test]
    fn test_index_dtype_mismatch() {
        let (w, wo, dof) = tables();
        let ind = Tensor::from_slice(&[0i32], &[1]).unwrap();
        assert!(split_embedding_forward(&w, &wo, &dof, &ind, &idx(&[0, 1, 1]), PoolingMode::Sum, None)
            .is_err());
    }

    #[test]
    fn test_nobag_rows() {
        // Two tables of width 3.
        let weights: Vec<f32> = (0..12).map(|v| v as f32).collect();
        let w = Tensor::from_slice(&weights, &[12]).unwrap();
        let wo = Tensor::from_slice(&[0i64, 6], &[2]).unwrap();
        let dof = Tensor::from_slice(&[0i32, 3, 6], &[3]).unwrap();
        let out = split_embedding_nobag_forward(&w, &wo, &dof, &idx(&[1, 0, 1]), &idx(&[0, 2, 3]))
            .unwrap();
        assert_eq!(out.dims(), &[3, 3]);
        assert_eq!(
            out.to_f32_vec().unwrap(),
            vec![3.0, 4.0, 5.0, 0.0, 1.0, 2.0, 9.0, 10.0, 11.0]
        );
    }

    #[test]
    fn test_nobag_mixed_widths_rejected() {
        let (w, wo, dof) = tables();
        assert!(split_embedding_nobag_forward(&w, &wo, &dof, &idx(&[0]), &idx(&[0, 1, 1])).is_err());
    }

    #[test]
    fn test_grad_indice_weights() {
        let (w, wo, dof) = tables();
        // B = 1: table 0 bag {2, -1}, table 1 bag {1}.
        let indices = idx(&[2, -1, 1]);
        let offsets = idx(&[0, 2, 3]);
        let grad = Tensor::from_slice(&[1.0f32, 2.0, 1.0, 0.0, -1.0], &[1, 5]).unwrap();
        let out = split_embedding_grad_indice_weights(&grad, &w, &wo, &dof, &indices, &offsets, None)
            .unwrap();
        // [4,5]·[1,2] = 14, pruned = 0, [9,10,11]·[1,0,-1] = -2
        assert_eq!(out.to_f32_vec().unwrap(), vec![14.0, 0.0, -2.0]);

        let only_first = Tensor::from_slice(&[1i32, 0], &[2]).unwrap();
        let out = split_embedding_grad_indice_weights(
            &grad,
            &w,
            &wo,
            &dof,
            &indices,
            &offsets,
            Some(&only_first),
        )
        .unwrap();
        assert_eq!(out.to_f32_vec().unwrap(), vec![14.0, 0.0, 0.0]);

        let wrong = Tensor::from_slice(&[1.0f32; 4], &[1, 4]).unwrap();
        assert!(
            split_embedding_grad_indice_weights(&wrong, &w, &wo, &dof, &indices, &offsets, None)
                .is_err()
        );
    }

    #[test]
    fn test_pruned_rows_contribute_nothing() {
        let (w, wo, dof) = tables();
        let indices = idx(&[-1, 2, -1]);
        let offsets = idx(&[0, 2, 3]);
        let out = split_embedding_forward(&w, &wo, &dof, &indices, &offsets, PoolingMode::Mean, None)
            .unwrap();
        // Mean divides by the bag length, pruned entries included.
        assert_eq!(out.to_f32_vec().unwrap(), vec![2.0, 2.5, 0.0, 0.0, 0.0]);
    }
}
