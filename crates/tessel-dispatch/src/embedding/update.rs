//! In-place row overwrite of packed tables, float or quantized.

use half::{bf16, f16};
use tessel_core::{DType, Element, Tensor};
use tracing::debug;

use super::quantized::{quantized_geometry, sparse_types};
use super::{index_values, non_negative, QuantizedOptions, TableGeometry};
use crate::error::{invalid, Result};
use crate::validate;

/// Overwrite rows of packed tables with absolute values.
///
/// Update `i` writes `update_weights[update_offsets[i]..update_offsets[i + 1]]`
/// (exactly `D_t` values, same dtype as `weights`) into row
/// `update_row_idx[i]` of table `update_table_idx[i]`. Re-applying the same
/// update is a no-op. Everything is validated before the first write.
#[allow(clippy::too_many_arguments)]
pub fn embedding_inplace_update(
    weights: &mut Tensor,
    weights_offsets: &Tensor,
    d_offsets: &Tensor,
    update_weights: &Tensor,
    update_table_idx: &Tensor,
    update_row_idx: &Tensor,
    update_offsets: &Tensor,
) -> Result<()> {
    validate::same_device(&[
        ("weights", &*weights),
        ("weights_offsets", weights_offsets),
        ("d_offsets", d_offsets),
        ("update_weights", update_weights),
        ("update_table_idx", update_table_idx),
        ("update_row_idx", update_row_idx),
        ("update_offsets", update_offsets),
    ])?;
    if !matches!(weights.dtype(), DType::F32 | DType::F16 | DType::BF16) {
        return invalid!("weights must be f32, f16 or bf16, got {}", weights.dtype());
    }
    validate::contiguous("weights", weights)?;
    validate::operand("update_weights", update_weights, weights.dtype())?;
    let geometry = TableGeometry::from_tensors(weights, weights_offsets, d_offsets)?;

    let plan = update_plan(
        &geometry,
        |t| geometry.dims[t],
        update_weights.numel(),
        update_table_idx,
        update_row_idx,
        update_offsets,
    )?;

    match weights.dtype() {
        DType::F32 => apply::<f32>(weights, update_weights, &plan)?,
        DType::F16 => apply::<f16>(weights, update_weights, &plan)?,
        _ => apply::<bf16>(weights, update_weights, &plan)?,
    }
    debug!(updates = plan.len(), "embedding rows updated");
    Ok(())
}

/// Overwrite rows of quantized tables with pre-encoded rows.
///
/// Same contract as [`embedding_inplace_update`] over a U8 buffer: each
/// update supplies exactly one padded row of its table's format (see
/// `SparseType::padded_row_bytes`), and offsets count bytes.
#[allow(clippy::too_many_arguments)]
pub fn int_nbit_embedding_inplace_update(
    weights: &mut Tensor,
    weights_offsets: &Tensor,
    weights_tys: &Tensor,
    d_offsets: &Tensor,
    update_weights: &Tensor,
    update_table_idx: &Tensor,
    update_row_idx: &Tensor,
    update_offsets: &Tensor,
    options: &QuantizedOptions,
) -> Result<()> {
    validate::same_device(&[
        ("weights", &*weights),
        ("weights_offsets", weights_offsets),
        ("weights_tys", weights_tys),
        ("d_offsets", d_offsets),
        ("update_weights", update_weights),
        ("update_table_idx", update_table_idx),
        ("update_row_idx", update_row_idx),
        ("update_offsets", update_offsets),
    ])?;
    validate::operand("update_weights", update_weights, DType::U8)?;
    let types = sparse_types(weights_tys)?;
    let d_offsets = validate::descriptor("d_offsets", d_offsets, DType::I32)?;
    let geometry = quantized_geometry(
        weights,
        weights_offsets,
        &types,
        non_negative("d_offsets", &d_offsets)?,
        options,
    )?;
    let plan = update_plan(
        &geometry,
        |t| geometry.strides[t],
        update_weights.numel(),
        update_table_idx,
        update_row_idx,
        update_offsets,
    )?;
    apply::<u8>(weights, update_weights, &plan)?;
    debug!(updates = plan.len(), "quantized embedding rows updated");
    Ok(())
}

/// Validate every update and return `(destination, source, len)` ranges.
/// Update `i` must supply exactly `row_len(t)` elements.
fn update_plan(
    geometry: &TableGeometry,
    row_len: impl Fn(usize) -> usize,
    available: usize,
    update_table_idx: &Tensor,
    update_row_idx: &Tensor,
    update_offsets: &Tensor,
) -> Result<Vec<(usize, usize, usize)>> {
    let tables = index_values("update_table_idx", update_table_idx)?;
    let rows = index_values("update_row_idx", update_row_idx)?;
    let offsets = index_values("update_offsets", update_offsets)?;
    let n = tables.len();
    if rows.len() != n || offsets.len() != n + 1 {
        return invalid!(
            "{n} updates need {n} row indices and {} offsets, got {} and {}",
            n + 1,
            rows.len(),
            offsets.len()
        );
    }

    let mut plan = Vec::with_capacity(n);
    for i in 0..n {
        let t = match usize::try_from(tables[i]) {
            Ok(t) if t < geometry.tables() => t,
            _ => return invalid!("update {i}: table {} out of range", tables[i]),
        };
        let dst = geometry.row_start(t, rows[i])?;
        let (start, end) = (offsets[i], offsets[i + 1]);
        let len = row_len(t) as i64;
        if start < 0 || end - start != len || end as usize > available {
            return invalid!(
                "update {i}: source range {start}..{end} must hold {len} values within {available}"
            );
        }
        plan.push((dst, start as usize, len as usize));
    }
    Ok(plan)
}

fn apply<T: Element>(
    weights: &mut Tensor,
    updates: &Tensor,
    plan: &[(usize, usize, usize)],
) -> Result<()> {
    let src = updates.as_slice::<T>()?;
    let dst = weights.as_slice_mut::<T>()?;
    for &(to, from, len) in plan {
        dst[to..to + len].copy_from_slice(&src[from..from + len]);
    }
    Ok(())
}
