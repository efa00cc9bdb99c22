//! Table-batched embedding operators.
//!
//! Several tables live in one packed weight buffer. Table `t` starts at
//! element `weights_offsets[t]` and has row width
//! `D_t = d_offsets[t + 1] - d_offsets[t]`; its row count is whatever fits
//! before the next table (or the end of the buffer). Index batches are CSR
//! style: `offsets[t * B + b]..offsets[t * B + b + 1]` selects the indices
//! of bag `b` of table `t`. Index `-1` marks a pruned row.
//!
//! Quantized tables (see [`SparseType`]) use the same layout over a U8
//! buffer, with byte offsets and one padded byte row per embedding row.

mod forward;
mod pruned;
mod quantized;
mod update;

pub use forward::{
    split_embedding_forward, split_embedding_grad_indice_weights, split_embedding_nobag_forward,
    PoolingMode,
};
pub use pruned::{
    murmur_hash32, murmur_hash64, pruned_array_lookup, pruned_hashmap_insert,
    pruned_hashmap_lookup,
};
pub use quantized::{
    int_nbit_split_embedding_forward, int_nbit_split_embedding_nobag_forward, quantize_row,
    QuantizedOptions, SparseType,
};
pub use update::{embedding_inplace_update, int_nbit_embedding_inplace_update};

use tessel_core::{DType, Tensor};

use crate::error::{invalid, Result};
use crate::validate;

/// Index value marking a row removed by pruning.
const PRUNED: i64 = -1;

/// Validated placement of every table inside the weight buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TableGeometry {
    pub starts: Vec<usize>,
    pub dims: Vec<usize>,
    /// Buffer elements between consecutive rows of each table.
    pub strides: Vec<usize>,
    pub rows: Vec<usize>,
    /// Column offset of each table in a pooled output row.
    pub d_offsets: Vec<usize>,
}

impl TableGeometry {
    pub fn from_tensors(
        weights: &Tensor,
        weights_offsets: &Tensor,
        d_offsets: &Tensor,
    ) -> Result<Self> {
        validate::rank("weights", weights, &[1])?;
        let starts = validate::descriptor("weights_offsets", weights_offsets, DType::I64)?;
        let d_offsets = validate::descriptor("d_offsets", d_offsets, DType::I32)?;
        Self::new(
            weights.numel(),
            non_negative("weights_offsets", &starts)?,
            non_negative("d_offsets", &d_offsets)?,
        )
    }

    pub fn new(numel: usize, starts: Vec<usize>, d_offsets: Vec<usize>) -> Result<Self> {
        Self::with_row_stride(numel, starts, d_offsets, |_, d| d)
    }

    /// Like [`TableGeometry::new`], with rows of table `t` stored
    /// `row_stride(t, D_t)` elements apart.
    pub fn with_row_stride(
        numel: usize,
        starts: Vec<usize>,
        d_offsets: Vec<usize>,
        row_stride: impl Fn(usize, usize) -> usize,
    ) -> Result<Self> {
        let tables = starts.len();
        if tables == 0 {
            return invalid!("at least one table is required");
        }
        if d_offsets.len() != tables + 1 || d_offsets[0] != 0 {
            return invalid!("d_offsets must have {} entries starting at 0", tables + 1);
        }
        if d_offsets.windows(2).any(|w| w[0] > w[1]) {
            return invalid!("d_offsets must be non-decreasing");
        }
        let dims: Vec<usize> = d_offsets.windows(2).map(|w| w[1] - w[0]).collect();
        let strides: Vec<usize> = dims.iter().enumerate().map(|(t, &d)| row_stride(t, d)).collect();

        let mut rows = Vec::with_capacity(tables);
        for (t, (&start, &stride)) in starts.iter().zip(&strides).enumerate() {
            if start > numel {
                return invalid!("table {t} starts at {start} past the {numel}-element buffer");
            }
            // The table ends where the nearest later table begins.
            let end = starts
                .iter()
                .copied()
                .filter(|&s| s > start)
                .min()
                .unwrap_or(numel);
            rows.push(if stride == 0 { 0 } else { (end - start) / stride });
        }
        Ok(Self {
            starts,
            dims,
            strides,
            rows,
            d_offsets,
        })
    }

    pub fn tables(&self) -> usize {
        self.starts.len()
    }

    pub fn total_dim(&self) -> usize {
        self.d_offsets[self.tables()]
    }

    /// Element offset of `row` in table `t`, bounds checked.
    pub fn row_start(&self, t: usize, row: i64) -> Result<usize> {
        match usize::try_from(row) {
            Ok(r) if r < self.rows[t] => Ok(self.starts[t] + r * self.strides[t]),
            _ => invalid!("row {row} out of range for table {t} with {} rows", self.rows[t]),
        }
    }
}

/// Index batch resolved against a table geometry.
pub(crate) struct Lookup {
    pub geometry: TableGeometry,
    pub indices: Vec<i64>,
    pub offsets: Vec<usize>,
    pub batch: usize,
    /// Buffer offset of the row each index position selects; `None` for
    /// pruned rows, which contribute nothing.
    pub row_starts: Vec<Option<usize>>,
}

impl Lookup {
    pub fn resolve(geometry: TableGeometry, indices: &Tensor, offsets: &Tensor) -> Result<Self> {
        let idx = index_values("indices", indices)?;
        let raw_offsets = index_values("offsets", offsets)?;
        if offsets.dtype() != indices.dtype() {
            return invalid!(
                "indices are {} but offsets are {}",
                indices.dtype(),
                offsets.dtype()
            );
        }
        let tables = geometry.tables();
        let (batch, offs) = bag_offsets(&raw_offsets, tables, idx.len())?;

        let mut row_starts = vec![None; idx.len()];
        for t in 0..tables {
            for p in offs[t * batch]..offs[(t + 1) * batch] {
                if idx[p] != PRUNED {
                    row_starts[p] = Some(geometry.row_start(t, idx[p])?);
                }
            }
        }
        Ok(Self {
            geometry,
            indices: idx,
            offsets: offs,
            batch,
            row_starts,
        })
    }

    /// Index positions of bag `b` of table `t`.
    pub fn bag(&self, t: usize, b: usize) -> std::ops::Range<usize> {
        self.offsets[t * self.batch + b]..self.offsets[t * self.batch + b + 1]
    }

    /// Number of indices covered by the offsets.
    pub fn total_len(&self) -> usize {
        self.offsets[self.offsets.len() - 1]
    }
}

/// Optional F32 weight per index position.
pub(crate) fn sample_weights<'a>(t: Option<&'a Tensor>, len: usize) -> Result<Option<&'a [f32]>> {
    let Some(t) = t else {
        return Ok(None);
    };
    validate::operand("per_sample_weights", t, DType::F32)?;
    if t.numel() != len {
        return invalid!("per_sample_weights has {} entries for {len} indices", t.numel());
    }
    Ok(Some(t.as_slice::<f32>()?))
}

/// Index tensor of I32 or I64, rank 1, contiguous.
pub(crate) fn index_values(name: &str, t: &Tensor) -> Result<Vec<i64>> {
    if !matches!(t.dtype(), DType::I32 | DType::I64) {
        return invalid!("{name} must be i32 or i64, got {}", t.dtype());
    }
    validate::descriptor(name, t, t.dtype())
}

/// CSR offsets over `len` indices for `tables` tables: returns the batch
/// size and the offsets as `usize`.
pub(crate) fn bag_offsets(
    offsets: &[i64],
    tables: usize,
    len: usize,
) -> Result<(usize, Vec<usize>)> {
    if offsets.is_empty() || (offsets.len() - 1) % tables != 0 {
        return invalid!(
            "offsets must have T*B+1 entries for T={tables}, got {}",
            offsets.len()
        );
    }
    let offs = non_negative("offsets", offsets)?;
    if offs[0] != 0 {
        return invalid!("offsets must start at 0");
    }
    if offs.windows(2).any(|w| w[0] > w[1]) {
        return invalid!("offsets must be non-decreasing");
    }
    if offs[offs.len() - 1] > len {
        return invalid!("offsets end at {} but there are {len} indices", offs[offs.len() - 1]);
    }
    Ok(((offs.len() - 1) / tables, offs))
}

pub(crate) fn non_negative(name: &str, values: &[i64]) -> Result<Vec<usize>> {
    values
        .iter()
        .map(|&v| usize::try_from(v))
        .collect::<std::result::Result<Vec<_>, _>>()
        .or_else(|_| invalid!("{name} must be non-negative"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_geometry_rows() {
        // Table 0: 3 rows of 4, table 1: 2 rows of 2.
        let g = TableGeometry::new(16, vec![0, 12], vec![0, 4, 6]).unwrap();
        assert_eq!(g.rows, vec![3, 2]);
        assert_eq!(g.total_dim(), 6);
        assert_eq!(g.row_start(1, 1).unwrap(), 14);
        assert!(g.row_start(1, 2).is_err());
        assert!(g.row_start(0, -1).is_err());
    }

    #[test]
    fn test_geometry_strided_rows() {
        // Rows of width 3 stored 8 elements apart: 2 rows fit in 20.
        let g = TableGeometry::with_row_stride(20, vec![0], vec![0, 3], |_, d| d + 5).unwrap();
        assert_eq!(g.rows, vec![2]);
        assert_eq!(g.dims, vec![3]);
        assert_eq!(g.row_start(0, 1).unwrap(), 8);
        assert!(g.row_start(0, 2).is_err());
    }

    #[test]
    fn test_geometry_unordered_tables() {
        let g = TableGeometry::new(16, vec![8, 0], vec![0, 4, 8]).unwrap();
        assert_eq!(g.rows, vec![2, 1]);
    }

    #[test]
    fn test_bag_offsets() {
        assert_eq!(bag_offsets(&[0, 1, 3, 3, 4], 2, 4).unwrap().0, 2);
        assert!(bag_offsets(&[0, 1, 3, 4], 2, 4).is_err());
        assert!(bag_offsets(&[0, 3, 1], 1, 4).is_err());
        assert!(bag_offsets(&[0, 5], 1, 4).is_err());
        assert_eq!(bag_offsets(&[0], 3, 0).unwrap().0, 0);
    }
}
