//! Lookups over quantized row buffers.
//!
//! Every table stores its rows in one [`SparseType`] inside a single U8
//! buffer; `weights_offsets` are byte offsets and each row occupies
//! [`SparseType::padded_row_bytes`] bytes. Integer rows carry their own
//! scale and bias and decode as `scale * q + bias`:
//!
//! | format | row bytes |
//! |---|---|
//! | `Int8` | `[scale f16][bias f16][q u8; D]` |
//! | `Int8`, scale/bias last | `[q u8; D][scale f32][bias f32]` |
//! | `Int4` / `Int2` | `[scale f16][bias f16][q packed, low bits first]` |
//! | `Fp32` / `Fp16` / `Bf16` | little-endian values |

use half::{bf16, f16};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tessel_core::{DType, Tensor};
use tracing::debug;

use super::forward::PoolingMode;
use super::{non_negative, sample_weights, Lookup, TableGeometry};
use crate::error::{invalid, Result};
use crate::validate;

/// Storage format of one table's rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SparseType {
    Fp32,
    Fp16,
    Int8,
    Int4,
    Int2,
    Bf16,
}

impl SparseType {
    pub const ALL: [SparseType; 6] = [
        SparseType::Fp32,
        SparseType::Fp16,
        SparseType::Int8,
        SparseType::Int4,
        SparseType::Int2,
        SparseType::Bf16,
    ];

    /// Code stored in a `weights_tys` tensor.
    pub fn code(self) -> u8 {
        match self {
            SparseType::Fp32 => 0,
            SparseType::Fp16 => 1,
            SparseType::Int8 => 2,
            SparseType::Int4 => 3,
            SparseType::Int2 => 4,
            SparseType::Bf16 => 5,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|ty| ty.code() == code)
    }

    pub fn bit_rate(self) -> usize {
        match self {
            SparseType::Fp32 => 32,
            SparseType::Fp16 | SparseType::Bf16 => 16,
            SparseType::Int8 => 8,
            SparseType::Int4 => 4,
            SparseType::Int2 => 2,
        }
    }

    pub fn is_integer(self) -> bool {
        matches!(self, SparseType::Int8 | SparseType::Int4 | SparseType::Int2)
    }

    /// Bytes of per-row scale and bias.
    pub fn scale_bias_bytes(self, scale_bias_last: bool) -> usize {
        match self {
            SparseType::Int8 if scale_bias_last => 8,
            ty if ty.is_integer() => 4,
            _ => 0,
        }
    }

    /// Stored size of a `dim`-element row, padded to `row_alignment` bytes.
    pub fn padded_row_bytes(self, dim: usize, row_alignment: usize, scale_bias_last: bool) -> usize {
        let align = row_alignment.max(1);
        let unpadded = (dim * self.bit_rate()).div_ceil(8) + self.scale_bias_bytes(scale_bias_last);
        unpadded.div_ceil(align) * align
    }

    /// Integer rows whose scale and bias are a wide pair after the values.
    fn wide_scale_bias(self, scale_bias_last: bool) -> bool {
        self == SparseType::Int8 && scale_bias_last
    }
}

/// Row layout and output options of the quantized lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuantizedOptions {
    /// Ignored by the unpooled lookup.
    pub pooling: PoolingMode,
    /// F32, F16 or BF16.
    pub output_dtype: DType,
    /// Rows are padded to a multiple of this many bytes.
    pub row_alignment: usize,
    /// INT8 rows keep an f32 scale and bias after the values instead of an
    /// f16 pair in front.
    pub scale_bias_last: bool,
}

impl Default for QuantizedOptions {
    fn default() -> Self {
        Self {
            pooling: PoolingMode::Sum,
            output_dtype: DType::F32,
            row_alignment: 1,
            scale_bias_last: false,
        }
    }
}

/// Encode one row in format `ty`. Integer formats use asymmetric min/max
/// quantization against the scale and bias as stored.
pub fn quantize_row(
    ty: SparseType,
    values: &[f32],
    row_alignment: usize,
    scale_bias_last: bool,
) -> Vec<u8> {
    let d = values.len();
    let mut row = vec![0u8; ty.padded_row_bytes(d, row_alignment, scale_bias_last)];
    match ty {
        SparseType::Fp32 => {
            for (dst, v) in row.chunks_exact_mut(4).zip(values) {
                dst.copy_from_slice(&v.to_le_bytes());
            }
        }
        SparseType::Fp16 => {
            for (dst, &v) in row.chunks_exact_mut(2).zip(values) {
                dst.copy_from_slice(&f16::from_f32(v).to_le_bytes());
            }
        }
        SparseType::Bf16 => {
            for (dst, &v) in row.chunks_exact_mut(2).zip(values) {
                dst.copy_from_slice(&bf16::from_f32(v).to_le_bytes());
            }
        }
        SparseType::Int8 | SparseType::Int4 | SparseType::Int2 => {
            let levels = ((1u32 << ty.bit_rate()) - 1) as f32;
            let (min, max) = values
                .iter()
                .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
            let (min, max) = if d == 0 { (0.0, 0.0) } else { (min, max) };
            let wide = ty.wide_scale_bias(scale_bias_last);
            let narrow = |v: f32| if wide { v } else { f16::from_f32(v).to_f32() };
            let scale = narrow(if max > min { (max - min) / levels } else { 1.0 });
            let scale = if scale > 0.0 { scale } else { 1.0 };
            let bias = narrow(min);
            let q = |v: f32| ((v - bias) / scale).round().clamp(0.0, levels) as u8;

            if wide {
                for (dst, &v) in row[..d].iter_mut().zip(values) {
                    *dst = q(v);
                }
                row[d..d + 4].copy_from_slice(&scale.to_le_bytes());
                row[d + 4..d + 8].copy_from_slice(&bias.to_le_bytes());
            } else {
                row[..2].copy_from_slice(&f16::from_f32(scale).to_le_bytes());
                row[2..4].copy_from_slice(&f16::from_f32(bias).to_le_bytes());
                let bits = ty.bit_rate();
                let per_byte = 8 / bits;
                for (j, &v) in values.iter().enumerate() {
                    row[4 + j / per_byte] |= q(v) << ((j % per_byte) * bits);
                }
            }
        }
    }
    row
}

fn read_f32(b: &[u8]) -> f32 {
    f32::from_le_bytes([b[0], b[1], b[2], b[3]])
}

fn read_f16(b: &[u8]) -> f32 {
    f16::from_le_bytes([b[0], b[1]]).to_f32()
}

/// `dst += w * decode(row)`.
fn accumulate_row(ty: SparseType, row: &[u8], scale_bias_last: bool, w: f32, dst: &mut [f32]) {
    let d = dst.len();
    match ty {
        SparseType::Fp32 => {
            for (o, b) in dst.iter_mut().zip(row.chunks_exact(4)) {
                *o += w * read_f32(b);
            }
        }
        SparseType::Fp16 => {
            for (o, b) in dst.iter_mut().zip(row.chunks_exact(2)) {
                *o += w * read_f16(b);
            }
        }
        SparseType::Bf16 => {
            for (o, b) in dst.iter_mut().zip(row.chunks_exact(2)) {
                *o += w * bf16::from_le_bytes([b[0], b[1]]).to_f32();
            }
        }
        SparseType::Int8 if scale_bias_last => {
            let (scale, bias) = (read_f32(&row[d..]), read_f32(&row[d + 4..]));
            for (o, &q) in dst.iter_mut().zip(&row[..d]) {
                *o += w * (scale * q as f32 + bias);
            }
        }
        SparseType::Int8 | SparseType::Int4 | SparseType::Int2 => {
            let (scale, bias) = (read_f16(row), read_f16(&row[2..]));
            let bits = ty.bit_rate();
            let per_byte = 8 / bits;
            let mask = ((1u16 << bits) - 1) as u8;
            let packed = &row[4..];
            for (j, o) in dst.iter_mut().enumerate() {
                let q = (packed[j / per_byte] >> ((j % per_byte) * bits)) & mask;
                *o += w * (scale * q as f32 + bias);
            }
        }
    }
}

/// Per-table formats from a U8 `weights_tys` tensor of type codes.
pub(crate) fn sparse_types(weights_tys: &Tensor) -> Result<Vec<SparseType>> {
    validate::operand("weights_tys", weights_tys, DType::U8)?;
    validate::rank("weights_tys", weights_tys, &[1])?;
    weights_tys
        .as_slice::<u8>()?
        .iter()
        .map(|&code| match SparseType::from_code(code) {
            Some(ty) => Ok(ty),
            None => invalid!("unknown weight type code {code}"),
        })
        .collect()
}

/// Byte geometry of quantized tables in a U8 buffer.
pub(crate) fn quantized_geometry(
    weights: &Tensor,
    weights_offsets: &Tensor,
    types: &[SparseType],
    d_offsets: Vec<usize>,
    options: &QuantizedOptions,
) -> Result<TableGeometry> {
    if options.row_alignment == 0 {
        return invalid!("row_alignment must be positive");
    }
    validate::operand("weights", weights, DType::U8)?;
    validate::rank("weights", weights, &[1])?;
    let starts = validate::descriptor("weights_offsets", weights_offsets, DType::I64)?;
    if types.len() != starts.len() {
        return invalid!("{} weight types for {} tables", types.len(), starts.len());
    }
    TableGeometry::with_row_stride(
        weights.numel(),
        non_negative("weights_offsets", &starts)?,
        d_offsets,
        |t, d| types[t].padded_row_bytes(d, options.row_alignment, options.scale_bias_last),
    )
}

/// Quantized weights resolved against an index batch.
struct QuantizedLookup {
    types: Vec<SparseType>,
    lookup: Lookup,
}

impl QuantizedLookup {
    fn new(
        weights: &Tensor,
        weights_offsets: &Tensor,
        weights_tys: &Tensor,
        d_offsets: Vec<usize>,
        indices: &Tensor,
        offsets: &Tensor,
        options: &QuantizedOptions,
    ) -> Result<Self> {
        if !matches!(options.output_dtype, DType::F32 | DType::F16 | DType::BF16) {
            return invalid!("output dtype must be f32, f16 or bf16, got {}", options.output_dtype);
        }
        let types = sparse_types(weights_tys)?;
        let geometry = quantized_geometry(weights, weights_offsets, &types, d_offsets, options)?;
        let lookup = Lookup::resolve(geometry, indices, offsets)?;
        Ok(Self { types, lookup })
    }

    fn row<'a>(&self, bytes: &'a [u8], t: usize, row_start: usize) -> &'a [u8] {
        &bytes[row_start..row_start + self.lookup.geometry.strides[t]]
    }
}

/// Pooled lookup over quantized tables: output `[B, total_D]` in
/// `options.output_dtype`. Accumulation is in f32.
#[allow(clippy::too_many_arguments)]
pub fn int_nbit_split_embedding_forward(
    weights: &Tensor,
    weights_offsets: &Tensor,
    weights_tys: &Tensor,
    d_offsets: &Tensor,
    indices: &Tensor,
    offsets: &Tensor,
    per_sample_weights: Option<&Tensor>,
    options: &QuantizedOptions,
) -> Result<Tensor> {
    let mut on_device = vec![
        ("weights", weights),
        ("weights_offsets", weights_offsets),
        ("weights_tys", weights_tys),
        ("d_offsets", d_offsets),
        ("indices", indices),
        ("offsets", offsets),
    ];
    on_device.extend(per_sample_weights.map(|t| ("per_sample_weights", t)));
    let device = validate::same_device(&on_device)?;
    let d_offsets = validate::descriptor("d_offsets", d_offsets, DType::I32)?;
    let q = QuantizedLookup::new(
        weights,
        weights_offsets,
        weights_tys,
        non_negative("d_offsets", &d_offsets)?,
        indices,
        offsets,
        options,
    )?;
    let lookup = &q.lookup;
    let geo = &lookup.geometry;
    let psw = sample_weights(per_sample_weights, lookup.indices.len())?;
    let bytes = weights.as_slice::<u8>()?;

    let total_d = geo.total_dim();
    let mut out = vec![0.0f32; lookup.batch * total_d];
    out.par_chunks_mut(total_d.max(1)).enumerate().for_each(|(b, out_row)| {
        for t in 0..geo.tables() {
            let bag = lookup.bag(t, b);
            let dst = &mut out_row[geo.d_offsets[t]..geo.d_offsets[t + 1]];
            for p in bag.clone() {
                let Some(row_start) = lookup.row_starts[p] else {
                    continue;
                };
                let w = psw.map_or(1.0, |psw| psw[p]);
                accumulate_row(q.types[t], q.row(bytes, t, row_start), options.scale_bias_last, w, dst);
            }
            if options.pooling == PoolingMode::Mean && psw.is_none() && !bag.is_empty() {
                let inv = 1.0 / bag.len() as f32;
                dst.iter_mut().for_each(|o| *o *= inv);
            }
        }
    });
    debug!(
        tables = geo.tables(),
        batch = lookup.batch,
        indices = lookup.indices.len(),
        output = %options.output_dtype,
        "quantized embedding forward"
    );
    Ok(Tensor::from_f32_as(&out, &[lookup.batch, total_d], options.output_dtype)?.to_device(device))
}

/// Unpooled lookup over quantized tables of one row width `dim`: output
/// `[total_L, dim]` in `options.output_dtype`.
pub fn int_nbit_split_embedding_nobag_forward(
    weights: &Tensor,
    weights_offsets: &Tensor,
    weights_tys: &Tensor,
    dim: usize,
    indices: &Tensor,
    offsets: &Tensor,
    options: &QuantizedOptions,
) -> Result<Tensor> {
    let device = validate::same_device(&[
        ("weights", weights),
        ("weights_offsets", weights_offsets),
        ("weights_tys", weights_tys),
        ("indices", indices),
        ("offsets", offsets),
    ])?;
    let tables = weights_offsets.numel();
    let d_offsets = (0..=tables).map(|t| t * dim).collect();
    let q = QuantizedLookup::new(
        weights,
        weights_offsets,
        weights_tys,
        d_offsets,
        indices,
        offsets,
        options,
    )?;
    let lookup = &q.lookup;
    let bytes = weights.as_slice::<u8>()?;

    let mut table_of = vec![0usize; lookup.indices.len()];
    for t in 0..tables {
        for b in 0..lookup.batch {
            lookup.bag(t, b).for_each(|p| table_of[p] = t);
        }
    }
    let total_l = lookup.total_len();
    let mut out = vec![0.0f32; total_l * dim];
    out.par_chunks_mut(dim.max(1)).enumerate().for_each(|(p, dst)| {
        if let Some(row_start) = lookup.row_starts[p] {
            let t = table_of[p];
            accumulate_row(q.types[t], q.row(bytes, t, row_start), options.scale_bias_last, 1.0, dst);
        }
    });
    Ok(Tensor::from_f32_as(&out, &[total_l, dim], options.output_dtype)?.to_device(device))
}
