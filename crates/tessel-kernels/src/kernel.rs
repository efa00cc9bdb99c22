//! The kernel call signature and the reference tiled GEMM kernel.
//!
//! Every kernel computes, per argument record,
//! `C[i, j] (=|+=) epilogue(Σ_p A[i, p] · B[j, p])`, with A row-major
//! `[m, k]` and B row-major `[n, k]`. Block tiles run in parallel across
//! rows of the output; each block tile is split into its wave sub-tiles
//! exactly as the configuration describes.

use std::fmt;

use rayon::prelude::*;

use crate::args::{KernelArgBuffer, KernelArgumentRecord, ZeroFill};
use crate::config::{KernelConfig, Scheduler};
use crate::error::{KernelError, Result};
use crate::microkernel::tile_matmul;
use crate::operand::{GemmOperands, OperandView};

/// Output transform applied to the f32 accumulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Epilogue {
    /// Store the raw accumulator.
    Plain,
    /// Multiply by `a_scale[row] * b_scale[col]`.
    RowwiseScale,
}

/// A stateless pre-compiled kernel variant.
pub trait GemmKernel: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    fn config(&self) -> &KernelConfig;

    fn epilogue(&self) -> Epilogue;

    /// Whether one problem of this shape is inside the padding-safe range.
    fn supports(&self, m: usize, n: usize, k: usize) -> bool {
        self.config().supports(m, n, k)
    }

    /// Zero the buffer's fill regions, then run every record into `out`.
    fn launch(
        &self,
        operands: &GemmOperands<'_>,
        args: &KernelArgBuffer,
        out: &mut [f32],
    ) -> Result<()>;
}

/// Host-executed kernel whose tile loop follows its configuration.
#[derive(Debug, Clone)]
pub struct TiledGemmKernel {
    name: String,
    config: KernelConfig,
    epilogue: Epilogue,
}

impl TiledGemmKernel {
    pub fn new(prefix: &str, config: KernelConfig, epilogue: Epilogue) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            name: config.name(prefix),
            config,
            epilogue,
        })
    }

    /// Build a kernel from its full name.
    pub fn from_name(name: &str, epilogue: Epilogue) -> Result<Self> {
        let (_, config) = KernelConfig::parse(name)?;
        Ok(Self {
            name: name.to_string(),
            config,
            epilogue,
        })
    }

    fn check_record(
        &self,
        ops: &GemmOperands<'_>,
        rec: &KernelArgumentRecord,
        out_len: usize,
    ) -> Result<()> {
        let (m, n, k) = rec.dims();
        if !self.supports(m, n, k) {
            return Err(KernelError::UnsupportedShape {
                kernel: self.name.clone(),
                group: rec.group,
                m: rec.m,
                n: rec.n,
                k: rec.k,
            });
        }
        let (lda, ldb, ldc) = (rec.lda as usize, rec.ldb as usize, rec.ldc as usize);
        let oob = |operand: &'static str, needed: usize, len: usize| {
            if needed > len {
                Err(KernelError::OutOfBounds {
                    group: rec.group,
                    operand,
                    needed,
                    len,
                })
            } else {
                Ok(())
            }
        };
        // Rows must not overlap.
        oob("lda", k, lda)?;
        oob("ldb", k, ldb)?;
        oob("ldc", n, ldc)?;
        oob("A", rec.a_offset as usize + (m - 1) * lda + k, ops.a.len())?;
        oob("B", rec.b_offset as usize + (n - 1) * ldb + k, ops.b.len())?;
        oob("C", rec.c_offset as usize + (m - 1) * ldc + n, out_len)?;

        if self.epilogue == Epilogue::RowwiseScale {
            let missing = |operand| KernelError::MissingOperand {
                kernel: self.name.clone(),
                operand,
            };
            let a_scale = ops.a_scale.ok_or_else(|| missing("a_scale"))?;
            let b_scale = ops.b_scale.ok_or_else(|| missing("b_scale"))?;
            oob("a_scale", rec.a_scale_offset as usize + m, a_scale.len())?;
            oob("b_scale", rec.b_scale_offset as usize + n, b_scale.len())?;
        }
        Ok(())
    }

    fn run_record(&self, ops: &GemmOperands<'_>, rec: &KernelArgumentRecord, out: &mut [f32]) {
        let (m, n, _) = rec.dims();
        let ldc = rec.ldc as usize;
        let c_off = rec.c_offset as usize;
        let region = &mut out[c_off..c_off + (m - 1) * ldc + n];
        let mpb = self.config.m_per_block;

        region
            .par_chunks_mut(mpb * ldc)
            .enumerate()
            .for_each(|(block_row, c_rows)| {
                let i0 = block_row * mpb;
                self.run_block_row(ops, rec, i0, mpb.min(m - i0), c_rows);
            });
    }

    /// All block tiles of one block row: `mt` output rows starting at `i0`.
    fn run_block_row(
        &self,
        ops: &GemmOperands<'_>,
        rec: &KernelArgumentRecord,
        i0: usize,
        mt: usize,
        c_rows: &mut [f32],
    ) {
        let cfg = &self.config;
        let (_, n, k) = rec.dims();
        let ldc = rec.ldc as usize;
        let split_len = split_k_len(k, cfg.k_batch, cfg.k_per_block);
        let panel = match cfg.scheduler {
            Scheduler::Intrawave => split_len,
            Scheduler::Interwave => cfg.k_per_block,
        };

        let mut a_tile = vec![0.0f32; mt * panel];
        let mut b_tile = vec![0.0f32; panel * cfg.n_per_block];
        let mut b_row = vec![0.0f32; panel];
        let mut acc = vec![0.0f32; mt * cfg.n_per_block];
        let mut partial = vec![0.0f32; mt * cfg.n_per_block];

        for j0 in (0..n).step_by(cfg.n_per_block) {
            let nt = cfg.n_per_block.min(n - j0);
            let acc = &mut acc[..mt * nt];
            acc.fill(0.0);

            for s0 in (0..k).step_by(split_len) {
                let s_end = (s0 + split_len).min(k);
                let partial = &mut partial[..mt * nt];
                partial.fill(0.0);

                for p0 in (s0..s_end).step_by(panel) {
                    let kt = panel.min(s_end - p0);
                    let a_tile = &mut a_tile[..mt * kt];
                    let b_tile = &mut b_tile[..kt * nt];
                    pack_rows(&ops.a, rec.a_offset as usize, rec.lda as usize, i0, mt, p0, a_tile);
                    pack_cols(
                        &ops.b,
                        rec.b_offset as usize,
                        rec.ldb as usize,
                        j0,
                        nt,
                        p0,
                        &mut b_row[..kt],
                        b_tile,
                    );
                    self.compute_waves(a_tile, b_tile, partial, mt, nt, kt);
                }

                // Split-K reduction
                for (a, p) in acc.iter_mut().zip(partial.iter()) {
                    *a += *p;
                }
            }

            self.store(ops, rec, i0, j0, mt, nt, acc, &mut c_rows[j0..], ldc);
        }
    }

    /// Run every wave sub-tile of the block over one K panel.
    fn compute_waves(&self, a: &[f32], b: &[f32], c: &mut [f32], mt: usize, nt: usize, kt: usize) {
        let cfg = &self.config;
        let (waves_m, waves_n) = cfg.waves();
        let wave_tm = cfg.wave_m * cfg.m_repeat;
        let wave_tn = cfg.wave_n * cfg.n_repeat;

        for wi in 0..waves_m {
            let r0 = wi * wave_tm;
            if r0 >= mt {
                break;
            }
            let rows = wave_tm.min(mt - r0);
            for wj in 0..waves_n {
                let c0 = wj * wave_tn;
                if c0 >= nt {
                    break;
                }
                let cols = wave_tn.min(nt - c0);
                tile_matmul(
                    &a[r0 * kt..],
                    kt,
                    &b[c0..],
                    nt,
                    &mut c[r0 * nt + c0..],
                    nt,
                    rows,
                    cols,
                    kt,
                );
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn store(
        &self,
        ops: &GemmOperands<'_>,
        rec: &KernelArgumentRecord,
        i0: usize,
        j0: usize,
        mt: usize,
        nt: usize,
        acc: &[f32],
        c: &mut [f32],
        ldc: usize,
    ) {
        let scales = match (self.epilogue, ops.a_scale, ops.b_scale) {
            (Epilogue::RowwiseScale, Some(sa), Some(sb)) => Some((
                &sa[rec.a_scale_offset as usize + i0..],
                &sb[rec.b_scale_offset as usize + j0..],
            )),
            _ => None,
        };
        for i in 0..mt {
            let dst = &mut c[i * ldc..i * ldc + nt];
            let src = &acc[i * nt..(i + 1) * nt];
            for (j, (d, &v)) in dst.iter_mut().zip(src).enumerate() {
                let v = match scales {
                    Some((sa, sb)) => v * sa[i] * sb[j],
                    None => v,
                };
                if rec.accumulates() {
                    *d += v;
                } else {
                    *d = v;
                }
            }
        }
    }
}

impl GemmKernel for TiledGemmKernel {
    fn name(&self) -> &str {
        &self.name
    }

    fn config(&self) -> &KernelConfig {
        &self.config
    }

    fn epilogue(&self) -> Epilogue {
        self.epilogue
    }

    fn launch(
        &self,
        operands: &GemmOperands<'_>,
        args: &KernelArgBuffer,
        out: &mut [f32],
    ) -> Result<()> {
        for fill in args.zero_fills() {
            apply_zero_fill(out, fill)?;
        }
        for rec in args.records() {
            self.check_record(operands, rec, out.len())?;
        }
        for rec in args.records() {
            self.run_record(operands, rec, out);
        }
        Ok(())
    }
}

/// Length of one split-K slice, rounded up to whole K tiles.
fn split_k_len(k: usize, k_batch: usize, k_per_block: usize) -> usize {
    let per_split = k.div_ceil(k_batch.max(1));
    per_split.div_ceil(k_per_block).max(1) * k_per_block
}

/// Pack `rows` rows of a row-major operand, columns `p0..p0 + dst_cols`.
fn pack_rows(
    src: &OperandView<'_>,
    base: usize,
    ld: usize,
    r0: usize,
    rows: usize,
    p0: usize,
    dst: &mut [f32],
) {
    let kt = dst.len() / rows;
    for (r, row) in dst.chunks_exact_mut(kt).enumerate() {
        src.decode_into(base + (r0 + r) * ld + p0, row);
    }
}

/// Pack a row-major `[n, k]` operand transposed into `dst[kt × nt]`.
#[allow(clippy::too_many_arguments)]
fn pack_cols(
    src: &OperandView<'_>,
    base: usize,
    ld: usize,
    j0: usize,
    nt: usize,
    p0: usize,
    row: &mut [f32],
    dst: &mut [f32],
) {
    for j in 0..nt {
        src.decode_into(base + (j0 + j) * ld + p0, row);
        for (p, &v) in row.iter().enumerate() {
            dst[p * nt + j] = v;
        }
    }
}

fn apply_zero_fill(out: &mut [f32], fill: &ZeroFill) -> Result<()> {
    let (rows, cols, ld) = (fill.rows as usize, fill.cols as usize, fill.ld as usize);
    if rows == 0 || cols == 0 {
        return Ok(());
    }
    let offset = fill.offset as usize;
    let needed = offset + (rows - 1) * ld + cols;
    if needed > out.len() || cols > ld {
        return Err(KernelError::OutOfBounds {
            group: u32::MAX,
            operand: "zero-fill",
            needed,
            len: out.len(),
        });
    }
    for r in 0..rows {
        let start = offset + r * ld;
        out[start..start + cols].fill(0.0);
    }
    Ok(())
}
