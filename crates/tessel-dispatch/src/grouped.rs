//! Grouped argument building.
//!
//! A [`GroupLayout`] describes where each group's operands and output live
//! inside flat buffers. [`build_args`] turns it into one argument record per
//! non-empty group plus, when the output is not pre-zeroed, zero-fill
//! regions for everything the records do not cover.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::OnceLock;

use rayon::prelude::*;
use tessel_kernels::{KernelArgBuffer, KernelArgumentRecord, KernelError, ZeroFill};
use tracing::debug;

use crate::config::ZeroingMode;
use crate::key::ProblemShape;

type KResult<T> = std::result::Result<T, KernelError>;

/// Axis along which group sizes vary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RaggedDim {
    M,
    N,
    K,
}

/// One independent problem of a list-style grouped call, with its offsets
/// into the packed operand and output buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackedGroup {
    pub m: usize,
    pub n: usize,
    pub k: usize,
    pub a_offset: usize,
    pub b_offset: usize,
    pub c_offset: usize,
    pub a_scale_offset: usize,
    pub b_scale_offset: usize,
}

/// Placement of every group's problem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupLayout {
    /// A `[G,M,K]`, B `[G,N,K]`, output `[G,M,N]`. `valid_rows[g]` limits
    /// the rows computed for group `g`; the rest of its block is zero.
    Fixed {
        groups: usize,
        m: usize,
        n: usize,
        k: usize,
        valid_rows: Option<Vec<usize>>,
    },
    /// Groups split one axis at `bounds` (`G + 1` entries from 0).
    ///
    /// | dim | A | B | output |
    /// |---|---|---|---|
    /// | M | `[extent,K]` | `[G,N,K]` | `[extent,N]` |
    /// | N | `[G,M,K]` | `[extent,K]` | `[M,extent]` |
    /// | K | `[M,extent]` | `[N,extent]` | `[M,N]`, summed |
    ///
    /// Only ragged-M allows `bounds[G] < extent`; the trailing rows are zero.
    Ragged {
        dim: RaggedDim,
        bounds: Vec<usize>,
        extent: usize,
        m: usize,
        n: usize,
        k: usize,
    },
    /// Independent problems packed back to back.
    Packed { groups: Vec<PackedGroup> },
}

impl GroupLayout {
    /// Layout for independent `(m, n, k)` problems stored consecutively.
    pub fn packed(shapes: &[(usize, usize, usize)]) -> Self {
        let mut groups = Vec::with_capacity(shapes.len());
        let (mut a, mut b, mut c, mut sa, mut sb) = (0, 0, 0, 0, 0);
        for &(m, n, k) in shapes {
            groups.push(PackedGroup {
                m,
                n,
                k,
                a_offset: a,
                b_offset: b,
                c_offset: c,
                a_scale_offset: sa,
                b_scale_offset: sb,
            });
            a += m * k;
            b += n * k;
            c += m * n;
            sa += m;
            sb += n;
        }
        GroupLayout::Packed { groups }
    }

    pub fn groups(&self) -> usize {
        match self {
            GroupLayout::Fixed { groups, .. } => *groups,
            GroupLayout::Ragged { bounds, .. } => bounds.len().saturating_sub(1),
            GroupLayout::Packed { groups } => groups.len(),
        }
    }

    pub fn accumulates(&self) -> bool {
        matches!(self, GroupLayout::Ragged { dim: RaggedDim::K, .. })
    }

    /// Logical output dimensions.
    pub fn output_dims(&self) -> Vec<usize> {
        match self {
            GroupLayout::Fixed { groups, m, n, .. } => vec![*groups, *m, *n],
            GroupLayout::Ragged { dim, extent, m, n, .. } => match dim {
                RaggedDim::M => vec![*extent, *n],
                RaggedDim::N => vec![*m, *extent],
                RaggedDim::K => vec![*m, *n],
            },
            GroupLayout::Packed { groups } => vec![groups.iter().map(|g| g.m * g.n).sum()],
        }
    }

    pub fn output_len(&self) -> usize {
        self.output_dims().iter().product()
    }

    /// Shape used for table lookup and tuning: the ragged axis is the total
    /// across groups, the other axes are per group.
    pub fn problem_shape(&self) -> ProblemShape {
        let g = self.groups();
        match self {
            GroupLayout::Fixed { m, n, k, .. } => ProblemShape::grouped(g, *m, *n, *k),
            GroupLayout::Ragged {
                dim, bounds, m, n, k, ..
            } => {
                let total = bounds.last().copied().unwrap_or(0);
                match dim {
                    RaggedDim::M => ProblemShape::grouped(g, total, *n, *k),
                    RaggedDim::N => ProblemShape::grouped(g, *m, total, *k),
                    RaggedDim::K => ProblemShape::grouped(g, *m, *n, total),
                }
            }
            GroupLayout::Packed { groups } => ProblemShape::grouped(
                g,
                groups.iter().map(|p| p.m).sum(),
                groups.iter().map(|p| p.n).max().unwrap_or(0),
                groups.iter().map(|p| p.k).max().unwrap_or(0),
            ),
        }
    }

    /// `(m, n, k)` of every non-empty group.
    pub fn group_dims(&self) -> Vec<(usize, usize, usize)> {
        (0..self.groups())
            .filter_map(|g| self.group_extent(g))
            .filter(|&(m, n, k)| m > 0 && n > 0 && k > 0)
            .collect()
    }

    fn group_extent(&self, g: usize) -> Option<(usize, usize, usize)> {
        match self {
            GroupLayout::Fixed {
                m, n, k, valid_rows, ..
            } => {
                let rows = valid_rows.as_ref().map_or(*m, |v| v[g]);
                Some((rows, *n, *k))
            }
            GroupLayout::Ragged {
                dim, bounds, m, n, k, ..
            } => {
                let size = bounds[g + 1] - bounds[g];
                Some(match dim {
                    RaggedDim::M => (size, *n, *k),
                    RaggedDim::N => (*m, size, *k),
                    RaggedDim::K => (*m, *n, size),
                })
            }
            GroupLayout::Packed { groups } => groups.get(g).map(|p| (p.m, p.n, p.k)),
        }
    }

    /// Argument record of group `g`, or `None` for an empty group.
    pub fn record(&self, g: usize) -> KResult<Option<KernelArgumentRecord>> {
        let Some((gm, gn, gk)) = self.group_extent(g) else {
            return Ok(None);
        };
        if gm == 0 || gn == 0 || gk == 0 {
            return Ok(None);
        }
        let base = KernelArgumentRecord {
            group: u32::try_from(g).map_err(|_| KernelError::DimensionOverflow(g))?,
            ..KernelArgumentRecord::dense(gm, gn, gk)?
        };
        let rec = match self {
            GroupLayout::Fixed { m, n, k, .. } => KernelArgumentRecord {
                a_offset: (g * m * k) as u64,
                b_offset: (g * n * k) as u64,
                a_scale_offset: (g * m) as u64,
                b_scale_offset: (g * n) as u64,
                c_offset: (g * m * n) as u64,
                ..base
            },
            GroupLayout::Ragged {
                dim,
                bounds,
                extent,
                m,
                n,
                k,
            } => {
                let start = bounds[g];
                match dim {
                    RaggedDim::M => KernelArgumentRecord {
                        a_offset: (start * k) as u64,
                        b_offset: (g * n * k) as u64,
                        a_scale_offset: start as u64,
                        b_scale_offset: (g * n) as u64,
                        c_offset: (start * n) as u64,
                        ..base
                    },
                    RaggedDim::N => KernelArgumentRecord {
                        a_offset: (g * m * k) as u64,
                        b_offset: (start * k) as u64,
                        a_scale_offset: (g * m) as u64,
                        b_scale_offset: start as u64,
                        c_offset: start as u64,
                        ldc: tessel_kernels::arg_u32(*extent)?,
                        ..base
                    },
                    RaggedDim::K => KernelArgumentRecord {
                        a_offset: start as u64,
                        b_offset: start as u64,
                        a_scale_offset: (g * m) as u64,
                        b_scale_offset: (g * n) as u64,
                        c_offset: 0,
                        lda: tessel_kernels::arg_u32(*extent)?,
                        ldb: tessel_kernels::arg_u32(*extent)?,
                        accumulate: 1,
                        ..base
                    },
                }
            }
            GroupLayout::Packed { groups } => {
                let p = &groups[g];
                KernelArgumentRecord {
                    a_offset: p.a_offset as u64,
                    b_offset: p.b_offset as u64,
                    a_scale_offset: p.a_scale_offset as u64,
                    b_scale_offset: p.b_scale_offset as u64,
                    c_offset: p.c_offset as u64,
                    ..base
                }
            }
        };
        Ok(Some(rec))
    }

    /// Output region of group `g` its record leaves untouched.
    pub fn skipped_region(&self, g: usize) -> KResult<Option<ZeroFill>> {
        match self {
            GroupLayout::Fixed {
                m, n, valid_rows, ..
            } => {
                let rows = valid_rows.as_ref().map_or(*m, |v| v[g]);
                if rows >= *m || *n == 0 {
                    return Ok(None);
                }
                Ok(Some(ZeroFill::new(g * m * n + rows * n, m - rows, *n, *n)?))
            }
            GroupLayout::Ragged { .. } => Ok(None),
            GroupLayout::Packed { groups } => {
                let p = &groups[g];
                if p.m == 0 || p.n == 0 || p.k > 0 {
                    return Ok(None);
                }
                Ok(Some(ZeroFill::new(p.c_offset, p.m, p.n, p.n)?))
            }
        }
    }

    /// Output rows past the last group (ragged-M only).
    pub fn tail_region(&self) -> KResult<Option<ZeroFill>> {
        match self {
            GroupLayout::Ragged {
                dim: RaggedDim::M,
                bounds,
                extent,
                n,
                ..
            } => {
                let end = bounds.last().copied().unwrap_or(0);
                if end >= *extent || *n == 0 {
                    return Ok(None);
                }
                Ok(Some(ZeroFill::new(end * n, extent - end, *n, *n)?))
            }
            _ => Ok(None),
        }
    }
}

/// Argument buffer for one grouped launch.
#[derive(Debug, Clone)]
pub struct GroupedArgs {
    pub buffer: KernelArgBuffer,
    /// Whether the output must be zeroed before the launch.
    pub pre_zero: bool,
}

/// Append-only slots filled from parallel tasks.
struct Slots<T> {
    cells: Vec<OnceLock<T>>,
    next: AtomicUsize,
}

impl<T> Slots<T> {
    fn new(capacity: usize) -> Self {
        Self {
            cells: (0..capacity).map(|_| OnceLock::new()).collect(),
            next: AtomicUsize::new(0),
        }
    }

    fn push(&self, value: T) {
        let slot = self.next.fetch_add(1, Ordering::Relaxed);
        // At most one push per group, so `slot < capacity`.
        let _ = self.cells[slot].set(value);
    }

    fn into_vec(self) -> Vec<T> {
        let used = self.next.into_inner();
        self.cells
            .into_iter()
            .take(used)
            .filter_map(OnceLock::into_inner)
            .collect()
    }
}

/// Build records (and zero fills under `ZeroingMode::InPass`) for every
/// group. Empty groups get neither a record nor a slot. From
/// `parallel_threshold` groups on, groups are processed as parallel tasks
/// and records land in slot order, which is not group order.
pub fn build_args(
    layout: &GroupLayout,
    zeroing: ZeroingMode,
    parallel_threshold: usize,
) -> KResult<GroupedArgs> {
    let groups = layout.groups();
    let pre_zero = zeroing == ZeroingMode::PreZero || layout.accumulates();

    let (records, mut fills) = if groups >= parallel_threshold.max(1) {
        let records = Slots::new(groups);
        let fills = Slots::new(groups);
        (0..groups).into_par_iter().try_for_each(|g| -> KResult<()> {
            if let Some(rec) = layout.record(g)? {
                records.push(rec);
            }
            if !pre_zero {
                if let Some(fill) = layout.skipped_region(g)? {
                    fills.push(fill);
                }
            }
            Ok(())
        })?;
        (records.into_vec(), fills.into_vec())
    } else {
        let mut records = Vec::with_capacity(groups);
        let mut fills = Vec::new();
        for g in 0..groups {
            if let Some(rec) = layout.record(g)? {
                records.push(rec);
            }
            if !pre_zero {
                if let Some(fill) = layout.skipped_region(g)? {
                    fills.push(fill);
                }
            }
        }
        (records, fills)
    };

    if !pre_zero {
        if let Some(tail) = layout.tail_region()? {
            fills.push(tail);
        }
    }
    debug!(
        groups,
        records = records.len(),
        zero_fills = fills.len(),
        pre_zero,
        "grouped arguments built"
    );
    Ok(GroupedArgs {
        buffer: KernelArgBuffer::from_parts(records, fills),
        pre_zero,
    })
}
