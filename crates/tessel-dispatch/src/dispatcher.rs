//! The dispatch facade.
//!
//! Every entry point follows the same sequence: validate operands eagerly,
//! short-circuit zero-sized problems, build the argument buffer, select a
//! kernel, launch, and convert the f32 accumulator to the BF16 output.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use half::bf16;
use tessel_core::{DType, Device, Element, Tensor, F8E4M3};
use tessel_kernels::{GemmKernel, GemmOperands, KernelError, OperandView};
use tracing::{debug, warn};

use crate::config::DispatchConfig;
use crate::error::{invalid, DispatchError, Result};
use crate::grouped::{build_args, GroupLayout, RaggedDim};
use crate::key::ProblemShape;
use crate::operator::Operator;
use crate::select::{OperatorDispatch, RunCandidate, Selection, Stage};
use crate::tables::load_table_file;
use crate::tuning::TuningCache;
use crate::validate;

/// Operands of a grouped GEMM.
///
/// At most one of `m_sizes` and `offsets` may be set. Precision follows the
/// dtype of `a`: BF16, or F8E4M3 with both scale tensors.
#[derive(Debug, Clone, Copy)]
pub struct GroupedGemmArgs<'a> {
    pub a: &'a Tensor,
    pub b: &'a Tensor,
    /// I64 `[G]`: stacked group rows for a rank-2 A, valid rows per group
    /// for a rank-3 A.
    pub m_sizes: Option<&'a Tensor>,
    /// I32 `[G + 1]` boundaries along `ragged_dim`.
    pub offsets: Option<&'a Tensor>,
    pub ragged_dim: RaggedDim,
    pub a_scale: Option<&'a Tensor>,
    pub b_scale: Option<&'a Tensor>,
    /// Not supported; rejected when present.
    pub bias: Option<&'a Tensor>,
}

impl<'a> GroupedGemmArgs<'a> {
    pub fn new(a: &'a Tensor, b: &'a Tensor) -> Self {
        Self {
            a,
            b,
            m_sizes: None,
            offsets: None,
            ragged_dim: RaggedDim::M,
            a_scale: None,
            b_scale: None,
            bias: None,
        }
    }

    pub fn m_sizes(mut self, m_sizes: &'a Tensor) -> Self {
        self.m_sizes = Some(m_sizes);
        self
    }

    pub fn offsets(mut self, offsets: &'a Tensor, dim: RaggedDim) -> Self {
        self.offsets = Some(offsets);
        self.ragged_dim = dim;
        self
    }

    pub fn scales(mut self, a_scale: &'a Tensor, b_scale: &'a Tensor) -> Self {
        self.a_scale = Some(a_scale);
        self.b_scale = Some(b_scale);
        self
    }

    fn with_scales(self, scales: Option<(&'a Tensor, &'a Tensor)>) -> Self {
        match scales {
            Some((a, b)) => self.scales(a, b),
            None => self,
        }
    }
}

/// Selects and launches kernels for every operator.
#[derive(Debug)]
pub struct Dispatcher {
    config: DispatchConfig,
    operators: Vec<OperatorDispatch>,
    tuning: Option<Arc<TuningCache>>,
    warned_no_cache: AtomicBool,
}

impl Dispatcher {
    /// Built-in catalogs with preset tables, or tables from
    /// `config.tables_path` where the file names an operator.
    pub fn new(config: DispatchConfig) -> Result<Self> {
        let file = match &config.tables_path {
            Some(path) => Some(load_table_file(path)?),
            None => None,
        };
        if let Some(file) = &file {
            for name in file.keys() {
                if name.parse::<Operator>().is_err() {
                    warn!(operator = %name, "table file names an unknown operator, ignored");
                }
            }
        }
        let operators = Operator::ALL
            .iter()
            .map(|&op| {
                let od = OperatorDispatch::builtin(op)?;
                match file.as_ref().and_then(|f| f.get(op.name())) {
                    Some(spec) => od.with_tables(spec),
                    None => Ok(od),
                }
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            config,
            operators,
            tuning: None,
            warned_no_cache: AtomicBool::new(false),
        })
    }

    pub fn from_env() -> Result<Self> {
        Self::new(DispatchConfig::from_env())
    }

    /// Inject the cache used when tuning is enabled.
    pub fn with_tuning(mut self, cache: Arc<TuningCache>) -> Self {
        self.tuning = Some(cache);
        self
    }

    /// Replace one operator's catalog, tables and heuristic.
    pub fn with_operator(mut self, od: OperatorDispatch) -> Self {
        let slot = op_index(od.operator());
        self.operators[slot] = od;
        self
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    pub fn tuning(&self) -> Option<&Arc<TuningCache>> {
        self.tuning.as_ref()
    }

    pub fn operator(&self, op: Operator) -> &OperatorDispatch {
        &self.operators[op_index(op)]
    }

    /// Selection for a shape without launching; tuned winners already in
    /// the cache are honoured, nothing is measured.
    pub fn select(&self, op: Operator, shape: &ProblemShape) -> Result<Selection> {
        if shape.has_zero_dim() {
            return Err(DispatchError::InvalidArgument(format!(
                "cannot select a kernel for zero-sized shape {shape}"
            )));
        }
        let od = self.operator(op);
        let dims = [(shape.m, shape.n, shape.k)];
        if od.tables().lookup(shape).is_none() {
            if let Some(kernel) = self.tuning.as_ref().and_then(|c| c.get(op, shape)) {
                if kernel.supports(shape.m, shape.n, shape.k) {
                    return Ok(Selection {
                        kernel,
                        stage: Stage::Tuned,
                    });
                }
            }
        }
        od.select(shape, &dims, None)
    }

    // =========================================================================
    // Dense GEMM
    // =========================================================================

    /// `A [.., K] · B[N, K]^T` in BF16.
    pub fn gemm_bf16(&self, a: &Tensor, b: &Tensor, out: Option<&mut Tensor>) -> Result<Tensor> {
        validate::operand("a", a, DType::BF16)?;
        validate::operand("b", b, DType::BF16)?;
        let device = validate::same_device(&[("a", a), ("b", b)])?;
        let (m, n, k, out_dims) = dense_dims(a, b)?;
        if let Some(out) = out.as_deref() {
            validate::output(out, &out_dims, device)?;
        }

        let layout = dense_layout(m, n, k);
        let ops = GemmOperands::new(OperandView::from_tensor(a)?, OperandView::from_tensor(b)?);
        let acc = self.execute(Operator::Bf16, &layout, &ops)?;
        finish(&acc, &out_dims, device, out)
    }

    /// FP8 GEMM with rowwise scales: `out[i, j] = (xq · wq^T)[i, j] *
    /// x_scale[i] * w_scale[j]`.
    pub fn f8f8bf16_rowwise(
        &self,
        xq: &Tensor,
        wq: &Tensor,
        x_scale: &Tensor,
        w_scale: &Tensor,
        bias: Option<&Tensor>,
        out: Option<&mut Tensor>,
    ) -> Result<Tensor> {
        if bias.is_some() {
            return invalid!("bias is not supported by f8f8bf16_rowwise");
        }
        validate::operand("xq", xq, DType::F8E4M3)?;
        validate::operand("wq", wq, DType::F8E4M3)?;
        let device = validate::same_device(&[
            ("xq", xq),
            ("wq", wq),
            ("x_scale", x_scale),
            ("w_scale", w_scale),
        ])?;
        let (m, n, k, out_dims) = dense_dims(xq, wq)?;
        validate::scale("x_scale", x_scale, m)?;
        validate::scale("w_scale", w_scale, n)?;
        if let Some(out) = out.as_deref() {
            validate::output(out, &out_dims, device)?;
        }

        let layout = dense_layout(m, n, k);
        let ops = GemmOperands::new(OperandView::from_tensor(xq)?, OperandView::from_tensor(wq)?)
            .with_scales(x_scale.as_slice()?, w_scale.as_slice()?);
        let acc = self.execute(Operator::Fp8Rowwise, &layout, &ops)?;
        finish(&acc, &out_dims, device, out)
    }

    // =========================================================================
    // Grouped GEMM
    // =========================================================================

    /// General grouped GEMM; the layout follows from the descriptors and
    /// operand ranks.
    pub fn grouped_gemm(
        &self,
        args: &GroupedGemmArgs<'_>,
        out: Option<&mut Tensor>,
    ) -> Result<Tensor> {
        if args.bias.is_some() {
            return invalid!("bias is not supported by grouped GEMM");
        }
        let op = grouped_operator(args.a, args.b)?;
        validate::operand("a", args.a, args.a.dtype())?;
        validate::operand("b", args.b, args.a.dtype())?;
        let mut on_device = vec![("a", args.a), ("b", args.b)];
        on_device.extend(args.m_sizes.map(|t| ("m_sizes", t)));
        on_device.extend(args.offsets.map(|t| ("offsets", t)));
        on_device.extend(args.a_scale.map(|t| ("a_scale", t)));
        on_device.extend(args.b_scale.map(|t| ("b_scale", t)));
        let device = validate::same_device(&on_device)?;

        let layout = grouped_layout(args)?;
        let scales = match (op.is_fp8(), args.a_scale, args.b_scale) {
            (true, Some(sa), Some(sb)) => {
                let (a_len, b_len) = scale_lens(&layout);
                validate::grouped_scale("a_scale", sa, a_len)?;
                validate::grouped_scale("b_scale", sb, b_len)?;
                Some((sa.as_slice::<f32>()?, sb.as_slice::<f32>()?))
            }
            (true, _, _) => return invalid!("fp8 grouped GEMM requires a_scale and b_scale"),
            (false, None, None) => None,
            (false, _, _) => return invalid!("scales are only accepted for fp8 operands"),
        };
        let out_dims = layout.output_dims();
        if let Some(out) = out.as_deref() {
            validate::output(out, &out_dims, device)?;
        }
        if !layout.problem_shape().has_zero_dim() {
            self.check_min_tile(op, &layout)?;
        }

        let mut ops = GemmOperands::new(
            OperandView::from_tensor(args.a)?,
            OperandView::from_tensor(args.b)?,
        );
        if let Some((sa, sb)) = scales {
            ops = ops.with_scales(sa, sb);
        }
        let acc = self.execute(op, &layout, &ops)?;
        finish(&acc, &out_dims, device, out)
    }

    /// Ragged-M over a concatenated A `[ΣM, K]` split by `m_sizes`
    /// (I64 `[G]`); B is `[G, N, K]`, output `[ΣM, N]`.
    pub fn grouped_gemm_stacked(
        &self,
        a: &Tensor,
        b: &Tensor,
        m_sizes: &Tensor,
        scales: Option<(&Tensor, &Tensor)>,
        out: Option<&mut Tensor>,
    ) -> Result<Tensor> {
        validate::rank("a", a, &[2])?;
        let args = GroupedGemmArgs::new(a, b).m_sizes(m_sizes).with_scales(scales);
        self.grouped_gemm(&args, out)
    }

    /// Groups split along `dim` at `offsets` (I32 `[G + 1]`).
    pub fn grouped_gemm_ragged(
        &self,
        a: &Tensor,
        b: &Tensor,
        offsets: &Tensor,
        dim: RaggedDim,
        scales: Option<(&Tensor, &Tensor)>,
        out: Option<&mut Tensor>,
    ) -> Result<Tensor> {
        let args = GroupedGemmArgs::new(a, b).offsets(offsets, dim).with_scales(scales);
        self.grouped_gemm(&args, out)
    }

    /// Stacked-3D: A `[G, M, K]`, B `[G, N, K]`, output `[G, M, N]`, with
    /// optional per-group valid row counts.
    pub fn grouped_gemm_batched(
        &self,
        a: &Tensor,
        b: &Tensor,
        valid_rows: Option<&Tensor>,
        scales: Option<(&Tensor, &Tensor)>,
        out: Option<&mut Tensor>,
    ) -> Result<Tensor> {
        validate::rank("a", a, &[3])?;
        let mut args = GroupedGemmArgs::new(a, b).with_scales(scales);
        args.m_sizes = valid_rows;
        self.grouped_gemm(&args, out)
    }

    /// Independent problems `a[g] [M_g, K_g] · b[g] [N_g, K_g]^T`, one
    /// output per group. Operands are packed into one staging buffer so a
    /// single launch serves every group.
    pub fn grouped_gemm_list(
        &self,
        a: &[Tensor],
        b: &[Tensor],
        scales: Option<(&[Tensor], &[Tensor])>,
    ) -> Result<Vec<Tensor>> {
        if a.len() != b.len() {
            return invalid!("{} A tensors but {} B tensors", a.len(), b.len());
        }
        if a.is_empty() {
            return Ok(Vec::new());
        }
        let op = grouped_operator(&a[0], &b[0])?;
        let dtype = a[0].dtype();
        let mut on_device = Vec::with_capacity(4 * a.len());
        let mut shapes = Vec::with_capacity(a.len());
        for (g, (ag, bg)) in a.iter().zip(b).enumerate() {
            validate::operand("a[g]", ag, dtype)?;
            validate::operand("b[g]", bg, dtype)?;
            validate::rank("a[g]", ag, &[2])?;
            validate::rank("b[g]", bg, &[2])?;
            let (m, k) = (ag.dims()[0], ag.dims()[1]);
            let (n, kb) = (bg.dims()[0], bg.dims()[1]);
            if k != kb {
                return invalid!("group {g}: A has K={k} but B has K={kb}");
            }
            shapes.push((m, n, k));
            on_device.push(("a[g]", ag));
            on_device.push(("b[g]", bg));
        }
        let scale_slices = match (op.is_fp8(), scales) {
            (true, Some((sa, sb))) => {
                if sa.len() != a.len() || sb.len() != a.len() {
                    return invalid!("one scale tensor per group is required");
                }
                for (g, &(m, n, _)) in shapes.iter().enumerate() {
                    validate::scale("a_scale[g]", &sa[g], m)?;
                    validate::scale("b_scale[g]", &sb[g], n)?;
                    on_device.push(("a_scale[g]", &sa[g]));
                    on_device.push(("b_scale[g]", &sb[g]));
                }
                Some((pack::<f32>(sa)?, pack::<f32>(sb)?))
            }
            (true, None) => return invalid!("fp8 grouped GEMM requires a_scale and b_scale"),
            (false, None) => None,
            (false, Some(_)) => return invalid!("scales are only accepted for fp8 operands"),
        };
        let device = validate::same_device(&on_device)?;

        let layout = GroupLayout::packed(&shapes);
        if let Some(min) = self.operator(op).catalog().min_tile() {
            for (g, &(m, n, k)) in shapes.iter().enumerate() {
                if m > 0 && n > 0 && k > 0 && (n < min || k < min) {
                    return Err(DispatchError::UnsupportedConfiguration(format!(
                        "group {g}: N={n}, K={k} below the grouped minimum tile {min}"
                    )));
                }
            }
        }

        let acc = match dtype {
            DType::BF16 => {
                let (pa, pb) = (pack::<bf16>(a)?, pack::<bf16>(b)?);
                let ops = GemmOperands::new(OperandView::Bf16(&pa), OperandView::Bf16(&pb));
                self.execute(op, &layout, &ops)?
            }
            _ => {
                let (pa, pb) = (pack::<F8E4M3>(a)?, pack::<F8E4M3>(b)?);
                let mut ops =
                    GemmOperands::new(OperandView::F8E4M3(&pa), OperandView::F8E4M3(&pb));
                if let Some((sa, sb)) = &scale_slices {
                    ops = ops.with_scales(sa, sb);
                }
                self.execute(op, &layout, &ops)?
            }
        };

        let mut outputs = Vec::with_capacity(shapes.len());
        let mut offset = 0;
        for &(m, n, _) in &shapes {
            let values: Vec<bf16> = acc[offset..offset + m * n]
                .iter()
                .map(|&v| bf16::from_f32(v))
                .collect();
            outputs.push(Tensor::from_slice(&values, &[m, n])?.to_device(device));
            offset += m * n;
        }
        Ok(outputs)
    }

    // =========================================================================
    // Launch core
    // =========================================================================

    fn check_min_tile(&self, op: Operator, layout: &GroupLayout) -> Result<()> {
        let Some(min) = self.operator(op).catalog().min_tile() else {
            return Ok(());
        };
        let shape = layout.problem_shape();
        let (check_n, check_k) = match layout {
            GroupLayout::Ragged { dim: RaggedDim::N, .. } => (false, true),
            GroupLayout::Ragged { dim: RaggedDim::K, .. } => (true, false),
            _ => (true, true),
        };
        if (check_n && shape.n < min) || (check_k && shape.k < min) {
            return Err(DispatchError::UnsupportedConfiguration(format!(
                "{op} requires non-ragged N and K of at least {min}, got N={}, K={}",
                shape.n, shape.k
            )));
        }
        Ok(())
    }

    /// Build arguments, select, launch. Returns the f32 accumulator.
    fn execute(
        &self,
        op: Operator,
        layout: &GroupLayout,
        ops: &GemmOperands<'_>,
    ) -> Result<Vec<f32>> {
        let len = layout.output_len();
        let shape = layout.problem_shape();
        let dims = layout.group_dims();
        if shape.has_zero_dim() || dims.is_empty() {
            debug!(op = %op, shape = %shape, "zero-sized problem, no launch");
            return Ok(vec![0.0; len]);
        }

        let args = build_args(layout, self.config.zeroing, self.config.parallel_group_threshold)?;
        let od = self.operator(op);

        let selection = match self.tuning_cache() {
            Some(cache) => {
                let mut scratch = vec![0.0f32; len];
                let mut launch = |kernel: &dyn GemmKernel| -> std::result::Result<(), KernelError> {
                    scratch.fill(0.0);
                    kernel.launch(ops, &args.buffer, &mut scratch)
                };
                let run: RunCandidate<'_> = &mut launch;
                od.select(&shape, &dims, Some((cache, run)))?
            }
            None => od.select(&shape, &dims, None)?,
        };
        debug!(
            op = %op,
            shape = %shape,
            records = args.buffer.len(),
            kernel = selection.kernel.name(),
            stage = %selection.stage,
            "selected"
        );

        let mut acc = if args.pre_zero {
            vec![0.0f32; len]
        } else {
            // Anything the launch leaves untouched shows up as NaN.
            vec![f32::NAN; len]
        };
        selection.kernel.launch(ops, &args.buffer, &mut acc)?;
        Ok(acc)
    }

    fn tuning_cache(&self) -> Option<&TuningCache> {
        if !self.config.autotune_enabled() {
            return None;
        }
        match &self.tuning {
            Some(cache) => Some(cache.as_ref()),
            None => {
                if !self.warned_no_cache.swap(true, Ordering::Relaxed) {
                    warn!("autotuning enabled but no tuning cache was injected, using heuristics");
                }
                None
            }
        }
    }
}

fn op_index(op: Operator) -> usize {
    Operator::ALL.iter().position(|&o| o == op).unwrap_or(0)
}

/// `(M, N, K, output dims)` of `A [.., K] · B[N, K]^T`.
fn dense_dims(a: &Tensor, b: &Tensor) -> Result<(usize, usize, usize, Vec<usize>)> {
    if a.ndim() == 0 {
        return invalid!("a must have at least one dimension");
    }
    validate::rank("b", b, &[2])?;
    let (a_dims, b_dims) = (a.dims(), b.dims());
    let k = a_dims[a_dims.len() - 1];
    let (n, kb) = (b_dims[0], b_dims[1]);
    if k != kb {
        return invalid!("a has K={k} but b has K={kb}");
    }
    let m = a_dims[..a_dims.len() - 1].iter().product();
    let mut out_dims = a_dims[..a_dims.len() - 1].to_vec();
    out_dims.push(n);
    Ok((m, n, k, out_dims))
}

fn dense_layout(m: usize, n: usize, k: usize) -> GroupLayout {
    GroupLayout::Fixed {
        groups: 1,
        m,
        n,
        k,
        valid_rows: None,
    }
}

fn grouped_operator(a: &Tensor, b: &Tensor) -> Result<Operator> {
    let op = match a.dtype() {
        DType::BF16 => Operator::Bf16Grouped,
        DType::F8E4M3 => Operator::Fp8Grouped,
        other => return invalid!("grouped GEMM operands must be bf16 or f8e4m3, got {other}"),
    };
    if b.dtype() != a.dtype() {
        return invalid!("a is {} but b is {}", a.dtype(), b.dtype());
    }
    Ok(op)
}

/// Element counts of the A and B scale vectors for a layout.
fn scale_lens(layout: &GroupLayout) -> (usize, usize) {
    let g = layout.groups();
    match layout {
        GroupLayout::Fixed { m, n, .. } => (g * m, g * n),
        GroupLayout::Ragged {
            dim, extent, m, n, ..
        } => match dim {
            RaggedDim::M => (*extent, g * n),
            RaggedDim::N => (g * m, *extent),
            RaggedDim::K => (g * m, g * n),
        },
        GroupLayout::Packed { groups } => (
            groups.iter().map(|p| p.m).sum(),
            groups.iter().map(|p| p.n).sum(),
        ),
    }
}

/// Resolve descriptors and operand ranks into a layout.
fn grouped_layout(args: &GroupedGemmArgs<'_>) -> Result<GroupLayout> {
    let (a, b) = (args.a, args.b);
    match (args.m_sizes, args.offsets) {
        (Some(_), Some(_)) => invalid!("m_sizes and offsets are mutually exclusive"),
        (Some(m_sizes), None) => {
            let sizes = validate::descriptor("m_sizes", m_sizes, DType::I64)?;
            let sizes = sizes
                .iter()
                .map(|&s| usize::try_from(s))
                .collect::<std::result::Result<Vec<usize>, _>>()
                .or_else(|_| invalid!("m_sizes must be non-negative"))?;
            validate::rank("b", b, &[3])?;
            let (groups, n, kb) = (b.dims()[0], b.dims()[1], b.dims()[2]);
            if sizes.len() != groups {
                return invalid!("m_sizes has {} entries for {groups} groups", sizes.len());
            }
            match a.dims() {
                &[rows, k] => {
                    check_k(k, kb)?;
                    let total: usize = sizes.iter().sum();
                    if total > rows {
                        return invalid!("m_sizes sum to {total} but a has {rows} rows");
                    }
                    Ok(GroupLayout::Ragged {
                        dim: RaggedDim::M,
                        bounds: prefix_bounds(&sizes),
                        extent: rows,
                        m: 0,
                        n,
                        k,
                    })
                }
                &[ga, m, k] => {
                    check_k(k, kb)?;
                    if ga != groups {
                        return invalid!("a has {ga} groups but b has {groups}");
                    }
                    if let Some(g) = sizes.iter().position(|&s| s > m) {
                        return invalid!("m_sizes[{g}]={} exceeds M={m}", sizes[g]);
                    }
                    Ok(GroupLayout::Fixed {
                        groups,
                        m,
                        n,
                        k,
                        valid_rows: Some(sizes),
                    })
                }
                _ => invalid!("a must have rank 2 or 3, got shape {}", a.shape()),
            }
        }
        (None, Some(offsets)) => {
            let raw = validate::descriptor("offsets", offsets, DType::I32)?;
            let bounds = raw
                .iter()
                .map(|&s| usize::try_from(s))
                .collect::<std::result::Result<Vec<usize>, _>>()
                .or_else(|_| invalid!("offsets must be non-negative"))?;
            if bounds.first() != Some(&0) {
                return invalid!("offsets must start at 0");
            }
            if bounds.windows(2).any(|w| w[0] > w[1]) {
                return invalid!("offsets must be non-decreasing");
            }
            let groups = bounds.len() - 1;
            let end = bounds[groups];
            let layout = match args.ragged_dim {
                RaggedDim::M => {
                    validate::rank("a", a, &[2])?;
                    validate::rank("b", b, &[3])?;
                    let (rows, k) = (a.dims()[0], a.dims()[1]);
                    let (gb, n, kb) = (b.dims()[0], b.dims()[1], b.dims()[2]);
                    check_k(k, kb)?;
                    check_groups(groups, gb)?;
                    check_extent(end, rows, "rows of a")?;
                    GroupLayout::Ragged {
                        dim: RaggedDim::M,
                        bounds,
                        extent: rows,
                        m: 0,
                        n,
                        k,
                    }
                }
                RaggedDim::N => {
                    validate::rank("a", a, &[3])?;
                    validate::rank("b", b, &[2])?;
                    let (ga, m, k) = (a.dims()[0], a.dims()[1], a.dims()[2]);
                    let (total_n, kb) = (b.dims()[0], b.dims()[1]);
                    check_k(k, kb)?;
                    check_groups(groups, ga)?;
                    check_extent(end, total_n, "rows of b")?;
                    GroupLayout::Ragged {
                        dim: RaggedDim::N,
                        bounds,
                        extent: total_n,
                        m,
                        n: 0,
                        k,
                    }
                }
                RaggedDim::K => {
                    validate::rank("a", a, &[2])?;
                    validate::rank("b", b, &[2])?;
                    let (m, total_k) = (a.dims()[0], a.dims()[1]);
                    let (n, kb) = (b.dims()[0], b.dims()[1]);
                    check_k(total_k, kb)?;
                    check_extent(end, total_k, "columns of a")?;
                    GroupLayout::Ragged {
                        dim: RaggedDim::K,
                        bounds,
                        extent: total_k,
                        m,
                        n,
                        k: 0,
                    }
                }
            };
            Ok(layout)
        }
        (None, None) => {
            if a.ndim() != 3 {
                return invalid!(
                    "a of shape {} needs m_sizes or offsets to define groups",
                    a.shape()
                );
            }
            validate::rank("b", b, &[3])?;
            let (ga, m, k) = (a.dims()[0], a.dims()[1], a.dims()[2]);
            let (gb, n, kb) = (b.dims()[0], b.dims()[1], b.dims()[2]);
            check_k(k, kb)?;
            check_groups(ga, gb)?;
            Ok(GroupLayout::Fixed {
                groups: ga,
                m,
                n,
                k,
                valid_rows: None,
            })
        }
    }
}

fn check_k(ka: usize, kb: usize) -> Result<()> {
    if ka != kb {
        return invalid!("a has K={ka} but b has K={kb}");
    }
    Ok(())
}

fn check_groups(expected: usize, got: usize) -> Result<()> {
    if expected != got {
        return invalid!("descriptor defines {expected} groups but operand has {got}");
    }
    Ok(())
}

fn check_extent(end: usize, extent: usize, what: &str) -> Result<()> {
    if end != extent {
        return invalid!("offsets end at {end} but there are {extent} {what}");
    }
    Ok(())
}

fn prefix_bounds(sizes: &[usize]) -> Vec<usize> {
    let mut bounds = Vec::with_capacity(sizes.len() + 1);
    let mut acc = 0;
    bounds.push(0);
    for &s in sizes {
        acc += s;
        bounds.push(acc);
    }
    bounds
}

/// Concatenate contiguous tensors of one element type.
fn pack<T: Element>(tensors: &[Tensor]) -> Result<Vec<T>> {
    let total = tensors.iter().map(Tensor::numel).sum();
    let mut packed = Vec::with_capacity(total);
    for t in tensors {
        packed.extend_from_slice(t.as_slice::<T>()?);
    }
    Ok(packed)
}

/// Convert the accumulator into the BF16 result, writing into `out` when
/// the caller supplied one.
fn finish(acc: &[f32], dims: &[usize], device: Device, out: Option<&mut Tensor>) -> Result<Tensor> {
    match out {
        Some(out) => {
            let dst = out.as_slice_mut::<bf16>()?;
            for (d, &v) in dst.iter_mut().zip(acc) {
                *d = bf16::from_f32(v);
            }
            Ok(out.clone())
        }
        None => {
            let values: Vec<bf16> = acc.iter().map(|&v| bf16::from_f32(v)).collect();
            Ok(Tensor::from_slice(&values, dims)?.to_device(device))
        }
    }
}
