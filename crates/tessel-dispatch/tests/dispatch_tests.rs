//! End-to-end tests of the dispatch facade against host references.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tessel_core::{DType, Device, Tensor};
use tessel_dispatch::{
    DispatchConfig, DispatchError, Dispatcher, GroupedGemmArgs, KernelTimer, Operator,
    OperatorDispatch, ProblemShape, RaggedDim, ShapeTables, Stage, TableSpec, TuningCache,
    ZeroingMode,
};
use tessel_kernels::{
    Epilogue, GemmKernel, GemmOperands, KernelArgBuffer, KernelCatalog, KernelConfig, KernelError,
};

fn config(zeroing: ZeroingMode) -> DispatchConfig {
    DispatchConfig {
        autotune: Some(false),
        zeroing,
        ..Default::default()
    }
}

fn dispatcher() -> Dispatcher {
    Dispatcher::new(config(ZeroingMode::PreZero)).unwrap()
}

fn random(rng: &mut StdRng, len: usize) -> Vec<f32> {
    (0..len).map(|_| rng.gen_range(-1.0f32..1.0)).collect()
}

fn bf16(rng: &mut StdRng, shape: &[usize]) -> Tensor {
    let len = shape.iter().product();
    Tensor::from_f32_as(&random(rng, len), shape, DType::BF16).unwrap()
}

fn i64s(values: &[i64]) -> Tensor {
    Tensor::from_slice(values, &[values.len()]).unwrap()
}

fn i32s(values: &[i32]) -> Tensor {
    Tensor::from_slice(values, &[values.len()]).unwrap()
}

/// `A [m, k] · B [n, k]^T` in f64, read with row strides `lda`/`ldb`.
fn reference(
    a: &[f32],
    lda: usize,
    b: &[f32],
    ldb: usize,
    m: usize,
    n: usize,
    k: usize,
) -> Vec<f32> {
    let mut c = vec![0.0f32; m * n];
    for i in 0..m {
        for j in 0..n {
            let mut acc = 0.0f64;
            for p in 0..k {
                acc += a[i * lda + p] as f64 * b[j * ldb + p] as f64;
            }
            c[i * n + j] = acc as f32;
        }
    }
    c
}

fn assert_close(got: &[f32], want: &[f32], tol: f32) {
    assert_eq!(got.len(), want.len(), "length mismatch: {} vs {}", got.len(), want.len());
    for (i, (x, y)) in got.iter().zip(want.iter()).enumerate() {
        assert!(
            (x - y).abs() <= tol * y.abs().max(1.0),
            "element {} differs: {} vs {} (tol={})",
            i, x, y, tol
        );
    }
}

// ============================================================================
// Launch counting
// ============================================================================

#[derive(Debug)]
struct CountingKernel {
    inner: Arc<dyn GemmKernel>,
    launches: Arc<AtomicUsize>,
}

impl GemmKernel for CountingKernel {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn config(&self) -> &KernelConfig {
        self.inner.config()
    }

    fn epilogue(&self) -> Epilogue {
        self.inner.epilogue()
    }

    fn launch(
        &self,
        operands: &GemmOperands<'_>,
        args: &KernelArgBuffer,
        out: &mut [f32],
    ) -> Result<(), KernelError> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        self.inner.launch(operands, args, out)
    }
}

fn counting(op: Operator) -> (Dispatcher, Arc<AtomicUsize>) {
    let launches = Arc::new(AtomicUsize::new(0));
    let shared = launches.clone();
    let catalog = op
        .catalog()
        .unwrap()
        .map_kernels(move |k| {
            Arc::new(CountingKernel {
                inner: k.clone(),
                launches: shared.clone(),
            }) as Arc<dyn GemmKernel>
        })
        .unwrap();
    let od = OperatorDispatch::new(op, catalog, &op.preset_tables(), &op.preset_rules()).unwrap();
    (dispatcher().with_operator(od), launches)
}

// ============================================================================
// Dense GEMM
// ============================================================================

#[test]
fn bf16_gemm_matches_reference() {
    let mut rng = StdRng::seed_from_u64(7);
    let a = bf16(&mut rng, &[128, 256]);
    let b = bf16(&mut rng, &[64, 256]);
    let d = dispatcher();

    let sel = d.select(Operator::Bf16, &ProblemShape::new(128, 64, 256)).unwrap();
    assert_eq!(sel.stage, Stage::Heuristic);
    assert!(sel.kernel.supports(128, 64, 256));

    let y = d.gemm_bf16(&a, &b, None).unwrap();
    assert_eq!(y.dims(), &[128, 64]);
    assert_eq!(y.dtype(), DType::BF16);
    let want = reference(
        &a.to_f32_vec().unwrap(),
        256,
        &b.to_f32_vec().unwrap(),
        256,
        128,
        64,
        256,
    );
    assert_close(&y.to_f32_vec().unwrap(), &want, 1e-2);
}

#[test]
fn bf16_gemm_flattens_leading_dims_into_out() {
    let mut rng = StdRng::seed_from_u64(8);
    let a = bf16(&mut rng, &[2, 3, 64]);
    let b = bf16(&mut rng, &[16, 64]);
    let mut out = Tensor::zeros(&[2, 3, 16], DType::BF16);
    let d = dispatcher();
    let y = d.gemm_bf16(&a, &b, Some(&mut out)).unwrap();
    assert_eq!(y.dims(), &[2, 3, 16]);
    let want = reference(&a.to_f32_vec().unwrap(), 64, &b.to_f32_vec().unwrap(), 64, 6, 16, 64);
    assert_close(&out.to_f32_vec().unwrap(), &want, 1e-2);
    assert_eq!(out.to_f32_vec().unwrap(), y.to_f32_vec().unwrap());
}

#[test]
fn fp8_rowwise_applies_scales() {
    let mut rng = StdRng::seed_from_u64(9);
    let (m, n, k) = (32, 48, 64);
    let xq = Tensor::from_f32_as(&random(&mut rng, m * k), &[m, k], DType::F8E4M3).unwrap();
    let wq = Tensor::from_f32_as(&random(&mut rng, n * k), &[n, k], DType::F8E4M3).unwrap();
    let xs: Vec<f32> = (0..m).map(|_| rng.gen_range(0.5f32..1.5)).collect();
    let ws: Vec<f32> = (0..n).map(|_| rng.gen_range(0.5f32..1.5)).collect();
    let x_scale = Tensor::from_slice(&xs, &[m]).unwrap();
    let w_scale = Tensor::from_slice(&ws, &[n, 1]).unwrap();

    let y = dispatcher()
        .f8f8bf16_rowwise(&xq, &wq, &x_scale, &w_scale, None, None)
        .unwrap();
    assert_eq!(y.dims(), &[m, n]);
    let mut want = reference(&xq.to_f32_vec().unwrap(), k, &wq.to_f32_vec().unwrap(), k, m, n, k);
    for i in 0..m {
        for j in 0..n {
            want[i * n + j] *= xs[i] * ws[j];
        }
    }
    assert_close(&y.to_f32_vec().unwrap(), &want, 1e-2);
}

#[test]
fn fp8_rowwise_rejects_bias_and_bad_scales() {
    let xq = Tensor::zeros(&[16, 32], DType::F8E4M3);
    let wq = Tensor::zeros(&[16, 32], DType::F8E4M3);
    let good = Tensor::zeros(&[16], DType::F32);
    let short = Tensor::zeros(&[15], DType::F32);
    let bias = Tensor::zeros(&[16], DType::BF16);
    let d = dispatcher();
    let err = d.f8f8bf16_rowwise(&xq, &wq, &good, &good, Some(&bias), None).unwrap_err();
    assert!(matches!(err, DispatchError::InvalidArgument(_)));
    let err = d.f8f8bf16_rowwise(&xq, &wq, &short, &good, None, None).unwrap_err();
    assert!(matches!(err, DispatchError::InvalidArgument(_)));
    // A per-group block is only meaningful for grouped calls.
    let blocked = Tensor::zeros(&[2, 8], DType::F32);
    let err = d.f8f8bf16_rowwise(&xq, &wq, &blocked, &good, None, None).unwrap_err();
    assert!(matches!(err, DispatchError::InvalidArgument(_)));
}

#[test]
fn zero_sized_problems_launch_nothing() {
    let (d, launches) = counting(Operator::Bf16);

    let empty_m = Tensor::zeros(&[0, 256], DType::BF16);
    let y = d.gemm_bf16(&empty_m, &Tensor::zeros(&[64, 256], DType::BF16), None).unwrap();
    assert_eq!(y.dims(), &[0, 64]);

    let empty_k = Tensor::zeros(&[4, 0], DType::BF16);
    let y = d.gemm_bf16(&empty_k, &Tensor::zeros(&[8, 0], DType::BF16), None).unwrap();
    assert_eq!(y.dims(), &[4, 8]);
    assert!(y.to_f32_vec().unwrap().iter().all(|&v| v == 0.0));
    assert_eq!(launches.load(Ordering::SeqCst), 0);

    let mut rng = StdRng::seed_from_u64(1);
    d.gemm_bf16(&bf16(&mut rng, &[4, 16]), &bf16(&mut rng, &[8, 16]), None)
        .unwrap();
    assert_eq!(launches.load(Ordering::SeqCst), 1);

    let err = d.select(Operator::Bf16, &ProblemShape::new(0, 8, 8)).unwrap_err();
    assert!(matches!(err, DispatchError::InvalidArgument(_)));
}

#[test]
fn operand_checks_are_eager() {
    let mut rng = StdRng::seed_from_u64(2);
    let a = bf16(&mut rng, &[8, 16]);
    let b = bf16(&mut rng, &[16, 16]);
    let d = dispatcher();

    let on_gpu = b.to_device(Device::Cuda(0));
    let err = d.gemm_bf16(&a, &on_gpu, None).unwrap_err();
    assert!(matches!(err, DispatchError::InvalidArgument(_)));

    let strided = bf16(&mut rng, &[16, 16]).transpose().unwrap();
    assert!(!strided.is_contiguous());
    let err = d.gemm_bf16(&a, &strided, None).unwrap_err();
    assert!(matches!(err, DispatchError::InvalidArgument(_)));

    let f32_a = Tensor::zeros(&[8, 16], DType::F32);
    let err = d.gemm_bf16(&f32_a, &b, None).unwrap_err();
    assert!(matches!(err, DispatchError::InvalidArgument(_)));

    let mismatched_k = bf16(&mut rng, &[16, 8]);
    let err = d.gemm_bf16(&a, &mismatched_k, None).unwrap_err();
    assert!(matches!(err, DispatchError::InvalidArgument(_)));

    let mut wrong_out = Tensor::zeros(&[8, 15], DType::BF16);
    let err = d.gemm_bf16(&a, &b, Some(&mut wrong_out)).unwrap_err();
    assert!(matches!(err, DispatchError::InvalidArgument(_)));
}

#[test]
fn device_tag_is_carried_to_the_output() {
    let mut rng = StdRng::seed_from_u64(3);
    let a = bf16(&mut rng, &[8, 16]).to_device(Device::Cuda(1));
    let b = bf16(&mut rng, &[16, 16]).to_device(Device::Cuda(1));
    let y = dispatcher().gemm_bf16(&a, &b, None).unwrap();
    assert_eq!(y.device(), Device::Cuda(1));
}

// ============================================================================
// Selection stages
// ============================================================================

#[test]
fn table_stages_follow_bucketing() {
    let d = dispatcher();
    // M = 100 buckets to 128 and hits the exact entry.
    let sel = d.select(Operator::Bf16, &ProblemShape::new(100, 4096, 4096)).unwrap();
    assert_eq!(sel.stage, Stage::ExactTable);
    // M above the last bucket is kept and falls to the family table.
    let sel = d.select(Operator::Bf16, &ProblemShape::new(300, 4096, 4096)).unwrap();
    assert_eq!(sel.stage, Stage::FamilyTable);
    // N not a multiple of the vector width.
    let sel = d.select(Operator::Bf16, &ProblemShape::new(64, 4095, 4096)).unwrap();
    assert_eq!(sel.stage, Stage::AlignmentGuard);
    assert_eq!(sel.kernel.name(), d.operator(Operator::Bf16).catalog().safe_kernel().name());
}

// ============================================================================
// Tuning
// ============================================================================

struct PreferTimer {
    preferred: String,
}

impl KernelTimer for PreferTimer {
    fn time(
        &self,
        kernel: &dyn GemmKernel,
        _run: &mut dyn FnMut() -> Result<(), KernelError>,
    ) -> Result<Duration, KernelError> {
        let micros = if kernel.name() == self.preferred { 5 } else { 100 };
        Ok(Duration::from_micros(micros))
    }
}

#[test]
fn tuning_measures_once_per_rounded_shape() {
    let catalog = KernelCatalog::bf16().unwrap();
    let preferred = catalog
        .kernels()
        .iter()
        .rev()
        .find(|k| k.supports(128, 64, 256) && k.supports(100, 64, 256))
        .unwrap()
        .name()
        .to_string();
    let cache = Arc::new(TuningCache::with_timer(PreferTimer {
        preferred: preferred.clone(),
    }));
    let d = Dispatcher::new(DispatchConfig {
        autotune: Some(true),
        ..Default::default()
    })
    .unwrap()
    .with_tuning(cache.clone());

    let mut rng = StdRng::seed_from_u64(4);
    let a = bf16(&mut rng, &[128, 256]);
    let b = bf16(&mut rng, &[64, 256]);
    let first = d.gemm_bf16(&a, &b, None).unwrap();
    let second = d.gemm_bf16(&a, &b, None).unwrap();
    assert_eq!(first.to_f32_vec().unwrap(), second.to_f32_vec().unwrap());

    let stats = cache.stats();
    assert_eq!(stats.measurements, 1);
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.hits, 1);
    assert_eq!(cache.len(), 1);

    let sel = d.select(Operator::Bf16, &ProblemShape::new(128, 64, 256)).unwrap();
    assert_eq!(sel.stage, Stage::Tuned);
    assert_eq!(sel.kernel.name(), preferred);

    // M = 100 rounds to the same tuning key.
    d.gemm_bf16(&bf16(&mut rng, &[100, 256]), &b, None).unwrap();
    assert_eq!(cache.stats().measurements, 1);
    assert_eq!(cache.stats().hits, 2);
}

#[test]
fn tuning_without_cache_uses_heuristics() {
    let d = Dispatcher::new(DispatchConfig {
        autotune: Some(true),
        ..Default::default()
    })
    .unwrap();
    let mut rng = StdRng::seed_from_u64(5);
    let y = d.gemm_bf16(&bf16(&mut rng, &[16, 32]), &bf16(&mut rng, &[8, 32]), None).unwrap();
    assert_eq!(y.dims(), &[16, 8]);
}

// ============================================================================
// Grouped GEMM
// ============================================================================

#[test]
fn batched_valid_rows_zero_fill_skipped_rows() {
    let mut rng = StdRng::seed_from_u64(10);
    let (g, m, n, k) = (4, 5, 512, 512);
    let a = bf16(&mut rng, &[g, m, k]);
    let b = bf16(&mut rng, &[g, n, k]);
    let valid = i64s(&[0, 5, 0, 3]);
    let (af, bf) = (a.to_f32_vec().unwrap(), b.to_f32_vec().unwrap());

    for zeroing in [ZeroingMode::PreZero, ZeroingMode::InPass] {
        let d = Dispatcher::new(config(zeroing)).unwrap();
        let y = d.grouped_gemm_batched(&a, &b, Some(&valid), None, None).unwrap();
        assert_eq!(y.dims(), &[g, m, n]);
        let y = y.to_f32_vec().unwrap();
        assert!(y.iter().all(|v| v.is_finite()));

        for (gi, rows) in [0usize, 5, 0, 3].into_iter().enumerate() {
            let block = &y[gi * m * n..(gi + 1) * m * n];
            let want = reference(&af[gi * m * k..], k, &bf[gi * n * k..], k, rows, n, k);
            assert_close(&block[..rows * n], &want, 1e-2);
            assert!(block[rows * n..].iter().all(|&v| v == 0.0), "group {gi} tail not zeroed");
        }
    }
}

#[test]
fn ragged_m_offsets_with_empty_group() {
    let mut rng = StdRng::seed_from_u64(11);
    let (n, k) = (512, 512);
    let a = bf16(&mut rng, &[25, k]);
    let b = bf16(&mut rng, &[3, n, k]);
    let offsets = i32s(&[0, 10, 10, 25]);
    let (af, bf) = (a.to_f32_vec().unwrap(), b.to_f32_vec().unwrap());

    let pre = Dispatcher::new(config(ZeroingMode::PreZero))
        .unwrap()
        .grouped_gemm_ragged(&a, &b, &offsets, RaggedDim::M, None, None)
        .unwrap();
    let in_pass = Dispatcher::new(config(ZeroingMode::InPass))
        .unwrap()
        .grouped_gemm_ragged(&a, &b, &offsets, RaggedDim::M, None, None)
        .unwrap();
    assert_eq!(pre.dims(), &[25, n]);
    let y = pre.to_f32_vec().unwrap();
    assert_eq!(y, in_pass.to_f32_vec().unwrap());

    let g0 = reference(&af, k, &bf, k, 10, n, k);
    let g2 = reference(&af[10 * k..], k, &bf[2 * n * k..], k, 15, n, k);
    assert_close(&y[..10 * n], &g0, 1e-2);
    assert_close(&y[10 * n..], &g2, 1e-2);
}

#[test]
fn stacked_m_sizes_zero_trailing_rows() {
    let mut rng = StdRng::seed_from_u64(12);
    let (n, k) = (512, 512);
    let a = bf16(&mut rng, &[10, k]);
    let b = bf16(&mut rng, &[2, n, k]);
    let m_sizes = i64s(&[3, 4]);
    let (af, bf) = (a.to_f32_vec().unwrap(), b.to_f32_vec().unwrap());

    let d = Dispatcher::new(config(ZeroingMode::InPass)).unwrap();
    let y = d.grouped_gemm_stacked(&a, &b, &m_sizes, None, None).unwrap();
    assert_eq!(y.dims(), &[10, n]);
    let y = y.to_f32_vec().unwrap();
    assert_close(&y[..3 * n], &reference(&af, k, &bf, k, 3, n, k), 1e-2);
    assert_close(
        &y[3 * n..7 * n],
        &reference(&af[3 * k..], k, &bf[n * k..], k, 4, n, k),
        1e-2,
    );
    assert!(y[7 * n..].iter().all(|&v| v == 0.0));

    let too_many = i64s(&[6, 6]);
    let err = d.grouped_gemm_stacked(&a, &b, &too_many, None, None).unwrap_err();
    assert!(matches!(err, DispatchError::InvalidArgument(_)));
}

#[test]
fn ragged_n_writes_column_blocks() {
    let mut rng = StdRng::seed_from_u64(13);
    let (m, k) = (4, 512);
    let a = bf16(&mut rng, &[2, m, k]);
    let b = bf16(&mut rng, &[24, k]);
    let offsets = i32s(&[0, 16, 24]);
    let (af, bf) = (a.to_f32_vec().unwrap(), b.to_f32_vec().unwrap());

    let y = dispatcher()
        .grouped_gemm_ragged(&a, &b, &offsets, RaggedDim::N, None, None)
        .unwrap();
    assert_eq!(y.dims(), &[m, 24]);
    let y = y.to_f32_vec().unwrap();
    let g0 = reference(&af, k, &bf, k, m, 16, k);
    let g1 = reference(&af[m * k..], k, &bf[16 * k..], k, m, 8, k);
    for i in 0..m {
        assert_close(&y[i * 24..i * 24 + 16], &g0[i * 16..(i + 1) * 16], 1e-2);
        assert_close(&y[i * 24 + 16..(i + 1) * 24], &g1[i * 8..(i + 1) * 8], 1e-2);
    }
}

#[test]
fn ragged_k_accumulates_segments() {
    let mut rng = StdRng::seed_from_u64(14);
    let (m, n, total_k) = (4, 512, 40);
    let a = bf16(&mut rng, &[m, total_k]);
    let b = bf16(&mut rng, &[n, total_k]);
    let offsets = i32s(&[0, 16, 16, 40]);

    for zeroing in [ZeroingMode::PreZero, ZeroingMode::InPass] {
        let y = Dispatcher::new(config(zeroing))
            .unwrap()
            .grouped_gemm_ragged(&a, &b, &offsets, RaggedDim::K, None, None)
            .unwrap();
        assert_eq!(y.dims(), &[m, n]);
        let want = reference(
            &a.to_f32_vec().unwrap(),
            total_k,
            &b.to_f32_vec().unwrap(),
            total_k,
            m,
            n,
            total_k,
        );
        assert_close(&y.to_f32_vec().unwrap(), &want, 1e-2);
    }
}

#[test]
fn grouped_general_entry_point() {
    let mut rng = StdRng::seed_from_u64(15);
    let a = bf16(&mut rng, &[2, 3, 512]);
    let b = bf16(&mut rng, &[2, 512, 512]);
    let y = dispatcher()
        .grouped_gemm(&GroupedGemmArgs::new(&a, &b), None)
        .unwrap();
    assert_eq!(y.dims(), &[2, 3, 512]);

    let m_sizes = i64s(&[1, 1]);
    let offsets = i32s(&[0, 1, 2]);
    let both = GroupedGemmArgs::new(&a, &b)
        .m_sizes(&m_sizes)
        .offsets(&offsets, RaggedDim::M);
    let err = dispatcher().grouped_gemm(&both, None).unwrap_err();
    assert!(matches!(err, DispatchError::InvalidArgument(_)));
}

#[test]
fn grouped_small_tiles_are_unsupported() {
    let mut rng = StdRng::seed_from_u64(16);
    let a = bf16(&mut rng, &[2, 4, 256]);
    let b = bf16(&mut rng, &[2, 512, 256]);
    let err = dispatcher().grouped_gemm_batched(&a, &b, None, None, None).unwrap_err();
    assert!(matches!(err, DispatchError::UnsupportedConfiguration(_)));
}

#[test]
fn grouped_offsets_must_be_well_formed() {
    let mut rng = StdRng::seed_from_u64(17);
    let a = bf16(&mut rng, &[8, 512]);
    let b = bf16(&mut rng, &[2, 512, 512]);
    let d = dispatcher();
    for bad in [&[1, 4, 8][..], &[0, 5, 4], &[0, 4, 7]] {
        let err = d
            .grouped_gemm_ragged(&a, &b, &i32s(bad), RaggedDim::M, None, None)
            .unwrap_err();
        assert!(matches!(err, DispatchError::InvalidArgument(_)), "{bad:?}");
    }
    let wrong_dtype = i64s(&[0, 4, 8]);
    assert!(d
        .grouped_gemm_ragged(&a, &b, &wrong_dtype, RaggedDim::M, None, None)
        .is_err());
}

#[test]
fn grouped_fp8_requires_scales() {
    let a = Tensor::zeros(&[2, 4, 512], DType::F8E4M3);
    let b = Tensor::zeros(&[2, 512, 512], DType::F8E4M3);
    let err = dispatcher().grouped_gemm_batched(&a, &b, None, None, None).unwrap_err();
    assert!(matches!(err, DispatchError::InvalidArgument(_)));

    let sa = Tensor::from_slice(&[1.0f32; 8], &[8]).unwrap();
    let sb = Tensor::from_slice(&[1.0f32; 1024], &[2, 512]).unwrap();
    let y = dispatcher()
        .grouped_gemm_batched(&a, &b, None, Some((&sa, &sb)), None)
        .unwrap();
    assert!(y.to_f32_vec().unwrap().iter().all(|&v| v == 0.0));
}

fn fp8(rng: &mut StdRng, shape: &[usize]) -> Tensor {
    let len = shape.iter().product();
    Tensor::from_f32_as(&random(rng, len), shape, DType::F8E4M3).unwrap()
}

fn scales(rng: &mut StdRng, len: usize) -> Vec<f32> {
    (0..len).map(|_| rng.gen_range(0.25f32..2.0)).collect()
}

/// Apply rowwise scales to a `[rows, cols]` reference block.
fn scale_block(block: &mut [f32], cols: usize, row_scale: &[f32], col_scale: &[f32]) {
    for (i, row) in block.chunks_mut(cols).enumerate() {
        for (j, v) in row.iter_mut().enumerate() {
            *v *= row_scale[i] * col_scale[j];
        }
    }
}

#[test]
fn grouped_fp8_ragged_m_applies_group_scales() {
    let mut rng = StdRng::seed_from_u64(21);
    let (n, k) = (512, 512);
    let a = fp8(&mut rng, &[25, k]);
    let b = fp8(&mut rng, &[3, n, k]);
    let sa = scales(&mut rng, 25);
    let sb = scales(&mut rng, 3 * n);
    let (a_scale, b_scale) = (
        Tensor::from_slice(&sa, &[25]).unwrap(),
        Tensor::from_slice(&sb, &[3, n]).unwrap(),
    );
    let offsets = i32s(&[0, 10, 10, 25]);
    let (af, bf) = (a.to_f32_vec().unwrap(), b.to_f32_vec().unwrap());

    for zeroing in [ZeroingMode::PreZero, ZeroingMode::InPass] {
        let y = Dispatcher::new(config(zeroing))
            .unwrap()
            .grouped_gemm_ragged(&a, &b, &offsets, RaggedDim::M, Some((&a_scale, &b_scale)), None)
            .unwrap();
        assert_eq!(y.dims(), &[25, n]);
        let y = y.to_f32_vec().unwrap();
        for (g, start, rows) in [(0usize, 0usize, 10usize), (2, 10, 15)] {
            let mut want = reference(&af[start * k..], k, &bf[g * n * k..], k, rows, n, k);
            scale_block(&mut want, n, &sa[start..], &sb[g * n..]);
            assert_close(&y[start * n..(start + rows) * n], &want, 1e-2);
        }
    }
}

#[test]
fn grouped_fp8_ragged_n_applies_group_scales() {
    let mut rng = StdRng::seed_from_u64(22);
    let (m, k) = (6, 512);
    let a = fp8(&mut rng, &[2, m, k]);
    let b = fp8(&mut rng, &[24, k]);
    let sa = scales(&mut rng, 2 * m);
    let sb = scales(&mut rng, 24);
    let (a_scale, b_scale) = (
        Tensor::from_slice(&sa, &[2, m]).unwrap(),
        Tensor::from_slice(&sb, &[24, 1]).unwrap(),
    );
    let offsets = i32s(&[0, 16, 24]);
    let (af, bf) = (a.to_f32_vec().unwrap(), b.to_f32_vec().unwrap());

    let y = dispatcher()
        .grouped_gemm_ragged(&a, &b, &offsets, RaggedDim::N, Some((&a_scale, &b_scale)), None)
        .unwrap();
    assert_eq!(y.dims(), &[m, 24]);
    let y = y.to_f32_vec().unwrap();
    for (g, start, cols) in [(0usize, 0usize, 16usize), (1, 16, 8)] {
        let mut want = reference(&af[g * m * k..], k, &bf[start * k..], k, m, cols, k);
        scale_block(&mut want, cols, &sa[g * m..], &sb[start..]);
        for i in 0..m {
            assert_close(
                &y[i * 24 + start..i * 24 + start + cols],
                &want[i * cols..(i + 1) * cols],
                1e-2,
            );
        }
    }
}

#[test]
fn grouped_fp8_list_applies_group_scales() {
    let mut rng = StdRng::seed_from_u64(23);
    let shapes = [(3usize, 512usize, 512usize), (5, 576, 640)];
    let a: Vec<Tensor> = shapes.iter().map(|&(m, _, k)| fp8(&mut rng, &[m, k])).collect();
    let b: Vec<Tensor> = shapes.iter().map(|&(_, n, k)| fp8(&mut rng, &[n, k])).collect();
    let sa: Vec<Vec<f32>> = shapes.iter().map(|&(m, _, _)| scales(&mut rng, m)).collect();
    let sb: Vec<Vec<f32>> = shapes.iter().map(|&(_, n, _)| scales(&mut rng, n)).collect();
    let sa_t: Vec<Tensor> = sa.iter().map(|s| Tensor::from_slice(s, &[s.len()]).unwrap()).collect();
    let sb_t: Vec<Tensor> = sb.iter().map(|s| Tensor::from_slice(s, &[s.len()]).unwrap()).collect();

    let outs = Dispatcher::new(config(ZeroingMode::InPass))
        .unwrap()
        .grouped_gemm_list(&a, &b, Some((&sa_t, &sb_t)))
        .unwrap();
    for (g, &(m, n, k)) in shapes.iter().enumerate() {
        assert_eq!(outs[g].dims(), &[m, n]);
        let mut want = reference(
            &a[g].to_f32_vec().unwrap(),
            k,
            &b[g].to_f32_vec().unwrap(),
            k,
            m,
            n,
            k,
        );
        scale_block(&mut want, n, &sa[g], &sb[g]);
        assert_close(&outs[g].to_f32_vec().unwrap(), &want, 1e-2);
    }
}

#[test]
fn grouped_list_returns_one_output_per_group() {
    let mut rng = StdRng::seed_from_u64(18);
    let k = 512;
    let a = vec![bf16(&mut rng, &[3, k]), bf16(&mut rng, &[0, k]), bf16(&mut rng, &[2, k])];
    let b = vec![bf16(&mut rng, &[512, k]), bf16(&mut rng, &[512, k]), bf16(&mut rng, &[576, k])];
    let (launches_d, launches) = counting(Operator::Bf16Grouped);
    let outs = launches_d.grouped_gemm_list(&a, &b, None).unwrap();
    assert_eq!(launches.load(Ordering::SeqCst), 1);

    assert_eq!(outs.len(), 3);
    assert_eq!(outs[0].dims(), &[3, 512]);
    assert_eq!(outs[1].dims(), &[0, 512]);
    assert_eq!(outs[2].dims(), &[2, 576]);
    for g in [0, 2] {
        let (m, n) = (a[g].dims()[0], b[g].dims()[0]);
        let want = reference(
            &a[g].to_f32_vec().unwrap(),
            k,
            &b[g].to_f32_vec().unwrap(),
            k,
            m,
            n,
            k,
        );
        assert_close(&outs[g].to_f32_vec().unwrap(), &want, 1e-2);
    }
}

#[test]
fn grouped_list_empty_k_group_is_zero_under_in_pass() {
    let mut rng = StdRng::seed_from_u64(19);
    let a = vec![bf16(&mut rng, &[4, 512]), bf16(&mut rng, &[2, 0])];
    let b = vec![bf16(&mut rng, &[512, 512]), bf16(&mut rng, &[512, 0])];
    for zeroing in [ZeroingMode::PreZero, ZeroingMode::InPass] {
        let outs = Dispatcher::new(config(zeroing))
            .unwrap()
            .grouped_gemm_list(&a, &b, None)
            .unwrap();
        assert_eq!(outs[1].dims(), &[2, 512]);
        assert!(outs[1].to_f32_vec().unwrap().iter().all(|&v| v == 0.0), "{zeroing:?}");
        let want = reference(
            &a[0].to_f32_vec().unwrap(),
            512,
            &b[0].to_f32_vec().unwrap(),
            512,
            4,
            512,
            512,
        );
        assert_close(&outs[0].to_f32_vec().unwrap(), &want, 1e-2);
    }
}

// ============================================================================
// Properties
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn selection_is_total(
        op in prop::sample::select(Operator::ALL.to_vec()),
        m in 1usize..6000,
        n in 1usize..9000,
        k in 1usize..9000,
    ) {
        let d = dispatcher();
        let sel = d.select(op, &ProblemShape::new(m, n, k)).unwrap();
        prop_assert!(sel.kernel.supports(m, n, k), "{} cannot serve {m}x{n}x{k}", sel.kernel.name());
    }

    #[test]
    fn family_lookup_is_monotonic(m1 in 1usize..1000, m2 in 1usize..1000) {
        let catalog = KernelCatalog::bf16().unwrap();
        let names: Vec<String> = catalog.kernels()[..3].iter().map(|k| k.name().to_string()).collect();
        let spec = TableSpec::default().family(
            4096,
            4096,
            &[(16, names[0].as_str()), (64, names[1].as_str()), (256, names[2].as_str())],
        );
        let tables = ShapeTables::build(&spec, &catalog).unwrap();
        let rank = |m: usize| {
            let kernel = tables.lookup_family(&ProblemShape::new(m, 4096, 4096)).unwrap();
            names.iter().position(|n| n == kernel.name()).unwrap()
        };
        let (lo, hi) = if m1 <= m2 { (m1, m2) } else { (m2, m1) };
        prop_assert!(rank(lo) <= rank(hi));
    }
}
