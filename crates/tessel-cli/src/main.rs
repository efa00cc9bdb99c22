use std::collections::BTreeMap;
use std::ops::Range;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::Parser;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::info;
use tracing_subscriber::EnvFilter;

use tessel_core::{DType, Tensor};
use tessel_dispatch::{
    build_args, DispatchConfig, Dispatcher, GroupLayout, Operator, ProblemShape, TuningCache,
    ZeroingMode,
};
use tessel_kernels::{GemmOperands, OperandView};

const BANNER: &str = r#"
 _____ _____ ____ ____  _____ _
|_   _| ____/ ___/ ___|| ____| |
  | | |  _| \___ \___ \|  _| | |
  | | | |___ ___) |__) | |___| |___
  |_| |_____|____/____/|_____|_____|"#;

#[derive(Parser)]
#[command(
    name = "tessel",
    about = "Tessel GEMM dispatch CLI",
    long_about = "Shape-driven kernel selection for FP8 and BF16 GEMM.\n\nInspect the kernel catalogs, see which kernel a shape resolves to, and\ntime dispatch end to end. Set TESSEL_LOG for tracing output.",
    version
)]
struct Cli {
    /// JSON dispatch configuration (defaults to the environment)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Problem dimensions shared by `select` and `bench`.
#[derive(clap::Args)]
struct ShapeArgs {
    /// fp8_rowwise, bf16, fp8_grouped or bf16_grouped
    #[arg(long, default_value = "bf16")]
    op: Operator,
    #[arg(long)]
    m: usize,
    #[arg(long)]
    n: usize,
    #[arg(long)]
    k: usize,
    /// Group count (grouped operators only)
    #[arg(long, default_value = "1")]
    groups: usize,
}

impl ShapeArgs {
    fn shape(&self) -> Result<ProblemShape> {
        if self.groups != 1 && !self.op.is_grouped() {
            bail!("--groups only applies to grouped operators, not {}", self.op);
        }
        Ok(ProblemShape::grouped(self.groups, self.m, self.n, self.k))
    }
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Show platform, SIMD and catalog summary
    Info,
    /// Resolve the kernel a shape dispatches to
    Select {
        #[command(flatten)]
        shape: ShapeArgs,
    },
    /// Time every candidate kernel and the dispatched call on random operands
    Bench {
        #[command(flatten)]
        shape: ShapeArgs,
        /// Timed iterations per kernel
        #[arg(long, default_value = "3")]
        iters: usize,
        /// Operand RNG seed
        #[arg(long, default_value = "0")]
        seed: u64,
    },
    /// Print the built-in tables as a TESSEL_TABLES file
    Tables {
        /// Restrict to one operator
        #[arg(long)]
        op: Option<Operator>,
    },
}

fn main() -> Result<()> {
    let filter = EnvFilter::try_from_env("TESSEL_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => DispatchConfig::from_json_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => DispatchConfig::from_env(),
    };

    match cli.command {
        Commands::Info => cmd_info(config),
        Commands::Select { shape } => cmd_select(config, &shape),
        Commands::Bench { shape, iters, seed } => cmd_bench(config, &shape, iters, seed),
        Commands::Tables { op } => cmd_tables(op),
    }
}

fn cmd_info(config: DispatchConfig) -> Result<()> {
    println!("{}", BANNER);
    println!("  v{}  GEMM kernel dispatch\n", env!("CARGO_PKG_VERSION"));

    println!("Platform");
    println!("  OS:   {}", std::env::consts::OS);
    println!("  Arch: {}", std::env::consts::ARCH);

    let simd = tessel_kernels::SimdCapability::detect();
    println!("\nSIMD (tier: {})", simd.best_tier());
    println!("  AVX2:    {}", if simd.avx2 { "[x]" } else { "[ ]" });
    println!("  AVX-512: {}", if simd.avx512f { "[x]" } else { "[ ]" });
    println!("  FMA:     {}", if simd.fma { "[x]" } else { "[ ]" });
    println!("  NEON:    {}", if simd.neon { "[x]" } else { "[ ]" });

    println!("\nDispatch");
    println!("  autotune:  {}", config.autotune_enabled());
    println!("  zeroing:   {:?}", config.zeroing);
    let tables = match &config.tables_path {
        Some(path) => path.display().to_string(),
        None => "built-in".to_string(),
    };
    println!("  tables:    {}", tables);

    let dispatcher = Dispatcher::new(config)?;
    println!("\nCatalogs");
    println!(
        "  {:<14} {:>8} {:>6} {:>9} {:>7}  {}",
        "operator", "kernels", "vec", "min tile", "tables", "safe kernel"
    );
    for op in Operator::ALL {
        let od = dispatcher.operator(op);
        let catalog = od.catalog();
        println!(
            "  {:<14} {:>8} {:>6} {:>9} {:>7}  {}",
            op.name(),
            catalog.len(),
            catalog.vector_width(),
            catalog.min_tile().map_or("-".to_string(), |t| t.to_string()),
            od.tables().len(),
            catalog.safe_kernel().name(),
        );
    }
    Ok(())
}

fn cmd_select(config: DispatchConfig, args: &ShapeArgs) -> Result<()> {
    let shape = args.shape()?;
    let dispatcher = Dispatcher::new(config)?;
    let sel = dispatcher.select(args.op, &shape)?;
    println!("operator: {}", args.op);
    println!("shape:    {}", shape);
    println!("stage:    {}", sel.stage);
    println!("kernel:   {}", sel.kernel.name());
    Ok(())
}

fn cmd_bench(config: DispatchConfig, args: &ShapeArgs, iters: usize, seed: u64) -> Result<()> {
    let op = args.op;
    let shape = args.shape()?;
    if shape.has_zero_dim() {
        bail!("bench needs positive dimensions, got {shape}");
    }
    let (g, m, n, k) = (shape.groups, shape.m, shape.n, shape.k);

    let mut dispatcher = Dispatcher::new(config.clone())?;
    if config.autotune_enabled() {
        dispatcher = dispatcher.with_tuning(Arc::new(TuningCache::from_config(&config)));
    }

    let mut rng = StdRng::seed_from_u64(seed);
    let dtype = if op.is_fp8() { DType::F8E4M3 } else { DType::BF16 };
    let (a_dims, b_dims) = if op.is_grouped() {
        (vec![g, m, k], vec![g, n, k])
    } else {
        (vec![m, k], vec![n, k])
    };
    let a = random(&mut rng, &a_dims, dtype, -1.0..1.0)?;
    let b = random(&mut rng, &b_dims, dtype, -1.0..1.0)?;
    let a_scale = random(&mut rng, &[g * m], DType::F32, 0.5..1.5)?;
    let b_scale = random(&mut rng, &[g * n], DType::F32, 0.5..1.5)?;

    let layout = GroupLayout::Fixed {
        groups: g,
        m,
        n,
        k,
        valid_rows: None,
    };
    let args = build_args(&layout, ZeroingMode::PreZero, usize::MAX)?;
    let mut ops = GemmOperands::new(OperandView::from_tensor(&a)?, OperandView::from_tensor(&b)?);
    if op.is_fp8() {
        ops = ops.with_scales(a_scale.as_slice()?, b_scale.as_slice()?);
    }

    let iters = iters.max(1);
    let flops = 2.0 * g as f64 * m as f64 * n as f64 * k as f64;
    let selected = dispatcher.select(op, &shape)?;
    println!("=== Tessel {} Benchmark: {} ===", op, shape);
    println!("SIMD: {}", tessel_kernels::SimdCapability::detect().best_tier());
    println!("Selected: {} ({})\n", selected.kernel.name(), selected.stage);

    let mut out = vec![0.0f32; g * m * n];
    let mut timings = Vec::new();
    for kernel in dispatcher.operator(op).catalog().kernels() {
        if !kernel.supports(m, n, k) {
            continue;
        }
        let secs = time_it(iters, || {
            out.fill(0.0);
            kernel.launch(&ops, &args.buffer, &mut out)
        })?;
        timings.push((secs, kernel.name().to_string()));
    }
    timings.sort_by(|x, y| x.0.total_cmp(&y.0));

    println!("{:>12} {:>10}  {}", "Time (ms)", "GFLOP/s", "Kernel");
    println!("{}", "-".repeat(96));
    for (secs, name) in &timings {
        let mark = if *name == selected.kernel.name() { "*" } else { " " };
        println!("{:>10.3}ms {:>10.2} {}{}", secs * 1000.0, flops / secs / 1e9, mark, name);
    }

    let dispatched = time_it(iters, || -> Result<()> {
        match op {
            Operator::Bf16 => dispatcher.gemm_bf16(&a, &b, None)?,
            Operator::Fp8Rowwise => {
                dispatcher.f8f8bf16_rowwise(&a, &b, &a_scale, &b_scale, None, None)?
            }
            Operator::Bf16Grouped => dispatcher.grouped_gemm_batched(&a, &b, None, None, None)?,
            Operator::Fp8Grouped => dispatcher.grouped_gemm_batched(
                &a,
                &b,
                None,
                Some((&a_scale, &b_scale)),
                None,
            )?,
        };
        Ok(())
    })?;
    info!(shape = %shape, candidates = timings.len(), "bench done");
    println!(
        "\nDispatched call: {:.3}ms ({:.2} GFLOP/s)",
        dispatched * 1000.0,
        flops / dispatched / 1e9
    );
    Ok(())
}

fn cmd_tables(op: Option<Operator>) -> Result<()> {
    let ops: Vec<Operator> = match op {
        Some(op) => vec![op],
        None => Operator::ALL.to_vec(),
    };
    let file: BTreeMap<&str, _> = ops.iter().map(|op| (op.name(), op.preset_tables())).collect();
    println!("{}", serde_json::to_string_pretty(&file)?);
    Ok(())
}

/// Mean seconds per call after one warm-up call.
fn time_it<E>(
    iters: usize,
    mut f: impl FnMut() -> std::result::Result<(), E>,
) -> std::result::Result<f64, E> {
    f()?;
    let start = Instant::now();
    for _ in 0..iters {
        f()?;
    }
    Ok(start.elapsed().as_secs_f64() / iters as f64)
}

fn random(rng: &mut StdRng, dims: &[usize], dtype: DType, range: Range<f32>) -> Result<Tensor> {
    let len = dims.iter().product();
    let data: Vec<f32> = (0..len).map(|_| rng.gen_range(range.clone())).collect();
    Ok(Tensor::from_f32_as(&data, dims, dtype)?)
}
