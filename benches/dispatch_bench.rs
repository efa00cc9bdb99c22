//! Benchmark: selection latency, grouped argument building and dispatched
//! BF16 GEMM through the facade.

use std::time::Instant;

use tessel_core::{DType, Tensor};
use tessel_kernels::{GemmOperands, OperandView};
use tessel_dispatch::{
    build_args, DispatchConfig, Dispatcher, GroupLayout, Operator, ProblemShape, RaggedDim,
    ZeroingMode,
};

fn time_it(iters: usize, mut f: impl FnMut()) -> f64 {
    let start = Instant::now();
    for _ in 0..iters {
        f();
    }
    start.elapsed().as_secs_f64() / iters as f64
}

fn gflops(m: usize, n: usize, k: usize, secs: f64) -> f64 {
    (2.0 * m as f64 * n as f64 * k as f64) / secs / 1e9
}

fn operand(dims: &[usize], mul: usize, modulus: usize) -> Tensor {
    let len = dims.iter().product();
    let data: Vec<f32> = (0..len)
        .map(|i| ((i * mul + 3) % modulus) as f32 * 0.1 - 0.6)
        .collect();
    Tensor::from_f32_as(&data, dims, DType::BF16).unwrap()
}

fn main() {
    let dispatcher = Dispatcher::new(DispatchConfig {
        autotune: Some(false),
        ..Default::default()
    })
    .unwrap();

    println!("=== Tessel Selection Latency ===\n");
    println!("{:<24} {:>14} {:>16}", "Shape", "Stage", "Latency (ns)");
    println!("{}", "-".repeat(56));
    let shapes = [
        ProblemShape::new(128, 4096, 4096),
        ProblemShape::new(300, 4096, 4096),
        ProblemShape::new(77, 1024, 512),
        ProblemShape::new(64, 4095, 4096),
    ];
    for shape in shapes {
        let stage = dispatcher.select(Operator::Bf16, &shape).unwrap().stage;
        let secs = time_it(100_000, || {
            let _ = dispatcher.select(Operator::Bf16, &shape).unwrap();
        });
        println!("{:<24} {:>14} {:>16.1}", shape.to_string(), stage.to_string(), secs * 1e9);
    }

    println!("\n=== Grouped Argument Building ===\n");
    println!("{:<10} {:>16} {:>16}", "Groups", "Sequential (us)", "Parallel (us)");
    println!("{}", "-".repeat(44));
    for groups in [4, 16, 64, 256, 1024] {
        let sizes: Vec<usize> = (0..groups).map(|g| (g * 37) % 129).collect();
        let mut bounds = vec![0];
        for s in &sizes {
            bounds.push(bounds[bounds.len() - 1] + s);
        }
        let layout = GroupLayout::Ragged {
            dim: RaggedDim::M,
            extent: bounds[groups],
            bounds,
            m: 0,
            n: 4096,
            k: 4096,
        };
        let seq = time_it(200, || {
            let _ = build_args(&layout, ZeroingMode::InPass, usize::MAX).unwrap();
        });
        let par = time_it(200, || {
            let _ = build_args(&layout, ZeroingMode::InPass, 1).unwrap();
        });
        println!("{:<10} {:>16.2} {:>16.2}", groups, seq * 1e6, par * 1e6);
    }

    println!("\n=== Dispatched BF16 GEMM ===\n");
    println!("{:<16} {:>12} {:>10}  {}", "Size", "Time (ms)", "GF/s", "Kernel");
    println!("{}", "-".repeat(90));
    for (m, n, k) in [(16, 512, 512), (64, 512, 512), (128, 1024, 512), (256, 1024, 1024)] {
        let a = operand(&[m, k], 7, 13);
        let b = operand(&[n, k], 11, 17);
        let kernel = dispatcher
            .select(Operator::Bf16, &ProblemShape::new(m, n, k))
            .unwrap()
            .kernel
            .name()
            .to_string();
        let iters = if m <= 64 { 10 } else { 3 };
        let _ = dispatcher.gemm_bf16(&a, &b, None).unwrap();
        let secs = time_it(iters, || {
            let _ = dispatcher.gemm_bf16(&a, &b, None).unwrap();
        });
        println!(
            "{:<16} {:>10.3}ms {:>10.2}  {}",
            format!("{}x{}x{}", m, n, k),
            secs * 1000.0,
            gflops(m, n, k, secs),
            kernel
        );
    }

    println!("\n=== BF16 Catalog Kernels at 128x1024x512 ===\n");
    println!("{:>12} {:>10}  {}", "Time (ms)", "GF/s", "Kernel");
    println!("{}", "-".repeat(90));
    let (m, n, k) = (128, 1024, 512);
    let a = operand(&[m, k], 7, 13);
    let b = operand(&[n, k], 11, 17);
    let layout = GroupLayout::Fixed {
        groups: 1,
        m,
        n,
        k,
        valid_rows: None,
    };
    let args = build_args(&layout, ZeroingMode::PreZero, usize::MAX).unwrap();
    let ops = GemmOperands::new(
        OperandView::from_tensor(&a).unwrap(),
        OperandView::from_tensor(&b).unwrap(),
    );
    let mut out = vec![0.0f32; m * n];
    let mut timings: Vec<(f64, String)> = dispatcher
        .operator(Operator::Bf16)
        .catalog()
        .kernels()
        .iter()
        .filter(|kernel| kernel.supports(m, n, k))
        .map(|kernel| {
            let secs = time_it(3, || {
                kernel.launch(&ops, &args.buffer, &mut out).unwrap();
            });
            (secs, kernel.name().to_string())
        })
        .collect();
    timings.sort_by(|x, y| x.0.total_cmp(&y.0));
    for (secs, name) in timings {
        println!("{:>10.3}ms {:>10.2}  {}", secs * 1000.0, gflops(m, n, k, secs), name);
    }
}
