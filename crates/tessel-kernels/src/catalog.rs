//! Immutable registries of kernel variants.
//!
//! A catalog owns the kernels one operator family can launch, in a fixed
//! order (ties during tuning resolve to the earlier entry), plus the
//! catalog-wide facts selection relies on: the preferred vector width and the
//! maximally-safe kernel used when a shape breaks that width.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::config::PaddingMode;
use crate::error::{KernelError, Result};
use crate::kernel::{Epilogue, GemmKernel, TiledGemmKernel};

/// Minimum N/K tile of the grouped catalogs.
pub const GROUPED_MIN_TILE: usize = 512;

/// Kernel registry for one operator family.
#[derive(Debug, Clone)]
pub struct KernelCatalog {
    name: String,
    kernels: Vec<Arc<dyn GemmKernel>>,
    index: HashMap<String, usize>,
    vector_width: usize,
    min_tile: Option<usize>,
    safe_kernel: usize,
}

/// Collects kernels and checks catalog invariants on `build`.
#[derive(Debug)]
pub struct CatalogBuilder {
    name: String,
    kernels: Vec<Arc<dyn GemmKernel>>,
    vector_width: usize,
    min_tile: Option<usize>,
    safe_kernel: Option<String>,
}

impl CatalogBuilder {
    pub fn kernel(mut self, kernel: Arc<dyn GemmKernel>) -> Self {
        self.kernels.push(kernel);
        self
    }

    /// Declare the smallest N/K the catalog can serve.
    pub fn min_tile(mut self, min_tile: usize) -> Self {
        self.min_tile = Some(min_tile);
        self
    }

    /// Name the kernel the heuristic routes misaligned shapes to. It must
    /// accept every positive shape (vector width 1, full padding, no split-K).
    pub fn safe_kernel(mut self, name: &str) -> Self {
        self.safe_kernel = Some(name.to_string());
        self
    }

    pub fn build(self) -> Result<KernelCatalog> {
        let mut index = HashMap::with_capacity(self.kernels.len());
        for (i, k) in self.kernels.iter().enumerate() {
            if index.insert(k.name().to_string(), i).is_some() {
                return Err(KernelError::DuplicateKernel(k.name().to_string()));
            }
        }

        let invalid = |reason: String| KernelError::InvalidConfig {
            name: self.name.clone(),
            reason,
        };
        let safe_name = self
            .safe_kernel
            .as_deref()
            .ok_or_else(|| invalid("no safe kernel declared".into()))?;
        let safe_kernel = *index
            .get(safe_name)
            .ok_or_else(|| invalid(format!("safe kernel '{safe_name}' is not registered")))?;
        let safe_cfg = self.kernels[safe_kernel].config();
        if safe_cfg.vector_width != 1 || safe_cfg.padding != PaddingMode::MNK || safe_cfg.k_batch != 1
        {
            return Err(invalid(format!("safe kernel '{safe_name}' does not accept every shape")));
        }

        debug!(catalog = %self.name, kernels = self.kernels.len(), "catalog built");
        Ok(KernelCatalog {
            name: self.name,
            kernels: self.kernels,
            index,
            vector_width: self.vector_width,
            min_tile: self.min_tile,
            safe_kernel,
        })
    }
}

impl KernelCatalog {
    pub fn builder(name: &str, vector_width: usize) -> CatalogBuilder {
        CatalogBuilder {
            name: name.to_string(),
            kernels: Vec::new(),
            vector_width,
            min_tile: None,
            safe_kernel: None,
        }
    }

    /// Build a catalog of reference kernels from configuration names.
    pub fn from_configs(
        prefix: &str,
        configs: &[&str],
        vector_width: usize,
        epilogue: Epilogue,
        safe_config: &str,
        min_tile: Option<usize>,
    ) -> Result<Self> {
        let mut builder = Self::builder(prefix, vector_width);
        for cfg in configs {
            let kernel = TiledGemmKernel::from_name(&format!("{prefix}_{cfg}"), epilogue)?;
            builder = builder.kernel(Arc::new(kernel));
        }
        if let Some(min) = min_tile {
            builder = builder.min_tile(min);
        }
        builder.safe_kernel(&format!("{prefix}_{safe_config}")).build()
    }

    /// FP8 (e4m3) × FP8 → BF16 GEMM with rowwise scaling.
    pub fn fp8_rowwise() -> Result<Self> {
        Self::from_configs(
            "fp8fp8bf16_rowwise",
            FP8_ROWWISE_CONFIGS,
            16,
            Epilogue::RowwiseScale,
            FP8_SAFE_CONFIG,
            None,
        )
    }

    /// BF16 × BF16 → BF16 GEMM.
    pub fn bf16() -> Result<Self> {
        Self::from_configs("bf16bf16bf16", BF16_CONFIGS, 8, Epilogue::Plain, BF16_SAFE_CONFIG, None)
    }

    /// Grouped FP8 rowwise GEMM.
    pub fn fp8_grouped() -> Result<Self> {
        Self::from_configs(
            "fp8fp8bf16_grouped",
            FP8_GROUPED_CONFIGS,
            16,
            Epilogue::RowwiseScale,
            FP8_SAFE_CONFIG,
            Some(GROUPED_MIN_TILE),
        )
    }

    /// Grouped BF16 GEMM.
    pub fn bf16_grouped() -> Result<Self> {
        Self::from_configs(
            "bf16bf16bf16_grouped",
            BF16_GROUPED_CONFIGS,
            8,
            Epilogue::Plain,
            BF16_SAFE_CONFIG,
            Some(GROUPED_MIN_TILE),
        )
    }

    /// Rebuild with every kernel replaced by `f(kernel)`, keeping order and
    /// catalog facts. Used to instrument a catalog.
    pub fn map_kernels<F>(&self, f: F) -> Result<Self>
    where
        F: Fn(&Arc<dyn GemmKernel>) -> Arc<dyn GemmKernel>,
    {
        let mut builder = Self::builder(&self.name, self.vector_width)
            .safe_kernel(self.safe_kernel().name());
        builder.min_tile = self.min_tile;
        for k in &self.kernels {
            builder = builder.kernel(f(k));
        }
        builder.build()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn vector_width(&self) -> usize {
        self.vector_width
    }

    pub fn min_tile(&self) -> Option<usize> {
        self.min_tile
    }

    pub fn len(&self) -> usize {
        self.kernels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kernels.is_empty()
    }

    /// Kernels in catalog order.
    pub fn kernels(&self) -> &[Arc<dyn GemmKernel>] {
        &self.kernels
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn GemmKernel>> {
        self.index.get(name).map(|&i| &self.kernels[i])
    }

    /// Look up by full name, or by the name without the catalog prefix.
    pub fn resolve(&self, name: &str) -> Option<&Arc<dyn GemmKernel>> {
        self.get(name)
            .or_else(|| self.get(&format!("{}_{name}", self.name)))
    }

    /// Catalog order of a kernel.
    pub fn position(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    pub fn safe_kernel(&self) -> &Arc<dyn GemmKernel> {
        &self.kernels[self.safe_kernel]
    }
}

// =============================================================================
// Built-in catalog manifests
// =============================================================================

const FP8_SAFE_CONFIG: &str = "64x16x16x128_16x16_1x1_vec1_interwave_v1";
const BF16_SAFE_CONFIG: &str = "64x16x16x64_16x16_1x1_vec1_interwave_v1";

const FP8_ROWWISE_CONFIGS: &[&str] = &[
    FP8_SAFE_CONFIG,
    // Tiny tile kernels for small shapes
    "64x16x16x128_16x16_1x1_vec16_interwave_v1",
    "64x16x16x256_16x16_1x1_vec16_intrawave_v1",
    "128x16x32x128_16x16_1x1_vec16_intrawave_v2",
    "128x16x32x128_16x16_1x1_vec16_interwave_v2_4",
    "128x16x32x512_16x16_1x1_vec16_interwave_v2",
    "128x32x16x128_16x16_1x1_vec16_interwave_v2",
    "128x32x64x128_32x32_1x1_vec16_interwave_v2",
    // Balanced
    "256x32x128x256_32x32_1x1_vec16_intrawave_v3",
    "256x64x128x128_32x32_1x2_vec16_intrawave_v3",
    "256x128x128x128_32x32_2x2_vec16_intrawave_v3",
    "256x128x128x128_32x32_2x2_vec16_intrawave_v5",
    "256x128x256x128_32x32_2x4_vec16_intrawave_v3",
    // Compute bound
    "256x256x128x128_32x32_4x2_vec16_intrawave_v3",
    "256x256x256x128_16x16_8x8_vec16_intrawave_v3",
    "256x256x256x128_16x16_8x8_vec16_intrawave_v3_nopad",
    "256x256x256x64_32x32_4x4_vec16_intrawave_v4",
];

const BF16_CONFIGS: &[&str] = &[
    BF16_SAFE_CONFIG,
    "64x16x16x64_16x16_1x1_vec8_interwave_v1",
    "128x16x32x64_16x16_1x1_vec8_intrawave_v2",
    "128x16x32x64_16x16_1x1_vec8_interwave_v2_4",
    "128x32x64x64_32x32_1x1_vec8_interwave_v2",
    "256x64x128x64_32x32_1x2_vec8_intrawave_v3",
    "256x128x128x64_32x32_2x2_vec8_intrawave_v3",
    "256x128x256x64_32x32_2x4_vec8_intrawave_v3",
    "256x256x256x64_32x32_4x4_vec8_intrawave_v4",
    "256x256x256x64_32x32_4x4_vec8_intrawave_v4_nopad",
];

const FP8_GROUPED_CONFIGS: &[&str] = &[
    FP8_SAFE_CONFIG,
    "128x16x32x128_16x16_1x1_vec16_interwave_v2",
    "128x32x64x128_32x32_1x1_vec16_interwave_v2",
    "256x64x128x128_32x32_1x2_vec16_intrawave_v3",
    "256x128x128x128_32x32_2x2_vec16_intrawave_v3",
    "256x256x256x128_16x16_8x8_vec16_intrawave_v3",
];

const BF16_GROUPED_CONFIGS: &[&str] = &[
    BF16_SAFE_CONFIG,
    "128x16x32x64_16x16_1x1_vec8_interwave_v2",
    "128x32x64x64_32x32_1x1_vec8_interwave_v2",
    "256x64x128x64_32x32_1x2_vec8_intrawave_v3",
    "256x128x128x64_32x32_2x2_vec8_intrawave_v3",
    "256x256x256x64_32x32_4x4_vec8_intrawave_v4",
];
